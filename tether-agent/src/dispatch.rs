//! Opcode routing: one handler per command in the closed set.

use tether_proto::Result;

use crate::commands::{exec, fs, net, sysinfo, transfer};
use crate::session::Session;

/// Routes one request to its handler.
///
/// Matching is case-sensitive over the closed opcode set; anything else is
/// answered with an `unknown command` error Response. Handlers report their
/// own failures as error Responses — an `Err` from here means the session
/// itself is broken (send failure, stream violation) and must close.
pub fn handle(sess: &mut Session, id: u32, cmd: &str, args: &[u8]) -> Result<()> {
    match cmd {
        "ls" => fs::ls(sess, id, args),
        "pwd" => fs::pwd(sess, id),
        "cd" => fs::cd(sess, id, args),
        "realpath" => fs::realpath(sess, id, args),
        "cat" => fs::cat(sess, id, args),

        "pull" => transfer::pull(sess, id, args),
        "push" => transfer::push(sess, id, args),

        "rm" => fs::rm(sess, id, args),
        "mv" => fs::mv(sess, id, args),
        "cp" => fs::cp(sess, id, args),
        "mkdir" => fs::mkdir(sess, id, args),
        "chmod" => fs::chmod(sess, id, args),

        "exec" => exec::exec(sess, id, args),
        "reboot" => exec::reboot(sess, id),
        "kill-agent" => exec::kill_agent(sess, id),

        "uname" => sysinfo::uname(sess, id),
        "whoami" => sysinfo::whoami(sess, id),
        "ps" => sysinfo::ps(sess, id),
        "dmesg" => sysinfo::dmesg(sess, id),
        "cpuinfo" => sysinfo::cpuinfo(sess, id),
        "mtd" => sysinfo::mtd(sess, id),
        "strings" => sysinfo::strings(sess, id, args),

        "ss" => net::ss(sess, id),
        "ip_addr" => net::ip_addr(sess, id),
        "ip_route" => net::ip_route(sess, id),

        _ => sess.send_err(id, "unknown command"),
    }
}
