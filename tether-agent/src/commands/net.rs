//! Network introspection commands: ss, ip_addr, ip_route.
//!
//! Everything here is assembled from /proc, /sys, and a handful of
//! interface ioctls, since the target device may ship no networking
//! userland at all.

use std::collections::HashMap;
use std::fs;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use log::debug;
use tether_proto::{Result, Writer};

use crate::session::Session;

/// Kernel TCP states, indexed by the `st` column of /proc/net/tcp.
const TCP_STATES: &[&str] = &[
    "UNKNOWN",
    "ESTABLISHED",
    "SYN_SENT",
    "SYN_RECV",
    "FIN_WAIT1",
    "FIN_WAIT2",
    "TIME_WAIT",
    "CLOSE",
    "CLOSE_WAIT",
    "LAST_ACK",
    "LISTEN",
    "CLOSING",
];

struct SockInfo {
    proto: &'static str,
    local_addr: String,
    local_port: u16,
    remote_addr: String,
    remote_port: u16,
    state: String,
    pid: u64,
    process: String,
}

/// `ss {}` — socket table with owning processes.
pub fn ss(sess: &mut Session, id: u32) -> Result<()> {
    // Permissions may hide other processes' fds; whatever resolves, resolves.
    let inodes = socket_inode_map();

    let mut conns = Vec::new();
    parse_net_file("/proc/net/tcp", "tcp", true, false, &inodes, &mut conns);
    parse_net_file("/proc/net/tcp6", "tcp6", true, true, &inodes, &mut conns);
    parse_net_file("/proc/net/udp", "udp", false, false, &inodes, &mut conns);
    parse_net_file("/proc/net/udp6", "udp6", false, true, &inodes, &mut conns);

    debug!("ss: found {} connections", conns.len());

    let mut w = Writer::with_capacity(4096);
    w.put_map(1);
    w.put_str("connections");
    w.put_array(conns.len());
    for c in &conns {
        w.put_map(8);
        w.put_str("proto");
        w.put_str(c.proto);
        w.put_str("local_addr");
        w.put_str(&c.local_addr);
        w.put_str("local_port");
        w.put_uint(u64::from(c.local_port));
        w.put_str("remote_addr");
        w.put_str(&c.remote_addr);
        w.put_str("remote_port");
        w.put_uint(u64::from(c.remote_port));
        w.put_str("state");
        w.put_str(&c.state);
        w.put_str("pid");
        w.put_uint(c.pid);
        w.put_str("process");
        w.put_str(&c.process);
    }
    sess.send_ok(id, w.as_bytes())
}

/// Maps socket inodes to (pid, comm) by scanning /proc/[pid]/fd links.
fn socket_inode_map() -> HashMap<u64, (u64, String)> {
    let mut map = HashMap::new();
    let Ok(proc_dir) = fs::read_dir("/proc") else {
        return map;
    };

    for dent in proc_dir.flatten() {
        let name = dent.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u64>().ok()) else {
            continue;
        };
        let comm = fs::read_to_string(format!("/proc/{pid}/comm"))
            .map(|s| s.trim_end().to_owned())
            .unwrap_or_default();

        let Ok(fd_dir) = fs::read_dir(format!("/proc/{pid}/fd")) else {
            continue;
        };
        for fd in fd_dir.flatten() {
            let Ok(target) = fs::read_link(fd.path()) else {
                continue;
            };
            let target = target.to_string_lossy().into_owned();
            if let Some(inode) = target
                .strip_prefix("socket:[")
                .and_then(|s| s.strip_suffix(']'))
                .and_then(|s| s.parse::<u64>().ok())
            {
                map.entry(inode).or_insert_with(|| (pid, comm.clone()));
            }
        }
    }
    map
}

/// Parses one /proc/net table into `out`. Missing files are skipped.
fn parse_net_file(
    path: &str,
    proto: &'static str,
    is_tcp: bool,
    is_ipv6: bool,
    inodes: &HashMap<u64, (u64, String)>,
    out: &mut Vec<SockInfo>,
) {
    let Ok(content) = fs::read_to_string(path) else {
        return;
    };

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // sl local rem st tx:rx tr:when retrnsmt uid timeout inode ...
        if fields.len() < 10 {
            continue;
        }
        let Some((local_addr, local_port)) = parse_net_addr(fields[1], is_ipv6) else {
            continue;
        };
        let Some((remote_addr, remote_port)) = parse_net_addr(fields[2], is_ipv6) else {
            continue;
        };
        let Some(state_code) = u8::from_str_radix(fields[3], 16).ok() else {
            continue;
        };
        let inode: u64 = fields[9].parse().unwrap_or(0);

        let state = if is_tcp {
            TCP_STATES
                .get(usize::from(state_code))
                .copied()
                .unwrap_or("UNKNOWN")
                .to_owned()
        } else {
            "-".to_owned()
        };

        let (pid, process) = inodes
            .get(&inode)
            .cloned()
            .unwrap_or((0, String::new()));

        out.push(SockInfo {
            proto,
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            state,
            pid,
            process,
        });
    }
}

/// Decodes a `HEXADDR:HEXPORT` column from a /proc/net table.
fn parse_net_addr(field: &str, is_ipv6: bool) -> Option<(String, u16)> {
    let (addr_hex, port_hex) = field.rsplit_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let addr = if is_ipv6 {
        parse_hex_ipv6(addr_hex)?
    } else {
        parse_hex_ipv4(addr_hex)?
    };
    Some((addr, port))
}

/// The kernel prints IPv4 addresses as one host-endian hex word.
fn parse_hex_ipv4(hex: &str) -> Option<String> {
    let word = u32::from_str_radix(hex, 16).ok()?;
    let b = word.to_le_bytes();
    Some(Ipv4Addr::new(b[0], b[1], b[2], b[3]).to_string())
}

/// IPv6 is printed as four 32-bit host-endian hex words.
fn parse_hex_ipv6(hex: &str) -> Option<String> {
    if hex.len() != 32 {
        return None;
    }
    let mut words = [0u32; 4];
    for (i, w) in words.iter_mut().enumerate() {
        *w = u32::from_str_radix(&hex[i * 8..(i + 1) * 8], 16).ok()?;
    }
    let [a, b, c, d] = words;

    if a == 0 && b == 0 && c == 0x0000_ffff {
        let v4 = d.to_le_bytes();
        return Some(format!("::ffff:{}.{}.{}.{}", v4[0], v4[1], v4[2], v4[3]));
    }
    if a == 0 && b == 0 && c == 0 && d == 0 {
        return Some("::".to_owned());
    }
    Some(format!(
        "{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}",
        (a >> 16) & 0xffff,
        a & 0xffff,
        (b >> 16) & 0xffff,
        b & 0xffff,
        (c >> 16) & 0xffff,
        c & 0xffff,
        (d >> 16) & 0xffff,
        d & 0xffff,
    ))
}

/// `ip_addr {}` — interface summary rendered as `ip addr`-style text.
pub fn ip_addr(sess: &mut Session, id: u32) -> Result<()> {
    let dir = match fs::read_dir("/sys/class/net") {
        Ok(d) => d,
        Err(_) => return sess.send_err(id, "cannot read network interfaces"),
    };

    let mut output = String::new();
    for dent in dir.flatten() {
        let name = dent.file_name();
        let Some(ifname) = name.to_str() else {
            continue;
        };
        if ifname.starts_with('.') {
            continue;
        }

        let mac = sysfs_line(&format!("/sys/class/net/{ifname}/address"));
        let operstate = sysfs_line(&format!("/sys/class/net/{ifname}/operstate"));
        let iface = IfaceIoctl::open(ifname);

        let flags = iface.as_ref().map_or(0, IfaceIoctl::flags);
        let mtu = iface.as_ref().map_or(0, IfaceIoctl::mtu);
        let ipv4 = iface.as_ref().and_then(IfaceIoctl::ipv4);
        let netmask = iface.as_ref().and_then(IfaceIoctl::netmask);

        output.push_str(&format!(
            "{ifname}: <{}> mtu {mtu} state {operstate}\n",
            flag_names(flags)
        ));
        if !mac.is_empty() && mac != "00:00:00:00:00:00" {
            output.push_str(&format!("    link/ether {mac}\n"));
        }
        if let Some(addr) = ipv4 {
            let cidr = netmask.map_or(0, |m| u32::from(m).leading_ones());
            output.push_str(&format!("    inet {addr}/{cidr}\n"));
        }
    }

    let mut w = Writer::with_capacity(output.len() + 64);
    w.put_map(1);
    w.put_str("content");
    w.put_bin(output.as_bytes());
    sess.send_ok(id, w.as_bytes())
}

/// `ip_route {}` — IPv4 routing table from /proc/net/route.
pub fn ip_route(sess: &mut Session, id: u32) -> Result<()> {
    const RTF_UP: u32 = 0x0001;

    let content = match fs::read_to_string("/proc/net/route") {
        Ok(c) => c,
        Err(_) => return sess.send_err(id, "cannot read routing table"),
    };

    let mut output = String::new();
    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // iface dest gateway flags refcnt use metric mask ...
        if fields.len() < 8 {
            continue;
        }
        let iface = fields[0];
        let Ok(dest) = u32::from_str_radix(fields[1], 16) else {
            continue;
        };
        let Ok(gateway) = u32::from_str_radix(fields[2], 16) else {
            continue;
        };
        let Ok(flags) = u32::from_str_radix(fields[3], 16) else {
            continue;
        };
        let metric: u32 = fields[6].parse().unwrap_or(0);
        let Ok(mask) = u32::from_str_radix(fields[7], 16) else {
            continue;
        };

        if flags & RTF_UP == 0 {
            continue;
        }

        // Route words are stored in network order, printed host-endian.
        let dest_addr = Ipv4Addr::from(dest.to_le_bytes());
        let gw_addr = Ipv4Addr::from(gateway.to_le_bytes());
        let cidr = u32::from(Ipv4Addr::from(mask.to_le_bytes())).leading_ones();

        if dest == 0 {
            output.push_str(&format!("default via {gw_addr} dev {iface}"));
        } else {
            output.push_str(&format!("{dest_addr}/{cidr}"));
            if gateway != 0 {
                output.push_str(&format!(" via {gw_addr}"));
            }
            output.push_str(&format!(" dev {iface}"));
        }
        if metric > 0 {
            output.push_str(&format!(" metric {metric}"));
        }
        output.push('\n');
    }

    if output.is_empty() {
        output.push_str("(no routes)\n");
    }

    let mut w = Writer::with_capacity(output.len() + 64);
    w.put_map(1);
    w.put_str("content");
    w.put_bin(output.as_bytes());
    sess.send_ok(id, w.as_bytes())
}

fn sysfs_line(path: &str) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim_end().to_owned())
        .unwrap_or_default()
}

fn flag_names(flags: i16) -> String {
    let flags = flags as i32;
    let mut names = Vec::new();
    if flags & libc::IFF_UP != 0 {
        names.push("UP");
    }
    if flags & libc::IFF_BROADCAST != 0 {
        names.push("BROADCAST");
    }
    if flags & libc::IFF_LOOPBACK != 0 {
        names.push("LOOPBACK");
    }
    if flags & libc::IFF_RUNNING != 0 {
        names.push("RUNNING");
    }
    if flags & libc::IFF_MULTICAST != 0 {
        names.push("MULTICAST");
    }
    names.join(",")
}

/// One AF_INET ioctl socket scoped to a single interface's queries.
struct IfaceIoctl {
    sock: OwnedFd,
    name: [libc::c_char; libc::IFNAMSIZ],
}

impl IfaceIoctl {
    fn open(ifname: &str) -> Option<Self> {
        if ifname.len() >= libc::IFNAMSIZ {
            return None;
        }
        // SAFETY: plain socket creation; ownership is taken immediately.
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return None;
        }
        // SAFETY: fd was just returned open by socket(2).
        let sock = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut name = [0 as libc::c_char; libc::IFNAMSIZ];
        for (dst, src) in name.iter_mut().zip(ifname.bytes()) {
            *dst = src as libc::c_char;
        }
        Some(Self { sock, name })
    }

    fn request(&self, req: libc::c_ulong) -> Option<libc::ifreq> {
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        ifr.ifr_name = self.name;
        // SAFETY: ifr is a properly initialized ifreq and req is one of the
        // SIOCGIF* read-only requests.
        let ret = unsafe { libc::ioctl(self.sock.as_raw_fd(), req as _, &mut ifr) };
        if ret == 0 {
            Some(ifr)
        } else {
            None
        }
    }

    fn flags(&self) -> i16 {
        self.request(libc::SIOCGIFFLAGS as libc::c_ulong)
            // SAFETY: SIOCGIFFLAGS fills the ifru_flags union member.
            .map_or(0, |ifr| unsafe { ifr.ifr_ifru.ifru_flags })
    }

    fn mtu(&self) -> i32 {
        self.request(libc::SIOCGIFMTU as libc::c_ulong)
            // SAFETY: SIOCGIFMTU fills the ifru_mtu union member.
            .map_or(0, |ifr| unsafe { ifr.ifr_ifru.ifru_mtu })
    }

    fn ipv4(&self) -> Option<Ipv4Addr> {
        self.request(libc::SIOCGIFADDR as libc::c_ulong)
            .and_then(|ifr| sockaddr_ipv4(unsafe { &ifr.ifr_ifru.ifru_addr }))
    }

    fn netmask(&self) -> Option<Ipv4Addr> {
        self.request(libc::SIOCGIFNETMASK as libc::c_ulong)
            .and_then(|ifr| sockaddr_ipv4(unsafe { &ifr.ifr_ifru.ifru_netmask }))
    }
}

fn sockaddr_ipv4(sa: &libc::sockaddr) -> Option<Ipv4Addr> {
    if i32::from(sa.sa_family) != libc::AF_INET {
        return None;
    }
    // SAFETY: sa_family was just checked, so this is a sockaddr_in.
    let sin = unsafe { &*std::ptr::from_ref(sa).cast::<libc::sockaddr_in>() };
    Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)))
}
