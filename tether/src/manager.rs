//! Multi-device session management: connect, monitor, reconnect.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::Result;
use crate::session::Session;

/// TCP connect timeout for outbound (bind-mode) connections.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle time after which the monitor probes the session with `pwd`.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How often the monitor thread wakes to check idleness and shutdown.
const MONITOR_TICK: Duration = Duration::from_millis(500);

/// Lifecycle of a tracked device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Connecting,
    Connected,
    Disconnected,
}

/// Identity gathered right after the handshake.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub hostname: String,
    pub kernel: String,
    pub arch: String,
    pub os: String,
    pub user: String,
    pub cwd: String,
}

/// One known device, connected or not.
#[derive(Debug)]
pub struct Device {
    id: String,
    addr: SocketAddr,
    state: Mutex<DeviceState>,
    info: Mutex<DeviceInfo>,
    session: Mutex<Option<Arc<Session>>>,
}

impl Device {
    /// Stable identifier within this manager.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Peer address, used for reconnection.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of the device identity.
    pub fn info(&self) -> DeviceInfo {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The live session, when connected.
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_state(&self, state: DeviceState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn set_session(&self, session: Option<Arc<Session>>) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = session;
    }

    /// Demotes the device to Disconnected and tears the session down.
    fn drop_session(&self) {
        if let Some(session) = self.session() {
            session.close();
        }
        self.set_session(None);
        self.set_state(DeviceState::Disconnected);
    }
}

/// Device inventory plus per-device liveness monitoring.
///
/// Sessions are probed with a `pwd` heartbeat after
/// [`HEARTBEAT_INTERVAL`] of idleness; a failed probe demotes the device
/// to Disconnected but keeps it in the inventory for reconnection.
pub struct Manager {
    devices: Mutex<HashMap<String, Arc<Device>>>,
    next_id: AtomicU64,
    shutdown: Arc<AtomicBool>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Dials an agent in bind mode and adds it to the inventory.
    pub fn connect(&self, addr: SocketAddr) -> Result<Arc<Device>> {
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        let session = Session::establish(stream, true)?;
        self.adopt(addr, session)
    }

    /// Adopts a connection accepted from a dialing agent (reverse mode).
    pub fn adopt_incoming(&self, stream: TcpStream) -> Result<Arc<Device>> {
        let addr = stream.peer_addr()?;
        let session = Session::establish(stream, false)?;
        self.adopt(addr, session)
    }

    /// Starts a reverse-mode accept loop on `addr`.
    ///
    /// Returns the bound address; the loop runs on its own thread until
    /// [`Manager::stop`]. Uses a nonblocking listener so shutdown does not
    /// hang in accept(2).
    pub fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        info!("listening for agents on {local}");

        let manager = Arc::clone(self);
        thread::spawn(move || loop {
            if manager.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!("incoming agent connection from {peer}");
                    if stream.set_nonblocking(false).is_err() {
                        continue;
                    }
                    if let Err(e) = manager.adopt_incoming(stream) {
                        warn!("failed to adopt {peer}: {e}");
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(MONITOR_TICK);
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    thread::sleep(MONITOR_TICK);
                }
            }
        });
        Ok(local)
    }

    /// Reconnects a disconnected device at its recorded address.
    pub fn reconnect(&self, id: &str) -> Result<Arc<Device>> {
        let device = self
            .get(id)
            .ok_or_else(|| crate::Error::Command(format!("device not found: {id}")))?;
        if device.state() != DeviceState::Disconnected {
            return Err(crate::Error::Command("device is not disconnected".into()));
        }

        device.set_state(DeviceState::Connecting);
        let stream = match TcpStream::connect_timeout(&device.addr(), CONNECT_TIMEOUT) {
            Ok(s) => s,
            Err(e) => {
                device.set_state(DeviceState::Disconnected);
                return Err(e.into());
            }
        };
        let session = match Session::establish(stream, true) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                device.set_state(DeviceState::Disconnected);
                return Err(e);
            }
        };

        match initialize(&session) {
            Ok(info) => *device.info.lock().unwrap_or_else(|e| e.into_inner()) = info,
            Err(e) => {
                device.set_state(DeviceState::Disconnected);
                return Err(e);
            }
        }
        device.set_session(Some(Arc::clone(&session)));
        device.set_state(DeviceState::Connected);
        self.spawn_monitor(Arc::clone(&device));
        Ok(device)
    }

    /// All tracked devices, connected or not.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Looks a device up by id.
    pub fn get(&self, id: &str) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Tears down a device's session but keeps it listed for reconnect.
    pub fn disconnect(&self, id: &str) {
        if let Some(device) = self.get(id) {
            device.drop_session();
        }
    }

    /// Drops a device from the inventory entirely.
    pub fn remove(&self, id: &str) {
        if let Some(device) = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
        {
            device.drop_session();
        }
    }

    /// Stops monitors and closes every session.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for device in self.devices() {
            device.drop_session();
        }
    }

    fn adopt(&self, addr: SocketAddr, session: Session) -> Result<Arc<Device>> {
        let session = Arc::new(session);
        let info = initialize(&session)?;

        let id = format!("dev{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        info!(
            "device {id} online: {} ({} {})",
            info.hostname, info.os, info.arch
        );

        let device = Arc::new(Device {
            id: id.clone(),
            addr,
            state: Mutex::new(DeviceState::Connected),
            info: Mutex::new(info),
            session: Mutex::new(Some(session)),
        });
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::clone(&device));
        self.spawn_monitor(Arc::clone(&device));
        Ok(device)
    }

    /// Watches one device: heartbeat after idle, demote on failure.
    fn spawn_monitor(&self, device: Arc<Device>) {
        let shutdown = Arc::clone(&self.shutdown);
        thread::spawn(move || loop {
            thread::sleep(MONITOR_TICK);
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            let Some(session) = device.session() else {
                return;
            };
            if session.is_closed() {
                device.drop_session();
                return;
            }
            if session.idle() < HEARTBEAT_INTERVAL {
                continue;
            }
            if let Err(e) = session.pwd() {
                warn!("device {} heartbeat failed: {e}", device.id());
                device.drop_session();
                return;
            }
        });
    }
}

/// Fetches the device identity right after the handshake.
fn initialize(session: &Session) -> Result<DeviceInfo> {
    let sys = session.uname()?;
    let user = session.whoami()?;
    let cwd = session.pwd()?;
    Ok(DeviceInfo {
        hostname: sys.nodename,
        kernel: sys.release,
        arch: sys.machine,
        os: sys.sysname,
        user: user.user,
        cwd,
    })
}
