//! Default collaborators backed by the local host: a UDP-socket network stack,
//! a descriptor-file bind handshake and a JSON-lines perf reporter.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::bind::{BindError, BindHandshake, BindInfo};
use crate::config::StackConfig;
use crate::perf::{PerfBatch, PerfError, PerfReporter};
use crate::stack::{NetworkStack, StackError};

/// Written by the activation flow once the device has been bound to an owner.
pub const DEVICE_DESC: &str = "etc/desc/device.desc";
pub const OWNER_DESC: &str = "etc/desc/zone_owner.desc";
pub const PERF_BATCHES: &str = "perf/batches.jsonl";

/// Object id of a descriptor: hex of the first 16 bytes of its SHA-256.
pub fn object_id(desc: &[u8]) -> String {
    let digest = Sha256::digest(desc);
    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Default)]
struct LocalState {
    socket: Option<UdpSocket>,
    /// Port held since launch; kept while a rebind is outstanding.
    port: Option<u16>,
    wifi: Option<IpAddr>,
}

/// Holds the BDT port with a UDP socket and reports it as the device address.
#[derive(Default)]
pub struct LocalStack {
    state: Mutex<LocalState>,
}

impl LocalStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn bind(port: u16) -> Result<UdpSocket, StackError> {
        UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).map_err(|e| {
            match e.kind() {
                ErrorKind::AddrInUse | ErrorKind::AddrNotAvailable => {
                    StackError::Transient(format!("bind udp port {}: {}", port, e))
                }
                _ => StackError::Fatal(format!("bind udp port {}: {}", port, e)),
            }
        })
    }

    /// Port actually bound, if launched.
    pub fn port(&self) -> Option<u16> {
        self.state
            .lock()
            .socket
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|a| a.port())
    }
}

impl NetworkStack for LocalStack {
    fn launch(&self, config: &StackConfig) -> Result<(), StackError> {
        fs::create_dir_all(&config.storage_path).map_err(|e| {
            StackError::Fatal(format!(
                "create storage dir {}: {}",
                config.storage_path.display(),
                e
            ))
        })?;
        let socket = Self::bind(config.bdt_port)?;
        log::debug!("local stack listening on {:?}", socket.local_addr().ok());
        let mut st = self.state.lock();
        st.port = socket.local_addr().ok().map(|a| a.port());
        st.socket = Some(socket);
        st.wifi = config.wifi_ip();
        Ok(())
    }

    /// Rebind the launch port. The port has to be released first; if the rebind
    /// fails the previous binding is reclaimed when possible, and the port is
    /// remembered either way so a retry can rebind it.
    fn restart_interface(&self) -> Result<(), StackError> {
        let mut st = self.state.lock();
        let port = st
            .port
            .ok_or_else(|| StackError::Fatal("stack not launched".into()))?;
        drop(st.socket.take());
        match Self::bind(port) {
            Ok(socket) => {
                st.socket = Some(socket);
                log::debug!("local stack rebound udp port {}", port);
                Ok(())
            }
            Err(e) => {
                st.socket = Self::bind(port).ok();
                log::warn!(
                    "local stack rebind of udp port {} failed ({}), previous binding {}",
                    port,
                    e,
                    if st.socket.is_some() { "reclaimed" } else { "lost" }
                );
                Err(e)
            }
        }
    }

    fn reset_network(&self, wifi_address: IpAddr) -> Result<(), StackError> {
        let mut st = self.state.lock();
        if st.port.is_none() {
            return Err(StackError::Fatal("stack not launched".into()));
        }
        st.wifi = Some(wifi_address);
        Ok(())
    }

    fn local_addresses(&self) -> Vec<String> {
        let st = self.state.lock();
        let Some(bound) = st.socket.as_ref().and_then(|s| s.local_addr().ok()) else {
            return Vec::new();
        };
        let ip = match st.wifi {
            Some(wifi) => wifi,
            None if bound.ip().is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            None => bound.ip(),
        };
        vec![SocketAddr::new(ip, bound.port()).to_string()]
    }

    fn shutdown(&self) {
        let mut st = self.state.lock();
        st.socket = None;
        st.port = None;
        st.wifi = None;
    }
}

/// Bound once the device descriptor exists under the storage path.
#[derive(Debug, Default, Clone, Copy)]
pub struct DescFileHandshake;

impl DescFileHandshake {
    fn read_desc(path: &Path) -> Result<Option<Vec<u8>>, BindError> {
        match fs::read(path) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BindError::Unreachable(format!(
                "read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

impl BindHandshake for DescFileHandshake {
    fn bind(&self, config: &StackConfig) -> Result<Option<BindInfo>, BindError> {
        let Some(device) = Self::read_desc(&config.storage_path.join(DEVICE_DESC))? else {
            return Ok(None);
        };
        let owner = Self::read_desc(&config.storage_path.join(OWNER_DESC))
            .ok()
            .flatten()
            .map(|o| object_id(&o));
        Ok(Some(BindInfo::new(object_id(&device), owner)))
    }
}

/// Appends each batch as one JSON line.
pub struct JsonlReporter {
    path: PathBuf,
    write: Mutex<()>,
}

impl JsonlReporter {
    pub fn new(storage_path: impl AsRef<Path>) -> Self {
        Self::at(storage_path.as_ref().join(PERF_BATCHES))
    }

    pub fn at(path: PathBuf) -> Self {
        Self {
            path,
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let _guard = self.write.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }
}

impl PerfReporter for JsonlReporter {
    fn report(&self, batch: &PerfBatch) -> Result<(), PerfError> {
        let line = serde_json::to_string(batch)?;
        self.append(&line)?;
        Ok(())
    }
}
