use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config;

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 1279;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_owned(),
            port: DEFAULT_PORT,
        }
    }
}

impl From<&config::ServerConfig> for ServerConfig {
    fn from(value: &config::ServerConfig) -> Self {
        Self {
            host: value.host.clone(),
            port: value.port,
        }
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    Accept {
        source: io::Error,
    },
    ConfigureAcceptedStream {
        source: io::Error,
    },
    StreamClone {
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP server on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP server to non-blocking mode: {source}")
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
            Self::ConfigureAcceptedStream { source } => {
                write!(f, "failed to configure accepted TCP stream: {source}")
            }
            Self::StreamClone { source } => {
                write!(f, "failed to clone accepted TCP stream for tracking: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

type OpenConnections = Arc<Mutex<HashMap<u64, TcpStream>>>;

/// Accepted client socket, owned by whichever worker serves it.
///
/// The listener keeps a cloned handle in its open-connection table so that
/// shutdown can unblock a worker parked in a read; dropping the connection
/// removes that entry.
#[derive(Debug)]
pub struct ClientConnection {
    id: u64,
    peer_addr: SocketAddr,
    accepted_at: DateTime<Utc>,
    stream: TcpStream,
    open_connections: OpenConnections,
}

impl ClientConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn accepted_at(&self) -> DateTime<Utc> {
        self.accepted_at
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(timeout)
    }
}

impl Read for ClientConnection {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buffer)
    }
}

impl Write for ClientConnection {
    fn write(&mut self, payload: &[u8]) -> io::Result<usize> {
        self.stream.write(payload)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.open_connections
            .lock()
            .expect("open connections lock poisoned")
            .remove(&self.id);
    }
}

pub struct TcpServer {
    listener: TcpListener,
    next_connection_id: AtomicU64,
    open_connections: OpenConnections,
}

impl TcpServer {
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            next_connection_id: AtomicU64::new(1),
            open_connections: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn from_app_config(app_config: &config::AppConfig) -> Result<Self, ServerError> {
        Self::bind(&ServerConfig::from(&app_config.server))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    // Non-blocking poll; accepted sockets are switched to blocking mode for
    // the worker that will own them.
    pub fn try_accept(&self) -> Result<Option<ClientConnection>, ServerError> {
        let (stream, peer_addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(source) => return Err(ServerError::Accept { source }),
        };

        stream
            .set_nonblocking(false)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        stream
            .set_nodelay(true)
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        let tracked = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.open_connections
            .lock()
            .expect("open connections lock poisoned")
            .insert(id, tracked);

        Ok(Some(ClientConnection {
            id,
            peer_addr,
            accepted_at: Utc::now(),
            stream,
            open_connections: Arc::clone(&self.open_connections),
        }))
    }

    pub fn connection_count(&self) -> usize {
        self.open_connections
            .lock()
            .expect("open connections lock poisoned")
            .len()
    }

    pub fn shutdown_all_connections(&self) -> usize {
        let mut connections = self
            .open_connections
            .lock()
            .expect("open connections lock poisoned");

        let count = connections.len();
        for stream in connections.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        connections.clear();
        count
    }
}

#[cfg(test)]
pub(crate) fn accept_within(server: &TcpServer, attempts: usize) -> Option<ClientConnection> {
    for _ in 0..attempts {
        if let Some(connection) = server.try_accept().expect("accept poll should not fail") {
            return Some(connection);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    None
}
