pub mod connection;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::bolt::ConnectionDescriptor;
use crate::config::ServerConfig;

pub use connection::serve_connection;

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
                write!(f, "failed to clone accepted TCP stream: {source}")
            }
        }
    }
}

impl std::error::Error for ServerError {}

/// An accepted client stream in blocking mode, with its descriptor.
#[derive(Debug)]
pub struct BoltConnection {
    descriptor: ConnectionDescriptor,
    stream: TcpStream,
}

impl BoltConnection {
    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> u64 {
        self.descriptor.connection_id
    }

    pub fn into_parts(self) -> (ConnectionDescriptor, TcpStream) {
        (self.descriptor, self.stream)
    }
}

pub struct TcpServer {
    listener: TcpListener,
    connector: String,
    next_connection_id: AtomicU64,
    active_connections: Mutex<HashMap<u64, TcpStream>>,
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
            connector: config.connector.clone(),
            next_connection_id: AtomicU64::new(1),
            active_connections: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Polls the listener once. Accepted streams are switched to blocking
    /// mode and tracked until [`TcpServer::forget`] or shutdown.
    pub fn try_accept(&self) -> Result<Option<BoltConnection>, ServerError> {
        let (stream, client_address) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(source) => return Err(ServerError::Accept { source }),
        };

        stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_nodelay(true))
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        let server_address = stream
            .local_addr()
            .map_err(|source| ServerError::ConfigureAcceptedStream { source })?;
        let tracked = stream
            .try_clone()
            .map_err(|source| ServerError::StreamClone { source })?;

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.connections().insert(connection_id, tracked);

        Ok(Some(BoltConnection {
            descriptor: ConnectionDescriptor {
                connection_id,
                connector: self.connector.clone(),
                client_address,
                server_address,
            },
            stream,
        }))
    }

    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    pub fn forget(&self, connection_id: u64) {
        self.connections().remove(&connection_id);
    }

    pub fn shutdown_all_connections(&self) {
        let mut connections = self.connections();
        for stream in connections.values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        connections.clear();
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<u64, TcpStream>> {
        self.active_connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
