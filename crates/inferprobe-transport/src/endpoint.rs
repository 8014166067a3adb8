use std::fmt;
use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::stream::{AsyncIpcStream, IpcStream};

/// Address of an inference processor.
///
/// Accepted forms:
/// - `tcp://host:port` or a bare `host:port`
/// - `unix:///path/to/socket` or a bare absolute path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// Open a blocking stream with the given I/O timeout applied to both directions.
    ///
    /// For TCP the timeout also bounds connecting.
    pub fn connect_blocking(&self, timeout: Option<Duration>) -> Result<IpcStream> {
        let stream = match self {
            Endpoint::Tcp(addr) => IpcStream::from_tcp(self.connect_tcp(addr, timeout)?),
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = std::os::unix::net::UnixStream::connect(path).map_err(|source| {
                    TransportError::Connect {
                        endpoint: self.to_string(),
                        source,
                    }
                })?;
                IpcStream::from_unix(stream)
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => return Err(unsupported_unix(self)),
        };

        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;
        debug!(endpoint = %self, "connected (blocking)");
        Ok(stream)
    }

    /// Tries every resolved address in turn, each bounded by `timeout`.
    fn connect_tcp(&self, addr: &str, timeout: Option<Duration>) -> Result<std::net::TcpStream> {
        let connect_error = |source: std::io::Error| TransportError::Connect {
            endpoint: self.to_string(),
            source,
        };
        let Some(timeout) = timeout else {
            return std::net::TcpStream::connect(addr).map_err(connect_error);
        };

        let mut last_error = None;
        for resolved in addr.to_socket_addrs().map_err(connect_error)? {
            match std::net::TcpStream::connect_timeout(&resolved, timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!(%resolved, error = %err, "connect attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(connect_error(last_error.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "address resolved to no socket addresses",
            )
        })))
    }

    /// Open an async stream.
    pub async fn connect_async(&self) -> Result<AsyncIpcStream> {
        let stream = match self {
            Endpoint::Tcp(addr) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str())
                    .await
                    .map_err(|source| TransportError::Connect {
                        endpoint: self.to_string(),
                        source,
                    })?;
                stream.set_nodelay(true)?;
                AsyncIpcStream::Tcp(stream)
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await.map_err(|source| {
                    TransportError::Connect {
                        endpoint: self.to_string(),
                        source,
                    }
                })?;
                AsyncIpcStream::Unix(stream)
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => return Err(unsupported_unix(self)),
        };

        debug!(endpoint = %self, "connected (async)");
        Ok(stream)
    }
}

#[cfg(not(unix))]
fn unsupported_unix(endpoint: &Endpoint) -> TransportError {
    TransportError::Connect {
        endpoint: endpoint.to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix endpoints require a unix platform",
        ),
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();

        if let Some(path) = input.strip_prefix("unix://") {
            return parse_unix(input, path);
        }
        if let Some(path) = input.strip_prefix("unix:") {
            return parse_unix(input, path);
        }
        if input.starts_with('/') {
            return parse_unix(input, input);
        }

        let addr = input.strip_prefix("tcp://").unwrap_or(input);
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidEndpoint(input.to_string()))?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(TransportError::InvalidEndpoint(input.to_string()));
        }

        Ok(Endpoint::Tcp(addr.to_string()))
    }
}

fn parse_unix(input: &str, path: &str) -> Result<Endpoint> {
    if path.is_empty() {
        return Err(TransportError::InvalidEndpoint(input.to_string()));
    }
    Ok(Endpoint::Unix(PathBuf::from(path)))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}
