use std::path::PathBuf;

use tracing::{debug, info};

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};
use crate::stream::AsyncIpcStream;

/// Async listener for either endpoint kind.
///
/// Unix socket files are created with stale-socket cleanup and removed again
/// on drop, as long as the path still refers to the socket we created.
pub enum IpcListener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(UnixSocketListener),
}

#[cfg(unix)]
pub struct UnixSocketListener {
    listener: tokio::net::UnixListener,
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
}

impl IpcListener {
    /// Bind and listen on the endpoint.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = tokio::net::TcpListener::bind(addr.as_str())
                    .await
                    .map_err(|source| TransportError::Bind {
                        endpoint: endpoint.to_string(),
                        source,
                    })?;
                info!(%endpoint, "listening on tcp");
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => Ok(Self::Unix(UnixSocketListener::bind(path.clone())?)),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::Bind {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix endpoints require a unix platform",
                ),
            }),
        }
    }

    /// Accept an incoming connection.
    pub async fn accept(&self) -> Result<AsyncIpcStream> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(TransportError::Accept)?;
                stream.set_nodelay(true)?;
                debug!(%addr, "accepted tcp connection");
                Ok(AsyncIpcStream::Tcp(stream))
            }
            #[cfg(unix)]
            Self::Unix(socket) => {
                let (stream, _addr) = socket
                    .listener
                    .accept()
                    .await
                    .map_err(TransportError::Accept)?;
                debug!("accepted unix connection");
                Ok(AsyncIpcStream::Unix(stream))
            }
        }
    }

    /// The endpoint peers should connect to (resolves `:0` tcp ports).
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        match self {
            Self::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            #[cfg(unix)]
            Self::Unix(socket) => Ok(Endpoint::Unix(socket.path.clone())),
        }
    }
}

#[cfg(unix)]
impl UnixSocketListener {
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    fn bind(path: PathBuf) -> Result<Self> {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_error = |path: &PathBuf, source: std::io::Error| TransportError::Bind {
            endpoint: format!("unix://{}", path.display()),
            source,
        };

        // Remove a stale socket, but never a regular file.
        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_error(
                    &path,
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "existing path is not a unix socket",
                    ),
                ));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(|e| bind_error(&path, e))?;
        }

        let listener = tokio::net::UnixListener::bind(&path).map_err(|e| bind_error(&path, e))?;
        let created_inode = std::fs::symlink_metadata(&path)
            .ok()
            .map(|metadata| (metadata.dev(), metadata.ino()));

        info!(?path, "listening on unix domain socket");
        Ok(Self {
            listener,
            path,
            created_inode,
        })
    }
}

#[cfg(unix)]
impl Drop for UnixSocketListener {
    fn drop(&mut self) {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};

        let Some((dev, ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket() && metadata.dev() == dev && metadata.ino() == ino {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }
}
