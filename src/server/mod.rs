//! Protocol server
//!
//! Accepts framed connections and serves each one as an independent task on
//! top of a shared [`LocalConnection`].

mod bridge;
mod session;

use crate::conn::LocalConnection;
use crate::error::VelesError;
use crate::proto::{Endpoint, DEFAULT_MAX_FRAME_SIZE, KEY_SIZE};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub struct Server {
    conn: Arc<LocalConnection>,
    key: [u8; KEY_SIZE],
    max_frame_size: usize,
}

impl Server {
    pub fn new(conn: Arc<LocalConnection>, key: [u8; KEY_SIZE]) -> Self {
        Server {
            conn,
            key,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn connection(&self) -> &Arc<LocalConnection> {
        &self.conn
    }

    /// Serve a single already-accepted stream until the client leaves.
    pub async fn serve<S>(&self, stream: S) -> Result<(), VelesError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        session::serve(self.conn.clone(), stream, self.key, self.max_frame_size).await
    }

    fn spawn_session<S>(self: &Arc<Self>, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let server = self.clone();
        tokio::spawn(async move {
            match server.serve(stream).await {
                Ok(()) => debug!(peer = %peer, "Session ended"),
                Err(err) => debug!(peer = %peer, error = %err, "Session ended with error"),
            }
        });
    }

    /// Accept connections on `endpoint` until `shutdown` resolves.
    pub async fn listen(
        self: Arc<Self>,
        endpoint: &Endpoint,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), VelesError> {
        tokio::pin!(shutdown);
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                info!(addr = %listener.local_addr()?, "Listening");
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                if let Err(err) = stream.set_nodelay(true) {
                                    debug!(error = %err, "Could not disable Nagle");
                                }
                                self.spawn_session(stream, peer.to_string());
                            }
                            Err(err) => warn!(error = %err, "Accept failed"),
                        },
                        _ = &mut shutdown => break,
                    }
                }
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                info!(path = %path.display(), "Listening");
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, _)) => self.spawn_session(stream, path.display().to_string()),
                            Err(err) => warn!(error = %err, "Accept failed"),
                        },
                        _ = &mut shutdown => break,
                    }
                }
                let _ = std::fs::remove_file(path);
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => {
                return Err(VelesError::Unsupported("unix sockets on this platform".to_string()));
            }
            Endpoint::Ssl { .. } => {
                return Err(VelesError::Unsupported("TLS transport".to_string()));
            }
        }
        info!("Server shut down");
        Ok(())
    }
}
