use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::{DEFAULT_MAX_READ_RETRIES, ServerMode, ServerSettings},
    message::{SERVER_CHUNK_SIZE, WELCOME, relay_text},
    registry::{ConnectionId, Registry},
};

/// Pause between two reads on a connection whose last read failed.
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Pause after a failed `accept`, e.g. when the process is out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How a connection handler reacts to a failed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadErrorPolicy {
    /// Read again, closing only after `max_consecutive` failures in a row.
    Retry { max_consecutive: u32 },
    /// Close the connection on the first failure.
    Close,
}

impl Default for ReadErrorPolicy {
    fn default() -> Self {
        ReadErrorPolicy::Retry {
            max_consecutive: DEFAULT_MAX_READ_RETRIES,
        }
    }
}

impl ReadErrorPolicy {
    fn should_retry(self, consecutive_failures: u32) -> bool {
        match self {
            ReadErrorPolicy::Retry { max_consecutive } => consecutive_failures < max_consecutive,
            ReadErrorPolicy::Close => false,
        }
    }
}

/// Why a connection handler stopped.
#[derive(Debug)]
pub enum HandlerExit {
    /// The peer closed its side (zero-length read).
    PeerClosed,
    /// Reads kept failing and the read-error policy gave up.
    ReadFailed { attempts: u32, error: io::Error },
    /// The welcome notice could not be written; the connection was dropped again.
    WelcomeFailed(io::Error),
}

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    read_error_policy: ReadErrorPolicy,
}

impl Server {
    pub fn new(listener: TcpListener, mode: ServerMode, read_error_policy: ReadErrorPolicy) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new(mode)),
            read_error_policy,
        }
    }

    pub async fn bind(settings: &ServerSettings) -> Result<Self> {
        let addr = format!("{}:{}", settings.host, settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::new(listener, settings.mode, settings.read_error_policy))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` resolves, one task per connection.
    ///
    /// Handlers that are already running are left alone; they end with their
    /// connection or with the process.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            read_error_policy,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    let live = registry.len().await;
                    info!(live, "server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, read_error_policy).await;
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
    policy: ReadErrorPolicy,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, registry, policy),
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            tokio::time::sleep(ACCEPT_BACKOFF).await;
        }
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    policy: ReadErrorPolicy,
) {
    info!(peer = %peer, "accepted connection");
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        match handle_connection(reader, writer, peer, registry, policy).await {
            HandlerExit::PeerClosed => info!(peer = %peer, "client disconnected"),
            HandlerExit::ReadFailed { attempts, error } => {
                warn!(peer = %peer, attempts, error = ?error, "closing connection after read failures")
            }
            HandlerExit::WelcomeFailed(error) => {
                warn!(peer = %peer, error = ?error, "failed to greet client")
            }
        }
    });
}

/// Runs one connection from welcome to close.
///
/// The connection is registered and greeted in one step, so it is live as soon
/// as the welcome arrives and no broadcast can overtake the welcome. Every exit
/// path removes the connection again.
pub async fn handle_connection<R, W>(
    reader: R,
    writer: W,
    peer: SocketAddr,
    registry: Arc<Registry>,
    policy: ReadErrorPolicy,
) -> HandlerExit
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let id = match registry.register_with_greeting(peer, writer, WELCOME).await {
        Ok(id) => id,
        Err(err) => return HandlerExit::WelcomeFailed(err),
    };
    let exit = relay_incoming(reader, id, peer, &registry, policy).await;
    registry.remove(id).await;
    exit
}

async fn relay_incoming<R>(
    mut reader: R,
    id: ConnectionId,
    peer: SocketAddr,
    registry: &Registry,
    policy: ReadErrorPolicy,
) -> HandlerExit
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; SERVER_CHUNK_SIZE];
    let mut failures = 0;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return HandlerExit::PeerClosed,
            Ok(n) => {
                failures = 0;
                let text = relay_text(peer, &buf[..n]);
                debug!(id, peer = %peer, bytes = n, "relaying chunk");
                registry.broadcast(&text, id).await;
            }
            Err(err) => {
                failures += 1;
                error!(id, peer = %peer, attempt = failures, error = ?err, "socket read failed");
                if !policy.should_retry(failures) {
                    return HandlerExit::ReadFailed {
                        attempts: failures,
                        error: err,
                    };
                }
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }
}
