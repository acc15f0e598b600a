use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use tokio::{
    io::{
        AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
        BufReader,
    },
    net::{TcpStream, tcp::OwnedWriteHalf},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientSettings,
    error::ClientError,
    message::{CLIENT_CHUNK_SIZE, write_raw},
};

/// Idle timeout used by `TIMEOUT` mode when none is configured.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long [`ClientSession::close`] waits for the listener before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Line that ends the operator loop without sending anything.
const EXIT_COMMAND: &str = "exit";

/// Listening policy of the background receive loop, fixed per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenMode {
    /// `KEEPALIVE`: block on reads, stop on the first error of any kind.
    Indefinite,
    /// `TIMEOUT`: bound every read; an expired read only ends the loop if the
    /// session was closed meanwhile.
    IdleTimeout(Duration),
}

impl ListenMode {
    pub fn parse(mode: &str, timeout_secs: Option<u64>) -> Result<Self, ClientError> {
        match mode {
            "KEEPALIVE" => Ok(ListenMode::Indefinite),
            "TIMEOUT" => match timeout_secs {
                Some(0) => Err(ClientError::InvalidTimeout),
                Some(secs) => Ok(ListenMode::IdleTimeout(Duration::from_secs(secs))),
                None => Ok(ListenMode::IdleTimeout(DEFAULT_IDLE_TIMEOUT)),
            },
            other => Err(ClientError::InvalidMode(other.to_string())),
        }
    }
}

/// Why the background listener stopped.
#[derive(Debug)]
pub enum ListenerExit {
    /// The server closed the connection (zero-length read).
    PeerClosed,
    /// A read failed.
    ReadFailed(io::Error),
    /// Incoming data could not be written to the output.
    OutputFailed(io::Error),
    /// An idle timeout expired after the session had been closed locally.
    SessionClosed,
}

/// A validated, not yet connected client.
#[derive(Debug, Clone)]
pub struct ChatClient {
    host: String,
    port: u16,
    mode: ListenMode,
}

impl ChatClient {
    /// Validates the mode before anything touches the network.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        mode: &str,
        timeout_secs: Option<u64>,
    ) -> Result<Self, ClientError> {
        let mode = ListenMode::parse(mode, timeout_secs)?;
        Ok(Self::with_mode(host, port, mode))
    }

    pub fn with_mode(host: impl Into<String>, port: u16, mode: ListenMode) -> Self {
        Self {
            host: host.into(),
            port,
            mode,
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self, ClientError> {
        Self::new(
            settings.host.clone(),
            settings.port,
            &settings.mode,
            settings.timeout,
        )
    }

    pub fn mode(&self) -> ListenMode {
        self.mode
    }

    /// Connects and starts a listener that copies incoming data to stdout.
    pub async fn connect(self) -> Result<ClientSession, ClientError> {
        self.connect_with_output(tokio::io::stdout()).await
    }

    /// Connects and starts a listener that copies incoming data to `output`.
    pub async fn connect_with_output<O>(self, output: O) -> Result<ClientSession, ClientError>
    where
        O: AsyncWrite + Send + Unpin + 'static,
    {
        let addr = format!("{}:{}", self.host, self.port);
        info!(%addr, "connecting");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        info!(%addr, "connected");

        let (reader, writer) = stream.into_split();
        let open = Arc::new(AtomicBool::new(true));
        let listener = tokio::spawn(listen(reader, output, self.mode, Arc::clone(&open)));

        Ok(ClientSession {
            writer,
            mode: self.mode,
            open,
            listener,
        })
    }
}

/// One live connection plus its background listener.
pub struct ClientSession {
    writer: OwnedWriteHalf,
    mode: ListenMode,
    open: Arc<AtomicBool>,
    listener: JoinHandle<ListenerExit>,
}

impl ClientSession {
    pub fn mode(&self) -> ListenMode {
        self.mode
    }

    /// `false` once the listener has seen the connection end or [`close`](Self::close) ran.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Writes `message` as-is; no delimiter is appended.
    pub async fn send(&mut self, message: &str) -> Result<(), ClientError> {
        if !self.is_open() {
            return Err(ClientError::Disconnected);
        }
        write_raw(&mut self.writer, message.as_bytes())
            .await
            .map_err(ClientError::Send)
    }

    /// Closes the session and waits briefly for the listener to finish.
    ///
    /// Returns `None` if the listener had to be aborted.
    pub async fn close(self) -> Option<ListenerExit> {
        let ClientSession {
            mut writer,
            open,
            mut listener,
            ..
        } = self;

        open.store(false, Ordering::Release);
        if let Err(error) = writer.shutdown().await {
            warn!(?error, "failed to shutdown client writer cleanly");
        }

        match timeout(CLOSE_GRACE, &mut listener).await {
            Ok(Ok(exit)) => Some(exit),
            Ok(Err(error)) => {
                warn!(?error, "listener task failed");
                None
            }
            Err(_) => {
                listener.abort();
                None
            }
        }
    }
}

/// Background receive loop: copies every chunk from `reader` to `output`.
pub async fn listen<R, O>(
    mut reader: R,
    mut output: O,
    mode: ListenMode,
    open: Arc<AtomicBool>,
) -> ListenerExit
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut buf = [0u8; CLIENT_CHUNK_SIZE];

    let exit = loop {
        let read = match mode {
            ListenMode::Indefinite => reader.read(&mut buf).await,
            ListenMode::IdleTimeout(idle) => match timeout(idle, reader.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) if open.load(Ordering::Acquire) => {
                    debug!(?idle, "no data within idle timeout, connection still open");
                    continue;
                }
                Err(_) => break ListenerExit::SessionClosed,
            },
        };

        match read {
            Ok(0) => {
                warn!("server closed the connection");
                break ListenerExit::PeerClosed;
            }
            Ok(n) => {
                if let Err(err) = write_raw(&mut output, &buf[..n]).await {
                    error!(error = ?err, "failed to write incoming data");
                    break ListenerExit::OutputFailed(err);
                }
            }
            Err(err) => {
                error!(error = ?err, "failed to read from server");
                break ListenerExit::ReadFailed(err);
            }
        }
    };

    open.store(false, Ordering::Release);
    exit
}

/// Foreground loop: sends each input line until `exit` or end of input.
///
/// In `TIMEOUT` mode a reminder of the idle timeout follows every send.
pub async fn run_operator<I, O>(
    session: &mut ClientSession,
    input: I,
    mut output: O,
) -> Result<(), ClientError>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut lines = input.lines();

    while let Some(line) = lines.next_line().await.map_err(ClientError::Input)? {
        if line == EXIT_COMMAND {
            break;
        }

        session.send(&line).await?;

        if let ListenMode::IdleTimeout(idle) = session.mode() {
            let reminder = format!(
                "Timeout mode activated... connection will close if no message received in {} seconds\n",
                idle.as_secs()
            );
            write_raw(&mut output, reminder.as_bytes())
                .await
                .map_err(ClientError::Send)?;
        }
    }

    Ok(())
}

/// Client entry point used by the binary: stdin in, stdout out.
pub async fn run(settings: ClientSettings) -> Result<()> {
    let client = ChatClient::from_settings(&settings)?;
    let mut session = client.connect().await?;

    let stdin = BufReader::new(tokio::io::stdin());
    let result = run_operator(&mut session, stdin, tokio::io::stdout()).await;

    if let Some(exit) = session.close().await {
        debug!(?exit, "listener stopped");
    }

    result.map_err(Into::into)
}
