use std::net::SocketAddr;

use tokio::io::{self, AsyncWrite, AsyncWriteExt};

/// Sent once, unprefixed, to every newly accepted connection.
pub const WELCOME: &str = "Welcome to the chat room!";

/// Maximum number of bytes the server reads from a connection in one go.
///
/// Larger messages are relayed as several independent chunks; nothing is
/// reassembled.
pub const SERVER_CHUNK_SIZE: usize = 2048;

/// Read size used by the client listener.
pub const CLIENT_CHUNK_SIZE: usize = 1024;

/// Turns a raw chunk read from `sender` into the text relayed to everyone else.
///
/// Only the IP part of the address is shown, so every participant on one host
/// looks like `<127.0.0.1>`.
pub fn relay_text(sender: SocketAddr, chunk: &[u8]) -> String {
    format!("<{}> {}", sender.ip(), String::from_utf8_lossy(chunk))
}

pub async fn write_raw<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    // No delimiter: peers see exactly the bytes we were given.
    writer.write_all(bytes).await?;
    writer.flush().await
}
