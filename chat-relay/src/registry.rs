use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::future::join_all;
use tokio::{io::AsyncWrite, sync::Mutex};
use tracing::{debug, error, warn};

use crate::{config::ServerMode, message::write_raw};

pub type ConnectionId = u64;

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

#[derive(Clone)]
struct Peer {
    addr: SocketAddr,
    writer: SharedWriter,
}

/// The set of live connections and the fan-out that writes to them.
///
/// The map lock is only held to insert, remove or snapshot; writes happen
/// outside of it, each under the recipient's own writer lock so concurrent
/// broadcasts never interleave bytes on one socket.
pub struct Registry {
    connections: Mutex<HashMap<ConnectionId, Peer>>,
    next_id: AtomicU64,
    mode: ServerMode,
}

impl Registry {
    pub fn new(mode: ServerMode) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            mode,
        }
    }

    /// Adds the write side of a freshly accepted connection.
    pub async fn register<W>(&self, addr: SocketAddr, writer: W) -> ConnectionId
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        self.insert(addr, writer).await
    }

    /// Registers a connection and writes `greeting` to it before any broadcast can.
    ///
    /// The connection's writer lock is taken before it enters the map and is held
    /// until the greeting is flushed, so a broadcast that snapshots it in the
    /// meantime waits behind the greeting. If the greeting cannot be written the
    /// connection is removed again and the error returned.
    pub async fn register_with_greeting<W>(
        &self,
        addr: SocketAddr,
        writer: W,
        greeting: &str,
    ) -> io::Result<ConnectionId>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));
        let mut guard = writer.lock().await;
        let id = self.insert(addr, Arc::clone(&writer)).await;

        if let Err(err) = write_raw(&mut *guard, greeting.as_bytes()).await {
            drop(guard);
            self.remove(id).await;
            return Err(err);
        }
        Ok(id)
    }

    async fn insert(&self, addr: SocketAddr, writer: SharedWriter) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut connections = self.connections.lock().await;
        connections.insert(id, Peer { addr, writer });
        debug!(id, peer = %addr, live = connections.len(), "connection registered");
        id
    }

    /// Removes a connection. Returns `false` if it was already gone.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.lock().await;
        match connections.remove(&id) {
            Some(peer) => {
                debug!(id, peer = %peer.addr, live = connections.len(), "connection removed");
                true
            }
            None => false,
        }
    }

    /// Writes `message` to every live connection except `sender`.
    ///
    /// Recipients whose write fails are dropped from the registry. Returns how
    /// many recipients the message reached.
    pub async fn broadcast(&self, message: &str, sender: ConnectionId) -> usize {
        let recipients: Vec<(ConnectionId, Peer)> = {
            let connections = self.connections.lock().await;
            connections
                .iter()
                .filter(|(id, _)| **id != sender)
                .map(|(id, peer)| (*id, peer.clone()))
                .collect()
        };

        let bytes = message.as_bytes();
        let deliveries = recipients.into_iter().map(|(id, peer)| async move {
            let result = {
                let mut writer = peer.writer.lock().await;
                write_raw(&mut *writer, bytes).await
            };
            (id, peer.addr, result)
        });

        let mut delivered = 0;
        for (id, addr, result) in join_all(deliveries).await {
            match result {
                Ok(()) => delivered += 1,
                Err(err) => {
                    self.report_delivery_failure(id, addr, &err);
                    self.remove(id).await;
                }
            }
        }

        debug!(sender, delivered, "broadcast complete");
        delivered
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.contains_key(&id)
    }

    pub async fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.connections.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn report_delivery_failure(&self, id: ConnectionId, addr: SocketAddr, err: &io::Error) {
        match self.mode {
            ServerMode::Debug => {
                error!(id, peer = %addr, error = ?err, "failed to deliver broadcast, dropping recipient")
            }
            ServerMode::Standard => {
                warn!(id, peer = %addr, error = ?err, "failed to deliver broadcast, dropping recipient")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    async fn read_chunk(reader: &mut DuplexStream) -> String {
        let mut buf = [0u8; 256];
        let n = reader.read(&mut buf).await.expect("read chunk");
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = Registry::new(ServerMode::Debug);
        let (writer, _reader) = tokio::io::duplex(64);
        let id = registry.register(addr(1), writer).await;

        assert!(registry.contains(id).await);
        assert!(registry.remove(id).await);
        assert!(!registry.remove(id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn register_assigns_distinct_ids() {
        let registry = Registry::new(ServerMode::Debug);
        let (first, _r1) = tokio::io::duplex(64);
        let (second, _r2) = tokio::io::duplex(64);

        let a = registry.register(addr(1), first).await;
        let b = registry.register(addr(1), second).await;

        assert_ne!(a, b);
        assert_eq!(registry.ids().await, vec![a, b]);
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let registry = Registry::new(ServerMode::Debug);
        let (alice_w, mut alice_r) = tokio::io::duplex(256);
        let (bob_w, mut bob_r) = tokio::io::duplex(256);
        let alice = registry.register(addr(1), alice_w).await;
        registry.register(addr(2), bob_w).await;

        let delivered = registry.broadcast("<127.0.0.1> hi", alice).await;

        assert_eq!(delivered, 1);
        assert_eq!(read_chunk(&mut bob_r).await, "<127.0.0.1> hi");

        // Anything for alice would already be buffered in the duplex pipe.
        registry.remove(alice).await;
        let mut buf = [0u8; 16];
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            alice_r.read(&mut buf),
        )
        .await;
        assert!(matches!(pending, Ok(Ok(0))), "sender got {pending:?}");
    }

    #[tokio::test]
    async fn broadcast_drops_dead_recipient_and_keeps_going() {
        for mode in [ServerMode::Debug, ServerMode::Standard] {
            let registry = Registry::new(mode);
            let (sender_w, _sender_r) = tokio::io::duplex(256);
            let (live_w, mut live_r) = tokio::io::duplex(256);
            let (dead_w, dead_r) = tokio::io::duplex(256);
            drop(dead_r);

            let sender = registry.register(addr(1), sender_w).await;
            let live = registry.register(addr(2), live_w).await;
            let dead = registry.register(addr(3), dead_w).await;

            let delivered = registry.broadcast("<127.0.0.1> still here", sender).await;

            assert_eq!(delivered, 1);
            assert_eq!(read_chunk(&mut live_r).await, "<127.0.0.1> still here");
            assert!(!registry.contains(dead).await);
            assert!(registry.contains(live).await);
            assert_eq!(registry.len().await, 2);
        }
    }

    #[tokio::test]
    async fn greeting_reaches_connection_before_concurrent_broadcast() {
        let registry = Arc::new(Registry::new(ServerMode::Debug));
        let (sender_w, _sender_r) = tokio::io::duplex(256);
        let sender = registry.register(addr(1), sender_w).await;

        // A tiny pipe makes the greeting write park until the reader drains it.
        let (newcomer_w, mut newcomer_r) = tokio::io::duplex(4);
        let greeting = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .register_with_greeting(addr(2), newcomer_w, "Welcome!")
                    .await
            })
        };

        while registry.len().await < 2 {
            tokio::task::yield_now().await;
        }
        let broadcast = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.broadcast("<127.0.0.1> hi", sender).await })
        };

        let expected = "Welcome!<127.0.0.1> hi";
        let mut seen = vec![0u8; expected.len()];
        newcomer_r.read_exact(&mut seen).await.expect("read greeting and broadcast");
        assert_eq!(String::from_utf8_lossy(&seen), expected);

        let id = greeting.await.expect("greeting task").expect("greeting written");
        assert_eq!(broadcast.await.expect("broadcast task"), 1);
        assert!(registry.contains(id).await);
    }

    #[tokio::test]
    async fn failed_greeting_leaves_registry_untouched() {
        let registry = Registry::new(ServerMode::Standard);
        let (writer, reader) = tokio::io::duplex(64);
        drop(reader);

        let err = registry
            .register_with_greeting(addr(1), writer, "Welcome!")
            .await
            .expect_err("peer is gone");

        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(registry.is_empty().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_register_and_remove_keep_count_exact() {
        let registry = Arc::new(Registry::new(ServerMode::Standard));
        let mut tasks = Vec::new();

        for port in 0..64u16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (writer, reader) = tokio::io::duplex(64);
                let id = registry.register(addr(port), writer).await;
                // Every other connection disconnects again right away.
                if port % 2 == 0 {
                    registry.remove(id).await;
                }
                reader
            }));
        }

        let mut readers = Vec::new();
        for task in tasks {
            readers.push(task.await.expect("task"));
        }

        assert_eq!(registry.len().await, 32);
    }
}
