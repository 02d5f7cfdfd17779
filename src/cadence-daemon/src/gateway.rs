//! Pub/Sub gateway.
//!
//! Clients connect, negotiate a protocol version and subscribe to topics.
//! Everything published on a topic is relayed to its subscribers as
//!
//! ```text
//! MSG <topic> <len>\n<payload>\n
//! ```
//!
//! Each connection owns a bounded outgoing queue. Publishing never blocks:
//! a full queue drops the frame for that subscriber only.

use crate::error::DaemonError;
use crate::line::{read_line, MAX_LINE_BYTES};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const PUBSUB_VERSION: &str = "1.0";
const PUBSUB_MAJOR: &str = "1";

/// Outgoing frames buffered per subscriber.
pub const QUEUE_CAPACITY: usize = 256;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A subscriber that cannot take a frame within this long is disconnected.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifies one gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

/// A connection and the topics it listens to.
#[derive(Debug)]
struct Subscription {
    peer: SocketAddr,
    topics: HashSet<String>,
    queue: mpsc::Sender<String>,
}

#[derive(Debug)]
struct GatewayInner {
    subscriptions: Mutex<HashMap<ClientId, Subscription>>,
    topics: Mutex<BTreeSet<String>>,
    next_client: AtomicU64,
}

/// Registry of subscriptions and the broadcast path into them.
///
/// Cloning is cheap; every clone shares the same subscription set.
#[derive(Debug, Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                subscriptions: Mutex::new(HashMap::new()),
                topics: Mutex::new(BTreeSet::new()),
                next_client: AtomicU64::new(1),
            }),
        }
    }

    /// Make `topic` available for subscription.
    pub fn declare_topic(&self, topic: &str) {
        lock(&self.inner.topics).insert(topic.to_string());
    }

    pub fn topics(&self) -> Vec<String> {
        lock(&self.inner.topics).iter().cloned().collect()
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        lock(&self.inner.topics).contains(topic)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscriptions).len()
    }

    /// Broadcast `payload` to every subscriber of `topic`.
    ///
    /// Returns the number of subscribers the frame was queued for.
    pub fn publish(&self, topic: &str, payload: &str) -> usize {
        let targets: Vec<(ClientId, mpsc::Sender<String>)> = lock(&self.inner.subscriptions)
            .iter()
            .filter(|(_, sub)| sub.topics.contains(topic))
            .map(|(id, sub)| (*id, sub.queue.clone()))
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let frame = format!("MSG {topic} {}\n{payload}\n", payload.len());
        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, queue) in targets {
            match queue.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(client = id.0, topic, "subscriber queue full; dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id),
            }
        }
        if !closed.is_empty() {
            let mut subscriptions = lock(&self.inner.subscriptions);
            for id in closed {
                subscriptions.remove(&id);
            }
        }
        delivered
    }

    pub(crate) fn register(&self, peer: SocketAddr, queue: mpsc::Sender<String>) -> ClientId {
        let id = ClientId(self.inner.next_client.fetch_add(1, Ordering::Relaxed));
        lock(&self.inner.subscriptions).insert(
            id,
            Subscription {
                peer,
                topics: HashSet::new(),
                queue,
            },
        );
        id
    }

    pub(crate) fn unregister(&self, id: ClientId) {
        if let Some(sub) = lock(&self.inner.subscriptions).remove(&id) {
            tracing::debug!(client = id.0, peer = %sub.peer, "subscriber removed");
        }
    }

    pub(crate) fn subscribe(&self, id: ClientId, topics: &[&str]) -> Result<(), String> {
        if let Some(unknown) = topics.iter().find(|topic| !self.has_topic(topic)) {
            return Err(format!("unknown topic {unknown}"));
        }
        let mut subscriptions = lock(&self.inner.subscriptions);
        let sub = subscriptions
            .get_mut(&id)
            .ok_or_else(|| "connection closed".to_string())?;
        sub.topics.extend(topics.iter().map(|topic| topic.to_string()));
        Ok(())
    }

    fn unsubscribe(&self, id: ClientId, topics: &[&str]) {
        if let Some(sub) = lock(&self.inner.subscriptions).get_mut(&id) {
            for topic in topics {
                sub.topics.remove(*topic);
            }
        }
    }

    /// Bind the gateway's TCP listener.
    pub async fn listen(&self, addr: SocketAddr) -> Result<GatewayServer, DaemonError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DaemonError::Bind {
                service: "pub/sub gateway",
                addr,
                source,
            })?;
        Ok(GatewayServer {
            gateway: self.clone(),
            listener,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A bound gateway listener.
#[derive(Debug)]
pub struct GatewayServer {
    gateway: Gateway,
    listener: TcpListener,
}

impl GatewayServer {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `cancel` fires. Every connection runs in its own task.
    pub async fn serve(self, cancel: CancellationToken) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "pub/sub gateway listening");
        }
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let gateway = self.gateway.clone();
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        serve_connection(gateway, stream, peer, cancel).await;
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "pub/sub accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        tracing::info!("pub/sub gateway stopped");
    }
}

enum Handshake {
    Accepted,
    Rejected(String),
}

fn check_handshake(line: &str) -> Handshake {
    let mut words = line.split_whitespace();
    match (words.next(), words.next(), words.next()) {
        (Some("hello"), Some(version), None) => {
            let major = version.split('.').next().unwrap_or_default();
            if major == PUBSUB_MAJOR {
                Handshake::Accepted
            } else {
                Handshake::Rejected(format!("Oops unsupported version {version}"))
            }
        }
        _ => Handshake::Rejected("Oops malformed handshake".to_string()),
    }
}

async fn serve_connection(
    gateway: Gateway,
    stream: TcpStream,
    peer: SocketAddr,
    cancel: CancellationToken,
) {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    if writer
        .write_all(format!("OK pubsub {PUBSUB_VERSION}\n").as_bytes())
        .await
        .is_err()
    {
        return;
    }

    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_line(&mut reader, MAX_LINE_BYTES)).await;
    let reply = match first {
        Ok(Ok(Some(line))) => match check_handshake(&line) {
            Handshake::Accepted => None,
            Handshake::Rejected(reply) => Some(reply),
        },
        Ok(Ok(None)) => return,
        Ok(Err(_)) => Some("Oops malformed handshake".to_string()),
        Err(_) => {
            tracing::debug!(%peer, "pub/sub handshake timed out");
            return;
        }
    };
    if let Some(reply) = reply {
        tracing::debug!(%peer, reply = %reply, "pub/sub handshake rejected");
        let _ = writer.write_all(format!("{reply}\n").as_bytes()).await;
        let _ = writer.shutdown().await;
        return;
    }

    let (queue, outgoing) = mpsc::channel(QUEUE_CAPACITY);
    if queue
        .send(format!("OK {PUBSUB_VERSION}\n"))
        .await
        .is_err()
    {
        return;
    }
    let id = gateway.register(peer, queue.clone());
    tracing::debug!(%peer, client = id.0, "pub/sub client connected");
    let writer_task = tokio::spawn(write_frames(writer, outgoing));

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = read_line(&mut reader, MAX_LINE_BYTES) => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(%peer, error = %err, "closing pub/sub connection");
                break;
            }
        };

        let mut words = line.split_whitespace();
        let command = words.next().unwrap_or_default();
        let args: Vec<&str> = words.collect();
        let reply = match command {
            "" => continue,
            "sub" if !args.is_empty() => match gateway.subscribe(id, &args) {
                Ok(()) => "OK".to_string(),
                Err(reason) => format!("Oops {reason}"),
            },
            "unsub" if !args.is_empty() => {
                gateway.unsubscribe(id, &args);
                "OK".to_string()
            }
            "sub" | "unsub" => "Oops missing topic".to_string(),
            "topics" => format!("OK {}", gateway.topics().join(" ")),
            "quit" => break,
            _ => "Oops unknown command".to_string(),
        };
        if queue.send(format!("{reply}\n")).await.is_err() {
            break;
        }
    }

    gateway.unregister(id);
    drop(queue);
    if cancel.is_cancelled() {
        writer_task.abort();
    }
    let _ = writer_task.await;
    tracing::debug!(%peer, client = id.0, "pub/sub client disconnected");
}

async fn write_frames<W>(mut writer: W, mut outgoing: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = outgoing.recv().await {
        match tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(frame.as_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => break,
            Err(_) => {
                tracing::debug!("pub/sub subscriber stopped reading; dropping it");
                break;
            }
        }
    }
    let _ = tokio::time::timeout(WRITE_TIMEOUT, writer.shutdown()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, Lines};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    struct Client {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl Client {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, writer) = stream.into_split();
            let mut client = Self {
                lines: BufReader::new(read_half).lines(),
                writer,
            };
            assert_eq!(client.next().await.as_deref(), Some("OK pubsub 1.0"));
            client
        }

        async fn hello(addr: SocketAddr) -> Self {
            let mut client = Self::connect(addr).await;
            client.send("hello 1.0").await;
            assert_eq!(client.next().await.as_deref(), Some("OK 1.0"));
            client
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn next(&mut self) -> Option<String> {
            tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for a line")
                .unwrap()
        }
    }

    async fn start() -> (Gateway, SocketAddr, CancellationToken) {
        let gateway = Gateway::new();
        gateway.declare_topic("live_lyric");
        gateway.declare_topic("now_playing");
        let server = gateway
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(cancel.clone()));
        (gateway, addr, cancel)
    }

    async fn wait_for_subscribers(gateway: &Gateway, count: usize) {
        for _ in 0..100 {
            if gateway.subscriber_count() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} subscribers, have {}", gateway.subscriber_count());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_subscriber_is_dropped_after_the_write_deadline() {
        // The far end is kept open but never read, so writes block once the
        // pipe buffer is full.
        let (server_end, _client_end) = tokio::io::duplex(64);
        let (queue, outgoing) = mpsc::channel(QUEUE_CAPACITY);
        let writer = tokio::spawn(write_frames(server_end, outgoing));
        queue.send("x".repeat(1024)).await.unwrap();

        let began = tokio::time::Instant::now();
        tokio::time::timeout(WRITE_TIMEOUT * 2, writer)
            .await
            .expect("writer still blocked on a stalled subscriber")
            .unwrap();
        assert!(began.elapsed() >= WRITE_TIMEOUT);
        assert!(queue.is_closed());
    }

    #[test]
    fn handshake_rules() {
        assert!(matches!(check_handshake("hello 1.0"), Handshake::Accepted));
        assert!(matches!(check_handshake("hello 1.3"), Handshake::Accepted));
        assert!(matches!(
            check_handshake("hello 2.0"),
            Handshake::Rejected(reply) if reply == "Oops unsupported version 2.0"
        ));
        for bad in ["", "helo 1.0", "hello", "hello 1.0 extra", "\u{1}\u{2}"] {
            assert!(matches!(
                check_handshake(bad),
                Handshake::Rejected(reply) if reply == "Oops malformed handshake"
            ));
        }
    }

    #[tokio::test]
    async fn subscriber_receives_frames_for_its_topics() {
        let (gateway, addr, cancel) = start().await;
        let mut client = Client::hello(addr).await;
        client.send("sub live_lyric").await;
        assert_eq!(client.next().await.as_deref(), Some("OK"));

        assert_eq!(gateway.publish("now_playing", "ignored"), 0);
        assert_eq!(gateway.publish("live_lyric", "la la"), 1);
        assert_eq!(client.next().await.as_deref(), Some("MSG live_lyric 5"));
        assert_eq!(client.next().await.as_deref(), Some("la la"));

        client.send("unsub live_lyric").await;
        assert_eq!(client.next().await.as_deref(), Some("OK"));
        assert_eq!(gateway.publish("live_lyric", "gone"), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn malformed_handshake_does_not_disturb_other_clients() {
        let (gateway, addr, cancel) = start().await;
        let mut good = Client::hello(addr).await;
        good.send("sub now_playing").await;
        assert_eq!(good.next().await.as_deref(), Some("OK"));

        let mut bad = Client::connect(addr).await;
        bad.send("GET / HTTP/1.1").await;
        assert_eq!(bad.next().await.as_deref(), Some("Oops malformed handshake"));
        assert_eq!(bad.next().await, None, "bad client is disconnected");

        assert_eq!(gateway.publish("now_playing", "cadence://x/songs/1"), 1);
        assert_eq!(good.next().await.as_deref(), Some("MSG now_playing 19"));
        assert_eq!(good.next().await.as_deref(), Some("cadence://x/songs/1"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn unsupported_version_is_rejected() {
        let (_gateway, addr, cancel) = start().await;
        let mut client = Client::connect(addr).await;
        client.send("hello 2.0").await;
        assert_eq!(
            client.next().await.as_deref(),
            Some("Oops unsupported version 2.0")
        );
        assert_eq!(client.next().await, None);
        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_commands_keep_the_connection() {
        let (gateway, addr, cancel) = start().await;
        let mut client = Client::hello(addr).await;
        client.send("dance").await;
        assert_eq!(client.next().await.as_deref(), Some("Oops unknown command"));
        client.send("sub lyrics").await;
        assert_eq!(client.next().await.as_deref(), Some("Oops unknown topic lyrics"));
        client.send("topics").await;
        assert_eq!(client.next().await.as_deref(), Some("OK live_lyric now_playing"));

        client.send("quit").await;
        assert_eq!(client.next().await, None);
        wait_for_subscribers(&gateway, 0).await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn abrupt_disconnect_removes_only_that_subscription() {
        let (gateway, addr, cancel) = start().await;
        let mut stays = Client::hello(addr).await;
        stays.send("sub live_lyric").await;
        assert_eq!(stays.next().await.as_deref(), Some("OK"));
        let mut leaves = Client::hello(addr).await;
        leaves.send("sub live_lyric").await;
        assert_eq!(leaves.next().await.as_deref(), Some("OK"));
        wait_for_subscribers(&gateway, 2).await;

        drop(leaves);
        wait_for_subscribers(&gateway, 1).await;
        assert_eq!(gateway.publish("live_lyric", "still here"), 1);
        assert_eq!(stays.next().await.as_deref(), Some("MSG live_lyric 10"));
        cancel.cancel();
    }

    #[test]
    fn full_queue_drops_for_that_subscriber_only() {
        let gateway = Gateway::new();
        gateway.declare_topic("t");
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let slow = gateway.register(peer, slow_tx);
        let fast = gateway.register(peer, fast_tx);
        gateway.subscribe(slow, &["t"]).unwrap();
        gateway.subscribe(fast, &["t"]).unwrap();

        assert_eq!(gateway.publish("t", "one"), 2);
        assert_eq!(gateway.publish("t", "two"), 1);
        assert_eq!(fast_rx.try_recv().unwrap(), "MSG t 3\none\n");
        assert_eq!(fast_rx.try_recv().unwrap(), "MSG t 3\ntwo\n");
        assert_eq!(gateway.subscriber_count(), 2);
    }

    #[test]
    fn closed_queue_removes_subscription() {
        let gateway = Gateway::new();
        gateway.declare_topic("t");
        let (tx, rx) = mpsc::channel(4);
        let id = gateway.register("127.0.0.1:9".parse().unwrap(), tx);
        gateway.subscribe(id, &["t"]).unwrap();
        drop(rx);

        assert_eq!(gateway.publish("t", "x"), 0);
        assert_eq!(gateway.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn overlong_line_closes_connection() {
        let (_gateway, addr, cancel) = start().await;
        let mut client = Client::hello(addr).await;
        let long = format!("{}\n", "x".repeat(MAX_LINE_BYTES + 10));
        // The server may reset the socket before the whole line is written.
        let _ = client.writer.write_all(long.as_bytes()).await;
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            client.lines.get_mut().read_to_end(&mut rest),
        )
        .await
        .expect("connection should close");
        assert!(rest.is_empty());
        cancel.cancel();
    }
}
