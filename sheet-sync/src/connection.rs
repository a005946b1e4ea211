//! Per-connection pump.
//!
//! Each viewer gets two tasks: an inbound loop that decodes frames and hands
//! them to the table's coordinator, and an outbound loop that drains the
//! connection's bounded queue onto the transport. Whichever loop stops first
//! tears the connection down; the coordinator is told to forget it, which
//! closes the queue and lets the outbound loop send a close frame.

use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{
    select,
    sync::mpsc::{self, error::TrySendError},
    time::{Instant, MissedTickBehavior, interval_at, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    coordinator::{Command, CoordinatorHandle},
    protocol::decode_frame,
};

/// Time allowed for one transport write.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);
/// Time allowed between inbound frames (pongs included).
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Keepalive interval; kept below [`PONG_WAIT`] so the peer's pong arrives in time.
pub const PING_PERIOD: Duration = Duration::from_secs(54);
pub const OUTBOUND_CAPACITY: usize = 256;
pub const MAX_MESSAGE_SIZE: usize = 512;

#[derive(Debug, Clone)]
pub struct PumpConfig {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub outbound_capacity: usize,
    pub max_message_size: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            write_wait: WRITE_WAIT,
            pong_wait: PONG_WAIT,
            ping_period: PING_PERIOD,
            outbound_capacity: OUTBOUND_CAPACITY,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the coordinator keeps for a registered viewer. It holds the only
/// sender of the outbound queue, so dropping it closes the queue.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::Sender<String>,
}

impl Connection {
    pub fn new(outbound: mpsc::Sender<String>, peer: Option<SocketAddr>) -> Self {
        Self {
            id: ConnectionId::next(),
            peer,
            outbound,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Never waits: a full queue is reported back to the caller.
    pub fn try_send(&self, frame: String) -> Result<(), TrySendError<String>> {
        self.outbound.try_send(frame)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("write failed: {0}")]
    Write(String),
}

/// Registers a new connection with `coordinator` and pumps frames until
/// either direction fails or closes.
pub async fn serve<R, W, E>(
    reader: R,
    writer: W,
    coordinator: CoordinatorHandle,
    peer: Option<SocketAddr>,
    config: PumpConfig,
) where
    R: Stream<Item = Result<Message, E>> + Send + Unpin + 'static,
    E: fmt::Display + Send + 'static,
    W: Sink<Message> + Send + Unpin + 'static,
    W::Error: fmt::Display,
{
    let (tx, rx) = mpsc::channel(config.outbound_capacity.max(1));
    let connection = Connection::new(tx, peer);
    let id = connection.id();

    if let Err(err) = coordinator.register(connection).await {
        warn!(connection = %id, ?peer, error = %err, "refusing connection");
        return;
    }

    let mut outbound = tokio::spawn(write_loop(writer, rx, config.clone()));
    let mut inbound = tokio::spawn(read_loop(reader, coordinator.clone(), id, config.pong_wait));

    select! {
        _ = &mut inbound => {
            let _ = coordinator.unregister(id).await;
            // The closed queue lets the writer send its close frame.
            if timeout(config.write_wait, &mut outbound).await.is_err() {
                outbound.abort();
            }
        }
        _ = &mut outbound => {
            inbound.abort();
            let _ = coordinator.unregister(id).await;
        }
    }

    debug!(table = coordinator.table(), connection = %id, ?peer, "connection closed");
}

async fn read_loop<R, E>(
    mut reader: R,
    coordinator: CoordinatorHandle,
    id: ConnectionId,
    pong_wait: Duration,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let message = match timeout(pong_wait, reader.next()).await {
            Err(_) => {
                info!(connection = %id, "no frame within {pong_wait:?}; dropping connection");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(connection = %id, error = %err, "read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        let Some(request) = decode_frame(&text) else {
            continue;
        };
        if coordinator.submit(Command::new(id, request)).await.is_err() {
            break;
        }
    }
}

async fn write_loop<W>(mut writer: W, mut queue: mpsc::Receiver<String>, config: PumpConfig)
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    let mut ticker = interval_at(Instant::now() + config.ping_period, config.ping_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let result = select! {
            next = queue.recv() => match next {
                Some(frame) => {
                    let batch = coalesce(frame, &mut queue);
                    ticker.reset();
                    send(&mut writer, Message::Text(batch), config.write_wait).await
                }
                None => {
                    // Coordinator closed the queue.
                    let _ = send(&mut writer, Message::Close(None), config.write_wait).await;
                    break;
                }
            },
            _ = ticker.tick() => send(&mut writer, Message::Ping(Vec::new()), config.write_wait).await,
        };

        if let Err(err) = result {
            debug!(error = %err, "write failed");
            break;
        }
    }

    if timeout(config.write_wait, writer.close()).await.is_err() {
        debug!("transport did not close within {:?}", config.write_wait);
    }
}

/// Joins `first` with every frame already waiting, newline separated, so a
/// burst of replies costs one transport write.
fn coalesce(first: String, queue: &mut mpsc::Receiver<String>) -> String {
    let mut batch = first;
    while let Ok(next) = queue.try_recv() {
        batch.push('\n');
        batch.push_str(&next);
    }
    batch
}

async fn send<W>(writer: &mut W, message: Message, wait: Duration) -> Result<(), TransportError>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    match timeout(wait, writer.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(TransportError::Write(err.to_string())),
        Err(_) => Err(TransportError::WriteTimeout(wait)),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        pin::Pin,
        sync::Arc,
        task::{Context, Poll},
    };

    use futures::channel::mpsc as chan;

    use super::*;
    use crate::{
        coordinator::Coordinator,
        protocol::Reply,
        store::{CellStore, MemoryStore},
    };

    /// A transport whose peer stopped reading: no write ever completes.
    struct StalledSink;

    impl Sink<Message> for StalledSink {
        type Error = Infallible;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _: Message) -> Result<(), Infallible> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Pending
        }
    }

    fn quick_config() -> PumpConfig {
        PumpConfig {
            write_wait: Duration::from_millis(200),
            pong_wait: Duration::from_millis(300),
            ping_period: Duration::from_millis(50),
            ..PumpConfig::default()
        }
    }

    #[test]
    fn coalesce_drains_waiting_frames() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.try_send("b".to_string()).unwrap();
        tx.try_send("c".to_string()).unwrap();
        assert_eq!(coalesce("a".to_string(), &mut rx), "a\nb\nc");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn writer_pings_when_idle_and_closes_with_queue() {
        let (sink, mut wire) = chan::unbounded::<Message>();
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(write_loop(sink, rx, quick_config()));

        let first = timeout(Duration::from_secs(1), wire.next()).await.unwrap();
        assert!(matches!(first, Some(Message::Ping(_))));

        tx.send("{}".to_string()).await.unwrap();
        tx.send("[]".to_string()).await.unwrap();
        let mut texts = Vec::new();
        while texts.join("\n") != "{}\n[]" {
            match timeout(Duration::from_secs(1), wire.next()).await.unwrap() {
                Some(Message::Text(text)) => texts.push(text),
                Some(Message::Ping(_)) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        drop(tx);
        loop {
            match timeout(Duration::from_secs(1), wire.next()).await.unwrap() {
                Some(Message::Close(_)) => break,
                Some(Message::Ping(_)) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn round_trip_and_teardown_through_the_coordinator() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_table("t", 10, 10).unwrap();
        let (coordinator, handle) = Coordinator::new("t", store, 8);
        let hub_task = tokio::spawn(coordinator.run_until(std::future::pending()));

        let (client_tx, reader) = chan::unbounded::<Result<Message, Infallible>>();
        let (writer, mut client_rx) = chan::unbounded::<Message>();
        let pump = tokio::spawn(serve(reader, writer, handle.clone(), None, quick_config()));

        client_tx
            .unbounded_send(Ok(Message::Text(
                r#"update-value {"value":"hi","row":2,"col":3}"#.into(),
            )))
            .unwrap();

        let reply = loop {
            match timeout(Duration::from_secs(1), client_rx.next()).await.unwrap() {
                Some(Message::Text(text)) => break Reply::decode(&text).unwrap(),
                Some(Message::Ping(_)) => {}
                other => panic!("unexpected frame: {other:?}"),
            }
        };
        assert!(matches!(reply, Reply::Updated { ref updated } if updated.value == "hi"));

        client_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        timeout(Duration::from_secs(1), pump).await.unwrap().unwrap();

        let mut saw_close = false;
        while let Ok(Some(frame)) = timeout(Duration::from_millis(100), client_rx.next()).await {
            saw_close |= matches!(frame, Message::Close(_));
        }
        assert!(saw_close, "writer sends a close frame after unregister");

        drop(handle);
        timeout(Duration::from_secs(1), hub_task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn silent_peer_is_dropped_after_pong_wait() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_table("t", 1, 1).unwrap();
        let (coordinator, handle) = Coordinator::new("t", store, 8);
        tokio::spawn(coordinator.run_until(std::future::pending()));

        let (_client_tx, reader) = chan::unbounded::<Result<Message, Infallible>>();
        let (writer, _client_rx) = chan::unbounded::<Message>();
        let pump = tokio::spawn(serve(reader, writer, handle, None, quick_config()));

        timeout(Duration::from_secs(2), pump)
            .await
            .expect("pump exits once the read deadline passes")
            .unwrap();
    }

    #[tokio::test]
    async fn stalled_writer_is_dropped_after_write_wait() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_table("t", 1, 1).unwrap();
        let (coordinator, handle) = Coordinator::new("t", store, 8);
        tokio::spawn(coordinator.run_until(std::future::pending()));

        let config = PumpConfig {
            write_wait: Duration::from_millis(100),
            pong_wait: Duration::from_secs(30),
            ping_period: Duration::from_millis(50),
            ..PumpConfig::default()
        };
        // The client keeps its side open, so only the write deadline can end this.
        let (_client_tx, reader) = chan::unbounded::<Result<Message, Infallible>>();
        let pump = tokio::spawn(serve(reader, StalledSink, handle.clone(), None, config));

        timeout(Duration::from_secs(2), pump)
            .await
            .expect("pump exits once a write misses its deadline")
            .unwrap();

        timeout(Duration::from_secs(1), async {
            while handle.viewer_count() != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("connection unregistered");
        assert!(!handle.is_closed());
    }
}
