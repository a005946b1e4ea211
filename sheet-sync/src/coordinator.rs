use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    select,
    sync::{
        Mutex,
        mpsc::{self, error::TrySendError},
        watch,
    },
    time::timeout,
};
use tokio_util::task::{TaskTracker, task_tracker::TrackedFuture};
use tracing::{debug, info, warn};

use crate::{
    connection::{Connection, ConnectionId},
    protocol::{
        CellUpdate, DecodeError, ErrorReply, LookUpRequest, LookUpResponse, Reply, Request,
        UpdateValueRequest,
    },
    store::{CellStore, StoreError, TableConfig},
};

/// Events a coordinator applies one at a time, in arrival order.
///
/// Registration, removal and commands share one queue so a connection is
/// always registered before its first command is applied.
#[derive(Debug)]
enum Event {
    Register(Connection),
    Unregister(ConnectionId),
    Command(Command),
}

/// A decoded request tagged with the connection it came from.
#[derive(Debug)]
pub struct Command {
    pub origin: ConnectionId,
    pub request: Request,
}

impl Command {
    pub fn new(origin: ConnectionId, request: Request) -> Self {
        Self { origin, request }
    }
}

#[derive(Debug, Error)]
#[error("coordinator for table {0:?} has stopped")]
pub struct CoordinatorGone(pub Arc<str>);

/// Cloneable sender side of one table's coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    table: Arc<str>,
    events: mpsc::Sender<Event>,
    viewers: Arc<AtomicUsize>,
    holders: Arc<()>,
}

impl CoordinatorHandle {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Connections the coordinator has registered and not yet dropped.
    pub fn viewer_count(&self) -> usize {
        self.viewers.load(Ordering::Acquire)
    }

    /// True while some clone of this handle exists besides `self`.
    fn is_shared(&self) -> bool {
        Arc::strong_count(&self.holders) > 1
    }

    pub async fn register(&self, connection: Connection) -> Result<(), CoordinatorGone> {
        self.send(Event::Register(connection)).await
    }

    pub async fn unregister(&self, id: ConnectionId) -> Result<(), CoordinatorGone> {
        self.send(Event::Unregister(id)).await
    }

    /// Hands a command to the coordinator, waiting while its queue is full.
    pub async fn submit(&self, command: Command) -> Result<(), CoordinatorGone> {
        self.send(Event::Command(command)).await
    }

    async fn send(&self, event: Event) -> Result<(), CoordinatorGone> {
        self.events
            .send(event)
            .await
            .map_err(|_| CoordinatorGone(Arc::clone(&self.table)))
    }
}

/// Single serialization point for one table.
///
/// Owns the set of connections viewing the table and is the only caller of
/// the store for that table.
pub struct Coordinator {
    table: Arc<str>,
    store: Arc<dyn CellStore>,
    connections: HashMap<ConnectionId, Connection>,
    viewers: Arc<AtomicUsize>,
    events: mpsc::Receiver<Event>,
}

impl Coordinator {
    pub fn new(
        table: impl Into<Arc<str>>,
        store: Arc<dyn CellStore>,
        capacity: usize,
    ) -> (Self, CoordinatorHandle) {
        let table = table.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let viewers = Arc::new(AtomicUsize::new(0));
        let coordinator = Self {
            table: Arc::clone(&table),
            store,
            connections: HashMap::new(),
            viewers: Arc::clone(&viewers),
            events: rx,
        };
        let handle = CoordinatorHandle {
            table,
            events: tx,
            viewers,
            holders: Arc::new(()),
        };
        (coordinator, handle)
    }

    /// Processes events until every handle is dropped or `shutdown` resolves.
    /// Dropping the coordinator closes every remaining outbound queue.
    pub async fn run_until<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(table = %self.table, viewers = self.connections.len(), "coordinator shutting down");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
            }
        }

        self.connections.clear();
        self.viewers.store(0, Ordering::Release);
    }

    pub fn viewer_count(&self) -> usize {
        self.connections.len()
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Register(connection) => self.register(connection),
            Event::Unregister(id) => self.unregister(id),
            Event::Command(command) => self.apply(command),
        }
        self.viewers.store(self.connections.len(), Ordering::Release);
    }

    fn register(&mut self, connection: Connection) {
        info!(table = %self.table, connection = %connection.id(), peer = ?connection.peer(), "joined");
        self.connections.insert(connection.id(), connection);
    }

    fn unregister(&mut self, id: ConnectionId) {
        // Dropping the record drops the only sender, closing the queue.
        if let Some(connection) = self.connections.remove(&id) {
            info!(table = %self.table, connection = %id, peer = ?connection.peer(), "left");
        }
    }

    fn apply(&mut self, command: Command) {
        let Command { origin, request } = command;
        debug!(table = %self.table, connection = %origin, verb = ?request.verb(), "command");

        match request {
            Request::LookUp(request) => self.look_up(origin, &request),
            Request::UpdateValue(request) => self.update_value(origin, request),
            Request::UpdateConfig(payload) => {
                info!(table = %self.table, connection = %origin, %payload, "update-config accepted; no effect");
            }
            Request::Malformed(err) => self.reject_malformed(origin, &err),
        }
    }

    fn look_up(&mut self, origin: ConnectionId, request: &LookUpRequest) {
        let (from, to) = request.bounds();
        let span = (
            clamp_index(from.row),
            clamp_index(from.col),
            clamp_index(to.row),
            clamp_index(to.col),
        );

        let reply = match self
            .store
            .read_range(&self.table, span.0, span.1, span.2, span.3)
        {
            Ok(items) => Reply::LookUp(LookUpResponse { from, to, items }),
            Err(err) => self.store_failure(origin, &err),
        };
        self.deliver(origin, &reply);
    }

    fn update_value(&mut self, origin: ConnectionId, request: UpdateValueRequest) {
        let UpdateValueRequest { value, row, col } = request;

        let written = match (usize::try_from(row), usize::try_from(col)) {
            (Ok(r), Ok(c)) => self.store.write_cell(&self.table, r, c, &value),
            _ => Err(StoreError::Address { row, col }),
        };

        match written {
            Ok(()) => self.broadcast(&Reply::Updated {
                updated: CellUpdate { row, col, value },
            }),
            Err(err) => {
                let reply = self.store_failure(origin, &err);
                self.deliver(origin, &reply);
            }
        }
    }

    fn reject_malformed(&mut self, origin: ConnectionId, err: &DecodeError) {
        debug!(table = %self.table, connection = %origin, error = %err, "rejecting malformed command");
        self.deliver(origin, &Reply::Error(ErrorReply::from(err)));
    }

    fn store_failure(&self, origin: ConnectionId, err: &StoreError) -> Reply {
        if matches!(err, StoreError::Storage(_)) {
            warn!(table = %self.table, connection = %origin, error = %err, "store call failed");
        }
        Reply::Error(ErrorReply::from(err))
    }

    fn deliver(&mut self, id: ConnectionId, reply: &Reply) {
        let Some(frame) = self.encode(reply) else {
            return;
        };
        let Some(connection) = self.connections.get(&id) else {
            debug!(table = %self.table, connection = %id, "reply for unknown connection dropped");
            return;
        };
        if let Err(err) = connection.try_send(frame) {
            self.evict(id, err);
        }
    }

    /// Sends `reply` to every viewer of the table.
    fn broadcast(&mut self, reply: &Reply) {
        let Some(frame) = self.encode(reply) else {
            return;
        };

        let failed: Vec<_> = self
            .connections
            .iter()
            .filter_map(|(id, connection)| connection.try_send(frame.clone()).err().map(|err| (*id, err)))
            .collect();

        for (id, err) in failed {
            self.evict(id, err);
        }
    }

    /// A full queue means the client cannot keep up; it is disconnected
    /// rather than allowed to stall the table.
    fn evict(&mut self, id: ConnectionId, err: TrySendError<String>) {
        match err {
            TrySendError::Full(_) => {
                warn!(table = %self.table, connection = %id, "outbound queue full; disconnecting slow client")
            }
            TrySendError::Closed(_) => {
                debug!(table = %self.table, connection = %id, "outbound queue already closed")
            }
        }
        self.connections.remove(&id);
    }

    fn encode(&self, reply: &Reply) -> Option<String> {
        match reply.encode() {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(table = %self.table, error = ?err, "failed to encode reply");
                None
            }
        }
    }
}

fn clamp_index(value: i64) -> usize {
    usize::try_from(value.max(0)).unwrap_or(usize::MAX)
}

struct HubInner {
    store: Arc<dyn CellStore>,
    tables: Mutex<HashMap<String, CoordinatorHandle>>,
    tasks: TaskTracker,
    shutdown: watch::Sender<bool>,
    event_capacity: usize,
}

/// Owns one coordinator task per open table, started on first use, and
/// tracks every connection pump so shutdown can wait for both.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    pub fn new(store: Arc<dyn CellStore>, event_capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(HubInner {
                store,
                tables: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
                shutdown,
                event_capacity,
            }),
        }
    }

    /// Creates `id` with default dimensions if needed. Runs on the blocking
    /// pool since creation writes every cell.
    pub async fn open_table(&self, id: &str) -> Result<TableConfig, StoreError> {
        let id = id.to_string();
        self.blocking(move |store| store.open_table(&id)).await
    }

    pub async fn table_config(&self, id: &str) -> Result<Option<TableConfig>, StoreError> {
        let id = id.to_string();
        self.blocking(move |store| store.table_config(&id)).await
    }

    async fn blocking<T, F>(&self, call: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn CellStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.inner.store);
        tokio::task::spawn_blocking(move || call(store.as_ref()))
            .await
            .map_err(|err| StoreError::Storage(format!("store task failed: {err}")))?
    }

    /// Returns the coordinator for `table`, spawning it if needed.
    ///
    /// Coordinators of other tables that nobody holds a handle to are
    /// dropped here; their tasks exit once their queue drains.
    pub async fn coordinator(&self, table: &str) -> CoordinatorHandle {
        let mut tables = self.inner.tables.lock().await;

        tables.retain(|name, handle| {
            let keep = name == table || (handle.is_shared() && !handle.is_closed());
            if !keep {
                debug!(table = %name, "idle coordinator released");
            }
            keep
        });

        if let Some(handle) = tables.get(table) {
            if !handle.is_closed() {
                return handle.clone();
            }
        }

        let (coordinator, handle) = Coordinator::new(
            table,
            Arc::clone(&self.inner.store),
            self.inner.event_capacity,
        );
        let mut stop = self.inner.shutdown.subscribe();
        self.inner.tasks.spawn(coordinator.run_until(async move {
            let _ = stop.wait_for(|stopped| *stopped).await;
        }));

        debug!(table, "coordinator started");
        tables.insert(table.to_string(), handle.clone());
        handle
    }

    /// Tables with a live coordinator entry.
    pub async fn open_tables(&self) -> usize {
        self.inner.tables.lock().await.len()
    }

    /// Wraps a connection pump so [`Hub::shutdown`] waits for it.
    pub fn track<F: Future>(&self, pump: F) -> TrackedFuture<F> {
        self.inner.tasks.track_future(pump)
    }

    /// Stops every coordinator, which closes every connection's outbound
    /// queue, and waits up to `grace` for coordinators and pumps to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.send_replace(true);
        self.inner.tables.lock().await.clear();
        self.inner.tasks.close();

        if timeout(grace, self.inner.tasks.wait()).await.is_err() {
            warn!(
                ?grace,
                remaining = self.inner.tasks.len(),
                "connections did not stop within the grace period"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{CellPos, ErrorCode, LookUpRequest},
        store::MemoryStore,
    };

    fn viewer(capacity: usize) -> (Connection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Connection::new(tx, None), rx)
    }

    fn coordinator() -> Coordinator {
        let store = Arc::new(MemoryStore::new());
        store.ensure_table("t", 4, 4).unwrap();
        Coordinator::new("t", store, 8).0
    }

    fn reply(rx: &mut mpsc::Receiver<String>) -> Reply {
        let frame = rx.try_recv().expect("reply queued");
        Reply::decode(&frame).expect("valid reply")
    }

    #[test]
    fn double_unregister_is_a_no_op() {
        let mut coordinator = coordinator();
        let (connection, mut rx) = viewer(4);
        let id = connection.id();

        coordinator.handle_event(Event::Register(connection));
        assert_eq!(coordinator.viewer_count(), 1);

        coordinator.handle_event(Event::Unregister(id));
        coordinator.handle_event(Event::Unregister(id));
        coordinator.handle_event(Event::Unregister(ConnectionId::next()));
        assert_eq!(coordinator.viewer_count(), 0);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn full_queue_disconnects_only_the_slow_viewer() {
        let mut coordinator = coordinator();
        let (slow, mut slow_rx) = viewer(1);
        let (fast, mut fast_rx) = viewer(8);
        let fast_id = fast.id();
        coordinator.handle_event(Event::Register(slow));
        coordinator.handle_event(Event::Register(fast));

        for value in ["a", "b"] {
            coordinator.handle_event(Event::Command(Command::new(
                fast_id,
                Request::UpdateValue(UpdateValueRequest {
                    value: value.into(),
                    row: 0,
                    col: 0,
                }),
            )));
        }

        assert_eq!(coordinator.viewer_count(), 1);
        assert!(matches!(reply(&mut slow_rx), Reply::Updated { .. }));
        assert!(matches!(
            slow_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(matches!(reply(&mut fast_rx), Reply::Updated { .. }));
        assert!(matches!(reply(&mut fast_rx), Reply::Updated { .. }));
    }

    #[test]
    fn malformed_and_config_commands_keep_the_table_usable() {
        let mut coordinator = coordinator();
        let (connection, mut rx) = viewer(8);
        let id = connection.id();
        coordinator.handle_event(Event::Register(connection));

        coordinator.handle_event(Event::Command(Command::new(
            id,
            Request::Malformed(DecodeError::UnknownVerb("paint".into())),
        )));
        match reply(&mut rx) {
            Reply::Error(err) => assert_eq!(err.code, ErrorCode::UnknownVerb),
            other => panic!("unexpected reply: {other:?}"),
        }

        coordinator.handle_event(Event::Command(Command::new(
            id,
            Request::UpdateConfig("{}".into()),
        )));
        assert!(rx.try_recv().is_err());

        coordinator.handle_event(Event::Command(Command::new(
            id,
            Request::LookUp(LookUpRequest {
                from: CellPos::new(3, 3),
                to: CellPos::new(3, 3),
            }),
        )));
        assert_eq!(
            reply(&mut rx),
            Reply::LookUp(LookUpResponse {
                from: CellPos::new(3, 3),
                to: CellPos::new(4, 4),
                items: vec![vec![String::new()]],
            })
        );
        assert_eq!(coordinator.viewer_count(), 1);
    }

    #[test]
    fn negative_write_address_is_rejected() {
        let mut coordinator = coordinator();
        let (connection, mut rx) = viewer(8);
        let id = connection.id();
        coordinator.handle_event(Event::Register(connection));

        coordinator.handle_event(Event::Command(Command::new(
            id,
            Request::UpdateValue(UpdateValueRequest {
                value: "x".into(),
                row: -1,
                col: 0,
            }),
        )));
        match reply(&mut rx) {
            Reply::Error(err) => {
                assert_eq!(err.code, ErrorCode::Address);
                assert_eq!(err.error, "cell (-1, 0) is out of bounds");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn handle_reports_registered_viewers() {
        let store = Arc::new(MemoryStore::new());
        store.ensure_table("t", 4, 4).unwrap();
        let (mut coordinator, handle) = Coordinator::new("t", store, 8);
        let (connection, _rx) = viewer(4);
        let id = connection.id();

        coordinator.handle_event(Event::Register(connection));
        assert_eq!(handle.viewer_count(), 1);
        coordinator.handle_event(Event::Unregister(id));
        assert_eq!(handle.viewer_count(), 0);
    }

    #[tokio::test]
    async fn hub_reuses_and_shuts_down_coordinators() {
        let hub = Hub::new(Arc::new(MemoryStore::new()), 8);
        hub.open_table("t").await.unwrap();

        let first = hub.coordinator("t").await;
        let second = hub.coordinator("t").await;
        assert_eq!(first.table(), "t");

        let (connection, mut rx) = viewer(4);
        first.register(connection).await.unwrap();

        hub.shutdown(Duration::from_secs(1)).await;
        assert!(rx.recv().await.is_none(), "queue closed by shutdown");
        assert!(second.is_closed());
    }

    #[tokio::test]
    async fn unheld_coordinators_are_released_on_next_lookup() {
        let hub = Hub::new(Arc::new(MemoryStore::new()), 8);

        let held = hub.coordinator("held").await;
        drop(hub.coordinator("idle").await);
        assert_eq!(hub.open_tables().await, 2);

        let other = hub.coordinator("other").await;
        assert_eq!(hub.open_tables().await, 2, "idle entry pruned, held entry kept");
        assert!(!held.is_closed());

        let again = hub.coordinator("held").await;
        assert!(held.events.same_channel(&again.events));

        drop((held, again, other));
        hub.shutdown(Duration::from_secs(1)).await;
    }
}
