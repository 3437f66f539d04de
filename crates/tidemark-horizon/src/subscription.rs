use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

use tidemark_processor::{ProcessorResult, StreamProcessor};
use tidemark_store::StateRepository;
use tidemark_types::{ProcessorId, StreamPosition};

use crate::backoff::{Backoff, BackoffConfig};
use crate::buffer::EventBuffer;
use crate::connector::{Consent, HorizonConnection, HorizonConnector, SubscriptionId};

#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Window size of the receive buffer; the producer is backpressured
    /// once the local processor falls this far behind.
    pub buffer_capacity: usize,
    pub backoff: BackoffConfig,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1024,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Where a subscription currently stands. Observable through
/// [`Subscription::state`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Initial,
    Connecting,
    Connected(Consent),
    WaitingToRetry,
    Stopped,
    /// A fault that reconnecting cannot fix, e.g. a corrupt cursor document.
    Failed(String),
}

/// Builds the per-connection processor that consumes the receive buffer.
/// Called once per connection attempt; the processor resumes from the
/// persisted cursor, so a fresh instance per attempt is correct.
pub type ProcessorFactory = Box<dyn Fn(Arc<EventBuffer>) -> StreamProcessor + Send + Sync>;

enum ServeEnd {
    Disconnected,
    Stopped,
    Fatal(String),
}

/// How often a blocked push re-checks the cursor for trimmable events.
const TRIM_INTERVAL: Duration = Duration::from_millis(25);

/// One event-horizon subscription, driven to stay connected.
///
/// Each attempt reloads the persisted cursor, connects from its position,
/// and runs a processor over the received events; any disconnect tears the
/// attempt down and reconnects with backoff from wherever the cursor then
/// is. Since the resume position is re-read per attempt, no event is lost
/// or skipped across reconnects, and re-deliveries are absorbed by the
/// idempotent target writes.
pub struct Subscription {
    id: SubscriptionId,
    connector: Arc<dyn HorizonConnector>,
    states: Arc<dyn StateRepository>,
    processor_id: ProcessorId,
    factory: ProcessorFactory,
    config: SubscriptionConfig,
    state_tx: watch::Sender<SubscriptionState>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        connector: Arc<dyn HorizonConnector>,
        states: Arc<dyn StateRepository>,
        processor_id: ProcessorId,
        factory: ProcessorFactory,
        config: SubscriptionConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SubscriptionState::Initial);
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            connector,
            states,
            processor_id,
            factory,
            config,
            state_tx,
            stop_tx,
            task: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &SubscriptionId {
        &self.id
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<SubscriptionState> {
        self.state_tx.subscribe()
    }

    /// Start driving the subscription. Idempotent: returns false if it is
    /// already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock().expect("lock poisoned");
        if task.is_some() {
            return false;
        }
        let subscription = Arc::clone(self);
        let stop = self.stop_tx.subscribe();
        *task = Some(tokio::spawn(async move {
            subscription.run(stop).await;
        }));
        true
    }

    /// Ask the loop to stop. The state reaches `Stopped` once the current
    /// attempt has been torn down.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn set_state(&self, state: SubscriptionState) {
        self.state_tx.send_replace(state);
    }

    async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        loop {
            if *stop.borrow() {
                break;
            }
            self.set_state(SubscriptionState::Connecting);
            let cursor = match self.states.try_get(&self.processor_id).await {
                Ok(state) => state.unwrap_or_default(),
                Err(e) => {
                    self.set_state(SubscriptionState::Failed(e.to_string()));
                    return;
                }
            };
            // Resume from the earliest position any failing partition is
            // stuck at, not the frontier: everything at or after it must be
            // re-delivered so catch-up can replay it. The idempotent target
            // writes absorb events that were already handled.
            let from = cursor.earliest_position().stream;
            match self.connector.connect(&self.id, from).await {
                Ok(connection) => {
                    backoff.reset();
                    info!(
                        subscription = %self.id,
                        consent = %connection.consent,
                        %from,
                        "subscription connected"
                    );
                    self.set_state(SubscriptionState::Connected(connection.consent));
                    match self.serve(connection, from, &mut stop).await {
                        ServeEnd::Disconnected => {
                            warn!(subscription = %self.id, "producer disconnected")
                        }
                        ServeEnd::Stopped => break,
                        ServeEnd::Fatal(reason) => {
                            self.set_state(SubscriptionState::Failed(reason));
                            return;
                        }
                    }
                }
                Err(e) => {
                    warn!(subscription = %self.id, error = %e, "connect failed");
                }
            }
            if *stop.borrow() {
                break;
            }
            self.set_state(SubscriptionState::WaitingToRetry);
            tokio::select! {
                _ = stop.changed() => {}
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
        self.set_state(SubscriptionState::Stopped);
    }

    /// Drain one connection into the buffer while the processor consumes it.
    async fn serve(
        &self,
        connection: HorizonConnection,
        from: StreamPosition,
        stop: &mut watch::Receiver<bool>,
    ) -> ServeEnd {
        // The buffer window starts where the producer was asked to resume.
        let buffer = Arc::new(EventBuffer::new(
            self.id.stream,
            from,
            self.config.buffer_capacity,
        ));
        let processor = (self.factory)(Arc::clone(&buffer));
        let (processor_stop, processor_stop_rx) = watch::channel(false);
        let mut processor_task = tokio::spawn(async move { processor.run(processor_stop_rx).await });

        let mut events = connection.events;
        let end = 'drain: loop {
            tokio::select! {
                received = events.recv() => match received {
                    Some(event) => {
                        // A full window blocks the push while the processor
                        // keeps advancing the cursor underneath it, so trim
                        // periodically until the push lands; a processor
                        // fault or a stop request must still cut through.
                        let mut push = std::pin::pin!(buffer.push(event));
                        loop {
                            tokio::select! {
                                _ = &mut push => break,
                                _ = tokio::time::sleep(TRIM_INTERVAL) => {
                                    self.maybe_trim(&buffer).await;
                                }
                                finished = &mut processor_task => {
                                    return processor_ended(finished);
                                }
                                _ = stop.changed() => break 'drain ServeEnd::Stopped,
                            }
                        }
                        self.maybe_trim(&buffer).await;
                    }
                    None => break ServeEnd::Disconnected,
                },
                finished = &mut processor_task => return processor_ended(finished),
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break ServeEnd::Stopped;
                    }
                }
            }
        };

        let _ = processor_stop.send(true);
        match processor_task.await {
            Ok(Ok(())) => end,
            Ok(Err(e)) => ServeEnd::Fatal(e.to_string()),
            Err(_) => ServeEnd::Fatal("processor task halted".into()),
        }
    }

    /// Free buffered events the cursor can no longer reach, once the window
    /// is at least half full.
    async fn maybe_trim(&self, buffer: &EventBuffer) {
        if buffer.len() * 2 < self.config.buffer_capacity {
            return;
        }
        if let Ok(Some(state)) = self.states.try_get(&self.processor_id).await {
            buffer.trim_below(state.earliest_position().stream);
        }
    }
}

/// The processor never returns on its own while the connection is up, so a
/// clean exit is treated as a disconnect.
fn processor_ended(finished: Result<ProcessorResult<()>, JoinError>) -> ServeEnd {
    match finished {
        Ok(Ok(())) => ServeEnd::Disconnected,
        Ok(Err(e)) => ServeEnd::Fatal(e.to_string()),
        Err(_) => ServeEnd::Fatal("processor task halted".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::mpsc;

    use tidemark_processor::{ConsumerResponse, EventConsumer, ProcessorConfig};
    use tidemark_store::{InMemoryEventLog, InMemoryStateRepository};
    use tidemark_types::{
        CommittedEvent, ConsumerDefinition, ConsumerId, ConsumerKind, EventLogPosition,
        EventTypeId, FilterSpec, MicroserviceId, PartitionKey, ScopeId, StreamEvent, StreamId,
        StreamPosition, TenantId,
    };

    use crate::error::{HorizonError, HorizonResult};

    struct IncludeAll;

    #[async_trait]
    impl EventConsumer for IncludeAll {
        async fn process(
            &self,
            _event: &StreamEvent,
            _retry: Option<tidemark_protocol::RetryState>,
        ) -> ConsumerResponse {
            ConsumerResponse::Succeeded { include: true }
        }
    }

    /// Fails the event at position 0 until healed, then succeeds everything.
    struct FailingHead {
        healed: AtomicBool,
    }

    impl FailingHead {
        fn new() -> Self {
            Self {
                healed: AtomicBool::new(false),
            }
        }

        fn heal(&self) {
            self.healed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EventConsumer for FailingHead {
        async fn process(
            &self,
            event: &StreamEvent,
            _retry: Option<tidemark_protocol::RetryState>,
        ) -> ConsumerResponse {
            if event.stream_position.value() == 0 && !self.healed.load(Ordering::SeqCst) {
                ConsumerResponse::failed("head failing", Duration::from_millis(20))
            } else {
                ConsumerResponse::Succeeded { include: true }
            }
        }
    }

    /// Succeeds everything, slower than the producer delivers.
    struct SlowConsumer {
        delay: Duration,
    }

    #[async_trait]
    impl EventConsumer for SlowConsumer {
        async fn process(
            &self,
            _event: &StreamEvent,
            _retry: Option<tidemark_protocol::RetryState>,
        ) -> ConsumerResponse {
            tokio::time::sleep(self.delay).await;
            ConsumerResponse::Succeeded { include: true }
        }
    }

    /// Serves a fixed sequence of `total` events, always resuming from the
    /// requested position like a real producer. Each scripted entry in
    /// `drops_after` caps how many events one attempt delivers before the
    /// channel closes; attempts beyond the script deliver everything and
    /// stay open.
    struct ScriptedConnector {
        stream: StreamId,
        total: u64,
        drops_after: Mutex<VecDeque<u64>>,
        connects: Mutex<Vec<StreamPosition>>,
        refusals: AtomicUsize,
        open: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
    }

    impl ScriptedConnector {
        fn new(stream: StreamId, total: u64, drops_after: Vec<u64>, refusals: usize) -> Self {
            Self {
                stream,
                total,
                drops_after: Mutex::new(drops_after.into()),
                connects: Mutex::new(Vec::new()),
                refusals: AtomicUsize::new(refusals),
                open: Mutex::new(Vec::new()),
            }
        }

        fn connects(&self) -> Vec<StreamPosition> {
            self.connects.lock().unwrap().clone()
        }

        /// Drop every open connection, as a producer going away would.
        fn drop_open(&self) {
            self.open.lock().unwrap().clear();
        }

        fn event(&self, position: u64) -> StreamEvent {
            StreamEvent {
                event: CommittedEvent {
                    event_log_position: EventLogPosition::new(position),
                    occurred: Utc::now(),
                    event_type: EventTypeId::nil(),
                    tenant: TenantId::nil(),
                    partition: PartitionKey::new("p"),
                    public: true,
                    payload: serde_json::json!({ "n": position }),
                },
                stream: self.stream,
                stream_position: StreamPosition::new(position),
                partition: PartitionKey::new("p"),
            }
        }
    }

    #[async_trait]
    impl HorizonConnector for ScriptedConnector {
        async fn connect(
            &self,
            _subscription: &SubscriptionId,
            from: StreamPosition,
        ) -> HorizonResult<HorizonConnection> {
            if self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(HorizonError::Connect("producer unavailable".into()));
            }
            self.connects.lock().unwrap().push(from);
            let limit = self.drops_after.lock().unwrap().pop_front();
            let start = from.value();
            let end = match limit {
                Some(n) => (start + n).min(self.total),
                None => self.total,
            };
            let (tx, rx) = mpsc::channel(32);
            for position in start..end {
                tx.send(self.event(position)).await.expect("receiver alive");
            }
            if limit.is_none() {
                // Keep the connection open.
                self.open.lock().unwrap().push(tx);
            }
            Ok(HorizonConnection {
                consent: Consent::new(),
                events: rx,
            })
        }
    }

    struct Harness {
        subscription: Arc<Subscription>,
        connector: Arc<ScriptedConnector>,
        log: Arc<InMemoryEventLog>,
        states: Arc<InMemoryStateRepository>,
        target: StreamId,
        processor_id: ProcessorId,
    }

    impl Harness {
        fn new(total: u64, drops_after: Vec<u64>, refusals: usize) -> Self {
            Self::with_consumer(total, drops_after, refusals, 16, Arc::new(IncludeAll))
        }

        fn with_consumer(
            total: u64,
            drops_after: Vec<u64>,
            refusals: usize,
            buffer_capacity: usize,
            consumer: Arc<dyn EventConsumer>,
        ) -> Self {
            let stream = StreamId::new();
            let target = StreamId::new();
            let id = SubscriptionId {
                producer_microservice: MicroserviceId::new(),
                producer_tenant: TenantId::new(),
                subscriber_tenant: TenantId::new(),
                scope: ScopeId::nil(),
                stream,
            };
            let connector = Arc::new(ScriptedConnector::new(stream, total, drops_after, refusals));
            let log = Arc::new(InMemoryEventLog::new());
            let states = Arc::new(InMemoryStateRepository::new());
            let definition = ConsumerDefinition {
                scope: id.scope,
                kind: ConsumerKind::EventHandler,
                consumer: ConsumerId::new(),
                source_stream: stream,
                target_stream: target,
                partitioned: false,
                filter: FilterSpec::PassThrough,
            };
            let processor_id = definition.processor_id();
            let factory: ProcessorFactory = {
                let log = log.clone();
                let states = states.clone();
                Box::new(move |buffer| {
                    StreamProcessor::new(
                        definition.clone(),
                        consumer.clone(),
                        buffer,
                        log.clone(),
                        states.clone(),
                        ProcessorConfig {
                            poll_interval: Duration::from_millis(5),
                        },
                    )
                })
            };
            let subscription = Subscription::new(
                id,
                connector.clone(),
                states.clone(),
                processor_id,
                factory,
                SubscriptionConfig {
                    buffer_capacity,
                    backoff: BackoffConfig {
                        initial: Duration::from_millis(10),
                        cap: Duration::from_millis(40),
                    },
                },
            );
            Self {
                subscription,
                connector,
                log,
                states,
                target,
                processor_id,
            }
        }

        async fn wait_for_target(&self, len: usize) {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            while self.log.len(self.target) < len {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "timed out waiting for {len} target events"
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn stop_and_wait(&self) {
            self.subscription.stop();
            let mut state = self.subscription.state();
            let stopped = state.wait_for(|s| *s == SubscriptionState::Stopped);
            tokio::time::timeout(Duration::from_secs(2), stopped)
                .await
                .expect("stop timed out")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let harness = Harness::new(2, vec![], 0);
        assert!(harness.subscription.start());
        assert!(!harness.subscription.start());

        harness.wait_for_target(2).await;
        assert_eq!(harness.connector.connects(), vec![StreamPosition::new(0)]);
        harness.stop_and_wait().await;
    }

    #[tokio::test]
    async fn reconnects_and_resumes_from_the_cursor() {
        // The first connection delivers two events and drops; the second
        // resumes from wherever the cursor then is and stays up.
        let harness = Harness::new(3, vec![2], 0);
        harness.subscription.start();

        harness.wait_for_target(3).await;
        let connects = harness.connector.connects();
        assert_eq!(connects.len(), 2);
        assert_eq!(connects[0], StreamPosition::new(0));
        // The processor had seen at most the two delivered events.
        assert!(connects[1].value() <= 2);
        let positions: Vec<u64> = harness
            .log
            .events(harness.target)
            .iter()
            .map(|e| e.event.event_log_position.value())
            .collect();
        assert_eq!(positions, vec![0, 1, 2]);

        let state = harness
            .states
            .try_get(&harness.processor_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.position().stream.value(), 3);
        assert!(matches!(
            &*harness.subscription.state().borrow(),
            SubscriptionState::Connected(_)
        ));
        harness.stop_and_wait().await;
    }

    #[tokio::test]
    async fn reconnect_redelivers_a_stuck_partitions_events() {
        // Position 0 keeps failing while 1 and 2 are deferred behind it,
        // then the producer goes away at frontier 3. The reconnect must ask
        // for the stuck position, not the frontier, or the deferred events
        // can never be replayed.
        let consumer = Arc::new(FailingHead::new());
        let harness = Harness::with_consumer(3, vec![], 0, 16, consumer.clone());
        harness.subscription.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(state) = harness.states.try_get(&harness.processor_id).await.unwrap() {
                if state.position().stream.value() == 3 {
                    break;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "frontier never reached 3"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        harness.connector.drop_open();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while harness.connector.connects().len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "no reconnect");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        consumer.heal();

        harness.wait_for_target(3).await;
        let connects = harness.connector.connects();
        assert_eq!(connects[1], StreamPosition::new(0));
        let positions: Vec<u64> = harness
            .log
            .events(harness.target)
            .iter()
            .map(|e| e.event.event_log_position.value())
            .collect();
        assert_eq!(positions, vec![0, 1, 2]);
        harness.stop_and_wait().await;
    }

    #[tokio::test]
    async fn full_window_keeps_flowing_as_the_cursor_advances() {
        // The producer runs a long way ahead of a slow consumer; a blocked
        // push must not stop trimming, or the subscription wedges once the
        // window fills.
        let consumer = Arc::new(SlowConsumer {
            delay: Duration::from_millis(5),
        });
        let harness = Harness::with_consumer(12, vec![], 0, 4, consumer);
        harness.subscription.start();

        harness.wait_for_target(12).await;
        let positions: Vec<u64> = harness
            .log
            .events(harness.target)
            .iter()
            .map(|e| e.event.event_log_position.value())
            .collect();
        assert_eq!(positions, (0..12).collect::<Vec<u64>>());
        harness.stop_and_wait().await;
    }

    #[tokio::test]
    async fn retries_a_refusing_producer_with_backoff() {
        let harness = Harness::new(1, vec![], 2);
        harness.subscription.start();

        harness.wait_for_target(1).await;
        // Two refusals, then one accepted connect.
        assert_eq!(harness.connector.connects(), vec![StreamPosition::new(0)]);
        harness.stop_and_wait().await;
    }

    #[tokio::test]
    async fn corrupt_cursor_fails_the_subscription() {
        let harness = Harness::new(1, vec![], 0);
        harness.states.insert_raw(
            harness.processor_id,
            serde_json::json!({ "position": "not-a-position" }),
        );
        harness.subscription.start();

        let mut state = harness.subscription.state();
        let failed = state.wait_for(|s| matches!(s, SubscriptionState::Failed(_)));
        tokio::time::timeout(Duration::from_secs(2), failed)
            .await
            .expect("no failure observed")
            .unwrap();
    }
}
