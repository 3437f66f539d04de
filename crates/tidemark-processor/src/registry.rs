use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use tidemark_store::{DefinitionRepository, StateRepository};
use tidemark_types::{ConsumerDefinition, ProcessorId, StreamId};

use crate::error::{ProcessorError, ProcessorResult, RegistrationError};
use crate::processor::StreamProcessor;
use crate::validation;

/// A started processor. Dropping the handle detaches the task; the registry
/// keeps tracking it either way.
#[derive(Debug)]
pub struct ProcessorHandle {
    pub id: ProcessorId,
    task: JoinHandle<ProcessorResult<()>>,
}

impl ProcessorHandle {
    /// Wait for the processor to stop and surface its result.
    pub async fn wait(self) -> ProcessorResult<()> {
        self.task.await.map_err(|_| ProcessorError::Halted)?
    }
}

/// Tracks the active processors and enforces at most one per [`ProcessorId`].
///
/// Registration validates the definition against what was persisted for the
/// consumer's target stream, persists it, and spawns the processor. A
/// processor that stops for any reason removes itself from the active set.
pub struct ProcessorRegistry {
    definitions: Arc<dyn DefinitionRepository>,
    states: Arc<dyn StateRepository>,
    active: Mutex<HashMap<ProcessorId, watch::Sender<bool>>>,
}

impl ProcessorRegistry {
    pub fn new(
        definitions: Arc<dyn DefinitionRepository>,
        states: Arc<dyn StateRepository>,
    ) -> Arc<Self> {
        Arc::new(Self {
            definitions,
            states,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Validate, persist, and start a processor for `definition`.
    ///
    /// The active slot is reserved before the asynchronous validation, so two
    /// concurrent registrations of the same consumer cannot both pass.
    pub async fn register_and_start<F>(
        self: &Arc<Self>,
        definition: ConsumerDefinition,
        make_processor: F,
    ) -> Result<ProcessorHandle, RegistrationError>
    where
        F: FnOnce() -> StreamProcessor,
    {
        if definition.target_stream == StreamId::event_log()
            || definition.target_stream == definition.source_stream
        {
            return Err(RegistrationError::NonWriteableTarget(
                definition.target_stream,
            ));
        }
        let id = definition.processor_id();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut active = self.active.lock().expect("lock poisoned");
            if active.contains_key(&id) {
                return Err(RegistrationError::AlreadyRegistered(id));
            }
            active.insert(id, shutdown_tx);
        }

        if let Err(refusal) = self.validate_and_persist(&definition).await {
            self.active.lock().expect("lock poisoned").remove(&id);
            return Err(refusal);
        }

        let processor = make_processor();
        let registry = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = processor.run(shutdown_rx).await;
            if let Err(err) = &result {
                error!(processor = %id, error = %err, "processor stopped with error");
            }
            registry.active.lock().expect("lock poisoned").remove(&id);
            result
        });
        info!(processor = %id, "processor registered");
        Ok(ProcessorHandle { id, task })
    }

    async fn validate_and_persist(
        &self,
        definition: &ConsumerDefinition,
    ) -> Result<(), RegistrationError> {
        let persisted = self
            .definitions
            .try_get(definition.scope, definition.target_stream)
            .await?;
        if let Some(persisted) = persisted {
            // The progress that matters is the persisted definition's: a new
            // definition with a different source stream has a fresh id and
            // would always look like it was at the origin.
            let state = self
                .states
                .try_get(&persisted.processor_id())
                .await?
                .unwrap_or_default();
            validation::validate_definition_change(definition, &persisted, &state)?;
        }
        self.definitions.save(definition).await?;
        Ok(())
    }

    /// Stop and remove the processor for `id`. Returns whether one was
    /// active.
    pub fn deregister(&self, id: &ProcessorId) -> bool {
        let sender = self.active.lock().expect("lock poisoned").remove(id);
        match sender {
            Some(shutdown) => {
                // The task may already be gone; the signal is best-effort.
                let _ = shutdown.send(true);
                info!(processor = %id, "processor deregistered");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, id: &ProcessorId) -> bool {
        self.active.lock().expect("lock poisoned").contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;

    use chrono::Utc;

    use tidemark_cursor::{CursorState, ProcessingResult};
    use tidemark_protocol::RetryState;
    use tidemark_store::{
        InMemoryDefinitionRepository, InMemoryEventLog, InMemoryStateRepository,
    };
    use tidemark_types::{
        CommittedEvent, ConsumerId, ConsumerKind, EventLogPosition, EventTypeId, FilterSpec,
        PartitionKey, ScopeId, StreamEvent, StreamPosition, TenantId,
    };

    use crate::consumer::{ConsumerResponse, EventConsumer};
    use crate::processor::ProcessorConfig;

    struct NoopConsumer;

    #[async_trait]
    impl EventConsumer for NoopConsumer {
        async fn process(
            &self,
            _event: &StreamEvent,
            _retry: Option<RetryState>,
        ) -> ConsumerResponse {
            ConsumerResponse::Succeeded { include: false }
        }
    }

    struct Fixture {
        log: Arc<InMemoryEventLog>,
        states: Arc<InMemoryStateRepository>,
        definitions: Arc<InMemoryDefinitionRepository>,
        registry: Arc<ProcessorRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            let log = Arc::new(InMemoryEventLog::new());
            let states = Arc::new(InMemoryStateRepository::new());
            let definitions = Arc::new(InMemoryDefinitionRepository::new());
            let registry = ProcessorRegistry::new(definitions.clone(), states.clone());
            Self {
                log,
                states,
                definitions,
                registry,
            }
        }

        fn definition(&self) -> ConsumerDefinition {
            ConsumerDefinition {
                scope: ScopeId::nil(),
                kind: ConsumerKind::EventHandler,
                consumer: ConsumerId::new(),
                source_stream: StreamId::new(),
                target_stream: StreamId::new(),
                partitioned: true,
                filter: FilterSpec::PassThrough,
            }
        }

        async fn register(
            &self,
            definition: ConsumerDefinition,
        ) -> Result<ProcessorHandle, RegistrationError> {
            let processor_definition = definition.clone();
            let log = self.log.clone();
            let states = self.states.clone();
            self.registry
                .register_and_start(definition, move || {
                    StreamProcessor::new(
                        processor_definition,
                        Arc::new(NoopConsumer),
                        log.clone(),
                        log,
                        states,
                        ProcessorConfig {
                            poll_interval: Duration::from_millis(5),
                        },
                    )
                })
                .await
        }
    }

    #[tokio::test]
    async fn rejects_the_event_log_as_target() {
        let fixture = Fixture::new();
        let mut definition = fixture.definition();
        definition.target_stream = StreamId::event_log();
        let err = fixture.register(definition).await.unwrap_err();
        assert!(matches!(err, RegistrationError::NonWriteableTarget(_)));
    }

    #[tokio::test]
    async fn rejects_the_source_as_target() {
        let fixture = Fixture::new();
        let mut definition = fixture.definition();
        definition.target_stream = definition.source_stream;
        let err = fixture.register(definition).await.unwrap_err();
        assert!(matches!(err, RegistrationError::NonWriteableTarget(_)));
    }

    #[tokio::test]
    async fn one_active_processor_per_id() {
        let fixture = Fixture::new();
        let definition = fixture.definition();
        let id = definition.processor_id();

        let handle = fixture.register(definition.clone()).await.unwrap();
        assert!(fixture.registry.is_active(&id));

        let err = fixture.register(definition.clone()).await.unwrap_err();
        assert!(matches!(err, RegistrationError::AlreadyRegistered(_)));

        assert!(fixture.registry.deregister(&id));
        handle.wait().await.unwrap();
        assert!(!fixture.registry.is_active(&id));

        // The slot is free again.
        let handle = fixture.register(definition).await.unwrap();
        fixture.registry.deregister(&handle.id);
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn registration_persists_the_definition() {
        let fixture = Fixture::new();
        let definition = fixture.definition();
        let handle = fixture.register(definition.clone()).await.unwrap();

        let persisted = fixture
            .definitions
            .try_get(definition.scope, definition.target_stream)
            .await
            .unwrap();
        assert_eq!(persisted, Some(definition));

        fixture.registry.deregister(&handle.id);
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn changed_definition_supersedes_at_origin() {
        let fixture = Fixture::new();
        let definition = fixture.definition();
        let handle = fixture.register(definition.clone()).await.unwrap();
        fixture.registry.deregister(&handle.id);
        handle.wait().await.unwrap();

        let mut changed = definition.clone();
        changed.partitioned = false;
        let handle = fixture.register(changed.clone()).await.unwrap();

        let persisted = fixture
            .definitions
            .try_get(definition.scope, definition.target_stream)
            .await
            .unwrap();
        assert_eq!(persisted, Some(changed));

        fixture.registry.deregister(&handle.id);
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn changed_definition_is_rejected_past_origin() {
        let fixture = Fixture::new();
        let definition = fixture.definition();
        let id = definition.processor_id();

        // Let the processor commit some progress before reconnecting.
        fixture.log.append(
            definition.source_stream,
            CommittedEvent {
                event_log_position: EventLogPosition::new(0),
                occurred: Utc::now(),
                event_type: EventTypeId::nil(),
                tenant: TenantId::nil(),
                partition: PartitionKey::new("p"),
                public: false,
                payload: serde_json::json!({}),
            },
        );
        let handle = fixture.register(definition.clone()).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(state) = fixture.states.try_get(&id).await.unwrap() {
                if !state.position().is_origin() {
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "no progress");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        fixture.registry.deregister(&id);
        handle.wait().await.unwrap();

        let mut changed = definition;
        changed.partitioned = false;
        let err = fixture.register(changed).await.unwrap_err();
        assert!(matches!(err, RegistrationError::DefinitionChanged(_)));
    }

    #[tokio::test]
    async fn changed_source_stream_is_rejected_past_origin() {
        let fixture = Fixture::new();
        let definition = fixture.definition();
        let id = definition.processor_id();

        fixture.log.append(
            definition.source_stream,
            CommittedEvent {
                event_log_position: EventLogPosition::new(0),
                occurred: Utc::now(),
                event_type: EventTypeId::nil(),
                tenant: TenantId::nil(),
                partition: PartitionKey::new("p"),
                public: false,
                payload: serde_json::json!({}),
            },
        );
        let handle = fixture.register(definition.clone()).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(state) = fixture.states.try_get(&id).await.unwrap() {
                if !state.position().is_origin() {
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "no progress");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        fixture.registry.deregister(&id);
        handle.wait().await.unwrap();

        // A different source names a fresh ProcessorId with no state of its
        // own; the persisted definition's progress still forbids the change.
        let mut changed = definition;
        changed.source_stream = StreamId::new();
        let err = fixture.register(changed).await.unwrap_err();
        assert!(matches!(err, RegistrationError::DefinitionChanged(_)));
    }

    #[tokio::test]
    async fn failed_validation_frees_the_slot() {
        let fixture = Fixture::new();
        let definition = fixture.definition();
        let id = definition.processor_id();

        // Persist an incompatible definition with progress behind it.
        let mut other = definition.clone();
        other.partitioned = false;
        fixture.definitions.save(&other).await.unwrap();
        fixture
            .states
            .insert_raw(id, serde_json::to_value(advanced()).unwrap());

        let err = fixture.register(definition.clone()).await.unwrap_err();
        assert!(matches!(err, RegistrationError::DefinitionChanged(_)));
        assert!(!fixture.registry.is_active(&id));
    }

    fn advanced() -> CursorState {
        let event = StreamEvent {
            event: CommittedEvent {
                event_log_position: EventLogPosition::new(0),
                occurred: Utc::now(),
                event_type: EventTypeId::nil(),
                tenant: TenantId::nil(),
                partition: PartitionKey::new("p"),
                public: false,
                payload: serde_json::json!({}),
            },
            stream: StreamId::nil(),
            stream_position: StreamPosition::new(0),
            partition: PartitionKey::new("p"),
        };
        CursorState::new().with_result(
            &ProcessingResult::Succeeded,
            &event,
            &PartitionKey::new("p"),
            Utc::now(),
        )
    }
}
