use std::sync::Arc;

use tracing::{info, warn};

use tidemark_duplex::DuplexConnection;
use tidemark_protocol::{RegistrationFailureCode, RegistrationRequest};
use tidemark_store::{LogReader, StateRepository, StreamWriter};
use tidemark_types::{ConsumerDefinition, FilterSpec, StreamId};

use crate::consumer::CorrelatorConsumer;
use crate::error::{ProcessorResult, RegistrationError};
use crate::processor::{ProcessorConfig, StreamProcessor};
use crate::registry::ProcessorRegistry;

/// Everything a processor needs besides its consumer.
#[derive(Clone)]
pub struct ProcessorDeps {
    pub log: Arc<dyn LogReader>,
    pub writer: Arc<dyn StreamWriter>,
    pub states: Arc<dyn StateRepository>,
    pub config: ProcessorConfig,
}

/// Serve one consumer connection end to end.
///
/// Handshake, validate and start the consumer's processor, then serve
/// reverse calls until the transport closes; the processor is deregistered
/// when the connection ends. A refused registration is answered with a typed
/// rejection and `Ok(())`; a storage fault during registration ends the
/// connection with the error instead.
pub async fn serve_consumer_connection(
    mut connection: DuplexConnection,
    registry: Arc<ProcessorRegistry>,
    deps: ProcessorDeps,
) -> ProcessorResult<()> {
    let request = connection.handshake().await?;
    let Some(definition) = definition_from(&request) else {
        connection
            .reject(
                RegistrationFailureCode::InvalidRequest,
                "consumer id must not be nil",
            )
            .await?;
        return Ok(());
    };

    let consumer = Arc::new(CorrelatorConsumer::new(connection.correlator()));
    let processor_definition = definition.clone();
    let ProcessorDeps {
        log,
        writer,
        states,
        config,
    } = deps;
    let started = registry
        .register_and_start(definition, move || {
            StreamProcessor::new(processor_definition, consumer, log, writer, states, config)
        })
        .await;

    match started {
        Ok(handle) => {
            let id = handle.id;
            info!(processor = %id, tenant = %request.tenant, "consumer connected");
            let served = connection.accept().await;
            registry.deregister(&id);
            info!(processor = %id, "consumer disconnected");
            served?;
            Ok(())
        }
        Err(RegistrationError::Store(e)) => Err(e.into()),
        Err(refusal) => {
            // failure_code is Some for every non-storage refusal.
            let code = refusal
                .failure_code()
                .unwrap_or(RegistrationFailureCode::InvalidRequest);
            warn!(consumer = %request.consumer, %refusal, "registration refused");
            connection.reject(code, refusal.to_string()).await?;
            Ok(())
        }
    }
}

/// The definition implied by a registration request.
///
/// Each consumer owns the derived stream named by its own id, so the target
/// stream is the consumer id reinterpreted as a stream id. `None` when the
/// request cannot name a target (nil consumer id).
fn definition_from(request: &RegistrationRequest) -> Option<ConsumerDefinition> {
    if request.consumer.is_nil() {
        return None;
    }
    let filter = if request.event_types.is_empty() {
        FilterSpec::PassThrough
    } else {
        FilterSpec::EventTypes(request.event_types.clone())
    };
    Some(ConsumerDefinition {
        scope: request.scope,
        kind: request.kind,
        consumer: request.consumer,
        source_stream: request.source_stream,
        target_stream: StreamId::from_uuid(*request.consumer.as_uuid()),
        partitioned: request.partitioned,
        filter,
    })
}
