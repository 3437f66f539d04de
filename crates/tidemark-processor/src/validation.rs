//! Re-registration validation.
//!
//! A consumer may reconnect with a different definition only while its
//! cursor is still at the origin; once events have been processed the
//! derived stream exists and a changed definition would re-derive it. Each
//! [`FilterSpec`] variant has its own validator, resolved by explicit match.

use tidemark_cursor::CursorState;
use tidemark_types::{ConsumerDefinition, FilterSpec};

use crate::error::RegistrationError;

pub(crate) fn validate_definition_change(
    new: &ConsumerDefinition,
    persisted: &ConsumerDefinition,
    state: &CursorState,
) -> Result<(), RegistrationError> {
    let validator: &dyn DefinitionValidator = match new.filter {
        FilterSpec::PassThrough => &PassThroughValidator,
        FilterSpec::EventTypes(_) => &EventTypeValidator,
    };
    validator.validate(new, persisted, state)
}

trait DefinitionValidator {
    fn validate(
        &self,
        new: &ConsumerDefinition,
        persisted: &ConsumerDefinition,
        state: &CursorState,
    ) -> Result<(), RegistrationError>;
}

struct PassThroughValidator;

impl DefinitionValidator for PassThroughValidator {
    fn validate(
        &self,
        new: &ConsumerDefinition,
        persisted: &ConsumerDefinition,
        state: &CursorState,
    ) -> Result<(), RegistrationError> {
        if state.position().is_origin() || new.same_semantics(persisted) {
            Ok(())
        } else {
            Err(RegistrationError::DefinitionChanged(new.processor_id()))
        }
    }
}

struct EventTypeValidator;

impl DefinitionValidator for EventTypeValidator {
    fn validate(
        &self,
        new: &ConsumerDefinition,
        persisted: &ConsumerDefinition,
        state: &CursorState,
    ) -> Result<(), RegistrationError> {
        if state.position().is_origin() {
            return Ok(());
        }
        // A changed type set re-derives the stream even when everything else
        // matches: events of a newly added type were skipped, not filtered.
        let unchanged = new.source_stream == persisted.source_stream
            && new.target_stream == persisted.target_stream
            && new.partitioned == persisted.partitioned
            && new.filter == persisted.filter;
        if unchanged {
            Ok(())
        } else {
            Err(RegistrationError::DefinitionChanged(new.processor_id()))
        }
    }
}
