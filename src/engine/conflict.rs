use crate::model::*;

use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if !span.is_ordered() {
        return Err(EngineError::InvalidRange("begin is after end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.len() > crate::limits::MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

/// First reservation on the chair overlapping `span`, if any.
pub(crate) fn first_conflict<'a>(cs: &'a ChairState, span: &Span) -> Option<&'a Reservation> {
    cs.overlapping(span).next()
}

pub(crate) fn check_no_conflict(cs: &ChairState, span: &Span) -> Result<(), EngineError> {
    match first_conflict(cs, span) {
        Some(existing) => Err(EngineError::Conflict {
            chair: cs.key,
            existing: existing.id,
        }),
        None => Ok(()),
    }
}
