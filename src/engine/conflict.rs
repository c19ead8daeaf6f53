use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

/// A range is usable only when it starts strictly before it ends.
pub fn validate_range(start: Ms, end: Ms) -> bool {
    start < end
}

/// Range precondition plus the engine's timestamp limits.
pub(crate) fn checked_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if !validate_range(start, end) {
        return Err(EngineError::InvalidRange { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(Span::new(start, end))
}

/// First qualifying record in `scope` that overlaps `span`, skipping
/// `exclude` (the record being updated). Deleted records are never indexed.
pub fn find_conflict<'a>(
    scope: &'a ScopeState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Interval> {
    scope
        .overlapping(span)
        .filter(|i| Some(i.id) != exclude)
        .find(|i| i.qualifies())
}

pub(crate) fn check_no_conflict(
    scope: &ScopeState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(scope, span, exclude) {
        Some(existing) => {
            metrics::counter!(crate::observability::OVERLAP_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict {
                scope: scope.key,
                existing: existing.id,
            })
        }
        None => Ok(()),
    }
}
