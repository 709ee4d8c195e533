//! Scheduling turn span helpers.

use std::path::Path;
use tracing::Span;

/// Start a span covering one scheduling turn.
///
/// The `turn.outcome` and `turn.submitted` fields are declared empty and
/// filled in by [`record_turn_result`].
pub fn start_turn_span(owner: &str, queue_dir: &Path) -> Span {
    tracing::info_span!(
        "cascade.turn",
        "turn.owner" = owner,
        "turn.queue_dir" = %queue_dir.display(),
        "turn.outcome" = tracing::field::Empty,
        "turn.submitted" = tracing::field::Empty,
    )
}

/// Record how the turn ended on its span.
pub fn record_turn_result(span: &Span, outcome: &str, submitted: usize) {
    span.record("turn.outcome", outcome);
    span.record("turn.submitted", submitted as u64);
}
