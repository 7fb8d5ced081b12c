//! Completed-acquisition records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    /// A full buffer was retrieved (terminator seen, or timeout with a
    /// substantial buffer).
    Completed,
    /// The retrieval read timed out with little or no data; the trace most
    /// likely never completed on the instrument.
    TimedOut,
}

/// One completed acquisition.
///
/// Never mutated after creation. The engine accumulates records in order and
/// hands ownership to the data sink on `SaveData`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Position in the engine's gap-free trace sequence.
    pub trace_num: u32,
    /// Which repetition of the experiment produced this trace.
    pub rep: u32,
    /// Decoded text lines received from the instrument. Kept even for timed
    /// out traces, for diagnostics.
    pub buffer: String,
    /// Canonical parameter string in force for this trace (provenance key).
    pub param_string: String,
    /// Operator note carried over from the parameter set.
    pub note: String,
    pub trace_begun: DateTime<Utc>,
    pub trace_end: DateTime<Utc>,
    pub status: TraceStatus,
}

impl TraceRecord {
    pub fn succeeded(&self) -> bool {
        self.status == TraceStatus::Completed
    }
}
