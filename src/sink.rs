//! Observability sink: the seam through which the engine reports what it is
//! doing without defining metric names or units itself.
//!
//! The engine calls the sink from the producer task, so implementations must
//! be cheap and non-blocking; anything expensive belongs behind a channel in
//! the implementation, not in the engine.

use tracing::{info, trace, warn};

use crate::error::ScanError;

/// Receiver for per-item and per-session lifecycle notifications.
pub trait ObservabilitySink: Send + Sync {
    /// One scan was generated and dispatched.
    fn scan_acquired(&self, scan_number: u64, ms_order: u8, peak_count: usize, base_peak_intensity: f64);

    /// A session's producer started running.
    fn session_started(&self, session_id: &str);

    /// A session finished without a fault (limits reached or cancelled).
    fn session_completed(&self, session_id: &str);

    /// A session's producer hit a fatal error.
    fn session_faulted(&self, session_id: &str, error: &ScanError);
}

/// Default sink: structured `tracing` events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn scan_acquired(&self, scan_number: u64, ms_order: u8, peak_count: usize, base_peak_intensity: f64) {
        trace!(scan_number, ms_order, peak_count, base_peak_intensity, "scan acquired");
    }

    fn session_started(&self, session_id: &str) {
        info!(session_id, "acquisition session started");
    }

    fn session_completed(&self, session_id: &str) {
        info!(session_id, "acquisition session completed");
    }

    fn session_faulted(&self, session_id: &str, error: &ScanError) {
        warn!(session_id, %error, "acquisition session faulted");
    }
}

/// Sink that ignores every notification; useful in tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl ObservabilitySink for NullSink {
    fn scan_acquired(&self, _: u64, _: u8, _: usize, _: f64) {}
    fn session_started(&self, _: &str) {}
    fn session_completed(&self, _: &str) {}
    fn session_faulted(&self, _: &str, _: &ScanError) {}
}
