//! Long-lived per-connection instrument controller.
//!
//! The controller owns the acquisition state machine, enforces the
//! one-live-session-at-a-time invariant, fans events out to push
//! subscribers, and feeds a broadcast path that serves filtered pull
//! streams across sessions.
//!
//! ```text
//! start_acquisition ── AcquisitionSession ── producer task
//!                                               │  per scan
//!                     push callbacks  ◄─────────┤  (synchronous, in
//!                     broadcast path  ◄─────────┤   generation order)
//!                     session queue   ◄─────────┘
//! ```
//!
//! Push callbacks run on the producer task before the scan reaches either
//! pull path, so a slow subscriber directly throttles the producer. The
//! engine never buffers around a slow subscriber.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::Settings;
use crate::distributor::ScanDistributor;
use crate::error::{EngineError, EngineResult};
use crate::filter::ScanFilter;
use crate::scan::FrozenScanItem;
use crate::session::{AcquisitionOptions, AcquisitionSession, SessionContext, SessionOutcome};
use crate::sink::{ObservabilitySink, TracingSink};
use crate::source::{ScanSource, SyntheticConfig, SyntheticSource};

/// Acquisition lifecycle states.
///
/// `Paused` exists in the machine but no transition reaches it: pause and
/// resume are unsupported and fail fast.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcquisitionState {
    /// No run has been started on this controller yet.
    Idle,
    /// A run was requested and its producer has not started looping.
    Starting,
    /// The producer is generating events.
    Acquiring,
    /// Unreachable; kept for contract completeness.
    Paused,
    /// Cancellation was requested and the producer has not yet exited.
    Stopping,
    /// The last run finished without a fault.
    Completed,
    /// The last run ended with a captured fault.
    Faulted,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Shared mutable acquisition state, read and written under a small lock.
///
/// This is the only locked field in the engine; everything else is either an
/// atomic counter or owned by exactly one task.
#[derive(Debug)]
pub(crate) struct StateCell {
    state: Mutex<AcquisitionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(AcquisitionState::Idle),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AcquisitionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn get(&self) -> AcquisitionState {
        *self.lock()
    }

    pub(crate) fn set(&self, state: AcquisitionState) {
        *self.lock() = state;
    }

    /// Moves to `Starting` iff no run is live; otherwise reports the
    /// offending state.
    pub(crate) fn try_begin_start(&self) -> Result<(), AcquisitionState> {
        let mut state = self.lock();
        match *state {
            AcquisitionState::Idle | AcquisitionState::Completed | AcquisitionState::Faulted => {
                *state = AcquisitionState::Starting;
                Ok(())
            }
            other => Err(other),
        }
    }

    /// Moves `Starting` to `Acquiring`; a no-op if a stop raced in first.
    pub(crate) fn begin_acquiring(&self) {
        let mut state = self.lock();
        if matches!(*state, AcquisitionState::Starting) {
            *state = AcquisitionState::Acquiring;
        }
    }

    /// Marks the live run as stopping; a no-op once the producer has exited.
    pub(crate) fn begin_stopping(&self) {
        let mut state = self.lock();
        if matches!(
            *state,
            AcquisitionState::Starting | AcquisitionState::Acquiring
        ) {
            *state = AcquisitionState::Stopping;
        }
    }
}

type ScanCallback = Box<dyn Fn(&Arc<FrozenScanItem>) + Send + Sync>;

#[derive(Default)]
struct SubscriberLists {
    any: Vec<ScanCallback>,
    survey: Vec<ScanCallback>,
    fragment: Vec<ScanCallback>,
}

/// Delivery surface shared between the controller and its sessions: the
/// synchronous push callbacks plus the broadcast fan-out.
pub(crate) struct ControllerFanout {
    subscribers: RwLock<SubscriberLists>,
    distributor: ScanDistributor,
}

impl ControllerFanout {
    fn new(broadcast_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(SubscriberLists::default()),
            distributor: ScanDistributor::new(broadcast_capacity),
        }
    }

    /// Invokes push callbacks in registration order: "any" subscribers
    /// first, then the order-specific list.
    pub(crate) fn dispatch_push(&self, scan: &Arc<FrozenScanItem>) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for callback in &subscribers.any {
            callback(scan);
        }
        let specific = if scan.is_survey() {
            &subscribers.survey
        } else {
            &subscribers.fragment
        };
        for callback in specific {
            callback(scan);
        }
    }

    /// Feeds the broadcast pull path; suspends on full subscriber channels.
    pub(crate) async fn publish(&self, scan: Arc<FrozenScanItem>) {
        self.distributor.publish(scan).await;
    }
}

/// Point-in-time controller status.
#[derive(Clone, Debug, Serialize)]
pub struct ControllerStatus {
    /// Current acquisition state.
    pub state: AcquisitionState,
    /// Identifier of the current (or most recent) session.
    pub session_id: Option<String>,
    /// Scans emitted by the current (or most recent) session.
    pub scan_count: u64,
}

/// Factory producing the scan source for each new session.
///
/// The default builds a [`SyntheticSource`]; installing a factory backed by
/// a live instrument connection gives consumers the identical contract.
pub type SourceFactory =
    Box<dyn Fn(&Settings, &AcquisitionOptions) -> Box<dyn ScanSource> + Send + Sync>;

/// Long-lived controller for one instrument connection.
pub struct InstrumentController {
    name: String,
    id: String,
    settings: Settings,
    state: Arc<StateCell>,
    fanout: Arc<ControllerFanout>,
    sink: Arc<dyn ObservabilitySink>,
    active: Mutex<Option<Arc<AcquisitionSession>>>,
    source_factory: SourceFactory,
}

impl InstrumentController {
    /// Creates a controller backed by the synthetic source, logging through
    /// the default [`TracingSink`].
    pub fn new(settings: Settings) -> Self {
        let broadcast_capacity = settings.acquisition.broadcast_capacity;
        Self {
            name: settings.instrument.name.clone(),
            id: Uuid::new_v4().to_string()[..8].to_string(),
            settings,
            state: Arc::new(StateCell::new()),
            fanout: Arc::new(ControllerFanout::new(broadcast_capacity)),
            sink: Arc::new(TracingSink),
            active: Mutex::new(None),
            source_factory: Box::new(default_source_factory),
        }
    }

    /// Replaces the observability sink.
    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the source factory, e.g. with one backed by a live
    /// instrument connection.
    pub fn with_source_factory(mut self, factory: SourceFactory) -> Self {
        self.source_factory = factory;
        self
    }

    /// Instrument display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Controller identity, unique per construction.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Instrument model string from configuration.
    pub fn model(&self) -> &str {
        &self.settings.instrument.model
    }

    /// Instrument serial number from configuration.
    pub fn serial_number(&self) -> &str {
        &self.settings.instrument.serial_number
    }

    /// Current acquisition state.
    pub fn current_state(&self) -> AcquisitionState {
        self.state.get()
    }

    fn active_session(&self) -> Option<Arc<AcquisitionSession>> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Point-in-time status snapshot.
    pub fn status(&self) -> ControllerStatus {
        let session = self.active_session();
        ControllerStatus {
            state: self.current_state(),
            session_id: session.as_ref().map(|s| s.id().to_string()),
            scan_count: session.map(|s| s.item_count()).unwrap_or(0),
        }
    }

    /// Registers a push subscriber for every scan.
    ///
    /// Callbacks run synchronously on the producer task, in registration
    /// order, before the scan reaches any pull consumer. A slow callback
    /// throttles acquisition.
    pub fn on_scan(&self, callback: impl Fn(&Arc<FrozenScanItem>) + Send + Sync + 'static) {
        self.subscribe(|lists| &mut lists.any, callback);
    }

    /// Registers a push subscriber for survey scans only (`ms_order == 1`).
    pub fn on_survey_scan(&self, callback: impl Fn(&Arc<FrozenScanItem>) + Send + Sync + 'static) {
        self.subscribe(|lists| &mut lists.survey, callback);
    }

    /// Registers a push subscriber for derived scans only (`ms_order >= 2`).
    pub fn on_fragment_scan(
        &self,
        callback: impl Fn(&Arc<FrozenScanItem>) + Send + Sync + 'static,
    ) {
        self.subscribe(|lists| &mut lists.fragment, callback);
    }

    fn subscribe(
        &self,
        select: impl FnOnce(&mut SubscriberLists) -> &mut Vec<ScanCallback>,
        callback: impl Fn(&Arc<FrozenScanItem>) + Send + Sync + 'static,
    ) {
        let mut lists = self
            .fanout
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        select(&mut lists).push(Box::new(callback));
    }

    /// Starts a new acquisition session.
    ///
    /// Fails immediately with [`EngineError::InvalidState`] while a session
    /// is live (`Starting`, `Acquiring`, `Paused`, or `Stopping`); succeeds
    /// from `Idle`, `Completed`, and `Faulted`. The new session replaces the
    /// previous handle atomically; the controller never tracks more than
    /// one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_acquisition(
        &self,
        options: AcquisitionOptions,
    ) -> EngineResult<Arc<AcquisitionSession>> {
        self.state
            .try_begin_start()
            .map_err(EngineError::InvalidState)?;

        let source = (self.source_factory)(&self.settings, &options);
        let session = AcquisitionSession::spawn(SessionContext {
            source,
            options,
            state: self.state.clone(),
            fanout: self.fanout.clone(),
            sink: self.sink.clone(),
        });

        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        info!(
            instrument = %self.name,
            session_id = session.id(),
            "acquisition session created"
        );
        Ok(session)
    }

    /// Stops the live session and waits for its completion.
    pub async fn stop_acquisition(&self) -> EngineResult<SessionOutcome> {
        let session = self.active_session().ok_or(EngineError::NoActiveSession)?;
        Ok(session.stop().await)
    }

    /// Pausing is not supported; always fails.
    pub fn pause_acquisition(&self) -> EngineResult<()> {
        Err(EngineError::Unsupported("pause"))
    }

    /// Resuming is not supported; always fails.
    pub fn resume_acquisition(&self) -> EngineResult<()> {
        Err(EngineError::Unsupported("resume"))
    }

    /// Opens a filtered pull stream over the controller's broadcast path.
    ///
    /// The stream spans sessions: it keeps delivering scans from subsequent
    /// runs until cancelled or the controller is dropped.
    pub async fn scans(&self, filter: ScanFilter) -> ScanStream {
        self.scans_with_cancel(filter, CancellationToken::new())
            .await
    }

    /// Like [`InstrumentController::scans`], additionally ending when
    /// `cancel` fires.
    pub async fn scans_with_cancel(
        &self,
        filter: ScanFilter,
        cancel: CancellationToken,
    ) -> ScanStream {
        let rx = self.fanout.distributor.subscribe("controller-pull").await;
        ScanStream { rx, filter, cancel }
    }
}

fn default_source_factory(
    settings: &Settings,
    options: &AcquisitionOptions,
) -> Box<dyn ScanSource> {
    Box::new(SyntheticSource::new(SyntheticConfig {
        min_mz: settings.instrument.min_mz,
        max_mz: settings.instrument.max_mz,
        analyzer: settings.instrument.analyzer.clone(),
        max_fragments_per_survey: options.max_fragments_per_survey,
        ..SyntheticConfig::default()
    }))
}

/// Cancelable, filtered pull stream over the controller's broadcast path.
pub struct ScanStream {
    rx: mpsc::Receiver<Arc<FrozenScanItem>>,
    filter: ScanFilter,
    cancel: CancellationToken,
}

impl ScanStream {
    /// Adapts the stream into a [`futures::Stream`] of matching scans.
    pub fn into_stream(self) -> impl futures::Stream<Item = Arc<FrozenScanItem>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|scan| (scan, stream))
        })
    }

    /// Next matching scan, or `None` once cancelled or the controller has
    /// gone away.
    pub async fn next(&mut self) -> Option<Arc<FrozenScanItem>> {
        loop {
            tokio::select! {
                // Cancellation takes priority over buffered scans.
                biased;
                _ = self.cancel.cancelled() => return None,
                scan = self.rx.recv() => match scan {
                    Some(scan) if self.filter.matches(&scan) => return Some(scan),
                    Some(_) => continue,
                    None => return None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_cell_starts_idle() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), AcquisitionState::Idle);
    }

    #[test]
    fn start_is_rejected_while_live() {
        let cell = StateCell::new();
        assert!(cell.try_begin_start().is_ok());
        assert_eq!(cell.get(), AcquisitionState::Starting);
        assert_eq!(cell.try_begin_start(), Err(AcquisitionState::Starting));

        cell.set(AcquisitionState::Acquiring);
        assert_eq!(cell.try_begin_start(), Err(AcquisitionState::Acquiring));

        cell.set(AcquisitionState::Completed);
        assert!(cell.try_begin_start().is_ok());
    }

    #[test]
    fn begin_acquiring_does_not_override_a_racing_stop() {
        let cell = StateCell::new();
        assert!(cell.try_begin_start().is_ok());
        cell.begin_acquiring();
        assert_eq!(cell.get(), AcquisitionState::Acquiring);

        let cell = StateCell::new();
        assert!(cell.try_begin_start().is_ok());
        cell.begin_stopping();
        cell.begin_acquiring();
        assert_eq!(cell.get(), AcquisitionState::Stopping);
    }

    #[test]
    fn begin_stopping_only_affects_live_runs() {
        let cell = StateCell::new();
        cell.begin_stopping();
        assert_eq!(cell.get(), AcquisitionState::Idle);

        cell.set(AcquisitionState::Acquiring);
        cell.begin_stopping();
        assert_eq!(cell.get(), AcquisitionState::Stopping);

        cell.set(AcquisitionState::Completed);
        cell.begin_stopping();
        assert_eq!(cell.get(), AcquisitionState::Completed);
    }

    #[test]
    fn state_displays_like_debug() {
        assert_eq!(AcquisitionState::Acquiring.to_string(), "Acquiring");
    }
}
