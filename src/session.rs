//! One bounded acquisition run.
//!
//! An [`AcquisitionSession`] owns a background producer task, a bounded pull
//! queue, a cancellation scope, run limits, and a single-resolution
//! completion signal. The producer repeatedly asks the configured
//! [`ScanSource`](crate::source::ScanSource) for one cycle of scans, stamps
//! sequence numbers, snapshots each event, hands it to the controller's push
//! subscribers and broadcast path, and finally makes it available to this
//! session's pull consumers.
//!
//! Faults from the source are captured: the queue closes with the error, the
//! shared state moves to `Faulted`, and [`Completion`] resolves with the
//! fault. Push subscribers are *not* notified of faults; only pull
//! consumers observe the terminal error through the closed queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::controller::{AcquisitionState, ControllerFanout, StateCell};
use crate::error::{EngineError, EngineResult, ScanError, ScanResult};
use crate::queue::BoundedQueue;
use crate::scan::{Freeze, FrozenScanItem};
use crate::sink::ObservabilitySink;
use crate::source::ScanSource;

/// Per-run options; unset limits mean "run until stopped".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquisitionOptions {
    /// Stop after this many scans across all orders.
    #[serde(default)]
    pub max_scans: Option<u64>,
    /// Stop after this much wall-clock time, checked at cycle boundaries.
    #[serde(default, with = "humantime_serde")]
    pub max_duration: Option<Duration>,
    /// Target event rate, in scans per second across all orders.
    #[serde(default = "default_scans_per_second")]
    pub scans_per_second: f64,
    /// Upper bound on derived scans per survey scan.
    #[serde(default = "default_max_fragments")]
    pub max_fragments_per_survey: u32,
    /// Capacity of the session's pull queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Snapshot events on handoff so the source may recycle its buffers.
    /// When disabled, events are moved instead of copied; the source must
    /// then hand over exclusively-owned storage.
    #[serde(default = "default_auto_freeze")]
    pub auto_freeze: bool,
    /// External cancellation scope this run is linked into.
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

fn default_scans_per_second() -> f64 {
    10.0
}

fn default_max_fragments() -> u32 {
    4
}

fn default_queue_capacity() -> usize {
    512
}

fn default_auto_freeze() -> bool {
    true
}

impl Default for AcquisitionOptions {
    fn default() -> Self {
        Self {
            max_scans: None,
            max_duration: None,
            scans_per_second: default_scans_per_second(),
            max_fragments_per_survey: default_max_fragments(),
            queue_capacity: default_queue_capacity(),
            auto_freeze: default_auto_freeze(),
            cancellation: None,
        }
    }
}

impl AcquisitionOptions {
    /// Derives options from loaded [`Settings`].
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            scans_per_second: settings.acquisition.scans_per_second,
            max_fragments_per_survey: settings.acquisition.max_fragments_per_survey,
            queue_capacity: settings.acquisition.queue_capacity,
            auto_freeze: settings.acquisition.auto_freeze,
            ..Self::default()
        }
    }

    /// Limits the run to `max_scans` events.
    pub fn with_max_scans(mut self, max_scans: u64) -> Self {
        self.max_scans = Some(max_scans);
        self
    }

    /// Limits the run's wall-clock duration.
    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    /// Links the run into an external cancellation scope.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Fixed inter-cycle delay approximating the target event rate, given
    /// that one cycle emits a survey scan plus up to
    /// `max_fragments_per_survey` fragments.
    pub fn pacing_delay(&self) -> Duration {
        let rate = if self.scans_per_second > 0.0 {
            self.scans_per_second
        } else {
            default_scans_per_second()
        };
        let events_per_cycle = 1.0 + f64::from(self.max_fragments_per_survey);
        Duration::from_secs_f64(events_per_cycle / rate)
    }
}

/// Why a session stopped, when it stopped without a fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The configured scan-count limit was reached.
    ScanLimit,
    /// The configured wall-clock limit was reached.
    DurationLimit,
    /// The run was cancelled cooperatively.
    Cancelled,
}

/// How a session ended: a stop reason, or the captured fault.
pub type SessionOutcome = Result<StopReason, ScanError>;

/// Single-resolution completion signal.
///
/// Resolves exactly once, successfully or with the captured fault, and may
/// be observed by any number of waiters, before or after resolution.
#[derive(Clone)]
pub struct Completion {
    rx: watch::Receiver<Option<SessionOutcome>>,
}

impl Completion {
    /// The outcome, if the session has already resolved.
    pub fn resolved(&self) -> Option<SessionOutcome> {
        self.rx.borrow().clone()
    }

    /// Suspends until the session resolves.
    pub async fn wait(&self) -> SessionOutcome {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome
                .clone()
                .unwrap_or(Err(ScanError::cancelled("session dropped before resolving"))),
            // The producer can only drop its sender after resolving; a bare
            // drop means the task was torn down externally.
            Err(_) => Err(ScanError::cancelled("session dropped before resolving")),
        };
        outcome
    }
}

struct CompletionResolver {
    tx: watch::Sender<Option<SessionOutcome>>,
}

impl CompletionResolver {
    /// First resolution wins; later attempts are ignored.
    fn resolve(&self, outcome: SessionOutcome) -> bool {
        let mut pending = Some(outcome);
        self.tx.send_if_modified(move |slot| {
            if slot.is_none() {
                *slot = pending.take();
                true
            } else {
                false
            }
        })
    }
}

/// Cancelable pull iterator over a session's scans.
///
/// Yields `Ok(scan)` per item; on a session fault it yields the terminal
/// error exactly once and then ends. Cancelling via the token ends the
/// stream after a single `Err(cancelled)` marker.
pub struct ScanPull {
    queue: Arc<BoundedQueue<Arc<FrozenScanItem>>>,
    cancel: CancellationToken,
    finished: bool,
}

impl ScanPull {
    fn new(queue: Arc<BoundedQueue<Arc<FrozenScanItem>>>, cancel: CancellationToken) -> Self {
        Self {
            queue,
            cancel,
            finished: false,
        }
    }

    /// Adapts the iterator into a [`futures::Stream`] of scan results.
    pub fn into_stream(self) -> impl futures::Stream<Item = ScanResult> + Send {
        futures::stream::unfold(self, |mut pull| async move {
            pull.next().await.map(|item| (item, pull))
        })
    }

    /// Next scan, end-of-run (`None`), or a failure.
    pub async fn next(&mut self) -> Option<ScanResult> {
        if self.finished {
            return None;
        }
        tokio::select! {
            // Cancellation takes priority over buffered scans.
            biased;
            _ = self.cancel.cancelled() => {
                self.finished = true;
                Some(Err(ScanError::cancelled("scan stream cancelled by consumer")))
            }
            result = self.queue.get() => match result {
                Ok(Some(scan)) => Some(Ok(scan)),
                Ok(None) => {
                    self.finished = true;
                    None
                }
                Err(err) => {
                    self.finished = true;
                    Some(Err(err))
                }
            }
        }
    }
}

pub(crate) struct SessionContext {
    pub(crate) source: Box<dyn ScanSource>,
    pub(crate) options: AcquisitionOptions,
    pub(crate) state: Arc<StateCell>,
    pub(crate) fanout: Arc<ControllerFanout>,
    pub(crate) sink: Arc<dyn ObservabilitySink>,
}

/// Handle to one acquisition run.
pub struct AcquisitionSession {
    id: String,
    state: Arc<StateCell>,
    queue: Arc<BoundedQueue<Arc<FrozenScanItem>>>,
    item_count: Arc<AtomicU64>,
    cancel: CancellationToken,
    completion: Completion,
}

impl AcquisitionSession {
    /// Spawns the producer task and returns the session handle.
    pub(crate) fn spawn(ctx: SessionContext) -> Arc<Self> {
        let id = Uuid::new_v4().to_string()[..8].to_string();
        let cancel = match &ctx.options.cancellation {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let queue = Arc::new(BoundedQueue::new(ctx.options.queue_capacity));
        let item_count = Arc::new(AtomicU64::new(0));
        let (tx, rx) = watch::channel(None);

        let producer = Producer {
            id: id.clone(),
            source: ctx.source,
            options: ctx.options,
            state: ctx.state.clone(),
            fanout: ctx.fanout,
            sink: ctx.sink,
            queue: queue.clone(),
            item_count: item_count.clone(),
            cancel: cancel.clone(),
            resolver: CompletionResolver { tx },
        };
        tokio::spawn(producer.run());

        Arc::new(Self {
            id,
            state: ctx.state,
            queue,
            item_count,
            cancel,
            completion: Completion { rx },
        })
    }

    /// Unique identifier of this run.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current acquisition state (shared with the owning controller).
    pub fn state(&self) -> AcquisitionState {
        self.state.get()
    }

    /// Number of scans emitted so far; safe to read concurrently.
    pub fn item_count(&self) -> u64 {
        self.item_count.load(Ordering::SeqCst)
    }

    /// The session's completion signal.
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Pull iterator over this session's scans.
    pub fn items(&self) -> ScanPull {
        ScanPull::new(self.queue.clone(), CancellationToken::new())
    }

    /// Pull iterator that additionally ends when `cancel` fires.
    pub fn items_with_cancel(&self, cancel: CancellationToken) -> ScanPull {
        ScanPull::new(self.queue.clone(), cancel)
    }

    /// Requests cooperative cancellation and waits for the producer to exit.
    ///
    /// Idempotent: a second call observes the already-resolved completion
    /// without further effect.
    pub async fn stop(&self) -> SessionOutcome {
        if self.completion.resolved().is_none() {
            self.state.begin_stopping();
            self.cancel.cancel();
        }
        self.completion.wait().await
    }

    /// Pausing is not supported; always fails.
    pub fn pause(&self) -> EngineResult<()> {
        Err(EngineError::Unsupported("pause"))
    }

    /// Resuming is not supported; always fails.
    pub fn resume(&self) -> EngineResult<()> {
        Err(EngineError::Unsupported("resume"))
    }
}

impl Drop for AcquisitionSession {
    /// Disposal requests cancellation; the producer unwinds cooperatively
    /// and resolves completion on its own task.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Producer {
    id: String,
    source: Box<dyn ScanSource>,
    options: AcquisitionOptions,
    state: Arc<StateCell>,
    fanout: Arc<ControllerFanout>,
    sink: Arc<dyn ObservabilitySink>,
    queue: Arc<BoundedQueue<Arc<FrozenScanItem>>>,
    item_count: Arc<AtomicU64>,
    cancel: CancellationToken,
    resolver: CompletionResolver,
}

impl Producer {
    async fn run(mut self) {
        self.state.begin_acquiring();
        self.sink.session_started(&self.id);
        info!(session_id = %self.id, source = self.source.description(), "acquisition started");

        let outcome = self.acquire().await;

        // Close the queue before resolving so that by the time any waiter
        // returns from `Completion`, pull consumers can no longer block.
        match &outcome {
            Ok(reason) => {
                self.queue.close();
                self.state.set(AcquisitionState::Completed);
                self.sink.session_completed(&self.id);
                info!(
                    session_id = %self.id,
                    ?reason,
                    items = self.item_count.load(Ordering::SeqCst),
                    "acquisition completed"
                );
            }
            Err(err) => {
                self.queue.close_with_error(err.clone());
                self.state.set(AcquisitionState::Faulted);
                self.sink.session_faulted(&self.id, err);
                warn!(session_id = %self.id, %err, "acquisition faulted");
            }
        }
        self.resolver.resolve(outcome);
    }

    async fn acquire(&mut self) -> SessionOutcome {
        let started = Instant::now();
        let pacing = self.options.pacing_delay();
        let mut next_seq: u64 = 1;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            if let Some(limit) = self.options.max_scans {
                if self.item_count.load(Ordering::SeqCst) >= limit {
                    return Ok(StopReason::ScanLimit);
                }
            }
            if let Some(limit) = self.options.max_duration {
                if started.elapsed() >= limit {
                    return Ok(StopReason::DurationLimit);
                }
            }

            let cycle = match self.source.next_cycle().await {
                Ok(cycle) => cycle,
                Err(cause) => {
                    return Err(ScanError::read(format!(
                        "scan source '{}' failed",
                        self.source.description()
                    ))
                    .with_cause(cause));
                }
            };

            for mut item in cycle {
                if self.cancel.is_cancelled() {
                    return Ok(StopReason::Cancelled);
                }
                if let Some(limit) = self.options.max_scans {
                    if self.item_count.load(Ordering::SeqCst) >= limit {
                        return Ok(StopReason::ScanLimit);
                    }
                }

                item.scan_number = next_seq;
                next_seq += 1;

                let frozen = Arc::new(if self.options.auto_freeze {
                    item.freeze()
                } else {
                    item.into_frozen()
                });

                self.sink.scan_acquired(
                    frozen.scan_number,
                    frozen.ms_order,
                    frozen.peak_count,
                    frozen.base_peak_intensity,
                );

                // Push delivery precedes pull availability: synchronous
                // subscriber callbacks, then the broadcast path, then this
                // session's queue. A slow subscriber therefore throttles the
                // producer.
                self.fanout.dispatch_push(&frozen);
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(StopReason::Cancelled),
                    () = self.fanout.publish(frozen.clone()) => {}
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(StopReason::Cancelled),
                    result = self.queue.put(frozen) => {
                        if result.is_err() {
                            // The queue only closes underneath the producer
                            // when the session is being torn down.
                            debug!(session_id = %self.id, "queue closed under producer");
                            return Ok(StopReason::Cancelled);
                        }
                    }
                }
                self.item_count.fetch_add(1, Ordering::SeqCst);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(StopReason::Cancelled),
                () = tokio::time::sleep(pacing) => {}
            }
        }
    }
}
