//! Integration tests for the acquisition session lifecycle: run limits,
//! sequence numbering, completion semantics, cancellation, and the fault
//! path.

use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use scan_daq::config::Settings;
use scan_daq::controller::{AcquisitionState, InstrumentController};
use scan_daq::error::ScanErrorCode;
use scan_daq::scan::{AnalyzerInfo, ScanItem};
use scan_daq::session::{AcquisitionOptions, StopReason};
use scan_daq::source::ScanSource;

fn fast_options() -> AcquisitionOptions {
    AcquisitionOptions {
        scans_per_second: 5_000.0,
        ..AcquisitionOptions::default()
    }
}

/// Source that produces plain cycles for a while, then fails.
struct FailingSource {
    cycles_before_failure: u32,
    produced: u32,
}

impl FailingSource {
    fn new(cycles_before_failure: u32) -> Self {
        Self {
            cycles_before_failure,
            produced: 0,
        }
    }
}

#[async_trait]
impl ScanSource for FailingSource {
    fn description(&self) -> &str {
        "failing test source"
    }

    async fn next_cycle(&mut self) -> anyhow::Result<Vec<ScanItem>> {
        if self.produced >= self.cycles_before_failure {
            return Err(anyhow!("detector voltage out of range"));
        }
        self.produced += 1;
        let mut item = ScanItem::new(1, AnalyzerInfo::default());
        item.set_payload(vec![400.0, 500.0], vec![1.0e6, 2.0e6]);
        Ok(vec![item])
    }
}

#[tokio::test]
async fn sequence_numbers_are_gapless_and_increasing() {
    let controller = InstrumentController::new(Settings::default());
    let session = controller
        .start_acquisition(fast_options().with_max_scans(50))
        .expect("start");

    let mut items = session.items();
    let mut sequence = Vec::new();
    while let Some(result) = items.next().await {
        sequence.push(result.expect("scan").scan_number);
    }

    let expected: Vec<u64> = (1..=50).collect();
    assert_eq!(sequence, expected);
}

#[tokio::test]
async fn max_scans_bounds_item_count() {
    for limit in [1u64, 5, 100] {
        let controller = InstrumentController::new(Settings::default());
        let session = controller
            .start_acquisition(fast_options().with_max_scans(limit))
            .expect("start");

        let outcome = session.completion().wait().await;
        assert_eq!(outcome.ok(), Some(StopReason::ScanLimit));
        assert_eq!(session.item_count(), limit);
        assert_eq!(session.state(), AcquisitionState::Completed);
    }
}

#[tokio::test]
async fn zero_scan_limit_completes_without_producing() {
    let controller = InstrumentController::new(Settings::default());
    let session = controller
        .start_acquisition(fast_options().with_max_scans(0))
        .expect("start");

    let outcome = session.completion().wait().await;
    assert_eq!(outcome.ok(), Some(StopReason::ScanLimit));
    assert_eq!(session.item_count(), 0);
}

#[tokio::test]
async fn max_duration_ends_the_run() {
    let controller = InstrumentController::new(Settings::default());
    let options = AcquisitionOptions {
        scans_per_second: 100.0,
        ..AcquisitionOptions::default()
    }
    .with_max_duration(Duration::from_millis(200));
    let session = controller.start_acquisition(options).expect("start");

    let outcome = tokio::time::timeout(Duration::from_secs(5), session.completion().wait())
        .await
        .expect("completion within bound");
    assert_eq!(outcome.ok(), Some(StopReason::DurationLimit));
    assert_eq!(session.state(), AcquisitionState::Completed);
}

#[tokio::test]
async fn completion_resolves_once_for_concurrent_waiters() {
    let controller = InstrumentController::new(Settings::default());
    let session = controller
        .start_acquisition(fast_options().with_max_scans(10))
        .expect("start");

    let mut waiters = Vec::new();
    for _ in 0..3 {
        let completion = session.completion();
        waiters.push(tokio::spawn(async move { completion.wait().await }));
    }

    for waiter in waiters {
        let outcome = waiter.await.expect("join");
        assert_eq!(outcome.ok(), Some(StopReason::ScanLimit));
    }
}

#[tokio::test]
async fn stop_is_idempotent() {
    let controller = InstrumentController::new(Settings::default());
    let session = controller.start_acquisition(fast_options()).expect("start");

    tokio::time::sleep(Duration::from_millis(50)).await;

    let first = session.stop().await;
    assert_eq!(first.ok(), Some(StopReason::Cancelled));
    let count_after_stop = session.item_count();

    // The second stop observes the already-resolved completion and has no
    // further effect.
    let second = session.stop().await;
    assert_eq!(second.ok(), Some(StopReason::Cancelled));
    assert_eq!(session.item_count(), count_after_stop);
    assert_eq!(session.state(), AcquisitionState::Completed);
}

#[tokio::test]
async fn cancellation_completes_within_a_bounded_grace_period() {
    let controller = InstrumentController::new(Settings::default());
    // 10 scans/sec with a 5-scan cycle gives a 500ms pacing delay.
    let options = AcquisitionOptions {
        scans_per_second: 10.0,
        ..AcquisitionOptions::default()
    };
    let pacing = options.pacing_delay();
    let session = controller.start_acquisition(options).expect("start");

    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = Instant::now();
    let outcome = session.stop().await;
    let grace = start.elapsed();

    assert_eq!(outcome.ok(), Some(StopReason::Cancelled));
    assert!(
        grace < pacing * 2,
        "stop took {grace:?}, more than twice the {pacing:?} pacing delay"
    );

    // No further sequence numbers after completion.
    let count = session.item_count();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.item_count(), count);
}

#[tokio::test]
async fn external_cancellation_token_stops_the_run() {
    let token = tokio_util::sync::CancellationToken::new();
    let controller = InstrumentController::new(Settings::default());
    let session = controller
        .start_acquisition(fast_options().with_cancellation(token.clone()))
        .expect("start");

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(2), session.completion().wait())
        .await
        .expect("completion after external cancel");
    assert_eq!(outcome.ok(), Some(StopReason::Cancelled));
}

#[tokio::test]
async fn pause_and_resume_fail_fast() {
    let controller = InstrumentController::new(Settings::default());
    let session = controller.start_acquisition(fast_options()).expect("start");

    assert!(session.pause().is_err());
    assert!(session.resume().is_err());
    assert!(controller.pause_acquisition().is_err());
    assert!(controller.resume_acquisition().is_err());

    session.stop().await.ok();
}

#[tokio::test]
async fn source_failure_faults_the_session() {
    let controller = InstrumentController::new(Settings::default()).with_source_factory(
        Box::new(|_, _| -> Box<dyn ScanSource> { Box::new(FailingSource::new(3)) }),
    );
    let session = controller.start_acquisition(fast_options()).expect("start");

    // Pull consumers observe the terminal error through the closed queue.
    let mut items = session.items();
    let mut delivered = 0u64;
    let mut terminal = None;
    while let Some(result) = items.next().await {
        match result {
            Ok(_) => delivered += 1,
            Err(err) => {
                terminal = Some(err);
                break;
            }
        }
    }

    let terminal = terminal.expect("terminal error");
    assert_eq!(terminal.code, ScanErrorCode::ReadError);
    // The terminal error takes precedence over undrained items, so a slow
    // consumer may see fewer than the three produced scans.
    assert!(delivered <= 3);

    let outcome = session.completion().wait().await;
    let fault = outcome.expect_err("faulted outcome");
    assert_eq!(fault.code, ScanErrorCode::ReadError);
    assert_eq!(session.state(), AcquisitionState::Faulted);
}

#[tokio::test]
async fn disabled_auto_freeze_still_delivers_snapshots() {
    let controller = InstrumentController::new(Settings::default());
    let options = AcquisitionOptions {
        auto_freeze: false,
        ..fast_options().with_max_scans(10)
    };
    let session = controller.start_acquisition(options).expect("start");

    let mut items = session.items();
    let mut received = 0;
    while let Some(result) = items.next().await {
        let scan = result.expect("scan");
        assert_eq!(scan.mz_values.len(), scan.peak_count);
        received += 1;
    }
    assert_eq!(received, 10);
}

#[tokio::test]
async fn pull_stream_cancellation_ends_iteration() {
    let controller = InstrumentController::new(Settings::default());
    let session = controller.start_acquisition(fast_options()).expect("start");

    let token = tokio_util::sync::CancellationToken::new();
    let mut items = session.items_with_cancel(token.clone());

    let first = items.next().await.expect("first scan");
    assert!(first.is_ok());

    token.cancel();
    // Drain until the cancellation marker; at most a few buffered scans race
    // ahead of the token.
    let mut marker = None;
    while let Some(result) = items.next().await {
        if let Err(err) = result {
            marker = Some(err);
            break;
        }
    }
    assert!(marker.expect("cancellation marker").is_cancelled());
    assert!(items.next().await.is_none(), "stream continued past its end");

    session.stop().await.ok();
}

#[tokio::test]
async fn pull_stream_adapter_yields_every_scan_in_order() {
    use futures::StreamExt;

    let controller = InstrumentController::new(Settings::default());
    let session = controller
        .start_acquisition(fast_options().with_max_scans(8))
        .expect("start");

    let numbers: Vec<u64> = session
        .items()
        .into_stream()
        .map(|result| result.expect("scan").scan_number)
        .collect()
        .await;
    assert_eq!(numbers, (1..=8).collect::<Vec<u64>>());
}

#[tokio::test]
async fn frozen_scans_outlive_the_session() {
    let controller = InstrumentController::new(Settings::default());
    let session = controller
        .start_acquisition(fast_options().with_max_scans(5))
        .expect("start");

    let mut items = session.items();
    let mut retained = Vec::new();
    while let Some(result) = items.next().await {
        retained.push(result.expect("scan"));
    }
    session.stop().await.ok();
    drop(session);
    drop(controller);

    assert_eq!(retained.len(), 5);
    for (i, scan) in retained.iter().enumerate() {
        assert_eq!(scan.scan_number, i as u64 + 1);
        assert!(!scan.mz_values.is_empty());
    }
}
