//! # scan_daq
//!
//! A concurrent acquisition/streaming engine for mass-spectrometry-style
//! instruments. A background producer turns a time-ordered sequence of
//! measurement events ("scans") into a backpressure-safe delivery pipeline
//! with two consumption modes, synchronous push callbacks and cancelable
//! pull iteration, behind one contract shared by a synthetic generator and
//! any live-connection-backed source.
//!
//! ## Crate Structure
//!
//! - **`scan`**: the `ScanItem` measurement record, its immutable
//!   `FrozenScanItem` snapshot, and the `Freeze` capability.
//! - **`filter`**: declarative `ScanFilter` predicates for pull streams.
//! - **`error`**: the closed `ScanError` taxonomy and synchronous
//!   `EngineError` API errors.
//! - **`queue`**: the fixed-capacity `BoundedQueue` with blocking-wait
//!   backpressure and terminal close semantics.
//! - **`distributor`**: per-subscriber bounded fan-out feeding the
//!   controller's broadcast pull path.
//! - **`source`**: the `ScanSource` strategy trait and the default
//!   `SyntheticSource` generator.
//! - **`session`**: `AcquisitionSession`, one bounded run with limits,
//!   pacing, cancellation, and a single-resolution `Completion` signal.
//! - **`controller`**: `InstrumentController`, the per-connection state
//!   machine, push subscriptions, and filtered pull streams.
//! - **`sink`**: the `ObservabilitySink` seam for metrics/lifecycle
//!   notifications.
//! - **`config`**: figment-based settings (TOML file + environment).
//! - **`telemetry`**: `tracing` subscriber setup.
//!
//! ## Example
//!
//! ```no_run
//! use scan_daq::config::Settings;
//! use scan_daq::controller::InstrumentController;
//! use scan_daq::session::AcquisitionOptions;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let controller = InstrumentController::new(Settings::default());
//! let session = controller.start_acquisition(
//!     AcquisitionOptions::default().with_max_scans(100),
//! )?;
//!
//! let mut scans = session.items();
//! while let Some(scan) = scans.next().await {
//!     let scan = scan?;
//!     println!("#{} order {}", scan.scan_number, scan.ms_order);
//! }
//! session.stop().await.ok();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod distributor;
pub mod error;
pub mod filter;
pub mod queue;
pub mod scan;
pub mod session;
pub mod sink;
pub mod source;
pub mod telemetry;

pub use controller::{AcquisitionState, ControllerStatus, InstrumentController};
pub use error::{EngineError, EngineResult, ScanError, ScanErrorCode, ScanResult};
pub use filter::ScanFilter;
pub use scan::{Freeze, FrozenScanItem, ScanItem};
pub use session::{AcquisitionOptions, AcquisitionSession, Completion, SessionOutcome, StopReason};
