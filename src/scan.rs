//! Scan records and their immutable snapshot form.
//!
//! A [`ScanItem`] is the mutable, producer-owned record of one measurement
//! event. Producers may recycle an item's payload buffers between cycles, so
//! anything that retains a scan past the producer's next cycle must hold a
//! [`FrozenScanItem`] instead: an independently-owned snapshot whose payload
//! can never be mutated through another handle.
//!
//! The [`Freeze`] trait is the capability used to take that snapshot. It is
//! implemented once per source type: deep copy for `ScanItem`, no-op for
//! `FrozenScanItem`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ion polarity of the analyzer for a given scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Polarity {
    /// Positive ion mode.
    Positive,
    /// Negative ion mode.
    Negative,
}

/// Activation method used to fragment a precursor ion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationKind {
    /// Higher-energy collisional dissociation.
    Hcd,
    /// Collision-induced dissociation.
    Cid,
    /// Electron-transfer dissociation.
    Etd,
    /// Ultraviolet photodissociation.
    Uvpd,
    /// Activation method not reported by the source.
    Unknown,
}

/// Selection metadata for a derived (fragment) scan.
///
/// Present on a [`ScanItem`] iff `ms_order >= 2`; it identifies the survey
/// peak the fragment scan was derived from and how it was activated.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrecursorInfo {
    /// m/z of the selected survey peak.
    pub mz: f64,
    /// Intensity of the selected survey peak.
    pub intensity: f64,
    /// Assumed charge state of the precursor ion.
    pub charge: u32,
    /// Width of the isolation window, in m/z units.
    pub isolation_width: f64,
    /// Normalized collision energy.
    pub collision_energy: f64,
    /// Activation method.
    pub activation: ActivationKind,
}

/// Analyzer metadata attached to every scan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerInfo {
    /// Analyzer name (e.g. "Orbitrap").
    pub name: String,
    /// Nominal resolution at the reference m/z.
    pub resolution: f64,
    /// Estimated mass accuracy in parts per million.
    pub mass_accuracy_ppm: f64,
    /// Ion polarity for this scan.
    pub polarity: Polarity,
}

impl Default for AnalyzerInfo {
    fn default() -> Self {
        Self {
            name: "Orbitrap".to_string(),
            resolution: 120_000.0,
            mass_accuracy_ppm: 3.0,
            polarity: Polarity::Positive,
        }
    }
}

/// One measurement event, as produced by a [`crate::source::ScanSource`].
///
/// The payload arrays are parallel: `mz_values[i]` pairs with
/// `intensity_values[i]`, and both have length `peak_count`. Aggregates must
/// describe the maximum-intensity entry of the payload at the time they were
/// computed; [`ScanItem::recompute_aggregates`] restores that invariant after
/// any payload edit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanItem {
    /// Sequence number, strictly increasing within a session. Assigned by the
    /// acquisition session, not the source.
    pub scan_number: u64,
    /// MS order: 1 for a survey scan, >= 2 for a fragment scan.
    pub ms_order: u8,
    /// Run-relative retention time, in minutes.
    pub retention_time: f64,
    /// Peak positions, sorted ascending.
    pub mz_values: Vec<f64>,
    /// Peak intensities, parallel to `mz_values`.
    pub intensity_values: Vec<f64>,
    /// Declared number of peaks; equals the payload length.
    pub peak_count: usize,
    /// m/z of the most intense peak.
    pub base_peak_mz: f64,
    /// Intensity of the most intense peak.
    pub base_peak_intensity: f64,
    /// Sum of all peak intensities.
    pub total_ion_current: f64,
    /// Selection metadata, present iff `ms_order >= 2`.
    pub precursor: Option<PrecursorInfo>,
    /// Analyzer metadata.
    pub analyzer: AnalyzerInfo,
    /// Wall-clock time the event was generated.
    pub timestamp: DateTime<Utc>,
    /// Open string-keyed annotations (the instrument "trailer").
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub trailer: HashMap<String, String>,
}

impl ScanItem {
    /// Creates an empty scan of the given order.
    pub fn new(ms_order: u8, analyzer: AnalyzerInfo) -> Self {
        Self {
            scan_number: 0,
            ms_order,
            retention_time: 0.0,
            mz_values: Vec::new(),
            intensity_values: Vec::new(),
            peak_count: 0,
            base_peak_mz: 0.0,
            base_peak_intensity: 0.0,
            total_ion_current: 0.0,
            precursor: None,
            analyzer,
            timestamp: Utc::now(),
            trailer: HashMap::new(),
        }
    }

    /// Replaces the payload and recomputes the count and aggregates.
    ///
    /// The two arrays must be equal-length; trailing elements of the longer
    /// one are truncated to keep the parallel-array invariant.
    pub fn set_payload(&mut self, mz_values: Vec<f64>, intensity_values: Vec<f64>) {
        let len = mz_values.len().min(intensity_values.len());
        self.mz_values = mz_values;
        self.mz_values.truncate(len);
        self.intensity_values = intensity_values;
        self.intensity_values.truncate(len);
        self.peak_count = len;
        self.recompute_aggregates();
    }

    /// Recomputes base peak and total ion current from the payload.
    pub fn recompute_aggregates(&mut self) {
        let (mz, intensity, tic) = aggregates(&self.mz_values, &self.intensity_values);
        self.base_peak_mz = mz;
        self.base_peak_intensity = intensity;
        self.total_ion_current = tic;
    }

    /// Checks the payload invariant: parallel arrays whose length matches the
    /// declared count.
    pub fn payload_is_consistent(&self) -> bool {
        self.mz_values.len() == self.intensity_values.len()
            && self.mz_values.len() == self.peak_count
    }

    /// Clears the payload while retaining buffer capacity, so a producer can
    /// refill the same item on its next cycle.
    pub fn clear_payload(&mut self) {
        self.mz_values.clear();
        self.intensity_values.clear();
        self.peak_count = 0;
        self.base_peak_mz = 0.0;
        self.base_peak_intensity = 0.0;
        self.total_ion_current = 0.0;
        self.precursor = None;
        self.trailer.clear();
    }

    /// Converts into a frozen snapshot by moving the payload buffers.
    ///
    /// Unlike [`Freeze::freeze`], this does not copy: the item is consumed,
    /// so exclusive ownership of the buffers transfers to the snapshot. Use
    /// this when the producer builds a fresh item per event instead of
    /// recycling one.
    pub fn into_frozen(self) -> FrozenScanItem {
        FrozenScanItem {
            scan_number: self.scan_number,
            ms_order: self.ms_order,
            retention_time: self.retention_time,
            mz_values: self.mz_values.into(),
            intensity_values: self.intensity_values.into(),
            peak_count: self.peak_count,
            base_peak_mz: self.base_peak_mz,
            base_peak_intensity: self.base_peak_intensity,
            total_ion_current: self.total_ion_current,
            precursor: self.precursor,
            analyzer: self.analyzer,
            timestamp: self.timestamp,
            trailer: Arc::new(self.trailer.into_iter().collect()),
        }
    }
}

/// Computes `(base_peak_mz, base_peak_intensity, total_ion_current)`.
pub fn aggregates(mz_values: &[f64], intensity_values: &[f64]) -> (f64, f64, f64) {
    if mz_values.is_empty() || intensity_values.is_empty() {
        return (0.0, 0.0, 0.0);
    }

    let mut max_idx = 0;
    let mut max_intensity = intensity_values[0];
    let mut tic = 0.0;

    for (i, &intensity) in intensity_values.iter().enumerate() {
        tic += intensity;
        if intensity > max_intensity {
            max_intensity = intensity;
            max_idx = i;
        }
    }

    (mz_values[max_idx], max_intensity, tic)
}

/// Immutable snapshot of a [`ScanItem`].
///
/// The payload is held in shared read-only storage, so `Clone` is cheap and
/// a snapshot may be retained indefinitely or handed across task boundaries.
/// No handle to the producing item can mutate it.
#[derive(Clone, Debug)]
pub struct FrozenScanItem {
    /// Sequence number, strictly increasing within a session.
    pub scan_number: u64,
    /// MS order: 1 for a survey scan, >= 2 for a fragment scan.
    pub ms_order: u8,
    /// Run-relative retention time, in minutes.
    pub retention_time: f64,
    /// Peak positions, sorted ascending.
    pub mz_values: Arc<[f64]>,
    /// Peak intensities, parallel to `mz_values`.
    pub intensity_values: Arc<[f64]>,
    /// Declared number of peaks; equals the payload length.
    pub peak_count: usize,
    /// m/z of the most intense peak.
    pub base_peak_mz: f64,
    /// Intensity of the most intense peak.
    pub base_peak_intensity: f64,
    /// Sum of all peak intensities.
    pub total_ion_current: f64,
    /// Selection metadata, present iff `ms_order >= 2`.
    pub precursor: Option<PrecursorInfo>,
    /// Analyzer metadata.
    pub analyzer: AnalyzerInfo,
    /// Wall-clock time the event was generated.
    pub timestamp: DateTime<Utc>,
    /// Annotations, copied into a read-optimized ordered map.
    pub trailer: Arc<BTreeMap<String, String>>,
}

impl FrozenScanItem {
    /// True for survey scans (`ms_order == 1`).
    pub fn is_survey(&self) -> bool {
        self.ms_order == 1
    }

    /// True for derived scans (`ms_order >= 2`).
    pub fn is_fragment(&self) -> bool {
        self.ms_order >= 2
    }
}

/// Capability to take an independently-owned snapshot of a scan record.
///
/// Implementations must copy every scalar by value and every buffer
/// element-for-element into new storage; the snapshot never aliases storage
/// the source could later mutate. Reads exactly the one instance passed in,
/// so it is safe to call while a producer mutates *other* instances.
pub trait Freeze {
    /// Produces the snapshot.
    fn freeze(&self) -> FrozenScanItem;
}

impl Freeze for ScanItem {
    fn freeze(&self) -> FrozenScanItem {
        FrozenScanItem {
            scan_number: self.scan_number,
            ms_order: self.ms_order,
            retention_time: self.retention_time,
            mz_values: self.mz_values.as_slice().into(),
            intensity_values: self.intensity_values.as_slice().into(),
            peak_count: self.peak_count,
            base_peak_mz: self.base_peak_mz,
            base_peak_intensity: self.base_peak_intensity,
            total_ion_current: self.total_ion_current,
            precursor: self.precursor,
            analyzer: self.analyzer.clone(),
            timestamp: self.timestamp,
            trailer: Arc::new(self.trailer.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        }
    }
}

impl Freeze for FrozenScanItem {
    /// Freezing a frozen scan is a no-op: the payload is already immutable,
    /// so only the shared handles are cloned.
    fn freeze(&self) -> FrozenScanItem {
        self.clone()
    }
}
