//! Scan producer strategies.
//!
//! [`ScanSource`] is the thin-waist contract between the acquisition session
//! and whatever actually produces events. The session owns pacing, run
//! limits, cancellation, sequence numbering, and delivery; a source only
//! fills in the next cycle's worth of scans. A source backed by a live
//! instrument connection implements exactly the same contract as the
//! synthetic generator below, so consumers cannot tell them apart.
//!
//! [`SyntheticSource`] produces realistic-looking spectra: a minority of
//! structured peaks with simplified isotope envelopes over a noise floor,
//! sorted by m/z, with fragment scans derived from a precursor chosen among
//! the survey's most intense peaks.

use anyhow::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::scan::{ActivationKind, AnalyzerInfo, Polarity, PrecursorInfo, ScanItem};

/// Strategy that yields one acquisition cycle of scans at a time.
///
/// A cycle is one survey scan followed by its derived fragment scans, in
/// generation order. Sequence numbers are stamped by the caller, so
/// implementations should leave `scan_number` at its default.
///
/// Implementations may retain and recycle internal buffers between cycles
/// only when paired with a session that freezes events on handoff
/// (`auto_freeze`); otherwise the returned items must own their storage
/// exclusively.
#[async_trait]
pub trait ScanSource: Send {
    /// Short identity used in logs and status reporting.
    fn description(&self) -> &str;

    /// Produces the next cycle of scans.
    ///
    /// An error is session-fatal: the session captures it, faults, and never
    /// calls the source again.
    async fn next_cycle(&mut self) -> Result<Vec<ScanItem>>;
}

/// Tuning for [`SyntheticSource`].
#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    /// Lower bound of the survey m/z range.
    pub min_mz: f64,
    /// Upper bound of the survey m/z range.
    pub max_mz: f64,
    /// Fixed survey peak count; `None` picks 500..2000 per scan.
    pub survey_peak_count: Option<usize>,
    /// Fixed fragment peak count; `None` picks 50..300 per scan.
    pub fragment_peak_count: Option<usize>,
    /// Upper bound on derived scans per survey scan.
    pub max_fragments_per_survey: u32,
    /// Analyzer name stamped on every scan.
    pub analyzer: String,
    /// Nominal resolution for survey scans.
    pub survey_resolution: f64,
    /// Nominal resolution for fragment scans.
    pub fragment_resolution: f64,
    /// Mass accuracy for survey scans, ppm.
    pub survey_mass_accuracy_ppm: f64,
    /// Mass accuracy for fragment scans, ppm.
    pub fragment_mass_accuracy_ppm: f64,
    /// Ion polarity for the run.
    pub polarity: Polarity,
    /// Retention-time advance per cycle, in seconds.
    pub seconds_per_cycle: f64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            min_mz: 200.0,
            max_mz: 2000.0,
            survey_peak_count: None,
            fragment_peak_count: None,
            max_fragments_per_survey: 4,
            analyzer: "Orbitrap".to_string(),
            survey_resolution: 120_000.0,
            fragment_resolution: 30_000.0,
            survey_mass_accuracy_ppm: 3.0,
            fragment_mass_accuracy_ppm: 5.0,
            polarity: Polarity::Positive,
            seconds_per_cycle: 0.5,
        }
    }
}

/// ~1 Da isotope spacing typical for peptides.
const ISOTOPE_SPACING: f64 = 1.003_355;

/// Synthetic scan generator.
pub struct SyntheticSource {
    config: SyntheticConfig,
    rng: StdRng,
    retention_time: f64,
}

impl SyntheticSource {
    /// Creates a generator seeded from OS entropy.
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            rng: StdRng::from_entropy(),
            retention_time: 0.0,
        }
    }

    /// Creates a deterministic generator for tests.
    pub fn with_seed(config: SyntheticConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            retention_time: 0.0,
        }
    }

    fn analyzer_info(&self, ms_order: u8) -> AnalyzerInfo {
        let (resolution, accuracy) = if ms_order == 1 {
            (self.config.survey_resolution, self.config.survey_mass_accuracy_ppm)
        } else {
            (self.config.fragment_resolution, self.config.fragment_mass_accuracy_ppm)
        };
        AnalyzerInfo {
            name: self.config.analyzer.clone(),
            resolution,
            mass_accuracy_ppm: accuracy,
            polarity: self.config.polarity,
        }
    }

    fn generate_survey(&mut self) -> Result<ScanItem> {
        let peak_count = self
            .config
            .survey_peak_count
            .unwrap_or_else(|| self.rng.gen_range(500..2000));
        let (mz, intensity) =
            self.generate_spectrum(peak_count, self.config.min_mz, self.config.max_mz, 1e6, 1e8)?;

        let mut item = ScanItem::new(1, self.analyzer_info(1));
        item.retention_time = self.retention_time;
        item.set_payload(mz, intensity);
        Ok(item)
    }

    fn generate_fragment(&mut self, precursor: PrecursorInfo) -> Result<ScanItem> {
        let peak_count = self
            .config
            .fragment_peak_count
            .unwrap_or_else(|| self.rng.gen_range(50..300));

        // Fragments sit below the precursor m/z at a fraction of its
        // intensity.
        let max_mz = precursor.mz * 0.95;
        let (mz, intensity) = self.generate_spectrum(
            peak_count,
            100.0_f64.min(max_mz / 2.0),
            max_mz,
            precursor.intensity * 0.01,
            precursor.intensity * 0.5,
        )?;

        let mut item = ScanItem::new(2, self.analyzer_info(2));
        item.retention_time = self.retention_time;
        item.set_payload(mz, intensity);
        item.precursor = Some(precursor);
        Ok(item)
    }

    /// Builds a spectrum of `peak_count` peaks: ~20% structured peaks with
    /// isotope envelopes, the rest a normal-distributed noise floor, sorted
    /// ascending by m/z.
    fn generate_spectrum(
        &mut self,
        peak_count: usize,
        min_mz: f64,
        max_mz: f64,
        min_intensity: f64,
        max_intensity: f64,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let mut mz_values = Vec::with_capacity(peak_count);
        let mut intensity_values = Vec::with_capacity(peak_count);

        let base_peak_count = peak_count / 5;
        for _ in 0..base_peak_count {
            let base_mz = self.rng.gen_range(min_mz..max_mz);
            let base_intensity = self.rng.gen_range(min_intensity..max_intensity);

            mz_values.push(base_mz);
            intensity_values.push(base_intensity);

            // A+1 isotope at 40-80% of the monoisotopic peak.
            if self.rng.gen_bool(0.8) {
                mz_values.push(base_mz + ISOTOPE_SPACING);
                intensity_values.push(base_intensity * self.rng.gen_range(0.4..0.8));
            }

            // A+2 isotope at 10-40%.
            if self.rng.gen_bool(0.6) {
                mz_values.push(base_mz + 2.0 * ISOTOPE_SPACING);
                intensity_values.push(base_intensity * self.rng.gen_range(0.1..0.4));
            }
        }

        let noise = Normal::new(0.0, min_intensity * 0.1)?;
        let noise_count = peak_count.saturating_sub(mz_values.len());
        for _ in 0..noise_count {
            let mz = self.rng.gen_range(min_mz..max_mz);
            let magnitude: f64 = noise.sample(&mut self.rng).abs();
            mz_values.push(mz);
            intensity_values.push(min_intensity * 0.01 + magnitude);
        }

        // Spectrum arrays are kept sorted by m/z.
        let mut indices: Vec<usize> = (0..mz_values.len()).collect();
        indices.sort_by(|&a, &b| mz_values[a].total_cmp(&mz_values[b]));

        let sorted_mz: Vec<f64> = indices.iter().map(|&i| mz_values[i]).collect();
        let sorted_intensity: Vec<f64> = indices.iter().map(|&i| intensity_values[i]).collect();
        Ok((sorted_mz, sorted_intensity))
    }

    /// Chooses a precursor among the survey's 20 most intense peaks.
    fn select_precursor(&mut self, survey: &ScanItem) -> PrecursorInfo {
        let (mz, intensity) = if survey.mz_values.is_empty() {
            (500.0, 1e6)
        } else {
            let mut ranked: Vec<(usize, f64)> = survey
                .intensity_values
                .iter()
                .enumerate()
                .map(|(i, &v)| (i, v))
                .collect();
            ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

            let top_n = ranked.len().min(20);
            let (peak_idx, _) = ranked[self.rng.gen_range(0..top_n)];
            (survey.mz_values[peak_idx], survey.intensity_values[peak_idx])
        };

        PrecursorInfo {
            mz,
            intensity,
            charge: self.rng.gen_range(2..=4),
            isolation_width: 1.6,
            collision_energy: 30.0,
            activation: ActivationKind::Hcd,
        }
    }
}

#[async_trait]
impl ScanSource for SyntheticSource {
    fn description(&self) -> &str {
        "synthetic generator"
    }

    async fn next_cycle(&mut self) -> Result<Vec<ScanItem>> {
        let survey = self.generate_survey()?;

        let fragment_count = if self.config.max_fragments_per_survey == 0 {
            0
        } else {
            self.rng.gen_range(1..=self.config.max_fragments_per_survey)
        };

        let mut cycle = Vec::with_capacity(1 + fragment_count as usize);
        for _ in 0..fragment_count {
            let precursor = self.select_precursor(&survey);
            cycle.push(self.generate_fragment(precursor)?);
        }
        cycle.insert(0, survey);

        self.retention_time += self.config.seconds_per_cycle / 60.0;
        Ok(cycle)
    }
}
