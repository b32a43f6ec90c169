//! Declarative per-scan predicates for the controller's pull streams.

use serde::{Deserialize, Serialize};

use crate::scan::{FrozenScanItem, Polarity};

/// An immutable set of optional match criteria.
///
/// [`ScanFilter::matches`] is a pure conjunction: every set criterion must
/// hold, and an unset criterion always passes. The default filter matches
/// everything.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Match only scans of exactly this MS order.
    pub ms_order: Option<u8>,
    /// Inclusive lower bound on retention time, in minutes.
    pub min_retention_time: Option<f64>,
    /// Inclusive upper bound on retention time, in minutes.
    pub max_retention_time: Option<f64>,
    /// Match only scans of this polarity.
    pub polarity: Option<Polarity>,
    /// Match only scans from this analyzer (case-insensitive).
    pub analyzer: Option<String>,
}

impl ScanFilter {
    /// A filter that matches every scan.
    pub fn any() -> Self {
        Self::default()
    }

    /// Restricts to scans of exactly this MS order.
    pub fn with_ms_order(mut self, order: u8) -> Self {
        self.ms_order = Some(order);
        self
    }

    /// Restricts to retention times in `[min, max]` minutes.
    pub fn with_retention_window(mut self, min: f64, max: f64) -> Self {
        self.min_retention_time = Some(min);
        self.max_retention_time = Some(max);
        self
    }

    /// Restricts to scans of this polarity.
    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = Some(polarity);
        self
    }

    /// Restricts to scans from this analyzer, compared case-insensitively.
    pub fn with_analyzer(mut self, analyzer: impl Into<String>) -> Self {
        self.analyzer = Some(analyzer.into());
        self
    }

    /// Evaluates the conjunction of all set criteria against one scan.
    pub fn matches(&self, scan: &FrozenScanItem) -> bool {
        if let Some(order) = self.ms_order {
            if scan.ms_order != order {
                return false;
            }
        }
        if let Some(min) = self.min_retention_time {
            if scan.retention_time < min {
                return false;
            }
        }
        if let Some(max) = self.max_retention_time {
            if scan.retention_time > max {
                return false;
            }
        }
        if let Some(polarity) = self.polarity {
            if scan.analyzer.polarity != polarity {
                return false;
            }
        }
        if let Some(ref analyzer) = self.analyzer {
            if !scan.analyzer.name.eq_ignore_ascii_case(analyzer) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{AnalyzerInfo, Freeze, ScanItem};

    fn scan(ms_order: u8, retention_time: f64) -> FrozenScanItem {
        let mut item = ScanItem::new(ms_order, AnalyzerInfo::default());
        item.retention_time = retention_time;
        item.set_payload(vec![400.0], vec![1.0e6]);
        item.freeze()
    }

    #[test]
    fn unset_filter_matches_everything() {
        assert!(ScanFilter::any().matches(&scan(1, 0.0)));
        assert!(ScanFilter::any().matches(&scan(2, 99.0)));
    }

    #[test]
    fn order_criterion_is_exact() {
        let filter = ScanFilter::any().with_ms_order(1);
        assert!(filter.matches(&scan(1, 5.0)));
        assert!(!filter.matches(&scan(2, 5.0)));
    }

    #[test]
    fn retention_window_is_inclusive() {
        let filter = ScanFilter::any().with_retention_window(5.0, 15.0);
        assert!(filter.matches(&scan(1, 10.0)));
        assert!(filter.matches(&scan(1, 5.0)));
        assert!(filter.matches(&scan(1, 15.0)));
        assert!(!filter.matches(&scan(1, 3.0)));
        assert!(!filter.matches(&scan(1, 20.0)));
    }

    #[test]
    fn polarity_criterion() {
        let filter = ScanFilter::any().with_polarity(Polarity::Negative);
        assert!(!filter.matches(&scan(1, 1.0)));
    }

    #[test]
    fn analyzer_criterion_ignores_case() {
        let filter = ScanFilter::any().with_analyzer("orbitrap");
        assert!(filter.matches(&scan(1, 1.0)));
        let filter = ScanFilter::any().with_analyzer("TOF");
        assert!(!filter.matches(&scan(1, 1.0)));
    }

    #[test]
    fn criteria_combine_as_conjunction() {
        let filter = ScanFilter::any()
            .with_ms_order(1)
            .with_retention_window(0.0, 2.0);
        assert!(filter.matches(&scan(1, 1.0)));
        assert!(!filter.matches(&scan(2, 1.0)));
        assert!(!filter.matches(&scan(1, 3.0)));
    }
}
