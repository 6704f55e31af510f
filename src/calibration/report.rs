//! Run report and the sink that receives finished results.

use std::time::Duration;

use crate::PerRoc;
use crate::defect::{ClassificationResult, ThresholdDistribution};
use crate::error::Error;
use crate::surface::ResponseSurface;
use crate::surface::operating_point::OperatingPoint;
use crate::threshold::{PixelMap, ThresholdMap};

/// What happened to one ROC's CalDel/VthrComp during calibration.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatingPointOutcome {
    Applied(OperatingPoint),
    /// Extraction or register write failed; the ROC kept its prior settings.
    Retained { caldel: u8, vthrcomp: u8, reason: Error },
    /// The ROC's registers could not be read.
    Failed { reason: Error },
}

impl OperatingPointOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, OperatingPointOutcome::Applied(_))
    }

    /// CalDel the ROC was left at, if known.
    pub fn caldel(&self) -> Option<u8> {
        match self {
            OperatingPointOutcome::Applied(p) => Some(p.param1),
            OperatingPointOutcome::Retained { caldel, .. } => Some(*caldel),
            OperatingPointOutcome::Failed { .. } => None,
        }
    }

    pub fn vthrcomp(&self) -> Option<u8> {
        match self {
            OperatingPointOutcome::Applied(p) => Some(p.param2),
            OperatingPointOutcome::Retained { vthrcomp, .. } => Some(*vthrcomp),
            OperatingPointOutcome::Failed { .. } => None,
        }
    }
}

/// Receives finished, immutable results for display or storage.
///
/// Every method defaults to doing nothing.
pub trait ReportSink {
    /// CalDel x VthrComp surface of one ROC with its operating point, if any.
    fn surface(&mut self, _roc: u8, _surface: &ResponseSurface, _point: Option<&OperatingPoint>) {}

    fn operating_points(&mut self, _outcomes: &PerRoc<OperatingPointOutcome>) {}

    fn distribution(
        &mut self,
        _roc: u8,
        _distribution: &ThresholdDistribution,
        _result: &ClassificationResult,
    ) {
    }

    /// `(threshold - mean) / sigma` per pixel.
    fn rescaled_map(&mut self, _roc: u8, _map: &PixelMap) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ReportSink for NullSink {}

#[derive(Debug, Clone)]
pub struct BumpBondReport {
    pub operating_points: PerRoc<OperatingPointOutcome>,
    pub thresholds: PerRoc<ThresholdMap>,
    pub classifications: PerRoc<ClassificationResult>,
    /// Readout errors over both scans.
    pub daq_errors: u32,
    /// False if either scan ended with partial data.
    pub complete: bool,
    pub duration: Duration,
}

impl BumpBondReport {
    /// CalDel per ROC; values kept from before the run are marked `_`,
    /// unreadable ones print `-`.
    pub fn caldel_summary(&self) -> String {
        operating_point_line(&self.operating_points, OperatingPointOutcome::caldel)
    }

    pub fn vthrcomp_summary(&self) -> String {
        operating_point_line(&self.operating_points, OperatingPointOutcome::vthrcomp)
    }

    /// Defective pixels per ROC; `-` where no population peak was found.
    pub fn dead_bumps_summary(&self) -> String {
        self.classifications
            .values()
            .map(|c| match c.defective_pixel_count() {
                Some(n) => format!(" {n:4}"),
                None => format!(" {:>4}", "-"),
            })
            .collect()
    }

    pub fn separation_cut_summary(&self) -> String {
        self.classifications
            .values()
            .map(|c| match c.separation_cut() {
                Some(cut) => format!(" {cut:4}"),
                None => format!(" {:>4}", "-"),
            })
            .collect()
    }

    /// ROCs whose classification found no population peak.
    pub fn unclassified_rocs(&self) -> Vec<u8> {
        self.classifications
            .iter()
            .filter(|(_, c)| c.defective_pixel_count().is_none())
            .map(|(&roc, _)| roc)
            .collect()
    }
}

pub(crate) fn operating_point_line(
    outcomes: &PerRoc<OperatingPointOutcome>,
    value: fn(&OperatingPointOutcome) -> Option<u8>,
) -> String {
    outcomes
        .values()
        .map(|o| {
            let marker = if o.is_applied() { ' ' } else { '_' };
            match value(o) {
                Some(v) => format!(" {marker}{v:4}"),
                None => format!(" {marker}{:>4}", "-"),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defect::Outcome;

    fn report() -> BumpBondReport {
        let mut operating_points = PerRoc::new();
        operating_points.insert(
            0,
            OperatingPointOutcome::Applied(OperatingPoint {
                param1: 102,
                param1_uncertainty: 20.0,
                param2: 118,
            }),
        );
        operating_points.insert(
            1,
            OperatingPointOutcome::Retained {
                caldel: 95,
                vthrcomp: 90,
                reason: Error::DegenerateProjection,
            },
        );

        operating_points.insert(
            2,
            OperatingPointOutcome::Failed {
                reason: Error::UnknownRoc(2),
            },
        );

        let mut classifications = PerRoc::new();
        classifications.insert(
            0,
            ClassificationResult {
                peak_mean: 100.2,
                peak_sigma: 5.1,
                outcome: Outcome::Separated {
                    separation_cut: 121,
                    defective_pixels: 42,
                },
            },
        );
        classifications.insert(
            1,
            ClassificationResult {
                peak_mean: 0.0,
                peak_sigma: 0.0,
                outcome: Outcome::NoPeakFound,
            },
        );

        BumpBondReport {
            operating_points,
            thresholds: PerRoc::new(),
            classifications,
            daq_errors: 0,
            complete: true,
            duration: Duration::from_secs(1),
        }
    }

    #[test]
    fn retained_values_are_marked() {
        let r = report();
        assert_eq!(r.caldel_summary(), "   102 _  95 _   -");
        assert_eq!(r.vthrcomp_summary(), "   118 _  90 _   -");
    }

    #[test]
    fn missing_peak_is_not_zero() {
        let r = report();
        assert_eq!(r.dead_bumps_summary(), "   42    -");
        assert_eq!(r.separation_cut_summary(), "  121    -");
        assert_eq!(r.unclassified_rocs(), vec![1]);
    }
}
