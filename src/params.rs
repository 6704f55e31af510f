use std::str::FromStr;

use crate::daq::{DacRange, Pixel};
use crate::error::{Error, Result};
use crate::fit::peaks::PeakSearchParams;

/// All tunables of the bump-bond calibration.
#[derive(Debug, Clone)]
pub struct BumpBondParams {
    pub ntrig: u16,
    pub nsigma: f64,

    // Operating point (CalDel x VthrComp tornado)
    pub probe_pixel: Pixel,
    pub caldel_range: DacRange,
    pub vthrcomp_range: DacRange,
    /// Signed offset from the bottom (> 0) or top (<= 0) tornado edge.
    pub delta_vthrcomp: i32,
    pub frac_caldel: f64,
    /// CalDel bins skipped when projecting onto VthrComp.
    pub edge_skip_bins: usize,
    pub tornado_vcal: u8,
    pub ctrlreg: u8,

    // Threshold map
    pub vcal_range: DacRange,

    pub acquisition: AcquisitionPolicy,
    pub classifier: ClassifierParams,
}

impl Default for BumpBondParams {
    fn default() -> Self {
        Self {
            ntrig: 10,
            nsigma: 4.0,

            probe_pixel: Pixel { row: 11, col: 20 },
            caldel_range: DacRange::new(0, 255),
            vthrcomp_range: DacRange::new(0, 180),
            delta_vthrcomp: -25,
            frac_caldel: 0.5,
            edge_skip_bins: 4,
            tornado_vcal: 250,
            ctrlreg: 4,

            vcal_range: DacRange::new(50, 200),

            acquisition: AcquisitionPolicy::default(),
            classifier: ClassifierParams::default(),
        }
    }
}

impl BumpBondParams {
    /// Set a parameter by its (case-insensitive) name.
    ///
    /// Returns `Ok(false)` when the name is not known to this test.
    pub fn set_parameter(&mut self, name: &str, value: &str) -> Result<bool> {
        let name = name.to_lowercase();
        let value: String = value.chars().filter(|c| *c != ' ').collect();
        let mut next = self.clone();
        match name.as_str() {
            "ntrig" => next.ntrig = parse(&name, &value)?,
            "nsigma" => {
                next.nsigma = parse(&name, &value)?;
                next.classifier.nsigma = next.nsigma;
            }
            "deltavthrcomp" => next.delta_vthrcomp = parse(&name, &value)?,
            "fraccaldel" => next.frac_caldel = parse(&name, &value)?,
            "row" => next.probe_pixel.row = parse(&name, &value)?,
            "col" => next.probe_pixel.col = parse(&name, &value)?,
            "vcallo" => next.vcal_range.lo = parse(&name, &value)?,
            "vcalhi" => next.vcal_range.hi = parse(&name, &value)?,
            _ => return Ok(false),
        }
        if next.vcal_range.lo > next.vcal_range.hi {
            return Err(Error::InvalidParameter { name, value });
        }
        *self = next;
        Ok(true)
    }
}

/// Bounded-retry policy for a single sweep.
#[derive(Debug, Clone, Copy)]
pub struct AcquisitionPolicy {
    /// Total sweep attempts before partial data is accepted.
    pub max_attempts: u32,
    /// Losing more events than this abandons the retry cycle.
    pub missing_events_give_up: u32,
}

impl Default for AcquisitionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            missing_events_give_up: 10,
        }
    }
}

/// Parameters of the threshold-distribution classifier.
#[derive(Debug, Clone)]
pub struct ClassifierParams {
    pub nsigma: f64,
    /// Distribution spans `[0, bins)` with unit-wide bins.
    pub bins: usize,
    /// Threshold assigned to pixels whose S-curve fit failed.
    pub sentinel: f64,
    /// Peaks below this position are dead pixels.
    pub dead_peak_below: f64,
    /// Peaks at or above this position are failed fits.
    pub failed_fit_from: f64,
    pub fit_half_window: f64,
    pub seed_width: f64,
    pub peak_search: PeakSearchParams,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        Self {
            nsigma: 4.0,
            bins: 256,
            sentinel: 255.0,
            dead_peak_below: 10.0,
            failed_fit_from: 250.0,
            fit_half_window: 25.0,
            seed_width: 2.0,
            peak_search: PeakSearchParams::default(),
        }
    }
}

/// Parameters of the forward-bias bump test.
#[derive(Debug, Clone)]
pub struct ForwardBiasParams {
    pub ntrig: u16,
    pub vcal: u8,
    pub supply_microamps: f64,
    pub compliance_microamps: f64,
    pub acquisition: AcquisitionPolicy,
}

impl Default for ForwardBiasParams {
    fn default() -> Self {
        Self {
            ntrig: 10,
            vcal: 200,
            supply_microamps: 100.0,
            compliance_microamps: 101.0,
            acquisition: AcquisitionPolicy::default(),
        }
    }
}

impl ForwardBiasParams {
    pub fn set_parameter(&mut self, name: &str, value: &str) -> Result<bool> {
        let name = name.to_lowercase();
        let value: String = value.chars().filter(|c| *c != ' ').collect();
        match name.as_str() {
            "ntrig" => self.ntrig = parse(&name, &value)?,
            "vcal" => self.vcal = parse(&name, &value)?,
            _ => return Ok(false),
        }
        Ok(true)
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| Error::InvalidParameter {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_parameter_is_case_insensitive_and_strips_spaces() {
        let mut params = BumpBondParams::default();
        assert_eq!(params.set_parameter("NTrig", " 2 5 "), Ok(true));
        assert_eq!(params.ntrig, 25);
        assert_eq!(params.set_parameter("nsigma", "3.5"), Ok(true));
        assert_eq!(params.classifier.nsigma, 3.5);
    }

    #[test]
    fn unknown_parameter_is_not_an_error() {
        let mut params = BumpBondParams::default();
        assert_eq!(params.set_parameter("port", "/dev/ttyUSB0"), Ok(false));
    }

    #[test]
    fn unparsable_value_is_rejected() {
        let mut params = BumpBondParams::default();
        let err = params.set_parameter("ntrig", "many").unwrap_err();
        assert!(matches!(err, Error::InvalidParameter { .. }));
        assert_eq!(params.ntrig, 10);
    }

    #[test]
    fn inverted_vcal_range_is_rejected() {
        let mut params = BumpBondParams::default();
        assert!(params.set_parameter("vcallo", "220").is_err());
    }
}
