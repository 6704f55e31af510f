//! Operating point from a tornado-shaped response surface.

use super::{Axis, ResponseSurface};
use crate::daq::DacRange;
use crate::error::Result;

/// Two-DAC working point of one ROC.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperatingPoint {
    pub param1: u8,
    /// Half the width of the param1 plateau at `param2`.
    pub param1_uncertainty: f64,
    pub param2: u8,
}

/// Places the operating point inside the response plateau.
///
/// param2 sits `delta_param2` above the bottom edge of the param2 profile
/// when positive, otherwise `|delta_param2|` below its top edge. param1 is
/// then placed at `frac_param1` of the plateau width at that param2 row.
#[derive(Debug, Clone, Copy)]
pub struct OperatingPointExtractor {
    pub delta_param2: i32,
    pub frac_param1: f64,
    /// Leading param1 bins left out of the param2 profile.
    pub edge_skip_bins: usize,
}

impl Default for OperatingPointExtractor {
    fn default() -> Self {
        Self {
            delta_param2: -25,
            frac_param1: 0.5,
            edge_skip_bins: 4,
        }
    }
}

impl OperatingPointExtractor {
    pub fn extract(&self, surface: &ResponseSurface) -> Result<OperatingPoint> {
        let p1 = surface.param1();
        let p2 = surface.param2();

        let skip_to = (p1.lo as usize + self.edge_skip_bins).min(u8::MAX as usize) as u8;
        let profile2 = surface.project(Axis::Param2, DacRange::new(skip_to, p1.hi));
        let (bottom, top) = profile2.half_max_edges()?;
        let bottom = profile2.dac_at(bottom) as i32;
        let top = profile2.dac_at(top) as i32;

        let target = if self.delta_param2 > 0 {
            bottom + self.delta_param2
        } else {
            top + self.delta_param2
        };
        let clamped = target.clamp(p2.lo as i32, p2.hi as i32);
        if clamped != target {
            log::warn!("param2 target {target} outside sweep, using {clamped}");
        }
        let param2 = clamped as u8;

        let profile1 = surface.project(Axis::Param1, DacRange::new(param2, param2));
        let (first, last) = profile1.half_max_edges()?;
        let first = profile1.dac_at(first) as f64;
        let width = profile1.dac_at(last) as f64 - first;

        Ok(OperatingPoint {
            param1: (first + self.frac_param1 * width) as u8,
            param1_uncertainty: 0.5 * width,
            param2,
        })
    }
}
