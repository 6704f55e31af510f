//! DAC-DAC response surfaces and their one-dimensional projections.

pub mod operating_point;

use crate::PerRoc;
use crate::daq::{DacRange, ResponseSample};
use crate::error::{Error, Result};

/// Axis of a [`ResponseSurface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Param1,
    Param2,
}

/// Accumulated hit counts over a grid of two DAC values for one ROC.
///
/// One bin per DAC value; the grid size is fixed by the sweep ranges.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSurface {
    param1: DacRange,
    param2: DacRange,
    counts: Vec<u32>,
}

impl ResponseSurface {
    pub fn new(param1: DacRange, param2: DacRange) -> Self {
        Self {
            param1,
            param2,
            counts: vec![0; param1.len() * param2.len()],
        }
    }

    /// Group 2D sweep samples by ROC. ROCs without hits get an empty surface.
    pub fn from_samples(
        samples: &[ResponseSample],
        rocs: &[u8],
        param1: DacRange,
        param2: DacRange,
    ) -> PerRoc<ResponseSurface> {
        let mut surfaces: PerRoc<ResponseSurface> = rocs
            .iter()
            .map(|&roc| (roc, ResponseSurface::new(param1, param2)))
            .collect();
        for s in samples {
            let (Some(surface), Some(p2)) = (surfaces.get_mut(&s.roc), s.param2) else {
                continue;
            };
            surface.fill(s.param1, p2, s.count as u32);
        }
        surfaces
    }

    pub fn param1(&self) -> DacRange {
        self.param1
    }

    pub fn param2(&self) -> DacRange {
        self.param2
    }

    /// Add `count` at the given DAC values. Returns false when outside the grid.
    pub fn fill(&mut self, p1: u8, p2: u8, count: u32) -> bool {
        match (self.param1.index_of(p1), self.param2.index_of(p2)) {
            (Some(i1), Some(i2)) => {
                self.counts[i2 * self.param1.len() + i1] += count;
                true
            }
            _ => false,
        }
    }

    /// Count at the given DAC values, zero outside the grid.
    pub fn get(&self, p1: u8, p2: u8) -> u32 {
        match (self.param1.index_of(p1), self.param2.index_of(p2)) {
            (Some(i1), Some(i2)) => self.counts[i2 * self.param1.len() + i1],
            _ => 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|&c| c as u64).sum()
    }

    /// Project onto `axis`, summing the orthogonal axis over `range` (DAC
    /// values, clipped to the grid).
    pub fn project(&self, axis: Axis, range: DacRange) -> Projection {
        let (along, across) = match axis {
            Axis::Param1 => (self.param1, self.param2),
            Axis::Param2 => (self.param2, self.param1),
        };
        let mut values = vec![0.0; along.len()];
        let lo = range.lo.max(across.lo);
        let hi = range.hi.min(across.hi);
        if lo <= hi {
            for a in along.values() {
                let sum: u64 = (lo..=hi)
                    .map(|b| {
                        let count = match axis {
                            Axis::Param1 => self.get(a, b),
                            Axis::Param2 => self.get(b, a),
                        };
                        count as u64
                    })
                    .sum();
                values[(a - along.lo) as usize] = sum as f64;
            }
        }
        Projection {
            axis,
            range: along,
            values,
        }
    }
}

/// One-dimensional profile of a surface along one axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub axis: Axis,
    /// DAC values of the bins.
    pub range: DacRange,
    pub values: Vec<f64>,
}

impl Projection {
    /// DAC value of bin `bin`.
    pub fn dac_at(&self, bin: usize) -> u8 {
        (self.range.lo as usize + bin).min(u8::MAX as usize) as u8
    }

    pub fn sum(&self) -> f64 {
        self.values.iter().sum()
    }

    /// First and last bin above half of the maximum.
    pub fn half_max_edges(&self) -> Result<(usize, usize)> {
        let max = self.values.iter().copied().fold(0.0, f64::max);
        if max <= 0.0 {
            return Err(Error::DegenerateProjection);
        }
        let half = 0.5 * max;
        let first = self.values.iter().position(|&v| v > half);
        let last = self.values.iter().rposition(|&v| v > half);
        match (first, last) {
            (Some(first), Some(last)) => Ok((first, last)),
            _ => Err(Error::DegenerateProjection),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::Pixel;

    fn plateau(lo: usize, hi: usize, height: f64) -> Projection {
        let values = (0..=255)
            .map(|i| if i >= lo && i <= hi { height } else { 0.0 })
            .collect();
        Projection {
            axis: Axis::Param1,
            range: DacRange::new(0, 255),
            values,
        }
    }

    #[test]
    fn projection_conserves_counts() {
        let mut surface = ResponseSurface::new(DacRange::new(0, 99), DacRange::new(10, 59));
        let mut expected = 0.0;
        for p1 in 0..100u8 {
            for p2 in 10..60u8 {
                let c = (p1 as u32 * 7 + p2 as u32 * 3) % 11;
                surface.fill(p1, p2, c);
                if (20..=40).contains(&p2) {
                    expected += c as f64;
                }
            }
        }
        let proj = surface.project(Axis::Param1, DacRange::new(20, 40));
        assert_eq!(proj.values.len(), 100);
        assert_eq!(proj.sum(), expected);

        let full = surface.project(Axis::Param2, DacRange::new(0, 255));
        assert_eq!(full.values.len(), 50);
        assert_eq!(full.sum(), surface.total() as f64);
    }

    #[test]
    fn fill_outside_grid_is_ignored() {
        let mut surface = ResponseSurface::new(DacRange::new(0, 9), DacRange::new(0, 9));
        assert!(!surface.fill(10, 0, 5));
        assert!(surface.fill(9, 9, 5));
        assert_eq!(surface.total(), 5);
    }

    #[test]
    fn half_max_edges_of_plateau() {
        let (first, last) = plateau(10, 40, 37.0).half_max_edges().unwrap();
        assert_eq!((first, last), (10, 40));
    }

    #[test]
    fn half_max_edges_ignore_low_shoulders() {
        let mut proj = plateau(10, 40, 100.0);
        proj.values[5] = 49.0;
        proj.values[45] = 50.0;
        proj.values[41] = 51.0;
        assert_eq!(proj.half_max_edges().unwrap(), (10, 41));
    }

    #[test]
    fn all_zero_projection_is_degenerate() {
        let proj = plateau(0, 0, 0.0);
        assert_eq!(proj.half_max_edges(), Err(Error::DegenerateProjection));
    }

    #[test]
    fn samples_are_grouped_per_roc() {
        let samples = [
            ResponseSample {
                roc: 1,
                pixel: Pixel { row: 11, col: 20 },
                param1: 3,
                param2: Some(4),
                count: 9,
            },
            ResponseSample {
                roc: 7,
                pixel: Pixel { row: 11, col: 20 },
                param1: 3,
                param2: Some(4),
                count: 2,
            },
        ];
        let surfaces =
            ResponseSurface::from_samples(&samples, &[0, 1], DacRange::new(0, 9), DacRange::new(0, 9));
        assert_eq!(surfaces.len(), 2);
        assert_eq!(surfaces[&0].total(), 0);
        assert_eq!(surfaces[&1].get(3, 4), 9);
    }
}
