//! Per-pixel threshold maps from S-curve scans.

use crate::PerRoc;
use crate::daq::acquire::{ScanAcquirer, Sweep};
use crate::daq::guard::PixelSelection;
use crate::daq::{DacRange, Pixel, ROC_COLS, ROC_ROWS, ResponseSample, ScanFlags, Testboard};
use crate::fit::CurveFitter;

/// One value per pixel of a ROC, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMap {
    values: Vec<f64>,
}

/// Per-pixel thresholds in DAC units; failed fits hold the sentinel.
pub type ThresholdMap = PixelMap;

impl PixelMap {
    pub fn filled(value: f64) -> Self {
        Self {
            values: vec![value; ROC_COLS * ROC_ROWS],
        }
    }

    /// `None` for pixels off the chip.
    pub fn get(&self, pixel: Pixel) -> Option<f64> {
        pixel.checked_index().map(|i| self.values[i])
    }

    pub fn get_mut(&mut self, pixel: Pixel) -> Option<&mut f64> {
        pixel.checked_index().map(|i| &mut self.values[i])
    }

    /// Off-chip pixels are ignored.
    pub fn set(&mut self, pixel: Pixel, value: f64) {
        if let Some(v) = self.get_mut(pixel) {
            *v = value;
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (Pixel, f64)> + '_ {
        self.values
            .iter()
            .enumerate()
            .map(|(i, &v)| (Pixel::from_index(i), v))
    }

    pub fn count_equal(&self, value: f64) -> usize {
        self.values.iter().filter(|&&v| v == value).count()
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> PixelMap {
        PixelMap {
            values: self.values.iter().map(|&v| f(v)).collect(),
        }
    }
}

/// Output of a threshold scan over all enabled ROCs.
#[derive(Debug, Clone)]
pub struct ThresholdScan {
    pub maps: PerRoc<ThresholdMap>,
    /// Pixels per ROC that were assigned the sentinel.
    pub failed_fits: PerRoc<usize>,
    pub daq_errors: u32,
    pub complete: bool,
}

/// Runs a threshold scan and fits one S-curve per pixel.
///
/// A fit that fails, or lands outside `[0, sentinel]`, yields `sentinel`.
#[derive(Debug, Clone)]
pub struct ThresholdMapBuilder<F: CurveFitter> {
    fitter: F,
    acquirer: ScanAcquirer,
    sentinel: f64,
}

impl<F: CurveFitter> ThresholdMapBuilder<F> {
    pub fn new(fitter: F, acquirer: ScanAcquirer, sentinel: f64) -> Self {
        Self {
            fitter,
            acquirer,
            sentinel,
        }
    }

    /// Sweep `dac` over `range` with every pixel enabled and reduce the hits
    /// to one threshold per pixel.
    pub fn build<D: Testboard>(
        &self,
        dut: &mut D,
        dac: &str,
        range: DacRange,
        ntrig: u16,
        flags: ScanFlags,
    ) -> ThresholdScan {
        let rocs = dut.enabled_rocs();
        let acquisition = self.acquirer.acquire(
            dut,
            PixelSelection::All,
            Sweep::OneD { dac, range },
            ntrig,
            flags,
        );

        let maps = self.maps_from_samples(&acquisition.samples, &rocs, range);
        let failed_fits = maps
            .iter()
            .map(|(&roc, map)| (roc, map.count_equal(self.sentinel)))
            .collect::<PerRoc<usize>>();
        for (roc, failed) in &failed_fits {
            log::debug!("ROC {roc}: {failed} pixels without threshold");
        }

        ThresholdScan {
            maps,
            failed_fits,
            daq_errors: acquisition.daq_errors,
            complete: acquisition.complete,
        }
    }

    /// Fill S-curves from sweep samples and fit them.
    pub fn maps_from_samples(
        &self,
        samples: &[ResponseSample],
        rocs: &[u8],
        range: DacRange,
    ) -> PerRoc<ThresholdMap> {
        let npix = ROC_COLS * ROC_ROWS;
        let nbins = range.len();
        let mut curves: PerRoc<Vec<f64>> = rocs
            .iter()
            .map(|&roc| (roc, vec![0.0; npix * nbins]))
            .collect();
        for s in samples {
            let Some(index) = s.pixel.checked_index() else {
                continue;
            };
            if let (Some(curve), Some(bin)) = (curves.get_mut(&s.roc), range.index_of(s.param1)) {
                curve[index * nbins + bin] += s.count as f64;
            }
        }

        let xs: Vec<f64> = range.values().map(f64::from).collect();
        curves
            .into_iter()
            .map(|(roc, curve)| {
                let mut map = ThresholdMap::filled(self.sentinel);
                if nbins > 0 {
                    for (i, ys) in curve.chunks(nbins).enumerate() {
                        map.values[i] = self.threshold(&xs, ys);
                    }
                }
                (roc, map)
            })
            .collect()
    }

    fn threshold(&self, xs: &[f64], ys: &[f64]) -> f64 {
        match self.fitter.fit_scurve(xs, ys) {
            Ok(fit) if fit.threshold >= 0.0 && fit.threshold <= self.sentinel => fit.threshold,
            _ => self.sentinel,
        }
    }
}
