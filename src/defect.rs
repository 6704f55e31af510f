//! Bump-bond classification from threshold distributions.
//!
//! Good bumps form one dominant population in a ROC's threshold
//! distribution. Its position and width come from a Gaussian fit around the
//! highest usable peak; pixels more than `nsigma` widths above it are called
//! defective. Peaks near zero (dead pixels) and at the failed-fit sentinel are
//! never taken as the good population.

use crate::fit::peaks::{PeakCandidate, PeakSearch};
use crate::fit::{CurveFitter, Gaussian};
use crate::params::ClassifierParams;
use crate::threshold::{PixelMap, ThresholdMap};

/// Histogram of thresholds with unit-wide bins over `[0, bins)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdDistribution {
    counts: Vec<f64>,
}

impl ThresholdDistribution {
    /// Values outside the axis land in the first or last bin, so the total
    /// always equals the number of values.
    pub fn from_values(values: impl IntoIterator<Item = f64>, bins: usize) -> Self {
        let mut counts = vec![0.0; bins.max(1)];
        let last = counts.len() - 1;
        for v in values {
            let bin = if v.is_nan() || v < 0.0 {
                0
            } else {
                (v.floor() as usize).min(last)
            };
            counts[bin] += 1.0;
        }
        Self { counts }
    }

    pub fn from_map(map: &ThresholdMap, bins: usize) -> Self {
        Self::from_values(map.values().iter().copied(), bins)
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    pub fn total(&self) -> f64 {
        self.counts.iter().sum()
    }

    pub fn max(&self) -> f64 {
        self.counts.iter().copied().fold(0.0, f64::max)
    }

    /// Bin containing `x`; `x` past the axis gives the overflow index `bins`.
    pub fn bin_of(&self, x: f64) -> usize {
        if x < 0.0 {
            0
        } else {
            (x.floor() as usize).min(self.counts.len())
        }
    }

    /// Sum of bins `from..`.
    pub fn integral_from(&self, from: usize) -> f64 {
        self.counts.get(from..).map_or(0.0, |tail| tail.iter().sum())
    }

    /// `(bin centre, content)` pairs.
    pub fn sample(&self) -> Vec<(f64, f64)> {
        self.counts
            .iter()
            .enumerate()
            .map(|(i, &c)| (i as f64 + 0.5, c))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Outcome {
    Separated {
        /// Last bin still counted as good.
        separation_cut: usize,
        /// Pixels in bins above `separation_cut`.
        defective_pixels: u32,
    },
    /// No population peak survived; the defect count is unknown.
    NoPeakFound,
}

/// Classification of one ROC.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassificationResult {
    pub peak_mean: f64,
    pub peak_sigma: f64,
    pub outcome: Outcome,
}

impl ClassificationResult {
    fn no_peak() -> Self {
        Self {
            peak_mean: 0.0,
            peak_sigma: 0.0,
            outcome: Outcome::NoPeakFound,
        }
    }

    pub fn defective_pixel_count(&self) -> Option<u32> {
        match self.outcome {
            Outcome::Separated {
                defective_pixels, ..
            } => Some(defective_pixels),
            Outcome::NoPeakFound => None,
        }
    }

    pub fn separation_cut(&self) -> Option<usize> {
        match self.outcome {
            Outcome::Separated { separation_cut, .. } => Some(separation_cut),
            Outcome::NoPeakFound => None,
        }
    }

    /// `(threshold - mean) / sigma` per pixel, for display.
    pub fn rescaled(&self, map: &ThresholdMap) -> Option<PixelMap> {
        if self.outcome == Outcome::NoPeakFound || self.peak_sigma <= 0.0 {
            return None;
        }
        Some(map.map(|thr| (thr - self.peak_mean) / self.peak_sigma))
    }
}

pub struct DefectClassifier<F: CurveFitter, P: PeakSearch> {
    params: ClassifierParams,
    fitter: F,
    peaks: P,
}

impl<F: CurveFitter, P: PeakSearch> DefectClassifier<F, P> {
    pub fn new(params: ClassifierParams, fitter: F, peaks: P) -> Self {
        Self {
            params,
            fitter,
            peaks,
        }
    }

    pub fn params(&self) -> &ClassifierParams {
        &self.params
    }

    pub fn distribution(&self, map: &ThresholdMap) -> ThresholdDistribution {
        ThresholdDistribution::from_map(map, self.params.bins)
    }

    pub fn classify(&self, map: &ThresholdMap) -> ClassificationResult {
        self.classify_distribution(&self.distribution(map))
    }

    /// Peaks that may be the good-bump population.
    pub fn usable_peaks(&self, dist: &ThresholdDistribution) -> Vec<PeakCandidate> {
        let found = self.peaks.search(dist.counts(), &self.params.peak_search);
        log::debug!("found {} peaks", found.len());
        found
            .into_iter()
            .filter(|p| {
                p.position < self.params.failed_fit_from && p.position >= self.params.dead_peak_below
            })
            .collect()
    }

    /// Gaussian with the largest amplitude among fits around usable peaks.
    pub fn dominant_population(&self, dist: &ThresholdDistribution) -> Option<Gaussian> {
        let sample = dist.sample();
        let half = self.params.fit_half_window;
        self.usable_peaks(dist)
            .into_iter()
            .filter_map(|peak| {
                let seed = Gaussian {
                    amplitude: peak.height,
                    mean: peak.position,
                    sigma: self.params.seed_width,
                };
                match self
                    .fitter
                    .fit_gaussian(&sample, (peak.position - half, peak.position + half), seed)
                {
                    Ok(fit) => Some(fit),
                    Err(e) => {
                        log::debug!("fit around peak at {:.1} failed: {e}", peak.position);
                        None
                    }
                }
            })
            .max_by(|a, b| a.amplitude.total_cmp(&b.amplitude))
    }

    pub fn classify_distribution(&self, dist: &ThresholdDistribution) -> ClassificationResult {
        let Some(fit) = self.dominant_population(dist) else {
            return ClassificationResult::no_peak();
        };

        let separation_cut = dist.bin_of(fit.mean + self.params.nsigma * fit.sigma) + 1;
        let defective_pixels = dist.integral_from(separation_cut + 1).round() as u32;

        ClassificationResult {
            peak_mean: fit.mean,
            peak_sigma: fit.sigma,
            outcome: Outcome::Separated {
                separation_cut,
                defective_pixels,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::Pixel;
    use crate::fit::LeastSquares;
    use crate::fit::peaks::SmoothedPeakSearch;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn classifier() -> DefectClassifier<LeastSquares, SmoothedPeakSearch> {
        DefectClassifier::new(
            ClassifierParams::default(),
            LeastSquares::default(),
            SmoothedPeakSearch,
        )
    }

    fn gaussian_values(seed: u64, n: usize, mean: f64, sigma: f64) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(mean, sigma).unwrap();
        (0..n).map(|_| normal.sample(&mut rng)).collect()
    }

    #[test]
    fn single_population_with_failed_fits() {
        let mut values = gaussian_values(1, 10_000, 50.0, 5.0);
        values.extend(std::iter::repeat_n(255.0, 50));
        let dist = ThresholdDistribution::from_values(values, 256);
        assert_eq!(dist.total(), 10_050.0);

        let c = classifier();
        let usable = c.usable_peaks(&dist);
        assert_eq!(usable.len(), 1);
        assert!((usable[0].position - 50.0).abs() <= 2.0);

        let result = c.classify_distribution(&dist);
        assert!((result.peak_mean - 50.0).abs() < 1.0, "mean {}", result.peak_mean);
        assert!((result.peak_sigma - 5.0).abs() < 1.0, "sigma {}", result.peak_sigma);
        let defective = result.defective_pixel_count().unwrap();
        assert!((50..=55).contains(&defective), "defective {defective}");
    }

    #[test]
    fn cut_sits_one_bin_above_nsigma_point() {
        let values = gaussian_values(2, 4000, 100.0, 4.0);
        let dist = ThresholdDistribution::from_values(values, 256);
        let result = classifier().classify_distribution(&dist);
        let x = result.peak_mean + 4.0 * result.peak_sigma;
        assert_eq!(result.separation_cut(), Some(x.floor() as usize + 1));
        let cut = result.separation_cut().unwrap();
        assert_eq!(
            result.defective_pixel_count(),
            Some(dist.integral_from(cut + 1) as u32)
        );
    }

    #[test]
    fn dead_chip_has_no_peak() {
        let map = ThresholdMap::filled(0.0);
        let result = classifier().classify(&map);
        assert_eq!(result.outcome, Outcome::NoPeakFound);
        assert_eq!(result.defective_pixel_count(), None);
        assert_eq!((result.peak_mean, result.peak_sigma), (0.0, 0.0));
        assert!(result.rescaled(&map).is_none());
    }

    #[test]
    fn all_failed_fits_have_no_peak() {
        let map = ThresholdMap::filled(255.0);
        let result = classifier().classify(&map);
        assert_eq!(result.outcome, Outcome::NoPeakFound);
    }

    #[test]
    fn dead_pixel_peak_is_ignored() {
        let mut values = gaussian_values(3, 3000, 80.0, 3.0);
        values.extend(std::iter::repeat_n(0.0, 1500));
        let dist = ThresholdDistribution::from_values(values, 256);
        let result = classifier().classify_distribution(&dist);
        assert!((result.peak_mean - 80.0).abs() < 1.0);
        // dead pixels sit below the good population and are not counted
        assert!(result.defective_pixel_count().unwrap() < 5);
    }

    #[test]
    fn distribution_counts_every_pixel() {
        let mut map = ThresholdMap::filled(100.0);
        map.set(Pixel { row: 0, col: 0 }, 255.0);
        map.set(Pixel { row: 0, col: 1 }, 0.0);
        let dist = classifier().distribution(&map);
        assert_eq!(dist.total(), map.values().len() as f64);
        assert_eq!(dist.counts()[255], 1.0);
        assert_eq!(dist.counts()[0], 1.0);
    }

    #[test]
    fn rescaled_map_is_zero_at_mean() {
        let values = gaussian_values(4, 4160, 90.0, 4.0);
        let mut map = ThresholdMap::filled(0.0);
        for (i, v) in values.iter().enumerate() {
            map.set(Pixel::from_index(i), *v);
        }
        let result = classifier().classify(&map);
        let z = result.rescaled(&map).unwrap();
        let pixel = Pixel { row: 5, col: 5 };
        let expected = (map.get(pixel).unwrap() - result.peak_mean) / result.peak_sigma;
        assert!((z.get(pixel).unwrap() - expected).abs() < 1e-12);
    }
}
