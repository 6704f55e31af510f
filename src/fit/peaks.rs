//! Peak search over one-dimensional histograms.

/// Search parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakSearchParams {
    /// Expected peak width in bins; also the minimum separation of peaks.
    pub sigma: f64,
    /// Peaks lower than this fraction of the highest peak are dropped.
    pub threshold: f64,
    pub subtract_background: bool,
}

impl Default for PeakSearchParams {
    fn default() -> Self {
        Self {
            sigma: 5.0,
            threshold: 0.01,
            subtract_background: false,
        }
    }
}

/// A peak found in a histogram.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakCandidate {
    /// Bin centre, in units of the histogram axis (bin `i` spans `[i, i + 1)`).
    pub position: f64,
    /// Raw content of the bin at `position`.
    pub height: f64,
}

pub trait PeakSearch {
    fn search(&self, sample: &[f64], params: &PeakSearchParams) -> Vec<PeakCandidate>;
}

/// Local maxima of the Gaussian-smoothed histogram.
///
/// Optionally removes a SNIP background first. Candidates are returned
/// highest first; a peak closer than `sigma` bins to a higher one is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmoothedPeakSearch;

impl PeakSearch for SmoothedPeakSearch {
    fn search(&self, sample: &[f64], params: &PeakSearchParams) -> Vec<PeakCandidate> {
        if sample.is_empty() {
            return Vec::new();
        }
        let sigma = params.sigma.max(1.0);

        let mut signal = sample.to_vec();
        if params.subtract_background {
            let background = snip_background(&signal, (2.0 * sigma).ceil() as usize);
            for (s, b) in signal.iter_mut().zip(background) {
                *s = (*s - b).max(0.0);
            }
        }
        let smoothed = gaussian_smooth(&signal, sigma);

        let n = smoothed.len();
        let mut maxima: Vec<(usize, f64)> = (0..n)
            .filter(|&i| {
                let s = smoothed[i];
                s > 0.0
                    && (i == 0 || s > smoothed[i - 1])
                    && (i == n - 1 || s >= smoothed[i + 1])
            })
            .map(|i| (i, smoothed[i]))
            .collect();

        let tallest = maxima.iter().map(|m| m.1).fold(0.0, f64::max);
        maxima.retain(|m| m.1 >= params.threshold * tallest);
        maxima.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut accepted: Vec<usize> = Vec::new();
        for (i, _) in maxima {
            if accepted
                .iter()
                .all(|&j| (i as f64 - j as f64).abs() >= sigma)
            {
                accepted.push(i);
            }
        }

        accepted
            .into_iter()
            .map(|i| PeakCandidate {
                position: i as f64 + 0.5,
                height: sample[i],
            })
            .collect()
    }
}

/// Convolve with a Gaussian truncated at 3 sigma, renormalised at the edges.
fn gaussian_smooth(sample: &[f64], sigma: f64) -> Vec<f64> {
    let reach = (3.0 * sigma).ceil() as isize;
    let kernel: Vec<f64> = (-reach..=reach)
        .map(|k| (-0.5 * (k as f64 / sigma).powi(2)).exp())
        .collect();
    let n = sample.len() as isize;

    (0..n)
        .map(|i| {
            let mut acc = 0.0;
            let mut norm = 0.0;
            for (k, w) in (-reach..=reach).zip(kernel.iter()) {
                let j = i + k;
                if j >= 0 && j < n {
                    acc += w * sample[j as usize];
                    norm += w;
                }
            }
            acc / norm
        })
        .collect()
}

/// Statistics-sensitive non-linear iterative peak clipping.
fn snip_background(sample: &[f64], window: usize) -> Vec<f64> {
    let mut bg = sample.to_vec();
    let n = bg.len();
    for p in 1..=window {
        if 2 * p >= n {
            break;
        }
        let prev = bg.clone();
        for i in p..n - p {
            bg[i] = prev[i].min(0.5 * (prev[i - p] + prev[i + p]));
        }
    }
    bg
}
