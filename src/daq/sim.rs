//! Simulated pixel module.
//!
//! Stands in for a testboard with attached readout chips. Every ROC carries a
//! 52x80 pixel array with per-pixel thresholds and noise, a tornado-shaped
//! CalDel x VthrComp timing window and a bump-bond state per pixel. Hit
//! counts are drawn from binomial distributions, per ROC in parallel, with
//! seeds derived from the module seed so runs are reproducible.

use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Binomial, Distribution, Normal};
use rayon::prelude::*;
use statrs::function::erf::erf;

use super::{
    ChipConfig, DacRange, Pixel, ROC_COLS, ROC_ROWS, ResponseSample, ScanFlags, ScanService, dacs,
};
use crate::error::{DaqError, Error, Result};
use crate::forward_bias::HvSupply;

const DAC_NAMES: &[&str] = &[
    dacs::CALDEL,
    dacs::VTHRCOMP,
    dacs::VCAL,
    dacs::CTRLREG,
    "vana",
    "vtrim",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpState {
    Good,
    /// Sensor not connected; no charge arrives through the sensor.
    Missing,
    /// Pixel never fires.
    DeadPixel,
}

#[derive(Debug, Clone, Copy)]
struct SimPixel {
    /// Vcal at 50% efficiency.
    threshold: f64,
    noise: f64,
    bump: BumpState,
}

/// Region of the CalDel x VthrComp plane where a pixel responds.
///
/// The window spans VthrComp `[bottom, top]`; along CalDel it is centred on
/// a line with slope `slope` and narrows towards the top.
#[derive(Debug, Clone, Copy)]
pub struct Tornado {
    pub bottom: f64,
    pub top: f64,
    pub caldel_center: f64,
    pub half_width: f64,
    pub slope: f64,
}

impl Tornado {
    pub fn center_at(&self, vthrcomp: f64) -> f64 {
        self.caldel_center + self.slope * (vthrcomp - self.bottom)
    }

    pub fn half_width_at(&self, vthrcomp: f64) -> f64 {
        let frac = (vthrcomp - self.bottom) / (self.top - self.bottom);
        self.half_width * (1.0 - 0.6 * frac)
    }

    pub fn contains(&self, caldel: f64, vthrcomp: f64) -> bool {
        if vthrcomp < self.bottom || vthrcomp > self.top {
            return false;
        }
        (caldel - self.center_at(vthrcomp)).abs() <= self.half_width_at(vthrcomp)
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    caldel: u8,
    vthrcomp: u8,
    vcal: u8,
}

impl Settings {
    fn apply(&mut self, name: &str, value: u8) {
        match name {
            dacs::CALDEL => self.caldel = value,
            dacs::VTHRCOMP => self.vthrcomp = value,
            dacs::VCAL => self.vcal = value,
            _ => {}
        }
    }
}

#[derive(Debug, Clone)]
struct SimRoc {
    id: u8,
    dacs: HashMap<String, u8>,
    pixels: Vec<SimPixel>,
    tested: Vec<bool>,
    masked: Vec<bool>,
    tornado: Tornado,
}

impl SimRoc {
    fn generate(id: u8, rng: &mut impl Rng, missing_bumps: f64, dead_pixels: f64) -> Self {
        let threshold = Normal::<f64>::new(100.0, 5.0).unwrap();
        let noise = Normal::<f64>::new(2.5, 0.3).unwrap();
        let pixels = (0..ROC_COLS * ROC_ROWS)
            .map(|_| {
                let roll: f64 = rng.random();
                let bump = if roll < dead_pixels {
                    BumpState::DeadPixel
                } else if roll < dead_pixels + missing_bumps {
                    BumpState::Missing
                } else {
                    BumpState::Good
                };
                SimPixel {
                    threshold: threshold.sample(rng),
                    noise: noise.sample(rng).abs().max(0.5),
                    bump,
                }
            })
            .collect();

        let tornado = Tornado {
            bottom: 30.0 + rng.random_range(0.0..10.0),
            top: 140.0 + rng.random_range(0.0..20.0),
            caldel_center: 90.0 + rng.random_range(0.0..30.0),
            half_width: 35.0,
            slope: 0.3,
        };

        let mid = 0.5 * (tornado.bottom + tornado.top);
        let mut registers = HashMap::new();
        registers.insert(dacs::CALDEL.to_string(), tornado.center_at(mid).round() as u8);
        registers.insert(dacs::VTHRCOMP.to_string(), mid.round() as u8);
        registers.insert(dacs::VCAL.to_string(), 200);
        registers.insert(dacs::CTRLREG.to_string(), 0);
        registers.insert("vana".to_string(), 80);
        registers.insert("vtrim".to_string(), 0);

        Self {
            id,
            dacs: registers,
            pixels,
            tested: vec![false; ROC_COLS * ROC_ROWS],
            masked: vec![true; ROC_COLS * ROC_ROWS],
            tornado,
        }
    }

    fn settings(&self) -> Settings {
        let get = |name: &str| self.dacs.get(name).copied().unwrap_or(0);
        Settings {
            caldel: get(dacs::CALDEL),
            vthrcomp: get(dacs::VTHRCOMP),
            vcal: get(dacs::VCAL),
        }
    }

    fn hit_probability(
        &self,
        pixel: &SimPixel,
        settings: &Settings,
        flags: ScanFlags,
        forward_bias: bool,
    ) -> f64 {
        match pixel.bump {
            BumpState::DeadPixel => return 0.0,
            // A forward-biased sensor saturates every connected pixel; open
            // bumps are cut off from it and keep responding.
            BumpState::Good if forward_bias => return 0.0,
            BumpState::Missing if forward_bias => {}
            BumpState::Missing if flags.contains(ScanFlags::CALS) => return 0.0,
            _ => {}
        }
        if !self
            .tornado
            .contains(settings.caldel as f64, settings.vthrcomp as f64)
        {
            return 0.0;
        }
        let z = (settings.vcal as f64 - pixel.threshold) / pixel.noise;
        0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
    }
}

fn sample_hits(rng: &mut impl Rng, ntrig: u16, p: f64) -> u16 {
    if p <= 0.0 {
        return 0;
    }
    if p >= 1.0 {
        return ntrig;
    }
    match Binomial::new(ntrig as u64, p) {
        Ok(dist) => dist.sample(rng) as u16,
        Err(_) => 0,
    }
}

/// A module of simulated readout chips behind a simulated testboard.
#[derive(Debug)]
pub struct SimulatedModule {
    rocs: Vec<SimRoc>,
    seed: u64,
    scan_calls: u64,
    failures: VecDeque<DaqError>,
    bias_microamps: Rc<Cell<f64>>,
}

impl SimulatedModule {
    /// Module with 1% missing bumps and 0.2% dead pixels per ROC.
    pub fn new(n_rocs: u8, seed: u64) -> Self {
        Self::with_defects(n_rocs, seed, 0.01, 0.002)
    }

    pub fn with_defects(n_rocs: u8, seed: u64, missing_bumps: f64, dead_pixels: f64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let rocs = (0..n_rocs)
            .map(|id| SimRoc::generate(id, &mut rng, missing_bumps, dead_pixels))
            .collect();
        Self {
            rocs,
            seed,
            scan_calls: 0,
            failures: VecDeque::new(),
            bias_microamps: Rc::new(Cell::new(0.0)),
        }
    }

    /// Queue an error returned by the next scan instead of data.
    pub fn inject_failure(&mut self, error: DaqError) {
        self.failures.push_back(error);
    }

    /// Number of scan requests seen, failed ones included.
    pub fn scan_calls(&self) -> u64 {
        self.scan_calls
    }

    /// Make every pixel of a ROC dead.
    pub fn kill_roc(&mut self, roc: u8) {
        if let Some(r) = self.rocs.iter_mut().find(|r| r.id == roc) {
            for p in r.pixels.iter_mut() {
                p.bump = BumpState::DeadPixel;
            }
        }
    }

    /// Off-chip pixels are ignored.
    pub fn set_bump(&mut self, roc: u8, pixel: Pixel, bump: BumpState) {
        let Some(index) = pixel.checked_index() else {
            log::warn!("ignoring bump state for off-chip pixel {pixel:?}");
            return;
        };
        if let Some(r) = self.rocs.iter_mut().find(|r| r.id == roc) {
            r.pixels[index].bump = bump;
        }
    }

    /// `None` for unknown ROCs and off-chip pixels.
    pub fn bump(&self, roc: u8, pixel: Pixel) -> Option<BumpState> {
        let index = pixel.checked_index()?;
        self.roc(roc).map(|r| r.pixels[index].bump)
    }

    /// Number of pixels on `roc` in the given state.
    pub fn count_bumps(&self, roc: u8, bump: BumpState) -> usize {
        self.roc(roc)
            .map(|r| r.pixels.iter().filter(|p| p.bump == bump).count())
            .unwrap_or(0)
    }

    pub fn tornado(&self, roc: u8) -> Option<Tornado> {
        self.roc(roc).map(|r| r.tornado)
    }

    pub fn is_enabled(&self, roc: u8, pixel: Pixel) -> bool {
        let Some(index) = pixel.checked_index() else {
            return false;
        };
        self.roc(roc)
            .map(|r| r.tested[index] && !r.masked[index])
            .unwrap_or(false)
    }

    /// Bias supply wired to this module's sensor.
    pub fn hv_supply(&self) -> SimHvSupply {
        SimHvSupply {
            volts: 150.0,
            limit_microamps: 10.0,
            bias_microamps: Rc::clone(&self.bias_microamps),
        }
    }

    fn roc(&self, roc: u8) -> Option<&SimRoc> {
        self.rocs.iter().find(|r| r.id == roc)
    }

    fn roc_mut(&mut self, roc: u8) -> Result<&mut SimRoc> {
        self.rocs
            .iter_mut()
            .find(|r| r.id == roc)
            .ok_or(Error::UnknownRoc(roc))
    }

    fn scan(
        &mut self,
        dac1: Option<(&str, DacRange)>,
        dac2: Option<(&str, DacRange)>,
        ntrig: u16,
        flags: ScanFlags,
    ) -> std::result::Result<Vec<ResponseSample>, DaqError> {
        self.scan_calls += 1;
        if let Some(failure) = self.failures.pop_front() {
            return Err(failure);
        }

        let points: Vec<(u8, Option<u8>)> = match (dac1, dac2) {
            (Some((_, r1)), Some((_, r2))) => r1
                .values()
                .flat_map(|a| r2.values().map(move |b| (a, Some(b))))
                .collect(),
            (Some((_, r1)), None) => r1.values().map(|a| (a, None)).collect(),
            _ => vec![(0, None)],
        };
        let name1 = dac1.map(|(n, _)| n.to_lowercase());
        let name2 = dac2.map(|(n, _)| n.to_lowercase());

        let forward_bias = self.bias_microamps.get() > 0.0;
        let force = flags.contains(ScanFlags::FORCE_MASKED);
        let seed = self.seed ^ self.scan_calls.wrapping_mul(0x9E37_79B9_7F4A_7C15);

        let per_roc: Vec<Vec<ResponseSample>> = self
            .rocs
            .par_iter()
            .map(|roc| {
                let mut rng = StdRng::seed_from_u64(seed ^ ((roc.id as u64) << 48));
                let active: Vec<usize> = (0..roc.pixels.len())
                    .filter(|&i| force || (roc.tested[i] && !roc.masked[i]))
                    .collect();
                let current = roc.settings();
                let mut out = Vec::new();
                for &(v1, v2) in &points {
                    let mut settings = current;
                    if let Some(n) = &name1 {
                        settings.apply(n, v1);
                    }
                    if let (Some(n), Some(v)) = (&name2, v2) {
                        settings.apply(n, v);
                    }
                    for &i in &active {
                        let p = roc.hit_probability(&roc.pixels[i], &settings, flags, forward_bias);
                        let count = sample_hits(&mut rng, ntrig, p);
                        if count > 0 {
                            out.push(ResponseSample {
                                roc: roc.id,
                                pixel: Pixel::from_index(i),
                                param1: v1,
                                param2: v2,
                                count,
                            });
                        }
                    }
                }
                out
            })
            .collect();

        Ok(per_roc.into_iter().flatten().collect())
    }
}

impl ScanService for SimulatedModule {
    fn sweep_1d(
        &mut self,
        dac: &str,
        range: DacRange,
        ntrig: u16,
        flags: ScanFlags,
    ) -> std::result::Result<Vec<ResponseSample>, DaqError> {
        self.scan(Some((dac, range)), None, ntrig, flags)
    }

    fn sweep_2d(
        &mut self,
        dac1: &str,
        range1: DacRange,
        dac2: &str,
        range2: DacRange,
        ntrig: u16,
        flags: ScanFlags,
    ) -> std::result::Result<Vec<ResponseSample>, DaqError> {
        self.scan(Some((dac1, range1)), Some((dac2, range2)), ntrig, flags)
    }

    fn efficiency_map(
        &mut self,
        ntrig: u16,
        flags: ScanFlags,
    ) -> std::result::Result<Vec<ResponseSample>, DaqError> {
        self.scan(None, None, ntrig, flags)
    }
}

impl ChipConfig for SimulatedModule {
    fn enabled_rocs(&self) -> Vec<u8> {
        self.rocs.iter().map(|r| r.id).collect()
    }

    fn dac_names(&self) -> Vec<String> {
        DAC_NAMES.iter().map(|n| n.to_string()).collect()
    }

    fn dac(&self, roc: u8, name: &str) -> Result<u8> {
        let r = self.roc(roc).ok_or(Error::UnknownRoc(roc))?;
        r.dacs
            .get(&name.to_lowercase())
            .copied()
            .ok_or_else(|| Error::UnknownDac(name.to_string()))
    }

    fn set_dac_for(&mut self, roc: u8, name: &str, value: u8) -> Result<()> {
        let r = self.roc_mut(roc)?;
        match r.dacs.get_mut(&name.to_lowercase()) {
            Some(v) => {
                *v = value;
                Ok(())
            }
            None => Err(Error::UnknownDac(name.to_string())),
        }
    }

    fn test_all_pixels(&mut self, enable: bool) {
        for r in self.rocs.iter_mut() {
            r.tested.fill(enable);
        }
    }

    fn mask_all_pixels(&mut self, mask: bool) {
        for r in self.rocs.iter_mut() {
            r.masked.fill(mask);
        }
    }

    fn test_pixel(&mut self, pixel: Pixel, enable: bool) {
        let Some(index) = pixel.checked_index() else {
            log::warn!("ignoring test enable for off-chip pixel {pixel:?}");
            return;
        };
        for r in self.rocs.iter_mut() {
            r.tested[index] = enable;
        }
    }

    fn mask_pixel(&mut self, pixel: Pixel, mask: bool) {
        let Some(index) = pixel.checked_index() else {
            log::warn!("ignoring mask for off-chip pixel {pixel:?}");
            return;
        };
        for r in self.rocs.iter_mut() {
            r.masked[index] = mask;
        }
    }
}

/// Bias supply of a [`SimulatedModule`].
///
/// Setting a current switches the sensor into forward bias; setting a
/// voltage returns it to normal operation.
#[derive(Debug)]
pub struct SimHvSupply {
    volts: f64,
    limit_microamps: f64,
    bias_microamps: Rc<Cell<f64>>,
}

impl SimHvSupply {
    pub fn is_forward_biased(&self) -> bool {
        self.bias_microamps.get() > 0.0
    }
}

impl HvSupply for SimHvSupply {
    fn volts(&self) -> f64 {
        self.volts
    }

    fn set_volts(&mut self, volts: f64) {
        self.volts = volts;
        self.bias_microamps.set(0.0);
    }

    fn microamps_limit(&self) -> f64 {
        self.limit_microamps
    }

    fn set_microamps_limit(&mut self, limit: f64) {
        self.limit_microamps = limit;
    }

    fn set_microamps(&mut self, microamps: f64) {
        self.bias_microamps.set(microamps.min(self.limit_microamps));
    }
}
