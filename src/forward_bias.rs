//! Bump test with the sensor driven into forward bias.
//!
//! A current source pushes the sensor into forward bias. Pixels connected
//! through a working bump saturate and stop responding to calibration
//! pulses, while pixels behind a broken bump are cut off from the sensor and
//! keep firing. Silent pixels are the good ones here.

use std::ops::{Deref, DerefMut};

use crate::PerRoc;
use crate::daq::acquire::{ScanAcquirer, Sweep};
use crate::daq::guard::{DacSnapshot, PixelSelection};
use crate::daq::{ResponseSample, ScanFlags, Testboard, dacs};
use crate::error::Result;
use crate::params::ForwardBiasParams;
use crate::threshold::PixelMap;

/// Sensor bias supply.
pub trait HvSupply {
    fn volts(&self) -> f64;
    fn set_volts(&mut self, volts: f64);
    fn microamps_limit(&self) -> f64;
    fn set_microamps_limit(&mut self, limit: f64);
    /// Switch to current-source operation at `microamps`.
    fn set_microamps(&mut self, microamps: f64);
}

/// Restores the supply voltage and compliance on drop.
pub struct HvRestore<'a, H: HvSupply> {
    hv: &'a mut H,
    volts: f64,
    limit: f64,
}

impl<'a, H: HvSupply> HvRestore<'a, H> {
    pub fn new(hv: &'a mut H) -> Self {
        let volts = hv.volts();
        let limit = hv.microamps_limit();
        Self { hv, volts, limit }
    }
}

impl<H: HvSupply> Drop for HvRestore<'_, H> {
    fn drop(&mut self) {
        self.hv.set_microamps_limit(self.limit);
        self.hv.set_volts(self.volts);
    }
}

impl<H: HvSupply> Deref for HvRestore<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        self.hv
    }
}

impl<H: HvSupply> DerefMut for HvRestore<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        self.hv
    }
}

#[derive(Debug, Clone)]
pub struct ForwardBiasResult {
    /// Hits per pixel.
    pub hit_maps: PerRoc<PixelMap>,
    /// Pixels without a single hit, i.e. saturated through a working bump.
    pub silent_pixels: PerRoc<u32>,
    /// Pixels with fewer hits than triggers, silent ones included.
    pub inefficient_pixels: PerRoc<u32>,
    pub daq_errors: u32,
}

pub fn forward_bias_test<D: Testboard, H: HvSupply>(
    dut: &mut D,
    hv: &mut H,
    params: &ForwardBiasParams,
) -> Result<ForwardBiasResult> {
    let mut dut = DacSnapshot::new(dut)?;
    log::info!(
        "forward bias test: ntrig = {}, vcal = {}",
        params.ntrig,
        params.vcal
    );
    dut.set_dac(dacs::VCAL, params.vcal)?;

    let rocs = dut.enabled_rocs();
    let acquisition = {
        let mut hv = HvRestore::new(hv);
        hv.set_microamps_limit(params.compliance_microamps);
        hv.set_microamps(params.supply_microamps);

        ScanAcquirer::new(params.acquisition).acquire(
            &mut *dut,
            PixelSelection::All,
            Sweep::HitMap,
            params.ntrig,
            ScanFlags::FORCE_MASKED,
        )
    };

    let hit_maps = hit_maps(&acquisition.samples, &rocs);
    let ntrig = params.ntrig as f64;
    let count = |below: f64| -> PerRoc<u32> {
        hit_maps
            .iter()
            .map(|(&roc, map)| (roc, map.values().iter().filter(|&&v| v < below).count() as u32))
            .collect()
    };
    let silent_pixels = count(1.0);
    let inefficient_pixels = count(ntrig);

    let mut done = String::from("forward bias test done");
    if acquisition.daq_errors > 0 {
        done += &format!(" with {} decoding errors", acquisition.daq_errors);
    }
    log::info!("{done}");
    log::info!("number of dead pixels (per ROC): {}", per_roc_line(&silent_pixels));
    log::debug!(
        "number of reduced-efficiency pixels: {}",
        per_roc_line(&inefficient_pixels)
    );

    Ok(ForwardBiasResult {
        hit_maps,
        silent_pixels,
        inefficient_pixels,
        daq_errors: acquisition.daq_errors,
    })
}

fn hit_maps(samples: &[ResponseSample], rocs: &[u8]) -> PerRoc<PixelMap> {
    let mut maps: PerRoc<PixelMap> = rocs.iter().map(|&r| (r, PixelMap::filled(0.0))).collect();
    for s in samples {
        let Some(map) = maps.get_mut(&s.roc) else {
            continue;
        };
        match map.get_mut(s.pixel) {
            Some(hits) => *hits += s.count as f64,
            None => log::warn!("ROC {}: dropping hits of off-chip pixel {:?}", s.roc, s.pixel),
        }
    }
    maps
}

fn per_roc_line(counts: &PerRoc<u32>) -> String {
    counts.values().map(|c| format!(" {c:4}")).collect()
}
