//! Scoped configuration changes.
//!
//! Each guard mutably borrows the device, applies its change on creation and
//! undoes it when dropped, so the device is restored on every exit path.
//! Guards deref to the device and can be nested.

use std::ops::{Deref, DerefMut};

use super::{ChipConfig, Pixel};
use crate::error::Result;

/// Which pixels a [`PixelEnable`] guard switches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelSelection {
    All,
    Single(Pixel),
}

/// Enables testing and unmasks pixels for the guard's lifetime.
pub struct PixelEnable<'a, D: ChipConfig> {
    dut: &'a mut D,
    selection: PixelSelection,
}

impl<'a, D: ChipConfig> PixelEnable<'a, D> {
    pub fn new(dut: &'a mut D, selection: PixelSelection) -> Self {
        match selection {
            PixelSelection::All => {
                dut.test_all_pixels(true);
                dut.mask_all_pixels(false);
            }
            PixelSelection::Single(pixel) => {
                dut.test_pixel(pixel, true);
                dut.mask_pixel(pixel, false);
            }
        }
        Self { dut, selection }
    }
}

impl<D: ChipConfig> Drop for PixelEnable<'_, D> {
    fn drop(&mut self) {
        match self.selection {
            PixelSelection::All => {
                self.dut.test_all_pixels(false);
                self.dut.mask_all_pixels(true);
            }
            PixelSelection::Single(pixel) => {
                self.dut.test_pixel(pixel, false);
                self.dut.mask_pixel(pixel, true);
            }
        }
    }
}

impl<D: ChipConfig> Deref for PixelEnable<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.dut
    }
}

impl<D: ChipConfig> DerefMut for PixelEnable<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.dut
    }
}

/// Caches every DAC of every enabled ROC and writes them back on drop.
pub struct DacSnapshot<'a, D: ChipConfig> {
    dut: &'a mut D,
    values: Vec<(u8, String, u8)>,
}

impl<'a, D: ChipConfig> DacSnapshot<'a, D> {
    pub fn new(dut: &'a mut D) -> Result<Self> {
        let mut values = Vec::new();
        for roc in dut.enabled_rocs() {
            for name in dut.dac_names() {
                let value = dut.dac(roc, &name)?;
                values.push((roc, name, value));
            }
        }
        Ok(Self { dut, values })
    }
}

impl<D: ChipConfig> Drop for DacSnapshot<'_, D> {
    fn drop(&mut self) {
        for (roc, name, value) in &self.values {
            if let Err(e) = self.dut.set_dac_for(*roc, name, *value) {
                log::warn!("could not restore {name} on ROC {roc}: {e}");
            }
        }
    }
}

impl<D: ChipConfig> Deref for DacSnapshot<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.dut
    }
}

impl<D: ChipConfig> DerefMut for DacSnapshot<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.dut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::dacs;
    use crate::daq::sim::SimulatedModule;

    #[test]
    fn single_pixel_is_masked_again_after_scope() {
        let mut module = SimulatedModule::new(1, 7);
        let pixel = Pixel { row: 11, col: 20 };
        {
            let guard = PixelEnable::new(&mut module, PixelSelection::Single(pixel));
            assert!(guard.is_enabled(0, pixel));
        }
        assert!(!module.is_enabled(0, pixel));
    }

    #[test]
    fn snapshot_restores_changed_dacs() {
        let mut module = SimulatedModule::new(2, 7);
        let before = module.dac(1, dacs::VCAL).unwrap();
        {
            let mut cached = DacSnapshot::new(&mut module).unwrap();
            cached.set_dac(dacs::VCAL, before.wrapping_add(17)).unwrap();
            assert_eq!(cached.dac(1, dacs::VCAL).unwrap(), before.wrapping_add(17));
        }
        assert_eq!(module.dac(1, dacs::VCAL).unwrap(), before);
    }
}
