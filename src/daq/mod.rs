//! Acquisition-side collaborators.
//!
//! The calibration core never talks to hardware directly. It drives a
//! [`ScanService`] (parameter sweeps returning per-pixel hit counts) and a
//! [`ChipConfig`] (DAC registers and pixel enable/mask state), both usually
//! implemented by the same testboard object.

pub mod acquire;
pub mod guard;
pub mod sim;

use std::ops::{BitOr, RangeInclusive};

use crate::error::{DaqError, Result};

/// Pixel columns per readout chip.
pub const ROC_COLS: usize = 52;
/// Pixel rows per readout chip.
pub const ROC_ROWS: usize = 80;

/// DAC register names used by the calibration.
pub mod dacs {
    pub const CALDEL: &str = "caldel";
    pub const VTHRCOMP: &str = "vthrcomp";
    pub const VCAL: &str = "vcal";
    pub const CTRLREG: &str = "ctrlreg";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pixel {
    pub row: u8,
    pub col: u8,
}

impl Pixel {
    /// Inverse of [`Pixel::index`].
    pub fn from_index(index: usize) -> Self {
        Pixel {
            row: (index / ROC_COLS) as u8,
            col: (index % ROC_COLS) as u8,
        }
    }

    /// Row-major index into a ROC-sized grid.
    pub fn index(self) -> usize {
        self.row as usize * ROC_COLS + self.col as usize
    }

    /// [`Pixel::index`] for pixels on the chip, `None` otherwise.
    pub fn checked_index(self) -> Option<usize> {
        ((self.row as usize) < ROC_ROWS && (self.col as usize) < ROC_COLS).then(|| self.index())
    }
}

/// Inclusive range of DAC values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacRange {
    pub lo: u8,
    pub hi: u8,
}

impl DacRange {
    pub const fn new(lo: u8, hi: u8) -> Self {
        Self { lo, hi }
    }

    /// Number of DAC values covered.
    pub fn len(&self) -> usize {
        (self.hi as usize + 1).saturating_sub(self.lo as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, value: u8) -> bool {
        value >= self.lo && value <= self.hi
    }

    /// Bin index of `value`, if inside the range.
    pub fn index_of(&self, value: u8) -> Option<usize> {
        self.contains(value).then(|| (value - self.lo) as usize)
    }

    pub fn values(&self) -> RangeInclusive<u8> {
        self.lo..=self.hi
    }
}

/// Acquisition mode bits passed through to the scan service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanFlags(pub u16);

impl ScanFlags {
    pub const NONE: ScanFlags = ScanFlags(0);
    /// Inject calibration charge through the sensor (CalS) instead of the
    /// on-chip capacitor.
    pub const CALS: ScanFlags = ScanFlags(1 << 1);
    /// Read out pixels even when they are masked.
    pub const FORCE_MASKED: ScanFlags = ScanFlags(1 << 7);

    pub fn contains(self, other: ScanFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ScanFlags {
    type Output = ScanFlags;

    fn bitor(self, rhs: ScanFlags) -> ScanFlags {
        ScanFlags(self.0 | rhs.0)
    }
}

/// Hit count of one pixel at one sweep point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseSample {
    pub roc: u8,
    pub pixel: Pixel,
    pub param1: u8,
    pub param2: Option<u8>,
    pub count: u16,
}

/// Parameter sweeps against the acquisition hardware.
pub trait ScanService {
    fn sweep_1d(
        &mut self,
        dac: &str,
        range: DacRange,
        ntrig: u16,
        flags: ScanFlags,
    ) -> std::result::Result<Vec<ResponseSample>, DaqError>;

    fn sweep_2d(
        &mut self,
        dac1: &str,
        range1: DacRange,
        dac2: &str,
        range2: DacRange,
        ntrig: u16,
        flags: ScanFlags,
    ) -> std::result::Result<Vec<ResponseSample>, DaqError>;

    /// Hit map at the current DAC settings; `param1` of every sample is 0.
    fn efficiency_map(
        &mut self,
        ntrig: u16,
        flags: ScanFlags,
    ) -> std::result::Result<Vec<ResponseSample>, DaqError>;
}

/// DAC registers and pixel enable state of the module under test.
pub trait ChipConfig {
    fn enabled_rocs(&self) -> Vec<u8>;

    /// Names of all DACs a snapshot has to preserve.
    fn dac_names(&self) -> Vec<String>;

    fn dac(&self, roc: u8, name: &str) -> Result<u8>;

    fn set_dac_for(&mut self, roc: u8, name: &str, value: u8) -> Result<()>;

    /// Set a DAC on every enabled ROC.
    fn set_dac(&mut self, name: &str, value: u8) -> Result<()> {
        for roc in self.enabled_rocs() {
            self.set_dac_for(roc, name, value)?;
        }
        Ok(())
    }

    fn test_all_pixels(&mut self, enable: bool);
    fn mask_all_pixels(&mut self, mask: bool);
    fn test_pixel(&mut self, pixel: Pixel, enable: bool);
    fn mask_pixel(&mut self, pixel: Pixel, mask: bool);
}

/// A device that can both be configured and scanned.
pub trait Testboard: ScanService + ChipConfig {}

impl<T: ScanService + ChipConfig> Testboard for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dac_range_indexing() {
        let range = DacRange::new(50, 200);
        assert_eq!(range.len(), 151);
        assert_eq!(range.index_of(50), Some(0));
        assert_eq!(range.index_of(200), Some(150));
        assert_eq!(range.index_of(49), None);
        assert_eq!(range.values().count(), 151);
    }

    #[test]
    fn off_chip_pixel_has_no_index() {
        assert_eq!(Pixel { row: 79, col: 51 }.checked_index(), Some(ROC_ROWS * ROC_COLS - 1));
        assert_eq!(Pixel { row: 80, col: 0 }.checked_index(), None);
        assert_eq!(Pixel { row: 0, col: 52 }.checked_index(), None);
    }

    #[test]
    fn flags_combine() {
        let flags = ScanFlags::CALS | ScanFlags::FORCE_MASKED;
        assert!(flags.contains(ScanFlags::CALS));
        assert!(flags.contains(ScanFlags::FORCE_MASKED));
        assert!(!ScanFlags::CALS.contains(ScanFlags::FORCE_MASKED));
    }
}
