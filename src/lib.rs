//! ROC calibration - library crate.
//!
//! Operating-point extraction from DAC-DAC tornado scans and bump-bond
//! classification from CalS threshold maps, for modules of pixel readout
//! chips. Hardware access goes through the traits in [`daq`]; a simulated
//! module stands in for a testboard.

pub mod calibration;
pub mod daq;
pub mod defect;
pub mod error;
pub mod fit;
pub mod forward_bias;
pub mod params;
pub mod surface;
pub mod threshold;

/// Per-ROC results keyed by ROC id.
pub type PerRoc<T> = std::collections::BTreeMap<u8, T>;
