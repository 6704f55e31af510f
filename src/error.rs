//! Error taxonomy for the calibration pipeline.

use thiserror::Error;

use crate::daq::ResponseSample;

/// Failure reported by the acquisition service for one sweep.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DaqError {
    /// Readout lost events; whatever arrived is carried along.
    #[error("problem with readout: missing {missing} events")]
    MissingEvents {
        missing: u32,
        partial: Vec<ResponseSample>,
    },

    #[error("acquisition fault: {0}")]
    Fault(String),
}

/// Failure of a single curve fit.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitError {
    #[error("fit did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("{points} points cannot constrain {parameters} parameters")]
    InsufficientData { points: usize, parameters: usize },

    /// The sample never crosses half of its plateau.
    #[error("no transition in sample")]
    NoTransition,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("unknown DAC '{0}'")]
    UnknownDac(String),

    #[error("ROC {0} is not part of the module")]
    UnknownRoc(u8),

    #[error("invalid value '{value}' for parameter '{name}'")]
    InvalidParameter { name: String, value: String },

    /// Projection maximum is zero, no plateau to find edges on.
    #[error("projection has no entries")]
    DegenerateProjection,

    #[error("no usable population peak in threshold distribution")]
    NoPeakFound,

    #[error(transparent)]
    Daq(#[from] DaqError),
}

pub type Result<T> = std::result::Result<T, Error>;
