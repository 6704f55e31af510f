//! Bounded-retry acquisition of parameter sweeps.

use super::guard::{PixelEnable, PixelSelection};
use super::{DacRange, ResponseSample, ScanFlags, ScanService, Testboard};
use crate::error::DaqError;
use crate::params::AcquisitionPolicy;

/// What to sweep.
#[derive(Debug, Clone, Copy)]
pub enum Sweep<'s> {
    OneD {
        dac: &'s str,
        range: DacRange,
    },
    TwoD {
        dac1: &'s str,
        range1: DacRange,
        dac2: &'s str,
        range2: DacRange,
    },
    /// Single hit map at the current settings.
    HitMap,
}

impl Sweep<'_> {
    fn run<D: ScanService>(
        &self,
        dut: &mut D,
        ntrig: u16,
        flags: ScanFlags,
    ) -> Result<Vec<ResponseSample>, DaqError> {
        match *self {
            Sweep::OneD { dac, range } => dut.sweep_1d(dac, range, ntrig, flags),
            Sweep::TwoD {
                dac1,
                range1,
                dac2,
                range2,
            } => dut.sweep_2d(dac1, range1, dac2, range2, ntrig, flags),
            Sweep::HitMap => dut.efficiency_map(ntrig, flags),
        }
    }
}

/// Result of an acquisition, possibly partial.
#[derive(Debug, Clone, Default)]
pub struct Acquisition {
    pub samples: Vec<ResponseSample>,
    pub attempts: u32,
    /// Errors seen across all attempts.
    pub daq_errors: u32,
    /// False when the samples come from an abandoned attempt.
    pub complete: bool,
}

/// Runs sweeps, restarting them from scratch on readout errors.
///
/// A sweep that loses a few events or hits a general fault is retried; one
/// that loses more than `missing_events_give_up` events is kept as is. After
/// `max_attempts` attempts the last partial (or empty) result is accepted.
/// Errors never reach the caller, they are counted in [`Acquisition`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanAcquirer {
    policy: AcquisitionPolicy,
}

impl ScanAcquirer {
    pub fn new(policy: AcquisitionPolicy) -> Self {
        Self { policy }
    }

    /// Enable `selection`, run `sweep` with retries, and mask the pixels again.
    pub fn acquire<D: Testboard>(
        &self,
        dut: &mut D,
        selection: PixelSelection,
        sweep: Sweep<'_>,
        ntrig: u16,
        flags: ScanFlags,
    ) -> Acquisition {
        let mut enabled = PixelEnable::new(dut, selection);
        self.retry(|| sweep.run(&mut *enabled, ntrig, flags))
    }

    fn retry<F>(&self, mut attempt: F) -> Acquisition
    where
        F: FnMut() -> Result<Vec<ResponseSample>, DaqError>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = 0;
        let mut daq_errors = 0;
        let mut partial = Vec::new();

        while attempts < max_attempts {
            attempts += 1;
            match attempt() {
                Ok(samples) => {
                    return Acquisition {
                        samples,
                        attempts,
                        daq_errors,
                        complete: true,
                    };
                }
                Err(DaqError::MissingEvents {
                    missing,
                    partial: received,
                }) => {
                    daq_errors += 1;
                    log::error!("problem with readout: missing {missing} events (attempt {attempts})");
                    partial = received;
                    if missing > self.policy.missing_events_give_up {
                        log::warn!(
                            "too many missing events, accepting {} partial samples",
                            partial.len()
                        );
                        return Acquisition {
                            samples: partial,
                            attempts,
                            daq_errors,
                            complete: false,
                        };
                    }
                }
                Err(DaqError::Fault(msg)) => {
                    daq_errors += 1;
                    log::error!("acquisition fault: {msg} (attempt {attempts})");
                    partial.clear();
                }
            }
        }

        log::warn!(
            "giving up after {attempts} attempts, accepting {} partial samples",
            partial.len()
        );
        Acquisition {
            samples: partial,
            attempts,
            daq_errors,
            complete: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::sim::SimulatedModule;
    use crate::daq::{Pixel, dacs};

    fn sample(count: u16) -> ResponseSample {
        ResponseSample {
            roc: 0,
            pixel: Pixel { row: 0, col: 0 },
            param1: 0,
            param2: None,
            count,
        }
    }

    fn missing(n: u32) -> DaqError {
        DaqError::MissingEvents {
            missing: n,
            partial: vec![sample(n as u16)],
        }
    }

    #[test]
    fn small_losses_retry_until_attempt_cap() {
        let acquirer = ScanAcquirer::default();
        let mut calls = 0;
        let result = acquirer.retry(|| {
            calls += 1;
            Err(missing(3))
        });
        assert_eq!(calls, 5);
        assert_eq!(result.attempts, 5);
        assert_eq!(result.daq_errors, 5);
        assert!(!result.complete);
        assert_eq!(result.samples, vec![sample(3)]);
    }

    #[test]
    fn large_loss_is_accepted_immediately() {
        let acquirer = ScanAcquirer::default();
        let mut calls = 0;
        let result = acquirer.retry(|| {
            calls += 1;
            Err(missing(11))
        });
        assert_eq!(calls, 1);
        assert!(!result.complete);
        assert_eq!(result.samples.len(), 1);
    }

    #[test]
    fn fault_then_success_restarts_sweep() {
        let acquirer = ScanAcquirer::default();
        let mut outcomes = vec![
            Ok(vec![sample(10), sample(9)]),
            Err(DaqError::Fault("usb timeout".into())),
        ];
        let result = acquirer.retry(|| outcomes.pop().unwrap());
        assert!(result.complete);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.daq_errors, 1);
        assert_eq!(result.samples.len(), 2);
    }

    #[test]
    fn faults_only_give_empty_result() {
        let acquirer = ScanAcquirer::default();
        let result = acquirer.retry(|| Err(DaqError::Fault("dead link".into())));
        assert!(result.samples.is_empty());
        assert_eq!(result.attempts, 5);
    }

    #[test]
    fn pixel_is_masked_again_after_give_up() {
        let mut module = SimulatedModule::new(1, 3);
        for _ in 0..5 {
            module.inject_failure(missing(3));
        }
        let probe = Pixel { row: 11, col: 20 };
        let acquirer = ScanAcquirer::default();
        let result = acquirer.acquire(
            &mut module,
            PixelSelection::Single(probe),
            Sweep::OneD {
                dac: dacs::VCAL,
                range: DacRange::new(0, 255),
            },
            10,
            ScanFlags::NONE,
        );
        assert!(!result.complete);
        assert_eq!(module.scan_calls(), 5);
        assert!(!module.is_enabled(0, probe));
    }
}
