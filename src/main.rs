//! Bump-bond calibration of a simulated module.
//!
//! Usage: roc_calibration [name=value ...]
//!
//! `rocs`, `seed` and `test` (`bumpbond` or `forwardbias`) pick the module
//! and the test; every other name is passed to the test's parameters.

use roc_calibration::calibration::report::NullSink;
use roc_calibration::calibration::run_bump_bond_test;
use roc_calibration::daq::sim::SimulatedModule;
use roc_calibration::error::{Error, Result};
use roc_calibration::fit::LeastSquares;
use roc_calibration::fit::peaks::SmoothedPeakSearch;
use roc_calibration::forward_bias::forward_bias_test;
use roc_calibration::params::{BumpBondParams, ForwardBiasParams};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut rocs: u8 = 16;
    let mut seed: u64 = 1;
    let mut test = String::from("bumpbond");
    let mut bump_bond = BumpBondParams::default();
    let mut forward_bias = ForwardBiasParams::default();

    for arg in std::env::args().skip(1) {
        let Some((name, value)) = arg.split_once('=') else {
            log::warn!("ignoring argument '{arg}', expected name=value");
            continue;
        };
        let invalid = || Error::InvalidParameter {
            name: name.to_string(),
            value: value.to_string(),
        };
        match name.to_lowercase().as_str() {
            "rocs" => rocs = value.trim().parse().map_err(|_| invalid())?,
            "seed" => seed = value.trim().parse().map_err(|_| invalid())?,
            "test" => test = value.trim().to_lowercase(),
            _ => {
                let known = bump_bond.set_parameter(name, value)?
                    | forward_bias.set_parameter(name, value)?;
                if !known {
                    log::warn!("unknown parameter '{name}'");
                }
            }
        }
    }

    let mut module = SimulatedModule::new(rocs, seed);
    match test.as_str() {
        "forwardbias" => {
            let mut hv = module.hv_supply();
            let result = forward_bias_test(&mut module, &mut hv, &forward_bias)?;
            println!("=== Forward bias test ===");
            for (roc, silent) in &result.silent_pixels {
                println!(
                    "ROC {roc:2}: {silent:4} dead, {:4} below full efficiency",
                    result.inefficient_pixels[roc]
                );
            }
        }
        _ => {
            let report = run_bump_bond_test(
                &mut module,
                &bump_bond,
                LeastSquares::default(),
                SmoothedPeakSearch,
                &mut NullSink,
            )?;
            println!("=== Bump bond test ===");
            println!("CalDel:                         {}", report.caldel_summary());
            println!("VthrComp:                       {}", report.vthrcomp_summary());
            println!("number of dead bumps (per ROC): {}", report.dead_bumps_summary());
            println!("separation cut       (per ROC): {}", report.separation_cut_summary());
            if !report.complete {
                println!("incomplete readout, {} DAQ errors", report.daq_errors);
            }
            println!("duration: {:.1} s", report.duration.as_secs_f64());
        }
    }
    Ok(())
}
