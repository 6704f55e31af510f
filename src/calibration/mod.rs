//! Bump-bond calibration of a module.
//!
//! Two steps: place every ROC's CalDel/VthrComp operating point from a
//! tornado scan of one probe pixel, then take CalS threshold maps of all
//! pixels at that point and classify the bumps. Every ROC is processed
//! independently; one failing ROC shows up in the report but does not stop
//! the others.

pub mod report;

use crate::PerRoc;
use crate::daq::acquire::{ScanAcquirer, Sweep};
use crate::daq::guard::{DacSnapshot, PixelSelection};
use crate::daq::{ChipConfig, ScanFlags, Testboard, dacs};
use crate::defect::DefectClassifier;
use crate::error::Result;
use crate::fit::CurveFitter;
use crate::fit::peaks::PeakSearch;
use crate::params::{BumpBondParams, ClassifierParams};
use crate::surface::ResponseSurface;
use crate::surface::operating_point::{OperatingPoint, OperatingPointExtractor};
use crate::threshold::ThresholdMapBuilder;

use report::{BumpBondReport, OperatingPointOutcome, ReportSink, operating_point_line};

#[derive(Debug, Clone)]
pub struct OperatingPointScan {
    pub outcomes: PerRoc<OperatingPointOutcome>,
    pub daq_errors: u32,
    pub complete: bool,
}

/// Scan CalDel x VthrComp on the probe pixel and set each ROC to the
/// extracted operating point.
///
/// All DACs are restored after the scan; only then are the new CalDel and
/// VthrComp values written. ROCs without a valid point, or whose registers
/// cannot be written, keep their settings and are reported individually.
pub fn calibrate_operating_points<D: Testboard>(
    dut: &mut D,
    params: &BumpBondParams,
    sink: &mut impl ReportSink,
) -> Result<OperatingPointScan> {
    let rocs = dut.enabled_rocs();
    let acquisition = {
        let mut dut = DacSnapshot::new(dut)?;
        dut.set_dac(dacs::CTRLREG, params.ctrlreg)?;
        dut.set_dac(dacs::VCAL, params.tornado_vcal)?;
        dut.test_all_pixels(false);
        dut.mask_all_pixels(true);

        ScanAcquirer::new(params.acquisition).acquire(
            &mut *dut,
            PixelSelection::Single(params.probe_pixel),
            Sweep::TwoD {
                dac1: dacs::CALDEL,
                range1: params.caldel_range,
                dac2: dacs::VTHRCOMP,
                range2: params.vthrcomp_range,
            },
            params.ntrig,
            ScanFlags::CALS,
        )
    };

    let surfaces = ResponseSurface::from_samples(
        &acquisition.samples,
        &rocs,
        params.caldel_range,
        params.vthrcomp_range,
    );
    let extractor = OperatingPointExtractor {
        delta_param2: params.delta_vthrcomp,
        frac_param1: params.frac_caldel,
        edge_skip_bins: params.edge_skip_bins,
    };

    let mut outcomes = PerRoc::new();
    for (&roc, surface) in &surfaces {
        let outcome = apply_operating_point(dut, roc, extractor.extract(surface));
        let point = match &outcome {
            OperatingPointOutcome::Applied(p) => Some(p),
            _ => None,
        };
        sink.surface(roc, surface, point);
        outcomes.insert(roc, outcome);
    }
    sink.operating_points(&outcomes);

    log::info!("operating point scan done");
    log::info!("CalDel:   {}", operating_point_line(&outcomes, OperatingPointOutcome::caldel));
    log::info!("VthrComp: {}", operating_point_line(&outcomes, OperatingPointOutcome::vthrcomp));

    Ok(OperatingPointScan {
        outcomes,
        daq_errors: acquisition.daq_errors,
        complete: acquisition.complete,
    })
}

/// Write an extracted point to `roc`, falling back to its prior settings.
fn apply_operating_point<D: ChipConfig>(
    dut: &mut D,
    roc: u8,
    extracted: Result<OperatingPoint>,
) -> OperatingPointOutcome {
    let prior = dut
        .dac(roc, dacs::CALDEL)
        .and_then(|caldel| Ok((caldel, dut.dac(roc, dacs::VTHRCOMP)?)));
    let (caldel, vthrcomp) = match prior {
        Ok(prior) => prior,
        Err(reason) => {
            log::warn!("ROC {roc}: cannot read operating point ({reason})");
            return OperatingPointOutcome::Failed { reason };
        }
    };

    let point = match extracted {
        Ok(point) => point,
        Err(reason) => {
            log::warn!("ROC {roc}: no operating point ({reason}), keeping settings");
            return OperatingPointOutcome::Retained {
                caldel,
                vthrcomp,
                reason,
            };
        }
    };
    log::debug!(
        "ROC {roc} CalDel: {} +/- {}",
        point.param1,
        point.param1_uncertainty
    );

    let written = dut
        .set_dac_for(roc, dacs::CALDEL, point.param1)
        .and_then(|()| dut.set_dac_for(roc, dacs::VTHRCOMP, point.param2));
    match written {
        Ok(()) => OperatingPointOutcome::Applied(point),
        Err(reason) => {
            log::warn!("ROC {roc}: cannot apply operating point ({reason}), keeping settings");
            for (name, value) in [(dacs::CALDEL, caldel), (dacs::VTHRCOMP, vthrcomp)] {
                if let Err(e) = dut.set_dac_for(roc, name, value) {
                    log::warn!("ROC {roc}: failed to restore {name}: {e}");
                }
            }
            OperatingPointOutcome::Retained {
                caldel,
                vthrcomp,
                reason,
            }
        }
    }
}

/// Full bump-bond test: operating points, CalS threshold maps, classification.
pub fn run_bump_bond_test<D, F, P>(
    dut: &mut D,
    params: &BumpBondParams,
    fitter: F,
    peaks: P,
    sink: &mut impl ReportSink,
) -> Result<BumpBondReport>
where
    D: Testboard,
    F: CurveFitter + Clone,
    P: PeakSearch,
{
    let start = web_time::Instant::now();
    log::info!("bump bond test: ntrig = {}", params.ntrig);

    let operating = calibrate_operating_points(dut, params, sink)?;

    let classifier_params = ClassifierParams {
        nsigma: params.nsigma,
        ..params.classifier.clone()
    };
    let builder = ThresholdMapBuilder::new(
        fitter.clone(),
        ScanAcquirer::new(params.acquisition),
        classifier_params.sentinel,
    );
    let scan = {
        let mut dut = DacSnapshot::new(dut)?;
        dut.set_dac(dacs::CTRLREG, params.ctrlreg)?;
        builder.build(
            &mut *dut,
            dacs::VCAL,
            params.vcal_range,
            params.ntrig,
            ScanFlags::CALS,
        )
    };

    let classifier = DefectClassifier::new(classifier_params, fitter, peaks);
    let mut classifications = PerRoc::new();
    for (&roc, map) in &scan.maps {
        let distribution = classifier.distribution(map);
        let result = classifier.classify_distribution(&distribution);
        match result.defective_pixel_count() {
            Some(n) => log::debug!(
                "ROC {roc}: peak {:.1} +/- {:.1}, {n} defective",
                result.peak_mean,
                result.peak_sigma
            ),
            None => log::warn!("ROC {roc}: no usable peak in threshold distribution"),
        }
        sink.distribution(roc, &distribution, &result);
        if let Some(rescaled) = result.rescaled(map) {
            sink.rescaled_map(roc, &rescaled);
        }
        classifications.insert(roc, result);
    }

    let report = BumpBondReport {
        operating_points: operating.outcomes,
        thresholds: scan.maps,
        classifications,
        daq_errors: operating.daq_errors + scan.daq_errors,
        complete: operating.complete && scan.complete,
        duration: start.elapsed(),
    };

    let mut done = String::from("bump bond test done");
    if report.daq_errors > 0 {
        done += &format!(" with {} decoding errors", report.daq_errors);
    }
    log::info!("{done}, duration: {} seconds", report.duration.as_secs());
    log::info!("number of dead bumps (per ROC): {}", report.dead_bumps_summary());
    log::info!("separation cut       (per ROC): {}", report.separation_cut_summary());

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daq::sim::{BumpState, SimulatedModule};
    use crate::daq::{DacRange, Pixel, ResponseSample, ScanService};
    use crate::error::{DaqError, Error};
    use crate::fit::LeastSquares;
    use crate::fit::peaks::SmoothedPeakSearch;
    use crate::surface::operating_point::OperatingPoint;

    #[derive(Default)]
    struct Recorder {
        surfaces: Vec<(u8, Option<OperatingPoint>)>,
        summaries: usize,
    }

    impl ReportSink for Recorder {
        fn surface(&mut self, roc: u8, _surface: &ResponseSurface, point: Option<&OperatingPoint>) {
            self.surfaces.push((roc, point.copied()));
        }

        fn operating_points(&mut self, _outcomes: &PerRoc<OperatingPointOutcome>) {
            self.summaries += 1;
        }
    }

    fn module(n_rocs: u8, seed: u64) -> SimulatedModule {
        let mut module = SimulatedModule::new(n_rocs, seed);
        let probe = BumpBondParams::default().probe_pixel;
        for roc in 0..n_rocs {
            module.set_bump(roc, probe, BumpState::Good);
        }
        module
    }

    #[test]
    fn operating_point_lands_inside_tornado() {
        let mut module = module(2, 8);
        let mut sink = Recorder::default();
        let scan =
            calibrate_operating_points(&mut module, &BumpBondParams::default(), &mut sink).unwrap();

        assert!(scan.complete);
        assert_eq!(sink.summaries, 1);
        assert_eq!(sink.surfaces.len(), 2);
        for roc in 0..2u8 {
            let outcome = &scan.outcomes[&roc];
            assert!(outcome.is_applied());
            let tornado = module.tornado(roc).unwrap();
            let caldel = module.dac(roc, dacs::CALDEL).unwrap();
            let vthrcomp = module.dac(roc, dacs::VTHRCOMP).unwrap();
            assert_eq!(
                (Some(caldel), Some(vthrcomp)),
                (outcome.caldel(), outcome.vthrcomp())
            );
            assert!(tornado.contains(caldel as f64, vthrcomp as f64));
            assert!((vthrcomp as f64) < tornado.top);
        }
        // everything else came back
        assert_eq!(module.dac(0, dacs::VCAL).unwrap(), 200);
        assert_eq!(module.dac(0, dacs::CTRLREG).unwrap(), 0);
        assert!(!module.is_enabled(0, BumpBondParams::default().probe_pixel));
    }

    #[test]
    fn silent_probe_keeps_prior_settings() {
        let mut module = module(2, 8);
        let probe = BumpBondParams::default().probe_pixel;
        module.set_bump(1, probe, BumpState::DeadPixel);
        let caldel = module.dac(1, dacs::CALDEL).unwrap();
        let vthrcomp = module.dac(1, dacs::VTHRCOMP).unwrap();

        let mut sink = Recorder::default();
        let scan =
            calibrate_operating_points(&mut module, &BumpBondParams::default(), &mut sink).unwrap();

        assert!(scan.outcomes[&0].is_applied());
        assert_eq!(
            scan.outcomes[&1],
            OperatingPointOutcome::Retained {
                caldel,
                vthrcomp,
                reason: Error::DegenerateProjection,
            }
        );
        assert_eq!(module.dac(1, dacs::CALDEL).unwrap(), caldel);
        assert_eq!(sink.surfaces[1], (1, None));
    }

    #[test]
    fn lost_tornado_scan_is_reported() {
        let mut module = module(1, 8);
        module.inject_failure(DaqError::MissingEvents {
            missing: 50,
            partial: Vec::new(),
        });
        let scan = calibrate_operating_points(
            &mut module,
            &BumpBondParams::default(),
            &mut report::NullSink,
        )
        .unwrap();
        assert!(!scan.complete);
        assert_eq!(scan.daq_errors, 1);
        assert!(!scan.outcomes[&0].is_applied());
    }

    /// Simulated module whose CalDel register on one ROC rejects writes.
    struct StuckCalDel {
        module: SimulatedModule,
        roc: u8,
    }

    impl ScanService for StuckCalDel {
        fn sweep_1d(
            &mut self,
            dac: &str,
            range: DacRange,
            ntrig: u16,
            flags: ScanFlags,
        ) -> std::result::Result<Vec<ResponseSample>, DaqError> {
            self.module.sweep_1d(dac, range, ntrig, flags)
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
            self.module
                .sweep_2d(dac1, range1, dac2, range2, ntrig, flags)
        }

        fn efficiency_map(
            &mut self,
            ntrig: u16,
            flags: ScanFlags,
        ) -> std::result::Result<Vec<ResponseSample>, DaqError> {
            self.module.efficiency_map(ntrig, flags)
        }
    }

    impl ChipConfig for StuckCalDel {
        fn enabled_rocs(&self) -> Vec<u8> {
            self.module.enabled_rocs()
        }

        fn dac_names(&self) -> Vec<String> {
            self.module.dac_names()
        }

        fn dac(&self, roc: u8, name: &str) -> Result<u8> {
            self.module.dac(roc, name)
        }

        fn set_dac_for(&mut self, roc: u8, name: &str, value: u8) -> Result<()> {
            if roc == self.roc && name == dacs::CALDEL {
                return Err(DaqError::Fault("register write rejected".into()).into());
            }
            self.module.set_dac_for(roc, name, value)
        }

        fn test_all_pixels(&mut self, enable: bool) {
            self.module.test_all_pixels(enable);
        }

        fn mask_all_pixels(&mut self, mask: bool) {
            self.module.mask_all_pixels(mask);
        }

        fn test_pixel(&mut self, pixel: Pixel, enable: bool) {
            self.module.test_pixel(pixel, enable);
        }

        fn mask_pixel(&mut self, pixel: Pixel, mask: bool) {
            self.module.mask_pixel(pixel, mask);
        }
    }

    #[test]
    fn failed_register_write_only_affects_its_roc() {
        let mut dut = StuckCalDel {
            module: module(3, 8),
            roc: 1,
        };
        let caldel = dut.dac(1, dacs::CALDEL).unwrap();
        let vthrcomp = dut.dac(1, dacs::VTHRCOMP).unwrap();

        let scan =
            calibrate_operating_points(&mut dut, &BumpBondParams::default(), &mut report::NullSink)
                .unwrap();

        assert_eq!(scan.outcomes.len(), 3);
        for roc in [0u8, 2] {
            let outcome = &scan.outcomes[&roc];
            assert!(outcome.is_applied());
            assert_eq!(outcome.caldel(), Some(dut.dac(roc, dacs::CALDEL).unwrap()));
        }
        assert_eq!(
            scan.outcomes[&1],
            OperatingPointOutcome::Retained {
                caldel,
                vthrcomp,
                reason: Error::Daq(DaqError::Fault("register write rejected".into())),
            }
        );
        assert_eq!(dut.dac(1, dacs::VTHRCOMP).unwrap(), vthrcomp);
    }

    #[test]
    fn dead_chip_is_unclassified() {
        let mut module = module(2, 12);
        module.kill_roc(1);
        let report = run_bump_bond_test(
            &mut module,
            &BumpBondParams::default(),
            LeastSquares::default(),
            SmoothedPeakSearch,
            &mut report::NullSink,
        )
        .unwrap();

        assert!(report.operating_points[&0].is_applied());
        assert!(!report.operating_points[&1].is_applied());
        assert_eq!(report.classifications[&1].defective_pixel_count(), None);
        assert_eq!(report.unclassified_rocs(), vec![1]);

        let missing = module.count_bumps(0, BumpState::Missing)
            + module.count_bumps(0, BumpState::DeadPixel);
        let defective = report.classifications[&0].defective_pixel_count().unwrap() as usize;
        assert!(defective >= missing, "{defective} < {missing}");
        assert!(defective <= missing + 10, "{defective} vs {missing}");
        assert!(!module.is_enabled(0, Pixel { row: 0, col: 0 }));
    }
}
