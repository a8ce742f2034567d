//! Measurement stabilization: raw counts in, one accepted XYZ out.
//!
//! Each raw sample is converted in a fixed order:
//!
//! 1. black offsets (interpolated for the sample's integration time) subtracted
//! 2. temperature compensation against the calibration temperature
//! 3. divided by gain and integration time
//! 4. reflective mode: normalised to the white reference
//! 5. factory matrix to XYZ, then the optional display correction
//!
//! Samples are taken until a convergence rule accepts a value for Y, see
//! [`ConvergenceTracker`].

use crate::correction::CorrectionMatrix;
use colorcal_core::abort::AbortFlag;
use colorcal_core::calibration::CalibrationData;
use colorcal_core::capabilities::Mode;
use colorcal_core::data::{
    CalibratedReading, Confidence, ConversionProfile, RawOutcome, RawSample, Xyz,
};
use colorcal_core::driver::InstrumentDriver;
use colorcal_core::error::{ColorError, ColorResult};
use colorcal_core::error_recovery::RetryPolicy;
use colorcal_core::measurement::{MeasurementCycle, MeasurementState, StabilizationConfig};
use std::collections::VecDeque;

/// Reflective readings are scaled so the white reference has Y = 100.
const WHITE_SCALE: f64 = 100.0;

fn black_subtracted(
    channels: &[f64],
    integration_time: f64,
    cal: &CalibrationData,
) -> ColorResult<Vec<f64>> {
    let Some(black) = &cal.black else {
        return Ok(channels.to_vec());
    };
    let offsets = black
        .offsets_at(integration_time)
        .ok_or_else(|| ColorError::Misread("black level has no usable points".into()))?;
    if offsets.len() != channels.len() {
        return Err(ColorError::Misread(format!(
            "black level has {} channels, sample has {}",
            offsets.len(),
            channels.len()
        )));
    }
    Ok(channels.iter().zip(&offsets).map(|(c, o)| c - o).collect())
}

fn per_second(
    values: &[f64],
    range: u8,
    integration_time: f64,
    profile: &ConversionProfile,
) -> ColorResult<Vec<f64>> {
    let gain = profile
        .gain(range)
        .ok_or_else(|| ColorError::Misread(format!("unknown range code {range}")))?;
    if gain <= 0.0 || integration_time <= 0.0 {
        return Err(ColorError::Misread(format!(
            "invalid gain {gain} or integration time {integration_time}"
        )));
    }
    Ok(values.iter().map(|v| v / (gain * integration_time)).collect())
}

/// Convert one raw sample to XYZ.
pub fn convert(
    raw: &RawSample,
    profile: &ConversionProfile,
    cal: &CalibrationData,
    mode: Mode,
    correction: Option<&CorrectionMatrix>,
) -> ColorResult<Xyz> {
    if raw.channels.len() != profile.channels() {
        return Err(ColorError::Misread(format!(
            "expected {} channels, got {}",
            profile.channels(),
            raw.channels.len()
        )));
    }

    let mut values = black_subtracted(&raw.channels, raw.integration_time, cal)?;

    if let (Some(now), Some(at_cal)) = (raw.temperature, cal.calibration_temperature) {
        let delta = now - at_cal;
        for (i, v) in values.iter_mut().enumerate() {
            let coeff = profile.temperature_coefficients.get(i).copied().unwrap_or(0.0);
            *v *= 1.0 + delta * coeff;
        }
    }

    let mut values = per_second(&values, raw.range, raw.integration_time, profile)?;

    if mode == Mode::Reflective {
        let white = cal.white.as_ref().ok_or_else(|| {
            ColorError::Internal("reflective reading without white reference".into())
        })?;
        let white_counts = black_subtracted(&white.counts, white.integration_time, cal)?;
        let white_rates = per_second(&white_counts, 0, white.integration_time, profile)?;
        if white_rates.len() != values.len() {
            return Err(ColorError::Misread("white reference channel count differs".into()));
        }
        for (v, w) in values.iter_mut().zip(&white_rates) {
            if *w <= 0.0 {
                return Err(ColorError::Misread("white reference has no signal".into()));
            }
            *v = *v / w * WHITE_SCALE;
        }
    }

    let row = |r: &Vec<f64>| r.iter().zip(&values).map(|(m, v)| m * v).sum::<f64>();
    let mut xyz = Xyz::new(
        row(&profile.matrix[0]),
        row(&profile.matrix[1]),
        row(&profile.matrix[2]),
    );
    if let Some(ccmx) = correction {
        xyz = ccmx.apply(xyz);
    }
    if !xyz.is_finite() {
        return Err(ColorError::Misread(format!("non-finite result {xyz}")));
    }
    Ok(xyz)
}

/// Rolling convergence check over the last three Y values.
///
/// Rules, first match wins:
/// - repeat: the two newest differ by at most `repeat_band` of their mean,
///   accept the mean
/// - monotonic: the last three move one way and the newest lies within
///   `monotonic_band` of the mean of the last two, accept the newest
/// - alternation: the last three zig-zag and the newest lies within
///   `alternation_band` of the mean of the last two, accept that mean
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    config: StabilizationConfig,
    history: VecDeque<Xyz>,
}

impl ConvergenceTracker {
    /// Empty tracker.
    pub fn new(config: StabilizationConfig) -> Self {
        Self {
            config,
            history: VecDeque::with_capacity(3),
        }
    }

    fn within(&self, value: f64, reference: f64, band: f64) -> bool {
        let diff = (value - reference).abs();
        diff <= band * reference.abs() || diff <= self.config.near_black_floor
    }

    /// Add a sample; returns the accepted value once converged.
    pub fn push(&mut self, xyz: Xyz) -> Option<Xyz> {
        if self.history.len() == 3 {
            self.history.pop_front();
        }
        self.history.push_back(xyz);

        let n = self.history.len();
        if n < 2 {
            return None;
        }
        let prev = self.history[n - 2];
        let newest = self.history[n - 1];
        let mean = Xyz::mean(prev, newest);
        let spread = (newest.y - prev.y).abs();
        if spread <= self.config.repeat_band * mean.y.abs() || spread <= self.config.near_black_floor {
            return Some(mean);
        }
        if n < 3 {
            return None;
        }

        let (a, b, c) = (self.history[0].y, prev.y, newest.y);
        let monotonic = (a <= b && b <= c) || (a >= b && b >= c);
        if monotonic && self.within(c, mean.y, self.config.monotonic_band) {
            return Some(newest);
        }
        let alternating = (b > a && c < b) || (b < a && c > b);
        if alternating && self.within(c, mean.y, self.config.alternation_band) {
            return Some(mean);
        }
        None
    }
}

/// What the engine needs besides the driver.
#[derive(Debug, Clone, Copy)]
pub struct MeasureContext<'a> {
    /// Current calibration state.
    pub calibration: &'a CalibrationData,
    /// Optional display correction.
    pub correction: Option<&'a CorrectionMatrix>,
    /// Convergence thresholds.
    pub config: &'a StabilizationConfig,
    /// Transport retry budget per sample.
    pub retry: &'a RetryPolicy,
    /// Session abort flag.
    pub abort: &'a AbortFlag,
}

/// One raw read with bounded retry of transport faults.
async fn acquire<D>(driver: &mut D, mode: Mode, ctx: &MeasureContext<'_>) -> ColorResult<RawOutcome>
where
    D: InstrumentDriver + ?Sized,
{
    let max_attempts = ctx.retry.attempts();
    let mut attempt = 1;
    loop {
        ctx.abort.check()?;
        match driver.read_raw(mode).await {
            Err(ColorError::TransportFailure(last)) => {
                if attempt >= max_attempts {
                    tracing::error!(target: "colorcal::measure", attempts = max_attempts, error = %last, "Device unresponsive");
                    return Err(ColorError::DeviceUnresponsive {
                        attempts: max_attempts,
                        last,
                    });
                }
                tracing::warn!(
                    target: "colorcal::measure",
                    attempt,
                    max_attempts,
                    error = %last,
                    "Raw read failed, retrying"
                );
                ctx.abort.sleep(ctx.retry.backoff_delay).await?;
                attempt += 1;
            }
            other => return other,
        }
    }
}

async fn sample_until_stable<D>(
    driver: &mut D,
    mode: Mode,
    ctx: &MeasureContext<'_>,
) -> ColorResult<CalibratedReading>
where
    D: InstrumentDriver + ?Sized,
{
    let config = ctx.config;
    let measurement_type = mode.measurement_type();
    let mut tracker = ConvergenceTracker::new(*config);
    let mut last = None;

    for n in 1..=config.max_samples {
        ctx.abort.check()?;
        let raw = match acquire(driver, mode, ctx).await? {
            RawOutcome::Sample(raw) => raw,
            RawOutcome::OutOfRange(overflow) => {
                tracing::debug!(target: "colorcal::measure", %overflow, "Sample out of range");
                return Err(ColorError::OutOfRange(overflow));
            }
        };
        let xyz = convert(&raw, driver.conversion(), ctx.calibration, mode, ctx.correction)?;
        tracing::trace!(target: "colorcal::measure", sample = n, y = xyz.y, "Converted sample");
        if let Some(accepted) = tracker.push(xyz) {
            tracing::debug!(target: "colorcal::measure", samples = n, %accepted, "Reading converged");
            return Ok(CalibratedReading::new(
                accepted,
                measurement_type,
                Confidence::Converged,
                raw.spectrum,
                n,
            ));
        }
        last = Some((xyz, raw.spectrum));
    }

    let (xyz, spectrum) =
        last.ok_or_else(|| ColorError::Internal("no samples taken".into()))?;
    let best = CalibratedReading::new(
        xyz,
        measurement_type,
        Confidence::Degraded,
        spectrum,
        config.max_samples,
    );
    if config.accept_degraded {
        tracing::warn!(target: "colorcal::measure", samples = config.max_samples, "Accepting unsettled reading");
        Ok(best)
    } else {
        Err(ColorError::Unstable {
            best: Box::new(best),
            attempts: config.max_samples,
        })
    }
}

/// Take samples until one converges, driving `cycle` through a full round.
///
/// Any error resets the cycle to idle.
pub async fn stabilize<D>(
    driver: &mut D,
    mode: Mode,
    ctx: &MeasureContext<'_>,
    cycle: &mut MeasurementCycle,
) -> ColorResult<CalibratedReading>
where
    D: InstrumentDriver + ?Sized,
{
    cycle.advance(MeasurementState::Armed)?;
    cycle.advance(MeasurementState::Triggered)?;
    cycle.advance(MeasurementState::Measuring)?;
    match sample_until_stable(driver, mode, ctx).await {
        Ok(reading) => {
            cycle.advance(MeasurementState::Idle)?;
            Ok(reading)
        }
        Err(err) => {
            cycle.reset();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{SimulationScript, Simulated};
    use colorcal_core::calibration::{BlackLevel, WhiteReference};

    fn y(values: &[f64]) -> Vec<Option<f64>> {
        let mut tracker = ConvergenceTracker::new(StabilizationConfig::default());
        values
            .iter()
            .map(|v| tracker.push(Xyz::new(*v, *v, *v)).map(|x| x.y))
            .collect()
    }

    #[test]
    fn test_monotonic_then_flat_accepts_newest() {
        assert_eq!(y(&[100.0, 98.2, 97.9]), vec![None, None, Some(97.9)]);
    }

    #[test]
    fn test_wild_alternation_never_accepts() {
        assert_eq!(y(&[100.0, 70.0, 130.0]), vec![None, None, None]);
    }

    #[test]
    fn test_repeat_accepts_mean() {
        let accepted = y(&[50.0, 50.05]);
        let got = accepted[1].unwrap();
        assert!((got - 50.025).abs() < 1e-9);
    }

    #[test]
    fn test_small_alternation_accepts_mean() {
        let accepted = y(&[100.0, 99.0, 100.5]);
        let got = accepted[2].unwrap();
        assert!((got - 99.75).abs() < 1e-9);
    }

    #[test]
    fn test_near_black_floor() {
        assert!(y(&[0.0, 0.00005])[1].is_some());
    }

    #[test]
    fn test_black_subtracted_before_gain() {
        let profile = ConversionProfile {
            matrix: [vec![1.0], vec![1.0], vec![1.0]],
            gains: vec![1.0, 4.0],
            temperature_coefficients: vec![0.0],
            base_id: "test".into(),
        };
        let cal = CalibrationData {
            black: Some(BlackLevel::single(0.5, vec![10.0])),
            ..Default::default()
        };
        let raw = RawSample::new(vec![110.0], 0.5, 1);
        let xyz = convert(&raw, &profile, &cal, Mode::Emissive, None).unwrap();
        // (110 - 10) / (4 * 0.5), not 110 / 2 - 10.
        assert!((xyz.y - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_temperature_compensation() {
        let mut profile = ConversionProfile::identity("t");
        profile.temperature_coefficients = vec![0.01, 0.0, 0.0];
        let cal = CalibrationData {
            calibration_temperature: Some(20.0),
            ..Default::default()
        };
        let raw = RawSample::new(vec![100.0, 100.0, 100.0], 1.0, 0).with_temperature(25.0);
        let xyz = convert(&raw, &profile, &cal, Mode::Emissive, None).unwrap();
        assert!((xyz.x - 105.0).abs() < 1e-9);
        assert!((xyz.y - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_reflective_needs_white_and_scales_to_it() {
        let profile = ConversionProfile::identity("r");
        let mut cal = CalibrationData::default();
        let raw = RawSample::new(vec![50.0, 50.0, 50.0], 1.0, 0);
        assert!(matches!(
            convert(&raw, &profile, &cal, Mode::Reflective, None),
            Err(ColorError::Internal(_))
        ));
        cal.white = Some(WhiteReference {
            integration_time: 2.0,
            counts: vec![200.0, 200.0, 200.0],
        });
        let xyz = convert(&raw, &profile, &cal, Mode::Reflective, None).unwrap();
        assert!((xyz.y - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_channel_mismatch_is_misread() {
        let raw = RawSample::new(vec![1.0, 2.0], 1.0, 0);
        assert!(matches!(
            convert(&raw, &ConversionProfile::identity("m"), &CalibrationData::default(), Mode::Emissive, None),
            Err(ColorError::Misread(_))
        ));
    }

    fn run_ctx<'a>(
        cal: &'a CalibrationData,
        config: &'a StabilizationConfig,
        retry: &'a RetryPolicy,
        abort: &'a AbortFlag,
    ) -> MeasureContext<'a> {
        MeasureContext {
            calibration: cal,
            correction: None,
            config,
            retry,
            abort,
        }
    }

    #[tokio::test]
    async fn test_unstable_after_exactly_max_samples() {
        let mut sim = Simulated::new(SimulationScript {
            luminance: [100.0, 50.0].repeat(10),
            ..Default::default()
        })
        .unwrap();
        let cal = CalibrationData::default();
        let config = StabilizationConfig {
            max_samples: 6,
            ..Default::default()
        };
        let retry = RetryPolicy::none();
        let abort = AbortFlag::new();
        let mut cycle = MeasurementCycle::default();
        let err = stabilize(&mut sim, Mode::Emissive, &run_ctx(&cal, &config, &retry, &abort), &mut cycle)
            .await
            .unwrap_err();
        let ColorError::Unstable { best, attempts } = err else {
            panic!("expected Unstable, got {err:?}");
        };
        assert_eq!(attempts, 6);
        assert_eq!(sim.reads(), 6);
        assert_eq!(best.confidence(), Confidence::Degraded);
        assert_eq!(cycle.state(), MeasurementState::Idle);
        assert_eq!(cycle.completed(), 0);
    }

    #[tokio::test]
    async fn test_settling_display_is_accepted_near_final_value() {
        let mut sim = Simulated::new(SimulationScript {
            luminance: vec![130.0, 115.0, 104.0, 100.4, 100.1, 100.0],
            dark_offset: 0.0,
            ..Default::default()
        })
        .unwrap();
        let cal = CalibrationData::default();
        let config = StabilizationConfig::default();
        let retry = RetryPolicy::none();
        let abort = AbortFlag::new();
        let mut cycle = MeasurementCycle::default();
        let reading = stabilize(&mut sim, Mode::Emissive, &run_ctx(&cal, &config, &retry, &abort), &mut cycle)
            .await
            .unwrap();
        assert_eq!(reading.confidence(), Confidence::Converged);
        assert_eq!(sim.reads(), 5);
        assert_eq!(reading.samples(), 5);
        let y = reading.xyz().y;
        assert!((y - 100.0).abs() <= 0.5, "accepted {y} while still settling");
        assert_eq!(cycle.completed(), 1);
    }

    #[tokio::test]
    async fn test_degraded_accepted_when_configured() {
        let mut sim = Simulated::new(SimulationScript {
            luminance: [100.0, 50.0].repeat(10),
            dark_offset: 0.0,
            ..Default::default()
        })
        .unwrap();
        let cal = CalibrationData::default();
        let config = StabilizationConfig {
            max_samples: 3,
            accept_degraded: true,
            ..Default::default()
        };
        let retry = RetryPolicy::none();
        let abort = AbortFlag::new();
        let mut cycle = MeasurementCycle::default();
        let reading = stabilize(&mut sim, Mode::Emissive, &run_ctx(&cal, &config, &retry, &abort), &mut cycle)
            .await
            .unwrap();
        assert_eq!(reading.confidence(), Confidence::Degraded);
        assert_eq!(reading.xyz().y, 100.0);
        assert_eq!(cycle.completed(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_exhaustion_is_device_unresponsive() {
        let mut sim = Simulated::new(SimulationScript {
            transport_failures: 5,
            ..Default::default()
        })
        .unwrap();
        let cal = CalibrationData::default();
        let config = StabilizationConfig::default();
        let retry = RetryPolicy::default();
        let abort = AbortFlag::new();
        let mut cycle = MeasurementCycle::default();
        let err = stabilize(&mut sim, Mode::Emissive, &run_ctx(&cal, &config, &retry, &abort), &mut cycle)
            .await
            .unwrap_err();
        assert!(matches!(err, ColorError::DeviceUnresponsive { attempts: 3, .. }));
        assert_eq!(sim.reads(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_absorbed() {
        let mut sim = Simulated::new(SimulationScript {
            transport_failures: 2,
            luminance: vec![80.0],
            dark_offset: 0.0,
            ..Default::default()
        })
        .unwrap();
        let cal = CalibrationData::default();
        let config = StabilizationConfig::default();
        let retry = RetryPolicy::default();
        let abort = AbortFlag::new();
        let mut cycle = MeasurementCycle::default();
        let reading = stabilize(&mut sim, Mode::Emissive, &run_ctx(&cal, &config, &retry, &abort), &mut cycle)
            .await
            .unwrap();
        assert_eq!(reading.confidence(), Confidence::Converged);
        assert_eq!(reading.samples(), 2);
        assert!((reading.xyz().y - 80.0).abs() < 1e-9);
    }
}
