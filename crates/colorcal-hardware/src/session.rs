//! An open instrument.
//!
//! [`Instrument`] owns everything one session needs: the driver for the
//! attached family, the shared transport, the current mode, calibration state
//! and its on-disk record, the measurement cycle, the abort flag and the
//! background switch poller. Every operation is checked against the driver's
//! capability bitmask before the driver is touched.
//!
//! ```no_run
//! use colorcal_hardware::config::SessionSettings;
//! use colorcal_hardware::session::Instrument;
//! use colorcal_core::capabilities::Mode;
//!
//! # async fn demo() -> colorcal_core::error::ColorResult<()> {
//! let mut instrument = Instrument::probe_and_open("/dev/ttyUSB0", &SessionSettings::default()).await?;
//! instrument.calibrate().await?;
//! let reading = instrument.read_sample(Mode::Emissive).await?;
//! println!("{}", reading.xyz());
//! instrument.close().await
//! # }
//! ```

use crate::cache::{CalibrationCache, PersistedCalibration};
use crate::config::SessionSettings;
use crate::correction::CorrectionMatrix;
use crate::drivers::{Driver, DriverContext, SimulationScript, Simulated};
use crate::negotiation::{negotiate_into, NegotiationParams, NegotiationSummary};
use crate::poller::{SwitchEvent, SwitchPoller, EVENT_CAPACITY};
use crate::probe::{probe_and_open_link, LinkOpener, SystemOpener};
use crate::stabilize::{stabilize, MeasureContext};
use crate::transport::mock::NullLink;
use crate::transport::{Link, Transport};
use chrono::Utc;
use colorcal_core::abort::AbortFlag;
use colorcal_core::calibration::{
    CalibrationCondition, CalibrationData, CalibrationHost, CalibrationRequest, CalibrationType,
};
use colorcal_core::capabilities::{supports, CapabilityBits, Mode, Operation};
use colorcal_core::data::{CalibratedReading, DeviceIdentity, InstrumentType};
use colorcal_core::driver::InstrumentDriver;
use colorcal_core::error::{ColorError, ColorResult};
use colorcal_core::measurement::{MeasurementCycle, StabilizationConfig};
use std::sync::Arc;
use tokio::sync::broadcast;

/// An identified, open instrument.
pub struct Instrument {
    driver: Driver,
    transport: Transport,
    settings: SessionSettings,
    identity: DeviceIdentity,
    mode: Mode,
    mode_applied: bool,
    calibration: CalibrationData,
    record: PersistedCalibration,
    cycle: MeasurementCycle,
    abort: AbortFlag,
    correction: Option<CorrectionMatrix>,
    cache: Option<CalibrationCache>,
    host: Option<Arc<dyn CalibrationHost>>,
    confirmed: CalibrationCondition,
    events: broadcast::Sender<SwitchEvent>,
    poller: Option<SwitchPoller>,
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("type", &self.driver.instrument_type())
            .field("serial", &self.identity.serial)
            .field("mode", &self.mode)
            .field("transport", &self.transport)
            .field("poller", &self.poller.is_some())
            .finish()
    }
}

impl Instrument {
    /// Open the device at `path`, identify its family and initialise it.
    pub async fn probe_and_open(path: &str, settings: &SessionSettings) -> ColorResult<Self> {
        Self::probe_and_open_with(&SystemOpener, path, settings, AbortFlag::new()).await
    }

    /// [`probe_and_open`](Self::probe_and_open) with a custom opener and a
    /// caller-owned abort flag.
    pub async fn probe_and_open_with(
        opener: &dyn LinkOpener,
        path: &str,
        settings: &SessionSettings,
        abort: AbortFlag,
    ) -> ColorResult<Self> {
        settings.validate()?;
        let (kind, link) = probe_and_open_link(opener, path, settings, &abort).await?;
        tracing::info!(target: "colorcal::probe", path, %kind, "Instrument detected");
        Self::open(kind, link, settings, abort).await
    }

    /// Initialise a known family over an already open link.
    pub async fn open(
        kind: InstrumentType,
        link: Box<dyn Link>,
        settings: &SessionSettings,
        abort: AbortFlag,
    ) -> ColorResult<Self> {
        settings.validate()?;
        let transport = Transport::new(link);
        let ctx = DriverContext::new(transport.clone(), settings, abort.clone());
        let driver = Driver::open(kind, ctx)?;
        Self::initialise(driver, transport, settings, abort).await
    }

    /// A simulated instrument following `script`; no I/O.
    pub async fn simulated(script: SimulationScript, settings: &SessionSettings) -> ColorResult<Self> {
        settings.validate()?;
        let driver = Driver::Simulated(Simulated::new(script)?);
        let transport = Transport::new(Box::new(NullLink));
        Self::initialise(driver, transport, settings, AbortFlag::new()).await
    }

    async fn initialise(
        mut driver: Driver,
        transport: Transport,
        settings: &SessionSettings,
        abort: AbortFlag,
    ) -> ColorResult<Self> {
        let kind = driver.instrument_type();
        let caps = driver.capabilities();
        let mode = caps
            .modes()
            .first()
            .copied()
            .ok_or_else(|| ColorError::Internal(format!("{kind} supports no measurement mode")))?;

        let identity = driver.identify().await?;
        tracing::info!(
            target: "colorcal::session",
            %kind,
            model = %identity.model,
            firmware = %identity.firmware,
            serial = %identity.serial,
            "Instrument identified"
        );

        let cache = if settings.calibration.use_cache {
            CalibrationCache::at_or_default(settings.calibration.cache_dir.as_deref())
        } else {
            None
        };
        let record = match &cache {
            Some(cache) => cache.load(kind, &identity.serial, driver.cache_timeout()).await,
            None => None,
        }
        .unwrap_or_else(|| {
            PersistedCalibration::new(kind, identity.serial.clone(), CalibrationData::default())
        });
        if !record.completed.is_empty() {
            tracing::debug!(
                target: "colorcal::session",
                stamps = record.completed.len(),
                "Restoring cached calibration"
            );
            driver.restore(&record.data);
        }

        let correction = match &settings.calibration.correction_path {
            Some(path) => {
                let ccmx = CorrectionMatrix::load(path)?;
                ccmx.check_base(driver.conversion())?;
                Some(ccmx)
            }
            None => None,
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let poller = match driver.status_poll() {
            Some(status)
                if caps.contains(CapabilityBits::TRIGGER_SWITCH) && settings.poller.enabled =>
            {
                Some(SwitchPoller::spawn(
                    status,
                    settings.poller.interval(),
                    abort.clone(),
                    events.clone(),
                ))
            }
            _ => None,
        };

        Ok(Self {
            calibration: record.data.clone(),
            driver,
            transport,
            settings: settings.clone(),
            identity,
            mode,
            mode_applied: false,
            record,
            cycle: MeasurementCycle::default(),
            abort,
            correction,
            cache,
            host: None,
            confirmed: CalibrationCondition::None,
            events,
            poller,
        })
    }

    fn ensure_open(&self) -> ColorResult<()> {
        if self.transport.is_open() {
            Ok(())
        } else {
            Err(ColorError::NoCommunication)
        }
    }

    fn ensure(&self, op: Operation) -> ColorResult<()> {
        self.ensure_open()?;
        if self.supports(op) {
            Ok(())
        } else {
            Err(ColorError::unsupported(op))
        }
    }

    /// Family of the attached device.
    pub fn instrument_type(&self) -> InstrumentType {
        self.driver.instrument_type()
    }

    /// Model, firmware and serial reported at open.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Capability bitmask.
    pub fn capabilities(&self) -> CapabilityBits {
        self.driver.capabilities()
    }

    /// Whether `op` is within the capability bitmask.
    pub fn supports(&self, op: Operation) -> bool {
        supports(self.capabilities(), op)
    }

    /// Current operating mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current calibration state.
    pub fn calibration_data(&self) -> &CalibrationData {
        &self.calibration
    }

    /// Clone of the session abort flag. Raising it unwinds any running
    /// operation and stops the switch poller.
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Who arranges physical conditions during calibration. Without a host,
    /// the first requirement is returned as `CalibrationSetupNeeded`.
    pub fn set_host(&mut self, host: Option<Arc<dyn CalibrationHost>>) {
        self.host = host;
    }

    /// Switch the operating mode.
    pub async fn set_mode(&mut self, mode: Mode) -> ColorResult<()> {
        self.ensure(Operation::SetMode)?;
        if !self.capabilities().supports_mode(mode) {
            return Err(ColorError::unsupported(Operation::SetMode));
        }
        self.driver.set_mode(mode).await?;
        if self.mode != mode {
            tracing::info!(target: "colorcal::session", from = %self.mode, to = %mode, "Mode changed");
        }
        self.mode = mode;
        self.mode_applied = true;
        Ok(())
    }

    fn valid_calibrations(&self) -> CalibrationType {
        let driver = &self.driver;
        self.record
            .valid_types(Utc::now(), |kind| driver.calibration_timeout(kind))
    }

    fn needed_for(&self, mode: Mode) -> CalibrationType {
        let policy = self.driver.calibration_policy(mode);
        policy.required - self.valid_calibrations()
    }

    /// `(needed, available)` calibration types for the current mode.
    ///
    /// Needed types are required and not completed within their timeout.
    pub fn needed_and_available_calibrations(&self) -> (CalibrationType, CalibrationType) {
        let policy = self.driver.calibration_policy(self.mode);
        (self.needed_for(self.mode), policy.available)
    }

    /// Record that the host has arranged `condition`; the next calibration
    /// round starts from it.
    pub fn confirm_setup(&mut self, condition: CalibrationCondition) {
        tracing::debug!(target: "colorcal::calibration", ?condition, "Setup confirmed");
        self.confirmed = condition;
    }

    /// Run every needed calibration for the current mode that does not wait
    /// for the target. Integration time and display refresh run at the next
    /// [`read_sample`](Self::read_sample).
    pub async fn calibrate(&mut self) -> ColorResult<NegotiationSummary> {
        self.calibrate_request(CalibrationRequest::Needed).await
    }

    /// Run the calibrations named by `request` for the current mode.
    pub async fn calibrate_request(
        &mut self,
        request: CalibrationRequest,
    ) -> ColorResult<NegotiationSummary> {
        self.ensure(Operation::Calibrate)?;
        let (needed, available) = self.needed_and_available_calibrations();
        if let CalibrationRequest::Types(types) = request {
            if !available.contains(types) {
                return Err(ColorError::Configuration(format!(
                    "{} calibration is not available in {} mode",
                    (types - available).label(),
                    self.mode
                )));
            }
        }
        let requested = request.expand(needed, available);
        if requested.is_empty() {
            tracing::debug!(target: "colorcal::calibration", mode = %self.mode, "Nothing to calibrate");
            return Ok(NegotiationSummary::default());
        }
        self.run_negotiation(self.mode, requested).await
    }

    async fn apply_mode(&mut self, mode: Mode) -> ColorResult<()> {
        if !self.capabilities().supports_mode(mode) {
            return Err(ColorError::unsupported(Operation::SetMode));
        }
        if mode != self.mode || !self.mode_applied {
            self.set_mode(mode).await?;
        }
        Ok(())
    }

    async fn run_negotiation(
        &mut self,
        mode: Mode,
        requested: CalibrationType,
    ) -> ColorResult<NegotiationSummary> {
        if !self.mode_applied {
            self.apply_mode(mode).await?;
        }
        let condition = std::mem::replace(&mut self.confirmed, CalibrationCondition::None);
        let params = NegotiationParams {
            host: self.host.as_deref(),
            setup_timeout: self.settings.calibration.setup_timeout(),
            max_rounds_without_progress: self.settings.calibration.max_rounds_without_progress,
            abort: &self.abort,
        };
        let mut summary = NegotiationSummary::default();
        let outcome = negotiate_into(
            &mut self.driver,
            mode,
            requested,
            condition,
            &mut self.calibration,
            &params,
            &mut summary,
        )
        .await;
        // Types finished before a failure still count.
        if !summary.completed.is_empty() {
            self.persist(summary.completed).await?;
        }
        outcome.map(|()| summary)
    }

    async fn persist(&mut self, completed: CalibrationType) -> ColorResult<()> {
        let now = Utc::now();
        self.record.stamp(completed, now);
        self.record.data = self.calibration.clone();
        self.record.last_used = now;
        if let Some(cache) = &self.cache {
            cache.save(&self.record).await?;
        }
        Ok(())
    }

    fn stabilization_config(&self) -> StabilizationConfig {
        self.settings
            .stabilization
            .unwrap_or_else(|| self.driver.stabilization())
    }

    /// Take one converged reading in `mode`.
    ///
    /// Fails with `CalibrationSetupNeeded` while any non-deferrable calibration
    /// is outstanding. Outstanding deferrable calibrations (integration time,
    /// display refresh) run first.
    pub async fn read_sample(&mut self, mode: Mode) -> ColorResult<CalibratedReading> {
        self.ensure(Operation::ReadRaw)?;
        self.apply_mode(mode).await?;

        let needed = self.needed_for(mode);
        if let Some(blocking) = needed.non_deferrable().first() {
            let requirement = self.driver.requirement_for(blocking);
            tracing::debug!(target: "colorcal::measure", %requirement, "Calibration outstanding");
            return Err(ColorError::CalibrationSetupNeeded(requirement));
        }
        let deferred = needed.deferrable();
        if !deferred.is_empty() {
            tracing::debug!(target: "colorcal::measure", kind = deferred.label(), "Running deferred calibration");
            self.run_negotiation(mode, deferred).await?;
        }

        let config = self.stabilization_config();
        let retry = self.settings.transport.retry_policy();
        let ctx = MeasureContext {
            calibration: &self.calibration,
            correction: self.correction.as_ref(),
            config: &config,
            retry: &retry,
            abort: &self.abort,
        };
        stabilize(&mut self.driver, mode, &ctx, &mut self.cycle).await
    }

    /// Select gain range `range`.
    pub async fn set_range(&mut self, range: u8) -> ColorResult<()> {
        self.ensure(Operation::SetRange)?;
        self.driver.set_range(range).await
    }

    /// Sensor temperature in °C.
    pub async fn read_temperature(&mut self) -> ColorResult<f64> {
        self.ensure(Operation::ReadTemperature)?;
        self.driver.read_temperature().await
    }

    /// Subscribe to trigger-switch presses.
    pub fn switch_events(&self) -> ColorResult<broadcast::Receiver<SwitchEvent>> {
        self.ensure(Operation::PollSwitch)?;
        Ok(self.events.subscribe())
    }

    /// Release the device: stop the poller, mark the cached calibration as
    /// used and close the link.
    pub async fn close(mut self) -> ColorResult<()> {
        if let Some(mut poller) = self.poller.take() {
            poller.stop().await;
        }
        if let Some(cache) = &self.cache {
            if !self.record.completed.is_empty() {
                if let Err(e) = cache.touch(self.record.instrument, &self.record.serial).await {
                    tracing::warn!(target: "colorcal::cache", error = %e, "Could not update last-used time");
                }
            }
        }
        self.transport.close();
        tracing::info!(target: "colorcal::session", serial = %self.identity.serial, "Instrument closed");
        Ok(())
    }
}

impl Drop for Instrument {
    fn drop(&mut self) {
        self.transport.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sim(script: SimulationScript) -> Instrument {
        Instrument::simulated(script, &SessionSettings::ephemeral())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_operations_outside_bitmask_are_unsupported() {
        let mut instrument = sim(SimulationScript::default()).await;
        assert!(!instrument.supports(Operation::SetRange));
        assert!(matches!(
            instrument.set_range(2).await,
            Err(ColorError::Unsupported {
                operation: Operation::SetRange
            })
        ));
        assert!(matches!(
            instrument.switch_events(),
            Err(ColorError::Unsupported {
                operation: Operation::PollSwitch
            })
        ));
        assert!(matches!(
            instrument.set_mode(Mode::EmissiveRefresh).await,
            Err(ColorError::Unsupported { .. })
        ));
        assert!((instrument.read_temperature().await.unwrap() - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_read_blocks_until_dark_calibrated() {
        let mut instrument = sim(SimulationScript {
            sensor_covered: true,
            ..Default::default()
        })
        .await;
        assert_eq!(instrument.mode(), Mode::Emissive);
        let (needed, available) = instrument.needed_and_available_calibrations();
        assert_eq!(needed, CalibrationType::DARK);
        assert!(available.contains(CalibrationType::DARK));

        match instrument.read_sample(Mode::Emissive).await {
            Err(ColorError::CalibrationSetupNeeded(req)) => {
                assert_eq!(req.condition, CalibrationCondition::CoverSensor);
            }
            other => panic!("expected setup needed, got {other:?}"),
        }

        let summary = instrument.calibrate().await.unwrap();
        assert_eq!(summary.completed, CalibrationType::DARK);
        assert!(instrument.needed_and_available_calibrations().0.is_empty());

        let reading = instrument.read_sample(Mode::Emissive).await.unwrap();
        assert!((reading.xyz().y - 120.0).abs() < 1e-9);
        assert!(reading.spectrum().is_some());
    }

    #[tokio::test]
    async fn test_calibrate_request_rejects_unavailable_types() {
        let mut instrument = sim(SimulationScript::default()).await;
        assert!(matches!(
            instrument
                .calibrate_request(CalibrationRequest::Types(CalibrationType::GLOSS))
                .await,
            Err(ColorError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_close_stops_operations() {
        let instrument = sim(SimulationScript::default()).await;
        let transport = instrument.transport.clone();
        instrument.close().await.unwrap();
        assert!(!transport.is_open());
    }
}
