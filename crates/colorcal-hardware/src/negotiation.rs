//! Calibration negotiation.
//!
//! A driver knows how to calibrate itself but not how to make a human cover
//! the sensor or place it on a tile. The loop here sits between the two:
//!
//! ```text
//! loop:
//!   step = driver.calibrate(outstanding, condition, mode)
//!   Completed  → apply update, drop cleared types, done when none remain
//!   NeedsSetup → device confirms the condition itself?  use it
//!              → otherwise ask the host (or fail with SetupNeeded)
//!                  Abort     → UserAbort
//!                  Skip      → drop the type if optional, else SetupNeeded
//!                  Confirmed → retry with the requested condition
//!                  timeout   → retry with the same condition
//! ```
//!
//! Every round that clears nothing counts against
//! `max_rounds_without_progress`; running out is `CalibrationStalled`.

use colorcal_core::abort::AbortFlag;
use colorcal_core::calibration::{
    CalibrationCondition, CalibrationData, CalibrationHost, CalibrationStep, CalibrationType,
    HostResponse,
};
use colorcal_core::capabilities::Mode;
use colorcal_core::driver::InstrumentDriver;
use colorcal_core::error::{ColorError, ColorResult};
use std::time::Duration;

/// Bounds and collaborators of one negotiation.
#[derive(Clone, Copy)]
pub struct NegotiationParams<'a> {
    /// Who arranges physical conditions; `None` fails on the first request.
    pub host: Option<&'a dyn CalibrationHost>,
    /// How long to wait for the host per request.
    pub setup_timeout: Duration,
    /// Consecutive rounds without progress before giving up.
    pub max_rounds_without_progress: u32,
    /// Session abort flag.
    pub abort: &'a AbortFlag,
}

impl std::fmt::Debug for NegotiationParams<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationParams")
            .field("host", &self.host.is_some())
            .field("setup_timeout", &self.setup_timeout)
            .field("max_rounds_without_progress", &self.max_rounds_without_progress)
            .finish()
    }
}

/// What a negotiation achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiationSummary {
    /// Types the driver completed.
    pub completed: CalibrationType,
    /// Optional types the host skipped.
    pub skipped: CalibrationType,
    /// Rounds run.
    pub rounds: u32,
}

/// Run the driver's calibration sequence for `requested` in `mode`.
///
/// Updates are applied to `calibration` as each type completes, so a failure
/// part way keeps what was already measured.
pub async fn negotiate<D>(
    driver: &mut D,
    mode: Mode,
    requested: CalibrationType,
    initial_condition: CalibrationCondition,
    calibration: &mut CalibrationData,
    params: &NegotiationParams<'_>,
) -> ColorResult<NegotiationSummary>
where
    D: InstrumentDriver + ?Sized,
{
    let mut summary = NegotiationSummary::default();
    negotiate_into(
        driver,
        mode,
        requested,
        initial_condition,
        calibration,
        params,
        &mut summary,
    )
    .await?;
    Ok(summary)
}

/// [`negotiate`], recording progress in `summary` even when it fails.
pub async fn negotiate_into<D>(
    driver: &mut D,
    mode: Mode,
    requested: CalibrationType,
    initial_condition: CalibrationCondition,
    calibration: &mut CalibrationData,
    params: &NegotiationParams<'_>,
    summary: &mut NegotiationSummary,
) -> ColorResult<()>
where
    D: InstrumentDriver + ?Sized,
{
    let mut outstanding = requested;
    let mut condition = initial_condition;
    let mut idle_rounds = 0u32;

    while !outstanding.is_empty() {
        params.abort.check()?;
        if idle_rounds >= params.max_rounds_without_progress {
            tracing::warn!(target: "colorcal::calibration", outstanding = outstanding.label(), rounds = idle_rounds, "Calibration stalled");
            return Err(ColorError::CalibrationStalled {
                kind: outstanding,
                rounds: idle_rounds,
            });
        }
        summary.rounds += 1;

        match driver.calibrate(outstanding, condition, mode).await? {
            CalibrationStep::Completed { cleared, update } => {
                let cleared = cleared & outstanding;
                if cleared.is_empty() {
                    idle_rounds += 1;
                    continue;
                }
                calibration.apply(update);
                outstanding.remove(cleared);
                summary.completed |= cleared;
                idle_rounds = 0;
                tracing::info!(target: "colorcal::calibration", kind = cleared.label(), %mode, "Calibration completed");
            }
            CalibrationStep::NeedsSetup(requirement) => {
                idle_rounds += 1;
                if driver.verify_condition(requirement.condition).await? {
                    tracing::debug!(target: "colorcal::calibration", condition = ?requirement.condition, "Device confirmed condition");
                    condition = requirement.condition;
                    continue;
                }
                let Some(host) = params.host else {
                    return Err(ColorError::CalibrationSetupNeeded(requirement));
                };
                tracing::info!(target: "colorcal::calibration", %requirement, "Waiting for host");
                let wait = tokio::time::timeout(params.setup_timeout, host.request_setup(&requirement));
                match params.abort.guard(wait).await? {
                    Ok(HostResponse::Abort) => return Err(ColorError::UserAbort),
                    Ok(HostResponse::Skip) if requirement.optional => {
                        tracing::info!(target: "colorcal::calibration", kind = requirement.kind.label(), "Optional calibration skipped");
                        outstanding.remove(requirement.kind);
                        summary.skipped |= requirement.kind & requested;
                        idle_rounds = 0;
                    }
                    Ok(HostResponse::Skip) => {
                        return Err(ColorError::CalibrationSetupNeeded(requirement));
                    }
                    Ok(HostResponse::Confirmed) => condition = requirement.condition,
                    Err(_) => {
                        tracing::warn!(target: "colorcal::calibration", timeout = ?params.setup_timeout, "Host did not answer, retrying");
                    }
                }
            }
        }
    }

    Ok(())
}
