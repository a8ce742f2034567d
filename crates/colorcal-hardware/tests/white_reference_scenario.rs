//! A device that needs a white reference surfaces exactly one placement
//! request, accepts the confirmation and then needs nothing more.

use async_trait::async_trait;
use colorcal_core::calibration::{
    CalibrationCondition, CalibrationHost, CalibrationRequest, CalibrationRequirement,
    CalibrationType, HostResponse,
};
use colorcal_core::capabilities::Mode;
use colorcal_core::error::ColorError;
use colorcal_hardware::{Instrument, SessionSettings, SimulationScript};
use std::sync::{Arc, Mutex};

fn white_only() -> SimulationScript {
    SimulationScript {
        required_reflective: CalibrationType::WHITE_REFERENCE,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_white_reference_round_trip_without_host() {
    let mut instrument = Instrument::simulated(white_only(), &SessionSettings::ephemeral())
        .await
        .unwrap();
    instrument.set_mode(Mode::Reflective).await.unwrap();
    assert_eq!(
        instrument.needed_and_available_calibrations().0,
        CalibrationType::WHITE_REFERENCE
    );

    let requirement = match instrument.calibrate().await {
        Err(ColorError::CalibrationSetupNeeded(req)) => req,
        other => panic!("expected a setup request, got {other:?}"),
    };
    assert_eq!(requirement.kind, CalibrationType::WHITE_REFERENCE);
    assert_eq!(
        requirement.condition,
        CalibrationCondition::PlaceOnWhiteReference
    );
    assert_eq!(requirement.identifier.as_deref(), Some("SIM-TILE-001"));

    instrument.confirm_setup(CalibrationCondition::PlaceOnWhiteReference);
    let summary = instrument.calibrate().await.unwrap();
    assert_eq!(summary.completed, CalibrationType::WHITE_REFERENCE);
    assert!(instrument.needed_and_available_calibrations().0.is_empty());

    let reading = instrument.read_sample(Mode::Reflective).await.unwrap();
    assert!(reading.is_valid());
    // Sample 120 against a 1000 tile, both carrying the same undarkened offset.
    assert!((reading.xyz().y - 100.0 * 120.5 / 1000.5).abs() < 1e-6);
}

/// Records every requirement it is shown and confirms it.
#[derive(Default)]
struct ConfirmingHost {
    seen: Mutex<Vec<CalibrationRequirement>>,
}

#[async_trait]
impl CalibrationHost for ConfirmingHost {
    async fn request_setup(&self, requirement: &CalibrationRequirement) -> HostResponse {
        self.seen.lock().unwrap().push(requirement.clone());
        HostResponse::Confirmed
    }
}

#[tokio::test]
async fn test_host_sees_one_request_per_condition() {
    let mut instrument =
        Instrument::simulated(SimulationScript::default(), &SessionSettings::ephemeral())
            .await
            .unwrap();
    let host = Arc::new(ConfirmingHost::default());
    instrument.set_host(Some(host.clone()));
    instrument.set_mode(Mode::Reflective).await.unwrap();

    let summary = instrument
        .calibrate_request(CalibrationRequest::All)
        .await
        .unwrap();
    assert_eq!(
        summary.completed,
        CalibrationType::DARK | CalibrationType::WHITE_REFERENCE
    );

    let conditions: Vec<_> = host
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|r| r.condition)
        .collect();
    assert_eq!(
        conditions,
        vec![
            CalibrationCondition::CoverSensor,
            CalibrationCondition::PlaceOnWhiteReference
        ]
    );
    assert!(instrument.needed_and_available_calibrations().0.is_empty());
}

#[tokio::test]
async fn test_read_refuses_until_white_is_done() {
    let mut instrument = Instrument::simulated(white_only(), &SessionSettings::ephemeral())
        .await
        .unwrap();
    match instrument.read_sample(Mode::Reflective).await {
        Err(ColorError::CalibrationSetupNeeded(req)) => {
            assert_eq!(req.condition, CalibrationCondition::PlaceOnWhiteReference);
        }
        other => panic!("expected setup needed, got {other:?}"),
    }
    // Emissive needs only dark, which this script still requires.
    assert!(matches!(
        instrument.read_sample(Mode::Emissive).await,
        Err(ColorError::CalibrationSetupNeeded(_))
    ));
}
