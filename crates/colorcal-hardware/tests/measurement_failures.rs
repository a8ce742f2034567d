//! How a session reports a device that stops answering, overloads or never
//! settles.

use colorcal_core::calibration::CalibrationType;
use colorcal_core::capabilities::Mode;
use colorcal_core::data::{RangeDirection, RangeOverflow};
use colorcal_core::error::{ColorError, TransportError};
use colorcal_core::measurement::StabilizationConfig;
use colorcal_hardware::{Instrument, SessionSettings, SimulationScript};

fn no_calibration(script: SimulationScript) -> SimulationScript {
    SimulationScript {
        required_emissive: CalibrationType::empty(),
        ..script
    }
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_reads_become_device_unresponsive() {
    let script = no_calibration(SimulationScript {
        transport_failures: 10,
        ..Default::default()
    });
    let mut instrument = Instrument::simulated(script, &SessionSettings::ephemeral())
        .await
        .unwrap();
    match instrument.read_sample(Mode::Emissive).await {
        Err(ColorError::DeviceUnresponsive { attempts, last }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(last, TransportError::Timeout { .. }));
        }
        other => panic!("expected DeviceUnresponsive, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_overload_is_reported_not_retried() {
    let overflow = RangeOverflow {
        direction: RangeDirection::TooBright,
        at_extreme: true,
    };
    let script = no_calibration(SimulationScript {
        overflow: Some(overflow),
        ..Default::default()
    });
    let mut instrument = Instrument::simulated(script, &SessionSettings::ephemeral())
        .await
        .unwrap();
    assert!(matches!(
        instrument.read_sample(Mode::Emissive).await,
        Err(ColorError::OutOfRange(o)) if o == overflow
    ));
}

#[tokio::test(start_paused = true)]
async fn test_configured_thresholds_override_driver_defaults() {
    let script = no_calibration(SimulationScript {
        luminance: vec![100.0, 70.0, 130.0, 70.0, 130.0],
        dark_offset: 0.0,
        ..Default::default()
    });
    let mut settings = SessionSettings::ephemeral();
    settings.stabilization = Some(StabilizationConfig {
        max_samples: 4,
        ..Default::default()
    });
    let mut instrument = Instrument::simulated(script.clone(), &settings)
        .await
        .unwrap();
    match instrument.read_sample(Mode::Emissive).await {
        Err(ColorError::Unstable { best, attempts }) => {
            assert_eq!(attempts, 4);
            assert!((best.xyz().y - 70.0).abs() < 1e-9);
        }
        other => panic!("expected Unstable, got {other:?}"),
    }

    settings.stabilization = Some(StabilizationConfig {
        max_samples: 4,
        accept_degraded: true,
        ..Default::default()
    });
    let mut instrument = Instrument::simulated(script, &settings).await.unwrap();
    let reading = instrument.read_sample(Mode::Emissive).await.unwrap();
    assert_eq!(reading.samples(), 4);
    assert!(!matches!(
        reading.confidence(),
        colorcal_core::data::Confidence::Converged
    ));
}
