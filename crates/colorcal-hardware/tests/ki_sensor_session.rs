//! A KiSensor over a scripted serial link: dark calibration under cover,
//! integration time chosen on the display, and both restored after reopen.

use colorcal_core::abort::AbortFlag;
use colorcal_core::calibration::CalibrationType;
use colorcal_core::capabilities::Mode;
use colorcal_core::data::InstrumentType;
use colorcal_hardware::transport::mock::{MockLink, MockLog, MockRequest};
use colorcal_hardware::{Instrument, SessionSettings};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// KiSensor firmware. While `covered` is set every reading underloads.
fn ki_sensor(covered: Arc<AtomicBool>) -> MockLink {
    MockLink::new(move |req: &MockRequest| {
        let cmd = std::str::from_utf8(&req.bytes).ok()?.trim_end_matches('\r');
        let reply = match cmd {
            "V" => "KS-3 V2.04",
            "S" => "KS0042",
            "M" => "1 0 0 0 1 0 0 0 1",
            "K" => "0.001 0.002 0.003",
            "T" => "25.5",
            "ME" | "MA" | "A0" | "A1" | "A2" | "A3" => "",
            "D100" => "10 11 12",
            "D1000" => "19 20 21",
            c if c.starts_with('R') && covered.load(Ordering::SeqCst) => "<22>",
            c if c.starts_with('R') => "3000 2000 1000 1 25.5",
            _ => "<01>",
        };
        Some(format!("{reply}\r").into_bytes())
    })
    .labeled("mock-ki")
}

fn settings(dir: &Path) -> SessionSettings {
    let mut settings = SessionSettings::ephemeral();
    settings.calibration.use_cache = true;
    settings.calibration.cache_dir = Some(dir.to_path_buf());
    settings
}

async fn open(covered: Arc<AtomicBool>, dir: &Path) -> (Instrument, MockLog) {
    let link = ki_sensor(covered);
    let log = link.log();
    let instrument = Instrument::open(
        InstrumentType::KiSensor,
        Box::new(link),
        &settings(dir),
        AbortFlag::new(),
    )
    .await
    .unwrap();
    (instrument, log)
}

#[tokio::test]
async fn test_integration_time_is_chosen_on_the_display() {
    let dir = tempfile::tempdir().unwrap();
    let covered = Arc::new(AtomicBool::new(true));
    let (mut instrument, log) = open(covered.clone(), dir.path()).await;
    assert_eq!(
        instrument.needed_and_available_calibrations().0,
        CalibrationType::DARK | CalibrationType::INTEGRATION_TIME
    );

    // The device sees it is covered, so dark runs without a host.
    let summary = instrument.calibrate().await.unwrap();
    assert_eq!(summary.completed, CalibrationType::DARK);
    assert!(instrument.calibration_data().black.is_some());
    assert_eq!(instrument.calibration_data().integration_time, None);
    assert_eq!(
        instrument.needed_and_available_calibrations().0,
        CalibrationType::INTEGRATION_TIME
    );

    covered.store(false, Ordering::SeqCst);
    let reading = instrument.read_sample(Mode::Emissive).await.unwrap();
    assert!(reading.is_valid());
    // 3000 counts in 0.1 s scales to 1.0 s, not the 2.0 s ceiling.
    assert_eq!(instrument.calibration_data().integration_time, Some(1.0));
    assert!(log.count(b"R1000\r") > 0);
    assert_eq!(log.count(b"R2000\r"), 0);
    assert!(instrument.needed_and_available_calibrations().0.is_empty());
    instrument.close().await.unwrap();
}

#[tokio::test]
async fn test_reopen_restores_integration_time() {
    let dir = tempfile::tempdir().unwrap();
    let covered = Arc::new(AtomicBool::new(true));
    let (mut first, _) = open(covered.clone(), dir.path()).await;
    first.calibrate().await.unwrap();
    covered.store(false, Ordering::SeqCst);
    first.read_sample(Mode::Emissive).await.unwrap();
    first.close().await.unwrap();

    let (mut second, log) = open(covered, dir.path()).await;
    assert!(second.needed_and_available_calibrations().0.is_empty());
    assert_eq!(second.calibration_data().integration_time, Some(1.0));

    let reading = second.read_sample(Mode::Emissive).await.unwrap();
    assert!(reading.is_valid());
    assert!(log.count(b"R1000\r") > 0);
    // Neither the default 0.4 s nor a fresh selection at 0.1 s.
    assert_eq!(log.count(b"R400\r"), 0);
    assert_eq!(log.count(b"R100\r"), 0);
    second.close().await.unwrap();
}
