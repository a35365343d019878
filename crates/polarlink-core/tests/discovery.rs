//! Baud-probing tests against the simulated device.

mod common;

use std::sync::{Arc, Mutex};

use common::{simulated_device, SimState};
use polarlink_core::discovery::{probe_with, PROBE_BAUD_RATES};
use polarlink_core::error::ProtocolError;
use polarlink_core::serial::BaudRate;
use polarlink_core::transport::Transport;

type Factory = Box<dyn FnMut(BaudRate) -> Result<Box<dyn Transport>, ProtocolError>>;

/// Factory that records every attempted baud rate and keeps each created
/// simulator for later inspection
fn recording_factory(
    device_baud: u32,
) -> (
    Factory,
    Arc<Mutex<Vec<u32>>>,
    Arc<Mutex<Vec<Arc<Mutex<SimState>>>>>,
) {
    let attempts = Arc::new(Mutex::new(Vec::new()));
    let sims = Arc::new(Mutex::new(Vec::new()));
    let attempts_in = Arc::clone(&attempts);
    let sims_in = Arc::clone(&sims);

    let factory = Box::new(move |baud: BaudRate| {
        attempts_in.lock().unwrap().push(baud.bits_per_second());
        let (transport, state) = simulated_device(device_baud, baud.bits_per_second());
        sims_in.lock().unwrap().push(state);
        Ok(Box::new(transport) as Box<dyn Transport>)
    });

    (factory, attempts, sims)
}

#[test]
fn probe_finds_the_one_responding_rate() {
    let (factory, attempts, sims) = recording_factory(115_200);

    let found = probe_with(factory).unwrap();
    assert_eq!(found, BaudRate::Baud115200);

    // every slower rate was tried first, and nothing after the hit
    let expected: Vec<u32> = PROBE_BAUD_RATES
        .iter()
        .map(|b| b.bits_per_second())
        .collect();
    assert_eq!(*attempts.lock().unwrap(), expected);

    // no attempt leaves its port held, including the successful one
    for sim in sims.lock().unwrap().iter() {
        assert!(!sim.lock().unwrap().is_open());
    }
}

#[test]
fn probe_stops_early_when_the_first_rate_answers() {
    let (factory, attempts, _sims) = recording_factory(9_600);

    let found = probe_with(factory).unwrap();
    assert_eq!(found, BaudRate::Baud9600);
    assert_eq!(*attempts.lock().unwrap(), vec![9_600]);
}

#[test]
fn silent_device_yields_no_response_after_full_sweep() {
    // a device stuck at a rate outside the probe table never answers
    let (factory, attempts, _sims) = recording_factory(4_800);

    assert!(matches!(
        probe_with(factory),
        Err(ProtocolError::NoResponse)
    ));
    assert_eq!(attempts.lock().unwrap().len(), PROBE_BAUD_RATES.len());
}

#[test]
fn every_probe_attempt_releases_its_port() {
    let (factory, _attempts, sims) = recording_factory(57_600);

    probe_with(factory).unwrap();

    for sim in sims.lock().unwrap().iter() {
        assert!(!sim.lock().unwrap_or_else(|e| e.into_inner()).is_open());
    }
}

#[test]
fn open_failures_propagate_for_missing_devices() {
    let result = probe_with(|_baud| {
        Err(ProtocolError::DeviceNotFound("/dev/ttyUSB9".to_string()))
    });
    assert!(matches!(result, Err(ProtocolError::DeviceNotFound(_))));
}
