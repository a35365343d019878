//! Command serialization tests: the session lock is the only thing standing
//! between two callers and interleaved bytes on the wire.

mod common;

use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{simulated_device, SimState};
use polarlink_core::prelude::*;

fn tracker_at_9600() -> (Tracker, Arc<Mutex<SimState>>) {
    let (transport, state) = simulated_device(9_600, 9_600);
    (Tracker::from_transport(Box::new(transport)), state)
}

#[test]
fn concurrent_commands_never_interleave_on_the_wire() {
    let (tracker, sim) = tracker_at_9600();
    const PER_THREAD: usize = 50;

    let barrier = Arc::new(Barrier::new(2));
    let mut workers = Vec::new();
    for _ in 0..2 {
        let handle = tracker.clone();
        let barrier = Arc::clone(&barrier);
        workers.push(thread::spawn(move || {
            barrier.wait();
            for _ in 0..PER_THREAD {
                handle.beep(1).unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    let sim = sim.lock().unwrap();
    assert_eq!(sim.writes.len(), 2 * PER_THREAD);
    assert_eq!(sim.violations, 0, "interleaved command bytes on the wire");
}

#[test]
fn polling_thread_and_command_thread_share_one_handle() {
    let (tracker, sim) = tracker_at_9600();
    tracker.initialize().unwrap();
    tracker
        .attach_tool(&[0xAB; 64], TrackingPriority::Dynamic)
        .unwrap();
    tracker.start_tracking().unwrap();

    let poller = {
        let handle = tracker.clone();
        thread::spawn(move || {
            handle
                .transforms()
                .take(40)
                .map(|f| f.unwrap())
                .collect::<Vec<_>>()
        })
    };

    // meanwhile, another thread asks the device for its version
    let querier = {
        let handle = tracker.clone();
        thread::spawn(move || {
            for _ in 0..10 {
                handle.version(0).unwrap();
            }
        })
    };

    let frames = poller.join().unwrap();
    querier.join().unwrap();

    assert_eq!(frames.len(), 40);
    // frame indices are strictly increasing even with the querier in between
    let indices: Vec<u32> = frames.iter().map(|f| f.frame_index().unwrap()).collect();
    assert!(indices.windows(2).all(|w| w[1] > w[0]));
    assert_eq!(sim.lock().unwrap().violations, 0);
}

#[test]
fn close_blocks_until_the_in_flight_command_completes() {
    let (tracker, sim) = tracker_at_9600();
    sim.lock().unwrap().reply_delay = Duration::from_millis(300);

    let started = Arc::new(Barrier::new(2));
    let worker = {
        let handle = tracker.clone();
        let started = Arc::clone(&started);
        thread::spawn(move || {
            started.wait();
            handle.version(0)
        })
    };

    started.wait();
    // give the worker a moment to take the command lock
    thread::sleep(Duration::from_millis(50));

    let begin = Instant::now();
    tracker.close().unwrap();
    let waited = begin.elapsed();

    // close had to sit out the in-flight exchange rather than abort it
    assert!(waited >= Duration::from_millis(150), "close returned in {waited:?}");
    assert!(worker.join().unwrap().is_ok());
    assert_eq!(tracker.state(), DeviceState::Closed);
}
