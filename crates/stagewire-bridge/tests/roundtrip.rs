//! Full-duplex transport tests with the worker service attached on a thread,
//! exercising the same shared regions a child process would map.

use std::path::PathBuf;
use std::time::Duration;

use stagewire_bridge::{
    BridgeConfig, BridgeTransport, ChildStatus, GainPlugin, ServerMessage, WorkerService,
};

fn split_paths(joined: &str) -> Vec<PathBuf> {
    joined.split(':').map(PathBuf::from).collect()
}

fn start_worker(transport: &BridgeTransport) -> std::thread::JoinHandle<()> {
    let paths = split_paths(&transport.shm_paths());
    std::thread::spawn(move || {
        let mut service = WorkerService::attach(
            &paths[0],
            &paths[1],
            &paths[2],
            &paths[3],
            Box::new(GainPlugin::new()),
        )
        .expect("worker attach");
        service.publish_descriptor().expect("publish");
        service.run().expect("worker loop");
    })
}

#[test]
fn worker_handshake_publishes_descriptor() {
    let mut transport = BridgeTransport::create(BridgeConfig::default(), 128, 48_000.0).unwrap();
    let worker = start_worker(&transport);

    let messages = transport.wait_ready().unwrap();
    assert!(messages
        .iter()
        .any(|m| matches!(m, ServerMessage::AudioCount { ins: 2, outs: 2 })));
    assert!(messages
        .iter()
        .any(|m| matches!(m, ServerMessage::ParameterCount(1))));
    assert!(messages.iter().any(|m| matches!(
        m,
        ServerMessage::ParameterRanges1 { index: 0, .. }
    )));
    assert_eq!(transport.check_child(), ChildStatus::NotSpawned);

    transport.shutdown();
    worker.join().unwrap();
}

#[test]
fn audio_cycle_roundtrip_applies_gain() {
    let mut transport = BridgeTransport::create(BridgeConfig::default(), 64, 48_000.0).unwrap();
    let worker = start_worker(&transport);
    transport.wait_ready().unwrap();

    transport.resize_pool(64, 2, 2).unwrap();
    transport.activate().unwrap();
    transport.set_parameter_value(0, 0.5).unwrap();
    // Let the worker drain the non-RT ring before the first cycle.
    std::thread::sleep(Duration::from_millis(200));

    let input: Vec<f32> = (0..64).map(|i| (i as f32 / 64.0) - 0.5).collect();
    transport.pool_mut().write_input(0, &input);
    transport.pool_mut().write_input(1, &input);

    assert!(transport.process_cycle(64));
    assert!(!transport.timed_out());

    let mut left = vec![0.0f32; 64];
    let mut right = vec![0.0f32; 64];
    transport.pool().read_output(0, &mut left);
    transport.pool().read_output(1, &mut right);
    for (out, inp) in left.iter().zip(input.iter()) {
        assert!((out - inp * 0.5).abs() < 1e-6);
    }
    assert_eq!(left, right);

    transport.shutdown();
    worker.join().unwrap();
}

#[test]
fn ping_is_answered_with_pong() {
    let mut transport = BridgeTransport::create(BridgeConfig::default(), 64, 48_000.0).unwrap();
    let worker = start_worker(&transport);
    transport.wait_ready().unwrap();

    let age = transport.ping();
    assert!(age >= 1);

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let mut saw_pong = false;
    while std::time::Instant::now() < deadline {
        if let Some(ServerMessage::Pong) = transport.poll_server().unwrap() {
            saw_pong = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(saw_pong);

    transport.shutdown();
    worker.join().unwrap();
}

#[test]
fn prepare_for_save_reports_saved() {
    let mut transport = BridgeTransport::create(BridgeConfig::default(), 64, 48_000.0).unwrap();
    let worker = start_worker(&transport);
    transport.wait_ready().unwrap();

    transport.prepare_for_save().unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    let mut saved = false;
    while std::time::Instant::now() < deadline {
        if let Some(ServerMessage::Saved) = transport.poll_server().unwrap() {
            saved = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(saved);

    transport.shutdown();
    worker.join().unwrap();
}

#[test]
fn timeout_is_sticky_until_recovered() {
    // No worker at all: the first cycle must time out and stay timed out.
    let config = BridgeConfig {
        rt_timeout: Duration::from_millis(50),
        ..BridgeConfig::default()
    };
    let mut transport = BridgeTransport::create(config, 64, 48_000.0).unwrap();
    transport.resize_pool(64, 0, 2).unwrap();

    assert!(!transport.process_cycle(64));
    assert!(transport.timed_out());
    // Sticky: the next cycle skips the round-trip without waiting again.
    let start = std::time::Instant::now();
    assert!(!transport.process_cycle(64));
    assert!(start.elapsed() < Duration::from_millis(40));
    assert!(!transport.try_recover());
    assert!(transport.timed_out());
}
