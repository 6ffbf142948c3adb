//! End-to-end scenario runs on simulated boards.
//!
//! # Test Coverage
//!
//! | Test | Description |
//! |------|-------------|
//! | `test_live_count` | Ungated count of simulated edges |
//! | `test_gated_count_waits_for_partner` | Count over a single-pulse gate |
//! | `test_single_pulse_with_delayed_start` | Phase walk Disarmed -> PulsingDelay -> Steady -> Disarmed |
//! | `test_continuous_train_stays_armed` | Continuous trains never disarm on TC |
//! | `test_acquire_from_async_context` | Blocking reads through `spawn_blocking` |
//! | `test_second_board_is_independent` | Minor 1 runs while minor 0 is idle |

use std::sync::Arc;
use std::time::Duration;

use daq_driver_stc::subsystem::CounterPhase;
use daq_driver_stc::{CounterId, DriverConfig};
use stc_daq::config::AppConfig;
use stc_daq::scenarios::{
    acquire, count_events, generate_pulses, AcquireRequest, CountRequest, PulseRequest,
    SimulatedRig,
};

fn rig() -> SimulatedRig {
    SimulatedRig::new(DriverConfig::default()).unwrap()
}

// =============================================================================
// Counting
// =============================================================================

#[test]
fn test_live_count() {
    let rig = rig();
    let report = count_events(
        &rig,
        &CountRequest {
            minor: 0,
            counter: CounterId::G1,
            source_pfi: 2,
            edges: 777,
            gate_ticks: None,
        },
    )
    .unwrap();
    assert_eq!(report.count, 777);
    assert!(!report.gated);
    assert!(!rig.bus(0).unwrap().is_armed(CounterId::G1));
    assert!(!rig.driver().board(0).unwrap().is_open());
}

#[test]
fn test_gated_count_waits_for_partner() {
    let rig = rig();
    let report = count_events(
        &rig,
        &CountRequest {
            minor: 0,
            counter: CounterId::G0,
            source_pfi: 0,
            edges: 12_345,
            gate_ticks: Some(200_000),
        },
    )
    .unwrap();
    assert_eq!(report.count, 12_345);
    assert!(report.gated);
}

// =============================================================================
// Pulses
// =============================================================================

#[test]
fn test_single_pulse_with_delayed_start() {
    let rig = rig();
    let report = generate_pulses(
        &rig,
        &PulseRequest {
            minor: 0,
            counter: CounterId::G0,
            low_ticks: 10,
            high_ticks: 30,
            delay_ticks: 5,
            continuous: false,
            delay_start: true,
            tc_events: 2,
        },
    )
    .unwrap();

    assert_eq!(
        report.phases,
        vec![
            CounterPhase::Disarmed,
            CounterPhase::PulsingDelay,
            CounterPhase::PulsingSteady,
            CounterPhase::Disarmed,
        ]
    );
    assert_eq!(report.load_registers, (29, 9));
    assert!((report.frequency_hz - 500_000.0).abs() < 1e-6);
    assert!(!report.armed_at_end);
}

#[test]
fn test_continuous_train_stays_armed() {
    let rig = rig();
    let report = generate_pulses(
        &rig,
        &PulseRequest {
            minor: 0,
            counter: CounterId::G1,
            low_ticks: 2,
            high_ticks: 2,
            delay_ticks: 2,
            continuous: true,
            delay_start: false,
            tc_events: 4,
        },
    )
    .unwrap();
    assert!(report.armed_at_end);
    assert_eq!(report.phases.last(), Some(&CounterPhase::PulsingSteady));
}

// =============================================================================
// Acquisition
// =============================================================================

#[tokio::test]
async fn test_acquire_from_async_context() {
    let rig = Arc::new(rig());
    let request = AcquireRequest {
        minor: 0,
        channels: vec![3, 1, 4],
        scans: 5,
        scan_interval_ticks: 20_000,
        period: Duration::from_millis(2),
        read_chunk: 8,
    };

    let report = {
        let rig = rig.clone();
        tokio::task::spawn_blocking(move || acquire(&rig, &request))
            .await
            .unwrap()
            .unwrap()
    };

    assert_eq!(report.samples, (0..15).collect::<Vec<u16>>());
    assert_eq!(report.scans_produced, 5);
    assert!(report.reads >= 4);
    assert!(!rig.driver().board(0).unwrap().ai_dma().is_allocated());
}

#[test]
fn test_second_board_is_independent() {
    let config = AppConfig::load_from(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/config/stc_daq.toml"
    ))
    .unwrap();
    let rig = SimulatedRig::new(config.driver).unwrap();

    let report = acquire(
        &rig,
        &AcquireRequest {
            minor: 1,
            channels: vec![0],
            scans: 3,
            scan_interval_ticks: 1000,
            period: Duration::from_millis(1),
            read_chunk: 2,
        },
    )
    .unwrap();
    assert_eq!(report.samples, vec![0, 1, 2]);
    assert!(!rig.bus(0).unwrap().ai_running());
}
