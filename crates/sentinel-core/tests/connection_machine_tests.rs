//! Scenario tests for the connection state machine driven by a mock clock

mod test_utils;

use sentinel_core::protocol::{
    ConnectionEvent, ConnectionMachine, ConnectionState, DisconnectReason, Effect,
    ReconnectPolicy, ABNORMAL_CLOSE, NORMAL_CLOSE,
};
use sentinel_core::types::RoomKey;
use test_utils::MockTimeSource;

fn machine_with_clock() -> (ConnectionMachine<MockTimeSource>, MockTimeSource) {
    let clock = MockTimeSource::new_at(1_000_000);
    let machine = ConnectionMachine::new(ReconnectPolicy::default(), clock.clone());
    (machine, clock)
}

fn abnormal_close() -> ConnectionEvent {
    ConnectionEvent::Closed {
        code: ABNORMAL_CLOSE,
        reason: String::new(),
    }
}

fn scheduled_delay(effects: &[Effect]) -> Option<u64> {
    effects.iter().find_map(|effect| match effect {
        Effect::ScheduleReconnect { delay_ms, .. } => Some(*delay_ms),
        _ => None,
    })
}

#[test]
fn repeated_abnormal_closes_follow_backoff_schedule() {
    let (mut machine, clock) = machine_with_clock();
    machine
        .handle(ConnectionEvent::Connect {
            room: RoomKey::new("lobby"),
        })
        .unwrap();
    machine.handle(ConnectionEvent::Opened).unwrap();

    let mut delays = Vec::new();
    let transition = machine.handle(abnormal_close()).unwrap();
    delays.extend(scheduled_delay(&transition.effects));

    // Each reconnect opens the socket and is dropped again before pong
    while let ConnectionState::Reconnecting(state) = machine.state().clone() {
        clock.advance(state.delay_ms);
        machine.handle(ConnectionEvent::ReconnectDue).unwrap();
        let transition = machine.handle(abnormal_close()).unwrap();
        delays.extend(scheduled_delay(&transition.effects));
    }

    assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
    match machine.state() {
        ConnectionState::FailedPermanently(failed) => {
            assert_eq!(failed.attempts, 5);
            assert_eq!(failed.failed_at.as_millis(), 1_000_000 + 31_000);
        }
        other => panic!("expected FailedPermanently, got {:?}", other),
    }
    assert_eq!(machine.statistics().reconnects_scheduled, 5);
    assert_eq!(machine.statistics().permanent_failures, 1);
}

#[test]
fn failed_permanently_keeps_poller_until_connect() {
    let (mut machine, _clock) = machine_with_clock();
    machine
        .handle(ConnectionEvent::Connect {
            room: RoomKey::new("lobby"),
        })
        .unwrap();

    let mut last = None;
    for _ in 0..=5 {
        let transition = machine
            .handle(ConnectionEvent::ConnectFailed {
                reason: "timeout".to_string(),
            })
            .unwrap();
        last = Some(transition.effects.clone());
        if machine.state().state_name() == "Reconnecting" {
            machine.handle(ConnectionEvent::ReconnectDue).unwrap();
        }
    }

    assert_eq!(machine.state().state_name(), "FailedPermanently");
    assert!(last.unwrap().contains(&Effect::ActivatePoller));

    // Heartbeat and late socket events are ignored in this state
    assert!(machine.handle(ConnectionEvent::HeartbeatTimedOut).is_err());
    assert!(machine.handle(ConnectionEvent::Opened).is_err());

    let transition = machine
        .handle(ConnectionEvent::Connect {
            room: RoomKey::new("lobby"),
        })
        .unwrap();
    assert_eq!(machine.policy().attempt(), 0);
    assert_eq!(
        transition.effects,
        vec![Effect::OpenSocket {
            room: RoomKey::new("lobby"),
            attempt: 0
        }]
    );
    let opened = machine.handle(ConnectionEvent::Opened).unwrap();
    assert!(opened.effects.contains(&Effect::DeactivatePoller));
}

#[test]
fn normal_close_from_connecting_disconnects() {
    let (mut machine, _clock) = machine_with_clock();
    machine
        .handle(ConnectionEvent::Connect {
            room: RoomKey::new("lobby"),
        })
        .unwrap();

    let transition = machine
        .handle(ConnectionEvent::Closed {
            code: NORMAL_CLOSE,
            reason: "server shutdown".to_string(),
        })
        .unwrap();
    assert!(matches!(
        transition.new_state,
        ConnectionState::Disconnected(ref s) if s.reason == DisconnectReason::NormalClose
    ));
    assert!(machine.state().accepts_connect());
}

#[test]
fn audit_entries_record_mock_time() {
    let (mut machine, clock) = machine_with_clock();
    machine
        .handle(ConnectionEvent::Connect {
            room: RoomKey::new("lobby"),
        })
        .unwrap();
    clock.advance(250);
    machine.handle(ConnectionEvent::Opened).unwrap();

    let entries = machine.recent_audit_entries(10);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].to_state, "Connecting");
    assert_eq!(entries[1].timestamp.as_millis(), 1_000_250);
    assert_eq!(entries[1].effects_count, 4);
}

#[test]
fn failed_connect_after_normal_close_stops_polling() {
    let (mut machine, _clock) = machine_with_clock();
    machine
        .handle(ConnectionEvent::Connect {
            room: RoomKey::new("lobby"),
        })
        .unwrap();
    machine.handle(ConnectionEvent::Opened).unwrap();
    let closed = machine
        .handle(ConnectionEvent::Closed {
            code: NORMAL_CLOSE,
            reason: "bye".to_string(),
        })
        .unwrap();
    assert!(closed.effects.contains(&Effect::ActivatePoller));

    // The poller keeps running while the new connect is in flight
    let connecting = machine
        .handle(ConnectionEvent::Connect {
            room: RoomKey::new("lobby"),
        })
        .unwrap();
    assert!(!connecting.effects.contains(&Effect::DeactivatePoller));

    let transition = machine
        .handle(ConnectionEvent::ConnectFailed {
            reason: "refused".to_string(),
        })
        .unwrap();
    assert_eq!(transition.new_state.state_name(), "Reconnecting");
    assert!(transition.effects.contains(&Effect::DeactivatePoller));
    assert!(!transition.effects.contains(&Effect::ActivatePoller));
    assert_eq!(scheduled_delay(&transition.effects), Some(1_000));
}
