//! Reconciler and device-handle tests driven by the simulated controller

use astrolink_core::prelude::*;
use astrolink_core::protocol::CommunicationChannel;
use astrolink_core::settings::FocuserMode;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("astrolink_core=trace")
        .with_test_writer()
        .try_init();
}

fn device_over(sim: &SharedSimulator) -> AstroLink {
    let config = ConnectionConfig {
        timeout_ms: 40,
        ..Default::default()
    };
    let mut device = AstroLink::over(sim.channel(), config);
    device.connect().unwrap();
    device
}

fn events(result: PollResult) -> Vec<ChangeEvent> {
    match result {
        PollResult::Updated(events) => events,
        PollResult::Unavailable => panic!("poll reported unavailable"),
    }
}

fn move_completions(events: &[ChangeEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, ChangeEvent::MoveComplete { .. }))
        .count()
}

#[test]
fn test_first_poll_populates_state_and_syncs_settings() {
    init_tracing();
    let sim = SharedSimulator::new(SimulatedAstroLink::quiescent());
    let mut device = device_over(&sim);

    let events = events(device.poll());
    assert!(!events.is_empty());

    let state = device.state();
    assert_eq!(state.value(TelemetryField::StepperPosition), Some(1234.0));
    assert_eq!(state.value(TelemetryField::Current), Some(1.47));
    assert_eq!(state.value(TelemetryField::Out3), Some(1.0));
    assert_eq!(state.status(Subsystem::Focuser), SubsystemStatus::Ok);
    assert_eq!(state.status(Subsystem::Sensors), SubsystemStatus::Ok);
    assert_eq!(state.status(Subsystem::Protection), SubsystemStatus::Ok);
    assert!(state.last_poll().is_some());

    let frame = state.telemetry().expect("telemetry snapshot");
    let sensor1 = frame
        .extended
        .as_ref()
        .and_then(|e| e.sensor1)
        .expect("sensor 1 present");
    assert_eq!(sensor1.temperature, 2.12);

    // settings groups pulled and decoded on the same cycle
    let focuser = state.focuser_settings().expect("focuser settings synced");
    assert_eq!(focuser.max_position, 10000.0);
    assert_eq!(focuser.speed, 250.0);
    assert_eq!(focuser.compensation, 1.25);
    assert_eq!(state.focuser_mode(), Some(FocuserMode::Bipolar));
    assert_eq!(
        state.power_defaults().map(|p| p.outputs),
        Some([false, true, false])
    );
    let other = state.other_settings().expect("other settings synced");
    assert!(other.buzzer);
    assert!(!other.auto_compensation);
    assert_eq!(other.compensation_threshold, 0.5);

    let synced = events
        .iter()
        .filter(|e| matches!(e, ChangeEvent::SettingsSynced { .. }))
        .count();
    assert_eq!(synced, 4);
}

#[test]
fn test_identical_polls_emit_no_events() {
    let sim = SharedSimulator::new(SimulatedAstroLink::quiescent());
    let mut device = device_over(&sim);

    let first = events(device.poll());
    assert!(!first.is_empty());
    let second = events(device.poll());
    assert_eq!(second, vec![]);
}

#[test]
fn test_settings_records_are_not_repolled_once_in_sync() {
    let sim = SharedSimulator::new(SimulatedAstroLink::quiescent());
    let mut device = device_over(&sim);

    device.poll();
    device.poll();
    device.poll();

    sim.with(|sim| {
        assert_eq!(sim.commands_with_prefix("q"), 3);
        assert_eq!(sim.commands_with_prefix("u"), 1);
        assert_eq!(sim.commands_with_prefix("n"), 1);
    });
}

#[test]
fn test_move_reports_busy_then_exactly_one_completion() {
    init_tracing();
    let sim = SharedSimulator::new(SimulatedAstroLink::quiescent());
    let mut device = device_over(&sim);
    device.poll();

    device.move_focuser(2034).unwrap();
    assert_eq!(
        device.state().status(Subsystem::Focuser),
        SubsystemStatus::Busy
    );

    // short busy record while the motor runs
    let first = events(device.poll());
    assert_eq!(move_completions(&first), 0);
    assert_eq!(
        device.state().status(Subsystem::Focuser),
        SubsystemStatus::Busy
    );
    assert_eq!(
        device.state().value(TelemetryField::StepperPosition),
        Some(1634.0)
    );

    // target reached: exactly one completion on the transition
    let second = events(device.poll());
    assert_eq!(move_completions(&second), 1);
    assert!(second.iter().any(|e| matches!(
        e,
        ChangeEvent::MoveComplete {
            subsystem: Subsystem::Focuser,
            position: Some(p)
        } if *p == 2034.0
    )));
    assert_eq!(
        device.state().status(Subsystem::Focuser),
        SubsystemStatus::Ok
    );

    // and never again on later idle polls
    let third = events(device.poll());
    assert_eq!(move_completions(&third), 0);
}

#[test]
fn test_dc_pulse_completion_event() {
    let sim = SharedSimulator::new(SimulatedAstroLink::quiescent());
    let mut device = device_over(&sim);
    device.poll();

    device.dc_pulse(80, 250, true).unwrap();
    assert_eq!(
        device.state().status(Subsystem::DcFocuser),
        SubsystemStatus::Busy
    );

    let first = events(device.poll());
    assert_eq!(move_completions(&first), 0);
    let second = events(device.poll());
    assert!(second.iter().any(|e| matches!(
        e,
        ChangeEvent::MoveComplete {
            subsystem: Subsystem::DcFocuser,
            position: None
        }
    )));
}

#[test]
fn test_apply_invalidates_the_group_and_resyncs() {
    let sim = SharedSimulator::new(SimulatedAstroLink::quiescent());
    let mut device = device_over(&sim);
    device.poll();

    device.apply(Setting::FocuserMaxPosition, 9000.0).unwrap();
    let events = events(device.poll());

    assert!(events
        .iter()
        .any(|e| matches!(e, ChangeEvent::SettingsSynced { group: SettingsGroup::Focuser })));
    assert_eq!(
        device.state().focuser_settings().map(|f| f.max_position),
        Some(9000.0)
    );
    // one initial sync, one read inside the patch, one resync after apply
    sim.with(|sim| assert_eq!(sim.commands_with_prefix("u"), 3));
}

#[test]
fn test_failed_poll_reports_unavailable_and_leaves_state_untouched() {
    let sim = SharedSimulator::new(SimulatedAstroLink::quiescent());
    let mut device = device_over(&sim);

    sim.with(|sim| sim.swallow_next(2));
    assert_eq!(device.poll(), PollResult::Unavailable);

    let state = device.state();
    assert_eq!(state.value(TelemetryField::StepperPosition), None);
    assert!(state.last_poll().is_none());
}

/// Channel answering each command with a fixed queue of canned lines
struct CannedChannel {
    replies: VecDeque<Option<&'static str>>,
    queue: VecDeque<u8>,
}

impl CannedChannel {
    fn new(replies: Vec<Option<&'static str>>) -> Self {
        Self {
            replies: replies.into_iter().collect(),
            queue: VecDeque::new(),
        }
    }
}

impl Read for CannedChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.queue.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"));
        }
        Ok(n)
    }
}

impl Write for CannedChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if byte == b'\n' {
                if let Some(Some(reply)) = self.replies.pop_front() {
                    self.queue.extend(reply.as_bytes());
                    self.queue.push_back(b'\n');
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for CannedChannel {
    fn set_timeout(&mut self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.queue.clear();
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.queue.len() as u32)
    }
}

const SCENARIO: &str =
    "q:1234:0:1.47:1:2.12:45.1:-12.81:0:0:45:0:0:0:1:12.1:5.0:1.12:13.41:0:34:0:0";

#[test]
fn test_reference_record_reconciles_to_documented_values() {
    // settings fetches stay unanswered: their groups degrade to Alert while
    // the telemetry sub-states update normally
    let channel = CannedChannel::new(vec![Some(SCENARIO), None, None, None, None]);
    let config = ConnectionConfig {
        timeout_ms: 40,
        ..Default::default()
    };
    let mut conn = Connection::over(Box::new(channel), config);
    let mut reconciler = Reconciler::new();

    let result = reconciler.poll(&mut conn);
    assert!(matches!(result, PollResult::Updated(_)));

    let state = reconciler.state();
    assert_eq!(state.value(TelemetryField::StepperPosition), Some(1234.0));
    assert_eq!(state.value(TelemetryField::StepsToGo), Some(0.0));
    assert_eq!(state.status(Subsystem::Focuser), SubsystemStatus::Ok);
    assert_eq!(state.value(TelemetryField::Current), Some(1.47));
    assert_eq!(state.value(TelemetryField::Sensor1Present), Some(1.0));
    assert_eq!(state.value(TelemetryField::Sensor1Temp), Some(2.12));
    assert_eq!(state.value(TelemetryField::Sensor1Humidity), Some(45.1));
    assert_eq!(state.value(TelemetryField::Sensor1Dewpoint), Some(-12.81));
    assert_eq!(state.value(TelemetryField::PwmA), Some(45.0));
    assert_eq!(state.value(TelemetryField::Out3), Some(1.0));
    assert_eq!(state.value(TelemetryField::Vin), Some(12.1));
    assert_eq!(state.value(TelemetryField::Vreg), Some(5.0));
    assert_eq!(state.value(TelemetryField::AmpHours), Some(1.12));
    assert_eq!(state.value(TelemetryField::WattHours), Some(13.41));
    assert_eq!(state.status(Subsystem::FocuserSettings), SubsystemStatus::Alert);
    assert_eq!(state.status(Subsystem::OtherSettings), SubsystemStatus::Alert);
}

#[test]
fn test_protection_trip_degrades_only_that_subsystem() {
    let tripped: &'static str =
        "q:1234:0:1.47:1:2.12:45.1:-12.81:0:0:45:0:0:0:1:12.1:5.0:1.12:13.41:0:34:1:6.5";
    let channel = CannedChannel::new(vec![Some(tripped), None, None, None, None]);
    let config = ConnectionConfig {
        timeout_ms: 40,
        ..Default::default()
    };
    let mut conn = Connection::over(Box::new(channel), config);
    let mut reconciler = Reconciler::new();

    reconciler.poll(&mut conn);
    let state = reconciler.state();
    assert_eq!(state.status(Subsystem::Protection), SubsystemStatus::Alert);
    assert_eq!(state.value(TelemetryField::ProtectionTripped), Some(1.0));
    assert_eq!(state.value(TelemetryField::ProtectionValue), Some(6.5));
    // the rest of the device keeps updating normally
    assert_eq!(state.status(Subsystem::Power), SubsystemStatus::Ok);
    assert_eq!(state.status(Subsystem::Focuser), SubsystemStatus::Ok);
}

#[test]
fn test_events_and_state_serialize() {
    let sim = SharedSimulator::new(SimulatedAstroLink::quiescent());
    let mut device = device_over(&sim);

    let events = events(device.poll());
    let json = serde_json::to_string(&events).unwrap();
    assert!(json.contains("StepperPosition"));

    let state_json = serde_json::to_string(device.state()).unwrap();
    assert!(state_json.contains("telemetry"));
}
