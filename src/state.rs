//! The authoritative device model. All readings, policy decisions and remote
//! commands funnel into [`StateAggregator`], which owns the only copy of the
//! device state and is only ever touched from the control loop.
//!
//! Priority is fixed: safety > remote command > local access policy. A remote
//! command overwrites whatever the local policy decided this cycle, but no
//! remote command can touch an active intrusion alarm.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::bus::{BusEvent, CommandMessage, LedId, ReadingKind, SensorReading};
use crate::config::DoorAngles;
use crate::mqtt::RemoteCommand;
use crate::policy::{AccessControlPolicy, AlarmIntent, DoorIntent, LedIntent, SafetyPolicy};

/// Current device state as owned by the aggregator.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub motion: bool,
    pub last_motion: Option<Instant>,
    pub led_pir: bool,
    pub led_button: bool,
    pub temperature: f32,
    pub humidity: f32,
    /// Last-known range; `None` until the first reading so a missing sensor
    /// can never fake an intrusion.
    pub distance: Option<f32>,
    pub current_angle: u8,
    pub target_angle: u8,
    /// The current open state was caused by an accepted card.
    pub opened_by_card: bool,
    /// Whether the most recent card scan was allow-listed.
    pub rfid_accepted: bool,
    pub alarm: bool,
    pub armed: bool,
}

/// Telemetry snapshot. Field names are the remote server's wire contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub pir: bool,
    pub led1: bool,
    pub led2: bool,
    pub temperature: f32,
    pub humidity: f32,
    pub door: bool,
    pub auto_open: bool,
    pub rfid: bool,
    pub distance: f32,
    pub security_mode: bool,
    pub intruder: bool,
}

/// Raw input levels from the last reports, kept to turn momentary-button
/// levels into press edges.
#[derive(Debug, Default)]
struct Inputs {
    toggle_level: bool,
    open_level: bool,
    close_level: bool,
    toggle_edge: bool,
    open_edge: bool,
    close_edge: bool,
    card: Option<[u8; 4]>,
}

/// What has been handed to the bus task, to avoid re-sending a command every
/// cycle while it is still in flight. Cleared again on `CommandFailed`.
#[derive(Debug, Default)]
struct Dispatched {
    angle: Option<u8>,
    led_pir: Option<bool>,
    led_button: Option<bool>,
}

pub struct StateAggregator {
    access: AccessControlPolicy,
    safety: SafetyPolicy,
    angles: DoorAngles,
    state: DeviceState,
    inputs: Inputs,
    dispatched: Dispatched,
}

impl StateAggregator {
    /// Safe defaults: door closed, LEDs off, no alarm, disarmed.
    pub fn new(access: AccessControlPolicy, safety: SafetyPolicy, angles: DoorAngles) -> Self {
        Self {
            access,
            safety,
            angles,
            state: DeviceState {
                motion: false,
                last_motion: None,
                led_pir: false,
                led_button: false,
                temperature: 0.0,
                humidity: 0.0,
                distance: None,
                current_angle: angles.closed,
                target_angle: angles.closed,
                opened_by_card: false,
                rfid_accepted: false,
                alarm: false,
                armed: false,
            },
            inputs: Inputs::default(),
            dispatched: Dispatched::default(),
        }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// One aggregation step for a bus event. Returns the commands that must
    /// go out to bring the boards in line with the new state.
    pub fn apply_event(&mut self, event: BusEvent, now: Instant) -> Vec<CommandMessage> {
        match event {
            BusEvent::Readings(readings) => {
                for reading in readings {
                    self.apply_reading(reading);
                }
                self.run_policies(now);
                self.emit()
            }
            BusEvent::CommandDone(cmd) => {
                if let CommandMessage::SetServoAngle(angle) = cmd {
                    self.state.current_angle = angle;
                }
                // the target may have moved while this command was in flight
                self.emit()
            }
            BusEvent::CommandFailed(cmd) => {
                // forget the dispatch so the next cycle re-emits it
                match cmd {
                    CommandMessage::SetServoAngle(a) => {
                        if self.dispatched.angle == Some(a) {
                            self.dispatched.angle = None;
                        }
                    }
                    CommandMessage::SetLed(LedId::Pir, on) => {
                        if self.dispatched.led_pir == Some(on) {
                            self.dispatched.led_pir = None;
                        }
                    }
                    CommandMessage::SetLed(LedId::Button, on) => {
                        if self.dispatched.led_button == Some(on) {
                            self.dispatched.led_button = None;
                        }
                    }
                }
                Vec::new()
            }
            // Stale readings are held as last-known-good; nothing to do here.
            BusEvent::Unreachable(_) => Vec::new(),
        }
    }

    /// Apply a remote command. Runs after whatever the local policies decided
    /// this cycle, so the remote side wins on shared fields. The intrusion
    /// alarm is not a shared field: no remote command writes it.
    pub fn apply_remote(&mut self, cmd: RemoteCommand) -> Vec<CommandMessage> {
        match cmd {
            RemoteCommand::Door(open) => {
                self.state.target_angle = if open {
                    self.angles.open
                } else {
                    self.angles.closed
                };
                self.state.opened_by_card = false;
            }
            RemoteCommand::LedButton(on) => {
                self.state.led_button = on;
            }
            RemoteCommand::SecurityMode(on) => {
                self.state.armed = on;
                if !on && self.state.alarm {
                    warn!("Disarmed while alarm active; alarm stays raised until cleared");
                }
            }
        }
        self.emit()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            pir: self.state.motion,
            led1: self.state.led_pir,
            led2: self.state.led_button,
            temperature: self.state.temperature,
            humidity: self.state.humidity,
            door: self.state.current_angle == self.angles.open,
            auto_open: self.state.opened_by_card,
            rfid: self.state.rfid_accepted,
            distance: self.state.distance.unwrap_or(0.0),
            security_mode: self.state.armed,
            intruder: self.state.alarm,
        }
    }

    fn apply_reading(&mut self, reading: SensorReading) {
        match reading.kind {
            ReadingKind::Motion(motion) => {
                self.state.motion = motion;
                if motion {
                    self.state.last_motion = Some(reading.at);
                }
            }
            ReadingKind::Temperature(t) => self.state.temperature = t,
            ReadingKind::Humidity(h) => self.state.humidity = h,
            ReadingKind::Distance(d) => self.state.distance = Some(d),
            ReadingKind::ToggleButton(level) => {
                self.inputs.toggle_edge |= level && !self.inputs.toggle_level;
                self.inputs.toggle_level = level;
            }
            ReadingKind::DoorButtons { open, close } => {
                self.inputs.open_edge |= open && !self.inputs.open_level;
                self.inputs.close_edge |= close && !self.inputs.close_level;
                self.inputs.open_level = open;
                self.inputs.close_level = close;
            }
            ReadingKind::Card(uid) => self.inputs.card = Some(uid),
        }
    }

    fn run_policies(&mut self, now: Instant) {
        let open_edge = std::mem::take(&mut self.inputs.open_edge);
        let close_edge = std::mem::take(&mut self.inputs.close_edge);
        let toggle_edge = std::mem::take(&mut self.inputs.toggle_edge);
        let card = self.inputs.card.take();

        if let Some(uid) = &card {
            self.state.rfid_accepted = self.access.is_allowed(uid);
        }

        let door_open = self.state.target_angle == self.angles.open;
        match self.access.evaluate(open_edge, close_edge, card, door_open) {
            DoorIntent::Open => {
                let by_card = !open_edge && card.is_some();
                self.state.target_angle = self.angles.open;
                self.state.opened_by_card = by_card;
            }
            DoorIntent::Close => {
                self.state.target_angle = self.angles.closed;
                self.state.opened_by_card = false;
            }
            DoorIntent::NoChange => {}
        }

        if toggle_edge {
            self.state.led_button = !self.state.led_button;
        }

        self.state.led_pir = matches!(
            self.safety
                .evaluate_motion(self.state.motion, now, self.state.last_motion),
            LedIntent::On
        );

        if let Some(distance) = self.state.distance {
            match self.safety.evaluate_intrusion(distance) {
                AlarmIntent::Raise => {
                    if self.state.armed && !self.state.alarm {
                        warn!("Intrusion alarm raised at {} cm", distance);
                        self.state.alarm = true;
                    }
                }
                AlarmIntent::Clear => {
                    if self.state.alarm {
                        info!("Intrusion alarm cleared");
                    }
                    self.state.alarm = false;
                }
            }
        }
    }

    /// Diff desired state against what has already been dispatched.
    fn emit(&mut self) -> Vec<CommandMessage> {
        let mut cmds = Vec::new();

        if self.state.target_angle != self.state.current_angle
            && self.dispatched.angle != Some(self.state.target_angle)
        {
            self.dispatched.angle = Some(self.state.target_angle);
            cmds.push(CommandMessage::SetServoAngle(self.state.target_angle));
        }
        if self.dispatched.led_pir != Some(self.state.led_pir) {
            self.dispatched.led_pir = Some(self.state.led_pir);
            cmds.push(CommandMessage::SetLed(LedId::Pir, self.state.led_pir));
        }
        if self.dispatched.led_button != Some(self.state.led_button) {
            self.dispatched.led_button = Some(self.state.led_button);
            cmds.push(CommandMessage::SetLed(LedId::Button, self.state.led_button));
        }
        cmds
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::bus::DeviceAddress;

    const VALID: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];
    const ANGLES: DoorAngles = DoorAngles { closed: 0, open: 90 };

    fn aggregator() -> StateAggregator {
        StateAggregator::new(
            AccessControlPolicy::new(HashSet::from([VALID])),
            SafetyPolicy::new(Duration::from_millis(7000), 50.0),
            ANGLES,
        )
    }

    fn door_readings(kinds: Vec<ReadingKind>, at: Instant) -> BusEvent {
        BusEvent::Readings(
            kinds
                .into_iter()
                .map(|kind| SensorReading {
                    source: DeviceAddress::DoorBoard,
                    kind,
                    at,
                })
                .collect(),
        )
    }

    fn sensor_readings(kinds: Vec<ReadingKind>, at: Instant) -> BusEvent {
        BusEvent::Readings(
            kinds
                .into_iter()
                .map(|kind| SensorReading {
                    source: DeviceAddress::SensorBoard,
                    kind,
                    at,
                })
                .collect(),
        )
    }

    #[test]
    fn open_button_drives_door_from_0_to_90() {
        let mut agg = aggregator();
        let now = Instant::now();

        let cmds = agg.apply_event(
            door_readings(
                vec![ReadingKind::DoorButtons { open: true, close: false }],
                now,
            ),
            now,
        );

        assert!(cmds.contains(&CommandMessage::SetServoAngle(90)));
        assert_eq!(agg.state().target_angle, 90);
        assert_eq!(agg.state().current_angle, 0);

        agg.apply_event(BusEvent::CommandDone(CommandMessage::SetServoAngle(90)), now);
        assert_eq!(agg.state().current_angle, 90);
        assert!(agg.snapshot().door);
    }

    #[test]
    fn held_button_is_a_single_press() {
        let mut agg = aggregator();
        let now = Instant::now();
        let held = vec![ReadingKind::DoorButtons { open: true, close: false }];

        agg.apply_event(door_readings(held.clone(), now), now);
        agg.apply_event(BusEvent::CommandDone(CommandMessage::SetServoAngle(90)), now);

        // still held on the next poll: no new servo command
        let cmds = agg.apply_event(door_readings(held, now), now);
        assert!(!cmds.iter().any(|c| matches!(c, CommandMessage::SetServoAngle(_))));
        assert_eq!(agg.state().target_angle, 90);
    }

    #[test]
    fn accepted_card_toggles_the_door() {
        let mut agg = aggregator();
        let now = Instant::now();

        agg.apply_event(door_readings(vec![ReadingKind::Card(VALID)], now), now);
        assert_eq!(agg.state().target_angle, 90);
        assert!(agg.state().opened_by_card);
        assert!(agg.snapshot().auto_open);
        agg.apply_event(BusEvent::CommandDone(CommandMessage::SetServoAngle(90)), now);

        agg.apply_event(door_readings(vec![ReadingKind::Card(VALID)], now), now);
        assert_eq!(agg.state().target_angle, 0);
        assert!(!agg.state().opened_by_card);
    }

    #[test]
    fn denied_card_changes_nothing() {
        let mut agg = aggregator();
        let now = Instant::now();

        agg.apply_event(
            door_readings(vec![ReadingKind::Card([1, 2, 3, 4])], now),
            now,
        );
        assert_eq!(agg.state().target_angle, 0);
        assert!(!agg.state().rfid_accepted);
        assert!(!agg.snapshot().rfid);
    }

    #[test]
    fn remote_command_overrides_local_intent_in_the_same_cycle() {
        let mut agg = aggregator();
        let now = Instant::now();

        agg.apply_event(
            door_readings(
                vec![ReadingKind::DoorButtons { open: true, close: false }],
                now,
            ),
            now,
        );
        assert_eq!(agg.state().target_angle, 90);

        agg.apply_remote(RemoteCommand::Door(false));
        assert_eq!(agg.state().target_angle, 0);
    }

    #[test]
    fn alarm_survives_any_sequence_of_remote_commands() {
        let mut agg = aggregator();
        let now = Instant::now();

        agg.apply_remote(RemoteCommand::SecurityMode(true));
        agg.apply_event(door_readings(vec![ReadingKind::Distance(30.0)], now), now);
        assert!(agg.state().alarm);

        for cmd in [
            RemoteCommand::Door(true),
            RemoteCommand::Door(false),
            RemoteCommand::LedButton(true),
            RemoteCommand::SecurityMode(false),
            RemoteCommand::SecurityMode(true),
        ] {
            agg.apply_remote(cmd);
            assert!(agg.state().alarm, "alarm lost after {cmd:?}");
        }

        // only the safety policy itself clears it
        agg.apply_event(door_readings(vec![ReadingKind::Distance(80.0)], now), now);
        assert!(!agg.state().alarm);
    }

    #[test]
    fn disarmed_system_never_raises() {
        let mut agg = aggregator();
        let now = Instant::now();

        agg.apply_event(door_readings(vec![ReadingKind::Distance(30.0)], now), now);
        assert!(!agg.state().alarm);
        assert!(!agg.snapshot().intruder);
    }

    #[test]
    fn intrusion_raise_and_clear_scenario() {
        let mut agg = aggregator();
        let now = Instant::now();
        agg.apply_remote(RemoteCommand::SecurityMode(true));

        agg.apply_event(door_readings(vec![ReadingKind::Distance(30.0)], now), now);
        assert!(agg.snapshot().intruder);

        agg.apply_event(door_readings(vec![ReadingKind::Distance(80.0)], now), now);
        assert!(!agg.snapshot().intruder);
    }

    #[test]
    fn motion_led_is_instant_on_debounced_off() {
        let mut agg = aggregator();
        let t0 = Instant::now();

        let cmds = agg.apply_event(sensor_readings(vec![ReadingKind::Motion(true)], t0), t0);
        assert!(agg.state().led_pir);
        assert!(cmds.contains(&CommandMessage::SetLed(LedId::Pir, true)));

        // gone quiet, but inside the timeout window
        let t1 = t0 + Duration::from_millis(5000);
        agg.apply_event(sensor_readings(vec![ReadingKind::Motion(false)], t1), t1);
        assert!(agg.state().led_pir);

        let t2 = t0 + Duration::from_millis(8000);
        let cmds = agg.apply_event(sensor_readings(vec![ReadingKind::Motion(false)], t2), t2);
        assert!(!agg.state().led_pir);
        assert!(cmds.contains(&CommandMessage::SetLed(LedId::Pir, false)));
    }

    #[test]
    fn toggle_button_flips_the_button_led() {
        let mut agg = aggregator();
        let now = Instant::now();

        agg.apply_event(sensor_readings(vec![ReadingKind::ToggleButton(true)], now), now);
        assert!(agg.state().led_button);

        agg.apply_event(sensor_readings(vec![ReadingKind::ToggleButton(false)], now), now);
        assert!(agg.state().led_button);

        agg.apply_event(sensor_readings(vec![ReadingKind::ToggleButton(true)], now), now);
        assert!(!agg.state().led_button);
    }

    #[test]
    fn unreachable_board_keeps_last_known_readings() {
        let mut agg = aggregator();
        let now = Instant::now();

        agg.apply_event(
            sensor_readings(
                vec![ReadingKind::Temperature(22.5), ReadingKind::Humidity(58.0)],
                now,
            ),
            now,
        );
        agg.apply_event(door_readings(vec![ReadingKind::Distance(120.0)], now), now);

        agg.apply_event(BusEvent::Unreachable(DeviceAddress::SensorBoard), now);
        agg.apply_event(BusEvent::Unreachable(DeviceAddress::DoorBoard), now);

        let snap = agg.snapshot();
        assert_eq!(snap.temperature, 22.5);
        assert_eq!(snap.humidity, 58.0);
        assert_eq!(snap.distance, 120.0);
    }

    #[test]
    fn command_completion_reconciles_a_target_flipped_in_flight() {
        let mut agg = aggregator();
        let now = Instant::now();

        // local open: servo 90 goes out
        let cmds = agg.apply_event(
            door_readings(
                vec![ReadingKind::DoorButtons { open: true, close: false }],
                now,
            ),
            now,
        );
        assert!(cmds.contains(&CommandMessage::SetServoAngle(90)));

        // remote close arrives while that command is still in flight
        agg.apply_remote(RemoteCommand::Door(false));
        assert_eq!(agg.state().target_angle, 0);

        // completion of the stale command immediately emits the correction
        let cmds = agg.apply_event(BusEvent::CommandDone(CommandMessage::SetServoAngle(90)), now);
        assert_eq!(agg.state().current_angle, 90);
        assert!(cmds.contains(&CommandMessage::SetServoAngle(0)));
    }

    #[test]
    fn failed_command_is_re_emitted_next_cycle() {
        let mut agg = aggregator();
        let now = Instant::now();

        let cmds = agg.apply_event(
            door_readings(
                vec![ReadingKind::DoorButtons { open: true, close: false }],
                now,
            ),
            now,
        );
        assert!(cmds.contains(&CommandMessage::SetServoAngle(90)));

        agg.apply_event(BusEvent::CommandFailed(CommandMessage::SetServoAngle(90)), now);

        let cmds = agg.apply_event(door_readings(vec![], now), now);
        assert!(cmds.contains(&CommandMessage::SetServoAngle(90)));
    }

    #[test]
    fn snapshot_uses_the_server_field_names() {
        let agg = aggregator();
        let value = serde_json::to_value(agg.snapshot()).unwrap();
        let obj = value.as_object().unwrap();

        for key in [
            "pir", "led1", "led2", "temperature", "humidity", "door", "autoOpen", "rfid",
            "distance", "securityMode", "intruder",
        ] {
            assert!(obj.contains_key(key), "missing field {key}");
        }
    }
}
