//! Per-device input handling
//!
//! Every physical device gets one input task. Batches from all of the
//! device's event sub-devices arrive here in the order they were read and
//! go through the device's [`InputMapper`]. The task then:
//!
//! - forwards unmatched events to the shared emitter
//! - synthesizes key sequences and clicks for matched sequences
//! - publishes semantic actions as [`CoreEvent::Action`]
//! - sends device commands (vibrate, pointer speed) over HID++
//!
//! It also derives the "spot active" state from relative motion.

use std::sync::Arc;
use std::time::Duration;

use evdev::{EventType, InputEvent, RelativeAxisType};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::action_executor::ActionExecutor;
use crate::device::DeviceIdentity;
use crate::events::{publish, CoreEvent, EventSender, SemanticAction};
use crate::hidpp::HidppDevice;
use crate::input_mapper::{InputMapper, MappedAction, MapperOutput, Mapping};

/// Messages accepted by an input task
#[derive(Debug)]
pub enum InputCommand {
    /// One SYN-terminated batch read from an event sub-device
    Events(Vec<InputEvent>),
    /// New mappings; matching restarts from scratch
    Reconfigure(InputSettings),
    /// HID++ device to send device commands to
    AttachProtocol(HidppDevice),
    DetachProtocol,
}

/// Mapping configuration shared by all input tasks
#[derive(Debug, Clone)]
pub struct InputSettings {
    pub mappings: Arc<[Mapping]>,
    pub sequence_interval: Duration,
    pub spot_timeout: Duration,
}

// ============================================================================
// Spot activity
// ============================================================================

/// Tracks whether the device is currently moving the pointer
#[derive(Debug)]
pub struct SpotTracker {
    timeout: Duration,
    deadline: Option<Instant>,
}

impl SpotTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Note a batch; returns true if the spot just became active
    pub fn observe(&mut self, batch: &[InputEvent], now: Instant) -> bool {
        if !batch.iter().any(is_pointer_motion) {
            return false;
        }
        let activated = !self.is_active();
        self.deadline = Some(now + self.timeout);
        activated
    }

    /// Returns true if the spot just became inactive
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

fn is_pointer_motion(event: &InputEvent) -> bool {
    event.event_type() == EventType::RELATIVE
        && (event.code() == RelativeAxisType::REL_X.0 || event.code() == RelativeAxisType::REL_Y.0)
}

// ============================================================================
// Dispatch
// ============================================================================

/// Mapped actions carried out by the device itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceCommand {
    Vibrate { length: u8, intensity: u8 },
    PointerSpeed(u8),
}

struct Dispatcher {
    identity: DeviceIdentity,
    executor: Option<ActionExecutor>,
    events: EventSender,
    protocol: Option<HidppDevice>,
}

impl Dispatcher {
    async fn dispatch(&self, outputs: Vec<MapperOutput>) {
        for output in outputs {
            match output {
                MapperOutput::Forward(events) => self.forward(&events).await,
                MapperOutput::Action(action) => self.run_action(action).await,
            }
        }
    }

    async fn forward(&self, events: &[InputEvent]) {
        let Some(executor) = &self.executor else {
            return;
        };
        if let Err(e) = executor.forward(events).await {
            tracing::warn!(device = %self.identity, error = %e, "Failed to forward events");
        }
    }

    async fn run_action(&self, action: MappedAction) {
        match action {
            MappedAction::ToggleSpotlight => self.semantic(SemanticAction::ToggleSpotlight),
            MappedAction::CyclePresets => self.semantic(SemanticAction::CyclePresets),
            MappedAction::Vibrate { length, intensity } => {
                self.device_command(DeviceCommand::Vibrate { length, intensity })
            }
            MappedAction::PointerSpeed(speed) => {
                self.device_command(DeviceCommand::PointerSpeed(speed))
            }
            MappedAction::KeySequence(_) | MappedAction::LeftClick => {
                let Some(executor) = &self.executor else {
                    tracing::debug!(?action, "No virtual device, dropping mapped action");
                    return;
                };
                if let Err(e) = executor.emit_mapped_action(&action).await {
                    tracing::warn!(device = %self.identity, error = %e, "Failed to emit mapped action");
                }
            }
        }
    }

    fn semantic(&self, action: SemanticAction) {
        tracing::debug!(device = %self.identity, ?action, "Publishing action");
        publish(
            &self.events,
            CoreEvent::Action {
                identity: self.identity.clone(),
                action,
            },
        );
    }

    /// Run a HID++ command without holding up input processing
    fn device_command(&self, command: DeviceCommand) {
        let Some(device) = self.protocol.clone() else {
            tracing::warn!(device = %self.identity, ?command, "Device has no HID++ connection");
            return;
        };
        let identity = self.identity.clone();
        tokio::spawn(async move {
            let result = match command {
                DeviceCommand::Vibrate { length, intensity } => {
                    device.vibrate(length, intensity).await
                }
                DeviceCommand::PointerSpeed(speed) => device.set_pointer_speed(speed).await,
            };
            match result {
                Ok(()) => tracing::debug!(device = %identity, ?command, "Device command done"),
                Err(e) => {
                    tracing::warn!(device = %identity, ?command, error = %e, "Device command failed")
                }
            }
        });
    }
}

// ============================================================================
// Task
// ============================================================================

/// Spawn the input task of one device
///
/// The task stops once every sender of the returned channel is gone.
pub fn spawn_input_task(
    identity: DeviceIdentity,
    settings: InputSettings,
    executor: Option<ActionExecutor>,
    events: EventSender,
) -> (mpsc::UnboundedSender<InputCommand>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_input_task(identity, settings, executor, events, rx));
    (tx, task)
}

async fn run_input_task(
    identity: DeviceIdentity,
    settings: InputSettings,
    executor: Option<ActionExecutor>,
    events: EventSender,
    mut commands: mpsc::UnboundedReceiver<InputCommand>,
) {
    let mut mapper = InputMapper::new(&settings.mappings, settings.sequence_interval);
    let mut spot = SpotTracker::new(settings.spot_timeout);
    let mut dispatcher = Dispatcher {
        identity,
        executor,
        events,
        protocol: None,
    };

    loop {
        let mapper_deadline = mapper.deadline();
        let spot_deadline = spot.deadline();

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    InputCommand::Events(batch) => {
                        let now = Instant::now();
                        if spot.observe(&batch, now) {
                            dispatcher.spot_changed(true);
                        }
                        let outputs = mapper.feed(batch, now);
                        dispatcher.dispatch(outputs).await;
                    }
                    InputCommand::Reconfigure(settings) => {
                        tracing::debug!(
                            device = %dispatcher.identity,
                            mappings = settings.mappings.len(),
                            "Reconfiguring input mapper"
                        );
                        mapper.set_interval(settings.sequence_interval);
                        spot.set_timeout(settings.spot_timeout);
                        if let Some(output) = mapper.reconfigure(&settings.mappings) {
                            dispatcher.dispatch(vec![output]).await;
                        }
                    }
                    InputCommand::AttachProtocol(device) => dispatcher.protocol = Some(device),
                    InputCommand::DetachProtocol => dispatcher.protocol = None,
                }
            }
            _ = sleep_until(mapper_deadline.unwrap_or_else(Instant::now)), if mapper_deadline.is_some() => {
                let outputs = mapper.expire(Instant::now());
                dispatcher.dispatch(outputs).await;
            }
            _ = sleep_until(spot_deadline.unwrap_or_else(Instant::now)), if spot_deadline.is_some() => {
                if spot.expire(Instant::now()) {
                    dispatcher.spot_changed(false);
                }
            }
        }
    }

    if spot.is_active() {
        dispatcher.spot_changed(false);
    }
    tracing::debug!(device = %dispatcher.identity, "Input task stopped");
}

impl Dispatcher {
    fn spot_changed(&self, active: bool) {
        publish(
            &self.events,
            CoreEvent::SpotActive {
                identity: self.identity.clone(),
                active,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::testing::RecordingEmitter;
    use crate::hidpp::engine::testing::{spawn_engine, RecordingWriter};
    use crate::hidpp::features::feature_code;
    use crate::input_mapper::{KeyEvent, RawEvent};
    use evdev::Key;

    const INTERVAL: Duration = Duration::from_millis(200);
    const SPOT_TIMEOUT: Duration = Duration::from_millis(600);

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: 0x046d,
            product_id: 0xc53e,
            phys: "usb-0000:00:14.0-2".to_string(),
        }
    }

    fn settings(mappings: Vec<Mapping>) -> InputSettings {
        InputSettings {
            mappings: mappings.into(),
            sequence_interval: INTERVAL,
            spot_timeout: SPOT_TIMEOUT,
        }
    }

    fn key_batch(key: Key, value: i32) -> Vec<InputEvent> {
        vec![
            InputEvent::new(EventType::KEY, key.code(), value),
            InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
        ]
    }

    fn motion() -> Vec<InputEvent> {
        vec![
            InputEvent::new(EventType::RELATIVE, RelativeAxisType::REL_X.0, 5),
            InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
        ]
    }

    fn single(key: Key, action: MappedAction) -> Mapping {
        Mapping {
            sequence: vec![KeyEvent(vec![RawEvent::key(key, 1)])],
            action,
        }
    }

    fn start(
        mappings: Vec<Mapping>,
    ) -> (
        RecordingEmitter,
        mpsc::UnboundedSender<InputCommand>,
        mpsc::UnboundedReceiver<CoreEvent>,
        JoinHandle<()>,
    ) {
        let recorder = RecordingEmitter::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (tx, task) = spawn_input_task(
            identity(),
            settings(mappings),
            Some(ActionExecutor::new(recorder.shared())),
            events_tx,
        );
        (recorder, tx, events_rx, task)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_spot_tracker_transitions() {
        let start = Instant::now();
        let mut spot = SpotTracker::new(SPOT_TIMEOUT);

        assert!(!spot.observe(&key_batch(Key::KEY_A, 1), start));
        assert!(spot.observe(&motion(), start));
        // Already active; only the deadline moves
        assert!(!spot.observe(&motion(), start + Duration::from_millis(100)));
        assert!(!spot.expire(start + SPOT_TIMEOUT));
        assert!(spot.expire(start + Duration::from_millis(700)));
        assert!(!spot.is_active());
    }

    #[test]
    fn test_wheel_is_not_pointer_motion() {
        let wheel = InputEvent::new(EventType::RELATIVE, RelativeAxisType::REL_WHEEL.0, 1);
        assert!(!is_pointer_motion(&wheel));
    }

    #[tokio::test]
    async fn test_unmapped_events_are_forwarded() {
        let (recorder, tx, _events, task) = start(vec![]);

        tx.send(InputCommand::Events(key_batch(Key::KEY_NEXT, 1))).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(recorder.keys(), vec![(Key::KEY_NEXT.code(), 1)]);
    }

    #[tokio::test]
    async fn test_semantic_action_is_published() {
        let (recorder, tx, mut events, task) =
            start(vec![single(Key::KEY_NEXT, MappedAction::ToggleSpotlight)]);

        tx.send(InputCommand::Events(key_batch(Key::KEY_NEXT, 1))).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(
            events.recv().await,
            Some(CoreEvent::Action {
                identity: identity(),
                action: SemanticAction::ToggleSpotlight,
            })
        );
        assert!(recorder.keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_sequence_flushes_after_interval() {
        let mapping = Mapping {
            sequence: vec![
                KeyEvent(vec![RawEvent::key(Key::KEY_NEXT, 1)]),
                KeyEvent(vec![RawEvent::key(Key::KEY_NEXT, 0)]),
                KeyEvent(vec![RawEvent::key(Key::KEY_NEXT, 1)]),
            ],
            action: MappedAction::CyclePresets,
        };
        let (recorder, tx, _events, _task) = start(vec![mapping]);

        tx.send(InputCommand::Events(key_batch(Key::KEY_NEXT, 1))).unwrap();
        settle().await;
        assert!(recorder.keys().is_empty());

        tokio::time::sleep(INTERVAL + Duration::from_millis(10)).await;
        settle().await;
        assert_eq!(recorder.keys(), vec![(Key::KEY_NEXT.code(), 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spot_activity_is_published() {
        let (_recorder, tx, mut events, _task) = start(vec![]);

        tx.send(InputCommand::Events(motion())).unwrap();
        assert_eq!(
            events.recv().await,
            Some(CoreEvent::SpotActive {
                identity: identity(),
                active: true,
            })
        );

        tokio::time::sleep(SPOT_TIMEOUT + Duration::from_millis(10)).await;
        assert_eq!(
            events.recv().await,
            Some(CoreEvent::SpotActive {
                identity: identity(),
                active: false,
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_forwards_held_events() {
        let mapping = Mapping {
            sequence: vec![
                KeyEvent(vec![RawEvent::key(Key::KEY_NEXT, 1)]),
                KeyEvent(vec![RawEvent::key(Key::KEY_NEXT, 0)]),
            ],
            action: MappedAction::CyclePresets,
        };
        let (recorder, tx, _events, task) = start(vec![mapping]);

        tx.send(InputCommand::Events(key_batch(Key::KEY_NEXT, 1))).unwrap();
        tx.send(InputCommand::Reconfigure(settings(vec![]))).unwrap();
        // Without mappings this is forwarded directly
        tx.send(InputCommand::Events(key_batch(Key::KEY_NEXT, 0))).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(
            recorder.keys(),
            vec![(Key::KEY_NEXT.code(), 1), (Key::KEY_NEXT.code(), 0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_vibrate_goes_to_attached_device() {
        let writer = RecordingWriter::default();
        let (handle, _frames, _shutdown, _engine) = spawn_engine(writer.clone(), true);
        let device =
            HidppDevice::new(handle, 0xff).with_feature(feature_code::PRESENTER_CONTROL, 0x06);
        let (_recorder, tx, _events, _task) = start(vec![single(
            Key::KEY_PREVIOUS,
            MappedAction::Vibrate {
                length: 64,
                intensity: 128,
            },
        )]);

        tx.send(InputCommand::AttachProtocol(device)).unwrap();
        tx.send(InputCommand::Events(key_batch(Key::KEY_PREVIOUS, 1))).unwrap();
        settle().await;

        let frames = writer.frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..7], &[0x11, 0xff, 0x06, 0x17, 64, 0xe8, 128]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pointer_speed_goes_to_attached_device() {
        let writer = RecordingWriter::default();
        let (handle, _frames, _shutdown, _engine) = spawn_engine(writer.clone(), true);
        let device = HidppDevice::new(handle, 0x01).with_feature(feature_code::POINTER_SPEED, 0x0b);
        let (_recorder, tx, _events, _task) =
            start(vec![single(Key::KEY_NEXT, MappedAction::PointerSpeed(4))]);

        tx.send(InputCommand::AttachProtocol(device)).unwrap();
        tx.send(InputCommand::Events(key_batch(Key::KEY_NEXT, 1))).unwrap();
        settle().await;

        let frames = writer.frames.lock().unwrap().clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..5], &[0x11, 0x01, 0x0b, 0x17, 0x14]);
    }

    #[tokio::test]
    async fn test_closing_while_active_reports_spot_inactive() {
        let (_recorder, tx, mut events, task) = start(vec![]);

        tx.send(InputCommand::Events(motion())).unwrap();
        drop(tx);
        task.await.unwrap();

        assert!(matches!(events.recv().await, Some(CoreEvent::SpotActive { active: true, .. })));
        assert!(matches!(events.recv().await, Some(CoreEvent::SpotActive { active: false, .. })));
    }
}
