//! Buffering and debounce policy around the sequence tree
//!
//! The mapper owns the raw batches of a partial match. Depending on how the
//! match resolves they are either forwarded unchanged or replaced by the
//! mapped action:
//!
//! | result           | buffered batches           | timer   |
//! |------------------|----------------------------|---------|
//! | `Valid`          | keep, add this batch       | restart |
//! | `AmbiguouslyHit` | keep, remember the action  | restart |
//! | `Hit`            | discard, run the action    | cancel  |
//! | `Miss`           | forward with this batch    | cancel  |
//!
//! A batch that does not continue the partial match first resolves it: the
//! buffer is forwarded, or the action of a pending `AmbiguouslyHit` runs.
//! The batch is then matched as a fresh attempt.
//!
//! On expiry, a pending `Valid` forwards the buffer and a pending
//! `AmbiguouslyHit` runs its action.

use std::time::Duration;

use evdev::InputEvent;
use tokio::time::Instant;

use crate::input_mapper::sequence::{MatchResult, SequenceTree};
use crate::input_mapper::{KeyEvent, MappedAction, Mapping};

/// What the caller should do after feeding or expiring the mapper
#[derive(Debug, Clone)]
pub enum MapperOutput {
    /// Emit these events unchanged (one or more SYN-terminated batches)
    Forward(Vec<InputEvent>),
    /// Run a mapped action
    Action(MappedAction),
}

/// Per-device sequence matcher
pub struct InputMapper {
    tree: SequenceTree,
    interval: Duration,
    buffered: Vec<InputEvent>,
    /// Action of the terminal node we are waiting on, after `AmbiguouslyHit`
    pending_action: Option<MappedAction>,
    deadline: Option<Instant>,
}

impl InputMapper {
    /// Create a mapper for `mappings`
    ///
    /// # Arguments
    ///
    /// * `mappings` - Resolved sequence mappings
    /// * `interval` - Debounce window after a partial or ambiguous match
    pub fn new(mappings: &[Mapping], interval: Duration) -> Self {
        Self {
            tree: SequenceTree::new(mappings),
            interval,
            buffered: Vec::new(),
            pending_action: None,
            deadline: None,
        }
    }

    /// When the debounce timer fires, if it is running
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether events are being held back
    pub fn is_buffering(&self) -> bool {
        !self.buffered.is_empty()
    }

    /// Feed one SYN-terminated batch read from the device
    pub fn feed(&mut self, batch: Vec<InputEvent>, now: Instant) -> Vec<MapperOutput> {
        let mut outputs = Vec::new();
        self.feed_into(batch, now, &mut outputs);
        outputs
    }

    fn feed_into(
        &mut self,
        batch: Vec<InputEvent>,
        now: Instant,
        outputs: &mut Vec<MapperOutput>,
    ) {
        let key_event = match KeyEvent::from_batch(&batch) {
            Some(key_event) if !self.tree.is_empty() => key_event,
            _ => {
                outputs.push(MapperOutput::Forward(batch));
                return;
            }
        };

        if !self.tree.is_idle() && !self.tree.continues(&key_event) {
            self.abandon_partial(outputs);
        }

        match self.tree.feed(&key_event) {
            MatchResult::Valid => {
                tracing::trace!(event = %key_event, "Partial sequence match");
                self.buffered.extend(batch);
                self.pending_action = None;
                self.deadline = Some(now + self.interval);
            }
            MatchResult::AmbiguouslyHit(action) => {
                tracing::trace!(event = %key_event, ?action, "Ambiguous sequence match");
                self.buffered.extend(batch);
                self.pending_action = Some(action);
                self.deadline = Some(now + self.interval);
            }
            MatchResult::Hit(action) => {
                tracing::debug!(event = %key_event, ?action, "Sequence matched");
                self.buffered.clear();
                self.pending_action = None;
                self.deadline = None;
                outputs.push(MapperOutput::Action(action));
            }
            MatchResult::Miss => {
                self.deadline = None;
                self.pending_action = None;
                let mut events = std::mem::take(&mut self.buffered);
                events.extend(batch);
                outputs.push(MapperOutput::Forward(events));
            }
        }
    }

    /// Resolve the partial match in progress before a fresh attempt
    fn abandon_partial(&mut self, outputs: &mut Vec<MapperOutput>) {
        self.deadline = None;
        let buffered = std::mem::take(&mut self.buffered);
        match self.pending_action.take() {
            // The shorter sequence stands
            Some(action) => outputs.push(MapperOutput::Action(action)),
            None if buffered.is_empty() => {}
            None => outputs.push(MapperOutput::Forward(buffered)),
        }
    }

    /// Resolve a partial match whose debounce window has elapsed
    ///
    /// Does nothing before the deadline.
    pub fn expire(&mut self, now: Instant) -> Vec<MapperOutput> {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return Vec::new(),
        }
        self.deadline = None;
        self.tree.reset();

        let buffered = std::mem::take(&mut self.buffered);
        match self.pending_action.take() {
            Some(action) => {
                tracing::debug!(?action, "Sequence matched after debounce");
                vec![MapperOutput::Action(action)]
            }
            None if buffered.is_empty() => Vec::new(),
            None => {
                tracing::trace!(events = buffered.len(), "Partial sequence expired");
                vec![MapperOutput::Forward(buffered)]
            }
        }
    }

    /// Change the debounce window used from the next partial match on
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    /// Replace the configured mappings
    ///
    /// The tree is rebuilt and matching restarts from scratch. Events held
    /// back by a partial match are returned for forwarding.
    pub fn reconfigure(&mut self, mappings: &[Mapping]) -> Option<MapperOutput> {
        self.tree = SequenceTree::new(mappings);
        self.pending_action = None;
        self.deadline = None;
        let buffered = std::mem::take(&mut self.buffered);
        (!buffered.is_empty()).then_some(MapperOutput::Forward(buffered))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input_mapper::RawEvent;
    use evdev::{EventType, Key};

    const INTERVAL: Duration = Duration::from_millis(200);

    fn batch(key: Key, value: i32) -> Vec<InputEvent> {
        vec![
            InputEvent::new(EventType::KEY, key.code(), value),
            InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
        ]
    }

    fn motion() -> Vec<InputEvent> {
        vec![
            InputEvent::new(EventType::RELATIVE, 0, 3),
            InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
        ]
    }

    fn step(key: Key, value: i32) -> KeyEvent {
        KeyEvent(vec![RawEvent::key(key, value)])
    }

    fn double_click_mapping() -> Mapping {
        Mapping {
            sequence: vec![
                step(Key::BTN_LEFT, 1),
                step(Key::BTN_LEFT, 0),
                step(Key::BTN_LEFT, 1),
                step(Key::BTN_LEFT, 0),
            ],
            action: MappedAction::ToggleSpotlight,
        }
    }

    fn single_click_mapping() -> Mapping {
        Mapping {
            sequence: vec![step(Key::BTN_LEFT, 1), step(Key::BTN_LEFT, 0)],
            action: MappedAction::LeftClick,
        }
    }

    fn raw(events: &[InputEvent]) -> Vec<RawEvent> {
        events.iter().map(RawEvent::from).collect()
    }

    fn actions(outputs: &[MapperOutput]) -> Vec<MappedAction> {
        outputs
            .iter()
            .map(|o| match o {
                MapperOutput::Action(action) => action.clone(),
                MapperOutput::Forward(_) => panic!("expected an action"),
            })
            .collect()
    }

    fn codes(output: &MapperOutput) -> Vec<(u16, i32)> {
        match output {
            MapperOutput::Forward(events) => events
                .iter()
                .filter(|e| e.event_type() == EventType::KEY)
                .map(|e| (e.code(), e.value()))
                .collect(),
            MapperOutput::Action(_) => panic!("expected forwarded events"),
        }
    }

    #[test]
    fn test_no_mappings_forwards_everything() {
        let mut mapper = InputMapper::new(&[], INTERVAL);
        let out = mapper.feed(batch(Key::KEY_NEXT, 1), Instant::now());
        assert_eq!(out.len(), 1);
        match &out[0] {
            MapperOutput::Forward(events) => {
                assert_eq!(raw(events), raw(&batch(Key::KEY_NEXT, 1)))
            }
            other => panic!("unexpected output {:?}", other),
        }
        assert_eq!(mapper.deadline(), None);
    }

    #[test]
    fn test_motion_bypasses_partial_match() {
        let mut mapper = InputMapper::new(&[double_click_mapping()], INTERVAL);
        let now = Instant::now();
        assert!(mapper.feed(batch(Key::BTN_LEFT, 1), now).is_empty());

        let out = mapper.feed(motion(), now);
        assert_eq!(out.len(), 1);
        match &out[0] {
            MapperOutput::Forward(events) => assert_eq!(raw(events), raw(&motion())),
            other => panic!("unexpected output {:?}", other),
        }
        assert!(mapper.is_buffering());
    }

    #[test]
    fn test_full_sequence_runs_action_and_discards_events() {
        let mut mapper = InputMapper::new(&[double_click_mapping()], INTERVAL);
        let now = Instant::now();
        assert!(mapper.feed(batch(Key::BTN_LEFT, 1), now).is_empty());
        assert!(mapper.feed(batch(Key::BTN_LEFT, 0), now).is_empty());
        assert!(mapper.feed(batch(Key::BTN_LEFT, 1), now).is_empty());
        let out = mapper.feed(batch(Key::BTN_LEFT, 0), now);

        assert_eq!(actions(&out), vec![MappedAction::ToggleSpotlight]);
        assert!(!mapper.is_buffering());
        assert_eq!(mapper.deadline(), None);
    }

    #[test]
    fn test_miss_flushes_buffer_and_current_event() {
        let mut mapper = InputMapper::new(&[double_click_mapping()], INTERVAL);
        let now = Instant::now();
        mapper.feed(batch(Key::BTN_LEFT, 1), now);
        let out = mapper.feed(batch(Key::KEY_B, 1), now);

        assert_eq!(out.len(), 2);
        assert_eq!(codes(&out[0]), vec![(Key::BTN_LEFT.code(), 1)]);
        assert_eq!(codes(&out[1]), vec![(Key::KEY_B.code(), 1)]);
        assert!(!mapper.is_buffering());
        assert_eq!(mapper.deadline(), None);
    }

    #[test]
    fn test_valid_restarts_debounce_timer() {
        let mut mapper = InputMapper::new(&[double_click_mapping()], INTERVAL);
        let start = Instant::now();
        mapper.feed(batch(Key::BTN_LEFT, 1), start);
        assert_eq!(mapper.deadline(), Some(start + INTERVAL));

        let later = start + Duration::from_millis(150);
        mapper.feed(batch(Key::BTN_LEFT, 0), later);
        assert_eq!(mapper.deadline(), Some(later + INTERVAL));

        // Not yet due
        assert!(mapper.expire(start + INTERVAL).is_empty());
        assert!(mapper.is_buffering());
    }

    #[test]
    fn test_gap_flushes_prefix_and_restarts_matching() {
        let mut mapper = InputMapper::new(&[double_click_mapping()], INTERVAL);
        let start = Instant::now();
        mapper.feed(batch(Key::BTN_LEFT, 1), start);
        mapper.feed(batch(Key::BTN_LEFT, 0), start);

        let expired_at = start + INTERVAL + Duration::from_millis(50);
        let out = mapper.expire(expired_at);
        assert_eq!(out.len(), 1);
        assert_eq!(
            codes(&out[0]),
            vec![(Key::BTN_LEFT.code(), 1), (Key::BTN_LEFT.code(), 0)]
        );

        // The third event starts a fresh attempt
        assert!(mapper.feed(batch(Key::BTN_LEFT, 1), expired_at).is_empty());
        assert!(mapper.is_buffering());
        assert!(mapper.feed(batch(Key::BTN_LEFT, 0), expired_at).is_empty());
        assert!(mapper.feed(batch(Key::BTN_LEFT, 1), expired_at).is_empty());
        assert_eq!(
            actions(&mapper.feed(batch(Key::BTN_LEFT, 0), expired_at)),
            vec![MappedAction::ToggleSpotlight]
        );
    }

    #[test]
    fn test_ambiguous_resolves_to_action_on_expiry() {
        let mut mapper =
            InputMapper::new(&[single_click_mapping(), double_click_mapping()], INTERVAL);
        let start = Instant::now();
        mapper.feed(batch(Key::BTN_LEFT, 1), start);
        assert!(mapper.feed(batch(Key::BTN_LEFT, 0), start).is_empty());

        let out = mapper.expire(start + INTERVAL);
        assert_eq!(actions(&out), vec![MappedAction::LeftClick]);
        assert!(!mapper.is_buffering());
    }

    #[test]
    fn test_ambiguous_then_longer_sequence_hits() {
        let mut mapper =
            InputMapper::new(&[single_click_mapping(), double_click_mapping()], INTERVAL);
        let now = Instant::now();
        mapper.feed(batch(Key::BTN_LEFT, 1), now);
        mapper.feed(batch(Key::BTN_LEFT, 0), now);
        mapper.feed(batch(Key::BTN_LEFT, 1), now);
        assert_eq!(
            actions(&mapper.feed(batch(Key::BTN_LEFT, 0), now)),
            vec![MappedAction::ToggleSpotlight]
        );
    }

    #[test]
    fn test_ambiguous_then_miss_runs_action_and_refeeds() {
        let mut mapper =
            InputMapper::new(&[single_click_mapping(), double_click_mapping()], INTERVAL);
        let now = Instant::now();
        mapper.feed(batch(Key::BTN_LEFT, 1), now);
        mapper.feed(batch(Key::BTN_LEFT, 0), now);

        let out = mapper.feed(batch(Key::KEY_B, 1), now);
        assert_eq!(out.len(), 2);
        assert_eq!(actions(&out[..1]), vec![MappedAction::LeftClick]);
        assert_eq!(codes(&out[1]), vec![(Key::KEY_B.code(), 1)]);
    }

    #[test]
    fn test_sequence_start_mid_match_begins_fresh_attempt() {
        let mapping = Mapping {
            sequence: vec![step(Key::KEY_B, 1), step(Key::KEY_A, 1)],
            action: MappedAction::CyclePresets,
        };
        let mut mapper = InputMapper::new(&[mapping], INTERVAL);
        let now = Instant::now();

        assert!(mapper.feed(batch(Key::KEY_B, 1), now).is_empty());

        // The second press flushes the first and starts over
        let out = mapper.feed(batch(Key::KEY_B, 1), now);
        assert_eq!(out.len(), 1);
        assert_eq!(codes(&out[0]), vec![(Key::KEY_B.code(), 1)]);
        assert!(mapper.is_buffering());
        assert_eq!(mapper.deadline(), Some(now + INTERVAL));

        assert_eq!(
            actions(&mapper.feed(batch(Key::KEY_A, 1), now)),
            vec![MappedAction::CyclePresets]
        );
        assert!(!mapper.is_buffering());
    }

    #[test]
    fn test_ambiguous_then_sequence_start_runs_action_and_buffers() {
        let next = Mapping {
            sequence: vec![step(Key::KEY_NEXT, 1), step(Key::KEY_NEXT, 0)],
            action: MappedAction::CyclePresets,
        };
        let mut mapper = InputMapper::new(
            &[single_click_mapping(), double_click_mapping(), next],
            INTERVAL,
        );
        let now = Instant::now();
        mapper.feed(batch(Key::BTN_LEFT, 1), now);
        mapper.feed(batch(Key::BTN_LEFT, 0), now);

        let out = mapper.feed(batch(Key::KEY_NEXT, 1), now);
        assert_eq!(actions(&out), vec![MappedAction::LeftClick]);
        assert!(mapper.is_buffering());
        assert_eq!(
            actions(&mapper.feed(batch(Key::KEY_NEXT, 0), now)),
            vec![MappedAction::CyclePresets]
        );
    }

    #[test]
    fn test_reconfigure_flushes_and_resets() {
        let mut mapper = InputMapper::new(&[double_click_mapping()], INTERVAL);
        let now = Instant::now();
        mapper.feed(batch(Key::BTN_LEFT, 1), now);

        let flushed = mapper.reconfigure(&[single_click_mapping()]);
        assert_eq!(codes(&flushed.unwrap()), vec![(Key::BTN_LEFT.code(), 1)]);
        assert_eq!(mapper.deadline(), None);

        // Old partial state is gone: a release alone does not complete anything
        let out = mapper.feed(batch(Key::BTN_LEFT, 0), now);
        assert_eq!(codes(&out[0]), vec![(Key::BTN_LEFT.code(), 0)]);
        assert!(mapper.reconfigure(&[]).is_none());
    }
}
