//! Output synthesis for forwarded events and mapped actions
//!
//! This module provides the [`ActionExecutor`] struct, which writes forwarded
//! event batches and the key/button events of mapped actions to the shared
//! emitter.

use std::time::Duration;

use evdev::{EventType, InputEvent, Key};

use crate::emitter::SharedEmitter;
use crate::error::EmitterError;
use crate::input_mapper::{KeyCombo, MappedAction};

/// Time between the press and release of a synthesized left click
///
/// Receiving applications use the press/release spacing for their
/// double-click detection; a zero-length click is ignored by some.
pub const CLICK_DELAY: Duration = Duration::from_millis(20);

/// Writes events to the shared emitter.
///
/// `ActionExecutor` is `Clone` and cheap to clone since it only holds an `Arc`.
/// Every emit takes the emitter lock for one batch group only, so output
/// from several devices interleaves at batch boundaries.
///
/// # Example
///
/// ```ignore
/// let emitter = create_shared_emitter()?;
/// let executor = ActionExecutor::new(emitter);
///
/// executor.emit_mapped_action(&MappedAction::LeftClick).await?;
/// ```
#[derive(Clone)]
pub struct ActionExecutor {
    emitter: SharedEmitter,
}

impl ActionExecutor {
    /// Create a new `ActionExecutor` writing to `emitter`.
    pub fn new(emitter: SharedEmitter) -> Self {
        Self { emitter }
    }

    /// Forward raw events unchanged
    ///
    /// # Errors
    ///
    /// Returns an error if the batch is not SYN-terminated or the emitter
    /// rejects the write.
    pub async fn forward(&self, events: &[InputEvent]) -> Result<(), EmitterError> {
        self.emitter.lock().await.emit(events)
    }

    /// Synthesize the events of a mapped action.
    ///
    /// Key sequences tap each combo in order. Left clicks press BTN_LEFT,
    /// wait [`CLICK_DELAY`] and release it. Actions that are not input
    /// (semantic and device actions) produce no events.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let action = MappedAction::KeySequence(vec![parse_combo("Ctrl+Right")?]);
    /// executor.emit_mapped_action(&action).await?;
    /// ```
    pub async fn emit_mapped_action(&self, action: &MappedAction) -> Result<(), EmitterError> {
        match action {
            MappedAction::KeySequence(combos) => self.key_sequence(combos).await,
            MappedAction::LeftClick => self.left_click().await,
            other => {
                tracing::trace!(action = ?other, "Action has no input events");
                Ok(())
            }
        }
    }

    async fn key_sequence(&self, combos: &[KeyCombo]) -> Result<(), EmitterError> {
        for combo in combos {
            tracing::debug!(combo = %combo, "Emitting key combo");
            self.emitter.lock().await.emit(&combo.tap_events())?;
        }
        Ok(())
    }

    async fn left_click(&self) -> Result<(), EmitterError> {
        self.emitter.lock().await.emit(&button(Key::BTN_LEFT, 1))?;
        // The lock is not held across the delay
        tokio::time::sleep(CLICK_DELAY).await;
        self.emitter.lock().await.emit(&button(Key::BTN_LEFT, 0))
    }
}

fn button(key: Key, value: i32) -> [InputEvent; 2] {
    [
        InputEvent::new(EventType::KEY, key.code(), value),
        InputEvent::new(EventType::SYNCHRONIZATION, 0, 0),
    ]
}
