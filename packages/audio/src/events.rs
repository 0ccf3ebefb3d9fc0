//! Engine events and subscriptions
//!
//! Every registration returns a `Subscription`; calling `unsubscribe` (or
//! dropping the bus) ends delivery. Subscriptions do not unsubscribe on drop.
//!
//! Listeners run without the registry lock held, so they may subscribe or
//! unsubscribe from inside a callback. A listener removed during an `emit`
//! still sees that event. Emitting again from inside a listener is not
//! supported.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::Alert;
use crate::lyrics::LyricsLines;
use crate::microphone::MicrophoneState;
use crate::transport::PlaybackState;

#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
  Alert(Alert),
  StateChanged(PlaybackState),
  MicrophoneChanged {
    index: usize,
    state: MicrophoneState,
  },
  LyricsChanged(LyricsLines),
}

type Listener = Arc<Mutex<Box<dyn FnMut(&EngineEvent) + Send>>>;

#[derive(Default)]
struct Registry {
  next_id: u64,
  listeners: Vec<(u64, Listener)>,
}

#[derive(Clone, Default)]
pub struct EventBus {
  registry: Arc<Mutex<Registry>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe(&self, listener: impl FnMut(&EngineEvent) + Send + 'static) -> Subscription {
    let mut registry = self.registry.lock();
    registry.next_id += 1;
    let id = registry.next_id;
    registry
      .listeners
      .push((id, Arc::new(Mutex::new(Box::new(listener)))));
    Subscription {
      id,
      registry: Arc::downgrade(&self.registry),
    }
  }

  pub fn emit(&self, event: EngineEvent) {
    let listeners: Vec<Listener> = self
      .registry
      .lock()
      .listeners
      .iter()
      .map(|(_, listener)| listener.clone())
      .collect();
    for listener in listeners {
      (listener.lock())(&event);
    }
  }

  pub fn listener_count(&self) -> usize {
    self.registry.lock().listeners.len()
  }
}

#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
  id: u64,
  registry: Weak<Mutex<Registry>>,
}

impl Subscription {
  pub fn unsubscribe(self) {
    if let Some(registry) = self.registry.upgrade() {
      registry.lock().listeners.retain(|(id, _)| *id != self.id);
    }
  }
}
