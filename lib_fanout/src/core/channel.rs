//! # Connection Channel State
//!
//! The one capability the registry needs from a transport's connection
//! object: a slot holding a single opaque string for the life of the
//! connection. The channel id lives there, so a disconnect handler can find
//! every subscription the connection created.

use std::sync::Mutex;

use crate::utils::new_id;

/// A per-connection slot for one opaque string.
pub trait ChannelState: Send + Sync {
    /// The stored value, if any.
    fn load(&self) -> Option<String>;

    /// Replaces the stored value.
    fn store(&self, value: String);
}

/// Returns the channel id kept in `state`, minting and storing one on first use.
pub fn channel_id_for(state: &dyn ChannelState) -> String {
    if let Some(id) = state.load().filter(|id| !id.is_empty()) {
        return id;
    }
    let id = new_id();
    state.store(id.clone());
    id
}

/// [`ChannelState`] held in process memory, e.g. inside a WebSocket session.
#[derive(Debug, Default)]
pub struct MemoryChannelState {
    slot: Mutex<Option<String>>,
}

impl MemoryChannelState {
    /// An empty slot.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelState for MemoryChannelState {
    fn load(&self) -> Option<String> {
        match self.slot.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn store(&self, value: String) {
        match self.slot.lock() {
            Ok(mut slot) => *slot = Some(value),
            Err(poisoned) => *poisoned.into_inner() = Some(value),
        }
    }
}
