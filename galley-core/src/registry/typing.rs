//! Typing entries and their expiry timers
//!
//! Each `(channel, user)` key holds at most one entry and one pending timer.
//! Entries carry a generation so a timer armed for an older activation can
//! never remove a newer one. The map sits behind a synchronous mutex: arming
//! spawns the timer and swaps the entry in one critical section without
//! yielding to the runtime.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::AbortHandle;

use crate::types::{ChannelId, ConnectionId, TenantId, Timestamp, UserId};

pub type TypingKey = (ChannelId, UserId);

#[derive(Debug)]
pub struct TypingEntry {
    pub tenant_id: TenantId,
    /// Connection that last signalled
    pub connection_id: ConnectionId,
    pub last_signal: Timestamp,
    generation: u64,
    timer: AbortHandle,
}

impl TypingEntry {
    fn cancel(&self) {
        self.timer.abort();
    }
}

#[derive(Default)]
struct TypingState {
    entries: HashMap<TypingKey, TypingEntry>,
    next_generation: u64,
}

#[derive(Default)]
pub struct TypingRegistry {
    state: Mutex<TypingState>,
}

impl TypingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TypingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a start signal and arm a fresh timer
    ///
    /// `spawn_timer` receives the generation of the new activation and must
    /// return the handle of the task that will call [`Self::expire`] with it.
    /// Any previous timer for the key is aborted. Returns true when the key
    /// was idle before this call.
    pub fn arm<F>(
        &self,
        key: TypingKey,
        tenant: &TenantId,
        conn: &ConnectionId,
        spawn_timer: F,
    ) -> bool
    where
        F: FnOnce(u64) -> AbortHandle,
    {
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        let entry = TypingEntry {
            tenant_id: tenant.clone(),
            connection_id: conn.clone(),
            last_signal: Timestamp::now(),
            generation,
            timer: spawn_timer(generation),
        };

        match state.entries.insert(key, entry) {
            Some(previous) => {
                previous.cancel();
                false
            }
            None => true,
        }
    }

    /// Timer path: remove the entry only if it still belongs to `generation`
    pub fn expire(&self, key: &TypingKey, generation: u64) -> Option<TypingEntry> {
        let mut state = self.lock();
        let current = state.entries.get(key).map(|entry| entry.generation);
        if current != Some(generation) {
            return None;
        }
        state.entries.remove(key)
    }

    /// Explicit path: remove the entry and cancel its timer
    pub fn clear(&self, key: &TypingKey) -> Option<TypingEntry> {
        let removed = self.lock().entries.remove(key);
        if let Some(entry) = &removed {
            entry.cancel();
        }
        removed
    }

    /// Remove every entry last signalled by `conn`, cancelling their timers
    pub fn purge_connection(&self, conn: &ConnectionId) -> Vec<(TypingKey, TypingEntry)> {
        let mut state = self.lock();
        let keys: Vec<TypingKey> = state
            .entries
            .iter()
            .filter(|(_, entry)| &entry.connection_id == conn)
            .map(|(key, _)| key.clone())
            .collect();

        keys.into_iter()
            .filter_map(|key| {
                let entry = state.entries.remove(&key)?;
                entry.cancel();
                Some((key, entry))
            })
            .collect()
    }

    pub fn is_typing(&self, channel: &ChannelId, user: &UserId) -> bool {
        self.lock().entries.contains_key(&(channel.clone(), user.clone()))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
