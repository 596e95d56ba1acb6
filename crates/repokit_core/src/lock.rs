//! Shared/exclusive record locks with FIFO waiting.
//!
//! # Responsibility
//! - Grant locks per `(kind, id)` key to unit-of-work holders.
//! - Block callers until grantable, failing after the configured timeout.
//!
//! # Invariants
//! - An exclusive holder excludes every other holder of the same key.
//! - Waiters on one key are granted strictly in arrival order, except that
//!   an upgrade by a current holder waits ahead of non-holders.
//! - A holder re-acquiring a mode it already covers never waits.

use crate::model::entity::{EntityId, EntityKind};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Lock holder scope; one per unit of work.
pub type HolderId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// How long `acquire` may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockTimeout {
    #[default]
    Indefinite,
    NoWait,
    AfterMillis(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockKey {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl LockKey {
    pub fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }
}

impl Display for LockKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Proof of a granted lock; released when its holder's unit of work ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: LockKey,
    pub mode: LockMode,
    pub holder: HolderId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    Timeout {
        key: LockKey,
        mode: LockMode,
        waited_ms: u128,
    },
    TargetMissing(LockKey),
}

impl Display for LockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout {
                key,
                mode,
                waited_ms,
            } => write!(f, "timed out after {waited_ms}ms waiting for {mode:?} lock on {key}"),
            Self::TargetMissing(key) => write!(f, "cannot lock missing entity {key}"),
        }
    }
}

impl Error for LockError {}

struct Waiter {
    ticket: u64,
    holder: HolderId,
    mode: LockMode,
}

#[derive(Default)]
struct LockEntry {
    holders: HashMap<HolderId, LockMode>,
    queue: VecDeque<Waiter>,
}

impl LockEntry {
    fn covers(&self, holder: HolderId, mode: LockMode) -> bool {
        match (self.holders.get(&holder), mode) {
            (Some(LockMode::Exclusive), _) => true,
            (Some(LockMode::Shared), LockMode::Shared) => true,
            _ => false,
        }
    }

    fn compatible(&self, holder: HolderId, mode: LockMode) -> bool {
        let mut others = self
            .holders
            .iter()
            .filter(|(id, _)| **id != holder)
            .map(|(_, held)| *held);
        match mode {
            LockMode::Exclusive => others.next().is_none(),
            LockMode::Shared => others.all(|held| held == LockMode::Shared),
        }
    }

    fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}

#[derive(Default)]
struct LockTable {
    entries: HashMap<LockKey, LockEntry>,
    next_ticket: u64,
}

/// Process-wide lock manager shared by every unit of work of one store.
#[derive(Default)]
pub struct LockCoordinator {
    table: Mutex<LockTable>,
    changed: Condvar,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires `mode` on `key` for `holder`, blocking per `timeout`.
    ///
    /// # Errors
    /// - `LockError::Timeout` when the lock is not granted in time
    ///   (immediately for `LockTimeout::NoWait`).
    pub fn acquire(
        &self,
        key: LockKey,
        mode: LockMode,
        holder: HolderId,
        timeout: LockTimeout,
    ) -> Result<LockToken, LockError> {
        let started_at = Instant::now();
        let token = LockToken { key, mode, holder };
        let mut table = self.lock_table();

        {
            let entry = table.entries.entry(key).or_default();
            if entry.covers(holder, mode) {
                return Ok(token);
            }
            let upgrading = entry.holders.contains_key(&holder);
            if (upgrading || entry.queue.is_empty()) && entry.compatible(holder, mode) {
                entry.holders.insert(holder, mode);
                debug!("event=lock_acquire module=lock status=ok key={key} mode={mode:?} waited_ms=0");
                return Ok(token);
            }
        }

        if timeout == LockTimeout::NoWait {
            self.prune(&mut table, key);
            warn!("event=lock_acquire module=lock status=error key={key} mode={mode:?} error_code=lock_nowait");
            return Err(LockError::Timeout {
                key,
                mode,
                waited_ms: 0,
            });
        }

        let ticket = table.next_ticket;
        table.next_ticket += 1;
        let entry = table.entries.entry(key).or_default();
        let waiter = Waiter {
            ticket,
            holder,
            mode,
        };
        if entry.holders.contains_key(&holder) {
            // Queued non-holders can never pass a holder that is still inside.
            let slot = entry
                .queue
                .iter()
                .take_while(|queued| entry.holders.contains_key(&queued.holder))
                .count();
            entry.queue.insert(slot, waiter);
        } else {
            entry.queue.push_back(waiter);
        }
        let deadline = match timeout {
            LockTimeout::AfterMillis(millis) => Some(started_at + Duration::from_millis(millis)),
            _ => None,
        };

        loop {
            let granted = match table.entries.get_mut(&key) {
                Some(entry) => {
                    let at_head = entry.queue.front().map(|w| w.ticket) == Some(ticket);
                    if at_head && entry.compatible(holder, mode) {
                        entry.queue.pop_front();
                        entry.holders.insert(holder, mode);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if granted {
                // Later shared waiters may now be grantable too.
                self.changed.notify_all();
                debug!(
                    "event=lock_acquire module=lock status=ok key={key} mode={mode:?} waited_ms={}",
                    started_at.elapsed().as_millis()
                );
                return Ok(token);
            }

            match deadline {
                None => {
                    table = self
                        .changed
                        .wait(table)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        if let Some(entry) = table.entries.get_mut(&key) {
                            entry.queue.retain(|waiter| waiter.ticket != ticket);
                        }
                        self.prune(&mut table, key);
                        self.changed.notify_all();
                        let waited_ms = started_at.elapsed().as_millis();
                        warn!(
                            "event=lock_acquire module=lock status=error key={key} mode={mode:?} waited_ms={waited_ms} error_code=lock_timeout"
                        );
                        return Err(LockError::Timeout {
                            key,
                            mode,
                            waited_ms,
                        });
                    }
                    table = self
                        .changed
                        .wait_timeout(table, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    /// Releases every lock held by `holder`; returns how many keys were freed.
    pub fn release_all(&self, holder: HolderId) -> usize {
        let mut table = self.lock_table();
        let mut released = 0;
        for entry in table.entries.values_mut() {
            if entry.holders.remove(&holder).is_some() {
                released += 1;
            }
        }
        table.entries.retain(|_, entry| !entry.is_idle());
        drop(table);

        if released > 0 {
            self.changed.notify_all();
            debug!("event=lock_release module=lock status=ok holder={holder} released={released}");
        }
        released
    }

    /// Mode currently held by `holder` on `key`, if any.
    pub fn held_mode(&self, key: LockKey, holder: HolderId) -> Option<LockMode> {
        self.lock_table()
            .entries
            .get(&key)
            .and_then(|entry| entry.holders.get(&holder).copied())
    }

    pub fn holder_count(&self, key: LockKey) -> usize {
        self.lock_table()
            .entries
            .get(&key)
            .map_or(0, |entry| entry.holders.len())
    }

    pub fn waiter_count(&self, key: LockKey) -> usize {
        self.lock_table()
            .entries
            .get(&key)
            .map_or(0, |entry| entry.queue.len())
    }

    fn prune(&self, table: &mut LockTable, key: LockKey) {
        if table.entries.get(&key).is_some_and(LockEntry::is_idle) {
            table.entries.remove(&key);
        }
    }

    fn lock_table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
