// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Thread-local storage keys.
//!
//! Keys live in a process-wide registry (shared by all schedulers) that
//! remembers an optional destructor per key. The values themselves are
//! private to every thread and are stored in its control block, so reading
//! and writing them never contends with other threads; only the registry is
//! protected by a lock.
//!
//! When a thread exits, every value that is non-null and belongs to a key
//! with a destructor is handed to that destructor exactly once, before the
//! thread's joiners are released. Destructors may store new values, in that
//! case up to `DESTRUCTOR_ITERATIONS` passes are made.
//!
//! # Deleting keys
//! A key with a destructor can only be deleted once no thread holds a
//! non-null value for it anymore, otherwise `delete_key` fails with
//! `KeyInUse`. Keys without a destructor can always be deleted; values
//! stored under them are dropped from view (the key handle becomes stale).

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use hashbrown::HashMap;
use log::{trace, warn};

use crate::error::StrandError;
use crate::tcb::Environment;
use crate::threads::ThreadId;

/// Maximum number of live keys.
pub const TLS_KEYS_MAX: usize = 1024;

/// Maximum destructor passes on thread exit.
pub const DESTRUCTOR_ITERATIONS: usize = 4;

/// Function invoked with a thread's value when it exits.
pub type Destructor = Arc<dyn Fn(*mut u8) + Send + Sync>;

/// Identifies a thread-local storage slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct TlsKey {
    index: u32,
    /// Generation of the registry slot, bumped on every `create_key`.
    seq: u32,
}

struct KeySlot {
    in_use: bool,
    seq: u32,
    destructor: Option<Destructor>,
    /// Threads with a non-null value for this key.
    holders: usize,
}

struct KeyRegistry {
    slots: Vec<KeySlot>,
}

impl KeyRegistry {
    const fn new() -> Self {
        KeyRegistry { slots: Vec::new() }
    }

    fn lookup_mut(&mut self, index: u32, seq: u32) -> Option<&mut KeySlot> {
        self.slots
            .get_mut(index as usize)
            .filter(|s| s.in_use && s.seq == seq)
    }

    fn slot_mut(&mut self, key: TlsKey) -> Result<&mut KeySlot, StrandError> {
        self.lookup_mut(key.index, key.seq)
            .ok_or(StrandError::InvalidHandle)
    }

    fn register(&mut self, destructor: Option<Destructor>) -> Result<TlsKey, StrandError> {
        let index = match self.slots.iter().position(|s| !s.in_use) {
            Some(index) => index,
            None if self.slots.len() < TLS_KEYS_MAX => {
                self.slots.push(KeySlot {
                    in_use: false,
                    seq: 0,
                    destructor: None,
                    holders: 0,
                });
                self.slots.len() - 1
            }
            None => return Err(StrandError::ResourceExhausted),
        };

        let slot = &mut self.slots[index];
        slot.in_use = true;
        slot.seq = slot.seq.wrapping_add(1);
        slot.destructor = destructor;
        slot.holders = 0;

        Ok(TlsKey {
            index: index as u32,
            seq: slot.seq,
        })
    }
}

static KEYS: spin::Mutex<KeyRegistry> = spin::Mutex::new(KeyRegistry::new());

/// Registers a new key without a destructor.
pub fn create_key() -> Result<TlsKey, StrandError> {
    KEYS.lock().register(None)
}

/// Registers a new key, `destructor` runs for every thread that exits
/// with a non-null value stored under it.
pub fn create_key_with_destructor<F>(destructor: F) -> Result<TlsKey, StrandError>
where
    F: Fn(*mut u8) + Send + Sync + 'static,
{
    KEYS.lock().register(Some(Arc::new(destructor)))
}

/// Removes `key` from the registry.
pub fn delete_key(key: TlsKey) -> Result<(), StrandError> {
    let mut keys = KEYS.lock();
    let slot = keys.slot_mut(key)?;
    if slot.destructor.is_some() && slot.holders > 0 {
        warn!(
            "Can't delete {:?}, {} thread(s) still hold a value",
            key, slot.holders
        );
        return Err(StrandError::KeyInUse);
    }

    slot.in_use = false;
    slot.destructor = None;
    slot.holders = 0;
    Ok(())
}

/// Reads the calling thread's value for `key` (null if never set).
pub fn get(key: TlsKey) -> Result<*mut u8, StrandError> {
    let tcb = Environment::current()?;
    KEYS.lock().slot_mut(key)?;
    Ok(tcb.tls.value(key))
}

/// Stores `value` in the calling thread's slot for `key`.
pub fn set(key: TlsKey, value: *mut u8) -> Result<(), StrandError> {
    let tcb = Environment::current()?;

    // Keep the holder count and the slot in sync with respect to `delete_key`.
    let mut keys = KEYS.lock();
    let slot = keys.slot_mut(key)?;
    let old = tcb.tls.replace(key, value);
    match (old.is_null(), value.is_null()) {
        (true, false) => slot.holders += 1,
        (false, true) => slot.holders -= 1,
        _ => {}
    }
    Ok(())
}

/// Per-thread values, indexed by key index and tagged with the key's `seq`.
pub(crate) struct ThreadSlots {
    values: RefCell<HashMap<u32, (u32, *mut u8)>>,
}

impl ThreadSlots {
    pub(crate) fn new() -> Self {
        ThreadSlots {
            values: RefCell::new(HashMap::new()),
        }
    }

    fn value(&self, key: TlsKey) -> *mut u8 {
        match self.values.borrow().get(&key.index) {
            Some(&(seq, value)) if seq == key.seq => value,
            _ => ptr::null_mut(),
        }
    }

    /// Stores `value` for `key`, returns the previous value.
    fn replace(&self, key: TlsKey, value: *mut u8) -> *mut u8 {
        let mut values = self.values.borrow_mut();
        let old = match values.get(&key.index) {
            Some(&(seq, old)) if seq == key.seq => old,
            _ => ptr::null_mut(),
        };

        if value.is_null() {
            values.remove(&key.index);
        } else {
            values.insert(key.index, (key.seq, value));
        }
        old
    }

    /// Runs the destructors for all values of the exiting thread `tid`.
    pub(crate) fn run_destructors(&self, tid: ThreadId) {
        for round in 0..DESTRUCTOR_ITERATIONS {
            let pending: Vec<(Destructor, *mut u8)> = {
                let mut keys = KEYS.lock();
                let mut values = self.values.borrow_mut();
                let mut pending = Vec::new();
                values.retain(|&index, &mut (seq, value)| match keys.lookup_mut(index, seq) {
                    Some(slot) => match &slot.destructor {
                        Some(destructor) => {
                            slot.holders -= 1;
                            pending.push((destructor.clone(), value));
                            false
                        }
                        None => true,
                    },
                    // The key was deleted in the meantime.
                    None => false,
                });
                pending
            };

            if pending.is_empty() {
                break;
            }

            trace!(
                "{} runs {} TLS destructor(s) (pass {})",
                tid,
                pending.len(),
                round
            );
            for (destructor, value) in pending {
                if panic::catch_unwind(AssertUnwindSafe(|| destructor(value))).is_err() {
                    warn!("TLS destructor of {} panicked", tid);
                }
            }
        }

        self.release();
    }

    /// Forgets all values without running destructors.
    pub(crate) fn release(&self) {
        let mut keys = KEYS.lock();
        for (index, (seq, _value)) in self.values.borrow_mut().drain() {
            if let Some(slot) = keys.lookup_mut(index, seq) {
                slot.holders -= 1;
            }
        }
    }
}
