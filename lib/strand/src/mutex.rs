// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A blocking mutex, optionally recursive.
//!
//! Ownership is handed off on `unlock`: the thread at the head of the
//! wait-queue becomes the owner before it is woken, so no other thread can
//! grab the mutex in between.

use std::collections::VecDeque;

use log::trace;

use crate::error::StrandError;
use crate::tcb::{Environment, ThreadControlBlock};
use crate::threads::ThreadId;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MutexKind {
    /// Relocking by the owner fails with `Deadlock`.
    Normal,
    /// The owner may lock again, it has to unlock as many times.
    Recursive,
}

#[derive(Debug)]
pub struct Mutex {
    kind: MutexKind,
    inner: spin::Mutex<MutexInner>,
}

#[derive(Debug)]
struct MutexInner {
    owner: Option<ThreadId>,
    /// How often `owner` locked the mutex.
    count: usize,
    waitlist: VecDeque<ThreadId>,
    destroyed: bool,
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub const fn new() -> Mutex {
        Mutex::with_kind(MutexKind::Normal)
    }

    pub const fn new_recursive() -> Mutex {
        Mutex::with_kind(MutexKind::Recursive)
    }

    pub const fn with_kind(kind: MutexKind) -> Mutex {
        Mutex {
            kind,
            inner: spin::Mutex::new(MutexInner {
                owner: None,
                count: 0,
                waitlist: VecDeque::new(),
                destroyed: false,
            }),
        }
    }

    pub fn kind(&self) -> MutexKind {
        self.kind
    }

    pub fn is_recursive(&self) -> bool {
        self.kind == MutexKind::Recursive
    }

    /// Acquires the mutex, blocks while another thread holds it.
    pub fn lock(&self) -> Result<(), StrandError> {
        let thread = Environment::current()?;
        let tid = thread.tid();

        {
            let mut inner = self.inner.lock();
            if self.try_acquire(&mut inner, tid)? {
                return Ok(());
            }
            // Enqueue while still holding the lock, `unlock` will find us.
            inner.waitlist.push_back(tid);
        }

        trace!("Mutex {:p} contended, {} blocks", self, tid);
        self.wait_for_handoff(thread)
    }

    /// Non-blocking variant of `lock`, returns whether we got the mutex.
    ///
    /// A plain mutex already held by the caller fails with
    /// `StrandError::Deadlock` instead of returning `Ok(false)`.
    pub fn try_lock(&self) -> Result<bool, StrandError> {
        let tid = Environment::current()?.tid();
        let mut inner = self.inner.lock();
        self.try_acquire(&mut inner, tid)
    }

    /// Releases the mutex (once, for a recursive mutex).
    pub fn unlock(&self) -> Result<(), StrandError> {
        let thread = Environment::current()?;
        let tid = thread.tid();

        let next = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return Err(StrandError::InvalidState);
            }
            if inner.owner != Some(tid) {
                return Err(StrandError::NotOwner);
            }

            inner.count -= 1;
            if inner.count > 0 {
                return Ok(());
            }

            // Hand off to the first waiter (if any):
            let next = inner.waitlist.pop_front();
            inner.owner = next;
            inner.count = if next.is_some() { 1 } else { 0 };
            next
        };

        if let Some(next) = next {
            trace!("Mutex {:p} handed from {} to {}", self, tid, next);
            thread.make_runnable(next);
        }
        Ok(())
    }

    /// Marks the mutex as destroyed, it must be unlocked and without waiters.
    ///
    /// Waiters keep the mutex locked (it is handed to them on `unlock`), so
    /// they are reported first.
    pub fn destroy(&self) -> Result<(), StrandError> {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return Err(StrandError::InvalidState);
        }
        if !inner.waitlist.is_empty() {
            return Err(StrandError::HasWaiters);
        }
        if inner.count > 0 {
            return Err(StrandError::StillLocked);
        }
        inner.destroyed = true;
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().owner.is_some()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.inner.lock().owner
    }

    pub fn hold_count(&self) -> usize {
        self.inner.lock().count
    }

    fn try_acquire(&self, inner: &mut MutexInner, tid: ThreadId) -> Result<bool, StrandError> {
        if inner.destroyed {
            return Err(StrandError::InvalidState);
        }

        match inner.owner {
            None => {
                inner.owner = Some(tid);
                inner.count = 1;
                Ok(true)
            }
            Some(owner) if owner == tid => match self.kind {
                MutexKind::Recursive => {
                    inner.count += 1;
                    Ok(true)
                }
                MutexKind::Normal => Err(StrandError::Deadlock),
            },
            Some(_) => Ok(false),
        }
    }

    fn wait_for_handoff(&self, thread: &ThreadControlBlock) -> Result<(), StrandError> {
        let tid = thread.tid();
        loop {
            if let Err(e) = thread.block() {
                self.inner.lock().waitlist.retain(|&w| w != tid);
                return Err(e);
            }
            if self.inner.lock().owner == Some(tid) {
                return Ok(());
            }
        }
    }
}
