// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A reader/writer semaphore with a single FIFO wait-queue.
//!
//! Readers and writers queue up in arrival order. As soon as anybody waits,
//! new readers queue up too (even if the semaphore is currently read-locked),
//! so a writer can't be starved by a steady stream of readers. Whenever the
//! semaphore becomes free the head of the queue is admitted: either one
//! writer or all readers up to the next queued writer.

use std::collections::VecDeque;

use either::{Either, Left, Right};
use log::trace;

use crate::error::StrandError;
use crate::tcb::{Environment, ThreadControlBlock};
use crate::threads::ThreadId;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RwLockIntent {
    Read,
    Write,
}

#[derive(Debug)]
pub struct RwSemaphore {
    inner: spin::Mutex<RwSemInner>,
}

#[derive(Debug)]
struct RwSemInner {
    /// `Left(writer)` or `Right(active readers)`.
    owner: Option<Either<ThreadId, usize>>,
    queue: VecDeque<(ThreadId, RwLockIntent)>,
    destroyed: bool,
}

impl Default for RwSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl RwSemInner {
    fn check_alive(&self) -> Result<(), StrandError> {
        if self.destroyed {
            Err(StrandError::InvalidState)
        } else {
            Ok(())
        }
    }

    fn try_enter(&mut self, tid: ThreadId, opt: RwLockIntent) -> Result<bool, StrandError> {
        self.check_alive()?;
        if self.owner == Some(Left(tid)) {
            return Err(StrandError::Deadlock);
        }
        if !self.queue.is_empty() {
            // Somebody arrived before us.
            return Ok(false);
        }

        match (opt, self.owner) {
            (RwLockIntent::Read, None) => {
                self.owner = Some(Right(1));
                Ok(true)
            }
            (RwLockIntent::Read, Some(Right(readers))) => {
                self.owner = Some(Right(readers + 1));
                Ok(true)
            }
            (RwLockIntent::Write, None) => {
                self.owner = Some(Left(tid));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Admits the head of the queue once the semaphore is free.
    ///
    /// Returns the threads that need to be woken up.
    fn admit_waiters(&mut self) -> Vec<ThreadId> {
        debug_assert!(self.owner.is_none());
        let mut admitted = Vec::new();

        match self.queue.front() {
            Some(&(tid, RwLockIntent::Write)) => {
                self.queue.pop_front();
                self.owner = Some(Left(tid));
                admitted.push(tid);
            }
            Some(&(_, RwLockIntent::Read)) => {
                self.admit_leading_readers(0, &mut admitted);
            }
            None => {}
        }

        admitted
    }

    /// Moves all readers at the head of the queue to the active readers
    /// (on top of `readers` that are already active).
    fn admit_leading_readers(&mut self, readers: usize, admitted: &mut Vec<ThreadId>) {
        while let Some(&(tid, RwLockIntent::Read)) = self.queue.front() {
            self.queue.pop_front();
            admitted.push(tid);
        }
        let readers = readers + admitted.len();
        self.owner = if readers > 0 { Some(Right(readers)) } else { None };
    }

    fn is_queued(&self, tid: ThreadId) -> bool {
        self.queue.iter().any(|&(w, _)| w == tid)
    }
}

impl RwSemaphore {
    pub const fn new() -> RwSemaphore {
        RwSemaphore {
            inner: spin::Mutex::new(RwSemInner {
                owner: None,
                queue: VecDeque::new(),
                destroyed: false,
            }),
        }
    }

    pub fn read_lock(&self) -> Result<(), StrandError> {
        self.enter(RwLockIntent::Read)
    }

    pub fn write_lock(&self) -> Result<(), StrandError> {
        self.enter(RwLockIntent::Write)
    }

    pub fn try_read_lock(&self) -> Result<bool, StrandError> {
        self.try_enter(RwLockIntent::Read)
    }

    pub fn try_write_lock(&self) -> Result<bool, StrandError> {
        self.try_enter(RwLockIntent::Write)
    }

    pub fn read_unlock(&self) -> Result<(), StrandError> {
        let thread = Environment::current()?;
        let wake = {
            let mut rw = self.inner.lock();
            rw.check_alive()?;
            match rw.owner {
                Some(Right(readers)) if readers > 1 => {
                    rw.owner = Some(Right(readers - 1));
                    Vec::new()
                }
                Some(Right(_last)) => {
                    rw.owner = None;
                    rw.admit_waiters()
                }
                _ => return Err(StrandError::NotOwner),
            }
        };

        self.wake(thread, wake);
        Ok(())
    }

    pub fn write_unlock(&self) -> Result<(), StrandError> {
        let thread = Environment::current()?;
        let tid = thread.tid();
        let wake = {
            let mut rw = self.inner.lock();
            rw.check_alive()?;
            match rw.owner {
                Some(Left(writer)) if writer == tid => {
                    rw.owner = None;
                    rw.admit_waiters()
                }
                _ => return Err(StrandError::NotOwner),
            }
        };

        self.wake(thread, wake);
        Ok(())
    }

    /// Turns our write lock into a read lock, readers queued at the head
    /// of the queue get admitted together with us.
    pub fn downgrade(&self) -> Result<(), StrandError> {
        let thread = Environment::current()?;
        let tid = thread.tid();
        let wake = {
            let mut rw = self.inner.lock();
            rw.check_alive()?;
            match rw.owner {
                Some(Left(writer)) if writer == tid => {
                    let mut admitted = Vec::new();
                    rw.admit_leading_readers(1, &mut admitted);
                    admitted
                }
                _ => return Err(StrandError::NotOwner),
            }
        };

        self.wake(thread, wake);
        Ok(())
    }

    /// Turns a read lock into a write lock if we're the only reader and
    /// nobody is waiting.
    ///
    /// The caller must hold a read lock, we only track the number of readers.
    pub fn try_upgrade(&self) -> Result<bool, StrandError> {
        let tid = Environment::current()?.tid();
        let mut rw = self.inner.lock();
        rw.check_alive()?;

        match rw.owner {
            Some(Right(1)) if rw.queue.is_empty() => {
                trace!("try_upgrade upgrade successful");
                rw.owner = Some(Left(tid));
                Ok(true)
            }
            Some(Right(_readers)) => {
                trace!("can not upgrade reader_count is {:?}", rw.owner);
                Ok(false)
            }
            _ => Err(StrandError::NotOwner),
        }
    }

    /// Fails unless nobody holds or waits for the semaphore.
    pub fn destroy(&self) -> Result<(), StrandError> {
        let mut rw = self.inner.lock();
        rw.check_alive()?;
        // Queued threads imply an owner, report them first.
        if !rw.queue.is_empty() {
            return Err(StrandError::HasWaiters);
        }
        if rw.owner.is_some() {
            return Err(StrandError::StillLocked);
        }
        rw.destroyed = true;
        Ok(())
    }

    pub fn read_count(&self) -> usize {
        match self.inner.lock().owner {
            Some(Right(readers)) => readers,
            _ => 0,
        }
    }

    pub fn is_write_locked(&self) -> bool {
        matches!(self.inner.lock().owner, Some(Left(_)))
    }

    fn try_enter(&self, opt: RwLockIntent) -> Result<bool, StrandError> {
        let tid = Environment::current()?.tid();
        self.inner.lock().try_enter(tid, opt)
    }

    fn enter(&self, opt: RwLockIntent) -> Result<(), StrandError> {
        let thread = Environment::current()?;
        let tid = thread.tid();

        {
            let mut rw = self.inner.lock();
            if rw.try_enter(tid, opt)? {
                return Ok(());
            }
            rw.queue.push_back((tid, opt));
        }

        trace!("{} waits for {:?} on rwsem {:p}", tid, opt, self);
        loop {
            if let Err(e) = thread.block() {
                self.inner.lock().queue.retain(|&(w, _)| w != tid);
                return Err(e);
            }
            // Whoever admitted us removed us from the queue.
            if !self.inner.lock().is_queued(tid) {
                return Ok(());
            }
        }
    }

    fn wake(&self, thread: &ThreadControlBlock, tids: Vec<ThreadId>) {
        match tids.len() {
            0 => {}
            1 => thread.make_runnable(tids[0]),
            _ => thread.make_all_runnable(tids),
        }
    }
}
