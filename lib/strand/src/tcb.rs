// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-thread state that lives on the thread's own side of the scheduler.
//!
//! Every thread installs its `ThreadControlBlock` before running its entry
//! function; code running in the thread reaches it through `Environment`.
//! All interaction with the scheduler happens by suspending the thread with
//! a `YieldRequest`.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::error::StrandError;
use crate::generator::{Cancelled, Yielder};
use crate::threads::{
    ExitStatus, Priority, ThreadArg, ThreadId, ThreadStart, YieldRequest, YieldResume,
};
use crate::tls::ThreadSlots;
use crate::CoreId;

thread_local! {
    static TCB: Cell<*const ThreadControlBlock> = Cell::new(ptr::null());
}

/// Payload used to unwind a thread that called `exit`.
struct ThreadExit(usize);

/// Per thread state of the scheduler.
pub struct ThreadControlBlock {
    /// Thread ID.
    tid: ThreadId,
    /// Core affinity.
    current_core: CoreId,
    /// Priority the thread was created with (inherited by `spawn`).
    priority: Priority,
    /// Our yielder for communicating to the scheduler.
    yielder: Yielder,
    /// Thread-local storage values.
    pub(crate) tls: ThreadSlots,
}

impl ThreadControlBlock {
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    pub fn current_core(&self) -> CoreId {
        self.current_core
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub(crate) fn suspend(&self, request: YieldRequest) -> YieldResume {
        self.yielder.suspend(request)
    }

    /// Spawns a thread on the current core with our own priority.
    pub fn spawn<F>(&self, f: F, arg: *mut u8) -> Result<ThreadId, StrandError>
    where
        F: 'static + FnOnce(*mut u8) -> usize + Send,
    {
        self.spawn_with(f, arg, self.priority, self.current_core)
    }

    pub fn spawn_with<F>(
        &self,
        f: F,
        arg: *mut u8,
        priority: Priority,
        core_id: CoreId,
    ) -> Result<ThreadId, StrandError>
    where
        F: 'static + FnOnce(*mut u8) -> usize + Send,
    {
        let arg = ThreadArg::new(arg);
        let start: ThreadStart = Box::new(move || f(arg.into_inner()));
        match self.suspend(YieldRequest::Spawn(start, priority, core_id)) {
            YieldResume::Spawned(tid) => Ok(tid),
            YieldResume::Failed(e) => Err(e),
            _ => Err(StrandError::Cancelled),
        }
    }

    /// Gives up the rest of our time-slice, we get to run again after
    /// everything queued at the same priority.
    pub fn yield_now(&self) {
        self.suspend(YieldRequest::None);
    }

    /// Sleeps for at least `d`.
    ///
    /// A `d` that overflows `Instant` sleeps forever.
    pub fn sleep(&self, d: Duration) {
        let request = YieldRequest::Timeout(Instant::now().checked_add(d));
        self.suspend(request);
    }

    /// Deschedules the calling thread until someone makes it runnable again.
    ///
    /// Returns immediately if a wakeup arrived since the last `block`.
    /// Callers must re-check the condition they wait for.
    pub fn block(&self) -> Result<(), StrandError> {
        match self.suspend(YieldRequest::Block) {
            YieldResume::DoNotResume => Err(StrandError::Cancelled),
            _ => Ok(()),
        }
    }

    pub fn make_runnable(&self, tid: ThreadId) {
        self.suspend(YieldRequest::Runnable(tid));
    }

    pub fn make_all_runnable(&self, tids: Vec<ThreadId>) {
        if !tids.is_empty() {
            self.suspend(YieldRequest::RunnableList(tids));
        }
    }

    /// Waits until `tid` has exited and returns its exit status.
    ///
    /// A thread can be joined successfully only once (all threads blocked in
    /// `join` at the time it exits count as that one join).
    pub fn join(&self, tid: ThreadId) -> Result<ExitStatus, StrandError> {
        loop {
            match self.suspend(YieldRequest::JoinOn(tid)) {
                YieldResume::Joined(status) => return Ok(status),
                YieldResume::Failed(e) => return Err(e),
                YieldResume::DoNotResume => return Err(StrandError::Cancelled),
                // Woken up by something else, try again:
                r => trace!("{} spurious wakeup ({:?}) while joining {}", self.tid, r, tid),
            }
        }
    }

    /// Terminates the calling thread with `value` as its exit status.
    ///
    /// Unwinds the thread's stack, TLS destructors run before any
    /// joiner is released.
    pub fn exit(&self, value: usize) -> ! {
        panic::resume_unwind(Box::new(ThreadExit(value)))
    }
}

/// Runs a thread on its backing context: installs the TCB, runs the entry
/// point, the TLS destructors and finally reports the exit to the scheduler.
pub(crate) fn thread_main(
    tid: ThreadId,
    core_id: CoreId,
    priority: Priority,
    start: ThreadStart,
    yielder: Yielder,
) {
    let tcb = ThreadControlBlock {
        tid,
        current_core: core_id,
        priority,
        yielder,
        tls: ThreadSlots::new(),
    };
    TCB.with(|t| t.set(&tcb as *const ThreadControlBlock));

    let status = match panic::catch_unwind(AssertUnwindSafe(start)) {
        Ok(value) => Some(ExitStatus::Value(value)),
        Err(payload) => {
            if payload.is::<Cancelled>() {
                trace!("{} was cancelled", tid);
                None
            } else if let Some(exit) = payload.downcast_ref::<ThreadExit>() {
                Some(ExitStatus::Value(exit.0))
            } else {
                warn!("{} terminated by an unhandled panic", tid);
                Some(ExitStatus::Abnormal)
            }
        }
    };

    match status {
        Some(status) if !tcb.yielder.is_cancelled() => {
            tcb.tls.run_destructors(tid);
            tcb.suspend(YieldRequest::Exit(status));
        }
        _ => tcb.tls.release(),
    }

    TCB.with(|t| t.set(ptr::null()));
}

/// Convenience function to access the TCB.
pub struct Environment {}

impl Environment {
    /// The TCB of the calling thread, if it runs inside a scheduler.
    pub fn current<'a>() -> Result<&'a ThreadControlBlock, StrandError> {
        let tcb = TCB.with(|t| t.get());
        if tcb.is_null() {
            Err(StrandError::NoThreadContext)
        } else {
            // Safety: the TCB lives on the thread's own stack until
            // `thread_main` returns, and it's never shared with other threads.
            Ok(unsafe { &*tcb })
        }
    }

    /// The TCB of the calling thread.
    ///
    /// # Panics
    /// If called outside of a scheduler thread.
    pub fn thread<'a>() -> &'a ThreadControlBlock {
        Environment::current().expect("Don't have TCB available?")
    }

    pub fn tid() -> ThreadId {
        Environment::thread().tid
    }
}
