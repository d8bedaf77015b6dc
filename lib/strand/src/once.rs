// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A guard that runs an initializer exactly once.

use log::trace;

use crate::error::StrandError;
use crate::tcb::{Environment, ThreadControlBlock};
use crate::threads::ThreadId;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum OnceState {
    NotStarted,
    /// The initializer runs on the given thread.
    InProgress(ThreadId),
    Completed,
}

#[derive(Debug)]
struct OnceInner {
    state: OnceState,
    /// Threads that arrived while the initializer was running.
    waiters: Vec<ThreadId>,
}

#[derive(Debug)]
pub struct Once {
    inner: spin::Mutex<OnceInner>,
}

impl Default for Once {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes the outcome of the initializer, also when it unwinds.
struct Finish<'a> {
    once: &'a Once,
    thread: &'a ThreadControlBlock,
    completed: bool,
}

impl<'a> Drop for Finish<'a> {
    fn drop(&mut self) {
        let waiters = {
            let mut inner = self.once.inner.lock();
            inner.state = if self.completed {
                OnceState::Completed
            } else {
                trace!("Once initializer of {} unwound", self.thread.tid());
                OnceState::NotStarted
            };
            std::mem::take(&mut inner.waiters)
        };
        self.thread.make_all_runnable(waiters);
    }
}

impl Once {
    pub const fn new() -> Once {
        Once {
            inner: spin::Mutex::new(OnceInner {
                state: OnceState::NotStarted,
                waiters: Vec::new(),
            }),
        }
    }

    /// Runs `f` unless it already ran to completion on this guard.
    ///
    /// Callers that arrive while another thread runs `f` block until it is
    /// done. If `f` panics the guard is reset and one of the waiters gets
    /// to run its own initializer.
    pub fn call_once<F: FnOnce()>(&self, f: F) -> Result<(), StrandError> {
        let thread = Environment::current()?;
        let tid = thread.tid();

        loop {
            {
                let mut inner = self.inner.lock();
                match inner.state {
                    OnceState::Completed => return Ok(()),
                    OnceState::NotStarted => {
                        inner.state = OnceState::InProgress(tid);
                        break;
                    }
                    OnceState::InProgress(owner) if owner == tid => {
                        return Err(StrandError::Deadlock)
                    }
                    OnceState::InProgress(_owner) => {
                        if !inner.waiters.contains(&tid) {
                            inner.waiters.push(tid);
                        }
                    }
                }
            }

            if let Err(e) = thread.block() {
                self.inner.lock().waiters.retain(|&w| w != tid);
                return Err(e);
            }
        }

        let mut finish = Finish {
            once: self,
            thread,
            completed: false,
        };
        f();
        finish.completed = true;
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.inner.lock().state == OnceState::Completed
    }
}
