// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Execution contexts that behave like generators.
//!
//! Every thread runs on its own backing OS thread, but it only ever makes
//! progress while the scheduler resumes it: `Generator::resume` hands a
//! `YieldResume` to the thread and waits until the thread suspends itself
//! again with the next `YieldRequest` (through its `Yielder`).
//!
//! The two sides exchange values through single-slot mailboxes and wake each
//! other with a parker/unparker pair, so the hand-off does not depend on
//! which OS thread happens to drive the scheduler.

use std::cell::Cell;
use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::sync::{Parker, Unparker};
use log::trace;

use crate::threads::{YieldRequest, YieldResume};

/// Mailboxes shared by a generator and its yielder.
struct Exchange {
    /// Scheduler -> thread.
    resume: ArrayQueue<YieldResume>,
    /// Thread -> scheduler.
    request: ArrayQueue<YieldRequest>,
    /// Wakes whoever waits in `Generator::resume`.
    scheduler: Unparker,
    /// Wakes the backing thread.
    thread: Unparker,
}

impl Exchange {
    fn post_resume(&self, value: YieldResume) {
        assert!(
            self.resume.push(value).is_ok(),
            "Resumed a thread that did not suspend?"
        );
        self.thread.unpark();
    }

    fn post_request(&self, request: YieldRequest) {
        assert!(
            self.request.push(request).is_ok(),
            "Suspended a thread that was not resumed?"
        );
        self.scheduler.unpark();
    }
}

/// The scheduler's handle to a thread's execution context.
pub(crate) struct Generator {
    exchange: Arc<Exchange>,
    parker: Parker,
    handle: Option<thread::JoinHandle<()>>,
}

impl Generator {
    /// Creates a new execution context that runs `f` on a backing thread
    /// with `stack_size` bytes of stack.
    ///
    /// `f` does not start before the first call to `resume`.
    pub(crate) fn new<F>(name: String, stack_size: usize, f: F) -> io::Result<Generator>
    where
        F: FnOnce(Yielder) + Send + 'static,
    {
        let parker = Parker::new();
        let thread_parker = Parker::new();
        let exchange = Arc::new(Exchange {
            resume: ArrayQueue::new(1),
            request: ArrayQueue::new(1),
            scheduler: parker.unparker().clone(),
            thread: thread_parker.unparker().clone(),
        });

        let yielder = Yielder {
            exchange: exchange.clone(),
            parker: thread_parker,
            cancelled: Cell::new(false),
        };

        let handle = thread::Builder::new()
            .name(name)
            .stack_size(stack_size)
            .spawn(move || {
                // Wait for the first dispatch:
                if yielder.wait_for_resume() == YieldResume::DoNotResume {
                    trace!("Generator dropped before it ever ran.");
                    return;
                }
                f(yielder)
            })?;

        Ok(Generator {
            exchange,
            parker,
            handle: Some(handle),
        })
    }

    /// Runs the thread until it suspends with the next request.
    ///
    /// Returns `None` if the backing thread terminated without sending
    /// a final request.
    pub(crate) fn resume(&mut self, value: YieldResume) -> Option<YieldRequest> {
        self.exchange.post_resume(value);
        loop {
            if let Some(request) = self.exchange.request.pop() {
                return Some(request);
            }
            if self.handle.as_ref().map_or(true, |h| h.is_finished()) {
                // The thread may have posted right before it finished:
                return self.exchange.request.pop();
            }
            self.parker.park();
        }
    }

    /// Lets the backing thread of a finished generator run to its end.
    pub(crate) fn complete(mut self) {
        self.exchange.post_resume(YieldResume::DoNotResume);
        if let Some(handle) = self.handle.take() {
            let _r = handle.join();
        }
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        if self.handle.take().is_some() {
            // Still suspended somewhere: tell it to unwind and detach.
            trace!("Dropping a suspended generator");
            let _r = self.exchange.resume.push(YieldResume::DoNotResume);
            self.exchange.thread.unpark();
        }
    }
}

/// Payload used to unwind a thread whose scheduler went away.
pub(crate) struct Cancelled;

/// The thread-side end of a `Generator`.
pub(crate) struct Yielder {
    exchange: Arc<Exchange>,
    parker: Parker,
    cancelled: Cell<bool>,
}

impl Yielder {
    fn wait_for_resume(&self) -> YieldResume {
        loop {
            if let Some(value) = self.exchange.resume.pop() {
                return value;
            }
            self.parker.park();
        }
    }

    /// Hands `request` to the scheduler and waits until we're resumed again.
    ///
    /// If the scheduler is gone this unwinds the thread (once) with a
    /// `Cancelled` payload; afterwards it keeps returning `DoNotResume`.
    pub(crate) fn suspend(&self, request: YieldRequest) -> YieldResume {
        if self.cancelled.get() {
            return YieldResume::DoNotResume;
        }

        let is_exit = matches!(request, YieldRequest::Exit(_));
        self.exchange.post_request(request);
        let value = self.wait_for_resume();

        if value == YieldResume::DoNotResume && !is_exit {
            self.cancelled.set(true);
            if !thread::panicking() {
                std::panic::resume_unwind(Box::new(Cancelled));
            }
        }
        value
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}
