// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use core::fmt;
use core::hash::{Hash, Hasher};
use std::time::Instant;

use crate::error::StrandError;
use crate::generator::Generator;
use crate::CoreId;

/// Type alias for the execution context the scheduler resumes.
pub(crate) type Runnable = Generator;

/// Entry point of a thread (function and argument already bound together).
pub(crate) type ThreadStart = Box<dyn FnOnce() -> usize + Send + 'static>;

/// The id of a thread.
///
/// Ids are generation checked: once a thread is reclaimed its slot may be
/// reused, but the old id will never match the new occupant.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ThreadId {
    slot: u32,
    generation: u32,
}

impl ThreadId {
    pub(crate) fn new(slot: usize, generation: u32) -> ThreadId {
        ThreadId {
            slot: slot as u32,
            generation,
        }
    }

    /// Index of the thread control block in the scheduler's table.
    pub fn slot(&self) -> usize {
        self.slot as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Hash for ThreadId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ThreadId {{ slot={} gen={} }}", self.slot, self.generation)
    }
}

/// Scheduling priority of a thread, lower values are dispatched first.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Priority(pub u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const DEFAULT: Priority = Priority(10);
    pub const LOWEST: Priority = Priority(u8::MAX);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::DEFAULT
    }
}

/// What a thread left behind when it terminated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitStatus {
    /// Returned from its entry function or called `exit` with a value.
    Value(usize),
    /// Terminated because of an unhandled panic.
    Abnormal,
}

/// What a blocked thread is waiting for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockedOn {
    /// A synchronization primitive (mutex, rwsem, once-guard).
    Primitive,
    /// A timeout in the waitlist.
    Sleep,
    /// Termination of the given thread.
    Join(ThreadId),
}

/// Life-cycle of a thread.
///
/// `Ready -> Running -> {Ready, Blocked, Exited}` and `Blocked -> Ready`.
/// `Exited` is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThreadState {
    Ready,
    Running,
    Blocked(BlockedOn),
    Exited(ExitStatus),
}

/// Scheduler-side bookkeeping of a thread.
pub(crate) struct Thread {
    pub(crate) id: ThreadId,
    pub(crate) affinity: CoreId,
    pub(crate) priority: Priority,
    pub(crate) state: ThreadState,

    /// Value handed to the thread the next time it gets dispatched.
    pub(crate) return_with: Option<YieldResume>,

    /// A wakeup that arrived while the thread was not blocked (yet).
    ///
    /// Consumed by the next `YieldRequest::Block`, which then returns
    /// immediately instead of descheduling the thread.
    pub(crate) wakeup_pending: bool,

    /// Threads blocked in a join on this thread.
    pub(crate) joiners: Vec<ThreadId>,

    /// Reclaim the TCB on exit instead of waiting for a join.
    pub(crate) detached: bool,
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Thread#{}:{} {:?}", self.id.slot, self.id.generation, self.state)
    }
}

impl Thread {
    pub(crate) fn new(id: ThreadId, affinity: CoreId, priority: Priority) -> Thread {
        Thread {
            id,
            affinity,
            priority,
            state: ThreadState::Ready,
            return_with: None,
            wakeup_pending: false,
            joiners: Vec::new(),
            detached: false,
        }
    }

    pub(crate) fn has_exited(&self) -> bool {
        matches!(self.state, ThreadState::Exited(_))
    }
}

struct Slot {
    generation: u32,
    thread: Option<Thread>,
}

/// Arena of all thread control blocks of a scheduler.
///
/// Slots are recycled through a free-list, every reuse bumps the
/// generation so stale `ThreadId`s are rejected.
pub(crate) struct ThreadTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    live: usize,
    capacity: usize,
}

impl ThreadTable {
    pub(crate) fn with_capacity(capacity: usize) -> ThreadTable {
        ThreadTable {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            live: 0,
            capacity,
        }
    }

    /// Allocates a new slot and stores the thread built by `make` in it.
    pub(crate) fn insert<F>(&mut self, make: F) -> Result<ThreadId, StrandError>
    where
        F: FnOnce(ThreadId) -> Thread,
    {
        if self.live >= self.capacity {
            return Err(StrandError::ResourceExhausted);
        }

        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    thread: None,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[idx];
        assert!(slot.thread.is_none(), "Free-list points to a live TCB?");
        slot.generation = slot.generation.wrapping_add(1);
        let tid = ThreadId::new(idx, slot.generation);
        slot.thread = Some(make(tid));
        self.live += 1;
        Ok(tid)
    }

    pub(crate) fn get(&self, tid: ThreadId) -> Option<&Thread> {
        self.slots
            .get(tid.slot())
            .filter(|s| s.generation == tid.generation)
            .and_then(|s| s.thread.as_ref())
    }

    pub(crate) fn get_mut(&mut self, tid: ThreadId) -> Option<&mut Thread> {
        self.slots
            .get_mut(tid.slot())
            .filter(|s| s.generation == tid.generation)
            .and_then(|s| s.thread.as_mut())
    }

    /// Frees the TCB of `tid`.
    ///
    /// # Panics
    /// If `tid` does not refer to a live TCB (double free).
    pub(crate) fn reclaim(&mut self, tid: ThreadId) -> Thread {
        let slot = self
            .slots
            .get_mut(tid.slot())
            .filter(|s| s.generation == tid.generation)
            .unwrap_or_else(|| panic!("Reclaiming unknown TCB {}", tid));
        let thread = slot
            .thread
            .take()
            .unwrap_or_else(|| panic!("TCB {} reclaimed twice", tid));
        self.free.push(tid.slot());
        self.live -= 1;
        thread
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }
}

/// A raw argument pointer that travels with the thread to its backing context.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ThreadArg(*mut u8);

unsafe impl Send for ThreadArg {}

impl ThreadArg {
    pub(crate) fn new(arg: *mut u8) -> ThreadArg {
        ThreadArg(arg)
    }

    pub(crate) fn into_inner(self) -> *mut u8 {
        self.0
    }
}

/// Requests that go from the thread-context to the scheduler.
pub(crate) enum YieldRequest {
    /// Just yield for now.
    None,
    /// Block thread until we reach Instant (`None`: a deadline too far
    /// out to represent, the thread sleeps until cancelled).
    Timeout(Option<Instant>),
    /// Deschedule the calling thread until someone makes it runnable
    /// (returns right away if that already happened).
    Block,
    /// Tell scheduler to make ThreadId runnable.
    Runnable(ThreadId),
    /// Make everything in the given list runnable.
    RunnableList(Vec<ThreadId>),
    /// Spawn a new thread that runs the provided entry point.
    Spawn(ThreadStart, Priority, CoreId),
    /// Wait until the given thread has exited.
    JoinOn(ThreadId),
    /// The thread is done, it will not run again.
    Exit(ExitStatus),
}

impl fmt::Debug for YieldRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            YieldRequest::None => write!(f, "None"),
            YieldRequest::Timeout(until) => write!(f, "Timeout({:?})", until),
            YieldRequest::Block => write!(f, "Block"),
            YieldRequest::Runnable(tid) => write!(f, "Runnable({})", tid),
            YieldRequest::RunnableList(tids) => write!(f, "RunnableList({:?})", tids),
            YieldRequest::Spawn(_, prio, core) => write!(f, "Spawn({:?}, {})", prio, core),
            YieldRequest::JoinOn(tid) => write!(f, "JoinOn({})", tid),
            YieldRequest::Exit(status) => write!(f, "Exit({:?})", status),
        }
    }
}

/// Corresponding response to a thread after we yielded back to
/// the scheduler with a request (see `YieldRequest`)
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum YieldResume {
    /// The request was completed (we immediately resumed without a context switch).
    Completed,
    /// The thread is resumed now after a context switch.
    Interrupted,
    /// A child thread was spawned with the given ThreadId.
    Spawned(ThreadId),
    /// The thread we joined on has terminated.
    Joined(ExitStatus),
    /// The request could not be carried out.
    Failed(StrandError),
    /// Thread has completed (or the scheduler is gone), it must not continue.
    DoNotResume,
}
