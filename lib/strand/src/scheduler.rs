// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The core logic of the scheduler.
//!
//! Has the following properties:
//! * Cooperative scheduling (threads can yield voluntarily)
//! * Priority scheduling, round robin within a priority level (per-core)
//! * Per core run and wait lists
//! * Thread affinity can be defined upon thread creation (currently no migration)
//! * Waitlist is sorted according to thread wake-up times.
//!
//! A thread talks to the scheduler only through `YieldRequest`s. The state
//! change a request causes (blocking, sleeping, being requeued) is applied
//! only after the thread's generator has been put back, so whoever wakes
//! the thread concurrently always finds it dispatchable.

use std::collections::{BTreeMap, VecDeque};
use std::ptr;
use std::thread;
use std::time::Instant;

use arr_macro::arr;
use crossbeam_utils::CachePadded;
use log::{debug, error, trace, warn};

use crate::config::SchedulerConfig;
use crate::error::StrandError;
use crate::generator::Generator;
use crate::tcb;
use crate::threads::{
    BlockedOn, ExitStatus, Priority, Runnable, Thread, ThreadArg, ThreadId, ThreadStart,
    ThreadState, ThreadTable, YieldRequest, YieldResume,
};
use crate::{CoreId, MAX_CORES};

/// Runnable threads of a core, grouped by priority.
///
/// Levels never contain an empty queue.
#[derive(Debug, Default)]
struct RunQueue {
    levels: BTreeMap<Priority, VecDeque<ThreadId>>,
}

impl RunQueue {
    const fn new() -> Self {
        RunQueue {
            levels: BTreeMap::new(),
        }
    }

    fn push_back(&mut self, priority: Priority, tid: ThreadId) {
        self.levels.entry(priority).or_default().push_back(tid);
    }

    /// Removes the first thread of the most important level.
    fn pop_front(&mut self) -> Option<ThreadId> {
        let mut level = self.levels.first_entry()?;
        let tid = level.get_mut().pop_front();
        if level.get().is_empty() {
            level.remove();
        }
        tid
    }

    /// Removes `tid`, returns whether it was queued.
    fn remove(&mut self, tid: ThreadId) -> bool {
        let mut found = false;
        for queue in self.levels.values_mut() {
            let before = queue.len();
            queue.retain(|&ltid| ltid != tid);
            found |= queue.len() != before;
        }
        self.levels.retain(|_prio, queue| !queue.is_empty());
        found
    }

    fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

/// Scheduler per-core state.
///
/// # Lock order
/// `SmpScheduler::threads` before `waiting` before `runnable`.
struct SchedulerCoreState {
    /// Per-core list of runnable threads.
    ///
    /// Protected by a mutex since anyone could put threads here.
    runnable: spin::Mutex<RunQueue>,

    /// Per-core list of `waiting` threads, the earliest deadline is last.
    ///
    /// Protected by a mutex because anyone could put threads here.
    waiting: spin::Mutex<Vec<(Instant, ThreadId)>>,
}

impl SchedulerCoreState {
    fn new() -> Self {
        SchedulerCoreState {
            runnable: spin::Mutex::new(RunQueue::new()),
            waiting: spin::Mutex::new(Vec::new()),
        }
    }
}

/// How the state of a thread changes once it is off the core.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Transition {
    /// Back to the end of its run queue level.
    Requeue,
    /// Wait until someone makes the thread runnable.
    Block,
    /// Wait for termination of the given thread.
    Join(ThreadId),
    /// Wait in the waitlist until the deadline passed, or forever.
    Sleep(Option<Instant>),
}

/// What `dispatch` does after a yield request was handled.
#[derive(Debug)]
enum Switch {
    /// Continue running the thread with the given response.
    Resume(YieldResume),
    /// Context-switch away from the thread.
    Park(Transition),
    /// The thread is gone for good.
    Terminate(ExitStatus),
}

pub struct SmpScheduler {
    /// All thread generators need to dispatch threads.
    ///
    /// These will be absent if currently in use.
    generators: spin::Mutex<hashbrown::HashMap<ThreadId, Runnable>>,
    /// All thread control blocks of the scheduler (including exited
    /// threads that have not been joined yet).
    threads: spin::Mutex<ThreadTable>,
    /// Per-core scheduler state
    per_core: [CachePadded<SchedulerCoreState>; MAX_CORES],
    config: SchedulerConfig,
}

impl Default for SmpScheduler {
    fn default() -> Self {
        SmpScheduler::with_config(Default::default())
    }
}

impl Drop for SmpScheduler {
    fn drop(&mut self) {
        // Suspended threads unwind once their generators are gone.
        let generators = self.generators.get_mut();
        if !generators.is_empty() {
            debug!("Cancelling {} unfinished thread(s)", generators.len());
        }
        generators.clear();
    }
}

impl SmpScheduler {
    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            generators: spin::Mutex::new(hashbrown::HashMap::with_capacity(config.max_threads)),
            threads: spin::Mutex::new(ThreadTable::with_capacity(config.max_threads)),
            per_core: arr![CachePadded::new(SchedulerCoreState::new()); 16], // MAX_CORES
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Creates a new thread that runs `f(arg)` on core `affinity`.
    ///
    /// The value returned by `f` becomes the thread's exit value.
    pub fn spawn<F>(
        &self,
        f: F,
        arg: *mut u8,
        priority: Priority,
        affinity: CoreId,
    ) -> Result<ThreadId, StrandError>
    where
        F: 'static + FnOnce(*mut u8) -> usize + Send,
    {
        let arg = ThreadArg::new(arg);
        self.spawn_start(Box::new(move || f(arg.into_inner())), priority, affinity)
    }

    /// `spawn` with the configured default priority.
    pub fn spawn_on<F>(&self, f: F, affinity: CoreId) -> Result<ThreadId, StrandError>
    where
        F: 'static + FnOnce(*mut u8) -> usize + Send,
    {
        self.spawn(f, ptr::null_mut(), self.config.default_priority, affinity)
    }

    fn spawn_start(
        &self,
        start: ThreadStart,
        priority: Priority,
        affinity: CoreId,
    ) -> Result<ThreadId, StrandError> {
        if affinity >= MAX_CORES {
            return Err(StrandError::InvalidAffinity { core: affinity });
        }

        let tid = self
            .threads
            .lock()
            .insert(|tid| Thread::new(tid, affinity, priority))?;

        let generator = Generator::new(
            format!("strand-{}.{}", tid.slot(), tid.generation()),
            self.config.stack_size,
            move |yielder| tcb::thread_main(tid, affinity, priority, start, yielder),
        );
        let generator = match generator {
            Ok(generator) => generator,
            Err(e) => {
                error!("Can't create execution context for {}: {}", tid, e);
                self.threads.lock().reclaim(tid);
                return Err(StrandError::ResourceExhausted);
            }
        };

        trace!("Spawned {} on core {} with {:?}", tid, affinity, priority);
        self.generators.lock().insert(tid, generator);
        self.mark_runnable(tid, affinity, priority);
        Ok(tid)
    }

    /// Marks a thread as runnable by inserting it into
    /// `runnable`.
    fn mark_runnable(&self, tid: ThreadId, affinity: CoreId, priority: Priority) {
        self.per_core[affinity]
            .runnable
            .lock()
            .push_back(priority, tid);
    }

    /// Insert thread in a sorted waitlist
    fn waitlist_insert(&self, tid: ThreadId, affinity: CoreId, until: Instant) {
        let mut waiting = self.per_core[affinity].waiting.lock();
        let to_insert = (until, tid);
        match waiting.binary_search_by(|entry| entry.cmp(&to_insert).reverse()) {
            Err(pos) => waiting.insert(pos, to_insert),
            Ok(_pos) => panic!("Thread already in waitlist?"),
        }
        trace!("Waitlist is {:?}", waiting);
    }

    /// Wakes `tid` if it is blocked on a primitive, otherwise remembers the
    /// wakeup for its next `YieldRequest::Block`.
    fn wake_locked(&self, threads: &mut ThreadTable, tid: ThreadId) {
        let thread = match threads.get_mut(tid) {
            Some(thread) => thread,
            None => {
                trace!("Ignoring wakeup of unknown {}", tid);
                return;
            }
        };

        match thread.state {
            ThreadState::Blocked(BlockedOn::Primitive) => {
                thread.state = ThreadState::Ready;
                thread.return_with = Some(YieldResume::Completed);
                self.mark_runnable(tid, thread.affinity, thread.priority);
            }
            ThreadState::Exited(_) => {}
            _ => thread.wakeup_pending = true,
        }
    }

    /// Handles a yield request of the thread given by `tid`.
    ///
    /// Updates run and waitlists accordingly.
    fn handle_yield_request(&self, tid: ThreadId, result: Option<YieldRequest>) -> Switch {
        match result {
            None => {
                warn!("Thread {} terminated without an exit request.", tid);
                Switch::Terminate(ExitStatus::Abnormal)
            }
            Some(YieldRequest::None) => {
                trace!(
                    "Thread {} has voluntarily yielded its time (YieldRequest::None).",
                    tid
                );
                Switch::Park(Transition::Requeue)
            }
            Some(YieldRequest::Timeout(until)) => {
                trace!(
                    "The thread {} has suspended itself for {:?}.",
                    tid,
                    until.map(|u| u.saturating_duration_since(Instant::now())),
                );
                Switch::Park(Transition::Sleep(until))
            }
            Some(YieldRequest::Block) => {
                let mut threads = self.threads.lock();
                let thread = threads.get_mut(tid).expect("Can't find thread state?");
                if thread.wakeup_pending {
                    // Somebody already woke us, no need to switch.
                    thread.wakeup_pending = false;
                    Switch::Resume(YieldResume::Completed)
                } else {
                    Switch::Park(Transition::Block)
                }
            }
            Some(YieldRequest::Runnable(rtid)) => {
                trace!("YieldRequest::Runnable {}", rtid);
                let mut threads = self.threads.lock();
                self.wake_locked(&mut threads, rtid);
                Switch::Resume(YieldResume::Completed)
            }
            Some(YieldRequest::RunnableList(rtids)) => {
                trace!("YieldRequest::RunnableList {:?}", rtids);
                let mut threads = self.threads.lock();
                for rtid in rtids {
                    self.wake_locked(&mut threads, rtid);
                }
                Switch::Resume(YieldResume::Completed)
            }
            Some(YieldRequest::Spawn(start, priority, affinity)) => {
                match self.spawn_start(start, priority, affinity) {
                    Ok(ntid) => Switch::Resume(YieldResume::Spawned(ntid)),
                    Err(e) => Switch::Resume(YieldResume::Failed(e)),
                }
            }
            Some(YieldRequest::JoinOn(target)) => self.join_request(tid, target),
            Some(YieldRequest::Exit(status)) => {
                trace!("Thread {} has terminated with {:?}.", tid, status);
                Switch::Terminate(status)
            }
        }
    }

    fn join_request(&self, tid: ThreadId, target: ThreadId) -> Switch {
        if tid == target {
            return Switch::Resume(YieldResume::Failed(StrandError::Deadlock));
        }

        let mut threads = self.threads.lock();
        match threads.get_mut(target) {
            Some(t) if t.detached => Switch::Resume(YieldResume::Failed(StrandError::InvalidHandle)),
            Some(t) => match t.state {
                ThreadState::Exited(status) => {
                    threads.reclaim(target);
                    Switch::Resume(YieldResume::Joined(status))
                }
                _ => {
                    if !t.joiners.contains(&tid) {
                        t.joiners.push(tid);
                    }
                    Switch::Park(Transition::Join(target))
                }
            },
            None => Switch::Resume(YieldResume::Failed(StrandError::InvalidHandle)),
        }
    }

    /// Marks `tid` as exited and releases its joiners.
    ///
    /// The TCB stays around (as a zombie) until it is joined or detached.
    fn terminate(&self, tid: ThreadId, status: ExitStatus) {
        let mut threads = self.threads.lock();
        let thread = threads.get_mut(tid).expect("Can't find thread state?");
        thread.state = ThreadState::Exited(status);
        let joiners = std::mem::take(&mut thread.joiners);
        if thread.detached || !joiners.is_empty() {
            threads.reclaim(tid);
        }

        for jtid in joiners {
            if let Some(joiner) = threads.get_mut(jtid) {
                joiner.return_with = Some(YieldResume::Joined(status));
                if joiner.state == ThreadState::Blocked(BlockedOn::Join(tid)) {
                    joiner.state = ThreadState::Ready;
                    self.mark_runnable(jtid, joiner.affinity, joiner.priority);
                }
                // else: still on its way to `Transition::Join`, which
                // finds `return_with` set.
            }
        }
    }

    fn apply_transition(&self, tid: ThreadId, transition: Transition) {
        let mut threads = self.threads.lock();
        let thread = threads.get_mut(tid).expect("Can't find thread state?");

        let runnable = match transition {
            Transition::Requeue => true,
            Transition::Block if thread.wakeup_pending => {
                thread.wakeup_pending = false;
                thread.return_with = Some(YieldResume::Completed);
                true
            }
            Transition::Block => {
                thread.state = ThreadState::Blocked(BlockedOn::Primitive);
                false
            }
            Transition::Join(_target) if thread.return_with.is_some() => true,
            Transition::Join(target) => {
                thread.state = ThreadState::Blocked(BlockedOn::Join(target));
                false
            }
            Transition::Sleep(until) => {
                thread.state = ThreadState::Blocked(BlockedOn::Sleep);
                if let Some(until) = until {
                    self.waitlist_insert(tid, thread.affinity, until);
                }
                false
            }
        };

        if runnable {
            thread.state = ThreadState::Ready;
            self.mark_runnable(tid, thread.affinity, thread.priority);
        }
    }

    /// Finds threads with expired timeouts and re-inserts them from `waiting` into `runnable`
    fn check_wakeups(&self, affinity: CoreId) {
        let now = Instant::now();
        let expired: Vec<ThreadId> = {
            let mut waiting = self.per_core[affinity].waiting.lock();
            let mut expired = Vec::new();
            while waiting.last().map_or(false, |&(until, _tid)| until <= now) {
                if let Some((_wakeup, tid)) = waiting.pop() {
                    expired.push(tid);
                }
            }
            expired
        };
        if expired.is_empty() {
            return;
        }

        let mut threads = self.threads.lock();
        for tid in expired {
            if let Some(thread) = threads.get_mut(tid) {
                if thread.state == ThreadState::Blocked(BlockedOn::Sleep) {
                    thread.state = ThreadState::Ready;
                    self.mark_runnable(tid, thread.affinity, thread.priority);
                }
            }
        }
    }

    /// Earliest wake-up time of the sleeping threads of `affinity`.
    fn next_deadline(&self, affinity: CoreId) -> Option<Instant> {
        self.per_core[affinity]
            .waiting
            .lock()
            .last()
            .map(|&(until, _tid)| until)
    }

    /// Dispatches the next thread of `core_id`, runs it until it
    /// context-switches or terminates.
    ///
    /// Returns false if no thread was runnable.
    fn dispatch(&self, core_id: CoreId) -> bool {
        // The next thread ID we want to run
        let tid = match self.per_core[core_id].runnable.lock().pop_front() {
            Some(tid) => tid,
            None => return false,
        };

        let mut generator = self
            .generators
            .lock()
            .remove(&tid)
            .expect("Can't find thread state?");

        let mut resume_action: YieldResume = {
            let mut threads = self.threads.lock();
            let thread = threads.get_mut(tid).expect("Can't find thread state?");
            trace!("Thread = {:?}", thread);
            thread.state = ThreadState::Running;
            thread.return_with.take().unwrap_or(YieldResume::Interrupted)
        };

        // Run the thread until `handle_yield_request` decides on a context-switch
        // or the thread is done:
        loop {
            trace!("generator.resume = {:?}", resume_action);
            let yielded_with = generator.resume(resume_action);
            trace!("yielded_with = {:?}", yielded_with);
            match self.handle_yield_request(tid, yielded_with) {
                Switch::Resume(action) => resume_action = action,
                Switch::Park(transition) => {
                    // Put the generator back before anyone can dispatch it again:
                    self.generators.lock().insert(tid, generator);
                    self.apply_transition(tid, transition);
                    break;
                }
                Switch::Terminate(status) => {
                    self.terminate(tid, status);
                    generator.complete();
                    break;
                }
            }
        }

        true
    }

    /// Dispatches threads of `core_id` until its run queue is empty.
    ///
    /// Also checks if any waiting threads need to be woken up.
    /// Returns immediately if no thread is runnable.
    ///
    /// # Panics
    /// If `core_id` is not below `MAX_CORES`.
    pub fn run(&self, core_id: CoreId) {
        assert!(core_id < MAX_CORES, "Core {} is out of range.", core_id);
        loop {
            self.check_wakeups(core_id);
            if !self.dispatch(core_id) {
                break;
            }
        }
    }

    /// Like `run`, but waits for sleeping threads as well.
    ///
    /// Returns once `core_id` has neither runnable nor sleeping threads.
    /// Threads blocked on a primitive or a join do not keep it going,
    /// neither do threads sleeping past the largest representable `Instant`.
    ///
    /// # Panics
    /// If `core_id` is not below `MAX_CORES`.
    pub fn run_until_idle(&self, core_id: CoreId) {
        loop {
            self.run(core_id);
            if !self.per_core[core_id].runnable.lock().is_empty() {
                continue;
            }
            match self.next_deadline(core_id) {
                Some(until) => thread::sleep(until.saturating_duration_since(Instant::now())),
                None => break,
            }
        }
    }

    /// Non-blocking join for callers outside of the scheduler.
    ///
    /// Returns `Ok(None)` while `tid` is still alive. Reclaims `tid` once
    /// it returned its exit status.
    pub fn try_join(&self, tid: ThreadId) -> Result<Option<ExitStatus>, StrandError> {
        let mut threads = self.threads.lock();
        match threads.get(tid) {
            Some(t) if t.detached => Err(StrandError::InvalidHandle),
            Some(t) => match t.state {
                ThreadState::Exited(status) => {
                    threads.reclaim(tid);
                    Ok(Some(status))
                }
                _ => Ok(None),
            },
            None => Err(StrandError::InvalidHandle),
        }
    }

    /// Makes sure `tid` gets reclaimed without a join once it exits.
    pub fn detach(&self, tid: ThreadId) -> Result<(), StrandError> {
        let mut threads = self.threads.lock();
        let thread = threads.get_mut(tid).ok_or(StrandError::InvalidHandle)?;
        if thread.detached {
            return Err(StrandError::InvalidHandle);
        }

        if thread.has_exited() {
            threads.reclaim(tid);
        } else {
            thread.detached = true;
        }
        Ok(())
    }

    pub fn state(&self, tid: ThreadId) -> Result<ThreadState, StrandError> {
        self.threads
            .lock()
            .get(tid)
            .map(|t| t.state)
            .ok_or(StrandError::InvalidHandle)
    }

    /// Number of thread control blocks, including exited threads that
    /// still wait for a join.
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Changes the priority of `tid`, a queued thread moves to the new level.
    pub fn set_priority(&self, tid: ThreadId, priority: Priority) -> Result<(), StrandError> {
        let mut threads = self.threads.lock();
        let thread = threads.get_mut(tid).ok_or(StrandError::InvalidHandle)?;
        if thread.has_exited() {
            return Err(StrandError::InvalidState);
        }

        let old = thread.priority;
        thread.priority = priority;
        if old != priority && thread.state == ThreadState::Ready {
            let mut runnable = self.per_core[thread.affinity].runnable.lock();
            if runnable.remove(tid) {
                runnable.push_back(priority, tid);
            }
        }
        Ok(())
    }
}
