// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A thread scheduler with support for synchronization primitives.
//!
//! Threads are created through a [`scheduler::SmpScheduler`] and cooperate
//! with it by yielding requests (sleep, block, wake, join, exit). On top of
//! that the crate provides:
//!
//! * [`mutex::Mutex`]: plain and recursive mutual exclusion with ownership handoff
//! * [`rwsem::RwSemaphore`]: a FIFO reader/writer semaphore
//! * [`once::Once`]: a guard that runs an initializer exactly once
//! * [`tls`]: thread-local storage keys with destructors that run on thread exit
//!
//! Code running inside a scheduler thread reaches its own control block
//! through [`tcb::Environment`].

pub mod config;
pub mod error;
mod generator;
pub mod mutex;
pub mod once;
pub mod rwsem;
pub mod scheduler;
pub mod tcb;
pub mod threads;
pub mod tls;

pub use crate::error::StrandError;
pub use crate::threads::{ExitStatus, Priority, ThreadId, ThreadState};

/// Type to represent a core id for the scheduler.
pub type CoreId = usize;

/// How many cores a single scheduler can drive.
pub const MAX_CORES: usize = 16;
