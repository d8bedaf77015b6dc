// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tunables of a scheduler instance.

use crate::threads::Priority;

/// Default size of the stack backing every thread.
pub const DEFAULT_STACK_SIZE_BYTES: usize = 64 * 4096;

/// Default upper bound of live thread control blocks per scheduler.
pub const DEFAULT_MAX_THREADS: usize = 1024;

/// Configuration handed to `SmpScheduler::with_config`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct SchedulerConfig {
    /// How many thread control blocks may exist at the same time.
    ///
    /// Exited threads that have not been joined yet still count.
    pub max_threads: usize,
    /// Stack size (in bytes) of every thread.
    pub stack_size: usize,
    /// Priority of threads created with `SmpScheduler::spawn_on`.
    pub default_priority: Priority,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_threads: DEFAULT_MAX_THREADS,
            stack_size: DEFAULT_STACK_SIZE_BYTES,
            default_priority: Priority::DEFAULT,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_default_priority(mut self, priority: Priority) -> Self {
        self.default_priority = priority;
        self
    }
}
