// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use custom_error::custom_error;

custom_error! {
    #[derive(PartialEq, Clone)]
    pub StrandError
    ResourceExhausted = "No thread control block or execution context is available.",
    InvalidHandle = "The handle is unknown or has already been reclaimed.",
    NotOwner = "The calling thread does not own the lock.",
    StillLocked = "The primitive is still locked.",
    HasWaiters = "Threads are still waiting on the primitive.",
    InvalidState = "The primitive has been destroyed.",
    Deadlock = "The operation would deadlock the calling thread.",
    KeyInUse = "Threads still hold values for this key.",
    NoThreadContext = "The caller does not run inside a scheduler thread.",
    Cancelled = "The scheduler driving this thread was dropped.",
    InvalidAffinity{core: usize} = "Core {core} is out of range.",
}
