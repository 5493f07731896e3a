/*
Copyright 2025  The Nicplane Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! The deferred work scheduler.
//!
//! Producers (notification/interrupt handlers) append work items to a
//! mutex-protected queue and signal an unbounded wakeup channel; neither
//! step can block or fail. A single dedicated worker thread drains the
//! queue: it pops the head under the lock, releases the lock, and only then
//! dispatches the item, so a long-running item never holds up `enqueue`.
//! The queue mutex is independent of every other lock in the crate and is
//! never held across a blocking call.

use std::collections::VecDeque;
use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::device::MacAddr;

/// One unit of reconfiguration logic queued for asynchronous execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeferredWork {
    /// Add or remove a MAC rx filter
    AddressChange {
        /// The address to add or remove
        addr: MacAddr,
        /// true to add, false to remove
        add: bool,
    },
    /// Re-check link status against the port
    LinkCheck,
    /// Firmware announced a LIF reset; the status code is opaque here and
    /// interpreted by the reset handler
    LifReset {
        /// Firmware status byte from the notification
        fw_status: u8,
    },
}

pub(crate) struct Deferred {
    queue: Mutex<VecDeque<DeferredWork>>,
    wake: Sender<()>,
}

impl Deferred {
    pub(crate) fn new() -> (Deferred, Receiver<()>) {
        let (wake, wake_rx) = unbounded();
        (
            Deferred {
                queue: Mutex::new(VecDeque::new()),
                wake,
            },
            wake_rx,
        )
    }

    /// Append an item and schedule the worker. Callable from any context;
    /// never blocks, never fails.
    pub(crate) fn enqueue(&self, work: DeferredWork) {
        match self.queue.lock() {
            Ok(mut queue) => queue.push_back(work),
            // A poisoned queue only means a worker panicked mid-drain; the
            // items themselves are still intact.
            Err(poisoned) => poisoned.into_inner().push_back(work),
        }
        // Send on an unbounded channel cannot block; a disconnect means the
        // worker is already gone and the item will be discarded at teardown.
        let _ = self.wake.send(());
    }

    /// Wake the worker without queueing anything, so it can re-check
    /// lifecycle flags.
    pub(crate) fn notify(&self) {
        let _ = self.wake.send(());
    }

    /// Pop the head item. The lock is released before the caller dispatches.
    pub(crate) fn pop(&self) -> Option<DeferredWork> {
        match self.queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    /// Discard everything still queued, returning how many items were
    /// dropped.
    pub(crate) fn discard_all(&self) -> usize {
        match self.queue.lock() {
            Ok(mut queue) => {
                let n = queue.len();
                queue.clear();
                n
            }
            Err(poisoned) => {
                let mut queue = poisoned.into_inner();
                let n = queue.len();
                queue.clear();
                n
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self.queue.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}
