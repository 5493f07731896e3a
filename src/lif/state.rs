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

//! The LIF's lifecycle state record.
//!
//! Each field is an independent fact, set and cleared with atomic
//! operations. Transitions of a single field are atomic; any caller that
//! needs two fields to change together must hold the configuration lock.
//! Fields are grouped by the subsystem that owns their transitions. No
//! compound state is inferred from combinations without an explicit
//! cross-check: `up` and `broken` can legitimately coexist for a moment
//! during error recovery.

use std::sync::atomic::{AtomicBool, Ordering};

/// One named flag; a thin wrapper so call sites read as
/// `state.up.get()` / `state.up.set(true)`.
#[derive(Debug, Default)]
pub struct Flag(AtomicBool);

impl Flag {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::Release);
    }

    /// Set the flag, returning whether it was already set.
    pub fn test_and_set(&self) -> bool {
        self.0.swap(true, Ordering::AcqRel)
    }
}

/// Lifecycle facts about the interface. This record is the single source
/// of truth for "is the interface operable"; nothing else duplicates that
/// meaning.
#[derive(Debug, Default)]
pub struct LifState {
    // -- lifecycle; compound transitions require the configuration lock --
    /// Hardware resources are provisioned
    pub initialized: Flag,
    /// Data queues allocated and admin registration succeeded
    pub up: Flag,
    /// A hardware interaction failed unrecoverably; configuration requests
    /// fail fast until an explicit reset clears this
    pub broken: Flag,
    /// Teardown has begun; checked at safe points to abandon further work
    pub shutting_down: Flag,
    /// Firmware announced it is going down; queues are parked until it
    /// returns
    pub fw_reset_in_progress: Flag,
    /// Firmware is in the stopping phase of a reset
    pub fw_stopping: Flag,

    // -- deferred-sync requests, owned by the notification handlers --
    /// A link-status recheck is queued or running
    pub link_check_requested: Flag,
    /// The rx-filter list needs to be replayed to hardware
    pub filter_sync_needed: Flag,

    // -- interrupt moderation and layout, owned by coalescing config --
    /// Adaptive moderation active on tx vectors
    pub tx_adaptive_coal: Flag,
    /// Adaptive moderation active on rx vectors
    pub rx_adaptive_coal: Flag,
    /// Tx and rx completions use separate vectors
    pub split_interrupts: Flag,

    // -- timestamping, owned by the hwstamp queue plumbing --
    /// The dedicated timestamp queue pair should exist whenever the data
    /// path is up; rebuilt across reconfigure and firmware reset
    pub hwstamp_enabled: Flag,

    // -- ring placement, owned by queue reconfiguration --
    /// Tx rings placed in controller memory
    pub cmb_tx_rings: Flag,
    /// Rx rings placed in controller memory
    pub cmb_rx_rings: Flag,

    // -- diagnostics --
    /// Optional per-queue debug counters are being collected
    pub debug_stats: Flag,
    /// RDMA sniffer queue steering is active
    pub rdma_sniffer: Flag,
}

impl LifState {
    /// Fail fast when the device was marked broken, without touching
    /// hardware.
    pub fn check_not_broken(&self) -> crate::Result<()> {
        if self.broken.get() {
            return Err(crate::error::LifError::Broken);
        }
        Ok(())
    }

    /// Short-circuit work once teardown has begun.
    pub fn check_not_shutting_down(&self) -> crate::Result<()> {
        if self.shutting_down.get() {
            return Err(crate::error::LifError::ShuttingDown);
        }
        Ok(())
    }
}
