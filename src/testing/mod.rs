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

//! A mock device adapter for tests: balanced interrupt-vector and CMB
//! accounting, a simulated hardware clock, a full admin command log, and
//! fault injection for forced-failure scenarios.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::Result;
use crate::device::{
    AdminCmd, AdminComp, DeviceAdapter, DeviceIdentity, QueueGeometry,
};
use crate::error::LifError;
use crate::new_error;

/// A software stand-in for the device/firmware collaborator.
#[derive(Debug)]
pub struct MockDevice {
    identity: DeviceIdentity,
    intr_in_use: AtomicU32,
    cmb_in_use: AtomicU32,
    clock: AtomicU64,
    link_up: AtomicBool,
    admin_log: Mutex<Vec<AdminCmd>>,
    /// When set, every admin call fails with `DeviceUnresponsive`.
    unresponsive: AtomicBool,
    /// Remaining interrupt allocations allowed before forced failure;
    /// `u32::MAX` means unlimited.
    intr_allocs_left: AtomicU32,
    /// Fail the next admin command with a generic error, once.
    fail_next_admin: AtomicBool,
}

impl MockDevice {
    /// A permissive identity for tests: plenty of queues and vectors,
    /// 1 GHz 48-bit clock, `mult=2, div=3` coalescing.
    pub fn default_identity() -> DeviceIdentity {
        DeviceIdentity {
            max_queue_pairs: 16,
            max_intr_vectors: 64,
            tx_geometry: QueueGeometry {
                desc_sz: 16,
                comp_sz: 16,
                sg_desc_sz: 128,
                max_descs: 1 << 14,
            },
            rx_geometry: QueueGeometry {
                desc_sz: 16,
                comp_sz: 32,
                sg_desc_sz: 128,
                max_descs: 1 << 14,
            },
            intr_coal_mult: 2,
            intr_coal_div: 3,
            rss_ind_tbl_len: 128,
            hwstamp_capable: true,
            hwclock_mask_bits: 48,
            hwclock_freq_hz: 1_000_000_000,
            cmb_pages: 64,
        }
    }

    pub fn new(identity: DeviceIdentity) -> MockDevice {
        MockDevice {
            identity,
            intr_in_use: AtomicU32::new(0),
            cmb_in_use: AtomicU32::new(0),
            clock: AtomicU64::new(0),
            link_up: AtomicBool::new(true),
            admin_log: Mutex::new(Vec::new()),
            unresponsive: AtomicBool::new(false),
            intr_allocs_left: AtomicU32::new(u32::MAX),
            fail_next_admin: AtomicBool::new(false),
        }
    }

    /// Interrupt vectors currently allocated.
    pub fn intr_in_use(&self) -> u32 {
        self.intr_in_use.load(Ordering::SeqCst)
    }

    /// CMB pages currently reserved.
    pub fn cmb_pages_in_use(&self) -> u32 {
        self.cmb_in_use.load(Ordering::SeqCst)
    }

    /// Advance the simulated hardware clock by `cycles`.
    pub fn advance_clock(&self, cycles: u64) {
        self.clock.fetch_add(cycles, Ordering::SeqCst);
    }

    /// Simulate link state reported by `PortStatusGet`.
    pub fn set_link_up(&self, up: bool) {
        self.link_up.store(up, Ordering::SeqCst);
    }

    /// Every admin call fails with `DeviceUnresponsive` until cleared.
    pub fn set_unresponsive(&self, on: bool) {
        self.unresponsive.store(on, Ordering::SeqCst);
    }

    /// Allow exactly `n` more interrupt allocations, fail the one after,
    /// then allow again.
    pub fn fail_intr_allocs_after(&self, n: u32) {
        self.intr_allocs_left.store(n, Ordering::SeqCst);
    }

    /// Fail the next admin command, once, with a generic error.
    pub fn fail_next_admin(&self) {
        self.fail_next_admin.store(true, Ordering::SeqCst);
    }

    /// Every admin command issued so far, in order.
    pub fn admin_log(&self) -> Vec<AdminCmd> {
        self.admin_log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Forget the admin history; accounting is untouched.
    pub fn clear_admin_log(&self) {
        self.admin_log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

impl DeviceAdapter for MockDevice {
    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn admin(&self, cmd: AdminCmd) -> Result<AdminComp> {
        if self.unresponsive.load(Ordering::SeqCst) {
            return Err(LifError::DeviceUnresponsive(
                "mock device is unresponsive".to_string(),
            ));
        }
        if self.fail_next_admin.swap(false, Ordering::SeqCst) {
            return Err(new_error!("injected admin failure"));
        }
        let comp = match &cmd {
            AdminCmd::PortStatusGet => AdminComp::LinkStatus {
                up: self.link_up.load(Ordering::SeqCst),
                speed_mbps: 100_000,
            },
            _ => AdminComp::None,
        };
        self.admin_log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(cmd);
        Ok(comp)
    }

    fn intr_alloc(&self) -> Result<u32> {
        let left = self.intr_allocs_left.load(Ordering::SeqCst);
        if left != u32::MAX {
            if left == 0 {
                self.intr_allocs_left.store(u32::MAX, Ordering::SeqCst);
                return Err(LifError::OutOfInterruptVectors {
                    requested: self.intr_in_use() + 1,
                    available: self.identity.max_intr_vectors,
                });
            }
            self.intr_allocs_left.store(left - 1, Ordering::SeqCst);
        }
        let in_use = self.intr_in_use.load(Ordering::SeqCst);
        if in_use >= self.identity.max_intr_vectors {
            return Err(LifError::OutOfInterruptVectors {
                requested: in_use + 1,
                available: self.identity.max_intr_vectors,
            });
        }
        self.intr_in_use.fetch_add(1, Ordering::SeqCst);
        Ok(in_use)
    }

    fn intr_free(&self, _index: u32) {
        let prev = self.intr_in_use.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "interrupt vector freed twice");
    }

    fn cmb_alloc(&self, pages: u32) -> Result<u32> {
        let in_use = self.cmb_in_use.load(Ordering::SeqCst);
        if in_use + pages > self.identity.cmb_pages {
            return Err(LifError::OutOfMemory("controller memory pages"));
        }
        self.cmb_in_use.fetch_add(pages, Ordering::SeqCst);
        Ok(in_use)
    }

    fn cmb_free(&self, _pgid: u32, pages: u32) {
        let prev = self.cmb_in_use.fetch_sub(pages, Ordering::SeqCst);
        assert!(prev >= pages, "cmb pages freed twice");
    }

    fn hwclock_read(&self) -> u64 {
        let mask = if self.identity.hwclock_mask_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.identity.hwclock_mask_bits) - 1
        };
        self.clock.load(Ordering::SeqCst) & mask
    }
}
