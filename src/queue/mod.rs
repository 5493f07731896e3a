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

//! Queue-pair resources.
//!
//! A queue-pair is one descriptor ring, its paired completion ring, an
//! optional scatter-gather ring, and an optional dedicated interrupt
//! vector, allocated and freed as a unit. A queue-pair is either fully
//! constructed or not constructed at all; a failed sub-resource rolls back
//! everything already acquired for the unit before the error is returned.
//!
//! The owning LIF is never stored inside a queue-pair; operations that need
//! the device take it as an explicit context parameter.

/// Per-queue statistics records
pub mod stats;

use std::sync::Arc;

use crate::Result;
use crate::device::{AdminCmd, DeviceAdapter, DeviceIdentity, QueueClass, QueueGeometry};
use crate::error::LifError;
use stats::{RxQueueStats, TxQueueStats};

const CMB_PAGE_SIZE: u32 = 4096;

/// Which optional facilities a queue-pair carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueuePairFacilities {
    /// Scatter-gather ring present
    pub sg: bool,
    /// A dedicated interrupt vector is bound (as opposed to sharing one)
    pub intr: bool,
    /// Descriptor ring placed in on-chip controller memory
    pub cmb: bool,
    /// A statistics record is attached
    pub stats: bool,
}

/// How a queue-pair gets its completion interrupt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IntrPolicy {
    /// Polled; no vector bound
    None,
    /// Allocate a vector owned by this queue-pair
    Dedicated,
    /// Bind to a vector owned by another queue-pair
    Shared(u32),
}

/// Everything needed to construct one queue-pair.
#[derive(Clone, Copy, Debug)]
pub(crate) struct QueuePairSpec {
    pub class: QueueClass,
    pub index: u32,
    pub num_descs: u32,
    pub features: u64,
    pub sg: bool,
    pub intr: IntrPolicy,
    pub cmb: bool,
    pub stats: bool,
}

/// One data queue plus completion ring and optional sub-resources; owned
/// exclusively by the LIF's resource tables.
#[derive(Debug)]
pub struct QueuePair {
    class: QueueClass,
    index: u32,
    num_descs: u32,
    features: u64,
    facilities: QueuePairFacilities,
    q_ring: Vec<u8>,
    cq_ring: Vec<u8>,
    sg_ring: Option<Vec<u8>>,
    intr_index: Option<u32>,
    owns_intr: bool,
    cmb: Option<(u32, u32)>, // (pgid, pages)
    tx_stats: Option<Arc<TxQueueStats>>,
    rx_stats: Option<Arc<RxQueueStats>>,
}

fn geometry_for(ident: &DeviceIdentity, class: QueueClass) -> QueueGeometry {
    match class {
        QueueClass::Tx => ident.tx_geometry,
        QueueClass::Rx => ident.rx_geometry,
        // admin and notify rings use a fixed small geometry
        QueueClass::Admin | QueueClass::Notify => QueueGeometry {
            desc_sz: 64,
            comp_sz: 16,
            sg_desc_sz: 0,
            max_descs: 256,
        },
    }
}

pub(crate) fn validate_num_descs(num_descs: u32, max: u32) -> Result<()> {
    if num_descs == 0 || !num_descs.is_power_of_two() || num_descs > max {
        return Err(LifError::InvalidDescriptorCount {
            got: num_descs,
            max,
        });
    }
    Ok(())
}

fn cmb_pages_for(ring_bytes: usize) -> u32 {
    (ring_bytes as u32).div_ceil(CMB_PAGE_SIZE).max(1)
}

impl QueuePair {
    /// Construct the whole unit, or nothing. Any sub-resource failure
    /// releases every sub-resource already acquired before returning.
    pub(crate) fn build(device: &dyn DeviceAdapter, spec: QueuePairSpec) -> Result<QueuePair> {
        let geo = geometry_for(device.identity(), spec.class);
        validate_num_descs(spec.num_descs, geo.max_descs)?;

        let q_bytes = spec.num_descs as usize * geo.desc_sz as usize;
        let cq_bytes = spec.num_descs as usize * geo.comp_sz as usize;
        let q_ring = vec![0u8; q_bytes];
        let cq_ring = vec![0u8; cq_bytes];
        let sg_ring = (spec.sg && geo.sg_desc_sz > 0)
            .then(|| vec![0u8; spec.num_descs as usize * geo.sg_desc_sz as usize]);

        let (intr_index, owns_intr) = match spec.intr {
            IntrPolicy::None => (None, false),
            IntrPolicy::Shared(index) => (Some(index), false),
            IntrPolicy::Dedicated => (Some(device.intr_alloc()?), true),
        };

        let cmb = if spec.cmb {
            let pages = cmb_pages_for(q_bytes);
            match device.cmb_alloc(pages) {
                Ok(pgid) => Some((pgid, pages)),
                Err(e) => {
                    if owns_intr {
                        if let Some(index) = intr_index {
                            device.intr_free(index);
                        }
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        if let Err(e) = device.admin(AdminCmd::QueueInit {
            class: spec.class,
            index: spec.index,
            num_descs: spec.num_descs,
            intr_index,
            cmb: cmb.is_some(),
            features: spec.features,
        }) {
            if owns_intr {
                if let Some(index) = intr_index {
                    device.intr_free(index);
                }
            }
            if let Some((pgid, pages)) = cmb {
                device.cmb_free(pgid, pages);
            }
            return Err(e);
        }

        let tx_stats = (spec.stats && spec.class == QueueClass::Tx)
            .then(|| Arc::new(TxQueueStats::default()));
        let rx_stats = (spec.stats && spec.class == QueueClass::Rx)
            .then(|| Arc::new(RxQueueStats::default()));

        Ok(QueuePair {
            class: spec.class,
            index: spec.index,
            num_descs: spec.num_descs,
            features: spec.features,
            facilities: QueuePairFacilities {
                sg: sg_ring.is_some(),
                intr: owns_intr,
                cmb: cmb.is_some(),
                stats: spec.stats,
            },
            q_ring,
            cq_ring,
            sg_ring,
            intr_index,
            owns_intr,
            cmb,
            tx_stats,
            rx_stats,
        })
    }

    /// Release every sub-resource unconditionally. Safe to call more than
    /// once; the second call finds nothing left to release.
    pub(crate) fn teardown(&mut self, device: &dyn DeviceAdapter) {
        if let Some(index) = self.intr_index.take() {
            if self.owns_intr {
                device.intr_free(index);
            }
        }
        self.owns_intr = false;
        if let Some((pgid, pages)) = self.cmb.take() {
            device.cmb_free(pgid, pages);
        }
        self.q_ring = Vec::new();
        self.cq_ring = Vec::new();
        self.sg_ring = None;
    }

    /// The queue class
    pub fn class(&self) -> QueueClass {
        self.class
    }

    /// The queue index within its class
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Ring size in descriptors
    pub fn num_descs(&self) -> u32 {
        self.num_descs
    }

    /// Queue feature bits
    pub fn features(&self) -> u64 {
        self.features
    }

    /// Which optional facilities are active
    pub fn facilities(&self) -> QueuePairFacilities {
        self.facilities
    }

    /// The interrupt vector bound to the completion ring, dedicated or
    /// shared
    pub fn intr_index(&self) -> Option<u32> {
        self.intr_index
    }

    /// Tx statistics record, present on stats-carrying tx queues
    pub fn tx_stats(&self) -> Option<&Arc<TxQueueStats>> {
        self.tx_stats.as_ref()
    }

    /// Rx statistics record, present on stats-carrying rx queues
    pub fn rx_stats(&self) -> Option<&Arc<RxQueueStats>> {
        self.rx_stats.as_ref()
    }
}

/// The LIF's queue-pair tables, guarded by the resource-table lock. Sized
/// exactly to the live queue count outside a reconfiguration transaction.
#[derive(Default)]
pub(crate) struct QueueTables {
    pub txqs: Vec<QueuePair>,
    pub rxqs: Vec<QueuePair>,
    pub adminq: Option<QueuePair>,
    pub notifyq: Option<QueuePair>,
    pub hwstamp_txq: Option<QueuePair>,
    pub hwstamp_rxq: Option<QueuePair>,
}

impl QueueTables {
    /// Release the data queues (tx/rx and timestamp queues), leaving the
    /// admin/notify pair alone.
    pub(crate) fn free_txrx(&mut self, device: &dyn DeviceAdapter) {
        for mut qcq in self.txqs.drain(..) {
            qcq.teardown(device);
        }
        for mut qcq in self.rxqs.drain(..) {
            qcq.teardown(device);
        }
        if let Some(mut qcq) = self.hwstamp_txq.take() {
            qcq.teardown(device);
        }
        if let Some(mut qcq) = self.hwstamp_rxq.take() {
            qcq.teardown(device);
        }
    }

    /// Release everything. Idempotent on an already-empty table.
    pub(crate) fn free_all(&mut self, device: &dyn DeviceAdapter) {
        self.free_txrx(device);
        if let Some(mut qcq) = self.notifyq.take() {
            qcq.teardown(device);
        }
        if let Some(mut qcq) = self.adminq.take() {
            qcq.teardown(device);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.txqs.is_empty()
            && self.rxqs.is_empty()
            && self.adminq.is_none()
            && self.notifyq.is_none()
            && self.hwstamp_txq.is_none()
            && self.hwstamp_rxq.is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testing::MockDevice;

    fn tx_spec(num_descs: u32) -> QueuePairSpec {
        QueuePairSpec {
            class: QueueClass::Tx,
            index: 0,
            num_descs,
            features: 0,
            sg: true,
            intr: IntrPolicy::Dedicated,
            cmb: false,
            stats: true,
        }
    }

    #[test]
    fn rejects_bad_descriptor_counts() {
        let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
        for bad in [0u32, 3, 6, 1 << 20] {
            let err = QueuePair::build(&*device, tx_spec(bad)).unwrap_err();
            assert!(matches!(err, LifError::InvalidDescriptorCount { .. }), "{bad}: {err}");
        }
        assert_eq!(device.intr_in_use(), 0);
    }

    #[test]
    fn admin_failure_rolls_back_interrupt_vector() {
        let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
        device.fail_next_admin();
        let err = QueuePair::build(&*device, tx_spec(64)).unwrap_err();
        assert!(matches!(err, LifError::Error(_)), "{err}");
        assert_eq!(device.intr_in_use(), 0);
    }

    #[test]
    fn cmb_failure_rolls_back_interrupt_vector() {
        let mut ident = MockDevice::default_identity();
        ident.cmb_pages = 0;
        let device = Arc::new(MockDevice::new(ident));
        let spec = QueuePairSpec {
            cmb: true,
            ..tx_spec(64)
        };
        let err = QueuePair::build(&*device, spec).unwrap_err();
        assert!(matches!(err, LifError::OutOfMemory(_)), "{err}");
        assert_eq!(device.intr_in_use(), 0);
        assert_eq!(device.cmb_pages_in_use(), 0);
    }

    #[test]
    fn teardown_is_idempotent_and_balances_accounting() {
        let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
        let mut qcq = QueuePair::build(&*device, tx_spec(128)).unwrap();
        assert_eq!(device.intr_in_use(), 1);
        assert!(qcq.facilities().intr);
        qcq.teardown(&*device);
        qcq.teardown(&*device);
        assert_eq!(device.intr_in_use(), 0);
    }

    #[test]
    fn shared_interrupt_is_not_freed_by_the_borrower() {
        let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
        let mut owner = QueuePair::build(
            &*device,
            QueuePairSpec {
                class: QueueClass::Rx,
                ..tx_spec(64)
            },
        )
        .unwrap();
        let vector = owner.intr_index().unwrap();

        let mut borrower = QueuePair::build(
            &*device,
            QueuePairSpec {
                intr: IntrPolicy::Shared(vector),
                ..tx_spec(64)
            },
        )
        .unwrap();
        assert_eq!(device.intr_in_use(), 1);
        assert!(!borrower.facilities().intr);

        borrower.teardown(&*device);
        assert_eq!(device.intr_in_use(), 1);
        owner.teardown(&*device);
        assert_eq!(device.intr_in_use(), 0);
    }

    #[test]
    fn free_all_on_empty_tables_is_a_no_op() {
        let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
        let mut tables = QueueTables::default();
        tables.free_all(&*device);
        assert!(tables.is_empty());
    }
}
