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

//! Queue parameter negotiation.
//!
//! [`QueueParams`] is the tuple a reconfiguration tears queues down and
//! rebuilds them with. A snapshot is captured before the attempt and only
//! committed if it succeeds; rollback is simply rebuilding from the
//! snapshot that was never committed.

use crate::Result;
use crate::device::DeviceIdentity;
use crate::error::LifError;
use crate::queue::validate_num_descs;

/// The queue-shape tuple of a LIF: queue count, descriptor counts, feature
/// flags, and the three layout facts that live in the state record between
/// reconfigurations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueParams {
    /// Number of tx/rx queue pairs
    pub nxqs: u32,
    /// Descriptors per tx ring
    pub ntxq_descs: u32,
    /// Descriptors per rx ring
    pub nrxq_descs: u32,
    /// Rx queue feature bits
    pub rxq_features: u64,
    /// Separate tx and rx interrupt vectors
    pub intr_split: bool,
    /// Tx rings in controller memory
    pub cmb_tx: bool,
    /// Rx rings in controller memory
    pub cmb_rx: bool,
}

impl QueueParams {
    /// Validate the requested shape against device identity. Catches every
    /// malformed combination before any hardware mutation.
    pub(crate) fn validate(&self, ident: &DeviceIdentity) -> Result<()> {
        if self.nxqs == 0 {
            return Err(LifError::InvalidConfiguration(
                "queue count must be at least 1".to_string(),
            ));
        }
        if self.nxqs > ident.max_queue_pairs {
            return Err(LifError::QueueCountExceedsQuota {
                requested: self.nxqs,
                quota: ident.max_queue_pairs,
            });
        }
        validate_num_descs(self.ntxq_descs, ident.tx_geometry.max_descs)?;
        validate_num_descs(self.nrxq_descs, ident.rx_geometry.max_descs)?;
        if (self.cmb_tx || self.cmb_rx) && ident.cmb_pages == 0 {
            return Err(LifError::Unsupported(
                "controller-memory rings not present on this device".to_string(),
            ));
        }
        Ok(())
    }

    /// How many interrupt vectors this shape needs for its data queues.
    /// With split interrupts each tx and rx queue has its own vector;
    /// otherwise tx shares its pair's rx vector.
    pub(crate) fn intr_vectors_needed(&self) -> u32 {
        if self.intr_split {
            self.nxqs * 2
        } else {
            self.nxqs
        }
    }
}
