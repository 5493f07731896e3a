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

//! Per-queue statistics records.
//!
//! Each record has exactly one writer: the fast-path owner of the queue.
//! Counters are relaxed atomics so the control plane can aggregate them
//! without a lock and without ever writing them. Optional diagnostic
//! counters are guarded by the runtime `debug_stats` flag on the LIF
//! rather than a compile-time toggle, so both modes ship in one binary.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counter_accessors {
    ($($field:ident),+ $(,)?) => {
        $(
            /// Add to this counter. Fast-path single-writer only.
            pub fn $field(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )+
    };
}

/// Transmit-side counters for one queue.
#[derive(Debug, Default)]
pub struct TxQueueStats {
    pkts: AtomicU64,
    bytes: AtomicU64,
    csum_none: AtomicU64,
    csum: AtomicU64,
    tso: AtomicU64,
    tso_bytes: AtomicU64,
    frags: AtomicU64,
    clean: AtomicU64,
    linearize: AtomicU64,
    dma_map_err: AtomicU64,
    hwstamp_valid: AtomicU64,
    hwstamp_invalid: AtomicU64,
    // diagnostic, updated only when debug stats are enabled
    dbell_count: AtomicU64,
}

impl TxQueueStats {
    counter_accessors!(
        pkts,
        bytes,
        csum_none,
        csum,
        tso,
        tso_bytes,
        frags,
        clean,
        linearize,
        dma_map_err,
        hwstamp_valid,
        hwstamp_invalid,
    );

    /// Record a doorbell ring; no-op unless debug stats are enabled.
    pub fn dbell(&self, debug_stats: bool) {
        if debug_stats {
            self.dbell_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Coherent-enough copy for aggregation; individual counters are read
    /// relaxed and may be skewed against each other.
    pub fn snapshot(&self) -> TxStatsSnapshot {
        TxStatsSnapshot {
            pkts: self.pkts.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            csum_none: self.csum_none.load(Ordering::Relaxed),
            csum: self.csum.load(Ordering::Relaxed),
            tso: self.tso.load(Ordering::Relaxed),
            tso_bytes: self.tso_bytes.load(Ordering::Relaxed),
            hwstamp_valid: self.hwstamp_valid.load(Ordering::Relaxed),
            hwstamp_invalid: self.hwstamp_invalid.load(Ordering::Relaxed),
        }
    }
}

/// Receive-side counters for one queue.
#[derive(Debug, Default)]
pub struct RxQueueStats {
    pkts: AtomicU64,
    bytes: AtomicU64,
    csum_none: AtomicU64,
    csum_complete: AtomicU64,
    csum_error: AtomicU64,
    dropped: AtomicU64,
    vlan_stripped: AtomicU64,
    dma_map_err: AtomicU64,
    alloc_err: AtomicU64,
    hwstamp_valid: AtomicU64,
    hwstamp_invalid: AtomicU64,
    // diagnostic, updated only when debug stats are enabled
    buffers_posted: AtomicU64,
}

impl RxQueueStats {
    counter_accessors!(
        pkts,
        bytes,
        csum_none,
        csum_complete,
        csum_error,
        dropped,
        vlan_stripped,
        dma_map_err,
        alloc_err,
        hwstamp_valid,
        hwstamp_invalid,
    );

    /// Record a posted buffer; no-op unless debug stats are enabled.
    pub fn buffer_posted(&self, debug_stats: bool) {
        if debug_stats {
            self.buffers_posted.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Coherent-enough copy for aggregation.
    pub fn snapshot(&self) -> RxStatsSnapshot {
        RxStatsSnapshot {
            pkts: self.pkts.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            csum_none: self.csum_none.load(Ordering::Relaxed),
            csum_complete: self.csum_complete.load(Ordering::Relaxed),
            csum_error: self.csum_error.load(Ordering::Relaxed),
            hwstamp_valid: self.hwstamp_valid.load(Ordering::Relaxed),
            hwstamp_invalid: self.hwstamp_invalid.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one tx queue's counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct TxStatsSnapshot {
    pub pkts: u64,
    pub bytes: u64,
    pub csum_none: u64,
    pub csum: u64,
    pub tso: u64,
    pub tso_bytes: u64,
    pub hwstamp_valid: u64,
    pub hwstamp_invalid: u64,
}

/// Point-in-time copy of one rx queue's counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct RxStatsSnapshot {
    pub pkts: u64,
    pub bytes: u64,
    pub csum_none: u64,
    pub csum_complete: u64,
    pub csum_error: u64,
    pub hwstamp_valid: u64,
    pub hwstamp_invalid: u64,
}

/// Software view of the whole LIF, summed over per-queue records.
#[derive(Clone, Copy, Debug, Default)]
pub struct LifSwStats {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_tso: u64,
    pub tx_tso_bytes: u64,
    pub tx_csum_none: u64,
    pub tx_csum: u64,
    pub rx_csum_none: u64,
    pub rx_csum_complete: u64,
    pub rx_csum_error: u64,
    pub tx_hwstamp_valid: u64,
    pub tx_hwstamp_invalid: u64,
    pub rx_hwstamp_valid: u64,
    pub rx_hwstamp_invalid: u64,
}

impl LifSwStats {
    /// Fold one tx queue's snapshot into the aggregate.
    pub(crate) fn add_tx(&mut self, s: &TxStatsSnapshot) {
        self.tx_packets += s.pkts;
        self.tx_bytes += s.bytes;
        self.tx_tso += s.tso;
        self.tx_tso_bytes += s.tso_bytes;
        self.tx_csum_none += s.csum_none;
        self.tx_csum += s.csum;
        self.tx_hwstamp_valid += s.hwstamp_valid;
        self.tx_hwstamp_invalid += s.hwstamp_invalid;
    }

    /// Fold one rx queue's snapshot into the aggregate.
    pub(crate) fn add_rx(&mut self, s: &RxStatsSnapshot) {
        self.rx_packets += s.pkts;
        self.rx_bytes += s.bytes;
        self.rx_csum_none += s.csum_none;
        self.rx_csum_complete += s.csum_complete;
        self.rx_csum_error += s.csum_error;
        self.rx_hwstamp_valid += s.hwstamp_valid;
        self.rx_hwstamp_invalid += s.hwstamp_invalid;
    }
}
