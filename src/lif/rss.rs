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

//! Receive-side scaling configuration: hash key, enabled hash types, and
//! the indirection table spreading flows across rx queues.

use rand::{RngCore, rng};

use crate::Result;
use crate::error::LifError;

/// Toeplitz hash key length in bytes.
pub const RSS_HASH_KEY_SIZE: usize = 40;

/// Enabled hash-type bits, matching the device's RSS type field.
pub mod hash_types {
    pub const IPV4: u16 = 1 << 0;
    pub const IPV4_TCP: u16 = 1 << 1;
    pub const IPV4_UDP: u16 = 1 << 2;
    pub const IPV6: u16 = 1 << 3;
    pub const IPV6_TCP: u16 = 1 << 4;
    pub const IPV6_UDP: u16 = 1 << 5;

    pub const ALL: u16 = IPV4 | IPV4_TCP | IPV4_UDP | IPV6 | IPV6_TCP | IPV6_UDP;
}

/// Live RSS configuration, guarded by the configuration lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RssConfig {
    /// Enabled hash-type bits
    pub types: u16,
    /// Toeplitz hash key
    pub key: [u8; RSS_HASH_KEY_SIZE],
    /// One rx queue index per table entry
    pub indir: Vec<u32>,
}

impl RssConfig {
    /// Fresh configuration: random key, all hash types, queues spread
    /// evenly across the table.
    pub(crate) fn new(nxqs: u32, tbl_len: u32) -> RssConfig {
        let mut key = [0u8; RSS_HASH_KEY_SIZE];
        rng().fill_bytes(&mut key);
        let mut cfg = RssConfig {
            types: hash_types::ALL,
            key,
            indir: vec![0; tbl_len as usize],
        };
        cfg.spread(nxqs);
        cfg
    }

    /// Re-spread the indirection table evenly over `nxqs` queues. Used when
    /// the queue count changes and the old table would point past the end.
    pub(crate) fn spread(&mut self, nxqs: u32) {
        for (i, entry) in self.indir.iter_mut().enumerate() {
            *entry = i as u32 % nxqs;
        }
    }

    /// Check that every table entry names a live rx queue.
    pub(crate) fn validate_indir(indir: &[u32], nxqs: u32) -> Result<()> {
        if let Some(entry) = indir.iter().find(|&&entry| entry >= nxqs) {
            return Err(LifError::InvalidConfiguration(format!(
                "rss indirection entry {entry} out of range for {nxqs} queues"
            )));
        }
        Ok(())
    }
}
