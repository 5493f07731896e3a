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

use std::fmt::Debug;

use crate::Result;
use crate::lif::rss::RSS_HASH_KEY_SIZE;

/// A MAC address as carried in rx-filter commands.
pub type MacAddr = [u8; 6];

/// Maximum length of a LIF name, including nothing extra; names are plain
/// UTF-8, not NUL-terminated.
pub const LIF_NAME_MAX_SZ: usize = 32;

/// Queue feature bit marking a dedicated packet-timestamping queue.
pub const QUEUE_FEATURE_HWSTAMP: u64 = 1 << 0;

/// Admin queue depth; must be a power of two.
pub const ADMINQ_LENGTH: u32 = 16;
/// Notify queue depth; must be a power of two.
pub const NOTIFYQ_LENGTH: u32 = 64;

/// The queue classes a LIF provisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueClass {
    /// Firmware admin commands
    Admin,
    /// Asynchronous device notifications
    Notify,
    /// Transmit descriptor rings
    Tx,
    /// Receive descriptor rings
    Rx,
}

/// Descriptor geometry for one queue class, as reported by device
/// identification.
#[derive(Clone, Copy, Debug)]
pub struct QueueGeometry {
    /// Size of one descriptor in bytes
    pub desc_sz: u16,
    /// Size of one completion entry in bytes
    pub comp_sz: u16,
    /// Size of one scatter-gather descriptor in bytes; 0 if the class has
    /// no scatter-gather ring
    pub sg_desc_sz: u16,
    /// Maximum descriptors per ring for this class
    pub max_descs: u32,
}

/// Identity data reported by the device at identification time. Treated as
/// read-only for the lifetime of the LIF.
#[derive(Clone, Debug)]
pub struct DeviceIdentity {
    /// Queue-pair quota per LIF
    pub max_queue_pairs: u32,
    /// Total interrupt vectors the device can hand out
    pub max_intr_vectors: u32,
    /// Tx descriptor geometry
    pub tx_geometry: QueueGeometry,
    /// Rx descriptor geometry
    pub rx_geometry: QueueGeometry,
    /// Interrupt coalescing multiplier; 0 means coalescing is unusable
    pub intr_coal_mult: u32,
    /// Interrupt coalescing divisor; 0 means coalescing is unusable
    pub intr_coal_div: u32,
    /// Number of entries in the RSS indirection table
    pub rss_ind_tbl_len: u32,
    /// Whether the device can timestamp packets against its free-running
    /// clock
    pub hwstamp_capable: bool,
    /// Bit width of the free-running hardware clock counter
    pub hwclock_mask_bits: u32,
    /// Frequency of the free-running hardware clock counter
    pub hwclock_freq_hz: u64,
    /// Pages of on-chip controller memory available for CMB ring placement
    pub cmb_pages: u32,
}

/// Receive mode bits applied as a unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxMode {
    /// Accept unicast frames addressed to the interface
    pub unicast: bool,
    /// Accept multicast frames matching the filter list
    pub multicast: bool,
    /// Accept broadcast frames
    pub broadcast: bool,
    /// Accept all multicast frames
    pub all_multicast: bool,
    /// Accept everything
    pub promiscuous: bool,
}

/// A logical admin command. Wire encoding is the firmware collaborator's
/// concern; this crate only ever issues these as an opaque blocking
/// request/response call.
#[derive(Clone, Debug)]
pub enum AdminCmd {
    /// Initialize the LIF on hardware
    LifInit {
        /// Hardware LIF index
        hw_index: u32,
    },
    /// Reset the LIF on hardware
    LifReset {
        /// Hardware LIF index
        hw_index: u32,
    },
    /// Create one hardware queue
    QueueInit {
        /// Queue class
        class: QueueClass,
        /// Queue index within its class
        index: u32,
        /// Ring size in descriptors
        num_descs: u32,
        /// Interrupt vector bound to the completion ring, if any
        intr_index: Option<u32>,
        /// Whether the ring lives in controller memory
        cmb: bool,
        /// Queue feature bits (opaque to hardware accounting)
        features: u64,
    },
    /// Start or stop one hardware queue
    QueueControl {
        /// Queue class
        class: QueueClass,
        /// Queue index within its class
        index: u32,
        /// true to enable, false to disable
        enable: bool,
    },
    /// Add a MAC filter
    RxFilterAdd {
        /// The address to match
        addr: MacAddr,
    },
    /// Remove a MAC filter
    RxFilterDel {
        /// The address to stop matching
        addr: MacAddr,
    },
    /// Apply the receive mode
    RxModeSet {
        /// The mode to apply
        mode: RxMode,
    },
    /// Program RSS hashing
    RssSet {
        /// Enabled hash type bits
        types: u16,
        /// Toeplitz hash key
        key: [u8; RSS_HASH_KEY_SIZE],
        /// Indirection table, one rx queue index per entry
        indir: Vec<u32>,
    },
    /// Program interrupt coalescing for one vector, in hardware units
    CoalesceSet {
        /// The vector to program
        intr_index: u32,
        /// Delay in hardware coalescing units
        hw_units: u32,
    },
    /// Set the transmit timestamp mode
    HwstampTxMode {
        /// Device-defined mode value
        mode: u16,
    },
    /// Set the receive timestamp packet-class filter
    HwstampRxFilter {
        /// Device-defined packet-class bits
        filter: u64,
    },
    /// Query port/link status
    PortStatusGet,
}

/// A logical admin completion.
#[derive(Clone, Debug, Default)]
pub enum AdminComp {
    /// Command completed with no payload
    #[default]
    None,
    /// Response to [`AdminCmd::PortStatusGet`]
    LinkStatus {
        /// Whether the link is up
        up: bool,
        /// Negotiated speed
        speed_mbps: u32,
    },
}

/// The seam to the device and its firmware. Implementations are expected to
/// bound `admin` by a timeout and surface it as
/// [`crate::error::LifError::DeviceUnresponsive`]; interrupt-vector and CMB
/// accounting must balance across alloc/free pairs.
pub trait DeviceAdapter: Send + Sync + Debug {
    /// Identity data captured at device identification
    fn identity(&self) -> &DeviceIdentity;

    /// Issue one admin command and block for its completion
    fn admin(&self, cmd: AdminCmd) -> Result<AdminComp>;

    /// Allocate a dedicated interrupt vector, returning its index
    fn intr_alloc(&self) -> Result<u32>;

    /// Release an interrupt vector
    fn intr_free(&self, index: u32);

    /// Reserve pages of controller memory for a CMB-placed ring, returning
    /// the page id
    fn cmb_alloc(&self, pages: u32) -> Result<u32>;

    /// Release a controller-memory reservation
    fn cmb_free(&self, pgid: u32, pages: u32);

    /// Read the free-running hardware clock counter, already masked to
    /// [`DeviceIdentity::hwclock_mask_bits`]
    fn hwclock_read(&self) -> u64;
}
