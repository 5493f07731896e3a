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

//! Control-plane coordinator for a logical interface (LIF) of a multi-queue
//! NIC.
//!
//! This crate owns the queue-pair resource tables of a LIF, serializes
//! configuration changes against concurrent hardware/notification events,
//! schedules potentially-blocking reconfiguration work off latency-sensitive
//! contexts, and maintains a monotonic hardware-clock translation for packet
//! timestamping. The per-packet descriptor fast path and the firmware admin
//! protocol are external collaborators reached through the
//! [`device::DeviceAdapter`] trait.

/// Conversion between user-facing microsecond coalescing values and
/// hardware coalescing units.
pub mod coalesce;
/// The seam to the device/firmware collaborator: identity data, opaque
/// admin commands, and interrupt-vector accounting.
pub mod device;
/// The error types for this crate.
pub mod error;
/// The LIF itself: lifecycle controller, state flags, deferred work
/// scheduler, queue parameter negotiation, and RSS configuration.
pub mod lif;
pub(crate) mod metrics;
/// Hardware clock (PHC) synchronization for packet timestamping.
pub mod phc;
/// Queue-pair resources and per-queue statistics.
pub mod queue;
/// Test support: a mock device adapter with fault injection.
pub mod testing;

/// Re-export for the `Lif` type
pub use lif::Lif;
/// Re-export for the `QueueParams` type
pub use lif::params::QueueParams;

/// The universal `Result` type for this crate
pub type Result<T> = core::result::Result<T, error::LifError>;

/// Build a [`error::LifError::Error`] from a format string.
#[macro_export]
macro_rules! new_error {
    ($fmtstr:expr) => {{
        $crate::error::LifError::Error(::std::format!($fmtstr))
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
        $crate::error::LifError::Error(::std::format!($fmtstr, $($arg)*))
    }};
}

/// Log the given error at `error` level, then return it from the enclosing
/// function.
#[macro_export]
macro_rules! log_then_return {
    ($msg:literal $(,)?) => {{
        let err = $crate::new_error!($msg);
        ::log::error!("{}", err);
        return Err(err);
    }};
    ($err:expr $(,)?) => {{
        ::log::error!("{}", $err);
        return Err($err);
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
        let err = $crate::new_error!($fmtstr, $($arg)*);
        ::log::error!("{}", err);
        return Err(err);
    }};
}
