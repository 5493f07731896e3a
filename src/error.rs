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

use thiserror::Error;

/// The error type for nicplane operations
#[derive(Error, Debug)]
pub enum LifError {
    /// The interface was previously marked broken by a failed hardware
    /// interaction; configuration requests fail fast until an explicit
    /// reset clears the condition.
    #[error("device became unresponsive earlier and the interface is marked broken; reset required")]
    Broken,

    /// A firmware/admin call timed out or failed at the transport level.
    /// Observing this error marks the interface broken.
    #[error("device unresponsive: {0}")]
    DeviceUnresponsive(String),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),

    /// Requested descriptor count is not a power of two or exceeds the
    /// device maximum.
    #[error("invalid descriptor count {got}: must be a nonzero power of two no larger than {max}")]
    InvalidDescriptorCount {
        /// The requested descriptor count
        got: u32,
        /// The device maximum for this queue class
        max: u32,
    },

    /// A malformed parameter combination, caught before any hardware
    /// mutation.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Ring or table memory could not be obtained.
    #[error("out of memory allocating {0}")]
    OutOfMemory(&'static str),

    /// The device has no interrupt vectors left to hand out.
    #[error("out of interrupt vectors: need {requested}, device has {available}")]
    OutOfInterruptVectors {
        /// Vectors the request would bring into use
        requested: u32,
        /// Total vectors the device reports
        available: u32,
    },

    /// Requested queue count exceeds the device-reported quota.
    #[error("queue count {requested} exceeds device quota {quota}")]
    QueueCountExceedsQuota {
        /// The requested queue count
        requested: u32,
        /// The device quota
        quota: u32,
    },

    /// The interface is being torn down; no further work is started.
    #[error("interface is shutting down")]
    ShuttingDown,

    /// Feature not available on this device variant.
    #[error("not supported on this device: {0}")]
    Unsupported(String),
}

impl LifError {
    /// Whether this error indicates the device itself stopped responding,
    /// as opposed to a rejected or malformed request.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LifError::DeviceUnresponsive(_))
    }
}
