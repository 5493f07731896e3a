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

//! Control-plane metrics, emitted through the `metrics` facade. Whoever
//! embeds this crate decides where they go by installing a recorder.

use std::sync::Once;

use metrics::Unit;

pub(crate) const METRIC_DEFERRED_PROCESSED: &str = "deferred_work_processed_total";
pub(crate) const METRIC_DEFERRED_FAILED: &str = "deferred_work_failed_total";
pub(crate) const METRIC_LIF_RESETS: &str = "lif_resets_total";
pub(crate) const METRIC_RECONFIG_ROLLBACKS: &str = "reconfigure_rollbacks_total";

static DESCRIBE: Once = Once::new();

/// Describe each metric exactly once, on first emission.
fn describe() {
    DESCRIBE.call_once(|| {
        metrics::describe_counter!(
            METRIC_DEFERRED_PROCESSED,
            Unit::Count,
            "Deferred work items processed by the worker"
        );
        metrics::describe_counter!(
            METRIC_DEFERRED_FAILED,
            Unit::Count,
            "Deferred work items whose processing returned an error"
        );
        metrics::describe_counter!(
            METRIC_LIF_RESETS,
            Unit::Count,
            "Full interface resets performed"
        );
        metrics::describe_counter!(
            METRIC_RECONFIG_ROLLBACKS,
            Unit::Count,
            "Queue reconfigurations that failed and were rolled back"
        );
    });
}

pub(crate) fn deferred_processed() {
    describe();
    metrics::counter!(METRIC_DEFERRED_PROCESSED).increment(1);
}

pub(crate) fn deferred_failed() {
    describe();
    metrics::counter!(METRIC_DEFERRED_FAILED).increment(1);
}

pub(crate) fn lif_reset() {
    describe();
    metrics::counter!(METRIC_LIF_RESETS).increment(1);
}

pub(crate) fn reconfigure_rollback() {
    describe();
    metrics::counter!(METRIC_RECONFIG_ROLLBACKS).increment(1);
}
