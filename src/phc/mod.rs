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

//! Hardware clock (PHC) synchronization.
//!
//! The device exposes a free-running counter; this module maintains a
//! monotonic translation from that counter to nanoseconds for packet
//! timestamping. Readers take a read section of the clock lock and never
//! mutate translation state; `adjust`/`set_frequency` and the periodic
//! correction task take the write section. The periodic task exists
//! specifically to observe the counter often enough that a wrap is folded
//! into the nanosecond base before it is lost.

pub(crate) mod timecounter;

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use log::warn;
use tracing::{Span, debug, instrument};

use crate::Result;
use crate::device::{AdminCmd, DeviceAdapter};
use crate::error::LifError;
use timecounter::Timecounter;

/// Which received packet classes get hardware timestamps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RxTimestampFilter {
    /// No rx timestamps
    #[default]
    Off,
    /// Timestamp every received packet
    All,
    /// PTPv2 event messages only
    PtpV2Event,
    /// PTPv2 Sync messages only
    PtpV2Sync,
    /// PTPv2 DelayReq messages only
    PtpV2DelayReq,
}

impl RxTimestampFilter {
    fn pkt_class(self) -> u64 {
        match self {
            RxTimestampFilter::Off => 0,
            RxTimestampFilter::All => u64::MAX,
            RxTimestampFilter::PtpV2Event => 1 << 0,
            RxTimestampFilter::PtpV2Sync => 1 << 1,
            RxTimestampFilter::PtpV2DelayReq => 1 << 2,
        }
    }

    fn is_ptp(self) -> bool {
        matches!(
            self,
            RxTimestampFilter::PtpV2Event
                | RxTimestampFilter::PtpV2Sync
                | RxTimestampFilter::PtpV2DelayReq
        )
    }
}

/// Transmit timestamping mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TxTimestampMode {
    /// No tx timestamps
    #[default]
    Off,
    /// Timestamp reported through the completion ring
    TwoStep,
    /// Hardware rewrites the origin timestamp field of outgoing Sync
    /// messages
    OneStepSync,
}

impl TxTimestampMode {
    fn mode_bits(self) -> u16 {
        match self {
            TxTimestampMode::Off => 0,
            TxTimestampMode::TwoStep => 1,
            TxTimestampMode::OneStepSync => 2,
        }
    }
}

/// The rx-filter/tx-mode pair, settable independently but validated
/// jointly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimestampConfig {
    /// Receive timestamp packet-class filter
    pub rx_filter: RxTimestampFilter,
    /// Transmit timestamp mode
    pub tx_mode: TxTimestampMode,
}

impl TimestampConfig {
    /// Reject combinations the hardware cannot honor before anything is
    /// applied.
    fn validate(&self) -> Result<()> {
        // One-step sync rewrites PTP frames in flight, which the device
        // only does while its PTP classifier is engaged on receive.
        if self.tx_mode == TxTimestampMode::OneStepSync && !self.rx_filter.is_ptp() {
            return Err(LifError::Unsupported(
                "one-step tx timestamping requires a PTP rx filter".to_string(),
            ));
        }
        Ok(())
    }
}

/// The LIF's hardware clock context. Created when the device reports
/// timestamp capability, destroyed on interface teardown.
pub struct Phc {
    device: Arc<dyn DeviceAdapter>,
    /// The clock lock of the locking discipline: translation state.
    tc: RwLock<Timecounter>,
    /// Timestamp configuration lock, independent of the clock lock.
    ts_config: Mutex<TimestampConfig>,
    /// Raw stamps captured against a mapping that is about to be replaced
    /// by a queue rebuild.
    pending: Mutex<Vec<u64>>,
    stop: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Cadence of the periodic fold: a quarter of the counter's wrap period,
/// so a wrap can never slip between two observations even with scheduling
/// jitter, capped at an hour for wide counters that effectively never
/// wrap.
fn fold_interval(wrap_period_ns: u64) -> Duration {
    Duration::from_nanos((wrap_period_ns / 4).max(1)).min(Duration::from_secs(3600))
}

impl Phc {
    /// Build the clock context and start the periodic correction task.
    pub(crate) fn new(device: Arc<dyn DeviceAdapter>) -> Result<Arc<Phc>> {
        let ident = device.identity();
        let start_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let tc = Timecounter::new(
            ident.hwclock_freq_hz,
            ident.hwclock_mask_bits,
            device.hwclock_read(),
            start_ns,
        );

        let interval = fold_interval(tc.wrap_period_ns());

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let phc = Arc::new(Phc {
            device,
            tc: RwLock::new(tc),
            ts_config: Mutex::new(TimestampConfig::default()),
            pending: Mutex::new(Vec::new()),
            stop: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(None),
        });

        let weak: Weak<Phc> = Arc::downgrade(&phc);
        let handle = thread::Builder::new()
            .name("phc-aux".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => match weak.upgrade() {
                        Some(phc) => phc.fold(),
                        None => break,
                    },
                    _ => break,
                }
            })
            .map_err(|e| crate::new_error!("failed to spawn the phc aux thread: {e}"))?;
        if let Ok(mut worker) = phc.worker.lock() {
            *worker = Some(handle);
        }
        Ok(phc)
    }

    /// Current time in nanoseconds: read the free-running counter and apply
    /// the translation under a read section of the clock lock.
    pub fn now(&self) -> u64 {
        self.time_of(self.device.hwclock_read())
    }

    /// Translate a raw counter value captured by the fast path.
    pub fn time_of(&self, raw: u64) -> u64 {
        let tc = self.tc.read().unwrap_or_else(|p| p.into_inner());
        tc.cyc2time(raw)
    }

    /// Step the clock by a signed nanosecond offset.
    pub fn adjust(&self, delta_ns: i64) {
        let mut tc = self.tc.write().unwrap_or_else(|p| p.into_inner());
        tc.adjtime(delta_ns);
    }

    /// Slew the clock rate by a scaled-ppm (16.16) adjustment. The
    /// accumulated time is folded first so the new rate applies only going
    /// forward.
    pub fn set_frequency(&self, scaled_ppm: i64) {
        let raw = self.device.hwclock_read();
        let mut tc = self.tc.write().unwrap_or_else(|p| p.into_inner());
        tc.update(raw);
        tc.adjfine(scaled_ppm);
    }

    /// Periodic correction: observe the counter and fold elapsed time so a
    /// wrap is never lost between adjustments.
    pub(crate) fn fold(&self) {
        let raw = self.device.hwclock_read();
        let mut tc = self.tc.write().unwrap_or_else(|p| p.into_inner());
        tc.update(raw);
    }

    /// The active timestamp configuration.
    pub fn timestamp_config(&self) -> TimestampConfig {
        *self
            .ts_config
            .lock()
            .unwrap_or_else(|p| p.into_inner())
    }

    /// Apply a new rx-filter/tx-mode pair. Invalid combinations return
    /// `Unsupported` with nothing applied; if the second hardware write
    /// fails the first is rolled back best-effort.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_timestamp_config(&self, config: TimestampConfig) -> Result<()> {
        config.validate()?;
        let mut current = self.ts_config.lock().unwrap_or_else(|p| p.into_inner());
        self.device.admin(AdminCmd::HwstampTxMode {
            mode: config.tx_mode.mode_bits(),
        })?;
        if let Err(e) = self.device.admin(AdminCmd::HwstampRxFilter {
            filter: config.rx_filter.pkt_class(),
        }) {
            if let Err(undo) = self.device.admin(AdminCmd::HwstampTxMode {
                mode: current.tx_mode.mode_bits(),
            }) {
                warn!("could not restore tx timestamp mode after rx filter failure: {undo}");
            }
            return Err(e);
        }
        *current = config;
        Ok(())
    }

    /// Park a raw timestamp whose translation must wait until after a
    /// queue rebuild. Callable from the fast path.
    pub fn defer_timestamp(&self, raw: u64) {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(raw);
    }

    /// After a queue rebuild: re-apply the timestamp configuration to
    /// hardware and translate every parked stamp with the current mapping.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn replay_pending_timestamps(&self) -> Result<Vec<u64>> {
        let config = self.timestamp_config();
        if config != TimestampConfig::default() {
            self.device.admin(AdminCmd::HwstampTxMode {
                mode: config.tx_mode.mode_bits(),
            })?;
            self.device.admin(AdminCmd::HwstampRxFilter {
                filter: config.rx_filter.pkt_class(),
            })?;
        }
        let raw: Vec<u64> = self
            .pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        let tc = self.tc.read().unwrap_or_else(|p| p.into_inner());
        let replayed = raw.iter().map(|&r| tc.cyc2time(r)).collect::<Vec<_>>();
        if !replayed.is_empty() {
            debug!(count = replayed.len(), "replayed deferred hardware timestamps");
        }
        Ok(replayed)
    }

    /// Stop the periodic correction task. Called once during interface
    /// teardown; later calls are no-ops.
    pub(crate) fn stop(&self) {
        let stop = self.stop.lock().unwrap_or_else(|p| p.into_inner()).take();
        drop(stop);
        let handle = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for Phc {
    fn drop(&mut self) {
        // The aux thread only holds a Weak, so it exits on its own; this
        // just avoids leaving it parked for a full interval.
        if let Ok(mut stop) = self.stop.lock() {
            stop.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::testing::MockDevice;

    fn phc_on(device: Arc<MockDevice>) -> Arc<Phc> {
        Phc::new(device).unwrap()
    }

    #[test]
    fn fold_cadence_stays_under_the_wrap_period() {
        // A 23-bit counter at 1 GHz wraps every ~8.4 ms; the fold task
        // has to run more often than that, not sit on a fixed floor.
        let wrap_ns = 1u64 << 23;
        assert!(fold_interval(wrap_ns) < Duration::from_nanos(wrap_ns));
        assert_eq!(fold_interval(8_000_000), Duration::from_millis(2));
        // Wide counters are capped rather than left to fold yearly.
        assert_eq!(fold_interval(u64::MAX), Duration::from_secs(3600));
    }

    #[test]
    fn now_advances_with_the_counter() {
        let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
        let phc = phc_on(device.clone());
        let t1 = phc.now();
        device.advance_clock(1_000);
        let t2 = phc.now();
        assert!(t2 > t1);
        phc.stop();
    }

    #[test]
    fn monotonic_across_a_counter_wrap() {
        let mut ident = MockDevice::default_identity();
        ident.hwclock_mask_bits = 16;
        let device = Arc::new(MockDevice::new(ident));
        let phc = phc_on(device.clone());

        device.advance_clock(0xfff0);
        let t1 = phc.now();
        phc.fold();
        device.advance_clock(0x20); // wraps the 16-bit counter
        let t2 = phc.now();
        assert!(t2 > t1, "wrap lost: {t1} -> {t2}");
        phc.stop();
    }

    #[test]
    fn adjust_steps_the_clock() {
        let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
        let phc = phc_on(device);
        let before = phc.now();
        phc.adjust(1_000_000);
        let after = phc.now();
        assert!(after >= before + 1_000_000);
        phc.stop();
    }

    #[test]
    fn unsupported_combination_is_rejected_without_hardware_writes() {
        let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
        let phc = phc_on(device.clone());
        let err = phc
            .set_timestamp_config(TimestampConfig {
                rx_filter: RxTimestampFilter::Off,
                tx_mode: TxTimestampMode::OneStepSync,
            })
            .unwrap_err();
        assert!(matches!(err, LifError::Unsupported(_)));
        assert!(device.admin_log().is_empty());
        assert_eq!(phc.timestamp_config(), TimestampConfig::default());
        phc.stop();
    }

    #[test]
    fn replay_translates_parked_stamps() {
        let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
        let phc = phc_on(device.clone());
        device.advance_clock(500);
        phc.defer_timestamp(100);
        phc.defer_timestamp(200);
        let replayed = phc.replay_pending_timestamps().unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[1] - replayed[0], 100);
        // Drained: a second replay finds nothing.
        assert!(phc.replay_pending_timestamps().unwrap().is_empty());
        phc.stop();
    }
}
