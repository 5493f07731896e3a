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

//! The logical interface (LIF) lifecycle controller.
//!
//! A [`Lif`] owns the queue-pair resource tables of one interface and
//! serializes every configuration transaction behind its configuration
//! lock. Notification producers never touch hardware directly; they queue
//! [`deferred::DeferredWork`] items that a single worker thread executes in
//! arrival order.
//!
//! Lock order, where more than one is held: configuration lock, then the
//! resource-table lock, then the clock lock inside [`crate::phc`]. The
//! resource-table lock is never held across a blocking admin call.

/// The deferred work scheduler
pub mod deferred;
/// Queue parameter negotiation
pub mod params;
/// Receive-side scaling configuration
pub mod rss;
/// The lifecycle state record
pub mod state;

use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use tracing::{Span, instrument};

use crate::coalesce::{CoalesceSettings, usecs_to_hw};
use crate::device::{
    ADMINQ_LENGTH, AdminCmd, AdminComp, DeviceAdapter, LIF_NAME_MAX_SZ, MacAddr, NOTIFYQ_LENGTH,
    QUEUE_FEATURE_HWSTAMP, QueueClass, RxMode,
};
use crate::error::LifError;
use crate::phc::Phc;
use crate::queue::stats::{LifSwStats, RxQueueStats, TxQueueStats};
use crate::queue::{IntrPolicy, QueuePair, QueuePairSpec, QueueTables};
use crate::{Result, log_then_return, new_error};
use deferred::{Deferred, DeferredWork};
use params::QueueParams;
use rss::{RSS_HASH_KEY_SIZE, RssConfig};
use state::{Flag, LifState};

/// Firmware status bit meaning the firmware is up and serving.
pub const FW_STATUS_RUNNING: u8 = 0x1;

/// Default ring size for tx and rx data queues, clamped to the device
/// maximum.
const DEFAULT_RING_DESCS: u32 = 1024;
/// Default interrupt coalescing, microseconds.
const DEFAULT_COAL_USECS: u32 = 64;

/// How a child interface relates to its parent's receive path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildIsolation {
    /// The child sees traffic steered by the parent's filters
    None,
    /// The child has its own steering domain
    Isolated,
}

/// Registration of a dependent child interface (e.g. a macvlan offload
/// slot). The parent invokes `reset_cb` when firmware goes down so the
/// child can park itself; whatever state the child needs is captured by the
/// closure.
pub struct ChildLifConfig {
    /// Child LIF index on hardware
    pub index: u32,
    /// Steering relationship to the parent
    pub isolation: ChildIsolation,
    /// Invoked at the start of a firmware-down event
    pub reset_cb: Box<dyn Fn() + Send + Sync>,
}

/// Live interface configuration, guarded by the configuration lock.
struct LifConfig {
    nxqs: u32,
    ntxq_descs: u32,
    nrxq_descs: u32,
    rxq_features: u64,
    rx_mode: RxMode,
    coalesce: CoalesceSettings,
    rss: RssConfig,
}

/// Control-plane coordinator for one logical interface.
///
/// Construct with [`Lif::allocate`], bring up with [`Lif::init`] and
/// [`Lif::register`], reshape with [`Lif::reconfigure`], and tear down with
/// [`Lif::shutdown`]. All methods are safe to call from any thread.
pub struct Lif {
    name: String,
    index: u32,
    hw_index: u32,
    device: Arc<dyn DeviceAdapter>,
    state: LifState,
    registered: Flag,
    link_up: Flag,
    link_down_count: AtomicU32,
    config: Mutex<LifConfig>,
    queues: Mutex<QueueTables>,
    filters: Mutex<Vec<MacAddr>>,
    deferred: Deferred,
    worker: Mutex<Option<JoinHandle<()>>>,
    phc: Option<Arc<Phc>>,
    child: Mutex<Option<ChildLifConfig>>,
}

impl std::fmt::Debug for Lif {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lif")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("hw_index", &self.hw_index)
            .finish_non_exhaustive()
    }
}

impl Lif {
    /// Allocate the software side of an interface: configuration defaults
    /// sized from device identity, the deferred-work worker thread, and
    /// the hardware clock synchronizer when the device can timestamp. No
    /// hardware resources are touched until [`Lif::init`].
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn allocate(
        device: Arc<dyn DeviceAdapter>,
        name: &str,
        index: u32,
        hw_index: u32,
    ) -> Result<Arc<Lif>> {
        if name.is_empty() || name.len() > LIF_NAME_MAX_SZ {
            return Err(LifError::InvalidConfiguration(format!(
                "interface name must be 1..={LIF_NAME_MAX_SZ} bytes, got {}",
                name.len()
            )));
        }
        let ident = device.identity().clone();
        if ident.max_queue_pairs == 0 {
            return Err(LifError::InvalidConfiguration(
                "device reports a queue-pair quota of zero".to_string(),
            ));
        }

        let nxqs = thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1)
            .min(ident.max_queue_pairs);
        let config = LifConfig {
            nxqs,
            ntxq_descs: DEFAULT_RING_DESCS.min(ident.tx_geometry.max_descs),
            nrxq_descs: DEFAULT_RING_DESCS.min(ident.rx_geometry.max_descs),
            rxq_features: 0,
            rx_mode: RxMode {
                unicast: true,
                multicast: true,
                broadcast: true,
                ..RxMode::default()
            },
            coalesce: CoalesceSettings::from_usecs(&ident, DEFAULT_COAL_USECS, DEFAULT_COAL_USECS),
            rss: RssConfig::new(nxqs, ident.rss_ind_tbl_len),
        };

        let (deferred, wake_rx) = Deferred::new();
        let phc = if ident.hwstamp_capable {
            Some(Phc::new(device.clone())?)
        } else {
            None
        };

        let lif = Arc::new(Lif {
            name: name.to_string(),
            index,
            hw_index,
            device,
            state: LifState::default(),
            registered: Flag::default(),
            link_up: Flag::default(),
            link_down_count: AtomicU32::new(0),
            config: Mutex::new(config),
            queues: Mutex::new(QueueTables::default()),
            filters: Mutex::new(Vec::new()),
            deferred,
            worker: Mutex::new(None),
            phc,
            child: Mutex::new(None),
        });

        // The worker holds only a weak handle so a dropped Lif does not
        // keep its own thread alive.
        let weak = Arc::downgrade(&lif);
        let handle = thread::Builder::new()
            .name(format!("{name}-deferred"))
            .spawn(move || {
                while wake_rx.recv().is_ok() {
                    let Some(lif) = weak.upgrade() else { break };
                    lif.drain_deferred();
                    if lif.state.shutting_down.get() {
                        break;
                    }
                }
            })
            .map_err(|e| new_error!("failed to spawn deferred worker: {e}"))?;
        *lif
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(handle);

        info!("{}: allocated with {nxqs} queue pairs", lif.name);
        Ok(lif)
    }

    /// The interface name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The software interface index
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The hardware LIF index
    pub fn hw_index(&self) -> u32 {
        self.hw_index
    }

    /// The lifecycle state record
    pub fn state(&self) -> &LifState {
        &self.state
    }

    /// The hardware clock synchronizer, present when the device can
    /// timestamp packets
    pub fn phc(&self) -> Option<&Arc<Phc>> {
        self.phc.as_ref()
    }

    /// Whether the interface is registered with its embedder
    pub fn is_registered(&self) -> bool {
        self.registered.get()
    }

    /// Last observed link state
    pub fn is_link_up(&self) -> bool {
        self.link_up.get()
    }

    /// How many times the link has been observed going down
    pub fn link_down_count(&self) -> u32 {
        self.link_down_count.load(Ordering::Relaxed)
    }

    /// Items currently waiting in the deferred queue
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    fn config_lock(&self) -> Result<MutexGuard<'_, LifConfig>> {
        self.config
            .lock()
            .map_err(|e| new_error!("error locking at {}:{}: {}", file!(), line!(), e))
    }

    /// Issue an admin command, marking the interface broken on a fatal
    /// transport failure.
    fn admin(&self, cmd: AdminCmd) -> Result<AdminComp> {
        self.note_fatal(self.device.admin(cmd))
    }

    fn note_fatal<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(e) = &res {
            if e.is_fatal() {
                self.mark_broken(e);
            }
        }
        res
    }

    fn mark_broken(&self, cause: &LifError) {
        if !self.state.broken.test_and_set() {
            error!("{}: marked broken: {cause}", self.name);
        }
    }

    // ---- lifecycle ----

    /// Provision the interface on hardware: LIF init plus the admin and
    /// notify queues. Idempotent; calling on an initialized interface is a
    /// no-op.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn init(&self) -> Result<()> {
        let _config = self.config_lock()?;
        self.state.check_not_broken()?;
        self.state.check_not_shutting_down()?;
        if self.state.initialized.get() {
            debug!("{}: init: already initialized", self.name);
            return Ok(());
        }

        self.admin(AdminCmd::LifInit {
            hw_index: self.hw_index,
        })?;
        self.build_adminq_notifyq()?;
        self.state.initialized.set(true);
        info!("{}: initialized", self.name);
        Ok(())
    }

    /// Release everything init acquired. Unregisters first if needed.
    /// Idempotent.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn deinit(&self) -> Result<()> {
        let _config = self.config_lock()?;
        if !self.state.initialized.get() {
            debug!("{}: deinit: not initialized", self.name);
            return Ok(());
        }
        self.unregister_locked();
        {
            let mut tables = self.queues.lock().unwrap_or_else(|p| p.into_inner());
            tables.free_all(&*self.device);
        }
        if !self.state.broken.get() {
            if let Err(e) = self.admin(AdminCmd::LifReset {
                hw_index: self.hw_index,
            }) {
                warn!("{}: lif reset during deinit failed: {e}", self.name);
            }
        }
        self.state.initialized.set(false);
        info!("{}: deinitialized", self.name);
        Ok(())
    }

    /// Bring up the data path: allocate and enable the tx/rx queue pairs
    /// for the current configuration and mark the interface up. Idempotent.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn register(&self) -> Result<()> {
        let config = self.config_lock()?;
        self.state.check_not_broken()?;
        self.state.check_not_shutting_down()?;
        if self.registered.get() {
            debug!("{}: register: already registered", self.name);
            return Ok(());
        }
        if !self.state.initialized.get() {
            log_then_return!(LifError::InvalidConfiguration(
                "cannot register an uninitialized interface".to_string(),
            ));
        }

        let shape = self.params_locked(&config);
        self.start_txrx(&config, &shape)?;
        self.state.up.set(true);
        self.registered.set(true);
        drop(config);

        self.link_status_check_request();
        info!("{}: registered", self.name);
        Ok(())
    }

    /// Take down the data path, freeing the tx/rx queue pairs. The admin
    /// and notify queues stay. Idempotent.
    pub fn unregister(&self) -> Result<()> {
        let _config = self.config_lock()?;
        self.unregister_locked();
        Ok(())
    }

    fn unregister_locked(&self) {
        if !self.registered.get() {
            return;
        }
        self.stop_txrx();
        self.state.hwstamp_enabled.set(false);
        self.registered.set(false);
        info!("{}: unregistered", self.name);
    }

    /// Stop the worker thread, release hardware resources, and stop the
    /// clock synchronizer. Pending deferred work is discarded. Idempotent;
    /// after shutdown every configuration request fails with
    /// [`LifError::ShuttingDown`].
    pub fn shutdown(&self) {
        if self.state.shutting_down.test_and_set() {
            return;
        }
        info!("{}: shutting down", self.name);

        // Kick the worker so it observes the flag and exits.
        self.deferred.notify();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let dropped = self.deferred.discard_all();
        if dropped > 0 {
            debug!("{}: discarded {dropped} deferred items at shutdown", self.name);
        }

        if let Some(phc) = &self.phc {
            phc.stop();
        }
        if let Err(e) = self.deinit() {
            warn!("{}: deinit during shutdown failed: {e}", self.name);
        }
    }

    /// Full reset: tear everything down, re-init on hardware, replay the
    /// filter list, and restore the data path if it was up. This is the
    /// one path that clears the broken condition.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn restart(&self) -> Result<()> {
        let config = self.config_lock()?;
        self.state.check_not_shutting_down()?;
        crate::metrics::lif_reset();
        info!("{}: restarting", self.name);

        let was_up = self.state.up.get() || self.registered.get();
        self.stop_txrx();
        {
            let mut tables = self.queues.lock().unwrap_or_else(|p| p.into_inner());
            tables.free_all(&*self.device);
        }
        self.state.initialized.set(false);

        self.note_fatal(self.device.admin(AdminCmd::LifReset {
            hw_index: self.hw_index,
        }))?;
        self.note_fatal(self.device.admin(AdminCmd::LifInit {
            hw_index: self.hw_index,
        }))?;
        self.build_adminq_notifyq()?;
        self.state.initialized.set(true);

        self.replay_filters();

        if was_up {
            let shape = self.params_locked(&config);
            self.start_txrx(&config, &shape)?;
            self.state.up.set(true);
            self.restore_hwstamp_queues(&config);
        }
        if let Some(phc) = &self.phc {
            if let Err(e) = phc.replay_pending_timestamps() {
                warn!("{}: timestamp replay after restart failed: {e}", self.name);
            }
        }

        self.state.fw_reset_in_progress.set(false);
        self.state.fw_stopping.set(false);
        self.state.broken.set(false);
        info!("{}: restarted", self.name);
        Ok(())
    }

    // ---- queue shape ----

    /// Pure read of the current queue shape. Pair with
    /// [`Lif::reconfigure`] for a snapshot/apply round trip.
    pub fn queue_params(&self) -> Result<QueueParams> {
        let config = self.config_lock()?;
        Ok(self.params_locked(&config))
    }

    /// Reshape the data queues. Validation happens before any hardware
    /// mutation; on an interface that is not up the new shape is only
    /// recorded. On a live interface the old queues are torn down and the
    /// new shape built; if that fails the previous shape is rebuilt and
    /// the original error returned. A rollback that itself fails leaves
    /// the interface broken with the data path down. A timestamp queue
    /// pair in use before the reshape is recreated past the new data
    /// queues.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn reconfigure(&self, requested: QueueParams) -> Result<()> {
        let mut config = self.config_lock()?;
        self.state.check_not_broken()?;
        self.state.check_not_shutting_down()?;

        let ident = self.device.identity();
        requested.validate(ident)?;
        // One extra vector serves the admin/notify pair.
        let vectors = requested.intr_vectors_needed() + 1;
        if vectors > ident.max_intr_vectors {
            return Err(LifError::OutOfInterruptVectors {
                requested: vectors,
                available: ident.max_intr_vectors,
            });
        }

        let previous = self.params_locked(&config);
        if requested == previous {
            debug!("{}: reconfigure: no change", self.name);
            return Ok(());
        }
        if !self.state.up.get() {
            self.commit_params(&mut config, &requested);
            debug!("{}: reconfigure: recorded while down", self.name);
            return Ok(());
        }

        self.stop_txrx();
        match self.start_txrx(&config, &requested) {
            Ok(()) => {
                self.commit_params(&mut config, &requested);
                self.state.up.set(true);
                self.restore_hwstamp_queues(&config);
                if let Some(phc) = &self.phc {
                    if let Err(e) = phc.replay_pending_timestamps() {
                        warn!("{}: timestamp replay after reconfigure failed: {e}", self.name);
                    }
                }
                info!(
                    "{}: reconfigured to {} queue pairs",
                    self.name, requested.nxqs
                );
                Ok(())
            }
            Err(e) => {
                warn!("{}: reconfigure failed: {e}; rolling back", self.name);
                crate::metrics::reconfigure_rollback();
                match self.start_txrx(&config, &previous) {
                    Ok(()) => {
                        self.state.up.set(true);
                        self.restore_hwstamp_queues(&config);
                    }
                    Err(rollback_err) => {
                        self.mark_broken(&rollback_err);
                        error!(
                            "{}: rollback failed: {rollback_err}; data path is down",
                            self.name
                        );
                    }
                }
                Err(e)
            }
        }
    }

    fn params_locked(&self, config: &LifConfig) -> QueueParams {
        QueueParams {
            nxqs: config.nxqs,
            ntxq_descs: config.ntxq_descs,
            nrxq_descs: config.nrxq_descs,
            rxq_features: config.rxq_features,
            intr_split: self.state.split_interrupts.get(),
            cmb_tx: self.state.cmb_tx_rings.get(),
            cmb_rx: self.state.cmb_rx_rings.get(),
        }
    }

    fn commit_params(&self, config: &mut LifConfig, shape: &QueueParams) {
        config.nxqs = shape.nxqs;
        config.ntxq_descs = shape.ntxq_descs;
        config.nrxq_descs = shape.nrxq_descs;
        config.rxq_features = shape.rxq_features;
        config.rss.spread(shape.nxqs);
        self.state.split_interrupts.set(shape.intr_split);
        self.state.cmb_tx_rings.set(shape.cmb_tx);
        self.state.cmb_rx_rings.set(shape.cmb_rx);
    }

    // ---- data path bring-up / teardown ----

    fn build_adminq_notifyq(&self) -> Result<()> {
        let adminq = self.note_fatal(QueuePair::build(
            &*self.device,
            QueuePairSpec {
                class: QueueClass::Admin,
                index: 0,
                num_descs: ADMINQ_LENGTH,
                features: 0,
                sg: false,
                intr: IntrPolicy::Dedicated,
                cmb: false,
                stats: false,
            },
        ))?;
        let notify_intr = match adminq.intr_index() {
            Some(vector) => IntrPolicy::Shared(vector),
            None => IntrPolicy::Dedicated,
        };
        let notifyq = match self.note_fatal(QueuePair::build(
            &*self.device,
            QueuePairSpec {
                class: QueueClass::Notify,
                index: 0,
                num_descs: NOTIFYQ_LENGTH,
                features: 0,
                sg: false,
                intr: notify_intr,
                cmb: false,
                stats: false,
            },
        )) {
            Ok(qcq) => qcq,
            Err(e) => {
                let mut adminq = adminq;
                adminq.teardown(&*self.device);
                return Err(e);
            }
        };

        let mut tables = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        tables.adminq = Some(adminq);
        tables.notifyq = Some(notifyq);
        Ok(())
    }

    /// Allocate, enable, and install the tx/rx queue pairs for `shape`.
    /// Fully transactional: any failure releases everything this call
    /// acquired before the error is returned. Does not touch the `up`
    /// flag; the caller owns that transition.
    fn start_txrx(&self, config: &LifConfig, shape: &QueueParams) -> Result<()> {
        self.state.check_not_shutting_down()?;
        let (txqs, rxqs) = self.build_txrx(config, shape)?;

        let activate = (|| -> Result<()> {
            for qcq in rxqs.iter().chain(txqs.iter()) {
                self.admin(AdminCmd::QueueControl {
                    class: qcq.class(),
                    index: qcq.index(),
                    enable: true,
                })?;
            }
            let mut rss = config.rss.clone();
            rss.spread(shape.nxqs);
            self.admin(AdminCmd::RssSet {
                types: rss.types,
                key: rss.key,
                indir: rss.indir,
            })?;
            Ok(())
        })();
        if let Err(e) = activate {
            self.teardown_set(txqs, rxqs);
            return Err(e);
        }

        // Receive mode is best-effort; a rejection leaves the device in
        // its default mode rather than failing the bring-up.
        if let Err(e) = self.admin(AdminCmd::RxModeSet {
            mode: config.rx_mode,
        }) {
            warn!("{}: rx mode apply failed: {e}", self.name);
        }

        let mut tables = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        tables.txqs = txqs;
        tables.rxqs = rxqs;
        Ok(())
    }

    fn build_txrx(
        &self,
        config: &LifConfig,
        shape: &QueueParams,
    ) -> Result<(Vec<QueuePair>, Vec<QueuePair>)> {
        let ident = self.device.identity();
        let rx_hw = usecs_to_hw(
            config.coalesce.rx_usecs,
            ident.intr_coal_mult,
            ident.intr_coal_div,
        );
        let tx_hw = usecs_to_hw(
            config.coalesce.tx_usecs,
            ident.intr_coal_mult,
            ident.intr_coal_div,
        );
        let mut txqs: Vec<QueuePair> = Vec::with_capacity(shape.nxqs as usize);
        let mut rxqs: Vec<QueuePair> = Vec::with_capacity(shape.nxqs as usize);

        for i in 0..shape.nxqs {
            let rxq = match self.note_fatal(QueuePair::build(
                &*self.device,
                QueuePairSpec {
                    class: QueueClass::Rx,
                    index: i,
                    num_descs: shape.nrxq_descs,
                    features: shape.rxq_features,
                    sg: true,
                    intr: IntrPolicy::Dedicated,
                    cmb: shape.cmb_rx,
                    stats: true,
                },
            )) {
                Ok(qcq) => qcq,
                Err(e) => {
                    self.teardown_set(txqs, rxqs);
                    return Err(e);
                }
            };
            if let Some(vector) = rxq.intr_index() {
                if let Err(e) = self.admin(AdminCmd::CoalesceSet {
                    intr_index: vector,
                    hw_units: rx_hw,
                }) {
                    let mut rxq = rxq;
                    rxq.teardown(&*self.device);
                    self.teardown_set(txqs, rxqs);
                    return Err(e);
                }
            }
            rxqs.push(rxq);

            let tx_intr = if shape.intr_split {
                IntrPolicy::Dedicated
            } else {
                match rxqs.last().and_then(|qcq| qcq.intr_index()) {
                    Some(vector) => IntrPolicy::Shared(vector),
                    None => IntrPolicy::Dedicated,
                }
            };
            let txq = match self.note_fatal(QueuePair::build(
                &*self.device,
                QueuePairSpec {
                    class: QueueClass::Tx,
                    index: i,
                    num_descs: shape.ntxq_descs,
                    features: 0,
                    sg: true,
                    intr: tx_intr,
                    cmb: shape.cmb_tx,
                    stats: true,
                },
            )) {
                Ok(qcq) => qcq,
                Err(e) => {
                    self.teardown_set(txqs, rxqs);
                    return Err(e);
                }
            };
            if shape.intr_split {
                if let Some(vector) = txq.intr_index() {
                    if let Err(e) = self.admin(AdminCmd::CoalesceSet {
                        intr_index: vector,
                        hw_units: tx_hw,
                    }) {
                        let mut txq = txq;
                        txq.teardown(&*self.device);
                        self.teardown_set(txqs, rxqs);
                        return Err(e);
                    }
                }
            }
            txqs.push(txq);
        }
        Ok((txqs, rxqs))
    }

    fn teardown_set(&self, txqs: Vec<QueuePair>, rxqs: Vec<QueuePair>) {
        for mut qcq in txqs.into_iter().chain(rxqs) {
            qcq.teardown(&*self.device);
        }
    }

    /// Disable and free the data queues, clearing `up` first so no new
    /// work lands on rings being torn down. Queue disables are skipped
    /// when the device is broken or the firmware is away.
    fn stop_txrx(&self) {
        self.state.up.set(false);
        let (txqs, rxqs, hwstamp_txq, hwstamp_rxq) = {
            let mut tables = self.queues.lock().unwrap_or_else(|p| p.into_inner());
            (
                mem::take(&mut tables.txqs),
                mem::take(&mut tables.rxqs),
                tables.hwstamp_txq.take(),
                tables.hwstamp_rxq.take(),
            )
        };
        let device_reachable =
            !self.state.broken.get() && !self.state.fw_reset_in_progress.get();
        let all = txqs
            .into_iter()
            .chain(rxqs)
            .chain(hwstamp_txq)
            .chain(hwstamp_rxq);
        for mut qcq in all {
            if device_reachable {
                if let Err(e) = self.device.admin(AdminCmd::QueueControl {
                    class: qcq.class(),
                    index: qcq.index(),
                    enable: false,
                }) {
                    debug!("{}: queue disable failed during stop: {e}", self.name);
                }
            }
            qcq.teardown(&*self.device);
        }
    }

    /// Create the dedicated timestamp tx/rx queue pair, one index past the
    /// data queues. Requires a running interface on a timestamp-capable
    /// device. Idempotent.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn create_hwstamp_queues(&self) -> Result<()> {
        let config = self.config_lock()?;
        self.state.check_not_broken()?;
        self.state.check_not_shutting_down()?;
        if self.phc.is_none() {
            return Err(LifError::Unsupported(
                "no hardware clock on this device".to_string(),
            ));
        }
        if !self.state.up.get() {
            return Err(LifError::InvalidConfiguration(
                "timestamp queues require a running interface".to_string(),
            ));
        }
        {
            let tables = self.queues.lock().unwrap_or_else(|p| p.into_inner());
            if tables.hwstamp_txq.is_some() && tables.hwstamp_rxq.is_some() {
                return Ok(());
            }
        }

        self.build_hwstamp_queues(&config)?;
        self.state.hwstamp_enabled.set(true);
        Ok(())
    }

    /// Recreate the timestamp pair after a data-path rebuild when it was
    /// in use before the teardown. Best effort: the rest of the rebuild
    /// stands even if this fails, and the pending-stamp replay still runs.
    fn restore_hwstamp_queues(&self, config: &LifConfig) {
        if !self.state.hwstamp_enabled.get() {
            return;
        }
        if let Err(e) = self.build_hwstamp_queues(config) {
            warn!("{}: timestamp queue rebuild failed: {e}", self.name);
        }
    }

    /// Allocate, enable, and install the timestamp pair at the index just
    /// past the data queues. Caller holds the configuration lock and has
    /// verified the data path is up.
    fn build_hwstamp_queues(&self, config: &LifConfig) -> Result<()> {
        let hw_index = config.nxqs;
        let txq = self.note_fatal(QueuePair::build(
            &*self.device,
            QueuePairSpec {
                class: QueueClass::Tx,
                index: hw_index,
                num_descs: config.ntxq_descs,
                features: QUEUE_FEATURE_HWSTAMP,
                sg: true,
                intr: IntrPolicy::Dedicated,
                cmb: false,
                stats: true,
            },
        ))?;
        let rxq = match self.note_fatal(QueuePair::build(
            &*self.device,
            QueuePairSpec {
                class: QueueClass::Rx,
                index: hw_index,
                num_descs: config.nrxq_descs,
                features: QUEUE_FEATURE_HWSTAMP,
                sg: true,
                intr: IntrPolicy::Dedicated,
                cmb: false,
                stats: true,
            },
        )) {
            Ok(qcq) => qcq,
            Err(e) => {
                let mut txq = txq;
                txq.teardown(&*self.device);
                return Err(e);
            }
        };

        let activate = (|| -> Result<()> {
            for qcq in [&rxq, &txq] {
                self.admin(AdminCmd::QueueControl {
                    class: qcq.class(),
                    index: qcq.index(),
                    enable: true,
                })?;
            }
            Ok(())
        })();
        if let Err(e) = activate {
            self.teardown_set(vec![txq], vec![rxq]);
            return Err(e);
        }

        let mut tables = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        tables.hwstamp_txq = Some(txq);
        tables.hwstamp_rxq = Some(rxq);
        info!("{}: timestamp queues created at index {hw_index}", self.name);
        Ok(())
    }

    // ---- deferred work ----

    /// Hand a work item to the worker. The typed helpers below are usually
    /// more convenient; note that enqueueing [`DeferredWork::LinkCheck`]
    /// directly bypasses the dedupe in
    /// [`Lif::link_status_check_request`]. Callable from any context; never
    /// blocks.
    pub fn deferred_enqueue(&self, work: DeferredWork) {
        self.deferred.enqueue(work);
    }

    /// Queue a link-status recheck, deduplicating against one already
    /// queued or running. Callable from any context; never blocks.
    pub fn link_status_check_request(&self) {
        if !self.state.link_check_requested.test_and_set() {
            self.deferred.enqueue(DeferredWork::LinkCheck);
        }
    }

    /// Feed a firmware reset notification into the deferred queue.
    /// Callable from any context; never blocks.
    pub fn fw_reset_notify(&self, fw_status: u8) {
        self.deferred.enqueue(DeferredWork::LifReset { fw_status });
    }

    /// Queue an rx-filter addition for asynchronous execution.
    pub fn addr_add_deferred(&self, addr: MacAddr) {
        self.deferred
            .enqueue(DeferredWork::AddressChange { addr, add: true });
    }

    /// Queue an rx-filter removal for asynchronous execution.
    pub fn addr_del_deferred(&self, addr: MacAddr) {
        self.deferred
            .enqueue(DeferredWork::AddressChange { addr, add: false });
    }

    fn drain_deferred(&self) {
        loop {
            if self.state.shutting_down.get() {
                let dropped = self.deferred.discard_all();
                if dropped > 0 {
                    debug!("{}: discarded {dropped} deferred items", self.name);
                }
                return;
            }
            let Some(work) = self.deferred.pop() else {
                return;
            };
            match self.process_deferred(work) {
                Ok(()) => crate::metrics::deferred_processed(),
                Err(e) => {
                    crate::metrics::deferred_failed();
                    warn!("{}: deferred work failed: {e}", self.name);
                }
            }
        }
    }

    fn process_deferred(&self, work: DeferredWork) -> Result<()> {
        match work {
            DeferredWork::AddressChange { addr, add } => {
                if add {
                    self.addr_add(&addr)
                } else {
                    self.addr_del(&addr)
                }
            }
            DeferredWork::LinkCheck => self.link_status_check(),
            DeferredWork::LifReset { fw_status } => self.handle_fw_reset(fw_status),
        }
    }

    fn link_status_check(&self) -> Result<()> {
        let res = (|| -> Result<()> {
            if self.state.broken.get() {
                // Nothing to learn from a broken device; wait for restart.
                return Ok(());
            }
            let comp = self.admin(AdminCmd::PortStatusGet)?;
            if let AdminComp::LinkStatus { up, speed_mbps } = comp {
                let was_up = self.link_up.get();
                if up != was_up {
                    self.link_up.set(up);
                    if up {
                        info!("{}: link up, {speed_mbps} Mbps", self.name);
                    } else {
                        self.link_down_count.fetch_add(1, Ordering::Relaxed);
                        info!("{}: link down", self.name);
                    }
                }
            }
            Ok(())
        })();
        // Clear even on failure so the next request re-arms.
        self.state.link_check_requested.set(false);
        res
    }

    fn handle_fw_reset(&self, fw_status: u8) -> Result<()> {
        if fw_status & FW_STATUS_RUNNING == 0 {
            // The park is a configuration transaction like any other: it
            // must wait out an in-flight reconfigure, or that transaction
            // would re-raise the data path after the queues were parked.
            let _config = self.config_lock()?;
            if self.state.fw_reset_in_progress.test_and_set() {
                // Already parked; duplicate down notifications are normal
                // while firmware is away.
                return Ok(());
            }
            info!("{}: firmware stopped; parking data queues", self.name);
            self.state.fw_stopping.set(true);
            if let Some(child) = &*self.child.lock().unwrap_or_else(|p| p.into_inner()) {
                (child.reset_cb)();
            }
            self.stop_txrx();
            self.state.fw_stopping.set(false);
            Ok(())
        } else if self.state.fw_reset_in_progress.get() {
            info!("{}: firmware is back; restoring", self.name);
            self.restart()
        } else {
            Ok(())
        }
    }

    // ---- rx filters and modes ----

    /// Add a MAC rx filter, synchronously. Already-present addresses are a
    /// no-op. A hardware rejection leaves the list unchanged and flags the
    /// filter table for a later sync.
    pub fn addr_add(&self, addr: &MacAddr) -> Result<()> {
        let mut filters = self.filters.lock().unwrap_or_else(|p| p.into_inner());
        if filters.contains(addr) {
            return Ok(());
        }
        match self.admin(AdminCmd::RxFilterAdd { addr: *addr }) {
            Ok(_) => {
                filters.push(*addr);
                Ok(())
            }
            Err(e) => {
                self.state.filter_sync_needed.set(true);
                Err(e)
            }
        }
    }

    /// Remove a MAC rx filter, synchronously. Absent addresses are a no-op.
    pub fn addr_del(&self, addr: &MacAddr) -> Result<()> {
        let mut filters = self.filters.lock().unwrap_or_else(|p| p.into_inner());
        let Some(pos) = filters.iter().position(|have| have == addr) else {
            return Ok(());
        };
        match self.admin(AdminCmd::RxFilterDel { addr: *addr }) {
            Ok(_) => {
                filters.remove(pos);
                Ok(())
            }
            Err(e) => {
                self.state.filter_sync_needed.set(true);
                Err(e)
            }
        }
    }

    /// The current MAC filter list
    pub fn filters(&self) -> Vec<MacAddr> {
        self.filters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn replay_filters(&self) {
        let filters = self.filters();
        let mut failed = false;
        for addr in &filters {
            if let Err(e) = self.admin(AdminCmd::RxFilterAdd { addr: *addr }) {
                warn!("{}: filter replay for {addr:02x?} failed: {e}", self.name);
                failed = true;
            }
        }
        self.state.filter_sync_needed.set(failed);
    }

    /// Apply a receive mode and record it for replay after resets.
    pub fn set_rx_mode(&self, mode: RxMode) -> Result<()> {
        let mut config = self.config_lock()?;
        self.state.check_not_broken()?;
        self.admin(AdminCmd::RxModeSet { mode })?;
        config.rx_mode = mode;
        Ok(())
    }

    // ---- coalescing and rss ----

    /// Set interrupt moderation in microseconds for tx and rx vectors.
    /// Values are converted to hardware units, recorded, and programmed on
    /// every live vector. The record is committed before programming: if a
    /// vector rejects the write the error is returned, but the recorded
    /// values stay authoritative and the next queue build applies them to
    /// every vector.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn set_coalesce(&self, tx_usecs: u32, rx_usecs: u32) -> Result<()> {
        let mut config = self.config_lock()?;
        self.state.check_not_broken()?;
        let settings = CoalesceSettings::from_usecs(self.device.identity(), tx_usecs, rx_usecs);
        config.coalesce = settings;

        // Collect targets under the table lock, program them after.
        let programs: Vec<(u32, u32)> = {
            let tables = self.queues.lock().unwrap_or_else(|p| p.into_inner());
            let mut programs = Vec::new();
            for qcq in &tables.rxqs {
                if let Some(vector) = qcq.intr_index() {
                    programs.push((vector, settings.rx_hw));
                }
            }
            if self.state.split_interrupts.get() {
                for qcq in &tables.txqs {
                    if let Some(vector) = qcq.intr_index() {
                        programs.push((vector, settings.tx_hw));
                    }
                }
            }
            programs
        };
        for (vector, hw_units) in programs {
            self.admin(AdminCmd::CoalesceSet {
                intr_index: vector,
                hw_units,
            })?;
        }
        Ok(())
    }

    /// The current coalescing settings
    pub fn coalesce(&self) -> Result<CoalesceSettings> {
        Ok(self.config_lock()?.coalesce)
    }

    /// Update RSS hashing: any of the hash-type bits, the Toeplitz key,
    /// and the indirection table. `None` keeps the current value. The
    /// indirection table is validated against the live queue count before
    /// anything reaches hardware.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn rss_config(
        &self,
        types: Option<u16>,
        key: Option<&[u8; RSS_HASH_KEY_SIZE]>,
        indir: Option<&[u32]>,
    ) -> Result<()> {
        let mut config = self.config_lock()?;
        self.state.check_not_broken()?;

        let mut rss = config.rss.clone();
        if let Some(types) = types {
            rss.types = types;
        }
        if let Some(key) = key {
            rss.key = *key;
        }
        if let Some(indir) = indir {
            if indir.len() != rss.indir.len() {
                return Err(LifError::InvalidConfiguration(format!(
                    "rss indirection table must have {} entries, got {}",
                    rss.indir.len(),
                    indir.len()
                )));
            }
            RssConfig::validate_indir(indir, config.nxqs)?;
            rss.indir.copy_from_slice(indir);
        }

        self.admin(AdminCmd::RssSet {
            types: rss.types,
            key: rss.key,
            indir: rss.indir.clone(),
        })?;
        config.rss = rss;
        Ok(())
    }

    // ---- statistics ----

    /// Aggregate per-queue software counters across all live data queues.
    pub fn sw_stats(&self) -> LifSwStats {
        let tables = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        let mut total = LifSwStats::default();
        for qcq in tables.txqs.iter().chain(tables.hwstamp_txq.iter()) {
            if let Some(stats) = qcq.tx_stats() {
                total.add_tx(&stats.snapshot());
            }
        }
        for qcq in tables.rxqs.iter().chain(tables.hwstamp_rxq.iter()) {
            if let Some(stats) = qcq.rx_stats() {
                total.add_rx(&stats.snapshot());
            }
        }
        total
    }

    /// Shared handle to the statistics record of tx queue `index`, for the
    /// fast path to update without any lock.
    pub fn tx_stats(&self, index: u32) -> Option<Arc<TxQueueStats>> {
        let tables = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        tables
            .txqs
            .get(index as usize)
            .and_then(|qcq| qcq.tx_stats().cloned())
    }

    /// Shared handle to the statistics record of rx queue `index`.
    pub fn rx_stats(&self, index: u32) -> Option<Arc<RxQueueStats>> {
        let tables = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        tables
            .rxqs
            .get(index as usize)
            .and_then(|qcq| qcq.rx_stats().cloned())
    }

    // ---- children ----

    /// Attach a child interface registration. Replaces any previous one.
    pub fn set_child_config(&self, child: ChildLifConfig) {
        *self.child.lock().unwrap_or_else(|p| p.into_inner()) = Some(child);
    }

    /// Detach the child interface registration, if any.
    pub fn clear_child_config(&self) {
        *self.child.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

impl QueueParams {
    /// Pure read of a LIF's current queue shape; equivalent to
    /// [`Lif::queue_params`].
    pub fn snapshot(lif: &Lif) -> Result<QueueParams> {
        lif.queue_params()
    }
}

impl Drop for Lif {
    fn drop(&mut self) {
        self.state.shutting_down.set(true);
        let mut tables = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        tables.free_all(&*self.device);
    }
}
