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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use nicplane::device::{
    AdminCmd, AdminComp, DeviceAdapter, DeviceIdentity, MacAddr,
};
use nicplane::error::LifError;
use nicplane::lif::{ChildIsolation, ChildLifConfig, FW_STATUS_RUNNING};
use nicplane::testing::MockDevice;
use nicplane::{Lif, QueueParams};

fn shape(nxqs: u32) -> QueueParams {
    QueueParams {
        nxqs,
        ntxq_descs: 128,
        nrxq_descs: 128,
        rxq_features: 0,
        intr_split: false,
        cmb_tx: false,
        cmb_rx: false,
    }
}

/// Allocate, init, set a deterministic queue shape, and register.
fn bring_up(device: &Arc<MockDevice>, nxqs: u32) -> Arc<Lif> {
    let lif = Lif::allocate(device.clone(), "eth0", 0, 1).unwrap();
    lif.init().unwrap();
    lif.reconfigure(shape(nxqs)).unwrap();
    lif.register().unwrap();
    lif
}

/// Poll until `cond` holds; the deferred worker runs on its own thread.
fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

/// Wraps a [`MockDevice`], parking `QueueInit` commands while the gate is
/// closed so a configuration transaction can be held in flight.
#[derive(Debug)]
struct GatedDevice {
    inner: Arc<MockDevice>,
    gate_closed: AtomicBool,
    gated_calls: AtomicU32,
}

impl GatedDevice {
    fn new(inner: Arc<MockDevice>) -> GatedDevice {
        GatedDevice {
            inner,
            gate_closed: AtomicBool::new(false),
            gated_calls: AtomicU32::new(0),
        }
    }

    fn close_gate(&self) {
        self.gate_closed.store(true, Ordering::SeqCst);
    }

    fn open_gate(&self) {
        self.gate_closed.store(false, Ordering::SeqCst);
    }

    /// How many callers have reached the closed gate.
    fn gated_calls(&self) -> u32 {
        self.gated_calls.load(Ordering::SeqCst)
    }
}

impl DeviceAdapter for GatedDevice {
    fn identity(&self) -> &DeviceIdentity {
        self.inner.identity()
    }

    fn admin(&self, cmd: AdminCmd) -> nicplane::Result<AdminComp> {
        if matches!(cmd, AdminCmd::QueueInit { .. })
            && self.gate_closed.load(Ordering::SeqCst)
        {
            self.gated_calls.fetch_add(1, Ordering::SeqCst);
            while self.gate_closed.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        }
        self.inner.admin(cmd)
    }

    fn intr_alloc(&self) -> nicplane::Result<u32> {
        self.inner.intr_alloc()
    }

    fn intr_free(&self, index: u32) {
        self.inner.intr_free(index)
    }

    fn cmb_alloc(&self, pages: u32) -> nicplane::Result<u32> {
        self.inner.cmb_alloc(pages)
    }

    fn cmb_free(&self, pgid: u32, pages: u32) {
        self.inner.cmb_free(pgid, pages)
    }

    fn hwclock_read(&self) -> u64 {
        self.inner.hwclock_read()
    }
}

#[test]
fn bringup_and_teardown_balance_vector_accounting() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 4);

    // One vector for admin/notify, one per rx queue; tx shares its pair's.
    assert_eq!(device.intr_in_use(), 5);

    lif.unregister().unwrap();
    assert_eq!(device.intr_in_use(), 1);
    assert!(!lif.state().up.get());

    lif.deinit().unwrap();
    assert_eq!(device.intr_in_use(), 0);
    assert_eq!(device.cmb_pages_in_use(), 0);
    lif.shutdown();
}

#[test]
fn reconfigure_grows_and_shrinks_the_data_path() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 4);
    assert_eq!(device.intr_in_use(), 5);

    lif.reconfigure(shape(8)).unwrap();
    assert_eq!(device.intr_in_use(), 9);
    assert_eq!(lif.queue_params().unwrap().nxqs, 8);

    lif.reconfigure(shape(2)).unwrap();
    assert_eq!(device.intr_in_use(), 3);
    assert_eq!(lif.queue_params().unwrap().nxqs, 2);

    lif.shutdown();
    assert_eq!(device.intr_in_use(), 0);
}

#[test]
fn split_interrupts_double_the_vector_demand() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 4);

    let split = QueueParams {
        intr_split: true,
        ..shape(4)
    };
    lif.reconfigure(split).unwrap();
    assert_eq!(device.intr_in_use(), 9);
    assert!(lif.state().split_interrupts.get());

    lif.reconfigure(shape(4)).unwrap();
    assert_eq!(device.intr_in_use(), 5);
    assert!(!lif.state().split_interrupts.get());
    lif.shutdown();
}

#[test]
fn vector_demand_is_checked_before_any_teardown() {
    let mut ident = MockDevice::default_identity();
    ident.max_intr_vectors = 6;
    let device = Arc::new(MockDevice::new(ident));
    let lif = bring_up(&device, 4);
    assert_eq!(device.intr_in_use(), 5);

    // 4 split pairs need 9 vectors; the device has 6. The request must be
    // rejected up front with the live queues untouched.
    let split = QueueParams {
        intr_split: true,
        ..shape(4)
    };
    let err = lif.reconfigure(split).unwrap_err();
    assert!(matches!(err, LifError::OutOfInterruptVectors { .. }), "{err}");
    assert_eq!(device.intr_in_use(), 5);
    assert!(lif.state().up.get());
    lif.shutdown();
}

#[test]
fn failed_reconfigure_rolls_back_at_every_allocation_point() {
    for fail_at in 0..8 {
        let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
        let lif = bring_up(&device, 4);
        assert_eq!(device.intr_in_use(), 5);

        device.fail_intr_allocs_after(fail_at);
        let err = lif.reconfigure(shape(8)).unwrap_err();
        assert!(
            matches!(err, LifError::OutOfInterruptVectors { .. }),
            "fail_at={fail_at}: {err}"
        );

        // Rolled back to the previous shape, fully functional, not broken.
        assert_eq!(device.intr_in_use(), 5, "fail_at={fail_at}");
        assert_eq!(lif.queue_params().unwrap().nxqs, 4);
        assert!(lif.state().up.get());
        assert!(!lif.state().broken.get());

        // The same request succeeds once the fault clears.
        lif.reconfigure(shape(8)).unwrap();
        assert_eq!(device.intr_in_use(), 9);
        lif.shutdown();
        assert_eq!(device.intr_in_use(), 0);
    }
}

#[test]
fn failed_rollback_leaves_the_interface_broken_and_down() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 4);

    device.set_unresponsive(true);
    let err = lif.reconfigure(shape(8)).unwrap_err();
    assert!(matches!(err, LifError::DeviceUnresponsive(_)), "{err}");
    assert!(lif.state().broken.get());
    assert!(!lif.state().up.get());
    // Partially built queues were released; only admin/notify remain.
    assert_eq!(device.intr_in_use(), 1);

    // Configuration requests fail fast without reaching the device.
    device.set_unresponsive(false);
    device.clear_admin_log();
    assert!(matches!(lif.reconfigure(shape(2)), Err(LifError::Broken)));
    assert!(device.admin_log().is_empty());

    // An explicit restart is the way out.
    lif.restart().unwrap();
    assert!(!lif.state().broken.get());
    assert!(lif.state().up.get());
    assert_eq!(device.intr_in_use(), 5);
    lif.shutdown();
}

#[test]
fn snapshot_apply_is_a_no_op_on_a_live_interface() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 4);
    wait_until("deferred queue to drain", || lif.deferred_len() == 0);
    device.clear_admin_log();

    let snapshot = QueueParams::snapshot(&lif).unwrap();
    lif.reconfigure(snapshot).unwrap();
    assert!(device.admin_log().is_empty());
    lif.shutdown();
}

#[test]
fn deferred_address_changes_execute_in_arrival_order() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 2);
    wait_until("deferred queue to drain", || lif.deferred_len() == 0);
    device.clear_admin_log();

    let first: MacAddr = [2, 0, 0, 0, 0, 1];
    let second: MacAddr = [2, 0, 0, 0, 0, 2];
    lif.addr_add_deferred(first);
    lif.addr_add_deferred(second);
    lif.addr_del_deferred(first);
    wait_until("filter changes to apply", || {
        lif.deferred_len() == 0 && lif.filters() == vec![second]
    });

    let filter_cmds: Vec<AdminCmd> = device
        .admin_log()
        .into_iter()
        .filter(|cmd| {
            matches!(
                cmd,
                AdminCmd::RxFilterAdd { .. } | AdminCmd::RxFilterDel { .. }
            )
        })
        .collect();
    assert!(
        matches!(
            filter_cmds.as_slice(),
            [
                AdminCmd::RxFilterAdd { addr: a },
                AdminCmd::RxFilterAdd { addr: b },
                AdminCmd::RxFilterDel { addr: c },
            ] if *a == first && *b == second && *c == first
        ),
        "unexpected filter command order: {filter_cmds:?}"
    );
    lif.shutdown();
}

#[test]
fn a_failing_deferred_item_does_not_stop_the_queue() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 2);
    wait_until("deferred queue to drain", || lif.deferred_len() == 0);

    let rejected: MacAddr = [2, 0, 0, 0, 0, 3];
    let accepted: MacAddr = [2, 0, 0, 0, 0, 4];
    device.fail_next_admin();
    lif.addr_add_deferred(rejected);
    lif.addr_add_deferred(accepted);

    wait_until("the second filter to apply", || {
        lif.filters() == vec![accepted]
    });
    assert!(lif.state().filter_sync_needed.get());
    lif.shutdown();
}

#[test]
fn link_transitions_are_observed_and_counted() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 2);
    wait_until("initial link check", || lif.is_link_up());
    assert_eq!(lif.link_down_count(), 0);

    device.set_link_up(false);
    lif.link_status_check_request();
    wait_until("link down to be observed", || !lif.is_link_up());
    assert_eq!(lif.link_down_count(), 1);

    device.set_link_up(true);
    lif.link_status_check_request();
    wait_until("link up to be observed", || lif.is_link_up());
    assert_eq!(lif.link_down_count(), 1);
    lif.shutdown();
}

#[test]
fn firmware_reset_cycle_parks_and_restores_the_data_path() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 4);
    wait_until("deferred queue to drain", || lif.deferred_len() == 0);
    assert_eq!(device.intr_in_use(), 5);

    let child_reset = Arc::new(AtomicBool::new(false));
    let child_reset_seen = child_reset.clone();
    lif.set_child_config(ChildLifConfig {
        index: 7,
        isolation: ChildIsolation::None,
        reset_cb: Box::new(move || child_reset_seen.store(true, Ordering::SeqCst)),
    });

    // Firmware goes away: data queues are parked, admin/notify stay, and
    // the child is told to park itself too.
    lif.fw_reset_notify(0);
    wait_until("data queues to park", || device.intr_in_use() == 1);
    assert!(lif.state().fw_reset_in_progress.get());
    assert!(!lif.state().up.get());
    assert!(child_reset.load(Ordering::SeqCst));

    // Firmware comes back: the whole interface is rebuilt.
    lif.fw_reset_notify(FW_STATUS_RUNNING);
    wait_until("data path to restore", || {
        lif.state().up.get() && device.intr_in_use() == 5
    });
    assert!(!lif.state().fw_reset_in_progress.get());
    lif.shutdown();
    assert_eq!(device.intr_in_use(), 0);
}

#[test]
fn a_firmware_outage_during_a_reconfigure_still_parks_the_data_path() {
    let inner = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let device = Arc::new(GatedDevice::new(inner.clone()));
    let lif = Lif::allocate(device.clone(), "eth0", 0, 1).unwrap();
    lif.init().unwrap();
    lif.reconfigure(shape(4)).unwrap();
    lif.register().unwrap();
    wait_until("deferred queue to drain", || lif.deferred_len() == 0);
    assert_eq!(inner.intr_in_use(), 5);

    // Keep a reshape in flight by holding its first queue build.
    device.close_gate();
    let reshaping = {
        let lif = lif.clone();
        thread::spawn(move || lif.reconfigure(shape(2)))
    };
    wait_until("the reshape to reach the gate", || device.gated_calls() > 0);

    // Firmware drops while the reshape holds the configuration lock. The
    // park must serialize behind it; if it runs inside the window it
    // empties the tables the reshape is about to refill and the interface
    // ends up live with firmware away.
    lif.fw_reset_notify(0);
    device.open_gate();
    reshaping.join().unwrap().unwrap();

    wait_until("data queues to park", || {
        !lif.state().up.get() && inner.intr_in_use() == 1
    });
    assert!(lif.state().fw_reset_in_progress.get());

    lif.fw_reset_notify(FW_STATUS_RUNNING);
    wait_until("data path to restore", || {
        lif.state().up.get() && inner.intr_in_use() == 3
    });
    lif.shutdown();
    assert_eq!(inner.intr_in_use(), 0);
}

#[test]
fn restart_replays_the_filter_list() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 2);

    let mac: MacAddr = [2, 0, 0, 0, 0, 9];
    lif.addr_add(&mac).unwrap();
    device.clear_admin_log();

    lif.restart().unwrap();
    let replayed = device
        .admin_log()
        .iter()
        .filter(|cmd| matches!(cmd, AdminCmd::RxFilterAdd { addr } if *addr == mac))
        .count();
    assert_eq!(replayed, 1);
    assert_eq!(lif.filters(), vec![mac]);
    lif.shutdown();
}

#[test]
fn coalesce_settings_survive_a_queue_rebuild() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 2);
    wait_until("deferred queue to drain", || lif.deferred_len() == 0);

    // mult=2, div=3: 100us converts to 66 hardware units.
    lif.set_coalesce(100, 100).unwrap();
    device.clear_admin_log();

    lif.reconfigure(shape(4)).unwrap();
    let programmed: Vec<u32> = device
        .admin_log()
        .iter()
        .filter_map(|cmd| match cmd {
            AdminCmd::CoalesceSet { hw_units, .. } => Some(*hw_units),
            _ => None,
        })
        .collect();
    assert_eq!(programmed, vec![66; 4]);
    lif.shutdown();
}

#[test]
fn timestamp_queues_ride_along_with_the_data_path() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 2);
    assert!(lif.phc().is_some());
    assert_eq!(device.intr_in_use(), 3);

    lif.create_hwstamp_queues().unwrap();
    assert_eq!(device.intr_in_use(), 5);
    lif.create_hwstamp_queues().unwrap();
    assert_eq!(device.intr_in_use(), 5);

    // A reshape recreates the pair past the new data queues.
    lif.reconfigure(shape(4)).unwrap();
    assert_eq!(device.intr_in_use(), 7);
    let hwstamp_rebuilt = device.admin_log().iter().any(|cmd| {
        matches!(
            cmd,
            AdminCmd::QueueInit { index: 4, features, .. }
                if *features != 0
        )
    });
    assert!(hwstamp_rebuilt, "timestamp pair not rebuilt at the new index");

    // So does a firmware reset cycle.
    wait_until("deferred queue to drain", || lif.deferred_len() == 0);
    lif.fw_reset_notify(0);
    wait_until("data queues to park", || device.intr_in_use() == 1);
    lif.fw_reset_notify(FW_STATUS_RUNNING);
    wait_until("timestamp queues to return", || device.intr_in_use() == 7);

    lif.unregister().unwrap();
    assert_eq!(device.intr_in_use(), 1);
    lif.shutdown();
}

#[test]
fn a_rejected_coalesce_update_keeps_the_record_authoritative() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 2);
    wait_until("initial link check", || {
        lif.is_link_up() && lif.deferred_len() == 0
    });

    device.fail_next_admin();
    assert!(lif.set_coalesce(100, 100).is_err());
    // The record took the new value even though a vector rejected it.
    let coal = lif.coalesce().unwrap();
    assert_eq!(coal.rx_usecs, 100);
    assert_eq!(coal.rx_hw, 66);

    // The next build programs the recorded value on every vector.
    device.clear_admin_log();
    lif.reconfigure(shape(4)).unwrap();
    let programmed: Vec<u32> = device
        .admin_log()
        .iter()
        .filter_map(|cmd| match cmd {
            AdminCmd::CoalesceSet { hw_units, .. } => Some(*hw_units),
            _ => None,
        })
        .collect();
    assert_eq!(programmed, vec![66; 4]);
    lif.shutdown();
}

#[test]
fn sw_stats_aggregate_across_live_queues() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 2);

    // The fast path updates per-queue records through shared handles.
    let tx0 = lif.tx_stats(0).unwrap();
    let tx1 = lif.tx_stats(1).unwrap();
    tx0.pkts(3);
    tx0.bytes(300);
    tx1.pkts(4);
    tx1.bytes(400);
    let rx0 = lif.rx_stats(0).unwrap();
    rx0.pkts(5);
    rx0.bytes(500);

    let stats = lif.sw_stats();
    assert_eq!(stats.tx_packets, 7);
    assert_eq!(stats.tx_bytes, 700);
    assert_eq!(stats.rx_packets, 5);
    assert_eq!(stats.rx_bytes, 500);

    // Queue teardown discards the records along with the queues.
    lif.unregister().unwrap();
    assert_eq!(lif.sw_stats().tx_packets, 0);
    assert!(lif.tx_stats(0).is_none());
    lif.shutdown();
}

#[test]
fn shutdown_discards_pending_work() {
    let device = Arc::new(MockDevice::new(MockDevice::default_identity()));
    let lif = bring_up(&device, 2);
    for i in 0..32u8 {
        lif.addr_add_deferred([2, 0, 0, 0, 1, i]);
    }
    lif.shutdown();
    assert_eq!(lif.deferred_len(), 0);
    assert!(matches!(lif.register(), Err(LifError::ShuttingDown)));
}
