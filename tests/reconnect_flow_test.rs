// Integration tests for automatic reconnection sweeps

mod common;

use common::{
    ble_device, cancelled_error, permission_error, timeout_error, usb_device, MockAdapter, TestLinkBuilder,
};
use futures_util::future::join_all;
use printer_link::broadcast::{BroadcastType, CrossTabBroadcaster};
use printer_link::config::ReconnectPolicy;
use printer_link::controller::SweepOutcome;
use printer_link::notifier::{Level, StatusKind};
use printer_link::record::{ConnectionStatus, TransportKind};
use printer_link::registry::RecordAttrs;
use printer_link::transport::TransportEvent;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

async fn add(test: &common::TestLink, kind: TransportKind, address: &str, name: &str) -> String {
    test.link
        .registry()
        .upsert(kind, address, RecordAttrs::named(name))
        .await
}

#[tokio::test(start_paused = true)]
async fn test_sweep_restores_every_authorized_record() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    adapter.authorize(ble_device("AA:02", "Bar")).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;
    add(&test, TransportKind::Ble, "AA:02", "Bar").await;

    let outcome = test.link.controller().sweep().await;

    assert_eq!(
        outcome,
        SweepOutcome::Completed {
            attempted: 2,
            connected: 2
        }
    );
    // One listing per transport, not per record
    assert_eq!(adapter.listing_count(), 1);
    assert_eq!(test.link.connection_status().await.connected, 2);
    test.assert_handle_invariant().await;
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_sweeps_run_once() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    adapter.set_open_delay(Duration::from_millis(200)).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;

    let controller = test.link.controller();
    let (first, second) = tokio::join!(controller.sweep(), controller.sweep());

    assert!(matches!(first, SweepOutcome::Completed { connected: 1, .. }));
    assert_eq!(second, SweepOutcome::Skipped);
    assert_eq!(controller.sweeps_started(), 1);
    assert_eq!(adapter.open_count(), 1);
    assert!(!controller.is_sweeping());
}

#[tokio::test(start_paused = true)]
async fn test_gate_reset_during_sweep_does_not_start_second_sweep() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    adapter.authorize(ble_device("AA:02", "Bar")).await;
    adapter.set_open_delay(Duration::from_millis(500)).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;
    add(&test, TransportKind::Ble, "AA:02", "Bar").await;

    let controller = test.link.controller();
    let (first, second) = tokio::join!(controller.sweep(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        controller.reset_gates();
        assert!(controller.is_sweeping());
        controller.sweep().await
    });

    assert_eq!(second, SweepOutcome::Skipped);
    assert_eq!(
        first,
        SweepOutcome::Completed {
            attempted: 2,
            connected: 2
        }
    );
    assert_eq!(controller.sweeps_started(), 1);
    assert_eq!(adapter.open_count(), 2);
    assert!(!controller.is_sweeping());
    test.assert_handle_invariant().await;
}

#[tokio::test(start_paused = true)]
async fn test_gate_reset_during_sweep_picks_up_new_record() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    adapter.authorize(ble_device("AA:02", "Bar")).await;
    adapter.set_open_delay(Duration::from_millis(500)).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;

    let controller = test.link.controller();
    let (outcome, _) = tokio::join!(controller.sweep(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        add(&test, TransportKind::Ble, "AA:02", "Bar").await;
        controller.reset_gates();
    });

    assert_eq!(
        outcome,
        SweepOutcome::Completed {
            attempted: 2,
            connected: 2
        }
    );
    assert_eq!(controller.sweeps_started(), 1);
    assert_eq!(test.link.connection_status().await.connected, 2);
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_record_is_left_alone() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:02", "Bar")).await;
    let mut test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;

    test.link.controller().sweep().await;

    assert_eq!(adapter.open_count(), 0);
    let record = test.link.registry().get(&id).await.unwrap();
    assert_eq!(record.status, ConnectionStatus::Disconnected);
    let events = test.drain_events();
    assert!(events.iter().any(|e| e.kind == StatusKind::Unmatched && e.record.id == id));
}

#[tokio::test(start_paused = true)]
async fn test_name_fallback_when_address_changed() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:77", "KITCHEN")).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;

    test.link.controller().sweep().await;

    assert_eq!(adapter.last_session().await.unwrap().address, "AA:77");
    assert!(test.link.registry().get(&id).await.unwrap().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_event_after_name_fallback_reconnects() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:77", "KITCHEN")).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;
    let controller = test.link.controller().clone();
    controller.sweep().await;
    let session = adapter.session_for("AA:77").await.unwrap();

    // The transport reports the address it actually opened, not the stored one
    controller
        .handle_transport_event(TransportEvent::Disconnected {
            kind: TransportKind::Ble,
            address: "AA:77".to_string(),
        })
        .await;

    assert_eq!(session.close_count(), 1);
    test.assert_handle_invariant().await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(adapter.open_count(), 2);
    assert!(test.link.registry().get(&id).await.unwrap().is_connected());
    test.assert_handle_invariant().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_event_for_unknown_address_is_ignored() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;
    let controller = test.link.controller().clone();
    controller.sweep().await;

    controller
        .handle_transport_event(TransportEvent::Disconnected {
            kind: TransportKind::Ble,
            address: "AA:99".to_string(),
        })
        .await;

    assert_eq!(adapter.last_session().await.unwrap().close_count(), 0);
    assert!(test.link.registry().get(&id).await.unwrap().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_failed_probe_does_not_open_or_count() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    adapter.set_reachable(false);
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;

    test.link.controller().sweep().await;

    assert_eq!(adapter.probe_count(), 1);
    assert_eq!(adapter.open_count(), 0);
    let record = test.link.registry().get(&id).await.unwrap();
    assert_eq!(record.status, ConnectionStatus::Disconnected);
    assert_eq!(record.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_within_sweep() {
    let adapter = MockAdapter::new(TransportKind::Usb);
    adapter.authorize(usb_device("usb:0519:0003", "TSP100")).await;
    adapter.script_open_failures(timeout_error, 2).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Usb, "usb:0519:0003", "TSP100").await;

    let outcome = test.link.controller().sweep().await;

    assert!(matches!(outcome, SweepOutcome::Completed { connected: 1, .. }));
    assert_eq!(adapter.open_count(), 3);
    let record = test.link.registry().get(&id).await.unwrap();
    assert!(record.is_connected());
    assert_eq!(record.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_ceiling_freezes_until_cooldown() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    adapter.fail_opens_with(timeout_error).await;
    let policy = ReconnectPolicy {
        retry_ceiling: 3,
        ..ReconnectPolicy::immediate()
    };
    let mut test = TestLinkBuilder::new()
        .with_adapter(adapter.clone())
        .with_policy(policy)
        .build()
        .await;
    let id = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;
    let controller = test.link.controller().clone();

    controller.sweep().await;
    assert_eq!(adapter.open_count(), 3);
    let record = test.link.registry().get(&id).await.unwrap();
    assert_eq!(record.retry_count, 3);
    assert_eq!(record.status, ConnectionStatus::Disconnected);
    let frozen = test
        .drain_events()
        .into_iter()
        .find(|e| e.kind == StatusKind::Frozen)
        .unwrap();
    assert_eq!(frozen.notification.unwrap().level, Level::Warning);

    // Still cooling down: no further attempts
    controller.sweep().await;
    assert_eq!(adapter.open_count(), 3);

    test.clock.advance(Duration::from_secs(5 * 60 + 1));
    adapter.clear_open_failure().await;
    let outcome = controller.sweep().await;

    assert!(matches!(outcome, SweepOutcome::Completed { connected: 1, .. }));
    let record = test.link.registry().get(&id).await.unwrap();
    assert!(record.is_connected());
    assert_eq!(record.retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_permission_error_marks_failed_with_guidance() {
    let adapter = MockAdapter::new(TransportKind::Usb);
    adapter.authorize(usb_device("usb:04b8:0e15", "TM-T20")).await;
    adapter.script_open_failures(permission_error, 1).await;
    let mut test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Usb, "usb:04b8:0e15", "TM-T20").await;

    test.link.controller().sweep().await;

    // Not retried within the sweep, not counted
    assert_eq!(adapter.open_count(), 1);
    let record = test.link.registry().get(&id).await.unwrap();
    assert_eq!(record.status, ConnectionStatus::Failed);
    assert_eq!(record.retry_count, 0);
    let failed = test
        .drain_events()
        .into_iter()
        .find(|e| e.kind == StatusKind::Failed)
        .unwrap();
    let notification = failed.notification.unwrap();
    assert_eq!(notification.level, Level::Error);
    assert!(notification.message.contains("system settings"));

    // FAILED records are eligible on the next sweep
    test.link.controller().sweep().await;
    assert!(test.link.registry().get(&id).await.unwrap().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_user_cancel_is_quiet() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    adapter.script_open_failures(cancelled_error, 1).await;
    let mut test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;

    let err = test.link.connect_printer(&id).await.unwrap_err();

    assert_eq!(err.code(), "UserCancelled");
    let record = test.link.registry().get(&id).await.unwrap();
    assert_eq!(record.status, ConnectionStatus::Disconnected);
    assert_eq!(record.retry_count, 0);
    assert!(test.drain_events().iter().all(|e| e.notification.is_none()));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_connect_does_not_wedge_record() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    adapter.set_open_delay(Duration::from_secs(5)).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;

    // The caller gives up while the open is still pending
    let abandoned = tokio::time::timeout(Duration::from_millis(100), test.link.connect_printer(&id)).await;
    assert!(abandoned.is_err());

    let record = test.link.registry().get(&id).await.unwrap();
    assert_eq!(record.status, ConnectionStatus::Disconnected);
    assert!(record.live_handle.is_none());
    test.assert_handle_invariant().await;

    adapter.set_open_delay(Duration::ZERO).await;
    let outcome = test.link.controller().sweep().await;

    assert_eq!(
        outcome,
        SweepOutcome::Completed {
            attempted: 1,
            connected: 1
        }
    );
    assert!(test.link.registry().get(&id).await.unwrap().is_connected());
    test.assert_handle_invariant().await;
}

#[tokio::test(start_paused = true)]
async fn test_aborted_sweep_releases_gate_and_records() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    adapter.set_open_delay(Duration::from_secs(5)).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;
    let controller = test.link.controller().clone();

    let sweeping = controller.clone();
    let task = tokio::spawn(async move { sweeping.sweep().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(controller.is_sweeping());
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    assert!(!controller.is_sweeping());
    assert_eq!(
        test.link.registry().get(&id).await.unwrap().status,
        ConnectionStatus::Disconnected
    );
    adapter.set_open_delay(Duration::ZERO).await;
    assert!(matches!(controller.sweep().await, SweepOutcome::Completed { connected: 1, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_storm_triggers_one_sweep() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    let mut test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;
    let controller = test.link.controller().clone();
    controller.sweep().await;
    let first_session = adapter.last_session().await.unwrap();
    let handle = test.link.registry().get(&id).await.unwrap().live_handle;
    test.drain_events();

    let reports = join_all((0..5).map(|_| controller.connection_lost(&id, handle))).await;

    assert_eq!(reports.iter().filter(|lost| **lost).count(), 1);
    assert_eq!(first_session.close_count(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(controller.sweeps_started(), 2);
    assert_eq!(adapter.open_count(), 2);
    assert!(test.link.registry().get(&id).await.unwrap().is_connected());

    let events = test.drain_events();
    let lost = events.iter().filter(|e| e.kind == StatusKind::Disconnected).count();
    assert_eq!(lost, 1);
    let reconnected = events.iter().find(|e| e.kind == StatusKind::Reconnected).unwrap();
    assert_eq!(
        reconnected.notification.as_ref().unwrap().message,
        "Kitchen reconnected successfully"
    );
    test.assert_handle_invariant().await;
}

#[tokio::test(start_paused = true)]
async fn test_transport_disconnect_event_reconnects() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;

    test.link.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(test.link.registry().get(&id).await.unwrap().is_connected());
    let first_session = adapter.last_session().await.unwrap();

    adapter.emit_disconnect("AA:01");
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(first_session.close_count(), 1);
    assert_eq!(adapter.open_count(), 2);
    assert!(test.link.registry().get(&id).await.unwrap().is_connected());
    test.link.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_liveness_check_replaces_dead_session() {
    let adapter = MockAdapter::new(TransportKind::Usb);
    adapter.authorize(usb_device("usb:0519:0003", "TSP100")).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Usb, "usb:0519:0003", "TSP100").await;
    let controller = test.link.controller().clone();
    controller.sweep().await;
    let dead = adapter.last_session().await.unwrap();
    dead.kill();

    assert_eq!(controller.check_liveness().await, 1);
    assert_eq!(dead.close_count(), 1);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let record = test.link.registry().get(&id).await.unwrap();
    assert!(record.is_connected());
    assert_eq!(adapter.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_initial_reconnect_runs_once_until_reset() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    let test = TestLinkBuilder::new().with_adapter(adapter).build().await;
    let controller = test.link.controller();

    assert!(matches!(controller.initial_reconnect().await, SweepOutcome::Completed { .. }));
    assert_eq!(controller.initial_reconnect().await, SweepOutcome::Skipped);

    controller.reset_gates();
    assert!(matches!(controller.initial_reconnect().await, SweepOutcome::Completed { .. }));
    assert_eq!(controller.sweeps_started(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_foreground_reverifies_and_sweeps() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    adapter.authorize(ble_device("AA:02", "Bar")).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;
    add(&test, TransportKind::Ble, "AA:02", "Bar").await;
    test.link.controller().sweep().await;

    // The host slept; one session did not survive
    adapter.session_for("AA:02").await.unwrap().kill();

    let outcome = test.link.on_foreground().await;

    assert_eq!(
        outcome,
        SweepOutcome::Completed {
            attempted: 1,
            connected: 1
        }
    );
    assert_eq!(test.link.connection_status().await.connected, 2);
    assert_eq!(adapter.open_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_late_open_is_discarded_after_removal() {
    let adapter = MockAdapter::new(TransportKind::Ble);
    adapter.authorize(ble_device("AA:01", "Kitchen")).await;
    adapter.set_open_delay(Duration::from_secs(2)).await;
    let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
    let id = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;

    let (connect, removed) = tokio::join!(test.link.connect_printer(&id), async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        test.link.disconnect_printer(&id).await
    });

    assert!(removed.is_ok());
    assert_eq!(connect.unwrap_err().code(), "Superseded");
    assert_eq!(adapter.last_session().await.unwrap().close_count(), 1);
    assert!(test.link.list_printers().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_prune_removes_only_unreachable_stale_records() {
    let ble = MockAdapter::new(TransportKind::Ble);
    ble.authorize(ble_device("AA:01", "Kitchen")).await;
    let usb = MockAdapter::new(TransportKind::Usb);
    usb.authorize(usb_device("usb:0519:0003", "TSP100")).await;
    let test = TestLinkBuilder::new()
        .with_adapter(ble.clone())
        .with_adapter(usb.clone())
        .build()
        .await;
    let kitchen = add(&test, TransportKind::Ble, "AA:01", "Kitchen").await;
    let tsp = add(&test, TransportKind::Usb, "usb:0519:0003", "TSP100").await;
    let controller = test.link.controller().clone();
    controller.sweep().await;

    ble.set_reachable(false);
    usb.set_reachable(false);
    controller.connection_lost(&kitchen, None).await;
    controller.connection_lost(&tsp, None).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    // Nothing is stale yet
    assert!(test.link.prune_unreachable().await.is_empty());

    test.clock.advance(Duration::from_secs(6 * 60));
    usb.set_reachable(true);
    let pruned = test.link.prune_unreachable().await;

    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].id, kitchen);
    assert!(test.link.registry().get(&kitchen).await.is_none());
    // The reachable one answered the final probe and was reconnected instead
    assert!(test.link.registry().get(&tsp).await.unwrap().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_random_lifecycle_keeps_handle_invariant() {
    const ADDRESSES: [&str; 3] = ["AA:01", "AA:02", "AA:03"];

    for seed in [7_u64, 42, 1337] {
        let adapter = MockAdapter::new(TransportKind::Ble);
        for (n, address) in ADDRESSES.iter().enumerate() {
            adapter.authorize(ble_device(address, &format!("Printer {}", n))).await;
        }
        let test = TestLinkBuilder::new().with_adapter(adapter.clone()).build().await;
        let controller = test.link.controller().clone();
        let remote = CrossTabBroadcaster::new(test.hub.clone());
        test.link.start();

        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..60 {
            let address = ADDRESSES[rng.gen_range(0..ADDRESSES.len())];
            let known = test.link.registry().find_by_address(TransportKind::Ble, address).await;

            match rng.gen_range(0..8) {
                0 => {
                    add(&test, TransportKind::Ble, address, "Printer").await;
                }
                1 => {
                    controller.sweep().await;
                }
                2 => {
                    if let Some(session) = adapter.session_for(address).await {
                        session.kill();
                    }
                    controller.check_liveness().await;
                }
                3 => {
                    controller
                        .handle_transport_event(TransportEvent::Disconnected {
                            kind: TransportKind::Ble,
                            address: address.to_string(),
                        })
                        .await;
                }
                4 => {
                    if let Some(record) = &known {
                        let _ = test.link.send_to(&record.id, b"\x1b@ticket", Some("ticket")).await;
                    }
                }
                5 => {
                    if let Some(record) = &known {
                        let _ = test.link.disconnect_printer(&record.id).await;
                    }
                }
                6 => {
                    if let Some(record) = &known {
                        let kind = if rng.gen_bool(0.5) {
                            BroadcastType::Disconnected
                        } else {
                            BroadcastType::Reconnected
                        };
                        remote.publish(kind, record);
                    }
                }
                _ => {
                    test.link.on_foreground().await;
                }
            }

            tokio::time::sleep(Duration::from_millis(rng.gen_range(0..50))).await;
            test.assert_handle_invariant().await;
        }

        test.link.shutdown().await;
        test.assert_handle_invariant().await;
        assert_eq!(test.link.connection_status().await.connected, 0);
    }
}
