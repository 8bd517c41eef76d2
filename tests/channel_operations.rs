//! Channel operations against the simulated transport
//!
//! Most tests drive the transport by hand: they wait for the submission the
//! channel makes and then inject exactly the callbacks the scenario needs.
//! The session tests at the bottom let a `SimPeer` answer instead.
//!
//! Run with:
//!   cargo test --test channel_operations

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::watch;
use uuid::Uuid;

use gattlink::gatt::simulated::{SimPeer, SimTransport, Submission};
use gattlink::gatt::transport::{
    DiscoveredCharacteristic, DiscoveredService, CLIENT_CHARACTERISTIC_CONFIG,
};
use gattlink::{
    CharacteristicId, ChannelConfig, ConnectionState, ConnectionUpdate, GattChannel, GattError,
    GattRequest, NotificationMode, OperationContext, OperationKind, TransportEvent, WriteOptions,
    GATT_SUCCESS,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    channel: Arc<GattChannel>,
    transport: Arc<SimTransport>,
    radio_off: watch::Sender<bool>,
}

fn harness(config: ChannelConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let (radio_off, radio_off_rx) = watch::channel(false);
    let transport = SimTransport::new();
    let channel = GattChannel::new(transport.clone(), radio_off_rx, config);
    Harness {
        channel,
        transport,
        radio_off,
    }
}

fn report(channel: &GattChannel, state: ConnectionState, status: i32) {
    channel.on_transport_event(TransportEvent::ConnectionStateChanged(ConnectionUpdate::new(
        state, status,
    )));
}

/// Mark the link as up without going through `connect`.
fn bring_up(channel: &GattChannel) {
    report(channel, ConnectionState::Connecting, GATT_SUCCESS);
    report(channel, ConnectionState::Connected, GATT_SUCCESS);
}

fn characteristic() -> CharacteristicId {
    CharacteristicId::new(Uuid::new_v4(), Uuid::new_v4())
}

fn answer_read(channel: &GattChannel, target: CharacteristicId, value: Vec<u8>) {
    channel.on_transport_event(TransportEvent::CharacteristicRead {
        target,
        value,
        status: GATT_SUCCESS,
    });
}

/// Give spawned tasks a chance to run up to their next suspension point.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_connect_resolves_once_connected() {
    let h = harness(ChannelConfig::default());
    let channel = Arc::clone(&h.channel);
    let connect = tokio::spawn(async move { channel.connect().await });

    assert_eq!(h.transport.next_submission().await, Some(Submission::Connect));
    report(&h.channel, ConnectionState::Connecting, GATT_SUCCESS);
    report(&h.channel, ConnectionState::Connected, GATT_SUCCESS);

    assert_eq!(connect.await.unwrap(), Ok(()));
    assert_eq!(
        h.channel.connection_state(),
        ConnectionUpdate::new(ConnectionState::Connected, GATT_SUCCESS)
    );
}

#[tokio::test]
async fn test_connect_failure_reports_status_and_closes_once() {
    let h = harness(ChannelConfig::default());
    let channel = Arc::clone(&h.channel);
    let connect = tokio::spawn(async move { channel.connect().await });

    assert_eq!(h.transport.next_submission().await, Some(Submission::Connect));
    report(&h.channel, ConnectionState::Connecting, GATT_SUCCESS);
    report(&h.channel, ConnectionState::Disconnected, 133);

    assert_eq!(
        connect.await.unwrap(),
        Err(GattError::ChannelLost {
            device: h.channel.address().clone(),
            status: 133,
            kind: OperationKind::Connect,
            context: OperationContext::None,
        })
    );
    assert_eq!(h.transport.close_count(), 1);

    report(&h.channel, ConnectionState::Disconnected, 8);
    assert_eq!(h.transport.close_count(), 1);
}

#[tokio::test]
async fn test_connect_refused_by_transport() {
    let h = harness(ChannelConfig::default());
    h.transport.refuse_connect(true);

    let result = h.channel.connect().await;
    assert!(matches!(
        result,
        Err(GattError::TransportRejected {
            kind: OperationKind::Connect,
            ..
        })
    ));
    assert_eq!(h.transport.connect_attempts(), 1);
    assert_eq!(h.transport.close_count(), 0);
}

#[tokio::test]
async fn test_connect_while_transport_disabled() {
    let h = harness(ChannelConfig::default());
    h.radio_off.send_replace(true);

    assert_eq!(h.channel.connect().await, Err(GattError::TransportDisabled));
    assert_eq!(h.transport.connect_attempts(), 0);
}

#[tokio::test]
async fn test_connect_when_already_connected() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);

    assert_eq!(h.channel.connect().await, Ok(()));
    assert_eq!(h.transport.connect_attempts(), 0);
}

#[tokio::test]
async fn test_reconnect_during_teardown_waits_for_disconnected() {
    let h = harness(ChannelConfig::default());
    let channel = Arc::clone(&h.channel);
    let connect = tokio::spawn(async move { channel.connect().await });
    assert_eq!(h.transport.next_submission().await, Some(Submission::Connect));
    bring_up(&h.channel);
    assert_eq!(connect.await.unwrap(), Ok(()));

    report(&h.channel, ConnectionState::Disconnecting, GATT_SUCCESS);
    let channel = Arc::clone(&h.channel);
    let reconnect = tokio::spawn(async move { channel.connect().await });
    settle().await;
    assert_eq!(h.transport.connect_attempts(), 1);
    assert!(!reconnect.is_finished());

    // The old session ends and its handle is closed; only then does the
    // new connect reach the transport.
    report(&h.channel, ConnectionState::Disconnected, GATT_SUCCESS);
    assert_eq!(h.transport.close_count(), 1);
    assert_eq!(h.transport.next_submission().await, Some(Submission::Connect));
    assert_eq!(h.transport.connect_attempts(), 2);

    bring_up(&h.channel);
    assert_eq!(reconnect.await.unwrap(), Ok(()));
    assert_eq!(h.transport.close_count(), 1);

    report(&h.channel, ConnectionState::Disconnected, 8);
    assert_eq!(h.transport.close_count(), 2);
}

// ---------------------------------------------------------------------------
// Request/response outcomes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_read_remote_error_keeps_raw_status() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    let target = characteristic();

    let channel = Arc::clone(&h.channel);
    let read = tokio::spawn(async move { channel.read_characteristic(target).await });

    assert_eq!(
        h.transport.next_request().await,
        Some(GattRequest::ReadCharacteristic(target))
    );
    h.channel.on_transport_event(TransportEvent::CharacteristicRead {
        target,
        value: Vec::new(),
        status: 0x05,
    });

    assert_eq!(
        read.await.unwrap(),
        Err(GattError::RemoteError {
            kind: OperationKind::ReadCharacteristic,
            status: 0x05,
            context: OperationContext::Characteristic {
                target,
                value: None
            },
        })
    );
    assert!(h.channel.is_idle());
}

#[tokio::test]
async fn test_read_success_updates_cached_value() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    let target = characteristic();

    let channel = Arc::clone(&h.channel);
    let read = tokio::spawn(async move { channel.read_characteristic(target).await });

    h.transport.next_request().await.unwrap();
    answer_read(&h.channel, target, vec![0xAB, 0xCD]);

    assert_eq!(read.await.unwrap(), Ok(vec![0xAB, 0xCD]));
    assert_eq!(h.channel.cached_value(&target), Some(vec![0xAB, 0xCD]));
}

#[tokio::test]
async fn test_write_lost_on_disconnect_and_late_event_ignored() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    let target = characteristic();

    let channel = Arc::clone(&h.channel);
    let write = tokio::spawn(async move {
        channel
            .write_characteristic(target, vec![0x01], WriteOptions::default())
            .await
    });

    h.transport.next_request().await.unwrap();
    report(&h.channel, ConnectionState::Disconnected, 19);

    assert_eq!(
        write.await.unwrap(),
        Err(GattError::ChannelLost {
            device: h.channel.address().clone(),
            status: 19,
            kind: OperationKind::WriteCharacteristic,
            context: OperationContext::Characteristic {
                target,
                value: Some(vec![0x01])
            },
        })
    );

    // The write completion straggling in afterwards changes nothing.
    h.channel.on_transport_event(TransportEvent::CharacteristicWrite {
        target,
        value: vec![0x01],
        status: GATT_SUCCESS,
    });
    assert_eq!(h.channel.cached_value(&target), None);
    assert!(h.channel.is_idle());
}

#[tokio::test]
async fn test_disconnect_wins_over_buffered_completion() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    let target = characteristic();

    let channel = Arc::clone(&h.channel);
    let read = tokio::spawn(async move { channel.read_characteristic(target).await });
    h.transport.next_request().await.unwrap();

    // Both arrive before the operation task runs again.
    answer_read(&h.channel, target, vec![0x01]);
    report(&h.channel, ConnectionState::Disconnected, 8);

    let result = read.await.unwrap();
    assert!(matches!(result, Err(GattError::ChannelLost { status: 8, .. })));
}

#[tokio::test]
async fn test_operation_after_error_disconnect_fails_without_submitting() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    report(&h.channel, ConnectionState::Disconnected, 8);

    let result = h.channel.read_rssi().await;
    assert_eq!(
        result,
        Err(GattError::ChannelLost {
            device: h.channel.address().clone(),
            status: 8,
            kind: OperationKind::ReadRssi,
            context: OperationContext::None,
        })
    );
    assert!(h.transport.submitted().is_empty());
}

#[tokio::test]
async fn test_transport_rejection_carries_snapshot() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    h.transport.refuse(OperationKind::ReadCharacteristic);
    let target = characteristic();

    match h.channel.read_characteristic(target).await {
        Err(GattError::TransportRejected {
            kind,
            context,
            snapshot,
        }) => {
            assert_eq!(kind, OperationKind::ReadCharacteristic);
            assert_eq!(
                context,
                OperationContext::Characteristic {
                    target,
                    value: None
                }
            );
            assert!(snapshot.busy);
            assert_eq!(snapshot.service_present, Some(true));
        }
        other => panic!("expected TransportRejected, got {:?}", other),
    }
    assert!(h.channel.is_idle());
}

#[tokio::test]
async fn test_transport_disabled_fails_precondition() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    h.radio_off.send_replace(true);

    assert_eq!(
        h.channel.read_characteristic(characteristic()).await,
        Err(GattError::TransportDisabled)
    );
    assert!(h.transport.submitted().is_empty());
    assert!(h.channel.is_idle());
}

#[tokio::test]
async fn test_transport_disabled_mid_operation() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);

    let channel = Arc::clone(&h.channel);
    let mtu = tokio::spawn(async move { channel.request_mtu(247).await });
    h.transport.next_request().await.unwrap();
    h.radio_off.send_replace(true);

    assert_eq!(mtu.await.unwrap(), Err(GattError::TransportDisabled));
}

#[tokio::test]
async fn test_no_replay_of_earlier_completion() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    let target = characteristic();

    // Published before anyone asked.
    answer_read(&h.channel, target, vec![9]);

    let channel = Arc::clone(&h.channel);
    let read = tokio::spawn(async move { channel.read_characteristic(target).await });
    h.transport.next_request().await.unwrap();
    settle().await;
    assert!(!read.is_finished());

    answer_read(&h.channel, target, vec![10]);
    assert_eq!(read.await.unwrap(), Ok(vec![10]));
}

#[tokio::test]
async fn test_completion_for_other_target_is_not_taken() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    let target = characteristic();

    let channel = Arc::clone(&h.channel);
    let read = tokio::spawn(async move { channel.read_characteristic(target).await });
    h.transport.next_request().await.unwrap();

    answer_read(&h.channel, characteristic(), vec![1]);
    settle().await;
    assert!(!read.is_finished());

    answer_read(&h.channel, target, vec![2]);
    assert_eq!(read.await.unwrap(), Ok(vec![2]));
}

// ---------------------------------------------------------------------------
// Serialization and slot release
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_concurrent_operations_never_overlap() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);

    let targets: Vec<CharacteristicId> = (0..5).map(|_| characteristic()).collect();
    let mut reads = Vec::new();
    for target in &targets {
        let channel = Arc::clone(&h.channel);
        let target = *target;
        reads.push(tokio::spawn(async move {
            channel.read_characteristic(target).await
        }));
    }

    for (i, expected) in targets.iter().enumerate() {
        let request = h.transport.next_request().await.unwrap();
        assert_eq!(request, GattRequest::ReadCharacteristic(*expected));

        // Nothing else reaches the transport while this one is outstanding.
        settle().await;
        assert_eq!(h.transport.submitted().len(), i + 1);

        answer_read(&h.channel, *expected, vec![i as u8]);
    }

    for (i, read) in reads.into_iter().enumerate() {
        assert_eq!(read.await.unwrap(), Ok(vec![i as u8]));
    }
    assert!(h.channel.is_idle());
}

#[tokio::test]
async fn test_cancelled_operation_releases_slot() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    let first = characteristic();
    let second = characteristic();

    let channel = Arc::clone(&h.channel);
    let abandoned = tokio::spawn(async move { channel.read_characteristic(first).await });
    assert_eq!(
        h.transport.next_request().await,
        Some(GattRequest::ReadCharacteristic(first))
    );

    abandoned.abort();
    assert!(abandoned.await.unwrap_err().is_cancelled());
    assert!(h.channel.is_idle());

    let channel = Arc::clone(&h.channel);
    let next = tokio::spawn(async move { channel.read_characteristic(second).await });
    assert_eq!(
        h.transport.next_request().await,
        Some(GattRequest::ReadCharacteristic(second))
    );
    answer_read(&h.channel, second, vec![0x42]);
    assert_eq!(next.await.unwrap(), Ok(vec![0x42]));
}

#[tokio::test]
async fn test_caller_timeout_releases_slot() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);

    let attempt =
        tokio::time::timeout(Duration::from_millis(10), h.channel.read_rssi()).await;
    assert!(attempt.is_err());
    assert!(h.channel.is_idle());

    let channel = Arc::clone(&h.channel);
    let retry = tokio::spawn(async move { channel.read_rssi().await });
    // The abandoned request and the retry both reached the transport.
    assert_eq!(h.transport.next_request().await, Some(GattRequest::ReadRssi));
    assert_eq!(h.transport.next_request().await, Some(GattRequest::ReadRssi));
    h.channel.on_transport_event(TransportEvent::RssiRead {
        rssi: -70,
        status: GATT_SUCCESS,
    });
    assert_eq!(retry.await.unwrap(), Ok(-70));
}

#[tokio::test(start_paused = true)]
async fn test_configured_timeout() {
    let h = harness(ChannelConfig {
        operation_timeout: Some(Duration::from_secs(2)),
        ..ChannelConfig::default()
    });
    bring_up(&h.channel);

    assert_eq!(
        h.channel.discover_services().await,
        Err(GattError::Timeout {
            kind: OperationKind::DiscoverServices,
            after: Duration::from_secs(2),
        })
    );
    assert!(h.channel.is_idle());
}

#[tokio::test]
async fn test_shutdown_fails_running_and_queued_operations() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    let target = characteristic();

    let channel = Arc::clone(&h.channel);
    let running = tokio::spawn(async move { channel.read_characteristic(target).await });
    h.transport.next_request().await.unwrap();

    let channel = Arc::clone(&h.channel);
    let queued = tokio::spawn(async move {
        channel
            .write_characteristic(target, vec![1], WriteOptions::default())
            .await
    });
    settle().await;

    h.channel.shutdown();

    assert_eq!(
        running.await.unwrap(),
        Err(GattError::ChannelClosed(OperationKind::ReadCharacteristic))
    );
    assert_eq!(
        queued.await.unwrap(),
        Err(GattError::ChannelClosed(OperationKind::WriteCharacteristic))
    );
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_skip_unchanged_write_does_not_submit() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    let target = characteristic();

    h.channel.on_transport_event(TransportEvent::CharacteristicChanged {
        target,
        value: vec![1, 2],
    });

    let result = h
        .channel
        .write_characteristic(target, vec![1, 2], WriteOptions::default().skip_unchanged(true))
        .await;
    assert_eq!(result, Ok(()));
    assert!(h.transport.submitted().is_empty());
    assert!(h.channel.is_idle());
}

#[tokio::test]
async fn test_changed_value_is_written_despite_skip_option() {
    let h = harness(ChannelConfig::default());
    bring_up(&h.channel);
    let target = characteristic();

    h.channel.on_transport_event(TransportEvent::CharacteristicChanged {
        target,
        value: vec![1],
    });

    let channel = Arc::clone(&h.channel);
    let write = tokio::spawn(async move {
        channel
            .write_characteristic(target, vec![2], WriteOptions::default().skip_unchanged(true))
            .await
    });
    assert_eq!(
        h.transport.next_request().await,
        Some(GattRequest::WriteCharacteristic {
            target,
            value: vec![2],
            write_type: Default::default(),
        })
    );
    h.channel.on_transport_event(TransportEvent::CharacteristicWrite {
        target,
        value: vec![2],
        status: GATT_SUCCESS,
    });
    assert_eq!(write.await.unwrap(), Ok(()));
    assert_eq!(h.channel.cached_value(&target), Some(vec![2]));
}

#[tokio::test]
async fn test_channel_default_write_options() {
    let h = harness(ChannelConfig {
        skip_unchanged_writes: true,
        ..ChannelConfig::default()
    });
    bring_up(&h.channel);
    let target = characteristic();
    h.channel.on_transport_event(TransportEvent::CharacteristicChanged {
        target,
        value: vec![7],
    });

    assert_eq!(h.channel.write(target, vec![7]).await, Ok(()));
    assert!(h.transport.submitted().is_empty());
}

// ---------------------------------------------------------------------------
// Sessions against a simulated peer
// ---------------------------------------------------------------------------

fn attach_peer(h: &Harness, peer: SimPeer) -> Arc<SimPeer> {
    let peer = Arc::new(peer);
    Arc::clone(&peer).attach(Arc::clone(&h.channel), Arc::clone(&h.transport));
    peer
}

#[tokio::test]
async fn test_operation_queued_before_connect_runs_after_connect() {
    let h = harness(ChannelConfig::default());
    let target = characteristic();
    let _peer = attach_peer(&h, SimPeer::new().with_characteristic(target, vec![42]));

    let channel = Arc::clone(&h.channel);
    let read = tokio::spawn(async move { channel.read_characteristic(target).await });
    settle().await;
    assert!(h.transport.submitted().is_empty());

    h.channel.connect().await.unwrap();
    assert_eq!(read.await.unwrap(), Ok(vec![42]));
}

#[tokio::test]
async fn test_full_session() {
    let h = harness(ChannelConfig::default());
    let target = characteristic();
    let services = vec![DiscoveredService {
        uuid: target.service,
        characteristics: vec![DiscoveredCharacteristic {
            uuid: target.characteristic,
            properties: 0x1A,
            descriptors: vec![CLIENT_CHARACTERISTIC_CONFIG],
        }],
    }];
    let peer = attach_peer(
        &h,
        SimPeer::new()
            .with_characteristic(target, vec![0])
            .with_services(services.clone())
            .with_rssi(-60)
            .with_max_mtu(185),
    );

    h.channel.connect().await.unwrap();
    assert_eq!(h.channel.discover_services().await, Ok(services));
    assert_eq!(h.channel.request_mtu(512).await, Ok(185));
    assert_eq!(h.channel.mtu(), 185);
    assert_eq!(h.channel.read_rssi().await, Ok(-60));

    h.channel.begin_reliable_write().await.unwrap();
    h.channel
        .write_characteristic(target, vec![3], WriteOptions::default())
        .await
        .unwrap();
    assert_eq!(h.channel.execute_reliable_write().await, Ok(()));
    assert_eq!(peer.value(&target), Some(vec![3]));

    peer.fail_next(OperationKind::ExecuteReliableWrite, 0x0E);
    assert_eq!(
        h.channel.execute_reliable_write().await,
        Err(GattError::RemoteError {
            kind: OperationKind::ExecuteReliableWrite,
            status: 0x0E,
            context: OperationContext::None,
        })
    );

    h.channel.disconnect().await.unwrap();
    assert_eq!(h.channel.connection_state().state, ConnectionState::Disconnected);
    assert_eq!(h.channel.mtu(), 23);
    assert_eq!(h.transport.close_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_writes_reach_peer_in_order() {
    let h = harness(ChannelConfig::default());
    let target = characteristic();
    let peer = attach_peer(
        &h,
        SimPeer::new().with_latency(Duration::from_millis(10)),
    );
    h.channel.connect().await.unwrap();

    let mut writes = Vec::new();
    for value in 1..=5u8 {
        let channel = Arc::clone(&h.channel);
        writes.push(tokio::spawn(async move {
            channel
                .write_characteristic(target, vec![value], WriteOptions::default())
                .await
        }));
    }
    for write in writes {
        assert_eq!(write.await.unwrap(), Ok(()));
    }

    let written: Vec<Vec<u8>> = h
        .transport
        .submitted()
        .into_iter()
        .filter_map(|request| match request {
            GattRequest::WriteCharacteristic { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(written, vec![vec![1], vec![2], vec![3], vec![4], vec![5]]);
    assert_eq!(peer.value(&target), Some(vec![5]));
}

#[tokio::test]
async fn test_disconnect_abandons_operation_in_flight() {
    let h = harness(ChannelConfig::default());
    let channel = Arc::clone(&h.channel);
    let connect = tokio::spawn(async move { channel.connect().await });
    h.transport.next_submission().await.unwrap();
    bring_up(&h.channel);
    connect.await.unwrap().unwrap();

    let channel = Arc::clone(&h.channel);
    let read = tokio::spawn(async move { channel.read_rssi().await });
    h.transport.next_request().await.unwrap();

    let channel = Arc::clone(&h.channel);
    let disconnect = tokio::spawn(async move { channel.disconnect().await });
    assert_eq!(
        h.transport.next_submission().await,
        Some(Submission::Disconnect)
    );
    report(&h.channel, ConnectionState::Disconnecting, GATT_SUCCESS);

    assert!(matches!(
        read.await.unwrap(),
        Err(GattError::ChannelLost {
            status: GATT_SUCCESS,
            kind: OperationKind::ReadRssi,
            ..
        })
    ));

    report(&h.channel, ConnectionState::Disconnected, GATT_SUCCESS);
    assert_eq!(disconnect.await.unwrap(), Ok(()));
    assert_eq!(h.transport.close_count(), 1);
}

#[tokio::test]
async fn test_notifications_flow_until_disconnect() {
    let h = harness(ChannelConfig::default());
    let target = characteristic();
    let other = characteristic();
    let peer = attach_peer(&h, SimPeer::new());
    h.channel.connect().await.unwrap();

    let mut stream = h
        .channel
        .enable_notifications(target, NotificationMode::Notify)
        .await
        .unwrap();
    assert!(h.transport.submitted().contains(&GattRequest::SetNotification {
        target,
        enable: true
    }));
    assert_eq!(
        peer.descriptor_value(&target.descriptor(CLIENT_CHARACTERISTIC_CONFIG)),
        Some(vec![0x01, 0x00])
    );

    peer.notify(&h.channel, target, vec![5]);
    peer.notify(&h.channel, other, vec![6]);
    peer.notify(&h.channel, target, vec![7]);
    assert_eq!(stream.next().await, Some(vec![5]));
    assert_eq!(stream.next_value().await, Some(vec![7]));
    assert_eq!(h.channel.cached_value(&target), Some(vec![7]));

    h.channel.disable_notifications(target).await.unwrap();
    assert_eq!(
        peer.descriptor_value(&target.descriptor(CLIENT_CHARACTERISTIC_CONFIG)),
        Some(vec![0x00, 0x00])
    );

    h.channel.disconnect().await.unwrap();
    assert_eq!(stream.next().await, None);
}

#[tokio::test]
async fn test_notifications_without_link_end_immediately() {
    let h = harness(ChannelConfig::default());
    let mut stream = h.channel.notifications(characteristic());

    let next = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert_eq!(next, Ok(None));
}

#[tokio::test]
async fn test_enable_notifications_before_connect() {
    let h = harness(ChannelConfig::default());
    let target = characteristic();
    let peer = attach_peer(&h, SimPeer::new());

    let channel = Arc::clone(&h.channel);
    let enable = tokio::spawn(async move {
        channel
            .enable_notifications(target, NotificationMode::Notify)
            .await
    });
    settle().await;
    assert!(h.transport.submitted().is_empty());

    h.channel.connect().await.unwrap();
    let mut stream = enable.await.unwrap().unwrap();
    peer.notify(&h.channel, target, vec![1]);
    assert_eq!(stream.next().await, Some(vec![1]));
}

#[tokio::test]
async fn test_indication_mode_writes_indicate_bits() {
    let h = harness(ChannelConfig::default());
    let target = characteristic();
    let peer = attach_peer(&h, SimPeer::new());
    h.channel.connect().await.unwrap();

    let _stream = h
        .channel
        .enable_notifications(target, NotificationMode::Indicate)
        .await
        .unwrap();
    assert_eq!(
        peer.descriptor_value(&target.descriptor(CLIENT_CHARACTERISTIC_CONFIG)),
        Some(vec![0x02, 0x00])
    );
}

#[tokio::test]
async fn test_descriptor_round_trip() {
    let h = harness(ChannelConfig::default());
    let target = characteristic().descriptor(Uuid::new_v4());
    let _peer = attach_peer(&h, SimPeer::new());
    h.channel.connect().await.unwrap();

    assert!(matches!(
        h.channel.read_descriptor(target).await,
        Err(GattError::RemoteError { status: 0x0A, .. })
    ));
    h.channel.write_descriptor(target, vec![0x11]).await.unwrap();
    assert_eq!(h.channel.read_descriptor(target).await, Ok(vec![0x11]));
}
