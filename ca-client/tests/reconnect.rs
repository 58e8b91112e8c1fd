//! Disconnect and reconnect: teardown of one-shot I/O, subscription re-arm.

mod common;

use std::sync::Arc;
use std::time::Duration;

use ca_client::dbr::TYPENOTCONN;
use ca_client::wire::Command;
use ca_client::{
    AccessRights, CaError, Channel, ChannelId, ChannelNotify, ConnectionState, DbrType, EventMask,
    MemoryTransport, MonitorEvent, ReadBuffer, Transport,
};
use common::{assert_binding_consistent, Harness, Notified, IOC_HOST};
use parking_lot::Mutex;

fn disconnected() -> CaError {
    CaError::Disconnected {
        host: IOC_HOST.to_string(),
    }
}

#[test]
fn test_disconnect_fails_reads_and_writes_and_pauses_subscriptions() {
    let h = Harness::new();
    let (channel, notify) = h.channel("PV1");
    h.connect(&channel, DbrType::DOUBLE, 1, 10);
    notify.clear();

    let mut first = channel
        .subscribe(DbrType::DOUBLE, 1, EventMask::VALUE)
        .expect("subscribe");
    let mut second = channel
        .subscribe(DbrType::DOUBLE, 1, EventMask::ALARM)
        .expect("subscribe");
    let mut read = channel.read(DbrType::DOUBLE, 1).expect("read");
    let mut write = channel.write_notify(DbrType::DOUBLE, 1, &[0; 8]).expect("write");

    assert!(h.ctx.disconnect_channel(channel.id()));

    assert_eq!(read.try_result(), Some(Err(disconnected())));
    assert_eq!(write.try_result(), Some(Err(disconnected())));
    let paused = MonitorEvent::Disconnected {
        host: IOC_HOST.to_string(),
    };
    assert_eq!(first.try_next(), Some(paused.clone()));
    assert_eq!(second.try_next(), Some(paused));
    assert_eq!(h.ctx.io_count(), 2);
    assert_eq!(channel.pending_io(), Ok(2));

    assert_eq!(channel.state(), Ok(ConnectionState::PreviouslyConnected));
    assert_eq!(channel.native_type(), Ok(TYPENOTCONN));
    assert_eq!(channel.access_rights(), Ok(AccessRights::NONE));
    assert_binding_consistent(&channel);
    assert_eq!(
        notify.events(),
        vec![
            Notified::Disconnected,
            Notified::AccessRights(AccessRights::NONE)
        ]
    );

    assert_eq!(h.tcp.disconnected(), vec![channel.id()]);
    assert!(!h.tcp.channel_list().contains(channel.id()));
    assert!(h.udp.channel_list().contains(channel.id()));
    assert_eq!(channel.is_searching(), Ok(true));
    assert_eq!(h.ctx.search_delay(), Duration::ZERO);
    assert_eq!(h.ctx.stats().disconnects, 1);
}

#[test]
fn test_reconnect_rearms_each_subscription_once() {
    let h = Harness::new();
    let (channel, notify) = h.channel("PV1");
    h.connect(&channel, DbrType::DOUBLE, 2, 10);

    let first = channel
        .subscribe(DbrType::DOUBLE, 0, EventMask::VALUE)
        .expect("subscribe");
    let second = channel
        .subscribe(DbrType::LONG, 1, EventMask::LOG)
        .expect("subscribe");
    let _read = channel.read(DbrType::DOUBLE, 1).expect("read");
    let _write = channel.write_notify(DbrType::DOUBLE, 1, &[0; 8]).expect("write");

    h.ctx.disconnect_channel(channel.id());
    h.tcp.clear_sent();
    h.connect(&channel, DbrType::DOUBLE, 3, 20);

    let mut armed: Vec<u32> = h
        .tcp
        .sent_with_command(Command::EventAdd.code())
        .iter()
        .map(|r| r.header.available)
        .collect();
    armed.sort_unstable();
    let mut expected = vec![first.id().as_u32(), second.id().as_u32()];
    expected.sort_unstable();
    assert_eq!(armed, expected);

    // new server id, zero count follows the new native count
    let arms = h.tcp.sent_with_command(Command::EventAdd.code());
    let rearm = arms
        .iter()
        .find(|r| r.header.available == first.id().as_u32())
        .expect("first re-armed");
    assert_eq!(rearm.header.cid, 20);
    assert_eq!(rearm.header.count, 3);

    assert!(h.tcp.sent_with_command(Command::ReadNotify.code()).is_empty());
    assert!(h.tcp.sent_with_command(Command::WriteNotify.code()).is_empty());
    assert_eq!(notify.count(Notified::Connected), 2);
    assert_eq!(h.ctx.stats().connects, 2);
    assert_binding_consistent(&channel);
}

#[test]
fn test_repeated_cycles_keep_binding_consistent() {
    let h = Harness::new();
    let (channel, _) = h.channel("PV1");
    let subscription = channel
        .subscribe(DbrType::DOUBLE, 1, EventMask::VALUE)
        .expect("subscribe");

    for cycle in 0..5u32 {
        h.connect(&channel, DbrType::DOUBLE, 1, 100 + cycle);
        assert_binding_consistent(&channel);
        assert!(h.ctx.disconnect_channel(channel.id()));
        assert_binding_consistent(&channel);
    }

    assert_eq!(h.tcp.sent_with_command(Command::EventAdd.code()).len(), 5);
    assert!(h.ctx.io_is_live(subscription.id()));
}

/// Records how many arm requests had been sent when `connected` fired.
struct ArmProbe {
    tcp: Arc<MemoryTransport>,
    arms_at_connect: Mutex<Vec<usize>>,
}

impl ChannelNotify for ArmProbe {
    fn connected(&self, _cid: ChannelId) {
        let arms = self.tcp.sent_with_command(Command::EventAdd.code()).len();
        self.arms_at_connect.lock().push(arms);
    }
}

#[test]
fn test_connect_notification_precedes_rearm() {
    let h = Harness::new();
    let probe = Arc::new(ArmProbe {
        tcp: h.tcp.clone(),
        arms_at_connect: Mutex::new(Vec::new()),
    });
    let channel = Channel::create_with_notify(&h.ctx, "PV1", probe.clone()).expect("create");
    let _subscription = channel
        .subscribe(DbrType::DOUBLE, 1, EventMask::VALUE)
        .expect("subscribe");

    h.connect(&channel, DbrType::DOUBLE, 1, 10);
    h.ctx.disconnect_channel(channel.id());
    h.connect(&channel, DbrType::DOUBLE, 1, 11);

    assert_eq!(*probe.arms_at_connect.lock(), vec![0, 1]);
    assert_eq!(h.tcp.sent_with_command(Command::EventAdd.code()).len(), 2);
}

#[test]
fn test_failed_rearm_keeps_subscription() {
    let h = Harness::new();
    let (channel, _) = h.channel("PV1");
    let subscription = channel
        .subscribe(DbrType::DOUBLE, 1, EventMask::VALUE)
        .expect("subscribe");

    h.ctx
        .search_reply(channel.id(), 10, DbrType::DOUBLE, 1, h.tcp.clone());
    h.tcp
        .fail_next(ca_client::SendError::Fatal("reset".into()));
    assert!(h.ctx.connect_channel(channel.id(), DbrType::DOUBLE, 1, 10));

    assert!(h.tcp.sent_with_command(Command::EventAdd.code()).is_empty());
    assert!(h.ctx.io_is_live(subscription.id()));
}

#[test]
fn test_read_into_buffer_fails_on_disconnect() {
    let h = Harness::new();
    let (channel, _) = h.channel("PV1");
    h.connect(&channel, DbrType::SHORT, 1, 10);
    let buffer = ReadBuffer::new();

    channel.read_into(DbrType::SHORT, 1, &buffer).expect("read");
    assert_eq!(h.ctx.outstanding_io(), 1);

    h.ctx.disconnect_channel(channel.id());
    assert_eq!(buffer.status(), Some(Err(disconnected())));
    assert_eq!(h.ctx.outstanding_io(), 0);
    assert_eq!(h.ctx.io_count(), 0);
}

#[test]
fn test_read_after_disconnect_is_not_connected() {
    let h = Harness::new();
    let (channel, _) = h.channel("PV1");
    h.connect(&channel, DbrType::DOUBLE, 1, 10);
    h.ctx.disconnect_channel(channel.id());
    let installed = h.ctx.stats().ios_installed;

    assert_eq!(channel.read(DbrType::DOUBLE, 1).err(), Some(CaError::NotConnected));
    assert_eq!(
        channel.read_into(DbrType::DOUBLE, 1, &ReadBuffer::new()).err(),
        Some(CaError::NotConnected)
    );
    assert_eq!(h.ctx.stats().ios_installed, installed);
    assert_eq!(h.ctx.io_count(), 0);
}

#[test]
fn test_disconnect_while_claiming_returns_to_search() {
    let h = Harness::new();
    let (channel, notify) = h.channel("PV1");
    h.tcp.set_backpressure(true);
    h.ctx
        .search_reply(channel.id(), 10, DbrType::DOUBLE, 1, h.tcp.clone());

    assert!(h.ctx.disconnect_channel(channel.id()));
    assert_eq!(channel.state(), Ok(ConnectionState::NeverConnected));
    assert!(h.udp.channel_list().contains(channel.id()));
    assert!(notify.events().is_empty());

    // the deferred claim no longer applies
    h.tcp.set_backpressure(false);
    assert_eq!(h.ctx.flush_claims(h.tcp.as_ref()), 0);
    assert!(h.tcp.sent_with_command(Command::ClaimChannel.code()).is_empty());

    // claim sent, confirmation still outstanding
    assert!(h
        .ctx
        .search_reply(channel.id(), 11, DbrType::DOUBLE, 1, h.tcp.clone()));
    assert_eq!(h.tcp.sent_with_command(Command::ClaimChannel.code()).len(), 1);
    assert!(h.ctx.disconnect_channel(channel.id()));
    assert_eq!(channel.state(), Ok(ConnectionState::NeverConnected));
    assert_eq!(channel.access_rights(), Ok(AccessRights::NONE));
    assert_eq!(h.tcp.disconnected(), vec![channel.id(), channel.id()]);
    assert!(notify.events().is_empty());
    assert_binding_consistent(&channel);
}

#[test]
fn test_disconnect_between_claim_and_implied_connect() {
    // peer without connect confirmation: the claim send itself connects
    let h = Harness::with_peer_minor(1);
    let (channel, notify) = h.channel("PV1");
    let cid = channel.id();
    let ctx = Arc::downgrade(&h.ctx);
    h.tcp.on_send(move |header| {
        if header.command == Command::ClaimChannel.code() {
            if let Some(ctx) = ctx.upgrade() {
                assert!(ctx.disconnect_channel(cid));
            }
        }
    });

    assert!(h.ctx.search_reply(cid, 55, DbrType::LONG, 1, h.tcp.clone()));
    h.tcp.clear_hook();

    assert_eq!(h.tcp.sent_with_command(Command::ClaimChannel.code()).len(), 1);
    assert_eq!(channel.state(), Ok(ConnectionState::NeverConnected));
    assert_eq!(channel.is_searching(), Ok(true));
    assert!(h.udp.channel_list().contains(cid));
    assert!(!h.tcp.channel_list().contains(cid));
    assert_eq!(h.tcp.disconnected(), vec![cid]);
    assert!(notify.events().is_empty());
    assert_binding_consistent(&channel);

    // still searchable, and the next reply connects it normally
    h.ctx.search_channel(cid).expect("search");
    h.connect(&channel, DbrType::LONG, 1, 56);
    assert_eq!(channel.server_id(), Ok(Some(56)));
    assert!(h.ctx.disconnect_channel(cid));
    assert_binding_consistent(&channel);
}

#[test]
fn test_reads_race_with_reconnects_from_another_thread() {
    let h = Harness::new();
    let (channel, _) = h.channel("PV1");
    h.connect(&channel, DbrType::DOUBLE, 1, 10);
    let subscription = channel
        .subscribe(DbrType::DOUBLE, 1, EventMask::VALUE)
        .expect("subscribe");

    let pending = std::thread::scope(|scope| {
        let reader = scope.spawn(|| {
            let mut pending = Vec::new();
            for _ in 0..500 {
                match channel.read(DbrType::DOUBLE, 1) {
                    Ok(read) => pending.push(read),
                    Err(CaError::NotConnected) | Err(CaError::AccessDenied { .. }) => {}
                    Err(other) => panic!("unexpected read error: {other}"),
                }
            }
            pending
        });
        for cycle in 0..50u32 {
            assert!(h.ctx.disconnect_channel(channel.id()));
            h.connect(&channel, DbrType::DOUBLE, 1, 11 + cycle);
            assert_binding_consistent(&channel);
        }
        reader.join().expect("reader thread")
    });

    assert!(h.ctx.disconnect_channel(channel.id()));
    for mut read in pending {
        assert_eq!(read.try_result(), Some(Err(disconnected())));
    }
    assert_eq!(h.ctx.io_count(), 1);
    assert!(h.ctx.io_is_live(subscription.id()));
    assert_eq!(h.tcp.sent_with_command(Command::EventAdd.code()).len(), 51);
    assert_binding_consistent(&channel);
}

#[test]
fn test_disconnect_of_searching_channel_is_noop() {
    let h = Harness::new();
    let (channel, notify) = h.channel("PV1");
    assert!(!h.ctx.disconnect_channel(channel.id()));
    assert!(notify.events().is_empty());
    assert!(h.tcp.disconnected().is_empty());
}

#[tokio::test]
async fn test_subscription_stream_after_reconnect() {
    let h = Harness::new();
    let (channel, _) = h.channel("PV1");
    h.connect(&channel, DbrType::LONG, 1, 10);
    let mut subscription = channel
        .subscribe(DbrType::LONG, 1, EventMask::VALUE)
        .expect("subscribe");

    h.ctx.disconnect_channel(channel.id());
    h.connect(&channel, DbrType::LONG, 1, 11);
    let data = ca_client::DbrData::from_value(&ca_client::DbrValue::Long(vec![3]));
    h.ctx
        .complete_io(subscription.id(), ca_client::IoReply::Data(data.clone()));

    assert!(matches!(
        subscription.next().await,
        Some(MonitorEvent::Disconnected { .. })
    ));
    assert_eq!(subscription.next().await, Some(MonitorEvent::Update(data)));
}
