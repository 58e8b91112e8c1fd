//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ca_client::dbr::TYPENOTCONN;
use ca_client::wire::version;
use ca_client::{
    AccessRights, Channel, ChannelId, ChannelNotify, ClientConfig, ClientContext, ConnectionState,
    DbrType, MemoryTransport, Transport,
};
use parking_lot::Mutex;

/// Host name reported by the stream transport.
pub const IOC_HOST: &str = "ioc1:5064";

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Connection notification as seen by a channel owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notified {
    Connected,
    Disconnected,
    AccessRights(AccessRights),
}

/// Records every notification in arrival order.
#[derive(Debug, Default)]
pub struct RecordingNotify {
    events: Mutex<Vec<Notified>>,
}

impl RecordingNotify {
    pub fn events(&self) -> Vec<Notified> {
        self.events.lock().clone()
    }

    pub fn count(&self, wanted: Notified) -> usize {
        self.events.lock().iter().filter(|e| **e == wanted).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl ChannelNotify for RecordingNotify {
    fn connected(&self, _cid: ChannelId) {
        self.events.lock().push(Notified::Connected);
    }

    fn disconnected(&self, _cid: ChannelId) {
        self.events.lock().push(Notified::Disconnected);
    }

    fn access_rights(&self, _cid: ChannelId, rights: AccessRights) {
        self.events.lock().push(Notified::AccessRights(rights));
    }
}

/// A context wired to one datagram and one stream transport.
pub struct Harness {
    pub ctx: Arc<ClientContext>,
    pub udp: Arc<MemoryTransport>,
    pub tcp: Arc<MemoryTransport>,
}

impl Harness {
    /// Stream peer speaking a current protocol revision.
    pub fn new() -> Self {
        Self::with_peer_minor(13)
    }

    pub fn with_peer_minor(minor: u16) -> Self {
        Self::with_config(ClientConfig::default(), minor)
    }

    pub fn with_config(config: ClientConfig, peer_minor: u16) -> Self {
        init_tracing();
        let udp = Arc::new(MemoryTransport::new("udp-broadcast", config.minor_version));
        let tcp = Arc::new(MemoryTransport::new(IOC_HOST, peer_minor));
        let ctx = ClientContext::new(config, udp.clone());
        Self { ctx, udp, tcp }
    }

    pub fn channel(&self, name: &str) -> (Channel, Arc<RecordingNotify>) {
        let notify = Arc::new(RecordingNotify::default());
        let channel =
            Channel::create_with_notify(&self.ctx, name, notify.clone()).expect("create channel");
        (channel, notify)
    }

    /// Drive a channel through search reply, claim, connect and (for peers
    /// that send them) a full access rights grant.
    pub fn connect(&self, channel: &Channel, native_type: DbrType, native_count: u32, sid: u32) {
        assert!(self
            .ctx
            .search_reply(channel.id(), sid, native_type, native_count, self.tcp.clone()));
        let minor = self.tcp.minor_version();
        if version::has_connect_confirmation(minor) {
            assert!(self
                .ctx
                .connect_channel(channel.id(), native_type, native_count, sid));
        }
        if version::has_access_rights(minor) {
            assert!(self.ctx.access_rights_changed(channel.id(), AccessRights::FULL));
        }
        assert_eq!(channel.state(), Ok(ConnectionState::Connected));
    }
}

/// Type, count and server id are either all present or all absent.
pub fn assert_binding_consistent(channel: &Channel) {
    let state = channel.state().expect("live channel");
    let native_type = channel.native_type().expect("live channel");
    let native_count = channel.native_element_count().expect("live channel");
    let sid = channel.server_id().expect("live channel");
    match state {
        ConnectionState::Connected => {
            assert_ne!(native_type, TYPENOTCONN);
            assert!(sid.is_some());
        }
        _ => {
            assert_eq!(native_type, TYPENOTCONN);
            assert_eq!(native_count, 0);
            assert_eq!(sid, None);
        }
    }
}
