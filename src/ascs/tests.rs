use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::ascs::packets::AseStatus;
use crate::ascs::{Ascs, AscsBuilder, AscsHandler, AseState, Error, NoopStream, QosPref, Reason, ResponseCode, Rsp, StreamOps};
use crate::audio::{AseKey, CodecConfig, Context, Direction, HciReason};
use crate::gatt::{AttError, Characteristic, GattServer, NotifyError};
use crate::iso::{ChannelId, DataDirection, IsoTransport, RecvInfo, TransportError};

const CONN: u16 = 0x0040;
const SINK: u8 = 1;
const SINK2: u8 = 2;
const SOURCE: u8 = 3;

struct PeerState {
    notifications: Vec<(Characteristic, Bytes)>,
    busy: usize,
    mtu: u16,
    interval: u16
}

/// GATT server that records every notification. `busy` fails that many ASE notifications.
#[derive(Clone)]
struct Peer(Arc<Mutex<PeerState>>);

impl Default for Peer {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(PeerState {
            notifications: Vec::new(),
            busy: 0,
            mtu: 64,
            interval: 24
        })))
    }
}

impl Peer {
    fn responses(&self) -> Vec<Bytes> {
        self.0
            .lock()
            .notifications
            .iter()
            .filter(|(characteristic, _)| *characteristic == Characteristic::ControlPoint)
            .map(|(_, data)| data.clone())
            .collect()
    }

    fn statuses(&self, id: u8) -> Vec<Bytes> {
        self.0
            .lock()
            .notifications
            .iter()
            .filter(|(characteristic, _)| *characteristic == Characteristic::Ase(id))
            .map(|(_, data)| data.clone())
            .collect()
    }

    fn states(&self, id: u8) -> Vec<AseState> {
        self.statuses(id)
            .into_iter()
            .map(|mut data| AseStatus::read(&mut data).unwrap().state)
            .collect()
    }
}

impl GattServer for Peer {
    fn notify(&mut self, _conn: u16, characteristic: Characteristic, data: &[u8]) -> Result<(), NotifyError> {
        let mut state = self.0.lock();
        if matches!(characteristic, Characteristic::Ase(_)) && state.busy > 0 {
            state.busy -= 1;
            return Err(NotifyError::NoBuffers);
        }
        state.notifications.push((characteristic, Bytes::copy_from_slice(data)));
        Ok(())
    }

    fn is_subscribed(&self, _conn: u16, _characteristic: Characteristic) -> bool {
        true
    }

    fn mtu(&self, _conn: u16) -> u16 {
        self.0.lock().mtu
    }

    fn connection_interval(&self, _conn: u16) -> u16 {
        self.0.lock().interval
    }
}

#[derive(Default)]
struct LinkState {
    disconnects: Vec<ChannelId>,
    data_paths: Vec<(ChannelId, DataDirection)>,
    sent: Vec<(ChannelId, u16)>
}

#[derive(Clone, Default)]
struct Link(Arc<Mutex<LinkState>>);

impl IsoTransport for Link {
    fn disconnect(&mut self, channel: ChannelId) -> Result<(), TransportError> {
        self.0.lock().disconnects.push(channel);
        Ok(())
    }

    fn setup_data_path(&mut self, channel: ChannelId, dir: DataDirection, _codec: &CodecConfig) -> Result<(), TransportError> {
        self.0.lock().data_paths.push((channel, dir));
        Ok(())
    }

    fn send(&mut self, channel: ChannelId, _sdu: Bytes, seq_num: u16, _timestamp: Option<u32>) -> Result<(), TransportError> {
        self.0.lock().sent.push((channel, seq_num));
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Event {
    Configured,
    QosSet,
    Enabled,
    MetadataUpdated,
    Started,
    Stopped(HciReason),
    Disabled,
    Released,
    Connected,
    Disconnected(HciReason),
    Recv(usize),
    Sent
}

type Events = Arc<Mutex<Vec<(u8, Event)>>>;

struct RecordingStream {
    id: u8,
    events: Events
}

impl RecordingStream {
    fn push(&self, event: Event) {
        self.events.lock().push((self.id, event));
    }
}

impl StreamOps for RecordingStream {
    fn configured(&mut self, _pref: &QosPref) {
        self.push(Event::Configured)
    }

    fn qos_set(&mut self) {
        self.push(Event::QosSet)
    }

    fn enabled(&mut self) {
        self.push(Event::Enabled)
    }

    fn metadata_updated(&mut self) {
        self.push(Event::MetadataUpdated)
    }

    fn started(&mut self) {
        self.push(Event::Started)
    }

    fn stopped(&mut self, reason: HciReason) {
        self.push(Event::Stopped(reason))
    }

    fn disabled(&mut self) {
        self.push(Event::Disabled)
    }

    fn released(&mut self) {
        self.push(Event::Released)
    }

    fn connected(&mut self) {
        self.push(Event::Connected)
    }

    fn disconnected(&mut self, reason: HciReason) {
        self.push(Event::Disconnected(reason))
    }

    fn recv(&mut self, _info: &RecvInfo, sdu: Bytes) {
        self.push(Event::Recv(sdu.len()))
    }

    fn sent(&mut self) {
        self.push(Event::Sent)
    }
}

#[derive(Default)]
struct TestHandler {
    events: Events,
    reject_reconfig: bool,
    available: Option<Context>
}

impl AscsHandler for TestHandler {
    fn config(&mut self, key: AseKey, _dir: Direction, _codec: &CodecConfig) -> Result<(Box<dyn StreamOps>, QosPref), Rsp> {
        let stream = RecordingStream {
            id: key.id,
            events: self.events.clone()
        };
        Ok((Box::new(stream), QosPref::default()))
    }

    fn reconfig(&mut self, _key: AseKey, _dir: Direction, _codec: &CodecConfig, _pref: &mut QosPref) -> Result<(), Rsp> {
        match self.reject_reconfig {
            true => Err(Rsp::new(ResponseCode::ConfRejected, Reason::CodecSpecificConfiguration)),
            false => Ok(())
        }
    }

    fn available_contexts(&self, _conn: u16, _dir: Direction) -> Option<Context> {
        self.available
    }
}

struct Harness {
    ascs: Ascs,
    peer: Peer,
    link: Link,
    events: Events
}

fn chan(id: u8) -> ChannelId {
    ChannelId(0x0100 + id as u16)
}

fn key(id: u8) -> AseKey {
    AseKey::new(CONN, id)
}

fn config_codec(id: u8, cc: &[u8]) -> Vec<u8> {
    let mut data = vec![0x01, 0x01, id, 0x01, 0x02, 0x06, 0x00, 0x00, 0x00, 0x00, cc.len() as u8];
    data.extend_from_slice(cc);
    data
}

fn config_qos(id: u8, cis: u8, pd: u32) -> Vec<u8> {
    let pd = pd.to_le_bytes();
    vec![0x02, 0x01, id, 0x00, cis, 0x10, 0x27, 0x00, 0x00, 0x01, 0x28, 0x00, 0x02, 0x0A, 0x00, pd[0], pd[1], pd[2]]
}

fn with_metadata(opcode: u8, id: u8, metadata: &[u8]) -> Vec<u8> {
    let mut data = vec![opcode, 0x01, id, metadata.len() as u8];
    data.extend_from_slice(metadata);
    data
}

fn ids(opcode: u8, ids: &[u8]) -> Vec<u8> {
    let mut data = vec![opcode, ids.len() as u8];
    data.extend_from_slice(ids);
    data
}

impl Harness {
    fn new() -> Self {
        Self::with(Ascs::builder(), TestHandler::default())
    }

    fn with(builder: AscsBuilder, handler: TestHandler) -> Self {
        let peer = Peer::default();
        let link = Link::default();
        let events = handler.events.clone();
        let ascs = builder.build(peer.clone(), link.clone(), handler);
        Self { ascs, peer, link, events }
    }

    /// Writes the control point and returns the response notification.
    fn write(&self, data: &[u8]) -> Vec<u8> {
        assert_eq!(self.ascs.write_control_point(CONN, 0, data, false), Ok(data.len()));
        self.peer.responses().last().unwrap().to_vec()
    }

    fn process(&self) {
        self.ascs.process_pending();
    }

    fn state(&self, id: u8) -> Option<AseState> {
        self.ascs.state(key(id))
    }

    fn events(&self, id: u8) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|(ase, _)| *ase == id)
            .map(|(_, event)| *event)
            .collect()
    }

    fn clear_events(&self) {
        self.events.lock().clear();
    }

    fn configured(&self, id: u8) {
        assert_eq!(self.write(&config_codec(id, &[])), vec![0x01, 0x01, id, 0x00, 0x00]);
        self.process();
        assert_eq!(self.state(id), Some(AseState::CodecConfigured));
    }

    fn qos_configured(&self, id: u8, cis: u8) {
        self.configured(id);
        assert_eq!(self.write(&config_qos(id, cis, 40_000)), vec![0x02, 0x01, id, 0x00, 0x00]);
        self.process();
        assert_eq!(self.state(id), Some(AseState::QosConfigured));
    }

    fn enabling(&self, id: u8, cis: u8) {
        self.qos_configured(id, cis);
        assert_eq!(self.write(&with_metadata(0x03, id, &[])), vec![0x03, 0x01, id, 0x00, 0x00]);
        self.process();
        assert_eq!(self.state(id), Some(AseState::Enabling));
    }

    fn connect(&self, cis: u8) {
        assert!(self.ascs.iso_accept(CONN, 0x00, cis, chan(cis)));
        self.ascs.iso_connected(chan(cis)).unwrap();
    }

    fn start(&self, id: u8) {
        match self.ascs.endpoint(key(id), |ep| ep.dir).unwrap() {
            Direction::Sink => self.ascs.start(key(id)).unwrap(),
            Direction::Source => assert_eq!(self.write(&ids(0x04, &[id])), vec![0x04, 0x01, id, 0x00, 0x00])
        }
        self.process();
        assert_eq!(self.state(id), Some(AseState::Streaming));
    }

    /// Streams `id` on its own CIS with the same number.
    fn streaming(&self, id: u8) {
        self.enabling(id, id);
        self.connect(id);
        self.start(id);
    }
}

#[test]
fn test_config_codec() {
    let h = Harness::new();
    assert_eq!(h.write(&config_codec(SINK, &[])), vec![0x01, 0x01, SINK, 0x00, 0x00]);
    // allocated but not committed yet
    assert_eq!(h.state(SINK), Some(AseState::Idle));
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::CodecConfigured));
    assert_eq!(h.events(SINK), vec![Event::Configured]);
    assert_eq!(h.peer.states(SINK), vec![AseState::CodecConfigured]);
}

#[test]
fn test_config_qos_binds_iso() {
    let h = Harness::new();
    h.qos_configured(SINK, 0);
    assert_eq!(h.ascs.iso_bindings(), 1);
    assert_eq!(h.ascs.endpoint(key(SINK), |ep| ep.iso().is_some()), Some(true));
    assert_eq!(h.events(SINK), vec![Event::Configured, Event::QosSet]);

    // a second sink on the same CIS is a mapping error
    h.configured(SINK2);
    assert_eq!(h.write(&config_qos(SINK2, 0, 40_000)), vec![0x02, 0x01, SINK2, 0x09, 0x0A]);
    assert_eq!(h.ascs.iso_bindings(), 1);

    // back to codec configured drops the binding
    assert_eq!(h.write(&config_codec(SINK, &[])), vec![0x01, 0x01, SINK, 0x00, 0x00]);
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::CodecConfigured));
    assert_eq!(h.ascs.iso_bindings(), 0);
}

#[test]
fn test_invalid_length_sentinel() {
    let h = Harness::new();
    h.configured(SINK);
    h.clear_events();
    assert_eq!(h.write(&[0x04, 0x02, SINK]), vec![0x04, 0xFF, 0x00, 0x02, 0x00]);
    assert_eq!(h.write(&[0x01, 0x01, SINK, 0x01, 0x02, 0x06, 0x00, 0x00]), vec![0x01, 0xFF, 0x00, 0x02, 0x00]);
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::CodecConfigured));
    assert!(h.events(SINK).is_empty());
}

#[test]
fn test_unsupported_opcode() {
    let h = Harness::new();
    assert_eq!(h.write(&[0x09, 0x01, SINK]), vec![0x09, 0xFF, 0x00, 0x01, 0x00]);
    assert_eq!(h.ascs.write_control_point(CONN, 1, &[0x01], false), Err(AttError::InvalidOffset));
    assert_eq!(h.ascs.write_control_point(CONN, 0, &[], false), Err(AttError::InvalidAttributeValueLength));
    assert_eq!(h.ascs.write_control_point(CONN, 0, &[0x01], true), Ok(0));
}

#[test]
fn test_per_ase_errors() {
    let h = Harness::new();
    let mut data = vec![0x01, 0x03];
    for id in [SINK, 0x09, SOURCE] {
        data.extend_from_slice(&config_codec(id, &[])[2..]);
    }
    assert_eq!(
        h.write(&data),
        vec![0x01, 0x03, SINK, 0x00, 0x00, 0x09, 0x03, 0x00, SOURCE, 0x00, 0x00]
    );
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::CodecConfigured));
    assert_eq!(h.state(SOURCE), Some(AseState::CodecConfigured));

    // unused ASE and wrong state
    assert_eq!(h.write(&ids(0x05, &[SINK2, SINK])), vec![0x05, 0x02, SINK2, 0x04, 0x00, SINK, 0x04, 0x00]);
    // invalid target latency
    let mut data = config_codec(SINK2, &[]);
    data[3] = 0x04;
    assert_eq!(h.write(&data), vec![0x01, 0x01, SINK2, 0x09, 0x00]);
    // malformed codec specific configuration
    assert_eq!(h.write(&config_codec(SINK2, &[0x03, 0x01])), vec![0x01, 0x01, SINK2, 0x09, 0x02]);
    h.process();
    assert_eq!(h.state(SINK2), None);
}

#[test]
fn test_sink_streaming() {
    let h = Harness::new();
    h.qos_configured(SINK, 0);
    assert_eq!(h.write(&with_metadata(0x03, SINK, &[])), vec![0x03, 0x01, SINK, 0x00, 0x00]);
    h.connect(0);
    h.ascs.start(key(SINK)).unwrap();
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::Streaming));
    assert_eq!(
        h.events(SINK),
        vec![Event::Configured, Event::QosSet, Event::Connected, Event::Enabled, Event::Started]
    );
    assert_eq!(h.peer.states(SINK).last(), Some(&AseState::Streaming));
    assert_eq!(h.link.0.lock().data_paths, vec![(chan(0), DataDirection::Rx)]);
}

#[test]
fn test_sink_waits_for_channel() {
    let h = Harness::new();
    h.enabling(SINK, 1);
    h.ascs.start(key(SINK)).unwrap();
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::Enabling));
    h.connect(1);
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::Streaming));
    assert_eq!(h.ascs.start(key(SINK)), Err(Error::InvalidState(AseState::Streaming)));
}

#[test]
fn test_sink_start_with_enable_queued() {
    let h = Harness::new();
    h.configured(SINK);
    assert_eq!(h.write(&config_qos(SINK, 1, 40_000)), vec![0x02, 0x01, SINK, 0x00, 0x00]);
    assert_eq!(h.write(&with_metadata(0x03, SINK, &[])), vec![0x03, 0x01, SINK, 0x00, 0x00]);
    assert_eq!(h.state(SINK), Some(AseState::CodecConfigured));
    h.ascs.start(key(SINK)).unwrap();
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::Enabling));
    h.connect(1);
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::Streaming));
}

#[test]
fn test_sink_start_dropped_by_disable() {
    let h = Harness::new();
    h.enabling(SINK, 1);
    h.ascs.start(key(SINK)).unwrap();
    assert_eq!(h.write(&ids(0x05, &[SINK])), vec![0x05, 0x01, SINK, 0x00, 0x00]);
    assert_eq!(h.write(&with_metadata(0x03, SINK, &[])), vec![0x03, 0x01, SINK, 0x00, 0x00]);
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::Enabling));
    h.connect(1);
    h.process();
    // the start belonged to the previous enable
    assert_eq!(h.state(SINK), Some(AseState::Enabling));
}

#[test]
fn test_source_start_ready() {
    let h = Harness::new();
    h.enabling(SINK, 1);
    h.enabling(SOURCE, 3);
    assert_eq!(h.write(&ids(0x04, &[SINK])), vec![0x04, 0x01, SINK, 0x05, 0x00]);
    // channel not connected yet
    assert_eq!(h.write(&ids(0x04, &[SOURCE])), vec![0x04, 0x01, SOURCE, 0x04, 0x00]);
    h.connect(3);
    h.process();
    assert_eq!(h.state(SOURCE), Some(AseState::Enabling));
    assert_eq!(h.write(&ids(0x04, &[SOURCE])), vec![0x04, 0x01, SOURCE, 0x00, 0x00]);
    h.process();
    assert_eq!(h.state(SOURCE), Some(AseState::Streaming));
    assert_eq!(h.ascs.start(key(SOURCE)), Err(Error::InvalidDirection));
}

#[test]
fn test_disable_source() {
    let h = Harness::new();
    h.streaming(SOURCE);
    h.clear_events();
    assert_eq!(h.write(&ids(0x05, &[SOURCE])), vec![0x05, 0x01, SOURCE, 0x00, 0x00]);
    h.process();
    assert_eq!(h.state(SOURCE), Some(AseState::Disabling));
    assert_eq!(h.events(SOURCE), vec![Event::Stopped(HciReason::UNSPECIFIED), Event::Disabled]);

    assert_eq!(h.write(&ids(0x06, &[SOURCE])), vec![0x06, 0x01, SOURCE, 0x00, 0x00]);
    h.process();
    assert_eq!(h.state(SOURCE), Some(AseState::QosConfigured));
    assert_eq!(h.events(SOURCE).iter().filter(|event| **event == Event::Disabled).count(), 1);
}

#[test]
fn test_disable_sink() {
    let h = Harness::new();
    h.streaming(SINK);
    h.clear_events();
    assert_eq!(h.write(&ids(0x05, &[SINK])), vec![0x05, 0x01, SINK, 0x00, 0x00]);
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::QosConfigured));
    assert_eq!(
        h.events(SINK),
        vec![Event::Disabled, Event::Stopped(HciReason::UNSPECIFIED), Event::QosSet]
    );
    // receiver stop ready is for source ASEs only
    assert_eq!(h.write(&ids(0x06, &[SINK])), vec![0x06, 0x01, SINK, 0x05, 0x00]);
}

#[test]
fn test_link_loss() {
    let h = Harness::new();
    h.streaming(SOURCE);
    h.clear_events();
    h.ascs.iso_disconnected(chan(SOURCE), HciReason::CONNECTION_TIMEOUT).unwrap();
    h.process();
    assert_eq!(h.state(SOURCE), Some(AseState::QosConfigured));
    assert_eq!(
        h.ascs.endpoint(key(SOURCE), |ep| (ep.link_loss, ep.reason)),
        Some((true, HciReason::CONNECTION_TIMEOUT))
    );
    assert_eq!(
        h.events(SOURCE),
        vec![
            Event::Disconnected(HciReason::CONNECTION_TIMEOUT),
            Event::Disabled,
            Event::Stopped(HciReason::CONNECTION_TIMEOUT),
            Event::QosSet
        ]
    );
    assert_eq!(h.ascs.iso_connected(chan(SOURCE)), Err(Error::UnknownChannel));
}

#[test]
fn test_link_loss_while_disabling() {
    let h = Harness::new();
    h.streaming(SOURCE);
    h.write(&ids(0x05, &[SOURCE]));
    h.process();
    h.ascs.iso_disconnected(chan(SOURCE), HciReason::REMOTE_USER_TERMINATED).unwrap();
    h.process();
    assert_eq!(h.state(SOURCE), Some(AseState::QosConfigured));
    assert_eq!(h.ascs.endpoint(key(SOURCE), |ep| ep.link_loss), Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_release_disconnects_cis() {
    let h = Harness::new();
    h.streaming(SINK);
    h.clear_events();
    assert_eq!(h.write(&ids(0x08, &[SINK])), vec![0x08, 0x01, SINK, 0x00, 0x00]);
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::Releasing));
    assert!(h.link.0.lock().disconnects.is_empty());

    tokio::time::advance(Duration::from_millis(500)).await;
    h.process();
    assert_eq!(h.link.0.lock().disconnects, vec![chan(SINK)]);
    assert_eq!(h.state(SINK), Some(AseState::Releasing));

    h.ascs.iso_disconnected(chan(SINK), HciReason::LOCAL_HOST_TERMINATED).unwrap();
    h.process();
    assert_eq!(h.state(SINK), None);
    assert_eq!(h.ascs.iso_bindings(), 0);
    assert_eq!(
        h.events(SINK),
        vec![
            Event::Stopped(HciReason::UNSPECIFIED),
            Event::Disconnected(HciReason::LOCAL_HOST_TERMINATED),
            Event::Released
        ]
    );
    assert_eq!(h.peer.states(SINK).last(), Some(&AseState::Idle));
}

#[tokio::test(start_paused = true)]
async fn test_release_keeps_shared_cis() {
    let h = Harness::new();
    h.qos_configured(SINK, 0);
    h.qos_configured(SOURCE, 0);
    assert_eq!(h.ascs.iso_bindings(), 1);
    assert_eq!(h.write(&[0x03, 0x02, SINK, 0x00, SOURCE, 0x00]), vec![0x03, 0x02, SINK, 0x00, 0x00, SOURCE, 0x00, 0x00]);
    h.process();
    h.connect(0);
    h.start(SINK);
    h.start(SOURCE);
    assert_eq!(h.link.0.lock().data_paths.len(), 2);

    h.write(&ids(0x08, &[SINK]));
    h.process();
    tokio::time::advance(Duration::from_millis(500)).await;
    h.process();
    assert!(h.link.0.lock().disconnects.is_empty());
    assert_eq!(h.state(SINK), None);
    assert_eq!(h.state(SOURCE), Some(AseState::Streaming));
    assert_eq!(h.ascs.iso_bindings(), 1);
}

#[test]
fn test_release_without_cis() {
    let h = Harness::new();
    h.configured(SINK);
    assert_eq!(h.write(&ids(0x08, &[SINK])), vec![0x08, 0x01, SINK, 0x00, 0x00]);
    h.process();
    assert_eq!(h.state(SINK), None);
    assert_eq!(h.events(SINK), vec![Event::Configured, Event::Released]);
    assert_eq!(h.peer.states(SINK), vec![AseState::CodecConfigured, AseState::Releasing, AseState::Idle]);
    // releasing an unused ASE
    assert_eq!(h.write(&ids(0x08, &[SINK])), vec![0x08, 0x01, SINK, 0x04, 0x00]);
}

#[test]
fn test_release_caching() {
    let h = Harness::with(Ascs::builder().with_codec_caching(true), TestHandler::default());
    h.qos_configured(SINK, 0);
    h.write(&ids(0x08, &[SINK]));
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::CodecConfigured));
    assert_eq!(h.ascs.iso_bindings(), 0);
}

#[test]
fn test_acl_disconnect() {
    let h = Harness::new();
    h.streaming(SINK);
    h.qos_configured(SOURCE, 3);
    assert_eq!(h.ascs.iso_bindings(), 2);
    h.clear_events();
    h.ascs.acl_disconnected(CONN, HciReason::REMOTE_USER_TERMINATED);
    assert_eq!(h.state(SINK), None);
    assert_eq!(h.state(SOURCE), None);
    assert_eq!(h.ascs.iso_bindings(), 0);
    assert_eq!(h.events(SINK), vec![Event::Stopped(HciReason::REMOTE_USER_TERMINATED), Event::Released]);
    assert_eq!(h.events(SOURCE), vec![Event::Released]);
    assert_eq!(h.ascs.process_pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_notification_congestion() {
    let h = Harness::new();
    h.peer.0.lock().busy = 1;
    h.write(&config_codec(SINK, &[]));
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::Idle));
    assert!(h.events(SINK).is_empty());

    // 24 * 1.25ms
    tokio::time::advance(Duration::from_millis(29)).await;
    assert_eq!(h.ascs.process_pending(), 0);
    tokio::time::advance(Duration::from_millis(1)).await;
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::CodecConfigured));
    assert_eq!(h.events(SINK), vec![Event::Configured]);
    assert_eq!(h.peer.states(SINK), vec![AseState::CodecConfigured]);
}

#[test]
fn test_metadata_refresh() {
    let h = Harness::new();
    h.streaming(SINK);
    h.clear_events();
    let media = [0x03, 0x02, 0x04, 0x00];
    assert_eq!(h.write(&with_metadata(0x07, SINK, &media)), vec![0x07, 0x01, SINK, 0x00, 0x00]);
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::Streaming));
    assert_eq!(h.events(SINK), vec![Event::MetadataUpdated]);
    assert_eq!(h.ascs.endpoint(key(SINK), |ep| ep.metadata.clone()), Some(Bytes::copy_from_slice(&media)));

    h.ascs.metadata(key(SINK), Bytes::new()).unwrap();
    h.process();
    assert_eq!(h.events(SINK), vec![Event::MetadataUpdated, Event::MetadataUpdated]);
}

#[test]
fn test_metadata_errors() {
    let handler = TestHandler {
        available: Some(Context::Media),
        ..TestHandler::default()
    };
    let h = Harness::with(Ascs::builder(), handler);
    h.qos_configured(SINK, 0);
    assert_eq!(h.write(&with_metadata(0x03, SINK, &[0x02, 0x02, 0x04])), vec![0x03, 0x01, SINK, 0x0C, 0x02]);
    assert_eq!(h.write(&with_metadata(0x03, SINK, &[0x03, 0x02, 0x02, 0x00])), vec![0x03, 0x01, SINK, 0x0B, 0x02]);
    assert_eq!(h.write(&with_metadata(0x03, SINK, &[0x04, 0x02, 0x04])), vec![0x03, 0x01, SINK, 0x0C, 0x00]);
    h.process();
    assert_eq!(h.state(SINK), Some(AseState::QosConfigured));
    assert_eq!(h.write(&with_metadata(0x03, SINK, &[0x03, 0x02, 0x04, 0x00])), vec![0x03, 0x01, SINK, 0x00, 0x00]);
}

#[test]
fn test_presentation_delay_out_of_range() {
    let h = Harness::new();
    h.configured(SINK);
    assert_eq!(h.write(&config_qos(SINK, 0, 50_000)), vec![0x02, 0x01, SINK, 0x07, 0x09]);
    assert_eq!(h.ascs.iso_bindings(), 0);
    let mut data = config_qos(SINK, 0, 40_000);
    data[4] = 0xF0;
    assert_eq!(h.write(&data), vec![0x02, 0x01, SINK, 0x09, 0x0A]);
}

#[test]
fn test_reconfig_veto_restores_codec() {
    let handler = TestHandler {
        reject_reconfig: true,
        ..TestHandler::default()
    };
    let h = Harness::with(Ascs::builder(), handler);
    h.configured(SINK);
    assert_eq!(h.write(&config_codec(SINK, &[0x02, 0x01, 0x03])), vec![0x01, 0x01, SINK, 0x08, 0x02]);
    assert_eq!(h.ascs.endpoint(key(SINK), |ep| ep.codec.data.is_empty()), Some(true));
}

#[test]
fn test_long_read() {
    let h = Harness::new();
    h.peer.0.lock().mtu = 23;
    let cc = [
        0x02, 0x01, 0x03, 0x02, 0x02, 0x01, 0x05, 0x03, 0x01, 0x00, 0x00, 0x00, 0x03, 0x04, 0x28, 0x00, 0x02, 0x05, 0x01
    ];
    assert_eq!(h.write(&config_codec(SINK, &cc)), vec![0x01, 0x01, SINK, 0x00, 0x00]);
    h.process();
    let notified = h.peer.statuses(SINK).pop().unwrap();
    assert_eq!(notified.len(), 20);

    let full = h.ascs.read_ase(CONN, SINK, 0).unwrap();
    assert_eq!(full.len(), 2 + 23 + cc.len());
    assert_eq!(&full[..20], &notified[..]);
    assert_eq!(&full[full.len() - cc.len()..], &cc[..]);
    assert_eq!(h.ascs.read_ase(CONN, SINK, 20).unwrap(), full.slice(20..));
    assert_eq!(h.ascs.read_ase(CONN, SINK, full.len() as u16).unwrap().len(), 0);
    assert_eq!(h.ascs.read_ase(CONN, SINK, full.len() as u16 + 1), Err(AttError::InvalidOffset));

    assert_eq!(&h.ascs.read_ase(CONN, SINK2, 0).unwrap()[..], &[SINK2, 0x00]);
    assert_eq!(h.ascs.read_ase(CONN, 5, 0), Err(AttError::InvalidHandle));
}

#[test]
fn test_read_while_busy() {
    let h = Harness::with(Ascs::builder().with_buffer_timeout(Duration::from_millis(10)), TestHandler::default());
    h.configured(SINK);
    let guard = h.ascs.inner.state.lock();
    let ascs = h.ascs.clone();
    let result = std::thread::spawn(move || ascs.read_ase(CONN, SINK, 0)).join().unwrap();
    drop(guard);
    assert_eq!(result, Err(AttError::InsufficientResources));
    assert!(h.ascs.read_ase(CONN, SINK, 0).is_ok());
}

#[test]
fn test_data_path() {
    let h = Harness::new();
    h.streaming(SINK);
    h.streaming(SOURCE);
    h.clear_events();

    let info = RecvInfo { seq_num: 1, timestamp: None, valid: true };
    h.ascs.iso_recv(chan(SINK), &info, Bytes::from_static(&[0u8; 40]));
    assert_eq!(h.events(SINK), vec![Event::Recv(40)]);

    h.ascs.send(key(SOURCE), Bytes::from_static(&[0u8; 40]), 7, None).unwrap();
    assert_eq!(h.link.0.lock().sent, vec![(chan(SOURCE), 7)]);
    h.ascs.iso_sent(chan(SOURCE));
    assert_eq!(h.events(SOURCE), vec![Event::Sent]);

    assert_eq!(h.ascs.send(key(SINK), Bytes::new(), 0, None), Err(Error::InvalidDirection));
    assert_eq!(h.ascs.send(key(SINK2), Bytes::new(), 0, None), Err(Error::UnknownAse));
}

#[test]
fn test_server_initiated_operations() {
    let h = Harness::new();
    let events = h.events.clone();
    let stream = RecordingStream { id: SOURCE, events };
    h.ascs.config_ase(key(SOURCE), CodecConfig::default(), QosPref::default(), stream).unwrap();
    assert_eq!(
        h.ascs.config_ase(key(SOURCE), CodecConfig::default(), QosPref::default(), NoopStream),
        Err(Error::InvalidState(AseState::CodecConfigured))
    );
    assert_eq!(
        h.ascs.config_ase(key(9), CodecConfig::default(), QosPref::default(), NoopStream),
        Err(Error::InvalidAseId)
    );
    h.process();
    assert_eq!(h.state(SOURCE), Some(AseState::CodecConfigured));

    assert_eq!(h.ascs.disable(key(SOURCE)), Err(Error::InvalidState(AseState::CodecConfigured)));
    h.ascs.reconfig(key(SOURCE), CodecConfig::default(), QosPref::default()).unwrap();
    h.process();
    assert_eq!(h.events(SOURCE), vec![Event::Configured, Event::Configured]);

    h.ascs.release(key(SOURCE)).unwrap();
    assert_eq!(h.ascs.release(key(SOURCE)), Err(Error::InvalidState(AseState::Releasing)));
    h.process();
    assert_eq!(h.state(SOURCE), None);
}

#[test]
fn test_server_values_too_long() {
    let h = Harness::new();
    let long = CodecConfig {
        data: Bytes::from(vec![0u8; 256]),
        ..CodecConfig::default()
    };
    assert_eq!(
        h.ascs.config_ase(key(SINK), long.clone(), QosPref::default(), NoopStream),
        Err(Error::InvalidLength)
    );
    assert_eq!(h.state(SINK), None);

    h.configured(SINK);
    assert_eq!(h.ascs.reconfig(key(SINK), long, QosPref::default()), Err(Error::InvalidLength));
    assert_eq!(h.ascs.endpoint(key(SINK), |ep| ep.codec.data.is_empty()), Some(true));

    h.enabling(SINK2, 2);
    assert_eq!(h.ascs.metadata(key(SINK2), Bytes::from(vec![0u8; 256])), Err(Error::InvalidLength));
    let max = CodecConfig {
        data: Bytes::from(vec![0u8; 255]),
        ..CodecConfig::default()
    };
    h.ascs.reconfig(key(SINK), max, QosPref::default()).unwrap();
    h.process();
    let status = h.ascs.read_ase(CONN, SINK, 0).unwrap();
    assert_eq!(status.len(), 2 + 23 + 255);
    assert_eq!(status[2 + 22], 0xFF);
}

#[test]
fn test_reject_unknown_cis() {
    let h = Harness::new();
    h.configured(SINK);
    assert!(!h.ascs.iso_accept(CONN, 0x00, 0x00, chan(0)));
    assert_eq!(h.ascs.iso_connected(chan(0)), Err(Error::UnknownChannel));
}
