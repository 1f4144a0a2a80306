use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};
use enum_iterator::Sequence;
use instructor::{BufferMut, Exstruct, Instruct};
use tracing::{debug, trace};

use crate::ascs::handler::StreamOps;
use crate::ascs::packets::{to_u24, CodecStatus, QosStatus, StreamStatus};
use crate::ascs::qos::{Qos, QosPref};
use crate::audio::{AseKey, CodecConfig, Direction, HciReason};
use crate::iso::{ChannelState, IsoEndpoint, IsoRef};

// ([ASCS] Section 4.1).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Exstruct, Instruct, Sequence)]
#[repr(u8)]
pub enum AseState {
    #[default]
    Idle = 0x00,
    CodecConfigured = 0x01,
    QosConfigured = 0x02,
    Enabling = 0x03,
    Streaming = 0x04,
    Disabling = 0x05,
    Releasing = 0x06
}

impl AseState {
    /// The ASE state machine ([ASCS] Section 3). `link_loss` allows any direction to
    /// fall back from Enabling or Streaming to QoS Configured.
    pub fn can_transition(self, new: AseState, dir: Direction, link_loss: bool) -> bool {
        use AseState::*;
        match new {
            Idle => true,
            CodecConfigured => matches!(self, Idle | CodecConfigured | QosConfigured | Releasing),
            QosConfigured => match self {
                CodecConfigured | QosConfigured => true,
                Disabling => dir == Direction::Source,
                Enabling | Streaming => dir == Direction::Sink || link_loss,
                _ => false
            },
            Enabling => matches!(self, QosConfigured | Enabling),
            Streaming => matches!(self, Enabling | Streaming),
            Disabling => matches!(self, Enabling | Streaming) && dir == Direction::Source,
            Releasing => match self {
                CodecConfigured | QosConfigured | Enabling | Streaming => true,
                Disabling => dir == Direction::Source,
                _ => false
            }
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, AseState::Enabling | AseState::Streaming | AseState::Disabling)
    }
}

/// What the commit task has to do after the entry action of a state ran.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Followup {
    None,
    Request(AseState),
    ScheduleDisconnect,
    /// Releasing with no transport left to tear down.
    Released,
    Free
}

pub struct Endpoint {
    pub key: AseKey,
    pub dir: Direction,
    pub state: AseState,
    pub codec: CodecConfig,
    pub qos: Qos,
    pub qos_pref: QosPref,
    pub metadata: Bytes,
    pub cig_id: u8,
    pub cis_id: u8,
    pub receiver_ready: bool,
    pub reason: HciReason,
    pub link_loss: bool,
    pub(crate) pending: VecDeque<AseState>,
    pub(crate) commit_scheduled: bool,
    pub(crate) iso: Option<IsoRef>,
    pub(crate) stream: Box<dyn StreamOps>
}

impl Endpoint {
    pub fn new(key: AseKey, dir: Direction, stream: Box<dyn StreamOps>) -> Self {
        Self {
            key,
            dir,
            state: AseState::Idle,
            codec: CodecConfig::default(),
            qos: Qos::default(),
            qos_pref: QosPref::default(),
            metadata: Bytes::new(),
            cig_id: 0,
            cis_id: 0,
            receiver_ready: false,
            reason: HciReason::SUCCESS,
            link_loss: false,
            pending: VecDeque::new(),
            commit_scheduled: false,
            iso: None,
            stream
        }
    }

    /// The state this endpoint ends up in once all requested transitions are committed.
    pub fn effective_state(&self) -> AseState {
        self.pending.back().copied().unwrap_or(self.state)
    }

    pub fn iso_endpoint(&self) -> IsoEndpoint {
        IsoEndpoint {
            key: self.key,
            dir: self.dir,
            client: false
        }
    }

    pub fn iso(&self) -> Option<&IsoRef> {
        self.iso.as_ref()
    }

    pub fn iso_state(&self) -> ChannelState {
        self.iso
            .as_ref()
            .map(|iso| iso.lock().state)
            .unwrap_or_default()
    }

    pub(crate) fn bind_iso(&mut self, iso: &IsoRef) {
        iso.bind(self.iso_endpoint(), &mut self.iso);
    }

    pub(crate) fn unbind_iso(&mut self) {
        if self.iso.is_some() {
            let ep = self.iso_endpoint();
            IsoRef::unbind(&mut self.iso, &ep);
        }
    }

    /// Queues `new` behind all outstanding transitions.
    ///
    /// Returns `true` if a commit has to be scheduled. Panics on an illegal transition.
    pub(crate) fn push_state(&mut self, new: AseState) -> bool {
        let from = self.effective_state();
        assert!(
            from.can_transition(new, self.dir, self.link_loss),
            "{} ({:?}): illegal transition {:?} -> {:?}", self.key, self.dir, from, new
        );
        debug!("{}: requesting {:?} -> {:?}", self.key, from, new);
        if !matches!(new, AseState::Enabling | AseState::Streaming) {
            self.receiver_ready = false;
        }
        self.pending.push_back(new);
        !std::mem::replace(&mut self.commit_scheduled, true)
    }

    /// A receiver ready signal given for a queued Enabling survives the commits in front of it.
    fn reset_receiver_ready(&mut self) {
        if !matches!(self.effective_state(), AseState::Enabling | AseState::Streaming) {
            self.receiver_ready = false;
        }
    }

    pub(crate) fn exit(&mut self, old: AseState, new: AseState) {
        match old {
            AseState::Streaming => {
                if self.reason.is_success() {
                    self.reason = HciReason::UNSPECIFIED;
                }
                // link loss skips Disabling
                if new == AseState::QosConfigured {
                    self.stream.disabled();
                }
                self.stream.stopped(self.reason);
            }
            AseState::Enabling => {
                // sink ASEs never pass through Disabling
                if new == AseState::QosConfigured && self.dir == Direction::Sink {
                    self.stream.disabled();
                }
            }
            _ => {}
        }
    }

    pub(crate) fn enter(&mut self, old: AseState, new: AseState) -> Followup {
        trace!("{}: entering {:?} from {:?}", self.key, new, old);
        match new {
            AseState::Idle => {
                self.receiver_ready = false;
                self.stream.released();
                Followup::Free
            }
            AseState::CodecConfigured => {
                self.reset_receiver_ready();
                if matches!(old, AseState::QosConfigured | AseState::Releasing) {
                    self.unbind_iso();
                }
                self.stream.configured(&self.qos_pref);
                Followup::None
            }
            AseState::QosConfigured => {
                self.reset_receiver_ready();
                self.stream.qos_set();
                Followup::None
            }
            AseState::Enabling => {
                self.stream.enabled();
                // start() and iso_connected() normally queue Streaming themselves
                let escalate = self.dir == Direction::Sink
                    && self.receiver_ready
                    && self.iso_state() == ChannelState::Connected
                    && self.effective_state() == AseState::Enabling;
                match escalate {
                    true => Followup::Request(AseState::Streaming),
                    false => Followup::None
                }
            }
            AseState::Streaming => {
                self.stream.started();
                Followup::None
            }
            AseState::Disabling => {
                self.reset_receiver_ready();
                self.stream.disabled();
                Followup::None
            }
            AseState::Releasing => {
                self.reset_receiver_ready();
                if self.effective_state() != AseState::Releasing {
                    return Followup::None;
                }
                match self.iso_state() {
                    ChannelState::Connected | ChannelState::Connecting => Followup::ScheduleDisconnect,
                    // the channel teardown will complete the release
                    ChannelState::Disconnecting => Followup::None,
                    ChannelState::Disconnected => Followup::Released
                }
            }
        }
    }

    /// Serializes the ASE characteristic value.
    pub fn write_status(&self, buffer: &mut BytesMut) {
        buffer.write_le(self.key.id);
        buffer.write_le(self.state);
        match self.state {
            AseState::Idle | AseState::Releasing => {}
            AseState::CodecConfigured => {
                let pref = &self.qos_pref;
                buffer.write_le(CodecStatus {
                    framing: pref.framing(),
                    phy: pref.phy.bits(),
                    rtn: pref.rtn,
                    latency: pref.latency,
                    pd_min: to_u24(pref.pd_min),
                    pd_max: to_u24(pref.pd_max),
                    pref_pd_min: to_u24(pref.pref_pd_min),
                    pref_pd_max: to_u24(pref.pref_pd_max),
                    codec: self.codec.id,
                    cc_len: self.codec.data.len() as u8
                });
                buffer.put_slice(&self.codec.data);
            }
            AseState::QosConfigured => {
                buffer.write_le(QosStatus {
                    cig_id: self.cig_id,
                    cis_id: self.cis_id,
                    interval: to_u24(self.qos.interval),
                    framing: self.qos.framing,
                    phy: self.qos.phy,
                    sdu: self.qos.sdu,
                    rtn: self.qos.rtn,
                    latency: self.qos.latency,
                    pd: to_u24(self.qos.pd)
                });
            }
            AseState::Enabling | AseState::Streaming | AseState::Disabling => {
                buffer.write_le(StreamStatus {
                    cig_id: self.cig_id,
                    cis_id: self.cis_id,
                    metadata_len: self.metadata.len() as u8
                });
                buffer.put_slice(&self.metadata);
            }
        }
    }

    /// The value of an ASE characteristic without an allocated endpoint.
    pub fn write_idle_status(id: u8, buffer: &mut BytesMut) {
        buffer.write_le(id);
        buffer.write_le(AseState::Idle);
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("key", &self.key)
            .field("dir", &self.dir)
            .field("state", &self.state)
            .field("pending", &self.pending)
            .field("iso", &self.iso)
            .finish_non_exhaustive()
    }
}
