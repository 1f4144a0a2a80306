pub mod ltv;

use std::fmt::{Display, Formatter};

use bitflags::bitflags;
use bytes::Bytes;
use enum_iterator::Sequence;
use instructor::{Exstruct, Instruct};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// LC3 coding format ([Assigned Numbers] Section 2.11).
pub const LC3_CODEC_ID: u8 = 0x06;

/// Vendor specific coding format ([Assigned Numbers] Section 2.11).
pub const VENDOR_CODEC_ID: u8 = 0xFF;

/// Audio direction as seen from the ASCS server.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, IntoPrimitive, TryFromPrimitive, Sequence)]
#[repr(u8)]
pub enum Direction {
    Sink = 0x01,
    Source = 0x02
}

bitflags! {

    /// Audio context types ([Assigned Numbers] Section 6.12.3).
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Context: u16 {
        const Unspecified = 0x0001;
        const Conversational = 0x0002;
        const Media = 0x0004;
        const Game = 0x0008;
        const Instructional = 0x0010;
        const VoiceAssistants = 0x0020;
        const Live = 0x0040;
        const SoundEffects = 0x0080;
        const Notifications = 0x0100;
        const Ringtone = 0x0200;
        const Alerts = 0x0400;
        const EmergencyAlarm = 0x0800;
    }
}

bitflags! {

    /// PHY bitfield used by the preferred PHY and QoS PHY fields ([ASCS] Section 4.3.2).
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Phy: u8 {
        const Le1M = 0x01;
        const Le2M = 0x02;
        const LeCoded = 0x04;
    }
}

// ([ASCS] Section 5.1).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TargetLatency {
    Low = 0x01,
    Balanced = 0x02,
    HighReliability = 0x03
}

// ([ASCS] Section 5.1).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum TargetPhy {
    Le1M = 0x01,
    Le2M = 0x02,
    LeCoded = 0x03
}

/// Codec identifier: coding format, company id and vendor codec id.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash, Exstruct, Instruct)]
#[instructor(endian = "little")]
pub struct CodecId {
    pub id: u8,
    pub cid: u16,
    pub vid: u16
}

impl CodecId {
    pub const LC3: CodecId = CodecId { id: LC3_CODEC_ID, cid: 0x0000, vid: 0x0000 };
}

/// A codec configuration as negotiated by Config Codec.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CodecConfig {
    pub id: CodecId,
    pub target_latency: TargetLatency,
    pub target_phy: TargetPhy,
    /// Codec specific configuration (LTV encoded).
    pub data: Bytes
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            id: CodecId::LC3,
            target_latency: TargetLatency::Balanced,
            target_phy: TargetPhy::Le2M,
            data: Bytes::new()
        }
    }
}

/// Identity of an ASE: owning ACL connection plus ASE id.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AseKey {
    pub conn: u16,
    pub id: u8
}

impl AseKey {
    pub const fn new(conn: u16, id: u8) -> Self {
        Self { conn, id }
    }
}

impl Display for AseKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}/{}", self.conn, self.id)
    }
}

/// HCI status / disconnect reason as delivered by the link layer ([Vol 1] Part F).
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HciReason(pub u8);

impl HciReason {
    pub const SUCCESS: HciReason = HciReason(0x00);
    pub const CONNECTION_TIMEOUT: HciReason = HciReason(0x08);
    pub const REMOTE_USER_TERMINATED: HciReason = HciReason(0x13);
    pub const LOCAL_HOST_TERMINATED: HciReason = HciReason(0x16);
    pub const UNSPECIFIED: HciReason = HciReason(0x1F);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}
