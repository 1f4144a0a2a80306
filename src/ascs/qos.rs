use tracing::warn;

use crate::ascs::error::{Reason, ResponseCode, Rsp};
use crate::audio::Phy;
use crate::ensure;

pub const SDU_INTERVAL_MIN: u32 = 0x0000FF;
pub const SDU_INTERVAL_MAX: u32 = 0x0FFFFF;
pub const MAX_SDU: u16 = 0x0FFF;
pub const LATENCY_MIN: u16 = 0x0005;
pub const LATENCY_MAX: u16 = 0x0FA0;
pub const PRESENTATION_DELAY_MAX: u32 = 0xFFFFFF;

pub const FRAMING_UNFRAMED: u8 = 0x00;
pub const FRAMING_FRAMED: u8 = 0x01;

/// QoS parameters as set by Config QoS ([ASCS] Section 5.2).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Qos {
    /// SDU interval in microseconds.
    pub interval: u32,
    pub framing: u8,
    pub phy: u8,
    pub sdu: u16,
    pub rtn: u8,
    /// Max transport latency in milliseconds.
    pub latency: u16,
    /// Presentation delay in microseconds.
    pub pd: u32
}

impl Qos {
    pub fn validate(&self) -> Result<(), Rsp> {
        let invalid = |reason| Rsp::new(ResponseCode::ConfInvalid, reason);
        ensure!((SDU_INTERVAL_MIN..=SDU_INTERVAL_MAX).contains(&self.interval), invalid(Reason::SduInterval));
        ensure!(self.framing <= FRAMING_FRAMED, invalid(Reason::Framing));
        ensure!(
            [Phy::Le1M, Phy::Le2M, Phy::LeCoded].contains(&Phy::from_bits_retain(self.phy)),
            invalid(Reason::Phy)
        );
        ensure!(self.sdu <= MAX_SDU, invalid(Reason::MaxSdu));
        ensure!((LATENCY_MIN..=LATENCY_MAX).contains(&self.latency), invalid(Reason::MaxTransportLatency));
        ensure!(self.pd <= PRESENTATION_DELAY_MAX, invalid(Reason::PresentationDelay));
        Ok(())
    }
}

/// Server QoS preferences reported in the Codec Configured state ([ASCS] Section 4.3.2).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct QosPref {
    pub unframed_supported: bool,
    pub phy: Phy,
    pub rtn: u8,
    pub latency: u16,
    pub pd_min: u32,
    pub pd_max: u32,
    pub pref_pd_min: u32,
    pub pref_pd_max: u32
}

impl Default for QosPref {
    fn default() -> Self {
        Self {
            unframed_supported: true,
            phy: Phy::Le2M,
            rtn: 2,
            latency: 10,
            pd_min: 20_000,
            pd_max: 40_000,
            pref_pd_min: 0,
            pref_pd_max: 0
        }
    }
}

impl QosPref {
    /// Checks `qos` against the advertised preferences.
    ///
    /// Only the framing support and the presentation delay range are binding.
    pub fn check(&self, qos: &Qos) -> Result<(), Rsp> {
        let unsupported = |reason| Rsp::new(ResponseCode::ConfUnsupported, reason);
        ensure!(self.unframed_supported || qos.framing != FRAMING_UNFRAMED, unsupported(Reason::Framing));
        ensure!((self.pd_min..=self.pd_max).contains(&qos.pd), unsupported(Reason::PresentationDelay));
        if qos.latency > self.latency {
            warn!("Max transport latency {}ms exceeds the preferred {}ms", qos.latency, self.latency);
        }
        if !self.phy.intersects(Phy::from_bits_retain(qos.phy)) {
            warn!("PHY 0x{:02X} is not among the preferred {:?}", qos.phy, self.phy);
        }
        Ok(())
    }

    pub fn framing(&self) -> u8 {
        match self.unframed_supported {
            true => 0x00,
            false => 0x01
        }
    }
}
