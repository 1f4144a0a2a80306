use bytes::{BufMut, Bytes, BytesMut};
use instructor::utils::u24;
use instructor::{Buffer, BufferMut, Exstruct, Instruct};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::trace;

use crate::ascs::endpoint::AseState;
use crate::ascs::error::{ResponseCode, Rsp};
use crate::ascs::qos::Qos;
use crate::audio::CodecId;
use crate::ensure;

/// Value of the `num_ases` field that marks a response without per ASE entries.
pub const SENTINEL: u8 = 0xFF;

// ([ASCS] Section 5).
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    ConfigCodec = 0x01,
    ConfigQos = 0x02,
    Enable = 0x03,
    ReceiverStartReady = 0x04,
    Disable = 0x05,
    ReceiverStopReady = 0x06,
    UpdateMetadata = 0x07,
    Release = 0x08
}

pub(crate) fn to_u24(value: u32) -> u24 {
    u24::new(value & 0xFF_FFFF)
}

/// Walks the per ASE blocks of a control point operation using only their length fields.
///
/// `data` starts at the `num_ases` field.
pub fn check_length(opcode: Opcode, data: &[u8]) -> Result<(), ResponseCode> {
    let (&num_ases, mut rest) = data.split_first().ok_or(ResponseCode::InvalidLength)?;
    ensure!(num_ases >= 1, ResponseCode::InvalidLength);
    for _ in 0..num_ases {
        let block = match opcode {
            Opcode::ConfigCodec => {
                const HEADER: usize = 9;
                ensure!(rest.len() >= HEADER, ResponseCode::InvalidLength);
                HEADER + rest[HEADER - 1] as usize
            }
            Opcode::ConfigQos => 16,
            Opcode::Enable | Opcode::UpdateMetadata => {
                ensure!(rest.len() >= 2, ResponseCode::InvalidLength);
                2 + rest[1] as usize
            }
            Opcode::ReceiverStartReady | Opcode::Disable | Opcode::ReceiverStopReady | Opcode::Release => 1
        };
        ensure!(rest.len() >= block, ResponseCode::InvalidLength);
        rest = &rest[block..];
    }
    ensure!(rest.is_empty(), ResponseCode::InvalidLength);
    Ok(())
}

// ([ASCS] Section 5.1).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[instructor(endian = "little")]
struct ConfigCodecHeader {
    ase_id: u8,
    target_latency: u8,
    target_phy: u8,
    codec: CodecId,
    cc_len: u8
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConfigCodecParams {
    pub ase_id: u8,
    pub target_latency: u8,
    pub target_phy: u8,
    pub codec: CodecId,
    pub cc: Bytes
}

impl ConfigCodecParams {
    pub fn read(data: &mut Bytes) -> Result<Self, instructor::Error> {
        let header: ConfigCodecHeader = data.read_le()?;
        let cc = split(data, header.cc_len)?;
        Ok(Self {
            ase_id: header.ase_id,
            target_latency: header.target_latency,
            target_phy: header.target_phy,
            codec: header.codec,
            cc
        })
    }

    pub fn write(&self, buffer: &mut BytesMut) {
        buffer.write_le(ConfigCodecHeader {
            ase_id: self.ase_id,
            target_latency: self.target_latency,
            target_phy: self.target_phy,
            codec: self.codec,
            cc_len: self.cc.len() as u8
        });
        buffer.put_slice(&self.cc);
    }
}

// ([ASCS] Section 5.2).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[instructor(endian = "little")]
pub struct ConfigQosParams {
    pub ase_id: u8,
    pub cig_id: u8,
    pub cis_id: u8,
    pub interval: u24,
    pub framing: u8,
    pub phy: u8,
    pub sdu: u16,
    pub rtn: u8,
    pub latency: u16,
    pub pd: u24
}

impl ConfigQosParams {
    pub fn qos(&self) -> Qos {
        Qos {
            interval: u32::from(self.interval),
            framing: self.framing,
            phy: self.phy,
            sdu: self.sdu,
            rtn: self.rtn,
            latency: self.latency,
            pd: u32::from(self.pd)
        }
    }
}

/// Enable and Update Metadata block ([ASCS] Section 5.3 and 5.7).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MetadataParams {
    pub ase_id: u8,
    pub metadata: Bytes
}

impl MetadataParams {
    pub fn read(data: &mut Bytes) -> Result<Self, instructor::Error> {
        let ase_id: u8 = data.read_le()?;
        let len: u8 = data.read_le()?;
        let metadata = split(data, len)?;
        Ok(Self { ase_id, metadata })
    }
}

fn split(data: &mut Bytes, len: u8) -> Result<Bytes, instructor::Error> {
    ensure!(data.len() >= len as usize, instructor::Error::TooShort);
    Ok(data.split_to(len as usize))
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Request {
    ConfigCodec(Vec<ConfigCodecParams>),
    ConfigQos(Vec<ConfigQosParams>),
    Enable(Vec<MetadataParams>),
    ReceiverStartReady(Vec<u8>),
    Disable(Vec<u8>),
    ReceiverStopReady(Vec<u8>),
    UpdateMetadata(Vec<MetadataParams>),
    Release(Vec<u8>)
}

impl Request {
    /// Parses the operation following the opcode byte. The whole operation is length
    /// checked before any block is decoded.
    pub fn parse(opcode: Opcode, mut data: Bytes) -> Result<Self, ResponseCode> {
        check_length(opcode, &data)?;
        let count: u8 = data.read_le()?;
        fn blocks<T>(count: u8, data: &mut Bytes, read: impl Fn(&mut Bytes) -> Result<T, instructor::Error>) -> Result<Vec<T>, instructor::Error> {
            (0..count).map(|_| read(data)).collect()
        }
        let request = match opcode {
            Opcode::ConfigCodec => Request::ConfigCodec(blocks(count, &mut data, ConfigCodecParams::read)?),
            Opcode::ConfigQos => Request::ConfigQos(blocks(count, &mut data, |data| data.read_le())?),
            Opcode::Enable => Request::Enable(blocks(count, &mut data, MetadataParams::read)?),
            Opcode::ReceiverStartReady => Request::ReceiverStartReady(blocks(count, &mut data, |data| data.read_le())?),
            Opcode::Disable => Request::Disable(blocks(count, &mut data, |data| data.read_le())?),
            Opcode::ReceiverStopReady => Request::ReceiverStopReady(blocks(count, &mut data, |data| data.read_le())?),
            Opcode::UpdateMetadata => Request::UpdateMetadata(blocks(count, &mut data, MetadataParams::read)?),
            Opcode::Release => Request::Release(blocks(count, &mut data, |data| data.read_le())?)
        };
        data.finish()?;
        trace!("Parsed control point request: {:?}", request);
        Ok(request)
    }
}

// ([ASCS] Section 5 Table 5.1).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[instructor(endian = "little")]
pub struct AseResponse {
    pub ase_id: u8,
    pub code: ResponseCode,
    pub reason: u8
}

/// The response aggregate of one control point operation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ControlPointResponse {
    pub opcode: u8,
    pub entries: Vec<AseResponse>,
    pub sentinel: Option<ResponseCode>
}

impl ControlPointResponse {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode: opcode.into(),
            entries: Vec::new(),
            sentinel: None
        }
    }

    pub fn unsupported(opcode: u8) -> Self {
        Self {
            opcode,
            entries: Vec::new(),
            sentinel: Some(ResponseCode::UnsupportedOpcode)
        }
    }

    pub fn invalid_length(opcode: Opcode) -> Self {
        Self {
            opcode: opcode.into(),
            entries: Vec::new(),
            sentinel: Some(ResponseCode::InvalidLength)
        }
    }

    pub fn push(&mut self, ase_id: u8, rsp: Rsp) {
        if self.sentinel.is_some() {
            return;
        }
        self.entries.push(AseResponse {
            ase_id,
            code: rsp.code,
            reason: rsp.reason
        });
    }

    pub fn response(&self, ase_id: u8) -> Option<Rsp> {
        self.entries
            .iter()
            .find(|entry| entry.ase_id == ase_id)
            .map(|entry| Rsp { code: entry.code, reason: entry.reason })
    }

    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(2 + 3 * self.entries.len().max(1));
        buffer.write_le(self.opcode);
        match self.sentinel {
            Some(code) => {
                buffer.write_le(SENTINEL);
                buffer.write_le(AseResponse { ase_id: 0x00, code, reason: 0x00 });
            }
            None => {
                buffer.write_le(self.entries.len() as u8);
                for entry in &self.entries {
                    buffer.write_le(*entry);
                }
            }
        }
        buffer.freeze()
    }
}

// ([ASCS] Section 4.3.2).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[instructor(endian = "little")]
pub struct CodecStatus {
    pub framing: u8,
    pub phy: u8,
    pub rtn: u8,
    pub latency: u16,
    pub pd_min: u24,
    pub pd_max: u24,
    pub pref_pd_min: u24,
    pub pref_pd_max: u24,
    pub codec: CodecId,
    pub cc_len: u8
}

// ([ASCS] Section 4.3.3).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[instructor(endian = "little")]
pub struct QosStatus {
    pub cig_id: u8,
    pub cis_id: u8,
    pub interval: u24,
    pub framing: u8,
    pub phy: u8,
    pub sdu: u16,
    pub rtn: u8,
    pub latency: u16,
    pub pd: u24
}

// ([ASCS] Section 4.3.4).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Exstruct, Instruct)]
#[instructor(endian = "little")]
pub struct StreamStatus {
    pub cig_id: u8,
    pub cis_id: u8,
    pub metadata_len: u8
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StatusTail {
    None,
    Codec(CodecStatus, Bytes),
    Qos(QosStatus),
    Stream { cig_id: u8, cis_id: u8, metadata: Bytes }
}

/// A decoded ASE characteristic value.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AseStatus {
    pub ase_id: u8,
    pub state: AseState,
    pub tail: StatusTail
}

impl AseStatus {
    pub fn read(data: &mut Bytes) -> Result<Self, instructor::Error> {
        let ase_id: u8 = data.read_le()?;
        let state: AseState = data.read_le()?;
        let tail = match state {
            AseState::Idle | AseState::Releasing => StatusTail::None,
            AseState::CodecConfigured => {
                let status: CodecStatus = data.read_le()?;
                let cc = split(data, status.cc_len)?;
                StatusTail::Codec(status, cc)
            }
            AseState::QosConfigured => StatusTail::Qos(data.read_le()?),
            AseState::Enabling | AseState::Streaming | AseState::Disabling => {
                let status: StreamStatus = data.read_le()?;
                let metadata = split(data, status.metadata_len)?;
                StatusTail::Stream {
                    cig_id: status.cig_id,
                    cis_id: status.cis_id,
                    metadata
                }
            }
        };
        data.finish()?;
        Ok(Self { ase_id, state, tail })
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use instructor::utils::u24;

    use crate::ascs::error::{ResponseCode, Rsp};
    use crate::ascs::packets::{check_length, ConfigCodecParams, ControlPointResponse, Opcode, Request};
    use crate::audio::CodecId;

    #[test]
    fn test_config_codec_round_trip() {
        let params = ConfigCodecParams {
            ase_id: 3,
            target_latency: 0x02,
            target_phy: 0x02,
            codec: CodecId { id: 0xFF, cid: 0x1234, vid: 0xBEEF },
            cc: Bytes::from_static(&[0x02, 0x01, 0x03, 0x02, 0x02, 0x01])
        };
        let mut buffer = BytesMut::new();
        params.write(&mut buffer);
        assert_eq!(&buffer[..9], &[0x03, 0x02, 0x02, 0xFF, 0x34, 0x12, 0xEF, 0xBE, 0x06]);
        let mut data = buffer.freeze();
        assert_eq!(ConfigCodecParams::read(&mut data).unwrap(), params);
        assert!(data.is_empty());
    }

    #[test]
    fn test_length_walk() {
        // start ready claiming two ASEs with only one id present
        assert_eq!(check_length(Opcode::ReceiverStartReady, &[0x02, 0x01]), Err(ResponseCode::InvalidLength));
        assert_eq!(check_length(Opcode::ReceiverStartReady, &[0x02, 0x01, 0x02]), Ok(()));
        assert_eq!(check_length(Opcode::Release, &[0x00]), Err(ResponseCode::InvalidLength));
        assert_eq!(check_length(Opcode::Release, &[]), Err(ResponseCode::InvalidLength));
        // trailing garbage
        assert_eq!(check_length(Opcode::Disable, &[0x01, 0x01, 0x00]), Err(ResponseCode::InvalidLength));
        // metadata length pointing past the end
        assert_eq!(check_length(Opcode::Enable, &[0x01, 0x01, 0x04, 0x03, 0x02]), Err(ResponseCode::InvalidLength));
        assert_eq!(check_length(Opcode::Enable, &[0x01, 0x01, 0x00]), Ok(()));
        assert_eq!(check_length(Opcode::ConfigQos, &[0x01; 16]), Err(ResponseCode::InvalidLength));
        assert_eq!(check_length(Opcode::ConfigQos, &[0x01; 17]), Ok(()));
        assert_eq!(check_length(Opcode::ConfigCodec, &[0x01, 0x01, 0x01, 0x01, 0x06, 0x00, 0x00, 0x00, 0x00, 0x01]), Err(ResponseCode::InvalidLength));
    }

    #[test]
    fn test_parse_qos() {
        let data = Bytes::from_static(&[
            0x01, 0x02, 0x00, 0x00, 0x10, 0x27, 0x00, 0x00, 0x01, 0x28, 0x00, 0x02, 0x0A, 0x00, 0x40, 0x9C, 0x00
        ]);
        let Request::ConfigQos(blocks) = Request::parse(Opcode::ConfigQos, data).unwrap() else {
            panic!("unexpected request");
        };
        assert_eq!(blocks.len(), 1);
        let qos = blocks[0].qos();
        assert_eq!(blocks[0].ase_id, 2);
        assert_eq!(blocks[0].interval, u24::new(10_000));
        assert_eq!((qos.interval, qos.sdu, qos.latency, qos.pd), (10_000, 40, 10, 40_000));
    }

    #[test]
    fn test_response_encoding() {
        let mut rsp = ControlPointResponse::new(Opcode::Enable);
        rsp.push(1, Rsp::SUCCESS);
        rsp.push(5, Rsp::code(ResponseCode::InvalidAseId));
        assert_eq!(&rsp.encode()[..], &[0x03, 0x02, 0x01, 0x00, 0x00, 0x05, 0x03, 0x00]);
        assert_eq!(
            &ControlPointResponse::invalid_length(Opcode::ReceiverStartReady).encode()[..],
            &[0x04, 0xFF, 0x00, 0x02, 0x00]
        );
        assert_eq!(&ControlPointResponse::unsupported(0x09).encode()[..], &[0x09, 0xFF, 0x00, 0x01, 0x00]);
    }
}
