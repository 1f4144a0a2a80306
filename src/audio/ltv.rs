use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, trace};

use crate::audio::{Context, Direction};
use crate::ensure;

/// Iterator over the `(type, value)` records of an LTV encoded blob.
///
/// Every record is `[length][type][value; length - 1]`. Iteration stops with an
/// error on the first record that does not fit in the remaining data.
pub struct LtvIter<'a> {
    data: &'a [u8]
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("Malformed LTV structure")]
pub struct MalformedLtv;

impl<'a> LtvIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for LtvIter<'a> {
    type Item = Result<(u8, &'a [u8]), MalformedLtv>;

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, rest) = self.data.split_first()?;
        let len = len as usize;
        if len == 0 || len > rest.len() {
            self.data = &[];
            return Some(Err(MalformedLtv));
        }
        let (record, rest) = rest.split_at(len);
        self.data = rest;
        Some(Ok((record[0], &record[1..])))
    }
}

pub fn is_valid(data: &[u8]) -> bool {
    LtvIter::new(data).all(|record| record.is_ok())
}

// ([Assigned Numbers] Section 6.12.6).
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MetadataType {
    PreferredContext = 0x01,
    StreamingContext = 0x02,
    ProgramInfo = 0x03,
    Language = 0x04,
    CcidList = 0x05,
    ParentalRating = 0x06,
    ProgramInfoUri = 0x07,
    AudioActiveState = 0x08,
    BroadcastImmediate = 0x09,
    AssistedListeningStream = 0x0A,
    BroadcastName = 0x0B,
    Extended = 0xFE,
    Vendor = 0xFF
}

impl MetadataType {
    fn required_len(self) -> Option<usize> {
        match self {
            MetadataType::PreferredContext | MetadataType::StreamingContext => Some(2),
            MetadataType::Language => Some(3),
            MetadataType::ParentalRating => Some(1),
            MetadataType::AudioActiveState => Some(1),
            MetadataType::BroadcastImmediate => Some(0),
            _ => None
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MetadataError {
    #[error("The metadata is not a valid LTV structure")]
    Malformed,
    #[error("Invalid value for metadata type 0x{0:02X}")]
    Invalid(u8),
    #[error("Metadata type 0x{0:02X} has a value that is currently not available")]
    Rejected(u8)
}

impl From<MalformedLtv> for MetadataError {
    fn from(_: MalformedLtv) -> Self {
        MetadataError::Malformed
    }
}

/// Validates metadata written by Enable or Update Metadata.
///
/// `available` are the contexts currently advertised for `dir` by the capability
/// acceptor, `None` when that role is not active. Returns the streaming audio
/// contexts, if present.
pub fn validate_metadata(data: &[u8], dir: Direction, available: Option<Context>) -> Result<Option<Context>, MetadataError> {
    let mut streaming = None;
    for record in LtvIter::new(data) {
        let (raw, value) = record?;
        let Ok(kind) = MetadataType::try_from(raw) else {
            debug!("Ignoring unknown metadata type 0x{:02X}", raw);
            continue;
        };
        trace!("Metadata {:?}: {:02X?}", kind, value);
        if let Some(len) = kind.required_len() {
            ensure!(value.len() == len, MetadataError::Invalid(raw));
        }
        if kind == MetadataType::StreamingContext {
            let context = Context::from_bits_retain(u16::from_le_bytes([value[0], value[1]]));
            ensure!(!context.is_empty(), MetadataError::Invalid(raw));
            if let Some(available) = available {
                if !available.contains(context) {
                    debug!("Streaming context {:?} not available for {:?} (available: {:?})", context, dir, available);
                    return Err(MetadataError::Rejected(raw));
                }
            }
            streaming = Some(context);
        }
    }
    Ok(streaming)
}

#[cfg(test)]
mod tests {
    use crate::audio::ltv::{is_valid, validate_metadata, LtvIter, MetadataError};
    use crate::audio::{Context, Direction};

    #[test]
    fn test_ltv_iteration() {
        let data: &[u8] = &[0x02, 0x01, 0x03, 0x03, 0x02, 0x01, 0x00];
        let records: Vec<_> = LtvIter::new(data).collect::<Result<_, _>>().unwrap();
        assert_eq!(records, vec![(0x01, &[0x03][..]), (0x02, &[0x01, 0x00][..])]);
        assert!(is_valid(&[]));
        assert!(!is_valid(&[0x03, 0x01, 0x00]));
        assert!(!is_valid(&[0x00]));
    }

    #[test]
    fn test_metadata_lengths() {
        // streaming context with a one byte value
        assert_eq!(validate_metadata(&[0x02, 0x02, 0x04], Direction::Sink, None), Err(MetadataError::Invalid(0x02)));
        // language needs three bytes
        assert_eq!(validate_metadata(&[0x03, 0x04, b'e', b'n'], Direction::Sink, None), Err(MetadataError::Invalid(0x04)));
        // broadcast immediate carries no value
        assert_eq!(validate_metadata(&[0x01, 0x09], Direction::Sink, None), Ok(None));
        assert_eq!(validate_metadata(&[0x02, 0x09, 0x00], Direction::Sink, None), Err(MetadataError::Invalid(0x09)));
        // unknown types are skipped
        assert_eq!(validate_metadata(&[0x03, 0x42, 0x01, 0x02], Direction::Sink, None), Ok(None));
        assert_eq!(validate_metadata(&[0x05, 0x02], Direction::Sink, None), Err(MetadataError::Malformed));
    }

    #[test]
    fn test_streaming_context() {
        let media = [0x03, 0x02, 0x04, 0x00];
        assert_eq!(validate_metadata(&media, Direction::Sink, None), Ok(Some(Context::Media)));
        assert_eq!(validate_metadata(&media, Direction::Sink, Some(Context::Media | Context::Game)), Ok(Some(Context::Media)));
        assert_eq!(validate_metadata(&media, Direction::Source, Some(Context::Conversational)), Err(MetadataError::Rejected(0x02)));
        // prohibited
        assert_eq!(validate_metadata(&[0x03, 0x02, 0x00, 0x00], Direction::Sink, None), Err(MetadataError::Invalid(0x02)));
    }
}
