use bytes::Bytes;

use crate::ascs::error::{ResponseCode, Rsp};
use crate::ascs::qos::{Qos, QosPref};
use crate::audio::{AseKey, CodecConfig, CodecId, Context, Direction, HciReason};
use crate::iso::RecvInfo;

/// Lifecycle observer of a single stream. Every hook is optional.
///
/// Hooks run while the service state is locked and must not call back into [`Ascs`](crate::ascs::Ascs).
#[allow(unused_variables)]
pub trait StreamOps: Send {
    fn configured(&mut self, pref: &QosPref) {}

    fn qos_set(&mut self) {}

    fn enabled(&mut self) {}

    fn metadata_updated(&mut self) {}

    fn started(&mut self) {}

    fn stopped(&mut self, reason: HciReason) {}

    fn disabled(&mut self) {}

    fn released(&mut self) {}

    fn connected(&mut self) {}

    fn disconnected(&mut self, reason: HciReason) {}

    fn recv(&mut self, info: &RecvInfo, sdu: Bytes) {}

    fn sent(&mut self) {}
}

/// A stream without observer.
pub struct NoopStream;

impl StreamOps for NoopStream {}

/// Application hooks consulted by the control point before any state change.
///
/// Returning an error vetoes the operation for that ASE; the code is reported to the client.
#[allow(unused_variables)]
pub trait AscsHandler: Send {
    /// A client configures a previously unused ASE.
    fn config(&mut self, key: AseKey, dir: Direction, codec: &CodecConfig) -> Result<(Box<dyn StreamOps>, QosPref), Rsp> {
        Err(Rsp::code(ResponseCode::Unspecified))
    }

    /// A client reconfigures an ASE in the Codec Configured or QoS Configured state.
    fn reconfig(&mut self, key: AseKey, dir: Direction, codec: &CodecConfig, pref: &mut QosPref) -> Result<(), Rsp> {
        Ok(())
    }

    fn qos(&mut self, key: AseKey, qos: &Qos) -> Result<(), Rsp> {
        Ok(())
    }

    fn enable(&mut self, key: AseKey, metadata: &[u8]) -> Result<(), Rsp> {
        Ok(())
    }

    fn start(&mut self, key: AseKey) -> Result<(), Rsp> {
        Ok(())
    }

    fn metadata(&mut self, key: AseKey, metadata: &[u8]) -> Result<(), Rsp> {
        Ok(())
    }

    fn disable(&mut self, key: AseKey) -> Result<(), Rsp> {
        Ok(())
    }

    fn stop(&mut self, key: AseKey) -> Result<(), Rsp> {
        Ok(())
    }

    fn release(&mut self, key: AseKey) -> Result<(), Rsp> {
        Ok(())
    }

    fn codec_supported(&self, dir: Direction, codec: &CodecId) -> bool {
        true
    }

    /// Contexts currently available for `dir`, `None` when context availability is not tracked.
    fn available_contexts(&self, conn: u16, dir: Direction) -> Option<Context> {
        None
    }
}
