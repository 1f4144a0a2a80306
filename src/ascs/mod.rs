mod control_point;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod packets;
mod pool;
pub mod qos;
mod server;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::ascs::server::AscsState;
use crate::audio::{AseKey, CodecConfig, HciReason};
use crate::ensure;
use crate::gatt::{AttError, GattServer};
use crate::iso::{ChannelId, IsoTransport, RecvInfo};

pub use endpoint::{AseState, Endpoint};
pub use error::{Error, Reason, ResponseCode, Rsp};
pub use handler::{AscsHandler, NoopStream, StreamOps};
pub use qos::{Qos, QosPref};

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AscsConfig {
    /// Sink ASEs per connection, using the ids `1..=sink_count`.
    pub sink_count: u8,
    /// Source ASEs per connection, numbered after the sinks.
    pub source_count: u8,
    pub max_ases: usize,
    pub max_iso: usize,
    pub disconnect_delay: Duration,
    pub buffer_timeout: Duration,
    /// Complete a release into Codec Configured instead of Idle.
    pub cache_codec_on_release: bool
}

impl Default for AscsConfig {
    fn default() -> Self {
        Self {
            sink_count: 2,
            source_count: 2,
            max_ases: 8,
            max_iso: 4,
            disconnect_delay: Duration::from_millis(500),
            buffer_timeout: Duration::from_millis(100),
            cache_codec_on_release: false
        }
    }
}

#[derive(Default)]
pub struct AscsBuilder {
    config: AscsConfig
}

impl AscsBuilder {
    pub fn with_config(mut self, config: AscsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_sink_count(mut self, count: u8) -> Self {
        self.config.sink_count = count;
        self
    }

    pub fn with_source_count(mut self, count: u8) -> Self {
        self.config.source_count = count;
        self
    }

    pub fn with_max_ases(mut self, max: usize) -> Self {
        self.config.max_ases = max;
        self
    }

    pub fn with_max_iso(mut self, max: usize) -> Self {
        self.config.max_iso = max;
        self
    }

    pub fn with_disconnect_delay(mut self, delay: Duration) -> Self {
        self.config.disconnect_delay = delay;
        self
    }

    pub fn with_buffer_timeout(mut self, timeout: Duration) -> Self {
        self.config.buffer_timeout = timeout;
        self
    }

    pub fn with_codec_caching(mut self, enabled: bool) -> Self {
        self.config.cache_codec_on_release = enabled;
        self
    }

    pub fn build<G, T, H>(self, gatt: G, transport: T, handler: H) -> Ascs
    where
        G: GattServer + 'static,
        T: IsoTransport + 'static,
        H: AscsHandler + 'static
    {
        debug_assert!(self.config.sink_count as u16 + self.config.source_count as u16 <= u8::MAX as u16);
        Ascs {
            inner: Arc::new(Inner {
                buffer_timeout: self.config.buffer_timeout,
                state: Mutex::new(AscsState::new(self.config, Box::new(gatt), Box::new(transport), Box::new(handler))),
                wakeup: Notify::new()
            })
        }
    }
}

struct Inner {
    state: Mutex<AscsState>,
    wakeup: Notify,
    buffer_timeout: Duration
}

/// The Audio Stream Control Service of a unicast server.
///
/// State changes are committed by a work queue that is drained by [`Ascs::run`]
/// (or manually with [`Ascs::process_pending`]).
#[derive(Clone)]
pub struct Ascs {
    inner: Arc<Inner>
}

impl Ascs {
    pub fn builder() -> AscsBuilder {
        AscsBuilder::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut AscsState) -> R) -> R {
        let (result, wake) = {
            let mut state = self.inner.state.lock();
            let result = f(&mut state);
            (result, !state.queue.is_empty())
        };
        if wake {
            self.inner.wakeup.notify_one();
        }
        result
    }

    /// Write to the ASE Control Point characteristic.
    pub fn write_control_point(&self, conn: u16, offset: u16, data: &[u8], prepare: bool) -> Result<usize, AttError> {
        if prepare {
            trace!("Long write to the control point in progress");
            return Ok(0);
        }
        ensure!(offset == 0, AttError::InvalidOffset);
        ensure!(!data.is_empty(), AttError::InvalidAttributeValueLength);
        self.with_state(|state| {
            let rsp = state.handle_control_point(conn, Bytes::copy_from_slice(data));
            state.notify_response(conn, &rsp);
        });
        Ok(data.len())
    }

    /// Read of a Sink or Source ASE characteristic.
    ///
    /// Fails with [`AttError::InsufficientResources`] if the service stays busy for longer than the buffer timeout.
    pub fn read_ase(&self, conn: u16, id: u8, offset: u16) -> Result<Bytes, AttError> {
        let value = self
            .inner
            .state
            .try_lock_for(self.inner.buffer_timeout)
            .ok_or(AttError::InsufficientResources)?
            .read_status(conn, id)
            .ok_or(AttError::InvalidHandle)?;
        let offset = offset as usize;
        ensure!(offset <= value.len(), AttError::InvalidOffset);
        Ok(value.slice(offset..))
    }

    /// The committed state of an ASE, `None` if it is not in use.
    pub fn state(&self, key: AseKey) -> Option<AseState> {
        self.endpoint(key, |ep| ep.state)
    }

    pub fn endpoint<R>(&self, key: AseKey, f: impl FnOnce(&Endpoint) -> R) -> Option<R> {
        let state = self.inner.state.lock();
        state.pool.find(key).and_then(|handle| state.pool.get(handle)).map(f)
    }

    /// Number of iso bindings currently allocated.
    pub fn iso_bindings(&self) -> usize {
        self.inner.state.lock().iso.in_use()
    }

    pub fn iso_accept(&self, acl: u16, cig_id: u8, cis_id: u8, channel: ChannelId) -> bool {
        self.with_state(|state| state.iso_accept(acl, cig_id, cis_id, channel))
    }

    pub fn iso_connected(&self, channel: ChannelId) -> Result<(), Error> {
        self.with_state(|state| state.iso_connected(channel))
    }

    pub fn iso_disconnected(&self, channel: ChannelId, reason: HciReason) -> Result<(), Error> {
        self.with_state(|state| state.iso_disconnected(channel, reason))
    }

    pub fn iso_recv(&self, channel: ChannelId, info: &RecvInfo, sdu: Bytes) {
        self.with_state(|state| state.iso_recv(channel, info, sdu))
    }

    pub fn iso_sent(&self, channel: ChannelId) {
        self.with_state(|state| state.iso_sent(channel))
    }

    pub fn send(&self, key: AseKey, sdu: Bytes, seq_num: u16, timestamp: Option<u32>) -> Result<(), Error> {
        self.with_state(|state| state.send(key, sdu, seq_num, timestamp))
    }

    /// The ACL link `conn` is gone. All of its ASEs are returned to Idle before this returns.
    pub fn acl_disconnected(&self, conn: u16, reason: HciReason) {
        debug!("ACL 0x{:04X} disconnected ({:?})", conn, reason);
        self.with_state(|state| state.acl_disconnected(conn, reason))
    }

    /// Configures an unused ASE on behalf of the server.
    pub fn config_ase<S>(&self, key: AseKey, codec: CodecConfig, pref: QosPref, stream: S) -> Result<(), Error>
    where
        S: StreamOps + 'static
    {
        self.with_state(|state| state.config_ase(key, codec, pref, Box::new(stream)))
    }

    pub fn reconfig(&self, key: AseKey, codec: CodecConfig, pref: QosPref) -> Result<(), Error> {
        self.with_state(|state| state.reconfig(key, codec, pref))
    }

    pub fn metadata(&self, key: AseKey, metadata: Bytes) -> Result<(), Error> {
        self.with_state(|state| state.update_metadata(key, metadata))
    }

    pub fn start(&self, key: AseKey) -> Result<(), Error> {
        self.with_state(|state| state.start(key))
    }

    pub fn disable(&self, key: AseKey) -> Result<(), Error> {
        self.with_state(|state| state.disable(key))
    }

    pub fn release(&self, key: AseKey) -> Result<(), Error> {
        self.with_state(|state| state.release(key))
    }

    /// Runs all queued work that is due now. Returns the number of executed items.
    pub fn process_pending(&self) -> usize {
        self.inner.state.lock().process(Instant::now())
    }

    /// Drives the work queue. Never returns; abort the task to stop it.
    pub async fn run(self) {
        loop {
            let deadline = {
                let mut state = self.inner.state.lock();
                let count = state.process(Instant::now());
                if count > 0 {
                    trace!("Processed {} work items", count);
                }
                state.queue.next_deadline()
            };
            match deadline {
                Some(deadline) => select! {
                    _ = self.inner.wakeup.notified() => {},
                    _ = sleep_until(deadline) => {}
                },
                None => self.inner.wakeup.notified().await
            }
        }
    }
}
