use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::ascs::control_point::metadata_rsp;
use crate::ascs::endpoint::{AseState, Endpoint, Followup};
use crate::ascs::error::Error;
use crate::ascs::handler::{AscsHandler, StreamOps};
use crate::ascs::packets::ControlPointResponse;
use crate::ascs::pool::{AseHandle, AsePool};
use crate::ascs::qos::QosPref;
use crate::ascs::AscsConfig;
use crate::audio::ltv::validate_metadata;
use crate::audio::{AseKey, CodecConfig, Direction, HciReason};
use crate::ensure;
use crate::gatt::{Characteristic, GattServer, NotifyError};
use crate::iso::{ChannelId, ChannelState, DataDirection, IoQos, IsoPool, IsoRef, IsoTransport, RecvInfo};
use crate::utils::LoggableResult;

/// Connection interval unit in microseconds.
const INTERVAL_UNIT_US: u64 = 1250;
/// Codec configuration and metadata are preceded by a one byte length in the ASE status.
const MAX_LTV_LEN: usize = u8::MAX as usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Work {
    Commit(AseHandle),
    Disconnect(AseHandle)
}

impl Work {
    fn handle(&self) -> AseHandle {
        match self {
            Work::Commit(handle) | Work::Disconnect(handle) => *handle
        }
    }
}

/// Deferred work, either ready or ordered by deadline.
#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    ready: VecDeque<Work>,
    delayed: Vec<(Instant, Work)>
}

impl WorkQueue {
    pub fn schedule(&mut self, work: Work, delay: Duration) {
        if delay.is_zero() {
            self.ready.push_back(work);
        } else {
            let deadline = Instant::now() + delay;
            let index = self.delayed.partition_point(|(other, _)| *other <= deadline);
            self.delayed.insert(index, (deadline, work));
        }
    }

    pub fn cancel(&mut self, handle: AseHandle) {
        self.ready.retain(|work| work.handle() != handle);
        self.delayed.retain(|(_, work)| work.handle() != handle);
    }

    pub fn cancel_disconnect(&mut self, handle: AseHandle) -> bool {
        let len = self.delayed.len();
        self.delayed.retain(|(_, work)| *work != Work::Disconnect(handle));
        len != self.delayed.len()
    }

    pub fn pop(&mut self, now: Instant) -> Option<Work> {
        if let Some(work) = self.ready.pop_front() {
            return Some(work);
        }
        match self.delayed.first() {
            Some((deadline, _)) if *deadline <= now => Some(self.delayed.remove(0).1),
            _ => None
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.ready.is_empty() {
            true => self.delayed.first().map(|(deadline, _)| *deadline),
            false => Some(Instant::now())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty()
    }
}

pub(crate) struct AscsState {
    pub config: AscsConfig,
    pub pool: AsePool,
    pub iso: IsoPool,
    pub queue: WorkQueue,
    pub gatt: Box<dyn GattServer>,
    pub transport: Box<dyn IsoTransport>,
    pub handler: Box<dyn AscsHandler>,
    pub scratch: BytesMut
}

impl AscsState {
    pub fn new(config: AscsConfig, gatt: Box<dyn GattServer>, transport: Box<dyn IsoTransport>, handler: Box<dyn AscsHandler>) -> Self {
        Self {
            pool: AsePool::new(config.max_ases),
            iso: IsoPool::new(config.max_iso),
            queue: WorkQueue::default(),
            scratch: BytesMut::with_capacity(64),
            config,
            gatt,
            transport,
            handler
        }
    }

    /// Queues a transition of `handle` to `new`. Only the commit task changes the committed state.
    pub fn request_state(&mut self, handle: AseHandle, new: AseState) {
        let Some(ep) = self.pool.get_mut(handle) else {
            warn!("Transition to {:?} requested for a freed ASE", new);
            return;
        };
        if ep.push_state(new) {
            self.queue.schedule(Work::Commit(handle), Duration::ZERO);
        }
    }

    /// Runs all work that is due. Returns the number of executed items.
    pub fn process(&mut self, now: Instant) -> usize {
        let mut count = 0;
        while let Some(work) = self.queue.pop(now) {
            trace!("Running {:?}", work);
            match work {
                Work::Commit(handle) => self.commit(handle),
                Work::Disconnect(handle) => self.disconnect_stream(handle)
            }
            count += 1;
        }
        count
    }

    fn commit(&mut self, handle: AseHandle) {
        let Some(ep) = self.pool.get_mut(handle) else {
            trace!("Dropping commit for a freed ASE");
            return;
        };
        let Some(&new) = ep.pending.front() else {
            ep.commit_scheduled = false;
            return;
        };
        let old = std::mem::replace(&mut ep.state, new);
        let key = ep.key;

        match self.notify_status(handle) {
            Ok(()) => {}
            Err(NotifyError::NoBuffers) => {
                if let Some(ep) = self.pool.get_mut(handle) {
                    ep.state = old;
                }
                let delay = self.retry_delay(key.conn);
                debug!("{}: no buffers for the status notification, retrying in {:?}", key, delay);
                self.queue.schedule(Work::Commit(handle), delay);
                return;
            }
            Err(err) => warn!("{}: failed to notify the ASE status: {}", key, err)
        }

        let Some(ep) = self.pool.get_mut(handle) else {
            return;
        };
        ep.pending.pop_front();
        debug!("{}: {:?} -> {:?}", key, old, new);
        let followup = if old == new && matches!(new, AseState::Enabling | AseState::Streaming) {
            ep.stream.metadata_updated();
            Followup::None
        } else {
            ep.exit(old, new);
            ep.enter(old, new)
        };
        match ep.pending.is_empty() {
            true => ep.commit_scheduled = false,
            false => self.queue.schedule(Work::Commit(handle), Duration::ZERO)
        }

        match followup {
            Followup::None => {}
            Followup::Request(state) => self.request_state(handle, state),
            Followup::ScheduleDisconnect => {
                debug!("{}: disconnecting the stream in {:?}", key, self.config.disconnect_delay);
                self.queue.schedule(Work::Disconnect(handle), self.config.disconnect_delay);
            }
            Followup::Released => self.complete_release(handle),
            Followup::Free => self.free_endpoint(handle)
        }
    }

    fn retry_delay(&self, conn: u16) -> Duration {
        let interval = self.gatt.connection_interval(conn).max(1) as u64;
        Duration::from_micros(interval * INTERVAL_UNIT_US)
    }

    fn notify_status(&mut self, handle: AseHandle) -> Result<(), NotifyError> {
        let ep = self.pool.get(handle).ok_or(NotifyError::NotConnected)?;
        let characteristic = Characteristic::Ase(ep.key.id);
        if !self.gatt.is_subscribed(ep.key.conn, characteristic) {
            trace!("{}: not subscribed to the ASE characteristic", ep.key);
            return Ok(());
        }
        self.scratch.clear();
        ep.write_status(&mut self.scratch);
        // the remainder is available through a long read
        let len = self.scratch.len().min(self.gatt.mtu(ep.key.conn).saturating_sub(3) as usize);
        trace!("{}: notifying {:02X?}", ep.key, &self.scratch[..len]);
        self.gatt.notify(ep.key.conn, characteristic, &self.scratch[..len])
    }

    pub fn notify_response(&mut self, conn: u16, rsp: &ControlPointResponse) {
        if !self.gatt.is_subscribed(conn, Characteristic::ControlPoint) {
            debug!("Not subscribed to the control point, dropping response");
            return;
        }
        let data = rsp.encode();
        trace!("Control point response: {:02X?}", data);
        let _ = self
            .gatt
            .notify(conn, Characteristic::ControlPoint, &data)
            .log_err();
    }

    /// Recycles the slot of an endpoint.
    fn free_endpoint(&mut self, handle: AseHandle) {
        self.queue.cancel(handle);
        if let Some(mut ep) = self.pool.free(handle) {
            if !ep.pending.is_empty() {
                warn!("{}: dropping pending transitions {:?}", ep.key, ep.pending);
            }
            ep.unbind_iso();
            debug!("{}: released", ep.key);
        }
    }

    fn complete_release(&mut self, handle: AseHandle) {
        let target = match self.config.cache_codec_on_release {
            true => AseState::CodecConfigured,
            false => AseState::Idle
        };
        self.request_state(handle, target);
    }

    fn disconnect_stream(&mut self, handle: AseHandle) {
        let Some(ep) = self.pool.get(handle) else {
            return;
        };
        if ep.effective_state() != AseState::Releasing {
            debug!("{}: no longer releasing, not disconnecting", ep.key);
            return;
        }
        let Some(iso) = ep.iso().cloned() else {
            self.complete_release(handle);
            return;
        };
        let (channel, state, paired) = {
            let binding = iso.lock();
            (binding.channel, binding.state, binding.paired(&ep.iso_endpoint()))
        };
        let paired_streaming = paired
            .and_then(|paired| self.pool.find(paired.key))
            .and_then(|paired| self.pool.get(paired))
            .is_some_and(|paired| paired.state == AseState::Streaming);
        if paired_streaming {
            debug!("{}: the paired stream is still streaming, keeping the channel", ep.key);
            self.complete_release(handle);
            return;
        }
        match (state, channel) {
            (ChannelState::Disconnecting, _) => trace!("{}: channel is already disconnecting", ep.key),
            (ChannelState::Connected | ChannelState::Connecting, Some(channel)) => {
                let key = ep.key;
                match self.transport.disconnect(channel) {
                    Ok(()) => {
                        debug!("{}: disconnecting {:?}", key, channel);
                        iso.lock().state = ChannelState::Disconnecting;
                    }
                    Err(err) => {
                        warn!("{}: failed to disconnect {:?}: {}", key, channel, err);
                        self.complete_release(handle);
                    }
                }
            }
            _ => self.complete_release(handle)
        }
    }

    pub fn direction(&self, id: u8) -> Option<Direction> {
        let sinks = self.config.sink_count;
        let sources = self.config.source_count;
        match id {
            0 => None,
            id if id <= sinks => Some(Direction::Sink),
            id if (id as u16) <= sinks as u16 + sources as u16 => Some(Direction::Source),
            _ => None
        }
    }

    fn lookup(&self, key: AseKey) -> Result<AseHandle, Error> {
        ensure!(self.direction(key.id).is_some(), Error::InvalidAseId);
        self.pool.find(key).ok_or(Error::UnknownAse)
    }

    fn find_by_channel(&self, channel: ChannelId) -> Result<IsoRef, Error> {
        self.iso
            .find(|binding| binding.channel == Some(channel))
            .ok_or_else(|| {
                error!("No iso binding for {:?}", channel);
                Error::UnknownChannel
            })
    }

    /// A central requested a CIS. Returns `true` if some ASE expects it.
    pub fn iso_accept(&mut self, acl: u16, cig_id: u8, cis_id: u8, channel: ChannelId) -> bool {
        let iso = self
            .pool
            .handles_for(acl)
            .into_iter()
            .filter_map(|handle| self.pool.get(handle))
            .filter(|ep| ep.cig_id == cig_id && ep.cis_id == cis_id)
            .filter(|ep| matches!(ep.effective_state(), AseState::Enabling | AseState::QosConfigured))
            .find_map(|ep| ep.iso().cloned());
        match iso {
            Some(iso) => {
                let mut binding = iso.lock();
                binding.channel = Some(channel);
                binding.state = ChannelState::Connecting;
                debug!("Accepted {:?} for CIG {} CIS {}", channel, cig_id, cis_id);
                true
            }
            None => {
                warn!("Rejecting {:?}: no ASE for CIG {} CIS {} on 0x{:04X}", channel, cig_id, cis_id, acl);
                false
            }
        }
    }

    pub fn iso_connected(&mut self, channel: ChannelId) -> Result<(), Error> {
        let iso = self.find_by_channel(channel)?;
        let endpoints: Vec<_> = {
            let mut binding = iso.lock();
            binding.state = ChannelState::Connected;
            binding.endpoints().collect()
        };
        for iso_ep in endpoints {
            let Some(handle) = self.pool.find(iso_ep.key) else {
                continue;
            };
            let Some(ep) = self.pool.get_mut(handle) else {
                continue;
            };
            if ep.effective_state() != AseState::Enabling {
                debug!("{}: channel connected in {:?}", ep.key, ep.effective_state());
                continue;
            }
            ep.reason = HciReason::SUCCESS;
            ep.link_loss = false;
            *iso.lock().qos_mut(iso_ep.data_dir()) = IoQos {
                interval: ep.qos.interval,
                sdu: ep.qos.sdu,
                phy: ep.qos.phy,
                rtn: ep.qos.rtn,
                latency: ep.qos.latency
            };
            if let Err(err) = self.transport.setup_data_path(channel, iso_ep.data_dir(), &ep.codec) {
                warn!("{}: failed to set up the data path: {}", ep.key, err);
            }
            ep.stream.connected();
            // source ASEs wait for Receiver Start Ready
            if ep.dir == Direction::Sink && ep.receiver_ready {
                self.request_state(handle, AseState::Streaming);
            }
        }
        Ok(())
    }

    pub fn iso_disconnected(&mut self, channel: ChannelId, reason: HciReason) -> Result<(), Error> {
        let iso = self.find_by_channel(channel)?;
        let endpoints: Vec<_> = {
            let mut binding = iso.lock();
            binding.state = ChannelState::Disconnected;
            binding.channel = None;
            binding.endpoints().collect()
        };
        for iso_ep in endpoints {
            let Some(handle) = self.pool.find(iso_ep.key) else {
                continue;
            };
            self.queue.cancel_disconnect(handle);
            let Some(ep) = self.pool.get_mut(handle) else {
                continue;
            };
            ep.stream.disconnected(reason);
            ep.reason = reason;
            match ep.effective_state() {
                AseState::Releasing => self.complete_release(handle),
                AseState::Streaming | AseState::Disabling => {
                    debug!("{}: unexpected link loss ({:?})", ep.key, reason);
                    ep.link_loss = true;
                    self.request_state(handle, AseState::QosConfigured);
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn iso_recv(&mut self, channel: ChannelId, info: &RecvInfo, sdu: Bytes) {
        let Ok(handle) = self.channel_endpoint(channel, DataDirection::Rx) else {
            return;
        };
        if let Some(ep) = self.pool.get_mut(handle) {
            match ep.state {
                AseState::Streaming => ep.stream.recv(info, sdu),
                state => trace!("{}: dropping SDU received in {:?}", ep.key, state)
            }
        }
    }

    pub fn iso_sent(&mut self, channel: ChannelId) {
        let Ok(handle) = self.channel_endpoint(channel, DataDirection::Tx) else {
            return;
        };
        if let Some(ep) = self.pool.get_mut(handle) {
            ep.stream.sent();
        }
    }

    fn channel_endpoint(&self, channel: ChannelId, dir: DataDirection) -> Result<AseHandle, Error> {
        let iso = self.find_by_channel(channel)?;
        let ep = iso.lock().endpoint(dir).ok_or(Error::UnknownAse)?;
        self.pool.find(ep.key).ok_or(Error::UnknownAse)
    }

    pub fn send(&mut self, key: AseKey, sdu: Bytes, seq_num: u16, timestamp: Option<u32>) -> Result<(), Error> {
        let handle = self.lookup(key)?;
        let ep = self.pool.get(handle).ok_or(Error::UnknownAse)?;
        ensure!(ep.state == AseState::Streaming, Error::InvalidState(ep.state));
        ensure!(ep.iso_endpoint().data_dir() == DataDirection::Tx, Error::InvalidDirection);
        let channel = {
            let binding = ep.iso().ok_or(Error::NotConnected)?.lock();
            ensure!(binding.is_connected(), Error::NotConnected);
            binding.channel.ok_or(Error::NotConnected)?
        };
        self.transport.send(channel, sdu, seq_num, timestamp)?;
        Ok(())
    }

    /// Tears down every endpoint of `conn` immediately.
    pub fn acl_disconnected(&mut self, conn: u16, reason: HciReason) {
        for handle in self.pool.handles_for(conn) {
            self.queue.cancel(handle);
            if let Some(ep) = self.pool.get_mut(handle) {
                ep.pending.clear();
                ep.commit_scheduled = false;
                ep.reason = reason;
                let old = std::mem::replace(&mut ep.state, AseState::Idle);
                debug!("{}: forced {:?} -> Idle", ep.key, old);
                ep.exit(old, AseState::Idle);
                let followup = ep.enter(old, AseState::Idle);
                debug_assert_eq!(followup, Followup::Free);
            }
            self.free_endpoint(handle);
        }
    }

    pub fn config_ase(&mut self, key: AseKey, codec: CodecConfig, pref: QosPref, stream: Box<dyn StreamOps>) -> Result<(), Error> {
        let dir = self.direction(key.id).ok_or(Error::InvalidAseId)?;
        ensure!(codec.data.len() <= MAX_LTV_LEN, Error::InvalidLength);
        if let Some(handle) = self.pool.find(key) {
            let state = self.pool.get(handle).map(Endpoint::effective_state).unwrap_or_default();
            return Err(Error::InvalidState(state));
        }
        let mut ep = Endpoint::new(key, dir, stream);
        ep.codec = codec;
        ep.qos_pref = pref;
        let handle = self.pool.alloc(ep).ok_or(Error::NoMemory)?;
        self.request_state(handle, AseState::CodecConfigured);
        Ok(())
    }

    pub fn reconfig(&mut self, key: AseKey, codec: CodecConfig, pref: QosPref) -> Result<(), Error> {
        ensure!(codec.data.len() <= MAX_LTV_LEN, Error::InvalidLength);
        let handle = self.lookup(key)?;
        let ep = self.pool.get_mut(handle).ok_or(Error::UnknownAse)?;
        let state = ep.effective_state();
        ensure!(matches!(state, AseState::CodecConfigured | AseState::QosConfigured), Error::InvalidState(state));
        ep.codec = codec;
        ep.qos_pref = pref;
        self.request_state(handle, AseState::CodecConfigured);
        Ok(())
    }

    pub fn update_metadata(&mut self, key: AseKey, metadata: Bytes) -> Result<(), Error> {
        ensure!(metadata.len() <= MAX_LTV_LEN, Error::InvalidLength);
        let handle = self.lookup(key)?;
        let available = self.handler.available_contexts(key.conn, self.direction(key.id).ok_or(Error::InvalidAseId)?);
        let ep = self.pool.get_mut(handle).ok_or(Error::UnknownAse)?;
        let state = ep.effective_state();
        ensure!(matches!(state, AseState::Enabling | AseState::Streaming), Error::InvalidState(state));
        validate_metadata(&metadata, ep.dir, available).map_err(metadata_rsp)?;
        ep.metadata = metadata;
        self.request_state(handle, state);
        Ok(())
    }

    /// Receiver Start Ready issued by the server for one of its sink ASEs.
    pub fn start(&mut self, key: AseKey) -> Result<(), Error> {
        let handle = self.lookup(key)?;
        let ep = self.pool.get_mut(handle).ok_or(Error::UnknownAse)?;
        ensure!(ep.dir == Direction::Sink, Error::InvalidDirection);
        let state = ep.effective_state();
        ensure!(state == AseState::Enabling, Error::InvalidState(state));
        ep.receiver_ready = true;
        if ep.iso_state() == ChannelState::Connected {
            self.request_state(handle, AseState::Streaming);
        } else {
            debug!("{}: receiver ready, waiting for the channel", key);
        }
        Ok(())
    }

    pub fn disable(&mut self, key: AseKey) -> Result<(), Error> {
        let handle = self.lookup(key)?;
        let ep = self.pool.get(handle).ok_or(Error::UnknownAse)?;
        let state = ep.effective_state();
        ensure!(matches!(state, AseState::Enabling | AseState::Streaming), Error::InvalidState(state));
        let target = match ep.dir {
            Direction::Sink => AseState::QosConfigured,
            Direction::Source => AseState::Disabling
        };
        self.request_state(handle, target);
        Ok(())
    }

    pub fn release(&mut self, key: AseKey) -> Result<(), Error> {
        let handle = self.lookup(key)?;
        let ep = self.pool.get(handle).ok_or(Error::UnknownAse)?;
        let state = ep.effective_state();
        ensure!(!matches!(state, AseState::Idle | AseState::Releasing), Error::InvalidState(state));
        self.request_state(handle, AseState::Releasing);
        Ok(())
    }

    pub fn read_status(&mut self, conn: u16, id: u8) -> Option<Bytes> {
        self.direction(id)?;
        self.scratch.clear();
        match self.pool.find(AseKey::new(conn, id)).and_then(|handle| self.pool.get(handle)) {
            Some(ep) => ep.write_status(&mut self.scratch),
            None => Endpoint::write_idle_status(id, &mut self.scratch)
        }
        Some(Bytes::copy_from_slice(&self.scratch))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::ascs::pool::AsePool;
    use crate::ascs::endpoint::Endpoint;
    use crate::ascs::handler::NoopStream;
    use crate::ascs::server::{Work, WorkQueue};
    use crate::audio::{AseKey, Direction};

    #[tokio::test(start_paused = true)]
    async fn test_work_queue_ordering() {
        let mut pool = AsePool::new(2);
        let a = pool.alloc(Endpoint::new(AseKey::new(1, 1), Direction::Sink, Box::new(NoopStream))).unwrap();
        let b = pool.alloc(Endpoint::new(AseKey::new(1, 2), Direction::Sink, Box::new(NoopStream))).unwrap();

        let mut queue = WorkQueue::default();
        queue.schedule(Work::Disconnect(a), Duration::from_millis(20));
        queue.schedule(Work::Commit(b), Duration::from_millis(10));
        queue.schedule(Work::Commit(a), Duration::ZERO);
        assert_eq!(queue.pop(Instant::now()), Some(Work::Commit(a)));
        assert_eq!(queue.pop(Instant::now()), None);
        assert_eq!(queue.next_deadline(), Some(Instant::now() + Duration::from_millis(10)));

        tokio::time::advance(Duration::from_millis(25)).await;
        assert_eq!(queue.pop(Instant::now()), Some(Work::Commit(b)));
        assert!(queue.cancel_disconnect(a));
        assert!(queue.is_empty());

        queue.schedule(Work::Commit(a), Duration::ZERO);
        queue.schedule(Work::Commit(b), Duration::from_millis(5));
        queue.cancel(a);
        assert_eq!(queue.next_deadline(), Some(Instant::now() + Duration::from_millis(5)));
    }
}
