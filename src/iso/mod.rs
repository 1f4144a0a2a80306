use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{trace, warn};

use crate::audio::{AseKey, CodecConfig, Direction};
use crate::log_assert;

/// Connection handle of a CIS.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(pub u16);

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting
}

/// Data direction relative to the local host.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DataDirection {
    /// Controller to host.
    Rx,
    /// Host to controller.
    Tx
}

/// Per direction parameters of a CIS.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct IoQos {
    pub interval: u32,
    pub sdu: u16,
    pub phy: u8,
    pub rtn: u8,
    pub latency: u16
}

/// An endpoint as seen by the binding registry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct IsoEndpoint {
    pub key: AseKey,
    pub dir: Direction,
    /// Client role endpoints mirror the remote server's ASEs, which flips the data direction.
    pub client: bool
}

impl IsoEndpoint {
    pub fn data_dir(&self) -> DataDirection {
        match (self.dir, self.client) {
            (Direction::Sink, false) | (Direction::Source, true) => DataDirection::Rx,
            (Direction::Source, false) | (Direction::Sink, true) => DataDirection::Tx
        }
    }
}

#[derive(Debug, Default)]
pub struct IsoBinding {
    pub acl: u16,
    pub cig_id: u8,
    pub cis_id: u8,
    pub channel: Option<ChannelId>,
    pub state: ChannelState,
    pub rx_qos: IoQos,
    pub tx_qos: IoQos,
    rx: Option<IsoEndpoint>,
    tx: Option<IsoEndpoint>
}

impl IsoBinding {
    pub fn endpoint(&self, dir: DataDirection) -> Option<IsoEndpoint> {
        match dir {
            DataDirection::Rx => self.rx,
            DataDirection::Tx => self.tx
        }
    }

    pub fn endpoints(&self) -> impl Iterator<Item = IsoEndpoint> {
        self.rx.into_iter().chain(self.tx)
    }

    /// The co-located endpoint sharing this (bidirectional) channel with `ep`.
    pub fn paired(&self, ep: &IsoEndpoint) -> Option<IsoEndpoint> {
        self.endpoints().find(|other| other != ep)
    }

    pub fn qos_mut(&mut self, dir: DataDirection) -> &mut IoQos {
        match dir {
            DataDirection::Rx => &mut self.rx_qos,
            DataDirection::Tx => &mut self.tx_qos
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    fn slot_mut(&mut self, dir: DataDirection) -> &mut Option<IsoEndpoint> {
        match dir {
            DataDirection::Rx => &mut self.rx,
            DataDirection::Tx => &mut self.tx
        }
    }
}

#[derive(Default)]
struct Slot {
    refs: AtomicUsize,
    binding: Mutex<IsoBinding>
}

/// Fixed pool of reference counted iso bindings.
#[derive(Clone)]
pub struct IsoPool {
    slots: Arc<[Slot]>
}

impl IsoPool {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| Slot::default()).collect()
        }
    }

    /// Claims a free slot. The returned reference is the only one.
    pub fn alloc(&self) -> Option<IsoRef> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            // Hold the lock across the claim so `find` never observes stale contents.
            let mut binding = slot.binding.lock();
            slot.refs
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .ok()?;
            *binding = IsoBinding::default();
            trace!("Allocated iso binding {}", index);
            Some(IsoRef { slots: self.slots.clone(), index })
        })
    }

    /// Returns a new reference to the first allocated binding matching `predicate`.
    pub fn find<F: FnMut(&IsoBinding) -> bool>(&self, mut predicate: F) -> Option<IsoRef> {
        (0..self.slots.len())
            .filter_map(|index| IsoRef::try_new(&self.slots, index))
            .find(|iso| predicate(&iso.lock()))
    }

    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.refs.load(Ordering::Acquire) > 0)
            .count()
    }
}

/// Counted reference to an allocated binding. The slot returns to the pool when
/// the last reference is dropped.
pub struct IsoRef {
    slots: Arc<[Slot]>,
    index: usize
}

impl IsoRef {
    fn try_new(slots: &Arc<[Slot]>, index: usize) -> Option<Self> {
        let refs = &slots[index].refs;
        let mut current = refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match refs.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(Self { slots: slots.clone(), index }),
                Err(actual) => current = actual
            }
        }
    }

    fn slot(&self) -> &Slot {
        &self.slots[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn refs(&self) -> usize {
        self.slot().refs.load(Ordering::Acquire)
    }

    pub fn lock(&self) -> MutexGuard<'_, IsoBinding> {
        self.slot().binding.lock()
    }

    pub fn same_binding(&self, other: &IsoRef) -> bool {
        Arc::ptr_eq(&self.slots, &other.slots) && self.index == other.index
    }

    /// Installs `ep` into its direction slot and stores a new reference in `holder`.
    ///
    /// Panics if the endpoint is already bound or the slot is taken.
    pub fn bind(&self, ep: IsoEndpoint, holder: &mut Option<IsoRef>) {
        assert!(holder.is_none(), "{} is already bound to an iso binding", ep.key);
        {
            let mut binding = self.lock();
            let slot = binding.slot_mut(ep.data_dir());
            assert!(slot.is_none(), "{:?} slot of iso binding {} is taken by {:?}", ep.data_dir(), self.index, slot);
            *slot = Some(ep);
        }
        trace!("Bound {} to iso binding {} ({:?})", ep.key, self.index, ep.data_dir());
        *holder = Some(self.clone());
    }

    /// Removes `ep` from the binding held in `holder` and drops the reference.
    pub fn unbind(holder: &mut Option<IsoRef>, ep: &IsoEndpoint) {
        let Some(iso) = holder.take() else {
            warn!("{} is not bound to an iso binding", ep.key);
            return;
        };
        {
            let mut binding = iso.lock();
            let slot = binding.slot_mut(ep.data_dir());
            assert_eq!(slot.as_ref(), Some(ep), "endpoint is bound to a different slot");
            *slot = None;
        }
        trace!("Unbound {} from iso binding {}", ep.key, iso.index);
    }
}

impl Clone for IsoRef {
    fn clone(&self) -> Self {
        let prev = self.slot().refs.fetch_add(1, Ordering::AcqRel);
        assert!(prev > 0, "iso binding {} referenced after release", self.index);
        Self { slots: self.slots.clone(), index: self.index }
    }
}

impl Drop for IsoRef {
    fn drop(&mut self) {
        let prev = self.slot().refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "iso binding {} released too often", self.index);
        if prev == 1 {
            if let Some(binding) = self.slot().binding.try_lock() {
                log_assert!(binding.rx.is_none() && binding.tx.is_none());
            }
            trace!("Released iso binding {}", self.index);
        }
    }
}

impl std::fmt::Debug for IsoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoRef")
            .field("index", &self.index)
            .field("refs", &self.refs())
            .finish()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
pub enum TransportError {
    #[error("The channel is not connected")]
    NotConnected,
    #[error("No buffers available")]
    NoBuffers,
    #[error("Invalid parameters")]
    InvalidParameters,
    #[error("Controller error 0x{0:02X}")]
    Controller(u8)
}

/// Metadata of a received SDU.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct RecvInfo {
    pub seq_num: u16,
    pub timestamp: Option<u32>,
    pub valid: bool
}

/// The isochronous link layer below ASCS. Channel lifetime belongs to the
/// implementation; ASCS only requests teardown.
pub trait IsoTransport: Send {
    fn disconnect(&mut self, channel: ChannelId) -> Result<(), TransportError>;

    fn setup_data_path(&mut self, channel: ChannelId, dir: DataDirection, codec: &CodecConfig) -> Result<(), TransportError>;

    fn send(&mut self, channel: ChannelId, sdu: Bytes, seq_num: u16, timestamp: Option<u32>) -> Result<(), TransportError>;
}
