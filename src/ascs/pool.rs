use tracing::trace;

use crate::ascs::endpoint::Endpoint;
use crate::audio::AseKey;

/// Generation checked index into the [`AsePool`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct AseHandle {
    index: usize,
    generation: u32
}

#[derive(Default)]
struct Slot {
    generation: u32,
    endpoint: Option<Endpoint>
}

/// Fixed capacity storage for the endpoints of all connections.
pub struct AsePool {
    slots: Vec<Slot>
}

impl AsePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect()
        }
    }

    pub fn has_free(&self) -> bool {
        self.slots.iter().any(|slot| slot.endpoint.is_none())
    }

    pub fn alloc(&mut self, endpoint: Endpoint) -> Option<AseHandle> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.endpoint.is_none())?;
        trace!("Allocated ASE slot {} for {}", index, endpoint.key);
        slot.endpoint = Some(endpoint);
        Some(AseHandle {
            index,
            generation: slot.generation
        })
    }

    pub fn get(&self, handle: AseHandle) -> Option<&Endpoint> {
        self.slots
            .get(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.endpoint.as_ref())
    }

    pub fn get_mut(&mut self, handle: AseHandle) -> Option<&mut Endpoint> {
        self.slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.endpoint.as_mut())
    }

    pub fn find(&self, key: AseKey) -> Option<AseHandle> {
        self.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.endpoint
                .as_ref()
                .filter(|ep| ep.key == key)
                .map(|_| AseHandle {
                    index,
                    generation: slot.generation
                })
        })
    }

    pub fn handles_for(&self, conn: u16) -> Vec<AseHandle> {
        self.handles()
            .filter(|handle| self.get(*handle).is_some_and(|ep| ep.key.conn == conn))
            .collect()
    }

    pub fn handles(&self) -> impl Iterator<Item = AseHandle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.endpoint.is_some())
            .map(|(index, slot)| AseHandle {
                index,
                generation: slot.generation
            })
    }

    /// Removes the endpoint and invalidates all outstanding handles to it.
    pub fn free(&mut self, handle: AseHandle) -> Option<Endpoint> {
        let slot = self
            .slots
            .get_mut(handle.index)
            .filter(|slot| slot.generation == handle.generation)?;
        let endpoint = slot.endpoint.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        trace!("Freed ASE slot {} ({})", handle.index, endpoint.key);
        Some(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use crate::ascs::endpoint::Endpoint;
    use crate::ascs::handler::NoopStream;
    use crate::ascs::pool::AsePool;
    use crate::audio::{AseKey, Direction};

    fn endpoint(conn: u16, id: u8) -> Endpoint {
        Endpoint::new(AseKey::new(conn, id), Direction::Sink, Box::new(NoopStream))
    }

    #[test]
    fn test_stale_handles() {
        let mut pool = AsePool::new(2);
        let a = pool.alloc(endpoint(0x40, 1)).unwrap();
        let b = pool.alloc(endpoint(0x41, 1)).unwrap();
        assert!(!pool.has_free());
        assert!(pool.alloc(endpoint(0x40, 2)).is_none());

        assert_eq!(pool.find(AseKey::new(0x41, 1)), Some(b));
        assert_eq!(pool.handles_for(0x40), vec![a]);

        assert!(pool.free(a).is_some());
        assert!(pool.get(a).is_none());
        assert!(pool.free(a).is_none());

        let c = pool.alloc(endpoint(0x40, 2)).unwrap();
        assert_ne!(a, c);
        assert!(pool.get(a).is_none());
        assert_eq!(pool.get(c).map(|ep| ep.key), Some(AseKey::new(0x40, 2)));
    }
}
