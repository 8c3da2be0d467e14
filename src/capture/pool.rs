//! Announced frame buffers of one acquisition.
//!
//! A buffer is either queued to the camera (ready to be filled) or lent
//! out inside a [`Frame`](super::Frame). Only queued buffers are filled,
//! and a buffer comes back only once, so a frame still on its way to a
//! client is never overwritten.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{BufferTag, CameraError};

/// Acquisition ids are unique across every camera instance in the process,
/// so a buffer from a closed camera never matches a reopened one.
static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
pub(crate) struct BufferPool {
    session: u64,
    /// `Some` while the buffer is queued to the camera, `None` while lent out.
    slots: Vec<Option<Vec<u8>>>,
    /// Queued slots in the order they will be filled.
    ready: VecDeque<usize>,
}

impl BufferPool {
    /// Replaces all buffers with `count` fresh ones of `size` bytes, all
    /// queued, under a new acquisition id which is returned.
    pub(crate) fn announce(&mut self, count: usize, size: usize) -> u64 {
        self.session = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        self.slots = (0..count).map(|_| Some(vec![0u8; size])).collect();
        self.ready = (0..count).collect();
        self.session
    }

    /// Takes the next queued buffer for filling.
    pub(crate) fn take(&mut self) -> Option<(BufferTag, Vec<u8>)> {
        let session = self.session;
        while let Some(slot) = self.ready.pop_front() {
            if let Some(data) = self.slots.get_mut(slot).and_then(Option::take) {
                return Some((BufferTag { session, slot }, data));
            }
        }
        None
    }

    /// Queues a lent-out buffer again. Buffers of other sessions, unknown
    /// slots and buffers that are already queued are refused.
    pub(crate) fn give_back(&mut self, tag: BufferTag, data: Vec<u8>) -> Result<(), CameraError> {
        let lent = tag.session == self.session
            && self.slots.get(tag.slot).is_some_and(|s| s.is_none());
        if !lent {
            return Err(CameraError::ForeignBuffer {
                session: tag.session,
                slot: tag.slot,
            });
        }
        self.slots[tag.slot] = Some(data);
        self.ready.push_back(tag.slot);
        Ok(())
    }

    /// Revokes every buffer. Frames still lent out become foreign.
    pub(crate) fn revoke(&mut self) {
        self.slots.clear();
        self.ready.clear();
    }

    pub(crate) fn session(&self) -> u64 {
        self.session
    }

    pub(crate) fn queued(&self) -> usize {
        self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lent_buffer_is_not_handed_out_twice() {
        let mut pool = BufferPool::default();
        let session = pool.announce(2, 4);
        let (a, data_a) = pool.take().unwrap();
        let (b, _data_b) = pool.take().unwrap();
        assert_ne!(a.slot, b.slot);
        assert_eq!(a.session, session);
        assert!(pool.take().is_none());

        pool.give_back(a, data_a).unwrap();
        assert_eq!(pool.queued(), 1);
        let (again, data) = pool.take().unwrap();
        assert_eq!(again, a);

        // Returning the same buffer twice is refused.
        pool.give_back(again, data.clone()).unwrap();
        assert!(pool.give_back(again, data).is_err());
    }

    #[test]
    fn test_revoked_buffers_are_foreign() {
        let mut pool = BufferPool::default();
        let first = pool.announce(1, 8);
        let (tag, data) = pool.take().unwrap();
        pool.revoke();
        assert!(matches!(
            pool.give_back(tag, data.clone()),
            Err(CameraError::ForeignBuffer { slot: 0, .. })
        ));

        let second = pool.announce(1, 8);
        assert_ne!(first, second);
        assert!(pool.give_back(tag, data).is_err());
        assert_eq!(pool.session(), second);
    }

    #[test]
    fn test_separate_pools_never_share_ids() {
        // Two pools stand for a camera before and after it was reopened.
        let mut closed = BufferPool::default();
        let mut reopened = BufferPool::default();
        closed.announce(1, 8);
        reopened.announce(1, 8);
        let (stale, stale_data) = closed.take().unwrap();
        let (fresh, fresh_data) = reopened.take().unwrap();
        assert_eq!(stale.slot, fresh.slot);
        assert_ne!(stale.session, fresh.session);

        assert!(reopened.give_back(stale, stale_data).is_err());
        reopened.give_back(fresh, fresh_data).unwrap();
    }
}
