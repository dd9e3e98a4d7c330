// SPDX-FileCopyrightText: 2025 Contributors to the vsink project.
// SPDX-License-Identifier: Apache-2.0

//! Fixed-size pool of frame buffers shared between the producer, the
//! delivery channel and off-thread release callbacks.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, Weak,
        mpsc::{self, Receiver, Sender},
    },
    time::{Duration, Instant},
};

use tracing::{debug, error, trace, warn};

use super::{
    format::fourcc_name,
    mapping::PlaneMapping,
    semaphore::{Acquire, Semaphore},
    slot::{BufferSlot, SlotDescriptor, SlotRef},
    strategy::{BufferStrategy, ExternalBuffer},
};
use crate::{Error, Result};

/// A CPU mapping of one slot plane, with the row stride needed to write it.
#[derive(Debug)]
pub struct MappedPlane {
    pub stride: u32,
    pub map: PlaneMapping,
}

/// Fixed set of buffer slots with free-slot accounting.
///
/// A slot moves through three states:
///
/// - *free*: counted by the pool semaphore;
/// - *acquired*: handed to the producer by [`BufferPool::acquire`], which
///   takes one unit from the semaphore but does not lock the slot;
/// - *locked*: referenced by the consumer. The lock is counted, so a slot
///   sent twice needs two releases. [`BufferPool::complete`] unlocks and,
///   when the count reaches zero, puts the slot back.
///
/// The pool is cheaply cloneable; clones share the same slots.
///
/// # Examples
///
/// ```
/// use vsink::buffer::{BufferPool, DumbAllocator, MemfdDevice, format::DRM_FORMAT_XRGB8888};
///
/// # fn main() -> Result<(), vsink::Error> {
/// let pool = BufferPool::new(Box::new(DumbAllocator::new(MemfdDevice::new())), 2)?;
///
/// let slot = pool.acquire(64, 64, DRM_FORMAT_XRGB8888)?;
/// pool.lock(slot)?;
/// assert_eq!(pool.available(), 1);
///
/// // consumer released it
/// assert!(pool.complete(slot)?);
/// assert_eq!(pool.available(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    free: Semaphore,
    release_tx: Sender<SlotRef>,
}

struct PoolState {
    slots: Vec<BufferSlot>,
    strategy: Box<dyn BufferStrategy>,
    releases: Receiver<SlotRef>,
    next: usize,
}

impl BufferPool {
    /// Creates a pool of `size` empty slots backed by `strategy`.
    ///
    /// Storage is allocated lazily on the first acquire of each slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArg`] if `size` is zero.
    pub fn new(strategy: Box<dyn BufferStrategy>, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArg("pool size must be at least 1".into()));
        }
        let (release_tx, releases) = mpsc::channel();
        debug!("Created {} pool with {} slots", strategy.name(), size);
        Ok(Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    slots: (0..size).map(BufferSlot::new).collect(),
                    strategy,
                    releases,
                    next: 0,
                }),
                free: Semaphore::new(size),
                release_tx,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn size(&self) -> usize {
        self.state().slots.len()
    }

    /// True when the backing strategy allocates storage itself.
    pub fn is_local(&self) -> bool {
        self.state().strategy.is_local()
    }

    /// Number of free slots.
    pub fn available(&self) -> usize {
        self.inner.free.available()
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.free.is_flushing()
    }

    /// Acquires a slot sized for a `width`x`height` frame of `format`,
    /// blocking until one is free.
    ///
    /// With a local strategy the slot's storage is (re)allocated when its
    /// geometry differs from the request. The slot is not locked.
    ///
    /// # Errors
    ///
    /// - [`Error::Flushing`] if the pool is set flushing while waiting
    /// - [`Error::AllocationFailed`] if storage cannot be allocated; the slot
    ///   stays free and the free count is restored
    pub fn acquire(&self, width: u32, height: u32, format: u32) -> Result<SlotRef> {
        self.acquire_until(width, height, format, None)?
            .ok_or_else(|| Error::Other("untimed acquire returned without a slot".into()))
    }

    /// Like [`Self::acquire`] but gives up after `timeout`, returning
    /// `Ok(None)`.
    pub fn try_acquire_for(
        &self,
        width: u32,
        height: u32,
        format: u32,
        timeout: Duration,
    ) -> Result<Option<SlotRef>> {
        self.acquire_until(width, height, format, Some(Instant::now() + timeout))
    }

    fn acquire_until(
        &self,
        width: u32,
        height: u32,
        format: u32,
        deadline: Option<Instant>,
    ) -> Result<Option<SlotRef>> {
        loop {
            self.drain_releases();
            match self.inner.free.acquire_until(deadline)? {
                Acquire::Acquired => return self.take_slot(width, height, format).map(Some),
                Acquire::Nudged => continue,
                Acquire::TimedOut => return Ok(None),
            }
        }
    }

    /// Picks a free slot after a unit was taken from the semaphore.
    fn take_slot(&self, width: u32, height: u32, format: u32) -> Result<SlotRef> {
        let mut state = self.state();
        let count = state.slots.len();
        let start = state.next;
        let free = (0..count)
            .map(|i| (start + i) % count)
            .find(|&i| !state.slots[i].acquired && !state.slots[i].locked);
        let Some(index) = free else {
            drop(state);
            self.inner.free.post();
            return Err(Error::InvalidState(
                "free count out of sync with slot states".into(),
            ));
        };
        state.next = (index + 1) % count;

        let PoolState {
            slots, strategy, ..
        } = &mut *state;
        let slot = &mut slots[index];

        if let Some(storage) = slot
            .storage
            .take_if(|s| s.is_imported() || !s.matches(width, height, format))
        {
            debug!(
                "Slot {} reallocating {}x{} -> {}x{} {}",
                index,
                storage.width,
                storage.height,
                width,
                height,
                fourcc_name(format)
            );
            strategy.free(storage);
        }

        if slot.storage.is_none() && strategy.is_local() {
            match strategy.allocate(width, height, format) {
                Ok(storage) => slot.storage = Some(storage),
                Err(err) => {
                    self.inner.free.post();
                    return Err(err);
                }
            }
        }

        slot.acquired = true;
        trace!("Acquired slot {}", index);
        Ok(slot.slot_ref())
    }

    /// Adds one consumer reference to `slot`.
    pub fn lock(&self, slot: SlotRef) -> Result<()> {
        let mut state = self.state();
        let slot = slot_mut(&mut state.slots, slot)?;
        slot.lock_count += 1;
        slot.locked = true;
        Ok(())
    }

    /// Drops one consumer reference. Returns true exactly when the count
    /// reached zero; unlocking an unlocked slot is ignored.
    pub fn unlock(&self, slot: SlotRef) -> Result<bool> {
        let mut state = self.state();
        Ok(unlock_slot(slot_mut(&mut state.slots, slot)?))
    }

    /// Returns an acquired, unlocked slot to the pool.
    ///
    /// Imported storage is dropped (releasing the upstream buffer); local
    /// storage is kept for reuse. Returns false, without posting the free
    /// count, if the slot was not acquired or is still locked.
    pub fn release(&self, slot: SlotRef) -> Result<bool> {
        let mut state = self.state();
        let released = release_slot(&mut state, slot)?;
        drop(state);
        if released {
            self.inner.free.post();
        }
        Ok(released)
    }

    /// Unlocks `slot` and releases it if that dropped the last reference.
    /// Returns whether the slot went back to the pool.
    pub fn complete(&self, slot: SlotRef) -> Result<bool> {
        let mut state = self.state();
        let released = complete_slot(&mut state, slot)?;
        drop(state);
        if released {
            self.inner.free.post();
        }
        Ok(released)
    }

    /// Returns a handle that completes slots from any thread.
    pub fn release_handle(&self) -> ReleaseHandle {
        ReleaseHandle {
            tx: self.inner.release_tx.clone(),
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Completes every slot queued through a [`ReleaseHandle`]. Returns the
    /// number of slots that went back to the pool.
    pub fn drain_releases(&self) -> usize {
        let mut state = self.state();
        let queued: Vec<SlotRef> = state.releases.try_iter().collect();
        let mut released = 0;
        for slot in queued {
            match complete_slot(&mut state, slot) {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(err) => warn!("Dropping queued release of slot {}: {}", slot.index, err),
            }
        }
        drop(state);
        for _ in 0..released {
            self.inner.free.post();
        }
        released
    }

    /// Sets or clears flushing. While set, blocked and future acquires fail
    /// with [`Error::Flushing`].
    pub fn set_flushing(&self, flushing: bool) {
        debug!("Pool flushing: {}", flushing);
        self.inner.free.set_flushing(flushing);
    }

    /// Force-releases every slot, dropping all consumer references. Returns
    /// the number of slots that went back to the pool.
    pub fn release_all(&self) -> usize {
        let mut state = self.state();
        let refs: Vec<SlotRef> = state.slots.iter().map(BufferSlot::slot_ref).collect();
        let mut released = 0;
        for slot in refs {
            if let Ok(entry) = slot_mut(&mut state.slots, slot) {
                entry.locked = false;
                entry.lock_count = 0;
            }
            if matches!(release_slot(&mut state, slot), Ok(true)) {
                released += 1;
            }
        }
        // anything still queued refers to slots released above
        let _ = state.releases.try_iter().count();
        drop(state);
        for _ in 0..released {
            self.inner.free.post();
        }
        if released > 0 {
            debug!("Force-released {} slot(s)", released);
        }
        released
    }

    pub fn find_by_buffer_id(&self, buffer_id: u32) -> Option<SlotRef> {
        self.state()
            .slots
            .iter()
            .find(|slot| slot.buffer_id == buffer_id)
            .map(BufferSlot::slot_ref)
    }

    pub fn lock_count(&self, slot: SlotRef) -> Result<u32> {
        let mut state = self.state();
        Ok(slot_mut(&mut state.slots, slot)?.lock_count)
    }

    /// Geometry, plane layout and duplicated descriptors of `slot`, for one
    /// send.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the slot holds no storage.
    pub fn snapshot(&self, slot: SlotRef) -> Result<SlotDescriptor> {
        let mut state = self.state();
        let entry = slot_mut(&mut state.slots, slot)?;
        let storage = entry
            .storage
            .as_ref()
            .ok_or_else(|| Error::InvalidState(format!("slot {} has no storage", slot.index)))?;
        SlotDescriptor::from_storage(slot, storage)
    }

    /// Maps every plane of an acquired, unlocked slot and hands the
    /// mappings to `write`.
    ///
    /// The pool lock is not held while `write` runs.
    pub fn fill<R>(&self, slot: SlotRef, write: impl FnOnce(&mut [MappedPlane]) -> R) -> Result<R> {
        let mut planes = {
            let mut state = self.state();
            let PoolState {
                slots, strategy, ..
            } = &mut *state;
            let entry = writable_slot(slots, slot)?;
            let storage = entry.storage.as_ref().ok_or_else(|| {
                Error::InvalidState(format!("slot {} has no storage", slot.index))
            })?;
            (0..storage.planes.len())
                .map(|plane| {
                    Ok(MappedPlane {
                        stride: storage.planes[plane].stride,
                        map: strategy.map(storage, plane)?,
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        Ok(write(&mut planes))
    }

    /// Wraps an upstream buffer into an acquired, unlocked slot, replacing
    /// whatever storage it held.
    pub fn import(&self, slot: SlotRef, buffer: Arc<dyn ExternalBuffer>) -> Result<()> {
        let mut state = self.state();
        let PoolState {
            slots, strategy, ..
        } = &mut *state;
        let entry = writable_slot(slots, slot)?;
        if let Some(old) = entry.storage.take() {
            strategy.free(old);
        }
        entry.storage = Some(strategy.import(buffer)?);
        Ok(())
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("BufferPool")
            .field("strategy", &state.strategy.name())
            .field("slots", &state.slots)
            .field("available", &self.inner.free.available())
            .finish()
    }
}

impl Drop for PoolState {
    fn drop(&mut self) {
        let locked = self.slots.iter().filter(|slot| slot.locked).count();
        if locked > 0 {
            error!("Dropping pool with {} slot(s) still locked", locked);
        }
        for slot in &mut self.slots {
            if let Some(storage) = slot.storage.take() {
                self.strategy.free(storage);
            }
        }
    }
}

fn slot_mut(slots: &mut [BufferSlot], slot: SlotRef) -> Result<&mut BufferSlot> {
    slots
        .get_mut(slot.index)
        .filter(|entry| entry.buffer_id == slot.buffer_id)
        .ok_or_else(|| Error::InvalidArg(format!("unknown slot {}", slot.index)))
}

fn writable_slot(slots: &mut [BufferSlot], slot: SlotRef) -> Result<&mut BufferSlot> {
    let entry = slot_mut(slots, slot)?;
    if !entry.acquired || entry.locked {
        return Err(Error::InvalidState(format!(
            "slot {} is not writable (acquired: {}, locked: {})",
            slot.index, entry.acquired, entry.locked
        )));
    }
    Ok(entry)
}

fn unlock_slot(slot: &mut BufferSlot) -> bool {
    if !slot.locked {
        return false;
    }
    slot.lock_count = slot.lock_count.saturating_sub(1);
    if slot.lock_count == 0 {
        slot.locked = false;
        return true;
    }
    false
}

/// Marks `slot` free. The caller posts the semaphore when this returns true.
fn release_slot(state: &mut PoolState, slot: SlotRef) -> Result<bool> {
    let PoolState {
        slots, strategy, ..
    } = state;
    let entry = slot_mut(slots, slot)?;
    if !entry.acquired {
        return Ok(false);
    }
    if entry.locked {
        warn!(
            "Refusing to release slot {} with {} consumer reference(s)",
            slot.index, entry.lock_count
        );
        return Ok(false);
    }
    if let Some(storage) = entry.storage.take_if(|s| s.is_imported()) {
        strategy.free(storage);
    }
    entry.acquired = false;
    trace!("Released slot {}", slot.index);
    Ok(true)
}

fn complete_slot(state: &mut PoolState, slot: SlotRef) -> Result<bool> {
    if unlock_slot(slot_mut(&mut state.slots, slot)?) {
        release_slot(state, slot)
    } else {
        Ok(false)
    }
}

/// Sends slot completions to the pool from any thread.
///
/// Meant for release callbacks that fire off the producer thread, such as a
/// local display surface signalling that it stopped scanning out a buffer.
///
/// Completions are queued and applied by the pool the next time it
/// acquires or drains; a producer blocked in acquire is woken to do so.
#[derive(Clone)]
pub struct ReleaseHandle {
    tx: Sender<SlotRef>,
    pool: Weak<PoolInner>,
}

impl ReleaseHandle {
    /// Queues a completion of `slot`. Returns false if the pool is gone.
    pub fn release(&self, slot: SlotRef) -> bool {
        let Some(pool) = self.pool.upgrade() else {
            return false;
        };
        if self.tx.send(slot).is_err() {
            return false;
        }
        pool.free.nudge();
        true
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("pool_alive", &(self.pool.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::buffer::{
        DumbAllocator, MemfdDevice,
        dumb::tests::FlakyDevice,
        format::{DRM_FORMAT_NV12, DRM_FORMAT_XRGB8888},
    };

    const SHORT: Duration = Duration::from_millis(20);

    fn pool(size: usize) -> BufferPool {
        BufferPool::new(Box::new(DumbAllocator::new(MemfdDevice::new())), size).unwrap()
    }

    #[test]
    fn fourth_acquire_waits_for_a_release() {
        let pool = pool(3);
        let slots: Vec<_> = (0..3)
            .map(|_| pool.acquire(64, 64, DRM_FORMAT_XRGB8888).unwrap())
            .collect();
        assert_eq!(pool.available(), 0);
        assert!(
            pool.try_acquire_for(64, 64, DRM_FORMAT_XRGB8888, SHORT)
                .unwrap()
                .is_none()
        );

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire(64, 64, DRM_FORMAT_XRGB8888))
        };
        thread::sleep(SHORT);
        assert!(!waiter.is_finished());

        assert!(pool.release(slots[1]).unwrap());
        let fourth = waiter.join().unwrap().unwrap();
        assert_eq!(fourth.index, 1);
    }

    #[test]
    fn twice_locked_slot_needs_two_releases() {
        let pool = pool(8);
        let slots: Vec<_> = (0..8)
            .map(|_| pool.acquire(16, 16, DRM_FORMAT_XRGB8888).unwrap())
            .collect();
        let slot = pool.find_by_buffer_id(7).unwrap();
        assert_eq!(slot, slots[7]);

        pool.lock(slot).unwrap();
        pool.lock(slot).unwrap();
        assert!(!pool.complete(slot).unwrap());
        assert_eq!(pool.lock_count(slot).unwrap(), 1);
        assert_eq!(pool.available(), 0);

        assert!(pool.complete(slot).unwrap());
        assert_eq!(pool.lock_count(slot).unwrap(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn duplicate_release_posts_once() {
        let pool = pool(2);
        let slot = pool.acquire(16, 16, DRM_FORMAT_XRGB8888).unwrap();
        pool.lock(slot).unwrap();
        assert!(pool.complete(slot).unwrap());
        assert!(!pool.complete(slot).unwrap());
        assert!(!pool.release(slot).unwrap());
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn locked_slot_is_not_released() {
        let pool = pool(1);
        let slot = pool.acquire(16, 16, DRM_FORMAT_XRGB8888).unwrap();
        pool.lock(slot).unwrap();
        assert!(!pool.release(slot).unwrap());
        assert_eq!(pool.lock_count(slot).unwrap(), 1);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn geometry_change_reallocates() {
        let pool = pool(1);
        let slot = pool.acquire(64, 32, DRM_FORMAT_XRGB8888).unwrap();
        assert_eq!(pool.snapshot(slot).unwrap().width, 64);
        pool.release(slot).unwrap();

        let slot = pool.acquire(128, 64, DRM_FORMAT_NV12).unwrap();
        let snapshot = pool.snapshot(slot).unwrap();
        assert_eq!((snapshot.width, snapshot.height), (128, 64));
        assert_eq!(snapshot.fds.len(), 2);
    }

    #[test]
    fn allocation_failure_restores_free_count() {
        let (device, live) = FlakyDevice::new(Some(0));
        let pool = BufferPool::new(Box::new(DumbAllocator::new(device)), 2).unwrap();

        let err = pool.acquire(64, 64, DRM_FORMAT_NV12).unwrap_err();
        assert!(matches!(err, Error::AllocationFailed { plane: 0, .. }));
        assert_eq!(pool.available(), 2);
        assert!(live.lock().unwrap().is_empty());

        // the device recovers; the same slot can be used again
        let slot = pool.acquire(64, 64, DRM_FORMAT_NV12).unwrap();
        assert_eq!(pool.available(), 1);
        assert!(pool.snapshot(slot).is_ok());
    }

    #[test]
    fn queued_release_wakes_blocked_acquire() {
        let pool = pool(1);
        let slot = pool.acquire(16, 16, DRM_FORMAT_XRGB8888).unwrap();
        pool.lock(slot).unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire(16, 16, DRM_FORMAT_XRGB8888))
        };
        thread::sleep(SHORT);
        assert!(pool.release_handle().release(slot));
        assert_eq!(waiter.join().unwrap().unwrap(), slot);
    }

    #[test]
    fn flushing_interrupts_acquire() {
        let pool = pool(1);
        let _held = pool.acquire(16, 16, DRM_FORMAT_XRGB8888).unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire(16, 16, DRM_FORMAT_XRGB8888))
        };
        thread::sleep(SHORT);
        pool.set_flushing(true);
        assert!(matches!(waiter.join().unwrap(), Err(Error::Flushing)));

        pool.set_flushing(false);
        assert_eq!(pool.release_all(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn release_all_drops_consumer_references() {
        let pool = pool(3);
        for _ in 0..3 {
            let slot = pool.acquire(16, 16, DRM_FORMAT_XRGB8888).unwrap();
            pool.lock(slot).unwrap();
        }
        assert_eq!(pool.release_all(), 3);
        assert_eq!(pool.available(), 3);
        assert_eq!(pool.release_all(), 0);
    }

    #[test]
    fn fill_writes_through_mapping() {
        let pool = pool(1);
        let slot = pool.acquire(4, 2, DRM_FORMAT_XRGB8888).unwrap();
        let stride = pool
            .fill(slot, |planes| {
                planes[0].map.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
                planes[0].stride
            })
            .unwrap();
        assert!(stride >= 16);

        let seen = pool
            .fill(slot, |planes| planes[0].map.as_slice()[..4].to_vec())
            .unwrap();
        assert_eq!(seen, [1, 2, 3, 4]);

        pool.lock(slot).unwrap();
        assert!(matches!(
            pool.fill(slot, |_| ()),
            Err(Error::InvalidState(_))
        ));
    }
}
