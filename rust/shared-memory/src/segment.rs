//! Reference-counted shared segments
//!
//! A segment is a [`SharedRegion`] laid out as a fixed [`SegmentHeader`]
//! followed by a typed payload, paired with the [`Gate`] that serializes
//! access to it.
//!
//! ```text
//! ┌──────────────────────── SegmentHeader (32 bytes) ───────────────────────┐
//! │ magic │ layout_id │ state │ attached │ holder_pid │ reserved (3 words)  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │ payload: L (aligned for L)                                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The header settles three lifecycle questions the raw region cannot:
//!
//! - **Initialized?** `state` distinguishes never-initialized memory from a
//!   payload that legitimately looks like zeroes. The first participant to
//!   take the gate while `state == EMPTY` runs [`SegmentLayout::initialize`].
//! - **Who is last?** `attached` counts participants. Whoever detaches the
//!   last one marks the segment destroyed and unlinks both names.
//! - **Who holds the gate?** `holder_pid` is published by the holder. A
//!   waiter that finds the recorded holder process gone takes over its
//!   permit instead of waiting forever.

use crate::gate::{Gate, GatePermit};
use crate::platform::{PlatformUtils, SessionNames};
use crate::region::{SharedRegion, DEFAULT_ATTACH_TIMEOUT};
use crate::{Result, SharedMemoryError};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Segment header magic number ("SHMC")
pub const SEGMENT_MAGIC: u32 = 0x5348_4D43;

const STATE_EMPTY: u32 = 0;
const STATE_READY: u32 = 1;
const STATE_DESTROYED: u32 = 2;

/// Header stored at offset 0 of every segment
#[repr(C)]
pub struct SegmentHeader {
    magic: AtomicU32,
    layout_id: AtomicU32,
    state: AtomicU32,
    attached: AtomicU32,
    holder_pid: AtomicU32,
    _reserved: [u32; 3],
}

/// Payload types that can live in a segment
///
/// # Safety
/// Implementors must be `#[repr(C)]`, hold no pointers or references, and
/// treat the all-zero bit pattern as a valid value: every participant maps
/// the same bytes and the OS hands out zeroed memory.
pub unsafe trait SegmentLayout: Sized + Send + 'static {
    /// Identifies the payload type; attaching with another layout fails
    const LAYOUT_ID: u32;

    /// Establish the initial state; runs once per segment, under the gate
    fn initialize(&mut self);
}

/// Segment tuning
#[derive(Debug, Clone)]
pub struct SegmentOptions {
    /// Wait for a concurrent creator to size a fresh region
    pub attach_timeout: Duration,
    /// How long to wait on the gate before checking whether its holder died
    pub recovery_interval: Duration,
    /// Give up waiting for the gate after this long; `None` waits forever
    pub acquire_timeout: Option<Duration>,
    /// How long a designated destroy waits for the gate before forcing
    pub cleanup_timeout: Duration,
}

impl Default for SegmentOptions {
    fn default() -> Self {
        Self {
            attach_timeout: DEFAULT_ATTACH_TIMEOUT,
            recovery_interval: Duration::from_millis(200),
            acquire_timeout: None,
            cleanup_timeout: Duration::from_secs(2),
        }
    }
}

/// Result of leaving a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// This was the last participant; region and gate are gone
    Last,
    /// Other participants remain
    Remaining(u32),
    /// Already released locally, or destroyed by someone else
    AlreadyReleased,
}

/// Byte offset of the payload inside the region
pub const fn payload_offset<L>() -> usize {
    let align = align_of::<L>();
    (size_of::<SegmentHeader>() + align - 1) / align * align
}

/// Total region size for a payload type
pub const fn segment_size<L>() -> usize {
    payload_offset::<L>() + size_of::<L>()
}

/// One participant's handle to a shared segment
pub struct SharedSegment<L: SegmentLayout> {
    names: SessionNames,
    region: SharedRegion,
    gate: Gate,
    options: SegmentOptions,
    released: AtomicBool,
    _layout: PhantomData<fn() -> L>,
}

impl<L: SegmentLayout> SharedSegment<L> {
    /// Join the segment, creating region and gate if they do not exist yet
    pub fn create_or_attach(names: &SessionNames, options: SegmentOptions) -> Result<Self> {
        let region = SharedRegion::create_or_attach_within(
            names.region(),
            segment_size::<L>(),
            options.attach_timeout,
        )?;
        let gate = match Gate::create_or_attach(names.gate()) {
            Ok(gate) => gate,
            Err(e) => {
                if region.is_creator() {
                    let _ = SharedRegion::destroy(names.region());
                }
                return Err(e);
            }
        };

        Self::join(names, region, gate, options)
    }

    /// Join a segment that somebody else created
    pub fn attach(names: &SessionNames, options: SegmentOptions) -> Result<Self> {
        let region = SharedRegion::open(names.region(), segment_size::<L>())?;
        let gate = Gate::open(names.gate())?;
        Self::join(names, region, gate, options)
    }

    fn join(names: &SessionNames, region: SharedRegion, gate: Gate, options: SegmentOptions) -> Result<Self> {
        let created_region = region.is_creator();
        let created_gate = gate.is_creator();

        // Not counted as a participant until the handshake succeeds
        let segment = Self {
            names: names.clone(),
            region,
            gate,
            options,
            released: AtomicBool::new(true),
            _layout: PhantomData,
        };

        match segment.handshake() {
            Ok(()) => {
                segment.released.store(false, Ordering::Release);
                Ok(segment)
            }
            Err(e) => {
                if created_region {
                    let _ = SharedRegion::destroy(names.region());
                }
                if created_gate {
                    let _ = Gate::destroy(names.gate());
                }
                Err(e)
            }
        }
    }

    fn handshake(&self) -> Result<()> {
        let _permit = self.acquire_tracked()?;
        let header = self.header();

        match header.state.load(Ordering::Acquire) {
            STATE_EMPTY => {
                header.magic.store(SEGMENT_MAGIC, Ordering::Relaxed);
                header.layout_id.store(L::LAYOUT_ID, Ordering::Relaxed);
                unsafe { (*self.payload_ptr().as_ptr()).initialize() };
                header.state.store(STATE_READY, Ordering::Release);
                info!("Initialized segment {} (layout {:#010x})", self.names.region(), L::LAYOUT_ID);
            }
            STATE_READY => {
                let magic = header.magic.load(Ordering::Acquire);
                if magic != SEGMENT_MAGIC {
                    return Err(SharedMemoryError::Corrupted(format!(
                        "{}: bad magic {:#010x}",
                        self.names.region(),
                        magic
                    )));
                }
                let found = header.layout_id.load(Ordering::Acquire);
                if found != L::LAYOUT_ID {
                    return Err(SharedMemoryError::LayoutMismatch {
                        name: self.names.region().to_string(),
                        expected: L::LAYOUT_ID,
                        found,
                    });
                }
            }
            STATE_DESTROYED => {
                return Err(SharedMemoryError::NotFound(format!(
                    "{} has been destroyed",
                    self.names.region()
                )))
            }
            other => {
                return Err(SharedMemoryError::Corrupted(format!(
                    "{}: unknown state {}",
                    self.names.region(),
                    other
                )))
            }
        }

        let participants = header.attached.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Joined segment {} ({} participants)", self.names.region(), participants);
        Ok(())
    }

    /// Take the gate and borrow the payload
    ///
    /// Fails with `NotFound` once the segment is destroyed (by anyone) or
    /// this handle has been released.
    pub fn lock(&self) -> Result<SegmentGuard<'_, L>> {
        self.ensure_attached()?;
        let permit = self.acquire_tracked()?;

        if self.header().state.load(Ordering::Acquire) != STATE_READY {
            return Err(SharedMemoryError::NotFound(format!(
                "{} has been destroyed",
                self.names.region()
            )));
        }

        Ok(SegmentGuard {
            payload: self.payload_ptr(),
            _permit: permit,
            _borrow: PhantomData,
        })
    }

    /// Leave the segment; the last participant out removes it
    pub fn detach(&self) -> Result<Detached> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(Detached::AlreadyReleased);
        }

        let remaining = {
            let _permit = match self.acquire_tracked() {
                Ok(permit) => permit,
                Err(e) => {
                    // Still counted as a participant; allow another attempt
                    self.released.store(false, Ordering::Release);
                    return Err(e);
                }
            };
            let header = self.header();
            if header.state.load(Ordering::Acquire) != STATE_READY {
                debug!("Segment {} was destroyed before detach", self.names.region());
                return Ok(Detached::AlreadyReleased);
            }

            let remaining = header.attached.load(Ordering::Acquire).saturating_sub(1);
            header.attached.store(remaining, Ordering::Release);
            if remaining == 0 {
                header.state.store(STATE_DESTROYED, Ordering::Release);
            }
            remaining
        };

        if remaining > 0 {
            debug!("Detached from {} ({} participants remain)", self.names.region(), remaining);
            return Ok(Detached::Remaining(remaining));
        }

        self.unlink_names()?;
        info!("Last participant left {}; removed region and gate", self.names.region());
        Ok(Detached::Last)
    }

    /// Destroy the segment for everyone, whatever the participant count
    ///
    /// Meant for the one designated owner (e.g. a launcher after joining
    /// all of its workers). Proceeds without the gate if it stays held for
    /// longer than the cleanup timeout.
    pub fn destroy(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let state = &self.header().state;
        match self.gate.acquire_timeout(self.options.cleanup_timeout) {
            Ok(Some(_permit)) => state.store(STATE_DESTROYED, Ordering::Release),
            Ok(None) => {
                warn!(
                    "Gate {} still held after {:?}; destroying anyway",
                    self.names.gate(),
                    self.options.cleanup_timeout
                );
                state.store(STATE_DESTROYED, Ordering::Release);
            }
            Err(e) => {
                warn!("Could not take gate {} for destroy: {}", self.names.gate(), e);
                state.store(STATE_DESTROYED, Ordering::Release);
            }
        }

        self.unlink_names()?;
        info!("Destroyed segment {}", self.names.region());
        Ok(())
    }

    /// Current number of participants
    pub fn participants(&self) -> u32 {
        self.header().attached.load(Ordering::Acquire)
    }

    /// Names of the region and gate
    pub fn names(&self) -> &SessionNames {
        &self.names
    }

    /// Whether this handle created the region
    pub fn is_creator(&self) -> bool {
        self.region.is_creator()
    }

    fn ensure_attached(&self) -> Result<()> {
        if self.released.load(Ordering::Acquire) {
            return Err(SharedMemoryError::NotFound(format!(
                "{} was released by this participant",
                self.names.region()
            )));
        }
        Ok(())
    }

    /// Acquire the gate and publish this process as its holder
    fn acquire_tracked(&self) -> Result<TrackedPermit<'_>> {
        let me = PlatformUtils::get_process_id();
        let holder = &self.header().holder_pid;
        let started = Instant::now();
        let interval = self.options.recovery_interval.max(Duration::from_millis(1));

        let permit = loop {
            let slice = match self.options.acquire_timeout {
                Some(limit) => {
                    let elapsed = started.elapsed();
                    if elapsed >= limit {
                        return Err(SharedMemoryError::Timeout(format!(
                            "gate {} not acquired within {:?}",
                            self.names.gate(),
                            limit
                        )));
                    }
                    interval.min(limit - elapsed)
                }
                None => interval,
            };

            if let Some(permit) = self.gate.acquire_timeout(slice)? {
                break permit;
            }

            let current = holder.load(Ordering::Acquire);
            if current != 0
                && current != me
                && !PlatformUtils::process_alive(current)
                && holder
                    .compare_exchange(current, me, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                warn!(
                    "Process {} exited while holding gate {}; taking over its permit",
                    current,
                    self.names.gate()
                );
                break unsafe { self.gate.adopt() };
            }
        };

        holder.store(me, Ordering::Release);
        Ok(TrackedPermit {
            holder,
            _permit: permit,
        })
    }

    fn unlink_names(&self) -> Result<()> {
        let region = tolerate_missing(SharedRegion::destroy(self.names.region()));
        let gate = tolerate_missing(Gate::destroy(self.names.gate()));
        region.and(gate)
    }

    fn header(&self) -> &SegmentHeader {
        // The mapping is page aligned and at least header-sized
        unsafe { &*(self.region.base_ptr() as *const SegmentHeader) }
    }

    fn payload_ptr(&self) -> NonNull<L> {
        // In bounds: the region was sized with segment_size::<L>()
        unsafe { NonNull::new_unchecked(self.region.base_ptr().add(payload_offset::<L>()) as *mut L) }
    }
}

impl<L: SegmentLayout> Drop for SharedSegment<L> {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            if let Err(e) = self.detach() {
                warn!("Failed to detach from {}: {}", self.names.region(), e);
            }
        }
    }
}

impl<L: SegmentLayout> std::fmt::Debug for SharedSegment<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("names", &self.names)
            .field("layout_id", &L::LAYOUT_ID)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

/// Gate permit that clears the published holder before releasing
struct TrackedPermit<'a> {
    holder: &'a AtomicU32,
    _permit: GatePermit<'a>,
}

impl Drop for TrackedPermit<'_> {
    fn drop(&mut self) {
        // Must happen before the permit field posts the semaphore
        self.holder.store(0, Ordering::Release);
    }
}

/// Exclusive access to a segment payload; releases the gate on drop
#[must_use = "dropping the guard releases the gate immediately"]
pub struct SegmentGuard<'a, L> {
    payload: NonNull<L>,
    _permit: TrackedPermit<'a>,
    _borrow: PhantomData<&'a mut L>,
}

impl<L> Deref for SegmentGuard<'_, L> {
    type Target = L;

    fn deref(&self) -> &L {
        unsafe { self.payload.as_ref() }
    }
}

impl<L> DerefMut for SegmentGuard<'_, L> {
    fn deref_mut(&mut self) -> &mut L {
        unsafe { self.payload.as_mut() }
    }
}

impl<L> std::fmt::Debug for SegmentGuard<'_, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentGuard")
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Unlink whatever region and gate exist under `names`
///
/// Used before creating a fresh session and by manual cleanup after a
/// crashed run. Returns how many objects were removed.
pub fn remove_stale(names: &SessionNames) -> Result<usize> {
    let mut removed = 0;
    for result in [SharedRegion::destroy(names.region()), Gate::destroy(names.gate())] {
        match result {
            Ok(()) => removed += 1,
            Err(SharedMemoryError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }

    if removed > 0 {
        warn!("Removed {} stale object(s) named after {}", removed, names.region());
    }
    Ok(removed)
}

fn tolerate_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(SharedMemoryError::NotFound(name)) => {
            debug!("{} was already unlinked", name);
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Counter {
        value: u64,
        writers: u32,
        _pad: u32,
    }

    unsafe impl SegmentLayout for Counter {
        const LAYOUT_ID: u32 = 0x434E_5452;

        fn initialize(&mut self) {
            self.value = 100;
            self.writers = 0;
        }
    }

    /// Same size as `Counter`, different protocol
    #[repr(C)]
    struct Impostor {
        bytes: [u8; 16],
    }

    unsafe impl SegmentLayout for Impostor {
        const LAYOUT_ID: u32 = 0x494D_5053;

        fn initialize(&mut self) {}
    }

    fn names(prefix: &str) -> SessionNames {
        SessionNames::generate(prefix).unwrap()
    }

    fn quick_options() -> SegmentOptions {
        SegmentOptions {
            recovery_interval: Duration::from_millis(20),
            acquire_timeout: Some(Duration::from_secs(5)),
            ..SegmentOptions::default()
        }
    }

    #[test]
    fn test_first_participant_initializes_once() {
        let names = names("seg-init");
        let first = SharedSegment::<Counter>::create_or_attach(&names, quick_options()).unwrap();
        assert!(first.is_creator());
        first.lock().unwrap().value += 5;

        let second = SharedSegment::<Counter>::create_or_attach(&names, quick_options()).unwrap();
        assert!(!second.is_creator());
        assert_eq!(second.lock().unwrap().value, 105);
        assert_eq!(second.participants(), 2);

        first.destroy().unwrap();
    }

    #[test]
    fn test_last_detach_removes_names() {
        let names = names("seg-detach");
        let a = SharedSegment::<Counter>::create_or_attach(&names, quick_options()).unwrap();
        let b = SharedSegment::<Counter>::attach(&names, quick_options()).unwrap();

        assert_eq!(b.detach().unwrap(), Detached::Remaining(1));
        assert_eq!(b.detach().unwrap(), Detached::AlreadyReleased);
        assert!(matches!(b.lock().unwrap_err(), SharedMemoryError::NotFound(_)));

        assert_eq!(a.detach().unwrap(), Detached::Last);
        assert!(matches!(
            SharedSegment::<Counter>::attach(&names, quick_options()).unwrap_err(),
            SharedMemoryError::NotFound(_)
        ));
    }

    #[test]
    fn test_destroy_is_seen_by_other_participants() {
        let names = names("seg-destroy");
        let owner = SharedSegment::<Counter>::create_or_attach(&names, quick_options()).unwrap();
        let peer = SharedSegment::<Counter>::attach(&names, quick_options()).unwrap();

        owner.destroy().unwrap();
        assert!(matches!(peer.lock().unwrap_err(), SharedMemoryError::NotFound(_)));
        assert_eq!(peer.detach().unwrap(), Detached::AlreadyReleased);
        assert!(matches!(owner.lock().unwrap_err(), SharedMemoryError::NotFound(_)));
    }

    #[test]
    fn test_drop_detaches() {
        let names = names("seg-drop");
        let owner = SharedSegment::<Counter>::create_or_attach(&names, quick_options()).unwrap();
        {
            let _peer = SharedSegment::<Counter>::attach(&names, quick_options()).unwrap();
            assert_eq!(owner.participants(), 2);
        }
        assert_eq!(owner.participants(), 1);
        assert_eq!(owner.detach().unwrap(), Detached::Last);
    }

    #[test]
    fn test_layout_mismatch() {
        let names = names("seg-layout");
        let owner = SharedSegment::<Counter>::create_or_attach(&names, quick_options()).unwrap();

        let err = SharedSegment::<Impostor>::attach(&names, quick_options()).unwrap_err();
        assert!(matches!(err, SharedMemoryError::LayoutMismatch { .. }));
        assert_eq!(owner.participants(), 1);

        owner.destroy().unwrap();
    }

    #[test]
    fn test_lock_serializes_participants() {
        let names = names("seg-threads");
        let owner = SharedSegment::<Counter>::create_or_attach(&names, quick_options()).unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    let peer = SharedSegment::<Counter>::attach(&names, quick_options()).unwrap();
                    for _ in 0..200 {
                        let mut counter = peer.lock().unwrap();
                        counter.writers += 1;
                        assert_eq!(counter.writers, 1);
                        counter.value += 1;
                        counter.writers -= 1;
                    }
                });
                s.spawn(|| {
                    for _ in 0..200 {
                        owner.lock().unwrap().value += 1;
                    }
                });
            }
        });

        assert_eq!(owner.lock().unwrap().value, 100 + 8 * 200);
        assert_eq!(owner.participants(), 1);
        owner.destroy().unwrap();
    }

    #[test]
    fn test_recovers_permit_of_exited_holder() {
        let names = names("seg-recover");
        let segment = SharedSegment::<Counter>::create_or_attach(&names, quick_options()).unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        // Simulate a holder that died inside its critical section
        std::mem::forget(segment.gate.acquire().unwrap());
        segment.header().holder_pid.store(dead_pid, Ordering::Release);

        segment.lock().unwrap().value += 1;
        assert_eq!(segment.header().holder_pid.load(Ordering::Acquire), 0);
        assert!(segment.gate.try_acquire().unwrap().is_some());

        segment.destroy().unwrap();
    }

    #[test]
    fn test_acquire_timeout_with_live_holder() {
        let names = names("seg-timeout");
        let options = SegmentOptions {
            acquire_timeout: Some(Duration::from_millis(60)),
            ..quick_options()
        };
        let owner = SharedSegment::<Counter>::create_or_attach(&names, options.clone()).unwrap();
        let peer = SharedSegment::<Counter>::attach(&names, options).unwrap();

        let guard = owner.lock().unwrap();
        assert!(matches!(peer.lock().unwrap_err(), SharedMemoryError::Timeout(_)));
        drop(guard);
        assert_eq!(peer.lock().unwrap().value, 100);

        owner.destroy().unwrap();
    }

    #[test]
    fn test_detach_under_contention_can_be_retried() {
        let names = names("seg-detach-busy");
        let options = SegmentOptions {
            acquire_timeout: Some(Duration::from_millis(60)),
            ..quick_options()
        };
        let a = SharedSegment::<Counter>::create_or_attach(&names, options.clone()).unwrap();
        let b = SharedSegment::<Counter>::attach(&names, options).unwrap();

        let guard = a.lock().unwrap();
        assert!(matches!(b.detach(), Err(SharedMemoryError::Timeout(_))));
        drop(guard);

        assert_eq!(a.participants(), 2);
        assert_eq!(b.detach().unwrap(), Detached::Remaining(1));
        assert_eq!(a.detach().unwrap(), Detached::Last);
        assert!(matches!(
            SharedSegment::<Counter>::attach(&names, quick_options()),
            Err(SharedMemoryError::NotFound(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_recovers_permit_of_unreaped_holder() {
        let names = names("seg-zombie");
        let segment = SharedSegment::<Counter>::create_or_attach(&names, quick_options()).unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let zombie_pid = child.id();
        while !PlatformUtils::is_zombie(zombie_pid) {
            std::thread::sleep(Duration::from_millis(5));
        }

        std::mem::forget(segment.gate.acquire().unwrap());
        segment.header().holder_pid.store(zombie_pid, Ordering::Release);

        segment.lock().unwrap().value += 1;
        assert_eq!(segment.lock().unwrap().value, 101);

        child.wait().unwrap();
        segment.destroy().unwrap();
    }

    #[test]
    fn test_remove_stale() {
        let names = names("seg-stale");
        assert_eq!(remove_stale(&names).unwrap(), 0);

        let segment = SharedSegment::<Counter>::create_or_attach(&names, quick_options()).unwrap();
        assert_eq!(remove_stale(&names).unwrap(), 2);
        assert!(matches!(
            SharedSegment::<Counter>::attach(&names, quick_options()).unwrap_err(),
            SharedMemoryError::NotFound(_)
        ));

        // Names are already gone; destroy only flips the shared state
        segment.destroy().unwrap();
    }

    #[test]
    fn test_segment_geometry() {
        assert_eq!(size_of::<SegmentHeader>(), 32);
        assert_eq!(payload_offset::<Counter>(), 32);
        assert_eq!(segment_size::<Counter>(), 48);
        assert_eq!(payload_offset::<[u8; 3]>(), 32);
    }
}
