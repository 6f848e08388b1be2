//! Stack protocol: a bounded LIFO of short strings shared by independent processes

use crate::{CoordError, Result};
use shm_coord_shared_memory::{
    Detached, SegmentLayout, SegmentOptions, SessionNames, SharedMemoryError, SharedSegment,
};
use tracing::{debug, info};

/// Maximum number of entries
pub const CAPACITY: usize = 100;

/// Bytes per slot, terminating NUL included
pub const MAX_LEN: usize = 256;

/// Default base name of stack segments
pub const STACK_BASE: &str = "shared_stack";

/// Shared payload of a stack segment
#[repr(C)]
pub struct StackState {
    /// Index of the top entry, -1 when empty
    top: i32,
    slots: [[u8; MAX_LEN]; CAPACITY],
}

unsafe impl SegmentLayout for StackState {
    const LAYOUT_ID: u32 = 0x5354_4B31; // "STK1"

    fn initialize(&mut self) {
        self.top = -1;
    }
}

impl StackState {
    /// Number of entries; never trusts an out-of-range `top`
    fn len(&self) -> Result<usize> {
        if self.top < -1 || self.top >= CAPACITY as i32 {
            return Err(SharedMemoryError::Corrupted(format!(
                "stack top {} outside [-1, {}]",
                self.top,
                CAPACITY - 1
            ))
            .into());
        }
        Ok((self.top + 1) as usize)
    }

    fn entry(&self, index: usize) -> String {
        let slot = &self.slots[index];
        let end = slot.iter().position(|b| *b == 0).unwrap_or(MAX_LEN);
        String::from_utf8_lossy(&slot[..end]).into_owned()
    }

    fn store(&mut self, index: usize, item: &str) {
        let slot = &mut self.slots[index];
        let bytes = item.as_bytes();
        slot[..bytes.len()].copy_from_slice(bytes);
        slot[bytes.len()..].fill(0);
    }
}

/// The part of `item` a slot can hold
///
/// Entries end at the first NUL and keep at most `MAX_LEN - 1` bytes,
/// cut on a character boundary.
pub fn truncate_entry(item: &str) -> &str {
    let item = match item.find('\0') {
        Some(nul) => &item[..nul],
        None => item,
    };
    if item.len() < MAX_LEN {
        return item;
    }

    let mut end = MAX_LEN - 1;
    while !item.is_char_boundary(end) {
        end -= 1;
    }
    &item[..end]
}

/// Handle to a shared stack
#[derive(Debug)]
pub struct SharedStack {
    segment: SharedSegment<StackState>,
}

impl SharedStack {
    /// Join the stack, creating it (empty) on first use
    pub fn open(names: &SessionNames, options: SegmentOptions) -> Result<Self> {
        let segment = SharedSegment::create_or_attach(names, options)?;
        if segment.is_creator() {
            info!("Created shared stack {}", names.region());
        } else {
            info!("Attached to shared stack {} ({} participants)", names.region(), segment.participants());
        }
        Ok(Self { segment })
    }

    /// Join an existing stack only
    pub fn attach(names: &SessionNames, options: SegmentOptions) -> Result<Self> {
        let segment = SharedSegment::attach(names, options)?;
        Ok(Self { segment })
    }

    /// Push an entry; returns the new length
    pub fn push(&self, item: &str) -> Result<usize> {
        let mut state = self.segment.lock()?;
        let len = state.len()?;
        if len == CAPACITY {
            return Err(CoordError::StackFull { capacity: CAPACITY });
        }

        let entry = truncate_entry(item);
        if entry.len() < item.len() {
            debug!("Truncated entry from {} to {} bytes", item.len(), entry.len());
        }
        state.store(len, entry);
        state.top = len as i32;
        Ok(len + 1)
    }

    /// Remove and return the top entry
    pub fn pop(&self) -> Result<String> {
        let mut state = self.segment.lock()?;
        let len = state.len()?;
        if len == 0 {
            return Err(CoordError::StackEmpty);
        }

        let item = state.entry(len - 1);
        state.top -= 1;
        Ok(item)
    }

    /// All entries, top first
    pub fn peek_all(&self) -> Result<Vec<String>> {
        let state = self.segment.lock()?;
        let len = state.len()?;
        Ok((0..len).rev().map(|i| state.entry(i)).collect())
    }

    /// Remove every entry
    pub fn clear(&self) -> Result<()> {
        self.segment.lock()?.top = -1;
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        self.segment.lock()?.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn participants(&self) -> u32 {
        self.segment.participants()
    }

    pub fn names(&self) -> &SessionNames {
        self.segment.names()
    }

    /// Leave the stack; the last participant removes region and gate
    pub fn shutdown(&self) -> Result<Detached> {
        let detached = self.segment.detach()?;
        match detached {
            Detached::Last => info!("Last participant left; shared stack removed"),
            Detached::Remaining(n) => info!("Detached from shared stack ({} participants remain)", n),
            Detached::AlreadyReleased => debug!("Shared stack already released"),
        }
        Ok(detached)
    }

    /// Remove the stack for every participant
    pub fn destroy(&self) -> Result<()> {
        Ok(self.segment.destroy()?)
    }
}
