//! Named binary gate backed by a POSIX counting semaphore
//!
//! The semaphore starts at 1 and only moves between 1 and 0: the only way
//! to post it is dropping the [`GatePermit`] returned by a successful
//! acquire, so every exit path of a critical section (return, `?`, panic
//! unwinding) releases the gate exactly once.

use crate::platform::validate_object_name;
use crate::{Result, SharedMemoryError};
use nix::errno::Errno;
use std::ffi::CString;
use std::ptr::NonNull;
use std::time::Duration;
use tracing::{debug, error};

/// Permissions of a freshly created gate
const GATE_MODE: libc::c_uint = 0o600;

/// Initial count of a freshly created gate
const GATE_INITIAL_COUNT: libc::c_uint = 1;

/// Handle to a named gate
pub struct Gate {
    name: String,
    sem: NonNull<libc::sem_t>,
    is_creator: bool,
}

impl Gate {
    /// Create the gate with count 1, or attach to it if it already exists
    pub fn create_or_attach(name: &str) -> Result<Self> {
        validate_object_name(name)?;
        let c_name = to_c_name(name)?;

        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                GATE_MODE,
                GATE_INITIAL_COUNT,
            )
        };
        if sem != libc::SEM_FAILED {
            debug!("Created gate {}", name);
            return Self::from_raw(name, sem, true);
        }

        match Errno::last() {
            Errno::EEXIST => Self::attach(name, &c_name),
            errno => Err(SharedMemoryError::from_errno(errno as i32, format!("sem_open {}", name))),
        }
    }

    /// Attach to an existing gate
    pub fn open(name: &str) -> Result<Self> {
        validate_object_name(name)?;
        let c_name = to_c_name(name)?;
        Self::attach(name, &c_name)
    }

    /// Remove the name; handles that are already open keep working
    pub fn destroy(name: &str) -> Result<()> {
        validate_object_name(name)?;
        let c_name = to_c_name(name)?;

        if unsafe { libc::sem_unlink(c_name.as_ptr()) } != 0 {
            return Err(SharedMemoryError::last_os_error(name));
        }
        debug!("Unlinked gate {}", name);
        Ok(())
    }

    fn attach(name: &str, c_name: &CString) -> Result<Self> {
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(SharedMemoryError::last_os_error(name));
        }
        debug!("Attached to gate {}", name);
        Self::from_raw(name, sem, false)
    }

    fn from_raw(name: &str, sem: *mut libc::sem_t, is_creator: bool) -> Result<Self> {
        let sem = NonNull::new(sem)
            .ok_or_else(|| SharedMemoryError::Platform("sem_open returned null".to_string()))?;
        Ok(Self {
            name: name.to_string(),
            sem,
            is_creator,
        })
    }

    /// Gate name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the gate
    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// Block until the gate is free, then take it
    pub fn acquire(&self) -> Result<GatePermit<'_>> {
        loop {
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(GatePermit { gate: self });
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => {
                    return Err(SharedMemoryError::from_errno(
                        errno as i32,
                        format!("sem_wait {}", self.name),
                    ))
                }
            }
        }
    }

    /// Take the gate if it is free right now
    pub fn try_acquire(&self) -> Result<Option<GatePermit<'_>>> {
        if self.try_wait()? {
            Ok(Some(GatePermit { gate: self }))
        } else {
            Ok(None)
        }
    }

    /// Wait at most `timeout` for the gate
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<Option<GatePermit<'_>>> {
        if wait_for(self, timeout)? {
            Ok(Some(GatePermit { gate: self }))
        } else {
            Ok(None)
        }
    }

    /// Take over the permit of a holder that can no longer release it
    ///
    /// # Safety
    /// The gate must be held (count 0) by a participant that will never post
    /// it, and the caller must be the only one adopting that permit.
    pub(crate) unsafe fn adopt(&self) -> GatePermit<'_> {
        GatePermit { gate: self }
    }

    fn try_wait(&self) -> Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            match Errno::last() {
                Errno::EAGAIN => return Ok(false),
                Errno::EINTR => continue,
                errno => {
                    return Err(SharedMemoryError::from_errno(
                        errno as i32,
                        format!("sem_trywait {}", self.name),
                    ))
                }
            }
        }
    }

    fn post(&self) {
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            error!(
                "Failed to release gate {}: {}",
                self.name,
                std::io::Error::last_os_error()
            );
        }
    }
}

impl Drop for Gate {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
    }
}

impl std::fmt::Debug for Gate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("name", &self.name)
            .field("is_creator", &self.is_creator)
            .finish()
    }
}

// Safety: POSIX semaphores may be used from any thread
unsafe impl Send for Gate {}
// Safety: sem_wait/sem_post are thread-safe
unsafe impl Sync for Gate {}

/// Proof of holding a [`Gate`]; dropping it releases the gate
#[must_use = "dropping the permit releases the gate immediately"]
pub struct GatePermit<'a> {
    gate: &'a Gate,
}

impl GatePermit<'_> {
    /// Name of the held gate
    pub fn gate_name(&self) -> &str {
        &self.gate.name
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.post();
    }
}

fn to_c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| SharedMemoryError::InvalidName(format!("{:?} contains a nul byte", name)))
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn wait_for(gate: &Gate, timeout: Duration) -> Result<bool> {
            let deadline = realtime_deadline(timeout);
            loop {
                if unsafe { libc::sem_timedwait(gate.sem.as_ptr(), &deadline) } == 0 {
                    return Ok(true);
                }
                match Errno::last() {
                    Errno::ETIMEDOUT => return Ok(false),
                    Errno::EINTR => continue,
                    errno => {
                        return Err(SharedMemoryError::from_errno(
                            errno as i32,
                            format!("sem_timedwait {}", gate.name),
                        ))
                    }
                }
            }
        }

        /// sem_timedwait takes an absolute CLOCK_REALTIME deadline
        fn realtime_deadline(timeout: Duration) -> libc::timespec {
            let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
            unsafe {
                libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline);
            }

            let nanos = deadline.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
            let secs = timeout.as_secs().min(i32::MAX as u64) + nanos / 1_000_000_000;
            deadline.tv_sec = deadline.tv_sec.saturating_add(secs as libc::time_t);
            deadline.tv_nsec = (nanos % 1_000_000_000) as _;
            deadline
        }
    } else {
        fn wait_for(gate: &Gate, timeout: Duration) -> Result<bool> {
            let deadline = std::time::Instant::now() + timeout;
            let mut backoff = Duration::from_micros(50);
            loop {
                if gate.try_wait()? {
                    return Ok(true);
                }
                let now = std::time::Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                std::thread::sleep(backoff.min(deadline - now));
                backoff = (backoff * 2).min(Duration::from_millis(5));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PlatformUtils;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unique_name(prefix: &str) -> String {
        format!("/{}-{}", prefix, PlatformUtils::generate_session_id())
    }

    #[test]
    fn test_at_most_one_holder() {
        let name = unique_name("gate-exclusive");
        let _owner = Gate::create_or_attach(&name).unwrap();
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    // Separate handle per worker, as independent processes would have
                    let gate = Gate::open(&name).unwrap();
                    for _ in 0..50 {
                        let _permit = gate.acquire().unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        std::thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        Gate::destroy(&name).unwrap();
    }

    #[test]
    fn test_try_acquire_and_timeout_while_held() {
        let name = unique_name("gate-held");
        let gate = Gate::create_or_attach(&name).unwrap();
        assert!(gate.is_creator());

        let permit = gate.acquire().unwrap();
        assert_eq!(permit.gate_name(), name);

        // Attaching must not reset the count back to 1
        let other = Gate::create_or_attach(&name).unwrap();
        assert!(!other.is_creator());
        assert!(other.try_acquire().unwrap().is_none());
        assert!(other.acquire_timeout(Duration::from_millis(30)).unwrap().is_none());

        drop(permit);
        assert!(other.try_acquire().unwrap().is_some());
        assert!(other.acquire_timeout(Duration::from_millis(30)).unwrap().is_some());

        Gate::destroy(&name).unwrap();
    }

    #[test]
    fn test_permit_released_on_panic() {
        let name = unique_name("gate-panic");
        let gate = Gate::create_or_attach(&name).unwrap();

        std::thread::scope(|s| {
            let outcome = s
                .spawn(|| {
                    let _permit = gate.acquire().unwrap();
                    panic!("worker failed inside the critical section");
                })
                .join();
            assert!(outcome.is_err());
        });

        assert!(gate.try_acquire().unwrap().is_some());
        Gate::destroy(&name).unwrap();
    }

    #[test]
    fn test_destroy_and_open_missing() {
        let name = unique_name("gate-destroy");
        let gate = Gate::create_or_attach(&name).unwrap();
        Gate::destroy(&name).unwrap();

        assert!(matches!(Gate::open(&name).unwrap_err(), SharedMemoryError::NotFound(_)));
        assert!(matches!(Gate::destroy(&name).unwrap_err(), SharedMemoryError::NotFound(_)));

        // Still usable through the handle opened before the unlink
        assert!(gate.try_acquire().unwrap().is_some());
    }
}
