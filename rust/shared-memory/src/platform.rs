//! Platform-specific helpers: process identity, liveness, resource naming

use crate::{Result, SharedMemoryError};

/// Longest name accepted for a region or gate, leading slash included.
///
/// Linux allows 255 bytes for shm objects but only 251 for semaphores
/// (`sem.` is prepended), so stay below both.
pub const MAX_NAME_LEN: usize = 240;

/// Platform-specific utilities
pub struct PlatformUtils;

impl PlatformUtils {
    /// Get current process ID
    pub fn get_process_id() -> u32 {
        std::process::id()
    }

    /// Check whether a process with the given pid still exists
    pub fn process_alive(pid: u32) -> bool {
        #[cfg(unix)]
        {
            use nix::errno::Errno;
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let raw = match i32::try_from(pid) {
                Ok(raw) if raw > 0 => raw,
                _ => return false,
            };
            let exists = match kill(Pid::from_raw(raw), None::<Signal>) {
                Ok(()) => true,
                // Exists, but belongs to someone else
                Err(Errno::EPERM) => true,
                Err(_) => false,
            };
            // An exited child stays signalable until its parent reaps it
            exists && !Self::is_zombie(pid)
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            true
        }
    }

    /// Whether `pid` has exited but not been reaped yet
    #[cfg(target_os = "linux")]
    pub fn is_zombie(pid: u32) -> bool {
        let stat = match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => stat,
            Err(_) => return false,
        };
        // `pid (comm) state ...`; comm may itself contain parentheses
        stat.rfind(')')
            .and_then(|end| stat[end + 1..].split_whitespace().next())
            .map_or(false, |state| state == "Z" || state == "X")
    }

    #[cfg(not(target_os = "linux"))]
    pub fn is_zombie(_pid: u32) -> bool {
        false
    }

    /// Generate a short session identifier
    ///
    /// Kept short because some platforms cap shared object names at ~30 bytes.
    pub fn generate_session_id() -> String {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(12);
        id
    }
}

/// Validate a base name or session id used to build resource names
pub fn validate_name_component(component: &str) -> Result<()> {
    if component.is_empty() {
        return Err(SharedMemoryError::InvalidName("empty name component".to_string()));
    }

    if let Some(bad) = component
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(SharedMemoryError::InvalidName(format!(
            "{:?} contains {:?}",
            component, bad
        )));
    }

    Ok(())
}

/// Validate a full POSIX object name (`/name`)
pub fn validate_object_name(name: &str) -> Result<()> {
    if name.len() < 2 || name.len() > MAX_NAME_LEN {
        return Err(SharedMemoryError::InvalidName(format!(
            "{:?} must be 2..={} bytes",
            name, MAX_NAME_LEN
        )));
    }

    match name.strip_prefix('/') {
        Some(rest) if !rest.contains('/') && !rest.contains('\0') => Ok(()),
        _ => Err(SharedMemoryError::InvalidName(format!(
            "{:?} must start with a single '/' and contain no other slash",
            name
        ))),
    }
}

/// Names of the region and gate that make up one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNames {
    region: String,
    gate: String,
}

impl SessionNames {
    /// Build names from a base and an optional session id
    ///
    /// Without a session the well-known names `/{base}` and `/{base}-gate`
    /// are used, so unrelated processes started by hand can meet.
    pub fn new(base: &str, session: Option<&str>) -> Result<Self> {
        validate_name_component(base)?;

        let stem = match session {
            Some(session) => {
                validate_name_component(session)?;
                format!("/{}-{}", base, session)
            }
            None => format!("/{}", base),
        };

        let names = Self {
            gate: format!("{}-gate", stem),
            region: stem,
        };
        validate_object_name(&names.region)?;
        validate_object_name(&names.gate)?;
        Ok(names)
    }

    /// Build names with a freshly generated session id
    pub fn generate(base: &str) -> Result<Self> {
        Self::new(base, Some(&PlatformUtils::generate_session_id()))
    }

    /// Shared region name
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Gate name
    pub fn gate(&self) -> &str {
        &self.gate
    }
}
