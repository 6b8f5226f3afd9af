//! Capability inspection and reduction.
//!
//! Only the four capabilities the switcher needs are ever looked at.
//! Everything else is dropped by [`CapabilityBackend::reduce`].

use crate::errors::*;
use std::fmt;
use std::io;

/// A capability the privilege switcher cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    /// `CAP_SYS_CHROOT`
    SysChroot,
    /// `CAP_SETGID`
    SetGid,
    /// `CAP_SETUID`
    SetUid,
    /// `CAP_DAC_READ_SEARCH`
    DacReadSearch,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::SysChroot,
        Capability::SetGid,
        Capability::SetUid,
        Capability::DacReadSearch,
    ];

    /// Kernel capability number
    pub fn number(self) -> u32 {
        match self {
            Capability::DacReadSearch => 2,
            Capability::SetGid => 6,
            Capability::SetUid => 7,
            Capability::SysChroot => 18,
        }
    }

    fn bit(self) -> u32 {
        1 << self.number()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::SysChroot => "CAP_SYS_CHROOT",
            Capability::SetGid => "CAP_SETGID",
            Capability::SetUid => "CAP_SETUID",
            Capability::DacReadSearch => "CAP_DAC_READ_SEARCH",
        })
    }
}

/// What the process can do right now, read from the effective set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrivilegeSnapshot {
    pub can_chroot: bool,
    pub can_setuid: bool,
    pub can_setgid: bool,
    pub can_bypass_read_checks: bool,
}

impl PrivilegeSnapshot {
    pub fn everything() -> Self {
        PrivilegeSnapshot {
            can_chroot: true,
            can_setuid: true,
            can_setgid: true,
            can_bypass_read_checks: true,
        }
    }

    pub fn has(&self, cap: Capability) -> bool {
        match cap {
            Capability::SysChroot => self.can_chroot,
            Capability::SetUid => self.can_setuid,
            Capability::SetGid => self.can_setgid,
            Capability::DacReadSearch => self.can_bypass_read_checks,
        }
    }

    fn from_mask(mask: u32) -> Self {
        PrivilegeSnapshot {
            can_chroot: mask & Capability::SysChroot.bit() != 0,
            can_setuid: mask & Capability::SetUid.bit() != 0,
            can_setgid: mask & Capability::SetGid.bit() != 0,
            can_bypass_read_checks: mask & Capability::DacReadSearch.bit() != 0,
        }
    }
}

/// Capabilities to keep when reducing; everything else is dropped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    caps: Vec<Capability>,
}

impl AllowList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability, keeping insertion order and ignoring duplicates
    pub fn insert(&mut self, cap: Capability) -> &mut Self {
        if !self.caps.contains(&cap) {
            self.caps.push(cap);
        }
        self
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.caps.contains(&cap)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.caps.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.caps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.caps.is_empty()
    }

    fn mask(&self) -> u32 {
        self.caps.iter().fold(0, |m, cap| m | cap.bit())
    }

    /// Build an allow-list from what the caller wants and what the process holds.
    ///
    /// Wanted capabilities the snapshot does not report are never added; the
    /// required ones among them are returned so the caller can decide
    /// whether that is fatal.
    pub fn derive(snapshot: &PrivilegeSnapshot, wanted: &[CapabilityRequest]) -> Derivation {
        let mut allow = AllowList::new();
        let mut missing = Vec::new();
        for req in wanted {
            if snapshot.has(req.cap) {
                allow.insert(req.cap);
            } else if req.required && !missing.contains(&req.cap) {
                missing.push(req.cap);
            }
        }
        Derivation { allow, missing }
    }
}

impl fmt::Display for AllowList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.caps.is_empty() {
            return f.write_str("(none)");
        }
        let names: Vec<String> = self.caps.iter().map(|c| c.to_string()).collect();
        f.write_str(&names.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityRequest {
    pub cap: Capability,
    pub required: bool,
}

impl CapabilityRequest {
    pub fn required(cap: Capability) -> Self {
        CapabilityRequest {
            cap,
            required: true,
        }
    }

    pub fn optional(cap: Capability) -> Self {
        CapabilityRequest {
            cap,
            required: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivation {
    pub allow: AllowList,
    /// Required capabilities the process does not hold
    pub missing: Vec<Capability>,
}

/// A way of reading and narrowing the process capability sets
pub trait CapabilityBackend {
    /// Read the effective set
    fn inspect(&self) -> Result<PrivilegeSnapshot>;

    /// Set effective and permitted to exactly `allow`, in one step, and keep
    /// anything else from coming back through execve()
    fn reduce(&self, allow: &AllowList) -> Result<()>;

    /// Whether a reduction is actually enforced by the kernel
    fn enforces(&self) -> bool;

    fn name(&self) -> &'static str;
}

/// Pick the capability backend for this platform, once.
///
/// The UID heuristic is only used when explicitly allowed; otherwise a
/// platform without a capability mechanism gets [`Unavailable`], which
/// fails every call.
pub fn detect_capabilities(allow_uid_heuristic: bool) -> Box<dyn CapabilityBackend> {
    match KernelCapabilities::detect() {
        Ok(kernel) => Box::new(kernel),
        Err(e) if allow_uid_heuristic => {
            log::warn!(
                "Kernel capabilities unavailable ({}), falling back to the UID heuristic; \
                 this approximation is not a security boundary",
                e
            );
            Box::new(UidHeuristic)
        }
        Err(e) => {
            log::debug!("Kernel capabilities unavailable: {}", e);
            Box::new(Unavailable { errno: e.raw_os_error() })
        }
    }
}

/// Linux `capget(2)`/`capset(2)`
#[derive(Debug, Clone, Copy)]
pub struct KernelCapabilities {
    _detected: (),
}

impl KernelCapabilities {
    pub fn detect() -> io::Result<Self> {
        sys::capget()?;
        Ok(KernelCapabilities { _detected: () })
    }
}

impl CapabilityBackend for KernelCapabilities {
    fn inspect(&self) -> Result<PrivilegeSnapshot> {
        let sets = sys::capget()
            .map_err(|e| PrivSwapError::io(ErrorKind::CapabilityQuery, "capget()", e))?;
        Ok(PrivilegeSnapshot::from_mask(sets.effective))
    }

    fn reduce(&self, allow: &AllowList) -> Result<()> {
        let mask = allow.mask();
        // bounding first: dropping from it needs CAP_SETPCAP, which capset removes
        let dropped = sys::shrink_bounding_set(mask)
            .map_err(|e| PrivSwapError::io(ErrorKind::CapabilityReduction, "prctl(PR_CAPBSET_DROP)", e))?;
        if dropped > 0 {
            log::debug!("Dropped {} capabilities from the bounding set", dropped);
        }
        if let Err(e) = sys::clear_ambient() {
            log::debug!("Could not clear ambient capabilities: {}", e);
        }
        sys::capset(mask, mask)
            .map_err(|e| PrivSwapError::io(ErrorKind::CapabilityReduction, "capset()", e))?;
        log::info!("Reduced capabilities to {}", allow);
        Ok(())
    }

    fn enforces(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "kernel"
    }
}

/// Effective UID 0 means every capability, anything else means none.
///
/// Mandatory access control can make both answers wrong, and reductions are
/// not enforced at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct UidHeuristic;

impl CapabilityBackend for UidHeuristic {
    fn inspect(&self) -> Result<PrivilegeSnapshot> {
        if nix::unistd::geteuid().is_root() {
            Ok(PrivilegeSnapshot::everything())
        } else {
            Ok(PrivilegeSnapshot::default())
        }
    }

    fn reduce(&self, allow: &AllowList) -> Result<()> {
        log::warn!(
            "Cannot restrict capabilities to {} on this platform; the process keeps full root privileges",
            allow
        );
        Ok(())
    }

    fn enforces(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "uid-heuristic"
    }
}

/// No capability mechanism and no permission to guess
#[derive(Debug, Clone, Copy)]
pub struct Unavailable {
    errno: Option<i32>,
}

impl Unavailable {
    fn error(&self, kind: ErrorKind, call: &str) -> PrivSwapError {
        let source = match self.errno {
            Some(errno) => io::Error::from_raw_os_error(errno),
            None => io::Error::new(io::ErrorKind::Unsupported, "no capability support"),
        };
        PrivSwapError::io(
            kind,
            format!("{} (enable allow_uid_heuristic to fall back to the effective UID)", call),
            source,
        )
    }
}

impl CapabilityBackend for Unavailable {
    fn inspect(&self) -> Result<PrivilegeSnapshot> {
        Err(self.error(ErrorKind::CapabilityQuery, "capget()"))
    }

    fn reduce(&self, _allow: &AllowList) -> Result<()> {
        Err(self.error(ErrorKind::CapabilityReduction, "capset()"))
    }

    fn enforces(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "unavailable"
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod sys {
    use std::io;

    const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;
    const PR_CAPBSET_READ: libc::c_int = 23;
    const PR_CAPBSET_DROP: libc::c_int = 24;
    const PR_CAP_AMBIENT: libc::c_int = 47;
    const PR_CAP_AMBIENT_CLEAR_ALL: libc::c_int = 4;
    const CAP_SETPCAP: u32 = 8;
    const DEFAULT_LAST_CAP: u32 = 40;

    #[repr(C)]
    struct CapUserHeader {
        version: u32,
        pid: libc::c_int,
    }

    #[repr(C)]
    #[derive(Default, Clone, Copy)]
    struct CapUserData {
        effective: u32,
        permitted: u32,
        inheritable: u32,
    }

    /// Capabilities 0-31; none of ours live in the upper word.
    pub struct LowSets {
        pub effective: u32,
        #[allow(dead_code)]
        pub permitted: u32,
    }

    pub fn capget() -> io::Result<LowSets> {
        let mut header = CapUserHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let mut data = [CapUserData::default(); 2];
        // SAFETY: version 3 header for the calling thread, two data entries as
        // the kernel expects for that version.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_capget,
                &mut header as *mut CapUserHeader,
                data.as_mut_ptr(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(LowSets {
            effective: data[0].effective,
            permitted: data[0].permitted,
        })
    }

    pub fn capset(effective: u32, permitted: u32) -> io::Result<()> {
        let header = CapUserHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let data = [
            CapUserData {
                effective,
                permitted,
                inheritable: 0,
            },
            CapUserData::default(),
        ];
        // SAFETY: as above; effective and permitted are written by one call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_capset,
                &header as *const CapUserHeader,
                data.as_ptr(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn last_cap() -> u32 {
        std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_LAST_CAP)
    }

    fn in_bounding_set(cap: u32) -> io::Result<bool> {
        // SAFETY: PR_CAPBSET_READ only reads the calling thread's bounding set.
        let rc = unsafe {
            libc::prctl(PR_CAPBSET_READ, cap as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong)
        };
        match rc {
            0 => Ok(false),
            1 => Ok(true),
            _ => {
                let err = io::Error::last_os_error();
                // past the last capability this kernel knows
                if err.raw_os_error() == Some(libc::EINVAL) {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Remove every capability outside `keep` from the bounding set, so an
    /// execve() as UID 0 cannot bring it back. Returns how many were removed.
    ///
    /// Without CAP_SETPCAP nothing can be removed. That is only accepted
    /// when no UID of the process is 0.
    pub fn shrink_bounding_set(keep: u32) -> io::Result<usize> {
        let mut pending = Vec::new();
        for cap in 0..=last_cap() {
            let kept = cap < 32 && keep & (1 << cap) != 0;
            if !kept && in_bounding_set(cap)? {
                pending.push(cap);
            }
        }
        if pending.is_empty() {
            return Ok(0);
        }
        if capget()?.effective & (1 << CAP_SETPCAP) == 0 {
            let mut uids: [libc::uid_t; 3] = [0; 3];
            // SAFETY: three valid out-pointers.
            let rc = unsafe { libc::getresuid(&mut uids[0], &mut uids[1], &mut uids[2]) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
            if uids.contains(&0) {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "CAP_SETPCAP is needed to shrink the bounding set of a root process",
                ));
            }
            return Ok(0);
        }
        for &cap in &pending {
            // SAFETY: PR_CAPBSET_DROP on the calling thread with a valid number.
            let rc = unsafe {
                libc::prctl(PR_CAPBSET_DROP, cap as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong, 0 as libc::c_ulong)
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(pending.len())
    }

    pub fn clear_ambient() -> io::Result<()> {
        // SAFETY: clearing the ambient set needs no privilege and takes no pointers.
        let rc = unsafe {
            libc::prctl(
                PR_CAP_AMBIENT,
                PR_CAP_AMBIENT_CLEAR_ALL as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod sys {
    use std::io;

    pub struct LowSets {
        pub effective: u32,
        #[allow(dead_code)]
        pub permitted: u32,
    }

    pub fn capget() -> io::Result<LowSets> {
        Err(io::Error::from_raw_os_error(libc::ENOSYS))
    }

    pub fn capset(_effective: u32, _permitted: u32) -> io::Result<()> {
        Err(io::Error::from_raw_os_error(libc::ENOSYS))
    }

    pub fn shrink_bounding_set(_keep: u32) -> io::Result<usize> {
        Err(io::Error::from_raw_os_error(libc::ENOSYS))
    }

    pub fn clear_ambient() -> io::Result<()> {
        Ok(())
    }
}
