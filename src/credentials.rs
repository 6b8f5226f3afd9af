//! Process credentials: the primitive UID/GID calls and the identity
//! captured before any transition.

use crate::errors::*;
use nix::unistd::{Gid, Uid};

/// Real, effective and saved user IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserIds {
    pub real: Uid,
    pub effective: Uid,
    pub saved: Uid,
}

/// Real, effective and saved group IDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupIds {
    pub real: Gid,
    pub effective: Gid,
    pub saved: Gid,
}

/// Primitive credential system calls.
///
/// `saved: None` leaves the saved ID unchanged.
pub trait Credentials {
    fn getresuid(&self) -> nix::Result<UserIds>;
    fn getresgid(&self) -> nix::Result<GroupIds>;
    fn setresuid(&self, real: Uid, effective: Uid, saved: Option<Uid>) -> nix::Result<()>;
    fn setresgid(&self, real: Gid, effective: Gid, saved: Option<Gid>) -> nix::Result<()>;
    fn setuid(&self, uid: Uid) -> nix::Result<()>;
    fn setgid(&self, gid: Gid) -> nix::Result<()>;
    fn clear_groups(&self) -> nix::Result<()>;
    /// Whether real, effective and saved IDs can be set independently
    fn supports_saved_ids(&self) -> bool;
}

/// Real and effective IDs of the process before the first transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalIdentity {
    pub real_uid: Uid,
    pub effective_uid: Uid,
    pub real_gid: Gid,
    pub effective_gid: Gid,
}

impl OriginalIdentity {
    pub fn capture(creds: &dyn Credentials) -> Result<Self> {
        let uids = creds
            .getresuid()
            .map_err(|e| PrivSwapError::sys(ErrorKind::IdentityTransition, "getresuid()", e))?;
        let gids = creds
            .getresgid()
            .map_err(|e| PrivSwapError::sys(ErrorKind::IdentityTransition, "getresgid()", e))?;
        let original = OriginalIdentity {
            real_uid: uids.real,
            effective_uid: uids.effective,
            real_gid: gids.real,
            effective_gid: gids.effective,
        };
        log::debug!(
            "Captured original identity: uid={}/{}, gid={}/{}",
            original.real_uid,
            original.effective_uid,
            original.real_gid,
            original.effective_gid
        );
        Ok(original)
    }
}

/// Credentials of the running process
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCredentials;

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "openbsd"
))]
impl Credentials for SystemCredentials {
    fn getresuid(&self) -> nix::Result<UserIds> {
        let ids = nix::unistd::getresuid()?;
        Ok(UserIds {
            real: ids.real,
            effective: ids.effective,
            saved: ids.saved,
        })
    }

    fn getresgid(&self) -> nix::Result<GroupIds> {
        let ids = nix::unistd::getresgid()?;
        Ok(GroupIds {
            real: ids.real,
            effective: ids.effective,
            saved: ids.saved,
        })
    }

    fn setresuid(&self, real: Uid, effective: Uid, saved: Option<Uid>) -> nix::Result<()> {
        let saved = saved.unwrap_or_else(|| Uid::from_raw(libc::uid_t::MAX));
        log::debug!("setresuid({}, {}, {})", real, effective, saved);
        nix::unistd::setresuid(real, effective, saved)
    }

    fn setresgid(&self, real: Gid, effective: Gid, saved: Option<Gid>) -> nix::Result<()> {
        let saved = saved.unwrap_or_else(|| Gid::from_raw(libc::gid_t::MAX));
        log::debug!("setresgid({}, {}, {})", real, effective, saved);
        nix::unistd::setresgid(real, effective, saved)
    }

    fn setuid(&self, uid: Uid) -> nix::Result<()> {
        log::debug!("setuid({})", uid);
        nix::unistd::setuid(uid)
    }

    fn setgid(&self, gid: Gid) -> nix::Result<()> {
        log::debug!("setgid({})", gid);
        nix::unistd::setgid(gid)
    }

    fn clear_groups(&self) -> nix::Result<()> {
        log::debug!("setgroups([])");
        nix::unistd::setgroups(&[])
    }

    fn supports_saved_ids(&self) -> bool {
        true
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "openbsd"
)))]
impl Credentials for SystemCredentials {
    fn getresuid(&self) -> nix::Result<UserIds> {
        let effective = nix::unistd::geteuid();
        Ok(UserIds {
            real: nix::unistd::getuid(),
            effective,
            saved: effective,
        })
    }

    fn getresgid(&self) -> nix::Result<GroupIds> {
        let effective = nix::unistd::getegid();
        Ok(GroupIds {
            real: nix::unistd::getgid(),
            effective,
            saved: effective,
        })
    }

    fn setresuid(&self, _real: Uid, _effective: Uid, _saved: Option<Uid>) -> nix::Result<()> {
        Err(nix::Error::ENOSYS)
    }

    fn setresgid(&self, _real: Gid, _effective: Gid, _saved: Option<Gid>) -> nix::Result<()> {
        Err(nix::Error::ENOSYS)
    }

    fn setuid(&self, uid: Uid) -> nix::Result<()> {
        log::debug!("setuid({})", uid);
        nix::unistd::setuid(uid)
    }

    fn setgid(&self, gid: Gid) -> nix::Result<()> {
        log::debug!("setgid({})", gid);
        nix::unistd::setgid(gid)
    }

    fn clear_groups(&self) -> nix::Result<()> {
        // SAFETY: an empty list with a null pointer is valid for setgroups(2).
        if unsafe { libc::setgroups(0, std::ptr::null()) } != 0 {
            return Err(nix::Error::last());
        }
        Ok(())
    }

    fn supports_saved_ids(&self) -> bool {
        false
    }
}
