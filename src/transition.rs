//! UID/GID transition strategies.
//!
//! GID is always changed before UID, and restored after it: once the
//! effective UID is no longer 0 the GID can only be changed back through
//! the saved UID.

use crate::config::HostModel;
use crate::credentials::{Credentials, OriginalIdentity};
use crate::errors::*;
use crate::resolve::TargetIdentity;
use nix::unistd::{Gid, Uid};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionMode {
    /// Only the UID changes; the GID is left alone
    SetUidOnly,
    /// Real and effective UID and GID, saved IDs kept at 0
    SetResUid,
    /// `setgid()` + `setuid()`, all three IDs, no way back
    SetUidAndGid,
    /// Like `SetResUid`, and the supplementary groups are cleared
    SetResUidAndGid,
}

impl TransitionMode {
    /// Pick the mode for a host once, at startup.
    ///
    /// Reversible modes need a host that has an end-of-request hook, runs one
    /// request per process at a time, and a platform with saved IDs.
    pub fn select(host: HostModel, change_gid: bool, keep_groups: bool, saved_ids: bool) -> Self {
        let reversible = host.is_reversible() && saved_ids;
        match (reversible, change_gid) {
            (true, true) if keep_groups => TransitionMode::SetResUid,
            (true, true) => TransitionMode::SetResUidAndGid,
            (false, true) => TransitionMode::SetUidAndGid,
            (_, false) => TransitionMode::SetUidOnly,
        }
    }

    pub fn changes_gid(self) -> bool {
        !matches!(self, TransitionMode::SetUidOnly)
    }

    /// Build the strategy for this mode.
    ///
    /// `resettable` only matters for `SetUidOnly`: whether the saved UID
    /// keeps root so the change can be undone.
    pub fn strategy(self, resettable: bool) -> Box<dyn IdentityTransition> {
        match self {
            TransitionMode::SetUidOnly => Box::new(UidOnly { resettable }),
            TransitionMode::SetResUid => Box::new(ResIds { clear_groups: false }),
            TransitionMode::SetUidAndGid => Box::new(OneShot),
            TransitionMode::SetResUidAndGid => Box::new(ResIds { clear_groups: true }),
        }
    }
}

impl fmt::Display for TransitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransitionMode::SetUidOnly => "setuid-only",
            TransitionMode::SetResUid => "setresuid",
            TransitionMode::SetUidAndGid => "setuid+setgid",
            TransitionMode::SetResUidAndGid => "setresuid+setresgid",
        })
    }
}

/// One way of moving the process to a target identity and back
pub trait IdentityTransition {
    fn mode(&self) -> TransitionMode;

    fn is_reversible(&self) -> bool;

    fn apply(&self, creds: &dyn Credentials, target: TargetIdentity) -> Result<()>;

    /// Restore `original`. A no-op for irreversible strategies.
    fn reverse(&self, creds: &dyn Credentials, original: &OriginalIdentity) -> Result<()>;
}

fn root_uid() -> Uid {
    Uid::from_raw(0)
}

fn root_gid() -> Gid {
    Gid::from_raw(0)
}

fn clear_groups(creds: &dyn Credentials) -> Result<()> {
    creds
        .clear_groups()
        .map_err(|e| PrivSwapError::sys(ErrorKind::IdentityTransition, "setgroups([])", e))
}

fn set_res_gid(creds: &dyn Credentials, real: Gid, effective: Gid, saved: Option<Gid>) -> Result<()> {
    creds.setresgid(real, effective, saved).map_err(|e| {
        PrivSwapError::sys(
            ErrorKind::IdentityTransition,
            format!("setresgid({}, {}, {})", real, effective, fmt_saved(saved.map(Gid::as_raw))),
            e,
        )
    })
}

fn set_res_uid(creds: &dyn Credentials, real: Uid, effective: Uid, saved: Option<Uid>) -> Result<()> {
    creds.setresuid(real, effective, saved).map_err(|e| {
        PrivSwapError::sys(
            ErrorKind::IdentityTransition,
            format!("setresuid({}, {}, {})", real, effective, fmt_saved(saved.map(Uid::as_raw))),
            e,
        )
    })
}

fn fmt_saved(saved: Option<u32>) -> String {
    saved.map_or_else(|| "-1".to_string(), |s| s.to_string())
}

/// Read the IDs back and make sure the kernel did what we asked
fn verify(creds: &dyn Credentials, target: TargetIdentity, check_gid: bool) -> Result<()> {
    let uids = creds
        .getresuid()
        .map_err(|e| PrivSwapError::sys(ErrorKind::IdentityTransition, "getresuid()", e))?;
    if uids.real != target.uid || uids.effective != target.uid {
        return Err(PrivSwapError::new(
            ErrorKind::IdentityTransition,
            format!(
                "UID verification failed: expected {}, got real={}, effective={}",
                target.uid, uids.real, uids.effective
            ),
        ));
    }
    if check_gid {
        let gids = creds
            .getresgid()
            .map_err(|e| PrivSwapError::sys(ErrorKind::IdentityTransition, "getresgid()", e))?;
        if gids.real != target.gid || gids.effective != target.gid {
            return Err(PrivSwapError::new(
                ErrorKind::IdentityTransition,
                format!(
                    "GID verification failed: expected {}, got real={}, effective={}",
                    target.gid, gids.real, gids.effective
                ),
            ));
        }
    }
    Ok(())
}

struct UidOnly {
    resettable: bool,
}

impl IdentityTransition for UidOnly {
    fn mode(&self) -> TransitionMode {
        TransitionMode::SetUidOnly
    }

    fn is_reversible(&self) -> bool {
        self.resettable
    }

    fn apply(&self, creds: &dyn Credentials, target: TargetIdentity) -> Result<()> {
        if self.resettable {
            set_res_uid(creds, target.uid, target.uid, Some(root_uid()))?;
        } else {
            creds.setuid(target.uid).map_err(|e| {
                PrivSwapError::sys(ErrorKind::IdentityTransition, format!("setuid({})", target.uid), e)
            })?;
        }
        verify(creds, target, false)?;
        log::info!("Switched to UID {}", target.uid);
        Ok(())
    }

    fn reverse(&self, creds: &dyn Credentials, original: &OriginalIdentity) -> Result<()> {
        if !self.resettable {
            return Ok(());
        }
        set_res_uid(creds, original.real_uid, original.effective_uid, None)?;
        log::info!("Restored UID {}/{}", original.real_uid, original.effective_uid);
        Ok(())
    }
}

struct ResIds {
    clear_groups: bool,
}

impl IdentityTransition for ResIds {
    fn mode(&self) -> TransitionMode {
        if self.clear_groups {
            TransitionMode::SetResUidAndGid
        } else {
            TransitionMode::SetResUid
        }
    }

    fn is_reversible(&self) -> bool {
        true
    }

    fn apply(&self, creds: &dyn Credentials, target: TargetIdentity) -> Result<()> {
        if self.clear_groups {
            clear_groups(creds)?;
        }
        set_res_gid(creds, target.gid, target.gid, Some(root_gid()))?;
        set_res_uid(creds, target.uid, target.uid, Some(root_uid()))?;
        verify(creds, target, true)?;
        log::info!("Switched to UID {}, GID {}", target.uid, target.gid);
        Ok(())
    }

    fn reverse(&self, creds: &dyn Credentials, original: &OriginalIdentity) -> Result<()> {
        set_res_uid(creds, original.real_uid, original.effective_uid, None)?;
        set_res_gid(creds, original.real_gid, original.effective_gid, None)?;
        log::info!(
            "Restored UID {}/{}, GID {}/{}",
            original.real_uid,
            original.effective_uid,
            original.real_gid,
            original.effective_gid
        );
        Ok(())
    }
}

struct OneShot;

impl IdentityTransition for OneShot {
    fn mode(&self) -> TransitionMode {
        TransitionMode::SetUidAndGid
    }

    fn is_reversible(&self) -> bool {
        false
    }

    fn apply(&self, creds: &dyn Credentials, target: TargetIdentity) -> Result<()> {
        clear_groups(creds)?;
        creds.setgid(target.gid).map_err(|e| {
            PrivSwapError::sys(ErrorKind::IdentityTransition, format!("setgid({})", target.gid), e)
        })?;
        creds.setuid(target.uid).map_err(|e| {
            PrivSwapError::sys(ErrorKind::IdentityTransition, format!("setuid({})", target.uid), e)
        })?;
        verify(creds, target, true)?;
        log::info!("Dropped to UID {}, GID {} for the rest of the process", target.uid, target.gid);
        Ok(())
    }

    fn reverse(&self, _creds: &dyn Credentials, _original: &OriginalIdentity) -> Result<()> {
        Ok(())
    }
}
