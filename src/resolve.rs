//! Which UID/GID a request runs as.

use crate::diagnostics::{Diagnostics, Severity};
use nix::unistd::{Gid, Uid, User};
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Configured UID that stands for "the platform's nobody user"
pub const NOBODY_SENTINEL: u32 = 65534;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetIdentity {
    pub uid: Uid,
    pub gid: Gid,
}

impl TargetIdentity {
    pub fn new(uid: u32, gid: u32) -> Self {
        TargetIdentity {
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
        }
    }
}

/// Resolves target identities.
///
/// The `nobody` entry is looked up once, when the resolver is built, so the
/// password database does not need to be reachable after a chroot.
#[derive(Debug, Clone, Copy)]
pub struct IdentityResolver {
    nobody: TargetIdentity,
}

impl IdentityResolver {
    pub fn from_system(diag: &dyn Diagnostics) -> Self {
        let fallback = TargetIdentity::new(NOBODY_SENTINEL, NOBODY_SENTINEL);
        let nobody = match User::from_name("nobody") {
            Ok(Some(user)) => TargetIdentity {
                uid: user.uid,
                gid: user.gid,
            },
            Ok(None) => {
                diag.report(Severity::Warning, "getpwnam(nobody): no such user");
                fallback
            }
            Err(e) => {
                diag.report(Severity::Warning, &format!("getpwnam(nobody) failed: {}", e));
                fallback
            }
        };
        IdentityResolver { nobody }
    }

    pub fn with_nobody(nobody: TargetIdentity) -> Self {
        IdentityResolver { nobody }
    }

    pub fn nobody(&self) -> TargetIdentity {
        self.nobody
    }

    /// The configured default, with the sentinel UID mapped to `nobody`.
    ///
    /// Under `never_root`, zero components fall back to `nobody` as well.
    pub fn default_identity(&self, default_uid: u32, default_gid: u32, never_root: bool) -> TargetIdentity {
        let id = if default_uid == NOBODY_SENTINEL {
            self.nobody
        } else {
            TargetIdentity::new(default_uid, default_gid)
        };
        if never_root {
            substitute_root(id, self.safe_nobody())
        } else {
            id
        }
    }

    /// Compute the identity for a request.
    ///
    /// The owner of `directory_hint` wins over the defaults when it can be
    /// stat()ed. Under `never_root` each zero component is replaced by the
    /// default independently. A failed stat() is only a warning.
    pub fn resolve(
        &self,
        default_uid: u32,
        default_gid: u32,
        directory_hint: Option<&Path>,
        never_root: bool,
        diag: &dyn Diagnostics,
    ) -> TargetIdentity {
        let default = self.default_identity(default_uid, default_gid, never_root);

        let dir = match directory_hint {
            Some(dir) if dir.as_os_str().is_empty() => Path::new("/"),
            Some(dir) => dir,
            None => {
                diag.report(Severity::Debug, "No directory hint, using the default identity");
                return default;
            }
        };

        let meta = match std::fs::metadata(dir) {
            Ok(meta) => meta,
            Err(e) => {
                diag.report(Severity::Warning, &format!("stat({}): {}", dir.display(), e));
                return default;
            }
        };

        let owner = TargetIdentity::new(meta.uid(), meta.gid());
        let id = if never_root {
            substitute_root(owner, default)
        } else {
            owner
        };
        diag.report(
            Severity::Debug,
            &format!("{} is owned by {}:{}, switching to {}:{}", dir.display(), meta.uid(), meta.gid(), id.uid, id.gid),
        );
        id
    }

    fn safe_nobody(&self) -> TargetIdentity {
        substitute_root(self.nobody, TargetIdentity::new(NOBODY_SENTINEL, NOBODY_SENTINEL))
    }
}

/// Replace each zero component of `id` with the matching one from `default`
fn substitute_root(id: TargetIdentity, default: TargetIdentity) -> TargetIdentity {
    TargetIdentity {
        uid: if id.uid.is_root() { default.uid } else { id.uid },
        gid: if id.gid.as_raw() == 0 { default.gid } else { id.gid },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Recorder;

    fn resolver() -> IdentityResolver {
        IdentityResolver::with_nobody(TargetIdentity::new(65000, 65001))
    }

    #[test]
    fn sentinel_maps_to_nobody_not_the_literal() {
        let rec = Recorder::new();
        let id = resolver().resolve(65534, 65534, None, true, &rec);
        assert_eq!(id, TargetIdentity::new(65000, 65001));
    }

    #[test]
    fn plain_defaults_are_used_as_is() {
        let rec = Recorder::new();
        let id = resolver().resolve(100, 200, None, true, &rec);
        assert_eq!(id, TargetIdentity::new(100, 200));
    }

    #[test]
    fn never_root_replaces_root_defaults() {
        let id = resolver().default_identity(0, 0, true);
        assert_eq!(id, TargetIdentity::new(65000, 65001));
        let id = resolver().default_identity(0, 0, false);
        assert_eq!(id, TargetIdentity::new(0, 0));
    }

    #[test]
    fn root_nobody_entry_is_never_used_under_never_root() {
        let r = IdentityResolver::with_nobody(TargetIdentity::new(0, 0));
        let id = r.default_identity(0, 0, true);
        assert_eq!(id, TargetIdentity::new(NOBODY_SENTINEL, NOBODY_SENTINEL));
    }

    #[test]
    fn directory_owner_wins() {
        let rec = Recorder::new();
        let dir = tempfile::tempdir().unwrap();
        let meta = std::fs::metadata(dir.path()).unwrap();
        let id = resolver().resolve(100, 200, Some(dir.path()), false, &rec);
        assert_eq!(id, TargetIdentity::new(meta.uid(), meta.gid()));
    }

    #[test]
    fn missing_directory_falls_back_with_warning() {
        let rec = Recorder::new();
        let id = resolver().resolve(100, 200, Some(Path::new("/nonexistent/docroot")), true, &rec);
        assert_eq!(id, TargetIdentity::new(100, 200));
        assert!(rec.contains(Severity::Warning, "stat(/nonexistent/docroot)"));
    }

    #[test]
    fn root_uid_owner_keeps_its_group() {
        let owner = TargetIdentity::new(0, 500);
        let default = TargetIdentity::new(100, 200);
        assert_eq!(substitute_root(owner, default), TargetIdentity::new(100, 500));
        assert_eq!(
            substitute_root(TargetIdentity::new(42, 0), default),
            TargetIdentity::new(42, 200)
        );
    }

    #[test]
    fn root_owned_directory_substitutes_components_independently() {
        // "/" is owned by root:root on any sane system
        let meta = std::fs::metadata("/").unwrap();
        if meta.uid() != 0 || meta.gid() != 0 {
            return;
        }
        let rec = Recorder::new();
        let id = resolver().resolve(100, 200, Some(Path::new("/")), true, &rec);
        assert_eq!(id, TargetIdentity::new(100, 200));

        let id = resolver().resolve(100, 200, Some(Path::new("/")), false, &rec);
        assert_eq!(id, TargetIdentity::new(0, 0));
    }

    #[test]
    fn empty_hint_means_filesystem_root() {
        let meta = std::fs::metadata("/").unwrap();
        let rec = Recorder::new();
        let id = resolver().resolve(100, 200, Some(Path::new("")), false, &rec);
        assert_eq!(id, TargetIdentity::new(meta.uid(), meta.gid()));
    }

    #[test]
    fn never_root_holds_for_any_inputs() {
        let rec = Recorder::new();
        let dir = tempfile::tempdir().unwrap();
        let hints: [Option<&Path>; 4] = [None, Some(Path::new("/")), Some(dir.path()), Some(Path::new("/nope"))];
        for &(du, dg) in &[(0, 0), (0, 7), (7, 0), (65534, 0), (100, 200)] {
            for hint in hints.iter() {
                let id = resolver().resolve(du, dg, *hint, true, &rec);
                assert!(!id.uid.is_root(), "uid 0 for defaults {}:{} hint {:?}", du, dg, hint);
                assert_ne!(id.gid.as_raw(), 0, "gid 0 for defaults {}:{} hint {:?}", du, dg, hint);
            }
        }
    }
}
