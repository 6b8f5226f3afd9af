//! Filesystem root confinement.
//!
//! A global chroot happens once and is never undone. A per-request chroot
//! is undone through a descriptor to the real root opened before the first
//! chroot of the process; without it there is no way back out.

use crate::errors::*;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Primitive filesystem calls used for confinement
pub trait RootFilesystem {
    fn open_dir(&self, path: &Path) -> io::Result<File>;
    fn chdir(&self, path: &Path) -> nix::Result<()>;
    fn chroot(&self, path: &Path) -> nix::Result<()>;
    fn fchdir(&self, dir: &File) -> nix::Result<()>;

    /// Load whatever libc reads lazily from the filesystem, before it
    /// becomes unreachable
    fn preload(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRootFilesystem;

impl RootFilesystem for SystemRootFilesystem {
    fn open_dir(&self, path: &Path) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY)
            .open(path)
    }

    fn chdir(&self, path: &Path) -> nix::Result<()> {
        log::debug!("chdir({})", path.display());
        nix::unistd::chdir(path)
    }

    fn chroot(&self, path: &Path) -> nix::Result<()> {
        log::debug!("chroot({})", path.display());
        nix::unistd::chroot(path)
    }

    fn fchdir(&self, dir: &File) -> nix::Result<()> {
        nix::unistd::fchdir(dir.as_raw_fd())
    }

    fn preload(&self) {
        let c_locale = b"C\0".as_ptr() as *const libc::c_char;
        // SAFETY: called before any thread of ours reads the locale; all
        // pointers are valid NUL-terminated strings or live stack values.
        unsafe {
            libc::strerror(1);
            libc::setlocale(libc::LC_CTYPE, c_locale);
            libc::setlocale(libc::LC_COLLATE, c_locale);
            let mut now: libc::time_t = 0;
            libc::time(&mut now);
            libc::localtime(&now);
        }
    }
}

/// Root confinement state of one worker
#[derive(Debug, Default)]
pub struct RootConfinement {
    global: Option<PathBuf>,
    per_request: Option<PathBuf>,
    per_request_enabled: bool,
    true_root: Option<File>,
    saved_cwd: Option<File>,
    chrooted: Option<PathBuf>,
}

fn require_absolute(path: &Path) -> Result<()> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(PrivSwapError::new(
            ErrorKind::Confinement,
            format!("chroot path must be absolute: {}", path.display()),
        ))
    }
}

impl RootConfinement {
    pub fn new(global: Option<PathBuf>, per_request: Option<PathBuf>, per_request_enabled: bool) -> Self {
        RootConfinement {
            global,
            per_request,
            per_request_enabled,
            ..Default::default()
        }
    }

    pub fn global_path(&self) -> Option<&Path> {
        self.global.as_deref()
    }

    pub fn per_request_path(&self) -> Option<&Path> {
        self.per_request.as_deref()
    }

    pub fn per_request_enabled(&self) -> bool {
        self.per_request_enabled
    }

    pub fn disable_per_request(&mut self) {
        self.per_request_enabled = false;
    }

    /// Open the descriptor to the real root, if per-request confinement needs it.
    ///
    /// Must run before the first chroot of the process.
    pub fn prepare(&mut self, fs: &dyn RootFilesystem) -> Result<()> {
        if !self.per_request_enabled || self.true_root.is_some() {
            return Ok(());
        }
        let root = fs
            .open_dir(Path::new("/"))
            .map_err(|e| PrivSwapError::io(ErrorKind::Confinement, "open(\"/\", O_RDONLY)", e))?;
        self.true_root = Some(root);
        Ok(())
    }

    /// Whole-process chroot. Never reversed.
    pub fn confine(&self, fs: &dyn RootFilesystem, path: &Path) -> Result<()> {
        require_absolute(path)?;
        fs.preload();
        enter(fs, path)?;
        log::info!("Confined process to {}", path.display());
        Ok(())
    }

    /// Chroot for the current request, reversible with [`reverse_current_request`].
    ///
    /// [`reverse_current_request`]: RootConfinement::reverse_current_request
    pub fn confine_current_request(&mut self, fs: &dyn RootFilesystem, path: &Path) -> Result<()> {
        require_absolute(path)?;
        if self.chrooted.is_some() {
            return Err(PrivSwapError::new(
                ErrorKind::Confinement,
                "request is already confined",
            ));
        }
        if self.true_root.is_none() {
            return Err(PrivSwapError::new(
                ErrorKind::Confinement,
                "no descriptor to the real root, per-request chroot cannot be undone",
            ));
        }
        let cwd = fs
            .open_dir(Path::new("."))
            .map_err(|e| PrivSwapError::io(ErrorKind::Confinement, "open(\".\", O_RDONLY)", e))?;
        if let Err(e) = enter(fs, path) {
            // chdir() may have succeeded before chroot() failed
            if let Err(back) = fs.fchdir(&cwd) {
                log::error!("Could not return to the previous working directory: {}", back);
            }
            return Err(e);
        }
        self.saved_cwd = Some(cwd);
        self.chrooted = Some(path.to_owned());
        log::debug!("Confined request to {}", path.display());
        Ok(())
    }

    /// Leave the per-request chroot and go back to the previous working directory
    pub fn reverse_current_request(&mut self, fs: &dyn RootFilesystem) -> Result<()> {
        let root = match self.chrooted.take() {
            Some(root) => root,
            None => return Ok(()),
        };
        let saved_cwd = self.saved_cwd.take();
        let true_root = self.true_root.as_ref().ok_or_else(|| {
            PrivSwapError::new(ErrorKind::Confinement, "descriptor to the real root is gone")
        })?;
        fs.fchdir(true_root)
            .map_err(|e| PrivSwapError::sys(ErrorKind::Confinement, "fchdir(root)", e))?;
        fs.chroot(Path::new("."))
            .map_err(|e| PrivSwapError::sys(ErrorKind::Confinement, "chroot(\".\")", e))?;
        if let Some(cwd) = saved_cwd {
            fs.fchdir(&cwd)
                .map_err(|e| PrivSwapError::sys(ErrorKind::Confinement, "fchdir(cwd)", e))?;
        }
        log::debug!("Left per-request root {}", root.display());
        Ok(())
    }

    /// Stay in the current request root for the rest of the process
    pub fn forget_current_request(&mut self) {
        self.saved_cwd = None;
        if let Some(root) = self.chrooted.take() {
            log::debug!("Per-request root {} kept for the life of the process", root.display());
        }
    }

    pub fn is_chrooted(&self) -> bool {
        self.chrooted.is_some()
    }

    /// The root the current request is confined to
    pub fn current_root(&self) -> Option<&Path> {
        self.chrooted.as_deref()
    }

    pub fn holds_root_descriptor(&self) -> bool {
        self.true_root.is_some()
    }

    /// Close the descriptor to the real root
    pub fn close(&mut self) {
        if self.true_root.take().is_some() {
            log::debug!("Closed descriptor to the real root");
        }
    }
}

/// chdir() into `path` first, then chroot() to where we are, so a swapped
/// symlink cannot make the two calls see different directories
fn enter(fs: &dyn RootFilesystem, path: &Path) -> Result<()> {
    fs.chdir(path)
        .map_err(|e| PrivSwapError::sys(ErrorKind::Confinement, format!("chdir({})", path.display()), e))?;
    fs.chroot(Path::new("."))
        .map_err(|e| PrivSwapError::sys(ErrorKind::Confinement, format!("chroot({})", path.display()), e))?;
    Ok(())
}

/// Express `path` as seen from inside `root`.
///
/// Returns `None` when `path` lies outside `root` and so cannot be reached
/// after confinement.
pub fn rebase(path: &Path, root: &Path) -> Option<PathBuf> {
    let rest = path.strip_prefix(root).ok()?;
    Some(Path::new("/").join(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebase_strips_the_new_root() {
        assert_eq!(
            rebase(Path::new("/srv/site/htdocs/index.php"), Path::new("/srv/site")),
            Some(PathBuf::from("/htdocs/index.php"))
        );
        assert_eq!(
            rebase(Path::new("/srv/site"), Path::new("/srv/site")),
            Some(PathBuf::from("/"))
        );
    }

    #[test]
    fn rebase_refuses_paths_outside_the_root() {
        assert_eq!(rebase(Path::new("/var/www"), Path::new("/srv/site")), None);
        // component-wise, not string prefix
        assert_eq!(rebase(Path::new("/srv/site2/x"), Path::new("/srv/site")), None);
    }

    #[test]
    fn relative_paths_are_rejected_before_any_call() {
        let mut c = RootConfinement::new(None, None, true);
        let err = c
            .confine(&SystemRootFilesystem, Path::new("srv/jail"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Confinement);
        let err = c
            .confine_current_request(&SystemRootFilesystem, Path::new("jail"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Confinement);
    }

    #[test]
    fn prepare_opens_root_only_when_needed() {
        let mut off = RootConfinement::new(None, None, false);
        off.prepare(&SystemRootFilesystem).unwrap();
        assert!(!off.holds_root_descriptor());

        let mut on = RootConfinement::new(None, Some(PathBuf::from("/srv")), true);
        on.prepare(&SystemRootFilesystem).unwrap();
        assert!(on.holds_root_descriptor());
        on.close();
        assert!(!on.holds_root_descriptor());
    }

    #[test]
    fn per_request_without_descriptor_is_refused() {
        let mut c = RootConfinement::new(None, None, true);
        let err = c
            .confine_current_request(&SystemRootFilesystem, Path::new("/srv"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Confinement);
        assert!(!c.is_chrooted());
    }

    #[test]
    fn reverse_without_confinement_is_a_no_op() {
        let mut c = RootConfinement::new(None, None, true);
        c.reverse_current_request(&SystemRootFilesystem).unwrap();
    }
}
