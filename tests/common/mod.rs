#![allow(dead_code)]

use privswap::reexports::nix::{
    self,
    unistd::{Gid, Uid},
};
use privswap::*;
use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io;
use std::path::Path;
use std::rc::Rc;

/// UID/GID triples with the kernel's permission rules for unprivileged callers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ids {
    pub uid: [u32; 3],
    pub gid: [u32; 3],
    pub groups: Vec<u32>,
}

#[derive(Clone)]
pub struct FakeCredentials {
    pub ids: Rc<RefCell<Ids>>,
    pub refuse_uid: Rc<Cell<Option<u32>>>,
    pub saved_ids: bool,
}

impl FakeCredentials {
    pub fn root() -> Self {
        FakeCredentials {
            ids: Rc::new(RefCell::new(Ids {
                uid: [0, 0, 0],
                gid: [0, 0, 0],
                groups: vec![0, 1, 2],
            })),
            refuse_uid: Rc::new(Cell::new(None)),
            saved_ids: true,
        }
    }

    pub fn without_saved_ids(mut self) -> Self {
        self.saved_ids = false;
        self
    }

    pub fn snapshot(&self) -> Ids {
        self.ids.borrow().clone()
    }

    fn privileged(&self) -> bool {
        self.ids.borrow().uid[1] == 0
    }
}

fn permitted(current: &[u32; 3], wanted: &[Option<u32>]) -> bool {
    wanted
        .iter()
        .flatten()
        .all(|id| current.contains(id))
}

impl Credentials for FakeCredentials {
    fn getresuid(&self) -> nix::Result<UserIds> {
        let ids = self.ids.borrow();
        Ok(UserIds {
            real: Uid::from_raw(ids.uid[0]),
            effective: Uid::from_raw(ids.uid[1]),
            saved: Uid::from_raw(ids.uid[2]),
        })
    }

    fn getresgid(&self) -> nix::Result<GroupIds> {
        let ids = self.ids.borrow();
        Ok(GroupIds {
            real: Gid::from_raw(ids.gid[0]),
            effective: Gid::from_raw(ids.gid[1]),
            saved: Gid::from_raw(ids.gid[2]),
        })
    }

    fn setresuid(&self, real: Uid, effective: Uid, saved: Option<Uid>) -> nix::Result<()> {
        if !self.saved_ids {
            return Err(nix::Error::ENOSYS);
        }
        if self.refuse_uid.get() == Some(effective.as_raw()) {
            return Err(nix::Error::EAGAIN);
        }
        let wanted = [Some(real.as_raw()), Some(effective.as_raw()), saved.map(Uid::as_raw)];
        let mut ids = self.ids.borrow_mut();
        if ids.uid[1] != 0 && !permitted(&ids.uid, &wanted) {
            return Err(nix::Error::EPERM);
        }
        ids.uid[0] = real.as_raw();
        ids.uid[1] = effective.as_raw();
        if let Some(saved) = saved {
            ids.uid[2] = saved.as_raw();
        }
        Ok(())
    }

    fn setresgid(&self, real: Gid, effective: Gid, saved: Option<Gid>) -> nix::Result<()> {
        if !self.saved_ids {
            return Err(nix::Error::ENOSYS);
        }
        let privileged = self.privileged();
        let wanted = [Some(real.as_raw()), Some(effective.as_raw()), saved.map(Gid::as_raw)];
        let mut ids = self.ids.borrow_mut();
        if !privileged && !permitted(&ids.gid, &wanted) {
            return Err(nix::Error::EPERM);
        }
        ids.gid[0] = real.as_raw();
        ids.gid[1] = effective.as_raw();
        if let Some(saved) = saved {
            ids.gid[2] = saved.as_raw();
        }
        Ok(())
    }

    fn setuid(&self, uid: Uid) -> nix::Result<()> {
        if self.refuse_uid.get() == Some(uid.as_raw()) {
            return Err(nix::Error::EAGAIN);
        }
        let mut ids = self.ids.borrow_mut();
        let uid = uid.as_raw();
        if ids.uid[1] == 0 {
            ids.uid = [uid, uid, uid];
        } else if uid == ids.uid[0] || uid == ids.uid[2] {
            ids.uid[1] = uid;
        } else {
            return Err(nix::Error::EPERM);
        }
        Ok(())
    }

    fn setgid(&self, gid: Gid) -> nix::Result<()> {
        let privileged = self.privileged();
        let mut ids = self.ids.borrow_mut();
        let gid = gid.as_raw();
        if privileged {
            ids.gid = [gid, gid, gid];
        } else if gid == ids.gid[0] || gid == ids.gid[2] {
            ids.gid[1] = gid;
        } else {
            return Err(nix::Error::EPERM);
        }
        Ok(())
    }

    fn clear_groups(&self) -> nix::Result<()> {
        if !self.privileged() {
            return Err(nix::Error::EPERM);
        }
        self.ids.borrow_mut().groups.clear();
        Ok(())
    }

    fn supports_saved_ids(&self) -> bool {
        self.saved_ids
    }
}

#[derive(Clone)]
pub struct FakeCapabilities {
    pub held: Rc<Cell<PrivilegeSnapshot>>,
    pub reductions: Rc<RefCell<Vec<AllowList>>>,
    pub fail_inspect: bool,
}

impl FakeCapabilities {
    pub fn full() -> Self {
        Self::holding(PrivilegeSnapshot::everything())
    }

    pub fn holding(held: PrivilegeSnapshot) -> Self {
        FakeCapabilities {
            held: Rc::new(Cell::new(held)),
            reductions: Rc::new(RefCell::new(Vec::new())),
            fail_inspect: false,
        }
    }

    pub fn broken() -> Self {
        FakeCapabilities {
            fail_inspect: true,
            ..Self::full()
        }
    }

    pub fn last_reduction(&self) -> Option<AllowList> {
        self.reductions.borrow().last().cloned()
    }
}

impl CapabilityBackend for FakeCapabilities {
    fn inspect(&self) -> Result<PrivilegeSnapshot> {
        if self.fail_inspect {
            return Err(PrivSwapError::sys(ErrorKind::CapabilityQuery, "capget()", nix::Error::EPERM));
        }
        Ok(self.held.get())
    }

    fn reduce(&self, allow: &AllowList) -> Result<()> {
        let held = self.held.get();
        let mut kept = PrivilegeSnapshot::default();
        for cap in allow.iter() {
            if !held.has(cap) {
                return Err(PrivSwapError::sys(ErrorKind::CapabilityReduction, "capset()", nix::Error::EPERM));
            }
            match cap {
                Capability::SysChroot => kept.can_chroot = true,
                Capability::SetUid => kept.can_setuid = true,
                Capability::SetGid => kept.can_setgid = true,
                Capability::DacReadSearch => kept.can_bypass_read_checks = true,
            }
        }
        self.held.set(kept);
        self.reductions.borrow_mut().push(allow.clone());
        Ok(())
    }

    fn enforces(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Records every call; directories all resolve to one scratch directory
#[derive(Clone)]
pub struct FakeRootFilesystem {
    pub calls: Rc<RefCell<Vec<String>>>,
    pub refuse_chroot: Rc<Cell<bool>>,
    scratch: Rc<tempfile::TempDir>,
}

impl FakeRootFilesystem {
    pub fn new() -> Self {
        FakeRootFilesystem {
            calls: Rc::new(RefCell::new(Vec::new())),
            refuse_chroot: Rc::new(Cell::new(false)),
            scratch: Rc::new(tempfile::tempdir().unwrap()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }

    fn record(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }
}

impl RootFilesystem for FakeRootFilesystem {
    fn open_dir(&self, path: &Path) -> io::Result<File> {
        self.record(format!("open({})", path.display()));
        File::open(self.scratch.path())
    }

    fn chdir(&self, path: &Path) -> nix::Result<()> {
        self.record(format!("chdir({})", path.display()));
        Ok(())
    }

    fn chroot(&self, path: &Path) -> nix::Result<()> {
        self.record(format!("chroot({})", path.display()));
        if self.refuse_chroot.get() {
            return Err(nix::Error::EPERM);
        }
        Ok(())
    }

    fn fchdir(&self, _dir: &File) -> nix::Result<()> {
        self.record("fchdir".to_string());
        Ok(())
    }

    fn preload(&self) {
        self.record("preload".to_string());
    }
}

pub struct Harness {
    pub caps: FakeCapabilities,
    pub creds: FakeCredentials,
    pub fs: FakeRootFilesystem,
    pub diag: Rc<Recorder>,
}

impl Harness {
    pub fn new() -> Self {
        Harness {
            caps: FakeCapabilities::full(),
            creds: FakeCredentials::root(),
            fs: FakeRootFilesystem::new(),
            diag: Rc::new(Recorder::new()),
        }
    }

    pub fn controller(&self, config: Config) -> Controller<Rc<Recorder>> {
        let platform = Platform::new(
            Box::new(self.caps.clone()),
            Box::new(self.creds.clone()),
            Box::new(self.fs.clone()),
        );
        Controller::new(config, platform, self.diag.clone())
    }
}

/// Site defaults that never collide with root or the nobody sentinel
pub fn site_config() -> Config {
    Config::default().default_ids(1000, 1001)
}

pub fn site() -> TargetIdentity {
    TargetIdentity::new(1000, 1001)
}
