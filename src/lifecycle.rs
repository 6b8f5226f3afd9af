//! The lifecycle controller: startup, request activation and deactivation.
//!
//! A [`Controller`] holds process-wide state (the original identity, the
//! active flag, the descriptor to the real root) and is neither `Send` nor
//! `Sync`. Keep one per worker; `&mut self` on every transition guarantees
//! that at most one request is active per instance.

use crate::caps::{
    detect_capabilities, AllowList, Capability, CapabilityBackend, CapabilityRequest, PrivilegeSnapshot,
};
use crate::config::{Config, HostModel};
use crate::confine::{rebase, RootConfinement, RootFilesystem, SystemRootFilesystem};
use crate::credentials::{Credentials, OriginalIdentity, SystemCredentials};
use crate::diagnostics::{Diagnostics, LogDiagnostics, Severity};
use crate::errors::*;
use crate::resolve::{IdentityResolver, TargetIdentity};
use crate::transition::{IdentityTransition, TransitionMode};
use nix::unistd::Gid;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    /// A request runs under a dropped identity that must be reversed
    Active,
    /// Shut down; no further requests
    Deactivated,
    /// Startup or a reversal failed; the host must stop serving
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Active => "active",
            LifecycleState::Deactivated => "deactivated",
            LifecycleState::Failed => "failed",
        })
    }
}

/// The system primitives a controller works with, chosen once
pub struct Platform {
    pub capabilities: Box<dyn CapabilityBackend>,
    pub credentials: Box<dyn Credentials>,
    pub filesystem: Box<dyn RootFilesystem>,
}

impl Platform {
    /// Bundle explicit implementations, e.g. for tests or custom hosts
    pub fn new(
        capabilities: Box<dyn CapabilityBackend>,
        credentials: Box<dyn Credentials>,
        filesystem: Box<dyn RootFilesystem>,
    ) -> Self {
        Platform {
            capabilities,
            credentials,
            filesystem,
        }
    }

    /// The running system
    pub fn detect(config: &Config) -> Self {
        Platform::new(
            detect_capabilities(config.allow_uid_heuristic),
            Box::new(SystemCredentials),
            Box::new(SystemRootFilesystem),
        )
    }
}

/// What the host knows about a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Its owner decides the identity of the request
    pub document_root: Option<PathBuf>,
    pub script_filename: Option<PathBuf>,
    /// Overrides the configured per-request chroot
    pub chroot_to: Option<PathBuf>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_root<T: AsRef<Path>>(mut self, path: T) -> Self {
        self.document_root = Some(path.as_ref().to_owned());
        self
    }

    pub fn script_filename<T: AsRef<Path>>(mut self, path: T) -> Self {
        self.script_filename = Some(path.as_ref().to_owned());
        self
    }

    pub fn chroot_to<T: AsRef<Path>>(mut self, path: T) -> Self {
        self.chroot_to = Some(path.as_ref().to_owned());
        self
    }
}

/// Outcome of a request activation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Activation {
    /// Identity the request runs as, if it was switched
    pub identity: Option<TargetIdentity>,
    /// Root the request is confined to, if any
    pub root: Option<PathBuf>,
    /// Request paths as seen from inside `root`
    pub document_root: Option<PathBuf>,
    pub script_filename: Option<PathBuf>,
}

impl Activation {
    fn untouched(ctx: &RequestContext) -> Self {
        Activation {
            identity: None,
            root: None,
            document_root: ctx.document_root.clone(),
            script_filename: ctx.script_filename.clone(),
        }
    }
}

/// Begin/end notifications from the host
pub trait RequestHooks {
    fn request_started(&mut self, ctx: &RequestContext) -> Result<Activation>;
    fn request_finished(&mut self) -> Result<()>;
}

/// Drives privilege switching for one worker through its whole life
pub struct Controller<D: Diagnostics = LogDiagnostics> {
    config: Config,
    platform: Platform,
    diag: D,
    state: LifecycleState,
    resolver: Option<IdentityResolver>,
    original: Option<OriginalIdentity>,
    strategy: Option<Box<dyn IdentityTransition>>,
    allow: AllowList,
    confinement: RootConfinement,
    transitions: bool,
    active: bool,
    dropped_for_life: bool,
}

impl Controller<LogDiagnostics> {
    /// Controller for the running system, reporting through `log`
    pub fn system(config: Config) -> Self {
        let platform = Platform::detect(&config);
        Controller::new(config, platform, LogDiagnostics)
    }
}

impl<D: Diagnostics> Controller<D> {
    /// A controller in [`LifecycleState::Uninitialized`]; nothing is touched yet
    pub fn new(config: Config, platform: Platform, diag: D) -> Self {
        let confinement = RootConfinement::new(
            config.global_chroot.clone(),
            config.chroot_to.clone(),
            config.enable_per_request_chroot,
        );
        Controller {
            config,
            platform,
            diag,
            state: LifecycleState::Uninitialized,
            resolver: None,
            original: None,
            strategy: None,
            allow: AllowList::new(),
            confinement,
            transitions: false,
            active: false,
            dropped_for_life: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> Option<TransitionMode> {
        self.strategy.as_ref().map(|s| s.mode())
    }

    pub fn original_identity(&self) -> Option<&OriginalIdentity> {
        self.original.as_ref()
    }

    /// Capabilities kept after startup
    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Whether requests switch identity at all
    pub fn switches_identity(&self) -> bool {
        self.transitions
    }

    pub fn confinement(&self) -> &RootConfinement {
        &self.confinement
    }

    /// In secure mode `err` is returned, otherwise it becomes a warning
    fn degrade(&self, err: PrivSwapError) -> Result<()> {
        if self.config.secure {
            Err(err)
        } else {
            self.diag
                .report(Severity::Warning, &format!("{} (permissive mode)", err));
            Ok(())
        }
    }

    fn fail(&mut self, err: PrivSwapError) -> PrivSwapError {
        self.state = LifecycleState::Failed;
        self.diag.report(Severity::Fatal, &err.to_string());
        err
    }

    /// Process startup: inspect, confine, pick the transition mode and drop
    /// every capability that is not needed any more.
    pub fn initialize(&mut self) -> Result<()> {
        if self.state != LifecycleState::Uninitialized {
            return Err(PrivSwapError::new(
                ErrorKind::Lifecycle,
                format!("initialize() called in state {}", self.state),
            ));
        }
        match self.try_initialize() {
            Ok(()) => {
                self.state = LifecycleState::Initialized;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn try_initialize(&mut self) -> Result<()> {
        self.config.validate()?;
        if !self.config.enabled {
            self.diag
                .report(Severity::Debug, "Privilege switching disabled by configuration");
            return Ok(());
        }

        self.original = Some(OriginalIdentity::capture(self.platform.credentials.as_ref())?);
        // needs the password database, so before any chroot
        self.resolver = Some(IdentityResolver::from_system(&self.diag));

        let host = self.config.host;
        let cli_skipped = host == HostModel::Cli && self.config.cli_disable;
        self.transitions = !cli_skipped;
        if cli_skipped {
            self.diag
                .report(Severity::Debug, "Identity transitions disabled for CLI invocations");
        }

        if self.confinement.per_request_enabled() {
            let reason = if self.confinement.global_path().is_some() {
                Some("global_chroot is set")
            } else if host == HostModel::Cli {
                Some("the host is a CLI")
            } else if host == HostModel::SharedThreads {
                Some("threads share the process root")
            } else {
                None
            };
            if let Some(reason) = reason {
                self.diag.report(
                    Severity::Warning,
                    &format!("Per-request chroot disabled because {}", reason),
                );
                self.confinement.disable_per_request();
            }
        }

        let snapshot = match self.platform.capabilities.inspect() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.degrade(e)?;
                PrivilegeSnapshot::default()
            }
        };
        self.diag.report(
            Severity::Debug,
            &format!(
                "Capabilities ({}): chroot={} setuid={} setgid={} dac_read_search={}",
                self.platform.capabilities.name(),
                snapshot.can_chroot,
                snapshot.can_setuid,
                snapshot.can_setgid,
                snapshot.can_bypass_read_checks
            ),
        );

        let mut change_gid = self.config.changes_gid();
        let mut force_gid = self.config.force_gid;

        let mut wanted = Vec::new();
        if self.confinement.per_request_enabled() {
            wanted.push(CapabilityRequest::required(Capability::SysChroot));
        }
        if self.transitions {
            if change_gid || force_gid.is_some() {
                wanted.push(CapabilityRequest::required(Capability::SetGid));
            }
            wanted.push(CapabilityRequest::required(Capability::SetUid));
            wanted.push(CapabilityRequest::optional(Capability::DacReadSearch));
        }
        let derivation = AllowList::derive(&snapshot, &wanted);
        for cap in &derivation.missing {
            self.degrade(PrivSwapError::new(
                ErrorKind::CapabilityReduction,
                format!("{} is required but not available", cap),
            ))?;
            match cap {
                Capability::SetUid => self.transitions = false,
                Capability::SetGid => {
                    change_gid = false;
                    force_gid = None;
                }
                Capability::SysChroot => self.confinement.disable_per_request(),
                Capability::DacReadSearch => {}
            }
        }

        // must be opened before the global chroot hides the real root
        self.confinement
            .prepare(self.platform.filesystem.as_ref())?;

        if let Some(root) = self.confinement.global_path().map(Path::to_owned) {
            if snapshot.can_chroot {
                if let Err(e) = self
                    .confinement
                    .confine(self.platform.filesystem.as_ref(), &root)
                {
                    self.degrade(e)?;
                }
            } else {
                self.degrade(PrivSwapError::new(
                    ErrorKind::Confinement,
                    format!("{} is required for global_chroot", Capability::SysChroot),
                ))?;
            }
        }

        if self.transitions {
            if let Some(gid) = force_gid {
                if let Err(e) = self.force_gid(Gid::from_raw(gid)) {
                    self.degrade(e)?;
                }
            }

            let saved_ids = self.platform.credentials.supports_saved_ids();
            let mode = TransitionMode::select(
                host,
                change_gid,
                self.config.keep_supplementary_groups,
                saved_ids,
            );
            let strategy = mode.strategy(host.is_reversible() && saved_ids);
            if host.is_reversible() && !strategy.is_reversible() {
                self.diag.report(
                    Severity::Warning,
                    "No saved-ID support; identity changes cannot be undone and apply once per process",
                );
            }
            self.diag
                .report(Severity::Debug, &format!("Identity transition mode: {}", mode));
            self.strategy = Some(strategy);
        }

        if !cli_skipped {
            self.allow = derivation.allow;
            if !self.allow.contains(Capability::SysChroot) {
                self.confinement.disable_per_request();
            }
            if let Err(e) = self.platform.capabilities.reduce(&self.allow) {
                self.degrade(e)?;
            }
            if !self.platform.capabilities.enforces() {
                self.diag.report(
                    Severity::Warning,
                    "Capability reduction is not enforced on this platform",
                );
            }
        }

        log::info!(
            "Privilege switching initialized (host={:?}, keep={})",
            host,
            self.allow
        );
        Ok(())
    }

    fn force_gid(&self, gid: Gid) -> Result<()> {
        let creds = self.platform.credentials.as_ref();
        creds
            .clear_groups()
            .map_err(|e| PrivSwapError::sys(ErrorKind::IdentityTransition, "setgroups([])", e))?;
        creds.setgid(gid).map_err(|e| {
            PrivSwapError::sys(ErrorKind::IdentityTransition, format!("setgid({})", gid), e)
        })?;
        self.diag
            .report(Severity::Debug, &format!("Forced process GID to {}", gid));
        Ok(())
    }

    /// Start of a request: resolve the identity, confine, switch.
    ///
    /// Any failure aborts the request. If what was already changed cannot
    /// be put back, the controller moves to [`LifecycleState::Failed`].
    pub fn activate(&mut self, ctx: &RequestContext) -> Result<Activation> {
        match self.state {
            LifecycleState::Initialized => {}
            LifecycleState::Active => {
                return Err(PrivSwapError::new(
                    ErrorKind::Lifecycle,
                    "a request is already active on this controller",
                ))
            }
            state => {
                return Err(PrivSwapError::new(
                    ErrorKind::Lifecycle,
                    format!("activate() called in state {}", state),
                ))
            }
        }

        if !self.config.enabled || (!self.transitions && !self.confinement.per_request_enabled()) {
            return Ok(Activation::untouched(ctx));
        }
        if self.dropped_for_life {
            self.diag.report(
                Severity::Debug,
                "Identity already fixed for this process, nothing to switch",
            );
            return Ok(Activation::untouched(ctx));
        }

        let resolver = self
            .resolver
            .ok_or_else(|| PrivSwapError::new(ErrorKind::Lifecycle, "identity resolver missing"))?;
        let mut target = resolver.resolve(
            self.config.default_uid,
            self.config.default_gid,
            ctx.document_root.as_deref(),
            self.config.never_root,
            &self.diag,
        );
        if let Some(gid) = self.config.force_gid {
            target.gid = Gid::from_raw(gid);
        }

        let mut activation = Activation::untouched(ctx);

        if self.confinement.per_request_enabled() {
            let root = ctx
                .chroot_to
                .clone()
                .or_else(|| self.confinement.per_request_path().map(Path::to_owned));
            if let Some(root) = root {
                if let Err(e) = self
                    .confinement
                    .confine_current_request(self.platform.filesystem.as_ref(), &root)
                {
                    self.diag.report(Severity::Fatal, &e.to_string());
                    return Err(e);
                }
                activation.document_root = self.rebase_path(ctx.document_root.as_deref(), &root);
                activation.script_filename = self.rebase_path(ctx.script_filename.as_deref(), &root);
                activation.root = Some(root);
            }
        }

        if self.transitions {
            if let Err(e) = self.apply(target) {
                self.diag.report(Severity::Fatal, &e.to_string());
                self.roll_back();
                return Err(e);
            }
            activation.identity = Some(target);
        }

        let host = self.config.host;
        if host.is_reversible() && self.strategy.as_ref().map_or(true, |s| s.is_reversible()) {
            self.active = true;
            self.state = LifecycleState::Active;
        } else {
            // nothing will come back to undo this
            self.active = false;
            self.dropped_for_life = self.transitions;
            self.confinement.forget_current_request();
        }
        Ok(activation)
    }

    fn apply(&self, target: TargetIdentity) -> Result<()> {
        let strategy = self
            .strategy
            .as_ref()
            .ok_or_else(|| PrivSwapError::new(ErrorKind::Lifecycle, "no transition strategy"))?;
        strategy.apply(self.platform.credentials.as_ref(), target)
    }

    fn rebase_path(&self, path: Option<&Path>, root: &Path) -> Option<PathBuf> {
        let path = path?;
        match rebase(path, root) {
            Some(inside) => Some(inside),
            None => {
                self.diag.report(
                    Severity::Warning,
                    &format!("{} is outside the request root {}", path.display(), root.display()),
                );
                Some(path.to_owned())
            }
        }
    }

    /// Undo whatever part of a failed activation took effect
    fn roll_back(&mut self) {
        let restored = self.reverse_all();
        if let Err(e) = restored {
            let e = self.fail(e);
            log::error!("Could not restore the original identity: {}", e);
        }
    }

    fn reverse_all(&mut self) -> Result<()> {
        let mut first_err = None;
        if let (Some(strategy), Some(original)) = (self.strategy.as_ref(), self.original.as_ref()) {
            if self.transitions {
                if let Err(e) = strategy.reverse(self.platform.credentials.as_ref(), original) {
                    first_err = Some(e);
                }
            }
        }
        if let Err(e) = self
            .confinement
            .reverse_current_request(self.platform.filesystem.as_ref())
        {
            if first_err.is_none() {
                first_err = Some(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// End of a request: restore the original identity and leave the
    /// per-request root. A no-op when nothing is active.
    pub fn deactivate(&mut self) -> Result<()> {
        match self.state {
            LifecycleState::Active => {}
            LifecycleState::Initialized | LifecycleState::Deactivated => return Ok(()),
            state => {
                return Err(PrivSwapError::new(
                    ErrorKind::Lifecycle,
                    format!("deactivate() called in state {}", state),
                ))
            }
        }
        self.active = false;
        match self.reverse_all() {
            Ok(()) => {
                self.state = LifecycleState::Initialized;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Reverse any active request and close the descriptor to the real root.
    ///
    /// Accepted in every state; only a failed reversal keeps the controller
    /// out of [`LifecycleState::Deactivated`].
    pub fn shutdown(&mut self) -> Result<()> {
        let result = match self.state {
            LifecycleState::Active => self.deactivate(),
            _ => Ok(()),
        };
        self.confinement.close();
        if result.is_ok() {
            self.state = LifecycleState::Deactivated;
        }
        result
    }
}

impl<D: Diagnostics> RequestHooks for Controller<D> {
    fn request_started(&mut self, ctx: &RequestContext) -> Result<Activation> {
        self.activate(ctx)
    }

    fn request_finished(&mut self) -> Result<()> {
        self.deactivate()
    }
}

impl<D: Diagnostics> fmt::Debug for Controller<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state)
            .field("mode", &self.mode())
            .field("allow", &self.allow)
            .field("active", &self.active)
            .field("confinement", &self.confinement)
            .finish()
    }
}
