use crate::errors::*;
use crate::resolve::NOBODY_SENTINEL;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// How the host runs requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostModel {
    /// Long-lived worker process, one request at a time, with an end-of-request hook
    Persistent,
    /// One request per process, no end-of-request hook
    Cgi,
    /// Interactive or scripted one-shot invocation
    Cli,
    /// Several threads share one set of process-wide credentials
    SharedThreads,
}

impl HostModel {
    /// Whether per-request changes can be undone at the end of the request
    pub fn is_reversible(self) -> bool {
        matches!(self, HostModel::Persistent)
    }

    /// Whether nothing will ever call deactivation
    pub fn is_one_shot(self) -> bool {
        matches!(self, HostModel::Cgi | HostModel::Cli)
    }
}

impl Default for HostModel {
    fn default() -> Self {
        HostModel::Persistent
    }
}

/// Privilege switching configuration
///
/// # Example
/// ```
/// use privswap::{Config, HostModel};
///
/// let config = Config::default()
///     .host(HostModel::Persistent)
///     .default_ids(33, 33)
///     .per_request_chroot("/srv/sites");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enabled: bool,
    /// Fail closed on any privilege-related failure
    pub secure: bool,
    pub never_root: bool,
    pub default_uid: u32,
    pub default_gid: u32,
    pub cli_disable: bool,
    pub no_set_gid: bool,
    pub force_gid: Option<u32>,
    pub global_chroot: Option<PathBuf>,
    pub enable_per_request_chroot: bool,
    pub chroot_to: Option<PathBuf>,
    /// Keep the supplementary group list across transitions
    pub keep_supplementary_groups: bool,
    /// Accept "euid 0 means every capability" where the kernel has no capability API
    pub allow_uid_heuristic: bool,
    pub host: HostModel,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            enabled: true,
            secure: true,
            never_root: true,
            default_uid: NOBODY_SENTINEL,
            default_gid: NOBODY_SENTINEL,
            cli_disable: true,
            no_set_gid: false,
            force_gid: None,
            global_chroot: None,
            enable_per_request_chroot: false,
            chroot_to: None,
            keep_supplementary_groups: false,
            allow_uid_heuristic: false,
            host: HostModel::Persistent,
        }
    }
}

impl Config {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Fail closed (`true`) or degrade with warnings (`false`)
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn never_root(mut self, never_root: bool) -> Self {
        self.never_root = never_root;
        self
    }

    pub fn default_ids(mut self, uid: u32, gid: u32) -> Self {
        self.default_uid = uid;
        self.default_gid = gid;
        self
    }

    pub fn cli_disable(mut self, cli_disable: bool) -> Self {
        self.cli_disable = cli_disable;
        self
    }

    pub fn no_set_gid(mut self, no_set_gid: bool) -> Self {
        self.no_set_gid = no_set_gid;
        self
    }

    pub fn force_gid(mut self, gid: u32) -> Self {
        self.force_gid = Some(gid);
        self
    }

    /// chroot() the whole process to `path` at startup
    pub fn global_chroot<T: AsRef<Path>>(mut self, path: T) -> Self {
        self.global_chroot = Some(path.as_ref().to_owned());
        self
    }

    /// chroot() to `path` for every request, and back afterwards
    pub fn per_request_chroot<T: AsRef<Path>>(mut self, path: T) -> Self {
        self.enable_per_request_chroot = true;
        self.chroot_to = Some(path.as_ref().to_owned());
        self
    }

    pub fn keep_supplementary_groups(mut self, keep: bool) -> Self {
        self.keep_supplementary_groups = keep;
        self
    }

    pub fn allow_uid_heuristic(mut self, allow: bool) -> Self {
        self.allow_uid_heuristic = allow;
        self
    }

    pub fn host(mut self, host: HostModel) -> Self {
        self.host = host;
        self
    }

    /// Whether requests change the GID
    pub fn changes_gid(&self) -> bool {
        !self.no_set_gid && self.force_gid.is_none()
    }

    /// Read the recognized options from a key/value source.
    ///
    /// Unset keys keep their defaults. Booleans accept `1/0`, `on/off`,
    /// `true/false` and `yes/no`; empty paths mean "not set".
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_owned());

        if let Some(v) = get("enabled") {
            config.enabled = parse_bool("enabled", &v)?;
        }
        if let Some(v) = get("secure") {
            config.secure = parse_bool("secure", &v)?;
        }
        if let Some(v) = get("never_root") {
            config.never_root = parse_bool("never_root", &v)?;
        }
        if let Some(v) = get("default_uid") {
            config.default_uid = parse_id("default_uid", &v)?;
        }
        if let Some(v) = get("default_gid") {
            config.default_gid = parse_id("default_gid", &v)?;
        }
        if let Some(v) = get("cli_disable") {
            config.cli_disable = parse_bool("cli_disable", &v)?;
        }
        if let Some(v) = get("no_set_gid") {
            config.no_set_gid = parse_bool("no_set_gid", &v)?;
        }
        if let Some(v) = get("force_gid") {
            config.force_gid = if v.is_empty() {
                None
            } else {
                Some(parse_id("force_gid", &v)?)
            };
        }
        if let Some(v) = get("global_chroot") {
            config.global_chroot = parse_path(&v);
        }
        if let Some(v) = get("enable_per_request_chroot") {
            config.enable_per_request_chroot = parse_bool("enable_per_request_chroot", &v)?;
        }
        if let Some(v) = get("chroot_to") {
            config.chroot_to = parse_path(&v);
        }
        if let Some(v) = get("keep_supplementary_groups") {
            config.keep_supplementary_groups = parse_bool("keep_supplementary_groups", &v)?;
        }
        if let Some(v) = get("allow_uid_heuristic") {
            config.allow_uid_heuristic = parse_bool("allow_uid_heuristic", &v)?;
        }
        if let Some(v) = get("host") {
            config.host = parse_host(&v)?;
        }
        Ok(config)
    }

    /// Reject settings that cannot be honoured
    pub fn validate(&self) -> Result<()> {
        if self.never_root && self.force_gid == Some(0) {
            return Err(PrivSwapError::new(
                ErrorKind::Config,
                "force_gid = 0 conflicts with never_root",
            ));
        }
        for (name, path) in [("global_chroot", &self.global_chroot), ("chroot_to", &self.chroot_to)] {
            if let Some(path) = path {
                if !path.is_absolute() {
                    return Err(PrivSwapError::new(
                        ErrorKind::Config,
                        format!("{} must be an absolute path, got {}", name, path.display()),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" | "" => Ok(false),
        _ => Err(PrivSwapError::new(
            ErrorKind::Config,
            format!("{}: not a boolean: {:?}", key, value),
        )),
    }
}

fn parse_id(key: &str, value: &str) -> Result<u32> {
    value.parse::<u32>().map_err(|_| {
        PrivSwapError::new(
            ErrorKind::Config,
            format!("{}: not a numeric ID: {:?}", key, value),
        )
    })
}

fn parse_path(value: &str) -> Option<PathBuf> {
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

fn parse_host(value: &str) -> Result<HostModel> {
    match value {
        "persistent" => Ok(HostModel::Persistent),
        "cgi" => Ok(HostModel::Cgi),
        "cli" => Ok(HostModel::Cli),
        "shared_threads" => Ok(HostModel::SharedThreads),
        _ => Err(PrivSwapError::new(
            ErrorKind::Config,
            format!("host: unknown host model {:?}", value),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_secure() {
        let c = Config::default();
        assert!(c.enabled);
        assert!(c.secure);
        assert!(c.never_root);
        assert!(c.cli_disable);
        assert_eq!((c.default_uid, c.default_gid), (65534, 65534));
        assert!(c.changes_gid());
        assert_eq!(c.host, HostModel::Persistent);
    }

    #[test]
    fn lookup_reads_every_option() {
        let c = Config::from_lookup(lookup(&[
            ("enabled", "on"),
            ("secure", "0"),
            ("never_root", "no"),
            ("default_uid", "33"),
            ("default_gid", " 34 "),
            ("cli_disable", "false"),
            ("no_set_gid", "yes"),
            ("force_gid", "50"),
            ("global_chroot", ""),
            ("enable_per_request_chroot", "1"),
            ("chroot_to", "/srv/jail"),
            ("keep_supplementary_groups", "TRUE"),
            ("allow_uid_heuristic", "1"),
            ("host", "cgi"),
        ]))
        .unwrap();
        assert!(c.enabled);
        assert!(!c.secure);
        assert!(!c.never_root);
        assert_eq!((c.default_uid, c.default_gid), (33, 34));
        assert!(!c.cli_disable);
        assert!(c.no_set_gid);
        assert_eq!(c.force_gid, Some(50));
        assert_eq!(c.global_chroot, None);
        assert!(c.enable_per_request_chroot);
        assert_eq!(c.chroot_to, Some(PathBuf::from("/srv/jail")));
        assert!(c.keep_supplementary_groups);
        assert!(c.allow_uid_heuristic);
        assert_eq!(c.host, HostModel::Cgi);
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let err = Config::from_lookup(lookup(&[("default_uid", "www-data")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = Config::from_lookup(lookup(&[("never_root", "maybe")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = Config::from_lookup(lookup(&[("host", "fpm")])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn relative_chroot_paths_do_not_validate() {
        assert!(Config::default().global_chroot("jail").validate().is_err());
        assert!(Config::default().per_request_chroot("jail").validate().is_err());
        assert!(Config::default().global_chroot("/jail").validate().is_ok());
    }

    #[test]
    fn force_gid_disables_per_request_gid_changes() {
        assert!(!Config::default().force_gid(100).changes_gid());
        assert!(!Config::default().no_set_gid(true).changes_gid());
    }

    #[test]
    fn root_group_cannot_be_forced_under_never_root() {
        let err = Config::default().force_gid(0).validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(Config::default().force_gid(0).never_root(false).validate().is_ok());
        assert!(Config::default().force_gid(42).validate().is_ok());
    }

    #[test]
    fn deserializes_with_defaults() {
        let c: Config = serde_json::from_str(
            r#"{ "default_uid": 1000, "host": "shared_threads", "global_chroot": "/var/empty" }"#,
        )
        .unwrap();
        assert_eq!(c.default_uid, 1000);
        assert_eq!(c.default_gid, 65534);
        assert_eq!(c.host, HostModel::SharedThreads);
        assert_eq!(c.global_chroot, Some(PathBuf::from("/var/empty")));
        assert!(c.secure);
    }

    #[test]
    fn host_models() {
        assert!(HostModel::Persistent.is_reversible());
        assert!(!HostModel::SharedThreads.is_reversible());
        assert!(HostModel::Cli.is_one_shot());
        assert!(HostModel::Cgi.is_one_shot());
        assert!(!HostModel::SharedThreads.is_one_shot());
    }
}
