//! Process-wide configuration bag with a scoped-override stack.
//!
//! `Config` holds the effective values of spec.md §3's recognized keys.
//! Components that need a temporary override (a test harness pinning
//! `broadcast_port`, a CLI flag forcing `--no-multicast`) push a
//! [`PartialConfig`] frame via [`Config::scoped`] and the returned
//! [`ConfigScopeGuard`] pops it on `Drop`, restoring the prior frame along
//! every exit path, including panics during the scope, mirroring the
//! "scoped acquisition releases on every exit path" discipline this
//! workspace applies to Publisher/Subscriber lifecycles.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use crate::error::ConfigError;
use crate::message::MessageVersion;
use crate::ConfigResult;

/// Transport backend selection (spec.md §3 `backend` key).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// No peer authentication.
    #[default]
    Plain,
    /// Curve-style mutual authentication (spec.md §4.B).
    Secure,
}

impl std::str::FromStr for Backend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zmq" => Ok(Backend::Plain),
            "secure_zmq" => Ok(Backend::Secure),
            other => Err(ConfigError::InvalidValue {
                key: "backend".to_string(),
                reason: format!("unrecognized backend `{other}`"),
            }),
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Backend::Plain => "zmq",
            Backend::Secure => "secure_zmq",
        })
    }
}

/// The effective configuration bag (spec.md §3 table).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub backend: Backend,
    pub tcp_keepalive: bool,
    pub tcp_keepalive_cnt: u32,
    pub tcp_keepalive_idle: u32,
    pub tcp_keepalive_intvl: u32,
    pub multicast_interface: Option<String>,
    pub mc_group: String,
    pub nameservers: Vec<String>,
    pub broadcast_port: u16,
    pub nameserver_port: u16,
    /// Inclusive `(low, high)` bound a Publisher picks from when asked for
    /// port 0 (spec.md §4.F/§8 "port 0 allocates a port in the configured
    /// range"). `None` defers to the OS's own ephemeral range.
    pub publish_port_range: Option<(u16, u16)>,
    pub message_version: MessageVersion,
    pub server_public_key_file: Option<PathBuf>,
    pub server_secret_key_file: Option<PathBuf>,
    pub client_public_key_file: Option<PathBuf>,
    pub client_secret_key_file: Option<PathBuf>,
    pub clients_public_keys_directory: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend: Backend::default(),
            tcp_keepalive: true,
            tcp_keepalive_cnt: 10,
            tcp_keepalive_idle: 1,
            tcp_keepalive_intvl: 1,
            multicast_interface: None,
            mc_group: "225.0.0.212".to_string(),
            nameservers: Vec::new(),
            broadcast_port: 21200,
            nameserver_port: 5557,
            publish_port_range: None,
            message_version: MessageVersion::default(),
            server_public_key_file: None,
            server_secret_key_file: None,
            client_public_key_file: None,
            client_secret_key_file: None,
            clients_public_keys_directory: None,
        }
    }
}

/// A sparse set of overrides layered onto [`Config`]'s defaults.
///
/// Every field is optional; `None` means "inherit whatever is already in
/// effect". Used both by [`Config::load`]'s TOML-file layer and by
/// [`Config::scoped`]'s override stack.
#[derive(Debug, Clone, Default)]
pub struct PartialConfig {
    pub backend: Option<Backend>,
    pub tcp_keepalive: Option<bool>,
    pub tcp_keepalive_cnt: Option<u32>,
    pub tcp_keepalive_idle: Option<u32>,
    pub tcp_keepalive_intvl: Option<u32>,
    pub multicast_interface: Option<Option<String>>,
    pub mc_group: Option<String>,
    pub nameservers: Option<Vec<String>>,
    pub broadcast_port: Option<u16>,
    pub nameserver_port: Option<u16>,
    pub publish_port_range: Option<Option<(u16, u16)>>,
    pub message_version: Option<MessageVersion>,
    pub server_public_key_file: Option<Option<PathBuf>>,
    pub server_secret_key_file: Option<Option<PathBuf>>,
    pub client_public_key_file: Option<Option<PathBuf>>,
    pub client_secret_key_file: Option<Option<PathBuf>>,
    pub clients_public_keys_directory: Option<Option<PathBuf>>,
}

impl Config {
    fn apply(mut self, patch: &PartialConfig) -> Self {
        if let Some(v) = patch.backend {
            self.backend = v;
        }
        if let Some(v) = patch.tcp_keepalive {
            self.tcp_keepalive = v;
        }
        if let Some(v) = patch.tcp_keepalive_cnt {
            self.tcp_keepalive_cnt = v;
        }
        if let Some(v) = patch.tcp_keepalive_idle {
            self.tcp_keepalive_idle = v;
        }
        if let Some(v) = patch.tcp_keepalive_intvl {
            self.tcp_keepalive_intvl = v;
        }
        if let Some(v) = patch.multicast_interface.clone() {
            self.multicast_interface = v;
        }
        if let Some(v) = patch.mc_group.clone() {
            self.mc_group = v;
        }
        if let Some(v) = patch.nameservers.clone() {
            self.nameservers = v;
        }
        if let Some(v) = patch.broadcast_port {
            self.broadcast_port = v;
        }
        if let Some(v) = patch.nameserver_port {
            self.nameserver_port = v;
        }
        if let Some(v) = patch.publish_port_range {
            self.publish_port_range = v;
        }
        if let Some(v) = patch.message_version {
            self.message_version = v;
        }
        if let Some(v) = patch.server_public_key_file.clone() {
            self.server_public_key_file = v;
        }
        if let Some(v) = patch.server_secret_key_file.clone() {
            self.server_secret_key_file = v;
        }
        if let Some(v) = patch.client_public_key_file.clone() {
            self.client_public_key_file = v;
        }
        if let Some(v) = patch.client_secret_key_file.clone() {
            self.client_secret_key_file = v;
        }
        if let Some(v) = patch.clients_public_keys_directory.clone() {
            self.clients_public_keys_directory = v;
        }
        self
    }

    /// Load configuration by layering a TOML file's values over the
    /// built-in defaults, matching `DaemonConfig::load`'s file-then-default
    /// layering.
    pub fn load(path: &std::path::Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let patch: PartialConfig = toml_patch::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Config::default().apply(&patch))
    }

    /// Apply the `POSTTROLL_*` environment variables (spec.md §6) over the
    /// current defaults.
    pub fn from_env() -> ConfigResult<Self> {
        let patch = env_patch()?;
        Ok(Config::default().apply(&patch))
    }

    /// Push a scoped override frame onto the process-wide override stack
    /// and return a guard that restores the previous frame on `Drop`.
    ///
    /// Call [`Config::current`] to read the config as seen through every
    /// currently-active scope.
    pub fn scoped(patch: PartialConfig) -> ConfigScopeGuard {
        stack().lock().unwrap_or_else(|e| e.into_inner()).push(patch);
        ConfigScopeGuard { _private: () }
    }

    /// The config with the environment layer and every active scoped
    /// override frame applied, in installation order.
    pub fn current() -> Self {
        let mut cfg = Config::from_env().unwrap_or_default();
        for patch in stack().lock().unwrap_or_else(|e| e.into_inner()).iter() {
            cfg = cfg.apply(patch);
        }
        cfg
    }
}

fn stack() -> &'static Mutex<Vec<PartialConfig>> {
    static STACK: OnceLock<Mutex<Vec<PartialConfig>>> = OnceLock::new();
    STACK.get_or_init(|| Mutex::new(Vec::new()))
}

/// Guard returned by [`Config::scoped`]; pops its override frame on drop.
#[must_use = "dropping this immediately pops the override it installed"]
pub struct ConfigScopeGuard {
    _private: (),
}

impl Drop for ConfigScopeGuard {
    fn drop(&mut self) {
        stack().lock().unwrap_or_else(|e| e.into_inner()).pop();
    }
}

fn env_patch() -> ConfigResult<PartialConfig> {
    let mut patch = PartialConfig::default();
    if let Ok(v) = std::env::var("POSTTROLL_BACKEND") {
        patch.backend = Some(v.parse()?);
    }
    if let Ok(v) = std::env::var("POSTTROLL_TCP_KEEPALIVE") {
        patch.tcp_keepalive = Some(parse_bool("POSTTROLL_TCP_KEEPALIVE", &v)?);
    }
    if let Ok(v) = std::env::var("POSTTROLL_TCP_KEEPALIVE_CNT") {
        patch.tcp_keepalive_cnt = Some(parse_u32("POSTTROLL_TCP_KEEPALIVE_CNT", &v)?);
    }
    if let Ok(v) = std::env::var("POSTTROLL_TCP_KEEPALIVE_IDLE") {
        patch.tcp_keepalive_idle = Some(parse_u32("POSTTROLL_TCP_KEEPALIVE_IDLE", &v)?);
    }
    if let Ok(v) = std::env::var("POSTTROLL_TCP_KEEPALIVE_INTVL") {
        patch.tcp_keepalive_intvl = Some(parse_u32("POSTTROLL_TCP_KEEPALIVE_INTVL", &v)?);
    }
    if let Ok(v) = std::env::var("POSTTROLL_MULTICAST_INTERFACE") {
        patch.multicast_interface = Some(Some(v));
    }
    if let Ok(v) = std::env::var("POSTTROLL_MC_GROUP") {
        patch.mc_group = Some(v);
    }
    if let Ok(v) = std::env::var("POSTTROLL_NAMESERVERS") {
        patch.nameservers = Some(v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect());
    }
    if let Ok(v) = std::env::var("POSTTROLL_BROADCAST_PORT") {
        patch.broadcast_port = Some(parse_u16("POSTTROLL_BROADCAST_PORT", &v)?);
    }
    if let Ok(v) = std::env::var("POSTTROLL_NAMESERVER_PORT") {
        patch.nameserver_port = Some(parse_u16("POSTTROLL_NAMESERVER_PORT", &v)?);
    }
    if let Ok(v) = std::env::var("POSTTROLL_PUBLISH_PORT_RANGE") {
        patch.publish_port_range = Some(Some(parse_port_range("POSTTROLL_PUBLISH_PORT_RANGE", &v)?));
    }
    if let Ok(v) = std::env::var("POSTTROLL_MESSAGE_VERSION") {
        patch.message_version = Some(v.parse().map_err(|_| ConfigError::InvalidValue {
            key: "message_version".to_string(),
            reason: format!("unrecognized version `{v}`"),
        })?);
    }
    if let Ok(v) = std::env::var("POSTTROLL_SERVER_PUBLIC_KEY_FILE") {
        patch.server_public_key_file = Some(Some(PathBuf::from(v)));
    }
    if let Ok(v) = std::env::var("POSTTROLL_SERVER_SECRET_KEY_FILE") {
        patch.server_secret_key_file = Some(Some(PathBuf::from(v)));
    }
    if let Ok(v) = std::env::var("POSTTROLL_CLIENT_PUBLIC_KEY_FILE") {
        patch.client_public_key_file = Some(Some(PathBuf::from(v)));
    }
    if let Ok(v) = std::env::var("POSTTROLL_CLIENT_SECRET_KEY_FILE") {
        patch.client_secret_key_file = Some(Some(PathBuf::from(v)));
    }
    if let Ok(v) = std::env::var("POSTTROLL_CLIENTS_PUBLIC_KEYS_DIRECTORY") {
        patch.clients_public_keys_directory = Some(Some(PathBuf::from(v)));
    }
    Ok(patch)
}

fn parse_bool(key: &str, v: &str) -> ConfigResult<bool> {
    match v {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("not a boolean: `{other}`"),
        }),
    }
}

fn parse_u32(key: &str, v: &str) -> ConfigResult<u32> {
    v.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("not an integer: `{v}`"),
    })
}

fn parse_u16(key: &str, v: &str) -> ConfigResult<u16> {
    v.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("not a port number: `{v}`"),
    })
}

/// Parses `"low-high"` into an inclusive port bound.
fn parse_port_range(key: &str, v: &str) -> ConfigResult<(u16, u16)> {
    let (low, high) = v.split_once('-').ok_or_else(|| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: format!("expected `low-high`, found `{v}`"),
    })?;
    let low = parse_u16(key, low.trim())?;
    let high = parse_u16(key, high.trim())?;
    if low > high {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: format!("low port {low} is greater than high port {high}"),
        });
    }
    Ok((low, high))
}

/// Minimal TOML-to-[`PartialConfig`] bridge. Keys that are present but
/// fail to parse into their expected type are logged and skipped rather
/// than silently accepted, per spec.md §7 ("unknown key or impossible
/// value combination").
mod toml_patch {
    use super::{Backend, MessageVersion, PartialConfig};

    pub(super) fn parse(text: &str) -> Result<PartialConfig, toml::de::Error> {
        let table: toml::Value = toml::from_str(text)?;
        let mut patch = PartialConfig::default();
        let Some(table) = table.as_table() else {
            return Ok(patch);
        };
        for (key, value) in table {
            apply_key(&mut patch, key, value);
        }
        Ok(patch)
    }

    fn apply_key(patch: &mut PartialConfig, key: &str, value: &toml::Value) {
        use toml::Value as V;
        match (key, value) {
            ("backend", V::String(s)) => patch.backend = s.parse::<Backend>().ok(),
            ("tcp_keepalive", V::Boolean(b)) => patch.tcp_keepalive = Some(*b),
            ("tcp_keepalive_cnt", V::Integer(i)) => patch.tcp_keepalive_cnt = Some(*i as u32),
            ("tcp_keepalive_idle", V::Integer(i)) => patch.tcp_keepalive_idle = Some(*i as u32),
            ("tcp_keepalive_intvl", V::Integer(i)) => patch.tcp_keepalive_intvl = Some(*i as u32),
            ("multicast_interface", V::String(s)) => {
                patch.multicast_interface = Some(Some(s.clone()))
            }
            ("mc_group", V::String(s)) => patch.mc_group = Some(s.clone()),
            ("nameservers", V::Array(items)) => {
                patch.nameservers = Some(
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(String::from))
                        .collect(),
                )
            }
            ("broadcast_port", V::Integer(i)) => patch.broadcast_port = Some(*i as u16),
            ("nameserver_port", V::Integer(i)) => patch.nameserver_port = Some(*i as u16),
            ("publish_port_range", V::Array(items)) if items.len() == 2 => {
                if let (Some(low), Some(high)) = (items[0].as_integer(), items[1].as_integer()) {
                    patch.publish_port_range = Some(Some((low as u16, high as u16)));
                } else {
                    tracing::warn!(key, "ignoring unrecognized or mistyped config key");
                }
            }
            ("message_version", V::String(s)) => {
                patch.message_version = s.parse::<MessageVersion>().ok()
            }
            ("server_public_key_file", V::String(s)) => {
                patch.server_public_key_file = Some(Some(s.into()))
            }
            ("server_secret_key_file", V::String(s)) => {
                patch.server_secret_key_file = Some(Some(s.into()))
            }
            ("client_public_key_file", V::String(s)) => {
                patch.client_public_key_file = Some(Some(s.into()))
            }
            ("client_secret_key_file", V::String(s)) => {
                patch.client_secret_key_file = Some(Some(s.into()))
            }
            ("clients_public_keys_directory", V::String(s)) => {
                patch.clients_public_keys_directory = Some(Some(s.into()))
            }
            _ => {
                tracing::warn!(key, "ignoring unrecognized or mistyped config key");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.backend, Backend::Plain);
        assert_eq!(cfg.mc_group, "225.0.0.212");
        assert_eq!(cfg.broadcast_port, 21200);
        assert_eq!(cfg.nameserver_port, 5557);
        assert_eq!(cfg.message_version, MessageVersion::V1_02);
    }

    #[test]
    fn publish_port_range_parses_from_toml() {
        let patch = toml_patch::parse("publish_port_range = [40000, 40100]\n").unwrap();
        assert_eq!(patch.publish_port_range, Some(Some((40000, 40100))));
    }

    #[test]
    fn port_range_rejects_low_greater_than_high() {
        assert!(parse_port_range("POSTTROLL_PUBLISH_PORT_RANGE", "200-100").is_err());
    }

    #[test]
    fn backend_round_trips_through_tokens() {
        assert_eq!("zmq".parse::<Backend>().unwrap(), Backend::Plain);
        assert_eq!("secure_zmq".parse::<Backend>().unwrap(), Backend::Secure);
        assert_eq!(Backend::Plain.to_string(), "zmq");
        assert_eq!(Backend::Secure.to_string(), "secure_zmq");
    }

    #[test]
    #[serial_test::serial]
    fn scoped_override_restores_on_drop() {
        let before = Config::current().broadcast_port;
        {
            let mut patch = PartialConfig::default();
            patch.broadcast_port = Some(9999);
            let _guard = Config::scoped(patch);
            assert_eq!(Config::current().broadcast_port, 9999);
        }
        assert_eq!(Config::current().broadcast_port, before);
    }

    #[test]
    #[serial_test::serial]
    fn nested_scopes_stack_and_unwind_in_order() {
        let mut outer = PartialConfig::default();
        outer.broadcast_port = Some(1111);
        let outer_guard = Config::scoped(outer);
        assert_eq!(Config::current().broadcast_port, 1111);

        let mut inner = PartialConfig::default();
        inner.broadcast_port = Some(2222);
        let inner_guard = Config::scoped(inner);
        assert_eq!(Config::current().broadcast_port, 2222);

        drop(inner_guard);
        assert_eq!(Config::current().broadcast_port, 1111);
        drop(outer_guard);
    }
}
