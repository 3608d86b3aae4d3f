//! Bridge configuration from the process environment.
//!
//! The environment is read once per process; everything downstream works
//! from the parsed snapshot, and the parsers are plain functions so tests
//! never have to mutate the environment.

use log::LevelFilter;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Which libraries get their thread-local accesses rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsPatchMode {
    Disabled,
    All,
    /// Only libraries whose basename is listed.
    Libraries(Vec<String>),
}

/// Parsed bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// `HYBRIS_PATCH_TLS`.
    pub tls_patch: TlsPatchMode,
    /// Cleared by `HYBRIS_NO_HWOVERRIDE`.
    pub hw_override: bool,
    /// `HYBRIS_LOGGING_LEVEL`.
    pub log_level: LevelFilter,
    /// `HYBRIS_LOGGING_TARGET`; standard error when unset.
    pub log_target: Option<PathBuf>,
}

impl BridgeConfig {
    /// The process-wide snapshot, read on first use.
    pub fn from_env() -> &'static BridgeConfig {
        static CONFIG: OnceLock<BridgeConfig> = OnceLock::new();
        CONFIG.get_or_init(|| {
            let get = |name: &str| std::env::var(name).ok();
            BridgeConfig {
                tls_patch: parse_tls_patch(get("HYBRIS_PATCH_TLS").as_deref()),
                hw_override: get("HYBRIS_NO_HWOVERRIDE").is_none(),
                log_level: parse_log_level(get("HYBRIS_LOGGING_LEVEL").as_deref()),
                log_target: get("HYBRIS_LOGGING_TARGET").map(PathBuf::from),
            }
        })
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            tls_patch: TlsPatchMode::Disabled,
            hw_override: true,
            log_level: LevelFilter::Warn,
            log_target: None,
        }
    }
}

/// `HYBRIS_PATCH_TLS`: unset and `0` disable, `1` patches everything,
/// anything else is a colon-separated basename allow-list.
pub fn parse_tls_patch(value: Option<&str>) -> TlsPatchMode {
    match value {
        None | Some("0") => TlsPatchMode::Disabled,
        Some("1") => TlsPatchMode::All,
        Some(list) => TlsPatchMode::Libraries(
            list.split(':')
                .filter(|name| !name.is_empty())
                .map(str::to_owned)
                .collect(),
        ),
    }
}

/// `HYBRIS_LOGGING_LEVEL`: `debug`, `info`, `warn`, `error` or
/// `disabled`. Unset and unrecognized values keep the default.
pub fn parse_log_level(value: Option<&str>) -> LevelFilter {
    match value {
        Some("debug") => LevelFilter::Debug,
        Some("info") => LevelFilter::Info,
        Some("warn") => LevelFilter::Warn,
        Some("error") => LevelFilter::Error,
        Some("disabled") => LevelFilter::Off,
        _ => LevelFilter::Warn,
    }
}
