use crate::errors::ConductorError;
use crate::logging::{DEFAULT_DISK_BUDGET_BYTES, DEFAULT_MAX_PAYLOAD_BYTES};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub store_path: Option<PathBuf>,
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub performer: PerformerConfig,
    pub composer: ComposerConfig,
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PerformerConfig {
    /// Stop at the first failed assertion instead of reporting and continuing.
    pub abort_on_failed_assertion: bool,
    /// Upper bound applied to every recorded cue timeout.
    pub max_cue_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComposerConfig {
    pub default_cue_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    /// Account identifier to `host:port`.
    pub endpoints: BTreeMap<String, String>,
}

impl Default for PerformerConfig {
    fn default() -> Self {
        Self {
            abort_on_failed_assertion: false,
            max_cue_timeout_ms: 300_000,
        }
    }
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            default_cue_timeout_ms: 5_000,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            performer: PerformerConfig::default(),
            composer: ComposerConfig::default(),
            logging: LoggingConfig {
                path: PathBuf::from(".conductor/logs/run.jsonl"),
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
            store: StoreConfig {
                path: PathBuf::from(".conductor/conductor.db"),
            },
            transport: TransportConfig {
                connect_timeout_ms: 5_000,
                endpoints: BTreeMap::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PartialAppConfig {
    performer: Option<PartialPerformerConfig>,
    composer: Option<PartialComposerConfig>,
    logging: Option<PartialLoggingConfig>,
    store: Option<PartialStoreConfig>,
    transport: Option<PartialTransportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialPerformerConfig {
    abort_on_failed_assertion: Option<bool>,
    max_cue_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialComposerConfig {
    default_cue_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialStoreConfig {
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialTransportConfig {
    connect_timeout_ms: Option<u64>,
    endpoints: Option<BTreeMap<String, String>>,
}

pub fn load_config(overrides: &CliOverrides) -> Result<AppConfig, ConductorError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|e| ConductorError::Io(format!("{}: {e}", path.display())))?;
        merge_partial_config(&mut cfg, parse_partial(&file_contents)?);
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn parse_config(text: &str) -> Result<AppConfig, ConductorError> {
    let mut cfg = AppConfig::default();
    merge_partial_config(&mut cfg, parse_partial(text)?);
    validate_config(&cfg)?;
    Ok(cfg)
}

fn parse_partial(text: &str) -> Result<PartialAppConfig, ConductorError> {
    toml::from_str(text).map_err(|e| ConductorError::ConfigParse(e.to_string()))
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(performer) = partial.performer {
        if let Some(value) = performer.abort_on_failed_assertion {
            cfg.performer.abort_on_failed_assertion = value;
        }
        if let Some(value) = performer.max_cue_timeout_ms {
            cfg.performer.max_cue_timeout_ms = value;
        }
    }

    if let Some(composer) = partial.composer {
        if let Some(value) = composer.default_cue_timeout_ms {
            cfg.composer.default_cue_timeout_ms = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.path {
            cfg.logging.path = value;
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }

    if let Some(store) = partial.store {
        if let Some(value) = store.path {
            cfg.store.path = value;
        }
    }

    if let Some(transport) = partial.transport {
        if let Some(value) = transport.connect_timeout_ms {
            cfg.transport.connect_timeout_ms = value;
        }
        if let Some(endpoints) = transport.endpoints {
            cfg.transport.endpoints.extend(endpoints);
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(path) = &overrides.store_path {
        cfg.store.path = path.clone();
    }
    if overrides.fail_fast {
        cfg.performer.abort_on_failed_assertion = true;
    }
}

/// Resolve relative file locations against `base`.
pub fn anchor_paths(cfg: &mut AppConfig, base: &Path) {
    for path in [&mut cfg.store.path, &mut cfg.logging.path] {
        if path.is_relative() {
            *path = base.join(&*path);
        }
    }
}

fn validate_config(cfg: &AppConfig) -> Result<(), ConductorError> {
    if cfg.performer.max_cue_timeout_ms == 0 {
        return Err(ConductorError::InvalidConfig(
            "performer.max_cue_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if cfg.composer.default_cue_timeout_ms == 0 {
        return Err(ConductorError::InvalidConfig(
            "composer.default_cue_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if cfg.transport.connect_timeout_ms == 0 {
        return Err(ConductorError::InvalidConfig(
            "transport.connect_timeout_ms must be greater than zero".to_string(),
        ));
    }
    if cfg.store.path.as_os_str().is_empty() {
        return Err(ConductorError::InvalidConfig(
            "store.path must not be empty".to_string(),
        ));
    }
    for (identifier, endpoint) in &cfg.transport.endpoints {
        let valid = endpoint
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
        if !valid {
            return Err(ConductorError::InvalidConfig(format!(
                "transport.endpoints.{identifier} must be host:port, got {endpoint:?}"
            )));
        }
    }
    Ok(())
}
