//! Settings for the FVP Agent: the model catalog, config sets, port ranges
//! and terminal timing, loaded from `settings.json` or `settings.yaml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::LIST_MODELS_HINT;
use crate::{Error, PortRange, Result};

/// Default settings file name.
pub const SETTINGS_FILE: &str = "settings.json";

/// Directory, next to the settings file, holding config files.
pub const CONFIGS_DIR: &str = "configs";

/// Name of the config set that enables coverage extraction.
pub const DEFAULT_COVERAGE_CONFIG: &str = "COVERAGE";

/// Parameter that pins the first telnet terminal's listening port.
pub const DEFAULT_TELNET_START_PORT_PARAM: &str = "mps3_board.telnetterminal0.start_port";

lazy_static! {
    static ref ENV_REFERENCE: Regex = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
}

/// Expand `${VAR}` references from the environment. Unset variables are
/// left as written.
pub fn expand_env(value: &str) -> String {
    ENV_REFERENCE
        .replace_all(value, |caps: &Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

/// Complete settings document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FvpSettings {
    /// Settings shared by every model
    #[serde(rename = "COMMON", default)]
    pub common: CommonSettings,
    /// Model catalog keyed by model name
    #[serde(flatten)]
    pub models: BTreeMap<String, ModelSettings>,
    /// Directory the settings were loaded from
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

impl FvpSettings {
    /// Load settings from a file. `.yaml`/`.yml` files are read as YAML,
    /// anything else as JSON.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let mut settings = if is_yaml {
            Self::from_yaml(&content)?
        } else {
            Self::from_json(&content)?
        };
        settings.base_dir = path.parent().map(Path::to_path_buf);
        Ok(settings)
    }

    /// Parse settings from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: FvpSettings = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings: FvpSettings =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Set the directory config files are resolved against.
    pub fn with_base_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let ports = &self.common.ports;
        if ports.telnet.overlaps(&ports.gdb) {
            return Err(Error::Config(format!(
                "telnet port range {} overlaps gdb port range {}",
                ports.telnet, ports.gdb
            )));
        }

        let terminal = &self.common.terminal;
        if terminal.read_timeout_ms == 0 || terminal.connect_timeout_ms == 0 {
            return Err(Error::Config(
                "terminal timeouts must be > 0".to_string(),
            ));
        }
        if self.common.timing.launch_timeout_ms == 0 {
            return Err(Error::Config(
                "timing.launch_timeout_ms must be > 0".to_string(),
            ));
        }
        if terminal.connect_attempts == 0 {
            return Err(Error::Config(
                "terminal.connect_attempts must be > 0".to_string(),
            ));
        }

        for (name, model) in &self.models {
            if model.configs.is_some() && model.configs_add.is_some() {
                return Err(Error::Config(format!(
                    "model '{name}' sets both 'configs' and 'configs_add'"
                )));
            }
        }

        Ok(())
    }

    /// Directory the settings were loaded from, or the working directory.
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Directory holding config files.
    pub fn config_dir(&self) -> PathBuf {
        self.base_dir().join(CONFIGS_DIR)
    }

    /// Names of every model in the catalog.
    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Every model with its config sets.
    pub fn all_configs(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.model_names()
            .filter_map(|name| self.configs(name).map(|configs| (name.to_string(), configs)))
            .collect()
    }

    /// Path of the Iris Python bridge, with environment references expanded.
    pub fn iris_path(&self) -> Option<PathBuf> {
        self.common
            .iris_path
            .as_deref()
            .map(|p| PathBuf::from(expand_env(p)))
    }

    /// Model binary path, with environment references expanded.
    pub fn model_binary(&self, model: &str) -> Option<PathBuf> {
        self.models
            .get(model)?
            .model_binary
            .as_deref()
            .map(|p| PathBuf::from(expand_env(p)))
    }

    /// Extra command-line options declared for a model.
    pub fn model_options(&self, model: &str) -> Vec<String> {
        self.models
            .get(model)
            .map(|m| m.model_options.clone())
            .unwrap_or_default()
    }

    /// Terminal component name declared for a model.
    pub fn terminal_component(&self, model: &str) -> Option<&str> {
        self.models.get(model)?.terminal_component.as_deref()
    }

    /// Config sets of a model: its own `configs`, or the common ones merged
    /// with its `configs_add`.
    pub fn configs(&self, model: &str) -> Option<BTreeMap<String, String>> {
        let entry = self.models.get(model)?;
        if let Some(own) = &entry.configs {
            return Some(own.clone());
        }
        let mut merged = self.common.configs.clone();
        if let Some(extra) = &entry.configs_add {
            merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        Some(merged)
    }

    /// Resolve a config file name to a path in the configs directory.
    pub fn config_path(&self, file: &str) -> PathBuf {
        let path = Path::new(file);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir().join(path)
        }
    }

    /// Check whether a config file exists in the configs directory.
    pub fn check_config_exist(&self, file: &str) -> bool {
        self.config_path(file).exists()
    }

    /// Resolve a model and config name into everything needed to launch it.
    pub fn resolve(&self, model: &str, config: &str) -> Result<ResolvedModel> {
        let binary = self.model_binary(model).ok_or_else(|| Error::UnknownModel {
            model: model.to_string(),
            hint: LIST_MODELS_HINT.to_string(),
        })?;

        let config_file = match self.configs(model).and_then(|c| c.get(config).cloned()) {
            Some(file) => self.config_path(&file),
            None => {
                let local = std::env::current_dir()?.join(config);
                if !config.is_empty() && local.is_file() {
                    local
                } else {
                    return Err(Error::UnknownConfig {
                        model: model.to_string(),
                        config: config.to_string(),
                        hint: LIST_MODELS_HINT.to_string(),
                    });
                }
            }
        };

        let terminal_component = self
            .terminal_component(model)
            .ok_or_else(|| Error::MissingTerminalComponent {
                model: model.to_string(),
                hint: format!(
                    "Add a 'terminal_component' entry for '{model}' to {SETTINGS_FILE}"
                ),
            })?
            .to_string();

        let entry = &self.models[model];
        Ok(ResolvedModel {
            name: model.to_string(),
            config_name: config.to_string(),
            binary,
            config_file,
            options: entry.model_options.clone(),
            terminal_component,
            telnet_start_port_param: entry.telnet_start_port_param.clone(),
        })
    }

    /// Whether the given config name is the coverage profile.
    pub fn is_coverage_config(&self, config: &str) -> bool {
        self.common.coverage_config == config
    }
}

/// Settings shared by every model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonSettings {
    /// Location of the Iris Python bridge
    #[serde(rename = "IRIS_path")]
    pub iris_path: Option<String>,
    /// Config sets available to every model
    pub configs: BTreeMap<String, String>,
    /// GDB remote-connection plugin library
    pub gdbserver_plugin: Option<String>,
    /// Config name that enables coverage extraction
    pub coverage_config: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Port ranges
    pub ports: PortSettings,
    /// Terminal socket behaviour
    pub terminal: TerminalSettings,
    /// Lifecycle timing
    pub timing: TimingSettings,
}

impl Default for CommonSettings {
    fn default() -> Self {
        Self {
            iris_path: None,
            configs: BTreeMap::new(),
            gdbserver_plugin: None,
            coverage_config: DEFAULT_COVERAGE_CONFIG.to_string(),
            log_level: "info".to_string(),
            ports: PortSettings::default(),
            terminal: TerminalSettings::default(),
            timing: TimingSettings::default(),
        }
    }
}

/// One model catalog entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelSettings {
    /// Simulator executable
    pub model_binary: Option<String>,
    /// Extra command-line options
    #[serde(default)]
    pub model_options: Vec<String>,
    /// Debug target name of the telnet terminal
    pub terminal_component: Option<String>,
    /// Parameter that pins the telnet terminal port
    #[serde(default = "default_telnet_param")]
    pub telnet_start_port_param: String,
    /// Config sets replacing the common ones
    pub configs: Option<BTreeMap<String, String>>,
    /// Config sets merged into the common ones
    pub configs_add: Option<BTreeMap<String, String>>,
}

fn default_telnet_param() -> String {
    DEFAULT_TELNET_START_PORT_PARAM.to_string()
}

/// Port ranges handed out to simulator instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    /// Range for telnet terminal start ports
    pub telnet: PortRange,
    /// Range for GDB server ports
    pub gdb: PortRange,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            telnet: PortRange::DEFAULT_TELNET,
            gdb: PortRange::DEFAULT_GDB,
        }
    }
}

/// Terminal socket settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalSettings {
    /// Host the simulator listens on
    pub host: String,
    /// Per-read idle timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Per-attempt connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Connection attempts before giving up
    pub connect_attempts: u32,
    /// Delay before each connection attempt in milliseconds
    pub settle_delay_ms: u64,
    /// Delay between written bytes in milliseconds
    pub write_pace_ms: u64,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            read_timeout_ms: 200,
            connect_timeout_ms: 1000,
            connect_attempts: 5,
            settle_delay_ms: 500,
            write_pace_ms: 10,
        }
    }
}

/// Lifecycle timing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Wait after releasing a model in milliseconds
    pub release_settle_ms: u64,
    /// Timeout passed to non-blocking run requests in milliseconds
    pub run_timeout_ms: u64,
    /// Bound on each run-to-breakpoint during coverage extraction
    pub breakpoint_timeout_ms: u64,
    /// Grace period between terminate and kill of the simulator process
    pub terminate_grace_ms: u64,
    /// Bound on waiting for the simulator startup banner
    pub launch_timeout_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            release_settle_ms: 1000,
            run_timeout_ms: 1000,
            breakpoint_timeout_ms: 60_000,
            terminate_grace_ms: 2000,
            launch_timeout_ms: 30_000,
        }
    }
}

/// A model and config resolved against the settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    /// Model name
    pub name: String,
    /// Config name
    pub config_name: String,
    /// Simulator executable
    pub binary: PathBuf,
    /// Config file passed with `-f`
    pub config_file: PathBuf,
    /// Options declared for the model
    pub options: Vec<String>,
    /// Debug target name of the telnet terminal
    pub terminal_component: String,
    /// Parameter that pins the telnet terminal port
    pub telnet_start_port_param: String,
}
