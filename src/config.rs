use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::formula::assembler::DEFAULT_TICK_DEPTH;

/// Top-level configuration for the averagewatts formula.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Dispatcher identifier, part of every formula identity. Default: "cpu".
    #[serde(default = "default_dispatcher")]
    pub dispatcher: String,

    /// Power estimation settings shared by every formula instance.
    #[serde(default)]
    pub formula: FormulaConfig,

    /// Capacity of the report channel between sources and the dispatcher.
    /// Default: 65536.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Report sources, read concurrently.
    #[serde(default)]
    pub inputs: Vec<InputConfig>,

    /// Report sinks, fed in the listed order.
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

/// Power estimation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FormulaConfig {
    /// Number of buffered timestamps before the oldest tick is processed.
    /// Default: 5.
    #[serde(default = "default_tick_depth")]
    pub tick_depth: usize,

    /// Scope tag attached to produced reports. Default: "cpu".
    #[serde(default = "default_scope")]
    pub scope: String,

    /// Counter group holding the package energy. Default: "rapl".
    #[serde(default = "default_energy_group")]
    pub energy_group: String,

    /// Package energy counter name. Default: "RAPL_ENERGY_PKG".
    #[serde(default = "default_energy_counter")]
    pub energy_counter: String,
}

/// A report source.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputConfig {
    /// HWPC CSV files, one file per counter group.
    Csv { name: String, files: Vec<PathBuf> },
    /// Newline-delimited JSON HWPC reports.
    JsonLines { name: String, path: PathBuf },
}

impl InputConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Csv { name, .. } | Self::JsonLines { name, .. } => name,
        }
    }
}

/// A power report sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputConfig {
    /// One CSV file per sensor/target under `directory`.
    Csv { name: String, directory: PathBuf },
    /// Newline-delimited JSON on standard output.
    Stdout { name: String },
}

impl OutputConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::Csv { name, .. } | Self::Stdout { name } => name,
        }
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_dispatcher() -> String {
    "cpu".to_string()
}

fn default_channel_capacity() -> usize {
    65536
}

fn default_tick_depth() -> usize {
    DEFAULT_TICK_DEPTH
}

fn default_scope() -> String {
    "cpu".to_string()
}

fn default_energy_group() -> String {
    "rapl".to_string()
}

fn default_energy_counter() -> String {
    "RAPL_ENERGY_PKG".to_string()
}

// --- Default trait implementations ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            dispatcher: default_dispatcher(),
            formula: FormulaConfig::default(),
            channel_capacity: default_channel_capacity(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

impl Default for FormulaConfig {
    fn default() -> Self {
        Self {
            tick_depth: default_tick_depth(),
            scope: default_scope(),
            energy_group: default_energy_group(),
            energy_counter: default_energy_counter(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.is_empty() {
            bail!("dispatcher must not be empty");
        }

        if self.channel_capacity == 0 {
            bail!("channel_capacity must be positive");
        }

        if self.formula.tick_depth == 0 {
            bail!("formula.tick_depth must be positive");
        }
        if self.formula.energy_group.is_empty() {
            bail!("formula.energy_group must not be empty");
        }
        if self.formula.energy_counter.is_empty() {
            bail!("formula.energy_counter must not be empty");
        }

        if self.inputs.is_empty() {
            bail!("at least one input is required");
        }
        if self.outputs.is_empty() {
            bail!("at least one output is required");
        }

        let mut input_names = HashSet::new();
        for input in &self.inputs {
            if !input_names.insert(input.name()) {
                bail!("duplicate input name: {}", input.name());
            }
            if let InputConfig::Csv { name, files } = input {
                if files.is_empty() {
                    bail!("csv input {name} requires at least one file");
                }
            }
        }

        let mut output_names = HashSet::new();
        for output in &self.outputs {
            if !output_names.insert(output.name()) {
                bail!("duplicate output name: {}", output.name());
            }
            if let OutputConfig::Csv { name, directory } = output {
                if directory.as_os_str().is_empty() {
                    bail!("csv output {name} requires a directory");
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            inputs: vec![InputConfig::Csv {
                name: "puller_csv".to_string(),
                files: vec![PathBuf::from("rapl.csv")],
            }],
            outputs: vec![OutputConfig::Stdout {
                name: "pusher_stdout".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.dispatcher, "cpu");
        assert_eq!(cfg.channel_capacity, 65536);
        assert_eq!(cfg.formula.tick_depth, 5);
        assert_eq!(cfg.formula.scope, "cpu");
        assert_eq!(cfg.formula.energy_group, "rapl");
        assert_eq!(cfg.formula.energy_counter, "RAPL_ENERGY_PKG");
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
dispatcher: naive_dispatcher
formula:
  tick_depth: 3
inputs:
  - type: csv
    name: puller_csv
    files: [core.csv, rapl.csv]
  - type: json_lines
    name: puller_json
    path: reports.jsonl
outputs:
  - type: csv
    name: pusher_csv
    directory: /tmp/power
  - type: stdout
    name: pusher_stdout
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("valid yaml");
        cfg.validate().expect("valid config");

        assert_eq!(cfg.dispatcher, "naive_dispatcher");
        assert_eq!(cfg.formula.tick_depth, 3);
        assert_eq!(cfg.formula.scope, "cpu");
        assert_eq!(cfg.inputs.len(), 2);
        assert_eq!(cfg.inputs[1].name(), "puller_json");
        assert!(matches!(&cfg.inputs[0], InputConfig::Csv { files, .. } if files.len() == 2));
        assert_eq!(cfg.outputs[0].name(), "pusher_csv");
        assert!(matches!(cfg.outputs[1], OutputConfig::Stdout { .. }));
    }

    #[test]
    fn test_validation_accepts_valid_config() {
        valid_config().validate().expect("valid config");
    }

    #[test]
    fn test_validation_requires_inputs_and_outputs() {
        let mut cfg = valid_config();
        cfg.inputs.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("input"));

        let mut cfg = valid_config();
        cfg.outputs.clear();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("output"));
    }

    #[test]
    fn test_validation_tick_depth_zero() {
        let mut cfg = valid_config();
        cfg.formula.tick_depth = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("tick_depth"));
    }

    #[test]
    fn test_validation_channel_capacity_zero() {
        let mut cfg = valid_config();
        cfg.channel_capacity = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("channel_capacity"));
    }

    #[test]
    fn test_validation_duplicate_output_name() {
        let mut cfg = valid_config();
        cfg.outputs.push(OutputConfig::Csv {
            name: "pusher_stdout".to_string(),
            directory: PathBuf::from("/tmp"),
        });
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate output name"));
    }

    #[test]
    fn test_validation_csv_input_without_files() {
        let mut cfg = valid_config();
        cfg.inputs = vec![InputConfig::Csv {
            name: "empty".to_string(),
            files: Vec::new(),
        }];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("at least one file"));
    }

    #[test]
    fn test_unknown_input_type_rejected() {
        let yaml = "inputs:\n  - type: mongodb\n    name: puller\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }
}
