//! Configuration documents for lencak.
//!
//! Each workspace document (YAML or TOML, picked by file extension) describes
//! one workspace: its shared environment, its tasks, its functions and the
//! columns bound to them. An optional globals document carries environment
//! and functions shared by every workspace.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::LencakError;
use crate::vars::Environment;

/// Default workspace file when none is given on the command line.
pub const DEFAULT_WORKSPACE_FILE: &str = "workspace.yml";

/// Signal used to stop a task's active process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub enum KillSignal {
    SigInt,
    SigTerm,
    #[default]
    SigKill,
}

impl KillSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillSignal::SigInt => "sigint",
            KillSignal::SigTerm => "sigterm",
            KillSignal::SigKill => "sigkill",
        }
    }
}

impl fmt::Display for KillSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KillSignal {
    type Err = LencakError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sigint" => Ok(KillSignal::SigInt),
            "sigterm" => Ok(KillSignal::SigTerm),
            "sigkill" => Ok(KillSignal::SigKill),
            other => Err(LencakError::InvalidKillSignal(other.to_string())),
        }
    }
}

impl TryFrom<String> for KillSignal {
    type Error = LencakError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KillSignal> for String {
    fn from(signal: KillSignal) -> Self {
        signal.as_str().to_string()
    }
}

/// One workspace document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkspaceConfig {
    pub name: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub inherit_environment: bool,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionConfig>,
    /// Column name to a single `function: [args]` binding.
    #[serde(default)]
    pub columns: BTreeMap<String, BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskConfig {
    pub id: Option<usize>,
    pub name: String,
    pub command: String,
    #[serde(default, alias = "killsignal")]
    pub kill_signal: KillSignal,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub service: bool,
    #[serde(default)]
    pub executor: Vec<String>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, alias = "metada")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub pwd: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionConfig {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(alias = "commands")]
    pub command: String,
    #[serde(default)]
    pub executor: Vec<String>,
}

/// Environment and functions shared by every workspace.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlobalsConfig {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionConfig>,
}

fn parse_document<T: DeserializeOwned>(path: &Path, raw: &str) -> Result<T> {
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        toml::from_str(raw).with_context(|| format!("failed to parse {}", path.display()))
    } else {
        serde_yaml::from_str(raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_document(path, &raw)
}

/// Loads and validates a single workspace document.
pub fn load_workspace(path: &Path) -> Result<WorkspaceConfig> {
    let config: WorkspaceConfig = read_document(path)?;
    validate_workspace(&config).with_context(|| format!("invalid workspace {}", path.display()))?;
    Ok(config)
}

/// Loads every workspace document in order. Same-name workspaces are kept
/// as separate entries and merged later, in this order.
pub fn load_workspaces(paths: &[PathBuf]) -> Result<Vec<WorkspaceConfig>> {
    let mut configs = Vec::with_capacity(paths.len());
    for path in paths {
        info!(path = %path.display(), "loading workspace file");
        configs.push(load_workspace(path)?);
    }
    Ok(configs)
}

pub fn load_globals(path: &Path) -> Result<GlobalsConfig> {
    info!(path = %path.display(), "loading globals file");
    read_document(path)
}

fn validate_workspace(config: &WorkspaceConfig) -> Result<(), LencakError> {
    if config.name.trim().is_empty() {
        return Err(LencakError::Config("workspace name must not be empty".to_string()));
    }
    for task in &config.tasks {
        if task.name.trim().is_empty() {
            return Err(LencakError::Config(format!(
                "workspace {} has a task without a name",
                config.name
            )));
        }
        if task.command.trim().is_empty() {
            return Err(LencakError::Config(format!(
                "task {} in workspace {} has an empty command",
                task.name, config.name
            )));
        }
    }
    for (column, binding) in &config.columns {
        if binding.len() != 1 {
            return Err(LencakError::Config(format!(
                "column {} must bind exactly one function (got {})",
                column,
                binding.len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const YAML: &str = r#"
name: w1
inherit_environment: true
environment:
  STAGE: dev
tasks:
  - name: t1
    command: echo hello
  - name: t2
    id: 9
    command: sleep 1
    service: true
    killsignal: SIGTERM
    executor: ["bash", "-c"]
    stdout: /tmp/$TASK.out
    metada:
      owner: bob
functions:
  greet:
    args: [name]
    commands: echo hello $name
columns:
  greeting:
    greet: ["$owner"]
"#;

    #[test]
    fn parses_yaml_workspace() {
        let config: WorkspaceConfig = parse_document(Path::new("w.yml"), YAML).unwrap();
        assert_eq!(config.name, "w1");
        assert!(config.inherit_environment);
        assert_eq!(config.environment.get("STAGE").map(String::as_str), Some("dev"));
        assert_eq!(config.tasks.len(), 2);

        let t1 = &config.tasks[0];
        assert_eq!(t1.kill_signal, KillSignal::SigKill);
        assert!(!t1.service);
        assert!(t1.executor.is_empty());

        let t2 = &config.tasks[1];
        assert_eq!(t2.id, Some(9));
        assert_eq!(t2.kill_signal, KillSignal::SigTerm);
        assert_eq!(t2.executor, vec!["bash", "-c"]);
        assert_eq!(t2.metadata.get("owner").map(String::as_str), Some("bob"));

        assert_eq!(config.functions["greet"].command, "echo hello $name");
        assert_eq!(config.columns["greeting"]["greet"], vec!["$owner"]);
        validate_workspace(&config).unwrap();
    }

    #[test]
    fn parses_toml_workspace() {
        let raw = r#"
name = "w2"

[environment]
A = "1"

[[tasks]]
name = "build"
command = "make"
kill_signal = "sigint"
pwd = "/src"
"#;
        let config: WorkspaceConfig = parse_document(Path::new("w.toml"), raw).unwrap();
        assert_eq!(config.name, "w2");
        assert_eq!(config.tasks[0].kill_signal, KillSignal::SigInt);
        assert_eq!(config.tasks[0].pwd, "/src");
    }

    #[test]
    fn rejects_unknown_kill_signal() {
        let raw = "name: w\ntasks:\n  - name: t\n    command: x\n    killsignal: sighup\n";
        let err = parse_document::<WorkspaceConfig>(Path::new("w.yml"), raw).unwrap_err();
        assert!(format!("{err:#}").contains("invalid killsignal sighup"));
    }

    #[test]
    fn rejects_column_with_two_bindings() {
        let raw = "name: w\ncolumns:\n  c:\n    f: []\n    g: []\n";
        let config: WorkspaceConfig = parse_document(Path::new("w.yml"), raw).unwrap();
        assert!(matches!(
            validate_workspace(&config),
            Err(LencakError::Config(msg)) if msg.contains("exactly one")
        ));
    }

    #[test]
    fn load_workspaces_keeps_order_and_fails_fast() {
        let mut first = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        write!(first, "name: a\ntasks:\n  - name: t\n    command: echo a\n").unwrap();
        let mut second = tempfile::Builder::new().suffix(".yml").tempfile().unwrap();
        write!(second, "name: a\ntasks:\n  - name: t\n    command: echo b\n").unwrap();

        let configs =
            load_workspaces(&[first.path().to_path_buf(), second.path().to_path_buf()]).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].tasks[0].command, "echo b");

        let missing = load_workspaces(&[PathBuf::from("/nonexistent/workspace.yml")]);
        assert!(missing.is_err());
    }

    #[test]
    fn kill_signal_round_trips_as_lowercase() {
        assert_eq!("SigInt".parse::<KillSignal>().unwrap(), KillSignal::SigInt);
        assert_eq!(String::from(KillSignal::SigTerm), "sigterm");
    }
}
