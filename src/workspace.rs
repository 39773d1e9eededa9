//! Workspaces: named groups of tasks sharing an environment, plus the
//! functions and columns used to compute derived display values.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{FunctionConfig, GlobalsConfig, WorkspaceConfig};
use crate::events::Notifier;
use crate::task::{Task, TaskSnapshot, TaskSpec};
use crate::vars::{replace_vars, Environment};

/// A parameterized command template.
#[derive(Debug, Clone, Serialize)]
pub struct Function {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    pub command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub executor: Vec<String>,
}

impl Function {
    fn from_config(name: &str, config: &FunctionConfig) -> Self {
        Self {
            name: name.to_string(),
            args: config.args.clone(),
            command: config.command.clone(),
            executor: config.executor.clone(),
        }
    }
}

/// A named, pre-bound function invocation.
#[derive(Debug, Clone, Serialize)]
pub struct Column {
    pub function: String,
    pub args: Vec<String>,
}

/// Environment and functions visible to every workspace.
#[derive(Debug, Clone, Default)]
pub struct Globals {
    pub environment: Environment,
    pub functions: BTreeMap<String, Function>,
}

impl Globals {
    pub fn from_config(config: GlobalsConfig) -> Self {
        let functions = config
            .functions
            .iter()
            .map(|(name, function)| (name.clone(), Function::from_config(name, function)))
            .collect();
        Self {
            environment: config.environment,
            functions,
        }
    }
}

#[derive(Debug)]
pub struct Workspace {
    name: String,
    environment: Environment,
    inherit_environment: bool,
    tasks: BTreeMap<String, Task>,
    functions: BTreeMap<String, Function>,
    columns: BTreeMap<String, Column>,
}

/// Serializable view of a workspace.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceSnapshot {
    pub name: String,
    pub environment: Environment,
    pub inherit_environment: bool,
    pub functions: BTreeMap<String, Function>,
    pub columns: BTreeMap<String, Column>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<BTreeMap<String, TaskSnapshot>>,
}

impl Workspace {
    pub fn new(name: &str) -> Self {
        let mut environment = Environment::new();
        environment.insert("WORKSPACE".to_string(), name.to_string());
        Self {
            name: name.to_string(),
            environment,
            inherit_environment: false,
            tasks: BTreeMap::new(),
            functions: BTreeMap::new(),
            columns: BTreeMap::new(),
        }
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn columns(&self) -> &BTreeMap<String, Column> {
        &self.columns
    }

    /// Workspace-local functions first, then the shared set.
    pub fn resolve_function(&self, name: &str, globals: &Globals) -> Option<Function> {
        self.functions
            .get(name)
            .or_else(|| globals.functions.get(name))
            .cloned()
    }

    /// Folds one configuration document into this workspace.
    ///
    /// Later documents add to the environment (overwriting keys), register
    /// their functions and columns, and replace same-name tasks. Task
    /// environments layer globals, then the workspace, then the task itself.
    pub fn merge_config(&mut self, config: &WorkspaceConfig, globals: &Globals, notifier: &Notifier) {
        self.environment
            .extend(config.environment.iter().map(|(k, v)| (k.clone(), v.clone())));

        if config.inherit_environment {
            self.inherit_environment = true;
            info!(workspace = %self.name, "inheriting process environment");
            self.inherit_process_environment(std::env::vars());
        }

        for (name, function) in &config.functions {
            info!(workspace = %self.name, function = %name, "registering function");
            self.functions
                .insert(name.clone(), Function::from_config(name, function));
        }

        for (name, binding) in &config.columns {
            if let Some((function, args)) = binding.iter().next() {
                self.columns.insert(
                    name.clone(),
                    Column {
                        function: function.clone(),
                        args: args.clone(),
                    },
                );
            }
        }

        for task in &config.tasks {
            info!(workspace = %self.name, task = %task.name, "creating task");
            if self.tasks.contains_key(&task.name) {
                warn!(workspace = %self.name, task = %task.name, "task already exists, overwriting");
            }

            let mut environment = globals.environment.clone();
            environment.extend(self.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
            environment.extend(task.environment.iter().map(|(k, v)| (k.clone(), v.clone())));

            let spec = TaskSpec {
                id: task.id.unwrap_or(self.tasks.len()),
                name: task.name.clone(),
                workspace: self.name.clone(),
                command: task.command.clone(),
                executor: task.executor.clone(),
                environment,
                stdout: task.stdout.clone(),
                stderr: task.stderr.clone(),
                pwd: task.pwd.clone(),
                kill_signal: task.kill_signal,
                metadata: task.metadata.clone(),
            };
            self.tasks.insert(
                task.name.clone(),
                Task::new(spec, task.service, notifier.clone()),
            );
        }
    }

    /// Copies process variables in without replacing configured ones.
    fn inherit_process_environment(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (key, value) in vars {
            if key.trim().is_empty() {
                warn!(workspace = %self.name, "skipping empty environment key");
                continue;
            }
            if !self.environment.contains_key(&key) {
                debug!(workspace = %self.name, key = %key, "inherited variable");
                self.environment.insert(key, value);
            }
        }
    }

    /// Starts every task flagged as a service.
    pub fn start_services(&self) {
        for task in self.tasks.values().filter(|task| task.is_service()) {
            task.start();
        }
    }

    /// Descriptive fields only. Task snapshots read captured output, so
    /// callers build them from [`Workspace::task_handles`] once any
    /// registry lock is released.
    pub fn summary(&self) -> WorkspaceSnapshot {
        WorkspaceSnapshot {
            name: self.name.clone(),
            environment: self.environment.clone(),
            inherit_environment: self.inherit_environment,
            functions: self.functions.clone(),
            columns: self.columns.clone(),
            tasks: None,
        }
    }

    pub fn task_handles(&self) -> Vec<(String, Task)> {
        self.tasks
            .iter()
            .map(|(name, task)| (name.clone(), task.clone()))
            .collect()
    }
}

impl WorkspaceSnapshot {
    /// Fills in the task map from handles taken out of the registry.
    pub fn with_tasks(mut self, tasks: &[(String, Task)]) -> Self {
        self.tasks = Some(
            tasks
                .iter()
                .map(|(name, task)| (name.clone(), task.snapshot()))
                .collect(),
        );
        self
    }
}

/// Builds the workspace map from configuration documents, merging documents
/// that share a name in the order given. Services are not started here.
pub fn configure_workspaces(
    configs: &[WorkspaceConfig],
    globals: &Globals,
    notifier: &Notifier,
) -> BTreeMap<String, Workspace> {
    let mut workspaces: BTreeMap<String, Workspace> = BTreeMap::new();
    for config in configs {
        let workspace = match workspaces.get_mut(&config.name) {
            Some(existing) => {
                warn!(workspace = %config.name, "workspace already exists, merging tasks and environment");
                existing
            }
            None => {
                info!(workspace = %config.name, "creating workspace");
                workspaces
                    .entry(config.name.clone())
                    .or_insert_with(|| Workspace::new(&config.name))
            }
        };
        workspace.merge_config(config, globals, notifier);
    }
    workspaces
}

/// Runs `function` synchronously on behalf of `task` and returns its stdout.
///
/// Arguments bind positionally to the function's parameters after their own
/// `$key` tokens have been resolved from the task's metadata. The command
/// then runs as an ephemeral, non-service task with the owning task's
/// environment plus the bound parameters. Blocks for as long as the command
/// takes.
pub async fn exec_function(function: &Function, args: &[String], task: &Task) -> String {
    let owner = task.spec();
    let mut environment = owner.environment.clone();
    for (param, value) in function.args.iter().zip(args) {
        environment.insert(param.clone(), replace_vars(value, &owner.metadata));
    }

    let spec = TaskSpec {
        id: owner.id,
        name: format!("{}:{}", owner.name, function.name),
        workspace: owner.workspace.clone(),
        command: function.command.clone(),
        executor: function.executor.clone(),
        environment,
        pwd: owner.pwd.clone(),
        ..TaskSpec::default()
    };
    let ephemeral = Task::new(spec, false, Notifier::detached());
    let code = ephemeral.start().wait().await;
    debug!(function = %function.name, task = %owner.name, code, "function finished");

    ephemeral
        .runs()
        .last()
        .map(|run| run.stdout_text())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use crate::task::TaskStatus;

    fn task_config(name: &str, command: &str) -> TaskConfig {
        TaskConfig {
            name: name.to_string(),
            command: command.to_string(),
            ..TaskConfig::default()
        }
    }

    fn workspace_config(name: &str, tasks: Vec<TaskConfig>) -> WorkspaceConfig {
        WorkspaceConfig {
            name: name.to_string(),
            tasks,
            ..WorkspaceConfig::default()
        }
    }

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn environment_layers_globals_workspace_task() {
        let globals = Globals {
            environment: env(&[("A", "global"), ("B", "global"), ("C", "global")]),
            functions: BTreeMap::new(),
        };
        let mut task = task_config("t", "echo");
        task.environment = env(&[("C", "task")]);
        let mut config = workspace_config("w1", vec![task]);
        config.environment = env(&[("B", "workspace"), ("C", "workspace")]);

        let workspaces = configure_workspaces(&[config], &globals, &Notifier::detached());
        let task = workspaces["w1"].task("t").unwrap();
        let environment = &task.spec().environment;

        assert_eq!(environment["A"], "global");
        assert_eq!(environment["B"], "workspace");
        assert_eq!(environment["C"], "task");
        assert_eq!(environment["WORKSPACE"], "w1");
        assert_eq!(environment["TASK"], "t");
    }

    #[test]
    fn inherited_environment_never_overrides_config() {
        let mut workspace = Workspace::new("w");
        workspace.environment.insert("KEEP".to_string(), "configured".to_string());
        workspace.inherit_process_environment(vec![
            ("KEEP".to_string(), "inherited".to_string()),
            ("NEW".to_string(), "inherited".to_string()),
            (" ".to_string(), "skipped".to_string()),
        ]);

        assert_eq!(workspace.environment["KEEP"], "configured");
        assert_eq!(workspace.environment["NEW"], "inherited");
        assert!(!workspace.environment.contains_key(" "));
    }

    #[test]
    fn same_name_documents_merge_and_later_task_wins() {
        let first = workspace_config("w", vec![task_config("a", "echo 1"), task_config("b", "echo b")]);
        let mut second = workspace_config("w", vec![task_config("a", "echo 2")]);
        second.functions.insert(
            "f".to_string(),
            FunctionConfig {
                args: Vec::new(),
                command: "echo f".to_string(),
                executor: Vec::new(),
            },
        );

        let workspaces =
            configure_workspaces(&[first, second], &Globals::default(), &Notifier::detached());
        assert_eq!(workspaces.len(), 1);
        let workspace = &workspaces["w"];
        assert_eq!(workspace.tasks().count(), 2);
        assert_eq!(workspace.task("a").unwrap().spec().command, "echo 2");
        assert!(workspace.resolve_function("f", &Globals::default()).is_some());
    }

    #[test]
    fn local_functions_shadow_globals() {
        let mut globals = Globals::default();
        for (name, command) in [("f", "echo global"), ("g", "echo shared")] {
            globals.functions.insert(
                name.to_string(),
                Function {
                    name: name.to_string(),
                    args: Vec::new(),
                    command: command.to_string(),
                    executor: Vec::new(),
                },
            );
        }
        let mut workspace = Workspace::new("w");
        workspace.functions.insert(
            "f".to_string(),
            Function {
                name: "f".to_string(),
                args: Vec::new(),
                command: "echo local".to_string(),
                executor: Vec::new(),
            },
        );

        assert_eq!(workspace.resolve_function("f", &globals).unwrap().command, "echo local");
        assert_eq!(workspace.resolve_function("g", &globals).unwrap().command, "echo shared");
        assert!(workspace.resolve_function("missing", &globals).is_none());
    }

    #[tokio::test]
    async fn function_binds_args_and_returns_stdout() {
        let function = Function {
            name: "greet".to_string(),
            args: vec!["name".to_string()],
            command: "echo hello $name".to_string(),
            executor: Vec::new(),
        };
        let owner = Task::new(
            TaskSpec {
                name: "t".to_string(),
                workspace: "w".to_string(),
                command: "true".to_string(),
                ..TaskSpec::default()
            },
            false,
            Notifier::detached(),
        );

        let out = exec_function(&function, &["bob".to_string()], &owner).await;
        assert_eq!(out, "hello bob\n");
        assert_eq!(owner.status(), TaskStatus::Stopped);
        assert!(owner.runs().is_empty());
    }

    #[tokio::test]
    async fn function_args_resolve_task_metadata() {
        let function = Function {
            name: "owner".to_string(),
            args: vec!["who".to_string()],
            command: "echo owned by $who in $WORKSPACE".to_string(),
            executor: vec!["sh".to_string(), "-c".to_string()],
        };
        let mut metadata = BTreeMap::new();
        metadata.insert("owner".to_string(), "alice".to_string());
        let mut environment = Environment::new();
        environment.insert("WORKSPACE".to_string(), "w9".to_string());
        let owner = Task::new(
            TaskSpec {
                name: "t".to_string(),
                workspace: "w9".to_string(),
                command: "true".to_string(),
                environment,
                metadata,
                ..TaskSpec::default()
            },
            false,
            Notifier::detached(),
        );

        let out = exec_function(&function, &["$owner".to_string()], &owner).await;
        assert_eq!(out, "owned by alice in w9\n");
    }
}
