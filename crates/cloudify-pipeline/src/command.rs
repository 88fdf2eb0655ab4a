//! Subprocess-backed agents.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use cloudify_core::{Agent, AgentContext, AgentError, AgentOutput, ModelRole};
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::debug;

/// Environment variable carrying the routed model id to the child process.
pub const ENV_MODEL: &str = "CLOUDIFY_MODEL";
pub const ENV_AGENT: &str = "CLOUDIFY_AGENT";
pub const ENV_RUN_ID: &str = "CLOUDIFY_RUN_ID";
pub const ENV_ATTEMPT: &str = "CLOUDIFY_ATTEMPT";

/// Lines of stdout starting with this prefix are reported as warnings.
const WARNING_PREFIX: &str = "warning:";

/// Stderr is truncated to this many bytes in error messages.
const STDERR_TAIL: usize = 2048;

/// An agent whose work is one external command.
///
/// Stdout that parses as a JSON object becomes the result data; otherwise the
/// trimmed text is stored under `stdout`. When a model role is set the routed
/// model id is passed in `CLOUDIFY_MODEL`, and a failing command is re-run
/// with each fallback model in turn.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    name: String,
    command: Vec<String>,
    rollback: Option<Vec<String>>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    model_role: Option<ModelRole>,
}

impl CommandAgent {
    pub fn new(name: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command,
            rollback: None,
            env: BTreeMap::new(),
            working_dir: None,
            model_role: None,
        }
    }

    pub fn with_rollback(mut self, command: Vec<String>) -> Self {
        self.rollback = Some(command);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_model_role(mut self, role: ModelRole) -> Self {
        self.model_role = Some(role);
        self
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    async fn spawn(
        &self,
        ctx: &AgentContext,
        argv: &[String],
        model: Option<String>,
    ) -> Result<CommandOutput, AgentError> {
        let (exe, args) = argv
            .split_first()
            .ok_or_else(|| AgentError::work(format!("agent {} has an empty command", self.name)))?;

        let mut cmd = Command::new(exe);
        cmd.args(args)
            .envs(&self.env)
            .env(ENV_AGENT, &self.name)
            .env(ENV_RUN_ID, ctx.run_id().to_string())
            .env(ENV_ATTEMPT, ctx.attempt().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(model) = &model {
            cmd.env(ENV_MODEL, model);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        debug!(agent = %self.name, exe = %exe, model = ?model, "spawning command");

        ctx.invoke_tool(exe, || async move {
            let output = cmd.output().await.map_err(|e| AgentError::ToolFailed {
                tool_name: exe.clone(),
                message: format!("failed to spawn: {e}"),
            })?;
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let code = output
                    .status
                    .code()
                    .map_or_else(|| "signal".to_string(), |c| c.to_string());
                return Err(AgentError::ToolFailed {
                    tool_name: exe.clone(),
                    message: format!("exit code {code}: {}", tail(stderr.trim(), STDERR_TAIL)),
                });
            }
            Ok(CommandOutput {
                stdout,
                exit_code: output.status.code().unwrap_or(0),
            })
        })
        .await
    }
}

struct CommandOutput {
    stdout: String,
    exit_code: i32,
}

impl CommandOutput {
    fn into_agent_output(self, model: Option<String>) -> AgentOutput {
        let warnings = self
            .stdout
            .lines()
            .filter_map(|l| l.trim().strip_prefix(WARNING_PREFIX))
            .map(|w| w.trim().to_string())
            .collect();

        let mut data = match serde_json::from_str::<Value>(self.stdout.trim()) {
            Ok(Value::Object(map)) => map,
            _ => {
                let mut map = Map::new();
                map.insert("stdout".to_string(), Value::from(self.stdout.trim()));
                map
            }
        };
        data.insert("exit_code".to_string(), Value::from(self.exit_code));
        if let Some(model) = model {
            data.insert("model".to_string(), Value::from(model));
        }

        AgentOutput { data, warnings }
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[async_trait]
impl Agent for CommandAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
        match self.model_role {
            Some(role) => {
                ctx.with_model_fallback(role, |selection| async move {
                    let out = self
                        .spawn(ctx, &self.command, Some(selection.model.clone()))
                        .await?;
                    Ok(out.into_agent_output(Some(selection.model)))
                })
                .await
            }
            None => Ok(self
                .spawn(ctx, &self.command, None)
                .await?
                .into_agent_output(None)),
        }
    }

    async fn rollback(&self, ctx: &AgentContext) -> Result<(), AgentError> {
        if let Some(command) = &self.rollback {
            self.spawn(ctx, command, None).await?;
        }
        Ok(())
    }
}
