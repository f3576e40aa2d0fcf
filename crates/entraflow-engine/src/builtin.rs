//! Built-in agents, so workflows can run without external plug-ins.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use entraflow_core::error::{EntraflowError, Result};
use entraflow_core::payload::Payload;
use entraflow_core::traits::Agent;
use entraflow_core::types::{AgentContext, AgentHealth};

/// Execution counters shared by the built-in agents.
#[derive(Default)]
struct HealthCounter {
    executions: AtomicU64,
    failures: AtomicU64,
    last_run_at: Mutex<Option<DateTime<Utc>>>,
}

impl HealthCounter {
    fn record<T>(&self, result: &Result<T>) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if result.is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut last) = self.last_run_at.lock() {
            *last = Some(Utc::now());
        }
    }

    fn snapshot(&self, name: &str) -> AgentHealth {
        AgentHealth {
            name: name.to_string(),
            executions: self.executions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_run_at: self.last_run_at.lock().ok().and_then(|l| *l),
        }
    }
}

/// Forwards upstream payloads.
///
/// With `config.from = "<node>"` it returns that node's payload unchanged.
/// Otherwise it returns an object of every upstream payload keyed by node id,
/// or the run inputs when the node has no upstream.
#[derive(Default)]
pub struct PassthroughAgent {
    health: HealthCounter,
}

impl PassthroughAgent {
    fn forward(ctx: &AgentContext) -> Result<Payload> {
        if let Some(from) = ctx.config.get("from").and_then(|v| v.as_str()) {
            return ctx.upstream(from).cloned().ok_or_else(|| EntraflowError::Execution {
                agent: "passthrough".into(),
                message: format!("no upstream payload from '{}'", from),
            });
        }
        if ctx.upstream.is_empty() {
            return Ok(Payload::new(serde_json::to_value(&ctx.inputs)?));
        }
        Ok(Payload::new(serde_json::to_value(&ctx.upstream)?))
    }
}

impl Agent for PassthroughAgent {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn description(&self) -> &str {
        "Forward upstream payloads (or run inputs) unchanged"
    }

    fn execute(&self, ctx: AgentContext) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let result = Self::forward(&ctx);
            self.health.record(&result);
            result
        })
    }

    fn status(&self) -> AgentHealth {
        self.health.snapshot(self.name())
    }
}

/// Returns `config.value`, or the whole config table when `value` is absent.
#[derive(Default)]
pub struct ConstantAgent {
    health: HealthCounter,
}

impl Agent for ConstantAgent {
    fn name(&self) -> &str {
        "constant"
    }

    fn description(&self) -> &str {
        "Emit a fixed payload from the node configuration"
    }

    fn execute(&self, ctx: AgentContext) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let value = match ctx.config.get("value") {
                Some(v) => v.clone(),
                None => ctx.config.clone(),
            };
            let result = Ok(Payload::new(value));
            self.health.record(&result);
            result
        })
    }

    fn status(&self) -> AgentHealth {
        self.health.snapshot(self.name())
    }
}

/// Runs `config.command` with `bash -c`.
///
/// The process receives `{"inputs": ..., "upstream": ...}` as JSON on stdin
/// and `ENTRAFLOW_RUN_ID`, `ENTRAFLOW_NODE_ID`, `ENTRAFLOW_ATTEMPT` in its
/// environment. Stdout is parsed as JSON, falling back to a trimmed string.
/// A non-zero exit status fails the attempt.
#[derive(Default)]
pub struct CommandAgent {
    health: HealthCounter,
}

#[derive(Deserialize)]
struct CommandConfig {
    command: String,
    #[serde(default)]
    working_dir: Option<String>,
}

impl CommandAgent {
    fn parse_config(ctx: &AgentContext) -> Result<CommandConfig> {
        let config: CommandConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| EntraflowError::Validation(format!("command config: {}", e)))?;
        if config.command.trim().is_empty() {
            return Err(EntraflowError::Validation("command is empty".into()));
        }
        Ok(config)
    }

    async fn run_command(ctx: AgentContext) -> Result<Payload> {
        let config = Self::parse_config(&ctx)?;
        let stdin_doc = serde_json::json!({
            "inputs": ctx.inputs,
            "upstream": ctx.upstream,
        });

        debug!(node_id = %ctx.node_id, command = %config.command, "Executing command agent");

        let mut command = tokio::process::Command::new("bash");
        command
            .arg("-c")
            .arg(&config.command)
            .env("ENTRAFLOW_RUN_ID", ctx.run_id.as_str())
            .env("ENTRAFLOW_NODE_ID", &ctx.node_id)
            .env("ENTRAFLOW_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The engine drops the future on timeout; take the child with it.
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| exec_error(e.to_string()))?;
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A command that never reads stdin closes the pipe early.
                if let Err(e) = stdin.write_all(stdin_doc.to_string().as_bytes()).await {
                    debug!(error = %e, "Command closed stdin early");
                }
            }
        };

        // Feed stdin while draining stdout so neither pipe can fill up.
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| exec_error(e.to_string()))?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(exec_error(format!("exit code {}: {}", code, stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        let value = serde_json::from_str(trimmed)
            .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()));
        Ok(Payload::new(value))
    }
}

fn exec_error(message: String) -> EntraflowError {
    EntraflowError::Execution {
        agent: "command".into(),
        message,
    }
}

impl Agent for CommandAgent {
    fn name(&self) -> &str {
        "command"
    }

    fn description(&self) -> &str {
        "Run a shell command; stdout becomes the payload"
    }

    fn validate_input(&self, ctx: &AgentContext) -> Result<()> {
        Self::parse_config(ctx).map(|_| ())
    }

    fn execute(&self, ctx: AgentContext) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let result = Self::run_command(ctx).await;
            self.health.record(&result);
            result
        })
    }

    fn status(&self) -> AgentHealth {
        self.health.snapshot(self.name())
    }
}
