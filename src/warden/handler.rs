//! Restart and fallback handlers
//!
//! The executor never knows how to restart a component or switch a
//! dependency; it looks up a handler registered under the target name.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Which strategy a handler serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerRole {
    Restart,
    Fallback,
}

impl std::fmt::Display for HandlerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerRole::Restart => write!(f, "restart"),
            HandlerRole::Fallback => write!(f, "fallback"),
        }
    }
}

/// Performs one remediation for a named component or dependency
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// Run the remediation; must give up once `deadline` has passed
    async fn recover(&self, target: &str, deadline: Duration) -> Result<()>;
}

/// A handler definition from the config file (`[[restart]]` / `[[fallback]]`)
#[derive(Debug, Clone, Deserialize)]
pub struct ActionDef {
    /// Component id or dependency name the action applies to
    #[serde(alias = "component", alias = "dependency")]
    pub target: String,

    /// Shell command to execute on the host
    pub command: String,
}

/// Handler that runs a shell command; `LAZARUS_TARGET` carries the target
#[derive(Debug, Clone)]
pub struct CommandAction {
    role: HandlerRole,
    command: String,
}

impl CommandAction {
    pub fn new(role: HandlerRole, command: impl Into<String>) -> Self {
        Self {
            role,
            command: command.into(),
        }
    }
}

#[async_trait]
impl RecoveryHandler for CommandAction {
    async fn recover(&self, target: &str, deadline: Duration) -> Result<()> {
        let failure = |message: String| Error::RecoveryStrategyFailure {
            resource: target.to_string(),
            strategy: self.role.to_string(),
            message,
        };

        debug!(handler_target = target, role = %self.role, command = %self.command, "running recovery command");

        let output = Command::new("sh")
            .args(["-c", &self.command])
            .env("LAZARUS_TARGET", target)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(deadline, output)
            .await
            .map_err(|_| Error::RecoveryTimeout(deadline.as_millis() as u64))?
            .map_err(|e| failure(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(failure(format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_def_aliases() {
        #[derive(Deserialize)]
        struct Wrapper {
            restart: Vec<ActionDef>,
            fallback: Vec<ActionDef>,
        }

        let toml = r#"
[[restart]]
component = "worker-7"
command = "systemctl restart worker@7"

[[fallback]]
dependency = "vector-store"
command = "switch-replica vector-store"
"#;
        let parsed: Wrapper = toml::from_str(toml).unwrap();
        assert_eq!(parsed.restart[0].target, "worker-7");
        assert_eq!(parsed.fallback[0].target, "vector-store");
    }

    #[tokio::test]
    async fn test_command_action_success() {
        let action = CommandAction::new(HandlerRole::Restart, "test \"$LAZARUS_TARGET\" = worker-7");
        assert!(action.recover("worker-7", Duration::from_secs(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_command_action_failure() {
        let action = CommandAction::new(HandlerRole::Fallback, "echo nope >&2; exit 3");
        let err = action
            .recover("vector-store", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Recovery strategy 'fallback' failed for 'vector-store': exit 3: nope"
        );
    }

    #[tokio::test]
    async fn test_command_action_deadline() {
        let action = CommandAction::new(HandlerRole::Restart, "sleep 10");
        let err = action
            .recover("worker-7", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RecoveryTimeout(100)));
    }
}
