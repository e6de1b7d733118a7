//! Oracle backed by an external program speaking JSON over stdin/stdout.
//!
//! The program receives one [`OracleRequest`] on stdin and must print one
//! [`OracleOutput`] on stdout before exiting with status zero.

use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::traits::{timeout_from_secs, Oracle, OracleOutput, OracleRequest};
use crate::error::OracleError;
use crate::structure::Configuration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOracleConfig {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Wall-clock limit per call; none by default.
    #[serde(default)]
    pub timeout_secs: Option<f64>,
    /// Forwarded to the program inside every request.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CommandOracle {
    config: CommandOracleConfig,
    timeout: Option<Duration>,
}

impl CommandOracle {
    pub fn new(config: CommandOracleConfig) -> Result<Self, OracleError> {
        if config.command.is_empty() {
            return Err(OracleError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty oracle command"),
            });
        }
        let timeout = config.timeout_secs.map(timeout_from_secs).transpose()?;
        Ok(Self { config, timeout })
    }

    async fn run(&self, payload: Vec<u8>) -> Result<std::process::Output, OracleError> {
        let program = &self.config.command[0];
        let mut child = Command::new(program)
            .args(&self.config.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| OracleError::Spawn {
                program: program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that exits without reading its input surfaces through
            // its exit status instead.
            if let Err(err) = stdin.write_all(&payload).await {
                if err.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(OracleError::Transport(err.to_string()));
                }
            }
        }

        child
            .wait_with_output()
            .await
            .map_err(|err| OracleError::Transport(err.to_string()))
    }
}

impl Oracle for CommandOracle {
    async fn evaluate(&self, configuration: &Configuration) -> Result<OracleOutput, OracleError> {
        let request = OracleRequest::new(configuration, &self.config.parameters);
        let payload = serde_json::to_vec(&request).map_err(|e| OracleError::Malformed(e.to_string()))?;
        debug!(
            program = %self.config.command[0],
            step = configuration.step_index,
            atoms = configuration.len(),
            "invoking oracle command"
        );

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.run(payload))
                .await
                .map_err(|_| OracleError::Timeout {
                    secs: limit.as_secs_f64(),
                })??,
            None => self.run(payload).await?,
        };

        if !output.status.success() {
            return Err(OracleError::Process {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let parsed: OracleOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| OracleError::Malformed(e.to_string()))?;
        parsed.validate(configuration.len())
    }

    fn name(&self) -> &str {
        &self.config.command[0]
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn frame() -> Configuration {
        Configuration::new(
            vec![[0.0; 3], [1.0, 0.0, 0.0]],
            [[10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 10.0]],
            vec!["Ar".into(), "Ar".into()],
        )
    }

    fn shell(script: &str, timeout_secs: Option<f64>) -> CommandOracle {
        CommandOracle::new(CommandOracleConfig {
            command: vec!["sh".into(), "-c".into(), script.into()],
            timeout_secs,
            parameters: serde_json::Value::Null,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_parses_forces_from_stdout() {
        let oracle = shell(
            r#"cat > /dev/null; echo '{"forces": [[1,0,0],[-1,0,0]], "energy": -2.5}'"#,
            None,
        );
        let out = oracle.evaluate(&frame()).await.unwrap();
        assert_eq!(out.forces[1], [-1.0, 0.0, 0.0]);
        assert_eq!(out.energy, Some(-2.5));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_a_process_error() {
        let oracle = shell("echo boom >&2; exit 3", None);
        match oracle.evaluate(&frame()).await {
            Err(OracleError::Process { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_garbage_output_is_malformed() {
        let oracle = shell("cat > /dev/null; echo not-json", None);
        assert!(matches!(
            oracle.evaluate(&frame()).await,
            Err(OracleError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_atom_count() {
        let oracle = shell(r#"cat > /dev/null; echo '{"forces": [[0,0,0]]}'"#, None);
        assert!(matches!(
            oracle.evaluate(&frame()).await,
            Err(OracleError::AtomCount { expected: 2, got: 1 })
        ));
    }

    #[tokio::test]
    async fn test_timeout_is_fatal() {
        let oracle = shell("sleep 5", Some(0.2));
        assert!(matches!(
            oracle.evaluate(&frame()).await,
            Err(OracleError::Timeout { .. })
        ));
    }

    #[test]
    fn test_infinite_timeout_is_rejected_up_front() {
        let err = CommandOracle::new(CommandOracleConfig {
            command: vec!["sh".into()],
            timeout_secs: Some(f64::INFINITY),
            parameters: serde_json::Value::Null,
        })
        .unwrap_err();
        assert!(matches!(err, OracleError::InvalidTimeout(_)));
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let oracle = CommandOracle::new(CommandOracleConfig {
            command: vec!["/nonexistent/oracle-binary".into()],
            timeout_secs: None,
            parameters: serde_json::Value::Null,
        })
        .unwrap();
        assert!(matches!(
            oracle.evaluate(&frame()).await,
            Err(OracleError::Spawn { .. })
        ));
    }
}
