// Command Processor
//
// Runs an external transformation tool (dbt by default) once per cycle with
// the rhythm's selector. Success is the tool's exit status.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use super::scheduler::Processor;
use super::types::RhythmType;
use crate::config::ProcessorConfig;
use crate::error::{HypnosError, Result};
use crate::resilience::SecuritySanitizer;

/// Lines of tool output kept for logging
const OUTPUT_TAIL_LINES: usize = 20;

pub struct CommandProcessor {
    config: ProcessorConfig,
    sanitizer: SecuritySanitizer,
}

impl CommandProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            config,
            sanitizer: SecuritySanitizer::new(),
        }
    }

    /// Full argument list for one rhythm
    pub fn args_for(&self, rhythm: RhythmType) -> Vec<String> {
        let mut args = self.config.args.clone();
        if let Some(selector) = self.config.selectors.get(&rhythm) {
            args.push(self.config.selector_flag.clone());
            args.push(selector.clone());
        }
        args
    }

    fn tail(&self, bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        let lines: Vec<&str> = text.lines().collect();
        let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
        self.sanitizer.sanitize_text(&lines[start..].join("\n"))
    }
}

#[async_trait]
impl Processor for CommandProcessor {
    async fn run(&self, rhythm: RhythmType) -> Result<bool> {
        let args = self.args_for(rhythm);
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The scheduler's cycle timeout drops this future; take the child with it
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        debug!(rhythm = %rhythm, command = %self.config.command, ?args, "Spawning processor");
        let output = cmd.output().await.map_err(|e| {
            HypnosError::connection(
                self.config.command.clone(),
                format!("failed to spawn: {}", e),
            )
        })?;

        if output.status.success() {
            debug!(rhythm = %rhythm, output = %self.tail(&output.stdout), "Processor finished");
            Ok(true)
        } else {
            warn!(
                rhythm = %rhythm,
                status = %output.status,
                stderr = %self.tail(&output.stderr),
                stdout = %self.tail(&output.stdout),
                "Processor exited unsuccessfully"
            );
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(command: &str, args: &[&str]) -> CommandProcessor {
        CommandProcessor::new(ProcessorConfig {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn test_args_include_selector() {
        let p = CommandProcessor::new(ProcessorConfig::default());
        assert_eq!(
            p.args_for(RhythmType::DeepSleep),
            vec!["run", "--select", "tag:deep_sleep"]
        );
    }

    #[test]
    fn test_args_without_selector() {
        let mut config = ProcessorConfig::default();
        config.selectors.remove(&RhythmType::Continuous);
        let p = CommandProcessor::new(config);
        assert_eq!(p.args_for(RhythmType::Continuous), vec!["run"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_status_drives_result() {
        let ok = processor("true", &[]);
        assert!(ok.run(RhythmType::ShortTerm).await.unwrap());

        let failing = processor("false", &[]);
        assert!(!failing.run(RhythmType::ShortTerm).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_binary_is_connection_failure() {
        let p = processor("hypnos-no-such-binary", &[]);
        let err = p.run(RhythmType::LongTerm).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_output_tail_is_sanitized() {
        let p = processor("dbt", &[]);
        let out = p.tail(b"connecting postgres://etl:pw123@db/x\nline two");
        assert!(!out.contains("pw123"));
        assert!(out.contains("\\n"));
    }
}
