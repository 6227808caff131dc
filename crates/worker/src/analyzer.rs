// crates/worker/src/analyzer.rs
//! Adapter around the external analyzer subprocess.
//!
//! The analyzer is a JVM tool that reads one staged log file and writes its
//! section-delimited report to stdout. The adapter's job is narrow: spawn
//! the child in its own process group with a bounded heap, capture stdout,
//! and guarantee the group is killed and temp files removed on every exit
//! path (success, failure, timeout, cancel). It never interprets the
//! report.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Hard cap on diagnostic text carried in errors.
const MAX_DIAGNOSTIC_BYTES: usize = 2048;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer failed: {detail}")]
    Failed { detail: String },

    #[error("analyzer exceeded {secs}s wall-clock budget")]
    Timeout { secs: u64 },

    #[error("analyzer cancelled")]
    Cancelled,

    #[error("analyzer spawn failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Command template for the analyzer. `{heap}` expands to the heap ceiling
/// in MB and `{input}` to the staged file path.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub command: Vec<String>,
    pub timeout: Duration,
}

impl AnalyzerConfig {
    /// Standard JVM invocation: `java -Xmx<heap>m -jar <jar> <input>`.
    pub fn java(java_bin: &str, jar: &Path, timeout: Duration) -> Self {
        Self {
            command: vec![
                java_bin.to_string(),
                "-Xmx{heap}m".to_string(),
                "-jar".to_string(),
                jar.display().to_string(),
                "{input}".to_string(),
            ],
            timeout,
        }
    }

    fn resolve(&self, heap_mb: u32, input: &Path) -> Vec<String> {
        self.command
            .iter()
            .map(|token| {
                token
                    .replace("{heap}", &heap_mb.to_string())
                    .replace("{input}", &input.display().to_string())
            })
            .collect()
    }
}

/// Capability seam so pipeline tests can substitute a canned report.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// Run the analyzer on a staged local file and return its report text.
    async fn run(
        &self,
        input: &Path,
        heap_mb: u32,
        cancel: &CancellationToken,
    ) -> Result<String, AnalyzerError>;
}

/// Production analyzer: spawns the configured command as a subprocess.
pub struct CommandAnalyzer {
    config: AnalyzerConfig,
}

impl CommandAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // The child was spawned as its own group leader, so its pid is the
        // group id; this takes down the JVM and anything it forked.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn run(
        &self,
        input: &Path,
        heap_mb: u32,
        cancel: &CancellationToken,
    ) -> Result<String, AnalyzerError> {
        let argv = self.config.resolve(heap_mb, input);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| AnalyzerError::Failed {
                detail: "empty analyzer command".to_string(),
            })?;

        debug!(program, heap_mb, input = %input.display(), "spawning analyzer");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        let pid = child.id();
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        tokio::select! {
            result = &mut wait => {
                let output = result?;
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !output.status.success() || !stderr.trim().is_empty() {
                    let detail = if stderr.trim().is_empty() {
                        format!("exit status {}", output.status)
                    } else {
                        truncate_utf8(stderr.trim(), MAX_DIAGNOSTIC_BYTES)
                    };
                    warn!(status = %output.status, "analyzer failed");
                    return Err(AnalyzerError::Failed { detail });
                }
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            _ = tokio::time::sleep(self.config.timeout) => {
                warn!(secs = self.config.timeout.as_secs(), "analyzer timed out, killing process group");
                kill_process_group(pid);
                Err(AnalyzerError::Timeout { secs: self.config.timeout.as_secs() })
            }
            _ = cancel.cancelled() => {
                kill_process_group(pid);
                Err(AnalyzerError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell(script: &str, timeout: Duration) -> CommandAnalyzer {
        CommandAnalyzer::new(AnalyzerConfig {
            command: vec!["/bin/sh".into(), "-c".into(), script.into()],
            timeout,
        })
    }

    #[test]
    fn test_command_template_substitution() {
        let config = AnalyzerConfig::java(
            "java",
            Path::new("/opt/analyzer.jar"),
            Duration::from_secs(60),
        );
        let argv = config.resolve(4096, Path::new("/tmp/staged.log"));
        assert_eq!(
            argv,
            vec![
                "java",
                "-Xmx4096m",
                "-jar",
                "/opt/analyzer.jar",
                "/tmp/staged.log"
            ]
        );
    }

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        let text = "héllo wörld".repeat(300);
        let truncated = truncate_utf8(&text, 100);
        assert!(truncated.len() <= 104);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncate_utf8("short", 100), "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_run_captures_stdout() {
        let analyzer = shell("printf 'report body'", Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let report = analyzer
            .run(Path::new("/dev/null"), 512, &cancel)
            .await
            .unwrap();
        assert_eq!(report, "report body");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let analyzer = shell("echo boom >&2; exit 2", Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let err = analyzer
            .run(Path::new("/dev/null"), 512, &cancel)
            .await
            .unwrap_err();
        match err {
            AnalyzerError::Failed { detail } => assert!(detail.contains("boom")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stderr_alone_is_failed() {
        let analyzer = shell("echo warning >&2; exit 0", Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let err = analyzer
            .run(Path::new("/dev/null"), 512, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Failed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_child() {
        let analyzer = shell("sleep 30", Duration::from_millis(200));
        let cancel = CancellationToken::new();
        let err = analyzer
            .run(Path::new("/dev/null"), 512, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_kills_child() {
        let analyzer = shell("sleep 30", Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = analyzer
            .run(Path::new("/dev/null"), 512, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalyzerError::Cancelled));
    }
}
