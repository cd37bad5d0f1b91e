use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::builder::Pipeline;
use super::frames::{collect_frames, FramePattern};
use super::stage::{ArtifactSpec, ResolvedArtifact, StageDescriptor};
use crate::error::{ConvertError, FailureReason, Result};
use crate::tools::ToolTable;
use crate::workspace::{safe_join, Workspace};

/// How long to wait for a killed process's pipes to drain
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Diagnostics captured from one stage run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    pub index: usize,
    pub stage: String,
    pub program: String,
    pub args: Vec<String>,
    /// `None` when the process never ran, was killed or was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
}

impl StageReport {
    /// Stdout and stderr combined, for searching and display
    pub fn output_text(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
        }
    }
}

/// Result of running every stage of a pipeline
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    /// Final stage's product, still inside the workspace
    pub artifact: PathBuf,
    pub reports: Vec<StageReport>,
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Runs pipeline stages as subprocesses, strictly one after another
#[derive(Debug, Clone)]
pub struct Executor {
    tools: ToolTable,
    stage_timeout: Duration,
    max_diagnostic_bytes: usize,
}

impl Executor {
    pub fn new(tools: ToolTable, stage_timeout: Duration) -> Self {
        Self {
            tools,
            stage_timeout,
            max_diagnostic_bytes: 64 * 1024,
        }
    }

    /// Cap on captured bytes per stream; the tail is kept
    pub fn with_diagnostic_limit(mut self, bytes: usize) -> Self {
        self.max_diagnostic_bytes = bytes.max(1);
        self
    }

    pub fn tools(&self) -> &ToolTable {
        &self.tools
    }

    pub fn stage_timeout(&self) -> Duration {
        self.stage_timeout
    }

    /// Run `pipeline` with artifacts placed at the workspace root
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        workspace: &Workspace,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutput> {
        self.run_in(pipeline, workspace.path(), input, cancel).await
    }

    /// Run `pipeline` with artifacts placed in `dir`, a directory inside a
    /// workspace owned by the caller.
    pub async fn run_in(
        &self,
        pipeline: &Pipeline,
        dir: &Path,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutput> {
        let mut current = ResolvedArtifact::File(input.to_path_buf());
        let mut reports = Vec::with_capacity(pipeline.len());
        let total = pipeline.len();

        for stage in &pipeline.stages {
            if cancel.is_cancelled() {
                warn!("🛑 Cancelled before stage '{}'", stage.name);
                return Err(ConvertError::Cancelled {
                    stage: stage.name.clone(),
                });
            }

            info!(
                "⚙️  Stage {}/{} '{}' ({})",
                stage.index + 1,
                total,
                stage.name,
                stage.tool
            );

            let (resolved, report) = self.run_stage(pipeline, stage, dir, &current, cancel).await?;
            debug!(
                "✅ Stage '{}' finished in {:.2}s",
                stage.name,
                report.elapsed.as_secs_f64()
            );
            reports.push(report);
            current = resolved;
        }

        match current {
            ResolvedArtifact::File(artifact) => Ok(ExecutionOutput { artifact, reports }),
            ResolvedArtifact::Frames { dir, .. } => Err(ConvertError::resource(
                format!("pipeline ended in a frame directory {}", dir.display()),
                std::io::Error::new(std::io::ErrorKind::InvalidData, "no single output file"),
            )),
        }
    }

    async fn run_stage(
        &self,
        pipeline: &Pipeline,
        stage: &StageDescriptor,
        dir: &Path,
        input: &ResolvedArtifact,
        cancel: &CancellationToken,
    ) -> Result<(ResolvedArtifact, StageReport)> {
        let output_path = safe_join(dir, stage.output.target())?;
        if let ArtifactSpec::Frames { .. } = stage.output {
            tokio::fs::create_dir_all(&output_path).await.map_err(|e| {
                ConvertError::resource(format!("creating {}", output_path.display()), e)
            })?;
        }

        let tool = self.tools.get(stage.tool);
        let argv = stage.materialize(&pipeline.options, input, &output_path);
        let mut report = StageReport {
            index: stage.index,
            stage: stage.name.clone(),
            program: tool.program.display().to_string(),
            args: tool.args.iter().cloned().chain(argv.iter().cloned()).collect(),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            started_at: Utc::now(),
            elapsed: Duration::ZERO,
        };
        debug!("🔧 {} {}", report.program, report.args.join(" "));

        let mut cmd = Command::new(&tool.program);
        cmd.args(&tool.args)
            .args(&argv)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if stage.stdout_is_output {
            let file = tokio::fs::File::create(&output_path).await.map_err(|e| {
                ConvertError::resource(format!("creating {}", output_path.display()), e)
            })?;
            cmd.stdout(Stdio::from(file.into_std().await));
        } else {
            cmd.stdout(Stdio::piped());
        }

        let started = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("❌ Failed to spawn {} for stage '{}': {}", report.program, stage.name, e);
                report.stderr = e.to_string();
                return Err(ConvertError::StageFailed {
                    stage: stage.name.clone(),
                    reason: FailureReason::SpawnFailed(e.to_string()),
                    report: Box::new(report),
                });
            }
        };

        let limit = self.max_diagnostic_bytes;
        let stdout_task = child.stdout.take().map(|s| tokio::spawn(read_tail(s, limit)));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(read_tail(s, limit)));

        let timeout = stage.timeout.unwrap_or(self.stage_timeout);
        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = tokio::time::sleep(timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };

        if !matches!(waited, Waited::Exited(_)) {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill stage '{}': {}", stage.name, e);
            }
        }

        report.stdout = drain(stdout_task).await;
        report.stderr = drain(stderr_task).await;
        report.elapsed = started.elapsed();

        let status = match waited {
            Waited::Cancelled => {
                warn!("🛑 Stage '{}' cancelled after {:.2}s", stage.name, report.elapsed.as_secs_f64());
                return Err(ConvertError::Cancelled {
                    stage: stage.name.clone(),
                });
            }
            Waited::TimedOut => {
                error!(
                    "⏰ Stage '{}' timed out after {:.1}s (limit: {:?})",
                    stage.name,
                    report.elapsed.as_secs_f64(),
                    timeout
                );
                return Err(ConvertError::StageTimeout {
                    stage: stage.name.clone(),
                    timeout,
                    report: Box::new(report),
                });
            }
            Waited::Exited(Err(e)) => {
                error!("❌ Waiting on stage '{}' failed: {}", stage.name, e);
                return Err(ConvertError::StageFailed {
                    stage: stage.name.clone(),
                    reason: FailureReason::SpawnFailed(e.to_string()),
                    report: Box::new(report),
                });
            }
            Waited::Exited(Ok(status)) => status,
        };

        report.exit_code = status.code();
        if !status.success() {
            let reason = match status.code() {
                Some(code) => FailureReason::ExitCode(code),
                None => FailureReason::Terminated,
            };
            error!("❌ Stage '{}' failed: {}", stage.name, reason);
            if !report.stderr.trim().is_empty() {
                error!("📝 {} stderr: {}", stage.name, last_line(&report.stderr));
            }
            return Err(ConvertError::StageFailed {
                stage: stage.name.clone(),
                reason,
                report: Box::new(report),
            });
        }

        match resolve_output(&stage.output, &output_path).await {
            Some(resolved) => Ok((resolved, report)),
            None => {
                error!(
                    "❌ Stage '{}' exited cleanly but produced no {}",
                    stage.name,
                    output_path.display()
                );
                Err(ConvertError::StageFailed {
                    stage: stage.name.clone(),
                    reason: FailureReason::MissingOutput(describe(&stage.output)),
                    report: Box::new(report),
                })
            }
        }
    }
}

/// Locate the declared output on disk; `None` when missing or empty
async fn resolve_output(spec: &ArtifactSpec, path: &Path) -> Option<ResolvedArtifact> {
    match spec {
        ArtifactSpec::File(_) => {
            let meta = tokio::fs::metadata(path).await.ok()?;
            (meta.is_file() && meta.len() > 0).then(|| ResolvedArtifact::File(path.to_path_buf()))
        }
        ArtifactSpec::Frames { pattern, .. } => {
            let pattern = FramePattern::new(pattern).ok()?;
            let dir = path.to_path_buf();
            let frames = tokio::task::spawn_blocking(move || collect_frames(&dir, &pattern))
                .await
                .ok()?
                .ok()?;
            if frames.is_empty() {
                return None;
            }
            debug!("🎞️  Collected {} frames from {}", frames.len(), path.display());
            Some(ResolvedArtifact::Frames {
                dir: path.to_path_buf(),
                frames,
            })
        }
    }
}

fn describe(spec: &ArtifactSpec) -> String {
    match spec {
        ArtifactSpec::File(name) => name.clone(),
        ArtifactSpec::Frames { dir, pattern } => format!("{}/{}", dir, pattern),
    }
}

fn last_line(text: &str) -> &str {
    text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

/// Read a stream to the end, keeping at most the last `limit` bytes
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> Vec<u8> {
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                if kept.len() > limit * 2 {
                    kept.drain(..kept.len() - limit);
                }
            }
        }
    }

    if kept.len() > limit {
        kept.drain(..kept.len() - limit);
    }
    kept
}

async fn drain(task: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };

    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(e)) => {
            warn!("Diagnostic reader failed: {}", e);
            String::new()
        }
        Err(_) => {
            // a grandchild still holds the pipe open
            task.abort();
            String::new()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::options::OutputOptions;
    use crate::pipeline::stage::InputSpec;
    use crate::pipeline::BuildProfile;
    use crate::tools::{Tool, ToolCommand};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn single_stage(stage: StageDescriptor) -> Pipeline {
        Pipeline {
            source: MediaKind::AnimatedGif,
            target: MediaKind::VideoSticker,
            options: OutputOptions::default(),
            profile: BuildProfile::default(),
            stages: vec![stage],
        }
    }

    fn transcoder_stage() -> StageDescriptor {
        StageDescriptor::new(
            "transcode",
            Tool::Transcoder,
            InputSpec::File,
            ArtifactSpec::File("out.webm".into()),
        )
        .args(["{input}", "{output}"])
    }

    fn executor_with(program: PathBuf, timeout: Duration) -> Executor {
        let tools = ToolTable::default().with(Tool::Transcoder, ToolCommand::new(program));
        Executor::new(tools, timeout)
    }

    #[tokio::test]
    async fn test_successful_stage_reports_diagnostics() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let tool = script(bin.path(), "ok", "echo converting >&2\ncp \"$1\" \"$2\"");
        let input = work.path().join("in.gif");
        std::fs::write(&input, b"GIF89a").unwrap();

        let executor = executor_with(tool, Duration::from_secs(10));
        let out = executor
            .run_in(&single_stage(transcoder_stage()), work.path(), &input, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.artifact, work.path().join("out.webm"));
        assert_eq!(out.reports.len(), 1);
        assert_eq!(out.reports[0].exit_code, Some(0));
        assert!(out.reports[0].stderr.contains("converting"));
    }

    #[tokio::test]
    async fn test_stdout_redirected_into_output_file() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let tool = script(bin.path(), "cat", "cat \"$1\"");
        let input = work.path().join("in.gif");
        std::fs::write(&input, b"GIF89a").unwrap();

        let stage = StageDescriptor::new(
            "copy",
            Tool::Transcoder,
            InputSpec::File,
            ArtifactSpec::File("copy.gif".into()),
        )
        .args(["{input}"])
        .stdout_to_output();
        let out = executor_with(tool, Duration::from_secs(10))
            .run_in(&single_stage(stage), work.path(), &input, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(std::fs::read(&out.artifact).unwrap(), b"GIF89a");
        assert!(out.reports[0].stdout.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_stage_failure() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let tool = script(bin.path(), "oom", "echo 'out of memory' >&2\nexit 1");
        let input = work.path().join("in.gif");
        std::fs::write(&input, b"GIF89a").unwrap();

        let err = executor_with(tool, Duration::from_secs(10))
            .run_in(&single_stage(transcoder_stage()), work.path(), &input, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ConvertError::StageFailed { stage, reason, report } => {
                assert_eq!(stage, "transcode");
                assert_eq!(reason, FailureReason::ExitCode(1));
                assert!(report.stderr.contains("out of memory"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_output_is_stage_failure() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let tool = script(bin.path(), "lazy", "exit 0");
        let input = work.path().join("in.gif");
        std::fs::write(&input, b"GIF89a").unwrap();

        let err = executor_with(tool, Duration::from_secs(10))
            .run_in(&single_stage(transcoder_stage()), work.path(), &input, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConvertError::StageFailed {
                reason: FailureReason::MissingOutput(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let work = TempDir::new().unwrap();
        let input = work.path().join("in.gif");
        std::fs::write(&input, b"GIF89a").unwrap();

        let err = executor_with(PathBuf::from("/nonexistent/tool"), Duration::from_secs(10))
            .run_in(&single_stage(transcoder_stage()), work.path(), &input, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ConvertError::StageFailed {
                reason: FailureReason::SpawnFailed(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let tool = script(bin.path(), "hang", "exec sleep 30");
        let input = work.path().join("in.gif");
        std::fs::write(&input, b"GIF89a").unwrap();

        let started = Instant::now();
        let err = executor_with(tool, Duration::from_millis(200))
            .run_in(&single_stage(transcoder_stage()), work.path(), &input, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ConvertError::StageTimeout { .. }));
        assert_eq!(err.stage(), Some("transcode"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation_stops_running_stage() {
        let bin = TempDir::new().unwrap();
        let work = TempDir::new().unwrap();
        let tool = script(bin.path(), "hang", "exec sleep 30");
        let input = work.path().join("in.gif");
        std::fs::write(&input, b"GIF89a").unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = executor_with(tool, Duration::from_secs(30))
            .run_in(&single_stage(transcoder_stage()), work.path(), &input, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ConvertError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_read_tail_keeps_end_of_stream() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let tail = read_tail(&data[..], 1000).await;
        assert_eq!(tail.len(), 1000);
        assert_eq!(&tail[..], &data[data.len() - 1000..]);
    }
}
