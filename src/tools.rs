use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{ConvertError, Result};

const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Role an external program plays in a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Decompressor,
    Renderer,
    GifEncoder,
    Transcoder,
    ImageRecompressor,
}

impl Tool {
    pub const ALL: [Tool; 5] = [
        Tool::Decompressor,
        Tool::Renderer,
        Tool::GifEncoder,
        Tool::Transcoder,
        Tool::ImageRecompressor,
    ];

    /// Flag that makes the stock program print its version and exit
    fn version_flag(&self) -> &'static str {
        match self {
            Tool::Decompressor => "--version",
            Tool::Renderer => "-v",
            Tool::GifEncoder => "-V",
            Tool::Transcoder => "-version",
            Tool::ImageRecompressor => "-version",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tool::Decompressor => "decompressor",
            Tool::Renderer => "renderer",
            Tool::GifEncoder => "gif_encoder",
            Tool::Transcoder => "transcoder",
            Tool::ImageRecompressor => "image_recompressor",
        };
        f.write_str(name)
    }
}

/// Program to launch for a tool, plus arguments placed before the stage's own
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// Resolved locations of every external tool the pipelines use.
///
/// The executor never searches for binaries on its own; whatever is in this
/// table is what gets spawned. Defaults are bare program names, which the OS
/// resolves through `PATH` at spawn time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolTable {
    pub decompressor: ToolCommand,
    pub renderer: ToolCommand,
    pub gif_encoder: ToolCommand,
    pub transcoder: ToolCommand,
    pub image_recompressor: ToolCommand,
}

impl ToolTable {
    pub fn get(&self, tool: Tool) -> &ToolCommand {
        match tool {
            Tool::Decompressor => &self.decompressor,
            Tool::Renderer => &self.renderer,
            Tool::GifEncoder => &self.gif_encoder,
            Tool::Transcoder => &self.transcoder,
            Tool::ImageRecompressor => &self.image_recompressor,
        }
    }

    pub fn set(&mut self, tool: Tool, command: ToolCommand) {
        match tool {
            Tool::Decompressor => self.decompressor = command,
            Tool::Renderer => self.renderer = command,
            Tool::GifEncoder => self.gif_encoder = command,
            Tool::Transcoder => self.transcoder = command,
            Tool::ImageRecompressor => self.image_recompressor = command,
        }
    }

    pub fn with(mut self, tool: Tool, command: ToolCommand) -> Self {
        self.set(tool, command);
        self
    }

    /// Check that every configured program can be started.
    ///
    /// A program that starts but exits non-zero for its version flag only
    /// produces a warning; failing to spawn it is an error.
    pub async fn verify(&self) -> Result<()> {
        for tool in Tool::ALL {
            let command = self.get(tool);
            let status = tokio::time::timeout(
                VERSION_CHECK_TIMEOUT,
                tokio::process::Command::new(&command.program)
                    .args(&command.args)
                    .arg(tool.version_flag())
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status(),
            )
            .await;

            match status {
                Ok(Ok(status)) if status.success() => {
                    debug!("🔧 {} available: {}", tool, command.program.display());
                }
                Ok(Ok(status)) => {
                    warn!(
                        "{} {} {} exited with {}",
                        tool,
                        command.program.display(),
                        tool.version_flag(),
                        status
                    );
                }
                Ok(Err(e)) => {
                    error!("❌ {} not usable ({}): {}", tool, command.program.display(), e);
                    return Err(ConvertError::resource(
                        format!("{} '{}'", tool, command.program.display()),
                        e,
                    ));
                }
                Err(_) => {
                    warn!("{} {} did not answer the version check", tool, command.program.display());
                }
            }
        }

        info!("✅ All external tools are available");
        Ok(())
    }
}

impl Default for ToolTable {
    fn default() -> Self {
        Self {
            decompressor: ToolCommand::new("gzip"),
            renderer: ToolCommand::new("lottie_to_png"),
            gif_encoder: ToolCommand::new("gifski"),
            transcoder: ToolCommand::new("ffmpeg"),
            image_recompressor: ToolCommand::new("cwebp"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table() {
        let tools = ToolTable::default();
        assert_eq!(tools.get(Tool::Transcoder).program, PathBuf::from("ffmpeg"));
        assert_eq!(tools.get(Tool::GifEncoder).program, PathBuf::from("gifski"));
        assert!(tools.get(Tool::Decompressor).args.is_empty());
    }

    #[test]
    fn test_override_single_tool() {
        let tools = ToolTable::default().with(
            Tool::Renderer,
            ToolCommand::new("/opt/rlottie/bin/lottie_to_png").with_args(["--quiet"]),
        );
        assert_eq!(
            tools.renderer.program,
            PathBuf::from("/opt/rlottie/bin/lottie_to_png")
        );
        assert_eq!(tools.renderer.args, vec!["--quiet".to_string()]);
        assert_eq!(tools.transcoder, ToolTable::default().transcoder);
    }

    #[test]
    fn test_table_from_toml() {
        let tools: ToolTable = toml::from_str(
            r#"
            [transcoder]
            program = "/usr/local/bin/ffmpeg"
            "#,
        )
        .unwrap();
        assert_eq!(tools.transcoder.program, PathBuf::from("/usr/local/bin/ffmpeg"));
        assert_eq!(tools.decompressor.program, PathBuf::from("gzip"));
    }

    #[tokio::test]
    async fn test_verify_reports_missing_program() {
        let tools = ToolTable::default().with(
            Tool::Decompressor,
            ToolCommand::new("/nonexistent/definitely-not-a-tool"),
        );
        let err = tools.verify().await.unwrap_err();
        assert!(err.to_string().contains("decompressor"));
    }
}
