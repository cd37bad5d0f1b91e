use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::options::OutputOptions;
use crate::pipeline::BuildProfile;
use crate::tools::{Tool, ToolCommand, ToolTable};

/// Configuration for the sticker converter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where per-job workspaces are created
    pub scratch: ScratchConfig,

    /// Resource bounds
    pub limits: LimitsConfig,

    /// Default output options for requests that do not bring their own
    pub output: OutputOptions,

    /// External tool locations
    pub tools: ToolTable,

    /// Logging settings
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScratchConfig {
    /// Parent directory of all job workspaces
    pub root: PathBuf,

    /// Where finished artifacts without an explicit destination are kept
    /// (defaults to the system temp directory)
    pub output_root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum number of conversions running at once
    pub max_concurrent_jobs: usize,

    /// Per-stage timeout in seconds
    pub stage_timeout_secs: u64,

    /// Largest accepted input in bytes (0 = no limit)
    pub max_input_bytes: u64,

    /// Size cap for video stickers; larger lossless output is re-encoded lossy
    pub max_video_sticker_bytes: u64,

    /// Longest clip kept in a video sticker, in seconds
    pub max_video_duration_secs: u64,

    /// Try a lossless video encode before falling back to lossy
    pub lossless_first: bool,

    /// Bytes of stdout and stderr kept per stage for diagnostics (the tail)
    pub max_diagnostic_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
}

impl Config {
    /// Load configuration from the first readable config file, then apply
    /// environment overrides
    pub fn load() -> Result<Self> {
        let config_paths = [
            "sticker-converter.toml",
            "config/sticker-converter.toml",
            "/etc/sticker-converter/config.toml",
        ];

        for path in &config_paths {
            if !Path::new(path).exists() {
                continue;
            }
            match Self::load_from(Path::new(path)) {
                Ok(config) => {
                    tracing::info!("📄 Loaded configuration from: {}", path);
                    return Ok(config);
                }
                Err(e) => {
                    tracing::warn!("Failed to parse config file {}: {:#}", path, e);
                }
            }
        }

        Self::from_env()
    }

    /// Load a specific config file, with environment overrides on top
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config: Config = toml::from_str(&config_str)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(workers) = std::env::var("STICKER_CONVERTER_WORKERS") {
            self.limits.max_concurrent_jobs = workers
                .parse()
                .with_context(|| format!("STICKER_CONVERTER_WORKERS={}", workers))?;
        }

        if let Ok(timeout) = std::env::var("STICKER_CONVERTER_STAGE_TIMEOUT") {
            self.limits.stage_timeout_secs = timeout
                .parse()
                .with_context(|| format!("STICKER_CONVERTER_STAGE_TIMEOUT={}", timeout))?;
        }

        if let Ok(dir) = std::env::var("STICKER_CONVERTER_SCRATCH_DIR") {
            self.scratch.root = PathBuf::from(dir);
        }

        if let Ok(level) = std::env::var("STICKER_CONVERTER_LOG_LEVEL") {
            self.logging.level = level;
        }

        for tool in Tool::ALL {
            let var = format!("STICKER_CONVERTER_{}", tool.to_string().to_uppercase());
            if let Ok(program) = std::env::var(&var) {
                self.tools.set(tool, ToolCommand::new(program));
            }
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let config_str = toml::to_string_pretty(self)?;
        std::fs::write(path, config_str)?;
        tracing::info!("💾 Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_concurrent_jobs == 0 {
            return Err(anyhow!("max_concurrent_jobs must be greater than 0"));
        }

        if self.limits.stage_timeout_secs == 0 {
            return Err(anyhow!("stage_timeout_secs must be greater than 0"));
        }

        if self.limits.max_video_duration_secs == 0 {
            return Err(anyhow!("max_video_duration_secs must be greater than 0"));
        }

        if self.limits.max_diagnostic_bytes == 0 {
            return Err(anyhow!("max_diagnostic_bytes must be greater than 0"));
        }

        if self.scratch.root.as_os_str().is_empty() {
            return Err(anyhow!("scratch root must not be empty"));
        }

        self.output
            .validate()
            .map_err(|e| anyhow!("default output options: {}", e))?;

        tracing::debug!("✅ Configuration validation passed");
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.stage_timeout_secs)
    }

    /// Encoding profile for a first conversion attempt
    pub fn build_profile(&self) -> BuildProfile {
        BuildProfile {
            lossless: self.limits.lossless_first,
            max_video_duration: Duration::from_secs(self.limits.max_video_duration_secs),
        }
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Sticker Converter Configuration:\n\
            - Workers: {}\n\
            - Stage Timeout: {}s\n\
            - Scratch Root: {}\n\
            - Max Input: {} bytes\n\
            - Output: {}x{} @ {}fps, quality {}, threads {}\n\
            - Transcoder: {}\n\
            - Renderer: {}",
            self.limits.max_concurrent_jobs,
            self.limits.stage_timeout_secs,
            self.scratch.root.display(),
            self.limits.max_input_bytes,
            self.output.width,
            self.output.height,
            self.output.fps,
            self.output.quality,
            self.output.threads,
            self.tools.transcoder.program.display(),
            self.tools.renderer.program.display(),
        )
    }
}

impl Default for ScratchConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("sticker-converter"),
            output_root: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: num_cpus::get().min(4),
            stage_timeout_secs: 60,
            max_input_bytes: 10 << 20,
            max_video_sticker_bytes: 256 * 1000,
            max_video_duration_secs: 3,
            lossless_first: true,
            max_diagnostic_bytes: 64 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "sticker_converter=info,warn".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scratch: ScratchConfig::default(),
            limits: LimitsConfig::default(),
            output: OutputOptions::default(),
            tools: ToolTable::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.limits.max_concurrent_jobs = workers;
        self
    }

    pub fn with_scratch_root(mut self, root: PathBuf) -> Self {
        self.config.scratch.root = root;
        self
    }

    pub fn with_output_root(mut self, root: PathBuf) -> Self {
        self.config.scratch.output_root = Some(root);
        self
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.config.limits.stage_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_max_input_bytes(mut self, bytes: u64) -> Self {
        self.config.limits.max_input_bytes = bytes;
        self
    }

    pub fn with_max_video_sticker_bytes(mut self, bytes: u64) -> Self {
        self.config.limits.max_video_sticker_bytes = bytes;
        self
    }

    pub fn with_max_diagnostic_bytes(mut self, bytes: usize) -> Self {
        self.config.limits.max_diagnostic_bytes = bytes;
        self
    }

    pub fn with_output(mut self, output: OutputOptions) -> Self {
        self.config.output = output;
        self
    }

    pub fn with_tools(mut self, tools: ToolTable) -> Self {
        self.config.tools = tools;
        self
    }

    pub fn with_tool(mut self, tool: Tool, program: impl Into<PathBuf>) -> Self {
        self.config.tools.set(tool, ToolCommand::new(program));
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.limits.stage_timeout_secs, 60);
        assert_eq!(config.limits.max_input_bytes, 10 * 1024 * 1024);
        assert_eq!(config.limits.max_video_sticker_bytes, 256_000);
        assert!(config.limits.max_concurrent_jobs >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .with_workers(8)
            .with_stage_timeout(Duration::from_secs(5))
            .with_tool(Tool::Transcoder, "/usr/bin/ffmpeg")
            .build();

        assert_eq!(config.limits.max_concurrent_jobs, 8);
        assert_eq!(config.stage_timeout(), Duration::from_secs(5));
        assert_eq!(config.tools.transcoder.program, PathBuf::from("/usr/bin/ffmpeg"));
    }

    #[test]
    fn test_config_validation() {
        let config = ConfigBuilder::new().with_workers(0).build();
        assert!(config.validate().is_err());

        let config = ConfigBuilder::new().with_max_diagnostic_bytes(0).build();
        assert!(config.validate().is_err());

        let config = ConfigBuilder::new()
            .with_output(OutputOptions::default().with_quality(101))
            .build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sticker-converter.toml");
        let config = ConfigBuilder::new()
            .with_workers(3)
            .with_scratch_root(dir.path().join("scratch"))
            .with_output(OutputOptions::default().with_fps(30))
            .build();

        config.save(&path).unwrap();
        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.output.fps, 30);
        assert_eq!(loaded.scratch.root, dir.path().join("scratch"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [limits]
            stage_timeout_secs = 5

            [tools.renderer]
            program = "/opt/lottie_to_png"
            "#,
        )
        .unwrap();

        assert_eq!(config.limits.stage_timeout_secs, 5);
        assert_eq!(config.limits.max_video_duration_secs, 3);
        assert_eq!(config.tools.renderer.program, PathBuf::from("/opt/lottie_to_png"));
        assert_eq!(config.output, OutputOptions::default());
    }

    #[test]
    fn test_summary_mentions_workers() {
        let summary = ConfigBuilder::new().with_workers(2).build().summary();
        assert!(summary.contains("Workers: 2"));
    }
}
