use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{ConvertError, Result};
use crate::media::{
    infer_kind, raster_dimensions, raster_dimensions_of, staging_extension, MediaKind,
};
use crate::options::OutputOptions;
use crate::pipeline::{self, Executor, Pipeline, StageReport};
use crate::workspace::Workspace;

/// Bytes read from a file input to classify it
const SNIFF_LEN: usize = 64 * 1024;

/// Stage name reported when a job is cancelled while waiting for a permit
const QUEUED_STAGE: &str = "queued";

/// Media handed to the converter
#[derive(Debug, Clone)]
pub enum InputSource {
    Path(PathBuf),
    Bytes {
        data: Vec<u8>,
        /// Original file name, used as an extension hint
        name: Option<String>,
    },
}

impl InputSource {
    fn name_hint(&self) -> Option<&Path> {
        match self {
            InputSource::Path(path) => Some(path.as_path()),
            InputSource::Bytes { name, .. } => name.as_deref().map(Path::new),
        }
    }
}

/// One conversion job
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub input: InputSource,
    /// Inferred from the input when `None`
    pub source: Option<MediaKind>,
    pub target: MediaKind,
    /// Falls back to the converter's configured `[output]` defaults when `None`
    pub options: Option<OutputOptions>,
    /// Copy the final artifact here; a detached temporary file otherwise
    pub destination: Option<PathBuf>,
}

impl ConversionRequest {
    pub fn from_path(path: impl Into<PathBuf>, target: MediaKind) -> Self {
        Self {
            input: InputSource::Path(path.into()),
            source: None,
            target,
            options: None,
            destination: None,
        }
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>, target: MediaKind) -> Self {
        Self {
            input: InputSource::Bytes {
                data: data.into(),
                name: None,
            },
            source: None,
            target,
            options: None,
            destination: None,
        }
    }

    pub fn with_name(mut self, file_name: impl Into<String>) -> Self {
        if let InputSource::Bytes { name, .. } = &mut self.input {
            *name = Some(file_name.into());
        }
        self
    }

    pub fn with_source(mut self, source: MediaKind) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_options(mut self, options: OutputOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Final artifact of a conversion, living outside any workspace
#[derive(Debug)]
pub enum ArtifactHandle {
    /// Written to the destination the caller asked for
    Persisted(PathBuf),
    /// Temporary file deleted when the handle is dropped
    Temporary(TempPath),
}

impl ArtifactHandle {
    pub fn path(&self) -> &Path {
        match self {
            ArtifactHandle::Persisted(path) => path.as_path(),
            ArtifactHandle::Temporary(temp) => &**temp,
        }
    }

    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.path()).await
    }

    /// Keep the artifact at `path`, consuming the handle
    pub fn persist(self, path: &Path) -> std::io::Result<PathBuf> {
        match self {
            ArtifactHandle::Persisted(current) => {
                std::fs::copy(&current, path)?;
                Ok(path.to_path_buf())
            }
            ArtifactHandle::Temporary(temp) => {
                if let Err(e) = temp.persist(path) {
                    // cross-device rename; fall back to copying
                    std::fs::copy(&e.path, path)?;
                }
                Ok(path.to_path_buf())
            }
        }
    }
}

/// Outcome of a successful conversion
#[derive(Debug)]
pub struct PipelineResult {
    pub artifact: ArtifactHandle,
    pub source: MediaKind,
    pub target: MediaKind,
    pub size_bytes: u64,
    /// Reports of every stage that ran, in order
    pub diagnostics: Vec<StageReport>,
    /// The oversized lossless video was re-encoded lossy
    pub lossy_fallback: bool,
    pub elapsed: Duration,
}

struct Inner {
    config: Config,
    executor: Executor,
    permits: Semaphore,
}

/// Entry point for conversions.
///
/// Cheap to clone; clones share the concurrency limit.
#[derive(Clone)]
pub struct Converter {
    inner: Arc<Inner>,
}

impl Converter {
    pub fn new(config: Config) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ConvertError::InvalidOptions(format!("{:#}", e)))?;

        let executor = Executor::new(config.tools.clone(), config.stage_timeout())
            .with_diagnostic_limit(config.limits.max_diagnostic_bytes);
        let permits = Semaphore::new(config.limits.max_concurrent_jobs);

        info!(
            "🔧 Initializing Converter with {} concurrent jobs",
            config.limits.max_concurrent_jobs
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                executor,
                permits,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Number of jobs that could start right now without waiting
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    pub async fn convert(&self, request: ConversionRequest) -> Result<PipelineResult> {
        self.convert_with_cancel(request, &CancellationToken::new())
            .await
    }

    pub async fn convert_bytes(
        &self,
        data: impl Into<Vec<u8>>,
        target: MediaKind,
        options: OutputOptions,
    ) -> Result<PipelineResult> {
        self.convert(ConversionRequest::from_bytes(data, target).with_options(options))
            .await
    }

    pub async fn convert_file(
        &self,
        path: impl Into<PathBuf>,
        target: MediaKind,
        options: OutputOptions,
    ) -> Result<PipelineResult> {
        self.convert(ConversionRequest::from_path(path, target).with_options(options))
            .await
    }

    /// Convert, aborting the running tool and skipping the remaining stages
    /// as soon as `cancel` fires.
    pub async fn convert_with_cancel(
        &self,
        request: ConversionRequest,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        let started = Instant::now();
        let config = &self.inner.config;

        let options = request.options.unwrap_or(config.output);
        options.validate()?;
        if let Some(dest) = &request.destination {
            if dest.as_os_str().is_empty() {
                return Err(ConvertError::InvalidOptions(
                    "destination path must not be empty".to_string(),
                ));
            }
        }

        let size = input_size(&request.input).await?;
        let limit = config.limits.max_input_bytes;
        if limit > 0 && size > limit {
            return Err(ConvertError::InputTooLarge { size, limit });
        }

        let head = read_head(&request.input).await?;
        let source = match request.source {
            Some(kind) => kind,
            None => infer_kind(&head, request.input.name_hint())?,
        };

        let options = if source == MediaKind::StaticImage && request.target == MediaKind::StaticImage {
            fit_to_box(&request.input, options).await?
        } else {
            options
        };

        let pipeline = pipeline::build(source, request.target, &options, &config.build_profile())?;

        info!(
            "🎬 Converting {} -> {} ({} bytes, {} stages)",
            source,
            request.target,
            size,
            pipeline.len()
        );
        debug!(
            "🔧 Options: {}x{} @ {}fps, quality {}, {} threads per tool",
            options.width,
            options.height,
            options.fps,
            options.quality,
            options.effective_threads()
        );

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(ConvertError::Cancelled { stage: QUEUED_STAGE.to_string() });
            }
            permit = self.inner.permits.acquire() => permit.map_err(|_| ConvertError::Cancelled {
                stage: QUEUED_STAGE.to_string(),
            })?,
        };

        let root = config.scratch.root.clone();
        let workspace = tokio::task::spawn_blocking(move || Workspace::acquire(&root))
            .await
            .map_err(|e| blocking_failed("allocating workspace", e))??;

        let staged_name = format!("input.{}", staging_extension(source, &head));
        let outcome = self
            .run_in_workspace(&workspace, &pipeline, &request, &staged_name, cancel)
            .await;

        // a failed removal is logged by the workspace and never masks the outcome
        let _ = tokio::task::spawn_blocking(move || workspace.release()).await;

        let (artifact, diagnostics, lossy_fallback) = outcome?;
        let size_bytes = tokio::fs::metadata(artifact.path())
            .await
            .map(|m| m.len())
            .map_err(|e| ConvertError::resource("reading final artifact", e))?;

        let elapsed = started.elapsed();
        info!(
            "✅ Converted {} -> {} in {:.2}s ({} bytes)",
            source,
            request.target,
            elapsed.as_secs_f64(),
            size_bytes
        );

        Ok(PipelineResult {
            artifact,
            source,
            target: request.target,
            size_bytes,
            diagnostics,
            lossy_fallback,
            elapsed,
        })
    }

    async fn run_in_workspace(
        &self,
        workspace: &Workspace,
        pipeline: &Pipeline,
        request: &ConversionRequest,
        staged_name: &str,
        cancel: &CancellationToken,
    ) -> Result<(ArtifactHandle, Vec<StageReport>, bool)> {
        let config = &self.inner.config;
        let executor = &self.inner.executor;

        let input = workspace.resolve(staged_name)?;
        stage_input(&request.input, &input).await?;

        let mut output = executor.run(pipeline, workspace, &input, cancel).await?;
        let mut lossy_fallback = false;

        let cap = config.limits.max_video_sticker_bytes;
        if pipeline.target == MediaKind::VideoSticker && pipeline.profile.lossless && cap > 0 {
            let produced = file_size(&output.artifact).await?;
            if produced > cap {
                info!(
                    "📦 Lossless video is {} bytes (cap {}), retrying with lossy encoding",
                    produced, cap
                );
                let lossy = pipeline::build(
                    pipeline.source,
                    pipeline.target,
                    &pipeline.options,
                    &pipeline.profile.lossy(),
                )?;
                let dir = workspace.create_dir("lossy").await?;
                let second = executor.run_in(&lossy, &dir, &input, cancel).await?;

                let produced = file_size(&second.artifact).await?;
                if produced > cap {
                    warn!("Lossy video is still {} bytes (cap {})", produced, cap);
                }

                output.reports.extend(second.reports);
                output.artifact = second.artifact;
                lossy_fallback = true;
            }
        }

        let artifact = self
            .deliver(&output.artifact, request.destination.as_deref(), pipeline.target)
            .await?;

        Ok((artifact, output.reports, lossy_fallback))
    }

    /// Move the final artifact out of the workspace before it is destroyed
    async fn deliver(
        &self,
        artifact: &Path,
        destination: Option<&Path>,
        target: MediaKind,
    ) -> Result<ArtifactHandle> {
        if let Some(dest) = destination {
            if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ConvertError::resource(format!("creating {}", parent.display()), e))?;
            }
            tokio::fs::copy(artifact, dest)
                .await
                .map_err(|e| ConvertError::resource(format!("writing {}", dest.display()), e))?;
            debug!("💾 Artifact written to {}", dest.display());
            return Ok(ArtifactHandle::Persisted(dest.to_path_buf()));
        }

        let root = self
            .inner
            .config
            .scratch
            .output_root
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| ConvertError::resource(format!("creating {}", root.display()), e))?;

        let suffix = format!(".{}", target.extension());
        let temp = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("sticker-")
                .suffix(&suffix)
                .tempfile_in(&root)
        })
        .await
        .map_err(|e| blocking_failed("allocating output file", e))?
        .map_err(|e| ConvertError::resource("allocating output file", e))?
        .into_temp_path();

        tokio::fs::copy(artifact, &temp)
            .await
            .map_err(|e| ConvertError::resource(format!("writing {}", temp.display()), e))?;
        debug!("💾 Artifact detached to {}", temp.display());
        Ok(ArtifactHandle::Temporary(temp))
    }
}

/// Scale the output box down (or up) to the input's aspect ratio
async fn fit_to_box(input: &InputSource, options: OutputOptions) -> Result<OutputOptions> {
    let (width, height) = match input {
        InputSource::Bytes { data, .. } => raster_dimensions(data)?,
        InputSource::Path(path) => {
            let path = path.clone();
            tokio::task::spawn_blocking(move || raster_dimensions_of(&path))
                .await
                .map_err(|e| blocking_failed("reading image header", e))??
        }
    };

    let (fitted_width, fitted_height) = options.fit(width, height);
    debug!(
        "📐 {}x{} image fitted to {}x{}",
        width, height, fitted_width, fitted_height
    );
    Ok(options.with_size(fitted_width, fitted_height))
}

fn blocking_failed(context: &str, e: JoinError) -> ConvertError {
    ConvertError::resource(context, std::io::Error::other(e))
}

async fn input_size(input: &InputSource) -> Result<u64> {
    match input {
        InputSource::Bytes { data, .. } => Ok(data.len() as u64),
        InputSource::Path(path) => tokio::fs::metadata(path)
            .await
            .map(|m| m.len())
            .map_err(|e| ConvertError::resource(format!("reading {}", path.display()), e)),
    }
}

async fn read_head(input: &InputSource) -> Result<Vec<u8>> {
    match input {
        InputSource::Bytes { data, .. } => Ok(data[..data.len().min(SNIFF_LEN)].to_vec()),
        InputSource::Path(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| ConvertError::resource(format!("opening {}", path.display()), e))?;
            let mut head = Vec::with_capacity(SNIFF_LEN);
            file.take(SNIFF_LEN as u64)
                .read_to_end(&mut head)
                .await
                .map_err(|e| ConvertError::resource(format!("reading {}", path.display()), e))?;
            Ok(head)
        }
    }
}

async fn stage_input(input: &InputSource, dest: &Path) -> Result<()> {
    match input {
        InputSource::Bytes { data, .. } => tokio::fs::write(dest, data).await,
        InputSource::Path(path) => tokio::fs::copy(path, dest).await.map(|_| ()),
    }
    .map_err(|e| ConvertError::resource(format!("staging input into {}", dest.display()), e))
}

async fn file_size(path: &Path) -> Result<u64> {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .map_err(|e| ConvertError::resource(format!("reading {}", path.display()), e))
}
