use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::stage::{ArtifactSpec, InputSpec, StageDescriptor};
use crate::error::{ConvertError, Result};
use crate::media::MediaKind;
use crate::options::OutputOptions;
use crate::tools::Tool;

const FRAMES_DIR: &str = "frames";
const FRAME_PATTERN: &str = "*.png";

/// Encoding policy knobs that are not user-facing output options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildProfile {
    /// Encode video stickers losslessly (first attempt) or with CRF
    pub lossless: bool,
    /// Longest clip kept when producing a video sticker
    pub max_video_duration: Duration,
}

impl BuildProfile {
    pub fn lossy(self) -> Self {
        Self {
            lossless: false,
            ..self
        }
    }
}

impl Default for BuildProfile {
    fn default() -> Self {
        Self {
            lossless: true,
            max_video_duration: Duration::from_secs(3),
        }
    }
}

/// Ordered stages turning a `source` artifact into a `target` artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pipeline {
    pub source: MediaKind,
    pub target: MediaKind,
    pub options: OutputOptions,
    pub profile: BuildProfile,
    pub stages: Vec<StageDescriptor>,
}

impl Pipeline {
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Every stage consumes exactly the shape its predecessor produces
    pub fn is_well_formed(&self) -> bool {
        let first_takes_file = self
            .stages
            .first()
            .is_some_and(|s| s.input == InputSpec::File);
        let chained = self
            .stages
            .windows(2)
            .all(|w| w[0].output.input_spec() == w[1].input);
        let ends_in_file = self
            .stages
            .last()
            .is_some_and(|s| matches!(s.output, ArtifactSpec::File(_)));
        let indexed = self.stages.iter().enumerate().all(|(i, s)| s.index == i);

        first_takes_file && chained && ends_in_file && indexed
    }
}

/// Whether a pipeline exists for this pair
pub fn is_supported(source: MediaKind, target: MediaKind) -> bool {
    matches!(
        (source, target),
        (MediaKind::VectorAnimation, MediaKind::AnimatedGif)
            | (MediaKind::AnimatedGif, MediaKind::VideoSticker)
            | (MediaKind::VideoSticker, MediaKind::AnimatedGif)
            | (MediaKind::StaticImage, MediaKind::StaticImage)
    )
}

/// Select the stage chain for `source -> target`.
///
/// Deterministic in its arguments; fails with `UnsupportedConversion` for
/// pairs without a pipeline.
pub fn build(
    source: MediaKind,
    target: MediaKind,
    options: &OutputOptions,
    profile: &BuildProfile,
) -> Result<Pipeline> {
    let final_name = format!("sticker.{}", target.extension());

    let stages = match (source, target) {
        (MediaKind::VectorAnimation, MediaKind::AnimatedGif) => vec![
            decompress_stage("animation.json"),
            rasterize_stage(),
            encode_gif_stage(&final_name),
        ],
        (MediaKind::AnimatedGif, MediaKind::VideoSticker) => {
            vec![gif_to_webm_stage(&final_name, profile)]
        }
        (MediaKind::VideoSticker, MediaKind::AnimatedGif) => vec![webm_to_gif_stage(&final_name)],
        (MediaKind::StaticImage, MediaKind::StaticImage) => {
            vec![recompress_stage(&final_name)]
        }
        _ => {
            return Err(ConvertError::UnsupportedConversion {
                from: source,
                to: target,
            })
        }
    };

    let stages = stages
        .into_iter()
        .enumerate()
        .map(|(index, stage)| StageDescriptor { index, ..stage })
        .collect();

    Ok(Pipeline {
        source,
        target,
        options: *options,
        profile: *profile,
        stages,
    })
}

fn decompress_stage(output: &str) -> StageDescriptor {
    StageDescriptor::new(
        "decompress",
        Tool::Decompressor,
        InputSpec::File,
        ArtifactSpec::File(output.to_string()),
    )
    .args(["-d", "-c", "{input}"])
    .stdout_to_output()
}

fn rasterize_stage() -> StageDescriptor {
    StageDescriptor::new(
        "rasterize",
        Tool::Renderer,
        InputSpec::File,
        ArtifactSpec::Frames {
            dir: FRAMES_DIR.to_string(),
            pattern: FRAME_PATTERN.to_string(),
        },
    )
    .args(["--width", "{width}", "--height", "{height}"])
    .args(["--fps", "{fps}", "--threads", "{threads}"])
    .args(["--output", "{output}", "{input}"])
}

fn encode_gif_stage(output: &str) -> StageDescriptor {
    StageDescriptor::new(
        "encode-gif",
        Tool::GifEncoder,
        InputSpec::Frames,
        ArtifactSpec::File(output.to_string()),
    )
    .args(["--fps", "{fps}", "--width", "{width}", "--height", "{height}"])
    .args(["--quality", "{gif_quality}", "-o", "{output}"])
    .input_list()
}

fn gif_to_webm_stage(output: &str, profile: &BuildProfile) -> StageDescriptor {
    let seconds = format!("{:.3}", profile.max_video_duration.as_secs_f64());
    let stage = StageDescriptor::new(
        "transcode-to-webm",
        Tool::Transcoder,
        InputSpec::File,
        ArtifactSpec::File(output.to_string()),
    )
    .args(["-hide_banner", "-nostdin", "-y"])
    .args(["-t".to_string(), seconds])
    .args(["-i", "{input}"])
    .args([
        "-vf",
        "scale=w={width}:h={height}:force_original_aspect_ratio=decrease,fps={fps}",
    ])
    .args(["-threads", "{threads}", "-c:v", "libvpx-vp9"]);

    let stage = if profile.lossless {
        stage.args(["-lossless", "1"])
    } else {
        stage.args(["-crf", "{crf}", "-b:v", "0"])
    };

    stage.args(["-an", "-f", "webm", "{output}"])
}

fn webm_to_gif_stage(output: &str) -> StageDescriptor {
    StageDescriptor::new(
        "transcode-to-gif",
        Tool::Transcoder,
        InputSpec::File,
        ArtifactSpec::File(output.to_string()),
    )
    .args(["-hide_banner", "-nostdin", "-y", "-i", "{input}"])
    .args([
        "-vf",
        "fps={fps},scale=w={width}:h={height}:force_original_aspect_ratio=decrease",
    ])
    .args(["-threads", "{threads}", "-c:v", "gif", "-f", "gif", "{output}"])
}

fn recompress_stage(output: &str) -> StageDescriptor {
    StageDescriptor::new(
        "recompress-webp",
        Tool::ImageRecompressor,
        InputSpec::File,
        ArtifactSpec::File(output.to_string()),
    )
    .args(["-quiet", "-metadata", "none", "-q", "{quality}"])
    .args(["-resize", "{width}", "{height}"])
    .args(["{input}", "-o", "{output}"])
}
