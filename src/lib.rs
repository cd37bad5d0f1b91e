//! Sticker Converter
//!
//! Converts sticker media between formats by chaining external command-line
//! tools (decompressor, frame renderer, GIF encoder, video transcoder, image
//! recompressor) inside short-lived scratch workspaces.

pub mod config;
pub mod converter;
pub mod error;
pub mod media;
pub mod options;
pub mod pipeline;
pub mod tools;
pub mod workspace;

// Re-export main types for easy access
pub use crate::config::{Config, ConfigBuilder};
pub use crate::converter::{
    ArtifactHandle, ConversionRequest, Converter, InputSource, PipelineResult,
};
pub use crate::error::{ConvertError, ErrorKind, FailureReason, Result};
pub use crate::media::{detect_bytes, infer_kind, MediaKind};
pub use crate::options::OutputOptions;
pub use crate::pipeline::{BuildProfile, Executor, Pipeline, StageDescriptor, StageReport};
pub use crate::tools::{Tool, ToolCommand, ToolTable};
pub use crate::workspace::Workspace;
