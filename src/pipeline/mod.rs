//! Conversion pipelines
//!
//! A pipeline is an ordered list of stage descriptors, each describing one
//! external tool invocation. The builder picks the chain for a pair of media
//! kinds; the executor runs it inside a scratch workspace.

pub mod builder;
pub mod executor;
pub mod frames;
pub mod stage;

pub use builder::{build, is_supported, BuildProfile, Pipeline};
pub use executor::{ExecutionOutput, Executor, StageReport};
pub use frames::{collect_frames, sort_frames, FramePattern};
pub use stage::{Arg, ArtifactSpec, InputSpec, ResolvedArtifact, StageDescriptor};
