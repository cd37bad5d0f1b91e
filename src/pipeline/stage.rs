use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::options::OutputOptions;
use crate::tools::Tool;

/// One argument of a stage's command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Arg {
    /// A single argument with `{placeholder}` substitution.
    ///
    /// Recognised placeholders: `{input}`, `{output}`, `{width}`, `{height}`,
    /// `{fps}`, `{quality}`, `{gif_quality}`, `{threads}`, `{crf}`.
    Template(String),
    /// Expands to every file of a frame-sequence input, in playback order
    InputList,
}

impl Arg {
    pub fn template(s: impl Into<String>) -> Self {
        Arg::Template(s.into())
    }
}

/// Shape of the artifact a stage consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputSpec {
    /// A single file
    File,
    /// An ordered sequence of frame files
    Frames,
}

/// Where a stage leaves its product, relative to the working directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArtifactSpec {
    /// A single file with this name
    File(String),
    /// Every file in `dir` whose name matches the glob `pattern`
    Frames { dir: String, pattern: String },
}

impl ArtifactSpec {
    /// Name of the file or directory the stage is told to write to
    pub fn target(&self) -> &str {
        match self {
            ArtifactSpec::File(name) => name,
            ArtifactSpec::Frames { dir, .. } => dir,
        }
    }

    pub fn input_spec(&self) -> InputSpec {
        match self {
            ArtifactSpec::File(_) => InputSpec::File,
            ArtifactSpec::Frames { .. } => InputSpec::Frames,
        }
    }
}

/// An artifact after its stage has run and it was found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedArtifact {
    File(PathBuf),
    Frames { dir: PathBuf, frames: Vec<PathBuf> },
}

impl ResolvedArtifact {
    /// The file, or the directory holding the frames
    pub fn path(&self) -> &Path {
        match self {
            ResolvedArtifact::File(path) => path,
            ResolvedArtifact::Frames { dir, .. } => dir,
        }
    }

    pub fn files(&self) -> Vec<&Path> {
        match self {
            ResolvedArtifact::File(path) => vec![path.as_path()],
            ResolvedArtifact::Frames { frames, .. } => frames.iter().map(PathBuf::as_path).collect(),
        }
    }
}

/// Declarative description of one external tool invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Position within its pipeline, starting at 0
    pub index: usize,
    pub name: String,
    pub tool: Tool,
    pub args: Vec<Arg>,
    pub input: InputSpec,
    pub output: ArtifactSpec,
    /// The tool writes its product to stdout, which is redirected into the
    /// output file instead of being captured as diagnostics
    pub stdout_is_output: bool,
    /// Overrides the executor's default per-stage timeout
    pub timeout: Option<Duration>,
}

impl StageDescriptor {
    pub fn new(name: impl Into<String>, tool: Tool, input: InputSpec, output: ArtifactSpec) -> Self {
        Self {
            index: 0,
            name: name.into(),
            tool,
            args: Vec::new(),
            input,
            output,
            stdout_is_output: false,
            timeout: None,
        }
    }

    pub fn arg(mut self, template: impl Into<String>) -> Self {
        self.args.push(Arg::Template(template.into()));
        self
    }

    pub fn args<I, S>(mut self, templates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(templates.into_iter().map(|t| Arg::Template(t.into())));
        self
    }

    pub fn input_list(mut self) -> Self {
        self.args.push(Arg::InputList);
        self
    }

    pub fn stdout_to_output(mut self) -> Self {
        self.stdout_is_output = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Produce the concrete argument list for one run of this stage
    pub fn materialize(
        &self,
        options: &OutputOptions,
        input: &ResolvedArtifact,
        output: &Path,
    ) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len());

        for arg in &self.args {
            match arg {
                Arg::Template(template) => {
                    argv.push(substitute(template, options, input.path(), output));
                }
                Arg::InputList => {
                    argv.extend(input.files().iter().map(|p| p.display().to_string()));
                }
            }
        }

        argv
    }
}

fn substitute(template: &str, options: &OutputOptions, input: &Path, output: &Path) -> String {
    if !template.contains('{') {
        return template.to_string();
    }

    template
        .replace("{input}", &input.display().to_string())
        .replace("{output}", &output.display().to_string())
        .replace("{width}", &options.width.to_string())
        .replace("{height}", &options.height.to_string())
        .replace("{fps}", &options.fps.to_string())
        .replace("{gif_quality}", &options.gif_quality().to_string())
        .replace("{quality}", &options.quality.to_string())
        .replace("{threads}", &options.threads.to_string())
        .replace("{crf}", &options.vp9_crf().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder_stage() -> StageDescriptor {
        StageDescriptor::new(
            "encode-gif",
            Tool::GifEncoder,
            InputSpec::Frames,
            ArtifactSpec::File("animation.gif".into()),
        )
        .args(["--fps", "{fps}", "--width", "{width}", "--quality", "{quality}"])
        .args(["-o", "{output}"])
        .input_list()
    }

    #[test]
    fn test_materialize_substitutes_options() {
        let options = OutputOptions::default().with_quality(70);
        let input = ResolvedArtifact::Frames {
            dir: PathBuf::from("/ws/frames"),
            frames: vec![
                PathBuf::from("/ws/frames/frame_0001.png"),
                PathBuf::from("/ws/frames/frame_0002.png"),
            ],
        };

        let argv = encoder_stage().materialize(&options, &input, Path::new("/ws/animation.gif"));
        assert_eq!(
            argv,
            vec![
                "--fps",
                "50",
                "--width",
                "512",
                "--quality",
                "70",
                "-o",
                "/ws/animation.gif",
                "/ws/frames/frame_0001.png",
                "/ws/frames/frame_0002.png",
            ]
        );
    }

    #[test]
    fn test_composite_template() {
        let stage = StageDescriptor::new(
            "transcode",
            Tool::Transcoder,
            InputSpec::File,
            ArtifactSpec::File("out.webm".into()),
        )
        .args(["-i", "{input}", "-vf", "scale=w={width}:h={height},fps={fps}"]);

        let options = OutputOptions::default().with_size(320, 240).with_fps(30);
        let input = ResolvedArtifact::File(PathBuf::from("/ws/input.gif"));
        let argv = stage.materialize(&options, &input, Path::new("/ws/out.webm"));
        assert_eq!(argv[1], "/ws/input.gif");
        assert_eq!(argv[3], "scale=w=320:h=240,fps=30");
    }

    #[test]
    fn test_artifact_spec_shapes() {
        let frames = ArtifactSpec::Frames {
            dir: "frames".into(),
            pattern: "*.png".into(),
        };
        assert_eq!(frames.target(), "frames");
        assert_eq!(frames.input_spec(), InputSpec::Frames);
        assert_eq!(ArtifactSpec::File("a.gif".into()).input_spec(), InputSpec::File);
    }
}
