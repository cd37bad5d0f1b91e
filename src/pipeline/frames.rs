//! Frame sequence resolution and ordering

use regex::Regex;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use walkdir::WalkDir;

fn trailing_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+)$").expect("static regex"))
}

/// Shell-style file name pattern supporting `*` and `?`
#[derive(Debug, Clone)]
pub struct FramePattern {
    glob: String,
    regex: Regex,
}

impl FramePattern {
    pub fn new(glob: &str) -> Result<Self, regex::Error> {
        let mut source = String::with_capacity(glob.len() + 8);
        source.push('^');
        for ch in glob.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        source.push('$');

        Ok(Self {
            glob: glob.to_string(),
            regex: Regex::new(&source)?,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.glob
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.regex.is_match(file_name)
    }
}

/// Number at the end of a file stem, e.g. `42` for `frame_0042.png`
pub fn numeric_suffix(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    trailing_number()
        .captures(stem)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Playback order: numbered frames ascending by number, then anything
/// unnumbered, with the file name as tie breaker.
pub fn compare_frames(a: &Path, b: &Path) -> Ordering {
    match (numeric_suffix(a), numeric_suffix(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.file_name().cmp(&b.file_name())),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.file_name().cmp(&b.file_name()),
    }
}

pub fn sort_frames(frames: &mut [PathBuf]) {
    frames.sort_by(|a, b| compare_frames(a, b));
}

/// Collect the regular files directly inside `dir` whose names match
/// `pattern`, in playback order.
pub fn collect_frames(dir: &Path, pattern: &FramePattern) -> std::io::Result<Vec<PathBuf>> {
    let mut frames = Vec::new();

    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if pattern.matches(name) {
                frames.push(entry.into_path());
            }
        }
    }

    sort_frames(&mut frames);
    Ok(frames)
}
