//! Caption-driven folder layout for downloaded media.
//!
//! A message caption describes where its media belongs:
//!
//! ```text
//! #F0001 .mp4          <- identifier line, dropped
//! Course               <- root (no marker)
//! =Module 1            <- depth 1
//! ==Lesson 2           <- depth 2
//! ```
//!
//! resolves to `Course/Module 1/Lesson 2/Lesson 2 (#F0001).mp4`.
//!
//! Lines without a marker are always moved to the front of the hierarchy, so a
//! caption with several unmarked lines ends up with the *last* one first. That
//! ordering is kept as-is (see `test_unmarked_lines_collapse_to_front_last_wins`).
//!
//! A marked line loses every occurrence of its leading marker run, not only the
//! leading one: `=Module = Basics` names the folder `Module  Basics`, and
//! `====Extra` (depth 3) names it `=Extra`, matching the names stored in
//! existing catalogs.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Extension given to every media file written by this crate.
pub const MEDIA_EXTENSION: &str = "mp4";

/// Suffix appended to the final path while a download is in progress.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Character whose leading repetitions encode the hierarchy depth.
const MARKER: char = '=';

/// Marker run removed from a line of depth `n`, at index `n - 1`.
const MARKER_RUNS: [&str; 3] = ["=", "==", "==="];

/// Deepest level a marker run can express; longer runs collapse onto it.
const MAX_DEPTH: u8 = 3;

/// Tag that starts an identifier line.
const IDENTIFIER_TAG: &str = "#F";

/// Extension token an identifier line must contain.
const IDENTIFIER_EXTENSION_TOKEN: &str = ".mp4";

/// Errors raised while materialising a destination on disk.
#[derive(Debug, Error)]
pub enum LayoutError {
    /// A folder of the hierarchy could not be created.
    #[error("failed to create folder {path}: {source}")]
    CreateFolder {
        /// Folder that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// One classified caption line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 0 for an unmarked (root) line, otherwise the number of leading markers (max 3).
    pub depth: u8,
    /// Folder name with markers removed, trimmed and made filesystem-safe.
    pub name: String,
}

/// Folder hierarchy plus file name derived from a caption.
///
/// Always relative; join it onto a destination root with [`DestinationPath::under`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationPath {
    folders: Vec<String>,
    file_name: String,
}

impl DestinationPath {
    /// Derives the destination for `caption` without touching the filesystem.
    ///
    /// `identifier` is embedded in the file name and stands in for the deepest
    /// folder when the caption yields no hierarchy at all.
    #[must_use]
    pub fn from_caption(caption: &str, identifier: &str) -> Self {
        let mut lines: Vec<&str> = caption
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        if lines.first().is_some_and(|first| is_identifier_line(first)) {
            lines.remove(0);
        }

        let mut folders: Vec<String> = Vec::with_capacity(lines.len());
        for segment in lines.into_iter().map(classify_line) {
            if segment.name.is_empty() {
                continue;
            }
            if segment.depth == 0 {
                folders.insert(0, segment.name);
            } else {
                folders.push(segment.name);
            }
        }

        let deepest = folders
            .last()
            .cloned()
            .unwrap_or_else(|| sanitize_segment(identifier));
        let file_name = sanitize_segment(&format!("{deepest} ({identifier}).{MEDIA_EXTENSION}"));

        Self { folders, file_name }
    }

    /// Folder names from the root downwards.
    #[must_use]
    pub fn folders(&self) -> &[String] {
        &self.folders
    }

    /// Final file name, `"<deepest> (<identifier>).mp4"`.
    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Relative path of the final file.
    #[must_use]
    pub fn relative_path(&self) -> PathBuf {
        let mut path: PathBuf = self.folders.iter().collect();
        path.push(&self.file_name);
        path
    }

    /// Folder that will contain the file, under `root`.
    #[must_use]
    pub fn folder_under(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        path.extend(&self.folders);
        path
    }

    /// Absolute (root-joined) path of the final file.
    #[must_use]
    pub fn under(&self, root: &Path) -> PathBuf {
        self.folder_under(root).join(&self.file_name)
    }
}

/// Resolves the destination for a caption and creates its folders under `root`.
///
/// Folder creation is idempotent.
///
/// # Errors
///
/// Returns [`LayoutError::CreateFolder`] when the hierarchy cannot be created.
pub fn resolve(root: &Path, caption: &str, identifier: &str) -> Result<DestinationPath, LayoutError> {
    let destination = DestinationPath::from_caption(caption, identifier);
    let folder = destination.folder_under(root);
    std::fs::create_dir_all(&folder).map_err(|source| LayoutError::CreateFolder {
        path: folder.clone(),
        source,
    })?;
    debug!(folder = %folder.display(), file = destination.file_name(), "resolved destination");
    Ok(destination)
}

/// Path of the in-progress artifact for a final destination path.
#[must_use]
pub fn partial_path(final_path: &Path) -> PathBuf {
    let mut raw: OsString = final_path.as_os_str().to_owned();
    raw.push(PARTIAL_SUFFIX);
    PathBuf::from(raw)
}

/// Returns true when `line` is the leading identifier tag (e.g. `#F0001 .mp4`).
#[must_use]
pub fn is_identifier_line(line: &str) -> bool {
    line.starts_with(IDENTIFIER_TAG) && line.contains(IDENTIFIER_EXTENSION_TOKEN)
}

/// Classifies a trimmed caption line by its leading marker count.
///
/// The depth comes from the leading run (capped at 3); the name is the line
/// with every occurrence of that run removed.
#[must_use]
pub fn classify_line(line: &str) -> Segment {
    let markers = line.chars().take_while(|&c| c == MARKER).count();
    let depth = u8::try_from(markers).unwrap_or(MAX_DEPTH).min(MAX_DEPTH);
    let name = match depth {
        0 => line.to_string(),
        depth => line.replace(MARKER_RUNS[usize::from(depth) - 1], ""),
    };
    Segment {
        depth,
        name: sanitize_segment(name.trim()),
    }
}

/// Makes a single path segment safe for common filesystems.
///
/// Replaces `< > : " / \ | ? *` and control characters with `_` and
/// neutralises the `.` and `..` segments.
pub(crate) fn sanitize_segment(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = sanitized.trim();
    match trimmed {
        "." | ".." => "_".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_example_caption_resolves_to_nested_path() {
        let destination = DestinationPath::from_caption("Course\n=Module 1\n==Lesson 2", "F0001");
        assert_eq!(destination.folders(), ["Course", "Module 1", "Lesson 2"]);
        assert_eq!(destination.file_name(), "Lesson 2 (F0001).mp4");
        assert_eq!(
            destination.relative_path(),
            PathBuf::from("Course/Module 1/Lesson 2/Lesson 2 (F0001).mp4")
        );
    }

    #[test]
    fn test_identifier_line_is_dropped() {
        let destination =
            DestinationPath::from_caption("#F0042 .mp4\nCourse\n=Intro", "#F0042");
        assert_eq!(destination.folders(), ["Course", "Intro"]);
        assert_eq!(destination.file_name(), "Intro (#F0042).mp4");
    }

    #[test]
    fn test_first_line_without_extension_token_is_kept() {
        let destination = DestinationPath::from_caption("#F0042\nCourse", "#F0042");
        assert_eq!(destination.folders(), ["Course", "#F0042"]);
    }

    #[test]
    fn test_identifier_line_only_dropped_when_first() {
        let destination = DestinationPath::from_caption("Course\n#F0001 .mp4", "#F0001");
        // The tag line is not first, so it is an ordinary root line and moves to the front.
        assert_eq!(destination.folders(), ["#F0001 .mp4", "Course"]);
    }

    #[test]
    fn test_depth_classification() {
        assert_eq!(classify_line("Root").depth, 0);
        assert_eq!(classify_line("=One").depth, 1);
        assert_eq!(classify_line("==Two").depth, 2);
        assert_eq!(classify_line("===Three").depth, 3);
        assert_eq!(classify_line("====Four").depth, 3);
        assert_eq!(classify_line("=== Three ").name, "Three");
    }

    #[test]
    fn test_marker_run_removed_everywhere_in_line() {
        assert_eq!(classify_line("=Module = Basics").name, "Module  Basics");
        assert_eq!(classify_line("==Lesson 1 == Intro").name, "Lesson 1  Intro");
        // Only the depth's own run is removed, so a lone `=` survives at depth 2.
        assert_eq!(classify_line("==a = b").name, "a = b");
    }

    #[test]
    fn test_long_marker_run_keeps_remainder() {
        let segment = classify_line("====Extra");
        assert_eq!(segment.depth, 3);
        assert_eq!(segment.name, "=Extra");
        assert_eq!(classify_line("======Six").name, "Six");
    }

    #[test]
    fn test_caption_with_inner_markers_matches_catalog_names() {
        let destination = DestinationPath::from_caption(
            "#F0001 .mp4\nCourse\n=Module = Basics\n==Lesson 1 == Intro\n====Extra",
            "#F0001",
        );
        assert_eq!(
            destination.folders(),
            ["Course", "Module  Basics", "Lesson 1  Intro", "=Extra"]
        );
        assert_eq!(destination.file_name(), "=Extra (#F0001).mp4");
    }

    #[test]
    fn test_unmarked_lines_collapse_to_front_last_wins() {
        let destination = DestinationPath::from_caption("=Module\nFirst\nSecond", "id");
        assert_eq!(destination.folders(), ["Second", "First", "Module"]);
        assert_eq!(destination.file_name(), "Module (id).mp4");
    }

    #[test]
    fn test_empty_caption_falls_back_to_identifier() {
        let destination = DestinationPath::from_caption("", "#F0007");
        assert!(destination.folders().is_empty());
        assert_eq!(destination.file_name(), "#F0007 (#F0007).mp4");

        let only_tag = DestinationPath::from_caption("  #F0007 .mp4  \n\n", "#F0007");
        assert!(only_tag.folders().is_empty());
        assert_eq!(only_tag.file_name(), "#F0007 (#F0007).mp4");
    }

    #[test]
    fn test_blank_lines_and_whitespace_ignored() {
        let destination = DestinationPath::from_caption("\n  Course  \n\n  =  Week 1 \n", "x");
        assert_eq!(destination.folders(), ["Course", "Week 1"]);
    }

    #[test]
    fn test_marker_only_line_contributes_no_folder() {
        let destination = DestinationPath::from_caption("Course\n==\n=Week", "x");
        assert_eq!(destination.folders(), ["Course", "Week"]);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let caption = "#F1234 .mp4\nPython\n=Basics\n==Loops\n===While";
        let first = DestinationPath::from_caption(caption, "#F1234");
        for _ in 0..10 {
            assert_eq!(DestinationPath::from_caption(caption, "#F1234"), first);
        }
    }

    #[test]
    fn test_hostile_segments_cannot_escape_root() {
        let destination = DestinationPath::from_caption("..\n=a/b\n==c:d", "id");
        assert_eq!(destination.folders(), ["_", "a_b", "c_d"]);
        let root = Path::new("/data");
        assert!(destination.under(root).starts_with(root));
    }

    #[test]
    fn test_resolve_creates_folders_idempotently() {
        let temp = TempDir::new().unwrap();
        let first = resolve(temp.path(), "Course\n=Module", "id").unwrap();
        let second = resolve(temp.path(), "Course\n=Module", "id").unwrap();
        assert_eq!(first, second);
        assert!(temp.path().join("Course").join("Module").is_dir());
        assert!(!first.under(temp.path()).exists());
    }

    #[test]
    fn test_partial_path_appends_suffix() {
        let path = partial_path(Path::new("/x/Lesson (id).mp4"));
        assert_eq!(path, PathBuf::from("/x/Lesson (id).mp4.part"));
    }
}
