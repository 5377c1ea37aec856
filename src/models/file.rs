//! Files as they cross a session: incoming upload entries and listed files.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::io::AsyncRead;

/// One file being uploaded, as supplied by the transfer protocol.
///
/// The entry is consumed by a single write. `size` is whatever the client
/// declared; the upload path overwrites it with the number of bytes actually
/// read from `reader`.
pub struct FileEntry {
    /// Logical path, e.g. `/blog/post1.md`.
    pub filepath: String,

    pub size: i64,

    /// Modification time as unix seconds.
    pub mtime: i64,

    pub reader: Box<dyn AsyncRead + Send + Sync + Unpin>,
}

impl FileEntry {
    pub fn new(
        filepath: impl Into<String>,
        size: i64,
        mtime: i64,
        reader: impl AsyncRead + Send + Sync + Unpin + 'static,
    ) -> Self {
        Self {
            filepath: filepath.into(),
            size,
            mtime,
            reader: Box::new(reader),
        }
    }

    pub fn project_name(&self) -> Option<&str> {
        project_name(&self.filepath)
    }

    pub fn asset_key(&self) -> &str {
        asset_key(&self.filepath)
    }

    /// Path relative to the project directory: the first `/<project>/` removed.
    pub fn project_relative_path(&self, project: &str) -> String {
        self.filepath.replacen(&format!("/{}/", project), "", 1)
    }
}

/// Bare file name (last non-empty path segment).
pub fn base_name(path: &str) -> &str {
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
}

/// Project a path belongs to: its first non-empty segment.
pub fn project_name(path: &str) -> Option<&str> {
    path.split('/').find(|segment| !segment.is_empty())
}

/// Object key a path is stored under: the path without leading `/`.
pub fn asset_key(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// A path naming the current directory: only `.` and separators, at least
/// one `.` (`.`, `./`, `/.`, `././`).
pub fn is_current_dir(path: &str) -> bool {
    path.split('/').any(|segment| segment == ".")
        && path.split('/').all(|segment| segment.is_empty() || segment == ".")
}

/// Directory path with empty and `.` segments dropped: `/./blog//` is `blog`.
pub fn normalize_dir(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

impl fmt::Debug for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileEntry")
            .field("filepath", &self.filepath)
            .field("size", &self.size)
            .field("mtime", &self.mtime)
            .finish_non_exhaustive()
    }
}

/// A normalized listing entry, independent of how the backend stores objects.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct VirtualFile {
    pub name: String,
    pub is_dir: bool,
    pub size: i64,
    pub mod_time: Option<DateTime<Utc>>,
}

impl VirtualFile {
    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_dir: true,
            size: 0,
            mod_time: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> FileEntry {
        FileEntry::new(path, 0, 0, tokio::io::empty())
    }

    #[test]
    fn project_name_is_first_segment() {
        assert_eq!(entry("/blog/post1.md").project_name(), Some("blog"));
        assert_eq!(entry("blog/2024/a.md").project_name(), Some("blog"));
        assert_eq!(entry("//blog/a.md").project_name(), Some("blog"));
        assert_eq!(entry("/").project_name(), None);
        assert_eq!(entry("").project_name(), None);
    }

    #[test]
    fn asset_key_strips_leading_separator() {
        assert_eq!(entry("/blog/post1.md").asset_key(), "blog/post1.md");
        assert_eq!(entry("blog/post1.md").asset_key(), "blog/post1.md");
    }

    #[test]
    fn current_dir_references() {
        for path in [".", "./", "/.", "/./", "././"] {
            assert!(is_current_dir(path), "{path}");
        }
        for path in ["", "/", "//", "./blog", "..", ".hidden"] {
            assert!(!is_current_dir(path), "{path}");
        }
    }

    #[test]
    fn normalize_dir_drops_empty_and_dot_segments() {
        assert_eq!(normalize_dir("/./blog//img/"), "blog/img");
        assert_eq!(normalize_dir("/"), "");
        assert_eq!(normalize_dir("blog"), "blog");
    }

    #[test]
    fn base_name_is_last_segment() {
        assert_eq!(base_name("/blog/img/cat.png"), "cat.png");
        assert_eq!(base_name("/blog/"), "blog");
        assert_eq!(base_name("/"), "");
    }

    #[test]
    fn relative_path_strips_project_dir_once() {
        let e = entry("/blog/post1.md");
        assert_eq!(e.project_relative_path("blog"), "post1.md");
        let e = entry("/blog/blog/post1.md");
        assert_eq!(e.project_relative_path("blog"), "blog/post1.md");
    }
}
