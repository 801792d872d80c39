//! Directory walking and candidate filtering for image discovery.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::Error;

/// Options controlling which files count as photo candidates.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ScanOptions {
    /// Allowed extensions, matched case-insensitively, without the dot.
    pub extensions: Vec<String>,
    /// Files must be strictly larger than this many bytes.
    pub min_file_bytes: u64,
    /// Number of candidates committed per write transaction.
    pub batch_size: usize,
    /// Descend into symlinked directories and index symlinked files.
    pub follow_links: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            extensions: vec!["jpg".into(), "jpeg".into(), "png".into()],
            min_file_bytes: 500_000,
            batch_size: 10,
            follow_links: false,
        }
    }
}

/// Return `true` if `path` has one of the allowed extensions.
#[must_use]
pub fn is_supported_image(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
}

/// Resolve `root` to an absolute directory path.
///
/// # Errors
/// Returns [`Error::BadDir`] if the path is missing or not a directory.
pub fn resolve_root(root: &Path) -> Result<PathBuf, Error> {
    let abs = std::path::absolute(root)?;
    if !abs.is_dir() {
        return Err(Error::BadDir(abs.to_string_lossy().into_owned()));
    }
    Ok(abs)
}

/// Lazily walk `root` top-down, yielding files that pass every filter.
///
/// Unreadable entries are logged and skipped; they never end the walk.
pub fn candidates<'a>(root: &Path, opts: &'a ScanOptions) -> impl Iterator<Item = PathBuf> + 'a {
    WalkDir::new(root)
        .follow_links(opts.follow_links)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(e) => Some(e),
            Err(err) => {
                debug!(error = %err, "skipping unreadable entry");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter(move |e| is_supported_image(e.path(), &opts.extensions))
        .filter(|e| !is_hidden(e))
        .filter(move |e| match e.metadata() {
            Ok(meta) => meta.len() > opts.min_file_bytes,
            Err(err) => {
                warn!(path = %e.path().display(), error = %err, "cannot stat candidate; skipping");
                false
            }
        })
        .map(DirEntry::into_path)
}

#[cfg(windows)]
fn is_hidden(entry: &DirEntry) -> bool {
    use std::os::windows::fs::MetadataExt;
    const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
    entry
        .metadata()
        .is_ok_and(|m| m.file_attributes() & FILE_ATTRIBUTE_HIDDEN != 0)
}

#[cfg(not(windows))]
fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().as_encoded_bytes().first() == Some(&b'.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::tempdir;

    fn sized(path: &Path, len: u64) {
        File::create(path).unwrap().set_len(len).unwrap();
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let exts = ScanOptions::default().extensions;
        assert!(is_supported_image(Path::new("/a/b.JPG"), &exts));
        assert!(is_supported_image(Path::new("/a/b.Jpeg"), &exts));
        assert!(is_supported_image(Path::new("/a/b.png"), &exts));
        assert!(!is_supported_image(Path::new("/a/b.gif"), &exts));
        assert!(!is_supported_image(Path::new("/a/jpg"), &exts));
    }

    #[test]
    fn candidates_apply_size_extension_and_hidden_filters() {
        let tmp = tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("nested")).unwrap();
        sized(&root.join("big.jpg"), 600_000);
        sized(&root.join("nested").join("big.PNG"), 600_000);
        sized(&root.join("exact.jpg"), 500_000);
        sized(&root.join("small.png"), 400_000);
        sized(&root.join("anim.gif"), 600_000);
        #[cfg(not(windows))]
        sized(&root.join(".secret.jpg"), 600_000);

        let opts = ScanOptions::default();
        let mut names: Vec<String> = candidates(root, &opts)
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        let nested = Path::new("nested").join("big.PNG").to_string_lossy().into_owned();
        assert_eq!(names, vec!["big.jpg".to_string(), nested]);
    }

    #[cfg(unix)]
    #[test]
    fn broken_links_do_not_end_the_walk() {
        use std::os::unix::fs::symlink;

        let tmp = tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("a")).unwrap();
        fs::create_dir_all(root.join("z")).unwrap();
        sized(&root.join("a").join("first.jpg"), 600_000);
        sized(&root.join("z").join("last.jpg"), 600_000);
        symlink(root, root.join("a").join("loop")).unwrap();
        symlink(root.join("nowhere.jpg"), root.join("a").join("dangling.jpg")).unwrap();

        let opts = ScanOptions {
            follow_links: true,
            ..ScanOptions::default()
        };
        let mut names: Vec<String> = candidates(root, &opts)
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        assert_eq!(names, vec!["first.jpg", "last.jpg"]);
    }

    #[test]
    fn missing_root_yields_nothing_and_is_rejected() {
        let tmp = tempdir().unwrap();
        let gone = tmp.path().join("gone");
        assert_eq!(candidates(&gone, &ScanOptions::default()).count(), 0);
        assert!(matches!(resolve_root(&gone), Err(Error::BadDir(_))));
        assert_eq!(resolve_root(tmp.path()).unwrap(), std::path::absolute(tmp.path()).unwrap());
    }
}
