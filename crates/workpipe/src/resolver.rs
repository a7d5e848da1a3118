//! File resolution: the sole I/O boundary of the compiler.
//!
//! Everything the compiler reads goes through a [`FileResolver`]; all
//! other passes are pure computation. Two implementations ship: a
//! filesystem resolver for the CLI and an in-memory resolver for tests
//! and editor embeddings.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};

pub mod context;
pub mod graph;

pub use context::ImportContext;

/// Resolves and reads `.workpipe` sources.
///
/// `resolve` maps an import path as written (`./lib.workpipe`) to a
/// normalized absolute path, without touching the filesystem; `exists`
/// and `read` perform the I/O.
pub trait FileResolver {
    /// Resolves `import_path` relative to `from_file`, returning a
    /// normalized absolute path, or `None` when the path cannot be
    /// normalized (e.g. `..` past the filesystem root).
    fn resolve(&self, import_path: &str, from_file: &Utf8Path) -> Option<Utf8PathBuf>;

    /// Reads the file's source text.
    fn read(&self, path: &Utf8Path) -> io::Result<String>;

    /// Returns whether the file exists.
    fn exists(&self, path: &Utf8Path) -> bool;
}

/// Checks the shape rules for an import path as written: it must be
/// `./`- or `../`-relative and carry the `.workpipe` extension.
pub fn valid_import_shape(import_path: &str) -> bool {
    let slashed = import_path.replace('\\', "/");
    (slashed.starts_with("./") || slashed.starts_with("../"))
        && slashed.ends_with(".workpipe")
}

/// Normalizes a path: backslashes become `/`, duplicate separators
/// collapse, `.` and `..` segments resolve. Leading `..` segments are
/// preserved when the path escapes its logical start.
pub fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let slashed = path.as_str().replace('\\', "/");
    let absolute = slashed.starts_with('/');

    let mut segments: Vec<&str> = vec![];
    for segment in slashed.split('/') {
        match segment {
            "" | "." => (),
            ".." => {
                match segments.last() {
                    Some(&"..") | None => {
                        // Escaping the logical start: keep the `..`
                        // unless the path is absolute, where the root
                        // absorbs it.
                        if !absolute {
                            segments.push("..");
                        }
                    }
                    Some(_) => {
                        segments.pop();
                    }
                }
            }
            other => segments.push(other),
        }
    }

    let mut out = String::new();
    if absolute {
        out.push('/');
    }
    out.push_str(&segments.join("/"));
    if out.is_empty() {
        out.push('.');
    }

    Utf8PathBuf::from(out)
}

/// The form of a normalized path used for identity comparisons.
///
/// Case-insensitive filesystems compare lowercased.
pub fn comparable(path: &Utf8Path) -> String {
    if cfg!(any(windows, target_os = "macos")) {
        path.as_str().to_lowercase()
    } else {
        path.as_str().to_owned()
    }
}

/// Returns whether `path` lies within `root` (both normalized).
pub fn within_root(path: &Utf8Path, root: &Utf8Path) -> bool {
    let path = comparable(path);
    let root = comparable(root).trim_end_matches('/').to_owned();
    path == root || path.starts_with(&format!("{root}/"))
}

fn join_and_normalize(import_path: &str, from_file: &Utf8Path) -> Option<Utf8PathBuf> {
    let base = from_file.parent()?;
    let joined = base.join(import_path.replace('\\', "/"));
    let normalized = normalize_path(&joined);

    // An absolute base cannot be escaped upward; a `..` surviving
    // normalization means the path left the filesystem root.
    if normalized.as_str().starts_with("..") {
        return None;
    }
    Some(normalized)
}

/// Filesystem-backed resolver used by the CLI.
pub struct FsResolver;

impl FileResolver for FsResolver {
    fn resolve(&self, import_path: &str, from_file: &Utf8Path) -> Option<Utf8PathBuf> {
        join_and_normalize(import_path, from_file)
    }

    fn read(&self, path: &Utf8Path) -> io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn exists(&self, path: &Utf8Path) -> bool {
        path.exists()
    }
}

/// In-memory resolver for tests and editor embeddings.
#[derive(Default)]
pub struct MemoryResolver {
    files: BTreeMap<String, String>,
}

impl MemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file under a normalized absolute path.
    pub fn add_file(&mut self, path: impl AsRef<Utf8Path>, source: impl Into<String>) {
        let normalized = normalize_path(path.as_ref());
        self.files.insert(comparable(&normalized), source.into());
    }
}

impl FileResolver for MemoryResolver {
    fn resolve(&self, import_path: &str, from_file: &Utf8Path) -> Option<Utf8PathBuf> {
        join_and_normalize(import_path, from_file)
    }

    fn read(&self, path: &Utf8Path) -> io::Result<String> {
        self.files
            .get(&comparable(&normalize_path(path)))
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_string()))
    }

    fn exists(&self, path: &Utf8Path) -> bool {
        self.files.contains_key(&comparable(&normalize_path(path)))
    }
}
