//! Path sandboxing for fileman
//!
//! Every host path the provider touches is derived from a virtual path
//! (root-relative, `/`-separated) plus an optional item name. Resolution is a
//! two-stage check: a lexical pass that never touches the filesystem, then a
//! canonicalization pass that proves the result still sits where the virtual
//! path says it does.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use normpath::PathExt;

#[derive(Error, Debug)]
pub enum SecurityError {
    #[error("Access denied for Directory-traversal")]
    PathTraversal(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, SecurityError>;

/// A validated, root-relative path.
///
/// Construction rejects anything that could climb out of the root, so holding a
/// `VirtualPath` means the lexical half of the traversal check already passed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct VirtualPath {
    segments: Vec<String>,
}

impl VirtualPath {
    /// The root folder itself.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a client-supplied virtual path such as `/docs/reports/`.
    pub fn parse(path: &str) -> Result<Self> {
        let mut segments = Vec::new();
        for segment in split_segments(path)? {
            segments.push(segment);
        }
        Ok(Self { segments })
    }

    /// Append a relative name, which may itself contain `/` separators.
    pub fn join(&self, name: &str) -> Result<Self> {
        if name.starts_with('/') {
            return Err(SecurityError::PathTraversal(name.to_string()));
        }
        let mut segments = self.segments.clone();
        segments.extend(split_segments(name)?);
        Ok(Self { segments })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Last segment, `None` for the root.
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Every path from the root down to and including `self`.
    pub fn ancestors(&self) -> Vec<Self> {
        (0..=self.segments.len())
            .map(|len| Self { segments: self.segments[..len].to_vec() })
            .collect()
    }

    /// Directory form with surrounding separators: `/`, `/a/`, `/a/b/`.
    pub fn as_dir_string(&self) -> String {
        if self.is_root() {
            "/".to_string()
        } else {
            format!("/{}/", self.segments.join("/"))
        }
    }

    /// Whether `self` is `other` or lies beneath it.
    pub fn starts_with(&self, other: &VirtualPath) -> bool {
        self.segments.starts_with(&other.segments)
    }

    fn to_host(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in &self.segments {
            path.push(segment);
        }
        path
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

/// Split and vet path segments without any filesystem access.
fn split_segments(path: &str) -> Result<Vec<String>> {
    let reject = || SecurityError::PathTraversal(path.to_string());

    if path.contains('\\') || path.contains('\0') {
        return Err(reject());
    }
    let lowered = path.to_ascii_lowercase();
    if ["%2e", "%2f", "%5c", "%00"].iter().any(|enc| lowered.contains(enc)) {
        return Err(reject());
    }

    let mut segments = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(reject());
        }
        if is_drive_segment(segment) {
            return Err(reject());
        }
        segments.push(segment.to_string());
    }
    Ok(segments)
}

/// A bare drive such as `C:`. On Windows any colon is refused, since it
/// names a drive-relative path or an alternate data stream.
fn is_drive_segment(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    if bytes.len() == 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return true;
    }
    cfg!(windows) && segment.contains(':')
}

/// Path equality as the host filesystem sees it.
#[cfg(any(windows, target_os = "macos"))]
fn same_location(a: &Path, b: &Path) -> bool {
    a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
}

#[cfg(not(any(windows, target_os = "macos")))]
fn same_location(a: &Path, b: &Path) -> bool {
    a == b
}

/// Filesystem seam used by [`PathResolver`] for the canonical half of the check.
pub trait PathCanonicalizer: Send + Sync + fmt::Debug {
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

    /// Whether anything (including a dangling symlink) exists at `path`.
    fn exists(&self, path: &Path) -> bool;
}

/// Canonicalizer backed by the host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostCanonicalizer;

impl PathCanonicalizer for HostCanonicalizer {
    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        path.normalize().map(|p| p.into_path_buf())
    }

    fn exists(&self, path: &Path) -> bool {
        std::fs::symlink_metadata(path).is_ok()
    }
}

/// Maps virtual paths onto a single immutable root folder.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
    canonicalizer: Arc<dyn PathCanonicalizer>,
}

impl PathResolver {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_canonicalizer(root, Arc::new(HostCanonicalizer))
    }

    /// Build a resolver over a custom canonicalizer.
    pub fn with_canonicalizer(
        root: impl AsRef<Path>,
        canonicalizer: Arc<dyn PathCanonicalizer>,
    ) -> Result<Self> {
        let root = root.as_ref();
        let root = canonicalizer.canonicalize(root).map_err(|e| {
            SecurityError::InvalidPath(format!("root folder '{}': {}", root.display(), e))
        })?;
        Ok(Self { root, canonicalizer })
    }

    /// Canonical root folder.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client path and optional item name to a host path.
    pub fn resolve(&self, path: &str, name: Option<&str>) -> Result<PathBuf> {
        let mut target = VirtualPath::parse(path)?;
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            target = target.join(name)?;
        }
        self.resolve_virtual(&target)
    }

    /// Resolve an already parsed virtual path.
    ///
    /// The nearest existing ancestor of the candidate is canonicalized and must
    /// land exactly where the virtual segments say it should. A symlink that
    /// leads anywhere else is a traversal.
    pub fn resolve_virtual(&self, target: &VirtualPath) -> Result<PathBuf> {
        let expected = target.to_host(&self.root);

        let mut depth = target.segments().len();
        let mut probe = expected.clone();
        while depth > 0 && !self.canonicalizer.exists(&probe) {
            depth -= 1;
            probe.pop();
        }
        if depth == 0 {
            return Ok(expected);
        }

        let canonical = self.canonicalizer.canonicalize(&probe).map_err(|e| {
            tracing::warn!("Cannot canonicalize '{}': {}", probe.display(), e);
            SecurityError::PathTraversal(target.to_string())
        })?;
        if !same_location(&canonical, &probe) {
            tracing::warn!(
                "Traversal attempt: '{}' resolves to '{}'",
                target,
                canonical.display()
            );
            return Err(SecurityError::PathTraversal(target.to_string()));
        }
        Ok(expected)
    }

    /// Map a host path found by walking the tree back to its virtual path,
    /// re-running the full check on the way.
    pub fn virtual_path_of(&self, host: &Path) -> Result<VirtualPath> {
        let relative = host
            .strip_prefix(&self.root)
            .map_err(|_| SecurityError::PathTraversal(host.display().to_string()))?;
        let mut target = VirtualPath::root();
        for component in relative.components() {
            match component {
                std::path::Component::Normal(part) => {
                    let part = part.to_str().ok_or_else(|| {
                        SecurityError::InvalidPath(host.display().to_string())
                    })?;
                    target = target.join(part)?;
                }
                _ => return Err(SecurityError::PathTraversal(host.display().to_string())),
            }
        }
        self.resolve_virtual(&target)?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Debug, Default)]
    struct CountingCanonicalizer {
        calls: AtomicUsize,
    }

    impl PathCanonicalizer for CountingCanonicalizer {
        fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            HostCanonicalizer.canonicalize(path)
        }

        fn exists(&self, path: &Path) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            HostCanonicalizer.exists(path)
        }
    }

    #[test]
    fn test_virtual_path_forms() {
        let path = VirtualPath::parse("/docs//reports/").unwrap();
        assert_eq!(path.segments(), &["docs".to_string(), "reports".to_string()]);
        assert_eq!(path.to_string(), "/docs/reports");
        assert_eq!(path.as_dir_string(), "/docs/reports/");
        assert_eq!(path.name(), Some("reports"));
        assert_eq!(path.parent().unwrap().as_dir_string(), "/docs/");
        assert_eq!(VirtualPath::parse("").unwrap().as_dir_string(), "/");
        assert_eq!(path.ancestors().len(), 3);
    }

    #[test]
    fn test_traversal_rejected_without_fs_access() {
        let temp = tempdir().unwrap();
        let spy = Arc::new(CountingCanonicalizer::default());
        let resolver = PathResolver::with_canonicalizer(temp.path(), spy.clone()).unwrap();
        let baseline = spy.calls.load(Ordering::SeqCst);

        let attempts = [
            ("/../etc/", None),
            ("/docs/../../", None),
            ("/", Some("..")),
            ("/", Some("../secret.txt")),
            ("/docs\\..\\", None),
            ("/", Some("a\\b.txt")),
            ("/C:/Windows/", None),
            ("/%2e%2e/", None),
            ("/", Some("%2E%2E%2Fpasswd")),
            ("/", Some("/etc/passwd")),
            ("/./", None),
        ];
        for (path, name) in attempts {
            let result = resolver.resolve(path, name);
            assert!(
                matches!(result, Err(SecurityError::PathTraversal(_))),
                "expected rejection for {:?} {:?}",
                path,
                name
            );
        }
        assert_eq!(spy.calls.load(Ordering::SeqCst), baseline);
    }

    #[cfg(unix)]
    #[test]
    fn test_colons_allowed_in_unix_names() {
        let temp = tempdir().unwrap();
        let resolver = PathResolver::new(temp.path()).unwrap();

        let path = resolver.resolve("/", Some("notes:v2.txt")).unwrap();
        assert_eq!(path, resolver.root().join("notes:v2.txt"));
        assert!(resolver.resolve("/", Some("c:")).is_err());
        assert!(resolver.resolve("/D:/", None).is_err());
    }

    #[test]
    fn test_resolve_inside_root() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("docs")).unwrap();
        let resolver = PathResolver::new(temp.path()).unwrap();

        let existing = resolver.resolve("/docs/", None).unwrap();
        assert_eq!(existing, resolver.root().join("docs"));

        let missing = resolver.resolve("/docs/", Some("new/deeper.txt")).unwrap();
        assert_eq!(missing, resolver.root().join("docs").join("new").join("deeper.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let temp = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("link")).unwrap();
        let resolver = PathResolver::new(temp.path()).unwrap();

        assert!(matches!(
            resolver.resolve("/link/", Some("file.txt")),
            Err(SecurityError::PathTraversal(_))
        ));
    }

    #[test]
    fn test_virtual_path_of_round_trips_host_paths() {
        let temp = tempdir().unwrap();
        fs::create_dir_all(temp.path().join("a").join("b")).unwrap();
        let resolver = PathResolver::new(temp.path()).unwrap();

        let host = resolver.root().join("a").join("b");
        let virt = resolver.virtual_path_of(&host).unwrap();
        assert_eq!(virt.as_dir_string(), "/a/b/");
        assert!(resolver.virtual_path_of(Path::new("/definitely/elsewhere")).is_err());
    }
}
