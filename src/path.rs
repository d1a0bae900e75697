//! Upstream path <-> container/key mapping
//!
//! Upstream paths look like `/container/key/with/slashes`. The object store
//! has no directories, so a path is split into the container (first segment)
//! and the key (everything after it, trailing separator preserved).

use std::fmt;

/// Path separator used by both upstream paths and object keys
pub const SEPARATOR: char = '/';

/// A decomposed upstream path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ObjectPath {
    /// Container (bucket) name, empty for the root
    pub container: String,
    /// Key inside the container, empty for the container root
    pub key: String,
}

impl ObjectPath {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }

    /// True for `/`, the listing of all containers
    pub fn is_root(&self) -> bool {
        self.container.is_empty()
    }

    /// True for `/container` and `/container/`
    pub fn is_container_root(&self) -> bool {
        !self.container.is_empty() && self.key.is_empty()
    }

    /// Rebuild the upstream path
    pub fn compose(&self) -> String {
        compose(&self.container, &self.key)
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.compose())
    }
}

/// Split an upstream path into container and key.
///
/// No `.`/`..` normalisation happens here; malformed input simply produces
/// an empty container or key.
pub fn decompose(path: &str) -> ObjectPath {
    let mut segments = path.split(SEPARATOR);
    // Anything before the leading separator is ignored
    segments.next();

    let container = segments.next().unwrap_or_default().to_string();
    if container.is_empty() {
        // The root has no key
        return ObjectPath::default();
    }
    let key = segments.collect::<Vec<_>>().join("/");

    ObjectPath { container, key }
}

/// Build an upstream path from a container and a key
pub fn compose(container: &str, key: &str) -> String {
    if container.is_empty() {
        return SEPARATOR.to_string();
    }
    if key.is_empty() {
        format!("/{}", container)
    } else {
        format!("/{}/{}", container, key)
    }
}

/// Join segments with a single separator, dropping empty segments.
///
/// Leading and trailing separators of the result are not added; callers
/// decide whether the result is absolute or a directory.
pub fn join<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parts: Vec<String> = Vec::new();
    for segment in segments {
        parts.extend(
            segment
                .as_ref()
                .split(SEPARATOR)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        );
    }
    parts.join("/")
}

/// Whether the path designates a directory (trailing separator)
pub fn is_dir_path(path: &str) -> bool {
    path.ends_with(SEPARATOR)
}

/// Last segment of a key or prefix, ignoring a trailing separator
pub fn base_name(key: &str) -> &str {
    let trimmed = key.trim_end_matches(SEPARATOR);
    trimmed.rsplit(SEPARATOR).next().unwrap_or(trimmed)
}
