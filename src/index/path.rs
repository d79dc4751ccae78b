//! Root-tagged storage keys and their resolution against live directories.
//!
//! Every indexed file lives under one of two roots: the externally managed
//! mod root, or the cache root owned by this crate. Entries are keyed by a
//! [`PrefixedPath`] that records *which* root plus a root-relative path, so
//! the index survives either directory being moved.
//!
//! Relative components are stored NFC-normalized with `/` separators. macOS
//! hands out NFD names while Windows and Linux typically use NFC; without
//! normalization the same asset would get two keys.
//!
//! # Example
//!
//! ```
//! use modcache::index::{PrefixedPath, RootTag, Roots};
//! use std::path::{Path, PathBuf};
//!
//! let roots = Roots::new(Some(PathBuf::from("/mods")), Some(PathBuf::from("/cache")));
//! let key = roots.prefix(Path::new("/mods/chara/body.tex")).unwrap();
//! assert_eq!(key.tag(), RootTag::ModRoot);
//! assert_eq!(key.to_string(), "{modroot}/chara/body.tex");
//! assert_eq!(roots.resolve(&key), Some(PathBuf::from("/mods/chara/body.tex")));
//! ```

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use unicode_normalization::UnicodeNormalization;

const MOD_ROOT_TOKEN: &str = "{modroot}";
const CACHE_ROOT_TOKEN: &str = "{cache}";

/// Symbolic root a [`PrefixedPath`] is relative to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RootTag {
    /// The user's mod source tree.
    ModRoot,
    /// The cache directory holding downloaded content.
    CacheRoot,
}

impl RootTag {
    fn token(self) -> &'static str {
        match self {
            Self::ModRoot => MOD_ROOT_TOKEN,
            Self::CacheRoot => CACHE_ROOT_TOKEN,
        }
    }
}

/// Storage key of a cache entry: a root tag plus a normalized relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrefixedPath {
    tag: RootTag,
    relative: String,
}

impl PrefixedPath {
    /// Build a key from a tag and a relative path.
    ///
    /// Backslashes are treated as separators and the result is NFC-normalized.
    #[must_use]
    pub fn new(tag: RootTag, relative: &str) -> Self {
        let relative = relative
            .split(['/', '\\'])
            .filter(|part| !part.is_empty() && *part != ".")
            .collect::<Vec<_>>()
            .join("/");
        Self {
            tag,
            relative: relative.nfc().collect(),
        }
    }

    /// Root this key is relative to.
    #[must_use]
    pub fn tag(&self) -> RootTag {
        self.tag
    }

    /// Relative path, `/`-separated.
    #[must_use]
    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// File name component of the key.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.relative.rsplit('/').next().unwrap_or(&self.relative)
    }
}

impl fmt::Display for PrefixedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tag.token(), self.relative)
    }
}

/// Error returned when a persisted key carries no known root token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown root prefix in path: {0}")]
pub struct UnknownRootError(pub String);

impl FromStr for PrefixedPath {
    type Err = UnknownRootError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, rest) = if let Some(rest) = strip_token(s, MOD_ROOT_TOKEN) {
            (RootTag::ModRoot, rest)
        } else if let Some(rest) = strip_token(s, CACHE_ROOT_TOKEN) {
            (RootTag::CacheRoot, rest)
        } else {
            return Err(UnknownRootError(s.to_string()));
        };

        let key = Self::new(tag, rest);
        if key.relative.is_empty() {
            return Err(UnknownRootError(s.to_string()));
        }
        Ok(key)
    }
}

fn strip_token<'a>(s: &'a str, token: &str) -> Option<&'a str> {
    let head = s.get(..token.len())?;
    if head.eq_ignore_ascii_case(token) {
        s.get(token.len()..)
    } else {
        None
    }
}

/// The currently configured live root directories.
///
/// Resolution is a pure function of these two paths; nothing derived from
/// them is ever persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roots {
    /// Mod source tree, if configured.
    pub mod_root: Option<PathBuf>,
    /// Cache directory, if configured.
    pub cache_root: Option<PathBuf>,
}

impl Roots {
    /// Create a new set of roots.
    #[must_use]
    pub fn new(mod_root: Option<PathBuf>, cache_root: Option<PathBuf>) -> Self {
        Self {
            mod_root,
            cache_root,
        }
    }

    /// Whether both roots are configured.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.mod_root.is_some() && self.cache_root.is_some()
    }

    /// Directory currently bound to `tag`.
    #[must_use]
    pub fn root_for(&self, tag: RootTag) -> Option<&Path> {
        match tag {
            RootTag::ModRoot => self.mod_root.as_deref(),
            RootTag::CacheRoot => self.cache_root.as_deref(),
        }
    }

    /// Substitute the live root directory for the key's tag.
    ///
    /// Returns `None` when the tag's root is not configured.
    #[must_use]
    pub fn resolve(&self, key: &PrefixedPath) -> Option<PathBuf> {
        let mut path = self.root_for(key.tag)?.to_path_buf();
        for part in key.relative.split('/') {
            path.push(part);
        }
        Some(path)
    }

    /// Turn an absolute path into a root-tagged key.
    ///
    /// When one root is nested in the other, the more specific root wins.
    /// Paths outside both roots, or that escape a root through `..`, yield `None`.
    #[must_use]
    pub fn prefix(&self, absolute: &Path) -> Option<PrefixedPath> {
        let candidates = [
            (RootTag::ModRoot, self.mod_root.as_deref()),
            (RootTag::CacheRoot, self.cache_root.as_deref()),
        ];

        candidates
            .into_iter()
            .filter_map(|(tag, root)| {
                let root = root?;
                let relative = absolute.strip_prefix(root).ok()?;
                Some((tag, root.components().count(), relative))
            })
            .max_by_key(|(_, depth, _)| *depth)
            .and_then(|(tag, _, relative)| relative_key(tag, relative))
    }
}

fn relative_key(tag: RootTag, relative: &Path) -> Option<PrefixedPath> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_string_lossy();
                // A line break would split the persisted record.
                if part.contains(['\n', '\r']) {
                    return None;
                }
                parts.push(part.into_owned());
            }
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(PrefixedPath::new(tag, &parts.join("/")))
}
