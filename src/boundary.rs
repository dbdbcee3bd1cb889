//! Safe-root boundary resolution.
//!
//! [`SafeRootBoundary::resolve`] is the only place a user-supplied path is
//! turned into a filesystem path. It canonicalizes the target once (plus its
//! ancestors when the target is missing) and never creates anything: the
//! caller decides what to do with a rejection.
//!
//! ## Checks, in order
//!
//! 1. Lexical: empty input, NUL bytes, control characters, absolute paths
//!    (unless under an allowed prefix), `..` segments, doubled separators.
//! 2. Canonicalization of `root.join(candidate)`, following symlinks.
//! 3. Containment: the canonical target must be the root (or an allowed
//!    prefix) or a descendant of it. A symlink pointing elsewhere is an
//!    escape, not a missing file.
//! 4. For a missing target, the nearest existing ancestor must pass the same
//!    containment check. `link/new.txt` under an outbound `link` is an
//!    escape, so it never reaches recovery.

use std::{
    fmt, fs, io,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Why the resolver refused a candidate. Closed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    /// Empty or whitespace-only input.
    Empty,
    /// Input contains a NUL byte.
    NullByte,
    /// Input contains another ASCII control character (newline, tab, ...).
    ControlCharacter,
    /// Absolute path outside every allowed prefix.
    AbsolutePath,
    /// A `..` segment.
    ParentTraversal,
    /// Repeated separators (`a//b`), treated as obfuscation.
    DuplicateSeparator,
    /// The canonical target lies outside the boundary (symlink escape).
    SymlinkEscape,
    /// The target does not exist.
    NotFound,
    /// Any other filesystem error during canonicalization.
    Unresolvable(String),
}

impl RejectReason {
    /// Security rejections are boundary violations and are never healed.
    pub fn is_security(&self) -> bool {
        matches!(
            self,
            Self::AbsolutePath
                | Self::ParentTraversal
                | Self::DuplicateSeparator
                | Self::SymlinkEscape
                | Self::NullByte
                | Self::ControlCharacter
        )
    }

    /// Only a missing target is eligible for recovery.
    pub fn is_missing_structure(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty path"),
            Self::NullByte => write!(f, "path contains a NUL byte"),
            Self::ControlCharacter => write!(f, "path contains control characters"),
            Self::AbsolutePath => write!(f, "absolute path not permitted"),
            Self::ParentTraversal => write!(f, "parent-directory segment not permitted"),
            Self::DuplicateSeparator => write!(f, "duplicated path separator"),
            Self::SymlinkEscape => write!(f, "path resolves outside the safe root"),
            Self::NotFound => write!(f, "path does not exist"),
            Self::Unresolvable(detail) => write!(f, "path cannot be resolved: {detail}"),
        }
    }
}

/// Result of a single resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Resolved(PathBuf),
    Rejected(RejectReason),
}

impl ValidationOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved(_))
    }
}

/// The directory boundary no resolved path may leave.
///
/// Built once; the root and every allowed prefix are canonicalized at
/// construction so later comparisons are purely component-wise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeRootBoundary {
    root: PathBuf,
    allowed_prefixes: Vec<PathBuf>,
}

impl SafeRootBoundary {
    /// Canonicalizes `root` and each of `allowed_prefixes`. All must exist.
    pub fn new(root: &Path, allowed_prefixes: &[PathBuf]) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("resolve safe root {}", root.display()))?;
        let mut prefixes = Vec::with_capacity(allowed_prefixes.len());
        for p in allowed_prefixes {
            let canonical = p
                .canonicalize()
                .with_context(|| format!("resolve allowed prefix {}", p.display()))?;
            prefixes.push(canonical);
        }
        prefixes.sort();
        prefixes.dedup();
        Ok(Self {
            root,
            allowed_prefixes: prefixes,
        })
    }

    /// Canonical safe root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn allowed_prefixes(&self) -> &[PathBuf] {
        &self.allowed_prefixes
    }

    /// True if `canonical` is the root, an allowed prefix, or inside one.
    pub fn contains(&self, canonical: &Path) -> bool {
        canonical.starts_with(&self.root)
            || self
                .allowed_prefixes
                .iter()
                .any(|p| canonical.starts_with(p))
    }

    /// Resolves `candidate` against the boundary. See the module docs.
    pub fn resolve(&self, candidate: &str) -> ValidationOutcome {
        let relative = match lexical_check(candidate) {
            Ok(r) => r,
            Err(reason) => return ValidationOutcome::Rejected(reason),
        };

        let (base, joined) = if Path::new(candidate).is_absolute() {
            let abs = PathBuf::from(candidate);
            match self
                .allowed_prefixes
                .iter()
                .find(|p| abs.starts_with(p))
            {
                Some(prefix) => (prefix.as_path(), abs),
                None => return ValidationOutcome::Rejected(RejectReason::AbsolutePath),
            }
        } else {
            (self.root.as_path(), self.root.join(relative))
        };

        let canonical = match fs::canonicalize(&joined) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return ValidationOutcome::Rejected(missing_or_escape(base, &joined))
            }
            Err(e) => {
                return ValidationOutcome::Rejected(RejectReason::Unresolvable(
                    e.kind().to_string(),
                ))
            }
        };

        // Component-wise containment; "/safe2" is not inside "/safe".
        match canonical.strip_prefix(base) {
            Ok(rel) if !escapes(rel) => ValidationOutcome::Resolved(canonical),
            _ => ValidationOutcome::Rejected(RejectReason::SymlinkEscape),
        }
    }

    /// Lexically normalized form of a root-relative candidate, used to key
    /// recovery actions. `None` for anything the resolver would reject
    /// lexically, and for absolute candidates.
    pub fn normalize(&self, candidate: &str) -> Option<PathBuf> {
        if Path::new(candidate).is_absolute() {
            return None;
        }
        lexical_check(candidate).ok()
    }
}

/// Classifies a missing `joined` by its nearest existing ancestor under
/// `base`. Dangling links are skipped like missing entries.
fn missing_or_escape(base: &Path, joined: &Path) -> RejectReason {
    for ancestor in joined
        .ancestors()
        .skip(1)
        .take_while(|a| a.starts_with(base))
    {
        match fs::canonicalize(ancestor) {
            Ok(c) => {
                return match c.strip_prefix(base) {
                    Ok(rel) if !escapes(rel) => RejectReason::NotFound,
                    _ => RejectReason::SymlinkEscape,
                };
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return RejectReason::Unresolvable(e.kind().to_string()),
        }
    }
    RejectReason::NotFound
}

fn escapes(rel: &Path) -> bool {
    rel.is_absolute()
        || rel
            .components()
            .next()
            .is_some_and(|c| matches!(c, Component::ParentDir))
}

/// Lexical screening. Returns the candidate with `.` segments and trailing
/// separators removed.
fn lexical_check(candidate: &str) -> Result<PathBuf, RejectReason> {
    if candidate.trim().is_empty() {
        return Err(RejectReason::Empty);
    }
    if candidate.contains('\0') {
        return Err(RejectReason::NullByte);
    }
    if candidate.chars().any(char::is_control) {
        return Err(RejectReason::ControlCharacter);
    }

    // Both separators count: a backslash segment must not smuggle "..".
    let trimmed = candidate.trim_end_matches(['/', '\\']);
    let body = trimmed.strip_prefix('/').unwrap_or(trimmed);
    let mut out = PathBuf::new();
    if body.is_empty() {
        return Ok(out);
    }
    for segment in body.split(['/', '\\']) {
        match segment {
            ".." => return Err(RejectReason::ParentTraversal),
            "" => return Err(RejectReason::DuplicateSeparator),
            "." => {}
            s => out.push(s),
        }
    }
    Ok(out)
}
