//! Path sandboxing for agent file access.
//!
//! Every agent-supplied path is expanded, resolved against the session
//! working directory, and pushed through three gates before any filesystem
//! access happens: containment in the sandbox root, a blocklist of
//! credential locations, and a symlink scan over the resolved chain.
//! The blocklist runs on the *resolved* path, so `../` tricks cannot
//! sidestep it.

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Unicode space characters normalized to ASCII space before resolution.
/// A homoglyph space inside `.ssh` would otherwise slip past the blocklist.
const UNICODE_SPACES: &[char] = &[
    '\u{00A0}', '\u{2000}', '\u{2001}', '\u{2002}', '\u{2003}', '\u{2004}',
    '\u{2005}', '\u{2006}', '\u{2007}', '\u{2008}', '\u{2009}', '\u{200A}',
    '\u{202F}', '\u{205F}', '\u{3000}',
];

/// Lowercased fragments identifying credential and secret locations.
/// Matched as substrings of the lowercased resolved path.
const SENSITIVE_PATTERNS: &[&str] = &[
    "/.ssh/",
    "/.aws/",
    "/.config/gcloud/",
    "/.azure/",
    "/.kube/",
    "/.gnupg/",
    "/.password-store/",
    ".bash_history",
    ".zsh_history",
    "/.env",
    "/.npmrc",
    "/.git-credentials",
    "/.docker/config.json",
    "/.clawdbot/",
];

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SandboxError {
    #[error("path escapes the sandbox root")]
    PathEscapesSandbox,
    #[error("path matches a protected credential location")]
    SensitivePath,
    #[error("symbolic links are not allowed inside the sandbox")]
    SymlinkForbidden,
}

/// A successfully sandboxed path.
///
/// Invariant: `root.join(&relative) == resolved`, `relative` is never
/// absolute and never starts with `..`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub resolved: PathBuf,
    pub relative: PathBuf,
}

/// Resolves agent paths against a fixed sandbox root.
#[derive(Debug, Clone)]
pub struct PathSandbox {
    root: PathBuf,
    home: PathBuf,
}

impl PathSandbox {
    pub fn new(root: impl Into<PathBuf>, home: impl Into<PathBuf>) -> Self {
        Self {
            root: normalize_lexically(&root.into()),
            home: home.into(),
        }
    }

    /// Root taken as given, home from `$HOME`.
    pub fn from_env(root: impl Into<PathBuf>) -> Self {
        let home = std::env::var_os("HOME").map_or_else(|| PathBuf::from("/"), PathBuf::from);
        Self::new(root, home)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `file_path` against `cwd` and run all three gates.
    ///
    /// Non-existent leaves are fine (writes must be possible); the symlink
    /// scan stops silently at the first missing component.
    pub fn resolve(&self, file_path: &str, cwd: &Path) -> Result<ResolvedPath, SandboxError> {
        let expanded = expand_user_path(file_path, &self.home);
        let absolute = if expanded.is_absolute() {
            expanded
        } else {
            cwd.join(expanded)
        };
        let resolved = normalize_lexically(&absolute);

        let relative = resolved
            .strip_prefix(&self.root)
            .map_err(|_| SandboxError::PathEscapesSandbox)?
            .to_path_buf();

        if is_sensitive_path(&resolved) {
            return Err(SandboxError::SensitivePath);
        }

        // Walk each component below the root. Components above the root are
        // the operator's problem, not the agent's.
        let mut probe = self.root.clone();
        for comp in relative.components() {
            probe.push(comp);
            match std::fs::symlink_metadata(&probe) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(SandboxError::SymlinkForbidden)
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(_) => break,
            }
        }

        Ok(ResolvedPath { resolved, relative })
    }
}

/// Expand `~`/`~/...` and normalize Unicode spaces to ASCII.
pub(crate) fn expand_user_path(file_path: &str, home: &Path) -> PathBuf {
    let cleaned: String = file_path
        .chars()
        .map(|c| if UNICODE_SPACES.contains(&c) { ' ' } else { c })
        .collect();

    if cleaned == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = cleaned.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(cleaned)
}

/// Fold `.` and `..` components without touching the filesystem, so paths
/// with non-existent leaves still resolve.
pub(crate) fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` above the filesystem root stays at the root.
                if !matches!(out.components().next_back(), None | Some(Component::RootDir)) {
                    out.pop();
                } else if out.as_os_str().is_empty() {
                    out.push(comp);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn is_sensitive_path(resolved: &Path) -> bool {
    let lower = resolved.to_string_lossy().to_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}
