//! Path confinement for every path-bearing command.

use std::io;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub(crate) enum SandboxError {
    #[error("access denied: {0} is outside the allowed directories")]
    AccessDenied(String),
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("cannot resolve {path}: {source}")]
    Io { path: String, source: io::Error },
}

#[derive(Debug, Clone)]
pub(crate) struct PathPolicy {
    home: PathBuf,
    roots: Vec<PathBuf>,
}

impl PathPolicy {
    /// Builds the policy from configured roots. Roots that do not exist are
    /// skipped; the rest are canonicalised so symlinked roots still match.
    pub(crate) async fn new(home: PathBuf, roots: &[String]) -> Self {
        let mut resolved = Vec::new();
        for raw in roots {
            let root = expand(&home, raw);
            match tokio::fs::canonicalize(&root).await {
                Ok(root) => {
                    if !resolved.contains(&root) {
                        resolved.push(root);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        event = "sandbox.root_skipped",
                        root = %root.display(),
                        error = %err,
                    );
                }
            }
        }
        Self {
            home,
            roots: resolved,
        }
    }

    pub(crate) fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolves `raw` to a canonical absolute path inside one of the roots.
    /// Only metadata is read; nothing is created or opened.
    pub(crate) async fn resolve(&self, raw: &str) -> Result<PathBuf, SandboxError> {
        if raw.trim().is_empty() {
            return Err(SandboxError::InvalidPath {
                path: raw.to_string(),
                reason: "empty path",
            });
        }
        let path = canonicalize_lenient(raw, &expand(&self.home, raw)).await?;
        if self.roots.iter().any(|root| path.starts_with(root)) {
            Ok(path)
        } else {
            Err(SandboxError::AccessDenied(raw.to_string()))
        }
    }
}

/// The agent user's home, which `~` and relative paths resolve against.
pub(crate) fn home_dir() -> anyhow::Result<PathBuf> {
    usable_home(dirs::home_dir())
}

/// A home of `/` is refused: it would put the whole filesystem under `~`.
fn usable_home(home: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let home = home.ok_or_else(|| anyhow::anyhow!("failed to resolve HOME dir"))?;
    if home.parent().is_none() {
        anyhow::bail!("HOME resolves to {}, refusing to confine paths to it", home.display());
    }
    Ok(home)
}

/// `~` and `~/x` go under `home`; other relative paths are taken relative to it.
fn expand(home: &Path, raw: &str) -> PathBuf {
    if raw == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        return home.join(rest);
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home.join(path)
    }
}

/// Canonicalises `path`, allowing a tail that does not exist yet. The deepest
/// existing ancestor is canonicalised and the missing components are appended;
/// `..` in the missing part is refused since it cannot be resolved safely, and
/// so is any link whose target is missing.
async fn canonicalize_lenient(raw: &str, path: &Path) -> Result<PathBuf, SandboxError> {
    let mut missing: Vec<Component<'_>> = Vec::new();
    let mut existing = path;
    loop {
        match tokio::fs::canonicalize(existing).await {
            Ok(mut resolved) => {
                for component in missing.into_iter().rev() {
                    match component {
                        Component::Normal(part) => resolved.push(part),
                        Component::CurDir => {}
                        _ => {
                            return Err(SandboxError::InvalidPath {
                                path: raw.to_string(),
                                reason: "parent components are not allowed in a new path",
                            })
                        }
                    }
                }
                return Ok(resolved);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                // The entry exists but does not resolve: a dangling link. Writing
                // through it would land wherever it points.
                if tokio::fs::symlink_metadata(existing).await.is_ok() {
                    return Err(SandboxError::InvalidPath {
                        path: raw.to_string(),
                        reason: "dangling symlink",
                    });
                }
                let (Some(parent), Some(last)) = (existing.parent(), existing.components().next_back())
                else {
                    return Err(SandboxError::Io {
                        path: raw.to_string(),
                        source: err,
                    });
                };
                missing.push(last);
                existing = parent;
            }
            Err(err) => {
                return Err(SandboxError::Io {
                    path: raw.to_string(),
                    source: err,
                })
            }
        }
    }
}
