//! File perturbation: pick sample files in a fixture and touch their content
//! so the watched tool sees a change.

use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::Rng;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Bytes appended by `ChangeMode::AppendMarker`. Whitespace only, so the
/// following strip removes it again.
pub const APPEND_MARKER: &[u8] = b"\n";

/// Which files in a fixture are eligible for perturbation.
#[derive(Debug, Clone)]
pub struct SelectOptions {
    /// File extension without the leading dot (`ts`).
    pub extension: String,
    /// Directory names never descended into (`node_modules`).
    pub exclude_dirs: Vec<String>,
    /// Glob patterns matched against paths relative to the root.
    pub exclude: Vec<glob::Pattern>,
}

impl SelectOptions {
    pub fn new(extension: &str, exclude_dirs: &[String], exclude: &[String]) -> Self {
        let exclude = exclude
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "ignoring bad exclude pattern");
                    None
                }
            })
            .collect();
        Self {
            extension: extension.trim_start_matches('.').to_string(),
            exclude_dirs: exclude_dirs.to_vec(),
            exclude,
        }
    }

    fn is_excluded_dir(&self, name: &str) -> bool {
        self.exclude_dirs.iter().any(|d| d == name)
    }

    fn is_candidate(&self, root: &Path, path: &Path) -> bool {
        if path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
            return false;
        }
        let relative = path.strip_prefix(root).unwrap_or(path);
        !self.exclude.iter().any(|p| p.matches_path(relative))
    }
}

/// Collect every eligible file under `root`, shuffle, and keep `count` of them.
///
/// Returns fewer than `count` when the fixture is small and an empty list when
/// the root is missing. Walk errors are logged and skipped.
pub fn select_sample_files<R: Rng + ?Sized>(
    root: &Path,
    options: &SelectOptions,
    count: usize,
    rng: &mut R,
) -> Vec<PathBuf> {
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !options.is_excluded_dir(&entry.file_name().to_string_lossy())
        });

    let mut candidates = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(root = %root.display(), error = %e, "failed to walk fixture");
                continue;
            }
        };
        if entry.file_type().is_file() && options.is_candidate(root, entry.path()) {
            candidates.push(entry.into_path());
        }
    }

    tracing::debug!(
        root = %root.display(),
        candidates = candidates.len(),
        requested = count,
        "selected sample files"
    );

    candidates.shuffle(rng);
    candidates.truncate(count);
    candidates
}

/// How a perturbation rewrites a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMode {
    AppendMarker,
    StripTrailing,
}

impl ChangeMode {
    /// Rounds alternate append/strip so every pair leaves the file as it was.
    pub fn for_round(round: u32) -> Self {
        if round % 2 == 0 {
            ChangeMode::AppendMarker
        } else {
            ChangeMode::StripTrailing
        }
    }

    pub fn apply(self, content: &[u8]) -> Vec<u8> {
        match self {
            ChangeMode::AppendMarker => {
                let mut out = Vec::with_capacity(content.len() + APPEND_MARKER.len());
                out.extend_from_slice(content);
                out.extend_from_slice(APPEND_MARKER);
                out
            }
            ChangeMode::StripTrailing => {
                let end = content
                    .iter()
                    .rposition(|b| !b.is_ascii_whitespace())
                    .map_or(0, |i| i + 1);
                content[..end].to_vec()
            }
        }
    }
}

impl std::fmt::Display for ChangeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeMode::AppendMarker => write!(f, "append"),
            ChangeMode::StripTrailing => write!(f, "strip"),
        }
    }
}

/// Errors from reading or rewriting a sample file.
#[derive(Debug)]
pub enum PerturbError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PerturbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PerturbError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            PerturbError::Write { path, source } => {
                write!(f, "failed to write {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for PerturbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PerturbError::Read { source, .. } => Some(source),
            PerturbError::Write { source, .. } => Some(source),
        }
    }
}

/// Rewrite every file with `mode`, all at once; returns when all are written.
///
/// Every file is attempted even if another one fails; the first failure is
/// returned. Returns the number of files whose content actually changed.
pub async fn apply_change(files: &[PathBuf], mode: ChangeMode) -> Result<usize, PerturbError> {
    let results = join_all(files.iter().map(|path| rewrite(path, mode))).await;

    let mut changed = 0;
    let mut first_error = None;
    for result in results {
        match result {
            Ok(true) => changed += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(error = %e, %mode, "perturbation failed");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            tracing::debug!(files = files.len(), changed, %mode, "applied perturbation");
            Ok(changed)
        }
    }
}

/// Original bytes of the sample files, taken before the first round.
///
/// Append/strip pairs only restore files without trailing whitespace, so the
/// snapshot is what puts a fixture back the way it was found.
#[derive(Debug)]
pub struct Snapshot {
    files: Vec<(PathBuf, Vec<u8>)>,
}

impl Snapshot {
    pub async fn take(files: &[PathBuf]) -> Result<Self, PerturbError> {
        let reads = join_all(files.iter().map(|path| async move {
            tokio::fs::read(path)
                .await
                .map(|content| (path.clone(), content))
                .map_err(|e| PerturbError::Read {
                    path: path.clone(),
                    source: e,
                })
        }))
        .await;
        let files = reads.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(Self { files })
    }

    /// Write back every file whose content moved. Returns how many were rewritten.
    pub async fn restore(&self) -> Result<usize, PerturbError> {
        let results = join_all(
            self.files
                .iter()
                .map(|(path, original)| restore_one(path, original)),
        )
        .await;

        let mut restored = 0;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(restored),
        }
    }
}

async fn restore_one(path: &Path, original: &[u8]) -> Result<bool, PerturbError> {
    // A missing file is rewritten too.
    if let Ok(current) = tokio::fs::read(path).await {
        if current == original {
            return Ok(false);
        }
    }
    tokio::fs::write(path, original)
        .await
        .map_err(|e| PerturbError::Write {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(true)
}

async fn rewrite(path: &Path, mode: ChangeMode) -> Result<bool, PerturbError> {
    let content = tokio::fs::read(path).await.map_err(|e| PerturbError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;
    let updated = mode.apply(&content);
    if updated == content {
        return Ok(false);
    }
    tokio::fs::write(path, updated)
        .await
        .map_err(|e| PerturbError::Write {
            path: path.to_path_buf(),
            source: e,
        })?;
    Ok(true)
}
