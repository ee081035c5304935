//! Git-worktree resolution for units of work.
//!
//! Every unit gets a deterministic branch (`drover/<slug>`) and a sibling
//! working copy (`<parent>/<root_name>-<slug>`), recorded as JSON under
//! the main root. Resolution is forgiving: a missing, malformed, or stale
//! record reads as "no worktree", and every operation is safe to repeat.

use crate::{GitRunner, WorkspaceError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Config entries copied from the main root into every worktree so agent
/// runs there see the same environment.
pub const CONFIG_ALLOWLIST: &[&str] = &[
    ".env",
    ".env.local",
    ".drover",
    "CLAUDE.md",
    "AGENTS.md",
    ".claude",
];

/// Plan-document locations, highest priority first.
pub const PLAN_LOCATIONS: &[&str] = &[".drover/plans", "docs/plans", "plans"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorktreeRecord {
    pub working_copy_path: PathBuf,
    pub branch_name: String,
    pub unit_id: String,
    pub unit_label: String,
    /// Unix millis.
    pub created_at: u64,
}

pub struct WorktreeResolver {
    git: Arc<dyn GitRunner>,
}

impl WorktreeResolver {
    pub fn new(git: Arc<dyn GitRunner>) -> Self {
        Self { git }
    }

    fn record_path(main_root: &Path, unit_id: &str) -> PathBuf {
        main_root
            .join(".drover")
            .join("worktrees")
            .join(format!("{unit_id}.json"))
    }

    /// Loads the persisted record for a unit. Missing or malformed
    /// records, and records whose working copy no longer exists on disk,
    /// read as `None`.
    pub async fn resolve(
        &self,
        main_root: &Path,
        unit_id: &str,
    ) -> Result<Option<WorktreeRecord>, WorkspaceError> {
        validate_unit_id(unit_id)?;
        let path = Self::record_path(main_root, unit_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        let record: WorktreeRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(error) => {
                warn!(unit = %unit_id, %error, "discarding malformed worktree record");
                return Ok(None);
            }
        };
        if !record.working_copy_path.is_dir() {
            warn!(
                unit = %unit_id,
                path = %record.working_copy_path.display(),
                "worktree record points at a missing directory",
            );
            return Ok(None);
        }
        Ok(Some(record))
    }

    /// Creates (or adopts) the worktree for a unit.
    ///
    /// When the target directory already exists the record is
    /// reconstructed without invoking git; otherwise the branch is reused
    /// if present and created with the worktree if not.
    pub async fn create(
        &self,
        main_root: &Path,
        unit_id: &str,
        unit_label: &str,
    ) -> Result<WorktreeRecord, WorkspaceError> {
        validate_unit_id(unit_id)?;
        let slug = slugify(unit_label);
        let branch = format!("drover/{slug}");
        let working_copy_path = sibling_path(main_root, &slug);

        if !working_copy_path.is_dir() {
            let branch_ref = format!("refs/heads/{branch}");
            let branch_exists = self
                .git
                .run(main_root, &["rev-parse", "--verify", "--quiet", &branch_ref])
                .await
                .is_ok();

            let path_arg = working_copy_path.display().to_string();
            if branch_exists {
                self.git
                    .run(main_root, &["worktree", "add", &path_arg, &branch])
                    .await?;
            } else {
                self.git
                    .run(main_root, &["worktree", "add", "-b", &branch, &path_arg])
                    .await?;
            }
            info!(unit = %unit_id, branch = %branch, path = %path_arg, "worktree created");
        } else {
            debug!(unit = %unit_id, path = %working_copy_path.display(), "adopting existing worktree");
        }

        let record = WorktreeRecord {
            working_copy_path,
            branch_name: branch,
            unit_id: unit_id.to_string(),
            unit_label: unit_label.to_string(),
            created_at: unix_millis(),
        };
        self.persist(main_root, &record).await?;
        Ok(record)
    }

    pub async fn resolve_or_create(
        &self,
        main_root: &Path,
        unit_id: &str,
        unit_label: &str,
    ) -> Result<WorktreeRecord, WorkspaceError> {
        if let Some(record) = self.resolve(main_root, unit_id).await? {
            return Ok(record);
        }
        self.create(main_root, unit_id, unit_label).await
    }

    /// Copies the allow-listed config entries from the main root into the
    /// worktree, overwriting. Returns how many top-level entries were
    /// copied. Safe to repeat.
    pub async fn sync_config(
        &self,
        main_root: &Path,
        worktree: &Path,
    ) -> Result<usize, WorkspaceError> {
        let mut copied = 0;
        for name in CONFIG_ALLOWLIST {
            let source = main_root.join(name);
            if !source.exists() {
                continue;
            }
            copy_recursive(&source, &worktree.join(name))?;
            copied += 1;
        }
        debug!(worktree = %worktree.display(), copied, "config synced");
        Ok(copied)
    }

    /// Copies the unit's plan document into the worktree, preserving its
    /// relative location. Locations are tried in priority order; within
    /// the first location with a match, the most recently modified plan
    /// wins. Matching is by file stem containing the unit id.
    pub async fn seed_plan_document(
        &self,
        main_root: &Path,
        worktree: &Path,
        unit_id: &str,
    ) -> Result<Option<PathBuf>, WorkspaceError> {
        for location in PLAN_LOCATIONS {
            let dir = main_root.join(location);
            let Some(source) = newest_matching_plan(&dir, unit_id)? else {
                continue;
            };
            let file_name = source
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_default();
            let dest_dir = worktree.join(location);
            std::fs::create_dir_all(&dest_dir)?;
            let dest = dest_dir.join(file_name);
            std::fs::copy(&source, &dest)?;
            info!(unit = %unit_id, plan = %source.display(), "plan document seeded");
            return Ok(Some(dest));
        }
        Ok(None)
    }

    /// All known worktrees for the main root: persisted records first,
    /// then unrecorded worktrees reported by git, excluding the main root
    /// itself. Records whose working copy is gone are treated as absent,
    /// same as `resolve`.
    pub async fn list(&self, main_root: &Path) -> Result<Vec<WorktreeRecord>, WorkspaceError> {
        let mut records = Vec::new();
        let records_dir = main_root.join(".drover").join("worktrees");
        if records_dir.is_dir() {
            for entry in std::fs::read_dir(&records_dir)? {
                let path = entry?.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                let raw = std::fs::read_to_string(&path)?;
                match serde_json::from_str::<WorktreeRecord>(&raw) {
                    Ok(record) if record.working_copy_path.is_dir() => records.push(record),
                    Ok(record) => {
                        warn!(
                            record = %path.display(),
                            path = %record.working_copy_path.display(),
                            "skipping worktree record with a missing directory",
                        );
                    }
                    Err(error) => {
                        warn!(record = %path.display(), %error, "skipping malformed worktree record")
                    }
                }
            }
        }

        let porcelain = self
            .git
            .run(main_root, &["worktree", "list", "--porcelain"])
            .await?;
        for (path, branch) in parse_worktree_porcelain(&porcelain) {
            if path == main_root {
                continue;
            }
            if records
                .iter()
                .any(|record| record.working_copy_path == path)
            {
                continue;
            }
            records.push(WorktreeRecord {
                unit_id: String::new(),
                unit_label: path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                working_copy_path: path,
                branch_name: branch,
                created_at: 0,
            });
        }
        Ok(records)
    }

    async fn persist(
        &self,
        main_root: &Path,
        record: &WorktreeRecord,
    ) -> Result<(), WorkspaceError> {
        let path = Self::record_path(main_root, &record.unit_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&path, raw).await?;
        Ok(())
    }
}

fn validate_unit_id(unit_id: &str) -> Result<(), WorkspaceError> {
    if unit_id.is_empty() || unit_id.contains(['/', '\\', '.']) {
        return Err(WorkspaceError::InvalidUnit(unit_id.to_string()));
    }
    Ok(())
}

/// Lowercased, alphanumerics kept, everything else collapsed to single
/// hyphens, capped at 40 chars.
fn slugify(label: &str) -> String {
    let mut slug = String::new();
    let mut pending_hyphen = false;
    for ch in label.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
        if slug.len() >= 40 {
            break;
        }
    }
    if slug.is_empty() {
        slug.push_str("unit");
    }
    slug
}

fn sibling_path(main_root: &Path, slug: &str) -> PathBuf {
    let root_name = main_root
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string());
    let parent = main_root.parent().unwrap_or(main_root);
    parent.join(format!("{root_name}-{slug}"))
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

fn copy_recursive(source: &Path, dest: &Path) -> std::io::Result<()> {
    if source.is_dir() {
        std::fs::create_dir_all(dest)?;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &dest.join(entry.file_name()))?;
        }
    } else {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(source, dest)?;
    }
    Ok(())
}

fn newest_matching_plan(dir: &Path, unit_id: &str) -> Result<Option<PathBuf>, WorkspaceError> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let needle = unit_id.to_ascii_lowercase();
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_ascii_lowercase().contains(&needle))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if newest
            .as_ref()
            .is_none_or(|(best, _)| modified > *best)
        {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

fn parse_worktree_porcelain(output: &str) -> Vec<(PathBuf, String)> {
    let mut worktrees = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_branch = String::new();
    for line in output.lines().chain(std::iter::once("")) {
        if let Some(path) = line.strip_prefix("worktree ") {
            current_path = Some(PathBuf::from(path));
            current_branch.clear();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            current_branch = branch
                .strip_prefix("refs/heads/")
                .unwrap_or(branch)
                .to_string();
        } else if line.is_empty() {
            if let Some(path) = current_path.take() {
                worktrees.push((path, std::mem::take(&mut current_branch)));
            }
        }
    }
    worktrees
}
