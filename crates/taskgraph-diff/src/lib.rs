//! Patch Engine (§4.9): context-anchored hunk matching, atomic write, and
//! hash-gated undo.
//!
//! Grounded structurally on the teacher's `PatchStore`
//! (`deepseek-diff/src/lib.rs`): patch bookkeeping lives in one JSON file per
//! patch id under the workspace's runtime dir, hashing uses `sha2`, ids are
//! `uuid` v7. The apply algorithm itself is a deliberate redesign: the
//! teacher shells out to `git apply --3way`; §4.9 instead specifies
//! context-anchored hunks ("locate the unique match of the before-context...
//! zero matches -> E_CONFLICT; multiple -> E_AMBIGUOUS") applied in-process,
//! with an atomic temp-file+fsync+rename write and a `(old_hash, new_hash,
//! hunks)` undo record — so this crate keeps the teacher's bookkeeping shape
//! and drops its subprocess dependency on `git`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use taskgraph_core::runtime_dir;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    #[error("no unique match for hunk context in `{path}`")]
    Conflict { path: String },
    #[error("hunk context matches {count} locations in `{path}`, expected exactly one")]
    Ambiguous { path: String, count: usize },
    #[error("patch `{0}` not found")]
    NotFound(Uuid),
    #[error("current file hash does not match the recorded post-apply hash; refusing undo")]
    HashMismatch,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// One context-anchored edit: replace the unique occurrence of `before`
/// with `after` (§4.9 "context-anchored before/after text, not line
/// numbers").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hunk {
    pub before: String,
    pub after: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSet {
    pub patch_id: Uuid,
    pub plan_id: Uuid,
    pub target_path: String,
    pub hunks: Vec<Hunk>,
    pub created_at: DateTime<Utc>,
    pub applied: bool,
    pub conflicts: Vec<String>,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    /// Number of times `apply` has been attempted against this patch,
    /// incremented on every call including the first.
    #[serde(default)]
    pub apply_attempts: u32,
    /// Hash of the target file's contents as last observed by `apply`,
    /// recorded even on a failed attempt so a caller can tell whether the
    /// file moved between attempts without re-reading it.
    #[serde(default)]
    pub last_base_sha256: Option<String>,
    /// Whether `last_base_sha256` matched the hash recorded the previous
    /// time this patch was staged or applied.
    #[serde(default)]
    pub last_base_sha_match: Option<bool>,
    #[serde(default)]
    pub last_error: Option<String>,
}

pub struct PatchStore {
    root: PathBuf,
}

impl PatchStore {
    pub fn new(workspace: &Path) -> anyhow::Result<Self> {
        let root = runtime_dir(workspace).join("patches");
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Stages a patch without applying it. Staging never touches the target
    /// file; it just records intent so `apply` has something to act on.
    pub fn stage(&self, plan_id: Uuid, target_path: &str, hunks: Vec<Hunk>) -> Result<PatchSet, PatchError> {
        let patch = PatchSet {
            patch_id: Uuid::now_v7(),
            plan_id,
            target_path: target_path.to_string(),
            hunks,
            created_at: Utc::now(),
            applied: false,
            conflicts: Vec::new(),
            old_hash: None,
            new_hash: None,
            apply_attempts: 0,
            last_base_sha256: None,
            last_base_sha_match: None,
            last_error: None,
        };
        self.write_patch(&patch)?;
        Ok(patch)
    }

    /// Applies every hunk of `patch_id` to `workspace_root`-relative
    /// `target_path`, in order, against an in-memory buffer, then performs a
    /// single atomic write (§4.9 "write to sibling temp file, fsync, rename
    /// over original").
    pub fn apply(&self, workspace_root: &Path, patch_id: Uuid) -> Result<PatchSet, PatchError> {
        let mut patch = self.read_patch(patch_id)?;
        let target = workspace_root.join(&patch.target_path);
        let original = fs::read_to_string(&target)?;
        let old_hash = sha256_hex(original.as_bytes());

        patch.apply_attempts += 1;
        patch.last_base_sha_match = patch
            .last_base_sha256
            .as_deref()
            .map(|prior| prior == old_hash);
        patch.last_base_sha256 = Some(old_hash.clone());

        let mut buffer = original.clone();
        for hunk in &patch.hunks {
            let occurrences = buffer.matches(hunk.before.as_str()).count();
            if occurrences == 0 {
                let message = format!("context not found: {:?}", truncate(&hunk.before, 80));
                patch.conflicts = vec![message.clone()];
                patch.applied = false;
                patch.last_error = Some(message);
                self.write_patch(&patch)?;
                return Err(PatchError::Conflict {
                    path: patch.target_path.clone(),
                });
            }
            if occurrences > 1 {
                let message = format!(
                    "ambiguous context ({occurrences} matches): {:?}",
                    truncate(&hunk.before, 80)
                );
                patch.conflicts = vec![message.clone()];
                patch.applied = false;
                patch.last_error = Some(message);
                self.write_patch(&patch)?;
                return Err(PatchError::Ambiguous {
                    path: patch.target_path.clone(),
                    count: occurrences,
                });
            }
            buffer = buffer.replacen(hunk.before.as_str(), hunk.after.as_str(), 1);
        }

        atomic_write(&target, buffer.as_bytes())?;
        let new_hash = sha256_hex(buffer.as_bytes());

        patch.applied = true;
        patch.conflicts.clear();
        patch.old_hash = Some(old_hash);
        patch.new_hash = Some(new_hash);
        patch.last_error = None;
        self.write_patch(&patch)?;
        Ok(patch)
    }

    /// Reverses a previously applied patch, gated on the target file's
    /// current hash matching the recorded post-apply hash (§4.9 "undo_patch
    /// restores by reverse application gated on new_hash match").
    pub fn undo(&self, workspace_root: &Path, patch_id: Uuid) -> Result<PatchSet, PatchError> {
        let mut patch = self.read_patch(patch_id)?;
        let (Some(old_hash), Some(new_hash)) = (patch.old_hash.clone(), patch.new_hash.clone()) else {
            return Err(PatchError::HashMismatch);
        };

        let target = workspace_root.join(&patch.target_path);
        let current = fs::read_to_string(&target)?;
        if sha256_hex(current.as_bytes()) != new_hash {
            return Err(PatchError::HashMismatch);
        }

        let mut buffer = current;
        for hunk in patch.hunks.iter().rev() {
            buffer = buffer.replacen(hunk.after.as_str(), hunk.before.as_str(), 1);
        }

        atomic_write(&target, buffer.as_bytes())?;
        let restored_hash = sha256_hex(buffer.as_bytes());
        if restored_hash != old_hash {
            return Err(PatchError::HashMismatch);
        }

        patch.applied = false;
        self.write_patch(&patch)?;
        Ok(patch)
    }

    pub fn list(&self) -> Result<Vec<PatchSet>, PatchError> {
        let mut patches = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                patches.push(serde_json::from_str(&fs::read_to_string(path)?)?);
            }
        }
        patches.sort_by_key(|p: &PatchSet| p.created_at);
        Ok(patches)
    }

    fn write_patch(&self, patch: &PatchSet) -> Result<(), PatchError> {
        let path = self.root.join(format!("{}.json", patch.patch_id));
        atomic_write(&path, &serde_json::to_vec_pretty(patch)?)?;
        Ok(())
    }

    fn read_patch(&self, patch_id: Uuid) -> Result<PatchSet, PatchError> {
        let path = self.root.join(format!("{patch_id}.json"));
        if !path.exists() {
            return Err(PatchError::NotFound(patch_id));
        }
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}
