//! Approval Store (§4.12): one JSON file per `ApprovalRequest.id` under the
//! session directory, atomic writes, pending-loaded-at-startup semantics.
//!
//! Grounded structurally on `taskgraph-diff`'s `PatchStore`: same
//! one-file-per-id layout under `runtime_dir`, same temp-file+fsync+rename
//! atomic write. The teacher's own `request_tool_approval`
//! (`deepseek-agent/src/tools_runtime/approvals.rs`) is purely interactive
//! (blocking stdin / a TUI callback) and keeps no record on disk at all, so
//! this crate's persistence layer has no direct teacher counterpart and is
//! built from the patch store's file-backed-record idiom instead, applied
//! to `taskgraph_core::ApprovalRequest`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use taskgraph_core::{runtime_dir, ApprovalRequest, ApprovalStatus, RiskLevel};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("approval request `{0}` not found")]
    NotFound(Uuid),
    #[error("approval request `{0}` is already decided")]
    AlreadyDecided(Uuid),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

pub struct ApprovalStore {
    root: PathBuf,
}

impl ApprovalStore {
    pub fn new(workspace: &Path) -> Result<Self, StoreError> {
        let root = runtime_dir(workspace).join("approvals");
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn create(
        &self,
        trace_id: Uuid,
        risk_level: RiskLevel,
        intent_name: &str,
        plan_summary: &str,
    ) -> Result<ApprovalRequest, StoreError> {
        let request = ApprovalRequest::new(trace_id, risk_level, intent_name, plan_summary);
        self.write(&request)?;
        Ok(request)
    }

    pub fn get(&self, id: Uuid) -> Result<ApprovalRequest, StoreError> {
        self.read(id)
    }

    /// Loaded on core startup (§4.12 "pending requests are loaded [...] the
    /// orchestrator consults them before transitioning out of
    /// `WAITING_FOR_APPROVAL`"), and usable any time to re-check status.
    pub fn list_pending(&self) -> Result<Vec<ApprovalRequest>, StoreError> {
        let mut pending: Vec<ApprovalRequest> = self
            .list_all()?
            .into_iter()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .collect();
        pending.sort_by_key(|r| r.requested_at);
        Ok(pending)
    }

    pub fn approve(&self, id: Uuid, decider: &str, comment: Option<String>) -> Result<ApprovalRequest, StoreError> {
        self.decide(id, ApprovalStatus::Approved, decider, comment)
    }

    pub fn reject(&self, id: Uuid, decider: &str, comment: Option<String>) -> Result<ApprovalRequest, StoreError> {
        self.decide(id, ApprovalStatus::Rejected, decider, comment)
    }

    fn decide(
        &self,
        id: Uuid,
        status: ApprovalStatus,
        decider: &str,
        comment: Option<String>,
    ) -> Result<ApprovalRequest, StoreError> {
        let mut request = self.read(id)?;
        if request.status != ApprovalStatus::Pending {
            return Err(StoreError::AlreadyDecided(id));
        }
        request.status = status;
        request.decided_at = Some(Utc::now());
        request.decided_by = Some(decider.to_string());
        request.comment = comment;
        self.write(&request)?;
        Ok(request)
    }

    fn list_all(&self) -> Result<Vec<ApprovalRequest>, StoreError> {
        let mut requests = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                requests.push(serde_json::from_str(&fs::read_to_string(path)?)?);
            }
        }
        Ok(requests)
    }

    fn write(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        let path = self.root.join(format!("{}.json", request.id));
        atomic_write(&path, &serde_json::to_vec_pretty(request)?)?;
        Ok(())
    }

    fn read(&self, id: Uuid) -> Result<ApprovalRequest, StoreError> {
        let path = self.root.join(format!("{id}.json"));
        if !path.exists() {
            return Err(StoreError::NotFound(id));
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

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ApprovalStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_then_get_round_trips() {
        let (_dir, store) = store();
        let request = store
            .create(Uuid::now_v7(), RiskLevel::High, "delete_file", "rm config.yaml")
            .unwrap();
        let fetched = store.get(request.id).unwrap();
        assert_eq!(fetched.status, ApprovalStatus::Pending);
        assert_eq!(fetched.intent_name, "delete_file");
    }

    #[test]
    fn get_missing_id_returns_not_found() {
        let (_dir, store) = store();
        let err = store.get(Uuid::now_v7()).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn list_pending_excludes_decided_requests() {
        let (_dir, store) = store();
        let pending = store
            .create(Uuid::now_v7(), RiskLevel::Medium, "write_file", "edit a.py")
            .unwrap();
        let decided = store
            .create(Uuid::now_v7(), RiskLevel::Critical, "run_cmd", "rm -rf build")
            .unwrap();
        store.approve(decided.id, "alice", None).unwrap();

        let listed = store.list_pending().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, pending.id);
    }

    #[test]
    fn approve_sets_decided_fields() {
        let (_dir, store) = store();
        let request = store
            .create(Uuid::now_v7(), RiskLevel::High, "run_cmd", "deploy")
            .unwrap();
        let approved = store.approve(request.id, "bob", Some("looks fine".to_string())).unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert_eq!(approved.decided_by.as_deref(), Some("bob"));
        assert!(approved.decided_at.is_some());
    }

    #[test]
    fn reject_then_reapprove_is_rejected_as_already_decided() {
        let (_dir, store) = store();
        let request = store
            .create(Uuid::now_v7(), RiskLevel::High, "run_cmd", "deploy")
            .unwrap();
        store.reject(request.id, "bob", None).unwrap();
        let err = store.approve(request.id, "bob", None).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyDecided(_)));
    }
}
