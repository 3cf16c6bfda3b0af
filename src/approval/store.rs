use crate::errors::{CodedError, ErrorCode};
use crate::utils::atomic_write;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
        }
    }
}

/// A time-bounded gate for executing an operation flagged as dangerous.
/// Status moves monotonically from `pending` to exactly one of the other
/// three states; every status change is mirrored to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub invocation_id: String,
    pub tool_id: String,
    pub session_id: String,
    pub input: Value,
    pub status: ApprovalStatus,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(
        invocation_id: impl Into<String>,
        tool_id: impl Into<String>,
        session_id: impl Into<String>,
        input: Value,
        requested_by: impl Into<String>,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            // 128-bit random token; never derived from the invocation.
            id: format!("approval-{}", Uuid::new_v4()),
            invocation_id: invocation_id.into(),
            tool_id: tool_id.into(),
            session_id: session_id.into(),
            input,
            status: ApprovalStatus::Pending,
            requested_by: requested_by.into(),
            created_at: now,
            expires_at: now + ttl,
            responded_by: None,
            responded_at: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedRequests {
    requests: Vec<ApprovalRequest>,
}

/// Disk-mirrored approval request store. Every mutation rewrites the backing
/// file atomically (write-to-temp, rename), so a crash loses at most the
/// in-flight change.
pub struct ApprovalStore {
    path: PathBuf,
    requests: HashMap<String, ApprovalRequest>,
}

impl ApprovalStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut requests = HashMap::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let data: PersistedRequests = serde_json::from_str(&content).unwrap_or_default();
            for req in data.requests {
                requests.insert(req.id.clone(), req);
            }
        }
        Ok(Self { path, requests })
    }

    fn persist(&self) -> Result<()> {
        let mut requests: Vec<&ApprovalRequest> = self.requests.values().collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let data = serde_json::json!({ "requests": requests });
        atomic_write(&self.path, &serde_json::to_string_pretty(&data)?)
    }

    pub fn add(&mut self, request: ApprovalRequest) -> Result<()> {
        self.requests.insert(request.id.clone(), request);
        self.persist()
    }

    pub fn get(&self, id: &str) -> Option<&ApprovalRequest> {
        self.requests.get(id)
    }

    pub fn find_by_invocation(&self, invocation_id: &str) -> Option<&ApprovalRequest> {
        self.requests
            .values()
            .find(|r| r.invocation_id == invocation_id)
    }

    pub fn remove(&mut self, id: &str) -> Result<Option<ApprovalRequest>> {
        let removed = self.requests.remove(id);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Resolve a request. The first transition out of `pending` wins; any
    /// later attempt fails with `ALREADY_RESOLVED`.
    pub fn update_status(
        &mut self,
        id: &str,
        status: ApprovalStatus,
        responded_by: Option<&str>,
    ) -> std::result::Result<ApprovalRequest, CodedError> {
        let request = self
            .requests
            .get_mut(id)
            .ok_or_else(|| CodedError::new(ErrorCode::NotFound, "approval request not found"))?;
        if request.status != ApprovalStatus::Pending {
            return Err(CodedError::new(
                ErrorCode::AlreadyResolved,
                format!("approval request already {}", request.status.as_str()),
            ));
        }
        request.status = status;
        request.responded_by = responded_by.map(str::to_string);
        request.responded_at = Some(Utc::now());
        let snapshot = request.clone();
        self.persist()
            .map_err(|e| CodedError::internal_error(format!("persist failed: {}", e)))?;
        Ok(snapshot)
    }

    /// Pending requests only, sorted by creation time.
    pub fn list_pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self
            .requests
            .values()
            .filter(|r| r.status == ApprovalStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// Flip every overdue pending request to `expired`. Returns the ids that
    /// changed.
    pub fn expire_pending(&mut self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut expired = Vec::new();
        for request in self.requests.values_mut() {
            if request.status == ApprovalStatus::Pending && request.expires_at <= now {
                request.status = ApprovalStatus::Expired;
                request.responded_at = Some(now);
                expired.push(request.id.clone());
            }
        }
        if !expired.is_empty() {
            self.persist()?;
        }
        Ok(expired)
    }

    /// Drop resolved requests older than `keep_resolved`. Pending requests
    /// are never pruned here.
    pub fn prune_resolved(&mut self, now: DateTime<Utc>, keep_resolved: chrono::Duration) -> Result<usize> {
        let before = self.requests.len();
        self.requests.retain(|_, r| {
            r.status == ApprovalStatus::Pending
                || r.responded_at.is_none_or(|at| now - at < keep_resolved)
        });
        let dropped = before - self.requests.len();
        if dropped > 0 {
            self.persist()?;
        }
        Ok(dropped)
    }
}
