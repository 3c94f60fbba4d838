//! Best-effort audit sink. Recording never fails the caller.
use serde::Serialize;
use tracing::info;

use crate::model::PostStatus;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    PostPublished {
        post_id: i64,
        owner_id: i64,
        status: PostStatus,
        succeeded: usize,
        failed: usize,
    },
    CredentialNeedsReconnect {
        post_id: i64,
        credential_id: i64,
    },
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "audit", event = %json, "audit"),
            Err(_) => info!(target: "audit", ?event, "audit"),
        }
    }
}
