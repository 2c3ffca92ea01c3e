//! Human-in-the-loop approval coordination.
//!
//! A tool call that needs a human decision registers a pending request
//! here and awaits a one-shot settlement. The decision arrives out-of-band,
//! over a *different* connection, as an RPC that calls
//! [`ApprovalCoordinator::resolve`]. Every request settles exactly once:
//! by a decision, by its timeout, or by a session/run cancellation —
//! whichever wins the race under the registry lock.

use crate::events::{EventSink, GatewayEvent, EVENT_APPROVAL_REQUEST, EVENT_APPROVAL_RESOLVED};
use crate::util::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Default window for a human to answer before the request times out.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// What kind of action the agent wants to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Exec,
    Write,
    Edit,
}

/// The action presented to the human for a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalAction {
    pub kind: ActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Short excerpt of what would be written, at most 200 chars.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    pub tool_args: serde_json::Value,
}

/// The four decisions a client may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    #[serde(rename = "allow-once")]
    AllowOnce,
    #[serde(rename = "allow-session")]
    AllowSession,
    #[serde(rename = "allow-always")]
    AllowAlways,
    #[serde(rename = "deny")]
    Deny,
}

impl ApprovalDecision {
    pub fn parse(s: &str) -> Result<Self, ApprovalError> {
        match s {
            "allow-once" => Ok(Self::AllowOnce),
            "allow-session" => Ok(Self::AllowSession),
            "allow-always" => Ok(Self::AllowAlways),
            "deny" => Ok(Self::Deny),
            _ => Err(ApprovalError::InvalidDecision),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllowOnce => "allow-once",
            Self::AllowSession => "allow-session",
            Self::AllowAlways => "allow-always",
            Self::Deny => "deny",
        }
    }

    pub fn is_approved(self) -> bool {
        !matches!(self, Self::Deny)
    }
}

/// A registered request, as broadcast to the session's clients.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub request_id: Uuid,
    pub session_key: String,
    pub run_id: String,
    pub action: ApprovalAction,
    pub timestamp_ms: u64,
}

/// What the waiting tool call receives when a decision arrives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub decision: ApprovalDecision,
    /// Pattern to remember when the decision is `allow-always`: the command
    /// head for exec actions, the file path for write/edit actions.
    pub allowlist_pattern: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("approval request timed out")]
    Timeout,
    #[error("approval cancelled: {0}")]
    Cancelled(String),
    #[error("unknown or already resolved approval request")]
    NotFound,
    #[error("invalid approval decision")]
    InvalidDecision,
}

struct PendingApproval {
    request: ApprovalRequest,
    resolver: oneshot::Sender<Result<ApprovalOutcome, ApprovalError>>,
    timer: tokio::task::JoinHandle<()>,
}

/// Process-wide registry of unanswered approval requests.
pub struct ApprovalCoordinator {
    pending: Mutex<HashMap<Uuid, PendingApproval>>,
    sink: Arc<dyn EventSink>,
    default_timeout: Duration,
}

impl ApprovalCoordinator {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self::with_timeout(sink, DEFAULT_APPROVAL_TIMEOUT)
    }

    pub fn with_timeout(sink: Arc<dyn EventSink>, default_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            sink,
            default_timeout,
        }
    }

    /// Register a request, notify the session's clients, and wait for the
    /// settlement. Resolves with the outcome, or fails on timeout or
    /// cancellation.
    pub async fn request_approval(
        self: &Arc<Self>,
        session_key: &str,
        run_id: &str,
        action: ApprovalAction,
        timeout: Option<Duration>,
    ) -> Result<ApprovalOutcome, ApprovalError> {
        let request_id = Uuid::new_v4();
        let request = ApprovalRequest {
            request_id,
            session_key: session_key.to_string(),
            run_id: run_id.to_string(),
            action,
            timestamp_ms: now_ms(),
        };

        let (tx, rx) = oneshot::channel();
        let timer = {
            let coordinator = Arc::clone(self);
            let deadline = timeout.unwrap_or(self.default_timeout);
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                coordinator.expire(request_id);
            })
        };

        let event = GatewayEvent {
            session_key: request.session_key.clone(),
            run_id: request.run_id.clone(),
            data: serde_json::json!({
                "type": EVENT_APPROVAL_REQUEST,
                "request": &request,
            }),
        };

        {
            // Emitting under the registry lock keeps request events in
            // registration order per session; the sink never blocks.
            let mut pending = self.lock_pending();
            pending.insert(
                request_id,
                PendingApproval {
                    request,
                    resolver: tx,
                    timer,
                },
            );
            self.sink.emit(event);
        }
        tracing::info!(%request_id, session_key, run_id, "approval requested");

        // A dropped sender means the coordinator itself went away.
        rx.await
            .unwrap_or(Err(ApprovalError::Cancelled("coordinator shut down".into())))
    }

    /// Deliver a client decision. A second call for the same id is a
    /// `NotFound` no-op error, never a double settlement.
    pub fn resolve(
        &self,
        request_id: Uuid,
        decision: ApprovalDecision,
    ) -> Result<(), ApprovalError> {
        let entry = self
            .lock_pending()
            .remove(&request_id)
            .ok_or(ApprovalError::NotFound)?;
        entry.timer.abort();

        let allowlist_pattern = if decision == ApprovalDecision::AllowAlways {
            derive_allowlist_pattern(&entry.request.action)
        } else {
            None
        };

        tracing::info!(
            %request_id,
            decision = decision.as_str(),
            "approval resolved"
        );

        let _ = entry.resolver.send(Ok(ApprovalOutcome {
            approved: decision.is_approved(),
            decision,
            allowlist_pattern,
        }));

        self.sink.emit(GatewayEvent {
            session_key: entry.request.session_key,
            run_id: entry.request.run_id,
            data: serde_json::json!({
                "type": EVENT_APPROVAL_RESOLVED,
                "request_id": request_id,
                "decision": decision.as_str(),
            }),
        });
        Ok(())
    }

    /// Fail every pending request belonging to `session_key`.
    pub fn cancel_for_session(&self, session_key: &str) {
        self.cancel_where(|req| req.session_key == session_key, "session closed");
    }

    /// Fail every pending request belonging to `run_id`.
    pub fn cancel_for_run(&self, run_id: &str) {
        self.cancel_where(|req| req.run_id == run_id, "run aborted");
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn has_pending(&self, request_id: Uuid) -> bool {
        self.lock_pending().contains_key(&request_id)
    }

    /// Timer callback: settle with `Timeout` if still pending.
    fn expire(&self, request_id: Uuid) {
        let Some(entry) = self.lock_pending().remove(&request_id) else {
            return;
        };
        tracing::warn!(%request_id, "approval request timed out");
        let _ = entry.resolver.send(Err(ApprovalError::Timeout));
    }

    fn cancel_where(&self, matches: impl Fn(&ApprovalRequest) -> bool, reason: &str) {
        let cancelled: Vec<PendingApproval> = {
            let mut pending = self.lock_pending();
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, p)| matches(&p.request))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };

        for entry in cancelled {
            entry.timer.abort();
            tracing::info!(request_id = %entry.request.request_id, reason, "approval cancelled");
            let _ = entry
                .resolver
                .send(Err(ApprovalError::Cancelled(reason.to_string())));
        }
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PendingApproval>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// The pattern remembered on `allow-always`: first whitespace-delimited
/// token of the command for exec, the file path for write/edit.
fn derive_allowlist_pattern(action: &ApprovalAction) -> Option<String> {
    match action.kind {
        ActionKind::Exec => action
            .command
            .as_deref()
            .and_then(|c| c.split_whitespace().next())
            .map(String::from),
        ActionKind::Write | ActionKind::Edit => action.file_path.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Records every emitted event for assertions.
    struct RecordingSink {
        events: StdMutex<Vec<GatewayEvent>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: StdMutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<GatewayEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: GatewayEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn exec_action(command: &str) -> ApprovalAction {
        ApprovalAction {
            kind: ActionKind::Exec,
            command: Some(command.to_string()),
            file_path: None,
            preview: None,
            tool_args: serde_json::json!({"command": command}),
        }
    }

    fn write_action(path: &str) -> ApprovalAction {
        ApprovalAction {
            kind: ActionKind::Write,
            command: None,
            file_path: Some(path.to_string()),
            preview: Some("contents...".to_string()),
            tool_args: serde_json::json!({"file_path": path}),
        }
    }

    fn coordinator(sink: Arc<RecordingSink>) -> Arc<ApprovalCoordinator> {
        Arc::new(ApprovalCoordinator::new(sink))
    }

    /// Pull the request id out of the emitted approval_request event.
    fn emitted_request_id(sink: &RecordingSink) -> Uuid {
        let events = sink.events();
        let evt = events
            .iter()
            .find(|e| e.data["type"] == EVENT_APPROVAL_REQUEST)
            .expect("approval_request emitted");
        evt.data["request"]["request_id"]
            .as_str()
            .unwrap()
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn allow_once_settles_future_with_outcome() {
        let sink = RecordingSink::new();
        let coord = coordinator(sink.clone());

        let waiter = {
            let coord = coord.clone();
            tokio::spawn(async move {
                coord
                    .request_approval("S", "R", exec_action("git status"), None)
                    .await
            })
        };

        // Wait for registration.
        while coord.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        let id = emitted_request_id(&sink);
        assert!(coord.has_pending(id));

        coord.resolve(id, ApprovalDecision::AllowOnce).unwrap();
        let outcome = waiter.await.unwrap().unwrap();
        assert!(outcome.approved);
        assert_eq!(outcome.decision, ApprovalDecision::AllowOnce);
        assert_eq!(outcome.allowlist_pattern, None);
        assert!(!coord.has_pending(id));
        assert_eq!(coord.pending_count(), 0);
    }

    #[tokio::test]
    async fn deny_settles_unapproved() {
        let sink = RecordingSink::new();
        let coord = coordinator(sink.clone());
        let waiter = {
            let coord = coord.clone();
            tokio::spawn(
                async move { coord.request_approval("S", "R", write_action("/tmp/x"), None).await },
            )
        };
        while coord.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        coord
            .resolve(emitted_request_id(&sink), ApprovalDecision::Deny)
            .unwrap();
        let outcome = waiter.await.unwrap().unwrap();
        assert!(!outcome.approved);
        assert_eq!(outcome.decision, ApprovalDecision::Deny);
    }

    #[tokio::test]
    async fn allow_always_derives_command_head_for_exec() {
        let sink = RecordingSink::new();
        let coord = coordinator(sink.clone());
        let waiter = {
            let coord = coord.clone();
            tokio::spawn(async move {
                coord
                    .request_approval("S", "R", exec_action("cargo build --release"), None)
                    .await
            })
        };
        while coord.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        coord
            .resolve(emitted_request_id(&sink), ApprovalDecision::AllowAlways)
            .unwrap();
        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome.allowlist_pattern.as_deref(), Some("cargo"));
    }

    #[tokio::test]
    async fn allow_always_uses_file_path_for_writes() {
        let sink = RecordingSink::new();
        let coord = coordinator(sink.clone());
        let waiter = {
            let coord = coord.clone();
            tokio::spawn(async move {
                coord
                    .request_approval("S", "R", write_action("/workspace/out.txt"), None)
                    .await
            })
        };
        while coord.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        coord
            .resolve(emitted_request_id(&sink), ApprovalDecision::AllowAlways)
            .unwrap();
        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(
            outcome.allowlist_pattern.as_deref(),
            Some("/workspace/out.txt")
        );
    }

    #[tokio::test]
    async fn second_resolve_is_not_found() {
        let sink = RecordingSink::new();
        let coord = coordinator(sink.clone());
        let waiter = {
            let coord = coord.clone();
            tokio::spawn(
                async move { coord.request_approval("S", "R", exec_action("ls"), None).await },
            )
        };
        while coord.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        let id = emitted_request_id(&sink);
        coord.resolve(id, ApprovalDecision::AllowOnce).unwrap();
        assert_eq!(
            coord.resolve(id, ApprovalDecision::Deny),
            Err(ApprovalError::NotFound)
        );
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn timeout_fails_the_future_and_clears_the_entry() {
        let sink = RecordingSink::new();
        let coord = Arc::new(ApprovalCoordinator::with_timeout(
            sink.clone(),
            Duration::from_millis(20),
        ));
        let result = coord
            .request_approval("S", "R", exec_action("ls"), None)
            .await;
        assert_eq!(result, Err(ApprovalError::Timeout));
        assert_eq!(coord.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_for_run_fails_matching_requests_only() {
        let sink = RecordingSink::new();
        let coord = coordinator(sink.clone());

        let doomed = {
            let coord = coord.clone();
            tokio::spawn(
                async move { coord.request_approval("S", "run-a", exec_action("ls"), None).await },
            )
        };
        let survivor = {
            let coord = coord.clone();
            tokio::spawn(
                async move { coord.request_approval("S", "run-b", exec_action("ls"), None).await },
            )
        };
        while coord.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        coord.cancel_for_run("run-a");
        let err = doomed.await.unwrap().unwrap_err();
        assert!(matches!(err, ApprovalError::Cancelled(ref r) if r == "run aborted"));
        assert!(err.to_string().contains("run aborted"));
        assert_eq!(coord.pending_count(), 1);

        coord.cancel_for_session("S");
        assert!(matches!(
            survivor.await.unwrap().unwrap_err(),
            ApprovalError::Cancelled(_)
        ));
        assert_eq!(coord.pending_count(), 0);
    }

    #[tokio::test]
    async fn events_are_emitted_for_request_and_resolution() {
        let sink = RecordingSink::new();
        let coord = coordinator(sink.clone());
        let waiter = {
            let coord = coord.clone();
            tokio::spawn(async move {
                coord
                    .request_approval("sess-7", "run-7", exec_action("ls"), None)
                    .await
            })
        };
        while coord.pending_count() == 0 {
            tokio::task::yield_now().await;
        }
        coord
            .resolve(emitted_request_id(&sink), ApprovalDecision::AllowOnce)
            .unwrap();
        waiter.await.unwrap().unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data["type"], EVENT_APPROVAL_REQUEST);
        assert_eq!(events[0].session_key, "sess-7");
        assert_eq!(events[0].data["request"]["action"]["kind"], "exec");
        assert_eq!(events[1].data["type"], EVENT_APPROVAL_RESOLVED);
        assert_eq!(events[1].data["decision"], "allow-once");
    }

    #[test]
    fn decision_wire_strings_roundtrip() {
        for (s, d) in [
            ("allow-once", ApprovalDecision::AllowOnce),
            ("allow-session", ApprovalDecision::AllowSession),
            ("allow-always", ApprovalDecision::AllowAlways),
            ("deny", ApprovalDecision::Deny),
        ] {
            assert_eq!(ApprovalDecision::parse(s), Ok(d));
            assert_eq!(d.as_str(), s);
            assert_eq!(serde_json::to_value(d).unwrap(), s);
        }
        assert_eq!(
            ApprovalDecision::parse("yes"),
            Err(ApprovalError::InvalidDecision)
        );
    }
}
