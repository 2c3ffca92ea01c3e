//! Permission-mode enforcement for file and exec tools.
//!
//! The mode is read through a getter on every call, so a UI toggle takes
//! effect on the agent's next tool call without re-registering anything.
//! [`PermissionGated`] adapts any [`Tool`] into a permission-checked tool
//! with an identical schema; in `ask` mode a denied call turns into a
//! pending approval and the wrapped tool runs (or not) once the human
//! answers.

use super::traits::{Tool, ToolResult};
use crate::approval::{
    ActionKind, ApprovalAction, ApprovalCoordinator, ApprovalError,
};
use crate::security::sandbox::{expand_user_path, normalize_lexically};
use crate::security::PathSandbox;
use crate::util::preview_excerpt;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// The four permission modes. Absence of a configured mode means `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    /// Read-only planning; writes and execs are refused outright.
    Plan,
    /// Writes and execs defer to a human decision.
    Ask,
    #[default]
    Auto,
    /// No checks at all. The name is the warning.
    DangerouslySkip,
}

impl PermissionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "plan" => Some(Self::Plan),
            "ask" => Some(Self::Ask),
            "auto" => Some(Self::Auto),
            "dangerously-skip" => Some(Self::DangerouslySkip),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Ask => "ask",
            Self::Auto => "auto",
            Self::DangerouslySkip => "dangerously-skip",
        }
    }
}

/// What a tool does to the outside world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
    Exec,
}

/// Late-bound mode source plus the identifiers the approval flow needs.
#[derive(Clone)]
pub struct PermissionContext {
    /// Read on every check, never cached.
    pub mode: Arc<dyn Fn() -> PermissionMode + Send + Sync>,
    pub home_dir: Option<PathBuf>,
    pub session_key: Option<String>,
    pub run_id: Option<String>,
}

impl PermissionContext {
    /// Context with a fixed mode and no interactive identifiers.
    pub fn fixed(mode: PermissionMode) -> Self {
        Self {
            mode: Arc::new(move || mode),
            home_dir: None,
            session_key: None,
            run_id: None,
        }
    }

    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home_dir = Some(home.into());
        self
    }

    pub fn with_session(mut self, session_key: &str, run_id: &str) -> Self {
        self.session_key = Some(session_key.to_string());
        self.run_id = Some(run_id.to_string());
        self
    }
}

/// Outcome of the mode check, before any approval round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionCheck {
    Allowed,
    /// Refused outright (plan mode).
    Denied { reason: String },
    /// Refused unless a human approves (ask mode).
    NeedsApproval { reason: String },
}

/// Evaluate the mode rules in order. `file_path`, when present, is expanded
/// against `home_dir`; paths inside the user's home are always allowed.
pub fn check_permission(
    mode: PermissionMode,
    operation: OperationKind,
    file_path: Option<&str>,
    home_dir: Option<&PathBuf>,
) -> PermissionCheck {
    match mode {
        PermissionMode::Auto | PermissionMode::DangerouslySkip => return PermissionCheck::Allowed,
        PermissionMode::Plan | PermissionMode::Ask => {}
    }

    if let (Some(path), Some(home)) = (file_path, home_dir) {
        let resolved = normalize_lexically(&expand_user_path(path, home));
        if resolved.starts_with(home) {
            return PermissionCheck::Allowed;
        }
    }

    if operation == OperationKind::Read {
        return PermissionCheck::Allowed;
    }

    match mode {
        PermissionMode::Plan => PermissionCheck::Denied {
            reason: format!(
                "Plan mode is active: {} operations are disabled. \
                 Switch to ask or auto mode to make changes.",
                operation_name(operation)
            ),
        },
        PermissionMode::Ask => PermissionCheck::NeedsApproval {
            reason: format!(
                "{} operations require user approval in ask mode",
                operation_name(operation)
            ),
        },
        _ => unreachable!("auto modes returned above"),
    }
}

fn operation_name(op: OperationKind) -> &'static str {
    match op {
        OperationKind::Read => "read",
        OperationKind::Write => "write",
        OperationKind::Exec => "exec",
    }
}

/// Permission-checking adapter around an arbitrary tool.
pub struct PermissionGated<T: Tool> {
    inner: T,
    operation: OperationKind,
    action_kind: ActionKind,
    ctx: PermissionContext,
    coordinator: Option<Arc<ApprovalCoordinator>>,
    sandbox: Option<(Arc<PathSandbox>, PathBuf)>,
}

impl<T: Tool> PermissionGated<T> {
    pub fn new(
        inner: T,
        operation: OperationKind,
        ctx: PermissionContext,
        coordinator: Option<Arc<ApprovalCoordinator>>,
    ) -> Self {
        let action_kind = match operation {
            OperationKind::Exec => ActionKind::Exec,
            OperationKind::Write => ActionKind::Write,
            // Reads are allowed in every mode before the approval path, so
            // no approval card is ever built for them; this value is never
            // read. Placeholder only.
            OperationKind::Read => ActionKind::Write,
        };
        Self {
            inner,
            operation,
            action_kind,
            ctx,
            coordinator,
            sandbox: None,
        }
    }

    /// For edit-style tools whose approval card should say "edit".
    pub fn with_action_kind(mut self, kind: ActionKind) -> Self {
        self.action_kind = kind;
        self
    }

    /// Validate path arguments through the sandbox guard before any mode
    /// rule runs. `cwd` anchors relative paths.
    pub fn with_sandbox(mut self, sandbox: Arc<PathSandbox>, cwd: impl Into<PathBuf>) -> Self {
        self.sandbox = Some((sandbox, cwd.into()));
        self
    }

    fn build_action(&self, args: &serde_json::Value) -> ApprovalAction {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .map(String::from);
        let file_path = extract_path(args).map(String::from);
        let preview = match self.operation {
            OperationKind::Write => args
                .get("content")
                .and_then(|v| v.as_str())
                .map(preview_excerpt),
            _ => None,
        };
        ApprovalAction {
            kind: self.action_kind,
            command,
            file_path,
            preview,
            tool_args: args.clone(),
        }
    }
}

fn extract_path(args: &serde_json::Value) -> Option<&str> {
    args.get("file_path")
        .or_else(|| args.get("path"))
        .and_then(|v| v.as_str())
}

#[async_trait]
impl<T: Tool> Tool for PermissionGated<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.inner.parameters_schema()
    }

    async fn execute(&self, args: serde_json::Value) -> anyhow::Result<ToolResult> {
        // The sandbox guard rejects first, whatever the mode says.
        if let (Some((sandbox, cwd)), Some(path)) = (self.sandbox.as_ref(), extract_path(&args)) {
            if let Err(e) = sandbox.resolve(path, cwd) {
                return Ok(ToolResult::fail(format!("{e}: {path}")));
            }
        }

        let mode = (self.ctx.mode)();
        let check = check_permission(
            mode,
            self.operation,
            extract_path(&args),
            self.ctx.home_dir.as_ref(),
        );

        let reason = match check {
            PermissionCheck::Allowed => return self.inner.execute(args).await,
            PermissionCheck::Denied { reason } => {
                return Ok(ToolResult::fail(reason));
            }
            PermissionCheck::NeedsApproval { reason } => reason,
        };

        let (Some(coordinator), Some(session_key), Some(run_id)) = (
            self.coordinator.as_ref(),
            self.ctx.session_key.as_deref(),
            self.ctx.run_id.as_deref(),
        ) else {
            // No interactive client to ask; the denial is the result.
            return Ok(ToolResult::fail(reason));
        };

        let action = self.build_action(&args);
        match coordinator
            .request_approval(session_key, run_id, action, None)
            .await
        {
            Ok(outcome) if outcome.approved => self.inner.execute(args).await,
            Ok(outcome) => Ok(ToolResult::fail(format!(
                "Permission denied by user (decision: {})",
                outcome.decision.as_str()
            ))),
            Err(e @ (ApprovalError::Timeout | ApprovalError::Cancelled(_))) => {
                Ok(ToolResult::fail(format!(
                    "Approval request was not answered: {e}"
                )))
            }
            Err(e) => Ok(ToolResult::fail(format!("Approval failed: {e}"))),
        }
    }
}
