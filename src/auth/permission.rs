use crate::auth::bearer::TokenAuth;
use crate::error::{AppError, AppResult};
use crate::types::{Span, Trace, TypedValue};

pub const SCOPE_MESSAGES_VIEW: &str = "messages:view";
pub const SCOPE_COST_VIEW: &str = "cost:view";
pub const VALID_SCOPES: &[&str] = &[SCOPE_MESSAGES_VIEW, SCOPE_COST_VIEW];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    MessagesView,
    CostView,
}

impl Capability {
    pub fn scope(&self) -> &'static str {
        match self {
            Capability::MessagesView => SCOPE_MESSAGES_VIEW,
            Capability::CostView => SCOPE_COST_VIEW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Granted,
    Denied(String),
}

impl Access {
    pub fn is_granted(&self) -> bool {
        matches!(self, Access::Granted)
    }

    pub fn require(self) -> AppResult<()> {
        match self {
            Access::Granted => Ok(()),
            Access::Denied(reason) => Err(AppError::Forbidden(reason)),
        }
    }
}

/// Source of capability decisions for a caller. Held across awaits by the planner.
pub trait PermissionAuthority: Send + Sync {
    fn has_capability(&self, project_id: &str, capability: Capability) -> bool;
}

impl PermissionAuthority for TokenAuth {
    fn has_capability(&self, project_id: &str, capability: Capability) -> bool {
        self.project_id == project_id && self.scopes.iter().any(|s| s == capability.scope())
    }
}

pub fn check(caller: &dyn PermissionAuthority, project_id: &str, capability: Capability) -> Access {
    if caller.has_capability(project_id, capability) {
        Access::Granted
    } else {
        Access::Denied(format!(
            "missing {} on project {project_id}",
            capability.scope()
        ))
    }
}

/// Remove every cost figure from a trace, including the attached guardrail result.
pub fn redact_trace_fields(trace: &mut Trace) {
    trace.metrics.total_cost = None;
    if let Some(guardrail) = trace.last_guardrail.as_mut() {
        guardrail.result.cost = None;
    }
}

/// Remove every cost figure from a span, including guardrail result outputs.
pub fn redact_span_fields(span: &mut Span) {
    span.metrics.cost = None;
    for output in span.outputs.iter_mut() {
        if let TypedValue::GuardrailResult(result) = output {
            result.cost = None;
        }
    }
}
