//! Test fixtures for common audit types.

use serde_json::json;
use warden_audit::{
    ActionType, AuditContext, AuditEvent, ConscienceResult, EntryFields, HandlerAction, Outcome,
    Severity,
};

/// Context about `thought-1` in `task-1`.
#[must_use]
pub fn sample_context() -> AuditContext {
    AuditContext::new()
        .with_entity("thought-1")
        .with_request("task-1")
        .with_metadata("handler_name", "test_handler")
}

/// Context about a specific entity.
#[must_use]
pub fn context_for(entity_id: impl Into<String>) -> AuditContext {
    AuditContext::new().with_entity(entity_id)
}

/// Successful handler fields for `action`, using [`sample_context`].
#[must_use]
pub fn sample_fields(action: HandlerAction) -> EntryFields {
    EntryFields::new(
        ActionType::Handler(action),
        "test_handler",
        sample_context(),
        Outcome::Success,
    )
}

/// A medium-severity system event.
#[must_use]
pub fn sample_event() -> AuditEvent {
    AuditEvent::new("test_system")
        .with_entity("task-1")
        .with_severity(Severity::Medium)
        .with_metadata("attempt", 1_i64)
}

/// A conscience decision allowing the action.
#[must_use]
pub fn conscience_allowed() -> ConscienceResult {
    ConscienceResult {
        allowed: true,
        reason: None,
        risk_level: Some("low".to_string()),
        modifications: None,
    }
}

/// A conscience decision denying the action.
#[must_use]
pub fn conscience_denied(reason: impl Into<String>) -> ConscienceResult {
    ConscienceResult {
        allowed: false,
        reason: Some(reason.into()),
        risk_level: Some("high".to_string()),
        modifications: Some(json!({ "suggested_action": "PONDER" })),
    }
}
