//! Type Registry contract (§6). The registry itself — schema validation,
//! continuation/blocker graph membership checks against the caller's actual
//! declared types — is an external collaborator and explicitly out of
//! scope (§1). Core only depends on this trait's shape so the Client API
//! can call through to it at the boundary; nothing downstream of the
//! boundary ever re-validates.

use crate::error::JobTypeValidationError;
use crate::model::TypeName;
use serde_json::Value;

/// A `{typeName, input}` pair as passed to `validateContinueWith` /
/// `validateBlockers`.
#[derive(Debug, Clone)]
pub struct ContinuationRequest {
    pub type_name: TypeName,
    pub input: Value,
}

pub trait TypeRegistry: Send + Sync {
    /// Throws (returns `Err`) if `type_name` is not a permitted chain head.
    fn validate_entry(&self, type_name: &str) -> Result<(), JobTypeValidationError>;

    /// Transformed value or throw.
    fn parse_input(&self, type_name: &str, value: &Value) -> Result<Value, JobTypeValidationError>;

    /// Transformed value or throw.
    fn parse_output(&self, type_name: &str, value: &Value) -> Result<Value, JobTypeValidationError>;

    /// Throw on disallowed edge.
    fn validate_continue_with(
        &self,
        from_type_name: &str,
        to: &ContinuationRequest,
    ) -> Result<(), JobTypeValidationError>;

    /// Throw on disallowed blocker set.
    fn validate_blockers(
        &self,
        type_name: &str,
        blockers: &[ContinuationRequest],
    ) -> Result<(), JobTypeValidationError>;
}
