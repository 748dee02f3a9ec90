//! Error types for querier

use serde_json::{Value, json};
use thiserror::Error;

/// Result type alias for querier operations
pub type QuerierResult<T> = Result<T, QuerierError>;

/// Error types for query-construction and CRUD operations
#[derive(Debug, Error)]
pub enum QuerierError {
    /// Model name did not resolve in the registry. Configuration error.
    #[error("BadRequest.Target.Model.Not.Exists: {model_name}")]
    ModelNotFound { model_name: String },

    /// Include target is not an association of the parent model. Configuration error.
    #[error("{model_name} has no association with {association}.")]
    AssociationNotFound {
        model_name: String,
        association: String,
    },

    /// Searchable map named an operator outside the supported set. Configuration error.
    #[error("this operator not supported.")]
    UnsupportedOperator { operator: String },

    /// Searchable map named a condition outside the supported set. Configuration error.
    #[error("this condition not supported.")]
    UnsupportedCondition { condition: String },

    /// A required parameter was missing or null
    #[error("BadRequest.No.Required.Or.Valid.Parameter: {0}")]
    MissingParameter(String),

    /// Input shape failed validation
    #[error("BadRequest.Parameter.Format.Invalid: {0}")]
    Validation(String),

    /// Target row of an update/getDetail was missing
    #[error("BadRequest.No.Target.Founded: {0}")]
    NotFound(String),

    /// Unique constraint violation reported by the store
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Store backend error
    #[error("Store error: {0}")]
    Store(String),

    /// Cache backend error
    #[error("Cache error: {0}")]
    Cache(String),
}

impl QuerierError {
    /// Create a model-not-found error.
    pub fn model_not_found(model_name: impl Into<String>) -> Self {
        Self::ModelNotFound {
            model_name: model_name.into(),
        }
    }

    /// Create an association-not-found error.
    pub fn association_not_found(
        model_name: impl Into<String>,
        association: impl Into<String>,
    ) -> Self {
        Self::AssociationNotFound {
            model_name: model_name.into(),
            association: association.into(),
        }
    }

    /// Create a missing-parameter error.
    pub fn missing_parameter(name: impl Into<String>) -> Self {
        Self::MissingParameter(name.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Check if this is a configuration error (caller/programmer mistake,
    /// never retried).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::ModelNotFound { .. }
                | Self::AssociationNotFound { .. }
                | Self::UnsupportedOperator { .. }
                | Self::UnsupportedCondition { .. }
        )
    }

    /// Check if this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::MissingParameter(_))
    }

    /// Structured payload `{message, code, extra}` for API surfaces.
    pub fn payload(&self) -> Value {
        match self {
            Self::ModelNotFound { model_name } => json!({
                "message": "BadRequest.Target.Model.Not.Exists",
                "code": 400,
                "extra": { "modelName": model_name },
            }),
            Self::AssociationNotFound {
                model_name,
                association,
            } => json!({
                "message": "BadRequest.Association.Not.Exists",
                "code": 400,
                "extra": { "modelName": model_name, "association": association },
            }),
            Self::UnsupportedOperator { operator } => json!({
                "message": "this operator not supported.",
                "code": 400,
                "extra": { "operator": operator },
            }),
            Self::UnsupportedCondition { condition } => json!({
                "message": "this condition not supported.",
                "code": 400,
                "extra": { "condition": condition },
            }),
            Self::MissingParameter(name) => json!({
                "message": "BadRequest.No.Required.Or.Valid.Parameter",
                "code": 400,
                "extra": { "parameter": name },
            }),
            Self::Validation(detail) => json!({
                "message": "BadRequest.Parameter.Format.Invalid",
                "code": 400,
                "extra": { "detail": detail },
            }),
            Self::NotFound(target) => json!({
                "message": "BadRequest.No.Target.Founded",
                "code": 400,
                "extra": { "where": target },
            }),
            Self::UniqueViolation(detail) => json!({
                "message": "BadRequest.Unique.Constraint.Violation",
                "code": 400,
                "extra": { "detail": detail },
            }),
            Self::Serialization(detail) | Self::Store(detail) | Self::Cache(detail) => json!({
                "message": "InternalServerError",
                "code": 500,
                "extra": { "detail": detail },
            }),
        }
    }
}

impl From<serde_json::Error> for QuerierError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_operator_message() {
        let err = QuerierError::UnsupportedOperator {
            operator: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "this operator not supported.");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_model_not_found_payload() {
        let err = QuerierError::model_not_found("test");
        let payload = err.payload();
        assert_eq!(payload["code"], 400);
        assert_eq!(payload["extra"]["modelName"], "test");
    }

    #[test]
    fn test_not_found_is_not_configuration() {
        let err = QuerierError::not_found("User:1");
        assert!(err.is_not_found());
        assert!(!err.is_configuration());
    }
}
