use thiserror::Error;

/// Failure taxonomy shared by every engine component.
///
/// Validation and not-found errors reject a single operation. A field
/// failure aborts the whole cycle of the component that hit it; the next
/// tick starts over. Insufficient energy is an ordinary rejection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("field unavailable: {0}")]
    FieldUnavailable(String),

    #[error("insufficient energy: required {required:.4}, available {available:.4}")]
    InsufficientEnergy { required: f64, available: f64 },
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Resource shortfalls are skipped by the caller, not treated as faults.
    pub fn is_resource(&self) -> bool {
        matches!(self, EngineError::InsufficientEnergy { .. })
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
