use em_core::EngineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),
    #[error("{0} is not running")]
    NotRunning(&'static str),
    #[error("{component} task failed: {message}")]
    TaskFailed {
        component: &'static str,
        message: String,
    },
    /// Every stop error from a manager shutdown, in stop order.
    #[error("{} component(s) failed to stop", .0.len())]
    Shutdown(Vec<RuntimeError>),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            RuntimeError::AlreadyRunning("detector").to_string(),
            "detector is already running"
        );
        let agg = RuntimeError::Shutdown(vec![
            RuntimeError::NotRunning("a"),
            RuntimeError::NotRunning("b"),
        ]);
        assert_eq!(agg.to_string(), "2 component(s) failed to stop");
    }

    #[test]
    fn test_engine_error_converts() {
        let err: RuntimeError = EngineError::validation("bad").into();
        assert!(matches!(err, RuntimeError::Engine(EngineError::Validation(_))));
    }
}
