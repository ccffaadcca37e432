use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Run not found: {0}")]
    RunNotFound(usize),

    #[error("Loop {depth} not found in run {run}")]
    LoopNotFound { run: usize, depth: usize },

    #[error("Component not declared: {0}")]
    UndeclaredComponent(String),

    #[error("Component declared more than once: {0}")]
    DuplicateComponent(String),

    #[error("Invalid stage: {0}")]
    InvalidStage(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CoreError::LoopNotFound { run: 2, depth: 1 };
        assert_eq!(error.to_string(), "Loop 1 not found in run 2");
    }
}
