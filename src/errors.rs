mod types;

pub use types::{BrowserAgentError, Result};

// Helper function to convert any error to BrowserAgentError
impl BrowserAgentError {
    pub fn from_any_error<E: std::fmt::Display>(err: E) -> Self {
        BrowserAgentError::Protocol(err.to_string())
    }

    /// Data-inconsistency conditions are never repaired locally; callers
    /// propagate them instead of folding them into a failed `ActionResult`.
    pub fn is_data_inconsistency(&self) -> bool {
        matches!(
            self,
            BrowserAgentError::ElementNotFound(_)
                | BrowserAgentError::DuplicateEncodedId(_)
                | BrowserAgentError::InvalidEncodedId(_)
                | BrowserAgentError::StaleState(_)
        )
    }

    /// Conditions the orchestration layer must see as a hard error rather
    /// than a failed action.
    pub fn is_fatal(&self) -> bool {
        self.is_data_inconsistency()
            || matches!(
                self,
                BrowserAgentError::ActionError(crate::actions::ActionError::UnsupportedMethod(_))
            )
    }
}
