#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A user-supplied generation parameter is unknown or malformed.
    /// The message is shown to the user verbatim.
    #[error("{0}")]
    InvalidParameter(String),

    #[error("Validation failed: {0}")]
    Validation(String),
}
