use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwitcherError {
    #[error("a switch or recovery is already in progress")]
    AlreadyInProgress,
    #[error("no viable identity in the rotation list")]
    NoViableIdentity,
    #[error("activation failed: {0}")]
    ActivationFailed(String),
}
