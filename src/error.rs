use thiserror::Error;

/// Why a weak handle could not be upgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("weak handle does not observe any object")]
    Empty,
    #[error("observed object has already reached end of life")]
    Expired,
}
