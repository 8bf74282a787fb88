use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool has no free slots left")]
    Exhausted,

    #[error("Handle does not refer to a live slot in this pool")]
    InvalidHandle,

    #[error("Poisoned pool lock")]
    Poisoned,
}

impl<T> From<std::sync::PoisonError<T>> for PoolError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        PoolError::Poisoned
    }
}
