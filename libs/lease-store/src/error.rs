use thiserror::Error;

/// Failure taxonomy for the lease store.
///
/// Absence is never an error: lookups return `Option`. `Conflict` is the
/// expected outcome of losing an allocation race and callers treat it as
/// "address no longer available".
#[derive(Error, Debug)]
pub enum StoreError {
    /// connection loss, pool exhaustion, timeouts
    #[error("storage unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),
    /// uniqueness violation, e.g. a second active lease for one (ip, subnet)
    #[error("conflicting row already exists")]
    Conflict,
    /// a persisted row failed to parse back into its runtime type
    #[error("stored row failed to decode: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict,
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => StoreError::Unavailable(err),
            _ => StoreError::Database(err),
        }
    }
}
