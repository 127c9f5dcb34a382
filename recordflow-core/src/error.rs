use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Transform Error - {0}")]
    Transform(String),

    #[error("CancellationToken Cancelled")]
    Cancelled,

    #[error("Partition Error - {0}")]
    Partition(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    /// Benign: the writer was closed (idle expiry, eviction, explicit close) while a write was
    /// racing against it.
    #[error("writer is closed")]
    AlreadyClosed,

    #[error("Writer cache is shut down")]
    Closed,

    #[error("{} errors occurred: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Forwarder Error - {0}")]
    Forwarder(String),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Cancellation is always terminal for the run that observed it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Forwarder(format!("task failed to join: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_lists_every_error() {
        let err = Error::Aggregate(vec![
            Error::Sink("disk full".to_string()),
            Error::Sink("broken pipe".to_string()),
        ]);
        assert_eq!(
            err.to_string(),
            "2 errors occurred: Sink Error - disk full; Sink Error - broken pipe"
        );
    }
}
