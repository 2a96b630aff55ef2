use std::fmt;

/// Error of a call to one of the exporter's external collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Runtime(#[from] crate::runtime::Error),
    #[error(transparent)]
    Capacity(#[from] crate::capacity::Error),
}

/// The operation of a reconciliation cycle that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ListContainers,
    InspectContainer,
    SampleUsage,
    ListMounts,
    StatMount,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::ListContainers => "list containers",
            Operation::InspectContainer => "inspect container",
            Operation::SampleUsage => "sample container usage",
            Operation::ListMounts => "list data mounts",
            Operation::StatMount => "stat data mount",
        })
    }
}

/// A non-fatal failure during a reconciliation cycle.
///
/// Neither kind is retried within the cycle; the next cycle is the retry.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    /// A whole entity kind could not be observed. All of its entities are treated as gone.
    #[error("cycle degraded, failed to {operation}: {source}")]
    CycleDegraded {
        operation: Operation,
        #[source]
        source: Error,
    },
    /// A single entity could not be observed. Its series keep their previous values.
    #[error("skipped `{entity}` for this cycle, failed to {operation}: {source}")]
    EntitySkipped {
        entity: String,
        operation: Operation,
        #[source]
        source: Error,
    },
}

impl Failure {
    pub fn degraded(operation: Operation, source: impl Into<Error>) -> Self {
        Failure::CycleDegraded {
            operation,
            source: source.into(),
        }
    }

    pub fn skipped(entity: impl fmt::Display, operation: Operation, source: impl Into<Error>) -> Self {
        Failure::EntitySkipped {
            entity: entity.to_string(),
            operation,
            source: source.into(),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            Failure::CycleDegraded { operation, .. } | Failure::EntitySkipped { operation, .. } => {
                *operation
            }
        }
    }
}
