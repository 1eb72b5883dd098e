use std::io;
use thiserror::Error;

/// Error type shared by all wormhole components.
///
/// Variants map to how the caller is expected to react: `BadParameter` is
/// fatal at boot, `NotFound` is usually expected and converted into a
/// recreate, `System` and `Kube` are retried by the reconcile loop,
/// `Conflict` is retried with a re-fetch, and `Canceled` signals cooperative
/// shutdown rather than a failure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("system error: {0}")]
    System(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("canceled")]
    Canceled,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(resp)) if resp.code == 409 && resp.reason == "AlreadyExists")
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled)
    }
}
