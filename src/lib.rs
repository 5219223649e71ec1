use thiserror::Error;

use crate::backend::BackendError;
use crate::reconcile::{CreateError, DeleteError, ObserveError, UpdateError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("State store connection error: {0}")]
    Connect(#[source] BackendError),

    #[error("Observe error: {0}")]
    Observe(#[from] ObserveError),

    #[error("Create error: {0}")]
    Create(#[from] CreateError),

    #[error("Update error: {0}")]
    Update(#[from] UpdateError),

    #[error("Delete error: {0}")]
    Delete(#[from] DeleteError),

    #[error("Status patch error: {0}")]
    StatusPatch(#[source] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::Connect(_) => "connect",
            Error::Observe(_) => "observe",
            Error::Create(_) => "create",
            Error::Update(_) => "update",
            Error::Delete(_) => "delete",
            Error::StatusPatch(_) => "status_patch",
            Error::Finalizer(_) => "finalizer",
        }
    }
}

/// Expose all controller components used by main
pub mod controller;
pub use crate::controller::*;
pub mod api;
pub mod backend;
pub mod reconcile;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
pub mod metrics;
pub use metrics::Metrics;
