use thiserror::Error;

use crate::backend::BackendError;

pub mod compare;
pub mod connection;
pub mod engine;
pub mod validation;

/// Failure while building the administrative connection descriptor.
///
/// "CA not found" is a distinct condition from a failed key set lookup:
/// the former signals a provisioned cluster with missing or corrupted PKI
/// state, the latter a broken backend.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("cannot access key store: {0}")]
    KeyStore(#[source] BackendError),

    #[error("cannot look up CA key set: {0}")]
    CaLookup(#[source] BackendError),

    #[error("cannot find CA certificate for signer {signer:?}")]
    CaNotFound { signer: String },

    #[error("cannot issue client certificate: {0}")]
    IssueCert(#[source] BackendError),

    #[error("cannot serialize kubeconfig: {0}")]
    Serialize(#[from] serde_yaml::Error),
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("cannot build cloud: {0}")]
    Cloud(#[source] BackendError),

    #[error("cannot query cluster health: {0}")]
    Probe(#[source] BackendError),
}

#[derive(Error, Debug)]
pub enum ObserveError {
    #[error("cannot get cluster from state store: {0}")]
    GetCluster(#[source] BackendError),

    #[error("cannot list instance groups: {0}")]
    InstanceGroups(#[source] BackendError),

    #[error("cannot build connection descriptor: {0}")]
    Connection(#[from] ConnectionError),

    #[error("cannot validate cluster: {0}")]
    Validate(#[from] ValidationError),

    #[error("cluster state is not healthy: {0}")]
    ClusterState(String),

    #[error("cannot generate kubeconfig: {0}")]
    Kubeconfig(#[source] ConnectionError),
}

#[derive(Error, Debug)]
pub enum CreateError {
    #[error("cannot create cluster state: {0}")]
    CreateCluster(#[source] BackendError),

    #[error("cannot create instance group {name:?}: {source}")]
    CreateInstanceGroup {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("cannot build cloud: {0}")]
    Cloud(#[source] BackendError),

    #[error("cannot assign cloud defaults: {0}")]
    CloudAssignment(#[source] BackendError),

    #[error("cannot apply cluster: {0}")]
    Apply(#[source] BackendError),
}

#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("cannot build cloud: {0}")]
    Cloud(#[source] BackendError),

    #[error("cannot assign cloud defaults: {0}")]
    CloudAssignment(#[source] BackendError),

    #[error("cannot get cluster status: {0}")]
    ClusterStatus(#[source] BackendError),

    #[error("cannot update cluster state: {0}")]
    UpdateCluster(#[source] BackendError),

    #[error("cannot update instance group {name:?}: {source}")]
    UpdateInstanceGroup {
        name: String,
        #[source]
        source: BackendError,
    },

    #[error("cannot apply cluster: {0}")]
    Apply(#[source] BackendError),
}

#[derive(Error, Debug)]
pub enum DeleteError {
    #[error("cannot get cluster from state store: {0}")]
    GetCluster(#[source] BackendError),

    #[error("cannot build cloud: {0}")]
    Cloud(#[source] BackendError),

    #[error("cannot list cluster resources: {0}")]
    ListResources(#[source] BackendError),

    #[error("cannot delete cluster resources: {0}")]
    DeleteResources(#[source] BackendError),

    #[error("cannot delete cluster from state store: {0}")]
    DeleteCluster(#[source] BackendError),
}
