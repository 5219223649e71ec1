//! Short-lived administrative credentials for a cluster's control API.

use std::time::Duration;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::{Deserialize, Serialize};

use super::ConnectionError;
use crate::api::cluster::Cluster;
use crate::backend::{Clientset, IssueCertRequest, KeyStore};

/// Default validity of issued client certificates when the caller passes
/// zero.
pub const DEFAULT_CERT_TTL: Duration = Duration::from_secs(18 * 3600);

/// Well-known identities used when issuing administrative credentials.
/// Explicit configuration rather than embedded literals so deployments can
/// override them.
#[derive(Clone, Debug)]
pub struct IssuerConfig {
    /// Key set identity of the cluster certificate authority.
    pub signer: String,
    /// Common name of the issued administrative certificate.
    pub common_name: String,
    /// Groups the administrative identity belongs to.
    pub groups: Vec<String>,
    pub default_ttl: Duration,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            signer: "kubernetes-ca".into(),
            common_name: "kops-operator".into(),
            groups: vec!["system:masters".into()],
            default_ttl: DEFAULT_CERT_TTL,
        }
    }
}

/// Derived secret material granting administrative access to one cluster.
///
/// Regenerated on every observe pass because certificates expire; held only
/// for the duration of one reconciliation, then serialized into connection
/// details and discarded.
#[derive(Clone, Debug)]
pub struct ConnectionDescriptor {
    pub server: String,
    pub context: String,
    pub ca_cert: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
    pub ttl: Duration,
}

impl ConnectionDescriptor {
    /// Serializes the descriptor into a kubeconfig document with the cluster
    /// identity as context name.
    pub fn kubeconfig(&self) -> Result<Vec<u8>, ConnectionError> {
        let doc = KubeconfigDoc {
            api_version: "v1",
            kind: "Config",
            clusters: vec![NamedCluster {
                name: self.context.clone(),
                cluster: ClusterEndpoint {
                    server: self.server.clone(),
                    certificate_authority_data: BASE64_STANDARD.encode(&self.ca_cert),
                },
            }],
            users: vec![NamedUser {
                name: self.context.clone(),
                user: UserCredentials {
                    client_certificate_data: BASE64_STANDARD.encode(&self.client_cert),
                    client_key_data: BASE64_STANDARD.encode(&self.client_key),
                },
            }],
            contexts: vec![NamedContext {
                name: self.context.clone(),
                context: ContextRef {
                    cluster: self.context.clone(),
                    user: self.context.clone(),
                },
            }],
            current_context: self.context.clone(),
        };
        Ok(serde_yaml::to_string(&doc)?.into_bytes())
    }
}

/// Builds the connection descriptor for a cluster. Each step is a hard
/// dependency on the previous one succeeding; no partial descriptor is ever
/// returned.
pub async fn build_connection<CS: Clientset>(
    clientset: &CS,
    cluster: &Cluster,
    ttl: Duration,
    config: &IssuerConfig,
) -> Result<ConnectionDescriptor, ConnectionError> {
    let key_store = clientset
        .key_store(cluster)
        .map_err(ConnectionError::KeyStore)?;

    let keyset = key_store
        .find_keyset(&config.signer)
        .await
        .map_err(ConnectionError::CaLookup)?
        .ok_or_else(|| ConnectionError::CaNotFound {
            signer: config.signer.clone(),
        })?;

    let ttl = if ttl.is_zero() { config.default_ttl } else { ttl };

    let issued = key_store
        .issue_cert(&IssueCertRequest {
            signer: config.signer.clone(),
            common_name: config.common_name.clone(),
            organizations: config.groups.clone(),
            validity: ttl,
        })
        .await
        .map_err(ConnectionError::IssueCert)?;

    Ok(ConnectionDescriptor {
        server: format!("https://api.{}", cluster.name()),
        context: cluster.name(),
        ca_cert: keyset.certificates,
        client_cert: issued.certificate,
        client_key: issued.private_key,
        ttl,
    })
}

#[derive(Serialize, Deserialize)]
struct KubeconfigDoc {
    #[serde(rename = "apiVersion")]
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<NamedCluster>,
    users: Vec<NamedUser>,
    contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    current_context: String,
}

#[derive(Serialize, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEndpoint,
}

#[derive(Serialize, Deserialize)]
struct ClusterEndpoint {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    certificate_authority_data: String,
}

#[derive(Serialize, Deserialize)]
struct NamedUser {
    name: String,
    user: UserCredentials,
}

#[derive(Serialize, Deserialize)]
struct UserCredentials {
    #[serde(rename = "client-certificate-data")]
    client_certificate_data: String,
    #[serde(rename = "client-key-data")]
    client_key_data: String,
}

#[derive(Serialize, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextRef,
}

#[derive(Serialize, Deserialize)]
struct ContextRef {
    cluster: String,
    user: String,
}
