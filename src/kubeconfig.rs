//! Admin kubeconfig generation
//!
//! After a control-plane machine is created, its admin credentials are
//! published as a kubeconfig document in the
//! [`ADMIN_KUBECONFIG_SECRET`](crate::ADMIN_KUBECONFIG_SECRET) secret of the
//! machine's namespace.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};

use crate::pki::{CertificateAuthorityBundle, ADMIN_USER};
use crate::{Error, ADMIN_KUBECONFIG_SECRET, KUBECONFIG_SECRET_KEY, KUBE_API_PORT};

/// Kubeconfig structure
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<KubeconfigCluster>,
    /// Users
    pub users: Vec<KubeconfigUser>,
    /// Contexts
    pub contexts: Vec<KubeconfigContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry in kubeconfig
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct KubeconfigCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded PEM)
    pub certificate_authority_data: String,
}

/// User entry in kubeconfig
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct KubeconfigUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserConfig,
}

/// User configuration
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    /// Client certificate (base64 encoded PEM)
    pub client_certificate_data: String,
    /// Client key (base64 encoded PEM)
    pub client_key_data: String,
}

/// Context entry in kubeconfig
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct KubeconfigContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
}

/// Name of the single context in an admin kubeconfig
pub fn admin_context_name(cluster_name: &str) -> String {
    format!("{ADMIN_USER}@{cluster_name}")
}

impl Kubeconfig {
    /// Admin kubeconfig for `cluster_name` whose API server listens on
    /// `address`
    pub fn admin(cluster_name: &str, address: &str, bundle: &CertificateAuthorityBundle) -> Self {
        let context = admin_context_name(cluster_name);
        Self {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![KubeconfigCluster {
                name: cluster_name.to_string(),
                cluster: ClusterConfig {
                    server: format!("https://{address}:{KUBE_API_PORT}"),
                    certificate_authority_data: BASE64.encode(bundle.kubernetes().cert_pem()),
                },
            }],
            users: vec![KubeconfigUser {
                name: ADMIN_USER.to_string(),
                user: UserConfig {
                    client_certificate_data: BASE64.encode(bundle.admin().cert_pem()),
                    client_key_data: BASE64.encode(bundle.admin().key_pem()),
                },
            }],
            contexts: vec![KubeconfigContext {
                name: context.clone(),
                context: ContextConfig {
                    cluster: cluster_name.to_string(),
                    user: ADMIN_USER.to_string(),
                },
            }],
            current_context: context,
        }
    }

    /// Serialize as YAML
    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind("kubeconfig", e.to_string()))
    }

    /// Wrap the document in the admin kubeconfig secret for `namespace`
    pub fn to_secret(&self, namespace: &str) -> Result<Secret, Error> {
        let yaml = self.to_yaml()?;
        Ok(Secret {
            metadata: ObjectMeta {
                name: Some(ADMIN_KUBECONFIG_SECRET.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                KUBECONFIG_SECRET_KEY.to_string(),
                ByteString(yaml.into_bytes()),
            )])),
            ..Default::default()
        })
    }
}
