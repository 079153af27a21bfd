//! Certificate authority bundle for new control-plane machines
//!
//! A bundle is generated in memory when a control-plane machine is created:
//!
//! - a self-signed root authority
//! - a Kubernetes API authority signed by the root; kubeadm picks it up as
//!   `/etc/kubernetes/pki/ca.{crt,key}` from the boot archive
//! - an admin client certificate (`kubernetes-admin`, group
//!   `system:masters`) signed by the Kubernetes API authority, used for the
//!   generated admin kubeconfig
//!
//! The bundle is never persisted on its own; only the boot archive and the
//! kubeconfig secret outlive the create workflow.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;

/// Validity of the root and Kubernetes API authorities
const CA_VALIDITY_YEARS: i64 = 10;

/// Validity of the admin client certificate
const CLIENT_VALIDITY_YEARS: i64 = 1;

/// Common name of the admin client certificate
pub const ADMIN_USER: &str = "kubernetes-admin";

/// Group granting cluster-admin through the default RBAC bindings
pub const ADMIN_GROUP: &str = "system:masters";

/// Archive entry for the Kubernetes API authority certificate
pub const CA_CERT_ENTRY: &str = "ca.crt";

/// Archive entry for the Kubernetes API authority key
pub const CA_KEY_ENTRY: &str = "ca.key";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Building the boot archive failed
    #[error("archive error: {0}")]
    Archive(#[from] std::io::Error),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

impl From<PkiError> for crate::Error {
    fn from(err: PkiError) -> Self {
        crate::Error::certificate(err.to_string())
    }
}

/// Returns (not_before, not_after) from now for the given number of years.
fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

fn distinguished_name(common_name: &str, organization: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(organization.to_string()),
    );
    dn
}

fn ca_params(common_name: &str, organization: &str) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name, organization);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
    params.not_before = not_before;
    params.not_after = not_after;
    params
}

fn generate_key(what: &str) -> Result<KeyPair> {
    KeyPair::generate()
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate {what} key: {e}")))
}

/// A certificate and its private key, PEM encoded
#[derive(Clone)]
pub struct IssuedCertificate {
    cert_pem: String,
    key_pem: String,
}

impl IssuedCertificate {
    /// Certificate in PEM format
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Private key in PEM format
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    fn issuer(&self) -> Result<Issuer<'static, KeyPair>> {
        let key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {e}")))?;
        Issuer::from_ca_cert_pem(&self.cert_pem, key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {e}")))
    }
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"[redacted]")
            .finish()
    }
}

/// Root authority, Kubernetes API authority and admin client certificate
#[derive(Clone, Debug)]
pub struct CertificateAuthorityBundle {
    root: IssuedCertificate,
    kubernetes: IssuedCertificate,
    admin: IssuedCertificate,
}

impl CertificateAuthorityBundle {
    /// Generate a fresh bundle for `cluster_name`
    pub fn generate(cluster_name: &str) -> Result<Self> {
        let root_key = generate_key("root CA")?;
        let root_cert = ca_params(&format!("{cluster_name}-root-ca"), "Foundry")
            .self_signed(&root_key)
            .map_err(|e| {
                PkiError::CertificateGenerationFailed(format!("failed to create root CA: {e}"))
            })?;
        let root = IssuedCertificate {
            cert_pem: root_cert.pem(),
            key_pem: root_key.serialize_pem(),
        };

        let kube_key = generate_key("kubernetes CA")?;
        let kube_cert = ca_params("kubernetes", "Kubernetes")
            .signed_by(&kube_key, &root.issuer()?)
            .map_err(|e| {
                PkiError::CertificateGenerationFailed(format!(
                    "failed to sign kubernetes CA: {e}"
                ))
            })?;
        let kubernetes = IssuedCertificate {
            cert_pem: kube_cert.pem(),
            key_pem: kube_key.serialize_pem(),
        };

        let admin_key = generate_key("admin client")?;
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(ADMIN_USER, ADMIN_GROUP);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let (not_before, not_after) = compute_validity(CLIENT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;
        let admin_cert = params
            .signed_by(&admin_key, &kubernetes.issuer()?)
            .map_err(|e| {
                PkiError::CertificateGenerationFailed(format!("failed to sign admin cert: {e}"))
            })?;
        let admin = IssuedCertificate {
            cert_pem: admin_cert.pem(),
            key_pem: admin_key.serialize_pem(),
        };

        Ok(Self {
            root,
            kubernetes,
            admin,
        })
    }

    /// The self-signed root authority
    pub fn root(&self) -> &IssuedCertificate {
        &self.root
    }

    /// The Kubernetes API authority
    pub fn kubernetes(&self) -> &IssuedCertificate {
        &self.kubernetes
    }

    /// The admin client certificate
    pub fn admin(&self) -> &IssuedCertificate {
        &self.admin
    }

    /// Tar archive with `ca.crt` and `ca.key`, extracted into
    /// `/etc/kubernetes/pki` at first boot
    pub fn boot_archive(&self) -> Result<Vec<u8>> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in [
            (CA_CERT_ENTRY, self.kubernetes.cert_pem.as_bytes()),
            (CA_KEY_ENTRY, self.kubernetes.key_pem.as_bytes()),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o600);
            header.set_cksum();
            builder.append_data(&mut header, path, data)?;
        }
        Ok(builder.into_inner()?)
    }

    /// [`boot_archive`](Self::boot_archive), base64 encoded for cloud-config
    pub fn boot_archive_base64(&self) -> Result<String> {
        Ok(BASE64.encode(self.boot_archive()?))
    }
}
