//! Cloud-init boot configurations handed to the provisioner
//!
//! The rendered documents are consumed by the provisioner's boot mechanism
//! and by existing fixtures, so their text must stay byte-for-byte stable.

use crate::KUBE_API_PORT;

/// Pod network range passed to `kubeadm init`
pub const POD_NETWORK_CIDR: &str = "10.244.0.0/16";

/// Bootstrap token shared by the control plane and joining workers
pub const BOOTSTRAP_TOKEN: &str = "andrew.isthebestfighter";

/// Pod network add-on applied right after `kubeadm init`
pub const FLANNEL_MANIFEST_URL: &str =
    "https://raw.githubusercontent.com/coreos/flannel/master/Documentation/kube-flannel.yml";

/// Where the control-plane boot config drops the certificate archive
pub const CERT_ARCHIVE_PATH: &str = "/etc/kubernetes/pki/certs.tar";

/// Boot configuration for a control-plane machine
///
/// `cert_archive_base64` is the base64 tar produced by
/// [`CertificateAuthorityBundle::boot_archive_base64`](crate::pki::CertificateAuthorityBundle::boot_archive_base64).
pub fn control_plane_boot_config(cert_archive_base64: &str) -> String {
    format!(
        r#"#cloud-config
write_files:
 - encoding: b64
   content: {cert_archive_base64}
   owner: root:root
   path: {CERT_ARCHIVE_PATH}
   permissions: '0600'

runcmd:
 - [ sh, -c, "swapoff -a" ]
 - [ sh, -c, "tar xf {CERT_ARCHIVE_PATH} -C /etc/kubernetes/pki" ]
 - [sh, -c, "kubeadm init --pod-network-cidr {POD_NETWORK_CIDR} --token={BOOTSTRAP_TOKEN}" ]
 - [sh, -c, "kubectl --kubeconfig /etc/kubernetes/admin.conf apply -f {FLANNEL_MANIFEST_URL}" ]

output : {{ all : '| tee -a /var/log/cloud-init-output.log' }}
"#
    )
}

/// Boot configuration for a worker joining the control plane at
/// `control_plane_address`
pub fn worker_boot_config(control_plane_address: &str) -> String {
    format!(
        r#"#cloud-config
runcmd:
 - [ sh, -c, "swapoff -a" ]
 - [sh, -c, "kubeadm join --discovery-token={BOOTSTRAP_TOKEN} --discovery-token-unsafe-skip-ca-verification {control_plane_address}:{KUBE_API_PORT}" ]

output : {{ all : '| tee -a /var/log/cloud-init-output.log' }}
"#
    )
}
