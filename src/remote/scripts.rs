//! Shell scripts behind each remote operation
//!
//! Every script is safe to re-run: a machine whose boot configuration
//! already ran `kubeadm init` or `kubeadm join` skips the step. Arguments
//! arrive as `FOUNDRY_<KEY>` environment variables exported ahead of the
//! script body.

use super::{CommandArgs, RemoteOperation};

const INSTALL_RUNTIME: &str = r#"
if ! command -v docker >/dev/null 2>&1; then
  export DEBIAN_FRONTEND=noninteractive
  apt-get update -q
  apt-get install -y -q docker.io
fi
systemctl enable --now docker
"#;

const INSTALL_KUBERNETES: &str = r#"
: "${FOUNDRY_VERSION:?version is required}"
if ! command -v kubeadm >/dev/null 2>&1; then
  export DEBIAN_FRONTEND=noninteractive
  apt-get update -q
  apt-get install -y -q apt-transport-https ca-certificates curl
  curl -fsSL https://packages.cloud.google.com/apt/doc/apt-key.gpg | apt-key add -
  echo "deb https://apt.kubernetes.io/ kubernetes-xenial main" > /etc/apt/sources.list.d/kubernetes.list
  apt-get update -q
  apt-get install -y -q "kubelet=${FOUNDRY_VERSION}-00" "kubeadm=${FOUNDRY_VERSION}-00" "kubectl=${FOUNDRY_VERSION}-00"
  apt-mark hold kubelet kubeadm kubectl
fi
"#;

const KUBEADM_INIT: &str = r#"
: "${FOUNDRY_TOKEN:?token is required}"
: "${FOUNDRY_POD_NETWORK_CIDR:?pod network range is required}"
: "${FOUNDRY_NETWORK_MANIFEST:?network manifest is required}"
swapoff -a
if [ ! -f /etc/kubernetes/admin.conf ]; then
  kubeadm init --pod-network-cidr "${FOUNDRY_POD_NETWORK_CIDR}" --token="${FOUNDRY_TOKEN}"
  kubectl --kubeconfig /etc/kubernetes/admin.conf apply -f "${FOUNDRY_NETWORK_MANIFEST}"
fi
"#;

const CREATE_JOIN_TOKEN: &str = r#"
kubeadm token create
"#;

const KUBEADM_JOIN: &str = r#"
: "${FOUNDRY_TOKEN:?token is required}"
: "${FOUNDRY_MASTER:?master address is required}"
swapoff -a
if [ ! -f /etc/kubernetes/kubelet.conf ]; then
  kubeadm join --token "${FOUNDRY_TOKEN}" --discovery-token-unsafe-skip-ca-verification "${FOUNDRY_MASTER}:6443"
fi
"#;

const UPGRADE_MASTER: &str = r#"
: "${FOUNDRY_VERSION:?version is required}"
export DEBIAN_FRONTEND=noninteractive
apt-mark unhold kubeadm kubelet kubectl
apt-get update -q
apt-get install -y -q "kubeadm=${FOUNDRY_VERSION}-00"
kubeadm upgrade apply -y "v${FOUNDRY_VERSION}"
apt-get install -y -q "kubelet=${FOUNDRY_VERSION}-00" "kubectl=${FOUNDRY_VERSION}-00"
apt-mark hold kubeadm kubelet kubectl
systemctl daemon-reload
systemctl restart kubelet
"#;

const UPGRADE_NODE: &str = r#"
: "${FOUNDRY_VERSION:?version is required}"
: "${FOUNDRY_ADMIN_CONF:?admin kubeconfig is required}"
conf="$(mktemp)"
trap 'rm -f "$conf"' EXIT
printf '%s' "${FOUNDRY_ADMIN_CONF}" > "$conf"
node="$(hostname)"
export DEBIAN_FRONTEND=noninteractive
kubectl --kubeconfig "$conf" drain "$node" --ignore-daemonsets --delete-emptydir-data --force
apt-mark unhold kubeadm kubelet kubectl
apt-get update -q
apt-get install -y -q "kubeadm=${FOUNDRY_VERSION}-00"
kubeadm upgrade node
apt-get install -y -q "kubelet=${FOUNDRY_VERSION}-00" "kubectl=${FOUNDRY_VERSION}-00"
apt-mark hold kubeadm kubelet kubectl
systemctl daemon-reload
systemctl restart kubelet
kubectl --kubeconfig "$conf" uncordon "$node"
"#;

const DRAIN_AND_DELETE_NODE: &str = r#"
: "${FOUNDRY_ADMIN_CONF:?admin kubeconfig is required}"
conf="$(mktemp)"
trap 'rm -f "$conf"' EXIT
printf '%s' "${FOUNDRY_ADMIN_CONF}" > "$conf"
node="$(hostname)"
if kubectl --kubeconfig "$conf" get node "$node" >/dev/null 2>&1; then
  kubectl --kubeconfig "$conf" drain "$node" --ignore-daemonsets --delete-emptydir-data --force --timeout=300s
  kubectl --kubeconfig "$conf" delete node "$node" --ignore-not-found
fi
"#;

const DELETE_NODE: &str = r#"
if command -v kubeadm >/dev/null 2>&1; then
  kubeadm reset -f
fi
"#;

const FETCH_ADMIN_KUBECONFIG: &str = r#"
cat /etc/kubernetes/admin.conf
"#;

/// Script body for an operation, without argument exports
pub fn script_for(operation: RemoteOperation) -> &'static str {
    match operation {
        RemoteOperation::InstallRuntime => INSTALL_RUNTIME,
        RemoteOperation::InstallKubernetes => INSTALL_KUBERNETES,
        RemoteOperation::KubeadmInit => KUBEADM_INIT,
        RemoteOperation::CreateJoinToken => CREATE_JOIN_TOKEN,
        RemoteOperation::KubeadmJoin => KUBEADM_JOIN,
        RemoteOperation::UpgradeMaster => UPGRADE_MASTER,
        RemoteOperation::UpgradeNode => UPGRADE_NODE,
        RemoteOperation::DrainAndDeleteNode => DRAIN_AND_DELETE_NODE,
        RemoteOperation::DeleteNode => DELETE_NODE,
        RemoteOperation::FetchAdminKubeconfig => FETCH_ADMIN_KUBECONFIG,
    }
}

/// Full script fed to the remote shell: strict mode, argument exports, body
pub fn render_script(operation: RemoteOperation, args: &CommandArgs) -> String {
    let mut script = String::from("set -euo pipefail\n");
    for (key, value) in args {
        script.push_str("export ");
        script.push_str(&env_name(key));
        script.push('=');
        script.push_str(&shell_quote(value));
        script.push('\n');
    }
    script.push_str(script_for(operation));
    script
}

/// `admin.conf` becomes `FOUNDRY_ADMIN_CONF`
fn env_name(key: &str) -> String {
    let suffix: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("FOUNDRY_{suffix}")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}
