//! Shared setup for the kind integration tests

use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, CustomResourceExt};

use foundry::crd::{FoundryCluster, FoundryMachine};

const FIELD_MANAGER: &str = "foundry-integration-test";

/// Connect to the current cluster and make sure the Foundry CRDs are served
pub async fn ensure_test_cluster() -> Result<Client, String> {
    let client = Client::try_default()
        .await
        .map_err(|e| format!("no reachable cluster: {e}"))?;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    for crd in [FoundryCluster::crd(), FoundryMachine::crd()] {
        let name = crd.metadata.name.clone().unwrap_or_default();
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| format!("failed to apply CRD {name}: {e}"))?;
        wait_established(&crds, &name).await?;
    }

    Ok(client)
}

async fn wait_established(crds: &Api<CustomResourceDefinition>, name: &str) -> Result<(), String> {
    for _ in 0..30 {
        let crd = crds
            .get(name)
            .await
            .map_err(|e| format!("failed to read CRD {name}: {e}"))?;
        let established = crd
            .status
            .and_then(|s| s.conditions)
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Established" && c.status == "True");
        if established {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Err(format!("CRD {name} never became established"))
}

/// Create `name` if it does not exist yet
pub async fn ensure_namespace(client: &Client, name: &str) {
    let api: Api<Namespace> = Api::all(client.clone());
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let _ = api.create(&PostParams::default(), &namespace).await;
}
