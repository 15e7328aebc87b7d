use k8s_openapi::api::core::v1::ConfigMap;
use kube::{
    api::{Api, DeleteParams, PostParams},
    runtime::wait::{await_condition, conditions},
    Client, ResourceExt,
};
use kube_multicluster::{
    controller, ClusterConfig, ClusterId, Config, MultiClusterResource, MultiClusterResourceSpec,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const NAME: &str = "e2e-greeting";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("info,kube=warn"))
        .init();
    let client = Client::try_default().await?;
    let namespace = client.default_namespace().to_string();

    // The cluster under test is both the control plane and the only target
    let config = Config {
        namespace: Some(namespace.clone()),
        clusters: [(ClusterId::from("local"), ClusterConfig::default())].into(),
        ..Config::default()
    };
    let cancel = CancellationToken::new();
    let running = tokio::spawn(controller::run(client.clone(), config, cancel.clone()));

    let declarations: Api<MultiClusterResource> = Api::namespaced(client.clone(), &namespace);
    let configmaps: Api<ConfigMap> = Api::namespaced(client, &namespace);

    info!("Declaring {NAME}");
    let mcr = MultiClusterResource::new(NAME, MultiClusterResourceSpec {
        template: serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "data": {"greeting": "hello from e2e"}
        }),
        clusters: vec![ClusterId::from("local")],
    });
    declarations.create(&PostParams::default(), &mcr).await?;

    info!("Waiting for the copy to materialize");
    let materialized = await_condition(configmaps.clone(), NAME, |cm: Option<&ConfigMap>| cm.is_some());
    tokio::time::timeout(Duration::from_secs(30), materialized).await??;
    let recorded = declarations.get(NAME).await?;
    anyhow::ensure!(
        recorded.finalizers() == ["cluster.multicluster.practice.com/local"],
        "unexpected ledger {:?}",
        recorded.finalizers()
    );

    info!("Deleting {NAME}");
    let uid = recorded.uid();
    declarations.delete(NAME, &DeleteParams::background()).await?;
    let deleted = conditions::is_deleted(uid.as_deref().unwrap_or_default());
    let gone = await_condition(declarations, NAME, deleted);
    tokio::time::timeout(Duration::from_secs(30), gone).await??;
    anyhow::ensure!(configmaps.get_opt(NAME).await?.is_none(), "copy outlived its declaration");

    cancel.cancel();
    running.await??;
    info!("Converged and tore down");
    Ok(())
}
