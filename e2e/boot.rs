use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::wait::{await_condition, conditions},
    Client, CustomResourceExt, ResourceExt,
};
use kube_multicluster::MultiClusterResource;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    let crd = MultiClusterResource::crd();
    let name = crd.name_any();
    info!("Installing {name}");
    crds.patch(&name, &PatchParams::apply("e2e").force(), &Patch::Apply(&crd))
        .await?;

    let established = await_condition(crds, &name, conditions::is_crd_established());
    let _ = tokio::time::timeout(std::time::Duration::from_secs(10), established).await?;
    info!("{name} established");
    Ok(())
}
