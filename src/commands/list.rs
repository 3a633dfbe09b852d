use anyhow::Context;
use kube::api::ListParams;
use kube::{Api, Client};

use store_operator::crd::{Store, StorePhase};

pub async fn run(owner: Option<String>) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster. Is your kubeconfig valid?")?;

    let stores: Api<Store> = Api::all(client);

    let store_list = stores
        .list(&ListParams::default())
        .await
        .context("Failed to list stores. Is the Store CRD installed?")?;

    let mut rows: Vec<(String, String, String, StorePhase, String)> = store_list
        .into_iter()
        .filter(|s| owner.as_deref().is_none_or(|o| s.spec.owner == o))
        .map(|s| {
            let name = s.metadata.name.clone().unwrap_or_default();
            let engine = s.spec.engine.to_string();
            let store_owner = s.spec.owner.clone();
            let phase = s.phase();
            let url = s
                .status
                .as_ref()
                .and_then(|st| st.url.as_deref())
                .unwrap_or("-")
                .to_string();
            (name, engine, store_owner, phase, url)
        })
        .collect();

    rows.sort_by(|a, b| a.0.cmp(&b.0));

    println!(
        "{:<25} {:<14} {:<20} {:<14} {:<40}",
        "NAME", "ENGINE", "OWNER", "PHASE", "URL"
    );
    println!("{}", "-".repeat(113));

    for (name, engine, store_owner, phase, url) in &rows {
        println!(
            "{:<25} {:<14} {:<20} {:<14} {:<40}",
            name, engine, store_owner, phase, url
        );
    }

    let ready = rows
        .iter()
        .filter(|(_, _, _, phase, _)| *phase == StorePhase::Ready)
        .count();
    let failed = rows
        .iter()
        .filter(|(_, _, _, phase, _)| *phase == StorePhase::Failed)
        .count();
    println!(
        "\nTotal: {} stores ({} Ready, {} Failed)",
        rows.len(),
        ready,
        failed
    );

    Ok(())
}
