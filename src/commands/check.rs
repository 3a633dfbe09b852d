use kube::api::ListParams;
use kube::{Api, Client};
use tokio::process::Command;

use store_operator::crd::Store;

pub async fn run() -> anyhow::Result<()> {
    println!("Running operator preflight checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    print!("  Cluster connection .......... ");
    let version = match client.apiserver_version().await {
        Ok(v) => {
            println!("OK (v{}.{})", v.major, v.minor);
            Some(v)
        }
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    };

    // 3. Store CRD installed and queryable
    print!("  Store CRD ................... ");
    let stores: Api<Store> = Api::all(client.clone());
    match stores.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => {
            println!("FAIL ({})", e);
            println!("  Hint:  Install it with: store-operator crd install");
        }
    }

    // 4. List namespaces permission
    print!("  List namespaces permission .. ");
    let namespaces: Api<k8s_openapi::api::core::v1::Namespace> = Api::all(client.clone());
    match namespaces.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    // 5. Helm binary on PATH
    print!("  Helm binary ................. ");
    match Command::new("helm").args(["version", "--short"]).output().await {
        Ok(output) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout);
            println!("OK ({})", version.trim());
        }
        Ok(output) => println!("FAIL (rc={})", output.status.code().unwrap_or(-1)),
        Err(e) => println!("FAIL ({})", e),
    }

    if let Some(v) = version {
        println!("\n  Kubernetes version: {}.{}", v.major, v.minor);
    }

    println!("\nAll checks completed.");
    Ok(())
}
