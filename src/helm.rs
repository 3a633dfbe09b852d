use std::collections::BTreeMap;
use std::process::Output;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams};
use kube::Client;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::error::{Error, Result};

/// Max chars of subprocess output reproduced in logs and errors.
const LOG_CLIP: usize = 800;
const ERROR_CLIP: usize = 500;

/* ============================= RELEASE STATUS ============================= */

/// Helm release status as reported by `helm status -o json` (`info.status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    NotInstalled,
    Deployed,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
    Failed,
    Unknown,
}

impl ReleaseStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "deployed" => ReleaseStatus::Deployed,
            "pending-install" => ReleaseStatus::PendingInstall,
            "pending-upgrade" => ReleaseStatus::PendingUpgrade,
            "pending-rollback" => ReleaseStatus::PendingRollback,
            "failed" => ReleaseStatus::Failed,
            _ => ReleaseStatus::Unknown,
        }
    }

    /// Stuck releases block both install and upgrade; they must be
    /// force-removed before a fresh install can proceed.
    pub fn is_stuck(self) -> bool {
        matches!(
            self,
            ReleaseStatus::PendingInstall
                | ReleaseStatus::PendingUpgrade
                | ReleaseStatus::PendingRollback
                | ReleaseStatus::Failed
        )
    }
}

/* ============================= INSTALL PLAN ============================= */

/// What `install` will actually do for a release in a given status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallAction {
    /// Force-clean the stuck release, then fresh install.
    CleanupThenInstall,
    Upgrade,
    Install,
}

pub fn plan_install(status: ReleaseStatus) -> InstallAction {
    if status.is_stuck() {
        InstallAction::CleanupThenInstall
    } else if status == ReleaseStatus::Deployed {
        InstallAction::Upgrade
    } else {
        InstallAction::Install
    }
}

/* ============================= ARGUMENT BUILDERS ============================= */

fn set_args(values: &BTreeMap<String, String>) -> Vec<String> {
    let mut args = Vec::with_capacity(values.len() * 2);
    for (k, v) in values {
        args.push("--set".to_string());
        args.push(format!("{k}={v}"));
    }
    args
}

fn install_args(
    release: &str,
    namespace: &str,
    chart_path: &str,
    timeout: Duration,
    values: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut args = vec![
        "install".to_string(),
        release.to_string(),
        chart_path.to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "--create-namespace".to_string(),
        "--timeout".to_string(),
        format!("{}s", timeout.as_secs()),
    ];
    args.extend(set_args(values));
    args
}

fn upgrade_args(
    release: &str,
    namespace: &str,
    chart_path: &str,
    timeout: Duration,
    values: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        release.to_string(),
        chart_path.to_string(),
        "-n".to_string(),
        namespace.to_string(),
        "--timeout".to_string(),
        format!("{}s", timeout.as_secs()),
    ];
    args.extend(set_args(values));
    args
}

fn clip(s: &str, max_chars: usize) -> String {
    crate::status::truncate(s, max_chars)
}

/* ============================= INSTALLER ============================= */

/// Thin wrapper around the `helm` CLI.
///
/// Never blocks on pod readiness (`--wait` is deliberately absent); the
/// reconciler's own readiness gates handle waiting with proper backoff.
#[derive(Clone)]
pub struct Helm {
    chart_path: String,
    timeout: Duration,
    client: Client,
}

impl Helm {
    pub fn new(client: Client, config: &OperatorConfig) -> Self {
        Self {
            chart_path: config.helm_chart_path.clone(),
            timeout: config.provision_timeout,
            client,
        }
    }

    /// Run a helm command under a hard wall-clock timeout.
    async fn run(&self, args: &[String]) -> Result<Output> {
        info!(cmd = %format!("helm {}", args.join(" ")), "helm_exec");

        let child = Command::new("helm")
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::Fatal(format!("helm spawn failed: {e}"))),
            Err(_) => {
                return Err(Error::Transient(format!(
                    "helm {} timed out after {}s",
                    args.first().map(String::as_str).unwrap_or(""),
                    self.timeout.as_secs()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.is_empty() {
            debug!(stdout = %clip(&stdout, LOG_CLIP), "helm_stdout");
        }
        if !stderr.is_empty() {
            warn!(stderr = %clip(&stderr, LOG_CLIP), "helm_stderr");
        }

        Ok(output)
    }

    /// Status of a release. A non-zero exit means the release is not
    /// installed; unparseable JSON maps to `Unknown`.
    pub async fn status(&self, release: &str, namespace: &str) -> Result<ReleaseStatus> {
        let args: Vec<String> = ["status", release, "-n", namespace, "-o", "json"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Ok(ReleaseStatus::NotInstalled);
        }
        let parsed: serde_json::Value = match serde_json::from_slice(&output.stdout) {
            Ok(v) => v,
            Err(_) => return Ok(ReleaseStatus::Unknown),
        };
        let status = parsed
            .pointer("/info/status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        Ok(ReleaseStatus::parse(status))
    }

    /// Install or upgrade a release.
    ///
    /// Composite policy: a stuck release is force-cleaned and freshly
    /// installed; a deployed release is upgraded; anything else is a
    /// fresh install with `--create-namespace`.
    pub async fn install(
        &self,
        release: &str,
        namespace: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<()> {
        let status = self.status(release, namespace).await?;

        let action = plan_install(status);
        if action == InstallAction::CleanupThenInstall {
            warn!(%release, %namespace, ?status, "helm_release_stuck");
            self.cleanup_stuck(release, namespace).await;
        }

        let args = if action == InstallAction::Upgrade {
            info!(%release, %namespace, "helm_upgrade");
            upgrade_args(release, namespace, &self.chart_path, self.timeout, values)
        } else {
            info!(%release, %namespace, "helm_install");
            install_args(release, namespace, &self.chart_path, self.timeout, values)
        };

        let output = self.run(&args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Fatal(format!(
                "helm {} failed (rc={}): {}",
                args[0],
                output.status.code().unwrap_or(-1),
                clip(&stderr, ERROR_CLIP)
            )));
        }
        Ok(())
    }

    /// Uninstall a release. A missing release is success.
    pub async fn uninstall(&self, release: &str, namespace: &str) -> Result<()> {
        if self.status(release, namespace).await? == ReleaseStatus::NotInstalled {
            info!(%release, %namespace, "helm_release_absent_skip_uninstall");
            return Ok(());
        }
        let args: Vec<String> = ["uninstall", release, "-n", namespace]
            .iter()
            .map(|s| s.to_string())
            .collect();
        // Exit code is ignored: a release torn down by a concurrent path
        // is equivalent to success here.
        let _ = self.run(&args).await?;
        info!(%release, %namespace, "helm_release_uninstalled");
        Ok(())
    }

    /// Force-remove a stuck release so a fresh install can proceed:
    /// best-effort `uninstall --no-hooks`, then deletion of any residual
    /// release-tracking secrets.
    pub async fn cleanup_stuck(&self, release: &str, namespace: &str) {
        warn!(%release, %namespace, "helm_cleanup_stuck");

        let args: Vec<String> = ["uninstall", release, "-n", namespace, "--no-hooks"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Err(e) = self.run(&args).await {
            warn!(error = %e, "helm_cleanup_uninstall_failed");
        }

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let selector = format!("owner=helm,name={release}");
        match secrets.list(&ListParams::default().labels(&selector)).await {
            Ok(list) => {
                for secret in list.items {
                    let name = secret.metadata.name.unwrap_or_default();
                    match secrets.delete(&name, &DeleteParams::default()).await {
                        Ok(_) => info!(secret = %name, "helm_stuck_secret_deleted"),
                        Err(e) => warn!(secret = %name, error = %e, "helm_stuck_secret_delete_failed"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "helm_stuck_secret_list_failed"),
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_statuses() {
        assert_eq!(ReleaseStatus::parse("deployed"), ReleaseStatus::Deployed);
        assert_eq!(
            ReleaseStatus::parse("pending-install"),
            ReleaseStatus::PendingInstall
        );
        assert_eq!(
            ReleaseStatus::parse("pending-upgrade"),
            ReleaseStatus::PendingUpgrade
        );
        assert_eq!(
            ReleaseStatus::parse("pending-rollback"),
            ReleaseStatus::PendingRollback
        );
        assert_eq!(ReleaseStatus::parse("failed"), ReleaseStatus::Failed);
    }

    #[test]
    fn test_parse_unknown_status() {
        assert_eq!(ReleaseStatus::parse("superseded"), ReleaseStatus::Unknown);
        assert_eq!(ReleaseStatus::parse(""), ReleaseStatus::Unknown);
    }

    #[test]
    fn test_stuck_set() {
        assert!(ReleaseStatus::PendingInstall.is_stuck());
        assert!(ReleaseStatus::PendingUpgrade.is_stuck());
        assert!(ReleaseStatus::PendingRollback.is_stuck());
        assert!(ReleaseStatus::Failed.is_stuck());
        assert!(!ReleaseStatus::Deployed.is_stuck());
        assert!(!ReleaseStatus::NotInstalled.is_stuck());
        assert!(!ReleaseStatus::Unknown.is_stuck());
    }

    #[test]
    fn test_status_json_extraction() {
        let body = r#"{"name":"store-demo","info":{"status":"pending-install"}}"#;
        let parsed: serde_json::Value = serde_json::from_str(body).expect("valid json");
        let status = parsed
            .pointer("/info/status")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_eq!(ReleaseStatus::parse(status), ReleaseStatus::PendingInstall);
    }

    #[test]
    fn test_plan_stuck_statuses_cleanup_first() {
        for status in [
            ReleaseStatus::PendingInstall,
            ReleaseStatus::PendingUpgrade,
            ReleaseStatus::PendingRollback,
            ReleaseStatus::Failed,
        ] {
            assert_eq!(plan_install(status), InstallAction::CleanupThenInstall);
        }
    }

    #[test]
    fn test_plan_deployed_upgrades() {
        assert_eq!(plan_install(ReleaseStatus::Deployed), InstallAction::Upgrade);
    }

    #[test]
    fn test_plan_fresh_install_otherwise() {
        assert_eq!(
            plan_install(ReleaseStatus::NotInstalled),
            InstallAction::Install
        );
        assert_eq!(plan_install(ReleaseStatus::Unknown), InstallAction::Install);
    }

    #[test]
    fn test_set_args_are_sorted_pairs() {
        let values = BTreeMap::from([
            ("storeName".to_string(), "demo".to_string()),
            ("ingress.host".to_string(), "demo.local.urumi".to_string()),
        ]);
        let args = set_args(&values);
        assert_eq!(
            args,
            vec![
                "--set",
                "ingress.host=demo.local.urumi",
                "--set",
                "storeName=demo",
            ]
        );
    }

    #[test]
    fn test_install_args_create_namespace_and_timeout() {
        let values = BTreeMap::from([("storeName".to_string(), "demo".to_string())]);
        let args = install_args(
            "store-demo",
            "store-demo",
            "/charts/store-medusa",
            Duration::from_secs(300),
            &values,
        );
        assert_eq!(args[0], "install");
        assert!(args.contains(&"--create-namespace".to_string()));
        assert!(args.contains(&"300s".to_string()));
        assert!(args.contains(&"storeName=demo".to_string()));
    }

    #[test]
    fn test_upgrade_args_have_no_create_namespace() {
        let values = BTreeMap::new();
        let args = upgrade_args(
            "store-demo",
            "store-demo",
            "/charts/store-medusa",
            Duration::from_secs(300),
            &values,
        );
        assert_eq!(args[0], "upgrade");
        assert!(!args.contains(&"--create-namespace".to_string()));
    }
}
