use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "store-operator")]
#[command(about = "Multi-tenant store provisioning operator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity, CRD presence and helm availability
    Check,

    /// List Store resources
    List {
        /// Filter stores by owner
        #[arg(long)]
        owner: Option<String>,
    },

    /// Manage the Store CRD
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Start the store reconciliation operator
    Run,
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRD into the connected cluster
    Install,
}
