use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::agent::AgentResetOptions;
use crate::batch::BatchOptions;

#[derive(Parser, Debug)]
#[command(name = "nodesweep", version, about = "Fleet node inspection orchestrator")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Run the full inspection across every host in the hosts file.
    Batch(BatchArgs),
    /// Move the node agent from its container into a systemd service and
    /// wait for it to come back up. Runs on the node itself.
    AgentReset(AgentResetArgs),
}

#[derive(Args, Debug)]
pub(crate) struct BatchArgs {
    /// Hosts file listing the fleet (YAML).
    #[arg(long, short = 'f', default_value = "nodes.yaml")]
    pub(crate) file: PathBuf,
    /// Base URL of the binary repository, e.g. http://repo.local/files/
    #[arg(long)]
    pub(crate) http_repo: String,
    /// Agent version to install on the nodes.
    #[arg(long, short = 'v')]
    pub(crate) kube_version: String,
    /// Container runtime on the nodes: docker or containerd.
    #[arg(long, short = 'r', default_value = "docker")]
    pub(crate) runtime: String,
}

#[derive(Args, Debug)]
pub(crate) struct AgentResetArgs {
    #[arg(long)]
    pub(crate) http_repo: String,
    #[arg(long, short = 'v')]
    pub(crate) kube_version: String,
    #[arg(long, short = 'r', default_value = "docker")]
    pub(crate) runtime: String,
    /// Overall deadline for the agent service to reach running, in minutes.
    #[arg(long, default_value_t = 10)]
    pub(crate) timeout: u64,
}

impl BatchArgs {
    pub(crate) fn into_options(self) -> BatchOptions {
        BatchOptions {
            file: self.file,
            http_repo: self.http_repo,
            kube_version: self.kube_version,
            runtime: self.runtime,
        }
    }
}

impl AgentResetArgs {
    pub(crate) fn into_options(self) -> AgentResetOptions {
        AgentResetOptions {
            http_repo: self.http_repo,
            kube_version: self.kube_version,
            runtime: self.runtime,
            timeout_minutes: self.timeout,
        }
    }
}
