mod commands;
mod connect;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use fleetlab_backend::{Arch, GroupKind, GroupName, NodeSelector};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleetlab")]
#[command(about = "Short-lived Aerospike clusters and client machines on Docker, AWS or GCP", long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List clusters, clients, templates and provider resources
    Inventory {
        /// Only resources owned by this user
        #[arg(long)]
        owner: Option<String>,
        /// Comma-separated items (clusters,clients,templates,firewalls,subnets,volumes,expiry)
        #[arg(long, value_delimiter = ',')]
        items: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// Manage database clusters
    #[command(subcommand)]
    Cluster(GroupCommands),
    /// Manage client groups
    #[command(subcommand)]
    Client(GroupCommands),
    /// Open a shell on one node, or run a command on the selected nodes
    Attach {
        #[arg(short = 'n', long)]
        name: GroupName,
        /// Node selector
        #[arg(short = 'l', long = "nodes", default_value = "1")]
        nodes: NodeSelector,
        /// Attach to a client group instead of a cluster
        #[arg(long)]
        client: bool,
        /// Command to run (after --); a login shell when omitted
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Run a command on every selected node in parallel
    Exec {
        #[arg(short = 'n', long)]
        name: GroupName,
        /// Node selector, e.g. 1-3,5 or ALL
        #[arg(short = 'l', long = "nodes", default_value = "ALL")]
        nodes: NodeSelector,
        #[arg(long)]
        client: bool,
        /// Nodes to work on at once
        #[arg(long)]
        threads: Option<usize>,
        /// Command to run (after --)
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Copy files to nodes
    #[command(subcommand)]
    Files(FilesCommands),
    /// Scheduled removal of expired nodes
    #[command(subcommand)]
    Expiry(ExpiryCommands),
    /// Manage golden images
    #[command(subcommand)]
    Template(TemplateCommands),
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum GroupCommands {
    /// Create a new group
    Create(CreateArgs),
    /// Add nodes to an existing group
    Grow(CreateArgs),
    /// List groups and their nodes
    List {
        /// Only this group
        #[arg(short = 'n', long)]
        name: Option<GroupName>,
        #[arg(long)]
        json: bool,
    },
    /// Start stopped nodes
    Start(SelectArgs),
    /// Stop running nodes
    Stop(SelectArgs),
    /// Remove nodes
    Destroy {
        #[command(flatten)]
        select: SelectArgs,
        /// Also remove running nodes
        #[arg(short, long)]
        force: bool,
    },
    /// Change when nodes expire
    Expire {
        #[command(flatten)]
        select: SelectArgs,
        /// Time to live from now, e.g. 30h or 2d; 0 never expires
        #[arg(long)]
        expire: String,
    },
    /// Set a user label on every node of the group
    Label {
        #[arg(short = 'n', long)]
        name: GroupName,
        key: String,
        value: String,
    },
    /// Print node addresses
    Ips {
        #[arg(short = 'n', long)]
        name: GroupName,
        /// Private addresses instead of public ones
        #[arg(short, long)]
        internal: bool,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct SelectArgs {
    #[arg(short = 'n', long)]
    name: GroupName,
    /// Node selector, e.g. 1-3,5 or ALL
    #[arg(short = 'l', long = "nodes", default_value = "ALL")]
    nodes: NodeSelector,
}

#[derive(Args)]
struct CreateArgs {
    #[arg(short = 'n', long)]
    name: GroupName,
    #[arg(short = 'c', long, default_value_t = 1)]
    count: u32,
    #[arg(long, default_value = "ubuntu")]
    distro: String,
    #[arg(long, default_value = "24.04")]
    distro_version: String,
    /// Aerospike version of the cluster template
    #[arg(long = "version", default_value = "latest")]
    aerospike_version: String,
    /// Defaults to the architecture of the instance type
    #[arg(long)]
    arch: Option<Arch>,
    /// Time to live, e.g. 30h; the group's expiry is kept when growing
    #[arg(long)]
    expire: Option<String>,
    /// Instance (AWS) or machine (GCP) type
    #[arg(long)]
    instance_type: Option<String>,
    /// Container image (Docker) or AMI (AWS) override
    #[arg(long)]
    image: Option<String>,
    /// Docker network, AWS subnet id or GCP subnet
    #[arg(long)]
    network: Option<String>,
    /// Security groups (AWS) or network tags (GCP)
    #[arg(long, value_delimiter = ',')]
    firewall: Vec<String>,
    /// Root disk size in GB
    #[arg(long)]
    disk_size: Option<u32>,
    /// Spot or preemptible capacity
    #[arg(long)]
    spot: bool,
    /// Client software installed on the group (clients only)
    #[arg(long)]
    client_type: Option<String>,
    /// Comma-separated feature names
    #[arg(long, value_delimiter = ',')]
    features: Vec<String>,
    /// Extra key=value tags
    #[arg(short = 't', long = "tag")]
    tags: Vec<String>,
}

#[derive(Subcommand)]
enum FilesCommands {
    /// Upload one local file to the selected nodes
    Upload {
        #[arg(short = 'n', long)]
        name: GroupName,
        #[arg(short = 'l', long = "nodes", default_value = "ALL")]
        nodes: NodeSelector,
        #[arg(long)]
        client: bool,
        local: PathBuf,
        remote: String,
    },
    /// Download one remote file from the selected nodes. With several
    /// nodes, each copy goes to LOCAL/<node>/
    Download {
        #[arg(short = 'n', long)]
        name: GroupName,
        #[arg(short = 'l', long = "nodes", default_value = "ALL")]
        nodes: NodeSelector,
        #[arg(long)]
        client: bool,
        remote: String,
        local: PathBuf,
    },
}

#[derive(Subcommand)]
enum ExpiryCommands {
    /// Show the installed expiry system
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Install the provider's scheduled cleanup
    Install {
        #[arg(long)]
        region: Option<String>,
        /// Minutes between runs (configuration default when omitted)
        #[arg(long)]
        frequency: Option<u32>,
        /// Function package or source directory
        #[arg(long)]
        source: Option<PathBuf>,
    },
    /// Remove the scheduled cleanup
    Remove {
        #[arg(long)]
        region: Option<String>,
    },
    /// Change how often the cleanup runs
    Frequency {
        /// Minutes between runs
        minutes: u32,
    },
    /// Remove expired nodes now
    Run {
        /// Only report what would be removed
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// List templates
    List {
        #[arg(long)]
        json: bool,
    },
    /// Build a template from a base image and an install script
    Create {
        #[command(flatten)]
        key: TemplateArgs,
        /// Shell script run as root on the builder
        #[arg(long)]
        script: PathBuf,
        /// Base image override
        #[arg(long)]
        base_image: Option<String>,
        /// Builder instance type
        #[arg(long)]
        instance_type: Option<String>,
    },
    /// Remove a template
    Destroy {
        #[command(flatten)]
        key: TemplateArgs,
    },
}

#[derive(Args)]
struct TemplateArgs {
    #[arg(long, default_value = "ubuntu")]
    distro: String,
    #[arg(long, default_value = "24.04")]
    distro_version: String,
    /// Aerospike version, or "client" for client templates
    #[arg(long = "version")]
    aerospike_version: String,
    #[arg(long, default_value = "amd64")]
    arch: Arch,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    match run(cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands) -> anyhow::Result<()> {
    // no configuration needed
    let command = match command {
        Commands::Version => {
            println!("fleetlab {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        command => command,
    };

    let config = fleetlab_config::load()?;
    if let Some(source) = &config.source {
        tracing::debug!(path = %source.display(), "configuration loaded");
    }
    let fleet = connect::open(&config).await?;

    match command {
        Commands::Inventory { owner, items, json } => {
            commands::inventory::handle(&fleet, owner, &items, json).await?;
        }
        Commands::Cluster(cmd) => commands::group::handle(&fleet, GroupKind::Cluster, cmd).await?,
        Commands::Client(cmd) => commands::group::handle(&fleet, GroupKind::Client, cmd).await?,
        Commands::Attach {
            name,
            nodes,
            client,
            command,
        } => {
            commands::attach::handle(&fleet, group_kind(client), name, &nodes, command).await?;
        }
        Commands::Exec {
            name,
            nodes,
            client,
            threads,
            command,
        } => {
            commands::exec::handle(&fleet, group_kind(client), name, &nodes, threads, command)
                .await?;
        }
        Commands::Files(FilesCommands::Upload {
            name,
            nodes,
            client,
            local,
            remote,
        }) => {
            commands::files::upload(&fleet, group_kind(client), name, &nodes, &local, remote)
                .await?;
        }
        Commands::Files(FilesCommands::Download {
            name,
            nodes,
            client,
            remote,
            local,
        }) => {
            commands::files::download(&fleet, group_kind(client), name, &nodes, &remote, &local)
                .await?;
        }
        Commands::Expiry(cmd) => commands::expiry::handle(&fleet, &config, cmd).await?,
        Commands::Template(cmd) => commands::template::handle(&fleet, cmd).await?,
        Commands::Version => {}
    }

    Ok(())
}

fn group_kind(client: bool) -> GroupKind {
    if client {
        GroupKind::Client
    } else {
        GroupKind::Cluster
    }
}
