//! stormctl - CLI for a storage cluster's management API.
//!
//! Usage:
//!   stormctl --endpoints 10.0.0.1:443,10.0.0.2:443 ping
//!   stormctl --endpoints ... volume create pvc-1 --capacity 1073741824
//!   stormctl --endpoints ... volume set-acl <uuid> host-A host-B
//!   stormctl --endpoints ... snapshot create snap-1 --volume <uuid>

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use stormgmt::{
    ACL_ALLOW_NONE, CallContext, Client, ClientPool, Config, EndpointSet, MgmtScheme, VolumeSpec,
    VolumeUpdate,
};

#[derive(Parser)]
#[command(name = "stormctl")]
#[command(about = "Manage volumes and snapshots on a storage cluster")]
struct Cli {
    /// Comma-separated management endpoints (host:port)
    #[arg(short, long, env = "STORMCTL_ENDPOINTS")]
    endpoints: String,

    /// Transport scheme: grpc or grpcs
    #[arg(long, default_value = "grpcs")]
    scheme: MgmtScheme,

    /// Project the resources belong to
    #[arg(short, long, default_value = "")]
    project: String,

    /// Bearer token sent with every call
    #[arg(long, env = "STORMCTL_JWT", hide_env_values = true)]
    jwt: Option<String>,

    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overall deadline for the command
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the cluster speaks a supported API version
    Ping,
    /// Show cluster information
    ClusterInfo,
    /// List cluster nodes
    Nodes,
    /// Volume management
    Volume {
        #[command(subcommand)]
        command: VolumeCommands,
    },
    /// Snapshot management
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommands,
    },
}

#[derive(Subcommand)]
enum VolumeCommands {
    /// Get a volume by UUID or name
    Get { volume: String },
    /// Create a volume (or adopt an identical existing one)
    Create {
        name: String,
        /// Capacity in bytes
        #[arg(long)]
        capacity: u64,
        #[arg(long, default_value_t = 1)]
        replicas: u32,
        #[arg(long)]
        compression: bool,
        /// Hosts allowed to access the volume
        #[arg(long = "acl")]
        acl: Vec<String>,
        /// Create from this snapshot
        #[arg(long)]
        snapshot: Option<Uuid>,
        /// Return without waiting for the volume to become available
        #[arg(long)]
        no_wait: bool,
    },
    /// Delete a volume
    Delete {
        uuid: Uuid,
        #[arg(long)]
        no_wait: bool,
    },
    /// Replace a volume's ACL
    SetAcl { uuid: Uuid, hosts: Vec<String> },
    /// Grow a volume
    Expand {
        uuid: Uuid,
        /// New capacity in bytes
        capacity: u64,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Get a snapshot by UUID or name
    Get { snapshot: String },
    /// Snapshot a volume
    Create {
        name: String,
        /// Source volume UUID
        #[arg(long)]
        volume: Uuid,
        #[arg(long)]
        no_wait: bool,
    },
    /// Delete a snapshot
    Delete {
        uuid: Uuid,
        #[arg(long)]
        no_wait: bool,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[derive(Serialize)]
struct Done {
    ok: bool,
}

async fn run_volume(
    client: &Client,
    ctx: &CallContext,
    project: &str,
    command: VolumeCommands,
) -> Result<()> {
    match command {
        VolumeCommands::Get { volume } => {
            let vol = match volume.parse::<Uuid>() {
                Ok(uuid) => client.get_volume(ctx, uuid, project).await?,
                Err(_) => client.get_volume_by_name(ctx, &volume, project).await?,
            };
            print_json(&vol)
        }
        VolumeCommands::Create {
            name,
            capacity,
            replicas,
            compression,
            acl,
            snapshot,
            no_wait,
        } => {
            let spec = VolumeSpec {
                name,
                capacity,
                replica_count: replicas,
                compression,
                acl,
                project_name: project.to_string(),
                snapshot_uuid: snapshot,
            };
            let vol = client.create_volume(ctx, &spec, !no_wait).await?;
            print_json(&vol)
        }
        VolumeCommands::Delete { uuid, no_wait } => {
            client.delete_volume(ctx, uuid, project, !no_wait).await?;
            print_json(&Done { ok: true })
        }
        VolumeCommands::SetAcl { uuid, hosts } => {
            let mut wanted = stormgmt::types::normalize_acl(&hosts);
            if wanted.is_empty() {
                wanted.push(ACL_ALLOW_NONE.to_string());
            }
            let vol = client
                .update_volume(ctx, uuid, project, |vol| {
                    if vol.acl == wanted {
                        return Ok(None);
                    }
                    Ok(Some(VolumeUpdate {
                        acl: Some(wanted.clone()),
                        ..Default::default()
                    }))
                })
                .await?;
            print_json(&vol)
        }
        VolumeCommands::Expand { uuid, capacity } => {
            let vol = client
                .update_volume(ctx, uuid, project, |vol| {
                    if vol.capacity > capacity {
                        return Err(stormgmt::Error::InvalidArgument(format!(
                            "volume '{}' is already larger than {capacity} bytes",
                            vol.name
                        )));
                    }
                    if vol.capacity == capacity {
                        return Ok(None);
                    }
                    Ok(Some(VolumeUpdate {
                        capacity: Some(capacity),
                        ..Default::default()
                    }))
                })
                .await?;
            print_json(&vol)
        }
    }
}

async fn run_snapshot(
    client: &Client,
    ctx: &CallContext,
    project: &str,
    command: SnapshotCommands,
) -> Result<()> {
    match command {
        SnapshotCommands::Get { snapshot } => {
            let snap = match snapshot.parse::<Uuid>() {
                Ok(uuid) => client.get_snapshot(ctx, uuid, project).await?,
                Err(_) => client.get_snapshot_by_name(ctx, &snapshot, project).await?,
            };
            print_json(&snap)
        }
        SnapshotCommands::Create {
            name,
            volume,
            no_wait,
        } => {
            let snap = client
                .create_snapshot(ctx, &name, project, volume, !no_wait)
                .await?;
            print_json(&snap)
        }
        SnapshotCommands::Delete { uuid, no_wait } => {
            client.delete_snapshot(ctx, uuid, project, !no_wait).await?;
            print_json(&Done { ok: true })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match cli.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };
    let targets = EndpointSet::parse_csv(&cli.endpoints)
        .with_context(|| format!("Invalid endpoints '{}'", cli.endpoints))?;
    if targets.is_empty() {
        bail!("no endpoints given");
    }

    let mut ctx = CallContext::background().with_timeout(Duration::from_secs(cli.timeout_secs));
    if let Some(jwt) = cli.jwt.as_deref() {
        ctx = ctx.with_credentials(jwt);
    }

    let pool = ClientPool::new((&config.pool).into(), Client::dialer(&config));
    debug!(targets = %targets, scheme = %cli.scheme, "connecting");
    let result = async {
        let client = pool
            .lease(&ctx, &targets, cli.scheme)
            .await
            .with_context(|| format!("Failed to connect to {targets}"))?;
        info!(client_id = %client.id(), "connected");

        match cli.command {
            Commands::Ping => {
                client.remote_ok(&ctx).await?;
                print_json(&Done { ok: true })
            }
            Commands::ClusterInfo => print_json(&client.get_cluster_info(&ctx).await?),
            Commands::Nodes => print_json(&client.list_nodes(&ctx).await?),
            Commands::Volume { command } => run_volume(&client, &ctx, &cli.project, command).await,
            Commands::Snapshot { command } => {
                run_snapshot(&client, &ctx, &cli.project, command).await
            }
        }
    }
    .await;
    pool.close().await;
    result
}
