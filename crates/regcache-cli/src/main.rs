//! # regcache CLI Entry Point
//!
//! ## Usage
//!
//! ```bash
//! # Register two endpoints and keep them registered until SIGTERM
//! regcache serve -s orders -a ws://10.0.0.5:9090 -a 10.0.0.6:9090 -m version=v2
//!
//! # List endpoints of a service in one zone
//! regcache list -n orders --zone UNZONE
//!
//! # Pick one endpoint, honoring the `weight` metadata
//! regcache select -n orders -t ws --weighted
//!
//! # Aggregated health as JSON
//! regcache health -n orders
//!
//! # Remove one endpoint
//! regcache deregister -s orders -a 10.0.0.5:9090
//!
//! # Register this machine's advertised host on port 9090
//! regcache serve -s orders -a :9090
//!
//! # Catalog: every service, or one service's nodes filtered by tag
//! regcache catalog
//! regcache catalog -n orders -t ws
//! ```

use anyhow::Result;
use argh::FromArgs;
use regcache_common::{ConsulAgentClient, RegcacheError, RegistryConfig};
use regcache_core::{Discovery, HealthTarget, DEFAULT_HEALTHY};

/// Main CLI structure parsed from command-line arguments.
#[derive(FromArgs)]
/// regcache - service registry cache and instance selector
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    List(ListArgs),
    Select(SelectArgs),
    Health(HealthArgs),
    Deregister(DeregisterArgs),
    Catalog(CatalogArgs),
}

/// Arguments for registering and holding endpoints.
///
/// Binds the default health endpoint, registers every address, then waits
/// for SIGTERM, SIGINT or SIGQUIT and deregisters them before exiting.
#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// register endpoints and deregister them on shutdown
struct ServeArgs {
    /// service name to register under
    #[argh(option, short = 's')]
    service: String,

    /// address to register, as a URL (ws://10.0.0.5:9090), host:port, or
    /// :port for this machine's advertised host
    ///
    /// Can be specified multiple times.
    #[argh(option, short = 'a', long = "addr")]
    addresses: Vec<String>,

    /// health check URL the registry polls
    ///
    /// Defaults to "default-healthy", which uses this process's own
    /// /ping endpoint.
    #[argh(option, long = "health-url", default = "DEFAULT_HEALTHY.into()")]
    health_url: String,

    /// extra metadata as key=value; can be repeated
    #[argh(option, short = 'm', long = "meta")]
    meta: Vec<String>,
}

/// Arguments for listing endpoints.
#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
/// print matching endpoints, one per line
struct ListArgs {
    /// service name; omit to list every service
    #[argh(option, short = 'n', long = "name")]
    name: Option<String>,

    /// only instances in this zone
    #[argh(option, long = "zone")]
    zone: Option<String>,

    /// required tag; can be repeated (all must match)
    #[argh(option, short = 't', long = "tag")]
    tags: Vec<String>,
}

/// Arguments for selecting one endpoint.
///
/// Exits with status 1 when nothing matches.
#[derive(FromArgs)]
#[argh(subcommand, name = "select")]
/// print one endpoint chosen at random
struct SelectArgs {
    /// service name
    #[argh(option, short = 'n', long = "name")]
    name: String,

    /// only instances in this zone
    #[argh(option, long = "zone")]
    zone: Option<String>,

    /// required tag; can be repeated (all must match)
    #[argh(option, short = 't', long = "tag")]
    tags: Vec<String>,

    /// weight the choice by each instance's `weight` metadata
    #[argh(switch, long = "weighted")]
    weighted: bool,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "health")]
/// print a service's aggregated health as JSON
struct HealthArgs {
    /// service name
    #[argh(option, short = 'n', long = "name")]
    name: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "deregister")]
/// deregister one endpoint
struct DeregisterArgs {
    /// service name
    #[argh(option, short = 's')]
    service: String,

    /// registered address
    #[argh(option, short = 'a', long = "addr")]
    address: String,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "catalog")]
/// list catalog services, or one service's instances with their nodes
struct CatalogArgs {
    /// service name; omit to list every service with its tags
    #[argh(option, short = 'n', long = "name")]
    name: Option<String>,

    /// only instances carrying this tag
    #[argh(option, short = 't', long = "tag")]
    tag: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Output commands print raw results; keep stdout clean for scripting
    if !matches!(
        cli.command,
        Commands::List(_) | Commands::Select(_) | Commands::Health(_) | Commands::Catalog(_)
    ) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args).await,
        Commands::List(args) => run_list(args).await,
        Commands::Select(args) => {
            if !run_select(args).await? {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Health(args) => run_health(args).await,
        Commands::Deregister(args) => run_deregister(args).await,
        Commands::Catalog(args) => run_catalog(args).await,
    }
}

/// Executes the `serve` subcommand.
///
/// Signal handlers are in place before the first registration. A signal
/// during registration drains right away; the registration in flight is
/// deregistered again when it lands. A registration failure deregisters
/// whatever was already registered before returning the error.
async fn run_serve(args: ServeArgs) -> Result<()> {
    let meta = regcache_cli::parse_meta(&args.meta)?;
    let health = HealthTarget::parse(&args.health_url);
    if args.addresses.is_empty() {
        return Err(anyhow::anyhow!("No addresses given. Use -a <addr> to add one."));
    }

    let discovery = Discovery::from_env()?;
    let addresses = args
        .addresses
        .iter()
        .map(|addr| regcache_cli::resolve_address(addr, || discovery.local_host()))
        .collect::<Result<Vec<_>>>()?;
    let handles = discovery.start().await?;
    if let Some(port) = handles.health_port() {
        tracing::info!("Health endpoint on port {}", port);
    }

    let registration = discovery.register(&args.service, &health, &meta, &addresses);
    tokio::pin!(registration);

    let outcome = tokio::select! {
        result = &mut registration => Some(result),
        Ok(signal) = discovery.wait_for_signal() => {
            tracing::warn!("Received {} while registering {}", signal, args.service);
            None
        }
    };

    match outcome {
        Some(Ok(ids)) => tracing::info!("Serving {} as {:?}", args.service, ids),
        Some(Err(RegcacheError::ShuttingDown(reason))) => {
            tracing::info!("Registration of {} interrupted: {}", args.service, reason);
        }
        Some(Err(e)) => {
            tracing::error!("Registration of {} failed: {}", args.service, e);
            discovery.shutdown().await;
            handles.stop().await;
            return Err(e.into());
        }
        None => {
            if let Err(e) = registration.await {
                tracing::info!("Registration of {} interrupted: {}", args.service, e);
            }
        }
    }

    let (signal, report) = discovery.run_until_signal().await?;
    handles.stop().await;

    if report.is_clean() {
        tracing::info!("Shut down cleanly after {}", signal);
    } else {
        tracing::warn!(
            "Shut down after {} with {} failed and {} timed out participants",
            signal,
            report.failed.len(),
            report.timed_out.len()
        );
    }
    Ok(())
}

/// Executes the `list` subcommand: one refresh, then print.
async fn run_list(args: ListArgs) -> Result<()> {
    let discovery = Discovery::from_env()?.without_health_endpoint();
    discovery.refresh().await?;

    let instances = match &args.name {
        Some(name) => discovery.by_query(&regcache_cli::build_query(name, args.zone.as_deref(), &args.tags)),
        None => {
            let items = discovery.snapshot().items();
            regcache_cli::filter_any_service(items.values(), args.zone.as_deref(), &args.tags)
        }
    };

    for instance in instances {
        if args.name.is_some() {
            println!("{}", instance.endpoint());
        } else {
            println!("{} {}", instance.service_name, instance.endpoint());
        }
    }
    Ok(())
}

/// Executes the `select` subcommand. Returns `false` when nothing matched.
async fn run_select(args: SelectArgs) -> Result<bool> {
    let discovery = Discovery::from_env()?.without_health_endpoint();
    discovery.refresh().await?;

    let query = regcache_cli::build_query(&args.name, args.zone.as_deref(), &args.tags);
    let candidates = discovery.by_query(&query);
    let chosen = if args.weighted {
        discovery.select_weighted(&candidates)
    } else {
        discovery.select_one(&candidates)
    };

    match chosen {
        Some(instance) => {
            println!("{}", instance.endpoint());
            Ok(true)
        }
        None => {
            eprintln!("No instance of {} matches", args.name);
            Ok(false)
        }
    }
}

/// Executes the `health` subcommand.
async fn run_health(args: HealthArgs) -> Result<()> {
    let discovery = Discovery::from_env()?.without_health_endpoint();
    let health = discovery.lookup_health(&args.name).await?;
    println!("{}", serde_json::to_string(&health)?);
    Ok(())
}

/// Executes the `deregister` subcommand.
async fn run_deregister(args: DeregisterArgs) -> Result<()> {
    let discovery = Discovery::from_env()?.without_health_endpoint();
    discovery.deregister(&args.service, &args.address).await?;
    tracing::info!("Deregistered {} at {}", args.service, args.address);
    Ok(())
}

/// Executes the `catalog` subcommand against the agent directly.
async fn run_catalog(args: CatalogArgs) -> Result<()> {
    let config = RegistryConfig::from_env();
    config.validate()?;
    let client = ConsulAgentClient::new(&config);

    match &args.name {
        Some(name) => {
            for entry in client.catalog_service(name, args.tag.as_deref()).await? {
                println!("{} {}", entry.node, entry.endpoint());
            }
        }
        None => {
            for (name, mut tags) in client.catalog_services().await? {
                tags.sort();
                println!("{} {}", name, tags.join(","));
            }
        }
    }
    Ok(())
}

/// CLI argument parsing tests.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_serve() {
        let args: Cli = Cli::from_args(&["regcache"], &[
            "serve",
            "-s", "orders",
            "-a", "ws://10.0.0.5:9090",
            "-a", "10.0.0.6:9090",
        ]).unwrap();
        match args.command {
            Commands::Serve(ServeArgs { service, addresses, health_url, meta }) => {
                assert_eq!(service, "orders");
                assert_eq!(addresses, vec!["ws://10.0.0.5:9090", "10.0.0.6:9090"]);
                assert_eq!(health_url, DEFAULT_HEALTHY); // default
                assert!(meta.is_empty());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_with_health_and_meta() {
        let args: Cli = Cli::from_args(&["regcache"], &[
            "serve",
            "-s", "orders",
            "--addr", "10.0.0.5:9090",
            "--health-url", "http://10.0.0.5:8080/health",
            "-m", "version=v2",
            "--meta", "weight=3",
        ]).unwrap();
        match args.command {
            Commands::Serve(ServeArgs { health_url, meta, .. }) => {
                assert_eq!(health_url, "http://10.0.0.5:8080/health");
                assert_eq!(meta, vec!["version=v2", "weight=3"]);
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_requires_service() {
        assert!(Cli::from_args(&["regcache"], &["serve", "-a", "h:1"]).is_err());
    }

    #[test]
    fn test_cli_parse_list_all() {
        let args: Cli = Cli::from_args(&["regcache"], &["list"]).unwrap();
        match args.command {
            Commands::List(ListArgs { name, zone, tags }) => {
                assert!(name.is_none());
                assert!(zone.is_none());
                assert!(tags.is_empty());
            }
            _ => panic!("Expected List command"),
        }
    }

    #[test]
    fn test_cli_parse_list_filtered() {
        let args: Cli = Cli::from_args(&["regcache"], &[
            "list",
            "-n", "orders",
            "--zone", "UNZONE",
            "-t", "ws",
            "--tag", "TEST",
        ]).unwrap();
        match args.command {
            Commands::List(ListArgs { name, zone, tags }) => {
                assert_eq!(name.as_deref(), Some("orders"));
                assert_eq!(zone.as_deref(), Some("UNZONE"));
                assert_eq!(tags, vec!["ws", "TEST"]);
            }
            _ => panic!("Expected List command"),
        }
    }

    #[test]
    fn test_cli_parse_select() {
        let args: Cli = Cli::from_args(&["regcache"], &["select", "-n", "orders"]).unwrap();
        match args.command {
            Commands::Select(SelectArgs { name, weighted, .. }) => {
                assert_eq!(name, "orders");
                assert!(!weighted);
            }
            _ => panic!("Expected Select command"),
        }
    }

    #[test]
    fn test_cli_parse_select_weighted() {
        let args: Cli = Cli::from_args(&["regcache"], &["select", "-n", "orders", "--weighted"]).unwrap();
        match args.command {
            Commands::Select(SelectArgs { weighted, .. }) => assert!(weighted),
            _ => panic!("Expected Select command"),
        }
    }

    #[test]
    fn test_cli_parse_health() {
        let args: Cli = Cli::from_args(&["regcache"], &["health", "-n", "orders"]).unwrap();
        match args.command {
            Commands::Health(HealthArgs { name }) => assert_eq!(name, "orders"),
            _ => panic!("Expected Health command"),
        }
    }

    #[test]
    fn test_cli_parse_deregister() {
        let args: Cli = Cli::from_args(&["regcache"], &[
            "deregister",
            "-s", "orders",
            "-a", "10.0.0.5:9090",
        ]).unwrap();
        match args.command {
            Commands::Deregister(DeregisterArgs { service, address }) => {
                assert_eq!(service, "orders");
                assert_eq!(address, "10.0.0.5:9090");
            }
            _ => panic!("Expected Deregister command"),
        }
    }

    #[test]
    fn test_cli_parse_catalog() {
        let args: Cli = Cli::from_args(&["regcache"], &["catalog", "-n", "orders", "-t", "ws"]).unwrap();
        match args.command {
            Commands::Catalog(CatalogArgs { name, tag }) => {
                assert_eq!(name.as_deref(), Some("orders"));
                assert_eq!(tag.as_deref(), Some("ws"));
            }
            _ => panic!("Expected Catalog command"),
        }

        let args: Cli = Cli::from_args(&["regcache"], &["catalog"]).unwrap();
        assert!(matches!(args.command, Commands::Catalog(CatalogArgs { name: None, tag: None })));
    }
}
