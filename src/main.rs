use clap::{Parser, Subcommand};
use shieldlink::config::{Config, DEFAULT_CONFIG_DIR};
use shieldlink::dns::BypassCache;
use shieldlink::steering::{LinkRegistry, LinkRole, TrafficChain};
use shieldlink::{RunOptions, service};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "shieldlink")]
#[command(about = "Multi-uplink traffic steering with DNS-driven VPN bypass")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./shieldlink.toml, then /etc/shieldlink/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start steering and the DNS relay; runs until SIGINT/SIGTERM
    Run {
        /// Log kernel commands instead of executing them
        #[arg(long)]
        dry_run: bool,
    },
    /// Generate default config file
    Init {
        /// Where to write the config
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
    /// Validate the config and show the link plan
    Check,
    /// List the persisted bypass cache
    Cache,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so `check` and `cache` output stays clean
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install logger: {}", e);
    }

    if let Err(e) = dispatch(cli).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run { dry_run } => {
            let config = Config::find(cli.config.as_deref())?;
            service::run(config, RunOptions { dry_run }).await?;
        }
        Commands::Init { path } => {
            let path = path
                .or(cli.config)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR).join("config.toml"));
            info!("Generating default config...");
            Config::default().save(&path)?;
            println!("Created default config: {}", path.display());
        }
        Commands::Check => {
            let config = Config::find(cli.config.as_deref())?;
            config.validate()?;
            shieldlink::dns::BypassMatcher::new(&config.bypass.domains)?;
            print_plan(&config);
        }
        Commands::Cache => {
            let config = Config::find(cli.config.as_deref())?;
            let path = &config.dns.cache_file;
            if !path.exists() {
                println!("No bypass cache at {}", path.display());
                return Ok(());
            }
            let entries = BypassCache::read_entries(path)?;
            let now = chrono::Utc::now();
            println!("Bypass cache: {} ({} address(es))", path.display(), entries.len());
            for entry in entries {
                let state = if entry.expires_at <= now { " (expired)" } else { "" };
                println!("  {:<15}  expires {}{}", entry.ip, entry.expires_at.to_rfc3339(), state);
            }
        }
    }

    Ok(())
}

fn print_plan(config: &Config) {
    let registry = LinkRegistry::from_config(&config.links);
    println!("Configuration OK");
    for role in [LinkRole::Vpn, LinkRole::Wan] {
        let chain = TrafficChain::for_role(role, &config.links);
        println!(
            "  chain {} (when empty: {:?})",
            chain.name(),
            chain.when_empty
        );
        for link in registry.by_role(role) {
            println!(
                "    {:<12} weight {:<4} mark {} table {}",
                link.name,
                link.weight(),
                link.mark_hex(),
                link.table
            );
        }
    }
    println!("  LAN interfaces: {}", config.links.lan.join(", "));
    println!(
        "  bypass: {} domain pattern(s), {} static address(es)",
        config.bypass.domains.len(),
        config.bypass.addresses.len()
    );
    println!("  DNS relay: {}", config.dns.listen_addr());
}
