use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use warp_proxy::profile::{parse_profile, render_proxy_config};
use warp_proxy::{Config, ProxyManager};

#[derive(Parser)]
#[command(name = "warp-proxy")]
#[command(about = "Local SOCKS5/HTTP proxy over Cloudflare WARP")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./warp-proxy.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy and keep it running until Ctrl+C
    Up,
    /// Download tools and register an account without starting the proxy
    Provision,
    /// Show the data directory and which artifacts exist
    Status,
    /// Print the wireproxy config the current profile would produce
    Render,
    /// Generate default config file
    Init,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::discover()?,
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries command output only
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Up => {
            let config = load_config(cli.config.as_ref())?;
            let manager = ProxyManager::new(config)?;

            info!("Enabling WARP proxy...");
            let response = manager.enable().await;
            if !response.success {
                error!(
                    "Enable failed: {}",
                    response.error.as_deref().unwrap_or("unknown error")
                );
                std::process::exit(1);
            }

            let listen = manager.listen_addrs();
            println!("WARP proxy running");
            println!("  SOCKS5: {}", listen.socks_bind());
            println!("  HTTP:   {}", listen.http_bind());
            println!("Press Ctrl+C to stop");

            let mut crashed = false;
            let mut poll = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutting down...");
                        break;
                    }
                    _ = poll.tick() => {
                        if !manager.is_enabled() {
                            let status = manager.status();
                            warn!(
                                "Proxy stopped: {}",
                                status.error.as_deref().unwrap_or("no exit status")
                            );
                            crashed = true;
                            break;
                        }
                    }
                }
            }

            manager.cleanup().await;
            if crashed {
                std::process::exit(1);
            }
        }
        Commands::Provision => {
            let config = load_config(cli.config.as_ref())?;
            let manager = ProxyManager::new(config)?;

            info!("Provisioning WARP proxy...");
            match manager.provision().await {
                Ok(()) => {
                    println!("Ready: {}", manager.layout().root().display());
                }
                Err(e) => {
                    error!("Provisioning failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Status => {
            let config = load_config(cli.config.as_ref())?;
            let layout = warp_proxy::DataLayout::from_config(&config);

            println!("Data directory: {}", layout.root().display());
            let artifacts = [
                (config.tools.registration.name.as_str(), layout.registration_exe().to_path_buf()),
                (config.tools.proxy.name.as_str(), layout.proxy_exe().to_path_buf()),
                ("account", layout.account()),
                ("profile", layout.profile()),
                ("proxy config", layout.proxy_config()),
            ];
            for (label, path) in &artifacts {
                let state = if path.exists() { "present" } else { "missing" };
                println!("  {:<13} {} ({})", label, state, path.display());
            }
            println!(
                "Proxy address: {}:{} (HTTP on {})",
                config.proxy.host,
                config.proxy.socks_port,
                config.proxy.http_port()
            );
        }
        Commands::Render => {
            let config = load_config(cli.config.as_ref())?;
            let layout = warp_proxy::DataLayout::from_config(&config);

            let text = std::fs::read_to_string(layout.profile())
                .map_err(|e| format!("Cannot read {}: {}", layout.profile().display(), e))?;
            let profile = parse_profile(&text);
            profile.validate()?;

            let listen = warp_proxy::profile::ListenAddrs {
                host: config.proxy.host.clone(),
                socks_port: config.proxy.socks_port,
                http_port: config.proxy.http_port(),
            };
            print!("{}", render_proxy_config(&profile, &listen));
        }
        Commands::Init => {
            info!("Generating default config...");
            let config = Config::default();
            let path = cli
                .config
                .unwrap_or_else(|| PathBuf::from(warp_proxy::config::LOCAL_CONFIG_FILE));
            if path.exists() {
                error!("{} already exists", path.display());
                std::process::exit(1);
            }
            config.save(&path)?;
            println!("Created default config: {}", path.display());
        }
    }

    Ok(())
}
