use clap::{Parser, Subcommand};
use log::{error, info};
use plexcli::api::{self, PlexClient};
use plexcli::config::{Config, ServerEntry};
use plexcli::error::{Error, Result};
use plexcli::indexer;
use plexcli::media::MediaItem;
use plexcli::session;
use plexcli::store::{Catalog, Queue};
use plexcli::stream_server::DEFAULT_PORT;
use plexcli::{discovery, tools};
use simplelog::{CombinedLogger, Config as LogConfig, LevelFilter, SimpleLogger, WriteLogger};
use std::fs::File;
use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "plexcli", version, about = "Command-line companion for a Plex media server")]
struct Cli {
    /// Log at debug level (including soft-schema warnings).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in against the cloud identity service and save the token.
    Login {
        #[arg(short, long)]
        username: String,
    },
    /// Check connectivity to every enabled server.
    Test,
    /// List the libraries each enabled server exposes.
    Libraries,
    /// Rebuild the catalog from scratch.
    Index,
    /// Refresh the catalog, keeping entries for items the server no longer
    /// returns.
    Update,
    /// Show the catalog.
    List,
    /// Play items with the external player, selected by index or title.
    Watch {
        #[arg(required = true)]
        selection: Vec<String>,
    },
    /// Fetch items' backing files with the transfer tool.
    Get {
        #[arg(required = true)]
        selection: Vec<String>,
    },
    /// Manage the download queue.
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Publish items' streams on the local network.
    Publish {
        #[arg(required = true)]
        selection: Vec<String>,
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
    /// Browse for peers and show what they publish.
    Discover {
        #[arg(short, long, default_value_t = 3)]
        timeout_secs: u64,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Add catalog items to the queue.
    Add {
        #[arg(required = true)]
        selection: Vec<String>,
    },
    /// Show the queue.
    List,
    /// Remove queue entries by position (1-based).
    Remove {
        #[arg(required = true)]
        indices: Vec<usize>,
    },
    /// Fetch everything in the queue; fetched items leave the queue.
    Get,
    /// Drop the whole queue.
    Clear,
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let log_path = Config::log_path();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let mut loggers: Vec<Box<dyn simplelog::SharedLogger>> =
        vec![SimpleLogger::new(level, LogConfig::default())];
    if let Ok(file) = File::create(&log_path) {
        loggers.push(WriteLogger::new(LevelFilter::Debug, LogConfig::default(), file));
    }
    if let Err(e) = CombinedLogger::init(loggers) {
        eprintln!("Failed to initialize logger: {}", e);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                cancel.cancel();
            }
        }
    });

    match run(cli.command, &cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        // User cancellation is a clean exit, like a dismissed picker.
        Err(Error::Cancelled) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(command: Command, cancel: &CancellationToken) -> Result<()> {
    match command {
        Command::Login { username } => login(&username).await,
        Command::Test => test().await,
        Command::Libraries => libraries().await,
        Command::Index => index(false, cancel).await,
        Command::Update => index(true, cancel).await,
        Command::List => list(),
        Command::Watch { selection } => {
            let config = validated_config()?;
            let items = select_from_catalog(&selection)?;
            session::watch_items(&config, &Config::cache_dir(), &items, cancel).await?;
            Ok(())
        }
        Command::Get { selection } => {
            let config = validated_config()?;
            let items = select_from_catalog(&selection)?;
            session::transfer_items(&config, &Config::cache_dir(), &items, false, cancel).await?;
            Ok(())
        }
        Command::Queue(queue_command) => queue(queue_command, cancel).await,
        Command::Publish { selection, port } => {
            let config = validated_config()?;
            let items = select_from_catalog(&selection)?;
            session::publish_items(&config, &items, port, cancel).await?;
            Ok(())
        }
        Command::Discover { timeout_secs } => discover(Duration::from_secs(timeout_secs)).await,
    }
}

async fn login(username: &str) -> Result<()> {
    print!("Password for {username}: ");
    std::io::stdout().flush()?;
    let mut password = String::new();
    std::io::stdin().read_line(&mut password)?;
    let password = password.trim_end_matches(['\r', '\n']);

    let (token, servers) = api::authenticate(username, password).await?;
    println!("Signed in; {} server(s) found:", servers.len());

    let mut config = Config::load()?;
    config.plex_token = token;
    config.plex_username = username.to_string();
    config.servers = servers
        .iter()
        .filter_map(|record| {
            let Some(url) = record.preferred_url() else {
                println!("  {} (no reachable address, skipped)", record.name);
                return None;
            };
            println!("  {} -> {url}", record.name);
            Some(ServerEntry {
                name: record.name.clone(),
                url: url.to_string(),
                enabled: true,
            })
        })
        .collect();
    config.save()?;
    println!("Saved to {}", Config::app_dir().display());
    Ok(())
}

async fn test() -> Result<()> {
    let config = validated_config()?;
    for server in config.enabled_servers() {
        let client = PlexClient::new(&server.name, &server.url, &config.plex_token);
        client.test().await?;
        println!("{}: ok", server.name);
    }
    Ok(())
}

async fn libraries() -> Result<()> {
    let config = validated_config()?;
    for server in config.enabled_servers() {
        let client = PlexClient::new(&server.name, &server.url, &config.plex_token);
        println!("{}:", server.name);
        for library in client.list_libraries().await? {
            println!("  [{}] {} ({:?})", library.key, library.title, library.kind);
        }
    }
    Ok(())
}

async fn index(additive: bool, cancel: &CancellationToken) -> Result<()> {
    let config = validated_config()?;
    let items = indexer::index_all(&config.plex_token, &config.servers, cancel, |progress| {
        println!(
            "[{}/{}] {}: {} ({} items, library {}/{})",
            progress.servers_done,
            progress.servers_total,
            progress.server_name,
            progress.library_name,
            progress.items_in_library,
            progress.libraries_done,
            progress.libraries_total,
        );
    })
    .await?;

    let cache_dir = Config::cache_dir();
    let mut catalog = Catalog::load(&cache_dir)?;
    if additive {
        let added = catalog.merge(items);
        println!("{} new item(s), {} total", added, catalog.items.len());
    } else {
        catalog.replace(items);
        println!("{} item(s) indexed", catalog.items.len());
    }
    catalog.save(&cache_dir)
}

fn list() -> Result<()> {
    let catalog = Catalog::load(&Config::cache_dir())?;
    if catalog.is_empty() {
        println!("cache is empty; run `plexcli index` first");
        return Ok(());
    }
    for (i, item) in catalog.items.iter().enumerate() {
        let marker = if item.started() { "*" } else { " " };
        println!("{:4} {} {}", i + 1, marker, item.display_title());
    }
    if let Some(updated) = catalog.last_updated {
        println!("last updated {}", updated.to_rfc3339());
    }
    Ok(())
}

async fn queue(command: QueueCommand, cancel: &CancellationToken) -> Result<()> {
    let cache_dir = Config::cache_dir();
    match command {
        QueueCommand::Add { selection } => {
            let items = select_from_catalog(&selection)?;
            let added = Queue::add(&cache_dir, &items)?;
            println!("{added} item(s) queued");
            Ok(())
        }
        QueueCommand::List => {
            let queue = Queue::load(&cache_dir)?;
            if queue.is_empty() {
                println!("queue is empty");
                return Ok(());
            }
            for (i, item) in queue.items.iter().enumerate() {
                println!("{:4}   {}", i + 1, item.display_title());
            }
            Ok(())
        }
        QueueCommand::Remove { indices } => {
            let zero_based: Vec<usize> =
                indices.iter().filter(|&&i| i > 0).map(|&i| i - 1).collect();
            let removed = Queue::remove(&cache_dir, &zero_based)?;
            println!("{removed} item(s) removed");
            Ok(())
        }
        QueueCommand::Get => {
            let config = validated_config()?;
            let queue = Queue::load(&cache_dir)?;
            if queue.is_empty() {
                println!("queue is empty");
                return Ok(());
            }
            session::transfer_items(&config, &cache_dir, &queue.items, true, cancel).await?;
            Ok(())
        }
        QueueCommand::Clear => {
            Queue::clear(&cache_dir)?;
            println!("queue cleared");
            Ok(())
        }
    }
}

async fn discover(timeout: Duration) -> Result<()> {
    println!("Browsing for peers ({}s)...", timeout.as_secs());
    let peers = discovery::discover(timeout).await?;
    if peers.is_empty() {
        println!("no peers found");
        return Ok(());
    }
    for peer in &peers {
        println!("{} ({}:{})", peer.name, peer.host, peer.port);
        println!("  addresses: {}", peer.addresses.join(", "));
        match discovery::fetch_streams(peer).await {
            Ok(streams) => {
                for stream in streams {
                    println!("  {} -> {}", stream.title, stream.stream_url);
                }
            }
            Err(e) => println!("  manifest unavailable: {e}"),
        }
    }
    Ok(())
}

fn validated_config() -> Result<Config> {
    let config = Config::load()?;
    config.validate()?;
    if !tools::available(tools::Tool::Finder, &config) {
        log::debug!("fzf not found; selection stays index/title based");
    }
    Ok(config)
}

/// Resolve selection arguments against the catalog: a number is a 1-based
/// index, anything else a case-insensitive title substring.
fn select_from_catalog(selection: &[String]) -> Result<Vec<MediaItem>> {
    let catalog = Catalog::load(&Config::cache_dir())?;
    if catalog.is_empty() {
        return Err(Error::NotFound(
            "cache is empty; run `plexcli index` first".to_string(),
        ));
    }

    let mut items: Vec<MediaItem> = Vec::new();
    for arg in selection {
        let matched: Vec<&MediaItem> = if let Ok(index) = arg.parse::<usize>() {
            catalog
                .items
                .get(index.checked_sub(1).unwrap_or(usize::MAX))
                .into_iter()
                .collect()
        } else {
            let needle = arg.to_lowercase();
            catalog
                .items
                .iter()
                .filter(|i| i.display_title().to_lowercase().contains(&needle))
                .collect()
        };
        if matched.is_empty() {
            return Err(Error::NotFound(format!("no catalog entry matches {arg:?}")));
        }
        for item in matched {
            if !items.iter().any(|existing| existing.path == item.path) {
                items.push(item.clone());
            }
        }
    }
    Ok(items)
}
