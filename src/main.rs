mod agent;
mod cache;
mod commands;
mod config;
mod error;
mod event;
mod lifecycle;
mod network;
mod routes;
mod server;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use crate::agent::Agent;
use crate::cache::{CacheStorage, SqliteStorage, StoreHandle};
use crate::config::Config;
use crate::event::AgentHandle;
use crate::lifecycle::LifecyclePhase;
use crate::network::{Fetch, HttpFetcher, Request};

#[derive(Parser, Debug)]
#[command(name = "cachet")]
#[command(about = "An offline-capable request cache with versioned stores")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./cachet.yaml, then $XDG_CONFIG_HOME/cachet/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// More logging (-v info, -vv debug); RUST_LOG takes precedence
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the configured version into a new store
  Install {
    /// Activate right away instead of waiting
    #[arg(long)]
    activate: bool,
  },
  /// Fetch a URL (or origin-relative path) through the agent
  Fetch {
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Show which policy a request would be served with
  Classify {
    url: String,
    #[arg(long)]
    navigate: bool,
    #[arg(long, default_value = "GET")]
    method: String,
  },
  /// List stores with their entry counts
  Stores,
  /// Print the active cache version
  Version,
  /// Send a control message (skip-waiting, clients-claim, get-version)
  Message { name: String },
  /// Run the proxy host
  Serve {
    /// Address to listen on (overrides the config)
    #[arg(short, long)]
    listen: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_logging(args.verbose, &config)?;

  debug!(namespace = %config.namespace, version = %config.version, "configuration loaded");
  let agent = build_agent(&config)?;

  match args.command {
    Command::Install { activate } => install(&agent, &config, activate).await,
    Command::Fetch {
      url,
      navigate,
      output,
    } => fetch(&agent, &url, navigate, output).await,
    Command::Classify {
      url,
      navigate,
      method,
    } => {
      let request = request_for(agent.origin(), &url, navigate)?.with_method(method);
      let rule = agent.route(&request);
      println!("{}\t{} ({})", request.url, rule.policy, rule.name);
      Ok(())
    }
    Command::Stores => stores(&agent).await,
    Command::Version => {
      let reply = agent.message(commands::AgentCommand::GetVersion).await?;
      if let Some(reply) = reply {
        println!("{}", reply.version);
      }
      Ok(())
    }
    Command::Message { name } => {
      let info = commands::lookup(&name).ok_or_else(|| {
        let known: Vec<_> = commands::COMMANDS
          .iter()
          .map(|c| format!("  {:<14} {}", c.name, c.description))
          .collect();
        eyre!("Unknown message '{}'. Available:\n{}", name, known.join("\n"))
      })?;
      if let Some(reply) = agent.message(info.command).await? {
        println!("{}", serde_json::to_string(&reply)?);
      }
      Ok(())
    }
    Command::Serve { listen } => {
      let listen = listen.unwrap_or_else(|| config.listen.clone());
      let origin = config.origin.clone();
      let handle = AgentHandle::spawn(Arc::new(agent));
      server::serve(handle, origin, &listen).await
    }
  }
}

/// Log to stderr, and to a daily file when `log_dir` is configured.
/// The returned guard flushes the file writer on drop.
fn init_logging(verbose: u8, config: &Config) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
    0 => EnvFilter::new("cachet=info"),
    _ => EnvFilter::new("cachet=debug"),
  });

  let (file_layer, guard) = match &config.log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "cachet.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = fmt::layer().with_writer(writer).with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
    .with(file_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn build_agent(config: &Config) -> Result<Agent<SqliteStorage>> {
  let path = config.database_path()?;
  debug!(path = %path.display(), "opening cache database");

  let storage = Arc::new(SqliteStorage::open_at(&path)?);
  let network: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(&config.network)?);
  Agent::new(config, storage, network)
}

/// Accept either an absolute URL or a path on the origin.
fn request_for(origin: &Url, target: &str, navigate: bool) -> Result<Request> {
  let url = Url::parse(target)
    .or_else(|_| origin.join(target))
    .map_err(|e| eyre!("Invalid URL {}: {}", target, e))?;

  Ok(if navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  })
}

async fn install(agent: &Agent<SqliteStorage>, config: &Config, activate: bool) -> Result<()> {
  let mut phase = agent.install().await?;
  if phase == LifecyclePhase::Waiting && activate {
    agent.message(commands::AgentCommand::SkipWaiting).await?;
    phase = LifecyclePhase::Active;
  }

  info!(store = %config.store_name(), %phase, "install finished");
  println!("{}", phase);
  Ok(())
}

async fn fetch(agent: &Agent<SqliteStorage>, target: &str, navigate: bool, output: Option<PathBuf>) -> Result<()> {
  let request = request_for(agent.origin(), target, navigate)?;
  let client = agent.connect().await;
  let result = agent.handle(client, &request).await?;

  let content_type = result.data.header("content-type").unwrap_or("-");
  eprintln!("{} {} {}", result.data.status, result.source.as_str(), content_type);
  match output {
    Some(path) => std::fs::write(&path, &result.data.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
    None => std::io::stdout().write_all(&result.data.body)?,
  }

  Ok(())
}

async fn stores(agent: &Agent<SqliteStorage>) -> Result<()> {
  let storage = agent.storage();
  let (active, waiting) = agent.generations().await;

  for name in storage.store_names()? {
    let count = storage.entry_count(&StoreHandle::new(name.as_str()))?;
    let generation = [&active, &waiting]
      .into_iter()
      .flatten()
      .find(|g| g.store().name() == name);
    match generation {
      Some(g) => println!("{}\t{} entries\t{} ({})", name, count, g.version(), g.phase()),
      None => println!("{}\t{} entries", name, count),
    }
  }

  Ok(())
}
