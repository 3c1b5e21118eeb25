mod cache;
mod config;
mod intercept;
mod logging;
mod placeholder;
mod retrieval;
mod server;
mod transport;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::TargetConfig;
use crate::intercept::{Interceptor, MatchRule, RequestDescriptor};
use crate::retrieval::{RetrievalEngine, Retrieved};
use crate::transport::{HttpTransport, Transport};

#[derive(Parser, Debug)]
#[command(name = "bandep-proxy")]
#[command(about = "Cache-first proxy for Chamber of Deputies profile photos")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./bandep-proxy.yaml or $XDG_CONFIG_HOME/bandep-proxy/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log at debug level
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Only log errors
  #[arg(short, long, global = true, conflicts_with = "verbose")]
  quiet: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Retrieve one photo and write it to a file or stdout
  Fetch {
    /// Absolute photo URL, e.g. https://camara.leg.br/deputado/bandep/123.jpg
    url: String,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
  },

  /// Run the local HTTP proxy
  Serve {
    /// Address to listen on (overrides config)
    #[arg(short, long)]
    listen: Option<SocketAddr>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let _log_guard = logging::init(args.verbose, args.quiet, config.log.dir.as_deref())?;

  let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.http)?);
  let storage = cache::from_config(&config.cache)?;
  let engine = RetrievalEngine::new(storage, transport.clone(), config.relay.clone());
  let interceptor = Interceptor::new(MatchRule::from(&config.target), engine);

  match args.command {
    Command::Fetch { url, output } => {
      fetch(&interceptor, &config.target, &url, output.as_deref()).await?;
    }
    Command::Serve { listen } => {
      let listen = listen.unwrap_or(config.server.listen);
      let state = server::AppState::new(interceptor, transport, config.server.passthrough);
      server::serve(listen, state).await?;
    }
  }

  Ok(())
}

/// Retrieve one photo and write its body to `output`, or stdout when unset.
async fn fetch(
  interceptor: &Interceptor,
  target: &TargetConfig,
  url: &str,
  output: Option<&Path>,
) -> Result<Retrieved> {
  let request =
    RequestDescriptor::parse(url).map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;

  let retrieved = interceptor.intercept(&request).await.ok_or_else(|| {
    eyre!(
      "{} is not intercepted: host must be {} and path must contain {}",
      url,
      target.host,
      target.path_segment
    )
  })?;

  let response = &retrieved.response;
  info!(
    source = %retrieved.source,
    status = response.status,
    content_type = response.content_type().unwrap_or("-"),
    cache_control = response.header("cache-control").unwrap_or("-"),
    cached_at = ?retrieved.cached_at,
    bytes = response.body.len(),
    "retrieved"
  );

  match output {
    Some(path) => std::fs::write(path, &response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
    None => {
      let mut stdout = std::io::stdout().lock();
      stdout.write_all(&response.body)?;
      stdout.flush()?;
    }
  }

  Ok(retrieved)
}
