use color_eyre::{eyre::eyre, Result};
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Install the global subscriber.
///
/// Logs go to stderr; with `log_dir` set they are also written to a
/// daily-rotated file there. Keep the returned guard alive until exit so the
/// file writer flushes.
pub fn init(verbose: bool, quiet: bool, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = if quiet {
    EnvFilter::new("error")
  } else if verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::from_default_env().add_directive(Level::INFO.into())
  };

  let (file_layer, guard) = match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "bandep-proxy.log");
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
