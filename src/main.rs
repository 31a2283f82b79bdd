mod app;
mod commands;
mod logging;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;

use keycache::config::Config;

#[derive(Parser, Debug)]
#[command(name = "keycache")]
#[command(about = "Per-key cache with transparent refresh from an HTTP origin")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/keycache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init()?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let app = app::App::new(&config)?;
  app.run(args.command).await?;

  Ok(())
}
