mod api;
mod app;
mod cache;
mod config;
mod db;
mod error;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "replenish")]
#[command(about = "Daily rituals and progress from the LivReplenish wellness API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/replenish/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Show today's plan, or the plan for a date
  Plan {
    /// Date as YYYY-MM-DD
    #[arg(short, long)]
    date: Option<String>,
  },
  /// Show a ritual
  Ritual { id: i64 },
  /// Mark a ritual as completed
  Complete {
    id: i64,
    /// Minutes spent
    #[arg(short, long)]
    duration: Option<u32>,
    #[arg(short, long)]
    notes: Option<String>,
  },
  /// Leave feedback on a ritual
  Feedback {
    id: i64,
    text: String,
    /// Rating from 1 to 5
    #[arg(short, long)]
    rating: Option<u8>,
  },
  /// Show progress for a time range (7d, 30d, 90d, 1y)
  Progress {
    #[arg(short, long)]
    range: Option<String>,
    /// Show the day-by-day history instead of the overview
    #[arg(long)]
    history: bool,
  },
  /// Show ritual statistics
  Stats,
  /// Show the user profile
  Profile,
  /// Submit onboarding answers from a YAML or JSON file
  Onboard { file: PathBuf },
  /// Upload a recording for a ritual
  UploadAudio { id: i64, file: PathBuf },
  /// Today's plan, stats and progress at a glance
  Dashboard,
  /// Check whether the API is reachable
  Health,
  /// Log in and remember the session
  Login {
    email: String,
    /// Read from stdin when omitted
    #[arg(short, long)]
    password: Option<String>,
  },
  /// Log out and forget the session
  Logout,
  /// Show or change local preferences
  Prefs {
    #[command(subcommand)]
    action: PrefsAction,
  },
}

#[derive(Subcommand, Debug)]
pub enum PrefsAction {
  Show,
  /// Set one preference, e.g. `theme dark`
  Set {
    key: String,
    value: String,
    /// Also save it to the user profile on the server
    #[arg(long)]
    remote: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Keep the guard alive until exit so buffered logs are flushed
  let _logger = logging::Logger::init(&config)?;

  let mut app = app::App::new(config)?;
  app.run(args.command).await?;

  Ok(())
}
