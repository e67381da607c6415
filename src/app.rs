use color_eyre::{eyre::eyre, Report, Result};
use serde_json::{Map, Value};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::api_types::{
  CompletionData, FeedbackInput, OnboardingRequest, Plan, ProgressHistory,
  ProgressOverview, Resource, Ritual, UserProfile, UserStats,
};
use crate::api::auth::Session;
use crate::api::keys::ApiQuery;
use crate::api::WellnessClient;
use crate::config::Config;
use crate::db::{Preferences, PreferencesStore, SessionStore};
use crate::error::ErrorInfo;
use crate::{Command, PrefsAction};

/// Main application state
pub struct App {
  client: WellnessClient,
  preferences: PreferencesStore,
  /// Loaded once per session
  prefs: Preferences,
  session: SessionStore,
  gc: JoinHandle<()>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let client = WellnessClient::from_config(&config)?;
    let preferences = PreferencesStore::open()?;
    let prefs = preferences.load()?;
    let session = SessionStore::open()?;
    // An explicit token from the environment wins over the stored one
    if client.auth().token().is_none() {
      if let Some(token) = session.token()? {
        client.auth().set(token);
      }
    }
    let gc = client.start_gc(config.cache.gc_interval());

    Ok(Self {
      client,
      preferences,
      prefs,
      session,
      gc,
    })
  }

  pub async fn run(&mut self, command: Command) -> Result<()> {
    let result = self.dispatch(command).await;
    if self.client.auth().session() == Session::Expired {
      warn!("session expired, forgetting stored token");
      self.session.clear()?;
    }
    debug!(stats = ?self.client.stats(), "cache at exit");
    self.gc.abort();
    result
  }

  async fn dispatch(&mut self, command: Command) -> Result<()> {
    match command {
      Command::Plan { date } => {
        let plan = match date.as_deref() {
          Some(date) => self.client.plan_for_date(date).await,
          None => self.client.todays_plan().await,
        }
        .map_err(report)?;
        print_plan(&plan);
      }
      Command::Ritual { id } => {
        let ritual = self.client.ritual(id).await.map_err(report)?;
        print_ritual(&ritual);
      }
      Command::Complete {
        id,
        duration,
        notes,
      } => self.complete(id, CompletionData { duration, notes }).await?,
      Command::Feedback { id, text, rating } => {
        if rating.is_some_and(|r| !(1..=5).contains(&r)) {
          return Err(eyre!("Rating must be between 1 and 5"));
        }
        let feedback = FeedbackInput {
          rating,
          comment: Some(text),
        };
        let result = self
          .client
          .submit_feedback(id, feedback)
          .await
          .map_err(report)?;
        println!("Thanks for your feedback on ritual #{}", id);
        if let Some(average) = result.average_rating {
          println!("Average rating: {:.1}", average);
        }
      }
      Command::Progress { range, history } => {
        let range = range.unwrap_or_else(|| self.prefs.progress_time_range.to_string());
        if history {
          let history = self.client.progress_history(&range).await.map_err(report)?;
          print_history(&history);
        } else {
          let progress = self.client.progress(&range).await.map_err(report)?;
          print_progress(&progress);
        }
      }
      Command::Stats => {
        let stats = self.client.user_stats().await.map_err(report)?;
        print_stats(&stats);
      }
      Command::Profile => {
        let profile = self.client.user_profile().await.map_err(report)?;
        print_profile(&profile);
      }
      Command::Onboard { file } => {
        let request = read_onboarding(&file)?;
        self
          .client
          .submit_onboarding(request)
          .await
          .map_err(report)?;
        println!("Onboarding complete. Your plan is being prepared.");
      }
      Command::UploadAudio { id, file } => {
        let bytes = std::fs::read(&file)
          .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
        let file_name = file
          .file_name()
          .map(|n| n.to_string_lossy().into_owned())
          .ok_or_else(|| eyre!("Not a file: {}", file.display()))?;
        let content_type = audio_content_type(&file).map(String::from);
        self
          .client
          .upload_audio(id, file_name, content_type, bytes)
          .await
          .map_err(report)?;
        println!("Uploaded audio for ritual #{}", id);
      }
      Command::Dashboard => self.dashboard().await?,
      Command::Health => {
        if self.client.is_online().await {
          let health = self.client.health().await.map_err(report)?;
          println!("online ({})", health.status);
        } else {
          println!("offline");
        }
      }
      Command::Login { email, password } => {
        let password = match password {
          Some(password) => password,
          None => read_password().await?,
        };
        let response = self.client.login(&email, &password).await.map_err(report)?;
        self.session.save(&response.token)?;
        let name = response
          .user
          .as_ref()
          .and_then(|u| u.name.clone())
          .unwrap_or(email);
        println!("Logged in as {}", name);
      }
      Command::Logout => {
        let result = self.client.logout().await;
        self.session.clear()?;
        result.map_err(report)?;
        println!("Logged out");
      }
      Command::Prefs { action } => self.prefs(action).await?,
    }
    Ok(())
  }

  async fn complete(&self, id: i64, data: CompletionData) -> Result<()> {
    // Load what the completion updates optimistically
    let (ritual, plan) = tokio::join!(self.client.ritual(id), self.client.todays_plan());
    if let Err(error) = &ritual {
      debug!(
        id,
        kind = %error.kind,
        message = %error.message,
        "ritual not loaded before completion"
      );
    }
    if let Ok(plan) = &plan {
      if plan.rituals.iter().any(|r| r.id == id && r.completed) {
        println!("Ritual #{} is already completed today", id);
        return Ok(());
      }
    }

    let completion = self.client.complete_ritual(id, data).await.map_err(report)?;
    let title = completion
      .ritual
      .as_ref()
      .map(|r| r.title.clone())
      .unwrap_or_else(|| format!("#{}", id));
    println!("Completed {}", title);

    let stats = match completion.stats {
      Some(stats) => stats,
      None => self.client.user_stats().await.map_err(report)?,
    };
    print_stats(&stats);
    Ok(())
  }

  /// Today's plan, stats and progress, loaded concurrently. Ctrl-C cancels
  /// the pending reads.
  async fn dashboard(&self) -> Result<()> {
    let range = self.prefs.progress_time_range.to_string();
    self.client.prefetch_todays_plan();
    self.client.prefetch_progress(&range);

    let queries = [
      ApiQuery::TodaysPlan,
      ApiQuery::UserStats,
      ApiQuery::Progress { range },
    ];
    let subscriptions: Vec<_> = queries.iter().map(|q| self.client.subscribe(q)).collect();
    let loads = futures::future::join_all(
      queries
        .iter()
        .cloned()
        .zip(&subscriptions)
        .map(|(query, subscription)| self.client.load(subscription, query)),
    );

    let results = tokio::select! {
      results = loads => results,
      _ = tokio::signal::ctrl_c() => {
        for subscription in &subscriptions {
          subscription.cancel();
        }
        info!("dashboard cancelled");
        return Ok(());
      }
    };

    for (query, result) in queries.iter().zip(results) {
      match result {
        Some(Ok(resource)) => print_resource(resource),
        Some(Err(error)) => eprintln!("{}: {}", query.description(), error.user_message()),
        None => {}
      }
      println!();
    }
    Ok(())
  }

  async fn prefs(&mut self, action: PrefsAction) -> Result<()> {
    match action {
      PrefsAction::Show => print_preferences(&self.prefs),
      PrefsAction::Set { key, value, remote } => {
        self.prefs = self.preferences.set(&key, &value)?;
        print_preferences(&self.prefs);

        if remote {
          let mut update = Map::new();
          let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
          update.insert(key, value);
          self
            .client
            .update_preferences(update)
            .await
            .map_err(report)?;
          println!("Synced to your profile");
        }
      }
    }
    Ok(())
  }
}

/// Turn an API failure into a report headed by its user-facing message.
fn report(error: ErrorInfo) -> Report {
  let message = error.user_message();
  Report::new(error).wrap_err(message)
}

async fn read_password() -> Result<String> {
  eprint!("Password: ");
  let mut line = String::new();
  BufReader::new(tokio::io::stdin())
    .read_line(&mut line)
    .await
    .map_err(|e| eyre!("Failed to read password: {}", e))?;
  let password = line.trim_end_matches(['\r', '\n']).to_string();
  if password.is_empty() {
    return Err(eyre!("No password given"));
  }
  Ok(password)
}

fn read_onboarding(path: &Path) -> Result<OnboardingRequest> {
  let contents = std::fs::read_to_string(path)
    .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?;
  // YAML also accepts JSON
  serde_yaml::from_str(&contents)
    .map_err(|e| eyre!("Failed to parse onboarding answers {}: {}", path.display(), e))
}

fn audio_content_type(path: &Path) -> Option<&'static str> {
  let extension = path.extension()?.to_str()?.to_ascii_lowercase();
  match extension.as_str() {
    "mp3" => Some("audio/mpeg"),
    "wav" => Some("audio/wav"),
    "m4a" | "mp4" => Some("audio/mp4"),
    "ogg" => Some("audio/ogg"),
    "webm" => Some("audio/webm"),
    _ => None,
  }
}

// ============================================================================
// Output
// ============================================================================

fn print_resource(resource: Resource) {
  match resource {
    Resource::Plan(plan) => print_plan(&plan),
    Resource::Ritual(ritual) => print_ritual(&ritual),
    Resource::Progress(progress) => print_progress(&progress),
    Resource::ProgressHistory(history) => print_history(&history),
    Resource::UserStats(stats) => print_stats(&stats),
    Resource::UserProfile(profile) => print_profile(&profile),
    Resource::Health(health) => println!("{}", health.status),
  }
}

fn print_plan(plan: &Plan) {
  println!("Plan for {}", plan.date.as_deref().unwrap_or("today"));
  if let Some(focus) = &plan.focus {
    println!("Focus: {}", focus);
  }
  if plan.rituals.is_empty() {
    println!("  No rituals planned");
  }
  for ritual in &plan.rituals {
    let mark = if ritual.completed { "x" } else { " " };
    let minutes = ritual
      .duration_minutes
      .map(|m| format!(" ({} min)", m))
      .unwrap_or_default();
    println!("  [{}] #{} {}{}", mark, ritual.id, ritual.title, minutes);
  }
}

fn print_ritual(ritual: &Ritual) {
  println!("#{} {}", ritual.id, ritual.title);
  for (label, value) in [
    ("Category", ritual.category.as_deref()),
    ("Difficulty", ritual.difficulty.as_deref()),
    ("Audio", ritual.audio_url.as_deref()),
  ] {
    if let Some(value) = value {
      println!("{}: {}", label, value);
    }
  }
  if let Some(minutes) = ritual.duration_minutes {
    println!("Duration: {} min", minutes);
  }
  match ritual.completed_at {
    Some(at) => println!("Completed: {}", at.format("%Y-%m-%d %H:%M")),
    None if ritual.completed => println!("Completed"),
    None => println!("Not completed yet"),
  }
  if let Some(description) = &ritual.description {
    println!("\n{}", description);
  }
  if let Some(average) = ritual.feedback.as_ref().and_then(|f| f.average_rating) {
    println!("Average rating: {:.1}", average);
  }
}

fn print_progress(progress: &ProgressOverview) {
  println!("Progress ({})", progress.range);
  if let Some(score) = progress.vitality_score {
    println!("  Vitality score:    {:.0}", score);
  }
  println!("  Rituals completed: {}", progress.rituals_completed);
  println!("  Total minutes:     {}", progress.total_minutes);
  println!("  Current streak:    {} days", progress.current_streak);
}

fn print_history(history: &ProgressHistory) {
  println!("Progress history ({})", history.range);
  for point in &history.entries {
    let score = point
      .vitality_score
      .map(|s| format!("{:>5.0}", s))
      .unwrap_or_else(|| "    -".to_string());
    println!(
      "  {}  {}  {:>3} rituals  {:>4} min",
      point.date, score, point.rituals_completed, point.minutes
    );
  }
}

fn print_stats(stats: &UserStats) {
  println!("Rituals completed: {}", stats.rituals_completed);
  println!("Minutes:           {}", stats.total_minutes_meditated);
  println!(
    "Streak:            {} days (best {})",
    stats.current_streak, stats.longest_streak
  );
}

fn print_profile(profile: &UserProfile) {
  println!("{}", profile.name.as_deref().unwrap_or(&profile.id));
  if let Some(email) = &profile.email {
    println!("{}", email);
  }
  for (key, value) in &profile.preferences {
    println!("  {}: {}", key, value);
  }
}

fn print_preferences(prefs: &Preferences) {
  // Same field names `prefs set` accepts
  if let Ok(Value::Object(map)) = serde_json::to_value(prefs) {
    for (key, value) in map {
      println!("{}: {}", key, value);
    }
  }
}
