//! Query keys, per-family cache windows and invalidation rules for the
//! wellness API.

use std::time::Duration;

use crate::cache::{Invalidates, QueryKey, QueryOptions, Segment};
use crate::error::ErrorInfo;
use crate::query_key;

use super::api_types::{CachedResource, Resource};
use super::client::ApiClient;

// ============================================================================
// Key factory
// ============================================================================

pub mod user {
  use super::*;

  pub fn all() -> QueryKey {
    query_key!["user"]
  }

  pub fn profile() -> QueryKey {
    all().child("profile")
  }

  pub fn stats() -> QueryKey {
    all().child("stats")
  }
}

pub mod plan {
  use super::*;

  pub fn all() -> QueryKey {
    query_key!["plan"]
  }

  pub fn today() -> QueryKey {
    all().child("today")
  }

  pub fn date(date: &str) -> QueryKey {
    all().child("date").child(date)
  }
}

pub mod rituals {
  use super::*;

  pub fn all() -> QueryKey {
    query_key!["rituals"]
  }

  pub fn detail(id: i64) -> QueryKey {
    all().child("detail").child(id)
  }

  pub fn completed() -> QueryKey {
    all().child("completed")
  }
}

pub mod progress {
  use super::*;

  pub fn all() -> QueryKey {
    query_key!["progress"]
  }

  pub fn overview(range: &str) -> QueryKey {
    all().child("overview").child(range)
  }

  pub fn history(range: &str) -> QueryKey {
    all().child("history").child(range)
  }
}

pub fn health() -> QueryKey {
  query_key!["health"]
}

const MINUTE: Duration = Duration::from_secs(60);

/// Staleness and retention windows for the family a key belongs to.
pub fn options_for(key: &QueryKey) -> QueryOptions {
  let family = match key.segments().first() {
    Some(Segment::Str(family)) => family.as_str(),
    _ => "",
  };
  match family {
    "user" => QueryOptions::new(10 * MINUTE, 60 * MINUTE),
    "plan" => QueryOptions::new(2 * MINUTE, 15 * MINUTE),
    "rituals" => QueryOptions::new(30 * MINUTE, 60 * MINUTE),
    "progress" => QueryOptions::new(5 * MINUTE, 30 * MINUTE),
    "health" => QueryOptions::new(Duration::from_secs(30), MINUTE),
    _ => QueryOptions::default(),
  }
}

// ============================================================================
// Queries
// ============================================================================

/// Every cacheable read the API offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiQuery {
  TodaysPlan,
  PlanForDate { date: String },
  Ritual { id: i64 },
  Progress { range: String },
  ProgressHistory { range: String },
  UserStats,
  UserProfile,
  Health,
}

impl ApiQuery {
  pub fn key(&self) -> QueryKey {
    match self {
      Self::TodaysPlan => plan::today(),
      Self::PlanForDate { date } => plan::date(date),
      Self::Ritual { id } => rituals::detail(*id),
      Self::Progress { range } => progress::overview(range),
      Self::ProgressHistory { range } => progress::history(range),
      Self::UserStats => user::stats(),
      Self::UserProfile => user::profile(),
      Self::Health => health(),
    }
  }

  pub fn options(&self) -> QueryOptions {
    options_for(&self.key())
  }

  pub fn description(&self) -> String {
    match self {
      Self::TodaysPlan => "today's plan".to_string(),
      Self::PlanForDate { date } => format!("plan for {}", date),
      Self::Ritual { id } => format!("ritual {}", id),
      Self::Progress { range } => format!("progress ({})", range),
      Self::ProgressHistory { range } => format!("progress history ({})", range),
      Self::UserStats => "user stats".to_string(),
      Self::UserProfile => "user profile".to_string(),
      Self::Health => "health".to_string(),
    }
  }

  /// Fetch this query from the network.
  pub async fn fetch(self, api: ApiClient) -> Result<Resource, ErrorInfo> {
    match self {
      Self::TodaysPlan => api.get_todays_plan().await.map(CachedResource::into_resource),
      Self::PlanForDate { date } => api
        .get_plan_for_date(&date)
        .await
        .map(CachedResource::into_resource),
      Self::Ritual { id } => api.get_ritual(id).await.map(CachedResource::into_resource),
      Self::Progress { range } => api
        .get_progress(&range)
        .await
        .map(CachedResource::into_resource),
      Self::ProgressHistory { range } => api
        .get_progress_history(&range)
        .await
        .map(CachedResource::into_resource),
      Self::UserStats => api.get_user_stats().await.map(CachedResource::into_resource),
      Self::UserProfile => api
        .get_user_profile()
        .await
        .map(CachedResource::into_resource),
      Self::Health => api.health_check().await.map(CachedResource::into_resource),
    }
  }
}

// ============================================================================
// Mutations
// ============================================================================

/// Every mutation the API offers, for invalidation routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
  CompleteRitual { ritual_id: i64 },
  SubmitRitualFeedback { ritual_id: i64 },
  UploadRitualAudio { ritual_id: i64 },
  SubmitOnboarding,
  UpdatePreferences,
  Login,
  Logout,
}

impl Invalidates for MutationKind {
  fn name(&self) -> &'static str {
    match self {
      Self::CompleteRitual { .. } => "complete_ritual",
      Self::SubmitRitualFeedback { .. } => "submit_ritual_feedback",
      Self::UploadRitualAudio { .. } => "upload_ritual_audio",
      Self::SubmitOnboarding => "submit_onboarding",
      Self::UpdatePreferences => "update_preferences",
      Self::Login => "login",
      Self::Logout => "logout",
    }
  }

  fn invalidated_prefixes(&self) -> Vec<QueryKey> {
    match self {
      Self::CompleteRitual { ritual_id } => vec![
        plan::today(),
        rituals::detail(*ritual_id),
        rituals::completed(),
        user::stats(),
        progress::all(),
      ],
      Self::SubmitRitualFeedback { ritual_id } | Self::UploadRitualAudio { ritual_id } => {
        vec![rituals::detail(*ritual_id)]
      }
      Self::SubmitOnboarding => vec![user::all(), plan::today()],
      // Plans depend on preferences
      Self::UpdatePreferences => vec![user::profile(), plan::all()],
      Self::Login | Self::Logout => vec![QueryKey::default()],
    }
  }
}
