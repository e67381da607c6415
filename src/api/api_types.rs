//! Serde types matching the wellness API payloads.
//!
//! Payloads are parsed into these types right after the transport, so that
//! malformed responses fail as parse errors instead of flowing through the
//! cache untyped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Plans and rituals
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRitual {
  pub id: i64,
  pub title: String,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(default)]
  pub duration_minutes: Option<u32>,
  #[serde(default)]
  pub completed: bool,
  #[serde(default)]
  pub completed_at: Option<DateTime<Utc>>,
}

/// A day's plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
  #[serde(default)]
  pub date: Option<String>,
  #[serde(default)]
  pub focus: Option<String>,
  #[serde(default)]
  pub rituals: Vec<PlanRitual>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackInput {
  #[serde(default)]
  pub rating: Option<u8>,
  #[serde(default)]
  pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RitualFeedback {
  #[serde(default)]
  pub average_rating: Option<f64>,
  #[serde(default)]
  pub user_feedback: Option<FeedbackInput>,
  #[serde(default)]
  pub submitted_at: Option<DateTime<Utc>>,
}

/// Full ritual details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ritual {
  pub id: i64,
  pub title: String,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub category: Option<String>,
  #[serde(default)]
  pub difficulty: Option<String>,
  #[serde(default)]
  pub duration_minutes: Option<u32>,
  #[serde(default)]
  pub audio_url: Option<String>,
  #[serde(default)]
  pub completed: bool,
  #[serde(default)]
  pub completed_at: Option<DateTime<Utc>>,
  #[serde(default)]
  pub feedback: Option<RitualFeedback>,
}

/// Body of `POST /rituals/:id/complete`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionData {
  /// Minutes spent in the ritual
  #[serde(skip_serializing_if = "Option::is_none")]
  pub duration: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

/// Response of `POST /rituals/:id/complete`. Either part may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RitualCompletion {
  #[serde(default)]
  pub ritual: Option<Ritual>,
  #[serde(default)]
  pub stats: Option<UserStats>,
}

// ============================================================================
// Progress
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressOverview {
  #[serde(default)]
  pub range: String,
  #[serde(default)]
  pub vitality_score: Option<f64>,
  #[serde(default)]
  pub rituals_completed: u32,
  #[serde(default)]
  pub total_minutes: u32,
  #[serde(default)]
  pub current_streak: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPoint {
  pub date: String,
  #[serde(default)]
  pub vitality_score: Option<f64>,
  #[serde(default)]
  pub rituals_completed: u32,
  #[serde(default)]
  pub minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressHistory {
  #[serde(default)]
  pub range: String,
  #[serde(default)]
  pub entries: Vec<ProgressPoint>,
}

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStats {
  #[serde(default)]
  pub rituals_completed: u32,
  #[serde(default)]
  pub total_minutes_meditated: u32,
  #[serde(default)]
  pub current_streak: u32,
  #[serde(default)]
  pub longest_streak: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
  pub id: String,
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub email: Option<String>,
  /// Free-form preference map owned by the server
  #[serde(default)]
  pub preferences: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingRequest {
  pub goals: Vec<String>,
  pub experience_level: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub preferred_time: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub session_length_minutes: Option<u32>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub focus_areas: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
  pub email: String,
  pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
  pub token: String,
  #[serde(default)]
  pub user: Option<UserProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
  #[serde(default)]
  pub status: String,
}

// ============================================================================
// Cached resources
// ============================================================================

/// Every payload the cache may hold, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
  Plan(Plan),
  Ritual(Ritual),
  Progress(ProgressOverview),
  ProgressHistory(ProgressHistory),
  UserStats(UserStats),
  UserProfile(UserProfile),
  Health(Health),
}

/// Conversion between a payload type and its [`Resource`] variant.
pub trait CachedResource: Sized {
  fn into_resource(self) -> Resource;

  fn from_resource(resource: Resource) -> Option<Self>;
}

macro_rules! cached_resource {
  ($($variant:ident => $ty:ty),* $(,)?) => {
    $(
      impl CachedResource for $ty {
        fn into_resource(self) -> Resource {
          Resource::$variant(self)
        }

        fn from_resource(resource: Resource) -> Option<Self> {
          match resource {
            Resource::$variant(value) => Some(value),
            _ => None,
          }
        }
      }
    )*
  };
}

cached_resource! {
  Plan => Plan,
  Ritual => Ritual,
  Progress => ProgressOverview,
  ProgressHistory => ProgressHistory,
  UserStats => UserStats,
  UserProfile => UserProfile,
  Health => Health,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_plan_parses_camel_case() {
    let plan: Plan = serde_json::from_value(json!({
      "date": "2026-10-19",
      "rituals": [
        {"id": 42, "title": "Morning breath", "durationMinutes": 10, "completed": false},
        {"id": 7, "title": "Evening stretch", "completedAt": "2026-10-19T20:00:00Z", "completed": true}
      ]
    }))
    .unwrap();

    assert_eq!(plan.rituals.len(), 2);
    assert_eq!(plan.rituals[0].duration_minutes, Some(10));
    assert!(plan.rituals[1].completed_at.is_some());
  }

  #[test]
  fn test_ritual_requires_id() {
    let result = serde_json::from_value::<Ritual>(json!({"title": "No id"}));
    assert!(result.is_err());
  }

  #[test]
  fn test_resource_variant_round_trip() {
    let stats = UserStats {
      rituals_completed: 3,
      ..UserStats::default()
    };
    let resource = stats.clone().into_resource();

    assert_eq!(UserStats::from_resource(resource.clone()), Some(stats));
    assert_eq!(Plan::from_resource(resource), None);
  }
}
