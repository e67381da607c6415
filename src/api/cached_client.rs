//! Cached wellness client: reads go through the query cache, writes go
//! through optimistic mutations followed by invalidation.

use chrono::Utc;
use color_eyre::Result;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{
  CacheEntry, CacheStats, Invalidates, InvalidationRouter, MutationController, OptimisticUpdate,
  QueryCache, QueryKey, Subscription,
};
use crate::config::Config;
use crate::error::{ErrorInfo, ErrorKind};

use super::api_types::{
  CachedResource, CompletionData, FeedbackInput, Health, LoginResponse, OnboardingRequest, Plan,
  ProgressHistory, ProgressOverview, Resource, Ritual, RitualCompletion, RitualFeedback,
  UserProfile, UserStats,
};
use super::auth::AuthState;
use super::client::ApiClient;
use super::keys::{self, ApiQuery, MutationKind};
use super::transport::Transport;

/// Wellness client with a shared query cache.
///
/// Clones share the cache, so every consumer in the process sees the same
/// entries and the same in-flight fetches.
#[derive(Clone)]
pub struct WellnessClient {
  api: ApiClient,
  cache: QueryCache<Resource>,
  mutations: MutationController<Resource>,
  router: InvalidationRouter<Resource>,
}

impl WellnessClient {
  pub fn new(api: ApiClient, cache: QueryCache<Resource>) -> Self {
    Self {
      api,
      mutations: MutationController::new(cache.clone()),
      router: InvalidationRouter::new(cache.clone()),
      cache,
    }
  }

  /// Build the client stack from configuration and the environment.
  pub fn from_config(config: &Config) -> Result<Self> {
    let auth = match Config::auth_token() {
      Some(token) => AuthState::with_token(token),
      None => AuthState::new(),
    };
    let transport = Transport::new(&config.api.base_url, config.api.timeout(), auth)?;
    let api = ApiClient::new(
      transport,
      config.retry.query_policy(),
      config.retry.mutation_policy(),
    );
    debug!(base_url = %config.api.base_url, "wellness client ready");

    Ok(Self::new(api, QueryCache::new()))
  }

  pub fn cache(&self) -> &QueryCache<Resource> {
    &self.cache
  }

  pub fn auth(&self) -> &AuthState {
    self.api.auth()
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  async fn fetch<T: CachedResource>(&self, query: ApiQuery) -> Result<T, ErrorInfo> {
    let key = query.key();
    let options = query.options();
    let api = self.api.clone();
    let resource = self
      .cache
      .ensure_fresh(&key, move || query.fetch(api), options)
      .await?;
    typed(&key, resource)
  }

  pub async fn todays_plan(&self) -> Result<Plan, ErrorInfo> {
    self.fetch(ApiQuery::TodaysPlan).await
  }

  pub async fn plan_for_date(&self, date: &str) -> Result<Plan, ErrorInfo> {
    self
      .fetch(ApiQuery::PlanForDate {
        date: date.to_string(),
      })
      .await
  }

  pub async fn ritual(&self, id: i64) -> Result<Ritual, ErrorInfo> {
    self.fetch(ApiQuery::Ritual { id }).await
  }

  pub async fn progress(&self, range: &str) -> Result<ProgressOverview, ErrorInfo> {
    self
      .fetch(ApiQuery::Progress {
        range: range.to_string(),
      })
      .await
  }

  pub async fn progress_history(&self, range: &str) -> Result<ProgressHistory, ErrorInfo> {
    self
      .fetch(ApiQuery::ProgressHistory {
        range: range.to_string(),
      })
      .await
  }

  pub async fn user_stats(&self) -> Result<UserStats, ErrorInfo> {
    self.fetch(ApiQuery::UserStats).await
  }

  pub async fn user_profile(&self) -> Result<UserProfile, ErrorInfo> {
    self.fetch(ApiQuery::UserProfile).await
  }

  pub async fn health(&self) -> Result<Health, ErrorInfo> {
    self.fetch(ApiQuery::Health).await
  }

  /// Whether the API answers a health check. Never cached, never fails.
  pub async fn is_online(&self) -> bool {
    match self.api.health_check().await {
      Ok(_) => true,
      Err(error) => {
        debug!(kind = %error.kind, "health check failed");
        false
      }
    }
  }

  /// Current entry for `query`, refreshing it in the background when stale.
  pub fn revalidate(&self, query: ApiQuery) -> CacheEntry<Resource> {
    let key = query.key();
    let options = query.options();
    let api = self.api.clone();
    self.cache.revalidate(&key, move || query.fetch(api), options)
  }

  /// Warm the cache for `query` without waiting for the result.
  pub fn prefetch(&self, query: ApiQuery) {
    debug!(query = %query.description(), "prefetching");
    self.revalidate(query);
  }

  pub fn prefetch_todays_plan(&self) {
    self.prefetch(ApiQuery::TodaysPlan);
  }

  pub fn prefetch_progress(&self, range: &str) {
    self.prefetch(ApiQuery::Progress {
      range: range.to_string(),
    });
  }

  /// Register interest in `query` so its entry survives garbage collection.
  pub fn subscribe(&self, query: &ApiQuery) -> Subscription<Resource> {
    self.cache.subscribe(&query.key())
  }

  /// Read through a subscription. `None` once the subscription is cancelled.
  pub async fn load(
    &self,
    subscription: &Subscription<Resource>,
    query: ApiQuery,
  ) -> Option<Result<Resource, ErrorInfo>> {
    let options = query.options();
    let api = self.api.clone();
    subscription
      .ensure_fresh(move || query.fetch(api), options)
      .await
  }

  /// Mark every cached query stale after connectivity returns.
  pub fn sync_after_reconnect(&self) -> Vec<QueryKey> {
    let keys = self.cache.invalidate_all();
    info!(count = keys.len(), "invalidated cache after reconnect");
    keys
  }

  pub fn start_gc(&self, every: Duration) -> JoinHandle<()> {
    self.cache.spawn_gc(every)
  }

  pub fn stats(&self) -> CacheStats {
    self.cache.stats()
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  /// Complete a ritual.
  ///
  /// Optimistically marks the ritual and its entry in today's plan as
  /// completed and bumps the user's counters.
  pub async fn complete_ritual(
    &self,
    id: i64,
    data: CompletionData,
  ) -> Result<RitualCompletion, ErrorInfo> {
    let kind = MutationKind::CompleteRitual { ritual_id: id };
    let now = Utc::now();
    let minutes = data.duration.unwrap_or(0);

    let updates = vec![
      OptimisticUpdate::new(
        keys::rituals::detail(id),
        edit(move |ritual: &mut Ritual| {
          ritual.completed = true;
          ritual.completed_at = Some(now);
        }),
      ),
      OptimisticUpdate::new(
        keys::plan::today(),
        edit(move |plan: &mut Plan| {
          for entry in plan.rituals.iter_mut().filter(|r| r.id == id) {
            entry.completed = true;
            entry.completed_at = Some(now);
          }
        }),
      ),
      OptimisticUpdate::new(
        keys::user::stats(),
        edit(move |stats: &mut UserStats| {
          stats.rituals_completed = stats.rituals_completed.saturating_add(1);
          stats.total_minutes_meditated = stats.total_minutes_meditated.saturating_add(minutes);
        }),
      ),
    ];

    let api = self.api.clone();
    let outcome = self
      .mutations
      .execute(
        kind.name(),
        updates,
        async move { api.complete_ritual(id, &data).await },
        move |completion: &RitualCompletion| {
          let mut authoritative = Vec::new();
          if let Some(ritual) = &completion.ritual {
            authoritative.push((keys::rituals::detail(id), ritual.clone().into_resource()));
          }
          if let Some(stats) = &completion.stats {
            authoritative.push((keys::user::stats(), stats.clone().into_resource()));
          }
          authoritative
        },
      )
      .await;

    self.router.after_outcome(&kind, &outcome);
    outcome.into_result()
  }

  /// Submit feedback for a ritual, showing it on the ritual immediately.
  pub async fn submit_feedback(
    &self,
    id: i64,
    feedback: FeedbackInput,
  ) -> Result<RitualFeedback, ErrorInfo> {
    let kind = MutationKind::SubmitRitualFeedback { ritual_id: id };
    let now = Utc::now();
    let optimistic = feedback.clone();

    let updates = vec![OptimisticUpdate::new(
      keys::rituals::detail(id),
      edit(move |ritual: &mut Ritual| {
        let mut current = ritual.feedback.take().unwrap_or_default();
        current.user_feedback = Some(optimistic);
        current.submitted_at = Some(now);
        ritual.feedback = Some(current);
      }),
    )];

    let api = self.api.clone();
    let outcome = self
      .mutations
      .execute(
        kind.name(),
        updates,
        async move { api.submit_ritual_feedback(id, &feedback).await },
        |_| Vec::new(),
      )
      .await;

    self.router.after_outcome(&kind, &outcome);
    outcome.into_result()
  }

  /// Merge `preferences` into the user's server-side preferences.
  pub async fn update_preferences(
    &self,
    preferences: Map<String, Value>,
  ) -> Result<UserProfile, ErrorInfo> {
    let kind = MutationKind::UpdatePreferences;
    let optimistic = preferences.clone();

    let updates = vec![OptimisticUpdate::new(
      keys::user::profile(),
      edit(move |profile: &mut UserProfile| {
        profile.preferences.extend(optimistic);
      }),
    )];

    let api = self.api.clone();
    let outcome = self
      .mutations
      .execute(
        kind.name(),
        updates,
        async move { api.update_user_preferences(&preferences).await },
        |profile: &UserProfile| vec![(keys::user::profile(), profile.clone().into_resource())],
      )
      .await;

    self.router.after_outcome(&kind, &outcome);
    outcome.into_result()
  }

  pub async fn submit_onboarding(&self, request: OnboardingRequest) -> Result<Value, ErrorInfo> {
    let kind = MutationKind::SubmitOnboarding;
    let api = self.api.clone();
    let outcome = self
      .mutations
      .execute(
        kind.name(),
        Vec::new(),
        async move { api.submit_onboarding(&request).await },
        |_| Vec::new(),
      )
      .await;

    self.router.after_outcome(&kind, &outcome);
    outcome.into_result()
  }

  pub async fn upload_audio(
    &self,
    id: i64,
    file_name: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
  ) -> Result<Value, ErrorInfo> {
    let kind = MutationKind::UploadRitualAudio { ritual_id: id };
    let api = self.api.clone();
    let outcome = self
      .mutations
      .execute(
        kind.name(),
        Vec::new(),
        async move {
          api
            .upload_ritual_audio(id, &file_name, content_type.as_deref(), bytes)
            .await
        },
        |_| Vec::new(),
      )
      .await;

    self.router.after_outcome(&kind, &outcome);
    outcome.into_result()
  }

  pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ErrorInfo> {
    let kind = MutationKind::Login;
    let api = self.api.clone();
    let (email, password) = (email.to_string(), password.to_string());
    let outcome = self
      .mutations
      .execute(
        kind.name(),
        Vec::new(),
        async move { api.login(&email, &password).await },
        |response: &LoginResponse| {
          response
            .user
            .iter()
            .map(|user| (keys::user::profile(), user.clone().into_resource()))
            .collect()
        },
      )
      .await;

    self.router.after_outcome(&kind, &outcome);
    outcome.into_result()
  }

  /// Log out and drop everything cached for the previous user.
  pub async fn logout(&self) -> Result<(), ErrorInfo> {
    let result = self.api.logout().await;
    self.router.after_mutation(&MutationKind::Logout);
    self.cache.clear();
    result
  }
}

fn typed<T: CachedResource>(key: &QueryKey, resource: Resource) -> Result<T, ErrorInfo> {
  T::from_resource(resource).ok_or_else(|| {
    ErrorInfo::new(
      ErrorKind::Unknown,
      format!("unexpected payload cached under {}", key),
    )
  })
}

/// Lift an in-place edit of one payload type to a cache transform. Entries
/// holding another variant are left as they are.
fn edit<T, F>(f: F) -> impl FnOnce(&Resource) -> Resource + Send + 'static
where
  T: CachedResource,
  F: FnOnce(&mut T) + Send + 'static,
{
  move |resource: &Resource| match T::from_resource(resource.clone()) {
    Some(mut value) => {
      f(&mut value);
      value.into_resource()
    }
    None => resource.clone(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::api_types::PlanRitual;
  use crate::cache::RetryPolicy;
  use mockito::{Matcher, Server};
  use serde_json::json;

  fn client(server: &Server) -> WellnessClient {
    let transport =
      Transport::new(&server.url(), Duration::from_secs(5), AuthState::new()).unwrap();
    let fast =
      |attempts| RetryPolicy::new(attempts, Duration::from_millis(5), Duration::from_millis(20));
    let api = ApiClient::new(transport, fast(3), fast(2).conservative());
    WellnessClient::new(api, QueryCache::new())
  }

  fn ritual(id: i64) -> Ritual {
    Ritual {
      id,
      title: "Morning breath".into(),
      description: None,
      category: None,
      difficulty: None,
      duration_minutes: Some(10),
      audio_url: None,
      completed: false,
      completed_at: None,
      feedback: None,
    }
  }

  fn plan_with(id: i64) -> Plan {
    Plan {
      date: Some("2026-10-19".into()),
      focus: None,
      rituals: vec![PlanRitual {
        id,
        title: "Morning breath".into(),
        category: None,
        duration_minutes: Some(10),
        completed: false,
        completed_at: None,
      }],
    }
  }

  fn seed(client: &WellnessClient, key: QueryKey, value: impl CachedResource) {
    client.cache().write_confirmed(&key, value.into_resource());
  }

  #[tokio::test]
  async fn test_second_read_served_from_cache() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("GET", "/api/plan/today")
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(r#"{"rituals":[{"id":1,"title":"Breath"}]}"#)
      .expect(1)
      .create_async()
      .await;
    let client = client(&server);

    let first = client.todays_plan().await.unwrap();
    let second = client.todays_plan().await.unwrap();

    mock.assert_async().await;
    assert_eq!(first, second);
  }

  #[tokio::test]
  async fn test_failed_completion_rolls_back() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("POST", "/api/rituals/42/complete")
      .with_status(500)
      .expect(2)
      .create_async()
      .await;
    let client = client(&server);
    seed(&client, keys::rituals::detail(42), ritual(42));
    seed(&client, keys::user::stats(), UserStats::default());
    let before = client.cache().peek(&keys::rituals::detail(42));

    let error = client
      .complete_ritual(
        42,
        CompletionData {
          duration: Some(10),
          notes: None,
        },
      )
      .await
      .unwrap_err();

    mock.assert_async().await;
    assert_eq!(error.kind, ErrorKind::ServerError);
    assert!(error.retryable);
    assert_eq!(client.cache().peek(&keys::rituals::detail(42)), before);
    assert_eq!(
      client.cache().data(&keys::user::stats()),
      Some(UserStats::default().into_resource())
    );
    // Nothing was invalidated
    assert!(!client.cache().read(&keys::rituals::detail(42)).invalidated);
  }

  #[tokio::test]
  async fn test_completion_invalidates_and_revalidates() {
    let mut server = Server::new_async().await;
    server
      .mock("POST", "/api/rituals/7/complete")
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(r#"{"stats":{"ritualsCompleted":1,"totalMinutesMeditated":10}}"#)
      .create_async()
      .await;
    let refetch = server
      .mock("GET", "/api/plan/today")
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(r#"{"rituals":[{"id":7,"title":"Morning breath","completed":true}]}"#)
      .expect(1)
      .create_async()
      .await;
    let client = client(&server);
    seed(&client, keys::plan::today(), plan_with(7));
    seed(&client, keys::progress::overview("7d"), ProgressOverview {
      range: "7d".into(),
      vitality_score: None,
      rituals_completed: 0,
      total_minutes: 0,
      current_streak: 0,
    });
    seed(&client, keys::user::profile(), UserProfile {
      id: "u1".into(),
      name: None,
      email: None,
      preferences: Map::new(),
    });

    client
      .complete_ritual(7, CompletionData::default())
      .await
      .unwrap();

    let cache = client.cache();
    assert!(cache.read(&keys::plan::today()).invalidated);
    assert!(cache.read(&keys::progress::overview("7d")).invalidated);
    assert!(cache.read(&keys::user::stats()).invalidated);
    assert!(!cache.read(&keys::user::profile()).invalidated);

    // Old data stays readable while the refetch runs
    let entry = client.revalidate(ApiQuery::TodaysPlan);
    let plan = Plan::from_resource(entry.data.unwrap()).unwrap();
    assert!(plan.rituals[0].completed);
    assert_eq!(client.stats().in_flight, 1);

    let refreshed = client.todays_plan().await.unwrap();
    refetch.assert_async().await;
    assert!(refreshed.rituals[0].completed);
    assert!(!cache.read(&keys::plan::today()).invalidated);
  }

  #[tokio::test]
  async fn test_completion_counters_saturate() {
    let mut server = Server::new_async().await;
    server
      .mock("POST", "/api/rituals/1/complete")
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body("{}")
      .create_async()
      .await;
    let client = client(&server);
    seed(&client, keys::user::stats(), UserStats {
      rituals_completed: 4,
      total_minutes_meditated: 100,
      ..UserStats::default()
    });

    client
      .complete_ritual(
        1,
        CompletionData {
          duration: Some(u32::MAX),
          notes: None,
        },
      )
      .await
      .unwrap();

    let stats = UserStats::from_resource(client.cache().data(&keys::user::stats()).unwrap()).unwrap();
    assert_eq!(stats.rituals_completed, 5);
    assert_eq!(stats.total_minutes_meditated, u32::MAX);
  }

  #[tokio::test]
  async fn test_preferences_merge_optimistically() {
    let mut server = Server::new_async().await;
    server
      .mock("PATCH", "/api/user/preferences")
      .match_body(Matcher::Json(json!({"theme": "dark"})))
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(r#"{"id":"u1","preferences":{"theme":"dark","sound":true}}"#)
      .create_async()
      .await;
    let client = client(&server);
    let mut preferences = Map::new();
    preferences.insert("sound".into(), json!(true));
    seed(&client, keys::user::profile(), UserProfile {
      id: "u1".into(),
      name: None,
      email: None,
      preferences,
    });

    let mut update = Map::new();
    update.insert("theme".into(), json!("dark"));
    let profile = client.update_preferences(update).await.unwrap();

    assert_eq!(profile.preferences.get("theme"), Some(&json!("dark")));
    let cached = UserProfile::from_resource(client.cache().data(&keys::user::profile()).unwrap());
    assert_eq!(cached.unwrap().preferences.len(), 2);
  }

  #[tokio::test]
  async fn test_feedback_shows_on_ritual() {
    let mut server = Server::new_async().await;
    server
      .mock("POST", "/api/rituals/3/feedback")
      .with_status(201)
      .with_header("content-type", "application/json")
      .with_body(r#"{"averageRating":4.5}"#)
      .create_async()
      .await;
    let client = client(&server);
    seed(&client, keys::rituals::detail(3), ritual(3));

    let feedback = FeedbackInput {
      rating: Some(5),
      comment: Some("calming".into()),
    };
    client.submit_feedback(3, feedback.clone()).await.unwrap();

    let cached = Ritual::from_resource(client.cache().data(&keys::rituals::detail(3)).unwrap());
    let cached = cached.unwrap().feedback.unwrap();
    assert_eq!(cached.user_feedback, Some(feedback));
    assert!(client.cache().read(&keys::rituals::detail(3)).invalidated);
  }

  #[tokio::test]
  async fn test_is_online_is_silent() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("GET", "/api/health")
      .with_status(503)
      .expect(2)
      .create_async()
      .await;

    assert!(!client(&server).is_online().await);
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_sync_after_reconnect_marks_everything_stale() {
    let server = Server::new_async().await;
    let client = client(&server);
    seed(&client, keys::plan::today(), plan_with(1));
    seed(&client, keys::rituals::detail(1), ritual(1));

    let stale = client.sync_after_reconnect();

    assert_eq!(stale.len(), 2);
    assert!(client.cache().read(&keys::rituals::detail(1)).invalidated);
  }

  #[tokio::test]
  async fn test_login_caches_profile_and_sets_token() {
    let mut server = Server::new_async().await;
    server
      .mock("POST", "/api/auth/login")
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body(r#"{"token":"t1","user":{"id":"u1","name":"Ana"}}"#)
      .create_async()
      .await;
    let client = client(&server);
    seed(&client, keys::user::stats(), UserStats::default());

    let response = client.login("a@b.c", "pw").await.unwrap();

    assert_eq!(response.token, "t1");
    assert_eq!(client.auth().token().as_deref(), Some("t1"));
    let profile = UserProfile::from_resource(client.cache().data(&keys::user::profile()).unwrap());
    assert_eq!(profile.unwrap().name.as_deref(), Some("Ana"));
    // A new identity makes everything cached before it stale
    assert!(client.cache().read(&keys::user::stats()).invalidated);
  }

  #[tokio::test]
  async fn test_logout_empties_cache_even_when_server_fails() {
    let mut server = Server::new_async().await;
    server
      .mock("POST", "/api/auth/logout")
      .with_status(500)
      .expect(2)
      .create_async()
      .await;
    let client = client(&server);
    client.auth().set("secret");
    seed(&client, keys::plan::today(), plan_with(1));
    seed(&client, keys::user::stats(), UserStats::default());

    let error = client.logout().await.unwrap_err();

    assert_eq!(error.kind, ErrorKind::ServerError);
    assert_eq!(client.auth().token(), None);
    assert_eq!(client.stats().entries, 0);
    assert!(client.cache().peek(&keys::plan::today()).is_none());
  }

  #[test]
  fn test_edit_ignores_other_variants() {
    let transform = edit(|ritual: &mut Ritual| ritual.completed = true);
    let stats = UserStats::default().into_resource();
    assert_eq!(transform(&stats), stats);
  }
}
