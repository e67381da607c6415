//! Typed wellness API client.
//!
//! Wraps the transport with retry policies and turns every failure into a
//! classified [`ErrorInfo`] before it leaves this module.

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::cache::RetryPolicy;
use crate::error::{classify, ErrorInfo, ErrorKind};

use super::api_types::{
  CompletionData, FeedbackInput, Health, LoginRequest, LoginResponse, OnboardingRequest, Plan,
  ProgressHistory, ProgressOverview, Ritual, RitualCompletion, RitualFeedback, UserProfile,
  UserStats,
};
use super::auth::AuthState;
use super::transport::{ApiRequest, MultipartField, ResponseBody, Transport, TransportFailure};

/// Wellness API client
#[derive(Clone)]
pub struct ApiClient {
  transport: Transport,
  query_retry: RetryPolicy,
  mutation_retry: RetryPolicy,
}

impl ApiClient {
  pub fn new(transport: Transport, query_retry: RetryPolicy, mutation_retry: RetryPolicy) -> Self {
    Self {
      transport,
      query_retry,
      mutation_retry,
    }
  }

  pub fn auth(&self) -> &AuthState {
    self.transport.auth()
  }

  /// One request, decoded and classified. Never retries.
  async fn attempt<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, ErrorInfo> {
    let result = match self.transport.send(request).await {
      Ok(response) => decode(response.body),
      Err(failure) => Err(failure),
    };
    result.map_err(|failure| {
      let error = classify(&failure);
      if error.kind == ErrorKind::Unauthorized {
        warn!(path = %request.path, "credential rejected, expiring session");
        self.auth().expire();
      }
      error
    })
  }

  async fn run<T: DeserializeOwned>(
    &self,
    policy: RetryPolicy,
    request: ApiRequest,
  ) -> Result<T, ErrorInfo> {
    policy.run(|| self.attempt(&request)).await
  }

  async fn query<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ErrorInfo> {
    self.run(self.query_retry, request).await
  }

  async fn mutate<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T, ErrorInfo> {
    self.run(self.mutation_retry, request).await
  }

  // ==========================================================================
  // Health and auth
  // ==========================================================================

  /// Health check with a single retry.
  pub async fn health_check(&self) -> Result<Health, ErrorInfo> {
    let policy = RetryPolicy::new(2, self.query_retry.base_delay, self.query_retry.max_delay);
    let request = ApiRequest::get("/api/health").header("Cache-Control", "no-cache");
    self.run(policy, request).await
  }

  /// Log in and store the returned token.
  pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ErrorInfo> {
    let body = LoginRequest {
      email: email.to_string(),
      password: password.to_string(),
    };
    let response: LoginResponse = self
      .mutate(ApiRequest::post("/api/auth/login").json(to_json(&body)?))
      .await?;
    self.auth().set(response.token.clone());
    info!("logged in");
    Ok(response)
  }

  /// Log out. The local credential is dropped even if the server call fails.
  pub async fn logout(&self) -> Result<(), ErrorInfo> {
    let result: Result<Value, ErrorInfo> = self.mutate(ApiRequest::post("/api/auth/logout")).await;
    self.auth().clear();
    info!("logged out");
    result.map(|_| ())
  }

  // ==========================================================================
  // User
  // ==========================================================================

  pub async fn get_user_profile(&self) -> Result<UserProfile, ErrorInfo> {
    self.query(ApiRequest::get("/api/user/profile")).await
  }

  pub async fn update_user_preferences(
    &self,
    preferences: &Map<String, Value>,
  ) -> Result<UserProfile, ErrorInfo> {
    self
      .mutate(ApiRequest::patch("/api/user/preferences").json(Value::Object(preferences.clone())))
      .await
  }

  pub async fn get_user_stats(&self) -> Result<UserStats, ErrorInfo> {
    self.query(ApiRequest::get("/api/user/stats")).await
  }

  pub async fn submit_onboarding(&self, request: &OnboardingRequest) -> Result<Value, ErrorInfo> {
    self
      .mutate(ApiRequest::post("/api/onboarding").json(to_json(request)?))
      .await
  }

  // ==========================================================================
  // Plans and rituals
  // ==========================================================================

  pub async fn get_todays_plan(&self) -> Result<Plan, ErrorInfo> {
    self.query(ApiRequest::get("/api/plan/today")).await
  }

  pub async fn get_plan_for_date(&self, date: &str) -> Result<Plan, ErrorInfo> {
    self
      .query(ApiRequest::get(format!("/api/plan/date/{}", date)))
      .await
  }

  pub async fn get_ritual(&self, id: i64) -> Result<Ritual, ErrorInfo> {
    self
      .query(ApiRequest::get(format!("/api/rituals/{}", id)))
      .await
  }

  pub async fn complete_ritual(
    &self,
    id: i64,
    data: &CompletionData,
  ) -> Result<RitualCompletion, ErrorInfo> {
    debug!(ritual_id = id, "completing ritual");
    self
      .mutate(ApiRequest::post(format!("/api/rituals/{}/complete", id)).json(to_json(data)?))
      .await
  }

  pub async fn submit_ritual_feedback(
    &self,
    id: i64,
    feedback: &FeedbackInput,
  ) -> Result<RitualFeedback, ErrorInfo> {
    self
      .mutate(ApiRequest::post(format!("/api/rituals/{}/feedback", id)).json(to_json(feedback)?))
      .await
  }

  /// Upload a recording for a ritual as the multipart field `audio`.
  pub async fn upload_ritual_audio(
    &self,
    id: i64,
    file_name: &str,
    content_type: Option<&str>,
    bytes: Vec<u8>,
  ) -> Result<Value, ErrorInfo> {
    let request =
      ApiRequest::post(format!("/api/rituals/{}/audio", id)).multipart(vec![MultipartField::File {
        name: "audio".to_string(),
        file_name: file_name.to_string(),
        content_type: content_type.map(String::from),
        bytes,
      }]);
    self.mutate(request).await
  }

  // ==========================================================================
  // Progress
  // ==========================================================================

  pub async fn get_progress(&self, range: &str) -> Result<ProgressOverview, ErrorInfo> {
    self
      .query(ApiRequest::get("/api/progress").query("range", range))
      .await
  }

  pub async fn get_progress_history(&self, range: &str) -> Result<ProgressHistory, ErrorInfo> {
    self
      .query(ApiRequest::get("/api/progress/history").query("range", range))
      .await
  }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value, ErrorInfo> {
  serde_json::to_value(value)
    .map_err(|e| ErrorInfo::new(ErrorKind::Validation, format!("invalid request body: {}", e)))
}

/// Decode a successful response body into `T`.
///
/// An empty body decodes as `null`, falling back to `{}` so that payload
/// types made only of optional fields still parse.
fn decode<T: DeserializeOwned>(body: ResponseBody) -> Result<T, TransportFailure> {
  let parse_failure = |e: serde_json::Error| TransportFailure::Parse {
    message: e.to_string(),
  };
  match body {
    ResponseBody::Json(value) => serde_json::from_value(value).map_err(parse_failure),
    ResponseBody::Empty => serde_json::from_value(Value::Null)
      .or_else(|_| serde_json::from_value(json!({})))
      .map_err(parse_failure),
    ResponseBody::Text(text) => serde_json::from_value(Value::String(text)).map_err(parse_failure),
    ResponseBody::Binary(bytes) => Err(TransportFailure::Parse {
      message: format!("unexpected binary response ({} bytes)", bytes.len()),
    }),
  }
}
