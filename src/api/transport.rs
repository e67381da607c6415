//! HTTP transport: one request in, one classified raw response out.
//!
//! The transport never retries and never touches the cache.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{multipart, Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

use super::auth::AuthState;

/// Why a single HTTP exchange failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFailure {
  /// Connectivity failure or timeout
  #[error("network error: {message}")]
  Network { message: String },
  /// The server answered with a non-2xx status
  #[error("HTTP {status}: {message}")]
  Http {
    status: u16,
    message: String,
    code: Option<String>,
  },
  /// A successful response body could not be parsed
  #[error("failed to parse response: {message}")]
  Parse { message: String },
  /// The request itself is malformed and was never sent
  #[error("invalid request: {message}")]
  Request { message: String },
}

/// One field of a multipart upload.
#[derive(Debug, Clone)]
pub enum MultipartField {
  Text {
    name: String,
    value: String,
  },
  File {
    name: String,
    file_name: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
  },
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
  #[default]
  Empty,
  Json(Value),
  /// Sent without an explicit content type so the boundary is set by the
  /// HTTP client
  Multipart(Vec<MultipartField>),
}

/// A request relative to the API base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: RequestBody,
  pub headers: Vec<(String, String)>,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: RequestBody::Empty,
      headers: Vec::new(),
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn post(path: impl Into<String>) -> Self {
    Self::new(Method::POST, path)
  }

  pub fn patch(path: impl Into<String>) -> Self {
    Self::new(Method::PATCH, path)
  }

  pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
    self.query.push((key.into(), value.to_string()));
    self
  }

  /// Add a parameter only when a value is present.
  pub fn query_opt(self, key: impl Into<String>, value: Option<impl ToString>) -> Self {
    match value {
      Some(value) => self.query(key, value),
      None => self,
    }
  }

  /// Add one parameter per value, e.g. `?tag=a&tag=b`.
  pub fn query_all<I, T>(mut self, key: &str, values: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: ToString,
  {
    for value in values {
      self.query.push((key.to_string(), value.to_string()));
    }
    self
  }

  pub fn json(mut self, body: Value) -> Self {
    self.body = RequestBody::Json(body);
    self
  }

  pub fn multipart(mut self, fields: Vec<MultipartField>) -> Self {
    self.body = RequestBody::Multipart(fields);
    self
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }
}

/// Parsed response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
  Empty,
  Json(Value),
  Text(String),
  Binary(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct RawResponse {
  pub status: u16,
  pub body: ResponseBody,
}

/// HTTP transport bound to one API origin.
#[derive(Clone)]
pub struct Transport {
  http: Client,
  base_url: Url,
  auth: AuthState,
}

impl Transport {
  pub fn new(base_url: &str, timeout: Duration, auth: AuthState) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API base URL {}: {}", base_url, e))?;

    let http = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      http,
      base_url,
      auth,
    })
  }

  pub fn auth(&self) -> &AuthState {
    &self.auth
  }

  fn url_for(&self, request: &ApiRequest) -> Result<Url, TransportFailure> {
    let base = self.base_url.as_str().trim_end_matches('/');
    let mut url = Url::parse(&format!("{}{}", base, request.path)).map_err(|e| {
      TransportFailure::Request {
        message: format!("invalid request URL {}{}: {}", base, request.path, e),
      }
    })?;
    if !request.query.is_empty() {
      url
        .query_pairs_mut()
        .extend_pairs(request.query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    Ok(url)
  }

  /// Perform one HTTP exchange.
  pub async fn send(&self, request: &ApiRequest) -> Result<RawResponse, TransportFailure> {
    let url = self.url_for(request)?;
    debug!(method = %request.method, %url, "sending request");

    let mut builder = self
      .http
      .request(request.method.clone(), url)
      .header(ACCEPT, "application/json");

    if let Some(token) = self.auth.token() {
      builder = builder.bearer_auth(token);
    }
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    builder = match &request.body {
      RequestBody::Empty => builder,
      RequestBody::Json(value) => builder.json(value),
      RequestBody::Multipart(fields) => builder.multipart(build_form(fields)?),
    };

    let response = builder.send().await.map_err(network_failure)?;

    let status = response.status();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .unwrap_or_default()
      .to_ascii_lowercase();
    let bytes = response.bytes().await.map_err(network_failure)?;
    trace!(status = status.as_u16(), %content_type, len = bytes.len(), "response received");

    let body = parse_body(&content_type, &bytes);

    if !status.is_success() {
      // An unreadable error body still yields an HTTP failure
      let body = body.ok();
      return Err(TransportFailure::Http {
        status: status.as_u16(),
        message: error_message(body.as_ref(), status),
        code: error_code(body.as_ref()),
      });
    }

    let body = body.map_err(|e| TransportFailure::Parse {
      message: e.to_string(),
    })?;

    Ok(RawResponse {
      status: status.as_u16(),
      body,
    })
  }
}

fn network_failure(e: reqwest::Error) -> TransportFailure {
  let message = if e.is_timeout() {
    "request timed out".to_string()
  } else {
    e.to_string()
  };
  TransportFailure::Network { message }
}

fn build_form(fields: &[MultipartField]) -> Result<multipart::Form, TransportFailure> {
  let mut form = multipart::Form::new();
  for field in fields {
    form = match field {
      MultipartField::Text { name, value } => form.text(name.clone(), value.clone()),
      MultipartField::File {
        name,
        file_name,
        content_type,
        bytes,
      } => {
        let mut part = multipart::Part::bytes(bytes.clone()).file_name(file_name.clone());
        if let Some(content_type) = content_type {
          part = part
            .mime_str(content_type)
            .map_err(|e| TransportFailure::Request {
              message: format!("invalid content type {}: {}", content_type, e),
            })?;
        }
        form.part(name.clone(), part)
      }
    };
  }
  Ok(form)
}

fn parse_body(content_type: &str, bytes: &[u8]) -> serde_json::Result<ResponseBody> {
  if content_type.contains("application/json") {
    if bytes.iter().all(u8::is_ascii_whitespace) {
      return Ok(ResponseBody::Empty);
    }
    return serde_json::from_slice(bytes).map(ResponseBody::Json);
  }
  if content_type.starts_with("text/") {
    return Ok(ResponseBody::Text(String::from_utf8_lossy(bytes).into_owned()));
  }
  if bytes.is_empty() {
    Ok(ResponseBody::Empty)
  } else {
    Ok(ResponseBody::Binary(bytes.to_vec()))
  }
}

/// `message`, `error` or `detail` from a JSON error body, else the status line.
fn error_message(body: Option<&ResponseBody>, status: StatusCode) -> String {
  if let Some(ResponseBody::Json(Value::Object(obj))) = body {
    for field in ["message", "error", "detail"] {
      if let Some(message) = obj.get(field).and_then(Value::as_str) {
        return message.to_string();
      }
    }
  }
  format!(
    "HTTP {}: {}",
    status.as_u16(),
    status.canonical_reason().unwrap_or("Unknown")
  )
}

fn error_code(body: Option<&ResponseBody>) -> Option<String> {
  match body {
    Some(ResponseBody::Json(Value::Object(obj))) => {
      obj.get("code").and_then(Value::as_str).map(String::from)
    }
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use mockito::{Matcher, Server};
  use serde_json::json;

  fn transport(server: &Server, auth: AuthState) -> Transport {
    Transport::new(&server.url(), Duration::from_secs(5), auth).unwrap()
  }

  #[tokio::test]
  async fn test_json_response_with_bearer_token() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("GET", "/api/plan/today")
      .match_header("authorization", "Bearer secret")
      .match_header("accept", "application/json")
      .with_status(200)
      .with_header("content-type", "application/json; charset=utf-8")
      .with_body(r#"{"rituals":[]}"#)
      .create_async()
      .await;

    let response = transport(&server, AuthState::with_token("secret"))
      .send(&ApiRequest::get("/api/plan/today"))
      .await
      .unwrap();

    mock.assert_async().await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, ResponseBody::Json(json!({"rituals": []})));
  }

  #[tokio::test]
  async fn test_no_authorization_without_token() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("GET", "/api/health")
      .match_header("authorization", Matcher::Missing)
      .match_header("cache-control", "no-cache")
      .with_status(200)
      .with_header("content-type", "text/plain")
      .with_body("ok")
      .create_async()
      .await;

    let response = transport(&server, AuthState::new())
      .send(&ApiRequest::get("/api/health").header("Cache-Control", "no-cache"))
      .await
      .unwrap();

    mock.assert_async().await;
    assert_eq!(response.body, ResponseBody::Text("ok".into()));
  }

  #[tokio::test]
  async fn test_json_body_and_query_parameters() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("POST", "/api/rituals/7/complete")
      .match_query(Matcher::Exact("tag=a&tag=b".into()))
      .match_header("content-type", "application/json")
      .match_body(Matcher::Json(json!({"duration": 10})))
      .with_status(204)
      .create_async()
      .await;

    let request = ApiRequest::post("/api/rituals/7/complete")
      .query_all("tag", ["a", "b"])
      .query_opt("range", None::<&str>)
      .json(json!({"duration": 10}));
    let response = transport(&server, AuthState::new())
      .send(&request)
      .await
      .unwrap();

    mock.assert_async().await;
    assert_eq!(response.body, ResponseBody::Empty);
  }

  #[tokio::test]
  async fn test_malformed_url_is_never_sent() {
    let mut server = Server::new_async().await;
    let mock = server.mock("GET", Matcher::Any).expect(0).create_async().await;

    let failure = transport(&server, AuthState::new())
      .send(&ApiRequest::get(":not-a-port"))
      .await
      .unwrap_err();

    mock.assert_async().await;
    assert!(matches!(failure, TransportFailure::Request { .. }));
  }

  #[tokio::test]
  async fn test_multipart_sets_boundary() {
    let mut server = Server::new_async().await;
    let mock = server
      .mock("POST", "/api/rituals/3/audio")
      .match_header(
        "content-type",
        Matcher::Regex("^multipart/form-data; boundary=.+".into()),
      )
      .with_status(201)
      .with_header("content-type", "application/json")
      .with_body(r#"{"ok":true}"#)
      .create_async()
      .await;

    let request = ApiRequest::post("/api/rituals/3/audio").multipart(vec![
      MultipartField::File {
        name: "audio".into(),
        file_name: "breath.mp3".into(),
        content_type: Some("audio/mpeg".into()),
        bytes: vec![1, 2, 3],
      },
      MultipartField::Text {
        name: "note".into(),
        value: "morning".into(),
      },
    ]);
    transport(&server, AuthState::new())
      .send(&request)
      .await
      .unwrap();

    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_error_body_message_and_code() {
    let mut server = Server::new_async().await;
    server
      .mock("GET", "/api/rituals/999")
      .with_status(404)
      .with_header("content-type", "application/json")
      .with_body(r#"{"message":"Ritual not found","code":"RITUAL_NOT_FOUND"}"#)
      .create_async()
      .await;

    let failure = transport(&server, AuthState::new())
      .send(&ApiRequest::get("/api/rituals/999"))
      .await
      .unwrap_err();

    assert_eq!(
      failure,
      TransportFailure::Http {
        status: 404,
        message: "Ritual not found".into(),
        code: Some("RITUAL_NOT_FOUND".into()),
      }
    );
  }

  #[tokio::test]
  async fn test_error_without_body_uses_status_line() {
    let mut server = Server::new_async().await;
    server
      .mock("GET", "/api/user/stats")
      .with_status(503)
      .create_async()
      .await;

    let failure = transport(&server, AuthState::new())
      .send(&ApiRequest::get("/api/user/stats"))
      .await
      .unwrap_err();

    assert_eq!(
      failure,
      TransportFailure::Http {
        status: 503,
        message: "HTTP 503: Service Unavailable".into(),
        code: None,
      }
    );
  }

  #[tokio::test]
  async fn test_malformed_json_is_parse_failure() {
    let mut server = Server::new_async().await;
    server
      .mock("GET", "/api/plan/today")
      .with_status(200)
      .with_header("content-type", "application/json")
      .with_body("{not json")
      .create_async()
      .await;

    let failure = transport(&server, AuthState::new())
      .send(&ApiRequest::get("/api/plan/today"))
      .await
      .unwrap_err();

    assert!(matches!(failure, TransportFailure::Parse { .. }));
  }

  #[tokio::test]
  async fn test_connection_refused_is_network_failure() {
    // Nothing listens on port 9 (discard) in the test environment
    let transport =
      Transport::new("http://127.0.0.1:9", Duration::from_secs(2), AuthState::new()).unwrap();

    let failure = transport
      .send(&ApiRequest::get("/api/health"))
      .await
      .unwrap_err();

    assert!(matches!(failure, TransportFailure::Network { .. }));
  }

  #[test]
  fn test_binary_body_left_unparsed() {
    assert_eq!(
      parse_body("audio/mpeg", &[0xff, 0xfb]).unwrap(),
      ResponseBody::Binary(vec![0xff, 0xfb])
    );
    assert_eq!(parse_body("", &[]).unwrap(), ResponseBody::Empty);
  }
}
