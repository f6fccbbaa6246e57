//! Reqwest-backed implementation of the backend contracts.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::json;
use url::Url;

use super::{DispatchContext, DispatchError, RemoteGateway, SnapshotSource};
use crate::config::Config;
use crate::model::{Item, List};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// HTTP client for the list backend.
#[derive(Clone)]
pub struct HttpBackend {
  client: Client,
  base: Url,
  token: Option<String>,
}

impl HttpBackend {
  pub fn new(config: &Config) -> Result<Self> {
    let client = Client::builder()
      .timeout(config.request_timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base: config.backend.url.clone(),
      token: Config::get_api_token(),
    })
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let mut builder = self
      .client
      .request(method, url)
      .header(reqwest::header::ACCEPT, "application/json");
    if let Some(token) = &self.token {
      builder = builder.bearer_auth(token);
    }
    builder
  }

  async fn send_mutation<B: Serialize + ?Sized>(
    &self,
    method: Method,
    segments: &[&str],
    ctx: DispatchContext<'_>,
    body: &B,
  ) -> Result<(), DispatchError> {
    let url = endpoint(&self.base, segments)?;
    let response = self
      .request(method, url)
      .header(IDEMPOTENCY_HEADER, ctx.idempotency_key)
      .json(body)
      .send()
      .await
      .map_err(map_transport_error)?;

    let status = response.status();
    if status.is_success() {
      return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(map_status_error(status, &body))
  }

  async fn get_json<T: serde::de::DeserializeOwned>(
    &self,
    segments: &[&str],
  ) -> Result<T, DispatchError> {
    let url = endpoint(&self.base, segments)?;
    let response = self
      .request(Method::GET, url.clone())
      .send()
      .await
      .map_err(map_transport_error)?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(map_status_error(status, &body));
    }

    response
      .json::<T>()
      .await
      .map_err(|e| DispatchError::Transient(format!("invalid response body from {}: {}", url, e)))
  }
}

/// Append `segments` to the base URL's path, percent-encoding each one.
///
/// Ids never split into extra segments or leak into the query string.
/// Dot segments are refused since a URL would silently resolve them away.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url, DispatchError> {
  if let Some(bad) = segments
    .iter()
    .find(|s| s.is_empty() || **s == "." || **s == "..")
  {
    return Err(DispatchError::Rejected(format!(
      "invalid path segment {:?}",
      bad
    )));
  }

  let mut url = base.clone();
  url
    .path_segments_mut()
    .map_err(|_| DispatchError::Rejected(format!("base URL {} cannot take a path", base)))?
    .pop_if_empty()
    .extend(segments);
  Ok(url)
}

#[async_trait]
impl RemoteGateway for HttpBackend {
  async fn add_item(
    &self,
    ctx: DispatchContext<'_>,
    list_id: &str,
    item_id: &str,
    name: &str,
    order: Option<i64>,
  ) -> Result<(), DispatchError> {
    let body = json!({
      "id": item_id,
      "name": name,
      "order": order,
      "actor": ctx.actor,
    });
    self
      .send_mutation(Method::POST, &["lists", list_id, "items"], ctx, &body)
      .await
  }

  async fn check_item(
    &self,
    ctx: DispatchContext<'_>,
    list_id: &str,
    item_id: &str,
  ) -> Result<(), DispatchError> {
    let path = ["lists", list_id, "items", item_id, "check"];
    let body = json!({ "actor": ctx.actor });
    self.send_mutation(Method::POST, &path, ctx, &body).await
  }

  async fn uncheck_item(
    &self,
    ctx: DispatchContext<'_>,
    list_id: &str,
    item_id: &str,
  ) -> Result<(), DispatchError> {
    let path = ["lists", list_id, "items", item_id, "uncheck"];
    let body = json!({ "actor": ctx.actor });
    self.send_mutation(Method::POST, &path, ctx, &body).await
  }

  async fn reorder_items(
    &self,
    ctx: DispatchContext<'_>,
    list_id: &str,
    item_ids: &[String],
  ) -> Result<(), DispatchError> {
    let path = ["lists", list_id, "order"];
    let body = json!({ "itemIds": item_ids, "actor": ctx.actor });
    self.send_mutation(Method::PUT, &path, ctx, &body).await
  }

  async fn ping(&self) -> Result<(), DispatchError> {
    let response = self
      .request(Method::GET, endpoint(&self.base, &["health"])?)
      .send()
      .await
      .map_err(map_transport_error)?;

    let status = response.status();
    if status.is_success() {
      Ok(())
    } else {
      Err(map_status_error(status, ""))
    }
  }
}

#[async_trait]
impl SnapshotSource for HttpBackend {
  async fn fetch_lists(&self) -> Result<Vec<List>, DispatchError> {
    self.get_json(&["lists"]).await
  }

  async fn fetch_items(&self, list_id: &str) -> Result<Vec<Item>, DispatchError> {
    self.get_json(&["lists", list_id, "items"]).await
  }
}

fn map_transport_error(error: reqwest::Error) -> DispatchError {
  if error.is_timeout() {
    DispatchError::Timeout(error.to_string())
  } else if error.is_connect() {
    DispatchError::Unreachable(error.to_string())
  } else {
    DispatchError::Transient(error.to_string())
  }
}

fn map_status_error(status: StatusCode, body: &str) -> DispatchError {
  let preview = body_preview(body);
  let message = if preview.is_empty() {
    format!("status {}", status.as_u16())
  } else {
    format!("status {}: {}", status.as_u16(), preview)
  };

  match status {
    StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => DispatchError::Timeout(message),
    StatusCode::TOO_MANY_REQUESTS => DispatchError::Transient(message),
    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DispatchError::Unauthorized(message),
    StatusCode::NOT_FOUND | StatusCode::GONE | StatusCode::CONFLICT => {
      DispatchError::Conflict(message)
    }
    _ if status.is_client_error() => DispatchError::Rejected(message),
    _ => DispatchError::Transient(message),
  }
}

fn body_preview(body: &str) -> String {
  const PREVIEW_CHAR_LIMIT: usize = 160;

  body
    .split_whitespace()
    .collect::<Vec<_>>()
    .join(" ")
    .chars()
    .take(PREVIEW_CHAR_LIMIT)
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_mapping() {
    assert!(matches!(
      map_status_error(StatusCode::GATEWAY_TIMEOUT, ""),
      DispatchError::Timeout(_)
    ));
    assert!(matches!(
      map_status_error(StatusCode::SERVICE_UNAVAILABLE, ""),
      DispatchError::Transient(_)
    ));
    assert!(matches!(
      map_status_error(StatusCode::TOO_MANY_REQUESTS, ""),
      DispatchError::Transient(_)
    ));
    assert!(matches!(
      map_status_error(StatusCode::NOT_FOUND, ""),
      DispatchError::Conflict(_)
    ));
    assert!(matches!(
      map_status_error(StatusCode::UNAUTHORIZED, "token expired"),
      DispatchError::Unauthorized(m) if m == "status 401: token expired"
    ));
    assert!(matches!(
      map_status_error(StatusCode::FORBIDDEN, ""),
      DispatchError::Unauthorized(_)
    ));
    assert!(matches!(
      map_status_error(StatusCode::BAD_REQUEST, ""),
      DispatchError::Rejected(_)
    ));
    assert!(matches!(
      map_status_error(StatusCode::UNPROCESSABLE_ENTITY, "name   required"),
      DispatchError::Rejected(m) if m == "status 422: name required"
    ));
  }

  #[test]
  fn test_endpoint_keeps_ids_inside_one_segment() {
    let base = Url::parse("https://lists.example.com/api/").unwrap();

    let url = endpoint(&base, &["lists", "a/b", "items", "x?y=1#frag", "check"]).unwrap();
    assert_eq!(
      url.as_str(),
      "https://lists.example.com/api/lists/a%2Fb/items/x%3Fy=1%23frag/check"
    );
    assert_eq!(url.query(), None);
    assert_eq!(url.fragment(), None);
    assert_eq!(url.path_segments().unwrap().count(), 6);

    let url = endpoint(&base, &["lists", "100%", "items"]).unwrap();
    assert_eq!(url.path(), "/api/lists/100%25/items");
  }

  #[test]
  fn test_endpoint_without_trailing_slash_appends() {
    let base = Url::parse("https://lists.example.com/api").unwrap();
    let url = endpoint(&base, &["health"]).unwrap();
    assert_eq!(url.as_str(), "https://lists.example.com/api/health");
  }

  #[test]
  fn test_endpoint_refuses_dot_segments() {
    let base = Url::parse("https://lists.example.com/").unwrap();
    for bad in ["..", ".", ""] {
      assert!(matches!(
        endpoint(&base, &["lists", bad, "items"]),
        Err(DispatchError::Rejected(_))
      ));
    }
  }

  #[test]
  fn test_body_preview_is_compact_and_bounded() {
    let long = "x ".repeat(500);
    let preview = body_preview(&long);
    assert_eq!(preview.chars().count(), 160);
    assert!(!preview.contains("  "));
  }
}
