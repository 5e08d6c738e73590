//! Secondary backend and credential sources backed by the companion proxy server.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

use super::backend::{CredentialSource, MailBackend};
use super::types::{
  EmailMessage, Label, MailboxStats, MessagePage, OutgoingEmail, TodayStats, UserProfile,
};
use crate::cache::Page;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:3001";

/// Message list as returned by the proxy server
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessageList {
  #[serde(default)]
  messages: Vec<EmailMessage>,
  next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerSendResponse {
  #[serde(default)]
  id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTokenResponse {
  access_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct MarkRequest {
  read: bool,
}

/// HTTP client for the companion proxy server.
///
/// Shared by the secondary backend and the credential source, which live on
/// the same server.
#[derive(Clone)]
pub struct ServerClient {
  client: reqwest::Client,
  base: Url,
}

impl ServerClient {
  pub fn new(base_url: &str) -> Result<Self> {
    let base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid server URL {}: {}", base_url, e))?;
    Ok(Self {
      client: reqwest::Client::new(),
      base,
    })
  }

  pub fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path)
      .map_err(|e| eyre!("Invalid server endpoint {}: {}", path, e))
  }

  async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder, what: &str) -> Result<T> {
    let response = request
      .send()
      .await
      .map_err(|e| eyre!("Failed to {}: {}", what, e))?;

    if !response.status().is_success() {
      return Err(eyre!("Failed to {}: HTTP {}", what, response.status()));
    }

    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response to {}: {}", what, e))
  }

  async fn get<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T> {
    self.send(self.client.get(url), what).await
  }
}

/// Secondary backend: the proxy server's REST API. Always ready.
pub struct ServerBackend {
  server: ServerClient,
}

impl ServerBackend {
  pub fn new(server: ServerClient) -> Self {
    Self { server }
  }

  /// Query string for a message list request.
  pub fn list_url(&self, label: &str, page_size: usize, page_token: Option<&str>) -> Result<Url> {
    let mut url = self.server.endpoint("/api/emails")?;
    url
      .query_pairs_mut()
      .append_pair("maxResults", &page_size.to_string())
      .append_pair("labelIds", label);
    if let Some(token) = page_token {
      url.query_pairs_mut().append_pair("pageToken", token);
    }
    Ok(url)
  }
}

#[async_trait]
impl MailBackend for ServerBackend {
  fn name(&self) -> &'static str {
    "server"
  }

  async fn list_messages(
    &self,
    label: &str,
    page_size: usize,
    page_token: Option<&str>,
  ) -> Result<MessagePage> {
    let url = self.list_url(label, page_size, page_token)?;
    let list: ServerMessageList = self.server.get(url, "get emails").await?;
    Ok(Page::new(list.messages, list.next_page_token))
  }

  async fn get_message(&self, id: &str) -> Result<EmailMessage> {
    let url = self.server.endpoint(&format!("/api/emails/{}", id))?;
    self.server.get(url, "get email").await
  }

  async fn send_message(&self, message: &OutgoingEmail) -> Result<String> {
    let url = self.server.endpoint("/api/emails/send")?;
    let response: ServerSendResponse = self
      .server
      .send(self.server.client.post(url).json(message), "send email")
      .await?;
    Ok(response.id)
  }

  async fn set_read_state(&self, id: &str, read: bool) -> Result<()> {
    let url = self.server.endpoint(&format!("/api/emails/{}/mark", id))?;
    let _: serde_json::Value = self
      .server
      .send(self.server.client.post(url).json(&MarkRequest { read }), "mark email")
      .await?;
    Ok(())
  }

  async fn delete_message(&self, id: &str) -> Result<()> {
    let url = self.server.endpoint(&format!("/api/emails/{}", id))?;
    let _: serde_json::Value = self
      .server
      .send(self.server.client.delete(url), "delete email")
      .await?;
    Ok(())
  }

  async fn user_profile(&self) -> Result<UserProfile> {
    let url = self.server.endpoint("/api/user/profile")?;
    self.server.get(url, "get user profile").await
  }

  async fn labels(&self) -> Result<Vec<Label>> {
    let url = self.server.endpoint("/api/labels")?;
    self.server.get(url, "get labels").await
  }

  async fn mailbox_stats(&self) -> Result<MailboxStats> {
    let url = self.server.endpoint("/api/mailbox/stats")?;
    self.server.get(url, "get mailbox stats").await
  }

  async fn today_stats(&self) -> Result<TodayStats> {
    let url = self.server.endpoint("/api/emails/stats/today")?;
    self.server.get(url, "get today stats").await
  }

  async fn end_session(&self) -> Result<()> {
    let url = self.server.endpoint("/auth/logout")?;
    let _: serde_json::Value = self
      .server
      .send(self.server.client.post(url), "log out")
      .await?;
    Ok(())
  }
}

/// Credential source backed by the proxy server's `/auth/token` endpoint.
pub struct ServerCredentials {
  server: ServerClient,
}

impl ServerCredentials {
  pub fn new(server: ServerClient) -> Self {
    Self { server }
  }
}

#[async_trait]
impl CredentialSource for ServerCredentials {
  async fn access_token(&self) -> Result<String> {
    let url = self.server.endpoint("/auth/token")?;
    let response: ServerTokenResponse = self.server.get(url, "get access token").await?;
    response
      .access_token
      .filter(|t| !t.is_empty())
      .ok_or_else(|| eyre!("accessToken missing in response"))
  }
}

/// A fixed credential, e.g. one supplied through the environment.
pub struct StaticCredential(String);

impl StaticCredential {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }
}

#[async_trait]
impl CredentialSource for StaticCredential {
  async fn access_token(&self) -> Result<String> {
    Ok(self.0.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn backend() -> ServerBackend {
    ServerBackend::new(ServerClient::new(DEFAULT_SERVER_URL).unwrap())
  }

  #[test]
  fn test_list_url() {
    let url = backend().list_url("INBOX", 20, None).unwrap();
    assert_eq!(
      url.as_str(),
      "http://localhost:3001/api/emails?maxResults=20&labelIds=INBOX"
    );

    let url = backend().list_url("CATEGORY_SOCIAL", 5, Some("tok/1")).unwrap();
    assert_eq!(
      url.as_str(),
      "http://localhost:3001/api/emails?maxResults=5&labelIds=CATEGORY_SOCIAL&pageToken=tok%2F1"
    );
  }

  #[test]
  fn test_message_list_wire_format() {
    let list: ServerMessageList = serde_json::from_value(json!({
      "messages": [{
        "id": "m1",
        "threadId": "t1",
        "labelIds": ["INBOX", "UNREAD"],
        "from": "a@b.com",
        "subject": "hi",
        "unread": true,
        "hasAttachment": false
      }],
      "nextPageToken": "p2"
    }))
    .unwrap();

    assert_eq!(list.next_page_token.as_deref(), Some("p2"));
    assert_eq!(list.messages[0].thread_id, "t1");
    assert!(list.messages[0].unread);
    assert!(list.messages[0].body.is_empty());
  }

  #[test]
  fn test_stats_wire_format() {
    let stats: MailboxStats = serde_json::from_value(json!({
      "INBOX": {"id": "INBOX", "name": "INBOX", "total": 10, "unread": 2}
    }))
    .unwrap();
    assert_eq!(stats["INBOX"].unread, 2);

    let today: TodayStats =
      serde_json::from_value(json!({"totalToday": 4, "unreadToday": 1})).unwrap();
    assert_eq!(today.total_today, 4);
  }

  #[test]
  fn test_labels_wire_format() {
    let labels: Vec<Label> = serde_json::from_value(json!([
      {"id": "SENT", "name": "SENT", "type": "system"},
      {"id": "Label_3", "name": "Travel"}
    ]))
    .unwrap();
    assert_eq!(labels[0].label_type, "system");
    assert_eq!(labels[1].name, "Travel");
    assert!(labels[1].label_type.is_empty());
  }

  #[tokio::test]
  async fn test_static_credential() {
    let source = StaticCredential::new("abc");
    assert_eq!(source.access_token().await.unwrap(), "abc");
  }
}
