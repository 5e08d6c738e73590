//! Native backend: the Gmail REST API reached with a bearer token.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Local, NaiveDate};
use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, try_join_all};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;
use url::Url;

use super::api_types::{
  ApiLabel, ApiLabelList, ApiMessage, ApiMessageList, ApiModifyRequest, ApiProfile, ApiSendRequest,
  ApiSendResponse,
};
use super::backend::MailBackend;
use super::cache::STATS_LABELS;
use super::types::{
  EmailMessage, Label, MailboxStats, MessagePage, OutgoingEmail, TodayStats, UserProfile,
};
use crate::cache::Page;

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/";

/// Native backend talking to the Gmail REST API with a bearer token.
///
/// Unusable until `initialize` has been given an access token.
pub struct GmailBackend {
  client: reqwest::Client,
  api_base: Url,
  token: RwLock<Option<String>>,
}

impl GmailBackend {
  pub fn new(api_base: &str) -> Result<Self> {
    let mut base = api_base.to_string();
    if !base.ends_with('/') {
      base.push('/');
    }
    let api_base =
      Url::parse(&base).map_err(|e| eyre!("Invalid Gmail API base {}: {}", api_base, e))?;

    let client = reqwest::Client::builder()
      .pool_max_idle_per_host(20)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      api_base,
      token: RwLock::new(None),
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .api_base
      .join(path)
      .map_err(|e| eyre!("Invalid Gmail endpoint {}: {}", path, e))
  }

  fn token(&self) -> Result<String> {
    self
      .token
      .read()
      .clone()
      .ok_or_else(|| eyre!("Gmail client not initialized"))
  }

  async fn get_json<T: DeserializeOwned>(&self, url: Url, what: &str) -> Result<T> {
    let response = self
      .client
      .get(url)
      .bearer_auth(self.token()?)
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

  async fn post<B: Serialize + ?Sized>(&self, url: Url, body: &B, what: &str) -> Result<reqwest::Response> {
    let response = self
      .client
      .post(url)
      .bearer_auth(self.token()?)
      .json(body)
      .send()
      .await
      .map_err(|e| eyre!("Failed to {}: {}", what, e))?;

    if !response.status().is_success() {
      return Err(eyre!("Failed to {}: HTTP {}", what, response.status()));
    }
    Ok(response)
  }

  async fn get_message_in_format(&self, id: &str, format: &str) -> Result<ApiMessage> {
    let mut url = self.endpoint(&format!("users/me/messages/{}", id))?;
    url.query_pairs_mut().append_pair("format", format);
    if format == "metadata" {
      for header in ["From", "To", "Subject", "Date"] {
        url.query_pairs_mut().append_pair("metadataHeaders", header);
      }
    }
    self
      .get_json(url, &format!("get message {}", id))
      .await
  }

  async fn count_matching(&self, query: &str) -> Result<u64> {
    let mut url = self.endpoint("users/me/messages")?;
    url
      .query_pairs_mut()
      .append_pair("q", query)
      .append_pair("maxResults", "1");
    let list: ApiMessageList = self.get_json(url, "count messages").await?;
    Ok(list.result_size_estimate)
  }
}

/// Search query matching messages received on or after `day`.
pub fn received_since_query(day: NaiveDate) -> String {
  format!("after:{}", day.format("%Y/%m/%d"))
}

/// Queries for all and for unread messages received on or after `day`.
pub fn today_queries(day: NaiveDate) -> (String, String) {
  let since = received_since_query(day);
  let unread = format!("{} is:unread", since);
  (since, unread)
}

/// RFC 822 text of `message`, base64url encoded for the `raw` send field.
pub fn compose_raw(message: &OutgoingEmail) -> String {
  let mut text = String::new();
  text.push_str(&format!("To: {}\r\n", message.to));
  if let Some(cc) = message.cc.as_deref().filter(|v| !v.is_empty()) {
    text.push_str(&format!("Cc: {}\r\n", cc));
  }
  if let Some(bcc) = message.bcc.as_deref().filter(|v| !v.is_empty()) {
    text.push_str(&format!("Bcc: {}\r\n", bcc));
  }
  text.push_str(&format!("Subject: {}\r\n", message.subject));
  text.push_str("Content-Type: text/html; charset=utf-8\r\n");
  text.push_str("\r\n");
  text.push_str(&message.body);
  URL_SAFE_NO_PAD.encode(text.as_bytes())
}

#[async_trait]
impl MailBackend for GmailBackend {
  fn name(&self) -> &'static str {
    "native"
  }

  async fn initialize(&self, credential: &str) -> Result<()> {
    if credential.trim().is_empty() {
      return Err(eyre!("Empty access token"));
    }
    *self.token.write() = Some(credential.to_string());
    debug!("gmail client ready");
    Ok(())
  }

  async fn list_messages(
    &self,
    label: &str,
    page_size: usize,
    page_token: Option<&str>,
  ) -> Result<MessagePage> {
    let mut url = self.endpoint("users/me/messages")?;
    url
      .query_pairs_mut()
      .append_pair("maxResults", &page_size.to_string())
      .append_pair("labelIds", label);
    if let Some(token) = page_token {
      url.query_pairs_mut().append_pair("pageToken", token);
    }

    let list: ApiMessageList = self
      .get_json(url, &format!("list messages in {}", label))
      .await?;

    let summaries: Vec<EmailMessage> = try_join_all(
      list
        .messages
        .iter()
        .map(|r| self.get_message_in_format(&r.id, "metadata")),
    )
    .await?
    .into_iter()
    .map(ApiMessage::into_summary)
    .collect();

    Ok(Page::new(summaries, list.next_page_token))
  }

  async fn get_message(&self, id: &str) -> Result<EmailMessage> {
    Ok(self.get_message_in_format(id, "full").await?.into_full())
  }

  async fn send_message(&self, message: &OutgoingEmail) -> Result<String> {
    let url = self.endpoint("users/me/messages/send")?;
    let request = ApiSendRequest {
      raw: compose_raw(message),
    };
    let response: ApiSendResponse = self
      .post(url, &request, "send message")
      .await?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse send response: {}", e))?;
    Ok(response.id)
  }

  async fn set_read_state(&self, id: &str, read: bool) -> Result<()> {
    let url = self.endpoint(&format!("users/me/messages/{}/modify", id))?;
    self
      .post(url, &ApiModifyRequest::read_state(read), &format!("mark message {}", id))
      .await?;
    Ok(())
  }

  async fn delete_message(&self, id: &str) -> Result<()> {
    let url = self.endpoint(&format!("users/me/messages/{}/trash", id))?;
    self
      .post(url, &serde_json::json!({}), &format!("trash message {}", id))
      .await?;
    Ok(())
  }

  async fn user_profile(&self) -> Result<UserProfile> {
    let url = self.endpoint("users/me/profile")?;
    let profile: ApiProfile = self.get_json(url, "get profile").await?;
    Ok(profile.into())
  }

  async fn labels(&self) -> Result<Vec<Label>> {
    let url = self.endpoint("users/me/labels")?;
    let list: ApiLabelList = self.get_json(url, "list labels").await?;
    Ok(list.labels)
  }

  async fn mailbox_stats(&self) -> Result<MailboxStats> {
    let lookups = STATS_LABELS.iter().map(|label| async move {
      let url = self.endpoint(&format!("users/me/labels/{}", label))?;
      self.get_json::<ApiLabel>(url, &format!("get label {}", label)).await
    });

    let mut stats = MailboxStats::new();
    for (label, result) in STATS_LABELS.iter().zip(join_all(lookups).await) {
      match result {
        Ok(found) => {
          stats.insert(label.to_string(), found.into());
        }
        Err(e) => debug!(label, error = %e, "label not available, skipping"),
      }
    }

    if stats.is_empty() {
      return Err(eyre!("No label statistics available"));
    }
    Ok(stats)
  }

  async fn today_stats(&self) -> Result<TodayStats> {
    let (since, unread_since) = today_queries(Local::now().date_naive());
    let (total_today, unread_today) = futures::try_join!(
      self.count_matching(&since),
      self.count_matching(&unread_since),
    )?;
    Ok(TodayStats {
      total_today,
      unread_today,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_endpoint_keeps_api_prefix() {
    let backend = GmailBackend::new("https://gmail.googleapis.com/gmail/v1").unwrap();
    let url = backend.endpoint("users/me/messages/abc").unwrap();
    assert_eq!(
      url.as_str(),
      "https://gmail.googleapis.com/gmail/v1/users/me/messages/abc"
    );
  }

  #[test]
  fn test_invalid_base_is_rejected() {
    assert!(GmailBackend::new("not a url").is_err());
  }

  #[tokio::test]
  async fn test_operations_fail_before_initialize() {
    let backend = GmailBackend::new(DEFAULT_API_BASE).unwrap();
    let err = backend.get_message("m1").await.unwrap_err();
    assert!(err.to_string().contains("not initialized"));
  }

  #[tokio::test]
  async fn test_initialize_is_idempotent_and_rejects_empty() {
    let backend = GmailBackend::new(DEFAULT_API_BASE).unwrap();
    assert!(backend.initialize("  ").await.is_err());
    backend.initialize("tok").await.unwrap();
    backend.initialize("tok").await.unwrap();
    assert_eq!(backend.token().unwrap(), "tok");
  }

  #[test]
  fn test_compose_raw() {
    let mut message = OutgoingEmail::new("a@b.com", "s", "<p>b</p>");
    message.cc = Some("c@d.com".into());
    message.bcc = Some(String::new());

    let raw = URL_SAFE_NO_PAD.decode(compose_raw(&message)).unwrap();
    let text = String::from_utf8(raw).unwrap();
    assert_eq!(
      text,
      "To: a@b.com\r\nCc: c@d.com\r\nSubject: s\r\nContent-Type: text/html; charset=utf-8\r\n\r\n<p>b</p>"
    );
  }

  #[test]
  fn test_received_since_query() {
    let day = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
    assert_eq!(received_since_query(day), "after:2024/03/07");
  }

  #[test]
  fn test_today_queries() {
    let day = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
    let (all, unread) = today_queries(day);
    assert_eq!(all, "after:2024/12/31");
    assert_eq!(unread, "after:2024/12/31 is:unread");
  }
}
