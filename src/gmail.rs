use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use google_gmail1::Gmail;
use google_gmail1::api::{Message as GmailMessage, MessagePart, MessagePartHeader, ModifyMessageRequest};
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::auth::OAuthClient;
use crate::error::MailboxError;
use crate::models::{Folder, MailboxConnection, RemoteMessage};
use crate::vault::Vault;

pub type Connector = HttpsConnector<HttpConnector>;

pub const INBOX_QUERY: &str = "in:inbox";
pub const SPAM_QUERY: &str = "in:spam";
const DETAIL_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<RemoteMessage>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MailboxProfile {
    pub address: String,
    pub messages_total: i64,
    pub threads_total: i64,
}

/// Result of a refresh-token exchange. The access token is already sealed.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub encrypted_access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One remote mailbox, bound to one set of credentials.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Lists messages matching `query` (default `in:inbox`) and fetches each one's
    /// detail. Messages that fail to fetch or decode are left out.
    async fn fetch_messages(
        &self,
        max_results: u32,
        page_token: Option<&str>,
        query: Option<&str>,
    ) -> Result<MessagePage, MailboxError>;

    async fn fetch_junk(&self, max_results: u32) -> Result<Vec<RemoteMessage>, MailboxError> {
        Ok(self
            .fetch_messages(max_results, None, Some(SPAM_QUERY))
            .await?
            .messages)
    }

    async fn get_message_detail(&self, id: &str) -> Result<RemoteMessage, MailboxError>;

    async fn profile(&self) -> Result<MailboxProfile, MailboxError>;

    async fn validate_token(&self) -> bool {
        self.profile().await.is_ok()
    }

    async fn refresh_access_token(&self) -> Result<RefreshedToken, MailboxError>;

    async fn move_to_inbox(&self, id: &str) -> Result<(), MailboxError>;
    async fn mark_as_read(&self, id: &str) -> Result<(), MailboxError>;
    async fn mark_as_unread(&self, id: &str) -> Result<(), MailboxError>;
    async fn star(&self, id: &str) -> Result<(), MailboxError>;
    async fn unstar(&self, id: &str) -> Result<(), MailboxError>;
    async fn delete(&self, id: &str) -> Result<(), MailboxError>;
}

/// Opens a [`Mailbox`] for a stored connection.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn connect(&self, connection: &MailboxConnection) -> Result<Box<dyn Mailbox>, MailboxError>;
}

pub struct GmailConnector {
    http: hyper::Client<Connector>,
    oauth: OAuthClient,
    vault: Arc<Vault>,
}

impl GmailConnector {
    pub fn new(oauth: OAuthClient, vault: Arc<Vault>) -> Result<Self, MailboxError> {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| MailboxError::Transport(format!("Failed to load native roots: {}", e)))?
            .https_only()
            .enable_http1()
            .build();

        Ok(Self {
            http: hyper::Client::builder().build(https),
            oauth,
            vault,
        })
    }
}

#[async_trait]
impl MailboxConnector for GmailConnector {
    async fn connect(&self, connection: &MailboxConnection) -> Result<Box<dyn Mailbox>, MailboxError> {
        let access_token = self
            .vault
            .decrypt(&connection.encrypted_access_token)
            .map_err(|e| MailboxError::InvalidCredentials(e.to_string()))?;
        let refresh_token = connection
            .encrypted_refresh_token
            .as_deref()
            .map(|t| self.vault.decrypt(t))
            .transpose()
            .map_err(|e| MailboxError::InvalidCredentials(e.to_string()))?;

        Ok(Box::new(GmailClient::new(
            self.http.clone(),
            access_token,
            refresh_token,
            self.oauth.clone(),
            self.vault.clone(),
        )))
    }
}

pub struct GmailClient {
    http: hyper::Client<Connector>,
    hub: RwLock<Gmail<Connector>>,
    refresh_token: Option<String>,
    oauth: OAuthClient,
    vault: Arc<Vault>,
}

impl GmailClient {
    pub fn new(
        http: hyper::Client<Connector>,
        access_token: String,
        refresh_token: Option<String>,
        oauth: OAuthClient,
        vault: Arc<Vault>,
    ) -> Self {
        let hub = Gmail::new(http.clone(), access_token);
        Self {
            http,
            hub: RwLock::new(hub),
            refresh_token,
            oauth,
            vault,
        }
    }

    fn hub(&self) -> Gmail<Connector> {
        match self.hub.read() {
            Ok(hub) => hub.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn modify(
        &self,
        id: &str,
        operation: &'static str,
        add: &[&str],
        remove: &[&str],
    ) -> Result<(), MailboxError> {
        let to_labels = |ids: &[&str]| {
            (!ids.is_empty()).then(|| ids.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        };
        let req = ModifyMessageRequest {
            add_label_ids: to_labels(add),
            remove_label_ids: to_labels(remove),
            ..Default::default()
        };

        let hub = self.hub();
        hub.users()
            .messages_modify(req, "me", id)
            .doit()
            .await
            .map_err(|e| MailboxError::api(operation, e))?;
        debug!(message_id = id, operation, "Modified remote message");
        Ok(())
    }
}

#[async_trait]
impl Mailbox for GmailClient {
    async fn fetch_messages(
        &self,
        max_results: u32,
        page_token: Option<&str>,
        query: Option<&str>,
    ) -> Result<MessagePage, MailboxError> {
        let hub = self.hub();
        let mut req = hub
            .users()
            .messages_list("me")
            .max_results(max_results)
            .q(query.unwrap_or(INBOX_QUERY));

        if let Some(token) = page_token {
            req = req.page_token(token);
        }

        let (_, message_list) = req
            .doit()
            .await
            .map_err(|e| MailboxError::api("list messages", e))?;

        let ids: Vec<String> = message_list
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect();

        let messages = stream::iter(ids)
            .map(|id| async move {
                match self.get_message_detail(&id).await {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!(message_id = %id, "Skipping message: {}", e);
                        None
                    }
                }
            })
            .buffered(DETAIL_CONCURRENCY)
            .filter_map(|message| async move { message })
            .collect::<Vec<_>>()
            .await;

        Ok(MessagePage {
            messages,
            next_page_token: message_list.next_page_token,
        })
    }

    async fn get_message_detail(&self, id: &str) -> Result<RemoteMessage, MailboxError> {
        let hub = self.hub();
        let (_, msg) = hub
            .users()
            .messages_get("me", id)
            .format("full")
            .doit()
            .await
            .map_err(|e| MailboxError::api("get message", e))?;

        decode_message(msg)
            .ok_or_else(|| MailboxError::api("decode message", format!("message {} has no id", id)))
    }

    async fn profile(&self) -> Result<MailboxProfile, MailboxError> {
        let hub = self.hub();
        let (_, profile) = hub
            .users()
            .get_profile("me")
            .doit()
            .await
            .map_err(|e| MailboxError::api("get profile", e))?;

        Ok(MailboxProfile {
            address: profile.email_address.unwrap_or_default(),
            messages_total: profile.messages_total.map(i64::from).unwrap_or(0),
            threads_total: profile.threads_total.map(i64::from).unwrap_or(0),
        })
    }

    async fn refresh_access_token(&self) -> Result<RefreshedToken, MailboxError> {
        let refresh_token = self
            .refresh_token
            .as_deref()
            .ok_or(MailboxError::MissingRefreshToken)?;

        let fresh = self.oauth.refresh(refresh_token).await?;
        let encrypted_access_token = self
            .vault
            .encrypt(&fresh.access_token)
            .map_err(|e| MailboxError::Refresh(e.to_string()))?;

        let hub = Gmail::new(self.http.clone(), fresh.access_token);
        match self.hub.write() {
            Ok(mut current) => *current = hub,
            Err(poisoned) => *poisoned.into_inner() = hub,
        }
        debug!("Access token refreshed");

        Ok(RefreshedToken {
            encrypted_access_token,
            expires_at: fresh.expires_at,
        })
    }

    async fn move_to_inbox(&self, id: &str) -> Result<(), MailboxError> {
        self.modify(id, "move message to inbox", &["INBOX"], &["SPAM"]).await
    }

    async fn mark_as_read(&self, id: &str) -> Result<(), MailboxError> {
        self.modify(id, "mark message as read", &[], &["UNREAD"]).await
    }

    async fn mark_as_unread(&self, id: &str) -> Result<(), MailboxError> {
        self.modify(id, "mark message as unread", &["UNREAD"], &[]).await
    }

    async fn star(&self, id: &str) -> Result<(), MailboxError> {
        self.modify(id, "star message", &["STARRED"], &[]).await
    }

    async fn unstar(&self, id: &str) -> Result<(), MailboxError> {
        self.modify(id, "unstar message", &[], &["STARRED"]).await
    }

    async fn delete(&self, id: &str) -> Result<(), MailboxError> {
        let hub = self.hub();
        hub.users()
            .messages_trash("me", id)
            .doit()
            .await
            .map_err(|e| MailboxError::api("trash message", e))?;
        debug!(message_id = id, "Trashed remote message");
        Ok(())
    }
}

/// Converts a full-format Gmail message. Returns `None` when it carries no id.
pub fn decode_message(msg: GmailMessage) -> Option<RemoteMessage> {
    let external_id = msg.id?;
    let labels = msg.label_ids.unwrap_or_default();
    let payload = msg.payload.unwrap_or_default();
    let headers = payload.headers.as_deref().unwrap_or_default();

    let subject = header(headers, "Subject")
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("No Subject")
        .to_string();
    let from = header(headers, "From").unwrap_or_default().to_string();
    let to = split_addresses(header(headers, "To").unwrap_or_default());
    let cc = split_addresses(header(headers, "Cc").unwrap_or_default());
    let bcc = split_addresses(header(headers, "Bcc").unwrap_or_default());
    let received_at = received_at(header(headers, "Date"), msg.internal_date);

    let (body_text, body_html) = extract_bodies(&payload);

    Some(RemoteMessage {
        external_id,
        thread_id: msg.thread_id,
        subject,
        from,
        to,
        cc,
        bcc,
        body_text,
        body_html,
        snippet: msg.snippet,
        received_at,
        folder: folder_for_labels(&labels),
        has_attachments: has_attachments(&payload),
        is_read: !labels.iter().any(|l| l == "UNREAD"),
        is_starred: labels.iter().any(|l| l == "STARRED"),
        labels,
    })
}

fn header<'a>(headers: &'a [MessagePartHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| {
            h.name
                .as_deref()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|h| h.value.as_deref())
}

/// Splits an address header on commas that are outside quotes and angle brackets.
pub fn split_addresses(value: &str) -> Vec<String> {
    let mut addresses = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;

    for c in value.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            ',' if !in_quotes && !in_angle => {
                addresses.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    addresses.push(current);

    addresses
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}

fn received_at(date_header: Option<&str>, internal_date: Option<i64>) -> DateTime<Utc> {
    date_header
        .and_then(|raw| {
            // Drop trailing comments such as "(UTC)".
            let trimmed = raw.split(" (").next().unwrap_or(raw).trim();
            DateTime::parse_from_rfc2822(trimmed).ok()
        })
        .map(|d| d.with_timezone(&Utc))
        .or_else(|| internal_date.and_then(DateTime::from_timestamp_millis))
        .unwrap_or_else(Utc::now)
}

/// Returns `(plain text, html)`. Without a plain-text leaf, the text is derived
/// from the HTML.
pub fn extract_bodies(payload: &MessagePart) -> (String, Option<String>) {
    let mut plain = None;
    let mut html = None;
    walk_parts(payload, true, &mut plain, &mut html);

    let text = match (plain, &html) {
        (Some(text), _) => text,
        (None, Some(html)) => strip_html(html),
        (None, None) => String::new(),
    };
    (text, html)
}

fn walk_parts(part: &MessagePart, is_root: bool, plain: &mut Option<String>, html: &mut Option<String>) {
    let mime = part.mime_type.as_deref().unwrap_or_default();
    let is_leaf = part.parts.as_ref().is_none_or(|p| p.is_empty());

    if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_ref()) {
        let is_plain = mime.eq_ignore_ascii_case("text/plain") || (is_root && is_leaf && mime.is_empty());
        if is_plain && plain.is_none() {
            *plain = decode_body_data(data);
        } else if mime.eq_ignore_ascii_case("text/html") && html.is_none() {
            *html = decode_body_data(data);
        }
    }

    if let Some(parts) = &part.parts {
        for p in parts {
            walk_parts(p, false, plain, html);
        }
    }
}

/// The API client has already base64url-decoded body data, so the bytes are the
/// part's content. Non-UTF-8 charsets are decoded lossily.
fn decode_body_data(data: &[u8]) -> Option<String> {
    if data.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(data).into_owned())
}

pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }

    let decoded = text
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn has_attachments(part: &MessagePart) -> bool {
    part.filename.as_deref().is_some_and(|f| !f.is_empty())
        || part
            .parts
            .as_ref()
            .is_some_and(|parts| parts.iter().any(has_attachments))
}

/// SPAM > TRASH > SENT > DRAFT > INBOX, defaulting to the inbox.
pub fn folder_for_labels(labels: &[String]) -> Folder {
    let has = |label: &str| labels.iter().any(|l| l == label);
    if has("SPAM") {
        Folder::Junk
    } else if has("TRASH") {
        Folder::Trash
    } else if has("SENT") {
        Folder::Sent
    } else if has("DRAFT") {
        Folder::Drafts
    } else {
        Folder::Inbox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use google_gmail1::api::MessagePartBody;

    fn leaf(mime: &str, text: &str) -> MessagePart {
        MessagePart {
            mime_type: Some(mime.to_string()),
            body: Some(MessagePartBody {
                data: Some(text.as_bytes().to_vec()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn multipart(mime: &str, parts: Vec<MessagePart>) -> MessagePart {
        MessagePart {
            mime_type: Some(mime.to_string()),
            parts: Some(parts),
            ..Default::default()
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> Option<Vec<MessagePartHeader>> {
        Some(
            pairs
                .iter()
                .map(|(n, v)| MessagePartHeader {
                    name: Some(n.to_string()),
                    value: Some(v.to_string()),
                })
                .collect(),
        )
    }

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_folder_precedence() {
        assert_eq!(folder_for_labels(&labels(&["INBOX", "SPAM"])), Folder::Junk);
        assert_eq!(folder_for_labels(&labels(&["TRASH", "SENT"])), Folder::Trash);
        assert_eq!(folder_for_labels(&labels(&["SENT", "DRAFT"])), Folder::Sent);
        assert_eq!(folder_for_labels(&labels(&["DRAFT", "INBOX"])), Folder::Drafts);
        assert_eq!(folder_for_labels(&labels(&["INBOX"])), Folder::Inbox);
        assert_eq!(folder_for_labels(&labels(&["CATEGORY_UPDATES"])), Folder::Inbox);
        assert_eq!(folder_for_labels(&[]), Folder::Inbox);
    }

    #[test]
    fn test_nested_multipart_prefers_first_leaves() {
        let payload = multipart(
            "multipart/mixed",
            vec![
                multipart(
                    "multipart/alternative",
                    vec![
                        leaf("text/plain", "Quarterly numbers attached."),
                        leaf("text/html", "<p>Quarterly <b>numbers</b> attached.</p>"),
                    ],
                ),
                leaf("text/plain", "second plain part"),
            ],
        );

        let (text, html) = extract_bodies(&payload);
        assert_eq!(text, "Quarterly numbers attached.");
        assert_eq!(html.as_deref(), Some("<p>Quarterly <b>numbers</b> attached.</p>"));
    }

    #[test]
    fn test_html_only_falls_back_to_stripped_text() {
        let payload = multipart(
            "multipart/alternative",
            vec![leaf(
                "text/html",
                "<html><body><h1>Hello</h1>\n<p>Fish &amp; chips&nbsp;today</p></body></html>",
            )],
        );

        let (text, html) = extract_bodies(&payload);
        assert_eq!(text, "Hello Fish & chips today");
        assert!(html.is_some());
    }

    #[test]
    fn test_single_part_root_body() {
        let payload = MessagePart {
            body: Some(MessagePartBody {
                data: Some(b"just text".to_vec()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(extract_bodies(&payload).0, "just text");
    }

    #[test]
    fn test_already_decoded_body_data_is_kept() {
        let payload = MessagePart {
            mime_type: Some("text/plain".to_string()),
            body: Some(MessagePartBody {
                data: Some(b"Meeting moved to 3pm, see you there!".to_vec()),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(extract_bodies(&payload).0, "Meeting moved to 3pm, see you there!");
    }

    #[test]
    fn test_body_that_looks_like_base64_is_not_decoded_again() {
        for body in ["abcd", "SGVsbG8"] {
            let payload = MessagePart {
                mime_type: Some("text/plain".to_string()),
                body: Some(MessagePartBody {
                    data: Some(body.as_bytes().to_vec()),
                    ..Default::default()
                }),
                ..Default::default()
            };
            assert_eq!(extract_bodies(&payload).0, body);
        }
    }

    #[test]
    fn test_empty_part_leaves_room_for_later_text() {
        let empty = leaf("text/plain", "");
        let payload = multipart("multipart/mixed", vec![empty, leaf("text/plain", "later")]);
        assert_eq!(extract_bodies(&payload).0, "later");
    }

    #[test]
    fn test_attachment_detection_is_recursive() {
        let mut attachment = leaf("application/pdf", "%PDF");
        attachment.filename = Some("invoice.pdf".to_string());
        let mut inline_text = leaf("text/plain", "see attached");
        inline_text.filename = Some(String::new());

        let nested = multipart(
            "multipart/mixed",
            vec![multipart("multipart/related", vec![inline_text.clone(), attachment])],
        );
        assert!(has_attachments(&nested));

        let plain = multipart("multipart/mixed", vec![inline_text]);
        assert!(!has_attachments(&plain));
    }

    #[test]
    fn test_split_addresses_respects_quotes() {
        assert_eq!(
            split_addresses(r#""Doe, Jane" <jane@example.com>, bob@example.com , ,"#),
            vec![
                r#""Doe, Jane" <jane@example.com>"#.to_string(),
                "bob@example.com".to_string()
            ]
        );
        assert!(split_addresses("").is_empty());
    }

    #[test]
    fn test_decode_message_headers_and_flags() {
        let mut payload = leaf("text/plain", "Body");
        payload.headers = headers(&[
            ("subject", "Invoice due"),
            ("FROM", "Billing <billing@example.com>"),
            ("To", "a@example.com, b@example.com"),
            ("Cc", "c@example.com"),
            ("Date", "Tue, 01 Jul 2025 10:52:37 +0200 (CEST)"),
        ]);

        let msg = GmailMessage {
            id: Some("18c1".to_string()),
            thread_id: Some("t1".to_string()),
            label_ids: Some(labels(&["INBOX", "STARRED"])),
            snippet: Some("Body".to_string()),
            payload: Some(payload),
            ..Default::default()
        };

        let decoded = decode_message(msg).unwrap();
        assert_eq!(decoded.external_id, "18c1");
        assert_eq!(decoded.subject, "Invoice due");
        assert_eq!(decoded.from, "Billing <billing@example.com>");
        assert_eq!(decoded.to, vec!["a@example.com", "b@example.com"]);
        assert_eq!(decoded.cc, vec!["c@example.com"]);
        assert!(decoded.bcc.is_empty());
        assert_eq!(decoded.folder, Folder::Inbox);
        assert!(decoded.is_read);
        assert!(decoded.is_starred);
        assert_eq!(decoded.received_at.to_rfc3339(), "2025-07-01T08:52:37+00:00");
    }

    #[test]
    fn test_decode_message_defaults() {
        let msg = GmailMessage {
            id: Some("1".to_string()),
            internal_date: Some(1_700_000_000_000),
            label_ids: Some(labels(&["UNREAD", "SPAM", "INBOX"])),
            ..Default::default()
        };

        let decoded = decode_message(msg).unwrap();
        assert_eq!(decoded.subject, "No Subject");
        assert_eq!(decoded.from, "");
        assert_eq!(decoded.body_text, "");
        assert_eq!(decoded.folder, Folder::Junk);
        assert!(!decoded.is_read);
        assert_eq!(decoded.received_at.timestamp_millis(), 1_700_000_000_000);

        assert!(decode_message(GmailMessage::default()).is_none());
    }
}
