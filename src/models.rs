use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";
pub const DEFAULT_VOICE_NAME: &str = "Rachel";
pub const DEFAULT_MODEL_ID: &str = "eleven_turbo_v2_5";

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    #[default]
    Inbox,
    Junk,
    Sent,
    Drafts,
    Trash,
}

impl Folder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Junk => "junk",
            Folder::Sent => "sent",
            Folder::Drafts => "drafts",
            Folder::Trash => "trash",
        }
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Folder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbox" => Ok(Folder::Inbox),
            "junk" => Ok(Folder::Junk),
            "sent" => Ok(Folder::Sent),
            "drafts" => Ok(Folder::Drafts),
            "trash" => Ok(Folder::Trash),
            other => Err(format!("unknown folder '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrgencyLevel {
    Critical,
    High,
    Medium,
    Low,
}

impl UrgencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrgencyLevel::Critical => "critical",
            UrgencyLevel::High => "high",
            UrgencyLevel::Medium => "medium",
            UrgencyLevel::Low => "low",
        }
    }
}

impl fmt::Display for UrgencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UrgencyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(UrgencyLevel::Critical),
            "high" => Ok(UrgencyLevel::High),
            "medium" => Ok(UrgencyLevel::Medium),
            "low" => Ok(UrgencyLevel::Low),
            other => Err(format!("unknown urgency level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConnection {
    pub id: String,
    pub owner_id: String,
    pub provider: String,
    pub address: String,
    #[serde(skip_serializing)]
    pub encrypted_access_token: String,
    #[serde(skip_serializing)]
    pub encrypted_refresh_token: Option<String>,
    pub token_expiry: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Plaintext OAuth tokens as handed over by the consent callback.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A message as decoded from the remote provider, before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessage {
    pub external_id: String,
    pub thread_id: Option<String>,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub body_text: String,
    pub body_html: Option<String>,
    pub snippet: Option<String>,
    pub received_at: DateTime<Utc>,
    pub folder: Folder,
    pub labels: Vec<String>,
    pub has_attachments: bool,
    pub is_read: bool,
    pub is_starred: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub owner_id: String,
    pub source_address: String,
    pub external_id: String,
    pub thread_id: Option<String>,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub body_text: String,
    pub body_html: Option<String>,
    pub snippet: Option<String>,
    pub received_at: DateTime<Utc>,
    pub folder: Folder,
    pub labels: Vec<String>,
    pub has_attachments: bool,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_processed: bool,
    pub audio_url: Option<String>,
    pub summary: Option<String>,
    pub urgency_level: Option<UrgencyLevel>,
    pub is_lead: bool,
    pub is_job_offer: bool,
    pub is_junk: Option<bool>,
    pub junk_confirmed: bool,
    pub ai_reason: Option<String>,
    pub confidence: Option<f64>,
}

impl Message {
    /// Builds a fresh, unprocessed record from a remote message.
    pub fn from_remote(owner_id: &str, source_address: &str, remote: RemoteMessage) -> Self {
        Self {
            id: new_id(),
            owner_id: owner_id.to_string(),
            source_address: source_address.to_string(),
            external_id: remote.external_id,
            thread_id: remote.thread_id,
            subject: remote.subject,
            from: remote.from,
            to: remote.to,
            cc: remote.cc,
            bcc: remote.bcc,
            body_text: remote.body_text,
            body_html: remote.body_html,
            snippet: remote.snippet,
            received_at: remote.received_at,
            folder: remote.folder,
            labels: remote.labels,
            has_attachments: remote.has_attachments,
            is_read: remote.is_read,
            is_starred: remote.is_starred,
            is_processed: false,
            audio_url: None,
            summary: None,
            urgency_level: None,
            is_lead: false,
            is_job_offer: false,
            is_junk: None,
            junk_confirmed: false,
            ai_reason: None,
            confidence: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub confidence: f64,
}

/// An insight extracted by the classifier, not yet tied to a stored message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsightDraft {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub confidence: f64,
}

/// The general analysis of one message.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailInsights {
    pub summary: String,
    pub urgency_level: UrgencyLevel,
    pub is_lead: bool,
    pub is_job_offer: bool,
    pub insights: Vec<InsightDraft>,
}

impl EmailInsights {
    pub fn fallback() -> Self {
        Self {
            summary: "Unable to generate summary".to_string(),
            urgency_level: UrgencyLevel::Low,
            is_lead: false,
            is_job_offer: false,
            insights: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JunkVerdict {
    pub is_junk: bool,
    pub confidence: f64,
    pub reason: String,
}

impl JunkVerdict {
    /// Unreviewed spam is worse than a false positive awaiting confirmation.
    pub fn fallback() -> Self {
        Self {
            is_junk: true,
            confidence: 0.5,
            reason: "Error during analysis".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioObject {
    pub id: String,
    pub owner_id: String,
    pub message_id: Option<String>,
    pub filename: String,
    pub url: String,
    pub size: i64,
    pub duration_seconds: Option<f64>,
    pub mime_type: String,
}

/// Timbre parameters sent to the TTS API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiceSettings {
    pub stability: f64,
    pub similarity_boost: f64,
    pub style: f64,
    pub use_speaker_boost: bool,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            stability: 0.6,
            similarity_boost: 0.8,
            style: 0.2,
            use_speaker_boost: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub owner_id: String,
    pub voice_id: String,
    pub voice_name: String,
    pub model_id: String,
    pub stability: f64,
    pub similarity_boost: f64,
    pub style: f64,
    pub use_speaker_boost: bool,
}

impl VoiceProfile {
    pub fn defaults(owner_id: &str) -> Self {
        let settings = VoiceSettings::default();
        Self {
            owner_id: owner_id.to_string(),
            voice_id: DEFAULT_VOICE_ID.to_string(),
            voice_name: DEFAULT_VOICE_NAME.to_string(),
            model_id: DEFAULT_MODEL_ID.to_string(),
            stability: settings.stability,
            similarity_boost: settings.similarity_boost,
            style: settings.style,
            use_speaker_boost: settings.use_speaker_boost,
        }
    }

    pub fn settings(&self) -> VoiceSettings {
        VoiceSettings {
            stability: self.stability,
            similarity_boost: self.similarity_boost,
            style: self.style,
            use_speaker_boost: self.use_speaker_boost,
        }
    }

    /// Returns the name of the first out-of-range parameter, if any.
    pub fn out_of_range(&self) -> Option<&'static str> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.stability) {
            Some("stability")
        } else if !in_unit(self.similarity_boost) {
            Some("similarity_boost")
        } else if !in_unit(self.style) {
            Some("style")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub total_emails: i64,
    pub processed_emails: i64,
    pub unprocessed_emails: i64,
    pub critical_emails: i64,
    pub leads: i64,
    pub job_offers: i64,
    pub junk_to_review: i64,
    pub unread_emails: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageList {
    pub messages: Vec<Message>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
    pub pages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionList {
    pub connections: Vec<MailboxConnection>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_round_trips_through_text() {
        for folder in [
            Folder::Inbox,
            Folder::Junk,
            Folder::Sent,
            Folder::Drafts,
            Folder::Trash,
        ] {
            assert_eq!(folder.as_str().parse::<Folder>(), Ok(folder));
        }
        assert!("spam".parse::<Folder>().is_err());
    }

    #[test]
    fn test_voice_profile_range_check() {
        let mut profile = VoiceProfile::defaults("owner");
        assert_eq!(profile.out_of_range(), None);

        profile.similarity_boost = 1.2;
        assert_eq!(profile.out_of_range(), Some("similarity_boost"));

        profile.similarity_boost = 1.0;
        profile.style = -0.1;
        assert_eq!(profile.out_of_range(), Some("style"));
    }
}
