use anyhow::{Context, Result};
use async_trait::async_trait;
use inflections::case::to_snake_case;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use crate::config::OpenAiConfig;
use crate::models::{EmailInsights, InsightDraft, JunkVerdict, UrgencyLevel};

const ANALYST_PROMPT: &str = "You are an expert email analyst. Return structured JSON only.";
const SPAM_PROMPT: &str = "You are a spam detection expert. Return structured JSON only.";

/// Outcome of the general analysis: either a response that passed schema
/// validation, or the fixed fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum EmailAnalysis {
    Parsed(EmailInsights),
    Fallback,
}

impl EmailAnalysis {
    pub fn from_completion(content: &str) -> Self {
        match serde_json::from_str::<EmailInsightsSchema>(content) {
            Ok(schema) => schema.validate().map_or(Self::Fallback, Self::Parsed),
            Err(e) => {
                debug!("Analysis response failed validation: {}", e);
                Self::Fallback
            }
        }
    }

    pub fn into_insights(self) -> EmailInsights {
        match self {
            Self::Parsed(insights) => insights,
            Self::Fallback => EmailInsights::fallback(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JunkAnalysis {
    Parsed(JunkVerdict),
    Fallback,
}

impl JunkAnalysis {
    pub fn from_completion(content: &str) -> Self {
        match serde_json::from_str::<JunkSchema>(content) {
            Ok(schema) => schema.validate().map_or(Self::Fallback, Self::Parsed),
            Err(e) => {
                debug!("Junk response failed validation: {}", e);
                Self::Fallback
            }
        }
    }

    pub fn into_verdict(self) -> JunkVerdict {
        match self {
            Self::Parsed(verdict) => verdict,
            Self::Fallback => JunkVerdict::fallback(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmailInsightsSchema {
    summary: String,
    #[serde(deserialize_with = "urgency_any_case")]
    urgency_level: UrgencyLevel,
    is_lead: bool,
    is_job_offer: bool,
    #[serde(default)]
    insights: Vec<InsightSchema>,
}

/// Models sometimes capitalize the level ("High", "CRITICAL").
fn urgency_any_case<'de, D>(deserializer: D) -> std::result::Result<UrgencyLevel, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.trim()
        .to_ascii_lowercase()
        .parse()
        .map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
struct InsightSchema {
    #[serde(rename = "type")]
    kind: String,
    value: serde_json::Value,
    confidence: f64,
}

impl EmailInsightsSchema {
    fn validate(self) -> Option<EmailInsights> {
        let summary = self.summary.trim();
        if summary.is_empty() {
            return None;
        }

        let insights = self
            .insights
            .into_iter()
            .filter(|i| i.confidence.is_finite() && (0.0..=1.0).contains(&i.confidence))
            .filter(|i| !i.kind.trim().is_empty())
            .map(|i| InsightDraft {
                kind: to_snake_case(i.kind.trim()),
                value: match i.value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                },
                confidence: i.confidence,
            })
            .collect();

        Some(EmailInsights {
            summary: summary.to_string(),
            urgency_level: self.urgency_level,
            is_lead: self.is_lead,
            is_job_offer: self.is_job_offer,
            insights,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JunkSchema {
    is_junk: bool,
    confidence: f64,
    #[serde(default)]
    reason: Option<String>,
}

impl JunkSchema {
    fn validate(self) -> Option<JunkVerdict> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return None;
        }
        let reason = self
            .reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "Unable to determine".to_string());

        Some(JunkVerdict {
            is_junk: self.is_junk,
            confidence: self.confidence,
            reason,
        })
    }
}

/// The two narrow contracts the pipeline relies on. Implementations never fail;
/// upstream problems resolve to the fallback variants.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn analyze_email(&self, subject: &str, from: &str, body: &str) -> EmailAnalysis;
    async fn analyze_junk(&self, subject: &str, from: &str, body: &str) -> JunkAnalysis;
}

/// Minimal chat-completions client for JSON-mode responses.
pub struct OpenAiClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(config: &OpenAiConfig) -> Self {
        Self {
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Returns the raw content of the first choice.
    pub async fn complete_json(&self, system: &str, prompt: &str, temperature: f32) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": prompt }
            ],
            "temperature": temperature,
            "response_format": { "type": "json_object" },
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to send chat completion request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Chat completion error ({}): {}", status, error_text);
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse chat completion response")?;

        response_json["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .context("Chat completion response has no content")
    }
}

pub struct ContentClassifier {
    client: OpenAiClient,
}

impl ContentClassifier {
    pub fn new(client: OpenAiClient) -> Self {
        Self { client }
    }
}

pub fn analysis_prompt(subject: &str, from: &str, body: &str) -> String {
    format!(
        "Analyze this email and provide insights in JSON format:

Subject: {subject}
From: {from}
Body: {body}

Provide a JSON response with:
1. summary (concise 1-2 sentence summary)
2. urgencyLevel (critical/high/medium/low based on deadlines, urgency keywords)
3. isLead (boolean - potential business opportunity, partnership, or new client)
4. isJobOffer (boolean - job opportunity, recruitment, career opportunity)
5. insights (array of objects with type, value, confidence between 0 and 1)

Return ONLY valid JSON."
    )
}

pub fn junk_prompt(subject: &str, from: &str, body: &str) -> String {
    format!(
        "Analyze if this email is spam/junk:

Subject: {subject}
From: {from}
Body: {body}

Return JSON with:
1. isJunk (boolean - true if spam/phishing/scam)
2. confidence (0-1 confidence score)
3. reason (brief explanation)

Look for: phishing attempts, scam indicators, suspicious domains, grammar issues.
Return ONLY valid JSON."
    )
}

#[async_trait]
impl Classifier for ContentClassifier {
    async fn analyze_email(&self, subject: &str, from: &str, body: &str) -> EmailAnalysis {
        let prompt = analysis_prompt(subject, from, body);
        match self.client.complete_json(ANALYST_PROMPT, &prompt, 0.3).await {
            Ok(content) => EmailAnalysis::from_completion(&content),
            Err(e) => {
                warn!("Email analysis failed: {:#}", e);
                EmailAnalysis::Fallback
            }
        }
    }

    async fn analyze_junk(&self, subject: &str, from: &str, body: &str) -> JunkAnalysis {
        let prompt = junk_prompt(subject, from, body);
        match self.client.complete_json(SPAM_PROMPT, &prompt, 0.2).await {
            Ok(content) => JunkAnalysis::from_completion(&content),
            Err(e) => {
                warn!("Junk analysis failed: {:#}", e);
                JunkAnalysis::Fallback
            }
        }
    }
}
