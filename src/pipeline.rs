use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classifier, EmailAnalysis};
use crate::config::PipelineSettings;
use crate::db::Database;
use crate::error::{PipelineError, PipelineResult};
use crate::gmail::{INBOX_QUERY, Mailbox, MailboxConnector};
use crate::models::{
    ConnectionList, DEFAULT_MODEL_ID, EmailInsights, Folder, MailboxConnection, Message,
    MessageList, Stats, TokenPair, UrgencyLevel, VoiceProfile, VoiceSettings,
};
use crate::narration::{NarrationRequest, Synthesizer, Voice};
use crate::storage::ObjectStore;
use crate::vault::Vault;

pub const GMAIL_PROVIDER: &str = "gmail";

/// Keeps local message stores in step with connected mailboxes and enriches
/// new mail with insights and narration.
pub struct Pipeline {
    db: Database,
    connector: Arc<dyn MailboxConnector>,
    classifier: Arc<dyn Classifier>,
    synthesizer: Arc<dyn Synthesizer>,
    store: Arc<dyn ObjectStore>,
    vault: Arc<Vault>,
    settings: PipelineSettings,
}

/// At most `max_chars` characters of `text`.
fn window(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// The sentence read aloud for a processed message.
pub fn narration_text(message: &Message, analysis: &EmailInsights) -> String {
    let urgent = if analysis.urgency_level == UrgencyLevel::Critical {
        "This is urgent. "
    } else {
        ""
    };
    format!(
        "Email from {}. Subject: {}. {}{}",
        message.from, message.subject, urgent, analysis.summary
    )
}

impl Pipeline {
    pub fn new(
        db: Database,
        connector: Arc<dyn MailboxConnector>,
        classifier: Arc<dyn Classifier>,
        synthesizer: Arc<dyn Synthesizer>,
        store: Arc<dyn ObjectStore>,
        vault: Arc<Vault>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            db,
            connector,
            classifier,
            synthesizer,
            store,
            vault,
            settings,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Connects to the mailbox, refreshing the access token when it no longer
    /// validates. Credential problems yield `None`.
    async fn open_mailbox(
        &self,
        connection: &MailboxConnection,
    ) -> PipelineResult<Option<Box<dyn Mailbox>>> {
        let mailbox = match self.connector.connect(connection).await {
            Ok(mailbox) => mailbox,
            Err(e) => {
                warn!(address = %connection.address, "Cannot open mailbox: {}", e);
                return Ok(None);
            }
        };

        if mailbox.validate_token().await {
            return Ok(Some(mailbox));
        }

        debug!(address = %connection.address, "Access token rejected, refreshing");
        match mailbox.refresh_access_token().await {
            Ok(refreshed) => {
                self.db
                    .update_connection_token(
                        &connection.id,
                        &refreshed.encrypted_access_token,
                        refreshed.expires_at,
                    )
                    .await?;
                Ok(Some(mailbox))
            }
            Err(e) => {
                warn!(address = %connection.address, "Failed to refresh token: {}", e);
                Ok(None)
            }
        }
    }

    /// The mailbox a stored message came from, if it is still connected.
    async fn mailbox_for(&self, message: &Message) -> PipelineResult<Option<Box<dyn Mailbox>>> {
        let connection = self
            .db
            .connection_by_address(&message.owner_id, &message.source_address)
            .await?;
        match connection {
            Some(connection) if connection.active => self.open_mailbox(&connection).await,
            _ => {
                warn!(address = %message.source_address, "No active connection for mailbox");
                Ok(None)
            }
        }
    }

    async fn syncable_connections(&self, owner_id: &str) -> PipelineResult<Vec<MailboxConnection>> {
        let connections = self.db.active_connections(owner_id).await?;
        Ok(connections
            .into_iter()
            .filter(|c| {
                let supported = c.provider == GMAIL_PROVIDER;
                if !supported {
                    debug!(provider = %c.provider, "Skipping unsupported provider");
                }
                supported
            })
            .collect())
    }

    /// Stores inbox messages not seen before. Returns how many were new.
    pub async fn sync_inbox(&self, owner_id: &str) -> PipelineResult<usize> {
        let mut total = 0;

        for connection in self.syncable_connections(owner_id).await? {
            let Some(mailbox) = self.open_mailbox(&connection).await? else {
                continue;
            };

            let page = match mailbox
                .fetch_messages(self.settings.inbox_page_size, None, Some(INBOX_QUERY))
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!(address = %connection.address, "Error syncing inbox: {}", e);
                    continue;
                }
            };

            let mut stored = 0;
            for remote in page.messages {
                let message = Message::from_remote(owner_id, &connection.address, remote);
                if self.db.insert_message_if_absent(&message).await? {
                    stored += 1;
                }
            }
            debug!(address = %connection.address, stored, "Inbox page synced");
            total += stored;
        }

        info!(owner_id, total, "Inbox sync complete");
        Ok(total)
    }

    /// Stores spam-folder messages not seen before, each with a junk verdict.
    pub async fn sync_junk(&self, owner_id: &str) -> PipelineResult<usize> {
        let mut total = 0;

        for connection in self.syncable_connections(owner_id).await? {
            let Some(mailbox) = self.open_mailbox(&connection).await? else {
                continue;
            };

            let remotes = match mailbox.fetch_junk(self.settings.junk_page_size).await {
                Ok(remotes) => remotes,
                Err(e) => {
                    warn!(address = %connection.address, "Error syncing junk: {}", e);
                    continue;
                }
            };

            for remote in remotes {
                if self.db.message_exists(owner_id, &remote.external_id).await? {
                    continue;
                }

                let verdict = self
                    .classifier
                    .analyze_junk(
                        &remote.subject,
                        &remote.from,
                        window(&remote.body_text, self.settings.junk_window),
                    )
                    .await
                    .into_verdict();

                let mut message = Message::from_remote(owner_id, &connection.address, remote);
                message.folder = Folder::Junk;
                message.is_junk = Some(verdict.is_junk);
                message.confidence = Some(verdict.confidence);
                message.ai_reason = Some(verdict.reason);
                message.junk_confirmed = false;

                if self.db.insert_message_if_absent(&message).await? {
                    total += 1;
                }
            }
        }

        info!(owner_id, total, "Junk sync complete");
        Ok(total)
    }

    /// Analyzes and narrates one message. `None` when the owner has no such
    /// message or it was already processed.
    pub async fn process_message(
        &self,
        message_id: &str,
        owner_id: &str,
    ) -> PipelineResult<Option<Message>> {
        let Some(message) = self.db.get_message(message_id, owner_id).await? else {
            debug!(message_id, "Message not found for owner");
            return Ok(None);
        };
        if message.is_processed {
            return Ok(None);
        }

        let analysis = self
            .classifier
            .analyze_email(
                &message.subject,
                &message.from,
                window(&message.body_text, self.settings.analysis_window),
            )
            .await;
        if analysis == EmailAnalysis::Fallback {
            warn!(message_id, "Using fallback analysis");
        }
        let analysis = analysis.into_insights();

        let profile = self.voice_profile(owner_id).await?;
        let request = NarrationRequest {
            text: narration_text(&message, &analysis),
            owner_id: owner_id.to_string(),
            message_id: Some(message.id.clone()),
            voice_id: profile.voice_id.clone(),
            model_id: profile.model_id.clone(),
            settings: profile.settings(),
        };

        let audio_url = match self.synthesizer.synthesize(&request).await {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(message_id, "Failed to generate audio: {:#}", e);
                None
            }
        };

        let applied = self
            .db
            .apply_processing(&message.id, &analysis, audio_url.as_deref())
            .await?;
        if !applied {
            debug!(message_id, "Message processed concurrently, discarding this result");
            if let Some(url) = &audio_url {
                self.discard_audio(owner_id, url).await?;
            }
            return Ok(None);
        }
        info!(message_id, urgency = %analysis.urgency_level, "Message processed");

        Ok(self.db.get_message(message_id, owner_id).await?)
    }

    /// Drops audio that no message will reference.
    async fn discard_audio(&self, owner_id: &str, url: &str) -> PipelineResult<()> {
        if let Some(object) = self.db.audio_by_url(owner_id, url).await? {
            self.db.delete_audio_object(&object.id, owner_id).await?;
        }
        if let Err(e) = self.store.delete(url).await {
            warn!(url = %url, "Failed to delete audio: {:#}", e);
        }
        Ok(())
    }

    /// Processes up to `limit` unprocessed inbox messages, newest first.
    /// Failures are logged and left out of the result.
    pub async fn batch_process(
        &self,
        owner_id: &str,
        limit: Option<u32>,
    ) -> PipelineResult<Vec<Message>> {
        let limit = limit.unwrap_or(self.settings.batch_limit);
        let pending = self
            .db
            .unprocessed_messages(owner_id, i64::from(limit))
            .await?;

        let mut processed = Vec::with_capacity(pending.len());
        for message in pending {
            match self.process_message(&message.id, owner_id).await {
                Ok(Some(updated)) => processed.push(updated),
                Ok(None) => {}
                Err(e) => error!(message_id = %message.id, "Failed to process message: {}", e),
            }
        }

        info!(owner_id, count = processed.len(), "Batch processing complete");
        Ok(processed)
    }

    /// Records the owner's junk decision. Rescued messages are also moved back
    /// to the remote inbox; that step may fail without undoing the decision.
    pub async fn confirm_junk(
        &self,
        message_id: &str,
        owner_id: &str,
        is_junk: bool,
    ) -> PipelineResult<()> {
        let message = self
            .db
            .get_message(message_id, owner_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("message {}", message_id)))?;

        self.db.confirm_junk(message_id, owner_id, is_junk).await?;

        if !is_junk {
            if let Some(mailbox) = self.mailbox_for(&message).await? {
                if let Err(e) = mailbox.move_to_inbox(&message.external_id).await {
                    warn!(message_id, "Failed to move message in mailbox: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Seals the token pair and stores (or refreshes) the connection.
    pub async fn connect_mailbox(
        &self,
        owner_id: &str,
        address: &str,
        tokens: &TokenPair,
    ) -> PipelineResult<MailboxConnection> {
        let address = address.trim();
        if address.is_empty() {
            return Err(PipelineError::InvalidInput("mailbox address is empty".to_string()));
        }

        let access = self.vault.encrypt(&tokens.access_token)?;
        let refresh = tokens
            .refresh_token
            .as_deref()
            .map(|t| self.vault.encrypt(t))
            .transpose()?;

        let connection = self
            .db
            .upsert_connection(
                owner_id,
                GMAIL_PROVIDER,
                address,
                &access,
                refresh.as_deref(),
                tokens.expires_at,
            )
            .await?;
        info!(owner_id, address, "Mailbox connected");
        Ok(connection)
    }

    /// Removes the connection, the messages it brought in, and their audio.
    /// Returns the disconnected address.
    pub async fn disconnect_mailbox(
        &self,
        owner_id: &str,
        connection_id: &str,
    ) -> PipelineResult<String> {
        let removed = self
            .db
            .delete_connection(connection_id, owner_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("connection {}", connection_id)))?;

        for url in &removed.audio_urls {
            if let Err(e) = self.store.delete(url).await {
                warn!(url = %url, "Failed to delete audio: {:#}", e);
            }
        }

        info!(owner_id, address = %removed.address, "Mailbox disconnected");
        Ok(removed.address)
    }

    /// Deletes the message with its insights and audio. With `trash_remote`
    /// the remote copy is moved to trash as well.
    pub async fn delete_message(
        &self,
        message_id: &str,
        owner_id: &str,
        trash_remote: bool,
    ) -> PipelineResult<()> {
        let message = self
            .db
            .get_message(message_id, owner_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("message {}", message_id)))?;

        if trash_remote {
            if let Some(mailbox) = self.mailbox_for(&message).await? {
                if let Err(e) = mailbox.delete(&message.external_id).await {
                    warn!(message_id, "Failed to trash remote message: {}", e);
                }
            }
        }

        for audio in self.db.audio_for_message(message_id).await? {
            if let Err(e) = self.store.delete(&audio.url).await {
                warn!(url = %audio.url, "Failed to delete audio: {:#}", e);
            }
            self.db.delete_audio_object(&audio.id, owner_id).await?;
        }

        self.db.delete_message(message_id, owner_id).await?;
        Ok(())
    }

    /// Deletes one of the owner's audio objects. A message narrated with it
    /// keeps its analysis but loses the audio URL.
    pub async fn delete_audio(&self, owner_id: &str, audio_id: &str) -> PipelineResult<()> {
        let object = self
            .db
            .delete_audio_object(audio_id, owner_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("audio {}", audio_id)))?;

        if let Err(e) = self.store.delete(&object.url).await {
            warn!(url = %object.url, "Failed to delete audio: {:#}", e);
        }
        info!(owner_id, audio_id, "Audio deleted");
        Ok(())
    }

    pub async fn set_read(&self, message_id: &str, owner_id: &str, read: bool) -> PipelineResult<()> {
        let message = self
            .db
            .get_message(message_id, owner_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("message {}", message_id)))?;
        self.db.set_read(message_id, owner_id, read).await?;

        if let Some(mailbox) = self.mailbox_for(&message).await? {
            let result = if read {
                mailbox.mark_as_read(&message.external_id).await
            } else {
                mailbox.mark_as_unread(&message.external_id).await
            };
            if let Err(e) = result {
                warn!(message_id, "{}", e);
            }
        }
        Ok(())
    }

    pub async fn set_starred(
        &self,
        message_id: &str,
        owner_id: &str,
        starred: bool,
    ) -> PipelineResult<()> {
        let message = self
            .db
            .get_message(message_id, owner_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("message {}", message_id)))?;
        self.db.set_starred(message_id, owner_id, starred).await?;

        if let Some(mailbox) = self.mailbox_for(&message).await? {
            let result = if starred {
                mailbox.star(&message.external_id).await
            } else {
                mailbox.unstar(&message.external_id).await
            };
            if let Err(e) = result {
                warn!(message_id, "{}", e);
            }
        }
        Ok(())
    }

    pub async fn save_voice_profile(&self, profile: &VoiceProfile) -> PipelineResult<()> {
        if profile.voice_id.trim().is_empty() {
            return Err(PipelineError::InvalidInput("voice_id is required".to_string()));
        }
        if let Some(field) = profile.out_of_range() {
            return Err(PipelineError::InvalidInput(format!(
                "{} must be between 0 and 1",
                field
            )));
        }
        self.db.upsert_voice_profile(profile).await?;
        Ok(())
    }

    /// The stored profile, or the built-in defaults.
    pub async fn voice_profile(&self, owner_id: &str) -> PipelineResult<VoiceProfile> {
        Ok(self
            .db
            .voice_profile(owner_id)
            .await?
            .unwrap_or_else(|| VoiceProfile::defaults(owner_id)))
    }

    pub async fn stats(&self, owner_id: &str) -> PipelineResult<Stats> {
        Ok(self.db.stats(owner_id).await?)
    }

    pub async fn list_messages(
        &self,
        owner_id: &str,
        folder: Folder,
        page: i64,
        limit: i64,
    ) -> PipelineResult<MessageList> {
        Ok(self.db.list_messages(owner_id, folder, page, limit).await?)
    }

    pub async fn junk_for_review(&self, owner_id: &str) -> PipelineResult<Vec<Message>> {
        Ok(self.db.junk_for_review(owner_id).await?)
    }

    /// Narrates arbitrary text with the given voice, outside any message.
    /// Returns the audio URL.
    pub async fn preview_voice(
        &self,
        owner_id: &str,
        voice_id: &str,
        text: &str,
        model_id: Option<&str>,
        settings: Option<VoiceSettings>,
    ) -> PipelineResult<String> {
        let voice_id = voice_id.trim();
        let text = text.trim();
        if voice_id.is_empty() || text.is_empty() {
            return Err(PipelineError::InvalidInput(
                "voice_id and text are required".to_string(),
            ));
        }

        let request = NarrationRequest {
            text: text.to_string(),
            owner_id: owner_id.to_string(),
            message_id: None,
            voice_id: voice_id.to_string(),
            model_id: model_id
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_MODEL_ID)
                .to_string(),
            settings: settings.unwrap_or_default(),
        };

        self.synthesizer
            .synthesize(&request)
            .await
            .map_err(|e| PipelineError::Narration(format!("{:#}", e)))
    }

    /// Every mailbox the owner has connected, active or not.
    pub async fn connections(&self, owner_id: &str) -> PipelineResult<ConnectionList> {
        let connections = self.db.connections(owner_id).await?;
        Ok(ConnectionList {
            total: connections.len(),
            connections,
        })
    }

    pub async fn available_voices(&self) -> Vec<Voice> {
        match self.synthesizer.voices().await {
            Ok(voices) => voices,
            Err(e) => {
                warn!("Failed to list voices: {:#}", e);
                Vec::new()
            }
        }
    }
}
