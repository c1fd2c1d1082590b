use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Result, Row};
use std::str::FromStr;

use crate::models::{
    AudioObject, EmailInsights, Folder, Insight, MailboxConnection, Message, MessageList, Stats,
    User, VoiceProfile, new_id,
};

const MESSAGE_COLUMNS: &str = "id, owner_id, source_address, external_id, thread_id, subject, \
     from_address, to_addresses, cc_addresses, bcc_addresses, body_text, body_html, snippet, \
     received_at, folder, labels, has_attachments, is_read, is_starred, is_processed, audio_url, \
     summary, urgency_level, is_lead, is_job_offer, is_junk, junk_confirmed, ai_reason, confidence";

const CONNECTION_COLUMNS: &str = "id, owner_id, provider, address, encrypted_access_token, \
     encrypted_refresh_token, token_expiry, active";

const AUDIO_COLUMNS: &str =
    "id, owner_id, message_id, filename, url, size, duration_seconds, mime_type";

const JUNK_REVIEW_LIMIT: i64 = 50;
const MAX_PAGE_LIMIT: i64 = 100;

/// What a disconnect removed, so the caller can clean up object storage.
#[derive(Debug, Clone)]
pub struct RemovedConnection {
    pub address: String,
    pub audio_urls: Vec<String>,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn to_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn from_json(text: &str) -> Vec<String> {
    serde_json::from_str(text).unwrap_or_default()
}

fn message_from_row(row: &SqliteRow) -> Message {
    Message {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        source_address: row.get("source_address"),
        external_id: row.get("external_id"),
        thread_id: row.get("thread_id"),
        subject: row.get("subject"),
        from: row.get("from_address"),
        to: from_json(row.get("to_addresses")),
        cc: from_json(row.get("cc_addresses")),
        bcc: from_json(row.get("bcc_addresses")),
        body_text: row.get("body_text"),
        body_html: row.get("body_html"),
        snippet: row.get("snippet"),
        received_at: from_millis(row.get("received_at")),
        folder: row
            .get::<'_, String, _>("folder")
            .parse()
            .unwrap_or_default(),
        labels: from_json(row.get("labels")),
        has_attachments: row.get("has_attachments"),
        is_read: row.get("is_read"),
        is_starred: row.get("is_starred"),
        is_processed: row.get("is_processed"),
        audio_url: row.get("audio_url"),
        summary: row.get("summary"),
        urgency_level: row
            .get::<'_, Option<String>, _>("urgency_level")
            .and_then(|level| level.parse().ok()),
        is_lead: row.get("is_lead"),
        is_job_offer: row.get("is_job_offer"),
        is_junk: row.get("is_junk"),
        junk_confirmed: row.get("junk_confirmed"),
        ai_reason: row.get("ai_reason"),
        confidence: row.get("confidence"),
    }
}

fn connection_from_row(row: &SqliteRow) -> MailboxConnection {
    MailboxConnection {
        id: row.get(0),
        owner_id: row.get(1),
        provider: row.get(2),
        address: row.get(3),
        encrypted_access_token: row.get(4),
        encrypted_refresh_token: row.get(5),
        token_expiry: row.get::<'_, Option<i64>, _>(6).map(from_millis),
        active: row.get(7),
    }
}

fn audio_from_row(row: &SqliteRow) -> AudioObject {
    AudioObject {
        id: row.get(0),
        owner_id: row.get(1),
        message_id: row.get(2),
        filename: row.get(3),
        url: row.get(4),
        size: row.get(5),
        duration_seconds: row.get(6),
        mime_type: row.get(7),
    }
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    /// A private, migrated in-memory database. One connection keeps it alive.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // Users

    pub async fn create_user(&self, email: &str) -> Result<User> {
        let user = User {
            id: new_id(),
            email: email.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO users (id, email, created_at) VALUES (?, ?, ?)")
            .bind(&user.id)
            .bind(&user.email)
            .bind(to_millis(user.created_at))
            .execute(&self.pool)
            .await?;
        Ok(user)
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, email, created_at FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| User {
            id: r.get(0),
            email: r.get(1),
            created_at: from_millis(r.get(2)),
        }))
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT id, email, created_at FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| User {
            id: r.get(0),
            email: r.get(1),
            created_at: from_millis(r.get(2)),
        }))
    }

    pub async fn delete_user(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // Mailbox connections

    /// Inserts or refreshes the connection for `(owner_id, address)` and reactivates it.
    /// A missing refresh token keeps the stored one.
    pub async fn upsert_connection(
        &self,
        owner_id: &str,
        provider: &str,
        address: &str,
        encrypted_access_token: &str,
        encrypted_refresh_token: Option<&str>,
        token_expiry: Option<DateTime<Utc>>,
    ) -> Result<MailboxConnection> {
        let now = to_millis(Utc::now());
        sqlx::query(
            "INSERT INTO mailbox_connections (id, owner_id, provider, address, encrypted_access_token,
                 encrypted_refresh_token, token_expiry, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
             ON CONFLICT(owner_id, address) DO UPDATE SET
                 provider = excluded.provider,
                 encrypted_access_token = excluded.encrypted_access_token,
                 encrypted_refresh_token = COALESCE(excluded.encrypted_refresh_token,
                     mailbox_connections.encrypted_refresh_token),
                 token_expiry = excluded.token_expiry,
                 active = 1,
                 updated_at = excluded.updated_at",
        )
        .bind(new_id())
        .bind(owner_id)
        .bind(provider)
        .bind(address)
        .bind(encrypted_access_token)
        .bind(encrypted_refresh_token)
        .bind(token_expiry.map(to_millis))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.connection_by_address(owner_id, address)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    pub async fn active_connections(&self, owner_id: &str) -> Result<Vec<MailboxConnection>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM mailbox_connections
             WHERE owner_id = ? AND active = 1
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(connection_from_row).collect())
    }

    /// Every connection of the owner, active or not.
    pub async fn connections(&self, owner_id: &str) -> Result<Vec<MailboxConnection>> {
        let rows = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM mailbox_connections
             WHERE owner_id = ?
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(connection_from_row).collect())
    }

    pub async fn connection_by_address(
        &self,
        owner_id: &str,
        address: &str,
    ) -> Result<Option<MailboxConnection>> {
        let row = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM mailbox_connections WHERE owner_id = ? AND address = ?"
        ))
        .bind(owner_id)
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(connection_from_row))
    }

    pub async fn get_connection(&self, id: &str, owner_id: &str) -> Result<Option<MailboxConnection>> {
        let row = sqlx::query(&format!(
            "SELECT {CONNECTION_COLUMNS} FROM mailbox_connections WHERE id = ? AND owner_id = ?"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(connection_from_row))
    }

    pub async fn update_connection_token(
        &self,
        id: &str,
        encrypted_access_token: &str,
        token_expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE mailbox_connections
             SET encrypted_access_token = ?, token_expiry = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(encrypted_access_token)
        .bind(token_expiry.map(to_millis))
        .bind(to_millis(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Removes the connection together with every message sourced from its address.
    /// Returns `None` when the owner has no such connection.
    pub async fn delete_connection(
        &self,
        id: &str,
        owner_id: &str,
    ) -> Result<Option<RemovedConnection>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT address FROM mailbox_connections WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let address: String = row.get(0);

        let audio_urls: Vec<String> = sqlx::query(
            "SELECT a.url FROM audio_objects a
             JOIN messages m ON a.message_id = m.id
             WHERE m.owner_id = ? AND m.source_address = ?",
        )
        .bind(owner_id)
        .bind(&address)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|r| r.get(0))
        .collect();

        sqlx::query(
            "DELETE FROM audio_objects WHERE message_id IN
                 (SELECT id FROM messages WHERE owner_id = ? AND source_address = ?)",
        )
        .bind(owner_id)
        .bind(&address)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM messages WHERE owner_id = ? AND source_address = ?")
            .bind(owner_id)
            .bind(&address)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM mailbox_connections WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(RemovedConnection {
            address,
            audio_urls,
        }))
    }

    // Messages

    /// Stores the message unless `(owner_id, external_id)` already exists.
    /// Returns whether a row was written.
    pub async fn insert_message_if_absent(&self, msg: &Message) -> Result<bool> {
        let result = sqlx::query(&format!(
            "INSERT OR IGNORE INTO messages ({MESSAGE_COLUMNS})
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&msg.id)
        .bind(&msg.owner_id)
        .bind(&msg.source_address)
        .bind(&msg.external_id)
        .bind(&msg.thread_id)
        .bind(&msg.subject)
        .bind(&msg.from)
        .bind(to_json(&msg.to))
        .bind(to_json(&msg.cc))
        .bind(to_json(&msg.bcc))
        .bind(&msg.body_text)
        .bind(&msg.body_html)
        .bind(&msg.snippet)
        .bind(to_millis(msg.received_at))
        .bind(msg.folder.as_str())
        .bind(to_json(&msg.labels))
        .bind(msg.has_attachments)
        .bind(msg.is_read)
        .bind(msg.is_starred)
        .bind(msg.is_processed)
        .bind(&msg.audio_url)
        .bind(&msg.summary)
        .bind(msg.urgency_level.map(|u| u.as_str()))
        .bind(msg.is_lead)
        .bind(msg.is_job_offer)
        .bind(msg.is_junk)
        .bind(msg.junk_confirmed)
        .bind(&msg.ai_reason)
        .bind(msg.confidence)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn message_exists(&self, owner_id: &str, external_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM messages WHERE owner_id = ? AND external_id = ?")
            .bind(owner_id)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn find_message_by_external_id(
        &self,
        owner_id: &str,
        external_id: &str,
    ) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE owner_id = ? AND external_id = ?"
        ))
        .bind(owner_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(message_from_row))
    }

    /// Loads a message only if it belongs to `owner_id`.
    pub async fn get_message(&self, id: &str, owner_id: &str) -> Result<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ? AND owner_id = ?"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(message_from_row))
    }

    pub async fn unprocessed_messages(&self, owner_id: &str, limit: i64) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE owner_id = ? AND folder = 'inbox' AND is_processed = 0
             ORDER BY received_at DESC
             LIMIT ?"
        ))
        .bind(owner_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Writes the analysis fields, then the insight rows. Only the first write
    /// for a message takes effect; later ones return `false` and change nothing.
    pub async fn apply_processing(
        &self,
        id: &str,
        analysis: &EmailInsights,
        audio_url: Option<&str>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE messages
             SET is_processed = 1, summary = ?, urgency_level = ?, is_lead = ?, is_job_offer = ?,
                 audio_url = COALESCE(?, audio_url)
             WHERE id = ? AND is_processed = 0",
        )
        .bind(&analysis.summary)
        .bind(analysis.urgency_level.as_str())
        .bind(analysis.is_lead)
        .bind(analysis.is_job_offer)
        .bind(audio_url)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        for insight in &analysis.insights {
            sqlx::query(
                "INSERT INTO insights (id, message_id, type, value, confidence) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(new_id())
            .bind(id)
            .bind(&insight.kind)
            .bind(&insight.value)
            .bind(insight.confidence)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    pub async fn confirm_junk(&self, id: &str, owner_id: &str, is_junk: bool) -> Result<bool> {
        let folder = if is_junk { Folder::Junk } else { Folder::Inbox };
        let result = sqlx::query(
            "UPDATE messages SET junk_confirmed = 1, is_junk = ?, folder = ?
             WHERE id = ? AND owner_id = ?",
        )
        .bind(is_junk)
        .bind(folder.as_str())
        .bind(id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_read(&self, id: &str, owner_id: &str, is_read: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE messages SET is_read = ? WHERE id = ? AND owner_id = ?")
            .bind(is_read)
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_starred(&self, id: &str, owner_id: &str, is_starred: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE messages SET is_starred = ? WHERE id = ? AND owner_id = ?")
            .bind(is_starred)
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insights go with the message via cascade.
    pub async fn delete_message(&self, id: &str, owner_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ? AND owner_id = ?")
            .bind(id)
            .bind(owner_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// `page` is 1-based; `limit` is capped at 100.
    pub async fn list_messages(
        &self,
        owner_id: &str,
        folder: Folder,
        page: i64,
        limit: i64,
    ) -> Result<MessageList> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let offset = (page - 1).saturating_mul(limit);

        let total: i64 = sqlx::query("SELECT COUNT(*) FROM messages WHERE owner_id = ? AND folder = ?")
            .bind(owner_id)
            .bind(folder.as_str())
            .fetch_one(&self.pool)
            .await?
            .get(0);

        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE owner_id = ? AND folder = ?
             ORDER BY received_at DESC
             LIMIT ? OFFSET ?"
        ))
        .bind(owner_id)
        .bind(folder.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(MessageList {
            messages: rows.iter().map(message_from_row).collect(),
            total,
            page,
            limit,
            pages: (total + limit - 1) / limit,
        })
    }

    pub async fn junk_for_review(&self, owner_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE owner_id = ? AND folder = 'junk' AND junk_confirmed = 0
             ORDER BY received_at DESC
             LIMIT ?"
        ))
        .bind(owner_id)
        .bind(JUNK_REVIEW_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(message_from_row).collect())
    }

    /// Newest message whose sender or subject contains `term`, across all owners.
    pub async fn latest_matching(&self, term: &str) -> Result<Option<Message>> {
        let pattern = format!("%{}%", term);
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE from_address LIKE ? OR subject LIKE ?
             ORDER BY received_at DESC
             LIMIT 1"
        ))
        .bind(&pattern)
        .bind(&pattern)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(message_from_row))
    }

    // Insights

    pub async fn insights_for_message(&self, message_id: &str) -> Result<Vec<Insight>> {
        let rows = sqlx::query(
            "SELECT id, message_id, type, value, confidence FROM insights
             WHERE message_id = ? ORDER BY rowid ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Insight {
                id: row.get(0),
                message_id: row.get(1),
                kind: row.get(2),
                value: row.get(3),
                confidence: row.get(4),
            })
            .collect())
    }

    // Audio objects

    pub async fn insert_audio_object(&self, audio: &AudioObject) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO audio_objects ({AUDIO_COLUMNS}, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&audio.id)
        .bind(&audio.owner_id)
        .bind(&audio.message_id)
        .bind(&audio.filename)
        .bind(&audio.url)
        .bind(audio.size)
        .bind(audio.duration_seconds)
        .bind(&audio.mime_type)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn audio_for_message(&self, message_id: &str) -> Result<Vec<AudioObject>> {
        let rows = sqlx::query(&format!(
            "SELECT {AUDIO_COLUMNS} FROM audio_objects WHERE message_id = ? ORDER BY created_at ASC"
        ))
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(audio_from_row).collect())
    }

    pub async fn audio_for_owner(&self, owner_id: &str) -> Result<Vec<AudioObject>> {
        let rows = sqlx::query(&format!(
            "SELECT {AUDIO_COLUMNS} FROM audio_objects WHERE owner_id = ? ORDER BY created_at ASC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(audio_from_row).collect())
    }

    pub async fn get_audio_object(&self, id: &str, owner_id: &str) -> Result<Option<AudioObject>> {
        let row = sqlx::query(&format!(
            "SELECT {AUDIO_COLUMNS} FROM audio_objects WHERE id = ? AND owner_id = ?"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(audio_from_row))
    }

    pub async fn audio_by_url(&self, owner_id: &str, url: &str) -> Result<Option<AudioObject>> {
        let row = sqlx::query(&format!(
            "SELECT {AUDIO_COLUMNS} FROM audio_objects WHERE owner_id = ? AND url = ?"
        ))
        .bind(owner_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(audio_from_row))
    }

    /// Removes the owner's audio row and clears any message still pointing at it.
    /// Returns the removed object, or `None` when the owner has no such object.
    pub async fn delete_audio_object(&self, id: &str, owner_id: &str) -> Result<Option<AudioObject>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {AUDIO_COLUMNS} FROM audio_objects WHERE id = ? AND owner_id = ?"
        ))
        .bind(id)
        .bind(owner_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(object) = row.as_ref().map(audio_from_row) else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM audio_objects WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("UPDATE messages SET audio_url = NULL WHERE owner_id = ? AND audio_url = ?")
            .bind(owner_id)
            .bind(&object.url)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(object))
    }

    // Voice profiles and stats

    pub async fn voice_profile(&self, owner_id: &str) -> Result<Option<VoiceProfile>> {
        let row = sqlx::query(
            "SELECT owner_id, voice_id, voice_name, model_id, stability, similarity_boost, style,
                    use_speaker_boost
             FROM voice_profiles WHERE owner_id = ?",
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| VoiceProfile {
            owner_id: r.get(0),
            voice_id: r.get(1),
            voice_name: r.get(2),
            model_id: r.get(3),
            stability: r.get(4),
            similarity_boost: r.get(5),
            style: r.get(6),
            use_speaker_boost: r.get(7),
        }))
    }

    pub async fn upsert_voice_profile(&self, profile: &VoiceProfile) -> Result<()> {
        sqlx::query(
            "INSERT INTO voice_profiles (owner_id, voice_id, voice_name, model_id, stability,
                 similarity_boost, style, use_speaker_boost)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(owner_id) DO UPDATE SET voice_id=excluded.voice_id,
                 voice_name=excluded.voice_name, model_id=excluded.model_id,
                 stability=excluded.stability, similarity_boost=excluded.similarity_boost,
                 style=excluded.style, use_speaker_boost=excluded.use_speaker_boost",
        )
        .bind(&profile.owner_id)
        .bind(&profile.voice_id)
        .bind(&profile.voice_name)
        .bind(&profile.model_id)
        .bind(profile.stability)
        .bind(profile.similarity_boost)
        .bind(profile.style)
        .bind(profile.use_speaker_boost)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn stats(&self, owner_id: &str) -> Result<Stats> {
        let row = sqlx::query(
            "SELECT
                 COALESCE(SUM(folder = 'inbox'), 0),
                 COALESCE(SUM(folder = 'inbox' AND is_processed = 1), 0),
                 COALESCE(SUM(folder = 'inbox' AND urgency_level = 'critical'), 0),
                 COALESCE(SUM(folder = 'inbox' AND is_lead = 1), 0),
                 COALESCE(SUM(folder = 'inbox' AND is_job_offer = 1), 0),
                 COALESCE(SUM(folder = 'junk' AND junk_confirmed = 0), 0),
                 COALESCE(SUM(folder = 'inbox' AND is_read = 0), 0)
             FROM messages WHERE owner_id = ?",
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        let total_emails: i64 = row.get(0);
        let processed_emails: i64 = row.get(1);
        Ok(Stats {
            total_emails,
            processed_emails,
            unprocessed_emails: total_emails - processed_emails,
            critical_emails: row.get(2),
            leads: row.get(3),
            job_offers: row.get(4),
            junk_to_review: row.get(5),
            unread_emails: row.get(6),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InsightDraft, RemoteMessage, UrgencyLevel};
    use chrono::TimeZone;

    fn remote(external_id: &str, folder: Folder, minute: u32) -> RemoteMessage {
        RemoteMessage {
            external_id: external_id.to_string(),
            thread_id: Some(format!("t-{}", external_id)),
            subject: format!("Subject {}", external_id),
            from: "Alice <alice@example.com>".to_string(),
            to: vec!["me@example.com".to_string()],
            cc: vec![],
            bcc: vec![],
            body_text: "Hello".to_string(),
            body_html: None,
            snippet: Some("Hello".to_string()),
            received_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, minute, 0).unwrap(),
            folder,
            labels: vec!["INBOX".to_string(), "UNREAD".to_string()],
            has_attachments: false,
            is_read: false,
            is_starred: false,
        }
    }

    async fn setup() -> (Database, User) {
        let db = Database::in_memory().await.unwrap();
        let user = db.create_user("me@example.com").await.unwrap();
        (db, user)
    }

    #[tokio::test]
    async fn test_insert_if_absent_dedups_per_owner() {
        let (db, user) = setup().await;
        let other = db.create_user("other@example.com").await.unwrap();

        let first = Message::from_remote(&user.id, "me@example.com", remote("x1", Folder::Inbox, 0));
        let again = Message::from_remote(&user.id, "me@example.com", remote("x1", Folder::Inbox, 0));
        let foreign = Message::from_remote(&other.id, "o@example.com", remote("x1", Folder::Inbox, 0));

        assert!(db.insert_message_if_absent(&first).await.unwrap());
        assert!(!db.insert_message_if_absent(&again).await.unwrap());
        assert!(db.insert_message_if_absent(&foreign).await.unwrap());

        let stored = db.find_message_by_external_id(&user.id, "x1").await.unwrap().unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.to, vec!["me@example.com".to_string()]);
        assert_eq!(stored.labels.len(), 2);
        assert_eq!(stored.received_at, first.received_at);
        assert_eq!(stored.folder, Folder::Inbox);
        assert!(!stored.is_processed);
        assert_eq!(stored.is_junk, None);
    }

    #[tokio::test]
    async fn test_get_message_checks_owner() {
        let (db, user) = setup().await;
        let other = db.create_user("other@example.com").await.unwrap();
        let msg = Message::from_remote(&user.id, "me@example.com", remote("x1", Folder::Inbox, 0));
        db.insert_message_if_absent(&msg).await.unwrap();

        assert!(db.get_message(&msg.id, &user.id).await.unwrap().is_some());
        assert!(db.get_message(&msg.id, &other.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unprocessed_messages_are_inbox_newest_first() {
        let (db, user) = setup().await;
        for (id, folder, minute) in [
            ("old", Folder::Inbox, 1),
            ("new", Folder::Inbox, 30),
            ("spam", Folder::Junk, 45),
        ] {
            let msg = Message::from_remote(&user.id, "me@example.com", remote(id, folder, minute));
            db.insert_message_if_absent(&msg).await.unwrap();
        }

        let pending = db.unprocessed_messages(&user.id, 10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|m| m.external_id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);

        assert_eq!(db.unprocessed_messages(&user.id, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_processing_and_cascade() {
        let (db, user) = setup().await;
        let msg = Message::from_remote(&user.id, "me@example.com", remote("x1", Folder::Inbox, 0));
        db.insert_message_if_absent(&msg).await.unwrap();

        let analysis = EmailInsights {
            summary: "A summary".to_string(),
            urgency_level: UrgencyLevel::Critical,
            is_lead: true,
            is_job_offer: false,
            insights: vec![InsightDraft {
                kind: "deadline".to_string(),
                value: "Friday".to_string(),
                confidence: 0.8,
            }],
        };
        assert!(
            db.apply_processing(&msg.id, &analysis, Some("/uploads/audio/a.mp3"))
                .await
                .unwrap()
        );
        assert!(
            !db.apply_processing(&msg.id, &analysis, Some("/uploads/audio/b.mp3"))
                .await
                .unwrap()
        );

        let stored = db.get_message(&msg.id, &user.id).await.unwrap().unwrap();
        assert!(stored.is_processed);
        assert_eq!(stored.summary.as_deref(), Some("A summary"));
        assert_eq!(stored.urgency_level, Some(UrgencyLevel::Critical));
        assert_eq!(stored.audio_url.as_deref(), Some("/uploads/audio/a.mp3"));
        assert_eq!(db.insights_for_message(&msg.id).await.unwrap().len(), 1);

        assert!(db.delete_message(&msg.id, &user.id).await.unwrap());
        assert!(db.insights_for_message(&msg.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_connection_keeps_refresh_token() {
        let (db, user) = setup().await;
        let first = db
            .upsert_connection(&user.id, "gmail", "me@example.com", "enc-a1", Some("enc-r1"), None)
            .await
            .unwrap();
        let second = db
            .upsert_connection(&user.id, "gmail", "me@example.com", "enc-a2", None, None)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.encrypted_access_token, "enc-a2");
        assert_eq!(second.encrypted_refresh_token.as_deref(), Some("enc-r1"));
        assert_eq!(db.active_connections(&user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_connection_removes_its_messages() {
        let (db, user) = setup().await;
        let conn = db
            .upsert_connection(&user.id, "gmail", "me@example.com", "a", None, None)
            .await
            .unwrap();
        db.upsert_connection(&user.id, "gmail", "work@example.com", "b", None, None)
            .await
            .unwrap();

        let mine = Message::from_remote(&user.id, "me@example.com", remote("x1", Folder::Inbox, 0));
        let work = Message::from_remote(&user.id, "work@example.com", remote("x2", Folder::Inbox, 0));
        db.insert_message_if_absent(&mine).await.unwrap();
        db.insert_message_if_absent(&work).await.unwrap();
        db.insert_audio_object(&AudioObject {
            id: new_id(),
            owner_id: user.id.clone(),
            message_id: Some(mine.id.clone()),
            filename: "a.mp3".to_string(),
            url: "/uploads/audio/a.mp3".to_string(),
            size: 10,
            duration_seconds: None,
            mime_type: "audio/mpeg".to_string(),
        })
        .await
        .unwrap();

        let removed = db.delete_connection(&conn.id, &user.id).await.unwrap().unwrap();
        assert_eq!(removed.address, "me@example.com");
        assert_eq!(removed.audio_urls, vec!["/uploads/audio/a.mp3".to_string()]);

        assert!(db.get_message(&mine.id, &user.id).await.unwrap().is_none());
        assert!(db.get_message(&work.id, &user.id).await.unwrap().is_some());
        assert!(db.audio_for_owner(&user.id).await.unwrap().is_empty());
        assert!(db.delete_connection(&conn.id, &user.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_user_cascades() {
        let (db, user) = setup().await;
        let msg = Message::from_remote(&user.id, "me@example.com", remote("x1", Folder::Inbox, 0));
        db.insert_message_if_absent(&msg).await.unwrap();
        db.upsert_voice_profile(&VoiceProfile::defaults(&user.id)).await.unwrap();

        assert!(db.delete_user(&user.id).await.unwrap());
        assert!(db.find_message_by_external_id(&user.id, "x1").await.unwrap().is_none());
        assert!(db.voice_profile(&user.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_and_listing() {
        let (db, user) = setup().await;
        for (id, folder, minute) in [
            ("a", Folder::Inbox, 1),
            ("b", Folder::Inbox, 2),
            ("c", Folder::Inbox, 3),
            ("j", Folder::Junk, 4),
        ] {
            let msg = Message::from_remote(&user.id, "me@example.com", remote(id, folder, minute));
            db.insert_message_if_absent(&msg).await.unwrap();
        }
        let a = db.find_message_by_external_id(&user.id, "a").await.unwrap().unwrap();
        db.apply_processing(
            &a.id,
            &EmailInsights {
                urgency_level: UrgencyLevel::Critical,
                is_lead: true,
                ..EmailInsights::fallback()
            },
            None,
        )
        .await
        .unwrap();
        db.set_read(&a.id, &user.id, true).await.unwrap();

        let stats = db.stats(&user.id).await.unwrap();
        assert_eq!(
            stats,
            Stats {
                total_emails: 3,
                processed_emails: 1,
                unprocessed_emails: 2,
                critical_emails: 1,
                leads: 1,
                job_offers: 0,
                junk_to_review: 1,
                unread_emails: 2,
            }
        );

        let page = db.list_messages(&user.id, Folder::Inbox, 2, 2).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.pages, 2);
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].external_id, "a");

        let j = db.junk_for_review(&user.id).await.unwrap();
        assert_eq!(j.len(), 1);
        assert!(db.confirm_junk(&j[0].id, &user.id, true).await.unwrap());
        assert!(db.junk_for_review(&user.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_audio_object_checks_owner_and_clears_message() {
        let (db, user) = setup().await;
        let other = db.create_user("other@example.com").await.unwrap();
        let msg = Message::from_remote(&user.id, "me@example.com", remote("x1", Folder::Inbox, 0));
        db.insert_message_if_absent(&msg).await.unwrap();
        let audio = AudioObject {
            id: new_id(),
            owner_id: user.id.clone(),
            message_id: Some(msg.id.clone()),
            filename: "a.mp3".to_string(),
            url: "/uploads/audio/a.mp3".to_string(),
            size: 10,
            duration_seconds: None,
            mime_type: "audio/mpeg".to_string(),
        };
        db.insert_audio_object(&audio).await.unwrap();
        db.apply_processing(&msg.id, &EmailInsights::fallback(), Some(audio.url.as_str()))
            .await
            .unwrap();

        assert!(db.delete_audio_object(&audio.id, &other.id).await.unwrap().is_none());
        assert_eq!(
            db.audio_by_url(&user.id, &audio.url).await.unwrap().map(|a| a.id),
            Some(audio.id.clone())
        );

        let removed = db.delete_audio_object(&audio.id, &user.id).await.unwrap().unwrap();
        assert_eq!(removed.url, audio.url);
        assert!(db.get_audio_object(&audio.id, &user.id).await.unwrap().is_none());
        let stored = db.get_message(&msg.id, &user.id).await.unwrap().unwrap();
        assert_eq!(stored.audio_url, None);
        assert!(stored.is_processed);
    }

    #[tokio::test]
    async fn test_connections_include_inactive() {
        let (db, user) = setup().await;
        db.upsert_connection(&user.id, "gmail", "me@example.com", "a", None, None)
            .await
            .unwrap();
        let old = db
            .upsert_connection(&user.id, "gmail", "old@example.com", "b", None, None)
            .await
            .unwrap();
        sqlx::query("UPDATE mailbox_connections SET active = 0 WHERE id = ?")
            .bind(&old.id)
            .execute(&db.pool)
            .await
            .unwrap();

        assert_eq!(db.active_connections(&user.id).await.unwrap().len(), 1);
        let all = db.connections(&user.id).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|c| c.address == "old@example.com" && !c.active));
    }

    #[tokio::test]
    async fn test_list_messages_survives_extreme_paging() {
        let (db, user) = setup().await;
        let msg = Message::from_remote(&user.id, "me@example.com", remote("x1", Folder::Inbox, 0));
        db.insert_message_if_absent(&msg).await.unwrap();

        let far = db
            .list_messages(&user.id, Folder::Inbox, i64::MAX, i64::MAX)
            .await
            .unwrap();
        assert!(far.messages.is_empty());
        assert_eq!(far.total, 1);
        assert_eq!(far.limit, 100);
        assert_eq!(far.pages, 1);

        let first = db.list_messages(&user.id, Folder::Inbox, 0, 0).await.unwrap();
        assert_eq!(first.page, 1);
        assert_eq!(first.limit, 1);
        assert_eq!(first.messages.len(), 1);
    }
}
