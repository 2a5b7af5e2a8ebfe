use async_trait::async_trait;
use chatdesk_core::types::{
    Contact, Conversation, ConversationStatus, DeliveryStatus, Message,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Display name given to contacts first seen without a profile name.
pub const UNKNOWN_CONTACT_NAME: &str = "Unknown";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Result of inserting a message keyed by its external id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same id already exists; nothing was written.
    AlreadyRecorded,
}

/// Durable storage for contacts, conversations and messages.
///
/// Each call is independent; no transaction spans two calls.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Insert the contact for `phone`, or refresh its name when one is given.
    async fn upsert_contact(&self, phone: &str, name: Option<&str>) -> Result<Contact, StoreError>;

    async fn find_contact_by_phone(&self, phone: &str) -> Result<Option<Contact>, StoreError>;

    /// Most recently updated conversation for the contact.
    async fn latest_conversation(&self, contact_id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn create_conversation(
        &self,
        contact_id: &str,
        status: ConversationStatus,
        bot_enabled: bool,
    ) -> Result<Conversation, StoreError>;

    /// Set the status; with `touch` also move `last_message_at` to now.
    async fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
        touch: bool,
    ) -> Result<Option<Conversation>, StoreError>;

    async fn count_conversations(&self, contact_id: &str) -> Result<i64, StoreError>;

    async fn insert_message(&self, message: &Message) -> Result<InsertOutcome, StoreError>;

    /// Returns `None` when no message has this id.
    async fn update_message_status(
        &self,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Result<Option<Message>, StoreError>;

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError>;

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;
}

type ContactRow = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

type ConversationRow = (
    String,
    String,
    String,
    bool,
    DateTime<Utc>,
    DateTime<Utc>,
    DateTime<Utc>,
);

type MessageRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    DateTime<Utc>,
);

const CONTACT_COLUMNS: &str =
    "id, phone, name, interest_status, notes, custom_attributes, created_at, updated_at";
const CONVERSATION_COLUMNS: &str =
    "id, contact_id, status, bot_enabled, last_message_at, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, conversation_id, direction, content, type, status, media_ref, timestamp";

fn parse_column<T: FromStr>(column: &str, raw: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| StoreError::Corrupt(format!("{column}: {e}")))
}

fn contact_from_row(row: ContactRow) -> Result<Contact, StoreError> {
    let (id, phone, name, interest_status, notes, attrs, created_at, updated_at) = row;
    let custom_attributes = serde_json::from_str(&attrs)
        .map_err(|e| StoreError::Corrupt(format!("custom_attributes: {e}")))?;
    Ok(Contact {
        id,
        phone,
        name,
        interest_status,
        notes,
        custom_attributes,
        created_at,
        updated_at,
    })
}

fn conversation_from_row(row: ConversationRow) -> Result<Conversation, StoreError> {
    let (id, contact_id, status, bot_enabled, last_message_at, created_at, updated_at) = row;
    Ok(Conversation {
        id,
        contact_id,
        status: parse_column("conversations.status", &status)?,
        bot_enabled,
        last_message_at,
        created_at,
        updated_at,
    })
}

fn message_from_row(row: MessageRow) -> Result<Message, StoreError> {
    let (id, conversation_id, direction, content, kind, status, media_ref, timestamp) = row;
    Ok(Message {
        id,
        conversation_id,
        direction: parse_column("messages.direction", &direction)?,
        content,
        kind: parse_column("messages.type", &kind)?,
        status: parse_column("messages.status", &status)?,
        media_ref,
        timestamp,
    })
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database on a single connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("SqliteStore initialized");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    #[instrument(skip(self))]
    async fn upsert_contact(&self, phone: &str, name: Option<&str>) -> Result<Contact, StoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO contacts (id, phone, name, interest_status, custom_attributes, created_at, updated_at)
            VALUES (?, ?, ?, 'new', '{}', ?, ?)
            ON CONFLICT(phone) DO UPDATE SET
                name = COALESCE(?, contacts.name),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(phone)
        .bind(name.unwrap_or(UNKNOWN_CONTACT_NAME))
        .bind(now)
        .bind(now)
        .bind(name)
        .execute(&self.pool)
        .await?;

        self.find_contact_by_phone(phone)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("contact {phone} vanished after upsert")))
    }

    #[instrument(skip(self))]
    async fn find_contact_by_phone(&self, phone: &str) -> Result<Option<Contact>, StoreError> {
        let row: Option<ContactRow> = sqlx::query_as(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE phone = ?"
        ))
        .bind(phone)
        .fetch_optional(&self.pool)
        .await?;

        row.map(contact_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn latest_conversation(&self, contact_id: &str) -> Result<Option<Conversation>, StoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {CONVERSATION_COLUMNS}
            FROM conversations
            WHERE contact_id = ?
            ORDER BY updated_at DESC, rowid DESC
            LIMIT 1
            "#
        ))
        .bind(contact_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn create_conversation(
        &self,
        contact_id: &str,
        status: ConversationStatus,
        bot_enabled: bool,
    ) -> Result<Conversation, StoreError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            contact_id: contact_id.to_string(),
            status,
            bot_enabled,
            last_message_at: now,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO conversations (id, contact_id, status, bot_enabled, last_message_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&conversation.id)
        .bind(&conversation.contact_id)
        .bind(conversation.status.as_str())
        .bind(conversation.bot_enabled)
        .bind(conversation.last_message_at)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(conversation)
    }

    #[instrument(skip(self))]
    async fn set_conversation_status(
        &self,
        conversation_id: &str,
        status: ConversationStatus,
        touch: bool,
    ) -> Result<Option<Conversation>, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET status = ?,
                last_message_at = CASE WHEN ? THEN ? ELSE last_message_at END,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(touch)
        .bind(now)
        .bind(now)
        .bind(conversation_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.fetch_conversation(conversation_id).await
    }

    async fn count_conversations(&self, contact_id: &str) -> Result<i64, StoreError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM conversations WHERE contact_id = ?")
                .bind(contact_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    #[instrument(skip(self, message), fields(message_id = %message.id))]
    async fn insert_message(&self, message: &Message) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO messages (id, conversation_id, direction, content, type, status, media_ref, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.direction.as_str())
        .bind(&message.content)
        .bind(message.kind.as_str())
        .bind(message.status.as_str())
        .bind(&message.media_ref)
        .bind(message.timestamp)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!("message already recorded");
            Ok(InsertOutcome::AlreadyRecorded)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    #[instrument(skip(self))]
    async fn update_message_status(
        &self,
        message_id: &str,
        status: DeliveryStatus,
    ) -> Result<Option<Message>, StoreError> {
        let result = sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(message_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_message(message_id).await
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let row: Option<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(message_from_row).transpose()
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE conversation_id = ?
            ORDER BY timestamp ASC, rowid ASC
            "#
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }
}
