//! SQLite implementation of [`ChatStore`].

use crate::error::{StoreError, StoreResult};
use crate::store::{ChatStore, NewMessage, NewUser, Page, UserRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_protocol::{
    Attachment, AttachmentKind, Chat, ChatId, ChatKind, Message, MessageBody, MessageId, UserId,
    UserSummary,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

macro_rules! message_select {
    () => {
        "SELECT m.id, m.chat_id, m.content, m.attachment_kind, m.attachment_url,
                m.attachment_name, m.attachment_size, m.attachment_mime, m.created_at,
                u.id AS sender_id, u.name AS sender_name, u.email AS sender_email,
                u.avatar AS sender_avatar,
                (SELECT GROUP_CONCAT(r.user_id) FROM message_reads r
                  WHERE r.message_id = m.id) AS read_by
         FROM messages m JOIN users u ON u.id = m.sender_id"
    };
}

macro_rules! chat_select {
    () => {
        "SELECT c.id, c.kind, c.name, c.avatar, c.last_message_id, c.message_count,
                c.created_at, c.updated_at
         FROM chats c"
    };
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: String,
    name: String,
    email: String,
    avatar: Option<String>,
    password_hash: String,
    created_at: i64,
}

impl UserRow {
    fn into_record(self) -> StoreResult<UserRecord> {
        Ok(UserRecord {
            summary: UserSummary {
                id: parse_id(&self.id)?,
                name: self.name,
                email: self.email,
                avatar: self.avatar,
            },
            password_hash: self.password_hash,
            created_at: from_millis(self.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: String,
    name: String,
    email: String,
    avatar: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ChatRow {
    id: String,
    kind: String,
    name: Option<String>,
    avatar: Option<String>,
    last_message_id: Option<String>,
    message_count: i64,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    chat_id: String,
    content: Option<String>,
    attachment_kind: Option<String>,
    attachment_url: Option<String>,
    attachment_name: Option<String>,
    attachment_size: Option<i64>,
    attachment_mime: Option<String>,
    created_at: i64,
    sender_id: String,
    sender_name: String,
    sender_email: String,
    sender_avatar: Option<String>,
    read_by: Option<String>,
}

impl MessageRow {
    fn into_message(self) -> StoreResult<Message> {
        let attachment = match (self.attachment_kind, self.attachment_url) {
            (Some(kind), Some(url)) => Some(Attachment {
                kind: AttachmentKind::parse(&kind)
                    .ok_or_else(|| StoreError::decode(format!("unknown attachment kind {kind}")))?,
                url,
                name: self.attachment_name.unwrap_or_default(),
                size: u64::try_from(self.attachment_size.unwrap_or(0)).unwrap_or(0),
                mime_type: self.attachment_mime.unwrap_or_default(),
            }),
            _ => None,
        };
        let body = MessageBody::from_parts(self.content, attachment)
            .map_err(|_| StoreError::decode(format!("message {} has no content", self.id)))?;

        let mut read_by = self
            .read_by
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .filter(|id| !id.is_empty())
            .map(parse_id)
            .collect::<StoreResult<Vec<_>>>()?;
        read_by.sort();

        Ok(Message {
            id: parse_id(&self.id)?,
            chat_id: parse_id(&self.chat_id)?,
            sender: UserSummary {
                id: parse_id(&self.sender_id)?,
                name: self.sender_name,
                email: self.sender_email,
                avatar: self.sender_avatar,
            },
            body,
            read_by,
            created_at: from_millis(self.created_at)?,
        })
    }
}

fn parse_id(value: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| StoreError::decode(format!("invalid id {value}: {e}")))
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::decode(format!("invalid timestamp {ms}")))
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Canonical key for the unordered pair `{a, b}`.
fn pair_key(a: UserId, b: UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}:{hi}")
}

async fn fetch_message<'e, E>(executor: E, id: &str) -> StoreResult<Option<Message>>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query_as::<_, MessageRow>(concat!(message_select!(), " WHERE m.id = ?"))
        .bind(id)
        .fetch_optional(executor)
        .await?;
    row.map(MessageRow::into_message).transpose()
}

/// [`ChatStore`] backed by a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the database cannot be opened,
    /// or a migration fails.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        info!(url = %url, "database connection established");
        Ok(store)
    }

    /// A private in-memory database, for tests and benches.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn in_memory() -> StoreResult<Self> {
        // Every pooled connection would get its own in-memory database.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. Migrations are not run.
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply pending migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        debug!("database migrations applied");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn user_exists(&self, id: UserId) -> StoreResult<bool> {
        let exists: i64 = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = ?)")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists != 0)
    }

    async fn chat_exists(&self, id: ChatId) -> StoreResult<bool> {
        let exists: i64 = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM chats WHERE id = ?)")
            .bind(id.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists != 0)
    }

    async fn participants(&self, chat: &str) -> StoreResult<Vec<UserSummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            "SELECT u.id, u.name, u.email, u.avatar
             FROM chat_participants p JOIN users u ON u.id = p.user_id
             WHERE p.chat_id = ?
             ORDER BY p.joined_at, u.id",
        )
        .bind(chat)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(UserSummary {
                    id: parse_id(&row.id)?,
                    name: row.name,
                    email: row.email,
                    avatar: row.avatar,
                })
            })
            .collect()
    }

    async fn load_chat(&self, row: ChatRow) -> StoreResult<Chat> {
        let kind = match row.kind.as_str() {
            "private" => ChatKind::Private,
            "group" => ChatKind::Group {
                name: row.name.unwrap_or_default(),
                avatar: row.avatar,
            },
            other => return Err(StoreError::decode(format!("unknown chat kind {other}"))),
        };

        let last_message = match row.last_message_id.as_deref() {
            Some(id) => fetch_message(&self.pool, id).await?.map(Box::new),
            None => None,
        };

        Ok(Chat {
            id: parse_id(&row.id)?,
            kind,
            participants: self.participants(&row.id).await?,
            last_message,
            message_count: row.message_count,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }

    async fn chat_by_id(&self, id: &str) -> StoreResult<Option<Chat>> {
        let row = sqlx::query_as::<_, ChatRow>(concat!(chat_select!(), " WHERE c.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.load_chat(row).await?)),
            None => Ok(None),
        }
    }

    async fn chat_by_pair(&self, key: &str) -> StoreResult<Option<Chat>> {
        let row = sqlx::query_as::<_, ChatRow>(concat!(chat_select!(), " WHERE c.pair_key = ?"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.load_chat(row).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_user(&self, user: NewUser) -> StoreResult<UserRecord> {
        let id = Uuid::new_v4();
        let email = normalize_email(&user.email);
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            "INSERT INTO users (id, email, name, password_hash, avatar, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&email)
        .bind(user.name.trim())
        .bind(&user.password_hash)
        .bind(&user.avatar)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StoreError::DuplicateEmail)
            }
            Err(e) => return Err(e.into()),
        }

        debug!(user = %id, "created user");
        self.find_user(id).await?.ok_or(StoreError::NotFound("User"))
    }

    async fn find_user(&self, id: UserId) -> StoreResult<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, name, email, avatar, password_hash, created_at FROM users WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserRow::into_record).transpose()
    }

    async fn find_user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, name, email, avatar, password_hash, created_at FROM users WHERE email = ?",
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;
        row.map(UserRow::into_record).transpose()
    }

    async fn chats_for_user(&self, user: UserId) -> StoreResult<Vec<Chat>> {
        let rows = sqlx::query_as::<_, ChatRow>(concat!(
            chat_select!(),
            " JOIN chat_participants p ON p.chat_id = c.id
              WHERE p.user_id = ?
              ORDER BY c.updated_at DESC, c.rowid DESC"
        ))
        .bind(user.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut chats = Vec::with_capacity(rows.len());
        for row in rows {
            chats.push(self.load_chat(row).await?);
        }
        Ok(chats)
    }

    async fn chat_ids_for_user(&self, user: UserId) -> StoreResult<Vec<ChatId>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT chat_id FROM chat_participants WHERE user_id = ?")
                .bind(user.to_string())
                .fetch_all(&self.pool)
                .await?;
        ids.iter().map(|id| parse_id(id)).collect()
    }

    async fn find_chat(&self, chat: ChatId, viewer: UserId) -> StoreResult<Chat> {
        if !self.is_participant(chat, viewer).await? {
            return Err(StoreError::NotFound("Chat"));
        }
        self.chat_by_id(&chat.to_string())
            .await?
            .ok_or(StoreError::NotFound("Chat"))
    }

    async fn is_participant(&self, chat: ChatId, user: UserId) -> StoreResult<bool> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM chat_participants WHERE chat_id = ? AND user_id = ?)",
        )
        .bind(chat.to_string())
        .bind(user.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists != 0)
    }

    async fn create_private_chat(&self, a: UserId, b: UserId) -> StoreResult<(Chat, bool)> {
        if a == b {
            return Err(StoreError::invalid("Cannot create a chat with yourself"));
        }
        if !self.user_exists(a).await? || !self.user_exists(b).await? {
            return Err(StoreError::NotFound("User"));
        }

        let key = pair_key(a, b);
        if let Some(chat) = self.chat_by_pair(&key).await? {
            return Ok((chat, false));
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO chats (id, kind, pair_key, message_count, created_at, updated_at)
             VALUES (?, 'private', ?, 0, ?, ?)
             ON CONFLICT(pair_key) DO NOTHING",
        )
        .bind(&id)
        .bind(&key)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let created = inserted.rows_affected() == 1;
        if created {
            for user in [a, b] {
                sqlx::query(
                    "INSERT INTO chat_participants (chat_id, user_id, joined_at) VALUES (?, ?, ?)",
                )
                .bind(&id)
                .bind(user.to_string())
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;

        if created {
            debug!(chat = %id, "created private chat");
        } else {
            debug!(pair = %key, "private chat created concurrently, using existing");
        }

        let chat = self
            .chat_by_pair(&key)
            .await?
            .ok_or(StoreError::NotFound("Chat"))?;
        Ok((chat, created))
    }

    async fn create_group_chat(
        &self,
        creator: UserId,
        name: &str,
        participants: &[UserId],
    ) -> StoreResult<Chat> {
        let name = name.trim();
        if name.chars().count() < 2 {
            return Err(StoreError::invalid(
                "Group name must be at least 2 characters",
            ));
        }

        let mut members: Vec<UserId> = Vec::with_capacity(participants.len() + 1);
        for id in participants {
            if !members.contains(id) {
                members.push(*id);
            }
        }
        if members.len() < 2 {
            return Err(StoreError::invalid(
                "Group chat must have at least 2 participants",
            ));
        }
        if !members.contains(&creator) {
            members.insert(0, creator);
        }
        for id in &members {
            if !self.user_exists(*id).await? {
                return Err(StoreError::NotFound("User"));
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO chats (id, kind, name, message_count, created_at, updated_at)
             VALUES (?, 'group', ?, 0, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for user in &members {
            sqlx::query(
                "INSERT INTO chat_participants (chat_id, user_id, joined_at) VALUES (?, ?, ?)",
            )
            .bind(&id)
            .bind(user.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(chat = %id, members = members.len(), "created group chat");
        self.chat_by_id(&id).await?.ok_or(StoreError::NotFound("Chat"))
    }

    async fn insert_message(&self, message: NewMessage) -> StoreResult<Message> {
        let id = Uuid::new_v4().to_string();
        let chat_id = message.chat_id.to_string();
        let sender_id = message.sender_id.to_string();
        let now = Utc::now().timestamp_millis();
        let attachment = message.body.attachment();

        let mut tx = self.pool.begin().await?;

        // Write first so the transaction takes the write lock up front.
        let inserted = sqlx::query(
            "INSERT INTO messages (id, chat_id, sender_id, content, attachment_kind,
                                   attachment_url, attachment_name, attachment_size,
                                   attachment_mime, created_at)
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
             WHERE EXISTS (SELECT 1 FROM chat_participants WHERE chat_id = ? AND user_id = ?)",
        )
        .bind(&id)
        .bind(&chat_id)
        .bind(&sender_id)
        .bind(message.body.content())
        .bind(attachment.map(|a| a.kind.as_str()))
        .bind(attachment.map(|a| a.url.as_str()))
        .bind(attachment.map(|a| a.name.as_str()))
        .bind(attachment.map(|a| i64::try_from(a.size).unwrap_or(i64::MAX)))
        .bind(attachment.map(|a| a.mime_type.as_str()))
        .bind(now)
        .bind(&chat_id)
        .bind(&sender_id)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(if self.chat_exists(message.chat_id).await? {
                StoreError::NotParticipant
            } else {
                StoreError::NotFound("Chat")
            });
        }

        sqlx::query(
            "UPDATE chats
             SET last_message_id = ?, message_count = message_count + 1, updated_at = ?
             WHERE id = ?",
        )
        .bind(&id)
        .bind(now)
        .bind(&chat_id)
        .execute(&mut *tx)
        .await?;

        let stored = fetch_message(&mut *tx, &id)
            .await?
            .ok_or(StoreError::NotFound("Message"))?;
        tx.commit().await?;

        debug!(message = %id, chat = %chat_id, "persisted message");
        Ok(stored)
    }

    async fn list_messages(
        &self,
        chat: ChatId,
        viewer: UserId,
        page: Page,
    ) -> StoreResult<Vec<Message>> {
        if !self.is_participant(chat, viewer).await? {
            return Err(StoreError::NotFound("Chat"));
        }

        let rows = sqlx::query_as::<_, MessageRow>(concat!(
            message_select!(),
            " WHERE m.chat_id = ? ORDER BY m.seq DESC LIMIT ? OFFSET ?"
        ))
        .bind(chat.to_string())
        .bind(i64::from(page.limit))
        .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }

    async fn find_message(&self, id: MessageId) -> StoreResult<Option<Message>> {
        fetch_message(&self.pool, &id.to_string()).await
    }

    async fn delete_message(&self, id: MessageId, requester: UserId) -> StoreResult<ChatId> {
        let id = id.to_string();
        let requester = requester.to_string();

        let found: Option<(String, String)> =
            sqlx::query_as("SELECT chat_id, sender_id FROM messages WHERE id = ?")
                .bind(&id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((chat_id, sender_id)) = found else {
            return Err(StoreError::NotFound("Message"));
        };
        if sender_id != requester {
            return Err(StoreError::NotOwner);
        }

        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query("DELETE FROM messages WHERE id = ? AND sender_id = ?")
            .bind(&id)
            .bind(&requester)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::NotFound("Message"));
        }

        sqlx::query(
            "UPDATE chats
             SET message_count = MAX(message_count - 1, 0),
                 last_message_id = (SELECT id FROM messages WHERE chat_id = ?
                                    ORDER BY seq DESC LIMIT 1)
             WHERE id = ?",
        )
        .bind(&chat_id)
        .bind(&chat_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(message = %id, chat = %chat_id, "deleted message");
        parse_id(&chat_id)
    }

    async fn mark_read(&self, id: MessageId, user: UserId) -> StoreResult<Message> {
        let message = self
            .find_message(id)
            .await?
            .ok_or(StoreError::NotFound("Message"))?;
        if !self.is_participant(message.chat_id, user).await? {
            return Err(StoreError::NotParticipant);
        }
        if message.read_by.contains(&user) {
            return Ok(message);
        }

        sqlx::query(
            "INSERT INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?)
             ON CONFLICT(message_id, user_id) DO NOTHING",
        )
        .bind(id.to_string())
        .bind(user.to_string())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        self.find_message(id)
            .await?
            .ok_or(StoreError::NotFound("Message"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_key_is_order_independent() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_eq!(pair_key(a, b), pair_key(b, a));
        assert_ne!(pair_key(a, b), pair_key(a, Uuid::new_v4()));
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Alice@Example.COM "), "alice@example.com");
    }

    #[tokio::test]
    async fn test_foreign_keys_enabled() {
        let store = SqliteStore::in_memory().await.unwrap();
        let enabled: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(enabled, 1);
    }
}
