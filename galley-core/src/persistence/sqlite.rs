//! SQLite-backed chat store
//!
//! rusqlite is synchronous, so every operation checks a connection out of the
//! r2d2 pool inside `spawn_blocking`.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::error::{StoreError, StoreResult};
use super::models::{
    Channel, ChannelMember, ChannelRole, Message, MessageView, NewChannel, NewMessage, Reaction,
    ReactionAction, ReplySummary, UserSummary,
};
use super::{migrations, ChatStore};
use crate::config::StoreConfig;
use crate::identity::{Identity, IdentityResolver, TenantMembership};
use crate::types::{ChannelId, MessageId, TenantId, Timestamp, UserId};

fn millis(ts: Timestamp) -> i64 {
    ts.as_millis() as i64
}

fn timestamp(raw: i64) -> Timestamp {
    Timestamp::from_millis(raw.max(0) as u64)
}

/// Session tokens are stored as BLAKE3 digests
pub(crate) fn token_hash(token: &str) -> String {
    hex::encode(blake3::hash(token.as_bytes()).as_bytes())
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Wrap an existing pool and bring its schema up to date
    pub fn new(pool: Pool<SqliteConnectionManager>) -> StoreResult<Self> {
        migrations::migrate(&pool)?;
        Ok(Self { pool })
    }

    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path)
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(pool_size.max(1)).build(manager)?;

        debug!(path = %path.display(), pool_size, "Opened SQLite store");
        Self::new(pool)
    }

    pub fn from_config(config: &StoreConfig) -> StoreResult<Self> {
        Self::open(&config.database_path, config.pool_size)
    }

    /// Private in-memory database. A single pooled connection keeps every
    /// checkout on the same database.
    pub fn in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;
        Self::new(pool)
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }

    // ===== Seeding =====
    //
    // Tenants, users and sessions are owned by other subsystems in
    // production. These helpers exist for the CLI and tests.

    pub async fn create_tenant(&self, name: &str) -> StoreResult<TenantId> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let id = TenantId::generate();
            conn.execute(
                "INSERT INTO tenants (id, name, created_at) VALUES (?, ?, ?)",
                params![id.as_str(), name, millis(Timestamp::now())],
            )?;
            Ok(id)
        })
        .await
    }

    pub async fn create_user(&self, email: &str, display_name: &str) -> StoreResult<UserId> {
        let (email, display_name) = (email.to_string(), display_name.to_string());
        self.with_conn(move |conn| {
            let id = UserId::generate();
            conn.execute(
                "INSERT INTO users (id, email, display_name, created_at) VALUES (?, ?, ?, ?)",
                params![id.as_str(), email, display_name, millis(Timestamp::now())],
            )?;
            Ok(id)
        })
        .await
    }

    pub async fn add_tenant_membership(
        &self,
        tenant: &TenantId,
        user: &UserId,
        role: &str,
        active: bool,
    ) -> StoreResult<()> {
        let (tenant, user, role) = (tenant.clone(), user.clone(), role.to_string());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tenant_memberships (tenant_id, user_id, role, active, joined_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![tenant.as_str(), user.as_str(), role, active, millis(Timestamp::now())],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn add_channel_member(
        &self,
        channel: &ChannelId,
        user: &UserId,
        role: ChannelRole,
    ) -> StoreResult<()> {
        let (channel, user) = (channel.clone(), user.clone());
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO channel_members (channel_id, user_id, role, joined_at)
                 VALUES (?, ?, ?, ?)",
                params![channel.as_str(), user.as_str(), role.as_str(), millis(Timestamp::now())],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn remove_channel_member(&self, channel: &ChannelId, user: &UserId) -> StoreResult<bool> {
        let (channel, user) = (channel.clone(), user.clone());
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM channel_members WHERE channel_id = ? AND user_id = ?",
                params![channel.as_str(), user.as_str()],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    /// Issue a session token for `user`. Only its hash is persisted.
    pub async fn issue_session(&self, user: &UserId, ttl: Option<Duration>) -> StoreResult<String> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let token = uuid::Uuid::new_v4().simple().to_string();
            let now = Timestamp::now();
            let expires_at = ttl.map(|ttl| millis(now) + ttl.as_millis() as i64);
            conn.execute(
                "INSERT INTO sessions (token_hash, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
                params![token_hash(&token), user.as_str(), millis(now), expires_at],
            )?;
            Ok(token)
        })
        .await
    }

    pub async fn revoke_session(&self, token: &str) -> StoreResult<bool> {
        let hash = token_hash(token);
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM sessions WHERE token_hash = ?", params![hash])? > 0)
        })
        .await
    }
}

fn load_message(conn: &Connection, id: &MessageId, tenant: Option<&TenantId>) -> StoreResult<Option<Message>> {
    let row = conn
        .query_row(
            "SELECT m.id, m.channel_id, m.author_id, m.content, m.reply_to_id, m.edited_at, m.created_at
             FROM messages m JOIN channels c ON c.id = m.channel_id
             WHERE m.id = ?1 AND (?2 IS NULL OR c.tenant_id = ?2)",
            params![id.as_str(), tenant.map(|t| t.as_str())],
            |row| {
                Ok(Message {
                    id: MessageId::new(row.get::<_, String>(0)?),
                    channel_id: ChannelId::new(row.get::<_, String>(1)?),
                    author_id: UserId::new(row.get::<_, String>(2)?),
                    content: row.get(3)?,
                    reply_to_id: row.get::<_, Option<String>>(4)?.map(MessageId::new),
                    edited_at: row.get::<_, Option<i64>>(5)?.map(timestamp),
                    created_at: timestamp(row.get(6)?),
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn load_user(conn: &Connection, id: &UserId) -> StoreResult<UserSummary> {
    conn.query_row(
        "SELECT id, display_name, email FROM users WHERE id = ?",
        params![id.as_str()],
        |row| {
            Ok(UserSummary {
                id: UserId::new(row.get::<_, String>(0)?),
                display_name: row.get(1)?,
                email: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| StoreError::Corrupt(format!("message author {} has no user row", id)))
}

/// Build the wire view of a message: author, reply target and reactions
fn load_view(conn: &Connection, id: &MessageId) -> StoreResult<Option<MessageView>> {
    let Some(message) = load_message(conn, id, None)? else {
        return Ok(None);
    };

    let author = load_user(conn, &message.author_id)?;

    let reply_to = match &message.reply_to_id {
        Some(reply_id) => load_message(conn, reply_id, None)?.map(|parent| ReplySummary {
            id: parent.id,
            author_id: parent.author_id,
            content: parent.content,
        }),
        None => None,
    };

    let mut stmt = conn.prepare(
        "SELECT user_id, emoji, created_at FROM reactions
         WHERE message_id = ? ORDER BY created_at, user_id, emoji",
    )?;
    let reactions = stmt
        .query_map(params![id.as_str()], |row| {
            Ok(Reaction {
                user_id: UserId::new(row.get::<_, String>(0)?),
                emoji: row.get(1)?,
                created_at: timestamp(row.get(2)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(MessageView {
        id: message.id,
        channel_id: message.channel_id,
        author,
        content: message.content,
        reply_to,
        reactions,
        edited_at: message.edited_at,
        created_at: message.created_at,
    }))
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn is_channel_member(
        &self,
        tenant: &TenantId,
        channel: &ChannelId,
        user: &UserId,
    ) -> StoreResult<bool> {
        let (tenant, channel, user) = (tenant.clone(), channel.clone(), user.clone());
        self.with_conn(move |conn| {
            let member: bool = conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM channel_members cm JOIN channels c ON c.id = cm.channel_id
                    WHERE cm.channel_id = ? AND cm.user_id = ? AND c.tenant_id = ?
                 )",
                params![channel.as_str(), user.as_str(), tenant.as_str()],
                |row| row.get(0),
            )?;
            Ok(member)
        })
        .await
    }

    async fn create_channel(&self, new: NewChannel) -> StoreResult<Channel> {
        self.with_conn(move |conn| {
            let now = Timestamp::now();
            let channel = Channel {
                id: ChannelId::generate(),
                tenant_id: new.tenant_id,
                name: new.name,
                description: new.description,
                is_private: new.is_private,
                created_by: new.creator,
                created_at: now,
                last_activity_at: now,
            };

            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO channels (id, tenant_id, name, description, is_private, created_by, created_at, last_activity_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    channel.id.as_str(),
                    channel.tenant_id.as_str(),
                    &channel.name,
                    &channel.description,
                    channel.is_private,
                    channel.created_by.as_str(),
                    millis(now),
                    millis(now),
                ],
            )?;
            tx.execute(
                "INSERT INTO channel_members (channel_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)",
                params![
                    channel.id.as_str(),
                    channel.created_by.as_str(),
                    ChannelRole::Owner.as_str(),
                    millis(now),
                ],
            )?;
            tx.commit()?;

            Ok(channel)
        })
        .await
    }

    async fn channel_members(&self, channel: &ChannelId) -> StoreResult<Vec<ChannelMember>> {
        let channel = channel.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, role, joined_at FROM channel_members
                 WHERE channel_id = ? ORDER BY joined_at, user_id",
            )?;
            let rows = stmt
                .query_map(params![channel.as_str()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(user, role, joined_at)| {
                    Ok(ChannelMember {
                        channel_id: channel.clone(),
                        user_id: UserId::new(user),
                        role: ChannelRole::from_str(&role).map_err(StoreError::Corrupt)?,
                        joined_at: timestamp(joined_at),
                    })
                })
                .collect()
        })
        .await
    }

    async fn get_message(&self, tenant: &TenantId, message: &MessageId) -> StoreResult<Option<Message>> {
        let (tenant, message) = (tenant.clone(), message.clone());
        self.with_conn(move |conn| load_message(conn, &message, Some(&tenant))).await
    }

    async fn insert_message(&self, new: NewMessage) -> StoreResult<MessageView> {
        self.with_conn(move |conn| {
            let id = MessageId::generate();
            conn.execute(
                "INSERT INTO messages (id, channel_id, author_id, content, reply_to_id, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    id.as_str(),
                    new.channel_id.as_str(),
                    new.author_id.as_str(),
                    &new.content,
                    new.reply_to_id.as_ref().map(|r| r.as_str()),
                    millis(Timestamp::now()),
                ],
            )?;
            load_view(conn, &id)?
                .ok_or_else(|| StoreError::Corrupt(format!("message {} vanished after insert", id)))
        })
        .await
    }

    async fn update_message_content(
        &self,
        message: &MessageId,
        content: &str,
        edited_at: Timestamp,
    ) -> StoreResult<Option<MessageView>> {
        let (message, content) = (message.clone(), content.to_string());
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE messages SET content = ?, edited_at = ? WHERE id = ?",
                params![content, millis(edited_at), message.as_str()],
            )?;
            if updated == 0 {
                return Ok(None);
            }
            load_view(conn, &message)
        })
        .await
    }

    async fn delete_message(&self, message: &MessageId) -> StoreResult<bool> {
        let message = message.clone();
        self.with_conn(move |conn| {
            Ok(conn.execute("DELETE FROM messages WHERE id = ?", params![message.as_str()])? > 0)
        })
        .await
    }

    async fn toggle_reaction(
        &self,
        message: &MessageId,
        user: &UserId,
        emoji: &str,
    ) -> StoreResult<ReactionAction> {
        let (message, user, emoji) = (message.clone(), user.clone(), emoji.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let exists = tx
                .query_row("SELECT 1 FROM messages WHERE id = ?", params![message.as_str()], |_| Ok(()))
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::Missing(format!("message {}", message)));
            }
            let removed = tx.execute(
                "DELETE FROM reactions WHERE message_id = ? AND user_id = ? AND emoji = ?",
                params![message.as_str(), user.as_str(), &emoji],
            )?;
            let action = if removed > 0 {
                ReactionAction::Remove
            } else {
                tx.execute(
                    "INSERT INTO reactions (message_id, user_id, emoji, created_at) VALUES (?, ?, ?, ?)",
                    params![message.as_str(), user.as_str(), &emoji, millis(Timestamp::now())],
                )?;
                ReactionAction::Add
            };
            tx.commit()?;
            Ok(action)
        })
        .await
    }

    async fn touch_channel(&self, channel: &ChannelId, at: Timestamp) -> StoreResult<()> {
        let channel = channel.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE channels SET last_activity_at = ? WHERE id = ?",
                params![millis(at), channel.as_str()],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl IdentityResolver for SqliteStore {
    async fn resolve_session(&self, token: &str) -> StoreResult<Option<Identity>> {
        let hash = token_hash(token);
        self.with_conn(move |conn| {
            let identity = conn
                .query_row(
                    "SELECT u.id, u.email, u.display_name
                     FROM sessions s JOIN users u ON u.id = s.user_id
                     WHERE s.token_hash = ? AND (s.expires_at IS NULL OR s.expires_at > ?)",
                    params![hash, millis(Timestamp::now())],
                    |row| {
                        Ok(Identity {
                            user_id: UserId::new(row.get::<_, String>(0)?),
                            email: row.get(1)?,
                            display_name: row.get(2)?,
                        })
                    },
                )
                .optional()?;
            Ok(identity)
        })
        .await
    }

    async fn memberships(&self, user: &UserId) -> StoreResult<Vec<TenantMembership>> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT tenant_id, role, active, joined_at FROM tenant_memberships
                 WHERE user_id = ? ORDER BY joined_at",
            )?;
            let memberships = stmt
                .query_map(params![user.as_str()], |row| {
                    Ok(TenantMembership {
                        tenant_id: TenantId::new(row.get::<_, String>(0)?),
                        role: row.get(1)?,
                        active: row.get(2)?,
                        joined_at: timestamp(row.get(3)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(memberships)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Seeded {
        store: SqliteStore,
        tenant: TenantId,
        alice: UserId,
        bob: UserId,
    }

    async fn seeded() -> Seeded {
        let store = SqliteStore::in_memory().unwrap();
        let tenant = store.create_tenant("Acme").await.unwrap();
        let alice = store.create_user("alice@acme.test", "Alice").await.unwrap();
        let bob = store.create_user("bob@acme.test", "Bob").await.unwrap();
        store.add_tenant_membership(&tenant, &alice, "staff", true).await.unwrap();
        store.add_tenant_membership(&tenant, &bob, "staff", true).await.unwrap();
        Seeded { store, tenant, alice, bob }
    }

    fn new_channel(tenant: &TenantId, creator: &UserId, name: &str) -> NewChannel {
        NewChannel {
            tenant_id: tenant.clone(),
            name: name.to_string(),
            description: None,
            is_private: false,
            creator: creator.clone(),
        }
    }

    #[tokio::test]
    async fn test_create_channel_persists_single_owner() {
        let s = seeded().await;
        let channel = s.store.create_channel(new_channel(&s.tenant, &s.alice, "general")).await.unwrap();

        let members = s.store.channel_members(&channel.id).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id, s.alice);
        assert_eq!(members[0].role, ChannelRole::Owner);
        assert!(s.store.is_channel_member(&s.tenant, &channel.id, &s.alice).await.unwrap());
        assert!(!s.store.is_channel_member(&s.tenant, &channel.id, &s.bob).await.unwrap());
    }

    #[tokio::test]
    async fn test_membership_is_scoped_to_tenant() {
        let s = seeded().await;
        let other = s.store.create_tenant("Globex").await.unwrap();
        let channel = s.store.create_channel(new_channel(&s.tenant, &s.alice, "general")).await.unwrap();

        assert!(!s.store.is_channel_member(&other, &channel.id, &s.alice).await.unwrap());
    }

    #[tokio::test]
    async fn test_message_lifecycle() {
        let s = seeded().await;
        let channel = s.store.create_channel(new_channel(&s.tenant, &s.alice, "general")).await.unwrap();

        let first = s
            .store
            .insert_message(NewMessage {
                channel_id: channel.id.clone(),
                author_id: s.alice.clone(),
                content: "hello".to_string(),
                reply_to_id: None,
            })
            .await
            .unwrap();
        assert_eq!(first.author.display_name, "Alice");
        assert!(first.reply_to.is_none());

        let reply = s
            .store
            .insert_message(NewMessage {
                channel_id: channel.id.clone(),
                author_id: s.alice.clone(),
                content: "again".to_string(),
                reply_to_id: Some(first.id.clone()),
            })
            .await
            .unwrap();
        assert_eq!(reply.reply_to.as_ref().unwrap().content, "hello");

        let edited = s
            .store
            .update_message_content(&first.id, "hello there", Timestamp::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(edited.content, "hello there");
        assert!(edited.edited_at.is_some());

        assert!(s.store.delete_message(&first.id).await.unwrap());
        assert!(!s.store.delete_message(&first.id).await.unwrap());
        assert!(s.store.get_message(&s.tenant, &first.id).await.unwrap().is_none());

        // Deleting the parent detaches the reply
        let orphan = s.store.get_message(&s.tenant, &reply.id).await.unwrap().unwrap();
        assert!(orphan.reply_to_id.is_none());
    }

    #[tokio::test]
    async fn test_get_message_hidden_from_other_tenant() {
        let s = seeded().await;
        let other = s.store.create_tenant("Globex").await.unwrap();
        let channel = s.store.create_channel(new_channel(&s.tenant, &s.alice, "general")).await.unwrap();
        let message = s
            .store
            .insert_message(NewMessage {
                channel_id: channel.id,
                author_id: s.alice.clone(),
                content: "secret".to_string(),
                reply_to_id: None,
            })
            .await
            .unwrap();

        assert!(s.store.get_message(&other, &message.id).await.unwrap().is_none());
        assert!(s.store.get_message(&s.tenant, &message.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_toggle_reaction_twice_leaves_no_row() {
        let s = seeded().await;
        let channel = s.store.create_channel(new_channel(&s.tenant, &s.alice, "general")).await.unwrap();
        let message = s
            .store
            .insert_message(NewMessage {
                channel_id: channel.id,
                author_id: s.alice.clone(),
                content: "react to me".to_string(),
                reply_to_id: None,
            })
            .await
            .unwrap();

        let first = s.store.toggle_reaction(&message.id, &s.bob, ":+1:").await.unwrap();
        let second = s.store.toggle_reaction(&message.id, &s.bob, ":+1:").await.unwrap();
        assert_eq!(first, ReactionAction::Add);
        assert_eq!(second, ReactionAction::Remove);

        let store = s.store.clone();
        let id = message.id.clone();
        let view = store.with_conn(move |conn| load_view(conn, &id)).await.unwrap().unwrap();
        assert!(view.reactions.is_empty());

        assert!(s.store.delete_message(&message.id).await.unwrap());
        let gone = s.store.toggle_reaction(&message.id, &s.bob, ":+1:").await;
        assert!(matches!(gone, Err(StoreError::Missing(_))));
    }

    #[tokio::test]
    async fn test_sessions_resolve_by_hash() {
        let s = seeded().await;
        let token = s.store.issue_session(&s.alice, None).await.unwrap();

        let identity = s.store.resolve_session(&token).await.unwrap().unwrap();
        assert_eq!(identity.user_id, s.alice);
        assert!(s.store.resolve_session("not-a-token").await.unwrap().is_none());

        assert!(s.store.revoke_session(&token).await.unwrap());
        assert!(s.store.resolve_session(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_session_is_rejected() {
        let s = seeded().await;
        let token = s.store.issue_session(&s.alice, Some(Duration::ZERO)).await.unwrap();
        assert!(s.store.resolve_session(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memberships_oldest_first() {
        let s = seeded().await;
        let second = s.store.create_tenant("Second").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        s.store.add_tenant_membership(&second, &s.alice, "guest", false).await.unwrap();

        let memberships = s.store.memberships(&s.alice).await.unwrap();
        assert_eq!(memberships.len(), 2);
        assert_eq!(memberships[0].tenant_id, s.tenant);
        assert!(!memberships[1].active);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("galley.db");

        let user = {
            let store = SqliteStore::open(&path, 2).unwrap();
            store.create_user("carol@acme.test", "Carol").await.unwrap()
        };

        let store = SqliteStore::open(&path, 2).unwrap();
        let token = store.issue_session(&user, None).await.unwrap();
        assert_eq!(store.resolve_session(&token).await.unwrap().unwrap().display_name, "Carol");
    }
}
