//! Postgres-backed MessageStore (sqlx, runtime-checked queries).
//!
//! Each message insert runs inside a savepoint so a unique-index conflict on
//! `(session_id, sequence)` can be rolled back and retried without poisoning
//! the enclosing transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Connection, PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use super::{
    escape_like, MessageStore, Page, SessionFilter, SessionOrder, SessionPatch, StoreError,
    StoreTx,
};
use crate::models::{Message, SamplingDefaults, Session};

const SESSION_COLUMNS: &str = "s.id, s.user_id, s.title, s.model, s.system_prompt, \
    s.temperature, s.top_p, s.top_k, s.max_tokens, s.pinned, s.archived, s.deleted, \
    s.message_count, s.last_message_id, s.created_at, s.updated_at";

const MESSAGE_COLUMNS: &str = "id, session_id, role, content, sequence, token_count, \
    tool_calls, error, metadata, created_at";

// ============================================================================
// Row mapping
// ============================================================================

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    user_id: String,
    title: String,
    model: String,
    system_prompt: Option<String>,
    temperature: Option<f64>,
    top_p: Option<f64>,
    top_k: Option<i32>,
    max_tokens: Option<i32>,
    pinned: bool,
    archived: bool,
    deleted: bool,
    message_count: i32,
    last_message_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Session {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            model: row.model,
            system_prompt: row.system_prompt,
            sampling: SamplingDefaults {
                temperature: row.temperature,
                top_p: row.top_p,
                top_k: row.top_k,
                max_tokens: row.max_tokens,
            },
            pinned: row.pinned,
            archived: row.archived,
            deleted: row.deleted,
            message_count: row.message_count,
            last_message_id: row.last_message_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    role: String,
    content: String,
    sequence: i64,
    token_count: i32,
    tool_calls: Option<serde_json::Value>,
    error: Option<String>,
    metadata: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            role: row.role.parse().map_err(StoreError::Corrupt)?,
            id: row.id,
            session_id: row.session_id,
            content: row.content,
            sequence: row.sequence,
            token_count: row.token_count,
            tool_calls: row.tool_calls,
            error: row.error,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

fn into_messages(rows: Vec<MessageRow>) -> Result<Vec<Message>, StoreError> {
    rows.into_iter().map(Message::try_from).collect()
}

fn push_session_filters(qb: &mut QueryBuilder<'_, Postgres>, user_id: &str, filter: &SessionFilter) {
    qb.push(" WHERE NOT s.deleted AND s.user_id = ");
    qb.push_bind(user_id.to_string());
    if let Some(pinned) = filter.pinned {
        qb.push(" AND s.pinned = ").push_bind(pinned);
    }
    if let Some(archived) = filter.archived {
        qb.push(" AND s.archived = ").push_bind(archived);
    }
    if let Some(model) = &filter.model {
        qb.push(" AND s.model = ").push_bind(model.clone());
    }
    if let Some(after) = filter.created_after {
        qb.push(" AND s.created_at > ").push_bind(after);
    }
    if let Some(before) = filter.created_before {
        qb.push(" AND s.created_at < ").push_bind(before);
    }
}

fn order_clause(order: SessionOrder) -> &'static str {
    match order {
        SessionOrder::UpdatedDesc => " ORDER BY s.updated_at DESC, s.id",
        SessionOrder::CreatedDesc => " ORDER BY s.created_at DESC, s.id",
        SessionOrder::PinnedThenUpdatedDesc => " ORDER BY s.pinned DESC, s.updated_at DESC, s.id",
    }
}

fn push_search_clause(qb: &mut QueryBuilder<'_, Postgres>, user_id: &str, pattern: &str) {
    qb.push(" WHERE NOT s.deleted AND s.user_id = ");
    qb.push_bind(user_id.to_string());
    qb.push(" AND (s.title ILIKE ");
    qb.push_bind(pattern.to_string());
    qb.push(" OR EXISTS (SELECT 1 FROM messages m WHERE m.id = s.last_message_id AND m.content ILIKE ");
    qb.push_bind(pattern.to_string());
    qb.push("))");
}

// ============================================================================
// PgMessageStore
// ============================================================================

#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                id, user_id, title, model, system_prompt,
                temperature, top_p, top_k, max_tokens,
                pinned, archived, deleted, message_count, last_message_id,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.title)
        .bind(&session.model)
        .bind(&session.system_prompt)
        .bind(session.sampling.temperature)
        .bind(session.sampling.top_p)
        .bind(session.sampling.top_k)
        .bind(session.sampling.max_tokens)
        .bind(session.pinned)
        .bind(session.archived)
        .bind(session.deleted)
        .bind(session.message_count)
        .bind(&session.last_message_id)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let sql = format!(
            "SELECT {} FROM sessions s WHERE s.id = $1 AND NOT s.deleted",
            SESSION_COLUMNS
        );
        let row: Option<SessionRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Session::from)
            .ok_or_else(|| StoreError::session_not_found(session_id))
    }

    async fn list_sessions(
        &self,
        user_id: &str,
        filter: &SessionFilter,
        page: Page,
    ) -> Result<(Vec<Session>, u64), StoreError> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM sessions s");
        push_session_filters(&mut count, user_id, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM sessions s", SESSION_COLUMNS));
        push_session_filters(&mut select, user_id, filter);
        select.push(order_clause(filter.order));
        select.push(" LIMIT ").push_bind(page.limit());
        select.push(" OFFSET ").push_bind(page.offset());
        let rows: Vec<SessionRow> = select.build_query_as().fetch_all(&self.pool).await?;

        Ok((rows.into_iter().map(Session::from).collect(), total.max(0) as u64))
    }

    async fn update_session_fields(
        &self,
        session_id: &str,
        patch: &SessionPatch,
    ) -> Result<(), StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("UPDATE sessions SET updated_at = NOW()");
        if let Some(title) = &patch.title {
            qb.push(", title = ").push_bind(title.clone());
        }
        if let Some(prompt) = &patch.system_prompt {
            qb.push(", system_prompt = ").push_bind(prompt.clone());
        }
        if let Some(t) = patch.sampling.temperature {
            qb.push(", temperature = ").push_bind(t);
        }
        if let Some(p) = patch.sampling.top_p {
            qb.push(", top_p = ").push_bind(p);
        }
        if let Some(k) = patch.sampling.top_k {
            qb.push(", top_k = ").push_bind(k);
        }
        if let Some(m) = patch.sampling.max_tokens {
            qb.push(", max_tokens = ").push_bind(m);
        }
        if let Some(pinned) = patch.pinned {
            qb.push(", pinned = ").push_bind(pinned);
        }
        if let Some(archived) = patch.archived {
            qb.push(", archived = ").push_bind(archived);
        }
        qb.push(" WHERE id = ").push_bind(session_id.to_string());
        qb.push(" AND NOT deleted");

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::session_not_found(session_id));
        }
        Ok(())
    }

    async fn soft_delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET deleted = TRUE, updated_at = NOW() WHERE id = $1 AND NOT deleted",
        )
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::session_not_found(session_id));
        }
        Ok(())
    }

    async fn search_sessions(
        &self,
        user_id: &str,
        keyword: &str,
        page: Page,
    ) -> Result<(Vec<Session>, u64), StoreError> {
        let pattern = format!("%{}%", escape_like(keyword));

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM sessions s");
        push_search_clause(&mut count, user_id, &pattern);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM sessions s", SESSION_COLUMNS));
        push_search_clause(&mut select, user_id, &pattern);
        select.push(order_clause(SessionOrder::UpdatedDesc));
        select.push(" LIMIT ").push_bind(page.limit());
        select.push(" OFFSET ").push_bind(page.offset());
        let rows: Vec<SessionRow> = select.build_query_as().fetch_all(&self.pool).await?;

        Ok((rows.into_iter().map(Session::from).collect(), total.max(0) as u64))
    }

    async fn get_message(&self, message_id: &str) -> Result<Message, StoreError> {
        let sql = format!("SELECT {} FROM messages WHERE id = $1", MESSAGE_COLUMNS);
        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| StoreError::message_not_found(message_id))?
            .try_into()
    }

    async fn list_messages(
        &self,
        session_id: &str,
        page: Page,
    ) -> Result<(Vec<Message>, u64), StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE session_id = $1")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            "SELECT {} FROM messages WHERE session_id = $1 ORDER BY sequence ASC LIMIT $2 OFFSET $3",
            MESSAGE_COLUMNS
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok((into_messages(rows)?, total.max(0) as u64))
    }

    async fn recent_messages(
        &self,
        session_id: &str,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let sql = format!(
            r#"
            SELECT {cols} FROM (
                SELECT {cols} FROM messages
                WHERE session_id = $1
                ORDER BY sequence DESC
                LIMIT $2
            ) recent
            ORDER BY sequence ASC
            "#,
            cols = MESSAGE_COLUMNS
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        into_messages(rows)
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgStoreTx { tx }))
    }
}

// ============================================================================
// Transaction
// ============================================================================

struct PgStoreTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn next_sequence(&mut self, session_id: &str) -> Result<i64, StoreError> {
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM messages WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(next)
    }

    async fn create_message(&mut self, message: &mut Message) -> Result<(), StoreError> {
        let id = Uuid::new_v4().to_string();
        let mut savepoint = Connection::begin(&mut *self.tx).await?;

        let inserted: Result<DateTime<Utc>, sqlx::Error> = sqlx::query_scalar(
            r#"
            INSERT INTO messages (
                id, session_id, role, content, sequence, token_count,
                tool_calls, error, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING created_at
            "#,
        )
        .bind(&id)
        .bind(&message.session_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.sequence)
        .bind(message.token_count)
        .bind(&message.tool_calls)
        .bind(&message.error)
        .bind(&message.metadata)
        .fetch_one(&mut *savepoint)
        .await;

        match inserted {
            Ok(created_at) => {
                savepoint.commit().await?;
                message.id = id;
                message.created_at = created_at;
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                savepoint.rollback().await?;
                Err(StoreError::SequenceConflict {
                    session_id: message.session_id.clone(),
                    sequence: message.sequence,
                })
            }
            Err(e) => {
                if let Err(rollback_err) = savepoint.rollback().await {
                    tracing::warn!(error = %rollback_err, "Savepoint rollback failed");
                }
                Err(e.into())
            }
        }
    }

    async fn increment_message_count(&mut self, session_id: &str, by: i32) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET message_count = message_count + $2, updated_at = NOW() \
             WHERE id = $1 AND NOT deleted",
        )
        .bind(session_id)
        .bind(by)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::session_not_found(session_id));
        }
        Ok(())
    }

    async fn update_last_message(&mut self, session_id: &str, message_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET last_message_id = $2, updated_at = NOW() \
             WHERE id = $1 AND NOT deleted",
        )
        .bind(session_id)
        .bind(message_id)
        .execute(&mut *self.tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::session_not_found(session_id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// ============================================================================
// Tests (require a live Postgres; skipped otherwise)
// ============================================================================
