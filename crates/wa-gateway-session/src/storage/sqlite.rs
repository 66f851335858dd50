//! SQLite session storage (feature-gated).

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool, sqlite::SqlitePoolOptions};
use wa_gateway_core::{SessionFilter, SessionRecord, SessionStore, SessionUpdate, StoreError};

use super::now;

/// SQLite storage implementation.
///
/// Every read-modify-write runs in its own transaction, so a guarded update
/// observes and replaces the row atomically.
pub struct SqliteStorage {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    session_name: String,
    status: String,
    pairing_code: Option<String>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<SessionRow> for SessionRecord {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            session_name: row.session_name,
            status: row.status.parse()?,
            pairing_code: row.pairing_code,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn internal(e: sqlx::Error) -> StoreError {
    StoreError::Internal(e.to_string())
}

impl SqliteStorage {
    /// Connect to `database_url` and create the schema if needed.
    ///
    /// # Errors
    /// Returns error if database connection fails.
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .connect(database_url)
            .await
            .map_err(internal)?;
        Self::with_pool(pool).await
    }

    /// Use an existing pool and create the schema if needed.
    ///
    /// # Errors
    /// Returns error if the schema cannot be created.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS wa_sessions (
                session_name TEXT PRIMARY KEY,
                status       TEXT NOT NULL,
                pairing_code TEXT,
                last_error   TEXT,
                created_at   INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(internal)?;

        Ok(Self { pool })
    }

    async fn fetch(
        conn: &mut SqliteConnection,
        session_name: &str,
    ) -> Result<Option<SessionRecord>, StoreError> {
        sqlx::query_as::<_, SessionRow>("SELECT * FROM wa_sessions WHERE session_name = ?")
            .bind(session_name)
            .fetch_optional(conn)
            .await
            .map_err(internal)?
            .map(SessionRecord::try_from)
            .transpose()
    }

    async fn save(conn: &mut SqliteConnection, record: &SessionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r"INSERT INTO wa_sessions
                (session_name, status, pairing_code, last_error, created_at, updated_at)
              VALUES (?, ?, ?, ?, ?, ?)
              ON CONFLICT(session_name) DO UPDATE SET
                status = excluded.status,
                pairing_code = excluded.pairing_code,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at",
        )
        .bind(&record.session_name)
        .bind(record.status.as_str())
        .bind(&record.pairing_code)
        .bind(&record.last_error)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(conn)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn modify(
        &self,
        session_name: &str,
        update: &SessionUpdate,
        create: bool,
    ) -> Result<SessionRecord, StoreError> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        let timestamp = now();

        let mut record = match Self::fetch(&mut tx, session_name).await? {
            Some(record) => record,
            None if create => SessionRecord::new(session_name, timestamp),
            None => return Err(StoreError::NotFound(session_name.to_string())),
        };

        if record.apply(update, timestamp) {
            Self::save(&mut tx, &record).await?;
        }
        tx.commit().await.map_err(internal)?;

        Ok(record)
    }
}

#[async_trait]
impl SessionStore for SqliteStorage {
    async fn find_one(&self, session_name: &str) -> Result<Option<SessionRecord>, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(internal)?;
        Self::fetch(&mut conn, session_name).await
    }

    async fn find_many(&self, filter: SessionFilter) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT * FROM wa_sessions ORDER BY created_at ASC, session_name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;

        let records = rows
            .into_iter()
            .map(SessionRecord::try_from)
            .filter(|r| r.as_ref().is_err() || r.as_ref().is_ok_and(|r| filter.matches(r)));

        match filter.limit {
            Some(limit) => records.take(limit).collect(),
            None => records.collect(),
        }
    }

    async fn upsert(
        &self,
        session_name: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError> {
        self.modify(session_name, &update, true).await
    }

    async fn update(
        &self,
        session_name: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError> {
        self.modify(session_name, &update, false).await
    }
}
