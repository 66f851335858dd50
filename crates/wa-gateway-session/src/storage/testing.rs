//! Store wrappers for exercising write ordering in tests.

use std::time::Duration;

use async_trait::async_trait;
use wa_gateway_core::{
    SessionFilter, SessionRecord, SessionStatus, SessionStore, SessionUpdate, StoreError,
};

use super::MemoryStorage;

/// Memory storage whose `qr` writes take `delay` to land.
pub(crate) struct SlowQrStorage {
    inner: MemoryStorage,
    delay: Duration,
}

impl SlowQrStorage {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStorage::new(),
            delay,
        }
    }
}

#[async_trait]
impl SessionStore for SlowQrStorage {
    async fn find_one(&self, session_name: &str) -> Result<Option<SessionRecord>, StoreError> {
        self.inner.find_one(session_name).await
    }

    async fn find_many(&self, filter: SessionFilter) -> Result<Vec<SessionRecord>, StoreError> {
        self.inner.find_many(filter).await
    }

    async fn upsert(
        &self,
        session_name: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError> {
        if update.status == Some(SessionStatus::Qr) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.upsert(session_name, update).await
    }

    async fn update(
        &self,
        session_name: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError> {
        self.inner.update(session_name, update).await
    }
}
