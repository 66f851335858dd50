//! In-memory session storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use wa_gateway_core::{SessionFilter, SessionRecord, SessionStore, SessionUpdate, StoreError};

use super::now;

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryStorage {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStorage {
    async fn find_one(&self, session_name: &str) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .get(session_name)
            .cloned())
    }

    async fn find_many(&self, filter: SessionFilter) -> Result<Vec<SessionRecord>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut result: Vec<SessionRecord> = sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();

        result.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.session_name.cmp(&b.session_name))
        });

        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }

        Ok(result)
    }

    async fn upsert(
        &self,
        session_name: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let timestamp = now();
        let record = sessions
            .entry(session_name.to_string())
            .or_insert_with(|| SessionRecord::new(session_name, timestamp));
        record.apply(&update, timestamp);

        Ok(record.clone())
    }

    async fn update(
        &self,
        session_name: &str,
        update: SessionUpdate,
    ) -> Result<SessionRecord, StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;

        let record = sessions
            .get_mut(session_name)
            .ok_or_else(|| StoreError::NotFound(session_name.to_string()))?;
        record.apply(&update, now());

        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use wa_gateway_core::SessionStatus;

    use super::*;

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let storage = MemoryStorage::new();

        let created = storage
            .upsert("shop", SessionUpdate::status(SessionStatus::Connecting))
            .await
            .unwrap();
        assert_eq!(created.status, SessionStatus::Connecting);

        let updated = storage
            .upsert(
                "shop",
                SessionUpdate::status(SessionStatus::Qr).with_pairing_code("2@abc"),
            )
            .await
            .unwrap();
        assert_eq!(updated.pairing_code.as_deref(), Some("2@abc"));
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(storage.find_many(SessionFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let storage = MemoryStorage::new();
        let err = storage
            .update("ghost", SessionUpdate::status(SessionStatus::SignedOut))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_guarded_upsert_leaves_signed_out_alone() {
        let storage = MemoryStorage::new();
        storage
            .upsert("shop", SessionUpdate::status(SessionStatus::SignedOut))
            .await
            .unwrap();

        let record = storage
            .upsert(
                "shop",
                SessionUpdate::status(SessionStatus::Disconnected)
                    .with_last_error("LOGOUT")
                    .unless(SessionStatus::SignedOut),
            )
            .await
            .unwrap();
        assert_eq!(record.status, SessionStatus::SignedOut);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_find_many_filters_and_limits() {
        let storage = MemoryStorage::new();
        for (name, status) in [
            ("a", SessionStatus::Connected),
            ("b", SessionStatus::SignedOut),
            ("c", SessionStatus::Qr),
        ] {
            storage
                .upsert(name, SessionUpdate::status(status))
                .await
                .unwrap();
        }

        let restorable = storage.find_many(SessionFilter::restorable()).await.unwrap();
        let names: Vec<_> = restorable.iter().map(|r| r.session_name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);

        let limited = storage
            .find_many(SessionFilter {
                limit: Some(1),
                ..SessionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
