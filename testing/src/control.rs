//! In-memory control-record store for fast, deterministic lock/lifecycle
//! tests.

use composable_rust_core::projection::{
    ControlRecord, ControlRecordStore, PositionMap, ProjectionError, ProjectionStatus, Result,
};
use composable_rust_core::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

/// `HashMap`-backed [`ControlRecordStore`] for tests.
#[derive(Clone, Debug, Default)]
pub struct InMemoryControlRecordStore {
    rows: Arc<RwLock<HashMap<String, ControlRecord>>>,
}

impl InMemoryControlRecordStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current row for a projection, for test assertions.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Option<ControlRecord> {
        self.rows
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Seed a row directly, bypassing the CRUD protocol (useful for tests
    /// that need to start from a pre-existing checkpoint).
    pub fn seed(&self, record: ControlRecord) {
        self.rows
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.name.clone(), record);
    }
}

impl ControlRecordStore for InMemoryControlRecordStore {
    fn exists(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            Ok(self
                .rows
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(&name))
        })
    }

    fn create(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            self.rows.write().unwrap_or_else(|e| e.into_inner()).insert(
                name.clone(),
                ControlRecord {
                    name,
                    position: PositionMap::new(),
                    state: serde_json::Value::Object(serde_json::Map::new()),
                    status,
                    locked_until: None,
                },
            );
            Ok(())
        })
    }

    fn load(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<(PositionMap, serde_json::Value)>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
            let row = rows
                .get(&name)
                .ok_or_else(|| ProjectionError::ProjectionNotFound(name.clone()))?;
            Ok((row.position.clone(), row.state.clone()))
        })
    }

    fn persist(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
        state: &serde_json::Value,
        position: &PositionMap,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        let state = state.clone();
        let position = position.clone();
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
            let row = rows
                .get_mut(&name)
                .ok_or_else(|| ProjectionError::ProjectionNotFound(name.clone()))?;
            row.state = state;
            row.position = position;
            row.locked_until = Some(locked_until);
            Ok(())
        })
    }

    fn fetch_status(
        &self,
        name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<ProjectionStatus>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
            let row = rows
                .get(&name)
                .ok_or_else(|| ProjectionError::ProjectionNotFound(name.clone()))?;
            Ok(row.status)
        })
    }

    fn update_status(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
            let row = rows
                .get_mut(&name)
                .ok_or_else(|| ProjectionError::ProjectionNotFound(name.clone()))?;
            row.status = status;
            Ok(())
        })
    }

    fn clear_lock(
        &self,
        name: &str,
        status: ProjectionStatus,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
            let row = rows
                .get_mut(&name)
                .ok_or_else(|| ProjectionError::ProjectionNotFound(name.clone()))?;
            row.locked_until = None;
            row.status = status;
            Ok(())
        })
    }

    fn acquire_lock(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
            let row = rows
                .get_mut(&name)
                .ok_or_else(|| ProjectionError::ProjectionNotFound(name.clone()))?;
            let free = row.locked_until.is_none_or(|until| until < Utc::now());
            if !free {
                return Err(ProjectionError::LockNotAcquired(name));
            }
            row.locked_until = Some(locked_until);
            row.status = ProjectionStatus::Running;
            Ok(())
        })
    }

    fn refresh_lock(
        &self,
        name: &str,
        locked_until: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
            let row = rows
                .get_mut(&name)
                .ok_or_else(|| ProjectionError::ProjectionNotFound(name.clone()))?;
            row.locked_until = Some(locked_until);
            Ok(())
        })
    }

    fn delete_row(&self, name: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let name = name.to_string();
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
            if rows.remove(&name).is_none() {
                return Err(ProjectionError::ProjectionNotFound(name));
            }
            Ok(())
        })
    }
}
