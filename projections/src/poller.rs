//! Remote-Control Poller (C6): reads `status` from the control row and
//! translates it into local lifecycle transitions.
//!
//! Status-read errors are swallowed and treated as `running` — a
//! projection that cannot observe operator commands should keep working
//! rather than self-stop (§4.4, §7).

use composable_rust_core::projection::{ControlRecordStore, ProjectionStatus};

/// Fetch the remote status for `name`, defaulting to `Running` on any
/// error.
pub async fn poll_status(store: &dyn ControlRecordStore, name: &str) -> ProjectionStatus {
    match store.fetch_status(name).await {
        Ok(status) => status,
        Err(error) => {
            tracing::warn!(projection = name, %error, "status read failed, assuming running");
            ProjectionStatus::Running
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use composable_rust_testing::InMemoryControlRecordStore;

    #[tokio::test]
    async fn missing_row_is_treated_as_running() {
        let store = InMemoryControlRecordStore::new();
        let status = poll_status(&store, "nonexistent").await;
        assert_eq!(status, ProjectionStatus::Running);
    }

    #[tokio::test]
    async fn existing_row_returns_its_status() {
        let store = InMemoryControlRecordStore::new();
        store.create("p", ProjectionStatus::Stopping).await.unwrap();
        let status = poll_status(&store, "p").await;
        assert_eq!(status, ProjectionStatus::Stopping);
    }
}
