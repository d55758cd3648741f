use crate::store::{MemberStore, StoreError};
use crate::types::AttendanceRecord;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Writes confirmed matches to the member store.
///
/// Failures are returned as-is: no retry and nothing to roll back. An
/// optional timeout bounds each store call.
#[derive(Clone)]
pub struct AttendanceRecorder {
    store: Arc<dyn MemberStore>,
    timeout: Option<Duration>,
}

impl AttendanceRecorder {
    pub fn new(store: Arc<dyn MemberStore>) -> Self {
        Self {
            store,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn record(&self, member_id: &str) -> Result<AttendanceRecord, StoreError> {
        let result = self.bounded(self.store.record_attendance(member_id)).await;
        match &result {
            Ok(record) => tracing::info!(
                member_id,
                record_id = %record.id,
                check_in = %record.check_in_time,
                "attendance recorded"
            ),
            Err(e) => tracing::warn!(member_id, error = %e, "attendance write failed"),
        }
        result
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.bounded(self.store.recent_attendance(limit)).await
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| StoreError::Timeout(limit))?,
            None => call.await,
        }
    }
}
