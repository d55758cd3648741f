use crate::types::{AttendanceRecord, FaceSignature, Member, NewMember, ValidationError};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("member not found: {0}")]
    MemberNotFound(String),
    #[error("invalid member: {0}")]
    Invalid(#[from] ValidationError),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Persistent home of members and their check-ins.
///
/// Attendance records are append-only and never deduplicated: two calls to
/// [`record_attendance`](Self::record_attendance) always create two records.
#[async_trait]
pub trait MemberStore: Send + Sync {
    async fn list_members(&self) -> Result<Vec<Member>, StoreError>;

    async fn get_member(&self, id: &str) -> Result<Member, StoreError>;

    /// Validate and persist a new member; the store assigns the id.
    async fn create_member(&self, member: NewMember) -> Result<Member, StoreError>;

    async fn update_face_signature(
        &self,
        id: &str,
        signature: FaceSignature,
    ) -> Result<Member, StoreError>;

    async fn record_attendance(&self, member_id: &str) -> Result<AttendanceRecord, StoreError>;

    /// Most recent check-ins, newest first.
    async fn recent_attendance(&self, limit: usize) -> Result<Vec<AttendanceRecord>, StoreError>;

    /// All check-ins of one member, newest first.
    async fn member_attendance(&self, member_id: &str)
        -> Result<Vec<AttendanceRecord>, StoreError>;

    /// Check-ins during the current local calendar day.
    async fn daily_attendance_count(&self) -> Result<u64, StoreError>;
}
