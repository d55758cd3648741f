use crate::store::{MemberStore, StoreError};
use serde::Serialize;

/// Roster and attendance totals for the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionMetrics {
    pub total_members: usize,
    /// Members with a stored face signature.
    pub registered_faces: usize,
    /// `registered_faces / total_members`, zero for an empty roster.
    pub registration_rate: f32,
    pub today_attendance: u64,
}

impl RecognitionMetrics {
    pub async fn gather(store: &dyn MemberStore) -> Result<Self, StoreError> {
        let members = store.list_members().await?;
        let registered_faces = members
            .iter()
            .filter(|m| m.face_signature.is_some())
            .count();
        let registration_rate = if members.is_empty() {
            0.0
        } else {
            registered_faces as f32 / members.len() as f32
        };
        Ok(Self {
            total_members: members.len(),
            registered_faces,
            registration_rate,
            today_attendance: store.daily_attendance_count().await?,
        })
    }
}
