//! In-memory fakes for the session's collaborators.

use crate::detector::{Detector, DetectorError};
use crate::session::{CaptureResources, InitError};
use crate::source::{Frame, FrameSource, SourceError};
use crate::store::{MemberStore, StoreError};
use crate::types::{
    AttendanceRecord, DetectedFace, FaceBox, FaceSignature, Member, MemberStatus, NewMember,
};
use async_trait::async_trait;
use chrono::{Local, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn signature(width: f32, height: f32) -> FaceSignature {
    FaceSignature { x_min: 0.0, y_min: 0.0, width, height }
}

pub fn face(width: f32, height: f32) -> DetectedFace {
    DetectedFace {
        bbox: FaceBox { x_min: 10.0, y_min: 20.0, width, height },
        score: 0.95,
    }
}

#[derive(Default)]
pub struct MemoryStore {
    members: Mutex<Vec<Member>>,
    records: Mutex<Vec<AttendanceRecord>>,
    next_id: AtomicU64,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    write_delay: Mutex<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn id(&self) -> String {
        (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    /// Insert a member directly, bypassing validation.
    pub fn seed(&self, name: &str, face_signature: Option<FaceSignature>) -> Member {
        let member = Member {
            id: self.id(),
            name: name.to_string(),
            email: None,
            face_signature,
            status: MemberStatus::Active,
            created_at: Utc::now(),
        };
        self.members.lock().unwrap().push(member.clone());
        member
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn attendance_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn records_for(&self, member_id: &str) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.member_id == member_id)
            .count()
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("read refused".into()));
        }
        Ok(())
    }

    fn newest_first(mut records: Vec<AttendanceRecord>) -> Vec<AttendanceRecord> {
        records.reverse();
        records
    }
}

#[async_trait]
impl MemberStore for MemoryStore {
    async fn list_members(&self) -> Result<Vec<Member>, StoreError> {
        self.check_reads()?;
        Ok(self.members.lock().unwrap().clone())
    }

    async fn get_member(&self, id: &str) -> Result<Member, StoreError> {
        self.check_reads()?;
        self.members
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or_else(|| StoreError::MemberNotFound(id.to_string()))
    }

    async fn create_member(&self, member: NewMember) -> Result<Member, StoreError> {
        let member = member.validate()?;
        let created = Member {
            id: self.id(),
            name: member.name,
            email: member.email,
            face_signature: Some(member.face_signature),
            status: MemberStatus::Active,
            created_at: Utc::now(),
        };
        self.members.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn update_face_signature(
        &self,
        id: &str,
        signature: FaceSignature,
    ) -> Result<Member, StoreError> {
        let mut members = self.members.lock().unwrap();
        let member = members
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| StoreError::MemberNotFound(id.to_string()))?;
        member.face_signature = Some(signature);
        Ok(member.clone())
    }

    async fn record_attendance(&self, member_id: &str) -> Result<AttendanceRecord, StoreError> {
        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write refused".into()));
        }
        let name = self
            .members
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == member_id)
            .map(|m| m.name.clone())
            .ok_or_else(|| StoreError::MemberNotFound(member_id.to_string()))?;
        let record = AttendanceRecord {
            id: self.id(),
            member_id: member_id.to_string(),
            check_in_time: Utc::now(),
            member_name: Some(name),
        };
        self.records.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn recent_attendance(&self, limit: usize) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.check_reads()?;
        let records = self.records.lock().unwrap().clone();
        Ok(Self::newest_first(records).into_iter().take(limit).collect())
    }

    async fn member_attendance(
        &self,
        member_id: &str,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.check_reads()?;
        let records: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.member_id == member_id)
            .cloned()
            .collect();
        Ok(Self::newest_first(records))
    }

    async fn daily_attendance_count(&self) -> Result<u64, StoreError> {
        self.check_reads()?;
        let today = Local::now().date_naive();
        let count = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.check_in_time.with_timezone(&Local).date_naive() == today)
            .count();
        Ok(count as u64)
    }
}

/// Counters shared with a [`ScriptedSource`] after it moves into a session.
#[derive(Clone, Default)]
pub struct SourceProbe {
    pub released: Arc<AtomicUsize>,
    pub served: Arc<AtomicU32>,
}

impl SourceProbe {
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> u32 {
        self.served.load(Ordering::SeqCst)
    }
}

/// Produces blank frames with increasing sequence numbers.
pub struct ScriptedSource {
    probe: SourceProbe,
    fail_at: Option<u32>,
}

impl ScriptedSource {
    pub fn new() -> (Self, SourceProbe) {
        let probe = SourceProbe::default();
        (
            Self {
                probe: probe.clone(),
                fail_at: None,
            },
            probe,
        )
    }

    /// Fail when asked for frame `sequence`.
    pub fn failing_at(mut self, sequence: u32) -> Self {
        self.fail_at = Some(sequence);
        self
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        if self.probe.released() > 0 {
            return Err(SourceError::Released);
        }
        let sequence = self.probe.served.load(Ordering::SeqCst);
        if self.fail_at == Some(sequence) {
            return Err(SourceError::Capture("device unplugged".into()));
        }
        self.probe.served.fetch_add(1, Ordering::SeqCst);
        Ok(Frame::new(vec![0; 4], 2, 2, sequence))
    }

    fn release(&mut self) {
        self.probe.released.fetch_add(1, Ordering::SeqCst);
    }
}

type Script = dyn Fn(u32) -> Result<Vec<DetectedFace>, String> + Send + Sync;

/// Returns faces chosen by a per-sequence script.
pub struct ScriptedDetector {
    script: Arc<Script>,
    latency: Duration,
}

impl ScriptedDetector {
    pub fn new(script: impl Fn(u32) -> Result<Vec<DetectedFace>, String> + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            latency: Duration::ZERO,
        }
    }

    /// Report `face` for frames in `range`, nothing otherwise.
    pub fn burst(face: DetectedFace, range: std::ops::Range<u32>) -> Self {
        Self::new(move |seq| Ok(if range.contains(&seq) { vec![face] } else { vec![] }))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Detector for ScriptedDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError> {
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        (self.script)(frame.sequence).map_err(DetectorError::InferenceFailed)
    }
}

pub struct FakeResources {
    source: Option<ScriptedSource>,
    detector: Option<ScriptedDetector>,
}

impl FakeResources {
    pub fn new(source: ScriptedSource, detector: ScriptedDetector) -> Self {
        Self {
            source: Some(source),
            detector: Some(detector),
        }
    }

    pub fn without_detector(source: ScriptedSource) -> Self {
        Self {
            source: Some(source),
            detector: None,
        }
    }

    pub fn without_source() -> Self {
        Self {
            source: None,
            detector: None,
        }
    }
}

impl CaptureResources for FakeResources {
    fn open_source(&mut self) -> Result<Box<dyn FrameSource>, InitError> {
        self.source
            .take()
            .map(|s| Box::new(s) as Box<dyn FrameSource>)
            .ok_or_else(|| InitError::FrameSource("permission denied".into()))
    }

    fn load_detector(&mut self) -> Result<Box<dyn Detector>, InitError> {
        self.detector
            .take()
            .map(|d| Box::new(d) as Box<dyn Detector>)
            .ok_or_else(|| InitError::Detector("model failed to load".into()))
    }
}
