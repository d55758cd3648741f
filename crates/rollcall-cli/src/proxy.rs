// `#[zbus::proxy]` generates `AttendanceProxy` plus signal streams
// (`receive_checked_in`, `receive_no_match`).
#[zbus::proxy(
    interface = "io.rollcall.Attendance1",
    default_service = "io.rollcall.Attendance1",
    default_path = "/io/rollcall/Attendance1"
)]
pub trait Attendance {
    async fn start(&self) -> zbus::Result<()>;

    async fn stop(&self) -> zbus::Result<()>;

    async fn status(&self) -> zbus::Result<String>;

    async fn list_members(&self) -> zbus::Result<String>;

    async fn register(&self, name: &str, email: &str) -> zbus::Result<String>;

    async fn recapture(&self, member_id: &str) -> zbus::Result<String>;

    async fn recent_attendance(&self, limit: u32) -> zbus::Result<String>;

    async fn member_attendance(&self, member_id: &str) -> zbus::Result<String>;

    async fn daily_count(&self) -> zbus::Result<u64>;

    async fn metrics(&self) -> zbus::Result<String>;

    #[zbus(signal)]
    fn checked_in(
        &self,
        member_id: &str,
        name: &str,
        score: f64,
        check_in_time: &str,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    fn no_match(&self, best_score: f64) -> zbus::Result<()>;
}
