use chrono::{DateTime, Utc};

/// A session's run state at sample time (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Idle,
    IdleInTransaction,
    Disabled,
    Waiting,
    Other,
}

impl SessionState {
    /// Classifies a raw backend state string the way `pg_stat_activity`
    /// and MySQL's `performance_schema.threads`/`SHOW PROCESSLIST` spell
    /// it.
    pub fn classify(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "active" | "query" | "running" => SessionState::Active,
            "idle" | "sleep" => SessionState::Idle,
            "idle in transaction" | "idle in transaction (aborted)" => SessionState::IdleInTransaction,
            "disabled" => SessionState::Disabled,
            _ => SessionState::Other,
        }
    }
}

/// A single moment of database session state (spec §3). Each snapshot is
/// bounded to roughly 1 KB and is read-only once placed in the ring
/// buffer.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub sample_time: DateTime<Utc>,
    pub pid: i64,
    pub session_id: String,
    pub database: String,
    pub username: String,
    pub application_name: String,
    pub client_addr: Option<String>,
    pub connection_start: DateTime<Utc>,
    pub query_start: Option<DateTime<Utc>>,
    pub query_fingerprint: Option<String>,
    pub state: SessionState,
    pub state_text: String,
    pub wait_event_type: Option<String>,
    pub wait_event_name: Option<String>,
    pub blocking_pid: Option<i64>,
    pub backend_type: String,
}

impl SessionSnapshot {
    pub fn query_duration(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.query_start.map(|start| now - start)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocking_pid.is_some()
    }

    pub fn has_wait_event(&self) -> bool {
        self.wait_event_type.is_some() || self.wait_event_name.is_some()
    }
}

/// Raw fields as read off a system view, before classification. Kept
/// separate from `SessionSnapshot` so the always-include/default-include
/// rule evaluation (§4.4) can inspect the unclassified state text for
/// maintenance-keyword matching.
#[derive(Debug, Clone)]
pub struct RawSession {
    pub pid: i64,
    pub session_id: String,
    pub database: String,
    pub username: String,
    pub application_name: String,
    pub client_addr: Option<String>,
    pub connection_start: DateTime<Utc>,
    pub query_start: Option<DateTime<Utc>>,
    pub query_text: Option<String>,
    pub state_text: String,
    pub wait_event_type: Option<String>,
    pub wait_event_name: Option<String>,
    pub blocking_pid: Option<i64>,
    pub backend_type: String,
}
