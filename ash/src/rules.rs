use once_cell::sync::Lazy;
use regex::RegexSet;

use crate::snapshot::{RawSession, SessionState};

/// Maintenance keywords that force inclusion regardless of sampling rate
/// (spec §4.4). Compiled once, at module load, rather than per-sample —
/// the source's "regex compilation in hot path" anti-pattern this
/// collector's design explicitly avoids (spec §9).
static MAINTENANCE_KEYWORDS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\bVACUUM\b",
        r"(?i)\bANALYZE\b",
        r"(?i)\bREINDEX\b",
        r"(?i)\bCREATE INDEX\b",
        r"(?i)\bDROP INDEX\b",
        r"(?i)\bALTER TABLE\b",
        r"(?i)\bCLUSTER\b",
        r"(?i)\bCHECKPOINT\b",
    ])
    .expect("maintenance keyword patterns are valid")
});

fn is_maintenance_statement(state_text: &str) -> bool {
    MAINTENANCE_KEYWORDS.is_match(state_text)
}

/// Whether a high-impact DML keyword appears in the session's current
/// query text, used for the ×2 priority multiplier (spec §4.4).
fn is_high_impact_dml(query_text: &str) -> bool {
    static HIGH_IMPACT: Lazy<RegexSet> =
        Lazy::new(|| RegexSet::new([r"(?i)\bUPDATE\b", r"(?i)\bDELETE\b", r"(?i)\bINSERT\b"]).unwrap());
    HIGH_IMPACT.is_match(query_text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeDecision {
    /// Bypasses the sampling rate entirely.
    AlwaysInclude,
    /// Included unconditionally under the default rules (active/waiting,
    /// or idle when configured).
    DefaultInclude,
    /// Subject to the rate-limited residual roll.
    RateLimited,
}

/// Evaluates the always-include / default-include / residual rules for
/// one candidate session, and the priority multiplier applied to its
/// residual-roll probability (spec §4.4).
pub fn classify(raw: &RawSession, include_idle_sessions: bool, long_running_threshold: chrono::Duration, now: chrono::DateTime<chrono::Utc>) -> (IncludeDecision, f64) {
    if raw.blocking_pid.is_some() {
        return (IncludeDecision::AlwaysInclude, 2.0);
    }
    if let Some(query_start) = raw.query_start {
        if now - query_start > long_running_threshold {
            return (IncludeDecision::AlwaysInclude, 1.0);
        }
    }
    if is_maintenance_statement(&raw.state_text) {
        return (IncludeDecision::AlwaysInclude, 1.0);
    }

    let state = SessionState::classify(&raw.state_text);
    let has_wait = raw.wait_event_type.is_some() || raw.wait_event_name.is_some();

    if state == SessionState::Active || has_wait {
        return (IncludeDecision::DefaultInclude, priority_multiplier(state, has_wait, raw));
    }

    if state == SessionState::Idle && include_idle_sessions {
        return (IncludeDecision::DefaultInclude, 1.0);
    }

    (IncludeDecision::RateLimited, priority_multiplier(state, has_wait, raw))
}

/// Combines the ×2/×1.5/×2 per-session priority multipliers (spec
/// §4.4). The *multiplier* itself is not capped here — capping to 1.0
/// applies to the resulting inclusion probability once multiplied
/// against the current sampling rate, which is the caller's job.
fn priority_multiplier(state: SessionState, has_wait: bool, raw: &RawSession) -> f64 {
    let mut multiplier: f64 = 1.0;
    if state == SessionState::Active {
        multiplier *= 2.0;
    }
    if has_wait {
        multiplier *= 1.5;
    }
    if raw.query_text.as_deref().is_some_and(is_high_impact_dml) {
        multiplier *= 2.0;
    }
    multiplier
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn base_raw() -> RawSession {
        RawSession {
            pid: 1,
            session_id: "1".into(),
            database: "db".into(),
            username: "u".into(),
            application_name: "app".into(),
            client_addr: None,
            connection_start: Utc::now(),
            query_start: None,
            query_text: None,
            state_text: "idle".into(),
            wait_event_type: None,
            wait_event_name: None,
            blocking_pid: None,
            backend_type: "client backend".into(),
        }
    }

    #[test]
    fn blocked_session_is_always_included() {
        let mut raw = base_raw();
        raw.blocking_pid = Some(42);
        let (decision, _) = classify(&raw, false, chrono::Duration::minutes(5), Utc::now());
        assert_eq!(decision, IncludeDecision::AlwaysInclude);
    }

    #[test]
    fn long_running_query_is_always_included() {
        let mut raw = base_raw();
        raw.query_start = Some(Utc::now() - chrono::Duration::minutes(10));
        let (decision, _) = classify(&raw, false, chrono::Duration::minutes(5), Utc::now());
        assert_eq!(decision, IncludeDecision::AlwaysInclude);
    }

    #[test]
    fn maintenance_statement_is_always_included() {
        let mut raw = base_raw();
        raw.state_text = "VACUUM ANALYZE foo".into();
        let (decision, _) = classify(&raw, false, chrono::Duration::minutes(5), Utc::now());
        assert_eq!(decision, IncludeDecision::AlwaysInclude);
    }

    #[test]
    fn active_session_is_default_included() {
        let mut raw = base_raw();
        raw.state_text = "active".into();
        let (decision, _) = classify(&raw, false, chrono::Duration::minutes(5), Utc::now());
        assert_eq!(decision, IncludeDecision::DefaultInclude);
    }

    #[test]
    fn plain_idle_session_is_rate_limited_without_flag() {
        let raw = base_raw();
        let (decision, _) = classify(&raw, false, chrono::Duration::minutes(5), Utc::now());
        assert_eq!(decision, IncludeDecision::RateLimited);
    }

    #[test]
    fn idle_session_is_default_included_when_flag_set() {
        let raw = base_raw();
        let (decision, _) = classify(&raw, true, chrono::Duration::minutes(5), Utc::now());
        assert_eq!(decision, IncludeDecision::DefaultInclude);
    }
}
