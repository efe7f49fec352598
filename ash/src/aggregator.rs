use std::collections::{HashMap, VecDeque};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::snapshot::SessionSnapshot;

#[derive(Debug, Clone)]
pub struct WindowAggregatorConfig {
    /// One independent rollup per duration (default 1m/5m/15m/1h, spec
    /// §4.4).
    pub window_durations: Vec<StdDuration>,
    /// How long a closed window is kept before being discarded.
    pub retention: StdDuration,
    pub top_n: usize,
}

impl Default for WindowAggregatorConfig {
    fn default() -> Self {
        Self {
            window_durations: vec![
                StdDuration::from_secs(60),
                StdDuration::from_secs(5 * 60),
                StdDuration::from_secs(15 * 60),
                StdDuration::from_secs(60 * 60),
            ],
            retention: StdDuration::from_secs(24 * 60 * 60),
            top_n: 10,
        }
    }
}

/// One closed or in-progress aggregation window.
#[derive(Debug, Clone)]
pub struct WindowAggregate {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration: StdDuration,
    pub state_histogram: HashMap<String, u64>,
    pub wait_event_counts: HashMap<String, u64>,
    pub query_counts: HashMap<String, u64>,
    pub sample_count: u64,
    pub closed: bool,
}

impl WindowAggregate {
    fn new(start: DateTime<Utc>, duration: StdDuration) -> Self {
        Self {
            start,
            end: start + chrono::Duration::from_std(duration).unwrap_or_default(),
            duration,
            state_histogram: HashMap::new(),
            wait_event_counts: HashMap::new(),
            query_counts: HashMap::new(),
            sample_count: 0,
            closed: false,
        }
    }

    fn record(&mut self, snapshot: &SessionSnapshot) {
        self.sample_count += 1;
        *self
            .state_histogram
            .entry(format!("{:?}", snapshot.state))
            .or_insert(0) += 1;
        if let (Some(ty), Some(name)) = (&snapshot.wait_event_type, &snapshot.wait_event_name) {
            *self.wait_event_counts.entry(format!("{ty}:{name}")).or_insert(0) += 1;
        }
        if let Some(fp) = &snapshot.query_fingerprint {
            *self.query_counts.entry(fp.clone()).or_insert(0) += 1;
        }
    }

    /// Top-N by frequency, descending, ties broken by key for determinism.
    pub fn top_queries(&self, n: usize) -> Vec<(String, u64)> {
        top_n(&self.query_counts, n)
    }

    pub fn top_waits(&self, n: usize) -> Vec<(String, u64)> {
        top_n(&self.wait_event_counts, n)
    }
}

fn top_n(counts: &HashMap<String, u64>, n: usize) -> Vec<(String, u64)> {
    let mut entries: Vec<(String, u64)> = counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.truncate(n);
    entries
}

struct Track {
    duration: StdDuration,
    active: WindowAggregate,
    closed: VecDeque<WindowAggregate>,
}

/// Folds a stream of snapshots into fixed, independent-resolution windows
/// (spec §4.4). A window is closed the first time wall-clock time is
/// observed past its `end`; closed windows age out after `retention`.
pub struct WindowAggregator {
    cfg: WindowAggregatorConfig,
    tracks: Mutex<Vec<Track>>,
}

impl WindowAggregator {
    pub fn new(cfg: WindowAggregatorConfig) -> Self {
        let now = Utc::now();
        let tracks = cfg
            .window_durations
            .iter()
            .map(|&d| Track {
                duration: d,
                active: WindowAggregate::new(now, d),
                closed: VecDeque::new(),
            })
            .collect();
        Self {
            cfg,
            tracks: Mutex::new(tracks),
        }
    }

    pub fn ingest(&self, snapshot: &SessionSnapshot) {
        let mut tracks = self.tracks.lock();
        for track in tracks.iter_mut() {
            self.roll_if_expired(track, snapshot.sample_time);
            track.active.record(snapshot);
        }
    }

    /// Call periodically (independent of ingestion) so windows close even
    /// during a lull with no incoming snapshots.
    pub fn tick(&self, now: DateTime<Utc>) {
        let mut tracks = self.tracks.lock();
        for track in tracks.iter_mut() {
            self.roll_if_expired(track, now);
        }
    }

    fn roll_if_expired(&self, track: &mut Track, now: DateTime<Utc>) {
        if now < track.active.end {
            return;
        }
        let mut closed = std::mem::replace(&mut track.active, WindowAggregate::new(now, track.duration));
        closed.closed = true;
        track.closed.push_back(closed);
        let retention = chrono::Duration::from_std(self.cfg.retention).unwrap_or_default();
        while let Some(front) = track.closed.front() {
            if now - front.end > retention {
                track.closed.pop_front();
            } else {
                break;
            }
        }
    }

    /// Closed windows plus the current in-progress one, for the
    /// requested resolution, oldest first.
    pub fn windows_for(&self, duration: StdDuration) -> Vec<WindowAggregate> {
        let tracks = self.tracks.lock();
        let Some(track) = tracks.iter().find(|t| t.duration == duration) else {
            return Vec::new();
        };
        track
            .closed
            .iter()
            .cloned()
            .chain(std::iter::once(track.active.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SessionState;

    fn snap(at: DateTime<Utc>, fingerprint: &str) -> SessionSnapshot {
        SessionSnapshot {
            sample_time: at,
            pid: 1,
            session_id: "1".into(),
            database: "db".into(),
            username: "u".into(),
            application_name: "app".into(),
            client_addr: None,
            connection_start: at,
            query_start: None,
            query_fingerprint: Some(fingerprint.to_owned()),
            state: SessionState::Active,
            state_text: "active".into(),
            wait_event_type: None,
            wait_event_name: None,
            blocking_pid: None,
            backend_type: "client backend".into(),
        }
    }

    #[test]
    fn rolls_window_once_wall_clock_crosses_end() {
        let cfg = WindowAggregatorConfig {
            window_durations: vec![StdDuration::from_secs(60)],
            retention: StdDuration::from_secs(3600),
            top_n: 5,
        };
        let agg = WindowAggregator::new(cfg);
        let t0 = Utc::now();
        agg.ingest(&snap(t0, "q1"));
        agg.ingest(&snap(t0 + chrono::Duration::seconds(70), "q2"));

        let windows = agg.windows_for(StdDuration::from_secs(60));
        assert_eq!(windows.len(), 2);
        assert!(windows[0].closed);
        assert_eq!(windows[0].query_counts.get("q1"), Some(&1));
        assert!(!windows[1].closed);
        assert_eq!(windows[1].query_counts.get("q2"), Some(&1));
    }

    #[test]
    fn top_queries_sorted_by_frequency() {
        let cfg = WindowAggregatorConfig {
            window_durations: vec![StdDuration::from_secs(3600)],
            retention: StdDuration::from_secs(3600),
            top_n: 5,
        };
        let agg = WindowAggregator::new(cfg);
        let t0 = Utc::now();
        for _ in 0..3 {
            agg.ingest(&snap(t0, "frequent"));
        }
        agg.ingest(&snap(t0, "rare"));

        let windows = agg.windows_for(StdDuration::from_secs(3600));
        let top = windows[0].top_queries(5);
        assert_eq!(top[0], ("frequent".to_owned(), 3));
        assert_eq!(top[1], ("rare".to_owned(), 1));
    }
}
