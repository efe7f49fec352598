//! A `cadence`-backed statsd client, wrapped the way every processor in
//! this collector reports counters, gauges, and timers.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Instant;

use cadence::{
    BufferedUdpMetricSink, Counted, Gauged, Metric, NopMetricSink, QueuingMetricSink,
    StatsdClient, Timed,
};
use slog::{Key, Record, KV};

pub use cadence::MetricError;

#[derive(Debug, Clone)]
pub struct MetricTimer {
    pub label: String,
    pub start: Instant,
    pub tags: HashMap<String, String>,
}

/// Cloneable metrics handle passed into every processor, the pool manager,
/// and the ASH sampler. Cloning shares the underlying `StatsdClient`.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub client: Option<Arc<StatsdClient>>,
    pub tags: HashMap<String, String>,
    timer: Option<MetricTimer>,
}

impl Drop for Metrics {
    fn drop(&mut self) {
        let Some(timer) = self.timer.take() else {
            return;
        };
        let Some(client) = self.client.as_ref() else {
            return;
        };
        let lapse = (Instant::now() - timer.start).as_millis() as u64;
        let mut tagged = client.time_with_tags(&timer.label, lapse);
        for (key, val) in &timer.tags {
            tagged = tagged.with_tag(key, val);
        }
        if let Err(e) = tagged.try_send() {
            warn!("metric {} error: {:?}", &timer.label, e);
        }
    }
}

impl Metrics {
    pub fn sink() -> StatsdClient {
        StatsdClient::builder("", NopMetricSink).build()
    }

    /// A metrics handle that discards everything; used in unit tests and
    /// when `--dry-run` skips standing up the real statsd client.
    pub fn noop() -> Self {
        Self {
            client: Some(Arc::new(Self::sink())),
            timer: None,
            tags: HashMap::default(),
        }
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn start_timer(&mut self, label: &str, tags: Option<HashMap<String, String>>) {
        let mut mtags = self.tags.clone();
        if let Some(t) = tags {
            mtags.extend(t);
        }
        self.timer = Some(MetricTimer {
            label: label.to_owned(),
            start: Instant::now(),
            tags: mtags,
        });
    }

    pub fn incr(&self, label: &str) {
        self.incr_with_tags(label, HashMap::default())
    }

    pub fn incr_with_tags(&self, label: &str, tags: HashMap<String, String>) {
        self.count_with_tags(label, 1, tags)
    }

    pub fn incr_with_tag(&self, label: &str, key: &str, value: &str) {
        let mut tags = HashMap::default();
        tags.insert(key.to_owned(), value.to_owned());
        self.incr_with_tags(label, tags);
    }

    pub fn count(&self, label: &str, count: i64) {
        self.count_with_tags(label, count, HashMap::default())
    }

    pub fn count_with_tags(&self, label: &str, count: i64, tags: HashMap<String, String>) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        let mut tagged = client.count_with_tags(label, count);
        let mut mtags = self.tags.clone();
        mtags.extend(tags);
        for (key, val) in &mtags {
            tagged = tagged.with_tag(key, val);
        }
        if let Err(e) = tagged.try_send() {
            warn!("metric {} error: {:?}", label, e; MetricTags(mtags));
        }
    }

    pub fn gauge(&self, label: &str, value: u64) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        if let Err(e) = client.gauge(label, value) {
            warn!("metric {} error: {:?}", label, e);
        }
    }
}

pub fn metrics_from_opts(
    label: &str,
    host: Option<&str>,
    port: u16,
) -> Result<Arc<StatsdClient>, MetricError> {
    let builder = if let Some(statsd_host) = host {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let host = (statsd_host, port);
        let udp_sink = BufferedUdpMetricSink::from(host, socket)?;
        let sink = QueuingMetricSink::from(udp_sink);
        StatsdClient::builder(label, sink)
    } else {
        StatsdClient::builder(label, NopMetricSink)
    };
    Ok(Arc::new(
        builder
            .with_error_handler(|err| {
                warn!("metric send error: {:?}", err);
            })
            .build(),
    ))
}

impl From<&Arc<StatsdClient>> for Metrics {
    fn from(client: &Arc<StatsdClient>) -> Self {
        Metrics {
            client: Some(client.clone()),
            tags: HashMap::default(),
            timer: None,
        }
    }
}

/// Newtype solely so `HashMap<String, String>` can be logged as structured
/// `slog` key-values.
struct MetricTags(HashMap<String, String>);

impl KV for MetricTags {
    fn serialize(&self, _rec: &Record<'_>, serializer: &mut dyn slog::Serializer) -> slog::Result {
        for (key, val) in &self.0 {
            serializer.emit_str(Key::from(key.clone()), val)?;
        }
        Ok(())
    }
}
