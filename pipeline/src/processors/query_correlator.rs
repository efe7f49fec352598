use std::time::{Duration, Instant};

use async_trait::async_trait;
use bounded_map::{BoundedMap, EvictionPolicy};
use collector_common::Metrics;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pipeline_types::{AttributeValue, Attributes, DataPoint, MetricBatch};
use regex::Regex;

use crate::error::PipelineError;
use crate::processors::Processor;

const QUERY_METRIC_NAMES: &[&str] = &[
    "db.query.execution_count",
    "db.query.total_time",
    "db.query.mean_time",
];
const TABLE_METRIC_NAMES: &[&str] = &["db.table.modifications", "db.table.dead_tuples"];
const DATABASE_METRIC_NAMES: &[&str] = &["postgresql.database.backends", "db.connections.active"];

/// Extra metric names that, while not index-updating themselves, are
/// still eligible for Pass 2 enrichment (spec §4.7).
const ENRICHABLE_EXTRA_NAMES: &[&str] = &[
    "rows_returned",
    "cache_hit_ratio",
    "blocks_read",
    "blocks_hit",
    "temp_blocks",
    "io_time",
    "duration",
];

static TABLE_VERB_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:FROM|JOIN|UPDATE|INSERT INTO|DELETE FROM)\s+([A-Za-z_][A-Za-z0-9_.]*)")
        .expect("table verb pattern is valid")
});

fn is_query_metric(name: &str) -> bool {
    QUERY_METRIC_NAMES.contains(&name) || ENRICHABLE_EXTRA_NAMES.contains(&name)
}

#[derive(Debug, Clone, Default)]
struct QueryAggregate {
    last_seen: Option<Instant>,
    exec_count: u64,
    total_time: f64,
    statement_type: Option<String>,
    database: Option<String>,
    primary_table: Option<String>,
    tables: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct TableAggregate {
    modifications: u64,
    dead_tuples: u64,
    last_vacuum: Option<Instant>,
}

#[derive(Debug, Clone, Default)]
struct DatabaseAggregate {
    active_backends: u64,
    total_queries: u64,
    total_exec_time: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct QueryCorrelatorConfig {
    pub retention: Duration,
    pub slow_threshold_ms: f64,
    pub moderate_threshold_ms: f64,
    pub dead_tuples_vacuum_threshold: u64,
    pub index_cap: usize,
}

impl Default for QueryCorrelatorConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(300),
            slow_threshold_ms: 1000.0,
            moderate_threshold_ms: 100.0,
            dead_tuples_vacuum_threshold: 10_000,
            index_cap: 50_000,
        }
    }
}

impl QueryCorrelatorConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.retention.is_zero() {
            return Err(PipelineError::fatal("query_correlator.retention must be positive"));
        }
        if self.index_cap == 0 {
            return Err(PipelineError::fatal("query_correlator.index_cap must be positive"));
        }
        Ok(())
    }
}

fn fingerprint(query_text: &str) -> String {
    use md5::{Digest, Md5};
    let digest = Md5::digest(query_text.as_bytes());
    hex::encode(&digest[..8])
}

fn extract_tables(query_text: &str) -> Vec<String> {
    TABLE_VERB_PATTERN
        .captures_iter(query_text)
        .map(|c| c[1].to_owned())
        .collect()
}

/// Executes two ordered passes over a batch (spec §4.7): index, then
/// enrich. Pass 1 never reads an index it or another pass just wrote in
/// the same batch — it only accumulates. Pass 2 is strictly sequenced
/// after Pass 1 completes (spec §8 invariant 6).
pub struct QueryCorrelator {
    config: QueryCorrelatorConfig,
    query_index: BoundedMap<std::sync::Arc<Mutex<QueryAggregate>>>,
    table_index: BoundedMap<std::sync::Arc<Mutex<TableAggregate>>>,
    database_index: BoundedMap<std::sync::Arc<Mutex<DatabaseAggregate>>>,
    metrics: Metrics,
}

impl QueryCorrelator {
    pub fn new(config: QueryCorrelatorConfig, metrics: Metrics) -> Self {
        let ttl = Some(config.retention);
        Self {
            query_index: BoundedMap::new(config.index_cap, EvictionPolicy::Lru, ttl),
            table_index: BoundedMap::new(config.index_cap, EvictionPolicy::Lru, ttl),
            database_index: BoundedMap::new(config.index_cap, EvictionPolicy::Lru, ttl),
            config,
            metrics,
        }
    }

    fn query_id(point: &DataPoint) -> Option<String> {
        if let Some(id) = point.attributes.get("queryid").and_then(|v| v.as_str()) {
            return Some(id.to_owned());
        }
        point.attributes.get("query.text").and_then(|v| v.as_str()).map(fingerprint)
    }

    fn value_as_f64(point: &DataPoint) -> f64 {
        match point.value {
            pipeline_types::DataPointValue::Int(v) => v as f64,
            pipeline_types::DataPointValue::Double(v) => v,
            pipeline_types::DataPointValue::HistogramCounts(_) => 0.0,
        }
    }

    fn index_query(&self, metric_name: &str, point: &DataPoint) {
        let Some(query_id) = Self::query_id(point) else {
            return;
        };
        let entry = self
            .query_index
            .get(&query_id)
            .unwrap_or_else(|| std::sync::Arc::new(Mutex::new(QueryAggregate::default())));
        {
            let mut agg = entry.lock();
            agg.last_seen = Some(Instant::now());
            let value = Self::value_as_f64(point);
            match metric_name {
                "db.query.execution_count" => agg.exec_count += value as u64,
                "db.query.total_time" => agg.total_time += value,
                _ => {}
            }
            if let Some(st) = point.attributes.get("statement_type").and_then(|v| v.as_str()) {
                agg.statement_type = Some(st.to_owned());
            }
            if let Some(db) = point.attributes.get("database_name").and_then(|v| v.as_str()) {
                agg.database = Some(db.to_owned());
            }
            if let Some(text) = point.attributes.get("query.text").and_then(|v| v.as_str()) {
                let tables = extract_tables(text);
                if let Some(table) = tables.first() {
                    agg.primary_table = Some(table.clone());
                }
                if !tables.is_empty() {
                    agg.tables = tables;
                }
            }
        }
        self.query_index.put(query_id, entry);
    }

    fn index_table(&self, metric_name: &str, point: &DataPoint) {
        let Some(table) = point.attributes.get("table_name").and_then(|v| v.as_str()) else {
            return;
        };
        let table = table.to_owned();
        let entry = self
            .table_index
            .get(&table)
            .unwrap_or_else(|| std::sync::Arc::new(Mutex::new(TableAggregate::default())));
        {
            let mut agg = entry.lock();
            let value = Self::value_as_f64(point) as u64;
            match metric_name {
                "db.table.modifications" => agg.modifications += value,
                "db.table.dead_tuples" => agg.dead_tuples = value,
                _ => {}
            }
        }
        self.table_index.put(table, entry);
    }

    fn index_database(&self, metric_name: &str, point: &DataPoint) {
        let Some(database) = point.attributes.get("database_name").and_then(|v| v.as_str()) else {
            return;
        };
        let database = database.to_owned();
        let entry = self
            .database_index
            .get(&database)
            .unwrap_or_else(|| std::sync::Arc::new(Mutex::new(DatabaseAggregate::default())));
        {
            let mut agg = entry.lock();
            let value = Self::value_as_f64(point);
            match metric_name {
                "postgresql.database.backends" | "db.connections.active" => agg.active_backends = value as u64,
                _ => {}
            }
            agg.total_queries += 1;
            agg.total_exec_time += value;
        }
        self.database_index.put(database, entry);
    }

    fn enrich(&self, metric_name: &str, point: &mut DataPoint) {
        if !is_query_metric(metric_name) {
            return;
        }
        let Some(query_id) = Self::query_id(point) else {
            return;
        };
        let Some(query_entry) = self.query_index.get(&query_id) else {
            return;
        };
        let (statement_type, database, primary_table, tables, exec_count, total_time) = {
            let agg = query_entry.lock();
            (
                agg.statement_type.clone(),
                agg.database.clone(),
                agg.primary_table.clone(),
                agg.tables.clone(),
                agg.exec_count,
                agg.total_time,
            )
        };

        let _ = point.attributes.insert("correlation.query_id", AttributeValue::string(query_id.clone()));
        if let Some(st) = &statement_type {
            let _ = point.attributes.insert("correlation.statement_type", AttributeValue::string(st.clone()));
        }
        if let Some(db) = &database {
            let _ = point.attributes.insert("correlation.database", AttributeValue::string(db.clone()));
        }
        if let Some(table) = &primary_table {
            let _ = point.attributes.insert("correlation.table", AttributeValue::string(table.clone()));
        }
        if !tables.is_empty() {
            let _ = point.attributes.insert("correlation.tables", AttributeValue::string(tables.join(",")));
        }

        let mean_time = if exec_count > 0 { total_time / exec_count as f64 } else { total_time };
        let category = if mean_time > self.config.slow_threshold_ms {
            "slow"
        } else if mean_time > self.config.moderate_threshold_ms {
            "moderate"
        } else {
            "fast"
        };
        let _ = point.attributes.insert("performance.category", AttributeValue::string(category));

        if let Some(db_entry) = database.as_ref().and_then(|d| self.database_index.get(d)) {
            let db_total = db_entry.lock().total_exec_time;
            if db_total > 0.0 {
                let pct = (total_time / db_total) * 100.0;
                let _ = point.attributes.insert("query.load_contribution_pct", AttributeValue::Double(pct));
            }
        }

        if let Some(table) = &primary_table {
            if let Some(table_entry) = self.table_index.get(table) {
                let agg = table_entry.lock();
                let _ = point.attributes.insert("table.modifications", AttributeValue::Int(agg.modifications as i64));
                let _ = point.attributes.insert("table.dead_tuples", AttributeValue::Int(agg.dead_tuples as i64));
                if agg.dead_tuples > self.config.dead_tuples_vacuum_threshold {
                    let _ = point.attributes.insert("table.needs_vacuum", AttributeValue::Bool(true));
                }
            }
        }
    }

    /// Periodic sweep for all three indices (spec §4.7, §9's resolution
    /// of the source's ambiguous "cleanup only queryIndex" behavior).
    pub fn sweep(&self) -> (usize, usize, usize) {
        (
            self.query_index.cleanup_older_than(self.config.retention),
            self.table_index.cleanup_older_than(self.config.retention),
            self.database_index.cleanup_older_than(self.config.retention),
        )
    }
}

#[async_trait]
impl Processor for QueryCorrelator {
    fn name(&self) -> &str {
        "query_correlator"
    }

    async fn process(&self, mut batch: MetricBatch) -> Result<MetricBatch, PipelineError> {
        // Pass 1: index. Strictly precedes Pass 2 on the same batch.
        batch.for_each_data_point(|name, point| {
            if TABLE_METRIC_NAMES.contains(&name) {
                self.index_table(name, point);
            } else if DATABASE_METRIC_NAMES.contains(&name) {
                self.index_database(name, point);
            } else if QUERY_METRIC_NAMES.contains(&name) {
                self.index_query(name, point);
            }
        });

        // Pass 2: enrich.
        batch.for_each_data_point_mut(|name, point| {
            self.enrich(name, point);
        });

        self.metrics.gauge("query_correlator.query_index_size", self.query_index.len() as u64);
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_types::{DataPointValue, Metric, MetricKind, ResourceScope, ScopeGroup};

    fn point(queryid: &str, total_time_ms: f64) -> DataPoint {
        let mut attrs = Attributes::new();
        attrs.insert("queryid", AttributeValue::string(queryid)).unwrap();
        attrs.insert("execution_count", AttributeValue::Int(1)).unwrap();
        DataPoint {
            timestamp: chrono::Utc::now(),
            value: DataPointValue::Double(total_time_ms),
            attributes: attrs,
        }
    }

    fn batch_with(name: &str, points: Vec<DataPoint>) -> MetricBatch {
        MetricBatch {
            resource_scopes: vec![ResourceScope {
                resource_attributes: Attributes::new(),
                scope_groups: vec![ScopeGroup {
                    scope_name: "s".into(),
                    metrics: vec![Metric {
                        name: name.into(),
                        description: String::new(),
                        unit: "ms".into(),
                        kind: MetricKind::Gauge,
                        data_points: points,
                    }],
                }],
            }],
        }
    }

    #[tokio::test]
    async fn slow_query_is_categorized_slow_and_fast_query_is_fast() {
        let correlator = QueryCorrelator::new(
            QueryCorrelatorConfig {
                slow_threshold_ms: 1000.0,
                moderate_threshold_ms: 100.0,
                ..QueryCorrelatorConfig::default()
            },
            Metrics::noop(),
        );
        let batch = batch_with("db.query.total_time", vec![point("Q1", 5000.0), point("Q2", 50.0)]);
        let after = correlator.process(batch).await.unwrap();

        let mut categories = Vec::new();
        after.for_each_data_point(|_, p| {
            categories.push(
                p.attributes
                    .get("performance.category")
                    .and_then(|v| v.as_str())
                    .unwrap()
                    .to_owned(),
            );
        });
        assert_eq!(categories, vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn fingerprint_used_when_queryid_absent() {
        let correlator = QueryCorrelator::new(QueryCorrelatorConfig::default(), Metrics::noop());
        let mut attrs = Attributes::new();
        attrs.insert("query.text", AttributeValue::string("SELECT * FROM users")).unwrap();
        let dp = DataPoint {
            timestamp: chrono::Utc::now(),
            value: DataPointValue::Double(10.0),
            attributes: attrs,
        };
        let batch = batch_with("db.query.total_time", vec![dp]);
        let after = correlator.process(batch).await.unwrap();
        let mut found = false;
        after.for_each_data_point(|_, p| {
            if p.attributes.get("correlation.query_id").is_some() {
                found = true;
            }
            assert_eq!(p.attributes.get("correlation.table").and_then(|v| v.as_str()), Some("users"));
            assert_eq!(p.attributes.get("correlation.tables").and_then(|v| v.as_str()), Some("users"));
        });
        assert!(found);
    }

    #[tokio::test]
    async fn correlation_tables_lists_every_table_touched_by_a_join() {
        let correlator = QueryCorrelator::new(QueryCorrelatorConfig::default(), Metrics::noop());
        let mut attrs = Attributes::new();
        attrs.insert("query.text", AttributeValue::string("SELECT * FROM orders JOIN customers ON 1=1")).unwrap();
        let dp = DataPoint {
            timestamp: chrono::Utc::now(),
            value: DataPointValue::Double(10.0),
            attributes: attrs,
        };
        let batch = batch_with("db.query.total_time", vec![dp]);
        let after = correlator.process(batch).await.unwrap();
        after.for_each_data_point(|_, p| {
            assert_eq!(p.attributes.get("correlation.tables").and_then(|v| v.as_str()), Some("orders,customers"));
        });
    }

    #[test]
    fn extracts_table_names_from_common_verbs() {
        assert_eq!(extract_tables("SELECT * FROM orders JOIN customers ON 1=1"), vec!["orders", "customers"]);
        assert_eq!(extract_tables("UPDATE accounts SET x=1"), vec!["accounts"]);
        assert_eq!(extract_tables("DELETE FROM sessions"), vec!["sessions"]);
    }
}
