//! # Drift Monitor - Windowed Model Monitoring Engine
//!
//! Ingests a continuous stream of labeled rows for named datasets, keeps a
//! bounded recent window per dataset, periodically recomputes drift,
//! data-quality and performance metrics against a fixed reference snapshot
//! and exposes the results in Prometheus text format.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            DRIFT MONITOR ENGINE                              │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  INGEST → WINDOW BUFFER → SCHEDULE GATE → EVALUATOR → METRIC REGISTRY       │
//! │                              ↑                             ↓                │
//! │                       REFERENCE STORE                 EXPOSITION            │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Bounded Windows**: strict FIFO eviction, one window per dataset
//! - **Edge-Triggered Scheduling**: at most one evaluation per period
//! - **Dynamic Registry**: lazily created series with fixed label schemas
//! - **Reference Fingerprints**: SHA-256 content digest exported as a label
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, VecDeque};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ----------------------------------------------------------------------------
// Concurrency Primitives - Parking Lot
// ----------------------------------------------------------------------------
use parking_lot::{Mutex, RwLock};

// ----------------------------------------------------------------------------
// Lock-Free Data Structures
// ----------------------------------------------------------------------------
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};
use sha2::{Digest, Sha256};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{
    Encoder, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry as PrometheusRegistry,
    TextEncoder,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "drift-monitor";
pub const ENGINE_FULL_NAME: &str = "Drift Monitor Engine";

/// Prefix for environment variable overrides of the configuration file
pub const ENV_PREFIX: &str = "DRIFT_MONITOR_";

/// Default configuration file name
pub const DEFAULT_CONFIG_PATH: &str = "drift-monitor.toml";

// ----------------------------------------------------------------------------
// Windows & Scheduling
// ----------------------------------------------------------------------------

/// Default capacity of the current-data window (rows)
pub const DEFAULT_WINDOW_SIZE: usize = 50;

/// Default recompute period (seconds)
pub const DEFAULT_CALCULATION_PERIOD_SECS: u64 = 15;

/// Default minimum number of reference rows required at load
pub const DEFAULT_MIN_REFERENCE_SIZE: usize = 1;

/// Upper bound on window capacity accepted by configuration validation
pub const MAX_WINDOW_CAPACITY: usize = 10_000_000;

// ----------------------------------------------------------------------------
// Metric Naming
// ----------------------------------------------------------------------------

/// Namespace prepended to every evaluator metric name
pub const DEFAULT_METRIC_NAMESPACE: &str = "evidently";

/// Label injected into every published series
pub const DATASET_LABEL: &str = "dataset_name";

/// Metric carrying the reference fingerprint as a label
pub const REFERENCE_HASH_METRIC: &str = "reference_dataset_hash";

/// Label holding the reference fingerprint
pub const REFERENCE_HASH_LABEL: &str = "hash";

/// Metric carrying the auxiliary error measures
pub const LOSS_METRIC: &str = "loss_metric";

/// Label identifying the auxiliary error measure kind
pub const LOSS_FUNCTION_LABEL: &str = "loss_function";

/// Prefix of the engine's own service metrics
pub const SELF_METRICS_PREFIX: &str = "drift_monitor";

/// Default reference file name inside a dataset directory
pub const REFERENCE_FILE_NAME: &str = "reference.json";

// ----------------------------------------------------------------------------
// Evaluation
// ----------------------------------------------------------------------------

/// Normalised mean shift above which a feature counts as drifted
pub const DEFAULT_DRIFT_THRESHOLD: f64 = 0.5;

/// Share of drifted features above which the whole dataset counts as drifted
pub const DEFAULT_DATASET_DRIFT_SHARE: f64 = 0.5;

/// Total variation distance above which a categorical column counts as drifted
pub const DEFAULT_CATEGORY_DRIFT_THRESHOLD: f64 = 0.2;

/// Standard deviations below this are treated as zero
pub const STD_EPSILON: f64 = 1e-12;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Timestamp Types
// ----------------------------------------------------------------------------

/// Timestamp in nanoseconds since Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    #[inline]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000_000)
    }

    #[inline]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * 1_000_000_000)
    }

    /// Current wall-clock time
    #[inline]
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn as_secs(&self) -> i64 {
        self.0 / 1_000_000_000
    }

    /// Duration between two timestamps, zero if `earlier` is in the future
    #[inline]
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let nanos = self.0.saturating_sub(earlier.0);
        Duration::from_nanos(nanos.max(0) as u64)
    }

    #[inline]
    pub fn add_duration(&self, duration: Duration) -> Self {
        let delta = duration.as_nanos().min(i64::MAX as u128) as i64;
        Self(self.0.saturating_add(delta))
    }

    #[inline]
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000_000);
        let nanos = self.0.rem_euclid(1_000_000_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    pub const EPOCH: Timestamp = Timestamp(0);
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl From<SystemTime> for Timestamp {
    fn from(st: SystemTime) -> Self {
        let duration = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self(duration.as_nanos() as i64)
    }
}

/// Atomic timestamp for lock-free reads and writes
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicTimestamp(AtomicI64);

impl AtomicTimestamp {
    #[inline]
    pub const fn new(ts: Timestamp) -> Self {
        Self(AtomicI64::new(ts.0))
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Timestamp {
        Timestamp(self.0.load(ordering))
    }

    #[inline]
    pub fn store(&self, ts: Timestamp, ordering: AtomicOrdering) {
        self.0.store(ts.0, ordering);
    }

    /// Move the timestamp forward by `by`, returning the new value
    #[inline]
    pub fn advance(&self, by: Duration) -> Timestamp {
        let delta = by.as_nanos().min(i64::MAX as u128) as i64;
        Timestamp(self.0.fetch_add(delta, AtomicOrdering::AcqRel).saturating_add(delta))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Clocks
// ----------------------------------------------------------------------------

/// Source of "now" for the scheduling gate.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A clock that only moves when told to. Used to drive the schedule
/// deterministically from tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    current: AtomicTimestamp,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: AtomicTimestamp::new(start),
        }
    }

    pub fn advance(&self, by: Duration) -> Timestamp {
        self.current.advance(by)
    }

    pub fn set(&self, ts: Timestamp) {
        self.current.store(ts, AtomicOrdering::Release);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> Timestamp {
        self.current.load(AtomicOrdering::Acquire)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Records - One Row of Labeled Data
// ----------------------------------------------------------------------------

/// A single data row. Columns are kept sorted by name so that the
/// serialized form of a record is canonical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, JsonValue>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set a column
    pub fn with<K, V>(mut self, column: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<JsonValue>,
    {
        self.0.insert(column.into(), value.into());
        self
    }

    pub fn insert<K, V>(&mut self, column: K, value: V) -> Option<JsonValue>
    where
        K: Into<String>,
        V: Into<JsonValue>,
    {
        self.0.insert(column.into(), value.into())
    }

    /// Convert a JSON object into a record; anything else is rejected.
    pub fn from_json(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(map) => Some(Self(map.into_iter().collect())),
            _ => None,
        }
    }

    #[inline]
    pub fn get(&self, column: &str) -> Option<&JsonValue> {
        self.0.get(column)
    }

    /// Numeric view of a column. Booleans count as 0/1; strings are not coerced.
    pub fn get_f64(&self, column: &str) -> Option<f64> {
        match self.0.get(column)? {
            JsonValue::Number(n) => n.as_f64(),
            JsonValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// True when the column is absent or null
    pub fn is_missing(&self, column: &str) -> bool {
        matches!(self.0.get(column), None | Some(JsonValue::Null))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Canonical byte form used for content hashing.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        // BTreeMap keys serialize in sorted order; nested objects are
        // serde_json maps, which are sorted as well.
        serde_json::to_vec(&self.0).unwrap_or_default()
    }
}

impl FromIterator<(String, JsonValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ----------------------------------------------------------------------------
// 3.4 Labels - Key-Value Dimensional Data
// ----------------------------------------------------------------------------

/// A single label (key-value pair) on a metric triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub key: CompactString,
    pub value: CompactString,
}

impl Label {
    #[inline]
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl<K, V> From<(K, V)> for Label
where
    K: Into<CompactString>,
    V: Into<CompactString>,
{
    fn from((key, value): (K, V)) -> Self {
        Self::new(key, value)
    }
}

/// Most triples carry one or two labels, so keep them on the stack.
pub type Labels = SmallVec<[Label; 8]>;

/// Extension trait for Labels
pub trait LabelsExt {
    fn get(&self, key: &str) -> Option<&str>;

    fn contains_key(&self, key: &str) -> bool;

    /// Add or replace a label
    fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>;

    /// Sorted, de-duplicated view; the last occurrence of a key wins.
    fn to_sorted_map(&self) -> BTreeMap<CompactString, CompactString>;
}

impl LabelsExt for Labels {
    fn get(&self, key: &str) -> Option<&str> {
        self.iter()
            .rev()
            .find(|l| l.key.as_str() == key)
            .map(|l| l.value.as_str())
    }

    fn contains_key(&self, key: &str) -> bool {
        self.iter().any(|l| l.key.as_str() == key)
    }

    fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        let key = key.into();
        let value = value.into();

        if let Some(label) = self.iter_mut().find(|l| l.key == key) {
            label.value = value;
        } else {
            self.push(Label { key, value });
        }
    }

    fn to_sorted_map(&self) -> BTreeMap<CompactString, CompactString> {
        self.iter()
            .map(|l| (l.key.clone(), l.value.clone()))
            .collect()
    }
}

/// Create a Labels collection from key-value pairs
#[macro_export]
macro_rules! labels {
    () => {
        $crate::Labels::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut labels = $crate::Labels::new();
        $(labels.push($crate::Label::new($key, $value));)+
        labels
    }};
}

// ----------------------------------------------------------------------------
// 3.5 Metric Values
// ----------------------------------------------------------------------------

/// Value carried by a metric triple. Only numeric variants can be exported.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum MetricValue {
    Gauge(f64),
    GaugeInt(i64),
    Boolean(bool),
    /// Free text produced by some monitors (e.g. a detected type name)
    Text(CompactString),
    #[default]
    None,
}

impl MetricValue {
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Gauge(v) => Some(*v),
            MetricValue::GaugeInt(v) => Some(*v as f64),
            MetricValue::Boolean(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    #[inline]
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            MetricValue::Gauge(_) | MetricValue::GaugeInt(_) | MetricValue::Boolean(_)
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            MetricValue::Gauge(_) => "gauge",
            MetricValue::GaugeInt(_) => "gauge_int",
            MetricValue::Boolean(_) => "boolean",
            MetricValue::Text(_) => "text",
            MetricValue::None => "none",
        }
    }
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(v) => write!(f, "{:.6}", v),
            MetricValue::GaugeInt(v) => write!(f, "{}", v),
            MetricValue::Boolean(v) => write!(f, "{}", v),
            MetricValue::Text(s) => write!(f, "\"{}\"", s),
            MetricValue::None => write!(f, "none"),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Gauge(v)
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::GaugeInt(v)
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::GaugeInt(v as i64)
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Boolean(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        MetricValue::Text(CompactString::from(v))
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        MetricValue::Text(CompactString::from(v))
    }
}

// ----------------------------------------------------------------------------
// 3.6 Metric Triples - What Evaluators Produce
// ----------------------------------------------------------------------------

/// One (name, value, labels) observation produced by an evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricTriple {
    /// Metric name without namespace (e.g. "data_drift:share_drifted_features")
    pub name: CompactString,
    pub value: MetricValue,
    pub labels: Labels,
}

impl MetricTriple {
    pub fn new<N, V>(name: N, value: V) -> Self
    where
        N: Into<CompactString>,
        V: Into<MetricValue>,
    {
        Self {
            name: name.into(),
            value: value.into(),
            labels: Labels::new(),
        }
    }

    pub fn gauge<N: Into<CompactString>>(name: N, value: f64) -> Self {
        Self::new(name, MetricValue::Gauge(value))
    }

    /// Builder: add a single label
    pub fn with_label<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<CompactString>,
        V: Into<CompactString>,
    {
        self.labels.set(key, value);
        self
    }

    /// Builder: set all labels
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }
}

impl Display for MetricTriple {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.name)?;
        for (i, label) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}=\"{}\"", label.key, label.value)?;
        }
        write!(f, "}} {}", self.value)
    }
}

// ----------------------------------------------------------------------------
// 3.7 Monitor Kinds & Column Roles
// ----------------------------------------------------------------------------

/// The monitors a dataset can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorKind {
    CatTargetDrift,
    DataDrift,
    DataQuality,
    NumTargetDrift,
    RegressionPerformance,
    ClassificationPerformance,
    ProbClassificationPerformance,
}

impl MonitorKind {
    pub const ALL: [MonitorKind; 7] = [
        MonitorKind::CatTargetDrift,
        MonitorKind::DataDrift,
        MonitorKind::DataQuality,
        MonitorKind::NumTargetDrift,
        MonitorKind::RegressionPerformance,
        MonitorKind::ClassificationPerformance,
        MonitorKind::ProbClassificationPerformance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorKind::CatTargetDrift => "cat_target_drift",
            MonitorKind::DataDrift => "data_drift",
            MonitorKind::DataQuality => "data_quality",
            MonitorKind::NumTargetDrift => "num_target_drift",
            MonitorKind::RegressionPerformance => "regression_performance",
            MonitorKind::ClassificationPerformance => "classification_performance",
            MonitorKind::ProbClassificationPerformance => "prob_classification_performance",
        }
    }
}

impl Display for MonitorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MonitorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MonitorKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownMonitor { name: s.to_string() })
    }
}

/// Which columns play which role in a dataset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    #[serde(default)]
    pub target: Option<String>,

    #[serde(default)]
    pub prediction: Option<String>,

    #[serde(default)]
    pub datetime: Option<String>,

    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub numerical_features: Vec<String>,

    #[serde(default)]
    pub categorical_features: Vec<String>,
}

impl ColumnMapping {
    /// Every column with a role, in a stable order: features first, then
    /// target and prediction.
    pub fn monitored_columns(&self) -> Vec<&str> {
        let mut seen = AHashSet::new();
        self.numerical_features
            .iter()
            .chain(self.categorical_features.iter())
            .chain(self.target.iter())
            .chain(self.prediction.iter())
            .map(String::as_str)
            .filter(|c| seen.insert(*c))
            .collect()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Only an unknown dataset ever fails an ingest. Everything below the
// orchestrator is absorbed locally: logged, counted and skipped.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Engine Errors
// ----------------------------------------------------------------------------

/// The main error type of the monitoring engine.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Unknown dataset: {name}")]
    UnknownDataset { name: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Loader error: {0}")]
    Loader(#[from] LoaderError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MonitorError {
    pub fn unknown_dataset(name: impl Into<String>) -> Self {
        MonitorError::UnknownDataset { name: name.into() }
    }

    /// Whether the caller can keep going after this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            MonitorError::UnknownDataset { .. } => true,
            MonitorError::Config(_) => false,
            MonitorError::Loader(_) => false,
            MonitorError::Metrics(_) => false,
            MonitorError::Io(_) => true,
            MonitorError::Internal(_) => false,
        }
    }

    /// Error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            MonitorError::UnknownDataset { .. } => "unknown_dataset",
            MonitorError::Config(_) => "config",
            MonitorError::Loader(_) => "loader",
            MonitorError::Metrics(_) => "metrics",
            MonitorError::Io(_) => "io",
            MonitorError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Unknown monitor kind: {name}")]
    UnknownMonitor { name: String },

    #[error("Dataset '{name}' is defined more than once")]
    DuplicateDataset { name: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Loader Errors
// ----------------------------------------------------------------------------

/// Errors raised while loading a reference snapshot
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Failed to read reference for '{dataset}' from {path}: {source}")]
    Io {
        dataset: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse reference for '{dataset}' (line {line}): {message}")]
    Parse {
        dataset: String,
        line: usize,
        message: String,
    },

    #[error("Reference for '{dataset}' has {rows} rows, at least {required} required")]
    TooSmall {
        dataset: String,
        rows: usize,
        required: usize,
    },
}

// ----------------------------------------------------------------------------
// 4.4 Registry Errors
// ----------------------------------------------------------------------------

/// Per-triple publish failures. Never abort a batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Metric '{metric}' has non-numeric value of type {value_type}")]
    NonNumericValue {
        metric: String,
        value_type: &'static str,
    },

    #[error("Metric '{metric}' expects labels {expected:?}, got {found:?}")]
    SchemaMismatch {
        metric: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("Metric '{metric}' cannot be exported: {message}")]
    InvalidMetric { metric: String, message: String },
}

impl RegistryError {
    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::NonNumericValue { .. } => "non_numeric",
            RegistryError::SchemaMismatch { .. } => "schema_mismatch",
            RegistryError::InvalidMetric { .. } => "invalid_metric",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Evaluation & Measure Errors
// ----------------------------------------------------------------------------

/// Failure of the metric evaluator collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Monitor '{monitor}' failed: {message}")]
    MonitorFailed { monitor: MonitorKind, message: String },

    #[error("Evaluation failed: {0}")]
    Other(String),
}

/// Failure of an auxiliary error measure. Local to the measures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeasureError {
    #[error("Column '{column}' is missing from {missing_rows} window rows")]
    InsufficientColumns { column: String, missing_rows: usize },

    #[error("No {role} column is configured")]
    MissingRole { role: &'static str },
}

/// A replay line that cannot be turned into an ingest event
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplayError {
    #[error("Invalid JSON: {message}")]
    InvalidJson { message: String },

    #[error("Bare rows need a default dataset (--dataset)")]
    MissingDataset,

    #[error("Row {index} is not a JSON object")]
    NotAnObject { index: usize },
}

impl From<serde_json::Error> for ReplayError {
    fn from(e: serde_json::Error) -> Self {
        ReplayError::InvalidJson {
            message: e.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.6 Result Type Aliases
// ----------------------------------------------------------------------------

/// Result type for engine operations
pub type MonitorResult<T> = Result<T, MonitorError>;

/// Result type for a single registry write
pub type RegistryResult<T> = Result<T, RegistryError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file, `DRIFT_MONITOR_` environment overrides, serde defaults.
// Loaded once at startup and never reloaded.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the monitoring service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Service-wide settings and per-dataset defaults
    #[serde(default)]
    pub service: ServiceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Monitored datasets by name
    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetConfig>,
}

impl MonitorConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and merge the file and environment without validating, so the
    /// caller can set up logging before validation warnings are emitted.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Load from string (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service.calculation_period.is_zero() {
            return Err(ConfigError::invalid_value(
                "service.calculation_period",
                "Calculation period must be greater than zero",
            ));
        }

        for (name, dataset) in &self.datasets {
            if name.is_empty() {
                return Err(ConfigError::invalid_value(
                    "datasets",
                    "Dataset names must not be empty",
                ));
            }

            let settings = dataset.window_settings(&self.service);
            let field = |suffix: &str| format!("datasets.{}.{}", name, suffix);

            if settings.capacity == 0 || settings.capacity > MAX_WINDOW_CAPACITY {
                return Err(ConfigError::invalid_value(
                    field("window_capacity"),
                    format!("Window capacity must be within 1..={}", MAX_WINDOW_CAPACITY),
                ));
            }

            if settings.min_size == 0 || settings.min_size > settings.capacity {
                return Err(ConfigError::invalid_value(
                    field("min_window_size"),
                    format!(
                        "Minimum window size must be within 1..={} (the window capacity)",
                        settings.capacity
                    ),
                ));
            }

            if settings.period.is_zero() {
                return Err(ConfigError::invalid_value(
                    field("recompute_period"),
                    "Recompute period must be greater than zero",
                ));
            }

            if dataset.monitors.is_empty() {
                warn!(
                    target: "drift_monitor::config",
                    dataset = %name,
                    "Dataset has no monitors configured; only auxiliary metrics will be published"
                );
            }
        }

        Ok(())
    }

    /// Example configuration with a single `cars` dataset
    pub fn example() -> Self {
        let mut datasets = BTreeMap::new();
        datasets.insert(
            "cars".to_string(),
            DatasetConfig {
                reference_path: None,
                monitors: vec![
                    MonitorKind::DataDrift,
                    MonitorKind::DataQuality,
                    MonitorKind::RegressionPerformance,
                ],
                column_mapping: ColumnMapping {
                    target: Some("price".into()),
                    prediction: Some("prediction".into()),
                    datetime: None,
                    id: None,
                    numerical_features: vec!["year".into(), "km_driven".into()],
                    categorical_features: vec!["model".into(), "fuels".into()],
                },
                window_capacity: None,
                min_window_size: None,
                recompute_period: Some(Duration::from_secs(60)),
                compute_auxiliary_error_measures: true,
            },
        );

        Self {
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
            datasets,
        }
    }

    /// Render the example configuration as TOML
    pub fn generate_default_config() -> Result<String, ConfigError> {
        toml::to_string_pretty(&Self::example()).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Where the reference snapshot for `dataset` lives
    pub fn reference_path(&self, name: &str, dataset: &DatasetConfig) -> PathBuf {
        dataset
            .reference_path
            .clone()
            .unwrap_or_else(|| self.service.datasets_path.join(name).join(REFERENCE_FILE_NAME))
    }
}

// ----------------------------------------------------------------------------
// 5.2 Service Configuration
// ----------------------------------------------------------------------------

/// Service-wide settings. Window settings here are defaults that a dataset
/// may override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding one sub-directory per dataset
    #[serde(default = "default_datasets_path")]
    pub datasets_path: PathBuf,

    /// Default window capacity
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Default minimum window size (defaults to the window capacity)
    #[serde(default)]
    pub min_window_size: Option<usize>,

    /// Default recompute period
    #[serde(default = "default_calculation_period", with = "humantime_serde")]
    pub calculation_period: Duration,

    /// Minimum reference rows accepted at load
    #[serde(default = "default_min_reference_size")]
    pub min_reference_size: usize,

    /// Namespace prepended to evaluator metric names
    #[serde(default = "default_namespace")]
    pub metric_namespace: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            datasets_path: default_datasets_path(),
            window_size: default_window_size(),
            min_window_size: None,
            calculation_period: default_calculation_period(),
            min_reference_size: default_min_reference_size(),
            metric_namespace: default_namespace(),
        }
    }
}

fn default_datasets_path() -> PathBuf {
    PathBuf::from("datasets")
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

fn default_calculation_period() -> Duration {
    Duration::from_secs(DEFAULT_CALCULATION_PERIOD_SECS)
}

fn default_min_reference_size() -> usize {
    DEFAULT_MIN_REFERENCE_SIZE
}

fn default_namespace() -> String {
    DEFAULT_METRIC_NAMESPACE.into()
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 5.3 Dataset Configuration
// ----------------------------------------------------------------------------

/// Configuration of one monitored dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Explicit reference file (defaults to `<datasets_path>/<name>/reference.json`)
    #[serde(default)]
    pub reference_path: Option<PathBuf>,

    #[serde(default)]
    pub monitors: Vec<MonitorKind>,

    #[serde(default)]
    pub column_mapping: ColumnMapping,

    #[serde(default)]
    pub window_capacity: Option<usize>,

    #[serde(default)]
    pub min_window_size: Option<usize>,

    #[serde(default, with = "humantime_serde")]
    pub recompute_period: Option<Duration>,

    /// Publish RMSE/MAE between target and prediction
    #[serde(default = "default_true")]
    pub compute_auxiliary_error_measures: bool,
}

impl DatasetConfig {
    /// Resolve window settings against the service defaults
    pub fn window_settings(&self, service: &ServiceConfig) -> WindowSettings {
        let capacity = self.window_capacity.unwrap_or(service.window_size);
        let min_size = self
            .min_window_size
            .or(service.min_window_size)
            .unwrap_or(capacity);

        WindowSettings {
            capacity,
            min_size,
            period: self.recompute_period.unwrap_or(service.calculation_period),
            auxiliary_error_measures: self.compute_auxiliary_error_measures,
        }
    }
}

/// Effective per-dataset window and schedule settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSettings {
    pub capacity: usize,
    pub min_size: usize,
    pub period: Duration,
    pub auxiliary_error_measures: bool,
}

impl WindowSettings {
    pub fn new(capacity: usize, min_size: usize, period: Duration) -> Self {
        Self {
            capacity,
            min_size,
            period,
            auxiliary_error_measures: true,
        }
    }

    pub fn with_auxiliary_error_measures(mut self, enabled: bool) -> Self {
        self.auxiliary_error_measures = enabled;
        self
    }
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> MonitorResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| MonitorError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| MonitorError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| MonitorError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "drift_monitor::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: WINDOW BUFFER
// ============================================================================
// Bounded, append-only-with-eviction buffer of current rows. The oldest rows
// are evicted first; surviving rows keep their arrival order.
// ============================================================================

/// Per-dataset FIFO window of the most recent rows.
#[derive(Debug, Clone, Default)]
pub struct WindowBuffer {
    rows: VecDeque<Record>,
    /// Total rows ever appended
    appended: u64,
    /// Total rows ever evicted by `trim`
    evicted: u64,
}

impl WindowBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rows: VecDeque::with_capacity(capacity),
            appended: 0,
            evicted: 0,
        }
    }

    /// Append rows to the tail in arrival order.
    pub fn append<I>(&mut self, rows: I)
    where
        I: IntoIterator<Item = Record>,
    {
        let before = self.rows.len();
        self.rows.extend(rows);
        self.appended += (self.rows.len() - before) as u64;
    }

    /// Drop rows from the head until at most `capacity` remain.
    /// Returns the number of evicted rows.
    pub fn trim(&mut self, capacity: usize) -> usize {
        let excess = self.rows.len().saturating_sub(capacity);
        if excess > 0 {
            self.rows.drain(..excess);
            self.evicted += excess as u64;
        }
        excess
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Contiguous view of the window, oldest row first.
    pub fn as_slice(&mut self) -> &[Record] {
        self.rows.make_contiguous()
    }

    /// Owned copy of the window, oldest row first.
    pub fn snapshot(&self) -> Vec<Record> {
        self.rows.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.rows.iter()
    }

    pub fn oldest(&self) -> Option<&Record> {
        self.rows.front()
    }

    pub fn newest(&self) -> Option<&Record> {
        self.rows.back()
    }

    pub fn total_appended(&self) -> u64 {
        self.appended
    }

    pub fn total_evicted(&self) -> u64 {
        self.evicted
    }
}

// ============================================================================
// SECTION 8: SCHEDULE GATE
// ============================================================================
// Uninitialized → Waiting → Due → (arm) → Waiting.
// The gate is edge-triggered: a due check only repeats once armed again.
// ============================================================================

/// Observable state of a schedule gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateState {
    /// No run has happened yet
    Uninitialized,
    /// A run is scheduled for the future
    Waiting,
    /// The scheduled time has passed
    Due,
}

impl Display for GateState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            GateState::Uninitialized => write!(f, "uninitialized"),
            GateState::Waiting => write!(f, "waiting"),
            GateState::Due => write!(f, "due"),
        }
    }
}

/// Per-dataset timer deciding whether a recompute is due.
#[derive(Debug, Clone)]
pub struct ScheduleGate {
    next_eligible: Option<Timestamp>,
    period: Duration,
}

impl ScheduleGate {
    pub fn new(period: Duration) -> Self {
        Self {
            next_eligible: None,
            period,
        }
    }

    /// Whether an evaluation should run now. Insufficient data is never due.
    pub fn is_due(&self, now: Timestamp, current_size: usize, min_size: usize) -> bool {
        if current_size < min_size {
            return false;
        }

        match self.next_eligible {
            None => true,
            Some(next) => now >= next,
        }
    }

    /// Commit a run at `now`; the next run becomes eligible one period later.
    pub fn arm(&mut self, now: Timestamp) -> Timestamp {
        let next = now.add_duration(self.period);
        self.next_eligible = Some(next);
        next
    }

    pub fn next_eligible(&self) -> Option<Timestamp> {
        self.next_eligible
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn state(&self, now: Timestamp) -> GateState {
        match self.next_eligible {
            None => GateState::Uninitialized,
            Some(next) if now < next => GateState::Waiting,
            Some(_) => GateState::Due,
        }
    }
}

// ============================================================================
// SECTION 9: REFERENCE STORE & LOADER
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Reference Store
// ----------------------------------------------------------------------------

/// Immutable reference snapshot and its content fingerprint.
#[derive(Debug, Clone)]
pub struct ReferenceStore {
    rows: Arc<[Record]>,
    fingerprint: CompactString,
    loaded_at: Timestamp,
}

impl ReferenceStore {
    /// Store the rows and compute the fingerprint once.
    pub fn load(rows: Vec<Record>) -> Self {
        let fingerprint = Self::compute_fingerprint(&rows);
        Self {
            rows: rows.into(),
            fingerprint,
            loaded_at: Timestamp::now(),
        }
    }

    /// SHA-256 over each row's canonical JSON, in row order, `\n`-separated.
    pub fn compute_fingerprint(rows: &[Record]) -> CompactString {
        let mut hasher = Sha256::new();
        for row in rows {
            hasher.update(row.canonical_bytes());
            hasher.update(b"\n");
        }
        CompactString::from(hex::encode(hasher.finalize()))
    }

    #[inline]
    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    #[inline]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn loaded_at(&self) -> Timestamp {
        self.loaded_at
    }

    /// Constant-valued triple exposing the fingerprint as a label.
    pub fn fingerprint_triple(&self) -> MetricTriple {
        MetricTriple::gauge(REFERENCE_HASH_METRIC, 1.0)
            .with_label(REFERENCE_HASH_LABEL, self.fingerprint.clone())
    }
}

// ----------------------------------------------------------------------------
// 9.2 Reference Loader
// ----------------------------------------------------------------------------

/// Supplies parsed reference rows at startup.
pub trait ReferenceLoader: Send + Sync + Debug {
    fn load(&self, dataset: &str, path: &Path) -> Result<Vec<Record>, LoaderError>;
}

/// Reads either a JSON array of objects or newline-delimited JSON objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonReferenceLoader;

impl JsonReferenceLoader {
    pub fn parse(dataset: &str, content: &str) -> Result<Vec<Record>, LoaderError> {
        let trimmed = content.trim_start();

        if trimmed.starts_with('[') {
            return serde_json::from_str::<Vec<Record>>(trimmed).map_err(|e| LoaderError::Parse {
                dataset: dataset.to_string(),
                line: e.line(),
                message: e.to_string(),
            });
        }

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str::<Record>(line).map_err(|e| LoaderError::Parse {
                    dataset: dataset.to_string(),
                    line: idx + 1,
                    message: e.to_string(),
                })
            })
            .collect()
    }
}

impl ReferenceLoader for JsonReferenceLoader {
    fn load(&self, dataset: &str, path: &Path) -> Result<Vec<Record>, LoaderError> {
        let content = fs::read_to_string(path).map_err(|source| LoaderError::Io {
            dataset: dataset.to_string(),
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(dataset, &content)
    }
}

/// Log dataset directories that exist on disk but are not configured.
/// Returns their names.
pub fn discover_unconfigured(config: &MonitorConfig) -> Vec<String> {
    let entries = match fs::read_dir(&config.service.datasets_path) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(
                target: "drift_monitor::loader",
                path = %config.service.datasets_path.display(),
                error = %e,
                "Datasets directory not readable, skipping discovery"
            );
            return Vec::new();
        }
    };

    let mut unconfigured: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| !config.datasets.contains_key(name))
        .collect();
    unconfigured.sort();

    for name in &unconfigured {
        info!(
            target: "drift_monitor::loader",
            dataset = %name,
            "Dataset is not configured in the config file"
        );
    }

    unconfigured
}

// ============================================================================
// SECTION 10: METRIC EVALUATOR
// ============================================================================
// The evaluator is an external collaborator: given the reference snapshot,
// the current window, the column roles and the configured monitors it
// returns metric triples. It must be deterministic for identical inputs.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Evaluator Trait
// ----------------------------------------------------------------------------

/// Produces metric triples from a (reference, window) pair.
pub trait MetricEvaluator: Send + Sync + Debug {
    /// Short name used in logs
    fn name(&self) -> &str;

    fn evaluate(
        &self,
        reference: &[Record],
        current: &[Record],
        columns: &ColumnMapping,
        monitors: &[MonitorKind],
    ) -> Result<Vec<MetricTriple>, EvaluationError>;
}

// ----------------------------------------------------------------------------
// 10.2 Column Statistics
// ----------------------------------------------------------------------------

/// Summary of one numeric column over a set of rows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ColumnSummary {
    /// Rows with a numeric value
    pub count: usize,
    /// Rows where the column is absent or null
    pub missing: usize,
    pub mean: Option<f64>,
    /// Population standard deviation
    pub std: Option<f64>,
}

impl ColumnSummary {
    /// Welford's online mean/variance over the numeric values of `column`.
    pub fn of(rows: &[Record], column: &str) -> Self {
        let mut count = 0usize;
        let mut missing = 0usize;
        let mut mean = 0.0f64;
        let mut m2 = 0.0f64;

        for row in rows {
            if row.is_missing(column) {
                missing += 1;
                continue;
            }
            if let Some(value) = row.get_f64(column) {
                count += 1;
                let delta = value - mean;
                mean += delta / count as f64;
                m2 += delta * (value - mean);
            }
        }

        if count == 0 {
            return Self {
                count,
                missing,
                mean: None,
                std: None,
            };
        }

        Self {
            count,
            missing,
            mean: Some(mean),
            std: Some((m2 / count as f64).sqrt()),
        }
    }
}

/// Share of each category of `column`. Missing values are excluded.
pub fn category_shares(rows: &[Record], column: &str) -> BTreeMap<String, f64> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total = 0usize;

    for row in rows {
        let key = match row.get(column) {
            None | Some(JsonValue::Null) => continue,
            Some(JsonValue::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        *counts.entry(key).or_default() += 1;
        total += 1;
    }

    counts
        .into_iter()
        .map(|(k, c)| (k, c as f64 / total as f64))
        .collect()
}

/// Total variation distance between two categorical distributions.
/// `None` if either side is empty.
pub fn total_variation(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }

    let diff: f64 = a
        .keys()
        .chain(b.keys().filter(|k| !a.contains_key(*k)))
        .map(|k| (a.get(k).copied().unwrap_or(0.0) - b.get(k).copied().unwrap_or(0.0)).abs())
        .sum();

    Some(0.5 * diff)
}

/// Mean shift of `current` relative to `reference`, in reference standard
/// deviations. Falls back to the raw shift for constant reference columns.
pub fn normalized_mean_shift(reference: &ColumnSummary, current: &ColumnSummary) -> Option<f64> {
    let shift = (current.mean? - reference.mean?).abs();
    match reference.std {
        Some(std) if std > STD_EPSILON => Some(shift / std),
        _ => Some(shift),
    }
}

// ----------------------------------------------------------------------------
// 10.3 Summary Statistics Evaluator
// ----------------------------------------------------------------------------

/// A small deterministic evaluator built on column summaries.
///
/// It is not a statistical test suite; it gives every monitor kind a cheap,
/// reproducible signal so the engine can run end to end.
#[derive(Debug, Clone)]
pub struct SummaryStatsEvaluator {
    pub drift_threshold: f64,
    pub category_drift_threshold: f64,
    pub dataset_drift_share: f64,
}

impl Default for SummaryStatsEvaluator {
    fn default() -> Self {
        Self {
            drift_threshold: DEFAULT_DRIFT_THRESHOLD,
            category_drift_threshold: DEFAULT_CATEGORY_DRIFT_THRESHOLD,
            dataset_drift_share: DEFAULT_DATASET_DRIFT_SHARE,
        }
    }
}

impl SummaryStatsEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn data_drift(
        &self,
        reference: &[Record],
        current: &[Record],
        columns: &ColumnMapping,
        out: &mut Vec<MetricTriple>,
    ) {
        let mut checked = 0usize;
        let mut drifted = 0usize;

        for feature in &columns.numerical_features {
            let shift = normalized_mean_shift(
                &ColumnSummary::of(reference, feature),
                &ColumnSummary::of(current, feature),
            );
            let Some(shift) = shift else {
                debug!(
                    target: "drift_monitor::evaluator",
                    feature = %feature,
                    "No numeric values for feature, skipping drift check"
                );
                continue;
            };

            checked += 1;
            if shift > self.drift_threshold {
                drifted += 1;
            }
            out.push(
                MetricTriple::gauge("data_drift:mean_shift", shift)
                    .with_label("feature", feature.as_str())
                    .with_label("feature_type", "num"),
            );
        }

        for feature in &columns.categorical_features {
            let distance = total_variation(
                &category_shares(reference, feature),
                &category_shares(current, feature),
            );
            let Some(distance) = distance else {
                continue;
            };

            checked += 1;
            if distance > self.category_drift_threshold {
                drifted += 1;
            }
            out.push(
                MetricTriple::gauge("data_drift:distribution_distance", distance)
                    .with_label("feature", feature.as_str())
                    .with_label("feature_type", "cat"),
            );
        }

        let share = if checked == 0 {
            0.0
        } else {
            drifted as f64 / checked as f64
        };

        out.push(MetricTriple::new("data_drift:n_drifted_features", drifted));
        out.push(MetricTriple::gauge("data_drift:share_drifted_features", share));
        out.push(MetricTriple::new(
            "data_drift:dataset_drift",
            checked > 0 && share >= self.dataset_drift_share,
        ));
    }

    fn data_quality(
        &self,
        reference: &[Record],
        current: &[Record],
        columns: &ColumnMapping,
        out: &mut Vec<MetricTriple>,
    ) {
        for (dataset, rows) in [("reference", reference), ("current", current)] {
            out.push(
                MetricTriple::new("data_quality:row_count", rows.len())
                    .with_label("dataset", dataset),
            );

            if rows.is_empty() {
                continue;
            }

            for column in columns.monitored_columns() {
                let missing = rows.iter().filter(|r| r.is_missing(column)).count();
                out.push(
                    MetricTriple::gauge("data_quality:missing_share", missing as f64 / rows.len() as f64)
                        .with_label("feature", column)
                        .with_label("dataset", dataset),
                );
            }

            for feature in &columns.numerical_features {
                if let Some(mean) = ColumnSummary::of(rows, feature).mean {
                    out.push(
                        MetricTriple::gauge("data_quality:feature_mean", mean)
                            .with_label("feature", feature.as_str())
                            .with_label("dataset", dataset),
                    );
                }
            }
        }
    }

    fn num_target_drift(
        &self,
        reference: &[Record],
        current: &[Record],
        columns: &ColumnMapping,
        out: &mut Vec<MetricTriple>,
    ) {
        for (role, column) in target_and_prediction(columns) {
            let shift = normalized_mean_shift(
                &ColumnSummary::of(reference, column),
                &ColumnSummary::of(current, column),
            );
            if let Some(shift) = shift {
                out.push(
                    MetricTriple::gauge("num_target_drift:mean_shift", shift)
                        .with_label("feature", column)
                        .with_label("role", role),
                );
            }
        }
    }

    fn cat_target_drift(
        &self,
        reference: &[Record],
        current: &[Record],
        columns: &ColumnMapping,
        out: &mut Vec<MetricTriple>,
    ) {
        for (role, column) in target_and_prediction(columns) {
            let distance = total_variation(
                &category_shares(reference, column),
                &category_shares(current, column),
            );
            if let Some(distance) = distance {
                out.push(
                    MetricTriple::gauge("cat_target_drift:distribution_distance", distance)
                        .with_label("feature", column)
                        .with_label("role", role),
                );
            }
        }
    }

    fn regression_performance(
        &self,
        reference: &[Record],
        current: &[Record],
        columns: &ColumnMapping,
        out: &mut Vec<MetricTriple>,
    ) {
        let (Some(target), Some(prediction)) = (&columns.target, &columns.prediction) else {
            debug!(
                target: "drift_monitor::evaluator",
                "regression_performance needs target and prediction columns"
            );
            return;
        };

        for (dataset, rows) in [("reference", reference), ("current", current)] {
            let errors: Vec<f64> = rows
                .iter()
                .filter_map(|r| Some(r.get_f64(prediction)? - r.get_f64(target)?))
                .collect();
            if errors.is_empty() {
                continue;
            }

            let n = errors.len() as f64;
            out.push(
                MetricTriple::gauge("regression_performance:mean_error", errors.iter().sum::<f64>() / n)
                    .with_label("dataset", dataset),
            );
            out.push(
                MetricTriple::gauge(
                    "regression_performance:mean_abs_error",
                    errors.iter().map(|e| e.abs()).sum::<f64>() / n,
                )
                .with_label("dataset", dataset),
            );
        }
    }

    fn classification_performance(
        &self,
        reference: &[Record],
        current: &[Record],
        columns: &ColumnMapping,
        out: &mut Vec<MetricTriple>,
    ) {
        let (Some(target), Some(prediction)) = (&columns.target, &columns.prediction) else {
            return;
        };

        for (dataset, rows) in [("reference", reference), ("current", current)] {
            let mut total = 0usize;
            let mut correct = 0usize;
            for row in rows {
                if let (Some(actual), Some(predicted)) = (row.get(target), row.get(prediction)) {
                    if actual.is_null() || predicted.is_null() {
                        continue;
                    }
                    total += 1;
                    if actual == predicted {
                        correct += 1;
                    }
                }
            }
            if total > 0 {
                out.push(
                    MetricTriple::gauge("classification_performance:accuracy", correct as f64 / total as f64)
                        .with_label("dataset", dataset),
                );
            }
        }
    }
}

fn target_and_prediction(columns: &ColumnMapping) -> Vec<(&'static str, &str)> {
    let mut out = Vec::with_capacity(2);
    if let Some(target) = &columns.target {
        out.push(("target", target.as_str()));
    }
    if let Some(prediction) = &columns.prediction {
        out.push(("prediction", prediction.as_str()));
    }
    out
}

impl MetricEvaluator for SummaryStatsEvaluator {
    fn name(&self) -> &str {
        "summary_stats"
    }

    fn evaluate(
        &self,
        reference: &[Record],
        current: &[Record],
        columns: &ColumnMapping,
        monitors: &[MonitorKind],
    ) -> Result<Vec<MetricTriple>, EvaluationError> {
        let mut triples = Vec::new();

        for monitor in monitors {
            match monitor {
                MonitorKind::DataDrift => self.data_drift(reference, current, columns, &mut triples),
                MonitorKind::DataQuality => self.data_quality(reference, current, columns, &mut triples),
                MonitorKind::NumTargetDrift => {
                    self.num_target_drift(reference, current, columns, &mut triples)
                }
                MonitorKind::CatTargetDrift => {
                    self.cat_target_drift(reference, current, columns, &mut triples)
                }
                MonitorKind::RegressionPerformance => {
                    self.regression_performance(reference, current, columns, &mut triples)
                }
                MonitorKind::ClassificationPerformance => {
                    self.classification_performance(reference, current, columns, &mut triples)
                }
                MonitorKind::ProbClassificationPerformance => {
                    debug!(
                        target: "drift_monitor::evaluator",
                        monitor = %monitor,
                        "Monitor not supported by the summary evaluator"
                    );
                }
            }
        }

        Ok(triples)
    }
}

// ============================================================================
// SECTION 11: AUXILIARY ERROR MEASURES
// ============================================================================
// RMSE and MAE between the target and prediction columns of the window.
// Published through the registry as `loss_metric{loss_function=...}`.
// ============================================================================

pub fn rmse(actual: &[f64], predicted: &[f64]) -> f64 {
    let n = actual.len().min(predicted.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = actual
        .iter()
        .zip(predicted)
        .map(|(a, p)| (a - p) * (a - p))
        .sum();
    (sum / n as f64).sqrt()
}

pub fn mae(actual: &[f64], predicted: &[f64]) -> f64 {
    let n = actual.len().min(predicted.len());
    if n == 0 {
        return 0.0;
    }
    let sum: f64 = actual.iter().zip(predicted).map(|(a, p)| (a - p).abs()).sum();
    sum / n as f64
}

/// Every row must carry a numeric value for `column`.
fn numeric_column(rows: &[Record], column: &str) -> Result<Vec<f64>, MeasureError> {
    let values: Vec<f64> = rows.iter().filter_map(|r| r.get_f64(column)).collect();
    let missing_rows = rows.len() - values.len();

    if missing_rows > 0 || values.is_empty() {
        return Err(MeasureError::InsufficientColumns {
            column: column.to_string(),
            missing_rows,
        });
    }
    Ok(values)
}

/// RMSE and MAE triples over the window's target and prediction columns.
pub fn error_measures(rows: &[Record], columns: &ColumnMapping) -> Result<Vec<MetricTriple>, MeasureError> {
    let target = columns
        .target
        .as_deref()
        .ok_or(MeasureError::MissingRole { role: "target" })?;
    let prediction = columns
        .prediction
        .as_deref()
        .ok_or(MeasureError::MissingRole { role: "prediction" })?;

    let actual = numeric_column(rows, target)?;
    let predicted = numeric_column(rows, prediction)?;

    Ok(vec![
        MetricTriple::gauge(LOSS_METRIC, rmse(&actual, &predicted)).with_label(LOSS_FUNCTION_LABEL, "rmse"),
        MetricTriple::gauge(LOSS_METRIC, mae(&actual, &predicted)).with_label(LOSS_FUNCTION_LABEL, "mae"),
    ])
}

// ============================================================================
// SECTION 12: METRIC REGISTRY
// ============================================================================
// Reconciles batches of metric triples into a stable set of exported gauge
// series. A series is created lazily on first observation and its label
// schema is fixed to that observation's key set. Writes synchronise per
// series; the name index is a sharded map so publishes from different
// datasets never serialise on a global lock.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Metric Series
// ----------------------------------------------------------------------------

/// One exported gauge family with a fixed, sorted label schema.
pub struct MetricSeries {
    name: CompactString,
    label_keys: Vec<CompactString>,
    gauge: GaugeVec,
    /// Label values (in schema order) to last recorded value
    values: RwLock<BTreeMap<Vec<CompactString>, f64>>,
    created_at: Timestamp,
    last_updated: AtomicTimestamp,
    update_count: AtomicU64,
}

impl MetricSeries {
    fn new(name: CompactString, label_keys: Vec<CompactString>) -> Result<Self, prometheus::Error> {
        let help = format!("Monitoring metric {}", name);
        let keys: Vec<&str> = label_keys.iter().map(CompactString::as_str).collect();
        let gauge = GaugeVec::new(Opts::new(name.as_str(), help), &keys)?;
        let now = Timestamp::now();

        Ok(Self {
            name,
            label_keys,
            gauge,
            values: RwLock::new(BTreeMap::new()),
            created_at: now,
            last_updated: AtomicTimestamp::new(now),
            update_count: AtomicU64::new(0),
        })
    }

    /// Record `value` under `labels`; the key set must equal the schema.
    fn record(&self, labels: &BTreeMap<CompactString, CompactString>, value: f64) -> RegistryResult<()> {
        if !labels.keys().eq(self.label_keys.iter()) {
            return Err(RegistryError::SchemaMismatch {
                metric: self.name.to_string(),
                expected: self.label_keys.iter().map(|k| k.to_string()).collect(),
                found: labels.keys().map(|k| k.to_string()).collect(),
            });
        }

        let label_values: Vec<CompactString> = labels.values().cloned().collect();
        let refs: Vec<&str> = label_values.iter().map(CompactString::as_str).collect();

        // The exported child and the queryable mirror change under one lock.
        let mut values = self.values.write();
        let child = self
            .gauge
            .get_metric_with_label_values(&refs)
            .map_err(|e| RegistryError::InvalidMetric {
                metric: self.name.to_string(),
                message: e.to_string(),
            })?;
        child.set(value);
        values.insert(label_values, value);

        self.last_updated.store(Timestamp::now(), AtomicOrdering::Release);
        self.update_count.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label_keys(&self) -> &[CompactString] {
        &self.label_keys
    }

    /// Current value for a full label set, if one was ever recorded.
    pub fn value(&self, labels: &BTreeMap<CompactString, CompactString>) -> Option<f64> {
        if !labels.keys().eq(self.label_keys.iter()) {
            return None;
        }
        let key: Vec<CompactString> = labels.values().cloned().collect();
        self.values.read().get(&key).copied()
    }

    /// Number of distinct label sets recorded
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn update_count(&self) -> u64 {
        self.update_count.load(AtomicOrdering::Relaxed)
    }

    pub fn last_updated(&self) -> Timestamp {
        self.last_updated.load(AtomicOrdering::Acquire)
    }
}

impl Debug for MetricSeries {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricSeries")
            .field("name", &self.name)
            .field("label_keys", &self.label_keys)
            .field("series", &self.len())
            .field("created_at", &self.created_at)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 12.2 Service Self-Metrics
// ----------------------------------------------------------------------------

/// Counters describing the engine itself, exported next to the dynamic series.
pub struct ServiceMetrics {
    ingested_rows: IntCounterVec,
    evaluations: IntCounterVec,
    publish_errors: IntCounterVec,
    window_rows: IntGaugeVec,
}

impl ServiceMetrics {
    /// Create and register the service metrics
    pub fn new(registry: &PrometheusRegistry) -> Result<Self, prometheus::Error> {
        let ingested_rows = IntCounterVec::new(
            Opts::new(
                format!("{}_ingested_rows_total", SELF_METRICS_PREFIX),
                "Rows received by ingest",
            ),
            &[DATASET_LABEL],
        )?;
        registry.register(Box::new(ingested_rows.clone()))?;

        let evaluations = IntCounterVec::new(
            Opts::new(
                format!("{}_evaluations_total", SELF_METRICS_PREFIX),
                "Evaluation cycles executed",
            ),
            &[DATASET_LABEL],
        )?;
        registry.register(Box::new(evaluations.clone()))?;

        let publish_errors = IntCounterVec::new(
            Opts::new(
                format!("{}_publish_errors_total", SELF_METRICS_PREFIX),
                "Metric triples dropped while publishing",
            ),
            &[DATASET_LABEL, "kind"],
        )?;
        registry.register(Box::new(publish_errors.clone()))?;

        let window_rows = IntGaugeVec::new(
            Opts::new(
                format!("{}_window_rows", SELF_METRICS_PREFIX),
                "Rows currently held in the window",
            ),
            &[DATASET_LABEL],
        )?;
        registry.register(Box::new(window_rows.clone()))?;

        Ok(Self {
            ingested_rows,
            evaluations,
            publish_errors,
            window_rows,
        })
    }

    pub fn record_ingest(&self, dataset: &str, rows: usize, window_len: usize) {
        self.ingested_rows
            .with_label_values(&[dataset])
            .inc_by(rows as u64);
        self.window_rows
            .with_label_values(&[dataset])
            .set(window_len as i64);
    }

    pub fn record_evaluation(&self, dataset: &str) {
        self.evaluations.with_label_values(&[dataset]).inc();
    }

    pub fn record_publish_error(&self, dataset: &str, kind: &str) {
        self.publish_errors.with_label_values(&[dataset, kind]).inc();
    }

    pub fn evaluations(&self, dataset: &str) -> u64 {
        self.evaluations.with_label_values(&[dataset]).get()
    }

    pub fn publish_errors(&self, dataset: &str, kind: &str) -> u64 {
        self.publish_errors.with_label_values(&[dataset, kind]).get()
    }
}

impl Debug for ServiceMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceMetrics").finish_non_exhaustive()
    }
}

// ----------------------------------------------------------------------------
// 12.3 Publish Report
// ----------------------------------------------------------------------------

/// Outcome of one publish cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishReport {
    pub recorded: usize,
    pub non_numeric: usize,
    pub schema_mismatches: usize,
    pub invalid: usize,
    pub errors: Vec<RegistryError>,
}

impl PublishReport {
    fn push_error(&mut self, error: RegistryError) {
        match error {
            RegistryError::NonNumericValue { .. } => self.non_numeric += 1,
            RegistryError::SchemaMismatch { .. } => self.schema_mismatches += 1,
            RegistryError::InvalidMetric { .. } => self.invalid += 1,
        }
        self.errors.push(error);
    }

    pub fn rejected(&self) -> usize {
        self.non_numeric + self.schema_mismatches + self.invalid
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

// ----------------------------------------------------------------------------
// 12.4 Registry
// ----------------------------------------------------------------------------

/// Dynamic mapping from metric name to exported series.
pub struct MetricRegistry {
    registry: PrometheusRegistry,
    namespace: CompactString,
    series: DashMap<CompactString, Arc<MetricSeries>>,
    service: ServiceMetrics,
}

impl MetricRegistry {
    /// Create a registry whose evaluator metrics are exported as
    /// `<namespace>:<name>`. An empty namespace exports names unchanged.
    pub fn new(namespace: impl Into<CompactString>) -> MonitorResult<Self> {
        let registry = PrometheusRegistry::new();
        let service = ServiceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            namespace: namespace.into(),
            series: DashMap::new(),
            service,
        })
    }

    /// Exported name for an evaluator metric name
    pub fn exported_name(&self, name: &str) -> CompactString {
        if self.namespace.is_empty() {
            CompactString::from(name)
        } else {
            CompactString::from(format!("{}:{}", self.namespace, name))
        }
    }

    /// Publish one batch for `dataset`. Failures are per triple: each one is
    /// logged, counted and skipped while the rest of the batch proceeds.
    pub fn publish(&self, dataset: &str, triples: Vec<MetricTriple>) -> PublishReport {
        let mut report = PublishReport::default();

        for triple in triples {
            match self.publish_one(dataset, triple) {
                Ok(()) => report.recorded += 1,
                Err(err) => {
                    match &err {
                        RegistryError::NonNumericValue { .. } => debug!(
                            target: "drift_monitor::registry",
                            dataset = %dataset,
                            error = %err,
                            "Skipping non-numeric metric value"
                        ),
                        _ => error!(
                            target: "drift_monitor::registry",
                            dataset = %dataset,
                            error = %err,
                            "Failed to record metric value"
                        ),
                    }
                    self.service.record_publish_error(dataset, err.kind());
                    report.push_error(err);
                }
            }
        }

        debug!(
            target: "drift_monitor::registry",
            dataset = %dataset,
            recorded = report.recorded,
            rejected = report.rejected(),
            "Publish cycle complete"
        );

        report
    }

    fn publish_one(&self, dataset: &str, triple: MetricTriple) -> RegistryResult<()> {
        let name = self.exported_name(&triple.name);

        let Some(value) = triple.value.as_f64() else {
            return Err(RegistryError::NonNumericValue {
                metric: name.to_string(),
                value_type: triple.value.type_name(),
            });
        };

        let mut labels = triple.labels.to_sorted_map();
        labels.insert(CompactString::from(DATASET_LABEL), CompactString::from(dataset));

        let series = self.series_for(&name, &labels)?;
        series.record(&labels, value)
    }

    /// Look up a series, creating and registering it on first observation.
    fn series_for(
        &self,
        name: &CompactString,
        labels: &BTreeMap<CompactString, CompactString>,
    ) -> RegistryResult<Arc<MetricSeries>> {
        if let Some(existing) = self.series.get(name) {
            return Ok(Arc::clone(existing.value()));
        }

        match self.series.entry(name.clone()) {
            DashEntry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            DashEntry::Vacant(entry) => {
                let invalid = |e: prometheus::Error| RegistryError::InvalidMetric {
                    metric: name.to_string(),
                    message: e.to_string(),
                };

                let series = MetricSeries::new(name.clone(), labels.keys().cloned().collect())
                    .map_err(invalid)?;
                self.registry
                    .register(Box::new(series.gauge.clone()))
                    .map_err(invalid)?;

                info!(
                    target: "drift_monitor::registry",
                    metric = %name,
                    labels = ?series.label_keys,
                    "Registered metric series"
                );

                let series = Arc::new(series);
                entry.insert(Arc::clone(&series));
                Ok(series)
            }
        }
    }

    /// Current value of an exported series for a full label set
    /// (including `dataset_name`).
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let series = self.series.get(name)?;
        let labels: BTreeMap<CompactString, CompactString> = labels
            .iter()
            .map(|(k, v)| (CompactString::from(*k), CompactString::from(*v)))
            .collect();
        series.value().value(&labels)
    }

    /// Label schema of an exported series
    pub fn schema(&self, name: &str) -> Option<Vec<CompactString>> {
        self.series.get(name).map(|s| s.label_keys().to_vec())
    }

    /// Names of all exported dynamic series, sorted
    pub fn series_names(&self) -> Vec<CompactString> {
        let mut names: Vec<CompactString> = self.series.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn service_metrics(&self) -> &ServiceMetrics {
        &self.service
    }

    /// Underlying Prometheus registry, for a transport layer to scrape
    pub fn prometheus(&self) -> &PrometheusRegistry {
        &self.registry
    }

    /// Collect every metric family, dynamic series and self-metrics alike
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Render every series in Prometheus text exposition format
    pub fn render(&self) -> MonitorResult<String> {
        let encoder = TextEncoder::new();
        let families = self.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| MonitorError::Internal(format!("Exposition is not UTF-8: {}", e)))
    }
}

impl Debug for MetricRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("namespace", &self.namespace)
            .field("series", &self.series.len())
            .finish()
    }
}

// ============================================================================
// SECTION 13: MONITORING ORCHESTRATOR
// ============================================================================
// Owns the per-dataset state and sequences one ingest:
//   append → trim → warm-up check → gate check → arm → evaluate → publish
// Each dataset is guarded by its own mutex for the whole sequence, so two
// ingests for the same dataset never both evaluate within one period while
// different datasets proceed in parallel. The dataset table is built once
// and never changes.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Dataset Definitions
// ----------------------------------------------------------------------------

/// Everything the orchestrator needs to know about one dataset at startup.
#[derive(Debug, Clone)]
pub struct DatasetDefinition {
    pub name: CompactString,
    pub reference: ReferenceStore,
    pub columns: ColumnMapping,
    pub monitors: Vec<MonitorKind>,
    pub settings: WindowSettings,
}

impl DatasetDefinition {
    pub fn new(name: impl Into<CompactString>, reference: ReferenceStore, settings: WindowSettings) -> Self {
        Self {
            name: name.into(),
            reference,
            columns: ColumnMapping::default(),
            monitors: Vec::new(),
            settings,
        }
    }

    pub fn with_columns(mut self, columns: ColumnMapping) -> Self {
        self.columns = columns;
        self
    }

    pub fn with_monitors(mut self, monitors: Vec<MonitorKind>) -> Self {
        self.monitors = monitors;
        self
    }
}

/// Mutable state of one dataset, guarded as a unit.
#[derive(Debug)]
struct DatasetState {
    window: WindowBuffer,
    gate: ScheduleGate,
    evaluations: u64,
    last_evaluated: Option<Timestamp>,
}

#[derive(Debug)]
struct DatasetMonitor {
    definition: DatasetDefinition,
    state: Mutex<DatasetState>,
}

impl DatasetMonitor {
    fn new(definition: DatasetDefinition) -> Self {
        let state = DatasetState {
            window: WindowBuffer::with_capacity(definition.settings.capacity),
            gate: ScheduleGate::new(definition.settings.period),
            evaluations: 0,
            last_evaluated: None,
        };

        Self {
            definition,
            state: Mutex::new(state),
        }
    }
}

// ----------------------------------------------------------------------------
// 13.2 Ingest Outcome & Statistics
// ----------------------------------------------------------------------------

/// What happened to one accepted ingest.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// The window is still below its minimum size
    WarmingUp { window_len: usize, min_window_size: usize },
    /// Enough data, but the schedule is not due yet
    NotDue { window_len: usize, next_eligible: Timestamp },
    /// Metrics were recomputed and published
    Evaluated { window_len: usize, report: PublishReport },
}

impl IngestOutcome {
    pub fn is_evaluated(&self) -> bool {
        matches!(self, IngestOutcome::Evaluated { .. })
    }

    pub fn window_len(&self) -> usize {
        match self {
            IngestOutcome::WarmingUp { window_len, .. }
            | IngestOutcome::NotDue { window_len, .. }
            | IngestOutcome::Evaluated { window_len, .. } => *window_len,
        }
    }

    pub fn report(&self) -> Option<&PublishReport> {
        match self {
            IngestOutcome::Evaluated { report, .. } => Some(report),
            _ => None,
        }
    }
}

/// Lock-free counters over the orchestrator's lifetime.
#[derive(Debug, Default)]
pub struct OrchestratorStats {
    ingests: AtomicU64,
    rows: AtomicU64,
    unknown_dataset: AtomicU64,
    warming_up: AtomicU64,
    not_due: AtomicU64,
    evaluations: AtomicU64,
    evaluator_failures: AtomicU64,
    measure_failures: AtomicU64,
}

impl OrchestratorStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> OrchestratorStatsSnapshot {
        OrchestratorStatsSnapshot {
            ingests: self.ingests.load(AtomicOrdering::Relaxed),
            rows: self.rows.load(AtomicOrdering::Relaxed),
            unknown_dataset: self.unknown_dataset.load(AtomicOrdering::Relaxed),
            warming_up: self.warming_up.load(AtomicOrdering::Relaxed),
            not_due: self.not_due.load(AtomicOrdering::Relaxed),
            evaluations: self.evaluations.load(AtomicOrdering::Relaxed),
            evaluator_failures: self.evaluator_failures.load(AtomicOrdering::Relaxed),
            measure_failures: self.measure_failures.load(AtomicOrdering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`OrchestratorStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStatsSnapshot {
    pub ingests: u64,
    pub rows: u64,
    pub unknown_dataset: u64,
    pub warming_up: u64,
    pub not_due: u64,
    pub evaluations: u64,
    pub evaluator_failures: u64,
    pub measure_failures: u64,
}

// ----------------------------------------------------------------------------
// 13.3 Orchestrator
// ----------------------------------------------------------------------------

/// Top-level coordinator over all configured datasets.
#[derive(Debug)]
pub struct MonitoringOrchestrator {
    datasets: AHashMap<CompactString, DatasetMonitor>,
    registry: Arc<MetricRegistry>,
    evaluator: Arc<dyn MetricEvaluator>,
    clock: Arc<dyn Clock>,
    stats: OrchestratorStats,
}

impl MonitoringOrchestrator {
    /// Build an orchestrator over a fixed set of datasets.
    pub fn new(
        definitions: Vec<DatasetDefinition>,
        evaluator: Arc<dyn MetricEvaluator>,
        clock: Arc<dyn Clock>,
        registry: Arc<MetricRegistry>,
    ) -> MonitorResult<Self> {
        let mut datasets = AHashMap::with_capacity(definitions.len());

        for definition in definitions {
            let name = definition.name.clone();
            if datasets.contains_key(&name) {
                return Err(ConfigError::DuplicateDataset { name: name.to_string() }.into());
            }

            info!(
                target: "drift_monitor::orchestrator",
                dataset = %name,
                reference_rows = definition.reference.len(),
                window_capacity = definition.settings.capacity,
                min_window_size = definition.settings.min_size,
                period = %humantime::format_duration(definition.settings.period),
                monitors = ?definition.monitors,
                "Dataset registered"
            );
            datasets.insert(name, DatasetMonitor::new(definition));
        }

        Ok(Self {
            datasets,
            registry,
            evaluator,
            clock,
            stats: OrchestratorStats::default(),
        })
    }

    /// Load every configured dataset's reference and build the orchestrator.
    pub fn from_config(
        config: &MonitorConfig,
        loader: &dyn ReferenceLoader,
        evaluator: Arc<dyn MetricEvaluator>,
        clock: Arc<dyn Clock>,
    ) -> MonitorResult<Self> {
        discover_unconfigured(config);

        let registry = Arc::new(MetricRegistry::new(config.service.metric_namespace.as_str())?);
        let mut definitions = Vec::with_capacity(config.datasets.len());

        for (name, dataset) in &config.datasets {
            let path = config.reference_path(name, dataset);
            debug!(
                target: "drift_monitor::loader",
                dataset = %name,
                path = %path.display(),
                "Loading reference data"
            );

            let rows = loader.load(name, &path)?;
            if rows.len() < config.service.min_reference_size {
                return Err(LoaderError::TooSmall {
                    dataset: name.clone(),
                    rows: rows.len(),
                    required: config.service.min_reference_size,
                }
                .into());
            }

            let reference = ReferenceStore::load(rows);
            info!(
                target: "drift_monitor::loader",
                dataset = %name,
                rows = reference.len(),
                fingerprint = %reference.fingerprint(),
                "Reference data loaded"
            );

            definitions.push(
                DatasetDefinition::new(name.as_str(), reference, dataset.window_settings(&config.service))
                    .with_columns(dataset.column_mapping.clone())
                    .with_monitors(dataset.monitors.clone()),
            );
        }

        Self::new(definitions, evaluator, clock, registry)
    }

    /// Accept new rows for `dataset` and recompute metrics if due.
    ///
    /// Fails only with [`MonitorError::UnknownDataset`], in which case no
    /// state is touched. Evaluator, measure and publish failures are logged
    /// and counted.
    pub fn ingest(&self, dataset: &str, rows: Vec<Record>) -> MonitorResult<IngestOutcome> {
        OrchestratorStats::bump(&self.stats.ingests);

        let Some(monitor) = self.datasets.get(dataset) else {
            OrchestratorStats::bump(&self.stats.unknown_dataset);
            warn!(
                target: "drift_monitor::orchestrator",
                dataset = %dataset,
                rows = rows.len(),
                "Rejected rows for unknown dataset"
            );
            return Err(MonitorError::unknown_dataset(dataset));
        };

        let settings = monitor.definition.settings;
        let received = rows.len();

        let mut state = monitor.state.lock();
        state.window.append(rows);
        let evicted = state.window.trim(settings.capacity);
        let window_len = state.window.len();

        self.stats.rows.fetch_add(received as u64, AtomicOrdering::Relaxed);
        self.registry
            .service_metrics()
            .record_ingest(dataset, received, window_len);

        trace!(
            target: "drift_monitor::orchestrator",
            dataset = %dataset,
            received,
            evicted,
            window_len,
            "Rows appended to window"
        );

        if window_len < settings.min_size {
            OrchestratorStats::bump(&self.stats.warming_up);
            info!(
                target: "drift_monitor::orchestrator",
                dataset = %dataset,
                window_len,
                min_window_size = settings.min_size,
                "Not enough data for measurement, waiting for more rows"
            );
            return Ok(IngestOutcome::WarmingUp {
                window_len,
                min_window_size: settings.min_size,
            });
        }

        let now = self.clock.now();
        if !state.gate.is_due(now, window_len, settings.min_size) {
            OrchestratorStats::bump(&self.stats.not_due);
            let next_eligible = state.gate.next_eligible().unwrap_or(now);
            debug!(
                target: "drift_monitor::orchestrator",
                dataset = %dataset,
                next_run = %next_eligible,
                "Evaluation not due yet"
            );
            return Ok(IngestOutcome::NotDue {
                window_len,
                next_eligible,
            });
        }

        let next_run = state.gate.arm(now);
        state.evaluations += 1;
        state.last_evaluated = Some(now);
        info!(
            target: "drift_monitor::orchestrator",
            dataset = %dataset,
            window_len,
            next_run = %next_run,
            "Recomputing metrics"
        );

        let report = self.evaluate_and_publish(&monitor.definition, state.window.as_slice());
        Ok(IngestOutcome::Evaluated { window_len, report })
    }

    /// Run the evaluator and auxiliary measures over `current` and publish
    /// the union together with the reference fingerprint.
    fn evaluate_and_publish(&self, definition: &DatasetDefinition, current: &[Record]) -> PublishReport {
        let started = Instant::now();
        let dataset = definition.name.as_str();

        let mut triples = match self.evaluator.evaluate(
            definition.reference.rows(),
            current,
            &definition.columns,
            &definition.monitors,
        ) {
            Ok(triples) => triples,
            Err(err) => {
                OrchestratorStats::bump(&self.stats.evaluator_failures);
                error!(
                    target: "drift_monitor::orchestrator",
                    dataset = %dataset,
                    evaluator = %self.evaluator.name(),
                    error = %err,
                    "Evaluator failed, publishing auxiliary metrics only"
                );
                Vec::new()
            }
        };

        if definition.settings.auxiliary_error_measures {
            match error_measures(current, &definition.columns) {
                Ok(measures) => triples.extend(measures),
                Err(err) => {
                    OrchestratorStats::bump(&self.stats.measure_failures);
                    warn!(
                        target: "drift_monitor::orchestrator",
                        dataset = %dataset,
                        error = %err,
                        "Skipping auxiliary error measures"
                    );
                }
            }
        }

        triples.push(definition.reference.fingerprint_triple());

        let report = self.registry.publish(dataset, triples);
        OrchestratorStats::bump(&self.stats.evaluations);
        self.registry.service_metrics().record_evaluation(dataset);

        info!(
            target: "drift_monitor::orchestrator",
            dataset = %dataset,
            recorded = report.recorded,
            rejected = report.rejected(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Metrics published"
        );

        report
    }

    fn monitor(&self, dataset: &str) -> MonitorResult<&DatasetMonitor> {
        self.datasets
            .get(dataset)
            .ok_or_else(|| MonitorError::unknown_dataset(dataset))
    }

    /// Configured dataset names, sorted
    pub fn datasets(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.datasets.keys().map(CompactString::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn definition(&self, dataset: &str) -> MonitorResult<&DatasetDefinition> {
        Ok(&self.monitor(dataset)?.definition)
    }

    pub fn window_len(&self, dataset: &str) -> MonitorResult<usize> {
        Ok(self.monitor(dataset)?.state.lock().window.len())
    }

    /// Owned copy of the window, oldest row first
    pub fn window_snapshot(&self, dataset: &str) -> MonitorResult<Vec<Record>> {
        Ok(self.monitor(dataset)?.state.lock().window.snapshot())
    }

    pub fn fingerprint(&self, dataset: &str) -> MonitorResult<&str> {
        Ok(self.monitor(dataset)?.definition.reference.fingerprint())
    }

    pub fn gate_state(&self, dataset: &str) -> MonitorResult<GateState> {
        let now = self.clock.now();
        Ok(self.monitor(dataset)?.state.lock().gate.state(now))
    }

    /// Number of evaluations run for `dataset`
    pub fn evaluations(&self, dataset: &str) -> MonitorResult<u64> {
        Ok(self.monitor(dataset)?.state.lock().evaluations)
    }

    pub fn last_evaluated(&self, dataset: &str) -> MonitorResult<Option<Timestamp>> {
        Ok(self.monitor(dataset)?.state.lock().last_evaluated)
    }

    pub fn registry(&self) -> &Arc<MetricRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> OrchestratorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Prometheus exposition of every series
    pub fn render(&self) -> MonitorResult<String> {
        self.registry.render()
    }
}

// ============================================================================
// SECTION 14: REPLAY & COMMAND LINE INTERFACE
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 Replay Events
// ----------------------------------------------------------------------------

/// One line of replay input.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IngestEvent {
    pub dataset: String,
    #[serde(default)]
    pub rows: Vec<Record>,
}

impl IngestEvent {
    /// Parse a replay line. Accepts `{"dataset": .., "rows": [..]}`, or a bare
    /// row object / array of rows when `default_dataset` is given.
    pub fn parse(line: &str, default_dataset: Option<&str>) -> Result<Self, ReplayError> {
        let value: JsonValue = serde_json::from_str(line)?;

        let is_envelope = value
            .as_object()
            .map(|obj| obj.contains_key("dataset") && obj.contains_key("rows"))
            .unwrap_or(false);
        if is_envelope {
            return Ok(serde_json::from_value(value)?);
        }

        let dataset = default_dataset.ok_or(ReplayError::MissingDataset)?;

        let rows = match value {
            JsonValue::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(index, item)| Record::from_json(item).ok_or(ReplayError::NotAnObject { index }))
                .collect::<Result<Vec<_>, _>>()?,
            other => vec![Record::from_json(other).ok_or(ReplayError::NotAnObject { index: 0 })?],
        };

        Ok(Self {
            dataset: dataset.to_string(),
            rows,
        })
    }
}

/// Totals of one replay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub events: u64,
    pub rows: u64,
    pub evaluations: u64,
    pub rejected: u64,
    pub malformed: u64,
}

/// Feed newline-delimited events into the orchestrator. Malformed lines and
/// unknown datasets are logged and skipped.
pub fn replay_events<R: BufRead>(
    orchestrator: &MonitoringOrchestrator,
    reader: R,
    default_dataset: Option<&str>,
) -> MonitorResult<ReplaySummary> {
    let mut summary = ReplaySummary::default();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let event = match IngestEvent::parse(&line, default_dataset) {
            Ok(event) => event,
            Err(err) => {
                summary.malformed += 1;
                warn!(
                    target: "drift_monitor::replay",
                    line = idx + 1,
                    error = %err,
                    "Skipping malformed event"
                );
                continue;
            }
        };

        summary.events += 1;
        summary.rows += event.rows.len() as u64;

        match orchestrator.ingest(&event.dataset, event.rows) {
            Ok(outcome) => {
                if outcome.is_evaluated() {
                    summary.evaluations += 1;
                }
            }
            Err(err) if err.is_recoverable() => summary.rejected += 1,
            Err(err) => return Err(err),
        }
    }

    Ok(summary)
}

// ----------------------------------------------------------------------------
// 14.2 CLI Definitions
// ----------------------------------------------------------------------------

/// Drift Monitor - windowed model monitoring with Prometheus exposition
#[derive(Parser, Debug)]
#[command(name = "drift-monitor")]
#[command(author = "AIOps Team")]
#[command(version = ENGINE_VERSION)]
#[command(about = "Windowed drift and quality monitoring engine", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "DRIFT_MONITOR_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "DRIFT_MONITOR_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay newline-delimited ingest events and print the exposition
    #[command(alias = "run")]
    Replay {
        /// Event file (defaults to stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Dataset for lines that carry bare rows
        #[arg(long)]
        dataset: Option<String>,

        /// Write the exposition here instead of stdout
        #[arg(short = 'o', long)]
        metrics_out: Option<PathBuf>,
    },

    /// Validate the configuration file
    Validate {
        /// Print the resolved per-dataset settings
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate an example configuration file
    GenerateConfig {
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the reference fingerprint of every dataset
    Fingerprint,

    /// Show version information
    Version,
}

// ----------------------------------------------------------------------------
// 14.3 Command Handlers
// ----------------------------------------------------------------------------

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!("Metric namespace: {}", DEFAULT_METRIC_NAMESPACE);
    println!(
        "Monitors: {}",
        MonitorKind::ALL
            .iter()
            .map(MonitorKind::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn handle_generate_config(output: Option<&Path>) -> AnyhowResult<()> {
    let config = MonitorConfig::generate_default_config()
        .context("Failed to render the example configuration")?;

    match output {
        Some(path) => {
            fs::write(path, &config)
                .with_context(|| format!("Failed to write config to {}", path.display()))?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{}", config),
    }

    Ok(())
}

fn handle_validate(config: &MonitorConfig, verbose: bool) {
    println!("Configuration is valid: {} dataset(s)", config.datasets.len());

    if verbose {
        for (name, dataset) in &config.datasets {
            let settings = dataset.window_settings(&config.service);
            println!(
                "  {}: capacity={} min={} period={} aux={} monitors=[{}] reference={}",
                name,
                settings.capacity,
                settings.min_size,
                humantime::format_duration(settings.period),
                settings.auxiliary_error_measures,
                dataset
                    .monitors
                    .iter()
                    .map(MonitorKind::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
                config.reference_path(name, dataset).display()
            );
        }
    }
}

fn handle_fingerprint(orchestrator: &MonitoringOrchestrator) -> AnyhowResult<()> {
    for dataset in orchestrator.datasets() {
        let definition = orchestrator.definition(dataset)?;
        println!(
            "{}  {}  ({} rows)",
            definition.reference.fingerprint(),
            dataset,
            definition.reference.len()
        );
    }
    Ok(())
}

async fn handle_replay(
    orchestrator: Arc<MonitoringOrchestrator>,
    input: Option<PathBuf>,
    dataset: Option<String>,
    metrics_out: Option<PathBuf>,
) -> AnyhowResult<()> {
    let worker = Arc::clone(&orchestrator);
    let summary = tokio::task::spawn_blocking(move || -> MonitorResult<ReplaySummary> {
        match input {
            Some(path) => {
                let file = fs::File::open(&path)?;
                replay_events(&worker, BufReader::new(file), dataset.as_deref())
            }
            None => replay_events(&worker, io::stdin().lock(), dataset.as_deref()),
        }
    })
    .await
    .context("Replay task failed")??;

    info!(
        target: "drift_monitor::replay",
        events = summary.events,
        rows = summary.rows,
        evaluations = summary.evaluations,
        rejected = summary.rejected,
        malformed = summary.malformed,
        "Replay finished"
    );

    let exposition = orchestrator.render()?;
    match metrics_out {
        Some(path) => fs::write(&path, exposition)
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?,
        None => print!("{}", exposition),
    }

    Ok(())
}

// ----------------------------------------------------------------------------
// 14.4 Entry Point
// ----------------------------------------------------------------------------

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => return handle_generate_config(output.as_deref()),
        _ => {}
    }

    let config = MonitorConfig::read(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    let mut logging = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    if cli.debug {
        logging.level = "debug".into();
    }
    init_logging(&logging)?;

    // Validation warnings need the subscriber installed above.
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", cli.config.display()))?;

    if let Some(Commands::Validate { verbose }) = &cli.command {
        handle_validate(&config, *verbose);
        return Ok(());
    }

    info!(
        target: "drift_monitor::main",
        version = ENGINE_VERSION,
        datasets = config.datasets.len(),
        "{} starting",
        ENGINE_FULL_NAME
    );

    let orchestrator = MonitoringOrchestrator::from_config(
        &config,
        &JsonReferenceLoader,
        Arc::new(SummaryStatsEvaluator::new()),
        Arc::new(SystemClock),
    )
    .context("Failed to initialise datasets")?;
    let orchestrator = Arc::new(orchestrator);

    match cli.command {
        Some(Commands::Fingerprint) => handle_fingerprint(&orchestrator)?,
        Some(Commands::Replay {
            input,
            dataset,
            metrics_out,
        }) => handle_replay(orchestrator, input, dataset, metrics_out).await?,
        None => handle_replay(orchestrator, None, None, None).await?,
        Some(Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. }) => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 15: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rstest::rstest;

    const T0: i64 = 1_700_000_000;

    fn row(id: u64) -> Record {
        Record::new().with("id", id)
    }

    fn ids(window: &WindowBuffer) -> Vec<u64> {
        window
            .iter()
            .filter_map(|r| r.get("id").and_then(JsonValue::as_u64))
            .collect()
    }

    #[test]
    fn test_window_evicts_oldest_first() {
        let mut window = WindowBuffer::new();
        window.append((0..3).map(row));

        assert_eq!(window.trim(2), 1);
        assert_eq!(ids(&window), vec![1, 2]);

        window.append([row(3)]);
        assert_eq!(window.trim(2), 1);
        assert_eq!(ids(&window), vec![2, 3]);
        assert_eq!(window.total_appended(), 4);
        assert_eq!(window.total_evicted(), 2);
    }

    #[test]
    fn test_window_trim_below_capacity_is_noop() {
        let mut window = WindowBuffer::new();
        window.append((0..5).map(row));

        assert_eq!(window.trim(10), 0);
        assert_eq!(window.len(), 5);
        assert_eq!(window.as_slice().len(), 5);
        assert_eq!(window.oldest(), Some(&row(0)));
        assert_eq!(window.newest(), Some(&row(4)));
    }

    proptest! {
        #[test]
        fn window_keeps_most_recent_rows(
            capacity in 1usize..32,
            batches in prop::collection::vec(0usize..20, 1..20),
        ) {
            let mut window = WindowBuffer::new();
            let mut next_id = 0u64;

            for batch in batches {
                window.append((0..batch).map(|_| {
                    let r = row(next_id);
                    next_id += 1;
                    r
                }));
                window.trim(capacity);

                prop_assert_eq!(window.len() as u64, next_id.min(capacity as u64));

                let ids = ids(&window);
                for pair in ids.windows(2) {
                    prop_assert_eq!(pair[1], pair[0] + 1);
                }
                if let Some(last) = ids.last() {
                    prop_assert_eq!(*last, next_id - 1);
                }
            }
        }
    }

    #[rstest]
    #[case::first_run_with_enough_data(None, 0, 50, 50, true)]
    #[case::first_run_warming_up(None, 0, 49, 50, false)]
    #[case::before_period_elapsed(Some(0), 59, 50, 50, false)]
    #[case::exactly_at_period(Some(0), 60, 50, 50, true)]
    #[case::late_but_not_enough_data(Some(0), 120, 10, 50, false)]
    fn test_gate_due(
        #[case] armed_at: Option<i64>,
        #[case] now_offset: i64,
        #[case] size: usize,
        #[case] min: usize,
        #[case] expected: bool,
    ) {
        let mut gate = ScheduleGate::new(Duration::from_secs(60));
        if let Some(offset) = armed_at {
            gate.arm(Timestamp::from_secs(T0 + offset));
        }

        assert_eq!(gate.is_due(Timestamp::from_secs(T0 + now_offset), size, min), expected);
    }

    #[test]
    fn test_gate_state_transitions() {
        let mut gate = ScheduleGate::new(Duration::from_secs(60));
        let t0 = Timestamp::from_secs(T0);
        assert_eq!(gate.state(t0), GateState::Uninitialized);

        let next = gate.arm(t0);
        assert_eq!(next, Timestamp::from_secs(T0 + 60));
        assert_eq!(gate.state(Timestamp::from_secs(T0 + 30)), GateState::Waiting);
        assert_eq!(gate.state(next), GateState::Due);
    }

    #[test]
    fn test_gate_rearms_from_actual_run_time() {
        let mut gate = ScheduleGate::new(Duration::from_secs(60));
        gate.arm(Timestamp::from_secs(T0));

        let late = Timestamp::from_secs(T0 + 90);
        assert!(gate.is_due(late, 1, 1));
        assert_eq!(gate.arm(late), Timestamp::from_secs(T0 + 150));
        assert!(!gate.is_due(Timestamp::from_secs(T0 + 149), 1, 1));
        assert!(gate.is_due(Timestamp::from_secs(T0 + 150), 1, 1));
    }

    #[test]
    fn test_huge_period_saturates() {
        let t0 = Timestamp::from_secs(T0);
        assert_eq!(t0.add_duration(Duration::MAX), Timestamp::from_nanos(i64::MAX));

        // 300 years overflows i64 nanoseconds
        let mut gate = ScheduleGate::new(Duration::from_secs(9_467_280_000));
        let next = gate.arm(t0);
        assert!(next > t0);
        assert!(!gate.is_due(t0, 1, 1));
        assert!(!gate.is_due(Timestamp::from_secs(T0 + 86_400 * 365 * 100), 1, 1));
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(Timestamp::from_secs(T0));
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), Timestamp::from_secs(T0 + 90));

        clock.set(Timestamp::EPOCH);
        assert_eq!(clock.now().as_nanos(), 0);
    }

    #[test]
    fn test_fingerprint_is_content_based() {
        let rows = vec![
            Record::new().with("a", 1).with("b", "x"),
            Record::new().with("a", 2).with("b", "y"),
        ];
        let same = ReferenceStore::load(rows.clone());
        let again = ReferenceStore::load(rows.clone());
        assert_eq!(same.fingerprint(), again.fingerprint());
        assert_eq!(same.fingerprint().len(), 64);

        let mut changed = rows.clone();
        changed[1].insert("a", 3);
        assert_ne!(ReferenceStore::compute_fingerprint(&changed), same.fingerprint());

        let reordered: Vec<Record> = rows.into_iter().rev().collect();
        assert_ne!(ReferenceStore::compute_fingerprint(&reordered), same.fingerprint());
    }

    #[test]
    fn test_fingerprint_ignores_column_insertion_order() {
        let left = Record::new().with("a", 1).with("b", 2);
        let right = Record::new().with("b", 2).with("a", 1);
        assert_eq!(
            ReferenceStore::compute_fingerprint(&[left]),
            ReferenceStore::compute_fingerprint(&[right])
        );
    }

    #[test]
    fn test_fingerprint_triple() {
        let store = ReferenceStore::load(vec![row(1)]);
        let triple = store.fingerprint_triple();

        assert_eq!(triple.name.as_str(), REFERENCE_HASH_METRIC);
        assert_eq!(triple.value, MetricValue::Gauge(1.0));
        assert_eq!(triple.labels.get(REFERENCE_HASH_LABEL), Some(store.fingerprint()));
    }

    #[test]
    fn test_record_numeric_view() {
        let record = Record::new()
            .with("n", 2.5)
            .with("flag", true)
            .with("text", "3")
            .with("nothing", JsonValue::Null);

        assert_eq!(record.get_f64("n"), Some(2.5));
        assert_eq!(record.get_f64("flag"), Some(1.0));
        assert_eq!(record.get_f64("text"), None);
        assert!(record.is_missing("nothing"));
        assert!(record.is_missing("absent"));
        assert!(!record.is_missing("n"));
    }

    #[test]
    fn test_labels_set_replaces() {
        let mut labels = labels!("a" => "1", "b" => "2");
        labels.set("a", "3");

        assert_eq!(labels.len(), 2);
        assert_eq!(labels.get("a"), Some("3"));
        assert!(labels.contains_key("b"));
        assert!(!labels.contains_key("c"));
    }

    #[test]
    fn test_monitor_kind_parsing() {
        assert_eq!("data_drift".parse::<MonitorKind>().ok(), Some(MonitorKind::DataDrift));
        assert!(matches!(
            "drift".parse::<MonitorKind>(),
            Err(ConfigError::UnknownMonitor { .. })
        ));
        for kind in MonitorKind::ALL {
            assert_eq!(kind.as_str().parse::<MonitorKind>().ok(), Some(kind));
        }
    }

    #[test]
    fn test_monitored_columns_are_deduplicated() {
        let columns = ColumnMapping {
            target: Some("price".into()),
            prediction: Some("price".into()),
            numerical_features: vec!["year".into()],
            categorical_features: vec!["model".into(), "year".into()],
            ..Default::default()
        };
        assert_eq!(columns.monitored_columns(), vec!["year", "model", "price"]);
    }

    // ------------------------------------------------------------------------
    // Auxiliary error measures
    // ------------------------------------------------------------------------

    fn regression_columns() -> ColumnMapping {
        ColumnMapping {
            target: Some("price".into()),
            prediction: Some("prediction".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_error_measures() {
        let rows = vec![
            Record::new().with("price", 10.0).with("prediction", 12.0),
            Record::new().with("price", 20.0).with("prediction", 18.0),
            Record::new().with("price", 30.0).with("prediction", 30.0),
        ];

        let triples = error_measures(&rows, &regression_columns()).unwrap();
        assert_eq!(triples.len(), 2);

        let rmse = triples[0].value.as_f64().unwrap();
        let mae = triples[1].value.as_f64().unwrap();
        assert!((rmse - (8.0f64 / 3.0).sqrt()).abs() < 1e-9);
        assert!((mae - 4.0 / 3.0).abs() < 1e-9);
        assert_eq!(triples[0].labels.get(LOSS_FUNCTION_LABEL), Some("rmse"));
        assert_eq!(triples[1].labels.get(LOSS_FUNCTION_LABEL), Some("mae"));
    }

    #[test]
    fn test_error_measures_need_every_row() {
        let rows = vec![
            Record::new().with("price", 10.0).with("prediction", 12.0),
            Record::new().with("price", 20.0),
        ];

        assert_eq!(
            error_measures(&rows, &regression_columns()),
            Err(MeasureError::InsufficientColumns {
                column: "prediction".into(),
                missing_rows: 1,
            })
        );
        assert_eq!(
            error_measures(&rows, &ColumnMapping::default()),
            Err(MeasureError::MissingRole { role: "target" })
        );
    }

    // ------------------------------------------------------------------------
    // Summary evaluator
    // ------------------------------------------------------------------------

    fn find<'a>(triples: &'a [MetricTriple], name: &str) -> Option<&'a MetricTriple> {
        triples.iter().find(|t| t.name.as_str() == name)
    }

    #[test]
    fn test_summary_evaluator_detects_mean_shift() {
        let reference: Vec<Record> = (1..=5).map(|x| Record::new().with("x", x as f64)).collect();
        let current: Vec<Record> = (0..2).map(|_| Record::new().with("x", 10.0)).collect();
        let columns = ColumnMapping {
            numerical_features: vec!["x".into()],
            ..Default::default()
        };

        let evaluator = SummaryStatsEvaluator::new();
        let triples = evaluator
            .evaluate(&reference, &current, &columns, &[MonitorKind::DataDrift])
            .unwrap();

        let shift = find(&triples, "data_drift:mean_shift").unwrap();
        assert!((shift.value.as_f64().unwrap() - 7.0 / 2.0f64.sqrt()).abs() < 1e-9);
        assert_eq!(shift.labels.get("feature"), Some("x"));
        assert_eq!(
            find(&triples, "data_drift:share_drifted_features").unwrap().value,
            MetricValue::Gauge(1.0)
        );
        assert_eq!(
            find(&triples, "data_drift:dataset_drift").unwrap().value,
            MetricValue::Boolean(true)
        );
    }

    #[test]
    fn test_summary_evaluator_is_deterministic() {
        let reference: Vec<Record> = (0..20)
            .map(|i| {
                Record::new()
                    .with("year", 2000 + i)
                    .with("model", if i % 2 == 0 { "a" } else { "b" })
                    .with("price", 100.0 + i as f64)
                    .with("prediction", 101.0 + i as f64)
            })
            .collect();
        let current = reference[5..15].to_vec();
        let columns = ColumnMapping {
            target: Some("price".into()),
            prediction: Some("prediction".into()),
            numerical_features: vec!["year".into()],
            categorical_features: vec!["model".into()],
            ..Default::default()
        };

        let evaluator = SummaryStatsEvaluator::new();
        let first = evaluator
            .evaluate(&reference, &current, &columns, &MonitorKind::ALL)
            .unwrap();
        let second = evaluator
            .evaluate(&reference, &current, &columns, &MonitorKind::ALL)
            .unwrap();

        assert!(!first.is_empty());
        assert_eq!(first, second);

        let mean_error = find(&first, "regression_performance:mean_error").unwrap();
        assert_eq!(mean_error.value, MetricValue::Gauge(1.0));
    }

    #[test]
    fn test_category_distance() {
        let reference: Vec<Record> = ["a", "a", "b", "b"]
            .iter()
            .map(|c| Record::new().with("model", *c))
            .collect();
        let current: Vec<Record> = ["a", "a", "a", "c"]
            .iter()
            .map(|c| Record::new().with("model", *c))
            .collect();

        let distance = total_variation(
            &category_shares(&reference, "model"),
            &category_shares(&current, "model"),
        )
        .unwrap();
        // |0.5-0.75| + |0.5-0| + |0-0.25| = 1.0
        assert!((distance - 0.5).abs() < 1e-9);
        assert_eq!(total_variation(&BTreeMap::new(), &category_shares(&current, "model")), None);
    }

    // ------------------------------------------------------------------------
    // Configuration & loading
    // ------------------------------------------------------------------------

    const CONFIG_TOML: &str = r#"
[service]
datasets_path = "datasets"
window_size = 50
min_window_size = 50
calculation_period = "15s"

[logging]
level = "debug"
format = "json"

[datasets.cars]
monitors = ["data_drift", "regression_performance"]
recompute_period = "60s"
compute_auxiliary_error_measures = false

[datasets.cars.column_mapping]
target = "price"
prediction = "prediction"
numerical_features = ["year", "km_driven"]
categorical_features = ["model"]

[datasets.bikes]
monitors = ["data_quality"]
window_capacity = 20
min_window_size = 5
"#;

    #[test]
    fn test_config_parse() {
        let config = MonitorConfig::from_toml_str(CONFIG_TOML).unwrap();
        assert_eq!(config.datasets.len(), 2);
        assert_eq!(config.logging.format, "json");

        let cars = &config.datasets["cars"];
        assert_eq!(
            cars.monitors,
            vec![MonitorKind::DataDrift, MonitorKind::RegressionPerformance]
        );
        assert_eq!(cars.column_mapping.target.as_deref(), Some("price"));
        assert_eq!(
            cars.window_settings(&config.service),
            WindowSettings::new(50, 50, Duration::from_secs(60)).with_auxiliary_error_measures(false)
        );

        let bikes = &config.datasets["bikes"];
        assert_eq!(
            bikes.window_settings(&config.service),
            WindowSettings::new(20, 5, Duration::from_secs(15))
        );
        assert_eq!(
            config.reference_path("bikes", bikes),
            PathBuf::from("datasets").join("bikes").join(REFERENCE_FILE_NAME)
        );
    }

    #[test]
    fn test_config_defaults() {
        let config = MonitorConfig::from_toml_str("[datasets.cars]\n").unwrap();
        let settings = config.datasets["cars"].window_settings(&config.service);

        assert_eq!(settings.capacity, DEFAULT_WINDOW_SIZE);
        assert_eq!(settings.min_size, DEFAULT_WINDOW_SIZE);
        assert_eq!(settings.period, Duration::from_secs(DEFAULT_CALCULATION_PERIOD_SECS));
        assert!(settings.auxiliary_error_measures);
        assert_eq!(config.service.metric_namespace, DEFAULT_METRIC_NAMESPACE);
    }

    #[rstest]
    #[case::min_above_capacity("[datasets.cars]\nwindow_capacity = 10\nmin_window_size = 11\n")]
    #[case::zero_capacity("[datasets.cars]\nwindow_capacity = 0\nmin_window_size = 0\n")]
    #[case::zero_period("[datasets.cars]\nrecompute_period = \"0s\"\n")]
    fn test_config_rejects_invalid_windows(#[case] toml: &str) {
        assert!(matches!(
            MonitorConfig::from_toml_str(toml),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_config_rejects_unknown_monitor() {
        let result = MonitorConfig::from_toml_str("[datasets.cars]\nmonitors = [\"magic\"]\n");
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let rendered = MonitorConfig::generate_default_config().unwrap();
        assert!(rendered.contains("[datasets.cars]"));

        let config = MonitorConfig::from_toml_str(&rendered).unwrap();
        let cars = &config.datasets["cars"];
        assert_eq!(cars.column_mapping.prediction.as_deref(), Some("prediction"));
        assert_eq!(cars.recompute_period, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift-monitor.toml");
        fs::write(&path, CONFIG_TOML).unwrap();

        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config.datasets.len(), 2);

        assert!(matches!(
            MonitorConfig::load(dir.path().join("missing.toml")),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_config_read_defers_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drift-monitor.toml");
        fs::write(&path, "[datasets.cars]\nwindow_capacity = 10\nmin_window_size = 11\n").unwrap();

        let config = MonitorConfig::read(&path).unwrap();
        assert_eq!(config.datasets["cars"].min_window_size, Some(11));
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { .. })));
        assert!(matches!(
            MonitorConfig::load(&path),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_config_accepts_very_long_period() {
        let config =
            MonitorConfig::from_toml_str("[datasets.cars]\nmin_window_size = 1\nrecompute_period = \"300years\"\n")
                .unwrap();
        let settings = config.datasets["cars"].window_settings(&config.service);
        assert!(settings.period > Duration::from_secs(9_000_000_000));
    }

    #[test]
    fn test_loader_reads_array_and_ndjson() {
        let array = JsonReferenceLoader::parse("cars", r#"[{"a": 1}, {"a": 2}]"#).unwrap();
        let ndjson = JsonReferenceLoader::parse("cars", "{\"a\": 1}\n\n{\"a\": 2}\n").unwrap();

        assert_eq!(array.len(), 2);
        assert_eq!(array, ndjson);
        assert_eq!(array[1].get_f64("a"), Some(2.0));
    }

    #[test]
    fn test_loader_reports_bad_line() {
        let result = JsonReferenceLoader::parse("cars", "{\"a\": 1}\nnot json\n");
        assert!(matches!(result, Err(LoaderError::Parse { line: 2, .. })));
    }

    #[test]
    fn test_ingest_event_parsing() {
        let event = IngestEvent::parse(r#"{"dataset": "cars", "rows": [{"a": 1}]}"#, None).unwrap();
        assert_eq!(event.dataset, "cars");
        assert_eq!(event.rows.len(), 1);

        let bare = IngestEvent::parse(r#"{"a": 1}"#, Some("bikes")).unwrap();
        assert_eq!(bare.dataset, "bikes");
        assert_eq!(bare.rows, vec![Record::new().with("a", 1)]);

        let array = IngestEvent::parse(r#"[{"a": 1}, {"a": 2}]"#, Some("bikes")).unwrap();
        assert_eq!(array.rows.len(), 2);

        assert_eq!(
            IngestEvent::parse(r#"{"a": 1}"#, None),
            Err(ReplayError::MissingDataset)
        );
        assert_eq!(
            IngestEvent::parse(r#"[{"a": 1}, 2]"#, Some("bikes")),
            Err(ReplayError::NotAnObject { index: 1 })
        );
        assert!(matches!(
            IngestEvent::parse("not json", Some("bikes")),
            Err(ReplayError::InvalidJson { .. })
        ));
    }
}


#[cfg(test)]
mod orchestrator_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    const T0: i64 = 1_700_000_000;

    #[derive(Debug, Default)]
    struct CountingEvaluator {
        calls: AtomicUsize,
    }

    impl CountingEvaluator {
        fn calls(&self) -> usize {
            self.calls.load(AtomicOrdering::SeqCst)
        }
    }

    impl MetricEvaluator for CountingEvaluator {
        fn name(&self) -> &str {
            "counting"
        }

        fn evaluate(
            &self,
            _reference: &[Record],
            _current: &[Record],
            _columns: &ColumnMapping,
            _monitors: &[MonitorKind],
        ) -> Result<Vec<MetricTriple>, EvaluationError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(vec![MetricTriple::gauge("drift_score", 0.42).with_label("column", "age")])
        }
    }

    #[derive(Debug)]
    struct FailingEvaluator;

    impl MetricEvaluator for FailingEvaluator {
        fn name(&self) -> &str {
            "failing"
        }

        fn evaluate(
            &self,
            _reference: &[Record],
            _current: &[Record],
            _columns: &ColumnMapping,
            _monitors: &[MonitorKind],
        ) -> Result<Vec<MetricTriple>, EvaluationError> {
            Err(EvaluationError::Other("boom".into()))
        }
    }

    fn car(id: u64) -> Record {
        Record::new()
            .with("id", id)
            .with("year", 2010 + (id % 10))
            .with("model", if id % 2 == 0 { "sedan" } else { "hatch" })
            .with("price", 1000.0 + id as f64)
            .with("prediction", 1010.0 + id as f64)
    }

    fn cars(range: std::ops::Range<u64>) -> Vec<Record> {
        range.map(car).collect()
    }

    fn definition(settings: WindowSettings) -> DatasetDefinition {
        DatasetDefinition::new("cars", ReferenceStore::load(cars(0..10)), settings)
            .with_columns(ColumnMapping {
                target: Some("price".into()),
                prediction: Some("prediction".into()),
                numerical_features: vec!["year".into()],
                categorical_features: vec!["model".into()],
                ..Default::default()
            })
            .with_monitors(vec![MonitorKind::DataDrift])
    }

    fn orchestrator(
        evaluator: Arc<dyn MetricEvaluator>,
        clock: Arc<dyn Clock>,
        settings: WindowSettings,
    ) -> MonitoringOrchestrator {
        let registry = Arc::new(MetricRegistry::new(DEFAULT_METRIC_NAMESPACE).unwrap());
        MonitoringOrchestrator::new(vec![definition(settings)], evaluator, clock, registry).unwrap()
    }

    fn cars_settings() -> WindowSettings {
        WindowSettings::new(50, 50, Duration::from_secs(60))
    }

    #[test]
    fn test_cars_schedule() {
        let evaluator = Arc::new(CountingEvaluator::default());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(T0)));
        let orch = orchestrator(evaluator.clone(), clock.clone(), cars_settings());

        let outcome = orch.ingest("cars", cars(0..49)).unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::WarmingUp {
                window_len: 49,
                min_window_size: 50
            }
        );
        assert_eq!(evaluator.calls(), 0);

        let outcome = orch.ingest("cars", cars(49..50)).unwrap();
        assert!(outcome.is_evaluated());
        assert_eq!(outcome.window_len(), 50);
        assert_eq!(evaluator.calls(), 1);

        clock.advance(Duration::from_secs(30));
        let outcome = orch.ingest("cars", cars(50..60)).unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::NotDue {
                window_len: 50,
                next_eligible: Timestamp::from_secs(T0 + 60)
            }
        );
        assert_eq!(evaluator.calls(), 1);

        clock.advance(Duration::from_secs(30));
        let outcome = orch.ingest("cars", cars(60..61)).unwrap();
        assert!(outcome.is_evaluated());
        assert_eq!(evaluator.calls(), 2);

        let window = orch.window_snapshot("cars").unwrap();
        assert_eq!(window.len(), 50);
        assert_eq!(window[0].get("id"), Some(&JsonValue::from(11u64)));
        assert_eq!(window[49].get("id"), Some(&JsonValue::from(60u64)));

        assert_eq!(orch.evaluations("cars").unwrap(), 2);
        assert_eq!(orch.last_evaluated("cars").unwrap(), Some(Timestamp::from_secs(T0 + 60)));
        assert_eq!(orch.gate_state("cars").unwrap(), GateState::Waiting);

        let stats = orch.stats();
        assert_eq!(stats.ingests, 4);
        assert_eq!(stats.rows, 61);
        assert_eq!(stats.warming_up, 1);
        assert_eq!(stats.not_due, 1);
        assert_eq!(stats.evaluations, 2);
    }

    #[test]
    fn test_late_run_rearms_from_run_time() {
        let evaluator = Arc::new(CountingEvaluator::default());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(T0)));
        let orch = orchestrator(
            evaluator.clone(),
            clock.clone(),
            WindowSettings::new(10, 1, Duration::from_secs(60)),
        );

        assert!(orch.ingest("cars", cars(0..1)).unwrap().is_evaluated());

        clock.set(Timestamp::from_secs(T0 + 90));
        assert!(orch.ingest("cars", cars(1..2)).unwrap().is_evaluated());

        clock.set(Timestamp::from_secs(T0 + 149));
        assert_eq!(
            orch.ingest("cars", cars(2..3)).unwrap(),
            IngestOutcome::NotDue {
                window_len: 3,
                next_eligible: Timestamp::from_secs(T0 + 150)
            }
        );

        clock.set(Timestamp::from_secs(T0 + 150));
        assert!(orch.ingest("cars", cars(3..4)).unwrap().is_evaluated());
        assert_eq!(evaluator.calls(), 3);
    }

    #[test]
    fn test_very_long_period_evaluates_once() {
        let evaluator = Arc::new(CountingEvaluator::default());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(T0)));
        let orch = orchestrator(
            evaluator.clone(),
            clock,
            WindowSettings::new(10, 1, Duration::from_secs(9_467_280_000)),
        );

        assert!(orch.ingest("cars", cars(0..1)).unwrap().is_evaluated());
        assert!(!orch.ingest("cars", cars(1..2)).unwrap().is_evaluated());
        assert_eq!(orch.evaluations("cars").unwrap(), 1);
        assert_eq!(evaluator.calls(), 1);
    }

    #[test]
    fn test_evaluation_publishes_everything() {
        let evaluator = Arc::new(CountingEvaluator::default());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(T0)));
        let orch = orchestrator(evaluator, clock, cars_settings());

        let outcome = orch.ingest("cars", cars(0..50)).unwrap();
        let report = outcome.report().unwrap();
        // evaluator triple, rmse, mae, reference hash
        assert_eq!(report.recorded, 4);
        assert!(report.is_clean());

        let registry = orch.registry();
        assert_eq!(
            registry.value(
                "evidently:loss_metric",
                &[("dataset_name", "cars"), ("loss_function", "rmse")]
            ),
            Some(10.0)
        );
        assert_eq!(
            registry.value(
                "evidently:loss_metric",
                &[("dataset_name", "cars"), ("loss_function", "mae")]
            ),
            Some(10.0)
        );

        let fingerprint = orch.fingerprint("cars").unwrap().to_string();
        let text = orch.render().unwrap();
        assert!(text.contains("evidently:drift_score{column=\"age\",dataset_name=\"cars\"} 0.42"));
        assert!(text.contains(&format!(
            "evidently:reference_dataset_hash{{dataset_name=\"cars\",hash=\"{}\"}} 1",
            fingerprint
        )));
        assert!(text.contains("drift_monitor_evaluations_total{dataset_name=\"cars\"} 1"));
        assert!(text.contains("drift_monitor_window_rows{dataset_name=\"cars\"} 50"));
    }

    #[test]
    fn test_unknown_dataset_changes_nothing() {
        let evaluator = Arc::new(CountingEvaluator::default());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(T0)));
        let orch = orchestrator(evaluator.clone(), clock, cars_settings());

        let result = orch.ingest("bikes", cars(0..60));
        assert!(matches!(result, Err(MonitorError::UnknownDataset { ref name }) if name == "bikes"));

        assert_eq!(orch.window_len("cars").unwrap(), 0);
        assert_eq!(evaluator.calls(), 0);
        assert!(orch.registry().is_empty());
        assert_eq!(orch.stats().unknown_dataset, 1);
        assert!(matches!(orch.window_len("bikes"), Err(MonitorError::UnknownDataset { .. })));
    }

    #[test]
    fn test_evaluator_failure_still_publishes_auxiliary_metrics() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(T0)));
        let orch = orchestrator(
            Arc::new(FailingEvaluator),
            clock,
            WindowSettings::new(10, 1, Duration::from_secs(60)),
        );

        let outcome = orch.ingest("cars", cars(0..3)).unwrap();
        assert_eq!(outcome.report().map(|r| r.recorded), Some(3));
        assert_eq!(orch.stats().evaluator_failures, 1);
        assert_eq!(
            orch.registry().schema("evidently:reference_dataset_hash"),
            Some(vec![CompactString::from("dataset_name"), CompactString::from("hash")])
        );
    }

    #[test]
    fn test_missing_prediction_skips_only_measures() {
        let evaluator = Arc::new(CountingEvaluator::default());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(T0)));
        let orch = orchestrator(
            evaluator,
            clock,
            WindowSettings::new(10, 1, Duration::from_secs(60)),
        );

        let outcome = orch
            .ingest("cars", vec![Record::new().with("price", 1.0)])
            .unwrap();
        assert_eq!(outcome.report().map(|r| r.recorded), Some(2));
        assert_eq!(orch.stats().measure_failures, 1);
        assert_eq!(orch.registry().schema("evidently:loss_metric"), None);
    }

    #[test]
    fn test_auxiliary_measures_can_be_disabled() {
        let evaluator = Arc::new(CountingEvaluator::default());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(T0)));
        let orch = orchestrator(
            evaluator,
            clock,
            WindowSettings::new(10, 1, Duration::from_secs(60)).with_auxiliary_error_measures(false),
        );

        orch.ingest("cars", cars(0..5)).unwrap();
        assert_eq!(orch.registry().schema("evidently:loss_metric"), None);
        assert_eq!(orch.stats().measure_failures, 0);
    }

    #[test]
    fn test_concurrent_ingest_evaluates_once_per_period() {
        let evaluator = Arc::new(CountingEvaluator::default());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(T0)));
        let orch = orchestrator(
            evaluator.clone(),
            clock,
            WindowSettings::new(100, 1, Duration::from_secs(60)),
        );

        let evaluated = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for i in 0..8 {
                let orch = &orch;
                let evaluated = &evaluated;
                scope.spawn(move || {
                    let outcome = orch.ingest("cars", vec![car(i)]).unwrap();
                    if outcome.is_evaluated() {
                        evaluated.fetch_add(1, AtomicOrdering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(evaluated.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(evaluator.calls(), 1);
        assert_eq!(orch.window_len("cars").unwrap(), 8);
    }

    #[test]
    fn test_duplicate_datasets_are_rejected() {
        let registry = Arc::new(MetricRegistry::new(DEFAULT_METRIC_NAMESPACE).unwrap());
        let result = MonitoringOrchestrator::new(
            vec![definition(cars_settings()), definition(cars_settings())],
            Arc::new(CountingEvaluator::default()),
            Arc::new(SystemClock),
            registry,
        );

        assert!(matches!(
            result,
            Err(MonitorError::Config(ConfigError::DuplicateDataset { .. }))
        ));
    }

    fn write_reference(root: &Path, dataset: &str, rows: &[Record]) {
        let dir = root.join(dataset);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(REFERENCE_FILE_NAME), serde_json::to_string(rows).unwrap()).unwrap();
    }

    #[test]
    fn test_from_config_loads_references() {
        let dir = tempfile::tempdir().unwrap();
        let datasets = dir.path().join("datasets");
        let rows = cars(0..3);
        write_reference(&datasets, "cars", &rows);
        fs::create_dir_all(datasets.join("bikes")).unwrap();

        let mut config = MonitorConfig::example();
        config.service.datasets_path = datasets;

        assert_eq!(discover_unconfigured(&config), vec!["bikes".to_string()]);

        let orch = MonitoringOrchestrator::from_config(
            &config,
            &JsonReferenceLoader,
            Arc::new(SummaryStatsEvaluator::new()),
            Arc::new(SystemClock),
        )
        .unwrap();

        assert_eq!(orch.datasets(), vec!["cars"]);
        assert_eq!(
            orch.fingerprint("cars").unwrap(),
            ReferenceStore::compute_fingerprint(&rows).as_str()
        );
        assert_eq!(orch.definition("cars").unwrap().settings.period, Duration::from_secs(60));
    }

    #[test]
    fn test_from_config_enforces_reference_size() {
        let dir = tempfile::tempdir().unwrap();
        let datasets = dir.path().join("datasets");
        write_reference(&datasets, "cars", &cars(0..3));

        let mut config = MonitorConfig::example();
        config.service.datasets_path = datasets;
        config.service.min_reference_size = 10;

        let result = MonitoringOrchestrator::from_config(
            &config,
            &JsonReferenceLoader,
            Arc::new(SummaryStatsEvaluator::new()),
            Arc::new(SystemClock),
        );
        assert!(matches!(
            result,
            Err(MonitorError::Loader(LoaderError::TooSmall { rows: 3, required: 10, .. }))
        ));

        config.service.datasets_path = dir.path().join("nowhere");
        config.service.min_reference_size = 1;
        let result = MonitoringOrchestrator::from_config(
            &config,
            &JsonReferenceLoader,
            Arc::new(SummaryStatsEvaluator::new()),
            Arc::new(SystemClock),
        );
        assert!(matches!(result, Err(MonitorError::Loader(LoaderError::Io { .. }))));
    }

    #[test]
    fn test_replay_events() {
        let evaluator = Arc::new(CountingEvaluator::default());
        let clock = Arc::new(ManualClock::new(Timestamp::from_secs(T0)));
        let orch = orchestrator(
            evaluator.clone(),
            clock,
            WindowSettings::new(10, 2, Duration::from_secs(60)),
        );

        let input = [
            r#"{"dataset": "cars", "rows": [{"price": 1.0, "prediction": 2.0}]}"#,
            "",
            r#"{"dataset": "bikes", "rows": [{"price": 1.0}]}"#,
            "not json",
            r#"{"price": 3.0, "prediction": 3.0}"#,
        ]
        .join("\n");

        let summary = replay_events(&orch, io::Cursor::new(input), Some("cars")).unwrap();
        assert_eq!(
            summary,
            ReplaySummary {
                events: 3,
                rows: 3,
                evaluations: 1,
                rejected: 1,
                malformed: 1,
            }
        );
        assert_eq!(orch.window_len("cars").unwrap(), 2);
        assert_eq!(evaluator.calls(), 1);
    }
}
