//! Structured logging.
//!
//! All log output goes through `tracing`. This module adds the two pieces
//! request handling needs on top of it:
//!
//! - [`Meta`], the per-request string map that middleware fill in as a request
//!   travels through the pipeline, and
//! - [`RequestLogger`], which emits events tagged with an event name and a
//!   rendering of that map.
//!
//! [`init`] installs the process subscriber from the `LOG_MINFILTER` value.

use std::collections::BTreeMap;
use std::fmt;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt as tracing_fmt};

/// Prefix marking structured fields inside a [`Meta`] map.
pub const ENTRY_PREFIX: &str = "entry.";

/// String-keyed request metadata.
///
/// Keys written through [`Meta::insert_entry`] are namespaced with
/// [`ENTRY_PREFIX`]; anything else is free-form data supplied by a route's
/// meta function. Ordered so log lines are stable.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Meta(BTreeMap<String, String>);

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Inserts `entry.<key>`; empty values are skipped.
    pub fn insert_entry(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if value.is_empty() {
            return;
        }
        self.0.insert(format!("{ENTRY_PREFIX}{key}"), value);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Looks up `entry.<key>`.
    pub fn entry(&self, key: &str) -> Option<&str> {
        self.get(&format!("{ENTRY_PREFIX}{key}"))
    }

    /// Copies every pair of `other` into `self`, overwriting on conflict.
    pub fn merge(&mut self, other: &Meta) {
        self.0.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Meta {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Renders as space separated `key="value"` pairs.
impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.0 {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{k}={v:?}")?;
            first = false;
        }
        Ok(())
    }
}

// ── RequestLogger ─────────────────────────────────────────────────────────────

/// A logger bound to one request's [`Meta`].
///
/// Every event carries an `event` name (e.g. `"ApiRequest"`) and the meta map
/// as the `meta` field.
#[derive(Clone, Debug)]
pub struct RequestLogger {
    meta: Meta,
}

impl RequestLogger {
    pub fn new(meta: Meta) -> Self {
        Self { meta }
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn debug(&self, event: &str, msg: impl fmt::Display) {
        tracing::debug!(event, meta = %self.meta, "{msg}");
    }

    pub fn info(&self, event: &str, msg: impl fmt::Display) {
        tracing::info!(event, meta = %self.meta, "{msg}");
    }

    pub fn warn(&self, event: &str, msg: impl fmt::Display) {
        tracing::warn!(event, meta = %self.meta, "{msg}");
    }

    pub fn error(&self, event: &str, msg: impl fmt::Display) {
        tracing::error!(event, meta = %self.meta, "{msg}");
    }
}

// ── Subscriber setup ──────────────────────────────────────────────────────────

/// Maps a `LOG_MINFILTER` value onto a level filter.
///
/// Accepts `debug`, `info`, `warning` (or `warn`) and `error`, ignoring case.
/// Returns `None` for anything else.
pub fn parse_min_filter(value: &str) -> Option<LevelFilter> {
    match value.trim().to_ascii_lowercase().as_str() {
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warning" | "warn" => Some(LevelFilter::WARN),
        "error" => Some(LevelFilter::ERROR),
        _ => None,
    }
}

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG`, when set, wins over `min_filter`. Calling this more than once
/// is harmless: the first subscriber stays installed.
pub fn init(min_filter: &str) {
    let parsed = parse_min_filter(min_filter);
    let level = parsed.unwrap_or(LevelFilter::WARN);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_fmt::layer().with_target(true))
        .try_init()
        .is_ok();

    if !installed {
        tracing::debug!("tracing subscriber already installed, keeping it");
    }
    if parsed.is_none() {
        tracing::warn!(value = min_filter, "failed parsing log level, defaulting to 'Warning'");
    }
}
