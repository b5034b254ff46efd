//! Engine Service - Analyzes ad-campaign performance rows against a budget plan
//!
//! Responsibilities:
//! - Resolve unpredictable spreadsheet headers to canonical roles (date,
//!   dimensions, metrics), merging a user-supplied mapping with an external
//!   classifier
//! - Clean rows: normalize dates, coerce numeric-looking text, drop noise
//! - Compute day-over-day comparisons overall and per dimension
//! - Reconcile actual spend against the budget ("mix") dataset
//! - Publish lifecycle events to live SSE listeners
//! - Enrich the report with narrative insight and a brand color from the
//!   text-generation collaborator (best effort, never fatal)
//!
//! Endpoints:
//! - GET  /health  - Health check
//! - POST /analyze - Run a full analysis over posted rows
//! - GET  /stream  - Live progress events (SSE)

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{self, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{Days, NaiveDate, NaiveDateTime};
use futures::future::{join_all, BoxFuture};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
struct Config {
    bind: String,
    llm_api_url: Option<String>,
    llm_api_key: Option<String>,
    llm_model: String,
}

impl Config {
    fn from_env() -> Self {
        Self {
            bind: std::env::var("ENGINE_BIND").unwrap_or_else(|_| "127.0.0.1:8001".to_string()),
            llm_api_url: std::env::var("LLM_API_URL").ok().filter(|v| !v.is_empty()),
            llm_api_key: std::env::var("LLM_API_KEY").ok().filter(|v| !v.is_empty()),
            llm_model: std::env::var("LLM_MODEL").unwrap_or_else(|_| "gemini-1.5-flash".to_string()),
        }
    }
}

// ============================================================================
// Request / response types
// ============================================================================

/// One raw spreadsheet row: open field shape, column name -> cell value.
type Record = serde_json::Map<String, Value>;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AnalysisRequest {
    #[serde(alias = "rawRows")]
    raw_rows: Vec<Record>,
    #[serde(alias = "mixRows")]
    mix_rows: Vec<Record>,
    mappings: Mappings,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Mappings {
    #[serde(alias = "rawMapping")]
    raw_mapping: RawMapping,
}

/// Partial role -> column-name mapping, as supplied by the caller or returned
/// by the external column classifier. Absent and empty values mean unresolved.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMapping {
    #[serde(alias = "dateCol")]
    date_col: Option<String>,
    #[serde(alias = "mediaCol")]
    media_col: Option<String>,
    #[serde(alias = "creativeCol")]
    creative_col: Option<String>,
    #[serde(alias = "impCol")]
    imp_col: Option<String>,
    #[serde(alias = "costCol")]
    cost_col: Option<String>,
    #[serde(alias = "clickCol")]
    click_col: Option<String>,
    #[serde(alias = "viewCol")]
    view_col: Option<String>,
    #[serde(alias = "advertiserCol")]
    advertiser_col: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct MetricSet {
    today: i64,
    prev: i64,
    total: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct MetricBreakdown {
    impressions: MetricSet,
    clicks: MetricSet,
    spend: MetricSet,
    views: MetricSet,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct DimensionComparison {
    name: String,
    metrics: MetricBreakdown,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisResult {
    date: NaiveDate,
    prev_date: Option<NaiveDate>,
    media_comparison: Vec<DimensionComparison>,
    creative_comparison: Vec<DimensionComparison>,
    overall: MetricBreakdown,
    budget_total: i64,
    total_spend: i64,
    budget_achievement: f64,
    advertiser: String,
    brand_color: String,
    insight: String,
    insight_summary: String,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Errors
// ============================================================================

/// Per-stage analysis failure. Validation covers caller-fixable input problems
/// (missing columns, empty datasets, no dated rows); Unexpected covers internal
/// faults. Collaborator failures never reach this type - they degrade to
/// fallback values inside the insight client.
#[derive(Debug, thiserror::Error)]
enum AnalysisError {
    #[error("{0}")]
    Validation(String),
    #[error("analysis failed: {0}")]
    Unexpected(String),
}

// ============================================================================
// Column Resolver
// ============================================================================

/// Header names that identify an advertiser column when no mapping names one.
const ADVERTISER_HINTS: &[&str] = &["advertiser", "client", "광고주", "광고주명"];

/// Placeholder used when no advertiser can be inferred from the dataset.
const DEFAULT_ADVERTISER: &str = "Nasmedia";

/// Canonical role -> actual column name, computed once per request and shared
/// by the cleaning, aggregation, and reconciliation stages.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedColumns {
    date: String,
    media: Option<String>,
    creative: Option<String>,
    advertiser: Option<String>,
    impressions: Option<String>,
    clicks: Option<String>,
    spend: Option<String>,
    views: Option<String>,
}

/// Precedence rule for one role: the externally-classified column wins when it
/// is non-empty and actually present among the headers, otherwise the
/// user-supplied column is used under the same presence check.
fn pick_column(headers: &[String], external: Option<&str>, user: Option<&str>) -> Option<String> {
    let known = |name: &str| !name.is_empty() && headers.iter().any(|h| h == name);
    external
        .filter(|c| known(c))
        .or_else(|| user.filter(|c| known(c)))
        .map(str::to_string)
}

fn resolve_columns(
    headers: &[String],
    user: &RawMapping,
    external: &RawMapping,
) -> Result<ResolvedColumns, AnalysisError> {
    let pick = |ext: &Option<String>, usr: &Option<String>| {
        pick_column(headers, ext.as_deref(), usr.as_deref())
    };

    let date = pick(&external.date_col, &user.date_col);
    let media = pick(&external.media_col, &user.media_col);
    let creative = pick(&external.creative_col, &user.creative_col);
    let impressions = pick(&external.imp_col, &user.imp_col);
    let spend = pick(&external.cost_col, &user.cost_col);
    let clicks = pick(&external.click_col, &user.click_col);
    let views = pick(&external.view_col, &user.view_col);

    let mut advertiser = pick(&external.advertiser_col, &user.advertiser_col);
    if advertiser.is_none() {
        advertiser = headers
            .iter()
            .find(|h| ADVERTISER_HINTS.contains(&h.to_lowercase().as_str()))
            .cloned();
    }

    let mut missing = Vec::new();
    if date.is_none() {
        missing.push("date");
    }
    if impressions.is_none() && spend.is_none() && views.is_none() {
        missing.push("performance metric (impressions/spend/views)");
    }

    match date {
        Some(date) if missing.is_empty() => Ok(ResolvedColumns {
            date,
            media,
            creative,
            advertiser,
            impressions,
            clicks,
            spend,
            views,
        }),
        _ => Err(AnalysisError::Validation(format!(
            "required columns could not be resolved: {}",
            missing.join(", ")
        ))),
    }
}

/// Union of column names across rows, in first-seen order.
fn collect_headers(rows: &[Record]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut headers = Vec::new();
    for row in rows {
        for key in row.keys() {
            if seen.insert(key.clone()) {
                headers.push(key.clone());
            }
        }
    }
    headers
}

// ============================================================================
// Data Cleaner
// ============================================================================

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%m/%d/%Y", "%Y%m%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
];

/// Largest Excel serial day we accept (9999-12-31).
const EXCEL_SERIAL_MAX: i64 = 2_958_465;

/// Interpret a numeric cell as a calendar date: either a literal yyyymmdd
/// number or an Excel serial day (epoch 1899-12-30, fractional time dropped).
fn date_from_serial(n: f64) -> Option<NaiveDate> {
    if !n.is_finite() || n < 1.0 {
        return None;
    }
    let whole = n.floor() as i64;
    if (19_000_101..=99_991_231).contains(&whole) {
        return NaiveDate::parse_from_str(&whole.to_string(), "%Y%m%d").ok();
    }
    if whole > EXCEL_SERIAL_MAX {
        return None;
    }
    NaiveDate::from_ymd_opt(1899, 12, 30)?.checked_add_days(Days::new(whole as u64))
}

fn parse_date_str(s: &str) -> Option<NaiveDate> {
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.date());
        }
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    s.parse::<f64>().ok().and_then(date_from_serial)
}

/// Normalize a cell to a calendar date (no time-of-day, no timezone).
/// Null, blank, and unparseable input all map to None.
fn parse_cell_date(value: &Value) -> Option<NaiveDate> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return None;
            }
            parse_date_str(s)
        }
        Value::Number(n) => n.as_f64().and_then(date_from_serial),
        _ => None,
    }
}

/// Coerce a cell to a non-negative integer count. Null, blank, and a lone
/// dash are 0; numbers round to nearest; strings are stripped down to digits,
/// '.' and '-' before parsing. Malformed or negative input coerces to 0.
fn coerce_count(value: &Value) -> i64 {
    let count = match value {
        Value::Number(n) => n.as_f64().map(|f| f.round() as i64).unwrap_or(0),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed == "-" {
                return 0;
            }
            let cleaned: String = trimmed
                .chars()
                .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            if cleaned.is_empty() || cleaned == "-" {
                return 0;
            }
            cleaned.parse::<f64>().map(|f| f.round() as i64).unwrap_or(0)
        }
        _ => 0,
    };
    count.max(0)
}

/// One validated performance row. Fixed shape: built once at the ingestion
/// boundary so downstream stages never touch the open records again.
#[derive(Debug, Clone, PartialEq)]
struct CleanRow {
    date: NaiveDate,
    media: Option<String>,
    creative: Option<String>,
    advertiser: Option<String>,
    impressions: i64,
    clicks: i64,
    spend: i64,
    views: i64,
}

fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Drop rows without a parseable date, coerce every resolved metric, and keep
/// only rows with at least one metric strictly above zero.
fn clean_rows(rows: &[Record], cols: &ResolvedColumns) -> Vec<CleanRow> {
    rows.iter()
        .filter_map(|row| {
            let date = parse_cell_date(row.get(&cols.date)?)?;
            let metric = |col: &Option<String>| {
                col.as_ref()
                    .and_then(|c| row.get(c))
                    .map(coerce_count)
                    .unwrap_or(0)
            };
            let text = |col: &Option<String>| col.as_ref().and_then(|c| row.get(c)).and_then(cell_text);
            let clean = CleanRow {
                date,
                media: text(&cols.media),
                creative: text(&cols.creative),
                advertiser: text(&cols.advertiser),
                impressions: metric(&cols.impressions),
                clicks: metric(&cols.clicks),
                spend: metric(&cols.spend),
                views: metric(&cols.views),
            };
            let active = clean.impressions > 0 || clean.clicks > 0 || clean.spend > 0 || clean.views > 0;
            active.then_some(clean)
        })
        .collect()
}

// ============================================================================
// Comparative Aggregator
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct StatTotals {
    impressions: i64,
    clicks: i64,
    spend: i64,
    views: i64,
}

/// Per-metric sums over rows matching the given date, or over all dates when
/// no date is given.
fn slice_stats<'a, I>(rows: I, date: Option<NaiveDate>) -> StatTotals
where
    I: IntoIterator<Item = &'a CleanRow>,
{
    let mut totals = StatTotals::default();
    for row in rows {
        if date.is_some_and(|d| row.date != d) {
            continue;
        }
        totals.impressions += row.impressions;
        totals.clicks += row.clicks;
        totals.spend += row.spend;
        totals.views += row.views;
    }
    totals
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

/// Day-over-day percentage change, defined as 0 when the baseline is 0.
fn pct_delta(today: i64, prev: i64) -> f64 {
    if prev > 0 {
        round1((today - prev) as f64 / prev as f64 * 100.0)
    } else {
        0.0
    }
}

/// One Metric Set per metric kind. Only impressions carry a delta figure; the
/// other metrics report today/prev/total without one.
fn build_metrics(today: StatTotals, prev: StatTotals, total: StatTotals) -> MetricBreakdown {
    MetricBreakdown {
        impressions: MetricSet {
            today: today.impressions,
            prev: prev.impressions,
            total: total.impressions,
            delta: Some(pct_delta(today.impressions, prev.impressions)),
        },
        clicks: MetricSet {
            today: today.clicks,
            prev: prev.clicks,
            total: total.clicks,
            delta: None,
        },
        spend: MetricSet {
            today: today.spend,
            prev: prev.spend,
            total: total.spend,
            delta: None,
        },
        views: MetricSet {
            today: today.views,
            prev: prev.views,
            total: total.views,
            delta: None,
        },
    }
}

/// Latest distinct date and, when present, the second latest.
fn target_dates(rows: &[CleanRow]) -> Option<(NaiveDate, Option<NaiveDate>)> {
    let mut dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
    dates.sort_unstable_by(|a, b| b.cmp(a));
    dates.dedup();
    let (target, rest) = dates.split_first()?;
    Some((*target, rest.first().copied()))
}

/// Compare every distinct value of one grouping dimension, in first-seen order.
/// Rows with a blank dimension value are skipped. When no previous date exists
/// the prev stats equal the today stats for every group.
fn compare_dimension<F>(
    rows: &[CleanRow],
    pick: F,
    target: NaiveDate,
    prev: Option<NaiveDate>,
) -> Vec<DimensionComparison>
where
    F: Fn(&CleanRow) -> Option<&String>,
{
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&CleanRow>> = HashMap::new();
    for row in rows {
        if let Some(value) = pick(row) {
            if !groups.contains_key(value) {
                order.push(value.clone());
            }
            groups.entry(value.clone()).or_default().push(row);
        }
    }

    order
        .into_iter()
        .filter_map(|name| {
            let group = groups.get(&name)?;
            let today = slice_stats(group.iter().copied(), Some(target));
            let prev_stats = match prev {
                Some(p) => slice_stats(group.iter().copied(), Some(p)),
                None => today,
            };
            let total = slice_stats(group.iter().copied(), None);
            Some(DimensionComparison {
                name,
                metrics: build_metrics(today, prev_stats, total),
            })
        })
        .collect()
}

/// Ranked view for the collaborator summary: descending today-impressions.
fn top_by_today_impressions(comparisons: &[DimensionComparison], n: usize) -> Vec<&DimensionComparison> {
    let mut ranked: Vec<&DimensionComparison> = comparisons.iter().collect();
    ranked.sort_by(|a, b| b.metrics.impressions.today.cmp(&a.metrics.impressions.today));
    ranked.truncate(n);
    ranked
}

/// Most frequent non-blank advertiser value across valid rows; ties go to the
/// first-seen value. Falls back to the placeholder name.
fn infer_advertiser(rows: &[CleanRow]) -> String {
    let mut order: Vec<&str> = Vec::new();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for row in rows {
        if let Some(name) = row.advertiser.as_deref() {
            if !counts.contains_key(name) {
                order.push(name);
            }
            *counts.entry(name).or_insert(0) += 1;
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for name in order {
        let count = counts.get(name).copied().unwrap_or(0);
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((name, count));
        }
    }
    best.map(|(name, _)| name.to_string())
        .unwrap_or_else(|| DEFAULT_ADVERTISER.to_string())
}

// ============================================================================
// Budget Reconciliation
// ============================================================================

/// Column-name terms that identify a budget/plan column.
const BUDGET_INCLUDE: &[&str] = &[
    "budget", "plan", "allocation", "gross", "net", "예산", "집행금액", "배정", "광고비",
];
/// Column-name terms that disqualify a candidate (rates, shares, attainment).
const BUDGET_EXCLUDE: &[&str] = &[
    "rate", "share", "attainment", "달성", "비율", "비중", "차이",
];
/// Row-content markers identifying pre-aggregated roll-up rows.
const ROLLUP_MARKERS: &[&str] = &["total", "sum", "합계", "종합", "계"];

/// First column whose lowercased name contains an inclusion term and none of
/// the exclusion terms.
fn select_budget_column(headers: &[String]) -> Option<String> {
    headers
        .iter()
        .find(|h| {
            let name = h.to_lowercase();
            BUDGET_INCLUDE.iter().any(|k| name.contains(k))
                && !BUDGET_EXCLUDE.iter().any(|k| name.contains(k))
        })
        .cloned()
}

/// A mix row is a roll-up (not a line item) when any of its field values,
/// concatenated and lowercased, contains a total marker - regardless of which
/// column the marker appears in.
fn is_rollup_row(row: &Record) -> bool {
    let joined = row
        .values()
        .map(|v| match v {
            Value::String(s) => s.to_lowercase(),
            other => other.to_string().to_lowercase(),
        })
        .collect::<Vec<_>>()
        .join(" ");
    ROLLUP_MARKERS.iter().any(|m| joined.contains(m))
}

/// Sum the budget column over mix rows that are not roll-ups. A missing budget
/// column is a warning, not an error: the total is simply 0.
fn reconcile_budget(mix_rows: &[Record]) -> i64 {
    if mix_rows.is_empty() {
        return 0;
    }
    let headers = collect_headers(mix_rows);
    let Some(column) = select_budget_column(&headers) else {
        eprintln!("warning: no budget column found in mix dataset");
        return 0;
    };
    println!("budget column: {column}");
    mix_rows
        .iter()
        .filter(|row| !is_rollup_row(row))
        .map(|row| row.get(&column).map(coerce_count).unwrap_or(0))
        .sum()
}

// ============================================================================
// Progress Event Pipeline
// ============================================================================

const EVENT_STARTED: &str = "analysis_started";
const EVENT_DATA_PROCESSED: &str = "data_processed";
const EVENT_STATUS: &str = "status_update";
const EVENT_COMPLETED: &str = "analysis_completed";
const EVENT_ERROR: &str = "analysis_error";

const STREAM_EVENTS: &[&str] = &[
    EVENT_STARTED,
    EVENT_DATA_PROCESSED,
    EVENT_STATUS,
    EVENT_COMPLETED,
    EVENT_ERROR,
];

type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Named-event publish/subscribe. Subscriptions are scope-bound: dropping the
/// guard returned by `subscribe` removes the handler, so a disconnected stream
/// listener never lingers in the registry. There is no replay buffer - a
/// handler registered after an event fired never sees it.
struct EventBus {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<String, Vec<(u64, EventHandler)>>>,
}

struct SubscriptionGuard {
    bus: Arc<EventBus>,
    event: String,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let mut map = self.bus.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = map.get_mut(&self.event) {
            list.retain(|(id, _)| *id != self.id);
        }
    }
}

impl EventBus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(0),
            handlers: Mutex::new(HashMap::new()),
        })
    }

    fn subscribe(self: &Arc<Self>, event: &str, handler: EventHandler) -> SubscriptionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut map = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(event.to_string()).or_default().push((id, handler));
        SubscriptionGuard {
            bus: Arc::clone(self),
            event: event.to_string(),
            id,
        }
    }

    /// Fan out to every handler currently registered for the event and wait
    /// for all of them. A failing handler is isolated: it neither aborts the
    /// emit nor blocks its siblings.
    async fn emit(&self, event: &str, payload: Value) {
        let snapshot: Vec<EventHandler> = {
            let map = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            map.get(event)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default()
        };
        if snapshot.is_empty() {
            return;
        }
        let tasks: Vec<_> = snapshot
            .into_iter()
            .map(|handler| tokio::spawn(handler(payload.clone())))
            .collect();
        for result in join_all(tasks).await {
            if let Err(err) = result {
                eprintln!("warning: event handler for '{event}' failed: {err}");
            }
        }
    }
}

// ============================================================================
// Insight Orchestrator (external collaborator client)
// ============================================================================

const FALLBACK_INSIGHT: &str = "An error occurred while generating the campaign insight.";
const FALLBACK_SUMMARY: &str = "A summary of the analysis could not be generated.";
const FALLBACK_COLOR: &str = "#4f46e5";

/// Best-effort client for the text-generation collaborator. Every call is
/// single-attempt; any failure degrades to the documented fallback value and
/// never aborts the surrounding analysis.
#[derive(Clone)]
struct InsightClient {
    http: reqwest::Client,
    api_url: Option<String>,
    api_key: Option<String>,
    model: String,
}

impl InsightClient {
    fn from_config(config: &Config) -> Result<Self> {
        // No request timeout here on purpose: the only timeout for analysis
        // calls lives at the gateway boundary.
        let http = reqwest::Client::builder()
            .user_agent("campaign-report-engine/0.1")
            .build()
            .context("Failed to build collaborator HTTP client")?;
        Ok(Self {
            http,
            api_url: config.llm_api_url.clone(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        })
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let (Some(url), Some(key)) = (self.api_url.as_deref(), self.api_key.as_deref()) else {
            anyhow::bail!("collaborator is not configured");
        };
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let resp = self
            .http
            .post(url)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .context("collaborator request failed")?
            .error_for_status()
            .context("collaborator returned an error status")?;
        let value: Value = resp.json().await.context("invalid collaborator response")?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .context("collaborator response carried no content")
    }

    /// Ask the collaborator to map arbitrary headers to canonical roles.
    /// Failure, including unparseable output, yields an empty mapping.
    async fn detect_columns(&self, headers: &[String]) -> RawMapping {
        let prompt = format!(
            "These are the column names of a spreadsheet: [{}]\n\
             Map them to the following roles and answer with JSON only, using \
             null for roles you cannot find:\n\
             {{ \"date_col\": ..., \"media_col\": ..., \"creative_col\": ..., \
             \"imp_col\": ..., \"view_col\": ..., \"cost_col\": ..., \
             \"click_col\": ..., \"advertiser_col\": ... }}\n\
             date: date/day column. media: media channel or platform. \
             creative: ad creative or asset. imp: impressions. view: video views \
             or plays. cost: spend or cost. click: clicks. advertiser: \
             advertiser or brand.",
            headers.join(", ")
        );
        match self.complete(&prompt).await {
            Ok(text) => serde_json::from_str(strip_code_fences(&text)).unwrap_or_default(),
            Err(err) => {
                eprintln!("warning: column detection failed: {err:#}");
                RawMapping::default()
            }
        }
    }

    async fn generate_insight(&self, summary: &Value) -> String {
        let prompt = format!(
            "You are an ad agency reporting specialist. Write a concise campaign \
             comment for the following results. Lead with a per-media section \
             covering the top media channels and their key efficiency figures, \
             then close with a two-to-three line overall comment. Keep it under \
             ten lines, quantitative, no introduction or conclusion.\n\n[DATA]\n{summary}"
        );
        match self.complete(&prompt).await {
            Ok(text) => text,
            Err(err) => {
                eprintln!("warning: insight generation failed: {err:#}");
                FALLBACK_INSIGHT.to_string()
            }
        }
    }

    async fn generate_summary(&self, insight: &str) -> String {
        let prompt = format!(
            "Condense the following campaign comment into at most three short \
             sentences covering campaign status, key efficiency figures, and \
             anything notable:\n---\n{insight}\n---"
        );
        match self.complete(&prompt).await {
            Ok(text) => text.trim().to_string(),
            Err(err) => {
                eprintln!("warning: summary generation failed: {err:#}");
                FALLBACK_SUMMARY.to_string()
            }
        }
    }

    async fn recommend_brand_color(&self, advertiser: &str) -> String {
        let prompt = format!(
            "You are a brand designer. Recommend the single representative brand \
             color for the advertiser '{advertiser}'. Answer with one hex code \
             starting with '#' and nothing else. If you cannot tell, answer {FALLBACK_COLOR}."
        );
        match self.complete(&prompt).await {
            Ok(text) => extract_hex_color(&text).unwrap_or_else(|| FALLBACK_COLOR.to_string()),
            Err(err) => {
                eprintln!("warning: brand color lookup failed: {err:#}");
                FALLBACK_COLOR.to_string()
            }
        }
    }
}

/// Collaborator output often arrives fenced in markdown code blocks.
fn strip_code_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// First plausible hex color token in the text, lowercased.
fn extract_hex_color(text: &str) -> Option<String> {
    let start = text.find('#')?;
    let hex: String = text[start + 1..]
        .chars()
        .take_while(|c| c.is_ascii_hexdigit())
        .collect();
    match hex.len() {
        3 | 4 | 6 | 8 => Some(format!("#{}", hex.to_lowercase())),
        _ => None,
    }
}

// ============================================================================
// Analysis pipeline
// ============================================================================

/// Compact figures handed to the collaborator for narrative generation.
#[derive(Serialize)]
struct CollaboratorSummary<'a> {
    date: NaiveDate,
    overall: &'a MetricBreakdown,
    budget_total: i64,
    total_spend: i64,
    budget_achievement: f64,
    top_media: Vec<&'a DimensionComparison>,
    top_creatives: Vec<&'a DimensionComparison>,
}

async fn run_analysis(
    req: &AnalysisRequest,
    bus: &EventBus,
    insight: &InsightClient,
) -> Result<AnalysisResult, AnalysisError> {
    // 1. Column resolution
    if req.raw_rows.is_empty() {
        return Err(AnalysisError::Validation("raw dataset is empty".to_string()));
    }
    let headers = collect_headers(&req.raw_rows);
    let external = insight.detect_columns(&headers).await;
    let resolved = resolve_columns(&headers, &req.mappings.raw_mapping, &external)?;

    // 2. Cleaning and validity filtering
    let rows = clean_rows(&req.raw_rows, &resolved);
    let Some((target, prev)) = target_dates(&rows) else {
        return Err(AnalysisError::Validation(
            "no rows with a valid date and non-zero performance metrics".to_string(),
        ));
    };
    println!("target date: {target}, prev date: {prev:?}");
    bus.emit(EVENT_DATA_PROCESSED, json!({ "date": target.to_string() }))
        .await;

    // 3. Comparative aggregation
    let today_stats = slice_stats(rows.iter(), Some(target));
    let prev_stats = match prev {
        Some(p) => slice_stats(rows.iter(), Some(p)),
        None => today_stats,
    };
    let total_stats = slice_stats(rows.iter(), None);
    let overall = build_metrics(today_stats, prev_stats, total_stats);
    let media_comparison = compare_dimension(&rows, |r| r.media.as_ref(), target, prev);
    let creative_comparison = compare_dimension(&rows, |r| r.creative.as_ref(), target, prev);

    // 4. Brand identity
    let advertiser = infer_advertiser(&rows);
    bus.emit(
        EVENT_STATUS,
        json!({ "message": format!("looking up brand color for {advertiser}") }),
    )
    .await;
    let brand_color = insight.recommend_brand_color(&advertiser).await;

    // 5. Budget reconciliation
    let budget_total = reconcile_budget(&req.mix_rows);
    let total_spend = total_stats.spend;
    let budget_achievement = if budget_total > 0 {
        round1(total_spend as f64 / budget_total as f64 * 100.0)
    } else {
        0.0
    };

    // 6. Narrative enrichment
    let summary = CollaboratorSummary {
        date: target,
        overall: &overall,
        budget_total,
        total_spend,
        budget_achievement,
        top_media: top_by_today_impressions(&media_comparison, 3),
        top_creatives: top_by_today_impressions(&creative_comparison, 3),
    };
    let summary_json = serde_json::to_value(&summary)
        .map_err(|e| AnalysisError::Unexpected(format!("summary serialization: {e}")))?;
    bus.emit(EVENT_STATUS, json!({ "message": "generating campaign insight" }))
        .await;
    let insight_text = insight.generate_insight(&summary_json).await;
    let insight_summary = insight.generate_summary(&insight_text).await;

    Ok(AnalysisResult {
        date: target,
        prev_date: prev,
        media_comparison,
        creative_comparison,
        overall,
        budget_total,
        total_spend,
        budget_achievement,
        advertiser,
        brand_color,
        insight: insight_text,
        insight_summary,
    })
}

// ============================================================================
// HTTP surface
// ============================================================================

struct AppState {
    bus: Arc<EventBus>,
    insight: InsightClient,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        version: "0.1.0",
    })
}

async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalysisRequest>,
) -> Response {
    state
        .bus
        .emit(EVENT_STARTED, json!({ "data": "analysis process initiated" }))
        .await;

    match run_analysis(&req, &state.bus, &state.insight).await {
        Ok(result) => {
            let payload = serde_json::to_value(&result).unwrap_or(Value::Null);
            state.bus.emit(EVENT_COMPLETED, payload).await;
            Json(result).into_response()
        }
        Err(err) => {
            eprintln!("analysis error: {err}");
            state
                .bus
                .emit(EVENT_ERROR, json!({ "error": err.to_string() }))
                .await;
            let status = match err {
                AnalysisError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                AnalysisError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, Json(ErrorResponse { error: err.to_string() })).into_response()
        }
    }
}

/// Live progress stream: one SSE frame per emitted event. The subscription
/// guards live inside the stream state, so a client disconnect drops them and
/// the listeners vanish from the registry. In-flight analyses are unaffected.
async fn stream_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<sse::Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<(String, Value)>();
    let mut guards = Vec::with_capacity(STREAM_EVENTS.len());
    for name in STREAM_EVENTS {
        let tx = tx.clone();
        let event_name = name.to_string();
        let handler: EventHandler = Arc::new(move |payload| {
            let tx = tx.clone();
            let event_name = event_name.clone();
            Box::pin(async move {
                let _ = tx.send((event_name, payload));
            })
        });
        guards.push(state.bus.subscribe(name, handler));
    }

    let stream = stream::unfold((rx, guards), |(mut rx, guards)| async move {
        let (name, payload) = rx.recv().await?;
        let event = sse::Event::default().event(name).data(payload.to_string());
        Some((Ok::<_, Infallible>(event), (rx, guards)))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    println!("=== Campaign Report Engine ===");
    if config.llm_api_url.is_none() || config.llm_api_key.is_none() {
        println!("Collaborator not configured - insight and color fall back to defaults");
    }

    let state = Arc::new(AppState {
        bus: EventBus::new(),
        insight: InsightClient::from_config(&config)?,
    });

    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/analyze", post(analyze_handler))
        .route("/stream", get(stream_handler))
        .layer(cors)
        .with_state(state);

    println!("Engine listening on http://{}", config.bind);
    println!("\nEndpoints:");
    println!("  GET  /health");
    println!("  POST /analyze");
    println!("  GET  /stream");

    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
