//! The evaluation boundary: submit a parameter set, poll until it resolves,
//! decode the statistics from the envelope shape the evaluator declares.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::record::{DRAWDOWN, EnvelopeShape, NET_PROFIT, SHARPE_RATIO, Statistics, TOTAL_ORDERS};
use crate::schema::ParameterSet;
use crate::strategy::{Bar, Signal, StrategyError, StrategyRegistry};

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("no result after {waited_secs}s")]
    Timeout { waited_secs: u64 },

    #[error("evaluation failed: {0}")]
    Failed(String),

    #[error("bad result envelope: {0}")]
    Envelope(String),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<reqwest::Error> for EvaluatorError {
    fn from(err: reqwest::Error) -> Self {
        EvaluatorError::Http(err.to_string())
    }
}

impl EvaluatorError {
    /// Worth another poll rather than giving up on the job.
    pub fn is_transient(&self) -> bool {
        matches!(self, EvaluatorError::Http(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum JobStatus {
    Running { progress: Option<f64> },
    Completed(Value),
    Failed(String),
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    /// The envelope that `Completed` documents from this evaluator use.
    fn envelope_shape(&self) -> EnvelopeShape;

    async fn submit(&self, name: &str, params: &ParameterSet) -> Result<JobHandle, EvaluatorError>;

    async fn poll(&self, job: &JobHandle) -> Result<JobStatus, EvaluatorError>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Poll `job` at a fixed interval until it completes, fails or times out.
/// Transient poll errors are logged and retried.
pub async fn wait_for_result(
    evaluator: &dyn Evaluator,
    job: &JobHandle,
    settings: PollSettings,
) -> Result<Value, EvaluatorError> {
    let started = Instant::now();
    loop {
        match evaluator.poll(job).await {
            Ok(JobStatus::Completed(doc)) => return Ok(doc),
            Ok(JobStatus::Failed(reason)) => return Err(EvaluatorError::Failed(reason)),
            Ok(JobStatus::Running { progress }) => {
                debug!(job = %job.name, ?progress, "still running");
            }
            Err(e) if e.is_transient() => {
                warn!(job = %job.name, error = %e, "poll failed, retrying");
            }
            Err(e) => return Err(e),
        }

        let elapsed = started.elapsed();
        if elapsed >= settings.timeout {
            return Err(EvaluatorError::Timeout {
                waited_secs: elapsed.as_secs(),
            });
        }
        sleep(settings.interval.min(settings.timeout - elapsed)).await;
    }
}

/// Submit, wait, and decode statistics in one step.
pub async fn evaluate(
    evaluator: &dyn Evaluator,
    name: &str,
    params: &ParameterSet,
    settings: PollSettings,
) -> Result<Statistics, EvaluatorError> {
    let job = evaluator.submit(name, params).await?;
    debug!(job = %job.name, id = %job.id, "submitted");
    let doc = wait_for_result(evaluator, &job, settings).await?;
    evaluator
        .envelope_shape()
        .decode(&doc)
        .map_err(|e| EvaluatorError::Envelope(e.to_string()))
}

pub const DEFAULT_API_URL: &str = "https://www.quantconnect.com/api/v2";

const COMPILE_POLL: Duration = Duration::from_secs(2);
const COMPILE_ATTEMPTS: usize = 90;

/// Credentials and target project for [`CloudEvaluator`].
#[derive(Clone, Debug)]
pub struct CloudConfig {
    pub api_url: String,
    pub user_id: String,
    pub api_token: String,
    pub project_id: String,
}

impl CloudConfig {
    pub fn new(
        user_id: impl Into<String>,
        api_token: impl Into<String>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            user_id: user_id.into(),
            api_token: api_token.into(),
            project_id: project_id.into(),
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

fn request_signature(token: &str, timestamp: &str) -> String {
    hex::encode(Sha256::digest(format!("{token}:{timestamp}").as_bytes()))
}

/// Map a `backtests/read` response onto a job status.
fn interpret_backtest(doc: Value) -> JobStatus {
    let backtest = doc.get("backtest").cloned().unwrap_or(Value::Null);
    let status = backtest.get("status").and_then(Value::as_str).unwrap_or("");
    let completed = backtest.get("completed").and_then(Value::as_bool) == Some(true);

    if status.starts_with("Runtime Error") || status.starts_with("Error") {
        let reason = backtest
            .get("error")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(status);
        return JobStatus::Failed(reason.to_string());
    }
    if completed || status.starts_with("Completed") {
        return JobStatus::Completed(doc);
    }
    JobStatus::Running {
        progress: backtest.get("progress").and_then(Value::as_f64),
    }
}

/// REST client for a hosted backtesting project.
pub struct CloudEvaluator {
    config: CloudConfig,
    http: reqwest::Client,
    compile_id: OnceCell<String>,
}

impl CloudEvaluator {
    pub fn new(config: CloudConfig) -> Result<Self, EvaluatorError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("strategy-evolver/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            config,
            http,
            compile_id: OnceCell::new(),
        })
    }

    async fn call(&self, endpoint: &str, body: Value) -> Result<Value, EvaluatorError> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = request_signature(&self.config.api_token, &timestamp);
        let doc: Value = self
            .http
            .post(format!("{}/{}", self.config.api_url, endpoint))
            .basic_auth(&self.config.user_id, Some(signature))
            .header("Timestamp", &timestamp)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if doc.get("success").and_then(Value::as_bool) != Some(true) {
            let errors = doc.get("errors").map(Value::to_string).unwrap_or_default();
            return Err(EvaluatorError::Api(format!("{endpoint} rejected: {errors}")));
        }
        Ok(doc)
    }

    async fn compile(&self) -> Result<String, EvaluatorError> {
        let project = &self.config.project_id;
        let created = self.call("compile/create", json!({ "projectId": project })).await?;
        let compile_id = created
            .get("compileId")
            .and_then(Value::as_str)
            .ok_or_else(|| EvaluatorError::Api("compile/create returned no compileId".into()))?
            .to_string();

        for _ in 0..COMPILE_ATTEMPTS {
            let doc = self
                .call("compile/read", json!({ "projectId": project, "compileId": compile_id }))
                .await?;
            match doc.get("state").and_then(Value::as_str) {
                Some("BuildSuccess") => {
                    info!(%compile_id, "project compiled");
                    return Ok(compile_id);
                }
                Some("BuildError") => {
                    let logs = doc.get("logs").map(Value::to_string).unwrap_or_default();
                    return Err(EvaluatorError::Failed(format!("build error: {logs}")));
                }
                _ => sleep(COMPILE_POLL).await,
            }
        }
        Err(EvaluatorError::Timeout {
            waited_secs: COMPILE_POLL.as_secs() * COMPILE_ATTEMPTS as u64,
        })
    }
}

#[async_trait]
impl Evaluator for CloudEvaluator {
    fn envelope_shape(&self) -> EnvelopeShape {
        EnvelopeShape::Backtest
    }

    async fn submit(&self, name: &str, params: &ParameterSet) -> Result<JobHandle, EvaluatorError> {
        let compile_id = self.compile_id.get_or_try_init(|| self.compile()).await?;
        let parameters: HashMap<&str, String> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.to_string()))
            .collect();

        let doc = self
            .call(
                "backtests/create",
                json!({
                    "projectId": self.config.project_id,
                    "compileId": compile_id,
                    "backtestName": name,
                    "parameters": parameters,
                }),
            )
            .await?;
        let id = doc
            .pointer("/backtest/backtestId")
            .and_then(Value::as_str)
            .ok_or_else(|| EvaluatorError::Api("backtests/create returned no backtestId".into()))?;

        Ok(JobHandle {
            id: id.to_string(),
            name: name.to_string(),
        })
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobStatus, EvaluatorError> {
        let doc = self
            .call(
                "backtests/read",
                json!({ "projectId": self.config.project_id, "backtestId": job.id }),
            )
            .await?;
        Ok(interpret_backtest(doc))
    }
}

const TRADING_DAYS: f64 = 252.0;
const NOTIONAL: f64 = 100_000.0;

/// Bars as `ts_ms,open,high,low,close` with a header row. Unparseable rows
/// are skipped; the result is sorted by time.
pub fn load_bars_from_csv(path: &Path) -> Result<Vec<Bar>, EvaluatorError> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;

    let mut bars = Vec::new();
    for rec in rdr.records() {
        let Ok(r) = rec else { continue };
        let ts = r.get(0).and_then(|x| x.parse::<i64>().ok()).map(|x| x / 1000);
        let o = r.get(1).and_then(|x| x.parse::<f64>().ok());
        let h = r.get(2).and_then(|x| x.parse::<f64>().ok());
        let l = r.get(3).and_then(|x| x.parse::<f64>().ok());
        let c = r.get(4).and_then(|x| x.parse::<f64>().ok());
        if let (Some(ts), Some(open), Some(high), Some(low), Some(close)) = (ts, o, h, l, c) {
            bars.push(Bar {
                ts,
                open,
                high,
                low,
                close,
            });
        }
    }
    bars.sort_by_key(|b| b.ts);
    Ok(bars)
}

fn calc_max_drawdown(equity_curve: &[f64]) -> f64 {
    let Some(&first) = equity_curve.first() else {
        return 0.0;
    };
    let mut peak = first;
    let mut max_dd = 0.0;
    for &e in equity_curve {
        if e > peak {
            peak = e;
        }
        if peak > 0.0 {
            max_dd = f64::max(max_dd, (peak - e) / peak);
        }
    }
    max_dd
}

fn annualised_sharpe(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let sd = var.sqrt();
    if sd <= f64::EPSILON {
        return 0.0;
    }
    mean / sd * TRADING_DAYS.sqrt()
}

/// Offline evaluator: replays bars through one registered strategy.
///
/// Exposure is long or flat, set on the close of the signalling bar and
/// held into the next. Evaluation runs inside `submit`; `poll` only
/// hands back the stored result.
pub struct LocalEvaluator {
    strategy: String,
    registry: StrategyRegistry,
    bars: Vec<Bar>,
    jobs: Mutex<HashMap<String, JobStatus>>,
    next_id: AtomicU64,
}

impl LocalEvaluator {
    pub fn new(strategy: &str, bars: Vec<Bar>) -> Result<Self, EvaluatorError> {
        let registry = StrategyRegistry::default();
        registry.resolve(strategy)?;
        if bars.len() < 2 {
            return Err(EvaluatorError::Failed(format!(
                "need at least 2 bars, got {}",
                bars.len()
            )));
        }
        Ok(Self {
            strategy: strategy.to_string(),
            registry,
            bars,
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn from_csv(strategy: &str, path: &Path) -> Result<Self, EvaluatorError> {
        let bars = load_bars_from_csv(path)?;
        info!(path = %path.display(), bars = bars.len(), "loaded bars");
        Self::new(strategy, bars)
    }

    fn replay(&self, params: &ParameterSet) -> Result<Statistics, EvaluatorError> {
        let mut strategy = self.registry.create(&self.strategy)?;
        strategy.initialize(params)?;

        let mut long = false;
        let mut equity = 1.0;
        let mut curve = Vec::with_capacity(self.bars.len());
        let mut returns = Vec::with_capacity(self.bars.len());
        let mut prev_close: Option<f64> = None;

        for bar in &self.bars {
            if let Some(prev) = prev_close {
                let r = if long && prev > 0.0 { bar.close / prev - 1.0 } else { 0.0 };
                equity *= 1.0 + r;
                returns.push(r);
            }
            curve.push(equity);
            prev_close = Some(bar.close);

            match strategy.on_data(bar) {
                Some(Signal::Long) => long = true,
                Some(Signal::Flat) => long = false,
                None => {}
            }
        }
        let summary = strategy.finalize();

        let mut stats = Statistics::new();
        stats.insert(SHARPE_RATIO.to_string(), annualised_sharpe(&returns));
        stats.insert(DRAWDOWN.to_string(), calc_max_drawdown(&curve));
        stats.insert(NET_PROFIT.to_string(), NOTIONAL * (equity - 1.0));
        stats.insert(TOTAL_ORDERS.to_string(), summary.signals as f64);
        Ok(stats)
    }
}

#[async_trait]
impl Evaluator for LocalEvaluator {
    fn envelope_shape(&self) -> EnvelopeShape {
        EnvelopeShape::Flat
    }

    async fn submit(&self, name: &str, params: &ParameterSet) -> Result<JobHandle, EvaluatorError> {
        let stats = self.replay(params)?;
        let id = format!("local-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.jobs
            .lock()
            .await
            .insert(id.clone(), JobStatus::Completed(json!({ "statistics": stats })));
        Ok(JobHandle {
            id,
            name: name.to_string(),
        })
    }

    async fn poll(&self, job: &JobHandle) -> Result<JobStatus, EvaluatorError> {
        self.jobs
            .lock()
            .await
            .get(&job.id)
            .cloned()
            .ok_or_else(|| EvaluatorError::Failed(format!("unknown job {}", job.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ParamValue;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    #[derive(Clone)]
    enum Step {
        Running,
        Transient,
        Reject,
        Fail(&'static str),
        Done(Value),
    }

    /// Replays a fixed script of poll outcomes, repeating the last one.
    struct Scripted {
        script: Vec<Step>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Evaluator for Scripted {
        fn envelope_shape(&self) -> EnvelopeShape {
            EnvelopeShape::Flat
        }

        async fn submit(&self, name: &str, _: &ParameterSet) -> Result<JobHandle, EvaluatorError> {
            Ok(JobHandle {
                id: "job-1".into(),
                name: name.into(),
            })
        }

        async fn poll(&self, _: &JobHandle) -> Result<JobStatus, EvaluatorError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script[i.min(self.script.len() - 1)].clone() {
                Step::Running => Ok(JobStatus::Running { progress: Some(0.5) }),
                Step::Transient => Err(EvaluatorError::Http("connection reset".into())),
                Step::Reject => Err(EvaluatorError::Api("bad project".into())),
                Step::Fail(reason) => Ok(JobStatus::Failed(reason.into())),
                Step::Done(doc) => Ok(JobStatus::Completed(doc)),
            }
        }
    }

    fn fast_poll() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(1),
            timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_completion() {
        let ev = Scripted::new(vec![
            Step::Running,
            Step::Transient,
            Step::Done(json!({"statistics": {"sharpeRatio": 1.5, "drawdown": "5%"}})),
        ]);
        let stats = evaluate(&ev, "c1", &ParameterSet::new(), fast_poll()).await.unwrap();
        assert_eq!(stats[SHARPE_RATIO], 1.5);
        assert!((stats[DRAWDOWN] - 0.05).abs() < 1e-12);
        assert_eq!(ev.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn never_finishing_job_times_out() {
        let ev = Scripted::new(vec![Step::Running]);
        let err = evaluate(&ev, "slow", &ParameterSet::new(), fast_poll())
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluatorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn hard_errors_and_failures_stop_polling() {
        let failed = Scripted::new(vec![Step::Fail("Runtime Error: boom")]);
        let err = evaluate(&failed, "x", &ParameterSet::new(), fast_poll())
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluatorError::Failed(_)));

        let rejected = Scripted::new(vec![Step::Reject]);
        let err = evaluate(&rejected, "x", &ParameterSet::new(), fast_poll())
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluatorError::Api(_)));
        assert_eq!(rejected.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrong_envelope_is_reported() {
        let ev = Scripted::new(vec![Step::Done(json!({"results": {"statistics": {}}}))]);
        let err = evaluate(&ev, "x", &ParameterSet::new(), fast_poll())
            .await
            .unwrap_err();
        assert!(matches!(err, EvaluatorError::Envelope(_)));
    }

    #[test]
    fn signs_requests_with_token_and_timestamp() {
        assert_eq!(
            request_signature("secret", "1700000000"),
            "4b2b48ec35fa38aa3e2be44f48a6af7c20b7fd633e866b7642395224bbc6c721"
        );
    }

    #[test]
    fn interprets_backtest_status() {
        let running = json!({
            "success": true,
            "backtest": {"status": "In Progress...", "progress": 0.4}
        });
        assert_eq!(interpret_backtest(running), JobStatus::Running { progress: Some(0.4) });

        let done = json!({"success": true, "backtest": {"status": "Completed.", "statistics": {}}});
        assert!(matches!(interpret_backtest(done), JobStatus::Completed(_)));

        let flagged = json!({
            "success": true,
            "backtest": {"status": "Running", "completed": true}
        });
        assert!(matches!(interpret_backtest(flagged), JobStatus::Completed(_)));

        let errored = json!({
            "success": true,
            "backtest": {"status": "Runtime Error", "error": "div by zero"}
        });
        assert_eq!(interpret_backtest(errored), JobStatus::Failed("div by zero".into()));
    }

    #[test]
    fn drawdown_and_sharpe_helpers() {
        assert_eq!(calc_max_drawdown(&[]), 0.0);
        assert!((calc_max_drawdown(&[1.0, 1.2, 0.9, 1.3]) - 0.25).abs() < 1e-12);
        assert_eq!(annualised_sharpe(&[0.01, 0.01, 0.01]), 0.0);
        assert!(annualised_sharpe(&[0.01, 0.02, 0.0, 0.015]) > 0.0);
    }

    fn write_bars(closes: &[f64]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ts,open,high,low,close").unwrap();
        writeln!(file, "garbage,row,,,").unwrap();
        for (i, c) in closes.iter().enumerate() {
            writeln!(file, "{},{c},{c},{c},{c}", i as i64 * 86_400_000).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn local_evaluator_replays_strategy() {
        let mut closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        closes.extend((0..20).map(|i| 119.0 - 2.0 * i as f64));
        let file = write_bars(&closes);

        let ev = LocalEvaluator::from_csv("ema_cross", file.path()).unwrap();
        let params: ParameterSet = [
            ("fast".to_string(), ParamValue::Int(2)),
            ("slow".to_string(), ParamValue::Int(5)),
        ]
        .into();
        let stats = evaluate(&ev, "gen001-0", &params, fast_poll()).await.unwrap();

        assert_eq!(stats[TOTAL_ORDERS], 2.0);
        assert!(stats[NET_PROFIT] > 0.0);
        assert!(stats[DRAWDOWN] >= 0.0 && stats[DRAWDOWN] < 1.0);
        assert!(stats.contains_key(SHARPE_RATIO));
    }

    #[tokio::test]
    async fn local_evaluator_rejects_bad_inputs() {
        assert!(matches!(
            LocalEvaluator::new("martingale", vec![]),
            Err(EvaluatorError::Strategy(StrategyError::Unknown(_)))
        ));

        let file = write_bars(&[1.0, 2.0, 3.0]);
        let ev = LocalEvaluator::from_csv("ema_cross", file.path()).unwrap();
        let inverted: ParameterSet = [
            ("fast".to_string(), ParamValue::Int(20)),
            ("slow".to_string(), ParamValue::Int(5)),
        ]
        .into();
        let err = ev.submit("bad", &inverted).await.unwrap_err();
        assert!(matches!(err, EvaluatorError::Strategy(_)));
    }
}
