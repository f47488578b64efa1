use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::{Value, json};
use tracing::{Level, info};

use strategy_evolver::config::{
    PolicyKind, build_cluster, build_gate, build_policy, build_poll, parse_objective, parse_pair,
    parse_policy_kind, parse_selection, parse_tolerances,
};
use strategy_evolver::evaluator::DEFAULT_API_URL;
use strategy_evolver::fitness::{select_survivors, select_winner_by};
use strategy_evolver::generator::{
    DEFAULT_MIN_GAP, DEFAULT_MUTATION_FRACTION, DEFAULT_SIGMA, OrderedPair, generate,
};
use strategy_evolver::orchestrator::{DEFAULT_CONCURRENCY, DEFAULT_POPULATION, DEFAULT_SURVIVORS};
use strategy_evolver::record::{EnvelopeShape, EvaluationRecord};
use strategy_evolver::strategy::StrategyRegistry;
use strategy_evolver::telemetry::init_tracing;
use strategy_evolver::{
    ChampionStore, CloudConfig, CloudEvaluator, Evaluator, EvolveSettings, JsonFileStore,
    LocalEvaluator, MutationPolicy, Objective, Orchestrator, ParameterSchema, ParameterSet,
    ResultStore, SelectionMode,
};

#[derive(Parser, Debug)]
#[command(version, about = "Evolve trading-strategy parameters generation by generation")]
struct Cli {
    /// Emit JSON log lines instead of human-readable ones.
    #[arg(long, global = true)]
    log_json: bool,
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,
    /// Directory holding champion.json, survivors.json and results/.
    #[arg(long, global = true, env = "STORE_DIR", default_value = "evolution")]
    store_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one or more generations against an evaluator.
    Evolve(EvolveArgs),
    /// Print candidate parameter sets as JSON without evaluating them.
    Generate(GenerateArgs),
    /// Rank stored results and print the winner and survivors.
    Score(ScoreArgs),
    /// Check one result document against absolute thresholds.
    Gate(GateArgs),
    /// Delete old results, keeping the newest ones.
    Prune(PruneArgs),
}

#[derive(Args, Debug)]
struct MutationArgs {
    #[arg(long, env = "POP_SIZE", default_value_t = DEFAULT_POPULATION)]
    population: usize,
    #[arg(
        long,
        env = "MUTATION_POLICY",
        default_value = "fraction",
        value_parser = parse_policy_kind
    )]
    mutation_policy: PolicyKind,
    #[arg(long, env = "MUTATION_FRACTION", default_value_t = DEFAULT_MUTATION_FRACTION)]
    mutation_fraction: f64,
    #[arg(long, env = "MUTATION_SIGMA", default_value_t = DEFAULT_SIGMA)]
    sigma: f64,
    #[arg(long, env = "MIN_GAP", default_value_t = DEFAULT_MIN_GAP)]
    min_gap: i64,
    /// Ordered integer fields, `fast:slow`, comma separated.
    #[arg(
        long = "ordered-pair",
        env = "ORDERED_PAIR",
        value_delimiter = ',',
        default_value = "fast:slow",
        value_parser = parse_pair
    )]
    pairs: Vec<OrderedPair>,
    #[arg(long, env = "SEED")]
    seed: Option<u64>,
}

impl MutationArgs {
    fn policy(&self, schema: &ParameterSchema) -> MutationPolicy {
        // Pairs naming fields the schema lacks are ignored.
        let pairs = self
            .pairs
            .iter()
            .filter(|p| schema.contains(&p.fast) && schema.contains(&p.slow))
            .cloned()
            .collect();
        build_policy(
            self.mutation_policy,
            self.mutation_fraction,
            self.sigma,
            self.min_gap,
            pairs,
        )
    }
}

#[derive(Args, Debug)]
struct SelectionArgs {
    #[arg(
        long,
        env = "OBJECTIVE",
        default_value = "sharpe-drawdown",
        value_parser = parse_objective
    )]
    objective: Objective,
    #[arg(long, env = "SELECTION", default_value = "best", value_parser = parse_selection)]
    selection: SelectionMode,
    /// Categorical field cluster neighbours must share; empty disables grouping.
    #[arg(long, env = "CLUSTER_GROUP", default_value = "symbol")]
    cluster_group: String,
    #[arg(
        long,
        env = "CLUSTER_TOLERANCE",
        default_value = "fast=2,slow=5",
        value_parser = parse_tolerances
    )]
    cluster_tolerance: BTreeMap<String, f64>,
    #[arg(long, env = "NUM_SURVIVORS", default_value_t = DEFAULT_SURVIVORS)]
    survivors: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum EvaluatorKind {
    Local,
    Cloud,
}

#[derive(Args, Debug)]
struct CloudArgs {
    #[arg(long, env = "QC_USER_ID")]
    qc_user_id: Option<String>,
    #[arg(long, env = "QC_API_TOKEN", hide_env_values = true)]
    qc_api_token: Option<String>,
    #[arg(long, env = "QC_PROJECT_ID")]
    qc_project_id: Option<String>,
    #[arg(long, env = "QC_API_URL", default_value = DEFAULT_API_URL)]
    qc_api_url: String,
}

impl CloudArgs {
    fn config(&self) -> Result<CloudConfig> {
        let user = self
            .qc_user_id
            .clone()
            .context("QC_USER_ID is required for the cloud evaluator")?;
        let token = self
            .qc_api_token
            .clone()
            .context("QC_API_TOKEN is required for the cloud evaluator")?;
        let project = self
            .qc_project_id
            .clone()
            .context("QC_PROJECT_ID is required for the cloud evaluator")?;
        Ok(CloudConfig::new(user, token, project).with_api_url(self.qc_api_url.as_str()))
    }
}

#[derive(Args, Debug)]
struct EvolveArgs {
    /// JSON parameter schema.
    #[arg(long)]
    schema: PathBuf,
    #[arg(long, default_value = "ema_cross")]
    strategy: String,
    #[arg(long, value_enum, default_value_t = EvaluatorKind::Local)]
    evaluator: EvaluatorKind,
    /// Bars CSV (`ts_ms,open,high,low,close`) for the local evaluator.
    #[arg(long)]
    data_file: Option<PathBuf>,
    #[arg(long, env = "GENERATIONS", default_value_t = 1)]
    generations: u32,
    /// Stop at the first failed generation instead of moving on.
    #[arg(long)]
    fail_fast: bool,
    #[arg(long, env = "CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 10)]
    poll_interval_secs: u64,
    #[arg(long, env = "POLL_TIMEOUT_SECS", default_value_t = 1800)]
    poll_timeout_secs: u64,
    #[arg(long, env = "MIN_SHARPE")]
    min_sharpe: Option<f64>,
    #[arg(long, env = "MAX_DRAWDOWN")]
    max_drawdown: Option<f64>,
    #[command(flatten)]
    mutation: MutationArgs,
    #[command(flatten)]
    select: SelectionArgs,
    #[command(flatten)]
    cloud: CloudArgs,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    #[arg(long)]
    schema: PathBuf,
    /// Parent parameter set as a JSON object.
    #[arg(long, conflicts_with = "from_champion")]
    parent: Option<PathBuf>,
    /// Use the stored champion as the parent.
    #[arg(long)]
    from_champion: bool,
    #[command(flatten)]
    mutation: MutationArgs,
}

#[derive(Args, Debug)]
struct ScoreArgs {
    /// Only consider this many of the newest records.
    #[arg(long, default_value_t = 200)]
    limit: usize,
    /// Only consider records from the last N hours.
    #[arg(long)]
    since_hours: Option<i64>,
    /// Write the survivors back to the store.
    #[arg(long)]
    save_survivors: bool,
    #[command(flatten)]
    select: SelectionArgs,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ShapeArg {
    Flat,
    Nested,
    Backtest,
}

impl From<ShapeArg> for EnvelopeShape {
    fn from(s: ShapeArg) -> Self {
        match s {
            ShapeArg::Flat => EnvelopeShape::Flat,
            ShapeArg::Nested => EnvelopeShape::Nested,
            ShapeArg::Backtest => EnvelopeShape::Backtest,
        }
    }
}

#[derive(Args, Debug)]
struct GateArgs {
    /// Result document to check.
    #[arg(long)]
    results: PathBuf,
    #[arg(long, value_enum, default_value_t = ShapeArg::Backtest)]
    shape: ShapeArg,
    #[arg(long, env = "MIN_SHARPE", default_value_t = 0.20)]
    min_sharpe: f64,
    #[arg(long, env = "MAX_DRAWDOWN", default_value_t = 0.15)]
    max_drawdown: f64,
}

#[derive(Args, Debug)]
struct PruneArgs {
    #[arg(long, env = "KEEP_LATEST", default_value_t = 200)]
    keep_latest: usize,
    #[arg(long, env = "KEEP_DAYS", default_value_t = 14)]
    keep_days: i64,
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_schema(path: &Path) -> Result<ParameterSchema> {
    ParameterSchema::load(path)
        .with_context(|| format!("failed to load schema: {}", path.display()))
}

async fn open_store(dir: &Path) -> Result<JsonFileStore> {
    JsonFileStore::new(dir)
        .await
        .with_context(|| format!("failed to open store: {}", dir.display()))
}

async fn evolve(store_dir: &Path, args: EvolveArgs) -> Result<()> {
    if args.generations == 0 {
        bail!("--generations must be >= 1");
    }
    let schema = load_schema(&args.schema)?;
    let registry = StrategyRegistry::default();
    if registry.resolve(&args.strategy).is_err() {
        bail!(
            "unknown strategy `{}`; available: {}",
            args.strategy,
            registry.names().join(", ")
        );
    }

    let evaluator: Arc<dyn Evaluator> = match args.evaluator {
        EvaluatorKind::Local => {
            let Some(path) = &args.data_file else {
                bail!("--data-file is required with --evaluator local");
            };
            Arc::new(
                LocalEvaluator::from_csv(&args.strategy, path)
                    .with_context(|| format!("failed to load bars: {}", path.display()))?,
            )
        }
        EvaluatorKind::Cloud => Arc::new(CloudEvaluator::new(args.cloud.config()?)?),
    };

    let store = Arc::new(open_store(store_dir).await?);
    let last_generation = store
        .recent_records(1)
        .await?
        .first()
        .map(|r| r.generation)
        .unwrap_or(0);

    let settings = EvolveSettings {
        population: args.mutation.population,
        policy: args.mutation.policy(&schema),
        survivors: args.select.survivors,
        objective: args.select.objective.clone(),
        selection: args.select.selection,
        cluster: build_cluster(&args.select.cluster_group, args.select.cluster_tolerance.clone()),
        gate: build_gate(args.min_sharpe, args.max_drawdown),
        concurrency: args.concurrency,
        poll: build_poll(args.poll_interval_secs, args.poll_timeout_secs),
    };
    info!(
        strategy = %args.strategy,
        evaluator = ?args.evaluator,
        population = settings.population,
        generations = args.generations,
        start_after = last_generation,
        "starting evolution"
    );

    let mut orchestrator = Orchestrator::new(
        schema,
        &args.strategy,
        evaluator,
        store,
        settings,
        args.mutation.seed,
    )?
    .starting_at(last_generation);

    let reports = orchestrator.run(args.generations, args.fail_fast).await?;
    for report in &reports {
        println!("{}", serde_json::to_string(report)?);
    }
    if reports.is_empty() {
        bail!("every generation failed");
    }
    Ok(())
}

async fn generate_cmd(store_dir: &Path, args: GenerateArgs) -> Result<()> {
    let schema = load_schema(&args.schema)?;
    let parent: Option<ParameterSet> = if let Some(path) = &args.parent {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read parent: {}", path.display()))?;
        Some(serde_json::from_str(&text).context("parent must be a JSON object of parameters")?)
    } else if args.from_champion {
        let store = open_store(store_dir).await?;
        let champion = store.load_champion().await?;
        if champion.is_none() {
            info!("no champion stored, bootstrapping");
        }
        champion.map(|c| c.parameters)
    } else {
        None
    };

    let mut rng = match args.mutation.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let sets = generate(
        parent.as_ref(),
        &schema,
        args.mutation.population,
        &args.mutation.policy(&schema),
        &mut rng,
    )?;
    print_json(&sets)
}

async fn score(store_dir: &Path, args: ScoreArgs) -> Result<()> {
    let store = open_store(store_dir).await?;
    let records: Vec<EvaluationRecord> = match args.since_hours {
        Some(hours) => store.records_since(Utc::now() - Duration::hours(hours)).await?,
        None => store.recent_records(args.limit).await?,
    };
    if records.is_empty() {
        bail!("no results in {}", store_dir.display());
    }

    let objective = &args.select.objective;
    let cluster = build_cluster(&args.select.cluster_group, args.select.cluster_tolerance.clone());
    let selection = select_winner_by(&records, objective, args.select.selection, &cluster)?;
    let survivors = select_survivors(&records, args.select.survivors, objective);

    print_json(&json!({
        "considered": records.len(),
        "winner": selection.winner.id,
        "fitness": selection.fitness,
        "clusterScore": selection.cluster_score,
        "neighbours": selection.neighbours,
        "parameters": selection.winner.parameters,
        "survivors": survivors
            .iter()
            .map(|r| json!({"id": r.id, "fitness": objective.score(r), "parameters": r.parameters}))
            .collect::<Vec<_>>(),
    }))?;

    if args.save_survivors {
        store.save_survivors(&survivors).await?;
        info!(count = survivors.len(), "survivors saved");
    }
    Ok(())
}

fn gate(args: GateArgs) -> Result<()> {
    let text = std::fs::read_to_string(&args.results)
        .with_context(|| format!("failed to read results: {}", args.results.display()))?;
    let doc: Value = serde_json::from_str(&text).context("results file is not JSON")?;
    let statistics = EnvelopeShape::from(args.shape).decode(&doc)?;

    let name = args
        .results
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let record = EvaluationRecord::new(name, 0, "", ParameterSet::new(), statistics);
    let verdict = build_gate(Some(args.min_sharpe), Some(args.max_drawdown)).check(&record);
    print_json(&verdict)?;

    if !verdict.passed() {
        bail!("quality gate failed for {}", args.results.display());
    }
    Ok(())
}

async fn prune(store_dir: &Path, args: PruneArgs) -> Result<()> {
    let store = open_store(store_dir).await?;
    let cutoff = Utc::now() - Duration::days(args.keep_days);
    let removed = store.prune(args.keep_latest, cutoff).await?;
    info!(removed, keep_latest = args.keep_latest, keep_days = args.keep_days, "pruned results");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json, cli.log_level);

    match cli.command {
        Command::Evolve(args) => evolve(&cli.store_dir, args).await,
        Command::Generate(args) => generate_cmd(&cli.store_dir, args).await,
        Command::Score(args) => score(&cli.store_dir, args).await,
        Command::Gate(args) => gate(args),
        Command::Prune(args) => prune(&cli.store_dir, args).await,
    }
}
