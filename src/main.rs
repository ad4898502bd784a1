mod config;
mod market_data;
mod ml;
mod pipeline;
mod storage;
mod types;
mod web;

use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use config::{AppConfig, Secrets};
use market_data::{MarketDataSource, TwelveDataClient};
use ml::experiment::{default_grid, run_experiment};
use ml::serving::{forecast_for_date, forecast_next_days, parse_forecast_date};
use ml::{ModelParams, ModelRegistry};
use pipeline::{evaluate_prod, DailyPipeline, Extractor, GitPublisher, RetrainLog, Retrainer};
use storage::{open_store, read_bars_from_csv, PriceStore, SqlitePriceStore};
use types::{normalize_ticker, Prediction};
use web::{start_forecast_server, AppState};

#[derive(Parser)]
#[command(name = "stock-forecaster")]
#[command(version = "0.1.0")]
#[command(about = "Daily stock price extraction, forecasting and serving", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch new daily bars for every configured ticker
    Extract,
    /// Import a CSV price file into the SQLite table
    ImportCsv {
        /// CSV file with date/datetime, open, high, low, close, volume columns
        path: PathBuf,
        /// Ticker for files without a ticker column
        #[arg(short, long)]
        ticker: Option<String>,
    },
    /// Fit on all stored rows and save the model without a promotion check
    Train {
        #[arg(short, long)]
        ticker: String,
        /// Output file (defaults to the prod model path)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Backtest a fresh model and promote it when it beats the prod model
    Retrain {
        /// Single ticker (defaults to every configured ticker)
        #[arg(short, long)]
        ticker: Option<String>,
    },
    /// Report the prod models' MAE over the backtest window
    Evaluate {
        #[arg(short, long)]
        ticker: Option<String>,
    },
    /// Sweep changepoint flexibility and record every run
    Experiment {
        #[arg(short, long)]
        ticker: String,
        /// Holdout rows (defaults to retrain.backtest_days)
        #[arg(long)]
        holdout: Option<usize>,
    },
    /// Run extract, retrain, evaluate and publish once
    Pipeline,
    /// Serve forecasts over HTTP
    Serve {
        /// Port (defaults to server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print a forecast from the prod model
    Forecast {
        #[arg(short, long)]
        ticker: String,
        /// Target date (MM/DD/YYYY)
        #[arg(short, long, conflicts_with = "days")]
        date: Option<String>,
        /// Number of days after the training cutoff
        #[arg(long)]
        days: Option<u32>,
    },
    /// Write the default configuration as TOML
    InitConfig {
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::InitConfig { output, force } = &cli.command {
        return init_config(output, *force);
    }

    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Extract => run_extract(&config).await?,
        Commands::ImportCsv { path, ticker } => import_csv(&config, &path, ticker.as_deref()).await?,
        Commands::Train { ticker, output } => run_train(&config, &ticker, output).await?,
        Commands::Retrain { ticker } => run_retrain(&config, ticker).await?,
        Commands::Evaluate { ticker } => run_evaluate(&config, ticker).await?,
        Commands::Experiment { ticker, holdout } => run_experiments(&config, &ticker, holdout).await?,
        Commands::Pipeline => run_pipeline(&config).await?,
        Commands::Serve { port } => serve(&config, port).await?,
        Commands::Forecast { ticker, date, days } => print_forecast(&config, &ticker, date, days)?,
        Commands::InitConfig { .. } => {}
    }

    Ok(())
}

fn init_config(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }
    std::fs::write(output, AppConfig::default().to_toml()?)?;
    info!("Wrote default configuration to {}", output.display());
    Ok(())
}

fn select_tickers(config: &AppConfig, one: Option<String>) -> Result<Vec<String>> {
    match one {
        Some(ticker) => Ok(vec![normalize_ticker(&ticker)?]),
        None => config.tickers.iter().map(|t| normalize_ticker(t)).collect(),
    }
}

fn market_source(config: &AppConfig) -> Result<Arc<dyn MarketDataSource>> {
    let secrets = Secrets::load_or_env(&config.secrets_path)?;
    let api_key = secrets.require(&config.market_data.api_key_name)?;
    Ok(Arc::new(TwelveDataClient::new(api_key, &config.market_data)))
}

fn retrainer(config: &AppConfig, store: Arc<dyn PriceStore>) -> Retrainer {
    Retrainer::new(
        store,
        ModelRegistry::new(&config.retrain.models_dir),
        ModelParams::from(&config.model),
        config.retrain.backtest_days,
        RetrainLog::new(&config.retrain.log_path),
    )
}

async fn run_extract(config: &AppConfig) -> Result<()> {
    let store = open_store(&config.data).await?;
    let extractor = Extractor::new(market_source(config)?, store, config.market_data.initial_lookback_days);
    let tickers = select_tickers(config, None)?;

    let report = extractor.run(&tickers, Utc::now().date_naive()).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn import_csv(config: &AppConfig, path: &Path, ticker: Option<&str>) -> Result<()> {
    let ticker = ticker.map(normalize_ticker).transpose()?;
    let bars = read_bars_from_csv(path, ticker.as_deref())?;
    let store = SqlitePriceStore::new(&config.data.database_url).await?;

    let inserted = store.append(&bars).await?;
    info!(
        "Imported {} of {} rows from {} into {} ({} rows total)",
        inserted,
        bars.len(),
        path.display(),
        config.data.database_url,
        store.row_count().await?
    );
    Ok(())
}

async fn run_train(config: &AppConfig, ticker: &str, output: Option<PathBuf>) -> Result<()> {
    let ticker = normalize_ticker(ticker)?;
    let store = open_store(&config.data).await?;
    let (path, artifact) = retrainer(config, store).train(&ticker, output.as_deref()).await?;
    info!(
        "Trained {} v{} on {} rows through {}, saved to {}",
        ticker,
        artifact.meta.version,
        artifact.meta.n_observations,
        artifact.meta.cutoff,
        path.display()
    );
    Ok(())
}

async fn run_retrain(config: &AppConfig, ticker: Option<String>) -> Result<()> {
    let tickers = select_tickers(config, ticker)?;
    let store = open_store(&config.data).await?;

    let report = retrainer(config, store).retrain_all(&tickers).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.outcomes.is_empty() {
        bail!("Retrain failed for every ticker");
    }
    Ok(())
}

async fn run_evaluate(config: &AppConfig, ticker: Option<String>) -> Result<()> {
    let tickers = select_tickers(config, ticker)?;
    let store = open_store(&config.data).await?;
    let registry = ModelRegistry::new(&config.retrain.models_dir);

    let report = evaluate_prod(&store, &registry, &tickers, config.retrain.backtest_days).await;
    for ticker in &report.missing {
        warn!("{}: no prod model", ticker);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.all_failed() {
        bail!("Evaluation failed for every ticker");
    }
    Ok(())
}

async fn run_experiments(config: &AppConfig, ticker: &str, holdout: Option<usize>) -> Result<()> {
    let ticker = normalize_ticker(ticker)?;
    let store = open_store(&config.data).await?;
    let series = store.load_series(&ticker).await?;
    let registry = ModelRegistry::new(&config.retrain.models_dir);

    let holdout = holdout.unwrap_or(config.retrain.backtest_days);
    let grid = default_grid(&ModelParams::from(&config.model));
    let report = run_experiment(&series, &grid, holdout, &registry, &config.retrain.experiments_path)?;

    let best = report
        .best()
        .ok_or_else(|| anyhow!("No experiment runs for {}", ticker))?;
    info!(
        "Best run for {}: #{} changepoint_prior_scale={} MAE={:.4} ({})",
        ticker,
        best.run_index,
        best.params.changepoint_prior_scale,
        best.mae,
        best.artifact_path.display()
    );
    Ok(())
}

async fn run_pipeline(config: &AppConfig) -> Result<()> {
    let tickers = select_tickers(config, None)?;
    let store = open_store(&config.data).await?;

    let extractor = Extractor::new(market_source(config)?, store.clone(), config.market_data.initial_lookback_days);
    let publisher = GitPublisher::new(config.publish.clone(), std::env::current_dir()?);
    let pipeline = DailyPipeline::new(
        tickers,
        store.clone(),
        extractor,
        retrainer(config, store),
        publisher,
        config.retrain.backtest_days,
    );

    let report = pipeline.run(Utc::now().date_naive()).await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.succeeded() {
        error!("Daily pipeline did not complete");
        bail!("Daily pipeline failed");
    }
    Ok(())
}

async fn serve(config: &AppConfig, port: Option<u16>) -> Result<()> {
    let store = open_store(&config.data).await?;
    let registry = ModelRegistry::new(&config.retrain.models_dir);
    let state = AppState::new(registry, store, config.server.max_horizon_days);

    start_forecast_server(state, &config.server.host, port.unwrap_or(config.server.port)).await
}

fn print_forecast(config: &AppConfig, ticker: &str, date: Option<String>, days: Option<u32>) -> Result<()> {
    let ticker = normalize_ticker(ticker)?;
    let registry = ModelRegistry::new(&config.retrain.models_dir);
    let artifact = registry
        .load_prod(&ticker)?
        .ok_or_else(|| anyhow!("No prod model for {}", ticker))?;
    let max = config.server.max_horizon_days;

    let predictions: Vec<Prediction> = match (date, days) {
        (Some(raw), None) => {
            let target = parse_forecast_date(&raw)?;
            vec![Prediction::new(&ticker, &forecast_for_date(&artifact.model, target, max)?)]
        }
        (None, days) => forecast_next_days(&artifact.model, days.unwrap_or(1), max)?
            .iter()
            .map(|p| Prediction::new(&ticker, p))
            .collect(),
        (Some(_), Some(_)) => bail!("Pass either --date or --days"),
    };

    println!("{}", serde_json::to_string_pretty(&predictions)?);
    Ok(())
}
