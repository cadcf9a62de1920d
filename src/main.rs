use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};
use eyre::{eyre, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wallet_credit_score::{
    api, config, db, export,
    model::{self, SavedModel},
    normalizer, pipeline,
};

#[derive(Parser)]
#[command(name = "wallet-credit-score")]
#[command(about = "Wallet credit scores from lending-protocol transactions")]
#[command(version = "0.1.0")]
struct Cli {
    /// Evaluation time in epoch seconds (defaults to now)
    #[arg(long, global = true)]
    as_of: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Normalize raw records into a transaction CSV
    Normalize {
        /// Raw JSON or JSON-lines input (defaults to DATA_PATH)
        #[arg(long)]
        input: Option<PathBuf>,
        /// Output CSV (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Compute wallet features and formula scores
    Features {
        #[arg(long)]
        input: Option<PathBuf>,
        /// Treat the input as an already-normalized CSV table
        #[arg(long)]
        normalized: bool,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Train candidate models and save the best one to MODEL_DIR
    Train {
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Score a saved model against the formula
    Evaluate {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long = "model")]
        model_path: PathBuf,
    },
    /// Predict scores with a saved model
    Predict {
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long = "model")]
        model_path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Run the HTTP scoring service
    Serve {
        /// Saved model used to add predicted_score to responses
        #[arg(long = "model")]
        model_path: Option<PathBuf>,
    },
}

fn output_writer(path: Option<&Path>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(p) => Box::new(File::create(p)?),
        None => Box::new(io::stdout().lock()),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr) // stdout carries CSV output
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load()?;
    let as_of = pipeline::resolve_as_of(cli.as_of)
        .ok_or_else(|| eyre!("--as-of {:?} is out of range", cli.as_of))?;

    match cli.command {
        Commands::Normalize { input, output } => {
            let input = input.unwrap_or_else(|| cfg.data_path.clone());
            let records = normalizer::read_records(&input)?;
            let normalized = normalizer::normalize(&records, &cfg.scoring)?;
            export::write_normalized(&normalized.table, output_writer(output.as_deref())?)?;
        }
        Commands::Features { input, normalized, output } => {
            let input = input.unwrap_or_else(|| cfg.data_path.clone());
            let out = if normalized {
                pipeline::score_normalized_csv(&input, &cfg.scoring, as_of)?
            } else {
                pipeline::score_file(&input, &cfg.scoring, as_of)?
            };
            export::write_features(&out.wallets, None, output_writer(output.as_deref())?)?;
        }
        Commands::Train { input } => {
            let input = input.unwrap_or_else(|| cfg.data_path.clone());
            info!("Loading data from {}", input.display());
            let out = pipeline::score_file(&input, &cfg.scoring, as_of)?;

            let report = model::train_and_select(&out.wallets)?;
            let path = report.best.save(&cfg.model_dir)?;
            for (name, m) in &report.results {
                println!("{:<18} MSE: {:>12.4}  R2: {:>8.4}", name, m.mse, m.r2);
            }
            println!("Best model saved: {} at {}", report.best_model_name, path.display());
        }
        Commands::Evaluate { input, model_path } => {
            let input = input.unwrap_or_else(|| cfg.data_path.clone());
            let out = pipeline::score_file(&input, &cfg.scoring, as_of)?;
            let m = model::evaluate_saved_model(&out.wallets, &model_path)?;
            println!("{}", serde_json::to_string_pretty(&m)?);
        }
        Commands::Predict { input, model_path, output } => {
            let input = input.unwrap_or_else(|| cfg.data_path.clone());
            let saved = SavedModel::load(&model_path)?;
            let out = pipeline::score_file(&input, &cfg.scoring, as_of)?;
            let predictions = saved.predict_wallets(&out.wallets)?;
            export::write_features(
                &out.wallets,
                Some(predictions.as_slice()),
                output_writer(output.as_deref())?,
            )?;
        }
        Commands::Serve { model_path } => serve(cfg, model_path).await?,
    }

    Ok(())
}

async fn serve(cfg: config::Config, model_path: Option<PathBuf>) -> Result<()> {
    info!("Wallet credit score API starting...");

    let model = match model_path {
        Some(path) => {
            let m = SavedModel::load(&path)?;
            info!("Loaded model {} from {}", m.name(), path.display());
            Some(Arc::new(m))
        }
        None => {
            warn!("No model given; responses carry formula scores only");
            None
        }
    };

    let conn = db::connect(&cfg.db_path)?;
    db::run_migrations(&conn)?;

    let state = api::AppState {
        scoring: Arc::new(cfg.scoring.clone()),
        conn: Arc::new(Mutex::new(conn)),
        model,
        max_upload_bytes: cfg.max_upload_bytes,
    };

    let api_handle = tokio::spawn(api::serve(cfg, state));

    // Graceful shutdown
    tokio::select! {
        res = api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("Wallet credit score API stopped.");
    Ok(())
}
