use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use site_insights::catalog::{self, CATALOG};
use site_insights::merge::merge_series;
use site_insights::{build_interpreter, init_tracing, open_database, EngineSettings, Plan};
use std::path::PathBuf;

/// Plan interpreter for per-site time series
#[derive(Parser)]
#[command(name = "site-insights")]
#[command(version, about = "Run analytic plans against site time series", long_about = None)]
struct Cli {
    /// Settings file (JSON, merged over defaults)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan file and print the execution context as JSON
    RunPlan {
        /// Plan document, `{"plan": [...]}`
        #[arg(long)]
        plan: PathBuf,
        /// Merge time series results into one chart
        #[arg(long)]
        chart: bool,
    },

    /// Print the metric vocabulary per source
    Catalog,

    /// Load canonical sites from a JSON array
    ImportSites {
        #[arg(long)]
        file: PathBuf,
    },

    /// Load raw source documents from a JSON array
    ImportRecords {
        /// Source name (weather, feeding)
        #[arg(long)]
        source: String,
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteSeed {
    id: Option<i64>,
    canonical_name: String,
    canonical_code: Option<String>,
    #[serde(default)]
    aliases: serde_json::Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.settings {
        Some(path) => EngineSettings::load(path)?,
        None => EngineSettings::default(),
    };
    settings.apply_env()?;
    if let Err(error) = init_tracing(&settings.log_dir) {
        eprintln!("logging disabled: {error}");
    }

    match cli.command {
        Commands::RunPlan { plan, chart } => {
            let raw = std::fs::read_to_string(&plan).with_context(|| format!("reading {}", plan.display()))?;
            let plan = Plan::parse(&raw)?;
            let db = open_database(&settings)?;
            let interpreter = build_interpreter(db.clone(), db, &settings);
            let mut context = interpreter.run(&plan).await;
            if chart {
                merge_series(&mut context);
            }
            println!("{}", serde_json::to_string_pretty(&context.to_json())?);
        }
        Commands::Catalog => {
            let sources: Vec<serde_json::Value> = CATALOG
                .iter()
                .map(|spec| {
                    serde_json::json!({
                        "source": spec.name,
                        "aliases": spec.legacy_names,
                        "metrics": spec.metric_names().collect::<Vec<_>>(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&sources)?);
        }
        Commands::ImportSites { file } => {
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let seeds: Vec<SiteSeed> = serde_json::from_str(&raw).context("sites file must be a JSON array")?;
            let db = open_database(&settings)?;
            for seed in &seeds {
                db.insert_site(seed.id, &seed.canonical_name, seed.canonical_code.as_deref(), &seed.aliases)?;
            }
            println!("imported {} sites", seeds.len());
        }
        Commands::ImportRecords { source, file } => {
            let spec = catalog::require_source(&source)?;
            let raw = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let documents: Vec<serde_json::Value> =
                serde_json::from_str(&raw).context("records file must be a JSON array")?;
            let db = open_database(&settings)?;
            let count = db.import_records(spec, &documents)?;
            println!("imported {count} {} records", spec.name);
        }
    }

    Ok(())
}
