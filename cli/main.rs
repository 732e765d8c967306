#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use tally::balance::balance_table;
use tally::config::AnalysisConfig;
use tally::data::{RespondentTable, load_respondents};
use tally::prevalence::{cluster_outcomes, summarize_by_arm};
use tally::reconcile::{ReconciledCount, Reconciliation, reconcile_table};
use tally::report;
use tally::scan::scan_covariates;
use tally::schools::load_schools;

#[derive(Parser)]
#[command(
    name = "tally",
    about = "Baseline analysis for cluster-randomized violence-prevention trials",
    long_about = "Adjudicates self-reported incident counts, estimates prevalence with \
                 cluster-bootstrap intervals, checks baseline balance between arms, and \
                 screens school-level covariates."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct RespondentArgs {
    /// Respondent table (CSV, or TSV for .tsv/.tab files)
    #[arg(value_name = "RESPONDENTS")]
    respondents: PathBuf,

    /// Analysis configuration (.toml)
    #[arg(long, value_name = "TOML")]
    config: PathBuf,
}

#[derive(Args)]
struct PrevalenceArgs {
    #[command(flatten)]
    input: RespondentArgs,

    /// Number of bootstrap repetitions (overrides the configuration)
    #[arg(long, value_name = "N")]
    replicates: Option<usize>,

    /// Base seed for the bootstrap (overrides the configuration)
    #[arg(long)]
    seed: Option<u64>,

    /// Two-sided confidence level of the interval (overrides the configuration)
    #[arg(long)]
    confidence: Option<f64>,

    /// Write the per-arm summary table to this TSV file
    #[arg(long, value_name = "TSV")]
    out: Option<PathBuf>,

    /// Write the per-cluster outcome table to this TSV file
    #[arg(long, value_name = "TSV")]
    clusters_out: Option<PathBuf>,
}

#[derive(Args)]
struct ScanArgs {
    /// School table (CSV, or TSV for .tsv/.tab files)
    #[arg(value_name = "SCHOOLS")]
    schools: PathBuf,

    /// Analysis configuration (.toml)
    #[arg(long, value_name = "TOML")]
    config: PathBuf,

    /// Respondent table; when given, school outcomes are recomputed from it
    #[arg(long, value_name = "RESPONDENTS")]
    respondents: Option<PathBuf>,

    /// Predictor to scan; repeat for several. Defaults to the configured list,
    /// then to every feature column.
    #[arg(long, value_name = "NAME")]
    predictor: Vec<String>,

    /// Write the scan table to this TSV file
    #[arg(long, value_name = "TSV")]
    out: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile self-reported incident counts into one count per respondent
    #[command(about = "Reconcile incident counts (outputs: reconciled.tsv)")]
    Reconcile {
        #[command(flatten)]
        input: RespondentArgs,

        /// Write the per-respondent breakdown to this TSV file
        #[arg(long, value_name = "TSV")]
        out: Option<PathBuf>,

        /// Write every normalized answer, in signed form, to this TSV file
        #[arg(long, value_name = "TSV")]
        normalized_out: Option<PathBuf>,
    },

    /// Estimate prevalence per arm with cluster-bootstrap intervals
    #[command(about = "Estimate prevalence with cluster-bootstrap intervals")]
    Prevalence(PrevalenceArgs),

    /// Compare baseline covariates between the trial arms
    #[command(about = "Baseline balance between treatment and control")]
    Balance {
        #[command(flatten)]
        input: RespondentArgs,

        /// Write the balance table to this TSV file
        #[arg(long, value_name = "TSV")]
        out: Option<PathBuf>,
    },

    /// Screen school-level covariates against the outcome rate
    #[command(about = "Univariate covariate screening ranked by p-value")]
    Scan(ScanArgs),

    /// Display version and build information
    #[command(about = "Display version and build information")]
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Reconcile {
            input,
            out,
            normalized_out,
        }) => run_reconcile(&input, out.as_deref(), normalized_out.as_deref()),
        Some(Commands::Prevalence(args)) => run_prevalence(&args),
        Some(Commands::Balance { input, out }) => run_balance(&input, out.as_deref()),
        Some(Commands::Scan(args)) => run_scan(&args),
        Some(Commands::Version) => {
            print_version_info();
            Ok(())
        }
        None => {
            let printed = Cli::command().print_help();
            println!();
            printed.map_err(|e| Box::new(e) as Box<dyn Error>)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

/// Loads the configuration and respondent table and reconciles every row.
fn load_and_reconcile(
    args: &RespondentArgs,
) -> Result<(AnalysisConfig, RespondentTable, Vec<Reconciliation>), Box<dyn Error>> {
    let config = AnalysisConfig::load(&args.config)?;
    let table = load_respondents(&args.respondents, &config)?;
    let reconciliations = reconcile_table(&table);
    Ok((config, table, reconciliations))
}

fn counts_of(reconciliations: &[Reconciliation]) -> Vec<ReconciledCount> {
    reconciliations.iter().map(|r| r.count).collect()
}

fn run_reconcile(
    args: &RespondentArgs,
    out: Option<&Path>,
    normalized_out: Option<&Path>,
) -> Result<(), Box<dyn Error>> {
    let (_, table, reconciliations) = load_and_reconcile(args)?;
    report::print_reconciliation_summary(&mut io::stdout().lock(), &reconciliations)?;
    if let Some(path) = out {
        report::save(path, |w| report::write_reconciliations(w, &table, &reconciliations))?;
    }
    if let Some(path) = normalized_out {
        report::save(path, |w| report::write_normalized(w, &table))?;
    }
    Ok(())
}

fn run_prevalence(args: &PrevalenceArgs) -> Result<(), Box<dyn Error>> {
    let (config, table, reconciliations) = load_and_reconcile(&args.input)?;

    let mut settings = config.bootstrap;
    if let Some(replicates) = args.replicates {
        settings.replicates = replicates;
    }
    if args.seed.is_some() {
        settings.seed = args.seed;
    }
    if let Some(confidence) = args.confidence {
        settings.confidence = confidence;
    }
    settings.validate()?;

    let counts = counts_of(&reconciliations);
    let outcomes = cluster_outcomes(&table, &counts);

    let spinner = create_spinner(&format!(
        "Running {} cluster-bootstrap repetitions per group",
        settings.replicates
    ));
    let summaries = summarize_by_arm(&table, &counts, &settings);
    spinner.finish_and_clear();
    let summaries = summaries?;

    report::print_arm_summaries(&mut io::stdout().lock(), &summaries, settings.confidence)?;
    if let Some(path) = &args.out {
        report::save(path, |w| {
            report::write_arm_summaries(w, &summaries, settings.confidence)
        })?;
    }
    if let Some(path) = &args.clusters_out {
        report::save(path, |w| report::write_cluster_outcomes(w, &outcomes))?;
    }
    Ok(())
}

fn run_balance(args: &RespondentArgs, out: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let (_, table, reconciliations) = load_and_reconcile(args)?;
    let balance = balance_table(&table, &counts_of(&reconciliations));
    report::print_balance(&mut io::stdout().lock(), &balance)?;
    if let Some(path) = out {
        report::save(path, |w| report::write_balance(w, &balance))?;
    }
    Ok(())
}

fn run_scan(args: &ScanArgs) -> Result<(), Box<dyn Error>> {
    let config = AnalysisConfig::load(&args.config)?;
    let mut schools = load_schools(&args.schools, &config)?;

    if let Some(path) = &args.respondents {
        let table = load_respondents(path, &config)?;
        let reconciliations = reconcile_table(&table);
        let outcomes = cluster_outcomes(&table, &counts_of(&reconciliations));
        let matched = schools.attach_outcomes(&outcomes);
        log::info!(
            "Outcomes recomputed from respondent data for {matched} of {} schools",
            schools.len()
        );
    }

    let predictors = if args.predictor.is_empty() {
        config.schools.predictors.clone()
    } else {
        args.predictor.clone()
    };
    let rows = scan_covariates(&schools, &predictors)?;

    report::print_scan(&mut io::stdout().lock(), &rows)?;
    if let Some(path) = &args.out {
        report::save(path, |w| report::write_scan(w, &rows))?;
    }
    Ok(())
}

fn create_spinner(message: &str) -> ProgressBar {
    let draw_target = if io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(None, draw_target);
    pb.set_style(
        ProgressStyle::with_template("> [{elapsed_precise}] {spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Format seconds into a human-readable duration like "2.4 hours ago"
fn format_duration_ago(seconds: u64) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    if seconds < MINUTE {
        format!("{seconds} seconds ago")
    } else if seconds < HOUR {
        format!("{:.1} minutes ago", seconds as f64 / MINUTE as f64)
    } else if seconds < DAY {
        format!("{:.1} hours ago", seconds as f64 / HOUR as f64)
    } else {
        format!("{:.1} days ago", seconds as f64 / DAY as f64)
    }
}

fn print_version_info() {
    let version = env!("CARGO_PKG_VERSION");
    let build_timestamp: u64 = env!("TALLY_BUILD_TIMESTAMP").parse().unwrap_or(0);

    println!("tally {version}");

    if build_timestamp > 0 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        println!("Built: {}", format_duration_ago(now.saturating_sub(build_timestamp)));
    }
}
