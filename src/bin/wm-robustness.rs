use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};

use watermark_robustness::dataset::{image_metadata, prepare_directory, write_metadata, DEFAULT_SIZE};
use watermark_robustness::report::{render_comparison, render_markdown, ComparisonRow};
use watermark_robustness::{ExperimentConfig, Harness, Result, SweepSummary};

#[derive(Parser)]
#[command(
    name = "wm-robustness",
    about = "Measure how invisible image watermarks survive degradation attacks",
    version,
    after_help = "Typical run: wm-robustness run images/resized -o results\n\n\
                  Stages can also be run one at a time: sweep, score, merge, summarize.\n\
                  Set RUST_LOG to override the log filter."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Experiment configuration (JSON); defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output root for decode, lpips, merged and summary trees
    #[arg(short, long, global = true, default_value = "results")]
    output: PathBuf,

    /// Restrict to these attacks (comma separated)
    #[arg(long, global = true, value_delimiter = ',')]
    attacks: Vec<String>,

    /// Restrict to these watermarking methods (comma separated)
    #[arg(long, global = true, value_delimiter = ',')]
    methods: Vec<String>,

    /// Seed for the noise attack
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Dataset variant used for scoring, merging and normalization ranges
    #[arg(long, global = true)]
    variant: Option<String>,

    /// External perceptual scorer command (called with --dir and --output_csv)
    #[arg(long, global = true)]
    scorer: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Suppress all non-error output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Center-crop and resize every image into a square corpus
    Prepare {
        /// Directory of source images
        input: PathBuf,
        /// Directory for the prepared images
        target: PathBuf,
        /// Side length in pixels
        #[arg(long, default_value_t = DEFAULT_SIZE)]
        size: u32,
    },
    /// Write a CSV listing size and format of every image
    Metadata {
        /// Directory of images
        input: PathBuf,
        /// CSV file to write
        #[arg(long, default_value = "image_metadata.csv")]
        csv: PathBuf,
    },
    /// Embed, attack and decode every image
    Sweep {
        /// Image file or directory
        input: PathBuf,
    },
    /// Score every attacked image against its clean reference
    Score,
    /// Join decode tables with perceptual scores
    Merge,
    /// Aggregate merged tables into summary tables
    Summarize,
    /// Compare the summaries of two dataset variants
    Compare {
        /// Variant subtracted from
        base: String,
        /// Variant compared against the base
        other: String,
    },
    /// Sweep, score, merge and summarize in one go
    Run {
        /// Image file or directory
        input: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    match execute(&cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn load_config(cli: &Cli) -> Result<ExperimentConfig> {
    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::from_json_file(path)?,
        None => ExperimentConfig::default(),
    };
    if !cli.attacks.is_empty() {
        config.restrict_attacks(&cli.attacks)?;
    }
    if !cli.methods.is_empty() {
        config.methods.clone_from(&cli.methods);
    }
    if cli.seed.is_some() {
        config.seed = cli.seed;
    }
    if let Some(variant) = &cli.variant {
        config.variant.clone_from(variant);
    }
    if cli.scorer.is_some() {
        config.scorer_command.clone_from(&cli.scorer);
    }
    Ok(config)
}

/// Run the selected command; `Ok(false)` means some sweep failed.
fn execute(cli: &Cli) -> Result<bool> {
    match &cli.command {
        Command::Prepare { input, target, size } => {
            let written = prepare_directory(input, target, *size)?;
            if !cli.quiet {
                eprintln!("[Summary] Prepared: {} -> {}", written.len(), target.display());
            }
            return Ok(true);
        }
        Command::Metadata { input, csv } => {
            let rows = image_metadata(input)?;
            write_metadata(csv, &rows)?;
            if !cli.quiet {
                eprintln!("[Summary] {} images listed in {}", rows.len(), csv.display());
            }
            return Ok(true);
        }
        _ => {}
    }

    let harness = Harness::new(load_config(cli)?, &cli.output)?;
    match &cli.command {
        Command::Sweep { input } => Ok(run_sweeps(&harness, input, cli)),
        Command::Score => {
            let scorer = harness.scorer()?;
            let written = harness.score(scorer.as_ref())?;
            report_count(cli, "Scored", written.len());
            Ok(true)
        }
        Command::Merge => {
            let written = harness.merge()?;
            report_count(cli, "Merged", written.len());
            Ok(true)
        }
        Command::Summarize => {
            let report = harness.summarize()?;
            if !cli.quiet {
                println!("{}", render_markdown(&report.rows));
            }
            Ok(true)
        }
        Command::Compare { base, other } => {
            let rows: Vec<ComparisonRow> = harness.compare(base, other)?;
            if !cli.quiet {
                println!("{}", render_comparison(&rows, base, other));
            }
            Ok(true)
        }
        Command::Run { input } => {
            let swept = run_sweeps(&harness, input, cli);
            let scorer = harness.scorer()?;
            harness.score(scorer.as_ref())?;
            harness.merge()?;
            let report = harness.summarize()?;
            if !cli.quiet {
                println!("{}", render_markdown(&report.rows));
            }
            Ok(swept)
        }
        Command::Prepare { .. } | Command::Metadata { .. } => Ok(true),
    }
}

fn run_sweeps(harness: &Harness, input: &Path, cli: &Cli) -> bool {
    let results = if input.is_dir() {
        harness.run_directory(input)
    } else {
        match harness.run_image(input) {
            Ok(results) => results,
            Err(e) => {
                eprintln!("[FAIL] {}: {e}", input.display());
                return false;
            }
        }
    };

    let mut success_count = 0u32;
    let mut fail_count = 0u32;
    for r in &results {
        print_result(r, cli);
        if r.success {
            success_count += 1;
        } else {
            fail_count += 1;
        }
    }

    if results.len() > 1 && !cli.quiet {
        eprintln!();
        eprint!("[Summary] Swept: {success_count}");
        if fail_count > 0 {
            eprint!(", Failed: {fail_count}");
        }
        eprintln!(" (Total: {})", results.len());
    }

    fail_count == 0
}

fn report_count(cli: &Cli, verb: &str, count: usize) {
    if !cli.quiet {
        eprintln!("[Summary] {verb}: {count}");
    }
}

fn print_result(result: &SweepSummary, cli: &Cli) {
    if cli.quiet && result.success {
        return;
    }

    let filename = result.path.file_name().map_or_else(
        || result.path.display().to_string(),
        |f| f.to_string_lossy().to_string(),
    );

    if result.success {
        let breaks = result
            .first_failure
            .map_or_else(|| result.message.clone(), |v| format!("fails at {v}"));
        let clean = if result.can_decode_clean { "" } else { ", clean decode failed" };
        eprintln!(
            "[OK] {filename} {}/{}: {breaks}{clean}",
            result.method, result.attack
        );
    } else if result.attack.is_empty() {
        eprintln!("[FAIL] {filename}: {}", result.message);
    } else {
        eprintln!(
            "[FAIL] {filename} {}/{}: {}",
            result.method, result.attack, result.message
        );
    }

    if cli.verbose && !result.message.is_empty() {
        eprintln!("  -> {}", result.message);
    }
}
