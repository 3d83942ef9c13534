//! # ALE Subtraction CLI
//!
//! Command-line front end for the `ale_subtraction` library. It reads two
//! JSON datasets of reported foci, runs a permutation-based subtraction
//! analysis (group 1 minus group 2) and reports the strongest voxels.
//!
//! * **Argument parsing** – `clap` derives [`Args`].
//! * **Logging** – a `tracing` subscriber at the requested level.
//! * **Analysis** – [`Subtraction::fit`] does the heavy lifting in parallel
//!   with Rayon; a fixed seed makes runs reproducible.
//! * **Result presentation** – two `comfy_table` tables: run metadata and the
//!   top voxels by |z|. The full result can be written as JSON.

use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL_CONDENSED;
use comfy_table::{Cell, Table};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ale_subtraction::null::DEFAULT_HISTOGRAM_BINS;
use ale_subtraction::subtraction::{DEFAULT_N_PERMUTATIONS, DEFAULT_SEED};
use ale_subtraction::{
    Dataset, Group, KernelConfig, NullRepresentation, PartitionStrategy, Peak, Subtraction,
    SubtractionConfig, SubtractionResult,
};

/// Command-line interface definition.
#[derive(Parser, Debug)]
#[command(name = "ale-subtract", version, about = "Voxel-wise ALE subtraction analysis of two meta-analytic datasets.")]
struct Args {
    /// First dataset (JSON); positive z means stronger convergence here
    #[arg(long)]
    group1: PathBuf,

    /// Second dataset (JSON)
    #[arg(long)]
    group2: PathBuf,

    /// Number of group-label permutations
    #[arg(long = "n-iters", default_value_t = DEFAULT_N_PERMUTATIONS)]
    n_iters: usize,

    /// Random seed – enables reproducible permutations
    #[arg(long = "random-seed")]
    seed: Option<u64>,

    /// Kernel used to model each study's foci
    #[arg(long, value_parser = ["ale", "mkda"], default_value = "ale")]
    kernel: String,

    /// Fixed ALE kernel FWHM in mm (default: derived from sample size)
    #[arg(long)]
    fwhm: Option<f64>,

    /// MKDA sphere radius in mm
    #[arg(long, default_value_t = 10.0)]
    radius: f64,

    /// How the permutation null is stored
    #[arg(long, value_parser = ["exceedance", "histogram", "full"], default_value = "exceedance")]
    null: String,

    /// Histogram bins when `--null histogram`
    #[arg(long, default_value_t = DEFAULT_HISTOGRAM_BINS)]
    bins: usize,

    /// Always sample partitions, even when all of them could be enumerated
    #[arg(long = "always-sample")]
    always_sample: bool,

    /// Worker threads (default: one per core)
    #[arg(long)]
    threads: Option<usize>,

    /// Write the full result to this JSON file
    #[arg(long)]
    output: Option<PathBuf>,

    /// Number of peak voxels to print
    #[arg(long, default_value_t = 10)]
    top: usize,

    /// Voxels with p at or below this are starred
    #[arg(long, default_value_t = 0.05)]
    alpha: f64,

    /// Number of decimal places when printing
    #[arg(long, default_value_t = 3)]
    round: usize,

    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> SubtractionConfig {
        let kernel = match self.kernel.as_str() {
            "mkda" => KernelConfig::Mkda { radius: self.radius, value: 1.0 },
            _ => KernelConfig::Ale { fwhm: self.fwhm },
        };
        let null_representation = match self.null.as_str() {
            "histogram" => NullRepresentation::Histogram { bins: self.bins },
            "full" => NullRepresentation::Full,
            _ => NullRepresentation::Exceedance,
        };
        let partition_strategy = if self.always_sample {
            PartitionStrategy::Sample
        } else {
            PartitionStrategy::Auto
        };
        SubtractionConfig {
            kernel,
            aggregation: None,
            n_permutations: self.n_iters,
            seed: Some(self.seed.unwrap_or(DEFAULT_SEED)),
            null_representation,
            partition_strategy,
            histogram_bound: None,
        }
    }
}

/* ---------------------------------------------------------------------------
 *  Table rendering
 * ---------------------------------------------------------------------------
 */
fn new_table() -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED).apply_modifier(UTF8_ROUND_CORNERS);
    table
}

fn metadata_table(result: &SubtractionResult) -> Table {
    let meta = result.metadata();
    let mut table = new_table();
    table.set_header(vec![Cell::new("Parameter"), Cell::new("Value")]);
    let rows = [
        ("|A|", meta.n_studies_a.to_string()),
        ("|B|", meta.n_studies_b.to_string()),
        ("Kernel", meta.kernel_description.clone()),
        ("Aggregation", meta.aggregation.clone()),
        ("Permutations", format!("{} of {} requested", meta.n_permutations, meta.n_permutations_requested)),
        ("Exhaustive", meta.exhaustive.to_string()),
        ("Seed", meta.seed.to_string()),
        ("Voxels", meta.n_voxels.to_string()),
        ("Degenerate voxels", meta.n_degenerate_voxels.to_string()),
    ];
    for (name, value) in rows {
        table.add_row(vec![Cell::new(name), Cell::new(value)]);
    }
    table
}

fn format_peak(peak: &Peak, digits: usize, alpha: f64) -> Vec<Cell> {
    let suffix = if peak.p <= alpha + 1e-8 { "*" } else { "" };
    let [i, j, k] = peak.voxel;
    let [x, y, z] = peak.world;
    vec![
        Cell::new(format!("({i}, {j}, {k})")),
        Cell::new(format!("({x:.1}, {y:.1}, {z:.1})")),
        Cell::new(format!("{:.1$}", peak.difference, digits)),
        Cell::new(format!("{:.1$}", peak.z, digits)),
        Cell::new(format!("{:.1$}{2}", peak.p, digits, suffix)),
    ]
}

fn peaks_table(result: &SubtractionResult, top: usize, digits: usize, alpha: f64) -> Table {
    let mut table = new_table();
    table.set_header(
        ["Voxel", "World (mm)", "ALE(A) - ALE(B)", "Z", "P-Value"]
            .iter()
            .map(|h| Cell::new(*h))
            .collect::<Vec<_>>(),
    );
    for peak in result.peaks(top) {
        table.add_row(format_peak(&peak, digits, alpha));
    }
    table
}

/* ---------------------------------------------------------------------------
 *  Main entry point
 * ---------------------------------------------------------------------------
 * 1. Parse arguments and install the logger.
 * 2. Load both datasets.
 * 3. Run the subtraction.
 * 4. Print metadata and peaks; optionally write the JSON result.
 */
fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(threads) = args.threads {
        rayon::ThreadPoolBuilder::new().num_threads(threads).build_global()?;
    }

    let group1 = Dataset::from_json_file(&args.group1, Group::A)?;
    let group2 = Dataset::from_json_file(&args.group2, Group::B)?;

    let result = Subtraction::new(args.config())?.fit(&group1, &group2)?;

    println!("{}", metadata_table(&result));
    println!("{}", peaks_table(&result, args.top, args.round, args.alpha));

    if let Some(path) = &args.output {
        result.to_json_file(path)?;
        info!(path = %path.display(), "Wrote result");
    }
    Ok(())
}
