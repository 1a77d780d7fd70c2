use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use medharvest::aggregator::ManifestAggregator;
use medharvest::cohort::build_cohort;
use medharvest::config::{ConfigLoader, ResolvedConfig};
use medharvest::domain::FilterSet;
use medharvest::error::HarvestError;
use medharvest::gdc::GdcHttpClient;
use medharvest::idc::{IdcHttpClient, ImagingRegistry};
use medharvest::manifest::Manifest;
use medharvest::output::{JsonOutput, TextProgress, human_size};
use medharvest::pipeline::PipelineDriver;
use medharvest::store::DataStore;
use medharvest::tcia::TciaHttpClient;

#[derive(Parser)]
#[command(name = "medharvest")]
#[command(about = "Aggregate per-patient clinical and imaging file metadata and harvest the referenced artifacts")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Build a cohort and generate its manifest")]
    Cohort(CohortArgs),
    #[command(about = "Download, extract, and organize everything the manifest references")]
    Download(DownloadArgs),
    #[command(about = "Per-modality file counts and total sizes from the manifest")]
    Stats(StatsArgs),
}

#[derive(Args)]
struct CohortArgs {
    #[arg(long, help = "Cohort file: JSON mapping or tab-separated table")]
    cohort: Option<Utf8PathBuf>,

    #[arg(long, help = "Cohort query for an external cohort store")]
    query: Option<String>,

    #[arg(long)]
    output_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, help = "Use the legacy TCIA registry instead of IDC")]
    tcia: bool,
}

#[derive(Args)]
struct DownloadArgs {
    #[arg(long)]
    output_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    threads: Option<usize>,

    #[arg(long, value_delimiter = ',')]
    include: Vec<String>,

    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,

    #[arg(long, help = "Use the legacy TCIA registry instead of IDC")]
    tcia: bool,
}

#[derive(Args)]
struct StatsArgs {
    #[arg(long)]
    output_dir: Option<Utf8PathBuf>,

    #[arg(long)]
    config: Option<String>,

    #[arg(long, help = "Emit JSON instead of a table")]
    json: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(harvest) = report.downcast_ref::<HarvestError>() {
            return ExitCode::from(map_exit_code(harvest));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &HarvestError) -> u8 {
    match error {
        HarvestError::InvalidCohortSpec
        | HarvestError::ManifestMissing(_)
        | HarvestError::MissingConfig => 2,
        HarvestError::RegistryUnavailable { .. }
        | HarvestError::IncompletePage { .. }
        | HarvestError::DownloadFailed { .. }
        | HarvestError::GdcHttp(_)
        | HarvestError::GdcStatus { .. }
        | HarvestError::IdcHttp(_)
        | HarvestError::IdcStatus { .. }
        | HarvestError::TciaHttp(_)
        | HarvestError::TciaStatus { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Cohort(args) => run_cohort(args),
        Commands::Download(args) => run_download(args),
        Commands::Stats(args) => run_stats(args),
    }
}

/// Effective settings: explicit flags win; a config file backfills the rest;
/// built-in defaults last. The config file is only required when no
/// `--output-dir` was given.
struct Settings {
    output_dir: Utf8PathBuf,
    threads: usize,
    workers: usize,
    filters: FilterSet,
}

fn settings(
    config: Option<&str>,
    output_dir: Option<Utf8PathBuf>,
    threads: Option<usize>,
    workers: Option<usize>,
    include: Vec<String>,
    exclude: Vec<String>,
) -> Result<Settings, HarvestError> {
    let resolved: Option<ResolvedConfig> = if config.is_some() || output_dir.is_none() {
        Some(ConfigLoader::resolve(config)?)
    } else {
        None
    };

    let output_dir = match (output_dir, &resolved) {
        (Some(dir), _) => dir,
        (None, Some(resolved)) => resolved.output_dir.clone(),
        (None, None) => return Err(HarvestError::MissingConfig),
    };
    let threads = threads
        .or(resolved.as_ref().map(|r| r.threads))
        .unwrap_or(medharvest::acquire::DEFAULT_THREADS);
    let workers = workers
        .or(resolved.as_ref().map(|r| r.workers))
        .unwrap_or(medharvest::aggregator::DEFAULT_WORKERS);

    let (include, exclude) = if include.is_empty() && exclude.is_empty() {
        resolved
            .as_ref()
            .map(|r| (r.include.clone(), r.exclude.clone()))
            .unwrap_or_default()
    } else {
        (include, exclude)
    };

    Ok(Settings {
        output_dir,
        threads,
        workers,
        filters: FilterSet::new(include, exclude),
    })
}

fn imaging_registries(tcia: bool) -> Result<Vec<Box<dyn ImagingRegistry>>, HarvestError> {
    if tcia {
        Ok(vec![Box::new(TciaHttpClient::new()?)])
    } else {
        Ok(vec![Box::new(IdcHttpClient::new()?)])
    }
}

fn run_cohort(args: CohortArgs) -> miette::Result<()> {
    let settings = settings(
        args.config.as_deref(),
        args.output_dir,
        None,
        args.workers,
        Vec::new(),
        Vec::new(),
    )
    .into_diagnostic()?;

    let cohort = build_cohort(
        None,
        args.query.as_deref(),
        args.cohort.as_deref().map(|path| path.as_std_path()),
    )
    .into_diagnostic()?;

    let store = DataStore::new(settings.output_dir);
    let clinical = GdcHttpClient::new().into_diagnostic()?;
    let imaging = imaging_registries(args.tcia).into_diagnostic()?;

    let aggregator = ManifestAggregator::new(cohort, store.clone(), clinical, imaging)
        .with_workers(settings.workers);
    let report = aggregator.generate_manifest(&TextProgress).into_diagnostic()?;

    println!(
        "manifest written to {} ({} entries; {} of {} cases failed, {} imaging fetches failed)",
        store.manifest_path(),
        report.manifest_entries,
        report.cases_failed,
        report.cases_total,
        report.imaging_failed,
    );
    Ok(())
}

fn run_download(args: DownloadArgs) -> miette::Result<()> {
    let settings = settings(
        args.config.as_deref(),
        args.output_dir,
        args.threads,
        None,
        args.include,
        args.exclude,
    )
    .into_diagnostic()?;

    let store = DataStore::new(settings.output_dir);
    let clinical = GdcHttpClient::new().into_diagnostic()?;
    let imaging = imaging_registries(args.tcia).into_diagnostic()?;

    let mut driver = PipelineDriver::new(store, clinical, imaging, settings.filters)
        .with_threads(settings.threads);
    let report = driver.run(&TextProgress).into_diagnostic()?;

    println!(
        "downloaded {} files and {} series ({} skipped as present, {} failures)",
        report.acquire.files_downloaded,
        report.acquire.series_downloaded,
        report.acquire.files_skipped + report.acquire.series_skipped,
        report.acquire.failures,
    );
    println!(
        "expanded {} archives ({} corrupt), organized {} items, removed {} leftovers",
        report.expand.expanded, report.expand.failed, report.organize.moved, report.cleaned,
    );
    Ok(())
}

fn run_stats(args: StatsArgs) -> miette::Result<()> {
    let settings = settings(
        args.config.as_deref(),
        args.output_dir,
        None,
        None,
        Vec::new(),
        Vec::new(),
    )
    .into_diagnostic()?;

    let store = DataStore::new(settings.output_dir);
    let manifest = Manifest::load(&store.manifest_path()).into_diagnostic()?;
    let stats = manifest.stats();

    if args.json {
        JsonOutput::print_stats(&stats).into_diagnostic()?;
        return Ok(());
    }

    println!("{:<40} {:>10} {:>12}", "Modality", "Files", "Total Size");
    for row in &stats {
        println!(
            "{:<40} {:>10} {:>12}",
            row.modality,
            row.file_count,
            human_size(row.total_size)
        );
    }
    Ok(())
}
