use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use error::CliError;
use error_stack::ResultExt;
use log::{info, warn, LevelFilter};
use snowex_stack::{
    config::Config,
    lidar::SnowExLidarArchive,
    logging::init_logging,
    nc_utils::NcWriter,
    pipeline::StackPipeline,
    retrieval::CommandRetriever,
    sites::select_sites,
};

mod error;
mod progress;

fn main() -> ExitCode {
    let clargs = Cli::parse();

    let log_level = clargs.verbosity.log_level_filter();
    if let Err(e) = init_logging(log_level, clargs.log_file.as_deref()) {
        eprintln!("download_stack_lidar could not start:\n{:?}", error_stack::Report::new(e).change_context(CliError::Logging));
        return ExitCode::FAILURE;
    }

    match driver(clargs, log_level) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("download_stack_lidar did not complete successfully:\n{e:?}");
            ExitCode::FAILURE
        }
    }
}

/// Download SnowEx LIDAR products and pair each flight with a Sentinel-1
/// snow depth retrieval, writing one merged netCDF file per site and flight.
#[derive(Debug, clap::Parser)]
struct Cli {
    /// TOML file overriding the built-in configuration.
    #[clap(long)]
    config: Option<PathBuf>,

    /// Only process this site code (e.g. USIDBS). May be given multiple
    /// times; sites are still processed in configuration order.
    #[clap(long = "site")]
    sites: Vec<String>,

    /// Do not download LIDAR products, use those already in the LIDAR directory.
    #[clap(long)]
    skip_download: bool,

    /// Also write the per-flight summary as JSON to this path.
    #[clap(long)]
    summary_json: Option<PathBuf>,

    /// Also log to this file, at debug level or more verbose.
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Print the fully resolved configuration as TOML and exit.
    #[clap(long)]
    print_config: bool,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}

fn driver(clargs: Cli, log_level: LevelFilter) -> error_stack::Result<(), CliError> {
    let config = Config::load(clargs.config.as_deref()).change_context(CliError::ReadingConfig)?;

    if clargs.print_config {
        let s = toml::to_string_pretty(&config)
            .change_context(CliError::Custom("could not serialize the configuration"))?;
        println!("{s}");
        return Ok(());
    }

    let sites = if clargs.sites.is_empty() {
        config.sites.clone()
    } else {
        select_sites(&config.sites, &clargs.sites).change_context(CliError::SelectingSites)?
    };

    let lidar = SnowExLidarArchive::new(config.downloads.clone())
        .change_context(CliError::Setup("LIDAR archive"))?;
    let mut retriever = CommandRetriever::new(&config.retrieval_command)
        .change_context(CliError::Setup("snow depth retrieval"))?;
    let mut writer = NcWriter;
    let mut pipeline = StackPipeline::new(&config, &lidar, &mut retriever, &mut writer);

    let pb = progress::flight_pb(log_level <= LevelFilter::Warn);
    let summary = pipeline
        .run(
            &sites,
            !clargs.skip_download,
            |site| progress::setup_site_pb(&pb, site),
            |record| {
                pb.inc(1);
                pb.set_message(format!("{} {}", record.flight, record.outcome.label()));
            },
        )
        .change_context(CliError::Running)?;
    pb.finish_and_clear();

    summary
        .write_table(&mut std::io::stdout())
        .change_context(CliError::WritingSummary)?;

    if let Some(path) = clargs.summary_json {
        summary
            .write_json(&path)
            .change_context(CliError::WritingSummary)
            .attach_printable_lazy(|| format!("JSON summary path: {}", path.display()))?;
        info!("Wrote summary to {}", path.display());
    }

    let n_failed = summary.n_failed();
    if n_failed > 0 {
        warn!("{n_failed} of {} flights could not be written", summary.flights.len());
    }
    Ok(())
}
