//! The driver that pairs every LIDAR flight with a snow depth retrieval.
//!
//! For each site, the LIDAR products are stacked into one dataset, implausible
//! values are masked, and each flight is then handled in turn:
//!
//! 1. if the output file already exists, the flight is skipped;
//! 2. flights after April are skipped;
//! 3. the snow depth retrieval is run from August 1 of the water year through
//!    two weeks after the flight, over the bounding box of the LIDAR data;
//! 4. the LIDAR slice for that flight is resampled onto the retrieval grid,
//!    merged with the retrieval and written out.
//!
//! Only a failure to write the output is tolerated; any other error stops the run.
use std::{
    borrow::Cow,
    path::{Path, PathBuf},
};

use chrono::NaiveDate;
use geo::Rect;
use log::{debug, error, info, warn};
use serde::Serialize;
use tabled::settings::{object::Columns, Alignment, Padding, Style};

use crate::{
    config::Config,
    dates::{format_date, is_in_season, job_name, RetrievalWindow},
    error::DateError,
    grid::{GridError, GriddedDataset},
    interface::{DatasetWriter, LidarError, LidarSource, RetrievalError, SnowDepthRetriever},
    sites::Site,
};

pub const SITE_ATTR: &str = "site";
pub const SITE_ABBREV_ATTR: &str = "site_abbrev";
pub const FLIGHT_TIME_ATTR: &str = "lidar-flight-time";

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Could not create directory {}: {inner}", path.display())]
    CreateDir { path: PathBuf, inner: std::io::Error },
    #[error("Error getting LIDAR data: {0}")]
    Lidar(#[from] LidarError),
    #[error("Error retrieving snow depth: {0}")]
    Retrieval(#[from] RetrievalError),
    #[error("Error combining grids: {0}")]
    Grid(#[from] GridError),
    #[error(transparent)]
    Date(#[from] DateError),
}

/// What happened to one flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum FlightOutcome {
    Written,
    AlreadyExists,
    OutOfSeason,
    WriteFailed(String),
}

impl FlightOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FlightOutcome::Written => "written",
            FlightOutcome::AlreadyExists => "already exists",
            FlightOutcome::OutOfSeason => "out of season",
            FlightOutcome::WriteFailed(_) => "write failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlightRecord {
    pub site_code: String,
    pub site_name: String,
    pub flight: NaiveDate,
    pub output: PathBuf,
    #[serde(flatten)]
    pub outcome: FlightOutcome,
}

impl tabled::Tabled for FlightRecord {
    const LENGTH: usize = 4;

    fn fields(&self) -> Vec<Cow<'_, str>> {
        let outcome = match &self.outcome {
            FlightOutcome::WriteFailed(reason) => format!("write failed: {reason}").into(),
            other => other.label().into(),
        };
        vec![
            self.site_name.as_str().into(),
            format_date(self.flight).into(),
            outcome,
            self.output.display().to_string().into(),
        ]
    }

    fn headers() -> Vec<Cow<'static, str>> {
        vec!["site".into(), "flight".into(), "outcome".into(), "output".into()]
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub flights: Vec<FlightRecord>,
}

impl RunSummary {
    pub fn count(&self, label: &str) -> usize {
        self.flights.iter().filter(|f| f.outcome.label() == label).count()
    }

    pub fn n_failed(&self) -> usize {
        self.flights
            .iter()
            .filter(|f| matches!(f.outcome, FlightOutcome::WriteFailed(_)))
            .count()
    }

    /// Write one row per flight as a plain, left-aligned table. Columns are
    /// separated by a single space and lines start with the first column.
    pub fn write_table<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
        let mut table = tabled::Table::new(&self.flights);
        table
            .with(Style::blank())
            .with(Alignment::left())
            .with(Padding::new(0, 1, 0, 0))
            .modify(Columns::last(), Padding::zero());
        writeln!(writer, "{table}")
    }

    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let f = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(f), self)?;
        Ok(())
    }
}

fn create_dir(path: &Path) -> Result<(), PipelineError> {
    std::fs::create_dir_all(path).map_err(|e| PipelineError::CreateDir {
        path: path.to_path_buf(),
        inner: e,
    })
}

pub struct StackPipeline<'a> {
    config: &'a Config,
    lidar: &'a dyn LidarSource,
    retriever: &'a mut dyn SnowDepthRetriever,
    writer: &'a mut dyn DatasetWriter,
}

impl<'a> StackPipeline<'a> {
    pub fn new(
        config: &'a Config,
        lidar: &'a dyn LidarSource,
        retriever: &'a mut dyn SnowDepthRetriever,
        writer: &'a mut dyn DatasetWriter,
    ) -> Self {
        Self {
            config,
            lidar,
            retriever,
            writer,
        }
    }

    /// Fetch the snow depth, vegetation height and DEM products into the LIDAR directory.
    pub fn download_all(&self) -> Result<(), PipelineError> {
        let dir = &self.config.lidar_dir;
        create_dir(dir)?;
        info!("Downloading LIDAR products to {}", dir.display());
        self.lidar.download_snow_depth(dir)?;
        self.lidar.download_veg_height(dir)?;
        self.lidar.download_dem(dir)?;
        Ok(())
    }

    /// Download the products, then process every site in order. `on_site` is
    /// called before each site is started and `on_flight` after each flight.
    pub fn run<S, F>(
        &mut self,
        sites: &[Site],
        download: bool,
        mut on_site: S,
        mut on_flight: F,
    ) -> Result<RunSummary, PipelineError>
    where
        S: FnMut(&Site),
        F: FnMut(&FlightRecord),
    {
        if download {
            self.download_all()?;
        } else {
            info!("Skipping LIDAR downloads");
        }

        let mut summary = RunSummary::default();
        for site in sites {
            on_site(site);
            let records = self.process_site(site, &mut on_flight)?;
            summary.flights.extend(records);
        }
        Ok(summary)
    }

    /// Build the site dataset and process each of its flights in the order the dataset lists them.
    pub fn process_site<F: FnMut(&FlightRecord)>(
        &mut self,
        site: &Site,
        mut on_flight: F,
    ) -> Result<Vec<FlightRecord>, PipelineError> {
        info!("{}", "-".repeat(40));
        info!("Starting {}", site.name);

        let site_ds = self
            .lidar
            .make_site_ds(&site.code, &self.config.lidar_dir)?
            .clip_open_range(self.config.clip_min, self.config.clip_max);
        let area = site_ds.bounds()?;
        debug!("{site} LIDAR bounds: {:?} to {:?}", area.min(), area.max());

        let flights = site_ds.times().map(|t| t.to_vec()).unwrap_or_default();
        if flights.is_empty() {
            warn!("No LIDAR flights found for {site}");
        }

        create_dir(&self.config.out_dir)?;
        create_dir(&self.config.work_dir)?;
        let mut records = vec![];
        for flight in flights {
            let output = self.config.output_path(&site.name, flight);
            let outcome = self.process_flight(site, &site_ds, area, flight, &output)?;
            let record = FlightRecord {
                site_code: site.code.clone(),
                site_name: site.name.clone(),
                flight,
                output,
                outcome,
            };
            on_flight(&record);
            records.push(record);
        }
        Ok(records)
    }

    fn process_flight(
        &mut self,
        site: &Site,
        site_ds: &GriddedDataset,
        area: Rect<f64>,
        flight: NaiveDate,
        out_nc: &Path,
    ) -> Result<FlightOutcome, PipelineError> {
        if out_nc.exists() {
            info!("Outfile {} exists already.", out_nc.display());
            return Ok(FlightOutcome::AlreadyExists);
        }

        let flight_str = format_date(flight);
        info!("Starting {} snow depth @ {flight_str}", site.name);

        if !is_in_season(flight) {
            debug!("Skipping {} flight on {flight_str}, it is after the snow season", site.name);
            return Ok(FlightOutcome::OutOfSeason);
        }

        let lidar_ds = site_ds.select_time(flight)?;
        let dates = RetrievalWindow::for_flight(flight)?;
        let job = job_name(&site.code, &dates);
        let spicy_ds = self.retriever.retrieve_snow_depth(
            area,
            &dates,
            &self.config.work_dir,
            &job,
            &job,
        )?;

        let lidar_ds = lidar_ds.reproject_match(&spicy_ds)?;
        let mut ds = GriddedDataset::merge_drop_conflicts(&[&spicy_ds, &lidar_ds])?;
        ds.set_attr(SITE_ATTR, site.name.as_str());
        ds.set_attr(SITE_ABBREV_ATTR, site.code.as_str());
        ds.set_attr(FLIGHT_TIME_ATTR, flight_str);

        match self.writer.write(&ds, out_nc) {
            Ok(()) => {
                info!("Wrote {}", out_nc.display());
                Ok(FlightOutcome::Written)
            }
            Err(e) => {
                error!("Unable to create netCDF file {} for {}: {e}", out_nc.display(), site.name);
                Ok(FlightOutcome::WriteFailed(e.to_string()))
            }
        }
    }
}
