//! The collaborators the stacking pipeline drives.
//!
//! The pipeline itself only decides what to fetch, when to skip, and how to
//! combine the results. Getting LIDAR products, running the snow depth
//! retrieval and serializing the merged dataset are each behind one of the
//! traits here so that they can be swapped out (or mocked in tests).
use std::path::{Path, PathBuf};

use geo::Rect;

use crate::{
    dates::RetrievalWindow,
    grid::{GridError, GriddedDataset},
};

#[derive(Debug, thiserror::Error)]
pub enum LidarError {
    #[error("Could not create directory {}: {inner}", path.display())]
    CreateDir { path: PathBuf, inner: std::io::Error },
    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),
    #[error("Download of {url} failed with HTTP status {status}")]
    DownloadFailed { url: String, status: u16 },
    #[error("Could not save download to {}: {inner}", path.display())]
    SaveDownload { path: PathBuf, inner: std::io::Error },
    #[error("Error searching for LIDAR files: {0}")]
    Glob(String),
    #[error("No snow depth files found for site {0}")]
    NoSnowDepth(String),
    #[error("Error reading LIDAR file {}: {cause}", path.display())]
    ReadError { path: PathBuf, cause: String },
    #[error("LIDAR file {} is not on the same grid as the other files for its site", .0.display())]
    GridMismatch(PathBuf),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error("{0}")]
    Custom(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Could not create retrieval work directory {}: {inner}", path.display())]
    CreateDir { path: PathBuf, inner: std::io::Error },
    #[error("Could not start retrieval program '{program}': {inner}")]
    Spawn { program: String, inner: std::io::Error },
    #[error("Retrieval program '{program}' failed ({status}): {stderr}")]
    CommandFailed { program: String, status: String, stderr: String },
    #[error("Retrieval finished but did not produce {}", .0.display())]
    MissingOutput(PathBuf),
    #[error("Error reading retrieval output {}: {cause}", path.display())]
    ReadError { path: PathBuf, cause: String },
    #[error("No retrieval program was configured")]
    NoProgram,
    #[error("{0}")]
    Custom(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Error writing netCDF file {}: {cause}", path.display())]
    Netcdf { path: PathBuf, cause: String },
    #[error("Could not move {} into place as {}: {inner}", from.display(), to.display())]
    Rename { from: PathBuf, to: PathBuf, inner: std::io::Error },
    #[error("{0}")]
    Custom(String),
}

/// A source of SnowEx LIDAR products (snow depth, vegetation height and DEMs).
pub trait LidarSource {
    /// Populate `dir` with the raw snow depth products.
    fn download_snow_depth(&self, dir: &Path) -> Result<(), LidarError>;

    /// Populate `dir` with the raw vegetation height products.
    fn download_veg_height(&self, dir: &Path) -> Result<(), LidarError>;

    /// Populate `dir` with the raw DEM products.
    fn download_dem(&self, dir: &Path) -> Result<(), LidarError>;

    /// Combine the products in `dir` for one site into a single time indexed dataset.
    fn make_site_ds(&self, site_code: &str, dir: &Path) -> Result<GriddedDataset, LidarError>;
}

/// The satellite snow depth retrieval.
///
/// `job_name` and `existing_job_name` let an implementation cache its work
/// under `work_dir` and resume from a previous run.
pub trait SnowDepthRetriever {
    fn retrieve_snow_depth(
        &mut self,
        area: Rect<f64>,
        dates: &RetrievalWindow,
        work_dir: &Path,
        job_name: &str,
        existing_job_name: &str,
    ) -> Result<GriddedDataset, RetrievalError>;
}

/// Serializes a merged dataset to disk.
pub trait DatasetWriter {
    fn write(&mut self, ds: &GriddedDataset, path: &Path) -> Result<(), WriteError>;
}
