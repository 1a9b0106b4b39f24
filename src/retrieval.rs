//! Running the Sentinel-1 ("spicy") snow depth retrieval as an external program.
//!
//! The retrieval is called once per site and flight as
//!
//! ```text
//! <program> [extra args...] --bounds MINX MINY MAXX MAXY --start YYYY-MM-DD --end YYYY-MM-DD \
//!     --work-dir DIR --job-name NAME --out DIR/NAME.nc
//! ```
//!
//! and must write a netCDF file readable by [`crate::nc_utils::read_gridded`].
//! A previous result in `DIR/<existing job name>.nc` is reused instead of
//! running the program again.
use std::path::{Path, PathBuf};

use geo::Rect;

use crate::{dates::RetrievalWindow, interface::RetrievalError};

#[derive(Debug, Clone)]
pub struct CommandRetriever {
    program: String,
    extra_args: Vec<String>,
}

impl CommandRetriever {
    /// Create a retriever from a command line; the first element is the program,
    /// the rest are passed before the generated arguments.
    pub fn new(command: &[String]) -> Result<Self, RetrievalError> {
        let (program, extra_args) = command.split_first().ok_or(RetrievalError::NoProgram)?;
        if program.trim().is_empty() {
            return Err(RetrievalError::NoProgram);
        }
        Ok(Self {
            program: program.clone(),
            extra_args: extra_args.to_vec(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Where the result of job `job_name` is stored in `work_dir`.
    pub fn output_path(work_dir: &Path, job_name: &str) -> PathBuf {
        work_dir.join(format!("{job_name}.nc"))
    }

    /// The arguments passed to the program after any configured extra arguments.
    pub fn build_args(
        area: &Rect<f64>,
        dates: &RetrievalWindow,
        work_dir: &Path,
        job_name: &str,
        out_path: &Path,
    ) -> Vec<String> {
        vec![
            "--bounds".to_string(),
            area.min().x.to_string(),
            area.min().y.to_string(),
            area.max().x.to_string(),
            area.max().y.to_string(),
            "--start".to_string(),
            dates.start_str(),
            "--end".to_string(),
            dates.end_str(),
            "--work-dir".to_string(),
            work_dir.display().to_string(),
            "--job-name".to_string(),
            job_name.to_string(),
            "--out".to_string(),
            out_path.display().to_string(),
        ]
    }

    #[cfg(feature = "netcdf")]
    fn read_result(path: &Path) -> Result<crate::grid::GriddedDataset, RetrievalError> {
        crate::nc_utils::read_gridded(path).map_err(|e| RetrievalError::ReadError {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })
    }

    fn run(&self, args: &[String]) -> Result<(), RetrievalError> {
        log::debug!("Running {} {} {}", self.program, self.extra_args.join(" "), args.join(" "));
        let output = std::process::Command::new(&self.program)
            .args(&self.extra_args)
            .args(args)
            .output()
            .map_err(|e| RetrievalError::Spawn {
                program: self.program.clone(),
                inner: e,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for line in stdout.lines() {
            log::debug!("[{}] {line}", self.program);
        }

        if !output.status.success() {
            return Err(RetrievalError::CommandFailed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(feature = "netcdf")]
impl crate::interface::SnowDepthRetriever for CommandRetriever {
    fn retrieve_snow_depth(
        &mut self,
        area: Rect<f64>,
        dates: &RetrievalWindow,
        work_dir: &Path,
        job_name: &str,
        existing_job_name: &str,
    ) -> Result<crate::grid::GriddedDataset, RetrievalError> {
        let existing = Self::output_path(work_dir, existing_job_name);
        if existing.exists() {
            log::info!("Reusing retrieval from {}", existing.display());
            return Self::read_result(&existing);
        }

        std::fs::create_dir_all(work_dir).map_err(|e| RetrievalError::CreateDir {
            path: work_dir.to_path_buf(),
            inner: e,
        })?;

        let out_path = Self::output_path(work_dir, job_name);
        let args = Self::build_args(&area, dates, work_dir, job_name, &out_path);
        log::info!("Running snow depth retrieval {job_name} for {dates}");
        self.run(&args)?;

        if !out_path.exists() {
            return Err(RetrievalError::MissingOutput(out_path));
        }
        Self::read_result(&out_path)
    }
}
