//! Configuration for stacking the LIDAR and snow depth retrieval datasets.
//!
//! Every setting has a built-in default, so no configuration file is needed to
//! reproduce the standard run. Settings are layered, with later sources taking
//! precedence:
//!
//! 1. the built-in defaults,
//! 2. an optional TOML file,
//! 3. environment variables prefixed with `SNOWEX_STACK_`. Nested keys are
//!    separated with a double underscore, e.g. `SNOWEX_STACK_OUT_DIR=/tmp/out`.
//!
//! An example TOML file that processes two sites and downloads one product:
//!
//! ```toml
//! out_dir = "/scratch/SnowEx-Data"
//! retrieval_command = ["python", "-m", "spicy_snow.cli"]
//!
//! [[sites]]
//! code = "USCOFR"
//! name = "Frasier"
//!
//! [[sites]]
//! code = "USUTLC"
//! name = "Little_Cottonwood"
//!
//! [[downloads]]
//! site = "USCOFR"
//! date = "2020-02-19"
//! product = "sd"
//! url = "https://example.org/snowex/USCOFR_2020-02-19_sd.nc"
//! ```
//!
//! Note that `sites` replaces the default list entirely rather than adding to it.
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{
    error::SiteError,
    lidar::DownloadEntry,
    sites::{check_unique, default_sites, Site},
};

pub const ENV_PREFIX: &str = "SNOWEX_STACK_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Configuration file {} does not exist", .0.display())]
    FileNotFound(PathBuf),
    #[error("clip_min ({min}) must be less than clip_max ({max})")]
    BadClipRange { min: f32, max: f32 },
    #[error("At least one site must be configured")]
    NoSites,
    #[error(transparent)]
    Site(#[from] SiteError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where LIDAR products are downloaded to and read from.
    pub lidar_dir: PathBuf,

    /// Where the merged per-site, per-flight files are written.
    pub out_dir: PathBuf,

    /// Work directory handed to the snow depth retrieval.
    pub work_dir: PathBuf,

    /// LIDAR values not strictly between `clip_min` and `clip_max` are treated as missing.
    pub clip_min: f32,
    pub clip_max: f32,

    /// Program (and leading arguments) that runs the snow depth retrieval.
    pub retrieval_command: Vec<String>,

    /// Sites to process, in order.
    pub sites: Vec<Site>,

    /// LIDAR products to download.
    #[serde(default)]
    pub downloads: Vec<DownloadEntry>,
}

impl Default for Config {
    fn default() -> Self {
        let scratch = PathBuf::from("/bsuhome/zacharykeskinen/scratch");
        Self {
            lidar_dir: scratch.join("lidar"),
            out_dir: scratch.join("SnowEx-Data"),
            work_dir: scratch.join("data"),
            clip_min: -1000.0,
            clip_max: 1000.0,
            retrieval_command: vec!["spicy-snow-retrieval".to_string()],
            sites: default_sites(),
            downloads: vec![],
        }
    }
}

impl Config {
    fn base_figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Config = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from defaults, an optional TOML file and the environment.
    pub fn load(toml_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Self::base_figment();
        if let Some(path) = toml_file {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        Self::extract(figment)
    }

    /// Load the configuration from defaults overlaid with a TOML string, ignoring the environment.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Self::extract(Self::base_figment().merge(Toml::string(s)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.clip_min.is_nan() || self.clip_max.is_nan() || self.clip_min >= self.clip_max {
            return Err(ConfigError::BadClipRange {
                min: self.clip_min,
                max: self.clip_max,
            });
        }
        if self.sites.is_empty() {
            return Err(ConfigError::NoSites);
        }
        check_unique(&self.sites)?;
        Ok(())
    }

    /// Path of the merged output for one site name and flight.
    pub fn output_path(&self, site_name: &str, flight: chrono::NaiveDate) -> PathBuf {
        self.out_dir.join(crate::dates::output_file_name(site_name, flight))
    }
}
