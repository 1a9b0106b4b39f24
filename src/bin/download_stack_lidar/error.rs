#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    #[error("An error occurred while setting up logging")]
    Logging,
    #[error("An error occurred while reading the configuration")]
    ReadingConfig,
    #[error("An error occurred while selecting the sites to process")]
    SelectingSites,
    #[error("An error occurred while setting up the {0}")]
    Setup(&'static str),
    #[error("An error occurred while downloading or stacking the LIDAR data")]
    Running,
    #[error("An error occurred while writing the run summary")]
    WritingSummary,
    #[error("{0}")]
    Custom(&'static str),
}
