pub mod error;
pub mod dates;
pub mod sites;
pub mod grid;
pub mod interface;
pub mod lidar;
pub mod retrieval;
pub mod config;
pub mod pipeline;
pub mod logging;
#[cfg(feature = "netcdf")]
pub mod nc_utils;

#[cfg(test)]
mod test_utils;
