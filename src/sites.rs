//! The SnowEx field sites flown by the LIDAR campaigns.
use std::{collections::HashSet, fmt::Display};

use serde::{Deserialize, Serialize};

use crate::error::SiteError;

/// Site codes and their human readable names, in processing order.
pub static DEFAULT_SITES: &[(&str, &str)] = &[
    ("USCOCP", "Cameron"),
    ("USCOFR", "Frasier"),
    ("USIDBS", "Banner"),
    ("USIDDC", "Dry_Creek"),
    ("USIDMC", "Mores"),
    ("USUTLC", "Little_Cottonwood"),
];

/// A field site, identified by its short code (e.g. `USIDBS`). The name
/// (e.g. `Banner`) is what appears in output file names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub code: String,
    pub name: String,
}

impl Site {
    pub fn new<C: ToString, N: ToString>(code: C, name: N) -> Self {
        Self { code: code.to_string(), name: name.to_string() }
    }
}

impl Display for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.code)
    }
}

pub fn default_sites() -> Vec<Site> {
    DEFAULT_SITES
        .iter()
        .map(|(code, name)| Site::new(code, name))
        .collect()
}

/// Check that no site code is listed twice.
pub fn check_unique(sites: &[Site]) -> Result<(), SiteError> {
    let mut seen = HashSet::new();
    for site in sites {
        if !seen.insert(site.code.as_str()) {
            return Err(SiteError::DuplicateSite(site.code.clone()));
        }
    }
    Ok(())
}

/// Restrict `sites` to those whose codes are in `codes`, keeping the order of `sites`.
/// An empty `codes` keeps every site. Codes are matched case-insensitively.
pub fn select_sites(sites: &[Site], codes: &[String]) -> Result<Vec<Site>, SiteError> {
    if codes.is_empty() {
        return Ok(sites.to_vec());
    }

    for code in codes {
        if !sites.iter().any(|s| s.code.eq_ignore_ascii_case(code)) {
            return Err(SiteError::UnknownSite(code.clone()));
        }
    }

    Ok(sites
        .iter()
        .filter(|s| codes.iter().any(|c| s.code.eq_ignore_ascii_case(c)))
        .cloned()
        .collect())
}
