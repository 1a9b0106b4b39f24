//! Helper functions to set up consistent progress bars
use std::fmt::Display;

use indicatif::{ProgressBar, ProgressStyle};

/// Create the bar that counts flights. Logging and the bar both go to stderr,
/// so the bar is hidden unless logging is limited to warnings and errors.
pub(crate) fn flight_pb(show: bool) -> ProgressBar {
    if show {
        ProgressBar::new(0)
    } else {
        ProgressBar::hidden()
    }
}

/// Reset `pb` for a new site. The number of flights is not known until the
/// site's LIDAR data is read, so the bar only counts up.
pub(crate) fn setup_site_pb<D: Display>(pb: &ProgressBar, site: D) {
    pb.reset();
    let style = ProgressStyle::with_template("{prefix} {spinner} [{human_pos} flights] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_prefix(format!("Processing {site}"));
    pb.set_message("");
    pb.tick(); // force a redraw
}
