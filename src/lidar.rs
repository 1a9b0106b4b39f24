//! Downloading and stacking the SnowEx LIDAR products.
//!
//! Products are cached in a single directory as `{site}_{YYYY-MM-DD}_{product}.nc`,
//! where `product` is one of `sd` (snow depth), `vh` (vegetation height) or
//! `dem`. Each file holds one raster as a 2-D `band(y, x)` variable with `x`
//! and `y` coordinates and a `crs` global attribute.
use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
};

use chrono::NaiveDate;
use itertools::Itertools;
use log::{debug, info};
use ndarray::{Axis, Ix2};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    dates::{format_date, parse_date},
    grid::{DataVar, GriddedDataset, TIME_DIM, X_DIM, Y_DIM},
    interface::LidarError,
};

/// Name of the raster variable in a single product file.
pub const BAND_VAR: &str = "band";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Product {
    Sd,
    Vh,
    Dem,
}

impl Product {
    /// Name of the variable this product becomes in the site dataset.
    pub fn variable_name(&self) -> &'static str {
        match self {
            Product::Sd => "lidar-sd",
            Product::Vh => "lidar-vh",
            Product::Dem => "lidar-dem",
        }
    }

    pub fn long_name(&self) -> &'static str {
        match self {
            Product::Sd => "LIDAR snow depth",
            Product::Vh => "LIDAR vegetation height",
            Product::Dem => "LIDAR digital elevation model",
        }
    }
}

/// One file to fetch into the LIDAR cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadEntry {
    pub site: String,
    pub date: NaiveDate,
    pub product: Product,
    pub url: String,
}

impl DownloadEntry {
    pub fn file_name(&self) -> String {
        cached_file_name(&self.site, self.date, self.product)
    }
}

pub fn cached_file_name(site_code: &str, date: NaiveDate, product: Product) -> String {
    format!("{site_code}_{}_{product}.nc", format_date(date))
}

/// A product file found in the LIDAR cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedProduct {
    pub path: PathBuf,
    pub site: String,
    pub date: NaiveDate,
    pub product: Product,
}

fn cached_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?<site>[A-Za-z0-9]+)_(?<date>\d{4}-\d{2}-\d{2})_(?<product>sd|vh|dem)\.nc$")
            .expect("cached product regex should be valid")
    })
}

/// Interpret a path as a cached product file, returning `None` if its name doesn't match.
pub fn parse_cached_file_name(path: &Path) -> Option<CachedProduct> {
    let name = path.file_name()?.to_str()?;
    let caps = cached_name_regex().captures(name)?;
    let date = parse_date(&caps["date"]).ok()?;
    let product = caps["product"].parse().ok()?;
    Some(CachedProduct {
        path: path.to_path_buf(),
        site: caps["site"].to_string(),
        date,
        product,
    })
}

/// Find every cached product for one site, ordered by date then product.
pub fn discover_site_products(dir: &Path, site_code: &str) -> Result<Vec<CachedProduct>, LidarError> {
    let pattern = format!("{}/{site_code}_*.nc", glob::Pattern::escape(&dir.display().to_string()));
    let matches = glob::glob(&pattern).map_err(|e| LidarError::Glob(e.to_string()))?;

    let mut products = vec![];
    for entry in matches {
        let entry = entry.map_err(|e| LidarError::Glob(e.to_string()))?;
        match parse_cached_file_name(&entry) {
            Some(p) if p.site == site_code => products.push(p),
            _ => debug!("Ignoring {} in the LIDAR directory", entry.display()),
        }
    }

    products.sort_by_key(|p| (p.date, p.product));
    Ok(products)
}

/// Combine single-raster datasets for one site into the site dataset.
///
/// Snow depth rasters are stacked along a `time` dimension in date order as
/// `lidar-sd(time, y, x)`. Vegetation height and DEM are time invariant, so
/// the most recent of each becomes `lidar-vh(y, x)` and `lidar-dem(y, x)`.
/// Every raster must be on the same grid.
pub fn stack_site_products(
    site_code: &str,
    rasters: Vec<(CachedProduct, GriddedDataset)>,
) -> Result<GriddedDataset, LidarError> {
    let (snow_depths, others): (Vec<_>, Vec<_>) = rasters
        .into_iter()
        .sorted_by_key(|(p, _)| (p.date, p.product))
        .partition(|(p, _)| p.product == Product::Sd);

    let (_, reference) = snow_depths
        .first()
        .ok_or_else(|| LidarError::NoSnowDepth(site_code.to_string()))?;
    for (product, raster) in snow_depths.iter().chain(others.iter()) {
        if !reference.same_grid(raster) {
            return Err(LidarError::GridMismatch(product.path.clone()));
        }
    }

    let times = snow_depths.iter().map(|(p, _)| p.date).collect_vec();
    let bands = snow_depths
        .iter()
        .map(|(p, raster)| band_view(p, raster))
        .collect::<Result<Vec<_>, _>>()?;
    let stacked = ndarray::stack(Axis(0), &bands).map_err(|e| LidarError::ReadError {
        path: snow_depths[0].0.path.clone(),
        cause: e.to_string(),
    })?;

    let mut ds = GriddedDataset::new(reference.x().clone(), reference.y().clone(), reference.crs())
        .with_times(times);
    ds.add_var(
        Product::Sd.variable_name(),
        DataVar::new(&[TIME_DIM, Y_DIM, X_DIM], stacked.into_dyn())
            .with_attr("long_name", Product::Sd.long_name())
            .with_attr("units", "m"),
    )?;

    for product in [Product::Vh, Product::Dem] {
        let latest = others
            .iter()
            .filter(|(p, _)| p.product == product)
            .max_by_key(|(p, _)| p.date);
        if let Some((cached, raster)) = latest {
            let band = band_view(cached, raster)?.to_owned();
            ds.add_var(
                product.variable_name(),
                DataVar::new(&[Y_DIM, X_DIM], band.into_dyn())
                    .with_attr("long_name", product.long_name())
                    .with_attr("units", "m")
                    .with_attr("lidar_date", format_date(cached.date)),
            )?;
        } else {
            info!("No {product} product found for {site_code}");
        }
    }

    Ok(ds)
}

fn band_view<'a>(
    product: &CachedProduct,
    raster: &'a GriddedDataset,
) -> Result<ndarray::ArrayView2<'a, f32>, LidarError> {
    let read_error = |cause: String| LidarError::ReadError { path: product.path.clone(), cause };
    raster
        .var(BAND_VAR)
        .ok_or_else(|| read_error(format!("no '{BAND_VAR}' variable")))?
        .data
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| read_error(e.to_string()))
}

/// The SnowEx LIDAR products, fetched over HTTP from a list of URLs.
pub struct SnowExLidarArchive {
    manifest: Vec<DownloadEntry>,
    client: reqwest::blocking::Client,
}

impl std::fmt::Debug for SnowExLidarArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnowExLidarArchive")
            .field("manifest", &self.manifest.len())
            .finish()
    }
}

impl SnowExLidarArchive {
    pub fn new(manifest: Vec<DownloadEntry>) -> Result<Self, LidarError> {
        // Some of the products are large, so don't cap the request time.
        let client = reqwest::blocking::Client::builder()
            .timeout(None::<std::time::Duration>)
            .user_agent(concat!("snowex-stack/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(manifest, client))
    }

    /// Use an already configured HTTP client, e.g. one with a proxy or timeout.
    pub fn with_client(manifest: Vec<DownloadEntry>, client: reqwest::blocking::Client) -> Self {
        Self { manifest, client }
    }

    pub fn manifest(&self) -> &[DownloadEntry] {
        &self.manifest
    }

    /// Download every manifest entry for `product` not already in `dir`.
    /// Returns the number of files downloaded.
    pub fn download_product(&self, dir: &Path, product: Product) -> Result<usize, LidarError> {
        std::fs::create_dir_all(dir).map_err(|e| LidarError::CreateDir {
            path: dir.to_path_buf(),
            inner: e,
        })?;

        let mut n_downloaded = 0;
        for entry in self.manifest.iter().filter(|e| e.product == product) {
            let out_path = dir.join(entry.file_name());
            if out_path.exists() {
                debug!("{} already downloaded", out_path.display());
                continue;
            }

            info!("Downloading {} to {}", entry.url, out_path.display());
            self.download_to(&entry.url, &out_path)?;
            n_downloaded += 1;
        }

        info!("Downloaded {n_downloaded} {product} file(s) into {}", dir.display());
        Ok(n_downloaded)
    }

    fn download_to(&self, url: &str, out_path: &Path) -> Result<(), LidarError> {
        let response = self.client.get(url).send()?;
        if !response.status().is_success() {
            return Err(LidarError::DownloadFailed {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let content = response.bytes()?;

        // Write next to the final file then rename so an interrupted download
        // is never mistaken for a cached product.
        let partial = out_path.with_extension("nc.part");
        std::fs::write(&partial, &content).map_err(|e| LidarError::SaveDownload {
            path: partial.clone(),
            inner: e,
        })?;
        std::fs::rename(&partial, out_path).map_err(|e| LidarError::SaveDownload {
            path: out_path.to_path_buf(),
            inner: e,
        })
    }
}

#[cfg(feature = "netcdf")]
impl crate::interface::LidarSource for SnowExLidarArchive {
    fn download_snow_depth(&self, dir: &Path) -> Result<(), LidarError> {
        self.download_product(dir, Product::Sd).map(|_| ())
    }

    fn download_veg_height(&self, dir: &Path) -> Result<(), LidarError> {
        self.download_product(dir, Product::Vh).map(|_| ())
    }

    fn download_dem(&self, dir: &Path) -> Result<(), LidarError> {
        self.download_product(dir, Product::Dem).map(|_| ())
    }

    fn make_site_ds(&self, site_code: &str, dir: &Path) -> Result<GriddedDataset, LidarError> {
        let products = discover_site_products(dir, site_code)?;
        info!("Found {} LIDAR product file(s) for {site_code}", products.len());

        let mut rasters = vec![];
        for product in products {
            let raster = crate::nc_utils::read_band_file(&product.path).map_err(|e| {
                LidarError::ReadError {
                    path: product.path.clone(),
                    cause: e.to_string(),
                }
            })?;
            rasters.push((product, raster));
        }

        stack_site_products(site_code, rasters)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, Array2};

    use super::*;
    use crate::test_utils::scratch_dir;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn raster(value: f32, crs: &str) -> GriddedDataset {
        let mut ds = GriddedDataset::new(arr1(&[0.5, 1.5]), arr1(&[1.5, 0.5]), crs);
        ds.add_var(
            BAND_VAR,
            DataVar::new(&[Y_DIM, X_DIM], Array2::from_elem((2, 2), value).into_dyn()),
        )
        .unwrap();
        ds
    }

    fn cached(site: &str, date: NaiveDate, product: Product) -> CachedProduct {
        let path = PathBuf::from(cached_file_name(site, date, product));
        parse_cached_file_name(&path).unwrap()
    }

    #[test]
    fn test_parse_file_name() {
        let p = parse_cached_file_name(Path::new("/lidar/USIDBS_2020-02-18_vh.nc")).unwrap();
        assert_eq!(p.site, "USIDBS");
        assert_eq!(p.date, ymd(2020, 2, 18));
        assert_eq!(p.product, Product::Vh);

        assert!(parse_cached_file_name(Path::new("USIDBS_2020-02-18_sd.tif")).is_none());
        assert!(parse_cached_file_name(Path::new("USIDBS_20200218_sd.nc")).is_none());
        assert!(parse_cached_file_name(Path::new("USIDBS_2020-02-18_swe.nc")).is_none());
    }

    #[test]
    fn test_file_name_matches_parser() {
        let entry = DownloadEntry {
            site: "USCOCP".to_string(),
            date: ymd(2021, 3, 4),
            product: Product::Dem,
            url: "https://example.org/dem.nc".to_string(),
        };
        assert_eq!(entry.file_name(), "USCOCP_2021-03-04_dem.nc");
        let parsed = parse_cached_file_name(Path::new(&entry.file_name())).unwrap();
        assert_eq!(parsed.product, Product::Dem);
    }

    #[test]
    fn test_stack() {
        let rasters = vec![
            (cached("USIDBS", ymd(2021, 3, 15), Product::Sd), raster(1.5, "EPSG:32611")),
            (cached("USIDBS", ymd(2020, 2, 18), Product::Sd), raster(1.0, "EPSG:32611")),
            (cached("USIDBS", ymd(2020, 9, 1), Product::Dem), raster(2000.0, "EPSG:32611")),
            (cached("USIDBS", ymd(2021, 9, 1), Product::Dem), raster(2001.0, "EPSG:32611")),
        ];
        let ds = stack_site_products("USIDBS", rasters).unwrap();

        assert_eq!(ds.times().unwrap(), &[ymd(2020, 2, 18), ymd(2021, 3, 15)]);
        let sd = ds.var("lidar-sd").unwrap();
        assert_eq!(sd.data.shape(), &[2, 2, 2]);
        assert_eq!(sd.data[[0, 0, 0]], 1.0);
        assert_eq!(sd.data[[1, 1, 1]], 1.5);

        let dem = ds.var("lidar-dem").unwrap();
        assert_eq!(dem.data[[0, 1]], 2001.0);
        assert!(ds.var("lidar-vh").is_none());
    }

    #[test]
    fn test_stack_requires_snow_depth() {
        let rasters = vec![(cached("USIDMC", ymd(2020, 9, 1), Product::Dem), raster(1.0, "EPSG:32611"))];
        let res = stack_site_products("USIDMC", rasters);
        assert!(matches!(res, Err(LidarError::NoSnowDepth(s)) if s == "USIDMC"));
    }

    #[test]
    fn test_stack_grid_mismatch() {
        let rasters = vec![
            (cached("USIDMC", ymd(2020, 2, 1), Product::Sd), raster(1.0, "EPSG:32611")),
            (cached("USIDMC", ymd(2020, 3, 1), Product::Sd), raster(1.0, "EPSG:32612")),
        ];
        let res = stack_site_products("USIDMC", rasters);
        assert!(matches!(res, Err(LidarError::GridMismatch(p)) if p.ends_with("USIDMC_2020-03-01_sd.nc")));
    }

    /// Serve one canned HTTP response per connection, in order, on a local port.
    /// The thread returns the request lines it received.
    fn serve(responses: Vec<(u16, &'static [u8])>) -> (String, std::thread::JoinHandle<Vec<String>>) {
        use std::io::{BufRead, BufReader, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let mut requests = vec![];
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                requests.push(line.trim().to_string());
                // Drain the headers
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    if header.trim().is_empty() {
                        break;
                    }
                }
                write!(
                    stream,
                    "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                )
                .unwrap();
                stream.write_all(body).unwrap();
            }
            requests
        });
        (base_url, handle)
    }

    #[test]
    fn test_download_product() {
        let (base_url, server) = serve(vec![(200, b"snow depth bytes"), (404, b"not found")]);
        let manifest = vec![
            DownloadEntry {
                site: "USIDBS".to_string(),
                date: ymd(2020, 2, 18),
                product: Product::Sd,
                url: format!("{base_url}/banner/sd.nc"),
            },
            DownloadEntry {
                site: "USIDBS".to_string(),
                date: ymd(2020, 2, 18),
                product: Product::Vh,
                url: format!("{base_url}/banner/vh.nc"),
            },
        ];
        let client = reqwest::blocking::Client::builder().no_proxy().build().unwrap();
        let archive = SnowExLidarArchive::with_client(manifest, client);
        let dir = scratch_dir("download");

        assert_eq!(archive.download_product(&dir, Product::Sd).unwrap(), 1);
        let saved = dir.join("USIDBS_2020-02-18_sd.nc");
        assert_eq!(std::fs::read(&saved).unwrap(), b"snow depth bytes");
        assert!(!saved.with_extension("nc.part").exists());

        // Already cached, so no request is made
        assert_eq!(archive.download_product(&dir, Product::Sd).unwrap(), 0);

        let res = archive.download_product(&dir, Product::Vh);
        assert!(matches!(res, Err(LidarError::DownloadFailed { status: 404, .. })));
        assert!(!dir.join("USIDBS_2020-02-18_vh.nc").exists());
        assert!(!dir.join("USIDBS_2020-02-18_vh.nc.part").exists());

        let requests = server.join().unwrap();
        assert_eq!(requests, ["GET /banner/sd.nc HTTP/1.1", "GET /banner/vh.nc HTTP/1.1"]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[cfg(feature = "netcdf")]
    fn write_band_file(path: &Path, values: &[f32], fill: f32) {
        use netcdf::Extents;

        let mut file = netcdf::create(path).unwrap();
        file.add_dimension(Y_DIM, 2).unwrap();
        file.add_dimension(X_DIM, 3).unwrap();
        let mut x = file.add_variable::<f64>(X_DIM, &[X_DIM]).unwrap();
        x.put(arr1(&[0.5, 1.5, 2.5]).view(), Extents::All).unwrap();
        let mut y = file.add_variable::<f64>(Y_DIM, &[Y_DIM]).unwrap();
        y.put(arr1(&[1.5, 0.5]).view(), Extents::All).unwrap();
        let mut band = file.add_variable::<f32>(BAND_VAR, &[Y_DIM, X_DIM]).unwrap();
        band.set_fill_value(fill).unwrap();
        let data = Array2::from_shape_vec((2, 3), values.to_vec()).unwrap();
        band.put(data.view(), Extents::All).unwrap();
        file.add_attribute("crs", "EPSG:32613").unwrap();
    }

    #[cfg(feature = "netcdf")]
    #[test]
    fn test_make_site_ds_from_files() {
        use crate::interface::LidarSource;

        let dir = scratch_dir("site-ds");
        write_band_file(&dir.join("USCOCP_2021-03-19_sd.nc"), &[0.5, 0.6, -9999.0, 0.8, 0.9, 1.0], -9999.0);
        write_band_file(&dir.join("USCOCP_2021-02-03_sd.nc"), &[0.1, 0.2, 0.3, -9999.0, 0.5, 0.6], -9999.0);
        write_band_file(&dir.join("USCOCP_2021-09-01_dem.nc"), &[3000.0; 6], -9999.0);
        write_band_file(&dir.join("USCOFR_2021-02-03_sd.nc"), &[7.0; 6], -9999.0);

        let archive = SnowExLidarArchive::new(vec![]).unwrap();
        let ds = archive.make_site_ds("USCOCP", &dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(ds.crs(), "EPSG:32613");
        assert_eq!(ds.times().unwrap(), &[ymd(2021, 2, 3), ymd(2021, 3, 19)]);
        let sd = &ds.var("lidar-sd").unwrap().data;
        assert_eq!(sd.shape(), &[2, 2, 3]);
        assert_eq!(sd[[0, 0, 0]], 0.1);
        assert!(sd[[0, 1, 0]].is_nan());
        assert!(sd[[1, 0, 2]].is_nan());
        assert_eq!(sd[[1, 1, 2]], 1.0);

        let dem = ds.var("lidar-dem").unwrap();
        assert_eq!(dem.data.shape(), &[2, 3]);
        assert!(dem.data.iter().all(|&v| v == 3000.0));
        assert!(ds.var("lidar-vh").is_none());
    }

    #[test]
    fn test_discover() {
        // Brackets in the directory name must not be read as a glob character class
        let dir = scratch_dir("discover[sd]");
        for name in [
            "USIDBS_2020-03-01_sd.nc",
            "USIDBS_2020-02-01_sd.nc",
            "USIDBS_2020-02-01_dem.nc",
            "USIDBSX_2020-02-01_sd.nc",
            "USIDBS_notes.nc",
            "USCOCP_2020-02-01_sd.nc",
        ] {
            std::fs::write(dir.join(name), b"").unwrap();
        }

        let found = discover_site_products(&dir, "USIDBS").unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.path.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(
            names,
            ["USIDBS_2020-02-01_sd.nc", "USIDBS_2020-02-01_dem.nc", "USIDBS_2020-03-01_sd.nc"]
        );
    }
}
