//! In-memory gridded datasets and the handful of raster operations needed to
//! line LIDAR products up with a snow depth retrieval.
//!
//! A [`GriddedDataset`] holds regularly spaced `x` and `y` cell centre coordinates
//! in a projected CRS, an optional `time` coordinate, and any number of `f32`
//! data variables. Variables must be laid out as `(y, x)` or `(time, y, x)`.
use std::{collections::HashSet, fmt::Display};

use chrono::NaiveDate;
use geo::Rect;
use indexmap::IndexMap;
use itertools::{Itertools, MinMaxResult};
use ndarray::{Array1, ArrayD, Axis, Dimension, IxDyn};
use num_traits::Float;

pub const TIME_DIM: &str = "time";
pub const Y_DIM: &str = "y";
pub const X_DIM: &str = "x";

/// Absolute tolerance when comparing coordinate values, in CRS units.
const COORD_TOLERANCE: f64 = 1e-6;

#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("Variable '{name}' has dimensions {dims:?}; only (y, x) and (time, y, x) are supported")]
    UnsupportedDims { name: String, dims: Vec<String> },
    #[error("Variable '{name}' uses the time dimension, but the dataset has no time coordinate")]
    NoTimeCoordinate { name: String },
    #[error("Variable '{name}' has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch { name: String, expected: Vec<usize>, actual: Vec<usize> },
    #[error("Time {0} is not in the dataset")]
    TimeNotFound(NaiveDate),
    #[error("Cannot compute bounds of a dataset with an empty {0} coordinate")]
    EmptyAxis(&'static str),
    #[error("CRS mismatch: dataset is in '{have}' but the target grid is in '{want}'")]
    CrsMismatch { have: String, want: String },
    #[error("Cannot merge datasets: {0} coordinates differ")]
    CoordinateMismatch(&'static str),
    #[error("Cannot merge datasets: variable '{0}' is present in more than one with different values")]
    ConflictingVariable(String),
    #[error("Cannot merge an empty list of datasets")]
    NothingToMerge,
}

/// A global or variable attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl Display for AttrValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttrValue::Str(s) => write!(f, "{s}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

pub type Attributes = IndexMap<String, AttrValue>;

/// One data variable: its dimension names, values and attributes.
#[derive(Debug, Clone)]
pub struct DataVar {
    pub dims: Vec<String>,
    pub data: ArrayD<f32>,
    pub attrs: Attributes,
}

impl DataVar {
    pub fn new(dims: &[&str], data: ArrayD<f32>) -> Self {
        Self {
            dims: dims.iter().map(|d| d.to_string()).collect(),
            data,
            attrs: Attributes::new(),
        }
    }

    pub fn with_attr<K: ToString, V: Into<AttrValue>>(mut self, key: K, value: V) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn has_time(&self) -> bool {
        self.dims.first().is_some_and(|d| d == TIME_DIM)
    }

    /// True if both variables have the same dimensions and values, treating NaNs as equal.
    fn same_values(&self, other: &DataVar) -> bool {
        self.dims == other.dims
            && self.data.shape() == other.data.shape()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a == b || (a.is_nan() && b.is_nan()))
    }
}

#[derive(Debug, Clone)]
pub struct GriddedDataset {
    x: Array1<f64>,
    y: Array1<f64>,
    crs: String,
    time: Option<Vec<NaiveDate>>,
    vars: IndexMap<String, DataVar>,
    attrs: Attributes,
}

impl GriddedDataset {
    pub fn new<S: ToString>(x: Array1<f64>, y: Array1<f64>, crs: S) -> Self {
        Self {
            x,
            y,
            crs: crs.to_string(),
            time: None,
            vars: IndexMap::new(),
            attrs: Attributes::new(),
        }
    }

    pub fn with_times(mut self, times: Vec<NaiveDate>) -> Self {
        self.time = Some(times);
        self
    }

    pub fn x(&self) -> &Array1<f64> {
        &self.x
    }

    pub fn y(&self) -> &Array1<f64> {
        &self.y
    }

    pub fn crs(&self) -> &str {
        &self.crs
    }

    /// The time coordinate, if this dataset has one.
    pub fn times(&self) -> Option<&[NaiveDate]> {
        self.time.as_deref()
    }

    pub fn vars(&self) -> &IndexMap<String, DataVar> {
        &self.vars
    }

    pub fn var(&self, name: &str) -> Option<&DataVar> {
        self.vars.get(name)
    }

    pub fn attrs(&self) -> &Attributes {
        &self.attrs
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key)
    }

    pub fn set_attr<K: ToString, V: Into<AttrValue>>(&mut self, key: K, value: V) {
        self.attrs.insert(key.to_string(), value.into());
    }

    /// Add (or replace) a data variable, checking that its dimensions and shape
    /// agree with this dataset's coordinates.
    pub fn add_var<S: ToString>(&mut self, name: S, var: DataVar) -> Result<(), GridError> {
        let name = name.to_string();
        let spatial = [Y_DIM, X_DIM];
        let expected = if var.dims == spatial {
            vec![self.y.len(), self.x.len()]
        } else if var.dims == [TIME_DIM, Y_DIM, X_DIM] {
            let nt = self
                .time
                .as_ref()
                .ok_or_else(|| GridError::NoTimeCoordinate { name: name.clone() })?
                .len();
            vec![nt, self.y.len(), self.x.len()]
        } else {
            return Err(GridError::UnsupportedDims { name, dims: var.dims });
        };

        if var.data.shape() != expected.as_slice() {
            return Err(GridError::ShapeMismatch {
                name,
                expected,
                actual: var.data.shape().to_vec(),
            });
        }

        self.vars.insert(name, var);
        Ok(())
    }

    /// True if `other` has the same CRS and `x`/`y` coordinates.
    pub fn same_grid(&self, other: &GriddedDataset) -> bool {
        same_crs(&self.crs, &other.crs) && same_coords(&self.x, &other.x) && same_coords(&self.y, &other.y)
    }

    /// The outer edges of the grid, i.e. the cell centres extended by half a cell.
    pub fn bounds(&self) -> Result<Rect<f64>, GridError> {
        let (xmin, xmax) = axis_edges(&self.x).ok_or(GridError::EmptyAxis(X_DIM))?;
        let (ymin, ymax) = axis_edges(&self.y).ok_or(GridError::EmptyAxis(Y_DIM))?;
        Ok(Rect::new((xmin, ymin), (xmax, ymax)))
    }

    /// Replace every value not strictly between `lo` and `hi` with NaN.
    pub fn clip_open_range(mut self, lo: f32, hi: f32) -> Self {
        for var in self.vars.values_mut() {
            var.data.mapv_inplace(|v| mask_outside(v, lo, hi));
        }
        self
    }

    /// Take the slice at one time. Variables without a time dimension are kept
    /// as they are; the result has no time coordinate.
    pub fn select_time(&self, date: NaiveDate) -> Result<Self, GridError> {
        let itime = self
            .times()
            .and_then(|times| times.iter().position(|&t| t == date))
            .ok_or(GridError::TimeNotFound(date))?;

        let vars = self
            .vars
            .iter()
            .map(|(name, var)| {
                let new_var = if var.has_time() {
                    DataVar {
                        dims: var.dims[1..].to_vec(),
                        data: var.data.index_axis(Axis(0), itime).to_owned(),
                        attrs: var.attrs.clone(),
                    }
                } else {
                    var.clone()
                };
                (name.clone(), new_var)
            })
            .collect();

        Ok(Self {
            x: self.x.clone(),
            y: self.y.clone(),
            crs: self.crs.clone(),
            time: None,
            vars,
            attrs: self.attrs.clone(),
        })
    }

    /// Resample onto the `x`/`y` grid of `target` by nearest neighbour.
    ///
    /// Both datasets must share a CRS. Target cells more than half a source cell
    /// outside the source grid are filled with NaN. The result keeps this
    /// dataset's variables, attributes and time coordinate.
    pub fn reproject_match(&self, target: &GriddedDataset) -> Result<Self, GridError> {
        if !same_crs(&self.crs, &target.crs) {
            return Err(GridError::CrsMismatch {
                have: self.crs.clone(),
                want: target.crs.clone(),
            });
        }

        let ix = nearest_indices(&self.x, &target.x);
        let iy = nearest_indices(&self.y, &target.y);
        log::debug!(
            "Resampling {}x{} grid onto {}x{} grid ({} columns and {} rows outside the source)",
            self.y.len(),
            self.x.len(),
            target.y.len(),
            target.x.len(),
            ix.iter().filter(|i| i.is_none()).count(),
            iy.iter().filter(|i| i.is_none()).count(),
        );

        let vars = self
            .vars
            .iter()
            .map(|(name, var)| {
                let new_var = DataVar {
                    dims: var.dims.clone(),
                    data: resample_nearest(&var.data, &iy, &ix),
                    attrs: var.attrs.clone(),
                };
                (name.clone(), new_var)
            })
            .collect();

        Ok(Self {
            x: target.x.clone(),
            y: target.y.clone(),
            crs: target.crs.clone(),
            time: self.time.clone(),
            vars,
            attrs: self.attrs.clone(),
        })
    }

    /// Merge datasets on identical grids.
    ///
    /// Variables are combined; a variable in more than one dataset must have the
    /// same values everywhere. Global attributes present in more than one dataset
    /// with different values are dropped from the result.
    pub fn merge_drop_conflicts(datasets: &[&GriddedDataset]) -> Result<Self, GridError> {
        let (first, rest) = datasets.split_first().ok_or(GridError::NothingToMerge)?;
        let mut merged = (*first).clone();
        let mut dropped_attrs = HashSet::new();

        for ds in rest {
            if !same_crs(&merged.crs, &ds.crs) {
                return Err(GridError::CrsMismatch {
                    have: ds.crs.clone(),
                    want: merged.crs.clone(),
                });
            }
            if !same_coords(&merged.x, &ds.x) {
                return Err(GridError::CoordinateMismatch(X_DIM));
            }
            if !same_coords(&merged.y, &ds.y) {
                return Err(GridError::CoordinateMismatch(Y_DIM));
            }
            if let Some(times) = &ds.time {
                if merged.time.is_none() {
                    merged.time = Some(times.clone());
                } else if merged.time.as_ref() != Some(times) {
                    return Err(GridError::CoordinateMismatch(TIME_DIM));
                }
            }

            for (name, var) in ds.vars.iter() {
                match merged.vars.get(name) {
                    Some(existing) if !existing.same_values(var) => {
                        return Err(GridError::ConflictingVariable(name.clone()))
                    }
                    Some(_) => {}
                    None => {
                        merged.vars.insert(name.clone(), var.clone());
                    }
                }
            }

            for (key, value) in ds.attrs.iter() {
                if dropped_attrs.contains(key) {
                    continue;
                }
                match merged.attrs.get(key) {
                    Some(existing) if existing != value => {
                        log::debug!("Dropping conflicting attribute '{key}' ('{existing}' vs. '{value}')");
                        merged.attrs.shift_remove(key);
                        dropped_attrs.insert(key.clone());
                    }
                    Some(_) => {}
                    None => {
                        merged.attrs.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        Ok(merged)
    }
}

fn mask_outside<F: Float>(v: F, lo: F, hi: F) -> F {
    if lo < v && v < hi {
        v
    } else {
        F::nan()
    }
}

fn same_crs(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn same_coords(a: &Array1<f64>, b: &Array1<f64>) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(&p, &q)| approx::abs_diff_eq!(p, q, epsilon = COORD_TOLERANCE))
}

fn axis_spacing(coords: &Array1<f64>) -> f64 {
    if coords.len() < 2 {
        0.0
    } else {
        (coords[1] - coords[0]).abs()
    }
}

fn axis_edges(coords: &Array1<f64>) -> Option<(f64, f64)> {
    let (lo, hi) = match coords.iter().minmax() {
        MinMaxResult::NoElements => return None,
        MinMaxResult::OneElement(&v) => (v, v),
        MinMaxResult::MinMax(&a, &b) => (a, b),
    };
    let half = axis_spacing(coords) / 2.0;
    Some((lo - half, hi + half))
}

/// For each destination coordinate, the index of the closest source coordinate,
/// or `None` if it lies more than half a source cell away.
fn nearest_indices(src: &Array1<f64>, dst: &Array1<f64>) -> Vec<Option<usize>> {
    let tolerance = axis_spacing(src) / 2.0 + COORD_TOLERANCE;
    dst.iter()
        .map(|&d| {
            src.iter()
                .enumerate()
                .map(|(i, &s)| (i, (s - d).abs()))
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .filter(|&(_, dist)| dist <= tolerance)
                .map(|(i, _)| i)
        })
        .collect()
}

/// Resample the last two axes of `data` using precomputed row and column indices.
fn resample_nearest(data: &ArrayD<f32>, iy: &[Option<usize>], ix: &[Option<usize>]) -> ArrayD<f32> {
    let ndim = data.ndim();
    let mut out_shape = data.shape().to_vec();
    out_shape[ndim - 2] = iy.len();
    out_shape[ndim - 1] = ix.len();

    let mut out = ArrayD::from_elem(IxDyn(&out_shape), f32::NAN);
    let mut src_index = vec![0; ndim];
    for (index, value) in out.indexed_iter_mut() {
        let index = index.slice();
        if let (Some(j), Some(i)) = (iy[index[ndim - 2]], ix[index[ndim - 1]]) {
            src_index.copy_from_slice(index);
            src_index[ndim - 2] = j;
            src_index[ndim - 1] = i;
            *value = data[src_index.as_slice()];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, Array2, Array3};

    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// 3 rows x 4 columns of 1 m cells, y decreasing as in a north-up raster.
    fn lidar_like() -> GriddedDataset {
        let x = arr1(&[100.5, 101.5, 102.5, 103.5]);
        let y = arr1(&[52.5, 51.5, 50.5]);
        let times = vec![ymd(2020, 2, 1), ymd(2020, 3, 1)];
        let mut ds = GriddedDataset::new(x, y, "EPSG:32611").with_times(times);

        let sd = Array3::from_shape_fn((2, 3, 4), |(t, j, i)| (t * 100 + j * 10 + i) as f32);
        ds.add_var("lidar-sd", DataVar::new(&[TIME_DIM, Y_DIM, X_DIM], sd.into_dyn()))
            .unwrap();
        let dem = Array2::from_elem((3, 4), 2500.0_f32);
        ds.add_var(
            "lidar-dem",
            DataVar::new(&[Y_DIM, X_DIM], dem.into_dyn()).with_attr("units", "m"),
        )
        .unwrap();
        ds.set_attr("source", "lidar");
        ds
    }

    #[test]
    fn test_add_var_checks_shape() {
        let mut ds = lidar_like();
        let bad = Array2::<f32>::zeros((4, 3)).into_dyn();
        let res = ds.add_var("bad", DataVar::new(&[Y_DIM, X_DIM], bad));
        assert!(matches!(res, Err(GridError::ShapeMismatch { .. })));

        let bad = Array2::<f32>::zeros((3, 4)).into_dyn();
        let res = ds.add_var("bad", DataVar::new(&[X_DIM, Y_DIM], bad));
        assert!(matches!(res, Err(GridError::UnsupportedDims { .. })));
    }

    #[test]
    fn test_time_var_needs_time_coord() {
        let mut ds = GriddedDataset::new(arr1(&[0.5]), arr1(&[0.5]), "EPSG:32611");
        let data = Array3::<f32>::zeros((1, 1, 1)).into_dyn();
        let res = ds.add_var("sd", DataVar::new(&[TIME_DIM, Y_DIM, X_DIM], data));
        assert!(matches!(res, Err(GridError::NoTimeCoordinate { .. })));
    }

    #[test]
    fn test_bounds() {
        let bounds = lidar_like().bounds().unwrap();
        assert_abs_diff_eq!(bounds.min().x, 100.0);
        assert_abs_diff_eq!(bounds.max().x, 104.0);
        assert_abs_diff_eq!(bounds.min().y, 50.0);
        assert_abs_diff_eq!(bounds.max().y, 53.0);
    }

    #[test]
    fn test_bounds_empty() {
        let ds = GriddedDataset::new(Array1::zeros(0), arr1(&[1.0]), "EPSG:4326");
        assert!(matches!(ds.bounds(), Err(GridError::EmptyAxis("x"))));
    }

    #[test]
    fn test_clip() {
        let mut ds = GriddedDataset::new(arr1(&[0.5, 1.5, 2.5, 3.5, 4.5]), arr1(&[0.5]), "EPSG:32611");
        let data = Array2::from_shape_vec((1, 5), vec![-1000.0, -999.0, 0.5, 999.5, 1000.0])
            .unwrap()
            .into_dyn();
        ds.add_var("v", DataVar::new(&[Y_DIM, X_DIM], data)).unwrap();

        let ds = ds.clip_open_range(-1000.0, 1000.0);
        let v = &ds.var("v").unwrap().data;
        assert!(v[[0, 0]].is_nan());
        assert_abs_diff_eq!(v[[0, 1]], -999.0);
        assert_abs_diff_eq!(v[[0, 2]], 0.5);
        assert_abs_diff_eq!(v[[0, 3]], 999.5);
        assert!(v[[0, 4]].is_nan());
    }

    #[test]
    fn test_select_time() {
        let ds = lidar_like();
        let slice = ds.select_time(ymd(2020, 3, 1)).unwrap();
        assert!(slice.times().is_none());

        let sd = slice.var("lidar-sd").unwrap();
        assert_eq!(sd.dims, [Y_DIM, X_DIM]);
        assert_eq!(sd.data.shape(), &[3, 4]);
        assert_abs_diff_eq!(sd.data[[2, 3]], 123.0);

        let dem = slice.var("lidar-dem").unwrap();
        assert_eq!(dem.data.shape(), &[3, 4]);
        assert_eq!(dem.attrs.get("units"), Some(&AttrValue::from("m")));
    }

    #[test]
    fn test_select_missing_time() {
        let res = lidar_like().select_time(ymd(2021, 3, 1));
        assert!(matches!(res, Err(GridError::TimeNotFound(_))));
    }

    #[test]
    fn test_reproject_identity() {
        let ds = lidar_like().select_time(ymd(2020, 2, 1)).unwrap();
        let out = ds.reproject_match(&ds).unwrap();
        let a = &ds.var("lidar-sd").unwrap().data;
        let b = &out.var("lidar-sd").unwrap().data;
        assert_eq!(a, b);
    }

    #[test]
    fn test_reproject_coarse_target() {
        let ds = lidar_like().select_time(ymd(2020, 2, 1)).unwrap();
        // 2 m cells; the last column falls outside the LIDAR extent.
        let target = GriddedDataset::new(arr1(&[101.0, 103.0, 105.0]), arr1(&[52.0, 50.0]), "epsg:32611");
        let out = ds.reproject_match(&target).unwrap();

        assert_eq!(out.crs(), "epsg:32611");
        let sd = &out.var("lidar-sd").unwrap().data;
        assert_eq!(sd.shape(), &[2, 3]);
        // Ties resolve to the first (lower index) source cell.
        assert_abs_diff_eq!(sd[[0, 0]], 0.0);
        assert_abs_diff_eq!(sd[[0, 1]], 2.0);
        assert_abs_diff_eq!(sd[[1, 0]], 20.0);
        assert!(sd[[0, 2]].is_nan());
        assert!(sd[[1, 2]].is_nan());
    }

    #[test]
    fn test_reproject_keeps_time() {
        let ds = lidar_like();
        let out = ds.reproject_match(&ds).unwrap();
        assert_eq!(out.times().unwrap().len(), 2);
        assert_eq!(out.var("lidar-sd").unwrap().data.shape(), &[2, 3, 4]);
    }

    #[test]
    fn test_reproject_crs_mismatch() {
        let ds = lidar_like();
        let target = GriddedDataset::new(ds.x().clone(), ds.y().clone(), "EPSG:4326");
        assert!(matches!(ds.reproject_match(&target), Err(GridError::CrsMismatch { .. })));
    }

    #[test]
    fn test_merge_drops_conflicting_attrs() {
        let lidar = lidar_like().select_time(ymd(2020, 2, 1)).unwrap();
        let mut spicy = GriddedDataset::new(lidar.x().clone(), lidar.y().clone(), lidar.crs());
        spicy
            .add_var(
                "snow_depth",
                DataVar::new(&[Y_DIM, X_DIM], Array2::<f32>::ones((3, 4)).into_dyn()),
            )
            .unwrap();
        spicy.set_attr("source", "sentinel-1");
        spicy.set_attr("resolution", 100_i64);

        let mut lidar = lidar;
        lidar.set_attr("resolution", 100_i64);

        let merged = GriddedDataset::merge_drop_conflicts(&[&spicy, &lidar]).unwrap();
        let names: Vec<_> = merged.vars().keys().map(|k| k.as_str()).collect();
        assert_eq!(names, ["snow_depth", "lidar-sd", "lidar-dem"]);
        assert!(merged.attr("source").is_none());
        assert_eq!(merged.attr("resolution"), Some(&AttrValue::Int(100)));
    }

    #[test]
    fn test_merge_conflicting_variable() {
        let a = lidar_like();
        let mut b = lidar_like();
        let dem = Array2::from_elem((3, 4), 1.0_f32).into_dyn();
        b.add_var("lidar-dem", DataVar::new(&[Y_DIM, X_DIM], dem)).unwrap();
        let res = GriddedDataset::merge_drop_conflicts(&[&a, &b]);
        assert!(matches!(res, Err(GridError::ConflictingVariable(n)) if n == "lidar-dem"));

        // Identical variables (NaNs included) merge cleanly
        let c = lidar_like().clip_open_range(0.0, 50.0);
        let d = lidar_like().clip_open_range(0.0, 50.0);
        assert!(GriddedDataset::merge_drop_conflicts(&[&c, &d]).is_ok());
    }

    #[test]
    fn test_merge_grid_mismatch() {
        let a = lidar_like();
        let b = GriddedDataset::new(arr1(&[0.0]), a.y().clone(), a.crs());
        let res = GriddedDataset::merge_drop_conflicts(&[&a, &b]);
        assert!(matches!(res, Err(GridError::CoordinateMismatch("x"))));
        assert!(matches!(
            GriddedDataset::merge_drop_conflicts(&[]),
            Err(GridError::NothingToMerge)
        ));
    }
}
