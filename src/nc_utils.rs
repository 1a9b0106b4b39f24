//! Reading and writing [`GriddedDataset`]s as netCDF files.
//!
//! Files use `x` and `y` coordinate variables, an optional `time` coordinate in
//! CF units (e.g. `days since 1970-01-01`), and store the CRS identifier in a
//! global `crs` attribute. Missing data are written as NaN and a `_FillValue`
//! on read is converted to NaN.
use std::path::Path;

use itertools::Itertools;
use ndarray::{Array1, ArrayD, Ix1};
use netcdf::{AttributeValue, Extents};

use crate::{
    dates::{date_to_nctime, nctime_to_date, TIME_UNITS},
    error::DateError,
    grid::{AttrValue, Attributes, DataVar, GridError, GriddedDataset, TIME_DIM, X_DIM, Y_DIM},
    interface::{DatasetWriter, WriteError},
    lidar::BAND_VAR,
};

/// Global attribute holding the CRS identifier.
pub const CRS_ATTR: &str = "crs";
const FILL_VALUE_ATTR: &str = "_FillValue";

#[derive(Debug, thiserror::Error)]
pub enum NcReadError {
    #[error(transparent)]
    Netcdf(#[from] netcdf::Error),
    #[error("Required {0} is missing")]
    Missing(String),
    #[error("Variable or attribute '{name}' could not be read: {cause}")]
    BadValue { name: String, cause: String },
    #[error("Time coordinate could not be decoded: {0}")]
    Time(#[from] DateError),
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Convert a netCDF attribute value, returning `None` for array valued
/// attributes, which the datasets here do not carry.
fn attr_from_nc(value: AttributeValue) -> Option<AttrValue> {
    match value {
        AttributeValue::Str(s) => Some(AttrValue::Str(s)),
        AttributeValue::Strs(mut v) if v.len() == 1 => v.pop().map(AttrValue::Str),
        AttributeValue::Schar(v) => Some(AttrValue::Int(v.into())),
        AttributeValue::Uchar(v) => Some(AttrValue::Int(v.into())),
        AttributeValue::Short(v) => Some(AttrValue::Int(v.into())),
        AttributeValue::Ushort(v) => Some(AttrValue::Int(v.into())),
        AttributeValue::Int(v) => Some(AttrValue::Int(v.into())),
        AttributeValue::Uint(v) => Some(AttrValue::Int(v.into())),
        AttributeValue::Longlong(v) => Some(AttrValue::Int(v)),
        AttributeValue::Ulonglong(v) => i64::try_from(v).ok().map(AttrValue::Int),
        AttributeValue::Float(v) => Some(AttrValue::Float(v.into())),
        AttributeValue::Double(v) => Some(AttrValue::Float(v)),
        _ => None,
    }
}

fn attr_to_nc(value: &AttrValue) -> AttributeValue {
    match value {
        AttrValue::Str(s) => AttributeValue::Str(s.clone()),
        AttrValue::Int(i) => AttributeValue::Longlong(*i),
        AttrValue::Float(v) => AttributeValue::Double(*v),
    }
}

fn read_attrs<'a, I: Iterator<Item = netcdf::Attribute<'a>>>(
    attrs: I,
) -> Result<Attributes, NcReadError> {
    let mut out = Attributes::new();
    for att in attrs {
        let name = att.name().to_string();
        if name == FILL_VALUE_ATTR {
            continue;
        }
        match attr_from_nc(att.value()?) {
            Some(value) => {
                out.insert(name, value);
            }
            None => log::debug!("Skipping array valued attribute '{name}'"),
        }
    }
    Ok(out)
}

fn read_coord(file: &netcdf::File, name: &str) -> Result<Array1<f64>, NcReadError> {
    file.variable(name)
        .ok_or_else(|| NcReadError::Missing(format!("coordinate variable '{name}'")))?
        .get::<f64, _>(Extents::All)?
        .into_dimensionality::<Ix1>()
        .map_err(|e| NcReadError::BadValue {
            name: name.to_string(),
            cause: e.to_string(),
        })
}

fn read_crs(file: &netcdf::File) -> Result<String, NcReadError> {
    let value = file
        .attribute(CRS_ATTR)
        .ok_or_else(|| NcReadError::Missing(format!("global attribute '{CRS_ATTR}'")))?
        .value()?;
    match attr_from_nc(value) {
        Some(AttrValue::Str(s)) => Ok(s),
        Some(AttrValue::Int(epsg)) => Ok(format!("EPSG:{epsg}")),
        _ => Err(NcReadError::BadValue {
            name: CRS_ATTR.to_string(),
            cause: "expected a string or EPSG code".to_string(),
        }),
    }
}

fn read_times(file: &netcdf::File) -> Result<Option<Vec<chrono::NaiveDate>>, NcReadError> {
    let Some(var) = file.variable(TIME_DIM) else {
        return Ok(None);
    };

    let units = match var.attribute("units").map(|a| a.value()).transpose()? {
        Some(AttributeValue::Str(u)) => u,
        _ => return Err(NcReadError::Missing("string 'units' attribute on 'time'".to_string())),
    };

    let times = var
        .get::<f64, _>(Extents::All)?
        .iter()
        .map(|&t| nctime_to_date(t, &units))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(times))
}

fn read_f32_data(var: &netcdf::Variable) -> Result<ArrayD<f32>, NcReadError> {
    let mut data = var.get::<f32, _>(Extents::All)?;
    let fill = var
        .attribute(FILL_VALUE_ATTR)
        .map(|a| a.value())
        .transpose()?
        .and_then(attr_from_nc);
    let fill = match fill {
        Some(AttrValue::Float(v)) => Some(v as f32),
        Some(AttrValue::Int(v)) => Some(v as f32),
        _ => None,
    };
    if let Some(fill) = fill.filter(|f| !f.is_nan()) {
        data.mapv_inplace(|v| if v == fill { f32::NAN } else { v });
    }
    Ok(data)
}

/// Read a gridded dataset. Variables not laid out as `(y, x)` or `(time, y, x)`
/// are skipped.
pub fn read_gridded(path: &Path) -> Result<GriddedDataset, NcReadError> {
    let file = netcdf::open(path)?;
    let x = read_coord(&file, X_DIM)?;
    let y = read_coord(&file, Y_DIM)?;
    let crs = read_crs(&file)?;

    let mut ds = GriddedDataset::new(x, y, crs);
    if let Some(times) = read_times(&file)? {
        ds = ds.with_times(times);
    }

    for var in file.variables() {
        let name = var.name();
        if name == X_DIM || name == Y_DIM || name == TIME_DIM {
            continue;
        }

        let dims = var.dimensions().iter().map(|d| d.name()).collect_vec();
        let dims = dims.iter().map(|d| d.as_str()).collect_vec();
        if dims != [Y_DIM, X_DIM] && dims != [TIME_DIM, Y_DIM, X_DIM] {
            log::debug!("Skipping variable '{name}' in {} with dimensions {dims:?}", path.display());
            continue;
        }

        let mut data_var = DataVar::new(&dims, read_f32_data(&var)?);
        data_var.attrs = read_attrs(var.attributes())?;
        ds.add_var(name, data_var)?;
    }

    for (key, value) in read_attrs(file.attributes())? {
        if key != CRS_ATTR {
            ds.set_attr(key, value);
        }
    }

    Ok(ds)
}

/// Read a single LIDAR product raster, which must contain the `band` variable.
pub fn read_band_file(path: &Path) -> Result<GriddedDataset, NcReadError> {
    let ds = read_gridded(path)?;
    if ds.var(BAND_VAR).is_none() {
        return Err(NcReadError::Missing(format!("variable '{BAND_VAR}'")));
    }
    Ok(ds)
}

/// Write a dataset to a new netCDF file at `path`, overwriting any existing file.
pub fn write_dataset(ds: &GriddedDataset, path: &Path) -> netcdf::Result<()> {
    let mut file = netcdf::create(path)?;

    if let Some(times) = ds.times() {
        file.add_dimension(TIME_DIM, times.len())?;
    }
    file.add_dimension(Y_DIM, ds.y().len())?;
    file.add_dimension(X_DIM, ds.x().len())?;

    if let Some(times) = ds.times() {
        let values = Array1::from_iter(times.iter().map(|&t| date_to_nctime(t)));
        let mut var = file.add_variable::<f64>(TIME_DIM, &[TIME_DIM])?;
        var.put(values.view(), Extents::All)?;
        var.put_attribute("units", TIME_UNITS)?;
        var.put_attribute("calendar", "gregorian")?;
    }

    for (name, coords, standard_name) in [
        (X_DIM, ds.x(), "projection_x_coordinate"),
        (Y_DIM, ds.y(), "projection_y_coordinate"),
    ] {
        let mut var = file.add_variable::<f64>(name, &[name])?;
        var.put(coords.view(), Extents::All)?;
        var.put_attribute("standard_name", standard_name)?;
    }

    for (name, data_var) in ds.vars() {
        let dims = data_var.dims.iter().map(|d| d.as_str()).collect_vec();
        let mut var = file.add_variable::<f32>(name, &dims)?;
        var.set_fill_value(f32::NAN)?;
        var.put(data_var.data.view(), Extents::All)?;
        for (key, value) in data_var.attrs.iter() {
            var.put_attribute(key, attr_to_nc(value))?;
        }
    }

    file.add_attribute(CRS_ATTR, ds.crs())?;
    for (key, value) in ds.attrs() {
        file.add_attribute(key, attr_to_nc(value))?;
    }

    Ok(())
}

/// Writes merged datasets as netCDF4.
///
/// The file is first written under a temporary name and only renamed to its
/// final name once complete, so the existence of the final file always means
/// a complete write.
#[derive(Debug, Default)]
pub struct NcWriter;

impl DatasetWriter for NcWriter {
    fn write(&mut self, ds: &GriddedDataset, path: &Path) -> Result<(), WriteError> {
        let partial = path.with_extension("nc.tmp");
        if let Err(e) = write_dataset(ds, &partial) {
            if partial.exists() {
                if let Err(rm_err) = std::fs::remove_file(&partial) {
                    log::warn!("Could not remove partial file {}: {rm_err}", partial.display());
                }
            }
            return Err(WriteError::Netcdf {
                path: path.to_path_buf(),
                cause: e.to_string(),
            });
        }

        std::fs::rename(&partial, path).map_err(|e| WriteError::Rename {
            from: partial.clone(),
            to: path.to_path_buf(),
            inner: e,
        })
    }
}
