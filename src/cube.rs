use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use ndarray::{ArrayD, Axis, IxDyn, Slice};
use serde_json::Value;
use tracing::debug;

use crate::domain::{Bbox, parse_iso_datetime};
use crate::error::IcosdpError;

pub const TIME: &str = "time";
pub const HOUR: &str = "hour";
pub const LAT: &str = "lat";
pub const LON: &str = "lon";

/// Time encoding every assembled cube is normalised to.
pub const TIME_UNITS: &str = "days since 1970-01-01 00:00:00";

pub type Attrs = BTreeMap<String, Value>;

/// One-dimensional labelled axis. The coordinate name doubles as its
/// dimension name.
#[derive(Debug, Clone, PartialEq)]
pub struct Coordinate {
    pub name: String,
    pub values: Vec<f64>,
    pub attrs: Attrs,
}

impl Coordinate {
    pub fn new(name: &str, values: Vec<f64>) -> Self {
        Self {
            name: name.to_string(),
            values,
            attrs: Attrs::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn slice(&self, range: &RangeInclusive<usize>) -> Self {
        Self {
            name: self.name.clone(),
            values: self.values[range.clone()].to_vec(),
            attrs: self.attrs.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub dims: Vec<String>,
    pub data: ArrayD<f32>,
    pub attrs: Attrs,
}

impl Variable {
    pub fn new(name: &str, dims: &[&str], data: ArrayD<f32>) -> Result<Self, IcosdpError> {
        if dims.len() != data.ndim() {
            return Err(IcosdpError::Cube(format!(
                "variable {name} has {} dimensions but data of rank {}",
                dims.len(),
                data.ndim()
            )));
        }
        Ok(Self {
            name: name.to_string(),
            dims: dims.iter().map(|dim| dim.to_string()).collect(),
            data,
            attrs: Attrs::new(),
        })
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn axis_of(&self, dim: &str) -> Option<Axis> {
        self.dims.iter().position(|d| d == dim).map(Axis)
    }

    pub fn has_dim(&self, dim: &str) -> bool {
        self.axis_of(dim).is_some()
    }
}

/// In-memory labelled dataset: dimension coordinates in axis order, data
/// variables over those dimensions, global attributes and the chunking the
/// cube should be written with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cube {
    pub coords: Vec<Coordinate>,
    pub variables: Vec<Variable>,
    pub attrs: Attrs,
    pub chunks: BTreeMap<String, usize>,
}

impl Cube {
    pub fn new(coords: Vec<Coordinate>, variables: Vec<Variable>) -> Result<Self, IcosdpError> {
        let cube = Self {
            coords,
            variables,
            attrs: Attrs::new(),
            chunks: BTreeMap::new(),
        };
        cube.validate()?;
        Ok(cube)
    }

    pub fn coord(&self, name: &str) -> Option<&Coordinate> {
        self.coords.iter().find(|coord| coord.name == name)
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|var| var.name == name)
    }

    /// Dimension names in axis order: coordinates first, then dimensions
    /// that only appear on variables (e.g. bounds).
    pub fn dims(&self) -> Vec<String> {
        let mut dims = self
            .coords
            .iter()
            .map(|coord| coord.name.clone())
            .collect::<Vec<_>>();
        for var in &self.variables {
            for dim in &var.dims {
                if !dims.contains(dim) {
                    dims.push(dim.clone());
                }
            }
        }
        dims
    }

    pub fn dim_len(&self, dim: &str) -> Option<usize> {
        if let Some(coord) = self.coord(dim) {
            return Some(coord.len());
        }
        self.variables.iter().find_map(|var| {
            var.axis_of(dim)
                .map(|axis| var.data.len_of(axis))
        })
    }

    pub fn sizes(&self) -> Vec<(String, usize)> {
        self.dims()
            .into_iter()
            .filter_map(|dim| self.dim_len(&dim).map(|len| (dim, len)))
            .collect()
    }

    pub fn validate(&self) -> Result<(), IcosdpError> {
        let mut seen = BTreeMap::<&str, usize>::new();
        for coord in &self.coords {
            if seen.insert(coord.name.as_str(), coord.len()).is_some() {
                return Err(IcosdpError::Cube(format!(
                    "duplicate coordinate {}",
                    coord.name
                )));
            }
        }
        for var in &self.variables {
            if var.dims.len() != var.data.ndim() {
                return Err(IcosdpError::Cube(format!(
                    "variable {} has {} dimensions but data of rank {}",
                    var.name,
                    var.dims.len(),
                    var.data.ndim()
                )));
            }
            for (dim, len) in var.dims.iter().zip(var.data.shape()) {
                match seen.get(dim.as_str()) {
                    Some(expected) if expected != len => {
                        return Err(IcosdpError::Cube(format!(
                            "variable {} has length {len} along {dim}, expected {expected}",
                            var.name
                        )));
                    }
                    Some(_) => {}
                    None => {
                        seen.insert(dim.as_str(), *len);
                    }
                }
            }
        }
        Ok(())
    }

    /// Chunk shape for `var`, falling back to the full extent for dimensions
    /// without an explicit chunk size. Every entry is at least 1.
    pub fn chunk_shape(&self, var: &Variable) -> Vec<u64> {
        var.dims
            .iter()
            .zip(var.data.shape())
            .map(|(dim, len)| {
                let chunk = self.chunks.get(dim).copied().unwrap_or(*len);
                chunk.clamp(1, (*len).max(1)) as u64
            })
            .collect()
    }

    /// Re-expresses the time axis as [`TIME_UNITS`] so yearly pieces with
    /// different reference dates line up. Cubes without time units are
    /// returned unchanged.
    pub fn normalize_time(mut self) -> Result<Cube, IcosdpError> {
        let Some(time) = self.coords.iter_mut().find(|coord| coord.name == TIME) else {
            return Ok(self);
        };
        let Some(units) = time.attrs.get("units").and_then(Value::as_str) else {
            return Ok(self);
        };
        if units == TIME_UNITS {
            return Ok(self);
        }
        let (unit, epoch) = units.split_once(" since ").ok_or_else(|| {
            IcosdpError::Cube(format!("unsupported time units {units:?}"))
        })?;
        let scale = hours_per_time_unit(unit)? / 24.0;
        let epoch = parse_iso_datetime(&epoch.trim().replacen(' ', "T", 1))
            .map_err(|_| IcosdpError::Cube(format!("unsupported time units {units:?}")))?;
        let unix = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH.naive_utc();
        let offset_days = (epoch - unix).num_seconds() as f64 / 86_400.0;
        for value in &mut time.values {
            *value = *value * scale + offset_days;
        }
        time.attrs
            .insert("units".to_string(), Value::from(TIME_UNITS));
        Ok(self)
    }

    /// Concatenates `cubes` along `time` in the given order. Non-time
    /// coordinates must agree; the resulting time axis must be strictly
    /// ascending.
    pub fn concat_time(cubes: Vec<Cube>) -> Result<Cube, IcosdpError> {
        let mut iter = cubes.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| IcosdpError::Cube("nothing to concatenate".to_string()))?;
        let rest = iter.collect::<Vec<_>>();
        if rest.is_empty() {
            ensure_ascending_time(&first)?;
            return Ok(first);
        }

        for other in &rest {
            for coord in first.coords.iter().filter(|c| c.name != TIME) {
                match other.coord(&coord.name) {
                    Some(candidate) if candidate.values == coord.values => {}
                    _ => {
                        return Err(IcosdpError::Cube(format!(
                            "coordinate {} differs between concatenated cubes",
                            coord.name
                        )));
                    }
                }
            }
        }

        let mut coords = Vec::with_capacity(first.coords.len());
        for coord in &first.coords {
            if coord.name != TIME {
                coords.push(coord.clone());
                continue;
            }
            let mut values = coord.values.clone();
            for other in &rest {
                let time = other.coord(TIME).ok_or_else(|| {
                    IcosdpError::Cube("cube without time coordinate".to_string())
                })?;
                values.extend_from_slice(&time.values);
            }
            coords.push(Coordinate {
                name: TIME.to_string(),
                values,
                attrs: coord.attrs.clone(),
            });
        }
        if !coords.iter().any(|coord| coord.name == TIME) {
            return Err(IcosdpError::Cube(
                "cannot concatenate cubes without a time coordinate".to_string(),
            ));
        }

        let mut variables = Vec::with_capacity(first.variables.len());
        for var in &first.variables {
            let Some(axis) = var.axis_of(TIME) else {
                variables.push(var.clone());
                continue;
            };
            let mut parts = vec![var.data.view()];
            for other in &rest {
                let part = other
                    .variable(&var.name)
                    .filter(|candidate| candidate.dims == var.dims)
                    .ok_or_else(|| {
                        IcosdpError::Cube(format!(
                            "variable {} missing or shaped differently in a concatenated cube",
                            var.name
                        ))
                    })?;
                parts.push(part.data.view());
            }
            let data = ndarray::concatenate(axis, &parts)
                .map_err(|err| IcosdpError::Cube(format!("concat {}: {err}", var.name)))?;
            variables.push(Variable {
                name: var.name.clone(),
                dims: var.dims.clone(),
                data,
                attrs: var.attrs.clone(),
            });
        }

        let cube = Cube {
            coords,
            variables,
            attrs: first.attrs.clone(),
            chunks: BTreeMap::new(),
        };
        cube.validate()?;
        ensure_ascending_time(&cube)?;
        Ok(cube)
    }

    /// Crops to `bbox`. Latitude and longitude may run in either direction;
    /// the native order is kept. An empty selection is an invalid bbox.
    pub fn select_bbox(&self, bbox: &Bbox) -> Result<Cube, IcosdpError> {
        let lat = self
            .coord(LAT)
            .ok_or_else(|| IcosdpError::Cube("cube has no lat coordinate".to_string()))?;
        let lon = self
            .coord(LON)
            .ok_or_else(|| IcosdpError::Cube("cube has no lon coordinate".to_string()))?;
        let lat_range = index_range(&lat.values, bbox.south, bbox.north)
            .ok_or_else(|| IcosdpError::InvalidBbox(format!("{bbox} selects no latitudes")))?;
        let lon_range = index_range(&lon.values, bbox.west, bbox.east)
            .ok_or_else(|| IcosdpError::InvalidBbox(format!("{bbox} selects no longitudes")))?;
        debug!(%bbox, ?lat_range, ?lon_range, "cropping cube");

        let ranges = [(LAT, lat_range), (LON, lon_range)];
        let coords = self
            .coords
            .iter()
            .map(|coord| {
                match ranges.iter().find(|(dim, _)| *dim == coord.name) {
                    Some((_, range)) => coord.slice(range),
                    None => coord.clone(),
                }
            })
            .collect();
        let variables = self
            .variables
            .iter()
            .map(|var| {
                let mut view = var.data.view();
                for (dim, range) in &ranges {
                    if let Some(axis) = var.axis_of(dim) {
                        view.slice_axis_inplace(
                            axis,
                            Slice::from(*range.start()..range.end() + 1),
                        );
                    }
                }
                Variable {
                    name: var.name.clone(),
                    dims: var.dims.clone(),
                    data: view.to_owned(),
                    attrs: var.attrs.clone(),
                }
            })
            .collect();

        Ok(Cube {
            coords,
            variables,
            attrs: self.attrs.clone(),
            chunks: self.chunks.clone(),
        })
    }

    /// Keeps the time steps inside `[start, end]`, both given in the units
    /// of the time coordinate. An empty selection yields an empty time axis.
    pub fn select_time(&self, start: f64, end: f64) -> Result<Cube, IcosdpError> {
        let time = self
            .coord(TIME)
            .ok_or_else(|| IcosdpError::Cube("cube has no time coordinate".to_string()))?;
        let (lo, hi) = index_range(&time.values, start, end)
            .map(|range| (*range.start(), range.end() + 1))
            .unwrap_or((0, 0));
        let coords = self
            .coords
            .iter()
            .map(|coord| {
                if coord.name == TIME {
                    Coordinate {
                        name: coord.name.clone(),
                        values: coord.values[lo..hi].to_vec(),
                        attrs: coord.attrs.clone(),
                    }
                } else {
                    coord.clone()
                }
            })
            .collect();
        let variables = self
            .variables
            .iter()
            .map(|var| {
                let mut view = var.data.view();
                if let Some(axis) = var.axis_of(TIME) {
                    view.slice_axis_inplace(axis, Slice::from(lo..hi));
                }
                Variable {
                    name: var.name.clone(),
                    dims: var.dims.clone(),
                    data: view.to_owned(),
                    attrs: var.attrs.clone(),
                }
            })
            .collect();
        Ok(Cube {
            coords,
            variables,
            attrs: self.attrs.clone(),
            chunks: self.chunks.clone(),
        })
    }

    /// Assigns `chunks` positionally to [`Cube::dims`]. Dimensions past the
    /// end of `chunks` keep their current chunking.
    pub fn rechunk(&self, chunks: &[usize]) -> Result<Cube, IcosdpError> {
        let dims = self.dims();
        if chunks.len() > dims.len() {
            return Err(IcosdpError::Configuration(format!(
                "{} chunk sizes given for a cube with dimensions {dims:?}",
                chunks.len()
            )));
        }
        if chunks.contains(&0) {
            return Err(IcosdpError::Configuration(format!(
                "chunk sizes must be positive, got {chunks:?}"
            )));
        }
        let mut cube = self.clone();
        for (dim, size) in dims.iter().zip(chunks) {
            let len = self.dim_len(dim).unwrap_or(*size);
            cube.chunks.insert(dim.clone(), (*size).min(len.max(1)));
        }
        debug!(chunks = ?cube.chunks, "rechunked cube");
        Ok(cube)
    }

    /// Folds the `time` x `hour` axes of a diurnal-cycle cube into one time
    /// axis. Variables defined over only one of the two axes are dropped.
    pub fn flatten_time(&self) -> Result<Cube, IcosdpError> {
        let time = self
            .coord(TIME)
            .ok_or_else(|| IcosdpError::Cube("cube has no time coordinate".to_string()))?;
        let hour = self
            .coord(HOUR)
            .ok_or_else(|| IcosdpError::Cube("cube has no hour coordinate".to_string()))?;
        let units = time
            .attrs
            .get("units")
            .and_then(Value::as_str)
            .unwrap_or("days since 1970-01-01");
        let hours_per_unit = hours_per_time_unit(units)?;

        let values = time
            .values
            .iter()
            .flat_map(|t| hour.values.iter().map(move |h| t + h / hours_per_unit))
            .collect::<Vec<_>>();
        let flat_time = Coordinate {
            name: TIME.to_string(),
            values,
            attrs: time.attrs.clone(),
        };
        let (nt, nh) = (time.len(), hour.len());

        let coords = self
            .coords
            .iter()
            .filter(|coord| coord.name != HOUR)
            .map(|coord| {
                if coord.name == TIME {
                    flat_time.clone()
                } else {
                    coord.clone()
                }
            })
            .collect();

        let mut variables = Vec::new();
        for var in &self.variables {
            match (var.axis_of(TIME), var.axis_of(HOUR)) {
                (Some(t), Some(h)) => {
                    let rest = (0..var.dims.len())
                        .filter(|axis| *axis != t.index() && *axis != h.index())
                        .collect::<Vec<_>>();
                    let mut order = vec![t.index(), h.index()];
                    order.extend(&rest);
                    let permuted = var.data.view().permuted_axes(IxDyn(&order));
                    let mut shape = vec![nt * nh];
                    shape.extend(rest.iter().map(|axis| var.data.len_of(Axis(*axis))));
                    let data = permuted
                        .as_standard_layout()
                        .into_owned()
                        .into_shape_with_order(IxDyn(&shape))
                        .map_err(|err| IcosdpError::Cube(format!("flatten {}: {err}", var.name)))?;
                    let mut dims = vec![TIME.to_string()];
                    dims.extend(rest.iter().map(|axis| var.dims[*axis].clone()));
                    variables.push(Variable {
                        name: var.name.clone(),
                        dims,
                        data,
                        attrs: var.attrs.clone(),
                    });
                }
                (None, None) => variables.push(var.clone()),
                _ => debug!(variable = %var.name, "dropping variable during time flattening"),
            }
        }

        let mut chunks = self.chunks.clone();
        chunks.remove(HOUR);
        chunks.remove(TIME);
        let cube = Cube {
            coords,
            variables,
            attrs: self.attrs.clone(),
            chunks,
        };
        cube.validate()?;
        Ok(cube)
    }
}

fn ensure_ascending_time(cube: &Cube) -> Result<(), IcosdpError> {
    if let Some(time) = cube.coord(TIME) {
        if let Some(pair) = time.values.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(IcosdpError::Cube(format!(
                "time axis is not strictly ascending ({} followed by {})",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

/// Contiguous index range of `values` inside `[low, high]`.
fn index_range(values: &[f64], low: f64, high: f64) -> Option<RangeInclusive<usize>> {
    let inside = |v: &f64| *v >= low && *v <= high;
    let start = values.iter().position(inside)?;
    let end = values.iter().rposition(inside)?;
    Some(start..=end)
}

fn hours_per_time_unit(units: &str) -> Result<f64, IcosdpError> {
    let unit = units.split_whitespace().next().unwrap_or_default();
    match unit.to_ascii_lowercase().as_str() {
        "days" | "day" => Ok(24.0),
        "hours" | "hour" => Ok(1.0),
        "minutes" | "minute" => Ok(1.0 / 60.0),
        "seconds" | "second" => Ok(1.0 / 3600.0),
        _ => Err(IcosdpError::Cube(format!(
            "unsupported time units {units:?}"
        ))),
    }
}
