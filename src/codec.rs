use std::fs;
use std::sync::Arc;

use camino::Utf8Path;
use ndarray::{ArrayD, IxDyn};
use serde_json::{Map, Value};
use tracing::debug;
use zarrs::array::{Array, ArrayBuilder, DataType, Element, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::{Group, GroupBuilder};
use zarrs::storage::ReadableWritableListableStorage;

use crate::cube::{Attrs, Coordinate, Cube, Variable};
use crate::domain::TargetFormat;
use crate::error::IcosdpError;

const DIMENSIONS_ATTR: &str = "_ARRAY_DIMENSIONS";
const COORDS_ATTR: &str = "icosdp:coords";
const VARIABLES_ATTR: &str = "icosdp:variables";
const CHUNKS_ATTR: &str = "icosdp:chunks";

pub trait CubeReader: Send + Sync {
    fn read(&self, path: &Utf8Path) -> Result<Cube, IcosdpError>;

    /// Fails when this build cannot read anything at all.
    fn ensure_readable(&self) -> Result<(), IcosdpError> {
        Ok(())
    }
}

pub trait CubeWriter: Send + Sync {
    fn format(&self) -> TargetFormat;
    fn write(&self, cube: &Cube, path: &Utf8Path) -> Result<(), IcosdpError>;

    fn ensure_writable(&self) -> Result<(), IcosdpError> {
        Ok(())
    }
}

pub fn writer_for(format: TargetFormat) -> Box<dyn CubeWriter> {
    match format {
        TargetFormat::Zarr => Box::new(ZarrFormat),
        TargetFormat::Netcdf => Box::new(NetcdfFormat),
    }
}

pub fn reader_for(format: TargetFormat) -> Box<dyn CubeReader> {
    match format {
        TargetFormat::Zarr => Box::new(ZarrFormat),
        TargetFormat::Netcdf => Box::new(NetcdfFormat),
    }
}

/// Zarr directory store: one array per coordinate and variable below the
/// root group, xarray-style `_ARRAY_DIMENSIONS` on every array.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZarrFormat;

fn zarr_err(err: impl std::fmt::Display) -> IcosdpError {
    IcosdpError::Filesystem(format!("zarr: {err}"))
}

fn chunk_grid(shape: Vec<u64>) -> Result<zarrs::array::chunk_grid::ChunkGrid, IcosdpError> {
    shape.try_into().map_err(zarr_err)
}

fn open_store(path: &Utf8Path) -> Result<ReadableWritableListableStorage, IcosdpError> {
    let store = FilesystemStore::new(path.as_std_path()).map_err(zarr_err)?;
    Ok(Arc::new(store))
}

fn to_map(attrs: &Attrs) -> Map<String, Value> {
    attrs
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn store_array<T: Element + Clone>(
    store: &ReadableWritableListableStorage,
    name: &str,
    dims: &[String],
    data: ArrayD<T>,
    chunk_shape: Vec<u64>,
    data_type: DataType,
    fill_value: FillValue,
    attrs: &Attrs,
) -> Result<(), IcosdpError> {
    let mut attributes = to_map(attrs);
    attributes.insert(DIMENSIONS_ATTR.to_string(), Value::from(dims.to_vec()));
    let shape = data.shape().iter().map(|len| *len as u64).collect::<Vec<_>>();
    let array = ArrayBuilder::new(shape, data_type, chunk_grid(chunk_shape)?, fill_value)
        .attributes(attributes)
        .build(store.clone(), &format!("/{name}"))
        .map_err(zarr_err)?;
    array.store_metadata().map_err(zarr_err)?;
    if !data.is_empty() {
        let start = vec![0u64; data.ndim()];
        array
            .store_array_subset_ndarray(&start, data.as_standard_layout().into_owned())
            .map_err(zarr_err)?;
    }
    Ok(())
}

fn names_attr(attrs: &mut Map<String, Value>, key: &str) -> Result<Vec<String>, IcosdpError> {
    let value = attrs
        .remove(key)
        .ok_or_else(|| IcosdpError::Cube(format!("zarr group is missing the {key} attribute")))?;
    serde_json::from_value(value).map_err(|err| IcosdpError::Cube(format!("{key}: {err}")))
}

fn array_parts(attributes: &Map<String, Value>) -> Result<(Vec<String>, Attrs), IcosdpError> {
    let mut attrs = strip_internal(attributes.clone());
    let dims = attrs
        .remove(DIMENSIONS_ATTR)
        .map(serde_json::from_value::<Vec<String>>)
        .transpose()
        .map_err(|err| IcosdpError::Cube(format!("{DIMENSIONS_ATTR}: {err}")))?
        .ok_or_else(|| IcosdpError::Cube(format!("array without {DIMENSIONS_ATTR}")))?;
    Ok((dims, attrs))
}

/// Drops the library's own `_zarrs` provenance entry.
fn strip_internal(attributes: Map<String, Value>) -> Attrs {
    attributes
        .into_iter()
        .filter(|(key, _)| key != "_zarrs")
        .collect()
}

impl CubeWriter for ZarrFormat {
    fn format(&self) -> TargetFormat {
        TargetFormat::Zarr
    }

    fn write(&self, cube: &Cube, path: &Utf8Path) -> Result<(), IcosdpError> {
        cube.validate()?;
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| IcosdpError::Filesystem(err.to_string()))?;
        let store = open_store(path)?;

        let mut group_attrs = to_map(&cube.attrs);
        let coord_names = cube.coords.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
        let var_names = cube.variables.iter().map(|v| v.name.clone()).collect::<Vec<_>>();
        group_attrs.insert(COORDS_ATTR.to_string(), Value::from(coord_names));
        group_attrs.insert(VARIABLES_ATTR.to_string(), Value::from(var_names));
        group_attrs.insert(
            CHUNKS_ATTR.to_string(),
            serde_json::to_value(&cube.chunks).map_err(|err| IcosdpError::Cube(err.to_string()))?,
        );
        let group = GroupBuilder::new()
            .attributes(group_attrs)
            .build(store.clone(), "/")
            .map_err(zarr_err)?;
        group.store_metadata().map_err(zarr_err)?;

        for coord in &cube.coords {
            let data = ArrayD::from_shape_vec(IxDyn(&[coord.len()]), coord.values.clone())
                .map_err(|err| IcosdpError::Cube(err.to_string()))?;
            let chunk = cube
                .chunks
                .get(&coord.name)
                .copied()
                .unwrap_or(coord.len())
                .clamp(1, coord.len().max(1));
            store_array(
                &store,
                &coord.name,
                std::slice::from_ref(&coord.name),
                data,
                vec![chunk as u64],
                DataType::Float64,
                FillValue::from(f64::NAN),
                &coord.attrs,
            )?;
        }
        for var in &cube.variables {
            store_array(
                &store,
                &var.name,
                &var.dims,
                var.data.clone(),
                cube.chunk_shape(var),
                DataType::Float32,
                FillValue::from(f32::NAN),
                &var.attrs,
            )?;
        }
        debug!(%path, variables = cube.variables.len(), "wrote zarr store");
        Ok(())
    }
}

impl CubeReader for ZarrFormat {
    fn read(&self, path: &Utf8Path) -> Result<Cube, IcosdpError> {
        if !path.as_std_path().is_dir() {
            return Err(IcosdpError::Filesystem(format!("no zarr store at {path}")));
        }
        let store = open_store(path)?;
        let group = Group::open(store.clone(), "/").map_err(zarr_err)?;
        let mut group_attrs = group.attributes().clone();
        let coord_names = names_attr(&mut group_attrs, COORDS_ATTR)?;
        let var_names = names_attr(&mut group_attrs, VARIABLES_ATTR)?;
        let chunks = group_attrs
            .remove(CHUNKS_ATTR)
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| IcosdpError::Cube(format!("{CHUNKS_ATTR}: {err}")))?
            .unwrap_or_default();

        let mut coords = Vec::with_capacity(coord_names.len());
        for name in &coord_names {
            let array = Array::open(store.clone(), &format!("/{name}")).map_err(zarr_err)?;
            let (_, attrs) = array_parts(array.attributes())?;
            let subset = ArraySubset::new_with_shape(array.shape().to_vec());
            let values = array
                .retrieve_array_subset_ndarray::<f64>(&subset)
                .map_err(zarr_err)?;
            coords.push(Coordinate {
                name: name.clone(),
                values: values.iter().copied().collect(),
                attrs,
            });
        }

        let mut variables = Vec::with_capacity(var_names.len());
        for name in &var_names {
            let array = Array::open(store.clone(), &format!("/{name}")).map_err(zarr_err)?;
            let (dims, attrs) = array_parts(array.attributes())?;
            let subset = ArraySubset::new_with_shape(array.shape().to_vec());
            let data = array
                .retrieve_array_subset_ndarray::<f32>(&subset)
                .map_err(zarr_err)?;
            variables.push(Variable {
                name: name.clone(),
                dims,
                data,
                attrs,
            });
        }

        let cube = Cube {
            coords,
            variables,
            attrs: strip_internal(group_attrs),
            chunks,
        };
        cube.validate()?;
        Ok(cube)
    }
}

/// NetCDF files, used for the staged yearly objects and `.nc` artifacts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetcdfFormat;

#[cfg(not(feature = "netcdf"))]
const NETCDF_DISABLED: &str = "built without the `netcdf` feature";

#[cfg(not(feature = "netcdf"))]
impl CubeReader for NetcdfFormat {
    fn read(&self, path: &Utf8Path) -> Result<Cube, IcosdpError> {
        Err(IcosdpError::UnsupportedFormat(format!(
            "cannot read {path}: {NETCDF_DISABLED}"
        )))
    }

    fn ensure_readable(&self) -> Result<(), IcosdpError> {
        Err(IcosdpError::UnsupportedFormat(format!(
            "cannot read NetCDF objects: {NETCDF_DISABLED}"
        )))
    }
}

#[cfg(not(feature = "netcdf"))]
impl CubeWriter for NetcdfFormat {
    fn format(&self) -> TargetFormat {
        TargetFormat::Netcdf
    }

    fn write(&self, _cube: &Cube, path: &Utf8Path) -> Result<(), IcosdpError> {
        Err(IcosdpError::UnsupportedFormat(format!(
            "cannot write {path}: {NETCDF_DISABLED}"
        )))
    }

    fn ensure_writable(&self) -> Result<(), IcosdpError> {
        Err(IcosdpError::UnsupportedFormat(format!(
            "cannot write NetCDF artifacts: {NETCDF_DISABLED}"
        )))
    }
}

#[cfg(feature = "netcdf")]
mod nc {
    use netcdf::AttributeValue;

    use super::*;

    fn nc_err(err: netcdf::Error) -> IcosdpError {
        IcosdpError::Filesystem(format!("netcdf: {err}"))
    }

    fn to_json(value: AttributeValue) -> Value {
        match value {
            AttributeValue::Str(s) => Value::from(s),
            AttributeValue::Strs(items) => Value::from(items),
            AttributeValue::Double(v) => Value::from(v),
            AttributeValue::Doubles(v) => Value::from(v),
            AttributeValue::Float(v) => Value::from(f64::from(v)),
            AttributeValue::Floats(v) => Value::from(v.into_iter().map(f64::from).collect::<Vec<_>>()),
            AttributeValue::Int(v) => Value::from(v),
            AttributeValue::Ints(v) => Value::from(v),
            AttributeValue::Short(v) => Value::from(v),
            AttributeValue::Longlong(v) => Value::from(v),
            AttributeValue::Uchar(v) => Value::from(v),
            AttributeValue::Schar(v) => Value::from(v),
            other => Value::from(format!("{other:?}")),
        }
    }

    fn from_json(value: &Value) -> AttributeValue {
        match value {
            Value::String(s) => AttributeValue::Str(s.clone()),
            Value::Number(n) => match n.as_i64() {
                Some(i) if i32::try_from(i).is_ok() => AttributeValue::Int(i as i32),
                _ => AttributeValue::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::Bool(b) => AttributeValue::Str(b.to_string()),
            Value::Array(items) if items.iter().all(Value::is_number) => {
                AttributeValue::Doubles(items.iter().filter_map(Value::as_f64).collect())
            }
            Value::Array(items) if items.iter().all(Value::is_string) => AttributeValue::Strs(
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_string))
                    .collect(),
            ),
            other => AttributeValue::Str(other.to_string()),
        }
    }

    fn read_attrs<'a>(attrs: impl Iterator<Item = netcdf::Attribute<'a>>) -> Result<Attrs, IcosdpError> {
        let mut out = Attrs::new();
        for attr in attrs {
            out.insert(attr.name().to_string(), to_json(attr.value().map_err(nc_err)?));
        }
        Ok(out)
    }

    impl CubeReader for NetcdfFormat {
        fn read(&self, path: &Utf8Path) -> Result<Cube, IcosdpError> {
            let file = netcdf::open(path.as_std_path()).map_err(nc_err)?;
            let dim_names = file
                .dimensions()
                .map(|dim| dim.name().to_string())
                .collect::<Vec<_>>();

            let mut coords = Vec::new();
            for name in &dim_names {
                let Some(var) = file.variable(name) else {
                    continue;
                };
                if var.dimensions().len() != 1 {
                    continue;
                }
                let values: Vec<f64> = var.get_values(..).map_err(nc_err)?;
                coords.push(Coordinate {
                    name: name.clone(),
                    values,
                    attrs: read_attrs(var.attributes())?,
                });
            }

            let mut variables = Vec::new();
            for var in file.variables() {
                let name = var.name();
                if coords.iter().any(|coord| coord.name == name) {
                    continue;
                }
                let dims = var
                    .dimensions()
                    .iter()
                    .map(|dim| dim.name().to_string())
                    .collect::<Vec<_>>();
                let shape = var.dimensions().iter().map(|dim| dim.len()).collect::<Vec<_>>();
                let attrs = read_attrs(var.attributes())?;
                let mut values: Vec<f32> = var.get_values(..).map_err(nc_err)?;
                if let Some(fill) = attrs.get("_FillValue").and_then(Value::as_f64) {
                    let fill = fill as f32;
                    values
                        .iter_mut()
                        .filter(|v| **v == fill)
                        .for_each(|v| *v = f32::NAN);
                }
                let data = ArrayD::from_shape_vec(IxDyn(&shape), values)
                    .map_err(|err| IcosdpError::Cube(format!("{name}: {err}")))?;
                variables.push(Variable {
                    name,
                    dims,
                    data,
                    attrs,
                });
            }

            let cube = Cube {
                coords,
                variables,
                attrs: read_attrs(file.attributes())?,
                chunks: Default::default(),
            };
            cube.validate()?;
            debug!(%path, "read netcdf file");
            Ok(cube)
        }
    }

    impl CubeWriter for NetcdfFormat {
        fn format(&self) -> TargetFormat {
            TargetFormat::Netcdf
        }

        fn write(&self, cube: &Cube, path: &Utf8Path) -> Result<(), IcosdpError> {
            cube.validate()?;
            let mut file = netcdf::create(path.as_std_path()).map_err(nc_err)?;
            for (name, value) in &cube.attrs {
                file.add_attribute(name, from_json(value)).map_err(nc_err)?;
            }
            for (dim, len) in cube.sizes() {
                file.add_dimension(&dim, len).map_err(nc_err)?;
            }
            for coord in &cube.coords {
                let mut var = file
                    .add_variable::<f64>(&coord.name, &[coord.name.as_str()])
                    .map_err(nc_err)?;
                for (key, value) in &coord.attrs {
                    var.put_attribute(key, from_json(value)).map_err(nc_err)?;
                }
                var.put_values(&coord.values, ..).map_err(nc_err)?;
            }
            for variable in &cube.variables {
                let dims = variable.dims.iter().map(String::as_str).collect::<Vec<_>>();
                let mut var = file.add_variable::<f32>(&variable.name, &dims).map_err(nc_err)?;
                if !variable.data.is_empty() {
                    let chunks = cube
                        .chunk_shape(variable)
                        .into_iter()
                        .map(|len| len as usize)
                        .collect::<Vec<_>>();
                    var.set_chunking(&chunks).map_err(nc_err)?;
                }
                for (key, value) in &variable.attrs {
                    var.put_attribute(key, from_json(value)).map_err(nc_err)?;
                }
                let values = variable.data.iter().copied().collect::<Vec<_>>();
                var.put_values(&values, ..).map_err(nc_err)?;
            }
            debug!(%path, "wrote netcdf file");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;
    use crate::cube::{LAT, LON, TIME};

    fn sample() -> Cube {
        let data = Array::from_shape_fn(IxDyn(&[2, 3, 2]), |ix| (ix[0] * 6 + ix[1] * 2 + ix[2]) as f32);
        let mut cube = Cube::new(
            vec![
                Coordinate::new(TIME, vec![0.0, 31.0]).with_attr("units", "days since 2001-01-01"),
                Coordinate::new(LAT, vec![50.0, 49.5, 49.0]),
                Coordinate::new(LON, vec![5.0, 5.5]),
            ],
            vec![Variable::new("NEE", &[TIME, LAT, LON], data)
                .unwrap()
                .with_attr("units", "gC m-2 d-1")],
        )
        .unwrap();
        cube.attrs.insert("title".to_string(), Value::from("FLUXCOM-X-BASE NEE"));
        cube.rechunk(&[1, 2]).unwrap()
    }

    #[test]
    fn zarr_store_reads_back_written_cube() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(temp.path()).unwrap().join("NEE_monthly.zarr");
        let cube = sample();

        ZarrFormat.write(&cube, &path).unwrap();
        let read = ZarrFormat.read(&path).unwrap();
        assert_eq!(read, cube);
    }

    #[test]
    fn reading_missing_store_fails() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(temp.path()).unwrap().join("absent.zarr");
        assert!(ZarrFormat.read(&path).is_err());
    }

    #[cfg(not(feature = "netcdf"))]
    #[test]
    fn netcdf_requires_feature() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(temp.path()).unwrap().join("NEE.nc");
        let err = NetcdfFormat.write(&sample(), &path).unwrap_err();
        assert!(matches!(err, IcosdpError::UnsupportedFormat(_)));
        assert!(reader_for(TargetFormat::Netcdf).ensure_readable().is_err());
        assert!(writer_for(TargetFormat::Netcdf).ensure_writable().is_err());
        assert!(writer_for(TargetFormat::Zarr).ensure_writable().is_ok());
    }
}
