//! Array sidecar backend.
//!
//! With the `storage_hdf5` feature the arrays of a [`Document`] are written to
//! a real HDF5 file whose group hierarchy mirrors the document tree: plain
//! dictionaries become groups, sub-objects become groups with a `!` prefix on
//! their name and a `class` attribute. Without the feature (native libhdf5 is
//! not always available on lab machines) the same tree is written as a JSON
//! sidecar with the extension below, using `!name` keys for object groups.
//!
//! Reading is the inverse walk: the document is assembled from the JSON file
//! first, then `read_arrays_into` descends both trees in lockstep and refills
//! the array-valued fields.

use crate::error::{LabError, LabResult};
use crate::save::{DocNode, Document};
use std::collections::BTreeMap;
use std::path::Path;

#[cfg(feature = "storage_hdf5")]
pub const ARRAY_EXT: &str = ".h5";
#[cfg(not(feature = "storage_hdf5"))]
pub const ARRAY_EXT: &str = ".arrays.json";

/// True if a subtree holds any array that needs a sidecar entry.
///
/// Empty arrays are skipped: they carry no data and no recoverable
/// dimensionality, and reload as null slots.
fn has_arrays(fields: &BTreeMap<String, DocNode>) -> bool {
    fields.values().any(|node| match node {
        DocNode::Array1(v) => !v.is_empty(),
        DocNode::Array2(v) => !v.is_empty(),
        DocNode::Dict(map) => has_arrays(map),
        DocNode::Object(doc) => has_arrays(&doc.fields),
        _ => false,
    })
}

#[cfg(not(feature = "storage_hdf5"))]
mod backend {
    use super::*;
    use serde_json::Value;
    use std::fs;

    fn encode_fields(fields: &BTreeMap<String, DocNode>) -> serde_json::Map<String, Value> {
        let mut out = serde_json::Map::new();
        for (name, node) in fields {
            match node {
                DocNode::Array1(values) if !values.is_empty() => {
                    out.insert(name.clone(), serde_json::json!(values));
                }
                DocNode::Array2(rows) if !rows.is_empty() => {
                    out.insert(name.clone(), serde_json::json!(rows));
                }
                DocNode::Dict(map) if has_arrays(map) => {
                    out.insert(name.clone(), Value::Object(encode_fields(map)));
                }
                DocNode::Object(doc) if has_arrays(&doc.fields) => {
                    out.insert(format!("!{name}"), Value::Object(encode_fields(&doc.fields)));
                }
                _ => {}
            }
        }
        out
    }

    pub fn write_arrays(path: &Path, doc: &Document) -> LabResult<()> {
        let tree = Value::Object(encode_fields(&doc.fields));
        fs::write(path, serde_json::to_string_pretty(&tree)?)?;
        Ok(())
    }

    fn decode_array(name: &str, value: &Value) -> LabResult<DocNode> {
        let items = value.as_array().ok_or_else(|| {
            LabError::Persistence(format!("sidecar entry '{name}' is not an array"))
        })?;
        let bad = || LabError::Persistence(format!("sidecar entry '{name}' is not numeric"));
        if items.iter().all(Value::is_number) {
            let row = items
                .iter()
                .map(|v| v.as_f64().ok_or_else(bad))
                .collect::<LabResult<Vec<f64>>>()?;
            return Ok(DocNode::Array1(row));
        }
        let rows = items
            .iter()
            .map(|row| {
                row.as_array()
                    .ok_or_else(bad)?
                    .iter()
                    .map(|v| v.as_f64().ok_or_else(bad))
                    .collect::<LabResult<Vec<f64>>>()
            })
            .collect::<LabResult<Vec<Vec<f64>>>>()?;
        Ok(DocNode::Array2(rows))
    }

    fn refill_fields(
        fields: &mut BTreeMap<String, DocNode>,
        map: &serde_json::Map<String, Value>,
    ) -> LabResult<()> {
        for (key, value) in map {
            if let Some(name) = key.strip_prefix('!') {
                match fields.get_mut(name) {
                    Some(DocNode::Object(doc)) => {
                        let sub = value.as_object().ok_or_else(|| {
                            LabError::Persistence(format!("sidecar group '{key}' is not a group"))
                        })?;
                        refill_fields(&mut doc.fields, sub)?;
                    }
                    _ => {
                        return Err(LabError::Persistence(format!(
                            "sidecar group '{key}' has no matching sub-object"
                        )))
                    }
                }
            } else if let Some(sub) = value.as_object() {
                match fields.get_mut(key) {
                    Some(DocNode::Dict(inner)) => refill_fields(inner, sub)?,
                    _ => {
                        return Err(LabError::Persistence(format!(
                            "sidecar group '{key}' has no matching dictionary"
                        )))
                    }
                }
            } else {
                fields.insert(key.clone(), decode_array(key, value)?);
            }
        }
        Ok(())
    }

    pub fn read_arrays_into(path: &Path, doc: &mut Document) -> LabResult<()> {
        let text = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        let map = value.as_object().ok_or_else(|| {
            LabError::Persistence("array sidecar root must be an object".to_string())
        })?;
        refill_fields(&mut doc.fields, map)
    }
}

#[cfg(feature = "storage_hdf5")]
mod backend {
    use super::*;
    use hdf5::types::VarLenUnicode;

    fn class_attr(group: &hdf5::Group, class: &str) -> LabResult<()> {
        let value: VarLenUnicode = class
            .parse()
            .map_err(|_| LabError::Persistence(format!("class name '{class}' is not unicode")))?;
        group
            .new_attr::<VarLenUnicode>()
            .create("class")
            .and_then(|a| a.write_scalar(&value))
            .map_err(|e| LabError::Persistence(format!("Failed to write class attribute: {e}")))?;
        Ok(())
    }

    fn write_group(group: &hdf5::Group, fields: &BTreeMap<String, DocNode>) -> LabResult<()> {
        let h5err =
            |name: &str, e: hdf5::Error| LabError::Persistence(format!("HDF5 '{name}': {e}"));
        for (name, node) in fields {
            match node {
                DocNode::Array1(values) if !values.is_empty() => {
                    group
                        .new_dataset_builder()
                        .with_data(values)
                        .create(name.as_str())
                        .map_err(|e| h5err(name, e))?;
                }
                DocNode::Array2(rows) if !rows.is_empty() => {
                    let ncols = rows.first().map(Vec::len).unwrap_or(0);
                    if rows.iter().any(|r| r.len() != ncols) {
                        return Err(LabError::Persistence(format!(
                            "2-D array '{name}' is ragged"
                        )));
                    }
                    let flat: Vec<f64> = rows.iter().flatten().copied().collect();
                    let arr = ndarray::Array2::from_shape_vec((rows.len(), ncols), flat)
                        .map_err(|e| LabError::Persistence(format!("'{name}': {e}")))?;
                    group
                        .new_dataset_builder()
                        .with_data(&arr)
                        .create(name.as_str())
                        .map_err(|e| h5err(name, e))?;
                }
                DocNode::Dict(map) if has_arrays(map) => {
                    let sub = group.create_group(name).map_err(|e| h5err(name, e))?;
                    write_group(&sub, map)?;
                }
                DocNode::Object(doc) if has_arrays(&doc.fields) => {
                    let group_name = format!("!{name}");
                    let sub = group
                        .create_group(&group_name)
                        .map_err(|e| h5err(&group_name, e))?;
                    class_attr(&sub, &doc.class)?;
                    write_group(&sub, &doc.fields)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn write_arrays(path: &Path, doc: &Document) -> LabResult<()> {
        let file = hdf5::File::create(path)
            .map_err(|e| LabError::Persistence(format!("Failed to create HDF5 file: {e}")))?;
        let root = file
            .as_group()
            .map_err(|e| LabError::Persistence(format!("HDF5 root: {e}")))?;
        write_group(&root, &doc.fields)
    }

    fn read_group(group: &hdf5::Group, fields: &mut BTreeMap<String, DocNode>) -> LabResult<()> {
        let h5err =
            |name: &str, e: hdf5::Error| LabError::Persistence(format!("HDF5 '{name}': {e}"));

        for name in group.member_names().map_err(|e| h5err("/", e))? {
            if let Ok(sub) = group.group(&name) {
                if let Some(field) = name.strip_prefix('!') {
                    match fields.get_mut(field) {
                        Some(DocNode::Object(doc)) => read_group(&sub, &mut doc.fields)?,
                        _ => {
                            return Err(LabError::Persistence(format!(
                                "HDF5 group '{name}' has no matching sub-object"
                            )))
                        }
                    }
                } else {
                    match fields.get_mut(&name) {
                        Some(DocNode::Dict(inner)) => read_group(&sub, inner)?,
                        _ => {
                            return Err(LabError::Persistence(format!(
                                "HDF5 group '{name}' has no matching dictionary"
                            )))
                        }
                    }
                }
                continue;
            }

            let dataset = group.dataset(&name).map_err(|e| h5err(&name, e))?;
            let node = match dataset.ndim() {
                1 => {
                    let values = dataset.read_raw::<f64>().map_err(|e| h5err(&name, e))?;
                    DocNode::Array1(values)
                }
                2 => {
                    let arr = dataset.read_2d::<f64>().map_err(|e| h5err(&name, e))?;
                    DocNode::Array2(arr.outer_iter().map(|row| row.to_vec()).collect())
                }
                n => {
                    return Err(LabError::Persistence(format!(
                        "HDF5 dataset '{name}' has unsupported rank {n}"
                    )))
                }
            };
            fields.insert(name, node);
        }
        Ok(())
    }

    pub fn read_arrays_into(path: &Path, doc: &mut Document) -> LabResult<()> {
        let file = hdf5::File::open(path)
            .map_err(|e| LabError::Persistence(format!("Failed to open HDF5 file: {e}")))?;
        let root = file
            .as_group()
            .map_err(|e| LabError::Persistence(format!("HDF5 root: {e}")))?;
        read_group(&root, &mut doc.fields)
    }
}

pub use backend::{read_arrays_into, write_arrays};

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_arrays() -> Document {
        let mut inner = Document::new("Plane");
        inner.set_array1("residuals", &[0.1, -0.1, 0.0]);
        inner.set_f64("a", 1.0);

        let mut dict = BTreeMap::new();
        dict.insert("cap".to_string(), DocNode::Array1(vec![4.0, 5.0]));

        let mut doc = Document::new("Touchdown");
        doc.set_array1("z", &[0.0, 1.0, 2.0]);
        doc.set_array2("grid", &[vec![1.0, 2.0], vec![3.0, 4.0]]);
        doc.set_object("plane", inner);
        doc.set("extra", DocNode::Dict(dict));
        doc.set_str("note", "scalar, stays out of the sidecar");
        doc
    }

    #[test]
    fn sidecar_round_trips_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("run{ARRAY_EXT}"));
        let doc = doc_with_arrays();
        write_arrays(&path, &doc).unwrap();

        // Start from the nulled JSON view, as load does.
        let mut reloaded =
            Document::from_json(&doc.to_json(), &[]).unwrap();
        read_arrays_into(&path, &mut reloaded).unwrap();
        assert_eq!(reloaded, doc);
    }

    #[test]
    fn empty_subtrees_are_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("run{ARRAY_EXT}"));
        let mut doc = Document::new("SquidIv");
        doc.set_f64("rate", 100.0);
        doc.set_object("plain", Document::new("Inner"));
        write_arrays(&path, &doc).unwrap();

        let mut reloaded = Document::from_json(&doc.to_json(), &[]).unwrap();
        read_arrays_into(&path, &mut reloaded).unwrap();
        assert_eq!(reloaded, doc);
    }
}
