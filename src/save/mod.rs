//! Measurement persistence: the JSON + array-sidecar document walk.
//!
//! A measurement's state is captured as a [`Document`] tree: scalars, strings,
//! small lists, nested dictionaries, nested sub-objects, and numeric arrays.
//! [`Saver::save`] walks the tree and splits it in two:
//!
//! - `<stem>.json` holds everything except arrays; array positions are
//!   nulled so the JSON stays small and diffable.
//! - `<stem>.h5` holds the arrays in an HDF5 hierarchy mirroring the tree:
//!   dictionaries become groups, sub-objects become groups whose names carry
//!   a `!` prefix (plus a `class` attribute naming the type).
//!
//! Invariant: the two files together reconstruct the full document. This is
//! checked by reloading immediately after every save. After a verified local
//! save the pair is mirrored to the network share, best-effort, with a
//! checksum comparison (see [`mirror`]).
//!
//! [`Saver::load`] reverses the walk: JSON is decoded first (with an option
//! to null out unwanted keys, e.g. stale instrument handles in old files),
//! then the array sidecar is walked to refill array-valued fields.

pub mod h5;
pub mod mirror;

use crate::config::Settings;
use crate::error::{LabError, LabResult};
use log::info;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Reserved JSON key marking a sub-object and carrying its class name.
pub const CLASS_KEY: &str = "!class";

/// One node of a measurement document.
#[derive(Debug, Clone)]
pub enum DocNode {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Small heterogeneous list; stays in the JSON file.
    List(Vec<DocNode>),
    /// 1-D numeric array; goes to the array sidecar.
    Array1(Vec<f64>),
    /// 2-D numeric array, row-major; goes to the array sidecar.
    Array2(Vec<Vec<f64>>),
    /// Plain dictionary; mirrored as a group in the sidecar.
    Dict(BTreeMap<String, DocNode>),
    /// Nested sub-object; mirrored as a `!`-prefixed group.
    Object(Document),
}

/// Empty arrays carry no dimensionality through the files (the JSON side
/// nulls them and the sidecar skips them), so equality treats `Null` and
/// empty arrays as the same thing. Everything else compares structurally.
impl PartialEq for DocNode {
    fn eq(&self, other: &Self) -> bool {
        use DocNode::*;
        fn is_empty_slot(node: &DocNode) -> bool {
            match node {
                Null => true,
                Array1(v) => v.is_empty(),
                Array2(v) => v.is_empty(),
                _ => false,
            }
        }
        match (self, other) {
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Array1(a), Array1(b)) if !a.is_empty() || !b.is_empty() => a == b,
            (Array2(a), Array2(b)) if !a.is_empty() || !b.is_empty() => a == b,
            (Dict(a), Dict(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            (a, b) => is_empty_slot(a) && is_empty_slot(b),
        }
    }
}

/// A class-tagged tree of measurement state.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub class: String,
    pub fields: BTreeMap<String, DocNode>,
}

impl Document {
    pub fn new(class: &str) -> Self {
        Self {
            class: class.to_string(),
            fields: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, node: DocNode) {
        self.fields.insert(key.to_string(), node);
    }

    pub fn set_f64(&mut self, key: &str, value: f64) {
        self.set(key, DocNode::Float(value));
    }

    pub fn set_int(&mut self, key: &str, value: i64) {
        self.set(key, DocNode::Int(value));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set(key, DocNode::Bool(value));
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.set(key, DocNode::Str(value.to_string()));
    }

    pub fn set_opt_f64(&mut self, key: &str, value: Option<f64>) {
        self.set(key, value.map(DocNode::Float).unwrap_or(DocNode::Null));
    }

    pub fn set_array1(&mut self, key: &str, values: &[f64]) {
        self.set(key, DocNode::Array1(values.to_vec()));
    }

    pub fn set_array2(&mut self, key: &str, values: &[Vec<f64>]) {
        self.set(key, DocNode::Array2(values.to_vec()));
    }

    pub fn set_object(&mut self, key: &str, doc: Document) {
        self.set(key, DocNode::Object(doc));
    }

    pub fn get(&self, key: &str) -> Option<&DocNode> {
        self.fields.get(key)
    }

    pub fn f64(&self, key: &str) -> Option<f64> {
        match self.get(key)? {
            DocNode::Float(v) => Some(*v),
            DocNode::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.get(key)? {
            DocNode::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            DocNode::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn str(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            DocNode::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn array1(&self, key: &str) -> Option<&[f64]> {
        match self.get(key)? {
            DocNode::Array1(v) => Some(v),
            _ => None,
        }
    }

    pub fn array2(&self, key: &str) -> Option<&[Vec<f64>]> {
        match self.get(key)? {
            DocNode::Array2(v) => Some(v),
            _ => None,
        }
    }

    pub fn object(&self, key: &str) -> Option<&Document> {
        match self.get(key)? {
            DocNode::Object(d) => Some(d),
            _ => None,
        }
    }

    /// Render the JSON side of the document: arrays become null.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert(CLASS_KEY.to_string(), Value::String(self.class.clone()));
        for (key, node) in &self.fields {
            map.insert(key.clone(), node.to_json());
        }
        Value::Object(map)
    }

    /// Reject NaN/infinite floats anywhere in the tree. serde_json renders
    /// them as `null`, which would only surface later as a round-trip
    /// mismatch; failing here names the offending field instead.
    fn check_finite(&self) -> LabResult<()> {
        check_finite_fields(&self.fields, "")
    }

    /// Decode the JSON side. Array positions come back as `Null` until the
    /// sidecar walk refills them. Fields named in `skip_keys` are nulled at
    /// any depth before assembly.
    pub fn from_json(value: &Value, skip_keys: &[String]) -> LabResult<Document> {
        match value {
            Value::Object(map) if map.contains_key(CLASS_KEY) => {
                let class = map
                    .get(CLASS_KEY)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        LabError::Persistence(format!("'{CLASS_KEY}' must be a string"))
                    })?
                    .to_string();
                let mut fields = BTreeMap::new();
                for (key, v) in map {
                    if key == CLASS_KEY {
                        continue;
                    }
                    let node = if skip_keys.iter().any(|k| k == key) {
                        DocNode::Null
                    } else {
                        DocNode::from_json(v, skip_keys)?
                    };
                    fields.insert(key.clone(), node);
                }
                Ok(Document { class, fields })
            }
            _ => Err(LabError::Persistence(
                "Document root must be an object with a '!class' tag".to_string(),
            )),
        }
    }
}

impl DocNode {
    fn to_json(&self) -> Value {
        match self {
            DocNode::Null => Value::Null,
            DocNode::Bool(b) => Value::Bool(*b),
            DocNode::Int(i) => Value::from(*i),
            DocNode::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            DocNode::Str(s) => Value::String(s.clone()),
            DocNode::List(items) => Value::Array(items.iter().map(DocNode::to_json).collect()),
            // Arrays live in the sidecar; the JSON side records only the slot.
            DocNode::Array1(_) | DocNode::Array2(_) => Value::Null,
            DocNode::Dict(map) => {
                let mut out = serde_json::Map::new();
                for (key, node) in map {
                    out.insert(key.clone(), node.to_json());
                }
                Value::Object(out)
            }
            DocNode::Object(doc) => doc.to_json(),
        }
    }

    pub(crate) fn from_json(value: &Value, skip_keys: &[String]) -> LabResult<DocNode> {
        Ok(match value {
            Value::Null => DocNode::Null,
            Value::Bool(b) => DocNode::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    DocNode::Int(i)
                } else {
                    DocNode::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => DocNode::Str(s.clone()),
            Value::Array(items) => DocNode::List(
                items
                    .iter()
                    .map(|v| DocNode::from_json(v, skip_keys))
                    .collect::<LabResult<_>>()?,
            ),
            Value::Object(map) if map.contains_key(CLASS_KEY) => {
                DocNode::Object(Document::from_json(value, skip_keys)?)
            }
            Value::Object(map) => {
                let mut out = BTreeMap::new();
                for (key, v) in map {
                    let node = if skip_keys.iter().any(|k| k == key) {
                        DocNode::Null
                    } else {
                        DocNode::from_json(v, skip_keys)?
                    };
                    out.insert(key.clone(), node);
                }
                DocNode::Dict(out)
            }
        })
    }
}

fn check_finite_fields(fields: &BTreeMap<String, DocNode>, path: &str) -> LabResult<()> {
    for (key, node) in fields {
        let sub = if path.is_empty() {
            key.clone()
        } else {
            format!("{path}.{key}")
        };
        check_finite_node(node, &sub)?;
    }
    Ok(())
}

fn check_finite_node(node: &DocNode, path: &str) -> LabResult<()> {
    let bad = || LabError::Persistence(format!("non-finite value in field '{path}'"));
    match node {
        DocNode::Float(v) if !v.is_finite() => Err(bad()),
        DocNode::Array1(values) if values.iter().any(|v| !v.is_finite()) => Err(bad()),
        DocNode::Array2(rows) if rows.iter().flatten().any(|v| !v.is_finite()) => Err(bad()),
        DocNode::List(items) => items
            .iter()
            .try_for_each(|item| check_finite_node(item, path)),
        DocNode::Dict(map) => check_finite_fields(map, path),
        DocNode::Object(doc) => check_finite_fields(&doc.fields, path),
        _ => Ok(()),
    }
}

/// Options for [`Saver::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Field names to null out at any depth before assembly. Used to drop
    /// keys that no longer deserialize, typically instrument handles written
    /// by older software.
    pub skip_keys: Vec<String>,
}

/// Paths written by one save.
#[derive(Debug, Clone)]
pub struct SavedPaths {
    pub json: PathBuf,
    pub arrays: PathBuf,
}

/// Writes and reads measurement documents under a data directory.
pub struct Saver {
    data_dir: PathBuf,
    mirror_dir: Option<PathBuf>,
}

impl Saver {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            mirror_dir: None,
        }
    }

    /// Mirror every save into `dir` (a network mount), best-effort.
    pub fn with_mirror(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mirror_dir = Some(dir.into());
        self
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let saver = Self::new(&settings.storage.data_dir);
        match &settings.storage.mirror_dir {
            Some(dir) => saver.with_mirror(dir),
            None => saver,
        }
    }

    fn json_path(&self, stem: &str) -> PathBuf {
        self.data_dir.join(format!("{stem}.json"))
    }

    fn arrays_path(&self, stem: &str) -> PathBuf {
        self.data_dir.join(format!("{stem}{}", h5::ARRAY_EXT))
    }

    /// Write the document pair, verify by reloading, then mirror.
    ///
    /// Verification failures leave the written files in place: the save is
    /// best-effort, not transactional.
    pub fn save(&self, stem: &str, doc: &Document) -> LabResult<SavedPaths> {
        doc.check_finite()?;
        fs::create_dir_all(&self.data_dir)?;
        let paths = SavedPaths {
            json: self.json_path(stem),
            arrays: self.arrays_path(stem),
        };

        let json = serde_json::to_string_pretty(&doc.to_json())?;
        fs::write(&paths.json, json)?;
        h5::write_arrays(&paths.arrays, doc)?;

        let reloaded = self
            .load(stem, &LoadOptions::default())
            .map_err(|e| LabError::ReloadAfterSave(e.to_string()))?;
        if &reloaded != doc {
            return Err(LabError::RoundTripMismatch(stem.to_string()));
        }

        if let Some(dir) = &self.mirror_dir {
            mirror::mirror_files(&[&paths.json, &paths.arrays], dir);
        }

        info!("Saved '{}' to {}", stem, paths.json.display());
        Ok(paths)
    }

    /// Reassemble a document from its JSON and array files.
    ///
    /// A missing array sidecar leaves array slots null rather than failing,
    /// so scalar state from partial saves remains readable.
    pub fn load(&self, stem: &str, options: &LoadOptions) -> LabResult<Document> {
        let text = fs::read_to_string(self.json_path(stem))?;
        let value: Value = serde_json::from_str(&text)?;
        let mut doc = Document::from_json(&value, &options.skip_keys)?;

        let arrays_path = self.arrays_path(stem);
        if arrays_path.exists() {
            h5::read_arrays_into(&arrays_path, &mut doc)?;
        } else {
            // An HDF5 sidecar from an hdf5-enabled build cannot be read by
            // this one; say so instead of silently dropping the arrays.
            #[cfg(not(feature = "storage_hdf5"))]
            if self.data_dir.join(format!("{stem}.h5")).exists() {
                return Err(LabError::FeatureNotEnabled("storage_hdf5".to_string()));
            }
            log::warn!(
                "No array sidecar at {}; array fields left null",
                arrays_path.display()
            );
        }
        Ok(doc)
    }
}
