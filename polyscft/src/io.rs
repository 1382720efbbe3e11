use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::{class_error, ErrorClass};

/// Abstract dump-file writer.
///
/// Parallel HDF5 output is an external collaborator; the engine only
/// requires these four primitives. Datasets are written with their
/// global shape and row-major data; attributes are string-keyed
/// string values attached to a named dataset.
pub trait DumpWriter {
    fn open_file(&mut self, path: &Path) -> Result<()>;
    fn write_dataset(&mut self, name: &str, shape: &[usize], data: &[f64]) -> Result<()>;
    fn write_attribute(&mut self, dataset: &str, key: &str, value: &str) -> Result<()>;
    fn close_file(&mut self) -> Result<()>;
}

/// Abstract dump-file reader, the restore-side counterpart.
pub trait DumpReader {
    fn open_file(&mut self, path: &Path) -> Result<()>;
    fn read_dataset(&self, name: &str) -> Result<(Vec<usize>, Vec<f64>)>;
    fn close_file(&mut self) -> Result<()>;
}

/// Dump file name `<base>_<objectName>_<seq>.h5`.
pub fn dump_file_name(base: &str, object: &str, seq: usize) -> PathBuf {
    PathBuf::from(format!("{base}_{object}_{seq}.h5"))
}

/// History file name `<base>_History.h5`.
pub fn history_file_name(base: &str) -> PathBuf {
    PathBuf::from(format!("{base}_History.h5"))
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Dataset {
    shape: Vec<usize>,
    data: Vec<f64>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Document {
    datasets: BTreeMap<String, Dataset>,
}

/// JSON-document dump backend used by the binary and the tests. One
/// open file at a time; the document is flushed on `close_file`.
#[derive(Default)]
pub struct JsonDump {
    path: Option<PathBuf>,
    doc: Document,
}

impl JsonDump {
    pub fn new() -> Self {
        Self::default()
    }

    fn io_err(path: &Path, err: impl std::fmt::Display) -> anyhow::Error {
        class_error(ErrorClass::IoError, path.display().to_string(), err)
    }

    fn open_path(&self) -> Result<&Path> {
        self.path
            .as_deref()
            .ok_or_else(|| class_error(ErrorClass::IoError, "JsonDump", "no file is open"))
    }
}

impl DumpWriter for JsonDump {
    fn open_file(&mut self, path: &Path) -> Result<()> {
        self.path = Some(path.to_path_buf());
        self.doc = Document::default();
        Ok(())
    }

    fn write_dataset(&mut self, name: &str, shape: &[usize], data: &[f64]) -> Result<()> {
        self.open_path()?;
        self.doc.datasets.insert(
            name.to_string(),
            Dataset {
                shape: shape.to_vec(),
                data: data.to_vec(),
                attributes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn write_attribute(&mut self, dataset: &str, key: &str, value: &str) -> Result<()> {
        let path = self.open_path()?.to_path_buf();
        let entry = self.doc.datasets.get_mut(dataset).ok_or_else(|| {
            Self::io_err(&path, format!("attribute on unknown dataset {dataset:?}"))
        })?;
        entry.attributes.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn close_file(&mut self) -> Result<()> {
        let path = self.open_path()?.to_path_buf();
        let text =
            serde_json::to_string_pretty(&self.doc).map_err(|e| Self::io_err(&path, e))?;
        fs::write(&path, text).map_err(|e| Self::io_err(&path, e))?;
        self.path = None;
        self.doc = Document::default();
        Ok(())
    }
}

impl DumpReader for JsonDump {
    fn open_file(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|e| Self::io_err(path, e))?;
        let doc: Document =
            serde_json::from_str(&text).map_err(|e| Self::io_err(path, e))?;
        self.path = Some(path.to_path_buf());
        self.doc = doc;
        Ok(())
    }

    fn read_dataset(&self, name: &str) -> Result<(Vec<usize>, Vec<f64>)> {
        let path = self.open_path()?;
        let entry = self
            .doc
            .datasets
            .get(name)
            .ok_or_else(|| Self::io_err(path, format!("no dataset {name:?}")))?;
        Ok((entry.shape.clone(), entry.data.clone()))
    }

    fn close_file(&mut self) -> Result<()> {
        self.path = None;
        self.doc = Document::default();
        Ok(())
    }
}
