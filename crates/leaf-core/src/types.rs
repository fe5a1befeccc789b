//! Core type definitions shared by the dataset, training and export crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Ordered list of class names. The position of a name is its integer label.
///
/// Built once from the sorted subdirectory names of the training partition and
/// then handed, unchanged, to the loader, the checkpoint and the exporter.
/// There is intentionally no way to re-sort or mutate it after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ClassSet {
    names: Vec<String>,
}

impl ClassSet {
    /// Builds a class set from discovered directory names.
    ///
    /// Names are sorted lexicographically and deduplicated. At least two classes
    /// are required.
    pub fn from_directory_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();

        if names.len() < 2 {
            return Err(Error::Config(format!(
                "at least 2 classes are required, found {}",
                names.len()
            )));
        }

        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Label of a class name, if present.
    pub fn label_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Class name of a label, if in range.
    pub fn name_of(&self, label: usize) -> Option<&str> {
        self.names.get(label).map(String::as_str)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Represents an image sample with its label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageSample {
    /// Path to the image file
    pub path: PathBuf,
    /// Class label (index into the [`ClassSet`])
    pub label: usize,
}

impl ImageSample {
    /// Creates a new image sample
    pub fn new(path: PathBuf, label: usize) -> Self {
        Self { path, label }
    }
}

/// Data split type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataSplit {
    /// Training data
    Train,
    /// Validation data
    Validation,
}

impl DataSplit {
    /// Directory name of the split under the dataset root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            DataSplit::Train => "train",
            DataSplit::Validation => "val",
        }
    }
}

impl std::fmt::Display for DataSplit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSplit::Train => write!(f, "train"),
            DataSplit::Validation => write!(f, "validation"),
        }
    }
}
