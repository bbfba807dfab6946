use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::errors::{DreamError, DreamResult};
use dream_data::internal::*;

/// Class names of a classifier, in output order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClassTable {
    classes: Vec<String>,
}

impl ClassTable {
    /// One label per line. Blank lines are skipped.
    pub fn for_reader<R: Read>(r: R) -> DreamResult<ClassTable> {
        let mut classes = vec![];
        for line in BufReader::new(r).lines() {
            let line = line?;
            let label = line.trim();
            if !label.is_empty() {
                classes.push(label.to_string());
            }
        }
        Ok(ClassTable { classes })
    }

    pub fn for_path<P: AsRef<Path>>(p: P) -> DreamResult<ClassTable> {
        let p = p.as_ref();
        let file = std::fs::File::open(p)
            .with_context(|| format!("Opening class labels {:?}", p))?;
        Self::for_reader(file)
    }

    /// Index of a label, or `LabelNotFound` listing every class.
    pub fn index_of(&self, label: &str) -> DreamResult<usize> {
        self.classes.iter().position(|c| c == label).ok_or_else(|| {
            DreamError::LabelNotFound { label: label.to_string(), classes: self.classes.clone() }
                .into()
        })
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(|s| &**s)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for ClassTable {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> ClassTable {
        ClassTable { classes: iter.into_iter().map(Into::into).collect() }
    }
}
