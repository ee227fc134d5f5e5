//! Minimal columnar numeric frame. Missing values are `NaN`.

use serde::{Deserialize, Serialize};
use crate::error::{CvError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Frame {
    names: Vec<String>,
    columns: Vec<Vec<f64>>,
}

impl Frame {
    pub fn new(columns: Vec<(String, Vec<f64>)>) -> Result<Self> {
        let mut frame = Frame::default();
        for (name, values) in columns { frame.add_column(name, values)?; }
        Ok(frame)
    }

    pub fn names(&self) -> &[String] { &self.names }
    pub fn ncols(&self) -> usize { self.columns.len() }
    pub fn nrows(&self) -> usize { self.columns.first().map(|c| c.len()).unwrap_or(0) }

    pub fn index_of(&self, name: &str) -> Option<usize> { self.names.iter().position(|n| n == name) }

    pub fn column(&self, name: &str) -> Option<&[f64]> { self.index_of(name).map(|i| self.columns[i].as_slice()) }

    pub fn column_at(&self, idx: usize) -> &[f64] { &self.columns[idx] }

    pub fn column_mut(&mut self, idx: usize) -> &mut Vec<f64> { &mut self.columns[idx] }

    pub fn add_column(&mut self, name: impl Into<String>, values: Vec<f64>) -> Result<()> {
        let name = name.into();
        if self.index_of(&name).is_some() { return Err(CvError::Configuration(format!("duplicate column `{name}`"))); }
        if !self.columns.is_empty() && values.len() != self.nrows() {
            return Err(CvError::Configuration(format!("column `{name}` has {} rows, frame has {}", values.len(), self.nrows())));
        }
        self.names.push(name);
        self.columns.push(values);
        Ok(())
    }

    pub fn select_rows(&self, rows: &[usize]) -> Frame {
        Frame {
            names: self.names.clone(),
            columns: self.columns.iter().map(|c| rows.iter().map(|&r| c[r]).collect()).collect(),
        }
    }
}
