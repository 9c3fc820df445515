use crate::value::{HsRef, HsValue};
use std::sync::Arc;

/// One row of a tabular result: insertion-ordered named cells.
///
/// Cell order is preserved because consumers diff row fields against local
/// child nodes and the remote's column order is part of its contract.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    cells: Vec<(Arc<str>, HsValue)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_cells(cells: Vec<(Arc<str>, HsValue)>) -> Self {
        Self { cells }
    }

    pub fn with(mut self, name: impl Into<Arc<str>>, value: HsValue) -> Self {
        self.set(name, value);
        self
    }

    /// Insert or replace a cell by name.
    pub fn set(&mut self, name: impl Into<Arc<str>>, value: HsValue) {
        let name = name.into();
        if let Some(cell) = self.cells.iter_mut().find(|(n, _)| *n == name) {
            cell.1 = value;
        } else {
            self.cells.push((name, value));
        }
    }

    pub fn get(&self, name: &str) -> Option<&HsValue> {
        self.cells
            .iter()
            .find(|(n, _)| n.as_ref() == name)
            .map(|(_, v)| v)
    }

    /// The row's external reference id, when the `id` cell carries one.
    pub fn id(&self) -> Option<&HsRef> {
        self.get("id").and_then(HsValue::as_ref_id)
    }

    /// The row's display text, when present.
    pub fn dis(&self) -> Option<&str> {
        self.get("dis").and_then(HsValue::as_str)
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True when the named cell is present and is a marker.
    pub fn has_marker(&self, name: &str) -> bool {
        self.get(name).map(HsValue::is_marker).unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HsValue)> {
        self.cells.iter().map(|(n, v)| (n.as_ref(), v))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// A tabular result returned by remote operations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Grid {
    rows: Vec<Row>,
}

impl Grid {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// Build the one-cell request grid used by ops like `nav`.
    pub fn single(name: impl Into<Arc<str>>, value: HsValue) -> Self {
        Self {
            rows: vec![Row::new().with(name, value)],
        }
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<'a> IntoIterator for &'a Grid {
    type Item = &'a Row;
    type IntoIter = std::slice::Iter<'a, Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::HsRef;

    #[test]
    fn row_accessors() {
        let row = Row::new()
            .with("id", HsValue::Ref(HsRef::new("p.1")))
            .with("dis", HsValue::str("Pump 1"))
            .with("curVal", HsValue::num(3.2));
        assert_eq!(row.id().map(HsRef::as_str), Some("p.1"));
        assert_eq!(row.dis(), Some("Pump 1"));
        assert!(!row.has_marker("curVal"));
        assert_eq!(row.iter().count(), 3);
    }

    #[test]
    fn set_replaces_in_place() {
        let mut row = Row::new().with("curVal", HsValue::num(1.0));
        row.set("curVal", HsValue::num(2.0));
        assert_eq!(row.len(), 1);
        assert_eq!(row.get("curVal").and_then(HsValue::as_f64), Some(2.0));
    }
}
