//! Raster Attribute Table columns (spec §3 supplement, grounded on
//! `rat.py`'s `readColumnFromBand`/`writeColumnToBand`).
//!
//! A RAT associates one row per raster value (typically a thematic
//! classification) with one or more named columns of integer, real or
//! string data. This module gives that a typed, in-memory form the
//! engine can read from and write back to a [`crate::raster::RasterDataset`]
//! without going through the driver's untyped column API at every call
//! site.

use crate::error::RiosError;

/// A single RAT column's values, one row-typed variant per GDAL column
/// type (`GFT_Integer`, `GFT_Real`, `GFT_String`).
#[derive(Debug, Clone, PartialEq)]
pub enum RatColumn {
    Integer(Vec<i64>),
    Real(Vec<f64>),
    String(Vec<String>),
}

impl RatColumn {
    pub fn len(&self) -> usize {
        match self {
            RatColumn::Integer(v) => v.len(),
            RatColumn::Real(v) => v.len(),
            RatColumn::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RatColumn::Integer(_) => "integer",
            RatColumn::Real(_) => "real",
            RatColumn::String(_) => "string",
        }
    }
}

/// A usage hint for a column, mirroring GDAL's `GFU_*` constants that
/// matter to RIOS-style callers (red/green/blue/alpha/pixel-count/name).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnUsage {
    #[default]
    Generic,
    PixelCount,
    Name,
    Red,
    Green,
    Blue,
    Alpha,
}

/// An in-memory attribute table for one raster band: named columns, all
/// sharing a common row count.
#[derive(Debug, Clone, Default)]
pub struct AttributeTable {
    columns: Vec<(String, ColumnUsage, RatColumn)>,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(|(_, _, col)| col.len()).unwrap_or(0)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _, _)| name.as_str())
    }

    /// Add or replace a column. Rejects a column whose length doesn't
    /// match the table's existing row count (spec §7
    /// `RatBlockLengthError`).
    pub fn set_column(&mut self, name: impl Into<String>, usage: ColumnUsage, values: RatColumn) -> Result<(), RiosError> {
        let name = name.into();
        if let Some(expected) = self.columns.first().map(|(_, _, c)| c.len()) {
            if values.len() != expected {
                return Err(RiosError::RatBlockLength {
                    expected,
                    actual: values.len(),
                });
            }
        }
        if let Some(existing) = self.columns.iter_mut().find(|(n, _, _)| *n == name) {
            existing.1 = usage;
            existing.2 = values;
        } else {
            self.columns.push((name, usage, values));
        }
        Ok(())
    }

    /// Read a column by name (spec supplement's `readColumnFromBand`).
    pub fn column(&self, name: &str) -> Result<&RatColumn, RiosError> {
        self.columns
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, _, c)| c)
            .ok_or_else(|| RiosError::RatColumn {
                column: name.to_string(),
                reason: "no such column".to_string(),
            })
    }

    pub fn column_of_usage(&self, usage: ColumnUsage) -> Option<&RatColumn> {
        self.columns.iter().find(|(_, u, _)| *u == usage).map(|(_, _, c)| c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_read_column_round_trips() {
        let mut rat = AttributeTable::new();
        rat.set_column("Histogram", ColumnUsage::PixelCount, RatColumn::Integer(vec![0, 10, 20]))
            .unwrap();
        rat.set_column(
            "ClassName",
            ColumnUsage::Name,
            RatColumn::String(vec!["bg".into(), "water".into(), "forest".into()]),
        )
        .unwrap();

        assert_eq!(rat.num_rows(), 3);
        assert_eq!(rat.column("Histogram").unwrap().type_name(), "integer");
        assert!(matches!(rat.column_of_usage(ColumnUsage::Name), Some(RatColumn::String(_))));
    }

    #[test]
    fn mismatched_length_column_is_rejected() {
        let mut rat = AttributeTable::new();
        rat.set_column("a", ColumnUsage::Generic, RatColumn::Integer(vec![1, 2, 3])).unwrap();
        let err = rat.set_column("b", ColumnUsage::Generic, RatColumn::Integer(vec![1, 2]));
        assert!(matches!(err, Err(RiosError::RatBlockLength { expected: 3, actual: 2 })));
    }

    #[test]
    fn unknown_column_name_is_an_error() {
        let rat = AttributeTable::new();
        assert!(rat.column("missing").is_err());
    }
}
