//! Flat-ntuple column binding and Parquet output.
//!
//! A [`FlatNtuple`] is an ordered set of named columns, each bound to a
//! [`UnaryFunc`]. Filling evaluates every binding against the same object
//! and appends one row, so a column set configured from accessor-chain
//! strings and one built from closures behave identically. Rows are written
//! out as a single Arrow record batch in a Parquet file.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;

use crate::accessor::{FieldAccess, FieldValue, UnaryFunc};
use crate::{EgHltError, EgHltResult};

fn expand_output_path(file_path: &str) -> EgHltResult<PathBuf> {
    Ok(PathBuf::from(&*shellexpand::full(file_path)?))
}

/// Storage type of an ntuple column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 64-bit float; accepts int, float and bool values
    F64,
    /// 64-bit integer; accepts int and bool values
    I64,
}

#[derive(Debug, Clone)]
enum ColumnData {
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl ColumnData {
    fn new(column_type: ColumnType) -> Self {
        match column_type {
            ColumnType::F64 => ColumnData::F64(Vec::new()),
            ColumnType::I64 => ColumnData::I64(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        match self {
            ColumnData::F64(values) => values.len(),
            ColumnData::I64(values) => values.len(),
        }
    }
}

/// One output column: a name, a storage type and the binding producing its
/// value.
#[derive(Debug, Clone)]
pub struct ColumnVar {
    name: String,
    func: UnaryFunc,
    data: ColumnData,
}

#[derive(Debug, Clone, Copy)]
enum Cell {
    F64(f64),
    I64(i64),
}

impl ColumnVar {
    fn evaluate(&self, obj: &dyn FieldAccess) -> EgHltResult<Cell> {
        let value = self.func.eval(obj)?;
        self.coerce(value)
    }

    fn coerce(&self, value: FieldValue) -> EgHltResult<Cell> {
        let cell = match self.data {
            ColumnData::F64(_) => value.as_f64().map(Cell::F64),
            ColumnData::I64(_) => value.as_i64().map(Cell::I64),
        };
        cell.ok_or_else(|| EgHltError::InvalidColumnValue {
            name: self.name.clone(),
            datatype: value.kind().to_string(),
        })
    }

    fn store(&mut self, cell: Cell) {
        match (&mut self.data, cell) {
            (ColumnData::F64(values), Cell::F64(value)) => values.push(value),
            (ColumnData::I64(values), Cell::I64(value)) => values.push(value),
            // coerce() already matched the cell to the column type
            _ => unreachable!("cell type mismatch"),
        }
    }

    /// The column name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// An ordered set of bound output columns.
#[derive(Debug, Clone, Default)]
pub struct FlatNtuple {
    columns: Vec<ColumnVar>,
}

impl FlatNtuple {
    /// Create an empty ntuple.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column bound to an arbitrary [`UnaryFunc`].
    ///
    /// Fails on a duplicate name or after rows have been filled.
    pub fn add_column(
        &mut self,
        name: impl Into<String>,
        column_type: ColumnType,
        func: UnaryFunc,
    ) -> EgHltResult<()> {
        let name = name.into();
        if self.columns.iter().any(|column| column.name == name) {
            return Err(EgHltError::Custom(format!(
                "Column \"{name}\" is already booked"
            )));
        }
        if self.n_rows() != 0 {
            return Err(EgHltError::Custom(format!(
                "Cannot book column \"{name}\" after filling has started"
            )));
        }
        self.columns.push(ColumnVar {
            name,
            func,
            data: ColumnData::new(column_type),
        });
        Ok(())
    }

    /// Add a column bound to an accessor chain.
    pub fn add_chain_column(
        &mut self,
        name: impl Into<String>,
        column_type: ColumnType,
        chain: &str,
    ) -> EgHltResult<()> {
        self.add_column(name, column_type, UnaryFunc::chain(chain)?)
    }

    /// Number of filled rows.
    pub fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, |column| column.data.len())
    }

    /// Column names in booking order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|column| column.name.as_str())
    }

    /// Evaluate every binding against `obj` and append one row.
    ///
    /// All bindings are evaluated and coerced before anything is stored, so
    /// a failing binding leaves the row counts consistent.
    pub fn fill(&mut self, obj: &dyn FieldAccess) -> EgHltResult<()> {
        let mut row = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            row.push(column.evaluate(obj)?);
        }
        for (column, cell) in self.columns.iter_mut().zip(row) {
            column.store(cell);
        }
        Ok(())
    }

    fn schema(&self) -> Schema {
        Schema::new(
            self.columns
                .iter()
                .map(|column| {
                    let data_type = match column.data {
                        ColumnData::F64(_) => DataType::Float64,
                        ColumnData::I64(_) => DataType::Int64,
                    };
                    Field::new(column.name.clone(), data_type, false)
                })
                .collect::<Vec<_>>(),
        )
    }

    /// Write all rows to a Parquet file as one record batch.
    pub fn write_parquet(&self, file_path: &str) -> EgHltResult<()> {
        let path = expand_output_path(file_path)?;
        let schema = Arc::new(self.schema());
        let arrays: Vec<ArrayRef> = self
            .columns
            .iter()
            .map(|column| match &column.data {
                ColumnData::F64(values) => {
                    Arc::new(Float64Array::from(values.clone())) as ArrayRef
                }
                ColumnData::I64(values) => Arc::new(Int64Array::from(values.clone())) as ArrayRef,
            })
            .collect();
        let batch = RecordBatch::try_new(schema.clone(), arrays)?;
        let file = File::create(&path)?;
        let mut writer = ArrowWriter::try_new(file, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }
}
