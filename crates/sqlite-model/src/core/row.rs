use std::{collections::HashMap, sync::Arc};

use rusqlite::types::Value;
use serde_json::{json, Map};

use crate::error::{DbError, DbResult};

/// Ordered column-name list with an O(1) name lookup, built once when a
/// result set is materialized. Shared between a table and every row it
/// produced, so a row always resolves names through its originating table.
#[derive(Debug)]
pub struct Schema {
    names: Vec<String>,
    index: HashMap<String, usize>,
}

impl Schema {
    pub fn new(names: Vec<String>) -> Arc<Self> {
        let index = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i))
            .collect();
        Arc::new(Schema { names, index })
    }

    pub fn column_count(&self) -> usize {
        self.names.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }
}

/// One materialized row: raw values plus a handle to the schema of the
/// table that produced it.
#[derive(Debug, Clone)]
pub struct ResultRow {
    schema: Arc<Schema>,
    items: Vec<Value>,
}

impl ResultRow {
    fn blank(schema: Arc<Schema>) -> Self {
        let items = vec![Value::Null; schema.column_count()];
        ResultRow { schema, items }
    }

    fn from_sql_row(schema: Arc<Schema>, row: &rusqlite::Row<'_>) -> DbResult<Self> {
        let mut items = Vec::with_capacity(schema.column_count());
        for i in 0..schema.column_count() {
            items.push(row.get_ref(i)?.into());
        }
        Ok(ResultRow { schema, items })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn item(&self, index: usize) -> DbResult<&Value> {
        self.items
            .get(index)
            .ok_or_else(|| DbError::InvalidRequest(format!("column index out of range: {index}")))
    }

    pub fn named(&self, name: &str) -> DbResult<&Value> {
        self.try_named(name)
            .ok_or_else(|| DbError::InvalidRequest(format!("column not found: {name}")))
    }

    /// Value by column name, or `None` when the row's schema lacks it.
    pub fn try_named(&self, name: &str) -> Option<&Value> {
        self.schema.column_index(name).map(|i| &self.items[i])
    }

    pub fn set(&mut self, index: usize, value: Value) -> DbResult<()> {
        match self.items.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(DbError::InvalidRequest(format!(
                "column index out of range: {index}"
            ))),
        }
    }

    pub fn set_named(&mut self, name: &str, value: Value) -> DbResult<()> {
        match self.schema.column_index(name) {
            Some(i) => {
                self.items[i] = value;
                Ok(())
            }
            None => Err(DbError::InvalidRequest(format!("column not found: {name}"))),
        }
    }

    /// Name-keyed JSON view of the row (blob values are rendered as their
    /// lossy UTF-8 text).
    pub fn to_json(&self) -> serde_json::Value {
        let mut out = Map::with_capacity(self.items.len());
        for (name, value) in self.schema.names.iter().zip(&self.items) {
            let v = match value {
                Value::Null => serde_json::Value::Null,
                Value::Integer(i) => json!(i),
                Value::Real(r) => json!(r),
                Value::Text(t) => json!(t),
                Value::Blob(b) => json!(String::from_utf8_lossy(b)),
            };
            out.insert(name.clone(), v);
        }
        serde_json::Value::Object(out)
    }
}

/// A fully materialized, randomly indexable snapshot of a query result.
///
/// Construction drains the forward-only cursor to completion: the
/// underlying connection cannot issue another command while a cursor is
/// open, so materialization has to be eager.
#[derive(Debug)]
pub struct ResultTable {
    schema: Arc<Schema>,
    pub rows: Vec<ResultRow>,
}

impl ResultTable {
    pub fn new(schema: Arc<Schema>, rows: Vec<ResultRow>) -> Self {
        ResultTable { schema, rows }
    }

    /// Build a table directly from owned values (used for synthesized
    /// rowsets such as the structure snapshot).
    pub fn from_values(column_names: Vec<String>, values: Vec<Vec<Value>>) -> Self {
        let schema = Schema::new(column_names);
        let rows = values
            .into_iter()
            .map(|items| ResultRow {
                schema: Arc::clone(&schema),
                items,
            })
            .collect();
        ResultTable { schema, rows }
    }

    pub fn from_cursor(column_names: Vec<String>, rows: &mut rusqlite::Rows<'_>) -> DbResult<Self> {
        let schema = Schema::new(column_names);
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(ResultRow::from_sql_row(Arc::clone(&schema), row)?);
        }
        Ok(ResultTable { schema, rows: out })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn column_count(&self) -> usize {
        self.schema.column_count()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_names(&self) -> &[String] {
        self.schema.column_names()
    }

    pub fn column_index(&self, name: &str) -> DbResult<usize> {
        self.schema
            .column_index(name)
            .ok_or_else(|| DbError::InvalidRequest(format!("column not found: {name}")))
    }

    /// A blank same-schema row, not appended to `rows`.
    pub fn new_row(&self) -> ResultRow {
        ResultRow::blank(Arc::clone(&self.schema))
    }

    /// Schema-sharing sub-table of the rows matching `keep`.
    pub fn filter(&self, keep: impl Fn(&ResultRow) -> bool) -> ResultTable {
        ResultTable {
            schema: Arc::clone(&self.schema),
            rows: self.rows.iter().filter(|r| keep(r)).cloned().collect(),
        }
    }
}
