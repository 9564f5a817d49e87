use std::sync::Arc;

use rusqlite::types::Value;

use crate::{
    core::{
        column::{text_of, Column, ColumnType, RowError, RuleKind},
        connection::Shared,
        row::{ResultRow, ResultTable},
    },
    error::{DbError, DbResult},
};

/// Declared type names recognized as strings.
const TYPES_OF_STRING: [&str; 9] = [
    "CHAR",
    "LONGTEXT",
    "MEDIUMTEXT",
    "NCHAR",
    "NTEXT",
    "NVARCHAR",
    "TEXT",
    "TINYTEXT",
    "VARCHAR",
];

/// Declared type names recognized as numbers.
const TYPES_OF_NUMBER: [&str; 14] = [
    "BIGINT",
    "BIT",
    "DECIMAL",
    "DOUBLE",
    "FLOAT",
    "INT",
    "INTEGER",
    "MEDIUMINT",
    "MONEY",
    "NUMERIC",
    "REAL",
    "SMALLINT",
    "SMALLMONEY",
    "TINYINT",
];

/// Declared type names recognized as date/times.
const TYPES_OF_DATETIME: [&str; 3] = ["DATETIME", "DATE", "TIME"];

/// Per-table facade: column metadata derived once from the structure
/// rowset, plus CRUD and reconciliation against the live connection.
///
/// Operations that mutate rows return `Vec<RowError>` (empty = success);
/// I/O failures propagate as `DbError`.
pub struct Model {
    shared: Arc<Shared>,
    table_name: String,
    columns: Vec<Column>,
    pkey_indexes: Vec<usize>,
    template: ResultTable,
}

impl Model {
    /// Build a model from the structure rows of one table.
    pub(crate) fn build(shared: Arc<Shared>, info: &ResultTable) -> DbResult<Model> {
        if info.row_count() == 0 || info.column_count() == 0 {
            return Err(DbError::InvalidRequest("table information not found".into()));
        }

        let table_name = text_of(info.rows[0].named("TABLE_NAME")?);

        let mut columns = Vec::with_capacity(info.row_count());
        let mut pkey_indexes = Vec::new();

        for row in &info.rows {
            let type_name = text_of(row.named("TYPE")?).to_uppercase();

            let (column_type, max_length, max_integer, max_decimal) =
                if TYPES_OF_NUMBER.contains(&type_name.as_str()) {
                    let precision = int_of(row.try_named("NUM_PREC"));
                    let scale = int_of(row.try_named("NUM_SCALE"));
                    let max_integer = precision - scale;
                    let max_length = max_integer
                        + scale
                        + 1 // minus sign
                        + if scale > 0 { 1 } else { 0 }; // decimal point
                    (ColumnType::Number, max_length, max_integer, scale)
                } else if TYPES_OF_STRING.contains(&type_name.as_str()) {
                    // Unbounded text types carry no usable length.
                    let max_length = match row.try_named("CHAR_LENGTH") {
                        Some(Value::Integer(n)) => *n,
                        _ => i64::MAX,
                    };
                    (ColumnType::String, max_length, -1, -1)
                } else if TYPES_OF_DATETIME.contains(&type_name.as_str()) {
                    (ColumnType::DateTime, 21, -1, -1)
                } else {
                    (ColumnType::Others, -1, -1, -1)
                };

            let is_pkey = flag_of(row.try_named("IS_PRIMARY_KEY"));
            let is_nullable = flag_of(row.try_named("IS_NULLABLE"));

            if is_pkey {
                pkey_indexes.push(columns.len());
            }
            columns.push(Column::new(
                text_of(row.named("COLUMN_NAME")?),
                max_length,
                max_integer,
                max_decimal,
                column_type,
                is_pkey,
                is_nullable,
            ));
        }

        // One empty-result query captures the template schema for new_row.
        let template = shared.query(&format!("SELECT * FROM {table_name} WHERE 1 = 0"), &[])?;

        Ok(Model {
            shared,
            table_name,
            columns,
            pkey_indexes,
            template,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Primary-key columns in declared order.
    pub fn pkey_columns(&self) -> impl Iterator<Item = &Column> {
        self.pkey_indexes.iter().map(|&i| &self.columns[i])
    }

    pub fn column(&self, name: &str) -> DbResult<&Column> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DbError::InvalidRequest(format!("column not found: {name}")))
    }

    pub fn column_at(&self, index: usize) -> DbResult<&Column> {
        self.columns
            .get(index)
            .ok_or_else(|| DbError::InvalidRequest(format!("column index out of range: {index}")))
    }

    /// First row matching the primary key values, in declared key order.
    pub fn find(&self, pkey_values: &[Value]) -> DbResult<Option<ResultRow>> {
        if self.pkey_indexes.is_empty() {
            return Err(DbError::InvalidRequest(format!(
                "{}: table has no primary key",
                self.table_name
            )));
        }
        if pkey_values.len() != self.pkey_indexes.len() {
            return Err(DbError::InvalidRequest(format!(
                "{}: expected {} primary key values, got {}",
                self.table_name,
                self.pkey_indexes.len(),
                pkey_values.len()
            )));
        }

        let wheres: Vec<String> = self
            .pkey_columns()
            .zip(pkey_values)
            .map(|(col, value)| col.sql_formula(value, true))
            .collect();

        self.shared.find(&self.table_name, &wheres.join(" AND "))
    }

    pub fn find_all(
        &self,
        where_clause: Option<&str>,
        order_clause: Option<&str>,
    ) -> DbResult<ResultTable> {
        self.shared
            .find_all(&self.table_name, where_clause, order_clause)
    }

    /// A blank row bound to the cached template schema, not appended
    /// anywhere.
    pub fn new_row(&self) -> ResultRow {
        self.template.new_row()
    }

    /// Validate every model column present in the row's own schema.
    /// Columns the row does not carry are skipped, which permits partial
    /// projections. Accumulates; never short-circuits.
    pub fn validate(&self, row: &ResultRow) -> Vec<RowError> {
        let mut errors = Vec::new();
        for col in &self.columns {
            let Some(value) = row.try_named(&col.name) else {
                continue;
            };
            let kind = col.validate(value);
            if kind != RuleKind::NoError {
                errors.push(RowError::new(&col.name, null_format(Some(value)), kind));
            }
        }
        errors
    }

    /// INSERT the row. Does not validate; expects exactly one affected
    /// row.
    pub fn insert(&self, row: &ResultRow) -> DbResult<Vec<RowError>> {
        let targets: Vec<&Column> = self
            .columns
            .iter()
            .filter(|c| row.schema().contains(&c.name))
            .collect();

        let names: Vec<&str> = targets.iter().map(|c| c.name.as_str()).collect();
        let values: Vec<String> = targets
            .iter()
            .map(|c| c.sql_value(row.try_named(&c.name).unwrap_or(&Value::Null)))
            .collect();

        let sql = format!(
            "INSERT INTO {} ( {} ) VALUES ( {} )",
            self.table_name,
            names.join(", "),
            values.join(", ")
        );

        if self.shared.execute(&sql, &[])? != 1 {
            return Ok(vec![RowError::custom(format!("Insert failure: {sql}"))]);
        }
        Ok(Vec::new())
    }

    /// UPDATE the row. Key columns default to the primary key; excluded
    /// columns are dropped from the SET clause.
    pub fn update(
        &self,
        row: &ResultRow,
        key_columns: Option<&[&str]>,
        exclude_columns: &[&str],
    ) -> DbResult<Vec<RowError>> {
        let keys: Vec<&Column> = match key_columns {
            Some(names) => self
                .columns
                .iter()
                .filter(|c| names.contains(&c.name.as_str()))
                .collect(),
            None => self.pkey_columns().collect(),
        };

        if keys.is_empty() {
            return Ok(vec![RowError::custom("Key column not found")]);
        }

        let mut sets = Vec::new();
        let mut wheres = Vec::new();

        for col in &self.columns {
            if !row.schema().contains(&col.name) || exclude_columns.contains(&col.name.as_str()) {
                continue;
            }
            let value = row.try_named(&col.name).unwrap_or(&Value::Null);
            if keys.iter().any(|k| k.name == col.name) {
                wheres.push(col.sql_formula(value, true));
            } else {
                sets.push(col.sql_formula(value, false));
            }
        }

        if sets.is_empty() {
            return Ok(vec![RowError::custom("Update target value not found")]);
        }

        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            self.table_name,
            sets.join(" , "),
            wheres.join(" AND ")
        );
        self.shared.execute(&sql, &[])?;
        Ok(Vec::new())
    }

    /// DELETE rows matching the key columns. An explicit key-column list
    /// overrides the full primary key and need not cover all of it.
    pub fn delete(&self, row: &ResultRow, key_columns: &[&str]) -> DbResult<Vec<RowError>> {
        let keys: Vec<&Column> = if key_columns.is_empty() {
            self.pkey_columns().collect()
        } else {
            self.columns
                .iter()
                .filter(|c| key_columns.contains(&c.name.as_str()))
                .collect()
        };

        if keys.is_empty() {
            return Ok(vec![RowError::custom("Key column not found")]);
        }

        let wheres: Vec<String> = keys
            .iter()
            .map(|col| col.sql_formula(row.try_named(&col.name).unwrap_or(&Value::Null), true))
            .collect();

        let sql = format!(
            "DELETE FROM {} WHERE {}",
            self.table_name,
            wheres.join(" AND ")
        );
        self.shared.execute(&sql, &[])?;
        Ok(Vec::new())
    }

    /// Upsert: validate, probe for an existing row by primary key, then
    /// insert or update.
    ///
    /// The probe and the following write are not wrapped in a database
    /// transaction here; callers needing all-or-nothing semantics bracket
    /// the call with begin/commit on the connection manager.
    pub fn write(
        &self,
        row: &ResultRow,
        exclude_columns_on_update: &[&str],
    ) -> DbResult<Vec<RowError>> {
        let errors = self.validate(row);
        if !errors.is_empty() {
            return Ok(errors);
        }

        if self.pkey_indexes.is_empty() {
            return Ok(vec![RowError::custom("Write method needs Primary-Key")]);
        }

        let wheres: Vec<String> = self
            .pkey_columns()
            .map(|col| col.sql_formula(row.try_named(&col.name).unwrap_or(&Value::Null), true))
            .collect();

        let sql = format!(
            "SELECT 1 FROM {} WHERE {}",
            self.table_name,
            wheres.join(" AND ")
        );
        let probe = self.shared.query(&sql, &[])?;

        if probe.row_count() == 0 {
            self.insert(row)
        } else {
            self.update(row, None, exclude_columns_on_update)
        }
    }

    /// Reconcile the table toward `after`: write every `after` row in
    /// order (stopping at the first failure), then delete every `before`
    /// row whose primary-key tuple matches no `after` row. Key values are
    /// compared as strings with null treated as empty.
    pub fn replace_update(
        &self,
        after: &[ResultRow],
        before: Option<&[ResultRow]>,
        exclude_columns_on_update: &[&str],
    ) -> DbResult<Vec<RowError>> {
        for row in after {
            let errors = self.write(row, exclude_columns_on_update)?;
            if !errors.is_empty() {
                return Ok(errors);
            }
        }

        let Some(before) = before else {
            return Ok(Vec::new());
        };

        for row_before in before {
            let survives = after.iter().any(|row_after| {
                self.pkey_columns().all(|key| {
                    null_format(row_before.try_named(&key.name))
                        == null_format(row_after.try_named(&key.name))
                })
            });
            if survives {
                continue;
            }
            let errors = self.delete(row_before, &[])?;
            if !errors.is_empty() {
                return Ok(errors);
            }
        }

        Ok(Vec::new())
    }

    /// Table-pair form of [`Model::replace_update`].
    pub fn replace_update_tables(
        &self,
        after: &ResultTable,
        before: Option<&ResultTable>,
        exclude_columns_on_update: &[&str],
    ) -> DbResult<Vec<RowError>> {
        self.replace_update(
            &after.rows,
            before.map(|t| t.rows.as_slice()),
            exclude_columns_on_update,
        )
    }
}

/// String form with null (or a missing column) treated as empty.
fn null_format(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(v) => text_of(v),
    }
}

/// Integer reading of a structure-rowset cell; null or non-numeric text
/// count as zero.
fn int_of(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Integer(n)) => *n,
        Some(Value::Text(t)) => t.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Boolean flag cell: `1` or `true`, in any case.
fn flag_of(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Integer(n)) => *n == 1,
        Some(Value::Text(t)) => {
            let t = t.to_lowercase();
            t == "1" || t == "true"
        }
        _ => false,
    }
}
