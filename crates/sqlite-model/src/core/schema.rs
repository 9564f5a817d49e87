use std::path::Path;

use rusqlite::{types::Value, Connection, OpenFlags};

use crate::{
    core::{column::sql_quote, row::ResultTable},
    error::{DbError, DbResult},
};

/// Column names of the structure rowset every vendor must produce, one row
/// per column of every user table.
pub const STRUCTURE_COLUMNS: [&str; 10] = [
    "TABLE_NAME",
    "COLUMN_INDEX",
    "COLUMN_NAME",
    "TYPE",
    "CHAR_LENGTH",
    "NUM_PREC",
    "NUM_SCALE",
    "IS_PRIMARY_KEY",
    "IS_NULLABLE",
    "COMMENT",
];

/// Wildcard placement for LIKE literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikePosition {
    Before,
    After,
    Both,
    None,
}

/// Per-product capability surface: everything that differs between
/// database products lives behind this trait, and the generic execution
/// path depends on nothing else.
pub trait Vendor: Send + Sync {
    /// Open a live connection.
    fn open(&self, path: &Path) -> DbResult<Connection>;

    /// Quote and escape a string literal.
    fn quote(&self, text: &str) -> String {
        sql_quote(text)
    }

    /// Quote a LIKE pattern with wildcards placed as requested.
    fn quote_like(&self, text: &str, position: LikePosition) -> String {
        let pattern = match position {
            LikePosition::Before => format!("%{text}"),
            LikePosition::After => format!("{text}%"),
            LikePosition::Both => format!("%{text}%"),
            LikePosition::None => text.to_string(),
        };
        self.quote(&pattern)
    }

    fn begin_statement(&self) -> &str {
        "BEGIN"
    }

    fn commit_statement(&self) -> &str {
        "COMMIT"
    }

    fn rollback_statement(&self) -> &str {
        "ROLLBACK"
    }

    /// Single-record probe statement.
    fn find_sql(&self, table: &str, where_clause: &str) -> String {
        format!("SELECT * FROM {table} WHERE {where_clause} LIMIT 1")
    }

    /// Marker character prefixed onto bare parameter names.
    fn parameter_marker(&self) -> char {
        ':'
    }

    /// Introspect the schema into the `STRUCTURE_COLUMNS` rowset.
    fn structure(&self, conn: &Connection) -> DbResult<ResultTable>;
}

/// SQLite implementation of the vendor surface.
#[derive(Debug, Clone)]
pub struct Sqlite {
    pub busy_timeout_ms: u64,
}

impl Default for Sqlite {
    fn default() -> Self {
        Sqlite {
            busy_timeout_ms: 2_000,
        }
    }
}

impl Vendor for Sqlite {
    fn open(&self, path: &Path) -> DbResult<Connection> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn =
            Connection::open_with_flags(path, flags).map_err(|source| DbError::OpenFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let _ = conn.busy_timeout(std::time::Duration::from_millis(self.busy_timeout_ms));
        Ok(conn)
    }

    fn structure(&self, conn: &Connection) -> DbResult<ResultTable> {
        let mut values: Vec<Vec<Value>> = Vec::new();

        for table in list_tables(conn)? {
            // PRAGMA arguments are not parameterizable; the identifier is
            // validated to prevent injection.
            if !is_safe_identifier(&table) {
                continue;
            }
            let sql = format!("PRAGMA table_info({table})");
            let mut stmt = conn.prepare(&sql).map_err(|e| DbError::sql(&sql, e))?;
            let mut rows = stmt.query([]).map_err(|e| DbError::sql(&sql, e))?;

            while let Some(row) = rows.next()? {
                let cid: i64 = row.get("cid")?;
                let name: String = row.get("name")?;
                let decl: Option<String> = row.get("type")?;
                let notnull: i64 = row.get("notnull")?;
                let pk: i64 = row.get("pk")?;

                let decl = DeclaredType::parse(decl.as_deref().unwrap_or(""));

                values.push(vec![
                    Value::Text(table.clone()),
                    Value::Integer(cid),
                    Value::Text(name),
                    Value::Text(decl.base.clone()),
                    opt_int(decl.char_length),
                    opt_int(decl.precision),
                    opt_int(decl.scale),
                    Value::Integer(if pk > 0 { 1 } else { 0 }),
                    Value::Integer(if notnull == 0 { 1 } else { 0 }),
                    Value::Null,
                ]);
            }
        }

        let names = STRUCTURE_COLUMNS.iter().map(|s| s.to_string()).collect();
        Ok(ResultTable::from_values(names, values))
    }
}

fn opt_int(v: Option<i64>) -> Value {
    match v {
        Some(i) => Value::Integer(i),
        None => Value::Null,
    }
}

pub(crate) fn list_tables(conn: &Connection) -> DbResult<Vec<String>> {
    let sql =
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name";
    let mut stmt = conn.prepare(sql).map_err(|e| DbError::sql(sql, e))?;
    let rows = stmt
        .query_map([], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// A declared column type split into its base name and size arguments,
/// e.g. `VARCHAR(30)` or `DECIMAL(5, 3)`.
struct DeclaredType {
    base: String,
    char_length: Option<i64>,
    precision: Option<i64>,
    scale: Option<i64>,
}

impl DeclaredType {
    fn parse(decl: &str) -> Self {
        let decl = decl.trim();
        let (base, args) = match decl.split_once('(') {
            Some((b, rest)) => {
                let args = rest
                    .trim_end_matches(')')
                    .split(',')
                    .filter_map(|a| a.trim().parse::<i64>().ok())
                    .collect::<Vec<_>>();
                (b.trim().to_uppercase(), args)
            }
            None => (decl.to_uppercase(), Vec::new()),
        };

        let first = args.first().copied();
        let second = args.get(1).copied();

        if INTEGER_FAMILY.contains(&base.as_str()) {
            DeclaredType {
                base,
                char_length: None,
                precision: Some(first.unwrap_or(10)),
                scale: Some(0),
            }
        } else if EXACT_FAMILY.contains(&base.as_str()) {
            DeclaredType {
                base,
                char_length: None,
                precision: Some(first.unwrap_or(10)),
                scale: Some(second.unwrap_or(0)),
            }
        } else if FLOAT_FAMILY.contains(&base.as_str()) {
            DeclaredType {
                base,
                char_length: None,
                precision: Some(first.unwrap_or(22)),
                scale: Some(second.unwrap_or(0)),
            }
        } else {
            // String, date and everything else: only a length argument is
            // meaningful, when present at all.
            DeclaredType {
                base,
                char_length: first,
                precision: None,
                scale: None,
            }
        }
    }
}

const INTEGER_FAMILY: [&str; 7] = [
    "BIGINT",
    "BIT",
    "INT",
    "INTEGER",
    "MEDIUMINT",
    "SMALLINT",
    "TINYINT",
];

const EXACT_FAMILY: [&str; 4] = ["DECIMAL", "MONEY", "NUMERIC", "SMALLMONEY"];

const FLOAT_FAMILY: [&str; 3] = ["DOUBLE", "FLOAT", "REAL"];

/// Minimal safe subset: [A-Za-z_][A-Za-z0-9_]*
pub(crate) fn is_safe_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_alphabetic() || first == '_') {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
