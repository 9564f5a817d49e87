use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use rusqlite::{types::Value, Connection, Statement};
use serde::de::DeserializeOwned;

use crate::{
    core::{
        column::text_of,
        model::Model,
        row::{ResultRow, ResultTable},
        schema::{Sqlite, Vendor},
    },
    error::{DbError, DbResult},
};

/// A named parameter ready for binding. Built through [`Db::param`], which
/// applies the vendor's marker prefix.
#[derive(Debug, Clone)]
pub struct DbParameter {
    pub name: String,
    pub value: Value,
}

/// Connection manager: owns the one live connection, the structure
/// snapshot and a model per table, and serializes every command through a
/// single guard.
pub struct Db {
    shared: Arc<Shared>,
    table_names: Vec<String>,
    structure: ResultTable,
    models: HashMap<String, Model>,
}

/// The guarded connection state shared between the manager, its models and
/// dispatched background calls. One physical connection; concurrent
/// command execution on it is unsafe, so every entry point that issues a
/// command or walks a cursor holds the lock for its full duration.
pub(crate) struct Shared {
    vendor: Box<dyn Vendor>,
    state: Mutex<ConnState>,
}

struct ConnState {
    conn: Connection,
    in_transaction: bool,
}

impl Shared {
    fn lock(&self) -> DbResult<MutexGuard<'_, ConnState>> {
        self.state
            .lock()
            .map_err(|_| DbError::Internal("poisoned connection lock".into()))
    }

    pub(crate) fn execute(&self, sql: &str, params: &[DbParameter]) -> DbResult<usize> {
        let state = self.lock()?;
        execute_locked(&state.conn, sql, params)
    }

    pub(crate) fn query(&self, sql: &str, params: &[DbParameter]) -> DbResult<ResultTable> {
        let state = self.lock()?;
        query_locked(&state.conn, sql, params)
    }

    pub(crate) fn find(&self, table: &str, where_clause: &str) -> DbResult<Option<ResultRow>> {
        let sql = self.vendor.find_sql(table, where_clause);
        let table = self.query(&sql, &[])?;
        Ok(table.rows.into_iter().next())
    }

    pub(crate) fn find_all(
        &self,
        table: &str,
        where_clause: Option<&str>,
        order_clause: Option<&str>,
    ) -> DbResult<ResultTable> {
        let mut sql = format!("SELECT * FROM {table}");
        if let Some(w) = where_clause.filter(|w| !w.is_empty()) {
            sql.push_str(&format!(" WHERE {w}"));
        }
        if let Some(o) = order_clause.filter(|o| !o.is_empty()) {
            sql.push_str(&format!(" ORDER BY {o}"));
        }
        self.query(&sql, &[])
    }

    pub(crate) fn begin_transaction(&self) -> DbResult<()> {
        let mut state = self.lock()?;
        // Single-level: an active transaction makes this a no-op.
        if state.in_transaction {
            return Ok(());
        }
        match execute_locked(&state.conn, self.vendor.begin_statement(), &[]) {
            Ok(_) => {
                state.in_transaction = true;
                Ok(())
            }
            Err(e) => {
                self.reset_transaction(&mut state);
                Err(e)
            }
        }
    }

    pub(crate) fn commit_transaction(&self) -> DbResult<()> {
        let mut state = self.lock()?;
        if !state.in_transaction {
            self.reset_transaction(&mut state);
            return Err(DbError::TransactionState(
                "commit without active transaction".into(),
            ));
        }
        match execute_locked(&state.conn, self.vendor.commit_statement(), &[]) {
            Ok(_) => {
                state.in_transaction = false;
                Ok(())
            }
            Err(e) => {
                self.reset_transaction(&mut state);
                Err(e)
            }
        }
    }

    pub(crate) fn rollback_transaction(&self) -> DbResult<()> {
        let mut state = self.lock()?;
        if !state.in_transaction {
            self.reset_transaction(&mut state);
            return Err(DbError::TransactionState(
                "rollback without active transaction".into(),
            ));
        }
        match execute_locked(&state.conn, self.vendor.rollback_statement(), &[]) {
            Ok(_) => {
                state.in_transaction = false;
                Ok(())
            }
            Err(e) => {
                self.reset_transaction(&mut state);
                Err(e)
            }
        }
    }

    /// Defensive reset after a failed transaction transition: best-effort
    /// rollback with its own failure swallowed, then clear the flag. The
    /// flag never claims an active transaction after a failed transition.
    fn reset_transaction(&self, state: &mut ConnState) {
        tracing::warn!("resetting transaction state");
        let _ = execute_locked(&state.conn, self.vendor.rollback_statement(), &[]);
        state.in_transaction = false;
    }

    fn in_transaction(&self) -> DbResult<bool> {
        Ok(self.lock()?.in_transaction)
    }
}

fn bind(stmt: &mut Statement<'_>, params: &[DbParameter], sql: &str) -> DbResult<()> {
    for p in params {
        let index = stmt
            .parameter_index(&p.name)
            .map_err(|e| DbError::sql(sql, e))?
            .ok_or_else(|| DbError::InvalidRequest(format!("unknown parameter: {}", p.name)))?;
        stmt.raw_bind_parameter(index, &p.value)
            .map_err(|e| DbError::sql(sql, e))?;
    }
    Ok(())
}

fn execute_locked(conn: &Connection, sql: &str, params: &[DbParameter]) -> DbResult<usize> {
    let mut stmt = conn.prepare(sql).map_err(|e| DbError::sql(sql, e))?;
    bind(&mut stmt, params, sql)?;
    let changed = stmt.raw_execute().map_err(|e| {
        tracing::error!(error = %e, sql, "execute failed");
        DbError::sql(sql, e)
    })?;
    Ok(changed)
}

fn query_locked(conn: &Connection, sql: &str, params: &[DbParameter]) -> DbResult<ResultTable> {
    let mut stmt = conn.prepare(sql).map_err(|e| DbError::sql(sql, e))?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    bind(&mut stmt, params, sql)?;
    let mut rows = stmt.raw_query();
    ResultTable::from_cursor(column_names, &mut rows).map_err(|e| match e {
        DbError::Sqlite(source) => DbError::sql(sql, source),
        other => other,
    })
}

impl Db {
    /// Open a SQLite database and introspect its structure: one model is
    /// built per table, keyed by uppercased table name.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Db> {
        Db::open_with(path, Box::new(Sqlite::default()))
    }

    pub fn open_with(path: impl AsRef<Path>, vendor: Box<dyn Vendor>) -> DbResult<Db> {
        let conn = vendor.open(path.as_ref())?;
        let shared = Arc::new(Shared {
            vendor,
            state: Mutex::new(ConnState {
                conn,
                in_transaction: false,
            }),
        });

        let mut db = Db {
            shared,
            table_names: Vec::new(),
            structure: ResultTable::from_values(Vec::new(), Vec::new()),
            models: HashMap::new(),
        };
        db.refresh()?;
        Ok(db)
    }

    /// Re-introspect the structure and rebuild every model. Call after
    /// running DDL through [`Db::execute`].
    pub fn refresh(&mut self) -> DbResult<()> {
        let structure = {
            let state = self.shared.lock()?;
            self.shared.vendor.structure(&state.conn)?
        };

        let mut table_names: Vec<String> = Vec::new();
        for row in &structure.rows {
            let name = text_of(row.named("TABLE_NAME")?);
            if !table_names.contains(&name) {
                table_names.push(name);
            }
        }

        let mut models = HashMap::new();
        for name in &table_names {
            let info = structure.filter(|r| {
                r.try_named("TABLE_NAME").map(text_of).as_deref() == Some(name.as_str())
            });
            let model = Model::build(Arc::clone(&self.shared), &info)?;
            models.insert(name.to_uppercase(), model);
        }

        self.structure = structure;
        self.table_names = table_names;
        self.models = models;
        Ok(())
    }

    pub fn table_names(&self) -> &[String] {
        &self.table_names
    }

    /// The raw introspection rowset.
    pub fn structure(&self) -> &ResultTable {
        &self.structure
    }

    pub fn model(&self, table_name: &str) -> DbResult<&Model> {
        self.models
            .get(&table_name.to_uppercase())
            .ok_or_else(|| DbError::InvalidRequest(format!("table not found: {table_name}")))
    }

    /// Build a bound parameter, prefixing the vendor's marker character
    /// onto a bare name.
    pub fn param(&self, name: &str, value: impl Into<Value>) -> DbParameter {
        let marker = self.shared.vendor.parameter_marker();
        let name = if name.starts_with(marker) {
            name.to_string()
        } else {
            format!("{marker}{name}")
        };
        DbParameter {
            name,
            value: value.into(),
        }
    }

    /// Execute a non-SELECT statement; returns the affected row count.
    pub fn execute(&self, sql: &str, params: &[DbParameter]) -> DbResult<usize> {
        self.shared.execute(sql, params)
    }

    /// Execute a SELECT and materialize the whole result set.
    pub fn query(&self, sql: &str, params: &[DbParameter]) -> DbResult<ResultTable> {
        self.shared.query(sql, params)
    }

    /// Execute a SELECT and map each row onto `T` by column name. Columns
    /// with no matching field are ignored; a missing non-defaulted field
    /// is an error.
    pub fn query_as<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: &[DbParameter],
    ) -> DbResult<Vec<T>> {
        let table = self.query(sql, params)?;
        let mut out = Vec::with_capacity(table.row_count());
        for row in &table.rows {
            out.push(serde_json::from_value(row.to_json())?);
        }
        Ok(out)
    }

    /// Run `f` over the raw forward-only cursor of a SELECT. The
    /// connection guard is held for the closure's whole run, so no other
    /// command can interleave until the cursor is released.
    pub fn with_reader<T>(
        &self,
        sql: &str,
        params: &[DbParameter],
        f: impl FnOnce(&mut rusqlite::Rows<'_>) -> DbResult<T>,
    ) -> DbResult<T> {
        let state = self.shared.lock()?;
        let mut stmt = state.conn.prepare(sql).map_err(|e| DbError::sql(sql, e))?;
        bind(&mut stmt, params, sql)?;
        let mut rows = stmt.raw_query();
        f(&mut rows)
    }

    /// First row matching `where_clause`, or `None`.
    pub fn find(&self, table: &str, where_clause: &str) -> DbResult<Option<ResultRow>> {
        self.shared.find(table, where_clause)
    }

    /// All rows of `table`, with WHERE/ORDER BY appended only when
    /// non-empty.
    pub fn find_all(
        &self,
        table: &str,
        where_clause: Option<&str>,
        order_clause: Option<&str>,
    ) -> DbResult<ResultTable> {
        self.shared.find_all(table, where_clause, order_clause)
    }

    pub fn in_transaction(&self) -> DbResult<bool> {
        self.shared.in_transaction()
    }

    /// Start a transaction. No-op when one is already active; this layer
    /// does not nest.
    pub fn begin_transaction(&self) -> DbResult<()> {
        self.shared.begin_transaction()
    }

    pub fn commit_transaction(&self) -> DbResult<()> {
        self.shared.commit_transaction()
    }

    pub fn rollback_transaction(&self) -> DbResult<()> {
        self.shared.rollback_transaction()
    }

    // Async entry points: a thin dispatch of the synchronous call onto a
    // blocking worker so the caller's task is not blocked. There is no
    // overlapped I/O and no cancellation of an in-flight statement.

    pub async fn execute_async(&self, sql: &str, params: &[DbParameter]) -> DbResult<usize> {
        let shared = Arc::clone(&self.shared);
        let sql = sql.to_owned();
        let params = params.to_vec();
        dispatch(move || shared.execute(&sql, &params)).await
    }

    pub async fn query_async(&self, sql: &str, params: &[DbParameter]) -> DbResult<ResultTable> {
        let shared = Arc::clone(&self.shared);
        let sql = sql.to_owned();
        let params = params.to_vec();
        dispatch(move || shared.query(&sql, &params)).await
    }

    pub async fn find_async(&self, table: &str, where_clause: &str) -> DbResult<Option<ResultRow>> {
        let shared = Arc::clone(&self.shared);
        let table = table.to_owned();
        let where_clause = where_clause.to_owned();
        dispatch(move || shared.find(&table, &where_clause)).await
    }

    pub async fn find_all_async(
        &self,
        table: &str,
        where_clause: Option<&str>,
        order_clause: Option<&str>,
    ) -> DbResult<ResultTable> {
        let shared = Arc::clone(&self.shared);
        let table = table.to_owned();
        let where_clause = where_clause.map(str::to_owned);
        let order_clause = order_clause.map(str::to_owned);
        dispatch(move || shared.find_all(&table, where_clause.as_deref(), order_clause.as_deref()))
            .await
    }

    pub async fn begin_transaction_async(&self) -> DbResult<()> {
        let shared = Arc::clone(&self.shared);
        dispatch(move || shared.begin_transaction()).await
    }

    pub async fn commit_transaction_async(&self) -> DbResult<()> {
        let shared = Arc::clone(&self.shared);
        dispatch(move || shared.commit_transaction()).await
    }

    pub async fn rollback_transaction_async(&self) -> DbResult<()> {
        let shared = Arc::clone(&self.shared);
        dispatch(move || shared.rollback_transaction()).await
    }
}

async fn dispatch<T: Send + 'static>(
    f: impl FnOnce() -> DbResult<T> + Send + 'static,
) -> DbResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|_| DbError::Internal("db worker dropped response".into()))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_db() -> Db {
        let mut db = Db::open(":memory:").unwrap();
        db.execute(
            "CREATE TABLE test (
                 COL_STR VARCHAR(10) NOT NULL,
                 COL_DEC DECIMAL(5, 3),
                 COL_INT INTEGER NOT NULL PRIMARY KEY,
                 COL_DATETIME DATETIME
             )",
            &[],
        )
        .unwrap();
        db.refresh().unwrap();
        db
    }

    #[test]
    fn execute_and_query_roundtrip() {
        let db = open_test_db();
        let n = db
            .execute(
                "INSERT INTO test (COL_STR, COL_INT) VALUES ('a', 1)",
                &[],
            )
            .unwrap();
        assert_eq!(n, 1);

        let table = db.query("SELECT * FROM test", &[]).unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(
            table.rows[0].named("COL_STR").unwrap(),
            &Value::Text("a".into())
        );
        assert_eq!(table.rows[0].named("COL_DEC").unwrap(), &Value::Null);
    }

    #[test]
    fn bound_parameters() {
        let db = open_test_db();
        db.execute(
            "INSERT INTO test (COL_STR, COL_INT) VALUES (:s, :i)",
            &[
                db.param("s", "abc".to_string()),
                db.param("i", 7_i64),
            ],
        )
        .unwrap();

        let table = db
            .query(
                "SELECT * FROM test WHERE COL_INT = :i",
                &[db.param(":i", 7_i64)],
            )
            .unwrap();
        assert_eq!(table.row_count(), 1);
        assert_eq!(
            table.rows[0].named("COL_STR").unwrap(),
            &Value::Text("abc".into())
        );
    }

    #[test]
    fn unknown_parameter_is_invalid_request() {
        let db = open_test_db();
        let err = db
            .execute(
                "INSERT INTO test (COL_STR, COL_INT) VALUES (:s, 1)",
                &[db.param("nope", 1_i64)],
            )
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidRequest(_)));
    }

    #[test]
    fn sql_failure_carries_statement_text() {
        let db = open_test_db();
        let err = db.execute("INSERT INTO missing VALUES (1)", &[]).unwrap_err();
        match err {
            DbError::Sql { sql, .. } => assert!(sql.contains("missing")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn find_and_find_all() {
        let db = open_test_db();
        for i in 1..=3 {
            db.execute(
                &format!("INSERT INTO test (COL_STR, COL_INT) VALUES ('r{i}', {i})"),
                &[],
            )
            .unwrap();
        }

        let row = db.find("test", "COL_INT = 2").unwrap().unwrap();
        assert_eq!(row.named("COL_STR").unwrap(), &Value::Text("r2".into()));
        assert!(db.find("test", "COL_INT = 99").unwrap().is_none());

        let all = db.find_all("test", None, Some("COL_INT DESC")).unwrap();
        assert_eq!(all.row_count(), 3);
        assert_eq!(all.rows[0].named("COL_INT").unwrap(), &Value::Integer(3));

        let some = db.find_all("test", Some("COL_INT >= 2"), None).unwrap();
        assert_eq!(some.row_count(), 2);
    }

    #[test]
    fn query_as_maps_by_name() {
        #[derive(serde::Deserialize)]
        struct TestRow {
            #[serde(rename = "COL_STR")]
            col_str: String,
            #[serde(rename = "COL_INT")]
            col_int: i64,
        }

        let db = open_test_db();
        db.execute("INSERT INTO test (COL_STR, COL_INT) VALUES ('x', 5)", &[])
            .unwrap();

        // Extra columns in the result are ignored; mapping is name-driven.
        let rows: Vec<TestRow> = db.query_as("SELECT * FROM test", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].col_str, "x");
        assert_eq!(rows[0].col_int, 5);
    }

    #[test]
    fn with_reader_drains_under_guard() {
        let db = open_test_db();
        db.execute("INSERT INTO test (COL_STR, COL_INT) VALUES ('x', 5)", &[])
            .unwrap();

        let count = db
            .with_reader("SELECT COL_INT FROM test", &[], |rows| {
                let mut n = 0;
                while rows.next()?.is_some() {
                    n += 1;
                }
                Ok(n)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn transaction_rollback_discards_writes() {
        let db = open_test_db();
        db.begin_transaction().unwrap();
        assert!(db.in_transaction().unwrap());
        // Nested begin is a no-op.
        db.begin_transaction().unwrap();

        db.execute("INSERT INTO test (COL_STR, COL_INT) VALUES ('x', 1)", &[])
            .unwrap();
        db.rollback_transaction().unwrap();
        assert!(!db.in_transaction().unwrap());

        let table = db.query("SELECT * FROM test", &[]).unwrap();
        assert_eq!(table.row_count(), 0);
    }

    #[test]
    fn transaction_commit_persists_writes() {
        let db = open_test_db();
        db.begin_transaction().unwrap();
        db.execute("INSERT INTO test (COL_STR, COL_INT) VALUES ('x', 1)", &[])
            .unwrap();
        db.commit_transaction().unwrap();

        let table = db.query("SELECT * FROM test", &[]).unwrap();
        assert_eq!(table.row_count(), 1);
    }

    #[test]
    fn failed_commit_statement_triggers_defensive_reset() {
        struct BrokenCommit;

        impl Vendor for BrokenCommit {
            fn open(&self, path: &Path) -> DbResult<Connection> {
                Sqlite::default().open(path)
            }

            fn commit_statement(&self) -> &str {
                "COMMIT SIDEWAYS"
            }

            fn structure(&self, conn: &Connection) -> DbResult<ResultTable> {
                Sqlite::default().structure(conn)
            }
        }

        let mut db = Db::open_with(":memory:", Box::new(BrokenCommit)).unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .unwrap();
        db.refresh().unwrap();

        db.begin_transaction().unwrap();
        db.execute("INSERT INTO t (id) VALUES (1)", &[]).unwrap();

        let err = db.commit_transaction().unwrap_err();
        assert!(matches!(err, DbError::Sql { .. }));
        // The reset rolled the transaction back and cleared the flag.
        assert!(!db.in_transaction().unwrap());
        assert_eq!(db.query("SELECT * FROM t", &[]).unwrap().row_count(), 0);

        // The connection stays usable outside any transaction.
        db.execute("INSERT INTO t (id) VALUES (2)", &[]).unwrap();
        assert_eq!(db.query("SELECT * FROM t", &[]).unwrap().row_count(), 1);
    }

    #[test]
    fn commit_without_begin_fails_and_clears_state() {
        let db = open_test_db();
        let err = db.commit_transaction().unwrap_err();
        assert!(matches!(err, DbError::TransactionState(_)));
        assert!(!db.in_transaction().unwrap());

        let err = db.rollback_transaction().unwrap_err();
        assert!(matches!(err, DbError::TransactionState(_)));
        assert!(!db.in_transaction().unwrap());
    }

    #[test]
    fn model_lookup_is_case_insensitive() {
        let db = open_test_db();
        assert!(db.model("test").is_ok());
        assert!(db.model("TEST").is_ok());
        assert!(db.model("nope").is_err());
        assert_eq!(db.table_names(), &["test".to_string()]);
    }

    #[tokio::test]
    async fn async_wrappers_match_sync_results() {
        let db = open_test_db();
        let n = db
            .execute_async("INSERT INTO test (COL_STR, COL_INT) VALUES ('a', 1)", &[])
            .await
            .unwrap();
        assert_eq!(n, 1);

        let table = db.query_async("SELECT * FROM test", &[]).await.unwrap();
        assert_eq!(table.row_count(), 1);

        let row = db.find_async("test", "COL_INT = 1").await.unwrap();
        assert!(row.is_some());

        db.begin_transaction_async().await.unwrap();
        db.execute_async("DELETE FROM test", &[]).await.unwrap();
        db.rollback_transaction_async().await.unwrap();
        let table = db.find_all_async("test", None, None).await.unwrap();
        assert_eq!(table.row_count(), 1);
    }
}
