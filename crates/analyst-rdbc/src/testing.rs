//! Testing utilities for code built on analyst-rdbc
//!
//! `MockConnectionFactory` hands out in-memory connections that replay a
//! scripted result set and journal every statement, transaction boundary and
//! close. Failures can be injected at each step.
//!
//! # Example
//!
//! ```rust,ignore
//! use analyst_rdbc::testing::*;
//!
//! let db = MockConnectionFactory::new()
//!     .with_rows(vec!["a".into()], vec![vec![Value::Int64(1)]])
//!     .fail_execute_after(1, "disk full");
//! let conn = db.connection();
//! // ... run the code under test ...
//! assert_eq!(db.rollbacks(), 1);
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, PreparedStatement, RowStream,
    Transaction, VecRowStream,
};
use crate::dialect::{GenericDialect, SqlDialect};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// One journaled interaction with a mock connection
#[derive(Debug, Clone, PartialEq)]
pub enum MockEvent {
    /// A query was issued
    Query {
        /// SQL text
        sql: String,
        /// Bound parameters
        params: Vec<Value>,
    },
    /// A statement was prepared
    Prepare {
        /// SQL text
        sql: String,
    },
    /// A statement was executed
    Execute {
        /// SQL text
        sql: String,
        /// Bound parameters
        params: Vec<Value>,
        /// Whether a transaction was open at the time
        in_transaction: bool,
    },
    /// A transaction was started
    Begin,
    /// A transaction was committed
    Commit,
    /// A transaction was rolled back
    Rollback,
    /// The connection was closed
    Close,
}

#[derive(Debug, Clone, Default)]
struct MockScript {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    row_error_at: Option<(usize, String)>,
    fail_connect: Option<String>,
    fail_query: Option<String>,
    fail_prepare: Option<String>,
    fail_execute_after: Option<(usize, String)>,
    fail_commit: Option<String>,
    fail_rollback: Option<String>,
}

#[derive(Debug, Default)]
struct MockState {
    script: MockScript,
    events: Vec<MockEvent>,
    executes: usize,
    connects: usize,
    in_transaction: bool,
}

type Shared = Arc<Mutex<MockState>>;

/// Factory and journal for mock connections
///
/// Clones share the same script and journal.
#[derive(Debug, Clone, Default)]
pub struct MockConnectionFactory {
    state: Shared,
}

impl MockConnectionFactory {
    /// Create a factory with an empty result set and no failures
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the result set returned by every query
    pub fn with_rows(self, columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        {
            let mut state = self.state.lock();
            state.script.columns = columns;
            state.script.rows = rows;
        }
        self
    }

    /// Replace row `index` of the result set with a decode error
    pub fn with_row_error_at(self, index: usize, message: impl Into<String>) -> Self {
        self.state.lock().script.row_error_at = Some((index, message.into()));
        self
    }

    /// Make every connect attempt fail
    pub fn fail_connect(self, message: impl Into<String>) -> Self {
        self.state.lock().script.fail_connect = Some(message.into());
        self
    }

    /// Make every query fail
    pub fn fail_query(self, message: impl Into<String>) -> Self {
        self.state.lock().script.fail_query = Some(message.into());
        self
    }

    /// Make every prepare fail
    pub fn fail_prepare(self, message: impl Into<String>) -> Self {
        self.state.lock().script.fail_prepare = Some(message.into());
        self
    }

    /// Let `successes` executes through, then fail every later one
    pub fn fail_execute_after(self, successes: usize, message: impl Into<String>) -> Self {
        self.state.lock().script.fail_execute_after = Some((successes, message.into()));
        self
    }

    /// Make commit fail
    pub fn fail_commit(self, message: impl Into<String>) -> Self {
        self.state.lock().script.fail_commit = Some(message.into());
        self
    }

    /// Make rollback fail
    pub fn fail_rollback(self, message: impl Into<String>) -> Self {
        self.state.lock().script.fail_rollback = Some(message.into());
        self
    }

    /// Open a connection directly, bypassing the connect script
    pub fn connection(&self) -> MockConnection {
        MockConnection {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of successful connects through the factory
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Everything journaled so far, in order
    pub fn events(&self) -> Vec<MockEvent> {
        self.state.lock().events.clone()
    }

    /// Parameters of every executed statement, in order
    pub fn executed(&self) -> Vec<Vec<Value>> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Execute { params, .. } => Some(params.clone()),
                _ => None,
            })
            .collect()
    }

    /// SQL of every prepared statement, in order
    pub fn prepared(&self) -> Vec<String> {
        self.state
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                MockEvent::Prepare { sql } => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of journaled transaction starts
    pub fn begins(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Begin))
    }

    /// Number of journaled commits
    pub fn commits(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Commit))
    }

    /// Number of journaled rollbacks
    pub fn rollbacks(&self) -> usize {
        self.count(|e| matches!(e, MockEvent::Rollback))
    }

    fn count(&self, pred: impl Fn(&MockEvent) -> bool) -> usize {
        self.state.lock().events.iter().filter(|e| pred(e)).count()
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        {
            let mut state = self.state.lock();
            if let Some(msg) = &state.script.fail_connect {
                return Err(Error::connection(msg.clone()));
            }
            state.connects += 1;
        }
        Ok(Box::new(self.connection()))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Unknown
    }
}

fn execute(state: &Shared, sql: &str, params: &[Value]) -> Result<u64> {
    let mut state = state.lock();
    if let Some((successes, msg)) = &state.script.fail_execute_after {
        if state.executes >= *successes {
            return Err(Error::query_with_sql(msg.clone(), sql));
        }
    }
    state.executes += 1;
    let in_transaction = state.in_transaction;
    state.events.push(MockEvent::Execute {
        sql: sql.to_string(),
        params: params.to_vec(),
        in_transaction,
    });
    Ok(1)
}

fn prepare(state: &Shared, sql: &str) -> Result<Box<dyn PreparedStatement>> {
    let mut guard = state.lock();
    if let Some(msg) = &guard.script.fail_prepare {
        return Err(Error::query_with_sql(msg.clone(), sql));
    }
    guard.events.push(MockEvent::Prepare {
        sql: sql.to_string(),
    });
    Ok(Box::new(MockStatement {
        state: Arc::clone(state),
        sql: sql.to_string(),
    }))
}

/// In-memory connection driven by a `MockConnectionFactory` script
#[derive(Debug)]
pub struct MockConnection {
    state: Shared,
    closed: AtomicBool,
}

impl MockConnection {
    fn scripted_rows(&self, sql: &str, params: &[Value]) -> Result<(Vec<String>, Vec<Result<Row>>)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        let mut state = self.state.lock();
        state.events.push(MockEvent::Query {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        if let Some(msg) = &state.script.fail_query {
            return Err(Error::query_with_sql(msg.clone(), sql));
        }

        let script = &state.script;
        let mut rows = Vec::with_capacity(script.rows.len());
        for (idx, values) in script.rows.iter().enumerate() {
            match &script.row_error_at {
                Some((at, msg)) if *at == idx => {
                    rows.push(Err(Error::type_conversion(msg.clone())));
                    break;
                }
                _ => rows.push(Ok(Row::new(script.columns.clone(), values.clone()))),
            }
        }
        Ok((script.columns.clone(), rows))
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let (_, rows) = self.scripted_rows(sql, params)?;
        rows.into_iter().collect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        execute(&self.state, sql, params)
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        prepare(&self.state, sql)
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        {
            let mut state = self.state.lock();
            state.in_transaction = true;
            state.events.push(MockEvent::Begin);
        }
        Ok(Box::new(MockTransaction {
            state: Arc::clone(&self.state),
        }))
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Pin<Box<dyn RowStream>>> {
        let (columns, rows) = self.scripted_rows(sql, params)?;
        Ok(Box::pin(VecRowStream::from_results(columns, rows)))
    }

    async fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::Relaxed)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        self.state.lock().events.push(MockEvent::Close);
        Ok(())
    }

    fn dialect(&self) -> &dyn SqlDialect {
        &GenericDialect
    }
}

/// Prepared statement on a mock connection
#[derive(Debug)]
pub struct MockStatement {
    state: Shared,
    sql: String,
}

#[async_trait]
impl PreparedStatement for MockStatement {
    async fn execute(&self, params: &[Value]) -> Result<u64> {
        execute(&self.state, &self.sql, params)
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

/// Transaction on a mock connection
#[derive(Debug)]
pub struct MockTransaction {
    state: Shared,
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        execute(&self.state, sql, params)
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        prepare(&self.state, sql)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(msg) = &state.script.fail_commit {
            return Err(Error::transaction(msg.clone()));
        }
        state.in_transaction = false;
        state.events.push(MockEvent::Commit);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(msg) = &state.script.fail_rollback {
            return Err(Error::transaction(msg.clone()));
        }
        state.in_transaction = false;
        state.events.push(MockEvent::Rollback);
        Ok(())
    }
}
