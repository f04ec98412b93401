use analyst_rdbc::connection::{PreparedStatement, Transaction};
use analyst_rdbc::driver::DriverManager;
use analyst_rdbc::Value;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::connector::{Destination, Outcome};
use crate::logger::Logger;
use crate::scalar::Scalar;
use crate::stopper::Stopper;
use crate::stream::{Next, Stream};

/// SqlDestination configuration
#[derive(Clone)]
pub struct SqlDestinationConfig {
    /// Worker name (event source)
    pub name: String,
    /// Driver name known to the driver manager
    pub driver: String,
    /// Driver-specific connection string
    pub url: String,
    /// Target table
    pub table: String,
    /// Consumer alias on the stream
    pub alias: String,
    /// Transaction owned by someone else; `None` means begin our own
    pub transaction: Option<Arc<dyn Transaction>>,
}

impl fmt::Debug for SqlDestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlDestinationConfig")
            .field("name", &self.name)
            .field("driver", &self.driver)
            .field("url", &analyst_rdbc::connection::redact_url(&self.url))
            .field("table", &self.table)
            .field("alias", &self.alias)
            .field("shared_transaction", &self.transaction.is_some())
            .finish()
    }
}

impl SqlDestinationConfig {
    /// Create a config that manages its own transaction
    pub fn new(
        name: impl Into<String>,
        driver: impl Into<String>,
        url: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            url: url.into(),
            table: table.into(),
            alias: String::new(),
            transaction: None,
        }
    }

    /// Read from a named consumer
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    /// Write inside a transaction owned by the caller
    pub fn with_transaction(mut self, transaction: Arc<dyn Transaction>) -> Self {
        self.transaction = Some(transaction);
        self
    }
}

/// Transaction the destination writes into
enum TxHandle {
    /// Begun here; committed or rolled back here
    Owned(Box<dyn Transaction>),
    /// Supplied by the caller; never ended here
    Shared(Arc<dyn Transaction>),
}

impl TxHandle {
    fn get(&self) -> &dyn Transaction {
        match self {
            Self::Owned(tx) => tx.as_ref(),
            Self::Shared(tx) => tx.as_ref(),
        }
    }
}

/// Destination that inserts every row into one table
pub struct SqlDestination {
    config: SqlDestinationConfig,
    drivers: Arc<DriverManager>,
    columns: Mutex<Option<Vec<String>>>,
}

impl SqlDestination {
    /// Create a destination using connections from `drivers`
    pub fn new(config: SqlDestinationConfig, drivers: Arc<DriverManager>) -> Self {
        Self {
            config,
            drivers,
            columns: Mutex::new(None),
        }
    }

    /// Configuration
    pub fn config(&self) -> &SqlDestinationConfig {
        &self.config
    }

    /// Columns captured from the first row, if any arrived
    pub fn columns(&self) -> Option<Vec<String>> {
        self.columns.lock().clone()
    }

    /// Roll back an owned transaction; shared ones are left alone
    async fn abort(&self, logger: &Logger, tx: TxHandle) {
        let name = self.config.name.as_str();
        match tx {
            TxHandle::Shared(_) => {}
            TxHandle::Owned(tx) => match tx.rollback().await {
                Ok(()) => logger.info(name, "Transaction rolled back").await,
                Err(e) => {
                    logger
                        .error(name, format!("Failed to roll back transaction: {}", e))
                        .await
                }
            },
        }
    }

    async fn fail(&self, logger: &Logger, tx: TxHandle, message: String) -> Outcome {
        logger.error(&self.config.name, message).await;
        self.abort(logger, tx).await;
        Outcome::Failed
    }
}

#[async_trait]
impl Destination for SqlDestination {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn alias(&self) -> &str {
        &self.config.alias
    }

    async fn open(&self, stream: Arc<Stream>, logger: Logger, stopper: Stopper) -> Outcome {
        let name = self.config.name.as_str();
        let mut consumer = match stream.consumer(&self.config.alias) {
            Ok(c) => c,
            Err(e) => {
                logger.error(name, e.to_string()).await;
                return Outcome::Failed;
            }
        };

        let conn = match self
            .drivers
            .connection(&self.config.driver, &self.config.url)
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                logger.error(name, format!("SQL destination: {}", e)).await;
                return Outcome::Failed;
            }
        };
        logger.info(name, "SQL destination opened").await;

        let tx = match &self.config.transaction {
            Some(shared) => TxHandle::Shared(Arc::clone(shared)),
            None => match conn.begin().await {
                Ok(tx) => {
                    logger.trace(name, "Initiated transaction").await;
                    TxHandle::Owned(tx)
                }
                Err(e) => {
                    logger.error(name, e.to_string()).await;
                    return Outcome::Failed;
                }
            },
        };

        let mut statement: Option<Box<dyn PreparedStatement>> = None;
        let mut written: u64 = 0;
        loop {
            let row = match consumer.next(&stopper).await {
                Next::Row(row) => row,
                Next::Closed => break,
                Next::Stopped => {
                    logger.warn(name, "SQL destination aborted").await;
                    self.abort(&logger, tx).await;
                    return Outcome::Cancelled;
                }
            };

            let columns = match stream.check_row(&row) {
                Ok(columns) => columns,
                Err(e) => return self.fail(&logger, tx, e.to_string()).await,
            };

            if statement.is_none() {
                *self.columns.lock() = Some(columns.to_vec());
                logger
                    .trace(name, format!("Found columns {:?}", columns))
                    .await;
                let sql = conn.dialect().insert_sql(&self.config.table, columns);
                match tx.get().prepare(&sql).await {
                    Ok(stmt) => statement = Some(stmt),
                    Err(e) => return self.fail(&logger, tx, e.to_string()).await,
                }
            }

            if let Some(stmt) = &statement {
                let params: Vec<Value> = row.iter().map(Scalar::to_value).collect();
                if let Err(e) = stmt.execute(&params).await {
                    return self.fail(&logger, tx, e.to_string()).await;
                }
                written += 1;
            }
        }

        // Release the statement before ending the transaction.
        drop(statement);
        match tx {
            TxHandle::Shared(_) => {
                logger
                    .info(name, format!("Wrote {} rows into shared transaction", written))
                    .await;
                Outcome::Completed
            }
            TxHandle::Owned(tx) => match tx.commit().await {
                Ok(()) => {
                    logger
                        .info(name, format!("Committed {} rows", written))
                        .await;
                    Outcome::Completed
                }
                Err(e) => {
                    logger
                        .error(name, format!("Failed to commit transaction: {}", e))
                        .await;
                    Outcome::Failed
                }
            },
        }
    }
}
