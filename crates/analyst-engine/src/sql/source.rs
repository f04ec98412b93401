use analyst_rdbc::driver::DriverManager;
use analyst_rdbc::Value;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::connector::{Outcome, Source};
use crate::logger::Logger;
use crate::scalar::{Row, Scalar};
use crate::stopper::Stopper;
use crate::stream::{Producer, Stream};

/// SqlSource configuration
#[derive(Debug, Clone)]
pub struct SqlSourceConfig {
    /// Worker name (event source)
    pub name: String,
    /// Driver name known to the driver manager
    pub driver: String,
    /// Driver-specific connection string
    pub url: String,
    /// Query text
    pub query: String,
    /// Positional query parameters
    pub params: Vec<Scalar>,
}

impl SqlSourceConfig {
    /// Create a config without query parameters
    pub fn new(
        name: impl Into<String>,
        driver: impl Into<String>,
        url: impl Into<String>,
        query: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            url: url.into(),
            query: query.into(),
            params: Vec::new(),
        }
    }

    /// Set the query parameters
    pub fn with_params(mut self, params: Vec<Scalar>) -> Self {
        self.params = params;
        self
    }
}

/// Source that streams the result of one query
pub struct SqlSource {
    config: SqlSourceConfig,
    drivers: Arc<DriverManager>,
}

impl SqlSource {
    /// Create a source using connections from `drivers`
    pub fn new(config: SqlSourceConfig, drivers: Arc<DriverManager>) -> Self {
        Self { config, drivers }
    }

    /// Configuration
    pub fn config(&self) -> &SqlSourceConfig {
        &self.config
    }

    async fn fail(&self, logger: &Logger, producer: Producer, message: String) -> Outcome {
        logger.error(&self.config.name, message).await;
        producer.close();
        Outcome::Failed
    }
}

fn decode_row(row: analyst_rdbc::types::Row) -> crate::Result<Row> {
    row.into_values().into_iter().map(Scalar::from_value).collect()
}

#[async_trait]
impl Source for SqlSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn open(&self, stream: Arc<Stream>, logger: Logger, stopper: Stopper) -> Outcome {
        let name = self.config.name.as_str();
        let mut producer = match stream.producer() {
            Ok(p) => p,
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
            Err(e) => return self.fail(&logger, producer, format!("SQL source: {}", e)).await,
        };

        let params: Vec<Value> = self.config.params.iter().map(Scalar::to_value).collect();
        let mut rows = match conn.query_stream(&self.config.query, &params).await {
            Ok(rows) => rows,
            Err(e) => return self.fail(&logger, producer, e.to_string()).await,
        };

        if let Err(e) = stream.set_columns(rows.columns().to_vec()) {
            return self.fail(&logger, producer, e.to_string()).await;
        }
        debug!(source = %name, columns = ?rows.columns(), "Query columns");
        logger.trace(name, "SQL source opened").await;

        loop {
            if stopper.is_stopped() {
                logger
                    .warn(
                        name,
                        format!("SQL source stopped after {} rows", producer.rows_sent()),
                    )
                    .await;
                producer.close();
                return Outcome::Cancelled;
            }

            let row = match rows.next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(e) => return self.fail(&logger, producer, e.to_string()).await,
            };
            let row = match decode_row(row) {
                Ok(row) => row,
                Err(e) => return self.fail(&logger, producer, e.to_string()).await,
            };
            if let Err(e) = producer.send(row).await {
                return self.fail(&logger, producer, e.to_string()).await;
            }
        }

        logger
            .info(name, format!("SQL source read {} rows", producer.rows_sent()))
            .await;
        producer.close();
        Outcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{Level, MemorySink};
    use crate::stream::Next;
    use analyst_rdbc::testing::MockConnectionFactory;

    fn drivers(factory: &MockConnectionFactory) -> Arc<DriverManager> {
        let drivers = DriverManager::empty();
        drivers.register("mock", Arc::new(factory.clone()));
        Arc::new(drivers)
    }

    #[tokio::test]
    async fn test_streams_decoded_rows() {
        let factory = MockConnectionFactory::new().with_rows(
            vec!["id".into(), "name".into()],
            vec![
                vec![Value::Int32(1), Value::Bytes(b"ann".to_vec())],
                vec![Value::Int16(2), Value::String("bob".into())],
            ],
        );
        let source = SqlSource::new(
            SqlSourceConfig::new("people", "mock", "db", "SELECT id, name FROM people")
                .with_params(vec![Scalar::Int(5)]),
            drivers(&factory),
        );

        let stream = Arc::new(Stream::new("people"));
        stream.register("").unwrap();
        let mut consumer = stream.consumer("").unwrap();
        let sink = MemorySink::new();
        let (logger, drain) = Logger::spawn(Level::Trace, sink.clone());
        let stopper = Stopper::new();

        let outcome = source.open(Arc::clone(&stream), logger, stopper.clone()).await;
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(
            stream.columns(),
            Some(&["id".to_string(), "name".to_string()][..])
        );

        assert_eq!(
            consumer.next(&stopper).await,
            Next::Row(Arc::new(vec![Scalar::Int(1), Scalar::Text("ann".into())]))
        );
        assert_eq!(
            consumer.next(&stopper).await,
            Next::Row(Arc::new(vec![Scalar::Int(2), Scalar::Text("bob".into())]))
        );
        assert_eq!(consumer.next(&stopper).await, Next::Closed);

        drain.finish().await;
        assert_eq!(sink.error_count(), 0);
        assert_eq!(sink.events()[0].message, "SQL source opened");
        assert!(matches!(
            factory.events().first(),
            Some(analyst_rdbc::testing::MockEvent::Query { params, .. }) if params == &vec![Value::Int64(5)]
        ));
    }

    #[tokio::test]
    async fn test_decode_failure_is_fatal_and_closes() {
        let factory = MockConnectionFactory::new()
            .with_rows(
                vec!["b".into()],
                vec![vec![Value::Int64(1)], vec![Value::Bytes(vec![0xff])]],
            );
        let source = SqlSource::new(
            SqlSourceConfig::new("blobs", "mock", "db", "SELECT b"),
            drivers(&factory),
        );

        let stream = Arc::new(Stream::new("blobs"));
        stream.register("").unwrap();
        let mut consumer = stream.consumer("").unwrap();
        let sink = MemorySink::new();
        let (logger, drain) = Logger::spawn(Level::Trace, sink.clone());
        let stopper = Stopper::new();

        let outcome = source.open(Arc::clone(&stream), logger, stopper.clone()).await;
        assert_eq!(outcome, Outcome::Failed);
        assert!(matches!(consumer.next(&stopper).await, Next::Row(_)));
        assert_eq!(consumer.next(&stopper).await, Next::Closed);

        drain.finish().await;
        assert_eq!(sink.error_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_closes_stream() {
        let factory = MockConnectionFactory::new().fail_connect("refused");
        let source = SqlSource::new(
            SqlSourceConfig::new("q", "mock", "db", "SELECT 1"),
            drivers(&factory),
        );

        let stream = Arc::new(Stream::new("q"));
        stream.register("").unwrap();
        let mut consumer = stream.consumer("").unwrap();
        let sink = MemorySink::new();
        let (logger, drain) = Logger::spawn(Level::Trace, sink.clone());
        let stopper = Stopper::new();

        assert_eq!(
            source.open(Arc::clone(&stream), logger, stopper.clone()).await,
            Outcome::Failed
        );
        assert_eq!(consumer.next(&stopper).await, Next::Closed);

        drain.finish().await;
        assert_eq!(sink.error_count(), 1);
        assert!(sink.events()[0].message.contains("refused"));
    }

    #[tokio::test]
    async fn test_stopped_source_emits_no_error() {
        let factory = MockConnectionFactory::new()
            .with_rows(vec!["n".into()], vec![vec![Value::Int64(1)]]);
        let source = SqlSource::new(
            SqlSourceConfig::new("q", "mock", "db", "SELECT n"),
            drivers(&factory),
        );

        let stream = Arc::new(Stream::new("q"));
        let sink = MemorySink::new();
        let (logger, drain) = Logger::spawn(Level::Trace, sink.clone());
        let stopper = Stopper::new();
        stopper.stop();

        assert_eq!(
            source.open(Arc::clone(&stream), logger, stopper).await,
            Outcome::Cancelled
        );
        drain.finish().await;
        assert_eq!(sink.error_count(), 0);
        assert_eq!(sink.at_level(Level::Warning).len(), 1);
    }
}
