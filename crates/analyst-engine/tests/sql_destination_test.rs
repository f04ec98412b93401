//! Transaction handling of SqlDestination against the mock backend

use analyst_engine::logger::{Level, MemorySink};
use analyst_engine::prelude::*;
use analyst_engine::testing::MemorySource;
use analyst_rdbc::testing::{MockConnectionFactory, MockEvent};
use analyst_rdbc::Value;
use std::time::Duration;

fn drivers(db: &MockConnectionFactory) -> Arc<DriverManager> {
    let drivers = DriverManager::empty();
    drivers.register("mock", Arc::new(db.clone()));
    Arc::new(drivers)
}

fn people() -> MemorySource {
    MemorySource::new("people", vec!["id".into(), "name".into()]).with_rows(vec![
        vec![Scalar::Int(1), Scalar::Text("ann".into())],
        vec![Scalar::Int(2), Scalar::Text("bob".into())],
        vec![Scalar::Int(3), Scalar::Null],
    ])
}

/// Run `source` into `dest` over a fresh stream
async fn run(
    source: impl Source + 'static,
    dest: Arc<SqlDestination>,
    stopper: Stopper,
) -> (Outcome, Outcome, MemorySink) {
    let stream = Arc::new(Stream::new("people").with_poll_interval(Duration::from_millis(5)));
    stream.register(dest.alias()).unwrap();
    let sink = MemorySink::new();
    let (logger, drain) = Logger::spawn(Level::Trace, sink.clone());

    let dst = {
        let (stream, logger, stopper, dest) =
            (Arc::clone(&stream), logger.clone(), stopper.clone(), Arc::clone(&dest));
        tokio::spawn(async move { dest.open(stream, logger, stopper).await })
    };
    let src = source.open(Arc::clone(&stream), logger.clone(), stopper).await;
    let dst = dst.await.unwrap();

    drop(logger);
    drain.finish().await;
    (src, dst, sink)
}

/// Sets two columns, then sends a row of three
struct Ragged;

#[async_trait::async_trait]
impl Source for Ragged {
    fn name(&self) -> &str {
        "ragged"
    }

    async fn open(&self, stream: Arc<Stream>, _logger: Logger, _stopper: Stopper) -> Outcome {
        let Ok(mut producer) = stream.producer() else {
            return Outcome::Failed;
        };
        stream.set_columns(vec!["a".into(), "b".into()]).ok();
        producer.send(vec![Scalar::Int(1), Scalar::Int(2)]).await.ok();
        producer
            .send(vec![Scalar::Int(1), Scalar::Int(2), Scalar::Int(3)])
            .await
            .ok();
        producer.close();
        Outcome::Completed
    }
}

#[tokio::test]
async fn test_owning_destination_commits_on_exhaustion() {
    let db = MockConnectionFactory::new();
    let dest = Arc::new(SqlDestination::new(
        SqlDestinationConfig::new("load", "mock", "db", "people"),
        drivers(&db),
    ));

    let (src, dst, sink) = run(people(), Arc::clone(&dest), Stopper::new()).await;
    assert_eq!(src, Outcome::Completed);
    assert_eq!(dst, Outcome::Completed);

    assert_eq!(
        db.prepared(),
        vec!["INSERT INTO people (id, name) VALUES (?, ?)".to_string()]
    );
    assert_eq!(
        db.executed(),
        vec![
            vec![Value::Int64(1), Value::String("ann".into())],
            vec![Value::Int64(2), Value::String("bob".into())],
            vec![Value::Int64(3), Value::Null],
        ]
    );
    assert_eq!((db.begins(), db.commits(), db.rollbacks()), (1, 1, 0));
    assert_eq!(dest.columns(), Some(vec!["id".to_string(), "name".to_string()]));

    let messages: Vec<String> = sink.events().into_iter().map(|e| e.message).collect();
    assert!(messages.contains(&"SQL destination opened".to_string()));
    assert!(messages.contains(&"Initiated transaction".to_string()));
    assert_eq!(sink.error_count(), 0);
}

#[tokio::test]
async fn test_width_mismatch_rolls_back() {
    let db = MockConnectionFactory::new();
    let dest = Arc::new(SqlDestination::new(
        SqlDestinationConfig::new("load", "mock", "db", "pairs"),
        drivers(&db),
    ));

    let (_, dst, sink) = run(Ragged, dest, Stopper::new()).await;
    assert_eq!(dst, Outcome::Failed);
    assert_eq!((db.commits(), db.rollbacks()), (0, 1));

    let errors = sink.at_level(Level::Error);
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "expected 2 columns but got 3");
}

#[tokio::test]
async fn test_execute_error_rolls_back() {
    let db = MockConnectionFactory::new().fail_execute_after(1, "disk full");
    let dest = Arc::new(SqlDestination::new(
        SqlDestinationConfig::new("load", "mock", "db", "people"),
        drivers(&db),
    ));

    let (_, dst, sink) = run(people(), dest, Stopper::new()).await;
    assert_eq!(dst, Outcome::Failed);
    assert_eq!(db.executed().len(), 1);
    assert_eq!((db.commits(), db.rollbacks()), (0, 1));
    assert_eq!(sink.error_count(), 1);
}

#[tokio::test]
async fn test_failed_rollback_is_logged() {
    let db = MockConnectionFactory::new()
        .fail_prepare("no such table")
        .fail_rollback("connection lost");
    let dest = Arc::new(SqlDestination::new(
        SqlDestinationConfig::new("load", "mock", "db", "people"),
        drivers(&db),
    ));

    let (_, dst, sink) = run(people(), dest, Stopper::new()).await;
    assert_eq!(dst, Outcome::Failed);
    assert_eq!(db.commits(), 0);
    let errors = sink.at_level(Level::Error);
    assert_eq!(errors.len(), 2);
    assert!(errors[1].message.starts_with("Failed to roll back transaction"));
}

#[tokio::test]
async fn test_stop_rolls_back_and_never_commits() {
    let db = MockConnectionFactory::new();
    let dest = Arc::new(SqlDestination::new(
        SqlDestinationConfig::new("load", "mock", "db", "numbers"),
        drivers(&db),
    ));
    let source = MemorySource::new("numbers", vec!["n".into()])
        .with_rows((0..1_000).map(|n| vec![Scalar::Int(n)]).collect())
        .with_delay(Duration::from_millis(2));

    let stopper = Stopper::new();
    let trigger = stopper.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.stop();
    });

    let (src, dst, sink) = run(source, dest, stopper).await;
    assert_eq!(src, Outcome::Cancelled);
    assert_eq!(dst, Outcome::Cancelled);
    assert_eq!((db.commits(), db.rollbacks()), (0, 1));
    assert_eq!(sink.error_count(), 0);
    assert!(sink
        .at_level(Level::Warning)
        .iter()
        .any(|e| e.message == "SQL destination aborted"));
}

#[tokio::test]
async fn test_shared_transaction_is_left_alone() {
    let db = MockConnectionFactory::new();
    let tx: Arc<dyn analyst_rdbc::connection::Transaction> = {
        use analyst_rdbc::connection::Connection;
        Arc::from(db.connection().begin().await.unwrap())
    };
    let dest = Arc::new(SqlDestination::new(
        SqlDestinationConfig::new("load", "mock", "db", "people")
            .with_alias("archive")
            .with_transaction(tx),
        drivers(&db),
    ));

    let (_, dst, _) = run(people(), dest, Stopper::new()).await;
    assert_eq!(dst, Outcome::Completed);
    assert_eq!((db.begins(), db.commits(), db.rollbacks()), (1, 0, 0));
    assert!(db
        .events()
        .iter()
        .all(|e| !matches!(e, MockEvent::Execute { in_transaction: false, .. })));

    // a failing shared write is not rolled back either
    let db = MockConnectionFactory::new().fail_execute_after(0, "constraint");
    let tx: Arc<dyn analyst_rdbc::connection::Transaction> = {
        use analyst_rdbc::connection::Connection;
        Arc::from(db.connection().begin().await.unwrap())
    };
    let dest = Arc::new(SqlDestination::new(
        SqlDestinationConfig::new("load", "mock", "db", "people").with_transaction(tx),
        drivers(&db),
    ));
    let (_, dst, _) = run(people(), dest, Stopper::new()).await;
    assert_eq!(dst, Outcome::Failed);
    assert_eq!((db.commits(), db.rollbacks()), (0, 0));
}

#[tokio::test]
async fn test_connect_failure_is_fatal() {
    let db = MockConnectionFactory::new().fail_connect("refused");
    let dest = Arc::new(SqlDestination::new(
        SqlDestinationConfig::new("load", "mock", "db", "people"),
        drivers(&db),
    ));

    let (_, dst, sink) = run(people(), dest, Stopper::new()).await;
    assert_eq!(dst, Outcome::Failed);
    assert_eq!(db.begins(), 0);
    assert_eq!(sink.error_count(), 1);
}
