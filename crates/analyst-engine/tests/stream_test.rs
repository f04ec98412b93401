//! Fan-out, backpressure and cancellation across real worker tasks

use analyst_engine::logger::{Level, MemorySink};
use analyst_engine::prelude::*;
use analyst_engine::testing::{MemoryDestination, MemorySource};
use std::time::Duration;

fn numbers(n: i64) -> Vec<Row> {
    (0..n).map(|i| vec![Scalar::Int(i), Scalar::Text(format!("row-{}", i))]).collect()
}

fn runner(settings: EngineSettings, logger: Logger) -> StageRunner {
    let resolver = Resolver::new(
        Arc::new(DriverManager::empty()),
        Arc::new(ParameterTable::new()),
    );
    StageRunner::new(settings, resolver, logger)
}

#[tokio::test]
async fn test_every_destination_sees_every_row_in_order() {
    let rows = numbers(250);
    let source = MemorySource::new("numbers", vec!["n".into(), "label".into()])
        .with_rows(rows.clone());
    let fast = MemoryDestination::new("fast");
    let slow = MemoryDestination::new("slow")
        .with_alias("slow")
        .with_delay(Duration::from_micros(200));

    let sink = MemorySink::new();
    let (logger, drain) = Logger::spawn(Level::Trace, sink.clone());
    let runner = runner(EngineSettings::default().with_stream_capacity(4), logger);

    let report = runner
        .run_pipeline(Pipeline {
            name: "numbers".into(),
            source: Arc::new(source),
            destinations: vec![Arc::new(fast.clone()), Arc::new(slow.clone())],
        })
        .await
        .unwrap();

    assert_eq!(report.outcome(), Outcome::Completed);
    assert_eq!(report.workers.len(), 3);
    assert_eq!(fast.rows(), rows);
    assert_eq!(slow.rows(), rows);

    drop(runner);
    drain.finish().await;
    assert_eq!(sink.error_count(), 0);
}

#[tokio::test]
async fn test_idle_consumer_blocks_producer_at_capacity() {
    let stream = Stream::new("bp").with_capacity(3);
    stream.register("").unwrap();
    stream.register("idle").unwrap();
    stream.set_columns(vec!["n".into()]).unwrap();
    let mut producer = stream.producer().unwrap();
    let mut reader = stream.consumer("").unwrap();
    let _idle = stream.consumer("idle").unwrap();

    let stopper = Stopper::new();
    let reading = tokio::spawn(async move {
        let mut seen = 0;
        while let Next::Row(_) = reader.next(&stopper).await {
            seen += 1;
        }
        seen
    });

    for n in 0..3 {
        producer.send(vec![Scalar::Int(n)]).await.unwrap();
    }
    let blocked = tokio::time::timeout(
        Duration::from_millis(100),
        producer.send(vec![Scalar::Int(3)]),
    )
    .await;
    assert!(blocked.is_err(), "send should wait for the idle consumer");

    producer.close();
    assert!(reading.await.unwrap() >= 3);
}

#[tokio::test]
async fn test_stop_cancels_workers_without_errors() {
    let stream = Arc::new(Stream::new("slow").with_poll_interval(Duration::from_millis(5)));
    stream.register("").unwrap();

    let source = MemorySource::new("slow", vec!["n".into()])
        .with_rows((0..1_000).map(|n| vec![Scalar::Int(n)]).collect())
        .with_delay(Duration::from_millis(5));
    let dest = MemoryDestination::new("collect");

    let sink = MemorySink::new();
    let (logger, drain) = Logger::spawn(Level::Trace, sink.clone());
    let stopper = Stopper::new();

    let src = {
        let (stream, logger, stopper) = (Arc::clone(&stream), logger.clone(), stopper.clone());
        tokio::spawn(async move { source.open(stream, logger, stopper).await })
    };
    let dst = {
        let (stream, logger, stopper, dest) =
            (Arc::clone(&stream), logger.clone(), stopper.clone(), dest.clone());
        tokio::spawn(async move { dest.open(stream, logger, stopper).await })
    };

    tokio::time::sleep(Duration::from_millis(40)).await;
    stopper.stop();
    stopper.stop();
    assert!(stopper.is_stopped());

    assert_eq!(src.await.unwrap(), Outcome::Cancelled);
    assert_eq!(dst.await.unwrap(), Outcome::Cancelled);
    assert!(dest.rows().len() < 1_000);

    drop(logger);
    drain.finish().await;
    assert_eq!(sink.error_count(), 0);
    assert!(!sink.at_level(Level::Warning).is_empty());
}

/// Reads one row, then gives up
struct Flaky;

#[async_trait::async_trait]
impl Destination for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    fn alias(&self) -> &str {
        "flaky"
    }

    async fn open(&self, stream: Arc<Stream>, logger: Logger, stopper: Stopper) -> Outcome {
        let Ok(mut consumer) = stream.consumer(self.alias()) else {
            return Outcome::Failed;
        };
        let _ = consumer.next(&stopper).await;
        logger.error(self.name(), "gave up").await;
        Outcome::Failed
    }
}

#[tokio::test]
async fn test_failing_worker_stops_siblings() {
    let source = MemorySource::new("endless", vec!["n".into()])
        .with_rows((0..10_000).map(|n| vec![Scalar::Int(n)]).collect())
        .with_delay(Duration::from_millis(1));
    let collect = MemoryDestination::new("collect");

    let sink = MemorySink::new();
    let (logger, drain) = Logger::spawn(Level::Info, sink.clone());
    let settings = EngineSettings::default().with_stop_poll_interval(Duration::from_millis(5));
    let runner = runner(settings, logger);

    let pipeline = Pipeline {
        name: "endless".into(),
        source: Arc::new(source),
        destinations: vec![Arc::new(collect.clone()), Arc::new(Flaky)],
    };

    let report = tokio::time::timeout(Duration::from_secs(5), runner.run_pipeline(pipeline))
        .await
        .expect("stage should stop after the failure")
        .unwrap();

    assert!(report.is_failed());
    let outcomes: Vec<_> = report
        .workers
        .iter()
        .map(|w| (w.name.as_str(), w.outcome))
        .collect();
    assert!(outcomes.contains(&("flaky", Outcome::Failed)));
    assert!(outcomes.contains(&("collect", Outcome::Cancelled)));
    assert!(outcomes.contains(&("endless", Outcome::Cancelled)));
    assert!(collect.rows().len() < 10_000);

    drop(runner);
    drain.finish().await;
    assert_eq!(sink.error_count(), 1);
}

/// Reads one row, then panics
struct Panicky;

#[async_trait::async_trait]
impl Destination for Panicky {
    fn name(&self) -> &str {
        "panicky"
    }

    fn alias(&self) -> &str {
        "panicky"
    }

    async fn open(&self, stream: Arc<Stream>, _logger: Logger, stopper: Stopper) -> Outcome {
        let Ok(mut consumer) = stream.consumer(self.alias()) else {
            return Outcome::Failed;
        };
        let _ = consumer.next(&stopper).await;
        panic!("destination blew up");
    }
}

#[tokio::test]
async fn test_panicking_worker_stops_siblings() {
    let source = MemorySource::new("endless", vec!["n".into()])
        .with_rows((0..10_000).map(|n| vec![Scalar::Int(n)]).collect())
        .with_delay(Duration::from_millis(1));
    let collect = MemoryDestination::new("collect");

    let sink = MemorySink::new();
    let (logger, drain) = Logger::spawn(Level::Info, sink.clone());
    let settings = EngineSettings::default().with_stop_poll_interval(Duration::from_millis(5));
    let runner = runner(settings, logger);

    let pipeline = Pipeline {
        name: "endless".into(),
        source: Arc::new(source),
        destinations: vec![Arc::new(collect.clone()), Arc::new(Panicky)],
    };

    let report = tokio::time::timeout(Duration::from_secs(5), runner.run_pipeline(pipeline))
        .await
        .expect("stage should stop after the panic")
        .unwrap();

    let outcomes: Vec<_> = report
        .workers
        .iter()
        .map(|w| (w.name.as_str(), w.outcome))
        .collect();
    assert!(outcomes.contains(&("panicky", Outcome::Failed)));
    assert!(outcomes.contains(&("collect", Outcome::Cancelled)));
    assert!(outcomes.contains(&("endless", Outcome::Cancelled)));
    assert!(collect.rows().len() < 10_000);

    drop(runner);
    drain.finish().await;
    let errors = sink.at_level(Level::Error);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("destination blew up"));
}
