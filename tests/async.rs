#![cfg(feature = "tokio")]

mod common;

use apm_relay::{
    AsyncInstrumentor, AsyncReliableQueueTransport, AsyncTelemetryLogger, BrokerSettings,
    CallSite, Capture, Measurement, MemoryFloor, ProcessCpuTime, Record, RecordBuilder,
    Snapshot, TelemetryError, call_site, dispatch_async,
};
use common::{MemoryBroker, RecordingTransport, ScriptedProbe};
use log::Log;
use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

fn instrumentor(transport: &Arc<RecordingTransport>) -> AsyncInstrumentor {
    AsyncInstrumentor::new(transport.clone(), Arc::new(ScriptedProbe::fixed()))
        .server_name("billing")
}

fn exec_time(record: &Record) -> f64 {
    match record {
        Record::Metric(metric) => metric.exec_time,
        Record::Log(_) => panic!("expected a metric record"),
    }
}

async fn wait_for_records(transport: &RecordingTransport, count: usize) -> Vec<Record> {
    for _ in 0..100 {
        let records = transport.records();
        if records.len() >= count {
            return records;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    transport.records()
}

#[tokio::test]
async fn measures_suspended_time_of_a_future() {
    let transport = Arc::new(RecordingTransport::default());
    let apm = AsyncInstrumentor::new(transport.clone(), Arc::new(ProcessCpuTime::new().unwrap()));

    let result = apm
        .call(&call_site!("target"), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            42
        })
        .await;

    assert_eq!(result, 42);
    // The record is sent before the output is handed back.
    let records = transport.records();
    assert_eq!(records.len(), 1);
    let elapsed = exec_time(&records[0]);
    assert!((0.15..=0.5).contains(&elapsed), "exec_time {elapsed} out of range");
}

#[tokio::test]
async fn errors_from_futures_pass_through() {
    let transport = Arc::new(RecordingTransport::default());
    let apm = instrumentor(&transport);

    let result: Result<(), TelemetryError> = apm
        .call(&call_site!("load"), async { Err(TelemetryError::Closed) })
        .await;

    assert!(matches!(result, Err(TelemetryError::Closed)));
    assert_eq!(transport.records().len(), 1);
}

#[tokio::test]
async fn cancelled_future_is_still_recorded() {
    let transport = Arc::new(RecordingTransport::default());
    let apm = instrumentor(&transport);

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        apm.call(&call_site!("slow"), tokio::time::sleep(Duration::from_secs(10))),
    )
    .await;
    assert!(outcome.is_err());

    let records = wait_for_records(&transport, 1).await;
    assert_eq!(records.len(), 1);
    assert!(exec_time(&records[0]) < 1.0);
}

#[tokio::test]
async fn wrapped_async_function_keeps_its_output() {
    let transport = Arc::new(RecordingTransport::default());
    let apm = instrumentor(&transport);
    let double = apm.wrap(CallSite::new("src/math.rs", "double"), |n: u64| async move { n * 2 });

    assert_eq!(double(21).await, 42);
    assert_eq!(double(0).await, 0);
    assert_eq!(transport.records().len(), 2);
}

fn sample_record() -> Record {
    let builder = RecordBuilder::new("billing", MemoryFloor::Zero);
    let reading = Snapshot {
        cpu_seconds: 1.0,
        resident_bytes: 2048,
    };
    Record::Metric(builder.metric(
        &Capture::now(),
        &CallSite::new("src/jobs.rs", "settle"),
        &Measurement {
            elapsed: Duration::from_millis(5),
            start: reading,
            end: reading,
        },
    ))
}

#[tokio::test]
async fn async_broker_reconnects_after_publish_failure() {
    let broker = MemoryBroker::default();
    let transport = AsyncReliableQueueTransport::new(
        broker.clone(),
        BrokerSettings::metrics().credentials("guest", "secret"),
    )
    .unwrap();
    let record = sample_record();

    dispatch_async(&transport, &record).await.unwrap();
    assert_eq!(broker.state.connects(), 1);

    broker.state.fail_next_publish.store(true, Ordering::SeqCst);
    assert!(dispatch_async(&transport, &record).await.is_err());

    dispatch_async(&transport, &record).await.unwrap();
    assert_eq!(broker.state.connects(), 2);
    let published = broker.state.published();
    assert_eq!(published.len(), 2);
    assert!(published.iter().all(|p| p.queue == "apm" && p.persistent));
}

#[tokio::test]
async fn async_broker_requires_credentials() {
    let result =
        AsyncReliableQueueTransport::new(MemoryBroker::default(), BrokerSettings::metrics());
    assert!(matches!(result, Err(TelemetryError::MissingCredentials)));
}

#[tokio::test]
async fn async_logger_delivers_in_order() {
    let transport = Arc::new(RecordingTransport::default());
    let logger = AsyncTelemetryLogger::new(transport.clone())
        .unwrap()
        .server_name("billing");

    for n in 0..3 {
        logger.log(
            &log::Record::builder()
                .level(log::Level::Info)
                .target("billing::jobs")
                .args(format_args!("step {n}"))
                .build(),
        );
    }

    let records = wait_for_records(&transport, 3).await;
    let messages: Vec<_> = records
        .into_iter()
        .map(|record| match record {
            Record::Log(log) => log.message,
            Record::Metric(_) => panic!("expected a log record"),
        })
        .collect();
    assert_eq!(messages, ["step 0", "step 1", "step 2"]);
}

#[tokio::test]
async fn async_records_carry_the_transport_server_name() {
    let transport = Arc::new(RecordingTransport::default());
    let apm = AsyncInstrumentor::new(transport.clone(), Arc::new(ScriptedProbe::fixed()));
    apm.call(&call_site!("target"), async {}).await;
    instrumentor(&transport).call(&call_site!("target"), async {}).await;

    let names: Vec<_> = transport
        .records()
        .into_iter()
        .map(|record| match record {
            Record::Metric(metric) => metric.server_name,
            Record::Log(_) => panic!("expected a metric record"),
        })
        .collect();
    assert_eq!(names, ["python", "billing"]);
}

#[test]
fn async_logger_needs_a_runtime() {
    let transport = Arc::new(RecordingTransport::default());
    let result = AsyncTelemetryLogger::new(transport);
    assert!(matches!(result, Err(TelemetryError::Initialization(_))));
}
