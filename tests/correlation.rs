use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};

use job_correlator::{
    BoxStream, ConsumerDispatcher, ConsumerOptions, CorrelatorError, DispatchedJob, JobId,
    JobNotification, JobOptions, JobOutcome, MemorySubstrate, ProducerCorrelator, RecordingTracer,
    Settings, TracingOptions,
};

/// Test factory functions
fn roles(substrate: &Arc<MemorySubstrate>) -> (ProducerCorrelator, ConsumerDispatcher) {
    let producer = ProducerCorrelator::new(substrate.clone(), Settings::default()).unwrap();
    let consumer = ConsumerDispatcher::new(substrate.clone(), Settings::default()).unwrap();
    (producer, consumer)
}

async fn register_completing(consumer: &ConsumerDispatcher, job_type: &str, result: Value) {
    let handler = Arc::new(move |job: DispatchedJob| {
        let result = result.clone();
        async move {
            job.complete(result);
        }
    });
    consumer
        .register(&ConsumerOptions::new(job_type), handler)
        .await
        .unwrap();
}

async fn next_notification(stream: &mut BoxStream<JobNotification>) -> JobNotification {
    tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timeout waiting for notification")
        .expect("notification stream ended")
}

async fn wait_for(stream: &mut BoxStream<JobNotification>, name: &str) -> JobNotification {
    loop {
        let notification = next_notification(stream).await;
        if notification.name() == name {
            return notification;
        }
    }
}

/// Scenario A: fire-and-forget submission still surfaces the consumer's
/// result on the job-completed channel.
#[test_log::test(tokio::test)]
async fn test_completed_notification_carries_consumer_result() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, consumer) = roles(&substrate);
    register_completing(&consumer, "t1", json!({"ok": true})).await;

    let mut notifications = producer.notifications();
    let outcome = producer
        .create_job(JobOptions::new("t1").with_data(json!({"x": 1})))
        .await
        .unwrap();
    let job_id = outcome.job_id().clone();
    assert!(matches!(outcome, JobOutcome::Submitted(_)));

    let notification = wait_for(&mut notifications, "job-completed").await;
    let view = notification.view().unwrap();
    assert_eq!(view.id, job_id);
    assert_eq!(view.result, Some(json!({"ok": true})));
    assert_eq!(view.prefix, "jobs");
}

/// Property: resolve_on_complete settles with the exact value the consumer
/// passed to its completion callback, and the pending record is gone after.
#[test_log::test(tokio::test)]
async fn test_resolve_on_complete_settles_with_result() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, consumer) = roles(&substrate);
    register_completing(&consumer, "t1", json!({"answer": 42})).await;

    let outcome = producer
        .create_job(JobOptions::new("t1").resolve_on_complete())
        .await
        .unwrap();

    let view = outcome.view().expect("expected settled outcome");
    assert_eq!(view.result, Some(json!({"answer": 42})));
    assert_eq!(view.error, None);
    assert_eq!(producer.pending_count(), 0);
}

/// Property: with no waiting timeout configured, the future resolves with a
/// non-empty job id as soon as the substrate accepts the unit, before any
/// lifecycle event fires.
#[test_log::test(tokio::test)]
async fn test_fire_and_forget_resolves_before_lifecycle_events() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, consumer) = roles(&substrate);

    let handler = Arc::new(|job: DispatchedJob| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        job.complete(Value::Null);
    });
    consumer
        .register(&ConsumerOptions::new("t1"), handler)
        .await
        .unwrap();

    let start = Instant::now();
    let outcome = producer.create_job(JobOptions::new("t1")).await.unwrap();
    assert!(!outcome.job_id().as_str().is_empty());
    assert!(start.elapsed() < Duration::from_millis(150));
}

/// Scenario B: waiting timeout with no registered consumer rejects with a
/// message carrying the job id and "timeout", at approximately T and not
/// earlier.
#[test_log::test(tokio::test)]
async fn test_waiting_timeout_rejects_with_job_id() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, _consumer) = roles(&substrate);

    let start = Instant::now();
    let result = producer
        .create_job(
            JobOptions::new("t1")
                .with_waiting_timeout(50)
                .resolve_on_complete(),
        )
        .await;

    let error = result.unwrap_err();
    let message = error.to_string();
    assert!(message.contains("timeout"), "message: {message}");
    assert!(message.contains("t1:"), "message: {message}");
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(producer.pending_count(), 0);
}

/// Scenario D: a failing consumer rejects the caller and the job-failed
/// notification carries the original error message.
#[test_log::test(tokio::test)]
async fn test_consumer_failure_rejects_and_notifies() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, consumer) = roles(&substrate);

    let handler = Arc::new(|job: DispatchedJob| async move {
        job.fail("X");
    });
    consumer
        .register(&ConsumerOptions::new("t1"), handler)
        .await
        .unwrap();

    let mut notifications = producer.notifications();
    let result = producer
        .create_job(JobOptions::new("t1").resolve_on_complete())
        .await;

    match result {
        Err(CorrelatorError::JobFailed(message)) => assert_eq!(message, "X"),
        other => panic!("expected job failure, got {other:?}"),
    }

    let notification = wait_for(&mut notifications, "job-failed").await;
    assert_eq!(notification.view().unwrap().error.as_deref(), Some("X"));
    assert_eq!(producer.pending_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_resolve_on_start_settles_at_active() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, consumer) = roles(&substrate);

    let handler = Arc::new(|job: DispatchedJob| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        job.complete(json!({"late": true}));
    });
    consumer
        .register(&ConsumerOptions::new("t1"), handler)
        .await
        .unwrap();

    let outcome = producer
        .create_job(JobOptions::new("t1").resolve_on_start())
        .await
        .unwrap();

    // Settled at the active event: no result yet
    let view = outcome.view().expect("expected settled outcome");
    assert_eq!(view.result, None);
    assert_eq!(view.error, None);
    // The record stays live until the terminal event cleans it up
    assert_eq!(producer.pending_count(), 1);
}

/// `resolve_on_waiting` does not defer the submit-path resolution: with
/// neither `resolve_on_start` nor `resolve_on_complete` set, the future
/// resolves with the job id as soon as the substrate accepts the unit. The
/// waiting event can only win an actual race, and the notification still
/// flows either way.
#[test_log::test(tokio::test)]
async fn test_resolve_on_waiting_does_not_defer_submit_resolution() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, consumer) = roles(&substrate);
    register_completing(&consumer, "t1", Value::Null).await;

    let mut notifications = producer.notifications();
    let outcome = producer
        .create_job(JobOptions::new("t1").resolve_on_waiting())
        .await
        .unwrap();
    assert!(!outcome.job_id().as_str().is_empty());
    wait_for(&mut notifications, "job-waiting").await;
}

/// Property: two job types submitted to independent consumers never leak
/// units across types.
#[test_log::test(tokio::test)]
async fn test_no_cross_type_leakage() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, consumer) = roles(&substrate);
    const N: usize = 10;

    let mut seen = Vec::new();
    for job_type in ["t1", "t2"] {
        let ids: Arc<Mutex<Vec<JobId>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = ids.clone();
        let handler = Arc::new(move |job: DispatchedJob| {
            let sink = sink.clone();
            async move {
                sink.lock().push(job.id.clone());
                job.complete(Value::Null);
            }
        });
        consumer
            .register(&ConsumerOptions::new(job_type), handler)
            .await
            .unwrap();
        seen.push(ids);
    }

    let mut futures = Vec::new();
    for job_type in ["t1", "t2"] {
        for _ in 0..N {
            futures.push(producer.create_job(JobOptions::new(job_type).resolve_on_complete()));
        }
    }
    let results = futures::future::join_all(futures).await;
    assert!(results.iter().all(|r| r.is_ok()));

    for (ids, job_type) in seen.iter().zip(["t1", "t2"]) {
        let ids = ids.lock();
        assert_eq!(ids.len(), N);
        assert!(ids.iter().all(|id| id.as_str().starts_with(job_type)));
    }
}

/// Scenario C: with a tracer configured the consumer payload carries a
/// non-empty span token, and the span is finished exactly once, cleanly.
#[test_log::test(tokio::test)]
async fn test_trace_token_travels_to_consumer_and_span_closes() {
    let substrate = Arc::new(MemorySubstrate::new());
    let tracer = Arc::new(RecordingTracer::new());
    let producer =
        ProducerCorrelator::with_tracer(substrate.clone(), Settings::default(), tracer.clone())
            .unwrap();
    let consumer = ConsumerDispatcher::new(substrate.clone(), Settings::default()).unwrap();

    let payloads: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = payloads.clone();
    let handler = Arc::new(move |job: DispatchedJob| {
        let sink = sink.clone();
        async move {
            sink.lock().push(job.data.clone());
            job.complete(json!({"ok": true}));
        }
    });
    consumer
        .register(&ConsumerOptions::new("t1"), handler)
        .await
        .unwrap();

    producer
        .create_job(
            JobOptions::new("t1")
                .with_data(json!({"action": "bla"}))
                .with_tracing(TracingOptions::default())
                .resolve_on_complete(),
        )
        .await
        .unwrap();

    let payloads = payloads.lock();
    assert_eq!(payloads.len(), 1);
    let token = payloads[0]
        .get("spanId")
        .and_then(Value::as_str)
        .expect("payload missing span token");
    assert!(!token.is_empty());

    let finished = tracer.finished_spans();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].token, token);
    assert_eq!(finished[0].error, None);
}

/// A tracer-less producer embeds nothing and still completes normally.
#[test_log::test(tokio::test)]
async fn test_works_without_tracer() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, consumer) = roles(&substrate);

    let payloads: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = payloads.clone();
    let handler = Arc::new(move |job: DispatchedJob| {
        let sink = sink.clone();
        async move {
            sink.lock().push(job.data.clone());
            job.complete(Value::Null);
        }
    });
    consumer
        .register(&ConsumerOptions::new("t1"), handler)
        .await
        .unwrap();

    producer
        .create_job(
            JobOptions::new("t1")
                .with_data(json!({"action": "bla"}))
                .resolve_on_complete(),
        )
        .await
        .unwrap();

    assert_eq!(payloads.lock()[0], json!({"action": "bla"}));
}

/// Property: a waiting timeout racing the lifecycle events settles each
/// future exactly once, one way or the other.
#[test_log::test(tokio::test)]
async fn test_timeout_and_completion_race_settles_exactly_once() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, consumer) = roles(&substrate);

    let handler = Arc::new(|job: DispatchedJob| async move {
        tokio::time::sleep(Duration::from_millis(25)).await;
        job.complete(Value::Null);
    });
    consumer
        .register(&ConsumerOptions::new("t1"), handler)
        .await
        .unwrap();

    let mut futures = Vec::new();
    for _ in 0..20 {
        futures.push(producer.create_job(
            JobOptions::new("t1")
                .with_waiting_timeout(25)
                .resolve_on_complete(),
        ));
    }

    // Every future must settle; which way depends on the race
    let results = tokio::time::timeout(
        Duration::from_secs(10),
        futures::future::join_all(futures),
    )
    .await
    .expect("a future failed to settle");

    for result in results {
        match result {
            Ok(JobOutcome::Settled(_)) => {}
            Err(CorrelatorError::WaitingTimeout { .. }) => {}
            other => panic!("unexpected settlement: {other:?}"),
        }
    }
    assert_eq!(producer.pending_count(), 0);
}

/// Paused types buffer units; resuming drains them.
#[test_log::test(tokio::test)]
async fn test_pause_holds_dispatch_until_resume() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, consumer) = roles(&substrate);
    register_completing(&consumer, "t1", Value::Null).await;
    consumer.pause("t1").await.unwrap();

    let mut notifications = producer.notifications();
    producer.create_job(JobOptions::new("t1")).await.unwrap();

    // Waiting arrives, nothing progresses to completed while paused
    wait_for(&mut notifications, "job-waiting").await;
    let quiet = tokio::time::timeout(Duration::from_millis(80), async {
        wait_for(&mut notifications, "job-completed").await
    })
    .await;
    assert!(quiet.is_err());

    consumer.resume("t1").await.unwrap();
    wait_for(&mut notifications, "job-completed").await;
}

/// Stress: many concurrent submissions all settle with their own results.
#[test_log::test(tokio::test)]
async fn test_concurrent_submissions_each_get_their_own_result() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, consumer) = roles(&substrate);

    let handler = Arc::new(|job: DispatchedJob| async move {
        let id = job.id.clone();
        job.complete(json!({ "id": id.as_str() }));
    });
    consumer
        .register(&ConsumerOptions::new("t1"), handler)
        .await
        .unwrap();

    let futures: Vec<_> = (0..50)
        .map(|_| producer.create_job(JobOptions::new("t1").resolve_on_complete()))
        .collect();
    let results = futures::future::join_all(futures).await;

    assert_eq!(results.len(), 50);
    for result in results {
        let outcome = result.unwrap();
        let view = outcome.view().unwrap();
        assert_eq!(
            view.result,
            Some(json!({ "id": view.id.as_str() })),
            "result should echo the job's own id"
        );
    }
    assert_eq!(producer.pending_count(), 0);
}

/// get_job reads through to the substrate; stop_job discards a waiting unit.
#[test_log::test(tokio::test)]
async fn test_get_and_stop_job_read_through() {
    let substrate = Arc::new(MemorySubstrate::new());
    let (producer, _consumer) = roles(&substrate);

    let outcome = producer
        .create_job(JobOptions::new("t1").with_data(json!({"x": 1})))
        .await
        .unwrap();
    let id = outcome.job_id().clone();

    let snapshot = producer.get_job("t1", &id).await.unwrap();
    assert!(snapshot.is_some());

    producer.stop_job("t1", &id).await.unwrap();
    assert!(producer.get_job("t1", &id).await.unwrap().is_none());

    // Stopping again is still success
    producer.stop_job("t1", &id).await.unwrap();
}
