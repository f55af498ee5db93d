use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pagetrace_trace::{TransactionContext, Tracer};
use pagetrace_transport::{
    DeliverySink, HttpResponse, SendError, Status, Transport, TransportOptions,
};
use testkit::{ScriptedSender, rate_limited, sample_event};

fn transport(sender: ScriptedSender, buffer_size: usize) -> Transport<ScriptedSender> {
    Transport::new(
        sender,
        TransportOptions::new("http://collector.test/api/1/store/").with_buffer_size(buffer_size),
    )
}

fn remaining_secs(transport: &Transport<ScriptedSender>) -> i64 {
    let until = transport.disabled_until().expect("transport should be locked");
    (until - Utc::now()).num_milliseconds().div_euclid(1000)
}

#[tokio::test(start_paused = true)]
async fn third_send_is_rejected_while_two_are_in_flight() {
    let transport = transport(
        ScriptedSender::new().with_delay(Duration::from_millis(500)),
        2,
    );

    let first = tokio::spawn(transport.send_event(&sample_event("/a")));
    let second = tokio::spawn(transport.send_event(&sample_event("/b")));
    let third = transport.send_event(&sample_event("/c")).await;

    assert!(matches!(third, Err(SendError::BufferFull { limit: 2 })));
    assert_eq!(first.await.unwrap().unwrap(), Status::Success);
    assert_eq!(second.await.unwrap().unwrap(), Status::Success);
    assert_eq!(transport.sender().request_count(), 2);
    assert!(transport.buffer().is_ready());
}

#[tokio::test(start_paused = true)]
async fn retry_after_locks_for_the_requested_delay() {
    let transport = transport(ScriptedSender::new().respond(rate_limited("30")), 30);

    let err = transport
        .send_event(&sample_event("/home"))
        .await
        .unwrap_err();
    assert_eq!(err.response().map(|r| r.status), Some(429));
    assert!((29..=30).contains(&remaining_secs(&transport)));

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(matches!(
        transport.send_event(&sample_event("/home")).await,
        Err(SendError::RateLimited { .. })
    ));

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(
        transport.send_event(&sample_event("/home")).await.unwrap(),
        Status::Success
    );
    assert_eq!(transport.sender().request_count(), 2);
}

#[tokio::test]
async fn retry_after_header_name_is_case_insensitive() {
    let transport = transport(
        ScriptedSender::new().respond(HttpResponse::new(429).with_header("RETRY-after", "90")),
        30,
    );

    let _ = transport.send_event(&sample_event("/home")).await;

    assert!((89..=90).contains(&remaining_secs(&transport)));
}

#[tokio::test]
async fn latest_rate_limit_response_wins() {
    let transport = transport(
        ScriptedSender::new()
            .respond(rate_limited("120"))
            .respond(rate_limited("5")),
        30,
    );

    let first = transport.send_event(&sample_event("/a"));
    let second = transport.send_event(&sample_event("/b"));
    let (first, second) = futures::join!(first, second);

    assert!(first.is_err() && second.is_err());
    assert!((4..=5).contains(&remaining_secs(&transport)));
}

#[tokio::test(start_paused = true)]
async fn shorter_retry_after_replaces_active_lockout() {
    let transport = transport(
        ScriptedSender::new()
            .with_delay(Duration::from_millis(500))
            .respond(rate_limited("120"))
            .respond(rate_limited("5")),
        30,
    );

    let first = tokio::spawn(transport.send_event(&sample_event("/a")));
    tokio::task::yield_now().await;
    tokio::time::advance(Duration::from_millis(100)).await;
    let second = tokio::spawn(transport.send_event(&sample_event("/b")));

    assert!(first.await.unwrap().is_err());
    assert!((119..=120).contains(&remaining_secs(&transport)));

    assert!(second.await.unwrap().is_err());
    assert!((4..=5).contains(&remaining_secs(&transport)));
    assert!(matches!(
        transport.send_event(&sample_event("/c")).await,
        Err(SendError::RateLimited { .. })
    ));
    assert_eq!(transport.sender().request_count(), 2);
}

#[tokio::test]
async fn server_and_network_errors_do_not_back_off() {
    let transport = transport(
        ScriptedSender::new()
            .respond(HttpResponse::new(503).with_header("Retry-After", "30"))
            .fail("connection refused"),
        30,
    );

    let err = transport
        .send_event(&sample_event("/home"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SendError::Rejected {
            status: Status::Failed,
            ..
        }
    ));
    let err = transport
        .send_event(&sample_event("/home"))
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::Network(ref msg) if msg == "connection refused"));

    assert!(transport.disabled_until().is_none());
    assert!(transport.buffer().is_empty());
}

#[tokio::test]
async fn delivery_sink_ships_finished_transactions() {
    let transport = transport(ScriptedSender::new(), 30);
    let sink = Arc::new(DeliverySink::new(transport.clone()));
    let tracer = Tracer::builder().sink(sink.clone()).build();

    let tx = tracer.start_transaction(TransactionContext {
        sampled: Some(true),
        ..TransactionContext::new("/checkout", "pageload")
    });
    tx.start_child(pagetrace_trace::SpanContext::new("http.client"))
        .finish();
    tx.finish();

    assert!(sink.flush(Duration::from_secs(1)).await);
    let requests = transport.sender().requests();
    assert_eq!(requests.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["transaction"], "/checkout");
    assert_eq!(body["contexts"]["trace"]["trace_id"], tx.trace_id().as_str());
    assert_eq!(body["spans"].as_array().map(Vec::len), Some(1));
}
