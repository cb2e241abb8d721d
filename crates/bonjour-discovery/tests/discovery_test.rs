//! Session multiplexing, resolve ordering and handle lifecycle, exercised
//! through the public API against the in-process driver.

use bonjour_core::{
    BroadcastConfig, DiscoveryConfig, DiscoveryError, DiscoveryEvent, DriverError, ServiceRecord,
};
use bonjour_discovery::{is_valid_service_type, Bonjour, DiscoveryStream, MemoryDriver};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const HTTP: &str = "_http._tcp";

fn bonjour(driver: MemoryDriver) -> Bonjour<MemoryDriver> {
    Bonjour::new(driver, DiscoveryConfig::default())
}

async fn next_event(stream: &mut DiscoveryStream) -> DiscoveryEvent {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("timed out waiting for a discovery event")
        .expect("stream ended")
        .expect("stream failed")
}

async fn assert_quiet(stream: &mut DiscoveryStream) {
    let next = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(next.is_err(), "unexpected item: {:?}", next);
}

fn found(name: &str) -> ServiceRecord {
    ServiceRecord::new(name, "_http._tcp.local.")
}

fn resolved(name: &str, port: u16) -> ServiceRecord {
    found(name)
        .with_address("192.168.1.20".parse().unwrap())
        .with_port(port)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_and_stop_once_for_many_subscribers() {
    let bonjour = bonjour(MemoryDriver::new());
    let context = CancellationToken::new();

    let mut streams: Vec<_> = (0..8)
        .map(|_| bonjour.start_discovery(HTTP, &context).unwrap())
        .collect();
    assert!(bonjour.driver().wait_until(|d| d.is_browsing(HTTP)).await);
    assert_eq!(bonjour.subscriber_count(HTTP), 8);

    while streams.len() > 1 {
        streams.pop();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(bonjour.driver().stops(HTTP), 0);
    }

    streams.pop();
    assert!(bonjour.driver().wait_until(|d| d.stops(HTTP) == 1).await);
    bonjour.shutdown().await;

    assert_eq!(bonjour.driver().starts(HTTP), 1);
    assert_eq!(bonjour.driver().stops(HTTP), 1);
    assert!(bonjour.active_sessions().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_types_are_independent() {
    let bonjour = bonjour(MemoryDriver::new());
    let context = CancellationToken::new();

    let http = bonjour.start_discovery(HTTP, &context).unwrap();
    let ipp = bonjour.start_discovery("_ipp._tcp", &context).unwrap();
    assert!(
        bonjour
            .driver()
            .wait_until(|d| d.is_browsing(HTTP) && d.is_browsing("_ipp._tcp"))
            .await
    );
    assert_eq!(
        bonjour.active_sessions(),
        vec!["_http._tcp.local.".to_string(), "_ipp._tcp.local.".to_string()]
    );

    drop(http);
    assert!(bonjour.driver().wait_until(|d| d.stops(HTTP) == 1).await);
    assert_eq!(bonjour.driver().stops("_ipp._tcp"), 0);
    assert!(bonjour.driver().is_browsing("_ipp._tcp"));

    drop(ipp);
    assert!(bonjour.driver().wait_until(|d| d.stops("_ipp._tcp") == 1).await);
    assert_eq!(bonjour.driver().starts(HTTP), 1);
    assert_eq!(bonjour.driver().starts("_ipp._tcp"), 1);

    // Both sessions shared one handle
    bonjour.shutdown().await;
    assert_eq!(bonjour.driver().stats().handles_acquired, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_added_events_follow_found_order() {
    let bonjour = bonjour(MemoryDriver::new().with_manual_resolve());
    let driver = bonjour.driver();
    let mut stream = bonjour.start_discovery(HTTP, &CancellationToken::new()).unwrap();
    assert!(driver.wait_until(|d| d.is_browsing(HTTP)).await);

    for name in ["F1", "F2", "F3"] {
        driver.emit_found(HTTP, found(name));
    }

    for (index, name) in ["F1", "F2", "F3"].iter().enumerate() {
        // Only one resolve is ever handed to the driver at a time
        assert!(driver.wait_until(|d| d.pending_resolves() == vec![name.to_string()]).await);
        assert_eq!(driver.stats().resolves, index + 1);

        driver.complete_resolve(resolved(name, 8000 + index as u16));
        let event = next_event(&mut stream).await;
        assert!(event.is_added());
        assert_eq!(event.service().name(), *name);
    }
    assert_quiet(&mut stream).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_removed_is_not_queued_behind_resolves() {
    let bonjour = bonjour(MemoryDriver::new().with_manual_resolve());
    let driver = bonjour.driver();
    let mut stream = bonjour.start_discovery(HTTP, &CancellationToken::new()).unwrap();
    assert!(driver.wait_until(|d| d.is_browsing(HTTP)).await);

    driver.emit_found(HTTP, found("Slow"));
    assert!(driver.wait_until(|d| d.pending_resolves().len() == 1).await);

    driver.emit_lost(HTTP, found("Gone"));
    let event = next_event(&mut stream).await;
    assert_eq!(event, DiscoveryEvent::Removed(found("Gone")));
    assert_eq!(driver.pending_resolves(), vec!["Slow".to_string()]);

    // A removal may overtake the addition of the same service
    driver.emit_lost(HTTP, found("Slow"));
    assert!(next_event(&mut stream).await.is_removed());
    driver.complete_resolve(resolved("Slow", 80));
    assert!(next_event(&mut stream).await.is_added());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_resolve_is_swallowed() {
    let bonjour = bonjour(MemoryDriver::new().with_manual_resolve());
    let driver = bonjour.driver();
    let mut stream = bonjour.start_discovery(HTTP, &CancellationToken::new()).unwrap();
    assert!(driver.wait_until(|d| d.is_browsing(HTTP)).await);

    driver.emit_found(HTTP, found("Broken"));
    driver.emit_found(HTTP, found("Healthy"));
    assert!(driver.wait_until(|d| d.pending_resolves() == vec!["Broken".to_string()]).await);

    driver.fail_resolve(5);
    assert!(driver.wait_until(|d| d.pending_resolves() == vec!["Healthy".to_string()]).await);
    driver.complete_resolve(resolved("Healthy", 80));

    let event = next_event(&mut stream).await;
    assert_eq!(event.service().name(), "Healthy");
    assert_eq!(bonjour.metrics().get_resolves_failed(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_full_backlog_drops_newest() {
    let config = DiscoveryConfig {
        backlog_capacity: 1,
        ..Default::default()
    };
    let bonjour = Bonjour::new(MemoryDriver::new().with_manual_resolve(), config);
    let driver = bonjour.driver();
    let mut stream = bonjour.start_discovery(HTTP, &CancellationToken::new()).unwrap();
    assert!(driver.wait_until(|d| d.is_browsing(HTTP)).await);

    for name in ["First", "Second", "Third"] {
        driver.emit_found(HTTP, found(name));
    }
    assert!(
        bonjour
            .driver()
            .wait_until(|_| bonjour.metrics().get_backlog_rejections() == 1)
            .await
    );

    driver.complete_resolve(resolved("First", 80));
    assert_eq!(next_event(&mut stream).await.service().name(), "First");
    assert!(driver.wait_until(|d| d.pending_resolves().len() == 1).await);
    driver.complete_resolve(resolved("Second", 80));
    assert_eq!(next_event(&mut stream).await.service().name(), "Second");

    assert_quiet(&mut stream).await;
    assert!(driver.pending_resolves().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handle_recreated_after_release() {
    let bonjour = bonjour(MemoryDriver::new().with_close_delay(Duration::from_millis(20)));
    let context = CancellationToken::new();

    let stream = bonjour.start_discovery(HTTP, &context).unwrap();
    assert!(bonjour.driver().wait_until(|d| d.is_browsing(HTTP)).await);
    assert_eq!(bonjour.guard().reference_count(), 1);

    drop(stream);
    bonjour.shutdown().await;
    assert_eq!(bonjour.guard().reference_count(), 0);
    assert!(!bonjour.guard().is_live());
    assert_eq!(bonjour.driver().stats().handles_closed, 1);

    let _stream = bonjour.start_discovery(HTTP, &context).unwrap();
    assert!(bonjour.driver().wait_until(|d| d.is_browsing(HTTP)).await);
    assert_eq!(bonjour.driver().stats().handles_acquired, 2);
    assert!(bonjour.guard().is_live());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handle_closed_by_platform_is_replaced() {
    let bonjour = bonjour(MemoryDriver::new());
    let context = CancellationToken::new();

    let http = bonjour.start_discovery(HTTP, &context).unwrap();
    assert!(bonjour.driver().wait_until(|d| d.is_browsing(HTTP)).await);
    bonjour.driver().close_all_externally();

    let _ipp = bonjour.start_discovery("_ipp._tcp", &context).unwrap();
    assert!(bonjour.driver().wait_until(|d| d.is_browsing("_ipp._tcp")).await);
    assert_eq!(bonjour.driver().stats().handles_acquired, 2);

    // The first session's lease belongs to the replaced handle
    drop(http);
    assert!(bonjour.driver().wait_until(|d| d.stops(HTTP) == 1).await);
    assert!(bonjour.guard().is_live());
    assert_eq!(bonjour.guard().reference_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_printer_scenario() {
    let bonjour = bonjour(MemoryDriver::new().with_manual_resolve());
    let driver = bonjour.driver();
    let mut stream = bonjour.start_discovery(HTTP, &CancellationToken::new()).unwrap();
    assert!(driver.wait_until(|d| d.is_browsing(HTTP)).await);

    driver.emit_found(HTTP, found("Printer"));
    assert!(driver.wait_until(|d| d.pending_resolves().len() == 1).await);
    driver.complete_resolve(resolved("Printer", 80));

    match next_event(&mut stream).await {
        DiscoveryEvent::Added(service) => {
            assert_eq!(service.name(), "Printer");
            assert_eq!(service.port(), 80);
            assert_eq!(service.host(), Some("192.168.1.20".parse().unwrap()));
        }
        other => panic!("expected Added, got {other:?}"),
    }

    driver.emit_lost(HTTP, found("Printer"));
    assert_eq!(next_event(&mut stream).await, DiscoveryEvent::Removed(found("Printer")));

    drop(stream);
    assert!(driver.wait_until(|d| d.stops(HTTP) == 1).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(driver.stops(HTTP), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_subscribers_scenario() {
    let bonjour = bonjour(MemoryDriver::new());
    let context = CancellationToken::new();

    let first = bonjour.start_discovery(HTTP, &context).unwrap();
    let mut second = bonjour.start_discovery(HTTP, &context).unwrap();
    assert!(bonjour.driver().wait_until(|d| d.is_browsing(HTTP)).await);

    drop(first);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bonjour.driver().stops(HTTP), 0);

    // The remaining subscriber still receives events
    bonjour.driver().publish(resolved("Printer", 631));
    assert_eq!(next_event(&mut second).await.service().port(), 631);

    drop(second);
    assert!(bonjour.driver().wait_until(|d| d.stops(HTTP) == 1).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_all_subscribers_see_events_without_replay() {
    let bonjour = bonjour(MemoryDriver::new());
    let context = CancellationToken::new();

    let mut early = bonjour.start_discovery(HTTP, &context).unwrap();
    assert!(bonjour.driver().wait_until(|d| d.is_browsing(HTTP)).await);
    bonjour.driver().publish(resolved("Before", 80));
    assert_eq!(next_event(&mut early).await.service().name(), "Before");

    let mut late = bonjour.start_discovery(HTTP, &context).unwrap();
    bonjour.driver().publish(resolved("After", 81));

    assert_eq!(next_event(&mut early).await.service().name(), "After");
    assert_eq!(next_event(&mut late).await.service().name(), "After");
    assert_quiet(&mut late).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_context_scenario() {
    let bonjour = bonjour(MemoryDriver::new());
    let context = CancellationToken::new();
    context.cancel();

    let mut stream = bonjour.start_discovery(HTTP, &context).unwrap();
    assert_eq!(stream.next().await, Some(Err(DiscoveryError::StaleContext)));
    assert_eq!(stream.next().await, None);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bonjour.driver().starts(HTTP), 0);
    assert_eq!(bonjour.driver().stats().handles_acquired, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resource_unavailable_ends_stream() {
    let bonjour = bonjour(MemoryDriver::new());
    bonjour.driver().fail_next_acquire("no usable network address");

    let mut stream = bonjour.start_discovery(HTTP, &CancellationToken::new()).unwrap();
    let item = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .unwrap();
    assert!(matches!(
        item,
        Some(Err(DiscoveryError::ResourceUnavailable { .. }))
    ));
    assert_eq!(stream.next().await, None);
    assert_eq!(bonjour.driver().starts(HTTP), 0);

    // A later subscription starts over with a fresh session
    drop(stream);
    let _stream = bonjour.start_discovery(HTTP, &CancellationToken::new()).unwrap();
    assert!(bonjour.driver().wait_until(|d| d.is_browsing(HTTP)).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_is_discovered() {
    let bonjour = bonjour(MemoryDriver::new());
    let context = CancellationToken::new();
    let mut stream = bonjour.start_discovery(HTTP, &context).unwrap();
    assert!(bonjour.driver().wait_until(|d| d.is_browsing(HTTP)).await);

    let mut config = BroadcastConfig::new(HTTP);
    config.name = "Kitchen Display".to_string();
    config.port = 8080;
    config.txt_records.insert("path".to_string(), "/".to_string());
    let broadcast = bonjour.start_broadcast(config, &context).await.unwrap();

    let event = next_event(&mut stream).await;
    assert!(event.is_added());
    assert_eq!(event.service().name(), "Kitchen Display");
    assert_eq!(event.service().port(), 8080);
    assert_eq!(event.service().txt_record("path"), Some("/"));
    assert_eq!(bonjour.guard().reference_count(), 2);

    drop(broadcast);
    assert!(next_event(&mut stream).await.is_removed());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_error_still_tears_down() {
    let bonjour = bonjour(MemoryDriver::new());
    let context = CancellationToken::new();

    let stream = bonjour.start_discovery(HTTP, &context).unwrap();
    assert!(bonjour.driver().wait_until(|d| d.is_browsing(HTTP)).await);
    bonjour.driver().fail_next_stop(DriverError::INTERNAL_ERROR);

    drop(stream);
    bonjour.shutdown().await;

    assert_eq!(bonjour.driver().stops(HTTP), 1);
    assert_eq!(bonjour.guard().reference_count(), 0);
    assert!(!bonjour.guard().is_live());
    assert!(bonjour.active_sessions().is_empty());
    assert_eq!(bonjour.driver().stats().handles_closed, 1);

    let _stream = bonjour.start_discovery(HTTP, &context).unwrap();
    assert!(bonjour.driver().wait_until(|d| d.starts(HTTP) == 2).await);
    assert!(bonjour.driver().is_browsing(HTTP));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_failed_callback_ends_all_streams() {
    let bonjour = bonjour(MemoryDriver::new());
    let context = CancellationToken::new();

    let mut first = bonjour.start_discovery(HTTP, &context).unwrap();
    let mut second = bonjour.start_discovery(HTTP, &context).unwrap();
    assert!(bonjour.driver().wait_until(|d| d.is_browsing(HTTP)).await);

    assert!(bonjour.driver().emit_stop_failed(HTTP, DriverError::MAX_LIMIT));

    let expected = DiscoveryError::DiscoveryFailed {
        driver: "memory".to_string(),
        service_type: "_http._tcp.local.".to_string(),
        code: DriverError::MAX_LIMIT,
    };
    for stream in [&mut first, &mut second] {
        let item = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for the failure");
        assert_eq!(item, Some(Err(expected.clone())));
        assert_eq!(stream.next().await, None);
    }

    assert!(bonjour.driver().wait_until(|d| d.stops(HTTP) == 1).await);
    assert!(bonjour.active_sessions().is_empty());
    assert_eq!(bonjour.subscriber_count(HTTP), 0);

    drop(first);
    drop(second);
    bonjour.shutdown().await;
    assert_eq!(bonjour.guard().reference_count(), 0);
    assert_eq!(bonjour.driver().stops(HTTP), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_subscribe_churn() {
    let bonjour = Arc::new(bonjour(MemoryDriver::new()));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let bonjour = bonjour.clone();
            tokio::task::spawn_blocking(move || {
                let context = CancellationToken::new();
                for _ in 0..200 {
                    let stream = bonjour.start_discovery(HTTP, &context).unwrap();
                    drop(stream);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.await.unwrap();
    }

    bonjour.shutdown().await;

    let driver = bonjour.driver();
    let stats = driver.stats();
    assert_eq!(driver.starts(HTTP), driver.stops(HTTP));
    assert!(!driver.is_browsing(HTTP));
    assert!(bonjour.active_sessions().is_empty());
    assert_eq!(stats.handles_acquired, stats.handles_closed);
    assert_eq!(bonjour.guard().reference_count(), 0);
}

#[test]
fn test_service_type_validation_scenario() {
    assert!(is_valid_service_type("_http._tcp"));
    assert!(!is_valid_service_type("http._tcp"));
    assert!(!is_valid_service_type("_http._invalidproto"));
}
