//! End-to-end tests of the assembled pipeline.

use std::sync::Arc;

use courier_core::{
    metrics, Channel, ClientBuilder, ClientConfig, ClientError, Endpoint, NodeSelectionStrategy,
    Request,
};
use courier_metrics::{MetricId, MetricRegistry};
use http::{header, HeaderValue, Method, StatusCode};

use crate::mocks::{settle, Script, TransportStub};

fn endpoint() -> Endpoint {
    Endpoint::new("test-service", "op", Method::GET, "/op")
}

fn response_meter(status: &'static str) -> MetricId {
    MetricId::new(metrics::CLIENT_RESPONSE)
        .with_tag("channel-name", "test-channel")
        .with_tag("service-name", "test-service")
        .with_tag("endpoint", "op")
        .with_tag("status", status)
}

#[tokio::test]
async fn request_flows_through_the_whole_pipeline() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Arc::new(MetricRegistry::new());
    let host = TransportStub::always(StatusCode::OK);
    let client = ClientBuilder::new(ClientConfig::new("test-channel"), Arc::clone(&registry))
        .host("https://host-a", Arc::clone(&host) as Arc<dyn Channel>)
        .build()
        .unwrap();

    let response = client.execute(&endpoint(), &Request::new()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    response.close();

    assert_eq!(host.hits(), 1);
    assert_eq!(registry.meter_count(&response_meter("success")), Some(1));
}

#[tokio::test]
async fn saturated_host_queues_then_overflows() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Arc::new(MetricRegistry::new());
    // Twenty hangs soak up the host's entire initial concurrency limit.
    let host = TransportStub::new((0..20).map(|_| Script::Hang).collect());
    let config = ClientConfig::new("test-channel").with_max_queue_size(2);
    let client = Arc::new(
        ClientBuilder::new(config, Arc::clone(&registry))
            .host("https://host-a", Arc::clone(&host) as Arc<dyn Channel>)
            .build()
            .unwrap(),
    );

    let mut held = Vec::new();
    for _ in 0..20 {
        let client = Arc::clone(&client);
        held.push(tokio::spawn(async move {
            client.execute(&endpoint(), &Request::new()).await
        }));
    }
    settle().await;
    assert_eq!(host.hits(), 20);

    // The limiter is saturated: the next two requests park in the queue.
    let queued_a = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.execute(&endpoint(), &Request::new()).await })
    };
    let queued_b = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.execute(&endpoint(), &Request::new()).await })
    };
    settle().await;
    assert_eq!(host.hits(), 20);

    let queued_counter =
        MetricId::new(metrics::REQUESTS_QUEUED).with_tag("channel-name", "test-channel");
    assert_eq!(registry.counter_value(&queued_counter), Some(2));

    // Queue full: the twenty-third request fails synchronously.
    let error = client.execute(&endpoint(), &Request::new()).await.unwrap_err();
    assert!(error.to_string().contains("queue is full"), "got: {error}");

    held.into_iter().for_each(|task| task.abort());
    queued_a.abort();
    queued_b.abort();
}

#[tokio::test]
async fn redirect_retries_against_the_location_host_without_spending_budget() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Arc::new(MetricRegistry::new());
    let host_a = TransportStub::always(StatusCode::OK);
    // Round-robin starts at index 1, which redirects to host a.
    let host_b = TransportStub::new(vec![Script::RespondWithHeader(
        StatusCode::PERMANENT_REDIRECT,
        header::LOCATION,
        HeaderValue::from_static("https://host-a/op"),
    )]);

    // Zero retry budget proves the redirect is not billed as a retry.
    let config = ClientConfig::new("test-channel")
        .with_max_num_retries(0)
        .with_node_selection_strategy(NodeSelectionStrategy::RoundRobin);
    let client = ClientBuilder::new(config, Arc::clone(&registry))
        .host("https://host-a", Arc::clone(&host_a) as Arc<dyn Channel>)
        .host("https://host-b", Arc::clone(&host_b) as Arc<dyn Channel>)
        .build()
        .unwrap();

    let response = client.execute(&endpoint(), &Request::new()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    response.close();

    assert_eq!(host_b.hits(), 1);
    assert_eq!(host_a.hits(), 1);
    let retry_meter = MetricId::new(metrics::REQUEST_RETRY)
        .with_tag("channel-name", "test-channel")
        .with_tag("reason", "STATUS_308");
    assert_eq!(registry.meter_count(&retry_meter), Some(1));
}

#[tokio::test(start_paused = true)]
async fn qos_response_is_retried_and_the_caller_sees_success() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Arc::new(MetricRegistry::new());
    let host = TransportStub::new(vec![Script::Respond(StatusCode::SERVICE_UNAVAILABLE)]);
    let client = ClientBuilder::new(ClientConfig::new("test-channel"), Arc::clone(&registry))
        .host("https://host-a", Arc::clone(&host) as Arc<dyn Channel>)
        .build()
        .unwrap();

    let response = client.execute(&endpoint(), &Request::new()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    response.close();
    assert_eq!(host.hits(), 2);

    let retry_meter = MetricId::new(metrics::REQUEST_RETRY)
        .with_tag("channel-name", "test-channel")
        .with_tag("reason", "STATUS_503");
    assert_eq!(registry.meter_count(&retry_meter), Some(1));
    // The QoS response shrank the ceiling to 20 * 0.9; the successful
    // retry then grew it by one part in eighteen.
    let max_gauge = MetricId::new(metrics::LIMITER_MAX)
        .with_tag("channel-name", "test-channel")
        .with_tag("hostIndex", "0");
    let expected = 20.0 * 0.9 + 1.0 / (20.0 * 0.9);
    let value = registry.gauge_value(&max_gauge).unwrap();
    assert!((value - expected).abs() < 1e-9, "got {value}, expected {expected}");
}

#[tokio::test(start_paused = true)]
async fn connection_reset_retries_on_another_host() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Arc::new(MetricRegistry::new());
    let steady = TransportStub::always(StatusCode::OK);
    // Round-robin starts at index 1, the flaky host.
    let flaky = TransportStub::new(vec![Script::Reset]);
    let config = ClientConfig::new("test-channel")
        .with_node_selection_strategy(NodeSelectionStrategy::RoundRobin);
    let client = ClientBuilder::new(config, Arc::clone(&registry))
        .host("https://host-a", Arc::clone(&steady) as Arc<dyn Channel>)
        .host("https://host-b", Arc::clone(&flaky) as Arc<dyn Channel>)
        .build()
        .unwrap();

    let response = client.execute(&endpoint(), &Request::new()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    response.close();

    assert_eq!(flaky.hits(), 1);
    assert_eq!(steady.hits(), 1);
    let retry_meter = MetricId::new(metrics::REQUEST_RETRY)
        .with_tag("channel-name", "test-channel")
        .with_tag("reason", "IO_EXCEPTION");
    assert_eq!(registry.meter_count(&retry_meter), Some(1));
    assert_eq!(registry.meter_count(&response_meter("success")), Some(1));
}

#[tokio::test]
async fn sticky_sessions_stay_on_one_host() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Arc::new(MetricRegistry::new());
    let hosts = [
        TransportStub::always(StatusCode::OK),
        TransportStub::always(StatusCode::OK),
        TransportStub::always(StatusCode::OK),
    ];
    let mut builder = ClientBuilder::new(ClientConfig::new("test-channel"), Arc::clone(&registry));
    for (i, host) in hosts.iter().enumerate() {
        builder = builder.host(format!("https://host-{i}"), Arc::clone(host) as Arc<dyn Channel>);
    }
    let client = builder.build().unwrap();

    let session = client.sticky_session();
    for _ in 0..5 {
        session.execute(&endpoint(), &Request::new()).await.unwrap().close();
    }

    let hits: Vec<usize> = hosts.iter().map(|host| host.hits()).collect();
    assert_eq!(hits.iter().sum::<usize>(), 5);
    assert_eq!(hits.iter().filter(|&&h| h > 0).count(), 1, "session moved hosts: {hits:?}");

    // A second session may pin anywhere, but it must also stay put.
    let session = client.sticky_session();
    let before: Vec<usize> = hosts.iter().map(|host| host.hits()).collect();
    for _ in 0..3 {
        session.execute(&endpoint(), &Request::new()).await.unwrap().close();
    }
    let after: Vec<usize> = hosts.iter().map(|host| host.hits()).collect();
    let grew: Vec<usize> =
        (0..3).filter(|&i| after[i] > before[i]).collect();
    assert_eq!(grew.len(), 1, "second session moved hosts: {before:?} -> {after:?}");
}

#[tokio::test]
async fn unreleased_response_body_is_reported_as_a_leak() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Arc::new(MetricRegistry::new());
    let host = TransportStub::always(StatusCode::OK);
    let client = ClientBuilder::new(ClientConfig::new("test-channel"), Arc::clone(&registry))
        .host("https://host-a", Arc::clone(&host) as Arc<dyn Channel>)
        .build()
        .unwrap();

    let response = client.execute(&endpoint(), &Request::new()).await.unwrap();
    drop(response);

    let leak = MetricId::new(metrics::RESPONSE_LEAK).with_tag("channel-name", "test-channel");
    assert_eq!(registry.meter_count(&leak), Some(1));
}

#[tokio::test]
async fn round_robin_clients_spread_load() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Arc::new(MetricRegistry::new());
    let hosts = [TransportStub::always(StatusCode::OK), TransportStub::always(StatusCode::OK)];
    let config = ClientConfig::new("test-channel")
        .with_node_selection_strategy(NodeSelectionStrategy::RoundRobin);
    let mut builder = ClientBuilder::new(config, Arc::clone(&registry));
    for (i, host) in hosts.iter().enumerate() {
        builder = builder.host(format!("https://host-{i}"), Arc::clone(host) as Arc<dyn Channel>);
    }
    let client = builder.build().unwrap();

    for _ in 0..6 {
        client.execute(&endpoint(), &Request::new()).await.unwrap().close();
    }
    assert_eq!(hosts[0].hits(), 3);
    assert_eq!(hosts[1].hits(), 3);
}

#[tokio::test]
async fn queue_full_errors_are_not_retried() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Arc::new(MetricRegistry::new());
    let host = TransportStub::new((0..20).map(|_| Script::Hang).collect());
    let config = ClientConfig::new("test-channel").with_max_queue_size(0);
    let client = Arc::new(
        ClientBuilder::new(config, Arc::clone(&registry))
            .host("https://host-a", Arc::clone(&host) as Arc<dyn Channel>)
            .build()
            .unwrap(),
    );

    let mut held = Vec::new();
    for _ in 0..20 {
        let client = Arc::clone(&client);
        held.push(tokio::spawn(async move {
            client.execute(&endpoint(), &Request::new()).await
        }));
    }
    settle().await;

    let error = client.execute(&endpoint(), &Request::new()).await.unwrap_err();
    assert!(matches!(error, ClientError::QueueFull { max_queue_size: 0 }));
    assert_eq!(host.hits(), 20);

    held.into_iter().for_each(|task| task.abort());
}

#[tokio::test]
async fn endpoint_queues_report_under_endpoint_tags() {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = Arc::new(MetricRegistry::new());
    let host = TransportStub::new(vec![Script::Hang]);
    let client = ClientBuilder::new(ClientConfig::new("test-channel"), Arc::clone(&registry))
        .host("https://host-a", Arc::clone(&host) as Arc<dyn Channel>)
        .build()
        .unwrap();

    let queue = client.endpoint_queue(&endpoint());

    // Soak up the host's concurrency so the next request has to queue.
    let mut held = Vec::new();
    for _ in 0..20 {
        held.push(queue.execute(&endpoint(), &Request::new()));
    }
    let queued = queue.execute(&endpoint(), &Request::new());

    let counter = MetricId::new(metrics::REQUESTS_ENDPOINT_QUEUED)
        .with_tag("channel-name", "test-channel")
        .with_tag("service-name", "test-service")
        .with_tag("endpoint", "op");
    assert_eq!(registry.counter_value(&counter), Some(1));

    drop(queued);
    drop(held);
}
