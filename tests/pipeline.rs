//! End-to-end behaviour of the `/stream` endpoint over the real router, with
//! the upstream replaced by a programmable fake.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use futures_util::StreamExt;
use tower::ServiceExt;

use common::{body_json, gateway_with, stream_request, stream_uri, test_config, FakeFetcher, BROWSER_UA};
use stream_gateway::observability::EventKind;
use stream_gateway::relay::FetchError;

const TARGET: &str = "https://cdn.example.com/media/clip.mp4";

#[tokio::test]
async fn private_and_loopback_targets_never_reach_upstream() {
    let fetcher = Arc::new(FakeFetcher::ok(b"payload", 4));
    let gw = gateway_with(test_config(), fetcher.clone());

    for target in [
        "http://127.0.0.1/admin",
        "http://10.0.0.5/video.mp4",
        "http://192.168.1.20:8080/",
        "http://169.254.169.254/latest/meta-data",
        "http://localhost/secret",
        "http://[::1]/",
        "http://media.localhost/dump",
    ] {
        let response = gw.router.clone().oneshot(stream_request(target, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{target}");

        let body = body_json(response.into_body()).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "SECURITY_DENIED", "{target}");
        let rule = body["error"]["details"]["rule"].as_str().unwrap();
        assert!(rule.starts_with("ssrf."), "{target}: {rule}");
    }

    assert_eq!(fetcher.calls(), 0);
    assert!(gw
        .sink
        .of_kind(EventKind::Suspicious)
        .iter()
        .all(|e| e.details["stage"] == "ssrf"));
}

#[tokio::test]
async fn malformed_ranges_are_rejected_before_any_fetch() {
    let fetcher = Arc::new(FakeFetcher::ok(b"payload", 4));
    let gw = gateway_with(test_config(), fetcher.clone());

    for range in ["bytes=abc-def", "bytes=-", "bytes=500-100", "items=0-10", "bytes=0-1,5-9"] {
        let response = gw
            .router
            .clone()
            .oneshot(stream_request(TARGET, Some(range)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{range}");
        let body = body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], "MALFORMED_RANGE", "{range}");
    }

    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn partial_content_is_mirrored_and_counted() {
    let payload = vec![7u8; 100];
    let fetcher = Arc::new(
        FakeFetcher::new(206)
            .header("content-type", "video/mp4")
            .header("content-length", "100")
            .header("content-range", "bytes 100-199/1000")
            .body(&payload, 32),
    );
    let gw = gateway_with(test_config(), fetcher.clone());

    let response = gw
        .router
        .clone()
        .oneshot(stream_request(TARGET, Some("bytes=100-199")))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let headers = response.headers();
    assert_eq!(headers["content-range"], "bytes 100-199/1000");
    assert_eq!(headers["accept-ranges"], "bytes");
    assert_eq!(headers["access-control-allow-origin"], "*");
    assert!(headers.contains_key("x-request-id"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.len(), 100);

    let requests = fetcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].range.as_deref(), Some("bytes=100-199"));
    assert_eq!(requests[0].user_agent.as_deref(), Some(BROWSER_UA));

    let completed = gw.sink.of_kind(EventKind::Completed);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].bytes_transferred, 100);
    assert_eq!(completed[0].status_code, Some(206));
    assert_eq!(completed[0].details["chunks"], 4);
}

#[tokio::test]
async fn repeated_requests_consume_the_budget() {
    let mut config = test_config();
    config.rate_limit.max_requests = 2;
    let fetcher = Arc::new(FakeFetcher::ok(b"payload", 7));
    let gw = gateway_with(config, fetcher.clone());

    let first = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-ratelimit-limit"], "2");
    assert_eq!(first.headers()["x-ratelimit-remaining"], "1");

    let second = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["x-ratelimit-remaining"], "0");

    let third = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = third.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));
    let body = body_json(third.into_body()).await;
    assert_eq!(body["error"]["code"], "RATE_LIMITED");

    assert_eq!(fetcher.calls(), 2);

    // A different target has its own budget.
    let other = gw
        .router
        .clone()
        .oneshot(stream_request("https://cdn.example.com/media/other.mp4", None))
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn client_disconnect_closes_the_upstream() {
    let fetcher = Arc::new(FakeFetcher::ok(b"first-chunk", 64).hang());
    let gw = gateway_with(test_config(), fetcher.clone());

    let response = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut data = response.into_body().into_data_stream();
    let chunk = data.next().await.unwrap().unwrap();
    assert_eq!(&chunk[..], b"first-chunk");
    assert!(!fetcher.upstream_closed());

    drop(data);

    tokio::time::timeout(Duration::from_secs(1), async {
        while !fetcher.upstream_closed() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upstream body should be dropped after client disconnect");

    let failed = gw.sink.of_kind(EventKind::Failed);
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].details["kind"], "CLIENT_ABORTED");
    assert_eq!(failed[0].bytes_transferred, 11);
    assert!(gw.sink.of_kind(EventKind::Completed).is_empty());
}

#[tokio::test]
async fn attack_payloads_are_denied_and_audited() {
    let fetcher = Arc::new(FakeFetcher::ok(b"payload", 4));
    let gw = gateway_with(test_config(), fetcher.clone());

    let cases = [
        ("https://cdn.example.com/play?next=javascript:alert(1)", "scheme.javascript"),
        ("https://cdn.example.com/../../etc/passwd", "traversal.dot-dot"),
        ("https://cdn.example.com/v.mp4?q=<script>alert(1)</script>", "markup.script-tag"),
    ];
    for (target, rule) in cases {
        let response = gw.router.clone().oneshot(stream_request(target, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{target}");
        let body = body_json(response.into_body()).await;
        assert_eq!(body["error"]["details"]["rule"], rule, "{target}");
    }

    let suspicious = gw.sink.of_kind(EventKind::Suspicious);
    assert_eq!(suspicious.len(), cases.len());
    for (event, (target, rule)) in suspicious.iter().zip(cases) {
        assert_eq!(event.target_url, target);
        assert_eq!(event.details["rule"], rule);
        assert_eq!(event.details["stage"], "pattern");
        assert_eq!(event.details["denied"], true);
    }
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn unparseable_attack_targets_still_emit_suspicious_events() {
    let fetcher = Arc::new(FakeFetcher::ok(b"payload", 4));
    let gw = gateway_with(test_config(), fetcher.clone());

    let response = gw
        .router
        .clone()
        .oneshot(stream_request("javascript:alert(document.cookie)", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "UNSUPPORTED_SCHEME");

    let suspicious = gw.sink.of_kind(EventKind::Suspicious);
    assert_eq!(suspicious.len(), 1);
    assert_eq!(suspicious[0].details["rule"], "scheme.javascript");
}

#[tokio::test]
async fn full_body_relay_completes_with_200() {
    let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let fetcher = Arc::new(FakeFetcher::ok(&payload, 1000));
    let gw = gateway_with(test_config(), fetcher.clone());

    let response = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "video/mp4");
    assert_eq!(response.headers()["content-length"], "4096");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], &payload[..]);
    assert_eq!(fetcher.requests()[0].range, None);

    assert_eq!(
        gw.sink.kinds(),
        vec![EventKind::Started, EventKind::Completed]
    );
    let completed = &gw.sink.of_kind(EventKind::Completed)[0];
    assert_eq!(completed.status_code, Some(200));
    assert_eq!(completed.bytes_transferred, 4096);
    assert_eq!(completed.target_url, TARGET);
    assert_eq!(completed.client_ip.to_string(), "203.0.113.10");
}

#[tokio::test]
async fn large_transfers_are_flagged() {
    let mut config = test_config();
    config.observability.large_transfer_bytes = 1000;
    let fetcher = Arc::new(FakeFetcher::ok(&[1u8; 2048], 512));
    let gw = gateway_with(config, fetcher);

    let response = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

    let large = gw.sink.of_kind(EventKind::LargeTransfer);
    assert_eq!(large.len(), 1);
    assert_eq!(large[0].bytes_transferred, 2048);
    assert_eq!(large[0].details["threshold"], 1000);
}

#[tokio::test]
async fn sampling_at_full_rate_tags_every_stream() {
    let mut config = test_config();
    config.observability.sampling_rate = 1.0;
    let gw = gateway_with(config, Arc::new(FakeFetcher::ok(b"x", 1)));

    let response = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

    assert_eq!(gw.sink.of_kind(EventKind::Sampled).len(), 1);
}

#[tokio::test]
async fn upstream_errors_map_to_gateway_statuses() {
    let cases = [
        (FakeFetcher::new(404), StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
        (FakeFetcher::new(500), StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
        (FakeFetcher::failing(FetchError::Timeout("response headers".into())), StatusCode::GATEWAY_TIMEOUT, "UPSTREAM_TIMEOUT"),
        (
            FakeFetcher::failing(FetchError::Connect("connection refused".into())),
            StatusCode::BAD_GATEWAY,
            "UPSTREAM_ERROR",
        ),
    ];

    for (fetcher, status, code) in cases {
        let gw = gateway_with(test_config(), Arc::new(fetcher));
        let response = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
        assert_eq!(response.status(), status);
        let body = body_json(response.into_body()).await;
        assert_eq!(body["error"]["code"], code);

        let failed = gw.sink.of_kind(EventKind::Failed);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].status_code, Some(status.as_u16()));
    }

    let gw = gateway_with(test_config(), Arc::new(FakeFetcher::new(404)));
    let response = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"]["details"]["upstream_status"], 404);
}

#[tokio::test]
async fn oversized_resources_are_refused_up_front() {
    let mut config = test_config();
    config.upstream.max_stream_bytes = 1024;
    let fetcher = Arc::new(FakeFetcher::ok(&[0u8; 4096], 1024));
    let gw = gateway_with(config, fetcher.clone());

    let response = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "UPSTREAM_ERROR");
    assert_eq!(body["error"]["details"]["kind"], "UPSTREAM_TOO_LARGE");
    assert!(fetcher.upstream_closed());
}

#[tokio::test]
async fn missing_user_agent_is_a_client_error() {
    let fetcher = Arc::new(FakeFetcher::ok(b"payload", 4));
    let gw = gateway_with(test_config(), fetcher.clone());

    let request = Request::builder()
        .uri(stream_uri(TARGET))
        .body(Body::empty())
        .unwrap();
    let response = gw.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "MISSING_USER_AGENT");
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn missing_target_is_a_client_error() {
    let gw = gateway_with(test_config(), Arc::new(FakeFetcher::ok(b"x", 1)));

    let request = Request::builder()
        .uri("/stream")
        .header("user-agent", BROWSER_UA)
        .body(Body::empty())
        .unwrap();
    let response = gw.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "MISSING_TARGET");
}

#[tokio::test]
async fn automated_clients_are_flagged_and_optionally_blocked() {
    let curl = |target: &str| {
        Request::builder()
            .uri(stream_uri(target))
            .header("user-agent", "curl/8.5.0")
            .body(Body::empty())
            .unwrap()
    };

    let flagged = gateway_with(test_config(), Arc::new(FakeFetcher::ok(b"x", 1)));
    let response = flagged.router.clone().oneshot(curl(TARGET)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let suspicious = flagged.sink.of_kind(EventKind::Suspicious);
    assert_eq!(suspicious.len(), 1);
    assert_eq!(suspicious[0].details["stage"], "user_agent");
    assert_eq!(suspicious[0].details["denied"], false);

    let mut config = test_config();
    config.security.block_automated_clients = true;
    let fetcher = Arc::new(FakeFetcher::ok(b"x", 1));
    let blocking = gateway_with(config, fetcher.clone());
    let response = blocking.router.clone().oneshot(curl(TARGET)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test]
async fn cross_site_referrers_must_be_allowlisted() {
    let mut config = test_config();
    config.security.referrer_allowlist = vec!["player.example.org".into()];
    let fetcher = Arc::new(FakeFetcher::ok(b"x", 1));
    let gw = gateway_with(config, fetcher.clone());

    let with_referer = |referer: &str| {
        Request::builder()
            .uri(stream_uri(TARGET))
            .header("user-agent", BROWSER_UA)
            .header("referer", referer)
            .body(Body::empty())
            .unwrap()
    };

    let allowed = gw
        .router
        .clone()
        .oneshot(with_referer("https://player.example.org/watch/1"))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    let denied = gw
        .router
        .clone()
        .oneshot(with_referer("https://hotlinker.example.net/"))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    let body = body_json(denied.into_body()).await;
    assert_eq!(body["error"]["details"]["rule"], "referrer.not-allowed");
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn concurrent_stream_capacity_is_enforced() {
    let mut config = test_config();
    config.listener.max_concurrent_streams = 1;
    let fetcher = Arc::new(FakeFetcher::ok(b"slow", 64).hang());
    let gw = gateway_with(config, fetcher.clone());

    let held = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    assert_eq!(held.status(), StatusCode::OK);
    assert_eq!(gw.gateway.available_streams(), 0);

    let rejected = gw
        .router
        .clone()
        .oneshot(stream_request("https://cdn.example.com/media/b.mp4", None))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(rejected.into_body()).await;
    assert_eq!(body["error"]["code"], "CAPACITY_EXCEEDED");

    drop(held);
    assert_eq!(gw.gateway.available_streams(), 1);

    let admitted = gw
        .router
        .clone()
        .oneshot(stream_request("https://cdn.example.com/media/c.mp4", None))
        .await
        .unwrap();
    assert_eq!(admitted.status(), StatusCode::OK);
}

#[tokio::test]
async fn capacity_rejections_leave_the_rate_budget_untouched() {
    let mut config = test_config();
    config.listener.max_concurrent_streams = 1;
    config.rate_limit.max_requests = 2;
    let fetcher = Arc::new(FakeFetcher::ok(b"slow", 64).hang());
    let gw = gateway_with(config, fetcher.clone());
    let second_target = "https://cdn.example.com/media/b.mp4";

    let held = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    assert_eq!(held.status(), StatusCode::OK);

    for _ in 0..2 {
        let rejected = gw
            .router
            .clone()
            .oneshot(stream_request(second_target, None))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    drop(held);
    let admitted = gw
        .router
        .clone()
        .oneshot(stream_request(second_target, None))
        .await
        .unwrap();
    assert_eq!(admitted.status(), StatusCode::OK);
    assert_eq!(admitted.headers()["x-ratelimit-remaining"], "1");
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn slow_clients_hold_back_the_upstream() {
    let fetcher = Arc::new(FakeFetcher::ok(&[7u8; 64 * 1024], 1024));
    let gw = gateway_with(test_config(), fetcher.clone());

    let response = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body().into_data_stream();
    let first = body.next().await.unwrap().unwrap();
    assert_eq!(first.len(), 1024);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let polls = fetcher.body_polls();
    assert!(polls <= 2, "upstream polled {polls} times for one delivered chunk");

    drop(body);
    assert!(fetcher.upstream_closed());
}

#[tokio::test]
async fn headers_only_and_failed_events_report_elapsed_time() {
    let delay = Duration::from_millis(60);

    let failing = Arc::new(
        FakeFetcher::failing(FetchError::Connect("connection refused".into())).delayed(delay),
    );
    let gw = gateway_with(test_config(), failing);
    let response = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let failed = gw.sink.of_kind(EventKind::Failed);
    assert_eq!(failed.len(), 1);
    assert!(failed[0].duration_ms >= 60, "{}", failed[0].duration_ms);
    assert_eq!(failed[0].bytes_transferred, 0);

    let slow = Arc::new(FakeFetcher::ok(&[1u8; 10], 10).delayed(delay));
    let gw = gateway_with(test_config(), slow);
    let request = Request::builder()
        .method(Method::HEAD)
        .uri(stream_uri(TARGET))
        .header("user-agent", BROWSER_UA)
        .body(Body::empty())
        .unwrap();
    let response = gw.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let completed = gw.sink.of_kind(EventKind::Completed);
    assert_eq!(completed.len(), 1);
    assert!(completed[0].duration_ms >= 60, "{}", completed[0].duration_ms);
}

#[tokio::test]
async fn head_requests_relay_headers_only() {
    let fetcher = Arc::new(FakeFetcher::ok(&[9u8; 300], 100));
    let gw = gateway_with(test_config(), fetcher.clone());

    let request = Request::builder()
        .method(Method::HEAD)
        .uri(stream_uri(TARGET))
        .header("user-agent", BROWSER_UA)
        .body(Body::empty())
        .unwrap();
    let response = gw.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-length"], "300");

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(bytes.is_empty());
    assert_eq!(fetcher.requests()[0].method, Method::HEAD);
    assert_eq!(gw.sink.of_kind(EventKind::Completed).len(), 1);
    assert_eq!(gw.gateway.available_streams(), test_config().listener.max_concurrent_streams);
}

#[tokio::test]
async fn policy_reload_applies_to_the_next_request() {
    let fetcher = Arc::new(FakeFetcher::ok(b"x", 1));
    let gw = gateway_with(test_config(), fetcher.clone());

    let before = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    assert_eq!(before.status(), StatusCode::OK);

    let mut security = test_config().security;
    security.domain_allowlist = vec!["media.example.org".into()];
    gw.gateway.reload_policy(&security).unwrap();

    let after = gw.router.clone().oneshot(stream_request(TARGET, None)).await.unwrap();
    assert_eq!(after.status(), StatusCode::FORBIDDEN);
    let body = body_json(after.into_body()).await;
    assert_eq!(body["error"]["details"]["rule"], "ssrf.domain-allowlist");
}

#[tokio::test]
async fn preflight_health_and_unknown_routes() {
    let gw = gateway_with(test_config(), Arc::new(FakeFetcher::ok(b"x", 1)));

    let preflight = Request::builder()
        .method(Method::OPTIONS)
        .uri("/stream")
        .body(Body::empty())
        .unwrap();
    let response = gw.router.clone().oneshot(preflight).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert_eq!(response.headers()["access-control-max-age"], "86400");

    let health = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let response = gw.router.clone().oneshot(health).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response.into_body()).await["status"], "ok");

    let unknown = Request::builder().uri("/admin").body(Body::empty()).unwrap();
    let response = gw.router.clone().oneshot(unknown).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response.into_body()).await["error"]["code"], "NOT_FOUND");
}
