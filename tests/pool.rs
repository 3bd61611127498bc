//! End-to-end pool scenarios driven through the public API with the mock
//! codec. Tests needing deterministic timing run on the paused tokio
//! clock, which stands in for an injected `now()`.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use livery::conn::mock::{MockConnection, MockDialer};
use livery::telemetry::{self, Event};
use livery::{
    pool_status, reset_metrics, AsyncResponse, Config, Error, Origin, Pool, Request,
    RequestOptions, ResponsePart,
};

fn collect_parts(
) -> impl FnMut(ResponsePart, Vec<ResponsePart>) -> ControlFlow<Vec<ResponsePart>, Vec<ResponsePart>>
{
    |part, mut acc| {
        acc.push(part);
        ControlFlow::Continue(acc)
    }
}

async fn get(pool: &Pool<MockDialer>) -> Result<Vec<ResponsePart>, Error> {
    pool.request(
        &Request::get("/"),
        Vec::new(),
        collect_parts(),
        RequestOptions::default(),
    )
    .await
}

/// Poll `probe` through a bounded window of scheduler turns without
/// letting the paused clock advance.
async fn eventually(mut probe: impl FnMut() -> bool) -> bool {
    for _ in 0..10_000 {
        if probe() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    false
}

#[tokio::test]
async fn s1_metrics_disabled_reports_not_found() {
    let _ = tracing_subscriber::fmt::try_init();

    let origin: Origin = "http://s1.test:4000".parse().unwrap();
    let pool = Pool::new(
        origin.clone(),
        MockDialer::ok(),
        Config::default().with_name("s1").with_metrics(false),
    );

    let parts = get(&pool).await.unwrap();
    assert_eq!(parts[0], ResponsePart::Status(http::StatusCode::OK));

    assert!(matches!(
        pool_status("s1", &origin),
        Err(Error::MetricsNotFound { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn s2_twenty_concurrent_gets_on_a_pool_of_fifty() {
    let _ = tracing_subscriber::fmt::try_init();

    let origin: Origin = "http://s2.test:4000".parse().unwrap();
    let dialer = MockDialer::from_fn(|_| {
        Ok(MockConnection::ok().with_latency(Duration::from_secs(1)))
    });
    let pool = Pool::new(
        origin.clone(),
        dialer,
        Config::default().with_name("s2").with_size(50).with_metrics(true),
    );

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { get(&pool).await })
        })
        .collect();

    // All twenty reach their exchange before the paused clock moves.
    assert!(
        eventually(|| {
            pool_status("s2", &origin).unwrap()[0].in_use == 20
        })
        .await
    );

    let status = pool_status("s2", &origin).unwrap()[0];
    assert_eq!(status.available, 30);
    assert_eq!(status.in_use, 20);

    for task in tasks {
        let parts = task.await.unwrap().unwrap();
        assert_eq!(parts[0], ResponsePart::Status(http::StatusCode::OK));
    }

    assert!(
        eventually(|| {
            let status = pool_status("s2", &origin).unwrap()[0];
            status.available == 50 && status.in_use == 0
        })
        .await
    );
}

// The paused clock is exact at millisecond granularity (the timer wheel's
// resolution), so scripted dial and exchange latencies land as exact
// microsecond values in the metrics.
#[tokio::test(start_paused = true)]
async fn s3_single_get_timing() {
    let origin: Origin = "http://s3.test:4000".parse().unwrap();
    let dialer = MockDialer::from_fn(|_| {
        Ok(MockConnection::ok().with_latency(Duration::from_millis(15)))
    })
    .with_dial_delays(vec![Duration::from_millis(5)]);
    let pool = Pool::new(
        origin.clone(),
        dialer,
        Config::default().with_name("s3").with_metrics(true),
    );

    get(&pool).await.unwrap();

    let status = pool_status("s3", &origin).unwrap()[0];
    assert_eq!(status.avg_checkout_us, 5_000);
    assert_eq!(status.max_checkout_us, 5_000);
    assert_eq!(status.avg_usage_us, 15_000);
    assert_eq!(status.max_usage_us, 15_000);
}

#[tokio::test(start_paused = true)]
async fn s4_sequential_get_timings_aggregate() {
    let origin: Origin = "http://s4.test:4000".parse().unwrap();

    // Each exchange closes its connection, so every GET dials fresh with
    // the next scripted checkout duration (2, 4, .., 20 ms) and usage
    // duration (3, 6, .., 30 ms).
    let dialer = MockDialer::from_fn(|attempt| {
        Ok(MockConnection::ok()
            .with_latency(Duration::from_millis(3 * (attempt as u64 + 1)))
            .single_use())
    })
    .with_dial_delays((1..=10).map(|i| Duration::from_millis(2 * i)).collect());

    let pool = Pool::new(
        origin.clone(),
        dialer,
        Config::default().with_name("s4").with_metrics(true),
    );

    for _ in 0..10 {
        get(&pool).await.unwrap();
    }

    let status = pool_status("s4", &origin).unwrap()[0];
    assert_eq!(status.max_checkout_us, 20_000);
    assert_eq!(status.max_usage_us, 30_000);
    assert_eq!(status.avg_checkout_us, 11_000);
    assert_eq!(status.avg_usage_us, 16_500);
    assert!(status.max_checkout_us >= status.avg_checkout_us);
    assert!(status.max_usage_us >= status.avg_usage_us);
}

#[tokio::test(start_paused = true)]
async fn s5_reset_zeroes_timings_and_keeps_gauges() {
    let origin: Origin = "http://s5.test:4000".parse().unwrap();
    let dialer = MockDialer::from_fn(|_| {
        Ok(MockConnection::ok().with_latency(Duration::from_millis(15)))
    })
    .with_dial_delays(vec![Duration::from_millis(5)]);
    let pool = Pool::new(
        origin.clone(),
        dialer,
        Config::default().with_name("s5").with_size(50).with_metrics(true),
    );

    get(&pool).await.unwrap();
    assert_eq!(pool_status("s5", &origin).unwrap()[0].avg_usage_us, 15_000);

    reset_metrics("s5", &origin, Duration::from_secs(1)).await.unwrap();

    let status = pool_status("s5", &origin).unwrap()[0];
    assert_eq!(status.avg_checkout_us, 0);
    assert_eq!(status.max_checkout_us, 0);
    assert_eq!(status.avg_usage_us, 0);
    assert_eq!(status.max_usage_us, 0);
    assert_eq!(status.available, 50);
    assert_eq!(status.in_use, 0);

    // Idempotent: a second reset with no intervening traffic also succeeds.
    reset_metrics("s5", &origin, Duration::from_secs(1)).await.unwrap();
    assert_eq!(pool_status("s5", &origin).unwrap()[0].avg_checkout_us, 0);
}

#[tokio::test(start_paused = true)]
async fn s6_pool_timeout_carries_a_remediation_hint() {
    let _ = tracing_subscriber::fmt::try_init();

    let dialer = MockDialer::from_fn(|_| {
        Ok(MockConnection::ok().with_latency(Duration::from_secs(1)))
    });
    let pool = Pool::new(
        "http://s6.test:4000".parse().unwrap(),
        dialer.clone(),
        Config::default().with_size(1),
    );

    let first = tokio::spawn({
        let pool = pool.clone();
        async move { get(&pool).await }
    });

    // Wait for the first caller to hold the connection.
    assert!(eventually(|| dialer.dialed() == 1).await);

    let error = pool
        .request(
            &Request::get("/"),
            Vec::new(),
            collect_parts(),
            RequestOptions::default().with_pool_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();

    assert!(error.is_pool_timeout());
    assert!(error.to_string().contains("pool size"));

    let parts = first.await.unwrap().unwrap();
    assert_eq!(parts[0], ResponsePart::Status(http::StatusCode::OK));
}

#[tokio::test(start_paused = true)]
async fn waiters_are_served_in_fifo_order() {
    let _ = tracing_subscriber::fmt::try_init();

    let dialer = MockDialer::from_fn(|_| {
        Ok(MockConnection::ok().with_latency(Duration::from_secs(1)))
    });
    let pool = Pool::new(
        "http://fifo.test:4000".parse().unwrap(),
        dialer.clone(),
        Config::default().with_size(1),
    );

    let order = Arc::new(Mutex::new(Vec::new()));

    let holder = tokio::spawn({
        let pool = pool.clone();
        async move { get(&pool).await }
    });
    assert!(eventually(|| dialer.dialed() == 1).await);

    let mut waiters = Vec::new();
    for index in 0..3 {
        let pool = pool.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            get(&pool).await.unwrap();
            order.lock().unwrap().push(index);
        }));
        // Let this waiter enqueue before spawning the next.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    holder.await.unwrap().unwrap();
    for waiter in waiters {
        waiter.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn in_use_never_exceeds_pool_size() {
    let origin: Origin = "http://bounded.test:4000".parse().unwrap();
    let dialer = MockDialer::from_fn(|_| {
        Ok(MockConnection::ok().with_latency(Duration::from_secs(1)))
    });
    let pool = Pool::new(
        origin.clone(),
        dialer,
        Config::default().with_name("bounded").with_size(4).with_metrics(true),
    );

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move {
                get(&pool)
                    .await
                    .map_err(|error| assert!(error.is_pool_timeout()))
            })
        })
        .collect();

    // Sample the gauge while the first wave is in flight.
    let mut peak = 0;
    for _ in 0..2_000 {
        let in_use = pool_status("bounded", &origin).unwrap()[0].in_use;
        peak = peak.max(in_use);
        assert!(in_use <= 4, "in_use {in_use} exceeded the pool size");
        tokio::task::yield_now().await;
    }
    assert_eq!(peak, 4);

    for task in tasks {
        let _ = task.await.unwrap();
    }

    assert!(
        eventually(|| pool_status("bounded", &origin).unwrap()[0].in_use == 0).await
    );
}

#[tokio::test(start_paused = true)]
async fn idle_expiry_dials_fresh_and_emits_telemetry() {
    let _ = tracing_subscriber::fmt::try_init();

    let origin: Origin = "http://idle-expiry.test:4000".parse().unwrap();
    let dialer = MockDialer::from_fn(|_| {
        Ok(MockConnection::ok().with_max_idle(Duration::from_secs(30)))
    });
    let pool = Pool::new(origin.clone(), dialer.clone(), Config::default().with_size(1));

    let current = Arc::new(AtomicUsize::new(0));
    let legacy = Arc::new(AtomicUsize::new(0));
    let _subscription = telemetry::attach({
        let current = current.clone();
        let legacy = legacy.clone();
        let origin = origin.clone();
        move |event| {
            #[allow(deprecated)]
            match event {
                Event::ConnMaxIdleTimeExceeded {
                    origin: event_origin,
                    idle_time,
                } if *event_origin == origin => {
                    assert!(*idle_time >= Duration::from_secs(31));
                    current.fetch_add(1, Ordering::SeqCst);
                }
                Event::MaxIdleTimeExceeded {
                    origin: event_origin,
                    ..
                } if *event_origin == origin => {
                    legacy.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    });

    get(&pool).await.unwrap();
    assert_eq!(dialer.dialed(), 1);

    tokio::time::advance(Duration::from_secs(31)).await;

    get(&pool).await.unwrap();
    assert_eq!(dialer.dialed(), 2, "a fresh dial should replace the expired connection");
    assert_eq!(current.load(Ordering::SeqCst), 1);
    assert_eq!(legacy.load(Ordering::SeqCst), 1, "the legacy event is still dual-emitted");
}

#[tokio::test(start_paused = true)]
async fn cancelled_async_request_releases_the_connection() {
    let _ = tracing_subscriber::fmt::try_init();

    let origin: Origin = "http://cancel.test:4000".parse().unwrap();
    let dialer = MockDialer::from_fn(|_| {
        Ok(MockConnection::ok().with_latency(Duration::from_secs(60)))
    });
    let pool = Pool::new(
        origin.clone(),
        dialer.clone(),
        Config::default().with_name("cancel").with_size(1).with_metrics(true),
    );

    let (token, mut rx) = pool.async_request(Request::get("/"), RequestOptions::default());

    // The driver is mid-exchange, holding the pool's only connection.
    assert!(eventually(|| dialer.dialed() == 1).await);
    assert_eq!(pool_status("cancel", &origin).unwrap()[0].in_use, 1);

    livery::cancel_async_request(token);

    assert!(
        eventually(|| pool_status("cancel", &origin).unwrap()[0].in_use == 0).await,
        "the cancelled driver's connection should be evicted"
    );

    // No parts were delivered and no terminal message follows.
    assert!(rx.try_recv().is_err());

    // The slot is free again for the next caller.
    let (_token, mut rx) = pool.async_request(Request::get("/"), RequestOptions::default());
    tokio::time::advance(Duration::from_secs(61)).await;
    let mut done = false;
    while let Some(message) = rx.recv().await {
        if matches!(message, AsyncResponse::Done) {
            done = true;
        }
    }
    assert!(done);
}

#[tokio::test(start_paused = true)]
async fn async_request_streams_in_protocol_order_while_the_caller_lives() {
    let parts = vec![
        ResponsePart::Status(http::StatusCode::OK),
        ResponsePart::Headers(http::HeaderMap::new()),
        ResponsePart::Data(bytes::Bytes::from_static(b"chunk-1")),
        ResponsePart::Data(bytes::Bytes::from_static(b"chunk-2")),
        ResponsePart::End,
    ];
    let dialer = MockDialer::from_fn({
        let parts = parts.clone();
        move |_| Ok(MockConnection::ok().with_parts(parts.clone()))
    });
    let pool = Pool::new(
        "http://stream.test:4000".parse().unwrap(),
        dialer,
        Config::default().with_size(1),
    );

    let (_token, mut rx) = pool.async_request(Request::get("/"), RequestOptions::default());

    let mut received = Vec::new();
    loop {
        match rx.recv().await.expect("driver ended without a terminal message") {
            AsyncResponse::Part(part) => received.push(part),
            AsyncResponse::Done => break,
            AsyncResponse::Error(error) => panic!("unexpected error: {error}"),
        }
    }
    assert_eq!(received, parts);
}
