use std::time::Duration;

use serde_json::json;
use tokio::{task::JoinSet, time::sleep};

use super::TestServer;
use crate::client::{AcquireOptions, Acquisition, Error, LeaseController, LeaseHandle};

fn options(owner: &str) -> AcquireOptions {
    AcquireOptions {
        owner: Some(owner.to_owned()),
        timeout: None,
    }
}

async fn hold(controller: &LeaseController, name: &str, owner: &str) -> LeaseHandle {
    match controller.acquire_with(name, options(owner)).await {
        Ok(Acquisition::Held(handle)) => handle,
        other => panic!("expected to hold {name}, got {:?}", other),
    }
}

#[tokio::test]
async fn test_take_and_release_immediately() {
    let server = TestServer::start().await;
    let controller = server.controller();

    let handle = match controller.acquire("my_lock").await.unwrap() {
        Acquisition::Held(handle) => handle,
        other => panic!("expected held lease, got {:?}", other),
    };
    assert_eq!(handle.name(), "my_lock");
    assert_eq!(handle.ttl(), Duration::from_millis(15_000));
    assert_eq!(handle.renew_interval(), Duration::from_millis(7_500));

    handle.release(None).await.unwrap();
    assert!(controller.status().await.unwrap().lease.is_empty());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_waiter_receives_released_payload() {
    let server = TestServer::start().await;
    let controller = server.controller();

    let handle = hold(&controller, "job-A", "first").await;

    let waiting = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.acquire_with("job-A", options("second")).await })
    };
    sleep(Duration::from_millis(200)).await;
    assert!(!waiting.is_finished());

    handle.release(Some(json!({"some": "data"}))).await.unwrap();

    match waiting.await.unwrap().unwrap() {
        Acquisition::Delivered(data) => assert_eq!(data, json!({"some": "data"})),
        other => panic!("expected delivered payload, got {:?}", other),
    }

    let status = controller.status().await.unwrap();
    assert!(!status.lease.contains_key("job-A"));
    assert_eq!(status.lease_stats.grant, 1);
    assert_eq!(status.lease_stats.wait, 1);
    assert_eq!(status.lease_stats.release, 1);
    assert_eq!(status.lease_stats.renew, 0);
    assert_eq!(status.lease_stats.expire, 0);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_releases_many_waiters() {
    let server = TestServer::start().await;
    let controller = server.controller();

    let handle = hold(&controller, "job-C", "holder").await;

    let mut waiters = JoinSet::new();
    for _ in 0..10 {
        let controller = controller.clone();
        waiters.spawn(async move { controller.acquire("job-C").await });
    }
    // Let every waiter reach the registry before releasing
    for _ in 0..50 {
        let status = controller.status().await.unwrap();
        if status.lease["job-C"].wait_queue_length == 10 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    handle.release(Some(json!({"some": "data"}))).await.unwrap();

    let mut delivered = 0;
    while let Some(res) = waiters.join_next().await {
        match res.unwrap().unwrap() {
            Acquisition::Delivered(data) => assert_eq!(data, json!({"some": "data"})),
            other => panic!("expected delivered payload, got {:?}", other),
        }
        delivered += 1;
    }
    assert_eq!(delivered, 10);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_acquire_single_holder() {
    let server = TestServer::start().await;
    let controller = server.controller();

    let mut tasks = JoinSet::new();
    for _ in 0..10 {
        let controller = controller.clone();
        tasks.spawn(async move { controller.acquire("job-C").await });
    }

    // The holder is the one call that came back on its own
    let handle = match tasks.join_next().await.unwrap().unwrap().unwrap() {
        Acquisition::Held(handle) => handle,
        other => panic!("expected the first answer to be a grant, got {:?}", other),
    };
    sleep(Duration::from_millis(200)).await;
    assert_eq!(tasks.len(), 9);
    let status = controller.status().await.unwrap();
    assert_eq!(status.lease["job-C"].wait_queue_length, 9);
    assert_eq!(status.lease_stats.grant, 1);

    handle.release(Some(json!("done"))).await.unwrap();
    while let Some(res) = tasks.join_next().await {
        assert!(matches!(
            res.unwrap().unwrap(),
            Acquisition::Delivered(data) if data == json!("done")
        ));
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_independent_names() {
    let server = TestServer::start().await;
    let controller = server.controller();

    let mut handles = vec![];
    for name in ["foo", "bar", "baz"] {
        handles.push(hold(&controller, name, "same-owner").await);
    }
    assert_eq!(controller.status().await.unwrap().lease.len(), 3);
    for handle in handles {
        handle.release(None).await.unwrap();
    }

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_many_distinct_leases() {
    let server = TestServer::start().await;
    let controller = server.controller();

    let mut tasks = JoinSet::new();
    for i in 0..100 {
        let controller = controller.clone();
        tasks.spawn(async move {
            match controller.acquire(&format!("my_lock{i}")).await? {
                Acquisition::Held(handle) => handle.release(None).await,
                Acquisition::Delivered(_) => panic!("no lease should have been contended"),
            }
        });
    }
    while let Some(res) = tasks.join_next().await {
        res.unwrap().unwrap();
    }

    let stats = controller.status().await.unwrap().lease_stats;
    assert_eq!(stats.grant, 100);
    assert_eq!(stats.release, 100);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_acquire_times_out_waiting() {
    let server = TestServer::start().await;
    let controller = server.controller();

    let handle = hold(&controller, "my_lock", "holder").await;

    let err = controller
        .acquire_with(
            "my_lock",
            AcquireOptions {
                owner: Some("impatient".to_owned()),
                timeout: Some(Duration::from_millis(200)),
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(!err.is_lease_lost());

    handle.release(None).await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_waiter_sees_expiry() {
    let server = TestServer::start_with_ttl(Duration::from_millis(300)).await;
    let controller = server.controller();

    // Dropping the handle stops renewals, so the lease runs out
    let handle = hold(&controller, "job-B", "holder").await;
    drop(handle);

    let err = controller
        .acquire_with("job-B", options("waiter"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Expired), "unexpected error: {err}");
    assert!(err.is_lease_lost());

    let status = controller.status().await.unwrap();
    assert_eq!(status.lease_stats.expire, 1);
    assert!(status.lease.is_empty());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_renewal_keeps_lease_alive() {
    let server = TestServer::start_with_ttl(Duration::from_millis(400)).await;
    let controller = server.controller();

    let handle = hold(&controller, "long-job", "worker").await;
    assert_eq!(handle.renew_interval(), Duration::from_millis(200));

    sleep(Duration::from_millis(1000)).await;

    let status = controller.status().await.unwrap();
    let lease = &status.lease["long-job"];
    assert_eq!(lease.owner, "worker");
    assert!(lease.renew_count >= 2, "renewed {} times", lease.renew_count);
    assert!(lease.age >= 1000);
    assert_eq!(status.lease_stats.expire, 0);

    handle.release(None).await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_renewal_recovers_after_failure() {
    let server = TestServer::start_with_ttl(Duration::from_millis(400)).await;
    let controller = server.controller();
    let client = reqwest::Client::new();

    let handle = hold(&controller, "job", "worker").await;

    // Free the name behind the handle's back and let an intruder take it,
    // so the next renewal parks and times out
    let resp = client
        .put(server.lease_url("job", "worker"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let resp = client
        .post(server.lease_url("job", "intruder"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);

    // The intruder never renews, so its lease expires and a later tick
    // takes the name back
    sleep(Duration::from_millis(1300)).await;

    let status = controller.status().await.unwrap();
    let lease = &status.lease["job"];
    assert_eq!(lease.owner, "worker");
    assert!(lease.renew_count >= 1, "renewed {} times", lease.renew_count);
    assert_eq!(status.lease_stats.expire, 1);
    assert_eq!(status.lease_stats.grant, 3);
    assert!(!handle.is_released());

    handle.release(None).await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_release_abandons_parked_renewal() {
    let server = TestServer::start_with_ttl(Duration::from_millis(2000)).await;
    let controller = server.controller();
    let client = reqwest::Client::new();

    let handle = hold(&controller, "job", "worker").await;
    assert_eq!(handle.renew_interval(), Duration::from_millis(1000));

    client
        .put(server.lease_url("job", "worker"))
        .send()
        .await
        .unwrap();
    client
        .post(server.lease_url("job", "intruder"))
        .send()
        .await
        .unwrap();

    // The first renewal is now parked behind the intruder
    sleep(Duration::from_millis(1200)).await;
    assert_eq!(controller.status().await.unwrap().lease["job"].wait_queue_length, 1);

    let started = tokio::time::Instant::now();
    let err = handle.release(None).await.unwrap_err();
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "release took {:?}",
        started.elapsed()
    );
    assert!(matches!(err, Error::OwnershipConflict), "unexpected error: {err}");

    client
        .put(server.lease_url("job", "intruder"))
        .send()
        .await
        .unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_release_stops_renewal() {
    let server = TestServer::start_with_ttl(Duration::from_millis(200)).await;
    let controller = server.controller();

    let handle = hold(&controller, "job", "worker").await;
    sleep(Duration::from_millis(250)).await;
    handle.release(None).await.unwrap();
    let renewed = controller.status().await.unwrap().lease_stats.renew;

    sleep(Duration::from_millis(400)).await;
    let status = controller.status().await.unwrap();
    assert!(status.lease.is_empty());
    assert_eq!(status.lease_stats.renew, renewed);
    assert_eq!(status.lease_stats.grant, 1);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_double_release_fails_locally() {
    let server = TestServer::start().await;
    let controller = server.controller();

    let handle = hold(&controller, "job", "worker").await;
    handle.release(Some(json!({"n": 1}))).await.unwrap();
    assert!(handle.is_released());

    let err = handle.release(Some(json!({"n": 2}))).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyReleased));

    // A second PUT would have reached the server and failed with 404
    let stats = controller.status().await.unwrap().lease_stats;
    assert_eq!(stats.release, 1);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_release_of_lost_lease_reports_not_found() {
    let server = TestServer::start().await;
    let controller = server.controller();

    let handle = hold(&controller, "job", "worker").await;

    // The lease is terminated behind the handle's back
    let resp = reqwest::Client::new()
        .put(server.lease_url("job", "worker"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let err = handle.release(None).await.unwrap_err();
    assert!(matches!(err, Error::NotFound), "unexpected error: {err}");
    assert!(err.is_lease_lost());

    // The guard is spent even though the release failed
    assert!(matches!(
        handle.release(None).await.unwrap_err(),
        Error::AlreadyReleased
    ));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_answers_waiters() {
    let server = TestServer::start().await;
    let controller = server.controller();

    let _handle = hold(&controller, "job", "holder").await;
    let waiting = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.acquire_with("job", options("waiter")).await })
    };
    sleep(Duration::from_millis(100)).await;

    server.shutdown().await.unwrap();

    let err = waiting.await.unwrap().unwrap_err();
    assert!(
        matches!(err, Error::UnexpectedStatus(status) if status.as_u16() == 503),
        "unexpected error: {err}"
    );
}
