use httpmock::{Method::GET, MockServer};
use std::sync::Arc;

mod common;

use stampede::prelude::*;

// Paths used in load tests performed during these tests.
const API_PATH: &str = "/api";
const A_404_PATH: &str = "/404";

// Test iteration.
pub async fn get_api(user: &VirtualUser) -> IterationResult {
    let _response = user.get(API_PATH).await?;
    Ok(())
}

#[test]
// Ten users start immediately against a server that always returns 200, hold,
// then all stop at once.
fn always_200() {
    let server = MockServer::start();
    let api = server.mock(|when, then| {
        when.method(GET).path(API_PATH);
        then.status(200);
    });

    let configuration = common::build_configuration(
        &server,
        vec!["--profile", "0,10;2s,10;2s,0", "--pause", "constant:20ms"],
    );
    let metrics = common::run_load_test(common::build_load_test(
        configuration,
        iteration!(get_api),
    ));

    assert!(metrics.total.count > 0);
    assert_eq!(api.hits(), metrics.total.count);
    assert_eq!(metrics.total.errors, 0);
    assert_eq!(metrics.total.error_rate, 0.0);
    assert_eq!(metrics.total.status_codes.get(&200), Some(&metrics.total.count));
    assert!(metrics.total.transport_errors.is_empty());
    assert_eq!(metrics.users_launched, 10);
    assert_eq!(metrics.max_users_observed, 10);
    // The whole-run total reports the peak, not the zero users left at the end.
    assert_eq!(metrics.total.users, 10);
    common::assert_consistent(&metrics);

    assert!(!metrics.snapshots.is_empty());
    for snapshot in &metrics.snapshots {
        assert_eq!(snapshot.error_rate, 0.0);
    }
    // Ten users were active by the time the first window closed.
    assert_eq!(metrics.snapshots[0].users, 10);

    let actions: Vec<ProfileAction> = metrics.history.iter().map(|h| h.action.clone()).collect();
    assert_eq!(actions.first(), Some(&ProfileAction::Increasing));
    assert_eq!(actions.last(), Some(&ProfileAction::Finished));
}

#[test]
// Nothing listens on the target: every request fails, yet the load test
// completes normally.
fn unreachable_target() {
    let server = MockServer::start();

    let configuration = common::build_configuration(
        &server,
        vec![
            "--host",
            "http://127.0.0.1:1",
            "--profile",
            "0,2;1s,2;1s,0",
            "--pause",
            "constant:20ms",
            "--timeout",
            "1",
        ],
    );
    let metrics = common::run_load_test(common::build_load_test(
        configuration,
        iteration!(http_get),
    ));

    assert!(metrics.total.count > 0);
    assert_eq!(metrics.total.errors, metrics.total.count);
    assert_eq!(metrics.total.successes, 0);
    assert_eq!(metrics.total.error_rate, 1.0);
    assert!(metrics.total.status_codes.is_empty());
    let transport_errors: usize = metrics.total.transport_errors.values().sum();
    assert_eq!(transport_errors, metrics.total.count);
    common::assert_consistent(&metrics);

    assert!(!metrics.snapshots.is_empty());
    for snapshot in &metrics.snapshots {
        assert_eq!(snapshot.error_rate, 1.0);
    }
}

#[test]
// Non-2xx responses are errors, counted by status code.
fn http_errors() {
    let server = MockServer::start();
    let missing = server.mock(|when, then| {
        when.method(GET).path(A_404_PATH);
        then.status(404);
    });

    let configuration = common::build_configuration(
        &server,
        vec!["--users", "2", "--path", A_404_PATH, "--pause", "none"],
    );
    let metrics = common::run_load_test(common::build_load_test(
        configuration,
        iteration!(http_get),
    ));

    assert!(missing.hits() > 0);
    assert_eq!(missing.hits(), metrics.total.count);
    assert_eq!(metrics.total.errors, metrics.total.count);
    assert_eq!(metrics.total.status_codes.get(&404), Some(&metrics.total.count));
    common::assert_consistent(&metrics);
}

#[test]
// Iterations can be closures.
fn closure_iteration() {
    let server = MockServer::start();
    let api = server.mock(|when, then| {
        when.method(GET).path(API_PATH);
        then.status(200);
    });

    let path: &'static str = API_PATH;
    let closure: IterationFunction = Arc::new(move |user| {
        Box::pin(async move {
            let _response = user.get(path).await?;
            Ok(())
        })
    });

    let configuration =
        common::build_configuration(&server, vec!["--users", "1", "--iterations", "3"]);
    let metrics = common::run_load_test(common::build_load_test(
        configuration,
        Iteration::new("closure", closure),
    ));

    assert_eq!(api.hits(), 3);
    assert_eq!(metrics.iterations, 3);
    assert_eq!(metrics.total.count, 3);
    assert_eq!(metrics.users_launched, 1);
}
