use gumdrop::Options;
use httpmock::{Method::GET, MockServer};
use std::time::Duration;

mod common;

use stampede::prelude::*;

const INDEX_PATH: &str = "/";
const ABOUT_PATH: &str = "/about.html";

#[test]
// Configure a load test entirely with programmatic defaults.
fn defaults() {
    let server = MockServer::start();
    let about = server.mock(|when, then| {
        when.method(GET).path(ABOUT_PATH);
        then.status(200);
    });

    let request_log = "defaults-requests.log";

    // An empty command line.
    let configuration = StampedeConfiguration::parse_args_default::<&str>(&[]).unwrap();
    let metrics = Stampede::initialize_with_config(configuration)
        .unwrap()
        .register_iteration(iteration!(http_get))
        .set_default(StampedeDefault::Host, server.base_url().as_str())
        .unwrap()
        .set_default(StampedeDefault::Path, ABOUT_PATH)
        .unwrap()
        .set_default(StampedeDefault::Profile, "0,2;1s,2;1s,0")
        .unwrap()
        .set_default(StampedeDefault::Pause, PauseDistribution::Constant(Duration::from_millis(10)))
        .unwrap()
        .set_default(StampedeDefault::SnapshotInterval, "200ms")
        .unwrap()
        .set_default(StampedeDefault::NoPrintMetrics, true)
        .unwrap()
        .set_default(StampedeDefault::RequestLog, request_log)
        .unwrap()
        .set_default(StampedeDefault::RequestFormat, LogFormat::Csv)
        .unwrap()
        .execute()
        .unwrap();

    assert!(about.hits() > 0);
    assert_eq!(about.hits(), metrics.total.count);
    assert_eq!(metrics.users_launched, 2);
    assert_eq!(common::file_length(request_log), about.hits() + 1);
    common::assert_consistent(&metrics);

    common::cleanup_files(vec![request_log]);
}

#[test]
// Options set on the command line win over programmatic defaults.
fn command_line_wins() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200);
    });

    let configuration = common::build_configuration(&server, vec!["--users", "2"]);
    let metrics = common::build_load_test(configuration, iteration!(http_get))
        // Nothing listens here, the --host on the command line is used instead.
        .set_default(StampedeDefault::Host, "http://127.0.0.1:1")
        .unwrap()
        .set_default(StampedeDefault::Users, 5)
        .unwrap()
        .execute()
        .unwrap();

    assert!(index.hits() > 0);
    assert_eq!(metrics.total.errors, 0);
    assert_eq!(metrics.users_launched, 2);
}

#[test]
fn wrong_type() {
    let stampede = Stampede::initialize_with_config(StampedeConfiguration::default()).unwrap();
    assert!(stampede.set_default(StampedeDefault::MaxUsers, "3").is_err());

    let stampede = Stampede::initialize_with_config(StampedeConfiguration::default()).unwrap();
    assert!(stampede.set_default(StampedeDefault::Profile, "soon").is_err());
}
