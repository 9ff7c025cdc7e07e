use gumdrop::Options;
use httpmock::MockServer;
use std::io::{self, BufRead};

use stampede::prelude::*;

/// The following options are added to the configuration unless already set:
///  - --host (the mock server)
///  - --users 1 and --run-time 1, unless a --profile is set
///  - --snapshot-interval 250ms
pub fn build_configuration(server: &MockServer, custom: Vec<&str>) -> StampedeConfiguration {
    let mut configuration: Vec<&str> = vec![];
    let server_url = server.base_url();

    configuration.extend_from_slice(&custom);

    if !configuration.contains(&"--host") {
        configuration.extend_from_slice(&["--host", server_url.as_str()]);
    }

    if !configuration.contains(&"--profile") {
        if !configuration.contains(&"--users") {
            configuration.extend_from_slice(&["--users", "1"]);
        }

        if !configuration.contains(&"--run-time") {
            configuration.extend_from_slice(&["--run-time", "1"]);
        }
    }

    if !configuration.contains(&"--snapshot-interval") {
        configuration.extend_from_slice(&["--snapshot-interval", "250ms"]);
    }

    let args: Vec<String> = configuration.iter().map(|a| a.to_string()).collect();
    StampedeConfiguration::parse_args_default(&args)
        .expect("failed to parse options and generate a configuration")
}

/// Create a load test running a single iteration.
#[allow(dead_code)]
pub fn build_load_test(configuration: StampedeConfiguration, iteration: Iteration) -> Stampede {
    Stampede::initialize_with_config(configuration)
        .unwrap()
        .register_iteration(iteration)
}

/// Run the load test, panicking if it fails.
#[allow(dead_code)]
pub fn run_load_test(stampede: Stampede) -> StampedeMetrics {
    stampede.execute().unwrap()
}

/// Check that every request was accounted for exactly once.
#[allow(dead_code)]
pub fn assert_consistent(metrics: &StampedeMetrics) {
    let windowed: usize = metrics.snapshots.iter().map(|s| s.count).sum();
    assert_eq!(windowed, metrics.total.count);
    assert_eq!(
        metrics.total.successes + metrics.total.errors,
        metrics.total.count
    );
    for snapshot in &metrics.snapshots {
        assert!(snapshot.count > 0);
        assert!(snapshot.window_start <= snapshot.window_end);
    }
}

/// The number of lines in a file, or 0 if it doesn't exist.
#[allow(dead_code)]
pub fn file_length(file_name: &str) -> usize {
    if let Ok(file) = std::fs::File::open(std::path::Path::new(file_name)) {
        io::BufReader::new(file).lines().count()
    } else {
        0
    }
}

#[allow(dead_code)]
pub fn cleanup_files(files: Vec<&str>) {
    for file in files {
        if std::path::Path::new(file).exists() {
            std::fs::remove_file(file).expect("failed to remove file");
        }
    }
}
