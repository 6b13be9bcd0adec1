use gumdrop::Options;
use std::path::PathBuf;

use stampede::prelude::*;

/// Placeholder replaced with the base url of the mock server in test plans.
pub const SERVER_URL: &str = "SERVER_URL";

/// Build a configuration from command line style options.
///
/// Metrics aren't displayed unless a test asks for them.
pub fn build_configuration(custom: Vec<&str>) -> StampedeConfiguration {
    let mut configuration: Vec<&str> = vec!["--no-print-metrics"];
    configuration.extend_from_slice(&custom);

    // Parse these options to generate a StampedeConfiguration.
    StampedeConfiguration::parse_args_default(&configuration)
        .expect("failed to parse options and generate a configuration")
}

/// Decode a YAML test plan, pointing every `SERVER_URL` at `server_url`.
pub fn build_plan(yaml: &str, server_url: &str) -> TestPlan {
    TestPlan::from_yaml(&yaml.replace(SERVER_URL, server_url)).expect("failed to decode test plan")
}

/// Run a load test to completion and return its metrics.
pub fn run_load_test(configuration: StampedeConfiguration, plan: TestPlan) -> StampedeMetrics {
    Stampede::initialize_with_config(configuration)
        .unwrap()
        .set_plan(plan)
        .execute()
        .unwrap()
}

/// Run a load test that is expected to fail and return the error.
#[allow(dead_code)]
pub fn run_load_test_fail(configuration: StampedeConfiguration, plan: TestPlan) -> StampedeError {
    match Stampede::initialize_with_config(configuration)
        .unwrap()
        .set_plan(plan)
        .execute()
    {
        Ok(_) => panic!("load test was expected to fail"),
        Err(e) => e,
    }
}

/// A file name in the temporary directory unique to this test process.
#[allow(dead_code)]
pub fn temp_file(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("stampede-{}-{}", std::process::id(), name))
}

/// Read every record of a JSON results log.
#[allow(dead_code)]
pub fn read_results(path: &PathBuf) -> Vec<OutcomeRecord> {
    std::fs::read_to_string(path)
        .expect("failed to read results log")
        .lines()
        .map(|line| serde_json::from_str(line).expect("failed to decode outcome record"))
        .collect()
}

/// Helper to delete test artifacts, if existing.
#[allow(dead_code)]
pub fn cleanup_files(files: Vec<&PathBuf>) {
    for file in files {
        if file.exists() {
            std::fs::remove_file(file).expect("failed to remove file");
        }
    }
}
