use httpmock::{Method::GET, MockServer};
use serial_test::serial;
use std::time::Duration;

mod common;

use stampede::prelude::*;

// Paths used in load tests performed during these tests.
const INDEX_PATH: &str = "/";
const ABOUT_PATH: &str = "/about.html";
const SLOW_PATH: &str = "/slow";

const TWO_ACTIONS: &str = r#"
users: 3
iterations: 4
actions:
  - http:
      title: Index
      method: GET
      url: SERVER_URL/
  - http:
      title: About
      method: get
      url: SERVER_URL/about.html
"#;

#[test]
/// Every user runs every action of every iteration exactly once.
fn every_action_is_recorded() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200).body("ok");
    });
    let about = server.mock(|when, then| {
        when.method(GET).path(ABOUT_PATH);
        then.status(200).body("about");
    });

    let plan = common::build_plan(TWO_ACTIONS, &server.base_url());
    let expected = plan.expected_records();
    let metrics = common::run_load_test(common::build_configuration(vec![]), plan);

    assert_eq!(expected, 24);
    assert_eq!(metrics.count, expected);
    assert_eq!(metrics.error_count, 0);
    assert_eq!(metrics.users, 3);
    assert_eq!(metrics.iterations, 4);
    index.assert_hits(12);
    about.assert_hits(12);

    let aggregate = metrics.actions.get("Index").unwrap();
    assert_eq!(aggregate.count, 12);
    assert_eq!(aggregate.size_bytes, 24);
    assert_eq!(aggregate.status_code_counts.get(&200), Some(&12));
    let aggregate = metrics.actions.get("About").unwrap();
    assert_eq!(aggregate.count, 12);
    assert_eq!(aggregate.size_bytes, 60);
}

#[test]
/// A single request records its status, size and a positive latency.
fn single_request_outcome() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200).body("ok");
    });

    let results = common::temp_file("single-request.json");
    let results_log = results.to_string_lossy().to_string();
    let plan = common::build_plan(
        r#"
users: 1
iterations: 1
actions:
  - http:
      title: Index
      method: GET
      url: SERVER_URL/
"#,
        &server.base_url(),
    );
    let metrics = common::run_load_test(
        common::build_configuration(vec!["-R", &results_log]),
        plan,
    );

    index.assert_hits(1);
    assert_eq!(metrics.count, 1);

    let records = common::read_results(&results);
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.kind.to_string(), "HTTP");
    assert_eq!(record.title, "Index");
    assert_eq!(record.user, 1);
    assert_eq!(record.iteration, 1);
    assert_eq!(record.status_code, 200);
    assert_eq!(record.size_bytes, 2);
    assert!(record.latency_nanos > 0);

    common::cleanup_files(vec![&results]);
}

#[test]
/// Transport failures are recorded with status 0 and the load test completes.
fn connection_refused_is_recorded() {
    // Bind then release a port so nothing is listening on it.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let plan = common::build_plan(
        r#"
users: 2
iterations: 2
actions:
  - http:
      title: Refused
      method: GET
      url: SERVER_URL/
"#,
        &format!("http://{}", address),
    );
    let metrics = common::run_load_test(common::build_configuration(vec![]), plan);

    assert_eq!(metrics.count, 4);
    assert_eq!(metrics.error_count, 4);
    let aggregate = metrics.actions.get("Refused").unwrap();
    assert_eq!(aggregate.status_code_counts.get(&0), Some(&4));
    assert_eq!(aggregate.size_bytes, 0);
}

#[test]
/// No more than `concurrency` actions are ever in flight, however many users there are.
fn concurrency_is_bounded() {
    let server = MockServer::start();
    let slow = server.mock(|when, then| {
        when.method(GET).path(SLOW_PATH);
        then.status(200).delay(Duration::from_millis(50));
    });

    let plan = common::build_plan(
        r#"
users: 10
iterations: 2
concurrency: 8
actions:
  - http:
      title: Slow
      method: GET
      url: SERVER_URL/slow
"#,
        &server.base_url(),
    );
    // The command line overrides the plan.
    let metrics = common::run_load_test(common::build_configuration(vec!["-c", "3"]), plan);

    slow.assert_hits(20);
    assert_eq!(metrics.count, 20);
    assert_eq!(metrics.concurrency, 3);
    assert!(metrics.peak_concurrency >= 1);
    assert!(metrics.peak_concurrency <= 3);
}

#[test]
#[serial]
/// Users are launched `rampup / users` seconds apart.
fn rampup_staggers_users() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200);
    });

    let results = common::temp_file("rampup.json");
    let results_log = results.to_string_lossy().to_string();
    let plan = common::build_plan(
        r#"
users: 5
rampup: 5
iterations: 1
actions:
  - http:
      title: Index
      method: GET
      url: SERVER_URL/
"#,
        &server.base_url(),
    );
    assert_eq!(plan.stagger(), 1.0);
    let metrics = common::run_load_test(
        common::build_configuration(vec!["-R", &results_log]),
        plan,
    );
    index.assert_hits(5);
    assert_eq!(metrics.count, 5);

    let records = common::read_results(&results);
    let first_action = |user: usize| {
        records
            .iter()
            .find(|record| record.user == user)
            .map(|record| Duration::from_nanos(record.offset_nanos))
            .unwrap()
    };
    // The first user starts right away, the fifth four seconds later.
    assert!(first_action(1) < Duration::from_millis(500));
    let fifth = first_action(5);
    assert!(fifth >= Duration::from_millis(3900), "{:?}", fifth);
    assert!(fifth < Duration::from_millis(5000), "{:?}", fifth);

    common::cleanup_files(vec![&results]);
}

#[test]
#[serial]
/// Users pause `users / rampup * actions` seconds between iterations.
fn pacing_between_iterations() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200);
    });

    let results = common::temp_file("pacing.json");
    let results_log = results.to_string_lossy().to_string();
    let plan = common::build_plan(
        r#"
users: 1
rampup: 2
iterations: 3
actions:
  - http:
      title: Index
      method: GET
      url: SERVER_URL/
"#,
        &server.base_url(),
    );
    assert_eq!(plan.pacing(), 0.5);
    let metrics = common::run_load_test(
        common::build_configuration(vec!["-R", &results_log]),
        plan,
    );
    index.assert_hits(3);
    assert_eq!(metrics.count, 3);

    let mut records = common::read_results(&results);
    records.sort_by_key(|record| record.iteration);
    for pair in records.windows(2) {
        let gap = Duration::from_nanos(pair[1].offset_nanos - pair[0].offset_nanos);
        assert!(gap >= Duration::from_millis(490), "{:?}", gap);
    }
    // No pause follows the last iteration.
    assert!(metrics.duration < 2.0);

    common::cleanup_files(vec![&results]);
}

#[test]
/// The test plan can be loaded from the file named on the command line.
fn plan_from_file() {
    let server = MockServer::start();
    let index = server.mock(|when, then| {
        when.method(GET).path(INDEX_PATH);
        then.status(200);
    });
    let about = server.mock(|when, then| {
        when.method(GET).path(ABOUT_PATH);
        then.status(200);
    });

    let plan_file = common::temp_file("plan.yaml");
    std::fs::write(
        &plan_file,
        TWO_ACTIONS.replace(common::SERVER_URL, &server.base_url()),
    )
    .unwrap();
    let plan_path = plan_file.to_string_lossy().to_string();

    let configuration = common::build_configuration(vec![plan_path.as_str()]);
    let metrics = Stampede::initialize_with_config(configuration)
        .unwrap()
        .execute()
        .unwrap();
    assert_eq!(metrics.count, 24);
    index.assert_hits(12);
    about.assert_hits(12);

    common::cleanup_files(vec![&plan_file]);
}
