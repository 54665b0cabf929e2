use std::time::Duration;
use streaming_bench::error::BenchError;

mod common;

/// Four workers expected, three show up: the run fails before any case and
/// the workers that did register are sent home.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registration_timeout_produces_no_records() {
    let mut settings = common::settings(1, 3, 41300);
    settings.timeouts.registration = Duration::from_millis(1500);

    let run = common::run_scenario(&settings, 1, 2).await;

    match run.result {
        Err(BenchError::RegistrationTimeout {
            expected,
            registered,
            ..
        }) => {
            assert_eq!(expected, 4);
            assert_eq!(registered, 3);
        }
        other => panic!("expected a registration timeout, got {:?}", other),
    }
    assert!(run.records.is_empty());

    for worker in run.workers {
        let outcome = worker.expect("registered workers get SHUTDOWN");
        assert_eq!(outcome.cases_run, 0);
    }
}
