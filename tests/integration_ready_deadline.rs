use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use streaming_bench::cli::Role;
use streaming_bench::error::{FailureKind, SessionError};
use streaming_bench::results::RecordStatus;
use streaming_bench::session::{DataPlane, Endpoint, SessionPlan, TcpDataPlane};

mod common;

/// Opens endpoints over TCP, but receivers take `delay` to set up one case.
struct SlowSetup {
    case_index: u64,
    delay: Duration,
}

#[async_trait]
impl DataPlane for SlowSetup {
    async fn open(&self, plan: &SessionPlan) -> Result<Endpoint, SessionError> {
        if plan.role == Role::Receiver && plan.case.index == self.case_index {
            tokio::time::sleep(self.delay).await;
        }
        TcpDataPlane.open(plan).await
    }
}

/// A receiver that misses the ready deadline fails that case with a
/// `CaseTimeout`; the next case waits for it and runs normally.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_ready_fails_only_its_own_case() {
    let mut settings = common::settings(1, 1, 41500);
    settings.test_matrix.message_sizes = vec![64, 256, 1024];
    settings.test_matrix.message_counts = vec![200];
    settings.timeouts.ready = Duration::from_millis(500);

    let run = common::run_scenario_with(
        &settings,
        1,
        1,
        Arc::new(SlowSetup {
            case_index: 1,
            delay: Duration::from_millis(1500),
        }),
    )
    .await;

    let summary = run.result.expect("run completes");
    assert_eq!(summary.cases_run, 3);
    assert_eq!(summary.failed_records, 1);
    assert_eq!(run.records.len(), 3);

    for record in &run.records {
        if record.case_index == 1 {
            match &record.status {
                RecordStatus::Failed { kind, detail } => {
                    assert_eq!(*kind, FailureKind::CaseTimeout);
                    assert!(detail.contains("ready deadline"), "{}", detail);
                }
                RecordStatus::Ok => panic!("case 1 should have timed out"),
            }
            assert_eq!(record.messages_received, 0);
        } else {
            assert!(record.is_ok(), "case {} failed: {:?}", record.case_index, record.status);
            assert_eq!(record.messages_received, 200);
        }
    }
    common::assert_record_invariants(&run.records);

    for worker in run.workers {
        let outcome = worker.expect("worker shuts down cleanly");
        assert_eq!(outcome.cases_run, 2);
    }
}
