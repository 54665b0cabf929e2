use async_trait::async_trait;
use std::sync::Arc;
use streaming_bench::cli::Role;
use streaming_bench::error::{FailureKind, SessionError};
use streaming_bench::results::RecordStatus;
use streaming_bench::session::{DataPlane, Endpoint, SessionPlan, TcpDataPlane};

mod common;

/// Opens endpoints over TCP, except that receivers fail to bind for one case.
struct FailingBind {
    case_index: u64,
}

#[async_trait]
impl DataPlane for FailingBind {
    async fn open(&self, plan: &SessionPlan) -> Result<Endpoint, SessionError> {
        if plan.role == Role::Receiver && plan.case.index == self.case_index {
            return Err(SessionError::SocketBind {
                port: 0,
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
            });
        }
        TcpDataPlane.open(plan).await
    }
}

/// A bind failure at setup fails that case's pair only; the cases around it
/// still run.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bind_failure_fails_only_the_affected_case() {
    let mut settings = common::settings(1, 1, 41400);
    settings.test_matrix.message_sizes = vec![64, 256, 1024];
    settings.test_matrix.message_counts = vec![200];

    let run = common::run_scenario_with(
        &settings,
        1,
        1,
        Arc::new(FailingBind { case_index: 1 }),
    )
    .await;

    let summary = run.result.expect("run completes");
    assert_eq!(summary.cases_run, 3);
    assert_eq!(summary.failed_records, 1);
    assert_eq!(run.records.len(), 3);

    for record in &run.records {
        if record.case_index == 1 {
            match &record.status {
                RecordStatus::Failed { kind, .. } => assert_eq!(*kind, FailureKind::SocketBindError),
                RecordStatus::Ok => panic!("case 1 should have failed"),
            }
            assert_eq!(record.messages_received, 0);
        } else {
            assert!(record.is_ok(), "case {} failed: {:?}", record.case_index, record.status);
            assert_eq!(record.messages_received, 200);
        }
    }
    common::assert_record_invariants(&run.records);
    assert!(run.workers.iter().all(|w| w.is_ok()));
}
