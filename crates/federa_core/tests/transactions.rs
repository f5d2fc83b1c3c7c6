use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use federa_core::command::{Insert, Select};
use federa_core::debug::{DEBUG_BACKEND, DebugXaResource, XaCall, XaOp};
use federa_core::transaction::{BranchState, TransactionState, Xid};
use federa_core::{
    Command, ConnectorConfig, ConnectorManager, ExecutionContext, ExecutionState, FactoryRegistry, FederaConfig,
    Value,
};
use federa_error::{BranchError, BranchErrorKind, ConnectorError, HeuristicOutcome};

fn manager() -> ConnectorManager {
    let seed = r#"{"tables": {"t": {"columns": ["a"], "rows": [[1]]}}}"#;
    let mut a = ConnectorConfig::new("a", DEBUG_BACKEND);
    a.properties.insert("seed".to_string(), seed.to_string());
    let mut b = ConnectorConfig::new("b", DEBUG_BACKEND);
    b.properties.insert("seed".to_string(), seed.to_string());
    let config = FederaConfig {
        connectors: vec![a, b],
        ..Default::default()
    };
    ConnectorManager::new(&FactoryRegistry::with_builtin(), &config).unwrap()
}

fn xid(gtrid: &str) -> Xid {
    Xid::new(0x4644, gtrid.as_bytes().to_vec(), b"root".to_vec()).unwrap()
}

fn insert() -> Arc<Command> {
    Arc::new(Command::Insert(Insert {
        table: "t".to_string(),
        columns: vec!["a".to_string()],
        rows: vec![vec![Value::Int(2)]],
    }))
}

#[test]
fn xid_equality_is_structural() {
    let state = RandomState::new();
    let a = Xid::new(1, vec![1, 2, 3], vec![9]).unwrap();
    let b = Xid::new(1, [1u8, 2, 3].to_vec(), vec![9]).unwrap();
    assert_eq!(a, b);
    assert_eq!(state.hash_one(&a), state.hash_one(&b));
    assert_eq!(a.key(), b.key());
    assert_eq!(a, Xid::from_key(&a.key()).unwrap());
    assert_ne!(a, Xid::new(2, vec![1, 2, 3], vec![9]).unwrap());
}

#[test]
fn two_phase_commit_across_connectors() {
    logutil::init_test();
    let manager = manager();
    let xid = xid("txn-1");
    manager.coordinator().begin(xid.clone(), "session-1").unwrap();

    for name in ["a", "b"] {
        let (_, exec) = manager
            .create_branch_execution(&xid, name, insert(), ExecutionContext::new("r"))
            .unwrap();
        exec.execute().unwrap();
        exec.close();
    }
    manager.coordinator().commit(&xid).unwrap();
    assert_eq!(None, manager.coordinator().state(&xid));
    assert!(manager.coordinator().in_doubt().is_empty());
    manager.shutdown();
}

#[test]
fn single_branch_commits_in_one_phase() {
    let xa = Arc::new(DebugXaResource::new());
    let coordinator = federa_core::transaction::TransactionCoordinator::new(Default::default());
    let xid = xid("txn-2");
    coordinator.begin(xid.clone(), "s").unwrap();
    let branch = coordinator.begin_branch(&xid, "a", xa.clone()).unwrap();
    coordinator.commit(&xid).unwrap();

    assert_eq!(vec![XaOp::Start, XaOp::End, XaOp::Commit], xa.ops());
    assert!(xa.calls().contains(&XaCall::Commit {
        xid: branch,
        one_phase: true,
    }));
}

#[test]
fn failed_prepare_rolls_back_every_branch() {
    let first = Arc::new(DebugXaResource::new());
    let second = Arc::new(DebugXaResource::new());
    second.fail_next(XaOp::Prepare, BranchError::rollback_only("constraint violated"));

    let coordinator = federa_core::transaction::TransactionCoordinator::new(Default::default());
    let xid = xid("txn-3");
    coordinator.begin(xid.clone(), "s").unwrap();
    coordinator.begin_branch(&xid, "a", first.clone()).unwrap();
    coordinator.begin_branch(&xid, "b", second.clone()).unwrap();

    let err = coordinator.commit(&xid).unwrap_err();
    assert!(matches!(
        err,
        ConnectorError::Branch(BranchError {
            kind: BranchErrorKind::RollbackOnly,
            ..
        })
    ));
    assert!(first.ops().contains(&XaOp::Rollback));
    assert!(!first.ops().contains(&XaOp::Commit));
    assert_eq!(None, coordinator.state(&xid));
}

#[test]
fn heuristic_commit_is_escalated_and_forgotten() {
    let first = Arc::new(DebugXaResource::new());
    let second = Arc::new(DebugXaResource::new());
    second.fail_next(
        XaOp::Commit,
        BranchError::heuristic(HeuristicOutcome::Mixed, "partially applied"),
    );

    let coordinator = federa_core::transaction::TransactionCoordinator::new(Default::default());
    let xid = xid("txn-4");
    coordinator.begin(xid.clone(), "s").unwrap();
    coordinator.begin_branch(&xid, "a", first).unwrap();
    let branch = coordinator.begin_branch(&xid, "b", second.clone()).unwrap();

    assert!(coordinator.commit(&xid).is_err());
    assert_eq!(Some(TransactionState::InDoubt), coordinator.state(&xid));
    let in_doubt = coordinator.in_doubt();
    assert_eq!(1, in_doubt.len());
    assert_eq!(branch, in_doubt[0].xid);
    assert_eq!("b", in_doubt[0].connector);
    assert!(coordinator
        .branch_states(&xid)
        .iter()
        .any(|(_, s)| matches!(s, BranchState::InDoubt(BranchErrorKind::Heuristic(_)))));

    coordinator.forget(&xid).unwrap();
    assert!(second.ops().contains(&XaOp::Forget));
    assert_eq!(None, coordinator.state(&xid));
}

#[test]
fn unavailable_resource_manager_is_retried() {
    let xa = Arc::new(DebugXaResource::new());
    xa.fail_next(XaOp::Commit, BranchError::unavailable("restarting"));
    xa.fail_next(XaOp::Commit, BranchError::unavailable("restarting"));

    let coordinator = federa_core::transaction::TransactionCoordinator::new(Default::default());
    let xid = xid("txn-5");
    coordinator.begin(xid.clone(), "s").unwrap();
    coordinator.begin_branch(&xid, "a", xa.clone()).unwrap();
    coordinator.commit(&xid).unwrap();

    let commits = xa.ops().into_iter().filter(|op| *op == XaOp::Commit).count();
    assert_eq!(3, commits);
}

#[test]
fn terminate_cancels_blocked_execution() {
    logutil::init_test();
    let manager = Arc::new(manager());
    let xid = xid("txn-6");
    let transaction_id = manager.coordinator().begin(xid.clone(), "owner").unwrap();

    let (_, exec) = manager
        .create_branch_execution(
            &xid,
            "a",
            Arc::new(Command::Select(Select::all("blocking"))),
            ExecutionContext::new("r"),
        )
        .unwrap();
    exec.execute().unwrap();

    let driver = {
        let exec = exec.clone();
        thread::spawn(move || exec.next())
    };
    thread::sleep(Duration::from_millis(20));

    let err = manager
        .coordinator()
        .terminate(&transaction_id, "intruder")
        .unwrap_err();
    assert!(matches!(err, ConnectorError::Security(_)));

    manager
        .coordinator()
        .terminate(&transaction_id, "owner")
        .unwrap();
    let err = driver.join().unwrap().unwrap_err();
    assert!(err.is_cancellation(), "{err}");
    assert_eq!(ExecutionState::Cancelled, exec.state());
    assert_eq!(None, manager.coordinator().state(&xid));

    exec.close();
    assert!(exec.was_cancelled());
}

#[test]
fn shutdown_rolls_back_active_transactions() {
    let manager = manager();
    let xid = xid("txn-7");
    manager.coordinator().begin(xid.clone(), "s").unwrap();
    manager
        .begin_branch(&xid, "a", &ExecutionContext::new("r"))
        .unwrap();
    manager.shutdown();
    assert_eq!(None, manager.coordinator().state(&xid));
}

#[test]
fn branch_by_branch_commit_completes_transaction() {
    let first = Arc::new(DebugXaResource::new());
    let second = Arc::new(DebugXaResource::new());
    let coordinator = federa_core::transaction::TransactionCoordinator::new(Default::default());
    let xid = xid("txn-8");
    coordinator.begin(xid.clone(), "s").unwrap();
    let a = coordinator.begin_branch(&xid, "a", first.clone()).unwrap();
    let b = coordinator.begin_branch(&xid, "b", second.clone()).unwrap();

    coordinator.prepare(&xid).unwrap();
    coordinator.commit_branch(&a, false).unwrap();
    assert_eq!(Some(TransactionState::Prepared), coordinator.state(&xid));
    coordinator.commit_branch(&b, false).unwrap();

    assert_eq!(None, coordinator.state(&xid));
    assert!(coordinator.transactions().is_empty());
    assert!(second.ops().contains(&XaOp::Commit));
}

#[test]
fn branch_by_branch_rollback_completes_transaction() {
    let first = Arc::new(DebugXaResource::new());
    let second = Arc::new(DebugXaResource::new());
    let coordinator = federa_core::transaction::TransactionCoordinator::new(Default::default());
    let xid = xid("txn-9");
    coordinator.begin(xid.clone(), "s").unwrap();
    let a = coordinator.begin_branch(&xid, "a", first).unwrap();
    let b = coordinator.begin_branch(&xid, "b", second).unwrap();

    coordinator.rollback_branch(&a).unwrap();
    assert_eq!(Some(TransactionState::RollbackOnly), coordinator.state(&xid));
    coordinator.rollback_branch(&b).unwrap();

    assert_eq!(None, coordinator.state(&xid));
    assert!(coordinator.transactions().is_empty());
}
