use std::sync::Arc;

use federa_core::command::{Call, ProcedureParameter, Select};
use federa_core::debug::sheet::DEFAULT_TOKEN_VALIDITY;
use federa_core::debug::{
    FEED_BACKEND, FeedService, SHEET_BACKEND, SheetService, feed_connector, sheet_connector,
};
use federa_core::paging::{CursorPaginator, OffsetPaginator, Pager, PaginationAdapter};
use federa_core::{CancelFlag, Command, Connector, ConnectorConfig, Execution, ExecutionContext, Row, Value};
use federa_error::ConnectorError;

fn fixture(n: i64) -> Vec<Row> {
    (0..n)
        .map(|i| vec![Value::Int(i), Value::Text(format!("row {i}"))])
        .collect()
}

fn drain(exec: &dyn Execution) -> Vec<Row> {
    let mut rows = Vec::new();
    while let Some(row) = exec.next().unwrap() {
        rows.push(row);
    }
    rows
}

fn sheet(rows: Vec<Row>) -> Arc<SheetService> {
    Arc::new(SheetService::new(
        vec!["A".to_string(), "B".to_string()],
        rows,
        DEFAULT_TOKEN_VALIDITY,
    ))
}

#[test]
fn offset_round_trip_through_connector() {
    logutil::init_test();
    let service = sheet(fixture(7));
    let connector = sheet_connector(&ConnectorConfig::new("sheet", SHEET_BACKEND), service.clone()).unwrap();

    let exec = connector
        .create_execution(
            Arc::new(Command::Select(Select::all("sheet"))),
            ExecutionContext::new("r").with_batch_size(3),
        )
        .unwrap();
    exec.execute().unwrap();
    assert_eq!(fixture(7), drain(exec.as_ref()));

    assert_eq!(
        vec![
            "SELECT * FROM sheet LIMIT 3",
            "SELECT * FROM sheet LIMIT 3 OFFSET 3",
            "SELECT * FROM sheet LIMIT 3 OFFSET 6",
        ],
        service.queries()
    );
}

#[test]
fn exact_multiple_ends_on_out_of_range_status() {
    let service = sheet(fixture(4));
    let connector = sheet_connector(&ConnectorConfig::new("sheet", SHEET_BACKEND), service.clone()).unwrap();
    let exec = connector
        .create_execution(
            Arc::new(Command::Select(Select::all("sheet"))),
            ExecutionContext::new("r").with_batch_size(2),
        )
        .unwrap();
    exec.execute().unwrap();
    assert_eq!(fixture(4), drain(exec.as_ref()));
    // The third request ran past the end and was treated as end of data.
    assert_eq!(3, service.queries().len());
}

#[test]
fn expired_session_reauthenticates_once() {
    let service = sheet(fixture(5));
    let mut paginator = OffsetPaginator::new(
        federa_core::debug::sheet::SheetSource,
        "SELECT A, B",
        None,
        Default::default(),
    );
    let connector = sheet_connector(&ConnectorConfig::new("sheet", SHEET_BACKEND), service.clone()).unwrap();
    let lease = connector
        .pool()
        .lease(&federa_core::ConnectorIdentity::Singleton)
        .unwrap();
    let mut conn = lease.handle().unwrap();

    let first = paginator.fetch_page(&mut *conn, None, 2).unwrap();
    service.expire_sessions();
    let second = paginator
        .fetch_page(&mut *conn, first.next.as_ref(), 2)
        .unwrap();
    assert_eq!(fixture(5)[2..4].to_vec(), second.rows);
    // One session for the connection, one for the re-authentication.
    assert_eq!(2, service.authentications());
}

#[test]
fn label_clause_keeps_its_position() {
    let service = sheet(fixture(3));
    let connector = sheet_connector(&ConnectorConfig::new("sheet", SHEET_BACKEND), service.clone()).unwrap();
    let exec = connector
        .create_execution(
            Arc::new(Command::Call(Call {
                procedure: "native".to_string(),
                parameters: vec![ProcedureParameter::input(
                    "query",
                    Value::from("SELECT B LABEL B 'Name'"),
                )],
            })),
            ExecutionContext::new("r").with_batch_size(2),
        )
        .unwrap();
    exec.execute().unwrap();
    let rows = drain(exec.as_ref());
    assert_eq!(3, rows.len());
    assert_eq!("SELECT B LIMIT 2 LABEL B 'Name'", service.queries()[0]);
}

#[test]
fn select_limit_is_enforced_by_paging() {
    let service = sheet(fixture(10));
    let connector = sheet_connector(&ConnectorConfig::new("sheet", SHEET_BACKEND), service.clone()).unwrap();
    let mut select = Select::all("sheet");
    select.limit = Some(5);
    let exec = connector
        .create_execution(
            Arc::new(Command::Select(select)),
            ExecutionContext::new("r").with_batch_size(4),
        )
        .unwrap();
    exec.execute().unwrap();
    assert_eq!(fixture(5), drain(exec.as_ref()));
    assert_eq!("SELECT * FROM sheet LIMIT 1 OFFSET 4", service.queries()[1]);
}

#[test]
fn cursor_round_trip_through_connector() {
    logutil::init_test();
    let service = Arc::new(
        FeedService::new(
            vec!["id".to_string(), "name".to_string()],
            fixture(5),
            DEFAULT_TOKEN_VALIDITY,
        )
        .with_blank_final_token(true),
    );
    let connector = feed_connector(&ConnectorConfig::new("feed", FEED_BACKEND), service.clone()).unwrap();
    let exec = connector
        .create_execution(
            Arc::new(Command::Select(Select::all("feed"))),
            ExecutionContext::new("r").with_batch_size(2),
        )
        .unwrap();
    exec.execute().unwrap();
    assert_eq!(fixture(5), drain(exec.as_ref()));
    assert_eq!(0, service.outstanding_cursors());
}

#[test]
fn pager_over_feed_checks_cancellation() {
    let service = Arc::new(FeedService::new(
        vec!["id".to_string(), "name".to_string()],
        fixture(6),
        DEFAULT_TOKEN_VALIDITY,
    ));
    let connector = feed_connector(&ConnectorConfig::new("feed", FEED_BACKEND), service).unwrap();
    let lease = connector
        .pool()
        .lease(&federa_core::ConnectorIdentity::Singleton)
        .unwrap();
    let mut conn = lease.handle().unwrap();
    let mut paginator = CursorPaginator::new(federa_core::debug::feed::FeedSource::default());

    let cancel = CancelFlag::new();
    let mut pager = Pager::new(&mut paginator, &mut *conn, 2, cancel.clone());
    assert_eq!(2, pager.next().unwrap().unwrap().len());
    cancel.cancel();
    let err = pager.next().unwrap().unwrap_err();
    assert!(matches!(err, ConnectorError::Cancelled(_)));
}
