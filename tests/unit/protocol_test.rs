//! Tests for the worker wire protocol

use prometheus_task_pool::core::TaskError;
use prometheus_task_pool::worker::{Inbound, Outbound, TaskRequest};
use serde_json::json;

#[test]
fn test_finished_line_format() {
    let ok = Outbound::Finished { task_id: 1, outcome: Ok(json!(2)) };
    assert_eq!(
        serde_json::to_string(&ok).unwrap(),
        r#"{"type":"finished","task_id":1,"outcome":{"Ok":2}}"#
    );
    let err = Outbound::Finished { task_id: 1, outcome: Err(TaskError::Revoked) };
    assert_eq!(
        serde_json::to_string(&err).unwrap(),
        r#"{"type":"finished","task_id":1,"outcome":{"Err":"revoked"}}"#
    );
}

#[test]
fn test_run_line_parses() {
    let line = r#"{"type":"run","task_id":4,"target":"kwargs","kwargs":{"a":1}}"#;
    let Inbound::Run(TaskRequest { task_id, target, args, kwargs }) = serde_json::from_str(line).unwrap() else {
        panic!("expected run");
    };
    assert_eq!(task_id, 4);
    assert_eq!(target, "kwargs");
    assert!(args.is_empty());
    assert_eq!(kwargs.get("a"), Some(&json!(1)));
}
