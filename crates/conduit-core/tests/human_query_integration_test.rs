//! Integration tests for the human query channel over a file-backed log.
//!
//! Two workers share one SQLite database through separate connections, the
//! way separate agent processes share the production event log.

use std::sync::Arc;
use std::time::Duration;

use conduit_core::{
    EventLog, EventType, HumanQuery, HumanQueryContext, NO_RESPONSE_REJECTION, NewEvent,
    PollSettings, QueryKind, SqliteEventLog,
};
use serde_json::json;
use tempfile::TempDir;

fn open_log(dir: &TempDir) -> Arc<SqliteEventLog> {
    let path = dir.path().join("events.db");
    Arc::new(SqliteEventLog::open(path.to_str().unwrap()).unwrap())
}

fn worker(log: Arc<SqliteEventLog>, agent: &str) -> Arc<HumanQuery> {
    let context = HumanQueryContext {
        conversation_id: Some("todo-42".to_string()),
        process_instance_id: Some("proc-42".to_string()),
        tenant_id: Some("acme".to_string()),
        agent_name: Some(agent.to_string()),
        recipients: Some("ops@acme.io".to_string()),
        crew_type: Some("action".to_string()),
    };
    Arc::new(HumanQuery::new(log, context, PollSettings::default()))
}

fn asked_records(log: &SqliteEventLog) -> Vec<conduit_core::EventRecord> {
    log.find_all("todo-42")
        .unwrap()
        .into_iter()
        .filter(|r| r.event_type == EventType::HumanAsked)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_two_workers_share_one_question() {
    let dir = TempDir::new().unwrap();
    let log_a = open_log(&dir);
    let log_b = open_log(&dir);
    let responder = open_log(&dir);

    let first = {
        let query = worker(log_a.clone(), "planner");
        tokio::spawn(async move { query.ask("user", "Deploy to prod?", QueryKind::Confirm, None).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    let second = {
        let query = worker(log_b.clone(), "executor");
        tokio::spawn(async move { query.ask("user", "Deploy to prod?", QueryKind::Confirm, Some(vec![])).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    let asked = asked_records(&responder);
    assert_eq!(asked.len(), 1, "the second worker must join the pending job");
    let job_id = asked[0].correlation_id.clone();
    assert_eq!(responder.notification_count().unwrap(), 1);

    tokio::time::sleep(Duration::from_secs(20)).await;
    responder
        .append(
            NewEvent::new(EventType::HumanResponse, job_id.clone())
                .conversation(Some("todo-42".to_string()))
                .data(json!({"answer": "approved"})),
        )
        .unwrap();

    assert_eq!(first.await.unwrap().unwrap(), "approved");
    assert_eq!(second.await.unwrap().unwrap(), "approved");

    // A later ask of the same question is answered from history at once.
    let third = worker(open_log(&dir), "reviewer");
    assert_eq!(third.ask("user", "Deploy to prod?", QueryKind::Confirm, None).await.unwrap(), "approved");
    assert_eq!(asked_records(&responder).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_different_questions_get_different_jobs() {
    let dir = TempDir::new().unwrap();
    let log = open_log(&dir);
    let poll = PollSettings { timeout: Duration::from_secs(6), ..PollSettings::default() };
    let context = HumanQueryContext { conversation_id: Some("todo-42".to_string()), ..HumanQueryContext::default() };
    let query = HumanQuery::new(log.clone(), context, poll);

    let options = Some(vec!["dev".to_string(), "prod".to_string()]);
    assert_eq!(query.ask("user", "Which env?", QueryKind::Select, options).await.unwrap(), NO_RESPONSE_REJECTION);
    assert_eq!(query.ask("user", "Which env?", QueryKind::Text, None).await.unwrap(), NO_RESPONSE_REJECTION);

    let asked = asked_records(&log);
    assert_eq!(asked.len(), 2);
    assert_ne!(asked[0].correlation_id, asked[1].correlation_id);
    assert_ne!(asked[0].data["signature"], asked[1].data["signature"]);
    assert_eq!(log.notification_count().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_question_is_joined_again_later() {
    let dir = TempDir::new().unwrap();
    let log = open_log(&dir);
    let poll = PollSettings { timeout: Duration::from_secs(10), ..PollSettings::default() };
    let context = HumanQueryContext { conversation_id: Some("todo-42".to_string()), ..HumanQueryContext::default() };
    let query = Arc::new(HumanQuery::new(log.clone(), context, poll));

    assert_eq!(query.ask("user", "Proceed?", QueryKind::Confirm, None).await.unwrap(), NO_RESPONSE_REJECTION);
    let job_id = asked_records(&log)[0].correlation_id.clone();

    let retry = {
        let query = Arc::clone(&query);
        tokio::spawn(async move { query.ask("user", "Proceed?", QueryKind::Confirm, None).await })
    };
    tokio::time::sleep(Duration::from_secs(3)).await;
    log.append(NewEvent::new(EventType::HumanResponse, job_id).data(json!({"answer": {"ok": false}, "by": "lee"})))
        .unwrap();

    assert_eq!(retry.await.unwrap().unwrap(), r#"{"answer": {"ok": false}, "by": "lee"}"#);
    assert_eq!(asked_records(&log).len(), 1);
}
