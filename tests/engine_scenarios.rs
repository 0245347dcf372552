mod common;

use common::*;
use mechaflow::actor::Actor;
use mechaflow::error::EngineError;
use mechaflow::runtime::{ActivityState, EndReason, EventKind, InstanceState};
use mechaflow::workflow::ids::{ActivityId, WorkflowId};
use serde_json::{json, Value};

fn approval_definition() -> Value {
    json!({
        "id": "wf-approval",
        "name": "Approval",
        "trigger": {"type": "mapping", "config": {
            "fields": {"manager": "manager", "amount": "amount"},
            "required": ["manager"]
        }},
        "variables": [{"id": "manager"}, {"id": "amount"}, {"id": "approved"}],
        "activities": [
            {"id": "start", "type": "startEvent"},
            {"id": "review", "type": "userTask", "config": {
                "name": "Review request",
                "assignee": {"variable": "manager"},
                "reminder": {"after_secs": 3600},
                "escalation": {"after_secs": 7200, "to": {"literal": "director"}}
            }},
            {"id": "end", "type": "endEvent"}
        ],
        "transitions": [{"from": "start", "to": "review"}, {"from": "review", "to": "end"}]
    })
}

fn join_definition() -> Value {
    json!({
        "id": "wf-join",
        "variables": [{"id": "a"}, {"id": "b"}, {"id": "c"}, {"id": "outcome"}],
        "activities": [
            {"id": "fork", "type": "parallelGateway"},
            {"id": "wa", "type": "receiveTask"},
            {"id": "wb", "type": "receiveTask"},
            {"id": "wc", "type": "receiveTask"},
            {"id": "join", "type": "parallelGateway"},
            {"id": "done", "type": "setVariable", "config": {"variable": "outcome", "value": {"literal": "joined"}}}
        ],
        "transitions": [
            {"from": "fork", "to": "wa"}, {"from": "fork", "to": "wb"}, {"from": "fork", "to": "wc"},
            {"from": "wa", "to": "join"}, {"from": "wb", "to": "join"}, {"from": "wc", "to": "join"},
            {"from": "join", "to": "done"}
        ]
    })
}

#[tokio::test]
async fn test_synchronous_workflow_ends_on_start() {
    let h = make_harness();
    h.deploy(json!({
        "id": "wf-sync",
        "variables": [{"id": "greeting"}],
        "activities": [
            {"id": "start", "type": "startEvent"},
            {"id": "greet", "type": "setVariable", "config": {"variable": "greeting", "value": {"literal": "hello"}}},
            {"id": "end", "type": "endEvent"}
        ],
        "transitions": [{"from": "start", "to": "greet"}, {"from": "greet", "to": "end"}]
    }))
    .await;

    let instance = h.start("wf-sync", json!({})).await;

    assert_eq!(instance.state, InstanceState::Ended);
    assert_eq!(instance.end_reason, Some(EndReason::Completed));
    assert_eq!(instance.variables[&var("greeting")], json!("hello"));
    let stored = h.engine.load_instance(&instance.id).await.unwrap();
    assert_eq!(stored, instance);
    assert!(h.engine.jobs_for_instance(&instance.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_user_task_waits_then_signal_ends_instance() {
    let h = make_harness();
    h.deploy(approval_definition()).await;

    let instance = h.start("wf-approval", json!({"manager": "ann", "amount": 250})).await;

    assert_eq!(instance.state, InstanceState::Active);
    assert_eq!(instance.waiting_activity_instances().len(), 1);
    let review = waiting(&instance, "review");
    let task = h.task_of(&instance).await;
    assert_eq!(task.name, "Review request");
    assert_eq!(task.assignee.as_ref().map(|u| u.as_str()), Some("ann"));
    assert_eq!(task.activity_instance_id.as_ref(), Some(&review));
    assert_eq!(h.engine.jobs_for_instance(&instance.id).await.unwrap().len(), 2);

    let ended = h
        .engine
        .signal(&instance.id, &review, vars(json!({"approved": true})), &Actor::user("ann"))
        .await
        .unwrap();

    assert_eq!(ended.state, InstanceState::Ended);
    assert_eq!(ended.variables[&var("approved")], json!(true));
    assert_eq!(ended.version, 1);
    assert!(h.tasks.inner.get(&task.id).await.unwrap().completed);
    assert_eq!(h.engine.load_instance(&instance.id).await.unwrap(), ended);
}

#[tokio::test]
async fn test_signal_from_other_user_is_rejected_and_discarded() {
    let h = make_harness();
    h.deploy(approval_definition()).await;
    let instance = h.start("wf-approval", json!({"manager": "ann"})).await;
    let review = waiting(&instance, "review");

    let err = h
        .engine
        .signal(&instance.id, &review, vars(json!({"approved": true})), &Actor::user("mallory"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Unauthorized { .. }), "{err}");

    let stored = h.engine.load_instance(&instance.id).await.unwrap();
    assert_eq!(stored.version, 0);
    assert_eq!(stored.activity_instance(&review).unwrap().state, ActivityState::Waiting);
    assert_eq!(stored.variables[&var("approved")], Value::Null);

    // the failed signal released its claim
    let ended = h
        .engine
        .signal(&instance.id, &review, vars(json!({"approved": false})), &Actor::user("ann"))
        .await
        .unwrap();
    assert_eq!(ended.state, InstanceState::Ended);
}

#[tokio::test]
async fn test_parallel_join_every_arrival_order() {
    let orders = [
        ["wa", "wb", "wc"],
        ["wa", "wc", "wb"],
        ["wb", "wa", "wc"],
        ["wb", "wc", "wa"],
        ["wc", "wa", "wb"],
        ["wc", "wb", "wa"],
    ];
    let h = make_harness();
    h.deploy(join_definition()).await;

    let mut finals = Vec::new();
    for order in orders {
        let mut instance = h.start("wf-join", json!({})).await;
        assert_eq!(instance.waiting_activity_instances().len(), 3);

        for (arrived, activity) in order.iter().enumerate() {
            let id = waiting(&instance, activity);
            let key = &activity[1..];
            instance = h
                .engine
                .signal(&instance.id, &id, [(var(key), json!(arrived))].into_iter().collect(), &Actor::System)
                .await
                .unwrap();

            if arrived < 2 {
                assert_eq!(instance.state, InstanceState::Active, "order {:?}", order);
                let join = instance
                    .activity_instances
                    .values()
                    .find(|ai| ai.activity_id == ActivityId::new("join"))
                    .unwrap();
                assert_eq!(join.state, ActivityState::Waiting);
                assert_eq!(join.join.as_ref().unwrap().arrived.len(), arrived + 1);
            }
        }

        assert_eq!(instance.state, InstanceState::Ended, "order {:?}", order);
        assert_eq!(count_of(&instance, "join"), 1);
        assert_eq!(count_of(&instance, "done"), 1);
        let root_scope_ends = instance
            .events_of(EventKind::ScopeEnded)
            .filter(|e| e.activity_instance_id.is_none())
            .count();
        assert_eq!(root_scope_ends, 1);
        finals.push((
            instance.variables[&var("outcome")].clone(),
            instance.variables.keys().cloned().collect::<Vec<_>>(),
        ));
    }

    assert!(finals.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(finals[0].0, json!("joined"));
}

#[tokio::test]
async fn test_cancel_aborts_tree_and_deletes_pending_jobs() {
    let h = make_harness();
    h.deploy(approval_definition()).await;
    let instance = h.start("wf-approval", json!({"manager": "ann"})).await;
    let review = waiting(&instance, "review");
    assert_eq!(h.engine.jobs_for_instance(&instance.id).await.unwrap().len(), 2);

    let cancelled = h.engine.cancel(&instance.id, &Actor::user("ops")).await.unwrap();

    assert_eq!(cancelled.state, InstanceState::Ended);
    assert_eq!(cancelled.end_reason, Some(EndReason::Cancelled));
    assert!(cancelled.activity_instances.values().all(|ai| ai.state == ActivityState::Ended));
    assert!(cancelled.activity_instance(&review).unwrap().aborted);
    assert_eq!(cancelled.events_of(EventKind::InstanceCancelled).count(), 1);
    assert!(h.engine.jobs_for_instance(&instance.id).await.unwrap().is_empty());

    let err = h
        .engine
        .signal(&instance.id, &review, vars(json!({})), &Actor::user("ann"))
        .await
        .unwrap_err();
    assert!(err.is_concurrent_modification(), "{err}");

    let err = h.engine.cancel(&instance.id, &Actor::System).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }), "{err}");
}

#[tokio::test]
async fn test_invalid_definition_reports_every_violation_and_is_not_stored() {
    let h = make_harness();
    let err = h
        .engine
        .deploy(
            &serde_json::from_value(json!({
                "id": "wf-broken",
                "activities": [
                    {"id": "a", "type": "teleport"},
                    {"id": "b", "type": "setVariable", "config": {"variable": "ghost", "value": {"literal": 1}}}
                ],
                "transitions": [{"from": "a", "to": "nowhere"}]
            }))
            .unwrap(),
        )
        .await
        .unwrap_err();

    let EngineError::Parse(parse) = err else {
        panic!("expected a parse error, got {err}");
    };
    assert_eq!(parse.workflow_id, "wf-broken");
    assert!(parse.violations.len() >= 3, "{parse}");
    assert!(h.store.load_workflow_sources().await.unwrap().is_empty());
    assert!(h.engine.context().workflows.get(&WorkflowId::new("wf-broken")).is_none());
}

#[tokio::test]
async fn test_start_errors() {
    let h = make_harness();
    h.deploy(approval_definition()).await;

    let err = h
        .engine
        .start(&WorkflowId::new("wf-missing"), vars(json!({})), &Actor::System)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownWorkflow(_)));

    let err = h
        .engine
        .start(&WorkflowId::new("wf-approval"), vars(json!({"amount": 3})), &Actor::System)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput { .. }), "{err}");
}

#[tokio::test]
async fn test_deploy_json_persists_source() {
    let h = make_harness();
    let workflow = h
        .engine
        .deploy_json(r#"{"id": "wf-json", "activities": [{"id": "only", "type": "noneTask"}]}"#)
        .await
        .unwrap();
    assert_eq!(workflow.id.as_str(), "wf-json");

    let sources = h.store.load_workflow_sources().await.unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0], workflow.source);

    let err = h.engine.deploy_json("{ not json").await.unwrap_err();
    assert!(matches!(err, EngineError::Parse(_)));
}

#[tokio::test]
async fn test_wide_fork_lists_and_cancels_in_creation_order() {
    let branches: Vec<String> = (1..=12).map(|n| format!("w{}", n)).collect();
    let mut activities = vec![json!({"id": "fork", "type": "parallelGateway"})];
    activities.extend(branches.iter().map(|id| json!({"id": id, "type": "receiveTask"})));
    let transitions: Vec<Value> = branches.iter().map(|id| json!({"from": "fork", "to": id})).collect();

    let h = make_harness();
    h.deploy(json!({"id": "wf-wide", "activities": activities, "transitions": transitions}))
        .await;
    let instance = h.start("wf-wide", json!({})).await;

    let waiting: Vec<String> = instance
        .waiting_activity_instances()
        .iter()
        .map(|ai| ai.activity_id.to_string())
        .collect();
    assert_eq!(waiting, branches);

    let cancelled = h.engine.cancel(&instance.id, &Actor::System).await.unwrap();
    let aborted: Vec<String> = cancelled
        .events_of(EventKind::ActivityAborted)
        .filter_map(|e| e.activity_instance_id.as_ref())
        .map(|id| cancelled.activity_instance(id).unwrap().activity_id.to_string())
        .collect();
    assert_eq!(aborted, branches);
    assert_eq!(h.engine.load_instance(&instance.id).await.unwrap(), cancelled);
}
