//! Published definitions used across the integration tests.

use serde_json::json;

use flowmill_core::definition::{ProcessDefinition, ProcessGraph};

fn published(id: &str, graph: serde_json::Value) -> ProcessDefinition {
    let graph: ProcessGraph = serde_json::from_value(graph).expect("fixture graph parses");
    ProcessDefinition::new(id, graph).with_name(id).published()
}

/// start -> review (finance, due in 60 min) -> end
pub fn linear_approval() -> ProcessDefinition {
    published(
        "linear-approval",
        json!({
            "nodes": [
                {"id": "start", "type": "start", "name": "Start"},
                {"id": "review", "type": "userTask", "name": "Review ${item}",
                 "config": {
                    "candidateGroups": ["finance"],
                    "formKey": "approval-form",
                    "formData": {"requester": "${requester}"},
                    "priority": 70,
                    "dueInMinutes": 60
                 }},
                {"id": "end", "type": "end", "name": "Done"}
            ],
            "edges": [
                {"source": "start", "target": "review"},
                {"source": "review", "target": "end"}
            ]
        }),
    )
}

/// Exclusive gateway on `amount`: < 100 auto-approves, < 1000 goes to
/// finance, anything else to legal.
pub fn amount_router() -> ProcessDefinition {
    published(
        "amount-router",
        json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "route", "type": "exclusiveGateway"},
                {"id": "auto", "type": "scriptTask",
                 "config": {"script": "approved = true; approver = 'system'"}},
                {"id": "finance", "type": "userTask", "config": {"candidateGroups": ["finance"]}},
                {"id": "legal", "type": "userTask", "config": {"assignee": "carol"}},
                {"id": "end", "type": "end"}
            ],
            "edges": [
                {"source": "start", "target": "route"},
                {"source": "route", "target": "auto", "condition": "amount < 100"},
                {"source": "route", "target": "finance", "condition": "amount < 1000"},
                {"source": "route", "target": "legal"},
                {"source": "auto", "target": "end"},
                {"source": "finance", "target": "end"},
                {"source": "legal", "target": "end"}
            ]
        }),
    )
}

/// Parallel gateway into a legal task and an ops task; both join at end.
pub fn parallel_fanout() -> ProcessDefinition {
    published(
        "parallel-fanout",
        json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "split", "type": "parallelGateway"},
                {"id": "legal", "type": "userTask", "config": {"candidateGroups": ["legal"]}},
                {"id": "ops", "type": "userTask", "config": {"candidateGroups": ["ops"]}},
                {"id": "end", "type": "end"}
            ],
            "edges": [
                {"source": "start", "target": "split"},
                {"source": "split", "target": "legal"},
                {"source": "split", "target": "ops"},
                {"source": "legal", "target": "end"},
                {"source": "ops", "target": "end"}
            ]
        }),
    )
}

/// Inclusive gateway firing every branch whose condition holds. The
/// `tag_big` condition is malformed and always counts as false.
pub fn inclusive_split() -> ProcessDefinition {
    published(
        "inclusive-split",
        json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "split", "type": "inclusiveGateway"},
                {"id": "tag_risk", "type": "scriptTask", "config": {"script": "riskChecked = true"}},
                {"id": "tag_eu", "type": "scriptTask", "config": {"script": "euChecked = true"}},
                {"id": "tag_big", "type": "scriptTask", "config": {"script": "bigChecked = true"}},
                {"id": "end", "type": "end"}
            ],
            "edges": [
                {"source": "start", "target": "split"},
                {"source": "split", "target": "tag_risk", "condition": "risk > 5"},
                {"source": "split", "target": "tag_eu", "condition": "region == 'eu'"},
                {"source": "split", "target": "tag_big", "condition": "amount >>> 3"},
                {"source": "tag_risk", "target": "end"},
                {"source": "tag_eu", "target": "end"},
                {"source": "tag_big", "target": "end"}
            ]
        }),
    )
}

/// start -> call (`serviceType` configurable) -> notify (email) -> end
pub fn service_chain(service_type: &str, error_handling: &str) -> ProcessDefinition {
    published(
        "service-chain",
        json!({
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "call", "type": "serviceTask",
                 "config": {
                    "serviceType": service_type,
                    "params": {"customer": "${customer.name}"},
                    "resultVariable": "callResult",
                    "errorHandling": error_handling,
                    "retryCount": 2
                 }},
                {"id": "notify", "type": "serviceTask",
                 "config": {"serviceType": "email", "params": {"to": "${customer.email}"}}},
                {"id": "end", "type": "end"}
            ],
            "edges": [
                {"source": "start", "target": "call"},
                {"source": "call", "target": "notify"},
                {"source": "notify", "target": "end"}
            ]
        }),
    )
}
