use kn_bridge::protocol::PipelineEvent;
use kn_core::types::{CommitRecord, Task};

#[test]
fn events_serialize_flat_with_type_tag() {
    let event = PipelineEvent::TaskStarted {
        task_id: "t1".into(),
        agent_name: "Sparky".into(),
    };
    let json: serde_json::Value = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "task_started");
    assert_eq!(json["task_id"], "t1");
    assert_eq!(json["agent_name"], "Sparky");
}

#[test]
fn unit_variant_has_only_type() {
    let json = PipelineEvent::PlanningStarted.to_json().unwrap();
    assert_eq!(json, r#"{"type":"planning_started"}"#);
}

#[test]
fn kind_matches_serialized_tag() {
    let events = vec![
        PipelineEvent::PlanningStarted,
        PipelineEvent::PlanReady {
            tasks: vec![Task::new("t1", "Build")],
            agents: vec![],
            explanation: "one step".into(),
        },
        PipelineEvent::CommitCreated(CommitRecord::empty("m", "a", "t1")),
        PipelineEvent::HumanGate {
            task_id: "t1".into(),
            question: "ok?".into(),
            context: "ctx".into(),
        },
        PipelineEvent::DeployProgress {
            step: "Compiling code...".into(),
            progress: 25,
        },
        PipelineEvent::error("x", false),
    ];
    for event in events {
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.kind());
    }
}

#[test]
fn commit_created_inlines_record_fields() {
    let mut record = CommitRecord::empty("Sparky: Build", "Sparky", "t1");
    record.sha = "abcdef1234".into();
    record.short_sha = "abcdef1".into();
    let json = serde_json::to_value(PipelineEvent::CommitCreated(record)).unwrap();
    assert_eq!(json["type"], "commit_created");
    assert_eq!(json["short_sha"], "abcdef1");
    assert_eq!(json["message"], "Sparky: Build");
}

#[test]
fn agent_message_uses_from_and_to() {
    let json = r#"{"type":"agent_message","from":"Sparky","to":"team","content":"done"}"#;
    let event: PipelineEvent = serde_json::from_str(json).unwrap();
    assert_eq!(
        event,
        PipelineEvent::AgentMessage {
            from: "Sparky".into(),
            to: "team".into(),
            content: "done".into(),
        }
    );
}
