use kn_bridge::event_bus::EventBus;
use kn_bridge::protocol::PipelineEvent;

#[test]
fn test_new_bus_has_no_subscribers() {
    let bus = EventBus::new();
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn test_publish_delivers_to_multiple_subscribers() {
    let bus = EventBus::new();
    let rx1 = bus.subscribe();
    let rx2 = bus.subscribe();

    bus.publish(PipelineEvent::PlanningStarted);

    assert_eq!(rx1.try_recv().unwrap(), PipelineEvent::PlanningStarted);
    assert_eq!(rx2.try_recv().unwrap(), PipelineEvent::PlanningStarted);
}

#[test]
fn test_events_arrive_in_publish_order() {
    let bus = EventBus::new();
    let rx = bus.subscribe();

    for id in ["t1", "t2", "t3"] {
        bus.publish(PipelineEvent::TaskCompleted {
            task_id: id.into(),
            summary: String::new(),
        });
    }

    let mut seen = Vec::new();
    while let Ok(PipelineEvent::TaskCompleted { task_id, .. }) = rx.try_recv() {
        seen.push(task_id);
    }
    assert_eq!(seen, vec!["t1", "t2", "t3"]);
}

#[test]
fn test_dropped_receiver_is_pruned() {
    let bus = EventBus::new();
    let rx1 = bus.subscribe();
    let rx2 = bus.subscribe();
    drop(rx1);

    bus.publish(PipelineEvent::PlanningStarted);

    assert_eq!(bus.subscriber_count(), 1);
    assert!(rx2.try_recv().is_ok());
}

#[test]
fn test_subscriber_misses_earlier_events() {
    let bus = EventBus::new();
    bus.publish(PipelineEvent::PlanningStarted);
    let rx = bus.subscribe();
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_clone_shares_subscribers() {
    let bus = EventBus::new();
    let clone = bus.clone();
    let rx = bus.subscribe();

    clone.publish(PipelineEvent::error("boom", true));

    assert_eq!(clone.subscriber_count(), 1);
    assert!(matches!(
        rx.try_recv().unwrap(),
        PipelineEvent::Error { recoverable: true, .. }
    ));
}

#[tokio::test]
async fn test_async_receive_across_tasks() {
    let bus = EventBus::new();
    let rx = bus.subscribe();

    let publisher = bus.clone();
    tokio::spawn(async move {
        publisher.publish(PipelineEvent::SessionComplete {
            summary: "Completed 1/1 tasks.".into(),
        });
    });

    let event = rx.recv_async().await.unwrap();
    assert_eq!(event.kind(), "session_complete");
}

#[test]
fn test_backlog_replays_to_late_subscriber() {
    let bus = EventBus::with_backlog(2);
    bus.publish(PipelineEvent::PlanningStarted);
    for id in ["t1", "t2"] {
        bus.publish(PipelineEvent::TaskStarted {
            task_id: id.into(),
            agent_name: "Sparky".into(),
        });
    }
    assert_eq!(bus.backlog_len(), 2);

    let rx = bus.subscribe();
    let replayed: Vec<_> = rx.try_iter().collect();
    assert_eq!(replayed.len(), 2);
    assert!(matches!(
        &replayed[0],
        PipelineEvent::TaskStarted { task_id, .. } if task_id == "t1"
    ));

    bus.publish(PipelineEvent::PlanningStarted);
    assert_eq!(rx.try_recv().unwrap(), PipelineEvent::PlanningStarted);
}
