// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use agent_bus::{
    AgentHandler, AgentMessage, AgentType, BusError, MemoryBroker, MessageBus, MessageBusConfig,
    MessageType, Target,
};
use async_trait::async_trait;
use lapin::BasicProperties;
use opentelemetry::Context;
use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::time::Instant;

const DLQ: &str = "agents.dlq";

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<(AgentMessage, Instant)>>>,
    failures: Arc<AtomicU32>,
}

impl Recorder {
    fn failing(times: u32) -> Self {
        let recorder = Recorder::default();
        recorder.failures.store(times, Ordering::SeqCst);
        recorder
    }

    fn count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn retry_counts(&self) -> Vec<u32> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|(msg, _)| msg.retry_count)
            .collect()
    }

    fn arrivals(&self) -> Vec<Instant> {
        self.seen.lock().unwrap().iter().map(|(_, at)| *at).collect()
    }
}

#[async_trait]
impl AgentHandler for Recorder {
    async fn handle(&self, _ctx: &Context, message: AgentMessage) -> Result<(), BusError> {
        self.seen.lock().unwrap().push((message, Instant::now()));

        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(BusError::handler("not yet"));
        }
        Ok(())
    }
}

fn cfg() -> MessageBusConfig {
    MessageBusConfig::new("memory://local", "agents", 5, Duration::from_secs(5))
}

async fn connected(broker: &MemoryBroker) -> MessageBus {
    let bus = MessageBus::new(broker.clone());
    bus.connect(cfg()).await.unwrap();
    bus
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn broadcast_reaches_every_subscriber_once() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker).await;

    let generator = Recorder::default();
    let publisher = Recorder::default();
    bus.subscribe(AgentType::ContentGenerator, generator.clone())
        .await
        .unwrap();
    bus.subscribe(AgentType::Publisher, publisher.clone())
        .await
        .unwrap();

    bus.publish(&AgentMessage::new(MessageType::Generate, Target::Broadcast).with_id("m1"))
        .await
        .unwrap();
    settle().await;

    assert_eq!(generator.count(), 1);
    assert_eq!(publisher.count(), 1);
    assert_eq!(generator.seen.lock().unwrap()[0].0.id, "m1");
    assert_eq!(publisher.seen.lock().unwrap()[0].0.id, "m1");
    assert_eq!(broker.message_count("agent.content_generator"), 0);
    assert_eq!(broker.unacked_count("agent.publisher"), 0);
}

#[tokio::test(start_paused = true)]
async fn direct_message_reaches_only_its_target() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker).await;

    let generator = Recorder::default();
    let publisher = Recorder::default();
    bus.subscribe(AgentType::ContentGenerator, generator.clone())
        .await
        .unwrap();
    bus.subscribe(AgentType::Publisher, publisher.clone())
        .await
        .unwrap();

    let msg = AgentMessage::new(MessageType::Publish, AgentType::Publisher)
        .with_payload(serde_json::json!({ "post": 42 }));
    bus.publish(&msg).await.unwrap();
    settle().await;

    assert_eq!(generator.count(), 0);
    let seen = publisher.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0.id, msg.id);
    assert_eq!(seen[0].0.payload, serde_json::json!({ "post": 42 }));
}

#[tokio::test(start_paused = true)]
async fn type_keyed_message_reaches_target_and_named_agent() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker).await;

    let generator = Recorder::default();
    let publisher = Recorder::default();
    bus.subscribe(AgentType::ContentGenerator, generator.clone())
        .await
        .unwrap();
    bus.subscribe(AgentType::Publisher, publisher.clone())
        .await
        .unwrap();

    let msg = AgentMessage::new(AgentType::Publisher, AgentType::ContentGenerator);
    bus.publish(&msg).await.unwrap();
    settle().await;

    assert_eq!(generator.count(), 1);
    assert_eq!(publisher.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_deliveries_back_off_exponentially() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker).await;
    bus.create_dead_letter_exchange().await.unwrap();

    let publisher = Recorder::failing(2);
    bus.subscribe(AgentType::Publisher, publisher.clone())
        .await
        .unwrap();
    bus.publish(&AgentMessage::new(MessageType::Publish, AgentType::Publisher))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(publisher.retry_counts(), vec![0, 1, 2]);
    let arrivals = publisher.arrivals();
    let first_gap = arrivals[1] - arrivals[0];
    let second_gap = arrivals[2] - arrivals[1];
    assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1100));
    assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2100));

    assert_eq!(broker.message_count(DLQ), 0);
    assert_eq!(broker.message_count("agent.publisher"), 0);
    assert_eq!(bus.pending_retries(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_message_is_dead_lettered() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker).await;
    bus.create_dead_letter_exchange().await.unwrap();

    let publisher = Recorder::failing(u32::MAX);
    bus.subscribe(AgentType::Publisher, publisher.clone())
        .await
        .unwrap();
    bus.publish(&AgentMessage::new(MessageType::Publish, AgentType::Publisher).with_id("doomed"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(publisher.count(), 3);
    let dead = broker.messages(DLQ);
    assert_eq!(dead.len(), 1);
    let body: AgentMessage = dead[0].body().unwrap();
    assert_eq!(body.id, "doomed");
    assert_eq!(body.retry_count, 2);
}

#[tokio::test(start_paused = true)]
async fn malformed_payload_goes_straight_to_the_dead_letter_queue() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker).await;
    bus.create_dead_letter_exchange().await.unwrap();

    let publisher = Recorder::default();
    bus.subscribe(AgentType::Publisher, publisher.clone())
        .await
        .unwrap();

    broker
        .inject("agents", "PUBLISHER.PUBLISH", b"{oops", BasicProperties::default())
        .unwrap();
    settle().await;

    assert_eq!(publisher.count(), 0);
    assert_eq!(broker.message_count(DLQ), 1);
    assert_eq!(bus.pending_retries(), 0);
}

#[tokio::test(start_paused = true)]
async fn subscribing_twice_keeps_one_consumer_and_the_latest_handler() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker).await;

    let first = Recorder::default();
    let second = Recorder::default();
    bus.subscribe(AgentType::QualityControl, first.clone())
        .await
        .unwrap();
    bus.subscribe(AgentType::QualityControl, second.clone())
        .await
        .unwrap();

    assert_eq!(broker.consumer_count("agent.quality_control"), 1);
    assert_eq!(broker.bindings("agent.quality_control").len(), 3);
    assert_eq!(bus.subscribed_agents(), vec![AgentType::QualityControl]);

    bus.publish(&AgentMessage::new(MessageType::Score, AgentType::QualityControl))
        .await
        .unwrap();
    settle().await;

    assert_eq!(first.count(), 0);
    assert_eq!(second.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker).await;
    bus.connect(cfg()).await.unwrap();

    assert!(bus.is_connected());
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn consumers_come_back_after_a_broker_restart() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker).await;
    bus.create_dead_letter_exchange().await.unwrap();

    let publisher = Recorder::default();
    bus.subscribe(AgentType::Publisher, publisher.clone())
        .await
        .unwrap();

    broker.set_online(false);
    broker.restart();
    assert!(!bus.is_connected());
    assert!(bus.is_reconnecting());

    let msg = AgentMessage::new(MessageType::Publish, AgentType::Publisher);
    assert_eq!(bus.publish(&msg).await, Err(BusError::NotConnected));

    let generator = Recorder::default();
    bus.subscribe(AgentType::ContentGenerator, generator.clone())
        .await
        .unwrap();
    assert_eq!(
        bus.subscribed_agents(),
        vec![AgentType::ContentGenerator, AgentType::Publisher]
    );

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!bus.is_connected());
    assert_eq!(bus.reconnect_attempts(), 1);

    broker.set_online(true);
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(bus.is_connected());
    assert!(!bus.is_reconnecting());
    assert_eq!(bus.reconnect_attempts(), 2);
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(broker.consumer_count("agent.publisher"), 1);
    assert_eq!(broker.consumer_count("agent.content_generator"), 1);
    assert!(bus.is_consuming(AgentType::Publisher));
    assert!(broker.exchange_definition("agents.dlx").is_some());

    bus.publish(&msg).await.unwrap();
    settle().await;
    assert_eq!(publisher.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn unacked_messages_are_redelivered_after_reconnect() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker).await;

    let slow = Arc::new(AtomicU32::new(0));
    let calls = slow.clone();
    bus.subscribe(AgentType::NewsMonitor, move |_msg: AgentMessage| {
        let calls = calls.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok::<(), BusError>(())
        }
    })
    .await
    .unwrap();

    bus.publish(&AgentMessage::new(MessageType::Analyze, AgentType::NewsMonitor))
        .await
        .unwrap();
    settle().await;
    assert_eq!(broker.unacked_count("agent.news_monitor"), 1);

    broker.restart();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(bus.is_connected());
    assert_eq!(slow.load(Ordering::SeqCst), 2);
    assert_eq!(broker.message_count("agent.news_monitor"), 0);
    assert_eq!(broker.unacked_count("agent.news_monitor"), 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_pending_retries_and_forgets_handlers() {
    let broker = MemoryBroker::new();
    let bus = connected(&broker).await;

    let publisher = Recorder::failing(u32::MAX);
    bus.subscribe(AgentType::Publisher, publisher.clone())
        .await
        .unwrap();
    bus.publish(&AgentMessage::new(MessageType::Publish, AgentType::Publisher))
        .await
        .unwrap();
    settle().await;
    assert_eq!(publisher.count(), 1);
    assert_eq!(bus.pending_retries(), 1);

    bus.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(publisher.count(), 1);
    assert_eq!(bus.pending_retries(), 0);
    assert!(!bus.is_connected());
    assert!(bus.subscribed_agents().is_empty());
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(bus.reconnect_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn two_buses_share_a_broker() {
    let broker = MemoryBroker::new();
    let orchestrator = connected(&broker).await;
    let reviewer = connected(&broker).await;

    let quality = Recorder::default();
    reviewer
        .subscribe(AgentType::QualityControl, quality.clone())
        .await
        .unwrap();

    orchestrator
        .publish(&AgentMessage::new(MessageType::Score, AgentType::QualityControl))
        .await
        .unwrap();
    settle().await;

    assert_eq!(quality.count(), 1);
    assert_eq!(broker.connection_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn handlers_run_concurrently_up_to_prefetch() {
    let broker = MemoryBroker::new();
    let bus = MessageBus::new(broker.clone());
    bus.connect(MessageBusConfig::new(
        "memory://local",
        "agents",
        3,
        Duration::from_secs(5),
    ))
    .await
    .unwrap();

    let in_flight = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));
    let handled = Arc::new(AtomicU32::new(0));
    let handler = {
        let (in_flight, peak, handled) = (in_flight.clone(), peak.clone(), handled.clone());
        move |_msg: AgentMessage| {
            let (in_flight, peak, handled) = (in_flight.clone(), peak.clone(), handled.clone());
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                handled.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BusError>(())
            }
        }
    };
    bus.subscribe(AgentType::ContentGenerator, handler)
        .await
        .unwrap();

    for i in 0..6 {
        let msg = AgentMessage::new(MessageType::Generate, AgentType::ContentGenerator)
            .with_id(format!("m{i}"));
        bus.publish(&msg).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(handled.load(Ordering::SeqCst), 6);
    assert_eq!(broker.unacked_count("agent.content_generator"), 0);
}

#[tokio::test(start_paused = true)]
async fn closed_channel_triggers_a_reconnect() {
    let broker = MemoryBroker::new();
    let first = connected(&broker).await;
    first
        .subscribe(AgentType::Publisher, Recorder::default())
        .await
        .unwrap();

    let second = MessageBus::new(broker.clone());
    second
        .connect(cfg().with_queue_message_ttl(Duration::from_secs(60)))
        .await
        .unwrap();

    let res = second
        .subscribe(AgentType::Publisher, Recorder::default())
        .await;
    assert_eq!(
        res,
        Err(BusError::DeclareQueueError("agent.publisher".into()))
    );
    assert!(!second.is_connected());
    assert!(second.is_reconnecting());
    assert!(second.subscribed_agents().is_empty());
    assert_eq!(
        second
            .publish(&AgentMessage::new(MessageType::Score, AgentType::Publisher))
            .await,
        Err(BusError::NotConnected)
    );

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(second.is_connected());
    assert!(!second.is_reconnecting());
    assert_eq!(second.reconnect_attempts(), 1);
    assert_eq!(broker.connection_count(), 2);

    let quality = Recorder::default();
    first
        .subscribe(AgentType::QualityControl, quality.clone())
        .await
        .unwrap();
    second
        .publish(&AgentMessage::new(MessageType::Score, AgentType::QualityControl))
        .await
        .unwrap();
    settle().await;
    assert_eq!(quality.count(), 1);
}
