use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use servicebus::broker::{
    Broker, DispatcherConfig, Message, MessageKind, ProcessingMode, RegistrationIntent,
    RegistrationRequest,
};
use servicebus::client::{Channel, Inbox, LocalChannel};

async fn recv(inbox: &mut Inbox) -> Message {
    tokio::time::timeout(Duration::from_secs(5), inbox.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("channel closed")
}

#[tokio::test]
async fn integration_topic_and_queue_end_to_end() {
    let broker = Broker::default();
    broker.start().unwrap();

    let (producer, _producer_inbox) = LocalChannel::with_session("producer");
    let (alpha, mut alpha_inbox) = LocalChannel::with_session("alpha");
    let (beta, mut beta_inbox) = LocalChannel::with_session("beta");

    broker
        .register(&RegistrationRequest::produce_topic("alerts"), producer.clone())
        .unwrap();
    broker
        .register(&RegistrationRequest::produce_queue("jobs"), producer)
        .unwrap();
    for channel in [alpha.clone(), beta.clone()] {
        broker
            .register(&RegistrationRequest::consume_topic("alerts"), channel.clone())
            .unwrap();
        broker
            .register(&RegistrationRequest::consume_queue("jobs"), channel)
            .unwrap();
    }

    broker
        .publish(Message::topic("alerts", b"fire".to_vec()), "producer")
        .unwrap();
    assert_eq!(recv(&mut alpha_inbox).await.content, b"fire".to_vec());
    assert_eq!(recv(&mut beta_inbox).await.content, b"fire".to_vec());

    for i in 0..10u8 {
        broker.publish(Message::queue("jobs", vec![i]), "producer").unwrap();
    }
    // the first consumer that accepts takes every queue message
    let mut seen = Vec::new();
    for _ in 0..10 {
        seen.push(recv(&mut alpha_inbox).await.content[0]);
    }
    assert_eq!(seen, (0..10).collect::<Vec<u8>>());
    assert!(beta_inbox.try_recv().is_none());

    let producer_info = broker.client("producer").unwrap();
    assert_eq!(producer_info.messages_produced(), 11);
    assert_eq!(broker.queue("jobs").unwrap().messages_processed(), 10);

    // alpha goes away; beta picks up the queue
    alpha.close();
    assert!(broker.client("alpha").is_none());
    broker.publish(Message::queue("jobs", vec![42]), "producer").unwrap();
    assert_eq!(recv(&mut beta_inbox).await.content, vec![42]);

    broker.stop();
    assert!(!beta.is_open());
    assert!(broker.clients().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_parallel_mode_delivers_everything() {
    let config = DispatcherConfig::default()
        .with_processing_mode(ProcessingMode::Parallel)
        .with_workers(4)
        .with_batch_size(8);
    let broker = Broker::new(config);
    broker.start().unwrap();

    let (queue_consumer, mut queue_inbox) = LocalChannel::with_session("queue-consumer");
    let (topic_consumer, mut topic_inbox) = LocalChannel::with_session("topic-consumer");
    broker
        .register(&RegistrationRequest::consume_queue("work"), queue_consumer)
        .unwrap();
    broker
        .register(&RegistrationRequest::consume_topic("news"), topic_consumer)
        .unwrap();

    const COUNT: u32 = 500;
    for i in 0..COUNT {
        let payload = i.to_be_bytes().to_vec();
        broker.publish(Message::queue("work", payload.clone()), "").unwrap();
        broker.publish(Message::topic("news", payload), "").unwrap();
    }

    let mut queue_seen = HashSet::new();
    let mut topic_seen = HashSet::new();
    for _ in 0..COUNT {
        queue_seen.insert(recv(&mut queue_inbox).await.content);
        topic_seen.insert(recv(&mut topic_inbox).await.content);
    }
    assert_eq!(queue_seen.len(), COUNT as usize);
    assert_eq!(topic_seen.len(), COUNT as usize);

    // counters are bumped right after the send, possibly on another thread
    let expected = 2 * COUNT as u64;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while broker.stats().processed < expected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = broker.stats();
    assert_eq!(stats.processed, expected);
    assert_eq!(stats.discarded, 0);
    assert_eq!(stats.pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integration_concurrent_registration_stress() {
    let broker = Arc::new(Broker::default());
    broker.start().unwrap();

    let mut tasks = Vec::new();
    for t in 0..8 {
        let broker = Arc::clone(&broker);
        tasks.push(tokio::spawn(async move {
            let (channel, _inbox) = LocalChannel::with_session(format!("stress-{t}"));
            for round in 0..200 {
                let name = format!("name-{}", round % 16);
                let kind = if round % 2 == 0 {
                    MessageKind::Queue
                } else {
                    MessageKind::Topic
                };
                let request = RegistrationRequest::new(RegistrationIntent::Consume, kind, name.clone());
                broker.register(&request, channel.clone()).unwrap();
                broker
                    .publish(Message::new(kind, name, "", vec![]), channel.session_id())
                    .unwrap();
                broker.unregister(&request, channel.session_id()).unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(broker.clients().len(), 8);
    assert_eq!(broker.queues().len(), 8);
    assert_eq!(broker.topics().len(), 8);
    for registration in broker.queues().into_iter().chain(broker.topics()) {
        assert!(registration.consumers.is_empty());
    }

    for t in 0..8 {
        assert!(broker.disconnect_client(&format!("stress-{t}")));
    }
    assert!(broker.clients().is_empty());
}
