use crate::broker::{Broker, BrokerConfig};
use crate::helper;
use amqpkit_client::*;
use amqpkit_codec::frame;
use std::time::Duration;

async fn message_count(channel: &Channel, queue: &str) -> u32 {
    channel
        .queue_declare(queue, QueueDeclareOpts::default().passive(true))
        .await
        .unwrap()
        .message_count
}

#[tokio::test]
async fn stopped_flow_holds_the_publish() {
    let broker = Broker::start();
    let (client, mut events) = helper::connect(&broker).await;
    let channel = client.channel_open(1).await.unwrap();

    channel.queue_declare("flow", QueueDeclareOpts::default()).await.unwrap();

    broker.send_all(frame::ChannelFlowArgs::new(false).frame(1));

    let event = events.receive_event(Duration::from_secs(1)).await;
    assert!(
        matches!(event, Some(EventSignal::ChannelFlow { channel: 1, active: false })),
        "{event:?}"
    );

    let publisher = channel.clone();
    let publish = tokio::spawn(async move { publisher.send("flow", "held back").await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!publish.is_finished());
    assert_eq!(broker.queue_len("flow"), Some(0));

    broker.send_all(frame::ChannelFlowArgs::new(true).frame(1));

    assert_eq!(publish.await.unwrap().unwrap(), 1);
    assert_eq!(message_count(&channel, "flow").await, 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn blocked_connection_times_out_publishes() {
    let broker = Broker::start();
    let config = ConnectionConfig {
        publish_timeout: Some(Duration::from_millis(200)),
        ..helper::config()
    };
    let (client, mut events) = helper::connect_with(&broker, config).await;
    let channel = client.channel_open(1).await.unwrap();

    channel.queue_declare("blocked", QueueDeclareOpts::default()).await.unwrap();

    broker.send_all(frame::ConnectionBlockedArgs::new("low on memory").frame());

    match events.receive_event(Duration::from_secs(1)).await {
        Some(EventSignal::ConnectionBlocked { reason }) => assert_eq!(reason, "low on memory"),
        other => panic!("{other:?} is not a blocked event"),
    }

    let result = channel.basic_publish("", "blocked", "first").await;
    assert_eq!(result, Err(ClientError::Timeout(Duration::from_millis(200))));

    broker.send_all(frame::connection_unblocked());

    let event = events.receive_event(Duration::from_secs(1)).await;
    assert!(matches!(event, Some(EventSignal::ConnectionUnblocked)), "{event:?}");

    // the timed out publish is dropped
    channel.basic_publish("", "blocked", "second").await.unwrap();
    assert_eq!(message_count(&channel, "blocked").await, 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn send_stops_at_the_first_failure() {
    let broker = Broker::with_config(BrokerConfig {
        block_after: Some(3),
        ..Default::default()
    });
    let config = ConnectionConfig {
        publish_timeout: Some(Duration::from_millis(200)),
        ..helper::config()
    };
    let (client, _events) = helper::connect_with(&broker, config).await;
    let channel = client.channel_open(1).await.unwrap();

    channel.queue_declare("partial", QueueDeclareOpts::default()).await.unwrap();

    let payloads: Vec<String> = (0..10_000).map(|i| format!("message {i}")).collect();

    match channel.send("partial", payloads).await {
        Err(ClientError::PartialSend { sent, source }) => {
            assert!((3..10_000).contains(&sent), "{sent} messages are sent");
            assert_eq!(*source, ClientError::Timeout(Duration::from_millis(200)));
            // everything reported as sent is on the server, nothing after the failure
            assert_eq!(message_count(&channel, "partial").await, sent as u32);
        }
        other => panic!("{other:?} is not a partial send"),
    }

    client.close().await.unwrap();
}
