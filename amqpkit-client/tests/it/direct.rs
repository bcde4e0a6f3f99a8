use crate::broker::Broker;
use crate::{helper, message_from_string, unwrap_delivered_message};
use amqpkit_client::*;
use std::time::Duration;

async fn declare_direct(channel: &Channel) {
    channel
        .exchange_declare("test.direct", ExchangeType::Direct, ExchangeDeclareOpts::default())
        .await
        .unwrap();
    channel
        .queue_declare("bob.direct", QueueDeclareOpts::default())
        .await
        .unwrap();
    channel.queue_bind("bob.direct", "test.direct", "direct").await.unwrap();
}

#[tokio::test]
async fn hello_bob() {
    let broker = Broker::start();
    let (client, _events) = helper::connect(&broker).await;
    let channel = client.channel_open(1).await.unwrap();

    declare_direct(&channel).await;

    let mut handler = channel
        .basic_consume("bob.direct", NoAck(false), Exclusive(false), NoLocal(false))
        .await
        .unwrap();

    channel
        .basic_publish("test.direct", "direct", message_from_string("hello bob!!!"))
        .await
        .unwrap();

    let message = unwrap_delivered_message(handler.receive(Duration::from_secs(1)).await.unwrap());

    assert_eq!(message.body_str(), Some("hello bob!!!"));
    assert_eq!(message.exchange, "test.direct");
    assert_eq!(message.routing_key, "direct");
    assert_eq!(message.message.properties.app_id.as_deref(), Some("amqpkit-client-test"));
    assert!(!message.redelivered);

    handler.basic_ack(message.delivery_tag).await.unwrap();
    handler.basic_cancel().await.unwrap();

    channel.close().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn unroutable_mandatory_message_is_returned() {
    let broker = Broker::start();
    let (client, mut events) = helper::connect(&broker).await;
    let channel = client.channel_open(1).await.unwrap();

    declare_direct(&channel).await;

    channel
        .basic_publish(
            "test.direct",
            "extension.txt",
            message_from_string("A text file").mandatory(true),
        )
        .await
        .unwrap();

    match events.receive_event(Duration::from_secs(1)).await {
        Some(EventSignal::BasicReturn { channel: 1, message }) => {
            assert_eq!(message.reply_code, 312);
            assert_eq!(message.routing_key, "extension.txt");
            assert_eq!(message.message.body, b"A text file");
        }
        other => panic!("{other:?} is not a return"),
    }

    client.close().await.unwrap();
}

#[tokio::test]
async fn purge_and_delete_report_message_counts() {
    let broker = Broker::start();
    let (client, _events) = helper::connect(&broker).await;
    let channel = client.channel_open(1).await.unwrap();

    declare_direct(&channel).await;

    let sent = channel
        .publish_all(
            "test.direct",
            "direct",
            (0..3).map(|i| PublishedMessage::default().str(&format!("m{i}"))),
        )
        .await
        .unwrap();
    assert_eq!(sent, 3);

    let ok = channel
        .queue_declare("bob.direct", QueueDeclareOpts::default().passive(true))
        .await
        .unwrap();
    assert_eq!(ok.message_count, 3);

    assert_eq!(channel.queue_purge("bob.direct").await.unwrap(), 3);

    channel.send("bob.direct", "one more").await.unwrap();

    channel.queue_unbind("bob.direct", "test.direct", "direct").await.unwrap();
    assert_eq!(broker.binding_count(), 0);

    let deleted = channel
        .queue_delete("bob.direct", IfUnused(false), IfEmpty(false))
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    channel.exchange_delete("test.direct", IfUnused(false)).await.unwrap();
    assert!(!broker.has_exchange("test.direct"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn nacked_message_is_redelivered() {
    let broker = Broker::start();
    let (client, _events) = helper::connect(&broker).await;
    let channel = client.channel_open(1).await.unwrap();

    declare_direct(&channel).await;
    channel.basic_qos(1, 0, false).await.unwrap();

    let mut handler = channel
        .basic_consume("bob.direct", NoAck(false), Exclusive(false), NoLocal(false))
        .await
        .unwrap();

    channel
        .basic_publish("test.direct", "direct", "try again")
        .await
        .unwrap();

    let first = unwrap_delivered_message(handler.receive(Duration::from_secs(1)).await.unwrap());
    handler.basic_nack(first.delivery_tag, false, true).await.unwrap();

    let second = unwrap_delivered_message(handler.receive(Duration::from_secs(1)).await.unwrap());
    assert!(second.redelivered);
    assert_eq!(second.body_str(), Some("try again"));
    assert_ne!(second.delivery_tag, first.delivery_tag);

    handler.basic_reject(second.delivery_tag, false).await.unwrap();

    assert!(handler.receive(Duration::from_millis(100)).await.is_none());
    assert_eq!(broker.queue_len("bob.direct"), Some(0));

    client.close().await.unwrap();
}

#[tokio::test]
async fn publish_to_missing_exchange_closes_the_channel() {
    let broker = Broker::start();
    let (client, mut events) = helper::connect(&broker).await;
    let channel = client.channel_open(1).await.unwrap();

    channel.basic_publish("nowhere", "key", "lost").await.unwrap();

    let event = events.receive_event(Duration::from_secs(1)).await;
    assert!(
        matches!(event, Some(EventSignal::ChannelClosed { channel: 1, reply_code: 404, .. })),
        "{event:?}"
    );

    let result = channel.queue_declare("bob", QueueDeclareOpts::default()).await;
    assert!(matches!(result, Err(ClientError::Cancelled)), "{result:?}");

    // the connection survives a channel error
    let other = client.channel_open_next().await.unwrap();
    other.queue_declare("bob", QueueDeclareOpts::default()).await.unwrap();

    client.close().await.unwrap();
}
