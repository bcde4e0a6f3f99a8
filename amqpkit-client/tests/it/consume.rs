use crate::broker::Broker;
use crate::{helper, unwrap_delivered_message};
use amqpkit_client::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn hundred_messages_arrive_in_order() {
    let broker = Broker::start();
    let (client, _events) = helper::connect(&broker).await;

    client.ensure_topology(&[], &[QueueDecl::new("ordered")]).await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let subscription = client
        .subscribe("ordered", NoAck(false), move |message| {
            let _ = tx.send(message.map(|m| m.body_str().unwrap_or_default().to_string()));

            ConsumerAck::Ack
        })
        .await
        .unwrap();

    let payloads: Vec<String> = (0..100).map(|i| format!("message {i}")).collect();

    let sent = client.send("ordered", payloads.clone()).await.unwrap();
    assert_eq!(sent, 100);

    let mut received = vec![];

    while received.len() < 100 {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Some(body))) => received.push(body),
            other => panic!("unexpected {other:?} after {} messages", received.len()),
        }
    }

    assert_eq!(received, payloads);

    subscription.cancel().await.unwrap();

    // the handler gets the end of the subscription once
    assert_eq!(rx.recv().await, Some(None));

    client.close().await.unwrap();
}

#[tokio::test]
async fn ack_of_unknown_or_settled_tag_fails() {
    let broker = Broker::start();
    let (client, _events) = helper::connect(&broker).await;
    let channel = client.channel_open_next().await.unwrap();

    channel.queue_declare("acks", QueueDeclareOpts::default()).await.unwrap();

    let mut handler = channel
        .basic_consume("acks", NoAck(false), Exclusive(false), NoLocal(false))
        .await
        .unwrap();

    let result = handler.basic_ack(42).await;
    assert!(matches!(result, Err(ClientError::Protocol(_))), "{result:?}");

    channel.send("acks", "once").await.unwrap();

    let message = unwrap_delivered_message(handler.receive(Duration::from_secs(1)).await.unwrap());

    handler.basic_ack(message.delivery_tag).await.unwrap();

    let result = handler.basic_ack(message.delivery_tag).await;
    assert!(matches!(result, Err(ClientError::Protocol(_))), "{result:?}");

    let result = handler.basic_reject(message.delivery_tag, true).await;
    assert!(matches!(result, Err(ClientError::Protocol(_))), "{result:?}");

    // the failed acks are local, the channel is still usable
    channel.queue_purge("acks").await.unwrap();

    client.close().await.unwrap();
}

#[tokio::test]
async fn multiple_ack_settles_every_tag_up_to() {
    let broker = Broker::start();
    let (client, _events) = helper::connect(&broker).await;
    let channel = client.channel_open_next().await.unwrap();

    channel.queue_declare("batch", QueueDeclareOpts::default()).await.unwrap();

    let mut handler = channel
        .basic_consume("batch", NoAck(false), Exclusive(false), NoLocal(false))
        .await
        .unwrap();

    channel.send("batch", vec!["m0", "m1", "m2"]).await.unwrap();

    let mut tags = vec![];

    for _ in 0..3 {
        let message = unwrap_delivered_message(handler.receive(Duration::from_secs(1)).await.unwrap());

        tags.push(message.delivery_tag);
    }

    channel.basic_ack(tags[1], true).await.unwrap();

    let result = channel.basic_ack(tags[0], false).await;
    assert!(matches!(result, Err(ClientError::Protocol(_))), "{result:?}");

    channel.basic_ack(tags[2], false).await.unwrap();

    client.close().await.unwrap();
}

#[tokio::test]
async fn no_ack_consumer_cannot_ack() {
    let broker = Broker::start();
    let (client, _events) = helper::connect(&broker).await;
    let channel = client.channel_open_next().await.unwrap();

    channel.queue_declare("fire", QueueDeclareOpts::default()).await.unwrap();

    let mut handler = channel
        .basic_consume("fire", NoAck(true), Exclusive(false), NoLocal(false))
        .await
        .unwrap();

    channel.send("fire", "and forget").await.unwrap();

    let message = unwrap_delivered_message(handler.receive(Duration::from_secs(1)).await.unwrap());

    let result = handler.basic_ack(message.delivery_tag).await;
    assert!(matches!(result, Err(ClientError::Protocol(_))), "{result:?}");

    client.close().await.unwrap();
}

#[tokio::test]
async fn deleted_queue_cancels_the_subscription() {
    let broker = Broker::start();
    let (client, _events) = helper::connect(&broker).await;

    client.ensure_topology(&[], &[QueueDecl::new("short.lived")]).await.unwrap();

    let ends = Arc::new(Mutex::new(0));
    let counter = ends.clone();

    let subscription = client
        .subscribe("short.lived", NoAck(true), move |message| {
            if message.is_none() {
                *counter.lock().unwrap() += 1;
            }

            ConsumerAck::Nothing
        })
        .await
        .unwrap();

    let channel = client.channel_open_next().await.unwrap();
    channel
        .queue_delete("short.lived", IfUnused(false), IfEmpty(false))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), subscription.join())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(*ends.lock().unwrap(), 1);

    client.close().await.unwrap();
}

#[tokio::test]
async fn closing_the_connection_ends_the_consumer() {
    let broker = Broker::start();
    let (client, _events) = helper::connect(&broker).await;
    let channel = client.channel_open_next().await.unwrap();

    channel.queue_declare("bob", QueueDeclareOpts::default()).await.unwrap();

    let mut handler = channel
        .basic_consume("bob", NoAck(false), Exclusive(false), NoLocal(false))
        .await
        .unwrap();

    client.close().await.unwrap();

    let signal = handler.receive(Duration::from_secs(1)).await;
    assert!(
        matches!(signal, Some(ConsumerSignal::ConnectionClosed { reply_code: 200, .. })),
        "{signal:?}"
    );
}

#[tokio::test]
async fn close_in_the_middle_of_deliveries() {
    let broker = Broker::start();
    let (client, _events) = helper::connect(&broker).await;
    let channel = client.channel_open_next().await.unwrap();

    channel.queue_declare("bulk", QueueDeclareOpts::default()).await.unwrap();

    // every body is split to several frames
    let body = vec![b'x'; 512 * 1024];
    for _ in 0..20 {
        channel.basic_publish("", "bulk", body.clone()).await.unwrap();
    }

    let consuming = client.channel_open_next().await.unwrap();
    let mut handler = consuming
        .basic_consume("bulk", NoAck(true), Exclusive(false), NoLocal(false))
        .await
        .unwrap();

    let first = unwrap_delivered_message(handler.receive(Duration::from_secs(1)).await.unwrap());
    assert_eq!(first.message.body.len(), body.len());

    // the rest of the deliveries are still on the wire
    consuming.close().await.unwrap();

    assert_eq!(client.state(), ConnectionState::Open);

    let ok = channel
        .queue_declare("bulk", QueueDeclareOpts::default().passive(true))
        .await
        .unwrap();
    assert_eq!(ok.name, "bulk");

    client.close().await.unwrap();
}
