use crate::error::ClientError;
use crate::model::{ChannelNumber, ExchangeDeclareOpts, ExchangeType, IfEmpty, IfUnused, QueueDeclareOpts};
use crate::processor::{self, ClientRequestSink, OpenedChannel};
use crate::topology::Topology;
use crate::Result;
use amqpkit_codec::frame::{self, AMQPFrame, MethodFrameArgs};
use log::debug;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A channel is a communication line between the server and the client. Methods of the channel
/// are RPCs which wait for the answer of the server, they are sent one by one even if the channel
/// is cloned and used from many tasks.
#[derive(Clone, Debug)]
pub struct Channel {
    /// The channel number
    pub channel: ChannelNumber,
    pub(crate) epoch: u64,
    pub(crate) sink: ClientRequestSink,
    pub(crate) rpc: Arc<Mutex<()>>,
    /// What the client has declared, deletes are reflected in it.
    pub(crate) topology: Arc<Mutex<Topology>>,
}

/// Result of a queue declaration.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueDeclareOk {
    /// The name of the queue, the server generates one if it is declared with an empty name.
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

fn unexpected(args: MethodFrameArgs) -> ClientError {
    ClientError::Protocol(format!("unexpected response {:?}", args))
}

/// Names, routing keys and consumer tags go in short strings on the wire.
pub(crate) fn check_short_str(what: &str, value: &str) -> Result<()> {
    if value.len() > 255 {
        return Err(ClientError::Protocol(format!("{} is longer than 255 bytes", what)));
    }

    Ok(())
}

fn check_binding(queue_name: &str, exchange_name: &str, routing_key: &str) -> Result<()> {
    check_short_str("queue name", queue_name)?;
    check_short_str("exchange name", exchange_name)?;
    check_short_str("routing key", routing_key)
}

impl Channel {
    pub(crate) fn new(opened: OpenedChannel, sink: ClientRequestSink, topology: Arc<Mutex<Topology>>) -> Channel {
        Channel {
            channel: opened.channel,
            epoch: opened.epoch,
            sink,
            rpc: Arc::new(Mutex::new(())),
            topology,
        }
    }

    /// Send a method frame and wait for the response, one RPC at a time.
    pub(crate) async fn call(&self, f: AMQPFrame) -> Result<MethodFrameArgs> {
        let _rpc = self.rpc.lock().await;

        processor::call(&self.sink, self.epoch, f).await
    }

    /// Declare exchange.
    pub async fn exchange_declare(
        &self,
        exchange_name: &str,
        exchange_type: ExchangeType,
        opts: ExchangeDeclareOpts,
    ) -> Result<()> {
        check_short_str("exchange name", exchange_name)?;

        let frame = frame::ExchangeDeclareArgs {
            exchange_name: exchange_name.to_string(),
            exchange_type: exchange_type.to_string(),
            flags: opts.flags(),
            args: None,
        }
        .frame(self.channel);

        self.call(frame)
            .await
            .map_err(|e| e.into_conflict("exchange", exchange_name))?;

        Ok(())
    }

    /// Delete exchange.
    ///
    /// ```no_run
    /// # async fn foo(channel: amqpkit_client::Channel) {
    /// use amqpkit_client::IfUnused;
    ///
    /// channel.exchange_delete("price-exchange", IfUnused(false)).await.unwrap();
    /// # }
    /// ```
    pub async fn exchange_delete(&self, exchange_name: &str, if_unused: IfUnused) -> Result<()> {
        check_short_str("exchange name", exchange_name)?;

        let mut flags = frame::ExchangeDeleteFlags::empty();
        flags.set(frame::ExchangeDeleteFlags::IF_UNUSED, if_unused.0);

        let frame = frame::ExchangeDeleteArgs {
            exchange_name: exchange_name.to_string(),
            flags,
        }
        .frame(self.channel);

        self.call(frame).await?;

        self.topology.lock().await.forget_exchange(exchange_name);

        Ok(())
    }

    /// Declare queue.
    pub async fn queue_declare(&self, queue_name: &str, opts: QueueDeclareOpts) -> Result<QueueDeclareOk> {
        check_short_str("queue name", queue_name)?;

        let frame = frame::QueueDeclareArgs {
            name: queue_name.to_string(),
            flags: opts.flags(),
            args: None,
        }
        .frame(self.channel);

        match self.call(frame).await.map_err(|e| e.into_conflict("queue", queue_name))? {
            MethodFrameArgs::QueueDeclareOk(ok) => Ok(QueueDeclareOk {
                name: ok.name,
                message_count: ok.message_count,
                consumer_count: ok.consumer_count,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Bind queue to exchange.
    pub async fn queue_bind(&self, queue_name: &str, exchange_name: &str, routing_key: &str) -> Result<()> {
        check_binding(queue_name, exchange_name, routing_key)?;

        let frame = frame::QueueBindArgs {
            queue_name: queue_name.to_string(),
            exchange_name: exchange_name.to_string(),
            routing_key: routing_key.to_string(),
            ..Default::default()
        }
        .frame(self.channel);

        self.call(frame).await?;

        Ok(())
    }

    pub async fn queue_unbind(&self, queue_name: &str, exchange_name: &str, routing_key: &str) -> Result<()> {
        check_binding(queue_name, exchange_name, routing_key)?;

        let frame = frame::QueueUnbindArgs {
            queue_name: queue_name.to_string(),
            exchange_name: exchange_name.to_string(),
            routing_key: routing_key.to_string(),
            args: None,
        }
        .frame(self.channel);

        self.call(frame).await?;

        self.topology
            .lock()
            .await
            .forget_binding(queue_name, exchange_name, routing_key);

        Ok(())
    }

    /// Remove the messages of the queue, it returns the number of the purged messages.
    pub async fn queue_purge(&self, queue_name: &str) -> Result<u32> {
        check_short_str("queue name", queue_name)?;

        let frame = frame::QueuePurgeArgs {
            queue_name: queue_name.to_string(),
            no_wait: false,
        }
        .frame(self.channel);

        match self.call(frame).await? {
            MethodFrameArgs::QueuePurgeOk(ok) => Ok(ok.message_count),
            other => Err(unexpected(other)),
        }
    }

    /// Delete the queue, it returns the number of the deleted messages.
    pub async fn queue_delete(&self, queue_name: &str, if_unused: IfUnused, if_empty: IfEmpty) -> Result<u32> {
        check_short_str("queue name", queue_name)?;

        let mut flags = frame::QueueDeleteFlags::empty();
        flags.set(frame::QueueDeleteFlags::IF_UNUSED, if_unused.0);
        flags.set(frame::QueueDeleteFlags::IF_EMPTY, if_empty.0);

        let frame = frame::QueueDeleteArgs {
            queue_name: queue_name.to_string(),
            flags,
        }
        .frame(self.channel);

        match self.call(frame).await? {
            MethodFrameArgs::QueueDeleteOk(ok) => {
                self.topology.lock().await.forget_queue(queue_name);

                Ok(ok.message_count)
            }
            other => Err(unexpected(other)),
        }
    }

    /// Limit the number of unacked messages the server delivers.
    pub async fn basic_qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()> {
        let frame = frame::BasicQosArgs {
            prefetch_size,
            prefetch_count,
            global,
        }
        .frame(self.channel);

        self.call(frame).await?;

        Ok(())
    }

    /// Switch the channel to confirm mode, from now on the server acks or nacks every publish.
    pub async fn confirm(&self) -> Result<()> {
        self.call(frame::confirm_select(self.channel)).await?;

        Ok(())
    }

    /// Acknowledge a delivered message. With `multiple` every message is acked up to the
    /// `delivery_tag`.
    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        let frame = frame::BasicAckArgs { delivery_tag, multiple }.frame(self.channel);

        processor::sync_send(&self.sink, self.epoch, frame).await
    }

    pub async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        let mut flags = frame::BasicNackFlags::empty();
        flags.set(frame::BasicNackFlags::MULTIPLE, multiple);
        flags.set(frame::BasicNackFlags::REQUEUE, requeue);

        let frame = frame::BasicNackArgs { delivery_tag, flags }.frame(self.channel);

        processor::sync_send(&self.sink, self.epoch, frame).await
    }

    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let frame = frame::BasicRejectArgs { delivery_tag, requeue }.frame(self.channel);

        processor::sync_send(&self.sink, self.epoch, frame).await
    }

    /// Stop the consumer identified by `consumer_tag`.
    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        check_short_str("consumer tag", consumer_tag)?;

        let frame = frame::BasicCancelArgs {
            consumer_tag: consumer_tag.to_string(),
            no_wait: false,
        }
        .frame(self.channel);

        self.call(frame).await?;

        Ok(())
    }

    /// Closes the channel. A pending RPC of the channel is cancelled. Closing a closed channel
    /// does nothing.
    pub async fn close(&self) -> Result<()> {
        debug!("Closing channel {}", self.channel);

        processor::call(
            &self.sink,
            self.epoch,
            frame::channel_close(self.channel, 200, "Normal close", 0),
        )
        .await?;

        Ok(())
    }
}
