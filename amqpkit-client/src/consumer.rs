use crate::channel_api::{check_short_str, Channel};
use crate::error::ClientError;
use crate::message::DeliveredMessage;
use crate::model::{ChannelNumber, ClassMethod};
use crate::processor::{self, ClientRequest, Param, WaitFor};
use crate::Result;
use amqpkit_codec::frame;
use log::{debug, error};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A signal arriving from the server during consuming a queue.
#[derive(Clone, Debug)]
pub enum ConsumerSignal {
    Delivered(Box<DeliveredMessage>),
    Cancelled,
    ChannelClosed {
        reply_code: u16,
        reply_text: String,
        class_method: ClassMethod,
    },
    ConnectionClosed {
        reply_code: u16,
        reply_text: String,
        class_method: ClassMethod,
    },
}

/// Consumer API for `Basic.Consume`.
///
/// `ConsumerHandler` can be get by invoking [`Channel::basic_consume`].
pub struct ConsumerHandler {
    /// The channel number we are consuming messages.
    pub channel: ChannelNumber,
    /// Identifier of the consumer in server.
    pub consumer_tag: String,
    client_channel: Channel,
    /// From this signal stream the consumer gets the messages as [`ConsumerSignal`] values and can
    /// handle them by acking messages or handling channel or connection close events.
    pub signal_stream: mpsc::UnboundedReceiver<ConsumerSignal>,
}

/// After consuming started with `ConsumerHandler` one can ack, nack or reject messages.
impl ConsumerHandler {
    /// Wait for the next signal. `None` means the timeout elapsed or the consumer is finished.
    pub async fn receive(&mut self, timeout: Duration) -> Option<ConsumerSignal> {
        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        tokio::select! {
            signal = self.signal_stream.recv() => {
                signal
            }
            _ = &mut sleep => {
                None
            }
        }
    }

    pub async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.client_channel.basic_ack(delivery_tag, false).await
    }

    pub async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.client_channel.basic_nack(delivery_tag, multiple, requeue).await
    }

    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.client_channel.basic_reject(delivery_tag, requeue).await
    }

    /// Cancel the consumer. The signal stream gets a `Cancelled` signal as the last one.
    pub async fn basic_cancel(self) -> Result<()> {
        self.client_channel.basic_cancel(&self.consumer_tag).await
    }
}

/// Specify if the consume is exclusive aka no other client can consume the queue.
pub struct Exclusive(pub bool);
/// Specify if the client needs to ack messages after delivery.
pub struct NoAck(pub bool);
/// Specify if the server sends messages to the same connection which published them.
pub struct NoLocal(pub bool);

/// What a subscription handler does with the message it got.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConsumerAck {
    Ack,
    Nack { requeue: bool },
    Reject { requeue: bool },
    /// Don't settle the message, in no-ack mode it is the only option.
    Nothing,
}

/// A running subscription started by [`Channel::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub consumer_tag: String,
    pub channel: ChannelNumber,
    client_channel: Channel,
    join: JoinHandle<Result<()>>,
    /// The channel is opened for this subscription, it is closed when the subscription ends.
    pub(crate) owns_channel: bool,
}

impl Subscription {
    /// Cancel the consumer and wait until the handler gets the cancel sentinel.
    pub async fn cancel(self) -> Result<()> {
        if let Err(e) = self.client_channel.basic_cancel(&self.consumer_tag).await {
            debug!("Cancelling consumer {} failed {:?}", self.consumer_tag, e);
        }

        self.join().await
    }

    /// Wait until the subscription ends. It ends normally if the consumer is cancelled (by any
    /// side) or the channel or the connection is closed normally.
    pub async fn join(self) -> Result<()> {
        let result = match self.join.await {
            Ok(result) => result,
            Err(e) => {
                error!("Subscription handler of {} failed {:?}", self.consumer_tag, e);

                Err(ClientError::Cancelled)
            }
        };

        if self.owns_channel {
            let _ = self.client_channel.close().await;
        }

        result
    }
}

impl Channel {
    /// Start consuming a queue.
    ///
    /// It returns a `ConsumerHandler` with which the server events can be handled. Messages are
    /// delivered in the form of those events and also channel close or connection close events
    /// coming through that interface.
    ///
    /// ```no_run
    /// use amqpkit_client::{Channel, ConsumerSignal, Exclusive, NoAck, NoLocal};
    ///
    /// async fn consume(channel: Channel) {
    ///     let mut handler = channel.basic_consume("queue", NoAck(false), Exclusive(false),
    ///         NoLocal(false)).await.unwrap();
    ///
    ///     while let Some(signal) = handler.signal_stream.recv().await {
    ///         match signal {
    ///             ConsumerSignal::Delivered(m) => {
    ///                 handler.basic_ack(m.delivery_tag).await.unwrap();
    ///             }
    ///             ConsumerSignal::Cancelled | ConsumerSignal::ChannelClosed { .. } |
    ///                 ConsumerSignal::ConnectionClosed { .. } => {
    ///                 break;
    ///             }
    ///         }
    ///     }
    /// }
    /// ```
    pub async fn basic_consume(
        &self,
        queue_name: &str,
        no_ack: NoAck,
        exclusive: Exclusive,
        no_local: NoLocal,
    ) -> Result<ConsumerHandler> {
        check_short_str("queue name", queue_name)?;

        let consumer_tag = format!("amqpkit-{}", rand::random::<u128>());

        let mut flags = frame::BasicConsumeFlags::empty();
        flags.set(frame::BasicConsumeFlags::NO_ACK, no_ack.0);
        flags.set(frame::BasicConsumeFlags::EXCLUSIVE, exclusive.0);
        flags.set(frame::BasicConsumeFlags::NO_LOCAL, no_local.0);

        let frame = frame::BasicConsumeArgs {
            queue: queue_name.to_string(),
            consumer_tag: consumer_tag.clone(),
            flags,
            args: None,
        }
        .frame(self.channel);

        // Buffer of the incoming, delivered messages or other signals like
        // consumer cancelled.
        let (signal_sink, signal_stream) = mpsc::unbounded_channel::<ConsumerSignal>();

        let (tx, rx) = oneshot::channel();

        {
            let _rpc = self.rpc.lock().await;

            self.sink
                .send(ClientRequest {
                    param: Param::Consume(self.epoch, Box::new(frame), signal_sink),
                    response: Some(WaitFor::FrameResponse(tx)),
                })
                .await?;

            processor::response(&self.sink, rx).await?;
        }

        Ok(ConsumerHandler {
            channel: self.channel,
            consumer_tag,
            client_channel: self.clone(),
            signal_stream,
        })
    }

    /// Start a long running handler for the messages of `queue_name`.
    ///
    /// The handler gets every message in delivery order, and its answer settles the message unless
    /// `no_ack` is set. The handler gets `None` once when the subscription ends normally.
    ///
    /// ```no_run
    /// use amqpkit_client::{Channel, ConsumerAck, NoAck};
    ///
    /// async fn subscribe(channel: Channel) {
    ///     let subscription = channel
    ///         .subscribe("bob", NoAck(false), |message| {
    ///             if let Some(m) = message {
    ///                 println!("{:?}", m.body_str());
    ///             }
    ///
    ///             ConsumerAck::Ack
    ///         })
    ///         .await
    ///         .unwrap();
    ///
    ///     subscription.cancel().await.unwrap();
    /// }
    /// ```
    pub async fn subscribe<F>(&self, queue_name: &str, no_ack: NoAck, on_message: F) -> Result<Subscription>
    where
        F: FnMut(Option<DeliveredMessage>) -> ConsumerAck + Send + 'static,
    {
        let auto_ack = no_ack.0;
        let handler = self
            .basic_consume(queue_name, no_ack, Exclusive(false), NoLocal(false))
            .await?;
        let consumer_tag = handler.consumer_tag.clone();

        let join = tokio::spawn(run_subscription(handler, auto_ack, on_message));

        Ok(Subscription {
            consumer_tag,
            channel: self.channel,
            client_channel: self.clone(),
            join,
            owns_channel: false,
        })
    }
}

async fn run_subscription<F>(mut handler: ConsumerHandler, no_ack: bool, mut on_message: F) -> Result<()>
where
    F: FnMut(Option<DeliveredMessage>) -> ConsumerAck + Send + 'static,
{
    loop {
        match handler.signal_stream.recv().await {
            Some(ConsumerSignal::Delivered(dm)) => {
                let delivery_tag = dm.delivery_tag;
                let ack = on_message(Some(*dm));

                if no_ack {
                    continue;
                }

                match ack {
                    ConsumerAck::Ack => handler.basic_ack(delivery_tag).await?,
                    ConsumerAck::Nack { requeue } => handler.basic_nack(delivery_tag, false, requeue).await?,
                    ConsumerAck::Reject { requeue } => handler.basic_reject(delivery_tag, requeue).await?,
                    ConsumerAck::Nothing => (),
                }
            }
            Some(ConsumerSignal::Cancelled)
            | Some(ConsumerSignal::ChannelClosed { reply_code: 200, .. })
            | Some(ConsumerSignal::ConnectionClosed { reply_code: 200, .. })
            | None => {
                debug!("Subscription {} is finished", handler.consumer_tag);

                on_message(None);

                return Ok(());
            }
            Some(ConsumerSignal::ChannelClosed {
                reply_code,
                reply_text,
                class_method,
            }) => {
                return Err(ClientError::ChannelClosed {
                    channel: handler.channel,
                    code: reply_code,
                    text: reply_text,
                    class_method,
                })
            }
            Some(ConsumerSignal::ConnectionClosed { .. }) => {
                return Err(handler.client_channel.sink.terminal_error());
            }
        }
    }
}
