use crate::channel_api::{check_short_str, Channel};
use crate::error::ClientError;
use crate::message::PublishedMessage;
use crate::processor::{self, ClientRequest, ConfirmResponse, Param, WaitFor};
use crate::Result;
use amqpkit_codec::frame;
use tokio::sync::oneshot;

/// The answer of the server to a publish in confirm mode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Confirmation {
    /// The server took the responsibility of the message.
    Ack,
    /// The server couldn't handle the message.
    Nack,
}

/// One payload or a sequence of payloads to be sent to a queue.
#[derive(Clone, Debug, PartialEq)]
pub enum Payloads {
    One(Vec<u8>),
    Many(Vec<Vec<u8>>),
}

impl From<&str> for Payloads {
    fn from(value: &str) -> Self {
        Payloads::One(value.as_bytes().to_vec())
    }
}

impl From<String> for Payloads {
    fn from(value: String) -> Self {
        Payloads::One(value.into_bytes())
    }
}

impl From<Vec<u8>> for Payloads {
    fn from(value: Vec<u8>) -> Self {
        Payloads::One(value)
    }
}

impl From<Vec<Vec<u8>>> for Payloads {
    fn from(value: Vec<Vec<u8>>) -> Self {
        Payloads::Many(value)
    }
}

impl From<Vec<String>> for Payloads {
    fn from(value: Vec<String>) -> Self {
        Payloads::Many(value.into_iter().map(String::into_bytes).collect())
    }
}

impl From<Vec<&str>> for Payloads {
    fn from(value: Vec<&str>) -> Self {
        Payloads::Many(value.into_iter().map(|s| s.as_bytes().to_vec()).collect())
    }
}

impl Channel {
    /// Publish a message to an exchange.
    ///
    /// It returns when the frames are written to the connection. If the flow of the channel is
    /// stopped or the connection is blocked by the server, it waits until the publishing can go on
    /// (or until the publish timeout of the connection elapses).
    ///
    /// ```no_run
    /// # async fn publish(channel: amqpkit_client::Channel) {
    /// use amqpkit_client::PublishedMessage;
    ///
    /// let message = PublishedMessage::default().text("hello bob!!!").persistent(true);
    ///
    /// channel.basic_publish("test.direct", "direct", message).await.unwrap();
    /// # }
    /// ```
    pub async fn basic_publish(
        &self,
        exchange_name: &str,
        routing_key: &str,
        message: impl Into<PublishedMessage>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        self.publish_request(exchange_name, routing_key, message.into(), tx, None)
            .await?;

        self.wait_written(rx).await
    }

    /// Publish a message in confirm mode and wait for the ack or nack of the server.
    pub async fn publish_confirmed(
        &self,
        exchange_name: &str,
        routing_key: &str,
        message: impl Into<PublishedMessage>,
    ) -> Result<Confirmation> {
        let (tx, rx) = oneshot::channel();
        let (confirm_tx, confirm_rx) = oneshot::channel();

        self.publish_request(exchange_name, routing_key, message.into(), tx, Some(confirm_tx))
            .await?;

        self.wait_written(rx).await?;

        processor::response(&self.sink, confirm_rx).await
    }

    /// Send payloads to a queue via the default exchange, in order. It returns the number of the
    /// sent messages, or a `PartialSend` error telling how many were sent before the failure.
    pub async fn send(&self, queue_name: &str, payloads: impl Into<Payloads>) -> Result<usize> {
        match payloads.into() {
            Payloads::One(body) => {
                self.basic_publish("", queue_name, body).await?;

                Ok(1)
            }
            Payloads::Many(bodies) => {
                self.publish_all("", queue_name, bodies.into_iter().map(PublishedMessage::from))
                    .await
            }
        }
    }

    /// Publish messages one after the other, it stops at the first failure.
    pub async fn publish_all<I>(&self, exchange_name: &str, routing_key: &str, messages: I) -> Result<usize>
    where
        I: IntoIterator<Item = PublishedMessage>,
    {
        let mut sent = 0;

        for message in messages {
            if let Err(e) = self.basic_publish(exchange_name, routing_key, message).await {
                return Err(ClientError::PartialSend {
                    sent,
                    source: Box::new(e),
                });
            }

            sent += 1;
        }

        Ok(sent)
    }

    async fn publish_request(
        &self,
        exchange_name: &str,
        routing_key: &str,
        message: PublishedMessage,
        written: oneshot::Sender<Result<()>>,
        confirm: Option<ConfirmResponse>,
    ) -> Result<()> {
        check_short_str("exchange name", exchange_name)?;
        check_short_str("routing key", routing_key)?;

        let PublishedMessage {
            mut message,
            mandatory,
            immediate,
        } = message;

        message.channel = self.channel;

        let mut flags = frame::BasicPublishFlags::empty();
        flags.set(frame::BasicPublishFlags::MANDATORY, mandatory);
        flags.set(frame::BasicPublishFlags::IMMEDIATE, immediate);

        let args = frame::BasicPublishArgs {
            exchange_name: exchange_name.to_string(),
            routing_key: routing_key.to_string(),
            flags,
        };

        self.sink
            .send(ClientRequest {
                param: Param::Publish(self.epoch, args, message, confirm),
                response: Some(WaitFor::SentOut(written)),
            })
            .await
    }

    async fn wait_written(&self, rx: oneshot::Receiver<Result<()>>) -> Result<()> {
        match self.sink.publish_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, processor::response(&self.sink, rx)).await {
                Ok(result) => result,
                Err(_) => Err(ClientError::Timeout(timeout)),
            },
            None => processor::response(&self.sink, rx).await,
        }
    }
}
