//! `state` module represents the client state machine which handles incoming
//! commands (from client api side) and incoming AMQP frames from network/server
//! side.
//!
//! So everything which comes from the server or goes to the server is an
//! AMQP frame or `MethodFrame`, content etc. Everything which talks to the client
//! api it is a typed struct, and every waiting api call is resolved through its
//! oneshot channel. Errors returned from the handlers are fatal, they close the
//! connection. Errors of a single request are sent back to the requester.
use crate::client_api::EventSignal;
use crate::config::ConnectionConfig;
use crate::consumer::ConsumerSignal;
use crate::error::ClientError;
use crate::message::{self, Content, DeliveredMessage, Message, ReturnedMessage};
use crate::model::{ChannelNumber, ClassMethod, ConnectionError, ConnectionState, Tuning};
use crate::processor::{
    ClientRequest, ConfirmResponse, ConsumerSink, EventSink, FrameResponse, OpenedChannel, OutgoingFrame, Param,
    Status, WaitFor,
};
use crate::publisher::Confirmation;
use crate::Result;
use amqpkit_codec::codec::{AMQPCodec, Frame};
use amqpkit_codec::content::ContentCollector;
use amqpkit_codec::frame::{self, AMQPFrame, MethodFrameArgs};
use bytes::BytesMut;
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::Encoder;

#[derive(Clone, Copy, Debug, PartialEq)]
enum Phase {
    Uninitialized,
    /// Protocol header is sent.
    Connecting,
    /// `Connection.StartOk` is sent with the credentials.
    Authenticating,
    /// `Connection.TuneOk` and `Connection.Open` are sent.
    Tuned,
    Open,
    /// `Connection.Close` is sent, waiting for `Connection.CloseOk`.
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum ChannelPhase {
    Opening,
    Open,
    Closing,
}

struct Consumer {
    sink: ConsumerSink,
    no_ack: bool,
}

/// The api call waiting for the answer of the server on a channel. There can be only one.
enum Waiter {
    Open(oneshot::Sender<Result<OpenedChannel>>),
    Rpc {
        expected: ClassMethod,
        response: FrameResponse,
        consumer: Option<Consumer>,
    },
}

impl Waiter {
    fn fail(self, err: ClientError) {
        match self {
            Waiter::Open(tx) => {
                let _ = tx.send(Err(err));
            }
            Waiter::Rpc { response, .. } => {
                let _ = response.send(Err(err));
            }
        }
    }
}

/// A publish waiting for the flow to be resumed or the connection to be unblocked.
struct HeldPublish {
    data: BytesMut,
    written: Option<oneshot::Sender<Result<()>>>,
    confirm: Option<ConfirmResponse>,
}

impl HeldPublish {
    fn fail(self, err: &ClientError) {
        if let Some(tx) = self.written {
            let _ = tx.send(Err(err.clone()));
        }

        if let Some(tx) = self.confirm {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// The publisher gave up waiting.
    fn is_abandoned(&self) -> bool {
        self.written.as_ref().map_or(false, |tx| tx.is_closed())
    }
}

/// Publisher confirms of a channel. Publish sequence numbers start from 1.
struct Confirms {
    next_tag: u64,
    waiting: BTreeMap<u64, Option<ConfirmResponse>>,
}

impl Confirms {
    fn new() -> Self {
        Self {
            next_tag: 1,
            waiting: BTreeMap::new(),
        }
    }

    fn register(&mut self, confirm: Option<ConfirmResponse>) {
        self.waiting.insert(self.next_tag, confirm);
        self.next_tag += 1;
    }

    fn resolve(&mut self, delivery_tag: u64, multiple: bool, confirmation: Confirmation) {
        if multiple {
            while let Some(entry) = self.waiting.first_entry() {
                if *entry.key() > delivery_tag {
                    break;
                }

                if let Some(tx) = entry.remove() {
                    let _ = tx.send(Ok(confirmation));
                }
            }
        } else if let Some(Some(tx)) = self.waiting.remove(&delivery_tag) {
            let _ = tx.send(Ok(confirmation));
        }
    }
}

/// A message arriving in a method frame and in the following content frames.
struct InDelivery {
    message: Message,
    collector: Option<ContentCollector>,
}

struct ChannelState {
    epoch: u64,
    phase: ChannelPhase,
    waiter: Option<Waiter>,
    /// `Channel.Flow` from the server, publishes are held while it is false.
    flow: bool,
    held: VecDeque<HeldPublish>,
    consumers: HashMap<String, Consumer>,
    in_delivery: Option<InDelivery>,
    /// Delivery tags which are delivered but not acked, nacked or rejected yet.
    unsettled: BTreeSet<u64>,
    confirms: Option<Confirms>,
}

impl ChannelState {
    fn new(epoch: u64, waiter: Waiter) -> Self {
        Self {
            epoch,
            phase: ChannelPhase::Opening,
            waiter: Some(waiter),
            flow: true,
            held: VecDeque::new(),
            consumers: HashMap::new(),
            in_delivery: None,
            unsettled: BTreeSet::new(),
            confirms: None,
        }
    }

    /// Resolve everything which waits on this channel.
    fn shut_down(&mut self, err: &ClientError, signal: &ConsumerSignal) {
        if let Some(waiter) = self.waiter.take() {
            waiter.fail(err.clone());
        }

        for held in self.held.drain(..) {
            held.fail(err);
        }

        if let Some(confirms) = self.confirms.as_mut() {
            for tx in std::mem::take(&mut confirms.waiting).into_values().flatten() {
                let _ = tx.send(Err(err.clone()));
            }
        }

        for (_, consumer) in self.consumers.drain() {
            let _ = consumer.sink.send(signal.clone());
        }

        self.in_delivery = None;
    }

    fn is_held(&self, blocked: bool) -> bool {
        blocked || !self.flow || !self.held.is_empty()
    }

    /// The publish is already encoded, so the broker sees every registered sequence number.
    async fn write_publish(&mut self, out: &Outgoing, publish: HeldPublish) -> Result<()> {
        let HeldPublish { data, written, confirm } = publish;

        if let Some(confirms) = self.confirms.as_mut() {
            confirms.register(confirm);
        }

        out.write(data, written).await
    }

    /// Send out the held publishes in order while the flow is on.
    async fn release_held(
        &mut self,
        channel: ChannelNumber,
        out: &Outgoing,
        blocked: bool,
    ) -> Result<()> {
        while self.flow && !blocked {
            let Some(publish) = self.held.pop_front() else {
                break;
            };

            if publish.is_abandoned() {
                debug!("Dropping abandoned publish on channel {}", channel);
                continue;
            }

            self.write_publish(out, publish).await?;
        }

        Ok(())
    }
}

pub(crate) struct ClientState {
    phase: Phase,
    username: String,
    password: String,
    virtual_host: String,
    /// What the client proposes during tuning.
    proposal: Tuning,
    tuning: Tuning,
    close_timeout: Duration,
    channels: HashMap<ChannelNumber, ChannelState>,
    next_epoch: u64,
    /// `Connection.Blocked` arrived, every publish is held.
    blocked: bool,
    /// The channel which is notified when the connection opening processes finishes.
    connected: Option<FrameResponse>,
    close_waiters: Vec<oneshot::Sender<Result<()>>>,
    close_deadline: Option<Instant>,
    /// Frames to the server.
    out: Outgoing,
    /// Channel for notifing the connection about async events (message is returned or channel is
    /// closed or confirms arrived).
    event_sink: EventSink,
    status: watch::Sender<Status>,
}

impl fmt::Debug for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientState {{ phase={:?}, username={}, virtual_host={}, channels={} }}",
            &self.phase,
            &self.username,
            &self.virtual_host,
            self.channels.len()
        )
    }
}

pub(crate) fn new(
    config: &ConnectionConfig,
    outgoing: mpsc::Sender<OutgoingFrame>,
    event_sink: EventSink,
    status: watch::Sender<Status>,
) -> ClientState {
    ClientState {
        phase: Phase::Uninitialized,
        username: config.username.clone(),
        password: config.password.clone(),
        virtual_host: config.virtual_host.clone(),
        proposal: Tuning {
            channel_max: config.channel_max,
            frame_max: config.frame_max,
            heartbeat: config.heartbeat,
        },
        tuning: Tuning::default(),
        close_timeout: config.close_timeout,
        channels: HashMap::new(),
        next_epoch: 1,
        blocked: false,
        connected: None,
        close_waiters: vec![],
        close_deadline: None,
        out: Outgoing {
            codec: AMQPCodec::default(),
            tx: outgoing,
        },
        event_sink,
        status,
    }
}

/// Encodes the frames and passes the bytes to the writer task. A frame which cannot be encoded
/// fails the request which sent it, nothing is registered for it.
struct Outgoing {
    codec: AMQPCodec,
    tx: mpsc::Sender<OutgoingFrame>,
}

impl Outgoing {
    fn encode(&mut self, frame: impl Into<Frame>) -> Result<BytesMut> {
        let mut data = BytesMut::new();

        self.codec.encode(frame.into(), &mut data)?;

        Ok(data)
    }

    async fn write(&self, data: BytesMut, written: Option<oneshot::Sender<Result<()>>>) -> Result<()> {
        self.tx
            .send(OutgoingFrame { data, written })
            .await
            .map_err(|_| ClientError::Network("connection writer is stopped".to_string()))
    }

    /// Send a frame of the client itself.
    async fn send(&mut self, frame: AMQPFrame) -> Result<()> {
        let data = self.encode(frame)?;

        self.write(data, None).await
    }
}

/// The sender of an RPC response. Other kind of waiters are misuse.
fn rpc_response_sink(response: Option<WaitFor>) -> Option<FrameResponse> {
    match response {
        Some(WaitFor::FrameResponse(tx)) => Some(tx),
        Some(other) => {
            other.fail(ClientError::Protocol("request needs a frame response".to_string()));
            None
        }
        None => None,
    }
}

fn written_sink(response: Option<WaitFor>) -> Option<oneshot::Sender<Result<()>>> {
    match response {
        Some(WaitFor::SentOut(tx)) => Some(tx),
        Some(other) => {
            other.fail(ClientError::Protocol("request needs a sent out response".to_string()));
            None
        }
        None => None,
    }
}

/// Remove the settled delivery tags. With `multiple` every tag up to and including `delivery_tag`
/// is settled, and 0 means all of them.
fn settle(unsettled: &mut BTreeSet<u64>, delivery_tag: u64, multiple: bool) -> Result<()> {
    if multiple && delivery_tag == 0 {
        unsettled.clear();

        return Ok(());
    }

    if !unsettled.contains(&delivery_tag) {
        return Err(ClientError::Protocol(format!(
            "delivery tag {} is unknown or already settled",
            delivery_tag
        )));
    }

    if multiple {
        let mut rest = unsettled.split_off(&delivery_tag);
        rest.remove(&delivery_tag);
        *unsettled = rest;
    } else {
        unsettled.remove(&delivery_tag);
    }

    Ok(())
}

fn consumer_signal(err: &ClientError) -> ConsumerSignal {
    match err {
        ClientError::ConnectionClosed {
            code,
            text,
            class_method,
        } => ConsumerSignal::ConnectionClosed {
            reply_code: *code,
            reply_text: text.clone(),
            class_method: *class_method,
        },
        other => ConsumerSignal::ConnectionClosed {
            reply_code: 0,
            reply_text: other.to_string(),
            class_method: 0,
        },
    }
}

fn normal_channel_close() -> ConsumerSignal {
    ConsumerSignal::ChannelClosed {
        reply_code: 200,
        reply_text: "Normal close".to_string(),
        class_method: frame::CHANNEL_CLOSE,
    }
}

/// Hand over a completely arrived message to its consumer or to the event handler.
fn finish_delivery(ch: &mut ChannelState, channel: ChannelNumber, event_sink: &EventSink) {
    let Some(InDelivery {
        mut message,
        collector: Some(collector),
    }) = ch.in_delivery.take()
    else {
        return;
    };

    let (header, body) = collector.finish();
    let content = message.content_mut();

    content.channel = channel;
    content.body = body;
    content.properties = header.into();

    match message {
        Message::Delivered(dm) => match ch.consumers.get(&dm.consumer_tag) {
            Some(consumer) => {
                if consumer.sink.send(ConsumerSignal::Delivered(Box::new(dm))).is_err() {
                    warn!("Consumer of channel {} is gone, message is dropped", channel);
                }
            }
            None => debug!("No consumer {} on channel {}, message is dropped", dm.consumer_tag, channel),
        },
        Message::Returned(rm) => {
            let _ = event_sink.send(EventSignal::BasicReturn {
                channel,
                message: Box::new(rm),
            });
        }
    }
}

impl ClientState {
    pub(crate) fn tuning(&self) -> Tuning {
        self.tuning
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// The server is considered dead after two heartbeat intervals of silence.
    pub(crate) fn heartbeat_timeout(&self) -> Option<Duration> {
        match self.phase {
            Phase::Tuned | Phase::Open | Phase::Closing if self.tuning.heartbeat > 0 => {
                Some(Duration::from_secs(2 * self.tuning.heartbeat as u64))
            }
            _ => None,
        }
    }

    pub(crate) fn close_deadline(&self) -> Option<Instant> {
        self.close_deadline
    }

    fn terminal_error(&self) -> ClientError {
        self.status.borrow().error.clone().unwrap_or(ClientError::Cancelled)
    }

    fn set_state(&self, state: ConnectionState, error: Option<ClientError>) {
        self.status.send_modify(|status| {
            status.state = state;

            if status.error.is_none() {
                status.error = error;
            }
        });
    }

    /// Check if a request of a `Channel` can go to the server.
    fn check_channel(&self, channel: ChannelNumber, epoch: u64) -> Result<()> {
        if self.phase != Phase::Open {
            return Err(self.terminal_error());
        }

        match self.channels.get(&channel) {
            Some(ch) if ch.epoch == epoch && ch.phase == ChannelPhase::Open => Ok(()),
            _ => Err(ClientError::Cancelled),
        }
    }

    pub(crate) async fn handle_request(&mut self, request: ClientRequest) -> Result<()> {
        let ClientRequest { param, response } = request;

        match param {
            Param::Connect => self.start(response).await,
            Param::ChannelOpen(channel) => self.channel_open(channel, response).await,
            Param::Frame(epoch, f) => self.channel_frame(epoch, *f, response).await,
            Param::Consume(epoch, f, sink) => self.basic_consume(epoch, *f, sink, response).await,
            Param::Publish(epoch, args, content, confirm) => {
                self.basic_publish(epoch, args, content, confirm, response).await
            }
            Param::Close => self.close(response).await,
        }
    }

    /// Starts the client sending the protocol header. When connection-open-ok message comes back
    /// it notifies the `connected` channel.
    async fn start(&mut self, response: Option<WaitFor>) -> Result<()> {
        let Some(connected) = rpc_response_sink(response) else {
            return Ok(());
        };

        if self.phase != Phase::Uninitialized {
            let _ = connected.send(Err(ClientError::Protocol("connection is already started".to_string())));

            return Ok(());
        }

        self.connected = Some(connected);
        self.phase = Phase::Connecting;

        self.out.send(AMQPFrame::Header).await
    }

    pub(crate) async fn connection_start(&mut self, args: frame::ConnectionStartArgs) -> Result<()> {
        if self.phase != Phase::Connecting {
            return Err(ClientError::Protocol("unexpected Connection.Start".to_string()));
        }

        if (args.version_major, args.version_minor) != (0, 9) {
            return Err(ClientError::Protocol(format!(
                "server speaks AMQP {}-{} instead of 0-9-1",
                args.version_major, args.version_minor
            )));
        }

        if !args.mechanisms.split_whitespace().any(|m| m == "PLAIN") {
            return Err(ClientError::Auth(format!(
                "PLAIN mechanism is not offered, only {}",
                args.mechanisms
            )));
        }

        self.phase = Phase::Authenticating;

        self.out
            .send(frame::ConnectionStartOkArgs::new(&self.username, &self.password).frame())
            .await
    }

    pub(crate) async fn connection_tune(&mut self, args: frame::ConnectionTuneArgs) -> Result<()> {
        if self.phase != Phase::Authenticating {
            return Err(ClientError::Protocol("unexpected Connection.Tune".to_string()));
        }

        self.tuning = Tuning::negotiate(&self.proposal, &args);
        self.phase = Phase::Tuned;

        debug!("Connection is tuned {:?}", self.tuning);

        let tune_ok = frame::ConnectionTuneOkArgs {
            channel_max: self.tuning.channel_max,
            frame_max: self.tuning.frame_max,
            heartbeat: self.tuning.heartbeat,
        };

        let tuning = self.tuning;

        self.status.send_modify(|status| status.tuning = tuning);
        self.out.send(tune_ok.frame()).await?;
        self.out.codec.set_frame_max(tuning.frame_max);

        self.out
            .send(
                frame::ConnectionOpenArgs::default()
                    .virtual_host(&self.virtual_host)
                    .frame(),
            )
            .await
    }

    pub(crate) fn connection_open_ok(&mut self) -> Result<()> {
        if self.phase != Phase::Tuned {
            return Err(ClientError::Protocol("unexpected Connection.OpenOk".to_string()));
        }

        self.phase = Phase::Open;

        let tuning = self.tuning;

        self.status.send_modify(|status| {
            status.state = ConnectionState::Open;
            status.tuning = tuning;
        });

        info!("Connection is open to virtual host {}", self.virtual_host);

        if let Some(connected) = self.connected.take() {
            let _ = connected.send(Ok(MethodFrameArgs::ConnectionOpenOk));
        }

        Ok(())
    }

    /// Client initiated close. It cancels every channel and waits for `Connection.CloseOk` until
    /// the close deadline.
    async fn close(&mut self, response: Option<WaitFor>) -> Result<()> {
        let done = written_sink(response);

        match self.phase {
            Phase::Closed => {
                if let Some(tx) = done {
                    let _ = tx.send(Ok(()));
                }

                return Ok(());
            }
            Phase::Closing => {
                self.close_waiters.extend(done);

                return Ok(());
            }
            _ => (),
        }

        info!("Closing connection");

        self.phase = Phase::Closing;
        self.set_state(ConnectionState::Closing, Some(ClientError::Cancelled));
        self.close_waiters.extend(done);
        self.close_deadline = Some(Instant::now() + self.close_timeout);

        if let Some(connected) = self.connected.take() {
            let _ = connected.send(Err(ClientError::Cancelled));
        }

        let signal = ConsumerSignal::ConnectionClosed {
            reply_code: 200,
            reply_text: "Normal close".to_string(),
            class_method: frame::CONNECTION_CLOSE,
        };

        for (_, mut ch) in self.channels.drain() {
            ch.shut_down(&ClientError::Cancelled, &signal);
        }

        self.out.send(frame::connection_close(200, "Normal close", 0)).await
    }

    pub(crate) fn connection_close_ok(&mut self) -> Result<()> {
        if self.phase != Phase::Closing {
            return Err(ClientError::Protocol("unexpected Connection.CloseOk".to_string()));
        }

        self.close_finished();

        Ok(())
    }

    /// The connection is closed cleanly or the close deadline elapsed.
    pub(crate) fn close_finished(&mut self) {
        info!("Connection is closed");

        self.phase = Phase::Closed;
        self.close_deadline = None;
        self.set_state(ConnectionState::Closed, Some(ClientError::Cancelled));

        for tx in self.close_waiters.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }

    /// Server closes the connection.
    pub(crate) async fn handle_connection_close(&mut self, args: frame::ConnectionCloseArgs) -> Result<()> {
        let _ = self.out.send(frame::connection_close_ok()).await;

        if self.phase == Phase::Closing {
            self.close_finished();

            return Ok(());
        }

        warn!("Server closes the connection {} {}", args.code, args.text);

        let class_method = args.class_method();
        let err = if args.code == ConnectionError::AccessRefused as u16 || self.phase == Phase::Authenticating {
            ClientError::Auth(format!("{} {}", args.code, args.text))
        } else {
            ClientError::ConnectionClosed {
                code: args.code,
                text: args.text.clone(),
                class_method,
            }
        };

        let _ = self.event_sink.send(EventSignal::ConnectionClosed {
            reply_code: args.code,
            reply_text: args.text,
            class_method,
        });

        self.fail_all(err);

        Ok(())
    }

    /// Connection level failure: notify the event handler and fail everything.
    pub(crate) fn connection_failed(&mut self, err: ClientError) {
        if self.phase == Phase::Closed {
            return;
        }

        error!("Connection failed {}", err);

        let _ = self.event_sink.send(EventSignal::ConnectionFailed(err.clone()));

        self.fail_all(err);
    }

    /// The server closed the socket.
    pub(crate) fn transport_closed(&mut self) {
        match self.phase {
            Phase::Closed => (),
            Phase::Closing => self.close_finished(),
            Phase::Authenticating => self.connection_failed(ClientError::Auth(
                "connection is closed during authentication".to_string(),
            )),
            _ => self.connection_failed(ClientError::Network("connection is closed by the server".to_string())),
        }
    }

    /// Best effort `Connection.Close` before dropping the transport because of an error.
    pub(crate) async fn send_close(&mut self, code: u16, text: &str) {
        let _ = self.out.send(frame::connection_close(code, text, 0)).await;
    }

    /// Resolve every pending and future call with `err`.
    pub(crate) fn fail_all(&mut self, err: ClientError) {
        self.phase = Phase::Closed;
        self.close_deadline = None;
        self.set_state(ConnectionState::Closed, Some(err.clone()));

        if let Some(connected) = self.connected.take() {
            let _ = connected.send(Err(err.clone()));
        }

        let signal = consumer_signal(&err);

        for (_, mut ch) in self.channels.drain() {
            ch.shut_down(&err, &signal);
        }

        for tx in self.close_waiters.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }

    pub(crate) fn connection_blocked(&mut self, args: frame::ConnectionBlockedArgs) -> Result<()> {
        warn!("Connection is blocked: {}", args.reason);

        self.blocked = true;

        let _ = self.event_sink.send(EventSignal::ConnectionBlocked { reason: args.reason });

        Ok(())
    }

    pub(crate) async fn connection_unblocked(&mut self) -> Result<()> {
        info!("Connection is unblocked");

        self.blocked = false;

        let _ = self.event_sink.send(EventSignal::ConnectionUnblocked);

        for (channel, ch) in self.channels.iter_mut() {
            ch.release_held(*channel, &self.out, false).await?;
        }

        Ok(())
    }

    async fn channel_open(&mut self, requested: Option<ChannelNumber>, response: Option<WaitFor>) -> Result<()> {
        let tx = match response {
            Some(WaitFor::ChannelOpen(tx)) => tx,
            Some(other) => {
                other.fail(ClientError::Protocol("channel open needs a channel response".to_string()));
                return Ok(());
            }
            None => return Ok(()),
        };

        if self.phase != Phase::Open {
            let _ = tx.send(Err(self.terminal_error()));

            return Ok(());
        }

        let max = self.tuning.max_channel();

        let channel = match requested {
            Some(n) if n == 0 || n > max => {
                let _ = tx.send(Err(ClientError::Protocol(format!(
                    "channel number {} is out of 1..={}",
                    n, max
                ))));

                return Ok(());
            }
            Some(n) if self.channels.contains_key(&n) => {
                let _ = tx.send(Err(ClientError::Protocol(format!("channel {} is already in use", n))));

                return Ok(());
            }
            Some(n) => n,
            None => match (1..=max).find(|n| !self.channels.contains_key(n)) {
                Some(n) => n,
                None => {
                    let _ = tx.send(Err(ClientError::ChannelLimitExceeded(max)));

                    return Ok(());
                }
            },
        };

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        debug!("Opening channel {}", channel);

        self.channels.insert(channel, ChannelState::new(epoch, Waiter::Open(tx)));

        self.out.send(frame::channel_open(channel)).await
    }

    pub(crate) async fn channel_open_ok(&mut self, channel: ChannelNumber) -> Result<()> {
        let Some(ch) = self.channels.get_mut(&channel) else {
            return Err(ClientError::Protocol(format!("Channel.OpenOk for unknown channel {}", channel)));
        };

        let Some(Waiter::Open(tx)) = ch.waiter.take() else {
            return Err(ClientError::Protocol(format!("unexpected Channel.OpenOk on channel {}", channel)));
        };

        ch.phase = ChannelPhase::Open;

        let opened = OpenedChannel {
            channel,
            epoch: ch.epoch,
        };

        if tx.send(Ok(opened)).is_err() {
            debug!("Channel {} is opened for nobody, closing it", channel);

            ch.phase = ChannelPhase::Closing;

            return self.out.send(frame::channel_close(channel, 200, "Normal close", 0)).await;
        }

        Ok(())
    }

    /// Frames sent by a `Channel`: RPCs waiting for a response, and asynchronous methods like
    /// acks.
    async fn channel_frame(&mut self, epoch: u64, f: AMQPFrame, response: Option<WaitFor>) -> Result<()> {
        let (channel, cm) = match &f {
            AMQPFrame::Method(channel, cm, _) => (*channel, *cm),
            other => {
                if let Some(waiter) = response {
                    waiter.fail(ClientError::Protocol(format!("{:?} cannot be sent by a channel", other)));
                }

                return Ok(());
            }
        };

        if cm == frame::CHANNEL_CLOSE {
            return self.channel_close(channel, epoch, f, response).await;
        }

        if let Err(e) = self.check_channel(channel, epoch) {
            if let Some(waiter) = response {
                waiter.fail(e);
            }

            return Ok(());
        }

        let Some(ch) = self.channels.get_mut(&channel) else {
            return Ok(());
        };

        match frame::response_class_method(cm) {
            Some(expected) => {
                let Some(tx) = rpc_response_sink(response) else {
                    return Ok(());
                };

                if ch.waiter.is_some() {
                    let _ = tx.send(Err(ClientError::Protocol(format!(
                        "channel {} has an RPC in flight",
                        channel
                    ))));

                    return Ok(());
                }

                let data = match self.out.encode(f) {
                    Ok(data) => data,
                    Err(e) => {
                        let _ = tx.send(Err(e));

                        return Ok(());
                    }
                };

                if cm == frame::CONFIRM_SELECT && ch.confirms.is_none() {
                    ch.confirms = Some(Confirms::new());
                }

                ch.waiter = Some(Waiter::Rpc {
                    expected,
                    response: tx,
                    consumer: None,
                });

                self.out.write(data, None).await
            }
            None => {
                let written = written_sink(response);

                let settles = match &f {
                    AMQPFrame::Method(_, _, MethodFrameArgs::BasicAck(args)) => Some((args.delivery_tag, args.multiple)),
                    AMQPFrame::Method(_, _, MethodFrameArgs::BasicNack(args)) => {
                        Some((args.delivery_tag, args.is_multiple()))
                    }
                    AMQPFrame::Method(_, _, MethodFrameArgs::BasicReject(args)) => Some((args.delivery_tag, false)),
                    _ => None,
                };

                let data = match self.out.encode(f) {
                    Ok(data) => data,
                    Err(e) => {
                        if let Some(tx) = written {
                            let _ = tx.send(Err(e));
                        }

                        return Ok(());
                    }
                };

                let settled = match settles {
                    Some((delivery_tag, multiple)) => settle(&mut ch.unsettled, delivery_tag, multiple),
                    None => Ok(()),
                };

                if let Err(e) = settled {
                    if let Some(tx) = written {
                        let _ = tx.send(Err(e));
                    }

                    return Ok(());
                }

                self.out.write(data, written).await
            }
        }
    }

    /// Client closes the channel. Everything waiting on the channel is cancelled, the frames
    /// arriving until `Channel.CloseOk` are dropped.
    async fn channel_close(
        &mut self,
        channel: ChannelNumber,
        epoch: u64,
        f: AMQPFrame,
        response: Option<WaitFor>,
    ) -> Result<()> {
        let tx = rpc_response_sink(response);

        let ch = match self.channels.get_mut(&channel) {
            Some(ch) if ch.epoch == epoch && ch.phase == ChannelPhase::Open && self.phase == Phase::Open => ch,
            _ => {
                // already closed
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(MethodFrameArgs::ChannelCloseOk));
                }

                return Ok(());
            }
        };

        debug!("Closing channel {}", channel);

        ch.shut_down(&ClientError::Cancelled, &normal_channel_close());
        ch.phase = ChannelPhase::Closing;
        ch.waiter = tx.map(|response| Waiter::Rpc {
            expected: frame::CHANNEL_CLOSE_OK,
            response,
            consumer: None,
        });

        self.out.send(f).await
    }

    pub(crate) fn channel_close_ok(&mut self, channel: ChannelNumber) -> Result<()> {
        match self.channels.get(&channel) {
            Some(ch) if ch.phase == ChannelPhase::Closing => (),
            _ => {
                return Err(ClientError::Protocol(format!(
                    "unexpected Channel.CloseOk on channel {}",
                    channel
                )))
            }
        }

        if let Some(Some(Waiter::Rpc { response, .. })) = self.channels.remove(&channel).map(|ch| ch.waiter) {
            let _ = response.send(Ok(MethodFrameArgs::ChannelCloseOk));
        }

        debug!("Channel {} is closed", channel);

        Ok(())
    }

    /// Server closes the channel, typically because of an error.
    pub(crate) async fn handle_channel_close(
        &mut self,
        channel: ChannelNumber,
        args: frame::ChannelCloseArgs,
    ) -> Result<()> {
        self.out.send(frame::channel_close_ok(channel)).await?;

        let Some(mut ch) = self.channels.remove(&channel) else {
            warn!("Channel.Close for unknown channel {}", channel);

            return Ok(());
        };

        let class_method = args.class_method();

        if ch.phase == ChannelPhase::Closing {
            if let Some(Waiter::Rpc { response, .. }) = ch.waiter.take() {
                let _ = response.send(Ok(MethodFrameArgs::ChannelCloseOk));
            }
        } else {
            warn!("Server closes channel {} {} {}", channel, args.code, args.text);

            let err = ClientError::ChannelClosed {
                channel,
                code: args.code,
                text: args.text.clone(),
                class_method,
            };

            ch.shut_down(
                &err,
                &ConsumerSignal::ChannelClosed {
                    reply_code: args.code,
                    reply_text: args.text.clone(),
                    class_method,
                },
            );
        }

        let _ = self.event_sink.send(EventSignal::ChannelClosed {
            channel,
            reply_code: args.code,
            reply_text: args.text,
            class_method,
        });

        Ok(())
    }

    pub(crate) async fn channel_flow(&mut self, channel: ChannelNumber, args: frame::ChannelFlowArgs) -> Result<()> {
        let active = args.active;

        let Some(ch) = self.channels.get_mut(&channel) else {
            return Err(ClientError::Protocol(format!("Channel.Flow for unknown channel {}", channel)));
        };

        info!("Flow of channel {} is {}", channel, if active { "on" } else { "off" });

        ch.flow = active;

        self.out.send(args.ok_frame(channel)).await?;

        let _ = self.event_sink.send(EventSignal::ChannelFlow { channel, active });

        ch.release_held(channel, &self.out, self.blocked).await
    }

    /// The server answered an RPC of a channel.
    pub(crate) fn rpc_response(&mut self, channel: ChannelNumber, cm: ClassMethod, args: MethodFrameArgs) -> Result<()> {
        let Some(ch) = self.channels.get_mut(&channel) else {
            return Err(ClientError::Protocol(format!(
                "response {:08X} for unknown channel {}",
                cm, channel
            )));
        };

        if ch.phase == ChannelPhase::Closing {
            debug!("Dropping {:08X} on closing channel {}", cm, channel);

            return Ok(());
        }

        match ch.waiter.take() {
            Some(Waiter::Rpc {
                expected,
                response,
                consumer,
            }) if expected == cm => {
                match (&args, consumer) {
                    (MethodFrameArgs::BasicConsumeOk(ok), Some(consumer)) => {
                        debug!("Consumer {} is registered on channel {}", ok.consumer_tag, channel);

                        ch.consumers.insert(ok.consumer_tag.clone(), consumer);
                    }
                    (MethodFrameArgs::BasicCancelOk(ok), _) => {
                        if let Some(consumer) = ch.consumers.remove(&ok.consumer_tag) {
                            let _ = consumer.sink.send(ConsumerSignal::Cancelled);
                        }
                    }
                    _ => (),
                }

                let _ = response.send(Ok(args));

                Ok(())
            }
            other => {
                ch.waiter = other;

                Err(ClientError::Protocol(format!(
                    "unexpected {:08X} on channel {}",
                    cm, channel
                )))
            }
        }
    }

    async fn basic_consume(
        &mut self,
        epoch: u64,
        f: AMQPFrame,
        sink: ConsumerSink,
        response: Option<WaitFor>,
    ) -> Result<()> {
        let Some(tx) = rpc_response_sink(response) else {
            return Ok(());
        };

        let (channel, no_ack) = match &f {
            AMQPFrame::Method(channel, _, MethodFrameArgs::BasicConsume(args)) => (*channel, args.is_no_ack()),
            _ => {
                let _ = tx.send(Err(ClientError::Protocol("consume needs Basic.Consume".to_string())));

                return Ok(());
            }
        };

        if let Err(e) = self.check_channel(channel, epoch) {
            let _ = tx.send(Err(e));

            return Ok(());
        }

        let Some(ch) = self.channels.get_mut(&channel) else {
            return Ok(());
        };

        if ch.waiter.is_some() {
            let _ = tx.send(Err(ClientError::Protocol(format!(
                "channel {} has an RPC in flight",
                channel
            ))));

            return Ok(());
        }

        let data = match self.out.encode(f) {
            Ok(data) => data,
            Err(e) => {
                let _ = tx.send(Err(e));

                return Ok(());
            }
        };

        ch.waiter = Some(Waiter::Rpc {
            expected: frame::BASIC_CONSUME_OK,
            response: tx,
            consumer: Some(Consumer { sink, no_ack }),
        });

        self.out.write(data, None).await
    }

    /// Sent by the server
    pub(crate) async fn on_basic_cancel(&mut self, channel: ChannelNumber, args: frame::BasicCancelArgs) -> Result<()> {
        if let Some(ch) = self.channels.get_mut(&channel) {
            if let Some(consumer) = ch.consumers.remove(&args.consumer_tag) {
                info!("Server cancelled consumer {}", args.consumer_tag);

                let _ = consumer.sink.send(ConsumerSignal::Cancelled);
            }
        }

        if args.no_wait {
            return Ok(());
        }

        self.out
            .send(
                frame::BasicCancelOkArgs {
                    consumer_tag: args.consumer_tag,
                }
                .frame(channel),
            )
            .await
    }

    async fn basic_publish(
        &mut self,
        epoch: u64,
        args: frame::BasicPublishArgs,
        content: Content,
        confirm: Option<ConfirmResponse>,
        response: Option<WaitFor>,
    ) -> Result<()> {
        let channel = content.channel;
        let written = written_sink(response);

        let publish = HeldPublish {
            data: BytesMut::new(),
            written,
            confirm,
        };

        if let Err(e) = self.check_channel(channel, epoch) {
            publish.fail(&e);

            return Ok(());
        }

        let blocked = self.blocked;
        let frame_max = self.tuning.frame_max;

        let Some(ch) = self.channels.get_mut(&channel) else {
            return Ok(());
        };

        if publish.confirm.is_some() && ch.confirms.is_none() {
            publish.fail(&ClientError::Protocol(format!(
                "channel {} is not in confirm mode",
                channel
            )));

            return Ok(());
        }

        let (header, bodies) = message::to_content_frames(channel, content, frame_max);

        let mut frames = Vec::with_capacity(bodies.len() + 2);
        frames.push(args.frame(channel));
        frames.push(header.frame());
        frames.extend(bodies.into_iter().map(|body| body.frame()));

        // An unencodable publish gets no sequence number, the confirms stay in step with the broker.
        let data = match self.out.encode(Frame::Frames(frames)) {
            Ok(data) => data,
            Err(e) => {
                publish.fail(&e);

                return Ok(());
            }
        };

        let publish = HeldPublish { data, ..publish };

        if ch.is_held(blocked) {
            debug!("Publish is held on channel {}", channel);

            ch.held.push_back(publish);

            return Ok(());
        }

        ch.write_publish(&self.out, publish).await
    }

    /// Sent by the server, the publish is confirmed in confirm mode
    pub(crate) fn on_basic_ack(&mut self, channel: ChannelNumber, args: frame::BasicAckArgs) -> Result<()> {
        self.confirmed(channel, args.delivery_tag, args.multiple, Confirmation::Ack)
    }

    pub(crate) fn on_basic_nack(&mut self, channel: ChannelNumber, args: frame::BasicNackArgs) -> Result<()> {
        self.confirmed(channel, args.delivery_tag, args.is_multiple(), Confirmation::Nack)
    }

    fn confirmed(
        &mut self,
        channel: ChannelNumber,
        delivery_tag: u64,
        multiple: bool,
        confirmation: Confirmation,
    ) -> Result<()> {
        match self.channels.get_mut(&channel).and_then(|ch| ch.confirms.as_mut()) {
            Some(confirms) => confirms.resolve(delivery_tag, multiple, confirmation),
            None => {
                return Err(ClientError::Protocol(format!(
                    "confirm for channel {} which is not in confirm mode",
                    channel
                )))
            }
        }

        let signal = match confirmation {
            Confirmation::Ack => EventSignal::BasicAck {
                channel,
                delivery_tag,
                multiple,
            },
            Confirmation::Nack => EventSignal::BasicNack {
                channel,
                delivery_tag,
                multiple,
            },
        };

        let _ = self.event_sink.send(signal);

        Ok(())
    }

    fn start_delivery(&mut self, channel: ChannelNumber, message: Message) -> Result<()> {
        let Some(ch) = self.channels.get_mut(&channel) else {
            return Err(ClientError::Protocol(format!("message on unknown channel {}", channel)));
        };

        if ch.phase == ChannelPhase::Closing {
            debug!("Dropping message on closing channel {}", channel);

            return Ok(());
        }

        if ch.in_delivery.is_some() {
            return Err(ClientError::Protocol(format!(
                "new message on channel {} before the content of the previous one",
                channel
            )));
        }

        ch.in_delivery = Some(InDelivery {
            message,
            collector: None,
        });

        Ok(())
    }

    pub(crate) fn basic_deliver(&mut self, channel: ChannelNumber, args: frame::BasicDeliverArgs) -> Result<()> {
        if let Some(ch) = self.channels.get_mut(&channel) {
            match ch.consumers.get(&args.consumer_tag) {
                Some(consumer) if !consumer.no_ack => {
                    ch.unsettled.insert(args.delivery_tag);
                }
                _ => (),
            }
        }

        let message = Message::Delivered(DeliveredMessage {
            message: Content::default(),
            consumer_tag: args.consumer_tag,
            delivery_tag: args.delivery_tag,
            redelivered: args.redelivered,
            exchange: args.exchange_name,
            routing_key: args.routing_key,
        });

        self.start_delivery(channel, message)
    }

    pub(crate) fn basic_return(&mut self, channel: ChannelNumber, args: frame::BasicReturnArgs) -> Result<()> {
        let message = Message::Returned(ReturnedMessage {
            message: Content::default(),
            reply_code: args.reply_code,
            reply_text: args.reply_text,
            exchange: args.exchange_name,
            routing_key: args.routing_key,
        });

        self.start_delivery(channel, message)
    }

    pub(crate) fn content_header(&mut self, header: frame::ContentHeaderFrame) -> Result<()> {
        let channel = header.channel;

        let Some(ch) = self.channels.get_mut(&channel) else {
            return Err(ClientError::Protocol(format!("content header on unknown channel {}", channel)));
        };

        if ch.phase == ChannelPhase::Closing {
            return Ok(());
        }

        match ch.in_delivery.as_mut() {
            Some(delivery) if delivery.collector.is_none() => {
                let collector = ContentCollector::new(header);
                let complete = collector.is_complete();

                delivery.collector = Some(collector);

                if complete {
                    finish_delivery(ch, channel, &self.event_sink);
                }

                Ok(())
            }
            _ => Err(ClientError::Protocol(format!(
                "unexpected content header on channel {}",
                channel
            ))),
        }
    }

    pub(crate) fn content_body(&mut self, body: frame::ContentBodyFrame) -> Result<()> {
        let channel = body.channel;

        let Some(ch) = self.channels.get_mut(&channel) else {
            return Err(ClientError::Protocol(format!("content body on unknown channel {}", channel)));
        };

        if ch.phase == ChannelPhase::Closing {
            return Ok(());
        }

        let Some(collector) = ch.in_delivery.as_mut().and_then(|d| d.collector.as_mut()) else {
            return Err(ClientError::Protocol(format!("unexpected content body on channel {}", channel)));
        };

        collector.push(body)?;

        if collector.is_complete() {
            finish_delivery(ch, channel, &self.event_sink);
        }

        Ok(())
    }
}
