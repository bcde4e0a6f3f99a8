//! In-process AMQP server for the integration tests. It speaks the protocol over a
//! `tokio::io::duplex` pipe with the same codec the client uses, and implements the subset of
//! broker behaviour the client relies on: exchanges with direct, fanout and topic routing, queues
//! with consumers, acks and requeue, publisher confirms, mandatory returns and the channel and
//! connection level error closes.
use amqpkit_codec::codec::{AMQPCodec, Frame};
use amqpkit_codec::content;
use amqpkit_codec::frame::{
    self, AMQPFrame, BasicConsumeFlags, BasicPublishArgs, Channel, ClassMethod, ContentHeaderFrame,
    ExchangeDeclareFlags, MethodFrameArgs, QueueDeclareFlags,
};
use futures::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

/// Exchange name whose declaration is never answered.
pub const SILENT_EXCHANGE: &str = "no.answer";

type Out = mpsc::UnboundedSender<Frame>;

#[derive(Clone, Copy, Debug)]
pub struct BrokerConfig {
    pub channel_max: u16,
    pub frame_max: u32,
    /// The broker never sends heartbeats itself, a non-zero value makes the client time out
    /// unless `answer_heartbeats` is set.
    pub heartbeat: u16,
    /// Answer every heartbeat of the client with one.
    pub answer_heartbeats: bool,
    /// Send `Connection.Blocked` once this many messages are published.
    pub block_after: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 0,
            answer_heartbeats: false,
            block_after: None,
        }
    }
}

#[derive(Clone, Debug)]
struct Msg {
    exchange: String,
    routing_key: String,
    header: ContentHeaderFrame,
    body: Vec<u8>,
    redelivered: bool,
}

struct Exchange {
    kind: String,
    durable: bool,
    auto_delete: bool,
}

struct Consumer {
    conn: u64,
    channel: Channel,
    tag: String,
    no_ack: bool,
    out: Out,
}

struct Queue {
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
    owner: Option<u64>,
    messages: VecDeque<Msg>,
    consumers: VecDeque<Consumer>,
}

#[derive(PartialEq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct PendingPublish {
    args: BasicPublishArgs,
    header: Option<ContentHeaderFrame>,
    body: Vec<u8>,
}

#[derive(Default)]
struct Chan {
    confirm_tag: Option<u64>,
    next_delivery: u64,
    unacked: BTreeMap<u64, (String, Msg)>,
    publish: Option<PendingPublish>,
    closing: bool,
}

#[derive(Default)]
struct Shared {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    channels: HashMap<(u64, Channel), Chan>,
    connections: HashMap<u64, Out>,
    next_id: u64,
    declares: usize,
    published: usize,
    heartbeats: usize,
}

/// Handle of the broker, clones share the same exchanges and queues.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<Mutex<Shared>>,
    config: BrokerConfig,
}

impl Broker {
    pub fn start() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            config,
        }
    }

    /// A new connection to the broker.
    pub fn connect(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(256 * 1024);

        tokio::spawn(serve(self.shared.clone(), self.config, server));

        client
    }

    /// Send a frame to every open connection, like `Channel.Flow` or `Connection.Blocked`.
    pub fn send_all(&self, f: AMQPFrame) {
        let shared = self.shared.lock().unwrap();

        for out in shared.connections.values() {
            let _ = out.send(Frame::Frame(clone_frame(&f)));
        }
    }

    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.shared.lock().unwrap().queues.get(queue).map(|q| q.messages.len())
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.shared.lock().unwrap().exchanges.contains_key(exchange)
    }

    pub fn queue_count(&self) -> usize {
        self.shared.lock().unwrap().queues.len()
    }

    pub fn binding_count(&self) -> usize {
        self.shared.lock().unwrap().bindings.len()
    }

    /// The number of exchange and queue declarations received.
    pub fn declares(&self) -> usize {
        self.shared.lock().unwrap().declares
    }

    /// The number of heartbeats received from the clients.
    pub fn heartbeats(&self) -> usize {
        self.shared.lock().unwrap().heartbeats
    }
}

fn clone_frame(f: &AMQPFrame) -> AMQPFrame {
    match f {
        AMQPFrame::Method(ch, _, MethodFrameArgs::ChannelFlow(args)) => args.clone().frame(*ch),
        AMQPFrame::Method(_, _, MethodFrameArgs::ConnectionBlocked(args)) => args.clone().frame(),
        AMQPFrame::Method(_, _, MethodFrameArgs::ConnectionUnblocked) => frame::connection_unblocked(),
        AMQPFrame::Method(_, _, MethodFrameArgs::ConnectionClose(args)) => args.clone().frame(),
        other => panic!("{other:?} cannot be broadcast"),
    }
}

/// Topic binding keys: `*` matches one segment, `#` matches zero or more segments.
pub fn match_routing_key(binding_key: &str, routing_key: &str) -> bool {
    fn matches(bks: &[&str], mks: &[&str]) -> bool {
        match (bks.split_first(), mks.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => matches(rest, mks) || (!mks.is_empty() && matches(bks, &mks[1..])),
            (Some((&"*", rest)), Some((_, mrest))) => matches(rest, mrest),
            (Some((b, rest)), Some((m, mrest))) if b == m => matches(rest, mrest),
            _ => false,
        }
    }

    let bks: Vec<_> = binding_key.split('.').collect();
    let mks: Vec<_> = routing_key.split('.').collect();

    matches(&bks, &mks)
}

enum Next {
    Continue,
    Stop,
}

async fn serve(shared: Arc<Mutex<Shared>>, config: BrokerConfig, stream: DuplexStream) {
    let (reader, writer) = tokio::io::split(stream);
    let mut frames = FramedRead::new(reader, AMQPCodec::default());
    let mut sink = FramedWrite::new(writer, AMQPCodec::default());
    let (out, mut out_rx) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        while let Some(f) = out_rx.recv().await {
            if sink.send(f).await.is_err() {
                break;
            }
        }
    });

    let id = {
        let mut shared = shared.lock().unwrap();

        shared.next_id += 1;
        let id = shared.next_id;
        shared.connections.insert(id, out.clone());
        id
    };

    let mut conn = Conn { id, out, config };

    while let Some(Ok(Frame::Frame(f))) = frames.next().await {
        let mut shared = shared.lock().unwrap();

        if let Next::Stop = conn.handle(&mut shared, f) {
            break;
        }
    }

    shared.lock().unwrap().connection_closed(id);
}

struct Conn {
    id: u64,
    out: Out,
    config: BrokerConfig,
}

impl Conn {
    fn send(&self, f: AMQPFrame) {
        let _ = self.out.send(Frame::Frame(f));
    }

    fn handle(&mut self, shared: &mut Shared, f: AMQPFrame) -> Next {
        match f {
            AMQPFrame::Header => {
                self.send(frame::ConnectionStartArgs::new().frame());

                Next::Continue
            }
            AMQPFrame::Method(ch, cm, args) => self.handle_method(shared, ch, cm, args),
            AMQPFrame::ContentHeader(header) => {
                let ch = header.channel;

                if let Some(pending) = shared.open_channel(self.id, ch).and_then(|c| c.publish.as_mut()) {
                    pending.header = Some(header);
                }

                shared.try_complete_publish(self, ch);

                Next::Continue
            }
            AMQPFrame::ContentBody(body) => {
                let ch = body.channel;

                if let Some(pending) = shared.open_channel(self.id, ch).and_then(|c| c.publish.as_mut()) {
                    pending.body.extend(body.body);
                }

                shared.try_complete_publish(self, ch);

                Next::Continue
            }
            AMQPFrame::Heartbeat(_) => {
                shared.heartbeats += 1;

                if self.config.answer_heartbeats {
                    self.send(frame::heartbeat());
                }

                Next::Continue
            }
        }
    }

    fn handle_method(&mut self, shared: &mut Shared, ch: Channel, cm: ClassMethod, args: MethodFrameArgs) -> Next {
        use MethodFrameArgs::*;

        match args {
            ConnectionStartOk(args) => match args.plain_credentials() {
                Some(("guest", "guest")) => self.send(
                    frame::ConnectionTuneArgs {
                        channel_max: self.config.channel_max,
                        frame_max: self.config.frame_max,
                        heartbeat: self.config.heartbeat,
                    }
                    .frame(),
                ),
                _ => {
                    self.send(frame::connection_close(
                        403,
                        "ACCESS_REFUSED - Login was refused",
                        frame::CONNECTION_START_OK,
                    ));

                    return Next::Stop;
                }
            },
            ConnectionTuneOk(_) => (),
            ConnectionOpen(_) => self.send(frame::connection_open_ok()),
            ConnectionClose(_) => {
                self.send(frame::connection_close_ok());

                return Next::Stop;
            }
            ConnectionCloseOk => return Next::Stop,
            ChannelOpen => {
                shared.channels.insert((self.id, ch), Chan::default());

                self.send(AMQPFrame::Method(ch, frame::CHANNEL_OPEN_OK, ChannelOpenOk));
            }
            ChannelClose(_) => {
                shared.channel_closed(self.id, ch);

                self.send(frame::channel_close_ok(ch));
            }
            ChannelCloseOk => {
                shared.channels.remove(&(self.id, ch));
            }
            ChannelFlowOk(_) => (),
            other => {
                if shared.open_channel(self.id, ch).is_none() {
                    return Next::Continue;
                }

                if let Err((code, text)) = shared.channel_method(self, ch, other) {
                    shared.close_channel(self, ch, code, &text, cm);
                }
            }
        }

        Next::Continue
    }
}

type ChannelResult = Result<(), (u16, String)>;

fn not_found(what: &str, name: &str) -> ChannelResult {
    Err((404, format!("NOT_FOUND - no {what} '{name}'")))
}

impl Shared {
    /// Channel which is open and not being closed by the broker.
    fn open_channel(&mut self, conn: u64, ch: Channel) -> Option<&mut Chan> {
        self.channels.get_mut(&(conn, ch)).filter(|c| !c.closing)
    }

    fn channel_method(&mut self, conn: &Conn, ch: Channel, args: MethodFrameArgs) -> ChannelResult {
        use MethodFrameArgs::*;

        match args {
            ExchangeDeclare(args) => {
                let name = args.exchange_name;

                if name == SILENT_EXCHANGE {
                    return Ok(());
                }

                self.declares += 1;

                let durable = args.flags.contains(ExchangeDeclareFlags::DURABLE);
                let auto_delete = args.flags.contains(ExchangeDeclareFlags::AUTO_DELETE);
                let passive = args.flags.contains(ExchangeDeclareFlags::PASSIVE);

                match self.exchanges.get(&name) {
                    Some(_) if passive => (),
                    Some(ex) if ex.kind == args.exchange_type && ex.durable == durable && ex.auto_delete == auto_delete => (),
                    Some(_) => {
                        return Err((
                            406,
                            format!("PRECONDITION_FAILED - inequivalent arg for exchange '{name}'"),
                        ))
                    }
                    None if passive => return not_found("exchange", &name),
                    None => {
                        self.exchanges.insert(
                            name,
                            Exchange {
                                kind: args.exchange_type,
                                durable,
                                auto_delete,
                            },
                        );
                    }
                }

                conn.send(AMQPFrame::Method(ch, frame::EXCHANGE_DECLARE_OK, ExchangeDeclareOk));
            }
            ExchangeDelete(args) => {
                if self.exchanges.remove(&args.exchange_name).is_none() {
                    return not_found("exchange", &args.exchange_name);
                }

                self.bindings.retain(|b| b.exchange != args.exchange_name);

                conn.send(AMQPFrame::Method(ch, frame::EXCHANGE_DELETE_OK, ExchangeDeleteOk));
            }
            QueueDeclare(args) => {
                self.declares += 1;

                let durable = args.flags.contains(QueueDeclareFlags::DURABLE);
                let exclusive = args.flags.contains(QueueDeclareFlags::EXCLUSIVE);
                let auto_delete = args.flags.contains(QueueDeclareFlags::AUTO_DELETE);
                let passive = args.flags.contains(QueueDeclareFlags::PASSIVE);

                let name = if args.name.is_empty() {
                    format!("amq.gen-{:04}", self.queues.len() + 1)
                } else {
                    args.name
                };

                match self.queues.get(&name) {
                    Some(_) if passive => (),
                    Some(q) if q.durable == durable && q.exclusive == exclusive && q.auto_delete == auto_delete => (),
                    Some(_) => {
                        return Err((
                            406,
                            format!("PRECONDITION_FAILED - inequivalent arg for queue '{name}'"),
                        ))
                    }
                    None if passive => return not_found("queue", &name),
                    None => {
                        self.queues.insert(
                            name.clone(),
                            Queue {
                                durable,
                                exclusive,
                                auto_delete,
                                owner: exclusive.then_some(conn.id),
                                messages: VecDeque::new(),
                                consumers: VecDeque::new(),
                            },
                        );
                    }
                }

                let queue = &self.queues[&name];

                conn.send(AMQPFrame::Method(
                    ch,
                    frame::QUEUE_DECLARE_OK,
                    QueueDeclareOk(frame::QueueDeclareOkArgs {
                        name,
                        message_count: queue.messages.len() as u32,
                        consumer_count: queue.consumers.len() as u32,
                    }),
                ));
            }
            QueueBind(args) => {
                if !self.queues.contains_key(&args.queue_name) {
                    return not_found("queue", &args.queue_name);
                }

                if !self.exchanges.contains_key(&args.exchange_name) {
                    return not_found("exchange", &args.exchange_name);
                }

                let binding = Binding {
                    queue: args.queue_name,
                    exchange: args.exchange_name,
                    routing_key: args.routing_key,
                };

                if !self.bindings.contains(&binding) {
                    self.bindings.push(binding);
                }

                conn.send(AMQPFrame::Method(ch, frame::QUEUE_BIND_OK, QueueBindOk));
            }
            QueueUnbind(args) => {
                self.bindings.retain(|b| {
                    !(b.queue == args.queue_name && b.exchange == args.exchange_name && b.routing_key == args.routing_key)
                });

                conn.send(AMQPFrame::Method(ch, frame::QUEUE_UNBIND_OK, QueueUnbindOk));
            }
            QueuePurge(args) => {
                let Some(queue) = self.queues.get_mut(&args.queue_name) else {
                    return not_found("queue", &args.queue_name);
                };

                let count = queue.messages.len() as u32;
                queue.messages.clear();

                conn.send(AMQPFrame::Method(
                    ch,
                    frame::QUEUE_PURGE_OK,
                    QueuePurgeOk(frame::QueuePurgeOkArgs { message_count: count }),
                ));
            }
            QueueDelete(args) => {
                let Some(queue) = self.queues.remove(&args.queue_name) else {
                    return not_found("queue", &args.queue_name);
                };

                self.bindings.retain(|b| b.queue != args.queue_name);

                for consumer in &queue.consumers {
                    let cancel = frame::BasicCancelArgs {
                        consumer_tag: consumer.tag.clone(),
                        no_wait: false,
                    };

                    let _ = consumer.out.send(cancel.frame(consumer.channel).into());
                }

                conn.send(AMQPFrame::Method(
                    ch,
                    frame::QUEUE_DELETE_OK,
                    QueueDeleteOk(frame::QueueDeleteOkArgs {
                        message_count: queue.messages.len() as u32,
                    }),
                ));
            }
            BasicQos(_) => conn.send(AMQPFrame::Method(ch, frame::BASIC_QOS_OK, BasicQosOk)),
            ConfirmSelect(_) => {
                if let Some(c) = self.channels.get_mut(&(conn.id, ch)) {
                    c.confirm_tag.get_or_insert(0);
                }

                conn.send(AMQPFrame::Method(ch, frame::CONFIRM_SELECT_OK, ConfirmSelectOk));
            }
            BasicConsume(args) => {
                let Some(queue) = self.queues.get_mut(&args.queue) else {
                    return not_found("queue", &args.queue);
                };

                let tag = if args.consumer_tag.is_empty() {
                    format!("amq.ctag-{}", conn.id)
                } else {
                    args.consumer_tag
                };

                queue.consumers.push_back(Consumer {
                    conn: conn.id,
                    channel: ch,
                    tag: tag.clone(),
                    no_ack: args.flags.contains(BasicConsumeFlags::NO_ACK),
                    out: conn.out.clone(),
                });

                conn.send(AMQPFrame::Method(
                    ch,
                    frame::BASIC_CONSUME_OK,
                    BasicConsumeOk(frame::BasicConsumeOkArgs { consumer_tag: tag }),
                ));

                self.dispatch(&args.queue);
            }
            BasicCancel(args) => {
                for queue in self.queues.values_mut() {
                    queue
                        .consumers
                        .retain(|c| !(c.conn == conn.id && c.channel == ch && c.tag == args.consumer_tag));
                }

                if !args.no_wait {
                    conn.send(
                        frame::BasicCancelOkArgs {
                            consumer_tag: args.consumer_tag,
                        }
                        .frame(ch),
                    );
                }
            }
            BasicCancelOk(_) => (),
            BasicPublish(args) => {
                if let Some(c) = self.channels.get_mut(&(conn.id, ch)) {
                    c.publish = Some(PendingPublish {
                        args,
                        header: None,
                        body: vec![],
                    });
                }
            }
            BasicAck(args) => self.settle(conn.id, ch, args.delivery_tag, args.multiple, None)?,
            BasicNack(args) => {
                let requeue = args.flags.contains(frame::BasicNackFlags::REQUEUE);

                self.settle(conn.id, ch, args.delivery_tag, args.is_multiple(), Some(requeue))?
            }
            BasicReject(args) => self.settle(conn.id, ch, args.delivery_tag, false, Some(args.requeue))?,
            other => panic!("broker doesn't handle {other:?}"),
        }

        Ok(())
    }

    /// Ack (`requeue` is `None`) or reject delivered messages.
    fn settle(&mut self, conn: u64, ch: Channel, tag: u64, multiple: bool, requeue: Option<bool>) -> ChannelResult {
        let Some(c) = self.channels.get_mut(&(conn, ch)) else {
            return Ok(());
        };

        let settled: Vec<(u64, (String, Msg))> = if multiple && tag == 0 {
            std::mem::take(&mut c.unacked).into_iter().collect()
        } else if multiple {
            let rest = c.unacked.split_off(&(tag + 1));
            let settled = std::mem::replace(&mut c.unacked, rest);

            settled.into_iter().collect()
        } else {
            match c.unacked.remove(&tag) {
                Some(m) => vec![(tag, m)],
                None => {
                    return Err((406, format!("PRECONDITION_FAILED - unknown delivery tag {tag}")));
                }
            }
        };

        if requeue == Some(true) {
            self.requeue(settled.into_iter().map(|(_, m)| m).collect());
        }

        Ok(())
    }

    fn requeue(&mut self, messages: Vec<(String, Msg)>) {
        let mut touched = vec![];

        for (queue_name, mut msg) in messages.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                msg.redelivered = true;
                queue.messages.push_front(msg);

                if !touched.contains(&queue_name) {
                    touched.push(queue_name);
                }
            }
        }

        for queue_name in touched {
            self.dispatch(&queue_name);
        }
    }

    fn try_complete_publish(&mut self, conn: &Conn, ch: Channel) {
        let Some(c) = self.channels.get_mut(&(conn.id, ch)) else {
            return;
        };

        let complete = matches!(
            &c.publish,
            Some(PendingPublish { header: Some(h), body, .. }) if body.len() as u64 >= h.body_size
        );

        if !complete {
            return;
        }

        let Some(PendingPublish {
            args,
            header: Some(header),
            body,
        }) = c.publish.take()
        else {
            return;
        };

        let confirm = c.confirm_tag.as_mut().map(|tag| {
            *tag += 1;
            *tag
        });

        let msg = Msg {
            exchange: args.exchange_name.clone(),
            routing_key: args.routing_key.clone(),
            header,
            body,
            redelivered: false,
        };

        let Some(queues) = self.route(&msg.exchange, &msg.routing_key) else {
            let text = format!("NOT_FOUND - no exchange '{}'", msg.exchange);

            self.close_channel(conn, ch, 404, &text, frame::BASIC_PUBLISH);
            return;
        };

        if queues.is_empty() && args.is_mandatory() {
            let returned = frame::BasicReturnArgs {
                reply_code: 312,
                reply_text: "NO_ROUTE".to_string(),
                exchange_name: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
            };
            let mut frames = vec![AMQPFrame::Method(
                ch,
                frame::BASIC_RETURN,
                MethodFrameArgs::BasicReturn(returned),
            )];

            frames.extend(content_frames(ch, &msg, conn.config.frame_max));

            let _ = conn.out.send(Frame::Frames(frames));
        }

        for queue_name in &queues {
            if let Some(queue) = self.queues.get_mut(queue_name) {
                queue.messages.push_back(msg.clone());
            }

            self.dispatch(queue_name);
        }

        if let Some(tag) = confirm {
            conn.send(
                frame::BasicAckArgs {
                    delivery_tag: tag,
                    multiple: false,
                }
                .frame(ch),
            );
        }

        self.published += 1;

        if conn.config.block_after == Some(self.published) {
            conn.send(frame::ConnectionBlockedArgs::new("publish limit").frame());
        }
    }

    /// Names of the queues the message goes to, `None` if the exchange doesn't exist.
    fn route(&self, exchange: &str, routing_key: &str) -> Option<Vec<String>> {
        if exchange.is_empty() {
            return Some(
                self.queues
                    .contains_key(routing_key)
                    .then(|| routing_key.to_string())
                    .into_iter()
                    .collect(),
            );
        }

        let kind = &self.exchanges.get(exchange)?.kind;
        let mut queues: Vec<String> = vec![];

        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            let matched = match kind.as_str() {
                "fanout" => true,
                "topic" => match_routing_key(&binding.routing_key, routing_key),
                _ => binding.routing_key == routing_key,
            };

            if matched && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }

        Some(queues)
    }

    /// Deliver the messages of the queue to its consumers, round robin.
    fn dispatch(&mut self, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        while !queue.consumers.is_empty() {
            let Some(msg) = queue.messages.pop_front() else {
                break;
            };

            let Some(consumer) = queue.consumers.pop_front() else {
                break;
            };

            let Some(c) = self.channels.get_mut(&(consumer.conn, consumer.channel)) else {
                queue.messages.push_front(msg);
                continue;
            };

            c.next_delivery += 1;

            let tag = c.next_delivery;
            let ch = consumer.channel;

            let deliver = frame::BasicDeliverArgs {
                consumer_tag: consumer.tag.clone(),
                delivery_tag: tag,
                redelivered: msg.redelivered,
                exchange_name: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
            };
            let mut frames = vec![AMQPFrame::Method(
                ch,
                frame::BASIC_DELIVER,
                MethodFrameArgs::BasicDeliver(deliver),
            )];

            frames.extend(content_frames(ch, &msg, 131_072));

            let _ = consumer.out.send(Frame::Frames(frames));

            if !consumer.no_ack {
                c.unacked.insert(tag, (queue_name.to_string(), msg));
            }

            queue.consumers.push_back(consumer);
        }
    }

    fn close_channel(&mut self, conn: &Conn, ch: Channel, code: u16, text: &str, cm: ClassMethod) {
        self.channel_closed(conn.id, ch);

        self.channels.insert(
            (conn.id, ch),
            Chan {
                closing: true,
                ..Default::default()
            },
        );

        conn.send(frame::channel_close(ch, code, text, cm));
    }

    /// Drop the consumers of the channel and requeue its unacked messages.
    fn channel_closed(&mut self, conn: u64, ch: Channel) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| !(c.conn == conn && c.channel == ch));
        }

        if let Some(c) = self.channels.remove(&(conn, ch)) {
            self.requeue(c.unacked.into_values().collect());
        }
    }

    fn connection_closed(&mut self, conn: u64) {
        let channels: Vec<Channel> = self
            .channels
            .keys()
            .filter(|(id, _)| *id == conn)
            .map(|(_, ch)| *ch)
            .collect();

        for ch in channels {
            self.channel_closed(conn, ch);
        }

        self.queues.retain(|_, q| q.owner != Some(conn));
        self.connections.remove(&conn);
    }
}

fn content_frames(ch: Channel, msg: &Msg, frame_max: u32) -> Vec<AMQPFrame> {
    let header = ContentHeaderFrame {
        channel: ch,
        ..msg.header.clone()
    };

    let mut frames = vec![header.frame()];

    frames.extend(content::split_body(ch, &msg.body, frame_max).into_iter().map(|b| b.frame()));

    frames
}

#[test]
fn topic_routing_keys() {
    assert!(match_routing_key("xxx", "xxx"));
    assert!(match_routing_key("stocks.*.goog", "stocks.nwse.goog"));
    assert!(match_routing_key("stocks.#", "stocks.nwse.goog"));
    assert!(match_routing_key("stocks.#", "stocks"));
    assert!(!match_routing_key("stocks.*", "stocks.nwse.goog"));
    assert!(!match_routing_key("xxx", "yyy"));
}
