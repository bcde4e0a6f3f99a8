//! Declarative topology: the exchanges, queues and bindings an application needs. `ensure` can be
//! called any number of times, what is already declared by this process with the same attributes
//! is not sent to the server again.
//!
//! Deleting an exchange or a queue through a channel of the same client removes it from what is
//! known, so the next `ensure` declares it again. Auto-delete entities can disappear without the
//! client knowing, they are declared every time.
use crate::channel_api::Channel;
use crate::error::ClientError;
use crate::model::{ChannelError, ExchangeDeclareOpts, ExchangeType, QueueDeclareOpts};
use crate::Result;
use log::{debug, info};
use serde_derive::Deserialize;
use std::collections::{HashMap, HashSet};

fn durable_default() -> bool {
    true
}

/// An exchange to be declared.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ExchangeDecl {
    #[serde(rename = "exchange")]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ExchangeType,
    #[serde(default = "durable_default")]
    pub durable: bool,
    #[serde(default, rename = "autoDelete")]
    pub auto_delete: bool,
}

impl ExchangeDecl {
    /// Durable, not auto deleted exchange.
    pub fn new(name: &str, kind: impl Into<ExchangeType>) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.into(),
            durable: true,
            auto_delete: false,
        }
    }

    pub fn durable(mut self, mode: bool) -> Self {
        self.durable = mode;
        self
    }

    pub fn auto_delete(mut self, mode: bool) -> Self {
        self.auto_delete = mode;
        self
    }

    fn opts(&self) -> ExchangeDeclareOpts {
        ExchangeDeclareOpts::default()
            .durable(self.durable)
            .auto_delete(self.auto_delete)
    }
}

/// A binding of a queue to an exchange.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct BindingDecl {
    pub exchange: String,
    #[serde(default, rename = "routingKey")]
    pub routing_key: String,
}

/// A queue to be declared with its bindings. Empty name lets the server generate one.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct QueueDecl {
    #[serde(default, rename = "queue")]
    pub name: String,
    #[serde(default = "durable_default")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default, rename = "autoDelete")]
    pub auto_delete: bool,
    #[serde(default)]
    pub bindings: Vec<BindingDecl>,
}

impl QueueDecl {
    /// Durable queue without bindings.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            bindings: vec![],
        }
    }

    pub fn durable(mut self, mode: bool) -> Self {
        self.durable = mode;
        self
    }

    pub fn exclusive(mut self, mode: bool) -> Self {
        self.exclusive = mode;
        self
    }

    pub fn auto_delete(mut self, mode: bool) -> Self {
        self.auto_delete = mode;
        self
    }

    pub fn bind(mut self, exchange: &str, routing_key: &str) -> Self {
        self.bindings.push(BindingDecl {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });
        self
    }

    fn attrs(&self) -> QueueAttrs {
        QueueAttrs {
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
        }
    }

    fn opts(&self) -> QueueDeclareOpts {
        QueueDeclareOpts::default()
            .durable(self.durable)
            .exclusive(self.exclusive)
            .auto_delete(self.auto_delete)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct QueueAttrs {
    durable: bool,
    exclusive: bool,
    auto_delete: bool,
}

/// What this process has already declared.
#[derive(Debug, Default)]
pub struct Topology {
    exchanges: HashMap<String, ExchangeDecl>,
    queues: HashMap<String, QueueAttrs>,
    bindings: HashSet<(String, String, String)>,
}

fn is_not_found(err: &ClientError) -> bool {
    err.reply_code() == Some(ChannelError::NotFound as u16)
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// The exchange is deleted, its bindings are gone with it.
    pub(crate) fn forget_exchange(&mut self, name: &str) {
        self.exchanges.remove(name);
        self.bindings.retain(|(_, exchange, _)| exchange != name);
    }

    /// The queue is deleted, its bindings are gone with it.
    pub(crate) fn forget_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|(queue, _, _)| queue != name);
    }

    pub(crate) fn forget_binding(&mut self, queue: &str, exchange: &str, routing_key: &str) {
        self.bindings
            .remove(&(queue.to_string(), exchange.to_string(), routing_key.to_string()));
    }

    fn is_auto_deleted_exchange(&self, name: &str) -> bool {
        self.exchanges.get(name).map_or(false, |e| e.auto_delete)
    }

    /// Declare the exchanges, then the queues, then the bindings of the queues. It returns the
    /// queue names in the order of `queues`, the server generated names included.
    ///
    /// The first failure stops the sequence, the entities declared before it stay on the server.
    /// Re-declaring a name with different attributes fails with `DeclarationConflict` without
    /// asking the server.
    pub async fn ensure(
        &mut self,
        channel: &Channel,
        exchanges: &[ExchangeDecl],
        queues: &[QueueDecl],
    ) -> Result<Vec<String>> {
        for exchange in exchanges {
            match self.exchanges.get(&exchange.name) {
                Some(known) if known != exchange => {
                    return Err(ClientError::DeclarationConflict {
                        entity: "exchange",
                        name: exchange.name.clone(),
                        text: format!("declared before as {:?}", known),
                    })
                }
                Some(_) if !exchange.auto_delete => {
                    debug!("Exchange {} is already declared", exchange.name);
                    continue;
                }
                _ => (),
            }

            channel
                .exchange_declare(&exchange.name, exchange.kind.clone(), exchange.opts())
                .await?;

            info!("Exchange {} ({}) is declared", exchange.name, exchange.kind);

            self.exchanges.insert(exchange.name.clone(), exchange.clone());
        }

        let mut names = Vec::with_capacity(queues.len());

        for queue in queues {
            let attrs = queue.attrs();

            if !queue.name.is_empty() {
                match self.queues.get(&queue.name) {
                    Some(known) if *known != attrs => {
                        return Err(ClientError::DeclarationConflict {
                            entity: "queue",
                            name: queue.name.clone(),
                            text: format!("declared before as {:?}", known),
                        })
                    }
                    Some(_) if !attrs.auto_delete => {
                        debug!("Queue {} is already declared", queue.name);

                        names.push(queue.name.clone());
                        continue;
                    }
                    _ => (),
                }
            }

            let ok = channel.queue_declare(&queue.name, queue.opts()).await?;

            info!("Queue {} is declared", ok.name);

            if !queue.name.is_empty() {
                self.queues.insert(ok.name.clone(), attrs);
            }

            names.push(ok.name);
        }

        for (queue, name) in queues.iter().zip(&names) {
            for binding in &queue.bindings {
                let key = (name.clone(), binding.exchange.clone(), binding.routing_key.clone());
                let auto_deleted = queue.auto_delete || self.is_auto_deleted_exchange(&binding.exchange);

                if self.bindings.contains(&key) && !auto_deleted {
                    continue;
                }

                if let Err(e) = channel
                    .queue_bind(name, &binding.exchange, &binding.routing_key)
                    .await
                {
                    if is_not_found(&e) {
                        // one of them is deleted behind our back
                        self.forget_exchange(&binding.exchange);
                        self.forget_queue(name);
                    }

                    return Err(e);
                }

                debug!("Queue {} is bound to {} by {:?}", name, binding.exchange, binding.routing_key);

                self.bindings.insert(key);
            }
        }

        Ok(names)
    }
}
