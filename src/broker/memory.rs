//! In-process broker.
//!
//! Implements the broker seam with AMQP direct-exchange semantics: durable
//! declarations are idempotent, messages are routed by exact routing key,
//! deliveries stop at the channel prefetch limit until acknowledged, and a
//! dropped connection requeues unacknowledged messages as redelivered.
//! Like an AMQP broker, a failed declaration, bind or consume closes the
//! channel it was issued on. Faults can be injected to exercise the error
//! paths of the messaging layer.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::watch;

use super::{
    BrokerChannel, BrokerConnection, BrokerResult, ConnectionState, Delivery, DeliveryStream,
    ExchangeKind,
};
use crate::error::BrokerError;

/// A message as seen by [`MemoryBroker::published`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub persistent: bool,
}

/// In-process broker. Clones share the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    state_tx: watch::Sender<ConnectionState>,
}

#[derive(Default)]
struct State {
    opened: bool,
    refuse_connections: bool,
    connected: bool,
    closed: bool,
    epoch: u64,
    exchanges: HashMap<String, ExchangeKind>,
    queues: BTreeMap<String, VecDeque<StoredMessage>>,
    /// (exchange, routing key, queue)
    bindings: HashSet<(String, String, String)>,
    channels: HashMap<u64, ChannelState>,
    consumers: Vec<ConsumerEntry>,
    next_channel_id: u64,
    next_delivery_tag: u64,
    published: Vec<PublishedMessage>,
    faults: Faults,
}

#[derive(Default)]
struct Faults {
    nacks: usize,
    queue_declares: HashSet<String>,
    binds: HashSet<String>,
}

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

struct ChannelState {
    prefetch: u16,
    confirms: bool,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
}

struct ConsumerEntry {
    tag: String,
    channel_id: u64,
    queue: String,
    sender: mpsc::UnboundedSender<BrokerResult<Delivery>>,
}

impl MemoryBroker {
    /// Create a broker that accepts the connection as soon as it is opened.
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                state_tx,
            }),
        }
    }

    /// Create a broker that never accepts the connection.
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.lock().refuse_connections = true;
        broker
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared.lock()
    }

    /// Simulate a connection loss. Channels and subscriptions are dropped and
    /// unacknowledged messages go back to their queues.
    pub fn drop_connection(&self) {
        let mut state = self.lock();
        if !state.connected {
            return;
        }
        state.disconnect();
        drop(state);
        self.shared.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Simulate a successful reconnect after [`drop_connection`](Self::drop_connection).
    pub fn restore_connection(&self) {
        let mut state = self.lock();
        if state.connected || state.closed || !state.opened {
            return;
        }
        state.epoch += 1;
        state.connected = true;
        let epoch = state.epoch;
        drop(state);
        self.shared.state_tx.send_replace(ConnectionState::Connected(epoch));
    }

    /// Negatively acknowledge the next `count` publishes. The messages are
    /// dropped; only a channel in confirm mode reports it.
    pub fn nack_next_publishes(&self, count: usize) {
        self.lock().faults.nacks = count;
    }

    /// Remove an exchange and its bindings, as an operator would.
    pub fn delete_exchange(&self, name: &str) {
        let mut state = self.lock();
        state.exchanges.remove(name);
        state.bindings.retain(|(exchange, _, _)| exchange != name);
    }

    /// Make every declaration of `queue` fail.
    pub fn fail_queue_declare(&self, queue: &str) {
        self.lock().faults.queue_declares.insert(queue.to_string());
    }

    /// Make every bind of `queue` fail.
    pub fn fail_bind(&self, queue: &str) {
        self.lock().faults.binds.insert(queue.to_string());
    }

    /// Every accepted publish, in order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Routing keys of every accepted publish, in order.
    pub fn routing_keys(&self) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .map(|message| message.routing_key.clone())
            .collect()
    }

    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Declared queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        self.lock().queues.keys().cloned().collect()
    }

    /// (exchange, routing key) pairs bound to `queue`, sorted.
    pub fn bindings_for(&self, queue: &str) -> Vec<(String, String)> {
        let state = self.lock();
        let mut bindings: Vec<(String, String)> = state
            .bindings
            .iter()
            .filter(|(_, _, bound)| bound == queue)
            .map(|(exchange, key, _)| (exchange.clone(), key.clone()))
            .collect();
        bindings.sort();
        bindings
    }

    /// Messages waiting in `queue`, not counting unacknowledged ones.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Unacknowledged deliveries across all channels.
    pub fn unacked_count(&self) -> usize {
        self.lock()
            .channels
            .values()
            .map(|channel| channel.unacked.len())
            .sum()
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    pub fn channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    /// Prefetch limits of the open channels that set one.
    pub fn prefetch_limits(&self) -> Vec<u16> {
        let state = self.lock();
        let mut limits: Vec<u16> = state
            .channels
            .values()
            .map(|channel| channel.prefetch)
            .filter(|prefetch| *prefetch > 0)
            .collect();
        limits.sort_unstable();
        limits
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn disconnect(&mut self) {
        self.connected = false;

        let mut returned = Vec::new();
        for channel in self.channels.values_mut() {
            returned.extend(std::mem::take(&mut channel.unacked));
        }
        self.requeue(returned);

        self.channels.clear();
        self.consumers.clear();
    }

    /// Drop channel `id` with its subscriptions and requeue what it held.
    fn close_channel(&mut self, id: u64) {
        let Some(channel) = self.channels.remove(&id) else {
            return;
        };
        self.consumers.retain(|consumer| consumer.channel_id != id);
        self.requeue(channel.unacked.into_iter().collect());
        self.dispatch();
    }

    /// Close channel `id` and hand back `err`.
    fn fail_channel(&mut self, id: u64, err: BrokerError) -> BrokerError {
        self.close_channel(id);
        err
    }

    fn requeue(&mut self, mut returned: Vec<(u64, (String, StoredMessage))>) {
        // Front-insert newest first so the oldest ends up at the head.
        returned.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, (queue, mut message)) in returned {
            message.redelivered = true;
            if let Some(messages) = self.queues.get_mut(&queue) {
                messages.push_front(message);
            }
        }
    }

    fn channel(&mut self, id: u64) -> BrokerResult<&mut ChannelState> {
        if !self.connected {
            return Err(BrokerError::ChannelClosed("connection lost".to_string()));
        }
        self.channels
            .get_mut(&id)
            .ok_or_else(|| BrokerError::ChannelClosed(format!("channel {} is closed", id)))
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) {
        let fanout = self.exchanges.get(exchange) == Some(&ExchangeKind::Fanout);
        let mut targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|(bound_exchange, key, _)| {
                bound_exchange == exchange && (fanout || key == routing_key)
            })
            .map(|(_, _, queue)| queue.clone())
            .collect();
        targets.sort();
        targets.dedup();
        for queue in targets {
            if let Some(messages) = self.queues.get_mut(&queue) {
                messages.push_back(message.clone());
            }
        }
    }

    /// Hand queued messages to consumers, one per consumer per pass, until
    /// queues are empty or every channel is at its prefetch limit.
    fn dispatch(&mut self) {
        let State {
            queues,
            channels,
            consumers,
            next_delivery_tag,
            ..
        } = self;

        loop {
            let mut progressed = false;
            let mut dead = Vec::new();

            for (index, consumer) in consumers.iter().enumerate() {
                let Some(channel) = channels.get_mut(&consumer.channel_id) else {
                    continue;
                };
                if channel.prefetch > 0 && channel.unacked.len() >= channel.prefetch as usize {
                    continue;
                }
                let Some(messages) = queues.get_mut(&consumer.queue) else {
                    continue;
                };
                let Some(message) = messages.pop_front() else {
                    continue;
                };

                *next_delivery_tag += 1;
                let tag = *next_delivery_tag;
                let delivery = Delivery {
                    delivery_tag: tag,
                    queue: consumer.queue.clone(),
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    redelivered: message.redelivered,
                    body: message.body.clone(),
                };

                if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                    messages.push_front(message);
                    dead.push(index);
                    continue;
                }
                channel.unacked.insert(tag, (consumer.queue.clone(), message));
                progressed = true;
            }

            for index in dead.into_iter().rev() {
                consumers.remove(index);
            }
            if !progressed {
                break;
            }
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryBroker {
    fn open(&self) {
        let mut state = self.lock();
        if state.opened || state.refuse_connections || state.closed {
            return;
        }
        state.opened = true;
        state.connected = true;
        state.epoch = 1;
        drop(state);
        self.shared.state_tx.send_replace(ConnectionState::Connected(1));
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    async fn create_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let mut state = self.lock();
        if !state.connected {
            return Err(BrokerError::NotConnected);
        }
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        state.channels.insert(
            id,
            ChannelState {
                prefetch: 0,
                confirms: false,
                unacked: BTreeMap::new(),
            },
        );
        Ok(Arc::new(MemoryChannel {
            id,
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = self.lock();
        state.disconnect();
        state.closed = true;
        drop(state);
        self.shared.state_tx.send_replace(ConnectionState::Closed);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        let state = self.shared.lock();
        state.connected && state.channels.contains_key(&self.id)
    }

    async fn enable_confirms(&self) -> BrokerResult<()> {
        self.shared.lock().channel(self.id)?.confirms = true;
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        state.channel(self.id)?;
        match state.exchanges.get(name).copied() {
            Some(existing) if existing != kind => {
                let err = BrokerError::PreconditionFailed(format!(
                    "exchange {} already declared as {}",
                    name, existing
                ));
                Err(state.fail_channel(self.id, err))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        state.channel(self.id)?;
        if state.faults.queue_declares.contains(name) {
            let err = BrokerError::PreconditionFailed(format!("cannot declare queue {}", name));
            return Err(state.fail_channel(self.id, err));
        }
        state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        state.channel(self.id)?;
        if state.faults.binds.contains(queue) {
            let err = BrokerError::PreconditionFailed(format!("cannot bind queue {}", queue));
            return Err(state.fail_channel(self.id, err));
        }
        if !state.exchanges.contains_key(exchange) {
            let err = BrokerError::NotFound(format!("exchange {}", exchange));
            return Err(state.fail_channel(self.id, err));
        }
        if !state.queues.contains_key(queue) {
            let err = BrokerError::NotFound(format!("queue {}", queue));
            return Err(state.fail_channel(self.id, err));
        }
        state.bindings.insert((
            exchange.to_string(),
            routing_key.to_string(),
            queue.to_string(),
        ));
        Ok(())
    }

    async fn set_prefetch(&self, count: u16, _global: bool) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        state.channel(self.id)?.prefetch = count;
        state.dispatch();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        let confirms = state.channel(self.id)?.confirms;
        // Without confirm mode the broker reports neither failure to the publisher.
        if !state.exchanges.contains_key(exchange) {
            let err = BrokerError::NotFound(format!("exchange {}", exchange));
            let err = state.fail_channel(self.id, err);
            return if confirms { Err(err) } else { Ok(()) };
        }
        if state.faults.nacks > 0 {
            state.faults.nacks -= 1;
            let err = BrokerError::Rejected(format!("nacked message for {}", routing_key));
            return if confirms { Err(err) } else { Ok(()) };
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            persistent,
        });
        state.route(
            exchange,
            routing_key,
            StoredMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
                redelivered: false,
            },
        );
        state.dispatch();
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let mut state = self.shared.lock();
        state.channel(self.id)?;
        if !state.queues.contains_key(queue) {
            let err = BrokerError::NotFound(format!("queue {}", queue));
            return Err(state.fail_channel(self.id, err));
        }

        let (sender, receiver) = mpsc::unbounded();
        state.consumers.push(ConsumerEntry {
            tag: consumer_tag.to_string(),
            channel_id: self.id,
            queue: queue.to_string(),
            sender,
        });
        state.dispatch();
        Ok(receiver.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        state.channel(self.id)?;
        state
            .consumers
            .retain(|consumer| !(consumer.channel_id == self.id && consumer.tag == consumer_tag));
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        if state.channel(self.id)?.unacked.remove(&delivery_tag).is_none() {
            return Err(state.fail_channel(self.id, unknown_tag(delivery_tag)));
        }
        state.dispatch();
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let mut state = self.shared.lock();
        let Some((queue, mut message)) = state.channel(self.id)?.unacked.remove(&delivery_tag) else {
            return Err(state.fail_channel(self.id, unknown_tag(delivery_tag)));
        };
        if requeue {
            message.redelivered = true;
            if let Some(messages) = state.queues.get_mut(&queue) {
                messages.push_front(message);
            }
        }
        state.dispatch();
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.shared.lock().close_channel(self.id);
        Ok(())
    }
}

fn unknown_tag(delivery_tag: u64) -> BrokerError {
    BrokerError::PreconditionFailed(format!("unknown delivery tag {}", delivery_tag))
}
