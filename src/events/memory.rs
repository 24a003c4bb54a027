//! In-process exchange with AMQP-style routing.
//!
//! Topic exchanges route by binding pattern (`*` matches exactly one word,
//! `#` matches zero or more); fanout exchanges deliver to every bound queue.
//! Queues hold up to [`QUEUE_CAPACITY`] raw messages and drop new ones when
//! full.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, OnceCell, RwLock};

use crate::error::{AppError, AppResult};
use crate::events::{
    EventPublisher, EventSubscriber, DRIVER_EXCHANGE, LOCATION_EXCHANGE, RIDE_EXCHANGE,
};

pub const QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Fanout,
}

struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
    sender: mpsc::Sender<Vec<u8>>,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeKind>,
    bindings: Vec<Binding>,
}

#[derive(Clone, Default)]
pub struct InMemoryBus {
    topology: Arc<RwLock<Topology>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus with the ride, driver and location exchanges declared
    pub async fn with_default_topology() -> Self {
        let bus = Self::new();
        bus.declare_exchange(RIDE_EXCHANGE, ExchangeKind::Topic).await;
        bus.declare_exchange(DRIVER_EXCHANGE, ExchangeKind::Topic).await;
        bus.declare_exchange(LOCATION_EXCHANGE, ExchangeKind::Fanout).await;
        bus
    }

    pub async fn declare_exchange(&self, name: &str, kind: ExchangeKind) {
        self.topology
            .write()
            .await
            .exchanges
            .insert(name.to_string(), kind);
    }

    /// Typed handle for a queue bound to `exchange` under `pattern`.
    /// Nothing is declared until [`EventSubscriber::start`] runs.
    pub fn queue<T>(&self, name: &str, exchange: &str, pattern: &str) -> BusQueue<T> {
        BusQueue {
            bus: self.clone(),
            name: name.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
            receiver: Arc::new(OnceCell::new()),
            _payload: PhantomData,
        }
    }

    async fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> AppResult<mpsc::Receiver<Vec<u8>>> {
        let mut topology = self.topology.write().await;
        if !topology.exchanges.contains_key(exchange) {
            return Err(AppError::Transport(format!("exchange {} is not declared", exchange)));
        }

        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        topology.bindings.push(Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            pattern: pattern.to_string(),
            sender,
        });
        tracing::debug!(queue, exchange, pattern, "Queue bound");
        Ok(receiver)
    }
}

#[async_trait]
impl EventPublisher for InMemoryBus {
    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> AppResult<()> {
        let topology = self.topology.read().await;
        let kind = *topology
            .exchanges
            .get(exchange)
            .ok_or_else(|| AppError::Transport(format!("exchange {} is not declared", exchange)))?;

        let routed = topology.bindings.iter().filter(|b| {
            b.exchange == exchange
                && (kind == ExchangeKind::Fanout || topic_matches(&b.pattern, routing_key))
        });

        for binding in routed {
            match binding.sender.try_send(body.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(queue = %binding.queue, routing_key, "Queue full, message dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(queue = %binding.queue, "Queue closed");
                }
            }
        }

        Ok(())
    }
}

/// Subscriber side of one bound queue, decoding JSON bodies into `T`.
/// Messages published while no consumer is attached wait in the queue.
pub struct BusQueue<T> {
    bus: InMemoryBus,
    name: String,
    exchange: String,
    pattern: String,
    receiver: Arc<OnceCell<Arc<Mutex<mpsc::Receiver<Vec<u8>>>>>>,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T> EventSubscriber<T> for BusQueue<T>
where
    T: DeserializeOwned + Send + 'static,
{
    async fn start(&self) -> AppResult<()> {
        self.receiver
            .get_or_try_init(|| async {
                let receiver = self.bus.bind(&self.name, &self.exchange, &self.pattern).await?;
                Ok::<_, AppError>(Arc::new(Mutex::new(receiver)))
            })
            .await?;
        Ok(())
    }

    async fn subscribe(&self) -> AppResult<mpsc::Receiver<T>> {
        let raw = self
            .receiver
            .get()
            .cloned()
            .ok_or_else(|| AppError::Transport(format!("queue {} is not started", self.name)))?;

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let queue = self.name.clone();

        tokio::spawn(async move {
            // One consumer at a time; the lock is released when it detaches
            let mut raw = raw.lock_owned().await;
            loop {
                let body = tokio::select! {
                    biased;
                    _ = tx.closed() => break,
                    body = raw.recv() => body,
                };
                let Some(body) = body else { break };

                match serde_json::from_slice::<T>(&body) {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "Undecodable message dropped");
                    }
                }
            }
            tracing::debug!(queue = %queue, "Consumer detached");
        });

        Ok(rx)
    }
}

/// AMQP topic match of a dotted routing key against a binding pattern
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}
