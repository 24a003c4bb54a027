//! Registry of live passenger sockets.
//!
//! Each connection runs a read pump and a write pump. The read pump owns the
//! auth handshake and the idle deadline; the write pump owns the socket's
//! send half and is the only writer. Either pump exiting cancels the
//! connection, which stops the other one, and both remove the registry entry
//! (only the first removal has any effect).

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocketUpgrade};
use axum::response::Response;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::events::{DriverLocationUpdate, RideStatusUpdate};
use crate::realtime::message::{
    WsMessage, AUTH, AUTH_SUCCESS, DRIVER_LOCATION_UPDATE, RIDE_STATUS_UPDATE,
};
use crate::services::PassengerNotifier;
use crate::utils::cancel::CancelToken;

pub const OUTBOUND_CAPACITY: usize = 10;
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

struct PassengerConnection {
    serial: u64,
    passenger_id: Uuid,
    authenticated: AtomicBool,
    auth_deadline: Instant,
    outbound: mpsc::Sender<String>,
    cancel: CancelToken,
}

impl PassengerConnection {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Best-effort enqueue used for handshake replies
    fn offer(&self, message: &WsMessage) -> bool {
        match message.to_json() {
            Ok(frame) => self.outbound.try_send(frame).is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode frame");
                false
            }
        }
    }
}

pub struct PassengerConnectionManager {
    connections: RwLock<HashMap<Uuid, Arc<PassengerConnection>>>,
    tasks: Mutex<JoinSet<()>>,
    shutdown: CancelToken,
    next_serial: AtomicU64,
}

impl PassengerConnectionManager {
    pub fn new(shutdown: CancelToken) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
            shutdown,
            next_serial: AtomicU64::new(1),
        }
    }

    /// Upgrades the request and attaches the socket for `passenger_id`.
    /// `token` is the bearer token the transport already verified; the
    /// client must echo it in its first frame.
    pub fn handle_connection(
        self: &Arc<Self>,
        ws: WebSocketUpgrade,
        passenger_id: Uuid,
        token: String,
    ) -> Response {
        let manager = self.clone();
        ws.on_failed_upgrade(move |e| {
            tracing::warn!(passenger_id = %passenger_id, error = %e, "WebSocket upgrade failed");
        })
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            if let Err(e) = manager.attach(passenger_id, token, sink, stream).await {
                tracing::warn!(passenger_id = %passenger_id, error = %e, "Connection rejected");
            }
        })
    }

    /// Registers a connection over an already split socket and starts its
    /// pumps. An existing connection for the same passenger is superseded.
    pub async fn attach<K, S, E>(
        self: &Arc<Self>,
        passenger_id: Uuid,
        token: String,
        sink: K,
        stream: S,
    ) -> AppResult<()>
    where
        K: Sink<Message> + Unpin + Send + 'static,
        K::Error: Display + Send,
        S: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
        E: Display + Send + 'static,
    {
        let (outbound, queue) = mpsc::channel(OUTBOUND_CAPACITY);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(PassengerConnection {
            serial,
            passenger_id,
            authenticated: AtomicBool::new(false),
            auth_deadline: Instant::now() + AUTH_TIMEOUT,
            outbound,
            cancel: self.shutdown.child(),
        });

        let mut tasks = self.tasks.lock().await;
        if self.shutdown.is_cancelled() {
            return Err(AppError::Internal("connection manager is shut down".to_string()));
        }

        let previous = self
            .connections
            .write()
            .await
            .insert(passenger_id, conn.clone());
        if let Some(previous) = previous {
            tracing::info!(passenger_id = %passenger_id, "Superseding existing connection");
            previous.cancel.cancel();
        }

        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                tracing::warn!(error = %e, "Connection task ended abnormally");
            }
        }

        let span = tracing::info_span!("passenger_ws", passenger_id = %passenger_id, conn = serial);
        tasks.spawn(
            self.clone()
                .read_pump(conn.clone(), stream, token)
                .instrument(span.clone()),
        );
        tasks.spawn(self.clone().write_pump(conn, sink, queue).instrument(span));

        tracing::info!(passenger_id = %passenger_id, "Passenger connected");
        Ok(())
    }

    /// Cancels every connection and waits for all of their pumps to exit
    pub async fn shutdown(&self) {
        tracing::info!("Closing passenger connections");
        self.shutdown.cancel();

        let mut tasks = self.tasks.lock().await;
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                tracing::warn!(error = %e, "Connection task ended abnormally");
            }
        }
        tracing::info!("Passenger connections closed");
    }

    /// Registered connections, authenticated or not
    pub async fn connected_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_connected(&self, passenger_id: Uuid) -> bool {
        self.connections
            .read()
            .await
            .get(&passenger_id)
            .is_some_and(|conn| conn.is_authenticated())
    }

    async fn read_pump<S, E>(self: Arc<Self>, conn: Arc<PassengerConnection>, mut stream: S, token: String)
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let mut idle_deadline = Instant::now() + READ_IDLE_TIMEOUT;

        loop {
            let authenticated = conn.is_authenticated();
            let deadline = if authenticated {
                idle_deadline
            } else {
                idle_deadline.min(conn.auth_deadline)
            };

            let frame = tokio::select! {
                _ = conn.cancel.cancelled() => break,
                _ = sleep_until(deadline) => {
                    if authenticated {
                        tracing::debug!("Read idle timeout");
                    } else {
                        tracing::warn!("Authentication timed out");
                    }
                    break;
                }
                frame = stream.next() => frame,
            };

            let message = match frame {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Read failed");
                    break;
                }
                None => break,
            };

            let keep_reading = match message {
                Message::Text(text) => self.on_text(&conn, text.as_str(), &token),
                Message::Binary(_) => conn.is_authenticated(),
                Message::Pong(_) => {
                    idle_deadline = Instant::now() + READ_IDLE_TIMEOUT;
                    true
                }
                Message::Ping(_) => true,
                Message::Close(_) => false,
            };
            if !keep_reading {
                break;
            }
        }

        self.release(&conn).await;
    }

    /// Returns whether the connection should stay open
    fn on_text(&self, conn: &PassengerConnection, text: &str, token: &str) -> bool {
        let message = match serde_json::from_str::<WsMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed frame");
                return conn.is_authenticated();
            }
        };

        if conn.is_authenticated() {
            handle_passenger_message(&message);
            return true;
        }

        if message.kind != AUTH {
            tracing::warn!(kind = %message.kind, "Frame before authentication");
            return false;
        }

        match message.token.as_deref() {
            None | Some("") => {
                tracing::warn!("Auth frame without token");
                conn.offer(&WsMessage::auth_error("missing token"));
                false
            }
            Some(presented) if presented != token => {
                tracing::warn!("Auth frame with wrong token");
                conn.offer(&WsMessage::auth_error("invalid token"));
                false
            }
            Some(_) => {
                conn.authenticated.store(true, Ordering::Release);
                tracing::info!("Passenger authenticated");
                if !conn.offer(&WsMessage::new(AUTH_SUCCESS)) {
                    tracing::warn!("Outbound queue full during handshake, disconnecting");
                    return false;
                }
                true
            }
        }
    }

    async fn write_pump<K>(self: Arc<Self>, conn: Arc<PassengerConnection>, mut sink: K, mut queue: mpsc::Receiver<String>)
    where
        K: Sink<Message> + Unpin,
        K::Error: Display,
    {
        let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

        loop {
            tokio::select! {
                biased;
                _ = conn.cancel.cancelled() => {
                    let farewell = async {
                        // Frames queued before cancellation, such as auth_error, go out first
                        while let Ok(frame) = queue.try_recv() {
                            if sink.send(Message::text(frame)).await.is_err() {
                                return;
                            }
                        }
                        let close = CloseFrame {
                            code: close_code::NORMAL,
                            reason: Utf8Bytes::from_static("connection closed"),
                        };
                        let _ = sink.send(Message::Close(Some(close))).await;
                    };
                    if timeout(WRITE_TIMEOUT, farewell).await.is_err() {
                        tracing::debug!("Timed out sending close frame");
                    }
                    break;
                }
                frame = queue.recv() => {
                    let Some(frame) = frame else { break };
                    if let Err(e) = write_frame(&mut sink, Message::text(frame)).await {
                        tracing::debug!(error = %e, "Write failed");
                        break;
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = write_frame(&mut sink, Message::Ping(Bytes::new())).await {
                        tracing::debug!(error = %e, "Ping failed");
                        break;
                    }
                }
            }
        }

        self.release(&conn).await;
    }

    /// Cancels the connection and drops its registry entry if it is still
    /// the current one for its passenger
    async fn release(&self, conn: &Arc<PassengerConnection>) {
        conn.cancel.cancel();

        let mut connections = self.connections.write().await;
        let current = connections
            .get(&conn.passenger_id)
            .is_some_and(|registered| Arc::ptr_eq(registered, conn));
        if current {
            connections.remove(&conn.passenger_id);
            tracing::info!(passenger_id = %conn.passenger_id, conn = conn.serial, "Passenger disconnected");
        }
    }

    async fn push(&self, cancel: &CancelToken, passenger_id: Uuid, frame: String) -> AppResult<()> {
        let conn = self.connections.read().await.get(&passenger_id).cloned();
        let Some(conn) = conn.filter(|conn| conn.is_authenticated()) else {
            return Err(AppError::NotConnected(passenger_id));
        };

        let frame = match conn.outbound.try_send(frame) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Closed(_)) => return Err(AppError::NotConnected(passenger_id)),
            Err(TrySendError::Full(frame)) => frame,
        };

        tokio::select! {
            sent = timeout(PUSH_TIMEOUT, conn.outbound.send(frame)) => match sent {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(AppError::NotConnected(passenger_id)),
                Err(_) => {
                    tracing::warn!(passenger_id = %passenger_id, "Outbound queue stuck, disconnecting");
                    conn.cancel.cancel();
                    Err(AppError::PushTimeout(passenger_id))
                }
            },
            _ = conn.cancel.cancelled() => Err(AppError::NotConnected(passenger_id)),
            _ = cancel.cancelled() => Err(AppError::PushTimeout(passenger_id)),
        }
    }
}

async fn write_frame<K>(sink: &mut K, message: Message) -> Result<(), String>
where
    K: Sink<Message> + Unpin,
    K::Error: Display,
{
    match timeout(WRITE_TIMEOUT, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write deadline exceeded".to_string()),
    }
}

/// Passengers have no commands at this layer yet
fn handle_passenger_message(message: &WsMessage) {
    tracing::debug!(kind = %message.kind, "Ignoring passenger frame");
}

#[async_trait]
impl PassengerNotifier for PassengerConnectionManager {
    async fn send_ride_status_update(
        &self,
        cancel: &CancelToken,
        passenger_id: Uuid,
        update: RideStatusUpdate,
    ) -> AppResult<()> {
        let frame = WsMessage::with_data(RIDE_STATUS_UPDATE, &update)?.to_json()?;
        self.push(cancel, passenger_id, frame).await
    }

    async fn send_driver_location_update(
        &self,
        cancel: &CancelToken,
        passenger_id: Uuid,
        update: DriverLocationUpdate,
    ) -> AppResult<()> {
        let frame = WsMessage::with_data(DRIVER_LOCATION_UPDATE, &update)?.to_json()?;
        self.push(cancel, passenger_id, frame).await
    }
}
