// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT 3.1.1 broker client.
//!
//! Each [`MqttBroker::connect`] opens a fresh TCP (or TLS) connection,
//! performs the CONNECT / CONNACK handshake and spawns two tasks:
//!
//! - reader: completes pending PUBACK / SUBACK waiters, forwards inbound
//!   PUBLISH packets to the inbox and acknowledges QoS 1 deliveries after
//!   they are handed off
//! - keep-alive: sends PINGREQ every `keep_alive_secs` and closes the link
//!   if the previous ping was never answered
//!
//! Publishes go out at QoS 1 and resolve on PUBACK.

pub mod codec;
#[cfg(feature = "tls")]
pub mod tls;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use self::codec::{Packet, Publish};
use super::{Broker, BrokerError, BrokerLink, ConnectOptions, LinkStatus, Message};
use crate::config::BrokerConfig;

/// Packet ids held by requests still waiting for their ack.
const MAX_IN_FLIGHT: usize = u16::MAX as usize - 1;

/// Byte stream the client can run over (plain TCP or TLS).
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type BoxedStream = Box<dyn AsyncStream>;

/// Connects to an MQTT 3.1.1 broker.
pub struct MqttBroker {
    config: BrokerConfig,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsConnector>,
}

impl MqttBroker {
    /// Build a client for `config`. TLS material is loaded here so bad
    /// certificate paths fail at startup.
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        #[cfg(feature = "tls")]
        let tls = match &config.tls {
            Some(tls_config) => Some(tls::connector(tls_config)?),
            None => None,
        };

        #[cfg(not(feature = "tls"))]
        {
            if config.tls.is_some() {
                return Err(BrokerError::Config(
                    "TLS configured but fleetwire-core was built without the `tls` feature"
                        .to_string(),
                ));
            }
        }

        Ok(Self {
            config,
            #[cfg(feature = "tls")]
            tls,
        })
    }

    async fn open_stream(&self) -> Result<BoxedStream, BrokerError> {
        let addr = (self.config.host.as_str(), self.config.port);
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| BrokerError::Refused(format!("{}:{}: {}", addr.0, addr.1, e)))?;
        tcp.set_nodelay(true)?;

        #[cfg(feature = "tls")]
        {
            if let Some(connector) = &self.tls {
                let stream = tls::handshake(connector, &self.config.host, tcp).await?;
                return Ok(Box::new(stream));
            }
        }

        Ok(Box::new(tcp))
    }

    async fn handshake(
        &self,
        options: &ConnectOptions,
    ) -> Result<(ReadHalf<BoxedStream>, WriteHalf<BoxedStream>), BrokerError> {
        let stream = self.open_stream().await?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        writer
            .write_all(&Packet::Connect(options.clone()).encode()?)
            .await?;
        writer.flush().await?;

        match codec::read_packet(&mut reader).await? {
            Packet::ConnAck { code: 0, session_present } => {
                tracing::debug!(
                    "mqtt: {} connected to {}:{} (session_present={})",
                    options.client_id,
                    self.config.host,
                    self.config.port,
                    session_present
                );
                Ok((reader, writer))
            }
            Packet::ConnAck { code, .. } => Err(BrokerError::Refused(codec::connack_reason(code))),
            other => Err(BrokerError::Protocol(format!(
                "expected CONNACK, got {}",
                other.name()
            ))),
        }
    }

    async fn open_link(
        &self,
        options: &ConnectOptions,
        inbox: mpsc::Sender<Message>,
    ) -> Result<MqttLink, BrokerError> {
        let connect_timeout = self.config.connect_timeout();
        let (reader, writer) = tokio::time::timeout(connect_timeout, self.handshake(options))
            .await
            .map_err(|_| {
                BrokerError::Timeout(format!(
                    "no CONNACK from {}:{} within {:?}",
                    self.config.host, self.config.port, connect_timeout
                ))
            })??;

        let shared = Arc::new(LinkShared {
            client_id: options.client_id.clone(),
            writer: tokio::sync::Mutex::new(writer),
            waiters: Mutex::new(HashMap::new()),
            next_packet_id: AtomicU16::new(1),
            awaiting_pong: AtomicBool::new(false),
            status: LinkStatus::new(),
        });

        tokio::spawn(read_loop(reader, Arc::clone(&shared), inbox));
        if options.keep_alive_secs > 0 {
            tokio::spawn(keep_alive_loop(
                Arc::clone(&shared),
                Duration::from_secs(u64::from(options.keep_alive_secs)),
            ));
        }

        Ok(MqttLink { shared })
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn connect(
        &self,
        options: &ConnectOptions,
        inbox: mpsc::Sender<Message>,
    ) -> Result<Arc<dyn BrokerLink>, BrokerError> {
        Ok(Arc::new(self.open_link(options, inbox).await?))
    }
}

enum Ack {
    Published,
    Subscribed(Vec<u8>),
}

struct LinkShared {
    client_id: String,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    waiters: Mutex<HashMap<u16, oneshot::Sender<Ack>>>,
    next_packet_id: AtomicU16,
    awaiting_pong: AtomicBool,
    status: LinkStatus,
}

impl LinkShared {
    fn waiters(&self) -> MutexGuard<'_, HashMap<u16, oneshot::Sender<Ack>>> {
        match self.waiters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Next non-zero packet id with a waiter slot registered for it.
    fn register(&self) -> Result<(u16, oneshot::Receiver<Ack>), BrokerError> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters();
        if waiters.len() >= MAX_IN_FLIGHT {
            return Err(BrokerError::Protocol(format!(
                "{} requests already awaiting an ack",
                waiters.len()
            )));
        }
        loop {
            let id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !waiters.contains_key(&id) {
                waiters.insert(id, tx);
                return Ok((id, rx));
            }
        }
    }

    fn complete(&self, packet_id: u16, ack: Ack) {
        if let Some(tx) = self.waiters().remove(&packet_id) {
            let _ = tx.send(ack);
        }
    }

    fn forget(&self, packet_id: u16) {
        self.waiters().remove(&packet_id);
    }

    async fn send(&self, packet: &Packet) -> Result<(), BrokerError> {
        if let Some(reason) = self.status.error() {
            return Err(reason);
        }
        let bytes = packet.encode()?;
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            let reason = BrokerError::Io(e.to_string());
            self.status.close(reason.clone());
            return Err(reason);
        }
        Ok(())
    }

    /// Send a packet and wait for the matching ack. The waiter is released
    /// however the call ends, including when the future is dropped.
    async fn request(&self, id: u16, rx: oneshot::Receiver<Ack>, packet: Packet) -> Result<Ack, BrokerError> {
        let mut waiter = WaiterGuard {
            shared: self,
            id,
            armed: true,
        };
        self.send(&packet).await?;
        tokio::select! {
            ack = rx => {
                let ack = ack.map_err(|_| {
                    self.status
                        .error()
                        .unwrap_or_else(|| BrokerError::ConnectionLost("link closed".to_string()))
                })?;
                // complete() already removed the slot; the id may be reused
                waiter.armed = false;
                Ok(ack)
            }
            reason = self.status.closed() => Err(reason),
        }
    }
}

struct WaiterGuard<'a> {
    shared: &'a LinkShared,
    id: u16,
    armed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.forget(self.id);
        }
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxedStream>,
    shared: Arc<LinkShared>,
    inbox: mpsc::Sender<Message>,
) {
    let reason = loop {
        let packet = tokio::select! {
            reason = shared.status.closed() => break reason,
            packet = codec::read_packet(&mut reader) => packet,
        };
        match packet {
            Ok(Packet::PubAck { packet_id }) => shared.complete(packet_id, Ack::Published),
            Ok(Packet::SubAck { packet_id, codes }) => {
                shared.complete(packet_id, Ack::Subscribed(codes))
            }
            Ok(Packet::PingResp) => shared.awaiting_pong.store(false, Ordering::Relaxed),
            Ok(Packet::Publish(Publish {
                topic,
                payload,
                packet_id,
                ..
            })) => {
                if inbox.send(Message { topic, payload }).await.is_err() {
                    break BrokerError::ConnectionLost("inbox closed".to_string());
                }
                if let Some(packet_id) = packet_id {
                    if let Err(e) = shared.send(&Packet::PubAck { packet_id }).await {
                        break e;
                    }
                }
            }
            Ok(other) => {
                break BrokerError::Protocol(format!("unexpected {} from broker", other.name()))
            }
            Err(e) => break e,
        }
    };

    tracing::debug!("mqtt: link for {} closed: {}", shared.client_id, reason);
    shared.status.close(reason);
    // Dropping the senders wakes every waiter with an error
    shared.waiters().clear();
}

async fn keep_alive_loop(shared: Arc<LinkShared>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shared.status.closed() => return,
            _ = ticker.tick() => {}
        }
        if shared.awaiting_pong.swap(true, Ordering::Relaxed) {
            shared
                .status
                .close(BrokerError::Timeout("keep-alive ping unanswered".to_string()));
            return;
        }
        if shared.send(&Packet::PingReq).await.is_err() {
            return;
        }
    }
}

struct MqttLink {
    shared: Arc<LinkShared>,
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let (id, rx) = self.shared.register()?;
        let packet = Packet::Publish(Publish {
            topic: topic.to_string(),
            qos: 1,
            packet_id: Some(id),
            dup: false,
            retain: false,
            payload: payload.to_vec(),
        });
        match self.shared.request(id, rx, packet).await? {
            Ack::Published => Ok(()),
            Ack::Subscribed(_) => Err(BrokerError::Protocol(format!(
                "SUBACK received for publish {}",
                id
            ))),
        }
    }

    async fn subscribe(&self, filter: &str) -> Result<(), BrokerError> {
        let (id, rx) = self.shared.register()?;
        let packet = Packet::Subscribe {
            packet_id: id,
            filters: vec![(filter.to_string(), 1)],
        };
        match self.shared.request(id, rx, packet).await? {
            Ack::Subscribed(codes) if codes.first().is_some_and(|c| *c != codec::SUBACK_FAILURE) => {
                Ok(())
            }
            Ack::Subscribed(_) => Err(BrokerError::Refused(format!(
                "subscription to {} rejected",
                filter
            ))),
            Ack::Published => Err(BrokerError::Protocol(format!(
                "PUBACK received for subscribe {}",
                id
            ))),
        }
    }

    async fn closed(&self) -> BrokerError {
        self.shared.status.closed().await
    }

    async fn disconnect(&self) {
        let _ = self.shared.send(&Packet::Disconnect).await;
        let _ = self.shared.writer.lock().await.shutdown().await;
        self.shared
            .status
            .close(BrokerError::ConnectionLost("disconnected by client".to_string()));
    }
}
