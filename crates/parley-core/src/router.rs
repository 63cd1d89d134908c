//! Per-connection message router.
//!
//! One [`MessageRouter`] runs for each accepted connection. It owns that
//! connection's registry entry for as long as it lives and removes it when
//! dropped, whatever made the receive loop exit.
//!
//! For every decodable inbound frame the router:
//!
//! 1. fills in the message id and creation time if they are unset,
//! 2. delivers the message directly to the recipient's connection, or sends
//!    the sender an offline notice,
//! 3. publishes the message to the main log topic, whatever the delivery
//!    outcome was.

use std::fmt::Display;
use std::sync::Arc;

use chrono::Utc;
use futures::{Stream, StreamExt};
use opentelemetry::KeyValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::log::{LogError, LogProducer, OutboundRecord};
use crate::message::{CodecError, Message, UserId};
use crate::metrics;
use crate::registry::{ConnectionHandle, ConnectionRegistry, OutboundFrame, Registration, SendResult};

/// Errors raised while routing one frame. None of them end the connection.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Sender {0} has no live connection for the offline notice")]
    SenderNotConnected(UserId),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Publish(#[from] LogError),
}

/// A frame read from the client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
    Close,
}

/// State shared by every router in the process.
#[derive(Clone)]
pub struct RouterShared {
    pub registry: Arc<ConnectionRegistry>,
    pub producer: Arc<dyn LogProducer>,
    pub main_topic: String,
}

impl RouterShared {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        producer: Arc<dyn LogProducer>,
        main_topic: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            producer,
            main_topic: main_topic.into(),
        }
    }
}

/// Outcome of direct delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued on the recipient's connection
    Delivered,
    /// The recipient is not connected; `notified` tells whether the sender
    /// got the offline notice
    RecipientOffline { notified: bool },
    /// The recipient is connected but its channel refused the frame
    Failed(SendResult),
    /// The message could not be serialized into a text frame
    EncodeFailed,
}

impl Delivery {
    fn as_str(&self) -> &'static str {
        match self {
            Delivery::Delivered => "delivered",
            Delivery::RecipientOffline { .. } => "recipient_offline",
            Delivery::Failed(_) => "failed",
            Delivery::EncodeFailed => "encode_failed",
        }
    }
}

/// Result of handling one data frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// The payload did not decode; nothing was delivered or published
    Malformed,
    Routed {
        message: Message,
        delivery: Delivery,
        published: bool,
    },
}

/// Why a router's receive loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The client closed the transport
    TransportClosed,
    /// Reading from the transport failed
    TransportError,
    /// Process shutdown
    Cancelled,
}

/// Notice sent to a sender whose recipient is offline.
pub fn offline_notice(recipient: &UserId) -> String {
    format!("Recipient {recipient} is not online.")
}

/// Router for one connection.
pub struct MessageRouter {
    identity: UserId,
    handle: ConnectionHandle,
    shared: RouterShared,
    registered: bool,
}

impl MessageRouter {
    /// Register `handle` under `identity` and create the router that owns it.
    ///
    /// If the identity is already connected the existing entry is kept and
    /// this router runs unregistered: it can still send, but nobody can
    /// deliver to it.
    pub fn register(identity: UserId, handle: ConnectionHandle, shared: RouterShared) -> Self {
        let registered = shared.registry.register(identity, handle.clone()) == Registration::Registered;
        if registered {
            info!(user = %identity, "Connection registered");
            metrics::connections_active().record(shared.registry.connection_count() as i64, &[]);
        }

        Self {
            identity,
            handle,
            shared,
            registered,
        }
    }

    pub fn identity(&self) -> UserId {
        self.identity
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Run the receive loop until the transport ends or `cancel` fires.
    ///
    /// The registry entry is released when the router is dropped at the end
    /// of this call.
    #[instrument(skip_all, fields(user = %self.identity))]
    pub async fn run<S, E>(self, mut inbound: S, cancel: CancellationToken) -> ExitReason
    where
        S: Stream<Item = Result<InboundFrame, E>> + Unpin + Send,
        E: Display + Send,
    {
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = self.handle.try_send(OutboundFrame::Close);
                    return ExitReason::Cancelled;
                }
                frame = inbound.next() => frame,
            };

            match frame {
                None => {
                    debug!("Transport ended");
                    return ExitReason::TransportClosed;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Transport read failed");
                    return ExitReason::TransportError;
                }
                Some(Ok(InboundFrame::Text(text))) => {
                    self.handle_frame(text.as_bytes()).await;
                }
                Some(Ok(InboundFrame::Binary(data))) => {
                    self.handle_frame(&data).await;
                }
                Some(Ok(InboundFrame::Ping(data))) => {
                    let _ = self.handle.try_send(OutboundFrame::Pong(data));
                }
                Some(Ok(InboundFrame::Pong)) => {}
                Some(Ok(InboundFrame::Close)) => {
                    debug!("Client closed connection");
                    return ExitReason::TransportClosed;
                }
            }
        }
    }

    /// Decode, deliver and publish one data frame.
    pub async fn handle_frame(&self, payload: &[u8]) -> FrameOutcome {
        metrics::frames_received().add(1, &[]);

        let message = match Message::decode(payload) {
            Ok(message) => message.prepare_for_delivery(Utc::now()),
            Err(e) => {
                warn!(size = payload.len(), error = %e, "Dropping malformed frame");
                metrics::frames_malformed().add(1, &[]);
                return FrameOutcome::Malformed;
            }
        };

        let delivery = self.deliver(&message);
        metrics::messages_routed().add(1, &[KeyValue::new("delivery", delivery.as_str())]);

        let published = match self.publish(&message).await {
            Ok(()) => {
                metrics::log_publishes().add(1, &[KeyValue::new("result", "ok")]);
                true
            }
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to publish message");
                metrics::log_publishes().add(1, &[KeyValue::new("result", "error")]);
                false
            }
        };

        FrameOutcome::Routed {
            message,
            delivery,
            published,
        }
    }

    fn deliver(&self, message: &Message) -> Delivery {
        let registry = &self.shared.registry;

        if registry.lookup(&message.recipient_id).is_none() {
            let notified = match self.notify_offline(message) {
                Ok(()) => true,
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "Offline notice not sent");
                    false
                }
            };
            return Delivery::RecipientOffline { notified };
        }

        self.deliver_encoded(message, message.encode_text())
    }

    fn deliver_encoded(&self, message: &Message, encoded: Result<String, CodecError>) -> Delivery {
        let frame = match encoded {
            Ok(text) => OutboundFrame::Text(text),
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Failed to encode message");
                return Delivery::EncodeFailed;
            }
        };

        let registry = &self.shared.registry;
        match registry.send_to(&message.recipient_id, frame) {
            SendResult::Sent => {
                debug!(message_id = %message.id, to = %message.recipient_id, "Delivered");
                Delivery::Delivered
            }
            SendResult::NotConnected => {
                // The recipient left between lookup and send.
                Delivery::RecipientOffline {
                    notified: self.notify_offline(message).is_ok(),
                }
            }
            other => {
                warn!(message_id = %message.id, result = ?other, "Direct delivery failed");
                Delivery::Failed(other)
            }
        }
    }

    fn notify_offline(&self, message: &Message) -> Result<(), RouterError> {
        let notice = OutboundFrame::Text(offline_notice(&message.recipient_id));
        match self.shared.registry.send_to(&message.sender_id, notice) {
            SendResult::Sent => Ok(()),
            SendResult::NotConnected => Err(RouterError::SenderNotConnected(message.sender_id)),
            other => {
                warn!(to = %message.sender_id, result = ?other, "Offline notice dropped");
                Ok(())
            }
        }
    }

    async fn publish(&self, message: &Message) -> Result<(), RouterError> {
        let record = OutboundRecord::new(message.encode()?)
            .with_key(message.recipient_id.to_string().into_bytes());
        self.shared
            .producer
            .publish(&self.shared.main_topic, record)
            .await?;
        Ok(())
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        if self.registered
            && self
                .shared
                .registry
                .remove_if_owner(&self.identity, &self.handle)
        {
            info!(user = %self.identity, "Connection unregistered");
            metrics::connections_active()
                .record(self.shared.registry.connection_count() as i64, &[]);
        }
    }
}
