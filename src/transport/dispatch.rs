//! Server-side frame dispatch
//!
//! Translates one decoded frame from a connected client into broker calls.
//! Runs on the connection's reader task and never waits: every reply is a
//! non-blocking hand-off to the client's send channel.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::broker::message::{Message, MessageKind, ResultCode, content_types, headers};
use crate::broker::options::{QueueOptions, QueueStatus};
use crate::broker::queue::{PushResult, SubscriptionResult};
use crate::broker::{Broker, codec};
use crate::client::Client;
use crate::transport::Connection;
use crate::utils::error::{BrokerError, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    Continue,
    Disconnect,
}

/// Body of a clear-messages request. Both sequences are cleared by default.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClearRequest {
    pub priority: bool,
    pub normal: bool,
}

impl Default for ClearRequest {
    fn default() -> Self {
        Self {
            priority: true,
            normal: true,
        }
    }
}

pub fn handle_frame(broker: &Broker, client: &Arc<Client>, mut message: Message) -> FrameAction {
    message.source = Some(client.id.clone());

    match message.kind {
        MessageKind::Ping => {
            reply(broker, client, &Message::pong());
        }
        MessageKind::Pong => {}
        MessageKind::Terminate => {
            debug!(client = %client.id, "terminate requested");
            return FrameAction::Disconnect;
        }
        MessageKind::Acknowledge => {
            broker.acknowledge(&message, &client.id);
        }
        MessageKind::Response => {
            broker.forward_response(&message);
        }
        MessageKind::QueueMessage => handle_push(broker, client, message),
        MessageKind::Router => {
            let sender: Arc<dyn Connection> = client.clone();
            if !broker.route(&message, Some(sender)) && message.flags.acknowledge_required {
                let mut nack = message.create_negative_acknowledge("no binding accepted the message");
                nack.code = ResultCode::NotFound;
                reply(broker, client, &nack);
            }
        }
        MessageKind::Server => handle_server(broker, client, message),
    }
    FrameAction::Continue
}

fn handle_push(broker: &Broker, client: &Arc<Client>, message: Message) {
    let wants_ack = message.flags.acknowledge_required;
    let producer: Arc<dyn Connection> = client.clone();
    let rejected = match broker.push(message.clone(), Some(producer)) {
        Ok(PushResult::Success) => None,
        Ok(result) => Some((result.code(), format!("{result:?}"))),
        Err(e) => Some((code_of(&e), e.to_string())),
    };

    if let Some((code, reason)) = rejected {
        debug!(client = %client.id, queue = %message.target, ?code, "push rejected");
        if wants_ack {
            let mut nack = message.create_negative_acknowledge(&reason);
            nack.code = code;
            reply(broker, client, &nack);
        }
    }
}

fn handle_server(broker: &Broker, client: &Arc<Client>, message: Message) {
    let queue = message.target.as_str();
    let (code, body) = match message.content_type {
        content_types::HELLO => {
            if let Some(name) = message.find_header(headers::CLIENT_NAME) {
                client.set_name(name);
            }
            info!(client = %client.id, name = ?client.name(), "hello");
            (ResultCode::Ok, None)
        }
        content_types::SUBSCRIBE => match broker.subscribe(queue, client.clone()) {
            Ok(result) => {
                if result == SubscriptionResult::Success {
                    client.add_subscription(queue);
                }
                (result.code(), None)
            }
            Err(e) => (code_of(&e), None),
        },
        content_types::UNSUBSCRIBE => {
            client.remove_subscription(queue);
            if broker.unsubscribe(queue, &client.id) {
                (ResultCode::Ok, None)
            } else {
                (ResultCode::NotFound, None)
            }
        }
        content_types::CREATE_QUEUE => match parse_options(&message) {
            Ok(options) => match broker.create_queue(queue, options) {
                Ok(_) => (ResultCode::Ok, None),
                Err(e) => (code_of(&e), None),
            },
            Err(code) => (code, None),
        },
        content_types::UPDATE_QUEUE => match broker.find_queue(queue) {
            None => (ResultCode::NotFound, None),
            Some(q) => match parse_options(&message) {
                Ok(Some(options)) => {
                    q.set_options(options);
                    (ResultCode::Ok, None)
                }
                Ok(None) => (ResultCode::BadRequest, None),
                Err(code) => (code, None),
            },
        },
        content_types::QUEUE_STATUS => match broker.find_queue(queue) {
            Some(q) => match serde_json::from_slice::<QueueStatus>(&message.payload) {
                Ok(status) => {
                    q.set_status(status);
                    (ResultCode::Ok, None)
                }
                Err(_) => (ResultCode::BadRequest, None),
            },
            None => (ResultCode::NotFound, None),
        },
        content_types::REMOVE_QUEUE => match broker.delete_queue(queue) {
            Ok(()) => (ResultCode::Ok, None),
            Err(e) => (code_of(&e), None),
        },
        content_types::CLEAR_MESSAGES => match broker.find_queue(queue) {
            Some(q) => {
                let request = if message.is_empty() {
                    Ok(ClearRequest::default())
                } else {
                    serde_json::from_slice::<ClearRequest>(&message.payload)
                };
                match request {
                    Ok(request) => {
                        q.clear_messages(request.priority, request.normal);
                        (ResultCode::Ok, None)
                    }
                    Err(_) => (ResultCode::BadRequest, None),
                }
            }
            None => (ResultCode::NotFound, None),
        },
        content_types::QUEUE_LIST => match serde_json::to_vec(&broker.list_queues()) {
            Ok(body) => (ResultCode::Ok, Some(body)),
            Err(e) => {
                warn!(client = %client.id, %e, "failed to encode queue list");
                (ResultCode::InternalServerError, None)
            }
        },
        other => {
            debug!(client = %client.id, content_type = other, "unsupported server frame");
            (ResultCode::BadRequest, None)
        }
    };

    if message.flags.response_required {
        let mut response = message.create_response(code);
        if let Some(body) = body {
            response.payload = body.into();
        }
        reply(broker, client, &response);
    }
}

/// Empty payload means "use the broker defaults".
fn parse_options(message: &Message) -> Result<Option<QueueOptions>, ResultCode> {
    if message.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(&message.payload)
        .map(Some)
        .map_err(|_| ResultCode::BadRequest)
}

fn code_of(error: &BrokerError) -> ResultCode {
    match error {
        BrokerError::QueueExists(_) => ResultCode::Duplicate,
        BrokerError::QueueNotFound(_) => ResultCode::NotFound,
        BrokerError::InvalidQueueName(_) => ResultCode::BadRequest,
        BrokerError::Persistence(_) | BrokerError::Codec(_) => ResultCode::InternalServerError,
    }
}

fn reply(broker: &Broker, client: &Client, message: &Message) {
    let result = codec::encode(message)
        .map_err(TransportError::from)
        .and_then(|frame| client.send(frame));
    if let Err(e) = result {
        broker
            .errors()
            .report("REPLY", &format!("client={}", client.id), &e);
    }
}
