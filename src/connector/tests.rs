use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tungstenite::protocol::Message as WsMessage;

use super::executor::{
    ConsumerExecutor, ErrorResponse, ExecutionError, FailureKind, HandlerError, QueueConsumer,
    RequestExecutor, RequestHandler, RetryOptions, run_with_retry,
};
use super::follower::{FollowKind, MessageFollower};
use super::mq_client::{ClientOptions, MqClient};
use crate::broker::message::{Message, MessageKind, ResultCode, content_types, headers};
use crate::broker::options::{AckScope, QueueOptions};
use crate::broker::{Broker, codec};
use crate::client::Client;
use crate::transport::dispatch::FrameAction;
use crate::transport::websocket::serve;
use crate::utils::error::ConnectorError;
use crate::utils::error::testing::RecordingSink;

fn connection() -> (Arc<Client>, UnboundedReceiver<WsMessage>) {
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
    (Arc::new(Client::new(tx)), rx)
}

fn sent(rx: &mut UnboundedReceiver<WsMessage>) -> Vec<Message> {
    let mut messages = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        if let WsMessage::Binary(data) = frame {
            messages.push(codec::decode(&data).unwrap());
        }
    }
    messages
}

async fn next_sent(rx: &mut UnboundedReceiver<WsMessage>) -> Message {
    loop {
        match rx.recv().await.expect("channel closed") {
            WsMessage::Binary(data) => return codec::decode(&data).unwrap(),
            _ => continue,
        }
    }
}

fn request(id: &str) -> Message {
    let mut msg = Message::queue_message("rpc", "question");
    msg.id = id.to_string();
    msg.source = Some("requester".to_string());
    msg.flags.response_required = true;
    msg
}

// follower

#[tokio::test]
async fn test_follower_resolves_acknowledge() {
    let follower = MessageFollower::new();
    let msg = request("m1");
    let pending = follower.follow_acknowledge(&msg, Duration::from_secs(5));
    assert!(follower.is_following(FollowKind::Acknowledge, "m1"));

    assert!(follower.process_acknowledge(&msg.create_acknowledge()));

    let ack = pending.wait().await.unwrap();
    assert_eq!(ack.id, "m1");
    assert!(follower.is_empty());
}

#[tokio::test]
async fn test_follower_kinds_are_independent() {
    let follower = MessageFollower::new();
    let msg = request("m1");
    let _pending = follower.follow_response(&msg, Duration::from_secs(5));

    assert!(!follower.process_acknowledge(&msg.create_acknowledge()));
    assert!(follower.is_following(FollowKind::Response, "m1"));
}

#[tokio::test]
async fn test_unmatched_frames_are_dropped() {
    let follower = MessageFollower::new();
    let msg = request("nobody-waits");
    assert!(!follower.process_response(&msg.create_response(ResultCode::Ok)));
}

#[tokio::test(start_paused = true)]
async fn test_follower_timeout_wins_over_late_reply() {
    let follower = MessageFollower::new();
    let msg = request("m1");
    let pending = follower.follow_response(&msg, Duration::from_millis(500));

    let result = pending.wait().await;
    assert!(matches!(result, Err(ConnectorError::ResponseTimeout(id)) if id == "m1"));
    assert!(follower.is_empty());
    assert!(!follower.process_response(&msg.create_response(ResultCode::Ok)));
}

#[tokio::test(start_paused = true)]
async fn test_reply_before_deadline_wins_over_timeout() {
    let follower = MessageFollower::new();
    let msg = request("m1");
    let pending = follower.follow_acknowledge(&msg, Duration::from_millis(500));

    tokio::time::advance(Duration::from_millis(499)).await;
    assert!(follower.process_acknowledge(&msg.create_acknowledge()));
    // a duplicate frame finds nothing to resolve
    assert!(!follower.process_acknowledge(&msg.create_acknowledge()));
    tokio::time::advance(Duration::from_millis(10)).await;

    assert_eq!(pending.wait().await.unwrap().id, "m1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reply_racing_deadline_resolves_exactly_once() {
    let follower = MessageFollower::new();
    let mut races = Vec::new();

    for n in 0..200u64 {
        let msg = request(&format!("m{n}"));
        let pending = follower.follow_response(&msg, Duration::from_millis(2));
        let replier = follower.clone();
        let reply = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(n % 4)).await;
            replier.process_response(&msg.create_response(ResultCode::Ok))
        });
        races.push((tokio::spawn(pending.wait()), reply));
    }

    for (wait, reply) in races {
        let outcome = wait.await.unwrap();
        let resolved = reply.await.unwrap();
        match outcome {
            Ok(_) => assert!(resolved, "reply delivered but not claimed"),
            Err(ConnectorError::ResponseTimeout(_)) => assert!(!resolved, "late reply was claimed"),
            Err(e) => panic!("unexpected outcome: {e}"),
        }
    }
    assert!(follower.is_empty());
}

#[tokio::test]
async fn test_fail_all_resolves_every_wait() {
    let follower = MessageFollower::new();
    let first = follower.follow_acknowledge(&request("a"), Duration::from_secs(5));
    let second = follower.follow_response(&request("b"), Duration::from_secs(5));

    assert_eq!(follower.fail_all(), 2);

    assert!(matches!(first.wait().await, Err(ConnectorError::Disconnected(_))));
    assert!(matches!(second.wait().await, Err(ConnectorError::Disconnected(_))));
}

#[tokio::test]
async fn test_dropping_pending_reply_cancels_it() {
    let follower = MessageFollower::new();
    let pending = follower.follow_acknowledge(&request("m1"), Duration::from_secs(5));
    drop(pending);
    assert!(follower.is_empty());
}

#[tokio::test]
async fn test_refollow_supersedes_previous_wait() {
    let follower = MessageFollower::new();
    let msg = request("m1");
    let first = follower.follow_acknowledge(&msg, Duration::from_secs(5));
    let second = follower.follow_acknowledge(&msg, Duration::from_secs(5));

    assert!(matches!(first.wait().await, Err(ConnectorError::Disconnected(_))));
    assert!(follower.is_following(FollowKind::Acknowledge, "m1"));
    assert!(follower.process_acknowledge(&msg.create_acknowledge()));
    assert!(second.wait().await.is_ok());
}

// retry

#[tokio::test]
async fn test_retry_stops_on_success() {
    let calls = &AtomicUsize::new(0);
    let retry = RetryOptions::new(5, Duration::ZERO);

    let result = run_with_retry(Some(&retry), move || async move {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n < 3 {
            Err(HandlerError::transient("not yet"))
        } else {
            Ok(n)
        }
    })
    .await;

    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_ignored_failure_is_raised_immediately() {
    let calls = &AtomicUsize::new(0);
    let retry = RetryOptions::new(5, Duration::ZERO).ignoring(FailureKind::Validation);

    let result: Result<(), _> = run_with_retry(Some(&retry), move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::new(FailureKind::Validation, "bad input"))
    })
    .await;

    assert!(matches!(result, Err(ExecutionError::Handler(e)) if e.kind == FailureKind::Validation));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_zero_count_means_one_hundred_attempts() {
    let calls = &AtomicUsize::new(0);
    let retry = RetryOptions::new(0, Duration::ZERO);

    let result: Result<(), _> = run_with_retry(Some(&retry), move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::transient("down"))
    })
    .await;

    assert!(matches!(result, Err(ExecutionError::RetryExhausted { attempts: 100, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 100);
}

#[tokio::test]
async fn test_without_retry_runs_once() {
    let calls = &AtomicUsize::new(0);
    let result: Result<(), _> = run_with_retry(None, move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::transient("down"))
    })
    .await;

    assert!(matches!(result, Err(ExecutionError::Handler(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_between_attempts() {
    let retry = RetryOptions::new(3, Duration::from_millis(100));
    let started = tokio::time::Instant::now();

    let result: Result<(), _> =
        run_with_retry(Some(&retry), || async { Err(HandlerError::transient("down")) }).await;

    assert!(result.is_err());
    // no sleep after the last attempt
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(300));
}

// request executor

struct FailingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl RequestHandler for FailingHandler {
    async fn handle(&self, _request: &Message) -> Result<Option<Bytes>, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::transient("always fails"))
    }
}

struct EchoHandler {
    after_reply_fails: bool,
}

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, request: &Message) -> Result<Option<Bytes>, HandlerError> {
        if request.is_empty() {
            Ok(None)
        } else {
            Ok(Some(request.payload.clone()))
        }
    }

    async fn after_reply(&self, _request: &Message) -> Result<(), HandlerError> {
        if self.after_reply_fails {
            Err(HandlerError::new(FailureKind::Internal, "audit log unavailable"))
        } else {
            Ok(())
        }
    }
}

struct PoliteHandler;

#[async_trait]
impl RequestHandler for PoliteHandler {
    async fn handle(&self, _request: &Message) -> Result<Option<Bytes>, HandlerError> {
        Err(HandlerError::new(FailureKind::NotFound, "no such order"))
    }

    async fn on_error(&self, error: &ExecutionError, _request: &Message) -> ErrorResponse {
        ErrorResponse {
            code: ResultCode::Ok,
            reason: Some(error.handler_error().message.clone()),
        }
    }
}

#[tokio::test]
async fn test_exhausted_retry_sends_one_error_response() {
    let (conn, mut rx) = connection();
    let errors = Arc::new(RecordingSink::default());
    let executor = RequestExecutor::new(FailingHandler {
        calls: AtomicUsize::new(0),
    })
    .with_retry(RetryOptions::new(3, Duration::ZERO))
    .with_error_sink(errors.clone());

    let result = executor.execute(conn.as_ref(), &request("r1")).await;

    assert!(matches!(result, Err(ExecutionError::RetryExhausted { attempts: 3, .. })));
    assert_eq!(executor.handler().calls.load(Ordering::SeqCst), 3);
    let replies = sent(&mut rx);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].kind, MessageKind::Response);
    assert_eq!(replies[0].code, ResultCode::InternalServerError);
    assert_eq!(replies[0].content_str(), Some("always fails"));
    assert_eq!(replies[0].id, "r1");
    assert_eq!(replies[0].target, "requester");
    assert_eq!(errors.operations(), vec!["REQUEST"]);
}

#[tokio::test]
async fn test_successful_request_gets_payload_or_no_content() {
    let (conn, mut rx) = connection();
    let executor = RequestExecutor::new(EchoHandler {
        after_reply_fails: false,
    });

    executor.execute(conn.as_ref(), &request("r1")).await.unwrap();
    let mut empty = request("r2");
    empty.payload = Bytes::new();
    executor.execute(conn.as_ref(), &empty).await.unwrap();

    let replies = sent(&mut rx);
    assert_eq!(replies[0].code, ResultCode::Ok);
    assert_eq!(replies[0].content_str(), Some("question"));
    assert_eq!(replies[1].code, ResultCode::NoContent);
}

#[tokio::test]
async fn test_error_after_reply_goes_to_sink() {
    let (conn, mut rx) = connection();
    let errors = Arc::new(RecordingSink::default());
    let executor = RequestExecutor::new(EchoHandler {
        after_reply_fails: true,
    })
    .with_error_sink(errors.clone());

    assert!(executor.execute(conn.as_ref(), &request("r1")).await.is_ok());

    let replies = sent(&mut rx);
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].code, ResultCode::Ok);
    assert_eq!(errors.operations(), vec!["AFTER_REPLY"]);
}

#[tokio::test]
async fn test_error_response_never_reports_success() {
    let (conn, mut rx) = connection();
    let executor = RequestExecutor::new(PoliteHandler);

    assert!(executor.execute(conn.as_ref(), &request("r1")).await.is_err());

    let reply = sent(&mut rx).pop().unwrap();
    assert_eq!(reply.code, ResultCode::Failed);
    assert_eq!(reply.content_str(), Some("no such order"));
}

#[tokio::test]
async fn test_reply_send_failure_is_reported_once() {
    let (conn, rx) = connection();
    drop(rx);
    let errors = Arc::new(RecordingSink::default());
    let executor = RequestExecutor::new(EchoHandler {
        after_reply_fails: false,
    })
    .with_error_sink(errors.clone());

    assert!(executor.execute(conn.as_ref(), &request("r1")).await.is_ok());
    assert_eq!(errors.operations(), vec!["REPLY"]);
}

// consumer executor

struct FlakyConsumer {
    failures_left: AtomicUsize,
}

#[async_trait]
impl QueueConsumer for FlakyConsumer {
    async fn consume(&self, _message: &Message) -> Result<(), HandlerError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(HandlerError::transient("database busy"));
        }
        Ok(())
    }
}

fn delivery(id: &str) -> Message {
    let mut msg = Message::queue_message("jobs", "work");
    msg.id = id.to_string();
    msg.flags.acknowledge_required = true;
    msg
}

#[tokio::test]
async fn test_consumer_success_is_acknowledged() {
    let (conn, mut rx) = connection();
    let executor = ConsumerExecutor::new(FlakyConsumer {
        failures_left: AtomicUsize::new(2),
    })
    .with_retry(RetryOptions::new(3, Duration::ZERO));

    executor.execute(conn.as_ref(), &delivery("m1")).await.unwrap();

    let ack = sent(&mut rx).pop().unwrap();
    assert_eq!(ack.kind, MessageKind::Acknowledge);
    assert_eq!(ack.id, "m1");
    assert_eq!(ack.target, "jobs");
    assert!(!ack.is_negative());
}

#[tokio::test]
async fn test_consumer_failure_is_negatively_acknowledged() {
    let (conn, mut rx) = connection();
    let errors = Arc::new(RecordingSink::default());
    let executor = ConsumerExecutor::new(FlakyConsumer {
        failures_left: AtomicUsize::new(10),
    })
    .with_retry(RetryOptions::new(2, Duration::ZERO))
    .with_error_sink(errors.clone());

    let result = executor.execute(conn.as_ref(), &delivery("m1")).await;

    assert!(matches!(result, Err(ExecutionError::RetryExhausted { attempts: 2, .. })));
    let nack = sent(&mut rx).pop().unwrap();
    assert!(nack.is_negative());
    assert_eq!(
        nack.find_header(headers::NEGATIVE_ACKNOWLEDGE_REASON),
        Some("database busy")
    );
    assert_eq!(errors.operations(), vec!["CONSUME"]);
    assert_eq!(executor.consumer().failures_left.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn test_consumer_without_ack_request_sends_nothing() {
    let (conn, mut rx) = connection();
    let executor = ConsumerExecutor::new(FlakyConsumer {
        failures_left: AtomicUsize::new(0),
    });
    let mut msg = delivery("m1");
    msg.flags.acknowledge_required = false;

    executor.execute(conn.as_ref(), &msg).await.unwrap();
    assert!(sent(&mut rx).is_empty());
}

// client

fn mq_client(options: ClientOptions) -> (Arc<MqClient>, UnboundedReceiver<Message>, UnboundedReceiver<WsMessage>) {
    let (conn, outbound) = connection();
    let (client, incoming) = MqClient::with_connection(options, conn);
    (Arc::new(client), incoming, outbound)
}

#[tokio::test]
async fn test_accepted_frame_sets_client_id() {
    let (client, _incoming, _outbound) = mq_client(ClientOptions::default());
    assert_eq!(client.id(), None);

    client.handle_frame(Message::server(content_types::ACCEPTED, "client-7"));

    assert_eq!(client.id().as_deref(), Some("client-7"));
    assert_eq!(
        client.wait_accepted(Duration::from_millis(10)).await.unwrap(),
        "client-7"
    );
}

#[tokio::test]
async fn test_ping_answered_and_terminate_disconnects() {
    let (client, _incoming, mut outbound) = mq_client(ClientOptions::default());

    assert_eq!(client.handle_frame(Message::ping()), FrameAction::Continue);
    assert_eq!(sent(&mut outbound).pop().unwrap().kind, MessageKind::Pong);

    let action = client.handle_frame(Message::new(MessageKind::Terminate, ""));
    assert_eq!(action, FrameAction::Disconnect);
    assert!(!client.is_connected());
    assert!(matches!(outbound.try_recv(), Ok(WsMessage::Close(_))));
    assert!(matches!(client.ping(), Err(ConnectorError::NotConnected)));
}

#[tokio::test]
async fn test_auto_acknowledge_acks_deliveries() {
    let options = ClientOptions {
        auto_acknowledge: true,
        ..ClientOptions::default()
    };
    let (client, mut incoming, mut outbound) = mq_client(options);

    client.handle_frame(delivery("m1"));

    let ack = sent(&mut outbound).pop().unwrap();
    assert_eq!(ack.kind, MessageKind::Acknowledge);
    assert_eq!(ack.id, "m1");
    assert_eq!(incoming.try_recv().unwrap().id, "m1");
}

#[tokio::test]
async fn test_send_with_acknowledge_resolves_on_ack() {
    let (client, _incoming, mut outbound) = mq_client(ClientOptions::default());

    let task = {
        let client = client.clone();
        tokio::spawn(async move { client.push("jobs", "work", true).await })
    };

    let pushed = next_sent(&mut outbound).await;
    assert!(pushed.flags.acknowledge_required);
    assert!(!pushed.id.is_empty());
    client.handle_frame(pushed.create_acknowledge());

    task.await.unwrap().unwrap();
    assert!(client.follower().is_empty());
}

#[tokio::test]
async fn test_negative_acknowledge_is_rejected() {
    let (client, _incoming, mut outbound) = mq_client(ClientOptions::default());

    let task = {
        let client = client.clone();
        tokio::spawn(async move { client.push("jobs", "work", true).await })
    };

    let pushed = next_sent(&mut outbound).await;
    client.handle_frame(pushed.create_negative_acknowledge("queue is full"));

    let result = task.await.unwrap();
    assert!(matches!(
        result,
        Err(ConnectorError::Rejected { code: ResultCode::Failed, reason, .. }) if reason == "queue is full"
    ));
}

#[tokio::test]
async fn test_uncaught_acknowledges_go_to_application() {
    let (client, mut incoming, _outbound) = mq_client(ClientOptions::default());
    client.set_catch_acknowledges(false);
    let msg = delivery("m1");
    let _pending = client
        .follower()
        .follow_acknowledge(&msg, Duration::from_secs(5));

    client.handle_frame(msg.create_acknowledge());

    assert_eq!(incoming.try_recv().unwrap().kind, MessageKind::Acknowledge);
    assert!(client.follower().is_following(FollowKind::Acknowledge, "m1"));
}

#[tokio::test(start_paused = true)]
async fn test_request_times_out() {
    let options = ClientOptions {
        response_timeout: Duration::from_millis(300),
        ..ClientOptions::default()
    };
    let (client, _incoming, _outbound) = mq_client(options);

    let result = client.request(Message::queue_message("rpc", "question")).await;

    assert!(matches!(result, Err(ConnectorError::ResponseTimeout(_))));
    assert!(client.follower().is_empty());
}

#[tokio::test]
async fn test_disconnect_fails_pending_calls() {
    let (client, _incoming, mut outbound) = mq_client(ClientOptions::default());

    let task = {
        let client = client.clone();
        tokio::spawn(async move { client.request(Message::queue_message("rpc", "q")).await })
    };
    next_sent(&mut outbound).await;
    client.disconnect();

    assert!(matches!(
        task.await.unwrap(),
        Err(ConnectorError::Disconnected(_))
    ));
}

// end to end

async fn start_server() -> (String, Arc<Broker>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let broker = Arc::new(Broker::new());
    tokio::spawn(serve(listener, broker.clone()));
    (url, broker)
}

#[tokio::test]
async fn test_client_round_trip_through_server() {
    let (url, broker) = start_server().await;
    let options = ClientOptions {
        name: Some("worker".to_string()),
        response_timeout: Duration::from_secs(5),
        acknowledge_timeout: Duration::from_secs(5),
        ..ClientOptions::default()
    };
    let (consumer, mut deliveries) = MqClient::connect(&url, options.clone()).await.unwrap();
    let (producer, _) = MqClient::connect(&url, options).await.unwrap();
    assert!(consumer.id().is_some());

    let queue_options = QueueOptions {
        acknowledge: AckScope::FirstAcquirer,
        ..QueueOptions::default()
    };
    producer.create_queue("jobs", Some(&queue_options)).await.unwrap();
    assert!(matches!(
        producer.create_queue("jobs", None).await,
        Err(ConnectorError::Rejected { code: ResultCode::Duplicate, .. })
    ));
    consumer.subscribe("jobs").await.unwrap();

    producer.push("jobs", "work", true).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(5), deliveries.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered.content_str(), Some("work"));
    assert!(delivered.flags.acknowledge_required);
    consumer.acknowledge(&delivered).unwrap();

    let queue = broker.find_queue("jobs").unwrap();
    for _ in 0..50 {
        if queue.delivery().in_flight() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(queue.delivery().in_flight(), 0);

    producer.disconnect();
    consumer.disconnect();
}
