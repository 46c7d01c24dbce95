//! End-to-end calls against a server bound to a loopback TCP port.

use super::{
    config::ServerConfig,
    serve,
    service::{
        handler::CallScopeService,
        shapes::{FixedSequence, ResponseFactory},
    },
};
use callscope_core::{
    log_context::LogContext,
    proto::{CustomObject, Request, Response, call_scope_client::CallScopeClient},
    types::{DEFAULT_PAYLOAD, LOG_TRANSACTION_KEY, StreamShape, TRANSACTION_HEADER},
};
use core::time::Duration;
use futures::TryStreamExt;
use std::sync::{Arc, Mutex};
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Code, transport::Channel};

/// Answers like [`FixedSequence`] and records the logged transaction id seen
/// while building each response.
#[derive(Clone, Default)]
pub(crate) struct TransactionLog(Arc<Mutex<Vec<Option<String>>>>);

impl TransactionLog {
    pub(crate) fn seen(&self) -> Vec<Option<String>> {
        self.0.lock().unwrap().clone()
    }
}

impl ResponseFactory for TransactionLog {
    fn respond(
        &self,
        shape: StreamShape,
        request: Option<&Request>,
    ) -> callscope_core::Result<Response> {
        self.0
            .lock()
            .unwrap()
            .push(LogContext::get(LOG_TRANSACTION_KEY));
        FixedSequence.respond(shape, request)
    }
}

struct TestServer {
    client: CallScopeClient<Channel>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(CallScopeService::new(&ServerConfig::default())).await
    }

    async fn start_with(service: CallScopeService) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();

        let handle = tokio::spawn(serve(
            service,
            TcpListenerStream::new(listener),
            Duration::from_secs(1),
            async move {
                let _ = stopped.await;
            },
        ));

        let client = CallScopeClient::connect(format!("http://{addr}"))
            .await
            .unwrap();
        Self {
            client,
            stop,
            handle,
        }
    }

    async fn stop(self) {
        drop(self.client);
        self.stop.send(()).unwrap();
        self.handle.await.unwrap().unwrap();
    }
}

fn with_transaction<T>(message: T, txn: &'static str) -> tonic::Request<T> {
    let mut request = tonic::Request::new(message);
    request
        .metadata_mut()
        .insert(TRANSACTION_HEADER, txn.parse().unwrap());
    request
}

fn echoed<T>(response: &tonic::Response<T>) -> String {
    response
        .metadata()
        .get(TRANSACTION_HEADER)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

fn assert_payload(responses: &[Response]) {
    for response in responses {
        assert_eq!(response.value, DEFAULT_PAYLOAD.to_vec());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unary_returns_one_response_and_echoes_transaction() {
    let mut server = TestServer::start().await;

    let response = server
        .client
        .get_one(with_transaction(Request::default(), "X"))
        .await
        .unwrap();

    assert_eq!(echoed(&response), "X");
    assert_payload(&[response.into_inner()]);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_transaction_gets_fresh_distinct_ids() {
    let mut server = TestServer::start().await;

    let first = server.client.get_one(Request::default()).await.unwrap();
    let second = server.client.get_one(Request::default()).await.unwrap();

    let (first, second) = (echoed(&first), echoed(&second));
    assert_eq!(first.len(), 26);
    assert_ne!(first, second);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_stream_answers_once_after_completion() {
    let mut server = TestServer::start().await;
    let messages = vec![Request::default(); 4];

    let response = server
        .client
        .client_stream(with_transaction(tokio_stream::iter(messages), "cs-1"))
        .await
        .unwrap();

    assert_eq!(echoed(&response), "cs-1");
    assert_payload(&[response.into_inner()]);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_stream_sends_five_then_completes() {
    let mut server = TestServer::start().await;

    let responses: Vec<Response> = server
        .client
        .server_stream(Request::default())
        .await
        .unwrap()
        .into_inner()
        .try_collect()
        .await
        .unwrap();

    assert_eq!(responses.len(), 5);
    assert_payload(&responses);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bi_stream_sends_three_per_message() {
    let mut server = TestServer::start().await;
    let messages = vec![Request::default(); 2];

    let response = server
        .client
        .bi_stream(with_transaction(tokio_stream::iter(messages), "bidi"))
        .await
        .unwrap();
    assert_eq!(echoed(&response), "bidi");

    let responses: Vec<Response> = response.into_inner().try_collect().await.unwrap();
    assert_eq!(responses.len(), 6);
    assert_payload(&responses);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_object_is_rejected_without_affecting_other_calls() {
    let mut server = TestServer::start().await;
    let rejected = Request {
        custom_object: Some(CustomObject {
            name: "widget".to_string(),
            value: 7,
        }),
        ..Request::default()
    };

    let mut other = server.client.clone();
    let (failed, succeeded) = tokio::join!(
        server.client.get_one(rejected),
        other.get_one(Request::default()),
    );

    let status = failed.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
    assert_eq!(status.message(), "custom_object is not supported");
    assert_payload(&[succeeded.unwrap().into_inner()]);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn half_close_logs_the_call_transaction() {
    let log = TransactionLog::default();
    let service = CallScopeService::with_factory(&ServerConfig::default(), log.clone());
    let mut server = TestServer::start_with(service).await;
    let client = &mut server.client;

    let unary = client
        .get_one(with_transaction(Request::default(), "U-1"))
        .await
        .unwrap();
    let streamed = client
        .client_stream(with_transaction(
            tokio_stream::iter(vec![Request::default(); 2]),
            "C-1",
        ))
        .await
        .unwrap();
    let minted_unary = client.get_one(Request::default()).await.unwrap();
    let minted_streamed = client
        .client_stream(tokio_stream::iter(vec![Request::default(); 2]))
        .await
        .unwrap();

    let ids: Vec<_> = [&unary, &streamed, &minted_unary, &minted_streamed]
        .into_iter()
        .map(|response| Some(echoed(response)))
        .collect();
    assert_eq!(&ids[..2], &[Some("U-1".to_string()), Some("C-1".to_string())]);
    assert_eq!(log.seen(), ids);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bi_stream_inbound_failure_ends_with_error_status() {
    let log = TransactionLog::default();
    let service = CallScopeService::with_factory(&ServerConfig::default(), log.clone());
    let mut server = TestServer::start_with(service).await;
    // Larger than the 4 MiB the server decodes.
    let oversized = Request {
        string_value: "x".repeat(5 * 1024 * 1024),
        ..Request::default()
    };

    let mut bidi = server.client.clone();
    let failing = async move {
        let messages = tokio_stream::iter(vec![Request::default(), oversized]);
        let response = bidi.bi_stream(messages).await?;
        response
            .into_inner()
            .try_collect::<Vec<Response>>()
            .await
    };
    let healthy = server.client.client_stream(with_transaction(
        tokio_stream::iter(vec![Request::default(); 3]),
        "healthy",
    ));
    let (failed, succeeded) = tokio::join!(failing, healthy);

    let status = failed.unwrap_err();
    assert_eq!(status.code(), Code::OutOfRange);

    let succeeded = succeeded.unwrap();
    assert_eq!(echoed(&succeeded), "healthy");
    assert_payload(&[succeeded.into_inner()]);
    let logged: Vec<String> = log.seen().into_iter().flatten().collect();
    assert_eq!(logged, vec!["healthy".to_string()]);
    server.stop().await;
}
