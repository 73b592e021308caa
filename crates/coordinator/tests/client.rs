//! Client behaviour against a scripted controller

use parking_lot::Mutex;
use proven_channel::Channel;
use proven_common::{
    BytesAttachment, Envelope, MessageHandler, MessageSeverity, OperationId, OperationOutcome,
    OperationResponse,
};
use proven_coordinator::{
    ClientConfig, ClientError, ManagementClient, OperationListener, PreparedTransaction,
    execute_blocking,
};
use proven_protocol::{
    Connection, Decision, ManagementRequest, ManagementResponse, RemoteAttachment, RequestContext,
    RequestHandler,
};
use serde_json::json;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone, Copy, PartialEq)]
enum Script {
    /// Answer Execute with Prepared, Complete with Completed
    Prepare,
    /// Answer Execute with Failed
    Fail,
    /// Answer Execute with Prepared and never answer Complete
    PrepareThenHang,
    /// Never answer Execute
    Silent,
}

struct ScriptedController {
    script: Script,
    requests: mpsc::UnboundedSender<(OperationId, ManagementRequest)>,
}

impl RequestHandler for ScriptedController {
    fn handle_request(&self, ctx: RequestContext, request: ManagementRequest) {
        let _ = self.requests.send((ctx.op_id(), request.clone()));
        match (self.script, request) {
            (Script::Silent, ManagementRequest::Execute(_)) => {}
            (Script::Fail, ManagementRequest::Execute(_)) => {
                let _ = ctx.send(ManagementResponse::Failed {
                    result: OperationOutcome::failed("DuplicateResourceError: already exists"),
                });
            }
            (_, ManagementRequest::Execute(execute)) => {
                let _ = ctx.send(ManagementResponse::Prepared {
                    result: OperationOutcome::success(execute.operation),
                });
            }
            (Script::Prepare, ManagementRequest::Complete { decision }) => {
                let result = match decision {
                    Decision::Commit => OperationOutcome::success(json!("committed")),
                    Decision::Rollback => OperationOutcome::rolled_back("rolled back"),
                };
                let _ = ctx.send(ManagementResponse::Completed {
                    result,
                    stream_count: 0,
                });
            }
            (_, ManagementRequest::CancelAsync) => {
                let _ = ctx.send(ManagementResponse::RequestEnd);
            }
            _ => {}
        }
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    transaction: Mutex<Option<PreparedTransaction>>,
    commit_on_prepare: bool,
}

impl OperationListener for Recorder {
    fn operation_prepared(&self, transaction: PreparedTransaction, result: OperationOutcome) {
        self.events.lock().push(format!("prepared {}", result.to_document()));
        if self.commit_on_prepare {
            transaction.commit().unwrap();
        }
        *self.transaction.lock() = Some(transaction);
    }

    fn operation_failed(&self, result: OperationOutcome) {
        self.events
            .lock()
            .push(format!("failed {}", result.failure_description().unwrap_or("")));
    }

    fn operation_completed(&self, response: &OperationResponse) {
        self.events
            .lock()
            .push(format!("completed {}", response.outcome().to_document()));
    }
}

fn setup(
    script: Script,
) -> (
    ManagementClient,
    Connection,
    mpsc::UnboundedReceiver<(OperationId, ManagementRequest)>,
) {
    let ((a, a_rx), (b, b_rx)) = Channel::pair();
    let (requests, seen) = mpsc::unbounded_channel();
    let controller = Connection::open(b, b_rx, Arc::new(ScriptedController { script, requests }));
    let client = ManagementClient::connect(a, a_rx, ClientConfig::default());
    (client, controller, seen)
}

#[tokio::test]
async fn test_prepare_commit_complete() {
    let (client, _controller, mut seen) = setup(Script::Prepare);
    let listener = Arc::new(Recorder {
        commit_on_prepare: true,
        ..Default::default()
    });

    let future = client.execute(listener.clone(), Envelope::new(json!({"operation": "read"})));
    let response = future.get().await.unwrap();

    assert_eq!(response.outcome(), &OperationOutcome::success(json!("committed")));
    assert_eq!(
        *listener.events.lock(),
        vec![
            r#"prepared {"outcome":"success","result":{"operation":"read"}}"#.to_string(),
            r#"completed {"outcome":"success","result":"committed"}"#.to_string(),
        ]
    );

    assert!(matches!(seen.recv().await, Some((_, ManagementRequest::Execute(_)))));
    assert!(matches!(
        seen.recv().await,
        Some((_, ManagementRequest::Complete { decision: Decision::Commit }))
    ));
    assert_eq!(client.active_operations(), 0);
}

#[tokio::test]
async fn test_failure_resolves_without_complete() {
    let (client, _controller, mut seen) = setup(Script::Fail);
    let listener = Arc::new(Recorder::default());

    let future = client.execute(listener.clone(), Envelope::new(json!({"operation": "add"})));
    let response = future.get().await.unwrap();

    assert!(response.outcome().is_failed());
    assert_eq!(
        *listener.events.lock(),
        vec!["failed DuplicateResourceError: already exists".to_string()]
    );
    assert!(matches!(seen.recv().await, Some((_, ManagementRequest::Execute(_)))));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(seen.try_recv().is_err(), "no Complete after a pre-prepare failure");
}

#[tokio::test]
async fn test_timeout_after_prepare_rolls_back() {
    let (client, _controller, mut seen) = setup(Script::PrepareThenHang);
    let listener = Arc::new(Recorder::default());

    let future = client.execute(listener.clone(), Envelope::new(json!({"operation": "reload"})));
    let response = future
        .get_timeout(Duration::from_millis(100))
        .await
        .unwrap();

    assert!(response.outcome().is_timed_out());
    assert!(matches!(seen.recv().await, Some((_, ManagementRequest::Execute(_)))));
    assert!(matches!(
        seen.recv().await,
        Some((_, ManagementRequest::Complete { decision: Decision::Rollback }))
    ));

    // The late commit is refused locally
    let transaction = listener.transaction.lock().take().unwrap();
    assert!(matches!(
        transaction.commit(),
        Err(ClientError::DecisionAlreadySent(_))
    ));
}

#[tokio::test]
async fn test_decision_is_sent_once() {
    let (client, _controller, _seen) = setup(Script::PrepareThenHang);
    let listener = Arc::new(Recorder::default());

    let future = client.execute(listener.clone(), Envelope::new(json!({})));
    tokio::time::timeout(Duration::from_secs(1), async {
        while listener.transaction.lock().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let transaction = listener.transaction.lock().clone().unwrap();
    transaction.commit().unwrap();
    assert!(matches!(
        transaction.rollback(),
        Err(ClientError::DecisionAlreadySent(_))
    ));
    assert!(!future.is_done());
}

#[tokio::test]
async fn test_disconnect_fails_outstanding_operations() {
    let (client, controller, _seen) = setup(Script::PrepareThenHang);
    let listener = Arc::new(Recorder::default());

    let future = client.execute(listener, Envelope::new(json!({})));
    tokio::time::sleep(Duration::from_millis(20)).await;
    controller.close();

    let result = tokio::time::timeout(Duration::from_secs(1), future.get())
        .await
        .unwrap();
    assert_eq!(result.unwrap_err(), ClientError::ChannelClosed(future.id()));
    assert!(future.try_result().is_some());
}

#[tokio::test]
async fn test_cancel_async_is_acknowledged() {
    let (client, _controller, mut seen) = setup(Script::PrepareThenHang);

    client.cancel_async(OperationId::new(42)).await.unwrap();
    assert!(matches!(
        seen.recv().await,
        Some((id, ManagementRequest::CancelAsync)) if id == OperationId::new(42)
    ));
}

struct CollectingHandler {
    reports: Mutex<Vec<(MessageSeverity, String)>>,
}

impl MessageHandler for CollectingHandler {
    fn handle_report(&self, severity: MessageSeverity, message: &str) {
        self.reports.lock().push((severity, message.to_string()));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_controller_reaches_envelope_side_channels() {
    let (client, controller, mut seen) = setup(Script::PrepareThenHang);
    let handler = Arc::new(CollectingHandler {
        reports: Mutex::new(Vec::new()),
    });
    let envelope = Envelope::new(json!({"operation": "deploy"}))
        .with_message_handler(handler.clone())
        .with_attachment(Arc::new(BytesAttachment::new(b"archive bytes".to_vec())));

    let future = client.execute(Arc::new(Recorder::default()), envelope);
    let (op_id, request) = seen.recv().await.unwrap();
    let ManagementRequest::Execute(execute) = request else {
        panic!("expected Execute");
    };
    assert_eq!(execute.attachment_count, 1);
    assert_eq!(op_id, future.id());

    controller
        .notify(
            op_id,
            ManagementRequest::HandleReport {
                severity: MessageSeverity::Warn,
                message: "deployment is large".to_string(),
            },
        )
        .unwrap();

    let remote = RemoteAttachment::new(controller.clone(), op_id, 0);
    let bytes = tokio::task::spawn_blocking(move || {
        let mut bytes = Vec::new();
        remote.reader().read_to_end(&mut bytes).map(|_| bytes)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(bytes, b"archive bytes");

    assert_eq!(
        *handler.reports.lock(),
        vec![(MessageSeverity::Warn, "deployment is large".to_string())]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_adapter_commit() {
    let (client, _controller, _seen) = setup(Script::Prepare);

    let response = tokio::task::spawn_blocking(move || {
        let pending = execute_blocking(&client, Envelope::new(json!({"operation": "write"})));
        let prepared = pending.recv().unwrap();
        assert!(!prepared.is_done());
        assert!(prepared.prepared_result().is_success());
        prepared.commit().unwrap();
        prepared.future().wait_blocking()
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(response.outcome(), &OperationOutcome::success(json!("committed")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_adapter_failure() {
    let (client, _controller, _seen) = setup(Script::Fail);

    let prepared = tokio::task::spawn_blocking(move || {
        execute_blocking(&client, Envelope::new(json!({"operation": "add"})))
            .recv_timeout(Duration::from_secs(5))
    })
    .await
    .unwrap()
    .unwrap();

    assert!(prepared.is_done());
    assert!(prepared.prepared_result().is_failed());
    assert!(matches!(prepared.commit(), Err(ClientError::NotPrepared(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_prepare_timeout_rolls_back() {
    let (client, _controller, mut seen) = setup(Script::Silent);

    let prepared = tokio::task::spawn_blocking(move || {
        execute_blocking(&client, Envelope::new(json!({"operation": "deploy"})))
            .recv_timeout(Duration::from_millis(100))
    })
    .await
    .unwrap()
    .unwrap();

    assert!(prepared.is_done());
    assert!(prepared.prepared_result().is_timed_out());
    let description = prepared.prepared_result().failure_description().unwrap_or_default();
    assert!(description.ends_with("timed out after 100ms"), "{}", description);
    assert!(prepared.future().try_result().is_some());

    assert!(matches!(
        seen.recv().await,
        Some((_, ManagementRequest::Execute(_)))
    ));
    let (op_id, request) = tokio::time::timeout(Duration::from_secs(1), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(op_id, prepared.id());
    assert_eq!(
        request,
        ManagementRequest::Complete {
            decision: Decision::Rollback
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_blocking_prepare_rolls_back() {
    let (client, _controller, mut seen) = setup(Script::Prepare);

    let pending = execute_blocking(&client, Envelope::new(json!({"operation": "write"})));
    let op_id = pending.id();
    drop(pending);

    assert!(matches!(
        seen.recv().await,
        Some((_, ManagementRequest::Execute(_)))
    ));
    let (id, request) = tokio::time::timeout(Duration::from_secs(1), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(id, op_id);
    assert_eq!(
        request,
        ManagementRequest::Complete {
            decision: Decision::Rollback
        }
    );
}

#[tokio::test]
async fn test_client_rejects_requests_it_does_not_serve() {
    let (_client, controller, _seen) = setup(Script::Prepare);

    let mut responses = controller
        .request(OperationId::new(9), ManagementRequest::CancelAsync)
        .unwrap();
    let response = tokio::time::timeout(Duration::from_secs(1), responses.recv())
        .await
        .unwrap();
    assert_eq!(
        response,
        Some(ManagementResponse::Error {
            description: "cancel_async is not served by the client".to_string()
        })
    );
}
