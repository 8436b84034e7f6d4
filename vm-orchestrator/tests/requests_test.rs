//! Request state machine: user and approver actions.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc::Receiver;
use vm_orchestrator::test_utils::{create_test_db, RecordingNotifier};
use vm_orchestrator::{
    CreateRequest, Job, JobQueue, NodeConfigStatus, NotificationEvent, OrchestratorError,
    RequestFilters, RequestService, RequestStatus,
};

async fn service() -> (RequestService, Receiver<Job>, Arc<RecordingNotifier>) {
    let pool = create_test_db().await;
    let (queue, rx) = JobQueue::new(16);
    let notifier = Arc::new(RecordingNotifier::new());
    (
        RequestService::new(pool, queue, notifier.clone()),
        rx,
        notifier,
    )
}

fn vm_request(requester: &str) -> CreateRequest {
    CreateRequest {
        requester: requester.to_string(),
        provider: "pve".to_string(),
        resource_type: "vm".to_string(),
        environment: "dev".to_string(),
        spec: json!({ "name": "db1", "cpu": 2, "memory": 4096 }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_request_starts_pending() {
    let (service, _rx, _) = service().await;

    let request = service
        .create_request(vm_request("alice"))
        .await
        .expect("Failed to create request");

    assert_eq!(request.status, RequestStatus::Pending);
    assert_eq!(request.requester, "alice");
    assert_eq!(request.quantity, 1);
    assert_eq!(request.spec["name"], "db1");
    assert!(request.approved_at.is_none());
    assert!(request.resource_id.is_none());
}

#[tokio::test]
async fn test_create_request_validates_input() {
    let (service, _rx, _) = service().await;

    let mut missing_env = vm_request("alice");
    missing_env.environment = "  ".to_string();
    assert!(matches!(
        service.create_request(missing_env).await,
        Err(OrchestratorError::InvalidInput(_))
    ));

    let mut zero = vm_request("alice");
    zero.quantity = Some(0);
    assert!(matches!(
        service.create_request(zero).await,
        Err(OrchestratorError::InvalidInput(_))
    ));

    let mut not_object = vm_request("alice");
    not_object.spec = json!(["db1"]);
    assert!(matches!(
        service.create_request(not_object).await,
        Err(OrchestratorError::InvalidInput(_))
    ));

    let all = service.list_requests(RequestFilters::default()).await.unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn test_approve_records_approval_and_enqueues() {
    let (service, mut rx, notifier) = service().await;
    let request = service.create_request(vm_request("alice")).await.unwrap();

    let approved = service
        .approve(&request.id, "bob", Some("looks fine"))
        .await
        .expect("Failed to approve");

    assert_eq!(approved.status, RequestStatus::Approved);
    assert_eq!(approved.approver.as_deref(), Some("bob"));
    assert_eq!(approved.reason.as_deref(), Some("looks fine"));
    assert!(approved.approved_at.is_some());

    let node = service.get_node_config(&request.id).await.unwrap();
    assert_eq!(node.status, NodeConfigStatus::Pending);

    assert_eq!(
        rx.try_recv().ok(),
        Some(Job::Provision {
            request_id: request.id.clone()
        })
    );
    assert_eq!(notifier.kinds(), vec![NotificationEvent::RequestApproved]);
    assert_eq!(notifier.events()[0].1, "alice");
}

#[tokio::test]
async fn test_double_approve_conflicts() {
    let (service, mut rx, _) = service().await;
    let request = service.create_request(vm_request("alice")).await.unwrap();

    let first = service.approve(&request.id, "bob", None).await.unwrap();
    let second = service.approve(&request.id, "carol", None).await;

    assert!(matches!(second, Err(OrchestratorError::InvalidState(_))));

    let current = service.get_request(&request.id).await.unwrap();
    assert_eq!(current.approver.as_deref(), Some("bob"));
    assert_eq!(current.approved_at, first.approved_at);

    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_err(), "second approval must not enqueue");
}

#[tokio::test]
async fn test_approve_unknown_request_is_not_found() {
    let (service, _rx, _) = service().await;

    let result = service.approve("missing", "bob", None).await;
    assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
}

#[tokio::test]
async fn test_reject_requires_reason() {
    let (service, mut rx, notifier) = service().await;
    let request = service.create_request(vm_request("alice")).await.unwrap();

    let empty = service.reject(&request.id, "bob", " ").await;
    assert!(matches!(empty, Err(OrchestratorError::InvalidInput(_))));
    assert_eq!(
        service.get_request(&request.id).await.unwrap().status,
        RequestStatus::Pending
    );

    let rejected = service
        .reject(&request.id, "bob", "no budget")
        .await
        .unwrap();
    assert_eq!(rejected.status, RequestStatus::Rejected);
    assert_eq!(rejected.reason.as_deref(), Some("no budget"));

    // Rejected is terminal.
    let approve = service.approve(&request.id, "bob", None).await;
    assert!(matches!(approve, Err(OrchestratorError::InvalidState(_))));

    assert!(rx.try_recv().is_err());
    assert_eq!(notifier.kinds(), vec![NotificationEvent::RequestRejected]);
}

#[tokio::test]
async fn test_retry_only_from_failed() {
    let (service, mut rx, _) = service().await;
    let request = service.create_request(vm_request("alice")).await.unwrap();

    let early = service.retry(&request.id).await;
    assert!(matches!(early, Err(OrchestratorError::InvalidState(_))));

    sqlx::query(
        "UPDATE resource_requests
         SET status = 'failed', error_message = 'plan failed', failure_stage = 'plan',
             provisioning_log = 'log', started_at = 1, completed_at = 2
         WHERE id = ?",
    )
    .bind(&request.id)
    .execute(service.pool())
    .await
    .unwrap();

    let retried = service.retry(&request.id).await.unwrap();
    assert_eq!(retried.status, RequestStatus::Approved);
    assert!(retried.error_message.is_none());
    assert!(retried.failure_stage.is_none());
    assert!(retried.provisioning_log.is_none());
    assert!(retried.started_at.is_none());
    assert!(retried.completed_at.is_none());

    assert_eq!(
        rx.try_recv().ok(),
        Some(Job::Provision {
            request_id: request.id.clone()
        })
    );
    assert_eq!(
        service.get_node_config(&request.id).await.unwrap().status,
        NodeConfigStatus::Pending
    );
}

#[tokio::test]
async fn test_delete_only_from_deletable_states() {
    let (service, _rx, _) = service().await;

    let pending = service.create_request(vm_request("alice")).await.unwrap();
    service.delete_request(&pending.id).await.unwrap();
    assert!(matches!(
        service.get_request(&pending.id).await,
        Err(OrchestratorError::NotFound(_))
    ));

    let approved = service.create_request(vm_request("alice")).await.unwrap();
    service.approve(&approved.id, "bob", None).await.unwrap();
    assert!(matches!(
        service.delete_request(&approved.id).await,
        Err(OrchestratorError::InvalidState(_))
    ));
    assert!(service.get_request(&approved.id).await.is_ok());

    assert!(matches!(
        service.delete_request("missing").await,
        Err(OrchestratorError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_list_requests_with_filters() {
    let (service, _rx, _) = service().await;

    let a1 = service.create_request(vm_request("alice")).await.unwrap();
    service.create_request(vm_request("bob")).await.unwrap();
    let a2 = service.create_request(vm_request("alice")).await.unwrap();
    service.approve(&a2.id, "carol", None).await.unwrap();

    let alice = service
        .list_requests(RequestFilters {
            requester: Some("alice".to_string()),
            status: None,
        })
        .await
        .unwrap();
    let ids: Vec<_> = alice.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec![a2.id.as_str(), a1.id.as_str()]);

    let approved = service
        .list_requests(RequestFilters {
            requester: None,
            status: Some(RequestStatus::Approved),
        })
        .await
        .unwrap();
    assert_eq!(approved.len(), 1);
    assert_eq!(approved[0].id, a2.id);
}

#[tokio::test]
async fn test_destroy_missing_resource_is_not_found() {
    let (service, _rx, _) = service().await;

    assert!(matches!(
        service.destroy_resource("missing").await,
        Err(OrchestratorError::NotFound(_))
    ));
}
