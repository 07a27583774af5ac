mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::*;
use nimbus_core::types::{FileUploadRequest, ResolutionStrategy, S3UploadState};
use nimbus_core::ApiErrorKind;
use nimbus_transfer::{PollPolicy, S3Coordinator, StorageApi};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

async fn coordinator(api: &Arc<MockApi>, poll: PollPolicy) -> S3Coordinator {
    let session = session(api.clone(), transfer_config(1024));
    let upload = api
        .create_file_upload(INITIAL_TOKEN, &FileUploadRequest::new(1, "direct.bin"))
        .await
        .unwrap();
    S3Coordinator::new(session, upload.upload_id, poll)
}

#[tokio::test(start_paused = true)]
async fn test_polls_until_done_with_doubling_waits() {
    let api = MockApi::new().with_s3();
    api.script_s3_statuses([
        S3UploadState::Transfer,
        S3UploadState::Transfer,
        S3UploadState::Done,
    ]);
    let mut s3 = coordinator(&api, PollPolicy::default()).await;
    let cancel = CancellationToken::new();
    s3.upload_part(&cancel, 0, Bytes::from_static(b"abc")).await.unwrap();

    let started = Instant::now();
    let node = s3
        .complete(&cancel, ResolutionStrategy::Autorename, false, None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(node.size, Some(3));
    assert_eq!(api.calls("get_s3_upload_status"), 3);
    // 500ms then 1s.
    assert_eq!(started.elapsed(), Duration::from_millis(1_500));
}

#[tokio::test(start_paused = true)]
async fn test_wait_is_capped() {
    let api = MockApi::new().with_s3();
    api.script_s3_statuses(std::iter::repeat(S3UploadState::Finishing).take(6));
    let mut s3 = coordinator(&api, PollPolicy::default()).await;
    let cancel = CancellationToken::new();

    let started = Instant::now();
    s3.complete(&cancel, ResolutionStrategy::Autorename, false, None)
        .await
        .unwrap()
        .unwrap();

    // 0.5 + 1 + 2 + 4 + 5 + 5
    assert_eq!(started.elapsed(), Duration::from_millis(17_500));
    assert_eq!(api.calls("get_s3_upload_status"), 7);
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_completion_returns_none() {
    let api = MockApi::new().with_s3();
    api.script_s3_statuses(std::iter::repeat(S3UploadState::Transfer).take(100));
    let poll = PollPolicy {
        initial: Duration::from_millis(500),
        max_delay: Duration::from_secs(5),
        max_attempts: 4,
    };
    let mut s3 = coordinator(&api, poll).await;
    let cancel = CancellationToken::new();

    let started = Instant::now();
    let node = s3
        .complete(&cancel, ResolutionStrategy::Autorename, false, None)
        .await
        .unwrap();

    assert!(node.is_none());
    assert_eq!(api.calls("get_s3_upload_status"), 4);
    // No wait after the last attempt.
    assert_eq!(started.elapsed(), Duration::from_millis(3_500));
}

#[tokio::test(start_paused = true)]
async fn test_error_state_surfaces_details() {
    let api = MockApi::new().with_s3();
    api.script_s3_statuses([S3UploadState::Transfer, S3UploadState::Error]);
    let mut s3 = coordinator(&api, PollPolicy::default()).await;
    let cancel = CancellationToken::new();

    let err = s3
        .complete(&cancel, ResolutionStrategy::Fail, false, None)
        .await
        .unwrap_err();
    assert_eq!(err.api_kind(), Some(ApiErrorKind::Conflict));
    assert!(err.to_string().contains("file already exists"));
}

#[tokio::test(start_paused = true)]
async fn test_unknown_state_is_a_server_error() {
    let api = MockApi::new().with_s3();
    api.script_s3_statuses([S3UploadState::Other("quarantined".into())]);
    let mut s3 = coordinator(&api, PollPolicy::default()).await;
    let cancel = CancellationToken::new();

    let err = s3
        .complete(&cancel, ResolutionStrategy::Autorename, false, None)
        .await
        .unwrap_err();
    assert_eq!(err.api_kind(), Some(ApiErrorKind::ServerError));
    assert!(err.to_string().contains("quarantined"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_between_polls() {
    let api = MockApi::new().with_s3();
    api.script_s3_statuses(std::iter::repeat(S3UploadState::Transfer).take(100));
    let mut s3 = coordinator(&api, PollPolicy::default()).await;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(700)).await;
        trigger.cancel();
    });

    let err = s3
        .complete(&cancel, ResolutionStrategy::Autorename, false, None)
        .await
        .unwrap_err();
    assert!(err.is_canceled());
    assert_eq!(api.calls("get_s3_upload_status"), 2);
}

#[tokio::test]
async fn test_etags_recorded_without_quotes() {
    let api = MockApi::new().with_s3();
    let mut s3 = coordinator(&api, PollPolicy::default()).await;
    let cancel = CancellationToken::new();
    s3.upload_part(&cancel, 0, Bytes::from_static(b"a")).await.unwrap();
    s3.upload_part(&cancel, 1, Bytes::from_static(b"b")).await.unwrap();

    let etags: Vec<(u32, &str)> = s3
        .parts()
        .iter()
        .map(|p| (p.part_number, p.part_etag.as_str()))
        .collect();
    assert_eq!(etags, vec![(1, "etag-1"), (2, "etag-2")]);

    let state = api.state.lock().unwrap();
    let requested = &state.uploads.values().next().unwrap().s3_urls_requested;
    assert_eq!(requested, &vec![(1, 1, 1), (2, 1, 1)]);
}
