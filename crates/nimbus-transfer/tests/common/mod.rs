//! In-memory scripted service double shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use nimbus_core::config::{AuthConfig, TransferConfig};
use nimbus_core::keys::{EncryptedFileKey, UserKeyPair, UserKeyPairVersion};
use nimbus_core::types::*;
use nimbus_core::{ApiErrorKind, NimbusError, NimbusResult};
use nimbus_crypto::{generate_user_key_pair_with_params, KdfParams};
use nimbus_transfer::{
    Client, ClientBuilder, Credentials, Session, StorageApi, TokenRefresher, TransferListener,
};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

pub const INITIAL_TOKEN: &str = "token-0";

#[derive(Debug, Default)]
pub struct UploadRecord {
    pub request: Option<FileUploadRequest>,
    pub chunks: Vec<(u64, Vec<u8>)>,
    pub parts: BTreeMap<u32, Vec<u8>>,
    pub s3_urls_requested: Vec<(u32, u32, u64)>,
    pub completion_node: Option<Node>,
}

#[derive(Debug, Clone)]
pub struct CompletedUpload {
    pub upload_id: String,
    pub node: Node,
    pub content: Vec<u8>,
    pub file_key: Option<EncryptedFileKey>,
    pub parts: Vec<S3UploadPart>,
    pub resolution_strategy: ResolutionStrategy,
}

#[derive(Debug, Default)]
pub struct MockState {
    pub valid_token: String,
    pub use_s3: bool,
    pub nodes: HashMap<NodeId, Node>,
    pub contents: HashMap<NodeId, Vec<u8>>,
    pub uploads: HashMap<String, UploadRecord>,
    pub completed: Vec<CompletedUpload>,
    pub s3_statuses: VecDeque<S3UploadState>,
    pub user_file_keys: HashMap<NodeId, EncryptedFileKey>,
    pub missing_items: Vec<UserIdFileIdItem>,
    pub missing_users: Vec<UserUserPublicKey>,
    pub missing_files: Vec<FileFileKey>,
    pub set_keys: Vec<UserFileKeySet>,
    pub missing_requests: Vec<(u64, u64)>,
    pub network_failures: u32,
    /// Extra bytes appended to every range response.
    pub range_overrun: usize,
    /// Range responses come back empty.
    pub empty_ranges: bool,
    pub calls: HashMap<&'static str, usize>,
    pub next_node_id: NodeId,
    pub next_upload: u32,
}

#[derive(Debug, Default)]
pub struct MockApi {
    pub state: Mutex<MockState>,
    cancel_after_chunks: Mutex<Option<(usize, CancellationToken)>>,
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        let api = Self::default();
        {
            let mut s = api.state.lock().unwrap();
            s.valid_token = INITIAL_TOKEN.into();
            s.next_node_id = 1000;
        }
        Arc::new(api)
    }

    pub fn with_s3(self: Arc<Self>) -> Arc<Self> {
        self.state.lock().unwrap().use_s3 = true;
        self
    }

    pub fn add_file(&self, id: NodeId, content: Vec<u8>) {
        let mut s = self.state.lock().unwrap();
        s.nodes.insert(
            id,
            Node {
                id,
                name: format!("file-{id}"),
                parent_id: Some(1),
                size: Some(content.len() as u64),
                is_encrypted: Some(false),
            },
        );
        s.contents.insert(id, content);
    }

    pub fn calls(&self, name: &str) -> usize {
        self.state.lock().unwrap().calls.get(name).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.values().sum()
    }

    pub fn fail_network(&self, times: u32) {
        self.state.lock().unwrap().network_failures = times;
    }

    pub fn script_s3_statuses(&self, statuses: impl IntoIterator<Item = S3UploadState>) {
        self.state.lock().unwrap().s3_statuses = statuses.into_iter().collect();
    }

    pub fn expire_token(&self) {
        self.state.lock().unwrap().valid_token = "rotated-by-server".into();
    }

    pub fn cancel_after_chunks(&self, chunks: usize, token: CancellationToken) {
        *self.cancel_after_chunks.lock().unwrap() = Some((chunks, token));
    }

    pub fn completed(&self) -> Vec<CompletedUpload> {
        self.state.lock().unwrap().completed.clone()
    }

    pub fn upload(&self, upload_id: &str) -> Option<(Vec<(u64, Vec<u8>)>, BTreeMap<u32, Vec<u8>>)> {
        let s = self.state.lock().unwrap();
        s.uploads
            .get(upload_id)
            .map(|u| (u.chunks.clone(), u.parts.clone()))
    }

    pub fn only_upload(&self) -> (Vec<(u64, Vec<u8>)>, BTreeMap<u32, Vec<u8>>) {
        let s = self.state.lock().unwrap();
        assert_eq!(s.uploads.len(), 1, "expected exactly one upload session");
        let u = s.uploads.values().next().unwrap();
        (u.chunks.clone(), u.parts.clone())
    }

    fn count(&self, s: &mut MockState, name: &'static str) {
        *s.calls.entry(name).or_default() += 1;
    }

    fn check_token(s: &MockState, token: &str) -> NimbusResult<()> {
        if token == s.valid_token {
            Ok(())
        } else {
            Err(NimbusError::api(ApiErrorKind::Unauthorized, 401, "invalid token"))
        }
    }

    fn take_network_failure(s: &mut MockState) -> NimbusResult<()> {
        if s.network_failures > 0 {
            s.network_failures -= 1;
            return Err(NimbusError::Network("connection reset by peer".into()));
        }
        Ok(())
    }

    fn finish_upload(
        s: &mut MockState,
        upload_id: &str,
        content: Vec<u8>,
        file_key: Option<EncryptedFileKey>,
        parts: Vec<S3UploadPart>,
        resolution_strategy: ResolutionStrategy,
    ) -> NimbusResult<Node> {
        let request = s
            .uploads
            .get(upload_id)
            .and_then(|u| u.request.clone())
            .ok_or_else(|| NimbusError::api(ApiErrorKind::NotFound, 404, "no such upload"))?;
        let id = s.next_node_id;
        s.next_node_id += 1;
        let node = Node {
            id,
            name: request.name.clone(),
            parent_id: Some(request.parent_id),
            size: Some(content.len() as u64),
            is_encrypted: Some(file_key.is_some()),
        };
        s.nodes.insert(id, node.clone());
        s.contents.insert(id, content.clone());
        if let Some(key) = &file_key {
            s.user_file_keys.insert(id, key.clone());
        }
        s.completed.push(CompletedUpload {
            upload_id: upload_id.to_string(),
            node: node.clone(),
            content,
            file_key,
            parts,
            resolution_strategy,
        });
        Ok(node)
    }
}

#[async_trait]
impl StorageApi for MockApi {
    async fn get_node(&self, token: &str, node_id: NodeId) -> NimbusResult<Node> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "get_node");
        Self::check_token(&s, token)?;
        s.nodes
            .get(&node_id)
            .cloned()
            .ok_or_else(|| NimbusError::api(ApiErrorKind::NotFound, 404, "node not found"))
    }

    async fn get_server_general_settings(&self, token: &str) -> NimbusResult<GeneralSettings> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "get_server_general_settings");
        Self::check_token(&s, token)?;
        Ok(GeneralSettings {
            use_s3_storage: s.use_s3,
            s3_tags_enabled: false,
        })
    }

    async fn create_file_upload(
        &self,
        token: &str,
        request: &FileUploadRequest,
    ) -> NimbusResult<UploadSession> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "create_file_upload");
        Self::check_token(&s, token)?;
        s.next_upload += 1;
        let upload_id = format!("upload-{}", s.next_upload);
        s.uploads.insert(
            upload_id.clone(),
            UploadRecord {
                request: Some(request.clone()),
                ..Default::default()
            },
        );
        Ok(UploadSession {
            upload_id,
            upload_url: None,
        })
    }

    async fn upload_chunk(
        &self,
        token: &str,
        upload_id: &str,
        offset: u64,
        chunk: Bytes,
    ) -> NimbusResult<()> {
        let sent = {
            let mut s = self.state.lock().unwrap();
            self.count(&mut s, "upload_chunk");
            Self::check_token(&s, token)?;
            Self::take_network_failure(&mut s)?;
            let record = s
                .uploads
                .get_mut(upload_id)
                .ok_or_else(|| NimbusError::api(ApiErrorKind::NotFound, 404, "no such upload"))?;
            let expected: u64 = record.chunks.iter().map(|(_, c)| c.len() as u64).sum();
            if offset != expected {
                return Err(NimbusError::api(
                    ApiErrorKind::RangeNotSatisfiable,
                    416,
                    format!("chunk at {offset}, expected {expected}"),
                ));
            }
            record.chunks.push((offset, chunk.to_vec()));
            record.chunks.len()
        };
        if let Some((after, token)) = self.cancel_after_chunks.lock().unwrap().as_ref() {
            if sent >= *after {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn complete_file_upload(
        &self,
        token: &str,
        upload_id: &str,
        request: &CompleteUploadRequest,
    ) -> NimbusResult<Node> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "complete_file_upload");
        Self::check_token(&s, token)?;
        let content: Vec<u8> = s
            .uploads
            .get(upload_id)
            .map(|u| u.chunks.iter().flat_map(|(_, c)| c.clone()).collect())
            .unwrap_or_default();
        Self::finish_upload(
            &mut s,
            upload_id,
            content,
            request.file_key.clone(),
            Vec::new(),
            request.resolution_strategy,
        )
    }

    async fn get_download_url(&self, token: &str, node_id: NodeId) -> NimbusResult<String> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "get_download_url");
        Self::check_token(&s, token)?;
        if !s.contents.contains_key(&node_id) {
            return Err(NimbusError::api(ApiErrorKind::NotFound, 404, "node not found"));
        }
        Ok(format!("mock://download/{node_id}"))
    }

    async fn download_range(&self, url: &str, offset: u64, size: u64) -> NimbusResult<Bytes> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "download_range");
        Self::take_network_failure(&mut s)?;
        if s.empty_ranges {
            return Ok(Bytes::new());
        }
        let node_id: NodeId = url
            .rsplit('/')
            .next()
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| NimbusError::api(ApiErrorKind::NotFound, 404, "bad url"))?;
        let content = s
            .contents
            .get(&node_id)
            .ok_or_else(|| NimbusError::api(ApiErrorKind::NotFound, 404, "node not found"))?;
        let start = (offset as usize).min(content.len());
        let end = (start + size as usize + s.range_overrun).min(content.len() + s.range_overrun);
        let mut data = content[start..end.min(content.len())].to_vec();
        data.resize(end - start, 0xEE);
        Ok(Bytes::from(data))
    }

    async fn get_s3_upload_urls(
        &self,
        token: &str,
        upload_id: &str,
        first_part_number: u32,
        count: u32,
        size: u64,
    ) -> NimbusResult<PresignedUrlList> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "get_s3_upload_urls");
        Self::check_token(&s, token)?;
        let record = s
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| NimbusError::api(ApiErrorKind::NotFound, 404, "no such upload"))?;
        record.s3_urls_requested.push((first_part_number, count, size));
        Ok(PresignedUrlList {
            urls: (first_part_number..first_part_number + count)
                .map(|n| PresignedUrl {
                    url: format!("mock://s3/{upload_id}/{n}"),
                    part_number: n,
                })
                .collect(),
        })
    }

    async fn put_s3_part(&self, url: &str, chunk: Bytes) -> NimbusResult<String> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "put_s3_part");
        Self::take_network_failure(&mut s)?;
        let mut segments = url.trim_start_matches("mock://s3/").split('/');
        let upload_id = segments.next().unwrap_or_default().to_string();
        let part: u32 = segments.next().and_then(|p| p.parse().ok()).unwrap_or(0);
        let record = s
            .uploads
            .get_mut(&upload_id)
            .ok_or_else(|| NimbusError::api(ApiErrorKind::NotFound, 404, "no such upload"))?;
        record.parts.insert(part, chunk.to_vec());
        Ok(format!("\"etag-{part}\""))
    }

    async fn complete_s3_upload(
        &self,
        token: &str,
        upload_id: &str,
        request: &CompleteS3UploadRequest,
    ) -> NimbusResult<()> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "complete_s3_upload");
        Self::check_token(&s, token)?;
        let content: Vec<u8> = {
            let record = s
                .uploads
                .get(upload_id)
                .ok_or_else(|| NimbusError::api(ApiErrorKind::NotFound, 404, "no such upload"))?;
            request
                .parts
                .iter()
                .flat_map(|p| record.parts.get(&p.part_number).cloned().unwrap_or_default())
                .collect()
        };
        let node = Self::finish_upload(
            &mut s,
            upload_id,
            content,
            request.file_key.clone(),
            request.parts.clone(),
            request.resolution_strategy,
        )?;
        if let Some(record) = s.uploads.get_mut(upload_id) {
            record.completion_node = Some(node);
        }
        Ok(())
    }

    async fn get_s3_upload_status(
        &self,
        token: &str,
        upload_id: &str,
    ) -> NimbusResult<S3UploadStatus> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "get_s3_upload_status");
        Self::check_token(&s, token)?;
        let status = s.s3_statuses.pop_front().unwrap_or(S3UploadState::Done);
        let node = s.uploads.get(upload_id).and_then(|u| u.completion_node.clone());
        let error_details = match status {
            S3UploadState::Error => Some(ErrorDetails {
                code: 409,
                message: "file already exists".into(),
                error_code: Some(-40010),
            }),
            _ => None,
        };
        Ok(S3UploadStatus {
            node: if status == S3UploadState::Done { node } else { None },
            status,
            error_details,
        })
    }

    async fn get_user_file_key(
        &self,
        token: &str,
        node_id: NodeId,
    ) -> NimbusResult<EncryptedFileKey> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "get_user_file_key");
        Self::check_token(&s, token)?;
        s.user_file_keys
            .get(&node_id)
            .cloned()
            .ok_or_else(|| NimbusError::api(ApiErrorKind::NotFound, 404, "file key not found"))
    }

    async fn get_missing_file_keys(
        &self,
        token: &str,
        filter: MissingKeysFilter,
        offset: u64,
        limit: u64,
    ) -> NimbusResult<MissingKeysResponse> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "get_missing_file_keys");
        Self::check_token(&s, token)?;
        s.missing_requests.push((offset, limit));
        let matching: Vec<UserIdFileIdItem> = s
            .missing_items
            .iter()
            .filter(|i| filter.file_id.map_or(true, |f| f == i.file_id))
            .cloned()
            .collect();
        let items: Vec<UserIdFileIdItem> = matching
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        let users = s
            .missing_users
            .iter()
            .filter(|u| items.iter().any(|i| i.user_id == u.id))
            .cloned()
            .collect();
        let files = s
            .missing_files
            .iter()
            .filter(|f| items.iter().any(|i| i.file_id == f.id))
            .cloned()
            .collect();
        Ok(MissingKeysResponse {
            range: Range {
                offset,
                limit,
                total: matching.len() as u64,
            },
            items,
            users,
            files,
        })
    }

    async fn set_file_keys(&self, token: &str, keys: &[UserFileKeySet]) -> NimbusResult<()> {
        let mut s = self.state.lock().unwrap();
        self.count(&mut s, "set_file_keys");
        Self::check_token(&s, token)?;
        s.set_keys.extend_from_slice(keys);
        Ok(())
    }
}

/// Issues `token-N` and installs it as the valid token on the mock.
pub struct MockRefresher {
    api: Arc<MockApi>,
    pub calls: AtomicU32,
    pub fail: bool,
    network_failures: AtomicU32,
}

impl MockRefresher {
    pub fn new(api: Arc<MockApi>, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            api,
            calls: AtomicU32::new(0),
            fail,
            network_failures: AtomicU32::new(0),
        })
    }

    /// The next `n` refreshes fail with a transport error.
    pub fn fail_network(&self, n: u32) {
        self.network_failures.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenRefresher for MockRefresher {
    async fn refresh(&self, _refresh_token: &str) -> NimbusResult<Credentials> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let dropped = self
            .network_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            return Err(NimbusError::Network("connection reset by peer".into()));
        }
        if self.fail {
            return Err(NimbusError::api(ApiErrorKind::Unauthorized, 401, "refresh token revoked"));
        }
        let token = format!("token-{n}");
        self.api.state.lock().unwrap().valid_token = token.clone();
        Ok(Credentials::new(token, Some("refresh-next".into())))
    }
}

pub fn transfer_config(chunk_size: u64) -> TransferConfig {
    TransferConfig {
        chunk_size,
        ..Default::default()
    }
}

pub fn session(api: Arc<MockApi>, config: TransferConfig) -> Arc<Session> {
    let refresher = MockRefresher::new(api.clone(), false);
    Arc::new(Session::new(
        api,
        refresher,
        Credentials::new(INITIAL_TOKEN, Some("refresh-0".into())),
        config,
        &AuthConfig::default(),
    ))
}

pub fn client(api: Arc<MockApi>, config: TransferConfig) -> Client {
    let refresher = MockRefresher::new(api.clone(), false);
    ClientBuilder::new()
        .api(api)
        .refresher(refresher)
        .credentials(Credentials::new(INITIAL_TOKEN, Some("refresh-0".into())))
        .transfer_config(config)
        .build()
        .unwrap()
}

pub fn key_pair(version: UserKeyPairVersion, passphrase: &str) -> UserKeyPair {
    let params = KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    };
    generate_user_key_pair_with_params(version, &SecretString::from(passphrase), &params).unwrap()
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Started,
    Running(u64, Option<u64>),
    Finished(Option<NodeId>),
    Canceled,
    Failed(String),
}

#[derive(Debug, Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<Event>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn terminal_events(&self) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| !matches!(e, Event::Started | Event::Running(..)))
            .collect()
    }
}

impl TransferListener for RecordingListener {
    fn on_started(&self, _id: &str) {
        self.events.lock().unwrap().push(Event::Started);
    }

    fn on_running(&self, _id: &str, bytes_done: u64, bytes_total: Option<u64>) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Running(bytes_done, bytes_total));
    }

    fn on_finished(&self, _id: &str, node: Option<&Node>) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Finished(node.map(|n| n.id)));
    }

    fn on_canceled(&self, _id: &str) {
        self.events.lock().unwrap().push(Event::Canceled);
    }

    fn on_failed(&self, _id: &str, error: &NimbusError) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Failed(error.to_string()));
    }
}
