//! File key retrieval and missing-key resolution for shared encrypted rooms.

use std::collections::HashMap;
use std::sync::Arc;

use nimbus_core::keys::{UserKeyPair, UserPublicKey};
use nimbus_core::types::{MissingKeysFilter, NodeId, UserFileKeySet, UserId};
use nimbus_core::NimbusResult;
use nimbus_crypto::{unlock_private_key, unwrap_file_key, wrap_file_key, PlainFileKey};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::Session;

/// Items requested per missing-key round.
pub const MISSING_KEYS_BATCH: u64 = 10;

#[derive(Debug, Clone)]
pub struct FileKeyManager {
    session: Arc<Session>,
}

impl FileKeyManager {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Fetch the caller's wrapped key for `node_id` and unwrap it.
    pub async fn get_plain_file_key(
        &self,
        cancel: &CancellationToken,
        node_id: NodeId,
        key_pair: &UserKeyPair,
        passphrase: &SecretString,
    ) -> NimbusResult<PlainFileKey> {
        let api = self.session.api();
        let encrypted = self
            .session
            .call(cancel, |token| async move {
                api.get_user_file_key(&token, node_id).await
            })
            .await?;
        Ok(unwrap_file_key(
            &encrypted,
            &key_pair.private_key_container,
            passphrase,
        )?)
    }

    /// Wrap file keys for users who can see a file but hold no key for it.
    ///
    /// Works through the missing list in rounds of [`MISSING_KEYS_BATCH`]
    /// until `limit` items have been examined. Returns `true` once the
    /// service reports no missing keys beyond the last round; call again
    /// while it returns `false`.
    pub async fn resolve_missing_keys(
        &self,
        cancel: &CancellationToken,
        filter: MissingKeysFilter,
        limit: u64,
        key_pair: &UserKeyPair,
        passphrase: &SecretString,
    ) -> NimbusResult<bool> {
        let unlocked = unlock_private_key(&key_pair.private_key_container, passphrase)?;
        let api = self.session.api();
        let mut offset = 0u64;

        loop {
            let batch_limit = MISSING_KEYS_BATCH.min(limit.saturating_sub(offset));
            if batch_limit == 0 {
                return Ok(false);
            }

            let response = self
                .session
                .call(cancel, |token| async move {
                    api.get_missing_file_keys(&token, filter, offset, batch_limit)
                        .await
                })
                .await?;

            let users: HashMap<UserId, &UserPublicKey> = response
                .users
                .iter()
                .map(|u| (u.id, &u.public_key_container))
                .collect();
            let mut plain_keys: HashMap<NodeId, PlainFileKey> = HashMap::new();
            for file in &response.files {
                if !unlocked.can_open(&file.file_key_container.version) {
                    debug!(
                        file_id = file.id,
                        version = %file.file_key_container.version,
                        "skipping file key of another key generation"
                    );
                    continue;
                }
                match unlocked.unwrap_file_key(&file.file_key_container) {
                    Ok(plain) => {
                        plain_keys.insert(file.id, plain);
                    }
                    Err(e) => warn!(file_id = file.id, error = %e, "cannot unwrap file key"),
                }
            }

            let mut batch = Vec::with_capacity(response.items.len());
            for item in &response.items {
                let (Some(recipient), Some(plain)) =
                    (users.get(&item.user_id), plain_keys.get(&item.file_id))
                else {
                    continue;
                };
                match wrap_file_key(plain, recipient) {
                    Ok(file_key) => batch.push(UserFileKeySet {
                        user_id: item.user_id,
                        file_id: item.file_id,
                        file_key,
                    }),
                    Err(e) => warn!(
                        user_id = item.user_id,
                        file_id = item.file_id,
                        error = %e,
                        "cannot wrap file key for user"
                    ),
                }
            }

            if !batch.is_empty() {
                let batch = batch.as_slice();
                self.session
                    .call(cancel, |token| async move {
                        api.set_file_keys(&token, batch).await
                    })
                    .await?;
                info!(count = batch.len(), offset, "uploaded missing file keys");
            }

            if response.range.total <= offset + batch_limit {
                return Ok(true);
            }
            offset += batch_limit;
        }
    }
}
