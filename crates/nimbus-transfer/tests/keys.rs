mod common;

use std::sync::Arc;

use common::*;
use nimbus_core::keys::{FileKeyVersion, UserKeyPair, UserKeyPairVersion};
use nimbus_core::types::{FileFileKey, MissingKeysFilter, UserIdFileIdItem, UserUserPublicKey};
use nimbus_core::{ApiErrorKind, CryptoError, NimbusError};
use nimbus_crypto::{generate_file_key, unwrap_file_key, wrap_file_key, PlainFileKey};
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

const OWNER_PW: &str = "owner secret";
const MEMBER_PW: &str = "member secret";
const MEMBER: i64 = 10;

fn tagged_file_key(seed: u8) -> PlainFileKey {
    let mut key = generate_file_key(FileKeyVersion::Aes256Gcm);
    key.set_tag([seed; 16]);
    key
}

struct Room {
    owner: UserKeyPair,
    member: UserKeyPair,
    plain: Vec<(i64, PlainFileKey)>,
}

/// `files` files the owner holds keys for, each missing a key for `MEMBER`.
fn seed_room(api: &Arc<MockApi>, files: i64) -> Room {
    let owner = key_pair(UserKeyPairVersion::V1, OWNER_PW);
    let member = key_pair(UserKeyPairVersion::V1, MEMBER_PW);
    let mut plain = Vec::new();
    let mut s = api.state.lock().unwrap();
    s.missing_users.push(UserUserPublicKey {
        id: MEMBER,
        public_key_container: member.public_key_container.clone(),
    });
    for file_id in 1..=files {
        let key = tagged_file_key(file_id as u8);
        s.missing_files.push(FileFileKey {
            id: file_id,
            file_key_container: wrap_file_key(&key, &owner.public_key_container).unwrap(),
        });
        s.missing_items.push(UserIdFileIdItem {
            user_id: MEMBER,
            file_id,
        });
        plain.push((file_id, key));
    }
    drop(s);
    Room {
        owner,
        member,
        plain,
    }
}

#[tokio::test]
async fn test_resolves_all_missing_keys_in_batches() {
    let api = MockApi::new();
    let room = seed_room(&api, 23);
    let client = client(api.clone(), transfer_config(1024));

    let done = client
        .file_keys()
        .resolve_missing_keys(
            &CancellationToken::new(),
            MissingKeysFilter::default(),
            100,
            &room.owner,
            &SecretString::from(OWNER_PW),
        )
        .await
        .unwrap();
    assert!(done);

    let s = api.state.lock().unwrap();
    assert_eq!(s.missing_requests, vec![(0, 10), (10, 10), (20, 10)]);
    assert_eq!(s.calls.get("set_file_keys"), Some(&3));
    assert_eq!(s.set_keys.len(), 23);

    // The member can open what was wrapped for them.
    let member_pw = SecretString::from(MEMBER_PW);
    for set in &s.set_keys {
        assert_eq!(set.user_id, MEMBER);
        let opened = unwrap_file_key(&set.file_key, &room.member.private_key_container, &member_pw)
            .unwrap();
        let (_, expected) = room.plain.iter().find(|(id, _)| *id == set.file_id).unwrap();
        assert_eq!(opened.key_bytes(), expected.key_bytes());
        assert_eq!(opened.iv(), expected.iv());
        assert_eq!(opened.tag(), expected.tag());
    }
}

#[tokio::test]
async fn test_limit_stops_before_the_end() {
    let api = MockApi::new();
    let room = seed_room(&api, 23);
    let client = client(api.clone(), transfer_config(1024));

    let done = client
        .file_keys()
        .resolve_missing_keys(
            &CancellationToken::new(),
            MissingKeysFilter::default(),
            15,
            &room.owner,
            &SecretString::from(OWNER_PW),
        )
        .await
        .unwrap();
    assert!(!done);

    let s = api.state.lock().unwrap();
    assert_eq!(s.missing_requests, vec![(0, 10), (10, 5)]);
    assert_eq!(s.set_keys.len(), 15);
}

#[tokio::test]
async fn test_file_filter_is_forwarded() {
    let api = MockApi::new();
    let room = seed_room(&api, 5);
    let client = client(api.clone(), transfer_config(1024));

    let filter = MissingKeysFilter {
        room_id: None,
        file_id: Some(3),
    };
    let done = client
        .file_keys()
        .resolve_missing_keys(
            &CancellationToken::new(),
            filter,
            100,
            &room.owner,
            &SecretString::from(OWNER_PW),
        )
        .await
        .unwrap();
    assert!(done);

    let s = api.state.lock().unwrap();
    assert_eq!(s.set_keys.len(), 1);
    assert_eq!(s.set_keys[0].file_id, 3);
}

#[tokio::test]
async fn test_keys_of_other_generations_are_skipped() {
    let api = MockApi::new();
    let room = seed_room(&api, 2);
    let other = key_pair(UserKeyPairVersion::V2, "v2");
    {
        let mut s = api.state.lock().unwrap();
        let key = tagged_file_key(99);
        s.missing_files.push(FileFileKey {
            id: 50,
            file_key_container: wrap_file_key(&key, &other.public_key_container).unwrap(),
        });
        s.missing_items.push(UserIdFileIdItem {
            user_id: MEMBER,
            file_id: 50,
        });
    }
    let client = client(api.clone(), transfer_config(1024));

    let done = client
        .file_keys()
        .resolve_missing_keys(
            &CancellationToken::new(),
            MissingKeysFilter::default(),
            100,
            &room.owner,
            &SecretString::from(OWNER_PW),
        )
        .await
        .unwrap();
    assert!(done);

    let s = api.state.lock().unwrap();
    let files: Vec<i64> = s.set_keys.iter().map(|k| k.file_id).collect();
    assert_eq!(files, vec![1, 2]);
}

#[tokio::test]
async fn test_nothing_missing_sends_nothing() {
    let api = MockApi::new();
    let owner = key_pair(UserKeyPairVersion::V1, OWNER_PW);
    let client = client(api.clone(), transfer_config(1024));

    let done = client
        .file_keys()
        .resolve_missing_keys(
            &CancellationToken::new(),
            MissingKeysFilter::default(),
            100,
            &owner,
            &SecretString::from(OWNER_PW),
        )
        .await
        .unwrap();
    assert!(done);
    assert_eq!(api.calls("get_missing_file_keys"), 1);
    assert_eq!(api.calls("set_file_keys"), 0);
}

#[tokio::test]
async fn test_wrong_passphrase_makes_no_requests() {
    let api = MockApi::new();
    let room = seed_room(&api, 3);
    let client = client(api.clone(), transfer_config(1024));

    let err = client
        .file_keys()
        .resolve_missing_keys(
            &CancellationToken::new(),
            MissingKeysFilter::default(),
            100,
            &room.owner,
            &SecretString::from("guess"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NimbusError::Crypto(CryptoError::InvalidPassword)
    ));
    assert_eq!(api.total_calls(), 0);
}

#[tokio::test]
async fn test_missing_user_file_key() {
    let api = MockApi::new();
    let owner = key_pair(UserKeyPairVersion::V1, OWNER_PW);
    let client = client(api.clone(), transfer_config(1024));

    let err = client
        .file_keys()
        .get_plain_file_key(
            &CancellationToken::new(),
            42,
            &owner,
            &SecretString::from(OWNER_PW),
        )
        .await
        .unwrap_err();
    assert_eq!(err.api_kind(), Some(ApiErrorKind::NotFound));
}
