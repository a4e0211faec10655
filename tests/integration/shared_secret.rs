//! Folder shared secrets sealed per member.

use super::test_utils::{creator_context, replica_of};
use std::sync::Arc;
use syncable_store::access::{generate_shared_secret, SharedSecret};
use syncable_store::crypto::{CryptoKeySet, CryptoService};
use syncable_store::error::AccessError;

#[test]
fn test_every_member_recovers_the_same_key() {
    let owner = Arc::new(CryptoKeySet::generate());
    let crypto = CryptoService::new(owner.clone());
    let members: Vec<CryptoKeySet> = (0..3).map(|_| CryptoKeySet::generate()).collect();
    for member in &members {
        crypto.remember(member.public_keys().clone()).unwrap();
    }
    let ids: Vec<_> = members.iter().map(|m| m.id().clone()).collect();

    let (secret, key) = generate_shared_secret(&crypto, &ids).unwrap();
    let secret = SharedSecret::from_bytes(&secret.to_bytes().unwrap()).unwrap();
    for member in &members {
        assert!(secret.decrypt_for(member).unwrap() == key);
    }

    let outsider = CryptoKeySet::generate();
    assert!(matches!(
        secret.decrypt_for(&outsider),
        Err(AccessError::Unauthorized(_))
    ));
    assert!(secret.decrypt_for(&owner).is_err());
}

#[test]
fn test_unknown_member_fails_whole_generation() {
    let crypto = CryptoService::new(Arc::new(CryptoKeySet::generate()));
    let known = CryptoKeySet::generate();
    crypto.remember(known.public_keys().clone()).unwrap();
    let unknown = CryptoKeySet::generate();

    let result = generate_shared_secret(&crypto, &[known.id().clone(), unknown.id().clone()]);
    assert!(result.is_err());
}

#[test]
fn test_redistribute_keeps_id_and_key() {
    let owner = Arc::new(CryptoKeySet::generate());
    let crypto = CryptoService::new(owner.clone());
    let added = CryptoKeySet::generate();
    crypto.remember(added.public_keys().clone()).unwrap();

    let (secret, key) = generate_shared_secret(&crypto, &[owner.id().clone()]).unwrap();
    let widened = secret
        .redistribute(&crypto, &key, &[owner.id().clone(), added.id().clone()])
        .unwrap();
    assert_eq!(widened.id, secret.id);
    assert!(widened.decrypt_for(&added).unwrap() == key);
    assert_eq!(widened.members().count(), 2);
}

#[tokio::test]
async fn test_folder_members_share_content_key() {
    let owner = creator_context("secrets").await;
    let member_keys = CryptoKeySet::generate();
    let member_public = member_keys.public_keys().clone();
    let folder = owner
        .create_folder(&owner.root(), "shared", &[member_public])
        .await
        .unwrap();

    let key = owner.shared_secret_key(&folder).await.unwrap();
    let secret = owner.shared_secret(&folder).await.unwrap();
    assert!(secret.decrypt_for(&member_keys).unwrap() == key);

    let ciphertext = key.encrypt(b"meeting notes").unwrap();
    assert_eq!(key.decrypt(&ciphertext).unwrap(), b"meeting notes");

    let outsider = replica_of(&owner, CryptoKeySet::generate()).await;
    assert!(secret.decrypt_for(outsider.keys()).is_err());
}
