//! Role changes and provenance through the store context.

use super::test_utils::{child, creator_context, root_id};
use std::sync::Arc;
use std::time::Duration;
use syncable_store::access::document::{sign_delta, sign_snapshot};
use syncable_store::access::{
    AccessControlEvaluator, DocumentEvaluator, Role, RoleChange, StoredAccessControlDocument,
    TimeAuthority, TrustAnchor,
};
use syncable_store::crypto::CryptoKeySet;
use syncable_store::error::AccessError;
use syncable_store::lock::MemoryLockStore;
use syncable_store::store::InMemoryBacking;
use syncable_store::tree::SyncablePath;
use syncable_store::{ErrorKind, StoreContext};

#[test]
fn test_delta_without_role_at_signing_time_is_rejected() {
    let folder: SyncablePath = "sr-acl/folder_team".parse().unwrap();
    let owner = CryptoKeySet::generate();
    let editor = CryptoKeySet::generate();
    let mallory = CryptoKeySet::generate();

    let grant_editor = sign_delta(
        &owner,
        &folder,
        RoleChange {
            subject: editor.public_keys().clone(),
            role: Some(Role::Editor),
        },
        200,
    );
    let document = AccessControlEvaluator.load_stored(
        &folder,
        StoredAccessControlDocument {
            snapshot: sign_snapshot(&owner, &folder, 100),
            deltas: vec![grant_editor],
        },
    );
    let roles_before = document.roles();

    let escalation = sign_delta(
        &editor,
        &folder,
        RoleChange {
            subject: mallory.public_keys().clone(),
            role: Some(Role::Owner),
        },
        300,
    );
    assert!(!AccessControlEvaluator.is_delta_valid(&document, &escalation));
    assert_eq!(document.roles(), roles_before);
}

#[tokio::test]
async fn test_only_owner_changes_roles() {
    let owner = creator_context("acl-owner").await;
    let folder = owner.create_folder(&owner.root(), "team", &[]).await.unwrap();

    let editor_keys = CryptoKeySet::generate();
    let editor_id = editor_keys.id().clone();
    owner
        .update_access(&folder, editor_keys.public_keys().clone(), Some(Role::Editor))
        .await
        .unwrap();
    let editor = sharing_backing(&owner, editor_keys, None);

    let stranger = CryptoKeySet::generate();
    let err = editor
        .update_access(&folder, stranger.public_keys().clone(), Some(Role::Owner))
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::Unauthorized(_)));

    let roles = owner
        .access_control(&folder)
        .unwrap()
        .get_roles_by_crypto_key_set_id(&[editor_id.clone(), stranger.id().clone()])
        .await
        .unwrap();
    assert_eq!(roles[&editor_id], Some(Role::Editor));
    assert_eq!(roles[stranger.id()], None);

    // Editors may replace content the owner created.
    let note = child(&folder, "file_note");
    owner.write_file(&note, b"from owner".to_vec()).await.unwrap();
    editor.write_file(&note, b"from editor".to_vec()).await.unwrap();
    assert_eq!(owner.read_file(&note).await.unwrap(), b"from editor");
}

#[tokio::test]
async fn test_editor_cannot_create_items() {
    let owner = creator_context("acl-editor").await;
    let folder = owner.create_folder(&owner.root(), "team", &[]).await.unwrap();
    let editor_keys = CryptoKeySet::generate();
    owner
        .update_access(&folder, editor_keys.public_keys().clone(), Some(Role::Editor))
        .await
        .unwrap();
    let editor = sharing_backing(&owner, editor_keys, None);

    let err = editor
        .write_file(&child(&folder, "file_new"), b"fresh".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Untrusted);
    let err = editor.create_folder(&folder, "sub", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Untrusted);
    assert!(owner.list(&folder).await.unwrap().keys().all(|id| id.name() != "new"));
}

#[tokio::test]
async fn test_stale_version_conflicts() {
    let owner = creator_context("acl-stale").await;
    let folder = owner.create_folder(&owner.root(), "team", &[]).await.unwrap();
    let access = owner.access_control(&folder).unwrap();
    let seen = access.get_access_control_document().await.unwrap().version();

    let first = CryptoKeySet::generate();
    access
        .update_access(
            owner.keys(),
            RoleChange {
                subject: first.public_keys().clone(),
                role: Some(Role::Viewer),
            },
            seen,
        )
        .await
        .unwrap();

    let second = CryptoKeySet::generate();
    let err = access
        .update_access(
            owner.keys(),
            RoleChange {
                subject: second.public_keys().clone(),
                role: Some(Role::Viewer),
            },
            seen,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_viewer_cannot_write() {
    let owner = creator_context("acl-viewer").await;
    let folder = owner.create_folder(&owner.root(), "team", &[]).await.unwrap();
    let viewer_keys = CryptoKeySet::generate();
    owner
        .update_access(&folder, viewer_keys.public_keys().clone(), Some(Role::Viewer))
        .await
        .unwrap();
    let viewer = sharing_backing(&owner, viewer_keys, None);

    let err = viewer
        .write_file(&child(&folder, "file_note"), b"nope".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Untrusted);
    assert!(owner.list(&folder).await.unwrap().keys().all(|id| id.name() != "note"));
}

#[tokio::test]
async fn test_revoked_writer_history_stays_valid() {
    let owner_keys = CryptoKeySet::generate();
    let authority = Arc::new(CryptoKeySet::generate());
    let trust = Arc::new(TrustAnchor {
        root_creator: owner_keys.id().clone(),
        time_authority: Some(authority.public_keys().clone()),
    });
    let owner = StoreContext::new(
        owner_keys,
        Arc::new(InMemoryBacking::new(root_id("acl-history"))),
        Arc::new(MemoryLockStore::new()),
        trust,
    )
    .with_time_authority(TimeAuthority::new(authority.clone()));
    owner.init().await.unwrap();

    let folder = owner.create_folder(&owner.root(), "team", &[]).await.unwrap();
    let writer_keys = CryptoKeySet::generate();
    owner
        .update_access(&folder, writer_keys.public_keys().clone(), Some(Role::Appender))
        .await
        .unwrap();
    let writer = sharing_backing(&owner, writer_keys, Some(authority));

    let note = child(&folder, "file_note");
    writer.write_file(&note, b"signed while appender".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    owner
        .update_access(&folder, writer.keys().public_keys().clone(), None)
        .await
        .unwrap();
    assert_eq!(owner.read_file(&note).await.unwrap(), b"signed while appender");

    let err = writer
        .write_file(&note, b"after revocation".to_vec())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Untrusted);
    owner.shutdown().await;
}

/// A second principal working directly on `owner`'s backing.
fn sharing_backing(
    owner: &StoreContext,
    keys: CryptoKeySet,
    authority: Option<Arc<CryptoKeySet>>,
) -> StoreContext {
    let context = StoreContext::new(
        keys,
        owner.backing().clone(),
        Arc::new(MemoryLockStore::new()),
        owner.trust().clone(),
    );
    match authority {
        Some(authority) => context.with_time_authority(TimeAuthority::new(authority)),
        None => context,
    }
}
