//! Item provenance: signing and verification.
//!
//! An item's origin signature covers its path, its type and (for files) its
//! content hash. It is valid when the signer could originate items (appender
//! or owner) in the nearest enclosing folder's access control document at
//! signing time. Replacement content carries the original creation signature
//! next to the replacing one; the replacing signer needs only a writer role.
//! With a trusted time stamp the document is evaluated as of that time,
//! otherwise its latest state is used.

use crate::access::{AccessControl, AccessControlDocument, Role, TrustAnchor};
use crate::crypto::{CryptoKeySet, PublicKeySet};
use crate::error::{AccessError, CryptoError};
use crate::store::{
    ItemMetadata, OriginalProvenance, ProvenanceOrigin, StoreBacking, SyncableProvenance,
    TrustedTimeSignature,
};
use crate::tree::SyncablePath;
use crate::types::{now_msec, Hash, ItemType};
use std::sync::Arc;

fn provenance_message(path: &SyncablePath, item_type: ItemType, hash: Option<&Hash>) -> Vec<u8> {
    format!(
        "syncable-store/provenance/v1\n{}\n{}\n{}",
        path,
        item_type,
        hash.map(Hash::to_hex).unwrap_or_default()
    )
    .into_bytes()
}

fn replacement_message(path: &SyncablePath, hash: &Hash, original_hash: &Hash) -> Vec<u8> {
    format!(
        "syncable-store/provenance-replace/v1\n{}\n{}\n{}",
        path,
        hash.to_hex(),
        original_hash.to_hex()
    )
    .into_bytes()
}

fn time_message(origin: &ProvenanceOrigin, time_msec: i64) -> Vec<u8> {
    let mut message = format!("syncable-store/trusted-time/v1\n{}\n", time_msec).into_bytes();
    message.extend_from_slice(origin.signature.as_bytes());
    message
}

/// Sign `path` into existence. `hash` is required for files and ignored otherwise.
pub fn sign_item(
    keys: &CryptoKeySet,
    path: &SyncablePath,
    hash: Option<&Hash>,
    trusted_time_signature: Option<TrustedTimeSignature>,
) -> SyncableProvenance {
    let item_type = path.item_type();
    let hash = hash.filter(|_| item_type == ItemType::File);
    SyncableProvenance {
        origin: ProvenanceOrigin {
            signature: keys.sign(&provenance_message(path, item_type, hash)),
            originator_public_key_set_id: keys.id().clone(),
        },
        trusted_time_signature,
        replaces: None,
    }
}

/// Sign new content `hash` for the existing file at `path`.
///
/// `previous` is the provenance of the content being replaced and
/// `previous_hash` its hash. The original creation signature is carried
/// forward across any number of replacements.
pub fn sign_replacement(
    keys: &CryptoKeySet,
    path: &SyncablePath,
    hash: &Hash,
    previous: &SyncableProvenance,
    previous_hash: Hash,
) -> SyncableProvenance {
    let original = previous.replaces.clone().unwrap_or_else(|| {
        Box::new(OriginalProvenance {
            hash: previous_hash,
            origin: previous.origin.clone(),
            trusted_time_signature: previous.trusted_time_signature.clone(),
        })
    });
    SyncableProvenance {
        origin: ProvenanceOrigin {
            signature: keys.sign(&replacement_message(path, hash, &original.hash)),
            originator_public_key_set_id: keys.id().clone(),
        },
        trusted_time_signature: None,
        replaces: Some(original),
    }
}

/// Issues trusted time stamps over origin signatures.
pub struct TimeAuthority {
    keys: Arc<CryptoKeySet>,
}

impl TimeAuthority {
    pub fn new(keys: Arc<CryptoKeySet>) -> Self {
        Self { keys }
    }

    pub fn stamp(&self, origin: &ProvenanceOrigin) -> TrustedTimeSignature {
        self.stamp_at(origin, now_msec())
    }

    pub fn stamp_at(&self, origin: &ProvenanceOrigin, time_msec: i64) -> TrustedTimeSignature {
        TrustedTimeSignature {
            time_msec,
            signer: self.keys.id().clone(),
            signature: self.keys.sign(&time_message(origin, time_msec)),
        }
    }

    /// Attach a stamp to `provenance`.
    pub fn attest(&self, mut provenance: SyncableProvenance) -> SyncableProvenance {
        provenance.trusted_time_signature = Some(self.stamp(&provenance.origin));
        provenance
    }
}

/// The attested signing time, if the provenance carries a valid stamp.
///
/// A stamp from an unknown signer or with a bad signature is `Untrusted`
/// rather than ignored.
pub fn verify_trusted_time(
    trust: &TrustAnchor,
    origin: &ProvenanceOrigin,
    stamp: Option<&TrustedTimeSignature>,
) -> Result<Option<i64>, AccessError> {
    let Some(stamp) = stamp else {
        return Ok(None);
    };
    let authority = trust
        .time_authority
        .as_ref()
        .filter(|authority| authority.id == stamp.signer)
        .ok_or_else(|| {
            AccessError::Untrusted(format!("time stamp from unknown authority {}", stamp.signer))
        })?;
    authority
        .verify(&time_message(origin, stamp.time_msec), &stamp.signature)
        .map_err(|_| AccessError::Untrusted("bad trusted time signature".to_string()))?;
    Ok(Some(stamp.time_msec))
}

/// Keys of `origin`'s signer if it held a role accepted by `allowed` at
/// the (attested) signing time.
fn authorized_signer<'d>(
    trust: &TrustAnchor,
    document: &'d AccessControlDocument,
    path: &SyncablePath,
    origin: &ProvenanceOrigin,
    stamp: Option<&TrustedTimeSignature>,
    allowed: fn(Role) -> bool,
) -> Result<&'d PublicKeySet, AccessError> {
    let time = verify_trusted_time(trust, origin, stamp)?;
    let signer = &origin.originator_public_key_set_id;
    let role = document.role_at(signer, time);
    if !role.map_or(false, allowed) {
        return Err(AccessError::Untrusted(format!(
            "{} held no sufficient role in {} when signing {}",
            signer,
            document.folder(),
            path
        )));
    }
    document
        .public_keys_for(signer)
        .ok_or_else(|| AccessError::Untrusted(format!("unknown signer {}", signer)))
}

/// Pure check of `metadata`'s provenance against an already verified
/// document of the nearest enclosing folder.
pub fn verify_against_document(
    trust: &TrustAnchor,
    document: &AccessControlDocument,
    path: &SyncablePath,
    metadata: &ItemMetadata,
) -> Result<(), AccessError> {
    let provenance = metadata
        .provenance
        .as_ref()
        .ok_or_else(|| AccessError::Untrusted(format!("{} has no provenance", path)))?;
    let bad_signature = |_: CryptoError| AccessError::Untrusted(format!("bad provenance signature on {}", path));

    let Some(original) = &provenance.replaces else {
        let keys = authorized_signer(
            trust,
            document,
            path,
            &provenance.origin,
            provenance.trusted_time_signature.as_ref(),
            Role::can_originate,
        )?;
        let hash = (metadata.item_type == ItemType::File).then_some(&metadata.hash);
        return keys
            .verify(
                &provenance_message(path, metadata.item_type, hash),
                &provenance.origin.signature,
            )
            .map_err(bad_signature);
    };

    if metadata.item_type != ItemType::File {
        return Err(AccessError::Untrusted(format!(
            "{} is not a file and cannot carry replaced content",
            path
        )));
    }
    let creator = authorized_signer(
        trust,
        document,
        path,
        &original.origin,
        original.trusted_time_signature.as_ref(),
        Role::can_originate,
    )?;
    creator
        .verify(
            &provenance_message(path, ItemType::File, Some(&original.hash)),
            &original.origin.signature,
        )
        .map_err(bad_signature)?;

    let replacer = authorized_signer(
        trust,
        document,
        path,
        &provenance.origin,
        provenance.trusted_time_signature.as_ref(),
        Role::can_write,
    )?;
    replacer
        .verify(
            &replacement_message(path, &metadata.hash, &original.hash),
            &provenance.origin.signature,
        )
        .map_err(bad_signature)
}

/// Verifies provenance of stored or incoming items.
#[derive(Clone)]
pub struct ProvenanceVerifier {
    backing: Arc<dyn StoreBacking>,
    trust: Arc<TrustAnchor>,
}

impl ProvenanceVerifier {
    pub fn new(backing: Arc<dyn StoreBacking>, trust: Arc<TrustAnchor>) -> Self {
        Self { backing, trust }
    }

    /// Verify `metadata` as the metadata of `path`.
    ///
    /// The root is trusted through registration. Access control documents
    /// are self-certifying, so they are checked by verifying the document.
    pub async fn verify(&self, path: &SyncablePath, metadata: &ItemMetadata) -> Result<(), AccessError> {
        if path.is_root() {
            return Ok(());
        }
        if metadata.item_type != path.item_type() {
            return Err(AccessError::Untrusted(format!(
                "{} claims type {}",
                path, metadata.item_type
            )));
        }
        if path.is_access_control_document() {
            AccessControl::for_path(self.backing.clone(), path, self.trust.clone())?
                .get_access_control_document()
                .await?;
            return Ok(());
        }

        let folder = path
            .nearest_enclosing_folder()
            .ok_or_else(|| AccessError::Untrusted(format!("{} has no enclosing folder", path)))?;
        let document = AccessControl::new(self.backing.clone(), folder, self.trust.clone())?
            .get_access_control_document()
            .await?;
        verify_against_document(&self.trust, &document, path, metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::document::{sign_delta, sign_snapshot};
    use crate::access::{AccessControlEvaluator, RoleChange, StoredAccessControlDocument};
    use crate::store::LocalItemMetadata;
    use crate::tree::hasher::compute_file_hash;

    fn setup(creator: &CryptoKeySet, deltas: Vec<crate::access::AccessControlDelta>) -> AccessControlDocument {
        let folder: SyncablePath = "sr-p/folder_f".parse().unwrap();
        AccessControlEvaluator.load_stored(
            &folder,
            StoredAccessControlDocument {
                snapshot: sign_snapshot(creator, &folder, 10),
                deltas,
            },
        )
    }

    fn file_metadata(provenance: SyncableProvenance, data: &[u8]) -> ItemMetadata {
        ItemMetadata {
            item_type: ItemType::File,
            name: "x".to_string(),
            hash: compute_file_hash(data),
            provenance: Some(provenance),
            local: LocalItemMetadata::default(),
        }
    }

    fn trust(creator: &CryptoKeySet, authority: Option<&CryptoKeySet>) -> TrustAnchor {
        TrustAnchor {
            root_creator: creator.id().clone(),
            time_authority: authority.map(|a| a.public_keys().clone()),
        }
    }

    #[test]
    fn test_creator_signed_file_verifies() {
        let creator = CryptoKeySet::generate();
        let document = setup(&creator, vec![]);
        let path: SyncablePath = "sr-p/folder_f/file_x".parse().unwrap();
        let hash = compute_file_hash(b"data");
        let metadata = file_metadata(sign_item(&creator, &path, Some(&hash), None), b"data");

        assert!(verify_against_document(&trust(&creator, None), &document, &path, &metadata).is_ok());

        let moved: SyncablePath = "sr-p/folder_f/file_y".parse().unwrap();
        assert!(verify_against_document(&trust(&creator, None), &document, &moved, &metadata).is_err());
    }

    #[test]
    fn test_viewer_signature_is_untrusted() {
        let creator = CryptoKeySet::generate();
        let viewer = CryptoKeySet::generate();
        let folder: SyncablePath = "sr-p/folder_f".parse().unwrap();
        let grant = sign_delta(
            &creator,
            &folder,
            RoleChange {
                subject: viewer.public_keys().clone(),
                role: Some(Role::Viewer),
            },
            20,
        );
        let document = setup(&creator, vec![grant]);
        let path: SyncablePath = "sr-p/folder_f/file_x".parse().unwrap();
        let hash = compute_file_hash(b"data");
        let metadata = file_metadata(sign_item(&viewer, &path, Some(&hash), None), b"data");

        let err = verify_against_document(&trust(&creator, None), &document, &path, &metadata).unwrap_err();
        assert!(matches!(err, AccessError::Untrusted(_)));
    }

    #[test]
    fn test_trusted_time_pins_evaluation() {
        let creator = CryptoKeySet::generate();
        let appender = CryptoKeySet::generate();
        let authority = Arc::new(CryptoKeySet::generate());
        let folder: SyncablePath = "sr-p/folder_f".parse().unwrap();
        let deltas = vec![
            sign_delta(
                &creator,
                &folder,
                RoleChange {
                    subject: appender.public_keys().clone(),
                    role: Some(Role::Appender),
                },
                20,
            ),
            sign_delta(
                &creator,
                &folder,
                RoleChange {
                    subject: appender.public_keys().clone(),
                    role: None,
                },
                40,
            ),
        ];
        let document = setup(&creator, deltas);
        let trust = trust(&creator, Some(authority.as_ref()));

        let path: SyncablePath = "sr-p/folder_f/file_x".parse().unwrap();
        let hash = compute_file_hash(b"data");
        let unstamped = sign_item(&appender, &path, Some(&hash), None);
        // Revoked in the latest state.
        assert!(verify_against_document(&trust, &document, &path, &file_metadata(unstamped.clone(), b"data")).is_err());

        let time_authority = TimeAuthority::new(authority);
        let mut stamped = unstamped;
        stamped.trusted_time_signature = Some(time_authority.stamp_at(&stamped.origin, 30));
        assert!(verify_against_document(&trust, &document, &path, &file_metadata(stamped, b"data")).is_ok());
    }

    fn grant(creator: &CryptoKeySet, subject: &CryptoKeySet, role: Role, at: i64) -> crate::access::AccessControlDelta {
        let folder: SyncablePath = "sr-p/folder_f".parse().unwrap();
        sign_delta(
            creator,
            &folder,
            RoleChange {
                subject: subject.public_keys().clone(),
                role: Some(role),
            },
            at,
        )
    }

    #[test]
    fn test_editor_cannot_originate_items() {
        let creator = CryptoKeySet::generate();
        let editor = CryptoKeySet::generate();
        let document = setup(&creator, vec![grant(&creator, &editor, Role::Editor, 20)]);
        let path: SyncablePath = "sr-p/folder_f/file_x".parse().unwrap();
        let hash = compute_file_hash(b"data");
        let metadata = file_metadata(sign_item(&editor, &path, Some(&hash), None), b"data");

        let err = verify_against_document(&trust(&creator, None), &document, &path, &metadata).unwrap_err();
        assert!(matches!(err, AccessError::Untrusted(_)));
    }

    #[test]
    fn test_editor_replaces_appender_content() {
        let creator = CryptoKeySet::generate();
        let appender = CryptoKeySet::generate();
        let editor = CryptoKeySet::generate();
        let document = setup(
            &creator,
            vec![
                grant(&creator, &appender, Role::Appender, 20),
                grant(&creator, &editor, Role::Editor, 21),
            ],
        );
        let trust = trust(&creator, None);
        let path: SyncablePath = "sr-p/folder_f/file_x".parse().unwrap();

        let first_hash = compute_file_hash(b"first");
        let first = sign_item(&appender, &path, Some(&first_hash), None);
        let second_hash = compute_file_hash(b"second");
        let second = sign_replacement(&editor, &path, &second_hash, &first, first_hash);
        assert!(verify_against_document(&trust, &document, &path, &file_metadata(second.clone(), b"second")).is_ok());

        // A further replacement still points at the appender's signature.
        let third_hash = compute_file_hash(b"third");
        let third = sign_replacement(&creator, &path, &third_hash, &second, second_hash);
        assert_eq!(third.replaces.as_ref().map(|o| o.hash), Some(first_hash));
        assert!(verify_against_document(&trust, &document, &path, &file_metadata(third, b"third")).is_ok());

        // Replacement signatures do not transfer to another path.
        let moved: SyncablePath = "sr-p/folder_f/file_y".parse().unwrap();
        assert!(verify_against_document(&trust, &document, &moved, &file_metadata(second, b"second")).is_err());
    }

    #[test]
    fn test_replacement_needs_originating_creator() {
        let creator = CryptoKeySet::generate();
        let editor = CryptoKeySet::generate();
        let document = setup(&creator, vec![grant(&creator, &editor, Role::Editor, 20)]);
        let path: SyncablePath = "sr-p/folder_f/file_x".parse().unwrap();

        // The editor fabricates an "original" of its own.
        let fake_hash = compute_file_hash(b"fake");
        let fake = sign_item(&editor, &path, Some(&fake_hash), None);
        let hash = compute_file_hash(b"data");
        let replacement = sign_replacement(&editor, &path, &hash, &fake, fake_hash);

        let err = verify_against_document(&trust(&creator, None), &document, &path, &file_metadata(replacement, b"data"))
            .unwrap_err();
        assert!(matches!(err, AccessError::Untrusted(_)));
    }
}
