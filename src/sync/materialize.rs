//! Writing received item descriptions into a local store.
//!
//! A folder's access control document is written before any sibling, since
//! every sibling's provenance is verified against it. The remaining children
//! are written concurrently; a failing branch is recorded and does not stop
//! its siblings. Creating something that already exists with the same
//! content counts as already synchronized.

use crate::access::{AccessControl, ProvenanceVerifier, TrustAnchor};
use crate::error::{StoreError, SyncError};
use crate::store::{NewFile, NewFolder, StoreBacking};
use crate::sync::ItemDescription;
use crate::tree::hasher::compute_file_hash;
use crate::tree::path::is_access_control_id;
use crate::tree::SyncablePath;
use crate::types::{ItemId, ItemType};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Effect of writing a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    /// A file whose content differed was replaced.
    Replaced,
    /// Already present with the same content.
    Unchanged,
}

#[derive(Debug, Default)]
pub struct MaterializeReport {
    pub created: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub failures: Vec<(SyncablePath, SyncError)>,
}

impl MaterializeReport {
    pub fn record(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Created => self.created += 1,
            WriteOutcome::Replaced => self.replaced += 1,
            WriteOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn merge(&mut self, other: MaterializeReport) {
        self.created += other.created;
        self.replaced += other.replaced;
        self.unchanged += other.unchanged;
        self.failures.extend(other.failures);
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Nothing was written.
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.replaced == 0 && self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct Materializer {
    backing: Arc<dyn StoreBacking>,
    trust: Arc<TrustAnchor>,
    verifier: ProvenanceVerifier,
}

impl Materializer {
    pub fn new(backing: Arc<dyn StoreBacking>, trust: Arc<TrustAnchor>) -> Self {
        let verifier = ProvenanceVerifier::new(backing.clone(), trust.clone());
        Self {
            backing,
            trust,
            verifier,
        }
    }

    pub fn backing(&self) -> &Arc<dyn StoreBacking> {
        &self.backing
    }

    /// Write one node without touching its children.
    pub async fn write_item(
        &self,
        path: &SyncablePath,
        item: &ItemDescription,
    ) -> Result<WriteOutcome, SyncError> {
        let metadata = &item.metadata;
        if metadata.item_type != path.item_type() {
            return Err(SyncError::Untrusted(format!(
                "{} described as {}",
                path, metadata.item_type
            )));
        }
        if path.is_root() {
            return Ok(WriteOutcome::Unchanged);
        }

        match metadata.item_type {
            ItemType::File => self.write_file(path, item).await,
            ItemType::Folder | ItemType::Bundle => {
                self.verifier.verify(path, metadata).await?;
                match self
                    .backing
                    .create_folder_with_path(
                        path,
                        NewFolder {
                            provenance: metadata.provenance.clone(),
                        },
                    )
                    .await
                {
                    Ok(()) => Ok(WriteOutcome::Created),
                    Err(err) if err.is_conflict() => Ok(WriteOutcome::Unchanged),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    async fn write_file(
        &self,
        path: &SyncablePath,
        item: &ItemDescription,
    ) -> Result<WriteOutcome, SyncError> {
        let metadata = &item.metadata;
        let data = item
            .data
            .as_ref()
            .ok_or_else(|| SyncError::Generic(format!("no data sent for file {}", path)))?;
        if compute_file_hash(data) != metadata.hash {
            return Err(SyncError::Untrusted(format!("content of {} does not match its hash", path)));
        }

        let local_hash = match self.backing.get_metadata_at_path(path).await {
            Ok(local) => Some(local.hash),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };
        if local_hash == Some(metadata.hash) {
            return Ok(WriteOutcome::Unchanged);
        }

        if path.is_access_control_document() {
            AccessControl::for_path(self.backing.clone(), path, self.trust.clone())?
                .accept_remote_document(data, metadata.provenance.clone())
                .await?;
            return Ok(if local_hash.is_some() {
                WriteOutcome::Replaced
            } else {
                WriteOutcome::Created
            });
        }

        self.verifier.verify(path, metadata).await?;
        let file = NewFile {
            data: data.clone(),
            provenance: metadata.provenance.clone(),
        };
        match local_hash {
            None => match self.backing.create_binary_file_with_path(path, file.clone()).await {
                Ok(()) => Ok(WriteOutcome::Created),
                // Lost a race with another writer of the same path.
                Err(StoreError::Conflict(_)) => self.replace_file(path, file).await,
                Err(err) => Err(err.into()),
            },
            Some(expected) => {
                self.backing
                    .update_binary_file_at_path(path, file, Some(expected))
                    .await?;
                Ok(WriteOutcome::Replaced)
            }
        }
    }

    async fn replace_file(&self, path: &SyncablePath, file: NewFile) -> Result<WriteOutcome, SyncError> {
        let local = self.backing.get_metadata_at_path(path).await?;
        if local.hash == compute_file_hash(&file.data) {
            return Ok(WriteOutcome::Unchanged);
        }
        self.backing
            .update_binary_file_at_path(path, file, Some(local.hash))
            .await?;
        Ok(WriteOutcome::Replaced)
    }

    /// Write `item` and everything under it.
    ///
    /// An error means `path` itself could not be written; failures below it
    /// are collected in the report.
    pub fn materialize<'a>(
        &'a self,
        path: &'a SyncablePath,
        item: &'a ItemDescription,
    ) -> BoxFuture<'a, Result<MaterializeReport, SyncError>> {
        async move {
            let mut report = MaterializeReport::default();
            report.record(self.write_item(path, item).await?);
            debug!(path = %path, "Materialized item");

            let Some(children) = &item.items_by_id else {
                return Ok(report);
            };
            let (documents, rest): (Vec<_>, Vec<_>) =
                children.iter().partition(|(id, _)| is_access_control_id(id));

            for (id, child) in documents {
                report.merge(self.materialize_child(path, id, child).await);
            }
            let siblings = join_all(
                rest.into_iter()
                    .map(|(id, child)| self.materialize_child(path, id, child)),
            )
            .await;
            for sibling in siblings {
                report.merge(sibling);
            }
            Ok(report)
        }
        .boxed()
    }

    async fn materialize_child(
        &self,
        parent: &SyncablePath,
        id: &ItemId,
        child: &ItemDescription,
    ) -> MaterializeReport {
        let child_path = match parent.append(id.clone()) {
            Ok(child_path) => child_path,
            Err(err) => {
                let mut report = MaterializeReport::default();
                report.failures.push((parent.clone(), err.into()));
                return report;
            }
        };
        match self.materialize(&child_path, child).await {
            Ok(report) => report,
            Err(err) => {
                warn!(path = %child_path, error = %err, "Failed to materialize branch");
                let mut report = MaterializeReport::default();
                report.failures.push((child_path, err));
                report
            }
        }
    }
}
