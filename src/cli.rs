//! `syncstore` command line.
//!
//! A workspace keeps its identity and storage root under `.syncstore/`.
//! Store paths on the command line are relative to the storage root, e.g.
//! `folder_docs/file_readme`; an empty path names the root.

use crate::config::{ConfigLoader, SyncStoreConfig};
use crate::context::StoreContext;
use crate::crypto::{CryptoKeySet, StoredKeySet};
use crate::store::ItemMetadata;
use crate::sync::{HttpRemoteAccessor, SyncReport};
use crate::tree::SyncablePath;
use crate::types::{CryptoKeySetId, ItemId, ItemType, StorageRootId};
use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use comfy_table::Table;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const STATE_DIR: &str = ".syncstore";
const IDENTITY_FILE: &str = "identity.json";
const ROOT_FILE: &str = "root.json";

/// syncstore - encrypted content-addressed store with push/pull sync
#[derive(Parser)]
#[command(name = "syncstore")]
#[command(about = "Syncable encrypted content-addressed store")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable logging (default: off)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create an identity and a storage root in this workspace
    Init {
        /// Name the storage root is registered under
        #[arg(long)]
        name: Option<String>,
        /// Join an existing storage root instead of creating one
        #[arg(long)]
        storage_root: Option<String>,
        /// Creator of the joined storage root
        #[arg(long, requires = "storage_root")]
        creator: Option<String>,
        /// Overwrite an existing identity
        #[arg(long)]
        force: bool,
    },
    /// List a folder
    Ls {
        #[arg(default_value = "")]
        path: String,
    },
    /// Store a local file at a store path
    Put { path: String, source: PathBuf },
    /// Print a file
    Cat { path: String },
    /// Create a folder (or a bundle with --bundle)
    Mkdir {
        path: String,
        #[arg(long)]
        bundle: bool,
    },
    /// Mark an item deleted (or delete it right away with --now)
    Rm {
        path: String,
        #[arg(long)]
        now: bool,
    },
    /// Physically remove items marked deleted
    Sweep,
    /// Pull from the remote
    Pull {
        #[arg(default_value = "")]
        path: String,
        /// Remote base URL (overrides config)
        #[arg(long)]
        remote: Option<String>,
    },
    /// Push to the remote
    Push {
        #[arg(default_value = "")]
        path: String,
        /// Remote base URL (overrides config)
        #[arg(long)]
        remote: Option<String>,
    },
}

/// Persisted description of the workspace's storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootInfo {
    pub storage_root_id: StorageRootId,
    pub root_creator: CryptoKeySetId,
    pub name: String,
}

/// Load configuration for `workspace`, resolving relative storage paths
/// against it.
pub fn load_config(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<SyncStoreConfig> {
    let mut config = match config_path {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load(workspace)?,
    };
    if config.storage.root_path.is_relative() {
        config.storage.root_path = workspace.join(&config.storage.root_path);
    }
    if config.lock.dir.is_relative() {
        config.lock.dir = workspace.join(&config.lock.dir);
    }
    Ok(config)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<T> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("Malformed {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(value)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Resolve a root-relative path such as `folder_docs/file_readme`.
pub fn resolve_path(root: &StorageRootId, relative: &str) -> anyhow::Result<SyncablePath> {
    let relative = relative.trim_matches('/');
    let full = if relative.is_empty() {
        root.to_string()
    } else {
        format!("{}/{}", root, relative)
    };
    Ok(full.parse()?)
}

/// Everything a command needs once the workspace is initialized.
pub struct RunContext {
    store: StoreContext,
    config: SyncStoreConfig,
    root: RootInfo,
}

impl RunContext {
    pub async fn open(workspace: &Path, config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = load_config(workspace, config_path)?;
        let state = workspace.join(STATE_DIR);
        let stored: StoredKeySet = read_json(&state.join(IDENTITY_FILE))
            .context("Workspace is not initialized; run `syncstore init`")?;
        let root: RootInfo = read_json(&state.join(ROOT_FILE))?;
        let keys = CryptoKeySet::from_stored(&stored)?;

        let store = StoreContext::from_config(
            &config,
            keys,
            root.storage_root_id.clone(),
            root.root_creator.clone(),
        )
        .await?;
        store.init().await?;
        Ok(Self {
            store,
            config,
            root,
        })
    }

    pub fn store(&self) -> &StoreContext {
        &self.store
    }

    fn path(&self, relative: &str) -> anyhow::Result<SyncablePath> {
        resolve_path(&self.root.storage_root_id, relative)
    }

    fn remote(&self, url: Option<&String>) -> anyhow::Result<Arc<HttpRemoteAccessor>> {
        let Some(url) = url.or(self.config.remote.url.as_ref()) else {
            bail!("No remote configured; pass --remote or set remote.url");
        };
        Ok(Arc::new(HttpRemoteAccessor::new(url.clone())?))
    }

    /// Run one command. `Init` is handled by [`init_workspace`].
    pub async fn execute(&self, command: &Commands) -> anyhow::Result<String> {
        match command {
            Commands::Init { .. } => bail!("Workspace is already initialized"),
            Commands::Ls { path } => {
                let path = self.path(path)?;
                let children = self.store.list(&path).await?;
                Ok(format_listing(&children))
            }
            Commands::Put { path, source } => {
                let path = self.path(path)?;
                let data = std::fs::read(source)
                    .with_context(|| format!("Failed to read {}", source.display()))?;
                let hash = self.store.write_file(&path, data).await?;
                Ok(format!("{} {}", hash, path))
            }
            Commands::Cat { path } => {
                let data = self.store.read_file(&self.path(path)?).await?;
                Ok(String::from_utf8_lossy(&data).into_owned())
            }
            Commands::Mkdir { path, bundle } => {
                let path = self.path(path)?;
                let (Some(parent), Some(id)) = (path.parent(), path.last_id()) else {
                    bail!("The storage root already exists");
                };
                let created = match (*bundle, id.item_type()) {
                    (true, _) | (false, ItemType::Bundle) => {
                        self.store.create_bundle(&parent, id.name()).await?
                    }
                    (false, ItemType::Folder) => self.store.create_folder(&parent, id.name(), &[]).await?,
                    (false, ItemType::File) => bail!("{} names a file", path),
                };
                Ok(format!("Created {}", created))
            }
            Commands::Rm { path, now } => {
                let path = self.path(path)?;
                if *now {
                    self.store.delete(&path).await?;
                    Ok(format!("Deleted {}", path))
                } else {
                    self.store.mark_deleted(&path).await?;
                    Ok(format!("Marked {} deleted", path))
                }
            }
            Commands::Sweep => {
                let swept = self.store.sweep().await?;
                Ok(format!("Swept {} item(s)", swept))
            }
            Commands::Pull { path, remote } => {
                let engine = self.store.sync_engine(self.remote(remote.as_ref())?);
                let report = engine.pull(&self.path(path)?).await?;
                Ok(format_report(&report))
            }
            Commands::Push { path, remote } => {
                let engine = self.store.sync_engine(self.remote(remote.as_ref())?);
                engine
                    .ensure_registered(&self.root.name, self.store.keys().public_keys())
                    .await?;
                let report = engine.push(&self.path(path)?).await?;
                Ok(format_report(&report))
            }
        }
    }

    pub async fn shutdown(&self) {
        self.store.shutdown().await;
    }
}

/// Create `.syncstore/identity.json` and `.syncstore/root.json`.
pub async fn init_workspace(
    workspace: &Path,
    config_path: Option<&Path>,
    name: Option<&str>,
    storage_root: Option<&str>,
    creator: Option<&str>,
    force: bool,
) -> anyhow::Result<String> {
    let state = workspace.join(STATE_DIR);
    let identity_path = state.join(IDENTITY_FILE);
    if identity_path.exists() && !force {
        bail!(
            "{} already exists; pass --force to replace it",
            identity_path.display()
        );
    }

    let keys = CryptoKeySet::generate();
    let storage_root_id = match storage_root {
        Some(id) => StorageRootId::new(id)?,
        None => StorageRootId::generate(),
    };
    let root_creator = match creator {
        Some(id) => CryptoKeySetId::new(id)?,
        None => keys.id().clone(),
    };
    let root = RootInfo {
        name: name.map(str::to_string).unwrap_or_else(|| storage_root_id.to_string()),
        storage_root_id,
        root_creator,
    };
    write_json(&identity_path, &keys.to_stored())?;
    write_json(&state.join(ROOT_FILE), &root)?;
    info!(storage_root = %root.storage_root_id, identity = %keys.id(), "Initialized workspace");

    let run = RunContext::open(workspace, config_path).await?;
    run.shutdown().await;
    Ok(format!(
        "Initialized storage root {} ({}) with identity {}",
        root.storage_root_id,
        root.name,
        keys.id()
    ))
}

fn format_listing(children: &BTreeMap<ItemId, ItemMetadata>) -> String {
    if children.is_empty() {
        return "(empty)".to_string();
    }
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Name", "Type", "Hash", "Signed By"]);
    for (id, metadata) in children {
        let hash = if metadata.local.needs_recompute_hash {
            "(stale)".to_string()
        } else {
            metadata.hash.to_hex()[..12].to_string()
        };
        let signer = metadata
            .provenance
            .as_ref()
            .map(|p| p.origin.originator_public_key_set_id.to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            id.name().to_string(),
            id.item_type().to_string(),
            hash,
            signer,
        ]);
    }
    table.to_string()
}

fn format_report(report: &SyncReport) -> String {
    let mut table = Table::new();
    table.load_preset(comfy_table::presets::UTF8_FULL);
    table.set_header(vec!["Written", "Pushed", "Unchanged", "Failed"]);
    table.add_row(vec![
        report.written.to_string(),
        report.pushed.to_string(),
        report.unchanged.to_string(),
        report.failures.len().to_string(),
    ]);
    let mut output = table.to_string();
    for failure in &report.failures {
        output.push_str(&format!("\n{:?} {}: {}", failure.kind, failure.path, failure.message));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_path() {
        let root = StorageRootId::new("sr-cli").unwrap();
        assert!(resolve_path(&root, "").unwrap().is_root());
        let path = resolve_path(&root, "/folder_docs/file_readme/").unwrap();
        assert_eq!(path.to_string(), "sr-cli/folder_docs/file_readme");
        assert!(resolve_path(&root, "docs").is_err());
    }

    #[tokio::test]
    async fn test_init_then_put_and_cat() {
        let workspace = TempDir::new().unwrap();
        let config_path = workspace.path().join("syncstore.toml");
        std::fs::write(&config_path, "[storage]\nbackend = \"filesystem\"\n[lock]\nbackend = \"memory\"\n")
            .unwrap();
        let source = workspace.path().join("hello.txt");
        std::fs::write(&source, "hello store").unwrap();

        init_workspace(workspace.path(), Some(&config_path), Some("alice"), None, None, false)
            .await
            .unwrap();
        let run = RunContext::open(workspace.path(), Some(&config_path)).await.unwrap();
        run.execute(&Commands::Mkdir {
            path: "folder_docs".to_string(),
            bundle: false,
        })
        .await
        .unwrap();
        run.execute(&Commands::Put {
            path: "folder_docs/file_hello".to_string(),
            source,
        })
        .await
        .unwrap();
        let output = run
            .execute(&Commands::Cat {
                path: "folder_docs/file_hello".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(output, "hello store");

        let listing = run
            .execute(&Commands::Ls {
                path: "folder_docs".to_string(),
            })
            .await
            .unwrap();
        assert!(listing.contains("hello"));
        run.shutdown().await;
    }
}
