//! CLI command implementations.

use clap::ValueEnum;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tasksync_auth::{AuthError, TokenSigner, TokenType};
use tasksync_offline::{
    ConflictRecord, FileStore, OfflineError, OfflineQueue, OperationKind, Resolution,
    ResolutionOutcome, StoreError, SyncQueueItem, WsClient,
};
use tasksync_types::ResourceKind;
use thiserror::Error;

/// CLI errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Offline(#[from] OfflineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Mutation to queue.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OpArg {
    Create,
    Update,
    Delete,
}

impl From<OpArg> for OperationKind {
    fn from(op: OpArg) -> Self {
        match op {
            OpArg::Create => OperationKind::Create,
            OpArg::Update => OperationKind::Update,
            OpArg::Delete => OperationKind::Delete,
        }
    }
}

/// Resource kind.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Task,
    Category,
    Tag,
}

impl From<KindArg> for ResourceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Task => ResourceKind::Task,
            KindArg::Category => ResourceKind::Category,
            KindArg::Tag => ResourceKind::Tag,
        }
    }
}

/// Winning side of a conflict.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KeepSide {
    Local,
    Remote,
}

impl From<KeepSide> for Resolution {
    fn from(side: KeepSide) -> Self {
        match side {
            KeepSide::Local => Resolution::KeepLocal,
            KeepSide::Remote => Resolution::KeepRemote,
        }
    }
}

fn open_queue(store: &Path) -> Result<OfflineQueue> {
    let store = FileStore::open(store)?;
    Ok(OfflineQueue::new(Arc::new(store)))
}

/// Generate a signing key pair.
pub fn keys_generate(output: Option<&Path>) -> Result<()> {
    let signer = TokenSigner::generate();

    println!("Generated signing key:");
    println!("  Verification Key: {}", signer.verification_key_hex());

    if let Some(path) = output {
        std::fs::write(path, signer.secret_hex())?;
        println!("\nSecret key saved to: {}", path.display());
        println!("WARNING: Keep this file secure and never share it!");
    }

    Ok(())
}

/// Issue a token signed with the secret key in `key`.
pub fn token_issue(key: &Path, user: &str, ttl: u64, refresh: bool) -> Result<()> {
    let secret = std::fs::read_to_string(key)?;
    let signer = TokenSigner::from_hex(secret.trim())?;
    let typ = if refresh {
        TokenType::Refresh
    } else {
        TokenType::Access
    };

    tracing::info!(user = %user, ttl, ?typ, "Issuing token");
    println!("{}", signer.issue(user, typ, ttl)?);
    Ok(())
}

fn print_item(item: &SyncQueueItem) {
    let mut line = format!(
        "{:>5}  {}  {:<7} {:<8} {:<20} {}",
        item.sequence,
        item.id,
        item.kind.to_string(),
        item.resource_kind.to_string(),
        item.resource_id,
        item.status
    );
    if item.retry_count > 0 {
        line.push_str(&format!(" (retries: {})", item.retry_count));
    }
    if let Some(error) = &item.last_error {
        line.push_str(&format!(" - {}", error));
    }
    println!("{line}");
}

/// List queued mutations.
pub fn queue_list(store: &Path) -> Result<()> {
    let queue = open_queue(store)?;
    let items = queue.items()?;
    if items.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for item in &items {
        print_item(item);
    }
    Ok(())
}

/// Queue a mutation.
pub fn queue_add(
    store: &Path,
    op: OpArg,
    kind: KindArg,
    id: &str,
    data: &str,
    base_version: Option<u64>,
) -> Result<()> {
    let payload: Value =
        serde_json::from_str(data).map_err(|e| CliError::InvalidData(e.to_string()))?;
    if !payload.is_object() {
        return Err(CliError::InvalidData("data must be a JSON object".into()));
    }

    let mut item = SyncQueueItem::new(op.into(), kind.into(), id, payload);
    if let Some(version) = base_version {
        item = item.with_base_version(version);
    }

    let item = open_queue(store)?.enqueue(item)?;
    print_item(&item);
    Ok(())
}

/// Return a failed item to the queue.
pub fn queue_retry(store: &Path, id: &str) -> Result<()> {
    let item = open_queue(store)?.retry_failed(id)?;
    println!("Requeued {}", item.id);
    Ok(())
}

/// Drop a failed item.
pub fn queue_discard(store: &Path, id: &str) -> Result<()> {
    let item = open_queue(store)?.discard(id)?;
    println!("Discarded {}", item.id);
    Ok(())
}

/// Compact the queue log.
pub fn queue_compact(store: &Path) -> Result<()> {
    let store = FileStore::open(store)?;
    let before = store.stats();
    store.compact()?;
    let after = store.stats();
    println!("Compacted {} records into {}", before.records, after.records);
    Ok(())
}

fn print_conflict(conflict: &ConflictRecord) {
    let remote = match &conflict.remote {
        Some(remote) => remote.to_string(),
        None => "<deleted>".to_string(),
    };
    let state = match conflict.resolution {
        Some(resolution) => resolution.to_string(),
        None => "unresolved".to_string(),
    };
    println!(
        "{}  {} {} {}  [{}]",
        conflict.id, conflict.operation, conflict.resource_kind, conflict.resource_id, state
    );
    println!("    local:  {}", conflict.local);
    println!("    remote: {}", remote);
}

/// List conflicts.
pub fn conflicts_list(store: &Path, all: bool) -> Result<()> {
    let queue = open_queue(store)?;
    let conflicts = if all {
        queue.resolver().all()?
    } else {
        queue.resolver().unresolved()?
    };
    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }
    for conflict in &conflicts {
        print_conflict(conflict);
    }
    Ok(())
}

/// Resolve a conflict.
pub fn conflicts_resolve(store: &Path, id: &str, keep: KeepSide) -> Result<()> {
    let queue = open_queue(store)?;
    match queue.resolver().resolve(id, keep.into())? {
        ResolutionOutcome::Requeued(item) => {
            println!("Local change requeued as {}; run `tasksync sync` to send it.", item.id);
        }
        ResolutionOutcome::AcceptRemote {
            resource_kind,
            resource_id,
            ..
        } => {
            println!("Kept server state of {} {}.", resource_kind, resource_id);
        }
    }
    Ok(())
}

/// Replay the queue to a node.
pub async fn sync(store: &Path, url: &str, token: &str) -> Result<()> {
    let queue = open_queue(store)?;
    if queue.pending()?.is_empty() {
        println!("Nothing to sync.");
        return Ok(());
    }

    let (client, _events) = WsClient::connect_with_retry(url, token, queue.policy()).await?;
    let report = queue.replay(&client).await?;

    println!(
        "Synced {}, conflicts {}, failed {}, still pending {} ({} rounds)",
        report.synced.len(),
        report.conflicts.len(),
        report.failed.len(),
        report.deferred + report.held_back,
        report.rounds
    );
    for conflict in &report.conflicts {
        print_conflict(conflict);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasksync_offline::ItemStatus;

    #[test]
    fn test_queue_add_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.log");

        queue_add(&path, OpArg::Create, KindArg::Task, "t1", r#"{"title":"A"}"#, None).unwrap();
        queue_add(&path, OpArg::Update, KindArg::Task, "t1", r#"{"done":true}"#, Some(1)).unwrap();

        let items = open_queue(&path).unwrap().items().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].base_version, Some(1));
        assert_eq!(items[0].status, ItemStatus::Pending);
    }

    #[test]
    fn test_queue_add_rejects_non_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.log");
        assert!(matches!(
            queue_add(&path, OpArg::Create, KindArg::Tag, "g1", "[1,2]", None),
            Err(CliError::InvalidData(_))
        ));
        assert!(matches!(
            queue_add(&path, OpArg::Create, KindArg::Tag, "g1", "{", None),
            Err(CliError::InvalidData(_))
        ));
    }

    #[test]
    fn test_discard_requires_failed_item() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.log");
        queue_add(&path, OpArg::Delete, KindArg::Category, "c1", "{}", None).unwrap();
        let id = open_queue(&path).unwrap().items().unwrap()[0].id.clone();

        assert!(queue_discard(&path, &id).is_err());
        assert!(queue_retry(&path, &id).is_err());
        assert!(conflicts_resolve(&path, "missing", KeepSide::Local).is_err());
    }

    #[test]
    fn test_generated_key_issues_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("signing.key");
        keys_generate(Some(&key)).unwrap();
        token_issue(&key, "alice", 60, false).unwrap();
        token_issue(&key, "alice", 60, true).unwrap();
    }
}
