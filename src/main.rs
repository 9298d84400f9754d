use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flowcache_artifact::FsStore;
use flowcache_bus::{BroadcastBus, CompletionStatus, Envelope};
use flowcache_config::{CacheConfig, StoreConfig};
use flowcache_lock::SqliteLockBackend;
use flowcache_runtime::{
  AsyncTask, CacheComponents, Lookup, TaskCacheManager, TaskContext, TaskError, derive_hash,
  derive_hash_bytes,
};
use flowcache_store::{SqliteStore, Store};
use tokio::sync::broadcast;

/// Flowcache - a single-flight cache for expensive computations
#[derive(Parser)]
#[command(name = "flowcache")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.flowcache)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to a JSON config file
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Print the fingerprint of some content
  Hash { content: String },

  /// Print the cache row for a fingerprint
  Inspect { hash: String },

  /// Extract text from a file through the cache
  Extract {
    file: PathBuf,

    /// Seconds to wait for the extraction to complete
    #[arg(long, default_value_t = 60)]
    wait_secs: u64,
  },

  /// Delete the cache row and stored result for a fingerprint
  Evict { hash: String },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".flowcache"),
  };

  let config = load_config(cli.config.as_deref(), &data_dir)?;
  init_tracing(&config.log_level);
  tracing::debug!(
    data_dir = %data_dir.display(),
    database_url = %config.store.database_url,
    "configuration loaded"
  );

  match cli.command {
    Some(Commands::Hash { content }) => {
      println!("{}", derive_hash(&content));
      Ok(())
    }
    Some(Commands::Inspect { hash }) => block_on(inspect(config, hash)),
    Some(Commands::Extract { file, wait_secs }) => block_on(extract(
      config,
      file,
      Duration::from_secs(wait_secs),
    )),
    Some(Commands::Evict { hash }) => block_on(evict(config, hash)),
    None => {
      println!("flowcache - use --help to see available commands");
      Ok(())
    }
  }
}

fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(future)
}

/// Load the config file if given, then anchor relative paths in the data dir.
fn load_config(path: Option<&Path>, data_dir: &Path) -> Result<CacheConfig> {
  let mut config = match path {
    Some(path) => CacheConfig::from_file(path)
      .with_context(|| format!("failed to load config: {}", path.display()))?,
    None => CacheConfig::default(),
  };

  if config.store.database_url == StoreConfig::default().database_url {
    config.store.database_url = format!("sqlite://{}", data_dir.join("flowcache.db").display());
  }
  if config.blob.root.is_relative() {
    config.blob.root = data_dir.join(&config.blob.root);
  }
  Ok(config)
}

fn init_tracing(default_level: &str) {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}

async fn open_store(config: &CacheConfig) -> Result<SqliteStore> {
  if let Some(parent) = sqlite_path(&config.store.database_url).and_then(|p| p.parent()) {
    tokio::fs::create_dir_all(parent)
      .await
      .with_context(|| format!("failed to create data directory: {}", parent.display()))?;
  }

  let store = SqliteStore::connect(&config.store.database_url)
    .await
    .with_context(|| format!("failed to open database: {}", config.store.database_url))?;
  store.migrate().await.context("failed to run migrations")?;
  Ok(store)
}

fn sqlite_path(url: &str) -> Option<&Path> {
  url
    .strip_prefix("sqlite://")
    .filter(|path| !path.contains(":memory:"))
    .map(Path::new)
}

async fn inspect(config: CacheConfig, hash: String) -> Result<()> {
  let store = open_store(&config).await?;
  match store.get_by_hash(&hash).await? {
    Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
    None => bail!("no cache entry for '{hash}'"),
  }
  Ok(())
}

async fn evict(config: CacheConfig, hash: String) -> Result<()> {
  let store = open_store(&config).await?;
  let Some(entry) = store.get_by_hash(&hash).await? else {
    eprintln!("No cache entry for {hash}");
    return Ok(());
  };

  let blobs = FsStore::new(&config.blob.root);
  match flowcache_artifact::Store::delete(&blobs, &entry.location()).await {
    Ok(()) | Err(flowcache_artifact::Error::NotFound(_)) => {}
    Err(e) => return Err(e).context("failed to delete stored result"),
  }
  store.delete_by_hash(&hash).await?;

  eprintln!("Evicted {hash} ({:?})", entry.status);
  Ok(())
}

/// Plain-text extraction of a local file.
struct ExtractText {
  path: PathBuf,
  digest: String,
}

#[async_trait]
impl AsyncTask for ExtractText {
  fn task_type(&self) -> &str {
    "extract_text"
  }

  fn hash_content(&self) -> String {
    format!("extract_text:{}", self.digest)
  }

  async fn execute(&self, _ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
    let data = tokio::fs::read(&self.path)
      .await
      .map_err(|e| TaskError::execution(format!("failed to read {}: {e}", self.path.display())))?;
    let text = String::from_utf8_lossy(&data);

    Ok(serde_json::json!({
      "text": text,
      "lines": text.lines().count(),
      "words": text.split_whitespace().count(),
    }))
  }
}

async fn extract(config: CacheConfig, file: PathBuf, wait: Duration) -> Result<()> {
  let data = tokio::fs::read(&file)
    .await
    .with_context(|| format!("failed to read file: {}", file.display()))?;
  let task = Arc::new(ExtractText {
    path: file.clone(),
    digest: derive_hash_bytes(&data),
  });

  let store = open_store(&config).await?;
  tokio::fs::create_dir_all(&config.blob.root)
    .await
    .with_context(|| format!("failed to create blob root: {}", config.blob.root.display()))?;

  let bus = BroadcastBus::default();
  let mut completions = bus.subscribe();
  let topic = config.notification.topic.clone();

  let manager = TaskCacheManager::new(
    CacheComponents {
      store: Arc::new(store.clone()),
      blobs: Arc::new(FsStore::new(&config.blob.root)),
      lock_backend: Arc::new(SqliteLockBackend::new(store.pool().clone())),
      publisher: Arc::new(bus),
    },
    config,
  );

  let owner = format!("cli-{}", std::process::id());
  let result = match manager.run(&owner, task.clone()).await {
    Ok(Lookup::Ready { result, .. }) => {
      eprintln!("Served from cache");
      Ok(result)
    }
    Ok(Lookup::Pending { hash, attempt }) => {
      eprintln!("Extraction pending for {hash}");
      let pending = PendingRun {
        hash: &hash,
        attempt: &attempt,
        topic: &topic,
      };
      pending
        .wait(&manager, &owner, task, &mut completions, wait)
        .await
    }
    Err(e) => Err(e.into()),
  };

  manager.shutdown().await;
  let result = result?;
  println!("{}", serde_json::to_string_pretty(&result)?);
  Ok(())
}

/// A computation this process is waiting on.
struct PendingRun<'a> {
  hash: &'a str,
  attempt: &'a str,
  topic: &'a str,
}

impl PendingRun<'_> {
  /// Wait for the completion message, then fall back to one cache read.
  ///
  /// The bus only carries completions from this process. When another
  /// process runs the computation the message never arrives, but its result
  /// may already be in the cache by the time the wait ends.
  async fn wait(
    &self,
    manager: &TaskCacheManager,
    owner: &str,
    task: Arc<dyn AsyncTask>,
    completions: &mut broadcast::Receiver<Envelope>,
    wait: Duration,
  ) -> Result<serde_json::Value> {
    let received = tokio::time::timeout(wait, async {
      loop {
        let envelope = completions
          .recv()
          .await
          .context("completion bus closed")?;
        let message = envelope.message;
        let ours = message.hash == self.hash && message.attempt == self.attempt;
        if envelope.topic == self.topic && ours {
          return anyhow::Ok(message);
        }
      }
    })
    .await;

    let message = match received {
      Ok(message) => message?,
      Err(_) => {
        tracing::debug!(hash = %self.hash, "no local completion, re-reading cache");
        return match manager.run(owner, task).await? {
          Lookup::Ready { result, .. } => Ok(result),
          Lookup::Pending { .. } => bail!("timed out waiting for extraction of {}", self.hash),
        };
      }
    };

    match message.status {
      CompletionStatus::Success => Ok(message.result.unwrap_or_default()),
      CompletionStatus::Failed => bail!("extraction failed: {}", message.error.unwrap_or_default()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use flowcache_artifact::{BlobLocation, stream_from_bytes};
  use flowcache_bus::NoopPublisher;
  use flowcache_lock::MemoryLockBackend;
  use flowcache_store::{TaskCacheEntry, TaskCacheUpdate, unix_now};

  fn manager(
    store: Arc<flowcache_store::MemoryStore>,
    blobs: Arc<flowcache_artifact::MemoryStore>,
  ) -> TaskCacheManager {
    TaskCacheManager::new(
      CacheComponents {
        store,
        blobs,
        lock_backend: Arc::new(MemoryLockBackend::new()),
        publisher: Arc::new(NoopPublisher),
      },
      CacheConfig::default(),
    )
  }

  fn task(digest: &str) -> Arc<ExtractText> {
    Arc::new(ExtractText {
      path: PathBuf::from("unused.txt"),
      digest: digest.to_string(),
    })
  }

  #[tokio::test]
  async fn test_result_from_other_process_is_read_after_wait() {
    let store = Arc::new(flowcache_store::MemoryStore::new());
    let blobs = Arc::new(flowcache_artifact::MemoryStore::new());
    let manager = manager(store.clone(), blobs.clone());
    let bus = BroadcastBus::default();
    let mut completions = bus.subscribe();

    let task = task("remote");
    let hash = derive_hash(&task.hash_content());
    let location = BlobLocation::new("local", format!("task-cache/{hash}/other.json"));
    let entry = TaskCacheEntry::pending(
      "other-row",
      &hash,
      "extract_text",
      location.clone(),
      ".json",
      unix_now(),
      60,
    );
    store.insert(&entry).await.unwrap();

    // Another process finishes the row without publishing on our bus.
    let (remote_store, remote_blobs) = (store.clone(), blobs.clone());
    let remote = tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      let data = br#"{"text":"from elsewhere"}"#.to_vec();
      let size = data.len() as i64;
      flowcache_artifact::Store::put(
        remote_blobs.as_ref(),
        &location,
        stream_from_bytes(data),
        "application/json",
      )
      .await
      .unwrap();
      remote_store
        .update(&entry.hash, &TaskCacheUpdate::success(size, unix_now()))
        .await
        .unwrap();
    });

    let pending = PendingRun {
      hash: &hash,
      attempt: "other-row",
      topic: "flowcache.task.completed",
    };
    let result = pending
      .wait(
        &manager,
        "cli-test",
        task,
        &mut completions,
        Duration::from_millis(100),
      )
      .await
      .unwrap();
    remote.await.unwrap();

    assert_eq!(result, serde_json::json!({"text": "from elsewhere"}));
  }

  #[tokio::test]
  async fn test_still_pending_after_wait_times_out() {
    let store = Arc::new(flowcache_store::MemoryStore::new());
    let manager = manager(store.clone(), Arc::new(flowcache_artifact::MemoryStore::new()));
    let bus = BroadcastBus::default();
    let mut completions = bus.subscribe();

    let task = task("slow");
    let hash = derive_hash(&task.hash_content());
    let entry = TaskCacheEntry::pending(
      "other-row",
      &hash,
      "extract_text",
      BlobLocation::new("local", "task-cache/slow.json"),
      ".json",
      unix_now(),
      60,
    );
    store.insert(&entry).await.unwrap();

    let pending = PendingRun {
      hash: &hash,
      attempt: "other-row",
      topic: "flowcache.task.completed",
    };
    let err = pending
      .wait(
        &manager,
        "cli-test",
        task,
        &mut completions,
        Duration::from_millis(20),
      )
      .await
      .unwrap_err();

    assert!(err.to_string().contains("timed out"));
  }

  #[test]
  fn test_binary_files_get_distinct_digests() {
    let a = task(&derive_hash_bytes(&[0x25, 0x50, 0xff]));
    let b = task(&derive_hash_bytes(&[0x25, 0x50, 0xfe]));
    assert_ne!(a.hash_content(), b.hash_content());
  }
}
