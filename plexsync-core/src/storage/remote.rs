use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ByteReader, ByteWriter, StorageBackend, StorageError, StorageResult, TreeEntry};

/// One live session against a remote host (an SMB login, for example).
/// Paths are share-relative: the first component of a backend-relative path
/// selects the share, the remainder addresses the file inside it.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Cheap liveness check; a stale session is discarded and redialed.
    async fn alive(&self) -> bool;

    async fn read(&self, share: &str, path: &str) -> StorageResult<ByteReader>;

    async fn write(&self, share: &str, path: &str) -> StorageResult<ByteWriter>;

    async fn size(&self, share: &str, path: &str) -> StorageResult<u64>;

    async fn exists(&self, share: &str, path: &str) -> bool;

    async fn remove(&self, share: &str, path: &str) -> StorageResult<()>;

    async fn remove_all(&self, share: &str, path: &str) -> StorageResult<()>;

    async fn mkdir(&self, share: &str, path: &str) -> StorageResult<()>;

    async fn free_space(&self, share: &str) -> StorageResult<u64>;

    async fn list_tree(&self, share: &str, path: &str) -> StorageResult<Vec<TreeEntry>>;
}

/// Dials a new session to a host. Injected so the engine never owns
/// protocol-specific connection code.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, host: &str) -> StorageResult<Arc<dyn RemoteSession>>;
}

/// Cache of one session per remote host, shared by every backend of a run.
///
/// A session found dead is dropped and transparently redialed under the same
/// lock, so concurrent pipelines never race a reconnect.
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    sessions: Mutex<HashMap<String, Arc<dyn RemoteSession>>>,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn session(&self, host: &str) -> StorageResult<Arc<dyn RemoteSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(host) {
            if session.alive().await {
                debug!(host, "reusing cached session");
                return Ok(session.clone());
            }
            warn!(host, "cached session is stale, reconnecting");
            sessions.remove(host);
        }
        info!(host, "connecting");
        let session = self.factory.connect(host).await?;
        sessions.insert(host.to_string(), session.clone());
        Ok(session)
    }

    pub async fn close_all(&self) {
        self.sessions.lock().await.clear();
    }
}

/// Storage backend over a remote share. Streams are non-seekable pipes, which
/// is exactly the constraint the transcode pipeline's staging fallback
/// absorbs.
pub struct RemoteBackend {
    host: String,
    base: String,
    pool: Arc<SessionPool>,
}

impl RemoteBackend {
    pub fn new(host: impl Into<String>, base: impl Into<String>, pool: Arc<SessionPool>) -> Self {
        Self {
            host: host.into(),
            base: base.into(),
            pool,
        }
    }

    /// Parses `[user:pass@]host/base...` as it appears after the scheme
    /// prefix of an `smb://` url. Credentials belong to the session factory;
    /// they are accepted here only to keep configured urls working.
    pub fn parse(rest: &str, pool: Arc<SessionPool>) -> StorageResult<Self> {
        let rest = match rest.rsplit_once('@') {
            Some((_credentials, tail)) => tail,
            None => rest,
        };
        let (host, base) = rest
            .split_once('/')
            .ok_or_else(|| StorageError::UnsupportedScheme(rest.to_string()))?;
        Ok(Self::new(host, base, pool))
    }

    /// Splits a backend-relative path into (share, in-share path).
    fn locate(&self, rel: &str) -> (String, String) {
        let rel = rel.trim_start_matches('/');
        let joined = if self.base.is_empty() {
            rel.to_string()
        } else if rel.is_empty() {
            self.base.trim_matches('/').to_string()
        } else {
            format!("{}/{}", self.base.trim_matches('/'), rel)
        };
        match joined.split_once('/') {
            Some((share, within)) => (share.to_string(), within.to_string()),
            None => (joined, String::new()),
        }
    }

    async fn session(&self) -> StorageResult<Arc<dyn RemoteSession>> {
        self.pool.session(&self.host).await
    }
}

#[async_trait]
impl StorageBackend for RemoteBackend {
    fn root(&self) -> &str {
        &self.base
    }

    fn is_streaming(&self) -> bool {
        true
    }

    fn absolute(&self, rel: &str) -> String {
        format!("//{}/{}/{}", self.host, self.base, rel.trim_start_matches('/'))
    }

    async fn read(&self, rel: &str) -> StorageResult<ByteReader> {
        let (share, path) = self.locate(rel);
        self.session().await?.read(&share, &path).await
    }

    async fn write(&self, rel: &str) -> StorageResult<ByteWriter> {
        let (share, path) = self.locate(rel);
        self.session().await?.write(&share, &path).await
    }

    async fn size(&self, rel: &str) -> StorageResult<u64> {
        let (share, path) = self.locate(rel);
        self.session().await?.size(&share, &path).await
    }

    async fn exists(&self, rel: &str) -> bool {
        let (share, path) = self.locate(rel);
        match self.session().await {
            Ok(session) => session.exists(&share, &path).await,
            Err(_) => false,
        }
    }

    async fn remove(&self, rel: &str) -> StorageResult<()> {
        let (share, path) = self.locate(rel);
        self.session().await?.remove(&share, &path).await
    }

    async fn remove_all(&self, rel: &str) -> StorageResult<()> {
        let (share, path) = self.locate(rel);
        self.session().await?.remove_all(&share, &path).await
    }

    async fn mkdir(&self, rel: &str) -> StorageResult<()> {
        let (share, path) = self.locate(rel);
        self.session().await?.mkdir(&share, &path).await
    }

    async fn free_space(&self, base: &str) -> StorageResult<u64> {
        let (share, _) = self.locate(base);
        self.session().await?.free_space(&share).await
    }

    async fn list_tree(&self, base: &str) -> StorageResult<Vec<TreeEntry>> {
        let (share, path) = self.locate(base);
        self.session().await?.list_tree(&share, &path).await
    }

    async fn is_empty_dir(&self, rel: &str) -> bool {
        match self.list_tree(rel).await {
            Ok(entries) => entries.is_empty(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FlakySession {
        alive: AtomicBool,
    }

    #[async_trait]
    impl RemoteSession for FlakySession {
        async fn alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        async fn read(&self, _: &str, _: &str) -> StorageResult<ByteReader> {
            unimplemented!()
        }
        async fn write(&self, _: &str, _: &str) -> StorageResult<ByteWriter> {
            unimplemented!()
        }
        async fn size(&self, _: &str, _: &str) -> StorageResult<u64> {
            Ok(1)
        }
        async fn exists(&self, _: &str, _: &str) -> bool {
            true
        }
        async fn remove(&self, _: &str, _: &str) -> StorageResult<()> {
            Ok(())
        }
        async fn remove_all(&self, _: &str, _: &str) -> StorageResult<()> {
            Ok(())
        }
        async fn mkdir(&self, _: &str, _: &str) -> StorageResult<()> {
            Ok(())
        }
        async fn free_space(&self, _: &str) -> StorageResult<u64> {
            Ok(0)
        }
        async fn list_tree(&self, _: &str, _: &str) -> StorageResult<Vec<TreeEntry>> {
            Ok(Vec::new())
        }
    }

    struct CountingFactory {
        dials: AtomicUsize,
        last: Mutex<Option<Arc<FlakySession>>>,
    }

    impl CountingFactory {
        fn new() -> Self {
            Self {
                dials: AtomicUsize::new(0),
                last: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl SessionFactory for CountingFactory {
        async fn connect(&self, _host: &str) -> StorageResult<Arc<dyn RemoteSession>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let session = Arc::new(FlakySession {
                alive: AtomicBool::new(true),
            });
            *self.last.lock().await = Some(session.clone());
            Ok(session)
        }
    }

    #[tokio::test]
    async fn pool_caches_live_sessions_per_host() {
        let factory = Arc::new(CountingFactory::new());
        let pool = SessionPool::new(factory.clone());

        pool.session("nas:445").await.unwrap();
        pool.session("nas:445").await.unwrap();
        pool.session("other:445").await.unwrap();
        assert_eq!(factory.dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pool_redials_stale_sessions() {
        let factory = Arc::new(CountingFactory::new());
        let pool = SessionPool::new(factory.clone());

        pool.session("nas:445").await.unwrap();
        // mark the cached session dead; the next lookup must redial
        let first = factory.last.lock().await.clone().unwrap();
        first.alive.store(false, Ordering::SeqCst);

        pool.session("nas:445").await.unwrap();
        assert_eq!(factory.dials.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn parse_strips_credentials_and_splits_host() {
        let pool = Arc::new(SessionPool::new(Arc::new(CountingFactory::new())));
        let backend = RemoteBackend::parse("user:pw@nas:445/media/tv", pool).unwrap();
        assert_eq!(backend.host, "nas:445");
        assert_eq!(backend.base, "media/tv");

        let (share, path) = backend.locate("/show/e1.mp4");
        assert_eq!(share, "media");
        assert_eq!(path, "tv/show/e1.mp4");
    }
}
