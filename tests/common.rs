#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use basedb::{Base, BaseConfig, LogServer, MemoryLogServer};

/// One in-process log server shared by every base of a test.
pub fn log_server() -> Arc<MemoryLogServer> {
    Arc::new(MemoryLogServer::new())
}

/// Opens a base on `stream` with its local store rooted at `db_path`.
///
/// Two bases simulating two processes must use different roots; each owns
/// its local store exclusively.
pub async fn open_base(server: &Arc<MemoryLogServer>, db_path: &Path, stream: &str) -> Base {
    open_base_with(server, db_path, BaseConfig::new(stream)).await
}

pub async fn open_base_with(
    server: &Arc<MemoryLogServer>,
    db_path: &Path,
    mut config: BaseConfig,
) -> Base {
    config.db_path = Some(db_path.to_path_buf());
    let server: Arc<dyn LogServer> = Arc::clone(server) as Arc<dyn LogServer>;
    Base::open(server, config).await.expect("open base")
}

/// Polls `f` until it yields a value or the timeout elapses.
pub async fn eventually<T, F, Fut>(timeout: Duration, interval: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f().await {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Default patience for cross-instance convergence.
pub const CONVERGE: Duration = Duration::from_secs(5);
pub const POLL: Duration = Duration::from_millis(10);
