//! HTTP(S) transport built on reqwest.
//!
//! Every transfer runs in its own tokio task. Tasks share one client and one
//! semaphore that caps how many bodies are streamed at once; a task waiting
//! for a permit reports `Pending`. Data goes to `<dest>.part` and is renamed
//! into place only after the body (and, if requested, the hash) checks out.

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use reqwest::Client;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::{JobHandle, TransferRequest, TransferSnapshot, Transport};
use crate::cli::VerifyMode;
use crate::error::TransportError;
use crate::hashing::calculate_hash;
use crate::utils::part_path;

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub concurrency: usize,
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub verify_mode: VerifyMode,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            user_agent: concat!("batchdl/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(10),
            verify_mode: VerifyMode::Auto,
        }
    }
}

type SharedSnapshot = Arc<Mutex<TransferSnapshot>>;

struct JobSlot {
    snapshot: SharedSnapshot,
    cancel: CancellationToken,
}

pub struct HttpTransport {
    client: Client,
    semaphore: Arc<Semaphore>,
    verify_mode: VerifyMode,
    next_id: AtomicU64,
    jobs: Mutex<HashMap<JobHandle, JobSlot>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .user_agent(config.user_agent)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            client,
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            verify_mode: config.verify_mode,
            next_id: AtomicU64::new(0),
            jobs: Mutex::new(HashMap::new()),
        })
    }
}

impl Transport for HttpTransport {
    fn begin(&self, requests: &[TransferRequest]) -> Result<Vec<JobHandle>, TransportError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let runtime = Handle::try_current().map_err(|_| TransportError::NoRuntime)?;

        // Validate everything first so a bad request never leaves half a batch running.
        let mut destinations = HashSet::with_capacity(requests.len());
        for request in requests {
            if !destinations.insert(&request.dest_path) {
                return Err(TransportError::InvalidRequest {
                    url: request.url.clone(),
                    reason: format!("destination {:?} is used twice", request.dest_path),
                });
            }
            Url::parse(&request.url).map_err(|e| TransportError::InvalidRequest {
                url: request.url.clone(),
                reason: e.to_string(),
            })?;
            if request.dest_path.file_name().is_none() {
                return Err(TransportError::InvalidRequest {
                    url: request.url.clone(),
                    reason: format!("destination {:?} has no file name", request.dest_path),
                });
            }
        }

        let mut jobs = lock(&self.jobs);
        let mut handles = Vec::with_capacity(requests.len());
        for request in requests {
            let handle = JobHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
            let snapshot = Arc::new(Mutex::new(TransferSnapshot::pending()));
            let cancel = CancellationToken::new();

            let task = TransferTask {
                handle,
                client: self.client.clone(),
                semaphore: self.semaphore.clone(),
                verify_mode: self.verify_mode,
                request: request.clone(),
                snapshot: snapshot.clone(),
            };
            runtime.spawn(task.run(cancel.clone()));

            debug!(%handle, url = %request.url, dest = ?request.dest_path, "transfer started");
            jobs.insert(handle, JobSlot { snapshot, cancel });
            handles.push(handle);
        }
        Ok(handles)
    }

    fn poll(&self, handle: JobHandle) -> TransferSnapshot {
        match lock(&self.jobs).get(&handle) {
            Some(slot) => lock(&slot.snapshot).clone(),
            None => TransferSnapshot::unknown_handle(handle),
        }
    }

    fn dispose(&self, handle: JobHandle) {
        if let Some(slot) = lock(&self.jobs).remove(&handle) {
            slot.cancel.cancel();
            debug!(%handle, "transfer disposed");
        }
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        for (_, slot) in lock(&self.jobs).drain() {
            slot.cancel.cancel();
        }
    }
}

struct TransferTask {
    handle: JobHandle,
    client: Client,
    semaphore: Arc<Semaphore>,
    verify_mode: VerifyMode,
    request: TransferRequest,
    snapshot: SharedSnapshot,
}

impl TransferTask {
    async fn run(self, cancel: CancellationToken) {
        let part = part_path(&self.request.dest_path);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.transfer(&part) => Some(result),
        };

        match outcome {
            Some(Ok(())) => {
                *lock(&self.snapshot) = TransferSnapshot::done();
            }
            Some(Err(e)) => {
                warn!(handle = %self.handle, url = %self.request.url, "transfer failed: {:#}", e);
                let _ = fs::remove_file(&part).await;
                let mut snapshot = lock(&self.snapshot);
                let progress = snapshot.progress;
                *snapshot = TransferSnapshot::failed(progress, format!("{:#}", e));
            }
            None => {
                debug!(handle = %self.handle, "transfer cancelled");
                let _ = fs::remove_file(&part).await;
            }
        }
    }

    async fn transfer(&self, part: &Path) -> Result<()> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| anyhow!("transfer pool closed"))?;
        self.set_progress(0.0);

        let url = &self.request.url;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;
        if !response.status().is_success() {
            bail!("server responded with {}", response.status());
        }
        let total_size = response.content_length().unwrap_or(0);

        if let Some(parent) = self.request.dest_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create destination directory")?;
            }
        }

        let mut file = File::create(part)
            .await
            .context("Failed to open partial file")?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(item) = stream.next().await {
            let chunk = item.context("Error while downloading chunk")?;
            if chunk.is_empty() {
                continue;
            }
            file.write_all(&chunk)
                .await
                .context("Error while writing to file")?;
            downloaded += chunk.len() as u64;
            if total_size > 0 {
                self.set_progress((downloaded as f64 / total_size as f64).min(1.0) as f32);
            }
        }

        file.flush().await.context("Failed to flush file")?;
        drop(file);

        self.verify(part).await?;
        fs::rename(part, &self.request.dest_path)
            .await
            .context("Failed to rename partial file")?;
        Ok(())
    }

    async fn verify(&self, part: &Path) -> Result<()> {
        if self.verify_mode == VerifyMode::Off {
            return Ok(());
        }
        match &self.request.sha256 {
            Some(expected) => {
                let computed = calculate_hash(part).await.context("Failed to hash file")?;
                if !expected.eq_ignore_ascii_case(&computed) {
                    bail!("Hash mismatch: expected {}, got {}", expected, computed);
                }
                debug!(handle = %self.handle, sha256 = %computed, "hash verified");
                Ok(())
            }
            None if self.verify_mode == VerifyMode::On => {
                bail!("missing hash for {}", self.request.url)
            }
            None => Ok(()),
        }
    }

    fn set_progress(&self, progress: f32) {
        *lock(&self.snapshot) = TransferSnapshot::in_progress(progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransferStatus;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ABC_SHA256: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    fn transport(verify_mode: VerifyMode) -> HttpTransport {
        HttpTransport::new(HttpTransportConfig {
            concurrency: 2,
            verify_mode,
            ..HttpTransportConfig::default()
        })
        .unwrap()
    }

    fn request(url: String, dest: &Path, sha256: Option<&str>) -> TransferRequest {
        TransferRequest {
            url,
            dest_path: dest.to_path_buf(),
            sha256: sha256.map(str::to_string),
        }
    }

    async fn wait_terminal(transport: &HttpTransport, handle: JobHandle) -> TransferSnapshot {
        for _ in 0..500 {
            let snapshot = transport.poll(handle);
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfer {} never finished", handle);
    }

    async fn serve(server: &MockServer, route: &str, body: &'static [u8]) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn downloads_into_destination() {
        let server = MockServer::start().await;
        serve(&server, "/files/abc.txt", b"abc").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("abc.txt");

        let transport = transport(VerifyMode::Auto);
        let handles = transport
            .begin(&[request(format!("{}/files/abc.txt", server.uri()), &dest, None)])
            .unwrap();
        let snapshot = wait_terminal(&transport, handles[0]).await;

        assert_eq!(snapshot, TransferSnapshot::done());
        assert_eq!(std::fs::read(&dest).unwrap(), b"abc");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn http_error_marks_job_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("missing.bin");

        let transport = transport(VerifyMode::Auto);
        let handles = transport
            .begin(&[request(format!("{}/missing.bin", server.uri()), &dest, None)])
            .unwrap();
        let snapshot = wait_terminal(&transport, handles[0]).await;

        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert!(snapshot.error.unwrap().contains("404"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn failing_job_does_not_affect_sibling() {
        let server = MockServer::start().await;
        serve(&server, "/ok.txt", b"abc").await;
        let dir = tempfile::tempdir().unwrap();

        let transport = transport(VerifyMode::Auto);
        let handles = transport
            .begin(&[
                request(format!("{}/ok.txt", server.uri()), &dir.path().join("ok.txt"), None),
                request(format!("{}/gone.txt", server.uri()), &dir.path().join("gone.txt"), None),
            ])
            .unwrap();

        assert_eq!(wait_terminal(&transport, handles[0]).await.status, TransferStatus::Done);
        assert_eq!(wait_terminal(&transport, handles[1]).await.status, TransferStatus::Failed);
    }

    #[tokio::test]
    async fn matching_hash_is_accepted() {
        let server = MockServer::start().await;
        serve(&server, "/abc.txt", b"abc").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("abc.txt");

        let transport = transport(VerifyMode::Auto);
        let handles = transport
            .begin(&[request(format!("{}/abc.txt", server.uri()), &dest, Some(ABC_SHA256.to_uppercase().as_str()))])
            .unwrap();

        assert_eq!(wait_terminal(&transport, handles[0]).await.status, TransferStatus::Done);
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn hash_mismatch_fails_and_leaves_no_file() {
        let server = MockServer::start().await;
        serve(&server, "/abc.txt", b"abd").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("abc.txt");

        let transport = transport(VerifyMode::Auto);
        let handles = transport
            .begin(&[request(format!("{}/abc.txt", server.uri()), &dest, Some(ABC_SHA256))])
            .unwrap();
        let snapshot = wait_terminal(&transport, handles[0]).await;

        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert!(snapshot.error.unwrap().contains("Hash mismatch"));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn verify_off_ignores_wrong_hash() {
        let server = MockServer::start().await;
        serve(&server, "/abc.txt", b"abd").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("abc.txt");

        let transport = transport(VerifyMode::Off);
        let handles = transport
            .begin(&[request(format!("{}/abc.txt", server.uri()), &dest, Some(ABC_SHA256))])
            .unwrap();

        assert_eq!(wait_terminal(&transport, handles[0]).await.status, TransferStatus::Done);
    }

    #[tokio::test]
    async fn verify_on_requires_hash() {
        let server = MockServer::start().await;
        serve(&server, "/abc.txt", b"abc").await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("abc.txt");

        let transport = transport(VerifyMode::On);
        let handles = transport
            .begin(&[request(format!("{}/abc.txt", server.uri()), &dest, None)])
            .unwrap();
        let snapshot = wait_terminal(&transport, handles[0]).await;

        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert!(snapshot.error.unwrap().contains("missing hash"));
    }

    #[tokio::test]
    async fn dispose_cancels_running_transfer() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"slow".as_slice())
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("slow.bin");

        let transport = transport(VerifyMode::Auto);
        let handle = transport
            .begin(&[request(format!("{}/slow.bin", server.uri()), &dest, None)])
            .unwrap()[0];
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!transport.poll(handle).status.is_terminal());

        transport.dispose(handle);
        transport.dispose(handle);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = transport.poll(handle);
        assert_eq!(snapshot.status, TransferStatus::Failed);
        assert!(snapshot.error.unwrap().contains("unknown transfer handle"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn malformed_url_rejects_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let transport = transport(VerifyMode::Auto);
        let err = transport
            .begin(&[
                request("https://example.com/a".to_string(), &dir.path().join("a"), None),
                request("not a url".to_string(), &dir.path().join("b"), None),
            ])
            .unwrap_err();

        assert!(matches!(err, TransportError::InvalidRequest { .. }));
        assert_eq!(lock(&transport.jobs).len(), 0);
    }

    #[tokio::test]
    async fn shared_destination_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("setup.exe");
        let transport = transport(VerifyMode::Auto);
        let err = transport
            .begin(&[
                request("https://a.com/x/setup.exe".to_string(), &dest, None),
                request("https://b.com/y/setup.exe".to_string(), &dest, None),
            ])
            .unwrap_err();

        assert!(matches!(err, TransportError::InvalidRequest { ref reason, .. } if reason.contains("used twice")));
        assert_eq!(lock(&transport.jobs).len(), 0);
    }

    #[tokio::test]
    async fn same_file_name_from_two_urls_keeps_both_files() {
        use crate::coordinator::{Coordinator, CoordinatorConfig, CoordinatorState};

        let server = MockServer::start().await;
        let first = vec![b'a'; 400_000];
        let second = vec![b'b'; 300_000];
        Mock::given(method("GET"))
            .and(path("/x/setup.exe"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(first.clone()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/y/setup.exe"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(second.clone()))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let mut coordinator = Coordinator::new(transport(VerifyMode::Auto), CoordinatorConfig::default());
        coordinator
            .start_batch(
                dir.path(),
                &[
                    format!("{}/x/setup.exe", server.uri()),
                    format!("{}/y/setup.exe", server.uri()),
                ],
            )
            .unwrap();
        for _ in 0..500 {
            coordinator.refresh();
            if coordinator.state() == CoordinatorState::Finished {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(coordinator.state(), CoordinatorState::Finished);
        assert_eq!(coordinator.summary().unwrap().success_count, 2);
        let dests: Vec<_> = coordinator.jobs().iter().map(|j| j.dest_path.clone()).collect();
        assert_ne!(dests[0], dests[1]);
        assert_eq!(std::fs::read(&dests[0]).unwrap(), first);
        assert_eq!(std::fs::read(&dests[1]).unwrap(), second);
        assert_eq!(dests[1], dir.path().join("setup_1.exe"));
    }

    #[test]
    fn begin_without_runtime_fails() {
        let transport = transport(VerifyMode::Auto);
        let err = transport
            .begin(&[request("https://example.com/a".to_string(), Path::new("a"), None)])
            .unwrap_err();
        assert!(matches!(err, TransportError::NoRuntime));
    }

    #[test]
    fn empty_begin_needs_no_runtime() {
        assert!(transport(VerifyMode::Auto).begin(&[]).unwrap().is_empty());
    }
}
