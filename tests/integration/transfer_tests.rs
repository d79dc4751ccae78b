use async_trait::async_trait;
use modcache::halt::HaltGate;
use modcache::index::{HashIndex, Roots};
use modcache::transfer::codec;
use modcache::transfer::{
    DownloadRequest, FileSizeInfo, Payload, RelayClient, Ticket, TransferConfig, TransferError,
    TransferOrchestrator, UploadIntent,
};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

const ENDPOINT: &str = "relay-eu";

/// Relay that keeps compressed payloads in memory and counts every call.
#[derive(Default)]
struct MemoryRelay {
    held: Mutex<HashMap<String, Vec<u8>>>,
    forbidden: Mutex<HashSet<String>>,
    tickets: Mutex<HashMap<String, String>>,
    downloads: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MemoryRelay {
    fn hold(&self, content: &[u8]) -> String {
        let hash = modcache::scanner::Hasher::hash_bytes(content);
        self.held
            .lock()
            .unwrap()
            .insert(hash.clone(), codec::compress(content).unwrap());
        hash
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayClient for MemoryRelay {
    async fn query_sizes(&self, hashes: &[String]) -> Result<Vec<FileSizeInfo>, TransferError> {
        self.tick();
        let held = self.held.lock().unwrap();
        let forbidden = self.forbidden.lock().unwrap();
        Ok(hashes
            .iter()
            .map(|hash| FileSizeInfo {
                hash: hash.clone(),
                size: held.get(hash).map_or(0, |data| data.len() as i64),
                exists: held.contains_key(hash),
                forbidden: forbidden.contains(hash),
                download_endpoint: ENDPOINT.to_string(),
            })
            .collect())
    }

    async fn query_upload_intent(
        &self,
        hashes: &[String],
    ) -> Result<Vec<UploadIntent>, TransferError> {
        self.tick();
        let held = self.held.lock().unwrap();
        let forbidden = self.forbidden.lock().unwrap();
        Ok(hashes
            .iter()
            .map(|hash| UploadIntent {
                hash: hash.clone(),
                forbidden: forbidden.contains(hash),
                upload_endpoint: (!held.contains_key(hash)).then(|| ENDPOINT.to_string()),
            })
            .collect())
    }

    async fn enqueue(&self, _endpoint: &str, _hashes: &[String]) -> Result<(), TransferError> {
        Ok(())
    }

    async fn request_ticket(&self, _endpoint: &str, hash: &str) -> Result<Ticket, TransferError> {
        self.tick();
        let mut tickets = self.tickets.lock().unwrap();
        let ticket = format!("t{}", tickets.len());
        tickets.insert(ticket.clone(), hash.to_string());
        Ok(Ticket(ticket))
    }

    async fn check_status(&self, _endpoint: &str, _ticket: &Ticket) -> Result<bool, TransferError> {
        Ok(true)
    }

    async fn cancel_ticket(&self, _endpoint: &str, _ticket: &Ticket) -> Result<(), TransferError> {
        Ok(())
    }

    async fn download(&self, _endpoint: &str, ticket: &Ticket) -> Result<Payload, TransferError> {
        self.tick();
        let hash = self
            .tickets
            .lock()
            .unwrap()
            .get(&ticket.0)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(ticket.0.clone()))?;
        self.downloads.lock().unwrap().push(hash.clone());
        let data = self
            .held
            .lock()
            .unwrap()
            .get(&hash)
            .cloned()
            .ok_or(TransferError::NotFound(hash))?;
        Ok(Payload {
            content_length: Some(data.len() as u64),
            reader: Box::new(Cursor::new(data)),
        })
    }

    async fn upload(
        &self,
        _endpoint: &str,
        hash: &str,
        payload: Vec<u8>,
        progress: &(dyn Fn(u64) + Send + Sync),
    ) -> Result<(), TransferError> {
        self.tick();
        progress(payload.len() as u64);
        self.held.lock().unwrap().insert(hash.to_string(), payload);
        Ok(())
    }
}

struct Setup {
    dir: TempDir,
    index: Arc<HashIndex>,
    relay: Arc<MemoryRelay>,
    gate: Arc<HaltGate>,
    orchestrator: TransferOrchestrator,
}

impl Setup {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("mods")).unwrap();
        fs::create_dir_all(dir.path().join("cache")).unwrap();
        let index = Arc::new(
            HashIndex::open(
                &dir.path().join("index.txt"),
                Roots::new(Some(dir.path().join("mods")), Some(dir.path().join("cache"))),
            )
            .unwrap(),
        );
        let relay = Arc::new(MemoryRelay::default());
        let gate = Arc::new(HaltGate::new());
        let config = TransferConfig {
            ready_poll_interval: Duration::from_millis(10),
            ..TransferConfig::default()
        };
        let orchestrator = TransferOrchestrator::new(
            Arc::clone(&relay) as Arc<dyn RelayClient>,
            Arc::clone(&index),
            Arc::clone(&gate),
            &config,
        );
        Self {
            dir,
            index,
            relay,
            gate,
            orchestrator,
        }
    }

    fn local(&self, name: &str, content: &[u8]) -> String {
        let path = self.dir.path().join("mods").join(name);
        fs::write(&path, content).unwrap();
        self.index.create_entry(&path, None).unwrap().hash
    }
}

#[tokio::test]
async fn test_upload_then_repeat_within_window_makes_no_call() {
    let setup = Setup::new();
    let hash = setup.local("body.tex", b"freshly made texture");

    let first = setup.orchestrator.upload(&[hash.clone()]).await.unwrap();
    assert_eq!(first.uploaded, vec![hash.clone()]);
    assert!(setup.orchestrator.is_verified(&hash));
    let stored = setup.relay.held.lock().unwrap().get(&hash).cloned().unwrap();
    assert_eq!(zstd::decode_all(&stored[..]).unwrap(), b"freshly made texture");

    let calls = setup.relay.calls();
    let second = setup.orchestrator.upload(&[hash.clone()]).await.unwrap();
    assert_eq!(second.recently_verified, vec![hash]);
    assert!(second.uploaded.is_empty());
    assert_eq!(setup.relay.calls(), calls);
}

#[tokio::test]
async fn test_upload_of_unknown_hash_fails_without_aborting_batch() {
    let setup = Setup::new();
    let known = setup.local("known.tex", b"known");
    let unknown = "cd".repeat(32);

    let report = setup
        .orchestrator
        .upload(&[unknown.clone(), known.clone()])
        .await
        .unwrap();
    assert_eq!(report.failed, vec![unknown]);
    assert_eq!(report.uploaded, vec![known]);
}

#[tokio::test]
async fn test_forbidden_download_is_never_transferred_and_stripped() {
    let setup = Setup::new();
    let allowed = setup.relay.hold(b"allowed texture");
    let banned = setup.relay.hold(b"banned texture");
    setup.relay.forbidden.lock().unwrap().insert(banned.clone());

    let report = setup
        .orchestrator
        .download(&[
            DownloadRequest::new(&allowed, Some("tex")),
            DownloadRequest::new(&banned, Some("tex")),
        ])
        .await
        .unwrap();

    assert_eq!(report.downloaded, vec![allowed.clone()]);
    assert_eq!(report.forbidden, vec![banned.clone()]);
    assert!(!report.cancelled);
    assert!(!setup.relay.downloads.lock().unwrap().contains(&banned));
    assert!(setup.orchestrator.is_forbidden(&banned));
    assert_eq!(setup.orchestrator.forbidden_hashes(), vec![banned.clone()]);

    let mut payload = vec![allowed.clone(), banned, allowed.clone()];
    assert_eq!(setup.orchestrator.strip_forbidden(&mut payload), 1);
    assert_eq!(payload, vec![allowed.clone(), allowed]);
}

#[tokio::test]
async fn test_download_places_content_in_cache_and_index() {
    let setup = Setup::new();
    let hash = setup.relay.hold(b"downloaded model");

    let report = setup
        .orchestrator
        .download(&[DownloadRequest::new(&hash, Some("mdl"))])
        .await
        .unwrap();
    assert_eq!(report.downloaded, vec![hash.clone()]);

    let expected = setup.dir.path().join("cache").join(format!("{hash}.mdl"));
    assert_eq!(fs::read(&expected).unwrap(), b"downloaded model");
    assert_eq!(setup.index.resolve_hash(&hash), Some(expected));
    assert!(!setup.gate.is_halted());
    assert!(setup.orchestrator.transfers().is_empty());

    // Present locally now: a second request makes no relay call.
    let calls = setup.relay.calls();
    let again = setup
        .orchestrator
        .download(&[DownloadRequest::new(&hash, Some("mdl"))])
        .await
        .unwrap();
    assert_eq!(again.already_present, vec![hash]);
    assert_eq!(setup.relay.calls(), calls);
}

#[tokio::test]
async fn test_download_waits_for_unrelated_halt() {
    let setup = Arc::new(Setup::new());
    let hash = setup.relay.hold(b"waits for the cutscene");
    setup.gate.halt("cutscene");

    let task = {
        let setup = Arc::clone(&setup);
        let hash = hash.clone();
        tokio::spawn(async move {
            setup
                .orchestrator
                .download(&[DownloadRequest::new(&hash, None)])
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!task.is_finished());
    assert_eq!(setup.relay.calls(), 0);

    setup.gate.resume("cutscene");
    let report = tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.downloaded, vec![hash]);
}
