//! In-memory relay and scratch index shared by the transfer unit tests.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use super::relay::{FileSizeInfo, Payload, RelayClient, Ticket, UploadIntent};
use super::{codec, TransferError};
use crate::index::{HashIndex, Roots};

pub(crate) const ENDPOINT: &str = "relay-1";

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub index: Arc<HashIndex>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("mods")).unwrap();
        fs::create_dir_all(dir.path().join("cache")).unwrap();
        let index = HashIndex::open(
            &dir.path().join("index.txt"),
            Roots::new(Some(dir.path().join("mods")), Some(dir.path().join("cache"))),
        )
        .unwrap();
        Self {
            dir,
            index: Arc::new(index),
        }
    }

    pub fn cache_root(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    /// Write a file under the mod root, index it, return its hash.
    pub fn mod_file(&self, name: &str, content: &[u8]) -> String {
        let path = self.dir.path().join("mods").join(name);
        fs::write(&path, content).unwrap();
        self.index.create_entry(&path, None).unwrap().hash
    }
}

#[derive(Default)]
pub(crate) struct FakeRelay {
    stored: Mutex<HashMap<String, Vec<u8>>>,
    forbidden: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    silent: Mutex<HashSet<String>>,
    tickets: Mutex<HashMap<String, String>>,
    last_ticket: Mutex<Option<String>>,
    not_ready: AtomicBool,
    calls: AtomicUsize,
    issued: AtomicUsize,
    cancelled: AtomicUsize,
}

impl FakeRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold `content` (compressed, as a peer would have uploaded it).
    pub fn store(&self, hash: &str, content: &[u8]) {
        self.stored
            .lock()
            .unwrap()
            .insert(hash.to_string(), codec::compress(content).unwrap());
    }

    pub fn holds(&self, hash: &str) -> bool {
        self.stored.lock().unwrap().contains_key(hash)
    }

    pub fn forbid(&self, hash: &str) {
        self.forbidden.lock().unwrap().insert(hash.to_string());
    }

    /// Leave `hash` out of upload intent answers.
    pub fn ignore_intent(&self, hash: &str) {
        self.silent.lock().unwrap().insert(hash.to_string());
    }

    pub fn fail_download(&self, hash: &str) {
        self.failing.lock().unwrap().insert(hash.to_string());
    }

    pub fn set_ready(&self, ready: bool) {
        self.not_ready.store(!ready, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn tickets_issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn cancelled_tickets(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn last_ticket(&self) -> Option<String> {
        self.last_ticket.lock().unwrap().clone()
    }

    fn call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RelayClient for FakeRelay {
    async fn query_sizes(&self, hashes: &[String]) -> Result<Vec<FileSizeInfo>, TransferError> {
        self.call();
        let stored = self.stored.lock().unwrap();
        let forbidden = self.forbidden.lock().unwrap();
        Ok(hashes
            .iter()
            .map(|hash| FileSizeInfo {
                hash: hash.clone(),
                size: stored.get(hash).map_or(0, |data| data.len() as i64),
                exists: stored.contains_key(hash),
                forbidden: forbidden.contains(hash),
                download_endpoint: ENDPOINT.to_string(),
            })
            .collect())
    }

    async fn query_upload_intent(
        &self,
        hashes: &[String],
    ) -> Result<Vec<UploadIntent>, TransferError> {
        self.call();
        let stored = self.stored.lock().unwrap();
        let forbidden = self.forbidden.lock().unwrap();
        let silent = self.silent.lock().unwrap();
        Ok(hashes
            .iter()
            .filter(|hash| !silent.contains(*hash))
            .map(|hash| UploadIntent {
                hash: hash.clone(),
                forbidden: forbidden.contains(hash),
                upload_endpoint: (!stored.contains_key(hash)).then(|| ENDPOINT.to_string()),
            })
            .collect())
    }

    async fn enqueue(&self, _endpoint: &str, _hashes: &[String]) -> Result<(), TransferError> {
        self.call();
        Ok(())
    }

    async fn request_ticket(&self, _endpoint: &str, hash: &str) -> Result<Ticket, TransferError> {
        self.call();
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        let ticket = format!("ticket-{n}");
        self.tickets
            .lock()
            .unwrap()
            .insert(ticket.clone(), hash.to_string());
        *self.last_ticket.lock().unwrap() = Some(ticket.clone());
        Ok(Ticket(ticket))
    }

    async fn check_status(&self, _endpoint: &str, _ticket: &Ticket) -> Result<bool, TransferError> {
        self.call();
        Ok(!self.not_ready.load(Ordering::SeqCst))
    }

    async fn cancel_ticket(&self, _endpoint: &str, _ticket: &Ticket) -> Result<(), TransferError> {
        self.call();
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn download(&self, _endpoint: &str, ticket: &Ticket) -> Result<Payload, TransferError> {
        self.call();
        let hash = self
            .tickets
            .lock()
            .unwrap()
            .get(&ticket.0)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(ticket.0.clone()))?;
        if self.failing.lock().unwrap().contains(&hash) {
            return Err(TransferError::Relay("connection reset".into()));
        }
        let data = self
            .stored
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
        self.call();
        let len = payload.len() as u64;
        progress(len / 2);
        progress(len);
        self.stored.lock().unwrap().insert(hash.to_string(), payload);
        Ok(())
    }
}
