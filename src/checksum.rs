//! Serial MD5 digest queue (spec §4.2).
//!
//! At most one digest runs at a time: hard-disk heads are seek-bound, and
//! running digests in parallel regresses throughput rather than improving
//! it. A single worker thread drains a FIFO of path+responder pairs, the
//! same single-writer-thread-over-`mpsc` shape the metadata store's writer
//! uses.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use md5::{Digest, Md5};

use crate::error::ChecksumError;

/// Total time budget for transient-error retries before giving up.
const RETRY_BUDGET: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);

pub trait Checksumer: Send + Sync {
    fn checksum(&self, path: &Path) -> Result<[u8; 16], ChecksumError>;
}

enum Job {
    Checksum(PathBuf, Sender<Result<[u8; 16], ChecksumError>>),
    Shutdown,
}

/// Serial MD5 worker backed by its own OS thread.
pub struct Md5Checksumer {
    sender: Sender<Job>,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Md5Checksumer {
    pub fn spawn() -> Self {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::spawn(move || worker_loop(receiver));
        Md5Checksumer {
            sender,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(Job::Shutdown);
        if let Ok(mut guard) = self.handle.lock()
            && let Some(handle) = guard.take()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for Md5Checksumer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Checksumer for Md5Checksumer {
    fn checksum(&self, path: &Path) -> Result<[u8; 16], ChecksumError> {
        let (tx, rx) = mpsc::channel();
        self.sender
            .send(Job::Checksum(path.to_path_buf(), tx))
            .map_err(|_| ChecksumError::Io(std::io::Error::other("checksum worker stopped")))?;
        rx.recv()
            .map_err(|_| ChecksumError::Io(std::io::Error::other("checksum worker stopped")))?
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    for job in receiver {
        match job {
            Job::Checksum(path, responder) => {
                let result = digest_with_retry(&path);
                let _ = responder.send(result);
            }
            Job::Shutdown => break,
        }
    }
}

fn digest_with_retry(path: &Path) -> Result<[u8; 16], ChecksumError> {
    let mut backoff = INITIAL_BACKOFF;
    let mut elapsed = Duration::ZERO;
    let mut retried_other_once = false;

    loop {
        match digest_once(path) {
            Ok(sum) => return Ok(sum),
            Err(ChecksumError::Missing) => return Err(ChecksumError::Missing),
            Err(ChecksumError::Busy) => {
                if elapsed >= RETRY_BUDGET {
                    return Err(ChecksumError::Busy);
                }
                thread::sleep(backoff);
                elapsed += backoff;
                backoff = (backoff * 2).min(RETRY_BUDGET - elapsed);
            }
            Err(other @ ChecksumError::Io(_)) => {
                if retried_other_once {
                    return Err(other);
                }
                retried_other_once = true;
                thread::sleep(INITIAL_BACKOFF);
            }
        }
    }
}

fn digest_once(path: &Path) -> Result<[u8; 16], ChecksumError> {
    let file = std::fs::File::open(path).map_err(classify_io)?;
    let mut reader = std::io::BufReader::new(file);
    let mut hasher = Md5::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(classify_io)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}

fn classify_io(err: std::io::Error) -> ChecksumError {
    match err.kind() {
        std::io::ErrorKind::NotFound => ChecksumError::Missing,
        std::io::ErrorKind::WouldBlock => ChecksumError::Busy,
        _ => ChecksumError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn digests_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::File::create(&path).unwrap().write_all(b"hello world").unwrap();

        let checksumer = Md5Checksumer::spawn();
        let sum = checksumer.checksum(&path).unwrap();
        // md5("hello world")
        assert_eq!(hex(&sum), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[test]
    fn missing_file_surfaces_immediately() {
        let checksumer = Md5Checksumer::spawn();
        let err = checksumer.checksum(Path::new("/nonexistent/path/for/test")).unwrap_err();
        assert!(matches!(err, ChecksumError::Missing));
    }

    #[test]
    fn serializes_across_concurrent_callers() {
        let dir = tempfile::tempdir().unwrap();
        let checksumer = std::sync::Arc::new(Md5Checksumer::spawn());
        let mut handles = Vec::new();
        for i in 0..8 {
            let path = dir.path().join(format!("f{i}.txt"));
            std::fs::write(&path, format!("payload-{i}")).unwrap();
            let checksumer = checksumer.clone();
            handles.push(thread::spawn(move || checksumer.checksum(&path).unwrap()));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
