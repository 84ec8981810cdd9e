//! Ordered background writer.
//!
//! Moves parameter-set writes off the capture thread. Jobs go through a
//! single FIFO worker, so writes for one key land in submission order and
//! the last submitted pair wins. Dropping the store flushes pending writes.

use std::io;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use tracing::{debug, warn};

use super::ParamSetStore;

struct WriteJob {
    key: String,
    blob: Vec<u8>,
}

pub struct BackgroundStore {
    inner: Arc<dyn ParamSetStore>,
    jobs: Option<Sender<WriteJob>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl BackgroundStore {
    pub fn spawn(inner: Arc<dyn ParamSetStore>) -> io::Result<Self> {
        let (jobs, rx) = unbounded::<WriteJob>();
        let store = inner.clone();
        let worker = thread::Builder::new()
            .name("uvch264-persist".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match store.write(&job.key, &job.blob) {
                        Ok(()) => debug!("Persisted parameter sets for '{}'", job.key),
                        Err(e) => warn!("Failed to persist parameter sets for '{}': {}", job.key, e),
                    }
                }
            })?;

        Ok(Self {
            inner,
            jobs: Some(jobs),
            worker: Some(worker),
        })
    }
}

impl ParamSetStore for BackgroundStore {
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        self.inner.read(key)
    }

    /// Queues the write; the result only reports whether the worker is alive.
    fn write(&self, key: &str, blob: &[u8]) -> io::Result<()> {
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "persist worker stopped"))?;
        jobs.send(WriteJob {
            key: key.to_string(),
            blob: blob.to_vec(),
        })
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "persist worker stopped"))
    }
}

impl Drop for BackgroundStore {
    fn drop(&mut self) {
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
