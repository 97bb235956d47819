//! Background extraction with a completion inbox.
//!
//! The worker owns one thread and two channels. Jobs go in through
//! [`ExtractionWorker::submit`]; completions are drained by the owning thread
//! with [`ExtractionWorker::try_recv`] or [`ExtractionWorker::recv_timeout`],
//! so registry and document state are only ever touched there.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::error::{Result, TagError};
use crate::normalize::normalize;
use crate::oracle::EntityExtractor;
use crate::trigger::Trigger;

#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub id: u64,
    pub trigger: Trigger,
}

/// A finished job: the trigger it ran for and the normalized tags.
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub id: u64,
    pub trigger: Trigger,
    pub result: Result<BTreeSet<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    id: u64,
}

impl JobHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

pub struct ExtractionWorker {
    jobs: Option<Sender<ExtractionJob>>,
    completions: Receiver<ExtractionOutcome>,
    thread: Option<JoinHandle<()>>,
    next_id: u64,
}

impl ExtractionWorker {
    pub fn spawn(extractor: Arc<dyn EntityExtractor>, min_confidence: f32) -> Result<Self> {
        let (job_tx, job_rx) = unbounded::<ExtractionJob>();
        let (done_tx, done_rx) = unbounded::<ExtractionOutcome>();

        let thread = thread::Builder::new()
            .name("taglink-extract".to_string())
            .spawn(move || {
                for job in job_rx {
                    debug!(job = job.id, oracle = extractor.name(), "running extraction");
                    let result = extractor
                        .predict(&job.trigger.delta)
                        .map(|tokens| normalize(&tokens, min_confidence));
                    let outcome = ExtractionOutcome {
                        id: job.id,
                        trigger: job.trigger,
                        result,
                    };
                    if done_tx.send(outcome).is_err() {
                        break;
                    }
                }
            })?;

        Ok(Self {
            jobs: Some(job_tx),
            completions: done_rx,
            thread: Some(thread),
            next_id: 1,
        })
    }

    pub fn submit(&mut self, trigger: Trigger) -> Result<JobHandle> {
        let id = self.next_id;
        let sender = self
            .jobs
            .as_ref()
            .ok_or_else(|| TagError::OracleUnavailable("extraction worker shut down".into()))?;
        sender
            .send(ExtractionJob { id, trigger })
            .map_err(|_| TagError::OracleUnavailable("extraction worker stopped".into()))?;
        self.next_id += 1;
        Ok(JobHandle { id })
    }

    pub fn try_recv(&self) -> Option<ExtractionOutcome> {
        self.completions.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ExtractionOutcome> {
        match self.completions.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("extraction worker exited");
                None
            }
        }
    }

    /// Closes the job channel and waits for the thread to finish its queue.
    pub fn shutdown(mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("extraction worker panicked");
            }
        }
    }
}

impl Drop for ExtractionWorker {
    fn drop(&mut self) {
        // Not joined: the thread exits once its current job returns.
        self.jobs.take();
    }
}
