//! Parallel script verification with fail-fast batches.
//!
//! A [`CheckQueue`] owns a fixed set of worker threads fed from one crossbeam channel. Each
//! [`CheckQueue::verify_all`] call submits a batch with its own result channel and blocks
//! until every job has reported or one has failed. After the first failure the remaining jobs of that batch are skipped; jobs
//! already running on other workers are not awaited, their results are discarded.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Sender};
use zcore_consensus::{hash256_to_hex, Hash256};
use zcore_primitives::transaction::Transaction;
use zcore_script::{verify_script, ScriptError, ScriptFlags};

use crate::utxo::UtxoEntry;

/// One transparent input to check against the output it spends.
#[derive(Clone, Debug)]
pub struct ScriptJob {
    pub tx: Arc<Transaction>,
    pub txid: Hash256,
    pub input_index: usize,
    pub spent: UtxoEntry,
    pub flags: ScriptFlags,
    pub branch_id: u32,
}

/// The predicate run for each job. Must not touch shared mutable state.
pub trait ScriptVerifier: Send + Sync {
    fn verify(&self, job: &ScriptJob) -> Result<(), ScriptError>;
}

/// Checks P2PKH and P2PK spends with secp256k1.
#[derive(Clone, Copy, Debug, Default)]
pub struct TemplateVerifier;

impl ScriptVerifier for TemplateVerifier {
    fn verify(&self, job: &ScriptJob) -> Result<(), ScriptError> {
        let input = job
            .tx
            .vin
            .get(job.input_index)
            .ok_or(ScriptError::InvalidStackOperation)?;
        verify_script(
            &input.script_sig,
            &job.spent.script_pubkey,
            &job.tx,
            job.input_index,
            job.spent.value,
            job.flags,
            job.branch_id,
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CheckFailure {
    Script(ScriptError),
    /// The verifier panicked; treated as a failed check.
    Panic(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptFailure {
    pub txid: Hash256,
    pub input_index: usize,
    pub error: CheckFailure,
}

impl std::fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "script check failed for {}:{}: ",
            hash256_to_hex(&self.txid),
            self.input_index
        )?;
        match &self.error {
            CheckFailure::Script(err) => write!(f, "{err}"),
            CheckFailure::Panic(message) => write!(f, "verifier panicked: {message}"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CheckQueueError {
    Failed(ScriptFailure),
    /// The pool shut down before the batch resolved.
    Cancelled,
}

impl std::fmt::Display for CheckQueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckQueueError::Failed(failure) => write!(f, "{failure}"),
            CheckQueueError::Cancelled => write!(f, "script check queue shut down"),
        }
    }
}

impl std::error::Error for CheckQueueError {}

enum Outcome {
    Passed,
    Failed(ScriptFailure),
    Cancelled,
}

struct Task {
    job: ScriptJob,
    abort: Arc<AtomicBool>,
    results: Sender<Outcome>,
}

pub struct CheckQueue {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    worker_count: usize,
}

impl CheckQueue {
    /// `par` counts the issuing thread, so `par - 1` workers are spawned, at least one.
    pub fn new(par: usize, verifier: Arc<dyn ScriptVerifier>) -> std::io::Result<Self> {
        let worker_count = par.saturating_sub(1).max(1);
        let (sender, receiver) = unbounded::<Task>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let receiver = receiver.clone();
            let verifier = Arc::clone(&verifier);
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("scriptcheck-{worker}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        run_task(task, verifier.as_ref(), &shutdown);
                    }
                })?;
            workers.push(handle);
        }
        zcore_log::log_debug!("started {worker_count} script check workers");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            shutdown,
            worker_count,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Runs every job and blocks until the batch resolves.
    pub fn verify_all(&self, jobs: Vec<ScriptJob>) -> Result<(), CheckQueueError> {
        if self.is_shut_down() {
            return Err(CheckQueueError::Cancelled);
        }
        if jobs.is_empty() {
            return Ok(());
        }
        let sender = self
            .sender
            .lock()
            .expect("check queue sender lock")
            .clone()
            .ok_or(CheckQueueError::Cancelled)?;

        let total = jobs.len();
        let abort = Arc::new(AtomicBool::new(false));
        let (results, outcomes) = bounded::<Outcome>(total);
        for job in jobs {
            let task = Task {
                job,
                abort: Arc::clone(&abort),
                results: results.clone(),
            };
            if sender.send(task).is_err() {
                abort.store(true, Ordering::Release);
                return Err(CheckQueueError::Cancelled);
            }
        }
        drop(sender);
        drop(results);

        for _ in 0..total {
            // A closed channel means queued tasks were dropped without reporting.
            match outcomes.recv().map_err(|_| CheckQueueError::Cancelled)? {
                Outcome::Passed => {}
                Outcome::Failed(failure) => {
                    zcore_log::log_warn!("{failure}");
                    return Err(CheckQueueError::Failed(failure));
                }
                Outcome::Cancelled => return Err(CheckQueueError::Cancelled),
            }
        }
        Ok(())
    }

    /// Stops accepting work, cancels queued jobs and joins the workers. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sender.lock().expect("check queue sender lock").take();
        let workers = std::mem::take(&mut *self.workers.lock().expect("check queue workers lock"));
        for handle in workers {
            let _ = handle.join();
        }
        zcore_log::log_debug!("script check workers stopped");
    }
}

impl Drop for CheckQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_task(task: Task, verifier: &dyn ScriptVerifier, shutdown: &AtomicBool) {
    let Task {
        job,
        abort,
        results,
    } = task;
    let outcome = if shutdown.load(Ordering::Acquire) {
        Outcome::Cancelled
    } else if abort.load(Ordering::Acquire) {
        Outcome::Passed
    } else {
        let error = match catch_unwind(AssertUnwindSafe(|| verifier.verify(&job))) {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(CheckFailure::Script(err)),
            Err(payload) => Some(CheckFailure::Panic(panic_message(payload.as_ref()))),
        };
        match error {
            None => Outcome::Passed,
            Some(error) => {
                abort.store(true, Ordering::Release);
                Outcome::Failed(ScriptFailure {
                    txid: job.txid,
                    input_index: job.input_index,
                    error,
                })
            }
        }
    };
    // The issuer stops listening once the batch resolves.
    let _ = results.send(outcome);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use zcore_primitives::outpoint::OutPoint;
    use zcore_primitives::transaction::TxIn;

    use super::*;

    /// Fails jobs whose input index is in `failing`; counts executions.
    struct Scripted {
        failing: Vec<usize>,
        executed: Mutex<Vec<usize>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(failing: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                failing,
                executed: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ScriptVerifier for Scripted {
        fn verify(&self, job: &ScriptJob) -> Result<(), ScriptError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.executed.lock().expect("executed").push(job.input_index);
            if job.input_index == usize::MAX {
                panic!("boom");
            }
            if self.failing.contains(&job.input_index) {
                Err(ScriptError::SigCheck)
            } else {
                Ok(())
            }
        }
    }

    fn jobs(count: usize) -> Vec<ScriptJob> {
        let mut tx = Transaction::default();
        tx.vin.push(TxIn {
            prevout: OutPoint::new([1u8; 32], 0),
            script_sig: Vec::new(),
            sequence: u32::MAX,
        });
        let tx = Arc::new(tx);
        (0..count)
            .map(|input_index| ScriptJob {
                tx: Arc::clone(&tx),
                txid: [input_index as u8; 32],
                input_index,
                spent: UtxoEntry {
                    value: 1,
                    script_pubkey: Vec::new(),
                    height: 0,
                    is_coinbase: false,
                },
                flags: 0,
                branch_id: 0,
            })
            .collect()
    }

    #[test]
    fn empty_batch_succeeds() {
        let verifier = Scripted::new(Vec::new());
        let queue = CheckQueue::new(4, verifier.clone()).expect("queue");
        assert_eq!(queue.worker_count(), 3);
        assert_eq!(queue.verify_all(Vec::new()), Ok(()));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn all_jobs_run_when_valid() {
        let verifier = Scripted::new(Vec::new());
        let queue = CheckQueue::new(3, verifier.clone()).expect("queue");
        assert_eq!(queue.verify_all(jobs(50)), Ok(()));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn single_worker_stops_at_first_failure() {
        let verifier = Scripted::new(vec![3, 7]);
        let queue = CheckQueue::new(1, verifier.clone()).expect("queue");
        let err = queue.verify_all(jobs(10)).expect_err("failure");
        let CheckQueueError::Failed(failure) = err else {
            panic!("expected failure, got {err:?}");
        };
        assert_eq!(failure.input_index, 3);
        assert_eq!(failure.txid, [3u8; 32]);
        assert_eq!(failure.error, CheckFailure::Script(ScriptError::SigCheck));

        // Joining the worker drains the skipped jobs without running them.
        queue.shutdown();
        assert_eq!(*verifier.executed.lock().expect("executed"), vec![0, 1, 2, 3]);
    }

    #[test]
    fn panicking_verifier_is_a_failure() {
        let verifier = Scripted::new(Vec::new());
        let queue = CheckQueue::new(2, verifier).expect("queue");
        let mut batch = jobs(2);
        batch[1].input_index = usize::MAX;
        match queue.verify_all(batch) {
            Err(CheckQueueError::Failed(failure)) => {
                assert_eq!(failure.error, CheckFailure::Panic("boom".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(queue.verify_all(jobs(4)), Ok(()));
    }

    #[test]
    fn batches_after_shutdown_are_cancelled() {
        let queue = CheckQueue::new(2, Scripted::new(Vec::new())).expect("queue");
        queue.shutdown();
        queue.shutdown();
        assert!(queue.is_shut_down());
        assert_eq!(queue.verify_all(jobs(1)), Err(CheckQueueError::Cancelled));
        assert_eq!(queue.verify_all(Vec::new()), Err(CheckQueueError::Cancelled));
    }
}
