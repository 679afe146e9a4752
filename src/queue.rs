use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::types::Job;

/// Dispatch callback installed at composition time. Must be fire-and-forget:
/// the queue does not await it and relies on exactly one later
/// `on_job_complete` to release the slot. A synchronous `Err` is the one
/// exception: the queue releases the slot itself and reports the job
/// through the failure handler.
pub type Processor = Arc<dyn Fn(Job) -> anyhow::Result<()> + Send + Sync>;

/// Invoked when a processor fails synchronously, so the composition root can
/// mark the affected record before processing continues.
pub type FailureHandler = Arc<dyn Fn(&Job, anyhow::Error) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_queued: usize,
    pub max_concurrent: usize,
}

/// Bounded FIFO with admission control and a concurrency gate.
pub struct JobQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
}

struct QueueState {
    pending: VecDeque<Job>,
    active: usize,
    processor: Option<Processor>,
    on_failure: Option<FailureHandler>,
}

impl JobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                active: 0,
                processor: None,
                on_failure: None,
            }),
        }
    }

    /// Install the processor and immediately dispatch as much of the backlog
    /// as capacity allows.
    pub fn set_processor(&self, processor: Processor) {
        self.state.lock().unwrap().processor = Some(processor);
        self.drain();
    }

    pub fn set_failure_handler(&self, handler: FailureHandler) {
        self.state.lock().unwrap().on_failure = Some(handler);
    }

    /// Admit a job. Returns `false` when the pending backlog is at capacity.
    pub fn enqueue(&self, job: Job) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.pending.len() >= self.config.max_queued {
                tracing::warn!(scan_id = %job.scan_id, "queue full, rejecting job");
                return false;
            }
            state.pending.push_back(job);
        }
        self.drain();
        true
    }

    /// Release one concurrency slot and dispatch the next pending job.
    /// Exactly one call is expected per dispatched job.
    pub fn on_job_complete(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.active = state.active.saturating_sub(1);
        }
        self.drain();
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }

    pub fn is_full(&self) -> bool {
        self.pending() >= self.config.max_queued
    }

    /// Pop and dispatch while a processor is installed, a slot is free, and
    /// jobs are pending. The processor runs outside the lock.
    fn drain(&self) {
        loop {
            let (job, processor) = {
                let mut state = self.state.lock().unwrap();
                let Some(processor) = state.processor.clone() else {
                    return;
                };
                if state.active >= self.config.max_concurrent {
                    return;
                }
                let Some(job) = state.pending.pop_front() else {
                    return;
                };
                state.active += 1;
                (job, processor)
            };

            if let Err(err) = processor(job.clone()) {
                tracing::warn!(scan_id = %job.scan_id, error = %err, "processor failed synchronously");
                let handler = self.state.lock().unwrap().on_failure.clone();
                if let Some(handler) = handler {
                    handler(&job, err);
                }
                // The dispatched job will never settle itself; give the slot
                // back here and keep draining.
                let mut state = self.state.lock().unwrap();
                state.active = state.active.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(id: &str) -> Job {
        Job {
            scan_id: id.to_string(),
            repo_url: "https://github.com/owner/repo".to_string(),
        }
    }

    fn counting_processor(counter: Arc<AtomicUsize>) -> Processor {
        Arc::new(move |_job| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn enqueue_rejects_exactly_at_capacity() {
        let queue = JobQueue::new(QueueConfig {
            max_queued: 1,
            max_concurrent: 0,
        });
        assert!(queue.enqueue(job("a")));
        assert!(queue.is_full());
        assert!(!queue.enqueue(job("b")));
        assert_eq!(queue.pending(), 1);
    }

    #[test]
    fn concurrency_gate_holds_jobs_back() {
        let dispatched = Arc::new(AtomicUsize::new(0));
        let queue = JobQueue::new(QueueConfig {
            max_queued: 10,
            max_concurrent: 1,
        });
        queue.set_processor(counting_processor(dispatched.clone()));

        assert!(queue.enqueue(job("a")));
        assert!(queue.enqueue(job("b")));
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);
        assert_eq!(queue.active(), 1);
        assert_eq!(queue.pending(), 1);

        queue.on_job_complete();
        assert_eq!(dispatched.load(Ordering::SeqCst), 2);
        assert_eq!(queue.active(), 1);
        assert_eq!(queue.pending(), 0);

        queue.on_job_complete();
        assert_eq!(queue.active(), 0);
    }

    #[test]
    fn set_processor_drains_backlog_in_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let queue = JobQueue::new(QueueConfig {
            max_queued: 10,
            max_concurrent: 10,
        });
        assert!(queue.enqueue(job("first")));
        assert!(queue.enqueue(job("second")));
        assert!(queue.enqueue(job("third")));

        let seen = order.clone();
        queue.set_processor(Arc::new(move |job| {
            seen.lock().unwrap().push(job.scan_id);
            Ok(())
        }));

        assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
        assert_eq!(queue.active(), 3);
    }

    #[test]
    fn failing_processor_does_not_leak_a_slot() {
        let failures = Arc::new(AtomicUsize::new(0));
        let queue = JobQueue::new(QueueConfig {
            max_queued: 10,
            max_concurrent: 1,
        });

        let seen = failures.clone();
        queue.set_failure_handler(Arc::new(move |_job, _err| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        queue.set_processor(Arc::new(|_job| anyhow::bail!("spawn refused")));

        assert!(queue.enqueue(job("a")));
        assert!(queue.enqueue(job("b")));

        // Both jobs were attempted and both slots came back.
        assert_eq!(failures.load(Ordering::SeqCst), 2);
        assert_eq!(queue.active(), 0);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn on_job_complete_floors_at_zero() {
        let queue = JobQueue::new(QueueConfig {
            max_queued: 1,
            max_concurrent: 1,
        });
        queue.on_job_complete();
        queue.on_job_complete();
        assert_eq!(queue.active(), 0);
    }

    #[test]
    fn active_never_exceeds_max_concurrent() {
        let queue = JobQueue::new(QueueConfig {
            max_queued: 20,
            max_concurrent: 3,
        });
        let dispatched = Arc::new(AtomicUsize::new(0));
        queue.set_processor(counting_processor(dispatched.clone()));

        for i in 0..10 {
            queue.enqueue(job(&format!("s{i}")));
            assert!(queue.active() <= 3);
        }
        assert_eq!(queue.active(), 3);
        assert_eq!(queue.pending(), 7);
    }
}
