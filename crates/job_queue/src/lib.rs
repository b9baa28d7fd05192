//! Single-slot FIFO job serializer.
//!
//! Externally-visible operations with renderer side effects (start a frame,
//! change scene, store a mesh or texture, rebuild the acceleration structure)
//! must execute one at a time, back to back, each observing the state its
//! predecessor left behind. The queue runs every submitted thunk to completion
//! on one dedicated thread; the thunk itself blocks until its operation has
//! drained, so the next job cannot begin early.
//!
//! A thunk that fails settles its ticket with the error value and the queue
//! continues; nothing propagates across the serializer boundary.

use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

type QueuedJob = Box<dyn FnOnce() + Send>;

/// Settles with the thunk's return value, in submission order relative to
/// every other ticket from the same queue.
pub struct JobTicket<T> {
    result: Receiver<T>,
}

impl<T> JobTicket<T> {
    /// Blocks until the job has run.
    pub fn wait(self) -> Result<T, JobCancelled> {
        self.result.recv().map_err(|_| JobCancelled)
    }

    /// Bounded wait; the ticket stays usable after a timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, JobWaitError> {
        self.result.recv_timeout(timeout).map_err(|error| match error {
            RecvTimeoutError::Timeout => JobWaitError::Timeout,
            RecvTimeoutError::Disconnected => JobWaitError::Cancelled,
        })
    }
}

/// The queue shut down before this job ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobCancelled;

impl fmt::Display for JobCancelled {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "job queue shut down before the job ran")
    }
}

impl std::error::Error for JobCancelled {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobWaitError {
    Timeout,
    Cancelled,
}

impl fmt::Display for JobWaitError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobWaitError::Timeout => write!(formatter, "timed out waiting for job result"),
            JobWaitError::Cancelled => write!(formatter, "job queue shut down before the job ran"),
        }
    }
}

impl std::error::Error for JobWaitError {}

pub struct SerialJobQueue {
    jobs: Option<Sender<QueuedJob>>,
    worker: Option<JoinHandle<()>>,
}

impl SerialJobQueue {
    pub fn new() -> SerialJobQueue {
        let (jobs, queued): (Sender<QueuedJob>, Receiver<QueuedJob>) = unbounded();
        let worker = thread::Builder::new()
            .name("serial-jobs".to_string())
            .spawn(move || {
                for job in queued {
                    job();
                }
            })
            .unwrap_or_else(|error| panic!("failed to spawn serial job thread: {error}"));
        SerialJobQueue {
            jobs: Some(jobs),
            worker: Some(worker),
        }
    }

    /// Appends a job. The returned ticket settles with the thunk's value once
    /// every earlier job has fully finished and this one has run.
    pub fn submit<T, F>(&self, thunk: F) -> JobTicket<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, result) = bounded(1);
        let job: QueuedJob = Box::new(move || {
            // A caller that dropped its ticket still gets the side effects.
            let _ = sender.send(thunk());
        });
        if let Some(jobs) = &self.jobs {
            // A send failure means the worker died; the ticket then reports
            // cancellation through its disconnected channel.
            let _ = jobs.send(job);
        }
        JobTicket { result }
    }
}

impl Default for SerialJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SerialJobQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what was already queued,
        // then exit; join so no job outlives the queue.
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, entry: &'static str) {
        log.lock().expect("log lock").push(entry);
    }

    #[test]
    fn jobs_run_one_at_a_time_in_submission_order() {
        let queue = SerialJobQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        // J1 settles slowest, J3 is synchronous; delivery order must still be
        // J1, J2, J3 and J2 must not begin until J1 has settled.
        let t1 = queue.submit({
            let log = log.clone();
            move || {
                record(&log, "j1:begin");
                std::thread::sleep(Duration::from_millis(30));
                record(&log, "j1:end");
                1u32
            }
        });
        let t2 = queue.submit({
            let log = log.clone();
            move || {
                record(&log, "j2:begin");
                std::thread::sleep(Duration::from_millis(10));
                record(&log, "j2:end");
                2u32
            }
        });
        let t3 = queue.submit({
            let log = log.clone();
            move || {
                record(&log, "j3:begin");
                record(&log, "j3:end");
                3u32
            }
        });

        assert_eq!(t1.wait(), Ok(1));
        assert_eq!(t2.wait(), Ok(2));
        assert_eq!(t3.wait(), Ok(3));
        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["j1:begin", "j1:end", "j2:begin", "j2:end", "j3:begin", "j3:end"]
        );
    }

    #[test]
    fn failing_job_settles_its_ticket_and_queue_continues() {
        let queue = SerialJobQueue::new();
        let failed = queue.submit(|| -> Result<u32, String> { Err("boom".to_string()) });
        let after = queue.submit(|| -> Result<u32, String> { Ok(5) });

        assert_eq!(failed.wait(), Ok(Err("boom".to_string())));
        assert_eq!(after.wait(), Ok(Ok(5)));
    }

    #[test]
    fn drop_drains_already_queued_jobs() {
        let queue = SerialJobQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let _ticket = queue.submit({
            let ran = ran.clone();
            move || {
                std::thread::sleep(Duration::from_millis(20));
                ran.store(true, Ordering::SeqCst);
            }
        });
        drop(queue);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_timeout_reports_slow_jobs() {
        let queue = SerialJobQueue::new();
        let ticket = queue.submit(|| std::thread::sleep(Duration::from_millis(200)));
        assert_eq!(
            ticket.wait_timeout(Duration::from_millis(10)),
            Err(JobWaitError::Timeout)
        );
    }
}
