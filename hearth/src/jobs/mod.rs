//! Fixed-size worker pool with dependency fan-in.
//!
//! Jobs live in a generational handle pool, as every other pooled resource
//! does. A job becomes eligible when its remaining-dependency counter hits
//! zero; completion walks the job's dependents under that job's own lock and
//! decrements each counter. Each worker owns a scratch arena handed to the
//! running job and reset when it returns, so jobs may allocate freely
//! without leaking. Cancellation is cooperative: jobs observe a pool flag
//! and may return [`JobResult::Aborted`]; nothing is preempted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{error, trace};

use hearth_containers::{Handle, HandlePool, ScratchArena};

pub const MAX_JOB_COUNT: u32 = 4096;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobResult {
    Succeeded,
    Failed,
    Aborted,
}

/// Everything a job's work function gets from its worker.
pub struct JobContext<'a> {
    pub scratch: &'a ScratchArena,
    cancel: &'a AtomicBool,
}

impl JobContext<'_> {
    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

type JobProc = Box<dyn FnOnce(&JobContext) -> JobResult + Send>;
type JobCompletedProc = Box<dyn FnOnce(JobResult) + Send>;

struct JobState {
    proc: Option<JobProc>,
    completed_proc: Option<JobCompletedProc>,
    finished: bool,
    result: Option<JobResult>,
    remaining_job_count: u32,
    dependent_jobs: Vec<JobHandle>,
}

/// One scheduled job. The slot's mutex guards the dependency bookkeeping;
/// the condvar wakes `wait_for_job` callers.
pub struct Job {
    state: Mutex<JobState>,
    done: Condvar,
}

pub type JobHandle = Handle<Arc<Job>>;

/// Data handed to [`JobPool::execute_job`].
pub struct JobData {
    pub proc: JobProc,
    pub completed_proc: Option<JobCompletedProc>,
}

impl JobData {
    pub fn new(proc: impl FnOnce(&JobContext) -> JobResult + Send + 'static) -> Self {
        Self {
            proc: Box::new(proc),
            completed_proc: None,
        }
    }

    pub fn with_completion(
        mut self,
        completed: impl FnOnce(JobResult) + Send + 'static,
    ) -> Self {
        self.completed_proc = Some(Box::new(completed));
        self
    }
}

enum WorkerMessage {
    Run(JobHandle),
    Stop,
}

struct InFlight {
    count: Mutex<u32>,
    all_done: Condvar,
}

pub struct JobPool {
    jobs: HandlePool<Arc<Job>>,
    sender: Sender<WorkerMessage>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<InFlight>,
    cancel: Arc<AtomicBool>,
}

impl std::fmt::Debug for JobPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPool")
            .field("scheduled", &self.jobs.len())
            .finish()
    }
}

impl JobPool {
    pub fn new(worker_count: usize) -> Arc<Self> {
        let (sender, receiver) = unbounded::<WorkerMessage>();
        let pool = Arc::new(Self {
            jobs: HandlePool::new(MAX_JOB_COUNT),
            sender,
            workers: Mutex::new(Vec::new()),
            in_flight: Arc::new(InFlight {
                count: Mutex::new(0),
                all_done: Condvar::new(),
            }),
            cancel: Arc::new(AtomicBool::new(false)),
        });

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for worker_index in 0..worker_count.max(1) {
            let pool = pool.clone();
            let receiver: Receiver<WorkerMessage> = receiver.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("hearth-worker-{worker_index}"))
                    .spawn(move || pool.worker_loop(receiver))
                    .expect("failed to spawn worker thread"),
            );
        }
        *pool.workers.lock().unwrap_or_else(|poison| poison.into_inner()) = workers;
        pool
    }

    fn worker_loop(&self, receiver: Receiver<WorkerMessage>) {
        let mut scratch = ScratchArena::default();
        while let Ok(message) = receiver.recv() {
            let handle = match message {
                WorkerMessage::Run(handle) => handle,
                WorkerMessage::Stop => break,
            };
            let Ok(job) = self.jobs.get_cloned(&handle) else {
                continue;
            };
            let proc = job
                .state
                .lock()
                .unwrap_or_else(|poison| poison.into_inner())
                .proc
                .take();
            let result = match proc {
                Some(proc) => {
                    let result = {
                        let context = JobContext {
                            scratch: &scratch,
                            cancel: self.cancel.as_ref(),
                        };
                        proc(&context)
                    };
                    scratch.reset();
                    result
                }
                None => JobResult::Failed,
            };
            self.complete(handle, &job, result);
        }
    }

    fn complete(&self, handle: JobHandle, job: &Arc<Job>, result: JobResult) {
        let (completed_proc, dependents) = {
            let mut state = job.state.lock().unwrap_or_else(|poison| poison.into_inner());
            state.finished = true;
            state.result = Some(result);
            (
                state.completed_proc.take(),
                std::mem::take(&mut state.dependent_jobs),
            )
        };
        job.done.notify_all();

        if let Some(completed_proc) = completed_proc {
            completed_proc(result);
        }

        // release the slot; waiters hold the Arc, stale handles read as done
        if let Err(err) = self.jobs.release(handle) {
            error!("job slot release failed: {err}");
        }

        for dependent in dependents {
            self.decrement_remaining(dependent);
        }

        let mut count = self
            .in_flight
            .count
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        *count -= 1;
        if *count == 0 {
            self.in_flight.all_done.notify_all();
        }
    }

    fn decrement_remaining(&self, handle: JobHandle) {
        let Ok(job) = self.jobs.get_cloned(&handle) else {
            return;
        };
        let ready = {
            let mut state = job.state.lock().unwrap_or_else(|poison| poison.into_inner());
            state.remaining_job_count -= 1;
            state.remaining_job_count == 0
        };
        if ready {
            let _ = self.sender.send(WorkerMessage::Run(handle));
        }
    }

    /// Schedule a job. Entries in `wait_for_jobs` may be
    /// [`Handle::INVALID`] or already completed; both count as satisfied.
    pub fn execute_job(&self, data: JobData, wait_for_jobs: &[JobHandle]) -> JobHandle {
        // +1 sentinel dropped after registration, so the job cannot fire
        // while its dependency list is still being wired up
        let job = Arc::new(Job {
            state: Mutex::new(JobState {
                proc: Some(data.proc),
                completed_proc: data.completed_proc,
                finished: false,
                result: None,
                remaining_job_count: wait_for_jobs.len() as u32 + 1,
                dependent_jobs: Vec::new(),
            }),
            done: Condvar::new(),
        });
        let handle = match self.jobs.acquire(job) {
            Ok(handle) => handle,
            // design-time fixed capacity; running out is a programmer error
            Err(err) => panic!("job pool exhausted: {err}"),
        };

        {
            let mut count = self
                .in_flight
                .count
                .lock()
                .unwrap_or_else(|poison| poison.into_inner());
            *count += 1;
        }

        for dependency in wait_for_jobs {
            let registered = if dependency.is_invalid() {
                false
            } else {
                match self.jobs.get_cloned(dependency) {
                    Ok(dependency_job) => {
                        let mut state = dependency_job
                            .state
                            .lock()
                            .unwrap_or_else(|poison| poison.into_inner());
                        if state.finished {
                            false
                        } else {
                            state.dependent_jobs.push(handle);
                            true
                        }
                    }
                    // stale handle: the dependency already completed
                    Err(_) => false,
                }
            };
            if !registered {
                self.decrement_remaining(handle);
            }
        }
        self.decrement_remaining(handle);

        trace!(job = handle.index(), dependencies = wait_for_jobs.len(), "scheduled job");
        handle
    }

    /// Block until `handle`'s job completes. Invalid or recycled handles are
    /// treated as already finished.
    pub fn wait_for_job(&self, handle: JobHandle) -> JobResult {
        let Ok(job) = self.jobs.get_cloned(&handle) else {
            return JobResult::Succeeded;
        };
        let mut state = job.state.lock().unwrap_or_else(|poison| poison.into_inner());
        while !state.finished {
            state = job
                .done
                .wait(state)
                .unwrap_or_else(|poison| poison.into_inner());
        }
        state.result.unwrap_or(JobResult::Succeeded)
    }

    /// Block until the global in-flight counter hits zero.
    pub fn wait_for_all_jobs_to_finish(&self) {
        let mut count = self
            .in_flight
            .count
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        while *count != 0 {
            count = self
                .in_flight
                .all_done
                .wait(count)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn shutdown(&self) {
        self.request_cancel();
        self.wait_for_all_jobs_to_finish();
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|poison| poison.into_inner()),
        );
        for _ in 0..workers.len() {
            let _ = self.sender.send(WorkerMessage::Stop);
        }
        for worker in workers {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pool() -> Arc<JobPool> {
        JobPool::new(4)
    }

    #[test]
    fn jobs_run_and_complete() {
        let pool = pool();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let handle = pool.execute_job(
            JobData::new(move |_| {
                flag.store(true, Ordering::SeqCst);
                JobResult::Succeeded
            }),
            &[],
        );
        assert_eq!(pool.wait_for_job(handle), JobResult::Succeeded);
        assert!(ran.load(Ordering::SeqCst));
        pool.shutdown();
    }

    #[test]
    fn dependencies_order_execution() {
        let pool = pool();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_order = order.clone();
        let first = pool.execute_job(
            JobData::new(move |_| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                first_order.lock().unwrap().push(1);
                JobResult::Succeeded
            }),
            &[],
        );
        let second_order = order.clone();
        let second = pool.execute_job(
            JobData::new(move |_| {
                second_order.lock().unwrap().push(2);
                JobResult::Succeeded
            }),
            &[first],
        );
        let third_order = order.clone();
        let third = pool.execute_job(
            JobData::new(move |_| {
                third_order.lock().unwrap().push(3);
                JobResult::Succeeded
            }),
            &[second],
        );

        pool.wait_for_job(third);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        pool.shutdown();
    }

    #[test]
    fn completed_and_invalid_dependencies_schedule_immediately() {
        let pool = pool();
        let first = pool.execute_job(JobData::new(|_| JobResult::Succeeded), &[]);
        pool.wait_for_job(first);

        let handle = pool.execute_job(
            JobData::new(|_| JobResult::Succeeded),
            &[first, JobHandle::INVALID],
        );
        assert_eq!(pool.wait_for_job(handle), JobResult::Succeeded);
        pool.shutdown();
    }

    #[test]
    fn completion_proc_sees_the_result() {
        let pool = pool();
        let observed = Arc::new(Mutex::new(None));
        let slot = observed.clone();
        let handle = pool.execute_job(
            JobData::new(|_| JobResult::Failed)
                .with_completion(move |result| *slot.lock().unwrap() = Some(result)),
            &[],
        );
        assert_eq!(pool.wait_for_job(handle), JobResult::Failed);
        assert_eq!(*observed.lock().unwrap(), Some(JobResult::Failed));
        pool.shutdown();
    }

    #[test]
    fn wait_for_all_jobs() {
        let pool = pool();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = counter.clone();
            pool.execute_job(
                JobData::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    JobResult::Succeeded
                }),
                &[],
            );
        }
        pool.wait_for_all_jobs_to_finish();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
        pool.shutdown();
    }

    #[test]
    fn scratch_is_usable_and_reset_between_jobs() {
        let pool = JobPool::new(1);
        let first = pool.execute_job(
            JobData::new(|context| {
                let bytes = context.scratch.alloc_slice::<u64>(128);
                bytes.fill(0xdead_beef);
                JobResult::Succeeded
            }),
            &[],
        );
        pool.wait_for_job(first);
        let second = pool.execute_job(
            JobData::new(|context| {
                // the worker reset its arena after the previous job
                if context.scratch.bytes_in_use() == 0 {
                    JobResult::Succeeded
                } else {
                    JobResult::Failed
                }
            }),
            &[],
        );
        assert_eq!(pool.wait_for_job(second), JobResult::Succeeded);
        pool.shutdown();
    }

    #[test]
    fn cancellation_is_observable() {
        let pool = pool();
        pool.request_cancel();
        let handle = pool.execute_job(
            JobData::new(|context| {
                if context.cancel_requested() {
                    JobResult::Aborted
                } else {
                    JobResult::Succeeded
                }
            }),
            &[],
        );
        assert_eq!(pool.wait_for_job(handle), JobResult::Aborted);
        pool.shutdown();
    }

    #[test]
    fn fan_in_dependencies() {
        let pool = pool();
        let counter = Arc::new(AtomicUsize::new(0));
        let mut dependencies = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            dependencies.push(pool.execute_job(
                JobData::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    JobResult::Succeeded
                }),
                &[],
            ));
        }
        let counter_at_fan_in = counter.clone();
        let observed = Arc::new(AtomicUsize::new(0));
        let observed_slot = observed.clone();
        let fan_in = pool.execute_job(
            JobData::new(move |_| {
                observed_slot.store(counter_at_fan_in.load(Ordering::SeqCst), Ordering::SeqCst);
                JobResult::Succeeded
            }),
            &dependencies,
        );
        pool.wait_for_job(fan_in);
        assert_eq!(observed.load(Ordering::SeqCst), 8);
        pool.shutdown();
    }
}
