//! Worker slot scheduler
//!
//! Owns a fixed number of worker slots and a FIFO queue of test groups.
//! Free slots take the first runnable group, preferring a slot whose worker
//! already has the group's hash. State lives behind one lock that is never
//! held across an await; every transition re-checks `is_stopped` after
//! awaiting.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

use super::job::{Job, JobOutcome, RunContext};
use super::worker_host::WorkerHost;
use super::TestGroup;
use crate::config::FullConfig;
use crate::error::CoreError;
use crate::ipc::{ProcessExitData, WorkerEvent, WorkerInitParams, WorkerLauncher};

#[derive(Default)]
struct Slot {
    busy: bool,
    /// Project of the job occupying the slot.
    project_id: Option<String>,
    worker: Option<Arc<WorkerHost>>,
}

struct State {
    run: RunContext,
    queue: VecDeque<TestGroup>,
    slots: Vec<Slot>,
    queued_or_running_hash_count: HashMap<String, usize>,
    worker_limit_per_project: HashMap<String, usize>,
    is_stopped: bool,
    next_worker_index: usize,
}

impl State {
    fn update_hash_count(&mut self, hash: &str, delta: isize) {
        let count = self
            .queued_or_running_hash_count
            .entry(hash.to_string())
            .or_insert(0);
        *count = count.saturating_add_signed(delta);
    }

    /// First queued group whose project is below its worker limit.
    fn find_first_job_to_run(&self) -> Option<usize> {
        self.queue.iter().position(|job| {
            let Some(limit) = self.worker_limit_per_project.get(&job.project_id) else {
                return true;
            };
            let running = self
                .slots
                .iter()
                .filter(|s| s.busy && s.project_id.as_deref() == Some(job.project_id.as_str()))
                .count();
            running < *limit
        })
    }

    /// More live workers have this hash than there is work for.
    fn is_worker_redundant(&self, worker: &WorkerHost) -> bool {
        let with_same_hash = self
            .slots
            .iter()
            .filter_map(|s| s.worker.as_ref())
            .filter(|w| !w.did_send_stop() && w.hash() == worker.hash())
            .count();
        let needed = self
            .queued_or_running_hash_count
            .get(worker.hash())
            .copied()
            .unwrap_or(0);
        with_same_hash > needed
    }

    fn is_finished(&self) -> bool {
        (self.queue.is_empty() || self.is_stopped) && self.slots.iter().all(|s| !s.busy)
    }

    fn stop(&mut self) {
        if !self.is_stopped {
            info!("Stopping the run");
        }
        self.is_stopped = true;
        for worker in self.slots.iter().filter_map(|s| s.worker.as_ref()) {
            worker.stop(false);
        }
    }

    fn apply_stop_request(&mut self) {
        if self.run.stop_requested && !self.is_stopped {
            self.stop();
        }
    }

    fn clear_worker(&mut self, worker: &Arc<WorkerHost>) {
        for slot in &mut self.slots {
            if slot.worker.as_ref().is_some_and(|w| Arc::ptr_eq(w, worker)) {
                slot.worker = None;
            }
        }
    }

    fn on_idle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::StdOut(payload) => self.run.report_output(&payload, false),
            WorkerEvent::StdErr(payload) => self.run.report_output(&payload, true),
            WorkerEvent::TeardownErrors(payload) => {
                self.run.report_worker_errors(&payload.fatal_errors)
            }
            other => trace!("Ignoring {:?} from an idle worker", other),
        }
    }
}

enum Completion {
    Job {
        slot: usize,
        /// Worker to stop in the background, and whether it failed.
        stop: Option<(Arc<WorkerHost>, bool)>,
    },
    WorkerStopped,
}

struct Inner {
    config: FullConfig,
    launcher: Arc<dyn WorkerLauncher>,
    state: Mutex<State>,
}

pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        config: FullConfig,
        launcher: Arc<dyn WorkerLauncher>,
        run: RunContext,
        groups: Vec<TestGroup>,
    ) -> Self {
        let worker_limit_per_project = config
            .projects
            .iter()
            .filter_map(|p| p.workers.map(|w| (p.id.clone(), w)))
            .collect();
        let mut state = State {
            run,
            queue: VecDeque::new(),
            slots: (0..config.workers.max(1)).map(|_| Slot::default()).collect(),
            queued_or_running_hash_count: HashMap::new(),
            worker_limit_per_project,
            is_stopped: false,
            next_worker_index: 0,
        };
        for group in groups {
            state.update_hash_count(&group.worker_hash, 1);
            state.queue.push_back(group);
        }
        Self {
            inner: Arc::new(Inner {
                config,
                launcher,
                state: Mutex::new(state),
            }),
        }
    }

    /// Run every queued group, then stop all workers. Returns the run state
    /// with the results of every test.
    pub async fn run(self) -> Result<RunContext, CoreError> {
        let inner = self.inner;
        {
            let mut state = inner.state.lock();
            debug!(
                "Dispatching {} groups to {} slots",
                state.queue.len(),
                state.slots.len()
            );
            if state.run.failure_tracker.has_reached_max_failures() {
                state.stop();
            }
        }

        let mut pending: FuturesUnordered<BoxFuture<'static, Completion>> = FuturesUnordered::new();
        loop {
            inner.schedule_jobs(&mut pending);
            if inner.state.lock().is_finished() {
                break;
            }
            match pending.next().await {
                Some(Completion::Job { slot, stop }) => {
                    let mut state = inner.state.lock();
                    state.slots[slot].busy = false;
                    state.slots[slot].project_id = None;
                    drop(state);
                    if let Some((worker, did_fail)) = stop {
                        pending.push(inner.clone().stop_worker(worker, did_fail).boxed());
                    }
                }
                Some(Completion::WorkerStopped) => {}
                None => break,
            }
        }

        let workers: Vec<Arc<WorkerHost>> = {
            let mut state = inner.state.lock();
            state.stop();
            state.slots.iter().filter_map(|s| s.worker.clone()).collect()
        };
        for worker in workers {
            pending.push(inner.clone().stop_worker(worker, false).boxed());
        }
        while pending.next().await.is_some() {}

        let inner = Arc::try_unwrap(inner)
            .map_err(|_| CoreError::Protocol("dispatcher is still in use".to_string()))?;
        let mut run = inner.state.into_inner().run;
        let never_ran: Vec<String> = run
            .tests
            .values()
            .filter(|t| t.results.is_empty())
            .map(|t| t.id.clone())
            .collect();
        for id in never_ran {
            run.report_skipped(&id);
        }
        Ok(run)
    }
}

impl Inner {
    fn schedule_jobs(self: &Arc<Self>, pending: &mut FuturesUnordered<BoxFuture<'static, Completion>>) {
        loop {
            let mut state = self.state.lock();
            if state.is_stopped {
                return;
            }
            let Some(job_index) = state.find_first_job_to_run() else {
                return;
            };
            let hash = state.queue[job_index].worker_hash.clone();
            let slot_index = state
                .slots
                .iter()
                .position(|s| {
                    !s.busy
                        && s.worker
                            .as_ref()
                            .is_some_and(|w| w.hash() == hash && !w.did_send_stop())
                })
                .or_else(|| state.slots.iter().position(|s| !s.busy));
            let Some(slot_index) = slot_index else {
                return;
            };
            let Some(group) = state.queue.remove(job_index) else {
                return;
            };
            let slot = &mut state.slots[slot_index];
            slot.busy = true;
            slot.project_id = Some(group.project_id.clone());
            drop(state);
            pending.push(self.clone().run_job_in_worker(slot_index, group).boxed());
        }
    }

    async fn run_job_in_worker(self: Arc<Self>, slot_index: usize, group: TestGroup) -> Completion {
        let done = |stop| Completion::Job {
            slot: slot_index,
            stop,
        };
        {
            let mut state = self.state.lock();
            if Job::skip_whole_job(&group, &mut state.run) {
                state.update_hash_count(&group.worker_hash, -1);
                state.apply_stop_request();
                return done(None);
            }
        }

        let mut worker = self.state.lock().slots[slot_index].worker.clone();
        if let Some(existing) = worker.take() {
            if existing.hash() != group.worker_hash || existing.did_send_stop() {
                self.clone().stop_worker(existing, false).await;
                if self.state.lock().is_stopped {
                    return done(None);
                }
            } else {
                worker = Some(existing);
            }
        }

        let worker = match worker {
            Some(worker) => worker,
            None => {
                let params = {
                    let mut state = self.state.lock();
                    let worker_index = state.next_worker_index;
                    state.next_worker_index += 1;
                    WorkerInitParams {
                        worker_index,
                        parallel_index: slot_index,
                        repeat_each_index: group.repeat_each_index,
                        project_id: group.project_id.clone(),
                        config: self.config.clone(),
                    }
                };
                let worker_index = params.worker_index;
                match WorkerHost::start(self.launcher.as_ref(), params, group.worker_hash.clone())
                    .await
                {
                    Ok(worker) => {
                        let worker = Arc::new(worker);
                        let mut state = self.state.lock();
                        state.slots[slot_index].worker = Some(worker.clone());
                        if state.is_stopped {
                            return done(None);
                        }
                        worker
                    }
                    Err(exit) => {
                        warn!("Worker {} failed to start", worker_index);
                        if self.state.lock().is_stopped {
                            return done(None);
                        }
                        let mut job = Job::new(group, worker_index, slot_index);
                        let outcome = self.on_worker_exit(&mut job, None, &exit);
                        return self.finish_job(&job, outcome, None, slot_index);
                    }
                }
            }
        };

        let mut job = Job::new(group, worker.worker_index(), slot_index);
        let payload = job.run_payload(&self.state.lock().run);
        debug!(
            "Running {} tests of {} in worker {}",
            payload.entries.len(),
            payload.file,
            worker.worker_index()
        );
        if !worker.run_test_group(payload) {
            trace!("Worker {} is gone before the group was sent", worker.worker_index());
        }

        let outcome = loop {
            match worker.next_event().await {
                Some(event) => {
                    if let Some(outcome) = self.on_worker_event(&mut job, &worker, event) {
                        break outcome;
                    }
                }
                None => {
                    let exit = worker.exit_data().await;
                    break self.on_worker_exit(&mut job, Some(&worker), &exit);
                }
            }
        };
        self.finish_job(&job, outcome, Some(worker), slot_index)
    }

    fn on_worker_event(
        &self,
        job: &mut Job,
        worker: &WorkerHost,
        event: WorkerEvent,
    ) -> Option<JobOutcome> {
        let mut state = self.state.lock();
        let outcome = job.handle_event(&mut state.run, event, worker.did_fail());
        state.apply_stop_request();
        outcome
    }

    fn on_worker_exit(
        &self,
        job: &mut Job,
        worker: Option<&Arc<WorkerHost>>,
        exit: &ProcessExitData,
    ) -> JobOutcome {
        if exit.unexpectedly {
            warn!(
                "Worker running {} {}",
                job.group().require_file,
                exit.describe()
            );
        }
        let mut state = self.state.lock();
        if let Some(worker) = worker {
            state.clear_worker(worker);
        }
        let outcome = job.on_exit(&mut state.run, exit);
        state.apply_stop_request();
        outcome
    }

    fn finish_job(
        &self,
        job: &Job,
        outcome: JobOutcome,
        worker: Option<Arc<WorkerHost>>,
        slot_index: usize,
    ) -> Completion {
        let hash = job.group().worker_hash.as_str();
        let mut state = self.state.lock();
        state.update_hash_count(hash, -1);

        let stop = worker.and_then(|worker| {
            if outcome.did_fail {
                Some((worker, true))
            } else if state.is_worker_redundant(&worker) {
                debug!("Worker {} is redundant", worker.worker_index());
                Some((worker, false))
            } else {
                None
            }
        });
        if !state.is_stopped {
            if let Some(new_job) = outcome.new_job {
                state.update_hash_count(&new_job.worker_hash, 1);
                state.queue.push_front(new_job);
            }
        }
        Completion::Job {
            slot: slot_index,
            stop,
        }
    }

    /// Stop `worker` and wait for it to exit, forwarding what it prints
    /// while closing.
    async fn stop_worker(self: Arc<Self>, worker: Arc<WorkerHost>, did_fail: bool) -> Completion {
        worker.stop(did_fail);
        while let Some(event) = worker.next_event().await {
            self.state.lock().on_idle_event(event);
        }
        let exit = worker.exit_data().await;
        if exit.unexpectedly {
            warn!("Worker {} {}", worker.worker_index(), exit.describe());
        }
        self.state.lock().clear_worker(&worker);
        Completion::WorkerStopped
    }
}
