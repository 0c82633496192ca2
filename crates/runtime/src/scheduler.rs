//! Fiber scheduling
//!
//! One scheduler per spawned OS thread, each owning a FIFO work queue of
//! jobs. A job wraps a fiber and its bookkeeping; fibers are pinned to the
//! scheduler that first accepted them, and a parked fiber is owned by the
//! channel it waits on until the rendezvous hands it back.

use crate::vm::{RunOutcome, run_fiber};
use cedar_core::object::Obj;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Slice budget handed to a fiber per scheduling turn.
const SLICE: Duration = Duration::from_millis(2);

/// A fiber's state as seen by the scheduler.
struct Job {
    fiber: Arc<Obj>,
    create_time: Instant,
    last_ran: Instant,
    sleeping_for: Duration,
    run_count: u64,
}

impl Job {
    fn fresh(fiber: Arc<Obj>) -> Job {
        let now = Instant::now();
        Job {
            fiber,
            create_time: now,
            last_ran: now,
            sleeping_for: Duration::ZERO,
            run_count: 0,
        }
    }
}

pub struct Scheduler {
    sid: usize,
    queue: Mutex<VecDeque<Job>>,
    wakeup: Condvar,
}

impl Scheduler {
    fn new(sid: usize) -> Scheduler {
        Scheduler {
            sid,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Condvar::new(),
        }
    }

    fn enqueue(&self, job: Job) {
        self.queue
            .lock()
            .expect("scheduler queue poisoned")
            .push_back(job);
        self.wakeup.notify_one();
    }

    fn pop(&self) -> Job {
        let mut queue = self.queue.lock().expect("scheduler queue poisoned");
        loop {
            if let Some(job) = queue.pop_front() {
                return job;
            }
            let (q, _) = self
                .wakeup
                .wait_timeout(queue, Duration::from_millis(50))
                .expect("scheduler condvar poisoned");
            queue = q;
        }
    }

    /// Run one job off the front of the queue. Sleeping jobs rotate to the
    /// tail; finished jobs retire; parked jobs are dropped here because the
    /// channel holds the fiber until rendezvous.
    fn schedule(&self) {
        let mut job = self.pop();

        let now = Instant::now();
        if now < job.last_ran + job.sleeping_for {
            self.enqueue(job);
            // everything may be asleep; breathe instead of spinning
            std::thread::sleep(Duration::from_micros(200));
            return;
        }

        let outcome = run_fiber(&job.fiber, Some(SLICE));
        job.run_count += 1;
        job.last_ran = Instant::now();
        job.sleeping_for = Duration::ZERO;

        match outcome {
            RunOutcome::Done => {
                let data = job.fiber.as_fiber().expect("job wraps a fiber");
                if data.failed.load(Ordering::Acquire) {
                    tracing::error!(
                        scheduler = self.sid,
                        runs = job.run_count,
                        "fiber terminated with uncaught error: {}",
                        data.take_result().to_repr_string()
                    );
                } else {
                    tracing::trace!(
                        scheduler = self.sid,
                        runs = job.run_count,
                        age_ms = job.create_time.elapsed().as_millis() as u64,
                        "fiber finished"
                    );
                }
            }
            RunOutcome::Yielded => self.enqueue(job),
            RunOutcome::Sleeping(ms) => {
                job.sleeping_for = Duration::from_millis(ms);
                self.enqueue(job);
            }
            RunOutcome::Parked => {
                tracing::trace!(scheduler = self.sid, "fiber parked on a channel");
            }
        }
    }

    fn run_loop(&self) {
        loop {
            self.schedule();
        }
    }
}

static SCHEDULERS: OnceLock<Vec<Arc<Scheduler>>> = OnceLock::new();
static NEXT_SCHEDULER: AtomicUsize = AtomicUsize::new(0);

/// Start `threads` scheduler threads. Idempotent; later calls keep the
/// first pool.
pub fn start(threads: usize) {
    let threads = threads.max(1);
    let scheds = SCHEDULERS.get_or_init(|| {
        (0..threads).map(|sid| Arc::new(Scheduler::new(sid))).collect()
    });
    static STARTED: OnceLock<()> = OnceLock::new();
    STARTED.get_or_init(|| {
        for sched in scheds {
            let sched = Arc::clone(sched);
            std::thread::Builder::new()
                .name(format!("cedar-sched-{}", sched.sid))
                .spawn(move || sched.run_loop())
                .expect("failed to spawn scheduler thread");
        }
    });
}

/// Accept a fresh fiber: pin it to a scheduler round-robin and queue it.
pub fn spawn_fiber(fiber: Arc<Obj>) {
    let scheds = SCHEDULERS
        .get()
        .expect("scheduler pool not started; call init() first");
    let index = NEXT_SCHEDULER.fetch_add(1, Ordering::Relaxed) % scheds.len();
    fiber
        .as_fiber()
        .expect("spawn_fiber: not a fiber")
        .home
        .store(index as i64, Ordering::Release);
    tracing::debug!(scheduler = index, "fiber spawned");
    scheds[index].enqueue(Job::fresh(fiber));
}

/// Hand a parked fiber back to its home scheduler; fibers with no home
/// are nested runs waiting on their ready event.
pub fn wake_fiber(fiber: Arc<Obj>) {
    let home = fiber
        .as_fiber()
        .expect("wake_fiber: not a fiber")
        .home
        .load(Ordering::Acquire);
    if home >= 0 {
        if let Some(scheds) = SCHEDULERS.get() {
            if let Some(sched) = scheds.get(home as usize) {
                sched.enqueue(Job::fresh(fiber));
                return;
            }
        }
    }
    fiber
        .as_fiber()
        .expect("wake_fiber: not a fiber")
        .notify_ready();
}

#[cfg(test)]
mod tests {
    use super::*;
    use cedar_core::fiber::new_fiber;
    use cedar_core::lambda::{Chunk, Lambda, Op};
    use std::time::Duration;

    fn trivial_fiber() -> Arc<Obj> {
        let mut chunk = Chunk::new();
        chunk.emit(Op::Nil);
        chunk.emit(Op::Exit);
        let mut lambda = Lambda::from_chunk(Arc::new(chunk));
        lambda.prime_args(&[]).expect("zero-arity prime");
        new_fiber(lambda).expect("bytecode fiber")
    }

    #[test]
    fn start_is_idempotent() {
        start(1);
        start(4);
        assert_eq!(SCHEDULERS.get().map(|s| s.len()), Some(1));
    }

    #[test]
    fn spawned_fiber_runs_to_done() {
        start(1);
        let fiber = trivial_fiber();
        spawn_fiber(fiber.clone());
        let data = fiber.as_fiber().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !data.is_done() {
            assert!(Instant::now() < deadline, "fiber never ran");
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(data.take_result().is_nil());
    }

    #[test]
    fn spawn_pins_a_home_scheduler() {
        start(1);
        let fiber = trivial_fiber();
        spawn_fiber(fiber.clone());
        let home = fiber.as_fiber().unwrap().home.load(Ordering::Acquire);
        assert!(home >= 0);
    }
}
