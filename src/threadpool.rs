// Copyright 2024 packetbus contributors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// This file may not be copied, modified, or distributed except according to those terms.

//! A fixed-size worker pool for short, non-blocking tasks.
//!
//! Workers share one FIFO task queue guarded by a mutex; a condvar stands in
//! for the "run" semaphore the pool is specified against, released once per
//! submission, and pool shutdown is a plain quit flag checked under the same
//! lock rather than a second semaphore. Tasks are boxed closures rather than
//! a `(fn, *mut c_void, *mut c_void, *mut c_void)` triple: the capability
//! carries its own captured state instead of threading an opaque userdata
//! pointer through the pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Task>>,
    run: Condvar,
    quit: AtomicBool,
    pending: AtomicUsize,
    pending_idle: Condvar,
    pending_lock: Mutex<()>,
}

impl Shared {
    fn dequeue(&self) -> Option<Task> {
        let mut queue = self.queue.lock().expect("threadpool queue lock poisoned");

        loop {
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }

            if self.quit.load(Ordering::SeqCst) {
                return None;
            }

            queue = self.run.wait(queue).expect("threadpool queue lock poisoned");
        }
    }

    fn on_task_done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.pending_lock.lock().expect("threadpool pending lock poisoned");
            self.pending_idle.notify_all();
        }
    }
}

/// Computes `threads_per_core * max(1, num_cores + core_count_adjustment)`.
fn worker_count(threads_per_core: usize, core_count_adjustment: i32) -> usize {
    let cores = thread::available_parallelism().map(|n| n.get() as i32).unwrap_or(1);
    let adjusted = (cores + core_count_adjustment).max(1) as usize;
    threads_per_core * adjusted
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    pub fn new(threads_per_core: usize, core_count_adjustment: i32) -> ThreadPool {
        let n = worker_count(threads_per_core, core_count_adjustment);
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            run: Condvar::new(),
            quit: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            pending_idle: Condvar::new(),
            pending_lock: Mutex::new(()),
        });

        let workers = (0..n)
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || {
                    while let Some(task) = shared.dequeue() {
                        task();
                        shared.on_task_done();
                    }
                })
            })
            .collect();

        ThreadPool { shared, workers }
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Submits a single, one-shot task that owns whatever state it closed
    /// over (typically a retained packet it releases when done). This is
    /// the common case in this crate: packet and event dispatch is always a
    /// single run, never a repeat-count fan-out, so the task can be a plain
    /// `FnOnce` instead of the `Fn` the repeating form below requires.
    pub fn submit_once<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);

        {
            let mut queue = self.shared.queue.lock().expect("threadpool queue lock poisoned");
            queue.push_back(Box::new(task));
        }

        self.shared.run.notify_one();
    }

    /// Submits `task` for execution, `repeat_count` times. If `block`, waits
    /// (via a counter shared only with these `repeat_count` invocations)
    /// until every one of them has run.
    pub fn submit<F>(&self, task: F, repeat_count: usize, block: bool)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if repeat_count == 0 {
            return;
        }

        let task = Arc::new(task);
        let remaining = Arc::new((Mutex::new(repeat_count), Condvar::new()));

        self.shared.pending.fetch_add(repeat_count, Ordering::SeqCst);

        {
            let mut queue = self.shared.queue.lock().expect("threadpool queue lock poisoned");
            for _ in 0..repeat_count {
                let task = task.clone();
                let remaining = remaining.clone();
                let shared = self.shared.clone();
                queue.push_back(Box::new(move || {
                    task();
                    let (lock, cvar) = &*remaining;
                    let mut left = lock.lock().expect("threadpool remaining lock poisoned");
                    *left -= 1;
                    if *left == 0 {
                        cvar.notify_all();
                    }
                    drop(left);
                    let _ = shared; // keep pool alive for the duration of the task
                }));
            }
        }

        for _ in 0..repeat_count {
            self.shared.run.notify_one();
        }

        if block {
            let (lock, cvar) = &*remaining;
            let mut left = lock.lock().expect("threadpool remaining lock poisoned");
            while *left > 0 {
                left = cvar.wait(left).expect("threadpool remaining lock poisoned");
            }
        }
    }

    /// Blocks until every currently-submitted task across the whole pool has
    /// completed, or `timeout` elapses.
    pub fn wait_for_all(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut guard = self.shared.pending_lock.lock().expect("threadpool pending lock poisoned");

        while self.shared.pending.load(Ordering::SeqCst) > 0 {
            let now = Instant::now();
            if now >= deadline {
                return;
            }

            let (g, _timed_out) = self
                .shared
                .pending_idle
                .wait_timeout(guard, deadline - now)
                .expect("threadpool pending lock poisoned");
            guard = g;
        }
    }

    /// Drops every task still sitting in the queue without running it.
    pub fn purge_pending(&self) {
        let mut queue = self.shared.queue.lock().expect("threadpool queue lock poisoned");
        let purged = queue.len();
        queue.clear();
        if purged > 0 {
            self.shared.pending.fetch_sub(purged, Ordering::SeqCst);
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        self.shared.run.notify_all();

        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
