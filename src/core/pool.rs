/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use log::{debug, error};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum PoolError {
    #[error("queue full")]
    Full,

    #[error("pool stopped")]
    Stopped,

    #[error("task failed")]
    TaskFailed,
}

// fixed number of threads pulling jobs from a bounded queue
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<mpsc::SyncSender<Job>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(name: &str, size: usize, queue_max: usize) -> Self {
        Self::with_counter(name, size, queue_max, Arc::new(AtomicUsize::new(0)))
    }

    // in_flight may be shared between pools so a process can report a
    // single figure
    pub fn with_counter(
        name: &str,
        size: usize,
        queue_max: usize,
        in_flight: Arc<AtomicUsize>,
    ) -> Self {
        assert!(size > 0);

        let (s, r) = mpsc::sync_channel::<Job>(queue_max);
        let r = Arc::new(Mutex::new(r));

        let mut threads = Vec::with_capacity(size);

        for i in 0..size {
            let r = Arc::clone(&r);
            let in_flight = Arc::clone(&in_flight);
            let thread_name = format!("{}-{}", name, i);

            let builder = thread::Builder::new().name(thread_name.clone());

            let handle = builder.spawn(move || loop {
                let job = {
                    let r = r.lock().unwrap();

                    match r.recv() {
                        Ok(job) => job,
                        Err(_) => break,
                    }
                };

                in_flight.fetch_add(1, Ordering::Relaxed);

                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("{}: job panicked", thread_name);
                }

                in_flight.fetch_sub(1, Ordering::Relaxed);
            });

            match handle {
                Ok(handle) => threads.push(handle),
                Err(e) => error!("{}: failed to spawn thread: {}", name, e),
            }
        }

        debug!("{}: started {} threads", name, threads.len());

        Self {
            name: name.to_string(),
            sender: Mutex::new(Some(s)),
            threads: Mutex::new(threads),
            in_flight,
        }
    }

    // never blocks. fails if the queue is full
    pub fn submit<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap();

        let sender = match &*sender {
            Some(s) => s,
            None => return Err(PoolError::Stopped),
        };

        match sender.try_send(Box::new(f)) {
            Ok(()) => Ok(()),
            Err(mpsc::TrySendError::Full(_)) => Err(PoolError::Full),
            Err(mpsc::TrySendError::Disconnected(_)) => Err(PoolError::Stopped),
        }
    }

    // waits for queue space
    pub fn submit_wait<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = match &*self.sender.lock().unwrap() {
            Some(s) => s.clone(),
            None => return Err(PoolError::Stopped),
        };

        sender.send(Box::new(f)).map_err(|_| PoolError::Stopped)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        // dropping the sender wakes every idle thread with a recv error
        self.sender.lock().unwrap().take();

        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();

        for t in threads {
            // a pool thread may be the one stopping the pool
            if t.thread().id() == thread::current().id() {
                continue;
            }

            if t.join().is_err() {
                error!("{}: thread panicked", self.name);
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

// a single thread executing CPU-bound work on behalf of callers that are
// waiting for it. ownership of the state being worked on is passed to the
// runner and handed back with the result
pub struct TaskRunner {
    pool: WorkerPool,
}

impl TaskRunner {
    pub fn new(name: &str, queue_max: usize) -> Self {
        Self {
            pool: WorkerPool::new(name, 1, queue_max),
        }
    }

    pub fn execute<T, R, F>(&self, value: T, f: F) -> Result<(T, R), PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        let (s, r) = mpsc::sync_channel(1);

        self.pool.submit_wait(move || {
            let mut value = value;
            let ret = f(&mut value);

            // caller may have gone away
            let _ = s.send((value, ret));
        })?;

        r.recv().map_err(|_| PoolError::TaskFailed)
    }

    pub fn stop(&self) {
        self.pool.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pool_runs_jobs() {
        let pool = WorkerPool::new("test-pool", 2, 16);

        let (s, r) = mpsc::channel();

        for i in 0..10 {
            let s = s.clone();
            pool.submit(move || s.send(i).unwrap()).unwrap();
        }

        let mut got: Vec<i32> = (0..10)
            .map(|_| r.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort();

        assert_eq!(got, (0..10).collect::<Vec<i32>>());
    }

    #[test]
    fn pool_full() {
        let pool = WorkerPool::new("test-full", 1, 1);

        let (block_s, block_r) = mpsc::channel::<()>();
        let (started_s, started_r) = mpsc::channel();

        // occupy the only thread
        pool.submit(move || {
            started_s.send(()).unwrap();
            block_r.recv().unwrap();
        })
        .unwrap();

        started_r.recv().unwrap();
        assert_eq!(pool.in_flight(), 1);

        // fill the queue
        pool.submit(|| {}).unwrap();

        assert_eq!(pool.submit(|| {}), Err(PoolError::Full));

        block_s.send(()).unwrap();
    }

    #[test]
    fn pool_survives_panic() {
        let pool = WorkerPool::new("test-panic", 1, 4);

        pool.submit(|| panic!("boom")).unwrap();

        let (s, r) = mpsc::channel();
        pool.submit(move || s.send(1).unwrap()).unwrap();

        assert_eq!(r.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    }

    #[test]
    fn pool_stopped() {
        let pool = WorkerPool::new("test-stop", 1, 4);
        pool.stop();

        assert_eq!(pool.submit(|| {}), Err(PoolError::Stopped));
    }

    #[test]
    fn runner_returns_value() {
        let runner = TaskRunner::new("test-runner", 4);

        let (v, ret) = runner
            .execute(vec![1, 2, 3], |v| {
                v.push(4);
                v.len()
            })
            .unwrap();

        assert_eq!(v, vec![1, 2, 3, 4]);
        assert_eq!(ret, 4);
    }
}
