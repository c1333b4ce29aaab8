// Multi-reactor TCP server library: one event loop per thread
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2022-2023 by
//     Dr. Maxim Orlovsky <orlovsky@cyphernet.org>
//
// Copyright 2022-2023 Cyphernet DAO, Switzerland
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pool of worker reactor threads with a round-robin picker, plus the
//! contract expected from an external pool of blocking-work threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel as chan;

use crate::reactor::Reactor;

/// Hook executed once per worker reactor, on the worker's own thread, before
/// it enters its loop.
pub type ThreadInitHook = Arc<dyn Fn(&Arc<Reactor>) + Send + Sync>;

/// Contract the connection core expects from an external pool of threads for
/// blocking user work.
///
/// Reactor callbacks must not block; long-running work is handed to such a
/// pool and hops its results back onto the connection's reactor via
/// [`Reactor::submit`]. The pool is an independent collaborator: nothing in
/// this crate constructs one.
pub trait WorkerPool {
    /// Schedules a task; tasks submitted from one thread run in FIFO order.
    fn submit(&self, task: Box<dyn FnOnce() + Send>);

    /// Stops accepting tasks and joins all worker threads.
    fn shutdown(&mut self);
}

/// A fixed set of worker reactors, each looping on its own thread, picked
/// round-robin.
///
/// With zero workers the pool degrades to the main reactor: connections then
/// share the thread with the acceptor.
pub struct ReactorPool {
    base: Arc<Reactor>,
    name: String,
    workers: usize,
    started: bool,
    reactors: Vec<Arc<Reactor>>,
    threads: Vec<JoinHandle<()>>,
    next: AtomicUsize,
}

impl ReactorPool {
    /// Creates a stopped pool around the main reactor.
    pub fn new(base: Arc<Reactor>, name: impl ToString) -> ReactorPool {
        ReactorPool {
            base,
            name: name.to_string(),
            workers: 0,
            started: false,
            reactors: empty!(),
            threads: empty!(),
            next: AtomicUsize::new(0),
        }
    }

    /// Sets the number of worker threads. Must be called before
    /// [`ReactorPool::start`]; once started the set is immutable.
    pub fn set_worker_count(&mut self, workers: usize) { self.workers = workers; }

    pub fn is_started(&self) -> bool { self.started }

    pub fn name(&self) -> &str { &self.name }

    /// Spawns the worker threads. Each worker constructs its reactor on its
    /// own thread, runs the init hook, publishes the reactor handle to the
    /// spawner and only then enters its loop. With zero workers the hook runs
    /// directly on the main reactor.
    pub fn start(&mut self, hook: Option<ThreadInitHook>) {
        self.started = true;

        for index in 0..self.workers {
            let hook = hook.clone();
            let (tx, rx) = chan::bounded::<Arc<Reactor>>(1);
            let thread = thread::Builder::new()
                .name(format!("{}-{index}", self.name))
                .spawn(move || {
                    let reactor = Reactor::new();
                    if let Some(hook) = &hook {
                        hook(&reactor);
                    }
                    tx.send(reactor.clone()).expect("pool waits for the worker handshake");
                    reactor.run();
                })
                .expect("worker reactor thread failed to spawn");
            let reactor = rx.recv().expect("worker reactor failed to start");
            log::debug!(target: "reactor", "worker reactor {}-{index} is up", self.name);
            self.reactors.push(reactor);
            self.threads.push(thread);
        }

        if self.workers == 0 {
            if let Some(hook) = hook {
                hook(&self.base);
            }
        }
    }

    /// Picks the next reactor in round-robin order; the main reactor when the
    /// pool has no workers. Intended to be called from the main reactor only.
    pub fn next_reactor(&self) -> Arc<Reactor> {
        if self.reactors.is_empty() {
            return self.base.clone();
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        self.reactors[index].clone()
    }

    /// All worker reactors; the main reactor alone when the pool is empty.
    pub fn reactors(&self) -> Vec<Arc<Reactor>> {
        if self.reactors.is_empty() {
            return vec![self.base.clone()];
        }
        self.reactors.clone()
    }
}

impl Drop for ReactorPool {
    fn drop(&mut self) {
        for reactor in &self.reactors {
            reactor.quit();
        }
        for thread in self.threads.drain(..) {
            thread.join().expect("worker reactor thread must not panic");
        }
    }
}
