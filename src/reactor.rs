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

//! The reactor: a thread-bound poll → dispatch → deferred-drain loop with a
//! cross-thread wakeup channel.

use std::cell::Cell;
use std::mem;
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::SystemTime;

use nix::sys::eventfd::{EfdFlags, EventFd};
use parking_lot::Mutex;

use crate::poller::Poller;
use crate::registration::Registration;

/// Upper bound on a single readiness wait. A quit requested from a foreign
/// thread is observed at latest after this interval even without a wakeup.
pub(crate) const POLL_TIMEOUT_MS: u16 = 10_000;

type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    // One reactor per thread, process-wide.
    static REACTOR_ON_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// A thread-bound event loop multiplexing non-blocking descriptors.
///
/// The reactor owns a readiness selector and an eventfd-backed notifier.
/// [`Reactor::run`] blocks the constructing thread; [`Reactor::submit`],
/// [`Reactor::enqueue`] and [`Reactor::quit`] may be called from any thread,
/// everything else belongs to the loop thread.
pub struct Reactor {
    thread: ThreadId,
    poller: Poller,
    notifier: EventFd,
    notifier_registration: Mutex<Option<Registration>>,
    pending: Mutex<Vec<Task>>,
    looping: AtomicBool,
    quitting: AtomicBool,
    draining: AtomicBool,
    poll_tick: Mutex<SystemTime>,
}

impl Reactor {
    /// Constructs a reactor bound to the calling thread.
    ///
    /// Panics when the thread already hosts a reactor or when the selector or
    /// the notifier cannot be created; all three are fatal configuration
    /// failures.
    pub fn new() -> Arc<Reactor> {
        let thread = thread::current().id();
        if REACTOR_ON_THREAD.get() {
            log::error!(target: "reactor", "another reactor already runs on thread {thread:?}");
            panic!("one reactor per thread: {thread:?} already hosts a reactor");
        }
        let poller = match Poller::new() {
            Ok(poller) => poller,
            Err(err) => {
                log::error!(target: "reactor", "cannot create readiness selector: {err}");
                panic!("cannot create readiness selector: {err}");
            }
        };
        let notifier =
            match EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            {
                Ok(notifier) => notifier,
                Err(err) => {
                    log::error!(target: "reactor", "cannot create reactor notifier: {err}");
                    panic!("cannot create reactor notifier: {err}");
                }
            };
        REACTOR_ON_THREAD.set(true);

        let reactor = Arc::new(Reactor {
            thread,
            poller,
            notifier,
            notifier_registration: Mutex::new(None),
            pending: Mutex::new(empty!()),
            looping: AtomicBool::new(false),
            quitting: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            poll_tick: Mutex::new(SystemTime::now()),
        });

        // The notifier is a registration like any other; its read callback
        // just drains the counter, having woken the loop is the effect.
        let registration =
            Registration::new(&reactor, reactor.notifier.as_fd().as_raw_fd());
        let weak = Arc::downgrade(&reactor);
        registration.set_read_callback(Box::new(move |_tick| {
            if let Some(reactor) = weak.upgrade() {
                reactor.drain_notifier();
            }
        }));
        registration.enable_read();
        *reactor.notifier_registration.lock() = Some(registration);

        log::debug!(target: "reactor", "reactor created on thread {thread:?}");
        reactor
    }

    /// Whether the calling thread is the loop thread.
    pub fn is_in_thread(&self) -> bool { self.thread == thread::current().id() }

    /// Timestamp taken when the last readiness wait returned.
    pub fn poll_tick(&self) -> SystemTime { *self.poll_tick.lock() }

    /// Runs the event loop on the constructing thread until [`Reactor::quit`]
    /// is observed.
    ///
    /// Each iteration waits for readiness, dispatches the ready registrations
    /// in kernel-reported order and then drains the deferred-task queue.
    pub fn run(&self) {
        if !self.is_in_thread() {
            log::error!(target: "reactor", "run() called from a foreign thread is a no-op");
            return;
        }
        self.looping.store(true, Ordering::Release);
        self.quitting.store(false, Ordering::Release);
        log::info!(target: "reactor", "reactor on {:?} starts looping", self.thread);

        let mut ready = Vec::new();
        while !self.quitting.load(Ordering::Acquire) {
            ready.clear();
            let tick = self.poller.wait(POLL_TIMEOUT_MS, &mut ready);
            *self.poll_tick.lock() = tick;
            for registration in &ready {
                registration.handle_event(tick);
            }
            self.drain_pending();
        }

        log::info!(target: "reactor", "reactor on {:?} stops looping", self.thread);
        self.looping.store(false, Ordering::Release);
    }

    /// Requests the loop to stop. Callable from any thread; when called from
    /// a foreign thread the notifier makes the loop observe the flag without
    /// waiting out the current poll timeout.
    pub fn quit(&self) {
        self.quitting.store(true, Ordering::Release);
        if !self.is_in_thread() {
            self.notify();
        }
    }

    /// Runs `task` on the loop thread: immediately when already there,
    /// otherwise deferred via [`Reactor::enqueue`].
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_thread() {
            task();
        } else {
            self.enqueue(task);
        }
    }

    /// Defers `task` to the end of a loop iteration, preserving insertion
    /// order.
    ///
    /// The loop is woken when the caller is on a foreign thread, and also
    /// when it is currently draining deferred tasks: a task queued by another
    /// deferred task belongs to the *next* iteration, and without the wakeup
    /// the loop would sit in the readiness wait for the full timeout first.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        self.pending.lock().push(Box::new(task));
        if !self.is_in_thread() || self.draining.load(Ordering::Acquire) {
            self.notify();
        }
    }

    /// Swaps the pending queue out under the lock, then runs every task in
    /// insertion order with the lock released, so tasks may enqueue further
    /// work without deadlocking.
    fn drain_pending(&self) {
        self.draining.store(true, Ordering::Release);
        let tasks = mem::take(&mut *self.pending.lock());
        for task in tasks {
            task();
        }
        self.draining.store(false, Ordering::Release);
    }

    /// Wakes the loop by bumping the eventfd counter. Idempotent: concurrent
    /// wakeups coalesce in the counter.
    fn notify(&self) {
        match self.notifier.write(1) {
            Ok(8) => {}
            Ok(n) => log::error!(target: "reactor", "notifier write produced {n} bytes instead of 8"),
            Err(err) => log::error!(target: "reactor", "notifier write failed: {err}"),
        }
    }

    /// Discards the eventfd counter; the wakeup itself was the payload.
    fn drain_notifier(&self) {
        if let Err(err) = self.notifier.read() {
            log::error!(target: "reactor", "notifier read failed: {err}");
        }
    }

    pub(crate) fn update_registration(&self, registration: &Registration) {
        self.poller.update(registration);
    }

    pub(crate) fn remove_registration(&self, registration: &Registration) {
        self.poller.deregister(registration);
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if let Some(registration) = self.notifier_registration.get_mut().take() {
            self.poller.deregister(&registration);
        }
        if self.thread == thread::current().id() {
            REACTOR_ON_THREAD.set(false);
        }
    }
}
