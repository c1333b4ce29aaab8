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

//! Readiness selector: the registry of watched descriptors and the blocking
//! wait which turns kernel readiness into dispatchable registrations.

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, RawFd};
use std::time::SystemTime;
use std::{env, io};

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollTimeout};
use parking_lot::Mutex;

use crate::registration::{Registration, RegistrationState};

/// Environment variable selecting the selector backend. Only the default
/// epoll backend is provided; the value `poll` is rejected at startup.
pub const POLLER_ENV: &str = "NETLOOP_POLLER";

/// Initial length of the kernel-facing ready-event vector. Doubled whenever
/// a wait fills it completely.
const INIT_EVENT_LIST_SIZE: usize = 16;

/// Registry of `fd → registration` entries backed by an epoll instance.
///
/// All regular mutations happen on the owning reactor's thread; teardown may
/// deregister from a foreign thread. The kernel synchronizes `epoll_ctl`
/// against a concurrent `epoll_wait`, so only the registry and the ready
/// buffer sit behind (uncontended) locks and the blocking wait holds neither
/// of them open to contention.
pub(crate) struct Poller {
    epoll: Epoll,
    registry: Mutex<HashMap<RawFd, Registration>>,
    events: Mutex<Vec<EpollEvent>>,
}

impl Poller {
    /// Creates the default epoll-backed selector, honoring [`POLLER_ENV`].
    pub(crate) fn new() -> io::Result<Poller> {
        match env::var(POLLER_ENV) {
            Ok(backend) if backend == "poll" => {
                log::error!(target: "reactor", "{POLLER_ENV}={backend}: the poll backend is not provided");
                panic!("selector backend `poll` is not provided; unset {POLLER_ENV}");
            }
            Ok(backend) if backend != "epoll" => {
                log::debug!(target: "reactor", "{POLLER_ENV}={backend} not recognized, using epoll");
            }
            _ => {}
        }
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Poller {
            epoll,
            registry: Mutex::new(empty!()),
            events: Mutex::new(vec![EpollEvent::empty(); INIT_EVENT_LIST_SIZE]),
        })
    }

    /// Inserts a registration into the kernel facility, or re-applies its
    /// current interest set.
    ///
    /// A registration whose interest became empty is dropped from the kernel
    /// but kept in the registry (tombstoned) so it can be re-armed later.
    /// Registering a second registration for an fd already present is a
    /// programming error: it is logged and refused.
    pub(crate) fn update(&self, registration: &Registration) {
        let fd = registration.fd();
        let interest = registration.interest();
        let state = registration.state();
        log::trace!(target: "reactor", "updating fd {fd} with interest {interest:?} in state {state:?}");
        match state {
            RegistrationState::Unregistered | RegistrationState::Tombstoned => {
                if state == RegistrationState::Unregistered {
                    let mut registry = self.registry.lock();
                    if registry.contains_key(&fd) {
                        log::error!(target: "reactor", "duplicate registration for fd {fd} refused");
                        return;
                    }
                    registry.insert(fd, registration.clone());
                }
                registration.set_state(RegistrationState::Registered);
                let event = EpollEvent::new(interest, fd as u64);
                if let Err(err) = self.epoll.add(borrowed(fd), event) {
                    log::error!(target: "reactor", "cannot add fd {fd} to the selector: {err}");
                    panic!("cannot add fd {fd} to the selector: {err}");
                }
            }
            RegistrationState::Registered if interest.is_empty() => {
                if let Err(err) = self.epoll.delete(borrowed(fd)) {
                    log::debug!(target: "reactor", "cannot drop fd {fd} from the selector: {err}");
                }
                registration.set_state(RegistrationState::Tombstoned);
            }
            RegistrationState::Registered => {
                let mut event = EpollEvent::new(interest, fd as u64);
                if let Err(err) = self.epoll.modify(borrowed(fd), &mut event) {
                    log::error!(target: "reactor", "cannot modify fd {fd} in the selector: {err}");
                    panic!("cannot modify fd {fd} in the selector: {err}");
                }
            }
        }
    }

    /// Removes a registration from the registry and, when it is still armed,
    /// from the kernel facility. Deregistering an fd the kernel no longer
    /// knows is tolerated silently.
    pub(crate) fn deregister(&self, registration: &Registration) {
        let fd = registration.fd();
        log::trace!(target: "reactor", "deregistering fd {fd}");
        self.registry.lock().remove(&fd);
        if registration.state() == RegistrationState::Registered {
            if let Err(err) = self.epoll.delete(borrowed(fd)) {
                log::debug!(target: "reactor", "cannot drop fd {fd} from the selector: {err}");
            }
        }
        registration.set_state(RegistrationState::Unregistered);
    }

    /// Blocks for up to `timeout_ms` and fills `ready` with the registrations
    /// the kernel reported, copying each reported mask into its registration.
    ///
    /// Returns the wall-clock tick taken right after the wait returned. Only
    /// the owning reactor's thread calls this, so the ready-buffer lock is
    /// never contended.
    pub(crate) fn wait(&self, timeout_ms: u16, ready: &mut Vec<Registration>) -> SystemTime {
        let mut events = self.events.lock();
        let outcome = self.epoll.wait(&mut events[..], EpollTimeout::from(timeout_ms));
        let tick = SystemTime::now();
        match outcome {
            Ok(0) => log::trace!(target: "reactor", "readiness wait timed out"),
            Ok(count) => {
                log::trace!(target: "reactor", "{count} descriptors ready");
                let registry = self.registry.lock();
                for event in &events[..count] {
                    let fd = event.data() as RawFd;
                    match registry.get(&fd) {
                        Some(registration) => {
                            registration.set_revents(event.events());
                            ready.push(registration.clone());
                        }
                        None => {
                            log::debug!(target: "reactor", "readiness for unknown fd {fd} ignored")
                        }
                    }
                }
                drop(registry);
                if count == events.len() {
                    let grown = count * 2;
                    events.resize(grown, EpollEvent::empty());
                    log::debug!(target: "reactor", "ready-event vector grown to {grown}");
                }
            }
            Err(Errno::EINTR) => log::debug!(target: "reactor", "readiness wait interrupted"),
            Err(err) => log::error!(target: "reactor", "readiness wait failed: {err}"),
        }
        tick
    }
}

/// The registry stores raw descriptors it does not own; re-borrow them for
/// the kernel calls.
fn borrowed(fd: RawFd) -> BorrowedFd<'static> {
    debug_assert!(fd >= 0);
    // SAFETY: every fd in the registry belongs to a live owner (connection,
    // acceptor or notifier) which deregisters before closing it.
    unsafe { BorrowedFd::borrow_raw(fd) }
}
