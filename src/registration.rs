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

//! Per-descriptor event registration: interest set, dispatch callbacks and
//! the weak tie guarding the upper-layer owner during dispatch.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use nix::sys::epoll::EpollFlags;
use parking_lot::Mutex;

use crate::reactor::Reactor;

/// Interest and report mask for read readiness, including urgent data.
const READ_MASK: EpollFlags = EpollFlags::EPOLLIN.union(EpollFlags::EPOLLPRI);
/// Interest and report mask for write readiness.
const WRITE_MASK: EpollFlags = EpollFlags::EPOLLOUT;

pub(crate) type EventFn = Box<dyn FnMut() + Send>;
pub(crate) type ReadEventFn = Box<dyn FnMut(SystemTime) + Send>;

/// Where a registration currently stands with respect to its selector.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum RegistrationState {
    /// Never armed, or fully deregistered.
    Unregistered,
    /// Present in the registry and armed in the kernel facility.
    Registered,
    /// Present in the registry but dropped from the kernel facility because
    /// the interest set became empty; can be re-armed.
    Tombstoned,
}

struct Inner {
    reactor: Weak<Reactor>,
    fd: RawFd,
    interest: EpollFlags,
    revents: EpollFlags,
    state: RegistrationState,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    on_read: Option<ReadEventFn>,
    on_write: Option<EventFn>,
    on_close: Option<EventFn>,
    on_error: Option<EventFn>,
}

/// Cheaply clonable handle to a per-fd event registration.
///
/// The registration never owns the descriptor it watches and keeps only a
/// non-owning reference to its reactor; the owner of the descriptor must
/// deregister before closing it. All mutations and all callback dispatch
/// happen on the owning reactor's thread.
#[derive(Clone)]
pub(crate) struct Registration {
    inner: Arc<Mutex<Inner>>,
}

impl Registration {
    pub(crate) fn new(reactor: &Arc<Reactor>, fd: RawFd) -> Registration {
        Registration {
            inner: Arc::new(Mutex::new(Inner {
                reactor: Arc::downgrade(reactor),
                fd,
                interest: EpollFlags::empty(),
                revents: EpollFlags::empty(),
                state: RegistrationState::Unregistered,
                tie: None,
                on_read: None,
                on_write: None,
                on_close: None,
                on_error: None,
            })),
        }
    }

    pub(crate) fn fd(&self) -> RawFd { self.inner.lock().fd }

    pub(crate) fn interest(&self) -> EpollFlags { self.inner.lock().interest }

    pub(crate) fn state(&self) -> RegistrationState { self.inner.lock().state }

    pub(crate) fn set_state(&self, state: RegistrationState) { self.inner.lock().state = state; }

    pub(crate) fn set_revents(&self, revents: EpollFlags) { self.inner.lock().revents = revents; }

    #[allow(dead_code)]
    pub(crate) fn is_reading(&self) -> bool { self.inner.lock().interest.intersects(READ_MASK) }

    pub(crate) fn is_writing(&self) -> bool { self.inner.lock().interest.intersects(WRITE_MASK) }

    pub(crate) fn set_read_callback(&self, callback: ReadEventFn) {
        self.inner.lock().on_read = Some(callback);
    }

    pub(crate) fn set_write_callback(&self, callback: EventFn) {
        self.inner.lock().on_write = Some(callback);
    }

    pub(crate) fn set_close_callback(&self, callback: EventFn) {
        self.inner.lock().on_close = Some(callback);
    }

    pub(crate) fn set_error_callback(&self, callback: EventFn) {
        self.inner.lock().on_error = Some(callback);
    }

    /// Ties the registration to its upper-layer owner. Once tied, dispatch
    /// upgrades the tie first and silently skips the whole batch for this
    /// descriptor when the owner is already gone.
    pub(crate) fn tie<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        self.inner.lock().tie = Some(Arc::downgrade(owner) as Weak<dyn Any + Send + Sync>);
    }

    pub(crate) fn enable_read(&self) { self.change_interest(|interest| interest | READ_MASK) }

    #[allow(dead_code)]
    pub(crate) fn disable_read(&self) { self.change_interest(|interest| interest - READ_MASK) }

    pub(crate) fn enable_write(&self) { self.change_interest(|interest| interest | WRITE_MASK) }

    pub(crate) fn disable_write(&self) { self.change_interest(|interest| interest - WRITE_MASK) }

    pub(crate) fn disable_all(&self) { self.change_interest(|_| EpollFlags::empty()) }

    /// Applies an interest mutation and immediately re-registers through the
    /// owning reactor's selector.
    fn change_interest(&self, change: impl FnOnce(EpollFlags) -> EpollFlags) {
        let reactor = {
            let mut inner = self.inner.lock();
            inner.interest = change(inner.interest);
            inner.reactor.clone()
        };
        match reactor.upgrade() {
            Some(reactor) => reactor.update_registration(self),
            None => log::debug!(
                target: "reactor",
                "interest change on fd {} after its reactor is gone", self.fd()
            ),
        }
    }

    /// Drops the registration from the selector registry. Must be called
    /// before the watched descriptor is closed.
    pub(crate) fn remove(&self) {
        let reactor = self.inner.lock().reactor.clone();
        match reactor.upgrade() {
            Some(reactor) => reactor.remove_registration(self),
            None => log::debug!(
                target: "reactor",
                "removal of fd {} after its reactor is gone", self.fd()
            ),
        }
    }

    /// Dispatches the last reported readiness mask, in fixed order: errors
    /// first, then hangup without pending payload, then readable (plain,
    /// urgent, or remote half-close with data still queued), then writable.
    ///
    /// Hangup with readable data defers to the read path so the final bytes
    /// are not lost.
    pub(crate) fn handle_event(&self, tick: SystemTime) {
        let (tie, revents, fd) = {
            let inner = self.inner.lock();
            (inner.tie.clone(), inner.revents, inner.fd)
        };
        let _owner: Option<Arc<dyn Any + Send + Sync>> = match tie {
            Some(weak) => match weak.upgrade() {
                Some(owner) => Some(owner),
                None => {
                    log::trace!(target: "reactor", "owner of fd {fd} is gone, skipping dispatch");
                    return;
                }
            },
            None => None,
        };
        log::trace!(target: "reactor", "dispatching {revents:?} for fd {fd}");
        if revents.contains(EpollFlags::EPOLLERR) {
            self.invoke(fd, "error", |inner: &mut Inner| &mut inner.on_error);
        }
        if revents.contains(EpollFlags::EPOLLHUP) && !revents.contains(EpollFlags::EPOLLIN) {
            self.invoke(fd, "close", |inner: &mut Inner| &mut inner.on_close);
        }
        if revents.intersects(READ_MASK | EpollFlags::EPOLLRDHUP) {
            self.invoke_read(fd, tick);
        }
        if revents.contains(EpollFlags::EPOLLOUT) {
            self.invoke(fd, "write", |inner: &mut Inner| &mut inner.on_write);
        }
    }

    /// Runs one dispatch callback outside the registration lock, so the
    /// callback may legally mutate its own interest set or callbacks.
    fn invoke(&self, fd: RawFd, kind: &str, slot: impl Fn(&mut Inner) -> &mut Option<EventFn>) {
        let callback = slot(&mut *self.inner.lock()).take();
        match callback {
            Some(mut callback) => {
                callback();
                let mut inner = self.inner.lock();
                let place = slot(&mut *inner);
                if place.is_none() {
                    *place = Some(callback);
                }
            }
            None => log::debug!(target: "reactor", "no {kind} callback installed for fd {fd}"),
        }
    }

    fn invoke_read(&self, fd: RawFd, tick: SystemTime) {
        let callback = self.inner.lock().on_read.take();
        match callback {
            Some(mut callback) => {
                callback(tick);
                let mut inner = self.inner.lock();
                if inner.on_read.is_none() {
                    inner.on_read = Some(callback);
                }
            }
            None => log::debug!(target: "reactor", "no read callback installed for fd {fd}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::{AsFd, AsRawFd};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nix::sys::eventfd::{EfdFlags, EventFd};

    use super::*;

    #[test]
    fn interest_changes_walk_the_selector_states() {
        let reactor = Reactor::new();
        let eventfd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK).unwrap();
        let registration = Registration::new(&reactor, eventfd.as_fd().as_raw_fd());
        assert_eq!(registration.state(), RegistrationState::Unregistered);

        registration.enable_read();
        assert_eq!(registration.state(), RegistrationState::Registered);
        assert!(registration.is_reading());

        registration.disable_all();
        assert_eq!(registration.state(), RegistrationState::Tombstoned);
        assert!(!registration.is_reading());

        registration.enable_write();
        assert_eq!(registration.state(), RegistrationState::Registered);
        assert!(registration.is_writing());

        registration.remove();
        assert_eq!(registration.state(), RegistrationState::Unregistered);
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let reactor = Reactor::new();
        let eventfd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK).unwrap();
        let first = Registration::new(&reactor, eventfd.as_fd().as_raw_fd());
        let second = Registration::new(&reactor, eventfd.as_fd().as_raw_fd());

        first.enable_read();
        second.enable_read();
        assert_eq!(first.state(), RegistrationState::Registered);
        assert_eq!(second.state(), RegistrationState::Unregistered);
    }

    #[test]
    fn dispatch_skips_when_owner_is_gone() {
        let reactor = Reactor::new();
        let eventfd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK).unwrap();
        let registration = Registration::new(&reactor, eventfd.as_fd().as_raw_fd());

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        registration.set_read_callback(Box::new(move |_tick| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        registration.set_revents(EpollFlags::EPOLLIN);

        let owner = Arc::new(());
        registration.tie(&owner);
        registration.handle_event(SystemTime::now());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(owner);
        registration.handle_event(SystemTime::now());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hangup_with_pending_payload_defers_to_the_read_path() {
        let reactor = Reactor::new();
        let eventfd = EventFd::from_value_and_flags(0, EfdFlags::EFD_NONBLOCK).unwrap();
        let registration = Registration::new(&reactor, eventfd.as_fd().as_raw_fd());

        let reads = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let read_counter = reads.clone();
        let close_counter = closes.clone();
        registration.set_read_callback(Box::new(move |_tick| {
            read_counter.fetch_add(1, Ordering::SeqCst);
        }));
        registration.set_close_callback(Box::new(move || {
            close_counter.fetch_add(1, Ordering::SeqCst);
        }));

        registration.set_revents(EpollFlags::EPOLLHUP | EpollFlags::EPOLLIN);
        registration.handle_event(SystemTime::now());
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        registration.set_revents(EpollFlags::EPOLLHUP);
        registration.handle_event(SystemTime::now());
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
