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

//! Listening-socket owner converting readiness into accepted connections.

use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::reactor::Reactor;
use crate::registration::Registration;

/// Queue length passed to `listen(2)`.
const BACKLOG: i32 = 1024;

/// Callback receiving each accepted connection together with its peer
/// address.
pub type NewConnectionCallback = Box<dyn Fn(Socket, SocketAddr) + Send>;

/// Owner of the listening socket, always hosted by the main reactor.
///
/// The socket is created non-blocking and close-on-exec, with address reuse
/// enabled (and optionally port reuse), and bound eagerly; [`Acceptor::listen`]
/// marks it listening and arms read interest. Each readiness notification
/// accepts at most one connection; bursty arrivals drain over successive loop
/// iterations.
pub struct Acceptor {
    // Keeps the hosting reactor alive until the registration is removed.
    #[allow(dead_code)]
    reactor: Arc<Reactor>,
    socket: Socket,
    registration: Registration,
    listening: AtomicBool,
    on_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Creates the listening socket and binds it to `addr`.
    ///
    /// Socket or bind failures are fatal: the server cannot come up without
    /// its listening address.
    pub fn new(reactor: &Arc<Reactor>, addr: SocketAddr, reuse_port: bool) -> Arc<Acceptor> {
        let socket = match Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)) {
            Ok(socket) => socket,
            Err(err) => {
                log::error!(target: "acceptor", "cannot create listening socket: {err}");
                panic!("cannot create listening socket: {err}");
            }
        };
        if let Err(err) = socket.set_nonblocking(true) {
            log::error!(target: "acceptor", "cannot make listening socket non-blocking: {err}");
            panic!("cannot make listening socket non-blocking: {err}");
        }
        if let Err(err) = socket.set_reuse_address(true) {
            log::error!(target: "acceptor", "cannot enable address reuse: {err}");
        }
        if reuse_port {
            if let Err(err) = socket.set_reuse_port(true) {
                log::error!(target: "acceptor", "cannot enable port reuse: {err}");
            }
        }
        if let Err(err) = socket.bind(&addr.into()) {
            log::error!(target: "acceptor", "cannot bind {addr}: {err}");
            panic!("cannot bind {addr}: {err}");
        }

        let registration = Registration::new(reactor, socket.as_raw_fd());
        let acceptor = Arc::new(Acceptor {
            reactor: reactor.clone(),
            socket,
            registration,
            listening: AtomicBool::new(false),
            on_connection: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.registration.set_read_callback(Box::new(move |_tick| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_readable();
            }
        }));
        acceptor
    }

    /// Marks the socket listening and arms read interest. Runs on the main
    /// reactor.
    pub fn listen(&self) {
        self.listening.store(true, Ordering::Release);
        if let Err(err) = self.socket.listen(BACKLOG) {
            log::error!(target: "acceptor", "cannot listen on {}: {err}", self.local_addr());
            panic!("cannot listen: {err}");
        }
        self.registration.enable_read();
        log::info!(target: "acceptor", "listening on {}", self.local_addr());
    }

    pub fn is_listening(&self) -> bool { self.listening.load(Ordering::Acquire) }

    /// Actual bound address, usable after a port-zero bind.
    pub fn local_addr(&self) -> SocketAddr {
        self.socket
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .expect("listening socket must have a local address")
    }

    /// Installs the new-connection callback. Connections accepted without a
    /// callback installed are closed on the spot.
    pub fn set_connection_callback(&self, callback: NewConnectionCallback) {
        *self.on_connection.lock() = Some(callback);
    }

    fn handle_readable(&self) {
        match self.socket.accept() {
            Ok((connection, peer)) => {
                if let Err(err) = connection.set_nonblocking(true) {
                    log::error!(target: "acceptor", "cannot make accepted socket non-blocking: {err}");
                }
                let Some(peer) = peer.as_socket() else {
                    log::error!(target: "acceptor", "accepted connection without an inet peer address");
                    return;
                };
                match &*self.on_connection.lock() {
                    Some(callback) => callback(connection, peer),
                    // Dropping the socket closes the just-accepted fd.
                    None => log::debug!(target: "acceptor", "no connection callback, closing {peer}"),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Spurious wakeup; the next readiness will retry.
            }
            Err(err) if err.raw_os_error() == Some(libc::EMFILE) => {
                log::error!(target: "acceptor", "descriptor limit reached, cannot accept: {err}");
            }
            Err(err)
                if matches!(
                    err.raw_os_error(),
                    Some(libc::EINTR) | Some(libc::ECONNABORTED)
                ) =>
            {
                log::debug!(target: "acceptor", "transient accept failure: {err}");
            }
            Err(err) => {
                log::error!(target: "acceptor", "accept failed: {err}");
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.registration.disable_all();
        self.registration.remove();
    }
}
