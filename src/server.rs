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

//! Server façade: the acceptor on the main reactor, connections on pool
//! workers, and the table of live connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use parking_lot::Mutex;
use socket2::Socket;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{
    ConnectCallback, Connection, ConnectionRef, MessageCallback, WriteCompleteCallback,
};
use crate::pool::{ReactorPool, ThreadInitHook};
use crate::reactor::Reactor;

/// Multi-reactor TCP server.
///
/// The main reactor hosts the acceptor and the connection table; each
/// accepted connection is handed to a worker reactor picked round-robin from
/// the pool (or to the main reactor when the pool is empty). User callbacks
/// run on the worker owning the connection and must not block.
pub struct Server {
    me: Weak<Server>,
    reactor: Arc<Reactor>,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<ReactorPool>,
    connections: Mutex<HashMap<String, ConnectionRef>>,
    next_connection_id: AtomicU64,
    started: AtomicUsize,
    on_connect: Mutex<ConnectCallback>,
    on_message: Mutex<MessageCallback>,
    on_write_complete: Mutex<Option<WriteCompleteCallback>>,
    init_hook: Mutex<Option<ThreadInitHook>>,
}

impl Server {
    /// Creates a server listening (once started) on `listen_addr`.
    ///
    /// The listening socket is created and bound eagerly; a bind failure is
    /// fatal. `reuse_port` additionally enables `SO_REUSEPORT` so several
    /// server processes may share the address.
    pub fn new(
        reactor: &Arc<Reactor>,
        listen_addr: SocketAddr,
        name: impl ToString,
        reuse_port: bool,
    ) -> Arc<Server> {
        let name = name.to_string();
        let server = Arc::new_cyclic(|me| Server {
            me: me.clone(),
            reactor: reactor.clone(),
            name: name.clone(),
            acceptor: Acceptor::new(reactor, listen_addr, reuse_port),
            pool: Mutex::new(ReactorPool::new(reactor.clone(), name)),
            connections: Mutex::new(empty!()),
            next_connection_id: AtomicU64::new(1),
            started: AtomicUsize::new(0),
            on_connect: Mutex::new(Arc::new(default_connect_callback)),
            on_message: Mutex::new(Arc::new(default_message_callback)),
            on_write_complete: Mutex::new(None),
            init_hook: Mutex::new(None),
        });

        let me = server.me.clone();
        server.acceptor.set_connection_callback(Box::new(move |socket, peer| {
            if let Some(server) = me.upgrade() {
                server.new_connection(socket, peer);
            }
        }));
        server
    }

    pub fn name(&self) -> &str { &self.name }

    /// The main reactor hosting the acceptor.
    pub fn reactor(&self) -> &Arc<Reactor> { &self.reactor }

    /// Actual listening address; resolves port-zero binds.
    pub fn local_addr(&self) -> SocketAddr { self.acceptor.local_addr() }

    /// Number of worker reactors to spawn. Must be called before
    /// [`Server::start`].
    pub fn set_worker_count(&self, workers: usize) {
        self.pool.lock().set_worker_count(workers);
    }

    /// Hook run once per worker reactor on its own thread before it starts
    /// looping.
    pub fn set_thread_init_hook(&self, hook: ThreadInitHook) {
        *self.init_hook.lock() = Some(hook);
    }

    /// Replaces the default connect callback (which logs up/down
    /// transitions).
    pub fn set_connect_callback(&self, callback: ConnectCallback) {
        *self.on_connect.lock() = callback;
    }

    /// Replaces the default message callback (which discards arrived bytes).
    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.on_message.lock() = callback;
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.on_write_complete.lock() = Some(callback);
    }

    /// Boots the worker pool and arms the acceptor on the main reactor.
    /// Idempotent: repeated calls are no-ops.
    pub fn start(&self) {
        if self.started.fetch_add(1, Ordering::AcqRel) == 0 {
            let hook = self.init_hook.lock().clone();
            self.pool.lock().start(hook);
            let acceptor = self.acceptor.clone();
            self.reactor.submit(move || acceptor.listen());
        }
    }

    /// Handles one accepted connection; runs on the main reactor.
    fn new_connection(&self, socket: Socket, peer_addr: SocketAddr) {
        let worker = self.pool.lock().next_reactor();
        let local_addr = socket
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .unwrap_or_else(|| {
                log::error!(target: "server", "cannot resolve local address of an accepted socket");
                self.local_addr()
            });
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}#{id}", self.name, self.local_addr());
        log::info!(
            target: "server",
            "server {} accepted connection [{name}] from {peer_addr}", self.name
        );

        let connection =
            Connection::new(worker.clone(), name.clone(), socket, local_addr, peer_addr);
        self.connections.lock().insert(name, connection.clone());

        connection.set_connect_callback(self.on_connect.lock().clone());
        connection.set_message_callback(self.on_message.lock().clone());
        if let Some(callback) = self.on_write_complete.lock().clone() {
            connection.set_write_complete_callback(callback);
        }
        let me = self.me.clone();
        connection.set_close_callback(Arc::new(move |connection| {
            if let Some(server) = me.upgrade() {
                server.remove_connection(connection);
            }
        }));

        let establishing = connection.clone();
        worker.submit(move || establishing.establish());
    }

    /// Prunes a closed connection. Thread-safe: hops to the main reactor,
    /// erases the table entry there and posts the final teardown to the
    /// connection's own worker.
    fn remove_connection(&self, connection: &ConnectionRef) {
        let me = self.me.clone();
        let connection = connection.clone();
        self.reactor.submit(move || {
            if let Some(server) = me.upgrade() {
                server.remove_connection_in_loop(&connection);
            }
        });
    }

    fn remove_connection_in_loop(&self, connection: &ConnectionRef) {
        log::info!(
            target: "server",
            "server {} removes connection [{}]", self.name, connection.name()
        );
        self.connections.lock().remove(connection.name());
        let destroying = connection.clone();
        connection.reactor().enqueue(move || destroying.destroy());
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        log::info!(target: "server", "server {} shutting down", self.name);
        for (_, connection) in self.connections.get_mut().drain() {
            let destroying = connection.clone();
            connection.reactor().submit(move || destroying.destroy());
        }
        // Dropping the pool afterwards quits and joins every worker; the
        // posted teardowns drain before the workers observe the quit.
    }
}

fn default_connect_callback(connection: &ConnectionRef) {
    log::info!(
        target: "server",
        "connection {} ({} -> {}) is {}",
        connection.name(),
        connection.peer_addr(),
        connection.local_addr(),
        if connection.is_connected() { "up" } else { "down" }
    );
}

fn default_message_callback(_connection: &ConnectionRef, buffer: &mut Buffer, _tick: SystemTime) {
    buffer.retrieve_all();
}
