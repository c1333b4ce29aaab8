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

//! Per-connection state machine with buffered, callback-driven I/O.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsFd, AsRawFd};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use nix::errno::Errno;
use parking_lot::Mutex;
use socket2::Socket;

use crate::buffer::Buffer;
use crate::reactor::Reactor;
use crate::registration::Registration;

/// Pending-output threshold above which the application is asked to back
/// off, unless overridden per connection.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Shared handle to a connection. Connections are co-owned by the server's
/// table and by any dispatch in flight, so a callback always observes a live
/// object even when the server has just dropped its entry.
pub type ConnectionRef = Arc<Connection>;

/// Invoked when a connection is established and again when it goes down;
/// [`Connection::is_connected`] discriminates.
pub type ConnectCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;
/// Invoked when bytes arrived in the input buffer.
pub type MessageCallback = Arc<dyn Fn(&ConnectionRef, &mut Buffer, SystemTime) + Send + Sync>;
/// Invoked once the output buffer fully drained into the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;
/// Invoked when the pending output crossed the high-water threshold upward;
/// carries the number of buffered bytes.
pub type HighWaterCallback = Arc<dyn Fn(&ConnectionRef, usize) + Send + Sync>;
/// Internal close notification wired by the server to prune its table.
pub(crate) type CloseCallback = Arc<dyn Fn(&ConnectionRef) + Send + Sync>;

/// Connection lifecycle. Transitions happen only on the owning reactor and
/// run `connecting → connected → (disconnecting →)? disconnected`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
#[display(lowercase)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_raw(raw: u8) -> ConnectionState {
        match raw {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// A single accepted TCP connection owned by a worker reactor.
///
/// All I/O and state mutation happen on that reactor's thread; the
/// cross-thread entry points ([`Connection::send`], [`Connection::shutdown`])
/// re-enter the connection there via deferred tasks. The connection owns its
/// socket; the descriptor is closed when the last shared owner drops.
pub struct Connection {
    reactor: Arc<Reactor>,
    name: String,
    socket: Socket,
    registration: Registration,
    state: AtomicU8,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    high_water_mark: AtomicUsize,
    on_connect: Mutex<Option<ConnectCallback>>,
    on_message: Mutex<Option<MessageCallback>>,
    on_write_complete: Mutex<Option<WriteCompleteCallback>>,
    on_high_water: Mutex<Option<HighWaterCallback>>,
    on_close: Mutex<Option<CloseCallback>>,
}

impl Connection {
    pub(crate) fn new(
        reactor: Arc<Reactor>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> ConnectionRef {
        if let Err(err) = socket.set_keepalive(true) {
            log::error!(target: "transport", "cannot enable keepalive on {name}: {err}");
        }
        let registration = Registration::new(&reactor, socket.as_raw_fd());
        let connection = Arc::new(Connection {
            reactor,
            name,
            socket,
            registration,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            input: Mutex::new(Buffer::default()),
            output: Mutex::new(Buffer::default()),
            local_addr,
            peer_addr,
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            on_connect: Mutex::new(None),
            on_message: Mutex::new(None),
            on_write_complete: Mutex::new(None),
            on_high_water: Mutex::new(None),
            on_close: Mutex::new(None),
        });

        let weak = Arc::downgrade(&connection);
        connection.registration.set_read_callback(Box::new({
            let weak = weak.clone();
            move |tick| {
                if let Some(connection) = weak.upgrade() {
                    connection.handle_read(tick);
                }
            }
        }));
        connection.registration.set_write_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(connection) = weak.upgrade() {
                    connection.handle_write();
                }
            }
        }));
        connection.registration.set_close_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(connection) = weak.upgrade() {
                    connection.handle_close();
                }
            }
        }));
        connection.registration.set_error_callback(Box::new(move || {
            if let Some(connection) = weak.upgrade() {
                connection.handle_error();
            }
        }));

        log::debug!(
            target: "transport",
            "connection {} created for fd {}", connection.name, connection.socket.as_raw_fd()
        );
        connection
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    pub fn peer_addr(&self) -> SocketAddr { self.peer_addr }

    /// The worker reactor owning this connection.
    pub fn reactor(&self) -> &Arc<Reactor> { &self.reactor }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool { self.state() == ConnectionState::Connected }

    pub fn is_disconnected(&self) -> bool { self.state() == ConnectionState::Disconnected }

    /// Toggles the Nagle algorithm. The core never touches it; the kernel
    /// default stays in effect unless the application flips it.
    pub fn set_nodelay(&self, nodelay: bool) {
        if let Err(err) = self.socket.set_nodelay(nodelay) {
            log::error!(target: "transport", "cannot toggle nodelay on {}: {err}", self.name);
        }
    }

    pub fn set_connect_callback(&self, callback: ConnectCallback) {
        *self.on_connect.lock() = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.on_message.lock() = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.on_write_complete.lock() = Some(callback);
    }

    /// Installs the back-off callback together with its threshold in bytes.
    pub fn set_high_water_callback(&self, callback: HighWaterCallback, threshold: usize) {
        self.high_water_mark.store(threshold, Ordering::Relaxed);
        *self.on_high_water.lock() = Some(callback);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        *self.on_close.lock() = Some(callback);
    }

    /// Completes the handover from the acceptor: ties the registration to
    /// this connection, arms read interest and fires the connect callback.
    /// Runs on the owning reactor.
    pub(crate) fn establish(self: &Arc<Self>) {
        self.set_state(ConnectionState::Connected);
        self.registration.tie(self);
        self.registration.enable_read();
        self.run_connect_callback();
    }

    /// Final teardown posted by the server after the connection left its
    /// table. Deregisters the descriptor; the socket closes when the last
    /// owner drops.
    pub(crate) fn destroy(self: &Arc<Self>) {
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
            self.registration.disable_all();
            self.run_connect_callback();
        }
        self.registration.remove();
        log::debug!(target: "transport", "connection {} destroyed", self.name);
    }

    /// Sends `data` to the peer, callable from any thread.
    ///
    /// On the owning reactor the bytes go out directly when nothing is
    /// queued; otherwise (and for any remainder the kernel did not take) they
    /// are appended to the output buffer and write interest is armed. Bytes
    /// from consecutive sends on one thread reach the wire in call order.
    pub fn send(self: &Arc<Self>, data: impl AsRef<[u8]>) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        if self.reactor.is_in_thread() {
            self.send_in_loop(data.as_ref());
        } else {
            let connection = self.clone();
            let data = data.as_ref().to_vec();
            self.reactor.enqueue(move || connection.send_in_loop(&data));
        }
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        if self.state() == ConnectionState::Disconnected {
            log::error!(
                target: "transport",
                "connection {} is down, dropping {} bytes", self.name, data.len()
            );
            return;
        }

        let mut written = 0usize;
        let mut fault = false;

        // Direct write only when nothing is queued, otherwise the payload
        // would overtake bytes already buffered.
        if !self.registration.is_writing() && self.output.lock().readable_len() == 0 {
            match self.socket.send(data) {
                Ok(n) => {
                    written = n;
                    if written == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    log::error!(target: "transport", "write on {} failed: {err}", self.name);
                    if matches!(
                        err.raw_os_error(),
                        Some(libc::EPIPE) | Some(libc::ECONNRESET)
                    ) {
                        fault = true;
                    }
                }
            }
        }

        let remaining = data.len() - written;
        if fault || remaining == 0 {
            return;
        }

        let mut output = self.output.lock();
        let buffered = output.readable_len();
        let high_water_mark = self.high_water_mark.load(Ordering::Relaxed);
        if buffered < high_water_mark && buffered + remaining >= high_water_mark {
            let callback = self.on_high_water.lock().clone();
            if let Some(callback) = callback {
                let connection = self.clone();
                let level = buffered + remaining;
                self.reactor.enqueue(move || callback(&connection, level));
            }
        }
        output.append(&data[written..]);
        if !self.registration.is_writing() {
            self.registration.enable_write();
        }
    }

    /// Requests an orderly shutdown: once the output buffer drains, the
    /// write side is half-closed and the peer's hangup completes the close.
    /// Callable from any thread.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnecting);
            let connection = self.clone();
            self.reactor.submit(move || connection.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        // Still writing means buffered output remains; the writable handler
        // re-runs this once the buffer empties.
        if !self.registration.is_writing() {
            if let Err(err) = self.socket.shutdown(Shutdown::Write) {
                log::error!(target: "transport", "cannot half-close {}: {err}", self.name);
            }
        }
    }

    fn handle_read(self: &Arc<Self>, tick: SystemTime) {
        let mut input = self.input.lock();
        match input.read_from_fd(self.socket.as_fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                let callback = self.on_message.lock().clone();
                match callback {
                    Some(callback) => callback(self, &mut *input, tick),
                    // Without a consumer the input would grow without bound.
                    None => input.retrieve_all(),
                }
            }
            Err(Errno::EAGAIN) => {
                // Spurious wakeup; the next readiness will retry.
            }
            Err(err) => {
                drop(input);
                log::error!(target: "transport", "read on {} failed: {err}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        if !self.registration.is_writing() {
            log::trace!(
                target: "transport",
                "connection {} got writable without write interest", self.name
            );
            return;
        }
        let mut output = self.output.lock();
        match output.write_to_fd(self.socket.as_fd()) {
            Ok(n) => {
                output.consume(n);
                if output.readable_len() == 0 {
                    self.registration.disable_write();
                    drop(output);
                    self.queue_write_complete();
                    if self.state() == ConnectionState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(Errno::EAGAIN) => {}
            Err(err) => {
                log::error!(target: "transport", "flush on {} failed: {err}", self.name);
            }
        }
    }

    fn handle_close(self: &Arc<Self>) {
        log::info!(
            target: "transport",
            "connection {} (fd {}) closing from state {}",
            self.name, self.socket.as_raw_fd(), self.state()
        );
        self.set_state(ConnectionState::Disconnected);
        self.registration.disable_all();

        // Both callbacks observe a live connection even when the server
        // drops its table entry in between.
        let guard = self.clone();
        self.run_connect_callback();
        let callback = self.on_close.lock().clone();
        if let Some(callback) = callback {
            callback(&guard);
        }
    }

    /// Reports the socket's pending error. The close is driven separately by
    /// a read of zero or an explicit shutdown.
    fn handle_error(&self) {
        let error = match self.socket.take_error() {
            Ok(Some(err)) => err.to_string(),
            Ok(None) => s!("unknown"),
            Err(err) => err.to_string(),
        };
        log::error!(target: "transport", "connection {} socket error: {error}", self.name);
    }

    fn run_connect_callback(self: &Arc<Self>) {
        let callback = self.on_connect.lock().clone();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    fn queue_write_complete(self: &Arc<Self>) {
        let callback = self.on_write_complete.lock().clone();
        if let Some(callback) = callback {
            let connection = self.clone();
            self.reactor.enqueue(move || callback(&connection));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}
