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

//! Multi-reactor TCP server library built on the "one loop per thread"
//! pattern.
//!
//! A [`Reactor`] is a thread-bound event loop demultiplexing non-blocking
//! descriptors through an epoll-backed readiness selector, woken from other
//! threads through an eventfd notifier. A [`Server`] runs its acceptor on the
//! main reactor and spreads accepted [`Connection`]s across a pool of worker
//! reactors round-robin; the application reacts to connection lifecycle and
//! arriving bytes through callbacks executed on the owning worker's thread.
//!
//! It uses the same principle as async runtimes, but keeps the API
//! synchronous: callbacks must not block, and long-running work belongs in
//! an external [`WorkerPool`] which hops results back via
//! [`Reactor::submit`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use netloop::{Reactor, Server};
//!
//! let reactor = Reactor::new();
//! let server = Server::new(&reactor, "127.0.0.1:8080".parse().unwrap(), "echo", false);
//! server.set_worker_count(2);
//! server.set_message_callback(Arc::new(|connection, buffer, _tick| {
//!     let message = buffer.take_all_as_string();
//!     connection.send(message);
//! }));
//! server.start();
//! reactor.run();
//! ```

#[macro_use]
extern crate amplify;

mod acceptor;
mod buffer;
mod connection;
mod pool;
mod poller;
mod reactor;
mod registration;
mod server;

pub use acceptor::{Acceptor, NewConnectionCallback};
pub use buffer::{Buffer, INITIAL_SIZE, PREPEND};
pub use connection::{
    ConnectCallback, Connection, ConnectionRef, ConnectionState, HighWaterCallback,
    MessageCallback, WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
pub use pool::{ReactorPool, ThreadInitHook, WorkerPool};
pub use poller::POLLER_ENV;
pub use reactor::Reactor;
pub use server::Server;
