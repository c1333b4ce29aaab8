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

//! End-to-end scenarios driving a [`Server`] over real loopback sockets.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel as chan;
use netloop::{ConnectionRef, Reactor, Server};

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Events observed by server-side callbacks, funneled to the test thread.
#[derive(Clone, Eq, PartialEq, Debug)]
enum Event {
    Up,
    Down,
    Message(String),
    HighWater(usize),
}

struct Harness {
    reactor: Arc<Reactor>,
    server: Option<Arc<Server>>,
    loop_thread: Option<JoinHandle<()>>,
    events: chan::Receiver<Event>,
    event_tx: chan::Sender<Event>,
}

impl Harness {
    /// Boots a main reactor on its own thread and a server with `workers`
    /// worker reactors on an ephemeral loopback port. The connect callback
    /// reports up/down transitions into the event channel.
    fn start(name: &str, workers: usize) -> Harness {
        let (reactor_tx, reactor_rx) = chan::bounded(1);
        let loop_thread = thread::spawn(move || {
            let reactor = Reactor::new();
            reactor_tx.send(reactor.clone()).expect("harness waits for the reactor");
            reactor.run();
        });
        let reactor = reactor_rx.recv().expect("main reactor must start");

        let server = Server::new(&reactor, "127.0.0.1:0".parse().unwrap(), name, false);
        server.set_worker_count(workers);

        let (event_tx, events) = chan::unbounded();
        let tx = event_tx.clone();
        server.set_connect_callback(Arc::new(move |connection: &ConnectionRef| {
            let event = if connection.is_connected() { Event::Up } else { Event::Down };
            tx.send(event).ok();
        }));

        Harness {
            reactor,
            server: Some(server),
            loop_thread: Some(loop_thread),
            events,
            event_tx,
        }
    }

    fn server(&self) -> &Arc<Server> { self.server.as_ref().unwrap() }

    fn addr(&self) -> SocketAddr { self.server().local_addr() }

    fn expect_event(&self, expected: Event) {
        let event = self.events.recv_timeout(RECV_TIMEOUT).expect("expected a callback event");
        assert_eq!(event, expected);
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.take();
        self.reactor.quit();
        if let Some(thread) = self.loop_thread.take() {
            thread.join().expect("main reactor thread must not panic");
        }
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let client = TcpStream::connect(addr).expect("server must accept");
    client.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    client
}

#[test]
fn echo_roundtrip_with_graceful_close() {
    let harness = Harness::start("echo", 2);
    let tx = harness.event_tx.clone();
    harness.server().set_message_callback(Arc::new(move |connection, buffer, _tick| {
        let message = buffer.take_all_as_string();
        tx.send(Event::Message(message.clone())).ok();
        connection.send(message);
        connection.shutdown();
    }));
    harness.server().start();

    let mut client = connect(harness.addr());
    client.write_all(b"hello").unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"hello");

    // The server half-closed after echoing; closing the client side
    // completes the hangup and drives the terminal down.
    drop(client);

    harness.expect_event(Event::Up);
    harness.expect_event(Event::Message("hello".into()));
    harness.expect_event(Event::Down);
    assert!(harness.events.try_recv().is_err(), "exactly one terminal down expected");
}

#[test]
fn peer_fin_with_buffered_payload_delivers_the_payload_first() {
    let harness = Harness::start("fin", 1);
    let tx = harness.event_tx.clone();
    harness.server().set_message_callback(Arc::new(move |_connection, buffer, _tick| {
        tx.send(Event::Message(buffer.take_all_as_string())).ok();
    }));
    harness.server().start();

    let mut client = connect(harness.addr());
    client.write_all(b"bye").unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    harness.expect_event(Event::Up);
    harness.expect_event(Event::Message("bye".into()));
    harness.expect_event(Event::Down);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn single_thread_send_order_survives_partial_writes() {
    const CHUNK: usize = 100_000;

    let harness = Harness::start("order", 1);
    harness.server().set_message_callback(Arc::new(move |connection, buffer, _tick| {
        buffer.retrieve_all();
        // Two sends back to back from the worker thread: the first cannot
        // fit into the kernel buffer whole, the second must queue behind
        // its remainder.
        connection.send(vec![b'A'; CHUNK]);
        connection.send(vec![b'B'; CHUNK]);
    }));
    harness.server().start();

    let mut client = connect(harness.addr());
    client.write_all(b"go").unwrap();

    let mut received = vec![0u8; 2 * CHUNK];
    client.read_exact(&mut received).unwrap();
    assert!(received[..CHUNK].iter().all(|byte| *byte == b'A'));
    assert!(received[CHUNK..].iter().all(|byte| *byte == b'B'));
}

#[test]
fn crossing_the_high_water_mark_fires_exactly_once() {
    const THRESHOLD: usize = 64 * 1024;
    const PAYLOAD: usize = 4 * 1024 * 1024;

    let harness = Harness::start("backpressure", 1);
    let tx = harness.event_tx.clone();
    harness.server().set_connect_callback(Arc::new(move |connection: &ConnectionRef| {
        if !connection.is_connected() {
            tx.send(Event::Down).ok();
            return;
        }
        tx.send(Event::Up).ok();
        let watermark_tx = tx.clone();
        connection.set_high_water_callback(
            Arc::new(move |_connection, buffered| {
                watermark_tx.send(Event::HighWater(buffered)).ok();
            }),
            THRESHOLD,
        );
        connection.send(vec![b'x'; PAYLOAD]);
    }));
    harness.server().start();

    // The client connects but does not read, so the kernel cannot take the
    // whole payload and the remainder must queue past the threshold.
    let client = connect(harness.addr());
    harness.expect_event(Event::Up);

    let event = harness.events.recv_timeout(RECV_TIMEOUT).expect("high-water must fire");
    match event {
        Event::HighWater(buffered) => assert!(buffered >= THRESHOLD),
        other => panic!("expected a high-water event, got {other:?}"),
    }
    assert!(
        harness.events.recv_timeout(Duration::from_millis(300)).is_err(),
        "a single crossing must fire a single callback"
    );
    drop(client);
}

#[test]
fn send_from_a_foreign_thread_reaches_the_wire() {
    let harness = Harness::start("foreign", 1);
    let (conn_tx, conn_rx) = chan::bounded::<ConnectionRef>(1);
    harness.server().set_connect_callback(Arc::new(move |connection: &ConnectionRef| {
        if connection.is_connected() {
            conn_tx.send(connection.clone()).ok();
        }
    }));
    harness.server().start();

    let mut client = connect(harness.addr());
    let connection = conn_rx.recv_timeout(RECV_TIMEOUT).expect("connection must establish");

    // The test thread is foreign to the worker reactor; the send must hop
    // onto it through the deferred queue.
    assert!(!connection.reactor().is_in_thread());
    connection.send(b"pushed");

    let mut received = [0u8; 6];
    client.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"pushed");
}

#[test]
fn connections_spread_across_workers_and_all_echo() {
    const CLIENTS: usize = 6;

    let harness = Harness::start("spread", 3);
    harness.server().set_message_callback(Arc::new(move |connection, buffer, _tick| {
        let message = buffer.take_all_as_string();
        connection.send(message);
    }));
    harness.server().start();

    let addr = harness.addr();
    let clients: Vec<_> = (0..CLIENTS)
        .map(|index| {
            thread::spawn(move || {
                let mut client = connect(addr);
                let payload = format!("client-{index}");
                client.write_all(payload.as_bytes()).unwrap();
                let mut reply = vec![0u8; payload.len()];
                client.read_exact(&mut reply).unwrap();
                assert_eq!(reply, payload.as_bytes());
            })
        })
        .collect();
    for client in clients {
        client.join().expect("client must complete its echo");
    }

    // Down events from already-finished clients may interleave with later
    // ups; count until every client has been seen connecting.
    let mut ups = 0;
    while ups < CLIENTS {
        match harness.events.recv_timeout(RECV_TIMEOUT).expect("expected a connect event") {
            Event::Up => ups += 1,
            Event::Down => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[test]
fn dropping_the_server_emits_a_terminal_down_per_connection() {
    let mut harness = Harness::start("teardown", 2);
    harness.server().start();

    let _first = connect(harness.addr());
    let _second = connect(harness.addr());
    harness.expect_event(Event::Up);
    harness.expect_event(Event::Up);

    // Dropping the server tears down live connections through their owning
    // workers before the pool joins them.
    harness.server.take();

    harness.expect_event(Event::Down);
    harness.expect_event(Event::Down);
    assert!(harness.events.try_recv().is_err());
}
