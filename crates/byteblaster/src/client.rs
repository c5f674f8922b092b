// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ByteBlaster client and connection supervisor.
//!
//! The public [`ByteBlasterClient`] is a thin handle; all protocol work
//! happens on one dedicated I/O thread driving a mio poll loop:
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                      I/O thread                              |
//! |  +-------------------------------------------------------+  |
//! |  |                    mio::Poll                           |  |
//! |  |  - TCP stream (connect / read / write)                 |  |
//! |  |  - Waker (commands from the handle)                    |  |
//! |  +-------------------------------------------------------+  |
//! |        |                  |                    |             |
//! |        v                  v                    v             |
//! |  reconnect loop     ProtocolDecoder     Authenticator /      |
//! |  (server rotation,  -> FileAssembler    Watchdog deadlines   |
//! |   backoff)          -> HandlerRegistry                       |
//! +-------------------------------------------------------------+
//! ```
//!
//! Because decoder, assembler and server-list mutations all happen on this
//! single thread, the pipeline needs no locking beyond the two handles the
//! API can touch (the server-list manager and the handler registry).
//!
//! # Example
//!
//! ```no_run
//! use byteblaster::{ByteBlasterClient, ByteBlasterConfig, ClosureHandler, CompletedFile};
//! use std::sync::Arc;
//!
//! let mut client = ByteBlasterClient::new(ByteBlasterConfig::new("user@example.com"))?;
//! client.subscribe(Arc::new(ClosureHandler::new(|file: &CompletedFile| {
//!     println!("{} ({} bytes)", file.filename, file.data.len());
//!     Ok(())
//! })));
//! client.start()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::assembler::FileAssembler;
use crate::auth::Authenticator;
use crate::config::{ByteBlasterConfig, ConfigError};
use crate::dispatch::{FileHandler, HandlerRegistry};
use crate::protocol::decoder::ProtocolDecoder;
use crate::protocol::models::{Frame, ServerAddr, ServerList};
use crate::serverlist::ServerListManager;
use crate::watchdog::Watchdog;

// ============================================================================
// Constants
// ============================================================================

/// Token for the (single) server connection.
const CONNECTION_TOKEN: Token = Token(0);

/// Token for the waker (command channel).
const WAKER_TOKEN: Token = Token(1);

/// Poll tick; deadlines (connect timeout, re-auth, watchdog) are checked at
/// this granularity.
const POLL_TICK: Duration = Duration::from_millis(100);

/// Read chunk size for draining the socket.
const READ_CHUNK: usize = 8 * 1024;

/// Quick-failover cap on the per-server retry delay.
const FAILOVER_DELAY_CAP: Duration = Duration::from_secs(2);

/// Cap on the all-servers-failed backoff delay.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

// ============================================================================
// Handle
// ============================================================================

/// Commands sent to the I/O thread.
enum ClientCommand {
    /// Stop the reconnect loop and unwind.
    Shutdown,
}

struct IoHandle {
    cmd_tx: Sender<ClientCommand>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

/// EMWIN ByteBlaster client.
///
/// Maintains a persistent connection to one of the pool servers,
/// authenticates on a fixed cadence, reassembles the interleaved block
/// stream and fans completed files out to subscribers.
pub struct ByteBlasterClient {
    config: ByteBlasterConfig,
    server_manager: Arc<Mutex<ServerListManager>>,
    handlers: Arc<Mutex<HandlerRegistry>>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    io: Option<IoHandle>,
}

impl std::fmt::Debug for ByteBlasterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBlasterClient")
            .field("config", &self.config)
            .field("running", &self.running)
            .field("connected", &self.connected)
            .finish()
    }
}

impl ByteBlasterClient {
    /// Create a client.
    ///
    /// Validates the configuration and loads the persisted server list;
    /// no connection is attempted until [`start`](Self::start).
    pub fn new(config: ByteBlasterConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let server_manager = ServerListManager::with_options(
            &config.server_list_path,
            config.enable_persistence,
            config.shuffle_servers,
        );

        Ok(Self {
            config,
            server_manager: Arc::new(Mutex::new(server_manager)),
            handlers: Arc::new(Mutex::new(HandlerRegistry::new())),
            running: Arc::new(AtomicBool::new(false)),
            connected: Arc::new(AtomicBool::new(false)),
            io: None,
        })
    }

    /// Subscribe a completed-file handler.
    pub fn subscribe(&self, handler: Arc<dyn FileHandler>) {
        self.handlers.lock().subscribe(handler);
    }

    /// Unsubscribe a handler; no-op when absent.
    pub fn unsubscribe(&self, handler: &Arc<dyn FileHandler>) {
        self.handlers.lock().unsubscribe(handler);
    }

    /// Whether the reconnect loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether a server connection is currently established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of servers in the rotation pool.
    pub fn server_count(&self) -> usize {
        self.server_manager.lock().len()
    }

    /// Snapshot of the current server list.
    pub fn server_list(&self) -> ServerList {
        self.server_manager.lock().current_list().clone()
    }

    /// The logon email identity.
    pub fn email(&self) -> &str {
        &self.config.email
    }

    /// Start the reconnect loop on a dedicated I/O thread. Idempotent.
    pub fn start(&mut self) -> io::Result<()> {
        if self.is_running() {
            log::warn!("[CLIENT] Already running");
            return Ok(());
        }

        let auth = Authenticator::new(&self.config.email)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = channel();

        self.running.store(true, Ordering::SeqCst);

        let worker = IoWorker {
            poll,
            cmd_rx,
            decoder: ProtocolDecoder::new(),
            auth,
            watchdog: Watchdog::new(self.config.watchdog_timeout, self.config.max_exceptions),
            assembler: FileAssembler::new(),
            server_manager: Arc::clone(&self.server_manager),
            handlers: Arc::clone(&self.handlers),
            running: Arc::clone(&self.running),
            connected: Arc::clone(&self.connected),
            config: self.config.clone(),
            conn: ConnState::Idle { retry_at: None },
            consecutive_failures: 0,
        };

        let thread = thread::Builder::new()
            .name("byteblaster-io".to_string())
            .spawn(move || worker.run())
            .inspect_err(|_| self.running.store(false, Ordering::SeqCst))?;

        self.io = Some(IoHandle {
            cmd_tx,
            waker,
            thread: Some(thread),
        });

        log::info!("[CLIENT] Started");
        Ok(())
    }

    /// Stop the client, waiting up to `timeout` (or indefinitely with
    /// `None`) for the I/O thread to unwind. Idempotent.
    pub fn stop(&mut self, timeout: Option<Duration>) {
        let Some(mut io) = self.io.take() else {
            return;
        };

        log::info!("[CLIENT] Stopping");
        let _ = io.cmd_tx.send(ClientCommand::Shutdown);
        let _ = io.waker.wake();

        let Some(thread) = io.thread.take() else {
            return;
        };

        match timeout {
            None => {
                let _ = thread.join();
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while self.is_running() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(10));
                }
                if self.is_running() {
                    // Leave the thread to unwind on its own.
                    log::warn!("[CLIENT] I/O thread did not stop within {timeout:?}");
                } else {
                    let _ = thread.join();
                }
            }
        }
        log::info!("[CLIENT] Stopped");
    }
}

impl Drop for ByteBlasterClient {
    fn drop(&mut self) {
        self.stop(Some(Duration::from_secs(5)));
    }
}

// ============================================================================
// I/O worker
// ============================================================================

enum ConnState {
    /// No socket; connect when `retry_at` passes (immediately when `None`).
    Idle { retry_at: Option<Instant> },

    /// Non-blocking connect in flight.
    Connecting {
        stream: TcpStream,
        peer: ServerAddr,
        started: Instant,
    },

    /// Established connection with a pending-write queue.
    Connected {
        stream: TcpStream,
        peer: ServerAddr,
        send_queue: Vec<u8>,
        send_offset: usize,
    },
}

struct IoWorker {
    poll: Poll,
    cmd_rx: Receiver<ClientCommand>,
    decoder: ProtocolDecoder,
    auth: Authenticator,
    watchdog: Watchdog,
    assembler: FileAssembler,
    server_manager: Arc<Mutex<ServerListManager>>,
    handlers: Arc<Mutex<HandlerRegistry>>,
    running: Arc<AtomicBool>,
    connected: Arc<AtomicBool>,
    config: ByteBlasterConfig,
    conn: ConnState,
    consecutive_failures: u32,
}

impl IoWorker {
    fn run(mut self) {
        let mut events = Events::with_capacity(64);
        log::info!("[CLIENT] I/O loop running");

        'outer: loop {
            while let Ok(cmd) = self.cmd_rx.try_recv() {
                match cmd {
                    ClientCommand::Shutdown => break 'outer,
                }
            }

            self.tick();

            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TICK)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[CLIENT] Poll failed: {e}");
                break;
            }

            for event in events.iter() {
                if event.token() == CONNECTION_TOKEN {
                    self.on_socket_event(event.is_readable(), event.is_writable());
                }
                // WAKER_TOKEN just breaks the poll; commands drain above.
            }
        }

        self.teardown();
        self.running.store(false, Ordering::SeqCst);
        log::info!("[CLIENT] I/O loop exited");
    }

    /// Advance timers: reconnect schedule, connect timeout, re-auth
    /// cadence and watchdog thresholds.
    fn tick(&mut self) {
        let now = Instant::now();

        match &self.conn {
            ConnState::Idle { retry_at } => {
                if retry_at.map_or(true, |t| now >= t) {
                    self.try_connect(now);
                }
            }
            ConnState::Connecting { started, peer, .. } => {
                if now.duration_since(*started) >= self.config.connection_timeout {
                    log::warn!(
                        "[CLIENT] Connection to {peer} timed out after {:.1}s",
                        self.config.connection_timeout.as_secs_f64()
                    );
                    self.abort_socket();
                    self.schedule_retry();
                }
            }
            ConnState::Connected { .. } => {
                if self.auth.logon_due(now) {
                    let message = self.auth.logon_message().to_vec();
                    self.auth.mark_sent(now);
                    log::debug!("[CLIENT] Sending logon ({} bytes)", message.len());
                    self.queue_bytes(&message);
                }

                if let Some(trip) = self.watchdog.check(now) {
                    log::warn!("[CLIENT] Watchdog tripped: {trip}");
                    self.disconnect();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------

    fn try_connect(&mut self, now: Instant) {
        let server = self.server_manager.lock().get_next_server();
        let Some(server) = server else {
            log::error!("[CLIENT] No servers available");
            self.conn = ConnState::Idle {
                retry_at: Some(now + self.config.reconnect_delay),
            };
            return;
        };

        log::info!(
            "[CLIENT] Attempting connection to {server} (attempt {})",
            self.consecutive_failures + 1
        );

        let addr = match (server.host.as_str(), server.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
        {
            Some(addr) => addr,
            None => {
                log::warn!("[CLIENT] Failed to resolve {server}");
                self.schedule_retry();
                return;
            }
        };

        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                if let Err(e) = self.poll.registry().register(
                    &mut stream,
                    CONNECTION_TOKEN,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    log::error!("[CLIENT] Failed to register socket: {e}");
                    self.schedule_retry();
                    return;
                }
                self.conn = ConnState::Connecting {
                    stream,
                    peer: server,
                    started: now,
                };
            }
            Err(e) => {
                log::warn!("[CLIENT] Connection to {server} failed: {e}");
                self.schedule_retry();
            }
        }
    }

    /// Account one failed attempt and schedule the next one.
    ///
    /// After every server has failed twice in a row, back off hard, rewind
    /// the rotation and start over from the top of the list.
    fn schedule_retry(&mut self) {
        self.consecutive_failures += 1;

        let server_count = self.server_manager.lock().len().max(1) as u32;
        let retry_at = if self.consecutive_failures >= server_count * 2 {
            let backoff = (self.config.reconnect_delay * 4).min(BACKOFF_CAP);
            log::warn!(
                "[CLIENT] All servers failed {} times, backing off for {:.1}s",
                self.consecutive_failures,
                backoff.as_secs_f64()
            );
            self.consecutive_failures = 0;
            self.server_manager.lock().reset_index();
            Instant::now() + backoff
        } else {
            Instant::now() + self.config.reconnect_delay.min(FAILOVER_DELAY_CAP)
        };

        self.conn = ConnState::Idle {
            retry_at: Some(retry_at),
        };
    }

    fn on_socket_event(&mut self, readable: bool, writable: bool) {
        if writable && matches!(self.conn, ConnState::Connecting { .. }) {
            self.finish_connect();
        }

        if matches!(self.conn, ConnState::Connected { .. }) {
            if writable {
                self.flush_writes();
            }
            if readable {
                self.pump_reads();
            }
        }
    }

    /// Resolve an in-flight non-blocking connect after a writability event.
    fn finish_connect(&mut self) {
        let (mut stream, peer, started) =
            match std::mem::replace(&mut self.conn, ConnState::Idle { retry_at: None }) {
                ConnState::Connecting {
                    stream,
                    peer,
                    started,
                } => (stream, peer, started),
                other => {
                    self.conn = other;
                    return;
                }
            };

        match stream.take_error() {
            Ok(None) => {}
            Ok(Some(e)) | Err(e) => {
                log::warn!("[CLIENT] Connection to {peer} failed: {e}");
                let _ = self.poll.registry().deregister(&mut stream);
                self.schedule_retry();
                return;
            }
        }

        let remote = match stream.peer_addr() {
            Ok(remote) => remote,
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                // Spurious wakeup; the connect is still in flight.
                self.conn = ConnState::Connecting {
                    stream,
                    peer,
                    started,
                };
                return;
            }
            Err(e) => {
                log::warn!("[CLIENT] Connection to {peer} failed: {e}");
                let _ = self.poll.registry().deregister(&mut stream);
                self.schedule_retry();
                return;
            }
        };

        log::info!("[CLIENT] Connected to {peer} ({remote})");
        let _ = stream.set_nodelay(true);

        self.consecutive_failures = 0;
        self.decoder.reset();
        self.decoder.set_remote_address(remote.to_string());

        let now = Instant::now();
        self.auth.activate();
        self.watchdog.activate(now);
        self.connected.store(true, Ordering::SeqCst);

        self.conn = ConnState::Connected {
            stream,
            peer,
            send_queue: Vec::new(),
            send_offset: 0,
        };

        // Logon goes out before anything else.
        let message = self.auth.logon_message().to_vec();
        self.auth.mark_sent(now);
        self.queue_bytes(&message);
    }

    // ------------------------------------------------------------------
    // Connected I/O
    // ------------------------------------------------------------------

    fn pump_reads(&mut self) {
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let result = {
                let ConnState::Connected { stream, .. } = &mut self.conn else {
                    return;
                };
                stream.read(&mut chunk)
            };

            match result {
                Ok(0) => {
                    if let ConnState::Connected { peer, .. } = &self.conn {
                        log::info!("[CLIENT] Connection to {peer} closed by peer");
                    }
                    self.disconnect();
                    return;
                }
                Ok(n) => self.handle_bytes(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("[CLIENT] Read failed: {e}");
                    self.watchdog.on_exception();
                    self.disconnect();
                    return;
                }
            }
        }
    }

    fn handle_bytes(&mut self, data: &[u8]) {
        if let Err(e) = self.decoder.feed(data) {
            // Decoder already resynchronized; count it and keep reading.
            log::warn!("[CLIENT] Protocol error: {e}");
            self.watchdog.on_exception();
        }
        self.drain_frames();
    }

    fn drain_frames(&mut self) {
        let now = Instant::now();

        while let Some(frame) = self.decoder.next_frame() {
            self.watchdog.on_data_received(now);

            match frame {
                Frame::DataBlock { segment } => {
                    log::debug!("[CLIENT] Received segment: {segment}");
                    if let Some(file) = self.assembler.handle_segment(segment) {
                        log::info!(
                            "[CLIENT] Completed file {} ({} bytes)",
                            file.filename,
                            file.data.len()
                        );
                        // Snapshot so slow handlers never hold the lock.
                        let registry = self.handlers.lock().clone();
                        registry.dispatch(&file);
                    }
                }
                Frame::ServerList { list, .. } => {
                    log::info!("[CLIENT] Received server list update ({} servers)", list.len());
                    self.server_manager.lock().update(list);
                }
            }
        }
    }

    fn queue_bytes(&mut self, bytes: &[u8]) {
        if let ConnState::Connected { send_queue, .. } = &mut self.conn {
            send_queue.extend_from_slice(bytes);
        }
        self.flush_writes();
    }

    fn flush_writes(&mut self) {
        let mut failure: Option<io::Error> = None;

        if let ConnState::Connected {
            stream,
            send_queue,
            send_offset,
            ..
        } = &mut self.conn
        {
            while *send_offset < send_queue.len() {
                match stream.write(&send_queue[*send_offset..]) {
                    Ok(0) => {
                        failure = Some(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "socket write returned zero",
                        ));
                        break;
                    }
                    Ok(n) => *send_offset += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            if *send_offset >= send_queue.len() {
                send_queue.clear();
                *send_offset = 0;
            }
        }

        if let Some(e) = failure {
            log::warn!("[CLIENT] Send failed: {e}");
            self.watchdog.on_exception();
            self.disconnect();
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Tear the connection down and reconnect immediately with the next
    /// server in rotation.
    fn disconnect(&mut self) {
        self.teardown();
        self.conn = ConnState::Idle { retry_at: None };
    }

    /// Stop the per-connection components and release the socket.
    fn teardown(&mut self) {
        self.auth.deactivate();
        self.watchdog.deactivate();
        self.connected.store(false, Ordering::SeqCst);
        self.abort_socket();
    }

    fn abort_socket(&mut self) {
        let state = std::mem::replace(&mut self.conn, ConnState::Idle { retry_at: None });
        match state {
            ConnState::Connecting { mut stream, .. } | ConnState::Connected { mut stream, .. } => {
                let _ = self.poll.registry().deregister(&mut stream);
            }
            ConnState::Idle { .. } => {}
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ClosureHandler;
    use crate::protocol::checksum::calculate_checksum;
    use crate::protocol::models::CompletedFile;
    use crate::protocol::xor::xor_encode;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use tempfile::TempDir;

    const LOGON_LEN: usize = "ByteBlast Client|NM-test@example.com|V2".len();

    fn test_config(dir: &TempDir, port: u16) -> ByteBlasterConfig {
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            format!(
                r#"{{"servers": ["127.0.0.1:{port}"], "sat_servers": [], "received_at": "2026-01-07T12:00:00Z", "version": "1.0"}}"#
            ),
        )
        .unwrap();

        ByteBlasterConfig {
            server_list_path: path,
            enable_persistence: true,
            shuffle_servers: false,
            reconnect_delay: Duration::from_millis(50),
            connection_timeout: Duration::from_secs(5),
            watchdog_timeout: Duration::from_secs(30),
            ..ByteBlasterConfig::new("test@example.com")
        }
    }

    fn build_header(filename: &str, pn: u32, pt: u32, cs: u32, dl: usize) -> Vec<u8> {
        let h =
            format!("/PF{filename} /PN {pn} /PT {pt} /CS {cs} /FD07/09/2025 01:02:03 PM /DL{dl} ");
        assert!(h.len() <= 78);
        let mut bytes = h.into_bytes();
        bytes.resize(78, b' ');
        bytes.extend_from_slice(b"\r\n");
        bytes
    }

    fn v2_block(filename: &str, pn: u32, pt: u32, body: &[u8]) -> Vec<u8> {
        let cs = u32::from(calculate_checksum(body));
        let mut frame = vec![0u8; 6];
        frame.extend(build_header(filename, pn, pt, cs, body.len()));
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn test_new_rejects_empty_email() {
        let err = ByteBlasterClient::new(ByteBlasterConfig::default()).unwrap_err();
        assert_eq!(err, ConfigError::EmptyEmail);
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut client = ByteBlasterClient::new(test_config(&dir, 9)).unwrap();
        assert!(!client.is_running());
        client.stop(Some(Duration::from_millis(100)));
        assert!(!client.is_running());
    }

    #[test]
    fn test_observables_before_start() {
        let dir = TempDir::new().unwrap();
        let client = ByteBlasterClient::new(test_config(&dir, 9)).unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.server_count(), 1);
        assert_eq!(client.email(), "test@example.com");
        assert_eq!(client.server_list().servers[0].port, 9);
    }

    #[test]
    fn test_logon_then_file_dispatch_end_to_end() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = TempDir::new().unwrap();

        let (logon_tx, logon_rx) = mpsc::channel();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();

            let mut logon = vec![0u8; LOGON_LEN];
            socket.read_exact(&mut logon).unwrap();
            logon_tx.send(logon).unwrap();

            let mut plain = v2_block("STORM.TXT", 1, 2, b"TORNADO");
            plain.extend(v2_block("STORM.TXT", 2, 2, b" WARNING"));
            socket.write_all(&xor_encode(&plain)).unwrap();
            socket.flush().unwrap();

            // Keep the socket open until the client has had time to read.
            thread::sleep(Duration::from_millis(500));
        });

        let mut client = ByteBlasterClient::new(test_config(&dir, port)).unwrap();
        let (file_tx, file_rx) = mpsc::channel();
        let file_tx = Mutex::new(file_tx);
        client.subscribe(Arc::new(ClosureHandler::new(move |f: &CompletedFile| {
            file_tx.lock().send(f.clone()).unwrap();
            Ok(())
        })));

        client.start().unwrap();
        assert!(client.is_running());

        let logon = logon_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(logon, xor_encode(b"ByteBlast Client|NM-test@example.com|V2"));

        let file = file_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(file.filename, "STORM.TXT");
        assert_eq!(file.data, b"TORNADO WARNING");

        client.stop(Some(Duration::from_secs(5)));
        assert!(!client.is_running());
        server.join().unwrap();
    }

    #[test]
    fn test_reconnects_after_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = TempDir::new().unwrap();

        let (logon_tx, logon_rx) = mpsc::channel();
        let server = thread::spawn(move || {
            for _ in 0..2 {
                let (mut socket, _) = listener.accept().unwrap();
                let mut logon = vec![0u8; LOGON_LEN];
                socket.read_exact(&mut logon).unwrap();
                logon_tx.send(logon).unwrap();
                // Dropping the socket forces the client to reconnect.
            }
        });

        let mut client = ByteBlasterClient::new(test_config(&dir, port)).unwrap();
        client.start().unwrap();

        let first = logon_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let second = logon_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, second);

        client.stop(Some(Duration::from_secs(5)));
        server.join().unwrap();
    }

    #[test]
    fn test_start_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let dir = TempDir::new().unwrap();

        let mut client = ByteBlasterClient::new(test_config(&dir, port)).unwrap();
        client.start().unwrap();
        client.start().unwrap();
        assert!(client.is_running());
        client.stop(Some(Duration::from_secs(5)));
        assert!(!client.is_running());
    }
}
