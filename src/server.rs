//! TCP server for babble clients.
//!
//! One accept loop, one thread per live connection, and a fixed worker pool.
//! A connection handler performs the LOGIN handshake itself, then forwards
//! every further command into the shared queue; workers execute them and
//! write answers back on the client's own connection.

use crate::commands::{notify_client_parse_error, process_command, ServerContext};
use crate::config::Config;
use crate::protocol::{
    parse_command, write_answer, Command, CommandKind, ParseError, BABBLE_TIMELINE_MAX,
    MAX_LINE_LENGTH,
};
use crate::queue::{CommandQueue, Sequencer};
use crate::registration::ClientBundle;
use crate::semaphore::{OwnedPermit, Semaphore};
use crate::worker::WorkerPool;
use std::io::{self, BufRead, BufReader, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

/// Listen backlog for the accept socket
const LISTEN_BACKLOG: i32 = 1024;

/// Server errors surfaced to the process owner
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {0}: {1}")]
    Bind(SocketAddr, #[source] io::Error),
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Server instance
pub struct Server {
    config: Config,
    ctx: ServerContext,
    queue: Arc<CommandQueue>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance with fresh babble data.
    pub fn new(config: Config) -> Self {
        let ctx = ServerContext::new(config.max_clients);
        let queue = Arc::new(CommandQueue::new(config.queue_capacity));
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            ctx,
            queue,
            connection_limit,
        }
    }

    /// Bind and listen on the configured address.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let listen = self.config.listen_addr();
        create_listener(listen).map_err(|e| ServerError::Bind(listen, e))
    }

    /// Bind, then serve forever.
    pub fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener)
    }

    /// Start the worker pool and run the accept loop on `listener`.
    ///
    /// Only returns on a fatal accept or spawn failure.
    pub fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "Server listening");
        }

        let _workers = WorkerPool::spawn(
            self.config.workers,
            Arc::clone(&self.queue),
            self.ctx.clone(),
        )
        .map_err(ServerError::Spawn)?;

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.acquire_owned();

            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "Transient accept failure");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    return Err(ServerError::Accept(e));
                }
            };
            debug!(peer = %peer, "New connection");

            // The stream and the permit move into the handler; nothing the
            // next iteration touches is shared with it.
            let handler = ConnectionHandler {
                stream,
                peer,
                ctx: self.ctx.clone(),
                queue: Arc::clone(&self.queue),
                sequencer: Sequencer::new(),
            };
            thread::Builder::new()
                .name(format!("conn-{peer}"))
                .spawn(move || handler.run(permit))
                .map_err(ServerError::Spawn)?;
        }
    }

    /// Shared state, for inspection in tests
    #[cfg(test)]
    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

/// Lifecycle of one connection
enum ConnState {
    AwaitingLogin,
    Active { origin: Arc<ClientBundle> },
    Closed { key: Option<u64> },
}

/// Per-connection handler, owned by its thread
struct ConnectionHandler {
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ServerContext,
    queue: Arc<CommandQueue>,
    sequencer: Arc<Sequencer>,
}

impl ConnectionHandler {
    fn run(mut self, permit: OwnedPermit) {
        let mut reader = match self.stream.try_clone() {
            Ok(read_half) => BufReader::new(read_half),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Failed to clone connection");
                return;
            }
        };

        let mut state = ConnState::AwaitingLogin;
        loop {
            state = match state {
                ConnState::AwaitingLogin => self.login(&mut reader),
                ConnState::Active { origin } => self.forward(&mut reader, origin),
                ConnState::Closed { key } => {
                    self.close(key);
                    break;
                }
            };
        }

        // Frees a slot for the accept loop.
        drop(permit);
    }

    /// Handle the first line, which must be a LOGIN.
    fn login(&mut self, reader: &mut BufReader<TcpStream>) -> ConnState {
        let line = match read_line(reader) {
            Ok(Some(line)) => line,
            Ok(None) => return ConnState::Closed { key: None },
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Error receiving LOGIN");
                return ConnState::Closed { key: None };
            }
        };

        let mut cmd = match parse_command(&line, 0) {
            Ok(cmd) if cmd.kind == CommandKind::Login => cmd,
            Ok(cmd) => {
                warn!(peer = %self.peer, command = %cmd, "Expected LOGIN");
                return ConnState::Closed { key: None };
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Invalid LOGIN");
                return ConnState::Closed { key: None };
            }
        };

        match self.stream.try_clone() {
            Ok(write_half) => cmd.sink = Some(Box::new(write_half)),
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "Failed to clone connection");
                return ConnState::Closed { key: None };
            }
        }

        // Run inline: the client must be registered and acknowledged before
        // any of its later commands can reach a worker. Success leaves the
        // new registration in `origin`.
        if let Err(e) = process_command(&mut cmd, &self.ctx) {
            debug!(peer = %self.peer, error = %e, "LOGIN refused");
        }
        let origin = cmd.origin.take();
        let answer = std::mem::take(&mut cmd.answer);

        if let Err(e) = write_answer(answer, &mut self.stream, BABBLE_TIMELINE_MAX) {
            warn!(peer = %self.peer, key = cmd.key, error = %e, "Failed to acknowledge LOGIN");
            return ConnState::Closed {
                key: origin.map(|bundle| bundle.key),
            };
        }

        let Some(origin) = origin else {
            return ConnState::Closed { key: None };
        };
        info!(peer = %self.peer, id = %origin.id, key = origin.key, "Client logged in");
        ConnState::Active { origin }
    }

    /// Queue every further command of a logged-in client.
    fn forward(
        &mut self,
        reader: &mut BufReader<TcpStream>,
        origin: Arc<ClientBundle>,
    ) -> ConnState {
        let (key, id) = (origin.key, origin.id.as_str());
        loop {
            let line = match read_line(reader) {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!(id, key, "Connection closed by client");
                    break;
                }
                Err(e) => {
                    debug!(id, key, error = %e, "Connection error");
                    break;
                }
            };

            match parse_command(&line, key) {
                Ok(cmd) if cmd.kind == CommandKind::Login => {
                    self.reject(&origin, &ParseError::AlreadyLoggedIn);
                }
                Ok(mut cmd) => {
                    cmd.origin = Some(Arc::clone(&origin));
                    cmd.ticket = Some(self.sequencer.issue());
                    self.queue.put(cmd);
                }
                Err(e) => self.reject(&origin, &e),
            }
        }

        ConnState::Closed { key: Some(key) }
    }

    /// Report a bad line after the answers to every earlier command.
    fn reject(&self, origin: &ClientBundle, err: &ParseError) {
        let (id, key) = (origin.id.as_str(), origin.key);
        warn!(id, key, error = %err, "Unable to parse message from client");

        // Holding the turn keeps later commands from answering first.
        let _turn = self.sequencer.issue().wait_turn();
        if let Err(e) = notify_client_parse_error(origin, err) {
            warn!(id, key, error = %e, "Failed to notify parse error");
        }
    }

    /// Unregister the client, if it ever logged in.
    fn close(&self, key: Option<u64>) {
        if let Some(key) = key {
            let mut cmd = Command::new(CommandKind::Unregister, key);
            if process_command(&mut cmd, &self.ctx).is_err() {
                warn!(key, "Failed to unregister client");
            }
        }
        let stats = self.ctx.storage.stats();
        debug!(
            peer = %self.peer,
            clients = stats.clients,
            publications = stats.publications,
            "Connection handler finished"
        );
    }
}

/// Read one request line; `None` on end of stream.
fn read_line(reader: &mut BufReader<TcpStream>) -> io::Result<Option<String>> {
    let mut buf = Vec::with_capacity(128);
    let limit = MAX_LINE_LENGTH as u64 + 1;
    let n = reader.by_ref().take(limit).read_until(b'\n', &mut buf)?;

    if n == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_LINE_LENGTH && !buf.ends_with(b"\n") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "request line too long",
        ));
    }
    Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::{Duration, Instant};

    fn test_config(max_clients: usize, max_connections: usize) -> Config {
        Config {
            host: std::net::Ipv4Addr::LOCALHOST.into(),
            port: 0,
            workers: 3,
            max_connections,
            queue_capacity: 4,
            max_clients,
            log_level: "info".to_string(),
        }
    }

    fn start(config: Config) -> (SocketAddr, ServerContext) {
        let server = Server::new(config);
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let ctx = server.context().clone();
        thread::spawn(move || server.serve(listener));
        (addr, ctx)
    }

    struct Client {
        stream: TcpStream,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            Client { stream }
        }

        fn send(&mut self, line: &str) {
            self.stream.write_all(format!("{line}\n").as_bytes()).unwrap();
        }

        fn frame(&mut self) -> String {
            let mut out = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                self.stream.read_exact(&mut byte).unwrap();
                if byte[0] == 0 {
                    break;
                }
                out.push(byte[0]);
            }
            String::from_utf8(out).unwrap()
        }

        fn count(&mut self) -> u32 {
            let mut buf = [0u8; 4];
            self.stream.read_exact(&mut buf).unwrap();
            u32::from_be_bytes(buf)
        }

        fn login(addr: SocketAddr, id: &str) -> Self {
            let mut client = Client::connect(addr);
            client.send(&format!("LOGIN {id}"));
            let ack = client.frame();
            assert!(ack.starts_with(&format!("{id} registered")), "{ack}");
            client
        }

        fn is_closed(&mut self) -> bool {
            let mut buf = [0u8; 1];
            matches!(self.stream.read(&mut buf), Ok(0))
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_follow_publish_timeline() {
        let (addr, _) = start(test_config(8, 8));
        let mut alice = Client::login(addr, "alice");
        let mut bob = Client::login(addr, "bob");

        bob.send("FOLLOW alice");
        assert_eq!(bob.frame(), "follow alice");

        alice.send("PUBLISH hi");
        assert!(alice.frame().ends_with("published"));

        bob.send("TIMELINE");
        assert_eq!(bob.count(), 1);
        assert_eq!(bob.frame(), "hi");
    }

    #[test]
    fn test_timeline_last_element_is_latest_publish() {
        let (addr, _) = start(test_config(8, 8));
        let mut alice = Client::login(addr, "alice");
        let mut bob = Client::login(addr, "bob");

        bob.send("FOLLOW alice");
        bob.frame();
        alice.send("S PUBLISH first");
        alice.send("PUBLISH hello");
        alice.frame();

        bob.send("TIMELINE");
        let count = bob.count();
        assert_eq!(count, 2);
        let frames: Vec<String> = (0..count).map(|_| bob.frame()).collect();
        assert_eq!(frames.last().map(String::as_str), Some("hello"));
    }

    #[test]
    fn test_commands_of_one_connection_run_in_order() {
        let (addr, ctx) = start(test_config(8, 8));
        let mut alice = Client::login(addr, "alice");

        for i in 0..30 {
            alice.send(&format!("S PUBLISH m{i}"));
        }
        alice.send("RDV");
        assert_eq!(alice.frame(), "rdv_ack");

        let key = crate::protocol::client_key("alice");
        ctx.storage.follow(key, key).unwrap();
        let texts: Vec<String> = ctx
            .storage
            .timeline(key)
            .unwrap()
            .into_iter()
            .map(|p| p.text)
            .collect();
        let expected: Vec<String> = (0..30).map(|i| format!("m{i}")).collect();
        assert_eq!(texts, expected);
    }

    #[test]
    fn test_concurrent_duplicate_login() {
        let (addr, ctx) = start(test_config(8, 8));

        let attempts: Vec<_> = (0..2)
            .map(|_| {
                thread::spawn(move || {
                    let mut client = Client::connect(addr);
                    client.send("LOGIN carol");
                    let answer = client.frame();
                    (client, answer)
                })
            })
            .collect();
        let results: Vec<(Client, String)> =
            attempts.into_iter().map(|h| h.join().unwrap()).collect();

        let winners = results
            .iter()
            .filter(|(_, answer)| answer.starts_with("carol registered"))
            .count();
        assert_eq!(winners, 1);

        for (mut client, answer) in results {
            if !answer.starts_with("carol registered") {
                assert!(answer.contains("already in use"), "{answer}");
                assert!(client.is_closed());
            }
        }
        assert!(ctx.directory.len() <= 1);
    }

    #[test]
    fn test_directory_full() {
        let (addr, ctx) = start(test_config(1, 8));
        let mut alice = Client::login(addr, "alice");

        let mut bob = Client::connect(addr);
        bob.send("LOGIN bob");
        assert!(bob.frame().contains("directory full"));
        assert!(bob.is_closed());

        assert_eq!(ctx.directory.len(), 1);
        alice.send("RDV");
        assert_eq!(alice.frame(), "rdv_ack");
    }

    #[test]
    fn test_first_command_must_be_login() {
        let (addr, ctx) = start(test_config(8, 8));
        let mut client = Client::connect(addr);
        client.send("PUBLISH sneaky");
        assert!(client.is_closed());
        assert!(ctx.directory.is_empty());
    }

    #[test]
    fn test_parse_error_keeps_connection() {
        let (addr, _) = start(test_config(8, 8));
        let mut alice = Client::login(addr, "alice");

        alice.send("SHOUT loudly");
        assert_eq!(alice.frame(), "error: unknown command: SHOUT");
        alice.send("LOGIN again");
        assert_eq!(alice.frame(), "error: already logged in");

        alice.send("FCOUNT");
        assert_eq!(alice.frame(), "alice has 0 followers");
    }

    #[test]
    fn test_parse_error_answered_after_queued_commands() {
        let mut config = test_config(8, 8);
        config.workers = 1;
        let (addr, _) = start(config);
        let mut alice = Client::login(addr, "alice");
        let mut bob = Client::login(addr, "bob");
        bob.send("FOLLOW alice");
        assert_eq!(bob.frame(), "follow alice");

        // One write, so the bad line is read while the rest is still queued.
        let mut burst = String::new();
        for i in 0..40 {
            burst.push_str(&format!("S PUBLISH m{i}\n"));
        }
        burst.push_str("RDV\nBOGUS\nFCOUNT\n");
        alice.stream.write_all(burst.as_bytes()).unwrap();

        assert_eq!(alice.frame(), "rdv_ack");
        assert_eq!(alice.frame(), "error: unknown command: BOGUS");
        assert_eq!(alice.frame(), "alice has 1 followers");

        bob.send("TIMELINE\nBOGUS");
        assert_eq!(bob.count(), 40);
        for _ in 0..crate::protocol::BABBLE_TIMELINE_MAX {
            bob.frame();
        }
        assert_eq!(bob.frame(), "error: unknown command: BOGUS");
    }

    #[test]
    fn test_disconnect_unregisters() {
        let (addr, ctx) = start(test_config(8, 8));
        let alice = Client::login(addr, "alice");
        assert_eq!(ctx.directory.len(), 1);

        drop(alice);
        wait_for(|| ctx.directory.is_empty());

        // Same identifier may log in again once the old session is gone.
        let mut alice = Client::login(addr, "alice");
        alice.send("RDV");
        assert_eq!(alice.frame(), "rdv_ack");
    }

    #[test]
    fn test_connection_limit() {
        let (addr, _) = start(test_config(8, 1));
        let first = Client::login(addr, "alice");

        let mut second = Client::connect(addr);
        second.send("LOGIN bob");
        second
            .stream
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert!(second.stream.read(&mut buf).is_err());

        drop(first);
        second
            .stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        assert!(second.frame().starts_with("bob registered"));
    }

    #[test]
    fn test_read_line_limits() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"RDV\n").unwrap();
            stream.write_all(&vec![b'x'; MAX_LINE_LENGTH + 10]).unwrap();
        });

        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream);
        assert_eq!(read_line(&mut reader).unwrap().as_deref(), Some("RDV\n"));
        writer.join().unwrap();
        assert!(read_line(&mut reader).is_err());
    }
}
