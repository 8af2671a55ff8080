use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream};
use std::thread;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};

use crate::socket::tcp::{spawn_writer, write_frame, FrameReader};
use crate::socket::{CompositeSocketAddress, Hello, SocketConfig, SocketEvent, SocketEventType};
use crate::{CancelToken, Error, Result};

/// Notification from the client's connection.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Receive(Vec<u8>),
    /// Connection is gone, no more events follow
    Disconnect,
}

/// Single outgoing connection to a `Server`.
///
/// `connect` returns once the server answered the `Hello` frame with
/// `Welcome`, at which point the server has already announced the
/// connection. There is no automatic reconnection: once the `Disconnect`
/// event arrives the client is done.
pub struct Client {
    addr: CompositeSocketAddress,
    sender: ClientSender,
    events: Receiver<ClientEvent>,
    token: CancelToken,
    closed: bool,
}

/// Clonable handle for sending over a client connection from other
/// threads.
#[derive(Clone)]
pub struct ClientSender {
    queue: Sender<SocketEvent>,
    config: SocketConfig,
}

impl ClientSender {
    /// Queues `bytes` for sending, blocking up to the send timeout if the
    /// queue is full.
    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.send_event(SocketEvent::new_bytes(bytes))
    }

    /// Queues `bytes` for sending, failing right away if the queue is full.
    pub fn try_send(&self, bytes: Vec<u8>) -> Result<()> {
        self.queue
            .try_send(SocketEvent::new_bytes(bytes))
            .map_err(|e| match e {
                TrySendError::Full(_) => Error::SendQueueFull,
                TrySendError::Disconnected(_) => Error::SocketNotConnected,
            })
    }

    fn send_event(&self, event: SocketEvent) -> Result<()> {
        self.queue
            .send_timeout(event, self.config.send_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => Error::SendQueueFull,
                SendTimeoutError::Disconnected(_) => Error::SocketNotConnected,
            })
    }
}

impl Client {
    /// Connects to the server at `addr`, introducing itself as `name` of
    /// type `peer_type`.
    pub fn connect(
        addr: &str,
        peer_type: &str,
        name: &str,
        config: SocketConfig,
        token: &CancelToken,
    ) -> Result<Self> {
        let address: CompositeSocketAddress = addr.parse()?;
        let mut stream = TcpStream::connect_timeout(&address.resolve()?, config.connect_timeout)
            .map_err(|e| match e.kind() {
                ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::TimedOut,
                ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => Error::HostUnreachable,
                _ => Error::IoError(e),
            })?;
        stream.set_nodelay(true)?;

        let hello = Hello {
            peer_type: peer_type.to_string(),
            name: name.to_string(),
        };
        write_frame(
            &mut stream,
            &SocketEvent {
                type_: SocketEventType::Hello,
                bytes: bincode::serialize(&hello)?,
            },
        )?;
        let mut reader = FrameReader::new(stream.try_clone()?, config.poll_interval)?;
        if let Err(e) =
            reader.read_handshake(SocketEventType::Welcome, config.handshake_timeout, token)
        {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(e);
        }
        debug!("connected to {} as {} {}", address, peer_type, name);

        let token = token.child();
        let (queue, outbound) = crossbeam_channel::bounded(config.send_queue_capacity);
        spawn_writer(stream.try_clone()?, outbound, config, token.clone())?;

        let (event_sender, events) = crossbeam_channel::unbounded();
        let _token = token.clone();
        thread::Builder::new()
            .name("client-reader".to_string())
            .spawn(move || {
                let result = reader.read_loop(&config, &_token, |bytes| {
                    event_sender.send(ClientEvent::Receive(bytes)).is_ok()
                });
                match result {
                    Ok(()) | Err(Error::Cancelled) => debug!("connection closed"),
                    Err(e) => debug!("connection lost: {}", e),
                }
                let _ = stream.shutdown(Shutdown::Both);
                // stop the writer as well
                _token.cancel();
                let _ = event_sender.send(ClientEvent::Disconnect);
            })?;

        Ok(Self {
            addr: address,
            sender: ClientSender { queue, config },
            events,
            token,
            closed: false,
        })
    }

    pub fn address(&self) -> &CompositeSocketAddress {
        &self.addr
    }

    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        self.sender.send(bytes)
    }

    /// Returns a handle for sending from other threads.
    pub fn sender(&self) -> ClientSender {
        self.sender.clone()
    }

    pub fn events(&self) -> &Receiver<ClientEvent> {
        &self.events
    }

    /// Says goodbye to the server. Frames queued before are still written.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self
            .sender
            .send_event(SocketEvent::new(SocketEventType::Disconnect))
            .is_err()
        {
            self.token.cancel();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
use crate::server::{Server, ServerEvent};
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
fn next_server_event(server: &Server) -> ServerEvent {
    server
        .events()
        .recv_timeout(Duration::from_secs(5))
        .expect("no server event")
}

#[test]
fn one_send_one_receive_in_order() {
    let token = CancelToken::new();
    let server = Server::listen("tcp://127.0.0.1:0", SocketConfig::default(), &token).unwrap();
    let mut client = Client::connect(
        &server.address(),
        "Producer",
        "p1",
        SocketConfig::default(),
        &token,
    )
    .unwrap();

    let id = match next_server_event(&server) {
        ServerEvent::Connect(info) => {
            assert_eq!(info.name, "p1");
            assert_eq!(info.peer_type, "Producer");
            info.id
        }
        other => panic!("expected connect, got {:?}", other),
    };
    assert_eq!(server.connections().len(), 1);

    for n in 0..200u32 {
        client.send(n.to_le_bytes().to_vec()).unwrap();
    }
    for n in 0..200u32 {
        match next_server_event(&server) {
            ServerEvent::Receive(from, bytes) => {
                assert_eq!(from, id);
                assert_eq!(bytes, n.to_le_bytes().to_vec());
            }
            other => panic!("expected receive, got {:?}", other),
        }
    }

    server.send_to(id, b"STATUS".to_vec()).unwrap();
    server.broadcast(b"STOP".to_vec()).unwrap();
    let mut received = Vec::new();
    while received.len() < 2 {
        match client.events().recv_timeout(Duration::from_secs(5)).unwrap() {
            ClientEvent::Receive(bytes) => received.push(bytes),
            ClientEvent::Disconnect => panic!("unexpected disconnect"),
        }
    }
    assert_eq!(received, vec![b"STATUS".to_vec(), b"STOP".to_vec()]);

    client.close();
    match next_server_event(&server) {
        ServerEvent::Disconnect(info) => assert_eq!(info.id, id),
        other => panic!("expected disconnect, got {:?}", other),
    }
    assert!(server.connections().is_empty());
    token.cancel();
}

#[test]
fn server_shutdown_disconnects_client() {
    let token = CancelToken::new();
    let server = Server::listen("127.0.0.1:0", SocketConfig::default(), &token).unwrap();
    let client = Client::connect(&server.address(), "Monitor", "m", SocketConfig::default(), &token)
        .unwrap();
    assert!(matches!(next_server_event(&server), ServerEvent::Connect(_)));

    server.shutdown();
    loop {
        match client.events().recv_timeout(Duration::from_secs(5)).unwrap() {
            ClientEvent::Disconnect => break,
            ClientEvent::Receive(_) => (),
        }
    }
}

#[test]
fn missing_hello_is_dropped() {
    let mut config = SocketConfig::default();
    config.handshake_timeout = Duration::from_millis(100);
    let token = CancelToken::new();
    let server = Server::listen("tcp://127.0.0.1:0", config, &token).unwrap();

    let raw = TcpStream::connect(server.local_addr()).unwrap();
    let mut reader = FrameReader::new(raw, Duration::from_millis(50)).unwrap();
    let mut closed = false;
    for _ in 0..100 {
        match reader.read_frame() {
            Err(_) => {
                closed = true;
                break;
            }
            Ok(_) => (),
        }
    }
    assert!(closed);
    assert!(server
        .events()
        .recv_timeout(Duration::from_millis(100))
        .is_err());
    token.cancel();
}

#[test]
fn connect_returns_after_the_server_announced_it() {
    let token = CancelToken::new();
    let server = Server::listen("tcp://127.0.0.1:0", SocketConfig::default(), &token).unwrap();
    for n in 0..20 {
        let client = Client::connect(
            &server.address(),
            "Producer",
            &format!("p{}", n),
            SocketConfig::default(),
            &token,
        )
        .unwrap();
        match server.events().try_recv() {
            Ok(ServerEvent::Connect(info)) => assert_eq!(info.name, format!("p{}", n)),
            other => panic!("connect not announced yet: {:?}", other),
        }
        drop(client);
        assert!(matches!(next_server_event(&server), ServerEvent::Disconnect(_)));
    }
    token.cancel();
}

#[test]
fn unanswered_hello_fails_the_connect() {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    // accepts and reads, but never welcomes
    let silent = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = FrameReader::new(stream, Duration::from_millis(20)).unwrap();
        let started = std::time::Instant::now();
        while started.elapsed() < Duration::from_secs(1) {
            if reader.read_frame().is_err() {
                break;
            }
        }
    });

    let mut config = SocketConfig::default();
    config.handshake_timeout = Duration::from_millis(200);
    let token = CancelToken::new();
    let result = Client::connect(&format!("tcp://{}", addr), "Producer", "p", config, &token);
    assert!(matches!(result, Err(Error::HandshakeFailed(_))));
    silent.join().unwrap();
}

#[test]
fn full_send_queue_fails_after_the_timeout() {
    use std::net::TcpListener;
    use std::time::Instant;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (done, wait_done) = crossbeam_channel::bounded::<()>(0);
    // completes the handshake, then stops reading
    let stalled = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reader =
            FrameReader::new(stream.try_clone().unwrap(), Duration::from_millis(20)).unwrap();
        reader
            .read_handshake(SocketEventType::Hello, Duration::from_secs(5), &CancelToken::new())
            .unwrap();
        write_frame(&mut stream, &SocketEvent::new(SocketEventType::Welcome)).unwrap();
        let _ = wait_done.recv();
    });

    let mut config = SocketConfig::default();
    config.send_queue_capacity = 2;
    config.send_timeout = Duration::from_millis(200);
    let token = CancelToken::new();
    let client = Client::connect(&format!("tcp://{}", addr), "Producer", "p", config, &token).unwrap();
    let chunk = vec![0u8; 1 << 20];
    let mut outcome = None;
    for _ in 0..256 {
        let started = Instant::now();
        if let Err(e) = client.send(chunk.clone()) {
            outcome = Some((e, started.elapsed()));
            break;
        }
    }
    match outcome {
        Some((Error::SendQueueFull, waited)) => assert!(waited >= Duration::from_millis(200)),
        other => panic!("expected a full queue, got {:?}", other),
    }

    drop(done);
    stalled.join().unwrap();
    token.cancel();
}

#[test]
fn refused_connect_fails_synchronously() {
    let token = CancelToken::new();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let result = Client::connect(
        &format!("tcp://127.0.0.1:{}", port),
        "Producer",
        "p",
        SocketConfig::default(),
        &token,
    );
    assert!(result.is_err());
}
