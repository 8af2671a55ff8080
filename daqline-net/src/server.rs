use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use fnv::FnvHashMap;
use id_pool::IdPool;

use crate::socket::tcp::{spawn_writer, FrameReader};
use crate::socket::{
    CompositeSocketAddress, ConnectionId, ConnectionInfo, ConnectionState, Hello, SocketConfig,
    SocketEvent, SocketEventType, Transport,
};
use crate::util::lock;
use crate::{CancelToken, Error, Result};

/// Notification about something that happened on one of the server's
/// connections.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connect(ConnectionInfo),
    Disconnect(ConnectionInfo),
    Receive(ConnectionId, Vec<u8>),
}

/// Connected peer as seen by the server.
struct Peer {
    info: ConnectionInfo,
    /// Outbound frame queue, drained by the connection's writer thread
    queue: Sender<SocketEvent>,
}

struct Registry {
    peers: Mutex<FnvHashMap<ConnectionId, Peer>>,
    ids: Mutex<IdPool>,
}

/// Listens for connections and keeps a registry of the live ones.
///
/// # Threads
///
/// A server runs one accept thread, plus a reader and a writer thread for
/// each connection. Everything that happens is reported as a
/// [`ServerEvent`] on the channel returned by `events`. Events belonging to
/// one connection are sent from its reader thread, so their order is the
/// order of the wire.
///
/// A connection is only reported after it introduced itself with a valid
/// `Hello` frame within the handshake timeout. The `Welcome` answer is
/// queued after the `Connect` event is sent, so a client that finished
/// connecting is already known to whoever drains the events.
///
/// [`ServerEvent`]: enum.ServerEvent.html
pub struct Server {
    config: SocketConfig,
    local_addr: SocketAddr,
    registry: Arc<Registry>,
    events: Receiver<ServerEvent>,
    token: CancelToken,
}

impl Server {
    /// Binds a listener at `addr` and starts accepting connections.
    pub fn listen(addr: &str, config: SocketConfig, token: &CancelToken) -> Result<Self> {
        let address: CompositeSocketAddress = addr.parse()?;
        let listener = TcpListener::bind(address.resolve()?)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}://{}", address.transport, local_addr);

        let token = token.child();
        let registry = Arc::new(Registry {
            peers: Mutex::new(FnvHashMap::default()),
            ids: Mutex::new(IdPool::new()),
        });
        let (event_sender, events) = crossbeam_channel::unbounded();

        let _registry = registry.clone();
        let _token = token.clone();
        thread::Builder::new()
            .name("server-accept".to_string())
            .spawn(move || accept_loop(listener, _registry, event_sender, config, _token))?;

        Ok(Self {
            config,
            local_addr,
            registry,
            events,
            token,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address peers can reach this server at. An unspecified listen address
    /// is advertised as loopback.
    pub fn address(&self) -> String {
        let mut addr = self.local_addr;
        if addr.ip().is_unspecified() {
            addr.set_ip(match addr {
                SocketAddr::V4(_) => [127, 0, 0, 1].into(),
                SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
            });
        }
        format!("{}://{}", Transport::Tcp, addr)
    }

    pub fn events(&self) -> &Receiver<ServerEvent> {
        &self.events
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        lock(&self.registry.peers)
            .values()
            .map(|p| p.info.clone())
            .collect()
    }

    pub fn send_to(&self, id: ConnectionId, bytes: Vec<u8>) -> Result<()> {
        let queue = lock(&self.registry.peers)
            .get(&id)
            .map(|p| p.queue.clone())
            .ok_or(Error::SocketNotConnected)?;
        self.enqueue(&queue, SocketEvent::new_bytes(bytes))
    }

    /// Sends `bytes` to every live connection. All connections are tried,
    /// the first failure is returned.
    pub fn broadcast(&self, bytes: Vec<u8>) -> Result<()> {
        let queues: Vec<(ConnectionId, Sender<SocketEvent>)> = lock(&self.registry.peers)
            .iter()
            .map(|(id, p)| (*id, p.queue.clone()))
            .collect();
        let mut result = Ok(());
        for (id, queue) in queues {
            if let Err(e) = self.enqueue(&queue, SocketEvent::new_bytes(bytes.clone())) {
                warn!("broadcast to connection {} failed: {}", id, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Gracefully closes a connection.
    pub fn disconnect(&self, id: ConnectionId) -> Result<()> {
        let queue = lock(&self.registry.peers)
            .get(&id)
            .map(|p| p.queue.clone())
            .ok_or(Error::SocketNotConnected)?;
        self.enqueue(&queue, SocketEvent::new(SocketEventType::Disconnect))
    }

    /// Stops accepting and drops all connections.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    fn enqueue(&self, queue: &Sender<SocketEvent>, event: SocketEvent) -> Result<()> {
        queue
            .send_timeout(event, self.config.send_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => Error::SendQueueFull,
                SendTimeoutError::Disconnected(_) => Error::SocketNotConnected,
            })
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    events: Sender<ServerEvent>,
    config: SocketConfig,
    token: CancelToken,
) {
    while !token.is_cancelled() {
        match listener.accept() {
            Ok((stream, peer)) => {
                trace!("accepted stream from {}", peer);
                let registry = registry.clone();
                let events = events.clone();
                let token = token.clone();
                let spawned = thread::Builder::new()
                    .name("server-conn".to_string())
                    .spawn(move || {
                        if let Err(e) = serve_connection(stream, peer, &registry, &events, config, &token) {
                            match e {
                                Error::Cancelled => (),
                                Error::HandshakeFailed(_) => warn!("dropping {}: {}", peer, e),
                                _ => debug!("connection from {} failed: {}", peer, e),
                            }
                        }
                    });
                if let Err(e) = spawned {
                    error!("failed spawning connection thread: {}", e);
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                token.sleep(config.poll_interval);
            }
            Err(e) => {
                error!("accept failed: {}", e);
                token.sleep(config.poll_interval);
            }
        }
    }
    debug!("accept loop finished");
}

/// Runs on the connection's reader thread, from handshake to disconnect.
fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Registry,
    events: &Sender<ServerEvent>,
    config: SocketConfig,
    token: &CancelToken,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let mut reader = FrameReader::new(stream.try_clone()?, config.poll_interval)?;
    let hello = reader.read_handshake(SocketEventType::Hello, config.handshake_timeout, token)?;
    let hello: Hello = bincode::deserialize(&hello.bytes)
        .map_err(|e| Error::HandshakeFailed(e.to_string()))?;

    let id = lock(&registry.ids)
        .request_id()
        .ok_or_else(|| Error::Other("connection ids exhausted".to_string()))?;
    let mut info = ConnectionInfo {
        id,
        transport: Transport::Tcp,
        name: hello.name,
        peer_type: hello.peer_type,
        addr: peer.to_string(),
        state: ConnectionState::Connected,
    };

    let (queue, outbound) = crossbeam_channel::bounded(config.send_queue_capacity);
    let writer = spawn_writer(stream.try_clone()?, outbound, config, token.clone())?;
    let welcome = queue.clone();
    lock(&registry.peers).insert(
        id,
        Peer {
            info: info.clone(),
            queue,
        },
    );
    debug!(
        "connection {}: {} {} from {}",
        id, info.peer_type, info.name, info.addr
    );
    let _ = events.send(ServerEvent::Connect(info.clone()));
    // must follow the Connect event, clients wait for it in connect
    let ack = SocketEvent::new(SocketEventType::Welcome);
    if let Err(e) = welcome.send_timeout(ack, config.send_timeout) {
        debug!("failed queueing welcome for connection {}: {}", id, e);
    }
    drop(welcome);

    let result = reader.read_loop(&config, token, |bytes| {
        events.send(ServerEvent::Receive(id, bytes)).is_ok()
    });
    info.state = match &result {
        Ok(()) | Err(Error::Cancelled) => ConnectionState::Disconnected,
        Err(e) => {
            debug!("connection {} lost: {}", id, e);
            ConnectionState::Error
        }
    };

    // dropping the queue lets the writer finish
    lock(&registry.peers).remove(&id);
    let _ = stream.shutdown(Shutdown::Both);
    let _ = writer.join();
    debug!("connection {} closed", id);
    // reported before the id can be handed out again
    let _ = events.send(ServerEvent::Disconnect(info));
    if lock(&registry.ids).return_id(id).is_err() {
        warn!("connection id {} returned twice", id);
    }
    Ok(())
}
