//! Framing and per-connection threads over `std::net::TcpStream`.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::Receiver;

use super::{SocketConfig, SocketEvent, SocketEventType};
use crate::{CancelToken, Error, Result};

/// Frames larger than this are treated as a protocol violation.
const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Writes a single length-prefixed frame.
pub(crate) fn write_frame<W: Write>(writer: &mut W, event: &SocketEvent) -> Result<()> {
    let bytes = bincode::serialize(event)?;
    let mut len_buf = [0; 4];
    LittleEndian::write_u32(&mut len_buf, bytes.len() as u32);
    writer.write_all(&len_buf)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    trace!("wrote {:?} frame, {} bytes", event.type_, bytes.len());
    Ok(())
}

/// Reassembles frames from a stream with a read timeout set.
pub(crate) struct FrameReader {
    stream: TcpStream,
    buffer: Vec<u8>,
}

impl FrameReader {
    pub fn new(stream: TcpStream, poll_interval: Duration) -> Result<Self> {
        stream.set_read_timeout(Some(poll_interval))?;
        Ok(Self {
            stream,
            buffer: Vec::new(),
        })
    }

    /// Returns the next frame, or `None` if the read timed out before a
    /// complete frame arrived.
    pub fn read_frame(&mut self) -> Result<Option<SocketEvent>> {
        loop {
            if self.buffer.len() >= 4 {
                let len = LittleEndian::read_u32(&self.buffer[..4]) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(Error::Other(format!("frame length {} too large", len)));
                }
                if self.buffer.len() >= len + 4 {
                    let event: SocketEvent = bincode::deserialize(&self.buffer[4..len + 4])?;
                    self.buffer.drain(..len + 4);
                    return Ok(Some(event));
                }
            }
            let mut chunk = [0; 8192];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(Error::HostUnreachable),
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Waits for a handshake frame of type `expected` until `timeout`
    /// passes. Heartbeats are skipped, anything else fails the handshake.
    pub fn read_handshake(
        &mut self,
        expected: SocketEventType,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<SocketEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            if token.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.read_frame()? {
                Some(event) if event.type_ == expected => return Ok(event),
                Some(event) if event.type_ == SocketEventType::Heartbeat => (),
                Some(event) => {
                    return Err(Error::HandshakeFailed(format!(
                        "expected {:?}, got {:?}",
                        expected, event.type_
                    )))
                }
                None if Instant::now() >= deadline => {
                    return Err(Error::HandshakeFailed(format!(
                        "no {:?} received",
                        expected
                    )))
                }
                None => continue,
            }
        }
    }

    /// Reads frames until the peer says goodbye, the connection breaks or
    /// goes silent, or the token is cancelled. Payloads of `Bytes` frames are
    /// handed to `on_bytes`, which returns `false` to stop reading.
    pub fn read_loop<F>(&mut self, config: &SocketConfig, token: &CancelToken, mut on_bytes: F) -> Result<()>
    where
        F: FnMut(Vec<u8>) -> bool,
    {
        let mut last_seen = Instant::now();
        while !token.is_cancelled() {
            match self.read_frame()? {
                Some(event) => {
                    last_seen = Instant::now();
                    match event.type_ {
                        SocketEventType::Bytes => {
                            if !on_bytes(event.bytes) {
                                return Ok(());
                            }
                        }
                        SocketEventType::Heartbeat => (),
                        SocketEventType::Disconnect => return Ok(()),
                        SocketEventType::Hello | SocketEventType::Welcome => {
                            warn!("unexpected {:?} frame, ignoring", event.type_)
                        }
                    }
                }
                None => {
                    if let Some(idle) = config.idle_timeout {
                        if last_seen.elapsed() > idle {
                            return Err(Error::TimedOut);
                        }
                    }
                }
            }
        }
        Err(Error::Cancelled)
    }
}

/// Spawns the writer thread of a connection.
///
/// The thread writes queued frames in order and a heartbeat whenever the
/// queue stays empty for `heartbeat_interval`. It exits after writing a
/// `Disconnect` frame, when every sender is dropped, on a write error or on
/// cancel, shutting the stream down on its way out.
pub(crate) fn spawn_writer(
    mut stream: TcpStream,
    queue: Receiver<SocketEvent>,
    config: SocketConfig,
    token: CancelToken,
) -> Result<JoinHandle<()>> {
    let idle = config
        .heartbeat_interval
        .unwrap_or_else(|| Duration::from_secs(3600));
    let handle = thread::Builder::new()
        .name("socket-writer".to_string())
        .spawn(move || {
            loop {
                crossbeam_channel::select! {
                    recv(queue) -> event => match event {
                        Ok(event) => {
                            let last = event.type_ == SocketEventType::Disconnect;
                            if let Err(e) = write_frame(&mut stream, &event) {
                                debug!("write failed: {}", e);
                                break;
                            }
                            if last {
                                break;
                            }
                        }
                        Err(_) => break,
                    },
                    recv(token.receiver()) -> _ => break,
                    default(idle) => {
                        if config.heartbeat_interval.is_some() {
                            if let Err(e) = write_frame(&mut stream, &SocketEvent::new(SocketEventType::Heartbeat)) {
                                debug!("heartbeat failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            let _ = stream.shutdown(Shutdown::Both);
        })?;
    Ok(handle)
}

#[test]
fn frames_survive_partial_reads() {
    use std::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let writer = thread::spawn(move || {
        let mut stream = TcpStream::connect(addr).unwrap();
        let mut bytes = Vec::new();
        for n in 0..3u8 {
            write_frame(&mut bytes, &SocketEvent::new_bytes(vec![n; 100])).unwrap();
        }
        // dribble the frames out a few bytes at a time
        for chunk in bytes.chunks(7) {
            stream.write_all(chunk).unwrap();
            stream.flush().unwrap();
        }
    });

    let (stream, _) = listener.accept().unwrap();
    let mut reader = FrameReader::new(stream, Duration::from_millis(20)).unwrap();
    let mut frames = Vec::new();
    while frames.len() < 3 {
        if let Some(frame) = reader.read_frame().unwrap() {
            frames.push(frame);
        }
    }
    writer.join().unwrap();
    for (n, frame) in frames.iter().enumerate() {
        assert_eq!(frame.type_, SocketEventType::Bytes);
        assert_eq!(frame.bytes, vec![n as u8; 100]);
    }
}
