// TCP transport adapter.
//
// Architecture: thread-per-reader with a central `mpsc` channel, drained by
// `poll()` on the thread that owns the endpoint.
//
// - **Listener thread** (hosting endpoints only): non-blocking `accept()`
//   loop that checks `keep_running` every 50 ms. Each accepted stream gets a
//   short-lived handshake thread that reads the `Hello` frame (bounded by a
//   read timeout) and hands the stream to the owner.
// - **Dial threads**: `connect()` resolves the remote id and dials on a
//   helper thread with a connect timeout, so the owner never blocks.
// - **Reader threads** (one per connection): `read_frame()` in a loop,
//   forwarding frames as internal events. EOF or a read error ends the loop
//   with a `Lost` event.
// - **Owner thread**: the only writer to every stream. It turns internal
//   events into `TransportEvent`s inside `poll()`.
//
// Every registered connection gets a generation number. Reader events carry
// the generation they were spawned for, and `poll()` drops events whose
// generation is not the live one. That is how `close()` honors the "no
// events after close" contract even though the reader thread may still have
// frames in flight.
//
// Remote ids resolve through the transport's address book, or parse
// directly as a socket address (`"127.0.0.1:7878"`).

use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufReader, BufWriter};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use rally_protocol::{
    Codec, ConnectionId, FrameKind, HelloFrame, JsonCodec, Payload, read_frame, write_frame,
};

use crate::error::TransportError;
use crate::transport::{ConnectMeta, Endpoint, EndpointKind, Transport, TransportEvent};

/// How long an accepted stream may take to send its `Hello`.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Events sent from listener/dial/reader threads to the owner.
enum Internal {
    Accepted {
        stream: TcpStream,
        /// The reader the hello came through. It may already hold the
        /// frames that followed.
        reader: BufReader<TcpStream>,
        hello: HelloFrame,
    },
    Dialed {
        remote: ConnectionId,
        meta: ConnectMeta,
        result: io::Result<TcpStream>,
    },
    Frame {
        conn: ConnectionId,
        generation: u64,
        kind: FrameKind,
        body: Vec<u8>,
    },
    Lost {
        conn: ConnectionId,
        generation: u64,
        reason: String,
    },
}

/// Opens TCP endpoints.
#[derive(Clone, Debug)]
pub struct TcpTransport {
    bind_ip: IpAddr,
    host_port: u16,
    connect_timeout: Duration,
    peers: BTreeMap<ConnectionId, SocketAddr>,
}

impl TcpTransport {
    /// Hosting endpoints listen on `127.0.0.1:host_port` (0 lets the OS
    /// pick).
    pub fn new(host_port: u16) -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            host_port,
            connect_timeout: Duration::from_secs(5),
            peers: BTreeMap::new(),
        }
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    /// Teach the transport where a remote id (usually a room id) lives.
    pub fn add_peer(&mut self, id: ConnectionId, addr: SocketAddr) {
        self.peers.insert(id, addr);
    }
}

impl Transport for TcpTransport {
    type Endpoint = TcpEndpoint;

    fn open(
        &mut self,
        local_id: &ConnectionId,
        kind: EndpointKind,
    ) -> Result<TcpEndpoint, TransportError> {
        let (tx, rx) = mpsc::channel();
        let keep_running = Arc::new(AtomicBool::new(true));

        let local_addr = match kind {
            EndpointKind::Joining => None,
            EndpointKind::Hosting => {
                let listener = TcpListener::bind((self.bind_ip, self.host_port)).map_err(|e| {
                    TransportError::Open {
                        id: local_id.0.clone(),
                        reason: e.to_string(),
                    }
                })?;
                let addr = listener.local_addr()?;
                // Non-blocking so the accept loop can notice shutdown.
                listener.set_nonblocking(true)?;
                let tx_listener = tx.clone();
                let keep_running_listener = keep_running.clone();
                thread::spawn(move || accept_loop(listener, tx_listener, keep_running_listener));
                info!("endpoint {local_id} listening on {addr}");
                Some(addr)
            }
        };

        Ok(TcpEndpoint {
            local_id: local_id.clone(),
            local_addr,
            peers: self.peers.clone(),
            connect_timeout: self.connect_timeout,
            tx,
            rx,
            conns: HashMap::new(),
            next_generation: 0,
            keep_running,
        })
    }
}

struct Conn {
    writer: BufWriter<TcpStream>,
    generation: u64,
}

/// One open TCP endpoint.
pub struct TcpEndpoint {
    local_id: ConnectionId,
    local_addr: Option<SocketAddr>,
    peers: BTreeMap<ConnectionId, SocketAddr>,
    connect_timeout: Duration,
    tx: Sender<Internal>,
    rx: Receiver<Internal>,
    conns: HashMap<ConnectionId, Conn>,
    next_generation: u64,
    keep_running: Arc<AtomicBool>,
}

impl TcpEndpoint {
    /// The listening address of a hosting endpoint.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn resolve(&self, remote: &ConnectionId) -> Option<SocketAddr> {
        self.peers
            .get(remote)
            .copied()
            .or_else(|| remote.0.parse().ok())
    }

    /// Start tracking `stream` as connection `conn` and spawn a reader
    /// thread over `reader`.
    fn register(
        &mut self,
        conn: ConnectionId,
        stream: TcpStream,
        reader: BufReader<TcpStream>,
    ) -> io::Result<()> {
        stream.set_read_timeout(None)?;
        let generation = self.next_generation;
        self.next_generation += 1;

        if let Some(old) = self.conns.remove(&conn) {
            debug!("{conn} reconnected; dropping previous stream");
            let _ = old.writer.get_ref().shutdown(Shutdown::Both);
        }

        let tx = self.tx.clone();
        let reader_conn = conn.clone();
        let keep_running = self.keep_running.clone();
        thread::spawn(move || reader_loop(reader, reader_conn, generation, tx, keep_running));

        self.conns.insert(
            conn,
            Conn {
                writer: BufWriter::new(stream),
                generation,
            },
        );
        Ok(())
    }

    fn is_live(&self, conn: &ConnectionId, generation: u64) -> bool {
        self.conns
            .get(conn)
            .is_some_and(|c| c.generation == generation)
    }

    fn translate(&mut self, event: Internal) -> Option<TransportEvent> {
        match event {
            Internal::Accepted {
                stream,
                reader,
                hello,
            } => {
                let conn = hello.peer_id;
                match self.register(conn.clone(), stream, reader) {
                    Ok(()) => Some(TransportEvent::Opened {
                        conn,
                        persistent_id: hello.persistent_id,
                    }),
                    Err(e) => {
                        warn!("could not register {conn}: {e}");
                        None
                    }
                }
            }
            Internal::Dialed {
                remote,
                meta,
                result,
            } => {
                let opened = result.and_then(|stream| {
                    let hello = HelloFrame {
                        peer_id: self.local_id.clone(),
                        persistent_id: meta.persistent_id,
                    };
                    let body = serde_json::to_vec(&hello).map_err(io::Error::other)?;
                    let mut writer = BufWriter::new(stream.try_clone()?);
                    write_frame(&mut writer, FrameKind::Hello, &body)?;
                    let reader = BufReader::new(stream.try_clone()?);
                    self.register(remote.clone(), stream, reader)
                });
                Some(match opened {
                    Ok(()) => TransportEvent::Opened {
                        conn: remote,
                        persistent_id: None,
                    },
                    Err(e) => TransportEvent::Error {
                        conn: Some(remote),
                        reason: e.to_string(),
                    },
                })
            }
            Internal::Frame {
                conn,
                generation,
                kind,
                body,
            } => {
                if !self.is_live(&conn, generation) {
                    return None;
                }
                let payload = match kind {
                    FrameKind::Binary => Payload::Binary(body.into()),
                    // Structured messages travel as JSON. Undecodable ones
                    // are passed on as bytes for the session to reject.
                    FrameKind::Json => match JsonCodec.deserialize(&body) {
                        Ok(msg) => Payload::Structured(Arc::new(msg)),
                        Err(_) => Payload::Binary(body.into()),
                    },
                    FrameKind::Hello => {
                        debug!("ignoring repeated hello from {conn}");
                        return None;
                    }
                };
                Some(TransportEvent::Data { conn, payload })
            }
            Internal::Lost {
                conn,
                generation,
                reason,
            } => {
                if !self.is_live(&conn, generation) {
                    return None;
                }
                debug!("{conn} lost: {reason}");
                self.conns.remove(&conn);
                Some(TransportEvent::Closed { conn })
            }
        }
    }
}

impl Endpoint for TcpEndpoint {
    fn local_id(&self) -> &ConnectionId {
        &self.local_id
    }

    fn connect(&mut self, remote: &ConnectionId, meta: ConnectMeta) -> Result<(), TransportError> {
        let addr = self.resolve(remote).ok_or_else(|| TransportError::Connect {
            id: remote.0.clone(),
            reason: "no known address".into(),
        })?;
        let tx = self.tx.clone();
        let remote = remote.clone();
        let timeout = self.connect_timeout;
        thread::spawn(move || {
            let result = TcpStream::connect_timeout(&addr, timeout);
            let _ = tx.send(Internal::Dialed {
                remote,
                meta,
                result,
            });
        });
        Ok(())
    }

    fn send(&mut self, conn: &ConnectionId, payload: Payload) -> Result<(), TransportError> {
        let entry = self
            .conns
            .get_mut(conn)
            .ok_or_else(|| TransportError::NotConnected(conn.clone()))?;
        match payload {
            Payload::Binary(bytes) => write_frame(&mut entry.writer, FrameKind::Binary, &bytes)?,
            Payload::Structured(msg) => {
                let body = JsonCodec.serialize(&msg).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "message is not serializable")
                })?;
                write_frame(&mut entry.writer, FrameKind::Json, &body)?;
            }
        }
        Ok(())
    }

    fn close(&mut self, conn: &ConnectionId) {
        if let Some(old) = self.conns.remove(conn) {
            let _ = old.writer.get_ref().shutdown(Shutdown::Both);
        }
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        while let Ok(internal) = self.rx.try_recv() {
            if let Some(event) = self.translate(internal) {
                events.push(event);
            }
        }
        events
    }

    fn shutdown(&mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        for (_, conn) in self.conns.drain() {
            let _ = conn.writer.get_ref().shutdown(Shutdown::Both);
        }
    }
}

impl Drop for TcpEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Accept connections until shut down; each gets a handshake thread.
fn accept_loop(listener: TcpListener, tx: Sender<Internal>, keep_running: Arc<AtomicBool>) {
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                let tx = tx.clone();
                thread::spawn(move || {
                    if let Err(e) = handshake(stream, &tx) {
                        debug!("handshake from {addr} failed: {e}");
                    }
                });
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                warn!("accept failed: {e}");
                break;
            }
        }
    }
}

/// Read the `Hello` frame of an accepted stream and hand it to the owner.
fn handshake(stream: TcpStream, tx: &Sender<Internal>) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let (kind, body) = read_frame(&mut reader)?;
    if kind != FrameKind::Hello {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "first frame was not a hello",
        ));
    }
    let hello: HelloFrame = serde_json::from_slice(&body).map_err(io::Error::other)?;
    let _ = tx.send(Internal::Accepted {
        stream,
        reader,
        hello,
    });
    Ok(())
}

/// Reader thread: forward frames until EOF, error, or shutdown.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    conn: ConnectionId,
    generation: u64,
    tx: Sender<Internal>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match read_frame(&mut reader) {
            Ok((kind, body)) => {
                let frame = Internal::Frame {
                    conn: conn.clone(),
                    generation,
                    kind,
                    body,
                };
                if tx.send(frame).is_err() {
                    return; // Endpoint dropped.
                }
            }
            Err(e) => {
                let _ = tx.send(Internal::Lost {
                    conn,
                    generation,
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}
