//! Tokio implementation of the reactor.
//!
//! Every socket gets a read task and a write task. Both report back to the
//! engine through one unbounded channel of `(ConnId, IoEvent)`; the engine's
//! write and close requests reach the write task through a per-socket
//! command channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::reactor::{ConnId, IoEvent, Reactor};

/// Bytes requested per socket read
const READ_CHUNK: usize = 64 * 1024;

/// Socket notifications as they leave the socket tasks
pub type IoSender = mpsc::UnboundedSender<(ConnId, IoEvent)>;
/// Receiving end drained by the driver
pub type IoReceiver = mpsc::UnboundedReceiver<(ConnId, IoEvent)>;

#[derive(Debug)]
enum SocketCmd {
    Write(Bytes),
    Close,
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Reactor backed by tokio tasks. Must be used inside a tokio runtime.
#[derive(Debug)]
pub struct TokioReactor {
    sockets: HashMap<ConnId, mpsc::UnboundedSender<SocketCmd>>,
    events: IoSender,
}

impl TokioReactor {
    /// Reactor and the receiver its socket tasks report to
    pub fn new() -> (Self, IoReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                sockets: HashMap::new(),
                events,
            },
            rx,
        )
    }

    /// Start serving an accepted stream under `id`
    pub fn adopt(&mut self, id: ConnId, stream: TcpStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.insert(id, tx);
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("{} set_nodelay failed: {}", id, e);
            }
            run_socket(id, stream, rx, events).await;
        });
    }

    /// Sockets with a live command channel
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    /// Whether no socket is live
    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    fn report(&self, id: ConnId, event: IoEvent) {
        let _ = self.events.send((id, event));
    }
}

impl Reactor for TokioReactor {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn connect(&mut self, id: ConnId, addr: SocketAddr) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.insert(id, tx);
        let events = self.events.clone();
        tokio::spawn(connect_socket(id, addr, rx, events));
    }

    fn write(&mut self, id: ConnId, bytes: Bytes) {
        let sent = self
            .sockets
            .get(&id)
            .is_some_and(|tx| tx.send(SocketCmd::Write(bytes)).is_ok());
        if !sent {
            self.report(id, IoEvent::Error("socket is gone".to_string()));
        }
    }

    fn close(&mut self, id: ConnId) {
        match self.sockets.remove(&id) {
            Some(tx) => {
                if tx.send(SocketCmd::Close).is_err() {
                    self.report(id, IoEvent::Closed);
                }
            }
            None => self.report(id, IoEvent::Closed),
        }
    }
}

async fn connect_socket(
    id: ConnId,
    addr: SocketAddr,
    mut cmds: mpsc::UnboundedReceiver<SocketCmd>,
    events: IoSender,
) {
    trace!("{} connecting to {}", id, addr);
    let stream = tokio::select! {
        res = TcpStream::connect(addr) => res,
        _ = cmds.recv() => {
            // Closed before the connect finished
            let _ = events.send((id, IoEvent::Closed));
            return;
        }
    };
    match stream {
        Ok(stream) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("{} set_nodelay failed: {}", id, e);
            }
            let _ = events.send((id, IoEvent::Connected));
            run_socket(id, stream, cmds, events).await;
        }
        Err(e) => {
            let _ = events.send((id, IoEvent::ConnectFailed(e.to_string())));
            // Wait for the engine's close so no command is left dangling
            let _ = cmds.recv().await;
            let _ = events.send((id, IoEvent::Closed));
        }
    }
}

async fn run_socket(
    id: ConnId,
    stream: TcpStream,
    mut cmds: mpsc::UnboundedReceiver<SocketCmd>,
    events: IoSender,
) {
    let (rd, mut wr) = stream.into_split();
    let reader = tokio::spawn(read_loop(id, rd, events.clone()));

    while let Some(cmd) = cmds.recv().await {
        match cmd {
            SocketCmd::Write(bytes) => {
                let event = match write_some(&mut wr, &bytes).await {
                    Ok(n) => IoEvent::Written(n),
                    Err(e) => IoEvent::Error(e.to_string()),
                };
                let _ = events.send((id, event));
            }
            SocketCmd::Close => break,
        }
    }

    let _ = wr.shutdown().await;
    reader.abort();
    debug!("{} socket closed", id);
    let _ = events.send((id, IoEvent::Closed));
}

async fn write_some(wr: &mut OwnedWriteHalf, bytes: &[u8]) -> std::io::Result<usize> {
    let n = wr.write(bytes).await?;
    if n == 0 && !bytes.is_empty() {
        return Err(std::io::ErrorKind::WriteZero.into());
    }
    Ok(n)
}

async fn read_loop(id: ConnId, mut rd: OwnedReadHalf, events: IoSender) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) => {
                let _ = events.send((id, IoEvent::Eof));
                return;
            }
            Ok(n) => {
                trace!("{} read {} bytes", id, n);
                let _ = events.send((id, IoEvent::Data(Bytes::copy_from_slice(&buf[..n]))));
            }
            Err(e) => {
                let _ = events.send((id, IoEvent::Error(e.to_string())));
                return;
            }
        }
    }
}
