//! Thread-owning front end.
//!
//! [`Chirp`] runs the engine on a dedicated thread with a current-thread
//! tokio runtime. Every public call crosses into that thread through a
//! command queue, so the engine state is only ever touched by one thread.

use std::collections::HashMap;
use std::net::SocketAddr;

use chirp_wire::{Identity, Message};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ChirpConfig;
use crate::engine::{Engine, EngineEvent};
use crate::error::ChirpError;
use crate::reactor::Reactor;
use crate::transport::{listen_tcp, TokioReactor};
use crate::writer::{Delivery, SendToken};

/// Receive callback. Runs on the reactor thread and must not block.
pub type MessageHandler = Box<dyn FnMut(SocketAddr, Message) + Send + 'static>;

type Reply = oneshot::Sender<Result<Delivery, ChirpError>>;

enum Command {
    Send {
        addr: SocketAddr,
        message: Message,
        ack_required: bool,
        reply: Reply,
    },
    OnMessage(MessageHandler),
    Close(SocketAddr),
    CloseAll,
    Shutdown(oneshot::Sender<()>),
}

/// A running chirp node
#[derive(Debug)]
pub struct Chirp {
    commands: mpsc::UnboundedSender<Command>,
    local_addr: SocketAddr,
    identity: Identity,
}

impl Chirp {
    /// Validate `config`, bind the listener and start the reactor thread
    pub async fn start(config: ChirpConfig) -> Result<Self, ChirpError> {
        config.validate()?;
        let (commands, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("chirp-reactor".to_string())
            .spawn(move || run_reactor(config, rx, ready_tx))
            .map_err(|e| ChirpError::Value(format!("cannot start reactor thread: {}", e)))?;

        let (local_addr, identity) = ready_rx.await.map_err(|_| {
            ChirpError::Shutdown("reactor thread exited during startup".to_string())
        })??;

        Ok(Self {
            commands,
            local_addr,
            identity,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// This node's identity
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Send `message` to the node listening on `addr` and wait for the outcome
    pub async fn send(
        &self,
        addr: SocketAddr,
        message: Message,
        ack_required: bool,
    ) -> Result<Delivery, ChirpError> {
        let (reply, outcome) = oneshot::channel();
        self.submit(Command::Send {
            addr,
            message,
            ack_required,
            reply,
        })?;
        outcome
            .await
            .map_err(|_| ChirpError::Shutdown("reactor stopped".to_string()))?
    }

    /// Install the receive handler, replacing any previous one
    pub fn on_message<F>(&self, handler: F) -> Result<(), ChirpError>
    where
        F: FnMut(SocketAddr, Message) + Send + 'static,
    {
        self.submit(Command::OnMessage(Box::new(handler)))
    }

    /// Gracefully close the connection to `addr`
    pub fn close(&self, addr: SocketAddr) -> Result<(), ChirpError> {
        self.submit(Command::Close(addr))
    }

    /// Gracefully close every connection
    pub fn close_all(&self) -> Result<(), ChirpError> {
        self.submit(Command::CloseAll)
    }

    /// Close everything and wait for the reactor thread to finish
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.submit(Command::Shutdown(done)).is_ok() {
            let _ = finished.await;
        }
    }

    fn submit(&self, command: Command) -> Result<(), ChirpError> {
        self.commands
            .send(command)
            .map_err(|_| ChirpError::Shutdown("reactor stopped".to_string()))
    }
}

impl Drop for Chirp {
    fn drop(&mut self) {
        let (done, _) = oneshot::channel();
        let _ = self.commands.send(Command::Shutdown(done));
    }
}

type Ready = oneshot::Sender<Result<(SocketAddr, Identity), ChirpError>>;

fn run_reactor(config: ChirpConfig, commands: mpsc::UnboundedReceiver<Command>, ready: Ready) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(ChirpError::Value(format!(
                "cannot build reactor runtime: {}",
                e
            ))));
            return;
        }
    };
    runtime.block_on(drive(config, commands, ready));
    debug!("Reactor thread finished");
}

async fn drive(config: ChirpConfig, mut commands: mpsc::UnboundedReceiver<Command>, ready: Ready) {
    let mut engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let bind = SocketAddr::new(engine.config().bind, engine.config().port);
    let listener = match listen_tcp(bind).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready.send(Err(ChirpError::Value(format!(
                "cannot listen on {}: {}",
                bind, e
            ))));
            return;
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = ready.send(Err(ChirpError::Value(format!(
                "cannot read listener address: {}",
                e
            ))));
            return;
        }
    };
    engine.set_public_port(local_addr.port());
    info!("Listening on {} as {}", local_addr, engine.identity());
    if ready.send(Ok((local_addr, engine.identity()))).is_err() {
        return;
    }

    let (mut reactor, mut io) = TokioReactor::new();
    let mut dispatch = Dispatcher::default();
    let mut sweep = tokio::time::interval(engine.config().sweep_interval());
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut commands_open = true;

    loop {
        tokio::select! {
            accepted = listener.accept(), if !engine.is_shutting_down() => match accepted {
                Ok((stream, peer)) => {
                    let id = engine.allocate_id();
                    debug!("{} accepted from {}", id, peer);
                    reactor.adopt(id, stream);
                    engine.accept(id, peer, &mut reactor);
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
            Some((id, event)) = io.recv() => engine.handle_io(id, event, &mut reactor),
            command = commands.recv(), if commands_open => match command {
                Some(command) => dispatch.command(command, &mut engine, &mut reactor),
                None => {
                    commands_open = false;
                    engine.shutdown(&mut reactor);
                }
            },
            _ = sweep.tick() => engine.sweep(&mut reactor),
        }
        dispatch.events(&mut engine, &mut reactor);
        if engine.is_stopped() {
            break;
        }
    }

    dispatch.finish();
    info!("Chirp on {} stopped", local_addr);
}

#[derive(Default)]
struct Dispatcher {
    handler: Option<MessageHandler>,
    waiters: HashMap<SendToken, Reply>,
    stopped: Vec<oneshot::Sender<()>>,
}

impl Dispatcher {
    fn command<R: Reactor>(&mut self, command: Command, engine: &mut Engine, reactor: &mut R) {
        match command {
            Command::Send {
                addr,
                message,
                ack_required,
                reply,
            } => match engine.send(addr, message, ack_required, reactor) {
                Ok(token) => {
                    self.waiters.insert(token, reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::OnMessage(handler) => self.handler = Some(handler),
            Command::Close(addr) => engine.close(addr, reactor),
            Command::CloseAll => engine.close_all(reactor),
            Command::Shutdown(done) => {
                self.stopped.push(done);
                engine.shutdown(reactor);
            }
        }
    }

    fn events<R: Reactor>(&mut self, engine: &mut Engine, reactor: &mut R) {
        while let Some(event) = engine.poll_event() {
            match event {
                EngineEvent::Received { remote, message } => match self.handler.as_mut() {
                    Some(handler) => handler(remote, message),
                    None => debug!(
                        "No handler installed, dropping serial {} from {}",
                        message.serial, remote
                    ),
                },
                EngineEvent::SendDone { token, result } => {
                    if let Some(reply) = self.waiters.remove(&token) {
                        let _ = reply.send(result);
                    }
                }
                EngineEvent::Fatal(err) => {
                    error!("Engine failed: {}", err);
                    engine.shutdown(reactor);
                }
            }
        }
    }

    fn finish(&mut self) {
        for (_, reply) in self.waiters.drain() {
            let _ = reply.send(Err(ChirpError::Shutdown("reactor stopped".to_string())));
        }
        for done in self.stopped.drain(..) {
            let _ = done.send(());
        }
    }
}
