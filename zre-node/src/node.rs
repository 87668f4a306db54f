//! Node runtime: a single task owns the protocol core and every socket,
//! multiplexing the owner command channel, the beacon socket, the router
//! inbox and the 1 Hz reaper. The `Zre` handle is the owner's side of
//! the command channel; events come back on a bounded channel written
//! with try-send so a slow owner never stalls the loop.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use zre_core::{Action, Event, NodeCore, NodeUuid};

use crate::beacon::BeaconEngine;
use crate::config::Config;
use crate::inbox::{self, InboxEvent};

const CMD_CHANNEL_DEPTH: usize = 64;
const EVENT_CHANNEL_DEPTH: usize = 1024;
const INBOX_CHANNEL_DEPTH: usize = 1024;

/// Owner commands. Queries carry a oneshot reply sender.
pub enum Command {
    Uuid { reply: oneshot::Sender<NodeUuid> },
    Name { reply: oneshot::Sender<String> },
    SetName(String),
    SetHeader(String, String),
    SetPort(u16),
    SetInterval(Duration),
    SetVerbose,
    Start { reply: oneshot::Sender<Result<String, StartError>> },
    Stop { reply: oneshot::Sender<()> },
    Join(String),
    Leave(String),
    Whisper { uuid: NodeUuid, content: Vec<Vec<u8>> },
    Shout { group: String, content: Vec<Vec<u8>> },
    Peers { reply: oneshot::Sender<Vec<NodeUuid>> },
    OwnGroups { reply: oneshot::Sender<Vec<String>> },
    PeerGroups { reply: oneshot::Sender<Vec<String>> },
    PeerEndpoint { uuid: NodeUuid, reply: oneshot::Sender<Option<String>> },
    PeerName { uuid: NodeUuid, reply: oneshot::Sender<Option<String>> },
    PeerHeader { uuid: NodeUuid, key: String, reply: oneshot::Sender<Option<String>> },
    Dump,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("inbox bind failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error("beacon socket failed: {0}")]
    Beacon(#[source] std::io::Error),
    #[error("node task terminated")]
    Gone,
}

/// The runtime task is gone; the handle is dead.
#[derive(Debug, thiserror::Error)]
#[error("node task terminated")]
pub struct NodeGone;

/// Handle to a running node. Dropping the last handle terminates the
/// runtime task (stopping the node first if it was started).
#[derive(Clone)]
pub struct Zre {
    cmd_tx: mpsc::Sender<Command>,
}

impl Zre {
    /// Spawn the runtime task. Must be called inside a tokio runtime.
    /// Returns the handle and the owner event stream.
    pub fn new(config: Config) -> (Zre, mpsc::Receiver<Event>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(CMD_CHANNEL_DEPTH);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let runtime = Runtime::new(config, event_tx);
        tokio::spawn(runtime.run(cmd_rx));
        (Zre { cmd_tx }, event_rx)
    }

    pub async fn uuid(&self) -> Result<NodeUuid, NodeGone> {
        self.request(|reply| Command::Uuid { reply }).await
    }

    pub async fn name(&self) -> Result<String, NodeGone> {
        self.request(|reply| Command::Name { reply }).await
    }

    pub async fn set_name(&self, name: &str) -> Result<(), NodeGone> {
        self.send(Command::SetName(name.to_string())).await
    }

    pub async fn set_header(&self, key: &str, value: &str) -> Result<(), NodeGone> {
        self.send(Command::SetHeader(key.to_string(), value.to_string()))
            .await
    }

    /// Fix the inbox port. Only honored before `start`.
    pub async fn set_port(&self, port: u16) -> Result<(), NodeGone> {
        self.send(Command::SetPort(port)).await
    }

    /// Override the beacon interval. Takes effect at the next `start`.
    pub async fn set_interval(&self, interval: Duration) -> Result<(), NodeGone> {
        self.send(Command::SetInterval(interval)).await
    }

    pub async fn set_verbose(&self) -> Result<(), NodeGone> {
        self.send(Command::SetVerbose).await
    }

    /// Bind the inbox, open the beacon socket and start discovering.
    /// Returns the bound endpoint.
    pub async fn start(&self) -> Result<String, StartError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Start { reply })
            .await
            .map_err(|_| StartError::Gone)?;
        rx.await.map_err(|_| StartError::Gone)?
    }

    /// Publish the farewell beacon and tear discovery down. Synchronous:
    /// peers observe the departure before this returns.
    pub async fn stop(&self) -> Result<(), NodeGone> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn join(&self, group: &str) -> Result<(), NodeGone> {
        self.send(Command::Join(group.to_string())).await
    }

    pub async fn leave(&self, group: &str) -> Result<(), NodeGone> {
        self.send(Command::Leave(group.to_string())).await
    }

    pub async fn whisper(&self, uuid: NodeUuid, content: Vec<Vec<u8>>) -> Result<(), NodeGone> {
        self.send(Command::Whisper { uuid, content }).await
    }

    pub async fn shout(&self, group: &str, content: Vec<Vec<u8>>) -> Result<(), NodeGone> {
        self.send(Command::Shout {
            group: group.to_string(),
            content,
        })
        .await
    }

    pub async fn peers(&self) -> Result<Vec<NodeUuid>, NodeGone> {
        self.request(|reply| Command::Peers { reply }).await
    }

    pub async fn own_groups(&self) -> Result<Vec<String>, NodeGone> {
        self.request(|reply| Command::OwnGroups { reply }).await
    }

    pub async fn peer_groups(&self) -> Result<Vec<String>, NodeGone> {
        self.request(|reply| Command::PeerGroups { reply }).await
    }

    pub async fn peer_endpoint(&self, uuid: NodeUuid) -> Result<Option<String>, NodeGone> {
        self.request(|reply| Command::PeerEndpoint { uuid, reply })
            .await
    }

    pub async fn peer_name(&self, uuid: NodeUuid) -> Result<Option<String>, NodeGone> {
        self.request(|reply| Command::PeerName { uuid, reply }).await
    }

    pub async fn peer_header(&self, uuid: NodeUuid, key: &str) -> Result<Option<String>, NodeGone> {
        self.request(|reply| Command::PeerHeader {
            uuid,
            key: key.to_string(),
            reply,
        })
        .await
    }

    /// Log a diagnostic dump of the node state.
    pub async fn dump(&self) -> Result<(), NodeGone> {
        self.send(Command::Dump).await
    }

    async fn send(&self, cmd: Command) -> Result<(), NodeGone> {
        self.cmd_tx.send(cmd).await.map_err(|_| NodeGone)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, NodeGone> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(make(reply)).await.map_err(|_| NodeGone)?;
        rx.await.map_err(|_| NodeGone)
    }
}

/// Live sockets of a started node.
struct Started {
    beacon: BeaconEngine,
    inbox_rx: mpsc::Receiver<InboxEvent>,
    accept_task: JoinHandle<()>,
    endpoint: String,
    inbox_port: u16,
}

enum Exit {
    /// STOP command: back to idle, startable again.
    Stopped,
    /// Command channel closed: the runtime task is done.
    Terminated,
}

struct Runtime {
    core: NodeCore,
    event_tx: mpsc::Sender<Event>,
    /// Outbound dealer links, keyed by peer UUID.
    links: HashMap<NodeUuid, mpsc::UnboundedSender<Vec<u8>>>,
    inbox_port: u16,
    beacon_port: u16,
    interval: Duration,
    host: Option<String>,
}

impl Runtime {
    fn new(config: Config, event_tx: mpsc::Sender<Event>) -> Self {
        let mut core = NodeCore::new();
        if let Some(name) = &config.name {
            core.set_name(name);
        }
        for (key, value) in &config.headers {
            core.set_header(key, value);
        }
        Runtime {
            core,
            event_tx,
            links: HashMap::new(),
            inbox_port: config.port,
            beacon_port: config.beacon_port,
            interval: Duration::from_millis(config.interval_ms.max(1)),
            host: config.host,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Start { reply } => match self.start().await {
                    Ok(mut started) => {
                        let _ = reply.send(Ok(started.endpoint.clone()));
                        if let Exit::Terminated = self.drive(&mut cmd_rx, &mut started).await {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                },
                // Stopping an idle node is a no-op.
                Command::Stop { reply } => {
                    let _ = reply.send(());
                }
                other => self.handle_command(other, false),
            }
        }
    }

    /// The started event loop: the only place peers and groups mutate.
    async fn drive(&mut self, cmd_rx: &mut mpsc::Receiver<Command>, started: &mut Started) -> Exit {
        let mut reaper = tokio::time::interval(Duration::from_secs(1));
        let mut advertise = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                maybe = cmd_rx.recv() => match maybe {
                    None => {
                        self.shutdown(started).await;
                        return Exit::Terminated;
                    }
                    Some(Command::Stop { reply }) => {
                        self.shutdown(started).await;
                        let _ = reply.send(());
                        return Exit::Stopped;
                    }
                    Some(Command::Start { reply }) => {
                        // Already started; report the live endpoint.
                        let _ = reply.send(Ok(started.endpoint.clone()));
                    }
                    Some(cmd) => self.handle_command(cmd, true),
                },
                maybe = started.inbox_rx.recv() => {
                    if let Some(ev) = maybe {
                        let actions = match ev {
                            InboxEvent::Frame(uuid, bytes) => {
                                self.core.on_message(uuid, &bytes, Instant::now())
                            }
                            InboxEvent::Closed(uuid) => self.core.on_inbox_closed(uuid),
                        };
                        self.apply(actions);
                    }
                }
                res = started.beacon.recv() => match res {
                    Ok(Some((beacon, ip))) => {
                        let actions = if beacon.port == 0 {
                            self.core.on_beacon_gone(beacon.uuid)
                        } else {
                            let endpoint = format!("tcp://{}:{}", ip, beacon.port);
                            self.core.on_beacon(beacon.uuid, endpoint, Instant::now())
                        };
                        self.apply(actions);
                    }
                    Ok(None) => {}
                    Err(err) => debug!(%err, "beacon receive failed"),
                },
                _ = reaper.tick() => {
                    let actions = self.core.tick(Instant::now());
                    self.apply(actions);
                }
                _ = advertise.tick() => {
                    if let Err(err) = started.beacon.publish(started.inbox_port).await {
                        debug!(%err, "beacon publish failed");
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: Command, started: bool) {
        match cmd {
            Command::Uuid { reply } => {
                let _ = reply.send(self.core.uuid());
            }
            Command::Name { reply } => {
                let _ = reply.send(self.core.name().to_string());
            }
            Command::SetName(name) => self.core.set_name(&name),
            Command::SetHeader(key, value) => self.core.set_header(&key, &value),
            Command::SetPort(port) => {
                if started {
                    warn!("SET PORT ignored while started");
                } else {
                    self.inbox_port = port;
                }
            }
            Command::SetInterval(interval) => self.interval = interval.max(Duration::from_millis(1)),
            Command::SetVerbose => self.core.set_verbose(),
            Command::Join(group) => {
                let actions = self.core.join(&group);
                self.apply(actions);
            }
            Command::Leave(group) => {
                let actions = self.core.leave(&group);
                self.apply(actions);
            }
            Command::Whisper { uuid, content } => {
                let actions = self.core.whisper(uuid, content);
                self.apply(actions);
            }
            Command::Shout { group, content } => {
                let actions = self.core.shout(&group, content);
                self.apply(actions);
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.core.peers());
            }
            Command::OwnGroups { reply } => {
                let _ = reply.send(self.core.own_groups());
            }
            Command::PeerGroups { reply } => {
                let _ = reply.send(self.core.peer_groups());
            }
            Command::PeerEndpoint { uuid, reply } => {
                let _ = reply.send(self.core.peer_endpoint(uuid));
            }
            Command::PeerName { uuid, reply } => {
                let _ = reply.send(self.core.peer_name(uuid));
            }
            Command::PeerHeader { uuid, key, reply } => {
                let _ = reply.send(self.core.peer_header(uuid, &key));
            }
            Command::Dump => info!("{}", self.core.dump()),
            // Start/Stop are matched by the loops before dispatch; a
            // dropped reply sender surfaces as Gone to the caller.
            Command::Start { .. } | Command::Stop { .. } => {}
        }
    }

    async fn start(&mut self) -> Result<Started, StartError> {
        let (listener, port) = inbox::bind(self.inbox_port)
            .await
            .map_err(StartError::Bind)?;
        let beacon =
            BeaconEngine::open(self.beacon_port, self.core.uuid()).map_err(StartError::Beacon)?;
        let host = self.host.clone().unwrap_or_else(local_host);
        let endpoint = format!("tcp://{}:{}", host, port);
        let (tx, inbox_rx) = mpsc::channel(INBOX_CHANNEL_DEPTH);
        let accept_task = inbox::spawn(listener, tx);
        self.core.start(endpoint.clone());
        info!(%endpoint, name = self.core.name(), "node started");
        Ok(Started {
            beacon,
            inbox_rx,
            accept_task,
            endpoint,
            inbox_port: port,
        })
    }

    /// Peers must observe the departure before teardown: farewell beacon
    /// first, a short dwell to flush it, then disconnect everything.
    async fn shutdown(&mut self, started: &mut Started) {
        if let Err(err) = started.beacon.publish(0).await {
            debug!(%err, "farewell beacon failed");
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        started.accept_task.abort();
        let actions = self.core.stop();
        self.apply(actions);
        self.links.clear();
        info!("node stopped");
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Connect { uuid, endpoint } => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    self.links.insert(uuid, tx);
                    let identity = *self.core.uuid().as_bytes();
                    tokio::spawn(run_link(endpoint, identity, rx));
                }
                Action::Send { uuid, frame } => {
                    if let Some(tx) = self.links.get(&uuid) {
                        let _ = tx.send(frame);
                    }
                }
                Action::Disconnect { uuid } => {
                    self.links.remove(&uuid);
                }
                Action::Emit(event) => {
                    if let Err(err) = self.event_tx.try_send(event) {
                        warn!(%err, "dropping owner event");
                    }
                }
            }
        }
    }
}

/// Outbound dealer link: connect, identify with our raw UUID, then
/// stream length-prefixed frames until the channel closes.
async fn run_link(
    endpoint: String,
    identity: [u8; 16],
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let addr = endpoint.strip_prefix("tcp://").unwrap_or(&endpoint);
    let mut stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(%endpoint, %err, "peer connect failed");
            return;
        }
    };
    if stream.write_all(&identity).await.is_err() {
        return;
    }
    while let Some(frame) = rx.recv().await {
        let len = (frame.len() as u32).to_le_bytes();
        if stream.write_all(&len).await.is_err()
            || stream.write_all(&frame).await.is_err()
            || stream.flush().await.is_err()
        {
            break;
        }
    }
}

/// Address to advertise in our endpoint: the source address the kernel
/// would route LAN traffic from, falling back to loopback.
fn local_host() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(("8.8.8.8", 80))?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}
