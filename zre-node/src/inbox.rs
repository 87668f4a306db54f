//! Router inbox: one listening socket accepting dealer connections,
//! each identified by the remote peer's 16 raw UUID bytes, carrying
//! length-prefixed ZRE frames.

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use zre_core::{NodeUuid, MAX_FRAME_LEN};

const LEN_SIZE: usize = 4;

/// What the inbox hands to the runtime.
pub enum InboxEvent {
    /// One raw ZRE frame from a connected dealer.
    Frame(NodeUuid, Vec<u8>),
    /// The dealer's connection closed.
    Closed(NodeUuid),
}

/// Bind the inbox; port 0 picks an ephemeral port. Returns the listener
/// and the port actually bound.
pub async fn bind(port: u16) -> std::io::Result<(TcpListener, u16)> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// Accept dealer connections until aborted; each connection gets its own
/// reader task feeding `tx`.
pub fn spawn(listener: TcpListener, tx: mpsc::Sender<InboxEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    trace!(%addr, "inbox connection accepted");
                    tokio::spawn(run_connection(stream, tx.clone()));
                }
                Err(err) => {
                    debug!(%err, "inbox accept failed");
                    break;
                }
            }
        }
    })
}

async fn run_connection(mut stream: TcpStream, tx: mpsc::Sender<InboxEvent>) {
    let mut identity = [0u8; 16];
    if stream.read_exact(&mut identity).await.is_err() {
        return;
    }
    let uuid = NodeUuid::from_bytes(identity);
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if stream.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            debug!(%uuid, len, "oversized frame, closing inbox link");
            break;
        }
        let mut frame = vec![0u8; len as usize];
        if stream.read_exact(&mut frame).await.is_err() {
            break;
        }
        if tx.send(InboxEvent::Frame(uuid, frame)).await.is_err() {
            return;
        }
    }
    let _ = tx.send(InboxEvent::Closed(uuid)).await;
}
