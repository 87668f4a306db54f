//! Beacon engine: broadcast our presence on the discovery UDP port,
//! receive and filter peers' beacons.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::trace;

use zre_core::{decode_beacon, encode_beacon, Beacon, NodeUuid, BEACON_SIZE};

pub struct BeaconEngine {
    socket: UdpSocket,
    dest: SocketAddr,
    uuid: NodeUuid,
    buf: [u8; 64],
}

impl BeaconEngine {
    /// Open the discovery socket: broadcast enabled, port shared so
    /// several nodes on one host can listen at once.
    pub fn open(port: u16, uuid: NodeUuid) -> std::io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
        socket.bind(&addr.into())?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(BeaconEngine {
            socket,
            dest: (Ipv4Addr::BROADCAST, port).into(),
            uuid,
            buf: [0u8; 64],
        })
    }

    /// Announce our inbox port; 0 is the farewell.
    pub async fn publish(&self, port: u16) -> std::io::Result<()> {
        let frame = encode_beacon(&Beacon {
            uuid: self.uuid,
            port,
        });
        self.socket.send_to(&frame, self.dest).await.map(|_| ())
    }

    /// Receive one datagram. Returns the decoded beacon and sender
    /// address, or `None` for anything invalid or our own echo.
    pub async fn recv(&mut self) -> std::io::Result<Option<(Beacon, IpAddr)>> {
        let (n, from) = self.socket.recv_from(&mut self.buf).await?;
        if n != BEACON_SIZE {
            trace!(len = n, %from, "dropping datagram of wrong size");
            return Ok(None);
        }
        match decode_beacon(&self.buf[..n]) {
            Ok(beacon) if beacon.uuid == self.uuid => Ok(None),
            Ok(beacon) => Ok(Some((beacon, from.ip()))),
            Err(err) => {
                trace!(%err, %from, "dropping invalid beacon");
                Ok(None)
            }
        }
    }
}
