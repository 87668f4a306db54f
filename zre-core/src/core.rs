//! Host-driven node state machine. The host feeds commands, decoded
//! beacons, inbound frames and reaper ticks; `NodeCore` mutates the peer
//! and group tables and returns the actions the host must perform. All
//! node state lives here and is only ever touched by the host's one
//! runtime task.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::event::Event;
use crate::group::ZreGroup;
use crate::identity::NodeUuid;
use crate::peer::ZrePeer;
use crate::protocol::ZreMsg;
use crate::wire;

/// Side effect for the host to perform after a core call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open an outbound dealer link to a newly discovered peer.
    Connect { uuid: NodeUuid, endpoint: String },
    /// Push an encoded ZRE frame onto a peer's outbound link.
    Send { uuid: NodeUuid, frame: Vec<u8> },
    /// Tear down a peer's outbound link.
    Disconnect { uuid: NodeUuid },
    /// Deliver an event to the owner.
    Emit(Event),
}

pub struct NodeCore {
    uuid: NodeUuid,
    name: String,
    headers: HashMap<String, String>,
    /// Own join/leave counter, advertised in JOIN/LEAVE; wraps 255 -> 0.
    status: u8,
    /// Our inbox endpoint, set at start.
    endpoint: String,
    peers: HashMap<NodeUuid, ZrePeer>,
    own_groups: BTreeSet<String>,
    peer_groups: HashMap<String, ZreGroup>,
    verbose: bool,
}

impl NodeCore {
    pub fn new() -> Self {
        Self::with_uuid(NodeUuid::random())
    }

    pub fn with_uuid(uuid: NodeUuid) -> Self {
        NodeCore {
            uuid,
            name: uuid.short_hex(),
            headers: HashMap::new(),
            status: 0,
            endpoint: String::new(),
            peers: HashMap::new(),
            own_groups: BTreeSet::new(),
            peer_groups: HashMap::new(),
            verbose: false,
        }
    }

    pub fn uuid(&self) -> NodeUuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the node. Empty names are rejected; peers learn the new
    /// name on their next HELLO exchange.
    pub fn set_name(&mut self, name: &str) {
        if name.is_empty() {
            warn!("ignoring empty node name");
            return;
        }
        self.name = name.to_string();
    }

    pub fn set_header(&mut self, key: &str, value: &str) {
        self.headers.insert(key.to_string(), value.to_string());
    }

    pub fn set_verbose(&mut self) {
        self.verbose = true;
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Record the inbox endpoint once the host has bound it.
    pub fn start(&mut self, endpoint: String) {
        self.endpoint = endpoint;
    }

    /// Disconnect every peer and announce the stop to the owner. The
    /// host publishes the farewell beacon before calling this.
    pub fn stop(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        for uuid in self.peers.keys().copied().collect::<Vec<_>>() {
            actions.extend(self.remove_peer(uuid));
        }
        self.endpoint.clear();
        actions.push(Action::Emit(Event::Stop {
            uuid: self.uuid,
            name: self.name.clone(),
        }));
        actions
    }

    /// Join a group: bump the status counter and tell every peer.
    /// A repeated join is a no-op.
    pub fn join(&mut self, group: &str) -> Vec<Action> {
        if !self.own_groups.insert(group.to_string()) {
            return Vec::new();
        }
        self.status = self.status.wrapping_add(1);
        debug!(group, status = self.status, "joining group");
        self.send_to_all(ZreMsg::Join {
            sequence: 0,
            group: group.to_string(),
            status: self.status,
        })
    }

    /// Leave a group previously joined. A repeated leave is a no-op.
    pub fn leave(&mut self, group: &str) -> Vec<Action> {
        if !self.own_groups.remove(group) {
            return Vec::new();
        }
        self.status = self.status.wrapping_add(1);
        debug!(group, status = self.status, "leaving group");
        self.send_to_all(ZreMsg::Leave {
            sequence: 0,
            group: group.to_string(),
            status: self.status,
        })
    }

    /// Unicast content to one peer. Unknown peers drop the message.
    pub fn whisper(&mut self, uuid: NodeUuid, content: Vec<Vec<u8>>) -> Vec<Action> {
        if !self.peers.contains_key(&uuid) {
            if self.verbose {
                trace!(%uuid, "whisper to unknown peer dropped");
            }
            return Vec::new();
        }
        self.send_to_peer(
            uuid,
            ZreMsg::Whisper {
                sequence: 0,
                content,
            },
        )
    }

    /// Fan content out to every remote member of a group, provided we are
    /// in the group ourselves. Each recipient gets its own sequence.
    pub fn shout(&mut self, group: &str, content: Vec<Vec<u8>>) -> Vec<Action> {
        if !self.own_groups.contains(group) {
            if self.verbose {
                trace!(group, "shout to group we are not in dropped");
            }
            return Vec::new();
        }
        let members: Vec<NodeUuid> = self
            .peer_groups
            .get(group)
            .map(|g| g.members().collect())
            .unwrap_or_default();
        let template = ZreMsg::Shout {
            sequence: 0,
            group: group.to_string(),
            content,
        };
        let mut actions = Vec::new();
        for uuid in members {
            actions.extend(self.send_to_peer(uuid, template.clone()));
        }
        actions
    }

    pub fn peers(&self) -> Vec<NodeUuid> {
        self.peers.keys().copied().collect()
    }

    pub fn own_groups(&self) -> Vec<String> {
        self.own_groups.iter().cloned().collect()
    }

    /// Names of every group any remote peer has been seen in.
    pub fn peer_groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peer_groups.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn peer_endpoint(&self, uuid: NodeUuid) -> Option<String> {
        self.peers.get(&uuid).map(|p| p.endpoint.clone())
    }

    pub fn peer_name(&self, uuid: NodeUuid) -> Option<String> {
        self.peers.get(&uuid).map(|p| p.name.clone())
    }

    pub fn peer_header(&self, uuid: NodeUuid, key: &str) -> Option<String> {
        self.peers.get(&uuid).and_then(|p| p.headers.get(key).cloned())
    }

    /// Diagnostic state dump for the DUMP command.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "node {} name={} endpoint={}", self.uuid, self.name, self.endpoint);
        let _ = writeln!(out, "  status={} headers={}", self.status, self.headers.len());
        let _ = writeln!(out, "  own groups: {:?}", self.own_groups);
        for (name, group) in &self.peer_groups {
            let _ = writeln!(out, "  peer group {}: {} member(s)", name, group.members().count());
        }
        for peer in self.peers.values() {
            let _ = writeln!(
                out,
                "  peer {} name={} endpoint={} ready={} seq_out={}",
                peer.uuid(),
                peer.name,
                peer.endpoint,
                peer.ready(),
                peer.sent_sequence(),
            );
        }
        out
    }

    /// A live beacon arrived: make sure the peer exists, then count the
    /// beacon as activity.
    pub fn on_beacon(&mut self, uuid: NodeUuid, endpoint: String, now: Instant) -> Vec<Action> {
        if uuid == self.uuid {
            return Vec::new();
        }
        let actions = self.require_peer(uuid, endpoint, now);
        if let Some(peer) = self.peers.get_mut(&uuid) {
            peer.refresh(now);
        }
        actions
    }

    /// A zero-port beacon: the peer announced it is going away.
    pub fn on_beacon_gone(&mut self, uuid: NodeUuid) -> Vec<Action> {
        if self.peers.contains_key(&uuid) {
            debug!(%uuid, "peer sent farewell beacon");
            self.remove_peer(uuid)
        } else {
            Vec::new()
        }
    }

    /// The peer's dealer connection into our inbox closed.
    pub fn on_inbox_closed(&mut self, uuid: NodeUuid) -> Vec<Action> {
        if self.peers.contains_key(&uuid) {
            debug!(%uuid, "peer inbox link closed");
            self.remove_peer(uuid)
        } else {
            Vec::new()
        }
    }

    /// One inbound frame from the router inbox. Decode failures drop the
    /// frame; protocol violations remove the peer.
    pub fn on_message(&mut self, uuid: NodeUuid, bytes: &[u8], now: Instant) -> Vec<Action> {
        let msg = match wire::decode_frame(bytes) {
            Ok(msg) => msg,
            Err(err) => {
                if self.verbose {
                    trace!(%uuid, %err, "dropping malformed frame");
                }
                return Vec::new();
            }
        };
        if self.verbose {
            trace!(%uuid, command = msg.command(), seq = msg.sequence(), "received");
        }

        let mut actions = Vec::new();
        if let ZreMsg::Hello { ref endpoint, .. } = msg {
            if let Some(peer) = self.peers.get(&uuid) {
                if peer.ready() {
                    // Reconnect: the existing record is stale.
                    debug!(%uuid, "second HELLO from ready peer, purging stale record");
                    actions.extend(self.remove_peer(uuid));
                } else if peer.endpoint == self.endpoint {
                    // Echo of ourselves through a reflected endpoint.
                    return actions;
                }
            }
            actions.extend(self.require_peer(uuid, endpoint.clone(), now));
            if let Some(peer) = self.peers.get_mut(&uuid) {
                peer.set_ready();
            }
        }

        match self.peers.get_mut(&uuid) {
            Some(peer) if peer.ready() => {
                if peer.messages_lost(&msg) {
                    warn!(%uuid, seq = msg.sequence(), "sequence gap, removing peer");
                    actions.extend(self.remove_peer(uuid));
                    return actions;
                }
                peer.refresh(now);
            }
            _ => {
                // Traffic before HELLO (or from nobody we know) is dropped.
                if self.verbose {
                    trace!(%uuid, command = msg.command(), "dropping message from peer that is not ready");
                }
                return actions;
            }
        }

        match msg {
            ZreMsg::Hello {
                endpoint,
                groups,
                status,
                name,
                headers,
                ..
            } => {
                if let Some(peer) = self.peers.get_mut(&uuid) {
                    peer.name = name.clone();
                    peer.headers = headers.clone();
                    peer.status = status;
                }
                actions.push(Action::Emit(Event::Enter {
                    uuid,
                    name,
                    headers,
                    endpoint,
                }));
                for group in groups {
                    actions.extend(self.join_peer_group(uuid, &group));
                }
            }
            ZreMsg::Whisper { content, .. } => {
                actions.push(Action::Emit(Event::Whisper {
                    uuid,
                    name: self.peer_name(uuid).unwrap_or_default(),
                    content,
                }));
            }
            ZreMsg::Shout { group, content, .. } => {
                actions.push(Action::Emit(Event::Shout {
                    uuid,
                    name: self.peer_name(uuid).unwrap_or_default(),
                    group,
                    content,
                }));
            }
            ZreMsg::Join { group, status, .. } => {
                actions.extend(self.join_peer_group(uuid, &group));
                self.sync_peer_status(uuid, status);
            }
            ZreMsg::Leave { group, status, .. } => {
                actions.extend(self.leave_peer_group(uuid, &group));
                self.sync_peer_status(uuid, status);
            }
            // The refresh above is all a PING asks for. PING-OK is not
            // part of this profile.
            ZreMsg::Ping { .. } | ZreMsg::PingOk { .. } => {}
        }
        actions
    }

    /// Reaper pass, driven at 1 Hz by the host. Expired peers are
    /// collected first and removed after the scan.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut expired = Vec::new();
        for (uuid, peer) in self.peers.iter_mut() {
            if peer.is_expired(now) {
                expired.push(*uuid);
            } else if peer.needs_ping(now) {
                let mut ping = ZreMsg::Ping { sequence: 0 };
                peer.stamp(&mut ping);
                peer.mark_pinged();
                match wire::encode_frame(&ping) {
                    Ok(frame) => actions.push(Action::Send { uuid: *uuid, frame }),
                    Err(err) => warn!(%err, "failed to encode PING"),
                }
                actions.push(Action::Emit(Event::Evasive {
                    uuid: *uuid,
                    name: peer.name.clone(),
                }));
            }
        }
        for uuid in expired {
            debug!(%uuid, "peer expired");
            actions.extend(self.remove_peer(uuid));
        }
        actions
    }

    /// Look up or create a peer for `uuid` at `endpoint`. Creating one
    /// first purges any other peer already holding that endpoint, then
    /// connects the outbound link and greets with HELLO. The new peer is
    /// not ready until its own HELLO arrives.
    fn require_peer(&mut self, uuid: NodeUuid, endpoint: String, now: Instant) -> Vec<Action> {
        if self.peers.contains_key(&uuid) {
            return Vec::new();
        }
        let mut actions = Vec::new();
        let stale: Vec<NodeUuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.endpoint == endpoint)
            .map(|(u, _)| *u)
            .collect();
        for old in stale {
            debug!(old = %old, %endpoint, "purging stale peer at reused endpoint");
            actions.extend(self.remove_peer(old));
        }

        let mut peer = ZrePeer::new(uuid, endpoint.clone(), now);
        let mut hello = ZreMsg::Hello {
            sequence: 0,
            endpoint: self.endpoint.clone(),
            groups: self.own_groups(),
            status: self.status,
            name: self.name.clone(),
            headers: self.headers.clone(),
        };
        peer.stamp(&mut hello);
        actions.push(Action::Connect { uuid, endpoint });
        match wire::encode_frame(&hello) {
            Ok(frame) => actions.push(Action::Send { uuid, frame }),
            Err(err) => warn!(%err, "failed to encode HELLO"),
        }
        self.peers.insert(uuid, peer);
        actions
    }

    /// Drop a peer from every table. EXIT is owed to the owner only if
    /// the owner ever saw ENTER for it.
    fn remove_peer(&mut self, uuid: NodeUuid) -> Vec<Action> {
        let peer = match self.peers.remove(&uuid) {
            Some(peer) => peer,
            None => return Vec::new(),
        };
        for group in self.peer_groups.values_mut() {
            group.leave(uuid);
        }
        let mut actions = vec![Action::Disconnect { uuid }];
        if peer.ready() {
            actions.push(Action::Emit(Event::Exit {
                uuid,
                name: peer.name,
            }));
        }
        actions
    }

    fn join_peer_group(&mut self, uuid: NodeUuid, group: &str) -> Vec<Action> {
        let name = self.peer_name(uuid).unwrap_or_default();
        self.peer_groups
            .entry(group.to_string())
            .or_insert_with(|| ZreGroup::new(group))
            .join(uuid);
        vec![Action::Emit(Event::Join {
            uuid,
            name,
            group: group.to_string(),
        })]
    }

    fn leave_peer_group(&mut self, uuid: NodeUuid, group: &str) -> Vec<Action> {
        let name = self.peer_name(uuid).unwrap_or_default();
        if let Some(g) = self.peer_groups.get_mut(group) {
            g.leave(uuid);
        }
        vec![Action::Emit(Event::Leave {
            uuid,
            name,
            group: group.to_string(),
        })]
    }

    /// JOIN/LEAVE carry the sender's status counter for drift detection.
    /// Drift is logged and resynchronized, never fatal.
    fn sync_peer_status(&mut self, uuid: NodeUuid, advertised: u8) {
        if let Some(peer) = self.peers.get_mut(&uuid) {
            let expected = peer.status.wrapping_add(1);
            if advertised != expected {
                warn!(%uuid, advertised, expected, "peer status drift");
            }
            peer.status = advertised;
        }
    }

    fn send_to_all(&mut self, template: ZreMsg) -> Vec<Action> {
        let mut actions = Vec::new();
        for (uuid, peer) in self.peers.iter_mut() {
            let mut msg = template.clone();
            peer.stamp(&mut msg);
            match wire::encode_frame(&msg) {
                Ok(frame) => actions.push(Action::Send { uuid: *uuid, frame }),
                Err(err) => warn!(%err, "failed to encode frame"),
            }
        }
        actions
    }

    fn send_to_peer(&mut self, uuid: NodeUuid, mut msg: ZreMsg) -> Vec<Action> {
        let peer = match self.peers.get_mut(&uuid) {
            Some(peer) => peer,
            None => return Vec::new(),
        };
        peer.stamp(&mut msg);
        match wire::encode_frame(&msg) {
            Ok(frame) => vec![Action::Send { uuid, frame }],
            Err(err) => {
                warn!(%err, "failed to encode frame");
                Vec::new()
            }
        }
    }
}

impl Default for NodeCore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{EVASIVE_TIMEOUT, EXPIRED_TIMEOUT};
    use std::time::Duration;

    /// A fake remote node: stamps its outgoing frames the way a real
    /// peer would.
    struct Remote {
        uuid: NodeUuid,
        endpoint: String,
        seq: u16,
    }

    impl Remote {
        fn new(endpoint: &str) -> Self {
            Remote {
                uuid: NodeUuid::random(),
                endpoint: endpoint.to_string(),
                seq: 0,
            }
        }

        fn frame(&mut self, mut msg: ZreMsg) -> Vec<u8> {
            self.seq = self.seq.wrapping_add(1);
            msg.set_sequence(self.seq);
            wire::encode_frame(&msg).unwrap()
        }

        fn hello(&mut self, groups: &[&str]) -> Vec<u8> {
            self.frame(ZreMsg::Hello {
                sequence: 0,
                endpoint: self.endpoint.clone(),
                groups: groups.iter().map(|g| g.to_string()).collect(),
                status: 0,
                name: self.uuid.short_hex(),
                headers: HashMap::new(),
            })
        }
    }

    fn started_core() -> NodeCore {
        let mut core = NodeCore::new();
        core.start("tcp://127.0.0.1:40000".to_string());
        core
    }

    fn events(actions: &[Action]) -> Vec<&Event> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Emit(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    fn sent_frames(actions: &[Action], to: NodeUuid) -> Vec<ZreMsg> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Send { uuid, frame } if *uuid == to => {
                    Some(wire::decode_frame(frame).unwrap())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn beacon_connects_and_greets() {
        let mut core = started_core();
        let now = Instant::now();
        let remote = Remote::new("tcp://10.0.0.2:5000");
        let actions = core.on_beacon(remote.uuid, remote.endpoint.clone(), now);
        assert!(actions.contains(&Action::Connect {
            uuid: remote.uuid,
            endpoint: remote.endpoint.clone()
        }));
        let frames = sent_frames(&actions, remote.uuid);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            ZreMsg::Hello {
                sequence,
                endpoint,
                name,
                ..
            } => {
                assert_eq!(*sequence, 1);
                assert_eq!(endpoint, core.endpoint());
                assert_eq!(name, core.name());
            }
            other => panic!("expected HELLO, got {:?}", other),
        }
        // Discovered but not ready: no ENTER yet.
        assert!(events(&actions).is_empty());
        assert_eq!(core.peers(), vec![remote.uuid]);
    }

    #[test]
    fn own_beacon_is_ignored() {
        let mut core = started_core();
        let actions = core.on_beacon(core.uuid(), "tcp://10.0.0.9:1".to_string(), Instant::now());
        assert!(actions.is_empty());
        assert!(core.peers().is_empty());
    }

    #[test]
    fn repeated_beacon_is_activity_only() {
        let mut core = started_core();
        let now = Instant::now();
        let remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_beacon(remote.uuid, remote.endpoint.clone(), now);
        let again = core.on_beacon(remote.uuid, remote.endpoint.clone(), now);
        assert!(again.is_empty());
        assert_eq!(core.peers().len(), 1);
    }

    #[test]
    fn hello_makes_peer_ready_and_emits_enter() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        let frame = remote.frame(ZreMsg::Hello {
            sequence: 0,
            endpoint: remote.endpoint.clone(),
            groups: vec!["chat".to_string()],
            status: 1,
            name: "alice".to_string(),
            headers: HashMap::from([("X-APP".to_string(), "demo".to_string())]),
        });
        let actions = core.on_message(remote.uuid, &frame, now);
        // We greet back over a fresh link.
        assert!(actions.iter().any(|a| matches!(a, Action::Connect { uuid, .. } if *uuid == remote.uuid)));
        assert_eq!(sent_frames(&actions, remote.uuid).len(), 1);
        let evs = events(&actions);
        match evs[0] {
            Event::Enter {
                uuid,
                name,
                headers,
                endpoint,
            } => {
                assert_eq!(*uuid, remote.uuid);
                assert_eq!(name, "alice");
                assert_eq!(headers.get("X-APP").unwrap(), "demo");
                assert_eq!(endpoint, &remote.endpoint);
            }
            other => panic!("expected ENTER first, got {:?}", other),
        }
        assert!(matches!(
            evs[1],
            Event::Join { uuid, group, .. } if *uuid == remote.uuid && group == "chat"
        ));
        assert_eq!(core.peer_groups(), vec!["chat".to_string()]);
        assert_eq!(core.peer_name(remote.uuid).unwrap(), "alice");
        assert_eq!(core.peer_endpoint(remote.uuid).unwrap(), remote.endpoint);
        assert_eq!(core.peer_header(remote.uuid, "X-APP").unwrap(), "demo");
    }

    #[test]
    fn messages_before_hello_are_dropped() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_beacon(remote.uuid, remote.endpoint.clone(), now);
        let frame = remote.frame(ZreMsg::Whisper {
            sequence: 0,
            content: vec![b"hi".to_vec()],
        });
        let actions = core.on_message(remote.uuid, &frame, now);
        assert!(actions.is_empty());
    }

    #[test]
    fn malformed_frame_is_dropped_without_killing_peer() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&[]), now);
        let actions = core.on_message(remote.uuid, &[0xAA, 0xA1, 99, 2, 0, 2], now);
        assert!(actions.is_empty());
        assert_eq!(core.peers().len(), 1);
    }

    #[test]
    fn whisper_and_shout_are_forwarded_to_owner() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&["chat"]), now);

        let actions = core.on_message(
            remote.uuid,
            &remote.frame(ZreMsg::Whisper {
                sequence: 0,
                content: vec![b"psst".to_vec()],
            }),
            now,
        );
        assert!(matches!(
            events(&actions)[0],
            Event::Whisper { uuid, content, .. }
                if *uuid == remote.uuid && content == &vec![b"psst".to_vec()]
        ));

        let actions = core.on_message(
            remote.uuid,
            &remote.frame(ZreMsg::Shout {
                sequence: 0,
                group: "chat".to_string(),
                content: vec![b"hi".to_vec()],
            }),
            now,
        );
        assert!(matches!(
            events(&actions)[0],
            Event::Shout { uuid, group, .. } if *uuid == remote.uuid && group == "chat"
        ));
    }

    #[test]
    fn sequence_gap_removes_peer_and_emits_exit() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&[]), now);
        // Skip one sequence number.
        remote.seq = remote.seq.wrapping_add(1);
        let frame = remote.frame(ZreMsg::Ping { sequence: 0 });
        let actions = core.on_message(remote.uuid, &frame, now);
        assert!(actions.contains(&Action::Disconnect { uuid: remote.uuid }));
        assert!(matches!(
            events(&actions)[0],
            Event::Exit { uuid, .. } if *uuid == remote.uuid
        ));
        assert!(core.peers().is_empty());
    }

    #[test]
    fn second_hello_from_ready_peer_recreates_it() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&[]), now);

        // The remote restarted: fresh sequence, same uuid and endpoint.
        remote.seq = 0;
        let actions = core.on_message(remote.uuid, &remote.hello(&[]), now);
        let evs = events(&actions);
        assert!(matches!(evs[0], Event::Exit { uuid, .. } if *uuid == remote.uuid));
        assert!(matches!(evs[1], Event::Enter { uuid, .. } if *uuid == remote.uuid));
        assert_eq!(core.peers().len(), 1);
    }

    #[test]
    fn new_uuid_at_same_endpoint_purges_old_peer() {
        let mut core = started_core();
        let now = Instant::now();
        let mut old = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(old.uuid, &old.hello(&[]), now);

        let mut fresh = Remote::new("tcp://10.0.0.2:5000");
        let actions = core.on_message(fresh.uuid, &fresh.hello(&[]), now);
        let evs = events(&actions);
        assert!(matches!(evs[0], Event::Exit { uuid, .. } if *uuid == old.uuid));
        assert!(matches!(evs[1], Event::Enter { uuid, .. } if *uuid == fresh.uuid));
        assert_eq!(core.peers(), vec![fresh.uuid]);
        // Invariant: one peer per endpoint.
        assert_eq!(core.peer_endpoint(fresh.uuid).unwrap(), fresh.endpoint);
    }

    #[test]
    fn zero_beacon_removes_peer_and_emits_exit_once() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&[]), now);

        let actions = core.on_beacon_gone(remote.uuid);
        assert_eq!(
            events(&actions),
            vec![&Event::Exit {
                uuid: remote.uuid,
                name: remote.uuid.short_hex(),
            }]
        );
        assert!(core.on_beacon_gone(remote.uuid).is_empty());
    }

    #[test]
    fn exit_is_not_emitted_for_peer_that_never_got_ready() {
        let mut core = started_core();
        let now = Instant::now();
        let remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_beacon(remote.uuid, remote.endpoint.clone(), now);
        let actions = core.on_beacon_gone(remote.uuid);
        assert!(actions.contains(&Action::Disconnect { uuid: remote.uuid }));
        assert!(events(&actions).is_empty());
    }

    #[test]
    fn own_join_broadcasts_and_bumps_status() {
        let mut core = started_core();
        let now = Instant::now();
        let mut a = Remote::new("tcp://10.0.0.2:5000");
        let mut b = Remote::new("tcp://10.0.0.3:5000");
        core.on_message(a.uuid, &a.hello(&[]), now);
        core.on_message(b.uuid, &b.hello(&[]), now);

        let actions = core.join("chat");
        for remote in [a.uuid, b.uuid] {
            let frames = sent_frames(&actions, remote);
            assert_eq!(frames.len(), 1);
            assert!(matches!(
                &frames[0],
                ZreMsg::Join { group, status: 1, .. } if group == "chat"
            ));
        }
        assert_eq!(core.own_groups(), vec!["chat".to_string()]);

        // Repeated join: nothing sent, status untouched.
        assert!(core.join("chat").is_empty());
        let actions = core.leave("chat");
        let frames = sent_frames(&actions, a.uuid);
        assert!(matches!(
            &frames[0],
            ZreMsg::Leave { group, status: 2, .. } if group == "chat"
        ));
        assert!(core.own_groups().is_empty());
        assert!(core.leave("chat").is_empty());
    }

    #[test]
    fn status_wraps_at_256() {
        let mut core = started_core();
        for i in 0..128 {
            core.join(&format!("g{}", i));
            core.leave(&format!("g{}", i));
        }
        // 256 own join/leave events so far; one more join must show 1.
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&[]), now);
        let actions = core.join("last");
        let frames = sent_frames(&actions, remote.uuid);
        assert!(matches!(&frames[0], ZreMsg::Join { status: 1, .. }));
    }

    #[test]
    fn shout_requires_own_membership() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&["chat"]), now);
        // We are not in "chat": nothing goes out.
        assert!(core.shout("chat", vec![b"hi".to_vec()]).is_empty());
    }

    #[test]
    fn shout_reaches_group_members_only() {
        let mut core = started_core();
        let now = Instant::now();
        let mut member = Remote::new("tcp://10.0.0.2:5000");
        let mut outsider = Remote::new("tcp://10.0.0.3:5000");
        core.on_message(member.uuid, &member.hello(&["chat"]), now);
        core.on_message(outsider.uuid, &outsider.hello(&[]), now);
        core.join("chat");

        let actions = core.shout("chat", vec![b"hi".to_vec()]);
        let frames = sent_frames(&actions, member.uuid);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ZreMsg::Shout { group, content, .. }
                if group == "chat" && content == &vec![b"hi".to_vec()]
        ));
        assert!(sent_frames(&actions, outsider.uuid).is_empty());
    }

    #[test]
    fn shout_to_own_group_with_no_members_sends_nothing() {
        let mut core = started_core();
        core.join("chat");
        assert!(core.shout("chat", vec![b"hi".to_vec()]).is_empty());
    }

    #[test]
    fn whisper_to_unknown_peer_is_dropped() {
        let mut core = started_core();
        assert!(core
            .whisper(NodeUuid::random(), vec![b"hi".to_vec()])
            .is_empty());
    }

    #[test]
    fn outgoing_sequence_is_contiguous_per_peer() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&[]), now);

        let mut seen = Vec::new();
        // HELLO went out as seq 1 inside require_peer.
        for _ in 0..3 {
            let actions = core.whisper(remote.uuid, vec![b"x".to_vec()]);
            seen.push(sent_frames(&actions, remote.uuid)[0].sequence());
        }
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[test]
    fn peer_join_and_leave_track_membership() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&[]), now);

        let actions = core.on_message(
            remote.uuid,
            &remote.frame(ZreMsg::Join {
                sequence: 0,
                group: "ops".to_string(),
                status: 1,
            }),
            now,
        );
        assert!(matches!(
            events(&actions)[0],
            Event::Join { uuid, group, .. } if *uuid == remote.uuid && group == "ops"
        ));
        assert_eq!(core.peer_groups(), vec!["ops".to_string()]);

        let actions = core.on_message(
            remote.uuid,
            &remote.frame(ZreMsg::Leave {
                sequence: 0,
                group: "ops".to_string(),
                status: 2,
            }),
            now,
        );
        assert!(matches!(
            events(&actions)[0],
            Event::Leave { uuid, group, .. } if *uuid == remote.uuid && group == "ops"
        ));
        // Group registry persists, membership does not.
        assert_eq!(core.peer_groups(), vec!["ops".to_string()]);
        assert!(core.shout("ops", vec![]).is_empty());
    }

    #[test]
    fn status_drift_is_not_fatal() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&[]), now);

        let actions = core.on_message(
            remote.uuid,
            &remote.frame(ZreMsg::Join {
                sequence: 0,
                group: "ops".to_string(),
                status: 9,
            }),
            now,
        );
        // Membership recorded, peer kept.
        assert!(matches!(events(&actions)[0], Event::Join { .. }));
        assert_eq!(core.peers().len(), 1);
    }

    #[test]
    fn reaper_pings_evasive_peer_once_per_episode() {
        let mut core = started_core();
        let t0 = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&[]), t0);

        let actions = core.tick(t0 + EVASIVE_TIMEOUT);
        let frames = sent_frames(&actions, remote.uuid);
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ZreMsg::Ping { .. }));
        assert!(matches!(
            events(&actions)[0],
            Event::Evasive { uuid, .. } if *uuid == remote.uuid
        ));

        // Still evasive one tick later: no second ping.
        assert!(core.tick(t0 + EVASIVE_TIMEOUT + Duration::from_secs(1)).is_empty());

        // Activity re-arms the episode.
        let t1 = t0 + EVASIVE_TIMEOUT + Duration::from_secs(2);
        core.on_message(remote.uuid, &remote.frame(ZreMsg::Ping { sequence: 0 }), t1);
        let actions = core.tick(t1 + EVASIVE_TIMEOUT);
        assert_eq!(events(&actions).len(), 1);
    }

    #[test]
    fn reaper_removes_expired_peer() {
        let mut core = started_core();
        let t0 = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&["chat"]), t0);

        let actions = core.tick(t0 + EXPIRED_TIMEOUT);
        assert!(actions.contains(&Action::Disconnect { uuid: remote.uuid }));
        assert!(matches!(
            events(&actions)[0],
            Event::Exit { uuid, .. } if *uuid == remote.uuid
        ));
        assert!(core.peers().is_empty());
        // Its group memberships went with it.
        core.join("chat");
        assert!(core.shout("chat", vec![]).is_empty());
    }

    #[test]
    fn stop_disconnects_everyone_and_emits_stop() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&[]), now);

        let actions = core.stop();
        assert!(actions.contains(&Action::Disconnect { uuid: remote.uuid }));
        let evs = events(&actions);
        assert!(matches!(evs.last().unwrap(), Event::Stop { uuid, .. } if *uuid == core.uuid()));
        assert!(core.peers().is_empty());
        assert!(core.endpoint().is_empty());
    }

    #[test]
    fn set_name_rejects_empty() {
        let mut core = NodeCore::new();
        core.set_name("alice");
        core.set_name("");
        assert_eq!(core.name(), "alice");
    }

    #[test]
    fn dump_mentions_peers_and_groups() {
        let mut core = started_core();
        let now = Instant::now();
        let mut remote = Remote::new("tcp://10.0.0.2:5000");
        core.on_message(remote.uuid, &remote.hello(&["chat"]), now);
        core.join("chat");
        let dump = core.dump();
        assert!(dump.contains("peer group chat"));
        assert!(dump.contains(&remote.uuid.to_string()));
    }
}
