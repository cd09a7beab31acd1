//! Gossip-based membership for nodes running as separate processes.
//!
//! SWIM-style: periodic pings to a random live member, full member lists piggybacked on
//! acks, and an `Alive -> Suspect -> Dead` failure detector driven by timeouts.
//! Incarnation numbers settle disputes; a node refutes a suspicion about itself by
//! bumping its own incarnation.
//!
//! Membership events are raised when a member is first seen alive (`Joined`) and when
//! it is declared dead (`Left`).

use super::types::{
    GossipMessage, MembershipEvent, MembershipListener, Node, NodeId, NodeState,
};
use super::view::ClusterView;
use crate::messaging::http::AddressBook;

use anyhow::Result;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GossipMembership {
    pub local_node: Node,
    members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: Arc<RwLock<u64>>,
    listeners: Mutex<Vec<MembershipListener>>,
}

impl GossipMembership {
    pub async fn new(
        bind_addr: SocketAddr,
        http_addr: SocketAddr,
        seed_nodes: Vec<SocketAddr>,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_node = Node {
            id: NodeId::new(),
            gossip_addr: socket.local_addr()?,
            http_addr,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };

        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        if !seed_nodes.is_empty() {
            tracing::info!("Joining cluster via {} seed node(s)", seed_nodes.len());

            let encoded = bincode::serialize(&GossipMessage::Join {
                node: local_node.clone(),
            })?;
            for seed in seed_nodes.iter() {
                socket.send_to(&encoded, seed).await?;
                tracing::info!("Sent join request to {}", seed);
            }
        }

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: Arc::new(RwLock::new(1)),
            listeners: Mutex::new(Vec::new()),
        }))
    }

    /// Spawns the gossip, receive and failure-detection loops.
    pub async fn start(self: Arc<Self>) {
        tracing::info!("Starting gossip membership on {}", self.local_node.gossip_addr);

        let gossip = self.clone();
        tokio::spawn(async move { gossip.gossip_loop().await });

        let receiver = self.clone();
        tokio::spawn(async move { receiver.receive_loop().await });

        let detector = self.clone();
        tokio::spawn(async move { detector.failure_detection_loop().await });
    }

    pub fn get_alive_members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state == NodeState::Alive)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get_member(&self, node_id: &NodeId) -> Option<Node> {
        self.members.get(node_id).map(|entry| entry.value().clone())
    }

    fn emit(&self, events: Vec<MembershipEvent>) {
        if events.is_empty() {
            return;
        }

        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for event in events {
            for listener in listeners.iter() {
                listener(event.clone());
            }
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let peers: Vec<Node> = self
                .get_alive_members()
                .into_iter()
                .filter(|node| node.id != self.local_node.id)
                .collect();

            if peers.is_empty() {
                continue;
            }

            use rand::Rng;
            let target = &peers[rand::thread_rng().gen_range(0..peers.len())];

            let msg = GossipMessage::Ping {
                from: self.local_node.clone(),
                incarnation: *self.incarnation.read().await,
            };

            match bincode::serialize(&msg) {
                Ok(encoded) => {
                    if let Err(e) = self.socket.send_to(&encoded, target.gossip_addr).await {
                        tracing::warn!("Failed to send ping to {}: {}", target.id, e);
                    }
                }
                Err(e) => tracing::error!("Failed to serialize ping: {}", e),
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; 65536];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => {
                        if let Err(e) = self.handle_message(msg, src).await {
                            tracing::error!("Error handling gossip from {}: {}", src, e);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to deserialize gossip from {}: {}", src, e),
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => self.handle_ping(from, incarnation, src).await,
            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members);
                Ok(())
            }
            GossipMessage::Join { node } => {
                self.handle_join(node);
                Ok(())
            }
            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => self.handle_suspect(node_id, incarnation).await,
            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation);
                Ok(())
            }
        }
    }

    async fn handle_ping(&self, from: Node, incarnation: u64, src: SocketAddr) -> Result<()> {
        let mut events = Vec::new();

        match self.members.get_mut(&from.id) {
            Some(mut member) => {
                member.last_seen = Some(Instant::now());
                if incarnation > member.incarnation {
                    member.incarnation = incarnation;
                }
            }
            None => {
                tracing::info!("Discovered new member via ping: {} at {}", from.id, src);
                events.push(MembershipEvent::Joined(from.id.clone()));
                self.members.insert(
                    from.id.clone(),
                    Node {
                        state: NodeState::Alive,
                        incarnation,
                        last_seen: Some(Instant::now()),
                        ..from
                    },
                );
            }
        }
        self.emit(events);

        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: *self.incarnation.read().await,
            members: self.members.iter().map(|entry| entry.value().clone()).collect(),
        };
        self.socket.send_to(&bincode::serialize(&reply)?, src).await?;

        Ok(())
    }

    fn handle_ack(&self, from: NodeId, incarnation: u64, members: Vec<Node>) {
        if let Some(mut member) = self.members.get_mut(&from)
            && incarnation >= member.incarnation
        {
            member.incarnation = incarnation;
            member.last_seen = Some(Instant::now());
        }

        let events: Vec<MembershipEvent> = members
            .into_iter()
            .filter_map(|member| self.merge_member(member))
            .collect();
        self.emit(events);
    }

    /// Folds a remote view of one member into ours, returning the event it caused.
    fn merge_member(&self, incoming: Node) -> Option<MembershipEvent> {
        match self.members.get_mut(&incoming.id) {
            Some(mut existing) => {
                let was_alive = existing.state == NodeState::Alive;

                if incoming.incarnation > existing.incarnation {
                    existing.state = incoming.state;
                    existing.incarnation = incoming.incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if incoming.incarnation == existing.incarnation
                    && incoming.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{} refuted suspicion", incoming.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }

                match (was_alive, existing.state == NodeState::Alive) {
                    (false, true) => Some(MembershipEvent::Joined(existing.id.clone())),
                    _ => None,
                }
            }
            None => {
                if incoming.state == NodeState::Dead {
                    return None;
                }

                tracing::info!("Discovered new member: {} at {}", incoming.id, incoming.gossip_addr);
                let id = incoming.id.clone();
                let alive = incoming.state == NodeState::Alive;
                self.members.insert(
                    id.clone(),
                    Node {
                        last_seen: Some(Instant::now()),
                        ..incoming
                    },
                );
                alive.then_some(MembershipEvent::Joined(id))
            }
        }
    }

    fn handle_join(&self, mut node: Node) {
        tracing::info!("Node {} joining cluster at {}", node.id, node.gossip_addr);

        node.state = NodeState::Alive;
        node.last_seen = Some(Instant::now());
        let id = node.id.clone();
        let known = self.members.insert(id.clone(), node).is_some();

        tracing::info!("Cluster size now: {}", self.members.len());
        if !known {
            self.emit(vec![MembershipEvent::Joined(id)]);
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) -> Result<()> {
        if node_id == self.local_node.id {
            let refuted = {
                let mut inc = self.incarnation.write().await;
                if incarnation < *inc {
                    return Ok(());
                }
                *inc = incarnation + 1;
                *inc
            };

            tracing::info!("Refuting suspicion about self (inc={})", refuted);
            self.broadcast_message(GossipMessage::Alive {
                node_id,
                incarnation: refuted,
            })
            .await;
            return Ok(());
        }

        if let Some(mut existing) = self.members.get_mut(&node_id)
            && incarnation >= existing.incarnation
            && existing.state == NodeState::Alive
        {
            tracing::info!("Node {} suspected", node_id);
            existing.state = NodeState::Suspect;
            existing.incarnation = incarnation;
        }

        Ok(())
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        let revived = match self.members.get_mut(&node_id) {
            Some(mut existing) if incarnation > existing.incarnation => {
                let revived = existing.state == NodeState::Dead;
                existing.state = NodeState::Alive;
                existing.incarnation = incarnation;
                existing.last_seen = Some(Instant::now());
                revived
            }
            Some(_) => false,
            None => {
                tracing::debug!("Alive message for unknown node {}", node_id);
                false
            }
        };

        if revived {
            self.emit(vec![MembershipEvent::Joined(node_id)]);
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut suspects = Vec::new();
            let mut events = Vec::new();

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();
                if member.id == self.local_node.id {
                    continue;
                }

                let Some(last_seen) = member.last_seen else {
                    member.last_seen = Some(now);
                    continue;
                };
                let elapsed = now.duration_since(last_seen);

                match member.state {
                    NodeState::Alive if elapsed > SUSPECT_TIMEOUT => {
                        tracing::warn!("Node {} suspected (no contact for {:?})", member.id, elapsed);
                        member.state = NodeState::Suspect;
                        suspects.push(GossipMessage::Suspect {
                            node_id: member.id.clone(),
                            incarnation: member.incarnation,
                        });
                    }
                    NodeState::Suspect if elapsed > DEAD_TIMEOUT => {
                        tracing::warn!("Node {} declared dead (no contact for {:?})", member.id, elapsed);
                        member.state = NodeState::Dead;
                        events.push(MembershipEvent::Left(member.id.clone()));
                    }
                    _ => {}
                }
            }

            self.emit(events);
            for msg in suspects {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        let Ok(encoded) = bincode::serialize(&msg) else {
            tracing::error!("Failed to serialize gossip broadcast");
            return;
        };

        for member in self.get_alive_members() {
            if member.id == self.local_node.id {
                continue;
            }
            if let Err(e) = self.socket.send_to(&encoded, member.gossip_addr).await {
                tracing::warn!("Failed to broadcast to {}: {}", member.id, e);
            }
        }
    }
}

impl ClusterView for GossipMembership {
    fn local_node_id(&self) -> NodeId {
        self.local_node.id.clone()
    }

    fn members(&self) -> BTreeSet<NodeId> {
        self.get_alive_members().into_iter().map(|node| node.id).collect()
    }

    fn on_membership_change(&self, listener: MembershipListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}

impl AddressBook for GossipMembership {
    fn http_addr(&self, node: &NodeId) -> Option<SocketAddr> {
        self.members
            .get(node)
            .filter(|entry| entry.value().state != NodeState::Dead)
            .map(|entry| entry.value().http_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_membership_creation() {
        let service = GossipMembership::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:6000".parse().unwrap(),
            vec![],
        )
        .await
        .expect("Failed to create service");

        let members = service.get_alive_members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].state, NodeState::Alive);
        assert_eq!(service.members().len(), 1);
        assert!(service.is_alive(&service.local_node_id()));
    }

    #[tokio::test]
    async fn test_join_emits_event_once() {
        let service = GossipMembership::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:6000".parse().unwrap(),
            vec![],
        )
        .await
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        service.on_membership_change(Arc::new(move |event| sink.lock().unwrap().push(event)));

        let joiner = Node {
            id: NodeId::from("joiner"),
            gossip_addr: "127.0.0.1:5999".parse().unwrap(),
            http_addr: "127.0.0.1:6999".parse().unwrap(),
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: None,
        };
        service.handle_join(joiner.clone());
        service.handle_join(joiner);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![MembershipEvent::Joined(NodeId::from("joiner"))]
        );
        assert_eq!(
            service.http_addr(&NodeId::from("joiner")),
            Some("127.0.0.1:6999".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_merge_prefers_higher_incarnation() {
        let service = GossipMembership::new(
            "127.0.0.1:0".parse().unwrap(),
            "127.0.0.1:6000".parse().unwrap(),
            vec![],
        )
        .await
        .unwrap();

        let mut remote = Node {
            id: NodeId::from("remote"),
            gossip_addr: "127.0.0.1:5998".parse().unwrap(),
            http_addr: "127.0.0.1:6998".parse().unwrap(),
            state: NodeState::Suspect,
            incarnation: 3,
            last_seen: None,
        };
        assert!(service.merge_member(remote.clone()).is_none());

        remote.state = NodeState::Alive;
        remote.incarnation = 4;
        let event = service.merge_member(remote);

        assert_eq!(event, Some(MembershipEvent::Joined(NodeId::from("remote"))));
        assert_eq!(service.get_member(&NodeId::from("remote")).unwrap().incarnation, 4);
    }
}
