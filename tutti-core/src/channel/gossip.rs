//! Gossip Room Channel
//!
//! libp2p implementation of `SessionChannel` for rooms spanning a local
//! network:
//! - mDNS for peer discovery
//! - TCP + QUIC transports
//! - gossipsub pub/sub, one topic per room
//!
//! Every mutation applies to the local `RoomView` first and is then
//! broadcast as a `RoomMessage`; remote operations fold into the same
//! view. Late joiners catch up through a `Snapshot` answered by the
//! current host.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    gossipsub, identify, identity, mdns, noise, ping, swarm::NetworkBehaviour, swarm::SwarmEvent,
    tcp, yamux, PeerId, Swarm,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::wire::{RoomMessage, RoomView};
use super::{ChannelError, RoomId, SessionChannel};
use crate::session::{EntryKey, JoinRecord, QueueEntry, RoomState, SessionDocument, UserId};

/// Identify protocol version
const PROTOCOL_VERSION: &str = "/tutti/1.0.0";

/// How often rooms nobody watches any more are released
const ROOM_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Gossip channel configuration
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Multiaddrs to listen on
    pub listen_addresses: Vec<String>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec![
                "/ip4/0.0.0.0/tcp/0".to_string(),
                "/ip4/0.0.0.0/udp/0/quic-v1".to_string(),
            ],
        }
    }
}

/// Combined behaviour for room gossip
#[derive(NetworkBehaviour)]
struct RoomBehaviour {
    /// Ping for connection keep-alive
    ping: ping::Behaviour,
    /// mDNS for local network discovery
    mdns: mdns::tokio::Behaviour,
    /// Peer identification
    identify: identify::Behaviour,
    /// Pub/sub for room operations
    gossipsub: gossipsub::Behaviour,
}

/// Commands sent to the swarm task
enum GossipCommand {
    Apply {
        room: RoomId,
        message: RoomMessage,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    Subscribe {
        room: RoomId,
        reply: oneshot::Sender<Result<watch::Receiver<RoomState>, ChannelError>>,
    },
    Shutdown,
}

/// Handle to a running gossip channel
#[derive(Clone)]
pub struct GossipChannel {
    command_tx: mpsc::UnboundedSender<GossipCommand>,
    pub local_peer_id: String,
}

impl GossipChannel {
    /// Start the swarm task and return a handle to it.
    ///
    /// `user` is the local user; the task answers snapshot requests for
    /// rooms this user currently hosts.
    pub fn start(user: UserId, config: GossipConfig) -> Self {
        let keypair = identity::Keypair::generate_ed25519();
        let local_peer_id = PeerId::from(keypair.public());
        info!("local peer id: {}", local_peer_id);

        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let task = GossipTask {
            user,
            keypair,
            config,
            directory: RoomDirectory::default(),
        };
        tokio::spawn(async move {
            if let Err(e) = task.run(command_rx).await {
                warn!("gossip task error: {}", e);
            }
        });

        Self {
            command_tx,
            local_peer_id: local_peer_id.to_string(),
        }
    }

    /// Stop the swarm task
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(GossipCommand::Shutdown);
    }

    async fn apply(&self, room: &RoomId, message: RoomMessage) -> Result<(), ChannelError> {
        let (reply, reply_rx) = oneshot::channel();
        self.command_tx
            .send(GossipCommand::Apply { room: room.clone(), message, reply })
            .map_err(|_| ChannelError::Closed)?;
        reply_rx.await.map_err(|_| ChannelError::Closed)?
    }
}

#[async_trait]
impl SessionChannel for GossipChannel {
    async fn publish_session(
        &self,
        room: &RoomId,
        document: SessionDocument,
    ) -> Result<(), ChannelError> {
        document.validate()?;
        self.apply(room, RoomMessage::Session { document }).await
    }

    async fn clear_session(&self, room: &RoomId, host_id: UserId) -> Result<(), ChannelError> {
        self.apply(room, RoomMessage::SessionCleared { host_id }).await
    }

    async fn join(
        &self,
        room: &RoomId,
        user_id: UserId,
        record: JoinRecord,
    ) -> Result<(), ChannelError> {
        self.apply(room, RoomMessage::Joined { user_id, record }).await
    }

    async fn leave(&self, room: &RoomId, user_id: UserId) -> Result<(), ChannelError> {
        self.apply(room, RoomMessage::Left { user_id }).await
    }

    async fn suggest(
        &self,
        room: &RoomId,
        key: EntryKey,
        entry: QueueEntry,
    ) -> Result<(), ChannelError> {
        self.apply(room, RoomMessage::QueueAdded { key, entry }).await
    }

    async fn discard(&self, room: &RoomId, key: &EntryKey) -> Result<(), ChannelError> {
        self.apply(room, RoomMessage::QueueRemoved { key: key.clone() }).await
    }

    async fn subscribe(&self, room: &RoomId) -> Result<watch::Receiver<RoomState>, ChannelError> {
        let (reply, reply_rx) = oneshot::channel();
        self.command_tx
            .send(GossipCommand::Subscribe { room: room.clone(), reply })
            .map_err(|_| ChannelError::Closed)?;
        reply_rx.await.map_err(|_| ChannelError::Closed)?
    }
}

/// Per-room state held by the swarm task
struct RoomSlot {
    topic: gossipsub::IdentTopic,
    view: RoomView,
    tx: watch::Sender<RoomState>,
}

fn room_topic(room: &RoomId) -> gossipsub::IdentTopic {
    gossipsub::IdentTopic::new(format!("tutti-room-{}", room))
}

/// Room slots owned by the swarm task, addressable by id or by topic
#[derive(Default)]
struct RoomDirectory {
    rooms: HashMap<RoomId, RoomSlot>,
    topics: HashMap<gossipsub::TopicHash, RoomId>,
}

impl RoomDirectory {
    fn contains(&self, room: &RoomId) -> bool {
        self.rooms.contains_key(room)
    }

    fn insert(&mut self, room: RoomId, topic: gossipsub::IdentTopic) {
        let view = RoomView::new();
        let (tx, _rx) = watch::channel(view.state().clone());
        self.topics.insert(topic.hash(), room.clone());
        self.rooms.insert(room, RoomSlot { topic, view, tx });
    }

    fn get(&self, room: &RoomId) -> Option<&RoomSlot> {
        self.rooms.get(room)
    }

    fn get_mut(&mut self, room: &RoomId) -> Option<&mut RoomSlot> {
        self.rooms.get_mut(room)
    }

    fn room_for(&self, topic: &gossipsub::TopicHash) -> Option<&RoomId> {
        self.topics.get(topic)
    }

    /// Drop every room nobody holds a receiver for; the returned topics
    /// are for the caller to unsubscribe
    fn release_idle(&mut self) -> Vec<gossipsub::IdentTopic> {
        let idle: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|(_, slot)| slot.tx.receiver_count() == 0)
            .map(|(room, _)| room.clone())
            .collect();

        idle.iter()
            .filter_map(|room| self.rooms.remove(room))
            .map(|slot| {
                self.topics.remove(&slot.topic.hash());
                slot.topic
            })
            .collect()
    }
}

/// Runs the swarm - owns every room view on this node
struct GossipTask {
    user: UserId,
    keypair: identity::Keypair,
    config: GossipConfig,
    directory: RoomDirectory,
}

impl GossipTask {
    fn create_swarm(&self) -> Result<Swarm<RoomBehaviour>, ChannelError> {
        let swarm = libp2p::SwarmBuilder::with_existing_identity(self.keypair.clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| ChannelError::Backend(e.to_string()))?
            .with_quic()
            .with_dns()
            .map_err(|e| ChannelError::Backend(e.to_string()))?
            .with_behaviour(|keypair| {
                let ping = ping::Behaviour::new(
                    ping::Config::new()
                        .with_interval(Duration::from_secs(15))
                        .with_timeout(Duration::from_secs(20)),
                );

                let mdns = mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    keypair.public().to_peer_id(),
                )
                .map_err(|e| e.to_string())?;

                // Gossipsub tuned for small meshes; a room is a handful of
                // listeners, not a swarm of thousands
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .mesh_outbound_min(0)
                    .mesh_n_low(1)
                    .mesh_n(3)
                    .mesh_n_high(6)
                    .gossip_lazy(3)
                    .build()
                    .map_err(|e| e.to_string())?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(keypair.clone()),
                    gossipsub_config,
                )
                .map_err(|e| e.to_string())?;

                let identify = identify::Behaviour::new(identify::Config::new(
                    PROTOCOL_VERSION.into(),
                    keypair.public(),
                ));

                Ok(RoomBehaviour { ping, mdns, identify, gossipsub })
            })
            .map_err(|e| ChannelError::Backend(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(300)))
            .build();

        Ok(swarm)
    }

    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<GossipCommand>,
    ) -> Result<(), ChannelError> {
        let mut swarm = self.create_swarm()?;

        for addr in self.config.listen_addresses.clone() {
            match addr.parse() {
                Ok(multiaddr) => match swarm.listen_on(multiaddr) {
                    Ok(id) => debug!("listener started: {:?}", id),
                    Err(e) => warn!("failed to listen on {}: {}", addr, e),
                },
                Err(e) => warn!("invalid listen address {}: {}", addr, e),
            }
        }

        let mut sweep = tokio::time::interval(ROOM_SWEEP_INTERVAL);

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.handle_swarm_event(&mut swarm, event);
                }
                _ = sweep.tick() => self.release_idle_rooms(&mut swarm),
                cmd = command_rx.recv() => match cmd {
                    Some(GossipCommand::Apply { room, message, reply }) => {
                        let _ = reply.send(self.apply_local(&mut swarm, &room, message));
                    }
                    Some(GossipCommand::Subscribe { room, reply }) => {
                        let result = self
                            .ensure_room(&mut swarm, &room)
                            .map(|slot| slot.tx.subscribe());
                        let _ = reply.send(result);
                    }
                    Some(GossipCommand::Shutdown) | None => {
                        info!("gossip channel shutting down");
                        break;
                    }
                },
            }
        }

        Ok(())
    }

    /// Join a room's topic on first use and ask the host for a snapshot
    fn ensure_room(
        &mut self,
        swarm: &mut Swarm<RoomBehaviour>,
        room: &RoomId,
    ) -> Result<&mut RoomSlot, ChannelError> {
        if !self.directory.contains(room) {
            let topic = room_topic(room);
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&topic)
                .map_err(|e| ChannelError::Backend(e.to_string()))?;
            info!("subscribed to room {}", room);

            self.directory.insert(room.clone(), topic);

            // Catch up if a session is already running
            self.broadcast(swarm, room, &RoomMessage::SnapshotRequest);
        }

        Ok(self.directory.get_mut(room).expect("room slot just inserted"))
    }

    /// Unsubscribe and drop rooms whose last receiver is gone
    fn release_idle_rooms(&mut self, swarm: &mut Swarm<RoomBehaviour>) {
        for topic in self.directory.release_idle() {
            let _ = swarm.behaviour_mut().gossipsub.unsubscribe(&topic);
            info!("released idle room topic {}", topic);
        }
    }

    /// Apply a local mutation, then gossip it to the room
    fn apply_local(
        &mut self,
        swarm: &mut Swarm<RoomBehaviour>,
        room: &RoomId,
        message: RoomMessage,
    ) -> Result<(), ChannelError> {
        let slot = self.ensure_room(swarm, room)?;
        if slot.view.apply(&message) {
            slot.tx.send_replace(slot.view.state().clone());
        }
        self.broadcast(swarm, room, &message);
        Ok(())
    }

    /// Best-effort gossip of one operation.
    ///
    /// "No peers yet" is normal for a host alone in a room; the local
    /// view already holds the write and joiners catch up via snapshot.
    fn broadcast(&mut self, swarm: &mut Swarm<RoomBehaviour>, room: &RoomId, message: &RoomMessage) {
        let slot = match self.directory.get(room) {
            Some(slot) => slot,
            None => return,
        };

        let data = match serde_json::to_vec(message) {
            Ok(data) => data,
            Err(e) => {
                warn!("failed to encode room message: {}", e);
                return;
            }
        };

        if let Err(e) = swarm
            .behaviour_mut()
            .gossipsub
            .publish(slot.topic.clone(), data)
        {
            debug!("broadcast to {} skipped (may be no peers yet): {}", room, e);
        }
    }

    /// Send the full room state if we currently host this room
    fn answer_snapshot(&mut self, swarm: &mut Swarm<RoomBehaviour>, room: &RoomId) {
        let state = match self.directory.get(room) {
            Some(slot) if slot.view.state().is_host(self.user) => slot.view.state().clone(),
            _ => return,
        };
        debug!("answering snapshot request for {}", room);
        self.broadcast(swarm, room, &RoomMessage::Snapshot { state });
    }

    fn handle_swarm_event(
        &mut self,
        swarm: &mut Swarm<RoomBehaviour>,
        event: SwarmEvent<RoomBehaviourEvent>,
    ) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("listening on {}", address);
            }

            SwarmEvent::Behaviour(RoomBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    debug!("mdns discovered peer {} at {}", peer_id, addr);
                    swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                    if let Err(e) = swarm.dial(addr) {
                        debug!("failed to dial discovered peer {}: {}", peer_id, e);
                    }
                }
            }

            SwarmEvent::Behaviour(RoomBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _) in peers {
                    debug!("mdns peer expired: {}", peer_id);
                }
            }

            SwarmEvent::Behaviour(RoomBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                let room = match self.directory.room_for(&message.topic) {
                    Some(room) => room.clone(),
                    None => return,
                };

                match serde_json::from_slice::<RoomMessage>(&message.data) {
                    Ok(RoomMessage::SnapshotRequest) => self.answer_snapshot(swarm, &room),
                    Ok(room_message) => {
                        if let Some(slot) = self.directory.get_mut(&room) {
                            if slot.view.apply(&room_message) {
                                debug!("room {} updated by {}", room, propagation_source);
                                slot.tx.send_replace(slot.view.state().clone());
                            }
                        }
                    }
                    Err(_) => {
                        debug!("undecodable message from {} in {}", propagation_source, room);
                    }
                }
            }

            // A peer joined the topic; the host seeds it with full state
            SwarmEvent::Behaviour(RoomBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed {
                peer_id,
                topic,
            })) => {
                if let Some(room) = self.directory.room_for(&topic).cloned() {
                    info!("peer {} subscribed to room {}", peer_id, room);
                    self.answer_snapshot(swarm, &room);
                }
            }

            SwarmEvent::Behaviour(RoomBehaviourEvent::Gossipsub(
                gossipsub::Event::Unsubscribed { peer_id, topic },
            )) => {
                if let Some(room) = self.directory.room_for(&topic) {
                    debug!("peer {} unsubscribed from room {}", peer_id, room);
                }
            }

            SwarmEvent::Behaviour(RoomBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(
                    "identified peer {} running {}",
                    peer_id, info.protocol_version
                );
            }

            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                debug!("connection established with {}", peer_id);
                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
            }

            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!("connection closed with {}", peer_id);
            }

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(peer) = peer_id {
                    debug!("failed to connect to {}: {}", peer, error);
                } else {
                    debug!("outgoing connection error: {}", error);
                }
            }

            _ => {}
        }
    }
}
