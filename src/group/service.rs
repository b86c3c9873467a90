use anyhow::{Result, bail};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::info;

use super::types::{GossipMessage, Node, NodeId, NodeState};
use super::{Destination, GroupTransport, MessageReceiver};
use crate::config::GroupSettings;

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);
const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_secs(2);
const SUSPECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEAD_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Membership over UDP gossip, application payloads over TCP.
///
/// Every member listens for data streams on the TCP port matching its gossip socket.
/// Outbound `Data` frames go through one stream per peer, opened on first use, so a
/// payload of any size arrives whole and in send order or the stream fails loudly.
/// Frames are a little-endian `u32` length followed by a bincode `GossipMessage::Data`.

pub struct GossipGroup {
    pub local_node: Node,
    pub members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    data_listener: TcpListener,
    links: DashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>,
    streams: Mutex<JoinSet<()>>,
    runtime: Handle,
    incarnation: AtomicU64,
    announce_addr: Option<SocketAddr>,
    receiver: RwLock<Option<Arc<dyn MessageReceiver>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GossipGroup {
    pub async fn new(settings: &GroupSettings) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(settings.bind_addr()).await?;
        let local_addr = socket.local_addr()?;
        let data_listener = TcpListener::bind(local_addr).await?;

        if let Err(e) = socket.set_ttl(settings.multicast_ttl) {
            tracing::warn!("Failed to set TTL {}: {}", settings.multicast_ttl, e);
        }

        let announce_addr = match settings.multicast_addr {
            IpAddr::V4(group) if group.is_multicast() => {
                if let Err(e) = socket.set_multicast_ttl_v4(settings.multicast_ttl) {
                    tracing::warn!("Failed to set multicast TTL: {}", e);
                }
                match socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
                    Ok(()) => {
                        info!("Joined multicast group {}", group);
                        Some(SocketAddr::new(IpAddr::V4(group), settings.multicast_port))
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Failed to join multicast group {}, relying on seeds only: {}",
                            group,
                            e
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let local_node = Node {
            id: NodeId::new(),
            addr: local_addr,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };
        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        let join = bincode::serialize(&GossipMessage::Join {
            node: local_node.clone(),
        })?;
        if !settings.seeds.is_empty() {
            info!("Joining group via {} seed node(s)", settings.seeds.len());
        }
        for seed_node in settings.seeds.iter().chain(announce_addr.iter()) {
            match socket.send_to(&join, seed_node).await {
                Ok(_) => info!("Sent join request to {}", seed_node),
                Err(e) => tracing::warn!("Failed to send join request to {}: {}", seed_node, e),
            }
        }

        Ok(Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            data_listener,
            links: DashMap::new(),
            streams: Mutex::new(JoinSet::new()),
            runtime: Handle::current(),
            incarnation: AtomicU64::new(1),
            announce_addr,
            receiver: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn start(self: &Arc<Self>) {
        tracing::info!("Starting group membership service on {}", self.local_node.addr);

        let gossip_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.gossip_loop().await;
            })
        };

        let receive_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.receive_loop().await;
            })
        };

        let failure_detection_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.failure_detection_loop().await;
            })
        };

        let accept_handle = {
            let service = self.clone();
            tokio::spawn(async move {
                service.accept_loop().await;
            })
        };

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([
                gossip_handle,
                receive_handle,
                failure_detection_handle,
                accept_handle,
            ]);

        tracing::info!("All background tasks started");
    }

    /// Stops the background loops. Pending inbound messages are discarded; frames already
    /// handed to an outbound stream are still written before it closes.
    pub fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .abort_all();
        self.links.clear();
        self.clear_receiver();
        tracing::info!("Group membership service stopped");
    }

    pub fn announce_addr(&self) -> Option<SocketAddr> {
        self.announce_addr
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

    /// Waits until at least `count` members, the local one included, are alive.
    pub async fn wait_for_members(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.get_alive_members().len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(GOSSIP_INTERVAL / 5).await;
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(GOSSIP_INTERVAL);

        loop {
            interval.tick().await;

            let alive_members: Vec<Node> = self
                .members
                .iter()
                .filter(|entry| {
                    entry.value().id != self.local_node.id
                        && entry.value().state == NodeState::Alive
                })
                .map(|entry| entry.value().clone())
                .collect();

            if alive_members.is_empty() {
                continue;
            }

            use rand::Rng;
            let idx = rand::thread_rng().gen_range(0..alive_members.len());
            let target = &alive_members[idx];

            let msg = GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation: self.incarnation.load(Ordering::SeqCst),
            };

            if let Ok(encoded) = bincode::serialize(&msg) {
                if let Err(e) = self.socket.send_to(&encoded, target.addr).await {
                    tracing::warn!("Failed to send ping to {:?}: {}", target.id, e);
                } else {
                    tracing::trace!("Sent ping to {:?}", target.id);
                }
            } else {
                tracing::error!("Failed to serialize GossipMessage::Ping");
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
                            tracing::error!("Error handling message from {}: {}", src, e);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            match self.data_listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::debug!("Accepted data stream from {}", peer);
                    let service = self.clone();
                    self.track_stream(async move {
                        if let Err(e) = service.read_frames(stream).await {
                            tracing::warn!("Data stream from {} failed: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept data stream: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    fn track_stream(&self, reader: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        while streams.try_join_next().is_some() {}
        streams.spawn(reader);
    }

    async fn read_frames(&self, mut stream: TcpStream) -> Result<()> {
        let mut len_buf = [0u8; 4];

        loop {
            match stream.read_exact(&mut len_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_FRAME_LEN {
                bail!("Frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME_LEN);
            }

            let mut frame = vec![0u8; len];
            stream.read_exact(&mut frame).await?;

            match bincode::deserialize::<GossipMessage>(&frame)? {
                GossipMessage::Data { from, payload } => self.handle_data(from, payload),
                _ => tracing::warn!("Ignoring gossip message received on a data stream"),
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) -> Result<()> {
        match msg {
            GossipMessage::Ping { from, incarnation } => {
                self.handle_ping(from, incarnation, src).await?;
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
            } => {
                self.handle_ack(from, incarnation, members);
            }

            GossipMessage::Join { node } => {
                self.handle_join(node, src).await?;
            }

            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await;
            }

            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation);
            }

            GossipMessage::Data { from, payload } => {
                self.handle_data(from, payload);
            }
        }

        Ok(())
    }

    async fn handle_ping(
        &self,
        from: NodeId,
        from_incarnation: u64,
        src: SocketAddr,
    ) -> Result<()> {
        tracing::trace!("Received ping from {:?}", from);

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());

            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        } else {
            tracing::info!("Discovered new member via ping: {:?} at {}", from, src);

            let new_node = Node {
                id: from.clone(),
                addr: src,
                state: NodeState::Alive,
                incarnation: from_incarnation,
                last_seen: Some(Instant::now()),
            };

            self.members.insert(new_node.id.clone(), new_node);
        }

        self.send_ack(src).await?;

        tracing::trace!("Sent ack to {:?} with {} members", from, self.members.len());

        Ok(())
    }

    async fn send_ack(&self, target: SocketAddr) -> Result<()> {
        let all_members: Vec<Node> = self
            .members
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let reply = GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation: self.incarnation.load(Ordering::SeqCst),
            members: all_members,
        };

        let encoded = bincode::serialize(&reply)?;
        self.socket.send_to(&encoded, target).await?;
        Ok(())
    }

    fn handle_ack(&self, from: NodeId, from_incarnation: u64, members: Vec<Node>) {
        tracing::trace!(
            "Received ack from {:?} (inc={}) with {} members",
            from,
            from_incarnation,
            members.len()
        );

        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
            if from_incarnation > member.incarnation {
                member.incarnation = from_incarnation;
            }
        }

        for member in members {
            self.merge_member(member);
        }
    }

    fn merge_member(&self, new_member: Node) {
        if new_member.id == self.local_node.id {
            return;
        }

        match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {:?}: inc {} -> {}",
                        new_member.id,
                        existing.incarnation,
                        new_member.incarnation,
                    );

                    existing.state = new_member.state;
                    existing.incarnation = new_member.incarnation;
                    existing.last_seen = Some(Instant::now());
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    tracing::info!("{:?} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::info!(
                    "Discovered new member: {:?} at {}",
                    new_member.id,
                    new_member.addr
                );

                let mut member_with_timestamp = new_member;
                member_with_timestamp.last_seen = Some(Instant::now());

                self.members
                    .insert(member_with_timestamp.id.clone(), member_with_timestamp);
            }
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) {
        let mut refutation = None;

        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if node_id == self.local_node.id {
                    if incarnation >= existing.incarnation {
                        let my_incarnation = self.incarnation.fetch_add(1, Ordering::SeqCst) + 1;
                        tracing::info!(
                            "Refuting suspicion of local node (inc={})",
                            my_incarnation
                        );
                        existing.incarnation = my_incarnation;
                        existing.state = NodeState::Alive;
                        existing.last_seen = Some(Instant::now());
                        refutation = Some(GossipMessage::Alive {
                            node_id: node_id.clone(),
                            incarnation: my_incarnation,
                        });
                    }
                } else if incarnation >= existing.incarnation
                    && existing.state == NodeState::Alive
                {
                    tracing::info!("Node {:?} at {} suspected", existing.id, existing.addr);
                    existing.state = NodeState::Suspect;
                    existing.incarnation = incarnation;
                }
            }
            None => {
                tracing::debug!("Suspected node {:?} doesn't exist", node_id);
            }
        }

        if let Some(msg) = refutation {
            self.broadcast_message(msg).await;
        }
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                if incarnation > existing.incarnation
                    || (incarnation == existing.incarnation
                        && existing.state == NodeState::Suspect)
                {
                    tracing::info!(
                        "Node {:?} at {} is now Alive (inc={})",
                        existing.id,
                        existing.addr,
                        incarnation
                    );
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                }
            }
            None => {
                tracing::debug!("Alive message for unknown node {:?}", node_id);
            }
        }
    }

    async fn handle_join(&self, mut node: Node, src: SocketAddr) -> Result<()> {
        if node.id == self.local_node.id {
            return Ok(());
        }

        tracing::info!("Node {:?} joining group from {}", node.id, src);

        // The joiner may have bound a wildcard address; the datagram source is reachable.
        node.addr = src;
        node.last_seen = Some(Instant::now());
        self.members.insert(node.id.clone(), node);

        tracing::info!("Group size now: {}", self.members.len());

        self.send_ack(src).await
    }

    fn handle_data(&self, from: NodeId, payload: Vec<u8>) {
        if let Some(mut member) = self.members.get_mut(&from) {
            member.last_seen = Some(Instant::now());
        }

        let receiver = self
            .receiver
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match receiver {
            Some(receiver) => receiver.receive(&from, &payload),
            None => tracing::debug!(
                "Dropping {} byte payload from {:?}, no receiver installed",
                payload.len(),
                from
            ),
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            interval.tick().await;
            let now = Instant::now();

            let mut messages_to_broadcast = Vec::new();

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
                        tracing::warn!(
                            "Node {:?} suspected (no contact for {:?})",
                            member.id,
                            elapsed
                        );

                        member.state = NodeState::Suspect;

                        messages_to_broadcast.push(GossipMessage::Suspect {
                            node_id: member.id.clone(),
                            incarnation: member.incarnation,
                        });
                    }
                    NodeState::Suspect if elapsed > DEAD_TIMEOUT => {
                        tracing::info!(
                            "Node {:?} declared DEAD (no contact for {:?})",
                            member.id,
                            elapsed
                        );

                        member.state = NodeState::Dead;
                    }
                    _ => {}
                }
            }

            for msg in messages_to_broadcast {
                self.broadcast_message(msg).await;
            }
        }
    }

    async fn broadcast_message(&self, msg: GossipMessage) {
        if let Ok(encoded) = bincode::serialize(&msg) {
            for member in self.get_alive_members() {
                if member.id == self.local_node.id {
                    continue;
                }

                if let Err(e) = self.socket.send_to(&encoded, member.addr).await {
                    tracing::warn!("Failed to broadcast to {:?}: {}", member.id, e);
                }
            }
        }
    }

    /// Queues `frame` on the stream to `node`, opening a new one if none is open.
    fn send_frame(&self, frame: Vec<u8>, node: &Node) -> Result<()> {
        let link = match self.links.entry(node.id.clone()) {
            Entry::Occupied(entry) if !entry.get().is_closed() => entry.get().clone(),
            entry => {
                let (link, frames) = mpsc::unbounded_channel();
                self.runtime.spawn(write_frames(node.clone(), frames));
                entry.insert(link.clone());
                link
            }
        };

        link.send(frame).map_err(|_| {
            anyhow::anyhow!("Data stream to {:?} at {} is closed", node.id, node.addr)
        })
    }
}

async fn write_frames(node: Node, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(node.addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!("Failed to connect to {:?} at {}: {}", node.id, node.addr, e);
            return;
        }
        Err(_) => {
            tracing::warn!("Timed out connecting to {:?} at {}", node.id, node.addr);
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY towards {}: {}", node.addr, e);
    }
    tracing::debug!("Opened data stream to {:?} at {}", node.id, node.addr);

    while let Some(frame) = frames.recv().await {
        if let Err(e) = stream.write_all(&frame).await {
            tracing::warn!(
                "Data stream to {:?} at {} failed, dropping queued frames: {}",
                node.id,
                node.addr,
                e
            );
            return;
        }
    }

    if let Err(e) = stream.shutdown().await {
        tracing::debug!("Failed to close data stream to {}: {}", node.addr, e);
    }
}

impl GroupTransport for GossipGroup {
    fn current_members(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .get_alive_members()
            .into_iter()
            .map(|node| node.id)
            .collect();
        ids.sort();
        ids
    }

    fn local_address(&self) -> NodeId {
        self.local_node.id.clone()
    }

    fn send(&self, destination: &Destination, payload: Vec<u8>) -> Result<()> {
        let encoded = bincode::serialize(&GossipMessage::Data {
            from: self.local_node.id.clone(),
            payload,
        })?;
        if encoded.len() > MAX_FRAME_LEN {
            bail!("Payload of {} bytes exceeds the {} byte frame limit", encoded.len(), MAX_FRAME_LEN);
        }
        let mut frame = Vec::with_capacity(encoded.len() + 4);
        frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        frame.extend_from_slice(&encoded);

        match destination {
            Destination::Member(node_id) => {
                let node = self
                    .get_member(node_id)
                    .ok_or_else(|| anyhow::anyhow!("Unknown group member: {:?}", node_id))?;
                self.send_frame(frame, &node)
            }
            Destination::Broadcast => {
                let targets: Vec<Node> = self
                    .get_alive_members()
                    .into_iter()
                    .filter(|node| node.id != self.local_node.id)
                    .collect();

                let mut failed = 0;
                for node in &targets {
                    if let Err(e) = self.send_frame(frame.clone(), node) {
                        tracing::warn!("{}", e);
                        failed += 1;
                    }
                }

                if failed > 0 {
                    return Err(anyhow::anyhow!(
                        "Broadcast failed for {} of {} members",
                        failed,
                        targets.len()
                    ));
                }
                Ok(())
            }
        }
    }

    fn set_receiver(&self, receiver: Arc<dyn MessageReceiver>) {
        *self.receiver.write().unwrap_or_else(PoisonError::into_inner) = Some(receiver);
    }

    fn clear_receiver(&self) {
        *self.receiver.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
