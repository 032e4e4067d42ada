//! Multiplayer session. Owns the connections to every peer, schedules simulation events on the
//! frame they execute on and hands them to the frame loop once that frame is reached.
//!
//! Every event is stamped with `generation frame + max_ahead` before it leaves the machine, so all
//! peers see it before its frame comes up. The session checks that the lock-step contract holds and
//! reports a desync as soon as an event shows up for a frame that was already executed.

use crate::event::{Event, EventKind};
use crate::packet::{JoinRejection, Packet};
use crate::transfer::{FileStore, ScenarioReceiver, ScenarioSender, TransferError, TransferSettings, TransferStatus};
use courier::net::address::Address;
use courier::net::manager::{ConnectionChange, ConnectionId, ConnectionManager, ManagerSettings};
use courier::net::queue::Timing;
use courier::net::support::{NetworkError, PayloadBatch};
use courier::net::transport::Transport;
use flux::choose;
use flux::util::round_up;
use flux::{FrameNo, PlayerId, Tick};
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use slog::{debug, info, o, trace, warn, Logger};
use std::collections::{BTreeMap, VecDeque};
use std::convert::TryFrom;
use std::fmt;
use std::mem;

pub const MODEM_MIN_MAX_AHEAD: u32 = 5;
pub const NETWORK_MIN_MAX_AHEAD: u32 = 2;

/// Upper bound of the simulation rate, in frames per second.
pub const MAX_FRAME_RATE: u32 = 60;

/// Minimum number of send periods covered by the look-ahead.
const MIN_SEND_PERIODS_AHEAD: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    NoConnections,
    UnknownPeer(PlayerId),
    /// An event turned up for a frame that is already gone.
    Desync { frame: FrameNo, event_frame: FrameNo },
    Network(NetworkError),
    Transfer(TransferError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::NoConnections => write!(f, "no connections could be created"),
            SessionError::UnknownPeer(player) => write!(f, "unknown peer {}", player),
            SessionError::Desync { frame, event_frame } => {
                write!(f, "desync: event for frame {} pulled at frame {}", event_frame, frame)
            }
            SessionError::Network(error) => write!(f, "network error: {}", error),
            SessionError::Transfer(error) => write!(f, "transfer error: {}", error),
        }
    }
}

impl From<NetworkError> for SessionError {
    #[inline]
    fn from(error: NetworkError) -> SessionError {
        SessionError::Network(error)
    }
}

impl From<TransferError> for SessionError {
    #[inline]
    fn from(error: TransferError) -> SessionError {
        SessionError::Transfer(error)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum GameType {
    None,
    Modem,
    NullModem,
    Lan,
    Internet,
    Skirmish,
    Ten,
    Mpath,
}

impl GameType {
    #[inline]
    pub fn min_max_ahead(self) -> u32 {
        match self {
            GameType::Modem | GameType::NullModem | GameType::Ten | GameType::Mpath => MODEM_MIN_MAX_AHEAD,
            _ => NETWORK_MIN_MAX_AHEAD,
        }
    }

    /// Whether the connection response time is measured and used to adjust the look-ahead.
    #[inline]
    pub fn measures_response_time(self) -> bool {
        match self {
            GameType::Ten | GameType::Mpath => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub game_type: GameType,
    pub player_id: PlayerId,
    pub player_name: String,
    pub game_name: String,
    /// Whether this machine hosts the game and answers discovery and join requests.
    pub host: bool,
    pub version: u16,
    pub max_players: usize,
    pub max_ahead: u32,
    pub frame_send_rate: u32,
    pub desired_frame_rate: u32,
}

impl Default for SessionSettings {
    fn default() -> SessionSettings {
        SessionSettings {
            game_type: GameType::Lan,
            player_id: 0,
            player_name: "commander".to_owned(),
            game_name: "skirmish".to_owned(),
            host: false,
            version: 1,
            max_players: 8,
            max_ahead: 6,
            frame_send_rate: 3,
            desired_frame_rate: MAX_FRAME_RATE,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PeerState {
    Discovered,
    Connecting,
    Active,
    TimedOut,
    SignedOff,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PlayerId,
    pub name: String,
    pub address: Address,
    pub state: PeerState,
    connection: Option<ConnectionId>,
    // Encoded event packets the connection had no room for yet
    backlog: VecDeque<Vec<u8>>,
}

impl Peer {
    #[inline]
    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Number of event packets waiting for room in the send queue.
    #[inline]
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }
}

/// A peer known from the lobby or the configuration.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PeerInfo {
    pub id: PlayerId,
    pub name: String,
    pub address: Address,
}

/// A game announced by its host on the global channel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GameInfo {
    pub name: String,
    pub version: u16,
    pub open: bool,
}

pub struct Session<T: Transport> {
    settings: SessionSettings,
    transfer_settings: TransferSettings,
    manager: ConnectionManager<T>,

    peers: Vec<Peer>,
    games: HashMap<Address, GameInfo>,
    joined: Option<PlayerId>,
    rejection: Option<JoinRejection>,

    now: Tick,
    frame: FrameNo,
    max_ahead: u32,
    frame_send_rate: u32,
    desired_frame_rate: u32,
    // Look-ahead of a timing event that was queued but not executed yet
    pending_max_ahead: Option<u32>,

    outbound: PayloadBatch<Event>,
    // Received events not yet scheduled
    arrivals: Vec<Event>,
    inbound: BTreeMap<FrameNo, Vec<Event>>,
    last_pulled: Option<FrameNo>,
    window: Option<(FrameNo, FrameNo)>,

    response_times: HashMap<PlayerId, u16>,
    process_times: HashMap<PlayerId, u16>,
    control: Vec<(PlayerId, Packet)>,
    send_overflows: u64,

    scenario: Option<(String, Vec<u8>)>,
    senders: Vec<(PlayerId, ScenarioSender)>,
    receiver: Option<(PlayerId, ScenarioReceiver)>,
    receive_error: Option<TransferError>,

    log: Logger,
}

impl<T: Transport> Session<T> {
    pub fn new(
        transport: T,
        manager: ManagerSettings,
        settings: SessionSettings,
        transfer_settings: TransferSettings,
        log: &Logger,
    ) -> Session<T> {
        let log = log.new(o!("player" => settings.player_id));

        Session {
            manager: ConnectionManager::new(transport, manager, &log),
            transfer_settings,
            peers: Vec::new(),
            games: HashMap::new(),
            joined: None,
            rejection: None,
            now: 0,
            frame: 0,
            max_ahead: settings.max_ahead,
            frame_send_rate: settings.frame_send_rate,
            desired_frame_rate: settings.desired_frame_rate,
            pending_max_ahead: None,
            outbound: PayloadBatch::new(),
            arrivals: Vec::new(),
            inbound: BTreeMap::new(),
            last_pulled: None,
            window: None,
            response_times: HashMap::new(),
            process_times: HashMap::new(),
            control: Vec::new(),
            send_overflows: 0,
            scenario: None,
            senders: Vec::new(),
            receiver: None,
            receive_error: None,
            settings,
            log,
        }
    }

    #[inline]
    pub fn open(&mut self) -> Result<(), SessionError> {
        self.manager.open()?;
        Ok(())
    }

    #[inline]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    #[inline]
    pub fn manager(&self) -> &ConnectionManager<T> {
        &self.manager
    }

    /// Access to the transport, e.g. to block until a datagram arrives.
    #[inline]
    pub fn transport_mut(&mut self) -> &mut T {
        self.manager.transport_mut()
    }

    #[inline]
    pub fn local_address(&self) -> Address {
        self.manager.local_address()
    }

    #[inline]
    pub fn player_id(&self) -> PlayerId {
        self.settings.player_id
    }

    #[inline]
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    #[inline]
    pub fn peer(&self, player: PlayerId) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.id == player)
    }

    #[inline]
    pub fn games(&self) -> &HashMap<Address, GameInfo> {
        &self.games
    }

    /// Player id assigned by the host after a successful join.
    #[inline]
    pub fn joined(&self) -> Option<PlayerId> {
        self.joined
    }

    #[inline]
    pub fn rejection(&self) -> Option<JoinRejection> {
        self.rejection
    }

    #[inline]
    pub fn frame(&self) -> FrameNo {
        self.frame
    }

    #[inline]
    pub fn set_frame(&mut self, frame: FrameNo) {
        self.frame = frame;
    }

    #[inline]
    pub fn max_ahead(&self) -> u32 {
        self.max_ahead
    }

    #[inline]
    pub fn frame_send_rate(&self) -> u32 {
        self.frame_send_rate
    }

    #[inline]
    pub fn desired_frame_rate(&self) -> u32 {
        self.desired_frame_rate
    }

    /// Frames between the execution of the last look-ahead increase and the first frame events
    /// generated under the new look-ahead can land on.
    #[inline]
    pub fn window(&self) -> Option<(FrameNo, FrameNo)> {
        self.window
    }

    /// Number of events scheduled and not yet pulled.
    #[inline]
    pub fn inbound_len(&self) -> usize {
        self.inbound.values().map(Vec::len).sum::<usize>() + self.arrivals.len()
    }

    /// Number of locally generated events waiting for the next flush.
    #[inline]
    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Number of times an event packet found a peer's send queue full.
    #[inline]
    pub fn send_overflows(&self) -> u64 {
        self.send_overflows
    }

    /// Takes the control packets the session does not handle itself (chat, game options...).
    #[inline]
    pub fn take_control(&mut self) -> Vec<(PlayerId, Packet)> {
        mem::replace(&mut self.control, Vec::new())
    }

    /// Response times in ticks: the latest reports of every peer and the local measurement.
    pub fn response_times(&self) -> Vec<Tick> {
        self.response_times
            .values()
            .map(|&ticks| Tick::from(ticks))
            .chain(self.manager.response_time())
            .collect()
    }

    /// Creates a private connection to every supplied peer and to every peer discovered through a
    /// join request, and greets each of them. Returns the number of connections created.
    pub fn create_connections(&mut self, peers: &[PeerInfo]) -> Result<usize, SessionError> {
        for info in peers {
            if self.peer(info.id).is_none() {
                self.peers.push(Peer {
                    id: info.id,
                    name: info.name.clone(),
                    address: info.address,
                    state: PeerState::Discovered,
                    connection: None,
                    backlog: VecDeque::new(),
                });
            }
        }

        let connect = Packet::Connect {
            player: self.settings.player_id,
            name: self.settings.player_name.clone(),
            version: self.settings.version,
        }
        .encode()?;

        let mut created = 0;

        for peer in self.peers.iter_mut() {
            if peer.state != PeerState::Discovered {
                continue;
            }

            let result = match self.manager.create_connection(peer.id, &peer.name, peer.address) {
                Ok(connection) => {
                    peer.connection = Some(connection);
                    self.manager.send_private(connection, &connect, true)
                }
                Err(error) => Err(error),
            };

            match result {
                Ok(()) => {
                    peer.state = PeerState::Connecting;
                    created += 1;
                    info!(self.log, "Connecting"; "peer" => peer.id, "name" => &peer.name, "address" => %peer.address);
                }
                Err(error) => warn!(self.log, "Connection failed"; "peer" => peer.id, "error" => %error),
            }
        }

        if created == 0 {
            return Err(SessionError::NoConnections);
        }

        Ok(created)
    }

    /// Broadcasts a discovery query. Hosts answer with `AnswerGame`.
    #[inline]
    pub fn query_games(&mut self) -> Result<(), SessionError> {
        self.manager.send_global(&Packet::QueryGame.encode()?, None)?;
        Ok(())
    }

    /// Asks the host at `address` to join its game.
    pub fn join_game(&mut self, address: Address) -> Result<(), SessionError> {
        let packet = Packet::QueryJoin {
            name: self.settings.player_name.clone(),
            version: self.settings.version,
            house: 0,
            color: 0,
        };

        self.manager.send_global(&packet.encode()?, Some(address))?;
        Ok(())
    }

    /// Schedules a locally generated event `max_ahead` frames ahead and stages it for the peers.
    /// Returns the frame it executes on.
    pub fn queue_local_event(&mut self, kind: EventKind) -> FrameNo {
        let event = Event::new(self.settings.player_id, self.frame + self.max_ahead, kind);
        let frame = event.frame;

        self.schedule(event.clone());
        self.outbound.push(event);
        frame
    }

    /// Sends the staged events to every active peer in as few packets as possible. Packets a full
    /// send queue cannot take wait in the peer's backlog. A peer whose connection failed is dropped.
    /// Returns the number of packets produced. The staged events are kept when encoding fails.
    pub fn flush_outbound(&mut self) -> Result<usize, SessionError> {
        let mut staged: PayloadBatch<Event> = self.outbound.iter().cloned().collect::<Vec<_>>().into();

        let mut packets = Vec::new();
        while !staged.is_empty() {
            packets.push(Packet::encode_events(&mut staged)?);
        }

        self.outbound = PayloadBatch::new();

        for peer in self.peers.iter_mut() {
            if peer.state == PeerState::Active {
                peer.backlog.extend(packets.iter().cloned());
            }
        }

        self.drain_backlogs();
        Ok(packets.len())
    }

    /// Flushes the staged events when `frame` starts a send period.
    #[inline]
    pub fn process_send_period(&mut self, frame: FrameNo) -> Result<usize, SessionError> {
        if self.frame_send_rate > 1 && frame % self.frame_send_rate != 0 {
            return Ok(0);
        }

        self.flush_outbound()
    }

    /// Returns the events executing on `frame`, ordered by player. Received events are scheduled
    /// first. Events for frames that are already gone are a desync.
    pub fn pull_inbound(&mut self, frame: FrameNo) -> Result<Vec<Event>, SessionError> {
        self.frame = frame;
        self.receive_private();

        for event in mem::replace(&mut self.arrivals, Vec::new()) {
            let event = self.reschedule(event);
            let pulled = self.last_pulled.map_or(false, |pulled| event.frame <= pulled);

            if event.frame < frame || pulled {
                warn!(self.log, "Event arrived too late"; "frame" => frame, "event_frame" => event.frame, "player" => event.player);
                return Err(SessionError::Desync {
                    frame,
                    event_frame: event.frame,
                });
            }

            self.inbound.entry(event.frame).or_insert_with(Vec::new).push(event);
        }

        if let Some((&event_frame, _)) = self.inbound.range(..frame).next() {
            warn!(self.log, "Event frame skipped"; "frame" => frame, "event_frame" => event_frame);
            return Err(SessionError::Desync { frame, event_frame });
        }

        let mut events = self.inbound.remove(&frame).unwrap_or_default();
        events.sort_by_key(|event| event.player);
        self.last_pulled = Some(frame);

        if let Some((_, end)) = self.window {
            if frame >= end {
                self.window = None;
            }
        }

        for event in events.iter() {
            match event.kind {
                EventKind::Timing {
                    desired_frame_rate,
                    max_ahead,
                } => self.apply_timing(frame, u32::from(desired_frame_rate), u32::from(max_ahead)),
                EventKind::ResponseTime { ticks } => {
                    self.response_times.insert(event.player, ticks);
                }
                EventKind::ProcessTime { average_ticks } => {
                    self.process_times.insert(event.player, average_ticks);
                }
                _ => (),
            }
        }

        Ok(events)
    }

    /// Works out the look-ahead the slowest response time needs. When it exceeds the current one a
    /// timing event is queued, so every peer switches over on the same frame. The connection retry
    /// timing always follows the measured response time.
    pub fn negotiate_max_ahead(&mut self, response_times: &[Tick]) -> Option<u32> {
        if !self.settings.game_type.measures_response_time() {
            return None;
        }

        let response_time = *response_times.iter().max()?;

        let retry_delta = response_time.saturating_add(10);
        let timeout = choose!(self.settings.game_type == GameType::Internet =>
            retry_delta.saturating_mul(8).saturating_add(15),
            response_time.saturating_mul(4).saturating_add(15));

        self.manager.set_timing(Timing {
            retry_delta,
            max_retries: None,
            timeout,
        });

        let desired_frame_rate = self.negotiated_frame_rate();
        let send_rate = self.frame_send_rate.max(1);

        let limit = u32::from(u16::max_value());
        let needed = response_time.saturating_mul(Tick::from(desired_frame_rate)).saturating_add(119) / 120;
        let needed = u32::try_from(needed).unwrap_or(limit).min(limit);
        let max_ahead = round_up(needed, send_rate)
            .max(self.settings.game_type.min_max_ahead())
            .max(MIN_SEND_PERIODS_AHEAD.saturating_mul(send_rate))
            .min(limit);

        let current = self.pending_max_ahead.unwrap_or(0).max(self.max_ahead);
        if max_ahead <= current {
            return None;
        }

        info!(self.log, "Raising look-ahead"; "max_ahead" => max_ahead, "response_time" => response_time);

        self.pending_max_ahead = Some(max_ahead);
        self.queue_local_event(EventKind::Timing {
            desired_frame_rate: u16::try_from(desired_frame_rate).unwrap_or(u16::max_value()),
            max_ahead: u16::try_from(max_ahead).unwrap_or(u16::max_value()),
        });

        Some(max_ahead)
    }

    /// Shares the local response time measurement with the peers.
    pub fn report_response_time(&mut self) -> Option<Tick> {
        let response_time = self.manager.response_time()?;

        self.queue_local_event(EventKind::ResponseTime {
            ticks: u16::try_from(response_time).unwrap_or(u16::max_value()),
        });

        Some(response_time)
    }

    /// Shares the average number of ticks the local machine needs for a frame.
    #[inline]
    pub fn report_process_time(&mut self, average_ticks: u16) {
        self.queue_local_event(EventKind::ProcessTime { average_ticks });
    }

    /// Sends a reliable ping to every active peer to gather response time samples.
    pub fn ping_peers(&mut self) -> Result<(), SessionError> {
        let packet = Packet::Ping { sent: self.now }.encode()?;
        self.send_active(&packet, true);
        Ok(())
    }

    pub fn send_message(&mut self, text: &str) -> Result<(), SessionError> {
        let packet = Packet::Message {
            name: self.settings.player_name.clone(),
            text: text.to_owned(),
        }
        .encode()?;

        self.send_active(&packet, true);
        Ok(())
    }

    /// Drives the connections, turns connection changes into peer state transitions, answers
    /// global queries and advances file transfers. Call once per tick.
    pub fn service(&mut self, now: Tick) -> Result<(), SessionError> {
        self.now = now;
        self.manager.service(now)?;

        let changes: Vec<_> = self.manager.changes().collect();

        for change in changes {
            match change {
                ConnectionChange::Established(connection) => {
                    if let Some(peer) = self
                        .peers
                        .iter_mut()
                        .find(|peer| peer.connection == Some(connection))
                    {
                        if peer.state == PeerState::Connecting {
                            peer.state = PeerState::Active;
                            info!(self.log, "Peer active"; "peer" => peer.id, "name" => &peer.name);
                        }
                    }
                }
                ConnectionChange::Failed(connection) => {
                    if let Some(index) = self.peers.iter().position(|peer| peer.connection == Some(connection)) {
                        self.drop_peer(index, PeerState::TimedOut);
                    }
                }
                ConnectionChange::Undeliverable(address) => {
                    debug!(self.log, "Global packet undeliverable"; "address" => %address);
                }
            }
        }

        self.drain_backlogs();
        self.receive_global();
        self.receive_private();
        self.service_senders();

        Ok(())
    }

    /// Tells every peer this machine is leaving and closes all connections.
    pub fn sign_off(&mut self, now: Tick) -> Result<(), SessionError> {
        let packet = Packet::SignOff {
            name: self.settings.player_name.clone(),
        }
        .encode()?;

        self.send_active(&packet, false);
        self.manager.service(now)?;

        for index in 0..self.peers.len() {
            if self.peers[index].connection.is_some() {
                self.drop_peer(index, PeerState::SignedOff);
            }
        }

        self.manager.close();
        info!(self.log, "Signed off");
        Ok(())
    }

    /// Makes a scenario available to players requesting it.
    #[inline]
    pub fn set_scenario(&mut self, name: &str, data: Vec<u8>) {
        self.scenario = Some((name.to_owned(), data));
    }

    /// Asks the host for its scenario. Progress is driven by `receive_scenario_file`.
    pub fn request_scenario_file(&mut self, host: PlayerId) -> Result<(), SessionError> {
        let connection = self.active_connection(host)?;

        self.manager
            .send_private(connection, &Packet::RequestScenario.encode()?, true)?;
        self.receiver = Some((host, ScenarioReceiver::new(self.now, self.transfer_settings.response_timeout)));
        self.receive_error = None;

        info!(self.log, "Scenario requested"; "host" => host);
        Ok(())
    }

    /// Starts sending the scenario to the player, or tells it there is none.
    pub fn send_scenario_file(&mut self, player: PlayerId) -> Result<(), SessionError> {
        let connection = self.active_connection(player)?;

        match &self.scenario {
            Some((name, data)) => {
                let sender = ScenarioSender::new(name, data.clone(), self.transfer_settings.response_timeout);
                info!(self.log, "Sending scenario"; "player" => player, "name" => name, "chunks" => sender.chunk_count());

                self.senders.retain(|(existing, _)| *existing != player);
                self.senders.push((player, sender));
            }
            None => {
                debug!(self.log, "No scenario to send"; "player" => player);
                self.manager
                    .send_private(connection, &Packet::NoScenario.encode()?, true)?;
            }
        }

        Ok(())
    }

    /// Advances the download. Returns the name the scenario was stored under once it completed.
    pub fn receive_scenario_file<S: FileStore>(&mut self, store: &mut S) -> Result<Option<String>, SessionError> {
        if let Some(error) = self.receive_error.take() {
            self.receiver = None;
            return Err(error.into());
        }

        let (host, status) = match self.receiver.as_mut() {
            Some((host, receiver)) => (*host, receiver.tick(self.now)),
            None => return Err(TransferError::Incomplete.into()),
        };

        match status {
            Ok(TransferStatus::InProgress) => Ok(None),
            Ok(TransferStatus::Complete) => {
                let stored = match self.receiver.take() {
                    Some((_, mut receiver)) => receiver.finish(store)?,
                    None => return Err(TransferError::Incomplete.into()),
                };

                let connection = self.active_connection(host)?;
                self.manager
                    .send_private(connection, &Packet::ReadyToGo.encode()?, true)?;

                info!(self.log, "Scenario received"; "host" => host, "name" => &stored);
                Ok(Some(stored))
            }
            Err(error) => {
                warn!(self.log, "Scenario download failed"; "host" => host, "error" => %error);
                self.receiver = None;
                Err(error.into())
            }
        }
    }

    /// Bytes received and total length of the current download.
    #[inline]
    pub fn transfer_progress(&self) -> Option<(usize, usize)> {
        self.receiver.as_ref().map(|(_, receiver)| receiver.progress())
    }

    /// Number of scenario uploads in progress.
    #[inline]
    pub fn uploads(&self) -> usize {
        self.senders.len()
    }

    /// Aborts every transfer in progress, discarding partial data.
    pub fn cancel_transfer(&mut self) {
        if let Some((_, receiver)) = self.receiver.as_mut() {
            receiver.cancel();
        }

        for (_, sender) in self.senders.iter_mut() {
            sender.cancel();
        }
    }

    fn active_connection(&self, player: PlayerId) -> Result<ConnectionId, SessionError> {
        match self.peer(player) {
            Some(Peer {
                state: PeerState::Active,
                connection: Some(connection),
                ..
            }) => Ok(*connection),
            _ => Err(SessionError::UnknownPeer(player)),
        }
    }

    fn send_active(&mut self, packet: &[u8], ack: bool) {
        for peer in self.peers.iter() {
            if let (PeerState::Active, Some(connection)) = (peer.state, peer.connection) {
                if let Err(error) = self.manager.send_private(connection, packet, ack) {
                    warn!(self.log, "Send failed"; "peer" => peer.id, "error" => %error);
                }
            }
        }
    }

    /// Hands backlogged event packets to the connections, oldest first, until a send queue is full.
    fn drain_backlogs(&mut self) {
        for index in 0..self.peers.len() {
            let connection = match (self.peers[index].state, self.peers[index].connection) {
                (PeerState::Active, Some(connection)) => connection,
                _ => continue,
            };

            let mut failed = None;

            while let Some(packet) = self.peers[index].backlog.front() {
                match self.manager.send_private(connection, packet, true) {
                    Ok(()) => {
                        self.peers[index].backlog.pop_front();
                    }
                    Err(NetworkError::Wait) => {
                        self.send_overflows += 1;
                        trace!(self.log, "Send queue full"; "peer" => self.peers[index].id, "backlog" => self.peers[index].backlog.len());
                        break;
                    }
                    Err(error) => {
                        failed = Some(error);
                        break;
                    }
                }
            }

            if let Some(error) = failed {
                warn!(self.log, "Peer refused events"; "peer" => self.peers[index].id, "error" => %error);
                self.drop_peer(index, PeerState::TimedOut);
            }
        }
    }

    fn drop_peer(&mut self, index: usize, state: PeerState) {
        let peer = &mut self.peers[index];
        peer.backlog.clear();

        if let Some(connection) = peer.connection.take() {
            self.manager.delete_connection(connection);
        }

        peer.state = state;
        self.senders.retain(|(player, _)| *player != peer.id);

        info!(self.log, "Peer gone"; "peer" => peer.id, "state" => ?state);
    }

    /// Rate the game can run at given the slowest reported machine.
    fn negotiated_frame_rate(&self) -> u32 {
        let slowest = self.process_times.values().copied().max().unwrap_or(0);

        let rate = match slowest {
            0 => MAX_FRAME_RATE,
            ticks => MAX_FRAME_RATE / u32::from(ticks),
        };

        match self.settings.desired_frame_rate {
            0 => rate,
            desired => rate.min(desired),
        }
        .max(1)
    }

    fn apply_timing(&mut self, frame: FrameNo, desired_frame_rate: u32, max_ahead: u32) {
        if max_ahead > self.max_ahead {
            let end = frame + max_ahead;
            self.window = Some((frame, end));

            let frames: Vec<FrameNo> = self.inbound.range(frame + 1..end).map(|(&frame, _)| frame).collect();
            let mut moved = Vec::new();

            for queued in frames {
                let events = match self.inbound.remove(&queued) {
                    Some(events) => events,
                    None => continue,
                };

                let (kept, shifted): (Vec<_>, Vec<_>) = events.into_iter().partition(Self::pinned);

                if !kept.is_empty() {
                    self.inbound.insert(queued, kept);
                }

                moved.extend(shifted.into_iter().map(|mut event| {
                    event.frame = end;
                    event
                }));
            }

            if !moved.is_empty() {
                debug!(self.log, "Events rescheduled"; "count" => moved.len(), "frame" => end);

                let bucket = self.inbound.entry(end).or_insert_with(Vec::new);
                moved.append(bucket);
                *bucket = moved;
            }
        }

        info!(self.log, "Timing changed"; "frame" => frame, "max_ahead" => max_ahead, "frame_rate" => desired_frame_rate);

        self.max_ahead = max_ahead;
        self.desired_frame_rate = desired_frame_rate;

        if self.pending_max_ahead.map_or(false, |pending| pending <= max_ahead) {
            self.pending_max_ahead = None;
        }
    }

    /// Events that keep their frame when the look-ahead changes.
    #[inline]
    fn pinned(event: &Event) -> bool {
        match event.kind {
            EventKind::FrameInfo { .. } => true,
            _ => false,
        }
    }

    /// Moves events landing inside the vulnerability window to its end.
    #[inline]
    fn reschedule(&self, mut event: Event) -> Event {
        if let Some((start, end)) = self.window {
            if event.frame > start && event.frame < end && !Self::pinned(&event) {
                trace!(self.log, "Event rescheduled"; "frame" => event.frame, "new_frame" => end);
                event.frame = end;
            }
        }

        event
    }

    fn schedule(&mut self, event: Event) {
        let event = self.reschedule(event);
        self.inbound.entry(event.frame).or_insert_with(Vec::new).push(event);
    }

    fn receive_global(&mut self) {
        while let Some((address, payload)) = self.manager.get_global() {
            let packet = match Packet::decode(&payload) {
                Ok(packet) => packet,
                Err(error) => {
                    debug!(self.log, "Undecodable global packet"; "address" => %address, "error" => %error);
                    continue;
                }
            };

            let result = match packet {
                Packet::QueryGame if self.settings.host => {
                    let answer = Packet::AnswerGame {
                        name: self.settings.game_name.clone(),
                        version: self.settings.version,
                        open: self.peers.len() + 1 < self.settings.max_players,
                    };

                    answer
                        .encode()
                        .and_then(|answer| self.manager.send_global(&answer, Some(address)))
                }
                Packet::AnswerGame { name, version, open } => {
                    debug!(self.log, "Game found"; "name" => &name, "address" => %address);
                    self.games.insert(address, GameInfo { name, version, open });
                    Ok(())
                }
                Packet::QueryJoin { name, version, .. } if self.settings.host => self.answer_join(address, name, version),
                Packet::ConfirmJoin { player } => {
                    info!(self.log, "Joined game"; "player" => player, "address" => %address);
                    self.joined = Some(player);
                    self.settings.player_id = player;
                    Ok(())
                }
                Packet::RejectJoin { reason } => {
                    info!(self.log, "Join rejected"; "reason" => ?reason);
                    self.rejection = Some(reason);
                    Ok(())
                }
                packet => {
                    trace!(self.log, "Global packet ignored"; "tag" => packet.tag(), "address" => %address);
                    Ok(())
                }
            };

            if let Err(error) = result {
                warn!(self.log, "Global reply failed"; "address" => %address, "error" => %error);
            }
        }
    }

    fn answer_join(&mut self, address: Address, name: String, version: u16) -> Result<(), NetworkError> {
        let existing = self.peers.iter().find(|peer| peer.address == address).map(|peer| peer.id);

        let duplicate = name == self.settings.player_name
            || self.peers.iter().any(|peer| peer.name == name && peer.address != address);

        let rejection = if version < self.settings.version {
            Some(JoinRejection::VersionTooOld)
        } else if version > self.settings.version {
            Some(JoinRejection::VersionTooNew)
        } else if duplicate {
            Some(JoinRejection::DuplicateName)
        } else if existing.is_none() && self.peers.len() + 1 >= self.settings.max_players {
            Some(JoinRejection::GameFull)
        } else {
            None
        };

        let player = existing.or_else(|| {
            (0..=PlayerId::max_value())
                .find(|&id| id != self.settings.player_id && self.peer(id).is_none())
        });

        let reply = match (rejection, player) {
            (Some(reason), _) => Packet::RejectJoin { reason },
            (None, None) => Packet::RejectJoin {
                reason: JoinRejection::GameFull,
            },
            (None, Some(player)) => {
                if existing.is_none() {
                    info!(self.log, "Player joined"; "player" => player, "name" => &name, "address" => %address);
                    self.peers.push(Peer {
                        id: player,
                        name,
                        address,
                        state: PeerState::Discovered,
                        connection: None,
                        backlog: VecDeque::new(),
                    });
                }

                Packet::ConfirmJoin { player }
            }
        };

        self.manager.send_global(&reply.encode()?, Some(address))
    }

    fn receive_private(&mut self) {
        for index in 0..self.peers.len() {
            let (player, connection) = match (self.peers[index].state, self.peers[index].connection) {
                (PeerState::Active, Some(connection)) => (self.peers[index].id, connection),
                _ => continue,
            };

            while let Some(payload) = self.manager.get_private(connection) {
                match Packet::decode(&payload) {
                    Ok(packet) => self.dispatch(index, player, packet),
                    Err(error) => debug!(self.log, "Undecodable packet"; "peer" => player, "error" => %error),
                }

                if self.peers[index].state != PeerState::Active {
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, index: usize, player: PlayerId, packet: Packet) {
        match packet {
            Packet::Events(events) => self.arrivals.extend(events),
            Packet::Connect { name, version, .. } => {
                if version != self.settings.version {
                    warn!(self.log, "Protocol version differs"; "peer" => player, "version" => version);
                }
                self.peers[index].name = name;
            }
            Packet::SignOff { .. } => self.drop_peer(index, PeerState::SignedOff),
            // The look-ahead only changes through the Timing event, on the same frame everywhere
            Packet::Timing {
                max_ahead,
                response_time,
                ..
            } => {
                debug!(self.log, "Timing received"; "peer" => player, "max_ahead" => max_ahead, "response_time" => response_time);
                self.response_times.insert(player, response_time);
            }
            Packet::Go {
                max_ahead,
                frame_send_rate,
                seed,
            } => {
                if self.last_pulled.is_none() {
                    self.max_ahead = u32::from(max_ahead);
                    self.frame_send_rate = u32::from(frame_send_rate);
                } else {
                    warn!(self.log, "Go received after start"; "peer" => player, "frame" => self.frame);
                }

                self.control.push((
                    player,
                    Packet::Go {
                        max_ahead,
                        frame_send_rate,
                        seed,
                    },
                ));
            }
            Packet::Ping { sent } => trace!(self.log, "Ping"; "peer" => player, "sent" => sent),
            Packet::RequestScenario => {
                if let Err(error) = self.send_scenario_file(player) {
                    warn!(self.log, "Scenario request failed"; "peer" => player, "error" => %error);
                }
            }
            Packet::ReadyToGo => {
                let consumed = self
                    .senders
                    .iter_mut()
                    .filter(|(requester, _)| *requester == player)
                    .any(|(_, sender)| sender.handle(&Packet::ReadyToGo));

                if !consumed {
                    self.control.push((player, Packet::ReadyToGo));
                }
            }
            packet @ Packet::FileInfo { .. } | packet @ Packet::FileChunk { .. } | packet @ Packet::NoScenario => {
                let now = self.now;

                match self.receiver.as_mut() {
                    Some((host, receiver)) if *host == player => {
                        if let Err(error) = receiver.handle(packet, now) {
                            self.receive_error = Some(error);
                        }
                    }
                    _ => trace!(self.log, "Unexpected transfer packet"; "peer" => player),
                }
            }
            packet => self.control.push((player, packet)),
        }
    }

    fn service_senders(&mut self) {
        let now = self.now;
        let mut index = 0;

        while index < self.senders.len() {
            let (player, sender) = &mut self.senders[index];
            let player = *player;

            let connection = self
                .peers
                .iter()
                .find(|peer| peer.id == player && peer.state == PeerState::Active)
                .and_then(Peer::connection);

            let mut result = match connection {
                Some(_) => sender.tick(now),
                None => Err(TransferError::Network(NetworkError::Wait)),
            };

            if let (Some(connection), Ok(TransferStatus::InProgress)) = (connection, &result) {
                while let Some(packet) = sender.pending() {
                    let sent = match packet.encode() {
                        Ok(packet) => self.manager.send_private(connection, &packet, true),
                        Err(error) => Err(error),
                    };

                    match sent {
                        Ok(()) => sender.advance(now),
                        Err(NetworkError::Wait) => break,
                        Err(error) => {
                            result = Err(error.into());
                            break;
                        }
                    }
                }
            }

            match result {
                Ok(TransferStatus::InProgress) => index += 1,
                Ok(TransferStatus::Complete) => {
                    info!(self.log, "Scenario delivered"; "player" => player);
                    self.senders.swap_remove(index);
                }
                Err(error) => {
                    warn!(self.log, "Scenario upload failed"; "player" => player, "error" => %error);
                    self.senders.swap_remove(index);
                }
            }
        }
    }
}
