//! Scenario file transfer. The host answers a `RequestScenario` with a `FileInfo` describing the
//! file followed by numbered `FileChunk`s, the requester reassembles the chunks in order, checks
//! the digest and stores the file. Both sides are tick driven state machines, the session feeds
//! them packets and hands the packets they produce to the connections.

use crate::packet::{Digest, Packet, DIGEST_SIZE, MAX_SEND_FILE_PACKET_SIZE};
use courier::net::support::NetworkError;
use flux::Tick;
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Ticks to wait for the other side before giving up.
pub const RESPONSE_TIMEOUT: Tick = 60 * 60;

/// Name used for downloads that would overwrite an existing file.
pub const TEMP_FILE_NAME: &str = "download.tmp";

#[derive(Debug, Clone, PartialEq)]
pub enum TransferError {
    /// The other side did not respond in time.
    Timeout,
    /// The host does not have a scenario to send.
    Rejected,
    Cancelled,
    DigestMismatch,
    Incomplete,
    Io(io::ErrorKind),
    Network(NetworkError),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransferError::Timeout => write!(f, "peer unavailable"),
            TransferError::Rejected => write!(f, "no scenario available"),
            TransferError::Cancelled => write!(f, "transfer cancelled"),
            TransferError::DigestMismatch => write!(f, "scenario digest mismatch"),
            TransferError::Incomplete => write!(f, "transfer incomplete"),
            TransferError::Io(kind) => write!(f, "io error: {:?}", kind),
            TransferError::Network(error) => write!(f, "network error: {}", error),
        }
    }
}

impl From<io::Error> for TransferError {
    #[inline]
    fn from(error: io::Error) -> TransferError {
        TransferError::Io(error.kind())
    }
}

impl From<NetworkError> for TransferError {
    #[inline]
    fn from(error: NetworkError) -> TransferError {
        TransferError::Network(error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    pub response_timeout: Tick,
    /// Directory downloaded scenarios are stored in.
    pub download_dir: String,
}

impl Default for TransferSettings {
    fn default() -> TransferSettings {
        TransferSettings {
            response_timeout: RESPONSE_TIMEOUT,
            download_dir: "scenarios".to_owned(),
        }
    }
}

/// Storage the transferred scenarios are read from and written to.
pub trait FileStore {
    fn exists(&self, name: &str) -> bool;
    fn read(&self, name: &str) -> io::Result<Vec<u8>>;
    fn write(&mut self, name: &str, data: &[u8]) -> io::Result<()>;
}

/// Stores files in a single directory. Names containing path components are rejected.
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    #[inline]
    pub fn new<P: AsRef<Path>>(root: P) -> DirectoryStore {
        DirectoryStore {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path(&self, name: &str) -> io::Result<PathBuf> {
        let plain = !name.is_empty() && Path::new(name).file_name().map_or(false, |file| file == name);

        if !plain {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"));
        }

        Ok(self.root.join(name))
    }
}

impl FileStore for DirectoryStore {
    fn exists(&self, name: &str) -> bool {
        self.path(name).map_or(false, |path| path.exists())
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(name)?)
    }

    fn write(&mut self, name: &str, data: &[u8]) -> io::Result<()> {
        let path = self.path(name)?;
        fs::create_dir_all(&self.root)?;
        fs::write(path, data)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    #[inline]
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.files.len()
    }
}

impl FileStore for MemoryStore {
    #[inline]
    fn exists(&self, name: &str) -> bool {
        self.files.contains_key(name)
    }

    fn read(&self, name: &str) -> io::Result<Vec<u8>> {
        self.files
            .get(name)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn write(&mut self, name: &str, data: &[u8]) -> io::Result<()> {
        self.files.insert(name.to_owned(), data.to_vec());
        Ok(())
    }
}

/// SHA-256 digest of the scenario contents.
#[inline]
pub fn digest(data: &[u8]) -> Digest {
    let mut digest = [0; DIGEST_SIZE];
    digest.copy_from_slice(&Sha256::digest(data));
    digest
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ScenarioInfo {
    pub name: String,
    pub length: u32,
    pub digest: Digest,
}

impl ScenarioInfo {
    #[inline]
    pub fn new(name: &str, data: &[u8]) -> ScenarioInfo {
        ScenarioInfo {
            name: name.to_owned(),
            length: data.len() as u32,
            digest: digest(data),
        }
    }

    #[inline]
    pub fn packet(&self) -> Packet {
        Packet::FileInfo {
            name: self.name.clone(),
            length: self.length,
            digest: self.digest,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransferStatus {
    InProgress,
    Complete,
}

/// Host side of a transfer to one requesting player.
pub struct ScenarioSender {
    info: ScenarioInfo,
    data: Vec<u8>,
    info_sent: bool,
    next_block: u32,
    // Set once everything went out, waiting for ReadyToGo
    deadline: Option<Tick>,
    timeout: Tick,
    complete: bool,
    cancelled: bool,
}

impl ScenarioSender {
    #[inline]
    pub fn new(name: &str, data: Vec<u8>, timeout: Tick) -> ScenarioSender {
        ScenarioSender {
            info: ScenarioInfo::new(name, &data),
            data,
            info_sent: false,
            next_block: 0,
            deadline: None,
            timeout,
            complete: false,
            cancelled: false,
        }
    }

    #[inline]
    pub fn info(&self) -> &ScenarioInfo {
        &self.info
    }

    #[inline]
    pub fn chunk_count(&self) -> u32 {
        ((self.data.len() + MAX_SEND_FILE_PACKET_SIZE - 1) / MAX_SEND_FILE_PACKET_SIZE) as u32
    }

    /// Bytes handed out so far and the total length.
    #[inline]
    pub fn progress(&self) -> (usize, usize) {
        let sent = (self.next_block as usize * MAX_SEND_FILE_PACKET_SIZE).min(self.data.len());
        (sent, self.data.len())
    }

    /// The next packet to transmit. Stays the same until `advance` is called.
    pub fn pending(&self) -> Option<Packet> {
        if self.cancelled {
            return None;
        }

        if !self.info_sent {
            return Some(self.info.packet());
        }

        if self.next_block >= self.chunk_count() {
            return None;
        }

        let start = self.next_block as usize * MAX_SEND_FILE_PACKET_SIZE;
        let end = (start + MAX_SEND_FILE_PACKET_SIZE).min(self.data.len());

        Some(Packet::FileChunk {
            block: self.next_block,
            data: self.data[start..end].to_vec(),
        })
    }

    /// Marks the pending packet as handed to the connection.
    pub fn advance(&mut self, now: Tick) {
        if !self.info_sent {
            self.info_sent = true;
        } else if self.next_block < self.chunk_count() {
            self.next_block += 1;
        }

        if self.pending().is_none() && self.deadline.is_none() {
            self.deadline = Some(now + self.timeout);
        }
    }

    /// Feeds a packet from the requesting player. Returns whether it was consumed.
    #[inline]
    pub fn handle(&mut self, packet: &Packet) -> bool {
        match packet {
            Packet::ReadyToGo => {
                self.complete = true;
                true
            }
            _ => false,
        }
    }

    #[inline]
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn tick(&mut self, now: Tick) -> Result<TransferStatus, TransferError> {
        if self.cancelled {
            return Err(TransferError::Cancelled);
        }

        if self.complete {
            return Ok(TransferStatus::Complete);
        }

        match self.deadline {
            Some(deadline) if now >= deadline => Err(TransferError::Timeout),
            _ => Ok(TransferStatus::InProgress),
        }
    }
}

enum ReceiverState {
    AwaitingInfo,
    Receiving {
        info: ScenarioInfo,
        data: Vec<u8>,
        next_block: u32,
    },
    Complete {
        info: ScenarioInfo,
        data: Vec<u8>,
    },
}

/// Requester side of a transfer. Only accepts chunks in block order, duplicates and blocks that
/// arrive early are dropped and left to the reliable connection to deliver again.
pub struct ScenarioReceiver {
    state: ReceiverState,
    deadline: Tick,
    timeout: Tick,
    cancelled: bool,
}

impl ScenarioReceiver {
    #[inline]
    pub fn new(now: Tick, timeout: Tick) -> ScenarioReceiver {
        ScenarioReceiver {
            state: ReceiverState::AwaitingInfo,
            deadline: now + timeout,
            timeout,
            cancelled: false,
        }
    }

    #[inline]
    pub fn info(&self) -> Option<&ScenarioInfo> {
        match &self.state {
            ReceiverState::AwaitingInfo => None,
            ReceiverState::Receiving { info, .. } | ReceiverState::Complete { info, .. } => Some(info),
        }
    }

    /// Bytes received so far and the announced length.
    #[inline]
    pub fn progress(&self) -> (usize, usize) {
        match &self.state {
            ReceiverState::AwaitingInfo => (0, 0),
            ReceiverState::Receiving { info, data, .. } | ReceiverState::Complete { info, data } => {
                (data.len(), info.length as usize)
            }
        }
    }

    #[inline]
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.state = ReceiverState::AwaitingInfo;
    }

    /// Feeds a packet from the host. Returns whether the packet advanced the transfer.
    pub fn handle(&mut self, packet: Packet, now: Tick) -> Result<bool, TransferError> {
        if self.cancelled {
            return Err(TransferError::Cancelled);
        }

        let state = std::mem::replace(&mut self.state, ReceiverState::AwaitingInfo);

        let (state, accepted) = match (state, packet) {
            (ReceiverState::AwaitingInfo, Packet::NoScenario) => return Err(TransferError::Rejected),
            (ReceiverState::AwaitingInfo, Packet::FileInfo { name, length, digest }) => {
                let info = ScenarioInfo { name, length, digest };
                let data = Vec::with_capacity(length as usize);
                (Self::check(info, data, 0)?, true)
            }
            (
                ReceiverState::Receiving {
                    info,
                    mut data,
                    next_block,
                },
                Packet::FileChunk { block, data: chunk },
            ) => {
                if block != next_block {
                    (ReceiverState::Receiving { info, data, next_block }, false)
                } else {
                    data.extend_from_slice(&chunk);
                    (Self::check(info, data, next_block + 1)?, true)
                }
            }
            (state, _) => (state, false),
        };

        if accepted {
            self.deadline = now + self.timeout;
        }

        self.state = state;
        Ok(accepted)
    }

    pub fn tick(&mut self, now: Tick) -> Result<TransferStatus, TransferError> {
        if self.cancelled {
            return Err(TransferError::Cancelled);
        }

        match self.state {
            ReceiverState::Complete { .. } => Ok(TransferStatus::Complete),
            _ if now >= self.deadline => Err(TransferError::Timeout),
            _ => Ok(TransferStatus::InProgress),
        }
    }

    /// Writes the completed file to the store. When a file with the same name already exists the
    /// data goes to `TEMP_FILE_NAME` instead. Returns the name written.
    pub fn finish<S: FileStore>(&mut self, store: &mut S) -> Result<String, TransferError> {
        match &self.state {
            ReceiverState::Complete { info, data } => {
                let name = if store.exists(&info.name) {
                    TEMP_FILE_NAME.to_owned()
                } else {
                    info.name.clone()
                };

                store.write(&name, data)?;
                Ok(name)
            }
            _ => Err(TransferError::Incomplete),
        }
    }

    fn check(info: ScenarioInfo, mut data: Vec<u8>, next_block: u32) -> Result<ReceiverState, TransferError> {
        if data.len() < info.length as usize {
            return Ok(ReceiverState::Receiving { info, data, next_block });
        }

        data.truncate(info.length as usize);

        if digest(&data) != info.digest {
            return Err(TransferError::DigestMismatch);
        }

        Ok(ReceiverState::Complete { info, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    fn scenario(len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        StdRng::seed_from_u64(7).fill_bytes(&mut data);
        data
    }

    fn drain(sender: &mut ScenarioSender) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Some(packet) = sender.pending() {
            packets.push(packet);
            sender.advance(0);
        }
        packets
    }

    #[test]
    fn test_chunking() {
        let mut sender = ScenarioSender::new("scm01ea.ini", scenario(10_000), RESPONSE_TIMEOUT);
        let packets = drain(&mut sender);

        assert_eq!(sender.chunk_count(), 40);
        assert_eq!(packets.len(), 41);
        assert_eq!(packets[0], sender.info().packet());

        let chunks = packets
            .iter()
            .filter(|packet| match packet {
                Packet::FileChunk { .. } => true,
                _ => false,
            })
            .count();
        assert_eq!(chunks, 40);

        match &packets[40] {
            Packet::FileChunk { block, data } => {
                assert_eq!(*block, 39);
                assert_eq!(data.len(), 10_000 - 39 * MAX_SEND_FILE_PACKET_SIZE);
            }
            packet => panic!("unexpected packet {:?}", packet),
        }

        assert_eq!(sender.progress(), (10_000, 10_000));
    }

    #[test]
    fn test_in_order_reassembly() {
        let data = scenario(10_000);
        let mut sender = ScenarioSender::new("scm01ea.ini", data.clone(), RESPONSE_TIMEOUT);
        let mut receiver = ScenarioReceiver::new(0, RESPONSE_TIMEOUT);
        let mut store = MemoryStore::new();

        for packet in drain(&mut sender) {
            assert!(receiver.handle(packet, 1).unwrap());
        }

        assert_eq!(receiver.tick(2).unwrap(), TransferStatus::Complete);
        assert_eq!(receiver.finish(&mut store).unwrap(), "scm01ea.ini");
        assert_eq!(store.get("scm01ea.ini").unwrap(), &data[..]);
    }

    #[test]
    fn test_duplicate_and_delayed_chunks() {
        let data = scenario(10_000);
        let mut sender = ScenarioSender::new("scm01ea.ini", data.clone(), RESPONSE_TIMEOUT);
        let mut receiver = ScenarioReceiver::new(0, RESPONSE_TIMEOUT);
        let mut store = MemoryStore::new();

        let packets = drain(&mut sender);
        let chunk = |block: usize| packets[block + 1].clone();

        receiver.handle(packets[0].clone(), 0).unwrap();
        for block in 0..=5 {
            assert!(receiver.handle(chunk(block), 0).unwrap());
        }

        // Duplicate of 5 and an early 7 while 6 is delayed
        assert!(!receiver.handle(chunk(5), 0).unwrap());
        assert!(!receiver.handle(chunk(7), 0).unwrap());
        assert_eq!(receiver.progress(), (6 * MAX_SEND_FILE_PACKET_SIZE, 10_000));

        for block in 6..40 {
            assert!(receiver.handle(chunk(block), 0).unwrap());
        }

        assert_eq!(receiver.tick(0).unwrap(), TransferStatus::Complete);
        receiver.finish(&mut store).unwrap();
        assert_eq!(store.get("scm01ea.ini").unwrap(), &data[..]);
    }

    #[test]
    fn test_empty_file() {
        let mut sender = ScenarioSender::new("empty.ini", Vec::new(), RESPONSE_TIMEOUT);
        let mut receiver = ScenarioReceiver::new(0, RESPONSE_TIMEOUT);

        let packets = drain(&mut sender);
        assert_eq!(packets.len(), 1);

        receiver.handle(packets[0].clone(), 0).unwrap();
        assert_eq!(receiver.tick(0).unwrap(), TransferStatus::Complete);
    }

    #[test]
    fn test_existing_file_goes_to_temp() {
        let data = scenario(600);
        let mut sender = ScenarioSender::new("scm01ea.ini", data.clone(), RESPONSE_TIMEOUT);
        let mut receiver = ScenarioReceiver::new(0, RESPONSE_TIMEOUT);
        let mut store = MemoryStore::new();
        store.write("scm01ea.ini", b"old").unwrap();

        for packet in drain(&mut sender) {
            receiver.handle(packet, 0).unwrap();
        }

        assert_eq!(receiver.finish(&mut store).unwrap(), TEMP_FILE_NAME);
        assert_eq!(store.get("scm01ea.ini").unwrap(), b"old");
        assert_eq!(store.get(TEMP_FILE_NAME).unwrap(), &data[..]);
    }

    #[test]
    fn test_digest_mismatch() {
        let mut receiver = ScenarioReceiver::new(0, RESPONSE_TIMEOUT);

        receiver
            .handle(
                Packet::FileInfo {
                    name: "scm01ea.ini".to_owned(),
                    length: 3,
                    digest: digest(b"abc"),
                },
                0,
            )
            .unwrap();

        let result = receiver.handle(
            Packet::FileChunk {
                block: 0,
                data: b"abd".to_vec(),
            },
            0,
        );

        assert_eq!(result.unwrap_err(), TransferError::DigestMismatch);
    }

    #[test]
    fn test_response_timeout() {
        let mut receiver = ScenarioReceiver::new(100, 50);

        assert_eq!(receiver.tick(149).unwrap(), TransferStatus::InProgress);
        assert_eq!(receiver.tick(150).unwrap_err(), TransferError::Timeout);
    }

    #[test]
    fn test_chunk_resets_timeout() {
        let data = scenario(1000);
        let mut sender = ScenarioSender::new("scm01ea.ini", data, RESPONSE_TIMEOUT);
        let mut receiver = ScenarioReceiver::new(0, 50);
        let packets = drain(&mut sender);

        receiver.handle(packets[0].clone(), 40).unwrap();
        receiver.handle(packets[1].clone(), 80).unwrap();

        assert_eq!(receiver.tick(129).unwrap(), TransferStatus::InProgress);
        assert_eq!(receiver.tick(130).unwrap_err(), TransferError::Timeout);
    }

    #[test]
    fn test_rejected() {
        let mut receiver = ScenarioReceiver::new(0, RESPONSE_TIMEOUT);

        assert_eq!(
            receiver.handle(Packet::NoScenario, 0).unwrap_err(),
            TransferError::Rejected
        );
    }

    #[test]
    fn test_cancel() {
        let mut sender = ScenarioSender::new("scm01ea.ini", scenario(1000), RESPONSE_TIMEOUT);
        let mut receiver = ScenarioReceiver::new(0, RESPONSE_TIMEOUT);

        receiver.handle(sender.pending().unwrap(), 0).unwrap();
        sender.advance(0);

        sender.cancel();
        receiver.cancel();

        assert_eq!(sender.pending(), None);
        assert_eq!(sender.tick(0).unwrap_err(), TransferError::Cancelled);
        assert_eq!(receiver.tick(0).unwrap_err(), TransferError::Cancelled);
        assert_eq!(receiver.progress(), (0, 0));
        assert_eq!(receiver.finish(&mut MemoryStore::new()).unwrap_err(), TransferError::Incomplete);
    }

    #[test]
    fn test_sender_waits_for_ready() {
        let mut sender = ScenarioSender::new("scm01ea.ini", scenario(300), 10);

        drain(&mut sender);
        assert_eq!(sender.tick(5).unwrap(), TransferStatus::InProgress);
        assert_eq!(sender.tick(10).unwrap_err(), TransferError::Timeout);

        assert!(sender.handle(&Packet::ReadyToGo));
        assert_eq!(sender.tick(11).unwrap(), TransferStatus::Complete);
    }

    #[test]
    fn test_directory_store() {
        let root = std::env::temp_dir().join(format!("gamecore-store-{}", std::process::id()));
        let mut store = DirectoryStore::new(&root);

        assert!(!store.exists("scm01ea.ini"));
        store.write("scm01ea.ini", b"[Basic]").unwrap();
        assert!(store.exists("scm01ea.ini"));
        assert_eq!(store.read("scm01ea.ini").unwrap(), b"[Basic]");

        assert_eq!(
            store.write("../escape.ini", b"x").unwrap_err().kind(),
            io::ErrorKind::InvalidInput
        );

        fs::remove_dir_all(&root).unwrap();
    }
}
