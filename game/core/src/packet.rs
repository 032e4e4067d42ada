use crate::event::{Event, EVENT_MESSAGE_MAX, NAME_MAX};
use crate::wire;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use courier::net::header::MAX_PAYLOAD_SIZE;
use courier::net::support::{
    Deserialize, ErrorType, NetworkError, NetworkResult, PayloadBatch, Serialize, SizedRead, SizedWrite,
};
use flux::{PlayerId, Tick};
use std::io::Cursor;

/// Maximum length of scenario and file names.
pub const FILE_NAME_MAX: usize = 64;

/// Maximum amount of file data carried by a single chunk.
pub const MAX_SEND_FILE_PACKET_SIZE: usize = 256;

/// Size of the SHA-256 scenario digest.
pub const DIGEST_SIZE: usize = 32;

pub type Digest = [u8; DIGEST_SIZE];

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum JoinRejection {
    ByHost,
    DuplicateName,
    GameFull,
    VersionTooOld,
    VersionTooNew,
    Mismatch,
    Disbanded,
}

impl JoinRejection {
    #[inline]
    fn code(self) -> u8 {
        match self {
            JoinRejection::ByHost => 0,
            JoinRejection::DuplicateName => 1,
            JoinRejection::GameFull => 2,
            JoinRejection::VersionTooOld => 3,
            JoinRejection::VersionTooNew => 4,
            JoinRejection::Mismatch => 5,
            JoinRejection::Disbanded => 6,
        }
    }

    #[inline]
    fn from_code(code: u8) -> NetworkResult<JoinRejection> {
        Ok(match code {
            0 => JoinRejection::ByHost,
            1 => JoinRejection::DuplicateName,
            2 => JoinRejection::GameFull,
            3 => JoinRejection::VersionTooOld,
            4 => JoinRejection::VersionTooNew,
            5 => JoinRejection::Mismatch,
            6 => JoinRejection::Disbanded,
            _ => return Err(NetworkError::Fatal(ErrorType::InvalidField("rejection reason"))),
        })
    }
}

/// Scenario rules announced by the host before the match starts.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GameOptions {
    pub scenario: String,
    pub credits: u32,
    pub bases: bool,
    pub ore: bool,
    pub goodies: bool,
    pub ghosts: bool,
    pub unit_count: u8,
    pub ai_players: u8,
    pub seed: u32,
    pub max_ahead: u16,
    pub frame_send_rate: u16,
}

impl GameOptions {
    #[inline]
    fn size(&self) -> usize {
        wire::string_size(&self.scenario) + 4 + 4 + 2 + 4 + 2 + 2
    }

    fn write<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        wire::write_string(stream, &self.scenario, FILE_NAME_MAX)?;
        stream.write_u32::<BigEndian>(self.credits)?;
        wire::write_bool(stream, self.bases)?;
        wire::write_bool(stream, self.ore)?;
        wire::write_bool(stream, self.goodies)?;
        wire::write_bool(stream, self.ghosts)?;
        stream.write_u8(self.unit_count)?;
        stream.write_u8(self.ai_players)?;
        stream.write_u32::<BigEndian>(self.seed)?;
        stream.write_u16::<BigEndian>(self.max_ahead)?;
        stream.write_u16::<BigEndian>(self.frame_send_rate)?;
        Ok(())
    }

    fn read<R: SizedRead>(stream: &mut R) -> NetworkResult<GameOptions> {
        Ok(GameOptions {
            scenario: wire::read_string(stream, FILE_NAME_MAX)?,
            credits: stream.read_u32::<BigEndian>()?,
            bases: wire::read_bool(stream)?,
            ore: wire::read_bool(stream)?,
            goodies: wire::read_bool(stream)?,
            ghosts: wire::read_bool(stream)?,
            unit_count: stream.read_u8()?,
            ai_players: stream.read_u8()?,
            seed: stream.read_u32::<BigEndian>()?,
            max_ahead: stream.read_u16::<BigEndian>()?,
            frame_send_rate: stream.read_u16::<BigEndian>()?,
        })
    }
}

/// Every message exchanged between machines. The leading `u16` tag selects the variant.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Packet {
    QueryGame,
    AnswerGame { name: String, version: u16, open: bool },
    QueryPlayer { game: String },
    AnswerPlayer { name: String, house: u8, color: u8 },
    ChatAnnounce { name: String, color: u8 },
    ChatRequest,
    QueryJoin { name: String, version: u16, house: u8, color: u8 },
    ConfirmJoin { player: PlayerId },
    RejectJoin { reason: JoinRejection },
    GameOptions(GameOptions),
    SignOff { name: String },
    Go { max_ahead: u16, frame_send_rate: u16, seed: u32 },
    Message { name: String, text: String },
    Ping { sent: Tick },
    LoadGame,
    Connect { player: PlayerId, name: String, version: u16 },
    Timing { max_ahead: u16, frame_send_rate: u16, response_time: u16 },
    ScoreScreen,
    Events(Vec<Event>),
    RequestScenario,
    FileInfo { name: String, length: u32, digest: Digest },
    FileChunk { block: u32, data: Vec<u8> },
    ReadyToGo,
    NoScenario,
}

impl Packet {
    pub const TAG_SIZE: usize = 2;

    pub fn tag(&self) -> u16 {
        match self {
            Packet::QueryGame => 0,
            Packet::AnswerGame { .. } => 1,
            Packet::QueryPlayer { .. } => 2,
            Packet::AnswerPlayer { .. } => 3,
            Packet::ChatAnnounce { .. } => 4,
            Packet::ChatRequest => 5,
            Packet::QueryJoin { .. } => 6,
            Packet::ConfirmJoin { .. } => 7,
            Packet::RejectJoin { .. } => 8,
            Packet::GameOptions(_) => 9,
            Packet::SignOff { .. } => 10,
            Packet::Go { .. } => 11,
            Packet::Message { .. } => 12,
            Packet::Ping { .. } => 13,
            Packet::LoadGame => 14,
            Packet::Connect { .. } => 100,
            Packet::Timing { .. } => 101,
            Packet::ScoreScreen => 102,
            Packet::Events(_) => 200,
            Packet::RequestScenario => 1000,
            Packet::FileInfo { .. } => 1001,
            Packet::FileChunk { .. } => 1002,
            Packet::ReadyToGo => 1003,
            Packet::NoScenario => 1004,
        }
    }

    /// Encoded size of the packet including the tag.
    pub fn size(&self) -> usize {
        Self::TAG_SIZE
            + match self {
                Packet::QueryGame
                | Packet::ChatRequest
                | Packet::LoadGame
                | Packet::ScoreScreen
                | Packet::RequestScenario
                | Packet::ReadyToGo
                | Packet::NoScenario => 0,
                Packet::AnswerGame { name, .. } => wire::string_size(name) + 3,
                Packet::QueryPlayer { game } => wire::string_size(game),
                Packet::AnswerPlayer { name, .. } => wire::string_size(name) + 2,
                Packet::ChatAnnounce { name, .. } => wire::string_size(name) + 1,
                Packet::QueryJoin { name, .. } => wire::string_size(name) + 4,
                Packet::ConfirmJoin { .. } | Packet::RejectJoin { .. } => 1,
                Packet::GameOptions(options) => options.size(),
                Packet::SignOff { name } => wire::string_size(name),
                Packet::Go { .. } => 8,
                Packet::Message { name, text } => wire::string_size(name) + wire::string_size(text),
                Packet::Ping { .. } => 8,
                Packet::Connect { name, .. } => 1 + wire::string_size(name) + 2,
                Packet::Timing { .. } => 6,
                Packet::Events(events) => events.iter().map(Event::size).sum(),
                Packet::FileInfo { name, .. } => wire::string_size(name) + 4 + DIGEST_SIZE,
                Packet::FileChunk { data, .. } => 4 + wire::bytes_size(data),
            }
    }

    /// Encodes the packet into a freshly allocated buffer.
    pub fn encode(&self) -> NetworkResult<Vec<u8>> {
        let mut buffer = vec![0; self.size()];
        self.serialize(&mut Cursor::new(&mut buffer[..]))?;
        Ok(buffer)
    }

    /// Decodes a complete packet. Trailing bytes are treated as a protocol error.
    pub fn decode(data: &[u8]) -> NetworkResult<Packet> {
        let mut stream = Cursor::new(data);
        let packet = Packet::deserialize(&mut stream)?;

        if stream.remaining_data() > 0 {
            return Err(NetworkError::Fatal(ErrorType::InvalidField("trailing data")));
        }

        Ok(packet)
    }

    /// Encodes as many events from the front of the batch as fit into a single `Events` packet.
    /// The encoded events are removed from the batch.
    pub fn encode_events(events: &mut PayloadBatch<Event>) -> NetworkResult<Vec<u8>> {
        let mut buffer = vec![0; MAX_PAYLOAD_SIZE];

        let size = {
            let mut stream = Cursor::new(&mut buffer[..]);
            stream.write_u16::<BigEndian>(200)?;
            events.write(&mut stream)?;
            stream.position() as usize
        };

        buffer.truncate(size);
        Ok(buffer)
    }
}

impl Serialize for Packet {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        if stream.free_capacity() < self.size() {
            return Err(NetworkError::Wait);
        }

        stream.write_u16::<BigEndian>(self.tag())?;

        match self {
            Packet::QueryGame
            | Packet::ChatRequest
            | Packet::LoadGame
            | Packet::ScoreScreen
            | Packet::RequestScenario
            | Packet::ReadyToGo
            | Packet::NoScenario => (),
            Packet::AnswerGame { name, version, open } => {
                wire::write_string(stream, name, NAME_MAX)?;
                stream.write_u16::<BigEndian>(*version)?;
                wire::write_bool(stream, *open)?;
            }
            Packet::QueryPlayer { game } => wire::write_string(stream, game, NAME_MAX)?,
            Packet::AnswerPlayer { name, house, color } => {
                wire::write_string(stream, name, NAME_MAX)?;
                stream.write_u8(*house)?;
                stream.write_u8(*color)?;
            }
            Packet::ChatAnnounce { name, color } => {
                wire::write_string(stream, name, NAME_MAX)?;
                stream.write_u8(*color)?;
            }
            Packet::QueryJoin {
                name,
                version,
                house,
                color,
            } => {
                wire::write_string(stream, name, NAME_MAX)?;
                stream.write_u16::<BigEndian>(*version)?;
                stream.write_u8(*house)?;
                stream.write_u8(*color)?;
            }
            Packet::ConfirmJoin { player } => stream.write_u8(*player)?,
            Packet::RejectJoin { reason } => stream.write_u8(reason.code())?,
            Packet::GameOptions(options) => options.write(stream)?,
            Packet::SignOff { name } => wire::write_string(stream, name, NAME_MAX)?,
            Packet::Go {
                max_ahead,
                frame_send_rate,
                seed,
            } => {
                stream.write_u16::<BigEndian>(*max_ahead)?;
                stream.write_u16::<BigEndian>(*frame_send_rate)?;
                stream.write_u32::<BigEndian>(*seed)?;
            }
            Packet::Message { name, text } => {
                wire::write_string(stream, name, NAME_MAX)?;
                wire::write_string(stream, text, EVENT_MESSAGE_MAX)?;
            }
            Packet::Ping { sent } => stream.write_u64::<BigEndian>(*sent)?,
            Packet::Connect { player, name, version } => {
                stream.write_u8(*player)?;
                wire::write_string(stream, name, NAME_MAX)?;
                stream.write_u16::<BigEndian>(*version)?;
            }
            Packet::Timing {
                max_ahead,
                frame_send_rate,
                response_time,
            } => {
                stream.write_u16::<BigEndian>(*max_ahead)?;
                stream.write_u16::<BigEndian>(*frame_send_rate)?;
                stream.write_u16::<BigEndian>(*response_time)?;
            }
            Packet::Events(events) => {
                for event in events {
                    event.serialize(stream)?;
                }
            }
            Packet::FileInfo { name, length, digest } => {
                wire::write_string(stream, name, FILE_NAME_MAX)?;
                stream.write_u32::<BigEndian>(*length)?;
                stream.write_all(digest)?;
            }
            Packet::FileChunk { block, data } => {
                stream.write_u32::<BigEndian>(*block)?;
                wire::write_bytes(stream, data, MAX_SEND_FILE_PACKET_SIZE)?;
            }
        }

        Ok(())
    }
}

impl Deserialize for Packet {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<Self> {
        let tag = stream.read_u16::<BigEndian>()?;

        Ok(match tag {
            0 => Packet::QueryGame,
            1 => Packet::AnswerGame {
                name: wire::read_string(stream, NAME_MAX)?,
                version: stream.read_u16::<BigEndian>()?,
                open: wire::read_bool(stream)?,
            },
            2 => Packet::QueryPlayer {
                game: wire::read_string(stream, NAME_MAX)?,
            },
            3 => Packet::AnswerPlayer {
                name: wire::read_string(stream, NAME_MAX)?,
                house: stream.read_u8()?,
                color: stream.read_u8()?,
            },
            4 => Packet::ChatAnnounce {
                name: wire::read_string(stream, NAME_MAX)?,
                color: stream.read_u8()?,
            },
            5 => Packet::ChatRequest,
            6 => Packet::QueryJoin {
                name: wire::read_string(stream, NAME_MAX)?,
                version: stream.read_u16::<BigEndian>()?,
                house: stream.read_u8()?,
                color: stream.read_u8()?,
            },
            7 => Packet::ConfirmJoin { player: stream.read_u8()? },
            8 => Packet::RejectJoin {
                reason: JoinRejection::from_code(stream.read_u8()?)?,
            },
            9 => Packet::GameOptions(GameOptions::read(stream)?),
            10 => Packet::SignOff {
                name: wire::read_string(stream, NAME_MAX)?,
            },
            11 => Packet::Go {
                max_ahead: stream.read_u16::<BigEndian>()?,
                frame_send_rate: stream.read_u16::<BigEndian>()?,
                seed: stream.read_u32::<BigEndian>()?,
            },
            12 => Packet::Message {
                name: wire::read_string(stream, NAME_MAX)?,
                text: wire::read_string(stream, EVENT_MESSAGE_MAX)?,
            },
            13 => Packet::Ping { sent: stream.read_u64::<BigEndian>()? },
            14 => Packet::LoadGame,
            100 => Packet::Connect {
                player: stream.read_u8()?,
                name: wire::read_string(stream, NAME_MAX)?,
                version: stream.read_u16::<BigEndian>()?,
            },
            101 => Packet::Timing {
                max_ahead: stream.read_u16::<BigEndian>()?,
                frame_send_rate: stream.read_u16::<BigEndian>()?,
                response_time: stream.read_u16::<BigEndian>()?,
            },
            102 => Packet::ScoreScreen,
            200 => {
                let mut events = PayloadBatch::<Event>::new();
                events.read(stream)?;
                Packet::Events(events.into())
            }
            1000 => Packet::RequestScenario,
            1001 => {
                let name = wire::read_string(stream, FILE_NAME_MAX)?;
                let length = stream.read_u32::<BigEndian>()?;
                let mut digest = [0; DIGEST_SIZE];
                stream.read_exact(&mut digest)?;

                Packet::FileInfo { name, length, digest }
            }
            1002 => Packet::FileChunk {
                block: stream.read_u32::<BigEndian>()?,
                data: wire::read_bytes(stream, MAX_SEND_FILE_PACKET_SIZE)?,
            },
            1003 => Packet::ReadyToGo,
            1004 => Packet::NoScenario,
            tag => return Err(NetworkError::Fatal(ErrorType::UnknownCommand(tag))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::tests::all_kinds;
    use crate::event::EventKind;

    fn all_packets() -> Vec<Packet> {
        let events = all_kinds()
            .into_iter()
            .take(6)
            .enumerate()
            .map(|(index, kind)| Event::new(1, 40 + index as u32, kind))
            .collect();

        vec![
            Packet::QueryGame,
            Packet::AnswerGame {
                name: "warzone".to_owned(),
                version: 2,
                open: true,
            },
            Packet::QueryPlayer {
                game: "warzone".to_owned(),
            },
            Packet::AnswerPlayer {
                name: "tanya".to_owned(),
                house: 1,
                color: 4,
            },
            Packet::ChatAnnounce {
                name: "tanya".to_owned(),
                color: 4,
            },
            Packet::ChatRequest,
            Packet::QueryJoin {
                name: "boris".to_owned(),
                version: 2,
                house: 3,
                color: 1,
            },
            Packet::ConfirmJoin { player: 3 },
            Packet::RejectJoin {
                reason: JoinRejection::VersionTooOld,
            },
            Packet::GameOptions(GameOptions {
                scenario: "scm01ea.ini".to_owned(),
                credits: 10_000,
                bases: true,
                ore: true,
                goodies: false,
                ghosts: true,
                unit_count: 10,
                ai_players: 2,
                seed: 0xfeed,
                max_ahead: 12,
                frame_send_rate: 3,
            }),
            Packet::SignOff {
                name: "boris".to_owned(),
            },
            Packet::Go {
                max_ahead: 12,
                frame_send_rate: 3,
                seed: 77,
            },
            Packet::Message {
                name: "boris".to_owned(),
                text: "gg".to_owned(),
            },
            Packet::Ping { sent: 1 << 40 },
            Packet::LoadGame,
            Packet::Connect {
                player: 2,
                name: "tanya".to_owned(),
                version: 2,
            },
            Packet::Timing {
                max_ahead: 9,
                frame_send_rate: 3,
                response_time: 40,
            },
            Packet::ScoreScreen,
            Packet::Events(events),
            Packet::Events(Vec::new()),
            Packet::RequestScenario,
            Packet::FileInfo {
                name: "scm01ea.ini".to_owned(),
                length: 10_000,
                digest: [7; DIGEST_SIZE],
            },
            Packet::FileChunk {
                block: 39,
                data: vec![0xab; MAX_SEND_FILE_PACKET_SIZE],
            },
            Packet::ReadyToGo,
            Packet::NoScenario,
        ]
    }

    #[test]
    fn test_packet_roundtrip() {
        for packet in all_packets() {
            let encoded = packet.encode().unwrap();

            assert_eq!(encoded.len(), packet.size());
            assert_eq!(Packet::decode(&encoded).unwrap(), packet);
        }
    }

    #[test]
    fn test_tags_unique() {
        let packets = all_packets();
        let mut tags: Vec<_> = packets.iter().map(Packet::tag).collect();
        tags.sort_unstable();
        tags.dedup();

        // Events appears twice in the sample set
        assert_eq!(tags.len(), packets.len() - 1);
    }

    #[test]
    fn test_packets_fit_datagram() {
        for packet in all_packets() {
            assert!(packet.size() <= MAX_PAYLOAD_SIZE, "{:?} too large", packet.tag());
        }
    }

    #[test]
    fn test_unknown_tag() {
        assert_eq!(
            Packet::decode(&[0x7f, 0x7f]).unwrap_err(),
            NetworkError::Fatal(ErrorType::UnknownCommand(0x7f7f))
        );
    }

    #[test]
    fn test_truncated_packet() {
        let encoded = Packet::Go {
            max_ahead: 1,
            frame_send_rate: 1,
            seed: 1,
        }
        .encode()
        .unwrap();

        assert_eq!(
            Packet::decode(&encoded[..encoded.len() - 1]).unwrap_err(),
            NetworkError::Fatal(ErrorType::Truncated)
        );
    }

    #[test]
    fn test_trailing_data() {
        let mut encoded = Packet::ReadyToGo.encode().unwrap();
        encoded.push(0);

        assert_eq!(
            Packet::decode(&encoded).unwrap_err(),
            NetworkError::Fatal(ErrorType::InvalidField("trailing data"))
        );
    }

    #[test]
    fn test_oversized_name_rejected() {
        let packet = Packet::SignOff {
            name: "a".repeat(NAME_MAX + 1),
        };

        assert_eq!(
            packet.encode().unwrap_err(),
            NetworkError::Fatal(ErrorType::InvalidField("string length"))
        );
    }

    #[test]
    fn test_encode_events_splits_batch() {
        let mut batch = PayloadBatch::new();
        for frame in 0..200 {
            batch.push(Event::new(2, frame, EventKind::Sell { whom: frame }));
        }

        let mut decoded = Vec::new();
        let mut packets = 0;

        while !batch.is_empty() {
            let encoded = Packet::encode_events(&mut batch).unwrap();
            assert!(encoded.len() <= MAX_PAYLOAD_SIZE);

            match Packet::decode(&encoded).unwrap() {
                Packet::Events(events) => decoded.extend(events),
                packet => panic!("unexpected packet {:?}", packet),
            }

            packets += 1;
        }

        // Sell events take 10 bytes, 56 of them fit behind the tag
        assert_eq!(packets, 4);
        assert_eq!(decoded.len(), 200);
        assert!(decoded.iter().enumerate().all(|(index, event)| event.frame == index as u32));
    }
}
