use crate::wire;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use courier::net::support::{Deserialize, ErrorType, NetworkError, NetworkResult, Serialize, SizedRead, SizedWrite};
use flux::{FrameNo, PlayerId};

/// Opaque reference to a simulation object.
pub type Target = u32;

/// Map cell index.
pub type Cell = u16;

/// Maximum length of the text carried by message events.
pub const EVENT_MESSAGE_MAX: usize = 64;

/// Maximum length of a player name.
pub const NAME_MAX: usize = 12;

/// Simulation command. Every machine executes the same commands on the same frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EventKind {
    Empty,
    Ally { house: u8 },
    MegaMission { whom: Target, mission: u8, target: Target, destination: Target },
    MegaMissionFormation { whom: Target, mission: u8, target: Target, destination: Target, speed: u8, max_speed: u8 },
    Idle { whom: Target },
    Scatter { whom: Target },
    Destruct,
    Deploy { whom: Target },
    Place { rtti: u8, cell: Cell },
    Options,
    GameSpeed { speed: u8 },
    Produce { rtti: u8, id: u16 },
    Suspend { rtti: u8 },
    Abandon { rtti: u8 },
    Primary { whom: Target },
    SpecialPlace { special: u8, cell: Cell },
    Exit,
    Animation { anim: u8, owner: u8, cell: Cell },
    Repair { whom: Target },
    Sell { whom: Target },
    SellCell { cell: Cell },
    Special { flags: u32 },
    FrameSync { crc: u32, command_count: u16, delay: u8 },
    Message { text: String },
    ResponseTime { ticks: u16 },
    FrameInfo { crc: u32, command_count: u16, delay: u8 },
    SaveGame,
    Archive { whom: Target, target: Target },
    AddPlayer { name: String },
    Timing { desired_frame_rate: u16, max_ahead: u16 },
    ProcessTime { average_ticks: u16 },
}

impl EventKind {
    /// Wire tag of the event kind.
    #[inline]
    pub fn tag(&self) -> u8 {
        match self {
            EventKind::Empty => 0,
            EventKind::Ally { .. } => 1,
            EventKind::MegaMission { .. } => 2,
            EventKind::MegaMissionFormation { .. } => 3,
            EventKind::Idle { .. } => 4,
            EventKind::Scatter { .. } => 5,
            EventKind::Destruct => 6,
            EventKind::Deploy { .. } => 7,
            EventKind::Place { .. } => 8,
            EventKind::Options => 9,
            EventKind::GameSpeed { .. } => 10,
            EventKind::Produce { .. } => 11,
            EventKind::Suspend { .. } => 12,
            EventKind::Abandon { .. } => 13,
            EventKind::Primary { .. } => 14,
            EventKind::SpecialPlace { .. } => 15,
            EventKind::Exit => 16,
            EventKind::Animation { .. } => 17,
            EventKind::Repair { .. } => 18,
            EventKind::Sell { .. } => 19,
            EventKind::SellCell { .. } => 20,
            EventKind::Special { .. } => 21,
            EventKind::FrameSync { .. } => 22,
            EventKind::Message { .. } => 23,
            EventKind::ResponseTime { .. } => 24,
            EventKind::FrameInfo { .. } => 25,
            EventKind::SaveGame => 26,
            EventKind::Archive { .. } => 27,
            EventKind::AddPlayer { .. } => 28,
            EventKind::Timing { .. } => 29,
            EventKind::ProcessTime { .. } => 30,
        }
    }

    /// Encoded size of the kind specific fields.
    #[inline]
    fn payload_size(&self) -> usize {
        match self {
            EventKind::Empty | EventKind::Destruct | EventKind::Options | EventKind::Exit | EventKind::SaveGame => 0,
            EventKind::Ally { .. } | EventKind::GameSpeed { .. } | EventKind::Suspend { .. } | EventKind::Abandon { .. } => 1,
            EventKind::MegaMission { .. } => 13,
            EventKind::MegaMissionFormation { .. } => 15,
            EventKind::Idle { .. }
            | EventKind::Scatter { .. }
            | EventKind::Deploy { .. }
            | EventKind::Primary { .. }
            | EventKind::Repair { .. }
            | EventKind::Sell { .. }
            | EventKind::Special { .. } => 4,
            EventKind::Place { .. } | EventKind::Produce { .. } | EventKind::SpecialPlace { .. } => 3,
            EventKind::Animation { .. } => 4,
            EventKind::SellCell { .. } | EventKind::ResponseTime { .. } | EventKind::ProcessTime { .. } => 2,
            EventKind::FrameSync { .. } | EventKind::FrameInfo { .. } => 7,
            EventKind::Message { text } => wire::string_size(text),
            EventKind::Archive { .. } => 8,
            EventKind::AddPlayer { name } => wire::string_size(name),
            EventKind::Timing { .. } => 4,
        }
    }

    fn write<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        match self {
            EventKind::Empty | EventKind::Destruct | EventKind::Options | EventKind::Exit | EventKind::SaveGame => (),
            EventKind::Ally { house } => stream.write_u8(*house)?,
            EventKind::MegaMission {
                whom,
                mission,
                target,
                destination,
            } => {
                stream.write_u32::<BigEndian>(*whom)?;
                stream.write_u8(*mission)?;
                stream.write_u32::<BigEndian>(*target)?;
                stream.write_u32::<BigEndian>(*destination)?;
            }
            EventKind::MegaMissionFormation {
                whom,
                mission,
                target,
                destination,
                speed,
                max_speed,
            } => {
                stream.write_u32::<BigEndian>(*whom)?;
                stream.write_u8(*mission)?;
                stream.write_u32::<BigEndian>(*target)?;
                stream.write_u32::<BigEndian>(*destination)?;
                stream.write_u8(*speed)?;
                stream.write_u8(*max_speed)?;
            }
            EventKind::Idle { whom }
            | EventKind::Scatter { whom }
            | EventKind::Deploy { whom }
            | EventKind::Primary { whom }
            | EventKind::Repair { whom }
            | EventKind::Sell { whom } => stream.write_u32::<BigEndian>(*whom)?,
            EventKind::Place { rtti, cell } => {
                stream.write_u8(*rtti)?;
                stream.write_u16::<BigEndian>(*cell)?;
            }
            EventKind::GameSpeed { speed } => stream.write_u8(*speed)?,
            EventKind::Produce { rtti, id } => {
                stream.write_u8(*rtti)?;
                stream.write_u16::<BigEndian>(*id)?;
            }
            EventKind::Suspend { rtti } | EventKind::Abandon { rtti } => stream.write_u8(*rtti)?,
            EventKind::SpecialPlace { special, cell } => {
                stream.write_u8(*special)?;
                stream.write_u16::<BigEndian>(*cell)?;
            }
            EventKind::Animation { anim, owner, cell } => {
                stream.write_u8(*anim)?;
                stream.write_u8(*owner)?;
                stream.write_u16::<BigEndian>(*cell)?;
            }
            EventKind::SellCell { cell } => stream.write_u16::<BigEndian>(*cell)?,
            EventKind::Special { flags } => stream.write_u32::<BigEndian>(*flags)?,
            EventKind::FrameSync {
                crc,
                command_count,
                delay,
            }
            | EventKind::FrameInfo {
                crc,
                command_count,
                delay,
            } => {
                stream.write_u32::<BigEndian>(*crc)?;
                stream.write_u16::<BigEndian>(*command_count)?;
                stream.write_u8(*delay)?;
            }
            EventKind::Message { text } => wire::write_string(stream, text, EVENT_MESSAGE_MAX)?,
            EventKind::ResponseTime { ticks } => stream.write_u16::<BigEndian>(*ticks)?,
            EventKind::Archive { whom, target } => {
                stream.write_u32::<BigEndian>(*whom)?;
                stream.write_u32::<BigEndian>(*target)?;
            }
            EventKind::AddPlayer { name } => wire::write_string(stream, name, NAME_MAX)?,
            EventKind::Timing {
                desired_frame_rate,
                max_ahead,
            } => {
                stream.write_u16::<BigEndian>(*desired_frame_rate)?;
                stream.write_u16::<BigEndian>(*max_ahead)?;
            }
            EventKind::ProcessTime { average_ticks } => stream.write_u16::<BigEndian>(*average_ticks)?,
        }

        Ok(())
    }

    fn read<R: SizedRead>(tag: u8, stream: &mut R) -> NetworkResult<EventKind> {
        Ok(match tag {
            0 => EventKind::Empty,
            1 => EventKind::Ally { house: stream.read_u8()? },
            2 => EventKind::MegaMission {
                whom: stream.read_u32::<BigEndian>()?,
                mission: stream.read_u8()?,
                target: stream.read_u32::<BigEndian>()?,
                destination: stream.read_u32::<BigEndian>()?,
            },
            3 => EventKind::MegaMissionFormation {
                whom: stream.read_u32::<BigEndian>()?,
                mission: stream.read_u8()?,
                target: stream.read_u32::<BigEndian>()?,
                destination: stream.read_u32::<BigEndian>()?,
                speed: stream.read_u8()?,
                max_speed: stream.read_u8()?,
            },
            4 => EventKind::Idle { whom: stream.read_u32::<BigEndian>()? },
            5 => EventKind::Scatter { whom: stream.read_u32::<BigEndian>()? },
            6 => EventKind::Destruct,
            7 => EventKind::Deploy { whom: stream.read_u32::<BigEndian>()? },
            8 => EventKind::Place {
                rtti: stream.read_u8()?,
                cell: stream.read_u16::<BigEndian>()?,
            },
            9 => EventKind::Options,
            10 => EventKind::GameSpeed { speed: stream.read_u8()? },
            11 => EventKind::Produce {
                rtti: stream.read_u8()?,
                id: stream.read_u16::<BigEndian>()?,
            },
            12 => EventKind::Suspend { rtti: stream.read_u8()? },
            13 => EventKind::Abandon { rtti: stream.read_u8()? },
            14 => EventKind::Primary { whom: stream.read_u32::<BigEndian>()? },
            15 => EventKind::SpecialPlace {
                special: stream.read_u8()?,
                cell: stream.read_u16::<BigEndian>()?,
            },
            16 => EventKind::Exit,
            17 => EventKind::Animation {
                anim: stream.read_u8()?,
                owner: stream.read_u8()?,
                cell: stream.read_u16::<BigEndian>()?,
            },
            18 => EventKind::Repair { whom: stream.read_u32::<BigEndian>()? },
            19 => EventKind::Sell { whom: stream.read_u32::<BigEndian>()? },
            20 => EventKind::SellCell { cell: stream.read_u16::<BigEndian>()? },
            21 => EventKind::Special { flags: stream.read_u32::<BigEndian>()? },
            22 => EventKind::FrameSync {
                crc: stream.read_u32::<BigEndian>()?,
                command_count: stream.read_u16::<BigEndian>()?,
                delay: stream.read_u8()?,
            },
            23 => EventKind::Message {
                text: wire::read_string(stream, EVENT_MESSAGE_MAX)?,
            },
            24 => EventKind::ResponseTime { ticks: stream.read_u16::<BigEndian>()? },
            25 => EventKind::FrameInfo {
                crc: stream.read_u32::<BigEndian>()?,
                command_count: stream.read_u16::<BigEndian>()?,
                delay: stream.read_u8()?,
            },
            26 => EventKind::SaveGame,
            27 => EventKind::Archive {
                whom: stream.read_u32::<BigEndian>()?,
                target: stream.read_u32::<BigEndian>()?,
            },
            28 => EventKind::AddPlayer {
                name: wire::read_string(stream, NAME_MAX)?,
            },
            29 => EventKind::Timing {
                desired_frame_rate: stream.read_u16::<BigEndian>()?,
                max_ahead: stream.read_u16::<BigEndian>()?,
            },
            30 => EventKind::ProcessTime { average_ticks: stream.read_u16::<BigEndian>()? },
            _ => return Err(NetworkError::Fatal(ErrorType::InvalidField("event kind"))),
        })
    }
}

/// A simulation command stamped with the player issuing it and the frame it executes on.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Event {
    pub player: PlayerId,
    pub frame: FrameNo,
    pub kind: EventKind,
}

impl Event {
    const HEADER_SIZE: usize = 6;

    #[inline]
    pub fn new(player: PlayerId, frame: FrameNo, kind: EventKind) -> Event {
        Event { player, frame, kind }
    }

    /// Encoded size of the event.
    #[inline]
    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.kind.payload_size()
    }
}

impl Serialize for Event {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        if stream.free_capacity() < self.size() {
            return Err(NetworkError::Wait);
        }

        stream.write_u8(self.player)?;
        stream.write_u32::<BigEndian>(self.frame)?;
        stream.write_u8(self.kind.tag())?;
        self.kind.write(stream)
    }
}

impl Deserialize for Event {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<Self> {
        let player = stream.read_u8()?;
        let frame = stream.read_u32::<BigEndian>()?;
        let kind = EventKind::read(stream.read_u8()?, stream)?;

        Ok(Event { player, frame, kind })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// One instance of every event kind.
    pub(crate) fn all_kinds() -> Vec<EventKind> {
        vec![
            EventKind::Empty,
            EventKind::Ally { house: 3 },
            EventKind::MegaMission {
                whom: 0x0100_0001,
                mission: 4,
                target: 0x0200_0002,
                destination: 0,
            },
            EventKind::MegaMissionFormation {
                whom: 7,
                mission: 2,
                target: 8,
                destination: 9,
                speed: 11,
                max_speed: 12,
            },
            EventKind::Idle { whom: 1 },
            EventKind::Scatter { whom: 2 },
            EventKind::Destruct,
            EventKind::Deploy { whom: 3 },
            EventKind::Place { rtti: 6, cell: 4097 },
            EventKind::Options,
            EventKind::GameSpeed { speed: 4 },
            EventKind::Produce { rtti: 1, id: 300 },
            EventKind::Suspend { rtti: 2 },
            EventKind::Abandon { rtti: 3 },
            EventKind::Primary { whom: 9 },
            EventKind::SpecialPlace { special: 1, cell: 77 },
            EventKind::Exit,
            EventKind::Animation { anim: 5, owner: 2, cell: 1000 },
            EventKind::Repair { whom: 10 },
            EventKind::Sell { whom: 11 },
            EventKind::SellCell { cell: 12 },
            EventKind::Special { flags: 0xdead_beef },
            EventKind::FrameSync {
                crc: 1,
                command_count: 2,
                delay: 3,
            },
            EventKind::Message {
                text: "incoming".to_owned(),
            },
            EventKind::ResponseTime { ticks: 45 },
            EventKind::FrameInfo {
                crc: 0xffff_ffff,
                command_count: 65535,
                delay: 255,
            },
            EventKind::SaveGame,
            EventKind::Archive { whom: 1, target: 2 },
            EventKind::AddPlayer {
                name: "boris".to_owned(),
            },
            EventKind::Timing {
                desired_frame_rate: 30,
                max_ahead: 9,
            },
            EventKind::ProcessTime { average_ticks: 2 },
        ]
    }

    #[test]
    fn test_event_roundtrip() {
        for (index, kind) in all_kinds().into_iter().enumerate() {
            let event = Event::new(index as u8, 1000 + index as u32, kind);
            let mut buffer = vec![0u8; event.size()];

            event.serialize(&mut Cursor::new(&mut buffer[..])).unwrap();

            let mut stream = Cursor::new(&buffer[..]);
            assert_eq!(Event::deserialize(&mut stream).unwrap(), event);
            assert_eq!(stream.remaining_data(), 0, "size mismatch for {:?}", event);
        }
    }

    #[test]
    fn test_tags_unique() {
        let mut tags: Vec<_> = all_kinds().iter().map(EventKind::tag).collect();
        tags.sort_unstable();
        tags.dedup();

        assert_eq!(tags.len(), all_kinds().len());
    }

    #[test]
    fn test_serialize_wait_without_capacity() {
        let event = Event::new(1, 2, EventKind::Sell { whom: 3 });
        let mut buffer = vec![0u8; event.size() - 1];

        assert_eq!(
            event.serialize(&mut Cursor::new(&mut buffer[..])).unwrap_err(),
            NetworkError::Wait
        );
    }

    #[test]
    fn test_deserialize_unknown_kind() {
        let buffer = [1u8, 0, 0, 0, 1, 200];

        assert_eq!(
            Event::deserialize(&mut Cursor::new(&buffer[..])).unwrap_err(),
            NetworkError::Fatal(ErrorType::InvalidField("event kind"))
        );
    }
}
