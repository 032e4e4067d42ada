use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Magic number of datagrams exchanged over private (point to point) connections.
pub const PRIVATE_MAGIC: u16 = 0x6d5a;
/// Magic number of datagrams exchanged over the global (broadcast capable) connection.
pub const GLOBAL_MAGIC: u16 = 0x6d5b;

/// Maximum size of a datagram including the header.
pub const MAX_DATAGRAM_SIZE: usize = 576;
/// Maximum application payload carried by a single datagram on either connection kind.
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - GlobalHeader::SIZE;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Code {
    /// Data packet the receiver must acknowledge.
    DataAck = 0,
    /// Fire and forget data packet.
    DataNoAck = 1,
    /// Acknowledgement of a `DataAck` packet.
    Ack = 2,
}

impl From<Code> for u8 {
    #[inline]
    fn from(code: Code) -> Self {
        code as u8
    }
}

impl Code {
    #[inline]
    pub fn read(code: u8) -> NetworkResult<Code> {
        match code {
            0 => Ok(Code::DataAck),
            1 => Ok(Code::DataNoAck),
            2 => Ok(Code::Ack),
            _ => Err(NetworkError::Fatal(ErrorType::IncorrectCode(code))),
        }
    }
}

/// Header of a private datagram.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Header {
    pub magic: u16,
    pub code: Code,
    pub packet_id: u32,
}

impl Header {
    pub const SIZE: usize = 7;

    #[inline]
    pub fn new(code: Code, packet_id: u32) -> Header {
        Header {
            magic: PRIVATE_MAGIC,
            code,
            packet_id,
        }
    }

    /// Reads the magic number without consuming the datagram.
    #[inline]
    pub fn peek_magic(datagram: &[u8]) -> NetworkResult<u16> {
        let mut stream = datagram;
        Ok(stream.read_u16::<BigEndian>()?)
    }

    #[inline]
    pub fn read(stream: &mut &[u8]) -> NetworkResult<Header> {
        let magic = stream.read_u16::<BigEndian>()?;
        let code = Code::read(stream.read_u8()?)?;
        let packet_id = stream.read_u32::<BigEndian>()?;

        Ok(Header {
            magic,
            code,
            packet_id,
        })
    }

    #[inline]
    pub fn write<W: io::Write>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u16::<BigEndian>(self.magic)?;
        stream.write_u8(self.code.into())?;
        stream.write_u32::<BigEndian>(self.packet_id)?;
        Ok(())
    }

    /// Assembles a complete datagram from the header and the payload.
    #[inline]
    pub fn datagram(&self, payload: &[u8]) -> NetworkResult<Vec<u8>> {
        let mut datagram = Vec::with_capacity(Self::SIZE + payload.len());
        self.write(&mut datagram)?;
        datagram.extend_from_slice(payload);
        Ok(datagram)
    }
}

/// Header of a global datagram. Carries the product id so unrelated programs sharing the
/// broadcast domain are filtered out.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct GlobalHeader {
    pub header: Header,
    pub product_id: u16,
}

impl GlobalHeader {
    pub const SIZE: usize = Header::SIZE + 2;

    #[inline]
    pub fn new(code: Code, packet_id: u32, product_id: u16) -> GlobalHeader {
        GlobalHeader {
            header: Header {
                magic: GLOBAL_MAGIC,
                code,
                packet_id,
            },
            product_id,
        }
    }

    #[inline]
    pub fn read(stream: &mut &[u8]) -> NetworkResult<GlobalHeader> {
        let header = Header::read(stream)?;
        let product_id = stream.read_u16::<BigEndian>()?;

        Ok(GlobalHeader { header, product_id })
    }

    #[inline]
    pub fn write<W: io::Write>(&self, stream: &mut W) -> NetworkResult<()> {
        self.header.write(stream)?;
        stream.write_u16::<BigEndian>(self.product_id)?;
        Ok(())
    }

    #[inline]
    pub fn datagram(&self, payload: &[u8]) -> NetworkResult<Vec<u8>> {
        let mut datagram = Vec::with_capacity(Self::SIZE + payload.len());
        self.write(&mut datagram)?;
        datagram.extend_from_slice(payload);
        Ok(datagram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let datagram = Header::new(Code::Ack, 0x0102_0304).datagram(&[9, 9]).unwrap();

        assert_eq!(datagram, vec![0x6d, 0x5a, 2, 1, 2, 3, 4, 9, 9]);
        assert_eq!(Header::peek_magic(&datagram).unwrap(), PRIVATE_MAGIC);

        let mut stream = &datagram[..];
        let header = Header::read(&mut stream).unwrap();

        assert_eq!(header, Header::new(Code::Ack, 0x0102_0304));
        assert_eq!(stream, &[9, 9]);
    }

    #[test]
    fn test_global_header_layout() {
        let datagram = GlobalHeader::new(Code::DataAck, 7, 0xbeef).datagram(&[]).unwrap();

        assert_eq!(datagram.len(), GlobalHeader::SIZE);
        assert_eq!(Header::peek_magic(&datagram).unwrap(), GLOBAL_MAGIC);

        let header = GlobalHeader::read(&mut &datagram[..]).unwrap();

        assert_eq!(header.header.code, Code::DataAck);
        assert_eq!(header.header.packet_id, 7);
        assert_eq!(header.product_id, 0xbeef);
    }

    #[test]
    fn test_read_err_code() {
        let datagram = [0x6d, 0x5a, 7, 0, 0, 0, 1];

        let result = Header::read(&mut &datagram[..]);

        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::IncorrectCode(7)));
    }

    #[test]
    fn test_read_err_truncated() {
        let datagram = [0x6d, 0x5a, 0, 0, 0];

        let result = Header::read(&mut &datagram[..]);

        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::Truncated));
        assert_eq!(
            Header::peek_magic(&[1]).unwrap_err(),
            NetworkError::Fatal(ErrorType::Truncated)
        );
    }
}
