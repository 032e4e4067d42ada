use std::fmt;
use std::io;
use std::net;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NetworkError {
    Wait,
    Fatal(ErrorType),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ErrorType {
    NotOpen,
    AlreadyConnected,
    TooManyConnections,
    UnknownConnection,
    ConnectionFailed,
    RetriesExhausted,
    Expired,
    PayloadTooLarge,
    EmptyPayload,
    Truncated,
    IncorrectCode(u8),
    MagicMismatch(u16),
    ProductMismatch(u16),
    UnknownCommand(u16),
    InvalidField(&'static str),
    UnsupportedAddress,
    AddrParse,
    Io(io::ErrorKind),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetworkError::Wait => write!(f, "operation would block"),
            NetworkError::Fatal(error) => write!(f, "{}", error),
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorType::IncorrectCode(code) => write!(f, "incorrect packet code {}", code),
            ErrorType::MagicMismatch(magic) => write!(f, "magic number mismatch {:#06x}", magic),
            ErrorType::ProductMismatch(product) => write!(f, "product id mismatch {:#06x}", product),
            ErrorType::UnknownCommand(tag) => write!(f, "unknown command {}", tag),
            ErrorType::InvalidField(field) => write!(f, "invalid field: {}", field),
            ErrorType::Io(kind) => write!(f, "io error: {:?}", kind),
            error => write!(f, "{:?}", error),
        }
    }
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetworkError::Wait,
            io::ErrorKind::UnexpectedEof => NetworkError::Fatal(ErrorType::Truncated),
            kind => NetworkError::Fatal(ErrorType::Io(kind)),
        }
    }
}

impl From<net::AddrParseError> for NetworkError {
    #[inline]
    fn from(_: net::AddrParseError) -> Self {
        NetworkError::Fatal(ErrorType::AddrParse)
    }
}

impl From<ErrorType> for NetworkError {
    #[inline]
    fn from(error: ErrorType) -> Self {
        NetworkError::Fatal(error)
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetworkResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetworkError::Wait) => false,
            _ => true,
        }
    }
}

/// Augmented `io::Write` that is aware of the amount of remaining free capacity in the destination.
pub trait SizedWrite: io::Write {
    /// Remaining free capacity in the destination.
    fn free_capacity(&self) -> usize;
}

/// Augmented `io::Read` that is aware of the amount of remaining data in the source.
pub trait SizedRead: io::Read {
    /// Remaining data in the source.
    fn remaining_data(&self) -> usize;
}

impl SizedWrite for io::Cursor<&mut [u8]> {
    #[inline]
    fn free_capacity(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

impl SizedRead for io::Cursor<&[u8]> {
    #[inline]
    fn remaining_data(&self) -> usize {
        self.get_ref().len() - self.position() as usize
    }
}

/// Trait for manually serialized objects. Implementors must take care to validate the remaining
/// free capacity in the stream upfront and only write into it if all the content they wish to
/// write can be written.
///
/// Should return `NetworkError::Wait` in case there is not enough capacity in the stream.
pub trait Serialize {
    fn serialize<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()>;
}

/// Trait for manually deserialized objects.
pub trait Deserialize: Sized {
    fn deserialize<R: SizedRead>(stream: &mut R) -> NetworkResult<Self>;
}

/// Payloads waiting to be packed into as few datagrams as possible.
#[derive(Debug)]
pub struct PayloadBatch<P> {
    data: Vec<P>,
}

impl<P> PayloadBatch<P> {
    #[inline]
    pub fn new() -> PayloadBatch<P> {
        PayloadBatch { data: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn push(&mut self, payload: P) {
        self.data.push(payload)
    }

    #[inline]
    pub fn drain(&mut self) -> impl Iterator<Item = P> + '_ {
        self.data.drain(..)
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &P> + '_ {
        self.data.iter()
    }
}

impl<P: Serialize> PayloadBatch<P> {
    /// Packs payloads from the front of the batch until the stream is full. Written payloads leave
    /// the batch, `Wait` means not even the first one fits.
    #[inline]
    pub fn write<W: SizedWrite>(&mut self, stream: &mut W) -> NetworkResult<usize> {
        let mut written = 0;

        for payload in self.data.iter() {
            match payload.serialize(stream) {
                Ok(_) => written += 1,
                Err(NetworkError::Wait) => break,
                Err(error) => return Err(error),
            }
        }

        if written == 0 && !self.data.is_empty() {
            return Err(NetworkError::Wait);
        }

        self.data.drain(..written);
        Ok(written)
    }
}

impl<P: Deserialize> PayloadBatch<P> {
    /// Appends every payload in the stream. A payload cut short fails the whole read.
    #[inline]
    pub fn read<R: SizedRead>(&mut self, stream: &mut R) -> NetworkResult<()> {
        while stream.remaining_data() > 0 {
            self.data.push(P::deserialize(stream)?)
        }

        Ok(())
    }
}

impl<P> From<Vec<P>> for PayloadBatch<P> {
    #[inline]
    fn from(data: Vec<P>) -> Self {
        PayloadBatch { data }
    }
}

impl<P> Into<Vec<P>> for PayloadBatch<P> {
    #[inline]
    fn into(self) -> Vec<P> {
        self.data
    }
}
