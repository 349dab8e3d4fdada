use std::fmt;
use std::io::{self, Read, Write};

pub const BOLT_MAGIC_PREAMBLE: u32 = 0x6060_B017;
pub const SUPPORTED_VERSION: u32 = 1;
pub const NO_VERSION: u32 = 0;
pub const HANDSHAKE_SIZE_BYTES: usize = 20;

#[derive(Debug)]
pub enum HandshakeError {
    Io(io::Error),
    InvalidPreamble { received: u32 },
    UnsupportedVersions { proposed: [u32; 4] },
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "handshake io error: {source}"),
            Self::InvalidPreamble { received } => {
                write!(f, "invalid handshake preamble 0x{received:08X}")
            }
            Self::UnsupportedVersions { proposed } => {
                write!(f, "none of the proposed protocol versions {proposed:?} is supported")
            }
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Picks the protocol version from a 20-byte client handshake: the magic
/// preamble followed by four big-endian version proposals in preference
/// order.
pub fn negotiate_version(handshake: &[u8; HANDSHAKE_SIZE_BYTES]) -> Result<u32, HandshakeError> {
    let word = |index: usize| {
        let start = index * 4;
        u32::from_be_bytes([
            handshake[start],
            handshake[start + 1],
            handshake[start + 2],
            handshake[start + 3],
        ])
    };

    let preamble = word(0);
    if preamble != BOLT_MAGIC_PREAMBLE {
        return Err(HandshakeError::InvalidPreamble { received: preamble });
    }

    let proposed = [word(1), word(2), word(3), word(4)];
    if proposed.contains(&SUPPORTED_VERSION) {
        Ok(SUPPORTED_VERSION)
    } else {
        Err(HandshakeError::UnsupportedVersions { proposed })
    }
}

/// Runs the server side of the handshake on a blocking stream. On version
/// mismatch the client is told `0` before the error is returned; an invalid
/// preamble gets no answer.
pub fn perform_server_handshake<S: Read + Write>(stream: &mut S) -> Result<u32, HandshakeError> {
    let mut handshake = [0_u8; HANDSHAKE_SIZE_BYTES];
    stream
        .read_exact(&mut handshake)
        .map_err(HandshakeError::Io)?;

    let negotiated = negotiate_version(&handshake);
    let answer = match &negotiated {
        Ok(version) => *version,
        Err(HandshakeError::UnsupportedVersions { .. }) => NO_VERSION,
        Err(_) => return negotiated,
    };

    stream
        .write_all(&answer.to_be_bytes())
        .and_then(|()| stream.flush())
        .map_err(HandshakeError::Io)?;
    negotiated
}
