//! Wire format parsing and serialization.
//!
//! Every datagram begins with a 4-byte common prefix followed by
//! kind-specific fields.
//!
//! ## Common Prefix (4 bytes)
//!
//! ```text
//! [ver(4bits)+kind(4bits):1][reserved:1][len:2 LE]
//! ```
//!
//! ## Datagram Kinds
//!
//! | Kind | Message         | Description                              |
//! |------|-----------------|------------------------------------------|
//! | 0x0  | Sealed record   | Post-handshake encrypted data            |
//! | 0x1  | ClientHello     | Handshake initiation, optional cookie    |
//! | 0x2  | HelloVerify     | Stateless cookie challenge               |
//! | 0x3  | ServerFlight    | Server certificate + key exchange        |
//! | 0x4  | ClientFlight    | Client certificate + key exchange + MAC  |
//! | 0x5  | ServerFinished  | Server finished MAC                      |
//! | 0x6  | Plain alert     | Pre-key alert (handshake phase only)     |

use super::{EngineError, COOKIE_SIZE};
use crate::cert::SUBKEY_ID_SIZE;

/// Wire protocol version (4 high bits of byte 0).
pub(super) const WIRE_VERSION: u8 = 1;

/// Kind values (4 low bits of byte 0).
pub(super) const KIND_SEALED: u8 = 0x0;
pub(super) const KIND_CLIENT_HELLO: u8 = 0x1;
pub(super) const KIND_HELLO_VERIFY: u8 = 0x2;
pub(super) const KIND_SERVER_FLIGHT: u8 = 0x3;
pub(super) const KIND_CLIENT_FLIGHT: u8 = 0x4;
pub(super) const KIND_SERVER_FINISHED: u8 = 0x5;
pub(super) const KIND_PLAIN_ALERT: u8 = 0x6;

/// Size of the common prefix.
pub(super) const PREFIX_SIZE: usize = 4;

/// Size of the full sealed-record header (prefix + sequence number); the
/// whole header is the record AAD.
pub(super) const SEALED_HEADER_SIZE: usize = PREFIX_SIZE + 8;

/// Sealed-record inner types (first plaintext byte).
pub(super) const REC_DATA: u8 = 1;
pub(super) const REC_ALERT: u8 = 2;
pub(super) const REC_HB_PING: u8 = 3;
pub(super) const REC_HB_PONG: u8 = 4;

pub(super) const RANDOM_SIZE: usize = 32;
pub(super) const EPHEMERAL_SIZE: usize = 33;
pub(super) const SIG_SIZE: usize = 64;
pub(super) const MAC_SIZE: usize = 32;

/// ServerFlight flag: client certificate requested.
pub(super) const FLAG_CERT_REQUEST: u8 = 0x01;

/// Parsed common prefix.
#[derive(Clone, Copy, Debug)]
pub(super) struct Prefix {
    pub version: u8,
    pub kind: u8,
    pub len: u16,
}

impl Prefix {
    pub(super) fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < PREFIX_SIZE {
            return None;
        }
        Some(Self {
            version: data[0] >> 4,
            kind: data[0] & 0x0F,
            len: u16::from_le_bytes([data[2], data[3]]),
        })
    }

    pub(super) fn encode(kind: u8, len: usize) -> [u8; PREFIX_SIZE] {
        let len = len as u16;
        let mut prefix = [0u8; PREFIX_SIZE];
        prefix[0] = (WIRE_VERSION << 4) | (kind & 0x0F);
        prefix[2..4].copy_from_slice(&len.to_le_bytes());
        prefix
    }
}

/// Assemble a full datagram: prefix + body.
pub(super) fn datagram(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREFIX_SIZE + body.len());
    out.extend_from_slice(&Prefix::encode(kind, body.len()));
    out.extend_from_slice(body);
    out
}

/// Split a datagram into its prefix and exactly `len` body bytes.
///
/// Trailing bytes beyond the declared length are tolerated (datagram
/// padding); a short body is an error.
pub(super) fn body<'a>(
    data: &'a [u8],
    what: &'static str,
) -> Result<(Prefix, &'a [u8]), EngineError> {
    let prefix = Prefix::parse(data).ok_or(EngineError::Malformed(what))?;
    if prefix.version != WIRE_VERSION {
        return Err(EngineError::Malformed(what));
    }
    let end = PREFIX_SIZE + prefix.len as usize;
    if data.len() < end {
        return Err(EngineError::Malformed(what));
    }
    Ok((prefix, &data[PREFIX_SIZE..end]))
}

// ============================================================================
// Handshake Messages
// ============================================================================

/// ClientHello body:
/// `[random:32][cert_type:1][suite:1][cookie_len:1][cookie...]`
#[derive(Clone, Debug)]
pub(super) struct ClientHello {
    pub random: [u8; RANDOM_SIZE],
    pub cert_type: u8,
    pub suite: u8,
    pub cookie: Vec<u8>,
}

impl ClientHello {
    pub(super) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RANDOM_SIZE + 3 + self.cookie.len());
        out.extend_from_slice(&self.random);
        out.push(self.cert_type);
        out.push(self.suite);
        out.push(self.cookie.len() as u8);
        out.extend_from_slice(&self.cookie);
        out
    }

    pub(super) fn parse(body: &[u8]) -> Result<Self, EngineError> {
        const FIXED: usize = RANDOM_SIZE + 3;
        if body.len() < FIXED {
            return Err(EngineError::Malformed("client hello"));
        }
        let mut random = [0u8; RANDOM_SIZE];
        random.copy_from_slice(&body[..RANDOM_SIZE]);
        let cert_type = body[RANDOM_SIZE];
        let suite = body[RANDOM_SIZE + 1];
        let cookie_len = body[RANDOM_SIZE + 2] as usize;
        if body.len() < FIXED + cookie_len {
            return Err(EngineError::Malformed("client hello"));
        }
        Ok(Self {
            random,
            cert_type,
            suite,
            cookie: body[FIXED..FIXED + cookie_len].to_vec(),
        })
    }
}

/// HelloVerify body: `[cookie:32]`
#[derive(Clone, Debug)]
pub(super) struct HelloVerify {
    pub cookie: [u8; COOKIE_SIZE],
}

impl HelloVerify {
    pub(super) fn encode(&self) -> Vec<u8> {
        self.cookie.to_vec()
    }

    pub(super) fn parse(body: &[u8]) -> Result<Self, EngineError> {
        if body.len() != COOKIE_SIZE {
            return Err(EngineError::Malformed("hello verify"));
        }
        let mut cookie = [0u8; COOKIE_SIZE];
        cookie.copy_from_slice(body);
        Ok(Self { cookie })
    }
}

/// ServerFlight body:
/// `[random:32][suite:1][cert_type:1][cert_len:2 LE][cert][subkey_id:8][ephemeral:33][sig:64][flags:1]`
///
/// The signature covers the transcript up to and including everything before
/// it in this message.
#[derive(Clone, Debug)]
pub(super) struct ServerFlight {
    pub random: [u8; RANDOM_SIZE],
    pub suite: u8,
    pub cert_type: u8,
    pub cert: Vec<u8>,
    pub subkey_id: [u8; SUBKEY_ID_SIZE],
    pub ephemeral: [u8; EPHEMERAL_SIZE],
    pub sig: [u8; SIG_SIZE],
    pub flags: u8,
}

impl ServerFlight {
    /// Encode the fields the transcript signature covers.
    pub(super) fn encode_presig(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(RANDOM_SIZE + 4 + self.cert.len() + SUBKEY_ID_SIZE + EPHEMERAL_SIZE);
        out.extend_from_slice(&self.random);
        out.push(self.suite);
        out.push(self.cert_type);
        out.extend_from_slice(&(self.cert.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.cert);
        out.extend_from_slice(&self.subkey_id);
        out.extend_from_slice(&self.ephemeral);
        out
    }

    pub(super) fn encode(&self) -> Vec<u8> {
        let mut out = self.encode_presig();
        out.extend_from_slice(&self.sig);
        out.push(self.flags);
        out
    }

    /// Parse, returning the message and the presig byte count.
    pub(super) fn parse(body: &[u8]) -> Result<(Self, usize), EngineError> {
        const WHAT: &str = "server flight";
        let fixed_head = RANDOM_SIZE + 4;
        if body.len() < fixed_head {
            return Err(EngineError::Malformed(WHAT));
        }
        let mut random = [0u8; RANDOM_SIZE];
        random.copy_from_slice(&body[..RANDOM_SIZE]);
        let suite = body[RANDOM_SIZE];
        let cert_type = body[RANDOM_SIZE + 1];
        let cert_len =
            u16::from_le_bytes([body[RANDOM_SIZE + 2], body[RANDOM_SIZE + 3]]) as usize;

        let presig_len = fixed_head + cert_len + SUBKEY_ID_SIZE + EPHEMERAL_SIZE;
        if body.len() != presig_len + SIG_SIZE + 1 {
            return Err(EngineError::Malformed(WHAT));
        }
        let cert = body[fixed_head..fixed_head + cert_len].to_vec();

        let mut pos = fixed_head + cert_len;
        let mut subkey_id = [0u8; SUBKEY_ID_SIZE];
        subkey_id.copy_from_slice(&body[pos..pos + SUBKEY_ID_SIZE]);
        pos += SUBKEY_ID_SIZE;

        let mut ephemeral = [0u8; EPHEMERAL_SIZE];
        ephemeral.copy_from_slice(&body[pos..pos + EPHEMERAL_SIZE]);
        pos += EPHEMERAL_SIZE;

        let mut sig = [0u8; SIG_SIZE];
        sig.copy_from_slice(&body[pos..pos + SIG_SIZE]);
        pos += SIG_SIZE;

        let flags = body[pos];

        Ok((
            Self {
                random,
                suite,
                cert_type,
                cert,
                subkey_id,
                ephemeral,
                sig,
                flags,
            },
            presig_len,
        ))
    }
}

/// ClientFlight body:
/// `[cert_len:2 LE][cert][subkey_id:8][ephemeral:33][sig:64][mac:32]`
#[derive(Clone, Debug)]
pub(super) struct ClientFlight {
    pub cert: Vec<u8>,
    pub subkey_id: [u8; SUBKEY_ID_SIZE],
    pub ephemeral: [u8; EPHEMERAL_SIZE],
    pub sig: [u8; SIG_SIZE],
    pub mac: [u8; MAC_SIZE],
}

impl ClientFlight {
    /// Encode the fields the transcript signature covers.
    pub(super) fn encode_presig(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.cert.len() + SUBKEY_ID_SIZE + EPHEMERAL_SIZE);
        out.extend_from_slice(&(self.cert.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.cert);
        out.extend_from_slice(&self.subkey_id);
        out.extend_from_slice(&self.ephemeral);
        out
    }

    pub(super) fn encode(&self) -> Vec<u8> {
        let mut out = self.encode_presig();
        out.extend_from_slice(&self.sig);
        out.extend_from_slice(&self.mac);
        out
    }

    /// Parse, returning the message and the presig byte count.
    pub(super) fn parse(body: &[u8]) -> Result<(Self, usize), EngineError> {
        const WHAT: &str = "client flight";
        if body.len() < 2 {
            return Err(EngineError::Malformed(WHAT));
        }
        let cert_len = u16::from_le_bytes([body[0], body[1]]) as usize;
        let presig_len = 2 + cert_len + SUBKEY_ID_SIZE + EPHEMERAL_SIZE;
        if body.len() != presig_len + SIG_SIZE + MAC_SIZE {
            return Err(EngineError::Malformed(WHAT));
        }
        let cert = body[2..2 + cert_len].to_vec();

        let mut pos = 2 + cert_len;
        let mut subkey_id = [0u8; SUBKEY_ID_SIZE];
        subkey_id.copy_from_slice(&body[pos..pos + SUBKEY_ID_SIZE]);
        pos += SUBKEY_ID_SIZE;

        let mut ephemeral = [0u8; EPHEMERAL_SIZE];
        ephemeral.copy_from_slice(&body[pos..pos + EPHEMERAL_SIZE]);
        pos += EPHEMERAL_SIZE;

        let mut sig = [0u8; SIG_SIZE];
        sig.copy_from_slice(&body[pos..pos + SIG_SIZE]);
        pos += SIG_SIZE;

        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(&body[pos..pos + MAC_SIZE]);

        Ok((
            Self {
                cert,
                subkey_id,
                ephemeral,
                sig,
                mac,
            },
            presig_len,
        ))
    }
}

/// ServerFinished body: `[mac:32]`
#[derive(Clone, Debug)]
pub(super) struct ServerFinished {
    pub mac: [u8; MAC_SIZE],
}

impl ServerFinished {
    pub(super) fn encode(&self) -> Vec<u8> {
        self.mac.to_vec()
    }

    pub(super) fn parse(body: &[u8]) -> Result<Self, EngineError> {
        if body.len() != MAC_SIZE {
            return Err(EngineError::Malformed("server finished"));
        }
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(body);
        Ok(Self { mac })
    }
}

/// Plain alert body (handshake phase): `[level:1][code:1]`
#[derive(Clone, Copy, Debug)]
pub(super) struct PlainAlert {
    pub level: u8,
    pub code: u8,
}

impl PlainAlert {
    pub(super) fn encode(&self) -> Vec<u8> {
        vec![self.level, self.code]
    }

    pub(super) fn parse(body: &[u8]) -> Result<Self, EngineError> {
        if body.len() != 2 {
            return Err(EngineError::Malformed("alert"));
        }
        Ok(Self {
            level: body[0],
            code: body[1],
        })
    }
}

/// Build a sealed-record header: prefix + sequence number. Used as AAD.
pub(super) fn sealed_header(seq: u64, ciphertext_len: usize) -> [u8; SEALED_HEADER_SIZE] {
    let mut header = [0u8; SEALED_HEADER_SIZE];
    header[..PREFIX_SIZE].copy_from_slice(&Prefix::encode(KIND_SEALED, ciphertext_len));
    header[PREFIX_SIZE..].copy_from_slice(&seq.to_le_bytes());
    header
}

/// Parse a sealed record into (header-as-AAD, seq, ciphertext).
pub(super) fn parse_sealed(data: &[u8]) -> Result<(&[u8], u64, &[u8]), EngineError> {
    const WHAT: &str = "sealed record";
    let prefix = Prefix::parse(data).ok_or(EngineError::Malformed(WHAT))?;
    if prefix.version != WIRE_VERSION || prefix.kind != KIND_SEALED {
        return Err(EngineError::Malformed(WHAT));
    }
    if data.len() < SEALED_HEADER_SIZE {
        return Err(EngineError::Malformed(WHAT));
    }
    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&data[PREFIX_SIZE..SEALED_HEADER_SIZE]);
    let seq = u64::from_le_bytes(seq_bytes);

    let end = SEALED_HEADER_SIZE + prefix.len as usize;
    if data.len() < end {
        return Err(EngineError::Malformed(WHAT));
    }
    Ok((
        &data[..SEALED_HEADER_SIZE],
        seq,
        &data[SEALED_HEADER_SIZE..end],
    ))
}
