//! In-memory message representation.

use std::fmt;

use bytes::Bytes;

use crate::error::WireError;
use crate::header::{MsgType, IDENTITY_SIZE, MAX_ACTOR_LEN, MAX_DATA_LEN, MAX_HEADER_LEN};

/// Fixed-size opaque identity token.
///
/// Used both as the node identity exchanged in the handshake and as the
/// per-message identity echoed back in acknowledgements.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Identity(pub [u8; IDENTITY_SIZE]);

impl Identity {
    /// Build an identity from up to 16 bytes, zero padding the rest
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > IDENTITY_SIZE {
            return Err(WireError::Segment {
                segment: "identity",
                len: bytes.len(),
                max: IDENTITY_SIZE,
            });
        }
        let mut id = [0u8; IDENTITY_SIZE];
        id[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; IDENTITY_SIZE] {
        &self.0
    }
}

impl From<[u8; IDENTITY_SIZE]> for Identity {
    fn from(value: [u8; IDENTITY_SIZE]) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// One unit of application data plus routing metadata.
///
/// Segments are `Bytes`, so cloning a message is cheap and messages decoded
/// by the reader share the receive buffer instead of copying it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    /// Opaque identity token chosen by the application
    pub identity: Identity,
    /// Serial assigned when the message is sent
    pub serial: u32,
    /// Type flags
    pub typ: MsgType,
    /// Small application routing metadata
    pub header: Bytes,
    /// Handler or address tag
    pub actor: Bytes,
    /// Bulk payload
    pub data: Bytes,
}

impl Message {
    /// Create an empty message with the given identity
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            ..Self::default()
        }
    }

    /// Set the header segment
    pub fn with_header(mut self, header: impl Into<Bytes>) -> Self {
        self.header = header.into();
        self
    }

    /// Set the actor segment
    pub fn with_actor(mut self, actor: impl Into<Bytes>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Set the data segment
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    /// Build the ACK frame answering this message
    pub fn ack(&self) -> Self {
        Self {
            identity: self.identity,
            serial: self.serial,
            typ: MsgType::ACK,
            ..Self::default()
        }
    }

    /// Whether the sender asked for an acknowledgement
    pub fn requires_ack(&self) -> bool {
        self.typ.contains(MsgType::REQ_ACK)
    }

    /// Whether this is an acknowledgement frame
    pub fn is_ack(&self) -> bool {
        self.typ.contains(MsgType::ACK)
    }

    /// Total length of the three segments
    pub fn body_len(&self) -> usize {
        self.header.len() + self.actor.len() + self.data.len()
    }

    /// Check that every segment fits its length field
    pub fn validate(&self) -> Result<(), WireError> {
        check_segment("header", self.header.len(), MAX_HEADER_LEN)?;
        check_segment("actor", self.actor.len(), MAX_ACTOR_LEN)?;
        check_segment("data", self.data.len(), MAX_DATA_LEN)?;
        Ok(())
    }
}

fn check_segment(segment: &'static str, len: usize, max: usize) -> Result<(), WireError> {
    if len > max {
        return Err(WireError::Segment { segment, len, max });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_from_slice_pads() {
        let id = Identity::from_slice(b"A").unwrap();
        assert_eq!(id.0[0], b'A');
        assert!(id.0[1..].iter().all(|b| *b == 0));
        assert!(Identity::from_slice(&[0u8; 17]).is_err());
    }

    #[test]
    fn test_ack_echoes_identity_and_serial() {
        let mut msg = Message::new(Identity::from_slice(b"xyz").unwrap())
            .with_actor(vec![1u8])
            .with_data("ping");
        msg.serial = 77;
        msg.typ = MsgType::REQ_ACK;

        let ack = msg.ack();
        assert!(ack.is_ack());
        assert!(!ack.requires_ack());
        assert_eq!(ack.identity, msg.identity);
        assert_eq!(ack.serial, 77);
        assert_eq!(ack.body_len(), 0);
    }

    #[test]
    fn test_validate_rejects_oversized_header() {
        let msg = Message::default().with_header(vec![0u8; MAX_HEADER_LEN + 1]);
        assert!(matches!(
            msg.validate(),
            Err(WireError::Segment { segment: "header", .. })
        ));
    }
}
