//! Wire message model and serialization for the peer protocol

use bytes::{Buf, BufMut, Bytes};

use super::{PeerError, PieceIndex};

/// Decoded peer wire protocol messages.
///
/// Covers the BEP 3 base set plus the advisory `Suggest` message (BEP 6)
/// and the `Extended` envelope (BEP 10) consumed by extension plugins.
/// Framing happens below this layer; the engine receives these already
/// decoded and serializes them for the outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Zero-length no-op that only resets the peer's idle timer
    KeepAlive,
    /// Inform peer that we are choking them
    Choke,
    /// Inform peer that we are no longer choking them
    Unchoke,
    /// Inform peer that we are interested in their pieces
    Interested,
    /// Inform peer that we are not interested in their pieces
    NotInterested,
    /// Inform peer that we have acquired a specific piece
    Have { piece_index: PieceIndex },
    /// Complete piece availability bitmap
    Bitfield { bitfield: Bytes },
    /// Request a block of data from a piece
    Request {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// A block of piece data
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// DHT listen port announcement
    Port { port: u16 },
    /// Advisory hint that the peer should fetch this piece from us
    Suggest { piece_index: PieceIndex },
    /// Extension protocol envelope; payload semantics belong to plugins
    Extended { id: u8, payload: Bytes },
}

impl PeerMessage {
    /// Short event name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep_alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not_interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
            PeerMessage::Port { .. } => "port",
            PeerMessage::Suggest { .. } => "suggest",
            PeerMessage::Extended { .. } => "extended",
        }
    }
}

/// Message serialization utilities for the peer wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes a peer message as a length-prefixed wire packet.
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0); // Length = 0
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // Length = 1 + 4
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13); // Length = 1 + 4 + 4 + 4
                buf.put_u8(6);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                buf.put_u32(3); // Length = 1 + 2
                buf.put_u8(9);
                buf.put_u16(*port);
            }
            PeerMessage::Suggest { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(13);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(20);
                buf.put_u8(*id);
                buf.extend_from_slice(payload);
            }
        }

        buf
    }

    /// Deserializes a length-prefixed wire packet.
    ///
    /// # Errors
    /// - `PeerError::Protocol` - Truncated packet or unknown message id
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::Protocol {
                message: "Message too short".to_string(),
            });
        }

        let mut buf = data;
        let length = buf.get_u32();

        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }

        if data.len() < 4 + length as usize {
            return Err(PeerError::Protocol {
                message: "Incomplete message".to_string(),
            });
        }

        let message_id = buf.get_u8();

        match message_id {
            0 => Ok(PeerMessage::Choke),
            1 => Ok(PeerMessage::Unchoke),
            2 => Ok(PeerMessage::Interested),
            3 => Ok(PeerMessage::NotInterested),
            4 => {
                if length != 5 {
                    return Err(PeerError::Protocol {
                        message: "Invalid Have message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                Ok(PeerMessage::Have { piece_index })
            }
            5 => {
                let bitfield_len = length - 1;
                let bitfield = Bytes::copy_from_slice(&buf[..bitfield_len as usize]);
                Ok(PeerMessage::Bitfield { bitfield })
            }
            6 => {
                if length != 13 {
                    return Err(PeerError::Protocol {
                        message: "Invalid Request message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(PeerMessage::Request {
                    piece_index,
                    offset,
                    length,
                })
            }
            7 => {
                if length < 9 {
                    return Err(PeerError::Protocol {
                        message: "Invalid Piece message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let data_len = length - 9;
                let data = Bytes::copy_from_slice(&buf[..data_len as usize]);
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data,
                })
            }
            8 => {
                if length != 13 {
                    return Err(PeerError::Protocol {
                        message: "Invalid Cancel message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(PeerMessage::Cancel {
                    piece_index,
                    offset,
                    length,
                })
            }
            9 => {
                if length != 3 {
                    return Err(PeerError::Protocol {
                        message: "Invalid Port message length".to_string(),
                    });
                }
                let port = buf.get_u16();
                Ok(PeerMessage::Port { port })
            }
            13 => {
                if length != 5 {
                    return Err(PeerError::Protocol {
                        message: "Invalid Suggest message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                Ok(PeerMessage::Suggest { piece_index })
            }
            20 => {
                if length < 2 {
                    return Err(PeerError::Protocol {
                        message: "Invalid Extended message length".to_string(),
                    });
                }
                let id = buf.get_u8();
                let payload_len = length - 2;
                let payload = Bytes::copy_from_slice(&buf[..payload_len as usize]);
                Ok(PeerMessage::Extended { id, payload })
            }
            _ => Err(PeerError::Protocol {
                message: format!("Unknown message ID: {message_id}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_alive_roundtrip() {
        let encoded = MessageCodec::serialize_message(&PeerMessage::KeepAlive);
        assert_eq!(encoded, vec![0, 0, 0, 0]);
        let decoded = MessageCodec::deserialize_message(&encoded).unwrap();
        assert_eq!(decoded, PeerMessage::KeepAlive);
    }

    #[test]
    fn test_control_message_roundtrip() {
        for message in [
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
        ] {
            let encoded = MessageCodec::serialize_message(&message);
            assert_eq!(encoded.len(), 5);
            let decoded = MessageCodec::deserialize_message(&encoded).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_suggest_roundtrip() {
        let message = PeerMessage::Suggest {
            piece_index: PieceIndex::new(42),
        };
        let encoded = MessageCodec::serialize_message(&message);
        assert_eq!(encoded[4], 13); // BEP 6 message id
        let decoded = MessageCodec::deserialize_message(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_extended_roundtrip() {
        let message = PeerMessage::Extended {
            id: 3,
            payload: Bytes::from_static(b"d1:md11:ut_metadatai1eee"),
        };
        let encoded = MessageCodec::serialize_message(&message);
        assert_eq!(encoded[4], 20); // BEP 10 message id
        let decoded = MessageCodec::deserialize_message(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_truncated_message_rejected() {
        let mut encoded = MessageCodec::serialize_message(&PeerMessage::Request {
            piece_index: PieceIndex::new(1),
            offset: 0,
            length: 16384,
        });
        encoded.truncate(encoded.len() - 2);
        assert!(MessageCodec::deserialize_message(&encoded).is_err());
    }

    #[test]
    fn test_unknown_message_id_rejected() {
        let packet = [0u8, 0, 0, 1, 99];
        let result = MessageCodec::deserialize_message(&packet);
        assert!(matches!(result, Err(PeerError::Protocol { .. })));
    }
}
