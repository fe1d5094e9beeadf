use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::{MAX_MESSAGE_LEN, WireError};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Request = 4,
    Piece = 5,
    Have = 6,
    Bitfield = 7,
}

impl TryFrom<u8> for MessageId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),
            4 => Ok(Self::Request),
            5 => Ok(Self::Piece),
            6 => Ok(Self::Have),
            7 => Ok(Self::Bitfield),
            _ => Err(WireError::InvalidMessageId(value)),
        }
    }
}

/// One raw frame: 4-byte big-endian length (1-byte id + payload, excluding
/// itself), the id byte, then the payload.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        let total_len = 1 + self.payload.len(); // 1 byte for ID
        let mut buf = Vec::with_capacity(4 + total_len);

        buf.extend_from_slice(&(total_len as u32).to_be_bytes()); // 4-byte length
        buf.push(self.kind as u8); // 1-byte message ID
        buf.extend_from_slice(&self.payload); // payload

        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < 4 {
            return Err(WireError::Closed);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if len == 0 || len > MAX_MESSAGE_LEN {
            return Err(WireError::InvalidLength(len));
        }
        if buf.len() < 4 + len as usize {
            return Err(WireError::Closed);
        }

        let kind = MessageId::try_from(buf[4])?;
        let payload = buf[5..4 + len as usize].to_vec();

        Ok(Self { kind, payload })
    }

    /// Reads one complete frame, retrying partial reads until the declared
    /// byte count has arrived. A clean close at any point maps to
    /// [`WireError::Closed`].
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, WireError>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(map_closed)?;

        let len = u32::from_be_bytes(len_buf);
        if len == 0 || len > MAX_MESSAGE_LEN {
            return Err(WireError::InvalidLength(len));
        }

        let mut kind_buf = [0u8; 1];
        reader.read_exact(&mut kind_buf).await.map_err(map_closed)?;
        let kind = MessageId::try_from(kind_buf[0])?;

        let mut payload = vec![0u8; len as usize - 1];
        if !payload.is_empty() {
            reader.read_exact(&mut payload).await.map_err(map_closed)?;
        }

        Ok(Self { kind, payload })
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), WireError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.serialize()).await?;
        writer.flush().await?;
        Ok(())
    }
}

fn map_closed(e: std::io::Error) -> WireError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::Closed
    } else {
        WireError::Io(e)
    }
}

/// A frame decoded into its typed payload, so handlers never touch raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Request { index: u32 },
    Piece { index: u32, data: Vec<u8> },
    Have { index: u32 },
    Bitfield(Bitfield),
}

impl From<PeerMessage> for Message {
    fn from(m: PeerMessage) -> Self {
        match m {
            PeerMessage::Choke => Message {
                kind: MessageId::Choke,
                payload: vec![],
            },
            PeerMessage::Unchoke => Message {
                kind: MessageId::Unchoke,
                payload: vec![],
            },
            PeerMessage::Interested => Message {
                kind: MessageId::Interested,
                payload: vec![],
            },
            PeerMessage::NotInterested => Message {
                kind: MessageId::NotInterested,
                payload: vec![],
            },
            PeerMessage::Request { index } => Message {
                kind: MessageId::Request,
                payload: index.to_be_bytes().to_vec(),
            },
            PeerMessage::Piece { index, data } => {
                let mut payload = Vec::with_capacity(4 + data.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&data);
                Message {
                    kind: MessageId::Piece,
                    payload,
                }
            }
            PeerMessage::Have { index } => Message {
                kind: MessageId::Have,
                payload: index.to_be_bytes().to_vec(),
            },
            PeerMessage::Bitfield(b) => Message {
                kind: MessageId::Bitfield,
                payload: b.bits,
            },
        }
    }
}

impl TryFrom<Message> for PeerMessage {
    type Error = WireError;

    fn try_from(msg: Message) -> Result<Self, Self::Error> {
        match msg.kind {
            MessageId::Choke => Ok(Self::Choke),
            MessageId::Unchoke => Ok(Self::Unchoke),
            MessageId::Interested => Ok(Self::Interested),
            MessageId::NotInterested => Ok(Self::NotInterested),
            MessageId::Request => Ok(Self::Request {
                index: index_payload(&msg)?,
            }),
            MessageId::Have => Ok(Self::Have {
                index: index_payload(&msg)?,
            }),
            MessageId::Piece => {
                if msg.payload.len() < 4 {
                    return Err(WireError::BadPayload {
                        kind: msg.kind,
                        len: msg.payload.len(),
                    });
                }
                let index = u32::from_be_bytes([
                    msg.payload[0],
                    msg.payload[1],
                    msg.payload[2],
                    msg.payload[3],
                ]);
                Ok(Self::Piece {
                    index,
                    data: msg.payload[4..].to_vec(),
                })
            }
            MessageId::Bitfield => Ok(Self::Bitfield(Bitfield { bits: msg.payload })),
        }
    }
}

fn index_payload(msg: &Message) -> Result<u32, WireError> {
    if msg.payload.len() != 4 {
        return Err(WireError::BadPayload {
            kind: msg.kind,
            len: msg.payload.len(),
        });
    }
    Ok(u32::from_be_bytes([
        msg.payload[0],
        msg.payload[1],
        msg.payload[2],
        msg.payload[3],
    ]))
}

/// A bit-per-piece presence vector, most-significant-bit-first in each byte.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitfield {
    pub bits: Vec<u8>, // raw bytes
}

impl Bitfield {
    /// All-zero bitfield sized for `count` pieces.
    pub fn from_piece_count(count: u32) -> Self {
        Bitfield {
            bits: vec![0; count.div_ceil(8) as usize],
        }
    }

    /// All-ones bitfield for `count` pieces; spare high bits of the last
    /// byte stay zero.
    pub fn full(count: u32) -> Self {
        let mut bits = vec![0xFFu8; count.div_ceil(8) as usize];
        let spare = (8 - (count % 8) as usize) % 8;
        if spare > 0 {
            if let Some(last) = bits.last_mut() {
                *last &= 0xFF << spare;
            }
        }
        Bitfield { bits }
    }

    /// Resizes raw wire bytes to exactly `count` pieces, padding missing
    /// bytes with zero bits and dropping excess bytes.
    pub fn from_bytes(bytes: &[u8], count: u32) -> Self {
        let mut bf = Self::from_piece_count(count);
        let n = bf.bits.len().min(bytes.len());
        bf.bits[..n].copy_from_slice(&bytes[..n]);
        bf
    }

    pub fn has_piece(&self, index: u32) -> bool {
        let byte = (index / 8) as usize;
        let bit = 7 - (index % 8); // MSB first
        if byte >= self.bits.len() {
            return false;
        }
        self.bits[byte] & (1 << bit) != 0
    }

    pub fn set_piece(&mut self, index: u32) {
        let byte = (index / 8) as usize;
        let bit = 7 - (index % 8);
        if byte < self.bits.len() {
            self.bits[byte] |= 1 << bit;
        }
    }

    pub fn count_set(&self, total: u32) -> u32 {
        (0..total).filter(|&i| self.has_piece(i)).count() as u32
    }

    pub fn all_set(&self, total: u32) -> bool {
        (0..total).all(|i| self.has_piece(i))
    }
}
