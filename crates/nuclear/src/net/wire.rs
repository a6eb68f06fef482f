//! Wire protocol for the network transport (§4.6, §6).
//!
//! - UDP multicast announce packets: `{magic=0xE298A6, version=0x02,
//!   type=ANNOUNCE, name_len, name, tcp_port, udp_port}`.
//! - Reliable TCP frames: `{magic, version, type, length:u32, payload}`.
//! - Data packets (UDP or TCP payload) carry a 64-bit type hash identifying
//!   the message, followed by the message bytes.
//! - UDP data packets additionally carry a small fragmentation header so a
//!   message larger than the configured MTU can be split across multiple
//!   datagrams and reassembled on the receiving side, satisfying the
//!   "fragmented to MTU" requirement on the emit path (§4.6).

pub const MAGIC: u32 = 0x00E2_98A6;
pub const VERSION: u8 = 0x02;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PacketType {
    Announce = 0,
    Data = 1,
}

impl PacketType {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(PacketType::Announce),
            1 => Some(PacketType::Data),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AnnouncePacket {
    pub name: String,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl AnnouncePacket {
    pub fn encode(&self) -> Vec<u8> {
        let name_bytes = self.name.as_bytes();
        let mut out = Vec::with_capacity(4 + 1 + 1 + 2 + name_bytes.len() + 2 + 2);
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.push(VERSION);
        out.push(PacketType::Announce as u8);
        out.extend_from_slice(&(name_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(name_bytes);
        out.extend_from_slice(&self.tcp_port.to_be_bytes());
        out.extend_from_slice(&self.udp_port.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 10 {
            return None;
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
        if magic != MAGIC || bytes[4] != VERSION {
            return None;
        }
        if PacketType::from_u8(bytes[5])? != PacketType::Announce {
            return None;
        }
        let name_len = u16::from_be_bytes(bytes[6..8].try_into().ok()?) as usize;
        let name_start = 8;
        let name_end = name_start.checked_add(name_len)?;
        if bytes.len() < name_end + 4 {
            return None;
        }
        let name = String::from_utf8(bytes[name_start..name_end].to_vec()).ok()?;
        let tcp_port = u16::from_be_bytes(bytes[name_end..name_end + 2].try_into().ok()?);
        let udp_port = u16::from_be_bytes(bytes[name_end + 2..name_end + 4].try_into().ok()?);
        Some(AnnouncePacket {
            name,
            tcp_port,
            udp_port,
        })
    }
}

/// Header shared by every UDP datagram carrying a data fragment.
#[derive(Copy, Clone, Debug)]
pub struct FragmentHeader {
    pub message_id: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub type_hash: u64,
}

const FRAGMENT_HEADER_LEN: usize = 4 + 1 + 1 + 4 + 2 + 2 + 8;

impl FragmentHeader {
    pub fn encode_with_payload(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + payload.len());
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.push(VERSION);
        out.push(PacketType::Data as u8);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(&self.fragment_index.to_be_bytes());
        out.extend_from_slice(&self.fragment_count.to_be_bytes());
        out.extend_from_slice(&self.type_hash.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<(Self, &[u8])> {
        if bytes.len() < FRAGMENT_HEADER_LEN {
            return None;
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
        if magic != MAGIC || bytes[4] != VERSION {
            return None;
        }
        if PacketType::from_u8(bytes[5])? != PacketType::Data {
            return None;
        }
        let message_id = u32::from_be_bytes(bytes[6..10].try_into().ok()?);
        let fragment_index = u16::from_be_bytes(bytes[10..12].try_into().ok()?);
        let fragment_count = u16::from_be_bytes(bytes[12..14].try_into().ok()?);
        let type_hash = u64::from_be_bytes(bytes[14..22].try_into().ok()?);
        Some((
            FragmentHeader {
                message_id,
                fragment_index,
                fragment_count,
                type_hash,
            },
            &bytes[FRAGMENT_HEADER_LEN..],
        ))
    }

    pub fn overhead() -> usize {
        FRAGMENT_HEADER_LEN
    }
}

/// A reliable TCP frame: `{magic, version, type, length:u32, payload}`
/// where `payload` begins with the 8-byte type hash.
pub struct TcpFrame;

impl TcpFrame {
    pub fn encode(type_hash: u64, message: &[u8]) -> Vec<u8> {
        let payload_len = 8 + message.len();
        let mut out = Vec::with_capacity(4 + 1 + 1 + 4 + payload_len);
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.push(VERSION);
        out.push(PacketType::Data as u8);
        out.extend_from_slice(&(payload_len as u32).to_be_bytes());
        out.extend_from_slice(&type_hash.to_be_bytes());
        out.extend_from_slice(message);
        out
    }

    /// Read exactly one framed message from `stream`, looping until the
    /// declared length is satisfied rather than trusting a single `read`
    /// to return everything (§9 open question: the original's reliable
    /// read path did not retry on short reads).
    pub fn read_one(
        stream: &mut impl std::io::Read,
    ) -> std::io::Result<Option<(u64, Vec<u8>)>> {
        let mut header = [0u8; 10];
        if let Err(e) = read_exact_or_eof(stream, &mut header)? {
            return Ok(e);
        }
        let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let version = header[4];
        let frame_type = header[5];
        if magic != MAGIC || version != VERSION || frame_type != PacketType::Data as u8 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "bad TCP frame header",
            ));
        }
        let length = u32::from_be_bytes(header[6..10].try_into().unwrap()) as usize;
        if length < 8 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "TCP frame shorter than its type hash",
            ));
        }
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload)?;
        let type_hash = u64::from_be_bytes(payload[0..8].try_into().unwrap());
        Ok(Some((type_hash, payload[8..].to_vec())))
    }
}

/// Like `Read::read_exact`, but distinguishes a clean EOF on the very
/// first byte (peer closed the connection) from a short read mid-header
/// (which is still an error). Returns `Ok(Some(None))` on the former.
#[allow(clippy::type_complexity)]
fn read_exact_or_eof(
    stream: &mut impl std::io::Read,
    buf: &mut [u8],
) -> std::io::Result<Result<(), Option<(u64, Vec<u8>)>>> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(Err(None));
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            ));
        }
        filled += n;
    }
    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_roundtrips() {
        let packet = AnnouncePacket {
            name: "node-a".to_string(),
            tcp_port: 7447,
            udp_port: 40002,
        };
        let encoded = packet.encode();
        let decoded = AnnouncePacket::decode(&encoded).unwrap();
        assert_eq!(decoded.name, "node-a");
        assert_eq!(decoded.tcp_port, 7447);
        assert_eq!(decoded.udp_port, 40002);
    }

    #[test]
    fn fragment_header_roundtrips() {
        let header = FragmentHeader {
            message_id: 7,
            fragment_index: 1,
            fragment_count: 3,
            type_hash: 0xdead_beef,
        };
        let packet = header.encode_with_payload(b"hello");
        let (decoded, payload) = FragmentHeader::decode(&packet).unwrap();
        assert_eq!(decoded.message_id, 7);
        assert_eq!(decoded.fragment_index, 1);
        assert_eq!(decoded.fragment_count, 3);
        assert_eq!(decoded.type_hash, 0xdead_beef);
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn tcp_frame_roundtrips_through_a_cursor() {
        let frame = TcpFrame::encode(0x1234, b"Hello TCP World!");
        let mut cursor = std::io::Cursor::new(frame);
        let (type_hash, message) = TcpFrame::read_one(&mut cursor).unwrap().unwrap();
        assert_eq!(type_hash, 0x1234);
        assert_eq!(message, b"Hello TCP World!");
    }
}
