//! Packet framing: header + zlib-compressed message body.

use crate::error::{SyncError, SyncResult};
use crate::protocol::HEADER_LEN;
use crate::protocol_core::{
    build_frame_header, max_frame_len, parse_frame_header, validate_frame_len, FrameHeader,
};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// The only unit written to or read from a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub connection_id: u32,
    pub session_id: Uuid,
    pub packet_id: u32,
    pub message_type: [u8; 2],
    /// Compressed body
    pub payload: Vec<u8>,
}

impl Packet {
    /// Compress `body` into a new packet.
    pub fn seal(
        connection_id: u32,
        session_id: Uuid,
        packet_id: u32,
        message_type: [u8; 2],
        body: &[u8],
    ) -> SyncResult<Self> {
        Ok(Self {
            connection_id,
            session_id,
            packet_id,
            message_type,
            payload: compress(body)?,
        })
    }

    /// Inflate the body, refusing to grow past the frame limit.
    pub fn open(&self, max_packet_size: usize) -> SyncResult<Vec<u8>> {
        decompress(&self.payload, max_frame_len(max_packet_size))
    }

    /// Total bytes on the wire, which is also the `length` field.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = build_frame_header(&FrameHeader {
            length: self.wire_len() as u32,
            connection_id: self.connection_id,
            session_id: self.session_id,
            packet_id: self.packet_id,
            message_type: self.message_type,
        });
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a complete packet held in memory.
    pub fn decode(bytes: &[u8], max_packet_size: usize) -> SyncResult<Self> {
        if bytes.len() < 4 {
            return Err(SyncError::FrameLength {
                len: bytes.len() as i64,
                max: max_frame_len(max_packet_size),
            });
        }
        let declared = i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let len = validate_frame_len(declared, max_packet_size)?;
        if bytes.len() != len {
            return Err(SyncError::Protocol(format!(
                "packet declares {} bytes but {} present",
                len,
                bytes.len()
            )));
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        let h = parse_frame_header(&header);
        Ok(Self {
            connection_id: h.connection_id,
            session_id: h.session_id,
            packet_id: h.packet_id,
            message_type: h.message_type,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

pub fn compress(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::with_capacity(body.len() / 2 + 16), Compression::default());
    enc.write_all(body)?;
    enc.finish()
}

pub fn decompress(payload: &[u8], limit: usize) -> SyncResult<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(payload)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(SyncError::Protocol(format!(
            "decompressed body exceeds {} bytes",
            limit
        )));
    }
    Ok(out)
}

/// Read one packet. `Ok(None)` means the peer closed the stream cleanly
/// before a new packet started.
pub async fn read_packet<R>(reader: &mut R, max_packet_size: usize) -> SyncResult<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(SyncError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }
    // Length is checked before any further byte is read
    let len = validate_frame_len(i32::from_be_bytes(len_buf), max_packet_size)?;
    let mut rest = vec![0u8; len - 4];
    reader.read_exact(&mut rest).await?;

    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&len_buf);
    header[4..].copy_from_slice(&rest[..HEADER_LEN - 4]);
    let h = parse_frame_header(&header);
    Ok(Some(Packet {
        connection_id: h.connection_id,
        session_id: h.session_id,
        packet_id: h.packet_id,
        message_type: h.message_type,
        payload: rest.split_off(HEADER_LEN - 4),
    }))
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> SyncResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&packet.encode()).await?;
    writer.flush().await?;
    Ok(())
}
