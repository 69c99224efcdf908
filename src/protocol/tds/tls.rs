//! TDS-over-TLS handshake wrapping (§4.1.2 "TLS upgrade").
//!
//! During the handshake, TLS records travel encapsulated inside
//! packets of type PRELOGIN; once the handshake completes, the TDS
//! stream continues in cleartext over the now-encrypted transport.
//! This wrapper lets a standard TLS acceptor (`tokio_rustls`) drive the
//! handshake over a stream that still needs TDS packet framing,
//! mirroring the client-side wrapper real drivers use, but from the
//! server's side of the exchange.

use std::io;
use std::pin::Pin;
use std::task::{self, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::protocol::tds::packet::{PacketStatus, PacketType, HEADER_LEN};

/// Which byte a client sends first after PRELOGIN to begin the TLS
/// handshake (§4.1.2): `0x12` means the ClientHello is itself wrapped
/// in a PRELOGIN packet (common Go driver); `0x16` means a raw TLS
/// record follows immediately (common JDBC driver).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientHelloVariant {
    WrappedInPrelogin,
    RawTlsRecord,
}

pub fn detect_client_hello_variant(first_byte: u8) -> Option<ClientHelloVariant> {
    match first_byte {
        0x12 => Some(ClientHelloVariant::WrappedInPrelogin),
        0x16 => Some(ClientHelloVariant::RawTlsRecord),
        _ => None,
    }
}

const NEGOTIATED_SIZE_DURING_HANDSHAKE: u16 = 4096;

/// Wraps a raw connection so that, while `pending_handshake` is set,
/// reads strip incoming PRELOGIN packet headers and writes buffer then
/// wrap outgoing bytes in a single PRELOGIN packet on flush. Once the
/// handshake completes the wrapper is a transparent passthrough.
pub struct TlsPreloginWrapper<S> {
    stream: S,
    pending_handshake: bool,

    header_buf: [u8; HEADER_LEN],
    header_pos: usize,
    read_remaining: usize,

    wr_buf: Vec<u8>,
    next_packet_id: u8,
}

impl<S> TlsPreloginWrapper<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            pending_handshake: false,
            header_buf: [0u8; HEADER_LEN],
            header_pos: 0,
            read_remaining: 0,
            wr_buf: Vec::new(),
            next_packet_id: 1,
        }
    }

    pub fn start_handshake(&mut self) {
        self.pending_handshake = true;
    }

    pub fn handshake_complete(&mut self) {
        self.pending_handshake = false;
    }

    fn bump_packet_id(&mut self) -> u8 {
        let id = self.next_packet_id;
        self.next_packet_id = if id == 255 { 1 } else { id + 1 };
        id
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TlsPreloginWrapper<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let inner = self.get_mut();
        if !inner.pending_handshake {
            return Pin::new(&mut inner.stream).poll_read(cx, buf);
        }

        if inner.header_pos < HEADER_LEN {
            while inner.header_pos < HEADER_LEN {
                let mut header_read = ReadBuf::new(&mut inner.header_buf[inner.header_pos..]);
                match Pin::new(&mut inner.stream).poll_read(cx, &mut header_read) {
                    Poll::Ready(Ok(())) => {
                        let n = header_read.filled().len();
                        if n == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        inner.header_pos += n;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            }
            let length = u16::from_be_bytes([inner.header_buf[2], inner.header_buf[3]]) as usize;
            inner.read_remaining = length.saturating_sub(HEADER_LEN);
        }

        let max_read = inner.read_remaining.min(buf.remaining());
        let mut limited = buf.take(max_read);
        match Pin::new(&mut inner.stream).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                buf.advance(n);
                inner.read_remaining -= n;
                if inner.read_remaining == 0 {
                    inner.header_pos = 0;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TlsPreloginWrapper<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let inner = self.get_mut();
        if !inner.pending_handshake {
            return Pin::new(&mut inner.stream).poll_write(_cx, buf);
        }
        inner.wr_buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        let inner = self.get_mut();
        if inner.pending_handshake && !inner.wr_buf.is_empty() {
            let payload = std::mem::take(&mut inner.wr_buf);
            let chunk_size = (NEGOTIATED_SIZE_DURING_HANDSHAKE as usize - HEADER_LEN).max(1);
            let mut framed = Vec::with_capacity(payload.len() + HEADER_LEN);
            let mut offset = 0;
            while offset < payload.len() || framed.is_empty() {
                let end = (offset + chunk_size).min(payload.len());
                let is_last = end == payload.len();
                let chunk = &payload[offset..end];
                let length = (HEADER_LEN + chunk.len()) as u16;
                framed.push(PacketType::PreLogin as u8);
                framed.push(if is_last { PacketStatus::EOM.bits() } else { 0 });
                framed.extend_from_slice(&length.to_be_bytes());
                framed.extend_from_slice(&0u16.to_be_bytes()); // SPID unset during handshake
                framed.push(inner.bump_packet_id());
                framed.push(0);
                framed.extend_from_slice(chunk);
                offset = end;
                if payload.is_empty() {
                    break;
                }
            }
            inner.wr_buf = framed;
        }

        while !inner.wr_buf.is_empty() {
            let buf = inner.wr_buf.clone();
            match Pin::new(&mut inner.stream).poll_write(cx, &buf) {
                Poll::Ready(Ok(n)) => {
                    inner.wr_buf.drain(..n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut inner.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<io::Result<()>> {
        let inner = self.get_mut();
        Pin::new(&mut inner.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_wrapped_and_raw_variants() {
        assert_eq!(
            detect_client_hello_variant(0x12),
            Some(ClientHelloVariant::WrappedInPrelogin)
        );
        assert_eq!(
            detect_client_hello_variant(0x16),
            Some(ClientHelloVariant::RawTlsRecord)
        );
        assert_eq!(detect_client_hello_variant(0x00), None);
    }
}
