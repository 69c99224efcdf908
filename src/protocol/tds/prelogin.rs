//! PRELOGIN negotiation (§4.1.2, §8 invariant S1).
//!
//! Token-offset format: each option is a 1-byte id, 2-byte big-endian
//! offset, 2-byte big-endian length, terminated by 0xFF. The data
//! section follows the option table in the same order.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ProtocolError, ServerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    Version = 0x00,
    Encryption = 0x01,
    Instance = 0x02,
    ThreadId = 0x03,
    Mars = 0x04,
    TraceId = 0x05,
    FedAuthRequired = 0x06,
    Nonce = 0x07,
    Terminator = 0xFF,
}

impl PreLoginOption {
    pub fn from_u8(value: u8) -> Option<Self> {
        use PreLoginOption::*;
        Some(match value {
            0x00 => Version,
            0x01 => Encryption,
            0x02 => Instance,
            0x03 => ThreadId,
            0x04 => Mars,
            0x05 => TraceId,
            0x06 => FedAuthRequired,
            0x07 => Nonce,
            0xFF => Terminator,
            _ => return None,
        })
    }
}

/// ENCRYPTION option byte (§4.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncryptionLevel {
    Off = 0x00,
    On = 0x01,
    NotSupported = 0x02,
    Required = 0x03,
    ClientCertAuth = 0x80,
}

impl EncryptionLevel {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => EncryptionLevel::Off,
            0x01 => EncryptionLevel::On,
            0x02 => EncryptionLevel::NotSupported,
            0x80 => EncryptionLevel::ClientCertAuth,
            _ => EncryptionLevel::Required,
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, EncryptionLevel::Required | EncryptionLevel::ClientCertAuth)
    }
}

/// Outcome of negotiating client/server ENCRYPTION bytes (§4.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionOutcome {
    /// Neither side wants TLS: plaintext TDS for the whole connection.
    NoTls,
    /// One or both sides asked for TLS: upgrade, then continue in
    /// cleartext-over-TLS.
    TlsThenCleartext,
    /// TDS 8.0 strict encryption: TLS must complete before any TDS byte.
    StrictTlsFirst,
    /// Server cannot satisfy a client REQUIRED; deny with a single 'N'.
    Deny,
}

pub fn negotiate_encryption(client: EncryptionLevel, server: EncryptionLevel) -> EncryptionOutcome {
    if server == EncryptionLevel::NotSupported && client.is_required() {
        return EncryptionOutcome::Deny;
    }
    match (client, server) {
        (EncryptionLevel::Off, EncryptionLevel::Off) => EncryptionOutcome::NoTls,
        _ if client.is_required() || server.is_required() => EncryptionOutcome::StrictTlsFirst,
        _ => EncryptionOutcome::TlsThenCleartext,
    }
}

#[derive(Debug, Clone)]
pub struct TraceId {
    pub activity_id: [u8; 16],
    pub activity_sequence: u32,
}

/// A parsed (or to-be-encoded) PRELOGIN message.
#[derive(Debug, Clone, Default)]
pub struct PreLogin {
    pub version: u32,
    pub sub_build: u16,
    pub encryption: Option<EncryptionLevel>,
    pub instance: Option<String>,
    pub thread_id: Option<u32>,
    pub mars: Option<bool>,
    pub trace_id: Option<TraceId>,
    pub fed_auth_required: Option<bool>,
    pub nonce: Option<[u8; 32]>,
}

impl PreLogin {
    pub fn with_version(mut self, version: u32, sub_build: u16) -> Self {
        self.version = version;
        self.sub_build = sub_build;
        self
    }

    pub fn with_encryption(mut self, encryption: EncryptionLevel) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn with_mars(mut self, enabled: bool) -> Self {
        self.mars = Some(enabled);
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Encode into the token-offset wire format (§4.1.2).
    pub fn encode(&self) -> Vec<u8> {
        let mut options: Vec<(PreLoginOption, Vec<u8>)> = Vec::new();

        let mut version_bytes = BytesMut::with_capacity(6);
        version_bytes.put_u32(self.version);
        version_bytes.put_u16(self.sub_build);
        options.push((PreLoginOption::Version, version_bytes.to_vec()));

        if let Some(encryption) = self.encryption {
            options.push((PreLoginOption::Encryption, vec![encryption as u8]));
        }
        if let Some(instance) = &self.instance {
            let mut bytes = instance.as_bytes().to_vec();
            bytes.push(0);
            options.push((PreLoginOption::Instance, bytes));
        }
        if let Some(thread_id) = self.thread_id {
            options.push((PreLoginOption::ThreadId, thread_id.to_be_bytes().to_vec()));
        }
        if let Some(mars) = self.mars {
            options.push((PreLoginOption::Mars, vec![mars as u8]));
        }
        if let Some(trace) = &self.trace_id {
            let mut bytes = Vec::with_capacity(20);
            bytes.extend_from_slice(&trace.activity_id);
            bytes.extend_from_slice(&trace.activity_sequence.to_le_bytes());
            options.push((PreLoginOption::TraceId, bytes));
        }
        if let Some(fed_auth) = self.fed_auth_required {
            options.push((PreLoginOption::FedAuthRequired, vec![fed_auth as u8]));
        }
        if let Some(nonce) = self.nonce {
            options.push((PreLoginOption::Nonce, nonce.to_vec()));
        }

        // 5 bytes per option (id + offset + length) plus the 1-byte
        // terminator, then the concatenated data section.
        let header_len = options.len() * 5 + 1;
        let mut out = BytesMut::with_capacity(header_len + options.iter().map(|(_, d)| d.len()).sum::<usize>());

        let mut offset = header_len as u16;
        for (option, data) in &options {
            out.put_u8(*option as u8);
            out.put_u16(offset);
            out.put_u16(data.len() as u16);
            offset += data.len() as u16;
        }
        out.put_u8(PreLoginOption::Terminator as u8);
        for (_, data) in &options {
            out.put_slice(data);
        }
        out.to_vec()
    }

    /// Parse the token-offset format produced by [`PreLogin::encode`] or
    /// a real client/server (§4.1.2, §8 S1).
    pub fn decode(buf: &[u8]) -> ServerResult<Self> {
        let mut cursor = buf;
        let mut entries = Vec::new();

        loop {
            if cursor.is_empty() {
                return Err(ProtocolError::BadPrelogin("missing terminator".into()).into());
            }
            let id = cursor.get_u8();
            if id == PreLoginOption::Terminator as u8 {
                break;
            }
            let option = PreLoginOption::from_u8(id)
                .ok_or_else(|| ProtocolError::BadPrelogin(format!("unknown option id {id:#x}")))?;
            if cursor.remaining() < 4 {
                return Err(ProtocolError::BadPrelogin("truncated option header".into()).into());
            }
            let offset = cursor.get_u16() as usize;
            let length = cursor.get_u16() as usize;
            entries.push((option, offset, length));
        }

        let mut prelogin = PreLogin::default();
        for (option, offset, length) in entries {
            if offset + length > buf.len() {
                return Err(ProtocolError::BadPrelogin(format!(
                    "option {option:?} data out of range"
                ))
                .into());
            }
            let data = &buf[offset..offset + length];
            match option {
                PreLoginOption::Version if length >= 6 => {
                    prelogin.version = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    prelogin.sub_build = u16::from_be_bytes([data[4], data[5]]);
                }
                PreLoginOption::Encryption if length >= 1 => {
                    prelogin.encryption = Some(EncryptionLevel::from_u8(data[0]));
                }
                PreLoginOption::Instance => {
                    let text = data.split(|b| *b == 0).next().unwrap_or(data);
                    prelogin.instance = Some(String::from_utf8_lossy(text).into_owned());
                }
                PreLoginOption::ThreadId if length >= 4 => {
                    prelogin.thread_id =
                        Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                }
                PreLoginOption::Mars if length >= 1 => {
                    prelogin.mars = Some(data[0] != 0);
                }
                PreLoginOption::TraceId if length >= 20 => {
                    let mut activity_id = [0u8; 16];
                    activity_id.copy_from_slice(&data[0..16]);
                    let activity_sequence =
                        u32::from_le_bytes([data[16], data[17], data[18], data[19]]);
                    prelogin.trace_id = Some(TraceId {
                        activity_id,
                        activity_sequence,
                    });
                }
                PreLoginOption::FedAuthRequired if length >= 1 => {
                    prelogin.fed_auth_required = Some(data[0] != 0);
                }
                PreLoginOption::Nonce if length >= 32 => {
                    let mut nonce = [0u8; 32];
                    nonce.copy_from_slice(&data[0..32]);
                    prelogin.nonce = Some(nonce);
                }
                _ => {}
            }
        }
        Ok(prelogin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_version_and_encryption() {
        let prelogin = PreLogin::default()
            .with_version(0x0F000000, 0)
            .with_encryption(EncryptionLevel::On)
            .with_mars(false)
            .with_instance("");
        let bytes = prelogin.encode();
        let decoded = PreLogin::decode(&bytes).unwrap();
        assert_eq!(decoded.version, 0x0F000000);
        assert_eq!(decoded.encryption, Some(EncryptionLevel::On));
        assert_eq!(decoded.mars, Some(false));
    }

    #[test]
    fn negotiate_off_off_means_no_tls() {
        assert_eq!(
            negotiate_encryption(EncryptionLevel::Off, EncryptionLevel::Off),
            EncryptionOutcome::NoTls
        );
    }

    #[test]
    fn negotiate_required_forces_tls() {
        assert_eq!(
            negotiate_encryption(EncryptionLevel::Required, EncryptionLevel::Off),
            EncryptionOutcome::StrictTlsFirst
        );
    }

    #[test]
    fn negotiate_denies_when_server_cannot_satisfy_required() {
        assert_eq!(
            negotiate_encryption(EncryptionLevel::Required, EncryptionLevel::NotSupported),
            EncryptionOutcome::Deny
        );
    }

    #[test]
    fn decode_fails_without_terminator() {
        let err = PreLogin::decode(&[0x00, 0x00, 0x06, 0x00, 0x06]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::ServerError::Protocol(ProtocolError::BadPrelogin(_))
        ));
    }
}
