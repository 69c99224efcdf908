//! LOGIN7 parsing (§4.1.2, §8 invariant (a), §8 scenario S2).
//!
//! A 94-byte fixed header is followed by a block of offset-pointed
//! UCS-2LE strings. Password bytes are obfuscated with a nibble-swap
//! XOR that is its own inverse.

use crate::error::{ProtocolError, ServerResult};

pub const FIXED_HEADER_LEN: usize = 94;

/// `OptionFlags1`/`OptionFlags2`/`TypeFlags` bits relevant to this
/// server (§4.1.2 "Treat option-flag bits as specified").
#[derive(Debug, Clone, Copy, Default)]
pub struct LoginOptionFlags {
    pub integrated_security: bool,
    pub read_only_intent: bool,
    pub feature_extension: bool,
}

/// A parsed LOGIN7 packet.
#[derive(Debug, Clone, Default)]
pub struct Login7 {
    pub tds_version: u32,
    pub packet_size: u32,
    pub client_pid: u32,
    pub connection_id: u32,
    pub flags: LoginOptionFlags,
    pub client_timezone: i32,
    pub client_lcid: u32,
    pub hostname: String,
    pub username: String,
    pub password: String,
    pub app_name: String,
    pub server_name: String,
    pub language: String,
    pub database: String,
    pub client_interface_name: String,
    pub attach_db_filename: String,
    pub change_password: String,
    pub sspi: Vec<u8>,
    /// Feature ids named in the FeatureExt block when `OptionFlags3`'s
    /// `fExtension` bit is set (here tracked via `flags.feature_extension`,
    /// §4.1.3 supplement "FEATUREEXTACK").
    pub feature_extension_ids: Vec<u8>,
}

/// XOR with 0xA5, then swap the nibbles. The transform is its own
/// inverse (§8 invariant (a)): `demangle(mangle(b)) = b`.
pub fn mangle_byte(b: u8) -> u8 {
    let x = b ^ 0xA5;
    (x >> 4) | (x << 4)
}

pub fn mangle_password(bytes: &mut [u8]) {
    for b in bytes.iter_mut() {
        *b = mangle_byte(*b);
    }
}

/// Decode one `(offset_u16, length_u16)` pair located at `field_offset`
/// within the fixed header, then read `length` UCS-2 code units
/// starting at `offset` in the overall packet buffer.
fn read_offset_string(buf: &[u8], field_offset: usize, label: &str) -> ServerResult<(String, usize, usize)> {
    if buf.len() < field_offset + 4 {
        return Err(ProtocolError::BadLogin7(format!("truncated {label} offset field")).into());
    }
    let offset = u16::from_le_bytes([buf[field_offset], buf[field_offset + 1]]) as usize;
    let char_count = u16::from_le_bytes([buf[field_offset + 2], buf[field_offset + 3]]) as usize;
    let byte_len = char_count * 2;
    if offset + byte_len > buf.len() {
        return Err(ProtocolError::BadLogin7(format!("{label} data out of range")).into());
    }
    let text = decode_ucs2le(&buf[offset..offset + byte_len])?;
    Ok((text, offset, byte_len))
}

fn decode_ucs2le(bytes: &[u8]) -> ServerResult<String> {
    if bytes.len() % 2 != 0 {
        return Err(ProtocolError::BadLogin7("odd-length UCS-2 string".into()).into());
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| ProtocolError::BadLogin7("invalid UTF-16 in string field".into()).into())
}

fn encode_ucs2le(text: &str) -> Vec<u8> {
    text.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

impl Login7 {
    /// Parse a LOGIN7 payload: the 94-byte fixed header followed by the
    /// variable string block (§4.1.2).
    pub fn decode(buf: &[u8]) -> ServerResult<Self> {
        if buf.len() < FIXED_HEADER_LEN {
            return Err(ProtocolError::BadLogin7(format!(
                "payload shorter than fixed header: {} < {}",
                buf.len(),
                FIXED_HEADER_LEN
            ))
            .into());
        }

        let tds_version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let packet_size = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let client_pid = u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]);
        let connection_id = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        let option_flags1 = buf[24];
        let option_flags2 = buf[25];
        let client_timezone = i32::from_le_bytes([buf[36], buf[37], buf[38], buf[39]]);
        let client_lcid = u32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]);

        let flags = LoginOptionFlags {
            integrated_security: option_flags2 & 0x80 != 0,
            read_only_intent: option_flags1 & 0x20 != 0,
            feature_extension: option_flags1 & 0x10 != 0,
        };

        // The offset/length pairs begin at byte 46 of the fixed header
        // and appear in fixed order.
        let (hostname, _, _) = read_offset_string(buf, 46, "hostname")?;
        let (username, _, _) = read_offset_string(buf, 50, "username")?;
        let (password_raw, password_offset, password_len) = read_offset_string_raw(buf, 54, "password")?;
        let (app_name, _, _) = read_offset_string(buf, 58, "app_name")?;
        let (server_name, _, _) = read_offset_string(buf, 62, "server_name")?;
        let (extension_raw, _, _) = read_offset_string_raw(buf, 66, "feature_extension")?;
        let feature_extension_ids = if flags.feature_extension {
            parse_feature_extension_ids(&extension_raw)
        } else {
            Vec::new()
        };
        let (language, _, _) = read_offset_string(buf, 70, "language")?;
        let (database, _, _) = read_offset_string(buf, 74, "database")?;
        let (client_interface_name, _, _) = read_offset_string(buf, 86, "client_interface_name")?;
        let (attach_db_filename, _, _) = read_offset_string(buf, 90, "attach_db_filename")?;

        let mut password_bytes = password_raw;
        mangle_password(&mut password_bytes);
        let password = decode_ucs2le(&password_bytes)?;
        let _ = (password_offset, password_len);

        Ok(Login7 {
            tds_version,
            packet_size,
            client_pid,
            connection_id,
            flags,
            client_timezone,
            client_lcid,
            hostname,
            username,
            password,
            app_name,
            server_name,
            language,
            database,
            client_interface_name,
            attach_db_filename,
            change_password: String::new(),
            sspi: Vec::new(),
            feature_extension_ids,
        })
    }

    /// Encode into a LOGIN7 payload suitable for property tests
    /// (§8 invariant (a)); not used on the server's reply path, which
    /// never emits a LOGIN7.
    pub fn encode(&self) -> Vec<u8> {
        let mut header = vec![0u8; FIXED_HEADER_LEN];
        header[4..8].copy_from_slice(&self.tds_version.to_be_bytes());
        header[8..12].copy_from_slice(&self.packet_size.to_le_bytes());
        header[16..20].copy_from_slice(&self.client_pid.to_le_bytes());
        header[20..24].copy_from_slice(&self.connection_id.to_le_bytes());

        let fields: [(usize, &str); 8] = [
            (46, "hostname"),
            (50, "username"),
            (54, "password"),
            (58, "app_name"),
            (62, "server_name"),
            (70, "language"),
            (74, "database"),
            (86, "client_interface_name"),
        ];
        let values = [
            &self.hostname,
            &self.username,
            &self.password,
            &self.app_name,
            &self.server_name,
            &self.language,
            &self.database,
            &self.client_interface_name,
        ];

        let mut data = Vec::new();
        let mut offset = FIXED_HEADER_LEN;
        for ((field_offset, _label), value) in fields.iter().zip(values.iter()) {
            let mut encoded = encode_ucs2le(value);
            if *field_offset == 54 {
                mangle_password(&mut encoded);
            }
            let char_count = value.encode_utf16().count() as u16;
            header[*field_offset..*field_offset + 2].copy_from_slice(&(offset as u16).to_le_bytes());
            header[*field_offset + 2..*field_offset + 4].copy_from_slice(&char_count.to_le_bytes());
            offset += encoded.len();
            data.extend_from_slice(&encoded);
        }

        let total_len = (FIXED_HEADER_LEN + data.len()) as u32;
        header[0..4].copy_from_slice(&total_len.to_le_bytes());

        let mut out = header;
        out.extend_from_slice(&data);
        out
    }
}

/// Walk a FeatureExt block: repeated `(feature_id: u8, data_len: u32 LE,
/// data)` entries terminated by `0xFF` (§4.1.3 supplement). Malformed
/// trailing bytes are tolerated — the ids collected so far are returned
/// rather than failing LOGIN7 over an ambient feature we do not
/// otherwise act on.
fn parse_feature_extension_ids(buf: &[u8]) -> Vec<u8> {
    let mut ids = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let id = buf[pos];
        if id == 0xFF {
            break;
        }
        if pos + 5 > buf.len() {
            break;
        }
        let len = u32::from_le_bytes([buf[pos + 1], buf[pos + 2], buf[pos + 3], buf[pos + 4]]) as usize;
        pos += 5;
        if pos + len > buf.len() {
            break;
        }
        ids.push(id);
        pos += len;
    }
    ids
}

fn read_offset_string_raw(buf: &[u8], field_offset: usize, label: &str) -> ServerResult<(Vec<u8>, usize, usize)> {
    if buf.len() < field_offset + 4 {
        return Err(ProtocolError::BadLogin7(format!("truncated {label} offset field")).into());
    }
    let offset = u16::from_le_bytes([buf[field_offset], buf[field_offset + 1]]) as usize;
    let char_count = u16::from_le_bytes([buf[field_offset + 2], buf[field_offset + 3]]) as usize;
    let byte_len = char_count * 2;
    if offset + byte_len > buf.len() {
        return Err(ProtocolError::BadLogin7(format!("{label} data out of range")).into());
    }
    Ok((buf[offset..offset + byte_len].to_vec(), offset, byte_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangle_is_its_own_inverse_for_every_byte() {
        for b in 0u8..=255 {
            assert_eq!(mangle_byte(mangle_byte(b)), b);
        }
    }

    #[test]
    fn scenario_s2_password_wire_bytes_match() {
        // "PWD" as UCS-2LE: 50 00 57 00 44 00
        let mut bytes = vec![0x50, 0x00, 0x57, 0x00, 0x44, 0x00];
        mangle_password(&mut bytes);
        assert_eq!(bytes, vec![0xA5, 0xA5, 0xF6, 0xA5, 0xE1, 0xA5]);

        mangle_password(&mut bytes);
        assert_eq!(bytes, vec![0x50, 0x00, 0x57, 0x00, 0x44, 0x00]);
        assert_eq!(decode_ucs2le(&bytes).unwrap(), "PWD");
    }

    #[test]
    fn login7_round_trips_through_encode_decode() {
        let login = Login7 {
            tds_version: 0x74000004,
            packet_size: 4096,
            client_pid: 1234,
            connection_id: 0,
            flags: LoginOptionFlags::default(),
            client_timezone: 0,
            client_lcid: 0x0409,
            hostname: "workstation".to_string(),
            username: "sa".to_string(),
            password: "PWD".to_string(),
            app_name: "myapp".to_string(),
            server_name: "server1".to_string(),
            language: String::new(),
            database: "salesdb".to_string(),
            client_interface_name: "ODBC".to_string(),
            attach_db_filename: String::new(),
            change_password: String::new(),
            sspi: Vec::new(),
            feature_extension_ids: Vec::new(),
        };
        let bytes = login.encode();
        let decoded = Login7::decode(&bytes).unwrap();
        assert_eq!(decoded.username, "sa");
        assert_eq!(decoded.password, "PWD");
        assert_eq!(decoded.database, "salesdb");
        assert_eq!(decoded.app_name, "myapp");
    }
}
