//! RPC request decoding (§4.1.3).
//!
//! `RPC_REQUEST` payload: `ALL_HEADERS` block, then for each call
//! either a built-in procedure id or a UCS-2LE name, a 2-byte option
//! flag word, then a variable number of parameters.

use std::collections::HashMap;

use crate::error::{ProtocolError, ServerResult};
use crate::protocol::tds::types::{guid_from_wire_bytes, TdsType};
use crate::types::Value;

/// Well-known built-in procedure ids (§4.1.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinProcedure {
    SpCursor,
    SpCursorOpen,
    SpCursorPrepare,
    SpCursorExecute,
    SpCursorPrepExec,
    SpCursorUnprepare,
    SpCursorFetch,
    SpCursorOption,
    SpCursorClose,
    SpExecuteSql,
    SpPrepare,
    SpExecute,
    SpPrepExec,
    SpPrepExecRpc,
    SpUnprepare,
}

impl BuiltinProcedure {
    pub fn from_id(id: u16) -> Option<Self> {
        use BuiltinProcedure::*;
        Some(match id {
            1 => SpCursor,
            2 => SpCursorOpen,
            3 => SpCursorPrepare,
            4 => SpCursorExecute,
            5 => SpCursorPrepExec,
            6 => SpCursorUnprepare,
            7 => SpCursorFetch,
            8 => SpCursorOption,
            9 => SpCursorClose,
            10 => SpExecuteSql,
            11 => SpPrepare,
            12 => SpExecute,
            13 => SpPrepExec,
            14 => SpPrepExecRpc,
            15 => SpUnprepare,
            _ => return None,
        })
    }
}

/// Target of one RPC invocation within the request.
#[derive(Debug, Clone)]
pub enum ProcedureRef {
    Builtin(BuiltinProcedure),
    Named(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ParamStatus {
    pub by_reference: bool,
    pub is_default: bool,
}

impl ParamStatus {
    fn from_byte(b: u8) -> Self {
        Self {
            by_reference: b & 0x01 != 0,
            is_default: b & 0x02 != 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcParam {
    pub name: String,
    pub status: ParamStatus,
    pub value: Value,
}

#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub procedure: ProcedureRef,
    pub option_flags: u16,
    pub params: Vec<RpcParam>,
}

impl RpcRequest {
    /// Collect parameters into a `@name -> Value` map, keyed with the
    /// leading `@` the interpreter/runtime expect (§3).
    pub fn param_map(&self) -> HashMap<String, Value> {
        self.params
            .iter()
            .map(|p| {
                let key = if p.name.starts_with('@') {
                    p.name.clone()
                } else {
                    format!("@{}", p.name)
                };
                (key, p.value.clone())
            })
            .collect()
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> ServerResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::BadRpcRequest(format!(
                "need {n} bytes, have {}",
                self.remaining()
            ))
            .into());
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> ServerResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16_le(&mut self) -> ServerResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32_le(&mut self) -> ServerResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32_le(&mut self) -> ServerResult<i32> {
        Ok(self.u32_le()? as i32)
    }

    fn i64_le(&mut self) -> ServerResult<i64> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn ucs2le(&mut self, char_count: usize) -> ServerResult<String> {
        let bytes = self.take(char_count * 2)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16(&units)
            .map_err(|_| ProtocolError::BadRpcRequest("invalid UTF-16 string".into()).into())
    }

    /// B_VARCHAR: 1-byte char count, then that many UCS-2 code units.
    fn b_varchar(&mut self) -> ServerResult<String> {
        let char_count = self.u8()? as usize;
        self.ucs2le(char_count)
    }
}

/// Skip the `ALL_HEADERS` block (TDS 7.2+): a 4-byte total length
/// followed by one or more header entries, each itself
/// length-prefixed. The server does not currently act on header
/// contents (transaction descriptor propagation, trace activity) but
/// must still walk past them to reach the RPC body.
fn skip_all_headers(cursor: &mut Cursor) -> ServerResult<()> {
    let total_len = cursor.u32_le()? as usize;
    if total_len < 4 {
        return Err(ProtocolError::BadRpcRequest("ALL_HEADERS length too small".into()).into());
    }
    let to_skip = total_len - 4;
    cursor.take(to_skip)?;
    Ok(())
}

fn decode_value(cursor: &mut Cursor, tds_type: TdsType) -> ServerResult<Value> {
    use TdsType::*;
    match tds_type {
        Null => Ok(Value::Null),
        Bit => Ok(Value::Bit(cursor.u8()? != 0)),
        Int1 => Ok(Value::TinyInt(cursor.u8()?)),
        Int2 => Ok(Value::SmallInt(cursor.u16_le()? as i16)),
        Int4 => Ok(Value::Int(cursor.i32_le()?)),
        Int8 => Ok(Value::BigInt(cursor.i64_le()?)),
        Float4 => {
            let bits = cursor.u32_le()?;
            Ok(Value::Float(f32::from_bits(bits)))
        }
        Float8 => {
            let bits = cursor.i64_le()? as u64;
            Ok(Value::Double(f64::from_bits(bits)))
        }
        GUID => {
            let len = cursor.u8()? as usize;
            if len == 0 {
                return Ok(Value::Null);
            }
            let bytes = cursor.take(len)?;
            let mut wire = [0u8; 16];
            wire[..len.min(16)].copy_from_slice(&bytes[..len.min(16)]);
            Ok(Value::Guid(guid_from_wire_bytes(&wire)))
        }
        IntN | BitN => {
            let len = cursor.u8()? as usize;
            match len {
                0 => Ok(Value::Null),
                1 => Ok(Value::TinyInt(cursor.u8()?)),
                2 => Ok(Value::SmallInt(cursor.u16_le()? as i16)),
                4 => Ok(Value::Int(cursor.i32_le()?)),
                8 => Ok(Value::BigInt(cursor.i64_le()?)),
                other => Err(ProtocolError::BadRpcRequest(format!("unexpected IntN length {other}")).into()),
            }
        }
        FloatN => {
            let len = cursor.u8()? as usize;
            match len {
                0 => Ok(Value::Null),
                4 => Ok(Value::Float(f32::from_bits(cursor.u32_le()?))),
                8 => Ok(Value::Double(f64::from_bits(cursor.i64_le()? as u64))),
                other => Err(ProtocolError::BadRpcRequest(format!("unexpected FloatN length {other}")).into()),
            }
        }
        DecimalN | NumericN => {
            cursor.take(2)?; // max_size + precision packed as two bytes ahead of scale, per TYPE_INFO
            let _scale = cursor.u8()?;
            let len = cursor.u8()? as usize;
            if len == 0 {
                return Ok(Value::Null);
            }
            let sign_and_body = cursor.take(len)?;
            let sign = if sign_and_body[0] == 0 { -1i128 } else { 1i128 };
            let mut unscaled: i128 = 0;
            for byte in sign_and_body[1..].iter().rev() {
                unscaled = (unscaled << 8) | (*byte as i128);
            }
            Ok(Value::Decimal {
                unscaled: unscaled * sign,
                scale: _scale,
            })
        }
        BigVarChar | BigChar | NVarChar | NChar => {
            let max_len = cursor.u16_le()?;
            let _collation = cursor.take(5)?;
            let is_unicode = matches!(tds_type, NVarChar | NChar);
            let _ = max_len;
            let len_marker = cursor.u16_le()?;
            if len_marker == 0xFFFF {
                return Ok(Value::Null);
            }
            let byte_len = len_marker as usize;
            let bytes = cursor.take(byte_len)?;
            if is_unicode {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                let text = String::from_utf16(&units)
                    .map_err(|_| ProtocolError::BadRpcRequest("invalid UTF-16 string".into()))?;
                Ok(Value::Text(text))
            } else {
                Ok(Value::Text(String::from_utf8_lossy(bytes).into_owned()))
            }
        }
        BigVarBin | BigBinary => {
            let _max_len = cursor.u16_le()?;
            let len_marker = cursor.u16_le()?;
            if len_marker == 0xFFFF {
                return Ok(Value::Null);
            }
            Ok(Value::Binary(cursor.take(len_marker as usize)?.to_vec()))
        }
        Text | NText | Image | Xml | Udt => {
            let _max_len = cursor.u32_le()?;
            // collation/table-name parts are not modelled; best-effort decode
            let len_marker = cursor.u32_le()?;
            if len_marker == 0xFFFF_FFFF {
                return Ok(Value::Null);
            }
            Ok(Value::Binary(cursor.take(len_marker as usize)?.to_vec()))
        }
        DateN => {
            let len = cursor.u8()? as usize;
            if len == 0 {
                return Ok(Value::Null);
            }
            let bytes = cursor.take(len)?;
            let mut days = [0u8; 4];
            days[..len].copy_from_slice(bytes);
            let day_count = u32::from_le_bytes(days);
            Ok(Value::Date(format!("0001-01-01+{day_count}d")))
        }
        DateTime | DateTim4 | DateTimeN | DateTime2N | DateTimeOffsetN => {
            let len = cursor.u8()? as usize;
            if len == 0 {
                return Ok(Value::Null);
            }
            let bytes = cursor.take(len)?.to_vec();
            Ok(Value::DateTime(format!("raw:{}", hex_encode(&bytes))))
        }
        Money | Money4 | MoneyN => {
            let len = cursor.u8()? as usize;
            if len == 0 {
                return Ok(Value::Null);
            }
            let bytes = cursor.take(len)?;
            let mut acc: i128 = 0;
            for byte in bytes.iter().rev() {
                acc = (acc << 8) | (*byte as i128);
            }
            Ok(Value::Decimal { unscaled: acc, scale: 4 })
        }
        Decimal | Numeric => Err(ProtocolError::BadRpcRequest(
            "legacy fixed-length DECIMAL/NUMERIC type-id unsupported".into(),
        )
        .into()),
        TimeN => {
            let len = cursor.u8()? as usize;
            if len == 0 {
                return Ok(Value::Null);
            }
            cursor.take(len)?;
            Ok(Value::Text("TIME value unsupported in logical Value set".into()))
        }
        Variant => Err(ProtocolError::BadRpcRequest("sql_variant parameters unsupported".into()).into()),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decode an RPC_REQUEST payload (§4.1.3).
pub fn decode_rpc_request(buf: &[u8]) -> ServerResult<RpcRequest> {
    let mut cursor = Cursor::new(buf);
    skip_all_headers(&mut cursor)?;

    let marker = cursor.u16_le()?;
    let procedure = if marker == 0xFFFF {
        let id = cursor.u16_le()?;
        let builtin = BuiltinProcedure::from_id(id)
            .ok_or_else(|| ProtocolError::BadRpcRequest(format!("unknown builtin procedure id {id}")))?;
        ProcedureRef::Builtin(builtin)
    } else {
        // `marker` here is the UCS-2 character count of the name,
        // mirroring the non-builtin branch of the spec.
        let name = cursor.ucs2le(marker as usize)?;
        ProcedureRef::Named(name)
    };

    let option_flags = cursor.u16_le()?;

    let mut params = Vec::new();
    while cursor.remaining() > 0 {
        let name = cursor.b_varchar()?;
        let status = ParamStatus::from_byte(cursor.u8()?);
        let type_id = cursor.u8()?;
        let tds_type = TdsType::from_u8(type_id)
            .ok_or_else(|| ProtocolError::UnsupportedDataType(type_id))?;
        let value = decode_value(&mut cursor, tds_type)?;
        params.push(RpcParam { name, status, value });
    }

    Ok(RpcRequest {
        procedure,
        option_flags,
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_b_varchar(s: &str) -> Vec<u8> {
        let units: Vec<u8> = s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        let mut out = vec![s.encode_utf16().count() as u8];
        out.extend(units);
        out
    }

    #[test]
    fn decodes_sp_executesql_with_int_and_nvarchar_params() {
        let mut buf = Vec::new();
        // ALL_HEADERS: total length 4 (no header entries)
        buf.extend_from_slice(&4u32.to_le_bytes());
        // builtin marker + sp_executesql id (10)
        buf.extend_from_slice(&0xFFFFu16.to_le_bytes());
        buf.extend_from_slice(&10u16.to_le_bytes());
        // option flags
        buf.extend_from_slice(&0u16.to_le_bytes());

        // param 1: @p1 INT = 42
        buf.extend(encode_b_varchar("@p1"));
        buf.push(0x00); // status
        buf.push(TdsType::IntN as u8);
        buf.push(4u8); // IntN length marker
        buf.extend_from_slice(&42i32.to_le_bytes());

        // param 2: @p2 NVARCHAR = "hi"
        buf.extend(encode_b_varchar("@p2"));
        buf.push(0x00);
        buf.push(TdsType::NVarChar as u8);
        buf.extend_from_slice(&8000u16.to_le_bytes()); // max length
        buf.extend_from_slice(&[0u8; 5]); // collation
        let text_units: Vec<u8> = "hi".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        buf.extend_from_slice(&(text_units.len() as u16).to_le_bytes());
        buf.extend_from_slice(&text_units);

        let request = decode_rpc_request(&buf).unwrap();
        assert!(matches!(
            request.procedure,
            ProcedureRef::Builtin(BuiltinProcedure::SpExecuteSql)
        ));
        let map = request.param_map();
        assert_eq!(map.get("@p1"), Some(&Value::Int(42)));
        assert_eq!(map.get("@p2"), Some(&Value::Text("hi".to_string())));
    }

    #[test]
    fn null_nvarchar_decodes_as_null() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&4u32.to_le_bytes());
        let name_units: Vec<u8> = "dbo.GetThing".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        buf.extend_from_slice(&("dbo.GetThing".encode_utf16().count() as u16).to_le_bytes());
        buf.extend_from_slice(&name_units);
        buf.extend_from_slice(&0u16.to_le_bytes());

        buf.extend(encode_b_varchar("@opt"));
        buf.push(0x00);
        buf.push(TdsType::NVarChar as u8);
        buf.extend_from_slice(&8000u16.to_le_bytes());
        buf.extend_from_slice(&[0u8; 5]);
        buf.extend_from_slice(&0xFFFFu16.to_le_bytes());

        let request = decode_rpc_request(&buf).unwrap();
        assert!(matches!(request.procedure, ProcedureRef::Named(ref n) if n == "dbo.GetThing"));
        assert_eq!(request.param_map().get("@opt"), Some(&Value::Null));
    }
}
