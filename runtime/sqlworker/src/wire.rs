//! Length-prefixed request/response frames for the stdio front end.
//!
//! Each frame is a little-endian `u32` length followed by a MessagePack or
//! JSON document. Responses use the codec the request arrived in.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use sqlworker::{Params, PoolError, PoolResult, QueryResult};

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WireCodec {
    Json,
    Msgpack,
}

#[derive(Debug, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub sql: String,
    #[serde(default)]
    pub params: Params,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Status {
    Ok,
    QueryError,
    UnitLost,
    Terminated,
    ShuttingDown,
    InvalidInput,
}

#[derive(Debug, Serialize)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<QueryResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    pub fn from_outcome(request_id: u64, outcome: PoolResult<QueryResult>) -> Self {
        match outcome {
            Ok(result) => Self {
                request_id,
                status: Status::Ok,
                payload: Some(result),
                error: None,
            },
            Err(err) => {
                let status = match &err {
                    PoolError::Query(_) => Status::QueryError,
                    PoolError::UnitLost { .. } => Status::UnitLost,
                    PoolError::Terminated => Status::Terminated,
                    PoolError::ShuttingDown => Status::ShuttingDown,
                    PoolError::Config(_) | PoolError::Spawn(_) => Status::InvalidInput,
                };
                Self::failure(request_id, status, err.to_string())
            }
        }
    }

    pub fn failure(request_id: u64, status: Status, error: impl Into<String>) -> Self {
        Self {
            request_id,
            status,
            payload: None,
            error: Some(error.into()),
        }
    }
}

pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut header) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame exceeds max size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Frame exceeds max size"))?;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub fn decode_request(bytes: &[u8]) -> Result<(RequestEnvelope, WireCodec), String> {
    if let Ok(envelope) = rmp_serde::from_slice::<RequestEnvelope>(bytes) {
        return Ok((envelope, WireCodec::Msgpack));
    }
    let envelope = serde_json::from_slice::<RequestEnvelope>(bytes)
        .map_err(|err| format!("Invalid request: {err}"))?;
    Ok((envelope, WireCodec::Json))
}

pub fn encode_response(response: &ResponseEnvelope, wire: WireCodec) -> Result<Vec<u8>, String> {
    match wire {
        WireCodec::Msgpack => rmp_serde::to_vec_named(response).map_err(|err| err.to_string()),
        WireCodec::Json => serde_json::to_vec(response).map_err(|err| err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn frames_survive_a_pipe() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"first").expect("write");
        write_frame(&mut buf, b"").expect("write empty");
        let mut reader = Cursor::new(buf);
        assert_eq!(read_frame(&mut reader).expect("read"), Some(b"first".to_vec()));
        assert_eq!(read_frame(&mut reader).expect("read"), Some(Vec::new()));
        assert_eq!(read_frame(&mut reader).expect("eof"), None);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let header = ((MAX_FRAME_SIZE as u32) + 1).to_le_bytes();
        let err = read_frame(&mut Cursor::new(header.to_vec())).expect_err("too big");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn json_requests_default_to_no_params() {
        let (request, wire) =
            decode_request(br#"{"request_id": 9, "sql": "SELECT 1 FROM DUAL"}"#).expect("decode");
        assert_eq!(wire, WireCodec::Json);
        assert_eq!(request.request_id, 9);
        assert!(request.params.is_empty());
    }

    #[test]
    fn msgpack_requests_keep_named_params() {
        let bytes = rmp_serde::to_vec_named(&json!({
            "request_id": 3,
            "sql": "SELECT * FROM invoices WHERE id = :id",
            "params": {"id": 42},
        }))
        .expect("encode");
        let (request, wire) = decode_request(&bytes).expect("decode");
        assert_eq!(wire, WireCodec::Msgpack);
        match request.params {
            Params::Named(map) => assert_eq!(map.get("id"), Some(&json!(42))),
            other => panic!("expected named params, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_invalid_input() {
        let err = decode_request(b"\xc1not a request").expect_err("garbage");
        assert!(err.starts_with("Invalid request"), "{err}");
    }

    #[test]
    fn failures_map_to_statuses() {
        let response = ResponseEnvelope::from_outcome(5, Err(PoolError::Query("ORA-00942".into())));
        let encoded: serde_json::Value =
            serde_json::from_slice(&encode_response(&response, WireCodec::Json).expect("encode"))
                .expect("json");
        assert_eq!(
            encoded,
            json!({"request_id": 5, "status": "QueryError", "error": "query failed: ORA-00942"})
        );
    }
}
