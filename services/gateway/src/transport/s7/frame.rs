//! S7 over ISO-on-TCP frame encoding and decoding
//!
//! Every frame is TPKT (RFC 1006) around a COTP TPDU. Data TPDUs carry an S7
//! job header followed by parameters. Only the three exchanges the gateway
//! needs are covered: connection request, setup communication, read var.

use bytes::{BufMut, BytesMut};

use crate::transport::TransportError;

/// TPKT header length
pub const TPKT_LEN: usize = 4;
/// COTP data TPDU header length
const COTP_DT_LEN: usize = 3;
/// Request S7 header length (job)
const S7_JOB_HEADER_LEN: usize = 10;
/// Response S7 header length (ack data adds error class and code)
const S7_ACK_HEADER_LEN: usize = 12;

/// Offset of the S7 error class in an ack-data frame
const ERROR_CLASS_OFFSET: usize = TPKT_LEN + COTP_DT_LEN + 10;
/// Offset of the first parameter byte in an ack-data frame
const ACK_PARAMS_OFFSET: usize = TPKT_LEN + COTP_DT_LEN + S7_ACK_HEADER_LEN;

/// Request/response overhead of a single-item read
pub const READ_OVERHEAD: usize = 18;
/// PDU length we ask for during negotiation
pub const REQUESTED_PDU: u16 = 480;

const COTP_CONNECTION_CONFIRM: u8 = 0xD0;
const S7_PROTOCOL_ID: u8 = 0x32;
const ROSCTR_JOB: u8 = 0x01;
const ROSCTR_ACK_DATA: u8 = 0x03;
const FUNC_SETUP_COMMUNICATION: u8 = 0xF0;
const FUNC_READ_VAR: u8 = 0x04;
const AREA_DB: u8 = 0x84;
const TRANSPORT_SIZE_BYTE: u8 = 0x02;
const RETURN_CODE_SUCCESS: u8 = 0xFF;
/// Connection type for programming-device sessions
const CONNECTION_TYPE_PG: u8 = 0x01;

fn put_tpkt(buf: &mut BytesMut, total_len: usize) {
    buf.put_u8(0x03);
    buf.put_u8(0x00);
    buf.put_u16(total_len as u16);
}

fn put_job_header(buf: &mut BytesMut, pdu_ref: u16, param_len: u16) {
    // COTP DT, last data unit
    buf.put_slice(&[0x02, 0xF0, 0x80]);
    buf.put_u8(S7_PROTOCOL_ID);
    buf.put_u8(ROSCTR_JOB);
    buf.put_u16(0x0000);
    buf.put_u16(pdu_ref);
    buf.put_u16(param_len);
    buf.put_u16(0x0000);
}

/// Remote TSAP for a CPU at `rack`/`slot`
pub fn remote_tsap(rack: u8, slot: u8) -> u16 {
    (u16::from(CONNECTION_TYPE_PG) << 8) | u16::from(rack * 0x20 + slot)
}

/// COTP connection request
pub fn connection_request(rack: u8, slot: u8) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(22);
    put_tpkt(&mut buf, 22);
    buf.put_slice(&[
        0x11, // length indicator
        0xE0, // CR
        0x00, 0x00, // destination reference
        0x00, 0x01, // source reference
        0x00, // class 0
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, 0x01, 0x00, // local TSAP
        0xC2, 0x02, // remote TSAP
    ]);
    buf.put_u16(remote_tsap(rack, slot));
    buf.to_vec()
}

/// Check a COTP connection confirm
pub fn check_connection_confirm(frame: &[u8]) -> Result<(), TransportError> {
    match frame.get(5) {
        Some(&COTP_CONNECTION_CONFIRM) => Ok(()),
        Some(code) => Err(TransportError::ConnectionFailed(format!(
            "ISO connection refused (TPDU code 0x{code:02X})"
        ))),
        None => Err(TransportError::Protocol(format!(
            "connection confirm too short ({} bytes)",
            frame.len()
        ))),
    }
}

/// S7 setup communication job
pub fn setup_communication(pdu_ref: u16, pdu_length: u16) -> Vec<u8> {
    let params: u16 = 8;
    let total = TPKT_LEN + COTP_DT_LEN + S7_JOB_HEADER_LEN + params as usize;
    let mut buf = BytesMut::with_capacity(total);
    put_tpkt(&mut buf, total);
    put_job_header(&mut buf, pdu_ref, params);
    buf.put_u8(FUNC_SETUP_COMMUNICATION);
    buf.put_u8(0x00);
    buf.put_u16(1); // max AmQ calling
    buf.put_u16(1); // max AmQ called
    buf.put_u16(pdu_length);
    buf.to_vec()
}

/// Negotiated PDU length from a setup communication ack
pub fn parse_setup_response(frame: &[u8]) -> Result<u16, TransportError> {
    check_ack_header(frame)?;
    let pdu = frame
        .get(ACK_PARAMS_OFFSET + 6..ACK_PARAMS_OFFSET + 8)
        .ok_or_else(|| TransportError::Protocol("setup response too short".to_string()))?;
    let pdu = u16::from_be_bytes([pdu[0], pdu[1]]);
    if (pdu as usize) <= READ_OVERHEAD {
        return Err(TransportError::Protocol(format!(
            "negotiated PDU length {pdu} is unusable"
        )));
    }
    Ok(pdu)
}

/// S7 read var job for `len` bytes of DB `db` at byte `start`
pub fn read_var_request(pdu_ref: u16, db: u16, start: u32, len: u16) -> Vec<u8> {
    let params: u16 = 14;
    let total = TPKT_LEN + COTP_DT_LEN + S7_JOB_HEADER_LEN + params as usize;
    let mut buf = BytesMut::with_capacity(total);
    put_tpkt(&mut buf, total);
    put_job_header(&mut buf, pdu_ref, params);
    buf.put_u8(FUNC_READ_VAR);
    buf.put_u8(0x01); // item count
    buf.put_slice(&[0x12, 0x0A, 0x10]); // variable spec, any-pointer syntax
    buf.put_u8(TRANSPORT_SIZE_BYTE);
    buf.put_u16(len);
    buf.put_u16(db);
    buf.put_u8(AREA_DB);
    let bit_address = start * 8;
    buf.put_u8(((bit_address >> 16) & 0xFF) as u8);
    buf.put_u8(((bit_address >> 8) & 0xFF) as u8);
    buf.put_u8((bit_address & 0xFF) as u8);
    buf.to_vec()
}

/// Payload of a single-item read var ack
pub fn parse_read_response(frame: &[u8], expected: usize) -> Result<Vec<u8>, TransportError> {
    check_ack_header(frame)?;

    let item = ACK_PARAMS_OFFSET + 2;
    let header = frame
        .get(item..item + 4)
        .ok_or_else(|| TransportError::Protocol("read response too short".to_string()))?;

    if header[0] != RETURN_CODE_SUCCESS {
        return Err(TransportError::ReadFailed(describe_return_code(header[0])));
    }

    let mut len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    // BIT/BYTE/WORD transport sizes report the length in bits
    if matches!(header[1], 0x03 | 0x04 | 0x05) {
        len /= 8;
    }

    let data = frame.get(item + 4..item + 4 + len).ok_or_else(|| {
        TransportError::Protocol(format!(
            "read response announces {} bytes but carries {}",
            len,
            frame.len().saturating_sub(item + 4)
        ))
    })?;

    if data.len() != expected {
        return Err(TransportError::ReadFailed(format!(
            "expected {} bytes, controller returned {}",
            expected,
            data.len()
        )));
    }

    Ok(data.to_vec())
}

/// Total frame length announced by a TPKT header
pub fn tpkt_length(header: &[u8]) -> Result<usize, TransportError> {
    if header.len() < TPKT_LEN || header[0] != 0x03 {
        return Err(TransportError::Protocol("invalid TPKT header".to_string()));
    }
    let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
    if len < TPKT_LEN + COTP_DT_LEN {
        return Err(TransportError::Protocol(format!("TPKT length {len} too short")));
    }
    Ok(len)
}

fn check_ack_header(frame: &[u8]) -> Result<(), TransportError> {
    if frame.len() < ACK_PARAMS_OFFSET {
        return Err(TransportError::Protocol(format!(
            "S7 response too short ({} bytes)",
            frame.len()
        )));
    }
    let s7 = TPKT_LEN + COTP_DT_LEN;
    if frame[s7] != S7_PROTOCOL_ID || frame[s7 + 1] != ROSCTR_ACK_DATA {
        return Err(TransportError::Protocol(format!(
            "unexpected S7 header {:02X} {:02X}",
            frame[s7],
            frame[s7 + 1]
        )));
    }
    let (class, code) = (frame[ERROR_CLASS_OFFSET], frame[ERROR_CLASS_OFFSET + 1]);
    if class != 0 || code != 0 {
        return Err(TransportError::Protocol(format!(
            "S7 error class 0x{class:02X} code 0x{code:02X}"
        )));
    }
    Ok(())
}

fn describe_return_code(code: u8) -> String {
    match code {
        0x03 => "access denied".to_string(),
        0x05 => "address out of range".to_string(),
        0x06 => "data type not supported".to_string(),
        0x0A => "object does not exist".to_string(),
        other => format!("item return code 0x{other:02X}"),
    }
}
