//! Message framing: a 4-byte big-endian body length followed by 4 bytes of
//! cas-info, then the body. Requests carry a 1-byte function code and a
//! sequence of `u32 length + bytes` arguments.

use crate::ProtoError;

/// Total header size: `i32` body length + [`CAS_INFO_SIZE`] info bytes.
pub const MSG_HEADER_SIZE: usize = 8;
pub const CAS_INFO_SIZE: usize = 4;

/// Byte offsets inside the cas-info block.
pub const CAS_INFO_STATUS: usize = 0;
pub const CAS_INFO_RESERVED_1: usize = 1;
pub const CAS_INFO_RESERVED_2: usize = 2;
pub const CAS_INFO_ADDITIONAL_FLAG: usize = 3;

pub const CAS_INFO_STATUS_INACTIVE: u8 = 0;
pub const CAS_INFO_STATUS_ACTIVE: u8 = 1;

/// Set in the additional-flag byte to force the CAS out of transaction
/// after serving the request.
pub const CAS_INFO_FLAG_MASK_FORCE_OUT_TRAN: u8 = 0x20;

pub const MAX_BODY_LENGTH: i32 = 16 * 1024 * 1024;

/// Decodes the body length from a complete 8-byte header.
pub fn decode_body_length(header: &[u8]) -> Result<usize, ProtoError> {
    if header.len() < MSG_HEADER_SIZE {
        return Err(ProtoError::Truncated {
            need: MSG_HEADER_SIZE,
            have: header.len(),
        });
    }
    let len = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if !(0..=MAX_BODY_LENGTH).contains(&len) {
        return Err(ProtoError::BadLength(len));
    }
    Ok(len as usize)
}

/// Writes a header in place at the front of `msg`.
pub fn encode_header(msg: &mut [u8], body_len: usize) {
    debug_assert!(msg.len() >= MSG_HEADER_SIZE);
    msg[..4].copy_from_slice(&(body_len as i32).to_be_bytes());
}

/// Total message length (header + body) declared by the header.
pub fn message_length(msg: &[u8]) -> Result<usize, ProtoError> {
    Ok(MSG_HEADER_SIZE + decode_body_length(msg)?)
}

pub fn set_con_status_in_tran(msg: &mut [u8]) {
    msg[4 + CAS_INFO_STATUS] = CAS_INFO_STATUS_ACTIVE;
}

pub fn set_con_status_out_tran(msg: &mut [u8]) {
    msg[4 + CAS_INFO_STATUS] = CAS_INFO_STATUS_INACTIVE;
}

pub fn con_status_is_in_tran(msg: &[u8]) -> bool {
    msg[4 + CAS_INFO_STATUS] == CAS_INFO_STATUS_ACTIVE
}

pub fn set_force_out_tran(msg: &mut [u8]) {
    msg[4 + CAS_INFO_ADDITIONAL_FLAG] |= CAS_INFO_FLAG_MASK_FORCE_OUT_TRAN;
}

pub fn unset_force_out_tran(msg: &mut [u8]) {
    msg[4 + CAS_INFO_ADDITIONAL_FLAG] &= !CAS_INFO_FLAG_MASK_FORCE_OUT_TRAN;
}

pub fn is_force_out_tran(msg: &[u8]) -> bool {
    msg[4 + CAS_INFO_ADDITIONAL_FLAG] & CAS_INFO_FLAG_MASK_FORCE_OUT_TRAN != 0
}

/// Reads the function code of a complete request message.
pub fn request_func_byte(msg: &[u8]) -> Result<u8, ProtoError> {
    if msg.len() <= MSG_HEADER_SIZE {
        return Err(ProtoError::Truncated {
            need: MSG_HEADER_SIZE + 1,
            have: msg.len(),
        });
    }
    Ok(msg[MSG_HEADER_SIZE])
}

/// Splits the argument section of a complete request into borrowed slices.
/// The layout after the function code byte is `N x { u32 len, bytes }`.
pub fn split_argv(msg: &[u8]) -> Result<Vec<&[u8]>, ProtoError> {
    let mut argv = Vec::new();
    let mut pos = MSG_HEADER_SIZE + 1;
    while pos < msg.len() {
        if pos + 4 > msg.len() {
            return Err(ProtoError::BadArgv(pos));
        }
        let len = u32::from_be_bytes([msg[pos], msg[pos + 1], msg[pos + 2], msg[pos + 3]]) as usize;
        pos += 4;
        if pos + len > msg.len() {
            return Err(ProtoError::BadArgv(pos));
        }
        argv.push(&msg[pos..pos + len]);
        pos += len;
    }
    Ok(argv)
}

/// Builds a complete request message from a function code and arguments.
pub fn build_request(func_code: u8, argv: &[&[u8]]) -> Vec<u8> {
    let body_len = 1 + argv.iter().map(|a| 4 + a.len()).sum::<usize>();
    let mut msg = vec![0u8; MSG_HEADER_SIZE + body_len];
    encode_header(&mut msg, body_len);
    msg[MSG_HEADER_SIZE] = func_code;
    let mut pos = MSG_HEADER_SIZE + 1;
    for arg in argv {
        msg[pos..pos + 4].copy_from_slice(&(arg.len() as u32).to_be_bytes());
        pos += 4;
        msg[pos..pos + arg.len()].copy_from_slice(arg);
        pos += arg.len();
    }
    msg
}

/// Reads the `i32` result code at the front of a reply body. Negative values
/// are error indicators.
pub fn read_result_code(msg: &[u8]) -> Result<i32, ProtoError> {
    if msg.len() < MSG_HEADER_SIZE + 4 {
        return Err(ProtoError::Truncated {
            need: MSG_HEADER_SIZE + 4,
            have: msg.len(),
        });
    }
    let p = MSG_HEADER_SIZE;
    Ok(i32::from_be_bytes([msg[p], msg[p + 1], msg[p + 2], msg[p + 3]]))
}

/// Overwrites the `i32` result code at the front of a reply body. Used to
/// swap the per-CAS server handle for the externally visible statement id.
pub fn write_result_code(msg: &mut [u8], value: i32) {
    let p = MSG_HEADER_SIZE;
    msg[p..p + 4].copy_from_slice(&value.to_be_bytes());
}

/// Argument decoding helpers. Integers travel big-endian, strings carry a
/// trailing NUL that is stripped on read.
pub fn arg_as_i32(arg: &[u8]) -> Result<i32, ProtoError> {
    if arg.len() != 4 {
        return Err(ProtoError::BadArgv(0));
    }
    Ok(i32::from_be_bytes([arg[0], arg[1], arg[2], arg[3]]))
}

pub fn arg_as_i64(arg: &[u8]) -> Result<i64, ProtoError> {
    match arg.len() {
        8 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(arg);
            Ok(i64::from_be_bytes(raw))
        }
        4 => Ok(arg_as_i32(arg)? as i64),
        2 => Ok(i16::from_be_bytes([arg[0], arg[1]]) as i64),
        _ => Err(ProtoError::BadArgv(0)),
    }
}

pub fn arg_as_str(arg: &[u8]) -> Result<&str, ProtoError> {
    let trimmed = match arg.last() {
        Some(0) => &arg[..arg.len() - 1],
        _ => arg,
    };
    std::str::from_utf8(trimmed).map_err(|_| ProtoError::BadArgv(0))
}

pub fn str_arg(s: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(s.len() + 1);
    v.extend_from_slice(s.as_bytes());
    v.push(0);
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_request() {
        let msg = build_request(2, &[b"SELECT 1\0", &[0x01]]);
        assert_eq!(decode_body_length(&msg).unwrap(), msg.len() - MSG_HEADER_SIZE);
        assert_eq!(request_func_byte(&msg).unwrap(), 2);
        let argv = split_argv(&msg).unwrap();
        assert_eq!(argv.len(), 2);
        assert_eq!(arg_as_str(argv[0]).unwrap(), "SELECT 1");
        assert_eq!(argv[1], &[0x01]);
    }

    #[test]
    fn truncated_argv_is_rejected() {
        let mut msg = build_request(2, &[b"abcd"]);
        msg.truncate(msg.len() - 2);
        assert!(matches!(split_argv(&msg), Err(ProtoError::BadArgv(_))));
    }

    #[test]
    fn negative_body_length_is_rejected() {
        let mut header = [0u8; MSG_HEADER_SIZE];
        header[..4].copy_from_slice(&(-1i32).to_be_bytes());
        assert_eq!(decode_body_length(&header), Err(ProtoError::BadLength(-1)));
    }

    #[test]
    fn con_status_bits() {
        let mut msg = build_request(1, &[]);
        assert!(!con_status_is_in_tran(&msg));
        set_con_status_in_tran(&mut msg);
        assert!(con_status_is_in_tran(&msg));
        set_con_status_out_tran(&mut msg);
        assert!(!con_status_is_in_tran(&msg));
    }

    #[test]
    fn force_out_tran_flag_is_isolated() {
        let mut msg = build_request(1, &[]);
        set_force_out_tran(&mut msg);
        assert!(is_force_out_tran(&msg));
        assert!(!con_status_is_in_tran(&msg));
        unset_force_out_tran(&mut msg);
        assert!(!is_force_out_tran(&msg));
    }

    #[test]
    fn result_code_rewrite() {
        let mut msg = vec![0u8; MSG_HEADER_SIZE + 4];
        encode_header(&mut msg, 4);
        write_result_code(&mut msg, 1234);
        assert_eq!(read_result_code(&msg).unwrap(), 1234);
        write_result_code(&mut msg, -1);
        assert_eq!(read_result_code(&msg).unwrap(), -1);
    }
}
