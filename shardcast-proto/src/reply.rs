//! Reply and internal-request construction. Replies built here are complete
//! framed messages ready to be attached to a socket write slot.

use crate::frame::{self, MSG_HEADER_SIZE};
use crate::func::FuncCode;
use crate::version::{self, BrokerVersion};

pub const TRAN_TYPE_COMMIT: u8 = 1;
pub const TRAN_TYPE_ABORT: u8 = 2;

fn new_reply(body_len: usize) -> Vec<u8> {
    let mut msg = vec![0u8; MSG_HEADER_SIZE + body_len];
    frame::encode_header(&mut msg, body_len);
    msg
}

/// A bare success reply: result code zero.
pub fn make_ok() -> Vec<u8> {
    let mut msg = new_reply(4);
    frame::write_result_code(&mut msg, 0);
    msg
}

pub fn make_end_tran_ok() -> Vec<u8> {
    make_ok()
}

pub fn make_con_close_ok() -> Vec<u8> {
    make_ok()
}

pub fn make_check_cas_ok() -> Vec<u8> {
    make_ok()
}

pub fn make_dbinfo_ok() -> Vec<u8> {
    make_ok()
}

/// Success reply carrying one integer, e.g. isolation level or lock timeout.
pub fn make_int_reply(value: i32) -> Vec<u8> {
    let mut msg = new_reply(8);
    frame::write_result_code(&mut msg, 0);
    msg[MSG_HEADER_SIZE + 4..].copy_from_slice(&value.to_be_bytes());
    msg
}

/// Success reply carrying one NUL-terminated string, e.g. the db version.
pub fn make_str_reply(value: &str) -> Vec<u8> {
    let mut msg = new_reply(4 + value.len() + 1);
    frame::write_result_code(&mut msg, 0);
    msg[MSG_HEADER_SIZE + 4..MSG_HEADER_SIZE + 4 + value.len()].copy_from_slice(value.as_bytes());
    msg
}

/// Shard topology reply: shard count, then `shard_id, cas_count` per shard.
pub fn make_shard_info_reply(shards: &[(i32, i32)]) -> Vec<u8> {
    let mut msg = new_reply(4 + 4 + shards.len() * 8);
    frame::write_result_code(&mut msg, 0);
    let mut pos = MSG_HEADER_SIZE + 4;
    msg[pos..pos + 4].copy_from_slice(&(shards.len() as i32).to_be_bytes());
    pos += 4;
    for (shard_id, cas_count) in shards {
        msg[pos..pos + 4].copy_from_slice(&shard_id.to_be_bytes());
        msg[pos + 4..pos + 8].copy_from_slice(&cas_count.to_be_bytes());
        pos += 8;
    }
    msg
}

/// Error reply. Drivers from 8.3.0 on expect `indicator, code, message`;
/// older drivers expect the bare code. The message is always treated as a
/// plain string.
pub fn make_error_reply(
    client_version: BrokerVersion,
    error_ind: i32,
    error_code: i32,
    error_msg: &str,
    is_in_tran: bool,
) -> Vec<u8> {
    let with_indicator = version::error_indicator_supported(client_version);
    let fixed = if with_indicator { 8 } else { 4 };
    let mut msg = new_reply(fixed + error_msg.len() + 1);

    let mut pos = MSG_HEADER_SIZE;
    if with_indicator {
        msg[pos..pos + 4].copy_from_slice(&error_ind.to_be_bytes());
        pos += 4;
    }
    msg[pos..pos + 4].copy_from_slice(&error_code.to_be_bytes());
    pos += 4;
    msg[pos..pos + error_msg.len()].copy_from_slice(error_msg.as_bytes());

    if is_in_tran {
        frame::set_con_status_in_tran(&mut msg);
    } else {
        frame::set_con_status_out_tran(&mut msg);
    }
    msg
}

/// Internal end-tran request sent to a CAS on behalf of a disappearing or
/// closing client.
pub fn make_end_tran_abort_request() -> Vec<u8> {
    frame::build_request(FuncCode::EndTran.as_u8(), &[&[TRAN_TYPE_ABORT]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CAS_ERROR_INDICATOR, CAS_ER_INTERNAL};

    #[test]
    fn ok_reply_shape() {
        let msg = make_ok();
        assert_eq!(frame::decode_body_length(&msg).unwrap(), 4);
        assert_eq!(frame::read_result_code(&msg).unwrap(), 0);
    }

    #[test]
    fn error_reply_new_protocol_carries_indicator() {
        let msg = make_error_reply(
            version::proto_ver(version::PROTOCOL_V2),
            CAS_ERROR_INDICATOR,
            CAS_ER_INTERNAL,
            "boom",
            true,
        );
        assert_eq!(frame::read_result_code(&msg).unwrap(), CAS_ERROR_INDICATOR);
        let code_at = MSG_HEADER_SIZE + 4;
        let code = i32::from_be_bytes(msg[code_at..code_at + 4].try_into().unwrap());
        assert_eq!(code, CAS_ER_INTERNAL);
        assert!(frame::con_status_is_in_tran(&msg));
        assert_eq!(*msg.last().unwrap(), 0);
    }

    #[test]
    fn error_reply_old_protocol_has_bare_code() {
        let msg = make_error_reply(
            version::make_ver(8, 2, 0),
            CAS_ERROR_INDICATOR,
            CAS_ER_INTERNAL,
            "",
            false,
        );
        assert_eq!(frame::read_result_code(&msg).unwrap(), CAS_ER_INTERNAL);
        assert!(!frame::con_status_is_in_tran(&msg));
    }

    #[test]
    fn abort_request_is_end_tran() {
        let msg = make_end_tran_abort_request();
        assert_eq!(
            frame::request_func_byte(&msg).unwrap(),
            FuncCode::EndTran.as_u8()
        );
        let argv = frame::split_argv(&msg).unwrap();
        assert_eq!(argv[0], &[TRAN_TYPE_ABORT]);
    }
}
