//! Error indicators and codes of the driver protocol, including the old/new
//! renumbering applied for drivers that predate the renewed error codes.

use crate::version::{self, BrokerVersion};

/// Error indicators. A negative result code at the front of a reply body is
/// one of these for new-protocol drivers.
pub const CAS_ERROR_INDICATOR: i32 = -1;
pub const DBMS_ERROR_INDICATOR: i32 = -2;

pub const CAS_NO_ERROR: i32 = 0;

// Renewed (current) error numbering.
pub const CAS_ER_INTERNAL: i32 = -10001;
pub const CAS_ER_NO_MORE_MEMORY: i32 = -10002;
pub const CAS_ER_COMMUNICATION: i32 = -10003;
pub const CAS_ER_ARGS: i32 = -10004;
pub const CAS_ER_TRAN_TYPE: i32 = -10005;
pub const CAS_ER_SRV_HANDLE: i32 = -10006;
pub const CAS_ER_OBJECT: i32 = -10013;
pub const CAS_ER_VERSION: i32 = -10016;
pub const CAS_ER_NOT_AUTHORIZED_CLIENT: i32 = -10018;
pub const CAS_ER_STMT_POOLING: i32 = -10024;
pub const CAS_ER_DBSERVER_DISCONNECTED: i32 = -10025;
pub const CAS_ER_MAX_CLIENT_EXCEEDED: i32 = -10026;
pub const CAS_ER_NOT_IMPLEMENTED: i32 = -10100;

/// Offset between renewed and legacy numbering. Legacy drivers used the
/// -1000 range for the same codes.
const OLD_ERROR_OFFSET: i32 = 9000;

const RENEWED_RANGE: std::ops::RangeInclusive<i32> = -10100..=-10001;

pub fn is_renewed_code(code: i32) -> bool {
    RENEWED_RANGE.contains(&code)
}

pub fn to_old_code(code: i32) -> i32 {
    if is_renewed_code(code) {
        code + OLD_ERROR_OFFSET
    } else {
        code
    }
}

pub fn to_new_code(code: i32) -> i32 {
    let shifted = code - OLD_ERROR_OFFSET;
    if is_renewed_code(shifted) {
        shifted
    } else {
        code
    }
}

/// Translates a CAS error code to the numbering the client expects.
/// DBMS errors pass through untouched.
pub fn code_for_client(
    error_ind: i32,
    code: i32,
    client_version: BrokerVersion,
    renewed_capability: bool,
) -> i32 {
    if error_ind != CAS_ERROR_INDICATOR {
        return code;
    }
    let old_driver = client_version < version::make_ver(8, 3, 0);
    if old_driver || !renewed_capability {
        to_old_code(to_new_code(code))
    } else {
        to_new_code(code)
    }
}

/// Normalizes a wire error code to the renewed numbering for internal
/// comparisons, e.g. the statement-pooling check.
pub fn code_from_client_wire(error_ind: i32, code: i32) -> i32 {
    if error_ind == CAS_ERROR_INDICATOR {
        to_new_code(code)
    } else {
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version;

    #[test]
    fn old_new_translation_round_trips() {
        assert_eq!(to_old_code(CAS_ER_STMT_POOLING), -1024);
        assert_eq!(to_new_code(-1024), CAS_ER_STMT_POOLING);
        assert_eq!(to_new_code(to_old_code(CAS_ER_INTERNAL)), CAS_ER_INTERNAL);
    }

    #[test]
    fn dbms_errors_pass_through() {
        assert_eq!(
            code_for_client(DBMS_ERROR_INDICATOR, -494, version::make_ver(8, 2, 0), false),
            -494
        );
    }

    #[test]
    fn legacy_driver_gets_old_numbering() {
        let old = version::make_ver(8, 2, 1);
        let new = version::proto_ver(version::PROTOCOL_V2);
        assert_eq!(
            code_for_client(CAS_ERROR_INDICATOR, CAS_ER_ARGS, old, true),
            -1004
        );
        assert_eq!(
            code_for_client(CAS_ERROR_INDICATOR, CAS_ER_ARGS, new, false),
            -1004
        );
        assert_eq!(
            code_for_client(CAS_ERROR_INDICATOR, CAS_ER_ARGS, new, true),
            CAS_ER_ARGS
        );
    }
}
