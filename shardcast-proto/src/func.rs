//! Function codes of the driver protocol. The dispatcher indexes its jump
//! tables with these, so the numbering is part of the wire contract.

use crate::version::{self, BrokerVersion};
use crate::ProtoError;

/// One past the highest valid function code.
pub const FN_MAX: u8 = 19;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FuncCode {
    EndTran = 1,
    Prepare = 2,
    Execute = 3,
    GetDbParameter = 4,
    SetDbParameter = 5,
    CloseReqHandle = 6,
    Cursor = 7,
    Fetch = 8,
    SchemaInfo = 9,
    GetDbVersion = 10,
    ConClose = 11,
    CheckCas = 12,
    /// Pre-V2 drivers send cursor-close under this code.
    CursorCloseOld = 13,
    CursorClose = 14,
    ExecuteArray = 15,
    PrepareAndExecute = 16,
    GetShardInfo = 17,
    /// First message on a CAS worker connection: `shard_id, cas_id`.
    CasRegister = 18,
}

impl FuncCode {
    pub fn from_u8(code: u8) -> Result<FuncCode, ProtoError> {
        use FuncCode::*;
        Ok(match code {
            1 => EndTran,
            2 => Prepare,
            3 => Execute,
            4 => GetDbParameter,
            5 => SetDbParameter,
            6 => CloseReqHandle,
            7 => Cursor,
            8 => Fetch,
            9 => SchemaInfo,
            10 => GetDbVersion,
            11 => ConClose,
            12 => CheckCas,
            13 => CursorCloseOld,
            14 => CursorClose,
            15 => ExecuteArray,
            16 => PrepareAndExecute,
            17 => GetShardInfo,
            18 => CasRegister,
            other => return Err(ProtoError::BadFuncCode(other)),
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Compatibility shim: drivers that do not speak V2 use the old cursor-close
/// code. Remap so one handler serves both generations.
pub fn remap_for_version(code: FuncCode, client_version: BrokerVersion) -> FuncCode {
    if code == FuncCode::CursorCloseOld && !version::understands(client_version, version::PROTOCOL_V2)
    {
        FuncCode::CursorClose
    } else {
        code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version;

    #[test]
    fn all_codes_round_trip() {
        for raw in 1..FN_MAX {
            let code = FuncCode::from_u8(raw).unwrap();
            assert_eq!(code.as_u8(), raw);
        }
        assert!(FuncCode::from_u8(0).is_err());
        assert!(FuncCode::from_u8(FN_MAX).is_err());
    }

    #[test]
    fn cursor_close_remap_only_for_old_drivers() {
        let old = version::make_ver(8, 2, 0);
        let new = version::proto_ver(version::PROTOCOL_V2);
        assert_eq!(
            remap_for_version(FuncCode::CursorCloseOld, old),
            FuncCode::CursorClose
        );
        assert_eq!(
            remap_for_version(FuncCode::CursorCloseOld, new),
            FuncCode::CursorCloseOld
        );
        assert_eq!(remap_for_version(FuncCode::Prepare, old), FuncCode::Prepare);
    }
}
