//! Driver version handling.
//!
//! Pre-protocol drivers identify themselves by release triple; newer drivers
//! carry an explicit protocol version. Both are folded into one ordered
//! `BrokerVersion` value so comparisons read naturally.

pub type BrokerVersion = i32;

pub const PROTOCOL_V1: i32 = 1;
pub const PROTOCOL_V2: i32 = 2;
pub const CURRENT_PROTOCOL: i32 = PROTOCOL_V2;

const PROTO_BIT: i32 = 0x4000_0000;

/// Length of the driver identification block in the connect message.
pub const DRIVER_INFO_SIZE: usize = 8;

/// Offsets inside the driver info block.
pub const DRIVER_INFO_MAJOR: usize = 0;
pub const DRIVER_INFO_MINOR: usize = 1;
pub const DRIVER_INFO_PATCH: usize = 2;
pub const DRIVER_INFO_PROTOCOL: usize = 3;
pub const DRIVER_INFO_CAPABILITIES: usize = 4;

/// Capability bit: the driver understands the renewed error numbering.
pub const CAP_RENEWED_ERROR_CODE: u8 = 0x01;

pub const fn make_ver(major: u8, minor: u8, patch: u8) -> BrokerVersion {
    ((major as i32) << 16) | ((minor as i32) << 8) | patch as i32
}

pub const fn proto_ver(proto: i32) -> BrokerVersion {
    PROTO_BIT | proto
}

/// True when the client speaks at least the given protocol version.
pub fn understands(client_version: BrokerVersion, proto: i32) -> bool {
    client_version >= proto_ver(proto)
}

/// Folds a driver info block into a comparable version.
pub fn version_from_driver_info(info: &[u8]) -> BrokerVersion {
    if info.len() < DRIVER_INFO_SIZE {
        return make_ver(8, 2, 0);
    }
    if info[DRIVER_INFO_PROTOCOL] > 0 {
        proto_ver(info[DRIVER_INFO_PROTOCOL] as i32)
    } else {
        make_ver(
            info[DRIVER_INFO_MAJOR],
            info[DRIVER_INFO_MINOR],
            info[DRIVER_INFO_PATCH],
        )
    }
}

pub fn has_capability(info: &[u8], bit: u8) -> bool {
    info.len() >= DRIVER_INFO_SIZE && info[DRIVER_INFO_CAPABILITIES] & bit != 0
}

/// Coarse-grains a client version into the bucket used as part of the
/// statement cache key. Statements prepared under one reply layout must not
/// be served to a driver expecting another.
pub fn protocol_bucket(client_version: BrokerVersion) -> BrokerVersion {
    if client_version < make_ver(8, 3, 0) {
        make_ver(8, 2, 0)
    } else if client_version < make_ver(8, 4, 0) {
        make_ver(8, 3, 0)
    } else if client_version <= proto_ver(PROTOCOL_V1) {
        proto_ver(PROTOCOL_V1)
    } else {
        proto_ver(CURRENT_PROTOCOL)
    }
}

/// Pre-8.3.0 replies carry a bare error code with no indicator field.
pub fn error_indicator_supported(client_version: BrokerVersion) -> bool {
    client_version >= make_ver(8, 3, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triples_order_below_protocol_versions() {
        assert!(make_ver(8, 4, 9) < proto_ver(PROTOCOL_V1));
        assert!(proto_ver(PROTOCOL_V1) < proto_ver(PROTOCOL_V2));
    }

    #[test]
    fn buckets() {
        assert_eq!(protocol_bucket(make_ver(8, 2, 5)), make_ver(8, 2, 0));
        assert_eq!(protocol_bucket(make_ver(8, 3, 1)), make_ver(8, 3, 0));
        assert_eq!(protocol_bucket(make_ver(8, 4, 0)), proto_ver(PROTOCOL_V1));
        assert_eq!(protocol_bucket(proto_ver(PROTOCOL_V1)), proto_ver(PROTOCOL_V1));
        assert_eq!(protocol_bucket(proto_ver(PROTOCOL_V2)), proto_ver(PROTOCOL_V2));
    }

    #[test]
    fn driver_info_with_protocol_byte_wins() {
        let mut info = [0u8; DRIVER_INFO_SIZE];
        info[DRIVER_INFO_MAJOR] = 8;
        info[DRIVER_INFO_MINOR] = 4;
        info[DRIVER_INFO_PROTOCOL] = PROTOCOL_V2 as u8;
        assert_eq!(version_from_driver_info(&info), proto_ver(PROTOCOL_V2));

        info[DRIVER_INFO_PROTOCOL] = 0;
        assert_eq!(version_from_driver_info(&info), make_ver(8, 4, 0));
    }

    #[test]
    fn capability_bit() {
        let mut info = [0u8; DRIVER_INFO_SIZE];
        assert!(!has_capability(&info, CAP_RENEWED_ERROR_CODE));
        info[DRIVER_INFO_CAPABILITIES] = CAP_RENEWED_ERROR_CODE;
        assert!(has_capability(&info, CAP_RENEWED_ERROR_CODE));
    }
}
