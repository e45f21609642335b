//! Shard-key router: maps a hint value to a shard id through the configured
//! key-range table. Ranges are kept sorted; lookup is a binary search under
//! the key column's type-specific comparator.

use serde::Deserialize;

use crate::config::{ApplServer, ProxyConfig, ShardKeyConfig};
use crate::ProxyError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Integer,
    Bigint,
    Short,
    String,
}

impl KeyType {
    fn is_numeric(self) -> bool {
        !matches!(self, KeyType::String)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyBound {
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone)]
struct KeyRange {
    min: KeyBound,
    max: KeyBound,
    shard_id: i32,
}

pub struct Router {
    column: String,
    key_type: KeyType,
    /// CUBRID-style comparison folds case; MySQL-style does not.
    fold_case: bool,
    ranges: Vec<KeyRange>,
}

impl Router {
    pub fn from_config(key: &ShardKeyConfig, appl_server: ApplServer) -> Result<Self, ProxyError> {
        let fold_case = !appl_server.case_sensitive_users();
        let mut ranges = Vec::with_capacity(key.ranges.len());
        for range in &key.ranges {
            let min = parse_bound(key.key_type, &range.min, fold_case).ok_or_else(|| {
                ProxyError::Config(format!(
                    "bad range bound {} for key column {}",
                    range.min, key.column
                ))
            })?;
            let max = parse_bound(key.key_type, &range.max, fold_case).ok_or_else(|| {
                ProxyError::Config(format!(
                    "bad range bound {} for key column {}",
                    range.max, key.column
                ))
            })?;
            if max < min {
                return Err(ProxyError::Config(format!(
                    "inverted range [{}, {}] for key column {}",
                    range.min, range.max, key.column
                )));
            }
            ranges.push(KeyRange {
                min,
                max,
                shard_id: range.shard_id,
            });
        }
        ranges.sort_by(|a, b| a.min.cmp(&b.min));
        for pair in ranges.windows(2) {
            if pair[1].min <= pair[0].max {
                return Err(ProxyError::Config(format!(
                    "overlapping ranges for key column {}",
                    key.column
                )));
            }
        }
        Ok(Self {
            column: key.column.clone(),
            key_type: key.key_type,
            fold_case,
            ranges,
        })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Routes a textual key value (from a hint).
    pub fn shard_for_text(&self, value: &str) -> Option<i32> {
        let bound = parse_bound(self.key_type, value, self.fold_case)?;
        self.lookup(&bound)
    }

    /// Routes a bind value from an execute request. Numeric key columns take
    /// big-endian integer binds; string columns take NUL-terminated text.
    pub fn shard_for_bind(&self, bind: &[u8]) -> Option<i32> {
        if self.key_type.is_numeric() {
            let v = shardcast_proto::frame::arg_as_i64(bind).ok()?;
            self.lookup(&KeyBound::Int(v))
        } else {
            let s = shardcast_proto::frame::arg_as_str(bind).ok()?;
            let bound = parse_bound(self.key_type, s, self.fold_case)?;
            self.lookup(&bound)
        }
    }

    fn lookup(&self, value: &KeyBound) -> Option<i32> {
        let at = self.ranges.partition_point(|r| r.min <= *value);
        if at == 0 {
            return None;
        }
        let range = &self.ranges[at - 1];
        (*value <= range.max).then_some(range.shard_id)
    }
}

fn parse_bound(key_type: KeyType, raw: &str, fold_case: bool) -> Option<KeyBound> {
    match key_type {
        KeyType::Short => raw.trim().parse::<i16>().ok().map(|v| KeyBound::Int(v as i64)),
        KeyType::Integer => raw.trim().parse::<i32>().ok().map(|v| KeyBound::Int(v as i64)),
        KeyType::Bigint => raw.trim().parse::<i64>().ok().map(KeyBound::Int),
        KeyType::String => Some(KeyBound::Str(if fold_case {
            raw.to_ascii_lowercase()
        } else {
            raw.to_string()
        })),
    }
}

/// All configured key columns; hints route through the primary (first) one.
pub struct RouterTable {
    routers: Vec<Router>,
}

impl RouterTable {
    pub fn from_config(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let routers = config
            .shard_keys
            .iter()
            .map(|key| Router::from_config(key, config.appl_server))
            .collect::<Result<Vec<_>, _>>()?;
        if routers.is_empty() {
            return Err(ProxyError::Config("no shard key columns configured".into()));
        }
        Ok(Self { routers })
    }

    pub fn primary(&self) -> &Router {
        &self.routers[0]
    }

    pub fn by_column(&self, column: &str) -> Option<&Router> {
        self.routers
            .iter()
            .find(|r| r.column.eq_ignore_ascii_case(column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{test_config, KeyRangeConfig};

    fn int_router() -> Router {
        let config = test_config(3, 1);
        Router::from_config(&config.shard_keys[0], ApplServer::Cubrid).unwrap()
    }

    #[test]
    fn integer_lookup_is_deterministic() {
        let router = int_router();
        assert_eq!(router.shard_for_text("0"), Some(0));
        assert_eq!(router.shard_for_text("99"), Some(0));
        assert_eq!(router.shard_for_text("100"), Some(1));
        assert_eq!(router.shard_for_text("250"), Some(2));
        assert_eq!(router.shard_for_text("300"), None);
        assert_eq!(router.shard_for_text("-1"), None);
        assert_eq!(router.shard_for_text("abc"), None);
    }

    #[test]
    fn bind_value_lookup() {
        let router = int_router();
        assert_eq!(router.shard_for_bind(&150i64.to_be_bytes()), Some(1));
        assert_eq!(router.shard_for_bind(&42i32.to_be_bytes()), Some(0));
        assert_eq!(router.shard_for_bind(b"junk!"), None);
    }

    #[test]
    fn string_keys_fold_case_for_cubrid_only() {
        let key = ShardKeyConfig {
            column: "region".to_string(),
            key_type: KeyType::String,
            ranges: vec![
                KeyRangeConfig {
                    min: "a".into(),
                    max: "m".into(),
                    shard_id: 0,
                },
                KeyRangeConfig {
                    min: "n".into(),
                    max: "z".into(),
                    shard_id: 1,
                },
            ],
        };
        let cubrid = Router::from_config(&key, ApplServer::Cubrid).unwrap();
        assert_eq!(cubrid.shard_for_text("EAST"), Some(0));
        assert_eq!(cubrid.shard_for_text("west"), Some(1));

        let mysql = Router::from_config(&key, ApplServer::Mysql).unwrap();
        assert_eq!(mysql.shard_for_text("EAST"), None);
        assert_eq!(mysql.shard_for_text("east"), Some(0));
    }

    #[test]
    fn overlapping_ranges_are_rejected() {
        let mut config = test_config(2, 1);
        config.shard_keys[0].ranges[1].min = "50".to_string();
        assert!(Router::from_config(&config.shard_keys[0], ApplServer::Cubrid).is_err());
    }

    #[test]
    fn short_key_rejects_out_of_range_bounds() {
        let key = ShardKeyConfig {
            column: "k".to_string(),
            key_type: KeyType::Short,
            ranges: vec![KeyRangeConfig {
                min: "0".into(),
                max: "70000".into(),
                shard_id: 0,
            }],
        };
        assert!(Router::from_config(&key, ApplServer::Cubrid).is_err());
    }

    #[test]
    fn router_table_primary_and_lookup() {
        let config = test_config(2, 1);
        let table = RouterTable::from_config(&config).unwrap();
        assert_eq!(table.primary().column(), "k");
        assert!(table.by_column("K").is_some());
        assert!(table.by_column("missing").is_none());
    }
}
