//! Proxy configuration model. The server binary deserializes this from a
//! JSON file; everything else reads it through the runtime.

use serde::Deserialize;

use crate::router::KeyType;
use crate::ProxyError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default)]
    pub proxy_id: u32,

    /// Upper bound on concurrent client connections; the context pool is
    /// sized to match.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    #[serde(default = "default_max_prepared_stmts")]
    pub max_prepared_stmts: usize,

    /// Seconds a context may wait for an idle CAS or an in-progress prepare.
    /// Zero disables the timeout.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout: i32,

    #[serde(default)]
    pub appl_server: ApplServer,

    #[serde(default = "default_isolation_level")]
    pub isolation_level: i32,

    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: i32,

    #[serde(default = "default_db_version")]
    pub db_version: String,

    pub shards: Vec<ShardConfig>,
    pub users: Vec<UserConfig>,
    pub shard_keys: Vec<ShardKeyConfig>,
}

/// Backend flavor. Selects user- and string-key comparison semantics:
/// MySQL compares case-sensitively, CUBRID does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplServer {
    #[default]
    Cubrid,
    Mysql,
}

impl ApplServer {
    pub fn case_sensitive_users(self) -> bool {
        matches!(self, ApplServer::Mysql)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardConfig {
    pub shard_id: i32,
    pub max_cas: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserConfig {
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShardKeyConfig {
    pub column: String,
    pub key_type: KeyType,
    pub ranges: Vec<KeyRangeConfig>,
}

/// One row of the key-range table. Bounds are written as strings in the
/// config file and parsed according to the column's key type.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyRangeConfig {
    pub min: String,
    pub max: String,
    pub shard_id: i32,
}

fn default_max_clients() -> usize {
    256
}

fn default_max_prepared_stmts() -> usize {
    1024
}

fn default_wait_timeout() -> i32 {
    30
}

fn default_isolation_level() -> i32 {
    3
}

fn default_lock_timeout() -> i32 {
    -1
}

fn default_db_version() -> String {
    "shardcast".to_string()
}

impl ProxyConfig {
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn max_cas_per_shard(&self) -> usize {
        self.shards.iter().map(|s| s.max_cas).max().unwrap_or(0)
    }

    pub fn find_user(&self, user: &str) -> Option<&UserConfig> {
        let case_sensitive = self.appl_server.case_sensitive_users();
        self.users.iter().find(|u| {
            if case_sensitive {
                u.user == user
            } else {
                u.user.eq_ignore_ascii_case(user)
            }
        })
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if self.shards.is_empty() {
            return Err(ProxyError::Config("no shards configured".into()));
        }
        for (i, shard) in self.shards.iter().enumerate() {
            if shard.shard_id != i as i32 {
                return Err(ProxyError::Config(format!(
                    "shard ids must be contiguous from zero, found {} at position {}",
                    shard.shard_id, i
                )));
            }
            if shard.max_cas == 0 {
                return Err(ProxyError::Config(format!(
                    "shard {} has no CAS slots",
                    shard.shard_id
                )));
            }
        }
        if self.users.is_empty() {
            return Err(ProxyError::Config("no users configured".into()));
        }
        if self.shard_keys.is_empty() {
            return Err(ProxyError::Config("no shard key columns configured".into()));
        }
        for key in &self.shard_keys {
            for range in &key.ranges {
                if !(0..self.shards.len() as i32).contains(&range.shard_id) {
                    return Err(ProxyError::Config(format!(
                        "key column {} maps to unknown shard {}",
                        key.column, range.shard_id
                    )));
                }
            }
        }
        if self.max_clients == 0 {
            return Err(ProxyError::Config("max_clients must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_config(shards: usize, cas_per_shard: usize) -> ProxyConfig {
    ProxyConfig {
        proxy_id: 0,
        max_clients: 16,
        max_prepared_stmts: 32,
        wait_timeout: 30,
        appl_server: ApplServer::Cubrid,
        isolation_level: 3,
        lock_timeout: -1,
        db_version: "shardcast-test".to_string(),
        shards: (0..shards)
            .map(|i| ShardConfig {
                shard_id: i as i32,
                max_cas: cas_per_shard,
            })
            .collect(),
        users: vec![UserConfig {
            user: "shard".to_string(),
            password: "shard123".to_string(),
        }],
        shard_keys: vec![ShardKeyConfig {
            column: "k".to_string(),
            key_type: KeyType::Integer,
            ranges: (0..shards)
                .map(|i| KeyRangeConfig {
                    min: (i as i64 * 100).to_string(),
                    max: (i as i64 * 100 + 99).to_string(),
                    shard_id: i as i32,
                })
                .collect(),
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_parses() {
        let raw = r#"{
            "proxy_id": 1,
            "max_clients": 64,
            "wait_timeout": 10,
            "appl_server": "mysql",
            "shards": [
                { "shard_id": 0, "max_cas": 4 },
                { "shard_id": 1, "max_cas": 4 }
            ],
            "users": [ { "user": "app", "password": "secret" } ],
            "shard_keys": [
                {
                    "column": "customer_id",
                    "key_type": "integer",
                    "ranges": [
                        { "min": "0", "max": "999", "shard_id": 0 },
                        { "min": "1000", "max": "1999", "shard_id": 1 }
                    ]
                }
            ]
        }"#;
        let config: ProxyConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.shard_count(), 2);
        assert!(config.appl_server.case_sensitive_users());
        assert!(config.find_user("app").is_some());
        assert!(config.find_user("APP").is_none());
    }

    #[test]
    fn user_lookup_is_case_insensitive_for_cubrid() {
        let config = test_config(2, 2);
        assert!(config.find_user("SHARD").is_some());
    }

    #[test]
    fn gapped_shard_ids_are_rejected() {
        let mut config = test_config(2, 2);
        config.shards[1].shard_id = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn range_to_unknown_shard_is_rejected() {
        let mut config = test_config(2, 2);
        config.shard_keys[0].ranges[0].shard_id = 9;
        assert!(config.validate().is_err());
    }
}
