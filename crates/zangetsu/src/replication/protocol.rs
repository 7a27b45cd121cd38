//! Wire messages.
//!
//! Every message is one JSON object. Commands carry their name in a
//! `"command"` field; raw payload bytes follow `add` commands and
//! successful `get` replies.

use crate::record::codec::RecordFlags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Major protocol version spoken by this crate.
pub const PROTOCOL_MAJOR: u32 = 1;

/// Minor protocol version spoken by this crate.
pub const PROTOCOL_MINOR: u32 = 0;

/// Identity a replica slave presents in the handshake.
pub const REPLICA_SLAVE_IDENTITY: &str = "replica-slave";

/// A request sent to a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    /// Request the table of contents.
    #[serde(rename = "getToc")]
    GetToc,

    /// Remove a group, or only the partition containing `timestamp`.
    #[serde(rename = "remove")]
    Remove {
        /// Group name.
        group: String,
        /// Unix timestamp in seconds selecting one partition.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Remove one partition.
    #[serde(rename = "removeOne")]
    RemoveOne {
        /// Group name.
        group: String,
        /// Day timestamp of the partition.
        #[serde(rename = "dayTimestamp")]
        day_timestamp: u64,
    },

    /// Append `size` raw bytes that follow this message.
    #[serde(rename = "add")]
    Add {
        /// Group name.
        group: String,
        /// Unix timestamp in seconds; selects the day partition.
        timestamp: u64,
        /// Payload size in bytes.
        size: u64,
        /// Caller-chosen id under which the result is reported.
        opid: u64,
        /// Store the record with the corruption flag.
        #[serde(default, skip_serializing_if = "is_false")]
        corrupted: bool,
    },

    /// Report (and forget) the results of all adds so far.
    #[serde(rename = "results")]
    Results {
        /// Forget the results without reporting them.
        #[serde(default, skip_serializing_if = "is_false")]
        discard: bool,
    },

    /// Read the record at `offset`.
    #[serde(rename = "get")]
    Get {
        /// Group name.
        group: String,
        /// Unix timestamp in seconds; selects the day partition.
        timestamp: u64,
        /// Record offset.
        offset: u64,
    },

    /// Liveness and ordering barrier.
    #[serde(rename = "ping")]
    Ping {
        /// Delay the reply by this many milliseconds.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sleep: Option<u64>,
    },
}

impl Command {
    /// Builds an `add` for a record of `size` payload bytes.
    pub fn add(group: &str, timestamp: u64, size: u64, opid: u64, flags: RecordFlags) -> Self {
        Command::Add {
            group: group.to_string(),
            timestamp,
            size,
            opid,
            corrupted: flags.is_corrupted(),
        }
    }
}

/// Reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Success.
    #[default]
    Ok,
    /// Failure; see `message`.
    Error,
}

/// Result of one `add`, reported by `results`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddResult {
    /// Outcome.
    pub status: Status,
    /// Offset of the stored record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AddResult {
    /// A successful add at `offset`.
    pub fn stored(offset: u64) -> Self {
        Self {
            status: Status::Ok,
            offset: Some(offset),
            message: None,
        }
    }

    /// A failed add.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            offset: None,
            message: Some(message.into()),
        }
    }
}

/// Generic reply to a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Outcome.
    pub status: Status,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Add results keyed by opid (`results`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<BTreeMap<u64, AddResult>>,
    /// Payload size of the returned record (`get`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Corruption flag of the returned record (`get`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corrupted: Option<bool>,
}

impl Reply {
    /// `{"status": "ok"}`
    pub fn ok() -> Self {
        Self::default()
    }

    /// `{"status": "error", "message": ...}`
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Whether the status is `ok`.
    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

/// Role of a server in replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Accepts replica slaves and pushes changes to them.
    Master,
    /// Follows a master.
    Slave,
}

/// First message a server sends on a new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHello {
    /// Major protocol version.
    #[serde(rename = "protocolMajor")]
    pub protocol_major: u32,
    /// Minor protocol version.
    #[serde(rename = "protocolMinor")]
    pub protocol_minor: u32,
    /// Server name and version.
    #[serde(rename = "serverName")]
    pub server_name: String,
    /// Replication role of the server.
    pub role: Role,
}

/// Client identification, answered with a [`HandshakeReply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    /// Client identity; [`REPLICA_SLAVE_IDENTITY`] for replica slaves.
    pub identity: String,
}

/// Server answer to [`Identify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeReply {
    /// Outcome.
    pub status: Status,
    /// Role assigned to the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub your_role: Option<Role>,
    /// Role of the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub my_role: Option<Role>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_encoding() {
        let cases = vec![
            (Command::GetToc, json!({"command": "getToc"})),
            (
                Command::Remove {
                    group: "foo".into(),
                    timestamp: None,
                },
                json!({"command": "remove", "group": "foo"}),
            ),
            (
                Command::RemoveOne {
                    group: "foo".into(),
                    day_timestamp: 18_000,
                },
                json!({"command": "removeOne", "group": "foo", "dayTimestamp": 18000}),
            ),
            (
                Command::add("foo", 86_400, 5, 0, RecordFlags::empty()),
                json!({"command": "add", "group": "foo", "timestamp": 86400, "size": 5, "opid": 0}),
            ),
            (
                Command::add("foo", 86_400, 5, 0, RecordFlags::CORRUPTED),
                json!({"command": "add", "group": "foo", "timestamp": 86400, "size": 5, "opid": 0, "corrupted": true}),
            ),
            (
                Command::Results { discard: false },
                json!({"command": "results"}),
            ),
            (Command::Ping { sleep: None }, json!({"command": "ping"})),
        ];

        for (command, expected) in cases {
            assert_eq!(serde_json::to_value(&command).unwrap(), expected);
            let parsed: Command = serde_json::from_value(expected).unwrap();
            assert_eq!(parsed, command);
        }
    }

    #[test]
    fn test_add_field_order() {
        let encoded = serde_json::to_string(&Command::add("foo", 0, 3, 1, RecordFlags::empty())).unwrap();
        assert_eq!(
            encoded,
            r#"{"command":"add","group":"foo","timestamp":0,"size":3,"opid":1}"#
        );
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"command":"explode"}"#).is_err());
        assert!(serde_json::from_str::<Command>(r#"{"command":"removeOne","group":"x"}"#).is_err());
    }

    #[test]
    fn test_reply_encoding() {
        assert_eq!(serde_json::to_value(Reply::ok()).unwrap(), json!({"status": "ok"}));
        assert_eq!(
            serde_json::to_value(Reply::error("nope")).unwrap(),
            json!({"status": "error", "message": "nope"})
        );

        let mut results = BTreeMap::new();
        results.insert(0, AddResult::stored(34));
        let reply = Reply {
            results: Some(results),
            ..Reply::ok()
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"status": "ok", "results": {"0": {"status": "ok", "offset": 34}}})
        );
        let parsed: Reply = serde_json::from_value(serde_json::to_value(&reply).unwrap()).unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn test_handshake_encoding() {
        let hello = ServerHello {
            protocol_major: PROTOCOL_MAJOR,
            protocol_minor: PROTOCOL_MINOR,
            server_name: "Zangetsu/1.0".into(),
            role: Role::Master,
        };
        assert_eq!(
            serde_json::to_value(&hello).unwrap(),
            json!({"protocolMajor": 1, "protocolMinor": 0, "serverName": "Zangetsu/1.0", "role": "master"})
        );

        let reply: HandshakeReply =
            serde_json::from_str(r#"{"status":"ok","your_role":"slave","my_role":"master"}"#).unwrap();
        assert_eq!(reply.your_role, Some(Role::Slave));
        assert_eq!(reply.my_role, Some(Role::Master));
    }
}
