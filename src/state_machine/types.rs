//! Client operations, replies and the error vocabulary of the KV service

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors a client can observe from the KV service
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum KvError {
    /// This server cannot serve the request; try another one
    #[error("not leader")]
    NotLeader,
    /// No commit observed in time; the outcome is unknown
    #[error("timed out waiting for commit")]
    Timeout,
    /// The log slot was filled under a different leadership term
    #[error("outdated leader")]
    OutdatedLeader,
    /// Terminal answer for a `Get` on an absent key
    #[error("key not found")]
    KeyNotFound,
}

impl KvError {
    /// Whether a client should retry the same request
    pub fn is_retryable(&self) -> bool {
        !matches!(self, KvError::KeyNotFound)
    }
}

/// Result of one applied operation: the value for `Get`, empty for writes
pub type OpResult = Result<String, KvError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Get,
    Put,
    Append,
}

/// A client operation as it is stored in the replicated log.
///
/// `(client_id, seq)` names one logical request across all of its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Op {
    pub kind: OpKind,
    pub key: String,
    pub value: String,
    pub client_id: u64,
    pub seq: u64,
}

impl Op {
    pub fn get(key: impl Into<String>, client_id: u64, seq: u64) -> Self {
        Op {
            kind: OpKind::Get,
            key: key.into(),
            value: String::new(),
            client_id,
            seq,
        }
    }

    pub fn put(key: impl Into<String>, value: impl Into<String>, client_id: u64, seq: u64) -> Self {
        Op {
            kind: OpKind::Put,
            key: key.into(),
            value: value.into(),
            client_id,
            seq,
        }
    }

    pub fn append(
        key: impl Into<String>,
        value: impl Into<String>,
        client_id: u64,
        seq: u64,
    ) -> Self {
        Op {
            kind: OpKind::Append,
            key: key.into(),
            value: value.into(),
            client_id,
            seq,
        }
    }

    /// Log command text for this operation
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(command: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(command)
    }
}

/// Write mode of a `PutAppend` request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    Put,
    Append,
}

impl From<WriteMode> for OpKind {
    fn from(mode: WriteMode) -> Self {
        match mode {
            WriteMode::Put => OpKind::Put,
            WriteMode::Append => OpKind::Append,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetArgs {
    pub key: String,
    pub client_id: u64,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAppendArgs {
    pub key: String,
    pub value: String,
    pub mode: WriteMode,
    pub client_id: u64,
    pub seq: u64,
}

impl From<GetArgs> for Op {
    fn from(args: GetArgs) -> Self {
        Op::get(args.key, args.client_id, args.seq)
    }
}

impl From<PutAppendArgs> for Op {
    fn from(args: PutAppendArgs) -> Self {
        Op {
            kind: args.mode.into(),
            key: args.key,
            value: args.value,
            client_id: args.client_id,
            seq: args.seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_command_text_is_stable() {
        let op = Op::append("k", "v", 7, 3);
        let command = op.encode().unwrap();
        assert_eq!(
            command,
            r#"{"kind":"Append","key":"k","value":"v","client_id":7,"seq":3}"#
        );
        assert_eq!(Op::decode(&command).unwrap(), op);
    }

    #[test]
    fn test_noop_is_not_an_op() {
        assert!(Op::decode(crate::core::NOOP_COMMAND).is_err());
    }

    #[test]
    fn test_put_append_args_into_op() {
        let args = PutAppendArgs {
            key: "x".to_string(),
            value: "1".to_string(),
            mode: WriteMode::Append,
            client_id: 1,
            seq: 2,
        };
        let op: Op = args.into();
        assert_eq!(op.kind, OpKind::Append);
        assert_eq!(op.seq, 2);
    }

    #[test]
    fn test_only_key_not_found_is_terminal() {
        assert!(!KvError::KeyNotFound.is_retryable());
        assert!(KvError::NotLeader.is_retryable());
        assert!(KvError::Timeout.is_retryable());
        assert!(KvError::OutdatedLeader.is_retryable());
    }
}
