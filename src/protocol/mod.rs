/// Wire-level helpers: the RESP codec plus builders for the handful of
/// commands the cache layer issues, and decoding of their replies
pub mod resp;

pub use resp::{RespEncoder, RespParser, RespValue};

use crate::error::{CacheError, CacheResult};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;

/// A single Redis command as a list of bulk-string arguments
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_bytes())],
        }
    }

    pub fn arg<A: AsRef<[u8]>>(mut self, arg: A) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    pub fn arg_bytes(mut self, arg: Bytes) -> Self {
        self.args.push(arg);
        self
    }

    /// Upper-cased command name
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.args[0]).to_ascii_uppercase()
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        RespEncoder::encode_command_into(buf, &self.args);
    }

    pub fn ping() -> Self {
        Command::new("PING")
    }

    pub fn role() -> Self {
        Command::new("ROLE")
    }

    pub fn hset<'a, I>(key: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        fields
            .into_iter()
            .fold(Command::new("HSET").arg(key), |cmd, (field, value)| {
                cmd.arg(field).arg(value)
            })
    }

    pub fn hgetall(key: &str) -> Self {
        Command::new("HGETALL").arg(key)
    }

    pub fn expire(key: &str, seconds: u64) -> Self {
        Command::new("EXPIRE").arg(key).arg(seconds.to_string())
    }

    pub fn del<S: AsRef<str>>(keys: &[S]) -> Self {
        keys.iter()
            .fold(Command::new("DEL"), |cmd, key| cmd.arg(key.as_ref()))
    }

    pub fn sadd(key: &str, member: &str) -> Self {
        Command::new("SADD").arg(key).arg(member)
    }

    pub fn smembers(key: &str) -> Self {
        Command::new("SMEMBERS").arg(key)
    }

    pub fn scan(cursor: u64, pattern: &str, count: usize) -> Self {
        Command::new("SCAN")
            .arg(cursor.to_string())
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.to_string())
    }

    pub fn sentinel(subcommand: &str, master_name: &str) -> Self {
        Command::new("SENTINEL").arg(subcommand).arg(master_name)
    }

    pub fn subscribe(channel: &str) -> Self {
        Command::new("SUBSCRIBE").arg(channel)
    }

    pub fn multi() -> Self {
        Command::new("MULTI")
    }

    pub fn exec() -> Self {
        Command::new("EXEC")
    }
}

// Only the command name is printed: arguments may carry session payloads
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({}, {} args)", self.name(), self.args.len() - 1)
    }
}

/// Turn a `-ERR` reply into a backend error, pass anything else through
pub fn check_reply(command: &str, reply: RespValue) -> CacheResult<RespValue> {
    match reply {
        RespValue::Error(message) => Err(CacheError::backend(format!("{}: {}", command, message))),
        other => Ok(other),
    }
}

/// Decode an HGETALL reply; an empty hash means the key does not exist
pub fn reply_to_hash(reply: RespValue) -> CacheResult<Option<HashMap<String, Bytes>>> {
    let reply = check_reply("HGETALL", reply)?;
    let map = reply
        .into_field_map()
        .ok_or_else(|| CacheError::protocol("HGETALL reply is not a field/value array"))?;
    Ok(if map.is_empty() { None } else { Some(map) })
}

/// Decode an array of bulk strings (SMEMBERS, SCAN key batch)
pub fn reply_to_strings(reply: RespValue) -> CacheResult<Vec<String>> {
    let items = reply
        .into_array()
        .ok_or_else(|| CacheError::protocol("expected array reply"))?;
    items
        .into_iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| CacheError::protocol("expected string element"))
        })
        .collect()
}

/// Decode a SCAN reply into `(next_cursor, keys)`
pub fn reply_to_scan(reply: RespValue) -> CacheResult<(u64, Vec<String>)> {
    let reply = check_reply("SCAN", reply)?;
    let mut parts = reply
        .into_array()
        .ok_or_else(|| CacheError::protocol("SCAN reply is not an array"))?
        .into_iter();

    let cursor = parts
        .next()
        .and_then(|c| c.as_integer())
        .ok_or_else(|| CacheError::protocol("SCAN reply missing cursor"))?;
    let keys = parts
        .next()
        .ok_or_else(|| CacheError::protocol("SCAN reply missing key batch"))?;

    Ok((cursor as u64, reply_to_strings(keys)?))
}

/// Decode an EXEC reply into the replies of the queued commands. A NULL
/// reply means the transaction was aborted and nothing was applied.
pub fn reply_to_exec(reply: RespValue) -> CacheResult<Vec<RespValue>> {
    match check_reply("EXEC", reply)? {
        RespValue::Array(Some(replies)) => Ok(replies),
        RespValue::Array(None) => Err(CacheError::backend("EXEC: transaction aborted")),
        _ => Err(CacheError::protocol("EXEC reply is not an array")),
    }
}

/// Decode a ROLE reply down to its first element (`master`, `slave`, `sentinel`)
pub fn reply_to_role(reply: RespValue) -> CacheResult<String> {
    let reply = check_reply("ROLE", reply)?;
    reply
        .into_array()
        .and_then(|items| items.into_iter().next())
        .and_then(|first| first.as_str().map(str::to_string))
        .ok_or_else(|| CacheError::protocol("ROLE reply has no role name"))
}
