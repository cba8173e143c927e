use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::resp::Message;
use crate::types::ServerState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("value is not an integer or out of range")]
    BadNumberFormat,
    #[error("{0} is only served by a primary")]
    PrimaryOnly(&'static str),
}

impl CommandError {
    pub fn to_message(&self) -> Message {
        Message::error(format!("ERR {self}"))
    }
}

/// Commands this server knows, resolved once when a message is turned into a [`Command`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandName {
    Ping,
    Echo,
    Set,
    Get,
    Del,
    Info,
    Replconf,
    Psync,
    /// Anything else, upper-cased. Acknowledged with `+OK`.
    Unknown(String),
}

impl CommandName {
    pub fn parse(raw: &[u8]) -> Self {
        let name = String::from_utf8_lossy(trim_line_terminators(raw)).to_ascii_uppercase();
        match name.as_str() {
            "PING" => CommandName::Ping,
            "ECHO" => CommandName::Echo,
            "SET" => CommandName::Set,
            "GET" => CommandName::Get,
            "DEL" => CommandName::Del,
            "INFO" => CommandName::Info,
            "REPLCONF" => CommandName::Replconf,
            "PSYNC" => CommandName::Psync,
            _ => CommandName::Unknown(name),
        }
    }
}

fn trim_line_terminators(raw: &[u8]) -> &[u8] {
    let is_terminator = |b: &u8| *b == b'\r' || *b == b'\n';
    let start = raw.iter().position(|b| !is_terminator(b)).unwrap_or(raw.len());
    let end = raw.iter().rposition(|b| !is_terminator(b)).map_or(start, |i| i + 1);
    &raw[start..end]
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub name: CommandName,
    /// The name exactly as received, forwarded verbatim to replicas.
    pub raw_name: Bytes,
    pub args: Vec<Message>,
}

impl Command {
    /// Returns `None` unless `message` is a non-empty array headed by a string.
    pub fn from_message(message: Message) -> Option<Self> {
        let Message::Array(mut items) = message else {
            return None;
        };
        if items.is_empty() {
            return None;
        }
        let args = items.split_off(1);
        let raw_name = match items.pop()? {
            Message::BulkString(b) => b,
            Message::SimpleString(s) => Bytes::from(s),
            _ => return None,
        };
        Some(Self {
            name: CommandName::parse(&raw_name),
            raw_name,
            args,
        })
    }

    /// The command re-encoded as an array of bulk strings.
    pub fn to_frame(&self) -> Message {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(Message::BulkString(self.raw_name.clone()));
        parts.extend(self.args.iter().map(|arg| match arg {
            Message::SimpleString(s) => Message::bulk(s.clone()),
            other => other.clone(),
        }));
        Message::Array(parts)
    }

    /// `REPLCONF GETACK`: the one command a replica answers on its primary link.
    pub fn is_getack(&self) -> bool {
        self.name == CommandName::Replconf
            && self
                .args
                .first()
                .and_then(Message::as_bytes)
                .is_some_and(|sub| sub.eq_ignore_ascii_case(b"getack"))
    }
}

fn string_arg(arg: &Message) -> Result<Bytes, CommandError> {
    match arg {
        Message::BulkString(b) => Ok(b.clone()),
        Message::SimpleString(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
        _ => Err(CommandError::InvalidArgument("argument must be a string".to_string())),
    }
}

/// Runs one command against the shared state and returns its reply.
///
/// Write commands on a primary are handed to the propagator after the local
/// store has been updated.
pub fn execute(state: &ServerState, command: &Command) -> Result<Message, CommandError> {
    let args = command.args.as_slice();
    match &command.name {
        CommandName::Ping => Ok(Message::simple("PONG")),
        CommandName::Echo => handle_echo(args),
        CommandName::Set => {
            let reply = handle_set(args, state)?;
            propagate(state, command);
            Ok(reply)
        }
        CommandName::Get => handle_get(args, state),
        CommandName::Del => {
            let reply = handle_del(args, state)?;
            propagate(state, command);
            Ok(reply)
        }
        CommandName::Info => Ok(handle_info(state)),
        CommandName::Replconf => handle_replconf(args),
        CommandName::Psync => handle_psync(args, state),
        CommandName::Unknown(name) => {
            // Unknown commands are acknowledged rather than rejected.
            debug!(command = %name, "acknowledging unrecognized command");
            Ok(Message::simple("OK"))
        }
    }
}

fn propagate(state: &ServerState, command: &Command) {
    if state.replication.is_primary() {
        state.replication.propagator.propagate(&command.to_frame());
    }
}

fn handle_echo(args: &[Message]) -> Result<Message, CommandError> {
    match args {
        [arg] => Ok(Message::BulkString(string_arg(arg)?)),
        _ => Err(CommandError::WrongArity("echo")),
    }
}

fn handle_set(args: &[Message], state: &ServerState) -> Result<Message, CommandError> {
    let ttl_millis = match args {
        [_, _] => 0,
        // A fourth argument is only a TTL when preceded by PX; otherwise it is ignored.
        [_, _, option, ttl] if string_arg(option)?.eq_ignore_ascii_case(b"PX") => {
            let ttl = string_arg(ttl)?;
            std::str::from_utf8(&ttl)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(CommandError::BadNumberFormat)?
        }
        [_, _, _, _] => 0,
        _ => return Err(CommandError::WrongArity("set")),
    };
    state.db.set(string_arg(&args[0])?, string_arg(&args[1])?, ttl_millis);
    Ok(Message::simple("OK"))
}

fn handle_get(args: &[Message], state: &ServerState) -> Result<Message, CommandError> {
    let [key] = args else {
        return Err(CommandError::WrongArity("get"));
    };
    Ok(match state.db.get(&string_arg(key)?) {
        Some(value) => Message::BulkString(value),
        None => Message::NullBulkString,
    })
}

fn handle_del(args: &[Message], state: &ServerState) -> Result<Message, CommandError> {
    if args.is_empty() {
        return Err(CommandError::WrongArity("del"));
    }
    let mut removed = 0;
    for key in args {
        if state.db.delete(&string_arg(key)?) {
            removed += 1;
        }
    }
    Ok(Message::Integer(removed))
}

fn handle_info(state: &ServerState) -> Message {
    let replication = &state.replication;
    let mut lines = vec![
        "# Replication".to_string(),
        format!("role:{}", replication.role.as_str()),
    ];
    if replication.is_primary() {
        lines.push(format!("connected_slaves:{}", replication.propagator.replica_count()));
        lines.push(format!("master_replid:{}", replication.replid));
        lines.push(format!("master_repl_offset:{}", replication.propagator.offset()));
    } else {
        let status = if replication.link_up() { "up" } else { "down" };
        lines.push(format!("master_link_status:{status}"));
    }
    Message::bulk(lines.join("\r\n"))
}

fn handle_replconf(args: &[Message]) -> Result<Message, CommandError> {
    let Some(first) = args.first() else {
        return Err(CommandError::WrongArity("replconf"));
    };
    let sub = first.as_bytes().ok_or_else(|| {
        CommandError::InvalidArgument("REPLCONF option must be a string".to_string())
    })?;
    match sub.to_ascii_lowercase().as_slice() {
        b"listening-port" | b"capa" => Ok(Message::simple("OK")),
        b"getack" => Ok(Message::command(["REPLCONF", "ACK", "0"])),
        other => Err(CommandError::InvalidArgument(format!(
            "unrecognized REPLCONF option '{}'",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn handle_psync(args: &[Message], state: &ServerState) -> Result<Message, CommandError> {
    // A replica never propagates, so a chained replica would receive nothing.
    if !state.replication.is_primary() {
        return Err(CommandError::PrimaryOnly("PSYNC"));
    }
    let [replid, offset] = args else {
        return Err(CommandError::WrongArity("psync"));
    };
    let full_resync = replid.as_bytes() == Some(&b"?"[..]) && offset.as_bytes() == Some(&b"-1"[..]);
    if !full_resync {
        return Err(CommandError::InvalidArgument(
            "only full resynchronization (PSYNC ? -1) is supported".to_string(),
        ));
    }
    Ok(Message::simple(format!("FULLRESYNC {} 0", state.replication.replid)))
}
