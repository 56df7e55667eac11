//! Command dispatcher: maps a decoded RESP array to a handler and produces
//! the reply bytes. Covers PING/ECHO/SET (with EX/PX)/GET/CONFIG GET/KEYS/
//! INFO replication/SAVE/REPLCONF/PSYNC.

use bytes::Bytes;

use crate::config::Role;
use crate::error::CommandError;
use crate::keyspace::now_ms;
use crate::protocol::Frame;
use crate::server::Server;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetExpiry {
    Seconds(i64),
    Millis(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Echo(Bytes),
    Set {
        key: Vec<u8>,
        value: Bytes,
        expiry: Option<SetExpiry>,
    },
    Get(Vec<u8>),
    ConfigGet(String),
    Keys(String),
    InfoReplication,
    Save,
    ReplConf,
    Psync,
    Unknown,
}

/// What a dispatched command produces: zero or more reply parts (a frame
/// to encode, or already-framed raw bytes, used for the snapshot blob that
/// follows a FULLRESYNC line) plus whether it should be propagated to
/// attached replicas.
pub enum ReplyPart {
    Frame(Frame),
    Raw(Vec<u8>),
}

pub struct CommandOutcome {
    pub replies: Vec<ReplyPart>,
    pub propagate: bool,
}

impl CommandOutcome {
    fn single(frame: Frame) -> Self {
        CommandOutcome {
            replies: vec![ReplyPart::Frame(frame)],
            propagate: false,
        }
    }
}

/// Extracts the uppercased command name from a decoded array frame, without
/// fully parsing arguments. Used by the connection handler to special-case
/// PSYNC, which must take ownership of the connection rather than return a
/// simple reply.
pub fn peek_name(items: &[Frame]) -> Option<String> {
    items
        .first()
        .and_then(Frame::as_bytes)
        .map(|b| String::from_utf8_lossy(b).to_uppercase())
}

fn arg_bytes(items: &[Frame], index: usize) -> Option<Bytes> {
    match items.get(index) {
        Some(Frame::Bulk(b)) => Some(b.clone()),
        Some(Frame::Simple(s)) => Some(Bytes::copy_from_slice(s.as_bytes())),
        _ => None,
    }
}

fn arg_string(items: &[Frame], index: usize) -> Option<String> {
    arg_bytes(items, index).map(|b| String::from_utf8_lossy(&b).to_string())
}

pub fn parse(items: &[Frame]) -> Result<Command, CommandError> {
    let name = peek_name(items).ok_or(CommandError::Unknown)?;
    match name.as_str() {
        "PING" => Ok(Command::Ping),
        "ECHO" => {
            let message = arg_bytes(items, 1).unwrap_or_default();
            Ok(Command::Echo(message))
        }
        "SET" => parse_set(items),
        "GET" => {
            if items.len() != 2 {
                return Err(CommandError::WrongArity("get".into()));
            }
            let key = arg_bytes(items, 1).ok_or(CommandError::WrongArity("get".into()))?;
            Ok(Command::Get(key.to_vec()))
        }
        "CONFIG" => {
            let sub = arg_string(items, 1).unwrap_or_default().to_uppercase();
            if sub != "GET" || items.len() != 3 {
                return Err(CommandError::SyntaxError);
            }
            let param = arg_string(items, 2).ok_or(CommandError::SyntaxError)?;
            Ok(Command::ConfigGet(param))
        }
        "KEYS" => {
            let pattern = arg_string(items, 1).ok_or(CommandError::WrongArity("keys".into()))?;
            Ok(Command::Keys(pattern))
        }
        "INFO" => Ok(Command::InfoReplication),
        "SAVE" => Ok(Command::Save),
        "REPLCONF" => Ok(Command::ReplConf),
        "PSYNC" => Ok(Command::Psync),
        _ => Ok(Command::Unknown),
    }
}

fn parse_set(items: &[Frame]) -> Result<Command, CommandError> {
    if items.len() < 3 {
        return Err(CommandError::WrongArity("set".into()));
    }
    let key = arg_bytes(items, 1).ok_or(CommandError::WrongArity("set".into()))?;
    let value = arg_bytes(items, 2).ok_or(CommandError::WrongArity("set".into()))?;

    let mut expiry: Option<SetExpiry> = None;
    let mut i = 3;
    while i < items.len() {
        let token = arg_string(items, i).ok_or(CommandError::SyntaxError)?.to_uppercase();
        match token.as_str() {
            "EX" | "PX" => {
                let value_str = arg_string(items, i + 1).ok_or(CommandError::WrongArity("set".into()))?;
                let n = value_str
                    .parse::<i64>()
                    .map_err(|_| CommandError::NotAnInteger)?;
                expiry = Some(if token == "EX" {
                    SetExpiry::Seconds(n)
                } else {
                    SetExpiry::Millis(n)
                });
                i += 2;
            }
            _ => return Err(CommandError::SyntaxError),
        }
    }

    Ok(Command::Set {
        key: key.to_vec(),
        value,
        expiry,
    })
}

fn expiry_to_absolute_ms(expiry: &SetExpiry) -> u64 {
    let relative_ms = match expiry {
        SetExpiry::Seconds(s) => s.saturating_mul(1000),
        SetExpiry::Millis(ms) => *ms,
    };
    let now = now_ms() as i64;
    (now + relative_ms).max(0) as u64
}

pub fn execute(cmd: &Command, server: &Server) -> CommandOutcome {
    match cmd {
        Command::Ping => CommandOutcome::single(Frame::simple("PONG")),
        Command::Echo(message) => CommandOutcome::single(Frame::bulk(message.clone())),
        Command::Set { key, value, expiry } => {
            let expires_at_ms = expiry.as_ref().map(expiry_to_absolute_ms);
            server
                .keyspace
                .lock()
                .unwrap()
                .put(key.clone(), value.clone(), expires_at_ms);
            CommandOutcome {
                replies: vec![ReplyPart::Frame(Frame::simple("OK"))],
                propagate: server.role() == Role::Primary,
            }
        }
        Command::Get(key) => {
            let value = server.keyspace.lock().unwrap().get(key);
            let frame = match value {
                Some(v) => Frame::bulk(v),
                None => Frame::Null,
            };
            CommandOutcome::single(frame)
        }
        Command::ConfigGet(param) => {
            let frame = match server.config.get(param) {
                Some(value) => Frame::array(vec![
                    Frame::bulk(Bytes::from(param.clone())),
                    Frame::bulk(Bytes::from(value)),
                ]),
                None => Frame::Array(Vec::new()),
            };
            CommandOutcome::single(frame)
        }
        Command::Keys(pattern) => {
            let frame = if pattern == "*" {
                let keys = server.keyspace.lock().unwrap().keys();
                Frame::array(keys.into_iter().map(Frame::bulk).collect())
            } else {
                Frame::Array(Vec::new())
            };
            CommandOutcome::single(frame)
        }
        Command::InfoReplication => CommandOutcome::single(Frame::bulk(Bytes::from(info_replication(server)))),
        Command::Save => match server.save_snapshot_to_disk() {
            Ok(()) => CommandOutcome::single(Frame::simple("OK")),
            Err(e) => CommandOutcome::single(Frame::error(format!("ERR {e}"))),
        },
        Command::ReplConf => CommandOutcome::single(Frame::simple("OK")),
        Command::Psync => {
            // Handled before reaching `execute` by the connection handler,
            // which needs to take ownership of the socket to register the
            // replica. Reaching here means it was dispatched through the
            // normal path by mistake; reply OK rather than panic.
            CommandOutcome::single(Frame::simple("OK"))
        }
        Command::Unknown => CommandOutcome::single(Frame::error("ERR unknown command")),
    }
}

/// Builds the two reply parts a PSYNC full resync sends: the `+FULLRESYNC`
/// line, then the current snapshot framed as a bulk string with no
/// trailing `\r\n`. Registering the connection in the replica registry and
/// entering the forwarding loop is left to the connection handler, which
/// owns the socket.
pub fn build_psync_reply(server: &Server) -> Result<Vec<ReplyPart>, crate::error::SnapshotError> {
    let snapshot_bytes = server.snapshot_bytes_for_psync()?;
    let fullresync = Frame::simple(format!("FULLRESYNC {} 0", server.replid()));
    let mut framed = format!("${}\r\n", snapshot_bytes.len()).into_bytes();
    framed.extend_from_slice(&snapshot_bytes);
    Ok(vec![ReplyPart::Frame(fullresync), ReplyPart::Raw(framed)])
}

pub fn error_reply(err: &CommandError) -> Frame {
    match err {
        CommandError::WrongArity(name) => {
            Frame::error(format!("ERR wrong number of arguments for '{name}' command"))
        }
        CommandError::SyntaxError => Frame::error("ERR syntax error"),
        CommandError::NotAnInteger => Frame::error("ERR value is not an integer or out of range"),
        CommandError::Unknown => Frame::error("ERR unknown command"),
    }
}

fn info_replication(server: &Server) -> String {
    let role_str = match server.role() {
        Role::Primary => "master",
        Role::Replica => "slave",
    };
    format!(
        "# Replication\r\n\
         role:{role}\r\n\
         connected_slaves:{slaves}\r\n\
         master_replid:{replid}\r\n\
         master_repl_offset:0\r\n\
         second_repl_offset:-1\r\n\
         repl_backlog_active:0\r\n\
         repl_backlog_size:1048576\r\n\
         repl_backlog_first_byte_offset:0\r\n\
         repl_backlog_histlen:0\r\n",
        role = role_str,
        slaves = server.connected_replicas(),
        replid = server.replid(),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    fn test_server() -> Server {
        Server::new(Config {
            port: 0,
            dir: std::env::temp_dir().to_string_lossy().to_string(),
            dbfilename: format!("test-{}.rdb", rand::random::<u32>()),
            replica_of: None,
        })
    }

    fn array(parts: &[&[u8]]) -> Vec<Frame> {
        parts
            .iter()
            .map(|p| Frame::bulk(Bytes::copy_from_slice(p)))
            .collect()
    }

    #[test]
    fn parses_ping() {
        assert_eq!(parse(&array(&[b"PING"])).unwrap(), Command::Ping);
        assert_eq!(parse(&array(&[b"ping"])).unwrap(), Command::Ping);
    }

    #[test]
    fn echo_with_no_args_is_empty_bulk() {
        let server = test_server();
        let cmd = parse(&array(&[b"ECHO"])).unwrap();
        let outcome = execute(&cmd, &server);
        match &outcome.replies[0] {
            ReplyPart::Frame(Frame::Bulk(b)) => assert!(b.is_empty()),
            _ => panic!("expected empty bulk reply"),
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let server = test_server();
        let set = parse(&array(&[b"SET", b"foo", b"bar"])).unwrap();
        execute(&set, &server);
        let get = parse(&array(&[b"GET", b"foo"])).unwrap();
        let outcome = execute(&get, &server);
        match &outcome.replies[0] {
            ReplyPart::Frame(Frame::Bulk(b)) => assert_eq!(&b[..], b"bar"),
            _ => panic!("expected bulk reply"),
        }
    }

    #[test]
    fn get_on_unknown_key_is_null() {
        let server = test_server();
        let get = parse(&array(&[b"GET", b"nope"])).unwrap();
        let outcome = execute(&get, &server);
        assert!(matches!(outcome.replies[0], ReplyPart::Frame(Frame::Null)));
    }

    #[test]
    fn set_with_px_zero_expires_immediately() {
        let server = test_server();
        let set = parse(&array(&[b"SET", b"foo", b"bar", b"PX", b"0"])).unwrap();
        execute(&set, &server);
        let get = parse(&array(&[b"GET", b"foo"])).unwrap();
        let outcome = execute(&get, &server);
        assert!(matches!(outcome.replies[0], ReplyPart::Frame(Frame::Null)));
    }

    #[test]
    fn set_rejects_unknown_option() {
        let err = parse(&array(&[b"SET", b"foo", b"bar", b"WAT"])).unwrap_err();
        assert!(matches!(err, CommandError::SyntaxError));
    }

    #[test]
    fn set_rejects_non_integer_expiry() {
        let err = parse(&array(&[b"SET", b"foo", b"bar", b"EX", b"notanumber"])).unwrap_err();
        assert!(matches!(err, CommandError::NotAnInteger));
    }

    #[test]
    fn set_wrong_arity() {
        let err = parse(&array(&[b"SET", b"foo"])).unwrap_err();
        assert!(matches!(err, CommandError::WrongArity(name) if name == "set"));
    }

    #[test]
    fn last_expiry_option_wins() {
        let set = parse(&array(&[b"SET", b"foo", b"bar", b"EX", b"1", b"PX", b"100000"])).unwrap();
        match set {
            Command::Set { expiry, .. } => assert_eq!(expiry, Some(SetExpiry::Millis(100000))),
            _ => panic!("expected Set"),
        }
    }

    #[test]
    fn unknown_command_errors() {
        let server = test_server();
        let cmd = parse(&array(&[b"NOPE"])).unwrap();
        let outcome = execute(&cmd, &server);
        match &outcome.replies[0] {
            ReplyPart::Frame(Frame::Error(e)) => assert_eq!(e, "ERR unknown command"),
            _ => panic!("expected error reply"),
        }
    }

    #[test]
    fn keys_star_lists_live_keys() {
        let server = test_server();
        execute(&parse(&array(&[b"SET", b"a", b"1"])).unwrap(), &server);
        execute(&parse(&array(&[b"SET", b"b", b"2"])).unwrap(), &server);
        let outcome = execute(&parse(&array(&[b"KEYS", b"*"])).unwrap(), &server);
        match &outcome.replies[0] {
            ReplyPart::Frame(Frame::Array(items)) => assert_eq!(items.len(), 2),
            _ => panic!("expected array reply"),
        }
    }

    #[test]
    fn keys_non_star_pattern_is_empty() {
        let server = test_server();
        let outcome = execute(&parse(&array(&[b"KEYS", b"a*"])).unwrap(), &server);
        match &outcome.replies[0] {
            ReplyPart::Frame(Frame::Array(items)) => assert!(items.is_empty()),
            _ => panic!("expected array reply"),
        }
    }

    #[test]
    fn config_get_known_param() {
        let server = test_server();
        let outcome = execute(&parse(&array(&[b"CONFIG", b"GET", b"dbfilename"])).unwrap(), &server);
        match &outcome.replies[0] {
            ReplyPart::Frame(Frame::Array(items)) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(&items[0], Frame::Bulk(b) if &b[..] == b"dbfilename"));
            }
            _ => panic!("expected array reply"),
        }
    }

    #[test]
    fn info_replication_reports_master_role() {
        let server = test_server();
        let outcome = execute(&Command::InfoReplication, &server);
        match &outcome.replies[0] {
            ReplyPart::Frame(Frame::Bulk(b)) => {
                let text = String::from_utf8_lossy(b);
                assert!(text.contains("role:master"));
                assert!(text.contains("master_replid:"));
            }
            _ => panic!("expected bulk reply"),
        }
    }

    #[test]
    fn set_propagates_only_on_primary() {
        let server = test_server();
        let outcome = execute(&parse(&array(&[b"SET", b"a", b"1"])).unwrap(), &server);
        assert!(outcome.propagate);
    }
}
