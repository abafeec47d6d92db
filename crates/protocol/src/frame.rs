//! Typed frames exchanged between the dispatcher and the daemon.
//!
//! Kind bytes are fixed for wire compatibility and must never be renumbered.
//! Every child-scoped frame carries a leading `child_id` chosen by the
//! client, unique within its connection; `Launched`/`Failed` echo the id of
//! the `Launch` they answer.  This is what lets one session drive several
//! children concurrently over a single duplex channel.

use crate::command::CommandSpec;
use crate::wire::{self, Payload, WireError};

/// Fixed kind bytes, one per frame.
pub mod kind {
    pub const HELLO: u8 = 1;
    pub const HELLO_OK: u8 = 2;
    pub const HELLO_REJECT: u8 = 3;
    pub const LAUNCH: u8 = 4;
    pub const LAUNCHED: u8 = 5;
    pub const FAILED: u8 = 6;
    pub const STDIN: u8 = 7;
    pub const STDOUT: u8 = 8;
    pub const STDERR: u8 = 9;
    pub const STDIN_CLOSE: u8 = 10;
    pub const KILL: u8 = 11;
    pub const EXIT: u8 = 12;
    pub const PING: u8 = 13;
    pub const PONG: u8 = 14;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client credential presentation; first frame on every connection.
    Hello { cookie: Vec<u8> },
    HelloOk,
    HelloReject { reason: String },
    /// Launch request; `child_id` is chosen by the client.
    Launch { child_id: u32, spec: CommandSpec },
    Launched { child_id: u32, pid: u32 },
    Failed { child_id: u32, reason: String, errno: i32 },
    Stdin { child_id: u32, data: Vec<u8> },
    Stdout { child_id: u32, data: Vec<u8> },
    Stderr { child_id: u32, data: Vec<u8> },
    StdinClose { child_id: u32 },
    Kill { child_id: u32, signal: i32 },
    /// Terminal frame for a child; non-negative status is an exit code,
    /// negative status is the negated terminating signal.
    Exit { child_id: u32, status: i32 },
    Ping,
    Pong,
}

impl Frame {
    /// Serializes the frame body (kind byte + payload, no length prefix).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Frame::Hello { cookie } => {
                wire::put_u8(&mut out, kind::HELLO);
                wire::put_bytes(&mut out, cookie);
            }
            Frame::HelloOk => wire::put_u8(&mut out, kind::HELLO_OK),
            Frame::HelloReject { reason } => {
                wire::put_u8(&mut out, kind::HELLO_REJECT);
                wire::put_string(&mut out, reason);
            }
            Frame::Launch { child_id, spec } => {
                wire::put_u8(&mut out, kind::LAUNCH);
                wire::put_u32(&mut out, *child_id);
                spec.encode_payload(&mut out);
            }
            Frame::Launched { child_id, pid } => {
                wire::put_u8(&mut out, kind::LAUNCHED);
                wire::put_u32(&mut out, *child_id);
                wire::put_u32(&mut out, *pid);
            }
            Frame::Failed { child_id, reason, errno } => {
                wire::put_u8(&mut out, kind::FAILED);
                wire::put_u32(&mut out, *child_id);
                wire::put_string(&mut out, reason);
                wire::put_i32(&mut out, *errno);
            }
            Frame::Stdin { child_id, data } => {
                wire::put_u8(&mut out, kind::STDIN);
                wire::put_u32(&mut out, *child_id);
                wire::put_bytes(&mut out, data);
            }
            Frame::Stdout { child_id, data } => {
                wire::put_u8(&mut out, kind::STDOUT);
                wire::put_u32(&mut out, *child_id);
                wire::put_bytes(&mut out, data);
            }
            Frame::Stderr { child_id, data } => {
                wire::put_u8(&mut out, kind::STDERR);
                wire::put_u32(&mut out, *child_id);
                wire::put_bytes(&mut out, data);
            }
            Frame::StdinClose { child_id } => {
                wire::put_u8(&mut out, kind::STDIN_CLOSE);
                wire::put_u32(&mut out, *child_id);
            }
            Frame::Kill { child_id, signal } => {
                wire::put_u8(&mut out, kind::KILL);
                wire::put_u32(&mut out, *child_id);
                wire::put_i32(&mut out, *signal);
            }
            Frame::Exit { child_id, status } => {
                wire::put_u8(&mut out, kind::EXIT);
                wire::put_u32(&mut out, *child_id);
                wire::put_i32(&mut out, *status);
            }
            Frame::Ping => wire::put_u8(&mut out, kind::PING),
            Frame::Pong => wire::put_u8(&mut out, kind::PONG),
        }
        out
    }

    /// Parses a frame body (kind byte + payload).
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        let mut p = Payload::new(body);
        let frame = match p.u8()? {
            kind::HELLO => Frame::Hello { cookie: p.bytes()? },
            kind::HELLO_OK => Frame::HelloOk,
            kind::HELLO_REJECT => Frame::HelloReject { reason: p.string()? },
            kind::LAUNCH => {
                let child_id = p.u32()?;
                let spec = CommandSpec::decode_payload(&mut p)?;
                Frame::Launch { child_id, spec }
            }
            kind::LAUNCHED => Frame::Launched {
                child_id: p.u32()?,
                pid: p.u32()?,
            },
            kind::FAILED => Frame::Failed {
                child_id: p.u32()?,
                reason: p.string()?,
                errno: p.i32()?,
            },
            kind::STDIN => Frame::Stdin {
                child_id: p.u32()?,
                data: p.bytes()?,
            },
            kind::STDOUT => Frame::Stdout {
                child_id: p.u32()?,
                data: p.bytes()?,
            },
            kind::STDERR => Frame::Stderr {
                child_id: p.u32()?,
                data: p.bytes()?,
            },
            kind::STDIN_CLOSE => Frame::StdinClose { child_id: p.u32()? },
            kind::KILL => Frame::Kill {
                child_id: p.u32()?,
                signal: p.i32()?,
            },
            kind::EXIT => Frame::Exit {
                child_id: p.u32()?,
                status: p.i32()?,
            },
            kind::PING => Frame::Ping,
            kind::PONG => Frame::Pong,
            other => return Err(WireError::UnknownKind(other)),
        };
        p.finish()?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Identity, IoMode};

    fn round_trip(frame: Frame) {
        let body = frame.encode();
        assert_eq!(Frame::decode(&body).unwrap(), frame);
    }

    #[test]
    fn control_frames_round_trip() {
        round_trip(Frame::Hello { cookie: vec![0xDE, 0xAD, 0xBE, 0xEF] });
        round_trip(Frame::HelloOk);
        round_trip(Frame::HelloReject { reason: "bad cookie".into() });
        round_trip(Frame::Ping);
        round_trip(Frame::Pong);
    }

    #[test]
    fn child_frames_round_trip() {
        round_trip(Frame::Launched { child_id: 3, pid: 4242 });
        round_trip(Frame::Failed {
            child_id: 3,
            reason: "exec failed".into(),
            errno: 2,
        });
        round_trip(Frame::Stdin { child_id: 1, data: b"input".to_vec() });
        round_trip(Frame::Stdout { child_id: 1, data: b"out".to_vec() });
        round_trip(Frame::Stderr { child_id: 1, data: Vec::new() });
        round_trip(Frame::StdinClose { child_id: 1 });
        round_trip(Frame::Kill { child_id: 9, signal: 15 });
        round_trip(Frame::Exit { child_id: 9, status: -9 });
    }

    #[test]
    fn launch_round_trips_with_full_descriptor() {
        let spec = CommandSpec::new("id")
            .arg("-u")
            .cwd("/tmp")
            .env("LC_ALL", "C")
            .io_mode(IoMode::Input)
            .identity(Identity::Uid(0))
            .merge_stderr(true);
        round_trip(Frame::Launch { child_id: 7, spec });
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(matches!(
            Frame::decode(&[0xEE]),
            Err(WireError::UnknownKind(0xEE))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut body = Frame::Pong.encode();
        body.push(0);
        assert!(matches!(
            Frame::decode(&body),
            Err(WireError::TrailingBytes)
        ));
    }
}
