//! Controller line protocol.
//!
//! Frames are ASCII lines of comma-separated fields terminated by `\n`
//! (a trailing `\r` is tolerated). [`LineFramer`] splits an arbitrary byte
//! stream into lines, dropping anything longer than [`MAX_LINE_LEN`] up to
//! the next newline so one corrupt frame never shifts the ones after it.

use bytes::{Buf, BytesMut};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Longest accepted line, terminator excluded.
pub const MAX_LINE_LEN: usize = 256;

/// Controller system state reported by `getState,<n>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Sleep,
    ForcedOn,
    AtDepth,
    PressureSwitchClosed,
    ForceOnRemoved,
    Shallow,
    PressureSwitchOpened,
    LowBattery,
    PcError,
}

impl SystemState {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => SystemState::Sleep,
            1 => SystemState::ForcedOn,
            2 => SystemState::AtDepth,
            3 => SystemState::PressureSwitchClosed,
            4 => SystemState::ForceOnRemoved,
            5 => SystemState::Shallow,
            6 => SystemState::PressureSwitchOpened,
            7 => SystemState::LowBattery,
            8 => SystemState::PcError,
            _ => return None,
        })
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// States from `ForceOnRemoved` upward ask the host to shut down.
    pub fn requests_shutdown(&self) -> bool {
        self.code() >= SystemState::ForceOnRemoved.code()
    }

    /// Whether this state means the platform is deployed and triggering may
    /// start. `ForcedOn` is download mode unless `forced_trigger` is set.
    pub fn starts_acquisition(&self, forced_trigger: bool) -> bool {
        match self {
            SystemState::AtDepth | SystemState::PressureSwitchClosed => true,
            SystemState::ForcedOn => forced_trigger,
            _ => false,
        }
    }
}

/// Line that could not be understood.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty line")]
    Empty,
    #[error("line is not valid ASCII")]
    NotAscii,
    #[error("bad state field '{0}'")]
    BadState(String),
    #[error("unknown frame '{0}'")]
    Unknown(String),
}

/// Frame received from the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    /// Hardware trigger pulse
    Trigger,
    /// Reply to `getState` or unsolicited state change
    State(SystemState),
    /// Explicit shutdown request
    Shutdown,
    /// Liveness only
    Heartbeat,
    /// Sensor sentence relayed by the controller, e.g. `$OHPR,...`
    Sensor { header: String, line: String },
}

impl InboundFrame {
    pub fn parse(raw: &[u8]) -> Result<Self, FrameError> {
        if !raw.is_ascii() {
            return Err(FrameError::NotAscii);
        }
        let line = std::str::from_utf8(raw)
            .map_err(|_| FrameError::NotAscii)?
            .trim();
        if line.is_empty() {
            return Err(FrameError::Empty);
        }

        let mut fields = line.split(',').map(str::trim);
        let head = fields.next().unwrap_or_default();
        match head {
            "trigger" => Ok(InboundFrame::Trigger),
            "shutdown" => Ok(InboundFrame::Shutdown),
            "heartbeat" => Ok(InboundFrame::Heartbeat),
            "getState" => {
                let field = fields.next().unwrap_or_default();
                field
                    .parse::<u8>()
                    .ok()
                    .and_then(SystemState::from_code)
                    .map(InboundFrame::State)
                    .ok_or_else(|| FrameError::BadState(field.to_string()))
            }
            h if h.starts_with('$') && h.len() > 1 => Ok(InboundFrame::Sensor {
                header: h.to_string(),
                line: line.to_string(),
            }),
            other => Err(FrameError::Unknown(other.to_string())),
        }
    }
}

/// Frame sent to the controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Strobe pre-fire delay and channel, sent once at setup
    StrobeConfigure { prefire_us: u32, channel: u32 },
    /// Host state: `true` ready, `false` shutting down
    PcState(bool),
    /// Ask for the current system state
    GetState,
    /// Ask the controller to sync the host clock
    NtpSync,
}

impl fmt::Display for OutboundFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboundFrame::StrobeConfigure {
                prefire_us,
                channel,
            } => write!(f, "strobe,{},{}", prefire_us, channel),
            OutboundFrame::PcState(ready) => write!(f, "setPCState,{}", u8::from(*ready)),
            OutboundFrame::GetState => f.write_str("getState"),
            OutboundFrame::NtpSync => f.write_str("ntpSync"),
        }
    }
}

impl OutboundFrame {
    /// Wire bytes including the terminator.
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

/// Splits a byte stream into bounded lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: BytesMut,
    discarding: bool,
    dropped: u64,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of overlong lines thrown away so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Next complete line without its terminator, if one is buffered.
    pub fn next_line(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    let mut line = self.buf.split_to(pos + 1);
                    line.truncate(pos);
                    if line.last() == Some(&b'\r') {
                        line.truncate(pos - 1);
                    }
                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }
                    if line.len() > MAX_LINE_LEN {
                        self.dropped += 1;
                        continue;
                    }
                    return Some(line.to_vec());
                }
                None => {
                    if self.buf.len() > MAX_LINE_LEN {
                        if !self.discarding {
                            self.dropped += 1;
                        }
                        self.discarding = true;
                        self.buf.advance(self.buf.len());
                    }
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inbound_frames() {
        assert_eq!(InboundFrame::parse(b"trigger"), Ok(InboundFrame::Trigger));
        assert_eq!(InboundFrame::parse(b"trigger,123"), Ok(InboundFrame::Trigger));
        assert_eq!(
            InboundFrame::parse(b"getState,2"),
            Ok(InboundFrame::State(SystemState::AtDepth))
        );
        assert_eq!(InboundFrame::parse(b"shutdown\r"), Ok(InboundFrame::Shutdown));
        assert_eq!(
            InboundFrame::parse(b"$OHPR,1.0,2.0"),
            Ok(InboundFrame::Sensor {
                header: "$OHPR".into(),
                line: "$OHPR,1.0,2.0".into()
            })
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(InboundFrame::parse(b""), Err(FrameError::Empty));
        assert_eq!(InboundFrame::parse(&[0xff, 0x00]), Err(FrameError::NotAscii));
        assert!(matches!(InboundFrame::parse(b"getState,x"), Err(FrameError::BadState(_))));
        assert!(matches!(InboundFrame::parse(b"getState,9"), Err(FrameError::BadState(_))));
        assert!(matches!(InboundFrame::parse(b"bogus"), Err(FrameError::Unknown(_))));
    }

    #[test]
    fn test_shutdown_states() {
        assert!(!SystemState::AtDepth.requests_shutdown());
        assert!(!SystemState::PressureSwitchClosed.requests_shutdown());
        assert!(SystemState::ForceOnRemoved.requests_shutdown());
        assert!(SystemState::LowBattery.requests_shutdown());
        assert_eq!(SystemState::PcError.code(), 8);
    }

    #[test]
    fn test_deployment_states_start_acquisition() {
        assert!(SystemState::AtDepth.starts_acquisition(false));
        assert!(SystemState::PressureSwitchClosed.starts_acquisition(false));
        assert!(!SystemState::ForcedOn.starts_acquisition(false));
        assert!(SystemState::ForcedOn.starts_acquisition(true));
        assert!(!SystemState::Sleep.starts_acquisition(true));
        assert!(!SystemState::Shallow.starts_acquisition(true));
    }

    #[test]
    fn test_outbound_serialization() {
        let strobe = OutboundFrame::StrobeConfigure {
            prefire_us: 150,
            channel: 1,
        };
        assert_eq!(strobe.to_line(), "strobe,150,1\n");
        assert_eq!(OutboundFrame::PcState(true).to_line(), "setPCState,1\n");
        assert_eq!(OutboundFrame::PcState(false).to_line(), "setPCState,0\n");
        assert_eq!(OutboundFrame::GetState.to_line(), "getState\n");
    }

    #[test]
    fn test_framer_splits_partial_input() {
        let mut framer = LineFramer::new();
        framer.extend(b"trig");
        assert_eq!(framer.next_line(), None);
        framer.extend(b"ger\r\nheart");
        assert_eq!(framer.next_line(), Some(b"trigger".to_vec()));
        assert_eq!(framer.next_line(), None);
        framer.extend(b"beat\n");
        assert_eq!(framer.next_line(), Some(b"heartbeat".to_vec()));
    }

    #[test]
    fn test_framer_resyncs_after_overlong_line() {
        let mut framer = LineFramer::new();
        framer.extend(&vec![b'x'; MAX_LINE_LEN + 10]);
        assert_eq!(framer.next_line(), None);
        framer.extend(b"yyyy\ntrigger\n");
        assert_eq!(framer.next_line(), Some(b"trigger".to_vec()));
        assert_eq!(framer.dropped(), 1);

        // Overlong line arriving in one piece with its terminator
        let mut long = vec![b'z'; MAX_LINE_LEN + 1];
        long.extend_from_slice(b"\nshutdown\n");
        framer.extend(&long);
        assert_eq!(framer.next_line(), Some(b"shutdown".to_vec()));
        assert_eq!(framer.dropped(), 2);
    }
}
