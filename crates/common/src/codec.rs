//! Serial framing for the face-recognition module.
//!
//! Outbound commands are `$CMD,<NAME>[,<ARG>...]#`. Inbound traffic is either
//! an event `$<len>,<type>,<field>...#` or a reply `$RSP,<len>,<status>,<data>...#`,
//! where `<len>` counts every byte of the frame including `$` and `#`.

use tracing::{trace, warn};

use crate::error::FrameError;
use crate::protocol::{BoundingBox, Command, RecognitionEvent, SensorMessage};

const START: u8 = b'$';
const END: u8 = b'#';

/// Longest unterminated frame kept in the buffer.
pub const MAX_FRAME_LEN: usize = 256;

/// Byte-buffering frame scanner. One instance per connection.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buf: Vec<u8>,
    frame_errors: u64,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode(command: &Command) -> Vec<u8> {
        let frame = match command {
            Command::Start(feature) => format!("$CMD,{},{}#", command.name(), feature.code()),
            Command::RegisterFace(user) | Command::DeleteUser(user) => {
                format!("$CMD,{},{}#", command.name(), user)
            }
            _ => format!("$CMD,{}#", command.name()),
        };
        frame.into_bytes()
    }

    /// Buffers `bytes` and returns an iterator over every complete frame now
    /// available. Malformed frames are logged and skipped. A trailing partial
    /// frame stays buffered for the next call.
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.buf.extend_from_slice(bytes);
        Frames { codec: self }
    }

    /// Drops any buffered partial frame, e.g. when a connection is replaced.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn frame_errors(&self) -> u64 {
        self.frame_errors
    }

    fn next_frame(&mut self) -> Option<Result<SensorMessage, FrameError>> {
        let Some(start) = self.buf.iter().position(|&b| b == START) else {
            if !self.buf.is_empty() {
                trace!(bytes = self.buf.len(), "discarding noise outside frames");
                self.buf.clear();
            }
            return None;
        };
        if start > 0 {
            trace!(bytes = start, "discarding noise before frame");
            self.buf.drain(..start);
        }

        let boundary = self
            .buf
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, &b)| b == END || b == START)
            .map(|(i, &b)| (i, b));

        match boundary {
            Some((i, END)) => {
                let frame: Vec<u8> = self.buf.drain(..=i).collect();
                Some(decode_frame(&frame))
            }
            Some((i, _)) => {
                self.buf.drain(..i);
                Some(Err(FrameError::Truncated))
            }
            None if self.buf.len() > MAX_FRAME_LEN => {
                self.buf.clear();
                Some(Err(FrameError::Oversize(MAX_FRAME_LEN)))
            }
            None => None,
        }
    }
}

/// Lazy sequence of messages produced by [`FrameCodec::feed`].
pub struct Frames<'a> {
    codec: &'a mut FrameCodec,
}

impl Iterator for Frames<'_> {
    type Item = SensorMessage;

    fn next(&mut self) -> Option<SensorMessage> {
        loop {
            match self.codec.next_frame()? {
                Ok(message) => return Some(message),
                Err(err) => {
                    self.codec.frame_errors += 1;
                    warn!(error = %err, protocol_violation = err.is_protocol_violation(), "dropping malformed frame");
                }
            }
        }
    }
}

/// Builds an inbound event frame with a correct length field,
/// e.g. `frame_event("06", &["1", "2", "3", "4"])`.
pub fn frame_event(type_code: &str, fields: &[&str]) -> String {
    let mut rest = type_code.to_string();
    for field in fields {
        rest.push(',');
        rest.push_str(field);
    }
    with_length("", &rest)
}

/// Builds a `$RSP` reply frame with a correct length field.
pub fn frame_reply(status: &str, data: &[&str]) -> String {
    let mut rest = status.to_string();
    for field in data {
        rest.push(',');
        rest.push_str(field);
    }
    with_length("RSP,", &rest)
}

fn with_length(prefix: &str, rest: &str) -> String {
    let mut len = prefix.len() + rest.len() + 4;
    loop {
        let frame = format!("${prefix}{len},{rest}#");
        if frame.len() == len {
            return frame;
        }
        len = frame.len();
    }
}

fn decode_frame(frame: &[u8]) -> Result<SensorMessage, FrameError> {
    let text = std::str::from_utf8(frame).map_err(|_| FrameError::Encoding)?;
    let body = &text[1..text.len() - 1];
    let parts: Vec<&str> = body.split(',').collect();

    if parts[0] == "RSP" {
        decode_reply(&parts, text.len())
    } else {
        decode_event(&parts, text.len())
    }
}

fn check_length(declared: &str, actual: usize) -> Result<(), FrameError> {
    let declared = parse_int("length", declared)?;
    if declared != actual as i64 {
        return Err(FrameError::LengthMismatch {
            declared: declared.max(0) as usize,
            actual,
        });
    }
    Ok(())
}

fn require(parts: &[&str], expected: usize) -> Result<(), FrameError> {
    if parts.len() < expected {
        return Err(FrameError::MissingFields {
            expected,
            got: parts.len(),
        });
    }
    Ok(())
}

fn decode_reply(parts: &[&str], actual_len: usize) -> Result<SensorMessage, FrameError> {
    require(parts, 3)?;
    check_length(parts[1], actual_len)?;

    let data: Vec<String> = parts[3..].iter().map(|s| s.to_string()).collect();
    match parts[2].to_ascii_uppercase().as_str() {
        "OK" => Ok(SensorMessage::Ack { data }),
        "PONG" => Ok(SensorMessage::Pong { info: data }),
        "ERR" => {
            let message = if data.is_empty() {
                "unspecified error".to_string()
            } else {
                data.join(",")
            };
            Ok(SensorMessage::Error { message })
        }
        other => Err(FrameError::UnknownType(other.to_string())),
    }
}

fn decode_event(parts: &[&str], actual_len: usize) -> Result<SensorMessage, FrameError> {
    require(parts, 2)?;
    check_length(parts[0], actual_len)?;

    let code = parts[1]
        .trim()
        .parse::<u8>()
        .map_err(|_| FrameError::UnknownType(parts[1].to_string()))?;

    match code {
        6 => {
            require(parts, 6)?;
            Ok(SensorMessage::Detection(parse_bbox(&parts[2..6])?))
        }
        8 => {
            require(parts, 8)?;
            let bbox = parse_bbox(&parts[2..6])?;
            let label = parts[6].trim();
            if label.is_empty() {
                return Err(FrameError::EmptyLabel);
            }
            let score = parse_int("score", parts[7])?;
            if !(0..=100).contains(&score) {
                return Err(FrameError::OutOfRange {
                    field: "score",
                    value: score,
                });
            }
            Ok(SensorMessage::Recognition(RecognitionEvent {
                bbox,
                label: label.to_string(),
                score: score as u8,
            }))
        }
        10 => {
            require(parts, 4)?;
            let mode = parse_int("mode", parts[2])?;
            let mode = u8::try_from(mode).map_err(|_| FrameError::OutOfRange {
                field: "mode",
                value: mode,
            })?;
            Ok(SensorMessage::StatusReply {
                mode,
                detail: parts[3..].join(","),
            })
        }
        11 => {
            require(parts, 5)?;
            let saved = match parse_int("flag", parts[2])? {
                1 => true,
                0 => false,
                value => {
                    return Err(FrameError::OutOfRange {
                        field: "flag",
                        value,
                    })
                }
            };
            Ok(SensorMessage::Registration {
                user: parts[3].trim().to_string(),
                saved,
                detail: parts[4..].join(","),
            })
        }
        99 => {
            require(parts, 4)?;
            Ok(SensorMessage::Fault {
                code: parse_int("code", parts[2])?,
                message: parts[3..].join(","),
            })
        }
        _ => Err(FrameError::UnknownType(parts[1].to_string())),
    }
}

fn parse_int(field: &'static str, value: &str) -> Result<i64, FrameError> {
    value.trim().parse::<i64>().map_err(|_| FrameError::BadInteger {
        field,
        value: value.to_string(),
    })
}

fn parse_bbox(fields: &[&str]) -> Result<BoundingBox, FrameError> {
    const NAMES: [&str; 4] = ["x", "y", "w", "h"];
    let mut values = [0u32; 4];
    for (i, raw) in fields.iter().enumerate() {
        let value = parse_int(NAMES[i], raw)?;
        values[i] = u32::try_from(value).map_err(|_| FrameError::OutOfRange {
            field: NAMES[i],
            value,
        })?;
    }
    Ok(BoundingBox {
        x: values[0],
        y: values[1],
        w: values[2],
        h: values[3],
    })
}
