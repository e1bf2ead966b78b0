//! WebSocket protocol state machine.
//!
//! # Responsibilities
//! - Decode frames incrementally from a byte buffer
//! - Validate frames and reassemble fragmented messages
//! - Answer pings and run the close handshake
//! - Queue outgoing frames
//!
//! # Design Decisions
//! - No I/O: the engine feeds bytes in and drains frames out
//! - A protocol violation fails the connection: one close frame is queued
//!   and nothing further is read or delivered
//! - Outgoing messages are always a single final frame

use std::collections::VecDeque;

use super::frame::{apply_mask, close_code, encode_frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_FRAME_PAYLOAD};
use crate::observability::metrics;

/// Which end of the connection we are. Clients mask, servers do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// A complete application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SendError {
    #[error("Connection is closing")]
    Closing,
    #[error("Payload of {0} bytes is too large")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Header,
    Length16,
    Length64,
    Mask,
    Payload,
}

#[derive(Debug)]
pub struct WebSocketProtocol {
    role: Role,
    max_payload: u64,
    state: ReadState,

    // Frame being read.
    fin: bool,
    opcode: OpCode,
    masked: bool,
    mask: [u8; 4],
    length: u64,
    payload: Vec<u8>,

    // Partial fragmented message.
    fragment: Option<(OpCode, Vec<u8>)>,

    close_sent: bool,
    close_received: bool,
    failed: bool,
    close_code: Option<u16>,
    outbound: VecDeque<Vec<u8>>,
}

impl WebSocketProtocol {
    pub fn new(role: Role, max_payload: u64) -> Self {
        Self {
            role,
            max_payload,
            state: ReadState::Header,
            fin: false,
            opcode: OpCode::Continuation,
            masked: false,
            mask: [0; 4],
            length: 0,
            payload: Vec::new(),
            fragment: None,
            close_sent: false,
            close_received: false,
            failed: false,
            close_code: None,
            outbound: VecDeque::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    pub fn close_received(&self) -> bool {
        self.close_received
    }

    /// True once the connection was failed for a protocol violation.
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// The code of the close frame we sent, if any.
    pub fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    /// Nothing more will be read; the socket can be shut down once flushed.
    pub fn is_finished(&self) -> bool {
        self.failed || (self.close_sent && self.close_received)
    }

    /// Payload length of the frame currently being read.
    pub fn frame_length(&self) -> u64 {
        self.length
    }

    /// Consume bytes from `input`, returning every message they complete.
    pub fn receive(&mut self, input: &mut Vec<u8>) -> Vec<Message> {
        let mut messages = Vec::new();
        let mut pos = 0;

        while !self.close_received && !self.failed {
            let available = &input[pos..];
            match self.state {
                ReadState::Header => {
                    if available.len() < 2 {
                        break;
                    }
                    let (b0, b1) = (available[0], available[1]);
                    pos += 2;
                    if !self.read_header(b0, b1) {
                        break;
                    }
                }
                ReadState::Length16 => {
                    if available.len() < 2 {
                        break;
                    }
                    self.length = u16::from_be_bytes([available[0], available[1]]) as u64;
                    pos += 2;
                    if !self.check_length() {
                        break;
                    }
                }
                ReadState::Length64 => {
                    if available.len() < 8 {
                        break;
                    }
                    let mut bytes = [0u8; 8];
                    bytes.copy_from_slice(&available[..8]);
                    self.length = u64::from_be_bytes(bytes) & !(1 << 63);
                    pos += 8;
                    if !self.check_length() {
                        break;
                    }
                }
                ReadState::Mask => {
                    if available.len() < 4 {
                        break;
                    }
                    self.mask.copy_from_slice(&available[..4]);
                    pos += 4;
                    self.state = ReadState::Payload;
                }
                ReadState::Payload => {
                    let remaining = (self.length - self.payload.len() as u64) as usize;
                    let take = remaining.min(available.len());
                    self.payload.extend_from_slice(&available[..take]);
                    pos += take;
                    if (self.payload.len() as u64) < self.length {
                        break;
                    }
                    if let Some(message) = self.finish_frame() {
                        messages.push(message);
                    }
                }
            }
        }

        if self.close_received || self.failed {
            input.clear();
        } else {
            input.drain(..pos);
        }
        messages
    }

    /// Queue a single-frame message.
    pub fn send(&mut self, opcode: OpCode, payload: &[u8]) -> Result<(), SendError> {
        if self.close_sent || self.close_received {
            return Err(SendError::Closing);
        }
        if payload.len() as u64 > MAX_FRAME_PAYLOAD || (opcode.is_control() && payload.len() > MAX_CONTROL_PAYLOAD) {
            return Err(SendError::TooLarge(payload.len()));
        }
        self.queue(opcode, payload);
        Ok(())
    }

    pub fn send_text(&mut self, text: &str) -> Result<(), SendError> {
        self.send(OpCode::Text, text.as_bytes())
    }

    /// Start a graceful close. Does nothing if a close was already sent.
    pub fn initiate_close(&mut self, code: u16, reason: &str) {
        if self.close_sent {
            return;
        }
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(truncate_utf8(reason, MAX_CONTROL_PAYLOAD - 2).as_bytes());
        self.queue(OpCode::Close, &payload);
        self.close_sent = true;
        self.close_code = Some(code);
        metrics::record_close(code);
        tracing::debug!(code, name = close_code::name(code), reason = %reason, "Sent close");
    }

    /// Take every queued outgoing frame.
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        self.outbound.drain(..).collect()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    fn read_header(&mut self, b0: u8, b1: u8) -> bool {
        self.fin = b0 & 0x80 != 0;
        let reserved = b0 & 0x70;
        let raw_opcode = b0 & 0x0f;
        self.masked = b1 & 0x80 != 0;
        self.length = (b1 & 0x7f) as u64;
        self.payload.clear();

        if reserved != 0 {
            return self.fail(close_code::PROTOCOL_ERROR, "Reserved bits set");
        }
        if raw_opcode & 0x8 != 0 && self.length > MAX_CONTROL_PAYLOAD as u64 {
            return self.fail(close_code::PROTOCOL_ERROR, "Control frame payload too large");
        }
        let expect_masked = self.role == Role::Server;
        if self.masked != expect_masked {
            return self.fail(
                close_code::PROTOCOL_ERROR,
                if expect_masked { "Unmasked frame from client" } else { "Masked frame from server" },
            );
        }
        let Some(opcode) = OpCode::from_u8(raw_opcode) else {
            return self.fail(close_code::PROTOCOL_ERROR, "Unknown opcode");
        };
        if opcode.is_control() && !self.fin {
            return self.fail(close_code::PROTOCOL_ERROR, "Fragmented control frame");
        }
        if opcode == OpCode::Continuation && self.fragment.is_none() {
            return self.fail(close_code::PROTOCOL_ERROR, "Continuation without a fragmented message");
        }
        if matches!(opcode, OpCode::Text | OpCode::Binary) && self.fragment.is_some() {
            return self.fail(close_code::PROTOCOL_ERROR, "New message while a fragmented message is open");
        }
        self.opcode = opcode;

        match self.length {
            126 => self.state = ReadState::Length16,
            127 => self.state = ReadState::Length64,
            _ => return self.check_length(),
        }
        true
    }

    /// Enforce the message size cap, then move on to the mask or payload.
    fn check_length(&mut self) -> bool {
        let buffered = self.fragment.as_ref().map(|(_, data)| data.len() as u64).unwrap_or(0);
        if buffered + self.length > self.max_payload {
            return self.fail(close_code::MESSAGE_TOO_BIG, "Message too big");
        }
        self.payload.reserve(self.length.min(64 * 1024) as usize);
        self.state = if self.masked { ReadState::Mask } else { ReadState::Payload };
        true
    }

    fn finish_frame(&mut self) -> Option<Message> {
        self.state = ReadState::Header;
        let mut payload = std::mem::take(&mut self.payload);
        if self.masked {
            apply_mask(&mut payload, self.mask, 0);
        }
        metrics::record_frame("in", self.opcode.as_str());

        match self.opcode {
            OpCode::Ping => {
                if !self.close_sent {
                    self.queue(OpCode::Pong, &payload);
                }
                None
            }
            OpCode::Pong => {
                tracing::trace!(len = payload.len(), "Pong received");
                None
            }
            OpCode::Close => {
                self.handle_close(&payload);
                None
            }
            OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                let (opcode, data) = match self.fragment.take() {
                    Some((opcode, mut data)) => {
                        data.extend_from_slice(&payload);
                        (opcode, data)
                    }
                    None => (self.opcode, payload),
                };
                if !self.fin {
                    self.fragment = Some((opcode, data));
                    return None;
                }
                // Data arriving after our close frame is discarded.
                if self.close_sent {
                    return None;
                }
                match opcode {
                    OpCode::Text => match String::from_utf8(data) {
                        Ok(text) => Some(Message::Text(text)),
                        Err(_) => {
                            self.fail(close_code::INCONSISTENT_DATA, "Invalid UTF-8 text");
                            None
                        }
                    },
                    _ => Some(Message::Binary(data)),
                }
            }
        }
    }

    fn handle_close(&mut self, payload: &[u8]) {
        self.close_received = true;

        let mut replacement = None;
        let code = match payload.len() {
            0 => None,
            1 => {
                replacement = Some(close_code::PROTOCOL_ERROR);
                None
            }
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !close_code::is_acceptable(code) {
                    replacement = Some(close_code::PROTOCOL_ERROR);
                } else if std::str::from_utf8(&payload[2..]).is_err() {
                    replacement = Some(close_code::INCONSISTENT_DATA);
                }
                Some(code)
            }
        };

        tracing::debug!(
            code = code.unwrap_or(close_code::NO_STATUS),
            name = close_code::name(code.unwrap_or(close_code::NO_STATUS)),
            "Received close"
        );

        if self.close_sent {
            return;
        }
        let reply = match (replacement, code) {
            (Some(replacement), _) => replacement.to_be_bytes().to_vec(),
            (None, None) => close_code::NORMAL.to_be_bytes().to_vec(),
            (None, Some(_)) => payload.to_vec(),
        };
        let reply_code = u16::from_be_bytes([reply[0], reply[1]]);
        self.queue(OpCode::Close, &reply);
        self.close_sent = true;
        self.close_code = Some(reply_code);
        metrics::record_close(reply_code);
    }

    /// Fail the connection. Always returns false so callers can `return self.fail(..)`.
    fn fail(&mut self, code: u16, reason: &str) -> bool {
        tracing::warn!(code, name = close_code::name(code), reason = %reason, "WebSocket protocol error");
        self.initiate_close(code, reason);
        self.failed = true;
        false
    }

    fn queue(&mut self, opcode: OpCode, payload: &[u8]) {
        let mask = match self.role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        };
        metrics::record_frame("out", opcode.as_str());
        self.outbound.push_back(encode_frame(opcode, payload, mask));
    }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
