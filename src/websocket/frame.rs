//! RFC 6455 frame primitives.
//!
//! # Responsibilities
//! - Opcodes and close codes
//! - Encode frame headers and whole single-fragment frames
//! - Mask and unmask payloads

/// Largest payload we will put in one outgoing frame.
pub const MAX_FRAME_PAYLOAD: u64 = 0x7fff_ffff;

/// Control frames carry at most this much payload.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpCode::Continuation => "continuation",
            OpCode::Text => "text",
            OpCode::Binary => "binary",
            OpCode::Close => "close",
            OpCode::Ping => "ping",
            OpCode::Pong => "pong",
        }
    }
}

/// Close status codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const RESERVED: u16 = 1004;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const INCONSISTENT_DATA: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const MISSING_EXTENSION: u16 = 1010;
    pub const UNEXPECTED_ERROR: u16 = 1011;
    pub const TLS_HANDSHAKE: u16 = 1015;

    pub fn name(code: u16) -> &'static str {
        match code {
            NORMAL => "Normal",
            GOING_AWAY => "GoingAway",
            PROTOCOL_ERROR => "ProtocolError",
            UNSUPPORTED_DATA => "UnsupportedDataType",
            RESERVED => "Reserved1004",
            NO_STATUS => "StatusCodeNotPresent",
            ABNORMAL => "AbnormalClose",
            INCONSISTENT_DATA => "InconsistentData",
            POLICY_VIOLATION => "PolicyViolation",
            MESSAGE_TOO_BIG => "MessageTooBig",
            MISSING_EXTENSION => "MissingExtension",
            UNEXPECTED_ERROR => "UnexpectedError",
            TLS_HANDSHAKE => "TLSHandshakeError",
            3000..=4999 => "Extension",
            _ => "Unknown",
        }
    }

    /// Whether a peer may send `code` in a close frame.
    ///
    /// Codes reserved for local use (1004, 1005, 1006, 1015) and unassigned
    /// codes are refused unless they fall in the 3000-4999 range.
    pub fn is_acceptable(code: u16) -> bool {
        matches!(
            code,
            NORMAL
                | GOING_AWAY
                | PROTOCOL_ERROR
                | UNSUPPORTED_DATA
                | INCONSISTENT_DATA
                | POLICY_VIOLATION
                | MESSAGE_TOO_BIG
                | MISSING_EXTENSION
                | UNEXPECTED_ERROR
                | 3000..=4999
        )
    }
}

/// Encode a frame header.
pub fn encode_header(opcode: OpCode, fin: bool, len: u64, mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut header = Vec::with_capacity(14);
    header.push(if fin { 0x80 } else { 0 } | opcode.as_u8());

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    if len < 126 {
        header.push(mask_bit | len as u8);
    } else if len <= u16::MAX as u64 {
        header.push(mask_bit | 126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(mask_bit | 127);
        header.extend_from_slice(&len.to_be_bytes());
    }

    if let Some(mask) = mask {
        header.extend_from_slice(&mask);
    }
    header
}

/// Encode a complete, final frame.
pub fn encode_frame(opcode: OpCode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut frame = encode_header(opcode, true, payload.len() as u64, mask);
    let start = frame.len();
    frame.extend_from_slice(payload);
    if let Some(mask) = mask {
        apply_mask(&mut frame[start..], mask, 0);
    }
    frame
}

/// XOR `data` with `mask`, starting at byte `offset` of the payload.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4], offset: usize) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[(offset + i) % 4];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_length_forms() {
        assert_eq!(encode_header(OpCode::Text, true, 5, None), vec![0x81, 5]);
        assert_eq!(encode_header(OpCode::Binary, true, 126, None), vec![0x82, 126, 0, 126]);
        assert_eq!(encode_header(OpCode::Binary, false, 65536, None)[..2], [0x02, 127]);
        assert_eq!(encode_header(OpCode::Ping, true, 0, Some([1, 2, 3, 4])), vec![0x89, 0x80, 1, 2, 3, 4]);
    }

    #[test]
    fn masking_is_an_involution() {
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let frame = encode_frame(OpCode::Text, b"Hello", Some(mask));
        assert_eq!(frame, vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]);

        let mut payload = frame[6..].to_vec();
        apply_mask(&mut payload, mask, 0);
        assert_eq!(payload, b"Hello");
    }

    #[test]
    fn close_code_acceptance() {
        for code in [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 4999] {
            assert!(close_code::is_acceptable(code), "{code}");
        }
        for code in [0, 999, 1004, 1005, 1006, 1012, 1015, 2999, 5000] {
            assert!(!close_code::is_acceptable(code), "{code}");
        }
    }
}
