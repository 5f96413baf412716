//! The wire unit used on every socket in this system: client TCP, worker
//! IPC, admin IPC and master IPC all speak the same framing.
//!
//! The exact wire format is an application concern (spec.md §1 calls it
//! "opaque"); `relayd-core` only depends on the [`Frame`] trait below.
//! [`BoxFrame`] is a concrete, length-prefixed binary implementation
//! provided as the default for demos and tests.

use std::convert::TryInto;

/// Result of trying to parse one frame off the front of a buffer.
pub enum Parsed<T> {
    /// Not enough bytes buffered yet; caller should read more and retry.
    NeedMore,
    /// One frame was parsed, consuming this many bytes from the front
    /// of the buffer.
    Complete(T, usize),
    /// The buffer contents could not be interpreted as a frame at all.
    /// The caller must discard the *entire* buffer, not just some prefix.
    Invalid,
}

/// The minimum properties the core depends on for any wire frame type.
///
/// `cmd` identifies which handler should process the frame; `ret` carries
/// a status code set on responses; `body` is the opaque payload.
pub trait Frame: Clone + Send + 'static {
    fn cmd(&self) -> i32;
    fn ret(&self) -> i32;
    fn body(&self) -> &[u8];

    /// Encode this frame to its wire representation.
    fn encode(&self) -> Vec<u8>;

    /// Re-pack with `ret` overridden, all other fields untouched.
    fn with_ret(&self, ret: i32) -> Self;

    /// Re-pack with `body` overridden, all other fields untouched.
    fn with_body(&self, body: Vec<u8>) -> Self;

    /// Parse one frame from the front of `buf`.
    fn parse(buf: &[u8]) -> Parsed<Self>
    where
        Self: Sized;
}

/// Builds a frame from scratch, for internal control messages (admin
/// replies forwarded between proxy and master) that have no prior frame
/// to re-pack with `with_ret`/`with_body`.
pub trait ControlFrame: Frame {
    fn control(cmd: i32, body: Vec<u8>) -> Self;
}

impl ControlFrame for BoxFrame {
    fn control(cmd: i32, body: Vec<u8>) -> Self {
        BoxFrame::new(cmd, 0, body)
    }
}

const HEADER_LEN: usize = 12;
const MAX_BODY_LEN: u32 = 64 * 1024 * 1024;

/// Default length-prefixed binary frame: `[cmd: i32][ret: i32][body_len: u32][body...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoxFrame {
    cmd: i32,
    ret: i32,
    body: Vec<u8>,
}

impl BoxFrame {
    pub fn new(cmd: i32, ret: i32, body: Vec<u8>) -> Self {
        BoxFrame { cmd, ret, body }
    }

    pub fn request(cmd: i32, body: Vec<u8>) -> Self {
        BoxFrame::new(cmd, 0, body)
    }
}

impl Frame for BoxFrame {
    fn cmd(&self) -> i32 {
        self.cmd
    }

    fn ret(&self) -> i32 {
        self.ret
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.body.len());
        buf.extend_from_slice(&self.cmd.to_be_bytes());
        buf.extend_from_slice(&self.ret.to_be_bytes());
        buf.extend_from_slice(&(self.body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    fn with_ret(&self, ret: i32) -> Self {
        BoxFrame {
            ret,
            ..self.clone()
        }
    }

    fn with_body(&self, body: Vec<u8>) -> Self {
        BoxFrame {
            body,
            ..self.clone()
        }
    }

    fn parse(buf: &[u8]) -> Parsed<Self> {
        if buf.len() < HEADER_LEN {
            return Parsed::NeedMore;
        }

        let cmd = i32::from_be_bytes(buf[0..4].try_into().unwrap());
        let ret = i32::from_be_bytes(buf[4..8].try_into().unwrap());
        let body_len = u32::from_be_bytes(buf[8..12].try_into().unwrap());

        if body_len > MAX_BODY_LEN {
            log::error!("frame body_len {body_len} exceeds max {MAX_BODY_LEN}; buffer invalid");
            return Parsed::Invalid;
        }

        let total = HEADER_LEN + body_len as usize;
        if buf.len() < total {
            return Parsed::NeedMore;
        }

        let body = buf[HEADER_LEN..total].to_vec();

        Parsed::Complete(BoxFrame::new(cmd, ret, body), total)
    }
}

/// Repeatedly parse frames out of a growing read buffer, matching
/// spec.md §3's `{need-more, consumed-N, invalid}` contract.
///
/// Returns the frames parsed this call. On `Invalid`, the entire buffer
/// is drained (the caller's buffer ends up empty) and parsing stops,
/// per spec.md §3: "invalid discards the entire buffer... no partial
/// recovery".
pub fn drain_frames<F: Frame>(buf: &mut Vec<u8>) -> Vec<F> {
    let mut out = Vec::new();

    loop {
        match F::parse(buf) {
            Parsed::NeedMore => break,
            Parsed::Complete(frame, consumed) => {
                buf.drain(0..consumed);
                out.push(frame);
            }
            Parsed::Invalid => {
                log::error!("buffer invalid; discarding {} buffered bytes", buf.len());
                buf.clear();
                break;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_pack_unpack() {
        let f = BoxFrame::new(1, 10, b"hello".to_vec());
        let bytes = f.encode();

        match BoxFrame::parse(&bytes) {
            Parsed::Complete(got, consumed) => {
                assert_eq!(consumed, bytes.len());
                assert_eq!(got, f);
            }
            _ => panic!("expected Complete"),
        }
    }

    #[test]
    fn repack_overrides_only_named_field() {
        let f = BoxFrame::new(1, 0, b"abc".to_vec());
        let with_ret = f.with_ret(99);
        assert_eq!(with_ret.cmd(), f.cmd());
        assert_eq!(with_ret.body(), f.body());
        assert_eq!(with_ret.ret(), 99);

        let with_body = f.with_body(b"xyz".to_vec());
        assert_eq!(with_body.cmd(), f.cmd());
        assert_eq!(with_body.ret(), f.ret());
        assert_eq!(with_body.body(), b"xyz");
    }

    #[test]
    fn need_more_on_short_buffer() {
        let f = BoxFrame::new(1, 0, b"hello world".to_vec());
        let bytes = f.encode();

        match BoxFrame::parse(&bytes[..HEADER_LEN + 2]) {
            Parsed::NeedMore => {}
            _ => panic!("expected NeedMore"),
        }
    }

    #[test]
    fn split_across_two_reads_is_reassembled() {
        let f = BoxFrame::new(2, 0, b"split-me".to_vec());
        let bytes = f.encode();
        let (first, second) = bytes.split_at(5);

        let mut buf = Vec::new();
        buf.extend_from_slice(first);
        assert!(drain_frames::<BoxFrame>(&mut buf).is_empty());

        buf.extend_from_slice(second);
        let frames = drain_frames::<BoxFrame>(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], f);
        assert!(buf.is_empty());
    }

    #[test]
    fn zero_bytes_produce_no_frame_and_no_state_change() {
        let mut buf: Vec<u8> = Vec::new();
        let frames = drain_frames::<BoxFrame>(&mut buf);
        assert!(frames.is_empty());
        assert!(buf.is_empty());
    }

    #[test]
    fn corrupt_buffer_discards_only_itself_and_continues() {
        let mut buf = vec![0xffu8; 4];
        buf.extend_from_slice(&u32::MAX.to_be_bytes()); // absurd body_len -> Invalid
        let frames = drain_frames::<BoxFrame>(&mut buf);
        assert!(frames.is_empty());
        assert!(buf.is_empty());

        // Parsing continues normally afterwards.
        let f = BoxFrame::new(3, 0, b"ok".to_vec());
        buf.extend_from_slice(&f.encode());
        let frames = drain_frames::<BoxFrame>(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], f);
    }
}
