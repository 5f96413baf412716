//! Small framing helper shared by the proxy's connection handlers and
//! the worker's single connection to its group's IPC endpoint.

use relayd_protocol::{Frame, Parsed};
use std::io::{Read, Write};
use std::time::Duration;

/// Anything a connection handler can read from and write to: a plain
/// `TcpStream` or `UnixStream`, type-erased so the proxy can treat
/// client/worker/admin/master connections uniformly.
pub trait Duplex: Read + Write + Send {
    fn try_clone_box(&self) -> std::io::Result<Box<dyn Duplex>>;

    /// `None` blocks forever; `Some(d)` makes a read that receives
    /// nothing within `d` return a timeout error (used for the client
    /// idle timeout, spec.md §4.2).
    fn set_read_timeout(&self, dur: Option<Duration>) -> std::io::Result<()>;
}

impl Duplex for std::net::TcpStream {
    fn try_clone_box(&self) -> std::io::Result<Box<dyn Duplex>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> std::io::Result<()> {
        std::net::TcpStream::set_read_timeout(self, dur)
    }
}

impl Duplex for std::os::unix::net::UnixStream {
    fn try_clone_box(&self) -> std::io::Result<Box<dyn Duplex>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> std::io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, dur)
    }
}

/// `true` for the timeout/would-block errors a blocking read produces
/// when a read deadline set via `set_read_timeout` elapses.
pub fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Reads frames one at a time off a stream, per spec.md §3: parsing
/// repeats `need-more`/`consumed-N`/`invalid` over a growing buffer that
/// never assumes message boundaries align with reads.
pub struct FrameReader<S> {
    stream: S,
    buf: Vec<u8>,
}

impl<S: Read> FrameReader<S> {
    pub fn new(stream: S) -> Self {
        FrameReader {
            stream,
            buf: Vec::new(),
        }
    }

    /// Blocks until one frame is available, the peer disconnects
    /// (`Ok(None)`), or an I/O error / read timeout occurs.
    pub fn next_frame<F: Frame>(&mut self) -> std::io::Result<Option<F>> {
        loop {
            match F::parse(&self.buf) {
                Parsed::Complete(frame, consumed) => {
                    self.buf.drain(0..consumed);
                    return Ok(Some(frame));
                }
                Parsed::Invalid => {
                    log::error!(
                        "discarding {} buffered bytes after invalid frame",
                        self.buf.len()
                    );
                    self.buf.clear();
                }
                Parsed::NeedMore => {}
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Write one frame, returning the same `io::Error`s a caller would get
/// from writing raw bytes.
pub fn write_frame<F: Frame, W: Write>(stream: &mut W, frame: &F) -> std::io::Result<()> {
    stream.write_all(&frame.encode())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayd_protocol::BoxFrame;
    use std::io::Cursor;

    #[test]
    fn reads_frame_split_across_chunks() {
        let f = BoxFrame::new(1, 0, b"payload".to_vec());
        let bytes = f.encode();

        // Cursor reads whatever is available per call; simulate a slow
        // peer by wrapping a reader that dribbles bytes out.
        struct Dribble {
            data: Vec<u8>,
            pos: usize,
        }
        impl Read for Dribble {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.pos >= self.data.len() {
                    return Ok(0);
                }
                let n = 1.min(buf.len()).min(self.data.len() - self.pos);
                buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
                self.pos += n;
                Ok(n)
            }
        }

        let mut reader = FrameReader::new(Dribble {
            data: bytes,
            pos: 0,
        });
        let got: BoxFrame = reader.next_frame().unwrap().unwrap();
        assert_eq!(got, f);
    }

    #[test]
    fn eof_returns_none() {
        let mut reader: FrameReader<Cursor<Vec<u8>>> = FrameReader::new(Cursor::new(Vec::new()));
        let got: Option<BoxFrame> = reader.next_frame().unwrap();
        assert!(got.is_none());
    }
}
