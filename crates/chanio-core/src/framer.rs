//! The framer collaborator hook. The core only hands raw byte spans to
//! whatever is installed here; no concrete framer (line, length-prefixed,
//! delimited) ships in this workspace.

use bytes::Bytes;

/// Re-segments raw byte spans into application messages. `feed` may
/// produce zero or more complete messages per call; partial messages are
/// buffered internally by the implementation until framing completes.
pub trait Framer: Send {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Bytes>;
    fn reset(&mut self);
}

/// The default when no framer is installed: every read is one message.
#[derive(Debug, Default)]
pub struct RawPassthrough;

impl Framer for RawPassthrough {
    fn feed(&mut self, bytes: &[u8]) -> Vec<Bytes> {
        vec![Bytes::copy_from_slice(bytes)]
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_passthrough_yields_one_message_per_feed() {
        let mut framer = RawPassthrough;
        let out = framer.feed(b"hello");
        assert_eq!(out, vec![Bytes::from_static(b"hello")]);
    }

    /// A trivial test-only framer exercising the trait's "0..N messages"
    /// contract: splits on `\n`, buffering the remainder.
    struct LineFramer {
        buf: Vec<u8>,
    }

    impl Framer for LineFramer {
        fn feed(&mut self, bytes: &[u8]) -> Vec<Bytes> {
            self.buf.extend_from_slice(bytes);
            let mut out = Vec::new();
            while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                out.push(Bytes::copy_from_slice(&line[..line.len() - 1]));
            }
            out
        }

        fn reset(&mut self) {
            self.buf.clear();
        }
    }

    #[test]
    fn line_framer_can_yield_zero_one_or_many_messages() {
        let mut framer = LineFramer { buf: Vec::new() };
        assert_eq!(framer.feed(b"partial"), Vec::<Bytes>::new());
        assert_eq!(framer.feed(b" line\n"), vec![Bytes::from_static(b"partial line")]);
        assert_eq!(
            framer.feed(b"a\nb\nc"),
            vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]
        );
        framer.reset();
        assert_eq!(framer.feed(b"\n"), vec![Bytes::from_static(b"")]);
    }
}
