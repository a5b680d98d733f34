//! Line protocol spoken by the render engine on stdout.
//!
//! Status lines look like `#KEY!value`. Anything not starting with `#` is
//! ordinary engine chatter. Malformed or unknown status lines are dropped
//! without ending the stream.

use bytes::{Buf, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

const MARKER: char = '#';
const SEPARATOR: char = '!';
const READ_CHUNK: usize = 4096;
/// Longest unterminated fragment kept while waiting for its newline.
pub const MAX_LINE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatusLine {
    IndirectProgress(f64),
    DirectProgress(f64),
    Finish,
}

/// Decode one line. `None` for chatter, malformed lines and unknown keys.
pub fn parse_line(line: &str) -> Option<StatusLine> {
    let payload = line.strip_prefix(MARKER)?;
    let mut fields = payload.split(SEPARATOR);
    let (key, value) = match (fields.next(), fields.next(), fields.next()) {
        (Some(key), Some(value), None) => (key, value),
        _ => return None,
    };
    match key {
        "DIRECTPROGRESS" => parse_ratio(value).map(StatusLine::DirectProgress),
        "INDPROGRESS" => parse_ratio(value).map(StatusLine::IndirectProgress),
        "FINISH" => Some(StatusLine::Finish),
        _ => None,
    }
}

fn parse_ratio(value: &str) -> Option<f64> {
    match value.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Some(v),
        _ => {
            tracing::debug!(value, "dropping malformed progress value");
            None
        }
    }
}

/// Splits a byte stream into lines, holding back an unterminated tail.
///
/// A fragment longer than [`MAX_LINE`] is discarded up to and including its
/// newline; status lines are short, so anything that long is chatter.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: BytesMut,
    // Bytes of `buf` already known to hold no newline.
    scanned: usize,
    discarding: bool,
}

impl LineFramer {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let found = self.buf[self.scanned..].iter().position(|&b| b == b'\n');
            let Some(offset) = found else {
                self.scanned = self.buf.len();
                if self.buf.len() > MAX_LINE {
                    tracing::debug!(len = self.buf.len(), "dropping oversized engine output line");
                    self.buf.clear();
                    self.scanned = 0;
                    self.discarding = true;
                }
                return None;
            };
            let line = self.buf.split_to(self.scanned + offset);
            self.buf.advance(1);
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            return Some(decode(&line));
        }
    }

    /// Drain whatever is left once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            self.buf.clear();
            return None;
        }
        if self.buf.is_empty() {
            return None;
        }
        let rest = self.buf.split();
        Some(decode(&rest))
    }
}

fn decode(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Lazily read lines from `reader` until EOF.
///
/// Each call starts with fresh framing state, so a new reader (a restarted
/// engine) never sees a fragment left over from the previous one.
pub fn lines<R>(reader: R) -> impl Stream<Item = String>
where
    R: AsyncRead + Unpin,
{
    struct State<R> {
        reader: R,
        framer: LineFramer,
        eof: bool,
    }

    let state = State {
        reader,
        framer: LineFramer::default(),
        eof: false,
    };

    stream::unfold(state, |mut st| async move {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(line) = st.framer.next_line() {
                return Some((line, st));
            }
            if st.eof {
                return st.framer.finish().map(|line| (line, st));
            }
            match st.reader.read(&mut chunk).await {
                Ok(0) => st.eof = true,
                Ok(n) => st.framer.push(&chunk[..n]),
                Err(e) => {
                    tracing::warn!(error = %e, "status stream read failed");
                    st.eof = true;
                }
            }
        }
    })
}

/// Lazily decode status lines from `reader`, skipping everything else.
pub fn status_events<R>(reader: R) -> impl Stream<Item = StatusLine>
where
    R: AsyncRead + Unpin,
{
    lines(reader).filter_map(|line| async move { parse_line(&line) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_known_keys() {
        assert_eq!(
            parse_line("#INDPROGRESS!0.5"),
            Some(StatusLine::IndirectProgress(0.5))
        );
        assert_eq!(
            parse_line("#DIRECTPROGRESS! 0.25 "),
            Some(StatusLine::DirectProgress(0.25))
        );
        assert_eq!(parse_line("#FINISH!"), Some(StatusLine::Finish));
        assert_eq!(parse_line("#FINISH!whatever"), Some(StatusLine::Finish));
    }

    #[test]
    fn drops_malformed_lines() {
        assert_eq!(parse_line("#BADKEY!notanumber"), None);
        assert_eq!(parse_line("#INDPROGRESS"), None);
        assert_eq!(parse_line("#INDPROGRESS!0.1!0.2"), None);
        assert_eq!(parse_line("#DIRECTPROGRESS!abc"), None);
        assert_eq!(parse_line("#DIRECTPROGRESS!NaN"), None);
        assert_eq!(parse_line("INDPROGRESS!0.5"), None);
        assert_eq!(parse_line("Rendering: [+++++   ]"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn framer_buffers_partial_lines() {
        let mut f = LineFramer::default();
        f.push(b"#INDPRO");
        assert_eq!(f.next_line(), None);
        f.push(b"GRESS!0.1\r\n#FIN");
        assert_eq!(f.next_line().as_deref(), Some("#INDPROGRESS!0.1"));
        assert_eq!(f.next_line(), None);
        f.push(b"ISH!");
        assert_eq!(f.finish().as_deref(), Some("#FINISH!"));
        assert_eq!(f.finish(), None);
    }

    #[test]
    fn framer_finds_newline_after_many_small_chunks() {
        let mut f = LineFramer::default();
        for _ in 0..1000 {
            f.push(b"xx");
            assert_eq!(f.next_line(), None);
        }
        f.push(b"\n#FINISH!\n");
        assert_eq!(f.next_line().map(|l| l.len()), Some(2000));
        assert_eq!(f.next_line().as_deref(), Some("#FINISH!"));
        assert_eq!(f.next_line(), None);
    }

    #[test]
    fn framer_drops_oversized_fragments() {
        let mut f = LineFramer::default();
        let junk = vec![b'x'; 4096];
        for _ in 0..=MAX_LINE / junk.len() {
            f.push(&junk);
            assert_eq!(f.next_line(), None);
        }
        // The rest of the oversized line is still discarded.
        f.push(b"tail of junk\n#DIRECTPROGRESS!0.5\n");
        assert_eq!(f.next_line().as_deref(), Some("#DIRECTPROGRESS!0.5"));
        assert_eq!(f.next_line(), None);

        f.push(&vec![b'y'; MAX_LINE + 1]);
        assert_eq!(f.next_line(), None);
        assert_eq!(f.finish(), None);
    }

    #[tokio::test]
    async fn stream_emits_trailing_fragment() {
        let input: &[u8] = b"one\ntwo\n\nthree";
        let got: Vec<String> = lines(input).collect().await;
        assert_eq!(got, vec!["one", "two", "", "three"]);
    }

    #[tokio::test]
    async fn malformed_lines_do_not_stop_the_stream() {
        let input: &[u8] =
            b"pbrt starting\n#BADKEY!notanumber\n#INDPROGRESS\n#INDPROGRESS!x\n#INDPROGRESS!0.5\n#DIRECTPROGRESS!0.3\n#FINISH!\n";
        let got: Vec<StatusLine> = status_events(input).collect().await;
        assert_eq!(
            got,
            vec![
                StatusLine::IndirectProgress(0.5),
                StatusLine::DirectProgress(0.3),
                StatusLine::Finish,
            ]
        );
    }

    #[tokio::test]
    async fn reads_across_small_chunks() {
        let (mut tx, rx) = tokio::io::duplex(8);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(b"#INDPROGRESS!0.125\n#DIRECTPROGRESS!0.75\n#FINISH!")
                .await
                .unwrap();
        });
        let got: Vec<StatusLine> = status_events(rx).collect().await;
        writer.await.unwrap();
        assert_eq!(
            got,
            vec![
                StatusLine::IndirectProgress(0.125),
                StatusLine::DirectProgress(0.75),
                StatusLine::Finish,
            ]
        );
    }
}
