//! Wire-level reads: the command line discipline, DATA bodies with
//! dot-unstuffing, and BDAT chunks.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{error::SessionError, session::Session, MAX_COMMAND_LINE};

const READ_CHUNK: usize = 4096;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LineEvent {
    Line(String),
    /// A line exceeded 512 bytes including CRLF; it has been discarded
    /// up to and including its terminator.
    Overlong,
    Eof,
}

#[derive(Debug)]
pub(crate) enum BodyEvent {
    /// Body complete; bytes are dot-unstuffed, terminator excluded.
    Complete(Vec<u8>),
    /// Body exceeded the size limit. Input was consumed up to the
    /// terminator; the payload is discarded.
    Oversize,
    Eof,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    async fn fill(&mut self) -> Result<usize, SessionError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.connection.receive(&mut chunk).await?;
        self.bytes_in += n as u64;
        self.line_buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Next CRLF-terminated command line from the buffered stream.
    ///
    /// Pipelined commands are naturally served from the buffer without
    /// touching the socket again.
    pub(crate) async fn read_line(&mut self) -> Result<LineEvent, SessionError> {
        loop {
            if let Some(pos) = find_crlf(&self.line_buf) {
                let line_end = pos + 2;

                if self.discard_overlong {
                    self.line_buf.drain(..line_end);
                    self.discard_overlong = false;
                    return Ok(LineEvent::Overlong);
                }

                if line_end > MAX_COMMAND_LINE {
                    self.line_buf.drain(..line_end);
                    return Ok(LineEvent::Overlong);
                }

                let line: Vec<u8> = self.line_buf.drain(..line_end).collect();
                let text = String::from_utf8_lossy(&line[..line.len() - 2]).into_owned();
                return Ok(LineEvent::Line(text));
            }

            // No terminator yet. If the fragment alone is already over
            // the limit, keep discarding until one shows up.
            if !self.discard_overlong && self.line_buf.len() >= MAX_COMMAND_LINE {
                self.line_buf.clear();
                self.discard_overlong = true;
            } else if self.discard_overlong {
                self.line_buf.clear();
            }

            if self.fill().await? == 0 {
                return Ok(LineEvent::Eof);
            }
        }
    }

    /// Read a DATA body until `CRLF.CRLF`, applying dot-unstuffing.
    ///
    /// `max_size` of zero means unlimited. On exceedance the rest of the
    /// body is consumed so the session can answer 552 and carry on.
    pub(crate) async fn read_data_body(&mut self) -> Result<BodyEvent, SessionError> {
        let mut raw: Vec<u8> = Vec::new();
        let mut oversize = false;
        // True while the buffer start coincides with a line boundary;
        // required for the empty-body (leading `.CRLF`) rule
        let mut at_boundary = true;

        loop {
            // Move buffered bytes over before reading more
            if !self.line_buf.is_empty() {
                raw.append(&mut self.line_buf);
            }

            if let Some(end) = find_terminator(&raw, at_boundary) {
                // Bytes after the terminator belong to the next command
                let after = raw.split_off(end.consumed);
                self.line_buf = after;

                if oversize {
                    return Ok(BodyEvent::Oversize);
                }

                let body = unstuff(&raw[..end.content_len]);
                if self.max_message_size > 0 && body.len() > self.max_message_size {
                    return Ok(BodyEvent::Oversize);
                }
                return Ok(BodyEvent::Complete(body));
            }

            if self.max_message_size > 0 && raw.len() > self.max_message_size + READ_CHUNK {
                // Over the limit already; keep only a tail big enough to
                // detect the terminator while the rest is consumed
                oversize = true;
                at_boundary = false;
                let keep = raw.len().saturating_sub(8);
                raw.drain(..keep);
            }

            let data_timeout = std::time::Duration::from_secs(self.config.timeouts.data_secs);
            let n = tokio::time::timeout(data_timeout, self.fill())
                .await
                .map_err(|_| SessionError::Timeout(self.config.timeouts.data_secs))??;
            if n == 0 {
                return Ok(BodyEvent::Eof);
            }
        }
    }

    /// Read exactly `size` raw bytes of a BDAT chunk. No stuffing.
    pub(crate) async fn read_bdat_chunk(&mut self, size: usize) -> Result<Option<Vec<u8>>, SessionError> {
        let mut chunk: Vec<u8> = Vec::with_capacity(size.min(1 << 20));

        while chunk.len() < size {
            if self.line_buf.is_empty() {
                let data_timeout =
                    std::time::Duration::from_secs(self.config.timeouts.data_secs);
                let n = tokio::time::timeout(data_timeout, self.fill())
                    .await
                    .map_err(|_| SessionError::Timeout(self.config.timeouts.data_secs))??;
                if n == 0 {
                    return Ok(None);
                }
            }

            let want = size - chunk.len();
            let take = want.min(self.line_buf.len());
            chunk.extend(self.line_buf.drain(..take));
        }

        Ok(Some(chunk))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

struct TerminatorPos {
    /// Length of body content, excluding the terminator line.
    content_len: usize,
    /// Bytes consumed from the raw buffer, terminator included.
    consumed: usize,
}

/// Locate `CRLF.CRLF`. With `at_boundary` the buffer is known to start
/// on a line boundary, so a leading `.CRLF` terminates an empty body.
fn find_terminator(raw: &[u8], at_boundary: bool) -> Option<TerminatorPos> {
    if at_boundary && raw.starts_with(b".\r\n") {
        return Some(TerminatorPos {
            content_len: 0,
            consumed: 3,
        });
    }

    raw.windows(5)
        .position(|w| w == b"\r\n.\r\n")
        .map(|pos| TerminatorPos {
            // Content keeps its final CRLF
            content_len: pos + 2,
            consumed: pos + 5,
        })
}

/// Strip the leading dot from dot-stuffed lines (RFC 5321 4.5.2).
fn unstuff(content: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(content.len());
    let mut at_line_start = true;

    let mut i = 0;
    while i < content.len() {
        let b = content[i];
        if at_line_start && b == b'.' {
            // Drop the stuffed dot, keep the rest of the line
            at_line_start = false;
            i += 1;
            continue;
        }
        out.push(b);
        at_line_start = b == b'\n';
        i += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_scanning() {
        assert_eq!(find_crlf(b"abc\r\ndef"), Some(3));
        assert_eq!(find_crlf(b"abc"), None);
    }

    #[test]
    fn terminator_at_start_means_empty_body() {
        let pos = find_terminator(b".\r\nMAIL", true).unwrap();
        assert_eq!(pos.content_len, 0);
        assert_eq!(pos.consumed, 3);
        // Without the boundary guarantee, a bare dot line is content
        assert!(find_terminator(b".\r\nMAIL", false).is_none());
    }

    #[test]
    fn terminator_mid_stream() {
        let raw = b"line one\r\nline two\r\n.\r\n";
        let pos = find_terminator(raw, true).unwrap();
        assert_eq!(&raw[..pos.content_len], b"line one\r\nline two\r\n");
        assert_eq!(pos.consumed, raw.len());
    }

    #[test]
    fn unstuffing() {
        assert_eq!(unstuff(b"..leading\r\nplain\r\n"), b".leading\r\nplain\r\n");
        assert_eq!(unstuff(b".x\r\n"), b"x\r\n");
        assert_eq!(unstuff(b"no dots\r\n"), b"no dots\r\n");
        // Dots not at line start are untouched
        assert_eq!(unstuff(b"a.b\r\n"), b"a.b\r\n");
    }
}
