//! Per-protocol line normalization.
//!
//! Every chunk read from a socket passes through exactly one normalizer,
//! chosen when the descriptor is registered and fixed for its lifetime.
//! Normalizers are total: any byte sequence is accepted, malformed input
//! degrades to passthrough rather than failing.

/// Which wire format a descriptor speaks, and therefore how its chunks are
/// turned into sink lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Passthrough: chunk plus one trailing newline. Used in `--raw` mode.
    Raw,
    /// BSD syslog datagrams: `<PRI>message`, possibly newline-terminated.
    Syslog,
    /// Journal native datagrams: multiple `FIELD=value` lines per chunk.
    Journal,
    /// Captured stdout/stderr of a supervised service. Chunks need not align
    /// with line boundaries; until reassembly exists this consumes nothing.
    Stream,
}

impl Protocol {
    /// Converts one received chunk into the bytes to append to the sink.
    /// `None` means nothing should be written for this chunk.
    ///
    /// Every variant except `Stream` emits exactly one newline-terminated
    /// line per chunk, even for an empty chunk.
    pub fn normalize(self, chunk: &[u8]) -> Option<Vec<u8>> {
        match self {
            Protocol::Raw => {
                let mut line = Vec::with_capacity(chunk.len() + 1);
                line.extend_from_slice(chunk);
                line.push(b'\n');
                Some(line)
            }
            Protocol::Syslog => {
                let body = strip_priority_tag(chunk);
                let end = body.len() - trailing_newlines(body);
                let mut line = Vec::with_capacity(end + 1);
                line.extend_from_slice(&body[..end]);
                line.push(b'\n');
                Some(line)
            }
            Protocol::Journal => {
                // One chunk = one record = one line; embedded field
                // separators fold into spaces.
                let mut line: Vec<u8> = chunk
                    .iter()
                    .map(|&b| if b == b'\n' { b' ' } else { b })
                    .collect();
                line.push(b'\n');
                Some(line)
            }
            Protocol::Stream => None,
        }
    }
}

/// Drops a leading `<digits>` priority/facility tag if present. A chunk that
/// does not carry a well-formed tag is returned unchanged.
fn strip_priority_tag(chunk: &[u8]) -> &[u8] {
    if chunk.first() != Some(&b'<') {
        return chunk;
    }
    match chunk.iter().position(|&b| b == b'>') {
        Some(close) if close > 1 && chunk[1..close].iter().all(u8::is_ascii_digit) => {
            &chunk[close + 1..]
        }
        _ => chunk,
    }
}

fn trailing_newlines(chunk: &[u8]) -> usize {
    chunk.iter().rev().take_while(|&&b| b == b'\n').count()
}
