//! Incremental stanza framing over an XMPP byte stream.
//!
//! Turns arbitrary read chunks into complete top-level elements. The framer
//! counts nesting depth and declares a stanza boundary whenever depth drops
//! back below the configured top-level depth. For a client stream the
//! `<stream:stream>` root sits at depth 1 and is reported as a
//! [`Frame::Header`] / [`Frame::Close`] pair, never as a stanza.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, error};

/// Maximum number of buffered bytes that may accumulate without yielding a
/// complete stanza. Typical stanzas are a few KB; anything past this is either
/// malformed or hostile.
pub const MAX_STANZA_BUFFER_SIZE: usize = 1_024 * 1_024;

/// Depth of stanzas inside a `<stream:stream>` root.
const STREAM_TOP_LEVEL: usize = 2;

/// Longest bang markup opener (`<![CDATA[`). A `<!` closer than this to the end
/// of the buffer may still be completed by the next read.
const LONGEST_BANG_OPENER: usize = 9;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("malformed XML at byte {offset}: {reason}")]
    Malformed { offset: usize, reason: String },
    #[error("stanza buffer exceeded {limit} bytes without a complete stanza")]
    Overflow { limit: usize },
}

/// One unit produced by the framer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Verbatim opening of an enclosing element, including any XML declaration.
    Header(String),
    /// A complete top-level child element, verbatim.
    Stanza(String),
    /// The enclosing element was closed.
    Close,
}

/// Stateful stanza boundary detector.
#[derive(Debug)]
pub struct StanzaFramer {
    buffer: Vec<u8>,
    /// Depth of the enclosing elements that are currently open. Always below
    /// `top_level` between frames.
    depth: usize,
    top_level: usize,
    finished: bool,
    poisoned: bool,
}

impl StanzaFramer {
    /// Framer for a client-to-server stream: stanzas are children of the root.
    pub fn stream() -> Self {
        Self::with_top_level(STREAM_TOP_LEVEL)
    }

    /// Framer for a root-less concatenation of stanzas, as written into a
    /// helper daemon's control pipe.
    pub fn bare() -> Self {
        Self::with_top_level(1)
    }

    pub fn with_top_level(top_level: usize) -> Self {
        Self {
            buffer: Vec::new(),
            depth: 0,
            top_level: top_level.max(1),
            finished: false,
            poisoned: false,
        }
    }

    /// Append bytes read from the transport. An empty slice marks a clean end
    /// of stream; whatever partial stanza is still buffered is dropped.
    pub fn push(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            if !self.buffer.is_empty() {
                debug!(pending = self.buffer.len(), "End of stream with partial stanza buffered");
            }
            self.finished = true;
            self.buffer.clear();
            return;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Append bytes and return a lazy iterator over the frames now available.
    pub fn feed(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.push(bytes);
        Frames { framer: self }
    }

    /// Drop all buffered bytes and depth state. Used when the stream restarts
    /// after authentication or a security upgrade.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.depth = 0;
        self.finished = false;
        self.poisoned = false;
    }

    /// True once a zero-length feed has been observed.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes buffered but not yet framed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Extract the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FramingError> {
        if self.poisoned {
            return Ok(None);
        }

        let scanned = scan(&self.buffer, self.depth, self.top_level);
        match scanned {
            Ok(Scan::Frame { frame, consumed, depth }) => {
                self.buffer.drain(..consumed);
                self.depth = depth;
                Ok(Some(frame))
            }
            Ok(Scan::Incomplete { skipped }) => {
                if skipped > 0 {
                    self.buffer.drain(..skipped);
                }
                if self.buffer.len() > MAX_STANZA_BUFFER_SIZE {
                    error!(
                        buffer_bytes = self.buffer.len(),
                        limit = MAX_STANZA_BUFFER_SIZE,
                        "Stanza buffer exceeded size limit"
                    );
                    self.poisoned = true;
                    return Err(FramingError::Overflow {
                        limit: MAX_STANZA_BUFFER_SIZE,
                    });
                }
                Ok(None)
            }
            Err(e) => {
                self.poisoned = true;
                Err(e)
            }
        }
    }
}

/// Lazy, finite sequence of frames available after one feed.
pub struct Frames<'a> {
    framer: &'a mut StanzaFramer,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_frame().transpose()
    }
}

enum Scan {
    Frame {
        frame: Frame,
        consumed: usize,
        depth: usize,
    },
    /// No complete frame yet. `skipped` leading bytes held only inter-stanza
    /// whitespace or metadata and may be discarded.
    Incomplete { skipped: usize },
}

/// Convert a byte slice to a String, trying zero-copy UTF-8 first.
fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Offset of the `<` opening the markup read at `pos`. Depending on how the
/// reader consumed the preceding text, `pos` may already sit one past it.
fn markup_start(buffer: &[u8], pos: usize) -> usize {
    if buffer.get(pos) != Some(&b'<') && pos > 0 && buffer[pos - 1] == b'<' {
        pos - 1
    } else {
        pos
    }
}

/// End of a text run whose event just finished at `pos`.
fn text_end(buffer: &[u8], pos: usize) -> usize {
    if pos > 0 && buffer[pos - 1] == b'<' {
        pos - 1
    } else {
        pos
    }
}

fn malformed(offset: usize, reason: impl Into<String>) -> FramingError {
    FramingError::Malformed {
        offset,
        reason: reason.into(),
    }
}

/// Scan `buffer` from its start, with `enclosing` elements already open.
fn scan(buffer: &[u8], enclosing: usize, top_level: usize) -> Result<Scan, FramingError> {
    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    // End names are checked against our own stack.
    reader.config_mut().check_end_names = false;

    let mut depth = enclosing;
    let mut names: Vec<Vec<u8>> = Vec::new();
    let mut stanza_start: usize = 0;
    // Start of the region that cannot be dropped yet: either the stanza being
    // accumulated or, between stanzas, the first unconsumed byte.
    let mut keep_from: usize = 0;

    loop {
        let pos = markup_start(buffer, reader.buffer_position() as usize);
        let between = depth < top_level;

        // The reader never saw the enclosing root open, so it would reject
        // the root's end tag. Close it here instead.
        if between && buffer[pos..].starts_with(b"</") {
            if depth == 0 {
                return Err(malformed(pos, "end tag without matching start"));
            }
            return match buffer[pos..].iter().position(|&b| b == b'>') {
                Some(gt) => Ok(Scan::Frame {
                    frame: Frame::Close,
                    consumed: pos + gt + 1,
                    depth: depth - 1,
                }),
                None => Ok(Scan::Incomplete { skipped: keep_from }),
            };
        }

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                if between && depth + 1 == top_level {
                    keep_from = reader.buffer_position() as usize;
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {
                if between && depth + 1 == top_level {
                    keep_from = text_end(buffer, reader.buffer_position() as usize);
                }
            }
            Ok(Event::Start(e)) => {
                if depth + 1 < top_level {
                    // Opening an enclosing element (the stream root).
                    let end = reader.buffer_position() as usize;
                    return Ok(Scan::Frame {
                        frame: Frame::Header(bytes_to_string(&buffer[..end])),
                        consumed: end,
                        depth: depth + 1,
                    });
                }
                depth += 1;
                if depth == top_level {
                    stanza_start = pos;
                    keep_from = pos;
                }
                names.push(e.name().as_ref().to_vec());
            }
            Ok(Event::Empty(_)) => {
                if depth + 1 < top_level {
                    // Self-closing root: opened and closed at once.
                    let end = reader.buffer_position() as usize;
                    return Ok(Scan::Frame {
                        frame: Frame::Close,
                        consumed: end,
                        depth,
                    });
                }
                if depth + 1 == top_level {
                    let end = reader.buffer_position() as usize;
                    return Ok(Scan::Frame {
                        frame: Frame::Stanza(bytes_to_string(&buffer[pos..end])),
                        consumed: end,
                        depth,
                    });
                }
            }
            Ok(Event::End(e)) => {
                match names.pop() {
                    Some(open) if open.as_slice() == e.name().as_ref() => {}
                    Some(open) => {
                        return Err(malformed(
                            pos,
                            format!(
                                "expected </{}>, found </{}>",
                                String::from_utf8_lossy(&open),
                                String::from_utf8_lossy(e.name().as_ref())
                            ),
                        ));
                    }
                    None => return Err(malformed(pos, "end tag without matching start")),
                }
                depth -= 1;
                if depth + 1 == top_level {
                    let end = reader.buffer_position() as usize;
                    return Ok(Scan::Frame {
                        frame: Frame::Stanza(bytes_to_string(&buffer[stanza_start..end])),
                        consumed: end,
                        depth,
                    });
                }
            }
            Ok(Event::Eof) => {
                return Ok(Scan::Incomplete { skipped: keep_from });
            }
            Err(quick_xml::Error::Syntax(
                SyntaxError::UnclosedTag
                | SyntaxError::UnclosedComment
                | SyntaxError::UnclosedCData
                | SyntaxError::UnclosedDoctype
                | SyntaxError::UnclosedPIOrXmlDecl,
            )) => {
                // Expected during streaming: the tail is completed by the
                // next read.
                return Ok(Scan::Incomplete { skipped: keep_from });
            }
            Err(quick_xml::Error::Syntax(SyntaxError::InvalidBangMarkup))
                if buffer.len() - pos < LONGEST_BANG_OPENER =>
            {
                return Ok(Scan::Incomplete { skipped: keep_from });
            }
            Err(e) => {
                return Err(malformed(pos, e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='abc' version='1.0'>";

    fn collect(framer: &mut StanzaFramer, bytes: &[u8]) -> Vec<Frame> {
        framer
            .feed(bytes)
            .collect::<Result<Vec<_>, _>>()
            .expect("well-formed input")
    }

    fn stanzas(frames: &[Frame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Stanza(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn sample_document() -> String {
        format!(
            "{HEADER}<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features> \
             <presence from='a@b.c/res'/><message from='a@b.c' type='chat'><body>Hello &amp; <![CDATA[<raw>]]> world</body></message>\n\
             <!-- keepalive --><iq type='result' id='bind_1'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>u@b.c/sj</jid></bind></iq></stream:stream>"
        )
    }

    #[test]
    fn test_stream_header_is_not_a_stanza() {
        let mut framer = StanzaFramer::stream();
        let frames = collect(&mut framer, HEADER.as_bytes());
        assert_eq!(frames, vec![Frame::Header(HEADER.to_string())]);
    }

    #[test]
    fn test_whole_document_in_one_feed() {
        let mut framer = StanzaFramer::stream();
        let frames = collect(&mut framer, sample_document().as_bytes());
        assert!(matches!(frames.first(), Some(Frame::Header(_))));
        assert_eq!(frames.last(), Some(&Frame::Close));
        let s = stanzas(&frames);
        assert_eq!(s.len(), 4);
        assert!(s[0].starts_with("<stream:features>"));
        assert!(s[0].ends_with("</stream:features>"));
        assert_eq!(s[1], "<presence from='a@b.c/res'/>");
        assert!(s[2].contains("<![CDATA[<raw>]]>"));
        assert!(s[3].ends_with("</iq>"));
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_every_split_point_yields_same_stanzas() {
        let doc = sample_document();
        let bytes = doc.as_bytes();
        let mut whole = StanzaFramer::stream();
        let expected = collect(&mut whole, bytes);

        for split in 1..bytes.len() {
            let mut framer = StanzaFramer::stream();
            let mut frames = collect(&mut framer, &bytes[..split]);
            frames.extend(collect(&mut framer, &bytes[split..]));
            assert_eq!(frames, expected, "split at byte {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let doc = sample_document();
        let mut whole = StanzaFramer::stream();
        let expected = collect(&mut whole, doc.as_bytes());

        let mut framer = StanzaFramer::stream();
        let mut frames = Vec::new();
        for b in doc.as_bytes() {
            frames.extend(collect(&mut framer, std::slice::from_ref(b)));
        }
        assert_eq!(frames, expected);
    }

    #[test]
    fn test_reset_discards_partial_state() {
        let mut framer = StanzaFramer::stream();
        collect(&mut framer, HEADER.as_bytes());
        assert!(collect(&mut framer, b"<message to='x@y'><bo").is_empty());

        framer.reset();
        let frames = collect(
            &mut framer,
            format!("{HEADER}<presence/><success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").as_bytes(),
        );
        assert_eq!(
            stanzas(&frames),
            vec![
                "<presence/>".to_string(),
                "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>".to_string()
            ]
        );
    }

    #[test]
    fn test_reset_mid_stanza_then_bare_document() {
        let mut framer = StanzaFramer::bare();
        assert!(collect(&mut framer, b"<iq type='get'><query").is_empty());
        framer.reset();
        let frames = collect(&mut framer, b"<presence from='a@b.c'/>");
        assert_eq!(stanzas(&frames), vec!["<presence from='a@b.c'/>".to_string()]);
    }

    #[test]
    fn test_zero_length_feed_is_end_of_stream() {
        let mut framer = StanzaFramer::stream();
        collect(&mut framer, HEADER.as_bytes());
        collect(&mut framer, b"<message><body>cut");
        let frames = collect(&mut framer, b"");
        assert!(frames.is_empty());
        assert!(framer.is_finished());
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_bare_framer_emits_each_top_level_element() {
        let mut framer = StanzaFramer::bare();
        let frames = collect(
            &mut framer,
            b"<message from='a@b.c'><body>hi</body></message><presence/>\n<iq id='1' type='result'/>",
        );
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| matches!(f, Frame::Stanza(_))));
    }

    #[test]
    fn test_mismatched_end_tag_is_malformed() {
        let mut framer = StanzaFramer::stream();
        collect(&mut framer, HEADER.as_bytes());
        let result: Result<Vec<_>, _> = framer.feed(b"<message><body>x</message>").collect();
        assert!(matches!(result, Err(FramingError::Malformed { .. })));
        // Poisoned until reset.
        assert!(framer.feed(b"<presence/>").next().is_none());
        framer.reset();
        let frames = collect(&mut framer, format!("{HEADER}<a/>").as_bytes());
        assert_eq!(stanzas(&frames), vec!["<a/>".to_string()]);
    }

    #[test]
    fn test_stray_end_tag_in_bare_stream_is_malformed() {
        let mut framer = StanzaFramer::bare();
        let result: Result<Vec<_>, _> = framer.feed(b"</message>").collect();
        assert!(matches!(result, Err(FramingError::Malformed { .. })));
    }

    #[test]
    fn test_overflow_is_reported() {
        let mut framer = StanzaFramer::bare();
        let mut big = b"<message><body>".to_vec();
        big.extend(std::iter::repeat(b'a').take(MAX_STANZA_BUFFER_SIZE + 1));
        let result: Result<Vec<_>, _> = framer.feed(&big).collect();
        assert_eq!(
            result,
            Err(FramingError::Overflow {
                limit: MAX_STANZA_BUFFER_SIZE
            })
        );
    }

    #[test]
    fn test_whitespace_keepalives_are_dropped() {
        let mut framer = StanzaFramer::stream();
        collect(&mut framer, HEADER.as_bytes());
        for _ in 0..10 {
            assert!(collect(&mut framer, b" \n").is_empty());
        }
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_server_stream_close() {
        let mut framer = StanzaFramer::stream();
        collect(&mut framer, HEADER.as_bytes());
        assert_eq!(collect(&mut framer, b"</stream:stream>"), vec![Frame::Close]);
    }

    #[test]
    fn test_close_after_stanza_in_one_feed() {
        let mut framer = StanzaFramer::stream();
        let frames = collect(&mut framer, format!("{HEADER}<iq id='1'/>\n</stream:stream>").as_bytes());
        assert_eq!(
            frames[1..],
            [Frame::Stanza("<iq id='1'/>".to_string()), Frame::Close]
        );
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn test_split_close_tag_waits_for_rest() {
        let mut framer = StanzaFramer::stream();
        collect(&mut framer, HEADER.as_bytes());
        assert!(collect(&mut framer, b"</stream:str").is_empty());
        assert_eq!(collect(&mut framer, b"eam>"), vec![Frame::Close]);
    }
}
