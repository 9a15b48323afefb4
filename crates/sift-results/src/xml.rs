//! An incremental XML reader on top of the `xmlparser` tokenizer.
//!
//! Input arrives in chunks of arbitrary size and an event is only produced once
//! all of its bytes are available, so the event sequence does not depend on how
//! the input was split. Offsets are absolute positions in the whole input.
//!
//! The tokenizer is restarted at every event boundary over the decoded input
//! that has not been consumed yet. Comments, processing instructions, XML
//! declarations and document type declarations are skipped. More than one root
//! element is accepted, since streaming exports concatenate documents.

use xmlparser::{ElementEnd, StrSpan, TextPos, Token, Tokenizer};

use crate::error::{ResultsError, ResultsResult};

/// Markup whose end is a multi-byte terminator rather than a single `>`.
const DELIMITED: [(&str, &str); 3] = [("<!--", "-->"), ("<![CDATA[", "]]>"), ("<?", "?>")];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlEvent {
    Start {
        name: String,
        attributes: Vec<(String, String)>,
    },
    End {
        name: String,
    },
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlToken {
    pub offset: u64,
    pub event: XmlEvent,
}

impl XmlToken {
    /// Returns the value of the attribute if this is a start tag.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match &self.event {
            XmlEvent::Start { attributes, .. } => attributes
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct XmlReader {
    /// The decoded input starting at `base`.
    text: String,
    /// Trailing bytes that do not form a complete UTF-8 sequence yet.
    undecoded: Vec<u8>,
    invalid_at: Option<u64>,
    /// The number of bytes of the text that have been consumed.
    position: usize,
    /// The absolute offset of the first byte of the text.
    base: u64,
    /// The absolute end of the input when the current event was last found
    /// incomplete.
    scanned: u64,
    stack: Vec<String>,
    pending_end: Option<XmlToken>,
}

impl XmlReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.position > 0 {
            self.text.drain(..self.position);
            self.base += self.position as u64;
            self.position = 0;
        }
        if self.invalid_at.is_some() {
            return;
        }
        self.undecoded.extend_from_slice(bytes);
        let decoded = match std::str::from_utf8(&self.undecoded) {
            Ok(text) => {
                self.text.push_str(text);
                self.undecoded.len()
            }
            Err(e) => {
                let valid = e.valid_up_to();
                if let Ok(text) = std::str::from_utf8(&self.undecoded[..valid]) {
                    self.text.push_str(text);
                }
                if e.error_len().is_some() {
                    self.invalid_at = Some(self.base + self.text.len() as u64);
                }
                valid
            }
        };
        self.undecoded.drain(..decoded);
    }

    /// The names of the currently open elements, outermost first.
    pub fn path(&self) -> &[String] {
        &self.stack
    }

    /// The absolute offset of the first unconsumed byte.
    pub fn offset(&self) -> u64 {
        self.base + self.position as u64
    }

    /// Appends the input and reads all events that are complete.
    pub fn read_all(&mut self, bytes: &[u8]) -> ResultsResult<Vec<XmlToken>> {
        self.push(bytes);
        let mut tokens = vec![];
        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }
        Ok(tokens)
    }

    /// Returns the next complete event, or `None` if more input is needed.
    pub fn next_token(&mut self) -> ResultsResult<Option<XmlToken>> {
        if let Some(token) = self.pending_end.take() {
            return Ok(Some(token));
        }
        loop {
            let root = self.stack.is_empty();
            if root {
                let rest = &self.text[self.position..];
                self.position += rest.len() - rest.trim_start_matches(is_space).len();
            }
            let offset = self.offset();
            if self.scanned > offset && !self.has_new_delimiter() {
                return self.stall();
            }
            let Some(scanned) = scan(&self.text[self.position..], offset, root)? else {
                return self.stall();
            };
            let at = offset + scanned.start as u64;
            let event = match scanned.step {
                Step::Skip => {
                    self.position += scanned.end;
                    continue;
                }
                Step::Text(text) => XmlEvent::Text(text),
                Step::Start {
                    name,
                    attributes,
                    empty,
                } => {
                    if empty {
                        self.pending_end = Some(XmlToken {
                            offset: at,
                            event: XmlEvent::End { name: name.clone() },
                        });
                    } else {
                        self.stack.push(name.clone());
                    }
                    XmlEvent::Start { name, attributes }
                }
                Step::End { name } => {
                    match self.stack.last() {
                        Some(open) if *open == name => {}
                        Some(open) => {
                            return Err(ResultsError::malformed(
                                at,
                                format!("expected end of element `{open}`, found `{name}`"),
                            ))
                        }
                        None => {
                            return Err(ResultsError::malformed(
                                at,
                                format!("unexpected end of element `{name}`"),
                            ))
                        }
                    }
                    self.stack.pop();
                    XmlEvent::End { name }
                }
            };
            self.position += scanned.end;
            return Ok(Some(XmlToken { offset: at, event }));
        }
    }

    /// Verifies that the input ended at a structurally complete position.
    pub fn finish(&self) -> ResultsResult<()> {
        if let Some(offset) = self.invalid_at {
            return Err(ResultsError::malformed(offset, "invalid UTF-8 sequence"));
        }
        let rest = &self.text[self.position..];
        if let Some(index) = rest.find(|c: char| !is_space(c)) {
            let offset = self.offset() + index as u64;
            return if rest[index..].starts_with('<') {
                Err(ResultsError::incomplete(format!(
                    "input ended inside markup at byte {offset}"
                )))
            } else if self.stack.is_empty() {
                Err(ResultsError::malformed(offset, "text outside of element"))
            } else {
                Err(ResultsError::incomplete(format!(
                    "input ended inside element `{}`",
                    self.stack.join("/")
                )))
            };
        }
        if !self.undecoded.is_empty() {
            return Err(ResultsError::incomplete(
                "input ended inside a UTF-8 sequence",
            ));
        }
        if !self.stack.is_empty() {
            return Err(ResultsError::incomplete(format!(
                "input ended inside element `{}`",
                self.stack.join("/")
            )));
        }
        Ok(())
    }

    /// Every event ends with `>` or, for text, right before `<`, so an
    /// incomplete event cannot complete without one of them.
    fn has_new_delimiter(&self) -> bool {
        let from = (self.scanned - self.base) as usize;
        self.text.as_bytes()[from..]
            .iter()
            .any(|b| matches!(b, b'<' | b'>'))
    }

    fn stall(&mut self) -> ResultsResult<Option<XmlToken>> {
        self.scanned = self.base + self.text.len() as u64;
        match self.invalid_at {
            Some(offset) => Err(ResultsError::malformed(offset, "invalid UTF-8 sequence")),
            None => Ok(None),
        }
    }
}

struct Scanned {
    start: usize,
    end: usize,
    step: Step,
}

enum Step {
    Start {
        name: String,
        attributes: Vec<(String, String)>,
        empty: bool,
    },
    End {
        name: String,
    },
    Text(String),
    Skip,
}

/// Tokenizes the event at the beginning of `text`.
///
/// At the top level the tokenizer runs in document mode, which accepts the
/// prolog. Inside an element it runs in fragment mode.
fn scan(text: &str, base: u64, root: bool) -> ResultsResult<Option<Scanned>> {
    let tokenizer = if root {
        Tokenizer::from(text)
    } else {
        Tokenizer::from_fragment(text, 0..text.len())
    };
    let mut element: Option<(usize, String, Vec<(String, String)>)> = None;
    for token in tokenizer {
        let token = match token {
            Ok(x) => x,
            Err(e) if is_terminated(text) => {
                let offset = base + byte_offset(text, e.pos()) as u64;
                return Err(ResultsError::malformed(offset, e.to_string()));
            }
            Err(_) => return Ok(None),
        };
        match token {
            Token::ElementStart {
                prefix,
                local,
                span,
            } => element = Some((span.start(), qualified(prefix, local), vec![])),
            Token::Attribute {
                prefix,
                local,
                value,
                span,
            } => {
                let at = base + span.start() as u64;
                let Some((_, _, attributes)) = element.as_mut() else {
                    return Err(ResultsError::malformed(at, "attribute outside of tag"));
                };
                let key = qualified(prefix, local);
                if attributes.iter().any(|(k, _)| *k == key) {
                    return Err(ResultsError::malformed(
                        at,
                        format!("duplicate attribute `{key}`"),
                    ));
                }
                let value = unescape(value.as_str(), base + value.start() as u64)?;
                attributes.push((key, value));
            }
            Token::ElementEnd { end, span } => {
                let empty = match end {
                    ElementEnd::Close(prefix, local) => {
                        return Ok(Some(Scanned {
                            start: span.start(),
                            end: span.end(),
                            step: Step::End {
                                name: qualified(prefix, local),
                            },
                        }))
                    }
                    ElementEnd::Open => false,
                    ElementEnd::Empty => true,
                };
                let Some((start, name, attributes)) = element.take() else {
                    return Err(ResultsError::malformed(
                        base + span.start() as u64,
                        "end of tag without a name",
                    ));
                };
                return Ok(Some(Scanned {
                    start,
                    end: span.end(),
                    step: Step::Start {
                        name,
                        attributes,
                        empty,
                    },
                }));
            }
            Token::Text { text: raw } => {
                // text ends at the next `<`, which has not arrived yet
                if raw.end() == text.len() {
                    return Ok(None);
                }
                return Ok(Some(Scanned {
                    start: raw.start(),
                    end: raw.end(),
                    step: Step::Text(unescape(raw.as_str(), base + raw.start() as u64)?),
                }));
            }
            Token::Cdata { text: raw, span } => {
                return Ok(Some(Scanned {
                    start: span.start(),
                    end: span.end(),
                    step: Step::Text(raw.as_str().to_string()),
                }))
            }
            Token::Declaration { span, .. }
            | Token::ProcessingInstruction { span, .. }
            | Token::Comment { span, .. }
            | Token::EmptyDtd { span, .. }
            | Token::DtdEnd { span } => {
                return Ok(Some(Scanned {
                    start: span.start(),
                    end: span.end(),
                    step: Step::Skip,
                }))
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Whether the markup at the beginning of `text` has all of its bytes, so a
/// tokenizer error cannot be caused by the input being cut short.
fn is_terminated(text: &str) -> bool {
    for (start, end) in DELIMITED {
        if text.len() < start.len() && start.starts_with(text) {
            return false;
        }
        if let Some(rest) = text.strip_prefix(start) {
            return rest.contains(end);
        }
    }
    text.contains('>')
}

fn byte_offset(text: &str, pos: TextPos) -> usize {
    let mut line = 0;
    for _ in 1..pos.row {
        match text[line..].find('\n') {
            Some(index) => line += index + 1,
            None => return text.len(),
        }
    }
    text[line..]
        .char_indices()
        .nth(pos.col.saturating_sub(1) as usize)
        .map(|(index, _)| line + index)
        .unwrap_or(text.len())
}

fn qualified(prefix: StrSpan<'_>, local: StrSpan<'_>) -> String {
    if prefix.as_str().is_empty() {
        local.as_str().to_string()
    } else {
        format!("{}:{}", prefix.as_str(), local.as_str())
    }
}

fn is_space(c: char) -> bool {
    c.is_ascii_whitespace()
}

/// Replaces entity and character references.
pub fn unescape(raw: &str, offset: u64) -> ResultsResult<String> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(index) = rest.find('&') {
        out.push_str(&rest[..index]);
        let at = offset + (raw.len() - rest.len() + index) as u64;
        let reference = &rest[index + 1..];
        let Some(end) = reference.find(';') else {
            return Err(ResultsError::malformed(at, "unterminated entity reference"));
        };
        let c = match &reference[..end] {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            x => x
                .strip_prefix("#x")
                .map(|h| u32::from_str_radix(h, 16))
                .or_else(|| x.strip_prefix('#').map(|d| d.parse::<u32>()))
                .and_then(|n| n.ok())
                .and_then(char::from_u32)
                .ok_or_else(|| {
                    ResultsError::malformed(at, format!("invalid entity reference `&{x};`"))
                })?,
        };
        out.push(c);
        rest = &reference[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
