//! Readers for the Atom documents returned by the REST endpoints.
//!
//! An entity is an Atom `<entry>` whose content is a `<s:dict>` of attributes.
//! Nested dictionaries are flattened into dotted keys (`request.search`) and
//! list items are joined with a newline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sift_results::xml::{XmlEvent, XmlReader, XmlToken};

use crate::error::{JobError, JobResult};

const LIST_SEPARATOR: &str = "\n";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Entity {
    /// The title of the entry.
    pub name: String,
    pub published: Option<DateTime<Utc>>,
    pub attributes: BTreeMap<String, String>,
}

impl Entity {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|x| x.as_str())
    }

    /// Returns the attribute as a flag, accepting `1`/`0` and `true`/`false`.
    pub fn flag(&self, key: &str) -> JobResult<Option<bool>> {
        match self.attribute(key).map(|x| x.trim()) {
            None => Ok(None),
            Some("1") | Some("true") => Ok(Some(true)),
            Some("0") | Some("false") => Ok(Some(false)),
            Some(other) => Err(JobError::malformed(format!(
                "invalid flag for `{key}`: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feed {
    /// The total number of entries on the server, which may exceed the entries in this page.
    pub total: Option<usize>,
    pub entries: Vec<Entity>,
}

/// Reads the first entry of an entry or feed document.
pub fn read_entity(body: &[u8]) -> JobResult<Entity> {
    read_feed(body)?
        .entries
        .into_iter()
        .next()
        .ok_or_else(|| JobError::malformed("response contains no entry"))
}

pub fn read_feed(body: &[u8]) -> JobResult<Feed> {
    let mut reader = FeedReader::default();
    for token in tokenize(body)? {
        reader.handle(token)?;
    }
    Ok(reader.feed)
}

/// Reads the job ID from a `<response><sid>..</sid></response>` document.
pub fn read_sid(body: &[u8]) -> JobResult<String> {
    element_texts(body, "sid")?
        .into_iter()
        .map(|(_, text)| text.trim().to_string())
        .find(|x| !x.is_empty())
        .ok_or_else(|| JobError::malformed("response contains no job ID"))
}

/// Reads the `<msg>` texts of an error response.
/// An unreadable body yields no messages, since the status is already known.
pub fn read_messages(body: &[u8]) -> Vec<String> {
    match element_texts(body, "msg") {
        Ok(messages) => messages
            .into_iter()
            .map(|(kind, text)| match kind {
                Some(kind) => format!("{kind}: {}", text.trim()),
                None => text.trim().to_string(),
            })
            .collect(),
        Err(_) => vec![],
    }
}

fn tokenize(body: &[u8]) -> JobResult<Vec<XmlToken>> {
    let mut reader = XmlReader::new();
    let tokens = reader
        .read_all(body)
        .map_err(|e| JobError::malformed(e.to_string()))?;
    reader
        .finish()
        .map_err(|e| JobError::malformed(e.to_string()))?;
    Ok(tokens)
}

/// Returns the `type` attribute and the text of every element with the given name.
fn element_texts(body: &[u8], name: &str) -> JobResult<Vec<(Option<String>, String)>> {
    let mut out = vec![];
    let mut current: Option<(Option<String>, String)> = None;
    for token in tokenize(body)? {
        match &token.event {
            XmlEvent::Start { name: n, .. } if n == name => {
                current = Some((token.attribute("type").map(|x| x.to_string()), String::new()));
            }
            XmlEvent::Text(text) => {
                if let Some((_, buffer)) = current.as_mut() {
                    buffer.push_str(text);
                }
            }
            XmlEvent::End { name: n } if n == name => {
                if let Some(item) = current.take() {
                    out.push(item);
                }
            }
            _ => {}
        }
    }
    Ok(out)
}

struct KeyFrame {
    name: String,
    nested: bool,
}

#[derive(Default)]
struct FeedReader {
    feed: Feed,
    entry: Option<Entity>,
    elements: Vec<String>,
    keys: Vec<KeyFrame>,
    text: String,
}

impl FeedReader {
    fn handle(&mut self, token: XmlToken) -> JobResult<()> {
        match token.event {
            XmlEvent::Start { ref name, .. } => {
                match name.as_str() {
                    "entry" => self.entry = Some(Entity::default()),
                    "s:key" => {
                        let key = token
                            .attribute("name")
                            .ok_or_else(|| JobError::malformed("attribute key without name"))?;
                        self.keys.push(KeyFrame {
                            name: key.to_string(),
                            nested: false,
                        });
                    }
                    "s:dict" | "s:list" => {
                        if let Some(frame) = self.keys.last_mut() {
                            frame.nested = true;
                        }
                    }
                    _ => {}
                }
                self.elements.push(name.clone());
                self.text.clear();
            }
            XmlEvent::Text(text) => self.text.push_str(&text),
            XmlEvent::End { name } => {
                self.elements.pop();
                let text = std::mem::take(&mut self.text);
                self.end(&name, text)?;
            }
        }
        Ok(())
    }

    fn end(&mut self, name: &str, text: String) -> JobResult<()> {
        let parent = self.elements.last().map(|x| x.as_str());
        match (name, parent) {
            ("opensearch:totalResults", _) => {
                let total = text
                    .trim()
                    .parse()
                    .map_err(|_| JobError::malformed(format!("invalid total: {text}")))?;
                self.feed.total = Some(total);
            }
            ("entry", _) => {
                if let Some(entry) = self.entry.take() {
                    self.feed.entries.push(entry);
                }
            }
            ("title", Some("entry")) => {
                if let Some(entry) = self.entry.as_mut() {
                    entry.name = text.trim().to_string();
                }
            }
            ("published", Some("entry")) => {
                let published = DateTime::parse_from_rfc3339(text.trim())
                    .map_err(|e| JobError::malformed(format!("invalid timestamp {text}: {e}")))?;
                if let Some(entry) = self.entry.as_mut() {
                    entry.published = Some(published.with_timezone(&Utc));
                }
            }
            ("s:item", _) => {
                let key = self.key_path();
                if let Some(entry) = self.entry.as_mut() {
                    entry
                        .attributes
                        .entry(key)
                        .and_modify(|x| {
                            x.push_str(LIST_SEPARATOR);
                            x.push_str(&text);
                        })
                        .or_insert(text);
                }
            }
            ("s:key", _) => {
                let key = self.key_path();
                let frame = self.keys.pop();
                if let (Some(frame), Some(entry)) = (frame, self.entry.as_mut()) {
                    if !frame.nested {
                        entry.attributes.insert(key, text);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn key_path(&self) -> String {
        self.keys
            .iter()
            .map(|x| x.name.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }
}
