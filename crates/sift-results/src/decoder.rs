use std::mem;
use std::sync::Arc;

use log::trace;

use crate::error::{ResultsError, ResultsResult};
use crate::record::{Record, ResultBatch, Schema};
use crate::xml::{XmlEvent, XmlReader, XmlToken};

/// The separator for the values of a multi-valued field.
pub const MULTI_VALUE_SEPARATOR: &str = "\n";

/// The role of an open element in a results document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Results,
    Meta,
    FieldOrder,
    HeaderField,
    Result,
    Field,
    Value,
    ValueText,
    /// A raw value, whose whole text content is the value.
    RawValue,
    Other,
}

impl Tag {
    fn child(parent: Option<Tag>, name: &str) -> Tag {
        match (parent, name) {
            (None, "results") => Tag::Results,
            (Some(Tag::Results), "meta") => Tag::Meta,
            (Some(Tag::Results), "result") => Tag::Result,
            (Some(Tag::Meta), "fieldOrder") => Tag::FieldOrder,
            (Some(Tag::FieldOrder), "field") => Tag::HeaderField,
            (Some(Tag::Result), "field") => Tag::Field,
            (Some(Tag::Field), "value") => Tag::Value,
            (Some(Tag::Field), "v") => Tag::RawValue,
            (Some(Tag::Value), "text") => Tag::ValueText,
            (Some(Tag::RawValue), _) => Tag::RawValue,
            _ => Tag::Other,
        }
    }

    fn collects_text(self) -> bool {
        matches!(self, Tag::HeaderField | Tag::ValueText | Tag::RawValue)
    }
}

/// The state of the `<results>` element being decoded.
#[derive(Debug)]
struct Document {
    is_final: bool,
    schema: Option<Arc<Schema>>,
    records: Vec<Record>,
    header: Vec<String>,
    row: Option<Vec<Option<String>>>,
    field: Option<FieldValues>,
    text: String,
}

#[derive(Debug)]
struct FieldValues {
    index: usize,
    values: Vec<String>,
}

impl Document {
    fn new(is_final: bool) -> Self {
        Self {
            is_final,
            schema: None,
            records: vec![],
            header: vec![],
            row: None,
            field: None,
            text: String::new(),
        }
    }

    fn take_batch(&mut self) -> ResultBatch {
        ResultBatch {
            schema: self
                .schema
                .clone()
                .unwrap_or_else(|| Arc::new(Schema::empty())),
            records: mem::take(&mut self.records),
            is_final: self.is_final,
        }
    }
}

/// Decodes a stream of XML result documents into batches of records.
///
/// The input can be split at arbitrary positions. Decoding the same bytes
/// produces the same batches regardless of how they were split.
/// After the first error the decoder keeps returning that error.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    reader: XmlReader,
    tags: Vec<Tag>,
    document: Option<Document>,
    failure: Option<ResultsError>,
}

impl RecordDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk of input and returns the batches completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> ResultsResult<Vec<ResultBatch>> {
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        self.reader.push(bytes);
        let mut batches = vec![];
        match self.drain(&mut batches) {
            Ok(()) => Ok(batches),
            Err(e) => {
                self.failure = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Signals the end of input.
    /// Fails if the input ended inside a document.
    pub fn finish(mut self) -> ResultsResult<Vec<ResultBatch>> {
        let batches = self.feed(&[])?;
        self.reader.finish()?;
        if self.document.is_some() {
            return Err(ResultsError::incomplete("input ended inside a result set"));
        }
        Ok(batches)
    }

    fn drain(&mut self, batches: &mut Vec<ResultBatch>) -> ResultsResult<()> {
        while let Some(token) = self.reader.next_token()? {
            self.handle(token, batches)?;
        }
        Ok(())
    }

    fn handle(&mut self, token: XmlToken, batches: &mut Vec<ResultBatch>) -> ResultsResult<()> {
        let offset = token.offset;
        match &token.event {
            XmlEvent::Start { name, .. } => {
                let tag = Tag::child(self.tags.last().copied(), name);
                self.tags.push(tag);
                self.start(tag, &token)
            }
            XmlEvent::End { .. } => {
                let tag = self
                    .tags
                    .pop()
                    .ok_or_else(|| ResultsError::malformed(offset, "unbalanced end tag"))?;
                self.end(tag, offset, batches)
            }
            XmlEvent::Text(text) => {
                if let (Some(tag), Some(document)) = (self.tags.last(), self.document.as_mut()) {
                    if tag.collects_text() {
                        document.text.push_str(text);
                    }
                }
                Ok(())
            }
        }
    }

    fn start(&mut self, tag: Tag, token: &XmlToken) -> ResultsResult<()> {
        let offset = token.offset;
        let parent = self.tags.iter().rev().nth(1).copied();
        if tag == Tag::Results {
            let preview = matches!(token.attribute("preview"), Some("1" | "true"));
            self.document = Some(Document::new(!preview));
            return Ok(());
        }
        let Some(document) = self.document.as_mut() else {
            return Ok(());
        };
        match tag {
            Tag::FieldOrder => document.header.clear(),
            Tag::HeaderField | Tag::ValueText => document.text.clear(),
            Tag::RawValue if parent == Some(Tag::Field) => document.text.clear(),
            Tag::Result => {
                let Some(schema) = &document.schema else {
                    return Err(ResultsError::malformed(
                        offset,
                        "result row before field header",
                    ));
                };
                document.row = Some(vec![None; schema.len()]);
            }
            Tag::Field => {
                let Some(name) = token.attribute("k") else {
                    return Err(ResultsError::malformed(offset, "field without name"));
                };
                let index = document
                    .schema
                    .as_ref()
                    .and_then(|s| s.index_of(name))
                    .ok_or_else(|| {
                        ResultsError::malformed(
                            offset,
                            format!("field `{name}` is not declared in the header"),
                        )
                    })?;
                if matches!(document.row.as_ref().map(|r| &r[index]), Some(Some(_))) {
                    return Err(ResultsError::malformed(
                        offset,
                        format!("duplicate field `{name}`"),
                    ));
                }
                document.field = Some(FieldValues {
                    index,
                    values: vec![],
                });
            }
            Tag::Results | Tag::Meta | Tag::Value | Tag::RawValue | Tag::Other => {}
        }
        Ok(())
    }

    fn end(&mut self, tag: Tag, offset: u64, batches: &mut Vec<ResultBatch>) -> ResultsResult<()> {
        if tag == Tag::Results {
            if let Some(mut document) = self.document.take() {
                let batch = document.take_batch();
                trace!(
                    "decoded batch with {} records, final: {}",
                    batch.num_records(),
                    batch.is_final
                );
                batches.push(batch);
            }
            return Ok(());
        }
        let Some(document) = self.document.as_mut() else {
            return Ok(());
        };
        match tag {
            Tag::HeaderField => {
                let name = mem::take(&mut document.text).trim().to_string();
                if document.header.contains(&name) {
                    return Err(ResultsError::malformed(
                        offset,
                        format!("duplicate field `{name}` in header"),
                    ));
                }
                document.header.push(name);
            }
            Tag::FieldOrder => {
                let schema = Arc::new(Schema::new(mem::take(&mut document.header)));
                if document.schema.is_some() {
                    let batch = document.take_batch();
                    batches.push(batch);
                }
                document.schema = Some(schema);
            }
            Tag::ValueText => {
                if let Some(field) = document.field.as_mut() {
                    field.values.push(mem::take(&mut document.text));
                }
            }
            Tag::RawValue if self.tags.last() == Some(&Tag::Field) => {
                if let Some(field) = document.field.as_mut() {
                    field.values.push(mem::take(&mut document.text));
                }
            }
            Tag::Field => {
                if let (Some(field), Some(row)) = (document.field.take(), document.row.as_mut()) {
                    row[field.index] = Some(field.values.join(MULTI_VALUE_SEPARATOR));
                }
            }
            Tag::Result => {
                if let (Some(row), Some(schema)) = (document.row.take(), &document.schema) {
                    document.records.push(Record::new(schema.clone(), row));
                }
            }
            Tag::Results | Tag::Meta | Tag::Value | Tag::RawValue | Tag::Other => {}
        }
        Ok(())
    }
}
