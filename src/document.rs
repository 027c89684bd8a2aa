//! Documents as the indexing core sees them.
//!
//! Analysis happens before a document reaches the core, so text fields arrive
//! as ready-made token streams. A [`Field`] carries one value plus the options
//! that decide which stages of the indexing chain consume it.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Document number inside one segment or one composite doc-id space.
pub type DocId = i32;

/// Hard upper bound on documents in any doc-id space.
pub const MAX_DOCS: DocId = i32::MAX - 128;

/// A term: a field name plus the raw term bytes. Orders by field, then bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub bytes: Vec<u8>,
}

impl Term {
    pub fn new<F: Into<String>, B: AsRef<[u8]>>(field: F, bytes: B) -> Self {
        Term {
            field: field.into(),
            bytes: bytes.as_ref().to_vec(),
        }
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    /// Approximate heap footprint, used for RAM accounting of buffered deletes.
    pub fn ram_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.field.len() + self.bytes.len()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text())
    }
}

/// One token produced by analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub text: String,
    /// Distance from the previous token; 0 stacks tokens on one position.
    pub position_increment: u32,
}

impl Token {
    pub fn new<S: Into<String>>(text: S) -> Self {
        Token {
            text: text.into(),
            position_increment: 1,
        }
    }

    pub fn with_position_increment(mut self, increment: u32) -> Self {
        self.position_increment = increment;
        self
    }
}

/// How much posting detail an indexed field records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexOptions {
    Docs,
    DocsAndFreqs,
    DocsAndFreqsAndPositions,
}

impl IndexOptions {
    pub fn has_freqs(self) -> bool {
        self >= IndexOptions::DocsAndFreqs
    }

    pub fn has_positions(self) -> bool {
        self >= IndexOptions::DocsAndFreqsAndPositions
    }
}

/// A stored (retrievable) value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoredValue {
    Text(String),
    Binary(Vec<u8>),
    Integer(i64),
    Float(f64),
}

/// The value a field carries into the indexing chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Analyzed text, inverted into postings.
    Tokens(Vec<Token>),
    /// A single untokenized term, inverted into postings.
    Keyword(String),
    /// A per-document numeric value.
    Numeric(i64),
    /// A per-document binary value.
    Binary(Vec<u8>),
    /// A value that is only stored.
    Stored(StoredValue),
}

/// A named field of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
    pub index_options: IndexOptions,
    pub omit_norms: bool,
    /// Also store this value for retrieval.
    pub stored: Option<StoredValue>,
}

impl Field {
    fn with_value<S: Into<String>>(name: S, value: FieldValue) -> Self {
        Field {
            name: name.into(),
            value,
            index_options: IndexOptions::DocsAndFreqsAndPositions,
            omit_norms: false,
            stored: None,
        }
    }

    pub fn tokens<S, I, T>(name: S, tokens: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let tokens = tokens.into_iter().map(Token::new).collect();
        Self::with_value(name, FieldValue::Tokens(tokens))
    }

    pub fn token_stream<S: Into<String>>(name: S, tokens: Vec<Token>) -> Self {
        Self::with_value(name, FieldValue::Tokens(tokens))
    }

    pub fn keyword<S: Into<String>, V: Into<String>>(name: S, value: V) -> Self {
        let mut field = Self::with_value(name, FieldValue::Keyword(value.into()));
        field.index_options = IndexOptions::Docs;
        field.omit_norms = true;
        field
    }

    pub fn numeric_doc_value<S: Into<String>>(name: S, value: i64) -> Self {
        Self::with_value(name, FieldValue::Numeric(value))
    }

    pub fn binary_doc_value<S: Into<String>>(name: S, value: Vec<u8>) -> Self {
        Self::with_value(name, FieldValue::Binary(value))
    }

    pub fn stored<S: Into<String>>(name: S, value: StoredValue) -> Self {
        Self::with_value(name, FieldValue::Stored(value))
    }

    pub fn with_index_options(mut self, options: IndexOptions) -> Self {
        self.index_options = options;
        self
    }

    pub fn omit_norms(mut self) -> Self {
        self.omit_norms = true;
        self
    }

    pub fn store(mut self, value: StoredValue) -> Self {
        self.stored = Some(value);
        self
    }

    /// Whether this field is inverted into postings.
    pub fn is_indexed(&self) -> bool {
        matches!(self.value, FieldValue::Tokens(_) | FieldValue::Keyword(_))
    }

    /// The value to hand to the stored-fields stage, if any.
    pub fn stored_value(&self) -> Option<&StoredValue> {
        match &self.value {
            FieldValue::Stored(value) => Some(value),
            _ => self.stored.as_ref(),
        }
    }
}

/// An ordered list of fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub fields: Vec<Field>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::default()
    }

    pub fn add(&mut self, field: Field) {
        self.fields.push(field);
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
}

/// Builder for [`Document`].
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    pub fn add_field(mut self, field: Field) -> Self {
        self.document.add(field);
        self
    }

    pub fn add_tokens<S, I, T>(self, name: S, tokens: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.add_field(Field::tokens(name, tokens))
    }

    pub fn add_keyword<S: Into<String>, V: Into<String>>(self, name: S, value: V) -> Self {
        self.add_field(Field::keyword(name, value))
    }

    pub fn add_numeric<S: Into<String>>(self, name: S, value: i64) -> Self {
        self.add_field(Field::numeric_doc_value(name, value))
    }

    pub fn add_binary<S: Into<String>>(self, name: S, value: Vec<u8>) -> Self {
        self.add_field(Field::binary_doc_value(name, value))
    }

    pub fn add_stored<S: Into<String>>(self, name: S, value: StoredValue) -> Self {
        self.add_field(Field::stored(name, value))
    }

    pub fn build(self) -> Document {
        self.document
    }
}
