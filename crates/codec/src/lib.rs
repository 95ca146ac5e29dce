//! kubeguard codec: parse and serialize multi-document YAML resource streams.
//!
//! Documents are separated by `---` lines. Empty and comment-only documents
//! are skipped; the first document that fails to decode aborts the parse with
//! a [`ParseError`] carrying its exact bytes.

#![forbid(unsafe_code)]

pub mod convert;
pub mod stream;

use std::io::{self, BufReader, Read, Write};

use kube::core::DynamicObject;
use kubeguard_core::{DecodeTarget, EncodeOptions, Object, Registry, RegistryError, Scheme};
use metrics::counter;
use tracing::debug;

pub use convert::{to_client_objects, to_dynamic, to_typed, ConversionError};
pub use stream::DocumentReader;

/// Written before every document but the first.
pub const DOCUMENT_SEPARATOR: &[u8] = b"---\n";

/// A document that could not be decoded, with the bytes that caused it.
#[derive(Debug, thiserror::Error)]
#[error("error parsing data {}: {source}", String::from_utf8_lossy(.data))]
pub struct ParseError {
    pub data: Vec<u8>,
    #[source]
    pub source: RegistryError,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error("encoding object: {0}")]
    Encode(#[from] RegistryError),
    #[error("document stream: {0}")]
    Io(#[from] io::Error),
}

/// Parse every document of `reader`.
///
/// A typed prototype decodes each document into a fresh value of the same
/// concrete type; no prototype or a dynamic one yields dynamic objects.
pub fn parse_objects<R: Read>(
    reader: R,
    registry: &dyn Registry,
    prototype: Option<&Object>,
) -> Result<Vec<Object>, CodecError> {
    let target = match prototype {
        Some(Object::Typed(proto)) => DecodeTarget::Like(proto),
        Some(Object::Dynamic(_)) | None => DecodeTarget::Dynamic,
    };
    parse_with(reader, registry, target)
}

/// Parse every document into the registered type named by its header.
pub fn parse_registered<R: Read>(reader: R, registry: &dyn Registry) -> Result<Vec<Object>, CodecError> {
    parse_with(reader, registry, DecodeTarget::Registered)
}

/// Parse every document as a [`DynamicObject`].
pub fn parse_dynamic<R: Read>(reader: R) -> Result<Vec<DynamicObject>, CodecError> {
    let objects = parse_with(reader, &Scheme::new(), DecodeTarget::Dynamic)?;
    objects
        .into_iter()
        .map(|o| {
            o.into_dynamic()
                .map_err(|o| ConversionError::NotDynamic { type_name: o.type_name() }.into())
        })
        .collect()
}

fn parse_with<R: Read>(reader: R, registry: &dyn Registry, target: DecodeTarget<'_>) -> Result<Vec<Object>, CodecError> {
    let mut objects = Vec::new();
    let mut docs = DocumentReader::new(BufReader::new(reader));
    while let Some(chunk) = docs.read_document()? {
        let data = stream::strip_delimiters(&chunk);
        if stream::is_comment_only(data) {
            counter!("codec_documents_skipped", 1u64);
            continue;
        }
        match registry.decode(data, target) {
            Ok(obj) => {
                debug!(kind = ?obj.types().map(|t| t.kind), name = ?obj.name(), "parsed document");
                objects.push(obj);
            }
            Err(source) => {
                counter!("codec_parse_errors", 1u64);
                return Err(ParseError { data: data.to_vec(), source }.into());
            }
        }
    }
    counter!("codec_documents_parsed", objects.len() as u64);
    Ok(objects)
}

/// Write `objects` as a `---`-separated YAML stream.
///
/// Any error leaves the writer holding an invalid stream.
pub fn serialize_objects<W: Write>(registry: &dyn Registry, mut writer: W, objects: &[Object]) -> Result<(), CodecError> {
    let opts = EncodeOptions::canonical_yaml();
    for (i, obj) in objects.iter().enumerate() {
        if i > 0 {
            writer.write_all(DOCUMENT_SEPARATOR)?;
        }
        let doc = registry.encode(obj, &opts)?;
        writer.write_all(&doc)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn serialize_to_string(registry: &dyn Registry, objects: &[Object]) -> Result<String, CodecError> {
    let mut out = Vec::new();
    serialize_objects(registry, &mut out, objects)?;
    // serde_yaml only emits UTF-8
    Ok(String::from_utf8_lossy(&out).into_owned())
}
