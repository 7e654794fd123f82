//! Multi-document manifest parsing
//!
//! A file is split on lines consisting solely of `---`; each segment is
//! decoded independently and the outcome collected per document, so one
//! malformed document never hides its siblings.

use std::ops::Range;

use crate::codec::{KubeObject, ObjectCodec, is_blank_document};
use crate::report::DecodeIssue;

/// YAML document separator line
pub const YAML_DELIMITER: &str = "---";

/// One raw document inside a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument<'a> {
    /// Position among all segments of the file, blank ones included
    pub index: usize,
    pub bytes: Range<usize>,
    pub content: &'a [u8],
}

/// A successfully decoded document
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub index: usize,
    pub object: KubeObject,
}

/// Everything the parser learned about one file
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub documents: Vec<ParsedDocument>,
    pub errors: Vec<DecodeIssue>,
}

impl ParsedFile {
    /// Whether at least one document decoded into a Kubernetes object
    pub fn has_manifests(&self) -> bool {
        !self.documents.is_empty()
    }
}

/// Split raw bytes on `---` separator lines
pub fn split_documents(content: &[u8]) -> Vec<RawDocument<'_>> {
    let mut documents = Vec::new();
    let mut start = 0;
    let mut line_start = 0;

    while line_start < content.len() {
        let line_end = content[line_start..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|pos| line_start + pos)
            .unwrap_or(content.len());

        if is_delimiter(&content[line_start..line_end]) {
            documents.push(RawDocument {
                index: documents.len(),
                bytes: start..line_start,
                content: &content[start..line_start],
            });
            start = (line_end + 1).min(content.len());
        }
        line_start = line_end + 1;
    }

    documents.push(RawDocument {
        index: documents.len(),
        bytes: start..content.len(),
        content: &content[start..],
    });
    documents
}

fn is_delimiter(line: &[u8]) -> bool {
    let mut end = line.len();
    while end > 0 && line[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    &line[..end] == YAML_DELIMITER.as_bytes()
}

/// Decode every document of a file
pub fn parse_file(path: &str, content: &[u8], codec: &dyn ObjectCodec) -> ParsedFile {
    let outcomes = split_documents(content)
        .into_iter()
        .filter(|doc| {
            std::str::from_utf8(doc.content)
                .map(|text| !is_blank_document(text))
                .unwrap_or(true)
        })
        .map(|doc| {
            let result = codec.decode(doc.content);
            (doc, result)
        });

    let mut parsed = ParsedFile::default();
    for (doc, result) in outcomes {
        match result {
            Ok(Some(object)) => {
                tracing::debug!(
                    path,
                    index = doc.index,
                    object = %object.display_name(),
                    "manifest found"
                );
                parsed.documents.push(ParsedDocument {
                    index: doc.index,
                    object,
                });
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(path, index = doc.index, error = %err, "unable to decode document");
                parsed.errors.push(DecodeIssue {
                    path: path.to_string(),
                    index: doc.index,
                    bytes: doc.bytes,
                    message: err.message,
                });
            }
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::KubeCodec;

    const CONFIGMAP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  key: value\n";
    const SERVICE: &str = "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\nspec:\n  ports:\n    - port: 80\n";

    #[test]
    fn test_split_single_document() {
        let docs = split_documents(b"a: 1\n");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].content, b"a: 1\n");
        assert_eq!(docs[0].bytes, 0..5);
    }

    #[test]
    fn test_split_on_delimiter_lines_only() {
        let content = b"a: 1\n---\nb: \"---\"\n--- \nc: 3";
        let docs = split_documents(content);
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].content, b"a: 1\n");
        assert_eq!(docs[1].content, b"b: \"---\"\n");
        assert_eq!(docs[2].content, b"c: 3");
        assert_eq!(&content[docs[2].bytes.clone()], b"c: 3");
    }

    #[test]
    fn test_split_leading_and_trailing_delimiter() {
        let docs = split_documents(b"---\na: 1\n---\n");
        assert_eq!(docs.len(), 3);
        assert!(docs[0].content.is_empty());
        assert_eq!(docs[1].index, 1);
        assert_eq!(docs[1].content, b"a: 1\n");
        assert!(docs[2].content.is_empty());
    }

    #[test]
    fn test_split_crlf_delimiter() {
        let docs = split_documents(b"a: 1\r\n---\r\nb: 2\r\n");
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].content, b"b: 2\r\n");
    }

    #[test]
    fn test_three_documents_second_malformed() {
        let content = format!("{}---\nkind: [broken\n---\n{}", CONFIGMAP, SERVICE);
        let parsed = parse_file("app.yaml", content.as_bytes(), &KubeCodec);

        assert_eq!(parsed.documents.len(), 2);
        assert_eq!(parsed.errors.len(), 1);

        let kinds: Vec<_> = parsed.documents.iter().map(|d| d.object.kind()).collect();
        assert_eq!(kinds, vec!["ConfigMap", "Service"]);
        assert_eq!(parsed.documents[1].index, 2);

        let error = &parsed.errors[0];
        assert_eq!(error.path, "app.yaml");
        assert_eq!(error.index, 1);
        assert_eq!(&content.as_bytes()[error.bytes.clone()], b"kind: [broken\n");
    }

    #[test]
    fn test_comment_only_documents_are_skipped() {
        let content = format!("# header comment\n---\n{}---\n\n   \n", CONFIGMAP);
        let parsed = parse_file("cm.yaml", content.as_bytes(), &KubeCodec);
        assert_eq!(parsed.documents.len(), 1);
        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.documents[0].index, 1);
    }

    #[test]
    fn test_non_kubernetes_yaml_is_recorded() {
        let parsed = parse_file("values.yaml", b"replicas: 3\n", &KubeCodec);
        assert!(!parsed.has_manifests());
        assert_eq!(parsed.errors.len(), 1);
    }
}
