//! Splitting of `---`-delimited document streams.

use std::io::{self, BufRead};

const DELIMITER: &[u8] = b"---";

/// Reads raw documents from a multi-document YAML stream.
///
/// A delimiter is a line starting with `---` followed by optional whitespace
/// and an optional `#` comment.
/// Delimiter lines never appear in a returned chunk and consecutive
/// delimiters yield no empty chunk.
pub struct DocumentReader<R> {
    reader: R,
}

impl<R: BufRead> DocumentReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Next raw chunk, `None` once the stream is exhausted.
    pub fn read_document(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            if self.reader.read_until(b'\n', &mut line)? == 0 {
                return Ok(if buf.is_empty() { None } else { Some(buf) });
            }
            if is_delimiter(&line) {
                if !buf.is_empty() {
                    return Ok(Some(buf));
                }
                continue;
            }
            buf.extend_from_slice(&line);
        }
    }
}

impl<R: BufRead> Iterator for DocumentReader<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_document().transpose()
    }
}

fn is_delimiter(line: &[u8]) -> bool {
    let Some(after) = line.strip_prefix(DELIMITER) else {
        return false;
    };
    let rest = after.trim_ascii();
    // `--- #` needs the space; `---#x` is a scalar
    rest.is_empty() || (rest.starts_with(b"#") && after.first().is_some_and(u8::is_ascii_whitespace))
}

/// Drop leading delimiter markers from a chunk.
pub fn strip_delimiters(mut data: &[u8]) -> &[u8] {
    while let Some(rest) = data.strip_prefix(DELIMITER) {
        data = rest;
    }
    data
}

/// True when every line is blank or a `#` comment.
pub fn is_comment_only(data: &[u8]) -> bool {
    data.split(|b| *b == b'\n').all(|line| {
        let line = line.trim_ascii();
        line.is_empty() || line.starts_with(b"#")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(input: &str) -> Vec<String> {
        DocumentReader::new(input.as_bytes())
            .map(|c| String::from_utf8(c.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn splits_on_delimiter_lines_only() {
        let out = chunks("a: 1\n---\nb: 2\n---   \nc: 3");
        assert_eq!(out, vec!["a: 1\n", "b: 2\n", "c: 3"]);
    }

    #[test]
    fn consecutive_delimiters_yield_nothing() {
        assert!(chunks("---\n---\n\n---\n").iter().all(|c| c.trim().is_empty()));
        assert!(chunks("---\n---\n").is_empty());
        assert!(chunks("").is_empty());
    }

    #[test]
    fn inline_dashes_are_not_delimiters() {
        let out = chunks("a: ---\n----\n---x\nb: 2\n");
        assert_eq!(out, vec!["a: ---\n----\n---x\nb: 2\n"]);
    }

    #[test]
    fn delimiters_may_carry_a_comment() {
        let out = chunks("a: 1\n--- # second\nb: 2\n---\t#third\nc: 3\n---#not\n");
        assert_eq!(out, vec!["a: 1\n", "b: 2\n", "c: 3\n---#not\n"]);
    }

    #[test]
    fn strips_leading_markers() {
        assert_eq!(strip_delimiters(b"------a: 1"), b"a: 1");
        assert_eq!(strip_delimiters(b"- item"), b"- item");
    }

    #[test]
    fn comment_only_detection() {
        assert!(is_comment_only(b""));
        assert!(is_comment_only(b"\n\n"));
        assert!(is_comment_only(b"# some comment\n"));
        assert!(is_comment_only(b"   # indented\n\t\n# other/file.yaml"));
        assert!(!is_comment_only(b"# comment\nkind: Pod\n"));
    }
}
