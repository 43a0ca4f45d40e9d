use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::error::EngineError;
use crate::truncate::byte_index;

/// A document delivered as a stream of text pieces.
#[async_trait]
pub trait DocumentSource: Send {
    /// Display name recorded with the document.
    fn name(&self) -> &str;

    /// Where the text came from, if anywhere addressable.
    fn origin(&self) -> Option<String> {
        None
    }

    /// Next piece of text, `None` once the stream is exhausted.
    async fn next_piece(&mut self) -> Result<Option<String>, EngineError>;
}

/// In-memory text handed out in fixed-size char pieces.
pub struct TextSource {
    name: String,
    text: String,
    pos: usize,
    piece_chars: usize,
}

impl TextSource {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            pos: 0,
            piece_chars: 16 * 1024,
        }
    }

    pub fn with_piece_chars(mut self, piece_chars: usize) -> Self {
        self.piece_chars = piece_chars.max(1);
        self
    }
}

#[async_trait]
impl DocumentSource for TextSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_piece(&mut self) -> Result<Option<String>, EngineError> {
        if self.pos >= self.text.len() {
            return Ok(None);
        }
        let rest = &self.text[self.pos..];
        let end = byte_index(rest, self.piece_chars);
        self.pos += end;
        Ok(Some(rest[..end].to_string()))
    }
}

/// UTF-8 file read incrementally. A multi-byte sequence split across reads
/// is carried over to the next piece.
pub struct FileSource {
    name: String,
    path: PathBuf,
    file: tokio::fs::File,
    carry: Vec<u8>,
    read_size: usize,
    eof: bool,
}

impl FileSource {
    pub async fn open(path: &Path) -> Result<Self, EngineError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| EngineError::Source(format!("open {}: {e}", path.display())))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            name,
            path: path.to_owned(),
            file,
            carry: Vec::new(),
            read_size: 64 * 1024,
            eof: false,
        })
    }

    pub fn with_read_size(mut self, bytes: usize) -> Self {
        self.read_size = bytes.max(4);
        self
    }
}

#[async_trait]
impl DocumentSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn origin(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }

    async fn next_piece(&mut self) -> Result<Option<String>, EngineError> {
        let mut buf = vec![0u8; self.read_size];
        loop {
            if self.eof {
                if self.carry.is_empty() {
                    return Ok(None);
                }
                return Err(EngineError::Source(format!(
                    "{}: truncated UTF-8 sequence at end of file",
                    self.path.display()
                )));
            }

            let n = self
                .file
                .read(&mut buf)
                .await
                .map_err(|e| EngineError::Source(format!("read {}: {e}", self.path.display())))?;
            if n == 0 {
                self.eof = true;
                continue;
            }
            self.carry.extend_from_slice(&buf[..n]);

            let valid = match std::str::from_utf8(&self.carry) {
                Ok(_) => self.carry.len(),
                Err(e) if e.error_len().is_none() => e.valid_up_to(),
                Err(e) => {
                    return Err(EngineError::Source(format!(
                        "{}: invalid UTF-8 after byte {}",
                        self.path.display(),
                        e.valid_up_to()
                    )))
                }
            };
            if valid == 0 {
                continue;
            }
            let rest = self.carry.split_off(valid);
            let bytes = std::mem::replace(&mut self.carry, rest);
            let piece = String::from_utf8(bytes)
                .map_err(|e| EngineError::Internal(format!("utf-8 split: {e}")))?;
            return Ok(Some(piece));
        }
    }
}

/// Drain a source into one string. Used by callers that need the whole
/// text, e.g. for verification.
pub async fn read_to_string(source: &mut dyn DocumentSource) -> Result<String, EngineError> {
    let mut out = String::new();
    while let Some(piece) = source.next_piece().await? {
        out.push_str(&piece);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn text_source_pieces() {
        let mut src = TextSource::new("t", "abcdefg").with_piece_chars(3);
        assert_eq!(src.next_piece().await.unwrap().as_deref(), Some("abc"));
        assert_eq!(src.next_piece().await.unwrap().as_deref(), Some("def"));
        assert_eq!(src.next_piece().await.unwrap().as_deref(), Some("g"));
        assert_eq!(src.next_piece().await.unwrap(), None);
        assert_eq!(src.name(), "t");
    }

    #[tokio::test]
    async fn text_source_respects_char_boundaries() {
        let mut src = TextSource::new("t", "ééé").with_piece_chars(2);
        assert_eq!(src.next_piece().await.unwrap().as_deref(), Some("éé"));
        assert_eq!(src.next_piece().await.unwrap().as_deref(), Some("é"));
    }

    #[tokio::test]
    async fn empty_text_source() {
        let mut src = TextSource::new("t", "");
        assert_eq!(src.next_piece().await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_source_carries_split_sequences() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let text = "a€b€c€".repeat(50);
        file.write_all(text.as_bytes()).unwrap();

        // 5-byte reads split the 3-byte euro sign constantly.
        let mut src = FileSource::open(file.path()).await.unwrap().with_read_size(5);
        let out = read_to_string(&mut src).await.unwrap();
        assert_eq!(out, text);
        assert!(src.origin().is_some());
    }

    #[tokio::test]
    async fn file_source_rejects_invalid_utf8() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[b'o', b'k', 0xff, 0xfe]).unwrap();
        let mut src = FileSource::open(file.path()).await.unwrap();
        assert!(matches!(
            read_to_string(&mut src).await,
            Err(EngineError::Source(_))
        ));
    }

    #[tokio::test]
    async fn missing_file_is_source_error() {
        let err = FileSource::open(Path::new("/nonexistent/arbor/doc.txt"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Source(_)));
    }
}
