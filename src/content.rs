//! File content for the memory index.
//!
//! A filesystem event is embedded together with what the file says, not
//! only its path. Plain text is read as UTF-8; PDF goes through
//! `pdf-extract` and DOCX through `zip` + `quick-xml`. Anything else
//! (binaries, unknown formats, files over the size limit) contributes no
//! content and is indexed by its event text alone.
//!
//! The extracted text yields:
//!
//! - an excerpt of the first [`EXCERPT_CHARS`] characters, stored with the
//!   index entry and shown next to the event in retrieved context;
//! - overlapping chunks of [`CHUNK_CHARS`] characters, [`CHUNK_OVERLAP`]
//!   of them shared with the previous chunk. The indexer embeds each chunk
//!   and averages the vectors into the entry's single embedding.
//!
//! Content is read when the event is indexed, so it reflects the file at
//! that moment rather than at the time of the change.

use std::io::Read;
use std::path::Path;

use tracing::debug;

pub const EXCERPT_CHARS: usize = 800;
pub const CHUNK_CHARS: usize = 1200;
pub const CHUNK_OVERLAP: usize = 200;

/// Decompressed size limit for the DOCX body (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ContentLimits {
    /// Larger files are not read.
    pub max_file_bytes: u64,
    /// Chunks past this many are dropped.
    pub max_chunks: usize,
}

/// Text extracted from one file, ready to embed.
#[derive(Debug, Clone, PartialEq)]
pub struct FileContent {
    pub excerpt: String,
    pub chunks: Vec<String>,
}

impl FileContent {
    pub fn from_text(text: &str, max_chunks: usize) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let mut chunks = chunk_text(text, CHUNK_CHARS, CHUNK_OVERLAP);
        chunks.truncate(max_chunks.max(1));
        Some(Self {
            excerpt: excerpt(text),
            chunks,
        })
    }
}

/// Read and extract `path`. `Ok(None)` means the file has nothing to index.
pub fn read_file_content(
    path: &Path,
    limits: &ContentLimits,
) -> Result<Option<FileContent>, ExtractError> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_file() {
        return Ok(None);
    }
    if meta.len() > limits.max_file_bytes {
        debug!(path = %path.display(), bytes = meta.len(), "file too large for content indexing");
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let text = match extension.as_str() {
        "pdf" => extract_pdf(&bytes)?,
        "docx" => extract_docx(&bytes)?,
        _ => match decode_text(bytes) {
            Some(text) => text,
            None => return Ok(None),
        },
    };
    Ok(FileContent::from_text(&text, limits.max_chunks))
}

/// UTF-8 without NUL bytes counts as text.
fn decode_text(bytes: Vec<u8>) -> Option<String> {
    if bytes.contains(&0) {
        return None;
    }
    String::from_utf8(bytes).ok()
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let mut xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    docx_text(&xml)
}

/// Concatenate `<w:t>` runs, one line per `<w:p>` paragraph.
fn docx_text(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(t)) if in_text => {
                out.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

/// The first [`EXCERPT_CHARS`] characters, with an ellipsis when cut.
pub fn excerpt(text: &str) -> String {
    match text.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

/// Split `text` into windows of `size` characters, each starting
/// `size - overlap` characters after the previous one. The last window
/// ends at the end of the text.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let chars = bounds.len() - 1;
    if chars == 0 || size == 0 {
        return Vec::new();
    }
    let step = size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + size).min(chars);
        chunks.push(text[bounds[start]..bounds[end]].to_string());
        if end == chars {
            break;
        }
        start += step;
    }
    chunks
}
