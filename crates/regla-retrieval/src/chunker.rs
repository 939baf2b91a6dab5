//! Heading-aware chunking of regulation text.
//!
//! Recognizes markdown `#` headings and the structural headings used in
//! regulation volumes (`TOMO`, `CAPÍTULO`, `SECCIÓN`, `ARTÍCULO`, `REGLA`),
//! keeps a heading stack to build `heading_path`, tracks pages through form
//! feeds and `Página N` marker lines, and packs paragraphs into chunks of at
//! most `max_chars` characters.

use regla_core::{Chunk, ChunkMeta};
use sha2::{Digest, Sha256};

/// Lower bound applied to `max_chars`.
const MIN_CHARS: usize = 200;

/// Longest line still considered a heading.
const MAX_HEADING_CHARS: usize = 160;

/// Split one document into chunks.
///
/// `chunk_id`s are derived from `doc_id`, the chunk's ordinal and its text,
/// so re-chunking an unchanged document yields the same ids.
///
/// # Examples
///
/// ```
/// use regla_retrieval::chunker::chunk_document;
///
/// let text = "CAPÍTULO 5\nRegla 5.1 Permisos\nTodo permiso requiere solicitud.";
/// let chunks = chunk_document("tomo-2", text, 1800);
/// assert_eq!(chunks.len(), 1);
/// assert_eq!(chunks[0].meta.heading_path, "CAPÍTULO 5 > Regla 5.1 Permisos");
/// ```
pub fn chunk_document(doc_id: &str, content: &str, max_chars: usize) -> Vec<Chunk> {
    let mut builder = Builder::new(doc_id, max_chars.max(MIN_CHARS));
    let mut headings: Vec<(usize, String)> = Vec::new();
    let mut paragraph = String::new();
    let mut paragraph_page = 1u32;
    let mut page = 1u32;

    for raw_line in content.lines() {
        let feeds = raw_line.matches('\u{c}').count() as u32;
        if feeds > 0 {
            finish_paragraph(&mut builder, &mut paragraph, paragraph_page, page);
            page += feeds;
        }
        let line = raw_line.replace('\u{c}', "");
        let trimmed = line.trim();

        if let Some(number) = page_marker(trimmed) {
            finish_paragraph(&mut builder, &mut paragraph, paragraph_page, page);
            page = number;
            continue;
        }

        if let Some((level, title)) = heading(trimmed) {
            finish_paragraph(&mut builder, &mut paragraph, paragraph_page, page);
            builder.flush();
            while headings.last().is_some_and(|(l, _)| *l >= level) {
                headings.pop();
            }
            headings.push((level, title));
            builder.heading_path = headings
                .iter()
                .map(|(_, t)| t.as_str())
                .collect::<Vec<_>>()
                .join(" > ");
            continue;
        }

        if trimmed.is_empty() {
            finish_paragraph(&mut builder, &mut paragraph, paragraph_page, page);
            continue;
        }

        if paragraph.is_empty() {
            paragraph_page = page;
        } else {
            paragraph.push('\n');
        }
        paragraph.push_str(trimmed);
    }

    finish_paragraph(&mut builder, &mut paragraph, paragraph_page, page);
    builder.flush();
    builder.chunks
}

fn finish_paragraph(builder: &mut Builder<'_>, paragraph: &mut String, first: u32, last: u32) {
    if !paragraph.is_empty() {
        builder.add_paragraph(paragraph, first, last);
        paragraph.clear();
    }
}

struct Builder<'a> {
    doc_id: &'a str,
    max_chars: usize,
    heading_path: String,
    chunks: Vec<Chunk>,
    text: String,
    text_chars: usize,
    page_start: Option<u32>,
    page_end: Option<u32>,
}

impl<'a> Builder<'a> {
    fn new(doc_id: &'a str, max_chars: usize) -> Self {
        Self {
            doc_id,
            max_chars,
            heading_path: String::new(),
            chunks: Vec::new(),
            text: String::new(),
            text_chars: 0,
            page_start: None,
            page_end: None,
        }
    }

    fn add_paragraph(&mut self, paragraph: &str, first: u32, last: u32) {
        let len = paragraph.chars().count();
        if len > self.max_chars {
            self.flush();
            for piece in split_long(paragraph, self.max_chars) {
                self.append(&piece, first, last);
                self.flush();
            }
            return;
        }
        if self.text_chars > 0 && self.text_chars + 2 + len > self.max_chars {
            self.flush();
        }
        self.append(paragraph, first, last);
    }

    fn append(&mut self, paragraph: &str, first: u32, last: u32) {
        if !self.text.is_empty() {
            self.text.push_str("\n\n");
            self.text_chars += 2;
        }
        self.text.push_str(paragraph);
        self.text_chars += paragraph.chars().count();
        self.page_start.get_or_insert(first);
        self.page_end = Some(last);
    }

    fn flush(&mut self) {
        let text = std::mem::take(&mut self.text);
        let page_start = self.page_start.take();
        let page_end = self.page_end.take();
        self.text_chars = 0;
        if text.trim().is_empty() {
            return;
        }

        let ordinal = self.chunks.len();
        let heading_path = if self.heading_path.is_empty() {
            self.doc_id.to_string()
        } else {
            self.heading_path.clone()
        };
        self.chunks.push(Chunk {
            meta: ChunkMeta {
                chunk_id: chunk_id(self.doc_id, ordinal, &text),
                doc_id: self.doc_id.to_string(),
                heading_path,
                page_start,
                page_end,
            },
            text,
        });
    }
}

/// Break an oversized paragraph at whitespace into pieces of at most
/// `max_chars` characters. A single word longer than that stands alone.
fn split_long(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0;
    for word in paragraph.split_whitespace() {
        let len = word.chars().count();
        if current_chars > 0 && current_chars + 1 + len > max_chars {
            pieces.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if current_chars > 0 {
            current.push(' ');
            current_chars += 1;
        }
        current.push_str(word);
        current_chars += len;
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Recognize a heading line, returning its nesting level and title.
fn heading(line: &str) -> Option<(usize, String)> {
    if line.is_empty() || line.chars().count() > MAX_HEADING_CHARS {
        return None;
    }

    if line.starts_with('#') {
        let level = line.chars().take_while(|c| *c == '#').count();
        let title = line[level..].trim();
        if level <= 6 && !title.is_empty() && line[level..].starts_with(' ') {
            return Some((level, title.to_string()));
        }
        return None;
    }

    let mut words = line.split_whitespace();
    let first = words.next()?.to_lowercase();
    let second = words.next()?;
    let level = match first.trim_end_matches(['.', ':']) {
        "tomo" => 1,
        "capítulo" | "capitulo" => 2,
        "subcapítulo" | "subcapitulo" | "sección" | "seccion" => 3,
        "artículo" | "articulo" | "regla" => 4,
        _ => return None,
    };
    if !is_heading_number(second) {
        return None;
    }
    Some((level, line.to_string()))
}

/// `5`, `5.1`, `12-A`, `IV`, `IV.` all qualify.
fn is_heading_number(token: &str) -> bool {
    let token = token.trim_end_matches(['.', ':', ',', '-']);
    if token.is_empty() {
        return false;
    }
    token.starts_with(|c: char| c.is_ascii_digit())
        || token
            .chars()
            .all(|c| matches!(c, 'I' | 'V' | 'X' | 'L' | 'C' | 'D' | 'M'))
}

/// `Página 12`, `--- Page 3 ---`, `[Pág. 7]` → page number.
fn page_marker(line: &str) -> Option<u32> {
    let inner = line.trim_matches(|c: char| matches!(c, '-' | '=' | '[' | ']') || c.is_whitespace());
    let lower = inner.to_lowercase();
    let rest = ["página", "pagina", "pág.", "pag.", "page"]
        .iter()
        .find_map(|prefix| lower.strip_prefix(prefix))?;
    let number = rest.trim();
    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    number.parse().ok()
}

fn chunk_id(doc_id: &str, ordinal: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(ordinal.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}
