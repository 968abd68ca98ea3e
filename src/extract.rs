//! Text extraction for remote documents.
//!
//! Parsers are an explicit ordered chain of `(predicate, parse)` pairs
//! tried in order against the object key's extension. The final entry is a
//! best-effort generic parser that matches everything and fails closed to
//! empty output instead of raising, so an unknown format never aborts a
//! sync pass. The caller treats empty output as "nothing to index".

use std::io::Read;

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb bound).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Extraction failure from a matched parser.
#[derive(Debug)]
pub enum ExtractError {
    Pdf(String),
    Ooxml(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Ooxml(e) => write!(f, "OOXML extraction failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// One entry in the parser chain.
struct Parser {
    name: &'static str,
    matches: fn(&str) -> bool,
    parse: fn(&[u8]) -> Result<String, ExtractError>,
}

/// The chain, in match order. The trailing generic entry matches every key.
const PARSERS: &[Parser] = &[
    Parser {
        name: "pdf",
        matches: |ext| ext == "pdf",
        parse: extract_pdf,
    },
    Parser {
        name: "plain-text",
        matches: |ext| {
            matches!(
                ext,
                "txt" | "md" | "markdown" | "text" | "csv" | "log" | "json" | "yaml" | "yml"
                    | "rst" | "html" | "htm"
            )
        },
        parse: extract_utf8,
    },
    Parser {
        name: "slides",
        matches: |ext| ext == "ppt" || ext == "pptx",
        parse: extract_pptx,
    },
    Parser {
        name: "word",
        matches: |ext| ext == "docx",
        parse: extract_docx,
    },
    Parser {
        name: "generic",
        matches: |_| true,
        parse: extract_generic,
    },
];

/// Extract plain text from `bytes`, selecting the parser from `key`'s
/// extension. Empty output is a valid terminal state meaning the source
/// yielded no indexable text.
pub fn extract_text(key: &str, bytes: &[u8]) -> Result<String, ExtractError> {
    let ext = extension(key);
    let parser = PARSERS
        .iter()
        .find(|p| (p.matches)(&ext))
        .unwrap_or_else(|| &PARSERS[PARSERS.len() - 1]);
    let text = (parser.parse)(bytes)?;
    Ok(text.trim().to_string())
}

/// Name of the chain entry that would handle `key` (for logging).
pub fn parser_name(key: &str) -> &'static str {
    let ext = extension(key);
    PARSERS
        .iter()
        .find(|p| (p.matches)(&ext))
        .map(|p| p.name)
        .unwrap_or("generic")
}

fn extension(key: &str) -> String {
    match key.rsplit('.').next() {
        Some(ext) if ext.len() < key.len() => ext.to_ascii_lowercase(),
        _ => String::new(),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_utf8(bytes: &[u8]) -> Result<String, ExtractError> {
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// PPTX: concatenate the `a:t` runs of every slide, in slide order.
fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("ppt/slides/slide") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    let mut out = String::new();
    for name in slide_names {
        let xml = read_zip_entry_bounded(&mut archive, &name)?;
        let text = text_runs(&xml)?;
        if !out.is_empty() && !text.is_empty() {
            out.push('\n');
        }
        out.push_str(&text);
    }
    Ok(out)
}

/// DOCX: the `w:t` runs of `word/document.xml`.
fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml")?;
    text_runs(&xml)
}

/// Best-effort parser for unknown extensions: OOXML container first, then
/// lossy UTF-8 if the bytes look textual. Never errors.
fn extract_generic(bytes: &[u8]) -> Result<String, ExtractError> {
    if let Ok(text) = extract_pptx(bytes) {
        if !text.trim().is_empty() {
            return Ok(text);
        }
    }
    if let Ok(text) = extract_docx(bytes) {
        if !text.trim().is_empty() {
            return Ok(text);
        }
    }
    if looks_textual(bytes) {
        return extract_utf8(bytes);
    }
    Ok(String::new())
}

/// Heuristic: treat the payload as text when it has no NUL bytes and is
/// mostly valid UTF-8.
fn looks_textual(bytes: &[u8]) -> bool {
    if bytes.is_empty() || bytes.contains(&0) {
        return false;
    }
    let sample = &bytes[..bytes.len().min(4096)];
    match std::str::from_utf8(sample) {
        Ok(_) => true,
        // A multi-byte char may be cut at the sample edge.
        Err(e) => e.valid_up_to() + 4 >= sample.len(),
    }
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::Ooxml(e.to_string()))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Collect the character content of every `t` element (local name) in an
/// OOXML part. Covers both `w:t` (WordprocessingML) and `a:t` (DrawingML).
fn text_runs(xml: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                in_t = e.local_name().as_ref() == b"t";
            }
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = false;
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(ExtractError::Ooxml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_with_text(phrase: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            let xml = format!(
                "<?xml version=\"1.0\"?><w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\"><w:body><w:p><w:r><w:t>{}</w:t></w:r></w:p></w:body></w:document>",
                phrase
            );
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    fn pptx_with_slides(slides: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (i, phrase) in slides.iter().enumerate() {
                zip.start_file(
                    format!("ppt/slides/slide{}.xml", i + 1),
                    zip::write::SimpleFileOptions::default(),
                )
                .unwrap();
                let xml = format!(
                    "<?xml version=\"1.0\"?><p:sld xmlns:a=\"http://schemas.openxmlformats.org/drawingml/2006/main\"><a:p><a:r><a:t>{}</a:t></a:r></a:p></p:sld>",
                    phrase
                );
                zip.write_all(xml.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    #[test]
    fn plain_text_passes_through() {
        let text = extract_text("notes/readme.txt", b"hello world").unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn docx_text_runs_extracted() {
        let bytes = docx_with_text("quarterly report body");
        let text = extract_text("reports/q3.docx", &bytes).unwrap();
        assert_eq!(text, "quarterly report body");
    }

    #[test]
    fn pptx_slides_in_order() {
        let bytes = pptx_with_slides(&["intro slide", "closing slide"]);
        let text = extract_text("decks/talk.pptx", &bytes).unwrap();
        assert_eq!(text, "intro slide\nclosing slide");
    }

    #[test]
    fn invalid_pdf_is_an_error() {
        assert!(extract_text("broken.pdf", b"not a pdf").is_err());
    }

    #[test]
    fn unknown_extension_falls_back_to_text() {
        let text = extract_text("misc/data.unknown", b"plain enough content").unwrap();
        assert_eq!(text, "plain enough content");
    }

    #[test]
    fn unknown_binary_fails_closed_to_empty() {
        let bytes = [0u8, 159, 146, 150, 0, 1, 2];
        let text = extract_text("blob.bin", &bytes).unwrap();
        assert!(text.is_empty());
    }

    #[test]
    fn chain_selects_by_extension() {
        assert_eq!(parser_name("a.pdf"), "pdf");
        assert_eq!(parser_name("a.PPTX"), "slides");
        assert_eq!(parser_name("a.docx"), "word");
        assert_eq!(parser_name("a.md"), "plain-text");
        assert_eq!(parser_name("no-extension"), "generic");
    }
}
