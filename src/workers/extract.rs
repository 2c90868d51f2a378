//! Plain-text extraction for uploaded documents.

use std::io::{Cursor, Read};
use std::panic;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

/// Cap on the decompressed size of one OOXML part.
const MAX_PART_BYTES: u64 = 32 * 1024 * 1024;
const MAX_SLIDES: usize = 500;

pub const TEXT_TYPES: &[&str] = &["txt", "md", "csv", "json", "html", "xml"];

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("pdf extraction failed: {0}")]
    Pdf(String),
    #[error("office document extraction failed: {0}")]
    Ooxml(String),
}

impl From<zip::result::ZipError> for ExtractError {
    fn from(err: zip::result::ZipError) -> Self {
        ExtractError::Ooxml(err.to_string())
    }
}

impl From<quick_xml::Error> for ExtractError {
    fn from(err: quick_xml::Error) -> Self {
        ExtractError::Ooxml(err.to_string())
    }
}

/// Returns the document's text, or `None` for formats without a text layer
/// we know how to read.
pub fn document_text(file_type: &str, bytes: &[u8]) -> Result<Option<String>, ExtractError> {
    if TEXT_TYPES.contains(&file_type) {
        return Ok(Some(String::from_utf8_lossy(bytes).into_owned()));
    }
    match file_type {
        "pdf" => pdf_text(bytes).map(Some),
        "docx" => docx_text(bytes).map(Some),
        "pptx" => pptx_text(bytes).map(Some),
        "xlsx" => xlsx_text(bytes).map(Some),
        _ => Ok(None),
    }
}

pub fn pdf_page_count(bytes: &[u8]) -> Result<usize, ExtractError> {
    let document =
        lopdf::Document::load_mem(bytes).map_err(|err| ExtractError::Pdf(err.to_string()))?;
    Ok(document.get_pages().len())
}

fn pdf_text(bytes: &[u8]) -> Result<String, ExtractError> {
    // pdf-extract panics on some malformed fonts and streams.
    match panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(err)) => Err(ExtractError::Pdf(err.to_string())),
        Err(_) => Err(ExtractError::Pdf("parser panicked".into())),
    }
}

fn docx_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let xml = read_part(&mut archive, "word/document.xml")?;
    collect_text(&xml, b"t", Some(b"p"))
}

fn pptx_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    let mut slides: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = name
                .strip_prefix("ppt/slides/slide")?
                .strip_suffix(".xml")?
                .parse()
                .ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    slides.sort();

    let mut out = Vec::new();
    for (_, name) in slides.into_iter().take(MAX_SLIDES) {
        let xml = read_part(&mut archive, &name)?;
        let text = collect_text(&xml, b"t", Some(b"p"))?;
        if !text.is_empty() {
            out.push(text);
        }
    }
    Ok(out.join("\n\n"))
}

/// Cell text lives in the shared string table; numeric cells are skipped.
fn xlsx_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    if archive.by_name("xl/sharedStrings.xml").is_err() {
        return Ok(String::new());
    }
    let xml = read_part(&mut archive, "xl/sharedStrings.xml")?;
    collect_text(&xml, b"t", Some(b"si"))
}

fn read_part(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive.by_name(name)?;
    let mut out = Vec::new();
    entry
        .take(MAX_PART_BYTES)
        .read_to_end(&mut out)
        .map_err(|err| ExtractError::Ooxml(err.to_string()))?;
    if out.len() as u64 >= MAX_PART_BYTES {
        return Err(ExtractError::Ooxml(format!("{name} exceeds size limit")));
    }
    Ok(out)
}

/// Concatenates the text of every `text_tag` element, starting a new line
/// after each `break_tag` element closes.
fn collect_text(
    xml: &[u8],
    text_tag: &[u8],
    break_tag: Option<&[u8]>,
) -> Result<String, ExtractError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    let mut out = String::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) if e.local_name().as_ref() == text_tag => in_text = true,
            Event::End(e) => {
                let name = e.local_name();
                if name.as_ref() == text_tag {
                    in_text = false;
                } else if Some(name.as_ref()) == break_tag && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Event::Text(t) if in_text => {
                let text = t.unescape().map_err(ExtractError::from)?;
                out.push_str(&text);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(out.trim_end().to_string())
}
