use lazy_static::lazy_static;
use regex::Regex;

/// Marker the FTP server writes once an upload has fully completed.
pub const UPLOAD_MARKER: &str = "OK UPLOAD:";

lazy_static! {
    // First quoted field is the client address, second is the uploaded path.
    static ref UPLOAD_PATTERN: Regex =
        Regex::new(r#"OK UPLOAD:.*?"[^"]+",\s*"([^"]+)""#).expect("upload pattern is valid");
}

/// One completed upload extracted from a single log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEvent {
    pub raw_line: String,
    pub extracted_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLine {
    Upload(UploadEvent),
    /// The marker was present but no path could be extracted; the caller logs
    /// a warning and skips the line.
    MarkerWithoutPath,
    Unmatched,
}

/// Matching is purely line-local; no state is carried between lines.
pub fn parse_line(line: &str) -> ParsedLine {
    if !line.contains(UPLOAD_MARKER) {
        return ParsedLine::Unmatched;
    }
    match UPLOAD_PATTERN.captures(line) {
        Some(captures) => ParsedLine::Upload(UploadEvent {
            raw_line: line.to_string(),
            extracted_path: captures[1].to_string(),
        }),
        None => ParsedLine::MarkerWithoutPath,
    }
}
