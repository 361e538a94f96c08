use percent_encoding::percent_decode_str;
use url::Url;

/// Fixed content-type to extension table, first match wins.
const MIME_EXTENSIONS: &[(&str, &str)] = &[
    ("text/html", ".html"),
    ("text/plain", ".txt"),
    ("application/pdf", ".pdf"),
    ("image/jpeg", ".jpg"),
    ("image/png", ".png"),
    ("application/zip", ".zip"),
    ("application/json", ".json"),
    ("application/xml", ".xml"),
    ("audio/mpeg", ".mp3"),
    ("video/mp4", ".mp4"),
    ("application/msword", ".doc"),
    (
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        ".docx",
    ),
    ("application/vnd.ms-excel", ".xls"),
    (
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        ".xlsx",
    ),
];

pub const FALLBACK_EXTENSION: &str = ".bin";

/// Extract a file name from a `Content-Disposition` header value.
///
/// A plain `filename=` parameter wins over the RFC 5987 `filename*=` form.
pub fn filename_from_content_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in value.split(';') {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if key == "filename" {
            plain = Some(strip_quotes(raw));
        } else if key == "filename*" {
            // charset'language'percent-encoded-name
            let encoded = match raw.rfind("''") {
                Some(idx) => &raw[idx + 2..],
                None => raw,
            };
            extended = Some(
                percent_decode_str(&strip_quotes(encoded))
                    .decode_utf8_lossy()
                    .to_string(),
            );
        }
    }

    plain
        .filter(|name| !name.is_empty())
        .or(extended.filter(|name| !name.is_empty()))
}

fn strip_quotes(raw: &str) -> String {
    raw.replace(['"', '\'', ';'], "").trim().to_string()
}

/// Last path segment of a URL, percent-decoded. Query strings are ignored.
pub fn get_filename_from_url(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    let segment = url.path_segments()?.last()?.to_string();
    let decoded = percent_decode_str(&segment).decode_utf8_lossy().to_string();
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

/// Extension (with leading dot) for a `Content-Type` value, `.bin` when unknown.
pub fn extension_for_content_type(content_type: Option<&str>) -> &'static str {
    let Some(content_type) = content_type else {
        return FALLBACK_EXTENSION;
    };
    let content_type = content_type.to_ascii_lowercase();
    MIME_EXTENSIONS
        .iter()
        .find(|(mime, _)| content_type.contains(mime))
        .map(|(_, ext)| *ext)
        .unwrap_or(FALLBACK_EXTENSION)
}

/// `downloaded_file_<millis>` plus an extension guessed from the content type.
pub fn synthesize_filename(content_type: Option<&str>) -> String {
    format!(
        "downloaded_file_{}{}",
        chrono::Utc::now().timestamp_millis(),
        extension_for_content_type(content_type)
    )
}

/// Replace characters that cannot appear in a single path component.
pub fn sanitize_filename(filename: &str) -> String {
    let cleaned = filename.replace(
        |c: char| c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'),
        "_",
    );
    match cleaned.trim() {
        "" | "." | ".." => "downloaded_file".to_string(),
        name => name.to_string(),
    }
}
