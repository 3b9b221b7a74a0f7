//! Suggested filename and mime type cleanup

use dlbridge_types::DownloadResponse;

const FALLBACK_FILENAME: &str = "download";

/// Drop parameters such as `;charset=utf-8` from a mime type
pub fn normalize_mime_type(mime_type: &str) -> String {
    mime_type
        .split(';')
        .next()
        .unwrap_or(mime_type)
        .trim()
        .to_ascii_lowercase()
}

/// Last path segment of `url`, percent-decoded
pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    Some(decoded)
}

/// Pick the filename to offer the delegate.
///
/// Engines sometimes append an extension to a name that already has one
/// (`feed.xml.rss` for `/feed.xml`); the URL's name wins in that case.
pub fn suggested_filename(response: &DownloadResponse, engine_suggested: &str) -> String {
    let engine_suggested = sanitize(engine_suggested.trim());
    let url_name = filename_from_url(&response.url).map(|n| sanitize(&n));

    match url_name {
        Some(url_name) if has_extension(&url_name) && engine_suggested.starts_with(&url_name) => {
            url_name
        }
        _ if !engine_suggested.is_empty() => engine_suggested,
        Some(url_name) if !url_name.is_empty() => url_name,
        _ => FALLBACK_FILENAME.to_string(),
    }
}

fn has_extension(name: &str) -> bool {
    std::path::Path::new(name)
        .extension()
        .map(|e| !e.is_empty())
        .unwrap_or(false)
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect()
}
