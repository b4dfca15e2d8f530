//! MIME type inference by file extension, used by the file task when the
//! caller supplies none.

/// The MIME type for a file extension (without the dot), if known.
pub fn by_ext(ext: &str) -> Option<&'static str> {
    let ext = ext.to_ascii_lowercase();
    Some(match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "text/javascript",
        "txt" | "text" => "text/plain",
        "csv" => "text/csv",
        "xml" => "text/xml",
        "md" => "text/markdown",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "gif" => "image/gif",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "bmp" => "image/bmp",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        _ => return None,
    })
}

/// The MIME type for a path, looking at the part after the last dot.
pub fn by_path(path: &str) -> Option<&'static str> {
    let name = path.rsplit('/').next()?;
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    by_ext(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        assert_eq!(by_ext("HTML"), Some("text/html"));
        assert_eq!(by_path("/srv/www/index.html"), Some("text/html"));
        assert_eq!(by_path("/srv/www/.hidden"), None);
        assert_eq!(by_path("/srv/www/Makefile"), None);
        assert_eq!(by_ext("weird"), None);
    }
}
