use std::path::Path;

use peerdrop_protocol::{TransferMeta, is_allowed_mime, total_chunks};

use crate::TransferError;

/// Longest file name produced by [`sanitize_file_name`], in bytes.
const MAX_FILE_NAME_LEN: usize = 255;

/// Device names Windows refuses as file names, with or without an extension.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Extension to MIME mapping for the allow-listed types.
const EXTENSION_MIME: &[(&str, &str)] = &[
    ("pdf", "application/pdf"),
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("markdown", "text/markdown"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("doc", "application/msword"),
    (
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    ("xls", "application/vnd.ms-excel"),
    (
        "xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    ("ppt", "application/vnd.ms-powerpoint"),
    (
        "pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("ogv", "video/ogg"),
    ("zip", "application/zip"),
];

/// Guesses the MIME type from a file name's extension.
pub fn mime_from_name(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    EXTENSION_MIME
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

/// Checks that a transfer id is safe to use as a storage key.
pub fn validate_transfer_id(id: &str) -> Result<(), TransferError> {
    if id.is_empty() {
        return Err(TransferError::Validation("empty transfer id".into()));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(TransferError::Validation(format!(
            "transfer id has invalid characters: {id}"
        )));
    }
    Ok(())
}

/// Checks a meta before a session is created.
///
/// Runs before anything is allocated for the transfer, so the declared size
/// is held to `max_size` here rather than after reassembly.
pub fn validate_meta(meta: &TransferMeta, max_size: u64) -> Result<(), TransferError> {
    validate_transfer_id(&meta.transfer_id)?;

    if meta.total_chunks == 0 {
        return Err(TransferError::Validation("meta announces no chunks".into()));
    }

    if meta.size > max_size {
        return Err(TransferError::Validation(format!(
            "announced size {} exceeds limit {max_size}",
            meta.size
        )));
    }

    match total_chunks(meta.size) {
        Some(expected) if expected == meta.total_chunks => Ok(()),
        Some(expected) => Err(TransferError::Validation(format!(
            "totalChunks {} does not match size {} (expected {expected})",
            meta.total_chunks, meta.size
        ))),
        None => Err(TransferError::Validation(format!(
            "size {} needs more chunks than an index can address",
            meta.size
        ))),
    }
}

/// Checks a reassembled payload against the delivery rules.
///
/// Rejects:
/// - Empty files
/// - Files above `max_size`
/// - MIME types outside the allow-list
pub fn validate_payload(mime: &str, size: u64, max_size: u64) -> Result<(), TransferError> {
    if size == 0 {
        return Err(TransferError::Validation("file is empty".into()));
    }
    if size > max_size {
        return Err(TransferError::Validation(format!(
            "file too large: {size} bytes (limit {max_size})"
        )));
    }
    if !is_allowed_mime(mime) {
        return Err(TransferError::Validation(format!(
            "file type not allowed: {mime}"
        )));
    }
    Ok(())
}

/// Makes a peer-supplied file name safe to create in a local directory.
///
/// - Reserved and control characters become `_`
/// - Leading and trailing dots are removed
/// - Runs of whitespace become a single `_`
/// - Windows device names (`CON`, `NUL.txt`, `com1.log`) get a `_` prefix
/// - The result is cut to 255 bytes on a character boundary
/// - An empty result becomes `untitled`
pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect();

    let trimmed = replaced.trim_start_matches('.').trim_end_matches('.');

    let mut out = String::with_capacity(trimmed.len());
    let mut in_space = false;
    for c in trimmed.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push('_');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }

    if is_reserved_name(&out) {
        out.insert(0, '_');
    }

    if out.len() > MAX_FILE_NAME_LEN {
        let mut cut = MAX_FILE_NAME_LEN;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
    }

    if out.is_empty() {
        "untitled".into()
    } else {
        out
    }
}

fn is_reserved_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or(name);
    RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop_protocol::constants::{CHUNK_SIZE, MAX_TRANSFER_SIZE};

    fn meta(size: u64, total_chunks: u32) -> TransferMeta {
        TransferMeta {
            transfer_id: "abc_123-def".into(),
            name: "a.pdf".into(),
            size,
            mime: "application/pdf".into(),
            total_chunks,
            hash: None,
        }
    }

    #[test]
    fn mime_guess_is_case_insensitive() {
        assert_eq!(mime_from_name("Report.PDF"), Some("application/pdf"));
        assert_eq!(mime_from_name("song.mp3"), Some("audio/mpeg"));
        assert_eq!(mime_from_name("archive.tar.gz"), None);
        assert_eq!(mime_from_name("noext"), None);
    }

    #[test]
    fn every_guess_is_allowed() {
        for (_, mime) in EXTENSION_MIME {
            assert!(is_allowed_mime(mime), "{mime} not on allow-list");
        }
    }

    #[test]
    fn meta_consistency() {
        let limit = MAX_TRANSFER_SIZE;
        assert!(validate_meta(&meta(CHUNK_SIZE as u64 * 2, 2), limit).is_ok());
        assert!(validate_meta(&meta(CHUNK_SIZE as u64 * 2 + 1, 2), limit).is_err());
        assert!(validate_meta(&meta(0, 0), limit).is_err());
    }

    #[test]
    fn meta_size_is_capped_up_front() {
        let m = meta(CHUNK_SIZE as u64 * 3, 3);
        assert!(validate_meta(&m, CHUNK_SIZE as u64 * 3).is_ok());
        let err = validate_meta(&m, CHUNK_SIZE as u64 * 2).unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[test]
    fn meta_with_wrapped_chunk_count_is_rejected() {
        // 2^48 + 5 bytes truncates to one chunk under a plain `as u32` cast.
        let m = meta((1u64 << 48) + 5, 1);
        assert!(validate_meta(&m, u64::MAX).is_err());
        let m = meta(1u64 << 47, u32::MAX);
        assert!(validate_meta(&m, u64::MAX).is_err());
    }

    #[test]
    fn meta_rejects_unsafe_id() {
        let mut m = meta(10, 1);
        m.transfer_id = "../etc".into();
        assert!(validate_meta(&m, MAX_TRANSFER_SIZE).is_err());
        m.transfer_id = String::new();
        assert!(validate_meta(&m, MAX_TRANSFER_SIZE).is_err());
    }

    #[test]
    fn payload_rules() {
        let limit = MAX_TRANSFER_SIZE;
        assert!(validate_payload("image/png", 10, limit).is_ok());
        assert!(validate_payload("image/png", 0, limit).is_err());
        assert!(validate_payload("application/x-msdownload", 10, limit).is_err());
        assert!(validate_payload("image/png", limit + 1, limit).is_err());
        assert!(validate_payload("image/png", 11, 10).is_err());
    }

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_file_name("a<b>c:d\"e|f?g*h"), "a_b_c_d_e_f_g_h");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("tab\there"), "tab_here");
    }

    #[test]
    fn sanitize_trims_dots_and_whitespace() {
        assert_eq!(sanitize_file_name("...hidden."), "hidden");
        assert_eq!(sanitize_file_name("my   summer  photo.jpg"), "my_summer_photo.jpg");
    }

    #[test]
    fn sanitize_prefixes_windows_device_names() {
        assert_eq!(sanitize_file_name("CON"), "_CON");
        assert_eq!(sanitize_file_name("nul.txt"), "_nul.txt");
        assert_eq!(sanitize_file_name("Com1.tar.gz"), "_Com1.tar.gz");
        assert_eq!(sanitize_file_name("LPT9.pdf"), "_LPT9.pdf");
        // Only exact stems are reserved.
        assert_eq!(sanitize_file_name("console.log"), "console.log");
        assert_eq!(sanitize_file_name("COM10.txt"), "COM10.txt");
        assert_eq!(sanitize_file_name("my con.txt"), "my_con.txt");
    }

    #[test]
    fn sanitize_falls_back_to_untitled() {
        assert_eq!(sanitize_file_name(""), "untitled");
        assert_eq!(sanitize_file_name("...."), "untitled");
    }

    #[test]
    fn sanitize_limits_length_on_char_boundary() {
        let long = "é".repeat(200);
        let out = sanitize_file_name(&long);
        assert!(out.len() <= MAX_FILE_NAME_LEN);
        assert!(out.chars().all(|c| c == 'é'));
    }
}
