//! Attachment download: sanitize Discord's supplied filename and save next
//! to the other files this bus run has collected.

use std::path::{Path, PathBuf};

use serenity::all::{Attachment, Http};

use bus_core::Error;

pub async fn download(http: &Http, files_dir: &Path, attachment: &Attachment) -> Result<PathBuf, Error> {
    let bytes = attachment
        .download()
        .await
        .map_err(|e| Error::External(format!("attachment download failed: {e}")))?;

    let _ = http; // reserved: future variants may need authenticated re-fetch
    std::fs::create_dir_all(files_dir)?;

    let name = uniquify_filename(&attachment.filename, attachment.id.get());
    let path = files_dir.join(&name);
    std::fs::write(&path, bytes)?;
    Ok(path)
}

fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        "attachment".to_string()
    } else {
        out
    }
}

fn uniquify_filename(name: &str, attachment_id: u64) -> String {
    let base = sanitize_filename(name);
    if let Some((stem, ext)) = base.rsplit_once('.') {
        if !stem.is_empty() && !ext.is_empty() {
            return format!("{stem}_{attachment_id}.{ext}");
        }
    }
    format!("{base}_{attachment_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_filename_replaces_unsafe_characters() {
        assert_eq!(sanitize_filename("my report (final).pdf"), "my_report__final_.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename(""), "attachment");
    }

    #[test]
    fn uniquify_filename_preserves_extension() {
        assert_eq!(uniquify_filename("notes.txt", 42), "notes_42.txt");
        assert_eq!(uniquify_filename("noext", 42), "noext_42");
    }
}
