use std::path::Path;

use uuid::Uuid;

const MAX_SLUG_LEN: usize = 60;
const FALLBACK: &str = "video";

/// Lowercase `[a-z0-9-]` slug of an uploaded file name, extension dropped.
/// Runs of anything else collapse into a single hyphen; no leading, trailing
/// or doubled hyphens survive.
pub fn sanitize(original_name: &str) -> String {
    // Browsers on Windows may send the full client path
    let base = original_name.rsplit(['/', '\\']).next().unwrap_or(original_name);
    let stem = Path::new(base)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(base);

    let mut slug = String::with_capacity(stem.len());
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }

    slug.truncate(MAX_SLUG_LEN);
    let trimmed = slug.trim_end_matches('-');

    if trimmed.is_empty() {
        FALLBACK.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Remote folder key for a new upload: the sanitized name plus a short random
/// suffix, so two uploads of `intro.mp4` never share a folder.
pub fn video_name(original_name: &str) -> String {
    let suffix = Uuid::new_v4().as_simple().to_string()[..6].to_string();
    format!("{}-{}", sanitize(original_name), suffix)
}

pub fn is_valid(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !candidate.starts_with('-')
        && !candidate.ends_with('-')
        && !candidate.contains("--")
}
