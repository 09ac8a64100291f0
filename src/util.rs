//! Shared helpers: platform-safe names and generated secrets.

use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;

/// Minimum length of generated datastore passwords.
pub const MIN_SECRET_LEN: usize = 32;

/// Convert a title to a URL-safe slug, limited to `max_len` characters.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// A sanitized platform resource name with a random suffix so two jobs
/// asking for the same name never collide.
pub fn unique_name(base: &str, max_len: usize) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let suffix = &suffix[..8];
    // room for "-" + suffix
    let budget = max_len.saturating_sub(suffix.len() + 1).max(1);
    let slug = slugify(base, budget);
    if slug.is_empty() {
        format!("app-{}", suffix)
    } else {
        format!("{}-{}", slug, suffix)
    }
}

/// High-entropy alphanumeric secret from the operating system RNG.
pub fn generate_secret(len: usize) -> String {
    let len = len.max(MIN_SECRET_LEN);
    OsRng
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Keep the last `max_chars` characters of `text`, prefixed with "..." when cut.
pub fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skip = count - max_chars;
    format!("...{}", text.chars().skip(skip).collect::<String>())
}
