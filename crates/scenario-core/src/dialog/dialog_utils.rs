//! Identifier generation and validation for dialogs

use uuid::Uuid;

/// Generate a random branch parameter for Via header (RFC 3261 magic cookie + random string)
pub fn generate_branch() -> String {
    format!("z9hG4bK-{}", Uuid::new_v4().simple())
}

/// Generate a random From/To tag
pub fn generate_tag() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// Generate a Call-ID scoped to `host`
pub fn generate_call_id(host: &str) -> String {
    format!("{}@{}", Uuid::new_v4().simple(), host)
}

/// Whether `tag` is a non-empty RFC 3261 `token`
pub fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-.!%*_+`'~".contains(c))
}
