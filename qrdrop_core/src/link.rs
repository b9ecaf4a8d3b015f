//! Share links.
//!
//! The initiator publishes its identifier as the fragment of a link
//! (`<base>#<id>`), typically rendered as a QR code. The joiner extracts the
//! fragment again.

use url::Url;

/// Builds the link advertising `id`.
pub fn share_link(base: &str, id: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base)?;
    url.set_fragment(Some(id));
    Ok(url)
}

/// Extracts the connection code from a share link.
///
/// Accepts a full link (`https://host/path#code`), a bare fragment
/// (`#code`) or the code alone. Returns `None` when there is no code.
pub fn code_from_link(input: &str) -> Option<String> {
    let input = input.trim();
    let code = match Url::parse(input) {
        Ok(url) => url.fragment()?.to_string(),
        Err(_) => input.trim_start_matches('#').to_string(),
    };

    if code.is_empty() { None } else { Some(code) }
}
