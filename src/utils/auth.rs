//! Authentication headers for provider requests.

/// Adds the provider credential to a request.
///
/// Providers that expect a raw key in a custom header (for example
/// `x-api-key`) name it through `api_key_header`; everything else gets
/// `Authorization: Bearer <key>`.
pub fn add_auth_headers(
    request: reqwest::RequestBuilder,
    api_key_header: Option<&str>,
    api_key: &str,
) -> reqwest::RequestBuilder {
    match api_key_header.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) => request.header(name, api_key),
        None => request.header("Authorization", format!("Bearer {api_key}")),
    }
}
