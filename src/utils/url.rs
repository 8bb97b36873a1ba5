//! Endpoint URL assembly.

/// Joins a provider base URL and an endpoint path with exactly one slash.
///
/// ```
/// use toolstream::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.example.com/v1//", "/chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let endpoint = endpoint.trim().trim_start_matches('/');
    if endpoint.is_empty() {
        return base.to_string();
    }
    format!("{base}/{endpoint}")
}
