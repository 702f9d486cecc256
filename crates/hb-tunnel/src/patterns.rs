//! Line patterns recognised in `devtunnel host` output.

use std::sync::LazyLock;

use regex::Regex;

/// First URL after `Connect via browser:`. Only the host part and an
/// optional port are captured, so a comma-separated list yields its first
/// entry.
static CONNECT_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)Connect via browser:\s*(https://[a-zA-Z0-9\-]+(?:\.[a-z0-9]+)?\.devtunnels\.ms(?::\d+)?)",
    )
    .expect("connect url regex")
});

static LOGIN_REQUIRED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(not logged in|login required|please login|unauthorized|Run 'devtunnel user login')")
        .expect("login regex")
});

const INSPECT_MARKER: &str = "-inspect";

/// Extract the public connect URL from one output line.
///
/// Returns `None` when the line has no connect URL or the URL is an
/// `-inspect` variant. A trailing `/` is removed.
pub fn find_connect_url(line: &str) -> Option<String> {
    let url = CONNECT_URL.captures(line)?.get(1)?.as_str();
    if url.to_ascii_lowercase().contains(INSPECT_MARKER) {
        return None;
    }
    Some(url.trim_end_matches('/').to_string())
}

/// True when the line says the CLI needs an interactive login.
pub fn requires_login(line: &str) -> bool {
    LOGIN_REQUIRED.is_match(line)
}
