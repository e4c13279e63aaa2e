//! Sandboxed HTTP fetch via `curl`.
//!
//! curl never follows redirects: it reports the `Location` target through
//! `--write-out`, and the executor re-checks that target with the
//! gatekeeper before fetching it in a fresh sandbox. The write-out block is
//! appended after the body behind a marker line; the last marker wins, so
//! a body that happens to contain the marker cannot forge metadata.

use std::time::Duration;

/// Hops followed after the initial request.
pub const MAX_REDIRECTS: usize = 5;

const USER_AGENT: &str = "FluuxGuard/0.2 (+https://github.com/processone/fluux-agent)";

const CONNECT_TIMEOUT_SECS: u64 = 10;

const META_MARKER: &[u8] = b"\n__fluux_guard_meta__";

/// curl exit code for `--max-filesize` exceeded.
pub const CURL_FILESIZE_EXCEEDED: i32 = 63;

/// curl exit code for `--max-time` reached.
pub const CURL_OPERATION_TIMEOUT: i32 = 28;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: String,
    pub redirect: Option<String>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    /// Redirect target, if this is a 3xx with a location.
    pub fn redirect_target(&self) -> Option<&str> {
        if (300..400).contains(&self.status) {
            self.redirect.as_deref()
        } else {
            None
        }
    }
}

/// Argument vector for fetching `url`. No shell is involved.
pub fn curl_argv(url: &str, timeout: Duration, max_bytes: usize) -> Vec<String> {
    let write_out = format!(
        "{}%{{http_code}}\\t%{{content_type}}\\t%{{redirect_url}}",
        // curl expands `\n` itself
        String::from_utf8_lossy(META_MARKER).replace('\n', "\\n")
    );
    vec![
        "curl".to_string(),
        "--silent".to_string(),
        "--show-error".to_string(),
        "--proto".to_string(),
        "=http,https".to_string(),
        "--max-time".to_string(),
        timeout.as_secs().max(1).to_string(),
        "--connect-timeout".to_string(),
        CONNECT_TIMEOUT_SECS.min(timeout.as_secs().max(1)).to_string(),
        "--max-filesize".to_string(),
        max_bytes.to_string(),
        "--user-agent".to_string(),
        USER_AGENT.to_string(),
        "--output".to_string(),
        "-".to_string(),
        "--write-out".to_string(),
        write_out,
        url.to_string(),
    ]
}

/// Splits curl's stdout into body and write-out metadata.
pub fn parse_response(stdout: &[u8]) -> Option<FetchResponse> {
    let at = rfind(stdout, META_MARKER)?;
    let body = stdout[..at].to_vec();
    let meta = String::from_utf8_lossy(&stdout[at + META_MARKER.len()..]).into_owned();

    let mut fields = meta.splitn(3, '\t');
    let status = fields.next()?.trim().parse::<u16>().ok()?;
    let content_type = fields.next().unwrap_or_default().trim().to_string();
    let redirect = fields
        .next()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string);

    Some(FetchResponse {
        status,
        content_type,
        redirect,
        body,
    })
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

/// Test helper and documentation of the wire format.
#[cfg(test)]
pub fn render_response(body: &[u8], status: u16, content_type: &str, redirect: &str) -> Vec<u8> {
    let mut out = body.to_vec();
    out.extend_from_slice(META_MARKER);
    out.extend_from_slice(format!("{status}\t{content_type}\t{redirect}").as_bytes());
    out
}
