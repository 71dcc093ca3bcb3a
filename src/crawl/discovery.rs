//! URL discovery (spec §4.H): sitemap parsing and link-following.
//!
//! Link extraction is regex-based rather than a full HTML parser — the
//! teacher's stack has no HTML/CSS-selector crate and pulling one in for
//! anchor-href extraction alone would be the over-engineering the spec's
//! Non-goals warn against; `follow_selector` is accepted but only
//! `follow_pattern` (a regex over the href) is actually evaluated.

use regex::Regex;
use url::Url;

/// Parse a sitemap.xml body into up to `max_urls` absolute URLs.
pub fn parse_sitemap(body: &str, max_urls: usize) -> Vec<String> {
    let re = Regex::new(r"<loc>\s*([^<\s]+)\s*</loc>").expect("static sitemap regex is valid");
    re.captures_iter(body).map(|c| c[1].to_string()).take(max_urls).collect()
}

/// Extract anchor hrefs from HTML, resolved against `base_url`, optionally
/// filtered by `follow_pattern` and restricted to the seed's host when
/// `same_domain_only` is set.
pub fn discover_links(html: &str, base_url: &Url, follow_pattern: Option<&str>, same_domain_only: bool) -> Vec<String> {
    let href_re = Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#).expect("static href regex is valid");
    let pattern = follow_pattern.and_then(|p| Regex::new(p).ok());

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();

    for capture in href_re.captures_iter(html) {
        let href = &capture[1];
        if href.starts_with('#') || href.starts_with("mailto:") || href.starts_with("javascript:") {
            continue;
        }

        let Ok(resolved) = base_url.join(href) else { continue };

        if same_domain_only && resolved.host_str() != base_url.host_str() {
            continue;
        }

        if let Some(pattern) = &pattern {
            if !pattern.is_match(resolved.as_str()) {
                continue;
            }
        }

        let url_str = resolved.to_string();
        if seen.insert(url_str.clone()) {
            out.push(url_str);
        }
    }

    out
}
