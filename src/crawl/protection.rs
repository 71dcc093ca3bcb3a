//! Protection-signal detection (spec §7): a small pattern table over
//! fetched HTML, grounded on the teacher's `worker::http` retry/classify
//! shape generalized from "retry the same URL" to "classify the page".

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionSignal {
    Cloudflare,
    Captcha,
    AccessDenied,
    JavaScriptRequired,
    EmptyBody,
}

const CLOUDFLARE_MARKERS: &[&str] = &["checking your browser", "cf-browser-verification", "cloudflare ray id", "attention required! | cloudflare"];
const CAPTCHA_MARKERS: &[&str] = &["recaptcha", "hcaptcha", "verify you are human", "i'm not a robot"];
const ACCESS_DENIED_MARKERS: &[&str] = &["access denied", "403 forbidden", "you don't have permission to access"];
const JS_REQUIRED_MARKERS: &[&str] = &["enable javascript", "please enable javascript", "javascript is required"];

/// Classify fetched HTML as a protection challenge, if any signature
/// matches. `None` means the page is safe to extract from normally.
pub fn detect(body: &str) -> Option<ProtectionSignal> {
    if body.trim().len() < 50 {
        return Some(ProtectionSignal::EmptyBody);
    }

    let lower = body.to_lowercase();

    if CLOUDFLARE_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return Some(ProtectionSignal::Cloudflare);
    }
    if CAPTCHA_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return Some(ProtectionSignal::Captcha);
    }
    if ACCESS_DENIED_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return Some(ProtectionSignal::AccessDenied);
    }
    if JS_REQUIRED_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return Some(ProtectionSignal::JavaScriptRequired);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_cloudflare_challenge() {
        let body = "<html><body>Checking your browser before accessing... cf-browser-verification</body></html>";
        assert_eq!(detect(body), Some(ProtectionSignal::Cloudflare));
    }

    #[test]
    fn test_detects_captcha() {
        let body = "Please complete the reCAPTCHA to continue browsing this fairly large page of filler text.";
        assert_eq!(detect(body), Some(ProtectionSignal::Captcha));
    }

    #[test]
    fn test_detects_empty_body() {
        assert_eq!(detect("  "), Some(ProtectionSignal::EmptyBody));
    }

    #[test]
    fn test_normal_page_has_no_signal() {
        let body = "<html><body><h1>Welcome</h1><p>This is a normal page with plenty of real content to read.</p></body></html>";
        assert_eq!(detect(body), None);
    }
}
