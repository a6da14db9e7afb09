//! Image fetching backends.
//!
//! A fetcher receives a URL and a [`FetchResponder`] and answers exactly once,
//! from any thread, with success or an [`ImageError`]. The resource cache
//! guarantees a fetcher sees each URL at most once.

use crate::error::ImageError;
use crate::lock;
use image::ImageFormat;
use log::trace;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

type Settle = Box<dyn FnOnce(Result<(), ImageError>) + Send>;

/// One-shot completion handle for a fetch.
///
/// Dropping it without answering settles the fetch as failed, so a lost
/// responder can never leave a URL pending forever.
pub struct FetchResponder {
    url: String,
    settle: Option<Settle>,
}

impl FetchResponder {
    pub fn new<F>(url: impl Into<String>, settle: F) -> Self
    where
        F: FnOnce(Result<(), ImageError>) + Send + 'static,
    {
        Self {
            url: url.into(),
            settle: Some(Box::new(settle)),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn resolve(mut self, outcome: Result<(), ImageError>) {
        if let Some(settle) = self.settle.take() {
            settle(outcome);
        }
    }

    pub fn succeed(self) {
        self.resolve(Ok(()))
    }

    pub fn fail(self, reason: impl Into<String>) {
        let err = ImageError::new(self.url.clone(), reason);
        self.resolve(Err(err))
    }
}

impl Drop for FetchResponder {
    fn drop(&mut self) {
        if let Some(settle) = self.settle.take() {
            settle(Err(ImageError::new(self.url.clone(), "fetch abandoned")));
        }
    }
}

impl fmt::Debug for FetchResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponder").field("url", &self.url).finish()
    }
}

/// Host image loading facility
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str, responder: FetchResponder);
}

#[derive(Default)]
struct ManualState {
    requests: Vec<String>,
    pending: Vec<FetchResponder>,
    auto_succeed: bool,
    failing: HashSet<String>,
}

/// Fetcher answered by hand (or automatically), recording every request.
///
/// Used by tests and demos that need deterministic load timing.
#[derive(Clone, Default)]
pub struct ManualFetcher {
    state: Arc<Mutex<ManualState>>,
}

impl ManualFetcher {
    /// Requests stay pending until `succeed`/`fail` is called
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests resolve inside `fetch`; URLs marked with `failing` fail
    pub fn auto_succeed() -> Self {
        let f = Self::new();
        lock(&f.state).auto_succeed = true;
        f
    }

    /// Make `url` fail when auto-resolving
    pub fn failing(self, url: impl Into<String>) -> Self {
        lock(&self.state).failing.insert(url.into());
        self
    }

    /// Every URL fetched so far, in order
    pub fn requests(&self) -> Vec<String> {
        lock(&self.state).requests.clone()
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        lock(&self.state).requests.iter().filter(|u| *u == url).count()
    }

    pub fn pending_urls(&self) -> Vec<String> {
        lock(&self.state)
            .pending
            .iter()
            .map(|r| r.url().to_string())
            .collect()
    }

    /// Complete the pending fetch for `url`. Returns false if none is pending.
    pub fn succeed(&self, url: &str) -> bool {
        self.take_pending(url)
            .map(FetchResponder::succeed)
            .is_some()
    }

    /// Fail the pending fetch for `url`. Returns false if none is pending.
    pub fn fail(&self, url: &str, reason: &str) -> bool {
        self.take_pending(url).map(|r| r.fail(reason)).is_some()
    }

    fn take_pending(&self, url: &str) -> Option<FetchResponder> {
        let mut state = lock(&self.state);
        let idx = state.pending.iter().position(|r| r.url() == url)?;
        Some(state.pending.remove(idx))
    }
}

impl ImageFetcher for ManualFetcher {
    fn fetch(&self, url: &str, responder: FetchResponder) {
        let succeed = {
            let mut state = lock(&self.state);
            state.requests.push(url.to_string());
            if !state.auto_succeed {
                state.pending.push(responder);
                return;
            }
            !state.failing.contains(url)
        };
        if succeed {
            responder.succeed();
        } else {
            responder.fail("configured to fail");
        }
    }
}

fn is_svg(bytes: &[u8], content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("image/svg"))
        || std::str::from_utf8(bytes).is_ok_and(|s| {
            let s = s.trim_start();
            s.starts_with("<svg") || (s.starts_with("<?xml") && s.contains("<svg"))
        })
}

fn format_from_content_type(content_type: Option<&str>) -> Option<ImageFormat> {
    let mime = content_type?.split(';').next()?.trim().to_ascii_lowercase();
    ImageFormat::from_mime_type(mime)
}

/// Check that `bytes` hold a decodable image.
///
/// SVG documents are accepted when they are UTF-8 with an `<svg` element;
/// anything else has to decode as a bitmap, trying the declared content type
/// first and then the format `image` detects from the data.
pub fn decode_image(bytes: &[u8], content_type: Option<&str>) -> std::result::Result<(), String> {
    if is_svg(bytes, content_type) {
        let text = std::str::from_utf8(bytes).map_err(|e| format!("SVG not valid UTF-8: {}", e))?;
        if !text.contains("<svg") {
            return Err("SVG document has no <svg> element".to_string());
        }
        return Ok(());
    }

    let sniffed = image::guess_format(bytes).ok();
    let declared = format_from_content_type(content_type);
    if sniffed.is_none() && declared.is_none() {
        return Err("data is not a recognized image format".to_string());
    }

    let mut declared_error = None;
    if let Some(format) = declared {
        match image::load_from_memory_with_format(bytes, format) {
            Ok(_) => return Ok(()),
            Err(e) => declared_error = Some(e),
        }
    }
    if sniffed.is_some() && sniffed != declared {
        match image::load_from_memory(bytes) {
            Ok(_) => {
                trace!("declared {:?} but decoded as {:?}", declared, sniffed);
                return Ok(());
            }
            Err(e) => return Err(format!("failed to decode image: {}", e)),
        }
    }
    Err(match declared_error {
        Some(e) => format!("failed to decode image: {}", e),
        None => "data is not a recognized image format".to_string(),
    })
}

#[cfg(feature = "http")]
pub use http::HttpFetcher;

#[cfg(feature = "http")]
mod http {
    use super::{decode_image, FetchResponder, ImageFetcher};
    use crate::error::ImageError;
    use crate::{Error, ImageConfig, Result};
    use log::{debug, warn};
    use reqwest::blocking::Client;
    use reqwest::header::{CONTENT_TYPE, USER_AGENT};
    use std::time::Duration;
    use url::Url;

    /// Fetches `http(s)://` and `file://` URLs on background threads.
    ///
    /// With `verify_image_data` enabled a response only counts as loaded if
    /// its content type (when present) is `image/*` and its bytes decode.
    #[derive(Clone)]
    pub struct HttpFetcher {
        client: Client,
        config: ImageConfig,
    }

    impl HttpFetcher {
        /// Build the HTTP client. Call this outside of an async runtime.
        pub fn new(config: &ImageConfig) -> Result<Self> {
            let client = Client::builder()
                .timeout(config.timeout_ms.map(Duration::from_millis))
                .build()
                .map_err(|e| Error::InitializationError(format!("Failed to build HTTP client: {}", e)))?;
            Ok(Self {
                client,
                config: config.clone(),
            })
        }

        fn load(&self, url: &str) -> std::result::Result<(), ImageError> {
            let fail = |reason: String| ImageError::new(url, reason);
            let parsed = Url::parse(url).map_err(|e| fail(format!("invalid URL: {}", e)))?;

            let (bytes, content_type) = match parsed.scheme() {
                "http" | "https" => {
                    let mut req = self
                        .client
                        .get(parsed.as_str())
                        .header(USER_AGENT, self.config.user_agent.clone());
                    for (k, v) in &self.config.headers {
                        req = req.header(k.as_str(), v.as_str());
                    }
                    let resp = req.send().map_err(|e| fail(format!("request failed: {}", e)))?;
                    if !resp.status().is_success() {
                        return Err(fail(format!("HTTP {}", resp.status())));
                    }
                    let content_type = resp
                        .headers()
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    if self.config.verify_image_data {
                        if let Some(ct) = &content_type {
                            if !ct.trim().to_ascii_lowercase().starts_with("image/") {
                                return Err(fail(format!("unexpected content type '{}'", ct)));
                            }
                        }
                    }
                    let bytes = resp
                        .bytes()
                        .map_err(|e| fail(format!("failed to read body: {}", e)))?
                        .to_vec();
                    (bytes, content_type)
                }
                "file" => {
                    let path = parsed
                        .to_file_path()
                        .map_err(|_| fail("not a local file path".to_string()))?;
                    let bytes = std::fs::read(&path).map_err(|e| fail(format!("{}: {}", path.display(), e)))?;
                    (bytes, None)
                }
                other => return Err(fail(format!("unsupported URL scheme '{}'", other))),
            };

            if bytes.is_empty() {
                return Err(fail("empty image data".to_string()));
            }
            if self.config.verify_image_data {
                decode_image(&bytes, content_type.as_deref()).map_err(fail)?;
            }
            Ok(())
        }
    }

    impl ImageFetcher for HttpFetcher {
        fn fetch(&self, url: &str, responder: FetchResponder) {
            let fetcher = self.clone();
            let url = url.to_string();
            std::thread::spawn(move || {
                debug!("fetching image {}", url);
                let outcome = fetcher.load(&url);
                if let Err(e) = &outcome {
                    warn!("{}", e);
                }
                responder.resolve(outcome);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_responder(url: &str) -> (Arc<Mutex<Option<Result<(), ImageError>>>>, FetchResponder) {
        let slot = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let responder = FetchResponder::new(url, move |outcome| {
            *s.lock().unwrap() = Some(outcome);
        });
        (slot, responder)
    }

    #[test]
    fn dropped_responder_settles_as_failure() {
        let (slot, responder) = recording_responder("https://x/a.png");
        drop(responder);
        let outcome = slot.lock().unwrap().clone().unwrap();
        assert_eq!(outcome, Err(ImageError::new("https://x/a.png", "fetch abandoned")));
    }

    #[test]
    fn manual_fetcher_holds_until_answered() {
        let f = ManualFetcher::new();
        let (slot, responder) = recording_responder("a.png");
        f.fetch("a.png", responder);
        assert_eq!(f.pending_urls(), vec!["a.png".to_string()]);
        assert!(slot.lock().unwrap().is_none());

        assert!(f.succeed("a.png"));
        assert_eq!(*slot.lock().unwrap(), Some(Ok(())));
        assert!(!f.succeed("a.png"));
        assert_eq!(f.fetch_count("a.png"), 1);
    }

    #[test]
    fn auto_fetcher_honours_failing_urls() {
        let f = ManualFetcher::auto_succeed().failing("bad.png");
        let (ok, r1) = recording_responder("ok.png");
        let (bad, r2) = recording_responder("bad.png");
        f.fetch("ok.png", r1);
        f.fetch("bad.png", r2);
        assert_eq!(*ok.lock().unwrap(), Some(Ok(())));
        assert!(matches!(*bad.lock().unwrap(), Some(Err(_))));
        assert_eq!(f.requests(), vec!["ok.png".to_string(), "bad.png".to_string()]);
    }

    fn png_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        image::DynamicImage::new_rgba8(2, 2)
            .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    #[test]
    fn decodes_real_images_and_svg() {
        let png = png_bytes();
        assert_eq!(decode_image(&png, None), Ok(()));
        assert_eq!(decode_image(&png, Some("image/png; charset=binary")), Ok(()));
        // a wrong declared type still falls back to the sniffed format
        assert_eq!(decode_image(&png, Some("image/jpeg")), Ok(()));
        assert_eq!(decode_image(b"  <svg xmlns=\"http://www.w3.org/2000/svg\"/>", None), Ok(()));
        assert_eq!(decode_image(b"<svg/>", Some("image/svg+xml")), Ok(()));
    }

    #[test]
    fn corrupt_or_unknown_data_fails() {
        let png = png_bytes();
        let truncated = &png[..png.len() / 2];
        let err = decode_image(truncated, Some("image/png")).unwrap_err();
        assert!(err.contains("failed to decode"), "{}", err);

        let mut garbage = b"\x89PNG\r\n\x1a\n".to_vec();
        garbage.extend_from_slice(b"this is not a png body at all");
        assert!(decode_image(&garbage, None).is_err());

        let err = decode_image(b"<html></html>", None).unwrap_err();
        assert!(err.contains("not a recognized image"), "{}", err);
        assert!(decode_image(b"\xff\xfe not utf8", Some("image/svg+xml")).is_err());
    }
}
