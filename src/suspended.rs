//! The suspension boundary around a single `<img>`.
//!
//! Rendering never blocks: a pending load yields [`Suspense::Suspended`] with
//! a future the host can await (or register a settle listener for) before
//! rendering again.

use crate::cache::{LoadResult, ResourceCache, Settled};
use crate::error::ImageError;
use log::warn;
use serde::Serialize;
use std::fmt;

/// A loaded `<img>` element
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageElement {
    pub src: String,
    pub alt: Option<String>,
    /// Passthrough presentation attributes, in the order given
    pub attributes: Vec<(String, String)>,
}

impl ImageElement {
    pub fn to_html(&self) -> String {
        let mut out = format!("<img src=\"{}\"", escape(&self.src));
        if let Some(alt) = &self.alt {
            out.push_str(&format!(" alt=\"{}\"", escape(alt)));
        }
        for (name, value) in self.attributes.iter().filter(|(name, _)| is_attribute_name(name)) {
            out.push_str(&format!(" {}=\"{}\"", name, escape(value)));
        }
        out.push('>');
        out
    }
}

/// HTML attribute name syntax: non-empty, no whitespace, controls, quotes,
/// `<`, `>`, `/` or `=`
pub fn is_attribute_name(name: &str) -> bool {
    !name.is_empty()
        && !name.chars().any(|c| {
            c.is_whitespace() || c.is_control() || matches!(c, '"' | '\'' | '<' | '>' | '/' | '=')
        })
}

fn escape(value: &str) -> String {
    htmlescape::encode_minimal(value)
}

/// Outcome of rendering a [`SuspendedImage`]
#[derive(Clone)]
pub enum Suspense {
    Ready(ImageElement),
    /// Show the fallback until the future resolves
    Suspended(Settled),
    Failed(ImageError),
}

impl fmt::Debug for Suspense {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Suspense::Ready(el) => f.debug_tuple("Ready").field(el).finish(),
            Suspense::Suspended(_) => f.write_str("Suspended"),
            Suspense::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// An image whose render waits on the resource cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendedImage {
    pub src: String,
    pub alt: Option<String>,
    pub attributes: Vec<(String, String)>,
}

impl SuspendedImage {
    pub fn new(src: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            alt: None,
            attributes: Vec::new(),
        }
    }

    pub fn render(&self, cache: &ResourceCache) -> Suspense {
        match cache.request(&self.src) {
            LoadResult::Pending(settled) => Suspense::Suspended(settled),
            LoadResult::Failure(e) => Suspense::Failed(e),
            LoadResult::Success => Suspense::Ready(ImageElement {
                src: self.src.clone(),
                alt: self.alt.clone(),
                attributes: self
                    .attributes
                    .iter()
                    .filter(|(name, _)| {
                        let ok = is_attribute_name(name);
                        if !ok {
                            warn!("dropping invalid attribute name {:?} on {}", name, self.src);
                        }
                        ok
                    })
                    .cloned()
                    .collect(),
            }),
        }
    }
}
