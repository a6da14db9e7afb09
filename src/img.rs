//! The responsive image component.
//!
//! [`ResponsiveImage`] latches visible the first time its container
//! intersects the viewport, then subscribes to the media query of every
//! [`Source`] and keeps the current source in step with the viewport. Until it
//! is visible and has a source it renders only the fallback and requests
//! nothing; afterwards it renders through [`SuspendedImage`], showing the
//! fallback while the load is pending.
//!
//! The host drives rendering: it registers an `on_render` handler, which is
//! called after every state change and when a pending load settles, and calls
//! [`ResponsiveImage::render`] in response.

use crate::cache::ResourceCache;
use crate::error::ImageError;
use crate::lock;
use crate::platform::{IntersectionEntry, IntersectionWatcher, MediaMatcher, NodeRef, PlatformApi};
use crate::subscription::Subscription;
use crate::suspended::{ImageElement, Suspense, SuspendedImage};
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

/// A candidate image paired with the media query that selects it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Image URL; `None` selects the fallback while the query matches
    #[serde(default)]
    pub source: Option<String>,
    pub media: String,
}

impl Source {
    pub fn new(source: impl Into<String>, media: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            media: media.into(),
        }
    }

    /// An entry that matches but names no image
    pub fn without_source(media: impl Into<String>) -> Self {
        Self {
            source: None,
            media: media.into(),
        }
    }
}

/// Inputs of a [`ResponsiveImage`]
#[derive(Debug, Clone)]
pub struct ImageProps {
    /// The observed container; may be attached after mounting
    pub container: NodeRef,
    pub sources: Option<Vec<Source>>,
    /// Default source, used when no media query matches
    pub src: Option<String>,
    /// Markup shown before the image is visible or loaded
    pub fallback: String,
    pub alt: Option<String>,
    /// Passthrough attributes copied onto the `<img>`
    pub attributes: Vec<(String, String)>,
}

impl ImageProps {
    pub fn new(container: NodeRef) -> Self {
        Self {
            container,
            sources: None,
            src: None,
            fallback: String::new(),
            alt: None,
            attributes: Vec::new(),
        }
    }

    pub fn sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }

    pub fn fallback(mut self, markup: impl Into<String>) -> Self {
        self.fallback = markup.into();
        self
    }

    pub fn alt(mut self, alt: impl Into<String>) -> Self {
        self.alt = Some(alt.into());
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }
}

/// Host services a component needs
#[derive(Clone)]
pub struct ImageEnv {
    pub media: Arc<dyn MediaMatcher>,
    pub intersection: Arc<dyn IntersectionWatcher>,
    pub cache: ResourceCache,
}

impl ImageEnv {
    pub fn new(
        media: Arc<dyn MediaMatcher>,
        intersection: Arc<dyn IntersectionWatcher>,
        cache: ResourceCache,
    ) -> Self {
        Self {
            media,
            intersection,
            cache,
        }
    }

    pub fn from_platform(platform: &dyn PlatformApi, cache: ResourceCache) -> Self {
        Self::new(platform.media_matcher(), platform.intersection_watcher(), cache)
    }
}

/// What the component renders
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rendered {
    Fallback { markup: String },
    Image(ImageElement),
}

impl Rendered {
    pub fn to_html(&self) -> String {
        match self {
            Rendered::Fallback { markup } => markup.clone(),
            Rendered::Image(el) => el.to_html(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Rendered::Fallback { .. })
    }

    /// The image URL, when an image is rendered
    pub fn image_src(&self) -> Option<&str> {
        match self {
            Rendered::Image(el) => Some(&el.src),
            Rendered::Fallback { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ImageState {
    /// The container has not entered the viewport yet
    Hidden,
    /// Visible, showing the default source
    VisibleNoMatch,
    /// Visible, showing the source of entry `index`
    VisibleMatched { index: usize, source: Option<String> },
}

type RenderHandler = Arc<dyn Fn() + Send + Sync>;

struct State {
    props: ImageProps,
    mounted: bool,
    visible: bool,
    current: Option<String>,
    matched: Option<usize>,
    // Bumped whenever the media subscription set is replaced; events carrying
    // an older value are dropped.
    generation: u64,
    media_subs: Vec<Subscription>,
    intersection_sub: Option<Subscription>,
    suspension: Option<(String, Subscription)>,
    on_render: Option<RenderHandler>,
}

impl State {
    /// Change the current source, handing back a suspension that no longer
    /// applies so the caller can release it outside the lock
    fn set_current(&mut self, source: Option<String>, matched: Option<usize>) -> Option<Subscription> {
        self.current = source;
        self.matched = matched;
        let outdated = self
            .suspension
            .as_ref()
            .is_some_and(|(url, _)| Some(url) != self.current.as_ref());
        if outdated {
            self.suspension.take().map(|(_, s)| s)
        } else {
            None
        }
    }
}

struct Shared {
    env: ImageEnv,
    state: Mutex<State>,
}

/// A mounted responsive image. Dropping it unmounts.
pub struct ResponsiveImage {
    shared: Arc<Shared>,
}

impl ResponsiveImage {
    /// Mount the component and start watching its container
    pub fn mount(props: ImageProps, env: ImageEnv) -> Self {
        let container = props.container.clone();
        let shared = Arc::new(Shared {
            env,
            state: Mutex::new(State {
                props,
                mounted: true,
                visible: false,
                current: None,
                matched: None,
                generation: 0,
                media_subs: Vec::new(),
                intersection_sub: None,
                suspension: None,
                on_render: None,
            }),
        });

        let weak = Arc::downgrade(&shared);
        // May fire right away when the container is already on screen.
        let sub = shared.env.intersection.observe(
            &container,
            Box::new(move |entry: &IntersectionEntry| {
                if let Some(shared) = weak.upgrade() {
                    trace!("responsive image: {:?} intersecting (ratio {:.2})", entry.target, entry.ratio);
                    became_visible(&shared);
                }
                true
            }),
        );
        let stale = {
            let mut st = lock(&shared.state);
            if st.visible {
                // already latched; the watcher disconnected itself
                Some(sub)
            } else {
                st.intersection_sub = Some(sub);
                None
            }
        };
        drop(stale);

        ResponsiveImage { shared }
    }

    /// Register the host's re-render hook, replacing any previous one
    pub fn on_render<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        lock(&self.shared.state).on_render = Some(Arc::new(handler));
    }

    pub fn clear_on_render(&self) {
        lock(&self.shared.state).on_render = None;
    }

    /// Replace the source list; resubscribes only if it actually changed
    pub fn set_sources(&self, sources: Option<Vec<Source>>) {
        let changed = {
            let mut st = lock(&self.shared.state);
            if st.props.sources == sources {
                false
            } else {
                st.props.sources = sources;
                true
            }
        };
        if changed {
            run_effect(&self.shared);
        }
    }

    pub fn set_src(&self, src: impl Into<String>) {
        self.update_src(Some(src.into()));
    }

    pub fn clear_src(&self) {
        self.update_src(None);
    }

    fn update_src(&self, src: Option<String>) {
        let changed = {
            let mut st = lock(&self.shared.state);
            if st.props.src == src {
                false
            } else {
                st.props.src = src;
                true
            }
        };
        if changed {
            run_effect(&self.shared);
        }
    }

    pub fn set_fallback(&self, markup: impl Into<String>) {
        lock(&self.shared.state).props.fallback = markup.into();
        notify(&self.shared);
    }

    pub fn set_alt(&self, alt: Option<String>) {
        lock(&self.shared.state).props.alt = alt;
        notify(&self.shared);
    }

    pub fn set_attributes(&self, attributes: Vec<(String, String)>) {
        lock(&self.shared.state).props.attributes = attributes;
        notify(&self.shared);
    }

    pub fn state(&self) -> ImageState {
        let st = lock(&self.shared.state);
        match (st.visible, st.matched) {
            (false, _) => ImageState::Hidden,
            (true, None) => ImageState::VisibleNoMatch,
            (true, Some(index)) => ImageState::VisibleMatched {
                index,
                source: st.current.clone(),
            },
        }
    }

    pub fn is_visible(&self) -> bool {
        lock(&self.shared.state).visible
    }

    /// The source the component would render now, if any
    pub fn current_source(&self) -> Option<String> {
        let st = lock(&self.shared.state);
        if st.visible {
            st.current.clone()
        } else {
            None
        }
    }

    /// Render once. A pending load renders the fallback and arranges for the
    /// `on_render` handler to fire when it settles; a failed load is returned
    /// as the error for the host's error boundary.
    pub fn render(&self) -> Result<Rendered, ImageError> {
        let (current, fallback, alt, attributes) = {
            let st = lock(&self.shared.state);
            let current = if st.visible && st.mounted {
                st.current.clone()
            } else {
                None
            };
            (
                current,
                st.props.fallback.clone(),
                st.props.alt.clone(),
                st.props.attributes.clone(),
            )
        };
        let fallback = Rendered::Fallback { markup: fallback };

        let Some(src) = current else {
            return Ok(fallback);
        };
        let image = SuspendedImage {
            src,
            alt,
            attributes,
        };
        match image.render(&self.shared.env.cache) {
            Suspense::Ready(el) => Ok(Rendered::Image(el)),
            Suspense::Failed(e) => Err(e),
            Suspense::Suspended(_) => {
                self.suspend_on(&image.src);
                Ok(fallback)
            }
        }
    }

    /// [`render`](Self::render) with a boundary that logs load failures and
    /// keeps showing the fallback
    pub fn render_or_fallback(&self) -> Rendered {
        match self.render() {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!("responsive image: {}", e);
                Rendered::Fallback {
                    markup: lock(&self.shared.state).props.fallback.clone(),
                }
            }
        }
    }

    /// Wait for the current source (if any) to settle, then render
    pub async fn render_settled(&self) -> Result<Rendered, ImageError> {
        if let Some(src) = self.current_source() {
            if let Err(e) = self.shared.env.cache.load(&src).await {
                debug!("responsive image: settled with failure for {}", e.url);
            }
        }
        self.render()
    }

    /// Release every subscription. Rendering afterwards yields the fallback.
    pub fn unmount(&self) {
        let released = {
            let mut st = lock(&self.shared.state);
            if !st.mounted {
                return;
            }
            st.mounted = false;
            st.generation += 1;
            (
                st.intersection_sub.take(),
                std::mem::take(&mut st.media_subs),
                st.suspension.take(),
            )
        };
        drop(released);
        debug!("responsive image: unmounted");
    }

    fn suspend_on(&self, url: &str) {
        {
            let st = lock(&self.shared.state);
            let waiting = st.suspension.as_ref().is_some_and(|(u, _)| u == url);
            if waiting || !st.mounted {
                return;
            }
        }

        let weak = Arc::downgrade(&self.shared);
        let key = url.to_string();
        let sub = self.shared.env.cache.when_settled(url, move || {
            if let Some(shared) = weak.upgrade() {
                load_settled(&shared, &key);
            }
        });
        if !sub.is_active() {
            // settled in the meantime and the handler already ran
            return;
        }

        let stale = {
            let mut st = lock(&self.shared.state);
            if st.mounted && st.current.as_deref() == Some(url) {
                st.suspension.replace((url.to_string(), sub)).map(|(_, s)| s)
            } else {
                Some(sub)
            }
        };
        drop(stale);
    }
}

impl Drop for ResponsiveImage {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl fmt::Debug for ResponsiveImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = lock(&self.shared.state);
        f.debug_struct("ResponsiveImage")
            .field("visible", &st.visible)
            .field("current", &st.current)
            .field("subscriptions", &st.media_subs.len())
            .finish()
    }
}

fn notify(shared: &Shared) {
    let handler = {
        let st = lock(&shared.state);
        if !st.mounted {
            return;
        }
        st.on_render.clone()
    };
    if let Some(handler) = handler {
        handler();
    }
}

fn became_visible(shared: &Arc<Shared>) {
    {
        let mut st = lock(&shared.state);
        if st.visible || !st.mounted {
            return;
        }
        st.visible = true;
    }
    debug!("responsive image: container entered the viewport");
    run_effect(shared);
}

/// Release the media subscriptions and, when visible, subscribe anew for the
/// current inputs
fn run_effect(shared: &Arc<Shared>) {
    let (generation, stale, inputs) = {
        let mut st = lock(&shared.state);
        st.generation += 1;
        let stale = std::mem::take(&mut st.media_subs);
        let inputs = (st.visible && st.mounted).then(|| (st.props.sources.clone(), st.props.src.clone()));
        (st.generation, stale, inputs)
    };
    drop(stale);

    let Some((sources, src)) = inputs else {
        return;
    };

    let sources = sources.unwrap_or_default();
    let queries: Arc<Vec<String>> = Arc::new(sources.iter().map(|s| s.media.clone()).collect());
    let mut subs = Vec::with_capacity(sources.len());
    let mut selected = None;
    for (index, entry) in sources.into_iter().enumerate() {
        let weak = Arc::downgrade(shared);
        let queries = queries.clone();
        let source = entry.source.clone();
        subs.push(shared.env.media.subscribe(
            &entry.media,
            Box::new(move |matches: bool| {
                if let Some(shared) = weak.upgrade() {
                    media_changed(&shared, generation, index, &source, matches, &queries);
                }
            }),
        ));
        // later matching entries override earlier ones
        if shared.env.media.matches_now(&entry.media) {
            selected = Some((index, entry.source));
        }
    }
    debug!(
        "responsive image: {} media subscription(s), initial match {:?}",
        subs.len(),
        selected.as_ref().map(|(i, _)| *i)
    );

    let (stale, superseded) = {
        let mut st = lock(&shared.state);
        if st.generation != generation {
            (None, Some(subs))
        } else {
            let released = match selected {
                Some((index, source)) => st.set_current(source, Some(index)),
                None => st.set_current(src, None),
            };
            st.media_subs = subs;
            (released, None)
        }
    };
    drop(stale);
    if superseded.is_some() {
        trace!("responsive image: effect superseded by a newer run");
        return;
    }
    notify(shared);
}

fn media_changed(
    shared: &Arc<Shared>,
    generation: u64,
    index: usize,
    source: &Option<String>,
    matches: bool,
    queries: &[String],
) {
    let none_match = !matches && shared.env.media.matches_none(queries);
    let stale = {
        let mut st = lock(&shared.state);
        if st.generation != generation {
            trace!("responsive image: dropping media event from a released subscription");
            return;
        }
        if matches {
            st.set_current(source.clone(), Some(index))
        } else if none_match {
            let src = st.props.src.clone();
            st.set_current(src, None)
        } else {
            return;
        }
    };
    drop(stale);
    debug!("responsive image: media entry {} now {}", index, if matches { "matches" } else { "unmatched" });
    notify(shared);
}

fn load_settled(shared: &Arc<Shared>, url: &str) {
    let finished = {
        let mut st = lock(&shared.state);
        if st.suspension.as_ref().is_some_and(|(u, _)| u == url) {
            st.suspension.take()
        } else if st.current.as_deref() == Some(url) {
            None
        } else {
            return;
        }
    };
    drop(finished);
    trace!("responsive image: {} settled, re-rendering", url);
    notify(shared);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ManualFetcher;
    use crate::platform::{ElementId, EmulatedPlatform, Rect};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup(fetcher: &ManualFetcher) -> (EmulatedPlatform, ImageEnv) {
        let platform = EmulatedPlatform::default();
        let cache = ResourceCache::new(Arc::new(fetcher.clone()));
        let env = ImageEnv::from_platform(&platform, cache);
        (platform, env)
    }

    #[test]
    fn deferred_ref_latches_visible_on_attach() {
        let fetcher = ManualFetcher::auto_succeed();
        let (platform, env) = setup(&fetcher);
        platform.intersection().place(ElementId(7), Rect::new(0, 0, 100, 100));

        let container = NodeRef::new();
        let image = ResponsiveImage::mount(ImageProps::new(container.clone()).src("a.jpg").fallback("…"), env);
        assert_eq!(image.state(), ImageState::Hidden);
        assert!(image.render().unwrap().is_fallback());
        assert!(fetcher.requests().is_empty());

        container.attach(ElementId(7));
        assert_eq!(image.state(), ImageState::VisibleNoMatch);
        assert_eq!(image.render().unwrap().image_src(), Some("a.jpg"));
    }

    #[test]
    fn pending_load_triggers_one_rerender_when_settled() {
        let fetcher = ManualFetcher::new();
        let (platform, env) = setup(&fetcher);
        platform.intersection().place(ElementId(1), Rect::new(0, 0, 100, 100));
        let image = ResponsiveImage::mount(ImageProps::new(NodeRef::attached(ElementId(1))).src("a.jpg"), env);

        let renders = Arc::new(AtomicUsize::new(0));
        let r = renders.clone();
        image.on_render(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert!(image.render().unwrap().is_fallback());
        assert!(image.render().unwrap().is_fallback());
        fetcher.succeed("a.jpg");
        assert_eq!(renders.load(Ordering::SeqCst), 1);
        assert!(!image.render().unwrap().is_fallback());
    }

    #[test]
    fn unchanged_inputs_do_not_resubscribe() {
        let fetcher = ManualFetcher::auto_succeed();
        let (platform, env) = setup(&fetcher);
        platform.intersection().place(ElementId(1), Rect::new(0, 0, 100, 100));
        let sources = vec![Source::new("big.jpg", "(min-width: 1000px)")];
        let image = ResponsiveImage::mount(
            ImageProps::new(NodeRef::attached(ElementId(1))).sources(sources.clone()),
            env,
        );

        let renders = Arc::new(AtomicUsize::new(0));
        let r = renders.clone();
        image.on_render(move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        image.set_sources(Some(sources));
        assert_eq!(renders.load(Ordering::SeqCst), 0);
        assert_eq!(platform.media().listener_count(), 1);
    }
}
