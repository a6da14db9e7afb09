//! Responsive image scenarios against the emulated platform

use rfimage::fetch::ManualFetcher;
use rfimage::platform::{ElementId, EmulatedPlatform, MediaMatcher, NodeRef, Rect};
use rfimage::{
    ImageConfig, ImageEnv, ImageProps, ImageState, Rendered, ResourceCache, ResponsiveImage, Source, Viewport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const CONTAINER: ElementId = ElementId(1);

// Breakpoints of a typical bootstrap-style layout; they partition the width.
const SOURCE_SET: [(&str, &str); 4] = [
    ("(min-width: 1200px)", "https://img.example/xl.jpg"),
    ("(min-width: 992px) and (max-width: 1199px)", "https://img.example/lg.jpg"),
    ("(min-width: 768px) and (max-width: 991px)", "https://img.example/md.jpg"),
    ("(max-width: 767px)", "https://img.example/sm.jpg"),
];

const DEFAULT_SRC: &str = "https://img.example/default.jpg";

fn source_set() -> Vec<Source> {
    SOURCE_SET.iter().map(|(media, url)| Source::new(*url, *media)).collect()
}

struct Harness {
    platform: EmulatedPlatform,
    fetcher: ManualFetcher,
    renders: Arc<AtomicUsize>,
    image: ResponsiveImage,
}

impl Harness {
    fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }
}

/// Mount an image at the given viewport width. `container_top` places the
/// container; anything past 800 is below the fold.
fn mount(width: u32, container_top: i32, fetcher: ManualFetcher, props: impl FnOnce(ImageProps) -> ImageProps) -> Harness {
    let config = ImageConfig {
        viewport: Viewport { width, height: 800 },
        ..Default::default()
    };
    let platform = EmulatedPlatform::new(&config);
    platform.intersection().place(CONTAINER, Rect::new(0, container_top, 300, 200));

    let cache = ResourceCache::new(Arc::new(fetcher.clone()));
    let env = ImageEnv::from_platform(&platform, cache);
    let base = ImageProps::new(NodeRef::attached(CONTAINER)).fallback("<div class=\"skeleton\"></div>");
    let image = ResponsiveImage::mount(props(base), env);

    let renders = Arc::new(AtomicUsize::new(0));
    let r = renders.clone();
    image.on_render(move || {
        r.fetch_add(1, Ordering::SeqCst);
    });

    Harness {
        platform,
        fetcher,
        renders,
        image,
    }
}

#[test]
fn offscreen_container_renders_fallback_and_fetches_nothing() {
    let h = mount(1300, 5000, ManualFetcher::auto_succeed(), |p| {
        p.sources(source_set()).src(DEFAULT_SRC)
    });

    for width in [320, 800, 1000, 1400] {
        h.platform.resize(width, 800);
        let rendered = h.image.render().unwrap();
        assert_eq!(rendered, Rendered::Fallback { markup: "<div class=\"skeleton\"></div>".into() });
    }
    assert_eq!(h.image.state(), ImageState::Hidden);
    assert!(h.fetcher.requests().is_empty());
    // hidden components do not subscribe to media queries
    assert_eq!(h.platform.media().listener_count(), 0);
    assert_eq!(h.renders(), 0);
}

#[test]
fn visible_container_loads_the_matching_source() {
    let h = mount(1300, 0, ManualFetcher::new(), |p| {
        p.sources(source_set()).src(DEFAULT_SRC).alt("Harbour at dusk").attribute("class", "hero")
    });

    assert_eq!(
        h.image.state(),
        ImageState::VisibleMatched {
            index: 0,
            source: Some("https://img.example/xl.jpg".into())
        }
    );
    assert!(h.image.render().unwrap().is_fallback());
    assert_eq!(h.fetcher.requests(), vec!["https://img.example/xl.jpg".to_string()]);

    let before = h.renders();
    assert!(h.fetcher.succeed("https://img.example/xl.jpg"));
    assert_eq!(h.renders(), before + 1);

    let html = h.image.render().unwrap().to_html();
    assert_eq!(
        html,
        "<img src=\"https://img.example/xl.jpg\" alt=\"Harbour at dusk\" class=\"hero\">"
    );
    assert_eq!(h.fetcher.requests().len(), 1);
}

#[test]
fn leaving_every_range_reverts_to_default_src() {
    let h = mount(1300, 0, ManualFetcher::auto_succeed(), |p| {
        p.sources(vec![Source::new("xl.jpg", "(min-width: 1200px)")]).src("default.jpg")
    });
    assert_eq!(h.image.render().unwrap().image_src(), Some("xl.jpg"));

    h.platform.resize(800, 800);
    assert_eq!(h.image.state(), ImageState::VisibleNoMatch);
    assert_eq!(h.image.render().unwrap().image_src(), Some("default.jpg"));
    assert_eq!(h.fetcher.fetch_count("default.jpg"), 1);

    h.platform.resize(1300, 800);
    assert_eq!(h.image.render().unwrap().image_src(), Some("xl.jpg"));
    assert_eq!(h.fetcher.fetch_count("xl.jpg"), 1);
}

#[test]
fn failed_load_reaches_the_boundary() {
    let h = mount(1300, 0, ManualFetcher::auto_succeed().failing("https://img.example/xl.jpg"), |p| {
        p.sources(source_set())
    });

    let err = h.image.render().unwrap_err();
    assert_eq!(err.url, "https://img.example/xl.jpg");
    assert!(err.to_string().starts_with("Cannot load image from source"));

    // the bundled boundary swallows it and keeps the placeholder
    assert!(h.image.render_or_fallback().is_fallback());
    // no fail-over and no retry
    assert_eq!(h.fetcher.requests(), vec!["https://img.example/xl.jpg".to_string()]);
}

#[test]
fn default_src_alone_is_rendered_once_loaded() {
    let h = mount(1024, 0, ManualFetcher::new(), |p| p.src(DEFAULT_SRC));
    assert_eq!(h.image.state(), ImageState::VisibleNoMatch);
    assert!(h.image.render().unwrap().is_fallback());

    h.fetcher.succeed(DEFAULT_SRC);
    assert_eq!(h.image.render().unwrap().image_src(), Some(DEFAULT_SRC));
    assert_eq!(h.platform.media().listener_count(), 0);
}

#[test]
fn scrolling_into_view_latches_visibility_for_good() {
    let h = mount(1300, 1500, ManualFetcher::auto_succeed(), |p| p.src(DEFAULT_SRC));
    assert!(!h.image.is_visible());

    h.platform.intersection().scroll_to(0, 1000);
    assert!(h.image.is_visible());
    assert_eq!(h.platform.intersection().observation_count(), 0);

    h.platform.intersection().scroll_to(0, 0);
    h.platform.intersection().remove(CONTAINER);
    h.platform.resize(320, 480);
    assert!(h.image.is_visible());
    assert_eq!(h.image.render().unwrap().image_src(), Some(DEFAULT_SRC));
}

#[test]
fn partitioned_breakpoints_select_exactly_one_source() {
    let h = mount(1920, 0, ManualFetcher::auto_succeed(), |p| {
        p.sources(source_set()).src(DEFAULT_SRC)
    });
    let media = h.platform.media().clone();

    let cases = [
        (1920, "xl"),
        (1200, "xl"),
        (1199, "lg"),
        (992, "lg"),
        (991, "md"),
        (768, "md"),
        (767, "sm"),
        (320, "sm"),
        (1000, "lg"),
    ];
    for (width, expected) in cases {
        h.platform.resize(width, 800);
        let matching = SOURCE_SET.iter().filter(|(q, _)| media.matches_now(q)).count();
        assert_eq!(matching, 1, "width {}", width);
        let expected = format!("https://img.example/{}.jpg", expected);
        assert_eq!(h.image.current_source().as_deref(), Some(expected.as_str()), "width {}", width);
        assert_eq!(h.image.render().unwrap().image_src(), Some(expected.as_str()));
    }
}

#[test]
fn uncovered_widths_use_the_default_src() {
    let h = mount(800, 0, ManualFetcher::auto_succeed(), |p| {
        p.sources(vec![
            Source::new("small.jpg", "(max-width: 599px)"),
            Source::new("large.jpg", "(min-width: 1000px)"),
        ])
        .src("default.jpg")
    });
    assert_eq!(h.image.current_source().as_deref(), Some("default.jpg"));

    for (width, expected) in [(500, "small.jpg"), (700, "default.jpg"), (1200, "large.jpg"), (999, "default.jpg")] {
        h.platform.resize(width, 800);
        assert_eq!(h.image.current_source().as_deref(), Some(expected), "width {}", width);
    }

    h.image.set_sources(Some(Vec::new()));
    assert_eq!(h.image.current_source().as_deref(), Some("default.jpg"));
    h.image.set_sources(None);
    assert_eq!(h.image.current_source().as_deref(), Some("default.jpg"));
}

fn overlapping() -> Vec<Source> {
    vec![
        Source::new("wide.jpg", "(min-width: 600px)"),
        Source::new("xwide.jpg", "(min-width: 1000px)"),
    ]
}

#[test]
fn overlapping_queries_prefer_the_later_entry_at_mount() {
    let h = mount(1300, 0, ManualFetcher::auto_succeed(), |p| p.sources(overlapping()).src("default.jpg"));
    assert_eq!(
        h.image.state(),
        ImageState::VisibleMatched {
            index: 1,
            source: Some("xwide.jpg".into())
        }
    );

    let mut reversed = overlapping();
    reversed.reverse();
    let h = mount(1300, 0, ManualFetcher::auto_succeed(), |p| p.sources(reversed).src("default.jpg"));
    assert_eq!(h.image.current_source().as_deref(), Some("wide.jpg"));
}

#[test]
fn overlapping_queries_follow_the_last_transition() {
    let h = mount(1300, 0, ManualFetcher::auto_succeed(), |p| p.sources(overlapping()).src("default.jpg"));
    let current = || h.image.current_source();

    // xwide stops matching while wide still matches: nothing changes
    let before = h.renders();
    h.platform.resize(800, 800);
    assert_eq!(current().as_deref(), Some("xwide.jpg"));
    assert_eq!(h.renders(), before);

    h.platform.resize(500, 800);
    assert_eq!(current().as_deref(), Some("default.jpg"));

    h.platform.resize(800, 800);
    assert_eq!(current().as_deref(), Some("wide.jpg"));

    h.platform.resize(1300, 800);
    assert_eq!(current().as_deref(), Some("xwide.jpg"));

    // both start matching in one resize; the later entry fires last
    h.platform.resize(500, 800);
    h.platform.resize(1300, 800);
    assert_eq!(
        h.image.state(),
        ImageState::VisibleMatched {
            index: 1,
            source: Some("xwide.jpg".into())
        }
    );
    assert_eq!(h.image.render().unwrap().image_src(), Some("xwide.jpg"));
}

#[test]
fn changing_src_reruns_the_selection() {
    let h = mount(800, 0, ManualFetcher::auto_succeed(), |p| {
        p.sources(vec![Source::new("xl.jpg", "(min-width: 1200px)")]).src("a.jpg")
    });
    assert_eq!(h.image.current_source().as_deref(), Some("a.jpg"));

    let before = h.renders();
    h.image.set_src("b.jpg");
    assert_eq!(h.image.current_source().as_deref(), Some("b.jpg"));
    assert_eq!(h.renders(), before + 1);
    assert_eq!(h.platform.media().listener_count(), 1);

    h.image.clear_src();
    assert_eq!(h.image.current_source(), None);
    assert!(h.image.render().unwrap().is_fallback());
}

#[test]
fn matched_entry_without_url_shows_fallback() {
    let h = mount(400, 0, ManualFetcher::auto_succeed(), |p| {
        p.sources(vec![Source::without_source("(max-width: 599px)")]).src("default.jpg")
    });
    assert_eq!(h.image.state(), ImageState::VisibleMatched { index: 0, source: None });
    assert!(h.image.render().unwrap().is_fallback());
    assert!(h.fetcher.requests().is_empty());

    h.platform.resize(900, 800);
    assert_eq!(h.image.render().unwrap().image_src(), Some("default.jpg"));
}

#[test]
fn replaced_sources_no_longer_trigger_renders() {
    let h = mount(1300, 0, ManualFetcher::auto_succeed(), |p| {
        p.sources(vec![Source::new("xl.jpg", "(min-width: 1200px)")]).src("default.jpg")
    });
    h.image.set_sources(Some(vec![Source::new("portrait.jpg", "(orientation: portrait)")]));
    assert_eq!(h.platform.media().listener_count(), 1);

    let before = h.renders();
    // crosses the old 1200px breakpoint but keeps landscape
    h.platform.resize(1000, 800);
    h.platform.resize(1400, 800);
    assert_eq!(h.renders(), before);
    assert_eq!(h.image.current_source().as_deref(), Some("default.jpg"));

    h.platform.resize(600, 800);
    assert_eq!(h.renders(), before + 1);
    assert_eq!(h.image.current_source().as_deref(), Some("portrait.jpg"));
}

#[test]
fn unmount_releases_every_subscription() {
    let h = mount(1300, 0, ManualFetcher::new(), |p| {
        p.sources(source_set()).src(DEFAULT_SRC)
    });
    assert!(h.image.render().unwrap().is_fallback());
    assert_eq!(h.platform.media().listener_count(), 4);

    h.image.unmount();
    assert_eq!(h.platform.media().listener_count(), 0);

    let before = h.renders();
    h.platform.resize(500, 800);
    h.fetcher.succeed("https://img.example/xl.jpg");
    assert_eq!(h.renders(), before);
    assert!(h.image.render().unwrap().is_fallback());
}

#[test]
fn unmounting_before_visibility_stops_observing() {
    let h = mount(1300, 3000, ManualFetcher::auto_succeed(), |p| p.src(DEFAULT_SRC));
    assert_eq!(h.platform.intersection().observation_count(), 1);
    drop(h.image);
    assert_eq!(h.platform.intersection().observation_count(), 0);
    h.platform.intersection().scroll_to(0, 3000);
    assert!(h.fetcher.requests().is_empty());
}

#[test]
fn remounting_against_a_detached_ref_leaves_nothing_behind() {
    let platform = EmulatedPlatform::default();
    platform.intersection().place(CONTAINER, Rect::new(0, 0, 300, 200));
    let fetcher = ManualFetcher::auto_succeed();
    let env = ImageEnv::from_platform(&platform, ResourceCache::new(Arc::new(fetcher.clone())));
    let container = NodeRef::new();

    for _ in 0..4 {
        let image = ResponsiveImage::mount(ImageProps::new(container.clone()).src(DEFAULT_SRC), env.clone());
        assert_eq!(container.hook_count(), 1);
        image.unmount();
    }
    assert_eq!(container.hook_count(), 0);
    assert_eq!(platform.intersection().observation_count(), 0);

    let image = ResponsiveImage::mount(ImageProps::new(container.clone()).src(DEFAULT_SRC), env);
    container.attach(CONTAINER);
    assert_eq!(image.current_source().as_deref(), Some(DEFAULT_SRC));
    assert_eq!(image.render().unwrap().image_src(), Some(DEFAULT_SRC));
    assert_eq!(fetcher.fetch_count(DEFAULT_SRC), 1);
    assert_eq!(container.hook_count(), 0);
}

#[test]
fn presentation_props_only_rerender() {
    let h = mount(1300, 0, ManualFetcher::auto_succeed(), |p| p.src(DEFAULT_SRC));
    let before = h.renders();
    h.image.set_alt(Some("Updated".into()));
    h.image.set_attributes(vec![("width".into(), "300".into())]);
    h.image.set_fallback("<p>loading</p>");
    assert_eq!(h.renders(), before + 3);

    match h.image.render().unwrap() {
        Rendered::Image(el) => {
            assert_eq!(el.alt.as_deref(), Some("Updated"));
            assert_eq!(el.attributes, vec![("width".to_string(), "300".to_string())]);
        }
        other => panic!("expected image, got {:?}", other),
    }
    assert_eq!(h.fetcher.fetch_count(DEFAULT_SRC), 1);
}

#[tokio::test]
async fn render_settled_waits_for_the_load() {
    let fetcher = ManualFetcher::new();
    let h = mount(1300, 0, fetcher.clone(), |p| p.src(DEFAULT_SRC));
    assert!(h.image.render().unwrap().is_fallback());

    let f = fetcher.clone();
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(20));
        f.succeed(DEFAULT_SRC);
    });
    let rendered = h.image.render_settled().await.unwrap();
    assert_eq!(rendered.image_src(), Some(DEFAULT_SRC));
    let json = serde_json::to_value(&rendered).unwrap();
    assert_eq!(json["kind"], "image");
    assert_eq!(json["src"], DEFAULT_SRC);
}
