use anyhow::{bail, Context, Result};
use clap::Parser;
use rfimage::fetch::HttpFetcher;
use rfimage::platform::{DeviceEmulation, ElementId, EmulatedPlatform, NodeRef, Rect};
use rfimage::{ImageConfig, ImageEnv, ImageProps, ResourceCache, ResponsiveImage, Source, Viewport};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "rfimage",
    about = "Render a lazy responsive image against an emulated viewport",
    version
)]
struct Cli {
    /// Viewport width in CSS pixels
    #[arg(long, default_value_t = 1280)]
    width: u32,

    /// Viewport height in CSS pixels
    #[arg(long, default_value_t = 720)]
    height: u32,

    /// Device pixel ratio
    #[arg(long, default_value_t = 1.0)]
    dpr: f32,

    /// Default image URL, used when no media query matches
    #[arg(long)]
    src: Option<String>,

    /// Candidate source as "<media>=<url>" (repeatable)
    #[arg(long = "source", value_parser = parse_source)]
    sources: Vec<Source>,

    /// JSON file holding an array of {"source": ..., "media": ...}
    #[arg(long)]
    sources_file: Option<PathBuf>,

    #[arg(long)]
    alt: Option<String>,

    /// Markup rendered while the image is hidden or loading
    #[arg(long, default_value = "<div class=\"placeholder\"></div>")]
    fallback: String,

    /// Start with the container below the fold and scroll it into view
    #[arg(long)]
    offscreen: bool,

    /// Resize the viewport to WxH after the first render (repeatable)
    #[arg(long = "resize", value_parser = parse_size)]
    resizes: Vec<(u32, u32)>,

    /// Print one JSON object per step instead of markup
    #[arg(long)]
    json: bool,

    /// Per-request timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    user_agent: Option<String>,
}

fn parse_size(s: &str) -> std::result::Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(&['x', 'X'][..])
        .ok_or_else(|| format!("expected WxH, got '{}'", s))?;
    let w = w.trim().parse().map_err(|e| format!("bad width '{}': {}", w, e))?;
    let h = h.trim().parse().map_err(|e| format!("bad height '{}': {}", h, e))?;
    Ok((w, h))
}

fn parse_source(s: &str) -> std::result::Result<Source, String> {
    // Range syntax puts '=' inside the query, URLs put it in the query string.
    let split = match s.rfind(")=") {
        Some(i) => Some((&s[..=i], &s[i + 2..])),
        None => s.split_once('='),
    };
    match split {
        Some((media, url)) if !media.trim().is_empty() => {
            let url = url.trim();
            Ok(Source {
                source: (!url.is_empty()).then(|| url.to_string()),
                media: media.trim().to_string(),
            })
        }
        _ => Err(format!("expected \"<media>=<url>\", got '{}'", s)),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let mut config = ImageConfig {
        viewport: Viewport {
            width: cli.width,
            height: cli.height,
        },
        device_pixel_ratio: cli.dpr,
        timeout_ms: cli.timeout_ms,
        ..Default::default()
    };
    if let Some(ua) = &cli.user_agent {
        config.user_agent = ua.clone();
    }
    config.validate()?;

    let mut sources = cli.sources.clone();
    if let Some(path) = &cli.sources_file {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let listed: Vec<Source> =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        sources.extend(listed);
    }
    if cli.src.is_none() && sources.is_empty() {
        bail!("nothing to render: pass --src and/or --source");
    }

    // The blocking HTTP client has to exist before the async runtime does.
    let fetcher = HttpFetcher::new(&config)?;
    let cache = ResourceCache::install_global(Arc::new(fetcher))?;

    let platform = EmulatedPlatform::new(&config);
    let container = NodeRef::new();
    let top = if cli.offscreen { config.viewport.height as i32 + 200 } else { 0 };
    platform
        .intersection()
        .place(ElementId(1), Rect::new(0, top, config.viewport.width, 300));

    let mut props = ImageProps::new(container.clone()).fallback(cli.fallback.clone());
    props.src = cli.src.clone();
    props.alt = cli.alt.clone();
    if !sources.is_empty() {
        props = props.sources(sources);
    }
    let image = ResponsiveImage::mount(props, ImageEnv::from_platform(&platform, cache));
    container.attach(ElementId(1));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        report(&cli, "initial", &platform, &image).await?;
        if cli.offscreen {
            platform.intersection().scroll_to(0, top);
            report(&cli, "scrolled", &platform, &image).await?;
        }
        for &(w, h) in &cli.resizes {
            platform.resize(w, h);
            report(&cli, &format!("resize {}x{}", w, h), &platform, &image).await?;
        }
        Ok::<_, anyhow::Error>(())
    })?;

    image.unmount();
    Ok(())
}

async fn report(cli: &Cli, step: &str, platform: &EmulatedPlatform, image: &ResponsiveImage) -> Result<()> {
    let rendered = image.render_settled().await;
    let metrics = platform.metrics();
    if cli.json {
        let mut line = json!({
            "step": step,
            "viewport": { "width": metrics.width, "height": metrics.height, "dpr": metrics.dpr },
            "state": image.state(),
        });
        match &rendered {
            Ok(r) => line["rendered"] = serde_json::to_value(r)?,
            Err(e) => line["error"] = json!(e.to_string()),
        }
        println!("{}", serde_json::to_string(&line)?);
    } else {
        match rendered {
            Ok(r) => println!("[{}] {}x{}: {}", step, metrics.width, metrics.height, r.to_html()),
            Err(e) => println!("[{}] {}x{}: error: {}", step, metrics.width, metrics.height, e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sources_with_range_syntax() {
        let s = parse_source("(width >= 1200px)=https://cdn.example/xl.jpg?w=1200").unwrap();
        assert_eq!(s.media, "(width >= 1200px)");
        assert_eq!(s.source.as_deref(), Some("https://cdn.example/xl.jpg?w=1200"));

        let s = parse_source("print=").unwrap();
        assert_eq!(s.media, "print");
        assert!(s.source.is_none());

        assert!(parse_source("=a.jpg").is_err());
    }

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_size("800x600"), Ok((800, 600)));
        assert!(parse_size("800").is_err());
    }
}
