//! Viewport intersection detection for container elements

use crate::lock;
use crate::subscription::Subscription;
use crate::Viewport;
use log::{debug, trace};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

/// Host-assigned identity of a laid out element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

/// Axis-aligned box in document coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Rect { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Overlapping region, if any. Rects that only share an edge intersect
    /// in a zero-area rect, the way `IntersectionObserver` counts them.
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right < left as i64 || bottom < top as i64 {
            return None;
        }
        Some(Rect::new(
            left,
            top,
            (right - left as i64) as u32,
            (bottom - top as i64) as u32,
        ))
    }

    /// Grow (or shrink, for negative margins) on every side
    pub fn inflate(&self, margin: i32) -> Rect {
        let grow = |len: u32| (len as i64 + 2 * margin as i64).max(0) as u32;
        Rect::new(
            self.x.saturating_sub(margin),
            self.y.saturating_sub(margin),
            grow(self.width),
            grow(self.height),
        )
    }
}

type AttachHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Slot {
    element: Option<ElementId>,
    on_attach: BTreeMap<u64, AttachHook>,
    next_hook: u64,
}

/// A reference to a container element that may be attached later.
///
/// Clones share the same slot, so the component and the host both hold the
/// same ref.
#[derive(Clone, Default)]
pub struct NodeRef {
    slot: Arc<Mutex<Slot>>,
}

impl NodeRef {
    pub fn new() -> Self {
        Self::default()
    }

    /// A ref that already points at `element`
    pub fn attached(element: ElementId) -> Self {
        let r = Self::new();
        r.attach(element);
        r
    }

    pub fn get(&self) -> Option<ElementId> {
        lock(&self.slot).element
    }

    /// Point the ref at `element`. Observers of the ref re-evaluate when the
    /// element changes.
    pub fn attach(&self, element: ElementId) {
        let hooks: Vec<AttachHook> = {
            let mut slot = lock(&self.slot);
            if slot.element == Some(element) {
                return;
            }
            slot.element = Some(element);
            slot.on_attach.values().cloned().collect()
        };
        for hook in hooks {
            hook();
        }
    }

    pub fn detach(&self) {
        lock(&self.slot).element = None;
    }

    /// Run `hook` on every attach to a new element until `remove_hook` is
    /// called with the returned key
    fn on_attach(&self, hook: AttachHook) -> u64 {
        let mut slot = lock(&self.slot);
        let key = slot.next_hook;
        slot.next_hook += 1;
        slot.on_attach.insert(key, hook);
        key
    }

    fn remove_hook(&self, key: u64) {
        lock(&self.slot).on_attach.remove(&key);
    }

    /// Number of observers waiting on this ref
    pub fn hook_count(&self) -> usize {
        lock(&self.slot).on_attach.len()
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeRef").field(&self.get()).finish()
    }
}

/// Snapshot handed to the callback when a target starts intersecting
#[derive(Debug, Clone, PartialEq)]
pub struct IntersectionEntry {
    pub target: ElementId,
    pub bounds: Rect,
    pub intersection: Option<Rect>,
    /// Visible fraction of the target in `[0, 1]`
    pub ratio: f32,
    pub is_intersecting: bool,
}

/// Called when the target enters the viewport; returning `true` stops
/// observing.
pub type IntersectionCallback = Box<dyn FnMut(&IntersectionEntry) -> bool + Send>;

pub trait IntersectionWatcher: Send + Sync {
    /// Watch `target`. If the ref is not attached yet, observation starts
    /// once it is.
    fn observe(&self, target: &NodeRef, on_enter: IntersectionCallback) -> Subscription;
}

/// Options mirroring `IntersectionObserver`'s `rootMargin` and `threshold`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObserverOptions {
    /// Pixels added around the viewport before testing (negative shrinks)
    pub root_margin: i32,
    /// Minimum visible fraction of the target, `0.0` meaning any overlap
    pub threshold: f32,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            root_margin: 0,
            threshold: 0.0,
        }
    }
}

struct Observation {
    target: NodeRef,
    hook: u64,
    // None while the callback is running
    callback: Option<IntersectionCallback>,
    // element the `intersecting` flag was computed for
    element: Option<ElementId>,
    intersecting: bool,
}

struct Scene {
    viewport: Viewport,
    scroll_x: i32,
    scroll_y: i32,
    layout: HashMap<ElementId, Rect>,
    observations: BTreeMap<u64, Observation>,
    next_id: u64,
    options: ObserverOptions,
}

impl Scene {
    fn root(&self) -> Rect {
        Rect::new(
            self.scroll_x,
            self.scroll_y,
            self.viewport.width,
            self.viewport.height,
        )
        .inflate(self.options.root_margin)
    }
}

fn entry_for(
    layout: &HashMap<ElementId, Rect>,
    element: ElementId,
    root: Rect,
    threshold: f32,
) -> Option<IntersectionEntry> {
    let bounds = *layout.get(&element)?;
    let intersection = bounds.intersection(&root);
    let ratio = match intersection {
        None => 0.0,
        Some(_) if bounds.area() == 0 => 1.0,
        Some(r) => r.area() as f32 / bounds.area() as f32,
    };
    Some(IntersectionEntry {
        target: element,
        bounds,
        intersection,
        ratio,
        is_intersecting: intersection.is_some() && ratio >= threshold,
    })
}

/// Intersection watcher over an emulated layout: the host places element
/// rectangles, sizes the viewport and scrolls; every change re-evaluates all
/// observations.
#[derive(Clone)]
pub struct EmulatedIntersection {
    scene: Arc<Mutex<Scene>>,
}

impl EmulatedIntersection {
    pub fn new(viewport: Viewport, options: ObserverOptions) -> Self {
        EmulatedIntersection {
            scene: Arc::new(Mutex::new(Scene {
                viewport,
                scroll_x: 0,
                scroll_y: 0,
                layout: HashMap::new(),
                observations: BTreeMap::new(),
                next_id: 0,
                options,
            })),
        }
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        lock(&self.scene).viewport = viewport;
        self.update();
    }

    pub fn scroll_to(&self, x: i32, y: i32) {
        {
            let mut scene = lock(&self.scene);
            scene.scroll_x = x;
            scene.scroll_y = y;
        }
        self.update();
    }

    /// Lay out (or move) an element
    pub fn place(&self, element: ElementId, bounds: Rect) {
        lock(&self.scene).layout.insert(element, bounds);
        self.update();
    }

    pub fn remove(&self, element: ElementId) {
        lock(&self.scene).layout.remove(&element);
        self.update();
    }

    /// Number of live observations
    pub fn observation_count(&self) -> usize {
        lock(&self.scene).observations.len()
    }

    /// Re-evaluate every observation (one "frame")
    pub fn update(&self) {
        evaluate(&self.scene);
    }
}

impl Default for EmulatedIntersection {
    fn default() -> Self {
        Self::new(Viewport::default(), ObserverOptions::default())
    }
}

fn evaluate(scene: &Arc<Mutex<Scene>>) {
    let fired: Vec<(u64, IntersectionCallback, IntersectionEntry)> = {
        let mut guard = lock(scene);
        let s = &mut *guard;
        let root = s.root();
        let threshold = s.options.threshold;
        let mut fired = Vec::new();
        for (id, obs) in s.observations.iter_mut() {
            let element = obs.target.get();
            if element != obs.element {
                obs.element = element;
                obs.intersecting = false;
            }
            let entry = element.and_then(|element| entry_for(&s.layout, element, root, threshold));
            let now = entry.as_ref().is_some_and(|e| e.is_intersecting);
            if now && !obs.intersecting {
                if let (Some(callback), Some(entry)) = (obs.callback.take(), entry) {
                    fired.push((*id, callback, entry));
                }
            }
            obs.intersecting = now;
        }
        fired
    };

    for (id, mut callback, entry) in fired {
        trace!("intersection: {:?} entered viewport (ratio {:.2})", entry.target, entry.ratio);
        let stop = callback(&entry);
        let mut s = lock(scene);
        if stop {
            if let Some(obs) = s.observations.remove(&id) {
                obs.target.remove_hook(obs.hook);
            }
            debug!("intersection: observation {} disconnected after entry", id);
        } else if let Some(obs) = s.observations.get_mut(&id) {
            obs.callback = Some(callback);
        }
    }
}

fn deferred_update(scene: Weak<Mutex<Scene>>) -> AttachHook {
    Arc::new(move || {
        if let Some(scene) = scene.upgrade() {
            evaluate(&scene);
        }
    })
}

impl IntersectionWatcher for EmulatedIntersection {
    fn observe(&self, target: &NodeRef, on_enter: IntersectionCallback) -> Subscription {
        let hook = target.on_attach(deferred_update(Arc::downgrade(&self.scene)));
        let id = {
            let mut scene = lock(&self.scene);
            let id = scene.next_id;
            scene.next_id += 1;
            scene.observations.insert(
                id,
                Observation {
                    target: target.clone(),
                    hook,
                    callback: Some(on_enter),
                    element: None,
                    intersecting: false,
                },
            );
            id
        };

        if target.get().is_some() {
            evaluate(&self.scene);
        } else {
            debug!("intersection: observation {} deferred until its ref is attached", id);
        }

        let scene = Arc::downgrade(&self.scene);
        let target = target.clone();
        Subscription::new(move || {
            target.remove_hook(hook);
            if let Some(scene) = scene.upgrade() {
                lock(&scene).observations.remove(&id);
            }
        })
    }
}
