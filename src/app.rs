//! Interface-loop façade.
//!
//! `ThumbnailBrowser` is everything the UI thread touches: it owns the grid
//! and the animation controller, borrows the thumbnail manager, and turns
//! worker completions and animation ticks into one ordered event queue. All
//! of its methods run on the interface loop; nothing here blocks on decoding.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::animation::AnimationController;
use crate::config::ThumbnailConfig;
use crate::layout::{Direction, GridLayout, GridView, Viewport};
use crate::models::MediaItem;
use crate::thumbnails::error::ThumbError;
use crate::thumbnails::generator::Bitmap;
use crate::thumbnails::index::Lookup;
use crate::thumbnails::key::CacheKey;
use crate::thumbnails::manager::ThumbnailManager;
use crate::thumbnails::queue::Completion;

/// Something the interface should redraw or show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// One-off message for the status bar.
    Notice(String),
    ThumbnailReady { key: CacheKey },
    ThumbnailFailed { key: CacheKey, error: ThumbError },
    FrameAdvanced { key: CacheKey, frame: usize },
}

/// Counts over the visible set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VisibleSummary {
    pub ready: usize,
    pub failed: usize,
    pub pending: usize,
    pub animated: usize,
}

pub struct ThumbnailBrowser<'m> {
    manager: &'m ThumbnailManager,
    grid: GridView,
    animations: AnimationController,
    events: VecDeque<UiEvent>,
    focus: usize,
}

impl<'m> ThumbnailBrowser<'m> {
    pub fn new(manager: &'m ThumbnailManager, config: &ThumbnailConfig, viewport: Viewport) -> Self {
        let layout = GridLayout::new(viewport, config.size_class, config.padding);
        let mut events = VecDeque::new();
        if let Some(notice) = manager.startup_notice() {
            events.push_back(UiEvent::Notice(notice.to_string()));
        }
        Self {
            manager,
            grid: GridView::new(layout),
            animations: AnimationController::new(),
            events,
            focus: 0,
        }
    }

    pub fn layout(&self) -> &GridLayout {
        self.grid.layout()
    }

    pub fn items(&self) -> &[MediaItem] {
        self.grid.items()
    }

    pub fn visible_keys(&self) -> &[CacheKey] {
        self.grid.visible_keys()
    }

    pub fn focus(&self) -> usize {
        self.focus
    }

    pub fn animations(&self) -> &AnimationController {
        &self.animations
    }

    fn refresh(&mut self, now: Instant) {
        self.grid.refresh(self.manager, &mut self.animations, now);
    }

    /// Replace the directory listing. Thumbnails of files that disappeared
    /// are evicted from memory.
    pub fn set_items(&mut self, items: Vec<MediaItem>, now: Instant) {
        let valid: HashSet<PathBuf> = items.iter().map(|i| i.path.clone()).collect();
        let evicted = self.manager.evict_stale(&valid);
        self.animations.retain(|key| valid.contains(key.path()));
        debug!(items = items.len(), evicted, "New directory listing");

        self.grid.set_items(items);
        self.focus = self.focus.min(self.grid.items().len().saturating_sub(1));
        self.refresh(now);
    }

    pub fn resize(&mut self, viewport: Viewport, now: Instant) -> bool {
        let changed = self.grid.layout_mut().set_viewport(viewport);
        if changed {
            self.keep_focus_visible();
            self.refresh(now);
        }
        changed
    }

    pub fn zoom_in(&mut self, now: Instant) -> bool {
        let changed = self.grid.layout_mut().zoom_in();
        if changed {
            self.keep_focus_visible();
            self.refresh(now);
        }
        changed
    }

    pub fn zoom_out(&mut self, now: Instant) -> bool {
        let changed = self.grid.layout_mut().zoom_out();
        if changed {
            self.keep_focus_visible();
            self.refresh(now);
        }
        changed
    }

    pub fn scroll_to(&mut self, index: usize, now: Instant) {
        let count = self.grid.items().len();
        self.grid.layout_mut().scroll_to(index, count);
        self.refresh(now);
    }

    fn keep_focus_visible(&mut self) {
        let count = self.grid.items().len();
        self.grid.layout_mut().scroll_to(self.focus, count);
    }

    /// Move the focused cell and scroll it into view.
    pub fn move_focus(&mut self, direction: Direction, step: usize, now: Instant) -> usize {
        let count = self.grid.items().len();
        self.focus = self
            .grid
            .layout()
            .move_focus(self.focus, direction, step.max(1), count);
        self.scroll_to(self.focus, now);
        self.focus
    }

    /// Vim-style key handling. Returns whether the key was consumed.
    pub fn handle_key(&mut self, key: char, now: Instant) -> bool {
        match key {
            '+' => {
                self.zoom_in(now);
                true
            }
            '-' => {
                self.zoom_out(now);
                true
            }
            ' ' => {
                self.toggle_animations(now);
                true
            }
            _ => match Direction::from_key(key) {
                Some(direction) => {
                    self.move_focus(direction, 1, now);
                    true
                }
                None => false,
            },
        }
    }

    fn handle_completion(&mut self, completion: Completion, now: Instant) {
        let Completion { key, outcome } = completion;
        match outcome {
            Ok(thumbnail) => {
                self.grid
                    .on_ready(&key, &thumbnail, &mut self.animations, now);
                self.events.push_back(UiEvent::ThumbnailReady { key });
            }
            Err(ThumbError::Cancelled) => {}
            Err(error) => {
                warn!(%key, %error, "Thumbnail failed");
                self.events
                    .push_back(UiEvent::ThumbnailFailed { key, error });
            }
        }
    }

    /// Drain finished generations and advance animations. Never blocks.
    pub fn pump(&mut self, now: Instant) -> usize {
        let before = self.events.len();
        for completion in self.manager.poll_completions() {
            self.handle_completion(completion, now);
        }
        for (key, frame) in self.animations.tick(now) {
            self.events.push_back(UiEvent::FrameAdvanced { key, frame });
        }
        self.events.len() - before
    }

    /// Sleep until a generation finishes, an animation frame is due or
    /// `timeout` passes, then pump. For headless drivers only.
    pub fn pump_wait(&mut self, timeout: Duration) -> usize {
        let before = self.events.len();
        let now = Instant::now();
        let mut wait = timeout;
        if let Some(deadline) = self.animations.next_deadline() {
            wait = wait.min(deadline.saturating_duration_since(now));
        }
        if let Some(completion) = self.manager.wait_completion(wait) {
            self.handle_completion(completion, Instant::now());
        }
        self.pump(Instant::now());
        self.events.len() - before
    }

    pub fn next_event(&mut self) -> Option<UiEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<UiEvent> {
        self.events.drain(..).collect()
    }

    /// When the loop must wake up next even without completions.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.animations.next_deadline()
    }

    /// Bitmap to draw for `key` right now.
    pub fn frame_for(&self, key: &CacheKey) -> Bitmap {
        self.grid.frame_for(key, self.manager, &self.animations)
    }

    /// Purge every cached thumbnail and request the visible set again.
    pub fn clear_cache(&mut self, now: Instant) -> std::io::Result<()> {
        self.manager.clear()?;
        self.animations.clear();
        self.events
            .push_back(UiEvent::Notice("Thumbnail cache cleared".to_string()));
        self.refresh(now);
        Ok(())
    }

    /// Regenerate the thumbnails of one file, e.g. after it was edited.
    pub fn reload(&mut self, path: &Path, now: Instant) -> std::io::Result<()> {
        self.manager.invalidate_path(path);
        self.animations.retain(|key| key.path() != path);

        let mut items = self.grid.items().to_vec();
        if let Some(item) = items.iter_mut().find(|i| i.path == path) {
            *item = MediaItem::from_path(path)?;
        }
        self.grid.set_items(items);
        self.refresh(now);
        Ok(())
    }

    pub fn toggle_animations(&mut self, now: Instant) {
        self.animations.toggle_all(now);
    }

    pub fn summary(&self) -> VisibleSummary {
        let mut summary = VisibleSummary::default();
        for key in self.grid.visible_keys() {
            match self.manager.lookup(key) {
                Lookup::Ready(thumbnail) => {
                    summary.ready += 1;
                    if thumbnail.is_animated() {
                        summary.animated += 1;
                    }
                }
                Lookup::Failed(_) => summary.failed += 1,
                Lookup::Pending | Lookup::Miss => summary.pending += 1,
            }
        }
        summary
    }

    /// Every visible thumbnail is ready or failed and no worker is still
    /// holding an undelivered result.
    pub fn is_settled(&self) -> bool {
        self.summary().pending == 0 && !self.manager.is_busy()
    }

    /// Log what is on screen.
    pub fn log_summary(&self) {
        let summary = self.summary();
        info!(
            items = self.grid.items().len(),
            visible = self.grid.visible_keys().len(),
            ready = summary.ready,
            failed = summary.failed,
            pending = summary.pending,
            animated = summary.animated,
            memory_bytes = self.manager.memory_usage(),
            disk = self.manager.disk_enabled(),
            "Grid summary"
        );
    }
}
