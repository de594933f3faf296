//! Uniform thumbnail grid.
//!
//! Cells are square boxes of the current size class plus padding. The layout
//! works out how many columns fit the viewport, which items are on screen and
//! which lie in the prefetch margin; `GridView` turns that into prioritized
//! thumbnail requests and animation play/pause.

use std::collections::HashSet;
use std::ops::Range;
use std::time::Instant;

use tracing::debug;

use crate::animation::AnimationController;
use crate::models::MediaItem;
use crate::thumbnails::generator::{placeholder, Bitmap, Thumbnail};
use crate::thumbnails::key::{CacheKey, SizeClass};
use crate::thumbnails::manager::{RequestStatus, ThumbnailSource};
use crate::thumbnails::queue::Priority;

/// Horizontal space reserved for scrollbar and borders.
const WINDOW_MARGIN: u32 = 12;

/// Rows above and below the viewport requested ahead of time.
const PREFETCH_ROWS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Focus movement inside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Down,
    Up,
    Right,
    /// First element in the row.
    RowStart,
    /// Last element in the column.
    ColumnEnd,
    /// First element in the column.
    ColumnStart,
    /// Last element in the row.
    RowEnd,
}

impl Direction {
    /// Map vim-style keys (`hjkl`, `HJKL`).
    pub fn from_key(key: char) -> Option<Self> {
        match key {
            'h' => Some(Self::Left),
            'j' => Some(Self::Down),
            'k' => Some(Self::Up),
            'l' => Some(Self::Right),
            'H' => Some(Self::RowStart),
            'J' => Some(Self::ColumnEnd),
            'K' => Some(Self::ColumnStart),
            'L' => Some(Self::RowEnd),
            _ => None,
        }
    }
}

/// Geometry of the grid for one viewport and zoom level.
#[derive(Debug, Clone)]
pub struct GridLayout {
    viewport: Viewport,
    size_class: SizeClass,
    padding: u32,
    /// First row shown at the top of the viewport.
    scroll_row: usize,
}

impl GridLayout {
    pub fn new(viewport: Viewport, size_class: SizeClass, padding: u32) -> Self {
        Self {
            viewport,
            size_class,
            padding,
            scroll_row: 0,
        }
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn size_class(&self) -> SizeClass {
        self.size_class
    }

    pub fn scroll_row(&self) -> usize {
        self.scroll_row
    }

    /// Edge length of one cell including padding.
    pub fn cell_extent(&self) -> u32 {
        self.size_class.pixels() + 2 * self.padding
    }

    fn usable_width(&self) -> u32 {
        self.viewport.width.saturating_sub(WINDOW_MARGIN)
    }

    /// Number of columns that fit, at least one.
    pub fn columns(&self) -> usize {
        ((self.usable_width() / self.cell_extent()) as usize).max(1)
    }

    /// Leftover width spread evenly between columns.
    pub fn column_spacing(&self) -> u32 {
        let free_space = self.usable_width() % self.cell_extent();
        free_space / self.columns() as u32
    }

    /// Rows that are at least partly on screen.
    pub fn visible_rows(&self) -> usize {
        (self.viewport.height.div_ceil(self.cell_extent()) as usize).max(1)
    }

    pub fn total_rows(&self, count: usize) -> usize {
        count.div_ceil(self.columns())
    }

    fn max_scroll_row(&self, count: usize) -> usize {
        self.total_rows(count).saturating_sub(self.visible_rows())
    }

    fn rows_to_items(&self, rows: Range<usize>, count: usize) -> Range<usize> {
        let columns = self.columns();
        let start = (rows.start * columns).min(count);
        let end = (rows.end * columns).min(count);
        start..end
    }

    /// Item indices currently on screen.
    pub fn visible_range(&self, count: usize) -> Range<usize> {
        let first = self.scroll_row.min(self.max_scroll_row(count));
        self.rows_to_items(first..first + self.visible_rows(), count)
    }

    /// Visible items plus the prefetch margin on both sides.
    pub fn prefetch_range(&self, count: usize) -> Range<usize> {
        let first = self.scroll_row.min(self.max_scroll_row(count));
        let start = first.saturating_sub(PREFETCH_ROWS);
        let end = first + self.visible_rows() + PREFETCH_ROWS;
        self.rows_to_items(start..end, count)
    }

    /// Returns whether anything changed.
    pub fn set_viewport(&mut self, viewport: Viewport) -> bool {
        std::mem::replace(&mut self.viewport, viewport) != viewport
    }

    pub fn set_size_class(&mut self, size_class: SizeClass) -> bool {
        std::mem::replace(&mut self.size_class, size_class) != size_class
    }

    /// Step to the next larger zoom level. False at the largest.
    pub fn zoom_in(&mut self) -> bool {
        match self.size_class.larger() {
            Some(size) => self.set_size_class(size),
            None => false,
        }
    }

    /// Step to the next smaller zoom level. False at the smallest.
    pub fn zoom_out(&mut self) -> bool {
        match self.size_class.smaller() {
            Some(size) => self.set_size_class(size),
            None => false,
        }
    }

    /// Scroll so the row holding `index` is centred, within the content bounds.
    pub fn scroll_to(&mut self, index: usize, count: usize) {
        let row = index / self.columns();
        let centred = row.saturating_sub(self.visible_rows() / 2);
        self.scroll_row = centred.min(self.max_scroll_row(count));
    }

    /// Move focus from `pos` by `step` in `direction`, clamped to the grid.
    pub fn move_focus(&self, pos: usize, direction: Direction, step: usize, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        let columns = self.columns();
        let last = count - 1;
        let pos = pos.min(last);
        let row = pos / columns;
        let column = pos % columns;
        let column_end = {
            let candidate = (last / columns) * columns + column;
            if candidate > last {
                candidate - columns
            } else {
                candidate
            }
        };

        match direction {
            Direction::Left => pos.saturating_sub(step),
            Direction::Right => pos.saturating_add(step).min(last),
            Direction::Up => pos
                .checked_sub(columns.saturating_mul(step))
                .unwrap_or(column),
            Direction::Down => pos
                .saturating_add(columns.saturating_mul(step))
                .min(column_end),
            Direction::RowStart => row * columns,
            Direction::ColumnEnd => column_end,
            Direction::ColumnStart => column,
            Direction::RowEnd => ((row + 1) * columns - 1).min(last),
        }
    }
}

/// What changed in the visible set after a refresh.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VisibleDelta {
    pub shown: Vec<CacheKey>,
    pub hidden: Vec<CacheKey>,
    /// Keys handed to the manager that were not ready yet.
    pub pending: usize,
}

/// Grid over the current directory listing.
///
/// Holds no reference to the thumbnail manager; every operation that needs it
/// takes a `ThumbnailSource` capability for the duration of the call.
pub struct GridView {
    layout: GridLayout,
    items: Vec<MediaItem>,
    visible: Vec<CacheKey>,
    /// Visible and prefetched keys the manager was last asked for.
    wanted: HashSet<CacheKey>,
}

impl GridView {
    pub fn new(layout: GridLayout) -> Self {
        Self {
            layout,
            items: Vec::new(),
            visible: Vec::new(),
            wanted: HashSet::new(),
        }
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn layout_mut(&mut self) -> &mut GridLayout {
        &mut self.layout
    }

    pub fn items(&self) -> &[MediaItem] {
        &self.items
    }

    pub fn set_items(&mut self, items: Vec<MediaItem>) {
        self.items = items;
    }

    /// Visible keys in display order.
    pub fn visible_keys(&self) -> &[CacheKey] {
        &self.visible
    }

    pub fn is_visible(&self, key: &CacheKey) -> bool {
        self.visible.contains(key)
    }

    fn keys_in(&self, range: Range<usize>) -> Vec<CacheKey> {
        let size_class = self.layout.size_class();
        self.items[range]
            .iter()
            .map(|item| item.key(size_class))
            .collect()
    }

    /// Recompute the visible set, request what is missing and play/pause
    /// animations that entered or left the viewport. Animations for other
    /// zoom levels, or for thumbnails the cache no longer holds, are dropped.
    pub fn refresh(
        &mut self,
        source: &dyn ThumbnailSource,
        animations: &mut AnimationController,
        now: Instant,
    ) -> VisibleDelta {
        let count = self.items.len();
        let visible = self.keys_in(self.layout.visible_range(count));
        let visible_set: HashSet<CacheKey> = visible.iter().cloned().collect();
        let prefetch: Vec<CacheKey> = self
            .keys_in(self.layout.prefetch_range(count))
            .into_iter()
            .filter(|k| !visible_set.contains(k))
            .collect();

        let mut delta = VisibleDelta::default();

        for key in &visible {
            match source.request(key, Priority::VISIBLE) {
                RequestStatus::Ready(thumbnail) => {
                    if animations.register(key.clone(), &thumbnail) {
                        animations.play(key, now);
                    }
                }
                RequestStatus::Pending => delta.pending += 1,
                RequestStatus::Failed(_) => {}
            }
            if !self.visible.contains(key) {
                delta.shown.push(key.clone());
            }
        }
        for key in &prefetch {
            if let RequestStatus::Pending = source.request(key, Priority::PREFETCH) {
                delta.pending += 1;
            }
        }

        for key in &self.visible {
            if !visible_set.contains(key) {
                animations.pause(key);
                delta.hidden.push(key.clone());
            }
        }

        let wanted: HashSet<CacheKey> = visible.iter().chain(prefetch.iter()).cloned().collect();
        for key in self.wanted.difference(&wanted) {
            source.deprioritize(key);
        }

        // Paused animations survive scrolling only while their thumbnail is
        // still held; other zoom levels are never drawn from this controller.
        let size_class = self.layout.size_class();
        animations.retain(|key| {
            key.size_class() == size_class && (visible_set.contains(key) || source.is_ready(key))
        });

        debug!(
            visible = visible.len(),
            prefetch = prefetch.len(),
            shown = delta.shown.len(),
            hidden = delta.hidden.len(),
            pending = delta.pending,
            "Refreshed grid"
        );

        self.visible = visible;
        self.wanted = wanted;
        delta
    }

    /// A generation finished; start its animation if it is on screen.
    pub fn on_ready(
        &self,
        key: &CacheKey,
        thumbnail: &Thumbnail,
        animations: &mut AnimationController,
        now: Instant,
    ) -> bool {
        let on_screen = self.is_visible(key);
        if on_screen && animations.register(key.clone(), thumbnail) {
            animations.play(key, now);
        }
        on_screen
    }

    /// Bitmap to draw for `key`: the current animation frame, the ready
    /// thumbnail (possibly at another size while this one generates), or a
    /// placeholder.
    pub fn frame_for(
        &self,
        key: &CacheKey,
        source: &dyn ThumbnailSource,
        animations: &AnimationController,
    ) -> Bitmap {
        if let Some(frame) = animations.current_frame(key) {
            return frame.clone();
        }
        source
            .best_available(key)
            .map(|thumbnail| thumbnail.bitmap().clone())
            .unwrap_or_else(|| placeholder(key.size_class()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thumbnails::generator::Frame;
    use crate::thumbnails::index::Lookup;
    use crate::thumbnails::key::{Fingerprint, ZOOM_LEVELS};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    fn layout(width: u32, height: u32) -> GridLayout {
        GridLayout::new(Viewport::new(width, height), SizeClass::NORMAL, 9)
    }

    #[test]
    fn test_columns_and_spacing() {
        // (812 - 12) / (128 + 18) = 5 columns, 70px left over -> 14px spacing
        let grid = layout(812, 600);
        assert_eq!(grid.cell_extent(), 146);
        assert_eq!(grid.columns(), 5);
        assert_eq!(grid.column_spacing(), 14);
    }

    #[test]
    fn test_narrow_viewport_keeps_one_column() {
        let grid = layout(50, 600);
        assert_eq!(grid.columns(), 1);
        assert_eq!(layout(0, 0).columns(), 1);
    }

    #[test]
    fn test_zoom_changes_columns() {
        let mut grid = layout(812, 600);
        assert!(grid.zoom_in());
        assert_eq!(grid.size_class(), SizeClass::LARGE);
        assert_eq!(grid.columns(), 2);
        assert!(grid.zoom_in());
        assert!(!grid.zoom_in());
        assert_eq!(grid.size_class(), SizeClass::HUGE);

        for _ in 0..3 {
            assert!(grid.zoom_out());
        }
        assert!(!grid.zoom_out());
        assert_eq!(grid.size_class(), SizeClass::SMALL);
    }

    #[test]
    fn test_visible_and_prefetch_ranges() {
        // 5 columns, 300 / 146 -> 3 rows visible
        let mut grid = layout(812, 300);
        assert_eq!(grid.visible_rows(), 3);
        assert_eq!(grid.visible_range(100), 0..15);
        assert_eq!(grid.prefetch_range(100), 0..20);

        grid.scroll_to(50, 100);
        assert_eq!(grid.scroll_row(), 9);
        assert_eq!(grid.visible_range(100), 45..60);
        assert_eq!(grid.prefetch_range(100), 40..65);

        // Short listings never scroll past their end.
        grid.scroll_to(99, 12);
        assert_eq!(grid.visible_range(12), 0..12);
    }

    #[test]
    fn test_move_focus() {
        // 5 columns, 12 items:
        //  0  1  2  3  4
        //  5  6  7  8  9
        // 10 11
        let grid = layout(812, 600);
        let n = 12;
        assert_eq!(grid.move_focus(6, Direction::Left, 1, n), 5);
        assert_eq!(grid.move_focus(0, Direction::Left, 3, n), 0);
        assert_eq!(grid.move_focus(10, Direction::Right, 5, n), 11);
        assert_eq!(grid.move_focus(7, Direction::Up, 1, n), 2);
        assert_eq!(grid.move_focus(7, Direction::Up, 4, n), 2);
        assert_eq!(grid.move_focus(1, Direction::Down, 1, n), 6);
        assert_eq!(grid.move_focus(1, Direction::Down, 9, n), 11);
        assert_eq!(grid.move_focus(3, Direction::Down, 9, n), 8);
        assert_eq!(grid.move_focus(8, Direction::RowStart, 1, n), 5);
        assert_eq!(grid.move_focus(8, Direction::RowEnd, 1, n), 9);
        assert_eq!(grid.move_focus(10, Direction::RowEnd, 1, n), 11);
        assert_eq!(grid.move_focus(0, Direction::ColumnEnd, 1, n), 10);
        assert_eq!(grid.move_focus(4, Direction::ColumnEnd, 1, n), 9);
        assert_eq!(grid.move_focus(11, Direction::ColumnStart, 1, n), 1);
        assert_eq!(grid.move_focus(3, Direction::Left, 1, 0), 0);
    }

    #[test]
    fn test_direction_keys() {
        assert_eq!(Direction::from_key('j'), Some(Direction::Down));
        assert_eq!(Direction::from_key('L'), Some(Direction::RowEnd));
        assert_eq!(Direction::from_key('x'), None);
    }

    /// Records requests and answers from a fixed table.
    #[derive(Default)]
    struct FakeSource {
        ready: HashMap<CacheKey, Thumbnail>,
        requests: Mutex<Vec<(CacheKey, Priority)>>,
        dropped: Mutex<Vec<CacheKey>>,
    }

    impl ThumbnailSource for FakeSource {
        fn request(&self, key: &CacheKey, priority: Priority) -> RequestStatus {
            self.requests.lock().push((key.clone(), priority));
            match self.ready.get(key) {
                Some(t) => RequestStatus::Ready(t.clone()),
                None => RequestStatus::Pending,
            }
        }

        fn lookup(&self, key: &CacheKey) -> Lookup {
            match self.ready.get(key) {
                Some(t) => Lookup::Ready(t.clone()),
                None => Lookup::Miss,
            }
        }

        fn deprioritize(&self, key: &CacheKey) -> bool {
            self.dropped.lock().push(key.clone());
            true
        }

        fn best_available(&self, key: &CacheKey) -> Option<Thumbnail> {
            self.ready.get(key).cloned()
        }

        fn is_ready(&self, key: &CacheKey) -> bool {
            self.ready.contains_key(key)
        }
    }

    fn items(n: usize) -> Vec<MediaItem> {
        (0..n)
            .map(|i| {
                MediaItem::new(
                    PathBuf::from(format!("/photos/{i:03}.png")),
                    Fingerprint::new(1, i as i64, 0),
                )
            })
            .collect()
    }

    fn gif() -> Thumbnail {
        let frames = (0..2)
            .map(|i| Frame {
                bitmap: Bitmap::from_raw(1, 1, vec![i; 4]).unwrap(),
                duration: Duration::from_millis(50),
            })
            .collect();
        Thumbnail::from_frames(frames).unwrap()
    }

    #[test]
    fn test_refresh_requests_visible_before_prefetch() {
        let mut view = GridView::new(layout(812, 300));
        view.set_items(items(40));
        let source = FakeSource::default();
        let mut animations = AnimationController::new();

        let delta = view.refresh(&source, &mut animations, Instant::now());
        assert_eq!(delta.shown.len(), 15);
        assert_eq!(delta.pending, 20);

        let requests = source.requests.lock();
        assert!(requests[..15].iter().all(|(_, p)| *p == Priority::VISIBLE));
        assert!(requests[15..].iter().all(|(_, p)| *p == Priority::PREFETCH));
    }

    #[test]
    fn test_scrolling_drops_and_pauses_offscreen_keys() {
        let all = items(40);
        let first_key = all[0].key(SizeClass::NORMAL);
        let mut source = FakeSource::default();
        source.ready.insert(first_key.clone(), gif());

        let mut view = GridView::new(layout(812, 300));
        view.set_items(all);
        let mut animations = AnimationController::new();
        let now = Instant::now();

        view.refresh(&source, &mut animations, now);
        assert_eq!(
            animations.get(&first_key).unwrap().state(),
            crate::animation::PlaybackState::Playing
        );

        view.layout_mut().scroll_to(35, 40);
        let delta = view.refresh(&source, &mut animations, now);
        assert!(delta.hidden.contains(&first_key));
        assert_eq!(
            animations.get(&first_key).unwrap().state(),
            crate::animation::PlaybackState::Paused
        );
        assert!(source.dropped.lock().contains(&first_key));
    }

    #[test]
    fn test_zoom_requests_new_size_class() {
        let mut view = GridView::new(layout(812, 300));
        view.set_items(items(4));
        let source = FakeSource::default();
        let mut animations = AnimationController::new();
        view.refresh(&source, &mut animations, Instant::now());

        assert!(view.layout_mut().zoom_in());
        view.refresh(&source, &mut animations, Instant::now());

        let requests = source.requests.lock();
        assert!(requests
            .iter()
            .any(|(k, _)| k.size_class() == SizeClass::LARGE));
        assert!(view
            .visible_keys()
            .iter()
            .all(|k| k.size_class() == SizeClass::LARGE));
        // The old size class is dropped from the queue, not from the cache.
        assert_eq!(source.dropped.lock().len(), 4);
    }

    #[test]
    fn test_zoom_does_not_accumulate_animations() {
        let all = items(4);
        let mut source = FakeSource::default();
        for item in &all {
            for size_class in ZOOM_LEVELS {
                source.ready.insert(item.key(size_class), gif());
            }
        }

        let mut view = GridView::new(layout(812, 300));
        view.set_items(all);
        let mut animations = AnimationController::new();
        let now = Instant::now();
        view.refresh(&source, &mut animations, now);
        assert_eq!(animations.len(), 4);

        for _ in 0..3 {
            assert!(view.layout_mut().zoom_in());
            view.refresh(&source, &mut animations, now);
            assert_eq!(animations.len(), view.visible_keys().len());
            assert!(view.visible_keys().iter().all(|k| animations.contains(k)));

            assert!(view.layout_mut().zoom_out());
            view.refresh(&source, &mut animations, now);
            assert_eq!(animations.len(), 4);
            assert!(view.visible_keys().iter().all(|k| animations.contains(k)));
        }
    }

    #[test]
    fn test_evicted_offscreen_animation_is_dropped() {
        let all = items(40);
        let first_key = all[0].key(SizeClass::NORMAL);
        let mut source = FakeSource::default();
        source.ready.insert(first_key.clone(), gif());

        let mut view = GridView::new(layout(812, 300));
        view.set_items(all);
        let mut animations = AnimationController::new();
        let now = Instant::now();
        view.refresh(&source, &mut animations, now);

        view.layout_mut().scroll_to(35, 40);
        view.refresh(&source, &mut animations, now);
        assert!(animations.contains(&first_key));

        source.ready.remove(&first_key);
        view.refresh(&source, &mut animations, now);
        assert!(!animations.contains(&first_key));
        assert!(animations.is_empty());
    }

    #[test]
    fn test_frame_for_falls_back_to_placeholder() {
        let view = GridView::new(layout(812, 300));
        let source = FakeSource::default();
        let animations = AnimationController::new();
        let key = items(1)[0].key(SizeClass::SMALL);

        let frame = view.frame_for(&key, &source, &animations);
        assert_eq!(frame, placeholder(SizeClass::SMALL));
    }
}
