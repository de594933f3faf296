//! Playback of multi-frame thumbnails.
//!
//! Each animated entry is a small state machine
//! (`Stopped -> Playing <-> Paused -> Stopped`) whose timer is the current
//! frame's own duration. The controller is driven from the interface loop via
//! `tick(now)`; it never runs on worker threads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::thumbnails::generator::{Bitmap, Frame, Thumbnail};
use crate::thumbnails::key::CacheKey;

/// Shortest frame duration honoured; avoids spinning on 0 ms frames.
const MIN_FRAME_DURATION: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

/// Playback position of one animated thumbnail.
#[derive(Debug, Clone)]
pub struct AnimationState {
    frames: Arc<[Frame]>,
    current: usize,
    state: PlaybackState,
    /// When the current frame should be replaced. Set only while playing.
    next_due: Option<Instant>,
}

impl AnimationState {
    fn new(frames: Arc<[Frame]>) -> Self {
        Self {
            frames,
            current: 0,
            state: PlaybackState::Stopped,
            next_due: None,
        }
    }

    fn frame_duration(&self) -> Duration {
        self.frames[self.current].duration.max(MIN_FRAME_DURATION)
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn start(&mut self, now: Instant) {
        self.state = PlaybackState::Playing;
        self.next_due = Some(now + self.frame_duration());
    }

    /// Advance past every frame whose time has run out. Returns whether the
    /// visible frame changed.
    fn advance(&mut self, now: Instant) -> bool {
        let mut advanced = false;
        // A long stall skips at most one loop instead of replaying it.
        for _ in 0..self.frames.len() {
            let Some(due) = self.next_due else {
                break;
            };
            if due > now {
                break;
            }
            self.current = (self.current + 1) % self.frames.len();
            self.next_due = Some(due + self.frame_duration());
            advanced = true;
        }
        if let Some(due) = self.next_due {
            if due <= now {
                self.next_due = Some(now + self.frame_duration());
            }
        }
        advanced
    }
}

/// Owns the playback state of every animated thumbnail.
#[derive(Default)]
pub struct AnimationController {
    entries: HashMap<CacheKey, AnimationState>,
}

impl AnimationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `thumbnail` if it has more than one frame. New entries start stopped.
    pub fn register(&mut self, key: CacheKey, thumbnail: &Thumbnail) -> bool {
        if !thumbnail.is_animated() {
            return false;
        }
        self.entries
            .entry(key)
            .or_insert_with(|| AnimationState::new(Arc::clone(thumbnail.frames())));
        true
    }

    pub fn remove(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Keep only entries for which `keep` returns true.
    pub fn retain(&mut self, mut keep: impl FnMut(&CacheKey) -> bool) {
        self.entries.retain(|key, _| keep(key));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &CacheKey) -> Option<&AnimationState> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stopped/paused -> Playing. Paused entries resume from their frame.
    pub fn play(&mut self, key: &CacheKey, now: Instant) -> bool {
        match self.entries.get_mut(key) {
            Some(anim) if anim.state != PlaybackState::Playing => {
                anim.start(now);
                trace!(%key, frame = anim.current, "Animation playing");
                true
            }
            _ => false,
        }
    }

    /// Playing -> Paused, freezing on the current frame.
    pub fn pause(&mut self, key: &CacheKey) -> bool {
        match self.entries.get_mut(key) {
            Some(anim) if anim.state == PlaybackState::Playing => {
                anim.state = PlaybackState::Paused;
                anim.next_due = None;
                trace!(%key, frame = anim.current, "Animation paused");
                true
            }
            _ => false,
        }
    }

    /// Back to the first frame, not playing.
    pub fn stop(&mut self, key: &CacheKey) -> bool {
        match self.entries.get_mut(key) {
            Some(anim) if anim.state != PlaybackState::Stopped => {
                anim.state = PlaybackState::Stopped;
                anim.current = 0;
                anim.next_due = None;
                true
            }
            _ => false,
        }
    }

    /// Play or pause depending on grid visibility.
    pub fn set_visible(&mut self, key: &CacheKey, visible: bool, now: Instant) -> bool {
        if visible {
            self.play(key, now)
        } else {
            self.pause(key)
        }
    }

    /// Toggle every entry between playing and paused.
    pub fn toggle_all(&mut self, now: Instant) {
        for anim in self.entries.values_mut() {
            if anim.state == PlaybackState::Playing {
                anim.state = PlaybackState::Paused;
                anim.next_due = None;
            } else {
                anim.start(now);
            }
        }
    }

    /// Advance every playing entry whose frame time has elapsed. Returns the
    /// keys whose displayed frame changed.
    pub fn tick(&mut self, now: Instant) -> Vec<(CacheKey, usize)> {
        self.entries
            .iter_mut()
            .filter(|(_, anim)| anim.state == PlaybackState::Playing)
            .filter_map(|(key, anim)| anim.advance(now).then(|| (key.clone(), anim.current)))
            .collect()
    }

    /// Earliest moment any playing entry needs a tick.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|a| a.next_due).min()
    }

    /// Bitmap to render for `key` right now.
    pub fn current_frame(&self, key: &CacheKey) -> Option<&Bitmap> {
        self.entries
            .get(key)
            .map(|anim| &anim.frames[anim.current].bitmap)
    }
}
