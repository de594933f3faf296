pub mod grid;

pub use grid::{Direction, GridLayout, GridView, Viewport, VisibleDelta};
