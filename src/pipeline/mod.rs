//! The frame pipeline: one producer loop publishing into a shared latest-value cell

pub mod capture_loop;
pub mod cell;

pub use capture_loop::{CaptureLoop, CaptureState, CaptureStatus, LoopExit};
pub use cell::{FrameCell, FramePacket};
