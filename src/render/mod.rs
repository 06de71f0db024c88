//! Frame rendering: detection overlays and JPEG encoding

pub mod annotate;
pub mod encode;

pub use annotate::{annotate, draw_box, draw_label, BOX_COLOR};
pub use encode::encode_jpeg;
