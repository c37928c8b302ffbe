// Snapshot pipeline — still images from the latest frame, encoded to disk.

pub mod encode;
pub mod image;

pub use encode::{encode_to_file, save_to_dir, snapshot_filename};
pub use image::SnapshotImage;
