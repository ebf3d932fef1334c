//! facefinder-hw: webcam capture for the target face.
//!
//! Opens a V4L2 device, skips warmup and dark frames, and hands back a
//! grayscale snapshot that can be encoded to PNG and fed to the matcher.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
