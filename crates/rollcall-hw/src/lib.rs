//! rollcall-hw — Camera capture for the attendance pipeline.
//!
//! Provides exclusive V4L2 camera access, a colour [`Frame`] type and the
//! pixel operations the pipeline needs (grayscale, equalisation, mirroring,
//! annotation, JPEG encoding).

pub mod camera;
pub mod frame;
pub mod lock;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource};
pub use frame::{Frame, FrameError};
pub use lock::{DeviceLock, LockError};
