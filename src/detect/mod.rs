mod backend;
mod backends;
mod decode;
mod result;

pub use backend::{DetectorBackend, RawOutput};
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use decode::{decode_output, iou, nms, Letterbox, DEFAULT_IOU_THRESHOLD, LETTERBOX_FILL};
pub use result::Detection;
