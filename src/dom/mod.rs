pub mod backend_map;
pub mod element;
pub mod frames;
pub mod processor;
pub mod state;
pub mod tree;

pub use backend_map::{build_backend_maps, BackendIdMaps};
pub use element::AccessibilityNode;
pub use frames::{discover_frames, DiscoveryContext, FrameInfo, FrameMap};
pub use processor::DomProcessor;
pub use state::A11yState;
pub use tree::{build_frame_tree, RawAxNode};
