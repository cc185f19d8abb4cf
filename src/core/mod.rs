pub mod browser;
pub mod config;
pub mod session;

pub use browser::{frames_from_frame_tree, BrowserTrait, LiveFrame};
pub use config::Config;
pub use session::{CdpSession, NetworkEvent, RemoteObject, SessionHandle, Subscription};
