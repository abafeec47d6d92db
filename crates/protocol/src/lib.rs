pub mod command;
pub mod cookie;
pub mod error;
pub mod frame;
pub mod wire;

pub use command::{CommandSpec, ExitStatus, Identity, IoMode, PtyHints};
pub use cookie::Cookie;
pub use error::LaunchError;
pub use frame::Frame;
pub use wire::{MAX_FRAME, WireError, read_frame, read_frame_or_eof, write_frame};
