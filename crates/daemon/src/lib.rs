pub mod server;
mod session;
mod spawn;

pub use server::{Daemon, run};
