mod forward;
mod server;

pub mod controller;

pub use controller::ProxyController;
