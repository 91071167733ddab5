mod handler;

pub use handler::live_updates;
