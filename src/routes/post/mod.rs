mod handler;
pub mod model;

pub use handler::{create_post, delete_post, report_post};
