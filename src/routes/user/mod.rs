mod handler;

pub use handler::{check_token, login};
