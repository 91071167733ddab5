mod handler;
pub mod model;

pub use handler::{
    add_member,
    cancel_group,
    create_group,
    get_detail,
    join_group,
    leave_group,
    list_joined,
    list_open,
    list_owned,
    remove_member,
    report_group,
};
