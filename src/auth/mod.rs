pub mod bearer;
pub mod permission;
