pub mod frame;
pub mod messages;
