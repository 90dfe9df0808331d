pub mod auth;

pub use auth::{Actor, USER_ID_HEADER};
