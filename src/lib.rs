pub mod challenge;
pub mod cn;
pub mod container;
pub mod error;
pub mod manager;
pub mod netlink;
pub mod user;
pub mod vlan;
pub mod xmlrpc;

pub use challenge::Challenge;
pub use error::{Error, Result};
pub use manager::Manager;
pub use user::User;
