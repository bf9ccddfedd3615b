//! Resource model shared by the store, the IAM manager and the controllers.

pub mod condition;
pub mod config;
pub mod irsa;
pub mod meta;
pub mod naming;
pub mod policy;
pub mod role;
pub mod service_account;
pub mod statement;
pub mod validate;
