//! Wire plumbing shared by drivers
pub mod serial;
