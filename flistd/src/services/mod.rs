//! Service modules for flistd.
//!
//! - The registry task owns all container state
//! - The container service implements run/stop/rm/ps on top of it
//! - Workers decode one request per connection and call the container service

pub mod container;
pub mod registry;
pub mod worker;
