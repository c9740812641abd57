//! System-level helpers: mounting, process launching and supervision, and
//! signal handling.

pub mod launch;
pub mod mount;
pub mod process;
pub mod signals;
