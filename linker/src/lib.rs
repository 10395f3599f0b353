// helink — HE program linker
//
// Library root. Modules are listed leaves first.

pub mod config;
pub mod discover;
pub mod elide;
pub mod error;
pub mod id;
pub mod isa;
pub mod lexer;
pub mod loader;
pub mod mem_map;
pub mod memory;
pub mod program;
pub mod session;

pub use error::{LinkError, Result};
