//! kotoba ABI crate: stable contracts shared by the engine and its backends.

pub mod backend;
pub mod batch;
pub mod error;
pub mod sampling;
pub mod token;

pub use backend::*;
pub use batch::*;
pub use error::*;
pub use sampling::*;
pub use token::*;
