mod core;
mod module;

pub use self::core::Connection;
