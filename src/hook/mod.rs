pub mod installer;
pub mod memory;
