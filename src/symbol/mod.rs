pub mod finder;
pub mod memmap;
pub mod signature;
