pub mod fstat;
pub mod slice;
pub mod unary;
