pub mod extract;
pub mod parser;
pub mod suggest;
