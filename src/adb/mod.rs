pub mod directory;
pub mod env;
pub mod input;
pub mod parse;
pub mod runner;
pub mod screenshot;
pub mod scrcpy;
