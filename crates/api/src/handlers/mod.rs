pub mod generation;
pub mod providers;
pub mod system;
