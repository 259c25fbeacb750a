pub mod console;
pub mod tunnel;
