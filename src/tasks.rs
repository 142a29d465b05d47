pub mod console;
pub mod midi;
pub mod radio;
