pub mod ascs;
pub mod audio;
pub mod gatt;
pub mod iso;
pub mod utils;
