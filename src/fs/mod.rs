pub mod fat16;

pub use fat16::BootGeometry;
