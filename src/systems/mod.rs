pub mod sync;
mod winding;

pub use winding::{WinderStatus, WindingController, WindingState};
