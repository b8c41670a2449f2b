mod detect;
mod engine;
mod execute;
mod keyring;

pub use detect::detect;
pub use engine::NativeEngine;
pub use execute::execute;
pub use keyring::{KeyInfo, Keyring};
