mod state;

pub use state::{StateLayer, StateStats};
