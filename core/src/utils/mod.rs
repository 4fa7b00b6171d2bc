pub mod gate;

pub use gate::Gate;
