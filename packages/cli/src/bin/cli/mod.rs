pub mod context;
pub mod sandbox;
pub mod workspace;
