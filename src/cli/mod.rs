pub mod app;
pub mod workspace;
