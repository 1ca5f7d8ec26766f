pub mod models;
pub mod night_window;
pub mod session;
pub mod settings;
