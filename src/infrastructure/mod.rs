pub mod bluetooth;
pub mod capture;
pub mod logging;
