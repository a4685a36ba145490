pub mod demo;

pub use demo::{apply_demo_defaults, run as run_demo, DemoReport, Ping};
