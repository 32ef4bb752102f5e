pub mod bpf;
pub mod decoder;
pub mod error;
pub mod lifecycle;
pub mod logger;
pub mod registry;
pub mod ring;
pub mod shutdown;
pub mod signal_handler;
