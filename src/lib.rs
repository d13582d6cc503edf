pub mod bluetooth;
pub mod cli;
pub mod config;
pub mod constants;
pub mod controller;
pub mod manager;
