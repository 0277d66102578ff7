pub mod config;
pub mod health;
pub mod modules;
pub mod scheduler;
pub mod vhosts;
