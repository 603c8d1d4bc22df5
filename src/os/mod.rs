// src/os/mod.rs

pub mod event_loop;
pub mod signals;
