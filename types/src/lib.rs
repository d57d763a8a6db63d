pub mod config;
pub mod consts;
pub mod containers;
pub mod fork_choice;
pub mod primitives;
