//! ptyrelay: run an interactive shell in a pseudo-terminal and relay it
//! over the process's own standard streams.

pub mod cli;
