//! Inter-process communication: bounded message queues and Unix-style
//! pipes, both backed entirely by static storage.

pub mod messages;
pub mod pipes;
pub mod waitqueue;
