//! # framelink-receiver: Frame Receiver
//!
//! Accepts a producer session, ACKs every IMAGE as soon as it arrives
//! and queues it for display. A separate display task, paced by its own
//! timer, presents frames when DISPLAY_NOW asks for them by piping raw
//! bytes into an external viewer (`ffplay` by default).
//!
//! Received payloads can be checked against the raw files the producer
//! is sending.

pub mod config;
pub mod service;
pub mod verify;
