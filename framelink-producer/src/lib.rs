//! # framelink-producer: Paced Frame Producer
//!
//! Streams raw image frames to one or more receivers at a fixed frame
//! rate. Each frame is sent as an IMAGE envelope, followed at its
//! deadline by a DISPLAY_NOW envelope naming it. Receivers ACK every
//! image; unacknowledged frames bound how far the producer runs ahead.
//!
//! Frames come from raw files on disk or from generated gradients.

pub mod config;
pub mod frames;
pub mod service;
